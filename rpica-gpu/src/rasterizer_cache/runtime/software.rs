// SPDX-FileCopyrightText: 2025 rpica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software texture runtime.
//!
//! A texel-accurate CPU implementation of [`TextureRuntime`] over plain byte
//! buffers. It backs the test suite and doubles as a headless backend. All
//! buffers are row-major with rows bottom-up, matching the coordinate
//! convention of the cache's rectangles.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use rpica_common::Rectangle;

use super::super::pixel_format::{PixelFormat, SurfaceType, TextureType};
use super::super::surface_params::SurfaceParams;
use super::super::texture_codec::rgba_to_texel;
use super::{
    Allocation, BufferTextureCopy, ClearValue, HostTextureTag, SharedRecycler, StagingData,
    TextureBlit, TextureClear, TextureCopy, TextureRuntime,
};

struct Texture {
    tag: HostTextureTag,
    /// `layers[layer][level]` pixel buffer; six layers for cube maps.
    layers: Vec<Vec<Vec<u8>>>,
}

impl Texture {
    fn new(tag: HostTextureTag) -> Self {
        let bpp = tag.format.host_bytes_per_pixel() as usize;
        let layer_count = match tag.texture_type {
            TextureType::Texture2D => 1,
            TextureType::CubeMap => 6,
        };
        let layers = (0..layer_count)
            .map(|_| {
                (0..tag.levels)
                    .map(|level| {
                        let (w, h) = level_dims(&tag, level);
                        vec![0u8; (w * h) as usize * bpp]
                    })
                    .collect()
            })
            .collect();
        Self { tag, layers }
    }
}

fn level_dims(tag: &HostTextureTag, level: u32) -> (u32, u32) {
    ((tag.width >> level).max(1), (tag.height >> level).max(1))
}

#[derive(Default)]
pub struct SoftwareRuntime {
    recycler: SharedRecycler,
    textures: HashMap<u64, Texture>,
    next_handle: u64,
    staging_pool: Vec<u8>,
}

impl SoftwareRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw pixel bytes of one layer/level, for inspection in tests.
    pub fn level_data(&self, alloc: &Allocation, layer: u32, level: u32) -> &[u8] {
        &self.textures[&alloc.handle].layers[layer as usize][level as usize]
    }

    fn read_region(
        &self,
        alloc: &Allocation,
        layer: u32,
        level: u32,
        x0: u32,
        y0: u32,
        w: u32,
        h: u32,
    ) -> Vec<u8> {
        let texture = &self.textures[&alloc.handle];
        let bpp = texture.tag.format.host_bytes_per_pixel() as usize;
        let (level_w, _) = level_dims(&texture.tag, level);
        let data = &texture.layers[layer as usize][level as usize];

        let mut out = vec![0u8; (w * h) as usize * bpp];
        for row in 0..h as usize {
            let src = ((y0 as usize + row) * level_w as usize + x0 as usize) * bpp;
            let dst = row * w as usize * bpp;
            out[dst..dst + w as usize * bpp].copy_from_slice(&data[src..src + w as usize * bpp]);
        }
        out
    }

    fn write_region(
        &mut self,
        alloc: &Allocation,
        layer: u32,
        level: u32,
        x0: u32,
        y0: u32,
        w: u32,
        h: u32,
        pixels: &[u8],
    ) {
        let texture = self.textures.get_mut(&alloc.handle).unwrap();
        let bpp = texture.tag.format.host_bytes_per_pixel() as usize;
        let (level_w, _) = level_dims(&texture.tag, level);
        let data = &mut texture.layers[layer as usize][level as usize];

        for row in 0..h as usize {
            let dst = ((y0 as usize + row) * level_w as usize + x0 as usize) * bpp;
            let src = row * w as usize * bpp;
            data[dst..dst + w as usize * bpp].copy_from_slice(&pixels[src..src + w as usize * bpp]);
        }
    }
}

/// Encode a clear value as host texel bytes for `format`.
fn clear_texel(format: PixelFormat, value: &ClearValue, out: &mut [u8]) -> bool {
    let to_u8 = |f: f32| (f.clamp(0.0, 1.0) * 255.0).round() as u8;
    match (format.surface_type(), value) {
        (SurfaceType::Color, ClearValue::Color(color)) => {
            rgba_to_texel(format, color.map(to_u8), out)
        }
        (SurfaceType::Texture, ClearValue::Color(color)) => {
            out[..4].copy_from_slice(&color.map(to_u8));
            true
        }
        (SurfaceType::Depth, ClearValue::Depth(depth)) => match format {
            PixelFormat::D16 => {
                let v = (depth.clamp(0.0, 1.0) * 65535.0).round() as u16;
                LittleEndian::write_u16(out, v);
                true
            }
            PixelFormat::D24 => {
                let v = (depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
                LittleEndian::write_u32(out, v & 0xFF_FFFF);
                true
            }
            _ => false,
        },
        (SurfaceType::DepthStencil, ClearValue::DepthStencil(depth, stencil)) => {
            let d = (depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
            LittleEndian::write_u32(out, (d & 0xFF_FFFF) | (u32::from(*stencil) << 24));
            true
        }
        _ => false,
    }
}

/// Resolve a possibly flipped rectangle row parameter to an actual pixel
/// row. Parameter 0 is the rectangle's bottom edge.
fn resolve_row(rect: &Rectangle<u32>, param: u32) -> u32 {
    if rect.top >= rect.bottom {
        rect.bottom + param
    } else {
        rect.bottom - 1 - param
    }
}

impl TextureRuntime for SoftwareRuntime {
    fn recycler(&self) -> &SharedRecycler {
        &self.recycler
    }

    fn find_staging(&mut self, size: usize, _upload: bool) -> StagingData {
        let mut data = std::mem::take(&mut self.staging_pool);
        data.clear();
        data.resize(size, 0);
        StagingData { size, data }
    }

    fn recycle_staging(&mut self, staging: StagingData) {
        if staging.data.capacity() > self.staging_pool.capacity() {
            self.staging_pool = staging.data;
        }
    }

    fn allocate(&mut self, params: &SurfaceParams) -> Option<Allocation> {
        let tag = HostTextureTag::from_params(params);
        if let Some(alloc) = self.recycler.borrow_mut().take(&tag) {
            trace!("software runtime: reusing texture {} for {tag:?}", alloc.handle);
            return Some(alloc);
        }

        self.next_handle += 1;
        let handle = self.next_handle;
        self.textures.insert(handle, Texture::new(tag));
        trace!(
            "software runtime: allocated texture {handle} {}x{} {:?}",
            tag.width,
            tag.height,
            tag.format
        );
        Some(Allocation { handle, tag })
    }

    fn upload(&mut self, alloc: &Allocation, copy: &BufferTextureCopy, staging: &StagingData) {
        let rect = copy.texture_rect;
        self.write_region(
            alloc,
            0,
            copy.texture_level,
            rect.left,
            rect.bottom,
            rect.width(),
            rect.height(),
            &staging.data[..copy.buffer_size],
        );
    }

    fn download(&mut self, alloc: &Allocation, copy: &BufferTextureCopy, staging: &mut StagingData) {
        let rect = copy.texture_rect;
        let pixels = self.read_region(
            alloc,
            0,
            copy.texture_level,
            rect.left,
            rect.bottom,
            rect.width(),
            rect.height(),
        );
        staging.data[..pixels.len()].copy_from_slice(&pixels);
    }

    fn clear_texture(&mut self, alloc: &Allocation, clear: &TextureClear) {
        let mut texel = [0u8; 4];
        if !clear_texel(alloc.tag.format, &clear.value, &mut texel) {
            log::error!(
                "software runtime: cannot clear {:?} with {:?}",
                alloc.tag.format,
                clear.value
            );
            return;
        }
        let bpp = alloc.tag.format.host_bytes_per_pixel() as usize;
        let rect = clear.texture_rect;
        let row: Vec<u8> = texel[..bpp]
            .iter()
            .copied()
            .cycle()
            .take(rect.width() as usize * bpp)
            .collect();
        for y in rect.bottom..rect.top {
            self.write_region(
                alloc,
                0,
                clear.texture_level,
                rect.left,
                y,
                rect.width(),
                1,
                &row,
            );
        }
    }

    fn copy_textures(&mut self, src: &Allocation, dst: &Allocation, copy: &TextureCopy) {
        let (w, h) = copy.extent;
        let pixels = self.read_region(
            src,
            copy.src_layer,
            copy.src_level,
            copy.src_offset.0,
            copy.src_offset.1,
            w,
            h,
        );
        self.write_region(
            dst,
            copy.dst_layer,
            copy.dst_level,
            copy.dst_offset.0,
            copy.dst_offset.1,
            w,
            h,
            &pixels,
        );
    }

    fn blit_textures(&mut self, src: &Allocation, dst: &Allocation, blit: &TextureBlit) {
        let src_bpp = src.tag.format.host_bytes_per_pixel() as usize;
        let dst_bpp = dst.tag.format.host_bytes_per_pixel() as usize;
        if src_bpp != dst_bpp {
            log::error!(
                "software runtime: blit between incompatible texel sizes {:?} -> {:?}",
                src.tag.format,
                dst.tag.format
            );
            return;
        }
        let bpp = src_bpp;

        let (src_w, src_h) = (blit.src_rect.width(), blit.src_rect.height());
        let (dst_w, dst_h) = (blit.dst_rect.width(), blit.dst_rect.height());
        if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
            return;
        }

        let src_x0 = blit.src_rect.left.min(blit.src_rect.right);
        let src_y0 = blit.src_rect.bottom.min(blit.src_rect.top);
        let full = self.read_region(src, blit.src_layer, blit.src_level, src_x0, src_y0, src_w, src_h);

        // Nearest-neighbor resolve of the destination rectangle. Row
        // parameters run bottom-edge to top-edge of each rectangle, so a
        // flipped source mirrors vertically.
        let mut out = vec![0u8; (dst_w * dst_h) as usize * bpp];
        for j in 0..dst_h {
            let sj = j * src_h / dst_h;
            let sy = resolve_row(&blit.src_rect, sj) - src_y0;
            for i in 0..dst_w {
                let si = i * src_w / dst_w;
                let src_off = ((sy * src_w) + si) as usize * bpp;
                let dst_off = ((j * dst_w) + i) as usize * bpp;
                out[dst_off..dst_off + bpp].copy_from_slice(&full[src_off..src_off + bpp]);
            }
        }

        let dst_x0 = blit.dst_rect.left.min(blit.dst_rect.right);
        let dst_y0 = blit.dst_rect.bottom.min(blit.dst_rect.top);
        self.write_region(
            dst,
            blit.dst_layer,
            blit.dst_level,
            dst_x0,
            dst_y0,
            dst_w,
            dst_h,
            &out,
        );
    }

    fn generate_mipmaps(&mut self, alloc: &Allocation, max_level: u32) {
        let bpp = alloc.tag.format.host_bytes_per_pixel() as usize;
        let levels = alloc.tag.levels.min(max_level + 1);
        for level in 1..levels {
            let (src_w, src_h) = level_dims(&alloc.tag, level - 1);
            let (dst_w, dst_h) = level_dims(&alloc.tag, level);
            let src = self.read_region(alloc, 0, level - 1, 0, 0, src_w, src_h);

            let mut out = vec![0u8; (dst_w * dst_h) as usize * bpp];
            for y in 0..dst_h {
                for x in 0..dst_w {
                    let sx = (x * 2).min(src_w - 1);
                    let sy = (y * 2).min(src_h - 1);
                    let src_off = ((sy * src_w) + sx) as usize * bpp;
                    let dst_off = ((y * dst_w) + x) as usize * bpp;
                    out[dst_off..dst_off + bpp].copy_from_slice(&src[src_off..src_off + bpp]);
                }
            }
            self.write_region(alloc, 0, level, 0, 0, dst_w, dst_h, &out);
        }
    }

    fn reinterpretation_sources(&self, dest_format: PixelFormat) -> Vec<PixelFormat> {
        match dest_format {
            PixelFormat::Rgba8 => vec![PixelFormat::D24S8],
            _ => Vec::new(),
        }
    }

    fn reinterpret(
        &mut self,
        src: &Allocation,
        src_rect: Rectangle<u32>,
        dst: &Allocation,
        dst_rect: Rectangle<u32>,
    ) -> bool {
        if src.tag.format != PixelFormat::D24S8 || dst.tag.format != PixelFormat::Rgba8 {
            return false;
        }
        // Both formats pack to 32 bits per texel, so reinterpretation is a
        // raw bit copy.
        self.blit_textures(
            src,
            dst,
            &TextureBlit {
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: 0,
                src_rect,
                dst_rect,
            },
        );
        true
    }
}
