// SPDX-FileCopyrightText: 2025 rpica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host texture runtime abstraction.
//!
//! The cache drives a [`TextureRuntime`] for every GPU-side operation:
//! allocation, staging transfers, clears, copies, blits, mipmap generation
//! and format reinterpretation. Backends implement the trait; the cache
//! never sees host API types.

pub mod null;
pub mod software;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use rpica_common::Rectangle;

use super::pixel_format::{PixelFormat, SurfaceType, TextureType};
use super::surface_params::SurfaceParams;
use super::texture_codec::texel_to_rgba;

/// Identity of a host texture allocation, used for recycling. Dimensions are
/// host (scaled) pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostTextureTag {
    pub format: PixelFormat,
    pub texture_type: TextureType,
    pub width: u32,
    pub height: u32,
    pub levels: u32,
}

impl HostTextureTag {
    pub fn from_params(params: &SurfaceParams) -> Self {
        Self {
            format: params.pixel_format,
            texture_type: params.texture_type,
            width: params.scaled_width(),
            height: params.scaled_height(),
            levels: params.levels,
        }
    }
}

/// An owned host texture. The handle is only meaningful to the runtime that
/// issued it.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub handle: u64,
    pub tag: HostTextureTag,
}

/// Pool of returned allocations, keyed by their tag. Shared between the
/// runtime (which consults it on allocate) and surfaces (which deposit their
/// allocation on destruction).
#[derive(Default)]
pub struct TextureRecycler {
    pool: HashMap<HostTextureTag, Vec<Allocation>>,
}

impl TextureRecycler {
    pub fn put(&mut self, alloc: Allocation) {
        self.pool.entry(alloc.tag).or_default().push(alloc);
    }

    pub fn take(&mut self, tag: &HostTextureTag) -> Option<Allocation> {
        self.pool.get_mut(tag).and_then(Vec::pop)
    }

    pub fn clear(&mut self) {
        self.pool.clear();
    }
}

pub type SharedRecycler = Rc<RefCell<TextureRecycler>>;

/// A staging buffer loaned out by the runtime for one upload or download.
#[derive(Debug, Default)]
pub struct StagingData {
    pub size: usize,
    pub data: Vec<u8>,
}

/// A buffer <-> texture transfer over a rectangle of one mip level.
#[derive(Debug, Clone, Copy)]
pub struct BufferTextureCopy {
    pub buffer_size: usize,
    pub texture_rect: Rectangle<u32>,
    pub texture_level: u32,
}

/// A subimage copy between two textures (or a texture and a cube face).
#[derive(Debug, Clone, Copy, Default)]
pub struct TextureCopy {
    pub src_level: u32,
    pub dst_level: u32,
    pub src_layer: u32,
    pub dst_layer: u32,
    pub src_offset: (u32, u32),
    pub dst_offset: (u32, u32),
    pub extent: (u32, u32),
}

/// A scaling blit between two texture rectangles. A source rectangle with
/// `top < bottom` requests a vertical flip.
#[derive(Debug, Clone, Copy)]
pub struct TextureBlit {
    pub src_level: u32,
    pub dst_level: u32,
    pub src_layer: u32,
    pub dst_layer: u32,
    pub src_rect: Rectangle<u32>,
    pub dst_rect: Rectangle<u32>,
}

/// A scissored clear of one texture rectangle.
#[derive(Debug, Clone, Copy)]
pub struct TextureClear {
    pub texture_level: u32,
    pub texture_rect: Rectangle<u32>,
    pub value: ClearValue,
}

/// Typed clear value for the three attachment kinds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
    DepthStencil(f32, u8),
}

/// Build a clear value from a 4-byte fill pattern, interpreted as one pixel
/// of the destination format.
pub fn make_clear_value(
    surface_type: SurfaceType,
    format: PixelFormat,
    fill_data: &[u8; 4],
) -> Option<ClearValue> {
    match surface_type {
        SurfaceType::Color | SurfaceType::Texture | SurfaceType::Fill => {
            let rgba = texel_to_rgba(format, fill_data)?;
            Some(ClearValue::Color([
                f32::from(rgba[0]) / 255.0,
                f32::from(rgba[1]) / 255.0,
                f32::from(rgba[2]) / 255.0,
                f32::from(rgba[3]) / 255.0,
            ]))
        }
        SurfaceType::Depth => match format {
            PixelFormat::D16 => {
                let depth = u32::from(LittleEndian::read_u16(fill_data));
                Some(ClearValue::Depth(depth as f32 / 65535.0))
            }
            PixelFormat::D24 => {
                let depth = LittleEndian::read_u24(fill_data);
                Some(ClearValue::Depth(depth as f32 / 16_777_215.0))
            }
            _ => None,
        },
        SurfaceType::DepthStencil => {
            let value = LittleEndian::read_u32(fill_data);
            Some(ClearValue::DepthStencil(
                (value & 0xFF_FFFF) as f32 / 16_777_215.0,
                (value >> 24) as u8,
            ))
        }
        SurfaceType::Invalid => None,
    }
}

/// Host texture operations consumed by the rasterizer cache.
///
/// Staging buffers follow a loan protocol: `find_staging` hands out an owned
/// buffer of at least the requested size, and `recycle_staging` returns it
/// for reuse. At most one staging buffer is in flight at a time.
pub trait TextureRuntime {
    /// The recycler consulted on allocation; surfaces deposit their
    /// allocation here when they are destroyed.
    fn recycler(&self) -> &SharedRecycler;

    /// True when the backend needs 8-bit RGB(A) components reordered during
    /// upload and download (selects the codec `convert` tables).
    fn needs_component_reorder(&self) -> bool {
        false
    }

    /// True when a texture filter is active. Filtered backends upscale
    /// texture surfaces and generate mipmaps on the GPU instead of blitting
    /// per level.
    fn texture_filtering_enabled(&self) -> bool {
        false
    }

    fn find_staging(&mut self, size: usize, upload: bool) -> StagingData;

    fn recycle_staging(&mut self, staging: StagingData);

    /// Allocate a host texture for the scaled dimensions, levels and type of
    /// `params`. Returns `None` when the allocation is refused.
    fn allocate(&mut self, params: &SurfaceParams) -> Option<Allocation>;

    /// Copy staging pixels into a rectangle of the texture.
    fn upload(&mut self, alloc: &Allocation, copy: &BufferTextureCopy, staging: &StagingData);

    /// Copy a rectangle of the texture into the staging buffer.
    fn download(&mut self, alloc: &Allocation, copy: &BufferTextureCopy, staging: &mut StagingData);

    /// Scissor-clear a rectangle of the texture.
    fn clear_texture(&mut self, alloc: &Allocation, clear: &TextureClear);

    /// 1:1 subimage copy between two allocations.
    fn copy_textures(&mut self, src: &Allocation, dst: &Allocation, copy: &TextureCopy);

    /// Scaling blit between two allocations. Filtering is the backend's
    /// choice for color surfaces; depth blits are always nearest.
    fn blit_textures(&mut self, src: &Allocation, dst: &Allocation, blit: &TextureBlit);

    fn generate_mipmaps(&mut self, alloc: &Allocation, max_level: u32);

    /// Source formats for which this runtime can reinterpret into
    /// `dest_format` on the GPU, in preference order.
    fn reinterpretation_sources(&self, dest_format: PixelFormat) -> Vec<PixelFormat>;

    /// Re-read `src_rect` of `src` as pixels of `dst`'s format, writing into
    /// `dst_rect` of `dst`. Returns false when the pair is unsupported.
    fn reinterpret(
        &mut self,
        src: &Allocation,
        src_rect: Rectangle<u32>,
        dst: &Allocation,
        dst_rect: Rectangle<u32>,
    ) -> bool;
}
