// SPDX-FileCopyrightText: 2025 rpica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rasterizer surface cache.
//!
//! Mediates between guest physical memory, where the guest writes pixel
//! data in tiled or linear layouts, and host textures owned by a
//! [`runtime::TextureRuntime`]. The cache recognizes when guest reads,
//! writes or transfers touch memory mirrored by a host texture, lazily
//! uploads, downloads and converts between the two representations, reuses
//! host textures across differing views of the same memory, and fulfills
//! fill, display-transfer and texture-copy operations on the GPU when their
//! preconditions hold.
//!
//! The cache is owned and mutated exclusively by the rendering thread;
//! guest-memory write notifications arrive as ordinary
//! [`RasterizerCache::invalidate_region`] calls.

pub mod interval;
pub mod pixel_format;
pub mod runtime;
pub mod surface;
pub mod surface_params;
pub mod texture_codec;

use std::collections::HashMap;

use bitflags::bitflags;
use log::{debug, error, trace, warn};
use rpica_common::{align_down, align_up, PAddr, Rectangle, PAGE_BITS};

use crate::memory::MemoryInterface;
use interval::{Interval, IntervalMap, IntervalSet, MultiMap, PageMap};
use pixel_format::{formats_blittable, PixelFormat, SurfaceType, TextureType, ALL_FORMATS};
use runtime::{
    make_clear_value, BufferTextureCopy, TextureBlit, TextureClear, TextureCopy, TextureRuntime,
};
use surface::{CachedTextureCube, Surface, SurfaceRef, TextureCubeConfig};
use surface_params::SurfaceParams;
use texture_codec::{decode_texture, encode_texture};

/// How a candidate surface's resolution scale must relate to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMatch {
    /// Only accept the same scale.
    Exact,
    /// Accept the same or a higher scale.
    Upscale,
    /// Accept any scale.
    Ignore,
}

bitflags! {
    /// Kinds of matches [`RasterizerCache::find_match`] may return.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct MatchFlags: u32 {
        /// Surfaces with stale content over the query range are acceptable;
        /// they require validation before use.
        const INVALID = 1;
        /// Surface matches the query exactly.
        const EXACT = 1 << 1;
        /// Surface fully encompasses the query as a sub-rectangle.
        const SUB_RECT = 1 << 2;
        /// Surface has valid content the query can copy from.
        const COPY = 1 << 3;
        /// Surface could be grown to also cover the query.
        const EXPAND = 1 << 4;
        /// Surface can serve a raw byte-copy of the query.
        const TEX_COPY = 1 << 5;
    }
}

/// Memory fill parameters, decoded from the fill-engine registers.
#[derive(Debug, Clone, Copy)]
pub struct MemoryFillConfig {
    pub start: PAddr,
    pub end: PAddr,
    pub value: u32,
    pub fill_width: FillWidth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillWidth {
    Bits16,
    Bits24,
    Bits32,
}

impl FillWidth {
    const fn bytes(self) -> u32 {
        match self {
            FillWidth::Bits16 => 2,
            FillWidth::Bits24 => 3,
            FillWidth::Bits32 => 4,
        }
    }
}

/// Scaling mode of a display transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    NoScale,
    ScaleX,
    ScaleXY,
}

/// Raw byte-copy parameters of a "texture copy" display transfer. Widths
/// and gaps are in bytes and multiples of 16.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextureCopyConfig {
    pub size: u32,
    pub input_width: u32,
    pub input_gap: u32,
    pub output_width: u32,
    pub output_gap: u32,
}

/// Display transfer parameters, decoded from the transfer-engine registers.
#[derive(Debug, Clone, Copy)]
pub struct DisplayTransferConfig {
    pub input_address: PAddr,
    pub output_address: PAddr,
    pub input_width: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub input_format: PixelFormat,
    pub output_format: PixelFormat,
    pub input_linear: bool,
    pub dont_swizzle: bool,
    pub scaling: ScalingMode,
    pub flip_vertically: bool,
    pub texture_copy: TextureCopyConfig,
}

/// Texture unit configuration for a surface fetch.
#[derive(Debug, Clone, Copy)]
pub struct TextureInfo {
    pub physical_address: PAddr,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Framebuffer registers relevant to surface lookup.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferConfig {
    pub color_address: PAddr,
    pub depth_address: PAddr,
    pub width: u32,
    pub height: u32,
    pub color_format: PixelFormat,
    pub depth_format: PixelFormat,
    pub viewport: Rectangle<i32>,
}

/// Surfaces bound for rendering, with the scaled draw rectangle.
pub struct Framebuffer {
    pub color: Option<SurfaceRef>,
    pub depth: Option<SurfaceRef>,
    pub rect: Rectangle<u32>,
    color_interval: Interval,
    depth_interval: Interval,
}

#[derive(Default)]
struct RenderTargets {
    color: Option<SurfaceRef>,
    depth: Option<SurfaceRef>,
}

/// Number of mip levels for a texture, capped by the guest's level limit.
pub fn mip_levels(mut width: u32, mut height: u32, max_level: u32) -> u32 {
    let mut levels = 1;
    while width > 8 && height > 8 {
        levels += 1;
        width >>= 1;
        height >>= 1;
    }
    levels.min(max_level + 1)
}

pub struct RasterizerCache<M: MemoryInterface, R: TextureRuntime> {
    memory: M,
    runtime: R,
    surface_cache: MultiMap<SurfaceRef>,
    dirty_regions: IntervalMap<SurfaceRef>,
    cached_pages: PageMap,
    remove_surfaces: Vec<SurfaceRef>,
    texture_cube_cache: HashMap<TextureCubeConfig, CachedTextureCube>,
    render_targets: RenderTargets,
    resolution_scale_factor: u16,
}

impl<M: MemoryInterface, R: TextureRuntime> RasterizerCache<M, R> {
    pub fn new(memory: M, runtime: R, resolution_scale_factor: u16) -> Self {
        Self {
            memory,
            runtime,
            surface_cache: MultiMap::new(),
            dirty_regions: IntervalMap::new(),
            cached_pages: PageMap::new(),
            remove_surfaces: Vec::new(),
            texture_cube_cache: HashMap::new(),
            render_targets: RenderTargets::default(),
            resolution_scale_factor: resolution_scale_factor.max(1),
        }
    }

    pub fn memory(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    /// Change the desired output scale. All host content is flushed and the
    /// cache rebuilt at the new scale on demand.
    pub fn set_resolution_scale_factor(&mut self, scale: u16) {
        let scale = scale.max(1);
        if scale == self.resolution_scale_factor {
            return;
        }
        debug!(
            "resolution scale {} -> {scale}, clearing cache",
            self.resolution_scale_factor
        );
        self.resolution_scale_factor = scale;
        self.flush_all();
        while let Some(surface) = self.surface_cache.first() {
            self.unregister_surface(&surface);
        }
        self.texture_cube_cache.clear();
    }

    // ── Surface lookup ─────────────────────────────────────────────────────

    /// Find or create a surface exactly matching `params`, optionally
    /// validating its whole range.
    pub fn get_surface(
        &mut self,
        params: &SurfaceParams,
        match_res_scale: ScaleMatch,
        load_if_create: bool,
    ) -> Option<SurfaceRef> {
        if params.addr == 0 || params.width * params.height == 0 {
            return None;
        }
        if params.width != params.stride {
            // Surfaces cannot have gaps; strided views go through
            // get_surface_sub_rect.
            error!("refusing gapped surface request {params:?}");
            return None;
        }
        if params.is_tiled && (params.width % 8 != 0 || params.height % 8 != 0) {
            error!(
                "tiled surface dimensions {}x{} not multiples of 8",
                params.width, params.height
            );
            return None;
        }

        let mut surface =
            self.find_match(params, MatchFlags::EXACT | MatchFlags::INVALID, match_res_scale, None);

        if surface.is_none() {
            let mut target_res_scale = params.res_scale;
            if match_res_scale != ScaleMatch::Exact {
                // The requested range may be part of a higher-scale surface;
                // adopt its scale so a later expansion can reuse it. The
                // D24S8 pairing keeps scale across the reinterpretation to
                // RGBA8.
                let mut probe_formats = vec![params.pixel_format];
                if params.pixel_format == PixelFormat::Rgba8 {
                    probe_formats.push(PixelFormat::D24S8);
                }
                for format in probe_formats {
                    let mut find_params = *params;
                    find_params.pixel_format = format;
                    let expandable = self.find_match(
                        &find_params,
                        MatchFlags::EXPAND | MatchFlags::INVALID,
                        match_res_scale,
                        None,
                    );
                    if let Some(expandable) = expandable {
                        let scale = expandable.params().res_scale;
                        if scale > target_res_scale {
                            target_res_scale = scale;
                        }
                    }
                }
            }

            let mut new_params = *params;
            new_params.res_scale = target_res_scale;
            let created = self.create_surface(new_params)?;
            self.register_surface(&created);
            surface = Some(created);
        }

        let surface = surface?;
        if load_if_create {
            self.validate_surface(&surface, params.addr, params.size);
        }
        Some(surface)
    }

    /// Find or create a surface containing `params` as a sub-rectangle.
    /// Returns the surface and the scaled rectangle `params` occupies in it.
    pub fn get_surface_sub_rect(
        &mut self,
        params: &SurfaceParams,
        match_res_scale: ScaleMatch,
        load_if_create: bool,
    ) -> Option<(SurfaceRef, Rectangle<u32>)> {
        if params.addr == 0 || params.width * params.height == 0 {
            return None;
        }

        let mut surface = self.find_match(
            params,
            MatchFlags::SUB_RECT | MatchFlags::INVALID,
            match_res_scale,
            None,
        );

        // A miss caused only by scale means a lower-scale surface already
        // covers this footprint. Create a placeholder at the requested scale
        // with that footprint so later lookups prefer it.
        if surface.is_none() && match_res_scale != ScaleMatch::Ignore {
            let lower = self.find_match(
                params,
                MatchFlags::SUB_RECT | MatchFlags::INVALID,
                ScaleMatch::Ignore,
                None,
            );
            if let Some(lower) = lower {
                let mut new_params = lower.params();
                new_params.res_scale = params.res_scale;
                let created = self.create_surface(new_params)?;
                self.register_surface(&created);
                surface = Some(created);
            }
        }

        let mut aligned_params = *params;
        if params.is_tiled {
            aligned_params.height = align_up(params.height, 8);
            aligned_params.width = align_up(params.width, 8);
            aligned_params.stride = align_up(params.stride, 8);
            aligned_params.update();
        }

        // Try growing an existing surface before creating a new one.
        if surface.is_none() {
            let expandable = self.find_match(
                &aligned_params,
                MatchFlags::EXPAND | MatchFlags::INVALID,
                match_res_scale,
                None,
            );
            if let Some(expandable) = expandable {
                aligned_params.width = aligned_params.stride;
                aligned_params.update();

                let expandable_params = expandable.params();
                let mut new_params = expandable_params;
                new_params.addr = aligned_params.addr.min(expandable_params.addr);
                new_params.end = aligned_params.end.max(expandable_params.end);
                new_params.size = new_params.end - new_params.addr;
                let row_bytes = aligned_params.bytes_in_pixels(aligned_params.stride);
                debug_assert_eq!(new_params.size % row_bytes, 0);
                new_params.height = new_params.size / row_bytes;

                let new_surface = self.create_surface(new_params)?;
                self.duplicate_surface(&expandable, &new_surface);

                // The old surface may still be in use; unlink it now and
                // unregister it once the current operation completes.
                expandable.0.borrow_mut().unlink_watchers();
                self.schedule_removal(expandable);

                self.register_surface(&new_surface);
                surface = Some(new_surface);
            }
        }

        let surface = match surface {
            None => {
                // No encompassing surface; create one covering the full
                // stride so it has no gaps.
                let mut new_params = aligned_params;
                new_params.width = aligned_params.stride;
                new_params.update();
                self.get_surface(&new_params, match_res_scale, load_if_create)?
            }
            Some(surface) => {
                if load_if_create {
                    self.validate_surface(&surface, aligned_params.addr, aligned_params.size);
                }
                surface
            }
        };

        let rect = surface.params().scaled_sub_rect(params);
        Some((surface, rect))
    }

    /// Fetch the surface for a texture unit configuration, keeping its
    /// mipmap levels up to date.
    pub fn get_texture_surface(
        &mut self,
        info: &TextureInfo,
        max_level: u32,
    ) -> Option<SurfaceRef> {
        if info.physical_address == 0 {
            return None;
        }

        let mut params = SurfaceParams {
            addr: info.physical_address,
            width: info.width,
            height: info.height,
            levels: max_level + 1,
            is_tiled: true,
            pixel_format: info.format,
            res_scale: if self.runtime.texture_filtering_enabled() {
                self.resolution_scale_factor
            } else {
                1
            },
            ..Default::default()
        };
        params.update();

        let min_width = info.width >> max_level;
        let min_height = info.height >> max_level;
        if min_width % 8 != 0 || min_height % 8 != 0 {
            error!("texture size {min_width}x{min_height} is not a multiple of 8");
            return None;
        }
        if info.width != (min_width << max_level) || info.height != (min_height << max_level) {
            error!(
                "texture size {}x{} does not support mipmap level {max_level}",
                info.width, info.height
            );
            return None;
        }

        let surface = self.get_surface(&params, ScaleMatch::Ignore, true)?;

        if max_level != 0 {
            if max_level >= 8 {
                // Guest textures are at most 1024 pixels, so eight levels
                // including the base is the ceiling.
                error!("unsupported mipmap level {max_level}");
                return None;
            }

            if self.runtime.texture_filtering_enabled() {
                if let Some(alloc) = surface.0.borrow().alloc.clone() {
                    self.runtime.generate_mipmaps(&alloc, max_level);
                }
            }

            // Levels are stored contiguously after the base image at half
            // the dimensions each.
            let mut level_params = surface.params();
            for level in 1..=max_level {
                level_params.addr +=
                    level_params.bytes_in_pixels(level_params.width * level_params.height);
                level_params.width /= 2;
                level_params.height /= 2;
                level_params.stride = 0;
                level_params.levels = 1;
                level_params.update();

                let slot = surface.0.borrow().level_watchers[level as usize - 1].clone();
                let needs_new = match &slot {
                    Some(watcher) => watcher.borrow().get().is_none(),
                    None => true,
                };
                let watcher = if needs_new {
                    let level_surface = self.get_surface(&level_params, ScaleMatch::Ignore, true);
                    let watcher = level_surface.as_ref().map(Surface::create_watcher);
                    surface.0.borrow_mut().level_watchers[level as usize - 1] = watcher.clone();
                    watcher
                } else {
                    slot
                };

                if let Some(watcher) = watcher {
                    if !watcher.borrow().is_valid() {
                        let Some(level_surface) = watcher.borrow().get() else {
                            continue;
                        };
                        let level_surface_params = level_surface.params();
                        if !level_surface.0.borrow().invalid_regions.is_empty() {
                            self.validate_surface(
                                &level_surface,
                                level_surface_params.addr,
                                level_surface_params.size,
                            );
                        }

                        if !self.runtime.texture_filtering_enabled() {
                            let src_alloc = level_surface.0.borrow().alloc.clone();
                            let dst_alloc = surface.0.borrow().alloc.clone();
                            if let (Some(src), Some(dst)) = (src_alloc, dst_alloc) {
                                let blit = TextureBlit {
                                    src_level: 0,
                                    dst_level: level,
                                    src_layer: 0,
                                    dst_layer: 0,
                                    src_rect: level_surface_params.scaled_rect(),
                                    dst_rect: level_params.scaled_rect(),
                                };
                                self.runtime.blit_textures(&src, &dst, &blit);
                            }
                        }

                        watcher.borrow_mut().validate();
                    }
                }
            }
        }

        Some(surface)
    }

    /// Fetch (and lazily assemble) the cube map for `config`, revalidating
    /// only faces whose watchers report a change.
    pub fn get_texture_cube(&mut self, config: &TextureCubeConfig) -> Option<&CachedTextureCube> {
        let mut cube = self.texture_cube_cache.remove(config).unwrap_or_default();

        for (i, address) in config.face_addresses().into_iter().enumerate() {
            let dead = match &cube.faces[i] {
                Some(watcher) => watcher.borrow().get().is_none(),
                None => true,
            };
            if dead {
                let info = TextureInfo {
                    physical_address: address,
                    width: config.width,
                    height: config.width,
                    format: config.format,
                };
                // An unmappable face address leaves the slot empty; its
                // content is never updated, which only happens for leftover
                // texture unit state the guest does not draw with.
                cube.faces[i] = self
                    .get_texture_surface(&info, 0)
                    .as_ref()
                    .map(Surface::create_watcher);
            }
        }

        if cube.texture.is_none() {
            let mut res_scale: u16 = 1;
            for watcher in cube.faces.iter().flatten() {
                if let Some(surface) = watcher.borrow().get() {
                    res_scale = res_scale.max(surface.params().res_scale);
                }
            }
            cube.res_scale = res_scale;

            let scaled_width = u32::from(res_scale) * config.width;
            let mut cube_params = SurfaceParams {
                width: config.width,
                height: config.width,
                levels: scaled_width.ilog2() + 1,
                res_scale,
                is_tiled: true,
                pixel_format: config.format,
                texture_type: TextureType::CubeMap,
                ..Default::default()
            };
            cube_params.surface_type = config.format.surface_type();
            cube_params.stride = config.width;
            match self.runtime.allocate(&cube_params) {
                Some(alloc) => cube.texture = Some(alloc),
                None => {
                    error!("cube texture allocation refused for {config:?}");
                    self.texture_cube_cache.insert(*config, cube);
                    return None;
                }
            }
        }

        let scaled_size = u32::from(cube.res_scale) * config.width;
        for (i, watcher) in cube.faces.iter().enumerate() {
            let Some(watcher) = watcher else {
                continue;
            };
            if watcher.borrow().is_valid() {
                continue;
            }
            let Some(surface) = watcher.borrow().get() else {
                continue;
            };
            let surface_params = surface.params();
            if !surface.0.borrow().invalid_regions.is_empty() {
                self.validate_surface(&surface, surface_params.addr, surface_params.size);
            }

            let src_alloc = surface.0.borrow().alloc.clone();
            if let (Some(src), Some(dst)) = (src_alloc, cube.texture.as_ref()) {
                let copy = TextureCopy {
                    src_level: 0,
                    dst_level: 0,
                    src_layer: 0,
                    dst_layer: i as u32,
                    src_offset: (0, 0),
                    dst_offset: (0, 0),
                    extent: (scaled_size, scaled_size),
                };
                self.runtime.copy_textures(&src, dst, &copy);
            }
            watcher.borrow_mut().validate();
        }

        self.texture_cube_cache.insert(*config, cube);
        self.texture_cube_cache.get(config)
    }

    /// Fetch the color and depth surfaces for the current framebuffer
    /// configuration and validate them over the viewport.
    pub fn get_framebuffer_surfaces(
        &mut self,
        mut using_color: bool,
        mut using_depth: bool,
        config: &FramebufferConfig,
    ) -> Framebuffer {
        let clamp_x = |v: i32| v.clamp(0, config.width as i32) as u32;
        let clamp_y = |v: i32| v.clamp(0, config.height as i32) as u32;
        let viewport = Rectangle::new(
            clamp_x(config.viewport.left),
            clamp_y(config.viewport.top),
            clamp_x(config.viewport.right),
            clamp_y(config.viewport.bottom),
        );

        let mut color_params = SurfaceParams {
            addr: config.color_address,
            width: config.width,
            height: config.height,
            is_tiled: true,
            pixel_format: config.color_format,
            res_scale: self.resolution_scale_factor,
            ..Default::default()
        };
        let mut depth_params = SurfaceParams {
            addr: config.depth_address,
            pixel_format: config.depth_format,
            ..color_params
        };
        color_params.update();
        depth_params.update();

        let color_vp_interval = color_params.sub_rect_interval(viewport);
        let depth_vp_interval = depth_params.sub_rect_interval(viewport);

        if using_color
            && using_depth
            && color_vp_interval.overlaps(depth_vp_interval)
        {
            error!(
                "color and depth framebuffer regions overlap; overlapping framebuffers are not supported"
            );
            using_depth = false;
        }
        if config.color_format == PixelFormat::Invalid {
            using_color = false;
        }
        if config.depth_format == PixelFormat::Invalid {
            using_depth = false;
        }

        let mut color = None;
        let mut color_rect = Rectangle::default();
        if using_color {
            if let Some((surface, rect)) =
                self.get_surface_sub_rect(&color_params, ScaleMatch::Exact, false)
            {
                color = Some(surface);
                color_rect = rect;
            }
        }

        let mut depth = None;
        let mut depth_rect = Rectangle::default();
        if using_depth {
            if let Some((surface, rect)) =
                self.get_surface_sub_rect(&depth_params, ScaleMatch::Exact, false)
            {
                depth = Some(surface);
                depth_rect = rect;
            }
        }

        let mut rect = Rectangle::default();
        if color.is_some() && depth.is_some() {
            rect = color_rect;
            // Color and depth attachments must agree on dimensions and
            // offsets; fall back to the full surfaces when they do not.
            if color_rect != depth_rect {
                color = self.get_surface(&color_params, ScaleMatch::Exact, false);
                depth = self.get_surface(&depth_params, ScaleMatch::Exact, false);
                if let Some(color) = &color {
                    rect = color.params().scaled_rect();
                }
            }
        } else if color.is_some() {
            rect = color_rect;
        } else if depth.is_some() {
            rect = depth_rect;
        }

        if let Some(surface) = color.clone() {
            self.validate_surface(&surface, color_vp_interval.start, color_vp_interval.len());
            surface.0.borrow_mut().invalidate_watchers();
        }
        if let Some(surface) = depth.clone() {
            self.validate_surface(&surface, depth_vp_interval.start, depth_vp_interval.len());
            surface.0.borrow_mut().invalidate_watchers();
        }

        self.render_targets = RenderTargets {
            color: color.clone(),
            depth: depth.clone(),
        };

        Framebuffer {
            color,
            depth,
            rect,
            color_interval: color_vp_interval,
            depth_interval: depth_vp_interval,
        }
    }

    /// Mark a rendered-to framebuffer's viewport region as freshly written
    /// by its surfaces.
    pub fn invalidate_framebuffer(&mut self, framebuffer: &Framebuffer) {
        if let Some(color) = framebuffer.color.clone() {
            let interval = framebuffer.color_interval;
            self.invalidate_region(interval.start, interval.len(), Some(&color));
        }
        if let Some(depth) = framebuffer.depth.clone() {
            let interval = framebuffer.depth_interval;
            self.invalidate_region(interval.start, interval.len(), Some(&depth));
        }
    }

    /// Register a virtual surface representing a fill pattern over a memory
    /// range.
    pub fn get_fill_surface(&mut self, config: &MemoryFillConfig) -> SurfaceRef {
        let params = SurfaceParams {
            addr: config.start,
            end: config.end,
            size: config.end - config.start,
            surface_type: SurfaceType::Fill,
            res_scale: u16::MAX,
            ..Default::default()
        };

        let fill_surface = SurfaceRef::new(Surface::new(params, None, None));
        {
            let mut surface = fill_surface.0.borrow_mut();
            surface.fill_data = config.value.to_le_bytes();
            surface.fill_size = config.fill_width.bytes();
        }

        self.register_surface(&fill_surface);
        self.invalidate_region(params.addr, params.size, Some(&fill_surface));
        fill_surface
    }

    /// Find a surface able to serve a raw byte copy described by `params`
    /// (whose width/stride/height are in bytes), and the scaled source
    /// rectangle.
    pub fn get_tex_copy_surface(
        &mut self,
        params: &SurfaceParams,
    ) -> Option<(SurfaceRef, Rectangle<u32>)> {
        let match_surface = self.find_match(
            params,
            MatchFlags::TEX_COPY | MatchFlags::INVALID,
            ScaleMatch::Ignore,
            None,
        )?;

        self.validate_surface(&match_surface, params.addr, params.size);
        let match_params = match_surface.params();

        let match_subrect = if params.width != params.stride {
            let tiled_size = if match_params.is_tiled { 8 } else { 1 };
            let mut subrect = *params;
            subrect.width = match_params.pixels_in_bytes(params.width) / tiled_size;
            subrect.stride = match_params.pixels_in_bytes(params.stride) / tiled_size;
            subrect.height *= tiled_size;
            subrect
        } else {
            let subrect = match_params.from_interval(params.interval());
            debug_assert_eq!(subrect.interval(), params.interval());
            subrect
        };

        let rect = match_params.scaled_sub_rect(&match_subrect);
        Some((match_surface, rect))
    }

    // ── Accelerated operations ─────────────────────────────────────────────

    /// Fulfill a memory fill entirely on the GPU by registering a fill
    /// surface over its range.
    pub fn accelerate_fill(&mut self, config: &MemoryFillConfig) -> bool {
        if config.start == 0 || config.end <= config.start {
            return false;
        }
        debug!(
            "accelerated fill [0x{:X}, 0x{:X}) value 0x{:08X}",
            config.start, config.end, config.value
        );
        self.get_fill_surface(config);
        true
    }

    /// Fulfill a display transfer as a GPU blit between cached surfaces.
    pub fn accelerate_display_transfer(&mut self, config: &DisplayTransferConfig) -> bool {
        let mut src_params = SurfaceParams {
            addr: config.input_address,
            width: config.output_width,
            stride: config.input_width,
            height: config.output_height,
            is_tiled: !config.input_linear,
            pixel_format: config.input_format,
            ..Default::default()
        };
        src_params.update();

        let mut dst_params = SurfaceParams {
            addr: config.output_address,
            width: if config.scaling != ScalingMode::NoScale {
                config.output_width / 2
            } else {
                config.output_width
            },
            height: if config.scaling == ScalingMode::ScaleXY {
                config.output_height / 2
            } else {
                config.output_height
            },
            is_tiled: config.input_linear != config.dont_swizzle,
            pixel_format: config.output_format,
            ..Default::default()
        };
        dst_params.update();

        let Some((src_surface, mut src_rect)) =
            self.get_surface_sub_rect(&src_params, ScaleMatch::Ignore, true)
        else {
            return false;
        };

        dst_params.res_scale = src_surface.params().res_scale;
        let Some((dst_surface, dst_rect)) =
            self.get_surface_sub_rect(&dst_params, ScaleMatch::Upscale, false)
        else {
            return false;
        };

        if src_surface.params().is_tiled != dst_surface.params().is_tiled {
            src_rect = src_rect.flipped();
        }
        if config.flip_vertically {
            src_rect = src_rect.flipped();
        }

        if !formats_blittable(src_surface.params().pixel_format, dst_surface.params().pixel_format)
        {
            return false;
        }

        let src_alloc = src_surface.0.borrow().alloc.clone();
        let dst_alloc = dst_surface.0.borrow().alloc.clone();
        let (Some(src_alloc), Some(dst_alloc)) = (src_alloc, dst_alloc) else {
            return false;
        };
        let blit = TextureBlit {
            src_level: 0,
            dst_level: 0,
            src_layer: 0,
            dst_layer: 0,
            src_rect,
            dst_rect,
        };
        self.runtime.blit_textures(&src_alloc, &dst_alloc, &blit);

        self.invalidate_region(dst_params.addr, dst_params.size, Some(&dst_surface));
        true
    }

    /// Fulfill a raw texture copy as a GPU copy between cached surfaces.
    pub fn accelerate_texture_copy(&mut self, config: &DisplayTransferConfig) -> bool {
        let copy = &config.texture_copy;
        let copy_size = align_down(copy.size, 16);
        if copy_size == 0 {
            return false;
        }

        let mut input_gap = copy.input_gap;
        let mut input_width = copy.input_width;
        if input_width == 0 && input_gap != 0 {
            return false;
        }
        if input_gap == 0 || input_width >= copy_size {
            input_width = copy_size;
            input_gap = 0;
        }
        if copy_size % input_width != 0 {
            return false;
        }

        let mut output_gap = copy.output_gap;
        let mut output_width = copy.output_width;
        if output_width == 0 && output_gap != 0 {
            return false;
        }
        if output_gap == 0 || output_width >= copy_size {
            output_width = copy_size;
            output_gap = 0;
        }
        if copy_size % output_width != 0 {
            return false;
        }

        // Source parameters are in bytes: the copy does not care about the
        // pixel format, only about the byte layout.
        let mut src_params = SurfaceParams {
            addr: config.input_address,
            stride: input_width + input_gap,
            width: input_width,
            height: copy_size / input_width,
            ..Default::default()
        };
        src_params.size = (src_params.height - 1) * src_params.stride + src_params.width;
        src_params.end = src_params.addr + src_params.size;

        let Some((src_surface, src_rect)) = self.get_tex_copy_surface(&src_params) else {
            return false;
        };
        let src_surface_params = src_surface.params();
        let res_scale = u32::from(src_surface_params.res_scale);
        let tiled_size = if src_surface_params.is_tiled { 8 } else { 1 };

        if output_gap != 0
            && (output_width
                != src_surface_params.bytes_in_pixels(src_rect.width() / res_scale) * tiled_size
                || output_gap
                    % src_surface_params
                        .bytes_in_pixels(if src_surface_params.is_tiled { 64 } else { 1 })
                        .max(1)
                    != 0)
        {
            return false;
        }

        let mut dst_params = src_surface_params;
        dst_params.addr = config.output_address;
        dst_params.width = src_rect.width() / res_scale;
        dst_params.stride = dst_params.width
            + src_surface_params.pixels_in_bytes(if src_surface_params.is_tiled {
                output_gap / 8
            } else {
                output_gap
            });
        dst_params.height = src_rect.height() / res_scale;
        dst_params.res_scale = src_surface_params.res_scale;
        dst_params.update();

        // The gap bytes are about to be invalidated with the rest of the
        // destination, so load them first.
        let load_gap = output_gap != 0;
        let Some((dst_surface, dst_rect)) =
            self.get_surface_sub_rect(&dst_params, ScaleMatch::Upscale, load_gap)
        else {
            return false;
        };

        if dst_surface.params().surface_type == SurfaceType::Texture
            || !formats_blittable(src_surface_params.pixel_format, dst_surface.params().pixel_format)
        {
            return false;
        }

        debug_assert_eq!(src_rect.width(), dst_rect.width());

        let src_alloc = src_surface.0.borrow().alloc.clone();
        let dst_alloc = dst_surface.0.borrow().alloc.clone();
        let (Some(src_alloc), Some(dst_alloc)) = (src_alloc, dst_alloc) else {
            return false;
        };
        let texture_copy = TextureCopy {
            src_level: 0,
            dst_level: 0,
            src_layer: 0,
            dst_layer: 0,
            src_offset: (src_rect.left, src_rect.bottom),
            dst_offset: (dst_rect.left, dst_rect.bottom),
            extent: (src_rect.width(), src_rect.height()),
        };
        self.runtime.copy_textures(&src_alloc, &dst_alloc, &texture_copy);

        self.invalidate_region(dst_params.addr, dst_params.size, Some(&dst_surface));
        true
    }

    // ── Validation ─────────────────────────────────────────────────────────

    /// Bring `addr..addr + size` of `surface` up to date, preferring GPU
    /// copies and reinterpretation over guest-memory uploads.
    pub fn validate_surface(&mut self, surface: &SurfaceRef, addr: PAddr, size: u32) {
        if size == 0 {
            return;
        }
        let validate_interval = Interval::sized(addr, size);

        if surface.params().surface_type == SurfaceType::Fill {
            // Fill surfaces are always valid when used.
            debug_assert!(surface.0.borrow().is_region_valid(validate_interval));
            return;
        }

        let mut validate_regions = surface
            .0
            .borrow()
            .invalid_regions
            .intersection(validate_interval);

        while let Some(first) = validate_regions.first() {
            let interval = first.intersect(validate_interval);
            let params = surface.params().from_interval(interval);

            // Prefer copying from a surface that already holds the content.
            let copy_surface =
                self.find_match(&params, MatchFlags::COPY, ScaleMatch::Ignore, Some(interval));
            if let Some(copy_surface) = copy_surface {
                let copy_interval = copy_surface.0.borrow().get_copyable_interval(&params);
                self.copy_surface(&copy_surface, surface, copy_interval);
                surface.0.borrow_mut().invalid_regions.remove(copy_interval);
                validate_regions.remove(copy_interval);
                continue;
            }

            // A surface of a different format over the same bytes may be
            // reinterpretable into ours.
            if self.validate_by_reinterpretation(surface, params, interval) {
                surface.0.borrow_mut().invalid_regions.remove(interval);
                validate_regions.remove(interval);
                continue;
            }

            if self.no_unimplemented_reinterpretations(surface, params, interval)
                && !self.interval_has_invalid_format(interval)
                && self.dirty_regions.covers(interval)
            {
                // The region was created entirely on the GPU and no
                // reinterpretation applies; uploading guest memory here
                // would overwrite GPU content with garbage.
                debug!("region {interval:?} created on GPU; skipping validation");
                validate_regions.remove(interval);
                continue;
            }

            // Fall back to guest memory. Flush other writers first so we
            // upload their latest content.
            self.flush_region(params.addr, params.size, None);
            if self.upload_surface(surface, interval) {
                surface.0.borrow_mut().invalid_regions.remove(params.interval());
                validate_regions.remove(params.interval());
            } else {
                // Upload failed (no codec or unmapped memory); leave the
                // region stale but stop retrying this pass.
                validate_regions.remove(params.interval());
            }
        }
    }

    /// Decode guest bytes over `interval` and upload them to the surface.
    fn upload_surface(&mut self, surface: &SurfaceRef, interval: Interval) -> bool {
        let surface_params = surface.params();
        let load_info = surface_params.from_interval(interval);
        debug_assert!(load_info.addr >= surface_params.addr && load_info.end <= surface_params.end);

        let staging_size = (load_info.width
            * load_info.height
            * load_info.pixel_format.host_bytes_per_pixel()) as usize;
        let mut staging = self.runtime.find_staging(staging_size, true);

        let convert = self.runtime.needs_component_reorder()
            && matches!(
                surface_params.pixel_format,
                PixelFormat::Rgba8 | PixelFormat::Rgb8
            );

        let Some(guest) = self.memory.phys_region_mut(load_info.addr) else {
            warn!("upload from unmapped guest address 0x{:X}", load_info.addr);
            return false;
        };
        let copy_bytes = (load_info.end - load_info.addr) as usize;
        if guest.len() < copy_bytes {
            warn!("upload source at 0x{:X} truncated by memory region", load_info.addr);
            return false;
        }

        if let Err(err) = decode_texture(
            &load_info,
            &guest[..copy_bytes],
            &mut staging.data[..staging_size],
            0,
            copy_bytes,
            convert,
        ) {
            error!("{err}");
            return false;
        }

        let upload = BufferTextureCopy {
            buffer_size: staging_size,
            texture_rect: surface_params.sub_rect(&load_info),
            texture_level: 0,
        };
        surface.0.borrow_mut().upload(&mut self.runtime, &upload, &staging);
        self.runtime.recycle_staging(staging);
        true
    }

    /// Download the surface over `interval` and encode it back to guest
    /// memory.
    fn download_surface(&mut self, surface: &SurfaceRef, interval: Interval) {
        let surface_params = surface.params();
        let flush_info = surface_params.from_interval(interval);
        debug_assert!(
            interval.start >= surface_params.addr && interval.end <= surface_params.end
        );

        let staging_size = (flush_info.width
            * flush_info.height
            * flush_info.pixel_format.host_bytes_per_pixel()) as usize;
        let mut staging = self.runtime.find_staging(staging_size, false);

        let download = BufferTextureCopy {
            buffer_size: staging_size,
            texture_rect: surface_params.sub_rect(&flush_info),
            texture_level: 0,
        };
        surface.0.borrow().download(&mut self.runtime, &download, &mut staging);

        let convert = self.runtime.needs_component_reorder()
            && matches!(
                surface_params.pixel_format,
                PixelFormat::Rgba8 | PixelFormat::Rgb8
            );

        let Some(guest) = self.memory.phys_region_mut(flush_info.addr) else {
            warn!("download to unmapped guest address 0x{:X}", flush_info.addr);
            return;
        };
        let region_bytes = flush_info.size as usize;
        if guest.len() < region_bytes {
            warn!("download target at 0x{:X} truncated by memory region", flush_info.addr);
            return;
        }

        // Encode only the requested sub-range of the downloaded region.
        let start = (interval.start - flush_info.addr) as usize;
        let end = (interval.end - flush_info.addr) as usize;
        if let Err(err) = encode_texture(
            &flush_info,
            &staging.data[..staging_size],
            &mut guest[..region_bytes],
            start,
            end,
            convert,
        ) {
            error!("{err}");
        }
        self.runtime.recycle_staging(staging);
    }

    /// Write a fill surface's repeating pattern directly to guest memory,
    /// keeping the pattern phase relative to the surface base.
    fn download_fill_surface(&mut self, surface: &SurfaceRef, interval: Interval) {
        let (surface_addr, fill_size, fill_data) = {
            let surface = surface.0.borrow();
            (surface.params.addr, surface.fill_size, surface.fill_data)
        };
        debug_assert!(fill_size > 0);

        let Some(guest) = self.memory.phys_region_mut(interval.start) else {
            warn!("fill flush to unmapped guest address 0x{:X}", interval.start);
            return;
        };
        let len = (interval.len() as usize).min(guest.len());
        let phase = ((interval.start - surface_addr) % fill_size) as usize;
        for (i, byte) in guest[..len].iter_mut().enumerate() {
            *byte = fill_data[(phase + i) % fill_size as usize];
        }
    }

    /// False when another surface of the same bit width covers the interval
    /// but no reinterpreter exists for it.
    fn no_unimplemented_reinterpretations(
        &self,
        surface: &SurfaceRef,
        params: SurfaceParams,
        interval: Interval,
    ) -> bool {
        let dest_format = surface.params().pixel_format;
        let bpp = surface.params().bpp();
        let mut implemented = true;
        for format in ALL_FORMATS {
            if format.bpp() != bpp || format == dest_format {
                continue;
            }
            let mut probe = params;
            probe.pixel_format = format;
            if self
                .find_match(&probe, MatchFlags::COPY, ScaleMatch::Ignore, Some(interval))
                .is_some()
            {
                warn!("missing pixel format reinterpreter: {format:?} -> {dest_format:?}");
                implemented = false;
            }
        }
        implemented
    }

    /// True when a surface with an invalid pixel format overlaps the
    /// interval.
    fn interval_has_invalid_format(&self, interval: Interval) -> bool {
        for surface in self.surface_cache.values_overlapping(interval) {
            if surface.params().pixel_format == PixelFormat::Invalid {
                debug!(
                    "surface 0x{:X} has invalid pixel format",
                    surface.params().addr
                );
                return true;
            }
        }
        false
    }

    /// Find a reinterpretable source surface and use it to validate
    /// `interval` of `surface` on the GPU.
    fn validate_by_reinterpretation(
        &mut self,
        surface: &SurfaceRef,
        params: SurfaceParams,
        interval: Interval,
    ) -> bool {
        let dest_format = surface.params().pixel_format;
        for source_format in self.runtime.reinterpretation_sources(dest_format) {
            let mut probe = params;
            probe.pixel_format = source_format;
            let Some(reinterpret_surface) =
                self.find_match(&probe, MatchFlags::COPY, ScaleMatch::Ignore, Some(interval))
            else {
                continue;
            };

            let reinterpret_interval =
                reinterpret_surface.0.borrow().get_copyable_interval(&probe);
            let reinterpret_params = surface.params().from_interval(reinterpret_interval);
            let src_rect = reinterpret_surface
                .params()
                .scaled_sub_rect(&reinterpret_params);
            let dst_rect = surface.params().scaled_sub_rect(&reinterpret_params);

            let src_alloc = reinterpret_surface.0.borrow().alloc.clone();
            let dst_alloc = surface.0.borrow().alloc.clone();
            let (Some(src), Some(dst)) = (src_alloc, dst_alloc) else {
                continue;
            };
            if self.runtime.reinterpret(&src, src_rect, &dst, dst_rect) {
                return true;
            }
        }
        false
    }

    // ── GPU-side copies ────────────────────────────────────────────────────

    /// Copy `copy_interval` of `src` into `dst` on the GPU: a scissored
    /// clear for fill sources, a blit otherwise. Only called when
    /// `src.can_copy(dst, copy_interval)` holds.
    fn copy_surface(&mut self, src: &SurfaceRef, dst: &SurfaceRef, copy_interval: Interval) {
        debug_assert!(src != dst);
        let dst_params = dst.params();
        let subrect_params = dst_params.from_interval(copy_interval);
        debug_assert_eq!(subrect_params.interval(), copy_interval);

        let src_surface = src.0.borrow();
        if src_surface.params.surface_type == SurfaceType::Fill {
            // Cycle the fill pattern to the phase at which it crosses the
            // destination rectangle.
            let fill_offset = (copy_interval.start - src_surface.params.addr) % src_surface.fill_size;
            let mut fill_buffer = [0u8; 4];
            for (i, byte) in fill_buffer.iter_mut().enumerate() {
                *byte = src_surface.fill_data
                    [((fill_offset as usize + i) % src_surface.fill_size as usize)];
            }

            let Some(value) =
                make_clear_value(dst_params.surface_type, dst_params.pixel_format, &fill_buffer)
            else {
                error!(
                    "no clear value for fill into {:?} surface",
                    dst_params.pixel_format
                );
                return;
            };
            let clear = TextureClear {
                texture_level: 0,
                texture_rect: dst_params.scaled_sub_rect(&subrect_params),
                value,
            };
            if let Some(alloc) = &dst.0.borrow().alloc {
                self.runtime.clear_texture(alloc, &clear);
            }
            return;
        }

        if src_surface.params.can_sub_rect(&subrect_params) {
            let blit = TextureBlit {
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: 0,
                src_rect: src_surface.params.scaled_sub_rect(&subrect_params),
                dst_rect: dst_params.scaled_sub_rect(&subrect_params),
            };
            let src_alloc = src_surface.alloc.clone();
            let dst_alloc = dst.0.borrow().alloc.clone();
            if let (Some(src_alloc), Some(dst_alloc)) = (src_alloc, dst_alloc) {
                self.runtime.blit_textures(&src_alloc, &dst_alloc, &blit);
            }
            return;
        }

        unreachable!("copy_surface called without a valid copy strategy");
    }

    /// Copy all of `src`'s content and dirty ownership into the encompassing
    /// surface `dest`.
    fn duplicate_surface(&mut self, src: &SurfaceRef, dest: &SurfaceRef) {
        let src_params = src.params();
        let dest_params = dest.params();
        debug_assert!(dest_params.addr <= src_params.addr && dest_params.end >= src_params.end);

        let src_rect = src_params.scaled_rect();
        let dst_rect = dest_params.scaled_sub_rect(&src_params);
        debug_assert_eq!(src_rect.width(), dst_rect.width());

        let src_alloc = src.0.borrow().alloc.clone();
        let dst_alloc = dest.0.borrow().alloc.clone();
        if let (Some(src_alloc), Some(dst_alloc)) = (src_alloc, dst_alloc) {
            let copy = TextureCopy {
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: 0,
                src_offset: (0, 0),
                dst_offset: (dst_rect.left, dst_rect.bottom),
                extent: (src_rect.width(), src_rect.height()),
            };
            self.runtime.copy_textures(&src_alloc, &dst_alloc, &copy);
        }

        {
            let src_invalid = src.0.borrow().invalid_regions.clone();
            let mut dest_surface = dest.0.borrow_mut();
            dest_surface.invalid_regions.remove(src_params.interval());
            dest_surface.invalid_regions.union_set(&src_invalid);
        }

        // Dirty ranges owned by the source are now owned by the duplicate.
        let mut owned = IntervalSet::new();
        for (dirty_interval, owner) in self.dirty_regions.overlapping(src_params.interval()) {
            if owner == *src {
                owned.insert(dirty_interval);
            }
        }
        for dirty_interval in owned.iter().collect::<Vec<_>>() {
            self.dirty_regions.set(dirty_interval, dest.clone());
        }
    }

    // ── Flush and invalidate ───────────────────────────────────────────────

    /// Write dirty ranges overlapping the region back to guest memory. When
    /// `restrict_to` is set, only that surface's ranges are flushed.
    pub fn flush_region(&mut self, addr: PAddr, size: u32, restrict_to: Option<&SurfaceRef>) {
        if size == 0 {
            return;
        }
        let flush_interval = Interval::sized(addr, size);
        let mut flushed = IntervalSet::new();

        for (dirty_interval, owner) in self.dirty_regions.overlapping(flush_interval) {
            // Small flushes are CPU reads; widen them to the whole dirty
            // range to avoid thousands of single-word flushes per frame.
            // Anything larger than 8 bytes comes from a service.
            let interval = if size <= 8 {
                dirty_interval
            } else {
                dirty_interval.intersect(flush_interval)
            };
            if let Some(restrict) = restrict_to {
                if owner != *restrict {
                    continue;
                }
            }
            assert!(
                owner.0.borrow().is_region_valid(interval),
                "dirty region owner has stale content over {interval:?}"
            );

            trace!("flushing {interval:?} from {owner:?}");
            if owner.params().surface_type == SurfaceType::Fill {
                self.download_fill_surface(&owner, interval);
            } else {
                self.download_surface(&owner, interval);
            }
            flushed.insert(interval);
        }

        for interval in flushed.iter().collect::<Vec<_>>() {
            self.dirty_regions.erase(interval);
        }
    }

    pub fn flush_all(&mut self) {
        self.flush_region(0, u32::MAX, None);
    }

    /// Mark a region as rewritten by `region_owner`, or by the guest CPU
    /// when `region_owner` is `None`. Every other overlapping surface's
    /// content becomes stale.
    pub fn invalidate_region(&mut self, addr: PAddr, size: u32, region_owner: Option<&SurfaceRef>) {
        if size == 0 {
            return;
        }
        let invalid_interval = Interval::sized(addr, size);

        if let Some(owner) = region_owner {
            let owner_params = owner.params();
            assert!(owner_params.surface_type != SurfaceType::Texture);
            assert!(addr >= owner_params.addr && addr + size <= owner_params.end);
            // Surfaces cannot have gaps.
            assert!(owner_params.width == owner_params.stride);
            owner.0.borrow_mut().invalid_regions.remove(invalid_interval);
        }

        for surface in self.surface_cache.values_overlapping(invalid_interval) {
            if Some(&surface) == region_owner {
                continue;
            }

            // A small ownerless invalidation is a CPU write; flush and drop
            // the surface so its pages can be unmarked.
            if region_owner.is_none() && size <= 8 {
                let surface_params = surface.params();
                self.flush_region(surface_params.addr, surface_params.size, Some(&surface));
                self.schedule_removal(surface);
                continue;
            }

            let interval = surface.params().interval().intersect(invalid_interval);
            {
                let mut surface_mut = surface.0.borrow_mut();
                surface_mut.invalid_regions.insert(interval);
                surface_mut.invalidate_watchers();
            }

            // Fully stale surfaces only clog the index.
            if surface.0.borrow().is_fully_invalid() {
                self.schedule_removal(surface);
            }
        }

        if let Some(owner) = region_owner {
            self.dirty_regions.set(invalid_interval, owner.clone());
        } else {
            self.dirty_regions.erase(invalid_interval);
        }

        let to_remove = std::mem::take(&mut self.remove_surfaces);
        for surface in to_remove {
            if Some(&surface) == region_owner {
                // The owner was scheduled for removal by an expansion; move
                // its content into the encompassing surface if that loses no
                // validity, otherwise keep it registered.
                let expanded = self.find_match(
                    &surface.params(),
                    MatchFlags::SUB_RECT | MatchFlags::INVALID,
                    ScaleMatch::Ignore,
                    None,
                );
                let Some(expanded) = expanded else {
                    panic!("expanded surface disappeared before owner removal");
                };
                if expanded == surface {
                    continue;
                }
                let mut missing = surface.0.borrow().invalid_regions.clone();
                missing.subtract_set(&expanded.0.borrow().invalid_regions);
                if missing.is_empty() {
                    self.duplicate_surface(&surface, &expanded);
                } else {
                    continue;
                }
            }
            self.unregister_surface(&surface);
        }
    }

    /// Flush everything and drop every cached resource.
    pub fn clear_all(&mut self, flush: bool) {
        if flush {
            self.flush_all();
        }

        // Unmark every page the cache was mirroring.
        for (pages, _) in self.cached_pages.iter().collect::<Vec<_>>() {
            self.memory.mark_region_cached(
                pages.start << PAGE_BITS,
                pages.len() << PAGE_BITS,
                false,
            );
        }

        self.cached_pages.clear();
        self.dirty_regions.clear();
        self.surface_cache.clear();
        self.remove_surfaces.clear();
        self.texture_cube_cache.clear();
        self.render_targets = RenderTargets::default();
    }

    // ── Match search ───────────────────────────────────────────────────────

    /// The best surface intersecting `params` for the requested match kinds.
    /// Preference order: higher resolution scale, then currently-valid
    /// content, then longest matched interval.
    fn find_match(
        &self,
        params: &SurfaceParams,
        flags: MatchFlags,
        match_scale: ScaleMatch,
        validate_interval: Option<Interval>,
    ) -> Option<SurfaceRef> {
        let mut match_surface: Option<SurfaceRef> = None;
        let mut match_valid = false;
        let mut match_res_scale: u16 = 0;
        let mut match_interval = Interval::default();

        for surface in self.surface_cache.values_overlapping(params.interval()) {
            let surface_params = surface.params();
            let res_scale_matched = match match_scale {
                ScaleMatch::Exact => params.res_scale == surface_params.res_scale,
                _ => params.res_scale <= surface_params.res_scale,
            };
            // Copy candidates check validity through their copyable
            // interval instead.
            let is_valid = flags.contains(MatchFlags::COPY)
                || surface
                    .0
                    .borrow()
                    .is_region_valid(validate_interval.unwrap_or_else(|| params.interval()));
            if !flags.contains(MatchFlags::INVALID) && !is_valid {
                continue;
            }

            let mut offer = |surface_interval: Interval,
                             match_surface: &mut Option<SurfaceRef>,
                             match_valid: &mut bool,
                             match_res_scale: &mut u16,
                             match_interval: &mut Interval| {
                if !res_scale_matched
                    && match_scale != ScaleMatch::Ignore
                    && surface_params.surface_type != SurfaceType::Fill
                {
                    return;
                }
                let better = if surface_params.res_scale != *match_res_scale {
                    surface_params.res_scale > *match_res_scale
                } else if is_valid != *match_valid {
                    is_valid
                } else {
                    surface_interval.len() > match_interval.len()
                };
                if better {
                    *match_surface = Some(surface.clone());
                    *match_valid = is_valid;
                    *match_res_scale = surface_params.res_scale;
                    *match_interval = surface_interval;
                }
            };

            if flags.contains(MatchFlags::EXACT) && surface_params.exact_match(params) {
                offer(
                    surface_params.interval(),
                    &mut match_surface,
                    &mut match_valid,
                    &mut match_res_scale,
                    &mut match_interval,
                );
            }
            if flags.contains(MatchFlags::SUB_RECT) && surface_params.can_sub_rect(params) {
                offer(
                    surface_params.interval(),
                    &mut match_surface,
                    &mut match_valid,
                    &mut match_res_scale,
                    &mut match_interval,
                );
            }
            if flags.contains(MatchFlags::COPY) {
                let validate = validate_interval
                    .expect("copy matching requires a validate interval");
                let copy_interval = surface
                    .0
                    .borrow()
                    .get_copyable_interval(&params.from_interval(validate));
                let matched = copy_interval.intersect(validate).len() != 0
                    && surface.0.borrow().can_copy(params, copy_interval);
                if matched {
                    offer(
                        copy_interval,
                        &mut match_surface,
                        &mut match_valid,
                        &mut match_res_scale,
                        &mut match_interval,
                    );
                }
            }
            if flags.contains(MatchFlags::EXPAND) && surface_params.can_expand(params) {
                offer(
                    surface_params.interval(),
                    &mut match_surface,
                    &mut match_valid,
                    &mut match_res_scale,
                    &mut match_interval,
                );
            }
            if flags.contains(MatchFlags::TEX_COPY) && surface_params.can_tex_copy(params) {
                offer(
                    surface_params.interval(),
                    &mut match_surface,
                    &mut match_valid,
                    &mut match_res_scale,
                    &mut match_interval,
                );
            }
        }
        match_surface
    }

    // ── Registration and bookkeeping ───────────────────────────────────────

    /// Create a surface with a fresh host allocation. The new surface is
    /// fully invalid until validated.
    fn create_surface(&mut self, params: SurfaceParams) -> Option<SurfaceRef> {
        let alloc = if params.surface_type == SurfaceType::Fill {
            None
        } else {
            match self.runtime.allocate(&params) {
                Some(alloc) => Some(alloc),
                None => {
                    error!("host texture allocation refused for {params:?}");
                    return None;
                }
            }
        };
        let mut surface = Surface::new(
            params,
            alloc,
            Some(self.runtime.recycler().clone()),
        );
        surface.invalid_regions.insert(params.interval());
        Some(SurfaceRef::new(surface))
    }

    fn register_surface(&mut self, surface: &SurfaceRef) {
        if surface.0.borrow().registered {
            return;
        }
        surface.0.borrow_mut().registered = true;
        let params = surface.params();
        trace!("registering {surface:?}");
        self.surface_cache.add(params.interval(), surface.clone());
        self.update_pages_cached_count(params.addr, params.size, 1);
    }

    fn unregister_surface(&mut self, surface: &SurfaceRef) {
        if !surface.0.borrow().registered {
            return;
        }
        surface.0.borrow_mut().registered = false;
        let params = surface.params();
        trace!("unregistering {surface:?}");
        self.update_pages_cached_count(params.addr, params.size, -1);
        self.surface_cache.remove(params.interval(), surface);
    }

    fn schedule_removal(&mut self, surface: SurfaceRef) {
        if !self.remove_surfaces.contains(&surface) {
            self.remove_surfaces.push(surface);
        }
    }

    /// Maintain the per-page refcount of cached surfaces, notifying the
    /// memory system on 0 <-> positive transitions. Negative deltas are
    /// applied after the scan so the transition is observed before the
    /// interval disappears.
    fn update_pages_cached_count(&mut self, addr: PAddr, size: u32, delta: i32) {
        let page_start = addr >> PAGE_BITS;
        let page_end = ((addr + size - 1) >> PAGE_BITS) + 1;
        let pages = Interval::new(page_start, page_end);

        if delta > 0 {
            self.cached_pages.add(pages, delta);
        }

        for (pages_interval, count) in self.cached_pages.overlapping(pages) {
            let interval_start = pages_interval.start << PAGE_BITS;
            let interval_size = pages_interval.len() << PAGE_BITS;
            if delta > 0 && count == delta {
                self.memory.mark_region_cached(interval_start, interval_size, true);
            } else if delta < 0 && count == -delta {
                self.memory.mark_region_cached(interval_start, interval_size, false);
            } else {
                assert!(count >= 0, "negative page refcount");
            }
        }

        if delta < 0 {
            self.cached_pages.add(pages, delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::runtime::null::NullRuntime;
    use super::runtime::software::SoftwareRuntime;
    use super::runtime::StagingData;
    use super::*;
    use crate::memory::FlatMemory;

    type TestCache = RasterizerCache<FlatMemory, SoftwareRuntime>;

    fn make_cache() -> TestCache {
        RasterizerCache::new(FlatMemory::new(0, 4 << 20), SoftwareRuntime::new(), 1)
    }

    fn color_params(addr: PAddr, width: u32, height: u32, tiled: bool) -> SurfaceParams {
        let mut params = SurfaceParams {
            addr,
            width,
            height,
            is_tiled: tiled,
            pixel_format: PixelFormat::Rgba8,
            ..Default::default()
        };
        params.update();
        params
    }

    /// Paint a surface's host texture directly through the runtime.
    fn paint_surface(cache: &mut TestCache, surface: &SurfaceRef, byte: u8) -> Vec<u8> {
        let params = surface.params();
        let alloc = surface.0.borrow().alloc.clone().unwrap();
        let pixels =
            vec![byte; (params.scaled_width() * params.scaled_height() * 4) as usize];
        let staging = StagingData {
            size: pixels.len(),
            data: pixels.clone(),
        };
        let copy = BufferTextureCopy {
            buffer_size: staging.size,
            texture_rect: Rectangle::new(0, params.scaled_height(), params.scaled_width(), 0),
            texture_level: 0,
        };
        cache.runtime_mut().upload(&alloc, &copy, &staging);
        pixels
    }

    #[test]
    fn test_rejects_degenerate_params() {
        let mut cache = make_cache();
        let zero = color_params(0, 64, 64, false);
        assert!(cache.get_surface(&zero, ScaleMatch::Ignore, false).is_none());

        let mut gapped = color_params(0x1000, 32, 32, false);
        gapped.stride = 64;
        gapped.update();
        assert!(cache.get_surface(&gapped, ScaleMatch::Ignore, false).is_none());

        let mut unaligned = color_params(0x1000, 60, 60, true);
        unaligned.stride = 60;
        assert!(cache.get_surface(&unaligned, ScaleMatch::Ignore, false).is_none());
        assert!(cache.surface_cache.is_empty());
    }

    #[test]
    fn test_fill_then_flush_writes_pattern() {
        let mut cache = make_cache();
        cache.memory().write(0x1000, &[0x55; 0x1000]);

        let config = MemoryFillConfig {
            start: 0x1000,
            end: 0x2000,
            value: 0xDEAD_BEEF,
            fill_width: FillWidth::Bits32,
        };
        assert!(cache.accelerate_fill(&config));

        cache.flush_region(0x1000, 0x1000, None);
        let bytes = cache.memory().read(0x1000, 0x1000).to_vec();
        for chunk in bytes.chunks(4) {
            assert_eq!(chunk, &[0xEF, 0xBE, 0xAD, 0xDE]);
        }
        assert!(cache
            .dirty_regions
            .overlapping(Interval::new(0x1000, 0x2000))
            .is_empty());
    }

    #[test]
    fn test_fill_24bit_pattern_phase() {
        let mut cache = make_cache();
        let config = MemoryFillConfig {
            start: 0x1000,
            end: 0x1030,
            value: 0x00CC_BBAA,
            fill_width: FillWidth::Bits24,
        };
        assert!(cache.accelerate_fill(&config));

        cache.flush_region(0x1000, 0x30, None);
        let pattern = [0xAA, 0xBB, 0xCC];
        let bytes = cache.memory().read(0x1000, 0x30).to_vec();
        for (i, byte) in bytes.iter().enumerate() {
            assert_eq!(*byte, pattern[i % 3], "byte {i}");
        }
    }

    #[test]
    fn test_sub_rect_returns_scaled_rect() {
        let mut cache = make_cache();
        let mut params = color_params(0x10000, 64, 64, true);
        params.res_scale = 2;
        let a = cache.get_surface(&params, ScaleMatch::Exact, false).unwrap();
        cache.invalidate_region(0x10000, 64 * 64 * 4, Some(&a));

        let mut sub = color_params(0x10000, 32, 32, true);
        sub.stride = 64;
        sub.res_scale = 2;
        sub.update();
        let (surface, rect) = cache
            .get_surface_sub_rect(&sub, ScaleMatch::Upscale, true)
            .unwrap();
        assert!(surface == a);
        assert_eq!(rect, Rectangle::new(0, 128, 64, 64));
    }

    #[test]
    fn test_cpu_write_invalidation_removes_surface() {
        let mut cache = make_cache();
        let mut params = color_params(0x10000, 64, 64, true);
        params.res_scale = 2;
        let a = cache.get_surface(&params, ScaleMatch::Exact, false).unwrap();
        cache.invalidate_region(0x10000, 64 * 64 * 4, Some(&a));

        // A 4-byte ownerless invalidation is a CPU write: flush and drop.
        cache.invalidate_region(0x10004, 4, None);
        assert!(!a.0.borrow().registered);
        assert!(cache
            .dirty_regions
            .overlapping(Interval::sized(0x10000, 64 * 64 * 4))
            .is_empty());

        let b = cache.get_surface(&params, ScaleMatch::Ignore, true).unwrap();
        assert!(b != a);
        assert!(b.0.borrow().invalid_regions.is_empty());
    }

    #[test]
    fn test_expansion_copies_content() {
        let mut cache = make_cache();
        let b_params = color_params(0x20000, 64, 64, false);
        let b = cache.get_surface(&b_params, ScaleMatch::Ignore, false).unwrap();
        cache.invalidate_region(0x20000, 64 * 64 * 4, Some(&b));
        paint_surface(&mut cache, &b, 0xAB);

        // One extra row before B, same format and stride.
        let req = color_params(0x20000 - 64 * 4, 64, 65, false);
        let (c, _rect) = cache
            .get_surface_sub_rect(&req, ScaleMatch::Upscale, false)
            .unwrap();
        assert!(c != b);
        assert_eq!(
            c.params().interval(),
            Interval::new(0x20000 - 64 * 4, 0x20000 + 64 * 64 * 4)
        );

        // B's content landed one row up in C.
        let c_alloc = c.0.borrow().alloc.clone().unwrap();
        let data = cache.runtime().level_data(&c_alloc, 0, 0);
        assert_eq!(&data[64 * 4..64 * 4 + 4], &[0xAB; 4]);
        assert_eq!(&data[..4], &[0; 4]);

        // B stays registered until the next invalidation drains it.
        assert!(b.0.borrow().registered);
        cache.invalidate_region(c.params().addr, 16, Some(&c));
        assert!(!b.0.borrow().registered);
        assert!(c.0.borrow().registered);

        // Dirty ownership moved to C.
        let owners = cache
            .dirty_regions
            .overlapping(Interval::sized(0x20000, 0x100));
        assert!(!owners.is_empty());
        assert!(owners.iter().all(|(_, owner)| *owner == c));
    }

    fn cube_config(addrs: [PAddr; 6]) -> TextureCubeConfig {
        TextureCubeConfig {
            px: addrs[0],
            nx: addrs[1],
            py: addrs[2],
            ny: addrs[3],
            pz: addrs[4],
            nz: addrs[5],
            width: 8,
            format: PixelFormat::I8,
        }
    }

    #[test]
    fn test_cube_face_revalidation() {
        let mut cache = make_cache();
        let addrs = [0x30000, 0x30100, 0x30200, 0x30300, 0x30400, 0x30500];
        for (i, addr) in addrs.into_iter().enumerate() {
            cache.memory().write(addr, &[(i as u8 + 1) * 10; 64]);
        }
        let config = cube_config(addrs);

        {
            let cube = cache.get_texture_cube(&config).unwrap();
            assert!(cube.faces.iter().all(|face| face.is_some()));
            let alloc = cube.texture.clone().unwrap();
            let layer3 = cache.runtime().level_data(&alloc, 3, 0);
            assert_eq!(&layer3[..4], &[40, 40, 40, 255]);
        }

        // Partially invalidate face 0 (large enough to avoid the CPU-write
        // removal heuristic).
        cache.invalidate_region(addrs[0], 16, None);
        {
            let cube = cache.texture_cube_cache.get(&config).unwrap();
            assert!(!cube.faces[0].as_ref().unwrap().borrow().is_valid());
            assert!(cube.faces[1].as_ref().unwrap().borrow().is_valid());
        }

        cache.memory().write(addrs[0], &[7; 64]);
        let cube = cache.get_texture_cube(&config).unwrap();
        let alloc = cube.texture.clone().unwrap();
        let layer0 = cache.runtime().level_data(&alloc, 0, 0);
        assert_eq!(&layer0[..4], &[7, 7, 7, 255]);
        let layer1 = cache.runtime().level_data(&alloc, 1, 0);
        assert_eq!(&layer1[..4], &[20, 20, 20, 255]);
    }

    #[test]
    fn test_reinterpretation_avoids_guest_upload() {
        let mut cache = make_cache();
        let mut d_params = color_params(0x40000, 64, 64, true);
        d_params.pixel_format = PixelFormat::D24S8;
        d_params.update();
        let d = cache.get_surface(&d_params, ScaleMatch::Ignore, false).unwrap();
        cache.invalidate_region(0x40000, d_params.size, Some(&d));
        let pattern = paint_surface(&mut cache, &d, 0x77);

        // Guest memory stays zeroed: an upload fallback would wipe the
        // depth content with zeros.
        let e_params = color_params(0x40000, 64, 64, true);
        let e = cache.get_surface(&e_params, ScaleMatch::Ignore, true).unwrap();
        assert!(e.0.borrow().invalid_regions.is_empty());

        let e_alloc = e.0.borrow().alloc.clone().unwrap();
        assert_eq!(cache.runtime().level_data(&e_alloc, 0, 0), &pattern[..]);
    }

    #[test]
    fn test_validation_skips_gpu_only_regions() {
        let mut cache = make_cache();
        let a_params = color_params(0x50000, 64, 64, true);
        let a = cache.get_surface(&a_params, ScaleMatch::Ignore, false).unwrap();
        cache.invalidate_region(0x50000, a_params.size, Some(&a));

        // A 16-bit surface over GPU-written bytes: no copy, no
        // reinterpreter, no same-width candidate. The upload fallback must
        // be skipped to avoid wiping GPU content.
        let mut b_params = color_params(0x50000, 64, 64, true);
        b_params.pixel_format = PixelFormat::D16;
        b_params.update();
        let b = cache.get_surface(&b_params, ScaleMatch::Ignore, true).unwrap();
        assert!(b.0.borrow().invalid_regions.covers(b_params.interval()));
    }

    #[test]
    fn test_guest_round_trip_preserves_bytes() {
        let mut cache = make_cache();
        let params = color_params(0x60000, 16, 16, true);
        let pattern: Vec<u8> = (0..params.size).map(|i| (i % 251) as u8).collect();
        cache.memory().write(0x60000, &pattern);

        let surface = cache.get_surface(&params, ScaleMatch::Ignore, true).unwrap();
        assert!(surface.0.borrow().invalid_regions.is_empty());

        // Clobber guest memory, then write the surface back.
        cache.memory().write(0x60000, &vec![0xFF; params.size as usize]);
        cache.invalidate_region(0x60000, params.size, Some(&surface));
        cache.flush_region(0x60000, params.size, None);
        assert_eq!(cache.memory().read(0x60000, params.size), &pattern[..]);
    }

    #[test]
    fn test_invalidate_marks_other_surfaces_stale() {
        let mut cache = make_cache();
        let params = color_params(0x70000, 64, 64, false);
        let surface = cache.get_surface(&params, ScaleMatch::Ignore, true).unwrap();
        assert!(surface.0.borrow().invalid_regions.is_empty());

        cache.invalidate_region(0x70000, 0x100, None);
        assert!(surface
            .0
            .borrow()
            .invalid_regions
            .covers(Interval::sized(0x70000, 0x100)));
        assert!(surface.0.borrow().registered);

        // Invalidating the whole range drops the now fully stale surface.
        cache.invalidate_region(0x70000, params.size, None);
        assert!(!surface.0.borrow().registered);
    }

    #[test]
    fn test_page_cache_marks() {
        let mut cache = make_cache();
        let params = color_params(0x61000, 64, 64, false);
        let _surface = cache.get_surface(&params, ScaleMatch::Ignore, false).unwrap();
        assert!(cache
            .memory()
            .cache_marks
            .contains(&(0x61000, 0x4000, true)));

        // A second surface sharing the last page only marks the new pages.
        let params2 = color_params(0x64000, 64, 64, false);
        let _surface2 = cache.get_surface(&params2, ScaleMatch::Ignore, false).unwrap();
        assert!(cache
            .memory()
            .cache_marks
            .contains(&(0x65000, 0x3000, true)));
        assert!(!cache.memory().cache_marks.contains(&(0x64000, 0x1000, true)));

        cache.clear_all(false);
        assert!(cache
            .memory()
            .cache_marks
            .iter()
            .any(|&(_, _, cached)| !cached));
        assert!(cache.cached_pages.is_empty());
        assert!(cache.surface_cache.is_empty());
    }

    #[test]
    fn test_null_runtime_refuses_surfaces() {
        let mut cache = RasterizerCache::new(
            FlatMemory::new(0, 1 << 20),
            NullRuntime::new(),
            1,
        );
        let params = color_params(0x1000, 8, 8, false);
        assert!(cache.get_surface(&params, ScaleMatch::Ignore, false).is_none());
        assert!(cache.surface_cache.is_empty());
        assert!(cache.cached_pages.is_empty());
    }

    #[test]
    fn test_accelerate_display_transfer() {
        let mut cache = make_cache();
        cache.memory().write(0x80000, &[0x5A; 64 * 64 * 4]);

        let config = DisplayTransferConfig {
            input_address: 0x80000,
            output_address: 0x90000,
            input_width: 64,
            output_width: 64,
            output_height: 64,
            input_format: PixelFormat::Rgba8,
            output_format: PixelFormat::Rgba8,
            input_linear: false,
            dont_swizzle: false,
            scaling: ScalingMode::NoScale,
            flip_vertically: false,
            texture_copy: TextureCopyConfig::default(),
        };
        assert!(cache.accelerate_display_transfer(&config));

        cache.flush_region(0x90000, 64 * 64 * 4, None);
        assert_eq!(
            cache.memory().read(0x90000, 64 * 64 * 4),
            &[0x5A; 64 * 64 * 4][..]
        );
    }

    #[test]
    fn test_accelerate_display_transfer_rejects_format_mix() {
        let mut cache = make_cache();
        let config = DisplayTransferConfig {
            input_address: 0x80000,
            output_address: 0x90000,
            input_width: 64,
            output_width: 64,
            output_height: 64,
            input_format: PixelFormat::Rgba8,
            output_format: PixelFormat::D24S8,
            input_linear: false,
            dont_swizzle: false,
            scaling: ScalingMode::NoScale,
            flip_vertically: false,
            texture_copy: TextureCopyConfig::default(),
        };
        assert!(!cache.accelerate_display_transfer(&config));
    }

    #[test]
    fn test_accelerate_texture_copy() {
        let mut cache = make_cache();
        cache.memory().write(0xA0000, &[0x3C; 64 * 64 * 4]);
        let src_params = color_params(0xA0000, 64, 64, false);
        cache.get_surface(&src_params, ScaleMatch::Ignore, true).unwrap();

        let config = DisplayTransferConfig {
            input_address: 0xA0000,
            output_address: 0xB0000,
            input_width: 0,
            output_width: 0,
            output_height: 0,
            input_format: PixelFormat::Rgba8,
            output_format: PixelFormat::Rgba8,
            input_linear: true,
            dont_swizzle: true,
            scaling: ScalingMode::NoScale,
            flip_vertically: false,
            texture_copy: TextureCopyConfig {
                size: 64 * 64 * 4,
                input_width: 0,
                input_gap: 0,
                output_width: 0,
                output_gap: 0,
            },
        };
        assert!(cache.accelerate_texture_copy(&config));

        cache.flush_region(0xB0000, 64 * 64 * 4, None);
        assert_eq!(
            cache.memory().read(0xB0000, 64 * 64 * 4),
            &[0x3C; 64 * 64 * 4][..]
        );
    }

    #[test]
    fn test_accelerate_texture_copy_rejects_bad_gap() {
        let mut cache = make_cache();
        let config = DisplayTransferConfig {
            input_address: 0xA0000,
            output_address: 0xB0000,
            input_width: 0,
            output_width: 0,
            output_height: 0,
            input_format: PixelFormat::Rgba8,
            output_format: PixelFormat::Rgba8,
            input_linear: true,
            dont_swizzle: true,
            scaling: ScalingMode::NoScale,
            flip_vertically: false,
            texture_copy: TextureCopyConfig {
                size: 0x1000,
                input_width: 0,
                input_gap: 16, // gap without width
                output_width: 0,
                output_gap: 0,
            },
        };
        assert!(!cache.accelerate_texture_copy(&config));

        let zero = DisplayTransferConfig {
            texture_copy: TextureCopyConfig {
                size: 8, // below the 16-byte granularity
                ..Default::default()
            },
            ..config
        };
        assert!(!cache.accelerate_texture_copy(&zero));
    }

    #[test]
    fn test_texture_surface_with_mips() {
        let mut cache = make_cache();
        // 16x16 I8 base, 8x8 level 1 stored contiguously after it.
        cache.memory().write(0xC0000, &[0x20; 256]);
        cache.memory().write(0xC0100, &[0x40; 64]);

        let info = TextureInfo {
            physical_address: 0xC0000,
            width: 16,
            height: 16,
            format: PixelFormat::I8,
        };
        let surface = cache.get_texture_surface(&info, 1).unwrap();
        assert!(surface.0.borrow().level_watchers[0]
            .as_ref()
            .unwrap()
            .borrow()
            .is_valid());

        let alloc = surface.0.borrow().alloc.clone().unwrap();
        let level1 = cache.runtime().level_data(&alloc, 0, 1);
        assert_eq!(level1.len(), 8 * 8 * 4);
        assert!(level1.chunks(4).all(|texel| texel == [0x40, 0x40, 0x40, 255]));
    }

    #[test]
    fn test_texture_surface_rejects_bad_mip_geometry() {
        let mut cache = make_cache();
        let info = TextureInfo {
            physical_address: 0xC0000,
            width: 16,
            height: 16,
            format: PixelFormat::I8,
        };
        // Level 1 of a 16x16 texture is 8x8; level 2 would be 4x4.
        assert!(cache.get_texture_surface(&info, 2).is_none());
    }

    #[test]
    fn test_framebuffer_surfaces_and_invalidate() {
        let mut cache = make_cache();
        let config = FramebufferConfig {
            color_address: 0xD0000,
            depth_address: 0xE0000,
            width: 64,
            height: 64,
            color_format: PixelFormat::Rgba8,
            depth_format: PixelFormat::D24S8,
            viewport: Rectangle::new(0, 64, 64, 0),
        };
        let fb = cache.get_framebuffer_surfaces(true, true, &config);
        let color = fb.color.clone().unwrap();
        let depth = fb.depth.clone().unwrap();
        assert_eq!(fb.rect, Rectangle::new(0, 64, 64, 0));

        cache.invalidate_framebuffer(&fb);
        let color_owners = cache
            .dirty_regions
            .overlapping(Interval::sized(0xD0000, 64 * 64 * 4));
        assert!(color_owners.iter().all(|(_, owner)| *owner == color));
        let depth_owners = cache
            .dirty_regions
            .overlapping(Interval::sized(0xE0000, 64 * 64 * 4));
        assert!(depth_owners.iter().all(|(_, owner)| *owner == depth));
    }

    #[test]
    fn test_framebuffer_overlap_drops_depth() {
        let mut cache = make_cache();
        let config = FramebufferConfig {
            color_address: 0xD0000,
            depth_address: 0xD0000,
            width: 64,
            height: 64,
            color_format: PixelFormat::Rgba8,
            depth_format: PixelFormat::D24S8,
            viewport: Rectangle::new(0, 64, 64, 0),
        };
        let fb = cache.get_framebuffer_surfaces(true, true, &config);
        assert!(fb.color.is_some());
        assert!(fb.depth.is_none());
    }

    #[test]
    fn test_resolution_scale_change_clears_cache() {
        let mut cache = make_cache();
        let params = color_params(0x10000, 64, 64, false);
        let surface = cache.get_surface(&params, ScaleMatch::Ignore, true).unwrap();
        assert!(surface.0.borrow().registered);

        cache.set_resolution_scale_factor(2);
        assert!(!surface.0.borrow().registered);
        assert!(cache.surface_cache.is_empty());
    }

    #[test]
    fn test_validate_copies_from_fill() {
        let mut cache = make_cache();
        let fill = MemoryFillConfig {
            start: 0x10000,
            end: 0x10000 + 64 * 64 * 4,
            value: 0xFF00_00FF, // guest A,B,G,R bytes FF 00 00 FF: opaque red
            fill_width: FillWidth::Bits32,
        };
        assert!(cache.accelerate_fill(&fill));

        // A color surface over the filled range validates with a GPU clear,
        // not a guest upload.
        let params = color_params(0x10000, 64, 64, false);
        let surface = cache.get_surface(&params, ScaleMatch::Ignore, true).unwrap();
        assert!(surface.0.borrow().invalid_regions.is_empty());

        let alloc = surface.0.borrow().alloc.clone().unwrap();
        let data = cache.runtime().level_data(&alloc, 0, 0);
        assert_eq!(&data[..4], &[0xFF, 0x00, 0x00, 0xFF]);
    }

    #[test]
    fn test_flush_restricted_to_surface() {
        let mut cache = make_cache();
        let a_params = color_params(0x10000, 64, 64, false);
        let a = cache.get_surface(&a_params, ScaleMatch::Ignore, false).unwrap();
        cache.invalidate_region(0x10000, a_params.size, Some(&a));

        let b_params = color_params(0x20000, 64, 64, false);
        let b = cache.get_surface(&b_params, ScaleMatch::Ignore, false).unwrap();
        cache.invalidate_region(0x20000, b_params.size, Some(&b));

        cache.flush_region(0x10000, 0x20000, Some(&a));
        assert!(cache
            .dirty_regions
            .overlapping(a_params.interval())
            .is_empty());
        assert!(!cache
            .dirty_regions
            .overlapping(b_params.interval())
            .is_empty());
    }
}
