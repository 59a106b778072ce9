// SPDX-FileCopyrightText: 2025 rpica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Cached surface entity.
//!
//! A [`Surface`] pairs a [`SurfaceParams`] descriptor with a host texture
//! allocation and tracks which byte ranges of the host content are stale
//! relative to guest memory. Fill surfaces carry a repeating byte pattern
//! instead of an allocation.
//!
//! Surfaces are shared: the cache indices, active render targets and cube /
//! mipmap watchers all hold references. Watchers hold weak references in
//! both directions so surface collections learn about content changes
//! without keeping surfaces alive.

use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::rc::{Rc, Weak};

use rpica_common::{align_down_mul, align_up_mul, PAddr};

use super::interval::{Interval, IntervalSet};
use super::pixel_format::{PixelFormat, SurfaceType};
use super::runtime::{
    Allocation, BufferTextureCopy, SharedRecycler, StagingData, TextureBlit, TextureRuntime,
};
use super::surface_params::SurfaceParams;

pub type WatcherRef = Rc<RefCell<SurfaceWatcher>>;

/// Notifies whether a cached surface has been changed. Used by cached
/// surface collections, including texture cubes and mipmap chains.
pub struct SurfaceWatcher {
    surface: Weak<RefCell<Surface>>,
    valid: bool,
}

impl SurfaceWatcher {
    /// Whether the watched surface still exists and has not changed since
    /// the last `validate`.
    pub fn is_valid(&self) -> bool {
        self.surface.strong_count() > 0 && self.valid
    }

    /// Mark the watcher's user as up to date with the surface content.
    pub fn validate(&mut self) {
        debug_assert!(self.surface.strong_count() > 0);
        self.valid = true;
    }

    /// The watched surface, or `None` if it has been destroyed.
    pub fn get(&self) -> Option<SurfaceRef> {
        self.surface.upgrade().map(SurfaceRef)
    }
}

/// Shared handle to a cached surface. Equality and hashing are by identity.
#[derive(Clone)]
pub struct SurfaceRef(pub Rc<RefCell<Surface>>);

impl SurfaceRef {
    pub fn new(surface: Surface) -> Self {
        Self(Rc::new(RefCell::new(surface)))
    }

    /// Copy of the surface's descriptor.
    pub fn params(&self) -> SurfaceParams {
        self.0.borrow().params
    }
}

impl Deref for SurfaceRef {
    type Target = Rc<RefCell<Surface>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for SurfaceRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SurfaceRef {}

impl Hash for SurfaceRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl std::fmt::Debug for SurfaceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let surface = self.0.borrow();
        write!(
            f,
            "Surface({:?}, {:?})",
            surface.params.interval(),
            surface.params.pixel_format
        )
    }
}

pub struct Surface {
    pub params: SurfaceParams,
    pub registered: bool,
    /// Byte ranges whose host content is stale relative to guest memory.
    pub invalid_regions: IntervalSet,

    /// Repeating pattern for fill surfaces; `fill_size` bytes of `fill_data`
    /// are meaningful.
    pub fill_size: u32,
    pub fill_data: [u8; 4],

    pub alloc: Option<Allocation>,
    recycler: Option<SharedRecycler>,

    /// `level_watchers[i]` watches the source surface of mip level `i + 1`.
    pub level_watchers: [Option<WatcherRef>; 7],
    watchers: Vec<Weak<RefCell<SurfaceWatcher>>>,
}

impl Surface {
    /// Cache-created surfaces are marked fully invalid by their creator; the
    /// validation protocol brings ranges up to date on demand. Fill surfaces
    /// start valid.
    pub fn new(params: SurfaceParams, alloc: Option<Allocation>, recycler: Option<SharedRecycler>) -> Self {
        Self {
            params,
            registered: false,
            invalid_regions: IntervalSet::new(),
            fill_size: 0,
            fill_data: [0; 4],
            alloc,
            recycler,
            level_watchers: Default::default(),
            watchers: Vec::new(),
        }
    }

    pub fn interval(&self) -> Interval {
        self.params.interval()
    }

    /// True when no byte of `interval` is stale on this surface.
    pub fn is_region_valid(&self, interval: Interval) -> bool {
        !self.invalid_regions.intersects(interval)
    }

    pub fn is_fully_invalid(&self) -> bool {
        self.invalid_regions.covers(self.interval())
    }

    /// True when this fill surface can produce the content of
    /// `fill_interval` interpreted as pixels of `dest`: the interval must be
    /// a rectangle of `dest` and the pattern must tile its pixels exactly.
    pub fn can_fill(&self, dest: &SurfaceParams, fill_interval: Interval) -> bool {
        if self.params.surface_type != SurfaceType::Fill
            || !self.is_region_valid(fill_interval)
            || fill_interval.start < self.params.addr
            || fill_interval.end > self.params.end
            || dest.from_interval(fill_interval).interval() != fill_interval
        {
            return false;
        }

        if self.fill_size * 8 != dest.bpp() {
            // The pattern must repeat within every destination pixel.
            let dest_bytes_per_pixel = (dest.bpp() / 8).max(1) as usize;
            let fill_size = self.fill_size as usize;
            let mut fill_test = vec![0u8; fill_size * dest_bytes_per_pixel];
            for i in 0..dest_bytes_per_pixel {
                fill_test[i * fill_size..(i + 1) * fill_size]
                    .copy_from_slice(&self.fill_data[..fill_size]);
            }
            for i in 1..fill_size {
                let at = dest_bytes_per_pixel * i;
                if fill_test[at..at + dest_bytes_per_pixel] != fill_test[..dest_bytes_per_pixel] {
                    return false;
                }
            }
            if dest.bpp() == 4 && (fill_test[0] & 0xF) != (fill_test[0] >> 4) {
                return false;
            }
        }
        true
    }

    /// True when this surface can validate `copy_interval` of `dest`, either
    /// as a sub-rectangle blit or as a fill.
    pub fn can_copy(&self, dest: &SurfaceParams, copy_interval: Interval) -> bool {
        let subrect_params = dest.from_interval(copy_interval);
        debug_assert_eq!(subrect_params.interval(), copy_interval);
        if self.params.can_sub_rect(&subrect_params) {
            return true;
        }
        self.can_fill(dest, copy_interval)
    }

    /// The largest sub-interval of this surface that is valid and projects
    /// onto a rectangle of `params`.
    pub fn get_copyable_interval(&self, params: &SurfaceParams) -> Interval {
        let mut result = Interval::default();
        let tile_align = params
            .bytes_in_pixels(if params.is_tiled { 8 * 8 } else { 1 })
            .max(1);

        let mut valid_regions =
            IntervalSet::from_interval(params.interval().intersect(self.interval()));
        valid_regions.subtract_set(&self.invalid_regions);

        for valid in valid_regions.iter() {
            let aligned = Interval::new(
                params.addr + align_up_mul(valid.start - params.addr, tile_align),
                params.addr + align_down_mul(valid.end - params.addr, tile_align),
            );
            if tile_align > valid.len() || aligned.len() == 0 {
                continue;
            }

            // Shrink to whole rows of the destination.
            let stride_bytes =
                params.bytes_in_pixels(params.stride).max(1) * if params.is_tiled { 8 } else { 1 };
            let mut rect_interval = Interval::new(
                params.addr + align_up_mul(aligned.start - params.addr, stride_bytes),
                params.addr + align_down_mul(aligned.end - params.addr, stride_bytes),
            );

            if rect_interval.start > rect_interval.end {
                // Within a single row.
                rect_interval = aligned;
            } else if rect_interval.len() == 0 {
                // Two row fragments that do not stack; take the longer one.
                let row1 = Interval::new(aligned.start, rect_interval.start);
                let row2 = Interval::new(rect_interval.start, aligned.end);
                rect_interval = if row1.len() > row2.len() { row1 } else { row2 };
            }

            if rect_interval.len() > result.len() {
                result = rect_interval;
            }
        }
        result
    }

    /// Register a new watcher on this surface.
    pub fn create_watcher(this: &SurfaceRef) -> WatcherRef {
        let watcher = Rc::new(RefCell::new(SurfaceWatcher {
            surface: Rc::downgrade(&this.0),
            valid: false,
        }));
        this.0.borrow_mut().watchers.push(Rc::downgrade(&watcher));
        watcher
    }

    /// Tell every live watcher the surface content changed.
    pub fn invalidate_watchers(&mut self) {
        self.watchers.retain(|weak| match weak.upgrade() {
            Some(watcher) => {
                watcher.borrow_mut().valid = false;
                true
            }
            None => false,
        });
    }

    /// Detach every watcher, as if the surface were already destroyed.
    pub fn unlink_watchers(&mut self) {
        for weak in self.watchers.drain(..) {
            if let Some(watcher) = weak.upgrade() {
                let mut watcher = watcher.borrow_mut();
                watcher.valid = false;
                watcher.surface = Weak::new();
            }
        }
    }

    /// Copy staging pixels into the rectangle described by `copy`.
    pub fn upload(
        &mut self,
        runtime: &mut dyn TextureRuntime,
        copy: &BufferTextureCopy,
        staging: &StagingData,
    ) {
        debug_assert!(self.params.stride * self.params.pixel_format.host_bytes_per_pixel() % 4 == 0);
        if let Some(alloc) = &self.alloc {
            runtime.upload(alloc, copy, staging);
        }
        self.invalidate_watchers();
    }

    /// Read the rectangle described by `copy` into staging. Scaled surfaces
    /// are first resolved to an unscaled intermediate.
    pub fn download(
        &self,
        runtime: &mut dyn TextureRuntime,
        copy: &BufferTextureCopy,
        staging: &mut StagingData,
    ) {
        let Some(alloc) = &self.alloc else {
            return;
        };

        if self.params.res_scale > 1 {
            let mut unscaled_params = self.params;
            unscaled_params.res_scale = 1;
            if let Some(temp) = runtime.allocate(&unscaled_params) {
                let blit = TextureBlit {
                    src_level: copy.texture_level,
                    dst_level: copy.texture_level,
                    src_layer: 0,
                    dst_layer: 0,
                    src_rect: copy.texture_rect * u32::from(self.params.res_scale),
                    dst_rect: copy.texture_rect,
                };
                runtime.blit_textures(alloc, &temp, &blit);
                runtime.download(&temp, copy, staging);
                runtime.recycler().borrow_mut().put(temp);
                return;
            }
        }
        runtime.download(alloc, copy, staging);
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if let (Some(alloc), Some(recycler)) = (self.alloc.take(), self.recycler.as_ref()) {
            recycler.borrow_mut().put(alloc);
        }
    }
}

/// Key identifying a cached cube-map collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureCubeConfig {
    pub px: PAddr,
    pub nx: PAddr,
    pub py: PAddr,
    pub ny: PAddr,
    pub pz: PAddr,
    pub nz: PAddr,
    pub width: u32,
    pub format: PixelFormat,
}

impl TextureCubeConfig {
    pub fn face_addresses(&self) -> [PAddr; 6] {
        [self.px, self.nx, self.py, self.ny, self.pz, self.nz]
    }
}

/// A cube-map texture assembled from six cached 2-D faces.
#[derive(Default)]
pub struct CachedTextureCube {
    pub texture: Option<Allocation>,
    pub res_scale: u16,
    /// Watchers in `face_addresses` order.
    pub faces: [Option<WatcherRef>; 6],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rasterizer_cache::pixel_format::TextureType;

    fn fill_surface(addr: PAddr, size: u32, fill_data: [u8; 4], fill_size: u32) -> Surface {
        let params = SurfaceParams {
            addr,
            end: addr + size,
            size,
            surface_type: SurfaceType::Fill,
            res_scale: u16::MAX,
            ..Default::default()
        };
        let mut surface = Surface::new(params, None, None);
        surface.fill_data = fill_data;
        surface.fill_size = fill_size;
        surface
    }

    fn color_params(addr: PAddr, width: u32, height: u32) -> SurfaceParams {
        let mut params = SurfaceParams {
            addr,
            width,
            height,
            pixel_format: PixelFormat::Rgba8,
            texture_type: TextureType::Texture2D,
            ..Default::default()
        };
        params.update();
        params
    }

    #[test]
    fn test_can_fill_pattern_match() {
        let dest = color_params(0x1000, 8, 8);
        let surface = fill_surface(0x1000, 0x1000, [0xAA, 0xBB, 0xAA, 0xBB], 2);
        // A 2-byte pattern tiles a 4-byte pixel only if it repeats.
        assert!(surface.can_fill(&dest, dest.interval()));

        let surface = fill_surface(0x1000, 0x1000, [0xAA, 0xBB, 0xCC, 0xDD], 2);
        assert!(surface.can_fill(&dest, dest.interval()));

        let mut dest16 = dest;
        dest16.pixel_format = PixelFormat::Rgb565;
        dest16.update();
        // 3-byte pattern cannot tile 2-byte pixels.
        let surface = fill_surface(0x1000, 0x1000, [0xAA, 0xBB, 0xCC, 0x00], 3);
        assert!(!surface.can_fill(&dest16, dest16.interval()));
    }

    #[test]
    fn test_can_fill_rejects_outside_range() {
        let dest = color_params(0x1000, 8, 8);
        let surface = fill_surface(0x1100, 0x100, [0; 4], 4);
        assert!(!surface.can_fill(&dest, dest.interval()));
    }

    #[test]
    fn test_copyable_interval_full_and_partial() {
        let params = color_params(0x1000, 8, 8);
        let mut surface = Surface::new(params, None, None);

        // Fully invalid: nothing to copy.
        surface.invalid_regions.insert(params.interval());
        assert_eq!(surface.get_copyable_interval(&params).len(), 0);

        // Fully valid: the whole interval.
        surface.invalid_regions.clear();
        assert_eq!(surface.get_copyable_interval(&params), params.interval());

        // Invalidate the middle: the longer valid row run wins.
        let row = params.bytes_in_pixels(8);
        surface
            .invalid_regions
            .insert(Interval::sized(0x1000 + row * 2, row));
        let copyable = surface.get_copyable_interval(&params);
        assert_eq!(copyable, Interval::new(0x1000 + row * 3, 0x1000 + row * 8));
    }

    #[test]
    fn test_watcher_lifecycle() {
        let surface = SurfaceRef::new(Surface::new(color_params(0x1000, 8, 8), None, None));
        let watcher = Surface::create_watcher(&surface);
        assert!(!watcher.borrow().is_valid());

        watcher.borrow_mut().validate();
        assert!(watcher.borrow().is_valid());
        assert!(watcher.borrow().get().is_some());

        surface.borrow_mut().invalidate_watchers();
        assert!(!watcher.borrow().is_valid());

        watcher.borrow_mut().validate();
        surface.borrow_mut().unlink_watchers();
        assert!(!watcher.borrow().is_valid());
        assert!(watcher.borrow().get().is_none());
    }

    #[test]
    fn test_watcher_invalid_after_surface_drop() {
        let surface = SurfaceRef::new(Surface::new(color_params(0x1000, 8, 8), None, None));
        let watcher = Surface::create_watcher(&surface);
        watcher.borrow_mut().validate();
        drop(surface);
        assert!(!watcher.borrow().is_valid());
        assert!(watcher.borrow().get().is_none());
    }
}
