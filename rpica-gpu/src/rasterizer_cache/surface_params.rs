// SPDX-FileCopyrightText: 2025 rpica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Surface descriptor and the geometric predicates the cache matches on.
//!
//! A `SurfaceParams` describes a guest memory range interpreted as a 2-D
//! pixel grid: base address, dimensions and stride in pixels, tiling, format
//! and host resolution scale. Tiled layouts store 8x8 pixel tiles in 8-row
//! bands, so all tiled arithmetic works in band units.

use rpica_common::{align_down, align_down_mul, align_up, align_up_mul, PAddr, Rectangle};

use super::interval::Interval;
use super::pixel_format::{PixelFormat, SurfaceType, TextureType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceParams {
    pub addr: PAddr,
    pub end: PAddr,
    pub size: u32,

    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub levels: u32,
    pub res_scale: u16,

    pub is_tiled: bool,
    pub texture_type: TextureType,
    pub pixel_format: PixelFormat,
    pub surface_type: SurfaceType,
}

impl Default for SurfaceParams {
    fn default() -> Self {
        Self {
            addr: 0,
            end: 0,
            size: 0,
            width: 0,
            height: 0,
            stride: 0,
            levels: 1,
            res_scale: 1,
            is_tiled: false,
            texture_type: TextureType::Texture2D,
            pixel_format: PixelFormat::Invalid,
            surface_type: SurfaceType::Invalid,
        }
    }
}

impl SurfaceParams {
    /// Derive the remaining members from the already set addr, width, height,
    /// stride and pixel_format. Not used for fill surfaces, which have no
    /// pixel interpretation.
    pub fn update(&mut self) {
        if self.stride == 0 {
            self.stride = self.width;
        }
        self.surface_type = self.pixel_format.surface_type();
        self.size = if self.is_tiled {
            self.bytes_in_pixels(self.stride * 8 * (self.height / 8 - 1) + self.width * 8)
        } else {
            self.bytes_in_pixels(self.stride * (self.height - 1) + self.width)
        };
        self.end = self.addr + self.size;
    }

    pub fn interval(&self) -> Interval {
        Interval::new(self.addr, self.end)
    }

    pub fn bpp(&self) -> u32 {
        self.pixel_format.bpp()
    }

    pub fn scaled_width(&self) -> u32 {
        self.width * u32::from(self.res_scale)
    }

    pub fn scaled_height(&self) -> u32 {
        self.height * u32::from(self.res_scale)
    }

    pub fn rect(&self) -> Rectangle<u32> {
        Rectangle::new(0, self.height, self.width, 0)
    }

    pub fn scaled_rect(&self) -> Rectangle<u32> {
        Rectangle::new(0, self.scaled_height(), self.scaled_width(), 0)
    }

    pub fn pixels_in_bytes(&self, size: u32) -> u32 {
        size * 8 / self.bpp().max(1)
    }

    pub fn bytes_in_pixels(&self, pixels: u32) -> u32 {
        pixels * self.bpp() / 8
    }

    /// Bytes covered by one tile row band: a full stride of 8-pixel-tall
    /// tiles when tiled, a single pixel row otherwise.
    fn band_bytes(&self) -> u32 {
        self.bytes_in_pixels(self.stride * self.tile_size()).max(1)
    }

    /// Byte alignment of a positional offset: one 8x8 tile when tiled.
    fn tile_bytes(&self) -> u32 {
        self.bytes_in_pixels(if self.is_tiled { 64 } else { 1 }).max(1)
    }

    fn tile_size(&self) -> u32 {
        if self.is_tiled {
            8
        } else {
            1
        }
    }

    /// True when `other` describes the same surface byte-for-byte.
    pub fn exact_match(&self, other: &SurfaceParams) -> bool {
        (
            other.addr,
            other.width,
            other.height,
            other.stride,
            other.levels,
            other.pixel_format,
            other.is_tiled,
        ) == (
            self.addr,
            self.width,
            self.height,
            self.stride,
            self.levels,
            self.pixel_format,
            self.is_tiled,
        ) && self.pixel_format != PixelFormat::Invalid
    }

    /// True when `sub` is positionally contained in this surface and aligned
    /// so it projects onto a rectangle of it.
    pub fn can_sub_rect(&self, sub: &SurfaceParams) -> bool {
        sub.addr >= self.addr
            && sub.end <= self.end
            && sub.pixel_format == self.pixel_format
            && self.pixel_format != PixelFormat::Invalid
            && sub.is_tiled == self.is_tiled
            && (sub.addr - self.addr) % self.tile_bytes() == 0
            && (sub.stride == self.stride || sub.height <= self.tile_size())
            && self.sub_rect(sub).right <= self.stride
    }

    /// True when this surface could grow to also cover `other`: same format,
    /// tiling and stride, with ranges that touch or overlap on a band
    /// boundary.
    pub fn can_expand(&self, other: &SurfaceParams) -> bool {
        self.pixel_format != PixelFormat::Invalid
            && self.pixel_format == other.pixel_format
            && self.addr <= other.end
            && other.addr <= self.end
            && self.is_tiled == other.is_tiled
            && self.stride == other.stride
            && (self.addr.max(other.addr) - self.addr.min(other.addr)) % self.band_bytes() == 0
    }

    /// True when this surface can serve the raw byte copy described by
    /// `texcopy`, whose width/stride/height are in bytes.
    pub fn can_tex_copy(&self, texcopy: &SurfaceParams) -> bool {
        if self.pixel_format == PixelFormat::Invalid
            || self.addr > texcopy.addr
            || self.end < texcopy.end
        {
            return false;
        }

        if texcopy.width != texcopy.stride {
            let band_bytes = self.band_bytes();
            return (texcopy.addr - self.addr) % self.tile_bytes() == 0
                && texcopy.width % self.tile_bytes() == 0
                && (texcopy.height == 1 || texcopy.stride == band_bytes)
                && ((texcopy.addr - self.addr) % band_bytes) + texcopy.width <= band_bytes;
        }

        self.from_interval(texcopy.interval()).interval() == texcopy.interval()
    }

    /// The pixel rectangle `sub` occupies within this surface, in unscaled
    /// guest coordinates with rows bottom-up.
    pub fn sub_rect(&self, sub: &SurfaceParams) -> Rectangle<u32> {
        let begin_pixel_index = self.pixels_in_bytes(sub.addr - self.addr);

        if self.is_tiled {
            let x0 = (begin_pixel_index % (self.stride * 8)) / 8;
            let y0 = (begin_pixel_index / (self.stride * 8)) * 8;
            // Guest rows run top to bottom; flip into host coordinates.
            return Rectangle::new(
                x0,
                self.height - y0,
                x0 + sub.width,
                self.height - (y0 + sub.height),
            );
        }

        let x0 = begin_pixel_index % self.stride;
        let y0 = begin_pixel_index / self.stride;
        Rectangle::new(x0, y0 + sub.height, x0 + sub.width, y0)
    }

    pub fn scaled_sub_rect(&self, sub: &SurfaceParams) -> Rectangle<u32> {
        self.sub_rect(sub) * u32::from(self.res_scale)
    }

    /// The smallest rectangle-aligned view of this surface whose memory
    /// covers `interval`.
    pub fn from_interval(&self, interval: Interval) -> SurfaceParams {
        let mut params = *self;
        let band_bytes = self.band_bytes();

        let mut aligned_start =
            self.addr + align_down_mul(interval.start - self.addr, band_bytes);
        let mut aligned_end = self.addr + align_up_mul(interval.end - self.addr, band_bytes);

        if aligned_end - aligned_start > band_bytes {
            params.addr = aligned_start;
            params.height = (aligned_end - aligned_start) / self.bytes_in_pixels(self.stride).max(1);
        } else {
            debug_assert_eq!(aligned_end - aligned_start, band_bytes);
            let tile_bytes = self.tile_bytes();

            aligned_start = self.addr + align_down_mul(interval.start - self.addr, tile_bytes);
            aligned_end = self.addr + align_up_mul(interval.end - self.addr, tile_bytes);

            params.addr = aligned_start;
            params.width = self.pixels_in_bytes(aligned_end - aligned_start) / self.tile_size();
            params.stride = params.width;
            params.height = self.tile_size();
        }

        params.update();
        params
    }

    /// The memory interval covered by `unscaled_rect` within this surface.
    pub fn sub_rect_interval(&self, unscaled_rect: Rectangle<u32>) -> Interval {
        if unscaled_rect.width() == 0 || unscaled_rect.height() == 0 {
            return Interval::default();
        }

        let (left, top, right, bottom) = if self.is_tiled {
            // Convert to band units: x in pixel-times-8, y in 8-row bands.
            (
                align_down(unscaled_rect.left, 8) * 8,
                align_up(unscaled_rect.top, 8) / 8,
                align_up(unscaled_rect.right, 8) * 8,
                align_down(unscaled_rect.bottom, 8) / 8,
            )
        } else {
            (
                unscaled_rect.left,
                unscaled_rect.top,
                unscaled_rect.right,
                unscaled_rect.bottom,
            )
        };

        let stride_tiled = if self.is_tiled {
            self.stride * 8
        } else {
            self.stride
        };
        let pixels = (top - bottom - 1) * stride_tiled + (right - left);
        let row = if self.is_tiled {
            self.height / 8 - top
        } else {
            bottom
        };
        let pixel_offset = stride_tiled * row + left;

        Interval::new(
            self.addr + self.bytes_in_pixels(pixel_offset),
            self.addr + self.bytes_in_pixels(pixel_offset + pixels),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_surface(addr: PAddr, width: u32, height: u32, tiled: bool) -> SurfaceParams {
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

    #[test]
    fn test_update_computes_size() {
        let params = color_surface(0x1000, 64, 64, false);
        assert_eq!(params.stride, 64);
        assert_eq!(params.size, 64 * 64 * 4);
        assert_eq!(params.end, 0x1000 + 64 * 64 * 4);
        assert_eq!(params.surface_type, SurfaceType::Color);
    }

    #[test]
    fn test_exact_match() {
        let a = color_surface(0x1000, 64, 64, true);
        let b = color_surface(0x1000, 64, 64, true);
        assert!(a.exact_match(&b));

        let c = color_surface(0x1000, 64, 32, true);
        assert!(!a.exact_match(&c));
    }

    #[test]
    fn test_sub_rect_linear() {
        let outer = color_surface(0x10000, 64, 64, false);
        // One full row in, quarter size.
        let mut inner = color_surface(0x10000 + 64 * 4, 32, 32, false);
        inner.stride = 64;
        inner.update();

        assert!(outer.can_sub_rect(&inner));
        let rect = outer.sub_rect(&inner);
        assert_eq!(rect, Rectangle::new(0, 33, 32, 1));
    }

    #[test]
    fn test_sub_rect_tiled_flips_rows() {
        let outer = color_surface(0x10000, 64, 64, true);
        let inner = color_surface(0x10000, 32, 32, true);
        // Tiled sub-rects narrower than the stride are only addressable for
        // single-band surfaces.
        assert!(!outer.can_sub_rect(&inner));

        let mut band = color_surface(0x10000, 64, 8, true);
        band.update();
        assert!(outer.can_sub_rect(&band));
        let rect = outer.sub_rect(&band);
        assert_eq!(rect, Rectangle::new(0, 64, 64, 56));
    }

    #[test]
    fn test_scaled_sub_rect() {
        let mut outer = color_surface(0x10000, 64, 64, true);
        outer.res_scale = 2;
        let sub = color_surface(0x10000, 64, 32, true);
        let rect = outer.scaled_sub_rect(&sub);
        assert_eq!(rect, Rectangle::new(0, 128, 128, 64));
    }

    #[test]
    fn test_can_expand_touching_ranges() {
        let a = color_surface(0x20000, 64, 64, false);
        // One extra row immediately before.
        let b = color_surface(0x20000 - 64 * 4, 64, 64, false);
        assert!(a.can_expand(&b));
        assert!(b.can_expand(&a));

        // Misaligned by half a row.
        let c = color_surface(0x20000 - 32 * 4, 64, 64, false);
        assert!(!a.can_expand(&c));
    }

    #[test]
    fn test_from_interval_rows() {
        let surface = color_surface(0x10000, 64, 64, false);
        // Two middle rows.
        let interval = Interval::new(0x10000 + 64 * 4 * 10, 0x10000 + 64 * 4 * 12);
        let params = surface.from_interval(interval);
        assert_eq!(params.interval(), interval);
        assert_eq!(params.height, 2);
        assert_eq!(params.width, 64);
    }

    #[test]
    fn test_from_interval_partial_row() {
        let surface = color_surface(0x10000, 64, 64, false);
        // Half a row: widens to pixel alignment inside a single row.
        let interval = Interval::new(0x10000, 0x10000 + 32 * 4);
        let params = surface.from_interval(interval);
        assert_eq!(params.height, 1);
        assert_eq!(params.width, 32);
        assert_eq!(params.interval(), interval);
    }

    #[test]
    fn test_sub_rect_interval_round_trip() {
        let surface = color_surface(0x10000, 64, 64, true);
        let sub = color_surface(0x10000 + surface.bytes_in_pixels(64 * 8), 64, 16, true);
        let rect = surface.sub_rect(&sub);
        assert_eq!(surface.sub_rect_interval(rect), sub.interval());
    }

    #[test]
    fn test_can_tex_copy_contiguous() {
        let surface = color_surface(0x10000, 64, 64, false);
        // Whole-surface byte copy: width == stride.
        let texcopy = SurfaceParams {
            addr: 0x10000,
            end: 0x10000 + 64 * 64 * 4,
            size: 64 * 64 * 4,
            width: 64 * 64 * 4,
            stride: 64 * 64 * 4,
            height: 1,
            ..Default::default()
        };
        assert!(surface.can_tex_copy(&texcopy));
    }

    #[test]
    fn test_can_tex_copy_strided() {
        let surface = color_surface(0x10000, 64, 64, false);
        let row_bytes = 64 * 4;
        // Every other row, half width.
        let texcopy = SurfaceParams {
            addr: 0x10000,
            end: 0x10000 + row_bytes * 9 + row_bytes / 2,
            size: row_bytes * 9 + row_bytes / 2,
            width: row_bytes / 2,
            stride: row_bytes,
            height: 10,
            ..Default::default()
        };
        assert!(surface.can_tex_copy(&texcopy));

        // Gap not a multiple of the row stride.
        let misaligned = SurfaceParams {
            stride: row_bytes + 4,
            ..texcopy
        };
        assert!(!surface.can_tex_copy(&misaligned));
    }
}
