// SPDX-FileCopyrightText: 2025 rpica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest pixel format registry.
//!
//! Maps each guest format to its surface type, bits per pixel in guest
//! memory and bytes per pixel in the host representation. Texture-type
//! formats are expanded to RGBA8 on the host; color and depth formats keep
//! their native layout.

use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8,
    Rgb8,
    Rgb5A1,
    Rgb565,
    Rgba4,
    Ia8,
    Rg8,
    I8,
    A8,
    Ia4,
    I4,
    A4,
    Etc1,
    Etc1A4,
    D16,
    D24,
    D24S8,
    Invalid,
}

/// Every real format, in registry order. Used when probing the cache for
/// bit-width-compatible reinterpretation sources.
pub const ALL_FORMATS: [PixelFormat; 17] = [
    PixelFormat::Rgba8,
    PixelFormat::Rgb8,
    PixelFormat::Rgb5A1,
    PixelFormat::Rgb565,
    PixelFormat::Rgba4,
    PixelFormat::Ia8,
    PixelFormat::Rg8,
    PixelFormat::I8,
    PixelFormat::A8,
    PixelFormat::Ia4,
    PixelFormat::I4,
    PixelFormat::A4,
    PixelFormat::Etc1,
    PixelFormat::Etc1A4,
    PixelFormat::D16,
    PixelFormat::D24,
    PixelFormat::D24S8,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceType {
    Color,
    Texture,
    Depth,
    DepthStencil,
    Fill,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureType {
    Texture2D,
    CubeMap,
}

impl PixelFormat {
    /// Bits per pixel in guest memory (per block for compressed formats).
    pub const fn bpp(self) -> u32 {
        match self {
            PixelFormat::Rgba8 | PixelFormat::D24S8 => 32,
            PixelFormat::Rgb8 | PixelFormat::D24 => 24,
            PixelFormat::Rgb5A1
            | PixelFormat::Rgb565
            | PixelFormat::Rgba4
            | PixelFormat::Ia8
            | PixelFormat::Rg8
            | PixelFormat::D16 => 16,
            PixelFormat::I8 | PixelFormat::A8 | PixelFormat::Ia4 | PixelFormat::Etc1A4 => 8,
            PixelFormat::I4 | PixelFormat::A4 | PixelFormat::Etc1 => 4,
            PixelFormat::Invalid => 0,
        }
    }

    /// Bytes per pixel of the host representation. Texture formats decode
    /// to RGBA8; color and depth formats upload natively. D24 is padded to
    /// four bytes for host alignment.
    pub const fn host_bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8 | PixelFormat::D24 | PixelFormat::D24S8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgb5A1
            | PixelFormat::Rgb565
            | PixelFormat::Rgba4
            | PixelFormat::D16 => 2,
            PixelFormat::Ia8
            | PixelFormat::Rg8
            | PixelFormat::I8
            | PixelFormat::A8
            | PixelFormat::Ia4
            | PixelFormat::I4
            | PixelFormat::A4
            | PixelFormat::Etc1
            | PixelFormat::Etc1A4 => 4,
            PixelFormat::Invalid => 0,
        }
    }

    pub const fn surface_type(self) -> SurfaceType {
        match self {
            PixelFormat::Rgba8
            | PixelFormat::Rgb8
            | PixelFormat::Rgb5A1
            | PixelFormat::Rgb565
            | PixelFormat::Rgba4 => SurfaceType::Color,
            PixelFormat::Ia8
            | PixelFormat::Rg8
            | PixelFormat::I8
            | PixelFormat::A8
            | PixelFormat::Ia4
            | PixelFormat::I4
            | PixelFormat::A4
            | PixelFormat::Etc1
            | PixelFormat::Etc1A4 => SurfaceType::Texture,
            PixelFormat::D16 | PixelFormat::D24 => SurfaceType::Depth,
            PixelFormat::D24S8 => SurfaceType::DepthStencil,
            PixelFormat::Invalid => SurfaceType::Invalid,
        }
    }
}

/// Whether a GPU blit between the two formats is allowed. Color and texture
/// surfaces interchange freely; depth and depth-stencil only blit within
/// their own kind.
pub fn formats_blittable(source: PixelFormat, dest: PixelFormat) -> bool {
    let source_type = source.surface_type();
    let dest_type = dest.surface_type();

    let is_color_like =
        |ty: SurfaceType| matches!(ty, SurfaceType::Color | SurfaceType::Texture);

    if is_color_like(source_type) && is_color_like(dest_type) {
        return true;
    }
    if source_type == SurfaceType::Depth && dest_type == SurfaceType::Depth {
        return true;
    }
    if source_type == SurfaceType::DepthStencil && dest_type == SurfaceType::DepthStencil {
        return true;
    }

    warn!("Unblittable format pair detected {source:?} and {dest:?}");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_properties() {
        assert_eq!(PixelFormat::Rgba8.bpp(), 32);
        assert_eq!(PixelFormat::I4.bpp(), 4);
        assert_eq!(PixelFormat::D24.bpp(), 24);
        assert_eq!(PixelFormat::D24.host_bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::I4.host_bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgb565.host_bytes_per_pixel(), 2);
    }

    #[test]
    fn test_surface_types() {
        assert_eq!(PixelFormat::Rgb5A1.surface_type(), SurfaceType::Color);
        assert_eq!(PixelFormat::Etc1.surface_type(), SurfaceType::Texture);
        assert_eq!(PixelFormat::D16.surface_type(), SurfaceType::Depth);
        assert_eq!(PixelFormat::D24S8.surface_type(), SurfaceType::DepthStencil);
    }

    #[test]
    fn test_blittable_rules() {
        assert!(formats_blittable(PixelFormat::Rgba8, PixelFormat::Ia8));
        assert!(formats_blittable(PixelFormat::D16, PixelFormat::D24));
        assert!(formats_blittable(PixelFormat::D24S8, PixelFormat::D24S8));
        assert!(!formats_blittable(PixelFormat::Rgba8, PixelFormat::D24S8));
        assert!(!formats_blittable(PixelFormat::D24, PixelFormat::D24S8));
    }
}
