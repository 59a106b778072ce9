// SPDX-FileCopyrightText: 2025 rpica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tiled/linear texture codecs and their dispatch.
//!
//! Decoding turns guest texel data into the host representation (texture
//! formats expand to RGBA8, color and depth formats stay native); encoding
//! is the inverse and exists only for formats that can be written back.
//! Tiled layouts use 8x8 tiles with z-order texels inside each tile, tiles
//! laid out row-major in 8-row bands.
//!
//! The `convert` flag selects byte-reordered variants for host backends
//! that cannot upload the native component order; only RGBA8 and RGB8 have
//! reordered variants.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::pixel_format::PixelFormat;
use super::surface_params::SurfaceParams;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no codec for pixel format {format:?} (tiled = {tiled}, convert = {convert})")]
    Unimplemented {
        format: PixelFormat,
        tiled: bool,
        convert: bool,
    },
}

/// Per-texel conversion pair. `decode` writes host bytes from guest bytes;
/// `encode` is absent for formats that are never written back to the guest.
struct TexelOps {
    decode: fn(&[u8], &mut [u8]),
    encode: Option<fn(&[u8], &mut [u8])>,
}

fn copy2(src: &[u8], out: &mut [u8]) {
    out[..2].copy_from_slice(&src[..2]);
}

fn copy3(src: &[u8], out: &mut [u8]) {
    out[..3].copy_from_slice(&src[..3]);
}

fn copy4(src: &[u8], out: &mut [u8]) {
    out[..4].copy_from_slice(&src[..4]);
}

fn reverse3(src: &[u8], out: &mut [u8]) {
    out[0] = src[2];
    out[1] = src[1];
    out[2] = src[0];
}

fn reverse4(src: &[u8], out: &mut [u8]) {
    out[0] = src[3];
    out[1] = src[2];
    out[2] = src[1];
    out[3] = src[0];
}

fn decode_d24(src: &[u8], out: &mut [u8]) {
    out[..3].copy_from_slice(&src[..3]);
    out[3] = 0;
}

fn encode_d24(src: &[u8], out: &mut [u8]) {
    out[..3].copy_from_slice(&src[..3]);
}

fn decode_ia8(src: &[u8], out: &mut [u8]) {
    let (a, i) = (src[0], src[1]);
    out[..4].copy_from_slice(&[i, i, i, a]);
}

fn decode_rg8(src: &[u8], out: &mut [u8]) {
    out[..4].copy_from_slice(&[src[1], src[0], 0, 255]);
}

fn decode_i8(src: &[u8], out: &mut [u8]) {
    let v = src[0];
    out[..4].copy_from_slice(&[v, v, v, 255]);
}

fn decode_a8(src: &[u8], out: &mut [u8]) {
    out[..4].copy_from_slice(&[0, 0, 0, src[0]]);
}

fn decode_ia4(src: &[u8], out: &mut [u8]) {
    let i = (src[0] >> 4) * 17;
    let a = (src[0] & 0xF) * 17;
    out[..4].copy_from_slice(&[i, i, i, a]);
}

fn decode_i4(src: &[u8], out: &mut [u8]) {
    let v = src[0] * 17;
    out[..4].copy_from_slice(&[v, v, v, 255]);
}

fn decode_a4(src: &[u8], out: &mut [u8]) {
    out[..4].copy_from_slice(&[0, 0, 0, src[0] * 17]);
}

/// Codec lookup. Texture formats have no encoder; compressed formats have no
/// codec at all and are decoded by an external package.
fn codec(format: PixelFormat, convert: bool) -> Option<&'static TexelOps> {
    use PixelFormat::*;

    static OPS_RGBA8: TexelOps = TexelOps {
        decode: copy4,
        encode: Some(copy4),
    };
    static OPS_RGBA8_CONV: TexelOps = TexelOps {
        decode: reverse4,
        encode: Some(reverse4),
    };
    static OPS_RGB8: TexelOps = TexelOps {
        decode: copy3,
        encode: Some(copy3),
    };
    static OPS_RGB8_CONV: TexelOps = TexelOps {
        decode: reverse3,
        encode: Some(reverse3),
    };
    static OPS_RAW16: TexelOps = TexelOps {
        decode: copy2,
        encode: Some(copy2),
    };
    static OPS_D24: TexelOps = TexelOps {
        decode: decode_d24,
        encode: Some(encode_d24),
    };
    static OPS_D24S8: TexelOps = TexelOps {
        decode: copy4,
        encode: Some(copy4),
    };
    static OPS_IA8: TexelOps = TexelOps {
        decode: decode_ia8,
        encode: None,
    };
    static OPS_RG8: TexelOps = TexelOps {
        decode: decode_rg8,
        encode: None,
    };
    static OPS_I8: TexelOps = TexelOps {
        decode: decode_i8,
        encode: None,
    };
    static OPS_A8: TexelOps = TexelOps {
        decode: decode_a8,
        encode: None,
    };
    static OPS_IA4: TexelOps = TexelOps {
        decode: decode_ia4,
        encode: None,
    };
    static OPS_I4: TexelOps = TexelOps {
        decode: decode_i4,
        encode: None,
    };
    static OPS_A4: TexelOps = TexelOps {
        decode: decode_a4,
        encode: None,
    };

    Some(match (format, convert) {
        (Rgba8, false) => &OPS_RGBA8,
        (Rgba8, true) => &OPS_RGBA8_CONV,
        (Rgb8, false) => &OPS_RGB8,
        (Rgb8, true) => &OPS_RGB8_CONV,
        (Rgb5A1 | Rgb565 | Rgba4 | D16, _) => &OPS_RAW16,
        (D24, _) => &OPS_D24,
        (D24S8, _) => &OPS_D24S8,
        (Ia8, _) => &OPS_IA8,
        (Rg8, _) => &OPS_RG8,
        (I8, _) => &OPS_I8,
        (A8, _) => &OPS_A8,
        (Ia4, _) => &OPS_IA4,
        (I4, _) => &OPS_I4,
        (A4, _) => &OPS_A4,
        (Etc1 | Etc1A4 | Invalid, _) => return None,
    })
}

/// Visit every texel of the region described by `params`, computing its
/// guest byte offset (plus high-nibble flag for 4-bit formats) and its host
/// buffer offset. Host rows run bottom-up; tiled guest rows run top-down, so
/// tiled regions flip vertically.
fn for_each_texel(params: &SurfaceParams, mut visit: impl FnMut(usize, bool, usize)) {
    let bits = params.bpp() as usize;
    let host_bpp = params.pixel_format.host_bytes_per_pixel() as usize;
    let width = params.width as usize;
    let height = params.height as usize;

    if params.is_tiled {
        let tiles_per_row = (width / 8).max(1);
        let tile_bytes = 64 * bits / 8;
        let tile_count = params.size as usize / tile_bytes;

        for t in 0..tile_count {
            let tile_off = t * tile_bytes;
            let tile_x = t % tiles_per_row;
            let tile_y = t / tiles_per_row;
            for i in 0..64usize {
                let px = compact_even_bits(i);
                let py = compact_even_bits(i >> 1);
                let gx = tile_x * 8 + px;
                let gy = tile_y * 8 + py;
                let host_off = ((height - 1 - gy) * width + gx) * host_bpp;
                let (guest_off, hi_nibble) = if bits == 4 {
                    (tile_off + i / 2, i % 2 == 1)
                } else {
                    (tile_off + i * bits / 8, false)
                };
                visit(guest_off, hi_nibble, host_off);
            }
        }
    } else {
        let texel_bytes = bits / 8;
        for y in 0..height {
            for x in 0..width {
                let guest_off = (y * width + x) * texel_bytes;
                let host_off = (y * width + x) * host_bpp;
                visit(guest_off, false, host_off);
            }
        }
    }
}

/// Extract bits 0, 2, 4 of a 6-bit z-order index.
fn compact_even_bits(i: usize) -> usize {
    (i & 1) | ((i >> 1) & 2) | ((i >> 2) & 4)
}

/// Decode the guest texel data in `source` (covering exactly the region of
/// `params`) into host pixels in `dest`, sized
/// `width * height * host_bytes_per_pixel`. Only texels whose guest bytes
/// start within `[start, end)` (offsets relative to the region) are written.
pub fn decode_texture(
    params: &SurfaceParams,
    source: &[u8],
    dest: &mut [u8],
    start: usize,
    end: usize,
    convert: bool,
) -> Result<(), CodecError> {
    // Linear layouts with sub-byte texels never occur in guest memory.
    if (!params.is_tiled && params.bpp() < 8) || params.bpp() == 0 {
        return Err(CodecError::Unimplemented {
            format: params.pixel_format,
            tiled: params.is_tiled,
            convert,
        });
    }
    let ops = codec(params.pixel_format, convert).ok_or(CodecError::Unimplemented {
        format: params.pixel_format,
        tiled: params.is_tiled,
        convert,
    })?;

    let host_bpp = params.pixel_format.host_bytes_per_pixel() as usize;
    let nibble = params.bpp() == 4;
    for_each_texel(params, |guest_off, hi, host_off| {
        if guest_off < start || guest_off >= end {
            return;
        }
        let out = &mut dest[host_off..host_off + host_bpp];
        if nibble {
            let v = (source[guest_off] >> if hi { 4 } else { 0 }) & 0xF;
            (ops.decode)(&[v], out);
        } else {
            (ops.decode)(&source[guest_off..], out);
        }
    });
    Ok(())
}

/// Encode host pixels in `source` back to guest texel data in `dest`. Only
/// color and depth formats can be written back, and only texels whose guest
/// bytes start within `[start, end)` (offsets relative to the region) are
/// touched.
pub fn encode_texture(
    params: &SurfaceParams,
    source: &[u8],
    dest: &mut [u8],
    start: usize,
    end: usize,
    convert: bool,
) -> Result<(), CodecError> {
    let unimplemented = CodecError::Unimplemented {
        format: params.pixel_format,
        tiled: params.is_tiled,
        convert,
    };
    if params.bpp() < 8 {
        return Err(unimplemented);
    }
    let encode = codec(params.pixel_format, convert)
        .and_then(|ops| ops.encode)
        .ok_or(unimplemented)?;

    let host_bpp = params.pixel_format.host_bytes_per_pixel() as usize;
    let texel_bytes = (params.bpp() / 8) as usize;
    for_each_texel(params, |guest_off, _, host_off| {
        if guest_off < start || guest_off >= end {
            return;
        }
        encode(
            &source[host_off..host_off + host_bpp],
            &mut dest[guest_off..guest_off + texel_bytes],
        );
    });
    Ok(())
}

/// Decode a single texel to an RGBA8 color. Used for fill pattern clear
/// values; compressed formats are not supported.
pub fn texel_to_rgba(format: PixelFormat, bytes: &[u8]) -> Option<[u8; 4]> {
    use PixelFormat::*;

    let expand5 = |v: u16| ((v << 3) | (v >> 2)) as u8;
    let expand6 = |v: u16| ((v << 2) | (v >> 4)) as u8;
    let expand4 = |v: u16| (v as u8) * 17;

    Some(match format {
        Rgba8 => [bytes[3], bytes[2], bytes[1], bytes[0]],
        Rgb8 => [bytes[2], bytes[1], bytes[0], 255],
        Rgb5A1 => {
            let v = LittleEndian::read_u16(bytes);
            [
                expand5((v >> 11) & 0x1F),
                expand5((v >> 6) & 0x1F),
                expand5((v >> 1) & 0x1F),
                if v & 1 != 0 { 255 } else { 0 },
            ]
        }
        Rgb565 => {
            let v = LittleEndian::read_u16(bytes);
            [
                expand5((v >> 11) & 0x1F),
                expand6((v >> 5) & 0x3F),
                expand5(v & 0x1F),
                255,
            ]
        }
        Rgba4 => {
            let v = LittleEndian::read_u16(bytes);
            [
                expand4((v >> 12) & 0xF),
                expand4((v >> 8) & 0xF),
                expand4((v >> 4) & 0xF),
                expand4(v & 0xF),
            ]
        }
        Ia8 => [bytes[1], bytes[1], bytes[1], bytes[0]],
        Rg8 => [bytes[1], bytes[0], 0, 255],
        I8 => [bytes[0], bytes[0], bytes[0], 255],
        A8 => [0, 0, 0, bytes[0]],
        Ia4 => {
            let i = (bytes[0] >> 4) * 17;
            [i, i, i, (bytes[0] & 0xF) * 17]
        }
        I4 => {
            let v = (bytes[0] & 0xF) * 17;
            [v, v, v, 255]
        }
        A4 => [0, 0, 0, (bytes[0] & 0xF) * 17],
        Etc1 | Etc1A4 | D16 | D24 | D24S8 | Invalid => return None,
    })
}

/// Encode an RGBA8 color as one texel of a color format. The inverse of
/// [`texel_to_rgba`] for the color formats; quantizing formats round by
/// truncation so expanded values map back exactly.
pub fn rgba_to_texel(format: PixelFormat, rgba: [u8; 4], out: &mut [u8]) -> bool {
    use PixelFormat::*;

    let [r, g, b, a] = rgba.map(u16::from);
    match format {
        Rgba8 => out[..4].copy_from_slice(&[rgba[3], rgba[2], rgba[1], rgba[0]]),
        Rgb8 => out[..3].copy_from_slice(&[rgba[2], rgba[1], rgba[0]]),
        Rgb5A1 => {
            let v = ((r >> 3) << 11)
                | ((g >> 3) << 6)
                | ((b >> 3) << 1)
                | u16::from(a >= 128);
            LittleEndian::write_u16(out, v);
        }
        Rgb565 => {
            let v = ((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3);
            LittleEndian::write_u16(out, v);
        }
        Rgba4 => {
            let v = ((r >> 4) << 12) | ((g >> 4) << 8) | ((b >> 4) << 4) | (a >> 4);
            LittleEndian::write_u16(out, v);
        }
        _ => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rasterizer_cache::pixel_format::PixelFormat;

    fn region(width: u32, height: u32, format: PixelFormat, tiled: bool) -> SurfaceParams {
        let mut params = SurfaceParams {
            addr: 0x1000,
            width,
            height,
            pixel_format: format,
            is_tiled: tiled,
            ..Default::default()
        };
        params.update();
        params
    }

    #[test]
    fn test_linear_rgba8_flips_nothing() {
        let params = region(8, 2, PixelFormat::Rgba8, false);
        let mut guest = vec![0u8; params.size as usize];
        // Mark the first guest texel.
        guest[..4].copy_from_slice(&[1, 2, 3, 4]);

        let mut host = vec![0u8; 8 * 2 * 4];
        decode_texture(&params, &guest, &mut host, 0, guest.len(), false).unwrap();
        // Linear guest row 0 is host row 0 (bottom).
        assert_eq!(&host[..4], &[1, 2, 3, 4]);

        let mut back = vec![0u8; params.size as usize];
        let back_len = back.len();
        encode_texture(&params, &host, &mut back, 0, back_len, false).unwrap();
        assert_eq!(back, guest);
    }

    #[test]
    fn test_tiled_rgba8_round_trip() {
        let params = region(16, 16, PixelFormat::Rgba8, true);
        let guest: Vec<u8> = (0..params.size).map(|i| (i % 251) as u8).collect();

        let mut host = vec![0u8; 16 * 16 * 4];
        decode_texture(&params, &guest, &mut host, 0, guest.len(), false).unwrap();

        let mut back = vec![0u8; params.size as usize];
        let back_len = back.len();
        encode_texture(&params, &host, &mut back, 0, back_len, false).unwrap();
        assert_eq!(back, guest);
    }

    #[test]
    fn test_tiled_first_texel_lands_top_left() {
        let params = region(8, 8, PixelFormat::Rgba8, true);
        let mut guest = vec![0u8; params.size as usize];
        guest[..4].copy_from_slice(&[9, 9, 9, 9]);

        let mut host = vec![0u8; 8 * 8 * 4];
        decode_texture(&params, &guest, &mut host, 0, guest.len(), false).unwrap();
        // Tiled guest rows run top-down: texel (0,0) is the top-left pixel,
        // which lives in the last host row (bottom-up layout).
        let top_row_off = 7 * 8 * 4;
        assert_eq!(&host[top_row_off..top_row_off + 4], &[9, 9, 9, 9]);
    }

    #[test]
    fn test_tiled_z_order_within_tile() {
        let params = region(8, 8, PixelFormat::Rgba8, true);
        let mut guest = vec![0u8; params.size as usize];
        // Texel index 1 in z-order is pixel (1, 0).
        guest[4..8].copy_from_slice(&[5, 5, 5, 5]);
        // Texel index 2 is pixel (0, 1).
        guest[8..12].copy_from_slice(&[6, 6, 6, 6]);

        let mut host = vec![0u8; 8 * 8 * 4];
        decode_texture(&params, &guest, &mut host, 0, guest.len(), false).unwrap();
        let off_1_0 = (7 * 8 + 1) * 4;
        let off_0_1 = (6 * 8) * 4;
        assert_eq!(&host[off_1_0..off_1_0 + 4], &[5, 5, 5, 5]);
        assert_eq!(&host[off_0_1..off_0_1 + 4], &[6, 6, 6, 6]);
    }

    #[test]
    fn test_i4_decodes_nibbles() {
        let params = region(8, 8, PixelFormat::I4, true);
        assert_eq!(params.size, 32);
        let mut guest = vec![0u8; 32];
        // First byte: texel 0 in low nibble, texel 1 in high nibble.
        guest[0] = 0xF1;

        let mut host = vec![0u8; 8 * 8 * 4];
        decode_texture(&params, &guest, &mut host, 0, guest.len(), false).unwrap();
        let texel = |x: usize, y_top: usize| {
            let off = ((7 - y_top) * 8 + x) * 4;
            [host[off], host[off + 1], host[off + 2], host[off + 3]]
        };
        assert_eq!(texel(0, 0), [17, 17, 17, 255]);
        assert_eq!(texel(1, 0), [255, 255, 255, 255]);
    }

    #[test]
    fn test_convert_reorders_rgba8() {
        let params = region(8, 8, PixelFormat::Rgba8, false);
        let mut guest = vec![0u8; params.size as usize];
        guest[..4].copy_from_slice(&[1, 2, 3, 4]);

        let mut host = vec![0u8; 8 * 8 * 4];
        decode_texture(&params, &guest, &mut host, 0, guest.len(), true).unwrap();
        assert_eq!(&host[..4], &[4, 3, 2, 1]);
    }

    #[test]
    fn test_encode_clips_to_byte_range() {
        let params = region(8, 2, PixelFormat::Rgba8, false);
        let host = vec![0x11u8; 8 * 2 * 4];
        let mut guest = vec![0u8; params.size as usize];
        // Encode only the second row (bytes 32..64).
        encode_texture(&params, &host, &mut guest, 32, 64, false).unwrap();
        assert!(guest[..32].iter().all(|&b| b == 0));
        assert!(guest[32..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_etc1_has_no_codec() {
        let params = region(8, 8, PixelFormat::Etc1, true);
        let guest = vec![0u8; params.size as usize];
        let mut host = vec![0u8; 8 * 8 * 4];
        assert!(decode_texture(&params, &guest, &mut host, 0, guest.len(), false).is_err());
    }

    #[test]
    fn test_texture_formats_have_no_encoder() {
        let params = region(8, 8, PixelFormat::I8, true);
        let host = vec![0u8; 8 * 8 * 4];
        let mut guest = vec![0u8; params.size as usize];
        let guest_len = guest.len();
        assert!(encode_texture(&params, &host, &mut guest, 0, guest_len, false).is_err());
    }

    #[test]
    fn test_texel_to_rgba() {
        assert_eq!(
            texel_to_rgba(PixelFormat::Rgba8, &[0xEF, 0xBE, 0xAD, 0xDE]),
            Some([0xDE, 0xAD, 0xBE, 0xEF])
        );
        assert_eq!(
            texel_to_rgba(PixelFormat::Rgb565, &[0x00, 0xF8]),
            Some([255, 0, 0, 255])
        );
        assert_eq!(texel_to_rgba(PixelFormat::I8, &[0x80]), Some([128, 128, 128, 255]));
        assert_eq!(texel_to_rgba(PixelFormat::D16, &[0, 0]), None);
    }
}
