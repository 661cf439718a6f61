//! Scanline pixel conversions used by the compositor

/// Row converter: `(source row, optional mask row, destination row)`.
///
/// Mask entries of zero are background; the matching destination pixel is
/// left untouched.
pub type RowConverter = fn(&[u8], Option<&[u8]>, &mut [u8]);

/// BGRA -> BGRA straight copy
pub fn bgra_to_bgra(src: &[u8], mask: Option<&[u8]>, dst: &mut [u8]) {
    match mask {
        None => dst.copy_from_slice(src),
        Some(mask) => {
            for ((s, d), m) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)).zip(mask) {
                if *m != 0 {
                    d.copy_from_slice(s);
                }
            }
        }
    }
}

/// BGRA -> 24 bit packed, alpha dropped, channel order kept
pub fn bgra_to_rgb(src: &[u8], mask: Option<&[u8]>, dst: &mut [u8]) {
    match mask {
        None => {
            for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(3)) {
                d.copy_from_slice(&s[..3]);
            }
        }
        Some(mask) => {
            for ((s, d), m) in src.chunks_exact(4).zip(dst.chunks_exact_mut(3)).zip(mask) {
                if *m != 0 {
                    d.copy_from_slice(&s[..3]);
                }
            }
        }
    }
}

/// Verbatim copy for packed sensor formats (YUY2). Masks do not apply to
/// macro-pixels and are ignored.
pub fn copy_packed(src: &[u8], _mask: Option<&[u8]>, dst: &mut [u8]) {
    dst.copy_from_slice(src);
}

/// Convert a full YUYV (YUY2) frame into BGRA using BT.601 limited range.
///
/// Each 4-byte macro-pixel `Y0 U Y1 V` produces two BGRA pixels. Trailing
/// bytes that do not form a whole macro-pixel are ignored.
pub fn yuyv_to_bgra(src: &[u8], dst: &mut [u8]) {
    for (yuyv, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(8)) {
        let u = i32::from(yuyv[1]) - 128;
        let v = i32::from(yuyv[3]) - 128;

        let (first, second) = out.split_at_mut(4);
        write_bgra(first, yuyv[0], u, v);
        write_bgra(second, yuyv[2], u, v);
    }
}

#[inline]
fn write_bgra(out: &mut [u8], y: u8, u: i32, v: i32) {
    let c = 298 * (i32::from(y) - 16);

    out[0] = clip((c + 516 * u + 128) >> 8);
    out[1] = clip((c - 100 * u - 208 * v + 128) >> 8);
    out[2] = clip((c + 409 * v + 128) >> 8);
    out[3] = 0xff;
}

#[inline]
fn clip(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
