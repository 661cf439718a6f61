//! Body mask re-projection from depth space into color space

/// Mask value of a foreground (body) pixel
pub const FOREGROUND: u8 = 0xff;
/// Mask value of a background pixel
pub const BACKGROUND: u8 = 0x00;
/// Body-index value meaning "no body at this depth pixel"
pub const NO_BODY: u8 = 0xff;

/// Location of a color pixel in depth-image coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DepthPoint {
    pub x: f32,
    pub y: f32,
}

impl DepthPoint {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Rebuild `mask` (one entry per color pixel) from the color->depth mapping
/// `points` and the sensor's body-index image.
///
/// A color pixel is foreground when it maps inside the depth image and the
/// body-index sample there belongs to a body. Unmapped points (non-finite
/// coordinates) are background.
pub fn build_body_mask(points: &[DepthPoint], depth_width: u32, body_index: &[u8], mask: &mut [u8]) {
    mask.fill(BACKGROUND);

    let depth_width = depth_width as i64;
    if depth_width == 0 {
        return;
    }

    for (point, entry) in points.iter().zip(mask.iter_mut()) {
        if !point.x.is_finite() || !point.y.is_finite() {
            continue;
        }

        let (x, y) = (point.x as i64, point.y as i64);
        if x < 0 || y < 0 || x >= depth_width {
            continue;
        }

        let index = (y * depth_width + x) as usize;
        if body_index.get(index).is_some_and(|&body| body != NO_BODY) {
            *entry = FOREGROUND;
        }
    }
}
