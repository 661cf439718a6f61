use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Host clock units per second (100 ns ticks).
pub const UNITS: i64 = 10_000_000;

/// Pixel formats a device can deliver to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 24 bit packed, no padding (B, G, R byte order as captured)
    Rgb,
    /// 32 bit, straight copy of the sensor's BGRA
    Rgba,
    /// 16 bit packed luma/chroma, passed through in the sensor's packing
    Yuy2,
}

impl PixelFormat {
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb => 24,
            PixelFormat::Rgba => 32,
            PixelFormat::Yuy2 => 16,
        }
    }

    pub const fn bytes_per_pixel(self) -> usize {
        (self.bits_per_pixel() / 8) as usize
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Rgb => "RGB24",
            PixelFormat::Rgba => "RGB32",
            PixelFormat::Yuy2 => "YUY2",
        };
        f.write_str(name)
    }
}

/// One entry of a device's static mode catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoResolution {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub framerate: u32,
    pub pixel_format: PixelFormat,
}

impl VideoResolution {
    pub const fn new(
        width: u32,
        height: u32,
        bits_per_pixel: u32,
        framerate: u32,
        pixel_format: PixelFormat,
    ) -> Self {
        Self {
            width,
            height,
            bits_per_pixel,
            framerate,
            pixel_format,
        }
    }

    /// Size in bytes of one frame in this mode
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * (self.bits_per_pixel / 8) as usize
    }

    /// Average time per frame in host ticks
    pub fn frame_interval(&self) -> i64 {
        interval_from_rate(self.framerate)
    }

    pub fn center(&self) -> FocusPoint {
        FocusPoint::new(self.width as i32 / 2, self.height as i32 / 2)
    }
}

impl fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{} @ {}fps ({})",
            self.width, self.height, self.bits_per_pixel, self.framerate, self.pixel_format
        )
    }
}

pub fn interval_from_rate(framerate: u32) -> i64 {
    UNITS / i64::from(framerate.max(1))
}

pub fn rate_from_interval(interval: i64) -> u32 {
    if interval <= 0 {
        return 0;
    }
    (UNITS / interval) as u32
}

pub fn ticks_to_duration(ticks: i64) -> Duration {
    Duration::from_nanos(ticks.max(0) as u64 * 100)
}

/// Scanline order of the host's output bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Orientation {
    /// Origin at the lower left corner (positive bitmap height)
    BottomUp,
    /// Origin at the upper left corner (negative bitmap height)
    TopDown,
}

/// Format negotiated with the host for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    pub resolution: VideoResolution,
    pub orientation: Orientation,
}

impl StreamFormat {
    pub fn new(resolution: VideoResolution, orientation: Orientation) -> Self {
        Self {
            resolution,
            orientation,
        }
    }

    /// Build from bitmap header style values, where the sign of the height
    /// carries the scanline order.
    pub fn from_bitmap(
        width: u32,
        signed_height: i32,
        bits_per_pixel: u32,
        framerate: u32,
        pixel_format: PixelFormat,
    ) -> Self {
        let orientation = if signed_height < 0 {
            Orientation::TopDown
        } else {
            Orientation::BottomUp
        };
        Self {
            resolution: VideoResolution::new(
                width,
                signed_height.unsigned_abs(),
                bits_per_pixel,
                framerate,
                pixel_format,
            ),
            orientation,
        }
    }

    /// Whether the compositor must write scanlines bottom-up. YUV bitmaps are
    /// always top-down regardless of the sign of the height.
    pub fn flip(&self) -> bool {
        match self.resolution.pixel_format {
            PixelFormat::Yuy2 => false,
            PixelFormat::Rgb | PixelFormat::Rgba => self.orientation == Orientation::BottomUp,
        }
    }

    pub fn sample_size(&self) -> usize {
        self.resolution.frame_size()
    }

    pub fn frame_interval(&self) -> i64 {
        self.resolution.frame_interval()
    }
}

/// Tracked subject position in the sensor's native color space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FocusPoint {
    pub x: i32,
    pub y: i32,
}

impl FocusPoint {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_matches_bpp() {
        let res = VideoResolution::new(320, 240, 24, 30, PixelFormat::Rgb);
        assert_eq!(res.frame_size(), 320 * 240 * 3);
        let res = VideoResolution::new(320, 240, 16, 30, PixelFormat::Yuy2);
        assert_eq!(res.frame_size(), 320 * 240 * 2);
    }

    #[test]
    fn thirty_fps_interval() {
        assert_eq!(interval_from_rate(30), 333_333);
        assert_eq!(rate_from_interval(333_333), 30);
    }

    #[test]
    fn orientation_from_height_sign() {
        let up = StreamFormat::from_bitmap(640, 480, 32, 30, PixelFormat::Rgba);
        assert_eq!(up.orientation, Orientation::BottomUp);
        assert!(up.flip());

        let down = StreamFormat::from_bitmap(640, -480, 32, 30, PixelFormat::Rgba);
        assert_eq!(down.resolution.height, 480);
        assert!(!down.flip());

        let yuy2 = StreamFormat::from_bitmap(640, 480, 16, 30, PixelFormat::Yuy2);
        assert!(!yuy2.flip());
    }
}
