//! Fallback device used when no sensor is present

use image::{Rgba, RgbaImage};
use once_cell::sync::Lazy;
use tracing::debug;

use super::frame::{FocusPoint, PixelFormat, VideoResolution};
use super::{composite_color, Device, PollOutcome, SensorKind};
use crate::compose::{SourceFormat, SourceFrame};
use crate::error::DeviceError;

const RESOLUTIONS: [VideoResolution; 1] = [VideoResolution::new(320, 240, 24, 10, PixelFormat::Rgb)];

/// Placeholder frame, BGRA, top-down
static TEST_CARD: Lazy<Vec<u8>> = Lazy::new(|| draw_test_card(RESOLUTIONS[0].width, RESOLUTIONS[0].height));

/// Color bars over a dark checker band
fn draw_test_card(width: u32, height: u32) -> Vec<u8> {
    const BARS: [[u8; 3]; 7] = [
        [192, 192, 192],
        [192, 192, 0],
        [0, 192, 192],
        [0, 192, 0],
        [192, 0, 192],
        [192, 0, 0],
        [0, 0, 192],
    ];

    let card = RgbaImage::from_fn(width, height, |x, y| {
        if y < height * 2 / 3 {
            let [r, g, b] = BARS[(x * BARS.len() as u32 / width) as usize];
            Rgba([r, g, b, 0xff])
        } else if (x / 16 + y / 16) % 2 == 0 {
            Rgba([16, 16, 16, 0xff])
        } else {
            Rgba([48, 48, 48, 0xff])
        }
    });

    let mut data = card.into_raw();
    for px in data.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
    data
}

/// Device that always connects and serves a static test card
#[derive(Debug, Default)]
pub struct NullDevice {
    connected: bool,
    flip: bool,
}

impl NullDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Device for NullDevice {
    fn kind(&self) -> SensorKind {
        SensorKind::Null
    }

    fn connect_to_first(&mut self) -> Result<(), DeviceError> {
        Lazy::force(&TEST_CARD);
        self.connected = true;
        debug!("Null device connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn video_resolutions(&self) -> &[VideoResolution] {
        &RESOLUTIONS
    }

    fn video_resolution_preferred(&self) -> usize {
        0
    }

    fn video_resolution_native(&self) -> usize {
        0
    }

    fn video_set_resolution(&mut self, _resolution: VideoResolution) {}

    fn video_flip_output(&mut self, flip: bool) {
        self.flip = flip;
    }

    fn update(&mut self) -> Result<PollOutcome, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        Ok(PollOutcome::Complete)
    }

    fn color_data(
        &mut self,
        _focus: FocusPoint,
        width: u32,
        height: u32,
        bits_per_pixel: u32,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let mode = RESOLUTIONS[0];
        if (width, height, bits_per_pixel) != (mode.width, mode.height, mode.bits_per_pixel) {
            return Err(DeviceError::mismatch(
                width,
                height,
                bits_per_pixel,
                format!("placeholder only serves {mode}"),
            ));
        }

        let src = SourceFrame {
            width: mode.width,
            height: mode.height,
            format: SourceFormat::Bgra32,
            data: TEST_CARD.as_slice(),
            mask: None,
        };
        composite_color(
            &src,
            mode.pixel_format,
            self.flip,
            mode.center(),
            width,
            height,
            bits_per_pixel,
            out,
        )
    }
}
