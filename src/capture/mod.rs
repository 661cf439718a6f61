//! Sensor devices behind one capability contract

pub mod body;
pub mod frame;
pub mod null;
pub mod probe;
pub mod synthetic;
#[cfg(target_os = "linux")]
pub mod v4l2;

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::compose::{self, SourceFrame};
use crate::error::{ComposeError, DeviceError};

pub use body::DepthBodyDevice;
pub use frame::{FocusPoint, Orientation, PixelFormat, StreamFormat, VideoResolution};
pub use null::NullDevice;
pub use probe::SensorProbe;
#[cfg(target_os = "linux")]
pub use v4l2::V4l2Device;

/// Sensor variants, in the vocabulary of the preference list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Placeholder device, always available
    #[serde(rename = "none")]
    Null,
    /// Color-only webcam
    BasicColor,
    /// Color plus depth and body segmentation
    DepthBody,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorKind::Null => "none",
            SensorKind::BasicColor => "basic_color",
            SensorKind::DepthBody => "depth_body",
        };
        f.write_str(name)
    }
}

/// Result of one non-blocking device poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No new color frame was ready
    Pending,
    /// The color buffer advanced but an auxiliary stream (depth, body index
    /// or skeleton) did not
    Partial,
    /// Color and every enabled auxiliary stream advanced
    Complete,
}

impl PollOutcome {
    pub fn has_new_color(self) -> bool {
        !matches!(self, PollOutcome::Pending)
    }
}

/// Capability contract every sensor variant implements.
///
/// Lifecycle: constructed idle, `connect_to_first` acquires the hardware,
/// `update` is called once per output frame, `disconnect` releases
/// everything. A device may be reconnected after a disconnect.
pub trait Device: Send {
    fn kind(&self) -> SensorKind;

    /// Probe for hardware and open every stream the variant needs. On
    /// failure nothing stays open.
    fn connect_to_first(&mut self) -> Result<(), DeviceError>;

    /// Release all resources. Safe to call when already disconnected.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Static catalogue of supported modes
    fn video_resolutions(&self) -> &[VideoResolution];

    /// Index of the default advertised mode
    fn video_resolution_preferred(&self) -> usize;

    /// Index of the sensor's intrinsic mode; its size is the coordinate
    /// space of focus points
    fn video_resolution_native(&self) -> usize;

    fn video_resolution_count(&self) -> usize {
        self.video_resolutions().len()
    }

    fn video_resolution(&self, index: usize) -> Option<VideoResolution> {
        self.video_resolutions().get(index).copied()
    }

    fn native_resolution(&self) -> Option<VideoResolution> {
        self.video_resolution(self.video_resolution_native())
    }

    /// Hint the mode the host negotiated. Takes effect on the next
    /// acquisition or connect; performs no I/O.
    fn video_set_resolution(&mut self, resolution: VideoResolution);

    fn video_flip_output(&mut self, flip: bool);

    /// Select the skeletal joint to follow. Out-of-range joints are ignored.
    fn focus_set_joint(&mut self, _joint: u32) {}

    fn focus_available(&self) -> bool {
        false
    }

    fn focus_point(&self) -> FocusPoint {
        FocusPoint::default()
    }

    fn green_screen_enable(&mut self, _enable: bool) {}

    /// Non-blocking poll for new sensor data.
    ///
    /// Returns `Err(ConnectionLost)` on every poll after the sensor went
    /// away, until it is reconnected.
    fn update(&mut self) -> Result<PollOutcome, DeviceError>;

    /// Composite the current color buffer around `focus` into `out`
    fn color_data(
        &mut self,
        focus: FocusPoint,
        width: u32,
        height: u32,
        bits_per_pixel: u32,
        out: &mut [u8],
    ) -> Result<(), DeviceError>;
}

/// Build the device for `kind`, if the probe says it can exist on this host.
/// The caller still has to connect it.
pub fn device_factory(kind: SensorKind, probe: &SensorProbe) -> Option<Box<dyn Device>> {
    match kind {
        SensorKind::Null => Some(Box::new(NullDevice::new())),
        SensorKind::DepthBody => {
            let driver = probe.body_driver()?;
            debug!("Creating depth/body device on driver {}", driver.name());
            Some(Box::new(DepthBodyDevice::new(driver)))
        }
        SensorKind::BasicColor => basic_color_device(probe),
    }
}

#[cfg(target_os = "linux")]
fn basic_color_device(probe: &SensorProbe) -> Option<Box<dyn Device>> {
    let path = probe.v4l2_path()?;
    match V4l2Device::open(path) {
        Ok(device) => Some(Box::new(device)),
        Err(e) => {
            debug!("V4L2 device {} unusable: {}", path.display(), e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn basic_color_device(_probe: &SensorProbe) -> Option<Box<dyn Device>> {
    None
}

/// Shared `color_data` path for devices holding a raw color buffer:
/// validate the request against the negotiated format, then hand the
/// buffer to the compositor.
#[allow(clippy::too_many_arguments)]
pub(crate) fn composite_color(
    src: &SourceFrame<'_>,
    format: PixelFormat,
    flip: bool,
    focus: FocusPoint,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    out: &mut [u8],
) -> Result<(), DeviceError> {
    if src.data.is_empty() {
        return Err(DeviceError::NotConnected);
    }

    if bits_per_pixel != format.bits_per_pixel() {
        return Err(DeviceError::mismatch(
            width,
            height,
            bits_per_pixel,
            format!("device is set up for {format}"),
        ));
    }

    compose::copy_region(src, focus, width, height, format, flip, out)
        .map(|_| ())
        .map_err(|e| compose_mismatch(e, width, height, bits_per_pixel))
}

fn compose_mismatch(error: ComposeError, width: u32, height: u32, bpp: u32) -> DeviceError {
    DeviceError::mismatch(width, height, bpp, error.to_string())
}
