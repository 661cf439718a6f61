//! Color + depth + body-segmentation device over a vendor driver table

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::frame::{FocusPoint, PixelFormat, VideoResolution};
use super::{composite_color, Device, PollOutcome, SensorKind};
use crate::compose::mask::{build_body_mask, DepthPoint, BACKGROUND, NO_BODY};
use crate::compose::{SourceFormat, SourceFrame};
use crate::error::DeviceError;

/// Number of skeletal joints reported per body
pub const JOINT_COUNT: u32 = 25;
/// Joint followed by default
pub const JOINT_HEAD: u32 = 3;
/// Bodies tracked simultaneously by the sensor
pub const MAX_BODIES: usize = 6;

/// First connect waits this long for the sensor to report available
const AVAILABLE_TIMEOUT: Duration = Duration::from_millis(1000);

const RESOLUTIONS: [VideoResolution; 8] = [
    VideoResolution::new(320, 240, 32, 30, PixelFormat::Rgba),
    VideoResolution::new(640, 480, 32, 30, PixelFormat::Rgba),
    VideoResolution::new(1920, 1080, 32, 30, PixelFormat::Rgba),
    VideoResolution::new(320, 240, 24, 30, PixelFormat::Rgb),
    VideoResolution::new(640, 480, 24, 30, PixelFormat::Rgb),
    VideoResolution::new(1920, 1080, 24, 30, PixelFormat::Rgb),
    VideoResolution::new(320, 240, 16, 30, PixelFormat::Yuy2),
    VideoResolution::new(1920, 1080, 16, 30, PixelFormat::Yuy2),
];

/// Point in camera space, meters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CameraPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Point in color-image pixel space
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ColorPoint {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameDescription {
    pub width: u32,
    pub height: u32,
}

impl FrameDescription {
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Skeleton of one body slot
#[derive(Debug, Clone, Default)]
pub struct Body {
    pub tracked: bool,
    pub joints: [CameraPoint; JOINT_COUNT as usize],
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{0}")]
    Failed(String),
    #[error("sensor disconnected")]
    Disconnected,
}

/// Entry point of a vendor sensor library, obtained once by the probe
pub trait BodySensorDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Open the default sensor. Dropping the returned handle releases it.
    fn open_default(&self) -> Result<Box<dyn BodySensor>, DriverError>;
}

/// An opened sensor. All `acquire_*` calls are non-blocking and return
/// `Ok(false)` when no new frame is ready.
pub trait BodySensor: Send {
    fn wait_available(&mut self, timeout: Duration) -> Result<bool, DriverError>;

    fn color_description(&self) -> Result<FrameDescription, DriverError>;

    fn depth_description(&self) -> Result<FrameDescription, DriverError>;

    /// Copy the latest color frame as BGRA (4 bytes/pixel) or raw YUY2
    /// (2 bytes/pixel) into `dst`
    fn acquire_color(&mut self, layout: SourceFormat, dst: &mut [u8]) -> Result<bool, DriverError>;

    /// Depth in millimeters, one sample per depth pixel
    fn acquire_depth(&mut self, dst: &mut [u16]) -> Result<bool, DriverError>;

    /// Body index per depth pixel, [`NO_BODY`] where nobody is present
    fn acquire_body_index(&mut self, dst: &mut [u8]) -> Result<bool, DriverError>;

    fn acquire_bodies(&mut self, bodies: &mut [Body]) -> Result<bool, DriverError>;

    fn map_camera_to_color(&self, point: CameraPoint) -> Result<ColorPoint, DriverError>;

    /// Map every color pixel into depth space using the given depth frame
    fn map_color_to_depth(&self, depth: &[u16], points: &mut [DepthPoint]) -> Result<(), DriverError>;

    fn close(&mut self);
}

/// Device for sensors with color, depth, body-index and skeleton streams
pub struct DepthBodyDevice {
    driver: Arc<dyn BodySensorDriver>,
    sensor: Option<Box<dyn BodySensor>>,

    color_size: FrameDescription,
    color: Vec<u8>,
    color_layout: SourceFormat,
    format: PixelFormat,
    flip: bool,
    green_screen: bool,

    depth_size: FrameDescription,
    depth: Vec<u16>,
    body_index: Vec<u8>,
    depth_points: Vec<DepthPoint>,
    mask: Vec<u8>,

    bodies: Vec<Body>,
    joint: u32,
    focus_available: bool,
    focus: FocusPoint,

    reconnect: bool,
    lost: bool,
}

impl DepthBodyDevice {
    pub fn new(driver: Arc<dyn BodySensorDriver>) -> Self {
        Self {
            driver,
            sensor: None,
            color_size: FrameDescription::default(),
            color: Vec::new(),
            color_layout: SourceFormat::Bgra32,
            format: PixelFormat::Rgba,
            flip: true,
            green_screen: false,
            depth_size: FrameDescription::default(),
            depth: Vec::new(),
            body_index: Vec::new(),
            depth_points: Vec::new(),
            mask: Vec::new(),
            bodies: vec![Body::default(); MAX_BODIES],
            joint: JOINT_HEAD,
            focus_available: false,
            focus: FocusPoint::default(),
            reconnect: false,
            lost: false,
        }
    }

    /// Size every buffer from the sensor's frame descriptions
    fn init_streams(&mut self, sensor: &mut dyn BodySensor) -> Result<(), DriverError> {
        if !self.reconnect {
            let available = sensor.wait_available(AVAILABLE_TIMEOUT);
            self.reconnect = true;

            if !available? {
                return Err(DriverError::Failed("sensor did not become available".into()));
            }
        }

        self.color_size = sensor.color_description()?;
        self.color = vec![0; self.color_size.pixels() * 4];
        self.color_layout = SourceFormat::for_output(self.format);

        // body index shares the depth image dimensions
        self.depth_size = sensor.depth_description()?;
        self.depth = vec![0; self.depth_size.pixels()];
        self.body_index = vec![NO_BODY; self.depth_size.pixels()];

        self.depth_points = vec![DepthPoint::default(); self.color_size.pixels()];
        self.mask = vec![BACKGROUND; self.color_size.pixels()];

        Ok(())
    }

    fn release_buffers(&mut self) {
        self.color = Vec::new();
        self.depth = Vec::new();
        self.body_index = Vec::new();
        self.depth_points = Vec::new();
        self.mask = Vec::new();
    }

    /// Sort a driver result into "advanced", "nothing new" or a lost link.
    /// Acquisition failures count as nothing new.
    fn classify(&mut self, stream: &str, result: Result<bool, DriverError>) -> Result<bool, DeviceError> {
        match result {
            Ok(advanced) => Ok(advanced),
            Err(DriverError::Disconnected) => {
                error!("Sensor disconnected while reading {} frame", stream);
                self.lost = true;
                self.focus_available = false;
                Err(DeviceError::ConnectionLost)
            }
            Err(DriverError::Failed(reason)) => {
                warn!("Failed to acquire {} frame: {}", stream, reason);
                metrics::counter!("vcam_acquisition_failures_total", "stream" => stream.to_owned())
                    .increment(1);
                Ok(false)
            }
        }
    }

    /// Map the selected joint of the first tracked body into color space
    fn locate_focus(&mut self) {
        let Some(sensor) = self.sensor.as_deref() else {
            return;
        };

        self.focus_available = false;

        let Some(body) = self.bodies.iter().find(|body| body.tracked) else {
            return;
        };

        match sensor.map_camera_to_color(body.joints[self.joint as usize]) {
            Ok(point) if point.x.is_finite() && point.y.is_finite() => {
                self.focus = FocusPoint::new(point.x as i32, point.y as i32);
                self.focus_available = true;
            }
            Ok(_) => debug!("Focus joint {} is outside the color frame", self.joint),
            Err(e) => debug!("Failed to map focus joint to color space: {}", e),
        }
    }

    /// Re-project depth/body-index data into a color-space mask
    fn build_index_mask(&mut self) -> bool {
        let Some(sensor) = self.sensor.as_deref() else {
            return false;
        };

        if let Err(e) = sensor.map_color_to_depth(&self.depth, &mut self.depth_points) {
            warn!("Failed to map color frame to depth space: {}", e);
            return false;
        }

        build_body_mask(&self.depth_points, self.depth_size.width, &self.body_index, &mut self.mask);
        true
    }
}

impl Device for DepthBodyDevice {
    fn kind(&self) -> SensorKind {
        SensorKind::DepthBody
    }

    #[instrument(skip(self), fields(driver = self.driver.name()))]
    fn connect_to_first(&mut self) -> Result<(), DeviceError> {
        self.disconnect();

        let mut sensor = self
            .driver
            .open_default()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        if let Err(e) = self.init_streams(sensor.as_mut()) {
            // release everything acquired by this attempt
            sensor.close();
            self.release_buffers();
            return Err(DeviceError::Unavailable(e.to_string()));
        }

        self.sensor = Some(sensor);
        self.joint = JOINT_HEAD;
        self.focus_available = false;
        self.focus = FocusPoint::default();
        self.lost = false;

        info!(
            "Depth/body sensor connected: color {}x{}, depth {}x{}",
            self.color_size.width, self.color_size.height, self.depth_size.width, self.depth_size.height
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut sensor) = self.sensor.take() {
            sensor.close();
            info!("Depth/body sensor disconnected");
        }
        self.release_buffers();
        self.focus_available = false;
        self.lost = false;
    }

    fn is_connected(&self) -> bool {
        self.sensor.is_some() && !self.lost
    }

    fn video_resolutions(&self) -> &[VideoResolution] {
        &RESOLUTIONS
    }

    fn video_resolution_preferred(&self) -> usize {
        0
    }

    fn video_resolution_native(&self) -> usize {
        2
    }

    fn video_set_resolution(&mut self, resolution: VideoResolution) {
        self.format = resolution.pixel_format;
    }

    fn video_flip_output(&mut self, flip: bool) {
        self.flip = flip;
    }

    fn focus_set_joint(&mut self, joint: u32) {
        if joint < JOINT_COUNT {
            self.joint = joint;
        }
    }

    fn focus_available(&self) -> bool {
        self.focus_available
    }

    fn focus_point(&self) -> FocusPoint {
        self.focus
    }

    fn green_screen_enable(&mut self, enable: bool) {
        self.green_screen = enable;
    }

    fn update(&mut self) -> Result<PollOutcome, DeviceError> {
        if self.lost {
            return Err(DeviceError::ConnectionLost);
        }
        let Some(sensor) = self.sensor.as_deref_mut() else {
            return Err(DeviceError::NotConnected);
        };

        // color is read on its own: the sensor may drop to a lower framerate
        // in low light and must not hold back the other streams
        let layout = SourceFormat::for_output(self.format);
        let color_len = self.color_size.pixels() * layout.bytes_per_pixel();
        let color = sensor.acquire_color(layout, &mut self.color[..color_len]);
        let bodies = sensor.acquire_bodies(&mut self.bodies);
        let (depth, body_index) = if self.green_screen {
            (
                sensor.acquire_depth(&mut self.depth),
                sensor.acquire_body_index(&mut self.body_index),
            )
        } else {
            (Ok(true), Ok(true))
        };

        let color = self.classify("color", color)?;
        if color {
            self.color_layout = layout;
        }

        let bodies_advanced = match bodies {
            Ok(true) => {
                self.locate_focus();
                true
            }
            Ok(false) => false,
            Err(e) => {
                let advanced = self.classify("body", Err(e))?;
                self.focus_available = false;
                advanced
            }
        };
        let depth = self.classify("depth", depth)?;
        let body_index = self.classify("body index", body_index)?;

        Ok(match (color, bodies_advanced && depth && body_index) {
            (false, _) => PollOutcome::Pending,
            (true, false) => PollOutcome::Partial,
            (true, true) => PollOutcome::Complete,
        })
    }

    fn color_data(
        &mut self,
        focus: FocusPoint,
        width: u32,
        height: u32,
        bits_per_pixel: u32,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        if self.sensor.is_none() || self.color.is_empty() {
            return Err(DeviceError::NotConnected);
        }

        // the mask is rebuilt for every composited frame, never reused
        let masked = self.green_screen
            && self.color_layout == SourceFormat::Bgra32
            && self.build_index_mask();

        let layout = self.color_layout;
        let src = SourceFrame {
            width: self.color_size.width,
            height: self.color_size.height,
            format: layout,
            data: &self.color[..self.color_size.pixels() * layout.bytes_per_pixel()],
            mask: masked.then_some(self.mask.as_slice()),
        };

        composite_color(&src, self.format, self.flip, focus, width, height, bits_per_pixel, out)
    }
}

impl Drop for DepthBodyDevice {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SyntheticBodySensor;
    use crate::compose::mask::FOREGROUND;

    fn device(sensor: &SyntheticBodySensor) -> DepthBodyDevice {
        DepthBodyDevice::new(Arc::new(sensor.clone()))
    }

    #[test]
    fn catalogue_native_is_full_hd() {
        let device = device(&SyntheticBodySensor::new(64, 48, 32, 24));
        assert_eq!(device.video_resolution_count(), 8);
        let native = device.native_resolution().unwrap();
        assert_eq!((native.width, native.height), (1920, 1080));
        assert_eq!(device.video_resolution_preferred(), 0);
    }

    #[test]
    fn connect_fails_cleanly_without_sensor() {
        let sensor = SyntheticBodySensor::new(64, 48, 32, 24);
        sensor.set_present(false);
        let mut device = device(&sensor);

        let err = device.connect_to_first().unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(_)));
        assert!(!device.is_connected());
        assert_eq!(sensor.open_sessions(), 0);
    }

    #[test]
    fn connect_fails_cleanly_when_sensor_never_available() {
        let sensor = SyntheticBodySensor::new(64, 48, 32, 24);
        sensor.set_available(false);
        let mut device = device(&sensor);

        assert!(device.connect_to_first().is_err());
        assert_eq!(sensor.open_sessions(), 0);

        // reconnects skip the availability wait
        sensor.set_available(true);
        device.connect_to_first().unwrap();
        assert_eq!(sensor.open_sessions(), 1);
        device.disconnect();
        assert_eq!(sensor.open_sessions(), 0);
    }

    #[test]
    fn update_tracks_selected_joint() {
        let sensor = SyntheticBodySensor::new(640, 480, 320, 240);
        sensor.set_animated(false);
        sensor.set_subject(Some(FocusPoint::new(400, 300)));
        let mut device = device(&sensor);
        device.connect_to_first().unwrap();

        device.focus_set_joint(99);
        assert_eq!(device.joint, JOINT_HEAD);

        assert_eq!(device.update().unwrap(), PollOutcome::Complete);
        assert!(device.focus_available());
        assert_eq!(device.focus_point(), FocusPoint::new(400, 300));

        sensor.set_subject(None);
        device.update().unwrap();
        assert!(!device.focus_available());
    }

    #[test]
    fn stalled_color_is_pending_and_failures_are_partial_misses() {
        let sensor = SyntheticBodySensor::new(64, 48, 32, 24);
        let mut device = device(&sensor);
        device.connect_to_first().unwrap();

        sensor.stall_color(1);
        assert_eq!(device.update().unwrap(), PollOutcome::Pending);
        assert_eq!(device.update().unwrap(), PollOutcome::Complete);

        sensor.fail_next_color();
        assert_eq!(device.update().unwrap(), PollOutcome::Pending);
    }

    #[test]
    fn lost_connection_sticks_until_reconnect() {
        let sensor = SyntheticBodySensor::new(64, 48, 32, 24);
        let mut device = device(&sensor);
        device.connect_to_first().unwrap();

        sensor.set_present(false);
        assert!(matches!(device.update(), Err(DeviceError::ConnectionLost)));
        sensor.set_present(true);
        assert!(matches!(device.update(), Err(DeviceError::ConnectionLost)));

        device.connect_to_first().unwrap();
        assert!(device.update().unwrap().has_new_color());
    }

    #[test]
    fn green_screen_masks_background() {
        let sensor = SyntheticBodySensor::new(64, 48, 32, 24);
        sensor.set_animated(false);
        sensor.set_subject(None);
        let mut device = device(&sensor);
        device.connect_to_first().unwrap();
        device.video_set_resolution(VideoResolution::new(64, 48, 32, 30, PixelFormat::Rgba));
        device.green_screen_enable(true);
        device.update().unwrap();

        // nobody in view: nothing is written
        let mut out = vec![0x11u8; 64 * 48 * 4];
        device
            .color_data(FocusPoint::new(32, 24), 64, 48, 32, &mut out)
            .unwrap();
        assert!(out.iter().all(|&b| b == 0x11));
        assert!(device.mask.iter().all(|&m| m == BACKGROUND));

        sensor.set_subject(Some(FocusPoint::new(32, 24)));
        device.update().unwrap();
        device
            .color_data(FocusPoint::new(32, 24), 64, 48, 32, &mut out)
            .unwrap();
        assert_eq!(device.mask[24 * 64 + 32], FOREGROUND);
        assert_eq!(device.mask[0], BACKGROUND);
        assert!(out.iter().any(|&b| b != 0x11));
    }

    #[test]
    fn color_data_rejects_oversized_and_wrong_bpp() {
        let sensor = SyntheticBodySensor::new(64, 48, 32, 24);
        let mut device = device(&sensor);
        device.connect_to_first().unwrap();
        device.update().unwrap();

        let mut out = vec![0u8; 128 * 96 * 4];
        assert!(matches!(
            device.color_data(FocusPoint::default(), 128, 96, 32, &mut out),
            Err(DeviceError::FormatMismatch { .. })
        ));
        assert!(matches!(
            device.color_data(FocusPoint::default(), 32, 24, 24, &mut out),
            Err(DeviceError::FormatMismatch { .. })
        ));
    }
}
