//! Simulated depth/body sensor.
//!
//! Renders a moving subject over a gradient and reports a matching skeleton,
//! depth and body-index stream. Tests script it through the shared handle;
//! the binary uses it when `sensors.synthetic` is set.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::body::{
    Body, BodySensor, BodySensorDriver, CameraPoint, ColorPoint, DriverError, FrameDescription,
};
use super::frame::FocusPoint;
use crate::compose::mask::{DepthPoint, NO_BODY};
use crate::compose::SourceFormat;

/// Distance of the simulated subject from the sensor, meters
const SUBJECT_DEPTH: f32 = 2.0;
/// Background depth, millimeters
const WALL_DEPTH_MM: u16 = 4000;

#[derive(Debug)]
struct Scene {
    present: bool,
    available: bool,
    animated: bool,
    subject: Option<FocusPoint>,
    frame: u64,
    stalled_color: u32,
    fail_color: bool,
    sessions: usize,
}

/// Scriptable stand-in for a vendor body-tracking driver. Clones share the
/// same scene.
#[derive(Debug, Clone)]
pub struct SyntheticBodySensor {
    color: FrameDescription,
    depth: FrameDescription,
    scene: Arc<Mutex<Scene>>,
}

impl Default for SyntheticBodySensor {
    fn default() -> Self {
        Self::new(1920, 1080, 512, 424)
    }
}

impl SyntheticBodySensor {
    pub fn new(color_width: u32, color_height: u32, depth_width: u32, depth_height: u32) -> Self {
        let color = FrameDescription { width: color_width, height: color_height };
        let depth = FrameDescription { width: depth_width, height: depth_height };
        Self {
            color,
            depth,
            scene: Arc::new(Mutex::new(Scene {
                present: true,
                available: true,
                animated: true,
                subject: Some(FocusPoint::new(color_width as i32 / 2, color_height as i32 / 2)),
                frame: 0,
                stalled_color: 0,
                fail_color: false,
                sessions: 0,
            })),
        }
    }

    fn scene(&self) -> MutexGuard<'_, Scene> {
        lock(&self.scene)
    }

    /// Plug or unplug the sensor. Open sessions report a disconnect.
    pub fn set_present(&self, present: bool) {
        self.scene().present = present;
    }

    pub fn set_available(&self, available: bool) {
        self.scene().available = available;
    }

    /// Move the subject on a circle every color frame
    pub fn set_animated(&self, animated: bool) {
        self.scene().animated = animated;
    }

    /// Place the tracked subject's joints at a color-space pixel, or
    /// remove the subject
    pub fn set_subject(&self, subject: Option<FocusPoint>) {
        self.scene().subject = subject;
    }

    /// Report "no new color frame" for the next `polls` color acquisitions
    pub fn stall_color(&self, polls: u32) {
        self.scene().stalled_color = polls;
    }

    pub fn fail_next_color(&self) {
        self.scene().fail_color = true;
    }

    /// Sessions currently open on this sensor
    pub fn open_sessions(&self) -> usize {
        self.scene().sessions
    }
}

impl BodySensorDriver for SyntheticBodySensor {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open_default(&self) -> Result<Box<dyn BodySensor>, DriverError> {
        let mut scene = self.scene();
        if !scene.present {
            return Err(DriverError::Failed("no sensor attached".into()));
        }
        scene.sessions += 1;

        Ok(Box::new(Session {
            color: self.color,
            depth: self.depth,
            scene: self.scene.clone(),
            open: true,
        }))
    }
}

fn lock(scene: &Mutex<Scene>) -> MutexGuard<'_, Scene> {
    // the scene holds plain data, a panicked writer cannot leave it torn
    scene.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Session {
    color: FrameDescription,
    depth: FrameDescription,
    scene: Arc<Mutex<Scene>>,
    open: bool,
}

impl Session {
    fn focal_length(&self) -> f32 {
        self.color.width as f32
    }

    fn principal_point(&self) -> (f32, f32) {
        (self.color.width as f32 / 2.0, self.color.height as f32 / 2.0)
    }

    fn body_radius(&self) -> f32 {
        self.color.height as f32 / 6.0
    }

    /// Scene lock for a live session
    fn live(&self) -> Result<MutexGuard<'_, Scene>, DriverError> {
        let scene = lock(&self.scene);
        if !self.open || !scene.present {
            return Err(DriverError::Disconnected);
        }
        Ok(scene)
    }

    /// Subject center in color space, at the pixel center
    fn subject_center(scene: &Scene) -> Option<(f32, f32)> {
        scene.subject.map(|p| (p.x as f32 + 0.5, p.y as f32 + 0.5))
    }

    fn inside_subject(&self, center: Option<(f32, f32)>, x: f32, y: f32) -> bool {
        center.is_some_and(|(cx, cy)| {
            let (dx, dy) = (x - cx, y - cy);
            dx * dx + dy * dy <= self.body_radius() * self.body_radius()
        })
    }

    fn animate(&self, scene: &mut Scene) {
        scene.frame += 1;
        if !scene.animated {
            return;
        }

        let t = scene.frame as f32 * 0.05;
        let (cx, cy) = self.principal_point();
        scene.subject = Some(FocusPoint::new(
            (cx + cx / 2.0 * t.cos()) as i32,
            (cy + cy / 4.0 * t.sin()) as i32,
        ));
    }

    fn render_bgra(&self, center: Option<(f32, f32)>, frame: u64, dst: &mut [u8]) {
        let width = self.color.width as usize;
        for (i, px) in dst.chunks_exact_mut(4).enumerate() {
            let (x, y) = ((i % width) as f32 + 0.5, (i / width) as f32 + 0.5);
            if self.inside_subject(center, x, y) {
                px.copy_from_slice(&[90, 200, 40, 0xff]);
            } else {
                let shade = ((i % width) * 255 / width.max(1)) as u8;
                px.copy_from_slice(&[shade, (frame % 256) as u8, 255 - shade, 0xff]);
            }
        }
    }

    fn render_yuy2(&self, center: Option<(f32, f32)>, dst: &mut [u8]) {
        let width = self.color.width as usize;
        for (i, pair) in dst.chunks_exact_mut(4).enumerate() {
            let x = (i * 2) % width;
            let y = (i * 2) / width;
            let luma = if self.inside_subject(center, x as f32 + 1.0, y as f32 + 0.5) {
                200
            } else {
                (16 + x * 200 / width.max(1)) as u8
            };
            pair.copy_from_slice(&[luma, 128, luma, 128]);
        }
    }
}

impl BodySensor for Session {
    fn wait_available(&mut self, _timeout: Duration) -> Result<bool, DriverError> {
        Ok(self.live()?.available)
    }

    fn color_description(&self) -> Result<FrameDescription, DriverError> {
        Ok(self.color)
    }

    fn depth_description(&self) -> Result<FrameDescription, DriverError> {
        Ok(self.depth)
    }

    fn acquire_color(&mut self, layout: SourceFormat, dst: &mut [u8]) -> Result<bool, DriverError> {
        let mut scene = self.live()?;
        if scene.stalled_color > 0 {
            scene.stalled_color -= 1;
            return Ok(false);
        }
        if std::mem::take(&mut scene.fail_color) {
            return Err(DriverError::Failed("color frame copy failed".into()));
        }

        let required = self.color.pixels() * layout.bytes_per_pixel();
        if dst.len() < required {
            return Err(DriverError::Failed(format!("color buffer holds {} of {} bytes", dst.len(), required)));
        }

        self.animate(&mut scene);
        let center = Self::subject_center(&scene);
        match layout {
            SourceFormat::Bgra32 => self.render_bgra(center, scene.frame, &mut dst[..required]),
            SourceFormat::Yuy2 => self.render_yuy2(center, &mut dst[..required]),
        }
        Ok(true)
    }

    fn acquire_depth(&mut self, dst: &mut [u16]) -> Result<bool, DriverError> {
        let scene = self.live()?;
        let center = Self::subject_center(&scene);
        let (sx, sy) = self.depth_to_color_scale();
        let width = self.depth.width as usize;

        for (i, sample) in dst.iter_mut().enumerate() {
            let (x, y) = ((i % width) as f32 + 0.5, (i / width) as f32 + 0.5);
            *sample = if self.inside_subject(center, x * sx, y * sy) {
                (SUBJECT_DEPTH * 1000.0) as u16
            } else {
                WALL_DEPTH_MM
            };
        }
        Ok(true)
    }

    fn acquire_body_index(&mut self, dst: &mut [u8]) -> Result<bool, DriverError> {
        let scene = self.live()?;
        let center = Self::subject_center(&scene);
        let (sx, sy) = self.depth_to_color_scale();
        let width = self.depth.width as usize;

        for (i, index) in dst.iter_mut().enumerate() {
            let (x, y) = ((i % width) as f32 + 0.5, (i / width) as f32 + 0.5);
            *index = if self.inside_subject(center, x * sx, y * sy) { 0 } else { NO_BODY };
        }
        Ok(true)
    }

    fn acquire_bodies(&mut self, bodies: &mut [Body]) -> Result<bool, DriverError> {
        let scene = self.live()?;
        let subject = Self::subject_center(&scene);
        drop(scene);

        for body in bodies.iter_mut() {
            body.tracked = false;
        }

        if let (Some((u, v)), Some(body)) = (subject, bodies.first_mut()) {
            let (cx, cy) = self.principal_point();
            let f = self.focal_length();
            let joint = CameraPoint {
                x: (u - cx) * SUBJECT_DEPTH / f,
                y: (cy - v) * SUBJECT_DEPTH / f,
                z: SUBJECT_DEPTH,
            };
            body.tracked = true;
            body.joints.fill(joint);
        }
        Ok(true)
    }

    fn map_camera_to_color(&self, point: CameraPoint) -> Result<ColorPoint, DriverError> {
        if point.z <= 0.0 {
            return Ok(ColorPoint { x: f32::NEG_INFINITY, y: f32::NEG_INFINITY });
        }

        let (cx, cy) = self.principal_point();
        let f = self.focal_length();
        Ok(ColorPoint {
            x: cx + f * point.x / point.z,
            y: cy - f * point.y / point.z,
        })
    }

    fn map_color_to_depth(&self, depth: &[u16], points: &mut [DepthPoint]) -> Result<(), DriverError> {
        if depth.len() < self.depth.pixels() || points.len() < self.color.pixels() {
            return Err(DriverError::Failed("mapping buffers are too small".into()));
        }

        let (sx, sy) = self.depth_to_color_scale();
        let width = self.color.width as usize;
        for (i, point) in points.iter_mut().enumerate() {
            let (x, y) = ((i % width) as f32 + 0.5, (i / width) as f32 + 0.5);
            *point = DepthPoint::new(x / sx, y / sy);
        }
        Ok(())
    }

    fn close(&mut self) {
        if std::mem::take(&mut self.open) {
            lock(&self.scene).sessions -= 1;
        }
    }
}

impl Session {
    /// Color pixels per depth pixel, per axis
    fn depth_to_color_scale(&self) -> (f32, f32) {
        (
            self.color.width as f32 / self.depth.width.max(1) as f32,
            self.color.height as f32 / self.depth.height.max(1) as f32,
        )
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::body::{JOINT_HEAD, MAX_BODIES};

    #[test]
    fn joints_project_back_onto_subject() {
        let sensor = SyntheticBodySensor::new(640, 480, 320, 240);
        sensor.set_subject(Some(FocusPoint::new(17, 450)));
        let mut session = sensor.open_default().unwrap();

        let mut bodies = vec![Body::default(); MAX_BODIES];
        assert!(session.acquire_bodies(&mut bodies).unwrap());
        assert!(bodies[0].tracked);
        assert!(!bodies[1].tracked);

        let point = session.map_camera_to_color(bodies[0].joints[JOINT_HEAD as usize]).unwrap();
        assert_eq!((point.x as i32, point.y as i32), (17, 450));
    }

    #[test]
    fn sessions_are_counted_once() {
        let sensor = SyntheticBodySensor::new(8, 8, 4, 4);
        let mut session = sensor.open_default().unwrap();
        assert_eq!(sensor.open_sessions(), 1);
        session.close();
        session.close();
        drop(session);
        assert_eq!(sensor.open_sessions(), 0);
    }

    #[test]
    fn unplugged_sensor_reports_disconnect() {
        let sensor = SyntheticBodySensor::new(8, 8, 4, 4);
        let mut session = sensor.open_default().unwrap();
        sensor.set_present(false);

        let mut color = vec![0u8; 8 * 8 * 4];
        assert!(matches!(
            session.acquire_color(SourceFormat::Bgra32, &mut color),
            Err(DriverError::Disconnected)
        ));
        assert!(sensor.open_default().is_err());
    }
}
