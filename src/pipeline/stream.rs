//! The pulling stream: one device, one negotiated format, one paced timeline

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use flume::Sender;
use tracing::{debug, info, instrument, trace, warn};

use super::clock::HostClock;
use super::focus::FocusSmoother;
use super::negotiate::{capabilities, match_format};
use super::pacing::FramePacer;
use crate::capture::frame::{FocusPoint, Orientation, PixelFormat, StreamFormat, VideoResolution};
use crate::capture::{device_factory, Device, NullDevice, PollOutcome, SensorKind, SensorProbe};
use crate::error::{DeviceError, StreamError};
use crate::ConfigHandle;

/// Metadata of one filled sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSample {
    /// Presentation time, host ticks from stream start
    pub start: i64,
    pub end: i64,
    pub discontinuity: bool,
    pub sync_point: bool,
    /// The buffer holds a newly composited frame; otherwise it was left as
    /// the host supplied it
    pub fresh: bool,
    /// Bytes of the buffer that belong to the sample
    pub size: usize,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    discontinuities: AtomicU64,
    sample_size: AtomicUsize,
}

/// Read-only stream statistics, safe to read from any thread
#[derive(Debug, Default)]
pub struct StreamCounters {
    inner: CachePadded<Counters>,
}

impl StreamCounters {
    /// Samples handed to the host (the not-dropped count)
    pub fn frames_delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn discontinuities(&self) -> u64 {
        self.inner.discontinuities.load(Ordering::Relaxed)
    }

    /// Size of every sample in the negotiated format
    pub fn average_frame_size(&self) -> usize {
        self.inner.sample_size.load(Ordering::Relaxed)
    }

    fn reset(&self, sample_size: usize) {
        self.inner.delivered.store(0, Ordering::Relaxed);
        self.inner.dropped.store(0, Ordering::Relaxed);
        self.inner.discontinuities.store(0, Ordering::Relaxed);
        self.inner.sample_size.store(sample_size, Ordering::Relaxed);
    }

    fn record_drop(&self, dropped: u64) {
        self.inner.dropped.fetch_add(dropped, Ordering::Relaxed);
        self.inner.discontinuities.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vcam_frames_dropped_total").increment(dropped);
        metrics::counter!("vcam_discontinuities_total").increment(1);
    }

    fn record_delivered(&self) {
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vcam_frames_delivered_total").increment(1);
    }
}

/// Virtual camera driven by a frame-pulling host.
///
/// Idle until [`start`](Self::start); each [`fill`](Self::fill) paces,
/// polls the device once and composites into the host's buffer.
pub struct VirtualCamera {
    config: ConfigHandle,
    clock: Arc<dyn HostClock>,
    device: Box<dyn Device>,
    format: StreamFormat,
    /// Catalogue entry serving `format`
    mode: VideoResolution,
    native_center: FocusPoint,
    focus: FocusPoint,
    smoother: FocusSmoother,
    pacer: FramePacer,
    counters: Arc<StreamCounters>,
    streaming: bool,
    lost_reported: bool,
}

impl VirtualCamera {
    /// Select the first connectable sensor in preference order, falling back
    /// to the null device. The device is released again until `start`.
    pub fn open(config: ConfigHandle, probe: &SensorProbe, clock: Arc<dyn HostClock>) -> Self {
        let preference = config.snapshot().sensors.preference.clone();
        let device = select_device(&preference, probe);

        let mode = preferred_mode(device.as_ref());
        let native_center = device.native_resolution().unwrap_or(mode).center();
        let format = StreamFormat::new(mode, Orientation::BottomUp);

        info!("Virtual camera on {} device, default format {}", device.kind(), mode);

        Self {
            config,
            clock,
            device,
            format,
            mode,
            native_center,
            focus: native_center,
            smoother: FocusSmoother::new(),
            pacer: FramePacer::new(format.frame_interval()),
            counters: Arc::new(StreamCounters::default()),
            streaming: false,
            lost_reported: false,
        }
    }

    pub fn device_kind(&self) -> SensorKind {
        self.device.kind()
    }

    /// Catalogue offered to the host, the current format first
    pub fn capabilities(&self) -> Vec<VideoResolution> {
        capabilities(self.format.resolution, self.device.video_resolutions())
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn counters(&self) -> Arc<StreamCounters> {
        self.counters.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Catalogue entry that would serve `requested` under the configured
    /// policy
    pub fn check_format(&self, requested: &StreamFormat) -> Result<VideoResolution, StreamError> {
        let config = self.config.snapshot();
        let catalogue = self.device.video_resolutions();

        match_format(
            catalogue,
            requested,
            config.output.negotiation,
            config.output.min_framerate,
        )
        .map(|index| catalogue[index])
        .ok_or_else(|| StreamError::NoMatchingFormat(requested.resolution.to_string()))
    }

    /// Adopt the host's format. The framerate the host asked for sets the
    /// frame interval.
    pub fn set_format(&mut self, requested: StreamFormat) -> Result<(), StreamError> {
        if self.streaming {
            return Err(StreamError::AlreadyStreaming);
        }

        self.mode = self.check_format(&requested)?;
        self.format = requested;
        info!(
            "Negotiated {} ({:?}, flip {})",
            requested.resolution,
            requested.orientation,
            requested.flip()
        );
        Ok(())
    }

    /// Return to the device's preferred mode, bottom-up
    pub fn reset_format(&mut self) -> Result<(), StreamError> {
        if self.streaming {
            return Err(StreamError::AlreadyStreaming);
        }

        self.mode = preferred_mode(self.device.as_ref());
        self.format = StreamFormat::new(self.mode, Orientation::BottomUp);
        debug!("Format reset to {}", self.mode);
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.device.kind()))]
    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.streaming {
            return Err(StreamError::AlreadyStreaming);
        }

        self.config.reload();
        self.device.video_set_resolution(self.mode);
        self.device.video_flip_output(self.format.flip());
        self.device.connect_to_first()?;

        self.pacer = FramePacer::new(self.format.frame_interval());
        self.counters.reset(self.format.sample_size());
        self.streaming = true;
        self.lost_reported = false;

        info!("Streaming {}", self.format.resolution);
        Ok(())
    }

    pub fn stop(&mut self) {
        if !std::mem::take(&mut self.streaming) {
            return;
        }

        self.device.disconnect();
        info!(
            "Stream stopped: {} delivered, {} dropped",
            self.counters.frames_delivered(),
            self.counters.frames_dropped()
        );
    }

    /// Produce the next sample into `out`.
    ///
    /// Waits when ahead of schedule. When the device has nothing new the
    /// buffer is left untouched and the sample is still delivered.
    #[instrument(level = "trace", skip_all)]
    pub fn fill(&mut self, out: &mut [u8]) -> Result<FrameSample, StreamError> {
        if !self.streaming {
            return Err(StreamError::NotStreaming);
        }

        let size = self.format.sample_size();
        if out.len() < size {
            return Err(StreamError::OutputTooSmall {
                required: size,
                actual: out.len(),
            });
        }

        let paced = self.pacer.next_frame(self.clock.now());
        if let Some(wait) = paced.wait {
            self.clock.sleep(wait);
        }
        if paced.discontinuity {
            debug!(
                "Dropped {} frame(s), {} total",
                paced.newly_dropped,
                self.pacer.dropped_count()
            );
            self.counters.record_drop(paced.newly_dropped);
        }

        // one snapshot per frame, taken before the device is touched
        let config = self.config.snapshot();
        self.device.focus_set_joint(config.tracking.joint);
        self.device.green_screen_enable(config.output.green_screen);

        let outcome = match self.device.update() {
            Ok(outcome) => outcome,
            Err(DeviceError::ConnectionLost) => {
                if !std::mem::replace(&mut self.lost_reported, true) {
                    warn!("Sensor connection lost, serving stale frames until restart");
                }
                PollOutcome::Pending
            }
            Err(e) => {
                warn!("Device poll failed: {}", e);
                PollOutcome::Pending
            }
        };

        if !config.tracking.enabled {
            self.focus = self.native_center;
        } else if self.device.focus_available() {
            self.focus = self.smoother.push(self.device.focus_point());
        }

        let fresh = outcome.has_new_color();
        if fresh {
            let res = self.format.resolution;
            self.device.color_data(
                self.focus,
                res.width,
                res.height,
                res.bits_per_pixel,
                &mut out[..size],
            )?;
        }

        self.counters.record_delivered();
        trace!(start = paced.start, fresh, ?outcome, "Sample delivered");

        Ok(FrameSample {
            start: paced.start,
            end: paced.end,
            discontinuity: paced.discontinuity,
            sync_point: true,
            fresh,
            size,
        })
    }

    /// Current crop center in native color coordinates
    pub fn focus(&self) -> FocusPoint {
        self.focus
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fill samples back to back and hand each one to `tx` until `running`
/// clears or the receiver goes away. A fill error ends the loop and is
/// returned; the sender is released either way once the caller drops it.
pub fn pull_frames(
    camera: &mut VirtualCamera,
    tx: &Sender<(FrameSample, Bytes)>,
    running: &AtomicBool,
) -> Result<(), StreamError> {
    let mut buffer = vec![0u8; camera.format().sample_size()];
    while running.load(Ordering::Relaxed) {
        let sample = camera.fill(&mut buffer)?;
        if tx.send((sample, Bytes::copy_from_slice(&buffer[..sample.size]))).is_err() {
            debug!("Frame receiver closed");
            break;
        }
    }
    Ok(())
}

fn preferred_mode(device: &dyn Device) -> VideoResolution {
    device
        .video_resolution(device.video_resolution_preferred())
        .unwrap_or(VideoResolution::new(320, 240, 24, 10, PixelFormat::Rgb))
}

fn select_device(preference: &[SensorKind], probe: &SensorProbe) -> Box<dyn Device> {
    for &kind in preference {
        let Some(mut device) = device_factory(kind, probe) else {
            debug!("No {} sensor on this host", kind);
            continue;
        };

        match device.connect_to_first() {
            Ok(()) => {
                device.disconnect();
                info!("Selected {} sensor", kind);
                return device;
            }
            Err(e) => info!("Skipping {} sensor: {}", kind, e),
        }
    }

    info!("No sensor found, using the placeholder device");
    Box::new(NullDevice::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{interval_from_rate, PixelFormat};
    use crate::capture::synthetic::SyntheticBodySensor;
    use crate::pipeline::clock::ManualClock;
    use crate::pipeline::negotiate::MatchPolicy;
    use crate::Config;

    fn null_camera(clock: &ManualClock) -> VirtualCamera {
        let mut config = Config::default();
        config.sensors.preference = vec![];
        VirtualCamera::open(ConfigHandle::fixed(config), &SensorProbe::empty(), Arc::new(clock.clone()))
    }

    #[test]
    fn falls_back_to_placeholder() {
        let camera = null_camera(&ManualClock::new());
        assert_eq!(camera.device_kind(), SensorKind::Null);
        assert_eq!(camera.capabilities().len(), 2);
        assert_eq!(camera.format().orientation, Orientation::BottomUp);
    }

    #[test]
    fn fill_requires_streaming_and_room() {
        let clock = ManualClock::new();
        let mut camera = null_camera(&clock);
        let mut out = vec![0u8; 320 * 240 * 3];
        assert!(matches!(camera.fill(&mut out), Err(StreamError::NotStreaming)));

        camera.start().unwrap();
        assert!(matches!(camera.start(), Err(StreamError::AlreadyStreaming)));
        let mut short = vec![0u8; 16];
        assert!(matches!(
            camera.fill(&mut short),
            Err(StreamError::OutputTooSmall { .. })
        ));
    }

    #[test]
    fn format_is_fixed_while_streaming() {
        let clock = ManualClock::new();
        let mut camera = null_camera(&clock);
        let format = camera.format();

        camera.start().unwrap();
        assert!(matches!(camera.set_format(format), Err(StreamError::AlreadyStreaming)));
        camera.stop();
        camera.set_format(format).unwrap();
    }

    #[test]
    fn capabilities_lead_with_negotiated_format_until_reset() {
        let clock = ManualClock::new();
        let sensor = SyntheticBodySensor::new(640, 480, 320, 240);
        let mut config = Config::default();
        config.sensors.preference = vec![SensorKind::DepthBody];
        let probe = SensorProbe::empty().with_body_driver(Arc::new(sensor));
        let mut camera = VirtualCamera::open(ConfigHandle::fixed(config), &probe, Arc::new(clock));

        let preferred = camera.capabilities()[0];
        assert_eq!((preferred.width, preferred.height, preferred.bits_per_pixel), (320, 240, 32));

        let chosen = StreamFormat::from_bitmap(640, 480, 24, 30, PixelFormat::Rgb);
        camera.set_format(chosen).unwrap();
        let caps = camera.capabilities();
        assert_eq!(caps[0], chosen.resolution);
        assert_eq!(caps.len(), 9);
        assert_eq!(caps[1], preferred);

        camera.start().unwrap();
        assert!(matches!(camera.reset_format(), Err(StreamError::AlreadyStreaming)));
        camera.stop();

        camera.reset_format().unwrap();
        assert_eq!(camera.capabilities()[0], preferred);
        assert_eq!(camera.format().orientation, Orientation::BottomUp);
    }

    #[test]
    fn pulling_stops_with_the_first_fill_error() {
        let (tx, rx) = flume::bounded(4);
        let running = Arc::new(AtomicBool::new(true));

        let pulling = running.clone();
        let puller = std::thread::spawn(move || {
            // never started, so the first fill fails
            let mut camera = null_camera(&ManualClock::new());
            pull_frames(&mut camera, &tx, &pulling)
        });

        // the sender is gone with the thread; the receiver must not hang
        assert!(rx.recv().is_err());
        assert!(running.load(Ordering::Relaxed));
        assert!(matches!(puller.join().unwrap(), Err(StreamError::NotStreaming)));
    }

    #[test]
    fn pulling_ends_quietly_when_receiver_or_flag_goes() {
        let clock = ManualClock::new();
        let mut camera = null_camera(&clock);
        camera.start().unwrap();

        let (tx, rx) = flume::bounded(4);
        let stopped = AtomicBool::new(false);
        pull_frames(&mut camera, &tx, &stopped).unwrap();
        assert!(rx.try_recv().is_err());

        drop(rx);
        pull_frames(&mut camera, &tx, &AtomicBool::new(true)).unwrap();
        assert_eq!(camera.counters().frames_delivered(), 1);
    }

    #[test]
    fn null_stream_of_300_frames_drops_nothing() {
        let clock = ManualClock::new();
        let mut camera = null_camera(&clock);
        camera
            .set_format(StreamFormat::from_bitmap(320, 240, 24, 10, PixelFormat::Rgb))
            .unwrap();
        camera.start().unwrap();

        let t = interval_from_rate(10);
        let mut out = vec![0u8; 320 * 240 * 3];
        for k in 0..300 {
            let sample = camera.fill(&mut out).unwrap();
            assert_eq!(sample.start, k * t);
            assert!(sample.sync_point && sample.fresh && !sample.discontinuity);
            clock.advance(t);
        }

        let counters = camera.counters();
        assert_eq!(counters.frames_delivered(), 300);
        assert_eq!(counters.frames_dropped(), 0);
        assert_eq!(counters.average_frame_size(), 320 * 240 * 3);
        assert_eq!(clock.slept(), 0);
    }

    #[test]
    fn tracking_follows_subject_and_disabling_recenters() {
        let clock = ManualClock::new();
        let sensor = SyntheticBodySensor::new(640, 480, 320, 240);
        sensor.set_animated(false);
        sensor.set_subject(Some(FocusPoint::new(100, 400)));

        let mut config = Config::default();
        config.sensors.preference = vec![SensorKind::DepthBody];
        config.output.negotiation = MatchPolicy::Strict;
        let handle = ConfigHandle::fixed(config.clone());
        let probe = SensorProbe::empty().with_body_driver(Arc::new(sensor.clone()));

        let mut camera = VirtualCamera::open(handle.clone(), &probe, Arc::new(clock.clone()));
        assert_eq!(camera.device_kind(), SensorKind::DepthBody);
        assert_eq!(camera.focus(), FocusPoint::new(960, 540));

        camera.start().unwrap();
        let mut out = vec![0u8; 320 * 240 * 4];
        for _ in 0..3 {
            camera.fill(&mut out).unwrap();
            clock.advance(interval_from_rate(30));
        }
        assert_eq!(camera.focus(), FocusPoint::new(100, 400));

        // subject leaves: the last smoothed position is held
        sensor.set_subject(None);
        camera.fill(&mut out).unwrap();
        assert_eq!(camera.focus(), FocusPoint::new(100, 400));

        config.tracking.enabled = false;
        handle.store(config);
        camera.fill(&mut out).unwrap();
        assert_eq!(camera.focus(), FocusPoint::new(960, 540));
    }

    #[test]
    fn lost_sensor_keeps_the_stream_alive() {
        let clock = ManualClock::new();
        let sensor = SyntheticBodySensor::new(320, 240, 160, 120);
        let mut config = Config::default();
        config.sensors.preference = vec![SensorKind::DepthBody];
        let probe = SensorProbe::empty().with_body_driver(Arc::new(sensor.clone()));

        let mut camera = VirtualCamera::open(ConfigHandle::fixed(config), &probe, Arc::new(clock.clone()));
        camera.start().unwrap();

        let mut out = vec![0u8; 320 * 240 * 4];
        assert!(camera.fill(&mut out).unwrap().fresh);

        sensor.set_present(false);
        for _ in 0..5 {
            clock.advance(interval_from_rate(30));
            let sample = camera.fill(&mut out).unwrap();
            assert!(!sample.fresh);
        }
        assert_eq!(camera.counters().frames_delivered(), 6);

        // a restart reconnects
        camera.stop();
        sensor.set_present(true);
        camera.start().unwrap();
        assert!(camera.fill(&mut out).unwrap().fresh);
    }
}
