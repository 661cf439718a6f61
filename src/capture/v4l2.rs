//! Color-only webcam over V4L2 memory-mapped streaming

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device as V4lHandle, FourCC};

use super::frame::{FocusPoint, PixelFormat, VideoResolution};
use super::{composite_color, Device, PollOutcome, SensorKind};
use crate::compose::convert::yuyv_to_bgra;
use crate::compose::{SourceFormat, SourceFrame};
use crate::error::DeviceError;

const YUYV: &[u8; 4] = b"YUYV";
const BUFFER_COUNT: u32 = 4;
const DEFAULT_FRAMERATE: u32 = 30;

/// Webcam device. Captures YUYV at the native size and converts to BGRA
/// when an RGB output is negotiated.
pub struct V4l2Device {
    path: PathBuf,
    resolutions: Vec<VideoResolution>,
    preferred: usize,
    native: usize,

    handle: Option<V4lHandle>,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    raw: Vec<u8>,
    color: Vec<u8>,
    color_layout: SourceFormat,
    format: PixelFormat,
    flip: bool,
    lost: bool,
}

impl V4l2Device {
    /// Query the device once and build its catalogue from the YUYV frame
    /// sizes it advertises. The device stays closed until connect.
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let handle = V4lHandle::with_path(path).map_err(unavailable)?;

        let caps = handle.query_caps().map_err(unavailable)?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DeviceError::Unavailable(format!("{} cannot capture video", caps.card)));
        }

        let mut sizes = Vec::new();
        for size in handle.enum_framesizes(FourCC::new(YUYV)).map_err(unavailable)? {
            match size.size {
                FrameSizeEnum::Discrete(d) => sizes.push((d.width, d.height)),
                FrameSizeEnum::Stepwise(s) => sizes.push((s.max_width, s.max_height)),
            }
        }
        sizes.sort_by_key(|&(w, h)| (w as u64 * h as u64, w));
        sizes.dedup();

        if sizes.is_empty() {
            return Err(DeviceError::Unavailable(format!("{} offers no YUYV frame sizes", caps.card)));
        }

        let mut resolutions = Vec::with_capacity(sizes.len() * 3);
        for &(width, height) in &sizes {
            let fps = framerate_for(&handle, width, height);
            for format in [PixelFormat::Rgba, PixelFormat::Rgb, PixelFormat::Yuy2] {
                resolutions.push(VideoResolution::new(width, height, format.bits_per_pixel(), fps, format));
            }
        }

        let native = (sizes.len() - 1) * 3;
        let preferred = sizes.iter().position(|&(w, _)| w >= 320).unwrap_or(0) * 3;

        info!(
            "V4L2 device {} ({}): {} frame sizes, native {}",
            path.display(),
            caps.card,
            sizes.len(),
            resolutions[native]
        );

        Ok(Self {
            path: path.to_path_buf(),
            resolutions,
            preferred,
            native,
            handle: None,
            stream: None,
            width: 0,
            height: 0,
            raw: Vec::new(),
            color: Vec::new(),
            color_layout: SourceFormat::Bgra32,
            format: PixelFormat::Rgba,
            flip: false,
            lost: false,
        })
    }

    fn start_capture(&mut self) -> io::Result<()> {
        let native = self.resolutions[self.native];
        let handle = V4lHandle::with_path(&self.path)?;

        let mut fmt = handle.format()?;
        fmt.width = native.width;
        fmt.height = native.height;
        fmt.fourcc = FourCC::new(YUYV);
        let fmt = handle.set_format(&fmt)?;
        if fmt.fourcc != FourCC::new(YUYV) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "driver refused YUYV capture"));
        }

        if let Err(e) = handle.set_params(&Parameters::with_fps(native.framerate)) {
            debug!("Driver kept its own frame interval: {}", e);
        }

        let mut stream = MmapStream::with_buffers(&handle, Type::VideoCapture, BUFFER_COUNT)?;

        self.width = fmt.width;
        self.height = fmt.height;
        let pixels = fmt.width as usize * fmt.height as usize;
        self.raw = vec![0; pixels * 2];
        self.color = vec![0; pixels * 4];
        self.color_layout = SourceFormat::for_output(self.format);

        // the first dequeue starts streaming and may block until the
        // sensor delivers; this is connect time, not the frame path
        let (buf, _) = stream.next()?;
        let len = buf.len().min(self.raw.len());
        self.raw[..len].copy_from_slice(&buf[..len]);
        self.convert();

        self.stream = Some(stream);
        self.handle = Some(handle);
        Ok(())
    }

    /// Raw capture into the color buffer, in the layout the output needs
    fn convert(&mut self) {
        let pixels = self.width as usize * self.height as usize;
        self.color_layout = SourceFormat::for_output(self.format);
        match self.color_layout {
            SourceFormat::Bgra32 => yuyv_to_bgra(&self.raw, &mut self.color[..pixels * 4]),
            SourceFormat::Yuy2 => self.color[..pixels * 2].copy_from_slice(&self.raw[..pixels * 2]),
        }
    }

    /// Whether a dequeue would not block
    fn readable(handle: &V4lHandle) -> Result<bool, DeviceError> {
        let owner = handle.handle();
        poll_readable(borrow_from(&owner, owner.fd()))
    }
}

/// Borrow a descriptor for as long as `owner`, which must hold it open
fn borrow_from<T>(_owner: &T, fd: RawFd) -> BorrowedFd<'_> {
    // SAFETY: `owner` keeps `fd` open and the borrow cannot outlive it
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// Zero-timeout readiness check
fn poll_readable(fd: BorrowedFd<'_>) -> Result<bool, DeviceError> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(0) => Ok(false),
        Ok(_) => {
            let events = fds[0].revents().unwrap_or(PollFlags::empty());
            if events.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                return Err(DeviceError::ConnectionLost);
            }
            Ok(events.contains(PollFlags::POLLIN))
        }
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(DeviceError::AcquisitionFailure(e.to_string())),
    }
}

fn unavailable(e: io::Error) -> DeviceError {
    DeviceError::Unavailable(e.to_string())
}

/// Highest discrete rate up to the default, or the default
fn framerate_for(handle: &V4lHandle, width: u32, height: u32) -> u32 {
    let Ok(intervals) = handle.enum_frameintervals(FourCC::new(YUYV), width, height) else {
        return DEFAULT_FRAMERATE;
    };

    intervals
        .iter()
        .filter_map(|interval| match &interval.interval {
            FrameIntervalEnum::Discrete(f) if f.numerator > 0 => Some(f.denominator / f.numerator),
            _ => None,
        })
        .filter(|&fps| fps > 0 && fps <= DEFAULT_FRAMERATE)
        .max()
        .unwrap_or(DEFAULT_FRAMERATE)
}

impl Device for V4l2Device {
    fn kind(&self) -> SensorKind {
        SensorKind::BasicColor
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn connect_to_first(&mut self) -> Result<(), DeviceError> {
        self.disconnect();

        if let Err(e) = self.start_capture() {
            self.disconnect();
            return Err(unavailable(e));
        }

        info!("V4L2 capture started at {}x{}", self.width, self.height);
        Ok(())
    }

    fn disconnect(&mut self) {
        // the stream unmaps its buffers before the handle closes the fd
        let was_connected = self.stream.take().is_some();
        self.handle = None;
        self.raw = Vec::new();
        self.color = Vec::new();
        self.lost = false;

        if was_connected {
            info!("V4L2 capture stopped");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some() && !self.lost
    }

    fn video_resolutions(&self) -> &[VideoResolution] {
        &self.resolutions
    }

    fn video_resolution_preferred(&self) -> usize {
        self.preferred
    }

    fn video_resolution_native(&self) -> usize {
        self.native
    }

    fn video_set_resolution(&mut self, resolution: VideoResolution) {
        self.format = resolution.pixel_format;
    }

    fn video_flip_output(&mut self, flip: bool) {
        self.flip = flip;
    }

    fn update(&mut self) -> Result<PollOutcome, DeviceError> {
        if self.lost {
            return Err(DeviceError::ConnectionLost);
        }
        let (Some(handle), Some(stream)) = (self.handle.as_ref(), self.stream.as_mut()) else {
            return Err(DeviceError::NotConnected);
        };

        match Self::readable(handle) {
            Ok(true) => {}
            Ok(false) => return Ok(PollOutcome::Pending),
            Err(DeviceError::ConnectionLost) => {
                error!("V4L2 device {} went away", self.path.display());
                self.lost = true;
                return Err(DeviceError::ConnectionLost);
            }
            Err(e) => {
                warn!("Polling {} failed: {}", self.path.display(), e);
                return Ok(PollOutcome::Pending);
            }
        }

        match stream.next() {
            Ok((buf, _)) => {
                let len = buf.len().min(self.raw.len());
                self.raw[..len].copy_from_slice(&buf[..len]);
            }
            Err(e) if e.raw_os_error() == Some(Errno::ENODEV as i32) => {
                error!("V4L2 device {} went away", self.path.display());
                self.lost = true;
                return Err(DeviceError::ConnectionLost);
            }
            Err(e) => {
                warn!("Failed to dequeue a V4L2 buffer: {}", e);
                metrics::counter!("vcam_acquisition_failures_total", "stream" => "color").increment(1);
                return Ok(PollOutcome::Pending);
            }
        }

        self.convert();
        // no auxiliary streams: every new color frame is complete
        Ok(PollOutcome::Complete)
    }

    fn color_data(
        &mut self,
        focus: FocusPoint,
        width: u32,
        height: u32,
        bits_per_pixel: u32,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::NotConnected);
        }

        let layout = self.color_layout;
        let pixels = self.width as usize * self.height as usize;
        let src = SourceFrame {
            width: self.width,
            height: self.height,
            format: layout,
            data: &self.color[..pixels * layout.bytes_per_pixel()],
            mask: None,
        };

        composite_color(&src, self.format, self.flip, focus, width, height, bits_per_pixel, out)
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.disconnect();
    }
}
