//! Failure taxonomy shared by devices, the compositor and the stream

use thiserror::Error;

use crate::capture::frame::PixelFormat;

/// Errors reported by a [`Device`](crate::capture::Device).
///
/// A poll that finds no new frame is not an error; see
/// [`PollOutcome::Pending`](crate::capture::PollOutcome::Pending).
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No sensor found, driver missing, or a stream failed to open
    #[error("sensor unavailable: {0}")]
    Unavailable(String),

    /// The device has no acquired color data (never connected or disconnected)
    #[error("device is not connected")]
    NotConnected,

    /// A frame handle could not be locked or copied
    #[error("frame acquisition failed: {0}")]
    AcquisitionFailure(String),

    /// The requested crop or format cannot be served from the current buffer
    #[error("format mismatch: requested {width}x{height}x{bpp}, {reason}")]
    FormatMismatch {
        width: u32,
        height: u32,
        bpp: u32,
        reason: String,
    },

    /// Sensor disappeared mid-stream; polls stay empty until reconnect
    #[error("connection to the sensor was lost")]
    ConnectionLost,
}

impl DeviceError {
    pub(crate) fn mismatch(width: u32, height: u32, bpp: u32, reason: impl Into<String>) -> Self {
        DeviceError::FormatMismatch {
            width,
            height,
            bpp,
            reason: reason.into(),
        }
    }
}

/// Errors of the region compositor. Nothing is written when one is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComposeError {
    #[error("region {dst_width}x{dst_height} exceeds source {src_width}x{src_height}")]
    RegionTooLarge {
        src_width: u32,
        src_height: u32,
        dst_width: u32,
        dst_height: u32,
    },

    #[error("{what} buffer holds {actual} bytes, {required} required")]
    BufferTooSmall {
        what: &'static str,
        required: usize,
        actual: usize,
    },

    #[error("no conversion from {from} source to {to} output")]
    UnsupportedConversion { from: &'static str, to: PixelFormat },
}

/// Errors surfaced to the host by the stream
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is not running")]
    NotStreaming,

    #[error("stream is already running")]
    AlreadyStreaming,

    #[error("no catalogue entry matches {0}")]
    NoMatchingFormat(String),

    #[error("output buffer holds {actual} bytes, {required} required")]
    OutputTooSmall { required: usize, actual: usize },

    #[error(transparent)]
    Device(#[from] DeviceError),
}
