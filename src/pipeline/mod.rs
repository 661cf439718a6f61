//! Frame delivery: pacing, focus smoothing and the stream driver

pub mod clock;
pub mod focus;
pub mod negotiate;
pub mod pacing;
pub mod stream;

pub use clock::{HostClock, ManualClock, MonotonicClock};
pub use focus::FocusSmoother;
pub use negotiate::MatchPolicy;
pub use pacing::{FramePacer, PacedFrame};
pub use stream::{pull_frames, FrameSample, StreamCounters, VirtualCamera};
