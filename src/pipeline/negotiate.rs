//! Format negotiation against a device catalogue

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::frame::{StreamFormat, VideoResolution};

/// How closely a host's requested format must match a catalogue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// Size, depth and pixel format must match; any framerate from the
    /// configured minimum up to the entry's rate is accepted
    #[default]
    Lenient,
    /// Every field including the framerate must match
    Strict,
}

/// Index of the catalogue entry serving `requested`, if any
pub fn match_format(
    catalogue: &[VideoResolution],
    requested: &StreamFormat,
    policy: MatchPolicy,
    min_framerate: u32,
) -> Option<usize> {
    let want = requested.resolution;
    let found = catalogue.iter().position(|entry| {
        let shape = entry.width == want.width
            && entry.height == want.height
            && entry.bits_per_pixel == want.bits_per_pixel
            && entry.pixel_format == want.pixel_format;

        shape
            && match policy {
                MatchPolicy::Strict => entry.framerate == want.framerate,
                MatchPolicy::Lenient => (min_framerate..=entry.framerate).contains(&want.framerate),
            }
    });

    debug!(?policy, "Format {} {}", want, if found.is_some() { "accepted" } else { "rejected" });
    found
}

/// Host-facing capability list: the current format first, then the full
/// catalogue in order
pub fn capabilities(current: VideoResolution, catalogue: &[VideoResolution]) -> Vec<VideoResolution> {
    std::iter::once(current).chain(catalogue.iter().copied()).collect()
}
