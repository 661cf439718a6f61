use std::path::{Path, PathBuf};

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

/// Find the first V4L2 node that can capture YUYV video
pub fn find_capture_device() -> Option<PathBuf> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = PathBuf::from(format!("/dev/video{}", i));
        if !path.exists() {
            continue;
        }

        if supports_yuyv_capture(&path) {
            return Some(path);
        }
        debug!("Skipping {}: no YUYV capture", path.display());
    }

    None
}

fn supports_yuyv_capture(path: &Path) -> bool {
    let Ok(dev) = Device::with_path(path) else {
        return false;
    };
    let Ok(caps) = dev.query_caps() else {
        return false;
    };
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return false;
    }

    let found = dev
        .enum_formats()
        .map(|formats| formats.iter().any(|fmt| fmt.fourcc == FourCC::new(b"YUYV")))
        .unwrap_or(false);
    if found {
        info!("Found YUYV device: {} - {}", path.display(), caps.card);
    }
    found
}
