//! One-time capability probe, threaded through to the device factory

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::body::BodySensorDriver;
use super::synthetic::SyntheticBodySensor;
use super::SensorKind;
use crate::SensorConfig;

/// What sensor backends this host offers. A missing backend behaves exactly
/// like "no sensor found".
#[derive(Clone, Default)]
pub struct SensorProbe {
    body_driver: Option<Arc<dyn BodySensorDriver>>,
    v4l2_path: Option<PathBuf>,
}

impl SensorProbe {
    /// Probe that finds nothing; only the null device can be built from it
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn run(config: &SensorConfig) -> Self {
        let mut probe = Self::empty();

        if config.synthetic {
            info!("Using the synthetic depth/body sensor");
            probe.body_driver = Some(Arc::new(SyntheticBodySensor::default()));
        } else {
            debug!("No depth/body driver library on this host");
        }

        probe.v4l2_path = probe_v4l2(&config.v4l2_path);
        probe
    }

    pub fn with_body_driver(mut self, driver: Arc<dyn BodySensorDriver>) -> Self {
        self.body_driver = Some(driver);
        self
    }

    pub fn with_v4l2_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.v4l2_path = Some(path.into());
        self
    }

    pub fn body_driver(&self) -> Option<Arc<dyn BodySensorDriver>> {
        self.body_driver.clone()
    }

    pub fn v4l2_path(&self) -> Option<&Path> {
        self.v4l2_path.as_deref()
    }

    pub fn supports(&self, kind: SensorKind) -> bool {
        match kind {
            SensorKind::Null => true,
            SensorKind::BasicColor => self.v4l2_path.is_some(),
            SensorKind::DepthBody => self.body_driver.is_some(),
        }
    }
}

impl fmt::Debug for SensorProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorProbe")
            .field("body_driver", &self.body_driver.as_ref().map(|d| d.name().to_owned()))
            .field("v4l2_path", &self.v4l2_path)
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn probe_v4l2(configured: &Path) -> Option<PathBuf> {
    if configured.as_os_str().is_empty() {
        return crate::utils::find_capture_device();
    }
    if configured.exists() {
        return Some(configured.to_path_buf());
    }
    debug!("Configured capture device {} does not exist", configured.display());
    None
}

#[cfg(not(target_os = "linux"))]
fn probe_v4l2(_configured: &Path) -> Option<PathBuf> {
    None
}
