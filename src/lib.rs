//! Virtual camera pipeline: sensor devices, a region compositor and a paced
//! frame stream for frame-pulling hosts.

pub mod capture;
pub mod compose;
pub mod error;
pub mod pipeline;
#[cfg(target_os = "linux")]
pub mod utils;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use capture::body::JOINT_HEAD;
use capture::SensorKind;
use pipeline::negotiate::MatchPolicy;

pub use error::{ComposeError, DeviceError, StreamError};
pub use pipeline::stream::{FrameSample, StreamCounters, VirtualCamera};

/// Environment prefix for overrides, e.g. `VCAM_TRACKING__ENABLED=false`
pub const ENV_PREFIX: &str = "VCAM";

/// Runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracking: TrackingConfig,
    pub sensors: SensorConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub enabled: bool,
    /// Skeletal joint the crop follows
    pub joint: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Sensor kinds to try, first match wins. The null device is always
    /// the last resort.
    pub preference: Vec<SensorKind>,
    /// Webcam node; empty means auto-detect
    pub v4l2_path: PathBuf,
    /// Offer the simulated depth/body sensor
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub green_screen: bool,
    pub negotiation: MatchPolicy,
    /// Slowest framerate a host may negotiate under the lenient policy
    pub min_framerate: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            joint: JOINT_HEAD,
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            preference: vec![SensorKind::DepthBody, SensorKind::BasicColor],
            v4l2_path: PathBuf::from("/dev/video0"),
            synthetic: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            green_screen: false,
            negotiation: MatchPolicy::Lenient,
            min_framerate: 10,
        }
    }
}

impl Config {
    /// Layer an optional TOML file and `VCAM_*` environment overrides over
    /// the defaults
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("sensors.preference"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone)]
enum ConfigSource {
    /// Reload reads the file (if any) and the environment
    Layered(Option<PathBuf>),
    /// Only `store` changes the configuration
    Fixed,
}

/// Shared live configuration. Readers take whole snapshots, so a change is
/// never observed half applied.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    source: ConfigSource,
    current: Arc<ArcSwap<Config>>,
}

impl ConfigHandle {
    /// Load from `path` and the environment now; [`reload`](Self::reload)
    /// reads them again
    pub fn load(path: Option<PathBuf>) -> Self {
        let handle = Self {
            source: ConfigSource::Layered(path),
            current: Arc::new(ArcSwap::from_pointee(Config::default())),
        };
        handle.reload();
        handle
    }

    /// Handle that never reads external sources
    pub fn fixed(config: Config) -> Self {
        Self {
            source: ConfigSource::Fixed,
            current: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn store(&self, config: Config) {
        self.current.store(Arc::new(config));
    }

    /// Re-read the configuration source. An unreadable source yields the
    /// defaults.
    pub fn reload(&self) -> Arc<Config> {
        if let ConfigSource::Layered(path) = &self.source {
            let config = match Config::load(path.as_deref()) {
                Ok(config) => {
                    info!("Configuration loaded");
                    config
                }
                Err(e) => {
                    warn!("Configuration unavailable, using defaults: {}", e);
                    Config::default()
                }
            };
            self.store(config);
        }
        self.snapshot()
    }
}
