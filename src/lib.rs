pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{
    BufferSink, CaptureBackend, CaptureGraph, DeviceCatalog, DeviceDescriptor, FrameFormat,
    FrameInfo, Negotiation, PixelFormat, SimulatedBackend, SimulatedDevice, StreamCapability,
};
pub use error::{CaptureError, Result};
pub use pipeline::{
    FrameHandle, FrameWindow, StreamEvent, SubscribeConfig, Subscription, WindowConfig,
};
pub use session::{CaptureSession, FrameStream, SessionConfig, SessionState, SessionStats};

/// Environment variable prefix, e.g. `FRAMECAP__CAPTURE__WIDTH=1280`
pub const ENV_PREFIX: &str = "FRAMECAP";

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device id; `None` picks the first device found
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frame ring slots (K), at least 2
    pub slot_count: usize,
    /// Mailbox depth of unthrottled subscribers, capped at `slot_count - 2`
    pub queue_depth: usize,
    /// Preview consumer throttle
    pub preview_interval_ms: u64,
    /// Frame rate statistics window
    pub stats_window: usize,
    pub stats_stride: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: 640,
            height: 480,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            slot_count: 3,
            queue_depth: pipeline::DEFAULT_QUEUE_DEPTH,
            preview_interval_ms: 33, // ~30 fps preview
            stats_window: 30,
            stats_stride: 5,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then `FRAMECAP__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        Self::from_builder(builder)
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig::from(&self.pipeline)
    }
}
