pub mod camera;
pub mod capture;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use camera::{Camera, CameraBuilder};
pub use capture::{Credentials, FrameEvent, MotionConfig};
pub use error::{CameraError, ConnectionError, DecodeError, Result};
pub use pipeline::{Subscription, TopologyState};

/// Process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from an optional TOML file, then `NETCAM__SECTION__KEY` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("NETCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Configuration consumed when constructing a [`Camera`]
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Source identifier stamped on every frame; generated when absent
    pub name: Option<String>,
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Only forward frames the motion filter flags
    pub motion: bool,
    pub connect_timeout_ms: u64,
    pub screenshot_timeout_ms: u64,
    /// Per-consumer channel slots before frames are dropped for that consumer
    pub consumer_buffer: usize,
    pub max_frame_bytes: usize,
    pub reconnect: ReconnectConfig,
    pub motion_detection: MotionConfig,
}

impl CameraConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.user.as_ref().map(|user| {
            Credentials::new(user.clone(), self.password.clone().unwrap_or_default())
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn screenshot_timeout(&self) -> Duration {
        Duration::from_millis(self.screenshot_timeout_ms)
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: None,
            url: String::new(),
            user: None,
            password: None,
            motion: false,
            connect_timeout_ms: 5_000,
            screenshot_timeout_ms: 10_000,
            consumer_buffer: 16,
            max_frame_bytes: capture::decoder::DEFAULT_MAX_FRAME_BYTES,
            reconnect: ReconnectConfig::default(),
            motion_detection: MotionConfig::default(),
        }
    }
}

impl fmt::Debug for CameraConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraConfig")
            .field("name", &self.name)
            .field("url", &utils::redact_url(&self.url))
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("motion", &self.motion)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("screenshot_timeout_ms", &self.screenshot_timeout_ms)
            .field("consumer_buffer", &self.consumer_buffer)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("reconnect", &self.reconnect)
            .field("motion_detection", &self.motion_detection)
            .finish()
    }
}

/// Reconnect policy for continuous streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay; 0 retries immediately
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of each delay that may be shaved off at random (0.0..=1.0)
    pub jitter: f64,
    /// Stop after this many consecutive reconnect attempts; retry forever when unset
    pub max_attempts: Option<u32>,
}

impl ReconnectConfig {
    /// Retry forever with no delay
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "netcam=info".into(),
        }
    }
}

/// Counters collected throughout the pipeline, mirrored to the `metrics` facade
pub struct Metrics {
    frames_published: Tally,
    frames_discarded: Tally,
    frames_dropped: Tally,
    connections_opened: Tally,
    reconnects: Tally,
    screenshots: Tally,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_published: u64,
    pub frames_discarded: u64,
    pub frames_dropped: u64,
    pub connections_opened: u64,
    pub reconnects: u64,
    pub screenshots: u64,
}

struct Tally {
    value: AtomicU64,
    counter: metrics::Counter,
}

impl Tally {
    fn new(name: &'static str, camera: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            counter: metrics::counter!(name, "camera" => camera.to_owned()),
        }
    }

    fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
        self.counter.increment(n);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metrics {
    pub fn new(camera: &str) -> Self {
        Self {
            frames_published: Tally::new("netcam_frames_published_total", camera),
            frames_discarded: Tally::new("netcam_frames_discarded_total", camera),
            frames_dropped: Tally::new("netcam_frames_dropped_total", camera),
            connections_opened: Tally::new("netcam_connections_opened_total", camera),
            reconnects: Tally::new("netcam_reconnects_total", camera),
            screenshots: Tally::new("netcam_screenshots_total", camera),
        }
    }

    pub(crate) fn frame_published(&self) {
        self.frames_published.add(1);
    }

    pub(crate) fn frame_discarded(&self) {
        self.frames_discarded.add(1);
    }

    pub(crate) fn frames_dropped(&self, n: u64) {
        if n > 0 {
            self.frames_dropped.add(n);
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.connections_opened.add(1);
    }

    pub(crate) fn reconnect(&self) {
        self.reconnects.add(1);
    }

    pub(crate) fn screenshot(&self) {
        self.screenshots.add(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_published: self.frames_published.get(),
            frames_discarded: self.frames_discarded.get(),
            frames_dropped: self.frames_dropped.get(),
            connections_opened: self.connections_opened.get(),
            reconnects: self.reconnects.get(),
            screenshots: self.screenshots.get(),
        }
    }
}
