use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use anyhow::Context as _;
use frame_bus::{
    encoder::EncoderConfig,
    frame::{FrameGeometry, PixelFormat},
};
use serde::{Deserialize, Serialize};

const CONFIG_ENV: &str = "CANVAS_RELAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "canvas-relay.json";

static CONFIG: OnceLock<RelayConfig> = OnceLock::new();

/// What the producer sends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// half-float RGBA, encoded from planar float
    #[default]
    Hdr,
    /// 8-bit RGBA
    Sdr,
}

impl RelayMode {
    pub fn format(self) -> PixelFormat {
        match self {
            RelayMode::Hdr => PixelFormat::Rgba16Half,
            RelayMode::Sdr => PixelFormat::Rgba8,
        }
    }

    fn default_output(self) -> &'static str {
        match self {
            RelayMode::Hdr => "output_hdr.mov",
            RelayMode::Sdr => "output.mov",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub listen: String,
    pub ws_path: String,
    pub mode: RelayMode,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub ffmpeg: String,
    // None = mode default
    pub output: Option<PathBuf>,
    // frames buffered between the socket and ffmpeg stdin
    pub queue_depth: usize,
    pub drain_timeout_secs: u64,
    pub ffmpeg_loglevel: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            ws_path: "/".to_string(),
            mode: RelayMode::default(),
            width: 4096,
            height: 2048,
            fps: 30,
            ffmpeg: "ffmpeg".to_string(),
            output: None,
            queue_depth: 2,
            drain_timeout_secs: 30,
            ffmpeg_loglevel: None,
        }
    }
}

impl RelayConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid relay config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::info!("config: {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        Self::from_json(&json).with_context(|| format!("in '{}'", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("width/height must be non-zero");
        }
        if self.fps == 0 {
            anyhow::bail!("fps must be non-zero");
        }
        if self.queue_depth == 0 {
            anyhow::bail!("queue_depth must be at least 1");
        }
        if !self.ws_path.starts_with('/') {
            anyhow::bail!("ws_path must start with '/'");
        }
        if self.ws_path == "/status" {
            anyhow::bail!("ws_path '/status' is reserved");
        }
        Ok(())
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height, self.mode.format())
    }

    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.mode.default_output()))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        let mut encoder = EncoderConfig::new(self.geometry(), self.output_path())
            .with_program(&self.ffmpeg)
            .with_fps(self.fps);
        encoder.loglevel = self.ffmpeg_loglevel.clone();
        encoder
    }
}

/// Loads the config named by `CANVAS_RELAY_CONFIG` (or `canvas-relay.json`).
pub fn init() -> anyhow::Result<&'static RelayConfig> {
    let path = std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = RelayConfig::load(&path)?;
    Ok(CONFIG.get_or_init(|| config))
}

pub fn config() -> &'static RelayConfig {
    CONFIG.get_or_init(RelayConfig::default)
}
