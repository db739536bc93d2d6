use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::frame::FrameGeometry;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("frame geometry must be non-zero, got {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeometryConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
        }
    }
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_camera_device() -> String {
    "/dev/video21".to_string()
}

fn default_capture_fps() -> u32 {
    10
}

fn default_input_format() -> String {
    "mjpeg".to_string()
}

fn default_grace_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_camera_device")]
    pub camera_device: String,
    #[serde(default = "default_capture_fps")]
    pub capture_fps: u32,
    #[serde(default = "default_input_format")]
    pub input_format: String,
    /// Hardware decoder passed as `-hwaccel` for file sources.
    #[serde(default)]
    pub hwaccel: Option<String>,
    #[serde(default = "default_grace_ms")]
    pub stop_grace_ms: u64,
}

impl DecoderConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            camera_device: default_camera_device(),
            capture_fps: default_capture_fps(),
            input_format: default_input_format(),
            hwaccel: None,
            stop_grace_ms: default_grace_ms(),
        }
    }
}

fn default_stream_url() -> String {
    "rtsp://127.0.0.1/live/vigil".to_string()
}

fn default_stream_fps() -> u32 {
    10
}

fn default_codec() -> String {
    "libx264".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_stream_url")]
    pub url: String,
    #[serde(default = "default_stream_fps")]
    pub fps: u32,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_grace_ms")]
    pub stop_grace_ms: u64,
    /// Minimum spacing between encoder respawns after a failed write.
    #[serde(default = "default_respawn_interval_ms")]
    pub respawn_interval_ms: u64,
}

impl StreamConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn respawn_interval(&self) -> Duration {
        Duration::from_millis(self.respawn_interval_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            url: default_stream_url(),
            fps: default_stream_fps(),
            codec: default_codec(),
            stop_grace_ms: default_grace_ms(),
            respawn_interval_ms: default_respawn_interval_ms(),
        }
    }
}

fn default_respawn_interval_ms() -> u64 {
    1000
}

fn default_model_path() -> String {
    "model.onnx".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.25
}

fn default_intra_threads() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    /// Display names indexed by class id; missing entries render as `class_N`.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            confidence_threshold: default_confidence_threshold(),
            intra_threads: default_intra_threads(),
            labels: Vec::new(),
        }
    }
}

fn default_eval_period() -> u64 {
    50
}

fn default_score_threshold() -> f64 {
    150.0
}

fn default_base() -> f64 {
    5.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccumulatorConfig {
    #[serde(default)]
    pub target_class: usize,
    #[serde(default = "default_eval_period")]
    pub eval_period: u64,
    #[serde(default = "default_score_threshold")]
    pub threshold: f64,
    #[serde(default = "default_base")]
    pub base: f64,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            target_class: 0,
            eval_period: default_eval_period(),
            threshold: default_score_threshold(),
            base: default_base(),
        }
    }
}

fn default_chip() -> String {
    "/dev/gpiochip3".to_string()
}

fn default_line() -> u32 {
    27
}

fn default_consumer() -> String {
    "vigil".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorConfig {
    #[serde(default = "default_chip")]
    pub chip: String,
    #[serde(default = "default_line")]
    pub line: u32,
    #[serde(default = "default_consumer")]
    pub consumer: String,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            chip: default_chip(),
            line: default_line(),
            consumer: default_consumer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutostartConfig {
    Camera,
    File(PathBuf),
}

fn default_tick_ms() -> u64 {
    33
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub autostart: Option<AutostartConfig>,
}

impl PipelineConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            autostart: None,
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub accumulator: AccumulatorConfig,
    #[serde(default)]
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::args().nth(1) {
            Some(path) => Self::load_from(path),
            None => Self::load_from(DEFAULT_CONFIG_PATH),
        }
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.geometry()?;
        if self.decoder.capture_fps == 0 {
            return Err(ConfigError::Zero("decoder.capture_fps"));
        }
        if self.stream.fps == 0 {
            return Err(ConfigError::Zero("stream.fps"));
        }
        if self.pipeline.tick_ms == 0 {
            return Err(ConfigError::Zero("pipeline.tick_ms"));
        }
        if self.accumulator.eval_period == 0 {
            return Err(ConfigError::Zero("accumulator.eval_period"));
        }
        Ok(())
    }

    pub fn geometry(&self) -> Result<FrameGeometry, ConfigError> {
        let GeometryConfig { width, height } = self.geometry;
        FrameGeometry::new(width, height).ok_or(ConfigError::InvalidGeometry { width, height })
    }
}
