//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RSTCHART_CONFIG)
//! 3. Environment variables

use rstchart_core::{Event, InterpreterOptions, DEFAULT_MAX_MICROSTEPS};
use rstchart_storage::CheckpointPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model to load.
    pub model: ModelConfig,
    /// Real-time clock driving.
    pub clock: ClockConfig,
    /// Interpreter limits.
    pub engine: EngineConfig,
    /// Checkpointing.
    pub checkpoint: CheckpointConfig,
    /// Emitted event output.
    pub output: OutputConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RSTCHART_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.model.apply_env_overrides();
        self.clock.apply_env_overrides();
        self.engine.apply_env_overrides();
        self.checkpoint.apply_env_overrides();
        self.output.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.clock.validate()?;
        self.engine.validate()?;
        self.checkpoint.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.to_lowercase() == "true")
}

/// Model configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to a YAML or JSON statechart description.
    pub path: Option<PathBuf>,
}

impl ModelConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("RSTCHART_MODEL") {
            self.path = Some(PathBuf::from(path));
        }
    }
}

/// How the simulated clock follows the wall clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Interval between clock advances, in milliseconds.
    pub tick_ms: u64,
    /// Simulated seconds per wall-clock second.
    pub speed: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            speed: 1.0,
        }
    }
}

impl ClockConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(tick) = std::env::var("RSTCHART_TICK_MS") {
            if let Ok(ms) = tick.parse() {
                self.tick_ms = ms;
            }
        }

        if let Ok(speed) = std::env::var("RSTCHART_SPEED") {
            if let Ok(s) = speed.parse() {
                self.speed = s;
            }
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 {
            return Err(ConfigError::ValidationError(
                "clock.tick_ms must be positive".to_string(),
            ));
        }
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "clock.speed must be a positive number, got {}",
                self.speed
            )));
        }
        Ok(())
    }
}

/// Interpreter limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum microsteps per macrostep.
    pub max_microsteps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
        }
    }
}

impl EngineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("RSTCHART_MAX_MICROSTEPS") {
            if let Ok(n) = max.parse() {
                self.max_microsteps = n;
            }
        }
    }

    pub fn options(&self) -> InterpreterOptions {
        InterpreterOptions {
            max_microsteps: self.max_microsteps,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_microsteps == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_microsteps must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Enable checkpointing.
    pub enabled: bool,
    /// Checkpoint directory.
    pub dir: PathBuf,
    /// Session name checkpoints are filed under.
    pub session: String,
    /// Checkpoint after this many non-empty macrosteps (0 = only on shutdown).
    pub every_steps: u64,
    /// Checkpoints kept per session (0 = all).
    pub keep: usize,
    /// Resume from the session's latest checkpoint on startup.
    pub resume: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("./checkpoints"),
            session: "default".to_string(),
            every_steps: 0,
            keep: 10,
            resume: true,
        }
    }
}

impl CheckpointConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("RSTCHART_CHECKPOINT_ENABLED") {
            self.enabled = enabled;
        }

        if let Ok(dir) = std::env::var("RSTCHART_CHECKPOINT_DIR") {
            self.dir = PathBuf::from(dir);
        }

        if let Ok(every) = std::env::var("RSTCHART_CHECKPOINT_EVERY") {
            if let Ok(n) = every.parse() {
                self.every_steps = n;
            }
        }

        if let Ok(session) = std::env::var("RSTCHART_SESSION") {
            if !session.is_empty() {
                self.session = session;
            }
        }
    }

    pub fn policy(&self) -> CheckpointPolicy {
        match (self.enabled, self.every_steps) {
            (false, _) => CheckpointPolicy::Never,
            (true, 0) => CheckpointPolicy::OnShutdown,
            (true, n) => CheckpointPolicy::EveryNSteps(n),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.session.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "checkpoint.session must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rendering of emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// One JSON object per line.
    Json,
    /// `name(key=value, ...)`.
    Text,
}

impl OutputFormat {
    pub fn render(&self, event: &Event) -> String {
        match self {
            OutputFormat::Json => {
                serde_json::to_string(event).unwrap_or_else(|_| event.to_string())
            }
            OutputFormat::Text => event.to_string(),
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    /// Capacity of the emitted-event broadcast channel.
    pub channel_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Json,
            channel_capacity: 1024,
        }
    }
}

impl OutputConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(format) = std::env::var("RSTCHART_OUTPUT") {
            match format.to_lowercase().as_str() {
                "json" => self.format = OutputFormat::Json,
                "text" => self.format = OutputFormat::Text,
                other => tracing::warn!("Ignoring unknown RSTCHART_OUTPUT '{}'", other),
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
