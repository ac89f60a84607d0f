use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Layered: compiled defaults, then the optional TOML file named by
/// `ATTENDANCE_CONFIG`, then `ATTENDANCE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address the HTTP server listens on.
    pub bind: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory enrollment photos are written to.
    pub photo_dir: PathBuf,
    /// Euclidean distance a match must be strictly below.
    pub match_threshold: f32,
    /// Per-pixel luminance difference that counts as motion.
    pub pixel_diff_threshold: u8,
    /// Changed-pixel count a frame pair must exceed.
    pub motion_pixel_threshold: usize,
    /// Soft timeout for one worker-pool request.
    pub extraction_timeout_secs: u64,
    /// Number of extraction worker threads.
    pub workers: usize,
    /// Bounded request queue depth in front of the workers.
    pub queue_depth: usize,
    /// Check model SHA-256 before loading.
    pub verify_models: bool,
}

/// Keys accepted in the TOML file. All optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    bind: Option<String>,
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    photo_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    pixel_diff_threshold: Option<u8>,
    motion_pixel_threshold: Option<usize>,
    extraction_timeout_secs: Option<u64>,
    workers: Option<usize>,
    queue_depth: Option<usize>,
    verify_models: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            bind: "127.0.0.1:5000".to_string(),
            model_dir: attendance_core::default_model_dir(),
            db_path: data_dir.join("attendance.db"),
            photo_dir: data_dir.join("photos"),
            match_threshold: attendance_core::types::DEFAULT_MATCH_THRESHOLD,
            pixel_diff_threshold: attendance_core::liveness::DEFAULT_PIXEL_DIFF_THRESHOLD,
            motion_pixel_threshold: attendance_core::liveness::DEFAULT_MOTION_PIXEL_THRESHOLD,
            extraction_timeout_secs: 10,
            workers: 2,
            queue_depth: 16,
            verify_models: true,
        }
    }
}

impl Config {
    /// Load defaults, the optional config file, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os("ATTENDANCE_CONFIG").filter(|v| !v.is_empty()) {
            config.apply_file(&PathBuf::from(path))?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.clamp();
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "config file loaded");

        if let Some(v) = file.bind {
            self.bind = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.photo_dir {
            self.photo_dir = v;
        }
        self.match_threshold = file.match_threshold.unwrap_or(self.match_threshold);
        self.pixel_diff_threshold = file
            .pixel_diff_threshold
            .unwrap_or(self.pixel_diff_threshold);
        self.motion_pixel_threshold = file
            .motion_pixel_threshold
            .unwrap_or(self.motion_pixel_threshold);
        self.extraction_timeout_secs = file
            .extraction_timeout_secs
            .unwrap_or(self.extraction_timeout_secs);
        self.workers = file.workers.unwrap_or(self.workers);
        self.queue_depth = file.queue_depth.unwrap_or(self.queue_depth);
        self.verify_models = file.verify_models.unwrap_or(self.verify_models);
        Ok(())
    }

    /// Apply `ATTENDANCE_*` overrides. Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ATTENDANCE_BIND") {
            self.bind = v;
        }
        if let Some(v) = var("ATTENDANCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ATTENDANCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ATTENDANCE_PHOTO_DIR") {
            self.photo_dir = PathBuf::from(v);
        }
        self.match_threshold = parsed(&var, "ATTENDANCE_MATCH_THRESHOLD", self.match_threshold);
        self.pixel_diff_threshold =
            parsed(&var, "ATTENDANCE_PIXEL_DIFF_THRESHOLD", self.pixel_diff_threshold);
        self.motion_pixel_threshold =
            parsed(&var, "ATTENDANCE_MOTION_PIXEL_THRESHOLD", self.motion_pixel_threshold);
        self.extraction_timeout_secs = parsed(
            &var,
            "ATTENDANCE_EXTRACTION_TIMEOUT_SECS",
            self.extraction_timeout_secs,
        );
        self.workers = parsed(&var, "ATTENDANCE_WORKERS", self.workers);
        self.queue_depth = parsed(&var, "ATTENDANCE_QUEUE_DEPTH", self.queue_depth);
        if let Some(v) = var("ATTENDANCE_VERIFY_MODELS") {
            self.verify_models = v != "0";
        }
    }

    /// The pool needs at least one worker and one queue slot, and the match
    /// threshold must be a positive finite distance.
    fn clamp(&mut self) {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            let fallback = attendance_core::types::DEFAULT_MATCH_THRESHOLD;
            tracing::warn!(
                value = self.match_threshold,
                fallback,
                "match threshold must be positive and finite, using default"
            );
            self.match_threshold = fallback;
        }
        self.workers = self.workers.max(1);
        self.queue_depth = self.queue_depth.max(1);
        self.extraction_timeout_secs = self.extraction_timeout_secs.max(1);
    }
}

fn parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            default
        }),
        None => default,
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("attendance")
}
