use facelock_core::{DecisionPolicy, DistanceMetric};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const REPLAY_PREFIX: &str = "replay:";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("threshold must be a finite, non-negative number (got {0})")]
    Threshold(f32),
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSource {
    /// V4L2 devices; the listed nodes are treated as front-facing, none means all.
    V4l2 { front_devices: Vec<String> },
    /// A still image replayed as a camera.
    Replay(PathBuf),
}

/// Daemon configuration: defaults, then the optional TOML file named by
/// `FACELOCK_CONFIG`, then `FACELOCK_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Comma-separated V4L2 device paths, or `replay:<image>`. Empty: any camera.
    pub camera_device: String,
    /// Frames discarded after stream-on (camera AGC/AE stabilization).
    pub warmup_frames: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD detection model, relative to `model_dir`.
    pub detector_model: String,
    /// FaceNet embedding model, relative to `model_dir`.
    pub embedding_model: String,
    /// Enrolled templates (`.json` or `.csv`).
    pub templates_path: PathBuf,
    pub metric: DistanceMetric,
    /// Maximum accepted distance.
    pub threshold: f32,
    /// How long to wait for each camera event.
    pub capture_timeout_secs: u64,
    /// ONNX Runtime intra-op threads per session.
    pub inference_threads: usize,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let policy = DecisionPolicy::default();
        Self {
            camera_device: String::new(),
            warmup_frames: 4,
            model_dir: PathBuf::from("/usr/share/facelock/models"),
            detector_model: "det_10g.onnx".into(),
            embedding_model: "facenet.onnx".into(),
            templates_path: default_data_dir().join("templates.json"),
            metric: policy.metric,
            threshold: policy.threshold,
            capture_timeout_secs: 10,
            inference_threads: 2,
            session_bus: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facelock")
}

impl Config {
    /// Load the full configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACELOCK_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Layer `FACELOCK_*` variables, as returned by `var`, over this config.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FACELOCK_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("FACELOCK_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACELOCK_DETECTOR_MODEL") {
            self.detector_model = v;
        }
        if let Some(v) = var("FACELOCK_EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = var("FACELOCK_TEMPLATES") {
            self.templates_path = PathBuf::from(v);
        }
        override_parsed(&var, "FACELOCK_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&var, "FACELOCK_METRIC", &mut self.metric);
        override_parsed(&var, "FACELOCK_THRESHOLD", &mut self.threshold);
        override_parsed(&var, "FACELOCK_CAPTURE_TIMEOUT_SECS", &mut self.capture_timeout_secs);
        override_parsed(&var, "FACELOCK_INFERENCE_THREADS", &mut self.inference_threads);
        if let Some(v) = var("FACELOCK_SESSION_BUS") {
            self.session_bus = v != "0";
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ConfigError::Threshold(self.threshold));
        }
        Ok(())
    }

    pub fn camera_source(&self) -> CameraSource {
        let source = self.camera_device.trim();
        if let Some(path) = source.strip_prefix(REPLAY_PREFIX) {
            return CameraSource::Replay(PathBuf::from(path));
        }
        CameraSource::V4l2 {
            front_devices: source
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    pub fn policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            metric: self.metric,
            threshold: self.threshold,
        }
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the FaceNet embedding model.
    pub fn embedding_model_path(&self) -> String {
        self.model_dir
            .join(&self.embedding_model)
            .to_string_lossy()
            .into_owned()
    }
}

fn override_parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}
