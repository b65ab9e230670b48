use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which recognition backend the daemon drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// SCRFD + ArcFace models on ONNX Runtime.
    Onnx,
    /// Deterministic model-free engine.
    Mock,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(EngineKind::Onnx),
            "mock" => Ok(EngineKind::Mock),
            other => Err(format!("unknown engine '{other}' (expected onnx or mock)")),
        }
    }
}

impl Default for EngineKind {
    fn default() -> Self {
        if cfg!(feature = "onnx") {
            EngineKind::Onnx
        } else {
            EngineKind::Mock
        }
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineKind,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    pub bind_host: String,
    pub port: u16,
    /// Parent directory for per-request scratch directories.
    pub tmp_dir: PathBuf,
    /// Ceiling on a request body, multipart framing included.
    pub max_body_bytes: usize,
    /// Bound on one engine job, queueing included.
    pub request_timeout_secs: u64,
    /// Similarity at or above which the CLI reports a match.
    pub match_threshold: f32,
    /// Capacity of the engine request channel.
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            model_dir: default_model_dir(),
            bind_host: "127.0.0.1".to_string(),
            port: 8080,
            tmp_dir: std::env::temp_dir(),
            max_body_bytes: 32 * 1024 * 1024,
            request_timeout_secs: 30,
            match_threshold: 0.40,
            queue_depth: 16,
        }
    }
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let engine = match std::env::var("FACEGATE_ENGINE") {
            Ok(raw) => raw.parse().unwrap_or_else(|err: String| {
                tracing::warn!(error = %err, "ignoring FACEGATE_ENGINE");
                defaults.engine
            }),
            Err(_) => defaults.engine,
        };

        Self {
            engine,
            model_dir: std::env::var("FACEGATE_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            bind_host: std::env::var("FACEGATE_BIND_HOST").unwrap_or(defaults.bind_host),
            port: env_or("FACEGATE_PORT", defaults.port),
            tmp_dir: std::env::var("FACEGATE_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.tmp_dir),
            max_body_bytes: env_or("FACEGATE_MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_secs: env_or("FACEGATE_REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            match_threshold: env_or("FACEGATE_MATCH_THRESHOLD", defaults.match_threshold),
            queue_depth: env_or("FACEGATE_QUEUE_DEPTH", defaults.queue_depth).max(1),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `$XDG_DATA_HOME/facegate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
        .join("models")
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
