// Engine Configuration
// Defaults, optional YAML file and environment overrides

use crate::cache::FileSystemCache;
use crate::error::{EngineError, EngineResult};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "gantry.yml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Filesystem,
    Memory,
}

impl std::str::FromStr for CacheBackendKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(Self::Filesystem),
            "memory" => Ok(Self::Memory),
            other => Err(EngineError::Config(format!("unknown cache backend '{}'", other))),
        }
    }
}

/// Runtime settings for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct EngineConfig {
    /// Global bound on concurrently running jobs
    pub max_parallel: usize,

    /// Filesystem cache root (default: ~/.gantry/cache)
    pub cache_dir: PathBuf,

    pub cache_backend: CacheBackendKind,

    /// Shell used for `run:` steps without an explicit `shell`
    pub default_shell: String,

    pub default_step_timeout_minutes: Option<f64>,

    /// Time an in-flight step gets to finish after an abort
    pub cancel_grace_secs: u64,

    /// Provider retries per call, at most 1
    pub provider_retries: u32,

    /// Optional JSON-lines file receiving one record per finished job
    pub records_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            cache_dir: FileSystemCache::default_root(),
            cache_backend: CacheBackendKind::default(),
            default_shell: "sh".to_string(),
            default_step_timeout_minutes: None,
            cancel_grace_secs: 10,
            provider_retries: 1,
            records_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.normalized()
    }

    /// Defaults, then `explicit` (or `gantry.yml` under `working_dir` when
    /// present), then `GANTRY_*` environment variables
    pub fn load(explicit: Option<&Path>, working_dir: &Path) -> EngineResult<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let candidate = working_dir.join(DEFAULT_CONFIG_FILE);
                if candidate.is_file() {
                    tracing::debug!(path = %candidate.display(), "loading config");
                    Self::from_file(&candidate)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `GANTRY_MAX_PARALLEL`, `GANTRY_CACHE_DIR`, `GANTRY_CACHE_BACKEND`
    /// and `GANTRY_RECORDS` as read by `lookup`
    pub fn apply_env_from<F>(mut self, lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("GANTRY_MAX_PARALLEL") {
            self.max_parallel = raw
                .trim()
                .parse()
                .map_err(|_| EngineError::Config(format!("GANTRY_MAX_PARALLEL: invalid number '{}'", raw)))?;
        }
        if let Some(dir) = lookup("GANTRY_CACHE_DIR").filter(|d| !d.is_empty()) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(kind) = lookup("GANTRY_CACHE_BACKEND") {
            self.cache_backend = kind.parse()?;
        }
        if let Some(path) = lookup("GANTRY_RECORDS").filter(|p| !p.is_empty()) {
            self.records_path = Some(PathBuf::from(path));
        }
        self.normalized()
    }

    fn normalized(mut self) -> EngineResult<Self> {
        if self.max_parallel == 0 {
            return Err(EngineError::Config("max-parallel must be at least 1".into()));
        }
        if let Some(minutes) = self.default_step_timeout_minutes {
            if !minutes.is_finite() || minutes <= 0.0 {
                return Err(EngineError::Config("default-step-timeout-minutes must be positive".into()));
            }
            if minutes_to_duration(minutes).is_none() {
                return Err(EngineError::Config(format!(
                    "default-step-timeout-minutes: {} is out of range",
                    minutes
                )));
            }
        }
        self.provider_retries = self.provider_retries.min(1);
        Ok(self)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_minutes.and_then(minutes_to_duration)
    }
}

/// A timeout given in minutes, `None` when it is not representable
pub(crate) fn minutes_to_duration(minutes: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(minutes * 60.0).ok()
}
