use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{CmdRunError, Result};
use crate::models::{CommandRequest, DEFAULT_CAPTURE_LIMIT};

/// Environment variable naming the default configuration file
pub const CONFIG_ENV_VAR: &str = "CMDRUN_CONFIG";

/// Runner defaults loaded from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Timeout applied to requests that do not set one
    #[serde(default)]
    pub default_timeout_secs: Option<f64>,

    #[serde(default = "default_capture_limit")]
    pub max_capture_bytes: usize,

    /// Variables added to every request unless the request sets them itself
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Executables checked by `check-versions` when none are given
    #[serde(default)]
    pub tools: Vec<String>,
}

fn default_capture_limit() -> usize {
    DEFAULT_CAPTURE_LIMIT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout_secs: None,
            max_capture_bytes: DEFAULT_CAPTURE_LIMIT,
            env: BTreeMap::new(),
            tools: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `path`, which must exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CmdRunError::InvalidConfiguration(format!(
                "config file {} does not exist",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            CmdRunError::InvalidConfiguration(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))
        })?;

        let config = Self::from_toml(&content).map_err(|e| match e {
            CmdRunError::InvalidConfiguration(msg) => {
                CmdRunError::InvalidConfiguration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;

        debug!(path = %path.display(), tools = config.tools.len(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| CmdRunError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Path named by `CMDRUN_CONFIG`, if set
    pub fn path_from_env() -> Option<PathBuf> {
        std::env::var_os(CONFIG_ENV_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    /// Load the file named by `path`, falling back to `CMDRUN_CONFIG`. Only
    /// when neither names a file are the defaults used.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(Self::path_from_env) {
            Some(path) => Self::load(&path),
            None => {
                debug!("No config file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(secs) = self.default_timeout_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(CmdRunError::InvalidConfiguration(format!(
                    "default_timeout_secs must be a positive number, got {}",
                    secs
                )));
            }
            Duration::try_from_secs_f64(secs).map_err(|e| {
                CmdRunError::InvalidConfiguration(format!(
                    "default_timeout_secs {} is out of range: {}",
                    secs, e
                ))
            })?;
        }
        if self.max_capture_bytes == 0 {
            return Err(CmdRunError::InvalidConfiguration(
                "max_capture_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Fill in whatever `request` leaves to the configuration
    pub fn apply(&self, mut request: CommandRequest) -> CommandRequest {
        if request.timeout.is_none() {
            request.timeout = self.default_timeout();
        }
        for (key, value) in &self.env {
            request
                .env
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        request.capture_limit = request.capture_limit.min(self.max_capture_bytes);
        request
    }
}
