//! Layered configuration for pipeline runs.
//!
//! Precedence, later wins:
//! 1. built-in defaults
//! 2. `config.toml` (explicit path, else `$PROCPIPE_HOME`, else `~/.procpipe`)
//! 3. `PROCPIPE_*` environment variables
//!
//! ```toml
//! [escalation]
//! interrupt_after_ms = 2000
//! kill_after_ms = 5000
//!
//! [pipeline]
//! timeout_secs = 30
//! launch_order = "reverse"
//! ```

use std::env;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::pipeline::EscalationPolicy;
use crate::pipeline::LaunchOrder;
use crate::pipeline::RunOptions;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_ENV_PREFIX: &str = "PROCPIPE";

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("invalid value for ${var}: '{value}' (expected: {expected})")]
    InvalidEnvValue {
        var: String,
        value: String,
        expected: String,
    },
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub escalation: EscalationPolicy,
    /// Deadline after which the whole pipeline is cancelled.
    pub timeout: Option<Duration>,
    pub launch_order: LaunchOrder,
}

impl PipelineConfig {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            escalation: self.escalation,
            launch_order: self.launch_order,
        }
    }
}

/// One configuration layer; `None` leaves the lower layer in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    escalation: EscalationSection,
    #[serde(default)]
    pipeline: PipelineSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct EscalationSection {
    interrupt_after_ms: Option<u64>,
    kill_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineSection {
    timeout_secs: Option<u64>,
    launch_order: Option<LaunchOrder>,
}

impl FileConfig {
    fn apply_to(self, config: &mut PipelineConfig) {
        if let Some(ms) = self.escalation.interrupt_after_ms {
            config.escalation.interrupt_after = Duration::from_millis(ms);
        }
        if let Some(ms) = self.escalation.kill_after_ms {
            config.escalation.kill_after = Duration::from_millis(ms);
        }
        if let Some(secs) = self.pipeline.timeout_secs {
            config.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(order) = self.pipeline.launch_order {
            config.launch_order = order;
        }
    }
}

/// Builder for layered configuration loading.
///
/// ```no_run
/// use procpipe_core::config::ConfigLoader;
///
/// let config = ConfigLoader::new().load().expect("config");
/// println!("{:?}", config.escalation);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    home: Option<PathBuf>,
    file: Option<PathBuf>,
    env_prefix: String,
    skip_file: bool,
    skip_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            home: None,
            file: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            skip_file: false,
            skip_env: false,
        }
    }

    /// Directory holding `config.toml`. Overrides `$PROCPIPE_HOME`.
    pub fn with_home(mut self, path: impl Into<PathBuf>) -> Self {
        self.home = Some(path.into());
        self
    }

    /// Explicit config file; unlike the default location it must exist.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn skip_file_layer(mut self) -> Self {
        self.skip_file = true;
        self
    }

    pub fn skip_env_layer(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load every enabled layer against the process environment.
    pub fn load(self) -> Result<PipelineConfig, ConfigLoadError> {
        self.load_with_env(|var| env::var(var).ok())
    }

    /// Like [`ConfigLoader::load`], reading variables through `lookup`.
    pub fn load_with_env<F>(self, lookup: F) -> Result<PipelineConfig, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = PipelineConfig::default();

        if !self.skip_file
            && let Some(layer) = self.read_file_layer(&lookup)?
        {
            layer.apply_to(&mut config);
        }

        if !self.skip_env {
            apply_env_overrides(&mut config, &self.env_prefix, &lookup)?;
        }

        validate(&config)?;
        Ok(config)
    }

    fn read_file_layer<F>(&self, lookup: &F) -> Result<Option<FileConfig>, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.file {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
                path: path.clone(),
                source,
            })?;
            return parse_file(path, &contents).map(Some);
        }

        let Some(home) = self.resolve_home(lookup) else {
            tracing::debug!("no home directory, skipping config file");
            return Ok(None);
        };
        let path = home.join(CONFIG_FILE_NAME);
        match std::fs::read_to_string(&path) {
            Ok(contents) => parse_file(&path, &contents).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Ok(None)
            }
            Err(source) => Err(ConfigLoadError::Io { path, source }),
        }
    }

    fn resolve_home<F>(&self, lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(home) = &self.home {
            return Some(home.clone());
        }
        if let Some(home) = lookup(&format!("{}_HOME", self.env_prefix))
            && !home.trim().is_empty()
        {
            return Some(PathBuf::from(home));
        }
        dirs::home_dir().map(|home| home.join(".procpipe"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_file(path: &Path, contents: &str) -> Result<FileConfig, ConfigLoadError> {
    toml::from_str(contents).map_err(|source| ConfigLoadError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env_overrides<F>(
    config: &mut PipelineConfig,
    prefix: &str,
    lookup: &F,
) -> Result<(), ConfigLoadError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(ms) = env_number(lookup, &format!("{prefix}_INTERRUPT_AFTER_MS"))? {
        config.escalation.interrupt_after = Duration::from_millis(ms);
    }
    if let Some(ms) = env_number(lookup, &format!("{prefix}_KILL_AFTER_MS"))? {
        config.escalation.kill_after = Duration::from_millis(ms);
    }
    if let Some(secs) = env_number(lookup, &format!("{prefix}_TIMEOUT_SECS"))? {
        config.timeout = Some(Duration::from_secs(secs));
    }

    let order_var = format!("{prefix}_LAUNCH_ORDER");
    if let Some(value) = lookup(&order_var)
        && !value.trim().is_empty()
    {
        config.launch_order =
            value
                .parse()
                .map_err(|_| ConfigLoadError::InvalidEnvValue {
                    var: order_var.clone(),
                    value: value.clone(),
                    expected: "reverse or forward".to_string(),
                })?;
        tracing::debug!(var = %order_var, %value, "applied env override");
    }
    Ok(())
}

fn env_number<F>(lookup: &F, var: &str) -> Result<Option<u64>, ConfigLoadError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    if value.trim().is_empty() {
        return Ok(None);
    }
    let parsed = value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigLoadError::InvalidEnvValue {
            var: var.to_string(),
            value: value.clone(),
            expected: "a non-negative integer".to_string(),
        })?;
    tracing::debug!(var, value = parsed, "applied env override");
    Ok(Some(parsed))
}

fn validate(config: &PipelineConfig) -> Result<(), ConfigLoadError> {
    let EscalationPolicy {
        interrupt_after,
        kill_after,
    } = config.escalation;
    if kill_after < interrupt_after {
        return Err(ConfigLoadError::Validation(format!(
            "kill_after_ms ({}) must not be shorter than interrupt_after_ms ({})",
            kill_after.as_millis(),
            interrupt_after.as_millis()
        )));
    }
    if config.timeout == Some(Duration::ZERO) {
        return Err(ConfigLoadError::Validation(
            "timeout_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
