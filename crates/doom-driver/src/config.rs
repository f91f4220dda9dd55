//! Driver configuration.
//!
//! Precedence, lowest first: built-in defaults, `DOOM_*` environment
//! variables, the TOML file, command-line flags. Missing TOML fields fall
//! back to the environment-derived defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use coordination::channel::{PollPolicy, RetryPolicy};
use coordination::process::LaunchConfig;
use coordination::strategy::{ControlScope, Mode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Where exchange records live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChannelBackend {
    /// One file per key in a shared directory.
    Dir { path: PathBuf },
    /// The CI agent's `meta-data` store.
    AgentMetadata {
        #[serde(default = "default_agent_bin")]
        bin: String,
    },
}

/// How turns are shown and how the operator is asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SurfaceKind {
    /// Annotations, artifacts and input steps through the CI agent.
    Buildkite,
    /// An HTML page in the capture directory plus log lines.
    Local,
}

impl FromStr for SurfaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buildkite" => Ok(Self::Buildkite),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown surface '{other}' (expected buildkite or local)")),
        }
    }
}

/// External decision service used in model-driven mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DecisionBackend {
    /// OpenAI-compatible chat completions endpoint.
    Http {
        url: String,
        model: String,
        /// Name of the environment variable holding the API key.
        #[serde(default)]
        api_key_env: Option<String>,
    },
    /// External command; `{prompt}` and `{image}` are substituted.
    Command { template: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// `manual`, `scripted` or `model-driven` (aliases `human`, `random`,
    /// `ai`). Unset means: read `game_mode` from the channel.
    pub mode: Option<String>,
    /// Level passed to the game. Unset means: read `level` from the channel.
    pub level: Option<String>,
    pub max_turns: u64,
    pub history_limit: usize,
    pub control_scope: ControlScope,
    pub channel: ChannelBackend,
    /// Key prefix isolating concurrent runs that share a store.
    pub namespace: Option<String>,
    pub poll_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub manual_timeout_secs: u64,
    pub model_timeout_secs: u64,
    pub first_capture_ms: u64,
    pub capture_ms: u64,
    pub warmup_ms: u64,
    /// Delay between the capture starting and the action being delivered.
    pub action_lead_in_ms: u64,
    pub display: String,
    pub geometry: String,
    pub framerate: u32,
    pub server_command: String,
    pub game_command: String,
    pub output_dir: PathBuf,
    pub surface: SurfaceKind,
    pub agent_bin: String,
    pub decision: Option<DecisionBackend>,
    /// Seed for scripted play; unset draws from entropy.
    pub seed: Option<u64>,
}

fn default_agent_bin() -> String {
    std::env::var("DOOM_AGENT_BIN").unwrap_or_else(|_| "buildkite-agent".into())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env_opt(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            default
        }),
        None => default,
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        let launch = LaunchConfig::default();
        let channel = match env_opt("DOOM_CHANNEL_DIR") {
            Some(path) => ChannelBackend::Dir { path: path.into() },
            None => ChannelBackend::AgentMetadata {
                bin: default_agent_bin(),
            },
        };
        let decision = match (env_opt("DOOM_DECISION_URL"), env_opt("DOOM_DECISION_COMMAND")) {
            (Some(url), _) => Some(DecisionBackend::Http {
                url,
                model: env_opt("DOOM_DECISION_MODEL").unwrap_or_else(|| "gpt-4o".into()),
                api_key_env: Some(
                    env_opt("DOOM_DECISION_API_KEY_ENV").unwrap_or_else(|| "OPENAI_API_KEY".into()),
                ),
            }),
            (None, Some(template)) => Some(DecisionBackend::Command { template }),
            (None, None) => None,
        };

        Self {
            mode: env_opt("DOOM_MODE"),
            level: env_opt("DOOM_LEVEL"),
            max_turns: env_or("DOOM_MAX_TURNS", 20),
            history_limit: env_or("DOOM_HISTORY_LIMIT", 32),
            control_scope: env_or("DOOM_CONTROL_SCOPE", ControlScope::ManualOnly),
            channel,
            namespace: env_opt("DOOM_NAMESPACE"),
            poll_interval_ms: env_or("DOOM_POLL_INTERVAL_MS", 1000),
            retry_attempts: 3,
            retry_backoff_ms: 500,
            manual_timeout_secs: env_or("DOOM_MANUAL_TIMEOUT_SECS", 600),
            model_timeout_secs: env_or("DOOM_MODEL_TIMEOUT_SECS", 60),
            first_capture_ms: 2500,
            capture_ms: 1250,
            warmup_ms: 2000,
            action_lead_in_ms: 100,
            display: env_opt("DOOM_DISPLAY").unwrap_or(launch.display),
            geometry: launch.geometry,
            framerate: 15,
            server_command: launch.server_command,
            game_command: env_opt("DOOM_GAME_COMMAND").unwrap_or(launch.game_command),
            output_dir: env_opt("DOOM_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("doom-captures")),
            surface: env_or("DOOM_SURFACE", SurfaceKind::Buildkite),
            agent_bin: default_agent_bin(),
            decision,
            seed: env_opt("DOOM_SEED").and_then(|s| s.parse().ok()),
        }
    }
}

impl DriverConfig {
    /// Defaults, overlaid with `path` if given, then validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidConfiguration(msg));
        self.mode()?;
        if self.max_turns == 0 {
            return invalid("max_turns must be at least 1".into());
        }
        if self.history_limit == 0 {
            return invalid("history_limit must be at least 1".into());
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive".into());
        }
        if self.retry_attempts == 0 {
            return invalid("retry_attempts must be at least 1".into());
        }
        if self.first_capture_ms == 0 || self.capture_ms == 0 {
            return invalid("capture durations must be positive".into());
        }
        if self.action_lead_in_ms >= self.capture_ms.min(self.first_capture_ms) {
            return invalid(format!(
                "action_lead_in_ms ({}) must be shorter than the capture window",
                self.action_lead_in_ms
            ));
        }
        let dims: Vec<&str> = self.geometry.split('x').collect();
        if dims.len() != 2 || dims.iter().any(|d| d.parse::<u32>().map_or(true, |n| n == 0)) {
            return invalid(format!("geometry '{}' is not WIDTHxHEIGHT", self.geometry));
        }
        if let Some(level) = &self.level {
            if level.trim().is_empty() {
                return invalid("level must not be empty".into());
            }
        }
        if matches!(self.channel, ChannelBackend::Dir { ref path } if path.as_os_str().is_empty()) {
            return invalid("channel directory must not be empty".into());
        }
        Ok(())
    }

    /// The configured mode, if any. An unknown name fails fast.
    pub fn mode(&self) -> Result<Option<Mode>, ConfigError> {
        self.mode
            .as_deref()
            .map(|raw| {
                raw.parse::<Mode>()
                    .map_err(|e| ConfigError::InvalidConfiguration(e.to_string()))
            })
            .transpose()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Polling for operator input and session bootstrap.
    pub fn manual_poll(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.manual_timeout_secs),
            self.poll_interval(),
        )
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.retry_attempts,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            display: self.display.clone(),
            geometry: self.geometry.clone(),
            server_command: self.server_command.clone(),
            game_command: self.game_command.clone(),
            server_settle: LaunchConfig::default().server_settle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> DriverConfig {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DriverConfig {
            mode: None,
            level: None,
            ..DriverConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_backoff_ms, 500);
        assert_eq!(config.first_capture_ms, 2500);
        assert_eq!(config.capture_ms, 1250);
    }

    #[test]
    fn test_toml_overlays_defaults() {
        let config = parse(
            r#"
            mode = "random"
            level = "3"
            max_turns = 100
            control_scope = "every-turn"
            surface = "local"

            [channel]
            kind = "dir"
            path = "/tmp/doom-channel"

            [decision]
            kind = "command"
            template = "claude -p {prompt} {image}"
            "#,
        );
        config.validate().unwrap();
        assert_eq!(config.mode().unwrap(), Some(Mode::Scripted));
        assert_eq!(config.max_turns, 100);
        assert_eq!(config.control_scope, ControlScope::EveryTurn);
        assert_eq!(config.surface, SurfaceKind::Local);
        assert_eq!(
            config.channel,
            ChannelBackend::Dir {
                path: "/tmp/doom-channel".into()
            }
        );
        assert!(matches!(config.decision, Some(DecisionBackend::Command { .. })));
        assert_eq!(config.capture_ms, 1250);
    }

    #[test]
    fn test_unknown_mode_is_invalid_configuration() {
        let config = parse(r#"mode = "spectator""#);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_rejects_zero_turns_and_bad_geometry() {
        let mut config = parse("max_turns = 0");
        assert!(config.validate().is_err());
        config.max_turns = 5;
        config.geometry = "320by240".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lead_in_must_fit_capture_window() {
        let config = parse("action_lead_in_ms = 5000");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_agent_metadata_backend_defaults_binary() {
        let config = parse(
            r#"
            [channel]
            kind = "agent-metadata"
            "#,
        );
        assert!(matches!(config.channel, ChannelBackend::AgentMetadata { .. }));
    }

    #[test]
    fn test_load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doom.toml");
        std::fs::write(&path, "max_turns = \"many\"").unwrap();
        match DriverConfig::load(Some(&path)) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_policies_follow_config() {
        let config = parse("poll_interval_ms = 250\nmanual_timeout_secs = 30");
        let poll = config.manual_poll();
        assert_eq!(poll.timeout, Duration::from_secs(30));
        assert_eq!(poll.interval, Duration::from_millis(250));
        assert_eq!(config.retry_policy().backoff_ms(1), 500);
    }
}
