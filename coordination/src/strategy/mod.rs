//! Input resolution strategies.
//!
//! A strategy turns "it is turn N" into the next [`Action`] plus a short
//! rationale. Three interchangeable sources exist:
//!
//! | Mode          | Source                                   | Blocks on        |
//! |---------------|------------------------------------------|------------------|
//! | `Manual`      | operator picks from a presented menu     | the channel      |
//! | `Scripted`    | uniform random pick, turning-biased      | nothing          |
//! | `ModelDriven` | external decision service sees the frame | the service call |
//!
//! Only `Manual` can ask for a mode change; see [`ControlSignal`].

pub mod control;
pub mod manual;
pub mod model;
pub mod scripted;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::Action;
use crate::channel::ChannelError;
use crate::decision::DecisionError;
use crate::pipeline::{ArtifactRef, PipelineError};

pub use control::{poll_control, ControlScope, ControlSignal};
pub use manual::ManualStrategy;
pub use model::ModelStrategy;
pub use scripted::ScriptedStrategy;

/// Where the next action comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Manual,
    Scripted,
    ModelDriven,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Manual, Mode::Scripted, Mode::ModelDriven];

    /// Caption prefix identifying who chose the action.
    pub fn indicator(self) -> &'static str {
        match self {
            Self::Manual => "👤",
            Self::Scripted => "🎲",
            Self::ModelDriven => "🤖",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scripted => "scripted",
            Self::ModelDriven => "model-driven",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown mode '{0}' (expected manual, scripted or model-driven)")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    /// Accepts the canonical names and the short operator aliases
    /// `human`, `random` and `ai`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" | "human" => Ok(Self::Manual),
            "scripted" | "random" => Ok(Self::Scripted),
            "model-driven" | "model_driven" | "model" | "ai" => Ok(Self::ModelDriven),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

/// Outcome of one resolution.
///
/// `action` is `None` only when the operator sent a control signal instead
/// of a selection. A selection may also carry a signal that arrived with
/// it; the action is still applied and the signal takes effect afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub action: Option<Action>,
    pub rationale: String,
    pub signal: ControlSignal,
}

impl Resolution {
    pub fn chosen(action: Action, rationale: impl Into<String>) -> Self {
        Self {
            action: Some(action),
            rationale: rationale.into(),
            signal: ControlSignal::Continue,
        }
    }

    pub fn with_signal(mut self, signal: ControlSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn signalled(signal: ControlSignal, rationale: impl Into<String>) -> Self {
        Self {
            action: None,
            rationale: rationale.into(),
            signal,
        }
    }
}

/// What a strategy may look at when resolving a turn.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub turn: u64,
    /// The artifact published this turn, if publishing produced one.
    pub artifact: Option<&'a ArtifactRef>,
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Invalid model response on turn {turn}: {reason} (raw: {raw:?})")]
    InvalidModelResponse {
        turn: u64,
        reason: String,
        raw: String,
    },

    #[error("Operator selection '{value}' on turn {turn} is not a known action")]
    InvalidSelection { turn: u64, value: String },

    #[error("No input on turn {turn} after {waited:?}")]
    Timeout { turn: u64, waited: Duration },

    #[error("No artifact to show the decision service on turn {0}")]
    MissingArtifact(u64),

    #[error("{0} mode is not configured: {1}")]
    NotConfigured(Mode, String),

    #[error("Decision service failed on turn {turn}: {source}")]
    DecisionService {
        turn: u64,
        #[source]
        source: DecisionError,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Surface(#[from] PipelineError),
}

/// A pluggable source of actions.
#[async_trait]
pub trait InputStrategy: Send {
    fn mode(&self) -> Mode;

    async fn resolve(&mut self, ctx: TurnContext<'_>) -> Result<Resolution, StrategyError>;
}
