//! Out-of-band control signals.
//!
//! An operator may write `control_<turn>` next to (or instead of) the
//! action selection. Accepted values, case-insensitive:
//!
//! - `continue` (or empty): keep going, same mode
//! - `end`, `stop`, `quit`: end the session after this turn
//! - a mode name or alias, optionally prefixed with `switch:`
//!
//! Anything else reads as `Continue`: a bad control value is never fatal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Mode;
use crate::channel::{key, ChannelError, ExchangeKey, SyncChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Continue,
    SwitchTo(Mode),
    End,
}

impl ControlSignal {
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim().to_ascii_lowercase();
        let value = value.strip_prefix("switch:").unwrap_or(&value).trim();
        match value {
            "" | "continue" => Self::Continue,
            "end" | "stop" | "quit" => Self::End,
            other => match other.parse::<Mode>() {
                Ok(mode) => Self::SwitchTo(mode),
                Err(_) => {
                    tracing::warn!(value = raw, "Unrecognized control signal, continuing");
                    Self::Continue
                }
            },
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => f.write_str("continue"),
            Self::SwitchTo(mode) => write!(f, "switch:{mode}"),
            Self::End => f.write_str("end"),
        }
    }
}

/// Which turns read the control key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlScope {
    /// Only Manual turns, as part of waiting for the selection.
    #[default]
    ManualOnly,
    /// Every turn; automated turns check once without waiting.
    EveryTurn,
}

impl FromStr for ControlScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual-only" | "manual_only" | "manual" => Ok(Self::ManualOnly),
            "every-turn" | "every_turn" | "always" => Ok(Self::EveryTurn),
            other => Err(format!(
                "unknown control scope '{other}' (expected manual-only or every-turn)"
            )),
        }
    }
}

/// Claim `control_<turn>` if an operator wrote it; absent means `Continue`.
pub async fn poll_control(channel: &SyncChannel, turn: u64) -> Result<ControlSignal, ChannelError> {
    let key = ExchangeKey::for_turn(key::CONTROL, turn)?;
    Ok(channel
        .try_consume(&key)
        .await?
        .map(|raw| ControlSignal::parse(&raw))
        .unwrap_or(ControlSignal::Continue))
}
