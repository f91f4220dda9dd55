//! Exchange key derivation.
//!
//! A key is a logical slot name, optionally suffixed with a turn index:
//! `game_mode`, `action_12`, `control_3`. Slot names are restricted so the
//! mapping `(slot, turn) -> key` is injective:
//!
//! - slot characters are lowercase ASCII letters, digits, `_` and `-`;
//! - a slot never ends in a digit, so the trailing digit run of a turn key
//!   is always the turn index and a session key can never look like one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operator's choice for a turn.
pub const ACTION: &str = "action";
/// Optional out-of-band control signal for a turn.
pub const CONTROL: &str = "control";
/// Rationale recorded for a resolved turn.
pub const RATIONALE: &str = "rationale";
/// Session-level mode selection.
pub const GAME_MODE: &str = "game_mode";
/// Session-level level selection.
pub const LEVEL: &str = "level";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Slot name is empty")]
    Empty,

    #[error("Slot name '{0}' contains characters outside [a-z0-9_-]")]
    InvalidCharacter(String),

    #[error("Slot name '{0}' must not end with a digit")]
    TrailingDigit(String),

    #[error("Key '{0}' is not a valid exchange key")]
    Unparseable(String),
}

/// Address of a single exchange record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeKey {
    slot: String,
    turn: Option<u64>,
}

fn validate_slot(slot: &str) -> Result<(), KeyError> {
    if slot.is_empty() {
        return Err(KeyError::Empty);
    }
    if !slot
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(KeyError::InvalidCharacter(slot.to_string()));
    }
    if slot.ends_with(|c: char| c.is_ascii_digit()) {
        return Err(KeyError::TrailingDigit(slot.to_string()));
    }
    Ok(())
}

impl ExchangeKey {
    /// A key that exists once per session (e.g. `game_mode`).
    pub fn session(slot: &str) -> Result<Self, KeyError> {
        validate_slot(slot)?;
        Ok(Self {
            slot: slot.to_string(),
            turn: None,
        })
    }

    /// A key unique to one turn's exchange in `slot`.
    pub fn for_turn(slot: &str, turn: u64) -> Result<Self, KeyError> {
        validate_slot(slot)?;
        Ok(Self {
            slot: slot.to_string(),
            turn: Some(turn),
        })
    }

    /// Inverse of `Display`, used by the operator CLI.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let raw = raw.trim();
        let digits = raw.len() - raw.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return Self::session(raw);
        }
        let (head, tail) = raw.split_at(raw.len() - digits);
        let slot = head
            .strip_suffix('_')
            .ok_or_else(|| KeyError::Unparseable(raw.to_string()))?;
        if tail.len() > 1 && tail.starts_with('0') {
            return Err(KeyError::Unparseable(raw.to_string()));
        }
        let turn = tail
            .parse::<u64>()
            .map_err(|_| KeyError::Unparseable(raw.to_string()))?;
        Self::for_turn(slot, turn)
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn turn(&self) -> Option<u64> {
        self.turn
    }
}

impl fmt::Display for ExchangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.turn {
            Some(turn) => write!(f, "{}_{}", self.slot, turn),
            None => write!(f, "{}", self.slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_turn_key_format() {
        let key = ExchangeKey::for_turn(ACTION, 12).unwrap();
        assert_eq!(key.to_string(), "action_12");
        assert_eq!(key.slot(), "action");
        assert_eq!(key.turn(), Some(12));
    }

    #[test]
    fn test_session_key_format() {
        let key = ExchangeKey::session(GAME_MODE).unwrap();
        assert_eq!(key.to_string(), "game_mode");
        assert_eq!(key.turn(), None);
    }

    #[test]
    fn test_thousand_pairs_yield_thousand_keys() {
        let slots = ["action", "control", "rationale", "a", "a_b", "x-y", "act", "ion"];
        let mut keys = HashSet::new();
        let mut pairs = 0;
        'outer: for turn in 0u64.. {
            for slot in slots {
                keys.insert(ExchangeKey::for_turn(slot, turn).unwrap().to_string());
                pairs += 1;
                if pairs == 1000 {
                    break 'outer;
                }
            }
        }
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn test_slot_validation() {
        assert_eq!(ExchangeKey::session(""), Err(KeyError::Empty));
        assert!(matches!(
            ExchangeKey::session("Action"),
            Err(KeyError::InvalidCharacter(_))
        ));
        assert!(matches!(
            ExchangeKey::for_turn("move.x", 1),
            Err(KeyError::InvalidCharacter(_))
        ));
        // "move1" with turn 2 would otherwise collide with "move" turn 12 style keys
        assert!(matches!(
            ExchangeKey::for_turn("move1", 2),
            Err(KeyError::TrailingDigit(_))
        ));
    }

    #[test]
    fn test_session_and_turn_keys_never_collide() {
        let session = ExchangeKey::session("a_b").unwrap().to_string();
        let turn = ExchangeKey::for_turn("a", 0).unwrap().to_string();
        assert_ne!(session, turn);
    }

    #[test]
    fn test_parse_inverts_display() {
        for key in [
            ExchangeKey::for_turn("action", 0).unwrap(),
            ExchangeKey::for_turn("game_mode", 41).unwrap(),
            ExchangeKey::session("level").unwrap(),
        ] {
            assert_eq!(ExchangeKey::parse(&key.to_string()).unwrap(), key);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ExchangeKey::parse("action12").is_err());
        assert!(ExchangeKey::parse("action_007").is_err());
        assert!(ExchangeKey::parse("_3").is_err());
    }
}
