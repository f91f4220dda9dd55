//! Static action vocabulary.
//!
//! Every symbolic [`Action`] maps to one selection key (what an operator or a
//! model names), one raw input token (what the input injector types into the
//! display) and a glyph used in captions. The [`ActionTable`] is built once at
//! startup and shared by reference; nothing mutates it afterwards.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The fixed set of inputs the controller can deliver to the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    MoveForward,
    MoveBack,
    TurnLeft,
    TurnRight,
    Fire,
    Interact,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::MoveForward,
        Action::MoveBack,
        Action::TurnLeft,
        Action::TurnRight,
        Action::Fire,
        Action::Interact,
    ];

    /// Whether this action only rotates the player.
    pub fn is_turn(self) -> bool {
        matches!(self, Self::TurnLeft | Self::TurnRight)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MoveForward => write!(f, "move_forward"),
            Self::MoveBack => write!(f, "move_back"),
            Self::TurnLeft => write!(f, "turn_left"),
            Self::TurnRight => write!(f, "turn_right"),
            Self::Fire => write!(f, "fire"),
            Self::Interact => write!(f, "interact"),
        }
    }
}

/// One row of the action table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action: Action,
    /// Human-readable label shown in menus and rationales.
    pub label: String,
    /// Value an operator selects or a model names (e.g. `"Up"`).
    pub key: String,
    /// Raw token handed to the input injector (e.g. `"Control_L"`).
    pub token: String,
    /// Caption glyph.
    pub glyph: String,
    /// Key-press hold in milliseconds.
    pub key_delay_ms: u64,
}

/// Immutable lookup table over the action vocabulary.
#[derive(Debug, Clone)]
pub struct ActionTable {
    specs: Vec<ActionSpec>,
}

impl ActionTable {
    /// Build a table from explicit rows.
    ///
    /// Rows must cover distinct actions and distinct keys; later duplicates
    /// are ignored.
    pub fn new(specs: Vec<ActionSpec>) -> Self {
        let mut unique: Vec<ActionSpec> = Vec::with_capacity(specs.len());
        for spec in specs {
            let dup = unique
                .iter()
                .any(|s| s.action == spec.action || s.key.eq_ignore_ascii_case(&spec.key));
            if dup {
                tracing::warn!(
                    action = %spec.action,
                    key = %spec.key,
                    "Duplicate action row ignored"
                );
                continue;
            }
            unique.push(spec);
        }
        Self { specs: unique }
    }

    /// The keyboard layout used by chocolate-doom's default bindings.
    pub fn standard() -> Self {
        fn row(
            action: Action,
            label: &str,
            key: &str,
            token: &str,
            glyph: &str,
            delay: u64,
        ) -> ActionSpec {
            ActionSpec {
                action,
                label: label.to_string(),
                key: key.to_string(),
                token: token.to_string(),
                glyph: glyph.to_string(),
                key_delay_ms: delay,
            }
        }

        Self::new(vec![
            row(Action::MoveForward, "Move Forward", "Up", "Up", "⬆️", 1000),
            row(Action::MoveBack, "Move Backward", "Down", "Down", "⬇️", 1000),
            row(Action::TurnLeft, "Turn Left", "Left", "Left", "⬅️", 1000),
            row(Action::TurnRight, "Turn Right", "Right", "Right", "➡️", 1000),
            row(Action::Fire, "Fire", "Ctrl", "Control_L", "💥", 100),
            row(Action::Interact, "Open Door", "Space", "space", "🚪", 100),
        ])
    }

    pub fn specs(&self) -> &[ActionSpec] {
        &self.specs
    }

    pub fn actions(&self) -> impl Iterator<Item = Action> + '_ {
        self.specs.iter().map(|s| s.action)
    }

    pub fn spec(&self, action: Action) -> Option<&ActionSpec> {
        self.specs.iter().find(|s| s.action == action)
    }

    /// Resolve an operator selection or model answer to an action.
    ///
    /// Accepts the selection key, the label or the snake_case action name,
    /// case-insensitively. Anything else is unknown.
    pub fn lookup(&self, name: &str) -> Option<Action> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.specs
            .iter()
            .find(|s| {
                s.key.eq_ignore_ascii_case(name)
                    || s.label.eq_ignore_ascii_case(name)
                    || s.action.to_string().eq_ignore_ascii_case(name)
            })
            .map(|s| s.action)
    }

    /// Caption glyph, or `❓` for an action outside the table.
    pub fn glyph(&self, action: Action) -> &str {
        self.spec(action).map(|s| s.glyph.as_str()).unwrap_or("❓")
    }

    /// The selection keys, in table order, joined for prompts.
    pub fn vocabulary(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.key.as_str()).collect()
    }

    /// Subset that only rotates the player.
    pub fn turning(&self) -> Vec<&ActionSpec> {
        self.specs.iter().filter(|s| s.action.is_turn()).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        Self::standard()
    }
}
