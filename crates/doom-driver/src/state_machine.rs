//! Turn state machine: explicit states and legal transition guards.
//!
//! Every turn walks the same cycle:
//!
//! ```text
//! Starting → Idle → Resuming → Capturing → Pausing → Publishing
//!          ↑                                              │
//!          │                                              ▼
//!          └──────────── Applying ◄──────────── ResolvingAction ⟲
//!                           │
//!                           ▼
//!                       Terminated
//! ```
//!
//! `ResolvingAction` may re-enter itself after a mode switch. Any
//! non-terminal state may move to `Failed` or `Interrupted`. The controller
//! calls `advance()` for each step; every transition is validated and
//! recorded so the run can be reconstructed from the log.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Process launched, warming up before the first pause.
    Starting,
    /// Process paused between turns.
    Idle,
    Resuming,
    /// Clip recording, with the previous turn's action delivered inside it.
    Capturing,
    Pausing,
    Publishing,
    /// Waiting on the active strategy (possibly for a long time).
    ResolvingAction,
    /// Recording the turn and checking end conditions.
    Applying,
    /// Ended normally: turn ceiling or operator request. Terminal.
    Terminated,
    /// Ended by an error. Terminal.
    Failed,
    /// Ended by an external signal. Terminal.
    Interrupted,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed | Self::Interrupted)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "Starting",
            Self::Idle => "Idle",
            Self::Resuming => "Resuming",
            Self::Capturing => "Capturing",
            Self::Pausing => "Pausing",
            Self::Publishing => "Publishing",
            Self::ResolvingAction => "ResolvingAction",
            Self::Applying => "Applying",
            Self::Terminated => "Terminated",
            Self::Failed => "Failed",
            Self::Interrupted => "Interrupted",
        };
        f.write_str(name)
    }
}

fn is_legal_transition(from: TurnState, to: TurnState) -> bool {
    use TurnState::*;

    if matches!(to, Failed | Interrupted) && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Starting, Idle)
            | (Idle, Resuming)
            | (Resuming, Capturing)
            | (Capturing, Pausing)
            | (Pausing, Publishing)
            | (Publishing, ResolvingAction)
            // Mode switch: ask the new strategy for the same turn
            | (ResolvingAction, ResolvingAction)
            | (ResolvingAction, Applying)
            | (Applying, Idle)
            | (Applying, Terminated)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TurnState,
    pub to: TurnState,
    /// Turn index at the time of transition.
    pub turn: u64,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Illegal state transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: TurnState,
    pub to: TurnState,
}

pub struct StateMachine {
    current: TurnState,
    turn: u64,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: TurnState::Starting,
            turn: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> TurnState {
        self.current
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn set_turn(&mut self, turn: u64) {
        self.turn = turn;
    }

    /// Move to `to` if the edge exists, recording it.
    pub fn advance(&mut self, to: TurnState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::debug!(from = %self.current, to = %to, turn = self.turn, "State transition");
        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            turn: self.turn,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(TurnState::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Start state, end state, timing and the number of completed cycles.
    pub fn summary(&self) -> String {
        let cycles = self
            .transitions
            .iter()
            .filter(|t| t.from == TurnState::Applying)
            .count();
        let mut out = format!(
            "{} → {} ({}ms, {} transitions, {} turns applied)",
            TurnState::Starting,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
            cycles,
        );
        if let Some(reason) = self.transitions.last().and_then(|t| t.reason.as_deref()) {
            out.push_str(&format!(": {reason}"));
        }
        out
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
