//! Session aggregate: mode, bounded turn history and the owned process.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use coordination::pipeline::ArtifactRef;
use coordination::process::{tolerate_missing, ProcessError, ProcessHandle, ProcessLifecycle};
use coordination::{Action, Mode};
use uuid::Uuid;

/// A turn that has not been finalized yet.
///
/// Created at loop entry, it gains the artifact while publishing and is
/// turned into an immutable [`Turn`] once the next action is known.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    index: u64,
    applied: Option<Action>,
    artifact: Option<ArtifactRef>,
}

impl PendingTurn {
    pub fn new(index: u64, applied: Option<Action>) -> Self {
        Self {
            index,
            applied,
            artifact: None,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn applied(&self) -> Option<Action> {
        self.applied
    }

    /// Attach the published artifact; the turn is now awaiting its action.
    pub fn published(&mut self, artifact: ArtifactRef) -> &ArtifactRef {
        self.artifact.insert(artifact)
    }

    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.artifact.as_ref()
    }

    pub fn is_awaiting_action(&self) -> bool {
        self.artifact.is_some()
    }

    pub fn finalize(self, mode: Mode, action: Option<Action>, rationale: String) -> Turn {
        Turn {
            index: self.index,
            mode,
            applied: self.applied,
            action,
            rationale,
            artifact: self.artifact,
            finalized_at: Utc::now(),
        }
    }
}

/// One completed capture-decide-apply cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub index: u64,
    /// Mode that resolved `action`.
    pub mode: Mode,
    /// Action delivered during this turn's capture; `None` on turn 0.
    pub applied: Option<Action>,
    /// Action resolved this turn, delivered next turn. `None` only when the
    /// turn ended the session.
    pub action: Option<Action>,
    pub rationale: String,
    pub artifact: Option<ArtifactRef>,
    pub finalized_at: DateTime<Utc>,
}

/// Append-only turn log keeping the most recent `limit` entries.
#[derive(Debug, Clone)]
pub struct TurnHistory {
    entries: VecDeque<Turn>,
    limit: usize,
    total: u64,
}

impl TurnHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
            total: 0,
        }
    }

    pub fn push(&mut self, turn: Turn) {
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(turn);
        self.total += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.entries.back()
    }

    /// Retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every turn ever pushed, including evicted ones.
    pub fn total_turns(&self) -> u64 {
        self.total
    }
}

/// Owns the started process and terminates it exactly once.
///
/// `release` is the normal path; `Drop` covers early returns and panics.
pub struct ProcessGuard {
    lifecycle: Arc<dyn ProcessLifecycle>,
    handle: Option<ProcessHandle>,
}

impl ProcessGuard {
    pub fn new(lifecycle: Arc<dyn ProcessLifecycle>, handle: ProcessHandle) -> Self {
        Self {
            lifecycle,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<ProcessHandle> {
        self.handle
    }

    fn live(&self) -> Result<ProcessHandle, ProcessError> {
        self.handle
            .ok_or_else(|| ProcessError::CommandFailed("process already released".into()))
    }

    pub fn pause(&self) -> Result<(), ProcessError> {
        let handle = self.live()?;
        tolerate_missing(self.lifecycle.pause(&handle), "pause")
    }

    pub fn resume(&self) -> Result<(), ProcessError> {
        let handle = self.live()?;
        self.lifecycle.resume(&handle)
    }

    /// Terminate the process. Later calls are no-ops.
    pub fn release(&mut self) -> Result<(), ProcessError> {
        match self.handle.take() {
            Some(handle) => tolerate_missing(self.lifecycle.terminate(&handle), "terminate"),
            None => Ok(()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!(error = %e, "Failed to terminate game process on drop");
        }
    }
}

/// Everything one run owns.
pub struct Session {
    pub id: Uuid,
    pub mode: Mode,
    pub level: String,
    pub history: TurnHistory,
    pub process: ProcessGuard,
    pub terminated: bool,
}

impl Session {
    pub fn new(mode: Mode, level: impl Into<String>, process: ProcessGuard, history_limit: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            level: level.into(),
            history: TurnHistory::new(history_limit),
            process,
            terminated: false,
        }
    }

    pub fn switch_mode(&mut self, mode: Mode) {
        if mode != self.mode {
            tracing::info!(session = %self.id, from = %self.mode, to = %mode, "Mode switched");
            self.mode = mode;
        }
    }

    /// Release the process and mark the session over.
    pub fn terminate(&mut self) -> Result<(), ProcessError> {
        self.terminated = true;
        self.process.release()
    }
}
