//! The turn controller.
//!
//! Drives one [`Session`] through the per-turn cycle described in
//! [`crate::state_machine`]. Per turn exactly one capture task runs; the
//! previous turn's action is delivered while it records and the task is
//! joined before the process is paused again.
//!
//! The process handle is released on every exit path: completion, an
//! operator end request, an error, or cancellation through the supplied
//! [`CancellationToken`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use coordination::actions::{Action, ActionTable};
use coordination::channel::{key, ChannelError, ExchangeKey, PollPolicy, SyncChannel};
use coordination::decision::DecisionService;
use coordination::pipeline::{
    ArtifactRef, CapturePipeline, PipelineError, PresentationSurface, RawClip,
};
use coordination::process::{InputInjector, ProcessError, ProcessLifecycle};
use coordination::strategy::{
    poll_control, ControlScope, ControlSignal, InputStrategy, ManualStrategy, Mode,
    ModelStrategy, Resolution, ScriptedStrategy, StrategyError, TurnContext,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use uuid::Uuid;

use crate::config::DriverConfig;
use crate::session::{PendingTurn, ProcessGuard, Session, TurnHistory};
use crate::state_machine::{IllegalTransition, StateMachine, TurnState};

/// Caption of the first published frame.
pub const START_CAPTION: &str = "Game started!";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Process error on turn {turn} while {state}: {source}")]
    Process {
        turn: u64,
        state: TurnState,
        #[source]
        source: ProcessError,
    },

    #[error("Capture/publish error on turn {turn} while {state}: {source}")]
    Pipeline {
        turn: u64,
        state: TurnState,
        #[source]
        source: PipelineError,
    },

    #[error("{mode} strategy failed on turn {turn}: {source}")]
    Strategy {
        turn: u64,
        mode: Mode,
        #[source]
        source: StrategyError,
    },

    #[error("Channel error on turn {turn} while {state}: {source}")]
    Channel {
        turn: u64,
        state: TurnState,
        #[source]
        source: ChannelError,
    },

    #[error("Session bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Capture task for turn {turn} did not complete: {message}")]
    CaptureTask { turn: u64, message: String },

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
}

/// How a session ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The turn ceiling was reached.
    Completed { turns: u64 },
    /// The operator sent an end request.
    Ended { turns: u64 },
    /// An external signal cancelled the run.
    Interrupted { turns: u64 },
}

impl SessionOutcome {
    pub fn turns(&self) -> u64 {
        match self {
            Self::Completed { turns } | Self::Ended { turns } | Self::Interrupted { turns } => {
                *turns
            }
        }
    }

    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Completed { .. } | Self::Ended { .. } => 0,
            Self::Interrupted { .. } => 130,
        }
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub outcome: SessionOutcome,
    /// Mode in effect when the session ended.
    pub mode: Mode,
    pub history: TurnHistory,
    /// State machine summary line.
    pub summary: String,
}

/// Timing and limits for the turn loop.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub max_turns: u64,
    pub history_limit: usize,
    pub control_scope: ControlScope,
    pub first_capture: Duration,
    pub capture: Duration,
    pub warmup: Duration,
    pub action_lead_in: Duration,
    pub manual_poll: PollPolicy,
    pub seed: Option<u64>,
    /// Show automated picks on the presentation surface.
    pub announce_automated: bool,
}

impl ControllerSettings {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            max_turns: config.max_turns,
            history_limit: config.history_limit,
            control_scope: config.control_scope,
            first_capture: Duration::from_millis(config.first_capture_ms),
            capture: Duration::from_millis(config.capture_ms),
            warmup: Duration::from_millis(config.warmup_ms),
            action_lead_in: Duration::from_millis(config.action_lead_in_ms),
            manual_poll: config.manual_poll(),
            seed: config.seed,
            announce_automated: true,
        }
    }

    fn capture_duration(&self, turn: u64) -> Duration {
        if turn == 0 {
            self.first_capture
        } else {
            self.capture
        }
    }
}

/// External collaborators the controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub process: Arc<dyn ProcessLifecycle>,
    pub injector: Arc<dyn InputInjector>,
    pub pipeline: Arc<dyn CapturePipeline>,
    pub surface: Arc<dyn PresentationSurface>,
    pub decision: Option<Arc<dyn DecisionService>>,
}

/// The action waiting to be delivered on the next turn.
struct Queued {
    action: Action,
    mode: Mode,
    rationale: String,
}

pub struct TurnController {
    settings: ControllerSettings,
    actions: Arc<ActionTable>,
    channel: SyncChannel,
    collab: Collaborators,
    machine: StateMachine,
    strategies: HashMap<Mode, Box<dyn InputStrategy>>,
}

impl TurnController {
    pub fn new(
        settings: ControllerSettings,
        actions: Arc<ActionTable>,
        channel: SyncChannel,
        collab: Collaborators,
    ) -> Self {
        Self {
            settings,
            actions,
            channel,
            collab,
            machine: StateMachine::new(),
            strategies: HashMap::new(),
        }
    }

    /// Use `strategy` for its mode instead of the one built from the
    /// collaborators.
    pub fn with_strategy(mut self, strategy: Box<dyn InputStrategy>) -> Self {
        self.strategies.insert(strategy.mode(), strategy);
        self
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Fill in mode and level from the session-level channel keys when the
    /// configuration leaves them open.
    pub async fn bootstrap(
        &self,
        mode: Option<Mode>,
        level: Option<String>,
    ) -> Result<(Mode, String), SessionError> {
        let bootstrap_err = |e: ChannelError| SessionError::Bootstrap(e.to_string());
        let mode = match mode {
            Some(mode) => mode,
            None => {
                let mode_key = ExchangeKey::session(key::GAME_MODE)
                    .map_err(|e| SessionError::Bootstrap(e.to_string()))?;
                tracing::info!(key = %mode_key, "Waiting for game mode");
                let raw = self
                    .channel
                    .wait_for(&mode_key, self.settings.manual_poll)
                    .await
                    .map_err(bootstrap_err)?;
                raw.parse::<Mode>()
                    .map_err(|e| SessionError::Bootstrap(e.to_string()))?
            }
        };
        let level = match level {
            Some(level) => level,
            None => {
                let level_key = ExchangeKey::session(key::LEVEL)
                    .map_err(|e| SessionError::Bootstrap(e.to_string()))?;
                tracing::info!(key = %level_key, "Waiting for level");
                self.channel
                    .wait_for(&level_key, self.settings.manual_poll)
                    .await
                    .map_err(bootstrap_err)?
                    .trim()
                    .to_string()
            }
        };
        Ok((mode, level))
    }

    /// Start the process and play until the ceiling, an end request, an
    /// error or cancellation. The process is terminated before returning.
    pub async fn run(
        &mut self,
        mode: Mode,
        level: &str,
        cancel: CancellationToken,
    ) -> Result<SessionReport, SessionError> {
        self.machine = StateMachine::new();

        let process = self.collab.process.clone();
        let start_level = level.to_string();
        let handle = tokio::task::spawn_blocking(move || process.start(&start_level))
            .await
            .map_err(|e| SessionError::Process {
                turn: 0,
                state: TurnState::Starting,
                source: ProcessError::CommandFailed(format!("start task failed: {e}")),
            })?
            .map_err(|source| SessionError::Process {
                turn: 0,
                state: TurnState::Starting,
                source,
            })?;

        let guard = ProcessGuard::new(self.collab.process.clone(), handle);
        let mut session = Session::new(mode, level, guard, self.settings.history_limit);
        tracing::info!(
            session = %session.id,
            %mode,
            level,
            pid = handle.pid(),
            max_turns = self.settings.max_turns,
            "Session started"
        );

        let driven = tokio::select! {
            result = self.drive(&mut session) => Some(result),
            _ = cancel.cancelled() => None,
        };

        let turn = self.machine.turn();
        let released = session.terminate();
        if let Err(e) = &released {
            tracing::error!(session = %session.id, error = %e, "Failed to terminate game process");
        }

        let outcome = match driven {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => {
                if !self.machine.is_terminal() {
                    let _ = self.machine.fail(&e.to_string());
                }
                tracing::error!(session = %session.id, turn, error = %e, "Session failed");
                return Err(e);
            }
            None => {
                tracing::warn!(session = %session.id, turn, "Session interrupted, abandoning in-flight turn");
                let _ = self.machine.advance(TurnState::Interrupted, Some("interrupted by signal"));
                SessionOutcome::Interrupted {
                    turns: session.history.total_turns(),
                }
            }
        };

        released.map_err(|source| SessionError::Process {
            turn,
            state: self.machine.current(),
            source,
        })?;

        let summary = self.machine.summary();
        tracing::info!(session = %session.id, %summary, "Session finished");
        Ok(SessionReport {
            session_id: session.id,
            outcome,
            mode: session.mode,
            history: session.history.clone(),
            summary,
        })
    }

    async fn drive(&mut self, session: &mut Session) -> Result<SessionOutcome, SessionError> {
        tokio::time::sleep(self.settings.warmup).await;
        session.process.pause().map_err(|source| SessionError::Process {
            turn: 0,
            state: TurnState::Starting,
            source,
        })?;
        self.machine.advance(TurnState::Idle, Some("warm-up complete"))?;

        let mut queued: Option<Queued> = None;
        for turn in 0..self.settings.max_turns {
            self.machine.set_turn(turn);
            if turn > 0 {
                self.machine.advance(TurnState::Idle, None)?;
            }
            let mut pending = PendingTurn::new(turn, queued.as_ref().map(|q| q.action));

            self.machine.advance(TurnState::Resuming, None)?;
            session.process.resume().map_err(|source| SessionError::Process {
                turn,
                state: TurnState::Resuming,
                source,
            })?;

            self.machine.advance(TurnState::Capturing, None)?;
            let clip = self.capture_and_apply(turn, pending.applied()).await?;

            self.machine.advance(TurnState::Pausing, None)?;
            session.process.pause().map_err(|source| SessionError::Process {
                turn,
                state: TurnState::Pausing,
                source,
            })?;

            self.machine.advance(TurnState::Publishing, None)?;
            let headline = match &queued {
                None => START_CAPTION.to_string(),
                Some(q) => format!(
                    "{} {} {}",
                    q.mode.indicator(),
                    self.actions.glyph(q.action),
                    q.rationale
                ),
            };
            let artifact = self.publish(turn, clip, &headline).await?;
            pending.published(artifact);

            self.machine.advance(TurnState::ResolvingAction, None)?;
            let resolution = self.resolve(session, &pending).await?;

            self.machine.advance(TurnState::Applying, None)?;
            let rationale_key = ExchangeKey::for_turn(key::RATIONALE, turn)
                .map_err(|e| self.channel_error(turn, e.into()))?;
            self.channel
                .put(&rationale_key, &resolution.rationale)
                .await
                .map_err(|e| self.channel_error(turn, e))?;

            let mode = session.mode;
            queued = resolution.action.map(|action| Queued {
                action,
                mode,
                rationale: resolution.rationale.clone(),
            });
            let finished = pending.finalize(mode, resolution.action, resolution.rationale);
            tracing::info!(
                session = %session.id,
                turn,
                %mode,
                applied = ?finished.applied,
                action = ?finished.action,
                rationale = %finished.rationale,
                "Turn applied"
            );
            session.history.push(finished);

            // A switch sent together with a selection applies from the next turn.
            if let ControlSignal::SwitchTo(next) = resolution.signal {
                if mode == Mode::Manual && resolution.action.is_some() && next != mode {
                    session.switch_mode(next);
                }
            }

            if resolution.signal == ControlSignal::End {
                self.machine
                    .advance(TurnState::Terminated, Some("operator ended the session"))?;
                return Ok(SessionOutcome::Ended {
                    turns: session.history.total_turns(),
                });
            }
        }

        self.machine
            .advance(TurnState::Terminated, Some("turn ceiling reached"))?;
        Ok(SessionOutcome::Completed {
            turns: session.history.total_turns(),
        })
    }

    /// Record this turn's clip while delivering `action` inside the window.
    async fn capture_and_apply(
        &self,
        turn: u64,
        action: Option<Action>,
    ) -> Result<RawClip, SessionError> {
        let duration = self.settings.capture_duration(turn);
        let pipeline = self.collab.pipeline.clone();
        let (started_tx, started_rx) = oneshot::channel();
        let capture = AbortOnDropHandle::new(tokio::spawn(async move {
            let _ = started_tx.send(());
            pipeline.capture_clip(turn, duration).await
        }));

        if let Some(action) = action {
            // A dropped sender means the task is already gone; the join
            // below reports why.
            if started_rx.await.is_ok() {
                tokio::time::sleep(self.settings.action_lead_in).await;
                let spec = self.actions.spec(action).ok_or_else(|| SessionError::Process {
                    turn,
                    state: TurnState::Capturing,
                    source: ProcessError::CommandFailed(format!("no input mapping for {action}")),
                })?;
                self.collab
                    .injector
                    .deliver(spec)
                    .await
                    .map_err(|source| SessionError::Process {
                        turn,
                        state: TurnState::Capturing,
                        source,
                    })?;
                tracing::debug!(turn, %action, "Action delivered during capture");
            }
        }

        capture
            .await
            .map_err(|e| SessionError::CaptureTask {
                turn,
                message: e.to_string(),
            })?
            .map_err(|source| SessionError::Pipeline {
                turn,
                state: TurnState::Capturing,
                source,
            })
    }

    async fn publish(
        &self,
        turn: u64,
        clip: RawClip,
        headline: &str,
    ) -> Result<ArtifactRef, SessionError> {
        let pipeline_err = |source| SessionError::Pipeline {
            turn,
            state: TurnState::Publishing,
            source,
        };
        let artifact = self
            .collab
            .pipeline
            .to_artifact(clip)
            .await
            .map_err(pipeline_err)?;
        let caption = self.collab.pipeline.caption(&artifact, headline);
        self.collab
            .pipeline
            .publish(&artifact, &caption)
            .await
            .map_err(pipeline_err)?;
        tracing::info!(turn, artifact = %artifact.name, "Turn published");
        Ok(artifact)
    }

    async fn resolve(
        &mut self,
        session: &mut Session,
        pending: &PendingTurn,
    ) -> Result<Resolution, SessionError> {
        let turn = pending.index();

        if session.mode != Mode::Manual && self.settings.control_scope == ControlScope::EveryTurn {
            let signal = poll_control(&self.channel, turn)
                .await
                .map_err(|e| self.channel_error(turn, e))?;
            match signal {
                ControlSignal::End => {
                    tracing::info!(turn, "Operator ended the session");
                    return Ok(Resolution::signalled(
                        ControlSignal::End,
                        "Operator ended the session",
                    ));
                }
                ControlSignal::SwitchTo(mode) => {
                    tracing::warn!(turn, %mode, current = %session.mode, "Mode switch is only honored in manual mode, ignoring");
                }
                ControlSignal::Continue => {}
            }
        }

        loop {
            let mode = session.mode;
            let ctx = TurnContext {
                turn,
                artifact: pending.artifact(),
            };
            let strategy = self.strategy(mode, turn)?;
            let resolution = strategy
                .resolve(ctx)
                .await
                .map_err(|source| SessionError::Strategy { turn, mode, source })?;

            match resolution.signal {
                ControlSignal::SwitchTo(next)
                    if mode == Mode::Manual && next != mode && resolution.action.is_none() =>
                {
                    session.switch_mode(next);
                    self.machine.advance(
                        TurnState::ResolvingAction,
                        Some(&format!("switched to {next}")),
                    )?;
                }
                _ => return Ok(resolution),
            }
        }
    }

    fn strategy(&mut self, mode: Mode, turn: u64) -> Result<&mut Box<dyn InputStrategy>, SessionError> {
        if !self.strategies.contains_key(&mode) {
            let built = self
                .build_strategy(mode)
                .map_err(|source| SessionError::Strategy { turn, mode, source })?;
            self.strategies.insert(mode, built);
        }
        self.strategies.get_mut(&mode).ok_or(SessionError::Strategy {
            turn,
            mode,
            source: StrategyError::NotConfigured(mode, "strategy unavailable".into()),
        })
    }

    fn build_strategy(&self, mode: Mode) -> Result<Box<dyn InputStrategy>, StrategyError> {
        let announce = self
            .settings
            .announce_automated
            .then(|| self.collab.surface.clone());
        let strategy: Box<dyn InputStrategy> = match mode {
            Mode::Manual => Box::new(ManualStrategy::new(
                self.actions.clone(),
                self.channel.clone(),
                self.collab.surface.clone(),
                self.settings.manual_poll,
            )),
            Mode::Scripted => {
                let strategy = ScriptedStrategy::new(self.actions.clone(), self.settings.seed);
                Box::new(match announce {
                    Some(surface) => strategy.with_surface(surface),
                    None => strategy,
                })
            }
            Mode::ModelDriven => {
                let service = self.collab.decision.clone().ok_or_else(|| {
                    StrategyError::NotConfigured(mode, "no decision service configured".into())
                })?;
                let strategy = ModelStrategy::new(self.actions.clone(), service);
                Box::new(match announce {
                    Some(surface) => strategy.with_surface(surface),
                    None => strategy,
                })
            }
        };
        Ok(strategy)
    }

    fn channel_error(&self, turn: u64, source: ChannelError) -> SessionError {
        SessionError::Channel {
            turn,
            state: self.machine.current(),
            source,
        }
    }
}
