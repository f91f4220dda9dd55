//! End-to-end turn loop tests against recording fakes.
//!
//! Every collaborator appends to one shared event log, so ordering between
//! capture, delivery and publishing can be asserted directly. The tokio clock
//! is paused; capture windows and poll loops complete instantly.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coordination::actions::{Action, ActionSpec, ActionTable};
use coordination::channel::{ExchangeStore, MemoryStore, PollPolicy, SyncChannel};
use coordination::decision::{DecisionError, DecisionService};
use coordination::pipeline::{
    ArtifactRef, CapturePipeline, PipelineError, PresentationSurface, RawClip,
};
use coordination::process::{InputInjector, ProcessError, ProcessHandle, ProcessLifecycle};
use coordination::strategy::{ControlScope, Mode, StrategyError};
use doom_driver::controller::{
    Collaborators, ControllerSettings, SessionError, SessionOutcome, TurnController,
    START_CAPTION,
};
use doom_driver::state_machine::TurnState;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Started(String),
    Paused,
    Resumed,
    Terminated,
    CaptureStart(u64),
    CaptureEnd(u64),
    Delivered(String),
    Published(u64, String),
    Presented(u64, String),
    Announced(u64, String),
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.snapshot().iter().filter(|e| pred(e)).count()
    }
}

struct FakeProcess {
    log: Arc<EventLog>,
    /// Report the process as already gone on terminate.
    vanish: bool,
}

impl ProcessLifecycle for FakeProcess {
    fn start(&self, level: &str) -> Result<ProcessHandle, ProcessError> {
        self.log.push(Event::Started(level.to_string()));
        Ok(ProcessHandle::new(4242))
    }

    fn pause(&self, _handle: &ProcessHandle) -> Result<(), ProcessError> {
        self.log.push(Event::Paused);
        Ok(())
    }

    fn resume(&self, _handle: &ProcessHandle) -> Result<(), ProcessError> {
        self.log.push(Event::Resumed);
        Ok(())
    }

    fn terminate(&self, handle: &ProcessHandle) -> Result<(), ProcessError> {
        self.log.push(Event::Terminated);
        if self.vanish {
            return Err(ProcessError::NotFound(handle.pid()));
        }
        Ok(())
    }
}

struct FakeInjector {
    log: Arc<EventLog>,
}

#[async_trait]
impl InputInjector for FakeInjector {
    async fn deliver(&self, spec: &ActionSpec) -> Result<(), ProcessError> {
        self.log.push(Event::Delivered(spec.key.clone()));
        Ok(())
    }
}

struct FakePipeline {
    log: Arc<EventLog>,
}

#[async_trait]
impl CapturePipeline for FakePipeline {
    async fn capture_clip(&self, turn: u64, duration: Duration) -> Result<RawClip, PipelineError> {
        self.log.push(Event::CaptureStart(turn));
        tokio::time::sleep(duration).await;
        self.log.push(Event::CaptureEnd(turn));
        Ok(RawClip {
            turn,
            path: PathBuf::from(format!("/tmp/fake/{turn}.apng")),
        })
    }

    async fn to_artifact(&self, clip: RawClip) -> Result<ArtifactRef, PipelineError> {
        Ok(ArtifactRef {
            turn: clip.turn,
            name: format!("{}.png", clip.turn),
            path: clip.path.with_extension("png"),
        })
    }

    async fn publish(&self, artifact: &ArtifactRef, caption_html: &str) -> Result<(), PipelineError> {
        self.log
            .push(Event::Published(artifact.turn, caption_html.to_string()));
        Ok(())
    }
}

#[async_trait]
impl PresentationSurface for FakePipeline {
    async fn present_choice(
        &self,
        turn: u64,
        response_key: &str,
        _options: &[ActionSpec],
    ) -> Result<(), PipelineError> {
        self.log.push(Event::Presented(turn, response_key.to_string()));
        Ok(())
    }

    async fn announce(&self, turn: u64, headline: &str) -> Result<(), PipelineError> {
        self.log.push(Event::Announced(turn, headline.to_string()));
        Ok(())
    }
}

/// Replies with a fixed string for every capture.
struct CannedDecision(&'static str);

#[async_trait]
impl DecisionService for CannedDecision {
    async fn submit(&self, _image: &Path, _instruction: &str) -> Result<String, DecisionError> {
        Ok(self.0.to_string())
    }
}

struct Harness {
    log: Arc<EventLog>,
    store: Arc<MemoryStore>,
    controller: TurnController,
}

fn settings(max_turns: u64) -> ControllerSettings {
    ControllerSettings {
        max_turns,
        history_limit: 32,
        control_scope: ControlScope::ManualOnly,
        first_capture: Duration::from_millis(2500),
        capture: Duration::from_millis(1250),
        warmup: Duration::from_secs(2),
        action_lead_in: Duration::from_millis(100),
        manual_poll: PollPolicy::new(Duration::from_secs(600), Duration::from_secs(1)),
        seed: Some(11),
        announce_automated: true,
    }
}

fn harness_with(
    settings: ControllerSettings,
    decision: Option<Arc<dyn DecisionService>>,
    vanish: bool,
) -> Harness {
    let log = Arc::new(EventLog::default());
    let store = Arc::new(MemoryStore::new());
    let pipeline = Arc::new(FakePipeline { log: log.clone() });
    let collab = Collaborators {
        process: Arc::new(FakeProcess {
            log: log.clone(),
            vanish,
        }),
        injector: Arc::new(FakeInjector { log: log.clone() }),
        pipeline: pipeline.clone(),
        surface: pipeline,
        decision,
    };
    let controller = TurnController::new(
        settings,
        Arc::new(ActionTable::standard()),
        SyncChannel::new(store.clone()),
        collab,
    );
    Harness {
        log,
        store,
        controller,
    }
}

fn harness(max_turns: u64) -> Harness {
    harness_with(settings(max_turns), None, false)
}

fn index_of(events: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("event not found in {events:#?}"))
}

#[tokio::test(start_paused = true)]
async fn test_scripted_session_runs_exactly_three_turns() {
    let mut h = harness(3);
    let report = h
        .controller
        .run(Mode::Scripted, "1", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed { turns: 3 });
    assert_eq!(report.outcome.exit_code(), 0);
    assert_eq!(report.history.len(), 3);

    let table = ActionTable::standard();
    for (i, turn) in report.history.iter().enumerate() {
        assert_eq!(turn.index, i as u64);
        assert_eq!(turn.mode, Mode::Scripted);
        let action = turn.action.expect("every scripted turn resolves an action");
        assert!(table.spec(action).is_some());
    }
    assert_eq!(report.history.iter().next().unwrap().applied, None);

    assert_eq!(h.log.count(|e| *e == Event::Terminated), 1);
    assert_eq!(h.log.snapshot().last(), Some(&Event::Terminated));
    assert_eq!(h.log.snapshot()[0], Event::Started("1".into()));
    assert_eq!(h.controller.state_machine().current(), TurnState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_previous_action_delivered_inside_capture_and_before_publish() {
    let mut h = harness(3);
    let report = h
        .controller
        .run(Mode::Scripted, "1", CancellationToken::new())
        .await
        .unwrap();
    let events = h.log.snapshot();
    let turns: Vec<_> = report.history.iter().cloned().collect();

    // Turn 0 has nothing to deliver.
    let end0 = index_of(&events, |e| *e == Event::CaptureEnd(0));
    assert!(!events[..end0]
        .iter()
        .any(|e| matches!(e, Event::Delivered(_))));

    for turn in 1..3u64 {
        let start = index_of(&events, |e| *e == Event::CaptureStart(turn));
        let end = index_of(&events, |e| *e == Event::CaptureEnd(turn));
        let publish = index_of(&events, |e| matches!(e, Event::Published(t, _) if *t == turn));
        let delivered: Vec<usize> = (start..end)
            .filter(|i| matches!(events[*i], Event::Delivered(_)))
            .collect();
        assert_eq!(delivered.len(), 1, "turn {turn}: {events:#?}");
        assert!(end < publish);

        // The key delivered is the one resolved on the previous turn.
        let expected = ActionTable::standard()
            .spec(turns[turn as usize - 1].action.unwrap())
            .unwrap()
            .key
            .clone();
        assert_eq!(events[delivered[0]], Event::Delivered(expected));
        assert_eq!(turns[turn as usize].applied, turns[turn as usize - 1].action);

        // Resumed just before the capture, paused again right after.
        assert_eq!(events[start - 1], Event::Resumed);
        assert_eq!(events[end + 1], Event::Paused);
    }
    assert_eq!(h.log.count(|e| matches!(e, Event::Delivered(_))), 2);
}

#[tokio::test(start_paused = true)]
async fn test_captions_and_rationale_records() {
    let mut h = harness(2);
    h.controller
        .run(Mode::Scripted, "1", CancellationToken::new())
        .await
        .unwrap();
    let events = h.log.snapshot();

    let captions: Vec<&String> = events
        .iter()
        .filter_map(|e| match e {
            Event::Published(_, caption) => Some(caption),
            _ => None,
        })
        .collect();
    assert_eq!(captions.len(), 2);
    assert!(captions[0].contains(START_CAPTION));
    assert!(captions[1].contains("🎲"));
    assert!(captions[1].contains("Random move: "));

    for turn in 0..2 {
        let rationale = h
            .store
            .read(&format!("rationale_{turn}"))
            .await
            .unwrap()
            .unwrap();
        assert!(rationale.starts_with("Random move: "));
    }
    assert_eq!(h.log.count(|e| matches!(e, Event::Announced(_, _))), 2);
}

#[tokio::test(start_paused = true)]
async fn test_manual_mode_without_control_signal_keeps_mode() {
    let mut h = harness(2);
    h.store.write("action_0", "Up").await.unwrap();
    h.store.write("action_1", "Left").await.unwrap();

    let report = h
        .controller
        .run(Mode::Manual, "2", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed { turns: 2 });
    assert_eq!(report.mode, Mode::Manual);
    let actions: Vec<_> = report.history.iter().map(|t| (t.mode, t.action)).collect();
    assert_eq!(
        actions,
        vec![
            (Mode::Manual, Some(Action::MoveForward)),
            (Mode::Manual, Some(Action::TurnLeft)),
        ]
    );

    let events = h.log.snapshot();
    assert!(events.contains(&Event::Presented(0, "action_0".into())));
    assert!(events.contains(&Event::Presented(1, "action_1".into())));
    // Turn 0's frame is published before the operator is asked.
    let publish0 = index_of(&events, |e| matches!(e, Event::Published(0, _)));
    let present0 = index_of(&events, |e| matches!(e, Event::Presented(0, _)));
    assert!(publish0 < present0);
    // Selections are consumed; only the rationale records remain.
    assert_eq!(h.store.read("action_0").await.unwrap(), None);
    assert_eq!(h.store.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_operator_end_request_stops_after_that_turn() {
    let mut h = harness(20);
    h.store.write("action_0", "Space").await.unwrap();
    h.store.write("control_1", "end").await.unwrap();

    let report = h
        .controller
        .run(Mode::Manual, "1", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Ended { turns: 2 });
    assert_eq!(report.outcome.exit_code(), 0);
    let last = report.history.last().unwrap();
    assert_eq!(last.applied, Some(Action::Interact));
    assert_eq!(last.action, None);
    assert_eq!(h.log.count(|e| *e == Event::Terminated), 1);
}

#[tokio::test(start_paused = true)]
async fn test_end_sent_with_final_move_ends_session() {
    let mut h = harness(20);
    h.store.write("action_0", "Space").await.unwrap();
    h.store.write("action_1", "Up").await.unwrap();
    h.store.write("control_1", "end").await.unwrap();

    let report = h
        .controller
        .run(Mode::Manual, "1", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Ended { turns: 2 });
    let last = report.history.last().unwrap();
    assert_eq!(last.action, Some(Action::MoveForward));
    assert_eq!(h.store.read("control_1").await.unwrap(), None);
    assert_eq!(h.log.count(|e| *e == Event::Terminated), 1);
}

#[tokio::test(start_paused = true)]
async fn test_switch_sent_with_move_applies_from_next_turn() {
    let mut h = harness(3);
    h.store.write("action_0", "Left").await.unwrap();
    h.store.write("control_0", "switch:random").await.unwrap();

    let report = h
        .controller
        .run(Mode::Manual, "1", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed { turns: 3 });
    assert_eq!(report.mode, Mode::Scripted);
    let turns: Vec<_> = report.history.iter().collect();
    assert_eq!(turns[0].mode, Mode::Manual);
    assert_eq!(turns[0].action, Some(Action::TurnLeft));
    assert_eq!(turns[1].applied, Some(Action::TurnLeft));
    assert!(turns[1..].iter().all(|t| t.mode == Mode::Scripted));
}

#[tokio::test(start_paused = true)]
async fn test_manual_switch_resolves_same_turn_in_new_mode() {
    let mut h = harness(2);
    h.store.write("control_0", "switch:random").await.unwrap();

    let report = h
        .controller
        .run(Mode::Manual, "1", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.mode, Mode::Scripted);
    assert_eq!(report.history.len(), 2);
    assert!(report.history.iter().all(|t| t.mode == Mode::Scripted));
    assert!(report.history.iter().all(|t| t.action.is_some()));
    assert!(h
        .controller
        .state_machine()
        .transitions()
        .iter()
        .any(|t| t.reason.as_deref() == Some("switched to scripted")));
}

#[tokio::test(start_paused = true)]
async fn test_every_turn_scope_lets_operator_end_automated_play() {
    let mut s = settings(20);
    s.control_scope = ControlScope::EveryTurn;
    let mut h = harness_with(s, None, false);
    h.store.write("control_2", "end").await.unwrap();
    h.store.write("control_0", "switch:human").await.unwrap();

    let report = h
        .controller
        .run(Mode::Scripted, "1", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Ended { turns: 3 });
    // Switch requests outside manual mode are ignored.
    assert_eq!(report.mode, Mode::Scripted);
}

#[tokio::test(start_paused = true)]
async fn test_control_ignored_outside_manual_by_default() {
    let mut h = harness(2);
    h.store.write("control_0", "end").await.unwrap();
    let report = h
        .controller
        .run(Mode::Scripted, "1", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, SessionOutcome::Completed { turns: 2 });
}

#[tokio::test(start_paused = true)]
async fn test_model_reason_field_is_fatal_and_process_is_cleaned_up() {
    let decision: Arc<dyn DecisionService> =
        Arc::new(CannedDecision(r#"{"action":"Left","reason":"wall ahead"}"#));
    let mut h = harness_with(settings(5), Some(decision), false);

    let err = h
        .controller
        .run(Mode::ModelDriven, "1", CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        SessionError::Strategy {
            turn: 0,
            mode: Mode::ModelDriven,
            source: StrategyError::InvalidModelResponse { .. },
        } => {}
        other => panic!("expected InvalidModelResponse, got {other:?}"),
    }
    assert_eq!(h.log.count(|e| *e == Event::Terminated), 1);
    assert_eq!(h.controller.state_machine().current(), TurnState::Failed);
    assert_eq!(h.log.count(|e| matches!(e, Event::Delivered(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_model_driven_plays_valid_replies() {
    let decision: Arc<dyn DecisionService> =
        Arc::new(CannedDecision(r#"{"action":"Right","rationale":"door on the right"}"#));
    let mut h = harness_with(settings(2), Some(decision), false);

    let report = h
        .controller
        .run(Mode::ModelDriven, "1", CancellationToken::new())
        .await
        .unwrap();
    assert!(report
        .history
        .iter()
        .all(|t| t.action == Some(Action::TurnRight) && t.rationale == "door on the right"));
    let captions: Vec<Event> = h
        .log
        .snapshot()
        .into_iter()
        .filter(|e| matches!(e, Event::Published(1, _)))
        .collect();
    assert!(matches!(&captions[0], Event::Published(_, c) if c.contains("🤖")));
}

#[tokio::test(start_paused = true)]
async fn test_model_mode_without_service_is_not_configured() {
    let mut h = harness(2);
    let err = h
        .controller
        .run(Mode::ModelDriven, "1", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Strategy {
            source: StrategyError::NotConfigured(Mode::ModelDriven, _),
            ..
        }
    ));
    assert_eq!(h.log.count(|e| *e == Event::Terminated), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_timeout_is_fatal() {
    let mut s = settings(3);
    s.manual_poll = PollPolicy::new(Duration::from_secs(30), Duration::from_secs(1));
    let mut h = harness_with(s, None, false);

    let err = h
        .controller
        .run(Mode::Manual, "1", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Strategy {
            turn: 0,
            source: StrategyError::Timeout { .. },
            ..
        }
    ));
    assert_eq!(h.log.count(|e| *e == Event::Terminated), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_terminates_process_and_abandons_turn() {
    let mut h = harness(20);
    h.store.write("action_0", "Up").await.unwrap();
    let cancel = CancellationToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            cancel.cancel();
        })
    };

    // Turn 1 waits for an operator who never answers.
    let report = h.controller.run(Mode::Manual, "1", cancel).await.unwrap();
    trigger.await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Interrupted { turns: 1 });
    assert_eq!(report.outcome.exit_code(), 130);
    assert_eq!(h.log.count(|e| *e == Event::Terminated), 1);
    assert_eq!(h.controller.state_machine().current(), TurnState::Interrupted);
}

#[tokio::test(start_paused = true)]
async fn test_vanished_process_on_terminate_is_not_an_error() {
    let mut h = harness_with(settings(1), None, true);
    let report = h
        .controller
        .run(Mode::Scripted, "1", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, SessionOutcome::Completed { turns: 1 });
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_reads_mode_and_level_from_channel() {
    let h = harness(1);
    let writer = {
        let store = h.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            store.write("game_mode", "ai").await.unwrap();
            store.write("level", " 4 ").await.unwrap();
        })
    };

    let (mode, level) = h.controller.bootstrap(None, None).await.unwrap();
    writer.await.unwrap();
    assert_eq!(mode, Mode::ModelDriven);
    assert_eq!(level, "4");

    let (mode, level) = h
        .controller
        .bootstrap(Some(Mode::Manual), Some("7".into()))
        .await
        .unwrap();
    assert_eq!((mode, level.as_str()), (Mode::Manual, "7"));
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_rejects_unknown_mode() {
    let h = harness(1);
    h.store.write("game_mode", "spectator").await.unwrap();
    let err = h.controller.bootstrap(None, Some("1".into())).await.unwrap_err();
    assert!(matches!(err, SessionError::Bootstrap(_)));
}
