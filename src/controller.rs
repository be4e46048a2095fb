use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{HostChannel, HostRequest};
use crate::error::{EngineError, TransitionError};
use crate::executor::{ActionExecutor, ConfirmationGate};
use crate::history::{now_ms, HistoryKind, HistoryLog};
use crate::model::{ContinueRequest, ModelCollaborator, ModelTurn, StartRequest};
use crate::settings::EngineSettings;
use crate::types::{
    Action, ExecutionMode, FunctionResponse, SessionPhase, SessionToken, SyncSnapshot,
};

// ========================= Phase machine =========================

#[derive(Clone, Debug)]
pub enum PhaseEvent {
    InstructionSubmitted,
    StartReturned,
    ActionPopped,
    ActionSucceeded,
    ActionDeclined,
    ContinueIssued,
    TurnApplied,
    TurnCompleted,
    NavigationSeen,
    NavigationSettled,
    Fault,
    PauseRequested,
    ResumeRequested,
    CloseRequested,
    Reset,
}

/// Legal phase transitions. Illegal pairs are an error, never a silent
/// no-op.
pub fn transition(current: SessionPhase, event: &PhaseEvent) -> Result<SessionPhase, TransitionError> {
    use PhaseEvent as E;
    use SessionPhase as P;
    match (current, event) {
        (P::Idle | P::Error | P::Completed, E::InstructionSubmitted) => Ok(P::AwaitingStart),
        (P::AwaitingStart, E::StartReturned) => Ok(P::Active),
        (P::AwaitingStart, E::TurnCompleted) => Ok(P::Completed),
        (P::Active | P::Paused, E::ActionPopped) => Ok(P::Executing),
        (P::Executing, E::ActionSucceeded) => Ok(P::PendingResponse),
        (P::Executing, E::ActionDeclined) => Ok(P::Paused),
        (P::PendingResponse, E::ContinueIssued) => Ok(P::Continuing),
        (P::Continuing, E::TurnApplied) => Ok(P::Active),
        (P::Continuing, E::TurnCompleted) => Ok(P::Completed),
        (P::Continuing, E::NavigationSeen) => Ok(P::WaitingNavigation),
        (P::WaitingNavigation, E::NavigationSettled) => Ok(P::Active),
        (P::Paused, E::ResumeRequested) => Ok(P::Active),
        (_, E::Fault) => Ok(P::Error),
        (_, E::PauseRequested) => Ok(P::Paused),
        (_, E::CloseRequested) => Ok(P::Closing),
        (_, E::Reset) => Ok(P::Idle),
        _ => Err(TransitionError { from: current, event: format!("{event:?}") }),
    }
}

// ========================= Controller =========================

/// Owns the session token, the pending action queue, the execution mode
/// and every phase transition. All host and model traffic is strictly
/// sequenced through `&mut self`; there is never more than one action or
/// one model call in flight.
pub struct SessionController {
    channel: Arc<HostChannel>,
    model: Arc<dyn ModelCollaborator>,
    executor: ActionExecutor,
    settings: EngineSettings,
    phase: SessionPhase,
    session: Option<SessionToken>,
    queue: VecDeque<Action>,
    mode: ExecutionMode,
    instruction: Option<String>,
    narration: Option<String>,
    status: String,
    history: HistoryLog,
    round_id: Option<String>,
    last_screenshot: Option<String>,
    last_screenshot_at: Option<u128>,
    page_url: Option<String>,
    page_title: Option<String>,
    unresolved: Vec<FunctionResponse>,
    cancel: CancellationToken,
}

impl SessionController {
    pub fn new(
        channel: Arc<HostChannel>,
        model: Arc<dyn ModelCollaborator>,
        gate: Arc<dyn ConfirmationGate>,
        settings: EngineSettings,
    ) -> Self {
        let executor = ActionExecutor::new(channel.clone(), gate, settings.settle_delay());
        Self {
            channel,
            model,
            executor,
            mode: settings.execution_mode,
            settings,
            phase: SessionPhase::Idle,
            session: None,
            queue: VecDeque::new(),
            instruction: None,
            narration: None,
            status: "idle".into(),
            history: HistoryLog::new(),
            round_id: None,
            last_screenshot: None,
            last_screenshot_at: None,
            page_url: None,
            page_title: None,
            unresolved: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    // ----- accessors -----

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn narration(&self) -> Option<&str> {
        self.narration.as_deref()
    }

    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    pub fn session_token(&self) -> Option<&SessionToken> {
        self.session.as_ref()
    }

    pub fn pending_actions(&self) -> &VecDeque<Action> {
        &self.queue
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Base64 PNG of the most recent capture, if any survived this context.
    pub fn last_screenshot(&self) -> Option<&str> {
        self.last_screenshot.as_deref()
    }

    /// Clone of the cancellation token for the current round; cancelling
    /// it aborts the in-flight model call (an already-dispatched host
    /// action cannot be recalled).
    pub fn cancellation_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ----- lifecycle -----

    /// Starts a new round: clears the previous session and history,
    /// captures a screenshot, and asks the model to open a session.
    /// In auto mode the action-consumption loop runs to quiescence.
    pub async fn submit_instruction(&mut self, text: impl Into<String>) -> Result<(), EngineError> {
        let text = text.into();
        self.apply(PhaseEvent::InstructionSubmitted)?;

        self.session = None;
        self.queue.clear();
        self.unresolved.clear();
        self.narration = None;
        self.history.clear();
        self.cancel = CancellationToken::new();
        let round = self.history.begin_round();
        self.round_id = Some(round.clone());
        self.instruction = Some(text.clone());
        self.history.push(&round, HistoryKind::Instruction { text: text.clone() });
        self.status = "starting".into();
        info!(instruction = %text, "round started");
        self.push_snapshot().await;

        let screenshot = match self.channel.capture_screenshot().await {
            Ok(shot) if shot.success => {
                self.note_screenshot(shot.image_data);
                self.last_screenshot.clone()
            }
            Ok(shot) => {
                let reason = shot.error.unwrap_or_else(|| "screenshot failed".into());
                return self.fail(EngineError::Host(reason)).await;
            }
            Err(e) => return self.fail(e.into()).await,
        };

        let request = StartRequest { instruction: text, screenshot };
        let turn = match self.model.start_session(request, self.cancel.child_token()).await {
            Ok(turn) => turn,
            Err(EngineError::Cancelled) => return self.pause_in_flight().await,
            Err(e) => return self.fail(e).await,
        };
        self.apply_turn(turn, false).await?;

        if self.mode == ExecutionMode::Auto {
            self.run_pending().await?;
        }
        Ok(())
    }

    /// Manual single step: pops exactly one action, executes it, issues
    /// exactly one continue call. Never loops.
    pub async fn step(&mut self) -> Result<(), EngineError> {
        transition(self.phase, &PhaseEvent::ActionPopped)?;
        let Some(action) = self.queue.pop_front() else {
            self.status = "no pending actions".into();
            return Ok(());
        };
        self.apply(PhaseEvent::ActionPopped)?;
        self.run_action(action).await
    }

    /// Consumes queued actions one at a time while in auto mode. Also used
    /// after rehydration to pick the loop back up.
    pub async fn run_pending(&mut self) -> Result<(), EngineError> {
        loop {
            if self.phase != SessionPhase::Active || self.mode != ExecutionMode::Auto {
                return Ok(());
            }
            let Some(action) = self.queue.pop_front() else { return Ok(()) };
            self.apply(PhaseEvent::ActionPopped)?;
            self.run_action(action).await?;
        }
    }

    pub async fn pause(&mut self) -> Result<(), EngineError> {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.apply(PhaseEvent::PauseRequested)?;
        self.status = "paused".into();
        self.push_snapshot().await;
        Ok(())
    }

    /// Mode switches follow pause semantics: manual parks the session (the
    /// queue is preserved for stepping), auto resumes the loop.
    pub async fn set_mode(&mut self, mode: ExecutionMode) -> Result<(), EngineError> {
        if self.mode == mode {
            return Ok(());
        }
        self.mode = mode;
        match mode {
            ExecutionMode::Manual => {
                self.cancel.cancel();
                self.cancel = CancellationToken::new();
                self.apply(PhaseEvent::PauseRequested)?;
                self.status = "paused".into();
                self.push_snapshot().await;
            }
            ExecutionMode::Auto => {
                if self.phase == SessionPhase::Paused {
                    self.apply(PhaseEvent::ResumeRequested)?;
                }
                self.push_snapshot().await;
                self.run_pending().await?;
            }
        }
        Ok(())
    }

    /// Host signalled imminent navigation or context unload: push one final
    /// snapshot before this execution context is expected to die.
    pub async fn prepare_close(&mut self) -> Result<(), EngineError> {
        self.apply(PhaseEvent::CloseRequested)?;
        self.status = "closing".into();
        self.push_snapshot().await;
        Ok(())
    }

    /// The awaited navigation finished without tearing this context down.
    pub async fn resume_after_navigation(&mut self) -> Result<(), EngineError> {
        self.apply(PhaseEvent::NavigationSettled)?;
        self.push_snapshot().await;
        if self.mode == ExecutionMode::Auto {
            self.run_pending().await?;
        }
        Ok(())
    }

    pub async fn reset(&mut self) -> Result<(), EngineError> {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.session = None;
        self.queue.clear();
        self.unresolved.clear();
        self.instruction = None;
        self.narration = None;
        self.round_id = None;
        self.history.clear();
        self.apply(PhaseEvent::Reset)?;
        self.status = "idle".into();
        let _ = self
            .channel
            .notify(HostRequest::ClearState { reason: "reset".into() })
            .await;
        Ok(())
    }

    /// Final snapshot push; call when the engine is about to be dropped.
    pub async fn dispose(mut self) {
        let _ = self.prepare_close().await;
    }

    pub fn set_settle_delay_ms(&mut self, ms: u64) {
        self.settings.action_settle_delay_ms = ms;
        self.executor.set_settle_delay(Duration::from_millis(ms));
    }

    // ----- snapshotting -----

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            status: self.phase,
            session_token: self.session.clone(),
            pending_queue: self.queue.iter().cloned().collect(),
            narration: self.narration.clone(),
            instruction: self.instruction.clone(),
            execution_mode: self.mode,
            last_screenshot_at: self.last_screenshot_at,
            settle_delay: self.settings.action_settle_delay_ms,
            page_url: self.page_url.clone(),
            page_title: self.page_title.clone(),
            history: self.history.to_vec(),
            unresolved_function_responses: self.unresolved.clone(),
        }
    }

    /// Adopts a cached snapshot wholesale. Mid-flight statuses collapse to
    /// `PendingResponse` (an unresolved continue call must be replayed) or
    /// `Active`.
    pub(crate) fn adopt(&mut self, snapshot: SyncSnapshot) {
        self.session = snapshot.session_token;
        self.queue = snapshot.pending_queue.into();
        self.mode = snapshot.execution_mode;
        self.instruction = snapshot.instruction;
        self.narration = snapshot.narration;
        self.history.replace(snapshot.history);
        self.round_id = self.history.entries().last().map(|e| e.round_id.clone());
        self.page_url = snapshot.page_url;
        self.page_title = snapshot.page_title;
        self.last_screenshot_at = snapshot.last_screenshot_at;
        self.set_settle_delay_ms(snapshot.settle_delay);
        self.unresolved = snapshot.unresolved_function_responses;
        self.phase = if self.unresolved.is_empty() {
            SessionPhase::Active
        } else {
            SessionPhase::PendingResponse
        };
        self.status = "restored".into();
        info!(queued = self.queue.len(), unresolved = self.unresolved.len(), "state rehydrated");
    }

    /// Re-issues the continue call for a function response whose model turn
    /// never completed before teardown. Exactly once: the action itself is
    /// never re-executed, so the page sees no duplicate side effects.
    pub(crate) async fn replay_unresolved(&mut self) -> Result<(), EngineError> {
        if self.unresolved.is_empty() {
            return Ok(());
        }
        let Some(session) = self.session.clone() else {
            self.unresolved.clear();
            return Ok(());
        };
        self.apply(PhaseEvent::ContinueIssued)?;
        let responses = std::mem::take(&mut self.unresolved);
        let request = ContinueRequest { session, function_responses: responses.clone() };
        let turn = match self.model.continue_session(request, self.cancel.child_token()).await {
            Ok(turn) => turn,
            Err(EngineError::Cancelled) => {
                self.unresolved = responses;
                return self.pause_in_flight().await;
            }
            Err(e) => return self.fail(e).await,
        };
        self.apply_turn(turn, false).await
    }

    // ----- internals -----

    fn apply(&mut self, event: PhaseEvent) -> Result<(), TransitionError> {
        let next = transition(self.phase, &event)?;
        debug!(from = ?self.phase, to = ?next, event = ?event, "phase transition");
        self.phase = next;
        Ok(())
    }

    fn note_screenshot(&mut self, image_data: Option<String>) {
        self.last_screenshot = image_data;
        self.last_screenshot_at = Some(now_ms());
        if let Some(round) = self.round_id.clone() {
            self.history.push(&round, HistoryKind::Screenshot);
        }
    }

    async fn run_action(&mut self, action: Action) -> Result<(), EngineError> {
        let round = self.round_id.clone().unwrap_or_default();
        self.status = format!("executing {}", action.name);
        let outcome = self.executor.execute(&action).await;
        match outcome {
            Err(e) => self.fail(e).await,
            Ok(None) => {
                // Decline is user cancellation, not an error: the action is
                // dropped and the round halts awaiting the user.
                self.history.push(
                    &round,
                    HistoryKind::Note { text: format!("confirmation declined for {}", action.name) },
                );
                self.apply(PhaseEvent::ActionDeclined)?;
                self.status = format!("declined {}", action.name);
                self.push_snapshot().await;
                Ok(())
            }
            Ok(Some(response)) => {
                let navigation = response.response.navigation.unwrap_or(false);
                if let Some(part) = response.parts.first() {
                    self.last_screenshot = Some(part.inline_data.data.clone());
                    self.last_screenshot_at = Some(now_ms());
                }
                if response.response.url.is_some() {
                    self.page_url = response.response.url.clone();
                }
                self.history.push(
                    &round,
                    HistoryKind::ActionResult {
                        name: response.name.clone(),
                        success: true,
                        selector: response.response.selector.clone(),
                        info: response.response.info.clone(),
                    },
                );
                self.status = match &response.response.selector {
                    Some(selector) => format!("executed {} on {}", response.name, selector),
                    None => format!("executed {}", response.name),
                };
                self.apply(PhaseEvent::ActionSucceeded)?;
                // Snapshot now: if the context dies before the continue call
                // lands, rehydration replays it instead of the action.
                self.unresolved = vec![response.clone()];
                self.push_snapshot().await;

                self.apply(PhaseEvent::ContinueIssued)?;
                let Some(session) = self.session.clone() else {
                    return self.fail(EngineError::Model("continue without session".into())).await;
                };
                let request =
                    ContinueRequest { session, function_responses: vec![response] };
                let turn = match self
                    .model
                    .continue_session(request, self.cancel.child_token())
                    .await
                {
                    Ok(turn) => turn,
                    Err(EngineError::Cancelled) => return self.pause_in_flight().await,
                    Err(e) => return self.fail(e).await,
                };
                self.unresolved.clear();
                self.apply_turn(turn, navigation).await
            }
        }
    }

    async fn apply_turn(&mut self, turn: ModelTurn, navigation: bool) -> Result<(), EngineError> {
        let completed = turn.is_completion();
        self.session = Some(turn.session);
        self.narration = turn.narration.clone();
        if let Some(round) = self.round_id.clone() {
            self.history.push(
                &round,
                HistoryKind::ModelResponse {
                    narration: turn.narration,
                    action_count: turn.actions.len(),
                },
            );
        }
        // The new action list replaces the queue outright; the tail of a
        // multi-action turn is discarded, trusting the model to re-request
        // dropped work on its next turn.
        self.queue = turn.actions.into();

        if completed {
            return self.complete().await;
        }
        let event = if self.phase == SessionPhase::AwaitingStart {
            PhaseEvent::StartReturned
        } else if navigation {
            PhaseEvent::NavigationSeen
        } else {
            PhaseEvent::TurnApplied
        };
        self.apply(event)?;
        self.status = self.narration.clone().unwrap_or_else(|| "ready".into());
        self.push_snapshot().await;
        Ok(())
    }

    async fn complete(&mut self) -> Result<(), EngineError> {
        self.session = None;
        self.queue.clear();
        self.apply(PhaseEvent::TurnCompleted)?;
        self.status = self.narration.clone().unwrap_or_else(|| "task completed".into());
        info!("session completed");
        let _ = self
            .channel
            .notify(HostRequest::ClearState { reason: "completed".into() })
            .await;
        Ok(())
    }

    async fn pause_in_flight(&mut self) -> Result<(), EngineError> {
        self.cancel = CancellationToken::new();
        self.apply(PhaseEvent::PauseRequested)?;
        self.status = "paused".into();
        self.push_snapshot().await;
        Ok(())
    }

    /// Terminal error: token nulled so a rehydrated engine never mistakes a
    /// dead session for a resumable one; the remaining queue is frozen for
    /// inspection until an explicit reset or fresh instruction.
    async fn fail(&mut self, err: EngineError) -> Result<(), EngineError> {
        warn!(error = %err, "session failed");
        self.session = None;
        self.apply(PhaseEvent::Fault)?;
        self.status = err.to_string();
        if let Some(round) = self.round_id.clone() {
            self.history.push(&round, HistoryKind::Note { text: err.to_string() });
        }
        self.push_snapshot().await;
        Err(err)
    }

    async fn push_snapshot(&mut self) {
        let snapshot = self.snapshot();
        if let Err(e) = self
            .channel
            .notify(HostRequest::SyncState(Box::new(snapshot)))
            .await
        {
            warn!(error = %e, "sync push failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionPhase as P;

    #[test]
    fn happy_path_transitions() {
        let mut phase = P::Idle;
        for (event, expected) in [
            (PhaseEvent::InstructionSubmitted, P::AwaitingStart),
            (PhaseEvent::StartReturned, P::Active),
            (PhaseEvent::ActionPopped, P::Executing),
            (PhaseEvent::ActionSucceeded, P::PendingResponse),
            (PhaseEvent::ContinueIssued, P::Continuing),
            (PhaseEvent::TurnApplied, P::Active),
        ] {
            phase = transition(phase, &event).unwrap();
            assert_eq!(phase, expected);
        }
    }

    #[test]
    fn completion_paths() {
        assert_eq!(
            transition(P::AwaitingStart, &PhaseEvent::TurnCompleted).unwrap(),
            P::Completed
        );
        assert_eq!(
            transition(P::Continuing, &PhaseEvent::TurnCompleted).unwrap(),
            P::Completed
        );
        assert_eq!(
            transition(P::Completed, &PhaseEvent::InstructionSubmitted).unwrap(),
            P::AwaitingStart
        );
    }

    #[test]
    fn error_is_reachable_from_anywhere_and_needs_reset() {
        for phase in [P::Idle, P::AwaitingStart, P::Active, P::Executing, P::Continuing] {
            assert_eq!(transition(phase, &PhaseEvent::Fault).unwrap(), P::Error);
        }
        assert!(transition(P::Error, &PhaseEvent::ActionPopped).is_err());
        assert_eq!(
            transition(P::Error, &PhaseEvent::InstructionSubmitted).unwrap(),
            P::AwaitingStart
        );
    }

    #[test]
    fn pause_and_close_are_wildcards() {
        for phase in [P::Active, P::Executing, P::Continuing, P::AwaitingStart] {
            assert_eq!(transition(phase, &PhaseEvent::PauseRequested).unwrap(), P::Paused);
            assert_eq!(transition(phase, &PhaseEvent::CloseRequested).unwrap(), P::Closing);
        }
    }

    #[test]
    fn stepping_is_legal_from_paused() {
        assert_eq!(transition(P::Paused, &PhaseEvent::ActionPopped).unwrap(), P::Executing);
    }

    #[test]
    fn navigation_detour() {
        assert_eq!(
            transition(P::Continuing, &PhaseEvent::NavigationSeen).unwrap(),
            P::WaitingNavigation
        );
        assert_eq!(
            transition(P::WaitingNavigation, &PhaseEvent::NavigationSettled).unwrap(),
            P::Active
        );
    }

    #[test]
    fn illegal_pairs_are_rejected() {
        assert!(transition(P::Idle, &PhaseEvent::ActionPopped).is_err());
        assert!(transition(P::Active, &PhaseEvent::ContinueIssued).is_err());
        assert!(transition(P::Executing, &PhaseEvent::TurnApplied).is_err());
        assert!(transition(P::Active, &PhaseEvent::InstructionSubmitted).is_err());
    }
}
