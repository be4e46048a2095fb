use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::channel::HostChannel;
use crate::error::EngineError;
use crate::types::{Action, FunctionOutcome, FunctionResponse, Part};

/// Blocks a sensitive action until the user decides. Declining drops the
/// action without contacting the host.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn confirm(&self, action: &Action, explanation: Option<&str>) -> bool;
}

#[derive(Clone, Copy)]
pub struct AutoApproveGate;

#[async_trait]
impl ConfirmationGate for AutoApproveGate {
    async fn confirm(&self, _action: &Action, _explanation: Option<&str>) -> bool {
        true
    }
}

/// Executes one action through the host channel and packages the outcome
/// for the model's next turn.
pub struct ActionExecutor {
    channel: Arc<HostChannel>,
    gate: Arc<dyn ConfirmationGate>,
    settle_delay: Duration,
}

impl ActionExecutor {
    pub fn new(channel: Arc<HostChannel>, gate: Arc<dyn ConfirmationGate>, settle_delay: Duration) -> Self {
        Self { channel, gate, settle_delay }
    }

    pub fn set_settle_delay(&mut self, delay: Duration) {
        self.settle_delay = delay.min(Duration::from_millis(crate::settings::MAX_SETTLE_DELAY_MS));
    }

    /// `Ok(None)` means the user declined the confirmation; the action is
    /// dropped, not retried, and the host was never contacted.
    pub async fn execute(&self, action: &Action) -> Result<Option<FunctionResponse>, EngineError> {
        if action.name.trim().is_empty() {
            return Err(EngineError::MalformedAction("action has no name".into()));
        }

        let mut acknowledged = None;
        if action.requires_confirmation() {
            let decision = action.safety_decision();
            let explanation = decision.as_ref().and_then(|d| d.explanation.as_deref());
            if !self.gate.confirm(action, explanation).await {
                info!(action = %action.name, "user declined confirmation, dropping action");
                return Ok(None);
            }
            acknowledged = Some("true".to_string());
        }

        let reply = self.channel.perform_action(action).await?;
        if !reply.success {
            let reason = reply.error.unwrap_or_else(|| "action failed".into());
            return Err(EngineError::Host(reason));
        }

        // Let the page finish reflowing or navigating before observing it.
        if !self.settle_delay.is_zero() {
            sleep(self.settle_delay).await;
        }

        // A stale screenshot beats aborting a successful action.
        let parts = match self.channel.capture_screenshot().await {
            Ok(shot) if shot.success => shot.image_data.map(Part::png).into_iter().collect(),
            Ok(shot) => {
                warn!(error = ?shot.error, "screenshot refresh failed, keeping stale frame");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "screenshot refresh failed, keeping stale frame");
                Vec::new()
            }
        };

        Ok(Some(FunctionResponse {
            name: action.name.clone(),
            id: action.call_id.clone(),
            response: FunctionOutcome {
                success: true,
                url: reply.url,
                navigation: reply.navigation,
                selector: reply.selector,
                info: reply.info,
                safety_acknowledgement: acknowledged,
            },
            parts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Envelope, HostReply, HostRequest, HostTransport};
    use serde_json::json;
    use std::sync::{Mutex, OnceLock};

    struct DeclineGate;

    #[async_trait]
    impl ConfirmationGate for DeclineGate {
        async fn confirm(&self, _action: &Action, _explanation: Option<&str>) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct ScriptedHost {
        channel: OnceLock<Arc<HostChannel>>,
        posted: Mutex<Vec<String>>,
        action_reply: Mutex<serde_json::Value>,
        screenshot_ok: Mutex<bool>,
    }

    impl ScriptedHost {
        fn wire(self: &Arc<Self>) -> Arc<HostChannel> {
            let channel = Arc::new(HostChannel::new(self.clone()));
            self.channel.set(channel.clone()).ok();
            channel
        }

        fn posted_kinds(&self) -> Vec<String> {
            self.posted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HostTransport for ScriptedHost {
        async fn post(&self, envelope: Envelope) -> anyhow::Result<()> {
            self.posted.lock().unwrap().push(envelope.request.kind().to_string());
            let Some(id) = envelope.request_id else { return Ok(()) };
            let payload = match envelope.request {
                HostRequest::PerformAction { .. } => self.action_reply.lock().unwrap().clone(),
                HostRequest::RequestSnapshot => {
                    if *self.screenshot_ok.lock().unwrap() {
                        json!({"success": true, "imageData": "cGln"})
                    } else {
                        json!({"success": false, "error": "tab gone"})
                    }
                }
                _ => json!({}),
            };
            self.channel.get().unwrap().on_reply(HostReply { request_id: id, payload });
            Ok(())
        }
    }

    fn scripted(action_reply: serde_json::Value, screenshot_ok: bool) -> (Arc<ScriptedHost>, ActionExecutor) {
        let host = Arc::new(ScriptedHost {
            action_reply: Mutex::new(action_reply),
            screenshot_ok: Mutex::new(screenshot_ok),
            ..Default::default()
        });
        let channel = host.wire();
        let executor = ActionExecutor::new(channel, Arc::new(AutoApproveGate), Duration::ZERO);
        (host, executor)
    }

    #[tokio::test]
    async fn nameless_action_is_fatal() {
        let (_, executor) = scripted(json!({"success": true}), true);
        let err = executor.execute(&Action::new("  ")).await.unwrap_err();
        assert!(matches!(err, EngineError::MalformedAction(_)));
    }

    #[tokio::test]
    async fn declined_confirmation_never_reaches_host() {
        let host = Arc::new(ScriptedHost {
            action_reply: Mutex::new(json!({"success": true})),
            screenshot_ok: Mutex::new(true),
            ..Default::default()
        });
        let channel = host.wire();
        let executor = ActionExecutor::new(channel, Arc::new(DeclineGate), Duration::ZERO);

        let mut action = Action::new("type");
        action.args.insert(
            "safety_decision".into(),
            json!({"decision": "require_confirmation", "explanation": "typing a password"}),
        );
        let out = executor.execute(&action).await.unwrap();
        assert!(out.is_none());
        assert!(host.posted_kinds().is_empty());
    }

    #[tokio::test]
    async fn confirmed_action_carries_acknowledgement() {
        let (host, executor) = scripted(json!({"success": true, "selector": "#ok"}), true);
        let mut action = Action::new("click");
        action
            .args
            .insert("safety_decision".into(), json!({"decision": "require_confirmation"}));
        let out = executor.execute(&action).await.unwrap().unwrap();
        assert_eq!(out.response.safety_acknowledgement.as_deref(), Some("true"));
        assert_eq!(host.posted_kinds(), vec!["PERFORM_ACTION", "REQUEST_SNAPSHOT"]);
    }

    #[tokio::test]
    async fn host_failure_is_terminal() {
        let (_, executor) = scripted(json!({"success": false, "error": "target not found"}), true);
        let err = executor.execute(&Action::new("click")).await.unwrap_err();
        match err {
            EngineError::Host(msg) => assert!(msg.contains("target not found")),
            other => panic!("expected host error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn screenshot_refresh_failure_is_swallowed() {
        let (_, executor) = scripted(json!({"success": true, "url": "https://x/settings"}), false);
        let out = executor.execute(&Action::new("click")).await.unwrap().unwrap();
        assert!(out.response.success);
        assert!(out.parts.is_empty());
        assert_eq!(out.response.url.as_deref(), Some("https://x/settings"));
    }

    #[tokio::test]
    async fn successful_action_refreshes_screenshot() {
        let (_, executor) = scripted(
            json!({"success": true, "navigation": true, "selector": "#gear"}),
            true,
        );
        let mut action = Action::new("click");
        action.call_id = Some("c9".into());
        let out = executor.execute(&action).await.unwrap().unwrap();
        assert_eq!(out.id.as_deref(), Some("c9"));
        assert_eq!(out.response.navigation, Some(true));
        assert_eq!(out.parts.len(), 1);
        assert_eq!(out.parts[0].inline_data.data, "cGln");
    }
}
