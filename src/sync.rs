use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::channel::{HostChannel, HostRequest, StateReply};
use crate::controller::SessionController;
use crate::error::{ChannelError, EngineError};
use crate::types::{SessionPhase, SyncSnapshot};

/// How long to wait before asking again while the cached status is still
/// `closing` (the navigation that killed the previous context may not have
/// settled yet).
const CLOSING_RETRY_DELAY: Duration = Duration::from_millis(500);
const CLOSING_RETRY_LIMIT: usize = 4;

/// Serializes engine state into the hosting context and rehydrates a fresh
/// engine from it after teardown. The host side is a passive single-slot
/// last-write-wins cache, not an FSM participant.
pub struct SyncBridge {
    channel: Arc<HostChannel>,
}

impl SyncBridge {
    pub fn new(channel: Arc<HostChannel>) -> Self {
        Self { channel }
    }

    /// Fire-and-forget snapshot push; a failed push is logged, never fatal.
    pub async fn push(&self, snapshot: &SyncSnapshot) {
        let request = HostRequest::SyncState(Box::new(snapshot.clone()));
        if let Err(e) = self.channel.notify(request).await {
            warn!(error = %e, "snapshot push failed");
        }
    }

    pub async fn request(&self) -> Result<Option<SyncSnapshot>, ChannelError> {
        let value = self.channel.request(HostRequest::RequestState).await?;
        let reply: StateReply =
            serde_json::from_value(value).map_err(|e| ChannelError::Malformed(e.to_string()))?;
        Ok(reply.snapshot)
    }

    pub async fn clear(&self, reason: &str) -> Result<(), ChannelError> {
        self.channel
            .notify(HostRequest::ClearState { reason: reason.to_string() })
            .await
    }

    /// Rehydrates `controller` from the host's cached snapshot, if any.
    /// Returns true when a live session was restored. A snapshot caught
    /// mid-continue (unresolved function responses) has that continue call
    /// re-issued exactly once; the action is never re-executed.
    pub async fn restore(&self, controller: &mut SessionController) -> Result<bool, EngineError> {
        let mut attempts = 0;
        let snapshot = loop {
            match self.request().await? {
                None => {
                    debug!("no cached snapshot, starting fresh");
                    return Ok(false);
                }
                Some(snapshot) if snapshot.status == SessionPhase::Closing => {
                    attempts += 1;
                    if attempts > CLOSING_RETRY_LIMIT {
                        warn!("cached snapshot stuck in closing, giving up on restore");
                        return Ok(false);
                    }
                    debug!(attempts, "cached snapshot still closing, deferring restore");
                    sleep(CLOSING_RETRY_DELAY).await;
                }
                Some(snapshot) => break snapshot,
            }
        };

        if snapshot.session_token.is_none() {
            debug!(status = ?snapshot.status, "cached snapshot has no live session");
            return Ok(false);
        }

        info!(status = ?snapshot.status, "rehydrating from cached snapshot");
        controller.adopt(snapshot);
        controller.replay_unresolved().await?;
        controller.run_pending().await?;
        Ok(true)
    }
}
