use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::types::{Action, SyncSnapshot};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// ========================= Wire envelopes =========================

/// Engine -> host message body. The host replies on the same `requestId`
/// for the request/response kinds; `SyncState` and `ClearState` are
/// fire-and-forget.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostRequest {
    RequestSnapshot,
    PerformAction { action: Action },
    SyncState(Box<SyncSnapshot>),
    RequestState,
    ClearState { reason: String },
}

impl HostRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            HostRequest::RequestSnapshot => "REQUEST_SNAPSHOT",
            HostRequest::PerformAction { .. } => "PERFORM_ACTION",
            HostRequest::SyncState(_) => "SYNC_STATE",
            HostRequest::RequestState => "REQUEST_STATE",
            HostRequest::ClearState { .. } => "CLEAR_STATE",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub request: HostRequest,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Host -> engine reply, correlated by `requestId`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostReply {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScreenshotReply {
    pub success: bool,
    #[serde(rename = "imageData", default)]
    pub image_data: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActionReply {
    pub success: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub navigation: Option<bool>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateReply {
    #[serde(default)]
    pub snapshot: Option<SyncSnapshot>,
}

// ========================= Correlation table =========================

/// Pending request/response settlements keyed by request id. One table is
/// shared by every request kind on a channel; the payload type is generic
/// so screenshot and action replies ride the same machinery.
pub struct CorrelationTable<T> {
    pending: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }
}

impl<T> CorrelationTable<T> {
    pub fn register(&self, id: &str) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.to_string(), tx);
        rx
    }

    /// Settles the entry for `id`, if any. Returns false for unknown or
    /// already-settled ids (a stale reply after a timeout is expected).
    pub fn settle(&self, id: &str, value: T) -> bool {
        match self.pending.lock().unwrap().remove(id) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn abandon(&self, id: &str) {
        self.pending.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ========================= Host channel =========================

/// Outbound side of the privilege boundary. Implementors deliver the
/// envelope into the host context; delivery failure is a transport error.
#[async_trait]
pub trait HostTransport: Send + Sync {
    async fn post(&self, envelope: Envelope) -> anyhow::Result<()>;
}

/// The only way the engine talks to the privileged host. Turns one-way
/// messaging into promise-style request/response with a timeout.
pub struct HostChannel {
    transport: Arc<dyn HostTransport>,
    table: CorrelationTable<Value>,
    timeout: Duration,
}

impl HostChannel {
    pub fn new(transport: Arc<dyn HostTransport>) -> Self {
        Self::with_timeout(transport, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(transport: Arc<dyn HostTransport>, timeout: Duration) -> Self {
        Self { transport, table: CorrelationTable::default(), timeout }
    }

    /// Feed an inbound host message into the channel. Replies carrying an
    /// id nobody is waiting for are dropped.
    pub fn on_reply(&self, reply: HostReply) {
        if !self.table.settle(&reply.request_id, reply.payload) {
            debug!(request_id = %reply.request_id, "dropping reply with no pending request");
        }
    }

    pub async fn request(&self, request: HostRequest) -> Result<Value, ChannelError> {
        let kind = request.kind();
        let id = nanoid!();
        let rx = self.table.register(&id);
        let envelope = Envelope { request, request_id: Some(id.clone()) };
        if let Err(e) = self.transport.post(envelope).await {
            self.table.abandon(&id);
            return Err(ChannelError::Transport(e.to_string()));
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                // Sender dropped without settling; treat like a dead host.
                Err(ChannelError::Closed)
            }
            Err(_) => {
                self.table.abandon(&id);
                warn!(kind, request_id = %id, "host request timed out");
                Err(ChannelError::Timeout {
                    kind,
                    request_id: id,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fire-and-forget dispatch; no correlation entry is created.
    pub async fn notify(&self, request: HostRequest) -> Result<(), ChannelError> {
        let envelope = Envelope { request, request_id: None };
        self.transport
            .post(envelope)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    pub async fn capture_screenshot(&self) -> Result<ScreenshotReply, ChannelError> {
        let value = self.request(HostRequest::RequestSnapshot).await?;
        serde_json::from_value(value).map_err(|e| ChannelError::Malformed(e.to_string()))
    }

    pub async fn perform_action(&self, action: &Action) -> Result<ActionReply, ChannelError> {
        let value = self
            .request(HostRequest::PerformAction { action: action.clone() })
            .await?;
        serde_json::from_value(value).map_err(|e| ChannelError::Malformed(e.to_string()))
    }

    pub fn pending_requests(&self) -> usize {
        self.table.len()
    }
}
