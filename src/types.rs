use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ========================= Actions =========================

/// One model-proposed action. The engine never interprets `name`/`args`
/// beyond the safety-decision gate; they are opaque pairs executed by the
/// host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(rename = "callId", default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyDecision {
    pub decision: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), args: Map::new(), call_id: None }
    }

    pub fn safety_decision(&self) -> Option<SafetyDecision> {
        self.args
            .get("safety_decision")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn requires_confirmation(&self) -> bool {
        self.safety_decision()
            .map(|d| d.decision == "require_confirmation")
            .unwrap_or(false)
    }
}

// ========================= Function responses =========================

/// An action's outcome reshaped for the model's next turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub response: FunctionOutcome,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_acknowledgement: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: InlineData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

impl Part {
    pub fn png(data_base64: impl Into<String>) -> Self {
        Self {
            inline_data: InlineData { mime_type: "image/png".into(), data: data_base64.into() },
        }
    }
}

// ========================= Session state =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    Idle,
    AwaitingStart,
    Active,
    Executing,
    PendingResponse,
    Continuing,
    WaitingNavigation,
    Paused,
    Closing,
    Error,
    Completed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Auto,
    Manual,
}

/// Opaque continuation handle issued by the model collaborator. Threaded
/// through calls and snapshots, never inspected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken(pub String);

// ========================= Sync snapshot =========================

/// Serializable projection of the whole engine. The latest snapshot plus a
/// freshly captured screenshot must be sufficient to rebuild a torn-down
/// engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub status: SessionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<SessionToken>,
    #[serde(default)]
    pub pending_queue: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    pub execution_mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_screenshot_at: Option<u128>,
    pub settle_delay: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    #[serde(default)]
    pub history: Vec<crate::history::HistoryEntry>,
    #[serde(default)]
    pub unresolved_function_responses: Vec<FunctionResponse>,
}
