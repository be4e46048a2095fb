use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;
use crate::settings::EngineSettings;
use crate::types::{Action, FunctionResponse, SessionToken};

/// Completion signal: `finish_reason == "STOP"` together with an empty
/// action list.
pub const FINISH_STOP: &str = "STOP";

#[derive(Clone, Debug)]
pub struct ModelTurn {
    pub session: SessionToken,
    pub narration: Option<String>,
    pub actions: Vec<Action>,
    pub finish_reason: Option<String>,
}

impl ModelTurn {
    pub fn is_completion(&self) -> bool {
        self.actions.is_empty() && self.finish_reason.as_deref() == Some(FINISH_STOP)
    }
}

#[derive(Clone, Debug)]
pub struct StartRequest {
    pub instruction: String,
    /// Base64 PNG of the page as the model's first observation.
    pub screenshot: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ContinueRequest {
    pub session: SessionToken,
    pub function_responses: Vec<FunctionResponse>,
}

/// The generative-model collaborator, reduced to an opaque start/continue
/// session API. Network mechanics live behind this seam.
#[async_trait]
pub trait ModelCollaborator: Send + Sync {
    async fn start_session(
        &self,
        request: StartRequest,
        cancel: CancellationToken,
    ) -> Result<ModelTurn, EngineError>;

    async fn continue_session(
        &self,
        request: ContinueRequest,
        cancel: CancellationToken,
    ) -> Result<ModelTurn, EngineError>;
}

// ========================= HTTP client =========================

#[derive(Clone)]
pub struct ModelConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
}

impl From<&EngineSettings> for ModelConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            api_base: settings.api_base.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model_name.clone(),
            temperature: settings.temperature,
        }
    }
}

#[derive(Clone)]
pub struct ModelClient {
    http: Client,
    cfg: ModelConfig,
}

impl ModelClient {
    pub fn new(cfg: ModelConfig) -> Result<Self, EngineError> {
        if cfg.api_key.is_empty() {
            return Err(EngineError::Model("api key missing".into()));
        }
        Ok(Self { http: Client::new(), cfg })
    }

    async fn post_turn(&self, path: &str, body: Value, cancel: CancellationToken) -> Result<ModelTurn, EngineError> {
        let url = format!("{}/{}", self.cfg.api_base, path);
        let send = self
            .http
            .post(&url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send();
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            resp = send => resp.map_err(|e| EngineError::Model(e.to_string()))?,
        };
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| EngineError::Model(e.to_string()))?;
        if !status.is_success() {
            return Err(EngineError::Model(format!("model error {status}: {text}")));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| EngineError::Model(format!("bad model response JSON: {e}")))?;
        Self::parse_turn(v)
    }

    fn parse_turn(v: Value) -> Result<ModelTurn, EngineError> {
        let session = v
            .get("session")
            .and_then(|x| x.as_str())
            .map(|s| SessionToken(s.to_string()))
            .ok_or_else(|| EngineError::Model("missing session in model response".into()))?;

        let narration = v
            .get("narration")
            .and_then(|x| x.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let actions = v
            .get("actions")
            .and_then(|x| x.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|a| serde_json::from_value::<Action>(a.clone()).ok())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let finish_reason = v
            .get("finishReason")
            .and_then(|x| x.as_str())
            .map(|s| s.to_string());

        debug!(actions = actions.len(), finish = ?finish_reason, "model turn parsed");
        Ok(ModelTurn { session, narration, actions, finish_reason })
    }
}

#[async_trait]
impl ModelCollaborator for ModelClient {
    async fn start_session(
        &self,
        request: StartRequest,
        cancel: CancellationToken,
    ) -> Result<ModelTurn, EngineError> {
        let mut parts = vec![json!({ "text": request.instruction })];
        if let Some(image) = request.screenshot {
            parts.push(json!({ "inlineData": { "mimeType": "image/png", "data": image } }));
        }
        let body = json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "instruction": { "parts": parts },
        });
        self.post_turn("sessions/start", body, cancel).await
    }

    async fn continue_session(
        &self,
        request: ContinueRequest,
        cancel: CancellationToken,
    ) -> Result<ModelTurn, EngineError> {
        let body = json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "session": request.session.0,
            "functionResponses": request.function_responses,
        });
        self.post_turn("sessions/continue", body, cancel).await
    }
}
