use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use glass_pilot::channel::{Envelope, HostReply, HostRequest, HostTransport};
use glass_pilot::{
    AutoApproveGate, EngineSettings, HostChannel, ModelClient, ModelConfig, SessionController,
    SyncBridge,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Stand-in host for running the engine outside a real privileged context:
/// answers screenshot and action requests with canned successes and keeps
/// the last synced snapshot in memory.
#[derive(Default)]
struct LoopbackHost {
    channel: OnceLock<Arc<HostChannel>>,
    cached: Mutex<Option<serde_json::Value>>,
}

#[async_trait]
impl HostTransport for LoopbackHost {
    async fn post(&self, envelope: Envelope) -> Result<()> {
        let Envelope { request, request_id } = envelope;
        match &request {
            HostRequest::SyncState(snapshot) => {
                *self.cached.lock().unwrap() = Some(serde_json::to_value(snapshot)?);
            }
            HostRequest::ClearState { .. } => {
                *self.cached.lock().unwrap() = None;
            }
            _ => {}
        }
        let Some(id) = request_id else { return Ok(()) };
        let payload = match request {
            HostRequest::RequestSnapshot => {
                // 1x1 transparent PNG
                json!({"success": true, "imageData":
                    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg=="})
            }
            HostRequest::PerformAction { action } => {
                json!({"success": true, "info": format!("performed {}", action.name)})
            }
            HostRequest::RequestState => {
                json!({"snapshot": self.cached.lock().unwrap().clone()})
            }
            _ => json!({}),
        };
        if let Some(channel) = self.channel.get() {
            channel.on_reply(HostReply { request_id: id, payload });
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings = EngineSettings::default();
    let model = Arc::new(ModelClient::new(ModelConfig::from(&settings))?);

    let host = Arc::new(LoopbackHost::default());
    let channel = Arc::new(HostChannel::new(host.clone()));
    host.channel.set(channel.clone()).ok();

    let mut controller =
        SessionController::new(channel.clone(), model, Arc::new(AutoApproveGate), settings);

    // Pick up a previous session if the host cache still has one.
    let bridge = SyncBridge::new(channel);
    if bridge.restore(&mut controller).await? {
        println!("resumed: {}", controller.status());
        return Ok(());
    }

    let instruction = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Open the settings page and report what you see.".to_string());
    controller.submit_instruction(instruction).await?;
    println!("{:?}: {}", controller.phase(), controller.status());

    if let Some(shot) = controller.last_screenshot() {
        let png = B64.decode(shot)?;
        let path = std::env::temp_dir().join("glass_pilot_last.png");
        tokio::fs::write(&path, &png).await?;
        println!("last screenshot saved to {}", path.display());
    }
    Ok(())
}
