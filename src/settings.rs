use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ExecutionMode;

pub const DEFAULT_SETTLE_DELAY_MS: u64 = 1000;
pub const MAX_SETTLE_DELAY_MS: u64 = 10_000;

/// Engine configuration, supplied by the embedding settings collaborator.
/// The env-backed default mirrors how the demo binary boots.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    pub api_key: String,
    pub api_base: String,
    pub model_name: String,
    pub temperature: f32,
    pub execution_mode: ExecutionMode,
    pub action_settle_delay_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            api_key: env::var("PILOT_API_KEY").unwrap_or_default(),
            api_base: env::var("PILOT_API_BASE")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
            model_name: env::var("PILOT_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-computer-use-preview".into()),
            temperature: 0.2,
            execution_mode: ExecutionMode::Auto,
            action_settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
        }
    }
}

impl EngineSettings {
    /// Settle delay clamped to [0, 10000] ms.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.action_settle_delay_ms.min(MAX_SETTLE_DELAY_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_delay_is_clamped() {
        let mut settings = EngineSettings { api_key: "k".into(), ..Default::default() };
        assert_eq!(settings.settle_delay(), Duration::from_millis(1000));

        settings.action_settle_delay_ms = 99_000;
        assert_eq!(settings.settle_delay(), Duration::from_millis(10_000));

        settings.action_settle_delay_ms = 0;
        assert_eq!(settings.settle_delay(), Duration::ZERO);
    }
}
