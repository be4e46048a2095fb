pub mod channel;
pub mod controller;
pub mod error;
pub mod executor;
pub mod history;
pub mod model;
pub mod settings;
pub mod sync;
pub mod types;

pub use channel::{HostChannel, HostTransport};
pub use controller::SessionController;
pub use error::{ChannelError, EngineError};
pub use executor::{ActionExecutor, AutoApproveGate, ConfirmationGate};
pub use model::{ModelClient, ModelCollaborator, ModelConfig};
pub use settings::EngineSettings;
pub use sync::SyncBridge;
pub use types::{Action, ExecutionMode, SessionPhase, SessionToken, SyncSnapshot};
