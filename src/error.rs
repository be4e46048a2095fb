use thiserror::Error;

use crate::types::SessionPhase;

#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    #[error("no reply to {kind} within {timeout_ms}ms (request {request_id})")]
    Timeout { kind: &'static str, request_id: String, timeout_ms: u64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed host reply: {0}")]
    Malformed(String),
    #[error("channel closed")]
    Closed,
}

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("host reported failure: {0}")]
    Host(String),
    #[error("model collaborator error: {0}")]
    Model(String),
    #[error("malformed action: {0}")]
    MalformedAction(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Error, Clone)]
#[error("illegal transition from {from:?} on {event}")]
pub struct TransitionError {
    pub from: SessionPhase,
    pub event: String,
}
