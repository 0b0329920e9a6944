use std::fmt;

use thiserror::Error;

use crate::protocol::ClientId;

/// Transport-engine call that failed while negotiating a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    CreateEndpoint,
    SetRemoteDescription,
    CreateAnswer,
    SetLocalDescription,
    AddCandidate,
}

impl NegotiationStage {
    pub fn metric_label(self) -> &'static str {
        match self {
            NegotiationStage::CreateEndpoint => "create_endpoint",
            NegotiationStage::SetRemoteDescription => "set_remote_description",
            NegotiationStage::CreateAnswer => "create_answer",
            NegotiationStage::SetLocalDescription => "set_local_description",
            NegotiationStage::AddCandidate => "add_candidate",
        }
    }
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NegotiationStage::CreateEndpoint => "create endpoint",
            NegotiationStage::SetRemoteDescription => "set remote description",
            NegotiationStage::CreateAnswer => "create answer",
            NegotiationStage::SetLocalDescription => "set local description",
            NegotiationStage::AddCandidate => "add candidate",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("session already exists for client {0}")]
    AlreadyExists(ClientId),
    #[error("no session for client {0}")]
    NotFound(ClientId),
    #[error("negotiation failed during {stage}: {reason}")]
    Negotiation {
        stage: NegotiationStage,
        reason: String,
    },
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("signaling channel closed for client {0}")]
    ChannelClosed(ClientId),
    #[error("media endpoint error: {0}")]
    Transport(String),
}

impl SignalError {
    pub fn negotiation(stage: NegotiationStage, reason: impl fmt::Display) -> Self {
        SignalError::Negotiation {
            stage,
            reason: reason.to_string(),
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            SignalError::AlreadyExists(_) => "already_exists",
            SignalError::NotFound(_) => "not_found",
            SignalError::Negotiation { .. } => "negotiation",
            SignalError::Malformed(_) => "malformed",
            SignalError::ChannelClosed(_) => "channel_closed",
            SignalError::Transport(_) => "transport",
        }
    }
}

pub type SignalResult<T> = Result<T, SignalError>;
