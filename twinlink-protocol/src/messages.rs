//! Client-registry frame types

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Authentication material presented in the handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Credentials {
    /// Username/password pair
    Basic { username: String, password: String },
    /// Key-based authentication; the key itself is presented by the
    /// transport layer, the frame only names the alias to use
    ClientCertificate { alias: String },
}

/// Frames sent from client to registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientFrame {
    /// Initial connection handshake
    Connect {
        client_id: String,
        protocol_version: u32,
        credentials: Credentials,
    },

    /// Correlated request; answered by exactly one `ServerFrame::Reply`
    Request {
        correlation_id: CorrelationId,
        operation: ThingOperation,
    },

    /// Graceful disconnect
    Disconnect,
}

/// Frames sent from registry to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerFrame {
    /// Handshake accepted
    Connected {
        session_id: String,
        protocol_version: u32,
    },

    /// Handshake refused (bad credentials, version mismatch)
    ConnectRejected { code: ErrorCode, reason: String },

    /// Reply to a `ClientFrame::Request`
    Reply {
        correlation_id: CorrelationId,
        outcome: ReplyOutcome,
    },

    /// Pushed event
    Event(ThingEvent),
}

/// Result carried by a reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReplyOutcome {
    /// Operation succeeded; retrieve/create return the Thing
    Success(Option<JsonValue>),
    /// Operation failed on the registry side
    Failure { code: ErrorCode, message: String },
}

/// Error codes reported by the registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    ThingNotFound,
    ThingConflict,
    AttributeNotFound,
    PermissionDenied,
    InvalidPayload,
    AuthenticationFailed,
    ProtocolMismatch,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ThingNotFound => "ThingNotFound",
            ErrorCode::ThingConflict => "ThingConflict",
            ErrorCode::AttributeNotFound => "AttributeNotFound",
            ErrorCode::PermissionDenied => "PermissionDenied",
            ErrorCode::InvalidPayload => "InvalidPayload",
            ErrorCode::AuthenticationFailed => "AuthenticationFailed",
            ErrorCode::ProtocolMismatch => "ProtocolMismatch",
            ErrorCode::InternalError => "InternalError",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
