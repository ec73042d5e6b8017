//! Bidirectional request/response framing over WebSockets.
//!
//! ```text
//! ┌────────────┐   Message {id, target, method, args}    ┌────────────┐
//! │ ApiClient  │ ──────────────────────────────────────► │ ApiServer  │
//! │            │ ◄────────────────────────────────────── │            │
//! └────────────┘   Response {id, ok, result | error}     └─────┬──────┘
//!                                                              │
//!                                               targets: meta, session…
//! ```
//!
//! Every connection starts with the built-in `meta` target; further
//! targets are installed by challenge-response authorization. JSON text
//! frames; registered classes encode as `{"<Name>": [...ctorArgs]}`.

pub mod auth;
pub mod client;
pub mod codec;
pub mod message;
pub mod server;

pub use auth::{challenge_response, TargetAuthority};
pub use client::{ApiClient, SessionProxy};
pub use codec::{decode, encode, Codable, Codec, CodecError, CodedValue};
pub use message::{ErrorInfo, Message, Response};
pub use server::{ApiServer, ServerConfig, ServerStats};

use std::fmt;

/// Errors at the API boundary — framing, transport, and remote failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    /// Caller misuse: malformed argument or call shape.
    BadValue(String),
    /// Data crossed the boundary malformed.
    BadData(String),
    /// Call addressed to a target this connection does not hold.
    UnknownTarget(String),
    /// Transport is closed.
    ConnectionClosed,
    /// Transport is shutting down; no new requests.
    ConnectionClosing,
    /// Transport-level failure.
    ConnectionError(String),
    /// Protocol violation from the other side; terminates the connection.
    ConnectionNonsense(String),
    /// The operation's deadline elapsed. Expected for long polls.
    TimedOut,
    /// The operation was cancelled.
    Aborted,
    /// An error surfaced from the other side of the RPC.
    Remote { name: String, detail: String },
    /// Invariant violation; an implementation defect.
    Wtf(String),
}

impl ApiError {
    /// Stable wire name for the error taxonomy.
    pub fn wire_name(&self) -> &str {
        match self {
            ApiError::BadValue(_) => "badValue",
            ApiError::BadData(_) => "badData",
            ApiError::UnknownTarget(_) => "unknownTarget",
            ApiError::ConnectionClosed => "connectionClosed",
            ApiError::ConnectionClosing => "connectionClosing",
            ApiError::ConnectionError(_) => "connectionError",
            ApiError::ConnectionNonsense(_) => "connectionNonsense",
            ApiError::TimedOut => "timedOut",
            ApiError::Aborted => "aborted",
            ApiError::Remote { name, .. } => name,
            ApiError::Wtf(_) => "wtf",
        }
    }

    /// Whether this error is transparent to clients (retried without
    /// counting toward the error budget).
    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::TimedOut)
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo { name: self.wire_name().to_string(), detail: self.to_string() }
    }

    /// Client-side mapping of a wire error back into the taxonomy.
    /// `timedOut` round-trips so callers can retry it transparently;
    /// everything else is wrapped as a remote error.
    pub fn from_error_info(info: &ErrorInfo) -> Self {
        match info.name.as_str() {
            "timedOut" => ApiError::TimedOut,
            _ => ApiError::Remote { name: info.name.clone(), detail: info.detail.clone() },
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadValue(detail) => write!(f, "Bad value: {detail}"),
            ApiError::BadData(detail) => write!(f, "Bad data: {detail}"),
            ApiError::UnknownTarget(id) => write!(f, "Unknown target: {id}"),
            ApiError::ConnectionClosed => write!(f, "Connection closed"),
            ApiError::ConnectionClosing => write!(f, "Connection closing"),
            ApiError::ConnectionError(detail) => write!(f, "Connection error: {detail}"),
            ApiError::ConnectionNonsense(detail) => {
                write!(f, "Connection nonsense: {detail}")
            }
            ApiError::TimedOut => write!(f, "Timed out"),
            ApiError::Aborted => write!(f, "Aborted"),
            ApiError::Remote { name, detail } => write!(f, "Remote error {name}: {detail}"),
            ApiError::Wtf(detail) => write!(f, "Invariant violation: {detail}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<CodecError> for ApiError {
    fn from(e: CodecError) -> Self {
        ApiError::BadData(e.to_string())
    }
}
