use crate::engine::EngineError;
use crate::signaling::SignalingError;
use std::fmt;
use thiserror::Error;

/// Error taxonomy. Protocol errors are logged and dropped before they
/// become an `Error`; everything that reaches a caller or an event stream
/// carries one of these discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No signaling session is established.
    Disconnected,
    /// The engine rejected a create/apply-description call.
    Negotiation,
    /// Malformed or unroutable signaling traffic.
    Protocol,
    /// A precondition of the violating call did not hold.
    Validation,
    /// The signaling transport itself failed.
    Transport,
    Room,
    Data,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Negotiation => "negotiation",
            Self::Protocol => "protocol",
            Self::Validation => "validation",
            Self::Transport => "transport",
            Self::Room => "room",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn negotiation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Negotiation, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, message)
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        Self::negotiation(err.to_string())
    }
}

impl From<SignalingError> for Error {
    fn from(err: SignalingError) -> Self {
        Self::new(ErrorKind::Transport, err.to_string())
    }
}
