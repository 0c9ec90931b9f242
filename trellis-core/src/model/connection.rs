use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identifies one point-to-point session between two peers.
#[derive(Debug, Clone, Serialize, Deserialize, Hash, Eq, PartialEq)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a fresh id with the kind-specific prefix.
    pub fn generate(kind: ConnectionType) -> Self {
        Self(format!("{}_{}", kind.prefix(), Uuid::new_v4()))
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Data,
    Media,
}

impl ConnectionType {
    fn prefix(self) -> &'static str {
        match self {
            Self::Data => "dc",
            Self::Media => "mc",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Media => "media",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload encoding for a data connection, fixed at creation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Serialization {
    #[default]
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "binary-utf8")]
    BinaryUtf8,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "none")]
    None,
}

impl Serialization {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::BinaryUtf8 => "binary-utf8",
            Self::Json => "json",
            Self::None => "none",
        }
    }

    /// Whether payloads in this mode go through the chunk codec.
    pub fn is_chunked(self) -> bool {
        matches!(self, Self::Binary | Self::BinaryUtf8)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid serialization mode: {0}")]
pub struct InvalidSerialization(pub String);

impl FromStr for Serialization {
    type Err = InvalidSerialization;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(Self::Binary),
            "binary-utf8" => Ok(Self::BinaryUtf8),
            "json" => Ok(Self::Json),
            "none" => Ok(Self::None),
            other => Err(InvalidSerialization(other.to_string())),
        }
    }
}

impl fmt::Display for Serialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
