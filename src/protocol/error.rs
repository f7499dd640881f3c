//! Protocol error types

use std::fmt;

/// Classified outcome of an inbound payload that could not be turned into a
/// [`ClientMessage`](super::ClientMessage).
///
/// These are always recovered locally: the originating connection gets an
/// `error` reply and stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedMessage {
    /// Payload is not valid UTF-8 JSON
    InvalidJson,
    /// Payload is JSON but not a JSON object
    NotAnObject,
    /// Object has no string `type` field
    MissingType,
    /// `type` names a message the server does not accept
    UnknownType(String),
    /// `matchId` is missing, not an integer, or not positive
    InvalidMatchId,
}

impl fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "Invalid JSON"),
            Self::NotAnObject => write!(f, "Message must be a JSON object"),
            Self::MissingType => write!(f, "Missing message type"),
            Self::UnknownType(t) => write!(f, "Unknown message type: {}", t),
            Self::InvalidMatchId => write!(f, "Invalid matchId: expected a positive integer"),
        }
    }
}

impl std::error::Error for MalformedMessage {}
