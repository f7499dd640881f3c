//! Wire protocol
//!
//! Every frame exchanged over the WebSocket is a JSON object carrying a
//! `type` discriminator. Clients send `subscribe` / `unsubscribe` control
//! messages; the server pushes acknowledgements, errors and event
//! broadcasts.
//!
//! Inbound parsing never raises: it returns either a [`ClientMessage`] or a
//! classified [`MalformedMessage`] that the caller reports back to the peer.

mod error;

pub use error::MalformedMessage;

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Commentary, Match};

/// Longest `type` value echoed back in an error reply
const MAX_ECHOED_TYPE_LEN: usize = 64;

/// Match identifier, the key of a broadcast topic.
///
/// Always a positive integer; zero and negative values are rejected at
/// parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct MatchId(NonZeroU64);

impl MatchId {
    /// Create a match id, returning `None` for zero
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl TryFrom<u64> for MatchId {
    type Error = MalformedMessage;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(MalformedMessage::InvalidMatchId)
    }
}

impl From<MatchId> for u64 {
    fn from(id: MatchId) -> Self {
        id.get()
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control message sent by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    Subscribe(MatchId),
    Unsubscribe(MatchId),
}

/// Parse an inbound payload.
///
/// Accepts `{"type":"subscribe","matchId":N}` and
/// `{"type":"unsubscribe","matchId":N}` where `N` is a positive integer.
/// Unknown fields are ignored.
pub fn parse_client_message(payload: &[u8]) -> Result<ClientMessage, MalformedMessage> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|_| MalformedMessage::InvalidJson)?;
    let object = value.as_object().ok_or(MalformedMessage::NotAnObject)?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(MalformedMessage::MissingType)?;

    let match_id = || {
        object
            .get("matchId")
            .and_then(Value::as_u64)
            .and_then(MatchId::new)
            .ok_or(MalformedMessage::InvalidMatchId)
    };

    match kind {
        "subscribe" => Ok(ClientMessage::Subscribe(match_id()?)),
        "unsubscribe" => Ok(ClientMessage::Unsubscribe(match_id()?)),
        other => Err(MalformedMessage::UnknownType(
            other.chars().take(MAX_ECHOED_TYPE_LEN).collect(),
        )),
    }
}

/// Message pushed by the server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    /// Sent to a connection right after it is admitted
    Welcome,
    Subscribed {
        #[serde(rename = "matchId")]
        match_id: MatchId,
    },
    Unsubscribed {
        #[serde(rename = "matchId")]
        match_id: MatchId,
    },
    Error {
        error: String,
    },
    /// Global broadcast: a match was created
    MatchCreated {
        data: &'a Match,
    },
    /// Topic broadcast: a commentary line was appended to a match
    Commentary {
        data: &'a Commentary,
    },
}

impl ServerMessage<'_> {
    /// Serialize once so the same text can be shared across a fan-out
    pub fn encode(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }

    /// Label used for logging and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::Error { .. } => "error",
            Self::MatchCreated { .. } => "match_created",
            Self::Commentary { .. } => "commentary",
        }
    }
}

/// Reason the server closes an established WebSocket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Admission re-check after the handshake found the peer rate limited
    RateLimited,
    /// Admission re-check denied the peer for any other reason
    AccessDenied,
    /// Setup failed after the handshake (including an unavailable admission engine)
    InternalError,
    /// Server is shutting down
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code (RFC 6455 section 7.4)
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::RateLimited => 1013,
            CloseReason::AccessDenied => 1008,
            CloseReason::InternalError => 1011,
            CloseReason::Shutdown => 1001,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::RateLimited => "Rate limit exceeded",
            CloseReason::AccessDenied => "Access denied",
            CloseReason::InternalError => "Server security error",
            CloseReason::Shutdown => "Server shutting down",
        }
    }
}
