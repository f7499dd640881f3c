//! Broadcast payloads
//!
//! The persistence layer owns these records; the broadcast core only
//! serializes them into `match_created` and `commentary` events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::MatchId;

/// Lifecycle state of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    #[default]
    Scheduled,
    Live,
    Finished,
}

impl MatchStatus {
    /// Derive the status from a match's time window.
    ///
    /// Returns `None` when either bound is unknown. The window is inclusive
    /// on both ends.
    pub fn at(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let (start, end) = (start?, end?);
        if now < start {
            Some(MatchStatus::Scheduled)
        } else if now <= end {
            Some(MatchStatus::Live)
        } else {
            Some(MatchStatus::Finished)
        }
    }
}

/// A match record as returned by the persistence layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: MatchId,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub status: MatchStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub home_score: u32,
    #[serde(default)]
    pub away_score: u32,
    pub created_at: DateTime<Utc>,
}

impl Match {
    /// Status implied by the time window, falling back to the stored one
    pub fn status_at(&self, now: DateTime<Utc>) -> MatchStatus {
        MatchStatus::at(self.start_time, self.end_time, now).unwrap_or(self.status)
    }
}

/// A commentary line attached to a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commentary {
    pub id: u64,
    pub match_id: MatchId,
    pub minute: Option<u32>,
    pub sequence: Option<i32>,
    pub period: Option<String>,
    pub event_type: Option<String>,
    pub actor: Option<String>,
    pub team: Option<String>,
    pub message: String,
    pub metadata: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}
