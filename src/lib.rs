//! Matchfeed - real-time match and commentary broadcasts over WebSocket
//!
//! Clients connect over WebSocket, subscribe to individual matches and
//! receive `match_created` events globally and `commentary` events for the
//! matches they follow. The [`hub::Hub`] is the publishing entry point.

pub mod admission;
pub mod config;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod protocol;
pub mod server;

pub use admission::{AdmissionGate, AllowAll, Protect, RateLimitPolicy};
pub use config::Config;
pub use hub::Hub;
pub use metrics::{Metrics, MetricsServer};
pub use model::{Commentary, Match, MatchStatus};
pub use protocol::{CloseReason, MatchId, ServerMessage};
pub use server::{Server, ServerConfig};
