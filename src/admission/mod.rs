//! Admission Control
//!
//! Every connection is checked twice: once against the raw HTTP upgrade
//! request, before any WebSocket exists, and (optionally) once more right
//! after the handshake completes. The decision itself comes from a
//! [`Protect`] engine; the [`AdmissionGate`] only turns its verdict into a
//! [`Rejection`] that the server expresses as an HTTP status or a close
//! frame.
//!
//! The gate fails closed: an engine error rejects the connection.

mod policy;

pub use policy::{
    AdmissionConfig, BotCategory, EnforcementMode, PolicyError, RateLimitPolicy,
    SlidingWindowConfig,
};

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::StatusCode;
use tracing::{debug, error, warn};

use crate::protocol::CloseReason;

#[cfg(test)]
mod tests;

/// Point in the connection lifecycle at which admission is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// HTTP upgrade request, no WebSocket yet
    Upgrade,
    /// WebSocket established, connection not yet registered
    Established,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Upgrade => "upgrade",
            Stage::Established => "established",
        }
    }
}

/// What the engine gets to see about a connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub peer: SocketAddr,
    pub path: String,
    pub user_agent: Option<String>,
    pub stage: Stage,
}

impl AdmissionRequest {
    pub fn new(peer: SocketAddr, path: impl Into<String>) -> Self {
        Self {
            peer,
            path: path.into(),
            user_agent: None,
            stage: Stage::Upgrade,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Same request, evaluated at a different stage
    pub fn at_stage(&self, stage: Stage) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }
}

/// Why the engine denied a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    RateLimited,
    /// Any other rule; the label names the rule for logs and metrics
    Other(&'static str),
}

/// Engine verdict, consumed once per admission point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Deny(_))
    }
}

/// The engine could not reach a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    Unavailable(String),
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::Unavailable(msg) => write!(f, "Admission engine unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AdmissionError {}

pub type AdmissionResult = Result<Decision, AdmissionError>;

/// Admission decision engine
///
/// Implement this trait to plug in a rate limiter or abuse detector.
#[async_trait]
pub trait Protect: Send + Sync {
    /// Decide whether the connection attempt may proceed
    ///
    /// # Returns
    /// * `Ok(Decision::Allow)` - Connection may proceed
    /// * `Ok(Decision::Deny(_))` - Connection is rejected
    /// * `Err(_)` - Engine failure; the gate rejects the connection
    async fn protect(&self, request: &AdmissionRequest) -> AdmissionResult;
}

/// Engine that admits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Protect for AllowAll {
    async fn protect(&self, _request: &AdmissionRequest) -> AdmissionResult {
        Ok(Decision::Allow)
    }
}

#[async_trait]
impl<T: Protect + ?Sized> Protect for Arc<T> {
    async fn protect(&self, request: &AdmissionRequest) -> AdmissionResult {
        (**self).protect(request).await
    }
}

/// Outcome of a failed admission check, mapped onto the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    RateLimited,
    Denied,
    /// Engine failure, fail closed
    Unavailable,
}

impl Rejection {
    /// Status written in place of `101 Switching Protocols`
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Rejection::Denied => StatusCode::UNAUTHORIZED,
            Rejection::Unavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Close frame used once the WebSocket already exists
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Rejection::RateLimited => CloseReason::RateLimited,
            Rejection::Denied => CloseReason::AccessDenied,
            Rejection::Unavailable => CloseReason::InternalError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::RateLimited => "rate_limited",
            Rejection::Denied => "denied",
            Rejection::Unavailable => "unavailable",
        }
    }
}

/// Runs the engine at each admission point
pub struct AdmissionGate {
    engine: Arc<dyn Protect>,
    recheck_after_handshake: bool,
}

impl AdmissionGate {
    pub fn new(engine: Arc<dyn Protect>, recheck_after_handshake: bool) -> Self {
        Self {
            engine,
            recheck_after_handshake,
        }
    }

    pub fn allow_all() -> Self {
        Self::new(Arc::new(AllowAll), false)
    }

    /// Whether the established stage is evaluated at all
    pub fn rechecks_after_handshake(&self) -> bool {
        self.recheck_after_handshake
    }

    /// Evaluate `request` at its stage.
    ///
    /// The established stage passes without consulting the engine when
    /// re-checking is disabled.
    pub async fn evaluate(&self, request: &AdmissionRequest) -> Result<(), Rejection> {
        if request.stage == Stage::Established && !self.recheck_after_handshake {
            return Ok(());
        }

        match self.engine.protect(request).await {
            Ok(Decision::Allow) => {
                debug!(
                    "Admitted {} at {} stage",
                    request.peer,
                    request.stage.as_str()
                );
                Ok(())
            }
            Ok(Decision::Deny(DenyReason::RateLimited)) => {
                warn!(
                    "Rejected {} at {} stage: rate limited",
                    request.peer,
                    request.stage.as_str()
                );
                Err(Rejection::RateLimited)
            }
            Ok(Decision::Deny(DenyReason::Other(rule))) => {
                warn!(
                    "Rejected {} at {} stage: denied by {}",
                    request.peer,
                    request.stage.as_str(),
                    rule
                );
                Err(Rejection::Denied)
            }
            Err(e) => {
                error!(
                    "Rejected {} at {} stage: {}",
                    request.peer,
                    request.stage.as_str(),
                    e
                );
                Err(Rejection::Unavailable)
            }
        }
    }
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("recheck_after_handshake", &self.recheck_after_handshake)
            .finish()
    }
}
