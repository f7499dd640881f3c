//! Built-in admission policy
//!
//! Three rules, evaluated in order for every address not on an allow list:
//! - static IP / CIDR ban list
//! - user-agent bot detection with per-category allowances
//! - per-IP sliding-window rate limit
//!
//! In dry-run mode denials are logged and the request is admitted anyway.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{AdmissionRequest, AdmissionResult, Decision, DenyReason, Protect};

const SEARCH_ENGINE_AGENTS: &[&str] = &[
    "googlebot",
    "bingbot",
    "duckduckbot",
    "baiduspider",
    "yandexbot",
    "applebot",
    "slurp",
];

const PREVIEW_AGENTS: &[&str] = &[
    "slackbot",
    "twitterbot",
    "facebookexternalhit",
    "discordbot",
    "linkedinbot",
    "telegrambot",
    "whatsapp",
];

const AUTOMATED_AGENTS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "curl",
    "wget",
    "python-requests",
    "python-urllib",
    "go-http-client",
    "httpclient",
    "headless",
    "scrapy",
    "java/",
];

/// Whether denials are enforced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    #[default]
    Live,
    /// Log denials, admit anyway
    DryRun,
}

/// Bot families recognised by user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotCategory {
    SearchEngine,
    Preview,
    /// Scripts, HTTP libraries and anything else that looks automated
    Automated,
}

impl BotCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotCategory::SearchEngine => "search_engine",
            BotCategory::Preview => "preview",
            BotCategory::Automated => "automated",
        }
    }
}

/// Sliding-window rate limit
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlidingWindowConfig {
    /// Evaluations admitted per window and per IP, counting both stages
    pub max: u32,
    /// Window length (e.g., "2s")
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            max: 5,
            interval: Duration::from_secs(2),
        }
    }
}

/// Admission control configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Run the built-in policy; when off every connection is admitted
    pub enabled: bool,
    pub mode: EnforcementMode,
    /// Evaluate again once the WebSocket is established
    pub recheck_after_handshake: bool,
    pub window: SlidingWindowConfig,
    /// Static banned IP addresses
    pub banned_ips: Vec<IpAddr>,
    /// Static allowed IP addresses (bypass all rules)
    pub allowed_ips: Vec<IpAddr>,
    /// Banned CIDR ranges
    pub banned_cidrs: Vec<String>,
    /// Allowed CIDR ranges (bypass all rules)
    pub allowed_cidrs: Vec<String>,
    pub bot_detection: bool,
    /// Bot categories admitted despite detection
    pub allowed_bot_categories: Vec<BotCategory>,
    /// Additional user-agent regexes classed as automated
    pub extra_bot_patterns: Vec<String>,
    /// How often idle window state is dropped (e.g., "1m")
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: EnforcementMode::Live,
            recheck_after_handshake: true,
            window: SlidingWindowConfig::default(),
            banned_ips: vec![],
            allowed_ips: vec![],
            banned_cidrs: vec![],
            allowed_cidrs: vec![],
            bot_detection: true,
            allowed_bot_categories: vec![BotCategory::SearchEngine, BotCategory::Preview],
            extra_bot_patterns: vec![],
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Policy construction error
#[derive(Debug)]
pub enum PolicyError {
    InvalidCidr(String),
    InvalidPattern(regex::Error),
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::InvalidCidr(s) => write!(f, "Invalid CIDR: {}", s),
            PolicyError::InvalidPattern(e) => write!(f, "Invalid bot pattern: {}", e),
        }
    }
}

impl std::error::Error for PolicyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PolicyError::InvalidPattern(e) => Some(e),
            PolicyError::InvalidCidr(_) => None,
        }
    }
}

fn parse_cidrs(cidrs: &[String]) -> Result<Vec<IpNet>, PolicyError> {
    cidrs
        .iter()
        .map(|s| s.parse().map_err(|_| PolicyError::InvalidCidr(s.clone())))
        .collect()
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, PolicyError> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(PolicyError::InvalidPattern)
        })
        .collect()
}

impl AdmissionConfig {
    /// Check that every CIDR parses and every bot pattern compiles
    pub fn check(&self) -> Result<(), PolicyError> {
        parse_cidrs(&self.banned_cidrs)?;
        parse_cidrs(&self.allowed_cidrs)?;
        compile_patterns(&self.extra_bot_patterns)?;
        Ok(())
    }
}

/// Rate limiter, bot filter and IP shield
pub struct RateLimitPolicy {
    mode: EnforcementMode,
    window_max: usize,
    window: Duration,
    banned_ips: Vec<IpAddr>,
    allowed_ips: Vec<IpAddr>,
    banned_cidrs: Vec<IpNet>,
    allowed_cidrs: Vec<IpNet>,
    bot_detection: bool,
    allowed_bots: Vec<BotCategory>,
    extra_bot_patterns: Vec<Regex>,
    cleanup_interval: Duration,
    /// Admission timestamps per IP, oldest first
    windows: DashMap<IpAddr, VecDeque<Instant>>,
}

impl RateLimitPolicy {
    pub fn new(config: &AdmissionConfig) -> Result<Self, PolicyError> {
        let banned_cidrs = parse_cidrs(&config.banned_cidrs)?;
        let allowed_cidrs = parse_cidrs(&config.allowed_cidrs)?;
        let extra_bot_patterns = compile_patterns(&config.extra_bot_patterns)?;

        info!(
            "Admission policy initialized: mode={:?}, window={}/{:?}, bot_detection={}, \
             banned_ips={}, allowed_ips={}, banned_cidrs={}, allowed_cidrs={}",
            config.mode,
            config.window.max,
            config.window.interval,
            config.bot_detection,
            config.banned_ips.len(),
            config.allowed_ips.len(),
            banned_cidrs.len(),
            allowed_cidrs.len(),
        );

        Ok(Self {
            mode: config.mode,
            window_max: config.window.max as usize,
            window: config.window.interval,
            banned_ips: config.banned_ips.clone(),
            allowed_ips: config.allowed_ips.clone(),
            banned_cidrs,
            allowed_cidrs,
            bot_detection: config.bot_detection,
            allowed_bots: config.allowed_bot_categories.clone(),
            extra_bot_patterns,
            cleanup_interval: config.cleanup_interval,
            windows: DashMap::new(),
        })
    }

    fn is_allowed(&self, ip: IpAddr) -> bool {
        self.allowed_ips.contains(&ip) || self.allowed_cidrs.iter().any(|c| c.contains(&ip))
    }

    fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned_ips.contains(&ip) || self.banned_cidrs.iter().any(|c| c.contains(&ip))
    }

    /// Classify a user agent. `None` means it looks like a person.
    ///
    /// A missing or empty user agent is treated as automated.
    pub fn classify_user_agent(&self, user_agent: Option<&str>) -> Option<BotCategory> {
        let ua = match user_agent.map(str::trim) {
            Some(ua) if !ua.is_empty() => ua.to_ascii_lowercase(),
            _ => return Some(BotCategory::Automated),
        };

        // Named crawlers first; most of them also contain "bot"
        if SEARCH_ENGINE_AGENTS.iter().any(|p| ua.contains(p)) {
            return Some(BotCategory::SearchEngine);
        }
        if PREVIEW_AGENTS.iter().any(|p| ua.contains(p)) {
            return Some(BotCategory::Preview);
        }
        if AUTOMATED_AGENTS.iter().any(|p| ua.contains(p))
            || self.extra_bot_patterns.iter().any(|r| r.is_match(&ua))
        {
            return Some(BotCategory::Automated);
        }
        None
    }

    /// Record one evaluation against the IP's window.
    /// Returns false when the window is exhausted.
    ///
    /// Both stages take a slot, so a re-checked connection costs two and a
    /// burst of upgrades from one address between a handshake and its
    /// re-check denies the re-check.
    fn check_window(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(ip).or_default();
        let window = entry.value_mut();

        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.window_max {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Evaluate all rules, ignoring the enforcement mode
    pub fn evaluate(&self, request: &AdmissionRequest) -> Decision {
        let ip = request.peer.ip();

        if self.is_allowed(ip) {
            return Decision::Allow;
        }

        if self.is_banned(ip) {
            debug!("{} matched ban list", ip);
            return Decision::Deny(DenyReason::Other("shield"));
        }

        if self.bot_detection {
            if let Some(category) = self.classify_user_agent(request.user_agent.as_deref()) {
                if !self.allowed_bots.contains(&category) {
                    debug!("{} identified as {} bot", ip, category.as_str());
                    return Decision::Deny(DenyReason::Other("bot"));
                }
            }
        }

        if !self.check_window(ip) {
            debug!(
                "{} exceeded {} per {:?} at {} stage",
                ip,
                self.window_max,
                self.window,
                request.stage.as_str()
            );
            return Decision::Deny(DenyReason::RateLimited);
        }

        Decision::Allow
    }

    /// Drop window state for IPs with no admission inside the window
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.windows.retain(|ip, window| {
            let is_stale = window
                .back()
                .map_or(true, |&last| now.duration_since(last) >= self.window);
            if is_stale {
                debug!("Cleaning up window state for {}", ip);
            }
            !is_stale
        });
    }

    /// Number of IPs with window state
    pub fn tracked_ips(&self) -> usize {
        self.windows.len()
    }

    /// Run [`cleanup`](Self::cleanup) every cleanup interval until `shutdown` fires
    pub fn spawn_cleanup(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.cleanup_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    result = shutdown.recv() => {
                        if !matches!(result, Err(broadcast::error::RecvError::Lagged(_))) {
                            break;
                        }
                    }
                    _ = ticker.tick() => self.cleanup(),
                }
            }
        })
    }
}

#[async_trait]
impl Protect for RateLimitPolicy {
    async fn protect(&self, request: &AdmissionRequest) -> AdmissionResult {
        let decision = self.evaluate(request);
        if decision.is_denied() && self.mode == EnforcementMode::DryRun {
            warn!(
                "Dry run: would deny {} at {} stage ({:?})",
                request.peer,
                request.stage.as_str(),
                decision
            );
            return Ok(Decision::Allow);
        }
        Ok(decision)
    }
}
