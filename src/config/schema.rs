//! Configuration schema definitions.
//!
//! One `ProfileConfig` per proxy instance. The login profile defaults are
//! stricter than the game profile's: the login service sees the brunt of
//! credential-stuffing floods, while game sessions are long-lived and
//! reconnect rarely.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which proxy profile a binary instance runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Profile {
    /// Public login service: aggressive limits, drain under overload.
    Login,
    /// Game service: softer limits, never drains.
    Game,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Login => "login",
            Profile::Game => "game",
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one proxy profile.
///
/// All numeric fields treat zero as "use the profile default" (see
/// [`ProfileConfig::merged_with`]); string fields treat empty the same
/// way, except `log_file` where empty means stderr.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Public address to accept player connections on (host:port).
    pub listen_addr: String,

    /// Fixed backend to forward accepted connections to (host:port).
    pub backend_addr: String,

    /// Maximum concurrently forwarded connections per source IP.
    pub max_live_conns_per_ip: u32,

    /// Token bucket refill rate, attempts per second.
    pub attempt_refill_per_sec: f64,

    /// Token bucket capacity (burst of attempts before rate kicks in).
    pub attempt_burst: f64,

    /// Consecutive rate denies before a peer is tempblocked.
    pub denies_before_tempblock: u32,

    /// Base tempblock duration; doubles per prior tempblock, capped at 24 h.
    pub tempblock_seconds: u64,

    /// Global admission budget across all peers.
    pub max_total_conns: usize,

    /// Per-operation I/O deadline on forwarded pairs. Bounds in-flight
    /// reads/writes only; idle players are kept by TCP keep-alive.
    pub idle_timeout_seconds: u64,

    /// Timeout for dialing the backend.
    pub backend_dial_timeout_seconds: u64,

    /// Idle peers older than this are eligible for eviction.
    pub stale_after_seconds: u64,

    /// Interval between limiter GC passes.
    pub cleanup_every_seconds: u64,

    /// Escalate tempblocked peers to OS firewall bans.
    pub enable_firewall_autoban: Option<bool>,

    /// How long an OS firewall ban lasts before scheduled removal.
    pub firewall_block_seconds: u64,

    /// debug | info | warn | error.
    pub log_level: String,

    /// Log file path; empty = stderr (or an adjacent file when there is
    /// no console).
    pub log_file: String,

    /// Optional Prometheus exporter binding; empty = disabled.
    pub metrics_listen_addr: String,

    /// Optional HTTP admin binding, consumed by the external admin API.
    pub admin_listen_addr: String,

    /// Extra IPs allowed to reach the admin API (beyond loopback).
    pub admin_allow_ips: Vec<String>,

    /// Bearer token required for non-loopback admin access.
    pub admin_token: String,

    /// Reserved upper bound for login drain episodes; 0 = unlimited.
    pub max_drain_seconds: u64,
}

impl ProfileConfig {
    /// Defaults for the login profile (aggressive).
    pub fn login_defaults() -> Self {
        Self {
            listen_addr: "0.0.0.0:7666".to_string(),
            backend_addr: "127.0.0.1:7668".to_string(),
            max_live_conns_per_ip: 2,
            attempt_refill_per_sec: 1.0,
            attempt_burst: 4.0,
            denies_before_tempblock: 10,
            tempblock_seconds: 90,
            max_total_conns: 2000,
            idle_timeout_seconds: 15,
            backend_dial_timeout_seconds: 5,
            stale_after_seconds: 180,
            cleanup_every_seconds: 30,
            enable_firewall_autoban: Some(true),
            firewall_block_seconds: 900,
            log_level: "info".to_string(),
            log_file: String::new(),
            metrics_listen_addr: String::new(),
            admin_listen_addr: "127.0.0.1:7771".to_string(),
            admin_allow_ips: Vec::new(),
            admin_token: String::new(),
            max_drain_seconds: 60,
        }
    }

    /// Defaults for the game profile (softer).
    pub fn game_defaults() -> Self {
        Self {
            listen_addr: "0.0.0.0:7667".to_string(),
            backend_addr: "127.0.0.1:7669".to_string(),
            max_live_conns_per_ip: 3,
            attempt_refill_per_sec: 2.0,
            attempt_burst: 6.0,
            denies_before_tempblock: 15,
            tempblock_seconds: 60,
            max_total_conns: 4000,
            idle_timeout_seconds: 30,
            backend_dial_timeout_seconds: 10,
            stale_after_seconds: 180,
            cleanup_every_seconds: 30,
            enable_firewall_autoban: Some(true),
            firewall_block_seconds: 600,
            log_level: "info".to_string(),
            log_file: String::new(),
            metrics_listen_addr: String::new(),
            admin_listen_addr: "127.0.0.1:7772".to_string(),
            admin_allow_ips: Vec::new(),
            admin_token: String::new(),
            max_drain_seconds: 0,
        }
    }

    pub fn defaults_for(profile: Profile) -> Self {
        match profile {
            Profile::Login => Self::login_defaults(),
            Profile::Game => Self::game_defaults(),
        }
    }

    /// Fill unset (zero/empty) fields from `defaults`.
    ///
    /// `max_drain_seconds` is only defaulted when the profile default is
    /// non-zero: zero is a valid "unlimited" setting for the game profile.
    /// `log_file`, `metrics_listen_addr`, `admin_allow_ips` and
    /// `admin_token` have meaningful empty values and are never defaulted.
    pub fn merged_with(mut self, defaults: ProfileConfig) -> ProfileConfig {
        if self.listen_addr.is_empty() {
            self.listen_addr = defaults.listen_addr;
        }
        if self.backend_addr.is_empty() {
            self.backend_addr = defaults.backend_addr;
        }
        if self.max_live_conns_per_ip == 0 {
            self.max_live_conns_per_ip = defaults.max_live_conns_per_ip;
        }
        if self.attempt_refill_per_sec == 0.0 {
            self.attempt_refill_per_sec = defaults.attempt_refill_per_sec;
        }
        if self.attempt_burst == 0.0 {
            self.attempt_burst = defaults.attempt_burst;
        }
        if self.denies_before_tempblock == 0 {
            self.denies_before_tempblock = defaults.denies_before_tempblock;
        }
        if self.tempblock_seconds == 0 {
            self.tempblock_seconds = defaults.tempblock_seconds;
        }
        if self.max_total_conns == 0 {
            self.max_total_conns = defaults.max_total_conns;
        }
        if self.idle_timeout_seconds == 0 {
            self.idle_timeout_seconds = defaults.idle_timeout_seconds;
        }
        if self.backend_dial_timeout_seconds == 0 {
            self.backend_dial_timeout_seconds = defaults.backend_dial_timeout_seconds;
        }
        if self.stale_after_seconds == 0 {
            self.stale_after_seconds = defaults.stale_after_seconds;
        }
        if self.cleanup_every_seconds == 0 {
            self.cleanup_every_seconds = defaults.cleanup_every_seconds;
        }
        if self.enable_firewall_autoban.is_none() {
            self.enable_firewall_autoban = defaults.enable_firewall_autoban;
        }
        if self.firewall_block_seconds == 0 {
            self.firewall_block_seconds = defaults.firewall_block_seconds;
        }
        if self.log_level.is_empty() {
            self.log_level = defaults.log_level;
        }
        if self.admin_listen_addr.is_empty() {
            self.admin_listen_addr = defaults.admin_listen_addr;
        }
        if self.max_drain_seconds == 0 && defaults.max_drain_seconds != 0 {
            self.max_drain_seconds = defaults.max_drain_seconds;
        }
        self
    }

    pub fn autoban_enabled(&self) -> bool {
        self.enable_firewall_autoban.unwrap_or(true)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn backend_dial_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_dial_timeout_seconds)
    }

    pub fn tempblock(&self) -> Duration {
        Duration::from_secs(self.tempblock_seconds)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }

    pub fn cleanup_every(&self) -> Duration {
        Duration::from_secs(self.cleanup_every_seconds)
    }

    pub fn firewall_block(&self) -> Duration {
        Duration::from_secs(self.firewall_block_seconds)
    }
}

/// Sectioned config file carrying both profiles.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MultiProfileConfig {
    pub login: ProfileConfig,
    pub game: ProfileConfig,
}
