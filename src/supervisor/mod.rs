//! Supervisor: wires the limiter, forwarder, overload controller and
//! firewall manager together.
//!
//! # Responsibilities
//! - Build the subsystems for one profile and own their lifetimes
//! - Implement [`AdmissionPolicy`]: classify rejects, feed deny counts,
//!   escalate tempblocks into firewall bans
//! - Publish metrics (10 s) and a heartbeat (30 s)
//! - Maintain the event ring and per-IP log throttle
//! - Orchestrate shutdown, bounding the firewall teardown

pub mod events;
pub mod throttle;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Profile, ProfileConfig};
use crate::firewall::FirewallManager;
use crate::lifecycle::Shutdown;
use crate::limiter::{Limiter, LimiterSettings, RejectReason};
use crate::overload::OverloadController;
use crate::proxy::{AdmissionPolicy, Forwarder, ForwarderError};

use events::{EventKind, EventLog};
use throttle::IpLogThrottle;

const METRICS_EVERY: Duration = Duration::from_secs(10);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(30);
const LOG_THROTTLE_WINDOW: Duration = Duration::from_secs(2);

/// Upper bound on waiting for firewall workers at shutdown.
const FIREWALL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Monotonic reject counter plus the last observed 10 s window rate.
pub struct RejectStats {
    total: AtomicU64,
    last_snapshot: AtomicU64,
    rate_bits: AtomicU64,
}

impl RejectStats {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            last_snapshot: AtomicU64::new(0),
            rate_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn increment(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Fold the delta since the last observation into the window rate.
    /// Called once per metrics tick so there is a single delta computer.
    pub fn observe_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        let prev = self.last_snapshot.swap(total, Ordering::Relaxed);
        let rate = total.saturating_sub(prev) as f64;
        self.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
        rate
    }

    /// Rejects in the last observed 10 s window.
    pub fn rate_per_10s(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }
}

impl Default for RejectStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for a supervisor run.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Forwarder(#[from] ForwarderError),
    /// The forwarder returned although no shutdown was requested.
    #[error("forwarder terminated unexpectedly")]
    UnexpectedExit,
}

/// Owns one profile's subsystems and runs them to completion.
pub struct Supervisor {
    cfg: ProfileConfig,
    profile: Profile,
    limiter: Arc<Limiter>,
    firewall: Option<Arc<FirewallManager>>,
    overload: Option<Arc<OverloadController>>,
    rejects: Arc<RejectStats>,
    log_throttle: IpLogThrottle,
    events: Arc<EventLog>,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(cfg: ProfileConfig, profile: Profile) -> Arc<Self> {
        let limiter = Arc::new(Limiter::new(LimiterSettings::from(&cfg)));
        let rejects = Arc::new(RejectStats::new());
        let events = Arc::new(EventLog::new());

        let firewall = cfg
            .autoban_enabled()
            .then(|| FirewallManager::new(cfg.firewall_block()));

        // Only the login profile drains; the game profile rides out load.
        let overload = (profile == Profile::Login).then(|| {
            Arc::new(OverloadController::new(
                Arc::clone(&limiter),
                Arc::clone(&rejects),
                Arc::clone(&events),
                cfg.max_total_conns,
            ))
        });

        Arc::new(Self {
            cfg,
            profile,
            limiter,
            firewall,
            overload,
            rejects,
            log_throttle: IpLogThrottle::new(LOG_THROTTLE_WINDOW),
            events,
            shutdown: Shutdown::new(),
        })
    }

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    pub fn firewall(&self) -> Option<&Arc<FirewallManager>> {
        self.firewall.as_ref()
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn rejects(&self) -> &Arc<RejectStats> {
        &self.rejects
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Manually clear a peer's tempblock and any firewall ban.
    pub fn unblock_ip(&self, ip: IpAddr) {
        self.limiter.unblock_temp_ip(ip);
        if let Some(fw) = &self.firewall {
            fw.unblock_ip(ip);
        }
        self.events.push(EventKind::Unblock, Some(ip), "manual");
        tracing::info!(client = %ip, "manual unblock");
    }

    /// Manually clear every tempblock; returns how many were cleared.
    pub fn unblock_all(&self) -> usize {
        let cleared = self.limiter.unblock_all();
        self.events
            .push(EventKind::UnblockAll, None, format!("cleared={cleared}"));
        tracing::info!(cleared, "manual unblock of all tempblocks");
        cleared
    }

    /// Run the proxy until shutdown. Blocks; returns `Ok(())` after a
    /// requested stop, an error for bind failures or an unexpected
    /// forwarder exit.
    pub async fn run(self: Arc<Self>) -> Result<(), SupervisorError> {
        tracing::info!(
            profile = %self.profile,
            listen_addr = %self.cfg.listen_addr,
            backend_addr = %self.cfg.backend_addr,
            "supervisor starting"
        );

        let mut background = Vec::new();
        background.push(Arc::clone(&self.limiter).spawn_gc(self.shutdown.subscribe()));
        if let Some(fw) = &self.firewall {
            background.push(Arc::clone(fw).spawn_scheduler(self.shutdown.subscribe()));
        }
        if let Some(ov) = &self.overload {
            background.extend(
                Arc::clone(ov).spawn_samplers(self.shutdown.subscribe(), self.shutdown.subscribe()),
            );
        }
        background.push(Arc::clone(&self).spawn_metrics());
        background.push(Arc::clone(&self).spawn_heartbeat());

        let forwarder = Forwarder::new(
            self.cfg.listen_addr.clone(),
            self.cfg.backend_addr.clone(),
            (self.cfg.idle_timeout_seconds > 0).then(|| self.cfg.idle_timeout()),
            self.cfg.backend_dial_timeout(),
        );
        let policy_concrete: Arc<Supervisor> = Arc::clone(&self);
        let policy: Arc<dyn AdmissionPolicy> = policy_concrete;
        let result = forwarder.run(policy, self.shutdown.subscribe()).await;

        let outcome = match result {
            Err(e) => Err(SupervisorError::from(e)),
            Ok(()) if self.shutdown.is_triggered() => Ok(()),
            Ok(()) => Err(SupervisorError::UnexpectedExit),
        };

        // Tear down in reverse: background loops first, firewall last,
        // with its worker wait bounded.
        self.shutdown.trigger();
        for task in background {
            let _ = task.await;
        }
        if let Some(fw) = &self.firewall {
            if tokio::time::timeout(FIREWALL_STOP_TIMEOUT, fw.stop())
                .await
                .is_err()
            {
                tracing::warn!("timed out waiting for firewall workers to stop");
            }
        }

        if outcome.is_ok() {
            tracing::info!(profile = %self.profile, "supervisor stopped");
        }
        outcome
    }

    fn spawn_metrics(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval_at(tokio::time::Instant::now() + METRICS_EVERY, METRICS_EVERY);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tick.tick() => {
                        let (active, ips) = self.limiter.stats();
                        let rate = self.rejects.observe_rate();
                        metrics::gauge!("gateguard_active_connections").set(active as f64);
                        metrics::gauge!("gateguard_tracked_ips").set(ips as f64);
                        metrics::gauge!("gateguard_rejects_per_10s").set(rate);
                        tracing::info!(
                            active_conns = active,
                            ips_in_memory = ips,
                            rejects_per_10s = rate,
                            semaphore_used = %format!("{active}/{}", self.cfg.max_total_conns),
                            "metrics"
                        );
                    }
                }
            }
        })
    }

    fn spawn_heartbeat(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(
                tokio::time::Instant::now() + HEARTBEAT_EVERY,
                HEARTBEAT_EVERY,
            );
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tick.tick() => {
                        tracing::debug!(profile = %self.profile, "heartbeat, supervisor alive");
                    }
                }
            }
        })
    }
}

impl AdmissionPolicy for Supervisor {
    fn try_accept(&self, ip: IpAddr) -> Result<(), RejectReason> {
        self.limiter.try_accept(ip, Instant::now())
    }

    fn on_accept(&self, ip: IpAddr) {
        metrics::counter!("gateguard_accepts_total").increment(1);
        if self.log_throttle.allow(ip) {
            tracing::info!(client = %ip, "accept allowed");
        }
    }

    fn on_reject(&self, ip: IpAddr, reason: RejectReason) {
        self.rejects.increment();
        metrics::counter!("gateguard_rejects_total", "reason" => reason.as_str()).increment(1);

        match reason {
            RejectReason::Rate => {
                self.limiter.record_deny(ip);
                if self.log_throttle.allow(ip) {
                    tracing::warn!(client = %ip, "reject rate");
                }
            }
            RejectReason::LiveLimit | RejectReason::GlobalLimit => {
                if self.log_throttle.allow(ip) {
                    tracing::warn!(client = %ip, "reject {}", reason);
                }
            }
            RejectReason::TempBlock => {
                let banned = match &self.firewall {
                    Some(fw) if self.limiter.is_temp_blocked(ip) => {
                        fw.block_ip(ip);
                        self.events.push(EventKind::Ban, Some(ip), "tempblock");
                        true
                    }
                    _ => false,
                };
                if self.log_throttle.allow(ip) {
                    if banned {
                        tracing::warn!(client = %ip, "reject tempblock, firewall ban queued");
                    } else {
                        tracing::warn!(client = %ip, "reject tempblock");
                    }
                }
            }
            RejectReason::BackendFail => {
                if self.log_throttle.allow(ip) {
                    tracing::error!(client = %ip, "backend connect failed");
                }
            }
        }
    }

    fn on_release(&self, ip: IpAddr) {
        self.limiter.release(ip);
    }

    fn should_drain(&self) -> bool {
        self.overload.as_ref().is_some_and(|o| o.should_drain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_stats_window_rate() {
        let stats = RejectStats::new();
        for _ in 0..30 {
            stats.increment();
        }
        assert_eq!(stats.observe_rate(), 30.0);
        assert_eq!(stats.rate_per_10s(), 30.0);

        // Next window only sees the new delta.
        for _ in 0..5 {
            stats.increment();
        }
        assert_eq!(stats.observe_rate(), 5.0);
        assert_eq!(stats.total(), 35);
    }

    #[tokio::test]
    async fn game_profile_never_drains() {
        let cfg = ProfileConfig::game_defaults();
        let supervisor = Supervisor::new(cfg, Profile::Game);
        assert!(!supervisor.should_drain());
        if let Some(fw) = supervisor.firewall() {
            fw.stop().await;
        }
    }

    #[tokio::test]
    async fn rate_reject_feeds_deny_count_and_tempblock_bans() {
        let mut cfg = ProfileConfig::login_defaults();
        cfg.attempt_burst = 1.0;
        cfg.denies_before_tempblock = 2;
        cfg.enable_firewall_autoban = Some(false);
        let supervisor = Supervisor::new(cfg, Profile::Login);
        let ip: IpAddr = "10.50.0.1".parse().unwrap();

        assert!(supervisor.try_accept(ip).is_ok());
        supervisor.on_release(ip);

        for _ in 0..2 {
            let reason = supervisor.try_accept(ip).unwrap_err();
            assert_eq!(reason, RejectReason::Rate);
            supervisor.on_reject(ip, reason);
        }
        assert!(supervisor.limiter().is_temp_blocked(ip));

        let reason = supervisor.try_accept(ip).unwrap_err();
        assert_eq!(reason, RejectReason::TempBlock);
    }

    #[tokio::test]
    async fn manual_unblock_reopens_admission() {
        let mut cfg = ProfileConfig::login_defaults();
        cfg.attempt_burst = 1.0;
        cfg.denies_before_tempblock = 1;
        cfg.enable_firewall_autoban = Some(false);
        let supervisor = Supervisor::new(cfg, Profile::Login);
        let ip: IpAddr = "10.50.0.2".parse().unwrap();

        assert!(supervisor.try_accept(ip).is_ok());
        supervisor.on_release(ip);
        let reason = supervisor.try_accept(ip).unwrap_err();
        supervisor.on_reject(ip, reason);
        assert!(supervisor.limiter().is_temp_blocked(ip));

        supervisor.unblock_ip(ip);
        assert!(!supervisor.limiter().is_temp_blocked(ip));
        // Bucket refilled after a second: admission works again.
        assert!(supervisor
            .limiter()
            .try_accept(ip, Instant::now() + Duration::from_secs(2))
            .is_ok());

        let kinds: Vec<_> = supervisor.events().snapshot().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::Unblock));
    }
}
