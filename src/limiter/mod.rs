//! Per-peer admission limiting.
//!
//! # Responsibilities
//! - Token-bucket rate limiting per source IP
//! - Per-IP live connection cap and global admission budget
//! - Temporary blocks with exponential block-count backoff
//! - Stale peer eviction (GC loop)
//!
//! Limiter operations never fail; they decide. A deny is a normal
//! outcome reported as a [`RejectReason`], not an error.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::ProfileConfig;

/// Hard ceiling on any tempblock duration.
const MAX_TEMPBLOCK: Duration = Duration::from_secs(24 * 60 * 60);

/// Backoff multiplier cap: 2^4 = 16x the base tempblock.
const MAX_BACKOFF_SHIFT: u32 = 4;

/// Why a connection was refused.
///
/// The limiter produces the first four; `BackendFail` is reported by the
/// forwarder when the backend dial fails after admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Token bucket empty.
    Rate,
    /// Per-IP live connection cap reached.
    LiveLimit,
    /// Global admission budget exhausted.
    GlobalLimit,
    /// Peer is inside a tempblock window.
    TempBlock,
    /// Backend dial failed or timed out.
    BackendFail,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Rate => "rate",
            RejectReason::LiveLimit => "live_limit",
            RejectReason::GlobalLimit => "global_limit",
            RejectReason::TempBlock => "tempblock",
            RejectReason::BackendFail => "backend_fail",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limiter tunables, one set per proxy profile.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub max_live_per_ip: u32,
    pub refill_per_sec: f64,
    pub burst: f64,
    pub denies_to_block: u32,
    pub tempblock: Duration,
    pub max_total_conns: usize,
    pub stale_after: Duration,
    pub cleanup_every: Duration,
}

impl From<&ProfileConfig> for LimiterSettings {
    fn from(cfg: &ProfileConfig) -> Self {
        Self {
            max_live_per_ip: cfg.max_live_conns_per_ip,
            refill_per_sec: cfg.attempt_refill_per_sec,
            burst: cfg.attempt_burst,
            denies_to_block: cfg.denies_before_tempblock,
            tempblock: cfg.tempblock(),
            max_total_conns: cfg.max_total_conns,
            stale_after: cfg.stale_after(),
            cleanup_every: cfg.cleanup_every(),
        }
    }
}

/// Per-IP state. Owned by the limiter's table, guarded by its own mutex.
struct PeerState {
    inner: Mutex<PeerInner>,
}

struct PeerInner {
    /// Currently forwarded connections from this peer.
    live_count: u32,
    /// Token bucket level, in [0, burst].
    tokens: f64,
    /// Refill reference time.
    last_token_ts: Instant,
    /// Consecutive rate denies since last success or tempblock reset.
    deny_count: u32,
    /// Tempblock expiry. None = not blocked.
    block_until: Option<Instant>,
    /// Times this peer has ever been tempblocked. Never reset by
    /// success; drives the exponential backoff.
    block_count: u32,
    /// For stale eviction.
    last_seen: Instant,
}

impl PeerState {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            inner: Mutex::new(PeerInner {
                live_count: 0,
                tokens: burst,
                last_token_ts: now,
                deny_count: 0,
                block_until: None,
                block_count: 0,
                last_seen: now,
            }),
        }
    }
}

struct Table {
    peers: HashMap<IpAddr, Arc<PeerState>>,
    /// Global admission slots in use. Bounded by `max_total_conns`;
    /// acquire is non-blocking (full = deny), release floors at zero.
    slots_used: usize,
}

/// Per-peer and global admission limiter.
pub struct Limiter {
    table: RwLock<Table>,
    settings: LimiterSettings,
}

/// Value snapshot of one peer, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub ip: IpAddr,
    pub live_count: u32,
    pub deny_count: u32,
    pub block_count: u32,
    /// Remaining tempblock time, if currently blocked.
    pub blocked_remaining: Option<Duration>,
    /// Time since last activity.
    pub idle_for: Duration,
}

impl Limiter {
    pub fn new(settings: LimiterSettings) -> Self {
        Self {
            table: RwLock::new(Table {
                peers: HashMap::new(),
                slots_used: 0,
            }),
            settings,
        }
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Decide whether to admit a connection from `ip`.
    ///
    /// On `Ok(())` the peer's live count and the global budget have both
    /// been taken; the caller must call [`Limiter::release`] exactly once
    /// when the connection ends.
    pub fn try_accept(&self, ip: IpAddr, now: Instant) -> Result<(), RejectReason> {
        let mut table = self.table.write().expect("limiter table lock poisoned");

        // Global budget first: non-blocking acquire.
        if table.slots_used >= self.settings.max_total_conns {
            return Err(RejectReason::GlobalLimit);
        }
        table.slots_used += 1;

        let peer = Arc::clone(
            table
                .peers
                .entry(ip)
                .or_insert_with(|| Arc::new(PeerState::new(self.settings.burst, now))),
        );

        // Both guards held: the budget decision and the peer update must
        // be a single critical section.
        let mut p = peer.inner.lock().expect("peer lock poisoned");

        if let Some(until) = p.block_until {
            if now < until {
                drop(p);
                table.slots_used -= 1;
                return Err(RejectReason::TempBlock);
            }
            // Tempblock just expired: reset the deny streak but keep
            // block_count, the backoff memory.
            p.deny_count = 0;
            p.block_until = None;
        }

        if p.live_count >= self.settings.max_live_per_ip {
            drop(p);
            table.slots_used -= 1;
            return Err(RejectReason::LiveLimit);
        }

        let elapsed = now.saturating_duration_since(p.last_token_ts).as_secs_f64();
        p.tokens = (p.tokens + elapsed * self.settings.refill_per_sec).min(self.settings.burst);
        p.last_token_ts = now;

        if p.tokens < 1.0 {
            // deny_count is bumped by the supervisor via record_deny,
            // not here, so rejects are not double counted.
            drop(p);
            table.slots_used -= 1;
            return Err(RejectReason::Rate);
        }

        p.tokens -= 1.0;
        p.deny_count = 0;
        p.live_count += 1;
        p.last_seen = now;
        Ok(())
    }

    /// Release one admitted connection from `ip`.
    ///
    /// Unknown IPs are a no-op apart from a best-effort budget drain,
    /// which guards against accounting drift when a peer was GC'd
    /// between admit and release.
    pub fn release(&self, ip: IpAddr) {
        let mut table = self.table.write().expect("limiter table lock poisoned");
        if let Some(peer) = table.peers.get(&ip).cloned() {
            let mut p = peer.inner.lock().expect("peer lock poisoned");
            if p.live_count > 0 {
                p.live_count -= 1;
            }
            p.last_seen = Instant::now();
        }
        if table.slots_used > 0 {
            table.slots_used -= 1;
        }
    }

    /// Record a `rate` deny against `ip`. Crossing the deny threshold
    /// tempblocks the peer for `tempblock × 2^min(block_count, 4)`,
    /// capped at 24 h.
    pub fn record_deny(&self, ip: IpAddr) {
        let peer = {
            let table = self.table.read().expect("limiter table lock poisoned");
            match table.peers.get(&ip) {
                Some(p) => Arc::clone(p),
                None => return,
            }
        };

        let now = Instant::now();
        let mut p = peer.inner.lock().expect("peer lock poisoned");
        p.deny_count += 1;
        if p.deny_count >= self.settings.denies_to_block {
            p.block_count += 1;
            let shift = (p.block_count - 1).min(MAX_BACKOFF_SHIFT);
            let duration = (self.settings.tempblock * (1u32 << shift)).min(MAX_TEMPBLOCK);
            p.block_until = Some(now + duration);
        }
        p.last_seen = now;
    }

    /// Whether `ip` is currently inside a tempblock window. Used to
    /// decide whether a tempblock reject escalates to a firewall ban.
    pub fn is_temp_blocked(&self, ip: IpAddr) -> bool {
        let peer = {
            let table = self.table.read().expect("limiter table lock poisoned");
            match table.peers.get(&ip) {
                Some(p) => Arc::clone(p),
                None => return false,
            }
        };
        let p = peer.inner.lock().expect("peer lock poisoned");
        p.block_until.is_some_and(|until| Instant::now() < until)
    }

    /// (active connections, tracked peers).
    pub fn stats(&self) -> (usize, usize) {
        let table = self.table.read().expect("limiter table lock poisoned");
        (table.slots_used, table.peers.len())
    }

    /// Value snapshots of every tracked peer.
    pub fn get_all_stats(&self) -> Vec<PeerSnapshot> {
        let now = Instant::now();
        let table = self.table.read().expect("limiter table lock poisoned");
        table
            .peers
            .iter()
            .map(|(ip, peer)| {
                let p = peer.inner.lock().expect("peer lock poisoned");
                PeerSnapshot {
                    ip: *ip,
                    live_count: p.live_count,
                    deny_count: p.deny_count,
                    block_count: p.block_count,
                    blocked_remaining: p
                        .block_until
                        .and_then(|until| until.checked_duration_since(now)),
                    idle_for: now.saturating_duration_since(p.last_seen),
                }
            })
            .collect()
    }

    /// Manually clear a peer's tempblock. Keeps `block_count`.
    pub fn unblock_temp_ip(&self, ip: IpAddr) {
        let peer = {
            let table = self.table.read().expect("limiter table lock poisoned");
            match table.peers.get(&ip) {
                Some(p) => Arc::clone(p),
                None => return,
            }
        };
        let mut p = peer.inner.lock().expect("peer lock poisoned");
        p.block_until = None;
        p.deny_count = 0;
    }

    /// Clear every tempblock; returns how many peers were unblocked.
    pub fn unblock_all(&self) -> usize {
        let table = self.table.write().expect("limiter table lock poisoned");
        let mut cleared = 0;
        for peer in table.peers.values() {
            let mut p = peer.inner.lock().expect("peer lock poisoned");
            if p.block_until.is_some() {
                p.block_until = None;
                p.deny_count = 0;
                cleared += 1;
            }
        }
        cleared
    }

    /// Evict peers with no live connections, no pending tempblock and no
    /// recent activity.
    pub(crate) fn cleanup(&self, now: Instant) {
        let stale_after = self.settings.stale_after;
        let mut table = self.table.write().expect("limiter table lock poisoned");
        table.peers.retain(|_, peer| {
            let p = peer.inner.lock().expect("peer lock poisoned");
            let stale = now.saturating_duration_since(p.last_seen) > stale_after;
            let blocked = p.block_until.is_some_and(|until| now < until);
            p.live_count > 0 || blocked || !stale
        });
    }

    /// Run the GC loop until shutdown.
    pub fn spawn_gc(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = self;
        tokio::spawn(async move {
            let period = limiter.settings.cleanup_every;
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tick.tick() => limiter.cleanup(Instant::now()),
                }
            }
        })
    }
}
