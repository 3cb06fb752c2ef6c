//! Overload detection and drain control.
//!
//! Present only in the login profile: the game profile never drains.
//!
//! Two samplers share one guarded state. The fast sampler (2 s) reacts
//! immediately to critical load (≥ 90 % of the budget) and exits drain
//! once load falls back below 48 %. The slow sampler (10 s) marks
//! sustained overload (≥ 80 % or a high reject rate) and drains after it
//! persists for 5 s. The forwarder polls [`OverloadController::should_drain`]
//! before every accept.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::limiter::Limiter;
use crate::supervisor::events::{EventKind, EventLog};
use crate::supervisor::RejectStats;

const FAST_SAMPLE_EVERY: Duration = Duration::from_secs(2);
const SLOW_SAMPLE_EVERY: Duration = Duration::from_secs(10);

/// Rejects per 10 s window that count as overload on their own.
const REJECT_RATE_THRESHOLD: f64 = 50.0;

/// How long sustained (non-critical) overload is tolerated before drain.
const DRAIN_AFTER: Duration = Duration::from_secs(5);

struct OverloadState {
    overloaded: bool,
    in_drain: bool,
    overload_started_at: Option<Instant>,
}

/// Drives the login listener's drain gate from limiter load and reject
/// pressure.
pub struct OverloadController {
    state: RwLock<OverloadState>,
    limiter: Arc<Limiter>,
    rejects: Arc<RejectStats>,
    events: Arc<EventLog>,
    max_total_conns: usize,
    /// 80 % of the budget: sustained overload marker.
    overload_threshold: usize,
    /// 90 % of the budget: immediate drain.
    critical_threshold: usize,
    /// 60 % of the overload threshold (48 % of the budget): drain exit.
    drain_exit_below: usize,
}

impl OverloadController {
    pub fn new(
        limiter: Arc<Limiter>,
        rejects: Arc<RejectStats>,
        events: Arc<EventLog>,
        max_total_conns: usize,
    ) -> Self {
        let overload_threshold = max_total_conns * 80 / 100;
        Self {
            state: RwLock::new(OverloadState {
                overloaded: false,
                in_drain: false,
                overload_started_at: None,
            }),
            limiter,
            rejects,
            events,
            max_total_conns,
            overload_threshold,
            critical_threshold: max_total_conns * 90 / 100,
            drain_exit_below: overload_threshold * 60 / 100,
        }
    }

    /// Read by the forwarder before every accept.
    pub fn should_drain(&self) -> bool {
        self.state
            .read()
            .expect("overload state lock poisoned")
            .in_drain
    }

    pub fn is_overloaded(&self) -> bool {
        self.state
            .read()
            .expect("overload state lock poisoned")
            .overloaded
    }

    /// Critical-load check: enter drain at ≥ 90 %, leave below 48 %.
    pub(crate) fn sample_fast(&self) {
        let (active, _) = self.limiter.stats();
        let mut state = self.state.write().expect("overload state lock poisoned");

        if active >= self.critical_threshold && !state.in_drain {
            state.in_drain = true;
            tracing::warn!(
                active_conns = active,
                max_total_conns = self.max_total_conns,
                "critical load, drain engaged"
            );
            self.events
                .push(EventKind::DrainOn, None, format!("active={active}"));
        } else if state.in_drain && active < self.drain_exit_below {
            state.in_drain = false;
            tracing::info!(active_conns = active, "load recovered, drain released");
            self.events
                .push(EventKind::DrainOff, None, format!("active={active}"));
        }
    }

    /// Sustained-overload check: 80 % of the budget or a hot reject rate,
    /// held for 5 s, drains; clearing overload releases drain.
    pub(crate) fn sample_slow(&self, now: Instant) {
        let (active, _) = self.limiter.stats();
        let rate = self.rejects.rate_per_10s();
        let mut state = self.state.write().expect("overload state lock poisoned");

        let was_overloaded = state.overloaded;
        let critical = active >= self.critical_threshold;
        state.overloaded = active >= self.overload_threshold || rate >= REJECT_RATE_THRESHOLD;

        if state.overloaded && !was_overloaded {
            state.overload_started_at = Some(now);
            tracing::warn!(
                active_conns = active,
                max_total_conns = self.max_total_conns,
                rejects_per_10s = rate,
                "SOBRECARGA DETECTADA"
            );
            self.events.push(
                EventKind::OverloadStart,
                None,
                format!("active={active} rejects_per_10s={rate:.1}"),
            );
        }

        if state.overloaded && was_overloaded && !critical {
            // The critical path is the fast sampler's; here only
            // persistence matters.
            let persisted = state
                .overload_started_at
                .is_some_and(|t| now.duration_since(t) >= DRAIN_AFTER);
            if !state.in_drain && persisted {
                state.in_drain = true;
                tracing::warn!(active_conns = active, "sustained overload, drain engaged");
                self.events
                    .push(EventKind::DrainOn, None, format!("active={active}"));
            }
        } else if !state.overloaded && was_overloaded {
            state.overload_started_at = None;
            tracing::info!(
                active_conns = active,
                rejects_per_10s = rate,
                "overload cleared"
            );
            self.events
                .push(EventKind::OverloadEnd, None, format!("active={active}"));
            if state.in_drain {
                state.in_drain = false;
                self.events
                    .push(EventKind::DrainOff, None, format!("active={active}"));
            }
        }
    }

    /// Run both samplers until shutdown.
    pub fn spawn_samplers(
        self: Arc<Self>,
        mut fast_shutdown: broadcast::Receiver<()>,
        mut slow_shutdown: broadcast::Receiver<()>,
    ) -> [tokio::task::JoinHandle<()>; 2] {
        let fast = {
            let ctrl = Arc::clone(&self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval_at(
                    tokio::time::Instant::now() + FAST_SAMPLE_EVERY,
                    FAST_SAMPLE_EVERY,
                );
                loop {
                    tokio::select! {
                        _ = fast_shutdown.recv() => return,
                        _ = tick.tick() => ctrl.sample_fast(),
                    }
                }
            })
        };
        let slow = {
            let ctrl = self;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval_at(
                    tokio::time::Instant::now() + SLOW_SAMPLE_EVERY,
                    SLOW_SAMPLE_EVERY,
                );
                loop {
                    tokio::select! {
                        _ = slow_shutdown.recv() => return,
                        _ = tick.tick() => ctrl.sample_slow(Instant::now()),
                    }
                }
            })
        };
        [fast, slow]
    }
}
