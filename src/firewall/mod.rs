//! Batched OS firewall ban management.
//!
//! # Responsibilities
//! - Queue ban requests (fire-and-forget from the admission path)
//! - Apply them in batches under a small command-concurrency cap
//! - Schedule and execute automatic removal
//! - Expose manual block/unblock for the external admin API
//!
//! Each firewall edit costs tens of milliseconds; during a flood,
//! synchronous edits would starve the accept loop. Batching plus the
//! concurrency cap keeps rule churn off the hot path.

pub mod rules;

pub use rules::{rule_name, OsFirewall, RuleApplier, RULE_PREFIX};

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Semaphore};

/// External commands in flight at once.
const MAX_CONCURRENT_BLOCKS: usize = 3;

/// Per-command execution timeout.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Ceiling on simultaneously banned IPs; requests beyond it are dropped.
const MAX_BLOCKED_IPS: usize = 1000;

/// How often queued bans are flushed.
const BATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Largest chunk handed to one worker task.
const MAX_BATCH_SIZE: usize = 50;

const UNBLOCK_QUEUE_CAPACITY: usize = 200;

/// How often expired bans are collected for removal.
const SCHEDULER_INTERVAL: Duration = Duration::from_secs(30);

/// Batches OS-level bans and schedules their removal.
///
/// An IP lives in `pending` (queued, not yet applied) and `scheduled`
/// (will be removed at its deadline); the batch worker promotes
/// pending→applied, the scheduler drains expired entries, and a failed
/// command evicts the IP from `scheduled` so a later offence retries.
pub struct FirewallManager {
    scheduled: Mutex<HashMap<IpAddr, Instant>>,
    pending: Mutex<HashSet<IpAddr>>,
    block_for: Duration,
    cmd_sem: Arc<Semaphore>,
    unblock_tx: mpsc::Sender<IpAddr>,
    shutdown: broadcast::Sender<()>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    applier: Arc<dyn RuleApplier>,
}

impl FirewallManager {
    /// Manager driving the host OS firewall.
    pub fn new(block_for: Duration) -> Arc<Self> {
        Self::with_applier(block_for, Arc::new(OsFirewall))
    }

    /// Manager with a custom rule applier.
    pub fn with_applier(block_for: Duration, applier: Arc<dyn RuleApplier>) -> Arc<Self> {
        let (unblock_tx, unblock_rx) = mpsc::channel(UNBLOCK_QUEUE_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);

        let manager = Arc::new(Self {
            scheduled: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            block_for,
            cmd_sem: Arc::new(Semaphore::new(MAX_CONCURRENT_BLOCKS)),
            unblock_tx,
            shutdown,
            workers: Mutex::new(Vec::new()),
            applier,
        });

        let batch = tokio::spawn(Self::batch_worker(
            Arc::clone(&manager),
            manager.shutdown.subscribe(),
        ));
        let unblock = tokio::spawn(Self::unblock_worker(
            Arc::clone(&manager),
            unblock_rx,
            manager.shutdown.subscribe(),
        ));
        manager
            .workers
            .lock()
            .expect("firewall workers lock poisoned")
            .extend([batch, unblock]);

        manager
    }

    /// Queue a ban for `ip`. Returns immediately; the batch worker
    /// applies it. At capacity the request is dropped with a warning —
    /// fire-and-forget semantics.
    pub fn block_ip(&self, ip: IpAddr) {
        let mut scheduled = self.scheduled.lock().expect("firewall scheduled lock poisoned");
        if scheduled.len() >= MAX_BLOCKED_IPS {
            tracing::warn!(
                client = %ip,
                capacity = MAX_BLOCKED_IPS,
                "firewall ban capacity reached, dropping request"
            );
            return;
        }
        if scheduled.contains_key(&ip) {
            return;
        }
        let mut pending = self.pending.lock().expect("firewall pending lock poisoned");
        if !pending.insert(ip) {
            return;
        }
        scheduled.insert(ip, Instant::now() + self.block_for);
        tracing::debug!(client = %ip, "firewall ban queued for next batch");
    }

    /// Remove the ban for `ip` now. Unknown IPs are a no-op; a full
    /// queue falls back to a one-off task.
    pub fn unblock_ip(&self, ip: IpAddr) {
        match self.unblock_tx.try_send(ip) {
            Ok(()) => {}
            Err(_) => {
                let applier = Arc::clone(&self.applier);
                tokio::spawn(async move {
                    let _ = tokio::time::timeout(COMMAND_TIMEOUT, applier.delete_rule(ip)).await;
                });
                self.forget(ip);
            }
        }
    }

    /// Copy of the ip → removal-deadline map.
    pub fn scheduled_unblocks(&self) -> HashMap<IpAddr, Instant> {
        self.scheduled
            .lock()
            .expect("firewall scheduled lock poisoned")
            .clone()
    }

    /// Run the removal scheduler until shutdown.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self;
        let mut own_shutdown = manager.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(
                tokio::time::Instant::now() + SCHEDULER_INTERVAL,
                SCHEDULER_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = own_shutdown.recv() => return,
                    _ = tick.tick() => manager.remove_expired(),
                }
            }
        })
    }

    /// Stop all workers, flushing queued bans best effort.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let workers = std::mem::take(
            &mut *self.workers.lock().expect("firewall workers lock poisoned"),
        );
        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn batch_worker(manager: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + BATCH_INTERVAL,
            BATCH_INTERVAL,
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    // Final flush before exit.
                    manager.process_batch();
                    return;
                }
                _ = tick.tick() => Arc::clone(&manager).process_batch(),
            }
        }
    }

    /// Drain `pending` and hand it to chunk tasks.
    fn process_batch(self: Arc<Self>) {
        let ips: Vec<IpAddr> = {
            let mut pending = self.pending.lock().expect("firewall pending lock poisoned");
            pending.drain().collect()
        };
        if ips.is_empty() {
            return;
        }
        for chunk in ips.chunks(MAX_BATCH_SIZE) {
            let manager = Arc::clone(&self);
            let chunk = chunk.to_vec();
            tokio::spawn(async move { manager.execute_batch(chunk).await });
        }
    }

    async fn execute_batch(&self, ips: Vec<IpAddr>) {
        let mut shutdown = self.shutdown.subscribe();
        for ip in ips {
            let permit = tokio::select! {
                _ = shutdown.recv() => return,
                permit = Arc::clone(&self.cmd_sem).acquire_owned() => {
                    permit.expect("firewall command semaphore closed")
                }
            };

            match tokio::time::timeout(COMMAND_TIMEOUT, self.applier.add_rule(ip)).await {
                Ok(Ok(())) => {
                    tracing::info!(client = %ip, "firewall ban applied");
                }
                Ok(Err(e)) => {
                    tracing::warn!(client = %ip, error = %e, "firewall ban failed, will retry on next offence");
                    self.scheduled
                        .lock()
                        .expect("firewall scheduled lock poisoned")
                        .remove(&ip);
                }
                Err(_) => {
                    tracing::warn!(client = %ip, "firewall ban timed out, will retry on next offence");
                    self.scheduled
                        .lock()
                        .expect("firewall scheduled lock poisoned")
                        .remove(&ip);
                }
            }
            drop(permit);
        }
    }

    async fn unblock_worker(
        manager: Arc<Self>,
        mut queue: mpsc::Receiver<IpAddr>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                received = queue.recv() => {
                    let Some(ip) = received else { return };
                    // Errors ignored: the rule may already be gone.
                    let _ = tokio::time::timeout(
                        COMMAND_TIMEOUT,
                        manager.applier.delete_rule(ip),
                    )
                    .await;
                    manager.forget(ip);
                }
            }
        }
    }

    fn remove_expired(&self) {
        let now = Instant::now();
        let expired: Vec<IpAddr> = {
            let scheduled = self.scheduled.lock().expect("firewall scheduled lock poisoned");
            scheduled
                .iter()
                .filter(|(_, until)| now > **until)
                .map(|(ip, _)| *ip)
                .collect()
        };
        for ip in expired {
            self.unblock_ip(ip);
        }
    }

    fn forget(&self, ip: IpAddr) {
        self.scheduled
            .lock()
            .expect("firewall scheduled lock poisoned")
            .remove(&ip);
        self.pending
            .lock()
            .expect("firewall pending lock poisoned")
            .remove(&ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct MockApplier {
        calls: Mutex<Vec<(&'static str, IpAddr)>>,
        fail_adds: bool,
    }

    impl MockApplier {
        fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_adds: true,
            }
        }

        fn calls(&self) -> Vec<(&'static str, IpAddr)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RuleApplier for MockApplier {
        async fn add_rule(&self, ip: IpAddr) -> std::io::Result<()> {
            self.calls.lock().unwrap().push(("add", ip));
            if self.fail_adds {
                Err(std::io::Error::other("injected failure"))
            } else {
                Ok(())
            }
        }

        async fn delete_rule(&self, ip: IpAddr) -> std::io::Result<()> {
            self.calls.lock().unwrap().push(("del", ip));
            Ok(())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_applies_each_queued_ip_once() {
        let applier = Arc::new(MockApplier::default());
        let manager = FirewallManager::with_applier(Duration::from_secs(600), applier.clone());

        for i in 1..=5 {
            manager.block_ip(ip(&format!("198.51.100.{i}")));
        }
        // Duplicates in the same batch window collapse.
        manager.block_ip(ip("198.51.100.1"));
        manager.block_ip(ip("198.51.100.2"));

        manager.clone().process_batch();
        settle().await;

        let adds: Vec<_> = applier.calls().into_iter().filter(|(op, _)| *op == "add").collect();
        assert_eq!(adds.len(), 5);
        assert_eq!(manager.scheduled_unblocks().len(), 5);

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_command_evicts_from_schedule() {
        let applier = Arc::new(MockApplier::failing());
        let manager = FirewallManager::with_applier(Duration::from_secs(600), applier.clone());

        manager.block_ip(ip("198.51.100.9"));
        manager.clone().process_batch();
        settle().await;

        assert_eq!(applier.calls().len(), 1);
        assert!(manager.scheduled_unblocks().is_empty(), "failed ban retriable later");

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn capacity_overflow_drops_request() {
        let applier = Arc::new(MockApplier::default());
        let manager = FirewallManager::with_applier(Duration::from_secs(600), applier.clone());

        for i in 0..MAX_BLOCKED_IPS {
            let octets = [(i >> 16) as u8, (i >> 8) as u8, i as u8];
            manager.block_ip(IpAddr::from([10, octets[0], octets[1], octets[2]]));
        }
        assert_eq!(manager.scheduled_unblocks().len(), MAX_BLOCKED_IPS);

        manager.block_ip(ip("203.0.113.99"));
        assert_eq!(manager.scheduled_unblocks().len(), MAX_BLOCKED_IPS);

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_removes_expired_bans() {
        let applier = Arc::new(MockApplier::default());
        let manager = FirewallManager::with_applier(Duration::from_millis(1), applier.clone());

        manager.block_ip(ip("198.51.100.20"));
        manager.clone().process_batch();
        settle().await;

        manager.remove_expired();
        settle().await;

        let dels: Vec<_> = applier.calls().into_iter().filter(|(op, _)| *op == "del").collect();
        assert_eq!(dels.len(), 1);
        assert!(manager.scheduled_unblocks().is_empty());
        assert!(manager.pending.lock().unwrap().is_empty());

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unblock_unknown_ip_is_harmless() {
        let applier = Arc::new(MockApplier::default());
        let manager = FirewallManager::with_applier(Duration::from_secs(600), applier.clone());

        manager.unblock_ip(ip("192.0.2.200"));
        settle().await;

        assert!(manager.scheduled_unblocks().is_empty());

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_unblock_clears_pending_ban() {
        let applier = Arc::new(MockApplier::default());
        let manager = FirewallManager::with_applier(Duration::from_secs(600), applier.clone());

        manager.block_ip(ip("198.51.100.30"));
        manager.unblock_ip(ip("198.51.100.30"));
        settle().await;

        assert!(manager.scheduled_unblocks().is_empty());
        assert!(manager.pending.lock().unwrap().is_empty());

        manager.stop().await;
    }
}
