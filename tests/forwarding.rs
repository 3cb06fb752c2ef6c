//! End-to-end forwarding tests over real sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use gateguard::config::{Profile, ProfileConfig};
use gateguard::lifecycle::Shutdown;
use gateguard::limiter::RejectReason;
use gateguard::proxy::{AdmissionPolicy, Forwarder};
use gateguard::supervisor::Supervisor;

mod common;

fn test_config(listen: SocketAddr, backend: SocketAddr) -> ProfileConfig {
    let mut cfg = ProfileConfig::login_defaults();
    cfg.listen_addr = listen.to_string();
    cfg.backend_addr = backend.to_string();
    cfg.enable_firewall_autoban = Some(false);
    cfg.idle_timeout_seconds = 10;
    cfg.backend_dial_timeout_seconds = 2;
    cfg
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_pair_forwards_and_releases() {
    let backend_addr: SocketAddr = "127.0.0.1:28482".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28481".parse().unwrap();
    common::start_echo_backend(backend_addr).await;

    let mut cfg = test_config(proxy_addr, backend_addr);
    cfg.max_live_conns_per_ip = 3;
    cfg.attempt_burst = 5.0;
    cfg.attempt_refill_per_sec = 1.5;
    cfg.max_total_conns = 100;

    let supervisor = Supervisor::new(cfg, Profile::Login);
    let runner = tokio::spawn(Arc::clone(&supervisor).run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // One peer, two concurrent sessions, both forwarding.
    let mut first = TcpStream::connect(proxy_addr).await.unwrap();
    let mut second = TcpStream::connect(proxy_addr).await.unwrap();
    for stream in [&mut first, &mut second] {
        stream.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
    }

    let limiter = Arc::clone(supervisor.limiter());
    assert!(
        common::wait_until(|| limiter.stats().0 == 2, Duration::from_secs(2)).await,
        "two sessions admitted"
    );

    drop(first);
    drop(second);
    assert!(
        common::wait_until(|| limiter.stats().0 == 0, Duration::from_secs(2)).await,
        "all sessions released"
    );

    // The peer stays tracked with live_count back at zero.
    let snapshots = supervisor.limiter().get_all_stats();
    let local = snapshots
        .iter()
        .find(|s| s.ip == "127.0.0.1".parse::<std::net::IpAddr>().unwrap())
        .expect("peer tracked");
    assert_eq!(local.live_count, 0);

    supervisor.shutdown().trigger();
    let result = runner.await.unwrap();
    assert!(result.is_ok(), "clean shutdown: {result:?}");
    assert_eq!(supervisor.limiter().stats().0, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn burst_storm_rates_then_tempblocks() {
    let backend_addr: SocketAddr = "127.0.0.1:28484".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28483".parse().unwrap();
    common::start_echo_backend(backend_addr).await;

    let mut cfg = test_config(proxy_addr, backend_addr);
    cfg.max_live_conns_per_ip = 10;
    cfg.attempt_burst = 2.0;
    cfg.attempt_refill_per_sec = 1.0;
    cfg.denies_before_tempblock = 3;
    cfg.tempblock_seconds = 10;

    let supervisor = Supervisor::new(cfg, Profile::Login);
    let runner = tokio::spawn(Arc::clone(&supervisor).run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Six rapid attempts from one peer: 2 admitted (burst), the rest
    // denied; the third consecutive rate deny tempblocks the peer.
    let mut held = Vec::new();
    let mut admitted = 0;
    let mut refused = 0;
    for _ in 0..6 {
        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        match tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut got)).await {
            Ok(Ok(_)) => {
                admitted += 1;
                held.push(stream);
            }
            _ => refused += 1,
        }
    }
    assert_eq!(admitted, 2);
    assert_eq!(refused, 4);

    let ip = "127.0.0.1".parse().unwrap();
    assert!(
        common::wait_until(|| supervisor.limiter().is_temp_blocked(ip), Duration::from_secs(2)).await,
        "storm ends in a tempblock"
    );
    let snapshot = supervisor
        .limiter()
        .get_all_stats()
        .into_iter()
        .find(|s| s.ip == ip)
        .expect("peer tracked");
    assert_eq!(snapshot.block_count, 1);

    supervisor.shutdown().trigger();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn global_ceiling_frees_on_release() {
    let backend_addr: SocketAddr = "127.0.0.1:28486".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28485".parse().unwrap();
    common::start_echo_backend(backend_addr).await;

    let mut cfg = test_config(proxy_addr, backend_addr);
    cfg.max_total_conns = 2;
    cfg.max_live_conns_per_ip = 10;
    cfg.attempt_burst = 100.0;
    cfg.attempt_refill_per_sec = 50.0;

    let supervisor = Supervisor::new(cfg, Profile::Login);
    let runner = tokio::spawn(Arc::clone(&supervisor).run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let first = common::round_trip(proxy_addr, b"a").await;
    assert!(first.is_some());
    // round_trip drops its stream; hold two live sessions explicitly.
    let limiter = Arc::clone(supervisor.limiter());
    assert!(common::wait_until(|| limiter.stats().0 == 0, Duration::from_secs(2)).await);

    let mut held = Vec::new();
    for _ in 0..2 {
        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        stream.write_all(b"x").await.unwrap();
        let mut got = [0u8; 1];
        stream.read_exact(&mut got).await.unwrap();
        held.push(stream);
    }
    assert!(common::wait_until(|| limiter.stats().0 == 2, Duration::from_secs(2)).await);

    // Budget exhausted: the next session is refused at admission.
    assert!(common::round_trip(proxy_addr, b"y").await.is_none());

    // Freeing one slot lets a new session through.
    held.pop();
    assert!(common::wait_until(|| limiter.stats().0 == 1, Duration::from_secs(2)).await);
    assert!(common::round_trip(proxy_addr, b"z").await.is_some());

    supervisor.shutdown().trigger();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn backend_down_rejects_and_releases() {
    // No backend listening on this port.
    let backend_addr: SocketAddr = "127.0.0.1:28488".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28487".parse().unwrap();

    let cfg = test_config(proxy_addr, backend_addr);
    let supervisor = Supervisor::new(cfg, Profile::Login);
    let runner = tokio::spawn(Arc::clone(&supervisor).run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(common::round_trip(proxy_addr, b"hello").await.is_none());

    let limiter = Arc::clone(supervisor.limiter());
    assert!(
        common::wait_until(|| limiter.stats().0 == 0, Duration::from_secs(2)).await,
        "backend_fail still releases the admission slot"
    );
    assert!(
        common::wait_until(|| supervisor.rejects().total() >= 1, Duration::from_secs(2)).await,
        "backend_fail counts as a reject"
    );

    supervisor.shutdown().trigger();
    runner.await.unwrap().unwrap();
}

/// Policy stub with a switchable drain gate.
struct GatePolicy {
    drain: AtomicBool,
    released: AtomicUsize,
}

impl GatePolicy {
    fn new() -> Self {
        Self {
            drain: AtomicBool::new(false),
            released: AtomicUsize::new(0),
        }
    }
}

impl AdmissionPolicy for GatePolicy {
    fn try_accept(&self, _ip: std::net::IpAddr) -> Result<(), RejectReason> {
        Ok(())
    }
    fn on_accept(&self, _ip: std::net::IpAddr) {}
    fn on_reject(&self, _ip: std::net::IpAddr, _reason: RejectReason) {}
    fn on_release(&self, _ip: std::net::IpAddr) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
    fn should_drain(&self) -> bool {
        self.drain.load(Ordering::SeqCst)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_closes_listener_and_spares_live_sessions() {
    let backend_addr: SocketAddr = "127.0.0.1:28490".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28489".parse().unwrap();
    common::start_echo_backend(backend_addr).await;

    let forwarder = Forwarder::new(
        proxy_addr.to_string(),
        backend_addr.to_string(),
        None,
        Duration::from_secs(2),
    );
    let policy = Arc::new(GatePolicy::new());
    let shutdown = Shutdown::new();

    let runner = {
        let policy_concrete: Arc<GatePolicy> = Arc::clone(&policy);
        let policy: Arc<dyn AdmissionPolicy> = policy_concrete;
        let rx = shutdown.subscribe();
        tokio::spawn(async move { forwarder.run(policy, rx).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Establish a session before drain.
    let mut held = TcpStream::connect(proxy_addr).await.unwrap();
    held.write_all(b"pre").await.unwrap();
    let mut got = [0u8; 3];
    held.read_exact(&mut got).await.unwrap();

    policy.drain.store(true, Ordering::SeqCst);
    assert!(
        common::wait_until(
            || {
                std::net::TcpStream::connect_timeout(&proxy_addr, Duration::from_millis(200))
                    .is_err()
            },
            Duration::from_secs(5)
        )
        .await,
        "drain refuses new connections at the socket layer"
    );

    // The established pair keeps forwarding through the drain.
    held.write_all(b"mid").await.unwrap();
    held.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"mid");

    policy.drain.store(false, Ordering::SeqCst);
    assert!(
        common::wait_until(
            || std::net::TcpStream::connect_timeout(&proxy_addr, Duration::from_millis(200)).is_ok(),
            Duration::from_secs(6)
        )
        .await,
        "listener reopens once drain clears"
    );

    drop(held);
    assert!(
        common::wait_until(|| policy.released.load(Ordering::SeqCst) >= 1, Duration::from_secs(2)).await,
        "session released after close"
    );

    shutdown.trigger();
    runner.await.unwrap().unwrap();
}
