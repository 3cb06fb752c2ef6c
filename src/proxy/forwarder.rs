//! Accept loop with drain gating and adaptive backoff.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::proxy::session::{self, BufferPool};
use crate::proxy::AdmissionPolicy;

/// Pause before re-checking drain state or retrying a failed bind.
const REOPEN_BACKOFF: Duration = Duration::from_secs(2);

/// Pause after a transient accept error.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Error type for forwarder operations.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Single-backend TCP forwarder.
///
/// [`Forwarder::run`] blocks until shutdown. Each accepted socket runs
/// in its own task: an admission decision, then a backend dial, then a
/// bidirectional copy pair.
pub struct Forwarder {
    listen_addr: String,
    backend_addr: Arc<str>,
    idle_timeout: Option<Duration>,
    dial_timeout: Duration,
    pool: Arc<BufferPool>,
    rejects: Arc<RejectWindow>,
}

impl Forwarder {
    pub fn new(
        listen_addr: String,
        backend_addr: String,
        idle_timeout: Option<Duration>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            listen_addr,
            backend_addr: backend_addr.into(),
            idle_timeout,
            dial_timeout,
            pool: Arc::new(BufferPool::new(session::BUFFER_SIZE)),
            rejects: Arc::new(RejectWindow::new()),
        }
    }

    /// Accept and forward connections until `shutdown` fires.
    ///
    /// The initial bind failure is fatal; listener failures after that
    /// are retried with a fixed backoff. Returns `Ok(())` on shutdown.
    pub async fn run(
        &self,
        policy: Arc<dyn AdmissionPolicy>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ForwarderError> {
        let mut listener = Some(self.bind().await?);
        tracing::info!(
            listen_addr = %self.listen_addr,
            backend_addr = %self.backend_addr,
            "forwarder listening"
        );

        loop {
            // Drain gate: while draining, keep the listen socket closed
            // so hostile floods are refused at the kernel and no
            // global_limit storm reaches the limiter.
            if policy.should_drain() {
                if listener.take().is_some() {
                    tracing::warn!("drain engaged, listener closed");
                }
                self.rejects.reset();
                if !sleep_or_shutdown(&mut shutdown, REOPEN_BACKOFF).await {
                    return Ok(());
                }
                if !policy.should_drain() {
                    match self.bind().await {
                        Ok(l) => {
                            listener = Some(l);
                            tracing::info!("drain released, listener reopened");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "listener reopen failed, retrying");
                            if !sleep_or_shutdown(&mut shutdown, REOPEN_BACKOFF).await {
                                return Ok(());
                            }
                        }
                    }
                }
                continue;
            }

            // Under a pure-reject flood, slow the accept loop down to
            // protect CPU.
            if let Some(delay) = self.rejects.backoff_delay() {
                if !sleep_or_shutdown(&mut shutdown, delay).await {
                    return Ok(());
                }
            }

            let active = match listener.as_ref() {
                Some(l) => l,
                None => {
                    match self.bind().await {
                        Ok(l) => {
                            listener = Some(l);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "listener rebind failed, retrying");
                            if !sleep_or_shutdown(&mut shutdown, REOPEN_BACKOFF).await {
                                return Ok(());
                            }
                        }
                    }
                    continue;
                }
            };

            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                accepted = active.accept() => match accepted {
                    Ok((stream, peer)) => {
                        // Task boundary isolates handler panics from the
                        // accept loop.
                        tokio::spawn(session::handle_conn(
                            stream,
                            peer,
                            Arc::clone(&self.backend_addr),
                            self.idle_timeout,
                            self.dial_timeout,
                            Arc::clone(&self.pool),
                            Arc::clone(&policy),
                            Arc::clone(&self.rejects),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        if !sleep_or_shutdown(&mut shutdown, ACCEPT_RETRY).await {
                            return Ok(());
                        }
                    }
                },
            }
        }
    }

    async fn bind(&self) -> Result<TcpListener, ForwarderError> {
        TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ForwarderError::Bind {
                addr: self.listen_addr.clone(),
                source,
            })
    }
}

/// Sleep for `dur`, returning false if shutdown fires first.
async fn sleep_or_shutdown(shutdown: &mut broadcast::Receiver<()>, dur: Duration) -> bool {
    tokio::select! {
        _ = shutdown.recv() => false,
        _ = tokio::time::sleep(dur) => true,
    }
}

/// Sliding one-second reject counter driving the accept-loop backoff.
///
/// Rejects increment; a finished forwarded session decrements (floor 0),
/// giving mild recovery pressure. The count resets one second after the
/// last reset, on read.
pub(crate) struct RejectWindow {
    inner: Mutex<WindowState>,
}

struct WindowState {
    count: u32,
    last_reset: Instant,
}

impl RejectWindow {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(WindowState {
                count: 0,
                last_reset: Instant::now(),
            }),
        }
    }

    pub(crate) fn record_reject(&self) {
        let mut w = self.inner.lock().expect("reject window lock poisoned");
        w.count += 1;
    }

    pub(crate) fn record_session_end(&self) {
        let mut w = self.inner.lock().expect("reject window lock poisoned");
        if w.count > 0 {
            w.count -= 1;
        }
    }

    pub(crate) fn reset(&self) {
        let mut w = self.inner.lock().expect("reject window lock poisoned");
        w.count = 0;
        w.last_reset = Instant::now();
    }

    pub(crate) fn backoff_delay(&self) -> Option<Duration> {
        let mut w = self.inner.lock().expect("reject window lock poisoned");
        let now = Instant::now();
        if now.duration_since(w.last_reset) >= Duration::from_secs(1) {
            w.count = 0;
            w.last_reset = now;
        }
        match w.count {
            c if c > 100 => Some(Duration::from_millis(100)),
            c if c > 50 => Some(Duration::from_millis(50)),
            c if c > 20 => Some(Duration::from_millis(10)),
            _ => None,
        }
    }
}
