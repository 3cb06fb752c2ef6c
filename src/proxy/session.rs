//! Per-connection forwarding: admission, backend dial, copy pair.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::limiter::RejectReason;
use crate::proxy::forwarder::RejectWindow;
use crate::proxy::AdmissionPolicy;

/// Copy buffer size per direction.
pub(crate) const BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on idle buffers retained by the pool.
const POOL_MAX_IDLE: usize = 256;

/// Shared pool of copy buffers, two per live session.
pub(crate) struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    buf_size: usize,
}

impl BufferPool {
    pub(crate) fn new(buf_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buf_size,
        }
    }

    pub(crate) fn take(&self) -> Box<[u8]> {
        let recycled = self.free.lock().expect("buffer pool lock poisoned").pop();
        recycled.unwrap_or_else(|| vec![0u8; self.buf_size].into_boxed_slice())
    }

    pub(crate) fn put(&self, buf: Box<[u8]>) {
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        if free.len() < POOL_MAX_IDLE {
            free.push(buf);
        }
    }
}

/// Calls `on_release` exactly once when the session ends, however the
/// handler exits.
struct ReleaseGuard {
    policy: Arc<dyn AdmissionPolicy>,
    ip: IpAddr,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.policy.on_release(self.ip);
    }
}

/// Handle one accepted client socket end to end.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn handle_conn(
    client: TcpStream,
    peer: SocketAddr,
    backend_addr: Arc<str>,
    idle_timeout: Option<Duration>,
    dial_timeout: Duration,
    pool: Arc<BufferPool>,
    policy: Arc<dyn AdmissionPolicy>,
    rejects: Arc<RejectWindow>,
) {
    let ip = peer.ip();

    if let Err(reason) = policy.try_accept(ip) {
        policy.on_reject(ip, reason);
        rejects.record_reject();
        return;
    }

    let _release = ReleaseGuard {
        policy: Arc::clone(&policy),
        ip,
    };
    policy.on_accept(ip);

    let backend =
        match tokio::time::timeout(dial_timeout, TcpStream::connect(backend_addr.as_ref())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(backend = %backend_addr, error = %e, "backend dial failed");
                policy.on_reject(ip, RejectReason::BackendFail);
                rejects.record_reject();
                return;
            }
            Err(_) => {
                tracing::debug!(backend = %backend_addr, "backend dial timed out");
                policy.on_reject(ip, RejectReason::BackendFail);
                rejects.record_reject();
                return;
            }
        };

    // Keep-alive detects dead peers; the per-op deadlines below only
    // bound in-flight I/O, so idle players keep their session.
    set_keepalive(&client);
    set_keepalive(&backend);

    let mut client_buf = pool.take();
    let mut backend_buf = pool.take();

    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let client_to_backend = pump(client_read, backend_write, idle_timeout, &mut client_buf);
    let backend_to_client = pump(backend_read, client_write, idle_timeout, &mut backend_buf);

    // The session ends when either direction does; dropping the other
    // copy future closes its socket halves and unblocks the peer.
    tokio::select! {
        _ = client_to_backend => {}
        _ = backend_to_client => {}
    }

    pool.put(client_buf);
    pool.put(backend_buf);
    rejects.record_session_end();
}

fn set_keepalive(stream: &TcpStream) {
    if let Err(e) = socket2::SockRef::from(stream).set_keepalive(true) {
        tracing::debug!(error = %e, "failed to enable tcp keep-alive");
    }
}

/// Copy bytes from `src` to `dst` until EOF or error, bounding every
/// read and write by `idle` when set.
async fn pump(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    idle: Option<Duration>,
    buf: &mut [u8],
) -> std::io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = match idle {
            Some(deadline) => tokio::time::timeout(deadline, src.read(buf))
                .await
                .map_err(|_| idle_expired("read"))??,
            None => src.read(buf).await?,
        };
        if n == 0 {
            break;
        }
        match idle {
            Some(deadline) => tokio::time::timeout(deadline, dst.write_all(&buf[..n]))
                .await
                .map_err(|_| idle_expired("write"))??,
            None => dst.write_all(&buf[..n]).await?,
        }
        total += n as u64;
    }
    let _ = dst.shutdown().await;
    Ok(total)
}

fn idle_expired(op: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("idle deadline expired during {op}"),
    )
}
