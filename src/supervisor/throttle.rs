//! Per-IP log throttling, so a flooding peer cannot spam the log.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Sweep threshold: beyond this many tracked IPs, stale entries are
/// dropped on the next insert, bounding memory under flood.
const SWEEP_ABOVE: usize = 10_000;

/// Allows at most one log line per IP per window.
pub struct IpLogThrottle {
    last_at: DashMap<IpAddr, Instant>,
    window: Duration,
}

impl IpLogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            last_at: DashMap::new(),
            window,
        }
    }

    /// Whether a log line for `ip` may be emitted now.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_at.get(&ip) {
            if now.duration_since(*last) < self.window {
                return false;
            }
        }
        if self.last_at.len() > SWEEP_ABOVE {
            if let Some(cutoff) = now.checked_sub(self.window) {
                self.last_at.retain(|_, at| *at >= cutoff);
            }
        }
        self.last_at.insert(ip, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_log_within_window_suppressed() {
        let t = IpLogThrottle::new(Duration::from_secs(2));
        let ip: IpAddr = "10.9.0.1".parse().unwrap();
        assert!(t.allow(ip));
        assert!(!t.allow(ip));
    }

    #[test]
    fn distinct_ips_independent() {
        let t = IpLogThrottle::new(Duration::from_secs(2));
        assert!(t.allow("10.9.0.2".parse().unwrap()));
        assert!(t.allow("10.9.0.3".parse().unwrap()));
    }

    #[test]
    fn allows_again_after_window() {
        let t = IpLogThrottle::new(Duration::from_millis(10));
        let ip: IpAddr = "10.9.0.4".parse().unwrap();
        assert!(t.allow(ip));
        std::thread::sleep(Duration::from_millis(15));
        assert!(t.allow(ip));
    }
}
