//! OS firewall rule commands.
//!
//! A rule is named by a fixed prefix plus the IP with separators dashed,
//! so removal is deterministic without parsing any command output. Exit
//! code and timeout are the only signals consumed.

use std::net::IpAddr;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// Fixed prefix for rules this proxy owns.
pub const RULE_PREFIX: &str = "GATEGUARD-AUTOBLOCK-";

/// Deterministic rule name for an IP.
pub fn rule_name(ip: IpAddr) -> String {
    let dashed = ip.to_string().replace(['.', ':'], "-");
    format!("{RULE_PREFIX}{dashed}")
}

/// Applies and removes inbound block rules on the host firewall.
#[async_trait]
pub trait RuleApplier: Send + Sync {
    /// Install an inbound block rule for `ip`.
    async fn add_rule(&self, ip: IpAddr) -> std::io::Result<()>;

    /// Remove the block rule for `ip`. The rule may already be gone;
    /// callers treat failures as non-fatal.
    async fn delete_rule(&self, ip: IpAddr) -> std::io::Result<()>;
}

/// Host firewall CLI: `netsh advfirewall` on Windows, `iptables` with a
/// comment match carrying the rule name elsewhere.
pub struct OsFirewall;

#[async_trait]
impl RuleApplier for OsFirewall {
    async fn add_rule(&self, ip: IpAddr) -> std::io::Result<()> {
        let name = rule_name(ip);
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("netsh");
            c.args([
                "advfirewall",
                "firewall",
                "add",
                "rule",
                &format!("name={name}"),
                "dir=in",
                "action=block",
                &format!("remoteip={ip}"),
                "enable=yes",
                "profile=any",
                "protocol=any",
            ]);
            c
        } else {
            let mut c = Command::new("iptables");
            c.args([
                "-I",
                "INPUT",
                "-s",
                &ip.to_string(),
                "-j",
                "DROP",
                "-m",
                "comment",
                "--comment",
                &name,
            ]);
            c
        };
        run_silent(&mut cmd).await
    }

    async fn delete_rule(&self, ip: IpAddr) -> std::io::Result<()> {
        let name = rule_name(ip);
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("netsh");
            c.args([
                "advfirewall",
                "firewall",
                "delete",
                "rule",
                &format!("name={name}"),
            ]);
            c
        } else {
            let mut c = Command::new("iptables");
            c.args([
                "-D",
                "INPUT",
                "-s",
                &ip.to_string(),
                "-j",
                "DROP",
                "-m",
                "comment",
                "--comment",
                &name,
            ]);
            c
        };
        run_silent(&mut cmd).await
    }
}

async fn run_silent(cmd: &mut Command) -> std::io::Result<()> {
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "firewall command exited with {status}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_name_dashes_ipv4() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(rule_name(ip), "GATEGUARD-AUTOBLOCK-203-0-113-7");
    }

    #[test]
    fn rule_name_dashes_ipv6() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(rule_name(ip), "GATEGUARD-AUTOBLOCK-2001-db8--1");
    }
}
