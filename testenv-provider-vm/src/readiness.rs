//! VM readiness: boot progress, IP resolution, SSH and cloud-init.
//!
//! Every wait loop checks cancellation between iterations. Timeouts
//! surface as `TIMEOUT` (retryable) when the caller asked for strict
//! readiness; best-effort callers just get `None`/`false` back.

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use testenv_proto::ProviderError;

use crate::cloudinit::BOOT_FINISHED_MARKER;
use crate::hypervisor::Hypervisor;

pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(180);
pub const BEST_EFFORT_IP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CLOUD_INIT_TIMEOUT: Duration = Duration::from_secs(300);

const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const IP_POLL_INTERVAL: Duration = Duration::from_secs(3);
const SSH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CLOUD_INIT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SSH_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Require more than one second of guest CPU advancement within the
/// window. Returns whether progress was observed.
pub async fn wait_for_boot(
    hv: &dyn Hypervisor,
    domain: &str,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    let baseline = hv.domain_cpu_time(domain).await?.unwrap_or_default();
    let deadline = Instant::now() + window;
    loop {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        if let Some(current) = hv.domain_cpu_time(domain).await? {
            if current.saturating_sub(baseline) > Duration::from_secs(1) {
                debug!(domain, "guest cpu time advancing, boot in progress");
                return Ok(true);
            }
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(BOOT_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

/// Resolve the VM address: DHCP leases first, host ARP second, the
/// static netplan address as a last resort after the budget expires.
pub async fn resolve_ip(
    hv: &dyn Hypervisor,
    network: &str,
    domain: &str,
    mac: &str,
    budget: Duration,
    static_fallback: Option<String>,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let mac = mac.to_ascii_lowercase();
    let deadline = Instant::now() + budget;
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        match hv.dhcp_leases(network).await {
            Ok(leases) => {
                if let Some(lease) = leases.iter().find(|l| l.mac == mac) {
                    debug!(domain, ip = %lease.ip, "address from dhcp lease");
                    return Ok(Some(lease.ip.clone()));
                }
            }
            Err(e) => debug!(domain, error = %e, "lease query failed"),
        }
        match hv.domain_interface_addrs(domain).await {
            Ok(addrs) => {
                if let Some(addr) = addrs.iter().find(|a| a.mac == mac) {
                    debug!(domain, ip = %addr.ip, "address from arp table");
                    return Ok(Some(addr.ip.clone()));
                }
            }
            Err(e) => debug!(domain, error = %e, "arp query failed"),
        }
        if Instant::now() >= deadline {
            if let Some(ip) = static_fallback {
                debug!(domain, ip = %ip, "falling back to static netplan address");
                return Ok(Some(ip));
            }
            return Ok(None);
        }
        sleep(IP_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

/// One TCP dial with a bounded timeout.
pub async fn probe_tcp(ip: &str, port: u16, timeout: Duration) -> bool {
    let address = format!("{ip}:{port}");
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&address)).await,
        Ok(Ok(_))
    )
}

/// Poll a TCP port until it accepts or the budget runs out.
pub async fn wait_for_tcp(
    ip: &str,
    port: u16,
    budget: Duration,
    cancel: &CancellationToken,
) -> Result<(), ProviderError> {
    let started = Instant::now();
    let deadline = started + budget;
    loop {
        if probe_tcp(ip, port, TCP_PROBE_TIMEOUT).await {
            return Ok(());
        }
        if cancel.is_cancelled() || Instant::now() >= deadline {
            return Err(ProviderError::timeout(format!(
                "tcp readiness not reached for {ip}:{port} after {}s",
                started.elapsed().as_secs()
            ))
            .with_detail("ip", ip)
            .with_detail("port", port.to_string()));
        }
        sleep(SSH_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

/// Run one command over SSH, blocking. Returns the exit status.
fn ssh_exec_blocking(
    addr: SocketAddr,
    user: &str,
    private_key: &Path,
    command: &str,
) -> Result<i32> {
    let tcp = TcpStream::connect_timeout(&addr, TCP_PROBE_TIMEOUT)
        .with_context(|| format!("tcp connect to {addr}"))?;
    tcp.set_read_timeout(Some(SSH_IO_TIMEOUT))?;
    tcp.set_write_timeout(Some(SSH_IO_TIMEOUT))?;

    let mut session = ssh2::Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake().context("ssh handshake")?;
    session
        .userauth_pubkey_file(user, None, private_key, None)
        .context("ssh public key auth")?;

    let mut channel = session.channel_session()?;
    channel.exec(command).context("ssh exec")?;
    let mut output = String::new();
    channel.read_to_string(&mut output)?;
    channel.wait_close()?;
    Ok(channel.exit_status()?)
}

async fn ssh_exec(
    ip: &str,
    user: &str,
    private_key: &Path,
    command: &str,
) -> Result<i32> {
    let addr: SocketAddr = format!("{ip}:22")
        .parse()
        .map_err(|e| anyhow!("bad ssh address {ip}: {e}"))?;
    let user = user.to_string();
    let key = PathBuf::from(private_key);
    let command = command.to_string();
    tokio::task::spawn_blocking(move || ssh_exec_blocking(addr, &user, &key, &command))
        .await
        .map_err(|e| anyhow!("ssh task panicked: {e}"))?
}

fn readiness_timeout(
    what: &str,
    user: &str,
    ip: &str,
    private_key: &Path,
    elapsed: Duration,
) -> ProviderError {
    ProviderError::timeout(format!(
        "{what} readiness not reached for {user}@{ip} (key {}) after {}s",
        private_key.display(),
        elapsed.as_secs()
    ))
    .with_detail("user", user)
    .with_detail("ip", ip)
    .with_detail("privateKey", private_key.display().to_string())
    .with_detail("elapsedSecs", elapsed.as_secs().to_string())
}

/// TCP-probe port 22 then poll an SSH sentinel command until the budget
/// runs out.
pub async fn wait_for_ssh(
    ip: &str,
    user: &str,
    private_key: &Path,
    budget: Duration,
    cancel: &CancellationToken,
) -> Result<(), ProviderError> {
    let started = Instant::now();
    let deadline = started + budget;

    while !probe_tcp(ip, 22, TCP_PROBE_TIMEOUT).await {
        if cancel.is_cancelled() || Instant::now() >= deadline {
            return Err(readiness_timeout("ssh", user, ip, private_key, started.elapsed()));
        }
        sleep(SSH_POLL_INTERVAL).await;
    }

    loop {
        if cancel.is_cancelled() {
            return Err(readiness_timeout("ssh", user, ip, private_key, started.elapsed()));
        }
        match ssh_exec(ip, user, private_key, "true").await {
            Ok(0) => {
                debug!(ip, user, "ssh ready");
                return Ok(());
            }
            Ok(status) => debug!(ip, status, "ssh sentinel returned non-zero"),
            Err(e) => debug!(ip, error = %e, "ssh not ready yet"),
        }
        if Instant::now() >= deadline {
            return Err(readiness_timeout("ssh", user, ip, private_key, started.elapsed()));
        }
        sleep(SSH_POLL_INTERVAL).await;
    }
}

/// Wait for cloud-init to finish: `cloud-init status --wait` under a
/// 60 second cap, falling back to the boot-finished marker.
pub async fn wait_for_cloud_init(
    ip: &str,
    user: &str,
    private_key: &Path,
    budget: Duration,
    cancel: &CancellationToken,
) -> Result<(), ProviderError> {
    let started = Instant::now();
    let deadline = started + budget;
    let command = format!(
        "timeout 60 cloud-init status --wait >/dev/null 2>&1 || test -f {BOOT_FINISHED_MARKER}"
    );

    loop {
        if cancel.is_cancelled() {
            return Err(readiness_timeout(
                "cloud-init",
                user,
                ip,
                private_key,
                started.elapsed(),
            ));
        }
        match ssh_exec(ip, user, private_key, &command).await {
            Ok(0) => {
                debug!(ip, "cloud-init finished");
                return Ok(());
            }
            Ok(status) => debug!(ip, status, "cloud-init still running"),
            Err(e) => warn!(ip, error = %e, "cloud-init probe failed"),
        }
        if Instant::now() >= deadline {
            return Err(readiness_timeout(
                "cloud-init",
                user,
                ip,
                private_key,
                started.elapsed(),
            ));
        }
        sleep(CLOUD_INIT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::FakeHypervisor;

    #[tokio::test]
    async fn boot_progress_is_detected() {
        let hv = FakeHypervisor::new();
        // FakeHypervisor advances cpu time on every sample.
        let progressed = wait_for_boot(
            &hv,
            "v",
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(progressed);
    }

    #[tokio::test]
    async fn ip_comes_from_dhcp_lease() {
        let hv = FakeHypervisor::new();
        hv.add_lease("n", "52:54:00:AA:bb:cc", "192.168.100.37");
        let ip = resolve_ip(
            &hv,
            "n",
            "v",
            "52:54:00:aa:BB:CC",
            Duration::from_secs(5),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.100.37"));
    }

    #[tokio::test]
    async fn static_fallback_applies_after_budget() {
        let hv = FakeHypervisor::new();
        let ip = resolve_ip(
            &hv,
            "n",
            "v",
            "52:54:00:00:00:01",
            Duration::from_millis(50),
            Some("192.168.100.50".into()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.100.50"));
    }

    #[tokio::test]
    async fn missing_lease_without_fallback_is_none() {
        let hv = FakeHypervisor::new();
        let ip = resolve_ip(
            &hv,
            "n",
            "v",
            "52:54:00:00:00:01",
            Duration::from_millis(50),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(ip, None);
    }

    #[tokio::test]
    async fn tcp_probe_fails_fast_on_closed_port() {
        // Reserved TEST-NET-1 address, nothing listens there.
        assert!(!probe_tcp("192.0.2.1", 22, Duration::from_millis(100)).await);
    }

    #[test]
    fn timeout_error_mentions_debugging_context() {
        let err = readiness_timeout(
            "ssh",
            "ubuntu",
            "192.168.100.37",
            Path::new("/state/keys/vm-ssh"),
            Duration::from_secs(180),
        );
        assert_eq!(err.code, testenv_proto::ErrorCode::Timeout);
        assert!(err.retryable);
        assert!(err.message.contains("ubuntu@192.168.100.37"));
        assert!(err.message.contains("/state/keys/vm-ssh"));
        assert!(err.message.contains("180"));
    }
}
