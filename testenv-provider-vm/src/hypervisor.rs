//! The hypervisor control seam.
//!
//! One async trait covering everything the provider needs from the
//! host: domain and network lifecycle, DHCP leases, ARP-sourced
//! interface addresses and guest CPU time. The production
//! implementation shells out to `virsh`; tests swap in
//! [`FakeHypervisor`].

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub mac: String,
    pub ip: String,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceAddr {
    pub mac: String,
    pub ip: String,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn define_network(&self, xml: &str) -> Result<()>;
    async fn start_network(&self, name: &str) -> Result<()>;
    async fn destroy_network(&self, name: &str) -> Result<()>;
    async fn undefine_network(&self, name: &str) -> Result<()>;
    async fn network_exists(&self, name: &str) -> Result<bool>;
    async fn network_uuid(&self, name: &str) -> Result<Option<String>>;
    /// Current DHCP leases of a defined network.
    async fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>>;

    async fn define_domain(&self, xml: &str) -> Result<()>;
    async fn start_domain(&self, name: &str) -> Result<()>;
    async fn destroy_domain(&self, name: &str) -> Result<()>;
    async fn undefine_domain(&self, name: &str) -> Result<()>;
    async fn domain_exists(&self, name: &str) -> Result<bool>;
    async fn domain_uuid(&self, name: &str) -> Result<Option<String>>;
    async fn domain_xml(&self, name: &str) -> Result<String>;
    /// Total guest CPU time, used to confirm boot progress.
    async fn domain_cpu_time(&self, name: &str) -> Result<Option<Duration>>;
    /// Interface addresses resolved from the host ARP table.
    async fn domain_interface_addrs(&self, name: &str) -> Result<Vec<IfaceAddr>>;
}

/// `virsh`-backed hypervisor access.
pub struct Virsh {
    connect_uri: Option<String>,
}

impl Virsh {
    pub fn new(connect_uri: Option<String>) -> Self {
        Self { connect_uri }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut command = Command::new("virsh");
        if let Some(uri) = &self.connect_uri {
            command.arg("-c").arg(uri);
        }
        command.args(args);
        debug!(args = ?args, "virsh");
        Ok(command.output().await?)
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "virsh {} failed: {}",
                args.first().copied().unwrap_or("?"),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Write XML to a scratch file for the `define` commands.
    async fn with_xml_file(&self, xml: &str, command: &str) -> Result<()> {
        let path = std::env::temp_dir().join(format!("testenv-{}.xml", Uuid::new_v4()));
        tokio::fs::write(&path, xml).await?;
        let result = self
            .run_checked(&[command, path.to_str().ok_or_else(|| anyhow!("bad xml path"))?])
            .await;
        let _ = tokio::fs::remove_file(&path).await;
        result.map(|_| ())
    }
}

#[async_trait]
impl Hypervisor for Virsh {
    async fn define_network(&self, xml: &str) -> Result<()> {
        self.with_xml_file(xml, "net-define").await
    }

    async fn start_network(&self, name: &str) -> Result<()> {
        self.run_checked(&["net-start", name]).await.map(|_| ())
    }

    async fn destroy_network(&self, name: &str) -> Result<()> {
        self.run_checked(&["net-destroy", name]).await.map(|_| ())
    }

    async fn undefine_network(&self, name: &str) -> Result<()> {
        self.run_checked(&["net-undefine", name]).await.map(|_| ())
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.run(&["net-info", name]).await?.status.success())
    }

    async fn network_uuid(&self, name: &str) -> Result<Option<String>> {
        let output = self.run(&["net-uuid", name]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let uuid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!uuid.is_empty()).then_some(uuid))
    }

    async fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>> {
        let raw = self.run_checked(&["-q", "net-dhcp-leases", network]).await?;
        Ok(parse_dhcp_leases(&raw))
    }

    async fn define_domain(&self, xml: &str) -> Result<()> {
        self.with_xml_file(xml, "define").await
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        self.run_checked(&["start", name]).await.map(|_| ())
    }

    async fn destroy_domain(&self, name: &str) -> Result<()> {
        self.run_checked(&["destroy", name]).await.map(|_| ())
    }

    async fn undefine_domain(&self, name: &str) -> Result<()> {
        // --nvram also drops UEFI variable storage; harmless for BIOS
        // domains.
        self.run_checked(&["undefine", name, "--nvram"])
            .await
            .map(|_| ())
    }

    async fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.run(&["dominfo", name]).await?.status.success())
    }

    async fn domain_uuid(&self, name: &str) -> Result<Option<String>> {
        let output = self.run(&["domuuid", name]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let uuid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!uuid.is_empty()).then_some(uuid))
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        self.run_checked(&["dumpxml", name]).await
    }

    async fn domain_cpu_time(&self, name: &str) -> Result<Option<Duration>> {
        let raw = self.run_checked(&["domstats", name, "--cpu-total"]).await?;
        Ok(parse_cpu_time(&raw))
    }

    async fn domain_interface_addrs(&self, name: &str) -> Result<Vec<IfaceAddr>> {
        let raw = self
            .run_checked(&["-q", "domifaddr", name, "--source", "arp"])
            .await?;
        Ok(parse_iface_addrs(&raw))
    }
}

/// Parse `virsh -q net-dhcp-leases` output: expiry date, expiry time,
/// MAC, protocol, IP/prefix, hostname, client id.
fn parse_dhcp_leases(raw: &str) -> Vec<DhcpLease> {
    raw.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            let ip = fields[4].split('/').next()?.to_string();
            let hostname = fields
                .get(5)
                .filter(|h| **h != "-")
                .map(|h| h.to_string());
            Some(DhcpLease {
                mac: fields[2].to_ascii_lowercase(),
                ip,
                hostname,
            })
        })
        .collect()
}

/// Parse `virsh -q domifaddr --source arp`: name, MAC, protocol,
/// address/prefix.
fn parse_iface_addrs(raw: &str) -> Vec<IfaceAddr> {
    raw.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some(IfaceAddr {
                mac: fields[1].to_ascii_lowercase(),
                ip: fields[3].split('/').next()?.to_string(),
            })
        })
        .collect()
}

/// Pull `cpu.time=<ns>` out of `virsh domstats --cpu-total`.
fn parse_cpu_time(raw: &str) -> Option<Duration> {
    raw.lines()
        .find_map(|line| line.trim().strip_prefix("cpu.time="))
        .and_then(|ns| ns.trim().parse::<u64>().ok())
        .map(Duration::from_nanos)
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted hypervisor for unit tests.

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::{DhcpLease, Hypervisor, IfaceAddr};

    #[derive(Default)]
    pub struct FakeState {
        pub networks: HashMap<String, String>,
        pub active_networks: HashSet<String>,
        pub domains: HashMap<String, String>,
        pub running_domains: HashSet<String>,
        pub leases: HashMap<String, Vec<DhcpLease>>,
        pub arp: HashMap<String, Vec<IfaceAddr>>,
        pub cpu_ticks: u64,
        pub fail_network_start: bool,
        pub fail_domain_start: bool,
        /// When set, starting a domain registers a DHCP lease for its
        /// MAC at this address.
        pub auto_lease_ip: Option<String>,
        /// Every mutation, for idempotency assertions.
        pub log: Vec<String>,
    }

    #[derive(Default)]
    pub struct FakeHypervisor {
        pub state: Mutex<FakeState>,
    }

    impl FakeHypervisor {
        pub fn new() -> Self {
            Self::default()
        }

        fn xml_name(xml: &str) -> String {
            xml.split("<name>")
                .nth(1)
                .and_then(|rest| rest.split("</name>").next())
                .unwrap_or("unknown")
                .to_string()
        }

        /// Hand out `ip` to whichever domain starts next; keeps tests
        /// independent of the randomly generated MAC.
        pub fn auto_lease(&self, ip: &str) {
            self.state.lock().unwrap().auto_lease_ip = Some(ip.to_string());
        }

        fn xml_attr(xml: &str, prefix: &str) -> Option<String> {
            xml.split(prefix)
                .nth(1)
                .and_then(|rest| rest.split('\'').next())
                .map(|value| value.to_string())
        }

        pub fn add_lease(&self, network: &str, mac: &str, ip: &str) {
            self.state
                .lock()
                .unwrap()
                .leases
                .entry(network.to_string())
                .or_default()
                .push(DhcpLease {
                    mac: mac.to_ascii_lowercase(),
                    ip: ip.to_string(),
                    hostname: None,
                });
        }

        pub fn seed_domain(&self, name: &str) {
            let mut state = self.state.lock().unwrap();
            state
                .domains
                .insert(name.to_string(), format!("<domain><name>{name}</name></domain>"));
            state.running_domains.insert(name.to_string());
        }

        pub fn log(&self) -> Vec<String> {
            self.state.lock().unwrap().log.clone()
        }
    }

    #[async_trait]
    impl Hypervisor for FakeHypervisor {
        async fn define_network(&self, xml: &str) -> Result<()> {
            let name = Self::xml_name(xml);
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("net-define {name}"));
            state.networks.insert(name, xml.to_string());
            Ok(())
        }

        async fn start_network(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("net-start {name}"));
            if state.fail_network_start {
                bail!("virsh net-start failed: injected");
            }
            if !state.networks.contains_key(name) {
                bail!("network {name} not defined");
            }
            state.active_networks.insert(name.to_string());
            Ok(())
        }

        async fn destroy_network(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("net-destroy {name}"));
            if !state.active_networks.remove(name) {
                bail!("network {name} not active");
            }
            Ok(())
        }

        async fn undefine_network(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("net-undefine {name}"));
            if state.networks.remove(name).is_none() {
                bail!("network {name} not defined");
            }
            Ok(())
        }

        async fn network_exists(&self, name: &str) -> Result<bool> {
            Ok(self.state.lock().unwrap().networks.contains_key(name))
        }

        async fn network_uuid(&self, _name: &str) -> Result<Option<String>> {
            Ok(Some("9b2c7a3e-0000-4000-8000-000000000001".to_string()))
        }

        async fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .leases
                .get(network)
                .cloned()
                .unwrap_or_default())
        }

        async fn define_domain(&self, xml: &str) -> Result<()> {
            let name = Self::xml_name(xml);
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("define {name}"));
            state.domains.insert(name, xml.to_string());
            Ok(())
        }

        async fn start_domain(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("start {name}"));
            if state.fail_domain_start {
                bail!("virsh start failed: injected");
            }
            let Some(xml) = state.domains.get(name).cloned() else {
                bail!("domain {name} not defined");
            };
            state.running_domains.insert(name.to_string());
            if let Some(ip) = state.auto_lease_ip.clone() {
                let mac = Self::xml_attr(&xml, "<mac address='");
                let network = Self::xml_attr(&xml, "<source network='");
                if let (Some(mac), Some(network)) = (mac, network) {
                    state.leases.entry(network).or_default().push(DhcpLease {
                        mac: mac.to_ascii_lowercase(),
                        ip,
                        hostname: None,
                    });
                }
            }
            Ok(())
        }

        async fn destroy_domain(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("destroy {name}"));
            if !state.running_domains.remove(name) {
                bail!("domain {name} not running");
            }
            Ok(())
        }

        async fn undefine_domain(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("undefine {name}"));
            if state.domains.remove(name).is_none() {
                bail!("domain {name} not defined");
            }
            Ok(())
        }

        async fn domain_exists(&self, name: &str) -> Result<bool> {
            Ok(self.state.lock().unwrap().domains.contains_key(name))
        }

        async fn domain_uuid(&self, _name: &str) -> Result<Option<String>> {
            Ok(Some("9b2c7a3e-0000-4000-8000-000000000002".to_string()))
        }

        async fn domain_xml(&self, name: &str) -> Result<String> {
            match self.state.lock().unwrap().domains.get(name) {
                Some(xml) => Ok(xml.clone()),
                None => bail!("domain {name} not defined"),
            }
        }

        async fn domain_cpu_time(&self, _name: &str) -> Result<Option<Duration>> {
            // Advances on every sample so boot verification always sees
            // progress.
            let mut state = self.state.lock().unwrap();
            state.cpu_ticks += 2;
            Ok(Some(Duration::from_secs(state.cpu_ticks)))
        }

        async fn domain_interface_addrs(&self, name: &str) -> Result<Vec<IfaceAddr>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .arp
                .get(name)
                .cloned()
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dhcp_lease_table() {
        let raw = " 2031-01-01 10:30:00   52:54:00:AA:bb:cc   ipv4   192.168.100.37/24   node-0   01:52:54:00:aa:bb:cc\n\
                    2031-01-01 10:31:00   52:54:00:11:22:33   ipv4   192.168.100.38/24   -       -\n";
        let leases = parse_dhcp_leases(raw);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].mac, "52:54:00:aa:bb:cc");
        assert_eq!(leases[0].ip, "192.168.100.37");
        assert_eq!(leases[0].hostname.as_deref(), Some("node-0"));
        assert_eq!(leases[1].hostname, None);
    }

    #[test]
    fn parses_domifaddr_output() {
        let raw = " vnet0      52:54:00:aa:bb:cc    ipv4         192.168.100.37/24\n";
        let addrs = parse_iface_addrs(raw);
        assert_eq!(
            addrs,
            vec![IfaceAddr {
                mac: "52:54:00:aa:bb:cc".into(),
                ip: "192.168.100.37".into()
            }]
        );
    }

    #[test]
    fn parses_cpu_time_from_domstats() {
        let raw = "Domain: 'v'\n  state.state=1\n  cpu.time=4029691339\n  cpu.user=123\n";
        assert_eq!(parse_cpu_time(raw), Some(Duration::from_nanos(4029691339)));
        assert_eq!(parse_cpu_time("Domain: 'v'\n"), None);
    }
}
