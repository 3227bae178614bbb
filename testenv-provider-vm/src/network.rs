//! Network planning and libvirt network XML generation.
//!
//! The bridge name is derived by hashing the logical network name into
//! an interface-name-compliant identifier; CIDR math fills in gateway,
//! netmask and a default DHCP range.

use std::net::Ipv4Addr;

use ipnet::{Ipv4Net, Ipv6Net};
use sha2::{Digest, Sha256};

use testenv_proto::spec::NetworkSpec;
use testenv_proto::ProviderError;

/// Stable, `tv-` prefixed bridge name, 15 bytes at most (the kernel
/// IFNAMSIZ limit).
pub fn bridge_name(logical: &str) -> String {
    let digest = Sha256::digest(logical.as_bytes());
    let hex: String = digest
        .iter()
        .take(6)
        .map(|b| format!("{b:02x}"))
        .collect();
    format!("tv-{hex}")
}

/// Everything derived from the spec before XML generation.
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    pub name: String,
    pub bridge: String,
    pub kind: String,
    pub cidr: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub dhcp_start: Option<Ipv4Addr>,
    pub dhcp_end: Option<Ipv4Addr>,
}

pub fn plan(name: &str, spec: &NetworkSpec) -> Result<NetworkPlan, ProviderError> {
    let cidr = match spec.cidr.as_deref() {
        Some(raw) => Some(raw.parse::<Ipv4Net>().map_err(|e| {
            ProviderError::invalid_spec(format!("network {name}: bad cidr {raw:?}: {e}"))
        })?),
        None => None,
    };

    let mut plan = NetworkPlan {
        name: name.to_string(),
        bridge: bridge_name(name),
        kind: spec.kind.clone(),
        cidr,
        gateway: None,
        netmask: None,
        dhcp_start: None,
        dhcp_end: None,
    };

    if let Some(net) = cidr {
        let base = u32::from(net.network());
        let broadcast = u32::from(net.broadcast());
        let gateway = match spec.gateway.as_deref() {
            Some(raw) => raw.parse().map_err(|e| {
                ProviderError::invalid_spec(format!("network {name}: bad gateway {raw:?}: {e}"))
            })?,
            None => Ipv4Addr::from(base + 1),
        };
        plan.gateway = Some(gateway);
        plan.netmask = Some(net.netmask());

        let dhcp = spec.dhcp.clone().unwrap_or_default();
        plan.dhcp_start = Some(match dhcp.range_start.as_deref() {
            Some(raw) => raw.parse().map_err(|e| {
                ProviderError::invalid_spec(format!("network {name}: bad dhcp start: {e}"))
            })?,
            None => Ipv4Addr::from(base + 2),
        });
        plan.dhcp_end = Some(match dhcp.range_end.as_deref() {
            Some(raw) => raw.parse().map_err(|e| {
                ProviderError::invalid_spec(format!("network {name}: bad dhcp end: {e}"))
            })?,
            None => Ipv4Addr::from(broadcast.saturating_sub(1)),
        });
    }

    Ok(plan)
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
}

/// Render the libvirt `<network>` definition for the declared kind.
pub fn network_xml(plan: &NetworkPlan, spec: &NetworkSpec) -> String {
    let dhcp = spec.dhcp.clone().unwrap_or_default();
    let needs_dnsmasq_options = !dhcp.dns_servers.is_empty()
        || spec
            .tftp
            .as_ref()
            .is_some_and(|t| t.efi_boot_file.is_some());

    let mut xml = String::new();
    if needs_dnsmasq_options {
        xml.push_str(
            "<network xmlns:dnsmasq='http://libvirt.org/schemas/network/dnsmasq/1.0'>\n",
        );
    } else {
        xml.push_str("<network>\n");
    }
    xml.push_str(&format!("  <name>{}</name>\n", xml_escape(&plan.name)));
    xml.push_str(&format!(
        "  <bridge name='{}' stp='on' delay='0'/>\n",
        plan.bridge
    ));
    if let Some(mtu) = spec.mtu {
        xml.push_str(&format!("  <mtu size='{mtu}'/>\n"));
    }

    // Forwarding per declared kind: nat masquerades, bridge routes,
    // isolated gets no forward element at all.
    match plan.kind.as_str() {
        "isolated" => {}
        "bridge" => xml.push_str("  <forward mode='route'/>\n"),
        _ => xml.push_str("  <forward mode='nat'/>\n"),
    }

    if let Some(dns) = &spec.dns {
        if !dns.forwarders.is_empty() || !dns.hosts.is_empty() {
            xml.push_str("  <dns>\n");
            for forwarder in &dns.forwarders {
                xml.push_str(&format!(
                    "    <forwarder addr='{}'/>\n",
                    xml_escape(forwarder)
                ));
            }
            for host in &dns.hosts {
                xml.push_str(&format!("    <host ip='{}'>\n", xml_escape(&host.ip)));
                for hostname in &host.hostnames {
                    xml.push_str(&format!(
                        "      <hostname>{}</hostname>\n",
                        xml_escape(hostname)
                    ));
                }
                xml.push_str("    </host>\n");
            }
            xml.push_str("  </dns>\n");
        }
    }

    if let (Some(gateway), Some(netmask)) = (plan.gateway, plan.netmask) {
        xml.push_str(&format!(
            "  <ip address='{gateway}' netmask='{netmask}'>\n"
        ));
        if let Some(tftp) = &spec.tftp {
            xml.push_str(&format!("    <tftp root='{}'/>\n", xml_escape(&tftp.root)));
        }
        if dhcp.enabled {
            xml.push_str("    <dhcp>\n");
            if let (Some(start), Some(end)) = (plan.dhcp_start, plan.dhcp_end) {
                xml.push_str(&format!(
                    "      <range start='{start}' end='{end}'/>\n"
                ));
            }
            for lease in &dhcp.static_leases {
                match &lease.hostname {
                    Some(hostname) => xml.push_str(&format!(
                        "      <host mac='{}' name='{}' ip='{}'/>\n",
                        xml_escape(&lease.mac),
                        xml_escape(hostname),
                        xml_escape(&lease.ip)
                    )),
                    None => xml.push_str(&format!(
                        "      <host mac='{}' ip='{}'/>\n",
                        xml_escape(&lease.mac),
                        xml_escape(&lease.ip)
                    )),
                }
            }
            if let Some(tftp) = &spec.tftp {
                if let Some(boot_file) = &tftp.boot_file {
                    match &dhcp.next_server {
                        Some(server) => xml.push_str(&format!(
                            "      <bootp file='{}' server='{}'/>\n",
                            xml_escape(boot_file),
                            xml_escape(server)
                        )),
                        None => xml.push_str(&format!(
                            "      <bootp file='{}'/>\n",
                            xml_escape(boot_file)
                        )),
                    }
                }
            }
            xml.push_str("    </dhcp>\n");
        }
        xml.push_str("  </ip>\n");
    }

    if let Some(ipv6) = &spec.ipv6 {
        if ipv6.enabled {
            if let Some(Ok(net)) = ipv6.cidr.as_deref().map(|c| c.parse::<Ipv6Net>()) {
                let address = ipv6
                    .gateway
                    .clone()
                    .unwrap_or_else(|| net_first_host(&net));
                xml.push_str(&format!(
                    "  <ip family='ipv6' address='{}' prefix='{}'/>\n",
                    xml_escape(&address),
                    net.prefix_len()
                ));
            }
        }
    }

    if needs_dnsmasq_options {
        xml.push_str("  <dnsmasq:options>\n");
        if !dhcp.dns_servers.is_empty() {
            xml.push_str(&format!(
                "    <dnsmasq:option value='dhcp-option=6,{}'/>\n",
                dhcp.dns_servers.join(",")
            ));
        }
        if let Some(efi) = spec.tftp.as_ref().and_then(|t| t.efi_boot_file.as_deref()) {
            xml.push_str(&format!(
                "    <dnsmasq:option value='dhcp-match=set:efi,option:client-arch,7'/>\n    <dnsmasq:option value='dhcp-boot=tag:efi,{}'/>\n",
                xml_escape(efi)
            ));
        }
        xml.push_str("  </dnsmasq:options>\n");
    }

    xml.push_str("</network>\n");
    xml
}

fn net_first_host(net: &Ipv6Net) -> String {
    let base = u128::from(net.network());
    std::net::Ipv6Addr::from(base + 1).to_string()
}
