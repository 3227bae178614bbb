//! Libvirt domain XML generation.

use std::path::PathBuf;

use rand::Rng;
use uuid::Uuid;

use testenv_proto::spec::VmSpec;

pub const DEFAULT_MEMORY_MB: u64 = 2048;
pub const DEFAULT_VCPUS: u32 = 2;
pub const DEFAULT_ARCHITECTURE: &str = "x86_64";

/// Everything needed to render and track one domain.
#[derive(Debug, Clone)]
pub struct DomainPlan {
    pub name: String,
    pub uuid: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub architecture: String,
    pub machine_type: String,
    pub mac: String,
    pub network: String,
    pub disk_path: PathBuf,
    pub cloudinit_iso: PathBuf,
}

/// Locally administered MAC in the KVM OUI.
pub fn generate_mac() -> String {
    let tail: [u8; 3] = rand::thread_rng().gen();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", tail[0], tail[1], tail[2])
}

pub fn build_plan(
    name: &str,
    spec: &VmSpec,
    network: &str,
    disk_path: PathBuf,
    cloudinit_iso: PathBuf,
) -> DomainPlan {
    DomainPlan {
        name: name.to_string(),
        uuid: Uuid::new_v4().to_string(),
        memory_mb: spec.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
        vcpus: spec.vcpus.unwrap_or(DEFAULT_VCPUS),
        architecture: spec
            .architecture
            .clone()
            .unwrap_or_else(|| DEFAULT_ARCHITECTURE.to_string()),
        machine_type: spec.machine_type.clone().unwrap_or_else(|| "q35".to_string()),
        mac: generate_mac(),
        network: network.to_string(),
        disk_path,
        cloudinit_iso,
    }
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
}

fn boot_dev(entry: &str) -> &'static str {
    match entry {
        "network" | "pxe" => "network",
        "cdrom" => "cdrom",
        _ => "hd",
    }
}

/// Render the `<domain>` definition.
pub fn domain_xml(plan: &DomainPlan, spec: &VmSpec) -> String {
    let boot = spec.boot.clone().unwrap_or_default();
    let console = spec.console.clone().unwrap_or_default();
    let uefi = boot.firmware.as_deref() == Some("uefi");
    let network_boot = boot.order.iter().any(|e| boot_dev(e) == "network");

    let mut xml = String::new();
    xml.push_str("<domain type='kvm'>\n");
    xml.push_str(&format!("  <name>{}</name>\n", xml_escape(&plan.name)));
    xml.push_str(&format!("  <uuid>{}</uuid>\n", plan.uuid));
    xml.push_str(&format!(
        "  <memory unit='MiB'>{}</memory>\n",
        plan.memory_mb
    ));
    xml.push_str(&format!(
        "  <currentMemory unit='MiB'>{}</currentMemory>\n",
        plan.memory_mb
    ));
    if spec.memory_backing.as_deref() == Some("hugepages") {
        xml.push_str("  <memoryBacking>\n    <hugepages/>\n  </memoryBacking>\n");
    }
    xml.push_str(&format!(
        "  <vcpu placement='static'>{}</vcpu>\n",
        plan.vcpus
    ));

    xml.push_str("  <os>\n");
    xml.push_str(&format!(
        "    <type arch='{}' machine='{}'>hvm</type>\n",
        xml_escape(&plan.architecture),
        xml_escape(&plan.machine_type)
    ));
    if uefi {
        let secure = if boot.secure_boot { "yes" } else { "no" };
        if let Some(firmware) = &boot.firmware_image_path {
            xml.push_str(&format!(
                "    <loader readonly='yes' secure='{secure}' type='pflash'>{}</loader>\n",
                xml_escape(firmware)
            ));
        }
        if let Some(nvram) = &boot.nvram_template_path {
            xml.push_str(&format!(
                "    <nvram template='{}'/>\n",
                xml_escape(nvram)
            ));
        }
    }
    if boot.order.is_empty() {
        xml.push_str("    <boot dev='hd'/>\n");
    } else {
        for entry in &boot.order {
            xml.push_str(&format!("    <boot dev='{}'/>\n", boot_dev(entry)));
        }
    }
    xml.push_str("  </os>\n");

    xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n  </features>\n");

    let cpu = spec.cpu.clone().unwrap_or_default();
    let mode = cpu.mode.clone().unwrap_or_else(|| "host-passthrough".to_string());
    match (&cpu.model, cpu.sockets, cpu.cores) {
        (None, None, None) => {
            xml.push_str(&format!("  <cpu mode='{}'/>\n", xml_escape(&mode)));
        }
        _ => {
            xml.push_str(&format!("  <cpu mode='{}'>\n", xml_escape(&mode)));
            if let Some(model) = &cpu.model {
                xml.push_str(&format!(
                    "    <model fallback='allow'>{}</model>\n",
                    xml_escape(model)
                ));
            }
            if cpu.sockets.is_some() || cpu.cores.is_some() {
                xml.push_str(&format!(
                    "    <topology sockets='{}' cores='{}' threads='1'/>\n",
                    cpu.sockets.unwrap_or(1),
                    cpu.cores.unwrap_or(plan.vcpus)
                ));
            }
            xml.push_str("  </cpu>\n");
        }
    }

    xml.push_str("  <clock offset='utc'/>\n");
    xml.push_str("  <on_poweroff>destroy</on_poweroff>\n");
    xml.push_str("  <on_reboot>restart</on_reboot>\n");
    xml.push_str("  <on_crash>destroy</on_crash>\n");

    xml.push_str("  <devices>\n");

    let disk_bus = spec.disk.bus.as_deref().unwrap_or("virtio");
    let cache = spec.disk.cache.as_deref().unwrap_or("none");
    xml.push_str("    <disk type='file' device='disk'>\n");
    xml.push_str(&format!(
        "      <driver name='qemu' type='qcow2' cache='{}'/>\n",
        xml_escape(cache)
    ));
    xml.push_str(&format!(
        "      <source file='{}'/>\n",
        xml_escape(&plan.disk_path.display().to_string())
    ));
    xml.push_str(&format!(
        "      <target dev='vda' bus='{}'/>\n",
        xml_escape(disk_bus)
    ));
    xml.push_str("    </disk>\n");

    xml.push_str("    <disk type='file' device='cdrom'>\n");
    xml.push_str("      <driver name='qemu' type='raw'/>\n");
    xml.push_str(&format!(
        "      <source file='{}'/>\n",
        xml_escape(&plan.cloudinit_iso.display().to_string())
    ));
    xml.push_str("      <target dev='sda' bus='sata'/>\n");
    xml.push_str("      <readonly/>\n");
    xml.push_str("    </disk>\n");

    xml.push_str("    <interface type='network'>\n");
    xml.push_str(&format!(
        "      <source network='{}'/>\n",
        xml_escape(&plan.network)
    ));
    xml.push_str(&format!("      <mac address='{}'/>\n", plan.mac));
    xml.push_str("      <model type='virtio'/>\n");
    if network_boot {
        // PXE boot ROM stays mapped for network boot entries.
        xml.push_str("      <rom bar='on'/>\n");
    }
    xml.push_str("    </interface>\n");

    for share in &spec.virtio_fs {
        xml.push_str("    <filesystem type='mount' accessmode='passthrough'>\n");
        xml.push_str("      <driver type='virtiofs'/>\n");
        xml.push_str(&format!(
            "      <source dir='{}'/>\n",
            xml_escape(&share.source)
        ));
        xml.push_str(&format!(
            "      <target dir='{}'/>\n",
            xml_escape(&share.tag)
        ));
        xml.push_str("    </filesystem>\n");
    }

    if console.serial {
        xml.push_str("    <serial type='pty'>\n      <target port='0'/>\n    </serial>\n");
        xml.push_str(
            "    <console type='pty'>\n      <target type='serial' port='0'/>\n    </console>\n",
        );
    }
    if console.vnc {
        match console.vnc_port {
            Some(port) => xml.push_str(&format!(
                "    <graphics type='vnc' port='{port}' autoport='no' listen='127.0.0.1'/>\n"
            )),
            None => xml.push_str(
                "    <graphics type='vnc' autoport='yes' listen='127.0.0.1'/>\n",
            ),
        }
    }

    if spec.guest_agent {
        xml.push_str("    <channel type='unix'>\n");
        xml.push_str("      <target type='virtio' name='org.qemu.guest_agent.0'/>\n");
        xml.push_str("    </channel>\n");
    }

    xml.push_str("    <memballoon model='virtio'/>\n");
    xml.push_str("  </devices>\n");
    xml.push_str("</domain>\n");
    xml
}

/// Pull the interface MAC back out of a domain definition.
pub fn extract_mac(xml: &str) -> Option<String> {
    xml.split("<mac address='")
        .nth(1)
        .and_then(|rest| rest.split('\'').next())
        .map(|mac| mac.to_ascii_lowercase())
}
