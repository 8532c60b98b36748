//! Domain XML generation for bhyve-backed libvirt VMs.
//!
//! The engine is the sole writer of a VM's domain XML; this module is
//! a pure string builder so `vm::engine` can regenerate it from the DB
//! projection on every start without touching libvirt itself.

use std::fmt::Write as _;

/// Disk bus, matching the Storage attachment data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DiskBus {
    VirtioBlk,
    Ahci,
    Nvme,
}

impl DiskBus {
    fn xml_bus(&self) -> &'static str {
        match self {
            DiskBus::VirtioBlk => "virtio",
            DiskBus::Ahci => "sata",
            DiskBus::Nvme => "nvme",
        }
    }
}

/// One storage attachment as rendered into a `<disk>` element.
#[derive(Debug, Clone)]
pub struct DiskSpec {
    pub target_dev: String,
    pub bus: DiskBus,
    pub source_path: String,
    /// `None` for ZFS-volume/raw-file disks, `Some` for the single ISO.
    pub is_cdrom: bool,
    pub is_boot: bool,
    pub boot_order: u32,
}

/// One network attachment as rendered into an `<interface>` element.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub target_dev: String,
    pub mac: String,
    pub bridge: String,
}

/// CPU pinning entry, `vcpu -> host logical CPU`.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct VcpuPin {
    pub vcpu: u32,
    pub host_cpu: u32,
}

/// Full set of inputs the domain XML is derived from.
#[derive(Debug, Clone)]
pub struct DomainSpec {
    pub name: String,
    pub uuid: String,
    pub vcpus: u32,
    pub vcpu_pins: Vec<VcpuPin>,
    pub memory_bytes: u64,
    pub disks: Vec<DiskSpec>,
    pub networks: Vec<NetworkSpec>,
    pub serial_enabled: bool,
    pub ctid: u64,
    pub tpm_enabled: bool,
    pub vnc_enabled: bool,
    pub vnc_port: Option<u16>,
    pub pci_passthrough: Vec<String>,
    pub clock_offset: ClockOffset,
    pub cloud_init_iso: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOffset {
    Utc,
    Localtime,
}

impl ClockOffset {
    fn xml_offset(&self) -> &'static str {
        match self {
            ClockOffset::Utc => "utc",
            ClockOffset::Localtime => "localtime",
        }
    }
}

/// Renders the full `<domain type='bhyve'>` document for `spec`.
pub fn render(spec: &DomainSpec) -> String {
    let mut xml = String::new();
    xml.push_str("<domain type='bhyve'>\n");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&spec.name));
    let _ = writeln!(xml, "  <uuid>{}</uuid>", escape(&spec.uuid));
    let _ = writeln!(xml, "  <memory unit='bytes'>{}</memory>", spec.memory_bytes);
    let _ = writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", spec.vcpus);

    if !spec.vcpu_pins.is_empty() {
        xml.push_str("  <cputune>\n");
        for pin in &spec.vcpu_pins {
            let _ = writeln!(
                xml,
                "    <vcpupin vcpu='{}' cpuset='{}'/>",
                pin.vcpu, pin.host_cpu
            );
        }
        xml.push_str("  </cputune>\n");
    }

    xml.push_str("  <os>\n    <type arch='x86_64'>hvm</type>\n  </os>\n");
    let _ = writeln!(
        xml,
        "  <clock offset='{}'/>",
        spec.clock_offset.xml_offset()
    );

    xml.push_str("  <devices>\n");

    for disk in &spec.disks {
        let device = if disk.is_cdrom { "cdrom" } else { "disk" };
        let _ = writeln!(xml, "    <disk type='file' device='{device}'>");
        let _ = writeln!(xml, "      <driver name='bhyve' type='raw'/>");
        let _ = writeln!(xml, "      <source file='{}'/>", escape(&disk.source_path));
        let _ = writeln!(
            xml,
            "      <target dev='{}' bus='{}'/>",
            escape(&disk.target_dev),
            disk.bus.xml_bus()
        );
        if disk.is_boot {
            let _ = writeln!(xml, "      <boot order='{}'/>", disk.boot_order);
        }
        xml.push_str("    </disk>\n");
    }

    for net in &spec.networks {
        xml.push_str("    <interface type='bridge'>\n");
        let _ = writeln!(xml, "      <source bridge='{}'/>", escape(&net.bridge));
        let _ = writeln!(xml, "      <mac address='{}'/>", escape(&net.mac));
        let _ = writeln!(xml, "      <target dev='{}'/>", escape(&net.target_dev));
        xml.push_str("      <model type='virtio'/>\n");
        xml.push_str("    </interface>\n");
    }

    if spec.serial_enabled {
        let _ = writeln!(
            xml,
            "    <serial type='nmdm'>\n      <source master='/dev/nmdm{}A' slave='/dev/nmdm{}B'/>\n    </serial>",
            spec.ctid, spec.ctid
        );
        xml.push_str("    <console type='nmdm'/>\n");
    }

    if spec.tpm_enabled {
        xml.push_str("    <tpm model='tpm-tis'>\n      <backend type='emulator' version='2.0'/>\n    </tpm>\n");
    }

    if spec.vnc_enabled {
        let port = spec.vnc_port.map(|p| p.to_string()).unwrap_or_else(|| "-1".to_string());
        let _ = writeln!(xml, "    <graphics type='vnc' port='{port}' autoport='{}'/>", spec.vnc_port.is_none());
    }

    for pci in &spec.pci_passthrough {
        let _ = writeln!(xml, "    <hostdev mode='subsystem' type='pci'>\n      <source>{}</source>\n    </hostdev>", escape(pci));
    }

    if let Some(iso) = &spec.cloud_init_iso {
        let _ = writeln!(
            xml,
            "    <disk type='file' device='cdrom'>\n      <driver name='bhyve' type='raw'/>\n      <source file='{}'/>\n    </disk>",
            escape(iso)
        );
    }

    xml.push_str("  </devices>\n");
    xml.push_str("</domain>\n");
    xml
}

fn escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec() -> DomainSpec {
        DomainSpec {
            name: "web01".to_string(),
            uuid: "11111111-1111-1111-1111-111111111111".to_string(),
            vcpus: 2,
            vcpu_pins: vec![],
            memory_bytes: 2 * 1024 * 1024 * 1024,
            disks: vec![DiskSpec {
                target_dev: "vda".to_string(),
                bus: DiskBus::VirtioBlk,
                source_path: "/dev/zvol/tank/sylve/virtual-machines/1".to_string(),
                is_cdrom: false,
                is_boot: true,
                boot_order: 1,
            }],
            networks: vec![NetworkSpec {
                target_dev: "vnet0".to_string(),
                mac: "02:11:22:33:44:55".to_string(),
                bridge: "br0".to_string(),
            }],
            serial_enabled: true,
            ctid: 101,
            tpm_enabled: false,
            vnc_enabled: false,
            vnc_port: None,
            pci_passthrough: vec![],
            clock_offset: ClockOffset::Utc,
            cloud_init_iso: None,
        }
    }

    #[test]
    fn renders_required_regions() {
        let xml = render(&minimal_spec());
        assert!(xml.contains("<memory unit='bytes'>2147483648</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("bus='virtio'"));
        assert!(xml.contains("/dev/nmdm101A"));
        assert!(xml.contains("/dev/nmdm101B"));
        assert!(xml.contains("<mac address='02:11:22:33:44:55'/>"));
    }

    #[test]
    fn no_serial_console_when_disabled() {
        let mut spec = minimal_spec();
        spec.serial_enabled = false;
        let xml = render(&spec);
        assert!(!xml.contains("<serial"));
    }

    #[test]
    fn cputune_present_only_with_pins() {
        assert!(!render(&minimal_spec()).contains("<cputune>"));
        let mut spec = minimal_spec();
        spec.vcpu_pins = vec![VcpuPin { vcpu: 0, host_cpu: 3 }];
        let xml = render(&spec);
        assert!(xml.contains("<vcpupin vcpu='0' cpuset='3'/>"));
    }

    #[test]
    fn escapes_attribute_values() {
        let mut spec = minimal_spec();
        spec.name = "web & \"01\"".to_string();
        let xml = render(&spec);
        assert!(xml.contains("web &amp; &quot;01&quot;"));
    }

    #[test]
    fn exactly_one_cdrom_for_iso() {
        let mut spec = minimal_spec();
        spec.disks.push(DiskSpec {
            target_dev: "sr0".to_string(),
            bus: DiskBus::Ahci,
            source_path: "/isos/freebsd.iso".to_string(),
            is_cdrom: true,
            is_boot: false,
            boot_order: 0,
        });
        let xml = render(&spec);
        assert_eq!(xml.matches("device='cdrom'").count(), 1);
    }
}
