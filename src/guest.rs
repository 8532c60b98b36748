//! Common guest model shared by jails and VMs: a tagged union on
//! `GuestKind`, not a class hierarchy. Shared operations take the common
//! record and dispatch on the variant fields.

use crate::error::{Error, Result};
use crate::hooks::Hook;
use crate::vm::domain::VcpuPin;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// `freebsd`/`linux` for jails; a bhyve guest-OS hint for VMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestOsHint {
    FreeBsd,
    Linux,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub id: u64,
    pub switch_id: u64,
    pub switch_type: SwitchType,
    pub mac_id: u64,
    pub ipv4_id: Option<u64>,
    pub ipv4_gateway_id: Option<u64>,
    pub ipv6_id: Option<u64>,
    pub ipv6_gateway_id: Option<u64>,
    pub dhcp: bool,
    pub slaac: bool,
    pub default_gateway: bool,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchType {
    Standard,
    Manual,
}

/// Storage attachment. Jails only ever have one: the base dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageAttachment {
    Jail {
        pool: String,
        dataset: String,
        is_base: bool,
    },
    Vm {
        kind: VmStorageKind,
        location: String,
        size_bytes: Option<u64>,
        bus: crate::vm::domain::DiskBus,
        is_boot: bool,
        is_base: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmStorageKind {
    Zvol,
    RawFile,
    Iso,
}

impl StorageAttachment {
    pub fn is_base(&self) -> bool {
        match self {
            StorageAttachment::Jail { is_base, .. } => *is_base,
            StorageAttachment::Vm { is_base, .. } => *is_base,
        }
    }
}

/// Variant-specific fields for a jail guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JailDetail {
    pub inherit_ipv4: bool,
    pub inherit_ipv6: bool,
    pub resource_limits: Option<bool>,
    pub cores: u32,
    pub cpu_set: Vec<u32>,
    pub memory_bytes: u64,
    pub devfs_ruleset: String,
    pub fstab: String,
    pub allowed_options: Vec<String>,
    pub additional_options: String,
    pub metadata_meta: String,
    pub metadata_env: String,
}

/// Variant-specific fields for a VM guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDetail {
    pub cpu_sockets: u32,
    pub cpu_cores: u32,
    pub cpu_threads: u32,
    pub cpu_pinning: Vec<VcpuPin>,
    pub ram_bytes: u64,
    pub vnc_port: Option<u16>,
    pub vnc_password: Option<String>,
    pub pci_devices: Vec<String>,
    pub tpm_emulation: bool,
    pub boot_order: Vec<String>,
    pub time_offset_utc: bool,
    pub serial_console: bool,
    pub shutdown_wait_seconds: u64,
    pub ignore_unknown_msrs: bool,
    pub cloud_init_user_data: Option<String>,
    pub cloud_init_meta_data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GuestVariant {
    Jail(JailDetail),
    Vm(VmDetail),
}

/// The common Guest record. `ctid`/`rid` is the same stable numeric
/// identifier under either name depending on guest kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guest {
    pub ctid: u64,
    pub name: String,
    pub description: String,
    pub os_hint: GuestOsHint,
    pub start_at_boot: bool,
    pub start_order: i32,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub networks: Vec<NetworkAttachment>,
    pub storages: Vec<StorageAttachment>,
    pub hooks: Vec<Hook>,
    pub variant: GuestVariant,
}

impl Guest {
    pub fn is_jail(&self) -> bool {
        matches!(self.variant, GuestVariant::Jail(_))
    }

    pub fn is_vm(&self) -> bool {
        matches!(self.variant, GuestVariant::Vm(_))
    }

    pub fn is_active(&self) -> bool {
        self.started_at.is_some() && self.stopped_at.is_none()
    }

    /// The Storage marked `isBase`; every guest must have exactly one.
    pub fn base_storage(&self) -> Result<&StorageAttachment> {
        self.storages
            .iter()
            .find(|s| s.is_base())
            .ok_or_else(|| Error::JailBaseStorageNotFound)
    }

    pub fn default_gateway_network(&self) -> Option<&NetworkAttachment> {
        self.networks.iter().find(|n| n.default_gateway)
    }

    /// Data-model invariants from the shared record and the jail variant.
    pub fn validate(&self) -> Result<()> {
        let base_count = self.storages.iter().filter(|s| s.is_base()).count();
        if base_count != 1 {
            return Err(Error::Validation(format!(
                "guest {} must have exactly one base storage, found {base_count}",
                self.ctid
            )));
        }

        let default_gw_count = self.networks.iter().filter(|n| n.default_gateway).count();
        if default_gw_count > 1 {
            return Err(Error::Validation(format!(
                "guest {} has {default_gw_count} networks marked defaultGateway",
                self.ctid
            )));
        }

        for n in &self.networks {
            if n.dhcp && n.slaac && n.default_gateway {
                return Err(Error::Validation(
                    "dhcp, slaac, and defaultGateway cannot all be set on one attachment".into(),
                ));
            }
        }

        if let GuestVariant::Jail(detail) = &self.variant {
            if (detail.inherit_ipv4 || detail.inherit_ipv6) && !self.networks.is_empty() {
                return Err(Error::Validation(
                    "jail networks must be empty while inheriting IPv4/IPv6".into(),
                ));
            }
            if self.os_hint == GuestOsHint::Linux {
                for n in &self.networks {
                    if n.ipv4_id.is_some() || n.ipv6_id.is_some() || n.dhcp || n.slaac {
                        return Err(Error::Validation(
                            "linux jails must leave IP fields zero; addressing is in-guest".into(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Sanitizes a snapshot display name into the token embedded in
/// `sjs_<token>_<unixMillis>` / `svs_<token>_<unixMillis>`.
pub fn sanitize_snapshot_token(input: &str) -> String {
    let lower = input.trim().to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_dash = false;
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == ':' || c == '-' {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = out.trim_matches(|c: char| c == '-' || c == '.' || c == '_' || c == ':');
    let clamped: String = trimmed.chars().take(48).collect();
    if clamped.is_empty() {
        "snapshot".to_string()
    } else {
        clamped
    }
}

pub fn snapshot_name(prefix: &str, display_name: &str, unix_millis: u128) -> String {
    format!("{prefix}_{}_{unix_millis}", sanitize_snapshot_token(display_name))
}

pub fn unix_millis_now() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Validation(format!("system clock before epoch: {e}")))?
        .as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jail_detail() -> JailDetail {
        JailDetail {
            inherit_ipv4: false,
            inherit_ipv6: false,
            resource_limits: None,
            cores: 0,
            cpu_set: vec![],
            memory_bytes: 0,
            devfs_ruleset: String::new(),
            fstab: String::new(),
            allowed_options: vec![],
            additional_options: String::new(),
            metadata_meta: String::new(),
            metadata_env: String::new(),
        }
    }

    fn base_guest() -> Guest {
        Guest {
            ctid: 101,
            name: "web01".into(),
            description: String::new(),
            os_hint: GuestOsHint::FreeBsd,
            start_at_boot: true,
            start_order: 0,
            started_at: None,
            stopped_at: None,
            networks: vec![],
            storages: vec![StorageAttachment::Jail {
                pool: "zroot".into(),
                dataset: "zroot/sylve/jails/101".into(),
                is_base: true,
            }],
            hooks: vec![],
            variant: GuestVariant::Jail(jail_detail()),
        }
    }

    #[test]
    fn sanitize_snapshot_token_examples_from_spec() {
        assert_eq!(sanitize_snapshot_token("  Before/Upgrade  "), "before-upgrade");
        assert_eq!(sanitize_snapshot_token(""), "snapshot");
        let long_input = "a".repeat(100);
        assert_eq!(sanitize_snapshot_token(&long_input).len(), 48);
    }

    #[test]
    fn validate_requires_exactly_one_base_storage() {
        let mut g = base_guest();
        g.storages.push(StorageAttachment::Jail {
            pool: "zroot".into(),
            dataset: "zroot/extra".into(),
            is_base: true,
        });
        assert!(g.validate().is_err());
    }

    #[test]
    fn validate_rejects_networks_while_inheriting() {
        let mut g = base_guest();
        if let GuestVariant::Jail(d) = &mut g.variant {
            d.inherit_ipv4 = true;
        }
        g.networks.push(NetworkAttachment {
            id: 1,
            switch_id: 1,
            switch_type: SwitchType::Standard,
            mac_id: 1,
            ipv4_id: None,
            ipv4_gateway_id: None,
            ipv6_id: None,
            ipv6_gateway_id: None,
            dhcp: false,
            slaac: false,
            default_gateway: false,
            name: "net0".into(),
        });
        assert!(g.validate().is_err());
    }

    #[test]
    fn validate_rejects_multiple_default_gateways() {
        let mut g = base_guest();
        for i in 0..2 {
            g.networks.push(NetworkAttachment {
                id: i,
                switch_id: 1,
                switch_type: SwitchType::Standard,
                mac_id: 1,
                ipv4_id: None,
                ipv4_gateway_id: None,
                ipv6_id: None,
                ipv6_gateway_id: None,
                dhcp: false,
                slaac: false,
                default_gateway: true,
                name: format!("net{i}"),
            });
        }
        assert!(g.validate().is_err());
    }

    #[test]
    fn base_storage_lookup_errors_when_absent() {
        let mut g = base_guest();
        g.storages.clear();
        assert!(matches!(g.base_storage(), Err(Error::JailBaseStorageNotFound)));
    }
}
