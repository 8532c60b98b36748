//! The `SyncNetwork` algorithm: given a guest's network attachments and
//! the host-side bridge registry, derive the three artifacts that wire
//! a jail's VNET interfaces — the jail.conf network region, the
//! pre-start.sh epair setup lines, and the rc.conf addressing lines.
//!
//! This module is deliberately pure: it takes plain data in and returns
//! plain strings out, so the file-writing and host-command side of
//! `jail::engine` can stay thin and testable separately.

use crate::error::{Error, Result};
use crate::netobj::{MacAddress, NetworkObjectStore};

/// Guest OS family, used to decide whether rc.conf addressing lines are
/// emitted. Linux jails get VNET wiring only; addressing is up to the
/// guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestOsType {
    FreeBsd,
    Linux,
}

/// One row of a guest's Networks set, per the data model's Network
/// attachment shape.
#[derive(Debug, Clone)]
pub struct NetworkAttachment {
    pub id: u64,
    pub mac_id: u64,
    pub switch_name: String,
    pub dhcp: bool,
    pub ipv4_id: Option<u64>,
    pub ipv4_gateway_id: Option<u64>,
    pub slaac: bool,
    pub ipv6_id: Option<u64>,
    pub ipv6_gateway_id: Option<u64>,
    pub default_gateway: bool,
}

/// The three artifacts `SyncNetwork` produces.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NetworkRegions {
    /// Lines for the jail.conf network region (`vnet;`, `vnet.interface
    /// += "...";`, `ip4=...;`, `ip6=...;`).
    pub jail_conf_lines: Vec<String>,
    /// Lines to place between the pre-start.sh user-managed markers.
    pub pre_start_lines: Vec<String>,
    /// Lines for the rc.conf fenced header, empty for non-FreeBSD guests.
    pub rc_conf_lines: Vec<String>,
    /// `(bridge, epair_host_side)` pairs that need `addm`, already
    /// filtered against the guest's bridge membership callback.
    pub bridge_addm: Vec<(String, String)>,
}

/// A deterministic five-letter encoding of a CTID, stable and
/// collision-free for CTID < 26^5 (~11.9M).
pub fn ctid_hash(ctid: u64) -> String {
    let mut n = ctid % 26u64.pow(5);
    let mut letters = ['a'; 5];
    for slot in letters.iter_mut().rev() {
        *slot = (b'a' + (n % 26) as u8) as char;
        n /= 26;
    }
    letters.iter().collect()
}

/// `(host_side, jail_side)` epair names for attachment `attachment_id`
/// of jail `ctid`.
pub fn epair_names(ctid: u64, attachment_id: u64) -> (String, String) {
    let hash = ctid_hash(ctid);
    (
        format!("{hash}_net{attachment_id}a"),
        format!("{hash}_net{attachment_id}b"),
    )
}

/// Runs the `SyncNetwork` algorithm.
///
/// `bridge_has_member(bridge, iface)` lets the caller consult the live
/// bridge membership so the emitted `addm` is conditional, per spec.
pub fn build_regions(
    ctid: u64,
    jail_name: &str,
    os_type: GuestOsType,
    inherit_ipv4: bool,
    inherit_ipv6: bool,
    attachments: &[NetworkAttachment],
    objects: &NetworkObjectStore,
    bridge_has_member: impl Fn(&str, &str) -> bool,
) -> Result<NetworkRegions> {
    let mut regions = NetworkRegions::default();

    if inherit_ipv4 || inherit_ipv6 {
        if inherit_ipv4 {
            regions.jail_conf_lines.push("ip4=inherit;".to_string());
        }
        if inherit_ipv6 {
            regions.jail_conf_lines.push("ip6=inherit;".to_string());
        }
        return Ok(regions);
    }

    if attachments.is_empty() {
        return Ok(regions);
    }

    regions.jail_conf_lines.push("vnet;".to_string());

    for attachment in attachments {
        let (host_side, jail_side) = epair_names(ctid, attachment.id);
        let mac = objects.mac(attachment.mac_id)?;
        let host_mac = prev_mac(mac);

        regions
            .jail_conf_lines
            .push(format!("vnet.interface += \"{jail_side}\";"));

        regions
            .pre_start_lines
            .push(format!("ifconfig {host_side} ether {host_mac} up"));
        regions.pre_start_lines.push(format!(
            "# {jail_name} (ctid {ctid}) attachment {}",
            attachment.id
        ));
        regions
            .pre_start_lines
            .push(format!("ifconfig {jail_side} ether {mac} up"));

        if !bridge_has_member(&attachment.switch_name, &host_side) {
            regions.pre_start_lines.push(format!(
                "ifconfig {} addm {host_side}",
                attachment.switch_name
            ));
        }
        regions
            .bridge_addm
            .push((attachment.switch_name.clone(), host_side.clone()));

        if os_type != GuestOsType::FreeBsd {
            continue;
        }

        if attachment.dhcp {
            regions
                .rc_conf_lines
                .push(format!("ifconfig_{jail_side}=\"SYNCDHCP\""));
        } else if let Some(ipv4_id) = attachment.ipv4_id {
            let (addr, prefix_len) = objects.ipv4(ipv4_id)?;
            let netmask = ipv4_netmask(prefix_len);
            regions.rc_conf_lines.push(format!(
                "ifconfig_{jail_side}=\"inet {addr} netmask {netmask}\""
            ));
            if attachment.default_gateway {
                if let Some(gw_id) = attachment.ipv4_gateway_id {
                    let gw = objects.gateway(gw_id)?;
                    regions
                        .rc_conf_lines
                        .push(format!("defaultrouter=\"{gw}\""));
                }
            }
        }

        if attachment.slaac {
            regions
                .rc_conf_lines
                .push(format!("ifconfig_{jail_side}_ipv6=\"inet6 accept_rtadv\""));
        } else if let Some(ipv6_id) = attachment.ipv6_id {
            let (addr, _prefix_len) = objects.ipv6(ipv6_id)?;
            regions
                .rc_conf_lines
                .push(format!("ifconfig_{jail_side}_ipv6=\"inet6 {addr}\""));
            if attachment.default_gateway {
                if let Some(gw_id) = attachment.ipv6_gateway_id {
                    let gw = objects.gateway(gw_id)?;
                    regions
                        .rc_conf_lines
                        .push(format!("ipv6_defaultrouter=\"{gw}\""));
                }
            }
        }
    }

    Ok(regions)
}

fn prev_mac(mac: MacAddress) -> MacAddress {
    mac.prev()
}

fn ipv4_netmask(prefix_len: u8) -> std::net::Ipv4Addr {
    let bits = if prefix_len == 0 {
        0u32
    } else {
        u32::MAX << (32 - prefix_len as u32)
    };
    std::net::Ipv4Addr::from(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netobj::NetworkObject;

    fn store_with_scenario_one() -> (NetworkObjectStore, NetworkAttachment) {
        let mut store = NetworkObjectStore::new();
        let mac_id = store.insert(NetworkObject::Mac("02:11:22:33:44:55".parse().unwrap()));
        let ipv4_id = store.insert(NetworkObject::Ipv4 {
            addr: "10.0.0.10".parse().unwrap(),
            prefix_len: 24,
        });
        let gw_id = store.insert(NetworkObject::Gateway("10.0.0.1".parse().unwrap()));

        let attachment = NetworkAttachment {
            id: 1,
            mac_id,
            switch_name: "br0".to_string(),
            dhcp: false,
            ipv4_id: Some(ipv4_id),
            ipv4_gateway_id: Some(gw_id),
            slaac: false,
            ipv6_id: None,
            ipv6_gateway_id: None,
            default_gateway: true,
        };
        (store, attachment)
    }

    #[test]
    fn ctid_hash_is_stable_and_five_letters() {
        let h = ctid_hash(101);
        assert_eq!(h.len(), 5);
        assert!(h.chars().all(|c| c.is_ascii_lowercase()));
        assert_eq!(h, ctid_hash(101));
    }

    #[test]
    fn ctid_hash_differs_across_ctids() {
        assert_ne!(ctid_hash(101), ctid_hash(102));
    }

    #[test]
    fn scenario_one_vnet_wiring_freebsd() {
        let (store, attachment) = store_with_scenario_one();
        let hash = ctid_hash(101);

        let regions = build_regions(
            101,
            "web01",
            GuestOsType::FreeBsd,
            false,
            false,
            &[attachment],
            &store,
            |_bridge, _iface| false,
        )
        .unwrap();

        let host_side = format!("{hash}_net1a");
        let jail_side = format!("{hash}_net1b");

        assert!(regions
            .pre_start_lines
            .contains(&format!("ifconfig {host_side} ether 02:11:22:33:44:54 up")));
        assert!(regions
            .pre_start_lines
            .contains(&format!("ifconfig {jail_side} ether 02:11:22:33:44:55 up")));
        assert!(regions
            .pre_start_lines
            .contains(&format!("ifconfig br0 addm {host_side}")));

        assert!(regions
            .rc_conf_lines
            .contains(&format!("ifconfig_{jail_side}=\"inet 10.0.0.10 netmask 255.255.255.0\"")));
        assert!(regions
            .rc_conf_lines
            .contains(&"defaultrouter=\"10.0.0.1\"".to_string()));

        assert!(regions.jail_conf_lines.contains(&"vnet;".to_string()));
        assert!(regions
            .jail_conf_lines
            .contains(&format!("vnet.interface += \"{jail_side}\";")));
    }

    #[test]
    fn addm_is_skipped_when_already_a_member() {
        let (store, attachment) = store_with_scenario_one();
        let regions = build_regions(
            101,
            "web01",
            GuestOsType::FreeBsd,
            false,
            false,
            &[attachment],
            &store,
            |_bridge, _iface| true,
        )
        .unwrap();
        assert!(!regions.pre_start_lines.iter().any(|l| l.contains("addm")));
    }

    #[test]
    fn linux_guest_gets_no_rc_conf_lines() {
        let (store, attachment) = store_with_scenario_one();
        let regions = build_regions(
            101,
            "web01",
            GuestOsType::Linux,
            false,
            false,
            &[attachment],
            &store,
            |_bridge, _iface| false,
        )
        .unwrap();
        assert!(regions.rc_conf_lines.is_empty());
        assert!(!regions.pre_start_lines.is_empty());
    }

    #[test]
    fn inheritance_mode_collapses_to_ip_inherit() {
        let store = NetworkObjectStore::new();
        let regions = build_regions(
            101,
            "web01",
            GuestOsType::FreeBsd,
            true,
            true,
            &[],
            &store,
            |_bridge, _iface| false,
        )
        .unwrap();
        assert_eq!(
            regions.jail_conf_lines,
            vec!["ip4=inherit;".to_string(), "ip6=inherit;".to_string()]
        );
        assert!(regions.pre_start_lines.is_empty());
    }

    #[test]
    fn idempotent_output_for_same_inputs() {
        let (store, attachment) = store_with_scenario_one();
        let run = || {
            build_regions(
                101,
                "web01",
                GuestOsType::FreeBsd,
                false,
                false,
                std::slice::from_ref(&attachment),
                &store,
                |_bridge, _iface| false,
            )
            .unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn dhcp_attachment_emits_syncdhcp() {
        let mut store = NetworkObjectStore::new();
        let mac_id = store.insert(NetworkObject::Mac("02:11:22:33:44:55".parse().unwrap()));
        let attachment = NetworkAttachment {
            id: 2,
            mac_id,
            switch_name: "br0".to_string(),
            dhcp: true,
            ipv4_id: None,
            ipv4_gateway_id: None,
            slaac: true,
            ipv6_id: None,
            ipv6_gateway_id: None,
            default_gateway: false,
        };
        let regions = build_regions(
            101,
            "web01",
            GuestOsType::FreeBsd,
            false,
            false,
            &[attachment],
            &store,
            |_b, _i| false,
        )
        .unwrap();
        let jail_side = format!("{}_net2b", ctid_hash(101));
        assert!(regions
            .rc_conf_lines
            .contains(&format!("ifconfig_{jail_side}=\"SYNCDHCP\"")));
        assert!(regions
            .rc_conf_lines
            .contains(&format!("ifconfig_{jail_side}_ipv6=\"inet6 accept_rtadv\"")));
    }

    #[test]
    fn missing_mac_object_is_an_error() {
        let store = NetworkObjectStore::new();
        let attachment = NetworkAttachment {
            id: 1,
            mac_id: 999,
            switch_name: "br0".to_string(),
            dhcp: true,
            ipv4_id: None,
            ipv4_gateway_id: None,
            slaac: false,
            ipv6_id: None,
            ipv6_gateway_id: None,
            default_gateway: false,
        };
        let result = build_regions(
            101,
            "web01",
            GuestOsType::FreeBsd,
            false,
            false,
            &[attachment],
            &store,
            |_b, _i| false,
        );
        assert!(matches!(result, Err(Error::NetworkObjectNotFound(999))));
    }
}
