//! External collaborator traits: the seams this crate consumes but
//! never implements. The SQL store, the cluster's switch/object
//! registry, and guest-resolution are all owned by the out-of-scope
//! HTTP facade process; this module only names the interface the
//! engines and orchestrator call through.
//!
//! The narrower single-method seams used by one subsystem each
//! (`replication::transport::TokenVerifier`, `replication::lease::LeaseLookup`,
//! `replication::scheduler::{JobStore, Replicator, ClusterInfo}`) live
//! beside their consumers instead of here, since they're tied to that
//! subsystem's wire format and changing one shouldn't touch this file.
//! This module is for the broad, guest-shaped persistence surface.
//!
//! `FileBackedStore`/`FileBackedSnapshotStore`/`NaiveResolver` are the
//! standalone implementations the CLI binary wires up when it isn't
//! pointed at a real cluster: a JSON file instead of the relational
//! store, a flat id-indexed table instead of the object registry.

use crate::error::{Error, Result};
use crate::guest::{Guest, GuestVariant, StorageAttachment};
use crate::netobj::NetworkObjectStore;
use crate::network::sync::NetworkAttachment;
use crate::vm::domain::{ClockOffset, DiskSpec, DomainSpec, NetworkSpec};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// CRUD surface the orchestrator needs from the embedded SQL store for
/// the guest row itself. A relational store with transactions and
/// foreign keys is assumed; this crate never opens a connection
/// itself. Snapshot rows have their own narrower `snapshot::SnapshotStore`
/// seam, owned by that module since it needs mutable, ordering-aware
/// access the guest CRUD surface doesn't.
pub trait SqlStore: Send + Sync {
    fn load_guest(&self, ctid: u64) -> Result<Guest>;
    fn save_guest(&self, guest: &Guest) -> Result<()>;
    fn delete_guest(&self, ctid: u64) -> Result<()>;
    fn list_guests(&self) -> Result<Vec<Guest>>;
}

/// Resolves a guest's network attachments and (for VMs) full domain
/// spec from the caller's live switch/object registry. Kept separate
/// from `Guest` itself because `switch_id -> switch_name` and MAC/IP
/// object lookups are owned by the object store and SQL store, not by
/// this crate's in-memory model.
pub trait GuestResolver: Send + Sync {
    /// Builds the jail engine's `SyncNetwork` input from a guest's
    /// network attachments.
    fn resolve_jail_networks(&self, guest: &Guest) -> Result<Vec<NetworkAttachment>>;

    /// Builds the full domain spec a VM start regenerates its XML
    /// from, resolving storage/network attachments and CPU pinning.
    fn resolve_domain_spec(&self, guest: &Guest) -> Result<DomainSpec>;
}

/// Minimal standalone `SqlStore`: the guest table as a single JSON
/// array on disk, atomically rewritten on every mutation. A real
/// deployment wires the node agent to the embedded relational store
/// instead; this is what the CLI falls back to when run without one.
pub struct FileBackedStore {
    path: PathBuf,
    guests: Mutex<HashMap<u64, Guest>>,
}

impl FileBackedStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let guests = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let list: Vec<Guest> = serde_json::from_str(&content)?;
            list.into_iter().map(|g| (g.ctid, g)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            guests: Mutex::new(guests),
        })
    }

    fn persist(&self, guests: &HashMap<u64, Guest>) -> Result<()> {
        let mut list: Vec<&Guest> = guests.values().collect();
        list.sort_by_key(|g| g.ctid);
        let body = serde_json::to_string_pretty(&list)?;
        crate::jail::engine::atomic_write(&self.path, body.as_bytes())
    }
}

impl SqlStore for FileBackedStore {
    fn load_guest(&self, ctid: u64) -> Result<Guest> {
        self.guests
            .lock()
            .unwrap()
            .get(&ctid)
            .cloned()
            .ok_or_else(|| Error::GuestNotFound(ctid.to_string()))
    }

    fn save_guest(&self, guest: &Guest) -> Result<()> {
        let mut guests = self.guests.lock().unwrap();
        guests.insert(guest.ctid, guest.clone());
        self.persist(&guests)
    }

    fn delete_guest(&self, ctid: u64) -> Result<()> {
        let mut guests = self.guests.lock().unwrap();
        guests.remove(&ctid);
        self.persist(&guests)
    }

    fn list_guests(&self) -> Result<Vec<Guest>> {
        let mut list: Vec<Guest> = self.guests.lock().unwrap().values().cloned().collect();
        list.sort_by_key(|g| g.ctid);
        Ok(list)
    }
}

/// Default `GuestResolver`: resolves network/storage object ids
/// through an in-process `NetworkObjectStore` and a flat
/// `switchId -> switchName` table, both populated by the caller ahead
/// of time. Deterministic target-device naming (`vtbd0`, `vtbd1`, ...)
/// in spec order, matching the domain XML's sequential disk slots.
pub struct NaiveResolver {
    objects: Mutex<NetworkObjectStore>,
    switch_names: Mutex<HashMap<u64, String>>,
}

impl NaiveResolver {
    pub fn new(objects: NetworkObjectStore) -> Self {
        Self {
            objects: Mutex::new(objects),
            switch_names: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_switch(&self, switch_id: u64, name: impl Into<String>) {
        self.switch_names.lock().unwrap().insert(switch_id, name.into());
    }

    fn switch_name(&self, switch_id: u64) -> String {
        self.switch_names
            .lock()
            .unwrap()
            .get(&switch_id)
            .cloned()
            .unwrap_or_else(|| format!("switch{switch_id}"))
    }
}

impl GuestResolver for NaiveResolver {
    fn resolve_jail_networks(&self, guest: &Guest) -> Result<Vec<NetworkAttachment>> {
        guest
            .networks
            .iter()
            .map(|n| {
                Ok(NetworkAttachment {
                    id: n.id,
                    mac_id: n.mac_id,
                    switch_name: self.switch_name(n.switch_id),
                    dhcp: n.dhcp,
                    ipv4_id: n.ipv4_id,
                    ipv4_gateway_id: n.ipv4_gateway_id,
                    slaac: n.slaac,
                    ipv6_id: n.ipv6_id,
                    ipv6_gateway_id: n.ipv6_gateway_id,
                    default_gateway: n.default_gateway,
                })
            })
            .collect()
    }

    fn resolve_domain_spec(&self, guest: &Guest) -> Result<DomainSpec> {
        let GuestVariant::Vm(detail) = &guest.variant else {
            return Err(Error::Validation(format!(
                "guest {} is not a VM, cannot build a domain spec",
                guest.ctid
            )));
        };

        let objects = self.objects.lock().unwrap();
        let mut disks = Vec::new();
        let mut boot_index = 0u32;
        for (i, storage) in guest.storages.iter().enumerate() {
            if let StorageAttachment::Vm {
                location,
                bus,
                is_boot,
                is_base,
                ..
            } = storage
            {
                if *is_boot {
                    boot_index += 1;
                }
                disks.push(DiskSpec {
                    target_dev: format!("vtbd{i}"),
                    bus: *bus,
                    source_path: location.clone(),
                    is_cdrom: false,
                    is_boot: *is_boot,
                    boot_order: if *is_boot { boot_index } else { 0 },
                });
                let _ = is_base;
            }
        }

        let networks = guest
            .networks
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let mac = objects
                    .mac(n.mac_id)
                    .map(|m| {
                        m.octets()
                            .iter()
                            .map(|b| format!("{b:02x}"))
                            .collect::<Vec<_>>()
                            .join(":")
                    })
                    .unwrap_or_else(|_| "00:00:00:00:00:00".to_string());
                NetworkSpec {
                    target_dev: format!("vtnet{i}"),
                    mac,
                    bridge: self.switch_name(n.switch_id),
                }
            })
            .collect();

        Ok(DomainSpec {
            name: guest.name.clone(),
            uuid: format!("{:08x}-0000-0000-0000-000000000000", guest.ctid),
            vcpus: detail.cpu_sockets * detail.cpu_cores * detail.cpu_threads,
            vcpu_pins: detail.cpu_pinning.clone(),
            memory_bytes: detail.ram_bytes,
            disks,
            networks,
            serial_enabled: detail.serial_console,
            ctid: guest.ctid,
            tpm_enabled: detail.tpm_emulation,
            vnc_enabled: detail.vnc_port.is_some(),
            vnc_port: detail.vnc_port,
            pci_passthrough: detail.pci_devices.clone(),
            clock_offset: if detail.time_offset_utc {
                ClockOffset::Utc
            } else {
                ClockOffset::Localtime
            },
            cloud_init_iso: detail.cloud_init_user_data.as_ref().map(|_| {
                format!("/var/sylve/virtual-machines/{}/cloud-init.iso", guest.ctid)
            }),
        })
    }
}

/// Standalone `SnapshotStore`: the snapshot table as a JSON array on
/// disk, same persistence shape as `FileBackedStore`. `parent_snapshot_id`
/// and `createdAt`/`id` ordering come straight from the caller; this
/// type only assigns ids and keeps them on disk.
pub struct FileBackedSnapshotStore {
    path: PathBuf,
    next_id: u64,
    records: HashMap<u64, crate::snapshot::SnapshotRecord>,
}

impl FileBackedSnapshotStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records: HashMap<u64, crate::snapshot::SnapshotRecord> = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let list: Vec<crate::snapshot::SnapshotRecord> = serde_json::from_str(&content)?;
            list.into_iter().map(|r| (r.id, r)).collect()
        } else {
            HashMap::new()
        };
        let next_id = records.keys().max().copied().unwrap_or(0) + 1;
        Ok(Self {
            path,
            next_id,
            records,
        })
    }

    fn persist(&self) -> Result<()> {
        let mut list: Vec<&crate::snapshot::SnapshotRecord> = self.records.values().collect();
        list.sort_by_key(|r| (r.created_at, r.id));
        let body = serde_json::to_string_pretty(&list)?;
        crate::jail::engine::atomic_write(&self.path, body.as_bytes())
    }
}

impl crate::snapshot::SnapshotStore for FileBackedSnapshotStore {
    fn insert(&mut self, mut record: crate::snapshot::SnapshotRecord) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        record.id = id;
        self.records.insert(id, record);
        self.persist()?;
        Ok(id)
    }

    fn latest_for_guest(&self, ctid: u64) -> Option<crate::snapshot::SnapshotRecord> {
        self.records
            .values()
            .filter(|r| r.guest_ctid == ctid)
            .max_by_key(|r| (r.created_at, r.id))
            .cloned()
    }

    fn get(&self, id: u64) -> Option<crate::snapshot::SnapshotRecord> {
        self.records.get(&id).cloned()
    }

    fn delete_newer_than(
        &mut self,
        ctid: u64,
        created_at: i64,
        id: u64,
    ) -> Result<Vec<crate::snapshot::SnapshotRecord>> {
        let victims: Vec<crate::snapshot::SnapshotRecord> = self
            .records
            .values()
            .filter(|r| r.guest_ctid == ctid && (r.created_at, r.id) > (created_at, id))
            .cloned()
            .collect();
        for v in &victims {
            self.records.remove(&v.id);
        }
        self.persist()?;
        Ok(victims)
    }

    fn delete(&mut self, id: u64) -> Result<()> {
        self.records.remove(&id);
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{GuestOsHint, GuestVariant, JailDetail};
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MemStore {
        guests: RefCell<HashMap<u64, Guest>>,
    }

    impl SqlStore for MemStore {
        fn load_guest(&self, ctid: u64) -> Result<Guest> {
            self.guests
                .borrow()
                .get(&ctid)
                .cloned()
                .ok_or_else(|| crate::error::Error::GuestNotFound(ctid.to_string()))
        }

        fn save_guest(&self, guest: &Guest) -> Result<()> {
            self.guests.borrow_mut().insert(guest.ctid, guest.clone());
            Ok(())
        }

        fn delete_guest(&self, ctid: u64) -> Result<()> {
            self.guests.borrow_mut().remove(&ctid);
            Ok(())
        }

        fn list_guests(&self) -> Result<Vec<Guest>> {
            Ok(self.guests.borrow().values().cloned().collect())
        }
    }

    fn jail_guest(ctid: u64) -> Guest {
        Guest {
            ctid,
            name: format!("g{ctid}"),
            description: String::new(),
            os_hint: GuestOsHint::FreeBsd,
            start_at_boot: true,
            start_order: 0,
            started_at: None,
            stopped_at: None,
            networks: vec![],
            storages: vec![crate::guest::StorageAttachment::Jail {
                pool: "zroot".into(),
                dataset: format!("zroot/sylve/jails/{ctid}"),
                is_base: true,
            }],
            hooks: vec![],
            variant: GuestVariant::Jail(JailDetail {
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
            }),
        }
    }

    #[test]
    fn round_trips_a_guest() {
        let store = MemStore {
            guests: RefCell::new(HashMap::new()),
        };
        store.save_guest(&jail_guest(101)).unwrap();
        assert_eq!(store.load_guest(101).unwrap().name, "g101");
        assert_eq!(store.list_guests().unwrap().len(), 1);
        store.delete_guest(101).unwrap();
        assert!(store.load_guest(101).is_err());
    }
}
