//! Start-time gate: a replication-protected guest may only start on the
//! node that currently owns a non-expired lease for its policy.

use crate::error::{Error, Result};

/// `(guestType, guestId)` identifies which policy, if any, protects a
/// guest. The policy/lease rows themselves live in the external SQL
/// store; this module only encodes the decision rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestKind {
    Jail,
    Vm,
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub owner_node_id: String,
    pub expires_at: i64,
}

/// Read-only lookup of a guest's replication policy and its current
/// lease, injected so this module stays free of storage concerns.
pub trait LeaseLookup {
    fn policy_enabled(&self, kind: GuestKind, guest_id: u64) -> bool;
    fn current_lease(&self, kind: GuestKind, guest_id: u64) -> Option<Lease>;
}

/// Returns `Ok(())` if starting is allowed, or
/// `Error::ReplicationLeaseNotOwned` if a policy exists and this node
/// does not hold a current lease for it.
pub fn check_lease(
    lookup: &dyn LeaseLookup,
    kind: GuestKind,
    guest_id: u64,
    local_node_id: &str,
    now: i64,
) -> Result<()> {
    if !lookup.policy_enabled(kind, guest_id) {
        return Ok(());
    }
    match lookup.current_lease(kind, guest_id) {
        Some(lease) if lease.expires_at >= now && lease.owner_node_id == local_node_id => Ok(()),
        _ => Err(Error::ReplicationLeaseNotOwned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MemLookup {
        enabled: HashMap<(GuestKind, u64), bool>,
        leases: HashMap<(GuestKind, u64), Lease>,
    }

    impl LeaseLookup for MemLookup {
        fn policy_enabled(&self, kind: GuestKind, guest_id: u64) -> bool {
            *self.enabled.get(&(kind, guest_id)).unwrap_or(&false)
        }

        fn current_lease(&self, kind: GuestKind, guest_id: u64) -> Option<Lease> {
            self.leases.get(&(kind, guest_id)).cloned()
        }
    }

    #[test]
    fn allows_start_when_no_policy() {
        let lookup = MemLookup {
            enabled: HashMap::new(),
            leases: HashMap::new(),
        };
        assert!(check_lease(&lookup, GuestKind::Jail, 1, "node-a", 100).is_ok());
    }

    #[test]
    fn allows_start_when_local_node_owns_current_lease() {
        let mut lookup = MemLookup {
            enabled: HashMap::new(),
            leases: HashMap::new(),
        };
        lookup.enabled.insert((GuestKind::Vm, 5), true);
        lookup.leases.insert(
            (GuestKind::Vm, 5),
            Lease {
                owner_node_id: "node-a".into(),
                expires_at: 200,
            },
        );
        assert!(check_lease(&lookup, GuestKind::Vm, 5, "node-a", 100).is_ok());
    }

    #[test]
    fn refuses_when_lease_expired() {
        let mut lookup = MemLookup {
            enabled: HashMap::new(),
            leases: HashMap::new(),
        };
        lookup.enabled.insert((GuestKind::Vm, 5), true);
        lookup.leases.insert(
            (GuestKind::Vm, 5),
            Lease {
                owner_node_id: "node-a".into(),
                expires_at: 50,
            },
        );
        assert!(matches!(
            check_lease(&lookup, GuestKind::Vm, 5, "node-a", 100),
            Err(Error::ReplicationLeaseNotOwned)
        ));
    }

    #[test]
    fn allows_start_at_exact_expiry_boundary() {
        let mut lookup = MemLookup {
            enabled: HashMap::new(),
            leases: HashMap::new(),
        };
        lookup.enabled.insert((GuestKind::Vm, 5), true);
        lookup.leases.insert(
            (GuestKind::Vm, 5),
            Lease {
                owner_node_id: "node-a".into(),
                expires_at: 100,
            },
        );
        assert!(check_lease(&lookup, GuestKind::Vm, 5, "node-a", 100).is_ok());
    }

    #[test]
    fn refuses_when_owned_by_different_node() {
        let mut lookup = MemLookup {
            enabled: HashMap::new(),
            leases: HashMap::new(),
        };
        lookup.enabled.insert((GuestKind::Jail, 9), true);
        lookup.leases.insert(
            (GuestKind::Jail, 9),
            Lease {
                owner_node_id: "node-b".into(),
                expires_at: 200,
            },
        );
        assert!(matches!(
            check_lease(&lookup, GuestKind::Jail, 9, "node-a", 100),
            Err(Error::ReplicationLeaseNotOwned)
        ));
    }

    #[test]
    fn refuses_when_policy_enabled_but_no_lease_exists() {
        let mut lookup = MemLookup {
            enabled: HashMap::new(),
            leases: HashMap::new(),
        };
        lookup.enabled.insert((GuestKind::Jail, 9), true);
        assert!(matches!(
            check_lease(&lookup, GuestKind::Jail, 9, "node-a", 100),
            Err(Error::ReplicationLeaseNotOwned)
        ));
    }
}
