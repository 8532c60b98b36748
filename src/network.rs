//! Network management module: bridges, epairs, raw ioctls, and the
//! `SyncNetwork` algorithm that wires a guest's network attachments.

pub mod bridge;
pub mod epair;
pub mod ioctl;
pub mod sync;

pub use bridge::Bridge;
pub use epair::EpairInterface;
pub use sync::{ctid_hash, epair_names, GuestOsType, NetworkAttachment, NetworkRegions};
