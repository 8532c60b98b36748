//! Replication module: wire protocol, QUIC transport, backup scheduler,
//! and the lease gate that arbitrates which node may push a dataset.

pub mod lease;
pub mod protocol;
pub mod scheduler;
pub mod transport;

pub use lease::{check_lease, GuestKind, Lease, LeaseLookup};
pub use protocol::{Action, Request, Response};
pub use scheduler::{BackupJob, ClusterInfo, CronExpr, JobKind, JobStore, Replicator, Scheduler};
pub use transport::{
    build_client_config, build_server_config, pull_dataset_from_node, replicate_dataset_to_node,
    resolve_peer, serve_connection, simple_request, PeerDirectory, PullOutcome, PushOutcome,
    TlsPaths, TokenVerifier,
};
