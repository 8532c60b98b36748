//! Jail engine module
//!
//! - FFI bindings to FreeBSD jail syscalls (attach/getid)
//! - Provisioning, `SyncNetwork`, resource limits, lifecycle, telemetry

pub mod engine;
pub mod ffi;
pub mod jexec;

// Re-exports
pub use engine::{JailAction, JailStatsHistory, JailStatsSample};
pub use ffi::{jail_attach, jail_getid};
pub use jexec::jexec_with_output;
