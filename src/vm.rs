//! VM engine module
//!
//! - Domain XML generation for bhyve-backed libvirt guests
//! - Lifecycle (start/stop/reboot/forceoff/reset), storage attach/detach
//! - Serial console multiplexing over nmdm + `cu`

pub mod console;
pub mod domain;
pub mod engine;

pub use console::{ConsoleRegistry, ConsoleSession, ObserverInput};
pub use domain::{render as render_domain_xml, ClockOffset, DiskBus, DiskSpec, DomainSpec, NetworkSpec, VcpuPin};
pub use engine::{perform_action, VmAction};
