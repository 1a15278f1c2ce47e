//! # vmlab Hypervisor
//!
//! Domain directory abstraction for the vmlab orchestration layer.
//!
//! The orchestration code only ever needs a narrow slice of the hypervisor:
//! enumerate domains, read their descriptors and state, drive power
//! transitions and manage snapshots. That slice is the [`DomainDirectory`]
//! trait.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          DomainDirectory Trait          │
//! │  (list, state, start, snapshots, ...)   │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │ LibvirtDirectory  │     │   MockDirectory   │
//! │ (virt + virsh)    │     │   (in-memory)     │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vmlab_hypervisor::{DomainDescriptor, DomainDirectory, MockDirectory};
//!
//! #[tokio::main]
//! async fn main() {
//!     let directory = MockDirectory::new();
//!     directory.define(&DomainDescriptor::new("web1")).unwrap();
//!     directory.start_domain("web1").await.unwrap();
//! }
//! ```

pub mod descriptor;
pub mod error;
pub mod libvirt;
pub mod mock;
pub mod traits;
pub mod types;

pub use descriptor::{parse_snapshot, snapshot_xml, DomainDescriptor};
pub use error::HypervisorError;
pub use mock::MockDirectory;
pub use traits::DomainDirectory;
pub use types::*;

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtDirectory;
