//! # vmlab Core
//!
//! Orchestration of disposable test VMs on top of a
//! [`DomainDirectory`](vmlab_hypervisor::DomainDirectory).
//!
//! ## Components
//!
//! - [`NetworkDiscovery`] maps MAC addresses to IPs with an ARP scan
//! - [`DomainInventory`] joins domain descriptors with the scan
//! - [`RemoteExecutor`] runs commands over one cached session per (VM, user)
//! - [`StatusOracle`] classifies reachability and waits for a status
//! - [`SnapshotManager`] keeps each VM's snapshot chain
//! - [`Vm`] ties the above together per domain, [`Lab`] owns them all
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vmlab_core::{Config, Lab};
//! use vmlab_hypervisor::MockDirectory;
//!
//! let lab = Lab::builder(Config::default(), Arc::new(MockDirectory::new())).build();
//! lab.reload().await?;
//! let vm = lab.vm("web1")?;
//! vm.run_and_wait().await?;
//! vm.snapshots().take("clean").await?;
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod lab;
pub mod mock;
pub mod session;
pub mod shell;
pub mod snapshot;
pub mod status;
pub mod vm;

pub use config::Config;
pub use discovery::{normalize_mac, parse_scan_output, NetworkDiscovery};
pub use error::{LabError, Result};
pub use executor::{RemoteExecutor, RunOptions};
pub use inventory::{render_table, DomainAttributes, DomainInventory, TableRow, UNKNOWN_MAC};
pub use lab::{Lab, LabBuilder};
pub use session::{OpensshConnector, RemoteSession, SessionConnector, SessionManager};
pub use shell::{HostShell, LocalShell, ShellResult};
pub use snapshot::SnapshotManager;
pub use status::{NetworkProbe, ReachabilityProbe, StatusOracle, VmStatus};
pub use vm::Vm;
