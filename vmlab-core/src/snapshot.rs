//! Linear snapshot chains.
//!
//! Every snapshot records the snapshot that was current when it was taken as
//! its parent, so a VM's snapshots form a chain. Restoring a snapshot prunes
//! everything taken after it.

use tracing::{debug, info};
use vmlab_hypervisor::{parse_snapshot, Snapshot};

use crate::error::{LabError, Result};
use crate::vm::Vm;

/// Snapshot operations on one VM.
pub struct SnapshotManager<'a> {
    vm: &'a Vm,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(vm: &'a Vm) -> Self {
        Self { vm }
    }

    fn name(&self) -> &str {
        self.vm.name()
    }

    /// Snapshot names, oldest first.
    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self.vm.lab().directory().list_snapshots(self.name()).await?)
    }

    /// Stop the VM and snapshot it on top of the current snapshot.
    pub async fn take(&self, name: &str) -> Result<()> {
        self.vm.stop_and_wait().await?;

        let parent = self.current_name().await;
        info!(vm = %self.name(), snapshot = %name, parent = ?parent, "Taking snapshot");
        self.vm
            .lab()
            .directory()
            .create_snapshot(self.name(), &Snapshot::new(name, parent))
            .await?;
        Ok(())
    }

    /// Revert to `name` and delete every snapshot taken after it.
    pub async fn restore(&self, name: &str) -> Result<()> {
        let snapshots = self.list().await?;
        if !snapshots.iter().any(|s| s == name) {
            return Err(LabError::ArgumentError(format!(
                "No snapshot named {}",
                name
            )));
        }

        info!(vm = %self.name(), snapshot = %name, "Restoring snapshot");
        let directory = self.vm.lab().directory();
        directory.revert_snapshot(self.name(), name).await?;

        for snapshot in snapshots.iter().rev() {
            if snapshot == name {
                break;
            }
            debug!(vm = %self.name(), snapshot = %snapshot, "Pruning snapshot");
            directory.delete_snapshot(self.name(), snapshot).await?;
        }
        Ok(())
    }

    /// Restore the newest snapshot.
    pub async fn restore_last(&self) -> Result<()> {
        let snapshots = self.list().await?;
        let Some(last) = snapshots.last() else {
            return Err(LabError::ArgumentError(format!(
                "{} has no snapshots",
                self.name()
            )));
        };
        self.restore(last).await
    }

    /// Delete one snapshot; its children are kept.
    pub async fn delete(&self, name: &str) -> Result<()> {
        info!(vm = %self.name(), snapshot = %name, "Deleting snapshot");
        Ok(self
            .vm
            .lab()
            .directory()
            .delete_snapshot(self.name(), name)
            .await?)
    }

    /// The current snapshot, or `None` when there is none or it cannot be
    /// read.
    pub async fn current(&self) -> Option<Snapshot> {
        let xml = match self
            .vm
            .lab()
            .directory()
            .current_snapshot_xml(self.name())
            .await
        {
            Ok(Some(xml)) => xml,
            Ok(None) => return None,
            Err(e) => {
                debug!(vm = %self.name(), error = %e, "Current snapshot unavailable");
                return None;
            }
        };

        match parse_snapshot(&xml) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!(vm = %self.name(), error = %e, "Current snapshot unreadable");
                None
            }
        }
    }

    pub async fn current_name(&self) -> Option<String> {
        self.current().await.map(|s| s.name)
    }

    pub async fn current_parent_name(&self) -> Option<String> {
        self.current().await.and_then(|s| s.parent)
    }
}
