//! Type definitions shared by every domain directory backend.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// DOMAIN STATE
// =============================================================================

/// Hypervisor-reported power state of a domain.
///
/// Backends translate their raw state codes into this enum once, at the edge;
/// nothing above the directory sees the numeric constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
}

impl DomainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::NoState => "no state",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
        }
    }

    /// Whether the domain currently holds hypervisor resources.
    ///
    /// Mirrors libvirt's notion of an "active" domain: such domains show up in
    /// the running list rather than the defined-only list.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DomainState::Running
                | DomainState::Blocked
                | DomainState::Paused
                | DomainState::Shutdown
        )
    }
}

impl Default for DomainState {
    fn default() -> Self {
        Self::NoState
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// One node of a domain's snapshot chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot name, unique per domain
    pub name: String,
    /// Name of the snapshot this one was taken on top of
    pub parent: Option<String>,
}

impl Snapshot {
    pub fn new(name: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            name: name.into(),
            parent,
        }
    }
}
