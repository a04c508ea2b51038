//! Maskable and monitorable descendants of a resource.
//!
//! The object tree and metric framework live outside this crate; what the action core
//! needs from them is small: descendants that can be masked (e.g. an optical link
//! ignored during a run) and descendants whose monitoring severity can be switched by
//! state machines. Both are addressed by their path relative to the owning resource,
//! e.g. `"inputPorts.Rx07"`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// How much a monitorable item counts towards the health of its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitoringStatus {
    /// Fully monitored
    #[default]
    Enabled,
    /// Monitored, but problems do not propagate upwards
    NonCritical,
    /// Not monitored
    Disabled,
}

impl fmt::Display for MonitoringStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MonitoringStatus::Enabled => "enabled",
            MonitoringStatus::NonCritical => "non-critical",
            MonitoringStatus::Disabled => "disabled",
        })
    }
}

/// Descendant that can be masked.
#[derive(Debug)]
pub struct MaskableObject {
    id: String,
    masked: AtomicBool,
}

impl MaskableObject {
    /// Unmasked descendant with the given relative path.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            masked: AtomicBool::new(false),
        }
    }

    /// Path relative to the owning resource.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current mask flag.
    pub fn is_masked(&self) -> bool {
        self.masked.load(Ordering::SeqCst)
    }

    /// Set the mask flag.
    pub fn set_masked(&self, masked: bool) {
        self.masked.store(masked, Ordering::SeqCst);
    }
}

/// Descendant with a switchable monitoring status.
#[derive(Debug)]
pub struct MonitorableObject {
    id: String,
    status: RwLock<MonitoringStatus>,
}

impl MonitorableObject {
    /// Enabled descendant with the given relative path.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: RwLock::new(MonitoringStatus::Enabled),
        }
    }

    /// Path relative to the owning resource.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current monitoring status.
    pub fn monitoring_status(&self) -> MonitoringStatus {
        *self.status.read()
    }

    /// Change the monitoring status.
    pub fn set_monitoring_status(&self, status: MonitoringStatus) {
        *self.status.write() = status;
    }
}
