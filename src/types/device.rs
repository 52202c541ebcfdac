//! Drive descriptors as recorded by the catalog and reported by the
//! system.

use serde::{Deserialize, Serialize};

use super::{AdmStatus, ResourceFamily};

/// Catalog record of a drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub family: ResourceFamily,
    /// Drive model (e.g. "ULTRIUM-TD5"), None when not registered
    pub model: Option<String>,
    /// Device path configured by the administrator
    pub path: String,
    /// Host owning the drive
    pub host: String,
    /// Serial number, the stable drive identifier
    pub serial: String,
    pub adm_status: AdmStatus,
}

/// Drive identity as reported by the live system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysDeviceState {
    pub model: Option<String>,
    pub serial: Option<String>,
}

/// Operational status of a drive.
///
/// Query positions that accept any status use `Option<OpStatus>` with
/// `None` as the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    /// No medium inside
    Empty,
    /// Holds a medium, filesystem not mounted
    Loaded,
    /// Holds a medium with its filesystem mounted
    Mounted,
    /// Out of service until the next successful refresh
    Failed,
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpStatus::Empty => write!(f, "empty"),
            OpStatus::Loaded => write!(f, "loaded"),
            OpStatus::Mounted => write!(f, "mounted"),
            OpStatus::Failed => write!(f, "failed"),
        }
    }
}
