//! Common resource types shared between the catalog, the device manager
//! adapters and the scheduler core.

mod media;
pub use media::*;

mod device;
pub use device::*;

use anyhow::{bail, Error};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref IDENTIFIER_REGEX: regex::Regex =
        regex::Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").unwrap();
}

/// Check that a resource identifier (media label, drive serial) is
/// well-formed.
pub fn check_identifier(id: &str) -> Result<(), Error> {
    if !IDENTIFIER_REGEX.is_match(id) {
        bail!("invalid resource identifier '{}'", id);
    }
    Ok(())
}

/// Storage class of a resource.
///
/// The family selects which device manager back-ends apply to a drive or
/// a medium. Unknown family names are a parse error, there is no invalid
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceFamily {
    /// Tape drives and cartridges behind a robotic library
    Tape,
    /// Directory backed pseudo-drives
    Dir,
    /// Raw disk devices
    Disk,
}

impl std::fmt::Display for ResourceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceFamily::Tape => write!(f, "tape"),
            ResourceFamily::Dir => write!(f, "dir"),
            ResourceFamily::Disk => write!(f, "disk"),
        }
    }
}

impl std::str::FromStr for ResourceFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tape" => Ok(ResourceFamily::Tape),
            "dir" => Ok(ResourceFamily::Dir),
            "disk" => Ok(ResourceFamily::Disk),
            _ => bail!("unknown resource family '{}'", s),
        }
    }
}

/// Filesystem type written on a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    /// Plain POSIX filesystem (directory family)
    Posix,
    /// LTFS formatted tape
    Ltfs,
}

impl Default for FsType {
    fn default() -> Self {
        FsType::Posix
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsType::Posix => write!(f, "posix"),
            FsType::Ltfs => write!(f, "ltfs"),
        }
    }
}

/// Address scheme used to name extents inside a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// Extents addressed by relative path
    Path,
    /// Extents addressed by hash
    Hash1,
    /// Back-end specific opaque addressing
    Opaque,
}

impl Default for AddressType {
    fn default() -> Self {
        AddressType::Path
    }
}

/// Administrative status of a drive or a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmStatus {
    /// Usable
    Unlocked,
    /// Excluded from scheduling by the administrator
    Locked,
    /// Marked broken by the administrator
    Failed,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn family_string_round_trip() {
        for fam in &[ResourceFamily::Tape, ResourceFamily::Dir, ResourceFamily::Disk] {
            let text = fam.to_string();
            let back: ResourceFamily = text.parse().unwrap();
            assert_eq!(back, *fam);
            // serde uses the same strings as Display
            assert_eq!(serde_json::to_value(fam).unwrap(), serde_json::json!(text));
        }
        assert!("floppy".parse::<ResourceFamily>().is_err());
    }

    #[test]
    fn identifier_validation() {
        check_identifier("P00003L5").unwrap();
        check_identifier("drive_3.bay-1").unwrap();
        assert!(check_identifier("").is_err());
        assert!(check_identifier("bad label").is_err());
        assert!(check_identifier("-leading").is_err());
    }
}
