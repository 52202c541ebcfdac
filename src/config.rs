//! Scheduler configuration.
//!
//! Loading the configuration from disk is the embedding daemon's
//! business; the scheduler only consumes this plain, serde-friendly
//! data. The drive/media compatibility sections mirror the operator
//! convention of comma-separated name lists.

use std::collections::HashMap;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use crate::types::ResourceFamily;

/// Compatibility section for one cartridge model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeTypeConfig {
    /// Comma-separated list of drive type names able to read and write
    /// this cartridge model (e.g. "LTO5_drive,LTO6_drive")
    pub drive_rw: String,
}

/// Compatibility section for one drive type name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveTypeConfig {
    /// Comma-separated list of drive models belonging to this type
    /// (e.g. "ULTRIUM-TD5,ULT3580-TD5")
    pub models: String,
}

/// Scheduler section of the host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedConfig {
    /// Prefix for generated mount points
    #[serde(default = "default_mount_prefix")]
    pub mount_prefix: String,
    /// Family served by default for write allocations
    pub default_family: ResourceFamily,
    /// SCSI path of the tape library controller
    #[serde(default = "default_lib_device")]
    pub lib_device: String,
    /// Write selection policy, "best_fit" or "first_fit"
    #[serde(default = "default_policy")]
    pub policy: String,
    /// Cartridge model compatibility sections
    #[serde(default)]
    pub tape_type: HashMap<String, TapeTypeConfig>,
    /// Drive type sections
    #[serde(default)]
    pub drive_type: HashMap<String, DriveTypeConfig>,
}

fn default_mount_prefix() -> String {
    "/mnt/media-".to_string()
}

fn default_lib_device() -> String {
    "/dev/changer".to_string()
}

fn default_policy() -> String {
    "best_fit".to_string()
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            mount_prefix: default_mount_prefix(),
            default_family: ResourceFamily::Tape,
            lib_device: default_lib_device(),
            policy: default_policy(),
            tape_type: HashMap::new(),
            drive_type: HashMap::new(),
        }
    }
}

impl SchedConfig {
    /// Mount point for the drive identified by `id` (conventionally the
    /// basename of the device path). Operators rely on this stable form.
    pub fn mount_point(&self, id: &str) -> String {
        format!("{}{}", self.mount_prefix, id)
    }

    /// Drive type names able to read/write the given cartridge model.
    pub fn rw_drive_types(&self, tape_model: &str) -> Result<&str, Error> {
        self.tape_type
            .get(tape_model)
            .map(|section| section.drive_rw.as_str())
            .ok_or_else(|| {
                format_err!(
                    "no 'drive_rw' parameter in section 'tape_type \"{}\"'",
                    tape_model
                )
            })
    }

    /// Drive models belonging to the given drive type name.
    pub fn drive_models(&self, drive_type: &str) -> Result<&str, Error> {
        self.drive_type
            .get(drive_type)
            .map(|section| section.models.as_str())
            .ok_or_else(|| {
                format_err!(
                    "no 'models' parameter in section 'drive_type \"{}\"'",
                    drive_type
                )
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mount_point_composition() {
        let mut config = SchedConfig::default();
        config.mount_prefix = "/mnt/t-".to_string();
        assert_eq!(config.mount_point("st0"), "/mnt/t-st0");
    }

    #[test]
    fn compat_section_lookup() {
        let mut config = SchedConfig::default();
        config.tape_type.insert(
            "LTO5".to_string(),
            TapeTypeConfig { drive_rw: "LTO5_drive,LTO6_drive".to_string() },
        );

        assert_eq!(config.rw_drive_types("LTO5").unwrap(), "LTO5_drive,LTO6_drive");
        assert!(config.rw_drive_types("LTO9").is_err());
        assert!(config.drive_models("LTO5_drive").is_err());
    }

    #[test]
    fn deserialize_with_defaults() {
        let config: SchedConfig =
            serde_json::from_value(serde_json::json!({ "default_family": "tape" })).unwrap();
        assert_eq!(config.policy, "best_fit");
        assert_eq!(config.mount_prefix, "/mnt/media-");
        assert_eq!(config.default_family, ResourceFamily::Tape);
    }
}
