//! Drive/media compatibility oracle.
//!
//! Answers whether a drive can read and write a given cartridge, from
//! the configured `tape_type` and `drive_type` sections: the cartridge
//! model names a list of drive types, each drive type names a list of
//! drive models. A missing section is a configuration error, distinct
//! from a clean incompatible answer; selection treats it as "skip this
//! drive".

use anyhow::{format_err, Error};

use super::DeviceDescr;
use crate::config::SchedConfig;
use crate::tools;
use crate::types::MediaInfo;

/// True when `media` can be written and read by `dev`.
pub(crate) fn tape_drive_compat(
    media: &MediaInfo,
    dev: &DeviceDescr,
    config: &SchedConfig,
) -> Result<bool, Error> {
    let media_model = media
        .model
        .as_deref()
        .ok_or_else(|| format_err!("media '{}' has no model", media.id))?;
    let drive_model = dev
        .info
        .model
        .as_deref()
        .ok_or_else(|| format_err!("drive '{}' has no model", dev.info.serial))?;

    let rw_types = config.rw_drive_types(media_model)?;
    for drive_type in rw_types.split(',').map(str::trim) {
        let models = config.drive_models(drive_type)?;
        if tools::list_contains(models, drive_model) {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{DriveTypeConfig, TapeTypeConfig};
    use crate::types::{AdmStatus, DeviceInfo, FsType, MediaId, MediaInfo, ResourceFamily};

    fn compat_config() -> SchedConfig {
        let mut config = SchedConfig::default();
        config.tape_type.insert(
            "LTO5".to_string(),
            TapeTypeConfig { drive_rw: "LTO5_drive,LTO6_drive".to_string() },
        );
        config.tape_type.insert(
            "LTO6".to_string(),
            TapeTypeConfig { drive_rw: "LTO6_drive".to_string() },
        );
        config.drive_type.insert(
            "LTO5_drive".to_string(),
            DriveTypeConfig { models: "ULTRIUM-TD5,ULT3580-TD5".to_string() },
        );
        config.drive_type.insert(
            "LTO6_drive".to_string(),
            DriveTypeConfig { models: "ULTRIUM-TD6,ULT3580-TD6".to_string() },
        );
        config
    }

    fn tape(model: &str) -> MediaInfo {
        let id = MediaId::new(ResourceFamily::Tape, "T1").unwrap();
        let mut media = MediaInfo::new(id, FsType::Ltfs);
        media.model = Some(model.to_string());
        media
    }

    fn drive(model: Option<&str>) -> DeviceDescr {
        DeviceDescr::new(DeviceInfo {
            family: ResourceFamily::Tape,
            model: model.map(str::to_string),
            path: "/dev/st0".to_string(),
            host: "here".to_string(),
            serial: "S1".to_string(),
            adm_status: AdmStatus::Unlocked,
        })
    }

    #[test]
    fn configured_pairs_are_compatible() {
        let config = compat_config();

        // every model listed under a drive type reachable from a tape
        // type must be compatible with that tape type
        for (tape_model, section) in &config.tape_type {
            for drive_type in section.drive_rw.split(',') {
                let models = config.drive_models(drive_type.trim()).unwrap().to_string();
                for drive_model in models.split(',') {
                    let compatible = tape_drive_compat(
                        &tape(tape_model),
                        &drive(Some(drive_model.trim())),
                        &config,
                    )
                    .unwrap();
                    assert!(compatible, "{} should accept {}", drive_model, tape_model);
                }
            }
        }
    }

    #[test]
    fn older_drive_rejects_newer_tape() {
        let config = compat_config();
        assert!(!tape_drive_compat(&tape("LTO6"), &drive(Some("ULTRIUM-TD5")), &config).unwrap());
        assert!(tape_drive_compat(&tape("LTO5"), &drive(Some("ULTRIUM-TD6")), &config).unwrap());
    }

    #[test]
    fn missing_sections_are_errors_not_incompatibility() {
        let config = compat_config();
        assert!(tape_drive_compat(&tape("LTO9"), &drive(Some("ULTRIUM-TD5")), &config).is_err());
        assert!(tape_drive_compat(&tape("LTO5"), &drive(None), &config).is_err());

        let mut broken = compat_config();
        broken.drive_type.remove("LTO6_drive");
        assert!(tape_drive_compat(&tape("LTO6"), &drive(Some("ULTRIUM-TD6")), &broken).is_err());
    }
}
