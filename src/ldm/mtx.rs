//! SCSI media changer adapter driving the `mtx` command.
//!
//! `mtx status` reports drive bays as "Data Transfer Element" lines and
//! storage slots as "Storage Element" lines; volume tags carry the
//! media labels. Movements map to the `load`, `unload` and `transfer`
//! subcommands. mtx cannot transfer directly between two drives, which
//! the scheduler handles as a busy-retry condition.

use std::collections::HashMap;

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;

use super::{LibAddr, LibDriveInfo, Library, LibraryError};
use crate::tools::{command_call, OutputChannel};
use crate::types::{MediaId, ResourceFamily};

lazy_static! {
    static ref DRIVE_LINE: regex::Regex = regex::Regex::new(
        r"^Data Transfer Element (\d+):(Empty|Full)(?: \(Storage Element (\d+) Loaded\))? ?(?::VolumeTag ?= ?(\S+))?"
    )
    .unwrap();
    static ref SLOT_LINE: regex::Regex = regex::Regex::new(
        r"^\s*Storage Element (\d+)( IMPORT/EXPORT)?:(Empty|Full)(?: ?:VolumeTag ?= ?(\S+))?"
    )
    .unwrap();
}

/// One "Data Transfer Element" line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtxDriveStatus {
    pub element: u64,
    pub full: bool,
    /// Slot the medium was loaded from, when reported
    pub loaded_slot: Option<u64>,
    pub label: Option<String>,
}

/// One "Storage Element" line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtxSlotStatus {
    pub element: u64,
    pub import_export: bool,
    pub full: bool,
    pub label: Option<String>,
}

/// Parsed `mtx status` output.
#[derive(Debug, Clone, Default)]
pub struct MtxStatus {
    pub drives: Vec<MtxDriveStatus>,
    pub slots: Vec<MtxSlotStatus>,
}

/// Parse the output of `mtx -f <dev> status`.
pub fn parse_mtx_status(output: &str) -> Result<MtxStatus, Error> {
    let mut status = MtxStatus::default();

    for line in output.lines() {
        if let Some(caps) = DRIVE_LINE.captures(line) {
            let element = crate::tools::parse_i64(&caps[1])? as u64;
            let full = &caps[2] == "Full";
            let loaded_slot = match caps.get(3) {
                Some(m) => Some(crate::tools::parse_i64(m.as_str())? as u64),
                None => None,
            };
            let label = caps.get(4).map(|m| m.as_str().to_string());
            if !full && label.is_some() {
                bail!("volume tag on an empty drive: '{}'", line);
            }
            status.drives.push(MtxDriveStatus { element, full, loaded_slot, label });
        } else if let Some(caps) = SLOT_LINE.captures(line) {
            let element = crate::tools::parse_i64(&caps[1])? as u64;
            let import_export = caps.get(2).is_some();
            let full = &caps[3] == "Full";
            let label = caps.get(4).map(|m| m.as_str().to_string());
            status.slots.push(MtxSlotStatus { element, import_export, full, label });
        }
        // header and trailing lines are not interesting
    }

    Ok(status)
}

/// Library adapter backed by a SCSI changer controlled through `mtx`.
pub struct MtxLibrary {
    changer_path: String,
    /// Drive serial number to data transfer element number
    drive_elements: HashMap<String, u64>,
}

impl MtxLibrary {
    /// `drive_elements` maps each drive serial to its data transfer
    /// element number; `mtx` itself only knows element numbers.
    pub fn new<I>(changer_path: &str, drive_elements: I) -> Self
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        MtxLibrary {
            changer_path: changer_path.to_string(),
            drive_elements: drive_elements.into_iter().collect(),
        }
    }

    fn mtx_command(&self, subcommand: &str) -> String {
        format!("mtx -f {} {}", self.changer_path, subcommand)
    }

    fn run(&self, subcommand: &str) -> Result<String, Error> {
        let cmd = self.mtx_command(subcommand);
        let mut output = String::new();
        command_call(&cmd, |chan, line| match chan {
            OutputChannel::Stdout => {
                output.push_str(line);
                output.push('\n');
            }
            OutputChannel::Stderr => log::warn!("mtx: {}", line),
        })
        .map_err(|err| format_err!("'{}' failed: {}", cmd, err))?;
        Ok(output)
    }

    fn status(&self) -> Result<MtxStatus, LibraryError> {
        let output = self.run("status")?;
        Ok(parse_mtx_status(&output)?)
    }
}

impl Library for MtxLibrary {
    fn drive_lookup(&self, serial: &str) -> Result<LibDriveInfo, LibraryError> {
        let element = *self
            .drive_elements
            .get(serial)
            .ok_or_else(|| LibraryError::NotFound(serial.to_string()))?;
        let status = self.status()?;
        let drive = status
            .drives
            .iter()
            .find(|d| d.element == element)
            .ok_or_else(|| LibraryError::NotFound(format!("drive element {}", element)))?;
        Ok(LibDriveInfo {
            addr: LibAddr::Drive(element),
            full: drive.full,
            media_id: drive.label.as_ref().map(|label| MediaId {
                family: ResourceFamily::Tape,
                label: label.clone(),
            }),
        })
    }

    fn media_lookup(&self, label: &str) -> Result<LibAddr, LibraryError> {
        let status = self.status()?;
        if let Some(drive) = status
            .drives
            .iter()
            .find(|d| d.label.as_deref() == Some(label))
        {
            return Ok(LibAddr::Drive(drive.element));
        }
        if let Some(slot) = status
            .slots
            .iter()
            .find(|s| s.label.as_deref() == Some(label))
        {
            return Ok(LibAddr::Slot(slot.element));
        }
        Err(LibraryError::NotFound(label.to_string()))
    }

    fn move_media(&self, from: &LibAddr, to: &LibAddr) -> Result<(), LibraryError> {
        match (*from, *to) {
            (LibAddr::Slot(slot), LibAddr::Drive(drive)) => {
                self.run(&format!("load {} {}", slot, drive))?;
                Ok(())
            }
            (LibAddr::Drive(drive), LibAddr::Slot(slot)) => {
                self.run(&format!("unload {} {}", slot, drive))?;
                Ok(())
            }
            (LibAddr::Drive(drive), LibAddr::Unknown) => {
                let status = self.status()?;
                let slot = status
                    .slots
                    .iter()
                    .find(|s| !s.full && !s.import_export)
                    .ok_or_else(|| {
                        LibraryError::Other(format_err!("no free storage slot"))
                    })?;
                self.run(&format!("unload {} {}", slot.element, drive))?;
                Ok(())
            }
            (LibAddr::Slot(from_slot), LibAddr::Slot(to_slot)) => {
                self.run(&format!("transfer {} {}", from_slot, to_slot))?;
                Ok(())
            }
            // mtx has no drive-to-drive transfer
            (LibAddr::Drive(_), LibAddr::Drive(_)) => Err(LibraryError::InvalidMove),
            _ => Err(LibraryError::InvalidMove),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE_STATUS: &str = "\
  Storage Changer /dev/sg3:2 Drives, 6 Slots ( 1 Import/Export )
Data Transfer Element 0:Full (Storage Element 2 Loaded):VolumeTag = P00001L5
Data Transfer Element 1:Empty
      Storage Element 1:Full :VolumeTag=P00002L5
      Storage Element 2:Empty
      Storage Element 3:Full :VolumeTag=P00003L5
      Storage Element 4:Empty
      Storage Element 5:Empty
      Storage Element 6 IMPORT/EXPORT:Empty
";

    #[test]
    fn parse_sample_status() {
        let status = parse_mtx_status(SAMPLE_STATUS).unwrap();

        assert_eq!(status.drives.len(), 2);
        assert_eq!(
            status.drives[0],
            MtxDriveStatus {
                element: 0,
                full: true,
                loaded_slot: Some(2),
                label: Some("P00001L5".to_string()),
            }
        );
        assert_eq!(
            status.drives[1],
            MtxDriveStatus { element: 1, full: false, loaded_slot: None, label: None }
        );

        assert_eq!(status.slots.len(), 6);
        assert_eq!(status.slots[0].label.as_deref(), Some("P00002L5"));
        assert!(!status.slots[1].full);
        assert!(status.slots[5].import_export);
        assert!(status.slots.iter().filter(|s| s.full).count() == 2);
    }

    #[test]
    fn parse_spaced_volume_tags() {
        let text = "Data Transfer Element 0:Full:VolumeTag = ABC123L6\n";
        let status = parse_mtx_status(text).unwrap();
        assert_eq!(status.drives[0].label.as_deref(), Some("ABC123L6"));
        assert_eq!(status.drives[0].loaded_slot, None);
    }

    #[test]
    fn command_lines() {
        let lib = MtxLibrary::new("/dev/sg3", vec![("S1".to_string(), 0)]);
        assert_eq!(lib.mtx_command("load 3 0"), "mtx -f /dev/sg3 load 3 0");
        assert_eq!(lib.mtx_command("status"), "mtx -f /dev/sg3 status");
    }

    #[test]
    fn drive_to_drive_is_invalid() {
        let lib = MtxLibrary::new("/dev/sg3", Vec::new());
        match lib.move_media(&LibAddr::Drive(0), &LibAddr::Drive(1)) {
            Err(LibraryError::InvalidMove) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
