//! In-memory device manager (only for test and debug).
//!
//! Emulates a small library: drive bays, storage slots, media with
//! per-medium space accounting and a switchable read-only flag. All
//! four adapter families are served from the same shared state, so a
//! scheduler wired to a [`VirtualManager`] behaves like one driving
//! real hardware, minus the hardware.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, format_err, Error};

use super::{
    DeviceAdapter, DeviceManager, FsAdapter, FsSpace, FsSpaceFlags, IoAdapter, LibAddr,
    LibDriveInfo, Library, LibraryError,
};
use crate::types::{FsType, MediaId, ResourceFamily, SysDeviceState};

struct VirtDrive {
    serial: String,
    model: Option<String>,
    dev_path: String,
    media: Option<String>,
}

struct VirtMedia {
    id: MediaId,
    fs_type: FsType,
    fs_label: String,
    formatted: bool,
    capacity: u64,
    used: u64,
    readonly: bool,
    mounted_at: Option<String>,
}

#[derive(Default)]
struct VirtState {
    drives: Vec<VirtDrive>,
    slots: Vec<Option<String>>,
    media: HashMap<String, VirtMedia>,
    allow_drive_to_drive: bool,
}

/// In-memory implementation of every adapter family.
pub struct VirtualManager {
    state: Arc<Mutex<VirtState>>,
}

impl Default for VirtualManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualManager {
    pub fn new() -> Self {
        VirtualManager {
            state: Arc::new(Mutex::new(VirtState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VirtState> {
        self.state.lock().unwrap()
    }

    /// Register a drive bay.
    pub fn add_drive(&self, serial: &str, model: Option<&str>, dev_path: &str) {
        self.lock().drives.push(VirtDrive {
            serial: serial.to_string(),
            model: model.map(str::to_string),
            dev_path: dev_path.to_string(),
            media: None,
        });
    }

    /// Register an unformatted medium, stored in a fresh slot.
    pub fn add_media(&self, id: &MediaId, fs_type: FsType, capacity: u64) {
        let mut state = self.lock();
        state.media.insert(
            id.label.clone(),
            VirtMedia {
                id: id.clone(),
                fs_type,
                fs_label: String::new(),
                formatted: false,
                capacity,
                used: 0,
                readonly: false,
                mounted_at: None,
            },
        );
        state.slots.push(Some(id.label.clone()));
    }

    /// Mark a medium formatted without going through the adapter.
    pub fn set_formatted(&self, label: &str) {
        if let Some(media) = self.lock().media.get_mut(label) {
            media.formatted = true;
            media.fs_label = label.to_string();
        }
    }

    /// Make the filesystem of a medium appear read-only.
    pub fn set_readonly(&self, label: &str, readonly: bool) {
        if let Some(media) = self.lock().media.get_mut(label) {
            media.readonly = readonly;
        }
    }

    /// Account `bytes` of payload written to a medium.
    pub fn consume_space(&self, label: &str, bytes: u64) {
        if let Some(media) = self.lock().media.get_mut(label) {
            media.used = (media.used + bytes).min(media.capacity);
        }
    }

    /// Move a medium from its slot straight into a drive bay.
    pub fn place_in_drive(&self, label: &str, serial: &str) {
        let mut state = self.lock();
        for slot in state.slots.iter_mut() {
            if slot.as_deref() == Some(label) {
                *slot = None;
            }
        }
        if let Some(drive) = state.drives.iter_mut().find(|d| d.serial == serial) {
            drive.media = Some(label.to_string());
        }
    }

    /// Mark the medium inside a drive as mounted at `mnt_path`.
    pub fn set_mounted(&self, label: &str, mnt_path: &str) {
        if let Some(media) = self.lock().media.get_mut(label) {
            media.mounted_at = Some(mnt_path.to_string());
        }
    }

    /// Allow or refuse direct drive-to-drive transfers (refused by
    /// default, as most changers do).
    pub fn set_allow_drive_to_drive(&self, allow: bool) {
        self.lock().allow_drive_to_drive = allow;
    }

    /// Label of the medium inside the drive with `serial`, if any.
    pub fn drive_media(&self, serial: &str) -> Option<String> {
        self.lock()
            .drives
            .iter()
            .find(|d| d.serial == serial)
            .and_then(|d| d.media.clone())
    }

    /// True when the medium currently sits in a storage slot.
    pub fn media_in_slot(&self, label: &str) -> bool {
        self.lock()
            .slots
            .iter()
            .any(|slot| slot.as_deref() == Some(label))
    }
}

fn media_in_drive<'a>(
    state: &'a mut VirtState,
    dev_path: &str,
) -> Result<&'a mut VirtMedia, Error> {
    let label = state
        .drives
        .iter()
        .find(|d| d.dev_path == dev_path)
        .ok_or_else(|| format_err!("no drive with path '{}'", dev_path))?
        .media
        .clone()
        .ok_or_else(|| format_err!("no media in drive '{}'", dev_path))?;
    state
        .media
        .get_mut(&label)
        .ok_or_else(|| format_err!("unknown media '{}'", label))
}

fn space_of(media: &VirtMedia) -> FsSpace {
    FsSpace {
        used: media.used,
        avail: media.capacity - media.used,
        flags: if media.readonly {
            FsSpaceFlags::READONLY
        } else {
            FsSpaceFlags::empty()
        },
    }
}

impl DeviceAdapter for VirtualManager {
    fn lookup(&self, serial: &str) -> Result<String, Error> {
        self.lock()
            .drives
            .iter()
            .find(|d| d.serial == serial)
            .map(|d| d.dev_path.clone())
            .ok_or_else(|| format_err!("no device with serial '{}'", serial))
    }

    fn query(&self, path: &str) -> Result<SysDeviceState, Error> {
        self.lock()
            .drives
            .iter()
            .find(|d| d.dev_path == path)
            .map(|d| SysDeviceState {
                model: d.model.clone(),
                serial: Some(d.serial.clone()),
            })
            .ok_or_else(|| format_err!("no device at path '{}'", path))
    }
}

impl FsAdapter for VirtualManager {
    fn mounted(&self, dev_path: &str) -> Result<Option<String>, Error> {
        let mut state = self.lock();
        let media = media_in_drive(&mut state, dev_path)?;
        Ok(media.mounted_at.clone())
    }

    fn mount(&self, dev_path: &str, mnt_path: &str, _fs_label: &str) -> Result<(), Error> {
        let mut state = self.lock();
        let media = media_in_drive(&mut state, dev_path)?;
        if !media.formatted {
            bail!("media '{}' has no filesystem", media.id);
        }
        if media.mounted_at.is_some() {
            bail!("media '{}' is already mounted", media.id);
        }
        media.mounted_at = Some(mnt_path.to_string());
        Ok(())
    }

    fn umount(&self, dev_path: &str, mnt_path: &str) -> Result<(), Error> {
        let mut state = self.lock();
        let media = media_in_drive(&mut state, dev_path)?;
        if media.mounted_at.as_deref() != Some(mnt_path) {
            bail!("media '{}' is not mounted at '{}'", media.id, mnt_path);
        }
        media.mounted_at = None;
        Ok(())
    }

    fn format(&self, dev_path: &str, fs_label: &str) -> Result<FsSpace, Error> {
        let mut state = self.lock();
        let media = media_in_drive(&mut state, dev_path)?;
        if media.mounted_at.is_some() {
            bail!("cannot format mounted media '{}'", media.id);
        }
        media.formatted = true;
        media.fs_label = fs_label.to_string();
        media.used = 0;
        Ok(space_of(media))
    }

    fn df(&self, path: &str) -> Result<FsSpace, Error> {
        let state = self.lock();
        state
            .media
            .values()
            .find(|m| m.mounted_at.as_deref() == Some(path))
            .map(space_of)
            .ok_or_else(|| format_err!("nothing mounted at '{}'", path))
    }
}

impl IoAdapter for VirtualManager {
    fn flush(&self, root_path: &str) -> Result<(), Error> {
        let state = self.lock();
        if !state
            .media
            .values()
            .any(|m| m.mounted_at.as_deref() == Some(root_path))
        {
            bail!("nothing mounted at '{}'", root_path);
        }
        Ok(())
    }
}

/// Library view over a [`VirtualManager`]'s state.
struct VirtualLibrary {
    state: Arc<Mutex<VirtState>>,
}

impl Library for VirtualLibrary {
    fn drive_lookup(&self, serial: &str) -> Result<LibDriveInfo, LibraryError> {
        let state = self.state.lock().unwrap();
        let (index, drive) = state
            .drives
            .iter()
            .enumerate()
            .find(|(_, d)| d.serial == serial)
            .ok_or_else(|| LibraryError::NotFound(serial.to_string()))?;
        let media_id = drive
            .media
            .as_ref()
            .and_then(|label| state.media.get(label))
            .map(|m| m.id.clone());
        Ok(LibDriveInfo {
            addr: LibAddr::Drive(index as u64),
            full: drive.media.is_some(),
            media_id,
        })
    }

    fn media_lookup(&self, label: &str) -> Result<LibAddr, LibraryError> {
        let state = self.state.lock().unwrap();
        if let Some(index) = state
            .drives
            .iter()
            .position(|d| d.media.as_deref() == Some(label))
        {
            return Ok(LibAddr::Drive(index as u64));
        }
        if let Some(index) = state
            .slots
            .iter()
            .position(|slot| slot.as_deref() == Some(label))
        {
            return Ok(LibAddr::Slot(index as u64));
        }
        Err(LibraryError::NotFound(label.to_string()))
    }

    fn move_media(&self, from: &LibAddr, to: &LibAddr) -> Result<(), LibraryError> {
        let mut state = self.state.lock().unwrap();

        if let (LibAddr::Drive(_), LibAddr::Drive(_)) = (from, to) {
            if !state.allow_drive_to_drive {
                return Err(LibraryError::InvalidMove);
            }
        }

        // resolve the destination before touching the source
        let dest = match *to {
            LibAddr::Unknown => {
                match state.slots.iter().position(|slot| slot.is_none()) {
                    Some(index) => LibAddr::Slot(index as u64),
                    None => {
                        state.slots.push(None);
                        LibAddr::Slot((state.slots.len() - 1) as u64)
                    }
                }
            }
            addr => addr,
        };

        let label = match *from {
            LibAddr::Drive(index) => {
                let drive = state
                    .drives
                    .get_mut(index as usize)
                    .ok_or(LibraryError::InvalidMove)?;
                let label = drive
                    .media
                    .clone()
                    .ok_or_else(|| LibraryError::NotFound(format!("drive {}", index)))?;
                if let Some(media) = state.media.get(&label) {
                    if media.mounted_at.is_some() {
                        return Err(
                            format_err!("media '{}' is still mounted", label).into()
                        );
                    }
                }
                state.drives[index as usize].media = None;
                label
            }
            LibAddr::Slot(index) => {
                let slot = state
                    .slots
                    .get_mut(index as usize)
                    .ok_or(LibraryError::InvalidMove)?;
                slot.take()
                    .ok_or_else(|| LibraryError::NotFound(format!("slot {}", index)))?
            }
            LibAddr::Unknown => return Err(LibraryError::InvalidMove),
        };

        match dest {
            LibAddr::Drive(index) => {
                let drive = state
                    .drives
                    .get_mut(index as usize)
                    .ok_or(LibraryError::InvalidMove)?;
                if drive.media.is_some() {
                    return Err(format_err!("drive bay {} is occupied", index).into());
                }
                drive.media = Some(label);
            }
            LibAddr::Slot(index) => {
                let slot = state
                    .slots
                    .get_mut(index as usize)
                    .ok_or(LibraryError::InvalidMove)?;
                if slot.is_some() {
                    return Err(format_err!("slot {} is occupied", index).into());
                }
                *slot = Some(label);
            }
            LibAddr::Unknown => return Err(LibraryError::InvalidMove),
        }

        Ok(())
    }
}

impl DeviceManager for VirtualManager {
    fn device_adapter(&self, _family: ResourceFamily) -> Result<&dyn DeviceAdapter, Error> {
        Ok(self)
    }

    fn open_library<'a>(
        &'a self,
        _family: ResourceFamily,
        _lib_device: &str,
    ) -> Result<Box<dyn Library + 'a>, Error> {
        Ok(Box::new(VirtualLibrary {
            state: Arc::clone(&self.state),
        }))
    }

    fn fs_adapter(&self, _fs_type: FsType) -> Result<&dyn FsAdapter, Error> {
        Ok(self)
    }

    fn io_adapter(&self, _fs_type: FsType) -> Result<&dyn IoAdapter, Error> {
        Ok(self)
    }
}
