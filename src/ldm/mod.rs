//! Device manager adapter interfaces.
//!
//! Four adapter families abstract the hardware: *device* (path lookup
//! and identity query), *library* (slot map and media movement),
//! *filesystem* (mount, unmount, format, usage query) and *I/O*
//! (flush). A [`DeviceManager`] dispatches concrete back-ends by
//! resource family or filesystem type.
//!
//! The crate ships two back-ends: [`VirtualManager`], a complete
//! in-memory emulation for tests and debugging, and [`MtxLibrary`], a
//! library adapter driving a real SCSI changer through the `mtx`
//! command.

mod virtual_manager;
pub use virtual_manager::VirtualManager;

mod mtx;
pub use mtx::{parse_mtx_status, MtxDriveStatus, MtxLibrary, MtxSlotStatus, MtxStatus};

use anyhow::Error;
use bitflags::bitflags;

use crate::types::{FsType, MediaId, ResourceFamily, SysDeviceState};

/// Location of a medium inside a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibAddr {
    /// Let the library pick a destination
    Unknown,
    /// Storage slot
    Slot(u64),
    /// Drive bay
    Drive(u64),
}

impl Default for LibAddr {
    fn default() -> Self {
        LibAddr::Unknown
    }
}

/// Library view of one drive bay.
#[derive(Debug, Clone, Default)]
pub struct LibDriveInfo {
    pub addr: LibAddr,
    /// Whether the bay currently holds a medium
    pub full: bool,
    /// Identifier of the held medium, when known
    pub media_id: Option<MediaId>,
}

/// Library adapter failures.
#[derive(thiserror::Error, Debug)]
pub enum LibraryError {
    /// The library refuses this movement (e.g. drive-to-drive transfer)
    #[error("invalid media movement")]
    InvalidMove,
    /// The named element is not present in the library
    #[error("not found in library: '{0}'")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] Error),
}

bitflags! {
    /// Properties of a mounted filesystem reported by `df`.
    pub struct FsSpaceFlags: u32 {
        /// Mounted read-only
        const READONLY = 0x1;
    }
}

impl Default for FsSpaceFlags {
    fn default() -> Self {
        FsSpaceFlags::empty()
    }
}

/// Space usage of a filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpace {
    pub used: u64,
    pub avail: u64,
    pub flags: FsSpaceFlags,
}

/// Path lookup and identity query for drives.
pub trait DeviceAdapter {
    /// Device path for the drive with the given serial number.
    fn lookup(&self, serial: &str) -> Result<String, Error>;

    /// Identity of the device behind `path`, as the system reports it.
    fn query(&self, path: &str) -> Result<SysDeviceState, Error>;
}

/// Physical media movement between slots and drive bays.
pub trait Library {
    /// Where the drive with the given serial sits, and what it holds.
    fn drive_lookup(&self, serial: &str) -> Result<LibDriveInfo, LibraryError>;

    /// Current location of the medium with the given label.
    fn media_lookup(&self, label: &str) -> Result<LibAddr, LibraryError>;

    /// Move a medium. A destination of [`LibAddr::Unknown`] lets the
    /// library pick any free storage slot.
    fn move_media(&self, from: &LibAddr, to: &LibAddr) -> Result<(), LibraryError>;
}

/// Filesystem management on a drive's medium.
pub trait FsAdapter {
    /// Mount path of the filesystem on `dev_path`, if mounted.
    fn mounted(&self, dev_path: &str) -> Result<Option<String>, Error>;

    fn mount(&self, dev_path: &str, mnt_path: &str, fs_label: &str) -> Result<(), Error>;

    fn umount(&self, dev_path: &str, mnt_path: &str) -> Result<(), Error>;

    /// Create a filesystem labelled `fs_label`, returning its initial
    /// space accounting.
    fn format(&self, dev_path: &str, fs_label: &str) -> Result<FsSpace, Error>;

    /// Space usage of the filesystem mounted at `path`.
    fn df(&self, path: &str) -> Result<FsSpace, Error>;
}

/// Post-write data plumbing.
pub trait IoAdapter {
    /// Flush all pending data for the filesystem mounted at `root_path`.
    fn flush(&self, root_path: &str) -> Result<(), Error>;
}

/// Back-end dispatch by family and filesystem type.
pub trait DeviceManager: Send + Sync {
    fn device_adapter(&self, family: ResourceFamily) -> Result<&dyn DeviceAdapter, Error>;

    /// Open a handle to the library serving `family`. For the tape
    /// family this is the SCSI changer at `lib_device`.
    fn open_library<'a>(
        &'a self,
        family: ResourceFamily,
        lib_device: &str,
    ) -> Result<Box<dyn Library + 'a>, Error>;

    fn fs_adapter(&self, fs_type: FsType) -> Result<&dyn FsAdapter, Error>;

    fn io_adapter(&self, fs_type: FsType) -> Result<&dyn IoAdapter, Error>;
}
