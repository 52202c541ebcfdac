//! Local resource scheduler.
//!
//! Per-host core that, given an I/O intent (read, write or format of a
//! specific medium), selects and prepares a physical drive and medium,
//! mediates concurrent access through catalog locks, and walks each
//! drive through the empty / loaded / mounted state machine.

mod lock;

mod compat;

mod select;

mod sm;

mod prepare;

use std::sync::Arc;

use anyhow::{format_err, Error};

use crate::catalog::{self, Catalog};
use crate::config::SchedConfig;
use crate::ldm::{DeviceManager, LibDriveInfo, Library};
use crate::tools;
use crate::types::{
    AddressType, DeviceInfo, FsType, MediaId, MediaInfo, MediaLock, OpStatus, SysDeviceState,
};

/// Failure classes of the public scheduler entry points.
///
/// Every entry point either fully succeeds (all promised locks held,
/// registry consistent) or fully fails (no lock held that was not held
/// before the call).
#[derive(thiserror::Error, Debug)]
pub enum SchedError {
    /// Malformed request or inconsistent state reported by the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The named resource does not exist in the catalog
    #[error("not found: {0}")]
    NotFound(String),
    /// No medium anywhere fits the requested size
    #[error("no media with enough free space")]
    NoSpace,
    /// All candidates are held elsewhere or hardware is transiently
    /// unavailable; the caller should back off and retry
    #[error("resources busy, retry later")]
    Busy,
    /// No compatible, unfailed, admin-unlocked drive exists
    #[error("no compatible device available")]
    NoDevice,
    /// The involved drive failed and was taken out of service
    #[error("drive failure: {0}")]
    DriveFailure(String),
    /// The catalog itself failed
    #[error("catalog failure: {0}")]
    Catalog(#[source] Error),
    #[error(transparent)]
    Other(#[from] Error),
}

/// Registry entry: everything known about one drive on this host.
#[derive(Debug)]
pub struct DeviceDescr {
    /// Catalog view
    pub info: DeviceInfo,
    /// Library view
    pub lib_info: LibDriveInfo,
    /// Identity reported by the system
    pub sys_state: SysDeviceState,
    pub op_status: OpStatus,
    /// Resolved device path
    pub dev_path: String,
    /// Mount path, empty while not mounted
    pub mnt_path: String,
    /// Contained medium, present in loaded and mounted states
    pub media: Option<MediaInfo>,
    /// Whether this process holds the catalog lock on the drive
    pub locked_local: bool,
}

impl DeviceDescr {
    fn new(info: DeviceInfo) -> Self {
        DeviceDescr {
            info,
            lib_info: LibDriveInfo::default(),
            sys_state: SysDeviceState::default(),
            op_status: OpStatus::Empty,
            dev_path: String::new(),
            mnt_path: String::new(),
            media: None,
            locked_local: false,
        }
    }

    /// False when the drive is locked by us or holds a medium locked by
    /// another process.
    pub fn is_available(&self) -> bool {
        if self.locked_local {
            return false;
        }
        match self.media {
            Some(ref media) => !media.lock.is_external(),
            None => true,
        }
    }
}

/// Caller-provided descriptor of a pending I/O, enriched during
/// preparation with the chosen drive, mount path and addressing scheme.
#[derive(Debug, Clone, Default)]
pub struct Intent {
    /// Extent size for write allocations
    pub size: u64,
    /// Target medium, set by the caller for reads and by the scheduler
    /// for writes
    pub media: Option<MediaId>,
    pub fs_type: FsType,
    pub addr_type: AddressType,
    pub layout_index: u32,
    /// Root path of the mounted filesystem to do I/O under
    pub root_path: String,
    device: Option<usize>,
}

impl Intent {
    /// Intent to write one extent of `size` bytes.
    pub fn write(size: u64) -> Self {
        Intent { size, ..Default::default() }
    }

    /// Intent to read back data from the given medium.
    pub fn read(media: MediaId) -> Self {
        Intent { media: Some(media), ..Default::default() }
    }

    /// Registry index of the drive prepared for this intent.
    pub fn device(&self) -> Option<usize> {
        self.device
    }

    fn clear(&mut self) {
        *self = Intent::default();
    }
}

/// The per-host scheduler instance.
pub struct Lrs {
    catalog: Arc<dyn Catalog>,
    manager: Arc<dyn DeviceManager>,
    config: SchedConfig,
    lock_owner: String,
    devices: Vec<DeviceDescr>,
}

impl Lrs {
    /// Create a scheduler bound to a catalog and a device manager.
    ///
    /// Builds the owner identity used to stamp every catalog lock taken
    /// on behalf of this instance.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        manager: Arc<dyn DeviceManager>,
        config: SchedConfig,
    ) -> Result<Self, SchedError> {
        let lock_owner = lock::build_lock_owner()?;
        Ok(Lrs {
            catalog,
            manager,
            config,
            lock_owner,
            devices: Vec::new(),
        })
    }

    /// Drop all registry state. Locks held through unreleased intents
    /// stay in the catalog; callers release them via
    /// [`Lrs::resource_release`] first.
    pub fn shutdown(&mut self) {
        self.devices.clear();
    }

    /// Owner string stamped on catalog locks taken by this instance.
    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    /// Registry introspection.
    pub fn devices(&self) -> &[DeviceDescr] {
        &self.devices
    }

    /// Populate or refresh the registry.
    ///
    /// On first use, fetches from the catalog all admin-unlocked drives
    /// of the default family on this host; afterwards only refreshes the
    /// known entries. A drive whose refresh fails is marked failed and
    /// skipped by selection; only catalog-level failures abort the whole
    /// reload.
    pub fn load_device_state(&mut self) -> Result<(), SchedError> {
        let family = self.config.default_family;

        if self.devices.is_empty() {
            let host = tools::hostname()?;
            let filter = catalog::device_host_filter(host, family);
            let records = self
                .catalog
                .device_get(&filter)
                .map_err(SchedError::Catalog)?;

            if records.is_empty() {
                log::info!("no usable {} device on host '{}'", family, host);
                return Err(SchedError::NotFound(format!(
                    "no usable {} device: check device status",
                    family
                )));
            }

            self.devices = records.into_iter().map(DeviceDescr::new).collect();
        }

        let manager = Arc::clone(&self.manager);
        let library = manager.open_library(family, &self.config.lib_device)?;

        for index in 0..self.devices.len() {
            if let Err(err) = self.fill_dev_info(index, library.as_ref()) {
                log::warn!(
                    "marking device '{}' as failed: {}",
                    self.devices[index].info.serial,
                    err
                );
                self.devices[index].op_status = OpStatus::Failed;
            }
        }

        Ok(())
    }

    /// Register one more drive at runtime.
    pub fn device_add(&mut self, info: DeviceInfo) -> Result<(), SchedError> {
        log::info!("adding device '{}' to the scheduler", info.serial);

        let manager = Arc::clone(&self.manager);
        let library = manager.open_library(info.family, &self.config.lib_device)?;

        self.devices.push(DeviceDescr::new(info));
        let index = self.devices.len() - 1;
        if let Err(err) = self.fill_dev_info(index, library.as_ref()) {
            self.devices.pop();
            return Err(SchedError::Other(err));
        }
        Ok(())
    }

    /// Refresh one registry entry from the device adapter, the library
    /// and the catalog.
    fn fill_dev_info(&mut self, index: usize, library: &dyn Library) -> Result<(), Error> {
        let catalog = Arc::clone(&self.catalog);
        let manager = Arc::clone(&self.manager);
        let owner = self.lock_owner.clone();

        let dev = &mut self.devices[index];
        dev.media = None;

        let adapter = manager.device_adapter(dev.info.family)?;
        dev.dev_path = adapter
            .lookup(&dev.info.serial)
            .map_err(|err| format_err!("device lookup failed for '{}': {}", dev.info.serial, err))?;
        dev.sys_state = adapter.query(&dev.dev_path)?;

        check_dev_info(dev)?;

        dev.lib_info = library
            .drive_lookup(&dev.info.serial)
            .map_err(|err| format_err!("library lookup failed for '{}': {}", dev.info.serial, err))?;

        if !dev.lib_info.full {
            dev.op_status = OpStatus::Empty;
            dev.mnt_path.clear();
            log::debug!("drive '{}' is {}", dev.dev_path, dev.op_status);
            return Ok(());
        }

        dev.op_status = OpStatus::Loaded;
        let media_id = dev
            .lib_info
            .media_id
            .clone()
            .ok_or_else(|| format_err!("library reports a full drive without a media label"))?;
        log::debug!(
            "device '{}' (S/N '{}') contains media '{}'",
            dev.dev_path,
            dev.info.serial,
            media_id
        );

        match fill_media_info(catalog.as_ref(), &owner, &media_id) {
            // media record gone from the catalog: unusable drive
            Err(SchedError::NotFound(_)) => {
                dev.op_status = OpStatus::Failed;
            }
            Err(err) => return Err(err.into()),
            Ok(mut media) => {
                // a locally locked drive implies its medium was locked
                // by us before this catalog scan
                if dev.locked_local && media.lock.is_external() {
                    media.lock = MediaLock::OwnedBySelf;
                }

                let fsa = manager.fs_adapter(media.fs.fs_type)?;
                match fsa.mounted(&dev.dev_path)? {
                    Some(mnt_path) => {
                        log::debug!("discovered mounted filesystem at '{}'", mnt_path);
                        dev.mnt_path = mnt_path;
                        dev.op_status = OpStatus::Mounted;
                    }
                    None => dev.mnt_path.clear(),
                }
                dev.media = Some(media);
            }
        }

        log::debug!("drive '{}' is {}", dev.dev_path, dev.op_status);
        Ok(())
    }

    /// Drive currently holding the medium with the given identifier.
    fn find_loaded(&self, id: &MediaId) -> Option<usize> {
        self.devices.iter().position(|dev| {
            matches!(dev.op_status, OpStatus::Loaded | OpStatus::Mounted)
                && dev
                    .lib_info
                    .media_id
                    .as_ref()
                    .map(|m| m.label == id.label)
                    .unwrap_or(false)
        })
    }

    /// Release the drive lock and the lock of its contained medium,
    /// logging rather than propagating failures.
    fn release_device(&mut self, index: usize) {
        let Lrs {
            ref catalog,
            ref lock_owner,
            ref mut devices,
            ..
        } = *self;
        let dev = &mut devices[index];

        if let Err(err) = lock::dev_release(catalog.as_ref(), lock_owner, dev) {
            log::error!("failed to release lock on '{}': {}", dev.dev_path, err);
        }
        if let Some(ref mut media) = dev.media {
            if let Err(err) = lock::media_release(catalog.as_ref(), lock_owner, media) {
                log::error!("failed to release lock on '{}': {}", media.id, err);
            }
        }
    }
}

/// Cross-check the catalog record of a drive against the live system
/// view. Vendors pad model/serial fields with blanks, so the comparison
/// is whitespace insensitive.
fn check_dev_info(dev: &DeviceDescr) -> Result<(), Error> {
    match (&dev.info.model, &dev.sys_state.model) {
        (None, None) => log::debug!("{}: no device model is set", dev.dev_path),
        (Some(configured), Some(actual)) => {
            if !tools::eq_trimmed(configured, actual) {
                return Err(format_err!(
                    "{}: configured device model '{}' differs from actual device model '{}'",
                    dev.dev_path,
                    configured,
                    actual
                ));
            }
        }
        _ => {
            return Err(format_err!(
                "{}: missing or unexpected device model",
                dev.dev_path
            ))
        }
    }

    match dev.sys_state.serial {
        Some(ref actual) => {
            if !tools::eq_trimmed(&dev.info.serial, actual) {
                return Err(format_err!(
                    "{}: configured device serial '{}' differs from actual device serial '{}'",
                    dev.dev_path,
                    dev.info.serial,
                    actual
                ));
            }
        }
        None => {
            return Err(format_err!(
                "{}: missing or unexpected device serial",
                dev.dev_path
            ))
        }
    }

    Ok(())
}

/// Fetch one media record from the catalog, folding its lock field into
/// the scheduler's view: a lock held under another owner string becomes
/// `OwnedByOther`, our own owner string becomes `OwnedBySelf`.
fn fill_media_info(
    catalog: &dyn Catalog,
    owner: &str,
    id: &MediaId,
) -> Result<MediaInfo, SchedError> {
    log::debug!("retrieving media info for {} '{}'", id.family, id);

    let filter = catalog::media_id_filter(id);
    let mut records = catalog.media_get(&filter).map_err(SchedError::Catalog)?;

    if records.is_empty() {
        log::info!("no media found matching {} '{}'", id.family, id);
        return Err(SchedError::NotFound(format!("no media matching '{}'", id)));
    }
    if records.len() > 1 {
        return Err(SchedError::InvalidArgument(format!(
            "too many media found matching id '{}'",
            id
        )));
    }

    let mut media = records.remove(0);
    if let MediaLock::OwnedByOther(holder) = media.lock.clone() {
        if holder == owner {
            media.lock = MediaLock::OwnedBySelf;
        } else {
            log::info!("media '{}' is locked ({})", id, holder);
        }
    }

    log::debug!("{}: free={}", media.id, media.stats.phys_spc_free);
    Ok(media)
}
