//! Device state machine: empty -> loaded -> mounted and back.
//!
//! Each transition updates the registry entry together with the
//! catalog-visible intent. Failed transitions (other than the
//! busy-retry cases) take the drive out of service.

use std::sync::Arc;

use anyhow::Error;

use super::{lock, Lrs, SchedError};
use crate::ldm::{DeviceManager, LibAddr, LibraryError};
use crate::tools;
use crate::types::{FsType, MediaInfo, OpStatus};

impl Lrs {
    /// Mount the filesystem of a loaded drive.
    ///
    /// The mount point is `{mount_prefix}{basename(dev_path)}`; callers
    /// and operators depend on this stable form. Finding the filesystem
    /// already mounted is not an error.
    pub(crate) fn mount(&mut self, index: usize) -> Result<(), SchedError> {
        let (dev_path, fs_type, fs_label) = {
            let dev = &self.devices[index];
            let media = dev.media.as_ref().ok_or_else(|| {
                SchedError::InvalidArgument(format!("no media in drive '{}'", dev.dev_path))
            })?;
            (dev.dev_path.clone(), media.fs.fs_type, media.fs.label.clone())
        };

        let manager = Arc::clone(&self.manager);
        match try_mount(manager.as_ref(), &self.config, &dev_path, fs_type, &fs_label) {
            Ok(mnt_path) => {
                let dev = &mut self.devices[index];
                dev.mnt_path = mnt_path;
                dev.op_status = OpStatus::Mounted;
                Ok(())
            }
            Err(err) => {
                self.devices[index].op_status = OpStatus::Failed;
                Err(SchedError::DriveFailure(format!(
                    "failed to mount device '{}': {}",
                    dev_path, err
                )))
            }
        }
    }

    /// Unmount the filesystem of a mounted drive.
    pub(crate) fn umount(&mut self, index: usize) -> Result<(), SchedError> {
        let (dev_path, mnt_path, fs_type) = {
            let dev = &self.devices[index];
            if dev.op_status != OpStatus::Mounted {
                return Err(SchedError::InvalidArgument(format!(
                    "unexpected drive status for '{}': '{}'",
                    dev.dev_path, dev.op_status
                )));
            }
            if dev.mnt_path.is_empty() {
                return Err(SchedError::InvalidArgument(format!(
                    "no mount point for mounted device '{}'",
                    dev.dev_path
                )));
            }
            let media = dev.media.as_ref().ok_or_else(|| {
                SchedError::InvalidArgument(format!(
                    "no media in mounted device '{}'",
                    dev.dev_path
                ))
            })?;
            (dev.dev_path.clone(), dev.mnt_path.clone(), media.fs.fs_type)
        };

        log::info!("unmounting device '{}' mounted as '{}'", dev_path, mnt_path);

        let manager = Arc::clone(&self.manager);
        let fsa = manager.fs_adapter(fs_type)?;
        fsa.umount(&dev_path, &mnt_path).map_err(|err| {
            SchedError::DriveFailure(format!(
                "failed to umount device '{}' mounted as '{}': {}",
                dev_path, mnt_path, err
            ))
        })?;

        let dev = &mut self.devices[index];
        dev.op_status = OpStatus::Loaded;
        dev.mnt_path.clear();
        Ok(())
    }

    /// Load a medium into an empty drive.
    ///
    /// On success ownership of the medium moves into the drive (the
    /// option is taken); on failure the caller keeps it. A library
    /// refusing a drive-to-drive movement yields busy-retry without
    /// failing the drive: it means the library state changed between
    /// the scan and this call.
    pub(crate) fn load(
        &mut self,
        index: usize,
        media: &mut Option<MediaInfo>,
    ) -> Result<(), SchedError> {
        {
            let dev = &self.devices[index];
            if dev.op_status != OpStatus::Empty {
                log::debug!(
                    "'{}': unexpected drive status '{}'",
                    dev.dev_path,
                    dev.op_status
                );
                return Err(SchedError::Busy);
            }
            if dev.media.is_some() {
                log::debug!("no media expected in device '{}'", dev.dev_path);
                return Err(SchedError::Busy);
            }
        }
        let label = match *media {
            Some(ref media) => media.id.clone(),
            None => {
                return Err(SchedError::InvalidArgument(
                    "no media provided to load".to_string(),
                ))
            }
        };

        log::info!("loading '{}' into '{}'", label, self.devices[index].dev_path);

        let manager = Arc::clone(&self.manager);
        let library =
            manager.open_library(self.devices[index].info.family, &self.config.lib_device)?;

        let media_addr = match library.media_lookup(&label.label) {
            Ok(addr) => addr,
            Err(LibraryError::NotFound(what)) => {
                return Err(SchedError::NotFound(format!("media lookup failed: {}", what)))
            }
            Err(err) => return Err(SchedError::Other(err.into())),
        };
        let drive_addr = self.devices[index].lib_info.addr;

        match library.move_media(&media_addr, &drive_addr) {
            Ok(()) => {}
            Err(LibraryError::InvalidMove)
                if matches!(media_addr, LibAddr::Drive(_))
                    && matches!(drive_addr, LibAddr::Drive(_)) =>
            {
                // the medium found its way into another drive since the
                // last scan; back off instead of failing the drive
                log::debug!("drive-to-drive movement refused, trying again later");
                return Err(SchedError::Busy);
            }
            Err(err) => {
                self.devices[index].op_status = OpStatus::Failed;
                return Err(SchedError::DriveFailure(format!(
                    "media move failed: {}",
                    err
                )));
            }
        }

        let dev = &mut self.devices[index];
        dev.op_status = OpStatus::Loaded;
        dev.lib_info.full = true;
        dev.lib_info.media_id = Some(label);
        dev.media = media.take();
        Ok(())
    }

    /// Unload the medium of a loaded drive back into the library and
    /// release its lock.
    pub(crate) fn unload(&mut self, index: usize) -> Result<(), SchedError> {
        {
            let dev = &self.devices[index];
            if dev.op_status != OpStatus::Loaded {
                return Err(SchedError::InvalidArgument(format!(
                    "unexpected drive status for '{}': '{}'",
                    dev.dev_path, dev.op_status
                )));
            }
            let media = dev.media.as_ref().ok_or_else(|| {
                SchedError::InvalidArgument(format!(
                    "no media in loaded device '{}'",
                    dev.dev_path
                ))
            })?;
            log::info!("unloading '{}' from '{}'", media.id, dev.dev_path);
        }

        let manager = Arc::clone(&self.manager);
        let library =
            manager.open_library(self.devices[index].info.family, &self.config.lib_device)?;

        let drive_addr = self.devices[index].lib_info.addr;
        // let the library pick the target slot
        if let Err(err) = library.move_media(&drive_addr, &LibAddr::Unknown) {
            self.devices[index].op_status = OpStatus::Failed;
            return Err(SchedError::DriveFailure(format!("media move failed: {}", err)));
        }

        let dev = &mut self.devices[index];
        dev.op_status = OpStatus::Empty;
        dev.lib_info.full = false;
        dev.lib_info.media_id = None;
        let media = dev.media.take();

        // locked by the caller, by convention
        if let Some(mut media) = media {
            if let Err(err) =
                lock::media_release(self.catalog.as_ref(), &self.lock_owner, &mut media)
            {
                log::error!("failed to release lock on '{}': {}", media.id, err);
            }
        }
        Ok(())
    }
}

fn try_mount(
    manager: &dyn DeviceManager,
    config: &crate::config::SchedConfig,
    dev_path: &str,
    fs_type: FsType,
    fs_label: &str,
) -> Result<String, Error> {
    let fsa = manager.fs_adapter(fs_type)?;

    if let Some(mnt_path) = fsa.mounted(dev_path)? {
        log::debug!("discovered mounted filesystem at '{}'", mnt_path);
        return Ok(mnt_path);
    }

    let mnt_root = config.mount_point(tools::basename(dev_path));
    log::info!("mounting device '{}' as '{}'", dev_path, mnt_root);

    fsa.mount(dev_path, &mnt_root, fs_label)?;
    Ok(mnt_root)
}
