//! Top-level intent preparers.
//!
//! `write_prepare` walks a cascade from cheapest to most expensive:
//! reuse a mounted medium, mount a loaded one, pick a new medium from
//! the catalog, load it into a free drive (evicting the least valuable
//! occupied drive when none is free), mount it. `read_prepare` and
//! `format` share the by-identifier preparation path. `io_complete`
//! settles the post-I/O accounting, `resource_release` is the
//! always-safe teardown.

use super::lock;
use super::select::{get_write_policy, select_any, select_drive_to_free};
use super::{fill_media_info, Intent, Lrs, SchedError};
use crate::catalog;
use crate::ldm::FsSpaceFlags;
use crate::types::{FsStatus, FsType, MediaId, MediaInfo, OpStatus, ResourceFamily, Tags};

/// Operations a medium can be prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaOperation {
    Read,
    Format,
}

/// I/O error codes that condemn the whole medium rather than the single
/// transfer: the medium is treated as full afterwards.
fn is_media_global_error(err_code: i32) -> bool {
    matches!(err_code.abs(), libc::ENOSPC | libc::EROFS | libc::EIO)
}

impl Lrs {
    /// Prepare a drive and medium to write `intent.size` bytes on a
    /// medium holding all of `tags`.
    ///
    /// On success the intent carries the mount path, medium identifier,
    /// filesystem type and addressing scheme, and the chosen drive and
    /// medium are locked. Media that turn out to be mounted read-only
    /// (almost-full cartridges do) are marked full in the catalog and
    /// the cascade restarts with the next candidate.
    pub fn write_prepare(&mut self, intent: &mut Intent, tags: &Tags) -> Result<(), SchedError> {
        let size = intent.size;

        loop {
            let index = self.get_write_res(size, tags)?;

            let writable = match self.fill_intent_from_dev(intent, index, size) {
                Ok(()) => self.mount_is_writable(&intent.root_path, intent.fs_type),
                Err(err) => Err(err),
            };

            match writable {
                Ok(true) => {
                    let media = &self.devices[index].media;
                    if let Some(media) = media {
                        log::info!(
                            "writing to media '{}' using device '{}' ({} bytes free)",
                            media.id,
                            self.devices[index].dev_path,
                            media.stats.phys_spc_free
                        );
                    }
                    return Ok(());
                }
                Ok(false) => {
                    // LTFS cunningly mounts almost-full tapes read-only,
                    // and so do damaged disks
                    if let Err(err) = self.mark_media_full(index) {
                        self.release_device(index);
                        intent.clear();
                        return Err(err);
                    }
                    self.release_device(index);
                    intent.clear();
                    intent.size = size;
                }
                Err(err) => {
                    self.release_device(index);
                    intent.clear();
                    return Err(err);
                }
            }
        }
    }

    /// Prepare the medium named in the intent for reading: acquire it,
    /// get it into a mounted drive, and fill in the intent location.
    pub fn read_prepare(&mut self, intent: &mut Intent) -> Result<(), SchedError> {
        self.load_device_state()?;

        let id = match intent.media {
            Some(ref id) => id.clone(),
            None => {
                return Err(SchedError::InvalidArgument(
                    "read intent carries no media identifier".to_string(),
                ))
            }
        };

        let index = self.media_prepare(&id, MediaOperation::Read)?;

        if self.devices[index].media.is_none() {
            self.release_device(index);
            return Err(SchedError::InvalidArgument(format!(
                "invalid device state, expected media '{}'",
                id
            )));
        }

        intent.device = Some(index);
        let dev = &self.devices[index];
        intent.root_path = dev.mnt_path.clone();
        if let Some(ref media) = dev.media {
            intent.fs_type = media.fs.fs_type;
            intent.addr_type = media.addr_type;
        }
        Ok(())
    }

    /// Format a blank medium, then record its fresh filesystem state in
    /// the catalog; `unlock` additionally clears the admin lock. Locks
    /// are released whether or not the catalog update succeeds, so a
    /// partial failure cannot pin the drive.
    pub fn format(
        &mut self,
        id: &MediaId,
        fs_type: FsType,
        unlock: bool,
    ) -> Result<(), SchedError> {
        self.load_device_state()?;

        let index = self.media_prepare(id, MediaOperation::Format)?;

        let result = self.format_loaded(index, id, fs_type, unlock);

        // release ownership; do not fail the whole operation if unlucky
        // here
        self.release_device(index);

        result
    }

    /// Post-I/O accounting: flush, re-query space, bump the counters and
    /// statuses, persist the media record.
    pub fn io_complete(
        &mut self,
        intent: &mut Intent,
        fragments: u32,
        err_code: i32,
    ) -> Result<(), SchedError> {
        let index = match intent.device() {
            Some(index) => index,
            None => {
                return Err(SchedError::InvalidArgument(
                    "intent holds no prepared device".to_string(),
                ))
            }
        };

        let ioa = self.manager.io_adapter(intent.fs_type)?;
        ioa.flush(&intent.root_path)
            .map_err(|err| SchedError::Other(err.context("cannot flush media")))?;

        let is_full = is_media_global_error(err_code);
        self.media_update_stats(intent, index, fragments, is_full)
    }

    /// Release the drive and medium held by an intent and empty it.
    /// Safe to call on an intent that holds nothing.
    pub fn resource_release(&mut self, intent: &mut Intent) -> Result<(), SchedError> {
        if let Some(index) = intent.device.take() {
            self.release_device(index);
        }
        intent.clear();
        Ok(())
    }

    /// The write cascade. Returns a locked drive holding a locked,
    /// mounted medium with enough room.
    fn get_write_res(&mut self, size: u64, tags: &Tags) -> Result<usize, SchedError> {
        self.load_device_state()?;

        let policy = get_write_policy(&self.config.policy)?;

        // 1a) a mounted filesystem with enough room?
        if let Some(index) = self.dev_picker(Some(OpStatus::Mounted), policy, size, tags, None) {
            return Ok(index);
        }

        // 1b) a loaded medium with enough room?
        if let Some(index) = self.dev_picker(Some(OpStatus::Loaded), policy, size, tags, None) {
            if let Err(err) = self.mount(index) {
                self.release_device(index);
                return Err(err);
            }
            return Ok(index);
        }

        // 2) pick a new medium from the catalog (locked on return)
        log::info!("not enough space on loaded media: selecting another one");
        let family = self.config.default_family;
        let media = self.select_media(size, family, tags)?;
        let mut media = Some(media);

        match self.write_res_with_media(&mut media) {
            Ok(index) => Ok(index),
            Err(err) => {
                if let Some(ref mut media) = media {
                    let _ = lock::media_release(
                        self.catalog.as_ref(),
                        &self.lock_owner,
                        media,
                    );
                }
                Err(err)
            }
        }
    }

    /// Steps 3..5 of the write cascade: get the already-locked medium
    /// into a mounted drive. On success the drive owns the medium.
    fn write_res_with_media(
        &mut self,
        media: &mut Option<MediaInfo>,
    ) -> Result<usize, SchedError> {
        let id = match *media {
            Some(ref media) => media.id.clone(),
            None => {
                return Err(SchedError::InvalidArgument(
                    "no media selected for write".to_string(),
                ))
            }
        };

        // the medium may already sit in a drive; media are locked
        // before drives, so the drive lock can only be free or ours
        if let Some(index) = self.find_loaded(&id) {
            let Lrs {
                ref catalog,
                ref lock_owner,
                ref mut devices,
                ..
            } = *self;
            if lock::dev_acquire(catalog.as_ref(), lock_owner, &mut devices[index]).is_err() {
                return Err(SchedError::Busy);
            }
            // refresh the drive's view of the medium
            self.devices[index].media = media.take();
            return Ok(index);
        }

        // 3) a free drive?
        let index = match self.dev_picker(
            Some(OpStatus::Empty),
            select_any,
            0,
            &Tags::default(),
            media.as_ref(),
        ) {
            Some(index) => index,
            None => {
                log::info!("no free drive: need to unload one");
                self.free_one_device(media.as_ref())?
            }
        };

        // 4) load the medium into it
        if let Err(err) = self.load(index, media) {
            let Lrs {
                ref catalog,
                ref lock_owner,
                ref mut devices,
                ..
            } = *self;
            let _ = lock::dev_release(catalog.as_ref(), lock_owner, &mut devices[index]);
            return Err(err);
        }

        // 5) mount the filesystem
        if let Err(err) = self.mount(index) {
            self.release_device(index);
            return Err(err);
        }

        Ok(index)
    }

    /// Catalog query for a write medium: unlocked, formatted, not full,
    /// enough room, covering the tags. Among the matches the smallest
    /// free space that still fits wins; externally locked candidates are
    /// skipped. Distinguishes "nothing fits" (no-space) from "everything
    /// fitting is locked" (busy-retry). The returned medium is locked.
    fn select_media(
        &self,
        required_size: u64,
        family: ResourceFamily,
        tags: &Tags,
    ) -> Result<MediaInfo, SchedError> {
        let filter = catalog::media_select_filter(family, required_size, tags);
        let mut candidates = self
            .catalog
            .media_get(&filter)
            .map_err(SchedError::Catalog)?;

        let mut found_fitting = false;
        loop {
            let mut best: Option<usize> = None;
            for (index, media) in candidates.iter().enumerate() {
                if media.stats.phys_spc_free < required_size {
                    continue;
                }
                let better = match best {
                    Some(chosen) => {
                        media.stats.phys_spc_free < candidates[chosen].stats.phys_spc_free
                    }
                    None => true,
                };
                if better {
                    // at least one fitting medium exists, locked or not
                    found_fitting = true;
                    if media.lock.is_external() {
                        continue;
                    }
                    best = Some(index);
                }
            }

            let chosen = match best {
                Some(chosen) => chosen,
                None => {
                    log::info!("no compatible media found to write {} bytes", required_size);
                    if found_fitting {
                        return Err(SchedError::Busy);
                    }
                    return Err(SchedError::NoSpace);
                }
            };

            log::debug!("acquiring selected media '{}'", candidates[chosen].id);
            match lock::media_acquire(
                self.catalog.as_ref(),
                &self.lock_owner,
                &mut candidates[chosen],
            ) {
                Ok(()) => {
                    let media = candidates.swap_remove(chosen);
                    log::info!(
                        "selected {} '{}': {} bytes free",
                        family,
                        media.id,
                        media.stats.phys_spc_free
                    );
                    return Ok(media);
                }
                Err(_) => {
                    // stamped as externally locked; look for another one
                    log::debug!(
                        "failed to lock media '{}', looking for another one",
                        candidates[chosen].id
                    );
                }
            }
        }
    }

    /// Evict the least valuable occupied drive to free hardware for a
    /// new medium: unmount and unload it. On success the returned empty
    /// drive is locked.
    fn free_one_device(&mut self, media: Option<&MediaInfo>) -> Result<usize, SchedError> {
        loop {
            let index = match self.dev_picker(
                None,
                select_drive_to_free,
                0,
                &Tags::default(),
                media,
            ) {
                Some(index) => index,
                None => {
                    if self.compatible_drive_exists(media) {
                        log::warn!("no suitable device to free");
                        return Err(SchedError::Busy);
                    }
                    log::warn!("no compatible device exists, not failed and not admin locked");
                    return Err(SchedError::NoDevice);
                }
            };

            if self.devices[index].op_status == OpStatus::Mounted {
                if let Err(err) = self.umount(index) {
                    log::warn!("failed to unmount '{}': {}", self.devices[index].dev_path, err);
                    self.devices[index].op_status = OpStatus::Failed;
                    self.release_device(index);
                    continue;
                }
            }

            if self.devices[index].op_status == OpStatus::Loaded {
                if let Err(err) = self.unload(index) {
                    log::warn!("failed to unload '{}': {}", self.devices[index].dev_path, err);
                    self.devices[index].op_status = OpStatus::Failed;
                    self.release_device(index);
                    continue;
                }
            }

            if self.devices[index].op_status != OpStatus::Empty {
                return Err(SchedError::InvalidArgument(format!(
                    "unexpected device status '{}' for '{}': should be empty",
                    self.devices[index].op_status, self.devices[index].dev_path
                )));
            }

            return Ok(index);
        }
    }

    /// Shared preparation for by-identifier operations: fetch and lock
    /// the medium, get it into a drive (evicting if necessary), mount it
    /// for reads. On success the drive owns the locked medium.
    fn media_prepare(&mut self, id: &MediaId, op: MediaOperation) -> Result<usize, SchedError> {
        let mut media =
            fill_media_info(self.catalog.as_ref(), &self.lock_owner, id)?;

        if media.lock.is_external() {
            log::debug!("media '{}' is locked, retry later", id);
            return Err(SchedError::Busy);
        }

        let post_fs_mount = match op {
            MediaOperation::Read => {
                if media.fs.status == FsStatus::Blank {
                    return Err(SchedError::InvalidArgument(format!(
                        "cannot do I/O on unformatted media '{}'",
                        id
                    )));
                }
                true
            }
            MediaOperation::Format => {
                if media.fs.status != FsStatus::Blank {
                    return Err(SchedError::InvalidArgument(format!(
                        "cannot format non-blank media '{}'",
                        id
                    )));
                }
                false
            }
        };

        if lock::media_acquire(self.catalog.as_ref(), &self.lock_owner, &mut media).is_err() {
            return Err(SchedError::Busy);
        }

        let index = if let Some(index) = self.find_loaded(id) {
            let Lrs {
                ref catalog,
                ref lock_owner,
                ref mut devices,
                ..
            } = *self;
            if lock::dev_acquire(catalog.as_ref(), lock_owner, &mut devices[index]).is_err() {
                let _ = lock::media_release(catalog.as_ref(), lock_owner, &mut media);
                return Err(SchedError::Busy);
            }
            // refresh the drive's view of the medium
            self.devices[index].media = Some(media);
            index
        } else {
            log::info!("media '{}' is not in a drive", id);

            let mut slot = Some(media);
            let picked = match self.dev_picker(
                Some(OpStatus::Empty),
                select_any,
                0,
                &Tags::default(),
                slot.as_ref(),
            ) {
                Some(index) => Ok(index),
                None => {
                    log::info!("no free drive: need to unload one");
                    self.free_one_device(slot.as_ref())
                }
            };
            let index = match picked {
                Ok(index) => index,
                Err(err) => {
                    if let Some(ref mut media) = slot {
                        let _ = lock::media_release(
                            self.catalog.as_ref(),
                            &self.lock_owner,
                            media,
                        );
                    }
                    return Err(err);
                }
            };

            if let Err(err) = self.load(index, &mut slot) {
                let Lrs {
                    ref catalog,
                    ref lock_owner,
                    ref mut devices,
                    ..
                } = *self;
                let _ = lock::dev_release(catalog.as_ref(), lock_owner, &mut devices[index]);
                if let Some(ref mut media) = slot {
                    let _ = lock::media_release(catalog.as_ref(), lock_owner, media);
                }
                return Err(err);
            }
            index
        };

        // mount only for reads, and only when not already mounted
        if post_fs_mount && self.devices[index].op_status != OpStatus::Mounted {
            if let Err(err) = self.mount(index) {
                self.release_device(index);
                return Err(err);
            }
        }

        Ok(index)
    }

    /// Fill the intent location from a prepared drive.
    fn fill_intent_from_dev(
        &self,
        intent: &mut Intent,
        index: usize,
        size: u64,
    ) -> Result<(), SchedError> {
        let dev = &self.devices[index];
        let media = dev.media.as_ref().ok_or_else(|| {
            SchedError::InvalidArgument(format!("no media in drive '{}'", dev.dev_path))
        })?;

        intent.device = Some(index);
        intent.root_path = dev.mnt_path.clone();
        intent.media = Some(media.id.clone());
        intent.fs_type = media.fs.fs_type;
        intent.addr_type = media.addr_type;
        // a single part carrying the whole extent
        intent.layout_index = 0;
        intent.size = size;
        Ok(())
    }

    /// Whether the filesystem behind the intent accepts writes.
    fn mount_is_writable(&self, root_path: &str, fs_type: FsType) -> Result<bool, SchedError> {
        let fsa = self.manager.fs_adapter(fs_type)?;
        let space = fsa
            .df(root_path)
            .map_err(|err| SchedError::Other(err.context("cannot retrieve media usage")))?;
        Ok(!space.flags.contains(FsSpaceFlags::READONLY))
    }

    /// Mark the medium inside a drive as full and persist it.
    fn mark_media_full(&mut self, index: usize) -> Result<(), SchedError> {
        let catalog = std::sync::Arc::clone(&self.catalog);
        let dev = &mut self.devices[index];
        let dev_path = dev.dev_path.clone();
        let media = dev.media.as_mut().ok_or_else(|| {
            SchedError::InvalidArgument(format!("no media in drive '{}'", dev_path))
        })?;

        log::warn!(
            "media '{}' OK but mounted read-only, marking full and retrying",
            media.id
        );
        media.fs.status = FsStatus::Full;
        catalog
            .media_update(media)
            .map_err(SchedError::Catalog)?;
        Ok(())
    }

    /// Re-query the mounted filesystem and persist the medium counters.
    fn media_update_stats(
        &mut self,
        intent: &Intent,
        index: usize,
        fragments: u32,
        err: bool,
    ) -> Result<(), SchedError> {
        let catalog = std::sync::Arc::clone(&self.catalog);
        let manager = std::sync::Arc::clone(&self.manager);

        let fsa = manager.fs_adapter(intent.fs_type)?;
        let space = fsa
            .df(&intent.root_path)
            .map_err(|err| SchedError::Other(err.context("cannot retrieve media usage")))?;

        let dev = &mut self.devices[index];
        let dev_path = dev.dev_path.clone();
        let media = dev.media.as_mut().ok_or_else(|| {
            SchedError::InvalidArgument(format!("no media in drive '{}'", dev_path))
        })?;

        media.stats.nb_obj += u64::from(fragments);
        media.stats.phys_spc_used = space.used;
        media.stats.phys_spc_free = space.avail;
        if fragments > 0 {
            media.stats.logc_spc_used += intent.size;
        }

        if media.fs.status == FsStatus::Empty {
            media.fs.status = FsStatus::Used;
        }
        if err || media.stats.phys_spc_free == 0 {
            media.fs.status = FsStatus::Full;
        }

        catalog
            .media_update(media)
            .map_err(SchedError::Catalog)?;
        Ok(())
    }

    /// Run the filesystem format on an already prepared drive and push
    /// the resulting state to the catalog.
    fn format_loaded(
        &mut self,
        index: usize,
        id: &MediaId,
        fs_type: FsType,
        unlock: bool,
    ) -> Result<(), SchedError> {
        let catalog = std::sync::Arc::clone(&self.catalog);
        let manager = std::sync::Arc::clone(&self.manager);

        let dev_path = self.devices[index].dev_path.clone();
        if self.devices[index].media.is_none() {
            return Err(SchedError::InvalidArgument(
                "invalid device state".to_string(),
            ));
        }

        log::info!("formatting media '{}' as {}", id, fs_type);

        let fsa = manager.fs_adapter(fs_type)?;
        let space = fsa.format(&dev_path, &id.label).map_err(|err| {
            SchedError::Other(err.context(format!("cannot format media '{}'", id)))
        })?;

        let dev = &mut self.devices[index];
        let media = match dev.media.as_mut() {
            Some(media) => media,
            None => {
                return Err(SchedError::InvalidArgument(
                    "invalid device state".to_string(),
                ))
            }
        };

        // systematically use the media identifier as filesystem label
        media.fs.fs_type = fs_type;
        media.fs.label = id.label.clone();
        media.fs.status = FsStatus::Empty;
        media.stats.phys_spc_used = space.used;
        media.stats.phys_spc_free = space.avail;

        if unlock {
            log::info!("unlocking media '{}'", id);
            media.adm_status = crate::types::AdmStatus::Unlocked;
        }

        catalog
            .media_update(media)
            .map_err(SchedError::Catalog)?;
        Ok(())
    }
}
