//! Catalog lock wrappers.
//!
//! All acquire/release traffic funnels through these helpers so the
//! in-memory ownership flags and the catalog state never diverge.

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Error;

use super::{DeviceDescr, SchedError};
use crate::catalog::{Catalog, LockError};
use crate::tools;
use crate::types::{MediaInfo, MediaLock};

thread_local! {
    static INIT_COUNTER: Cell<u64> = Cell::new(0);
}

/// Build the owner identity stamped on every lock taken by one
/// scheduler instance: `host:tid:epoch:counter`.
///
/// For two identities to collide, the thread id or the per-thread
/// counter would have to wrap within one second. The truncations keep
/// the result under 256 bytes.
pub(crate) fn build_lock_owner() -> Result<String, Error> {
    let host = tools::hostname()?;
    let tid = nix::unistd::gettid().as_raw() as u32;
    let epoch = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let counter = INIT_COUNTER.with(|cell| {
        let value = cell.get();
        cell.set(value.wrapping_add(1));
        value
    });

    Ok(format!("{:.213}:{:08x}:{:016x}:{:016x}", host, tid, epoch, counter))
}

/// Take the catalog lock on a drive. Already holding it is a no-op.
pub(crate) fn dev_acquire(
    catalog: &dyn Catalog,
    owner: &str,
    dev: &mut DeviceDescr,
) -> Result<(), SchedError> {
    if dev.locked_local {
        log::debug!("device '{}' already locked (ignoring)", dev.dev_path);
        return Ok(());
    }

    match catalog.device_lock(&dev.info.serial, owner) {
        Ok(()) => {
            log::debug!("acquired ownership of device '{}'", dev.dev_path);
            dev.locked_local = true;
            Ok(())
        }
        Err(LockError::Held(holder)) => {
            log::warn!("cannot lock device '{}': held by '{}'", dev.dev_path, holder);
            Err(SchedError::Busy)
        }
        Err(LockError::Other(err)) => {
            log::warn!("cannot lock device '{}': {}", dev.dev_path, err);
            Err(SchedError::Catalog(err))
        }
    }
}

/// Release the catalog lock on a drive. Not holding it is a no-op.
pub(crate) fn dev_release(
    catalog: &dyn Catalog,
    owner: &str,
    dev: &mut DeviceDescr,
) -> Result<(), SchedError> {
    if !dev.locked_local {
        log::debug!("device '{}' is not locked (ignoring)", dev.dev_path);
        return Ok(());
    }

    match catalog.device_unlock(&dev.info.serial, owner) {
        Ok(()) => {
            log::debug!("released ownership of device '{}'", dev.dev_path);
            dev.locked_local = false;
            Ok(())
        }
        Err(LockError::Held(holder)) => Err(SchedError::InvalidArgument(format!(
            "lock on device '{}' is held by '{}'",
            dev.dev_path, holder
        ))),
        Err(LockError::Other(err)) => Err(SchedError::Catalog(err)),
    }
}

/// Take the catalog lock on a medium.
///
/// On failure the in-memory lock field is stamped with the external
/// holder so later selection rounds skip the medium without another
/// catalog round trip.
pub(crate) fn media_acquire(
    catalog: &dyn Catalog,
    owner: &str,
    media: &mut MediaInfo,
) -> Result<(), SchedError> {
    if media.lock == MediaLock::OwnedBySelf {
        log::debug!("media '{}' already locked (ignoring)", media.id);
        return Ok(());
    }

    match catalog.media_lock(&media.id, owner) {
        Ok(()) => {
            log::debug!("acquired ownership of media '{}'", media.id);
            media.lock = MediaLock::OwnedBySelf;
            Ok(())
        }
        Err(LockError::Held(holder)) => {
            log::warn!("cannot lock media '{}': held by '{}'", media.id, holder);
            media.lock = MediaLock::OwnedByOther(holder);
            Err(SchedError::Busy)
        }
        Err(LockError::Other(err)) => {
            log::warn!("cannot lock media '{}': {}", media.id, err);
            media.lock = MediaLock::OwnedByOther("unknown".to_string());
            Err(SchedError::Catalog(err))
        }
    }
}

/// Release the catalog lock on a medium. Not holding it is a no-op.
pub(crate) fn media_release(
    catalog: &dyn Catalog,
    owner: &str,
    media: &mut MediaInfo,
) -> Result<(), SchedError> {
    if media.lock != MediaLock::OwnedBySelf {
        log::debug!("media '{}' is not locked by us (ignoring)", media.id);
        return Ok(());
    }

    match catalog.media_unlock(&media.id, owner) {
        Ok(()) => {
            log::debug!("released ownership of media '{}'", media.id);
            media.lock = MediaLock::Unlocked;
            Ok(())
        }
        Err(LockError::Held(holder)) => Err(SchedError::InvalidArgument(format!(
            "lock on media '{}' is held by '{}'",
            media.id, holder
        ))),
        Err(LockError::Other(err)) => Err(SchedError::Catalog(err)),
    }
}
