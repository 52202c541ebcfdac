//! Drive selection policies and the registry walk that applies them.

use super::{compat, lock, DeviceDescr, Lrs, SchedError};
use crate::types::{FsStatus, MediaInfo, OpStatus, Tags};

/// What a policy decided about the current candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PolicyDecision {
    /// Remember this candidate and stop the walk
    TakeAndStop,
    /// Remember this candidate, better ones may follow
    TakeAndContinue,
    /// Not interested
    Pass,
}

/// A selection policy inspects a candidate drive and the best drive
/// selected so far.
pub(crate) type SelectFunc =
    fn(required_size: u64, curr: &DeviceDescr, selected: Option<&DeviceDescr>) -> PolicyDecision;

/// First drive whose loaded medium has enough room.
pub(crate) fn select_first_fit(
    required_size: u64,
    curr: &DeviceDescr,
    _selected: Option<&DeviceDescr>,
) -> PolicyDecision {
    match curr.media {
        Some(ref media) if media.stats.phys_spc_free >= required_size => {
            PolicyDecision::TakeAndStop
        }
        _ => PolicyDecision::Pass,
    }
}

/// Drive whose loaded medium has the least free space still fitting the
/// request; an exact fit stops the walk early.
pub(crate) fn select_best_fit(
    required_size: u64,
    curr: &DeviceDescr,
    selected: Option<&DeviceDescr>,
) -> PolicyDecision {
    let free = match curr.media {
        Some(ref media) if media.stats.phys_spc_free >= required_size => {
            media.stats.phys_spc_free
        }
        _ => return PolicyDecision::Pass,
    };

    let better = match selected.and_then(|dev| dev.media.as_ref()) {
        Some(media) => free < media.stats.phys_spc_free,
        None => true,
    };
    if !better {
        return PolicyDecision::Pass;
    }

    if free == required_size {
        PolicyDecision::TakeAndStop
    } else {
        PolicyDecision::TakeAndContinue
    }
}

/// First candidate, regardless of medium or size.
pub(crate) fn select_any(
    _required_size: u64,
    _curr: &DeviceDescr,
    selected: Option<&DeviceDescr>,
) -> PolicyDecision {
    match selected {
        None => PolicyDecision::TakeAndStop,
        Some(_) => PolicyDecision::Pass,
    }
}

/// Occupied drive whose medium has the least free space: the cheapest
/// one to evict. Never stops early, the whole registry is considered.
pub(crate) fn select_drive_to_free(
    _required_size: u64,
    curr: &DeviceDescr,
    selected: Option<&DeviceDescr>,
) -> PolicyDecision {
    if curr.op_status == OpStatus::Failed || !curr.is_available() {
        log::debug!("skipping drive '{}' ({})", curr.dev_path, curr.op_status);
        return PolicyDecision::Pass;
    }
    if curr.op_status == OpStatus::Empty {
        log::warn!("unexpected empty drive '{}' in eviction walk", curr.dev_path);
        return PolicyDecision::Pass;
    }
    let free = match curr.media {
        Some(ref media) => media.stats.phys_spc_free,
        None => return PolicyDecision::Pass,
    };

    let better = match selected.and_then(|dev| dev.media.as_ref()) {
        Some(media) => free < media.stats.phys_spc_free,
        None => true,
    };
    if better {
        PolicyDecision::TakeAndContinue
    } else {
        PolicyDecision::Pass
    }
}

/// Resolve the configured write policy name.
pub(crate) fn get_write_policy(name: &str) -> Result<SelectFunc, SchedError> {
    match name {
        "best_fit" => Ok(select_best_fit),
        "first_fit" => Ok(select_first_fit),
        other => Err(SchedError::InvalidArgument(format!(
            "invalid write policy name '{}' (expected 'best_fit' or 'first_fit')",
            other
        ))),
    }
}

impl Lrs {
    /// Walk the registry and pick a drive for the given purpose.
    ///
    /// Skips drives that are locked (locally or through their medium),
    /// drives not matching the status filter, and, for sized requests,
    /// media that are full or missing a required tag. When
    /// `compat_media` is given the compatibility oracle filters further;
    /// its configuration errors skip the drive rather than aborting.
    ///
    /// The returned drive is locked, its contained medium first. When a
    /// candidate cannot be locked it is remembered as tried and the walk
    /// restarts, so two schedulers racing for the same medium converge
    /// instead of spinning.
    pub(crate) fn dev_picker(
        &mut self,
        op_status: Option<OpStatus>,
        select: SelectFunc,
        required_size: u64,
        media_tags: &Tags,
        compat_media: Option<&MediaInfo>,
    ) -> Option<usize> {
        if self.devices.is_empty() {
            return None;
        }

        let mut tried = vec![false; self.devices.len()];
        loop {
            let mut selected: Option<usize> = None;

            for index in 0..self.devices.len() {
                if tried[index] {
                    continue;
                }
                let dev = &self.devices[index];

                if !dev.is_available() {
                    log::debug!("skipping locked or busy device '{}'", dev.dev_path);
                    continue;
                }
                if let Some(wanted) = op_status {
                    if dev.op_status != wanted {
                        log::debug!(
                            "skipping device '{}' with incompatible status {}",
                            dev.dev_path,
                            dev.op_status
                        );
                        continue;
                    }
                }

                // writes exclude media that are full or mistagged
                if required_size > 0 {
                    if let Some(ref media) = dev.media {
                        if media.fs.status == FsStatus::Full {
                            log::debug!("media '{}' is full", media.id);
                            continue;
                        }
                        if !media.tags.contains_all(media_tags) {
                            log::debug!("media '{}' does not match required tags", media.id);
                            continue;
                        }
                    }
                }

                if let Some(media) = compat_media {
                    match compat::tape_drive_compat(media, dev, &self.config) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(err) => {
                            log::debug!("skipping device '{}': {}", dev.dev_path, err);
                            continue;
                        }
                    }
                }

                let current = selected.map(|chosen| &self.devices[chosen]);
                match select(required_size, dev, current) {
                    PolicyDecision::TakeAndStop => {
                        selected = Some(index);
                        break;
                    }
                    PolicyDecision::TakeAndContinue => selected = Some(index),
                    PolicyDecision::Pass => {}
                }
            }

            let index = match selected {
                Some(index) => index,
                None => {
                    log::debug!("could not find a suitable device");
                    return None;
                }
            };
            log::debug!("picked device {} ('{}')", index, self.devices[index].dev_path);

            // lock the medium first, then the drive; on failure roll
            // back, remember the drive as tried and restart the walk
            let mut acquired_media = false;
            let outcome = {
                let Lrs {
                    ref catalog,
                    ref lock_owner,
                    ref mut devices,
                    ..
                } = *self;
                let dev = &mut devices[index];

                let mut outcome = Ok(());
                if let Some(ref mut media) = dev.media {
                    outcome = lock::media_acquire(catalog.as_ref(), lock_owner, media);
                    acquired_media = outcome.is_ok();
                }
                if outcome.is_ok() {
                    outcome = lock::dev_acquire(catalog.as_ref(), lock_owner, dev);
                    if outcome.is_err() && acquired_media {
                        if let Some(ref mut media) = dev.media {
                            let _ = lock::media_release(catalog.as_ref(), lock_owner, media);
                        }
                    }
                }
                outcome
            };

            match outcome {
                Ok(()) => return Some(index),
                Err(_) => tried[index] = true,
            }
        }
    }

    /// True if at least one non-failed drive could serve `media` (or any
    /// non-failed drive, when no medium constrains the check).
    pub(crate) fn compatible_drive_exists(&self, media: Option<&MediaInfo>) -> bool {
        self.devices.iter().any(|dev| {
            if dev.op_status == OpStatus::Failed {
                return false;
            }
            match media {
                Some(media) => {
                    matches!(compat::tape_drive_compat(media, dev, &self.config), Ok(true))
                }
                None => true,
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{
        AdmStatus, DeviceInfo, FsType, MediaId, MediaInfo, MediaLock, MediaStats, ResourceFamily,
    };

    fn dev_with_media(serial: &str, label: &str, free: u64) -> DeviceDescr {
        let mut dev = DeviceDescr::new(DeviceInfo {
            family: ResourceFamily::Tape,
            model: None,
            path: format!("/dev/{}", serial),
            host: "here".to_string(),
            serial: serial.to_string(),
            adm_status: AdmStatus::Unlocked,
        });
        dev.dev_path = format!("/dev/{}", serial);
        dev.op_status = OpStatus::Loaded;
        let id = MediaId::new(ResourceFamily::Tape, label).unwrap();
        let mut media = MediaInfo::new(id, FsType::Ltfs);
        media.fs.status = crate::types::FsStatus::Used;
        media.stats = MediaStats { phys_spc_free: free, ..Default::default() };
        dev.media = Some(media);
        dev
    }

    #[test]
    fn first_fit_stops_on_first_match() {
        let big = dev_with_media("st0", "A", 1000);
        let small = dev_with_media("st1", "B", 100);

        assert_eq!(select_first_fit(50, &big, None), PolicyDecision::TakeAndStop);
        assert_eq!(select_first_fit(2000, &big, None), PolicyDecision::Pass);
        assert_eq!(select_first_fit(50, &small, Some(&big)), PolicyDecision::TakeAndStop);
    }

    #[test]
    fn best_fit_prefers_smallest_fitting_media() {
        let big = dev_with_media("st0", "A", 1000);
        let small = dev_with_media("st1", "B", 100);
        let exact = dev_with_media("st2", "C", 50);

        assert_eq!(select_best_fit(50, &big, None), PolicyDecision::TakeAndContinue);
        assert_eq!(select_best_fit(50, &small, Some(&big)), PolicyDecision::TakeAndContinue);
        assert_eq!(select_best_fit(50, &big, Some(&small)), PolicyDecision::Pass);
        assert_eq!(select_best_fit(50, &exact, Some(&small)), PolicyDecision::TakeAndStop);
        assert_eq!(select_best_fit(2000, &big, None), PolicyDecision::Pass);
    }

    #[test]
    fn eviction_prefers_least_free_and_skips_unusable() {
        let big = dev_with_media("st0", "A", 1000);
        let small = dev_with_media("st1", "B", 100);

        assert_eq!(select_drive_to_free(0, &big, None), PolicyDecision::TakeAndContinue);
        assert_eq!(select_drive_to_free(0, &small, Some(&big)), PolicyDecision::TakeAndContinue);
        assert_eq!(select_drive_to_free(0, &big, Some(&small)), PolicyDecision::Pass);

        let mut failed = dev_with_media("st2", "C", 10);
        failed.op_status = OpStatus::Failed;
        assert_eq!(select_drive_to_free(0, &failed, None), PolicyDecision::Pass);

        let mut locked = dev_with_media("st3", "D", 10);
        locked.locked_local = true;
        assert_eq!(select_drive_to_free(0, &locked, None), PolicyDecision::Pass);

        let mut busy_media = dev_with_media("st4", "E", 10);
        if let Some(ref mut media) = busy_media.media {
            media.lock = MediaLock::OwnedByOther("elsewhere".to_string());
        }
        assert_eq!(select_drive_to_free(0, &busy_media, None), PolicyDecision::Pass);

        let mut empty = DeviceDescr::new(DeviceInfo {
            family: ResourceFamily::Tape,
            model: None,
            path: "/dev/st5".to_string(),
            host: "here".to_string(),
            serial: "st5".to_string(),
            adm_status: AdmStatus::Unlocked,
        });
        empty.op_status = OpStatus::Empty;
        assert_eq!(select_drive_to_free(0, &empty, None), PolicyDecision::Pass);
    }

    #[test]
    fn policy_name_resolution() {
        assert!(get_write_policy("best_fit").is_ok());
        assert!(get_write_policy("first_fit").is_ok());
        match get_write_policy("worst_fit") {
            Err(SchedError::InvalidArgument(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
