//! In-memory catalog.
//!
//! Keeps the full drive/media table and the lock table in process
//! memory, honouring the same filter vocabulary as the real service.
//! Only useful for tests and debugging.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};
use serde_json::Value;

use super::{Catalog, LockError};
use crate::types::{DeviceInfo, MediaId, MediaInfo, MediaLock};

/// A projection of a record onto namespaced filter fields.
trait FilterRecord {
    fn field(&self, name: &str) -> Option<Value>;
}

impl FilterRecord for MediaInfo {
    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "media::family" => serde_json::to_value(self.id.family).ok(),
            "media::id" => Some(Value::String(self.id.label.clone())),
            "media::model" => self.model.clone().map(Value::String),
            "media::adm_status" => serde_json::to_value(self.adm_status).ok(),
            "media::fs_status" => serde_json::to_value(self.fs.status).ok(),
            "media::vol_free" => serde_json::to_value(self.stats.phys_spc_free).ok(),
            "media::tags" => serde_json::to_value(&self.tags).ok(),
            _ => None,
        }
    }
}

impl FilterRecord for DeviceInfo {
    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "device::host" => Some(Value::String(self.host.clone())),
            "device::serial" => Some(Value::String(self.serial.clone())),
            "device::model" => self.model.clone().map(Value::String),
            "device::family" => serde_json::to_value(self.family).ok(),
            "device::adm_status" => serde_json::to_value(self.adm_status).ok(),
            _ => None,
        }
    }
}

fn single_entry(node: &Value) -> Result<(&str, &Value), Error> {
    let obj = node
        .as_object()
        .ok_or_else(|| format_err!("malformed filter node: {}", node))?;
    if obj.len() != 1 {
        bail!("filter node must hold exactly one entry: {}", node);
    }
    let (key, value) = obj
        .iter()
        .next()
        .ok_or_else(|| format_err!("empty filter node"))?;
    Ok((key.as_str(), value))
}

fn node_list(value: &Value) -> Result<&Vec<Value>, Error> {
    value
        .as_array()
        .ok_or_else(|| format_err!("filter operator expects a list: {}", value))
}

fn eval_filter(filter: &Value, record: &dyn FilterRecord) -> Result<bool, Error> {
    let (key, value) = single_entry(filter)?;
    match key {
        "$AND" => {
            for node in node_list(value)? {
                if !eval_filter(node, record)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "$NOR" => {
            for node in node_list(value)? {
                if eval_filter(node, record)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "$GTE" => {
            let (field, bound) = single_entry(value)?;
            let bound = bound
                .as_u64()
                .ok_or_else(|| format_err!("'$GTE' expects an unsigned bound"))?;
            let actual = match record.field(field).and_then(|v| v.as_u64()) {
                Some(n) => n,
                None => return Ok(false),
            };
            Ok(actual >= bound)
        }
        name if !name.starts_with('$') => match record.field(name) {
            Some(Value::Array(items)) => Ok(items.contains(value)),
            Some(actual) => Ok(actual == *value),
            None => Ok(false),
        },
        other => bail!("unsupported filter operator '{}'", other),
    }
}

#[derive(Default)]
struct Inner {
    devices: Vec<DeviceInfo>,
    media: Vec<MediaInfo>,
    device_locks: HashMap<String, String>,
    media_locks: HashMap<String, String>,
}

fn media_key(id: &MediaId) -> String {
    format!("{}:{}", id.family, id.label)
}

/// In-memory [`Catalog`] implementation.
#[derive(Default)]
pub struct MemCatalog {
    inner: Mutex<Inner>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a drive record.
    pub fn insert_device(&self, device: DeviceInfo) {
        self.inner.lock().unwrap().devices.push(device);
    }

    /// Register a media record. A lock state of `OwnedByOther` is stored
    /// as a held lock with that owner.
    pub fn insert_media(&self, media: MediaInfo) {
        let mut inner = self.inner.lock().unwrap();
        if let MediaLock::OwnedByOther(ref owner) = media.lock {
            inner
                .media_locks
                .insert(media_key(&media.id), owner.clone());
        }
        let mut record = media;
        record.lock = MediaLock::Unlocked;
        inner.media.push(record);
    }

    /// Current record of one medium, for assertions.
    pub fn media_record(&self, id: &MediaId) -> Option<MediaInfo> {
        let inner = self.inner.lock().unwrap();
        let key = media_key(id);
        inner.media.iter().find(|m| m.id == *id).map(|m| {
            let mut record = m.clone();
            record.lock = match inner.media_locks.get(&key) {
                Some(owner) => MediaLock::OwnedByOther(owner.clone()),
                None => MediaLock::Unlocked,
            };
            record
        })
    }

    /// All lock names currently held by `owner`, drives and media mixed.
    /// Sorted, for stable comparisons.
    pub fn locks_owned_by(&self, owner: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut held: Vec<String> = inner
            .device_locks
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(serial, _)| format!("device:{}", serial))
            .chain(
                inner
                    .media_locks
                    .iter()
                    .filter(|(_, o)| o.as_str() == owner)
                    .map(|(key, _)| format!("media:{}", key)),
            )
            .collect();
        held.sort();
        held
    }
}

impl Catalog for MemCatalog {
    fn device_get(&self, filter: &Value) -> Result<Vec<DeviceInfo>, Error> {
        let inner = self.inner.lock().unwrap();
        let mut result = Vec::new();
        for device in &inner.devices {
            if eval_filter(filter, device)? {
                result.push(device.clone());
            }
        }
        Ok(result)
    }

    fn media_get(&self, filter: &Value) -> Result<Vec<MediaInfo>, Error> {
        let inner = self.inner.lock().unwrap();
        let mut result = Vec::new();
        for media in &inner.media {
            if eval_filter(filter, media)? {
                let mut record = media.clone();
                record.lock = match inner.media_locks.get(&media_key(&media.id)) {
                    Some(owner) => MediaLock::OwnedByOther(owner.clone()),
                    None => MediaLock::Unlocked,
                };
                result.push(record);
            }
        }
        Ok(result)
    }

    fn media_update(&self, media: &MediaInfo) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .media
            .iter_mut()
            .find(|m| m.id == media.id)
            .ok_or_else(|| format_err!("no media record for '{}'", media.id))?;
        *record = media.clone();
        record.lock = MediaLock::Unlocked;
        Ok(())
    }

    fn device_lock(&self, serial: &str, owner: &str) -> Result<(), LockError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.devices.iter().any(|d| d.serial == serial) {
            return Err(format_err!("no device record for '{}'", serial).into());
        }
        match inner.device_locks.get(serial) {
            Some(holder) => Err(LockError::Held(holder.clone())),
            None => {
                inner
                    .device_locks
                    .insert(serial.to_string(), owner.to_string());
                Ok(())
            }
        }
    }

    fn device_unlock(&self, serial: &str, owner: &str) -> Result<(), LockError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.device_locks.get(serial) {
            Some(holder) if holder == owner => {
                inner.device_locks.remove(serial);
                Ok(())
            }
            Some(holder) => Err(LockError::Held(holder.clone())),
            None => Err(format_err!("device '{}' is not locked", serial).into()),
        }
    }

    fn media_lock(&self, id: &MediaId, owner: &str) -> Result<(), LockError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.media.iter().any(|m| m.id == *id) {
            return Err(format_err!("no media record for '{}'", id).into());
        }
        let key = media_key(id);
        match inner.media_locks.get(&key) {
            Some(holder) => Err(LockError::Held(holder.clone())),
            None => {
                inner.media_locks.insert(key, owner.to_string());
                Ok(())
            }
        }
    }

    fn media_unlock(&self, id: &MediaId, owner: &str) -> Result<(), LockError> {
        let mut inner = self.inner.lock().unwrap();
        let key = media_key(id);
        match inner.media_locks.get(&key) {
            Some(holder) if holder == owner => {
                inner.media_locks.remove(&key);
                Ok(())
            }
            Some(holder) => Err(LockError::Held(holder.clone())),
            None => Err(format_err!("media '{}' is not locked", id).into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::{media_id_filter, media_select_filter};
    use super::*;
    use crate::types::{FsStatus, FsType, MediaStats, ResourceFamily, Tags};

    fn media(label: &str, free: u64, status: FsStatus, tags: Tags) -> MediaInfo {
        let id = MediaId::new(ResourceFamily::Tape, label).unwrap();
        let mut info = MediaInfo::new(id, FsType::Ltfs);
        info.fs.status = status;
        info.stats = MediaStats {
            nb_obj: 0,
            logc_spc_used: 0,
            phys_spc_used: 0,
            phys_spc_free: free,
        };
        info.tags = tags;
        info
    }

    #[test]
    fn select_filter_excludes_blank_full_and_small() {
        let catalog = MemCatalog::new();
        catalog.insert_media(media("A", 100, FsStatus::Empty, Tags::default()));
        catalog.insert_media(media("B", 100, FsStatus::Blank, Tags::default()));
        catalog.insert_media(media("C", 100, FsStatus::Full, Tags::default()));
        catalog.insert_media(media("D", 10, FsStatus::Used, Tags::default()));

        let filter = media_select_filter(ResourceFamily::Tape, 50, &Tags::default());
        let found = catalog.media_get(&filter).unwrap();
        let labels: Vec<_> = found.iter().map(|m| m.id.label.as_str()).collect();
        assert_eq!(labels, vec!["A"]);
    }

    #[test]
    fn select_filter_with_size_zero_matches_full_free_zero_excluded_only_by_status() {
        let catalog = MemCatalog::new();
        catalog.insert_media(media("A", 0, FsStatus::Used, Tags::default()));
        catalog.insert_media(media("B", 0, FsStatus::Full, Tags::default()));

        let filter = media_select_filter(ResourceFamily::Tape, 0, &Tags::default());
        let found = catalog.media_get(&filter).unwrap();
        let labels: Vec<_> = found.iter().map(|m| m.id.label.as_str()).collect();
        assert_eq!(labels, vec!["A"]);
    }

    #[test]
    fn tag_clauses_match_by_containment() {
        let catalog = MemCatalog::new();
        catalog.insert_media(media("A", 100, FsStatus::Used, Tags::new(vec!["fast", "eu"])));
        catalog.insert_media(media("B", 100, FsStatus::Used, Tags::new(vec!["fast"])));

        let filter =
            media_select_filter(ResourceFamily::Tape, 1, &Tags::new(vec!["eu", "fast"]));
        let found = catalog.media_get(&filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.label, "A");
    }

    #[test]
    fn lock_state_surfaces_in_media_get() {
        let catalog = MemCatalog::new();
        let id = MediaId::new(ResourceFamily::Tape, "A").unwrap();
        catalog.insert_media(media("A", 100, FsStatus::Used, Tags::default()));

        catalog.media_lock(&id, "owner-1").unwrap();
        let found = catalog.media_get(&media_id_filter(&id)).unwrap();
        assert_eq!(found[0].lock, MediaLock::OwnedByOther("owner-1".to_string()));

        match catalog.media_lock(&id, "owner-2") {
            Err(LockError::Held(holder)) => assert_eq!(holder, "owner-1"),
            other => panic!("unexpected result: {:?}", other),
        }
        match catalog.media_unlock(&id, "owner-2") {
            Err(LockError::Held(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        catalog.media_unlock(&id, "owner-1").unwrap();
        assert!(catalog.locks_owned_by("owner-1").is_empty());
    }
}
