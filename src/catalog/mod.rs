//! Catalog client interface.
//!
//! The catalog is the persistent metadata service recording drives and
//! media. The scheduler talks to it through the [`Catalog`] trait:
//! filter-based queries, partial media updates, and named advisory locks
//! stamped with the caller's owner string.
//!
//! Filters are JSON trees using a small `$AND` / `$NOR` / `$GTE`
//! vocabulary; leaf entries compare a namespaced field (`media::...`,
//! `device::...`) against a value, where list-valued fields match by
//! containment.

mod mem;
pub use mem::MemCatalog;

use anyhow::Error;
use serde_json::{json, Value};

use crate::types::{AdmStatus, DeviceInfo, FsStatus, MediaId, MediaInfo, ResourceFamily, Tags};

/// Outcome of a lock operation, separating contention from failure.
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    /// The lock is held by the reported owner
    #[error("lock already held by '{0}'")]
    Held(String),
    /// The catalog call itself failed
    #[error(transparent)]
    Other(#[from] Error),
}

/// Persistent metadata service for drives and media.
pub trait Catalog: Send + Sync {
    /// Drives matching `filter`.
    fn device_get(&self, filter: &Value) -> Result<Vec<DeviceInfo>, Error>;

    /// Media matching `filter`. The returned lock field is either
    /// `Unlocked` or `OwnedByOther(owner)`; the catalog has no notion of
    /// "self".
    fn media_get(&self, filter: &Value) -> Result<Vec<MediaInfo>, Error>;

    /// Persist the mutable parts of a media record (statuses, stats,
    /// filesystem label, tags).
    fn media_update(&self, media: &MediaInfo) -> Result<(), Error>;

    /// Take the named lock on a drive.
    fn device_lock(&self, serial: &str, owner: &str) -> Result<(), LockError>;

    /// Release the named lock on a drive.
    fn device_unlock(&self, serial: &str, owner: &str) -> Result<(), LockError>;

    /// Take the named lock on a medium.
    fn media_lock(&self, id: &MediaId, owner: &str) -> Result<(), LockError>;

    /// Release the named lock on a medium.
    fn media_unlock(&self, id: &MediaId, owner: &str) -> Result<(), LockError>;
}

/// Filter selecting one medium by family and label.
pub fn media_id_filter(id: &MediaId) -> Value {
    json!({ "$AND": [
        { "media::family": id.family },
        { "media::id": id.label },
    ]})
}

/// Filter selecting the drives of `host` usable for `family`.
pub fn device_host_filter(host: &str, family: ResourceFamily) -> Value {
    json!({ "$AND": [
        { "device::host": host },
        { "device::adm_status": AdmStatus::Unlocked },
        { "device::family": family },
    ]})
}

/// Filter selecting write candidates: unlocked, formatted, not full,
/// enough free space, covering every requested tag.
pub fn media_select_filter(family: ResourceFamily, required_size: u64, tags: &Tags) -> Value {
    let mut clauses = vec![
        json!({ "media::family": family }),
        json!({ "media::adm_status": AdmStatus::Unlocked }),
        json!({ "$GTE": { "media::vol_free": required_size } }),
        json!({ "$NOR": [
            { "media::fs_status": FsStatus::Blank },
            { "media::fs_status": FsStatus::Full },
        ]}),
    ];
    for tag in tags.iter() {
        clauses.push(json!({ "media::tags": tag }));
    }
    json!({ "$AND": clauses })
}
