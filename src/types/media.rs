//! Media descriptors as recorded by the catalog.

use anyhow::Error;
use serde::{Deserialize, Serialize};

use super::{check_identifier, AddressType, AdmStatus, FsType, ResourceFamily};

/// Unique identifier of a medium: storage family plus label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaId {
    pub family: ResourceFamily,
    pub label: String,
}

impl MediaId {
    pub fn new(family: ResourceFamily, label: &str) -> Result<Self, Error> {
        check_identifier(label)?;
        Ok(MediaId { family, label: label.to_string() })
    }
}

impl std::fmt::Display for MediaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// Filesystem status of a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsStatus {
    /// Not formatted yet
    Blank,
    /// Formatted, no object written
    Empty,
    /// Contains objects, accepts more
    Used,
    /// No further write possible
    Full,
}

/// Filesystem description of a medium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsInfo {
    #[serde(rename = "type")]
    pub fs_type: FsType,
    pub status: FsStatus,
    /// Filesystem label, conventionally the media label
    pub label: String,
}

/// Usage counters of a medium.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStats {
    /// Number of objects stored
    pub nb_obj: u64,
    /// Logical bytes written by callers
    pub logc_spc_used: u64,
    /// Physical bytes used on the medium
    pub phys_spc_used: u64,
    /// Physical bytes still available
    pub phys_spc_free: u64,
}

/// State of the catalog lock of a medium, as seen by this process.
///
/// The catalog reports a raw owner string; the scheduler folds it into
/// this tagged form so that lock tests are plain value comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaLock {
    /// No lock holder recorded
    Unlocked,
    /// Locked by this scheduler instance
    OwnedBySelf,
    /// Locked by some other process
    OwnedByOther(String),
}

impl Default for MediaLock {
    fn default() -> Self {
        MediaLock::Unlocked
    }
}

impl MediaLock {
    pub fn is_external(&self) -> bool {
        matches!(self, MediaLock::OwnedByOther(_))
    }
}

/// Tag set attached to a medium.
///
/// Tags partition the media pool; a write request carrying tags is only
/// served by media holding every requested tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(pub Vec<String>);

impl Tags {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(tags: I) -> Self {
        Tags(tags.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    /// True when every tag of `required` is present in this set.
    pub fn contains_all(&self, required: &Tags) -> bool {
        required.iter().all(|tag| self.0.contains(tag))
    }
}

/// Full catalog record of a medium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub id: MediaId,
    /// Cartridge model (e.g. "LTO5"), None for directory media
    pub model: Option<String>,
    pub adm_status: AdmStatus,
    pub addr_type: AddressType,
    pub fs: FsInfo,
    pub stats: MediaStats,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub lock: MediaLock,
}

impl MediaInfo {
    /// A blank, unformatted medium with default settings.
    pub fn new(id: MediaId, fs_type: FsType) -> Self {
        MediaInfo {
            id,
            model: None,
            adm_status: AdmStatus::Unlocked,
            addr_type: AddressType::Hash1,
            fs: FsInfo {
                fs_type,
                status: FsStatus::Blank,
                label: String::new(),
            },
            stats: MediaStats::default(),
            tags: Tags::default(),
            lock: MediaLock::Unlocked,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tag_cover() {
        let media = Tags::new(vec!["fast", "secure", "eu"]);
        assert!(media.contains_all(&Tags::default()));
        assert!(media.contains_all(&Tags::new(vec!["secure"])));
        assert!(media.contains_all(&Tags::new(vec!["eu", "fast"])));
        assert!(!media.contains_all(&Tags::new(vec!["us"])));
        assert!(!Tags::default().contains_all(&Tags::new(vec!["fast"])));
    }

    #[test]
    fn lock_default_is_unlocked() {
        assert_eq!(MediaLock::default(), MediaLock::Unlocked);
        assert!(!MediaLock::Unlocked.is_external());
        assert!(!MediaLock::OwnedBySelf.is_external());
        assert!(MediaLock::OwnedByOther("elsewhere".to_string()).is_external());
    }

    #[test]
    fn media_id_checks_label() {
        MediaId::new(ResourceFamily::Tape, "P00001L5").unwrap();
        assert!(MediaId::new(ResourceFamily::Tape, "no spaces").is_err());
    }
}
