use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Monotonically increasing identity of a version, rendered as `V0000000001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionUid(i64);

impl VersionUid {
    pub fn new(uid: i64) -> Self {
        Self(uid)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Name of the per-version lock.
    pub fn lock_name(&self) -> String {
        self.to_string()
    }

    /// Key under which the version's side-car metadata lives in the block store.
    pub fn storage_key(&self) -> String {
        format!("versions/{}", self)
    }
}

impl fmt::Display for VersionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:010}", self.0)
    }
}

impl FromStr for VersionUid {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('V').unwrap_or(s);
        let uid: i64 = digits
            .parse()
            .map_err(|_| crate::Error::Usage(format!("Invalid version uid {}", s)))?;
        if uid <= 0 {
            return Err(crate::Error::Usage(format!("Invalid version uid {}", s)));
        }
        Ok(Self(uid))
    }
}

impl Serialize for VersionUid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for VersionUid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let uid = i64::deserialize(deserializer)?;
        if uid <= 0 {
            return Err(serde::de::Error::custom(format!("invalid version uid {}", uid)));
        }
        Ok(Self(uid))
    }
}

/// Content-addressing key of a stored blob. Both halves absent means sparse.
///
/// The value is independent of the blob's content; deduplication bookkeeping
/// lives entirely in the metadata store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockUid {
    pub left: Option<u64>,
    pub right: Option<u64>,
}

const STORAGE_PREFIX: &str = "blocks/";

impl BlockUid {
    pub fn new(left: u64, right: u64) -> Self {
        Self {
            left: Some(left),
            right: Some(right),
        }
    }

    pub fn sparse() -> Self {
        Self::default()
    }

    /// A fresh random uid. Both halves stay below 2^63 so they fit SQLite integers.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Self::new(rng.gen_range(1..=i64::MAX as u64), rng.gen_range(1..=i64::MAX as u64))
    }

    pub fn is_sparse(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    pub fn storage_key(&self) -> Option<String> {
        match (self.left, self.right) {
            (Some(left), Some(right)) => Some(format!("{}{:016x}-{:016x}", STORAGE_PREFIX, left, right)),
            _ => None,
        }
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        let name = key.strip_prefix(STORAGE_PREFIX).unwrap_or(key);
        let (left, right) = name.split_once('-')?;
        if left.len() != 16 || right.len() != 16 {
            return None;
        }
        let left = u64::from_str_radix(left, 16).ok()?;
        let right = u64::from_str_radix(right, 16).ok()?;
        Some(Self::new(left, right))
    }

    /// Halves as stored in SQLite.
    pub fn to_sql(&self) -> (Option<i64>, Option<i64>) {
        (self.left.map(|v| v as i64), self.right.map(|v| v as i64))
    }

    pub fn from_sql(left: Option<i64>, right: Option<i64>) -> Self {
        Self {
            left: left.map(|v| v as u64),
            right: right.map(|v| v as u64),
        }
    }
}

impl fmt::Display for BlockUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.left, self.right) {
            (Some(left), Some(right)) => write!(f, "{:x}-{:x}", left, right),
            _ => write!(f, "sparse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub uid: VersionUid,
    pub date: DateTime<Utc>,
    pub name: String,
    pub snapshot_name: String,
    pub size: u64,
    pub block_size: u64,
    pub valid: bool,
    pub protected: bool,
    pub tags: Vec<String>,
}

impl Version {
    pub fn blocks_count(&self) -> u64 {
        blocks_count(self.size, self.block_size)
    }

    /// Size of the block at `index`; only the last block may be short.
    pub fn block_size_at(&self, index: u64) -> u64 {
        block_size_at(self.size, self.block_size, index)
    }

    pub fn lock_name(&self) -> String {
        self.uid.lock_name()
    }
}

pub fn blocks_count(size: u64, block_size: u64) -> u64 {
    size.div_ceil(block_size)
}

pub fn block_size_at(size: u64, block_size: u64, index: u64) -> u64 {
    let start = index * block_size;
    size.saturating_sub(start).min(block_size)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: u64,
    pub version_uid: VersionUid,
    pub uid: BlockUid,
    pub checksum: Option<String>,
    pub size: u64,
    pub valid: bool,
    pub date: DateTime<Utc>,
}

impl Block {
    pub fn is_sparse(&self) -> bool {
        self.uid.is_sparse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedBlock {
    pub uid: BlockUid,
    pub date: DateTime<Utc>,
}

/// Append-only record of a completed backup run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionStatistic {
    pub uid: VersionUid,
    pub base_uid: Option<VersionUid>,
    pub hints_supplied: bool,
    pub date: DateTime<Utc>,
    pub name: String,
    pub snapshot_name: String,
    pub size: u64,
    pub block_size: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_dedup: u64,
    pub bytes_sparse: u64,
    pub duration_seconds: u64,
}

/// Selection criteria for listing versions. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct VersionFilter {
    pub uid: Option<VersionUid>,
    pub name: Option<String>,
    pub snapshot_name: Option<String>,
    pub tag: Option<String>,
    pub valid: Option<bool>,
    pub protected: Option<bool>,
}

impl VersionFilter {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_uid_format() {
        let uid = VersionUid::new(42);
        assert_eq!(uid.to_string(), "V0000000042");
        assert_eq!("V0000000042".parse::<VersionUid>().unwrap(), uid);
        assert_eq!("42".parse::<VersionUid>().unwrap(), uid);
        assert!("V0".parse::<VersionUid>().is_err());
        assert!("abc".parse::<VersionUid>().is_err());
    }

    #[test]
    fn test_block_uid_storage_key() {
        let uid = BlockUid::new(1, 0xabc);
        let key = uid.storage_key().unwrap();
        assert_eq!(key, "blocks/0000000000000001-0000000000000abc");
        assert_eq!(BlockUid::from_storage_key(&key), Some(uid));
        assert_eq!(BlockUid::from_storage_key("blocks/garbage"), None);
        assert_eq!(BlockUid::sparse().storage_key(), None);
    }

    #[test]
    fn test_generated_uids_are_not_sparse_and_fit_sql() {
        let uid = BlockUid::generate();
        assert!(!uid.is_sparse());
        let (left, right) = uid.to_sql();
        assert!(left.unwrap() > 0 && right.unwrap() > 0);
        assert_eq!(BlockUid::from_sql(left, right), uid);
    }

    #[test]
    fn test_block_geometry() {
        assert_eq!(blocks_count(131072, 4096), 32);
        assert_eq!(blocks_count(4097, 4096), 2);
        assert_eq!(blocks_count(0, 4096), 0);
        assert_eq!(block_size_at(4097, 4096, 0), 4096);
        assert_eq!(block_size_at(4097, 4096, 1), 1);
    }
}
