//! Portable JSON form of versions with their blocks and tags.

use super::store::{MetadataStore, timestamp};
use crate::{BlockUid, Error, Result, VersionUid, blocks_count, block_size_at};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::io::{Read, Write};
use tracing::info;

pub const METADATA_VERSION: &str = "1.0.0";

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    #[serde(rename = "metadataVersion")]
    pub metadata_version: String,
    pub versions: Vec<VersionDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDocument {
    pub uid: VersionUid,
    #[serde(with = "iso_date")]
    pub date: DateTime<Utc>,
    pub name: String,
    pub snapshot_name: String,
    pub size: u64,
    pub block_size: u64,
    pub valid: bool,
    pub protected: bool,
    #[serde(default)]
    pub tags: Vec<TagDocument>,
    pub blocks: Vec<BlockDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDocument {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDocument {
    pub id: u64,
    pub uid: BlockUid,
    #[serde(with = "iso_date")]
    pub date: DateTime<Utc>,
    pub size: u64,
    pub valid: bool,
    pub checksum: Option<String>,
}

mod iso_date {
    use super::*;

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format(DATE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&text, DATE_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

impl VersionDocument {
    fn check(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InputData(format!("Version {} has a zero block size", self.uid)));
        }
        let expected = blocks_count(self.size, self.block_size);
        if self.blocks.len() as u64 != expected {
            return Err(Error::InputData(format!(
                "Version {} has {} blocks, expected {}",
                self.uid,
                self.blocks.len(),
                expected
            )));
        }
        for (index, block) in self.blocks.iter().enumerate() {
            if block.id != index as u64 {
                return Err(Error::InputData(format!(
                    "Version {} has non-contiguous block ids at index {}",
                    self.uid, index
                )));
            }
            if block.uid.is_sparse() != block.checksum.is_none() {
                return Err(Error::InputData(format!(
                    "Block {} of version {} must have both uid and checksum or neither",
                    block.id, self.uid
                )));
            }
            if block.size != block_size_at(self.size, self.block_size, block.id) {
                return Err(Error::InputData(format!(
                    "Block {} of version {} has size {}",
                    block.id, self.uid, block.size
                )));
            }
        }
        Ok(())
    }
}

impl MetadataStore {
    pub fn export_document(&mut self, uids: &[VersionUid]) -> Result<MetadataDocument> {
        self.commit()?;
        let mut versions = Vec::with_capacity(uids.len());
        for uid in uids {
            let version = self.get_version(*uid)?;
            let blocks = self
                .get_blocks_by_version(*uid)?
                .into_iter()
                .map(|block| BlockDocument {
                    id: block.id,
                    uid: block.uid,
                    date: block.date,
                    size: block.size,
                    valid: block.valid,
                    checksum: block.checksum,
                })
                .collect();
            versions.push(VersionDocument {
                uid: version.uid,
                date: version.date,
                name: version.name,
                snapshot_name: version.snapshot_name,
                size: version.size,
                block_size: version.block_size,
                valid: version.valid,
                protected: version.protected,
                tags: version.tags.into_iter().map(|name| TagDocument { name }).collect(),
                blocks,
            });
        }
        Ok(MetadataDocument {
            metadata_version: METADATA_VERSION.to_string(),
            versions,
        })
    }

    pub fn export<W: Write>(&mut self, uids: &[VersionUid], writer: W) -> Result<()> {
        let document = self.export_document(uids)?;
        serde_json::to_writer_pretty(writer, &document)?;
        info!(versions = uids.len(), "Exported metadata");
        Ok(())
    }

    pub fn import<R: Read>(&mut self, reader: R) -> Result<Vec<VersionUid>> {
        let value: serde_json::Value = serde_json::from_reader(reader)?;
        let metadata_version = value
            .get("metadataVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InputData("Document has no metadataVersion".to_string()))?;
        if metadata_version != METADATA_VERSION {
            return Err(Error::InputData(format!(
                "Unsupported metadata version {}",
                metadata_version
            )));
        }
        let document: MetadataDocument =
            serde_json::from_value(value).map_err(|e| Error::InputData(e.to_string()))?;
        self.import_document(&document)
    }

    /// Inserts every version of `document` with its original uid, all or nothing.
    pub fn import_document(&mut self, document: &MetadataDocument) -> Result<Vec<VersionUid>> {
        if document.metadata_version != METADATA_VERSION {
            return Err(Error::InputData(format!(
                "Unsupported metadata version {}",
                document.metadata_version
            )));
        }
        for version in &document.versions {
            version.check()?;
            if self.version_exists(version.uid)? {
                return Err(Error::already_exists("version", version.uid));
            }
        }

        let uids = self.transaction(|tx| {
            let mut uids = Vec::with_capacity(document.versions.len());
            for version in &document.versions {
                tx.execute(
                    "INSERT INTO versions(uid, date, name, snapshot_name, size, block_size, valid, protected)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        version.uid.as_i64(),
                        timestamp(version.date),
                        version.name,
                        version.snapshot_name,
                        version.size as i64,
                        version.block_size as i64,
                        version.valid,
                        version.protected
                    ],
                )?;
                for tag in &version.tags {
                    tx.execute(
                        "INSERT INTO tags(version_uid, name) VALUES (?1, ?2)",
                        params![version.uid.as_i64(), tag.name],
                    )?;
                }
                let mut stmt = tx.prepare(
                    "INSERT INTO blocks(version_uid, id, uid_left, uid_right, checksum, size, valid, date)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for block in &version.blocks {
                    let (left, right) = block.uid.to_sql();
                    stmt.execute(params![
                        version.uid.as_i64(),
                        block.id as i64,
                        left,
                        right,
                        block.checksum,
                        block.size as i64,
                        block.valid,
                        timestamp(block.date)
                    ])?;
                }
                uids.push(version.uid);
            }
            Ok(uids)
        })?;

        info!(versions = uids.len(), "Imported metadata");
        Ok(uids)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VersionFilter;

    fn populated() -> (tempfile::TempDir, MetadataStore, VersionUid) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::open(dir.path().join("meta.sqlite"), true).unwrap();
        let version = store.create_version("vm1", "snap", 4096 * 2 + 100, 4096, false, false).unwrap();
        store
            .set_block(0, version.uid, BlockUid::new(1, 2), Some("aa"), 4096, true, false)
            .unwrap();
        store.set_block(1, version.uid, BlockUid::sparse(), None, 4096, true, false).unwrap();
        store
            .set_block(2, version.uid, BlockUid::new(3, 4), Some("bb"), 100, false, false)
            .unwrap();
        store.commit().unwrap();
        store.set_version(version.uid, Some(true), Some(true)).unwrap();
        store.add_tag(version.uid, "weekly").unwrap();
        (dir, store, version.uid)
    }

    #[test]
    fn test_export_import_roundtrip() {
        let (_dir, mut source, uid) = populated();
        let mut buffer = Vec::new();
        source.export(&[uid], &mut buffer).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.contains("\"metadataVersion\": \"1.0.0\""));

        let dir = tempfile::tempdir().unwrap();
        let mut target = MetadataStore::open(dir.path().join("meta.sqlite"), true).unwrap();
        assert_eq!(target.import(buffer.as_slice()).unwrap(), vec![uid]);

        let original = source.export_document(&[uid]).unwrap();
        let imported = target.export_document(&[uid]).unwrap();
        assert_eq!(original, imported);

        let next = target.create_version("vm1", "", 4096, 4096, false, false).unwrap();
        assert!(next.uid > uid);
    }

    #[test]
    fn test_import_rejects_existing_version() {
        let (_dir, mut store, uid) = populated();
        let mut buffer = Vec::new();
        store.export(&[uid], &mut buffer).unwrap();
        assert!(matches!(store.import(buffer.as_slice()), Err(Error::AlreadyExists { .. })));
        assert_eq!(store.get_versions(&VersionFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_import_rejects_unknown_metadata_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::open(dir.path().join("meta.sqlite"), true).unwrap();
        let doc = r#"{"metadataVersion": "2.0.0", "versions": []}"#;
        assert!(matches!(store.import(doc.as_bytes()), Err(Error::InputData(_))));
        assert!(matches!(store.import(&b"not json"[..]), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_import_rejects_inconsistent_blocks() {
        let (_dir, mut store, uid) = populated();
        let mut document = store.export_document(&[uid]).unwrap();
        document.versions[0].uid = VersionUid::new(99);
        document.versions[0].blocks.pop();
        assert!(matches!(store.import_document(&document), Err(Error::InputData(_))));

        let mut document = store.export_document(&[uid]).unwrap();
        document.versions[0].uid = VersionUid::new(99);
        document.versions[0].blocks[0].checksum = None;
        assert!(matches!(store.import_document(&document), Err(Error::InputData(_))));
    }
}
