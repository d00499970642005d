//! Change hints: byte ranges of the source known to have changed (or to be
//! unallocated) since the base version.

use blocksnap_core::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    pub offset: u64,
    pub length: u64,
    /// `false` marks a range with no data, which may be backed up as sparse.
    #[serde(deserialize_with = "flexible_bool")]
    pub exists: bool,
}

impl Hint {
    pub fn new(offset: u64, length: u64, exists: bool) -> Self {
        Self { offset, length, exists }
    }
}

fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Bool(bool),
        Text(String),
    }

    match Flexible::deserialize(deserializer)? {
        Flexible::Bool(value) => Ok(value),
        Flexible::Text(text) => match text.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!("invalid exists value {:?}", other))),
        },
    }
}

/// Parses a JSON list of hints.
pub fn parse_hints<R: Read>(reader: R) -> Result<Vec<Hint>> {
    serde_json::from_reader(reader).map_err(|e| Error::InputData(format!("Invalid hints: {}", e)))
}

/// Rejects hints reaching past the end of a source of `size` bytes.
pub fn validate_hints(hints: &[Hint], size: u64) -> Result<()> {
    for hint in hints {
        let end = hint.offset.checked_add(hint.length).ok_or_else(|| {
            Error::InputData(format!("Hint at offset {} with length {} overflows", hint.offset, hint.length))
        })?;
        if end > size {
            return Err(Error::InputData(format!(
                "Hint at offset {} with length {} exceeds the source size of {} bytes",
                hint.offset, hint.length, size
            )));
        }
    }
    Ok(())
}

/// Block ids to read and block ids known to be sparse.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HintedBlocks {
    pub read: BTreeSet<u64>,
    pub sparse: BTreeSet<u64>,
}

/// Maps hinted byte ranges onto blocks. Only blocks fully covered by a
/// non-existing range are sparse; partially covered ones are read, and a
/// block named by both kinds of range is read.
pub fn hints_to_blocks(hints: &[Hint], block_size: u64) -> HintedBlocks {
    let mut blocks = HintedBlocks::default();
    for hint in hints.iter().filter(|h| h.length > 0) {
        let end = hint.offset + hint.length;
        let first = hint.offset / block_size;
        let last = (end - 1) / block_size;
        if hint.exists {
            blocks.read.extend(first..=last);
            continue;
        }
        for id in first..=last {
            let block_start = id * block_size;
            let block_end = block_start + block_size;
            if hint.offset <= block_start && end >= block_end {
                blocks.sparse.insert(id);
            } else {
                blocks.read.insert(id);
            }
        }
    }
    let read = &blocks.read;
    blocks.sparse.retain(|id| !read.contains(id));
    blocks
}
