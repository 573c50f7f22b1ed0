//! Directory checkpoint records and files.
//!
//! A checkpoint is a JSON array of `{ "tag": <u64>, "sharers": "<bitstring>" }` records,
//! one per tracked block, with the sharer bitstring written most-significant core first.
//! Every bank of a system writes into one merged file; on load each bank keeps only the
//! records whose address maps to it.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::{CheckpointError, PhysAddr};
use crate::state::SharerSet;

/// One saved directory entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Block address.
    pub tag: u64,
    /// Sharer bitstring.
    pub sharers: String,
}

impl CheckpointRecord {
    /// Builds a record from a directory entry.
    pub fn new(addr: PhysAddr, sharers: &SharerSet) -> Self {
        Self {
            tag: addr.val(),
            sharers: sharers.to_bitstring(),
        }
    }

    /// Parses the sharer bitstring for a system with `cores` cores.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::BadSharers`] if the string is not binary or names a
    /// core beyond `cores`.
    pub fn sharer_set(&self, cores: usize) -> Result<SharerSet, CheckpointError> {
        SharerSet::from_bitstring(&self.sharers, cores).map_err(|reason| {
            CheckpointError::BadSharers {
                tag: self.tag,
                bits: self.sharers.clone(),
                reason,
            }
        })
    }

    /// Address of the record.
    #[inline]
    pub const fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.tag)
    }
}

/// Writes `records` to `path` as a JSON array.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] or [`CheckpointError::Json`] on failure.
pub fn save(path: &Path, records: &[CheckpointRecord]) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records).map_err(|source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(io_err)
}

/// Reads a JSON array of records from `path`.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] if the file cannot be opened and
/// [`CheckpointError::Json`] if it is not a record array.
pub fn load(path: &Path) -> Result<Vec<CheckpointRecord>, CheckpointError> {
    let file = File::open(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    })
}
