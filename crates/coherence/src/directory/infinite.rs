//! Unbounded directory.
//!
//! Every allocation succeeds unless the address is already present, so entries are never
//! victimised and the evict buffer stays empty. `same_set` answers a fixed value chosen by
//! the `same_set` parameter.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::common::{CheckpointError, ConfigError, PhysAddr};
use crate::controller::BankMap;
use crate::directory::checkpoint::CheckpointRecord;
use crate::directory::{parse_bool, DirEntry, DirEvictBuffer, Directory, DirectoryGeometry};
use crate::state::SharerSet;

/// Hash-map directory that never evicts.
#[derive(Debug)]
pub struct InfiniteDirectory {
    entries: HashMap<PhysAddr, DirEntry>,
    evict_buffer: DirEvictBuffer,
    cores: usize,
    same_set: bool,
}

impl InfiniteDirectory {
    /// Creates an empty directory tracking `cores` cores.
    pub fn new(cores: usize) -> Self {
        Self {
            entries: HashMap::new(),
            evict_buffer: DirEvictBuffer::unbounded(),
            cores,
            same_set: false,
        }
    }

    /// Builds a directory from its parameter list.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownParameter`] for keys other than `same_set`.
    pub fn from_params(
        params: &BTreeMap<String, String>,
        geometry: DirectoryGeometry,
    ) -> Result<Self, ConfigError> {
        let mut dir = Self::new(geometry.cores);
        for (key, value) in params {
            match key.as_str() {
                "same_set" => dir.same_set = parse_bool("same_set", value)?,
                _ => {
                    return Err(ConfigError::UnknownParameter {
                        component: "InfiniteDirectory",
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(dir)
    }

    /// Sets the answer returned by [`Directory::same_set`].
    pub fn set_same_set_return(&mut self, value: bool) {
        self.same_set = value;
    }
}

impl Directory for InfiniteDirectory {
    fn lookup(&self, addr: PhysAddr) -> Option<&DirEntry> {
        self.entries.get(&addr)
    }

    fn lookup_mut(&mut self, addr: PhysAddr) -> Option<&mut DirEntry> {
        self.entries.get_mut(&addr)
    }

    fn allocate(&mut self, addr: PhysAddr, state: SharerSet) -> bool {
        if self.entries.contains_key(&addr) {
            return false;
        }
        let _ = self.entries.insert(addr, DirEntry::new(state));
        true
    }

    fn remove(&mut self, addr: PhysAddr) {
        let _ = self.entries.remove(&addr);
    }

    fn same_set(&self, _a: PhysAddr, _b: PhysAddr) -> bool {
        self.same_set
    }

    fn evict_buffer(&self) -> &DirEvictBuffer {
        &self.evict_buffer
    }

    fn evict_buffer_mut(&mut self) -> &mut DirEvictBuffer {
        &mut self.evict_buffer
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn save_checkpoint(&self) -> Vec<CheckpointRecord> {
        let mut records: Vec<_> = self
            .entries
            .iter()
            .map(|(addr, entry)| CheckpointRecord::new(*addr, &entry.sharers))
            .collect();
        records.sort_by_key(|r| r.tag);
        records
    }

    fn load_checkpoint(
        &mut self,
        records: &[CheckpointRecord],
        bank_map: &BankMap,
        bank: usize,
    ) -> Result<usize, CheckpointError> {
        self.entries.clear();
        self.evict_buffer.clear();
        for record in records {
            if bank_map.bank_of(record.addr()) != bank {
                continue;
            }
            let sharers = record.sharer_set(self.cores)?;
            let _ = self.entries.insert(record.addr(), DirEntry::new(sharers));
        }
        debug!(bank, loaded = self.entries.len(), "infinite directory checkpoint loaded");
        Ok(self.entries.len())
    }
}
