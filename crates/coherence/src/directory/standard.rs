//! Set-associative directory.
//!
//! A bounded directory of `sets` × `assoc` ways. The set index is taken from the block
//! address with the bank-select bits removed, so that every set of every bank is
//! reachable:
//!
//! ```text
//! +-----------+------------+------+-----------+--------------+
//! |    Tag    | Index High | Bank | Index Low | Block Offset |
//! +-----------+------------+------+-----------+--------------+
//! ```
//!
//! With `skew_set` enabled the address is first folded as `a ^ (a >> skew_shift)`.
//!
//! Allocation into a full set victimises the unprotected way with the fewest sharers.
//! A victim that still has sharers moves to the evict buffer to be back-invalidated; if
//! the buffer has no free slot, the allocation fails and the requester must wait.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::common::{CheckpointError, ConfigError, PhysAddr};
use crate::controller::BankMap;
use crate::directory::checkpoint::CheckpointRecord;
use crate::directory::{
    parse_bool, parse_usize, DirEntry, DirEvictBuffer, Directory, DirectoryGeometry,
};
use crate::state::SharerSet;

#[derive(Clone, Debug)]
struct Way {
    tag: PhysAddr,
    entry: DirEntry,
}

/// Bounded set-associative directory.
#[derive(Debug)]
pub struct StandardDirectory {
    sets: Vec<Vec<Option<Way>>>,
    assoc: usize,
    cores: usize,
    block_size: u64,
    block_bits: u32,
    low_mask: u64,
    high_shift: u32,
    high_mask: u64,
    skew_shift: Option<u32>,
    evict_buffer: DirEvictBuffer,
    len: usize,
}

impl StandardDirectory {
    /// Creates an empty directory.
    ///
    /// # Arguments
    ///
    /// * `sets` - Sets per bank; a power of two.
    /// * `assoc` - Ways per set.
    /// * `skew_set` - Fold high address bits into the set index.
    /// * `geometry` - Core count, block size, and bank layout.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a size is not a power of two, `assoc` is zero, or the
    /// interleave is smaller than a block.
    pub fn new(
        sets: usize,
        assoc: usize,
        skew_set: bool,
        geometry: DirectoryGeometry,
    ) -> Result<Self, ConfigError> {
        if !sets.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                key: "sets",
                value: sets as u64,
            });
        }
        if assoc == 0 {
            return Err(ConfigError::InvalidValue {
                key: "assoc",
                value: "0".to_owned(),
                reason: "associativity must be non-zero",
            });
        }
        if !geometry.block_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                key: "block_size",
                value: geometry.block_size,
            });
        }
        if geometry.interleave < geometry.block_size {
            return Err(ConfigError::InvalidValue {
                key: "interleave",
                value: geometry.interleave.to_string(),
                reason: "bank interleave must be at least one block",
            });
        }

        let block_bits = geometry.block_size.trailing_zeros();
        let index_bits = sets.trailing_zeros();
        let bank_bits = geometry.banks.max(1).trailing_zeros();
        let interleave_bits = geometry.interleave.trailing_zeros();

        let low_bits = (interleave_bits - block_bits).min(index_bits);
        let high_bits = index_bits - low_bits;
        let low_mask = (1u64 << low_bits) - 1;
        let high_mask = ((1u64 << high_bits) - 1) << low_bits;
        let skew_shift = skew_set
            .then(|| 34u32.saturating_sub(index_bits + bank_bits + block_bits).max(1));

        debug!(
            sets,
            assoc,
            low_bits,
            high_bits,
            ?skew_shift,
            "standard directory created"
        );

        Ok(Self {
            sets: vec![vec![None; assoc]; sets],
            assoc,
            cores: geometry.cores,
            block_size: geometry.block_size,
            block_bits,
            low_mask,
            high_shift: bank_bits + block_bits,
            high_mask,
            skew_shift,
            evict_buffer: DirEvictBuffer::bounded(geometry.eb_size),
            len: 0,
        })
    }

    /// Builds a directory from its parameter list.
    ///
    /// Recognised keys are `sets`, `assoc` (or `associativity`), and `skew` (or
    /// `skew_set`). `sets` and `assoc` are required.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownParameter`] for any other key, and the errors of
    /// [`StandardDirectory::new`].
    pub fn from_params(
        params: &BTreeMap<String, String>,
        geometry: DirectoryGeometry,
    ) -> Result<Self, ConfigError> {
        let mut sets = None;
        let mut assoc = None;
        let mut skew = false;
        for (key, value) in params {
            match key.as_str() {
                "sets" => sets = Some(parse_usize("sets", value)?),
                "assoc" | "associativity" => assoc = Some(parse_usize("assoc", value)?),
                "skew" | "skew_set" => skew = parse_bool("skew_set", value)?,
                _ => {
                    return Err(ConfigError::UnknownParameter {
                        component: "StandardDirectory",
                        key: key.clone(),
                    });
                }
            }
        }
        let missing = |key| ConfigError::InvalidValue {
            key,
            value: String::new(),
            reason: "required parameter is missing",
        };
        Self::new(
            sets.ok_or_else(|| missing("sets"))?,
            assoc.ok_or_else(|| missing("assoc"))?,
            skew,
            geometry,
        )
    }

    /// Set index of `addr`.
    pub fn set_index(&self, addr: PhysAddr) -> usize {
        let mut a = addr.val();
        if let Some(shift) = self.skew_shift {
            a ^= a >> shift;
        }
        (((a >> self.block_bits) & self.low_mask) | ((a >> self.high_shift) & self.high_mask))
            as usize
    }

    /// Ways per set.
    #[inline]
    pub const fn associativity(&self) -> usize {
        self.assoc
    }

    /// Number of sets.
    #[inline]
    pub fn num_sets(&self) -> usize {
        self.sets.len()
    }

    fn tag(&self, addr: PhysAddr) -> PhysAddr {
        addr.block(self.block_size)
    }

    /// Empty way first, otherwise the unprotected way with the fewest sharers.
    fn pick_victim(set: &[Option<Way>]) -> Option<usize> {
        if let Some(empty) = set.iter().position(Option::is_none) {
            return Some(empty);
        }
        set.iter()
            .enumerate()
            .filter_map(|(i, way)| way.as_ref().map(|w| (i, w)))
            .filter(|(_, w)| !w.entry.is_protected())
            .min_by_key(|(i, w)| (w.entry.sharers.count(), *i))
            .map(|(i, _)| i)
    }
}

impl Directory for StandardDirectory {
    fn lookup(&self, addr: PhysAddr) -> Option<&DirEntry> {
        let tag = self.tag(addr);
        self.sets[self.set_index(addr)]
            .iter()
            .flatten()
            .find(|w| w.tag == tag)
            .map(|w| &w.entry)
    }

    fn lookup_mut(&mut self, addr: PhysAddr) -> Option<&mut DirEntry> {
        let tag = self.tag(addr);
        let set = self.set_index(addr);
        self.sets[set]
            .iter_mut()
            .flatten()
            .find(|w| w.tag == tag)
            .map(|w| &mut w.entry)
    }

    fn allocate(&mut self, addr: PhysAddr, state: SharerSet) -> bool {
        if self.lookup(addr).is_some() {
            return false;
        }
        let tag = self.tag(addr);
        let set = self.set_index(addr);
        let Some(way) = Self::pick_victim(&self.sets[set]) else {
            trace!(addr = %addr, set, "no unprotected way");
            return false;
        };

        if let Some(victim) = &self.sets[set][way] {
            if !victim.entry.sharers.no_sharers() {
                if !self.evict_buffer.has_free_slot() {
                    trace!(addr = %addr, set, "victim needs an evict-buffer slot");
                    return false;
                }
                debug!(addr = %addr, victim = %victim.tag, sharers = %victim.entry.sharers, "directory victim to evict buffer");
                self.evict_buffer
                    .insert(victim.tag, victim.entry.sharers.clone());
            }
        } else {
            self.len += 1;
        }

        self.sets[set][way] = Some(Way {
            tag,
            entry: DirEntry::new(state),
        });
        true
    }

    fn remove(&mut self, addr: PhysAddr) {
        let tag = self.tag(addr);
        let set = self.set_index(addr);
        if let Some(slot) = self.sets[set]
            .iter_mut()
            .find(|w| matches!(w, Some(way) if way.tag == tag))
        {
            *slot = None;
            self.len -= 1;
        }
    }

    fn same_set(&self, a: PhysAddr, b: PhysAddr) -> bool {
        self.set_index(a) == self.set_index(b)
    }

    fn evict_buffer(&self) -> &DirEvictBuffer {
        &self.evict_buffer
    }

    fn evict_buffer_mut(&mut self) -> &mut DirEvictBuffer {
        &mut self.evict_buffer
    }

    fn len(&self) -> usize {
        self.len
    }

    fn save_checkpoint(&self) -> Vec<CheckpointRecord> {
        let mut records: Vec<_> = self
            .sets
            .iter()
            .flatten()
            .flatten()
            .map(|w| CheckpointRecord::new(w.tag, &w.entry.sharers))
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
        self.sets.iter_mut().flatten().for_each(|w| *w = None);
        self.len = 0;
        self.evict_buffer.clear();
        for record in records {
            let addr = record.addr();
            if bank_map.bank_of(addr) != bank {
                continue;
            }
            let sharers = record.sharer_set(self.cores)?;
            let tag = self.tag(addr);
            let set = self.set_index(addr);
            let Some(slot) = self.sets[set].iter_mut().find(|w| w.is_none()) else {
                return Err(CheckpointError::SetFull {
                    tag: record.tag,
                    set,
                });
            };
            *slot = Some(Way {
                tag,
                entry: DirEntry::new(sharers),
            });
            self.len += 1;
        }
        debug!(bank, loaded = self.len, "standard directory checkpoint loaded");
        Ok(self.len)
    }
}
