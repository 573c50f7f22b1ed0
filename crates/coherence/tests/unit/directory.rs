//! # Directory and Evict Buffer Tests
//!
//! Directory organisations, victim selection, and the directory evict buffer that
//! holds victims until their sharers are invalidated.

use std::collections::BTreeMap;

use cohsim_core::array::{CacheEvictBuffer, LineState};
use cohsim_core::common::{ConfigError, PhysAddr};
use cohsim_core::protocol::MessageKind;
use cohsim_core::directory::{
    self, Directory, DirectoryGeometry, DirEvictBuffer, InfiniteDirectory, StandardDirectory,
};
use cohsim_core::state::SharerSet;
use proptest::prelude::*;
use rstest::rstest;

fn geometry(eb_size: usize) -> DirectoryGeometry {
    DirectoryGeometry {
        cores: 4,
        block_size: 64,
        banks: 1,
        interleave: 64,
        eb_size,
    }
}

fn sharers(cores: &[usize]) -> SharerSet {
    let mut s = SharerSet::new(4);
    for &c in cores {
        s.add_sharer(c);
    }
    s
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

// ══════════════════════════════════════════════════════════
// 1. Victim Eviction
// ══════════════════════════════════════════════════════════

/// A one-way, one-set directory with a one-entry evict buffer: every block collides.
#[test]
fn evicted_slot_is_not_reused_until_the_evict_buffer_drains() {
    let mut dir = StandardDirectory::new(1, 1, false, geometry(1)).unwrap();
    let (a, b, c) = (PhysAddr::new(0x000), PhysAddr::new(0x040), PhysAddr::new(0x080));

    assert!(dir.allocate(a, sharers(&[0, 1, 2])));
    assert!(dir.allocate(b, sharers(&[3])));
    assert!(dir.lookup(a).is_none());
    let buffered = dir.evict_buffer().find(a).unwrap();
    assert_eq!(buffered.state.count(), 3);
    assert!(buffered.invalidates_required());
    assert!(dir.idle_work_ready());

    // B has a sharer, so evicting it needs a buffer slot that A still holds.
    assert!(!dir.allocate(c, SharerSet::new(4)));
    assert!(dir.lookup(b).is_some());

    let eb = dir.evict_buffer_mut();
    eb.set_invalidates_pending(a, 3);
    assert!(!eb.idle_work_ready());
    for core in 0..3 {
        let entry = eb.find_mut(a).unwrap();
        entry.state.remove_sharer(core);
        let _ = eb.complete_invalidate(a);
    }
    assert_eq!(eb.find(a).unwrap().invalidates_pending(), 0);
    let _ = eb.remove(a);
    assert_eq!(eb.pending_invalidates(), 0);

    assert!(dir.allocate(c, SharerSet::new(4)));
    assert!(dir.evict_buffer().find(b).is_some());
}

#[test]
fn victim_without_sharers_is_dropped_silently() {
    let mut dir = StandardDirectory::new(1, 1, false, geometry(1)).unwrap();
    assert!(dir.allocate(PhysAddr::new(0x000), SharerSet::new(4)));
    assert!(dir.allocate(PhysAddr::new(0x040), SharerSet::new(4)));
    assert!(dir.evict_buffer().is_empty());
    assert_eq!(dir.len(), 1);
}

#[test]
fn protected_ways_are_never_victims() {
    let mut dir = StandardDirectory::new(1, 2, false, geometry(4)).unwrap();
    let (a, b) = (PhysAddr::new(0x000), PhysAddr::new(0x040));
    assert!(dir.allocate(a, sharers(&[0])));
    assert!(dir.allocate(b, sharers(&[1])));
    dir.lookup_mut(a).unwrap().set_protected(true);
    dir.lookup_mut(b).unwrap().set_protected(true);

    assert!(!dir.allocate(PhysAddr::new(0x080), SharerSet::new(4)));

    dir.lookup_mut(b).unwrap().set_protected(false);
    assert!(dir.allocate(PhysAddr::new(0x080), SharerSet::new(4)));
    assert!(dir.lookup(a).is_some());
    assert!(dir.evict_buffer().find(b).is_some());
}

#[test]
#[should_panic(expected = "removed before sharers")]
fn removing_an_uninvalidated_entry_panics() {
    let mut eb = DirEvictBuffer::bounded(2);
    eb.insert(PhysAddr::new(0x40), sharers(&[1]));
    let _ = eb.remove(PhysAddr::new(0x40));
}

#[test]
fn reclaim_returns_an_entry_to_the_directory() {
    let mut eb = DirEvictBuffer::bounded(2);
    eb.insert(PhysAddr::new(0x40), sharers(&[1, 2]));
    let entry = eb.reclaim(PhysAddr::new(0x40));
    assert_eq!(entry.state, sharers(&[1, 2]));
    assert!(eb.is_empty());
}

// ══════════════════════════════════════════════════════════
// 2. Evict Buffer Accounting
// ══════════════════════════════════════════════════════════

#[test]
fn pending_invalidates_promise_a_free_slot() {
    let mut eb = DirEvictBuffer::bounded(1);
    let addr = PhysAddr::new(0x80);
    eb.insert(addr, sharers(&[0, 1]));
    assert!(eb.is_full());
    assert!(!eb.free_slots_pending());

    eb.set_invalidates_pending(addr, 2);
    assert!(eb.free_slots_pending());
    assert_eq!(eb.complete_invalidate(addr), 1);
    assert!(eb.free_slots_pending());
}

#[test]
fn cache_eb_write_back_completes_once() {
    let mut eb = CacheEvictBuffer::new(2);
    let addr = PhysAddr::new(0xC0);
    eb.alloc_entry(addr, MessageKind::EvictDirty, LineState::Modified);
    let issued = eb.first_non_pending();
    assert_eq!(issued.addr, addr);
    assert_eq!(eb.pending(), 1);

    let done = eb.remove(addr);
    assert!(done.pending);
    assert_eq!(eb.pending(), 0);
    assert!(eb.is_empty());
}

#[test]
#[should_panic(expected = "does not exist")]
fn removing_a_missing_cache_eb_line_panics() {
    let mut eb = CacheEvictBuffer::new(2);
    eb.alloc_entry(PhysAddr::new(0x40), MessageKind::EvictClean, LineState::Shared);
    let _ = eb.remove(PhysAddr::new(0x80));
}

#[test]
fn unbounded_buffer_ignores_reservations() {
    let mut eb = DirEvictBuffer::unbounded();
    eb.reserve(100);
    assert!(eb.has_space(1_000));
    assert!(!eb.is_full());
    assert_eq!(eb.reserved(), 0);
}

#[derive(Debug, Clone, Copy)]
enum EbOp {
    Reserve,
    Release,
    Commit,
    Drain,
}

fn eb_op() -> impl Strategy<Value = EbOp> {
    prop_oneof![
        Just(EbOp::Reserve),
        Just(EbOp::Release),
        Just(EbOp::Commit),
        Just(EbOp::Drain),
    ]
}

proptest! {
    /// Entries enter only through a reservation and leave only after invalidation.
    #[test]
    fn used_plus_reserved_never_exceeds_size(size in 1usize..5, ops in prop::collection::vec(eb_op(), 0..64)) {
        let mut eb = DirEvictBuffer::bounded(size);
        let mut next = 0u64;
        for op in ops {
            match op {
                EbOp::Reserve => {
                    if eb.has_space(1) {
                        eb.reserve(1);
                    }
                }
                EbOp::Release => {
                    if eb.reserved() > 0 {
                        eb.unreserve(1);
                    }
                }
                EbOp::Commit => {
                    if eb.reserved() > 0 {
                        next += 0x40;
                        eb.unreserve(1);
                        eb.insert(PhysAddr::new(next), sharers(&[0, 1]));
                    }
                }
                EbOp::Drain => {
                    let oldest = eb.oldest_requiring_invalidates().map(|e| e.addr);
                    if let Some(addr) = oldest {
                        eb.set_invalidates_pending(addr, 2);
                        for core in 0..2 {
                            eb.find_mut(addr).unwrap().state.remove_sharer(core);
                            let _ = eb.complete_invalidate(addr);
                        }
                        let _ = eb.remove(addr);
                    }
                }
            }
            prop_assert!(eb.len() + eb.reserved() <= size);
            prop_assert_eq!(eb.pending_invalidates(), 0);
        }
    }
}

// ══════════════════════════════════════════════════════════
// 3. Organisations
// ══════════════════════════════════════════════════════════

#[test]
fn infinite_directory_always_allocates() {
    let mut dir = InfiniteDirectory::new(4);
    for i in 0..1_000u64 {
        assert!(dir.allocate(PhysAddr::new(i * 64), sharers(&[(i % 4) as usize])));
    }
    assert_eq!(dir.len(), 1_000);
    assert!(!dir.allocate(PhysAddr::new(0), SharerSet::new(4)));
    assert!(!dir.same_set(PhysAddr::new(0), PhysAddr::new(64)));

    dir.remove(PhysAddr::new(0));
    assert!(dir.lookup(PhysAddr::new(0)).is_none());
    assert_eq!(dir.len(), 999);
}

#[test]
fn standard_directory_is_built_from_params() {
    let dir = directory::create("Standard", &params(&[("sets", "16"), ("assoc", "4")]), geometry(8))
        .unwrap();
    assert!(dir.is_empty());
    assert_eq!(dir.evict_buffer().capacity(), Some(8));

    let dir = directory::create("infinite", &BTreeMap::new(), geometry(8)).unwrap();
    assert_eq!(dir.evict_buffer().capacity(), None);
}

#[rstest]
#[case::unknown_name("Sparse", &[], "unknown directory type")]
#[case::missing_sets("Standard", &[("assoc", "4")], "sets")]
#[case::bad_sets("Standard", &[("sets", "12"), ("assoc", "4")], "power of two")]
#[case::zero_assoc("Standard", &[("sets", "4"), ("assoc", "0")], "non-zero")]
#[case::unknown_key("Standard", &[("sets", "4"), ("assoc", "1"), ("ways", "2")], "ways")]
#[case::infinite_key("Infinite", &[("sets", "4")], "InfiniteDirectory")]
fn bad_directory_configs_are_rejected(
    #[case] name: &str,
    #[case] pairs: &[(&str, &str)],
    #[case] message: &str,
) {
    let err = directory::create(name, &params(pairs), geometry(4)).unwrap_err();
    assert!(err.to_string().contains(message), "{err}");
}

#[test]
fn standard_directory_skips_bank_bits_in_the_set_index() {
    let mut g = geometry(4);
    g.banks = 4;
    let dir = StandardDirectory::new(4, 1, false, g).unwrap();
    // Bank bits are 6..8; the set index comes from the bits above them.
    assert_eq!(dir.set_index(PhysAddr::new(0x040)), 0);
    assert_eq!(dir.set_index(PhysAddr::new(0x100)), 1);
    assert_eq!(dir.set_index(PhysAddr::new(0x300)), 3);
    assert_eq!(dir.num_sets(), 4);
    assert!(matches!(
        StandardDirectory::new(3, 1, false, g),
        Err(ConfigError::NotPowerOfTwo { key: "sets", .. })
    ));
}
