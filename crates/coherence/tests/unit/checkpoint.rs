//! # Checkpoint Tests
//!
//! Saving directory contents to a merged JSON file and restoring each bank's share.

use std::collections::BTreeSet;
use std::io::Write;

use cohsim_core::common::{CheckpointError, PhysAddr};
use cohsim_core::controller::BankMap;
use cohsim_core::directory::{CheckpointRecord, checkpoint};
use cohsim_core::state::SharerSet;
use cohsim_core::{BankedController, Config, DirectoryController};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tempfile::NamedTempFile;

use crate::common::builder::ConfigBuilder;

fn four_banks() -> Config {
    ConfigBuilder::new().banks(4).cores(4).build()
}

fn record(tag: u64, sharers: &str) -> CheckpointRecord {
    CheckpointRecord {
        tag,
        sharers: sharers.to_owned(),
    }
}

/// A four-bank controller with three tracked blocks per bank.
fn populated(config: &Config) -> BankedController {
    let mut ctrl = BankedController::new(config).unwrap();
    for bank in 0..4 {
        for k in 0..3u64 {
            let addr = PhysAddr::new(k * 0x100 + bank as u64 * 0x40);
            let mut sharers = SharerSet::new(4);
            sharers.add_sharer(bank);
            sharers.add_sharer((bank + k as usize) % 4);
            let dir = &mut ctrl.bank_mut(bank).policy_mut().core_mut().directory;
            assert!(dir.allocate(addr, sharers));
        }
    }
    ctrl
}

// ══════════════════════════════════════════════════════════
// 1. Save and Restore
// ══════════════════════════════════════════════════════════

#[test]
fn banked_checkpoint_restores_every_bank() {
    let config = four_banks();
    let original = populated(&config);
    let file = NamedTempFile::new().unwrap();
    original.save_state(file.path()).unwrap();

    let mut restored = BankedController::new(&config).unwrap();
    assert_eq!(restored.load_state(file.path()).unwrap(), 12);
    for bank in 0..4 {
        assert_eq!(
            restored.bank(bank).checkpoint_records(),
            original.bank(bank).checkpoint_records()
        );
    }
}

#[test]
fn saved_file_holds_one_record_per_block() {
    let config = four_banks();
    let file = NamedTempFile::new().unwrap();
    populated(&config).save_state(file.path()).unwrap();

    let records = checkpoint::load(file.path()).unwrap();
    assert_eq!(records.len(), 12);
    let bank0: Vec<_> = records
        .iter()
        .filter(|r| r.tag % 0x100 == 0)
        .map(|r| (r.tag, r.sharers.as_str()))
        .collect();
    assert_eq!(bank0, vec![(0x000, "0001"), (0x100, "0011"), (0x200, "0101")]);
}

#[test]
fn bank_ignores_records_it_does_not_own() {
    let config = four_banks();
    let map = BankMap::new(4, 64, 0).unwrap();
    let mut bank1 = DirectoryController::new(1, &config).unwrap();
    let records = [record(0x000, "0011"), record(0x100, "0100")];

    assert_eq!(bank1.restore(&records, &map).unwrap(), 0);
    assert!(bank1.checkpoint_records().is_empty());
}

#[test]
fn restore_replaces_existing_entries() {
    let config = four_banks();
    let map = BankMap::new(4, 64, 0).unwrap();
    let mut bank0 = DirectoryController::new(0, &config).unwrap();
    assert_eq!(bank0.restore(&[record(0x000, "0001")], &map).unwrap(), 1);
    assert_eq!(bank0.restore(&[record(0x100, "1000")], &map).unwrap(), 1);
    assert_eq!(bank0.checkpoint_records(), vec![record(0x100, "1000")]);
}

proptest! {
    /// Each block is restored by exactly one bank.
    #[test]
    fn every_record_lands_in_exactly_one_bank(blocks in prop::collection::btree_set(0u64..4096, 0..64)) {
        let config = four_banks();
        let records: Vec<_> = blocks.iter().map(|b| record(b * 64, "0001")).collect();
        let file = NamedTempFile::new().unwrap();
        checkpoint::save(file.path(), &records).unwrap();

        let mut ctrl = BankedController::new(&config).unwrap();
        prop_assert_eq!(ctrl.load_state(file.path()).unwrap(), blocks.len());

        let restored: BTreeSet<u64> = (0..4)
            .flat_map(|b| ctrl.bank(b).checkpoint_records())
            .map(|r| r.tag / 64)
            .collect();
        prop_assert_eq!(restored, blocks);
    }
}

// ══════════════════════════════════════════════════════════
// 2. Malformed Checkpoints
// ══════════════════════════════════════════════════════════

#[test]
fn non_binary_sharers_are_rejected() {
    let map = BankMap::single();
    let mut ctrl = DirectoryController::new(0, &ConfigBuilder::new().cores(4).build()).unwrap();
    let err = ctrl.restore(&[record(0x40, "10x1")], &map).unwrap_err();
    assert!(matches!(err, CheckpointError::BadSharers { tag: 0x40, .. }), "{err}");
}

#[test]
fn sharer_beyond_core_count_is_rejected() {
    let map = BankMap::single();
    let mut ctrl = DirectoryController::new(0, &ConfigBuilder::new().cores(4).build()).unwrap();
    let err = ctrl.restore(&[record(0x40, "10000")], &map).unwrap_err();
    assert!(err.to_string().contains("exceeds core count"), "{err}");

    // Leading zeros beyond the core count are harmless.
    assert_eq!(ctrl.restore(&[record(0x40, "00000010")], &map).unwrap(), 1);
}

#[test]
fn full_set_is_reported() {
    let config = ConfigBuilder::new().cores(4).standard_directory(1, 1).build();
    let mut ctrl = DirectoryController::new(0, &config).unwrap();
    let records = [record(0x000, "0001"), record(0x040, "0010")];
    let err = ctrl.restore(&records, &BankMap::single()).unwrap_err();
    assert!(matches!(err, CheckpointError::SetFull { tag: 0x40, set: 0 }), "{err}");
}

#[test]
fn unreadable_files_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.json");
    assert!(matches!(checkpoint::load(&missing), Err(CheckpointError::Io { .. })));

    let mut garbage = NamedTempFile::new().unwrap();
    garbage.write_all(b"{ \"tag\": 1 }").unwrap();
    assert!(matches!(checkpoint::load(garbage.path()), Err(CheckpointError::Json { .. })));
}
