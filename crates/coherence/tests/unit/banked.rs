//! # Banked Controller Tests
//!
//! Address interleaving, port-to-bank routing, and fair arbitration between ports.

use cohsim_core::common::{ConfigError, PhysAddr};
use cohsim_core::controller::{BankMap, BankedController, DirectoryController, ProcessKind};
use cohsim_core::protocol::{DestinationKind, MessageKind};
use rstest::rstest;

use crate::common::builder::{ConfigBuilder, from_core, memory_reply};
use crate::common::harness::BankedContext;

// ══════════════════════════════════════════════════════════
// 1. Bank Mapping
// ══════════════════════════════════════════════════════════

#[rstest]
#[case(0x000, 0)]
#[case(0x040, 1)]
#[case(0x080, 2)]
#[case(0x0C0, 3)]
#[case(0x100, 0)]
#[case(0x13F, 0)]
fn blocks_interleave_across_banks(#[case] addr: u64, #[case] bank: usize) {
    let map = BankMap::new(4, 64, 0).unwrap();
    assert_eq!(map.bank_of(PhysAddr::new(addr)), bank);
}

#[rstest]
#[case(0x000, 0)]
#[case(0x100, 1)]
#[case(0x140, 0)]
#[case(0x200, 2)]
fn skew_folds_high_bits_into_the_bank(#[case] addr: u64, #[case] bank: usize) {
    let map = BankMap::new(4, 64, 8).unwrap();
    assert_eq!(map.bank_of(PhysAddr::new(addr)), bank);
}

#[test]
fn single_bank_map_owns_everything() {
    let map = BankMap::single();
    assert_eq!(map.banks(), 1);
    assert_eq!(map.bank_of(PhysAddr::new(0xDEAD_BEC0)), 0);
}

#[rstest]
#[case::banks(3, 64, "banks")]
#[case::zero_banks(0, 64, "banks")]
#[case::interleave(4, 96, "interleave")]
fn bank_geometry_must_be_a_power_of_two(
    #[case] banks: usize,
    #[case] interleave: u64,
    #[case] key: &str,
) {
    match BankMap::new(banks, interleave, 0) {
        Err(ConfigError::NotPowerOfTwo { key: k, .. }) => assert_eq!(k, key),
        other => panic!("expected NotPowerOfTwo for {key}, got {other:?}"),
    }
}

// ══════════════════════════════════════════════════════════
// 2. Routing
// ══════════════════════════════════════════════════════════

#[test]
fn private_ports_feed_their_own_bank() {
    let config = ConfigBuilder::new().banks(4).build();
    let mut ctx = BankedContext::new(&config);
    for port in 0..4 {
        ctx.ctrl
            .input_mut(port)
            .request
            .push(from_core(MessageKind::ReadReq, 0x1000, port));
    }
    ctx.run_until(|c| (0..4).all(|p| !c.output(p).snoop.is_empty()));

    for bank in 0..4 {
        assert_eq!(ctx.ctrl.bank(bank).stats().processes_of(ProcessKind::Request), 1);
        let snoop = ctx.ctrl.output(bank).snoop.peek().unwrap();
        assert_eq!(snoop.dest().kind, DestinationKind::Memory);
        assert_eq!(snoop.requester(), Some(bank));
    }
}

#[test]
fn local_directory_routes_by_address_and_answers_the_requester() {
    let config = ConfigBuilder::new().banks(4).local_directory(true).build();
    let mut ctx = BankedContext::new(&config);
    ctx.ctrl
        .input_mut(2)
        .request
        .push(from_core(MessageKind::ReadReq, 0xC0, 2));

    ctx.run_until(|c| !c.output(2).snoop.is_empty());
    assert_eq!(ctx.ctrl.bank(3).stats().processes_of(ProcessKind::Request), 1);
    let to_memory = ctx.ctrl.output_mut(2).snoop.pop().unwrap();

    ctx.ctrl
        .input_mut(2)
        .reply
        .push(memory_reply(&to_memory, MessageKind::MissReplyWritable));
    ctx.run_until(|c| !c.output(2).reply.is_empty());
    let reply = ctx.ctrl.output_mut(2).reply.pop().unwrap();
    assert_eq!(reply.kind(), MessageKind::MissReplyWritable);

    ctx.ctrl
        .input_mut(2)
        .reply
        .push(from_core(MessageKind::ReadAck, 0xC0, 2));
    ctx.run_until(BankedController::is_quiesced);

    let stats = ctx.ctrl.stats();
    assert_eq!(stats.processes_of(ProcessKind::Request), 1);
    assert_eq!(stats.processes_of(ProcessKind::Reply), 2);
    let entry = ctx.ctrl.bank(3).policy().directory().lookup(PhysAddr::new(0xC0)).unwrap();
    assert!(entry.sharers.is_sharer(2));
}

/// Bank 0 of four address-interleaved banks.
fn local_bank_zero() -> DirectoryController {
    let config = ConfigBuilder::new().banks(4).local_directory(true).build();
    DirectoryController::new(0, &config).unwrap()
}

#[test]
fn local_bank_serves_the_blocks_it_owns() {
    let mut bank = local_bank_zero();
    bank.input_mut()
        .request
        .push(from_core(MessageKind::ReadReq, 0x100, 1));
    for now in 0..16 {
        bank.drive(now);
    }
    assert_eq!(bank.stats().processes_of(ProcessKind::Request), 1);
    assert!(!bank.output().snoop.is_empty());
}

#[test]
#[should_panic(expected = "belongs to bank 1")]
fn local_bank_rejects_a_block_of_another_bank() {
    let mut bank = local_bank_zero();
    bank.input_mut()
        .request
        .push(from_core(MessageKind::ReadReq, 0x40, 1));
    for now in 0..16 {
        bank.drive(now);
    }
}

#[test]
#[should_panic(expected = "belongs to bank 3")]
fn local_bank_rejects_a_misrouted_reply() {
    let mut bank = local_bank_zero();
    bank.input_mut()
        .reply
        .push(from_core(MessageKind::ReadAck, 0xC0, 2));
    for now in 0..16 {
        bank.drive(now);
    }
}

#[test]
fn private_bank_accepts_any_block() {
    let config = ConfigBuilder::new().banks(4).build();
    let mut bank = DirectoryController::new(0, &config).unwrap();
    bank.input_mut()
        .request
        .push(from_core(MessageKind::ReadReq, 0x40, 0));
    for now in 0..16 {
        bank.drive(now);
    }
    assert_eq!(bank.stats().processes_of(ProcessKind::Request), 1);
}

// ══════════════════════════════════════════════════════════
// 3. Arbitration
// ══════════════════════════════════════════════════════════

/// Every port targets bank 0 through a one-deep queue; ports are served in turn.
#[test]
fn contending_ports_are_served_round_robin() {
    let config = ConfigBuilder::new()
        .banks(4)
        .local_directory(true)
        .request_queue(1)
        .build();
    let mut ctx = BankedContext::new(&config);
    for port in 0..4 {
        let addr = port as u64 * 0x100;
        assert_eq!(ctx.ctrl.bank_map().bank_of(PhysAddr::new(addr)), 0);
        ctx.ctrl
            .input_mut(port)
            .request
            .push(from_core(MessageKind::ReadReq, addr, port));
    }

    let mut served = Vec::new();
    for _ in 0..32 {
        ctx.step();
        for port in 0..4 {
            if ctx.ctrl.input(port).request.is_empty() && !served.contains(&port) {
                served.push(port);
            }
        }
        if served.len() == 4 {
            break;
        }
    }
    assert_eq!(served, vec![0, 1, 2, 3]);
}
