//! # Region Protocol Tests
//!
//! `SingleCMPRegion` transactions through a directory bank, and the decision table
//! that drives them.

use cohsim_core::common::PhysAddr;
use cohsim_core::controller::Action;
use cohsim_core::policy::{ProtocolTable, SharingState};
use cohsim_core::protocol::{DestinationKind, FillLevel, MemoryMessage, MessageKind, Transport};
use cohsim_core::Config;

use crate::common::builder::{ConfigBuilder, from_core, memory_reply};
use crate::common::harness::TestContext;

fn region_config() -> Config {
    ConfigBuilder::new().cores(4).policy("SingleCMPRegion").build()
}

/// A sharer's terminal answer to `snoop`.
fn ack(snoop: &Transport, kind: MessageKind) -> Transport {
    snoop.derive(MemoryMessage::new(kind, snoop.addr()), DestinationKind::Directory)
}

/// Runs a read from `core` that misses everywhere and is filled by memory.
fn read_from_memory(ctx: &mut TestContext, addr: u64, core: usize) {
    ctx.send_request(from_core(MessageKind::ReadReq, addr, core));
    let to_memory = ctx.next_snoop();
    assert_eq!(to_memory.dest().kind, DestinationKind::Memory);
    ctx.send_reply(memory_reply(&to_memory, MessageKind::MissReply));
    let reply = ctx.next_reply();
    assert_eq!(reply.kind(), MessageKind::MissReplyWritable);
    assert_eq!(reply.tracker.as_ref().and_then(|t| t.fill_level), Some(FillLevel::Memory));
    ctx.quiesce();
}

fn sharing_state(ctx: &TestContext, addr: u64) -> SharingState {
    let entry = ctx.ctrl.policy().directory().lookup(PhysAddr::new(addr));
    let sharers = entry.map(|e| e.sharers.count()).unwrap_or_default();
    match sharers {
        0 => SharingState::ZeroSharers,
        1 => SharingState::OneSharer,
        _ => SharingState::ManySharers,
    }
}

// ══════════════════════════════════════════════════════════
// 1. Transactions
// ══════════════════════════════════════════════════════════

#[test]
fn first_reader_is_filled_by_memory_without_an_ack() {
    let mut ctx = TestContext::new(&region_config());
    read_from_memory(&mut ctx, 0x1000, 1);

    assert_eq!(sharing_state(&ctx, 0x1000), SharingState::OneSharer);
    assert_eq!(ctx.ctrl.stats().actions_of(Action::ReplyAndRemoveMaf), 1);
    assert!(ctx.policy().maf().is_empty());
}

#[test]
fn second_reader_is_served_by_the_exclusive_owner() {
    let mut ctx = TestContext::new(&region_config());
    read_from_memory(&mut ctx, 0x2000, 1);

    ctx.send_request(from_core(MessageKind::ReadReq, 0x2000, 2));
    let snoop = ctx.next_snoop();
    assert_eq!(snoop.kind(), MessageKind::ReturnReq);
    assert_eq!(snoop.dest().source, Some(1));
    assert!(snoop.message.ack_required);

    ctx.send_reply(ack(&snoop, MessageKind::ReturnReply));
    let reply = ctx.next_reply();
    assert_eq!(reply.kind(), MessageKind::MissReply);
    assert_eq!(reply.requester(), Some(2));
    assert_eq!(reply.tracker.as_ref().and_then(|t| t.fill_level), Some(FillLevel::PeerCache));
    ctx.quiesce();
    assert_eq!(sharing_state(&ctx, 0x2000), SharingState::ManySharers);
}

#[test]
fn refused_snoop_falls_back_to_memory() {
    let mut ctx = TestContext::new(&region_config());
    read_from_memory(&mut ctx, 0x3000, 1);

    ctx.send_request(from_core(MessageKind::ReadReq, 0x3000, 2));
    let snoop = ctx.next_snoop();
    ctx.send_reply(ack(&snoop, MessageKind::FwdNAck));

    let to_memory = ctx.next_snoop();
    assert_eq!(to_memory.kind(), MessageKind::ReadReq);
    assert_eq!(to_memory.dest().kind, DestinationKind::Memory);
    assert_eq!(to_memory.requester(), Some(2));

    ctx.send_reply(memory_reply(&to_memory, MessageKind::MissReply));
    let reply = ctx.next_reply();
    assert_eq!(reply.kind(), MessageKind::MissReply);
    assert_eq!(reply.tracker.as_ref().and_then(|t| t.fill_level), Some(FillLevel::Memory));
    ctx.quiesce();

    let entry = ctx.policy().directory().lookup(PhysAddr::new(0x3000)).unwrap();
    assert!(!entry.sharers.is_sharer(1));
    assert!(entry.sharers.is_sharer(2));
}

// ══════════════════════════════════════════════════════════
// 2. Decision Table
// ══════════════════════════════════════════════════════════

#[test]
fn write_to_many_sharers_multicasts_invalidates() {
    let table = ProtocolTable::single_cmp_region(false);
    let row = table.lookup(SharingState::ManySharers, MessageKind::WriteReq);
    assert_eq!(row.snoop, Some(MessageKind::Invalidate));
    assert!(row.multicast);
    assert!(row.forward);
    assert!(row.is_terminal(MessageKind::InvalidateAck));
    assert!(!row.is_terminal(MessageKind::ReturnReply));
}

#[test]
fn clean_evicts_propagate_only_when_configured() {
    let quiet = ProtocolTable::single_cmp_region(false);
    let loud = ProtocolTable::single_cmp_region(true);
    let state = SharingState::OneSharer;
    assert!(!quiet.lookup(state, MessageKind::EvictClean).forward);
    assert!(loud.lookup(state, MessageKind::EvictClean).forward);
    assert!(quiet.lookup(state, MessageKind::EvictDirty).forward);
}

#[test]
#[should_panic(expected = "poison protocol action")]
fn poisoned_row_panics_on_lookup() {
    let table = ProtocolTable::single_cmp_region(false);
    let _ = table.lookup(SharingState::ZeroSharers, MessageKind::UpgradeReq);
}

#[test]
#[should_panic(expected = "no protocol action")]
fn missing_row_panics_on_lookup() {
    let table = ProtocolTable::single_cmp_region(false);
    let _ = table.lookup(SharingState::OneSharer, MessageKind::NonAllocatingStoreReq);
}

#[test]
#[should_panic(expected = "does not exist")]
fn evict_ack_without_a_buffered_line_panics() {
    let mut ctx = TestContext::new(&region_config());
    ctx.send_reply(from_core(MessageKind::EvictAck, 0x4000, 1));
    ctx.run(8);
}

#[test]
fn unknown_region_parameter_is_rejected() {
    let mut config = region_config();
    let _ = config
        .protocol
        .policy_params
        .insert("PropagateCE".to_owned(), "yes".to_owned());
    assert!(cohsim_core::DirectoryController::new(0, &config).is_err());

    let _ = config
        .protocol
        .policy_params
        .insert("PropagateCE".to_owned(), "true".to_owned());
    assert!(cohsim_core::DirectoryController::new(0, &config).is_ok());
}
