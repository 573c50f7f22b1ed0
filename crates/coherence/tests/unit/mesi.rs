//! # MESI Controller Flow Tests
//!
//! End-to-end transactions through one directory bank running `NonInclusiveMESI`:
//! memory fills, forwards, invalidations, back-invalidation of directory victims, and
//! admission under exhausted resources.

use cohsim_core::array::LineState;
use cohsim_core::common::PhysAddr;
use cohsim_core::controller::{Action, ProcessKind};
use cohsim_core::maf::MafState;
use cohsim_core::policy::{NonInclusiveMesi, Policy};
use cohsim_core::protocol::{DestinationKind, FillLevel, MessageKind};
use cohsim_core::state::SharerSet;
use cohsim_core::Config;

use crate::common::builder::{ConfigBuilder, from_core, invalidate_ack, memory_reply};
use crate::common::harness::{MAX_CYCLES, TestContext};
use crate::common::mocks::{MockArray, core_with_array, quiet_array};

fn sharers(cores: &[usize]) -> SharerSet {
    let mut s = SharerSet::new(4);
    for &c in cores {
        s.add_sharer(c);
    }
    s
}

/// Installs a directory entry as if earlier transactions had built it.
fn preload(ctx: &mut TestContext, addr: u64, cores: &[usize]) {
    let directory = &mut ctx.ctrl.policy_mut().core_mut().directory;
    assert!(directory.allocate(PhysAddr::new(addr), sharers(cores)));
}

/// State of the MAF entry `requester` holds for `addr`.
fn maf_state(ctx: &TestContext, addr: u64, requester: usize) -> Option<MafState> {
    ctx.policy()
        .maf()
        .iter()
        .find(|e| e.addr == PhysAddr::new(addr) && e.requester() == Some(requester))
        .map(|e| e.state)
}

/// Asserts that nothing is left reserved anywhere in the bank.
fn assert_nothing_reserved(ctx: &TestContext) {
    let policy = ctx.policy();
    assert_eq!(policy.maf().reserved(), 0);
    assert_eq!(policy.directory().evict_buffer().reserved(), 0);
    assert_eq!(policy.cache_eb().reserved(), 0);
    let out = ctx.ctrl.output();
    assert_eq!(
        (out.request.reserved(), out.snoop.reserved(), out.reply.reserved()),
        (0, 0, 0)
    );
}

// ══════════════════════════════════════════════════════════
// 1. Memory Fills
// ══════════════════════════════════════════════════════════

#[test]
fn read_miss_fills_from_memory_and_records_the_sharer() {
    let mut ctx = TestContext::new(&ConfigBuilder::new().cores(4).build());
    ctx.send_request(from_core(MessageKind::ReadReq, 0x1000, 1));

    let to_memory = ctx.next_snoop();
    assert_eq!(to_memory.kind(), MessageKind::ReadReq);
    assert_eq!(to_memory.dest().kind, DestinationKind::Memory);
    assert!(ctx.policy().directory().lookup(PhysAddr::new(0x1000)).unwrap().is_protected());

    ctx.send_reply(memory_reply(&to_memory, MessageKind::MissReply));
    let reply = ctx.next_reply();
    assert_eq!(reply.kind(), MessageKind::MissReply);
    assert_eq!(reply.requester(), Some(1));

    ctx.send_reply(from_core(MessageKind::ReadAck, 0x1000, 1));
    ctx.quiesce();

    let entry = ctx.policy().directory().lookup(PhysAddr::new(0x1000)).unwrap();
    assert_eq!(entry.sharers, sharers(&[1]));
    assert!(!entry.is_protected());
    assert_nothing_reserved(&ctx);
    assert_eq!(ctx.ctrl.stats().actions_of(Action::RemoveAndWakeMaf), 1);
}

#[test]
fn write_miss_notifies_the_requester() {
    let mut ctx = TestContext::new(&ConfigBuilder::new().cores(4).build());
    ctx.send_request(from_core(MessageKind::WriteReq, 0x2000, 3));

    let to_memory = ctx.next_snoop();
    assert_eq!(to_memory.kind(), MessageKind::WriteReq);
    let notify = ctx.next_reply();
    assert_eq!(notify.kind(), MessageKind::MissNotify);
    assert_eq!(notify.message.outstanding, 1);

    ctx.send_reply(from_core(MessageKind::WriteAck, 0x2000, 3));
    ctx.quiesce();
    let entry = ctx.policy().directory().lookup(PhysAddr::new(0x2000)).unwrap();
    assert_eq!(entry.sharers, sharers(&[3]));
    assert_nothing_reserved(&ctx);
}

// ══════════════════════════════════════════════════════════
// 2. On-Chip Sharers
// ══════════════════════════════════════════════════════════

#[test]
fn read_of_a_privately_held_block_is_forwarded_to_its_owner() {
    let mut ctx = TestContext::new(&ConfigBuilder::new().cores(4).build());
    preload(&mut ctx, 0x3000, &[2]);
    ctx.send_request(from_core(MessageKind::ReadReq, 0x3000, 1));

    let fwd = ctx.next_snoop();
    assert_eq!(fwd.kind(), MessageKind::ReadFwd);
    assert_eq!(fwd.dest().kind, DestinationKind::Source);
    assert_eq!(fwd.dest().source, Some(2));
    assert!(fwd.message.ack_required);

    ctx.send_reply(from_core(MessageKind::ReadAck, 0x3000, 1));
    ctx.quiesce();
    let entry = ctx.policy().directory().lookup(PhysAddr::new(0x3000)).unwrap();
    assert_eq!(entry.sharers, sharers(&[1, 2]));
}

#[test]
fn write_to_a_shared_block_forwards_and_invalidates() {
    let mut ctx = TestContext::new(&ConfigBuilder::new().cores(4).build());
    preload(&mut ctx, 0x4000, &[0, 1]);
    ctx.send_request(from_core(MessageKind::WriteReq, 0x4000, 2));

    ctx.run_until(|c| c.output().snoop.len() == 2);
    let fwd = ctx.ctrl.output_mut().snoop.pop().unwrap();
    let inv = ctx.ctrl.output_mut().snoop.pop().unwrap();
    assert_eq!(fwd.kind(), MessageKind::WriteFwd);
    assert_eq!(fwd.dest().source, Some(0));
    assert_eq!(inv.kind(), MessageKind::Invalidate);
    assert_eq!(inv.dest().multicast, vec![1]);

    let notify = ctx.next_reply();
    assert_eq!(notify.kind(), MessageKind::MissNotify);
    assert_eq!(notify.message.outstanding, 2);

    ctx.send_reply(from_core(MessageKind::WriteAck, 0x4000, 2));
    ctx.quiesce();
    let entry = ctx.policy().directory().lookup(PhysAddr::new(0x4000)).unwrap();
    assert_eq!(entry.sharers, sharers(&[2]));
    assert_nothing_reserved(&ctx);
}

// ══════════════════════════════════════════════════════════
// 3. Directory Victims
// ══════════════════════════════════════════════════════════

/// One set, one way, one evict-buffer slot: block B displaces A, whose three sharers
/// must all acknowledge a back-invalidate before the slot can take another victim.
#[test]
fn three_sharer_victim_is_back_invalidated_before_its_slot_is_reused() {
    let config = ConfigBuilder::new()
        .cores(4)
        .standard_directory(1, 1)
        .dir_eb_size(1)
        .build();
    let mut ctx = TestContext::new(&config);
    let (a, b, c) = (0x000, 0x040, 0x080);
    preload(&mut ctx, a, &[0, 1, 2]);

    ctx.send_request(from_core(MessageKind::ReadReq, b, 3));
    ctx.run_until(|c| c.output().snoop.len() == 2);
    let snoops: Vec<_> = (0..2)
        .filter_map(|_| ctx.ctrl.output_mut().snoop.pop())
        .collect();
    let to_memory = snoops.iter().find(|t| t.kind() == MessageKind::ReadReq).unwrap();
    let back_inv = snoops
        .iter()
        .find(|t| t.kind() == MessageKind::BackInvalidate)
        .unwrap();
    assert_eq!(back_inv.addr(), PhysAddr::new(a));
    assert_eq!(back_inv.dest().kind, DestinationKind::Multicast);
    assert_eq!(back_inv.dest().multicast, vec![0, 1, 2]);
    assert_eq!(ctx.ctrl.stats().back_invalidations, 1);
    assert_eq!(ctx.ctrl.stats().processes_of(ProcessKind::DirEvict), 1);

    let buffered = ctx.policy().directory().evict_buffer().find(PhysAddr::new(a)).unwrap();
    assert_eq!(buffered.invalidates_pending(), 3);

    // Finish B so its way can be chosen as the next victim.
    ctx.send_reply(memory_reply(to_memory, MessageKind::MissReply));
    let _ = ctx.next_reply();
    ctx.send_reply(from_core(MessageKind::ReadAck, b, 3));
    ctx.run_until(|c| c.policy().maf().is_empty());

    // B has a sharer and A still occupies the only evict-buffer slot.
    let directory = &mut ctx.ctrl.policy_mut().core_mut().directory;
    assert!(!directory.allocate(PhysAddr::new(c), SharerSet::new(4)));

    for core in 0..3 {
        ctx.send_reply(invalidate_ack(a, core));
    }
    ctx.quiesce();
    assert!(ctx.policy().directory().evict_buffer().is_empty());
    assert_nothing_reserved(&ctx);

    let directory = &mut ctx.ctrl.policy_mut().core_mut().directory;
    assert!(directory.allocate(PhysAddr::new(c), SharerSet::new(4)));
    assert!(directory.evict_buffer().find(PhysAddr::new(b)).is_some());
}

// ══════════════════════════════════════════════════════════
// 4. Exhausted Resources
// ══════════════════════════════════════════════════════════

/// With a one-entry MAF, a second request for the same block waits in its input queue
/// and is admitted once the first transaction retires.
#[test]
fn full_maf_holds_the_next_request_until_the_first_retires() {
    let config = ConfigBuilder::new().cores(4).maf_size(1).build();
    let mut ctx = TestContext::new(&config);
    ctx.send_request(from_core(MessageKind::ReadReq, 0x5000, 1));
    ctx.send_request(from_core(MessageKind::ReadReq, 0x5000, 2));

    let to_memory = ctx.next_snoop();
    assert_eq!(to_memory.requester(), Some(1));
    assert_eq!(ctx.ctrl.input().request.len(), 1);
    assert_eq!(ctx.policy().maf().len(), 1);
    assert!(ctx.ctrl.stats().stalls.request > 0);

    ctx.send_reply(memory_reply(&to_memory, MessageKind::MissReplyWritable));
    let _ = ctx.next_reply();
    ctx.send_reply(from_core(MessageKind::ReadAck, 0x5000, 1));

    let fwd = ctx.next_snoop();
    assert!(ctx.ctrl.input().request.is_empty());
    assert_eq!(fwd.kind(), MessageKind::ReadFwd);
    assert_eq!(fwd.requester(), Some(2));
    assert_eq!(fwd.dest().source, Some(1));
    assert_eq!(ctx.ctrl.stats().processes_of(ProcessKind::Request), 2);
}

#[test]
fn array_without_eviction_resources_blocks_admission() {
    let mut array = MockArray::new();
    let _ = array.expect_eviction_pressure().return_const(false);
    let _ = array.expect_eviction_resources_available().return_const(false);
    let policy = Box::new(NonInclusiveMesi::new(core_with_array(array)));
    let mut ctx = TestContext::with_policy(&Config::default(), policy);

    ctx.send_request(from_core(MessageKind::ReadReq, 0x6000, 1));
    ctx.run(5);
    assert_eq!(ctx.ctrl.input().request.len(), 1);
    assert_eq!(ctx.ctrl.stats().processes_of(ProcessKind::Request), 0);
    assert_eq!(ctx.ctrl.stats().stalls.request, 5);
    assert!(ctx.policy().maf().is_empty());
}

// ══════════════════════════════════════════════════════════
// 5. Same-Address Ordering
// ══════════════════════════════════════════════════════════

/// A read behind an outstanding write stays parked until the write's ack retires it,
/// is woken in that same cycle, and claims the next admission slot ahead of a newer
/// request.
#[test]
fn parked_request_is_woken_by_the_retiring_owner_and_served_first() {
    let config = ConfigBuilder::new().cores(4).maf_size(4).build();
    let mut ctx = TestContext::new(&config);
    let (x, y) = (0x5000, 0x9000);
    ctx.send_request(from_core(MessageKind::WriteReq, x, 1));
    ctx.send_request(from_core(MessageKind::ReadReq, x, 2));

    let to_memory = ctx.next_snoop();
    assert_eq!(to_memory.requester(), Some(1));
    let notify = ctx.next_reply();
    assert_eq!(notify.kind(), MessageKind::MissNotify);
    ctx.run_until(|c| c.stats().maf_hits == 1);

    for _ in 0..8 {
        ctx.step();
        assert_eq!(maf_state(&ctx, x, 1), Some(MafState::WaitingForAck));
        assert_eq!(maf_state(&ctx, x, 2), Some(MafState::WaitingForRequest));
    }

    ctx.send_reply(from_core(MessageKind::WriteAck, x, 1));
    let mut retired = false;
    for _ in 0..MAX_CYCLES {
        ctx.step();
        if maf_state(&ctx, x, 1).is_none() {
            retired = true;
            break;
        }
        assert_eq!(maf_state(&ctx, x, 2), Some(MafState::WaitingForRequest));
    }
    assert!(retired, "write never retired");
    assert_eq!(maf_state(&ctx, x, 2), Some(MafState::Waking));

    // A newer request arrives as the woken read is about to be scheduled.
    ctx.send_request(from_core(MessageKind::ReadReq, y, 3));
    ctx.step();
    let woken = maf_state(&ctx, x, 2);
    assert!(
        !matches!(woken, Some(MafState::Waking | MafState::WaitingForRequest)),
        "woken read not scheduled: {woken:?}"
    );
    assert_eq!(ctx.ctrl.input().request.len(), 1);

    let fwd = ctx.next_snoop();
    assert_eq!(fwd.kind(), MessageKind::ReadFwd);
    assert_eq!(fwd.requester(), Some(2));
    assert_eq!(fwd.dest().source, Some(1));
    let newer = ctx.next_snoop();
    assert_eq!(newer.requester(), Some(3));
    assert_eq!(newer.dest().kind, DestinationKind::Memory);
    assert_eq!(ctx.ctrl.stats().maf_hits, 1);
}

/// A request parked for a free directory way is not a same-address MAF hit.
#[test]
fn set_conflict_stall_is_not_counted_as_a_maf_hit() {
    let config = ConfigBuilder::new().cores(4).standard_directory(1, 1).build();
    let mut ctx = TestContext::new(&config);
    ctx.send_request(from_core(MessageKind::ReadReq, 0x000, 1));
    ctx.send_request(from_core(MessageKind::ReadReq, 0x040, 2));

    ctx.run_until(|c| c.stats().actions_of(Action::Stall) == 1);
    assert_eq!(maf_state(&ctx, 0x040, 2), Some(MafState::WaitingForSet));
    assert_eq!(ctx.ctrl.stats().maf_hits, 0);
}

#[test]
#[should_panic(expected = "without a pending write-back")]
fn evict_ack_for_an_unbuffered_line_panics() {
    let mut ctx = TestContext::new(&ConfigBuilder::new().cores(4).build());
    ctx.send_reply(from_core(MessageKind::EvictAck, 0x8000, 1));
    ctx.run(8);
}

// ══════════════════════════════════════════════════════════
// 6. Data Array Hits
// ══════════════════════════════════════════════════════════

#[test]
fn read_hit_in_the_array_is_answered_from_the_bank() {
    let addr = PhysAddr::new(0x7000);
    let mut array = quiet_array();
    let _ = array
        .expect_state()
        .withf(move |a| *a == addr)
        .return_const(LineState::Exclusive);
    let _ = array.expect_record_access().times(1).return_const(());
    let policy = Box::new(NonInclusiveMesi::new(core_with_array(array)));
    let mut ctx = TestContext::with_policy(&Config::default(), policy);

    ctx.send_request(from_core(MessageKind::ReadReq, 0x7000, 2));
    let reply = ctx.next_reply();
    assert_eq!(reply.kind(), MessageKind::MissReplyWritable);
    assert_eq!(reply.tracker.as_ref().and_then(|t| t.fill_level), Some(FillLevel::Array));
    assert!(ctx.ctrl.output().snoop.is_empty());

    ctx.send_reply(from_core(MessageKind::ReadAck, 0x7000, 2));
    ctx.quiesce();
    let entry = ctx.policy().directory().lookup(addr).unwrap();
    assert_eq!(entry.sharers, sharers(&[2]));
}
