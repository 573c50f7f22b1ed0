//! Single-bank directory controller.
//!
//! A `DirectoryController` is one bank of the coherence directory. It owns three input
//! queues, three output queues, a protocol policy, and three timed pipelines. Each call to
//! [`DirectoryController::drive`] advances the bank by one cycle in four phases:
//! 1. **Admission:** Waking MAF entries, evict-buffer maintenance, replies, snoops,
//!    requests, and idle work are admitted in that priority order while the MAF pipeline
//!    has a free server and the record's whole resource demand can be reserved.
//! 2. **Policy:** Records leaving the MAF stage run their policy handler.
//! 3. **Release:** A per-kind action table returns every reservation the chosen action
//!    will not use.
//! 4. **Finalize:** Records leaving the tag stage (or the data stage when they touch the
//!    array) emit their messages into the slots they kept and retire or wake MAF entries.
//!
//! A record that cannot be admitted stays in its input queue; nothing is ever dropped.

use std::fmt;
use std::path::Path;

use tracing::{debug, trace, warn};

use crate::array::{self, CacheEvictBuffer};
use crate::common::{CheckpointError, ConfigError, NodeId, PhysAddr};
use crate::config::{Config, QueueConfig};
use crate::controller::BankMap;
use crate::controller::process::{Action, Demand, ProcessEntry, ProcessKind, Reservations};
use crate::directory::{self, CheckpointRecord, DirectoryGeometry, checkpoint};
use crate::maf::{MafState, MissAddressFile};
use crate::policy::{self, Policy, PolicyCore};
use crate::protocol::{MessageKind, Transport};
use crate::queues::{MessageQueue, PipelineFifo};
use crate::stats::ControllerStats;

/// The three message channels of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Requests from cores, and requests forwarded on.
    Request,
    /// Snoops, forwards, and memory-bound traffic.
    Snoop,
    /// Replies and acknowledgements.
    Reply,
}

impl Channel {
    /// Every channel, in the order ports are serviced.
    pub const ALL: [Self; 3] = [Self::Request, Self::Snoop, Self::Reply];
}

/// One queue per channel.
#[derive(Debug)]
pub struct PortSet {
    /// Request channel.
    pub request: MessageQueue<Transport>,
    /// Snoop channel.
    pub snoop: MessageQueue<Transport>,
    /// Reply channel.
    pub reply: MessageQueue<Transport>,
}

/// Output queues of a bank, whose slots are reserved at admission.
pub type OutputPorts = PortSet;

impl PortSet {
    /// Creates empty queues named `names` (request, snoop, reply) sized from `queues`.
    pub fn new(names: [&'static str; 3], queues: &QueueConfig) -> Self {
        let [request, snoop, reply] = names;
        Self {
            request: MessageQueue::new(request, queues.request_queue),
            snoop: MessageQueue::new(snoop, queues.snoop_queue),
            reply: MessageQueue::new(reply, queues.reply_queue),
        }
    }

    /// Queue of `channel`.
    pub const fn queue(&self, channel: Channel) -> &MessageQueue<Transport> {
        match channel {
            Channel::Request => &self.request,
            Channel::Snoop => &self.snoop,
            Channel::Reply => &self.reply,
        }
    }

    /// Queue of `channel`, mutably.
    pub const fn queue_mut(&mut self, channel: Channel) -> &mut MessageQueue<Transport> {
        match channel {
            Channel::Request => &mut self.request,
            Channel::Snoop => &mut self.snoop,
            Channel::Reply => &mut self.reply,
        }
    }

    /// True if every queue is empty and nothing is reserved.
    pub fn is_empty(&self) -> bool {
        Channel::ALL.into_iter().all(|ch| {
            let q = self.queue(ch);
            q.is_empty() && q.reserved() == 0
        })
    }

    /// Pushes `transport` into a slot held in `held`.
    ///
    /// # Panics
    ///
    /// Panics if `held` is zero: the record emits more than it reserved.
    fn emit(&mut self, channel: Channel, held: &mut usize, transport: Transport) {
        let queue = self.queue_mut(channel);
        assert!(
            *held > 0,
            "emit of {transport} into {} without a reserved slot",
            queue.name()
        );
        *held -= 1;
        queue.unreserve(1);
        queue.push(transport);
    }
}

/// Which reservations an action keeps past the release step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Retained {
    reply: bool,
    request: bool,
}

impl Retained {
    const NONE: Self = Self {
        reply: false,
        request: false,
    };
    const REPLY: Self = Self {
        reply: true,
        request: false,
    };
    const REQUEST: Self = Self {
        reply: false,
        request: true,
    };

    /// Release table: the outputs `action` uses for a record of `kind`, or `None` if the
    /// pair is not a legal policy decision.
    const fn of(kind: ProcessKind, action: Action) -> Option<Self> {
        use Action::{
            FwdAndReply, FwdAndWaitAck, FwdAndWakeEvictMaf, FwdRequest, Forward,
            ForwardAndRemoveMaf, NoAction, NotifyAndWaitAck, RemoveAndWakeMaf, RemoveMaf,
            Reply, ReplyAndRemoveMaf, Stall, WakeEvictMaf,
        };
        match kind {
            ProcessKind::Request | ProcessKind::WakeMaf => match action {
                FwdRequest => Some(Self::REQUEST),
                NotifyAndWaitAck | Reply | ReplyAndRemoveMaf | FwdAndReply => Some(Self::REPLY),
                FwdAndWaitAck | Stall | Forward | FwdAndWakeEvictMaf | WakeEvictMaf
                | NoAction | RemoveMaf => Some(Self::NONE),
                RemoveAndWakeMaf | ForwardAndRemoveMaf => None,
            },
            ProcessKind::Snoop => match action {
                Reply => Some(Self::REPLY),
                Forward | FwdAndWakeEvictMaf | WakeEvictMaf | NoAction | Stall => {
                    Some(Self::NONE)
                }
                _ => None,
            },
            ProcessKind::Reply => match action {
                Reply | ReplyAndRemoveMaf => Some(Self::REPLY),
                Forward | FwdAndWakeEvictMaf | ForwardAndRemoveMaf | RemoveAndWakeMaf
                | RemoveMaf | WakeEvictMaf | NoAction => Some(Self::NONE),
                _ => None,
            },
            ProcessKind::CacheEvict | ProcessKind::DirEvict => match action {
                Forward => Some(Self::NONE),
                _ => None,
            },
            ProcessKind::IdleWork => match action {
                Forward | NoAction => Some(Self::NONE),
                _ => None,
            },
        }
    }
}

/// One bank of the coherence directory.
pub struct DirectoryController {
    bank: NodeId,
    policy: Box<dyn Policy>,
    input: PortSet,
    output: OutputPorts,
    maf_pipeline: PipelineFifo<ProcessEntry>,
    tag_pipeline: PipelineFifo<ProcessEntry>,
    data_pipeline: PipelineFifo<ProcessEntry>,
    max_snoops: usize,
    /// Address interleaving when the directory is local; every admitted message must map
    /// to this bank.
    owned: Option<BankMap>,
    idle_work_scheduled: bool,
    stats: ControllerStats,
}

impl fmt::Debug for DirectoryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryController")
            .field("bank", &self.bank)
            .field("policy", &self.policy.name())
            .field("core", self.policy.core())
            .field("input", &self.input)
            .field("output", &self.output)
            .field("idle_work_scheduled", &self.idle_work_scheduled)
            .finish_non_exhaustive()
    }
}

impl DirectoryController {
    /// Builds bank `bank` from `config`.
    ///
    /// The directory, data array, and policy are resolved by name; the MAF groups
    /// requesters by `2^region_shift`-byte regions (by block when the shift is zero).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration fails validation or names an unknown
    /// policy, directory, array, or parameter.
    pub fn new(bank: NodeId, config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let topology = &config.topology;
        let protocol = &config.protocol;
        let resources = &config.resources;

        let geometry = DirectoryGeometry {
            cores: topology.cores,
            block_size: topology.block_size,
            banks: topology.banks,
            interleave: topology.interleave,
            eb_size: resources.dir_eb_size,
        };
        let directory = directory::create(&protocol.directory, &protocol.directory_params, geometry)?;
        let array = array::create(&protocol.array)?;

        let mut maf = MissAddressFile::new(resources.maf_size);
        let shift = protocol.region_shift;
        let block_size = topology.block_size;
        if shift > 0 {
            maf.set_region_fn(move |a: PhysAddr| PhysAddr::new(a.shr(shift) << shift));
        } else {
            maf.set_region_fn(move |a: PhysAddr| a.block(block_size));
        }

        let core = PolicyCore {
            bank,
            block_size,
            cores: topology.cores,
            evict_clean: protocol.evict_clean,
            maf,
            directory,
            cache_eb: CacheEvictBuffer::new(resources.cache_eb_size),
            array,
        };
        let policy = policy::create(&protocol.policy, &protocol.policy_params, core)?;
        Self::with_policy(bank, config, policy)
    }

    /// Builds bank `bank` around an already constructed policy.
    ///
    /// Pipeline timing, queue depths, and the snoop budget still come from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration fails validation.
    pub fn with_policy(
        bank: NodeId,
        config: &Config,
        policy: Box<dyn Policy>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let timing = &config.timing;
        let topology = &config.topology;
        let owned = if topology.local_directory {
            Some(BankMap::new(topology.banks, topology.interleave, topology.skew_shift)?)
        } else {
            None
        };
        debug!(bank, policy = policy.name(), "directory bank created");
        Ok(Self {
            bank,
            policy,
            input: PortSet::new(["request_in", "snoop_in", "reply_in"], &config.queues),
            output: PortSet::new(["request_out", "snoop_out", "reply_out"], &config.queues),
            maf_pipeline: PipelineFifo::new("maf", timing.maf.timing(timing.servers)),
            tag_pipeline: PipelineFifo::new("dir_tag", timing.dir.timing(timing.servers)),
            data_pipeline: PipelineFifo::new("data", timing.data.timing(timing.servers)),
            max_snoops: config.resources.max_snoops_per_request,
            owned,
            idle_work_scheduled: false,
            stats: ControllerStats::default(),
        })
    }

    /// Index of this bank.
    #[inline]
    pub const fn bank(&self) -> NodeId {
        self.bank
    }

    /// The protocol policy.
    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    /// The protocol policy, mutably.
    pub fn policy_mut(&mut self) -> &mut dyn Policy {
        self.policy.as_mut()
    }

    /// Input queues.
    pub const fn input(&self) -> &PortSet {
        &self.input
    }

    /// Input queues, mutably. Producers check `has_space` before pushing.
    pub const fn input_mut(&mut self) -> &mut PortSet {
        &mut self.input
    }

    /// Output queues.
    pub const fn output(&self) -> &OutputPorts {
        &self.output
    }

    /// Output queues, mutably. Consumers pop emitted messages from here.
    pub const fn output_mut(&mut self) -> &mut OutputPorts {
        &mut self.output
    }

    /// Counters collected so far.
    pub const fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Advances the bank by one cycle.
    pub fn drive(&mut self, now: u64) {
        self.schedule_new_processes(now);
        self.advance_maf_pipeline(now);
        self.advance_pipeline(now);
        self.stats.cycles = self.stats.cycles.max(now + 1);
    }

    /// True if no work is queued, in flight, or tracked.
    pub fn is_quiesced(&self) -> bool {
        self.maf_pipeline.is_empty()
            && self.tag_pipeline.is_empty()
            && self.data_pipeline.is_empty()
            && self.input.is_empty()
            && self.output.is_empty()
            && !self.idle_work_scheduled
            && self.policy.is_quiesced()
    }

    /// Writes this bank's directory to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the file cannot be written.
    pub fn save_state(&self, path: &Path) -> Result<(), CheckpointError> {
        checkpoint::save(path, &self.policy.save_checkpoint())
    }

    /// Replaces this bank's directory with the records in `path` that map to it.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the file cannot be read or a record does not fit.
    pub fn load_state(&mut self, path: &Path, bank_map: &BankMap) -> Result<usize, CheckpointError> {
        let records = checkpoint::load(path)?;
        self.restore(&records, bank_map)
    }

    /// Exports this bank's directory records.
    pub fn checkpoint_records(&self) -> Vec<CheckpointRecord> {
        self.policy.save_checkpoint()
    }

    /// Replaces this bank's directory with the records that map to it.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if a record does not fit.
    pub fn restore(
        &mut self,
        records: &[CheckpointRecord],
        bank_map: &BankMap,
    ) -> Result<usize, CheckpointError> {
        let loaded = self.policy.load_checkpoint(records, bank_map, self.bank)?;
        debug!(bank = self.bank, loaded, "directory restored");
        Ok(loaded)
    }

    fn schedule_new_processes(&mut self, now: u64) {
        self.schedule_waking(now);
        self.schedule_cache_evicts(now);
        self.schedule_dir_evicts(now);
        self.schedule_replies(now);
        self.schedule_snoops(now);
        self.schedule_requests(now);
        self.schedule_idle_work(now);
    }

    fn acquire(&mut self, demand: Demand) -> Option<Reservations> {
        Reservations::acquire(demand, &mut self.output, self.policy.as_mut())
    }

    fn admit(&mut self, process: ProcessEntry, now: u64) {
        let external = matches!(
            process.kind,
            ProcessKind::Request | ProcessKind::Snoop | ProcessKind::Reply
        );
        if let Some(map) = self.owned.as_ref().filter(|_| external) {
            let home = map.bank_of(process.addr());
            assert_eq!(
                home,
                self.bank,
                "bank {}: {} routed here but {} belongs to bank {home}",
                self.bank,
                process.transport,
                process.addr()
            );
        }
        trace!(
            bank = self.bank,
            addr = %process.addr(),
            kind = ?process.kind,
            message = %process.transport,
            "admitted"
        );
        self.stats.record_process(process.kind);
        self.maf_pipeline.enqueue(process, now, 1);
    }

    fn schedule_waking(&mut self, now: u64) {
        while self.maf_pipeline.server_avail(now) {
            let Some(eb) = self
                .policy
                .maf()
                .peek_waking()
                .map(|e| self.policy.eb_requirements(&e.transport))
            else {
                break;
            };
            let demand = Demand {
                snoop_out: self.max_snoops,
                reply_out: 1,
                request_out: 1,
                eb,
                ..Demand::default()
            };
            let Some(reservations) = self.acquire(demand) else {
                self.stats.stalls.waking += 1;
                warn!(bank = self.bank, "cannot schedule waking MAF entry");
                break;
            };
            let Some(id) = self.policy.maf_mut().take_waking() else {
                panic!("bank {}: waking MAF entry vanished during admission", self.bank);
            };
            let transport = self.policy.maf().entry(id).transport.clone();
            self.admit(ProcessEntry::for_maf(id, transport, reservations), now);
        }
    }

    fn schedule_cache_evicts(&mut self, now: u64) {
        while self.maf_pipeline.server_avail(now)
            && !self.idle_work_scheduled
            && !self.policy.free_cache_eb_pending()
            && self.policy.cache_eb().evictable_ready()
        {
            let demand = Demand {
                snoop_out: 1,
                ..Demand::default()
            };
            let Some(reservations) = self.acquire(demand) else {
                warn!(bank = self.bank, "cache EB full but write-back cannot be scheduled");
                break;
            };
            let transport = self.policy.cache_evict_transport();
            self.admit(
                ProcessEntry::new(ProcessKind::CacheEvict, transport, reservations),
                now,
            );
        }
    }

    fn schedule_dir_evicts(&mut self, now: u64) {
        while self.maf_pipeline.server_avail(now)
            && !self.idle_work_scheduled
            && !self.policy.free_dir_eb_pending()
            && self.policy.directory().idle_work_ready()
            && self.policy.cache_eb_has_space(1)
        {
            let demand = Demand {
                snoop_out: 1,
                cache_eb: 1,
                ..Demand::default()
            };
            let Some(reservations) = self.acquire(demand) else {
                warn!(bank = self.bank, "directory EB full but back-invalidate cannot be scheduled");
                break;
            };
            let transport = self.policy.dir_evict_transport();
            self.admit(
                ProcessEntry::new(ProcessKind::DirEvict, transport, reservations),
                now,
            );
        }
    }

    fn schedule_replies(&mut self, now: u64) {
        while self.maf_pipeline.server_avail(now) && !self.input.reply.is_empty() {
            let demand = Demand {
                snoop_out: 1,
                reply_out: 1,
                ..Demand::default()
            };
            let Some(reservations) = self.acquire(demand) else {
                self.stats.stalls.reply += 1;
                warn!(bank = self.bank, "reply stalled on output space");
                break;
            };
            let Some(transport) = self.input.reply.pop() else {
                break;
            };
            self.admit(
                ProcessEntry::new(ProcessKind::Reply, transport, reservations),
                now,
            );
        }
    }

    fn schedule_snoops(&mut self, now: u64) {
        while self.maf_pipeline.server_avail(now) && !self.input.snoop.is_empty() {
            let demand = Demand {
                snoop_out: 2,
                reply_out: 1,
                maf: true,
                ..Demand::default()
            };
            let Some(reservations) = self.acquire(demand) else {
                self.stats.stalls.snoop += 1;
                warn!(bank = self.bank, "snoop stalled on output or MAF space");
                break;
            };
            let Some(transport) = self.input.snoop.pop() else {
                break;
            };
            self.admit(
                ProcessEntry::new(ProcessKind::Snoop, transport, reservations),
                now,
            );
        }
    }

    fn schedule_requests(&mut self, now: u64) {
        while self.maf_pipeline.server_avail(now) {
            let Some(eb) = self
                .input
                .request
                .peek()
                .map(|t| self.policy.eb_requirements(t))
            else {
                break;
            };
            let demand = Demand {
                snoop_out: self.max_snoops,
                reply_out: 1,
                request_out: 1,
                maf: true,
                eb,
                ..Demand::default()
            };
            let Some(reservations) = self.acquire(demand) else {
                self.stats.stalls.request += 1;
                if let Some(head) = self.input.request.peek() {
                    warn!(
                        bank = self.bank,
                        addr = %head.addr(),
                        kind = %head.kind(),
                        "request stalled on output, MAF, or EB space"
                    );
                }
                break;
            };
            let Some(transport) = self.input.request.pop() else {
                break;
            };
            self.admit(
                ProcessEntry::new(ProcessKind::Request, transport, reservations),
                now,
            );
        }
    }

    fn schedule_idle_work(&mut self, now: u64) {
        if !self.maf_pipeline.server_avail(now)
            || self.idle_work_scheduled
            || !self.policy.has_idle_work_available()
            || !self.policy.cache_eb_has_space(1)
        {
            return;
        }
        let demand = Demand {
            snoop_out: 1,
            cache_eb: 1,
            ..Demand::default()
        };
        let Some(reservations) = self.acquire(demand) else {
            self.stats.stalls.idle += 1;
            return;
        };
        let transport = self.policy.idle_work_transport();
        self.idle_work_scheduled = true;
        self.admit(
            ProcessEntry::new(ProcessKind::IdleWork, transport, reservations),
            now,
        );
    }

    fn advance_maf_pipeline(&mut self, now: u64) {
        while self.maf_pipeline.ready(now) && self.tag_pipeline.server_avail(now) {
            let Some(mut process) = self.maf_pipeline.dequeue() else {
                break;
            };
            self.run_policy(&mut process);
            self.stats.record_action(process.action);
            let behind_request = process.action == Action::Stall
                && process
                    .maf
                    .is_some_and(|id| self.policy.maf().entry(id).state == MafState::WaitingForRequest);
            if behind_request {
                self.stats.maf_hits += 1;
            }
            debug!(
                bank = self.bank,
                addr = %process.addr(),
                kind = ?process.kind,
                action = %process.action,
                "policy decision"
            );
            self.release_unused(&mut process);

            if process.lookups > 0 {
                let lookups = process.lookups;
                self.tag_pipeline.enqueue(process, now, lookups);
            } else {
                self.finalize(&mut process);
            }
        }
    }

    fn run_policy(&mut self, process: &mut ProcessEntry) {
        let policy = self.policy.as_mut();
        match process.kind {
            ProcessKind::WakeMaf => policy.handle_wake_maf(process),
            ProcessKind::CacheEvict => policy.handle_cache_evict(process),
            ProcessKind::DirEvict => policy.handle_dir_evict(process),
            ProcessKind::Reply => policy.handle_reply(process),
            ProcessKind::Snoop => policy.handle_snoop(process),
            ProcessKind::Request => policy.handle_request(process),
            ProcessKind::IdleWork => {
                self.idle_work_scheduled = false;
                policy.handle_idle_work(process);
            }
        }
    }

    /// Returns every reservation the record's action will not use.
    ///
    /// Evict-buffer slots and an unused MAF token are always returned; snoop slots are
    /// trimmed to the snoops actually queued.
    fn release_unused(&mut self, process: &mut ProcessEntry) {
        let Some(keep) = Retained::of(process.kind, process.action) else {
            panic!(
                "bank {}: action {} is not valid for a {:?} record: {process}",
                self.bank, process.action, process.kind
            );
        };
        assert_eq!(
            keep.reply,
            process.reply.is_some(),
            "bank {}: {process} reply does not match action {}",
            self.bank,
            process.action
        );

        if process.kind == ProcessKind::WakeMaf && process.action == Action::RemoveMaf {
            let entry = self.policy.maf_mut().remove(process.maf_id());
            trace!(bank = self.bank, addr = %entry.addr, "woken entry retired");
            process.action = Action::NoAction;
        }

        let res = &mut process.reservations;
        let snoops = process.snoops.len();
        assert!(
            snoops <= res.snoop_out,
            "bank {}: {} queues {snoops} snoops with {} reserved",
            self.bank,
            process.transport,
            res.snoop_out
        );
        self.output.snoop.unreserve(res.snoop_out - snoops);
        res.snoop_out = snoops;
        if !keep.reply {
            self.output.reply.unreserve(res.reply_out);
            res.reply_out = 0;
        }
        if !keep.request {
            self.output.request.unreserve(res.request_out);
            res.request_out = 0;
        }
        if let Some(token) = res.maf.take() {
            self.policy.maf_mut().unreserve(token);
        }
        self.policy.unreserve_eb(res.dir_eb, res.cache_eb);
        res.dir_eb = 0;
        res.cache_eb = 0;
    }

    fn advance_pipeline(&mut self, now: u64) {
        while self.tag_pipeline.ready(now) {
            let needs_data = self.tag_pipeline.peek().is_some_and(|p| p.requires_data);
            if needs_data && !self.data_pipeline.server_avail(now) {
                self.tag_pipeline.stall();
                break;
            }
            let Some(mut process) = self.tag_pipeline.dequeue() else {
                break;
            };
            if !needs_data {
                self.finalize(&mut process);
                continue;
            }
            if process.transmit_after_tag {
                self.finalize(&mut process);
            }
            self.data_pipeline.enqueue(process, now, 1);
        }

        while self.data_pipeline.ready(now) {
            let Some(mut process) = self.data_pipeline.dequeue() else {
                break;
            };
            if !process.transmit_after_tag {
                self.finalize(&mut process);
            }
        }
    }

    fn send_snoops(&mut self, process: &mut ProcessEntry) {
        for snoop in std::mem::take(&mut process.snoops) {
            match snoop.kind() {
                MessageKind::BackInvalidate => self.stats.back_invalidations += 1,
                kind if kind.is_evict() => self.stats.evicts_forwarded += 1,
                _ => {}
            }
            trace!(bank = self.bank, message = %snoop, "snoop out");
            self.output
                .emit(Channel::Snoop, &mut process.reservations.snoop_out, snoop);
        }
    }

    fn send_reply(&mut self, process: &mut ProcessEntry) {
        let Some(reply) = process.reply.take() else {
            panic!("bank {}: {process} has no reply to send", self.bank);
        };
        trace!(bank = self.bank, message = %reply, "reply out");
        self.output
            .emit(Channel::Reply, &mut process.reservations.reply_out, reply);
    }

    fn retire_maf(&mut self, process: &ProcessEntry, wake: bool) {
        let entry = self.policy.maf_mut().remove(process.maf_id());
        debug!(bank = self.bank, addr = %entry.addr, wake, "MAF entry retired");
        if wake {
            self.policy.wake_mafs(entry.addr);
        }
    }

    /// Emits the record's messages and applies its MAF side effects.
    fn finalize(&mut self, process: &mut ProcessEntry) {
        match process.action {
            Action::FwdAndWaitAck | Action::Forward => {
                assert!(
                    !process.snoops.is_empty(),
                    "bank {}: {process} forwards nothing",
                    self.bank
                );
                self.send_snoops(process);
            }
            Action::FwdRequest => {
                let request = process.transport.clone();
                self.output
                    .emit(Channel::Request, &mut process.reservations.request_out, request);
            }
            Action::NotifyAndWaitAck | Action::FwdAndReply | Action::Reply => {
                self.send_snoops(process);
                self.send_reply(process);
            }
            Action::FwdAndWakeEvictMaf => {
                self.send_snoops(process);
                self.policy.maf_mut().wake_after_evict(process.maf_id());
            }
            Action::WakeEvictMaf => self.policy.maf_mut().wake_after_evict(process.maf_id()),
            Action::ForwardAndRemoveMaf => {
                self.send_snoops(process);
                self.retire_maf(process, true);
            }
            Action::ReplyAndRemoveMaf => {
                self.send_snoops(process);
                self.send_reply(process);
                self.retire_maf(process, true);
            }
            Action::RemoveMaf => self.retire_maf(process, false),
            Action::RemoveAndWakeMaf => self.retire_maf(process, true),
            Action::Stall | Action::NoAction => {}
        }

        assert!(
            process.snoops.is_empty() && process.reply.is_none(),
            "bank {}: {process} finalized with unsent messages",
            self.bank
        );
        assert!(
            process.reservations.is_clear(),
            "bank {}: {process} finalized holding {:?}",
            self.bank,
            process.reservations
        );
    }
}
