//! Fluent builders for test configurations and messages.

use cohsim_core::Config;
use cohsim_core::common::{NodeId, PhysAddr};
use cohsim_core::protocol::{DestinationKind, MemoryMessage, MessageKind, Transport};

/// Builds a [`Config`] from the defaults, one knob at a time.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn banks(mut self, banks: usize) -> Self {
        self.config.topology.banks = banks;
        self
    }

    pub fn local_directory(mut self, local: bool) -> Self {
        self.config.topology.local_directory = local;
        self
    }

    pub fn cores(mut self, cores: usize) -> Self {
        self.config.topology.cores = cores;
        self
    }

    pub fn request_queue(mut self, size: usize) -> Self {
        self.config.queues.request_queue = size;
        self
    }

    pub fn maf_size(mut self, size: usize) -> Self {
        self.config.resources.maf_size = size;
        self
    }

    pub fn dir_eb_size(mut self, size: usize) -> Self {
        self.config.resources.dir_eb_size = size;
        self
    }

    pub fn cache_eb_size(mut self, size: usize) -> Self {
        self.config.resources.cache_eb_size = size;
        self
    }

    pub fn policy(mut self, name: &str) -> Self {
        self.config.protocol.policy = name.to_owned();
        self
    }

    /// Selects a set-associative directory of `sets` x `assoc` ways.
    pub fn standard_directory(mut self, sets: usize, assoc: usize) -> Self {
        self.config.protocol.directory = "Standard".to_owned();
        let params = &mut self.config.protocol.directory_params;
        let _ = params.insert("sets".to_owned(), sets.to_string());
        let _ = params.insert("assoc".to_owned(), assoc.to_string());
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// A message sent by `core` to the directory of bank 0.
pub fn from_core(kind: MessageKind, addr: u64, core: NodeId) -> Transport {
    let mut t = Transport::from_core(kind, PhysAddr::new(addr), core);
    t.dest_mut().directory = Some(0);
    t
}

/// The memory controller's answer to a request the bank forwarded to memory.
pub fn memory_reply(to_memory: &Transport, kind: MessageKind) -> Transport {
    let data = MemoryMessage::new(kind, to_memory.addr()).with_size(64);
    to_memory.derive(data, DestinationKind::Directory)
}

/// An invalidation ack from `core`, as the directory sees it after a back-invalidate.
pub fn invalidate_ack(addr: u64, core: NodeId) -> Transport {
    let mut t = from_core(MessageKind::InvalidateAck, addr, core);
    t.dest_mut().other = Some(core);
    t
}
