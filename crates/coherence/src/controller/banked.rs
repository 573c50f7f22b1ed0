//! Multi-bank directory front end.
//!
//! A `BankedController` presents N external ports and owns N directory banks. Each
//! cycle it:
//! 1. **Routes In:** Moves at most one message per port and channel into the owning
//!    bank's input queue.
//! 2. **Drives Banks:** Advances every bank by one cycle, in index order.
//! 3. **Routes Out:** Moves at most one message per bank and channel to an output port.
//!
//! Both routing passes start from a rotating index so that no port or bank is starved;
//! the index advances after every pass that moved something.

use std::path::Path;

use tracing::debug;

use crate::common::{CheckpointError, ConfigError, NodeId};
use crate::config::Config;
use crate::controller::BankMap;
use crate::controller::directory_controller::{Channel, DirectoryController, PortSet};
use crate::directory::checkpoint;
use crate::protocol::Transport;
use crate::stats::ControllerStats;

/// N directory banks behind N ports.
#[derive(Debug)]
pub struct BankedController {
    banks: Vec<DirectoryController>,
    input: Vec<PortSet>,
    output: Vec<PortSet>,
    bank_map: BankMap,
    local_directory: bool,
    first_input: usize,
    first_output: usize,
}

impl BankedController {
    /// Builds `config.topology.banks` banks and their ports.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotPowerOfTwo`] if the bank count or interleave is not a
    /// power of two, or any error raised while building a bank.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let banks = (0..config.topology.banks)
            .map(|bank| DirectoryController::new(bank, config))
            .collect::<Result<Vec<_>, _>>()?;
        Self::with_banks(config, banks)
    }

    /// Wraps already built banks, one port per bank.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotPowerOfTwo`] for bad geometry, or
    /// [`ConfigError::InvalidValue`] if the number of banks does not match the topology.
    pub fn with_banks(config: &Config, banks: Vec<DirectoryController>) -> Result<Self, ConfigError> {
        let topology = &config.topology;
        let bank_map = BankMap::new(topology.banks, topology.interleave, topology.skew_shift)?;
        if banks.len() != topology.banks {
            return Err(ConfigError::InvalidValue {
                key: "banks",
                value: banks.len().to_string(),
                reason: "bank controllers do not match the configured bank count",
            });
        }
        let ports = |names| {
            (0..banks.len())
                .map(|_| PortSet::new(names, &config.queues))
                .collect::<Vec<_>>()
        };
        let input = ports(["port_request_in", "port_snoop_in", "port_reply_in"]);
        let output = ports(["port_request_out", "port_snoop_out", "port_reply_out"]);
        debug!(banks = banks.len(), local = topology.local_directory, "banked directory created");
        Ok(Self {
            banks,
            input,
            output,
            bank_map,
            local_directory: topology.local_directory,
            first_input: 0,
            first_output: 0,
        })
    }

    /// Number of banks, which is also the number of ports.
    #[inline]
    pub fn banks(&self) -> usize {
        self.banks.len()
    }

    /// Bank `index`.
    pub fn bank(&self, index: usize) -> &DirectoryController {
        &self.banks[index]
    }

    /// Bank `index`, mutably.
    pub fn bank_mut(&mut self, index: usize) -> &mut DirectoryController {
        &mut self.banks[index]
    }

    /// Address interleaving of the banks.
    pub const fn bank_map(&self) -> &BankMap {
        &self.bank_map
    }

    /// Input queues of port `port`.
    pub fn input(&self, port: usize) -> &PortSet {
        &self.input[port]
    }

    /// Input queues of port `port`, mutably. Producers check `has_space` first.
    pub fn input_mut(&mut self, port: usize) -> &mut PortSet {
        &mut self.input[port]
    }

    /// Output queues of port `port`.
    pub fn output(&self, port: usize) -> &PortSet {
        &self.output[port]
    }

    /// Output queues of port `port`, mutably.
    pub fn output_mut(&mut self, port: usize) -> &mut PortSet {
        &mut self.output[port]
    }

    /// Bank that receives `transport` arriving on `port`.
    ///
    /// With a local directory every port may reach every bank, so the address picks the
    /// bank; otherwise port `i` feeds bank `i`.
    pub fn map_incoming(&self, transport: &Transport, port: usize) -> NodeId {
        if self.local_directory {
            self.bank_map.bank_of(transport.addr())
        } else {
            port
        }
    }

    /// Port that carries `transport` leaving bank `bank`.
    ///
    /// # Panics
    ///
    /// Panics if a local directory routes to a requester with no port.
    pub fn map_outgoing(&self, transport: &Transport, bank: NodeId) -> usize {
        match transport.destination.as_ref().and_then(|d| d.requester) {
            Some(requester) if self.local_directory => {
                assert!(
                    requester < self.output.len(),
                    "bank {bank}: requester {requester} of {transport} has no port"
                );
                requester
            }
            _ => bank,
        }
    }

    /// Advances every bank by one cycle, routing messages in and out.
    pub fn drive(&mut self, now: u64) {
        let n = self.banks.len();

        let mut progress = false;
        for i in 0..n {
            let port = (self.first_input + i) % n;
            for channel in Channel::ALL {
                progress |= self.route_in(port, channel);
            }
        }
        if progress {
            self.first_input = (self.first_input + 1) % n;
        }

        for bank in &mut self.banks {
            bank.drive(now);
        }

        let mut progress = false;
        for i in 0..n {
            let bank = (self.first_output + i) % n;
            for channel in Channel::ALL {
                progress |= self.route_out(bank, channel);
            }
        }
        if progress {
            self.first_output = (self.first_output + 1) % n;
        }
    }

    fn route_in(&mut self, port: usize, channel: Channel) -> bool {
        let Some(head) = self.input[port].queue(channel).peek() else {
            return false;
        };
        let bank = self.map_incoming(head, port);
        let target = self.banks[bank].input_mut().queue_mut(channel);
        if !target.has_space(1) {
            return false;
        }
        let Some(transport) = self.input[port].queue_mut(channel).pop() else {
            return false;
        };
        target.push(transport);
        true
    }

    fn route_out(&mut self, bank: usize, channel: Channel) -> bool {
        let Some(head) = self.banks[bank].output().queue(channel).peek() else {
            return false;
        };
        let port = self.map_outgoing(head, bank);
        if !self.output[port].queue(channel).has_space(1) {
            return false;
        }
        let Some(transport) = self.banks[bank].output_mut().queue_mut(channel).pop() else {
            return false;
        };
        self.output[port].queue_mut(channel).push(transport);
        true
    }

    /// True if every bank is quiesced and every port queue is empty.
    pub fn is_quiesced(&self) -> bool {
        self.banks.iter().all(DirectoryController::is_quiesced)
            && self.input.iter().all(PortSet::is_empty)
            && self.output.iter().all(PortSet::is_empty)
    }

    /// Sum of every bank's counters.
    pub fn stats(&self) -> ControllerStats {
        let mut total = ControllerStats::default();
        for bank in &self.banks {
            total += bank.stats();
        }
        total
    }

    /// Writes the directories of all banks to `path` as one checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the file cannot be written.
    pub fn save_state(&self, path: &Path) -> Result<(), CheckpointError> {
        let records: Vec<_> = self
            .banks
            .iter()
            .flat_map(DirectoryController::checkpoint_records)
            .collect();
        checkpoint::save(path, &records)
    }

    /// Loads a checkpoint, giving each bank the records that map to it.
    ///
    /// # Returns
    ///
    /// The number of entries restored across all banks.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the file cannot be read or a record does not fit.
    pub fn load_state(&mut self, path: &Path) -> Result<usize, CheckpointError> {
        let records = checkpoint::load(path)?;
        let mut loaded = 0;
        for bank in &mut self.banks {
            loaded += bank.restore(&records, &self.bank_map)?;
        }
        Ok(loaded)
    }
}
