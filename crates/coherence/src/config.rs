//! Configuration for the coherence engine.
//!
//! This module defines every knob of a banked directory controller. It provides:
//! 1. **Defaults:** Baseline geometry, pipeline timing, queue and buffer sizes.
//! 2. **Structures:** Hierarchical config for topology, timing, queues, resources, and protocol.
//! 3. **Validation:** `Config::validate`, run before any controller is built.
//!
//! Configuration is supplied as JSON (`Config::from_json`) or use `Config::default()`.
//! Every field has a default, so a partial document is accepted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::ConfigError;
use crate::queues::PipelineTiming;

/// Default configuration constants.
mod defaults {
    /// Number of directory banks.
    pub const BANKS: usize = 1;

    /// Bank interleave in bytes.
    pub const INTERLEAVE: u64 = 64;

    /// Cores tracked by each sharer set.
    pub const CORES: usize = 16;

    /// Cache block size in bytes.
    pub const BLOCK_SIZE: u64 = 64;

    /// MAF stage latency in cycles.
    pub const MAF_LATENCY: u64 = 1;

    /// Directory tag stage latency in cycles.
    pub const DIR_LATENCY: u64 = 1;

    /// Data array stage latency in cycles.
    pub const DATA_LATENCY: u64 = 2;

    /// Minimum spacing between issues on one pipeline server.
    pub const ISSUE_LATENCY: u64 = 1;

    /// Parallel servers per pipeline.
    pub const SERVERS: usize = 1;

    /// Depth of each input and output queue.
    pub const QUEUE_SIZE: usize = 8;

    /// Miss address file entries.
    pub const MAF_SIZE: usize = 32;

    /// Directory evict-buffer entries.
    pub const DIR_EB_SIZE: usize = 8;

    /// Cache evict-buffer entries.
    pub const CACHE_EB_SIZE: usize = 8;

    /// Snoop-out slots reserved by a request.
    pub const MAX_SNOOPS_PER_REQUEST: usize = 2;

    /// Protocol policy name.
    pub const POLICY: &str = "NonInclusiveMESI";

    /// Directory organisation name.
    pub const DIRECTORY: &str = "Infinite";

    /// Data array organisation name.
    pub const ARRAY: &str = "Tagless";
}

/// Root configuration of a banked controller.
///
/// # Examples
///
/// ```
/// use cohsim_core::config::Config;
///
/// let json = r#"{
///     "topology": { "banks": 4, "cores": 8 },
///     "resources": { "maf_size": 16 },
///     "protocol": { "policy": "SingleCMPRegion", "policy_params": { "PropagateCE": "true" } }
/// }"#;
///
/// let config = Config::from_json(json).unwrap();
/// assert_eq!(config.topology.banks, 4);
/// assert_eq!(config.topology.interleave, 64);
/// assert_eq!(config.resources.maf_size, 16);
/// assert_eq!(config.resources.cache_eb_size, 8);
/// assert_eq!(config.protocol.policy, "SingleCMPRegion");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bank layout and system geometry
    pub topology: TopologyConfig,
    /// Pipeline stage timing
    pub timing: TimingConfig,
    /// Input and output queue depths
    pub queues: QueueConfig,
    /// MAF, evict-buffer, and snoop budgets
    pub resources: ResourceConfig,
    /// Protocol, directory, and array selection
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Parses a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] if the document is malformed. The result is not
    /// validated; call [`Config::validate`].
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Checks every value that would otherwise abort controller construction.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotPowerOfTwo`] for bad geometry and
    /// [`ConfigError::InvalidValue`] for a size or timing that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.topology;
        if !t.banks.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                key: "banks",
                value: t.banks as u64,
            });
        }
        if !t.interleave.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                key: "interleave",
                value: t.interleave,
            });
        }
        if !t.block_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                key: "block_size",
                value: t.block_size,
            });
        }
        positive("cores", t.cores)?;

        for (key, stage) in [
            ("timing.maf.issue_latency", self.timing.maf),
            ("timing.dir.issue_latency", self.timing.dir),
            ("timing.data.issue_latency", self.timing.data),
        ] {
            positive(key, stage.issue_latency as usize)?;
        }
        positive("timing.servers", self.timing.servers)?;

        positive("request_queue", self.queues.request_queue)?;
        positive("snoop_queue", self.queues.snoop_queue)?;
        positive("reply_queue", self.queues.reply_queue)?;

        let r = &self.resources;
        positive("maf_size", r.maf_size)?;
        positive("dir_eb_size", r.dir_eb_size)?;
        positive("cache_eb_size", r.cache_eb_size)?;
        if r.max_snoops_per_request < 2 {
            return Err(ConfigError::InvalidValue {
                key: "max_snoops_per_request",
                value: r.max_snoops_per_request.to_string(),
                reason: "a snoop record needs two snoop slots",
            });
        }
        if r.max_snoops_per_request > self.queues.snoop_queue {
            return Err(ConfigError::InvalidValue {
                key: "max_snoops_per_request",
                value: r.max_snoops_per_request.to_string(),
                reason: "exceeds the snoop queue depth",
            });
        }
        Ok(())
    }
}

fn positive(key: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be at least one",
        });
    }
    Ok(())
}

/// Bank layout and system geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Number of banks (power of two)
    pub banks: usize,
    /// Bytes of contiguous address space per bank (power of two)
    pub interleave: u64,
    /// Shift of the high address bits folded into the bank index; 0 disables skew
    pub skew_shift: u32,
    /// Banks sit beside cores: requests are routed by address, replies by requester
    pub local_directory: bool,
    /// Cores tracked by each sharer set
    pub cores: usize,
    /// Cache block size in bytes (power of two)
    pub block_size: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            banks: defaults::BANKS,
            interleave: defaults::INTERLEAVE,
            skew_shift: 0,
            local_directory: false,
            cores: defaults::CORES,
            block_size: defaults::BLOCK_SIZE,
        }
    }
}

/// Latency and issue spacing of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Cycles from issue to completion
    pub latency: u64,
    /// Minimum cycles between issues on one server
    #[serde(default = "StageConfig::default_issue_latency")]
    pub issue_latency: u64,
}

impl StageConfig {
    const fn new(latency: u64) -> Self {
        Self {
            latency,
            issue_latency: defaults::ISSUE_LATENCY,
        }
    }

    fn default_issue_latency() -> u64 {
        defaults::ISSUE_LATENCY
    }

    /// Pipeline timing of this stage with `servers` servers.
    pub const fn timing(self, servers: usize) -> PipelineTiming {
        PipelineTiming {
            latency: self.latency,
            issue_latency: self.issue_latency,
            servers,
        }
    }
}

/// Timing of the three pipeline stages of a bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// MAF lookup stage
    pub maf: StageConfig,
    /// Directory tag stage
    pub dir: StageConfig,
    /// Data array stage
    pub data: StageConfig,
    /// Servers per stage
    pub servers: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            maf: StageConfig::new(defaults::MAF_LATENCY),
            dir: StageConfig::new(defaults::DIR_LATENCY),
            data: StageConfig::new(defaults::DATA_LATENCY),
            servers: defaults::SERVERS,
        }
    }
}

/// Queue depths, applied to every bank and every port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Request channel depth
    pub request_queue: usize,
    /// Snoop channel depth
    pub snoop_queue: usize,
    /// Reply channel depth
    pub reply_queue: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            request_queue: defaults::QUEUE_SIZE,
            snoop_queue: defaults::QUEUE_SIZE,
            reply_queue: defaults::QUEUE_SIZE,
        }
    }
}

/// Per-bank tracking resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Miss address file entries
    pub maf_size: usize,
    /// Directory evict-buffer entries (bounded directories only)
    pub dir_eb_size: usize,
    /// Cache evict-buffer entries
    pub cache_eb_size: usize,
    /// Snoop-out slots a request or woken MAF entry reserves
    pub max_snoops_per_request: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            maf_size: defaults::MAF_SIZE,
            dir_eb_size: defaults::DIR_EB_SIZE,
            cache_eb_size: defaults::CACHE_EB_SIZE,
            max_snoops_per_request: defaults::MAX_SNOOPS_PER_REQUEST,
        }
    }
}

/// Protocol, directory, and data array selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Policy name (`NonInclusiveMESI` or `SingleCMPRegion`)
    pub policy: String,
    /// Policy parameters
    pub policy_params: BTreeMap<String, String>,
    /// Directory organisation (`Infinite` or `Standard`)
    pub directory: String,
    /// Directory parameters (`sets`, `assoc`, `skew_set`, `same_set`)
    pub directory_params: BTreeMap<String, String>,
    /// Data array organisation (`Tagless` or `Infinite`)
    pub array: String,
    /// Write back clean array victims as well as dirty ones
    pub evict_clean: bool,
    /// log2 of the MAF region size in bytes; 0 groups by exact block
    pub region_shift: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            policy: defaults::POLICY.to_owned(),
            policy_params: BTreeMap::new(),
            directory: defaults::DIRECTORY.to_owned(),
            directory_params: BTreeMap::new(),
            array: defaults::ARRAY.to_owned(),
            evict_clean: false,
            region_shift: 0,
        }
    }
}
