//! System configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `CACHESIM_` environment variables (nested keys separated by `__`, e.g.
//! `CACHESIM_CACHE__ASSOC=4`). Command-line flags are applied on top by the
//! binary.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::common::{AddressMap, Cycle, WORD_BYTES};
use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "CACHESIM_";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    Msi,
    Tardis,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MSI" => Ok(Protocol::Msi),
            "TARDIS" | "TARDIS_TSO" => Ok(Protocol::Tardis),
            _ => Err(ConfigError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Protocol> for String {
    fn from(p: Protocol) -> Self {
        p.to_string()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Msi => write!(f, "MSI"),
            Protocol::Tardis => write!(f, "TARDIS"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// bytes
    pub size: u64,
    pub assoc: usize,
    /// bytes, a power of two
    pub line_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { size: 32 * 1024, assoc: 8, line_size: 64 }
    }
}

/// Latencies in cycles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub l1_hit: Cycle,
    pub link: Cycle,
    pub memory: Cycle,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self { l1_hit: 1, link: 1, memory: 20 }
    }
}

/// Buffer capacities in messages, 0 for unbounded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub mandatory: usize,
    pub l1_out: usize,
    pub dir_out: usize,
    pub inbound: usize,
    pub transitions_per_cycle: usize,
    /// messages per outbound buffer per cycle
    pub link_bandwidth: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            mandatory: 16,
            l1_out: 4,
            dir_out: 0,
            inbound: 0,
            transitions_per_cycle: 4,
            link_bandwidth: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// 1 makes the core blocking
    pub max_outstanding: usize,
    /// 0 disables the check
    pub deadlock_threshold: Cycle,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self { max_outstanding: 16, deadlock_threshold: 50_000 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TardisConfig {
    pub lease: u64,
    /// processed CPU requests between increments of the program timestamp
    pub self_increment_period: u64,
}

impl Default for TardisConfig {
    fn default() -> Self {
        Self { lease: 10, self_increment_period: 8 }
    }
}

/// The program each core runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadConfig {
    SpinlockCounter { iterations: u64 },
    SharedCounter { iterations: u64 },
    FalseSharing { iterations: u64 },
    RandomArray { elements: u64, iterations: u64, seed: u64 },
    /// one trace file per core
    Trace { files: Vec<PathBuf> },
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig::SpinlockCounter { iterations: 100 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: Protocol,
    pub num_cpus: usize,
    pub num_dirs: usize,
    /// bytes of physical memory, split evenly between directories
    pub memory_size: u64,
    pub cache: CacheConfig,
    pub latency: LatencyConfig,
    pub buffers: BufferConfig,
    pub sequencer: SequencerConfig,
    pub tardis: TardisConfig,
    /// Notify the directory of clean evictions. Unset picks the protocol
    /// default: on for MSI, off for TARDIS.
    pub send_evictions: Option<bool>,
    pub check_coherence: bool,
    pub max_cycles: Cycle,
    pub workload: WorkloadConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: Protocol::Msi,
            num_cpus: 4,
            num_dirs: 1,
            memory_size: 1 << 20,
            cache: CacheConfig::default(),
            latency: LatencyConfig::default(),
            buffers: BufferConfig::default(),
            sequencer: SequencerConfig::default(),
            tardis: TardisConfig::default(),
            send_evictions: None,
            check_coherence: true,
            max_cycles: 10_000_000,
            workload: WorkloadConfig::default(),
        }
    }
}

impl Config {
    /// Layers defaults, the TOML file at `path` (if given) and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::Load(format!("no such file: {}", path.display())));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn block_bits(&self) -> u32 {
        self.cache.line_size.trailing_zeros()
    }

    pub fn send_evictions(&self) -> bool {
        self.send_evictions.unwrap_or(match self.protocol {
            Protocol::Msi => true,
            Protocol::Tardis => false,
        })
    }

    pub fn address_map(&self) -> Result<AddressMap, ConfigError> {
        AddressMap::new(self.memory_size, self.num_dirs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = |what, value: u64| match value {
            0 => Err(ConfigError::Zero { what }),
            _ => Ok(()),
        };
        nonzero("number of cpus", self.num_cpus as u64)?;
        nonzero("link latency", self.latency.link)?;
        nonzero("memory latency", self.latency.memory)?;
        nonzero("transitions per cycle", self.buffers.transitions_per_cycle as u64)?;
        nonzero("link bandwidth", self.buffers.link_bandwidth as u64)?;
        nonzero("outstanding requests", self.sequencer.max_outstanding as u64)?;
        if self.protocol == Protocol::Tardis {
            nonzero("lease", self.tardis.lease)?;
            nonzero("self increment period", self.tardis.self_increment_period)?;
        }

        let line_size = self.cache.line_size;
        if !line_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo { what: "line size", value: line_size });
        }
        if line_size < WORD_BYTES {
            return Err(ConfigError::CacheGeometry {
                size: self.cache.size,
                assoc: self.cache.assoc,
                line_size,
            });
        }
        let set_bytes = self.cache.assoc as u64 * line_size;
        if set_bytes == 0 || self.cache.size == 0 || self.cache.size % set_bytes != 0 {
            return Err(ConfigError::CacheGeometry {
                size: self.cache.size,
                assoc: self.cache.assoc,
                line_size,
            });
        }

        let map = self.address_map()?;
        if map.region_size() % line_size != 0 {
            return Err(ConfigError::UnevenMemoryPartition {
                memory_size: self.memory_size,
                num_dirs: self.num_dirs,
            });
        }

        // a directory may have to invalidate every other cache at once
        let at_least = |what, value: usize, min: usize| match value {
            v if v != 0 && v < min => Err(ConfigError::TooSmall { what, value, min }),
            _ => Ok(()),
        };
        at_least("directory outbound buffer", self.buffers.dir_out, self.num_cpus + 1)?;
        at_least("L1 outbound buffer", self.buffers.l1_out, 2)?;

        if let WorkloadConfig::Trace { files } = &self.workload {
            if files.len() != self.num_cpus {
                return Err(ConfigError::WorkloadCount { expected: self.num_cpus, got: files.len() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_bits(), 6);
        assert!(config.send_evictions());
        let tardis = Config { protocol: Protocol::Tardis, ..Config::default() };
        assert!(!tardis.send_evictions());
    }

    #[test]
    fn protocol_names() {
        assert_eq!("msi".parse::<Protocol>(), Ok(Protocol::Msi));
        assert_eq!("TARDIS".parse::<Protocol>(), Ok(Protocol::Tardis));
        assert_eq!(
            "MESI".parse::<Protocol>(),
            Err(ConfigError::UnsupportedProtocol("MESI".to_string()))
        );
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut config = Config::default();
        config.cache.line_size = 48;
        assert!(matches!(config.validate(), Err(ConfigError::NotPowerOfTwo { .. })));
        config.cache.line_size = 64;
        config.cache.size = 1000;
        assert!(matches!(config.validate(), Err(ConfigError::CacheGeometry { .. })));
    }

    #[test]
    fn rejects_uneven_memory() {
        let config = Config { num_dirs: 3, ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::UnevenMemoryPartition { .. })));
    }

    #[test]
    fn rejects_small_directory_buffers() {
        let mut config = Config::default();
        config.buffers.dir_out = 2;
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooSmall { what: "directory outbound buffer", value: 2, min: 5 })
        );
    }
}
