use std::fmt;
use std::time::Duration;

use asynchronix::time::MonotonicTime;

use crate::error::ConfigError;

/// Simulated time in cycles. One cycle is one simulated second.
pub type Cycle = u64;

/// Logical timestamp used by the TARDIS leases.
pub type Timestamp = u64;

pub const WORD_BYTES: u64 = 8;

pub fn cycle_of(time: MonotonicTime) -> Cycle {
    time.as_secs().max(0) as Cycle
}

pub fn cycles(n: Cycle) -> Duration {
    Duration::from_secs(n)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(pub u64);

impl Addr {
    pub fn line(&self, block_bits: u32) -> LineAddr {
        LineAddr(self.0 >> block_bits << block_bits)
    }
    /// index of the 64-bit word within its line
    pub fn word(&self, block_bits: u32) -> usize {
        ((self.0 & ((1 << block_bits) - 1)) / WORD_BYTES) as usize
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A line-aligned address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineAddr(pub u64);

impl fmt::Display for LineAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifies a controller. L1 controllers and directories are numbered
/// independently, each from zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MachineId {
    L1(usize),
    Directory(usize),
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineId::L1(i) => write!(f, "l1_cntrl{i}"),
            MachineId::Directory(i) => write!(f, "dir_cntrl{i}"),
        }
    }
}

/// The data of one cache line, stored as 64-bit words.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DataBlock(Vec<u64>);

impl DataBlock {
    pub fn new(line_size: u64) -> Self {
        DataBlock(vec![0; (line_size / WORD_BYTES).max(1) as usize])
    }
    pub fn read(&self, word: usize) -> u64 {
        self.0.get(word).copied().unwrap_or_default()
    }
    pub fn write(&mut self, word: usize, value: u64) {
        if let Some(w) = self.0.get_mut(word) {
            *w = value;
        }
    }
}

/// A TARDIS read lease: the line version written at `wts` may be read at
/// any logical time up to and including `rts`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Lease {
    pub wts: Timestamp,
    pub rts: Timestamp,
}

impl Lease {
    pub fn covers(&self, ts: Timestamp) -> bool {
        self.wts <= ts && ts <= self.rts
    }
}

/// Static partitioning of physical memory into one contiguous region per
/// directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressMap {
    memory_size: u64,
    region_size: u64,
}

impl AddressMap {
    pub fn new(memory_size: u64, num_dirs: usize) -> Result<Self, ConfigError> {
        if num_dirs == 0 {
            return Err(ConfigError::Zero { what: "number of directories" });
        }
        if memory_size == 0 {
            return Err(ConfigError::Zero { what: "memory size" });
        }
        if memory_size % num_dirs as u64 != 0 {
            return Err(ConfigError::UnevenMemoryPartition { memory_size, num_dirs });
        }
        Ok(Self {
            memory_size,
            region_size: memory_size / num_dirs as u64,
        })
    }

    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr < self.memory_size
    }

    /// Directory responsible for `line`, `None` when outside physical memory.
    pub fn home(&self, line: LineAddr) -> Option<MachineId> {
        self.contains(line.0)
            .then(|| MachineId::Directory((line.0 / self.region_size) as usize))
    }

    /// Byte range owned by directory `dir`.
    pub fn region(&self, dir: usize) -> std::ops::Range<u64> {
        let start = dir as u64 * self.region_size;
        start..start + self.region_size
    }
}
