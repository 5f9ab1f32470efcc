//! Error taxonomy of the simulator.
//!
//! Configuration problems are reported before a run starts, buffer errors are
//! consumed by the controllers as backpressure, and protocol errors abort a
//! run because they can only come from a broken state machine.

use thiserror::Error;

use crate::common::{Cycle, LineAddr, MachineId};
use crate::message::MessageKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unsupported coherence protocol `{0}` (expected MSI or TARDIS)")]
    UnsupportedProtocol(String),
    #[error("memory size {memory_size:#x} is not divisible by {num_dirs} directories")]
    UnevenMemoryPartition { memory_size: u64, num_dirs: usize },
    #[error("{what} must be a power of two, got {value}")]
    NotPowerOfTwo { what: &'static str, value: u64 },
    #[error("{what} must be non-zero")]
    Zero { what: &'static str },
    #[error("{what} is {value}, it must be unbounded (0) or at least {min}")]
    TooSmall { what: &'static str, value: usize, min: usize },
    #[error("cache of {size} bytes cannot hold {assoc} ways of {line_size}-byte lines")]
    CacheGeometry { size: u64, assoc: usize, line_size: u64 },
    #[error("expected {expected} workloads (one per cpu), got {got}")]
    WorkloadCount { expected: usize, got: usize },
    #[error("cannot load configuration: {0}")]
    Load(String),
    #[error("bad trace line {line}: {reason}")]
    Trace { line: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("message buffer overflow (capacity {capacity})")]
    Overflow { capacity: usize },
    #[error("no message ready")]
    Empty,
}

/// A violation of a coherence protocol invariant. Every variant carries
/// enough context to locate the failing transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{controller}: unexpected {kind:?} for line {line} in state {state}")]
    UnexpectedMessage {
        controller: MachineId,
        line: LineAddr,
        state: String,
        kind: MessageKind,
    },
    #[error("{controller}: ack mismatch for line {line}: {detail}")]
    AckMismatch {
        controller: MachineId,
        line: LineAddr,
        detail: String,
    },
    #[error("{controller}: line {line} is not homed here")]
    Misrouted { controller: MachineId, line: LineAddr },
    #[error("coherence violation on line {line} by {controller}: {detail}")]
    CoherenceViolation {
        controller: MachineId,
        line: LineAddr,
        detail: String,
    },
    #[error("{controller}: possible deadlock on line {line}, request issued at cycle {issued_at} still pending at cycle {now}")]
    Deadlock {
        controller: MachineId,
        line: LineAddr,
        issued_at: Cycle,
        now: Cycle,
    },
    #[error("{controller}: buffer failure on {port}: {source}")]
    Port {
        controller: MachineId,
        port: &'static str,
        source: BufferError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("protocol failure: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("simulation exceeded {max_cycles} cycles, still in flight: {}", .in_flight.join("; "))]
    Timeout { max_cycles: Cycle, in_flight: Vec<String> },
}
