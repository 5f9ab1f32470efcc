//! End-of-run statistics.

use std::fmt;

use crate::buffer::BufferStats;
use crate::common::{Addr, Cycle, MachineId};
use crate::config::Protocol;
use crate::controller::{DirStats, L1Stats};
use crate::message::{VirtualNetwork, NUM_VIRTUAL_NETWORKS};
use crate::sequencer::SequencerStats;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// messages injected, per virtual network
    pub messages: [u64; NUM_VIRTUAL_NETWORKS],
    pub delivered: u64,
    /// delivery attempts refused by a full inbound buffer
    pub refused: u64,
}

impl NetworkStats {
    pub fn count(&mut self, vnet: VirtualNetwork) {
        self.messages[vnet as usize] += 1;
    }

    pub fn total(&self) -> u64 {
        self.messages.iter().sum()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub reads: u64,
    pub writes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreStats {
    pub sequencer: SequencerStats,
    pub l1: L1Stats,
    pub mandatory_queue: BufferStats,
    /// instructions retired by the processor, fences and compute included
    pub retired: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub controller: DirStats,
    pub memory: MemoryStats,
}

/// A final memory value the workload promised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Check {
    pub addr: Addr,
    pub expected: u64,
    pub actual: u64,
}

impl Check {
    pub fn passed(&self) -> bool {
        self.expected == self.actual
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    pub protocol: Protocol,
    pub cycles: Cycle,
    pub cores: Vec<CoreStats>,
    pub directories: Vec<DirectoryStats>,
    pub network: NetworkStats,
    pub checks: Vec<Check>,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(Check::passed)
    }

    pub fn hit_rate(&self) -> f64 {
        let (hits, total) = self.cores.iter().fold((0, 0), |(h, t), c| {
            (h + c.sequencer.hits, t + c.sequencer.hits + c.sequencer.misses)
        });
        match total {
            0 => 0.0,
            t => hits as f64 / t as f64,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} finished in {} cycles", self.protocol, self.cycles)?;
        writeln!(f, "hit rate {:.2}%", self.hit_rate() * 100.0)?;
        for (i, c) in self.cores.iter().enumerate() {
            let s = &c.sequencer;
            writeln!(
                f,
                "{}: {} loads, {} stores, {} atomics, {} hits, {} misses, avg latency {:.2}, {} rejected, {} retired",
                MachineId::L1(i),
                s.loads,
                s.stores,
                s.atomics,
                s.hits,
                s.misses,
                s.avg_latency(),
                s.rejected,
                c.retired,
            )?;
            writeln!(
                f,
                "    {} transitions, {} stalls, {} evictions, {} writebacks, mandatory queue peak {}",
                c.l1.transitions, c.l1.stalls, c.l1.evictions, c.l1.writebacks, c.mandatory_queue.peak,
            )?;
        }
        for (i, d) in self.directories.iter().enumerate() {
            let s = &d.controller;
            writeln!(
                f,
                "{}: {} requests, {} forwards, {} invalidations, {} queued, memory {} reads / {} writes",
                MachineId::Directory(i),
                s.requests,
                s.forwards,
                s.invalidations,
                s.queued,
                d.memory.reads,
                d.memory.writes,
            )?;
        }
        let [req, fwd, resp] = self.network.messages;
        writeln!(
            f,
            "network: {req} requests, {fwd} forwards, {resp} responses, {} refused deliveries",
            self.network.refused
        )?;
        for check in &self.checks {
            let verdict = if check.passed() { "ok" } else { "MISMATCH" };
            writeln!(f, "{}: expected {}, found {} {verdict}", check.addr, check.expected, check.actual)?;
        }
        Ok(())
    }
}
