//! Runtime coherence checking shared by all controllers of one system.
//!
//! The monitor tracks which controllers hold a line and with what
//! permission, the read leases granted on each line, and the history of
//! committed stores per word. Loads are checked against that history.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::error;

use crate::common::{Addr, LineAddr, MachineId, Timestamp};
use crate::error::ProtocolError;
use crate::message::MemOp;
use crate::sequencer::Completion;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discipline {
    /// single writer or multiple readers at any instant
    Swmr,
    /// ordering by logical timestamps and read leases
    Leased,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Perm {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct LineRecord {
    holders: BTreeMap<MachineId, Perm>,
    max_rts: Timestamp,
    last_commit: Option<Timestamp>,
}

pub struct CoherenceMonitor {
    discipline: Discipline,
    checking: bool,
    block_bits: u32,
    lines: BTreeMap<LineAddr, LineRecord>,
    // per word: commit timestamp (or sequence number) -> value
    history: BTreeMap<Addr, BTreeMap<u64, u64>>,
    seq: u64,
}

impl CoherenceMonitor {
    pub fn new(discipline: Discipline, block_bits: u32, checking: bool) -> Self {
        Self {
            discipline,
            checking,
            block_bits,
            lines: BTreeMap::new(),
            history: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn shared(discipline: Discipline, block_bits: u32, checking: bool) -> SharedMonitor {
        Arc::new(Mutex::new(Self::new(discipline, block_bits, checking)))
    }

    fn violation(&self, controller: MachineId, line: LineAddr, detail: String) -> Result<(), ProtocolError> {
        if !self.checking {
            return Ok(());
        }
        error!("coherence violation on {line} by {controller}: {detail}");
        Err(ProtocolError::CoherenceViolation { controller, line, detail })
    }

    pub fn acquire(&mut self, core: MachineId, line: LineAddr, perm: Perm) -> Result<(), ProtocolError> {
        let record = self.lines.entry(line).or_default();
        record.holders.insert(core, perm);
        if self.discipline != Discipline::Swmr {
            return Ok(());
        }
        let conflict = record
            .holders
            .iter()
            .find(|(c, p)| **c != core && (perm == Perm::Write || **p == Perm::Write))
            .map(|(c, p)| (*c, *p));
        match conflict {
            Some((other, p)) => self.violation(core, line, format!("acquired {perm:?} while {other} holds {p:?}")),
            None => Ok(()),
        }
    }

    pub fn release(&mut self, core: MachineId, line: LineAddr) {
        if let Some(record) = self.lines.get_mut(&line) {
            record.holders.remove(&core);
        }
    }

    pub fn holders(&self, line: LineAddr) -> Vec<(MachineId, Perm)> {
        self.lines
            .get(&line)
            .map(|r| r.holders.iter().map(|(c, p)| (*c, *p)).collect())
            .unwrap_or_default()
    }

    /// Records a read lease handed out for `line`.
    pub fn grant_lease(&mut self, line: LineAddr, rts: Timestamp) {
        let record = self.lines.entry(line).or_default();
        record.max_rts = record.max_rts.max(rts);
    }

    /// Checks a store against the granted leases and records its value.
    /// `ts` is the logical commit time, `None` under `Swmr`.
    pub fn commit_store(
        &mut self,
        core: MachineId,
        addr: Addr,
        ts: Option<Timestamp>,
        value: u64,
    ) -> Result<(), ProtocolError> {
        let line = addr.line(self.block_bits);
        let key = match ts {
            Some(ts) => {
                let record = self.lines.entry(line).or_default();
                let (max_rts, last) = (record.max_rts, record.last_commit);
                record.last_commit = Some(last.map_or(ts, |l| l.max(ts)));
                if ts <= max_rts {
                    self.violation(core, line, format!("store at ts {ts} within a lease up to {max_rts}"))?;
                }
                if last.is_some_and(|l| ts < l) {
                    self.violation(core, line, format!("store at ts {ts} behind a commit at {}", last.unwrap_or_default()))?;
                }
                ts
            }
            None => {
                self.seq += 1;
                self.seq
            }
        };
        self.history.entry(addr).or_default().insert(key, value);
        Ok(())
    }

    /// Checks that a load observed the latest value ordered before it.
    pub fn observe_load(
        &mut self,
        core: MachineId,
        addr: Addr,
        ts: Option<Timestamp>,
        value: u64,
    ) -> Result<(), ProtocolError> {
        let expected = match ts {
            Some(ts) => self.value_at(addr, ts),
            None => self.latest(addr),
        };
        if expected != value {
            let line = addr.line(self.block_bits);
            let when = ts.map_or_else(String::new, |ts| format!(" at ts {ts}"));
            return self.violation(core, line, format!("load of {addr}{when} returned {value}, expected {expected}"));
        }
        Ok(())
    }

    fn value_at(&self, addr: Addr, ts: Timestamp) -> u64 {
        self.history
            .get(&addr)
            .and_then(|h| h.range(..=ts).next_back())
            .map_or(0, |(_, v)| *v)
    }

    /// Checks and records a completed CPU access.
    pub fn record(&mut self, core: MachineId, done: &Completion, ts: Option<Timestamp>) -> Result<(), ProtocolError> {
        if !matches!(done.req.op, MemOp::Store(_)) {
            self.observe_load(core, done.req.addr, ts, done.loaded)?;
        }
        if let Some(value) = done.stored {
            self.commit_store(core, done.req.addr, ts, value)?;
        }
        Ok(())
    }

    /// Value of the most recent store to `addr`, 0 if never written.
    pub fn latest(&self, addr: Addr) -> u64 {
        self.history
            .get(&addr)
            .and_then(|h| h.values().next_back())
            .copied()
            .unwrap_or_default()
    }
}

pub type SharedMonitor = Arc<Mutex<CoherenceMonitor>>;

pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// First protocol fault raised by any model of a running system.
#[derive(Clone, Default)]
pub struct FaultLatch(Arc<Mutex<Option<ProtocolError>>>);

impl FaultLatch {
    pub fn raise(&self, err: ProtocolError) {
        let mut slot = lock(&self.0);
        if slot.is_none() {
            error!("{err}");
            *slot = Some(err);
        }
    }

    pub fn take(&self) -> Option<ProtocolError> {
        lock(&self.0).take()
    }

    pub fn is_raised(&self) -> bool {
        lock(&self.0).is_some()
    }
}
