//! Per-core adapter between CPU memory operations and the L1 controller.
//!
//! The sequencer admits requests into the L1's mandatory queue, keeps the
//! table of outstanding requests (at most one per line) and, when the L1
//! reports a line ready, performs the access on the line's data and builds
//! the response for the core.

use std::collections::BTreeMap;

use log::{trace, warn};

use crate::buffer::MessageBuffer;
use crate::common::{AddressMap, Cycle, DataBlock, LineAddr, MachineId};
use crate::error::ProtocolError;
use crate::message::{CpuRequest, CpuResponse, MemOp, RequestStatus};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SequencerStats {
    pub loads: u64,
    pub stores: u64,
    pub atomics: u64,
    pub hits: u64,
    pub misses: u64,
    pub total_latency: u64,
    pub rejected: u64,
}

impl SequencerStats {
    pub fn completed(&self) -> u64 {
        self.loads + self.stores + self.atomics
    }

    pub fn avg_latency(&self) -> f64 {
        match self.completed() {
            0 => 0.0,
            n => self.total_latency as f64 / n as f64,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Outstanding {
    req: CpuRequest,
    issued_at: Cycle,
}

/// The effect of a completed access, reported to the coherence monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub req: CpuRequest,
    /// value read, the old value for read-modify-writes
    pub loaded: u64,
    pub stored: Option<u64>,
}

pub struct Sequencer {
    id: MachineId,
    block_bits: u32,
    max_outstanding: usize,
    issue_latency: Cycle,
    deadlock_threshold: Cycle,
    outstanding: BTreeMap<LineAddr, Outstanding>,
    responses: Vec<CpuResponse>,
    stats: SequencerStats,
}

impl Sequencer {
    pub fn new(
        id: MachineId,
        block_bits: u32,
        max_outstanding: usize,
        issue_latency: Cycle,
        deadlock_threshold: Cycle,
    ) -> Self {
        Self {
            id,
            block_bits,
            max_outstanding,
            issue_latency,
            deadlock_threshold,
            outstanding: BTreeMap::new(),
            responses: Vec::new(),
            stats: SequencerStats::default(),
        }
    }

    pub fn block_bits(&self) -> u32 {
        self.block_bits
    }

    pub fn stats(&self) -> SequencerStats {
        self.stats
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Lines with an outstanding request and the cycle it was issued.
    pub fn in_flight(&self) -> Vec<(LineAddr, Cycle)> {
        self.outstanding.iter().map(|(line, o)| (*line, o.issued_at)).collect()
    }

    /// Operation waiting on `line`, if any.
    pub fn pending_op(&self, line: LineAddr) -> Option<MemOp> {
        self.outstanding.get(&line).map(|o| o.req.op)
    }

    /// Admits `req` into the mandatory queue. A rejected request is not
    /// recorded and must be retried by the core.
    pub fn make_request(
        &mut self,
        req: CpuRequest,
        now: Cycle,
        mandatory_queue: &mut MessageBuffer<CpuRequest>,
        map: &AddressMap,
    ) -> Result<(), RequestStatus> {
        let line = req.addr.line(self.block_bits);
        let status = if !map.contains(req.addr.0) {
            Some(RequestStatus::OutOfRange)
        } else if self.outstanding.len() >= self.max_outstanding || !mandatory_queue.has_slots(1) {
            Some(RequestStatus::BufferFull)
        } else if self.outstanding.contains_key(&line) {
            Some(RequestStatus::Aliased)
        } else {
            None
        };
        if let Some(status) = status {
            trace!("{}: rejecting request {} to {}: {:?}", self.id, req.id, req.addr, status);
            self.stats.rejected += 1;
            return Err(status);
        }
        if mandatory_queue.enqueue(self.id, req, now + self.issue_latency).is_err() {
            self.stats.rejected += 1;
            return Err(RequestStatus::BufferFull);
        }
        self.outstanding.insert(line, Outstanding { req, issued_at: now });
        Ok(())
    }

    /// Performs the access waiting on `line` against `data`. Loads only read
    /// `data`; stores and read-modify-writes update it.
    pub fn complete(
        &mut self,
        line: LineAddr,
        data: &mut DataBlock,
        hit: bool,
        now: Cycle,
    ) -> Result<Completion, ProtocolError> {
        let Outstanding { req, issued_at } =
            self.outstanding.remove(&line).ok_or_else(|| ProtocolError::CoherenceViolation {
                controller: self.id,
                line,
                detail: "completion without an outstanding request".to_string(),
            })?;
        let word = req.addr.word(self.block_bits);
        let old = data.read(word);
        let stored = match req.op {
            MemOp::Load => {
                self.stats.loads += 1;
                None
            }
            MemOp::Store(v) => {
                self.stats.stores += 1;
                Some(v)
            }
            MemOp::Rmw(op) => {
                self.stats.atomics += 1;
                Some(op.apply(old))
            }
        };
        if let Some(v) = stored {
            data.write(word, v);
        }
        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        let latency = now.saturating_sub(issued_at);
        self.stats.total_latency += latency;
        self.responses.push(CpuResponse::Done { id: req.id, addr: req.addr, value: old, latency, hit });
        Ok(Completion { req, loaded: old, stored })
    }

    pub fn take_responses(&mut self) -> Vec<CpuResponse> {
        std::mem::take(&mut self.responses)
    }

    /// Fails when a request has been outstanding longer than the threshold.
    pub fn check_deadlock(&self, now: Cycle) -> Result<(), ProtocolError> {
        if self.deadlock_threshold == 0 {
            return Ok(());
        }
        match self
            .outstanding
            .iter()
            .find(|(_, o)| now.saturating_sub(o.issued_at) > self.deadlock_threshold)
        {
            Some((line, o)) => {
                warn!("{}: request {} to {} outstanding since cycle {}", self.id, o.req.id, o.req.addr, o.issued_at);
                Err(ProtocolError::Deadlock {
                    controller: self.id,
                    line: *line,
                    issued_at: o.issued_at,
                    now,
                })
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Addr;
    use crate::message::RmwOp;

    fn setup(max_outstanding: usize) -> (Sequencer, MessageBuffer<CpuRequest>, AddressMap) {
        (
            Sequencer::new(MachineId::L1(0), 6, max_outstanding, 1, 100),
            MessageBuffer::unordered(16),
            AddressMap::new(0x10000, 1).unwrap(),
        )
    }

    fn req(id: u64, addr: u64, op: MemOp) -> CpuRequest {
        CpuRequest { id, addr: Addr(addr), op }
    }

    #[test]
    fn rejects_aliased_requests() {
        let (mut seq, mut q, map) = setup(4);
        seq.make_request(req(0, 0x100, MemOp::Load), 0, &mut q, &map).unwrap();
        assert_eq!(
            seq.make_request(req(1, 0x108, MemOp::Load), 0, &mut q, &map),
            Err(RequestStatus::Aliased)
        );
        assert!(seq.make_request(req(2, 0x140, MemOp::Load), 0, &mut q, &map).is_ok());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn bounds_outstanding_requests() {
        let (mut seq, mut q, map) = setup(1);
        seq.make_request(req(0, 0x0, MemOp::Load), 0, &mut q, &map).unwrap();
        assert_eq!(
            seq.make_request(req(1, 0x40, MemOp::Load), 0, &mut q, &map),
            Err(RequestStatus::BufferFull)
        );
        assert_eq!(
            seq.make_request(req(2, 0x10000, MemOp::Load), 0, &mut q, &map),
            Err(RequestStatus::OutOfRange)
        );
        assert_eq!(seq.stats().rejected, 2);
    }

    #[test]
    fn completes_accesses_against_the_line() {
        let (mut seq, mut q, map) = setup(4);
        let mut data = DataBlock::new(64);
        data.write(1, 40);
        seq.make_request(req(7, 0x48, MemOp::Rmw(RmwOp::FetchAdd(2))), 3, &mut q, &map).unwrap();
        let done = seq.complete(Addr(0x48).line(6), &mut data, false, 10).unwrap();
        assert_eq!(done.loaded, 40);
        assert_eq!(done.stored, Some(42));
        assert_eq!(data.read(1), 42);
        assert_eq!(
            seq.take_responses(),
            vec![CpuResponse::Done { id: 7, addr: Addr(0x48), value: 40, latency: 7, hit: false }]
        );
        assert!(seq.complete(Addr(0x48).line(6), &mut data, false, 10).is_err());
    }

    #[test]
    fn detects_stuck_requests() {
        let (mut seq, mut q, map) = setup(4);
        seq.make_request(req(0, 0x0, MemOp::Load), 0, &mut q, &map).unwrap();
        assert!(seq.check_deadlock(100).is_ok());
        assert!(matches!(seq.check_deadlock(101), Err(ProtocolError::Deadlock { issued_at: 0, .. })));
    }
}
