use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use asynchronix::model::{Model, Output};
use asynchronix::time::Scheduler;
use log::{error, trace};

use super::Shared;
use crate::common::{cycles, Cycle, DataBlock, LineAddr};
use crate::message::{MemRequest, MemResponse};
use crate::monitor::lock;
use crate::stats::{DirectoryStats, MemoryStats};

/// Backing store of one directory's region. Writes take effect on arrival;
/// reads return the contents at arrival after the access latency.
pub struct Memory {
    line_size: u64,
    latency: Cycle,
    lines: BTreeMap<LineAddr, DataBlock>,
    pending: usize,
    pub o_response: Output<MemResponse>,
    busy: Arc<AtomicBool>,
    stats: MemoryStats,
    shared: Shared<DirectoryStats>,
}

impl Memory {
    pub fn new(line_size: u64, latency: Cycle, busy: Arc<AtomicBool>, shared: Shared<DirectoryStats>) -> Self {
        Memory {
            line_size,
            latency,
            lines: BTreeMap::new(),
            pending: 0,
            o_response: Output::new(),
            busy,
            stats: MemoryStats::default(),
            shared,
        }
    }

    async fn respond(&mut self, resp: MemResponse) {
        self.pending = self.pending.saturating_sub(1);
        self.busy.store(self.pending > 0, Ordering::Relaxed);
        self.o_response.send(resp).await;
    }

    pub async fn on_request(&mut self, req: MemRequest, scheduler: &Scheduler<Self>) {
        match req {
            MemRequest::Write { addr, data } => {
                trace!("memory: write {addr}");
                self.stats.writes += 1;
                self.lines.insert(addr, data);
            }
            MemRequest::Read { addr } => {
                trace!("memory: read {addr}");
                self.stats.reads += 1;
                let data = self
                    .lines
                    .get(&addr)
                    .cloned()
                    .unwrap_or_else(|| DataBlock::new(self.line_size));
                let at = scheduler.time() + cycles(self.latency);
                match scheduler.schedule_event(at, Self::respond, MemResponse { addr, data }) {
                    Ok(()) => self.pending += 1,
                    Err(e) => error!("memory: cannot schedule read of {addr}: {e:?}"),
                }
            }
        }
        self.busy.store(self.pending > 0, Ordering::Relaxed);
    }

    pub async fn on_report(&mut self) {
        lock(&self.shared).memory = self.stats;
    }
}

impl Model for Memory {}
