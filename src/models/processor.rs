use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use asynchronix::model::{Model, Output};
use asynchronix::time::Scheduler;
use log::{debug, info, warn};

use super::Shared;
use crate::common::{cycle_of, cycles, MachineId};
use crate::message::{CpuRequest, CpuResponse, MemOp, RequestStatus};
use crate::monitor::lock;
use crate::stats::CoreStats;
use crate::workload::{Instr, Next, Workload};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Idle,
    Computing,
    /// waiting for outstanding accesses before a fence retires
    Fencing,
    Done,
}

/// A core running one workload. It issues at most one instruction per
/// cycle and keeps issuing while earlier accesses are outstanding.
pub struct Processor {
    id: MachineId,
    state: ProcState,
    workload: Box<dyn Workload>,
    pub o_request: Output<CpuRequest>,
    next_id: u64,
    outstanding: usize,
    retry: Option<CpuRequest>,
    retired: u64,
    done: Arc<AtomicBool>,
    stats: Shared<CoreStats>,
}

impl Processor {
    pub fn new(index: usize, workload: Box<dyn Workload>, done: Arc<AtomicBool>, stats: Shared<CoreStats>) -> Self {
        Processor {
            id: MachineId::L1(index),
            state: ProcState::Idle,
            workload,
            o_request: Output::new(),
            next_id: 0,
            outstanding: 0,
            retry: None,
            retired: 0,
            done,
            stats,
        }
    }

    async fn issue(&mut self, req: CpuRequest) {
        self.outstanding += 1;
        self.o_request.send(req).await;
    }

    async fn resume(&mut self) {
        self.state = ProcState::Idle;
    }

    pub async fn on_tick(&mut self, _: (), scheduler: &Scheduler<Self>) {
        match self.state {
            ProcState::Computing | ProcState::Done => return,
            ProcState::Fencing if self.outstanding > 0 => return,
            ProcState::Fencing => {
                self.retired += 1;
                self.state = ProcState::Idle;
            }
            ProcState::Idle => {}
        }
        if let Some(req) = self.retry.take() {
            self.issue(req).await;
            return;
        }
        let (addr, op) = match self.workload.next() {
            Next::Op(Instr::Load(addr)) => (addr, MemOp::Load),
            Next::Op(Instr::Store(addr, v)) => (addr, MemOp::Store(v)),
            Next::Op(Instr::Rmw(addr, rmw)) => (addr, MemOp::Rmw(rmw)),
            Next::Op(Instr::Fence) => {
                if self.outstanding == 0 {
                    self.retired += 1;
                } else {
                    self.state = ProcState::Fencing;
                }
                return;
            }
            Next::Op(Instr::Compute(n)) => {
                self.retired += 1;
                if n > 1 {
                    self.state = ProcState::Computing;
                    let at = scheduler.time() + cycles(n - 1);
                    if let Err(e) = scheduler.schedule_event(at, Self::resume, ()) {
                        warn!("{}: cannot schedule end of computation: {e:?}", self.id);
                        self.state = ProcState::Idle;
                    }
                }
                return;
            }
            Next::Wait => return,
            Next::Done => {
                if self.outstanding == 0 {
                    info!("{}: done at cycle {} after {} instructions", self.id, cycle_of(scheduler.time()), self.retired);
                    self.state = ProcState::Done;
                    self.done.store(true, Ordering::Relaxed);
                }
                return;
            }
        };
        let req = CpuRequest { id: self.next_id, addr, op };
        self.next_id += 1;
        self.issue(req).await;
    }

    pub async fn on_response(&mut self, resp: CpuResponse) {
        self.outstanding = self.outstanding.saturating_sub(1);
        match resp {
            CpuResponse::Done { addr, value, .. } => {
                self.retired += 1;
                self.workload.complete(addr, value);
            }
            CpuResponse::Rejected { request, status: RequestStatus::OutOfRange } => {
                warn!("{}: dropping access to {} outside physical memory", self.id, request.addr);
            }
            CpuResponse::Rejected { request, status } => {
                debug!("{}: request {} rejected ({status:?}), retrying", self.id, request.id);
                self.retry = Some(request);
            }
        }
    }

    pub async fn on_report(&mut self) {
        lock(&self.stats).retired = self.retired;
    }
}

impl Model for Processor {}
