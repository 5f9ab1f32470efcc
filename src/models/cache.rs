use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use asynchronix::model::{Model, Output};
use asynchronix::time::Scheduler;

use super::Shared;
use crate::common::cycle_of;
use crate::controller::{L1Controller, L1Protocol};
use crate::message::{CpuRequest, CpuResponse, Message};
use crate::monitor::{lock, FaultLatch};
use crate::stats::CoreStats;

/// An L1 controller and its sequencer.
pub struct CacheNode<P: L1Protocol> {
    controller: L1Controller<P>,
    bandwidth: usize,
    pub o_response: Output<CpuResponse>,
    pub o_network: Output<Message>,
    faults: FaultLatch,
    busy: Arc<AtomicBool>,
    stats: Shared<CoreStats>,
    diagnostics: Shared<Vec<String>>,
}

impl<P: L1Protocol> CacheNode<P> {
    pub fn new(
        controller: L1Controller<P>,
        bandwidth: usize,
        faults: FaultLatch,
        busy: Arc<AtomicBool>,
        stats: Shared<CoreStats>,
        diagnostics: Shared<Vec<String>>,
    ) -> Self {
        Self {
            controller,
            bandwidth,
            o_response: Output::new(),
            o_network: Output::new(),
            faults,
            busy,
            stats,
            diagnostics,
        }
    }

    fn update_busy(&self) {
        self.busy.store(self.controller.is_busy(), Ordering::Relaxed);
    }

    pub async fn on_cpu_request(&mut self, req: CpuRequest, scheduler: &Scheduler<Self>) {
        let now = cycle_of(scheduler.time());
        if let Err(status) = self.controller.cpu_request(req, now) {
            self.o_response.send(CpuResponse::Rejected { request: req, status }).await;
        }
        self.update_busy();
    }

    /// Returns `false`, leaving the message with the network, when its
    /// inbound buffer is full.
    pub async fn on_message(&mut self, msg: Message, scheduler: &Scheduler<Self>) -> bool {
        if !self.controller.can_accept(&msg) {
            return false;
        }
        let now = cycle_of(scheduler.time());
        if let Err(e) = self.controller.deliver(msg, now) {
            self.faults.raise(e);
        }
        self.update_busy();
        true
    }

    pub async fn on_tick(&mut self, _: (), scheduler: &Scheduler<Self>) {
        let now = cycle_of(scheduler.time());
        if let Err(e) = self.controller.wakeup(now) {
            self.faults.raise(e);
        }
        for resp in self.controller.take_responses() {
            self.o_response.send(resp).await;
        }
        for msg in self.controller.drain(now, self.bandwidth) {
            self.o_network.send(msg).await;
        }
        self.update_busy();
    }

    pub async fn on_report(&mut self) {
        {
            let mut stats = lock(&self.stats);
            stats.sequencer = self.controller.sequencer.stats();
            stats.l1 = self.controller.stats();
            stats.mandatory_queue = self.controller.mandatory_queue.stats();
        }
        lock(&self.diagnostics).extend(self.controller.in_flight());
    }
}

impl<P: L1Protocol> Model for CacheNode<P> {}
