use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use asynchronix::model::{Model, Output};
use asynchronix::time::Scheduler;

use super::Shared;
use crate::common::cycle_of;
use crate::controller::{DirectoryController, DirectoryProtocol};
use crate::message::{MemRequest, MemResponse, Message};
use crate::monitor::{lock, FaultLatch};
use crate::stats::DirectoryStats;

pub struct DirectoryNode<P: DirectoryProtocol> {
    controller: DirectoryController<P>,
    bandwidth: usize,
    pub o_network: Output<Message>,
    pub o_memory: Output<MemRequest>,
    faults: FaultLatch,
    busy: Arc<AtomicBool>,
    stats: Shared<DirectoryStats>,
    diagnostics: Shared<Vec<String>>,
}

impl<P: DirectoryProtocol> DirectoryNode<P> {
    pub fn new(
        controller: DirectoryController<P>,
        bandwidth: usize,
        faults: FaultLatch,
        busy: Arc<AtomicBool>,
        stats: Shared<DirectoryStats>,
        diagnostics: Shared<Vec<String>>,
    ) -> Self {
        Self {
            controller,
            bandwidth,
            o_network: Output::new(),
            o_memory: Output::new(),
            faults,
            busy,
            stats,
            diagnostics,
        }
    }

    fn update_busy(&self) {
        self.busy.store(self.controller.is_busy(), Ordering::Relaxed);
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

    pub async fn on_memory_response(&mut self, resp: MemResponse, scheduler: &Scheduler<Self>) {
        let now = cycle_of(scheduler.time());
        if let Err(e) = self.controller.deliver_memory(resp, now) {
            self.faults.raise(e);
        }
        self.update_busy();
    }

    pub async fn on_tick(&mut self, _: (), scheduler: &Scheduler<Self>) {
        let now = cycle_of(scheduler.time());
        if let Err(e) = self.controller.wakeup(now) {
            self.faults.raise(e);
        }
        let (msgs, mem) = self.controller.drain(now, self.bandwidth);
        for req in mem {
            self.o_memory.send(req).await;
        }
        for msg in msgs {
            self.o_network.send(msg).await;
        }
        self.update_busy();
    }

    pub async fn on_report(&mut self) {
        lock(&self.stats).controller = self.controller.stats();
        let id = self.controller.id();
        lock(&self.diagnostics).extend(self.controller.in_flight().into_iter().map(|s| format!("{id}: {s}")));
    }
}

impl<P: DirectoryProtocol> Model for DirectoryNode<P> {}
