use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use asynchronix::model::{Model, Requestor};
use asynchronix::time::Scheduler;
use log::{error, trace};

use super::Shared;
use crate::common::{cycles, Cycle, MachineId};
use crate::error::ProtocolError;
use crate::message::{Message, VirtualNetwork};
use crate::monitor::{lock, FaultLatch};
use crate::stats::NetworkStats;

/// Point-to-point interconnect with a fixed link latency. Messages sent in
/// the same cycle between the same pair of controllers arrive in order.
///
/// A destination refuses a message when the inbound buffer it goes to is
/// full. The network then holds it, and everything behind it for the same
/// buffer, and offers them again every cycle.
pub struct Network {
    link_latency: Cycle,
    pub o_l1: Vec<Requestor<Message, bool>>,
    pub o_dir: Vec<Requestor<Message, bool>>,
    in_transit: usize,
    held: BTreeMap<(MachineId, VirtualNetwork), VecDeque<Message>>,
    retry_scheduled: bool,
    faults: FaultLatch,
    busy: Arc<AtomicBool>,
    stats: NetworkStats,
    shared: Shared<NetworkStats>,
}

impl Network {
    pub fn new(
        num_l1s: usize,
        num_dirs: usize,
        link_latency: Cycle,
        faults: FaultLatch,
        busy: Arc<AtomicBool>,
        shared: Shared<NetworkStats>,
    ) -> Self {
        Network {
            link_latency,
            o_l1: (0..num_l1s).map(|_| Requestor::new()).collect(),
            o_dir: (0..num_dirs).map(|_| Requestor::new()).collect(),
            in_transit: 0,
            held: BTreeMap::new(),
            retry_scheduled: false,
            faults,
            busy,
            stats: NetworkStats::default(),
            shared,
        }
    }

    fn update_busy(&self) {
        let busy = self.in_transit > 0 || self.retry_scheduled || !self.held.is_empty();
        self.busy.store(busy, Ordering::Relaxed);
    }

    /// Offers `msg` to its destination. Returns `false` if it was refused.
    async fn offer(&mut self, msg: &Message) -> bool {
        let port = match msg.destination {
            MachineId::L1(i) => self.o_l1.get_mut(i),
            MachineId::Directory(i) => self.o_dir.get_mut(i),
        };
        let Some(port) = port else {
            self.faults.raise(ProtocolError::Misrouted { controller: msg.destination, line: msg.addr });
            return true;
        };
        let accepted = port.send(msg.clone()).await.next().unwrap_or(false);
        if accepted {
            self.stats.delivered += 1;
        } else {
            self.stats.refused += 1;
        }
        accepted
    }

    fn schedule_retry(&mut self, scheduler: &Scheduler<Self>) {
        if self.retry_scheduled {
            return;
        }
        let at = scheduler.time() + cycles(1);
        match scheduler.schedule_event(at, Self::retry, ()) {
            Ok(()) => self.retry_scheduled = true,
            Err(e) => error!("network: cannot schedule redelivery: {e:?}"),
        }
    }

    async fn deliver(&mut self, msg: Message, scheduler: &Scheduler<Self>) {
        self.in_transit = self.in_transit.saturating_sub(1);
        let key = (msg.destination, msg.vnet());
        let blocked = self.held.get(&key).is_some_and(|q| !q.is_empty());
        if blocked || !self.offer(&msg).await {
            trace!("network: holding {:?} {} for {}", msg.kind, msg.addr, msg.destination);
            self.held.entry(key).or_default().push_back(msg);
            self.schedule_retry(scheduler);
        }
        self.update_busy();
    }

    async fn retry(&mut self, _: (), scheduler: &Scheduler<Self>) {
        self.retry_scheduled = false;
        let keys = self.held.keys().copied().collect::<Vec<_>>();
        for key in keys {
            while let Some(msg) = self.held.get(&key).and_then(|q| q.front()).cloned() {
                if !self.offer(&msg).await {
                    break;
                }
                if let Some(queue) = self.held.get_mut(&key) {
                    queue.pop_front();
                }
            }
        }
        self.held.retain(|_, q| !q.is_empty());
        if !self.held.is_empty() {
            self.schedule_retry(scheduler);
        }
        self.update_busy();
    }

    pub async fn on_message(&mut self, msg: Message, scheduler: &Scheduler<Self>) {
        trace!("network: {:?} {} {} -> {}", msg.kind, msg.addr, msg.sender, msg.destination);
        self.stats.count(msg.vnet());
        let at = scheduler.time() + cycles(self.link_latency);
        match scheduler.schedule_event(at, Self::deliver, msg) {
            Ok(()) => self.in_transit += 1,
            Err(e) => error!("network: cannot schedule delivery: {e:?}"),
        }
        self.update_busy();
    }

    pub async fn on_report(&mut self) {
        *lock(&self.shared) = self.stats;
    }
}

impl Model for Network {}
