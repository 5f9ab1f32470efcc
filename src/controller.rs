//! Protocol-independent controller shells.
//!
//! An L1 or directory controller owns its message buffers and drives a
//! protocol state machine over them: each wakeup it picks the highest
//! priority input buffer with a ready message, hands the message to the
//! protocol and dequeues it once the transition is taken. A protocol that
//! cannot act yet (transient line, missing outbound slots) stalls, which
//! leaves the message queued and blocks that buffer until the next wakeup.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::MutexGuard;

use log::{debug, trace};

use crate::buffer::MessageBuffer;
use crate::common::{AddressMap, Cycle, DataBlock, LineAddr, MachineId};
use crate::config::Config;
use crate::error::{BufferError, ConfigError, ProtocolError};
use crate::message::{CpuRequest, CpuResponse, MemRequest, MemResponse, Message, MessageKind, RequestStatus, VirtualNetwork};
use crate::monitor::{lock, CoherenceMonitor, SharedMonitor};
use crate::sequencer::Sequencer;

/// Outcome of offering a message to a protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Done,
    Stall,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct L1Stats {
    pub transitions: u64,
    pub stalls: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirStats {
    pub requests: u64,
    pub transitions: u64,
    pub stalls: u64,
    pub forwards: u64,
    pub invalidations: u64,
    pub memory_reads: u64,
    pub memory_writes: u64,
    pub queued: u64,
}

fn port_error(controller: MachineId, port: &'static str) -> impl FnOnce(BufferError) -> ProtocolError {
    move |source| ProtocolError::Port { controller, port, source }
}

/// What an L1 protocol transition may touch besides its own state.
pub struct L1Context<'a> {
    pub now: Cycle,
    pub me: MachineId,
    pub map: &'a AddressMap,
    pub request_to_dir: &'a mut MessageBuffer<Message>,
    pub response_to_dir_or_sibling: &'a mut MessageBuffer<Message>,
    pub sequencer: &'a mut Sequencer,
    pub monitor: &'a SharedMonitor,
    pub stats: &'a mut L1Stats,
}

impl L1Context<'_> {
    pub fn home(&self, line: LineAddr) -> Result<MachineId, ProtocolError> {
        self.map.home(line).ok_or(ProtocolError::Misrouted { controller: self.me, line })
    }

    pub fn can_request(&self, n: usize) -> bool {
        self.request_to_dir.has_slots(n)
    }

    pub fn can_respond(&self, n: usize) -> bool {
        self.response_to_dir_or_sibling.has_slots(n)
    }

    pub fn send_request(&mut self, msg: Message) -> Result<(), ProtocolError> {
        trace!("{}: {:?} {} -> {}", self.me, msg.kind, msg.addr, msg.destination);
        self.request_to_dir
            .enqueue(self.me, msg, self.now)
            .map_err(port_error(self.me, "request_to_dir"))
    }

    pub fn send_response(&mut self, msg: Message) -> Result<(), ProtocolError> {
        trace!("{}: {:?} {} -> {}", self.me, msg.kind, msg.addr, msg.destination);
        self.response_to_dir_or_sibling
            .enqueue(self.me, msg, self.now)
            .map_err(port_error(self.me, "response_to_dir_or_sibling"))
    }

    pub fn monitor(&self) -> MutexGuard<'_, CoherenceMonitor> {
        lock(self.monitor)
    }

    pub fn unexpected(&self, line: LineAddr, state: impl std::fmt::Debug, kind: MessageKind) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            controller: self.me,
            line,
            state: format!("{state:?}"),
            kind,
        }
    }
}

pub trait L1Protocol: Send + Sized + 'static {
    fn from_config(config: &Config) -> Result<Self, ConfigError>;

    /// A CPU request reached the head of the mandatory queue.
    fn cpu_request(&mut self, ctx: &mut L1Context<'_>, req: &CpuRequest) -> Result<Step, ProtocolError>;

    /// A forward, invalidation or put acknowledgement from a directory.
    fn forward(&mut self, ctx: &mut L1Context<'_>, msg: &Message) -> Result<Step, ProtocolError>;

    /// Data or an acknowledgement from a directory or sibling cache.
    fn response(&mut self, ctx: &mut L1Context<'_>, msg: &Message) -> Result<Step, ProtocolError>;

    /// State of `line` for diagnostics.
    fn describe(&self, line: LineAddr) -> String;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum L1Port {
    Response,
    Forward,
    Mandatory,
}

// wakeup priority
const L1_PORTS: [L1Port; 3] = [L1Port::Response, L1Port::Forward, L1Port::Mandatory];

pub struct L1Controller<P> {
    id: MachineId,
    map: AddressMap,
    transitions_per_cycle: usize,
    pub mandatory_queue: MessageBuffer<CpuRequest>,
    pub request_to_dir: MessageBuffer<Message>,
    pub response_to_dir_or_sibling: MessageBuffer<Message>,
    pub forward_from_dir: MessageBuffer<Message>,
    pub response_from_dir_or_sibling: MessageBuffer<Message>,
    pub sequencer: Sequencer,
    pub protocol: P,
    monitor: SharedMonitor,
    stats: L1Stats,
}

impl<P: L1Protocol> L1Controller<P> {
    pub fn new(index: usize, config: &Config, map: AddressMap, monitor: SharedMonitor) -> Result<Self, ConfigError> {
        let id = MachineId::L1(index);
        let buffers = &config.buffers;
        Ok(Self {
            id,
            map,
            transitions_per_cycle: buffers.transitions_per_cycle,
            mandatory_queue: MessageBuffer::unordered(buffers.mandatory),
            request_to_dir: MessageBuffer::unordered(buffers.l1_out),
            response_to_dir_or_sibling: MessageBuffer::unordered(buffers.l1_out),
            forward_from_dir: MessageBuffer::unordered(buffers.inbound),
            response_from_dir_or_sibling: MessageBuffer::unordered(buffers.inbound),
            sequencer: Sequencer::new(
                id,
                config.block_bits(),
                config.sequencer.max_outstanding,
                config.latency.l1_hit,
                config.sequencer.deadlock_threshold,
            ),
            protocol: P::from_config(config)?,
            monitor,
            stats: L1Stats::default(),
        })
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn stats(&self) -> L1Stats {
        self.stats
    }

    pub fn cpu_request(&mut self, req: CpuRequest, now: Cycle) -> Result<(), RequestStatus> {
        self.sequencer.make_request(req, now, &mut self.mandatory_queue, &self.map)
    }

    /// Whether the inbound buffer `msg` goes to has room for it.
    pub fn can_accept(&self, msg: &Message) -> bool {
        match msg.vnet() {
            VirtualNetwork::Forward => self.forward_from_dir.has_slots(1),
            VirtualNetwork::Response => self.response_from_dir_or_sibling.has_slots(1),
            VirtualNetwork::Request => true,
        }
    }

    /// Accepts a message from the interconnect.
    pub fn deliver(&mut self, msg: Message, now: Cycle) -> Result<(), ProtocolError> {
        let sender = msg.sender;
        match msg.vnet() {
            VirtualNetwork::Forward => self
                .forward_from_dir
                .enqueue(sender, msg, now)
                .map_err(port_error(self.id, "forward_from_dir")),
            VirtualNetwork::Response => self
                .response_from_dir_or_sibling
                .enqueue(sender, msg, now)
                .map_err(port_error(self.id, "response_from_dir_or_sibling")),
            VirtualNetwork::Request => Err(ProtocolError::UnexpectedMessage {
                controller: self.id,
                line: msg.addr,
                state: self.protocol.describe(msg.addr),
                kind: msg.kind,
            }),
        }
    }

    fn ready(&self, port: L1Port, now: Cycle) -> bool {
        match port {
            L1Port::Response => self.response_from_dir_or_sibling.is_ready(now),
            L1Port::Forward => self.forward_from_dir.is_ready(now),
            L1Port::Mandatory => self.mandatory_queue.is_ready(now),
        }
    }

    fn offer(&mut self, port: L1Port, now: Cycle) -> Result<Step, ProtocolError> {
        let Self {
            id,
            map,
            mandatory_queue,
            request_to_dir,
            response_to_dir_or_sibling,
            forward_from_dir,
            response_from_dir_or_sibling,
            sequencer,
            protocol,
            monitor,
            stats,
            ..
        } = self;
        let mut ctx = L1Context {
            now,
            me: *id,
            map,
            request_to_dir,
            response_to_dir_or_sibling,
            sequencer,
            monitor,
            stats,
        };
        match port {
            L1Port::Response => match response_from_dir_or_sibling.peek(now).cloned() {
                Some(msg) => protocol.response(&mut ctx, &msg),
                None => Ok(Step::Stall),
            },
            L1Port::Forward => match forward_from_dir.peek(now).cloned() {
                Some(msg) => protocol.forward(&mut ctx, &msg),
                None => Ok(Step::Stall),
            },
            L1Port::Mandatory => match mandatory_queue.peek(now).copied() {
                Some(req) => protocol.cpu_request(&mut ctx, &req),
                None => Ok(Step::Stall),
            },
        }
    }

    fn consume(&mut self, port: L1Port, now: Cycle) -> Result<(), ProtocolError> {
        let res = match port {
            L1Port::Response => self.response_from_dir_or_sibling.dequeue(now).map(drop),
            L1Port::Forward => self.forward_from_dir.dequeue(now).map(drop),
            L1Port::Mandatory => self.mandatory_queue.dequeue(now).map(drop),
        };
        res.map_err(port_error(self.id, "input"))
    }

    /// Processes up to `transitions_per_cycle` ready messages.
    pub fn wakeup(&mut self, now: Cycle) -> Result<(), ProtocolError> {
        let mut blocked = [false; L1_PORTS.len()];
        let mut budget = self.transitions_per_cycle;
        while budget > 0 {
            let Some(i) = (0..L1_PORTS.len()).find(|&i| !blocked[i] && self.ready(L1_PORTS[i], now)) else {
                break;
            };
            match self.offer(L1_PORTS[i], now)? {
                Step::Done => {
                    self.consume(L1_PORTS[i], now)?;
                    self.stats.transitions += 1;
                    budget -= 1;
                }
                Step::Stall => {
                    trace!("{}: {:?} port stalled", self.id, L1_PORTS[i]);
                    self.stats.stalls += 1;
                    blocked[i] = true;
                }
            }
        }
        self.sequencer.check_deadlock(now)
    }

    pub fn take_responses(&mut self) -> Vec<CpuResponse> {
        self.sequencer.take_responses()
    }

    /// Moves up to `bandwidth` messages per outbound buffer to the interconnect.
    pub fn drain(&mut self, now: Cycle, bandwidth: usize) -> Vec<Message> {
        let mut out = Vec::new();
        for buf in [&mut self.request_to_dir, &mut self.response_to_dir_or_sibling] {
            for _ in 0..bandwidth {
                match buf.dequeue(now) {
                    Ok(msg) => out.push(msg),
                    Err(_) => break,
                }
            }
        }
        out
    }

    /// Whether any message is still buffered.
    pub fn is_busy(&self) -> bool {
        self.sequencer.outstanding() > 0
            || !self.mandatory_queue.is_empty()
            || !self.request_to_dir.is_empty()
            || !self.response_to_dir_or_sibling.is_empty()
            || !self.forward_from_dir.is_empty()
            || !self.response_from_dir_or_sibling.is_empty()
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.sequencer
            .in_flight()
            .into_iter()
            .map(|(line, since)| {
                format!("{}: {} in {} since cycle {}", self.id, line, self.protocol.describe(line), since)
            })
            .collect()
    }
}

/// What a directory protocol transition may touch besides its own state.
pub struct DirContext<'a> {
    pub now: Cycle,
    pub me: MachineId,
    pub response_to_cache: &'a mut MessageBuffer<Message>,
    pub forward_to_cache: &'a mut MessageBuffer<Message>,
    pub request_to_memory: &'a mut MessageBuffer<MemRequest>,
    pub monitor: &'a SharedMonitor,
    pub stats: &'a mut DirStats,
}

impl DirContext<'_> {
    pub fn can_forward(&self, n: usize) -> bool {
        self.forward_to_cache.has_slots(n)
    }

    pub fn can_respond(&self, n: usize) -> bool {
        self.response_to_cache.has_slots(n)
    }

    pub fn can_access_memory(&self) -> bool {
        self.request_to_memory.has_slots(1)
    }

    pub fn send_response(&mut self, msg: Message) -> Result<(), ProtocolError> {
        trace!("{}: {:?} {} -> {}", self.me, msg.kind, msg.addr, msg.destination);
        self.response_to_cache
            .enqueue(self.me, msg, self.now)
            .map_err(port_error(self.me, "response_to_cache"))
    }

    pub fn send_forward(&mut self, msg: Message) -> Result<(), ProtocolError> {
        trace!("{}: {:?} {} -> {}", self.me, msg.kind, msg.addr, msg.destination);
        match msg.kind {
            MessageKind::Inv => self.stats.invalidations += 1,
            MessageKind::FwdGetS | MessageKind::FwdGetM => self.stats.forwards += 1,
            _ => {}
        }
        self.forward_to_cache
            .enqueue(self.me, msg, self.now)
            .map_err(port_error(self.me, "forward_to_cache"))
    }

    pub fn read_memory(&mut self, addr: LineAddr) -> Result<(), ProtocolError> {
        self.stats.memory_reads += 1;
        self.request_to_memory
            .enqueue(self.me, MemRequest::Read { addr }, self.now)
            .map_err(port_error(self.me, "request_to_memory"))
    }

    pub fn write_memory(&mut self, addr: LineAddr, data: DataBlock) -> Result<(), ProtocolError> {
        self.stats.memory_writes += 1;
        self.request_to_memory
            .enqueue(self.me, MemRequest::Write { addr, data }, self.now)
            .map_err(port_error(self.me, "request_to_memory"))
    }

    pub fn monitor(&self) -> MutexGuard<'_, CoherenceMonitor> {
        lock(self.monitor)
    }

    pub fn unexpected(&self, line: LineAddr, state: impl std::fmt::Debug, kind: MessageKind) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            controller: self.me,
            line,
            state: format!("{state:?}"),
            kind,
        }
    }
}

pub trait DirectoryProtocol: Send + Sized + 'static {
    fn from_config(config: &Config) -> Result<Self, ConfigError>;

    /// Whether `line` has a transaction in flight. Requests for busy lines
    /// are deferred by the controller and replayed in arrival order.
    fn busy(&self, line: LineAddr) -> bool;

    fn request(&mut self, ctx: &mut DirContext<'_>, msg: &Message) -> Result<Step, ProtocolError>;

    fn response(&mut self, ctx: &mut DirContext<'_>, msg: &Message) -> Result<Step, ProtocolError>;

    fn memory_response(&mut self, ctx: &mut DirContext<'_>, resp: &MemResponse) -> Result<Step, ProtocolError>;

    /// Transactions still in flight, for diagnostics.
    fn in_flight(&self) -> Vec<String>;
}

/// Requests deferred behind an in-flight transaction, per line.
#[derive(Default)]
struct Deferred {
    queues: BTreeMap<LineAddr, VecDeque<Message>>,
    ready: VecDeque<LineAddr>,
    scheduled: BTreeSet<LineAddr>,
}

impl Deferred {
    fn holds(&self, line: LineAddr) -> bool {
        self.queues.get(&line).is_some_and(|q| !q.is_empty())
    }

    fn defer(&mut self, msg: Message) {
        self.queues.entry(msg.addr).or_default().push_back(msg);
    }

    /// Schedules the deferred requests of `line` for replay.
    fn wake(&mut self, line: LineAddr) {
        if self.holds(line) && self.scheduled.insert(line) {
            self.ready.push_back(line);
        }
    }

    fn peek(&self) -> Option<&Message> {
        self.ready
            .front()
            .and_then(|line| self.queues.get(line))
            .and_then(|q| q.front())
    }

    fn pop(&mut self) -> Option<Message> {
        let line = self.ready.pop_front()?;
        self.scheduled.remove(&line);
        let queue = self.queues.get_mut(&line)?;
        let msg = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&line);
        }
        msg
    }

    fn len(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DirPort {
    Memory,
    Response,
    Replay,
    Request,
}

// wakeup priority
const DIR_PORTS: [DirPort; 4] = [DirPort::Memory, DirPort::Response, DirPort::Replay, DirPort::Request];

pub struct DirectoryController<P> {
    id: MachineId,
    map: AddressMap,
    transitions_per_cycle: usize,
    pub request_from_cache: MessageBuffer<Message>,
    pub response_from_cache: MessageBuffer<Message>,
    pub response_to_cache: MessageBuffer<Message>,
    pub forward_to_cache: MessageBuffer<Message>,
    pub request_to_memory: MessageBuffer<MemRequest>,
    pub response_from_memory: MessageBuffer<MemResponse>,
    deferred: Deferred,
    pub protocol: P,
    monitor: SharedMonitor,
    stats: DirStats,
}

impl<P: DirectoryProtocol> DirectoryController<P> {
    pub fn new(index: usize, config: &Config, map: AddressMap, monitor: SharedMonitor) -> Result<Self, ConfigError> {
        let buffers = &config.buffers;
        let region = map.region(index);
        debug!("directory {index} homes {:#x}..{:#x}", region.start, region.end);
        Ok(Self {
            id: MachineId::Directory(index),
            map,
            transitions_per_cycle: buffers.transitions_per_cycle,
            request_from_cache: MessageBuffer::ordered(buffers.inbound),
            response_from_cache: MessageBuffer::ordered(buffers.inbound),
            response_to_cache: MessageBuffer::unordered(buffers.dir_out),
            forward_to_cache: MessageBuffer::unordered(buffers.dir_out),
            request_to_memory: MessageBuffer::ordered(buffers.dir_out),
            response_from_memory: MessageBuffer::ordered(0),
            deferred: Deferred::default(),
            protocol: P::from_config(config)?,
            monitor,
            stats: DirStats::default(),
        })
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn stats(&self) -> DirStats {
        self.stats
    }

    pub fn can_accept(&self, msg: &Message) -> bool {
        match msg.vnet() {
            VirtualNetwork::Request => self.request_from_cache.has_slots(1),
            VirtualNetwork::Response => self.response_from_cache.has_slots(1),
            VirtualNetwork::Forward => true,
        }
    }

    pub fn deliver(&mut self, msg: Message, now: Cycle) -> Result<(), ProtocolError> {
        if self.map.home(msg.addr) != Some(self.id) {
            return Err(ProtocolError::Misrouted { controller: self.id, line: msg.addr });
        }
        let sender = msg.sender;
        match msg.vnet() {
            VirtualNetwork::Request => {
                self.stats.requests += 1;
                self.request_from_cache
                    .enqueue(sender, msg, now)
                    .map_err(port_error(self.id, "request_from_cache"))
            }
            VirtualNetwork::Response => self
                .response_from_cache
                .enqueue(sender, msg, now)
                .map_err(port_error(self.id, "response_from_cache")),
            VirtualNetwork::Forward => Err(ProtocolError::UnexpectedMessage {
                controller: self.id,
                line: msg.addr,
                state: "directory".to_string(),
                kind: msg.kind,
            }),
        }
    }

    pub fn deliver_memory(&mut self, resp: MemResponse, now: Cycle) -> Result<(), ProtocolError> {
        self.response_from_memory
            .enqueue(self.id, resp, now)
            .map_err(port_error(self.id, "response_from_memory"))
    }

    fn ready(&self, port: DirPort, now: Cycle) -> bool {
        match port {
            DirPort::Memory => self.response_from_memory.is_ready(now),
            DirPort::Response => self.response_from_cache.is_ready(now),
            DirPort::Replay => self.deferred.peek().is_some(),
            DirPort::Request => self.request_from_cache.is_ready(now),
        }
    }

    /// Offers the head of `port` to the protocol. Returns the step taken and
    /// the line it concerned.
    fn offer(&mut self, port: DirPort, now: Cycle) -> Result<(Step, Option<LineAddr>), ProtocolError> {
        let Self {
            id,
            request_from_cache,
            response_from_cache,
            response_to_cache,
            forward_to_cache,
            request_to_memory,
            response_from_memory,
            deferred,
            protocol,
            monitor,
            stats,
            ..
        } = self;
        let mut ctx = DirContext {
            now,
            me: *id,
            response_to_cache,
            forward_to_cache,
            request_to_memory,
            monitor,
            stats,
        };
        let (step, line) = match port {
            DirPort::Memory => match response_from_memory.peek(now).cloned() {
                Some(resp) => (protocol.memory_response(&mut ctx, &resp)?, Some(resp.addr)),
                None => (Step::Stall, None),
            },
            DirPort::Response => match response_from_cache.peek(now).cloned() {
                Some(msg) => (protocol.response(&mut ctx, &msg)?, Some(msg.addr)),
                None => (Step::Stall, None),
            },
            DirPort::Replay => match deferred.peek().cloned() {
                Some(msg) => {
                    trace!("{}: replaying {:?} {} from {}", id, msg.kind, msg.addr, msg.sender);
                    (protocol.request(&mut ctx, &msg)?, Some(msg.addr))
                }
                None => (Step::Stall, None),
            },
            DirPort::Request => match request_from_cache.peek(now).cloned() {
                Some(msg) => {
                    if protocol.busy(msg.addr) || deferred.holds(msg.addr) {
                        trace!("{}: deferring {:?} {} from {}", id, msg.kind, msg.addr, msg.sender);
                        ctx.stats.queued += 1;
                        deferred.defer(msg);
                        (Step::Done, None)
                    } else {
                        (protocol.request(&mut ctx, &msg)?, Some(msg.addr))
                    }
                }
                None => (Step::Stall, None),
            },
        };
        Ok((step, line))
    }

    fn consume(&mut self, port: DirPort, now: Cycle) -> Result<(), ProtocolError> {
        let res = match port {
            DirPort::Memory => self.response_from_memory.dequeue(now).map(drop),
            DirPort::Response => self.response_from_cache.dequeue(now).map(drop),
            DirPort::Replay => self.deferred.pop().map(drop).ok_or(BufferError::Empty),
            DirPort::Request => self.request_from_cache.dequeue(now).map(drop),
        };
        res.map_err(port_error(self.id, "input"))
    }

    pub fn wakeup(&mut self, now: Cycle) -> Result<(), ProtocolError> {
        let mut blocked = [false; DIR_PORTS.len()];
        let mut budget = self.transitions_per_cycle;
        while budget > 0 {
            let Some(i) = (0..DIR_PORTS.len()).find(|&i| !blocked[i] && self.ready(DIR_PORTS[i], now)) else {
                break;
            };
            let port = DIR_PORTS[i];
            match self.offer(port, now)? {
                (Step::Done, line) => {
                    self.consume(port, now)?;
                    self.stats.transitions += 1;
                    budget -= 1;
                    if let Some(line) = line.filter(|l| !self.protocol.busy(*l)) {
                        self.deferred.wake(line);
                    }
                }
                (Step::Stall, _) => {
                    trace!("{}: {:?} port stalled", self.id, port);
                    self.stats.stalls += 1;
                    blocked[i] = true;
                }
            }
        }
        Ok(())
    }

    pub fn drain(&mut self, now: Cycle, bandwidth: usize) -> (Vec<Message>, Vec<MemRequest>) {
        let mut msgs = Vec::new();
        for buf in [&mut self.response_to_cache, &mut self.forward_to_cache] {
            for _ in 0..bandwidth {
                match buf.dequeue(now) {
                    Ok(msg) => msgs.push(msg),
                    Err(_) => break,
                }
            }
        }
        let mut mem = Vec::new();
        for _ in 0..bandwidth {
            match self.request_to_memory.dequeue(now) {
                Ok(req) => mem.push(req),
                Err(_) => break,
            }
        }
        if !msgs.is_empty() || !mem.is_empty() {
            debug!("{}: {} messages, {} memory requests out", self.id, msgs.len(), mem.len());
        }
        (msgs, mem)
    }

    pub fn is_busy(&self) -> bool {
        self.deferred.len() > 0
            || !self.protocol.in_flight().is_empty()
            || !self.request_from_cache.is_empty()
            || !self.response_from_cache.is_empty()
            || !self.response_to_cache.is_empty()
            || !self.forward_to_cache.is_empty()
            || !self.request_to_memory.is_empty()
            || !self.response_from_memory.is_empty()
    }

    pub fn in_flight(&self) -> Vec<String> {
        let mut v = self.protocol.in_flight();
        if self.deferred.len() > 0 {
            v.push(format!("{} deferred requests", self.deferred.len()));
        }
        v
    }
}
