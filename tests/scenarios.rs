use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cachesim_dir::buffer::MessageBuffer;
use cachesim_dir::common::{Addr, DataBlock, LineAddr, MachineId};
use cachesim_dir::controller::{DirectoryController, DirectoryProtocol, L1Controller, L1Protocol};
use cachesim_dir::error::BufferError;
use cachesim_dir::message::{CpuRequest, CpuResponse, MemOp, MemRequest, MemResponse, Message, MessageKind, RmwOp};
use cachesim_dir::monitor::{lock, CoherenceMonitor, Discipline, SharedMonitor};
use cachesim_dir::{msi, tardis, Config, Protocol};

/// A handful of L1s and one directory wired together by hand: one cycle per
/// link hop, two cycles per memory read.
struct Rig<L, D> {
    l1s: Vec<L1Controller<L>>,
    dir: DirectoryController<D>,
    memory: BTreeMap<LineAddr, DataBlock>,
    wires: Vec<(u64, Message)>,
    reads: Vec<(u64, LineAddr)>,
    responses: Vec<Vec<CpuResponse>>,
    monitor: SharedMonitor,
    line_size: u64,
    now: u64,
    next_id: u64,
}

impl<L: L1Protocol, D: DirectoryProtocol> Rig<L, D> {
    fn new(config: &Config, discipline: Discipline) -> Self {
        let map = config.address_map().unwrap();
        let monitor = CoherenceMonitor::shared(discipline, config.block_bits(), true);
        Rig {
            l1s: (0..config.num_cpus)
                .map(|i| L1Controller::new(i, config, map, monitor.clone()).unwrap())
                .collect(),
            dir: DirectoryController::new(0, config, map, monitor.clone()).unwrap(),
            memory: BTreeMap::new(),
            wires: Vec::new(),
            reads: Vec::new(),
            responses: vec![Vec::new(); config.num_cpus],
            monitor,
            line_size: config.cache.line_size,
            now: 0,
            next_id: 0,
        }
    }

    fn issue(&mut self, core: usize, addr: u64, op: MemOp) {
        self.next_id += 1;
        let req = CpuRequest { id: self.next_id, addr: Addr(addr), op };
        self.l1s[core].cpu_request(req, self.now).unwrap();
    }

    fn step(&mut self) {
        let now = self.now;
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.wires).into_iter().partition(|(t, _)| *t <= now);
        self.wires = later;
        for (_, msg) in due {
            match msg.destination {
                MachineId::L1(i) => self.l1s[i].deliver(msg, now).unwrap(),
                MachineId::Directory(_) => self.dir.deliver(msg, now).unwrap(),
            }
        }
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.reads).into_iter().partition(|(t, _)| *t <= now);
        self.reads = later;
        for (_, addr) in due {
            let data = self.memory.get(&addr).cloned().unwrap_or_else(|| DataBlock::new(self.line_size));
            self.dir.deliver_memory(MemResponse { addr, data }, now).unwrap();
        }

        for (i, l1) in self.l1s.iter_mut().enumerate() {
            l1.wakeup(now).unwrap();
            self.responses[i].extend(l1.take_responses());
            self.wires.extend(l1.drain(now, 1).into_iter().map(|m| (now + 1, m)));
        }
        self.dir.wakeup(now).unwrap();
        let (msgs, mem) = self.dir.drain(now, 1);
        self.wires.extend(msgs.into_iter().map(|m| (now + 1, m)));
        for req in mem {
            match req {
                MemRequest::Write { addr, data } => {
                    self.memory.insert(addr, data);
                }
                MemRequest::Read { addr } => self.reads.push((now + 2, addr)),
            }
        }
        self.now += 1;
    }

    fn idle(&self) -> bool {
        self.wires.is_empty() && self.reads.is_empty() && !self.dir.is_busy() && self.l1s.iter().all(|l1| !l1.is_busy())
    }

    fn settle(&mut self) {
        for _ in 0..10_000 {
            if self.idle() {
                return;
            }
            self.step();
        }
        panic!("still busy at cycle {}", self.now);
    }

    fn last_value(&self, core: usize) -> u64 {
        match self.responses[core].last() {
            Some(CpuResponse::Done { value, .. }) => *value,
            other => panic!("core {core}: no completed access, got {other:?}"),
        }
    }

    /// Runs `ops` per core, one access in flight per core at a time.
    fn run_ops(&mut self, ops: Vec<Vec<(u64, MemOp)>>) {
        let mut queues = ops.into_iter().map(|q| q.into_iter()).collect::<Vec<_>>();
        let mut pending = vec![None; queues.len()];
        for _ in 0..200_000 {
            for core in 0..queues.len() {
                if pending[core].is_none() {
                    pending[core] = queues[core].next();
                }
                if self.l1s[core].sequencer.outstanding() == 0 {
                    if let Some((addr, op)) = pending[core].take() {
                        self.issue(core, addr, op);
                    }
                }
            }
            if pending.iter().all(Option::is_none) && self.idle() {
                return;
            }
            self.step();
        }
        panic!("workload did not drain by cycle {}", self.now);
    }
}

fn config(protocol: Protocol, num_cpus: usize) -> Config {
    Config { protocol, num_cpus, ..Config::default() }
}

const X: u64 = 0x40;

#[test]
fn msi_store_then_remote_load_shares_the_line() {
    let mut rig = Rig::<msi::MsiL1, msi::MsiDirectory>::new(&config(Protocol::Msi, 2), Discipline::Swmr);
    let line = LineAddr(X);

    rig.issue(0, X, MemOp::Store(7));
    rig.settle();
    assert_eq!(rig.l1s[0].protocol.state(line), msi::L1State::M);
    assert_eq!(rig.dir.protocol.state(line), msi::DirState::M);
    assert_eq!(rig.dir.protocol.owner(line), Some(MachineId::L1(0)));

    rig.issue(1, X, MemOp::Load);
    rig.settle();
    assert_eq!(rig.last_value(1), 7);
    assert_eq!(rig.l1s[0].protocol.state(line), msi::L1State::S);
    assert_eq!(rig.l1s[1].protocol.state(line), msi::L1State::S);
    assert_eq!(rig.dir.protocol.state(line), msi::DirState::S);
    assert_eq!(rig.dir.protocol.sharers(line), vec![MachineId::L1(0), MachineId::L1(1)]);
    assert_eq!(rig.memory[&line].read(0), 7);
}

#[test]
fn msi_racing_store_and_load_both_complete() {
    let mut rig = Rig::<msi::MsiL1, msi::MsiDirectory>::new(&config(Protocol::Msi, 2), Discipline::Swmr);
    rig.issue(0, X, MemOp::Store(3));
    rig.issue(1, X, MemOp::Load);
    rig.settle();

    assert_eq!(rig.responses[0].len(), 1);
    assert_eq!(rig.responses[1].len(), 1);
    // the store's GetM reaches the directory first
    assert_eq!(rig.last_value(1), 3);
    assert_eq!(rig.dir.protocol.state(LineAddr(X)), msi::DirState::S);
}

#[test]
fn msi_store_invalidates_every_sharer() {
    let mut rig = Rig::<msi::MsiL1, msi::MsiDirectory>::new(&config(Protocol::Msi, 3), Discipline::Swmr);
    let line = LineAddr(X);
    rig.issue(0, X, MemOp::Load);
    rig.issue(1, X, MemOp::Load);
    rig.settle();
    assert_eq!(rig.dir.protocol.sharers(line).len(), 2);

    rig.issue(2, X + 8, MemOp::Rmw(RmwOp::FetchAdd(5)));
    rig.settle();
    assert_eq!(rig.l1s[0].protocol.state(line), msi::L1State::I);
    assert_eq!(rig.l1s[1].protocol.state(line), msi::L1State::I);
    assert_eq!(rig.l1s[2].protocol.state(line), msi::L1State::M);
    assert_eq!(rig.dir.protocol.owner(line), Some(MachineId::L1(2)));
    assert_eq!(lock(&rig.monitor).latest(Addr(X + 8)), 5);
}

#[test]
fn tardis_store_then_remote_load_shares_the_line() {
    let mut rig = Rig::<tardis::TardisL1, tardis::TardisDirectory>::new(&config(Protocol::Tardis, 2), Discipline::Leased);
    let line = LineAddr(X);

    rig.issue(0, X, MemOp::Store(7));
    rig.settle();
    assert_eq!(rig.l1s[0].protocol.state(line), tardis::L1State::M);
    assert_eq!(rig.dir.protocol.state(line), tardis::DirState::M);

    rig.issue(1, X, MemOp::Load);
    rig.settle();
    assert_eq!(rig.last_value(1), 7);
    assert_eq!(rig.l1s[0].protocol.state(line), tardis::L1State::S);
    assert_eq!(rig.l1s[1].protocol.state(line), tardis::L1State::S);
    assert_eq!(rig.dir.protocol.state(line), tardis::DirState::S);
    assert_eq!(rig.dir.protocol.owner(line), None);
    assert_eq!(rig.memory[&line].read(0), 7);

    // the reader's lease must cover the point it read at
    let lease = rig.l1s[1].protocol.lease_of(line).unwrap();
    assert!(lease.covers(rig.l1s[1].protocol.pts()));
    assert!(rig.dir.protocol.lease_of(line).rts >= lease.rts);
}

#[test]
fn tardis_racing_store_and_load_both_complete() {
    let mut rig = Rig::<tardis::TardisL1, tardis::TardisDirectory>::new(&config(Protocol::Tardis, 2), Discipline::Leased);
    rig.issue(0, X, MemOp::Store(3));
    rig.issue(1, X, MemOp::Load);
    rig.settle();

    assert_eq!(rig.responses[0].len(), 1);
    assert_eq!(rig.responses[1].len(), 1);
    assert_eq!(rig.last_value(1), 3);
}

fn random_ops(seed: u64, cores: usize, per_core: usize, lines: &[u64]) -> (Vec<Vec<(u64, MemOp)>>, BTreeMap<u64, u64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut adds = BTreeMap::new();
    let ops = (0..cores)
        .map(|_| {
            (0..per_core)
                .map(|_| {
                    let line = lines[rng.gen_range(0..lines.len())];
                    if rng.gen_bool(0.4) {
                        *adds.entry(line).or_insert(0) += 1;
                        (line, MemOp::Rmw(RmwOp::FetchAdd(1)))
                    } else {
                        (line, MemOp::Load)
                    }
                })
                .collect()
        })
        .collect();
    (ops, adds)
}

fn tiny_cache(protocol: Protocol, send_evictions: bool) -> Config {
    let mut config = config(protocol, 4);
    // two sets of one way each
    config.cache.size = 128;
    config.cache.assoc = 1;
    config.send_evictions = Some(send_evictions);
    config
}

// all four lines map to the same set
const CONFLICTING: [u64; 4] = [0x000, 0x080, 0x100, 0x180];

fn contended_lines<L: L1Protocol, D: DirectoryProtocol>(config: &Config, discipline: Discipline) {
    for seed in 0..8 {
        let mut rig = Rig::<L, D>::new(config, discipline);
        let (ops, adds) = random_ops(seed, 4, 60, &CONFLICTING);
        rig.run_ops(ops);

        let monitor = lock(&rig.monitor);
        for (line, n) in adds {
            assert_eq!(monitor.latest(Addr(line)), n, "seed {seed}, line {line:#x}");
        }
        assert!(rig.l1s.iter().all(|l1| l1.sequencer.stats().completed() == 60));
        assert!(rig.l1s.iter().all(|l1| l1.stats().evictions > 0));
    }
}

#[test]
fn msi_contended_lines_with_evictions_stay_coherent() {
    contended_lines::<msi::MsiL1, msi::MsiDirectory>(&tiny_cache(Protocol::Msi, true), Discipline::Swmr);
}

#[test]
fn msi_contended_lines_with_silent_evictions_stay_coherent() {
    contended_lines::<msi::MsiL1, msi::MsiDirectory>(&tiny_cache(Protocol::Msi, false), Discipline::Swmr);
}

#[test]
fn tardis_contended_lines_with_evictions_stay_coherent() {
    contended_lines::<tardis::TardisL1, tardis::TardisDirectory>(
        &tiny_cache(Protocol::Tardis, false),
        Discipline::Leased,
    );
}

#[test]
fn tardis_contended_lines_with_eviction_notices_stay_coherent() {
    contended_lines::<tardis::TardisL1, tardis::TardisDirectory>(
        &tiny_cache(Protocol::Tardis, true),
        Discipline::Leased,
    );
}

#[test]
fn contended_lines_one_transition_per_cycle() {
    let mut config = tiny_cache(Protocol::Msi, true);
    config.buffers.transitions_per_cycle = 1;
    config.buffers.l1_out = 2;
    contended_lines::<msi::MsiL1, msi::MsiDirectory>(&config, Discipline::Swmr);
    config.protocol = Protocol::Tardis;
    contended_lines::<tardis::TardisL1, tardis::TardisDirectory>(&config, Discipline::Leased);
}

#[test]
fn full_inbound_buffer_refuses_only_its_own_network() {
    let mut config = config(Protocol::Msi, 2);
    config.buffers.inbound = 1;
    let map = config.address_map().unwrap();
    let monitor = CoherenceMonitor::shared(Discipline::Swmr, config.block_bits(), true);
    let mut l1 = L1Controller::<msi::MsiL1>::new(0, &config, map, monitor.clone()).unwrap();
    let mut dir = DirectoryController::<msi::MsiDirectory>::new(0, &config, map, monitor).unwrap();
    let (me, home) = (MachineId::L1(0), MachineId::Directory(0));

    let inv = Message::new(MessageKind::Inv, LineAddr(X), home, me).with_requestor(MachineId::L1(1));
    assert!(l1.can_accept(&inv));
    l1.deliver(inv.clone(), 0).unwrap();
    assert!(!l1.can_accept(&inv));
    assert!(l1.can_accept(&Message::new(MessageKind::Data, LineAddr(X), home, me)));

    let gets = Message::new(MessageKind::GetS, LineAddr(X), me, home);
    dir.deliver(gets.clone(), 0).unwrap();
    assert!(!dir.can_accept(&gets));
    assert!(dir.can_accept(&Message::new(MessageKind::InvAck, LineAddr(X), me, home)));
    // the directory drains its request buffer and takes the next one
    dir.wakeup(1).unwrap();
    assert!(dir.can_accept(&gets));
}

#[test]
fn mandatory_queue_of_four_rejects_the_fifth() {
    let mut queue = MessageBuffer::ordered(4);
    for id in 0..4 {
        let req = CpuRequest { id, addr: Addr(id * 64), op: MemOp::Load };
        queue.enqueue(MachineId::L1(0), req, 0).unwrap();
    }
    let fifth = CpuRequest { id: 4, addr: Addr(0x100), op: MemOp::Load };
    assert_eq!(
        queue.enqueue(MachineId::L1(0), fifth, 0),
        Err(BufferError::Overflow { capacity: 4 })
    );
    assert_eq!(queue.len(), 4);
}
