//! Assembly and cycle loop of a whole simulated system.
//!
//! The loop follows a fixed order every cycle: tick every processor, then
//! every L1, then every directory, then advance time by one cycle, which
//! fires the link and memory deliveries due at the next cycle. Each
//! `send_event` runs to completion before the next starts, so a run is
//! fully deterministic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use asynchronix::simulation::{Address, Mailbox, SimInit, Simulation};
use asynchronix::time::MonotonicTime;
use log::{info, warn};

use crate::common::{cycle_of, cycles};
use crate::config::{Config, Protocol};
use crate::controller::{DirectoryController, DirectoryProtocol, L1Controller, L1Protocol};
use crate::error::{ConfigError, SimError};
use crate::models::{shared, CacheNode, DirectoryNode, Memory, Network, Processor, Shared};
use crate::monitor::{lock, CoherenceMonitor, Discipline, FaultLatch, SharedMonitor};
use crate::msi::{MsiDirectory, MsiL1};
use crate::stats::{Check, CoreStats, DirectoryStats, NetworkStats, Report};
use crate::tardis::{TardisDirectory, TardisL1};
use crate::workload;

/// Runs the configured workload to completion.
pub fn run(config: &Config) -> Result<Report, SimError> {
    config.validate()?;
    info!(
        "simulating {} with {} cpus and {} directories, workload {:?}",
        config.protocol, config.num_cpus, config.num_dirs, config.workload
    );
    match config.protocol {
        Protocol::Msi => System::<MsiL1, MsiDirectory>::build(config, Discipline::Swmr)?.run(),
        Protocol::Tardis => System::<TardisL1, TardisDirectory>::build(config, Discipline::Leased)?.run(),
    }
}

struct System<L: L1Protocol, D: DirectoryProtocol> {
    config: Config,
    sim: Simulation,
    processors: Vec<Address<Processor>>,
    caches: Vec<Address<CacheNode<L>>>,
    directories: Vec<Address<DirectoryNode<D>>>,
    memories: Vec<Address<Memory>>,
    network: Address<Network>,
    done: Vec<Arc<AtomicBool>>,
    busy: Vec<Arc<AtomicBool>>,
    faults: FaultLatch,
    monitor: SharedMonitor,
    core_stats: Vec<Shared<CoreStats>>,
    dir_stats: Vec<Shared<DirectoryStats>>,
    net_stats: Shared<NetworkStats>,
    diagnostics: Shared<Vec<String>>,
}

impl<L: L1Protocol, D: DirectoryProtocol> System<L, D> {
    fn build(config: &Config, discipline: Discipline) -> Result<Self, ConfigError> {
        let map = config.address_map()?;
        let n = config.num_cpus;
        let d = config.num_dirs;
        let bandwidth = config.buffers.link_bandwidth;
        let monitor = CoherenceMonitor::shared(discipline, config.block_bits(), config.check_coherence);
        let faults = FaultLatch::default();
        let diagnostics = shared(Vec::new());
        let flag = || Arc::new(AtomicBool::new(false));

        let done = (0..n).map(|_| flag()).collect::<Vec<_>>();
        let mut busy = Vec::new();
        let core_stats = (0..n).map(|_| shared(CoreStats::default())).collect::<Vec<_>>();
        let dir_stats = (0..d).map(|_| shared(DirectoryStats::default())).collect::<Vec<_>>();
        let net_stats = shared(NetworkStats::default());

        // create models
        let mut procs = workload::build(config)?
            .into_iter()
            .enumerate()
            .map(|(i, w)| Processor::new(i, w, done[i].clone(), core_stats[i].clone()))
            .collect::<Vec<_>>();
        let mut caches = Vec::with_capacity(n);
        for i in 0..n {
            let controller = L1Controller::<L>::new(i, config, map, monitor.clone())?;
            busy.push(flag());
            caches.push(CacheNode::new(
                controller,
                bandwidth,
                faults.clone(),
                busy[busy.len() - 1].clone(),
                core_stats[i].clone(),
                diagnostics.clone(),
            ));
        }
        let mut dirs = Vec::with_capacity(d);
        let mut mems = Vec::with_capacity(d);
        for j in 0..d {
            let controller = DirectoryController::<D>::new(j, config, map, monitor.clone())?;
            busy.push(flag());
            dirs.push(DirectoryNode::new(
                controller,
                bandwidth,
                faults.clone(),
                busy[busy.len() - 1].clone(),
                dir_stats[j].clone(),
                diagnostics.clone(),
            ));
            busy.push(flag());
            mems.push(Memory::new(
                config.cache.line_size,
                config.latency.memory,
                busy[busy.len() - 1].clone(),
                dir_stats[j].clone(),
            ));
        }
        busy.push(flag());
        let mut network = Network::new(
            n,
            d,
            config.latency.link,
            faults.clone(),
            busy[busy.len() - 1].clone(),
            net_stats.clone(),
        );

        // create mailboxes
        let procs_mbox = procs.iter().map(|_| Mailbox::<Processor>::new()).collect::<Vec<_>>();
        let caches_mbox = caches.iter().map(|_| Mailbox::<CacheNode<L>>::new()).collect::<Vec<_>>();
        let dirs_mbox = dirs.iter().map(|_| Mailbox::<DirectoryNode<D>>::new()).collect::<Vec<_>>();
        let mems_mbox = mems.iter().map(|_| Mailbox::<Memory>::new()).collect::<Vec<_>>();
        let net_mbox = Mailbox::<Network>::new();

        // connect models
        for i in 0..n {
            procs[i].o_request.connect(CacheNode::<L>::on_cpu_request, &caches_mbox[i]);
            caches[i].o_response.connect(Processor::on_response, &procs_mbox[i]);
            caches[i].o_network.connect(Network::on_message, &net_mbox);
            network.o_l1[i].connect(CacheNode::<L>::on_message, &caches_mbox[i]);
        }
        for j in 0..d {
            dirs[j].o_network.connect(Network::on_message, &net_mbox);
            dirs[j].o_memory.connect(Memory::on_request, &mems_mbox[j]);
            mems[j].o_response.connect(DirectoryNode::<D>::on_memory_response, &dirs_mbox[j]);
            network.o_dir[j].connect(DirectoryNode::<D>::on_message, &dirs_mbox[j]);
        }

        // addresses
        let processors = procs_mbox.iter().map(|mb| mb.address()).collect();
        let cache_addrs = caches_mbox.iter().map(|mb| mb.address()).collect();
        let dir_addrs = dirs_mbox.iter().map(|mb| mb.address()).collect();
        let memories = mems_mbox.iter().map(|mb| mb.address()).collect();
        let network_addr = net_mbox.address();

        // initialize simulation
        let mut simi = SimInit::new().add_model(network, net_mbox);
        for (p, mb) in procs.drain(..).zip(procs_mbox) {
            simi = simi.add_model(p, mb);
        }
        for (c, mb) in caches.drain(..).zip(caches_mbox) {
            simi = simi.add_model(c, mb);
        }
        for (dir, mb) in dirs.drain(..).zip(dirs_mbox) {
            simi = simi.add_model(dir, mb);
        }
        for (m, mb) in mems.drain(..).zip(mems_mbox) {
            simi = simi.add_model(m, mb);
        }
        let sim = simi.init(MonotonicTime::EPOCH);

        Ok(Self {
            config: config.clone(),
            sim,
            processors,
            caches: cache_addrs,
            directories: dir_addrs,
            memories,
            network: network_addr,
            done,
            busy,
            faults,
            monitor,
            core_stats,
            dir_stats,
            net_stats,
            diagnostics,
        })
    }

    fn finished(&self) -> bool {
        self.done.iter().all(|d| d.load(Ordering::Relaxed)) && !self.busy.iter().any(|b| b.load(Ordering::Relaxed))
    }

    fn tick(&mut self) {
        for addr in &self.processors {
            self.sim.send_event(Processor::on_tick, (), addr);
        }
        for addr in &self.caches {
            self.sim.send_event(CacheNode::<L>::on_tick, (), addr);
        }
        for addr in &self.directories {
            self.sim.send_event(DirectoryNode::<D>::on_tick, (), addr);
        }
        self.sim.step_by(cycles(1));
    }

    /// Has every model publish its statistics and diagnostics.
    fn collect(&mut self) {
        for addr in &self.processors {
            self.sim.send_event(Processor::on_report, (), addr);
        }
        for addr in &self.caches {
            self.sim.send_event(CacheNode::<L>::on_report, (), addr);
        }
        for addr in &self.directories {
            self.sim.send_event(DirectoryNode::<D>::on_report, (), addr);
        }
        for addr in &self.memories {
            self.sim.send_event(Memory::on_report, (), addr);
        }
        self.sim.send_event(Network::on_report, (), &self.network);
    }

    fn run(mut self) -> Result<Report, SimError> {
        let max_cycles = self.config.max_cycles;
        while !self.finished() && !self.faults.is_raised() && cycle_of(self.sim.time()) < max_cycles {
            self.tick();
        }
        let cycles = cycle_of(self.sim.time());
        self.collect();

        if let Some(err) = self.faults.take() {
            return Err(err.into());
        }
        if !self.finished() {
            let in_flight = std::mem::take(&mut *lock(&self.diagnostics));
            warn!("giving up after {cycles} cycles with {} transactions in flight", in_flight.len());
            return Err(SimError::Timeout { max_cycles, in_flight });
        }
        info!("finished in {cycles} cycles");

        let checks = {
            let monitor = lock(&self.monitor);
            workload::expectations(&self.config)
                .into_iter()
                .map(|(addr, expected)| Check { addr, expected, actual: monitor.latest(addr) })
                .collect::<Vec<_>>()
        };
        for check in checks.iter().filter(|c| !c.passed()) {
            warn!("{}: expected {}, found {}", check.addr, check.expected, check.actual);
        }
        Ok(Report {
            protocol: self.config.protocol,
            cycles,
            cores: self.core_stats.iter().map(|s| *lock(s)).collect(),
            directories: self.dir_stats.iter().map(|s| *lock(s)).collect(),
            network: *lock(&self.net_stats),
            checks,
        })
    }
}
