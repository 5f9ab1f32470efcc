use std::collections::BTreeMap;

use log::trace;

use crate::cache_memory::CacheMemory;
use crate::common::{DataBlock, LineAddr, Lease, Timestamp};
use crate::config::Config;
use crate::controller::{L1Context, L1Protocol, Step};
use crate::error::{ConfigError, ProtocolError};
use crate::message::{CpuRequest, MemOp, Message, MessageKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L1State {
    I,
    S,
    M,
    IsD,
    /// lease renewal sent from S
    SrD,
    ImD,
    SmD,
    MiA,
    SiA,
    IiA,
}

#[derive(Clone, Debug)]
struct Line {
    state: L1State,
    data: DataBlock,
    lease: Lease,
}

pub struct TardisL1 {
    cache: CacheMemory<Line>,
    tbes: BTreeMap<LineAddr, Line>,
    pts: Timestamp,
    lease: u64,
    self_increment_period: u64,
    served: u64,
    block_bits: u32,
    line_size: u64,
    send_evictions: bool,
}

impl TardisL1 {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let cache = &config.cache;
        Ok(Self {
            cache: CacheMemory::new(cache.size, cache.assoc, cache.line_size)?,
            tbes: BTreeMap::new(),
            pts: 0,
            lease: config.tardis.lease,
            self_increment_period: config.tardis.self_increment_period.max(1),
            served: 0,
            block_bits: config.block_bits(),
            line_size: cache.line_size,
            send_evictions: config.send_evictions(),
        })
    }

    pub fn pts(&self) -> Timestamp {
        self.pts
    }

    pub fn state(&self, line: LineAddr) -> L1State {
        self.tbes
            .get(&line)
            .or_else(|| self.cache.lookup(line))
            .map_or(L1State::I, |l| l.state)
    }

    pub fn lease_of(&self, line: LineAddr) -> Option<Lease> {
        self.cache.lookup(line).map(|l| l.lease)
    }

    pub fn data(&self, line: LineAddr) -> Option<&DataBlock> {
        self.cache.lookup(line).map(|l| &l.data)
    }

    fn missing(ctx: &L1Context<'_>, line: LineAddr) -> ProtocolError {
        ProtocolError::CoherenceViolation {
            controller: ctx.me,
            line,
            detail: "line not present".to_string(),
        }
    }

    /// Whether a load at the current `pts` may use `lease`.
    fn readable(&self, lease: Lease) -> bool {
        self.pts.max(lease.wts) <= lease.rts
    }

    /// Performs the pending access to `line`, which must be readable in S
    /// or held in M, and advances `pts` to the access timestamp.
    fn access(&mut self, ctx: &mut L1Context<'_>, line: LineAddr, hit: bool) -> Result<(), ProtocolError> {
        let op = ctx.sequencer.pending_op(line).ok_or_else(|| Self::missing(ctx, line))?;
        let entry = self.cache.lookup_mut(line).ok_or_else(|| Self::missing(ctx, line))?;
        let ts = match (entry.state, op) {
            (L1State::M, MemOp::Load) => {
                let ts = self.pts.max(entry.lease.wts);
                entry.lease.rts = entry.lease.rts.max(ts);
                ts
            }
            (L1State::M, _) => {
                let ts = self.pts.max(entry.lease.rts + 1);
                entry.lease = Lease { wts: ts, rts: ts };
                ts
            }
            (L1State::S, MemOp::Load) => self.pts.max(entry.lease.wts),
            (state, _) => {
                return Err(ProtocolError::CoherenceViolation {
                    controller: ctx.me,
                    line,
                    detail: format!("{op:?} performed in {state:?}"),
                })
            }
        };
        self.pts = ts;
        let done = ctx.sequencer.complete(line, &mut entry.data, hit, ctx.now)?;
        ctx.monitor().record(ctx.me, &done, Some(ts))?;
        self.cache.touch(line);

        self.served += 1;
        if self.served % self.self_increment_period == 0 {
            self.pts += 1;
        }
        Ok(())
    }

    fn request(&self, ctx: &mut L1Context<'_>, kind: MessageKind, line: LineAddr, held: Option<Lease>) -> Result<(), ProtocolError> {
        let home = ctx.home(line)?;
        let mut msg = Message::new(kind, line, ctx.me, home).with_pts(self.pts);
        if let Some(lease) = held {
            msg = msg.with_lease(lease);
        }
        ctx.send_request(msg)
    }

    fn set_state(&mut self, line: LineAddr, state: L1State) {
        if let Some(entry) = self.tbes.get_mut(&line) {
            entry.state = state;
        } else if let Some(entry) = self.cache.lookup_mut(line) {
            entry.state = state;
        }
    }

    fn evict(&mut self, ctx: &mut L1Context<'_>, victim: LineAddr) -> Result<(), ProtocolError> {
        let Some(entry) = self.cache.deallocate(victim) else {
            return Ok(());
        };
        trace!("{}: evicting {} in {:?} lease {:?}", ctx.me, victim, entry.state, entry.lease);
        ctx.stats.evictions += 1;
        let home = ctx.home(victim)?;
        match entry.state {
            L1State::M => {
                ctx.stats.writebacks += 1;
                ctx.send_request(
                    Message::new(MessageKind::PutM, victim, ctx.me, home)
                        .with_data(entry.data.clone())
                        .with_lease(entry.lease),
                )?;
                self.tbes.insert(victim, Line { state: L1State::MiA, ..entry });
            }
            L1State::S if self.send_evictions => {
                ctx.send_request(Message::new(MessageKind::PutS, victim, ctx.me, home))?;
                self.tbes.insert(victim, Line { state: L1State::SiA, ..entry });
            }
            _ => {}
        }
        Ok(())
    }

    /// Installs a shared copy with `lease` and serves the pending load,
    /// renewing again if the lease does not reach the current `pts`.
    fn fill_shared(
        &mut self,
        ctx: &mut L1Context<'_>,
        line: LineAddr,
        data: Option<DataBlock>,
        lease: Lease,
    ) -> Result<Step, ProtocolError> {
        let covered = self.readable(lease);
        if !covered && !ctx.can_request(1) {
            return Ok(Step::Stall);
        }
        let entry = self.cache.lookup_mut(line).ok_or_else(|| Self::missing(ctx, line))?;
        if let Some(data) = data {
            entry.data = data;
        }
        entry.lease = lease;
        if covered {
            entry.state = L1State::S;
            self.access(ctx, line, false)?;
        } else {
            trace!("{}: lease {:?} on {} behind pts {}, renewing", ctx.me, lease, line, self.pts);
            entry.state = L1State::SrD;
            self.request(ctx, MessageKind::GetS, line, Some(lease))?;
        }
        Ok(Step::Done)
    }

    fn write_back(ctx: &mut L1Context<'_>, msg: &Message, line: &Line) -> Result<(), ProtocolError> {
        ctx.send_response(
            Message::new(MessageKind::WbData, msg.addr, ctx.me, msg.sender)
                .with_requestor(msg.requestor)
                .with_data(line.data.clone())
                .with_lease(line.lease),
        )
    }
}

impl L1Protocol for TardisL1 {
    fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(config)
    }

    fn cpu_request(&mut self, ctx: &mut L1Context<'_>, req: &CpuRequest) -> Result<Step, ProtocolError> {
        let line = req.addr.line(self.block_bits);
        if self.tbes.contains_key(&line) {
            return Ok(Step::Stall);
        }
        if let Some(entry) = self.cache.lookup(line) {
            let (state, lease) = (entry.state, entry.lease);
            return match (state, req.op) {
                (L1State::M, _) => {
                    self.access(ctx, line, true)?;
                    Ok(Step::Done)
                }
                (L1State::S, MemOp::Load) if self.readable(lease) => {
                    self.access(ctx, line, true)?;
                    Ok(Step::Done)
                }
                (L1State::S, op) => {
                    if !ctx.can_request(1) {
                        return Ok(Step::Stall);
                    }
                    let (kind, next) = match op {
                        MemOp::Load => (MessageKind::GetS, L1State::SrD),
                        _ => (MessageKind::GetM, L1State::SmD),
                    };
                    trace!("{}: {:?} on {} with lease {:?} at pts {}", ctx.me, kind, line, lease, self.pts);
                    self.request(ctx, kind, line, Some(lease))?;
                    self.set_state(line, next);
                    Ok(Step::Done)
                }
                _ => Ok(Step::Stall),
            };
        }

        let victim = self.cache.victim(line);
        let mut needed = 1;
        if let Some(victim) = victim {
            match self.state(victim) {
                L1State::M => needed += 1,
                L1State::S if self.send_evictions => needed += 1,
                L1State::S => {}
                _ => return Ok(Step::Stall),
            }
        }
        if !ctx.can_request(needed) {
            return Ok(Step::Stall);
        }
        if let Some(victim) = victim {
            self.evict(ctx, victim)?;
        }
        let (kind, state) = match req.op {
            MemOp::Load => (MessageKind::GetS, L1State::IsD),
            _ => (MessageKind::GetM, L1State::ImD),
        };
        let entry = Line { state, data: DataBlock::new(self.line_size), lease: Lease::default() };
        if self.cache.allocate(line, entry).is_err() {
            return Err(ProtocolError::CoherenceViolation {
                controller: ctx.me,
                line,
                detail: "no way free after eviction".to_string(),
            });
        }
        self.request(ctx, kind, line, None)?;
        Ok(Step::Done)
    }

    fn forward(&mut self, ctx: &mut L1Context<'_>, msg: &Message) -> Result<Step, ProtocolError> {
        let line = msg.addr;
        let state = self.state(line);
        match (msg.kind, state) {
            (MessageKind::FwdGetS | MessageKind::FwdGetM, L1State::ImD | L1State::SmD) => return Ok(Step::Stall),
            (MessageKind::FwdGetS | MessageKind::FwdGetM, _) if !ctx.can_respond(1) => return Ok(Step::Stall),
            (MessageKind::FwdGetS, L1State::M) => {
                let req_pts = msg.pts.unwrap_or_default();
                let lease = self.lease;
                let entry = self.cache.lookup_mut(line).ok_or_else(|| Self::missing(ctx, line))?;
                entry.lease.rts = entry.lease.rts.max(entry.lease.wts + lease).max(req_pts + lease);
                entry.state = L1State::S;
                trace!("{}: downgrading {} with lease {:?}", ctx.me, line, entry.lease);
                Self::write_back(ctx, msg, entry)?;
            }
            (MessageKind::FwdGetM, L1State::M) => {
                let entry = self.cache.deallocate(line).ok_or_else(|| Self::missing(ctx, line))?;
                Self::write_back(ctx, msg, &entry)?;
            }
            (MessageKind::FwdGetS | MessageKind::FwdGetM, L1State::MiA) => {
                let entry = self.tbes.get_mut(&line).ok_or_else(|| Self::missing(ctx, line))?;
                entry.state = L1State::IiA;
                Self::write_back(ctx, msg, entry)?;
            }
            (MessageKind::PutAck, L1State::MiA | L1State::SiA | L1State::IiA) => {
                self.tbes.remove(&line);
            }
            _ => return Err(ctx.unexpected(line, state, msg.kind)),
        }
        Ok(Step::Done)
    }

    fn response(&mut self, ctx: &mut L1Context<'_>, msg: &Message) -> Result<Step, ProtocolError> {
        let line = msg.addr;
        let state = self.state(line);
        let Some(lease) = msg.lease else {
            return Err(ctx.unexpected(line, state, msg.kind));
        };
        match (msg.kind, state) {
            (MessageKind::Data, L1State::IsD | L1State::SrD) if msg.data.is_some() => {
                self.fill_shared(ctx, line, msg.data.clone(), lease)
            }
            (MessageKind::RenewAck, L1State::SrD) => {
                let held = self.lease_of(line).unwrap_or_default();
                let renewed = Lease { wts: held.wts, rts: held.rts.max(lease.rts) };
                self.fill_shared(ctx, line, None, renewed)
            }
            (MessageKind::Data, L1State::ImD | L1State::SmD) | (MessageKind::UpgradeAck, L1State::SmD) => {
                let entry = self.cache.lookup_mut(line).ok_or_else(|| Self::missing(ctx, line))?;
                if let Some(data) = &msg.data {
                    entry.data = data.clone();
                } else if msg.kind == MessageKind::Data {
                    return Err(ctx.unexpected(line, state, msg.kind));
                }
                entry.lease = lease;
                entry.state = L1State::M;
                self.access(ctx, line, false)?;
                Ok(Step::Done)
            }
            _ => Err(ctx.unexpected(line, state, msg.kind)),
        }
    }

    fn describe(&self, line: LineAddr) -> String {
        match self.lease_of(line) {
            Some(lease) => format!("{:?} [{}, {}] pts {}", self.state(line), lease.wts, lease.rts, self.pts),
            None => format!("{:?} pts {}", self.state(line), self.pts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Addr, MachineId};
    use crate::config::Protocol;
    use crate::controller::L1Controller;
    use crate::message::{CpuResponse, RmwOp};
    use crate::monitor::{lock, CoherenceMonitor, Discipline, SharedMonitor};

    const DIR: MachineId = MachineId::Directory(0);
    const ME: MachineId = MachineId::L1(0);
    const OTHER: MachineId = MachineId::L1(1);
    const X: LineAddr = LineAddr(0x40);
    const Y: LineAddr = LineAddr(0x80);

    fn config(period: u64) -> Config {
        let mut config = Config { protocol: Protocol::Tardis, ..Config::default() };
        config.cache.size = 256;
        config.cache.assoc = 2;
        config.tardis.self_increment_period = period;
        config
    }

    fn l1(period: u64) -> (L1Controller<TardisL1>, SharedMonitor) {
        let config = config(period);
        let monitor = CoherenceMonitor::shared(Discipline::Leased, config.block_bits(), true);
        let l1 = L1Controller::new(0, &config, config.address_map().unwrap(), monitor.clone()).unwrap();
        (l1, monitor)
    }

    fn req(id: u64, addr: u64, op: MemOp) -> CpuRequest {
        CpuRequest { id, addr: Addr(addr), op }
    }

    fn grant(kind: MessageKind, line: LineAddr, wts: u64, rts: u64, word0: Option<u64>) -> Message {
        let mut msg = Message::new(kind, line, DIR, ME).with_lease(Lease { wts, rts });
        if let Some(v) = word0 {
            let mut data = DataBlock::new(64);
            data.write(0, v);
            msg = msg.with_data(data);
        }
        msg
    }

    /// Runs one request to completion against a directory reply.
    fn miss(l1: &mut L1Controller<TardisL1>, r: CpuRequest, reply: Message, now: u64) -> Vec<Message> {
        l1.cpu_request(r, now).unwrap();
        l1.wakeup(now + 1).unwrap();
        let sent = l1.drain(now + 1, 4);
        l1.deliver(reply, now + 2).unwrap();
        l1.wakeup(now + 2).unwrap();
        sent
    }

    fn hit(l1: &mut L1Controller<TardisL1>, r: CpuRequest, now: u64) {
        l1.cpu_request(r, now).unwrap();
        l1.wakeup(now + 1).unwrap();
    }

    #[test]
    fn load_miss_carries_pts_and_lease_hits() {
        let (mut l1, _) = l1(8);
        let sent = miss(&mut l1, req(0, 0x40, MemOp::Load), grant(MessageKind::Data, X, 0, 10, Some(0)), 0);
        assert_eq!(sent.len(), 1);
        assert_eq!((sent[0].kind, sent[0].pts, sent[0].lease), (MessageKind::GetS, Some(0), None));
        assert_eq!(l1.protocol.state(X), L1State::S);

        hit(&mut l1, req(1, 0x48, MemOp::Load), 5);
        assert!(matches!(
            l1.take_responses()[..],
            [CpuResponse::Done { id: 0, hit: false, .. }, CpuResponse::Done { id: 1, hit: true, .. }]
        ));
        assert!(l1.drain(6, 4).is_empty());
    }

    #[test]
    fn expired_lease_is_renewed() {
        let (mut l1, _) = l1(1);
        miss(&mut l1, req(0, 0x40, MemOp::Load), grant(MessageKind::Data, X, 0, 2, Some(0)), 0);
        hit(&mut l1, req(1, 0x40, MemOp::Load), 3);
        hit(&mut l1, req(2, 0x40, MemOp::Load), 5);
        assert_eq!(l1.protocol.pts(), 3);

        let sent = miss(&mut l1, req(3, 0x40, MemOp::Load), grant(MessageKind::RenewAck, X, 0, 13, None), 7);
        assert_eq!(sent[0].kind, MessageKind::GetS);
        assert_eq!(sent[0].pts, Some(3));
        assert_eq!(sent[0].lease, Some(Lease { wts: 0, rts: 2 }));
        assert_eq!(l1.protocol.state(X), L1State::S);
        let lease = l1.protocol.lease_of(X).unwrap();
        assert!(lease.rts > 3);
        assert_eq!(l1.take_responses().len(), 4);
    }

    #[test]
    fn stale_grant_renews_again() {
        let (mut l1, _) = l1(1);
        miss(&mut l1, req(0, 0x40, MemOp::Load), grant(MessageKind::Data, X, 0, 100, Some(0)), 0);
        hit(&mut l1, req(1, 0x40, MemOp::Load), 3);
        hit(&mut l1, req(2, 0x40, MemOp::Load), 5);

        let sent = miss(&mut l1, req(3, 0x80, MemOp::Load), grant(MessageKind::Data, Y, 0, 2, Some(0)), 7);
        assert_eq!(sent[0].pts, Some(3));
        assert_eq!(l1.protocol.state(Y), L1State::SrD);
        let again = l1.drain(9, 4);
        assert_eq!(again.len(), 1);
        assert_eq!((again[0].kind, again[0].lease), (MessageKind::GetS, Some(Lease { wts: 0, rts: 2 })));

        l1.deliver(grant(MessageKind::RenewAck, Y, 0, 13, None), 10).unwrap();
        l1.wakeup(10).unwrap();
        assert_eq!(l1.protocol.state(Y), L1State::S);
        assert_eq!(l1.take_responses().len(), 4);
    }

    #[test]
    fn upgrade_commits_above_lease() {
        let (mut l1, monitor) = l1(8);
        miss(&mut l1, req(0, 0x40, MemOp::Load), grant(MessageKind::Data, X, 0, 10, Some(0)), 0);
        lock(&monitor).grant_lease(X, 10);

        let sent = miss(&mut l1, req(1, 0x40, MemOp::Store(7)), grant(MessageKind::UpgradeAck, X, 0, 10, None), 3);
        assert_eq!(sent[0].kind, MessageKind::GetM);
        assert_eq!(sent[0].lease, Some(Lease { wts: 0, rts: 10 }));
        assert_eq!(l1.protocol.state(X), L1State::M);
        assert_eq!(l1.protocol.pts(), 11);
        assert_eq!(l1.protocol.lease_of(X), Some(Lease { wts: 11, rts: 11 }));
        assert_eq!(lock(&monitor).latest(Addr(0x40)), 7);

        // a second store moves past the first
        hit(&mut l1, req(2, 0x40, MemOp::Rmw(RmwOp::FetchAdd(1))), 6);
        assert_eq!(l1.protocol.lease_of(X), Some(Lease { wts: 12, rts: 12 }));
        assert_eq!(lock(&monitor).latest(Addr(0x40)), 8);
    }

    #[test]
    fn forwarded_gets_extends_lease_and_writes_back() {
        let (mut l1, _) = l1(8);
        miss(&mut l1, req(0, 0x40, MemOp::Store(4)), grant(MessageKind::Data, X, 0, 0, Some(0)), 0);
        assert_eq!(l1.protocol.lease_of(X), Some(Lease { wts: 1, rts: 1 }));

        let fwd = Message::new(MessageKind::FwdGetS, X, DIR, ME).with_requestor(OTHER).with_pts(5);
        l1.deliver(fwd, 4).unwrap();
        l1.wakeup(4).unwrap();
        assert_eq!(l1.protocol.state(X), L1State::S);
        let out = l1.drain(4, 4);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].kind, out[0].destination, out[0].requestor), (MessageKind::WbData, DIR, OTHER));
        assert_eq!(out[0].lease, Some(Lease { wts: 1, rts: 15 }));
        assert_eq!(out[0].data.as_ref().map(|d| d.read(0)), Some(4));
    }

    #[test]
    fn evicted_owner_answers_forward_from_buffer() {
        let (mut l1, _) = l1(8);
        // 0x000, 0x080 and 0x100 share a set
        miss(&mut l1, req(0, 0x000, MemOp::Store(1)), grant(MessageKind::Data, LineAddr(0x000), 0, 0, Some(0)), 0);
        miss(&mut l1, req(1, 0x080, MemOp::Load), grant(MessageKind::Data, Y, 0, 50, Some(0)), 3);
        let sent = miss(&mut l1, req(2, 0x100, MemOp::Load), grant(MessageKind::Data, LineAddr(0x100), 0, 50, Some(0)), 6);
        assert_eq!(sent[0].kind, MessageKind::PutM);
        assert_eq!(sent[0].lease, Some(Lease { wts: 1, rts: 1 }));
        assert_eq!(l1.protocol.state(LineAddr(0x000)), L1State::MiA);

        let fwd = Message::new(MessageKind::FwdGetM, LineAddr(0x000), DIR, ME).with_requestor(OTHER);
        l1.deliver(fwd, 10).unwrap();
        l1.wakeup(10).unwrap();
        assert_eq!(l1.protocol.state(LineAddr(0x000)), L1State::IiA);
        assert_eq!(l1.drain(10, 4)[0].kind, MessageKind::WbData);

        l1.deliver(Message::new(MessageKind::PutAck, LineAddr(0x000), DIR, ME), 12).unwrap();
        l1.wakeup(12).unwrap();
        assert_eq!(l1.protocol.state(LineAddr(0x000)), L1State::I);
    }

    #[test]
    fn grant_without_lease_is_fatal() {
        let (mut l1, _) = l1(8);
        l1.cpu_request(req(0, 0x40, MemOp::Load), 0).unwrap();
        l1.wakeup(1).unwrap();
        let mut data = DataBlock::new(64);
        data.write(0, 1);
        l1.deliver(Message::new(MessageKind::Data, X, DIR, ME).with_data(data), 2).unwrap();
        assert!(matches!(l1.wakeup(2), Err(ProtocolError::UnexpectedMessage { .. })));
    }
}
