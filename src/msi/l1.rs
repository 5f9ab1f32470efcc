use std::collections::BTreeMap;

use log::trace;

use crate::cache_memory::CacheMemory;
use crate::common::{DataBlock, LineAddr, MachineId};
use crate::config::Config;
use crate::controller::{L1Context, L1Protocol, Step};
use crate::error::{ConfigError, ProtocolError};
use crate::message::{CpuRequest, MemOp, Message, MessageKind};
use crate::monitor::Perm;
use crate::sequencer::Completion;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L1State {
    I,
    S,
    M,
    /// GetS sent, waiting for data
    IsD,
    /// invalidated while waiting for data, use it once
    IsDI,
    /// GetM sent from I, waiting for data
    ImD,
    /// GetM sent from S, waiting for data
    SmD,
    /// PutM sent, waiting for PutAck
    MiA,
    /// PutS sent, waiting for PutAck
    SiA,
    /// put raced with a forward or invalidation, waiting for PutAck
    IiA,
}

#[derive(Clone, Debug)]
struct Line {
    state: L1State,
    data: DataBlock,
}

pub struct MsiL1 {
    cache: CacheMemory<Line>,
    // lines being evicted, no longer occupying a way
    tbes: BTreeMap<LineAddr, Line>,
    block_bits: u32,
    line_size: u64,
    send_evictions: bool,
}

impl MsiL1 {
    pub fn new(size: u64, assoc: usize, line_size: u64, send_evictions: bool) -> Result<Self, ConfigError> {
        Ok(Self {
            cache: CacheMemory::new(size, assoc, line_size)?,
            tbes: BTreeMap::new(),
            block_bits: line_size.trailing_zeros(),
            line_size,
            send_evictions,
        })
    }

    pub fn state(&self, line: LineAddr) -> L1State {
        self.tbes
            .get(&line)
            .or_else(|| self.cache.lookup(line))
            .map_or(L1State::I, |l| l.state)
    }

    pub fn data(&self, line: LineAddr) -> Option<&DataBlock> {
        self.cache.lookup(line).map(|l| &l.data)
    }

    fn set_state(&mut self, line: LineAddr, state: L1State) {
        if let Some(entry) = self.tbes.get_mut(&line) {
            entry.state = state;
        } else if let Some(entry) = self.cache.lookup_mut(line) {
            entry.state = state;
        }
    }

    fn entry_mut(&mut self, ctx: &L1Context<'_>, line: LineAddr) -> Result<&mut Line, ProtocolError> {
        self.cache.lookup_mut(line).ok_or_else(|| ProtocolError::CoherenceViolation {
            controller: ctx.me,
            line,
            detail: "line not present".to_string(),
        })
    }

    fn report(ctx: &L1Context<'_>, done: &Completion) -> Result<(), ProtocolError> {
        ctx.monitor().record(ctx.me, done, None)
    }

    fn hit(&mut self, ctx: &mut L1Context<'_>, line: LineAddr) -> Result<Step, ProtocolError> {
        self.cache.touch(line);
        let entry = self.entry_mut(ctx, line)?;
        let done = ctx.sequencer.complete(line, &mut entry.data, true, ctx.now)?;
        Self::report(ctx, &done)?;
        Ok(Step::Done)
    }

    /// Frees the way held by `victim`, writing it back when modified.
    fn evict(&mut self, ctx: &mut L1Context<'_>, victim: LineAddr) -> Result<(), ProtocolError> {
        let Some(entry) = self.cache.deallocate(victim) else {
            return Ok(());
        };
        trace!("{}: evicting {} in {:?}", ctx.me, victim, entry.state);
        ctx.monitor().release(ctx.me, victim);
        ctx.stats.evictions += 1;
        let home = ctx.home(victim)?;
        match entry.state {
            L1State::M => {
                ctx.stats.writebacks += 1;
                ctx.send_request(Message::new(MessageKind::PutM, victim, ctx.me, home).with_data(entry.data.clone()))?;
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

    fn respond(ctx: &mut L1Context<'_>, kind: MessageKind, msg: &Message, to: MachineId, data: Option<&DataBlock>) -> Result<(), ProtocolError> {
        let mut reply = Message::new(kind, msg.addr, ctx.me, to);
        if let Some(data) = data {
            reply = reply.with_data(data.clone());
        }
        ctx.send_response(reply)
    }
}

impl L1Protocol for MsiL1 {
    fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(
            config.cache.size,
            config.cache.assoc,
            config.cache.line_size,
            config.send_evictions(),
        )
    }

    fn cpu_request(&mut self, ctx: &mut L1Context<'_>, req: &CpuRequest) -> Result<Step, ProtocolError> {
        let line = req.addr.line(self.block_bits);
        if self.tbes.contains_key(&line) {
            return Ok(Step::Stall);
        }
        let home = ctx.home(line)?;
        if let Some(entry) = self.cache.lookup(line) {
            return match (entry.state, req.op) {
                (L1State::M, _) | (L1State::S, MemOp::Load) => self.hit(ctx, line),
                (L1State::S, _) => {
                    if !ctx.can_request(1) {
                        return Ok(Step::Stall);
                    }
                    ctx.send_request(Message::new(MessageKind::GetM, line, ctx.me, home))?;
                    self.set_state(line, L1State::SmD);
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
        let entry = Line { state, data: DataBlock::new(self.line_size) };
        if self.cache.allocate(line, entry).is_err() {
            return Err(ProtocolError::CoherenceViolation {
                controller: ctx.me,
                line,
                detail: "no way free after eviction".to_string(),
            });
        }
        ctx.send_request(Message::new(kind, line, ctx.me, home))?;
        Ok(Step::Done)
    }

    fn forward(&mut self, ctx: &mut L1Context<'_>, msg: &Message) -> Result<Step, ProtocolError> {
        let line = msg.addr;
        let state = self.state(line);
        let dir = msg.sender;
        match (msg.kind, state) {
            (MessageKind::Inv, _) if !ctx.can_respond(1) => return Ok(Step::Stall),
            (MessageKind::Inv, L1State::S) => {
                Self::respond(ctx, MessageKind::InvAck, msg, dir, None)?;
                self.cache.deallocate(line);
                ctx.monitor().release(ctx.me, line);
            }
            (MessageKind::Inv, L1State::SmD) => {
                Self::respond(ctx, MessageKind::InvAck, msg, dir, None)?;
                self.set_state(line, L1State::ImD);
                ctx.monitor().release(ctx.me, line);
            }
            (MessageKind::Inv, L1State::IsD) => {
                Self::respond(ctx, MessageKind::InvAck, msg, dir, None)?;
                self.set_state(line, L1State::IsDI);
            }
            (MessageKind::Inv, L1State::SiA) => {
                Self::respond(ctx, MessageKind::InvAck, msg, dir, None)?;
                self.set_state(line, L1State::IiA);
            }
            // the copy was dropped silently or is already on its way out
            (MessageKind::Inv, L1State::I | L1State::ImD | L1State::IiA) => {
                Self::respond(ctx, MessageKind::InvAck, msg, dir, None)?;
            }
            (MessageKind::FwdGetS | MessageKind::FwdGetM, L1State::ImD | L1State::SmD) => return Ok(Step::Stall),
            (MessageKind::FwdGetS, L1State::M | L1State::MiA) => {
                if !ctx.can_respond(2) {
                    return Ok(Step::Stall);
                }
                let data = match state {
                    L1State::M => self.cache.lookup(line).map(|l| l.data.clone()),
                    _ => self.tbes.get(&line).map(|l| l.data.clone()),
                };
                Self::respond(ctx, MessageKind::Data, msg, msg.requestor, data.as_ref())?;
                Self::respond(ctx, MessageKind::Data, msg, dir, data.as_ref())?;
                if state == L1State::M {
                    self.set_state(line, L1State::S);
                    ctx.monitor().acquire(ctx.me, line, Perm::Read)?;
                } else {
                    self.set_state(line, L1State::SiA);
                }
            }
            (MessageKind::FwdGetM, L1State::M | L1State::MiA) => {
                if !ctx.can_respond(1) {
                    return Ok(Step::Stall);
                }
                if state == L1State::M {
                    let data = self.cache.deallocate(line).map(|l| l.data);
                    Self::respond(ctx, MessageKind::Data, msg, msg.requestor, data.as_ref())?;
                    ctx.monitor().release(ctx.me, line);
                } else {
                    let data = self.tbes.get(&line).map(|l| l.data.clone());
                    Self::respond(ctx, MessageKind::Data, msg, msg.requestor, data.as_ref())?;
                    self.set_state(line, L1State::IiA);
                }
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
        let data = match (msg.kind, &msg.data) {
            (MessageKind::Data, Some(data)) => data.clone(),
            _ => return Err(ctx.unexpected(line, state, msg.kind)),
        };
        match state {
            L1State::IsD => {
                self.cache.touch(line);
                let entry = self.entry_mut(ctx, line)?;
                entry.data = data;
                entry.state = L1State::S;
                let done = ctx.sequencer.complete(line, &mut entry.data, false, ctx.now)?;
                ctx.monitor().acquire(ctx.me, line, Perm::Read)?;
                Self::report(ctx, &done)?;
            }
            L1State::IsDI => {
                // ordered before the write that invalidated it, not checked
                // against the latest value
                let mut data = data;
                ctx.sequencer.complete(line, &mut data, false, ctx.now)?;
                self.cache.deallocate(line);
            }
            L1State::ImD | L1State::SmD => {
                self.cache.touch(line);
                let entry = self.entry_mut(ctx, line)?;
                entry.data = data;
                entry.state = L1State::M;
                ctx.monitor().acquire(ctx.me, line, Perm::Write)?;
                let entry = self.entry_mut(ctx, line)?;
                let done = ctx.sequencer.complete(line, &mut entry.data, false, ctx.now)?;
                Self::report(ctx, &done)?;
            }
            _ => return Err(ctx.unexpected(line, state, msg.kind)),
        }
        Ok(Step::Done)
    }

    fn describe(&self, line: LineAddr) -> String {
        format!("{:?}", self.state(line))
    }
}
