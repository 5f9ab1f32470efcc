use std::collections::{BTreeMap, BTreeSet};

use log::trace;

use crate::common::{DataBlock, LineAddr, MachineId};
use crate::config::Config;
use crate::controller::{DirContext, DirectoryProtocol, Step};
use crate::error::{ConfigError, ProtocolError};
use crate::message::{MemResponse, Message, MessageKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DirState {
    #[default]
    I,
    S,
    M,
    /// GetS forwarded to the owner, waiting for its data
    SD,
    /// GetS waiting for memory
    SMem,
    /// GetM waiting for memory and invalidation acks
    MMem,
}

#[derive(Debug)]
struct Transaction {
    requestor: MachineId,
    acks_pending: usize,
    data: Option<DataBlock>,
}

#[derive(Debug, Default)]
struct Entry {
    state: DirState,
    owner: Option<MachineId>,
    sharers: BTreeSet<MachineId>,
    tx: Option<Transaction>,
}

#[derive(Default)]
pub struct MsiDirectory {
    entries: BTreeMap<LineAddr, Entry>,
}

impl MsiDirectory {
    pub fn state(&self, line: LineAddr) -> DirState {
        self.entries.get(&line).map_or(DirState::I, |e| e.state)
    }

    pub fn owner(&self, line: LineAddr) -> Option<MachineId> {
        self.entries.get(&line).and_then(|e| e.owner)
    }

    pub fn sharers(&self, line: LineAddr) -> Vec<MachineId> {
        self.entries
            .get(&line)
            .map(|e| e.sharers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Completes a GetM once memory data and all acks are in.
    fn finish_getm(ctx: &mut DirContext<'_>, line: LineAddr, entry: &mut Entry) -> Result<(), ProtocolError> {
        let ready = entry.tx.as_ref().is_some_and(|tx| tx.acks_pending == 0 && tx.data.is_some());
        if !ready {
            return Ok(());
        }
        if let Some(Transaction { requestor, data: Some(data), .. }) = entry.tx.take() {
            ctx.send_response(Message::new(MessageKind::Data, line, ctx.me, requestor).with_data(data))?;
            entry.owner = Some(requestor);
            entry.state = DirState::M;
            trace!("{}: {} now owned by {}", ctx.me, line, requestor);
        }
        Ok(())
    }
}

impl DirectoryProtocol for MsiDirectory {
    fn from_config(_config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::default())
    }

    fn busy(&self, line: LineAddr) -> bool {
        self.entries.get(&line).is_some_and(|e| e.tx.is_some())
    }

    fn request(&mut self, ctx: &mut DirContext<'_>, msg: &Message) -> Result<Step, ProtocolError> {
        let line = msg.addr;
        let req = msg.sender;
        let entry = self.entries.entry(line).or_default();
        match (msg.kind, entry.state) {
            (MessageKind::GetS, DirState::I | DirState::S) => {
                if !ctx.can_access_memory() {
                    return Ok(Step::Stall);
                }
                ctx.read_memory(line)?;
                entry.tx = Some(Transaction { requestor: req, acks_pending: 0, data: None });
                entry.state = DirState::SMem;
            }
            (MessageKind::GetS, DirState::M) => {
                let owner = match entry.owner {
                    Some(owner) if owner != req => owner,
                    _ => return Err(ctx.unexpected(line, entry.state, msg.kind)),
                };
                if !ctx.can_forward(1) {
                    return Ok(Step::Stall);
                }
                ctx.send_forward(Message::new(MessageKind::FwdGetS, line, ctx.me, owner).with_requestor(req))?;
                entry.sharers = BTreeSet::from([owner, req]);
                entry.owner = None;
                entry.tx = Some(Transaction { requestor: req, acks_pending: 0, data: None });
                entry.state = DirState::SD;
            }
            (MessageKind::GetM, DirState::I | DirState::S) => {
                let invalidate: Vec<_> = entry.sharers.iter().copied().filter(|s| *s != req).collect();
                if !ctx.can_forward(invalidate.len()) || !ctx.can_access_memory() {
                    return Ok(Step::Stall);
                }
                for sharer in &invalidate {
                    ctx.send_forward(Message::new(MessageKind::Inv, line, ctx.me, *sharer).with_requestor(req))?;
                }
                ctx.read_memory(line)?;
                entry.sharers.clear();
                entry.tx = Some(Transaction { requestor: req, acks_pending: invalidate.len(), data: None });
                entry.state = DirState::MMem;
            }
            (MessageKind::GetM, DirState::M) => {
                let owner = match entry.owner {
                    Some(owner) if owner != req => owner,
                    _ => return Err(ctx.unexpected(line, entry.state, msg.kind)),
                };
                if !ctx.can_forward(1) {
                    return Ok(Step::Stall);
                }
                ctx.send_forward(Message::new(MessageKind::FwdGetM, line, ctx.me, owner).with_requestor(req))?;
                entry.owner = Some(req);
            }
            (MessageKind::PutS, _) => {
                if !ctx.can_forward(1) {
                    return Ok(Step::Stall);
                }
                entry.sharers.remove(&req);
                if entry.state == DirState::S && entry.sharers.is_empty() {
                    entry.state = DirState::I;
                }
                ctx.send_forward(Message::new(MessageKind::PutAck, line, ctx.me, req))?;
            }
            (MessageKind::PutM, DirState::M) if entry.owner == Some(req) => {
                let data = msg
                    .data
                    .clone()
                    .ok_or_else(|| ctx.unexpected(line, entry.state, msg.kind))?;
                if !ctx.can_forward(1) || !ctx.can_access_memory() {
                    return Ok(Step::Stall);
                }
                ctx.write_memory(line, data)?;
                entry.owner = None;
                entry.state = DirState::I;
                ctx.send_forward(Message::new(MessageKind::PutAck, line, ctx.me, req))?;
            }
            (MessageKind::PutM, _) => {
                // ownership already moved on, the data went with a forward
                if !ctx.can_forward(1) {
                    return Ok(Step::Stall);
                }
                entry.sharers.remove(&req);
                ctx.send_forward(Message::new(MessageKind::PutAck, line, ctx.me, req))?;
            }
            _ => return Err(ctx.unexpected(line, entry.state, msg.kind)),
        }
        Ok(Step::Done)
    }

    fn response(&mut self, ctx: &mut DirContext<'_>, msg: &Message) -> Result<Step, ProtocolError> {
        let line = msg.addr;
        let Some(entry) = self.entries.get_mut(&line) else {
            return Err(ctx.unexpected(line, DirState::I, msg.kind));
        };
        match (msg.kind, entry.state) {
            (MessageKind::InvAck, DirState::MMem) => {
                let Some(tx) = entry.tx.as_mut().filter(|tx| tx.acks_pending > 0) else {
                    return Err(ProtocolError::AckMismatch {
                        controller: ctx.me,
                        line,
                        detail: format!("unexpected InvAck from {}", msg.sender),
                    });
                };
                if tx.acks_pending == 1 && tx.data.is_some() && !ctx.can_respond(1) {
                    return Ok(Step::Stall);
                }
                tx.acks_pending -= 1;
                Self::finish_getm(ctx, line, entry)?;
            }
            (MessageKind::InvAck, _) => {
                return Err(ProtocolError::AckMismatch {
                    controller: ctx.me,
                    line,
                    detail: format!("InvAck from {} in state {:?}", msg.sender, entry.state),
                });
            }
            (MessageKind::Data, DirState::SD) => {
                let data = msg
                    .data
                    .clone()
                    .ok_or_else(|| ctx.unexpected(line, entry.state, msg.kind))?;
                if !ctx.can_access_memory() {
                    return Ok(Step::Stall);
                }
                ctx.write_memory(line, data)?;
                entry.tx = None;
                entry.state = DirState::S;
            }
            _ => return Err(ctx.unexpected(line, entry.state, msg.kind)),
        }
        Ok(Step::Done)
    }

    fn memory_response(&mut self, ctx: &mut DirContext<'_>, resp: &MemResponse) -> Result<Step, ProtocolError> {
        let line = resp.addr;
        let Some(entry) = self.entries.get_mut(&line) else {
            return Err(ctx.unexpected(line, DirState::I, MessageKind::Data));
        };
        match entry.state {
            DirState::SMem => {
                if !ctx.can_respond(1) {
                    return Ok(Step::Stall);
                }
                if let Some(tx) = entry.tx.take() {
                    ctx.send_response(
                        Message::new(MessageKind::Data, line, ctx.me, tx.requestor).with_data(resp.data.clone()),
                    )?;
                    entry.sharers.insert(tx.requestor);
                }
                entry.state = DirState::S;
            }
            DirState::MMem => {
                let Some(tx) = entry.tx.as_mut() else {
                    return Err(ctx.unexpected(line, entry.state, MessageKind::Data));
                };
                if tx.acks_pending == 0 && !ctx.can_respond(1) {
                    return Ok(Step::Stall);
                }
                tx.data = Some(resp.data.clone());
                Self::finish_getm(ctx, line, entry)?;
            }
            state => return Err(ctx.unexpected(line, state, MessageKind::Data)),
        }
        Ok(Step::Done)
    }

    fn in_flight(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|(line, e)| {
                e.tx.as_ref().map(|tx| {
                    format!(
                        "{line} in {:?} for {} with {} acks pending",
                        e.state, tx.requestor, tx.acks_pending
                    )
                })
            })
            .collect()
    }
}
