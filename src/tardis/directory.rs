use std::collections::BTreeMap;

use log::trace;

use crate::common::{DataBlock, LineAddr, Lease, MachineId, Timestamp};
use crate::config::Config;
use crate::controller::{DirContext, DirectoryProtocol, Step};
use crate::error::{ConfigError, ProtocolError};
use crate::message::{MemResponse, Message, MessageKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DirState {
    #[default]
    S,
    M,
    /// waiting for memory data
    Mem,
    /// waiting for the owner's writeback
    Wb,
}

#[derive(Clone, Copy, Debug)]
struct Transaction {
    requestor: MachineId,
    kind: MessageKind,
    pts: Timestamp,
    /// version the requestor already holds
    held_wts: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct Entry {
    state: DirState,
    lease: Lease,
    owner: Option<MachineId>,
    tx: Option<Transaction>,
}

pub struct TardisDirectory {
    lease: u64,
    entries: BTreeMap<LineAddr, Entry>,
}

impl TardisDirectory {
    pub fn new(lease: u64) -> Self {
        Self { lease, entries: BTreeMap::new() }
    }

    pub fn state(&self, line: LineAddr) -> DirState {
        self.entries.get(&line).map_or(DirState::S, |e| e.state)
    }

    pub fn lease_of(&self, line: LineAddr) -> Lease {
        self.entries.get(&line).map(|e| e.lease).unwrap_or_default()
    }

    pub fn owner(&self, line: LineAddr) -> Option<MachineId> {
        self.entries.get(&line).and_then(|e| e.owner)
    }

    /// Serves `tx` against the current version of the line. `data` is that
    /// version's contents when already at hand; without it a mismatched
    /// version is read from memory first.
    fn serve(
        lease: u64,
        ctx: &mut DirContext<'_>,
        line: LineAddr,
        entry: &mut Entry,
        tx: Transaction,
        data: Option<DataBlock>,
    ) -> Result<(), ProtocolError> {
        if tx.kind == MessageKind::GetS {
            let rts = entry.lease.rts.max(entry.lease.wts + lease).max(tx.pts + lease);
            entry.lease.rts = rts;
            ctx.monitor().grant_lease(line, rts);
        }
        let reply = if tx.held_wts == Some(entry.lease.wts) {
            match tx.kind {
                MessageKind::GetS => MessageKind::RenewAck,
                _ => MessageKind::UpgradeAck,
            }
        } else {
            MessageKind::Data
        };
        let mut msg = Message::new(reply, line, ctx.me, tx.requestor).with_lease(entry.lease);
        if reply == MessageKind::Data {
            match data {
                Some(data) => msg = msg.with_data(data),
                None => {
                    ctx.read_memory(line)?;
                    entry.tx = Some(tx);
                    entry.state = DirState::Mem;
                    return Ok(());
                }
            }
        }
        trace!("{}: {:?} {} to {} with lease {:?}", ctx.me, reply, line, tx.requestor, entry.lease);
        ctx.send_response(msg)?;
        entry.tx = None;
        if tx.kind == MessageKind::GetM {
            entry.owner = Some(tx.requestor);
            entry.state = DirState::M;
        } else {
            entry.owner = None;
            entry.state = DirState::S;
        }
        Ok(())
    }

    fn timestamps(ctx: &DirContext<'_>, line: LineAddr, state: DirState, msg: &Message) -> Result<(DataBlock, Lease), ProtocolError> {
        match (&msg.data, msg.lease) {
            (Some(data), Some(lease)) => Ok((data.clone(), lease)),
            _ => Err(ctx.unexpected(line, state, msg.kind)),
        }
    }
}

impl DirectoryProtocol for TardisDirectory {
    fn from_config(config: &Config) -> Result<Self, ConfigError> {
        if config.tardis.lease == 0 {
            return Err(ConfigError::Zero { what: "lease" });
        }
        Ok(Self::new(config.tardis.lease))
    }

    fn busy(&self, line: LineAddr) -> bool {
        self.entries.get(&line).is_some_and(|e| e.tx.is_some())
    }

    fn request(&mut self, ctx: &mut DirContext<'_>, msg: &Message) -> Result<Step, ProtocolError> {
        let line = msg.addr;
        let req = msg.sender;
        let lease = self.lease;
        let entry = self.entries.entry(line).or_default();
        let tx = Transaction {
            requestor: req,
            kind: msg.kind,
            pts: msg.pts.unwrap_or_default(),
            held_wts: msg.lease.map(|l| l.wts),
        };
        match (msg.kind, entry.state) {
            (MessageKind::GetS | MessageKind::GetM, DirState::S) => {
                if !ctx.can_respond(1) || !ctx.can_access_memory() {
                    return Ok(Step::Stall);
                }
                Self::serve(lease, ctx, line, entry, tx, None)?;
            }
            (MessageKind::GetS | MessageKind::GetM, DirState::M) => {
                let owner = match entry.owner {
                    Some(owner) if owner != req => owner,
                    _ => return Err(ctx.unexpected(line, entry.state, msg.kind)),
                };
                if !ctx.can_forward(1) {
                    return Ok(Step::Stall);
                }
                let kind = match msg.kind {
                    MessageKind::GetS => MessageKind::FwdGetS,
                    _ => MessageKind::FwdGetM,
                };
                ctx.send_forward(Message::new(kind, line, ctx.me, owner).with_requestor(req).with_pts(tx.pts))?;
                entry.tx = Some(tx);
                entry.state = DirState::Wb;
            }
            (MessageKind::PutM, DirState::M) if entry.owner == Some(req) => {
                let (data, written) = Self::timestamps(ctx, line, entry.state, msg)?;
                if !ctx.can_forward(1) || !ctx.can_access_memory() {
                    return Ok(Step::Stall);
                }
                ctx.write_memory(line, data)?;
                entry.lease = Lease { wts: written.wts, rts: entry.lease.rts.max(written.rts) };
                entry.owner = None;
                entry.state = DirState::S;
                ctx.send_forward(Message::new(MessageKind::PutAck, line, ctx.me, req))?;
            }
            (MessageKind::PutM | MessageKind::PutS, _) => {
                if !ctx.can_forward(1) {
                    return Ok(Step::Stall);
                }
                ctx.send_forward(Message::new(MessageKind::PutAck, line, ctx.me, req))?;
            }
            _ => return Err(ctx.unexpected(line, entry.state, msg.kind)),
        }
        Ok(Step::Done)
    }

    fn response(&mut self, ctx: &mut DirContext<'_>, msg: &Message) -> Result<Step, ProtocolError> {
        let line = msg.addr;
        let lease = self.lease;
        let Some(entry) = self.entries.get_mut(&line) else {
            return Err(ctx.unexpected(line, DirState::S, msg.kind));
        };
        match (msg.kind, entry.state, entry.tx) {
            (MessageKind::WbData, DirState::Wb, Some(tx)) if entry.owner == Some(msg.sender) => {
                let (data, written) = Self::timestamps(ctx, line, entry.state, msg)?;
                if !ctx.can_respond(1) || !ctx.can_access_memory() {
                    return Ok(Step::Stall);
                }
                ctx.write_memory(line, data.clone())?;
                entry.lease = Lease { wts: written.wts, rts: entry.lease.rts.max(written.rts) };
                Self::serve(lease, ctx, line, entry, tx, Some(data))?;
            }
            _ => return Err(ctx.unexpected(line, entry.state, msg.kind)),
        }
        Ok(Step::Done)
    }

    fn memory_response(&mut self, ctx: &mut DirContext<'_>, resp: &MemResponse) -> Result<Step, ProtocolError> {
        let line = resp.addr;
        let lease = self.lease;
        let Some(entry) = self.entries.get_mut(&line) else {
            return Err(ctx.unexpected(line, DirState::S, MessageKind::Data));
        };
        match (entry.state, entry.tx) {
            (DirState::Mem, Some(tx)) => {
                if !ctx.can_respond(1) {
                    return Ok(Step::Stall);
                }
                Self::serve(lease, ctx, line, entry, tx, Some(resp.data.clone()))?;
            }
            (state, _) => return Err(ctx.unexpected(line, state, MessageKind::Data)),
        }
        Ok(Step::Done)
    }

    fn in_flight(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|(line, e)| {
                e.tx.map(|tx| format!("{line} in {:?} serving {:?} from {}", e.state, tx.kind, tx.requestor))
            })
            .collect()
    }
}
