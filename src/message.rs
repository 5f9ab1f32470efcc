//! Message types exchanged between the CPU, controllers and memory.

use crate::common::{Addr, Cycle, DataBlock, Lease, LineAddr, MachineId, Timestamp};

/// The three virtual networks of the interconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VirtualNetwork {
    Request = 0,
    Forward = 1,
    Response = 2,
}

pub const NUM_VIRTUAL_NETWORKS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // L1 -> directory requests
    GetS,
    GetM,
    PutS,
    PutM,
    // directory -> L1 forwards
    FwdGetS,
    FwdGetM,
    Inv,
    PutAck,
    // responses
    Data,
    InvAck,
    RenewAck,
    UpgradeAck,
    WbData,
}

impl MessageKind {
    pub fn vnet(&self) -> VirtualNetwork {
        use MessageKind::*;
        match self {
            GetS | GetM | PutS | PutM => VirtualNetwork::Request,
            FwdGetS | FwdGetM | Inv | PutAck => VirtualNetwork::Forward,
            Data | InvAck | RenewAck | UpgradeAck | WbData => VirtualNetwork::Response,
        }
    }
}

/// A coherence message. `requestor` names the L1 a forward or invalidation
/// acts on behalf of; `pts` and `lease` are only used by TARDIS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub addr: LineAddr,
    pub sender: MachineId,
    pub destination: MachineId,
    pub requestor: MachineId,
    pub data: Option<DataBlock>,
    pub pts: Option<Timestamp>,
    pub lease: Option<Lease>,
}

impl Message {
    pub fn new(kind: MessageKind, addr: LineAddr, sender: MachineId, destination: MachineId) -> Self {
        Self {
            kind,
            addr,
            sender,
            destination,
            requestor: sender,
            data: None,
            pts: None,
            lease: None,
        }
    }

    pub fn with_requestor(mut self, requestor: MachineId) -> Self {
        self.requestor = requestor;
        self
    }

    pub fn with_data(mut self, data: DataBlock) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_pts(mut self, pts: Timestamp) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn vnet(&self) -> VirtualNetwork {
        self.kind.vnet()
    }
}

/// Read-modify-write operations performed atomically at the L1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmwOp {
    FetchAdd(u64),
    Swap(u64),
}

impl RmwOp {
    pub fn apply(&self, old: u64) -> u64 {
        match self {
            RmwOp::FetchAdd(v) => old.wrapping_add(*v),
            RmwOp::Swap(v) => *v,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemOp {
    Load,
    Store(u64),
    Rmw(RmwOp),
}

impl MemOp {
    pub fn needs_write(&self) -> bool {
        !matches!(self, MemOp::Load)
    }
}

/// A memory access issued by a core to its sequencer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuRequest {
    pub id: u64,
    pub addr: Addr,
    pub op: MemOp,
}

/// Why the sequencer refused a request. The core retries later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// the outstanding-request table or the mandatory queue is full
    BufferFull,
    /// a request to the same line is already outstanding
    Aliased,
    /// the address is outside physical memory
    OutOfRange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuResponse {
    Done {
        id: u64,
        addr: Addr,
        /// loaded value, or the old value for a read-modify-write
        value: u64,
        latency: Cycle,
        hit: bool,
    },
    Rejected {
        request: CpuRequest,
        status: RequestStatus,
    },
}

/// Directory <-> backing memory traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemRequest {
    Read { addr: LineAddr },
    Write { addr: LineAddr, data: DataBlock },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemResponse {
    pub addr: LineAddr,
    pub data: DataBlock,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_virtual_networks() {
        assert_eq!(MessageKind::GetM.vnet(), VirtualNetwork::Request);
        assert_eq!(MessageKind::PutAck.vnet(), VirtualNetwork::Forward);
        assert_eq!(MessageKind::WbData.vnet(), VirtualNetwork::Response);
    }

    #[test]
    fn rmw_ops() {
        assert_eq!(RmwOp::FetchAdd(3).apply(4), 7);
        assert_eq!(RmwOp::Swap(1).apply(0), 1);
        assert!(MemOp::Rmw(RmwOp::Swap(1)).needs_write());
        assert!(!MemOp::Load.needs_write());
    }
}
