//! Transport side collaborator: the request primitive, id allocation and endpoint lookup.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::endpoint::{Coordinator, Endpoint};
use crate::error;
use crate::event::EndDeviceAnnounce;

/// AF option bits.
pub mod options {
    pub const ACK_REQUEST: u8 = 0x10;
    pub const DISCV_ROUTE: u8 = 0x20;
}

pub const BROADCAST_ADDR: u64 = 0xffff;
pub const ENDPOINT_ANY: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    NotPresent = 0,
    Group = 1,
    Addr16Bit = 2,
    Addr64Bit = 3,
    Broadcast = 15,
}

/// Destination of an extended send, the variant selects the address mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtDestination {
    NotPresent,
    Group(u16),
    Nwk(u16),
    Ieee(u64),
    Broadcast,
}

impl ExtDestination {
    pub fn mode(&self) -> AddressMode {
        match self {
            ExtDestination::NotPresent => AddressMode::NotPresent,
            ExtDestination::Group(_) => AddressMode::Group,
            ExtDestination::Nwk(_) => AddressMode::Addr16Bit,
            ExtDestination::Ieee(_) => AddressMode::Addr64Bit,
            ExtDestination::Broadcast => AddressMode::Broadcast,
        }
    }

    /// Address widened to the 64 bit field of the extended request.
    pub fn long_addr(&self) -> u64 {
        match self {
            ExtDestination::NotPresent => 0,
            ExtDestination::Group(g) => u64::from(*g),
            ExtDestination::Nwk(n) => u64::from(*n),
            ExtDestination::Ieee(i) => *i,
            ExtDestination::Broadcast => BROADCAST_ADDR,
        }
    }

    /// Group and broadcast frames have no per-frame confirmation.
    pub fn is_multicast(&self) -> bool {
        matches!(self, ExtDestination::Group(_) | ExtDestination::Broadcast)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfParams {
    pub dst_addr: u16,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    pub cluster_id: u16,
    pub trans_id: u8,
    pub options: u8,
    pub radius: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfParamsExt {
    pub dst_addr_mode: AddressMode,
    pub dst_addr: u64,
    pub dst_endpoint: u8,
    pub dst_pan_id: u16,
    pub src_endpoint: u8,
    pub cluster_id: u16,
    pub trans_id: u8,
    pub options: u8,
    pub radius: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    DataRequest(AfParams),
    DataRequestExt(AfParamsExt),
    IeeeAddrReq {
        short_addr: u16,
        req_type: u8,
        start_index: u8,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::DataRequest(_) => "AF:dataRequest",
            Request::DataRequestExt(_) => "AF:dataRequestExt",
            Request::IeeeAddrReq { .. } => "ZDO:ieeeAddrReq",
        }
    }

    pub(crate) fn trans_id_mut(&mut self) -> Option<&mut u8> {
        match self {
            Request::DataRequest(p) => Some(&mut p.trans_id),
            Request::DataRequestExt(p) => Some(&mut p.trans_id),
            Request::IeeeAddrReq { .. } => None,
        }
    }

    pub(crate) fn options(&self) -> u8 {
        match self {
            Request::DataRequest(p) => p.options,
            Request::DataRequestExt(p) => p.options,
            Request::IeeeAddrReq { .. } => 0,
        }
    }
}

/// Synchronous acknowledgement of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: u8,
    pub ieee_addr: Option<u64>,
    pub nwk_addr: Option<u16>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        error::status_ok(self.status)
    }
}

#[async_trait]
pub trait Controller: Send + Sync {
    /// Next transaction id of the radio, wrapping at 255.
    fn next_trans_id(&self) -> u8;

    async fn request(&self, request: Request) -> Result<Response>;

    fn coordinator(&self) -> Option<Arc<dyn Coordinator>>;

    /// Endpoint from the live device table, address 0 names the coordinator.
    fn find_endpoint(&self, nwk_addr: u16, ep_id: u8) -> Option<Arc<dyn Endpoint>>;

    /// Fires once the controller has (re)learned the device with this long address.
    fn once_incoming(&self, ieee_addr: u64) -> oneshot::Receiver<()>;

    fn announce(&self, announce: EndDeviceAnnounce);
}
