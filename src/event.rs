use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::frame::{ZclMessage, ZclPayload};

/// Asynchronous confirmation of a previously sent AF frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfirm {
    pub status: u8,
    pub endpoint: u8,
    pub trans_id: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectError {
    pub status: u8,
    pub endpoint: u8,
    pub trans_id: u8,
    pub dst_addr_mode: u8,
    pub dst_addr: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMsg {
    pub group_id: u16,
    pub cluster_id: u16,
    pub src_addr: u16,
    pub src_endpoint: u8,
    pub dst_endpoint: u8,
    pub was_broadcast: bool,
    pub link_quality: u8,
    pub security_use: bool,
    pub timestamp: u32,
    pub trans_seq_number: u8,
    pub data: Vec<u8>,
}

/// Incoming message whose payload was already parsed as a ZCL frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZclIncomingMsg {
    #[serde(flatten)]
    pub msg: IncomingMsg,
    pub zcl_msg: ZclMessage,
}

/// Raw events emitted by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InboundEvent {
    DataConfirm(DataConfirm),
    ReflectError(ReflectError),
    IncomingMsg(IncomingMsg),
    IncomingMsgExt(IncomingMsg),
    ZclIncomingMsg(ZclIncomingMsg),
}

/// Where an inbound event is addressed.
pub(crate) enum Route {
    /// confirmations addressed to a local endpoint
    Local { endpoint: u8 },
    /// traffic of a remote endpoint towards a local one
    Remote {
        src_addr: u16,
        src_endpoint: u8,
        dst_endpoint: u8,
    },
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::DataConfirm(_) => "AF:dataConfirm",
            InboundEvent::ReflectError(_) => "AF:reflectError",
            InboundEvent::IncomingMsg(_) => "AF:incomingMsg",
            InboundEvent::IncomingMsgExt(_) => "AF:incomingMsgExt",
            InboundEvent::ZclIncomingMsg(_) => "ZCL:incomingMsg",
        }
    }

    pub(crate) fn route(&self) -> Route {
        match self {
            InboundEvent::DataConfirm(c) => Route::Local {
                endpoint: c.endpoint,
            },
            InboundEvent::ReflectError(r) => Route::Local {
                endpoint: r.endpoint,
            },
            InboundEvent::IncomingMsg(m) | InboundEvent::IncomingMsgExt(m) => Route::Remote {
                src_addr: m.src_addr,
                src_endpoint: m.src_endpoint,
                dst_endpoint: m.dst_endpoint,
            },
            InboundEvent::ZclIncomingMsg(z) => Route::Remote {
                src_addr: z.msg.src_addr,
                src_endpoint: z.msg.src_endpoint,
                dst_endpoint: z.msg.dst_endpoint,
            },
        }
    }
}

/// Application facing events produced by the dispatcher.
#[derive(Clone)]
pub enum Indication {
    /// foundation attribute report
    Reported {
        endpoint: Arc<dyn Endpoint>,
        cluster_id: u16,
        payload: ZclPayload,
    },
    /// IAS status change notification arriving outside regular endpoint correlation
    StatusChange {
        endpoint: Arc<dyn Endpoint>,
        cluster_id: u16,
        payload: ZclPayload,
    },
    /// raw incoming message re-emitted after ZCL parsing
    ZclIncoming(ZclIncomingMsg),
}

/// Device announcement emitted to the controller once a buffered device's long address is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndDeviceAnnounce {
    pub src_addr: u16,
    pub nwk_addr: u16,
    pub ieee_addr: u64,
}
