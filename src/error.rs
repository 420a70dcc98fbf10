//! Error taxonomy of the AF/ZCL core.
//!
//! Public operations return [anyhow::Result]; the concrete cause is an [AfError]
//! which callers can recover with `err.downcast_ref::<AfError>()`.

/// Status code reported as success by the radio.
pub const STATUS_SUCCESS: u8 = 0x00;
/// NWK layer has no route to the destination.
pub const STATUS_NWK_NO_ROUTE: u8 = 0xcd;
/// MAC layer did not receive an acknowledgement.
pub const STATUS_MAC_NO_ACK: u8 = 0xe9;
/// APS layer did not receive an acknowledgement.
pub const STATUS_APS_NO_ACK: u8 = 0xb7;
/// Indirect MAC transaction expired before the sleepy device polled.
pub const STATUS_MAC_TRANSACTION_EXPIRED: u8 = 0xf0;

#[derive(Debug, thiserror::Error)]
pub enum AfError {
    #[error("invalid cluster id: {0}")]
    InvalidCluster(String),

    #[error("unrecognized cluster: {0}")]
    UnrecognizedCluster(String),

    #[error("unrecognized command: {0}")]
    UnrecognizedCommand(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("only a local endpoint can groupcast, broadcast and send extended messages")]
    UnsupportedOperation,

    #[error("no local delegator endpoint for profile 0x{0:04x}")]
    NoSender(u16),

    #[error("{request} failed, status code: {status}")]
    RequestFailed { request: &'static str, status: u8 },

    #[error("AF:dataRequest fails, status code: {status}{}", status_hint(.status))]
    DeliveryFailed { status: u8 },

    #[error("{label}: timed out")]
    Timeout { label: String },

    #[error("correlation key {0} is already pending")]
    KeyInUse(String),

    #[error("no free id for {0}")]
    NoFreeId(String),

    #[error("{0} was dropped before it settled")]
    Dropped(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Unable to read genBasic, likely communication error")]
    BasicClusterUnreadable,
}

impl AfError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AfError::Timeout { .. })
    }
}

/// Returns true when `err` was caused by an expired correlation.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AfError>().is_some_and(AfError::is_timeout)
}

pub fn status_ok(status: u8) -> bool {
    status == STATUS_SUCCESS
}

/// Human readable explanation appended to well known delivery failures.
fn status_hint(status: &u8) -> &'static str {
    match *status {
        STATUS_NWK_NO_ROUTE => {
            ". No network route. Please confirm that the device has (re)joined the network."
        }
        STATUS_MAC_NO_ACK => ". MAC no ack.",
        STATUS_APS_NO_ACK => ". APS no ack (the radio waits 20 secs for it).",
        STATUS_MAC_TRANSACTION_EXPIRED => {
            ". MAC transaction expired (the radio keeps indirect frames for 8 secs)."
        }
        _ => "",
    }
}
