//! Endpoint model consumed by the engines. The device database implements these traits.

use std::sync::Arc;

use crate::event::InboundEvent;

/// Callback invoked with the raw event and the resolved remote endpoint, if any.
pub type Handler = Arc<dyn Fn(InboundEvent, Option<Arc<dyn Endpoint>>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    AfDataConfirm,
    AfReflectError,
    AfIncomingMsg,
    AfIncomingMsgExt,
    ZclFoundation,
    ZclFunctional,
}

pub trait Endpoint: Send + Sync {
    fn ep_id(&self) -> u8;
    fn nwk_addr(&self) -> u16;
    fn ieee_addr(&self) -> u64;
    fn profile_id(&self) -> u16;

    fn manuf_code(&self) -> u16 {
        0
    }

    /// Hosted by the coordinator itself.
    fn is_local(&self) -> bool;

    fn is_delegator(&self) -> bool {
        false
    }

    fn in_clusters(&self) -> Vec<u16>;
    fn out_clusters(&self) -> Vec<u16>;

    /// Advertised clusters, in-clusters first, without duplicates.
    fn clusters(&self) -> Vec<u16> {
        let mut out = self.in_clusters();
        for c in self.out_clusters() {
            if !out.contains(&c) {
                out.push(c);
            }
        }
        out
    }

    fn handler(&self, _kind: HandlerKind) -> Option<Handler> {
        None
    }
}

/// Local side of the network: hosted endpoints and per-profile delegators.
pub trait Coordinator: Send + Sync {
    fn endpoint(&self, ep_id: u8) -> Option<Arc<dyn Endpoint>>;
    fn delegator(&self, profile_id: u16) -> Option<Arc<dyn Endpoint>>;
}

/// Identity comparison, the same endpoint object on both sides means a self-addressed exchange.
pub fn same_endpoint(a: &Arc<dyn Endpoint>, b: &Arc<dyn Endpoint>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
