use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::ZclCodec,
    config::AfConfig,
    controller::{
        options, AfParams, AfParamsExt, Controller, ExtDestination, Request, Response,
        ENDPOINT_ANY,
    },
    correlation::{CorrelationKey, CorrelationRegistry, PreResolve},
    endpoint::{Endpoint, Handler},
    error::{self, AfError},
    event::{DataConfirm, InboundEvent, Indication, ReflectError, ZclIncomingMsg},
    limiter::DeviceLimiter,
    zcl::SeqCounter,
};

/// Cluster given by numeric id or by name from the codec's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterRef {
    Id(u16),
    Name(String),
}

impl From<u16> for ClusterRef {
    fn from(id: u16) -> Self {
        ClusterRef::Id(id)
    }
}

impl From<&str> for ClusterRef {
    fn from(name: &str) -> Self {
        ClusterRef::Name(name.to_owned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// AF option bits, see [crate::controller::options]
    pub options: Option<u8>,
    pub radius: Option<u8>,
    /// overrides the configured confirmation timeout
    pub timeout: Option<Duration>,
    /// destination endpoint of 16/64 bit extended sends
    pub dst_endpoint: Option<u8>,
    pub dst_pan_id: Option<u16>,
}

/// How a send was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum AfDelivery {
    /// transport accepted the frame, no confirmation was requested
    Accepted(Response),
    /// radio confirmed delivery
    Confirmed(DataConfirm),
}

/// Values flowing through the correlation registry.
pub(crate) enum Correlated {
    Accepted(Response),
    Confirmed(DataConfirm),
    Reflected(ReflectError),
    Zcl(ZclIncomingMsg),
}

/// Deferred endpoint handler invocation.
pub(crate) type HandlerCall = (Handler, InboundEvent, Option<Arc<dyn Endpoint>>);

/// AF/ZCL messaging core bound to one controller.
///
/// Raw transport events are fed through [Af::inbound]; a background task dispatches
/// them one at a time. Application indications arrive on the receiver returned by [Af::new].
pub struct Af {
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) codec: Arc<dyn ZclCodec>,
    pub(crate) config: AfConfig,
    pub(crate) registry: CorrelationRegistry<Correlated>,
    pub(crate) seq: SeqCounter,
    pub(crate) limiter: DeviceLimiter,
    /// traffic of devices whose identity is being resolved, by short address
    pub(crate) reborn: Mutex<HashMap<u16, Vec<InboundEvent>>>,
    pub(crate) inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    /// short addresses whose buffered traffic is ready for replay
    pub(crate) replay_tx: mpsc::UnboundedSender<u16>,
    pub(crate) handler_tx: mpsc::UnboundedSender<HandlerCall>,
    pub(crate) indication_tx: mpsc::UnboundedSender<Indication>,
    pub(crate) self_weak: Weak<Af>,
    cancel: CancellationToken,
}

impl Af {
    /// Create the core and spawn its dispatch task. Must be called within a tokio runtime.
    pub fn new(
        controller: Arc<dyn Controller>,
        codec: Arc<dyn ZclCodec>,
        config: AfConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Indication>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (replay_tx, replay_rx) = mpsc::unbounded_channel();
        let (handler_tx, handler_rx) = mpsc::unbounded_channel();
        let (indication_tx, indication_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.child_token();
        let handler_cancel = cancel.child_token();

        let af = Arc::new_cyclic(|self_weak| Self {
            controller,
            codec,
            registry: CorrelationRegistry::new(config.request_timeout()),
            seq: SeqCounter::default(),
            limiter: DeviceLimiter::new(config.device_concurrency),
            reborn: Mutex::new(HashMap::new()),
            config,
            inbound_tx,
            replay_tx,
            handler_tx,
            indication_tx,
            self_weak: self_weak.clone(),
            cancel,
        });

        let loop_af = Arc::downgrade(&af);
        tokio::spawn(async move {
            dispatch_loop(loop_af, inbound_rx, replay_rx, loop_cancel).await;
        });
        tokio::spawn(async move {
            handler_loop(handler_rx, handler_cancel).await;
        });
        (af, indication_rx)
    }

    /// Sender the transport feeds raw events into.
    pub fn inbound(&self) -> mpsc::UnboundedSender<InboundEvent> {
        self.inbound_tx.clone()
    }

    pub fn config(&self) -> &AfConfig {
        &self.config
    }

    pub(crate) fn resolve_cluster(&self, cluster: &ClusterRef) -> Result<u16> {
        match cluster {
            ClusterRef::Id(id) => Ok(*id),
            ClusterRef::Name(name) => self
                .codec
                .cluster_id(name)
                .ok_or_else(|| AfError::InvalidCluster(name.clone()).into()),
        }
    }

    /// Local endpoints send for themselves, remote ones through the delegator of their profile.
    fn sender_endpoint(&self, src: &Arc<dyn Endpoint>) -> Result<Arc<dyn Endpoint>> {
        if src.is_local() {
            return Ok(src.clone());
        }
        let coord = self
            .controller
            .coordinator()
            .context("coordinator not available")?;
        coord
            .delegator(src.profile_id())
            .or_else(|| coord.delegator(self.config.default_profile_id))
            .ok_or_else(|| AfError::NoSender(src.profile_id()).into())
    }

    /// Unicast `payload` from `src` to `dst`.
    pub async fn send(
        &self,
        src: &Arc<dyn Endpoint>,
        dst: &Arc<dyn Endpoint>,
        cluster: impl Into<ClusterRef>,
        payload: &[u8],
        opts: SendOptions,
    ) -> Result<AfDelivery> {
        let cluster_id = self.resolve_cluster(&cluster.into())?;
        let sender = self.sender_endpoint(src)?;
        let params = AfParams {
            dst_addr: dst.nwk_addr(),
            dst_endpoint: dst.ep_id(),
            src_endpoint: sender.ep_id(),
            cluster_id,
            trans_id: self.controller.next_trans_id(),
            options: opts
                .options
                .unwrap_or(options::ACK_REQUEST | options::DISCV_ROUTE),
            radius: opts.radius.unwrap_or(self.config.default_radius),
            data: payload.to_vec(),
        };
        log::trace!(
            "send cluster:{} 0x{:04x}/{} <- {} data:{}",
            cluster_id,
            params.dst_addr,
            params.dst_endpoint,
            params.src_endpoint,
            hex::encode(payload)
        );
        self.request_confirmed(sender.ep_id(), Request::DataRequest(params), opts.timeout)
            .await
    }

    /// Send with extended addressing. Only local endpoints may originate these.
    pub async fn send_ext(
        &self,
        src: &Arc<dyn Endpoint>,
        dst: ExtDestination,
        cluster: impl Into<ClusterRef>,
        payload: &[u8],
        opts: SendOptions,
    ) -> Result<AfDelivery> {
        let cluster_id = self.resolve_cluster(&cluster.into())?;
        if !src.is_local() {
            return Err(AfError::UnsupportedOperation.into());
        }

        let (default_options, dst_endpoint) = match dst {
            ExtDestination::Nwk(_) | ExtDestination::Ieee(_) => (
                options::DISCV_ROUTE | options::ACK_REQUEST,
                opts.dst_endpoint.unwrap_or(ENDPOINT_ANY),
            ),
            _ => (options::DISCV_ROUTE, ENDPOINT_ANY),
        };
        let params = AfParamsExt {
            dst_addr_mode: dst.mode(),
            dst_addr: dst.long_addr(),
            dst_endpoint,
            dst_pan_id: opts.dst_pan_id.unwrap_or(0),
            src_endpoint: src.ep_id(),
            cluster_id,
            trans_id: self.controller.next_trans_id(),
            options: opts.options.unwrap_or(default_options),
            radius: opts.radius.unwrap_or(self.config.default_radius),
            data: payload.to_vec(),
        };
        log::trace!(
            "send_ext cluster:{} {:?} 0x{:016x} <- {} data:{}",
            cluster_id,
            params.dst_addr_mode,
            params.dst_addr,
            params.src_endpoint,
            hex::encode(payload)
        );

        if dst.is_multicast() {
            let request = Request::DataRequestExt(params);
            let name = request.name();
            let rsp = self.controller.request(request).await?;
            if !rsp.is_success() {
                return Err(AfError::RequestFailed {
                    request: name,
                    status: rsp.status,
                }
                .into());
            }
            return Ok(AfDelivery::Accepted(rsp));
        }
        self.request_confirmed(src.ep_id(), Request::DataRequestExt(params), opts.timeout)
            .await
    }

    /// Pick a transaction id whose confirmation key is free, rewriting the request in place.
    fn free_confirm_key(&self, sender_ep: u8, request: &mut Request) -> Result<CorrelationKey> {
        let trans_id = request
            .trans_id_mut()
            .context("request carries no transaction id")?;
        for _ in 0..=u8::MAX {
            let key = CorrelationKey::DataConfirm {
                endpoint: sender_ep,
                trans_id: *trans_id,
            };
            if !self.registry.is_pending(&key) {
                return Ok(key);
            }
            *trans_id = self.controller.next_trans_id();
        }
        Err(AfError::NoFreeId(format!("AF:dataConfirm:{}", sender_ep)).into())
    }

    async fn request_confirmed(
        &self,
        sender_ep: u8,
        mut request: Request,
        timeout: Option<Duration>,
    ) -> Result<AfDelivery> {
        let name = request.name();
        let ack_requested = request.options() & options::ACK_REQUEST != 0;
        let key = self.free_confirm_key(sender_ep, &mut request)?;
        let hook: PreResolve<Correlated> = Box::new(confirm_status);
        let reply = self.registry.register(key.clone(), Some(hook), timeout)?;

        match self.controller.request(request).await {
            Ok(rsp) if !rsp.is_success() => {
                self.registry.reject(
                    &key,
                    AfError::RequestFailed {
                        request: name,
                        status: rsp.status,
                    }
                    .into(),
                );
            }
            Ok(rsp) => {
                if !ack_requested {
                    self.registry.resolve(&key, Correlated::Accepted(rsp));
                }
            }
            Err(e) => {
                self.registry.reject(&key, e);
            }
        }

        match reply.recv().await? {
            Correlated::Accepted(rsp) => Ok(AfDelivery::Accepted(rsp)),
            Correlated::Confirmed(cnf) => Ok(AfDelivery::Confirmed(cnf)),
            _ => Err(AfError::UnexpectedResponse(format!("{} settled by another event", key)).into()),
        }
    }
}

fn confirm_status(value: Correlated) -> Result<Correlated> {
    match value {
        Correlated::Confirmed(cnf) if !error::status_ok(cnf.status) => {
            Err(AfError::DeliveryFailed { status: cnf.status }.into())
        }
        other => Ok(other),
    }
}

impl Drop for Af {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch_loop(
    af: Weak<Af>,
    mut inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
    mut replay_rx: mpsc::UnboundedReceiver<u16>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = inbound_rx.recv() => {
                let Some(event) = event else { break };
                let Some(strong) = af.upgrade() else { break };
                log::trace!("inbound {}", event.name());
                strong.dispatch(event);
            }

            src_addr = replay_rx.recv() => {
                let Some(src_addr) = src_addr else { break };
                let Some(strong) = af.upgrade() else { break };
                strong.replay_reborn(src_addr);
            }
        }
    }
    log::debug!("dispatch loop stopped");
}

/// Runs endpoint handlers one by one, in the order dispatch queued them.
async fn handler_loop(mut calls: mpsc::UnboundedReceiver<HandlerCall>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            call = calls.recv() => {
                let Some((handler, event, remote)) = call else { break };
                handler(event, remote);
            }
        }
    }
    log::debug!("handler loop stopped");
}
