//! Routing of raw inbound events to pending operations, endpoint handlers and indications.

use std::{
    collections::HashMap,
    sync::{Arc, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};

use crate::{
    af::{Af, Correlated},
    controller::Request,
    correlation::CorrelationKey,
    endpoint::{Endpoint, HandlerKind},
    error::AfError,
    event::{EndDeviceAnnounce, InboundEvent, Indication, Route, ZclIncomingMsg},
    frame::FrameType,
};

const CMD_REPORT: &str = "report";
const CMD_STATUS_CHANGE: &str = "statusChangeNotification";

impl Af {
    fn reborn(&self) -> MutexGuard<'_, HashMap<u16, Vec<InboundEvent>>> {
        self.reborn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route one inbound event. Never blocks; handlers are queued for the handler task.
    pub(crate) fn dispatch(&self, event: InboundEvent) {
        let Some(coord) = self.controller.coordinator() else {
            log::trace!("no coordinator, dropping {}", event.name());
            return;
        };

        let mut remote: Option<Arc<dyn Endpoint>> = None;
        let target = match event.route() {
            Route::Local { endpoint } => coord.endpoint(endpoint),
            Route::Remote {
                src_addr,
                src_endpoint,
                dst_endpoint,
            } => match coord.endpoint(dst_endpoint) {
                Some(local) => {
                    // later traffic must not overtake what is already held
                    if let Some(buffer) = self.reborn().get_mut(&src_addr) {
                        buffer.push(event);
                        return;
                    }
                    remote = self.controller.find_endpoint(src_addr, src_endpoint);
                    if local.is_delegator() {
                        remote.clone()
                    } else if remote.is_none() {
                        self.buffer_reborn(src_addr, src_endpoint, event);
                        return;
                    } else {
                        Some(local)
                    }
                }
                None => None,
            },
        };
        let Some(target) = target else {
            log::trace!("no target endpoint, dropping {}", event.name());
            return;
        };

        let mut key = None;
        let mut header = None;
        let kind = match &event {
            InboundEvent::DataConfirm(cnf) => {
                key = Some(CorrelationKey::DataConfirm {
                    endpoint: cnf.endpoint,
                    trans_id: cnf.trans_id,
                });
                HandlerKind::AfDataConfirm
            }
            InboundEvent::ReflectError(re) => {
                key = Some(CorrelationKey::ReflectError {
                    endpoint: re.endpoint,
                    trans_id: re.trans_id,
                });
                HandlerKind::AfReflectError
            }
            InboundEvent::IncomingMsg(msg) => {
                header = self.codec.header(&msg.data);
                HandlerKind::AfIncomingMsg
            }
            InboundEvent::IncomingMsgExt(msg) => {
                header = self.codec.header(&msg.data);
                HandlerKind::AfIncomingMsgExt
            }
            InboundEvent::ZclIncomingMsg(zcl) => {
                key = self.zcl_incoming(&target, zcl);
                match zcl.zcl_msg.frame_cntl.frame_type {
                    FrameType::Foundation => HandlerKind::ZclFoundation,
                    FrameType::Functional => HandlerKind::ZclFunctional,
                }
            }
        };

        if let Some(handler) = target.handler(kind) {
            let _ = self.handler_tx.send((handler, event.clone(), remote.clone()));
        }

        if let Some(key) = key {
            let value = match &event {
                InboundEvent::DataConfirm(cnf) => Some(Correlated::Confirmed(cnf.clone())),
                InboundEvent::ReflectError(re) => Some(Correlated::Reflected(re.clone())),
                InboundEvent::ZclIncomingMsg(zcl) => Some(Correlated::Zcl(zcl.clone())),
                _ => None,
            };
            if let Some(value) = value {
                if !self.registry.deliver(&key, value) {
                    log::trace!("{} has no pending operation", key);
                }
            }
        }

        let (InboundEvent::IncomingMsg(msg) | InboundEvent::IncomingMsgExt(msg)) = event else {
            return;
        };
        let Some(header) = header else {
            return;
        };
        let cluster_id = (header.frame_cntl.frame_type == FrameType::Functional).then_some(msg.cluster_id);
        match self.codec.parse(&msg.data, cluster_id) {
            Ok(zcl_msg) => {
                let parsed = ZclIncomingMsg { msg, zcl_msg };
                let _ = self
                    .indication_tx
                    .send(Indication::ZclIncoming(parsed.clone()));
                let _ = self.inbound_tx.send(InboundEvent::ZclIncomingMsg(parsed));
            }
            Err(e) => log::trace!("zcl parse of 0x{:04x} failed: {:#}", msg.src_addr, e),
        }
    }

    /// Correlation key and indications of a parsed ZCL message.
    fn zcl_incoming(
        &self,
        target: &Arc<dyn Endpoint>,
        zcl: &ZclIncomingMsg,
    ) -> Option<CorrelationKey> {
        let msg = &zcl.msg;
        let frame_type = zcl.zcl_msg.frame_cntl.frame_type;
        let cross = CorrelationKey::ZclIncoming {
            addr: msg.src_addr,
            endpoint: msg.src_endpoint,
            src_endpoint: Some(msg.dst_endpoint),
            seq: zcl.zcl_msg.seq_num,
        };

        let key = if target.is_local() {
            (!target.is_delegator()).then_some(cross)
        } else {
            let to_local_app = self
                .controller
                .find_endpoint(0, msg.dst_endpoint)
                .is_some_and(|ep| ep.is_local() && !ep.is_delegator());
            if to_local_app {
                Some(cross)
            } else {
                // IAS devices may answer from an unexpected endpoint
                if zcl.zcl_msg.cmd_id == CMD_STATUS_CHANGE
                    && frame_type == FrameType::Functional
                    && !zcl.zcl_msg.payload.is_empty()
                {
                    let _ = self.indication_tx.send(Indication::StatusChange {
                        endpoint: target.clone(),
                        cluster_id: msg.cluster_id,
                        payload: zcl.zcl_msg.payload.clone(),
                    });
                }
                Some(CorrelationKey::ZclIncoming {
                    addr: msg.src_addr,
                    endpoint: msg.src_endpoint,
                    src_endpoint: None,
                    seq: zcl.zcl_msg.seq_num,
                })
            }
        };

        if frame_type == FrameType::Foundation && zcl.zcl_msg.cmd_id == CMD_REPORT {
            let _ = self.indication_tx.send(Indication::Reported {
                endpoint: target.clone(),
                cluster_id: msg.cluster_id,
                payload: zcl.zcl_msg.payload.clone(),
            });
        }
        key
    }

    /// Hold traffic of an unknown device until its identity is learned.
    fn buffer_reborn(&self, src_addr: u16, src_endpoint: u8, event: InboundEvent) {
        self.reborn().insert(src_addr, vec![event]);
        log::debug!("unknown device 0x{:04x}, buffering its traffic", src_addr);

        let Some(af) = self.self_weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = af.resolve_reborn(src_addr, src_endpoint).await {
                log::debug!("discarding traffic of 0x{:04x}: {:#}", src_addr, e);
                af.reborn().remove(&src_addr);
            }
        });
    }

    async fn resolve_reborn(&self, src_addr: u16, src_endpoint: u8) -> Result<()> {
        let request = Request::IeeeAddrReq {
            short_addr: src_addr,
            req_type: 0,
            start_index: 0,
        };
        let name = request.name();
        let rsp = self.controller.request(request).await?;
        if !rsp.is_success() {
            return Err(AfError::RequestFailed {
                request: name,
                status: rsp.status,
            }
            .into());
        }
        let ieee_addr = rsp.ieee_addr.context("ieee address missing in response")?;
        let nwk_addr = rsp.nwk_addr.unwrap_or(src_addr);

        let incoming = self.controller.once_incoming(ieee_addr);
        self.controller.announce(EndDeviceAnnounce {
            src_addr: nwk_addr,
            nwk_addr,
            ieee_addr,
        });
        tokio::time::timeout(self.config.reborn_timeout(), incoming)
            .await
            .map_err(|_| AfError::Timeout {
                label: format!("identity of 0x{:04x}", src_addr),
            })?
            .context("incoming listener dropped")?;

        if self.controller.find_endpoint(src_addr, src_endpoint).is_none() {
            anyhow::bail!("endpoint {} of 0x{:016x} still unknown", src_endpoint, ieee_addr);
        }
        log::debug!("0x{:04x} is 0x{:016x}", src_addr, ieee_addr);
        self.replay_tx
            .send(src_addr)
            .map_err(|_| anyhow::anyhow!("dispatch loop stopped"))?;
        Ok(())
    }

    /// Replay held traffic of `src_addr` in arrival order. Runs on the dispatch task.
    pub(crate) fn replay_reborn(&self, src_addr: u16) {
        let buffered = self.reborn().remove(&src_addr).unwrap_or_default();
        log::debug!("replaying {} events of 0x{:04x}", buffered.len(), src_addr);
        for event in buffered {
            self.dispatch(event);
        }
    }
}
