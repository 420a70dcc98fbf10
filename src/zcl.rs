//! ZCL command engine: frames foundation and functional commands and awaits their responses.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use anyhow::Result;

use crate::{
    af::{Af, ClusterRef, Correlated, SendOptions},
    correlation::{CorrelationKey, PendingReply},
    endpoint::{same_endpoint, Endpoint},
    error::AfError,
    frame::{Direction, FrameControl, FrameType, ZclCommand, ZclMessage, ZclPayload},
};

/// Wrapping ZCL sequence number source. The first number handed out is 1.
#[derive(Default)]
pub(crate) struct SeqCounter(AtomicU8);

impl SeqCounter {
    pub(crate) fn next(&self) -> u8 {
        self.0.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    pub(crate) fn current(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Frame control overrides of a single command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZclConfig {
    pub manuf_spec: bool,
    /// defaults to client to server for self-addressed commands, server to client otherwise
    pub direction: Option<Direction>,
    pub dis_default_rsp: bool,
    /// explicit sequence number, fails with [AfError::KeyInUse] if a reply with it is still pending
    pub seq_num: Option<u8>,
}

impl Af {
    /// Last sequence number handed out.
    pub fn seq(&self) -> u8 {
        self.seq.current()
    }

    /// Send a profile wide command. Resolves to the response when the direction is client to server.
    pub async fn zcl_foundation(
        &self,
        src: &Arc<dyn Endpoint>,
        dst: &Arc<dyn Endpoint>,
        cluster: impl Into<ClusterRef>,
        cmd: impl Into<ZclCommand>,
        payload: ZclPayload,
        cfg: ZclConfig,
    ) -> Result<Option<ZclMessage>> {
        let cluster_id = self.resolve_cluster(&cluster.into())?;
        self.zcl_command(
            FrameType::Foundation,
            src,
            dst,
            cluster_id,
            cmd.into(),
            payload,
            cfg,
        )
        .await
    }

    /// Send a cluster specific command, the payload must be a json object or array.
    pub async fn zcl_functional(
        &self,
        src: &Arc<dyn Endpoint>,
        dst: &Arc<dyn Endpoint>,
        cluster: impl Into<ClusterRef>,
        cmd: impl Into<ZclCommand>,
        payload: ZclPayload,
        cfg: ZclConfig,
    ) -> Result<Option<ZclMessage>> {
        if !payload.is_structured() {
            return Err(AfError::InvalidPayload(
                "functional command payload should be an object or an array".into(),
            )
            .into());
        }
        let cluster_id = match cluster.into() {
            ClusterRef::Id(id) => id,
            ClusterRef::Name(name) => self
                .codec
                .cluster_id(&name)
                .ok_or(AfError::UnrecognizedCluster(name))?,
        };
        self.zcl_command(
            FrameType::Functional,
            src,
            dst,
            cluster_id,
            cmd.into(),
            payload,
            cfg,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn zcl_command(
        &self,
        frame_type: FrameType,
        src: &Arc<dyn Endpoint>,
        dst: &Arc<dyn Endpoint>,
        cluster_id: u16,
        cmd: ZclCommand,
        payload: ZclPayload,
        cfg: ZclConfig,
    ) -> Result<Option<ZclMessage>> {
        let self_addressed = same_endpoint(src, dst);
        let frame_cntl = FrameControl {
            frame_type,
            manuf_spec: cfg.manuf_spec,
            direction: cfg.direction.unwrap_or(if self_addressed {
                Direction::ClientToServer
            } else {
                Direction::ServerToClient
            }),
            dis_default_rsp: cfg.dis_default_rsp,
        };
        let manuf_code = if cfg.manuf_spec { dst.manuf_code() } else { 0 };
        let mandatory = frame_cntl.direction == Direction::ClientToServer;

        let reply_key = |seq: u8| CorrelationKey::ZclIncoming {
            addr: dst.nwk_addr(),
            endpoint: dst.ep_id(),
            src_endpoint: (!self_addressed).then(|| src.ep_id()),
            seq,
        };
        let seq = match cfg.seq_num {
            Some(seq) => seq,
            None => self.free_seq(mandatory, &reply_key)?,
        };

        let cluster_arg = (frame_type == FrameType::Functional).then_some(cluster_id);
        let data = self
            .codec
            .frame(&frame_cntl, manuf_code, seq, &cmd, &payload, cluster_arg)?;

        let pending = if mandatory {
            Some(self.registry.register(reply_key(seq), None, None)?)
        } else {
            None
        };
        log::trace!(
            "zcl {:?} {} seq:{} cluster:{} -> 0x{:04x}/{}",
            frame_type,
            cmd,
            seq,
            cluster_id,
            dst.nwk_addr(),
            dst.ep_id()
        );

        let sent = self
            .send(src, dst, cluster_id, &data, SendOptions::default())
            .await;
        let Some(pending) = pending else {
            return sent.map(|_| None);
        };
        if let Err(e) = sent {
            self.registry.reject(pending.key(), e);
        }
        let label = match frame_type {
            FrameType::Foundation => "zcl_foundation",
            FrameType::Functional => "zcl_functional",
        };
        await_response(pending, label, &cmd, seq).await.map(Some)
    }

    /// Draw sequence numbers until the reply key is free.
    fn free_seq(&self, mandatory: bool, reply_key: &dyn Fn(u8) -> CorrelationKey) -> Result<u8> {
        for _ in 0..=u8::MAX {
            let seq = self.seq.next();
            if !mandatory || !self.registry.is_pending(&reply_key(seq)) {
                return Ok(seq);
            }
        }
        Err(AfError::NoFreeId(format!("{} sequence number", reply_key(0))).into())
    }
}

async fn await_response(
    pending: PendingReply<Correlated>,
    label: &str,
    cmd: &ZclCommand,
    seq: u8,
) -> Result<ZclMessage> {
    match pending.recv().await {
        Ok(Correlated::Zcl(msg)) => Ok(msg.zcl_msg),
        Ok(_) => Err(AfError::UnexpectedResponse(format!("{}({}:{})", label, cmd, seq)).into()),
        Err(e) => match e.downcast::<AfError>() {
            Ok(AfError::Timeout { label: key }) => Err(AfError::Timeout {
                label: format!("{}({}:{}) {}", label, cmd, seq, key),
            }
            .into()),
            Ok(other) => Err(other.into()),
            Err(e) => Err(e),
        },
    }
}
