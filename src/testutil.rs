//! Mock collaborators for unit tests: a scripted controller, endpoints and a json frame codec.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::{
    af::Af,
    codec::ZclCodec,
    config::AfConfig,
    controller::{AfParams, Controller, Request, Response},
    endpoint::{Coordinator, Endpoint, Handler, HandlerKind},
    error::AfError,
    event::{DataConfirm, EndDeviceAnnounce, InboundEvent, Indication, IncomingMsg, ZclIncomingMsg},
    frame::{
        AttrInfo, Direction, FrameControl, FrameType, ReadRecord, ZclCommand, ZclHeader,
        ZclMessage, ZclPayload,
    },
};

pub const REMOTE_NWK: u16 = 0x1234;
pub const REMOTE_IEEE: u64 = 0x00124b0001020304;

pub struct MockEndpoint {
    ep_id: u8,
    nwk_addr: u16,
    ieee_addr: u64,
    profile_id: u16,
    manuf_code: u16,
    local: bool,
    delegator: bool,
    in_clusters: Vec<u16>,
    out_clusters: Vec<u16>,
    handlers: HashMap<HandlerKind, Handler>,
}

impl MockEndpoint {
    pub fn local(ep_id: u8) -> Self {
        Self {
            ep_id,
            nwk_addr: 0,
            ieee_addr: 0x00124b00000000aa,
            profile_id: 0x0104,
            manuf_code: 0,
            local: true,
            delegator: false,
            in_clusters: vec![],
            out_clusters: vec![],
            handlers: HashMap::new(),
        }
    }

    pub fn delegator(ep_id: u8, profile_id: u16) -> Self {
        Self {
            profile_id,
            delegator: true,
            ..Self::local(ep_id)
        }
    }

    pub fn remote(nwk_addr: u16, ep_id: u8, ieee_addr: u64) -> Self {
        Self {
            ep_id,
            nwk_addr,
            ieee_addr,
            profile_id: 0x0104,
            manuf_code: 0x115f,
            local: false,
            delegator: false,
            in_clusters: vec![0, 6],
            out_clusters: vec![],
            handlers: HashMap::new(),
        }
    }

    pub fn with_clusters(mut self, in_clusters: Vec<u16>, out_clusters: Vec<u16>) -> Self {
        self.in_clusters = in_clusters;
        self.out_clusters = out_clusters;
        self
    }

    pub fn with_handler(mut self, kind: HandlerKind, handler: Handler) -> Self {
        self.handlers.insert(kind, handler);
        self
    }
}

impl Endpoint for MockEndpoint {
    fn ep_id(&self) -> u8 {
        self.ep_id
    }
    fn nwk_addr(&self) -> u16 {
        self.nwk_addr
    }
    fn ieee_addr(&self) -> u64 {
        self.ieee_addr
    }
    fn profile_id(&self) -> u16 {
        self.profile_id
    }
    fn manuf_code(&self) -> u16 {
        self.manuf_code
    }
    fn is_local(&self) -> bool {
        self.local
    }
    fn is_delegator(&self) -> bool {
        self.delegator
    }
    fn in_clusters(&self) -> Vec<u16> {
        self.in_clusters.clone()
    }
    fn out_clusters(&self) -> Vec<u16> {
        self.out_clusters.clone()
    }
    fn handler(&self, kind: HandlerKind) -> Option<Handler> {
        self.handlers.get(&kind).cloned()
    }
}

pub struct MockCoordinator {
    endpoints: Vec<Arc<dyn Endpoint>>,
}

impl Coordinator for MockCoordinator {
    fn endpoint(&self, ep_id: u8) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.iter().find(|e| e.ep_id() == ep_id).cloned()
    }

    fn delegator(&self, profile_id: u16) -> Option<Arc<dyn Endpoint>> {
        self.endpoints
            .iter()
            .find(|e| e.is_delegator() && e.profile_id() == profile_id)
            .cloned()
    }
}

/// Frame as the json codec puts it on the air.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub frame_cntl: FrameControl,
    pub manuf_code: u16,
    pub seq_num: u8,
    pub cmd: String,
    pub payload: ZclPayload,
}

const CLUSTERS: &[(u16, &str)] = &[
    (0x0000, "genBasic"),
    (0x0006, "genOnOff"),
    (0x0008, "genLevelCtrl"),
    (0x0500, "ssIasZone"),
];

const ATTRS: &[(u16, u16, &str)] = &[
    (0x0000, 0x0000, "zclVersion"),
    (0x0000, 0x0004, "manufacturerName"),
    (0x0000, 0x0005, "modelId"),
    (0x0006, 0x0000, "onOff"),
];

const FOUNDATION_CMDS: &[&str] = &[
    "read",
    "readRsp",
    "write",
    "writeUndiv",
    "writeRsp",
    "writeNoRsp",
    "configReport",
    "configReportRsp",
    "readReportConfig",
    "readReportConfigRsp",
    "report",
    "defaultRsp",
    "discover",
    "discoverRsp",
];

const FUNCTIONAL_CMDS: &[&str] = &["off", "on", "toggle", "statusChangeNotification"];

fn commands(frame_type: FrameType) -> &'static [&'static str] {
    match frame_type {
        FrameType::Foundation => FOUNDATION_CMDS,
        FrameType::Functional => FUNCTIONAL_CMDS,
    }
}

/// Codec writing frames as json.
pub struct JsonCodec;

impl ZclCodec for JsonCodec {
    fn frame(
        &self,
        frame_cntl: &FrameControl,
        manuf_code: u16,
        seq_num: u8,
        cmd: &ZclCommand,
        payload: &ZclPayload,
        cluster_id: Option<u16>,
    ) -> Result<Vec<u8>> {
        let known = commands(frame_cntl.frame_type);
        let cmd = match cmd {
            ZclCommand::Name(name) if known.contains(&name.as_str()) => name.clone(),
            ZclCommand::Id(id) if (*id as usize) < known.len() => known[*id as usize].to_string(),
            other => return Err(AfError::UnrecognizedCommand(other.to_string()).into()),
        };
        if frame_cntl.frame_type == FrameType::Functional
            && cluster_id.and_then(|c| self.cluster_name(c)).is_none()
        {
            return Err(AfError::UnrecognizedCluster(format!("{:?}", cluster_id)).into());
        }
        let frame = WireFrame {
            frame_cntl: *frame_cntl,
            manuf_code,
            seq_num,
            cmd,
            payload: payload.clone(),
        };
        Ok(serde_json::to_vec(&frame)?)
    }

    fn header(&self, data: &[u8]) -> Option<ZclHeader> {
        let frame: WireFrame = serde_json::from_slice(data).ok()?;
        let cmd_id = commands(frame.frame_cntl.frame_type)
            .iter()
            .position(|c| *c == frame.cmd)
            .unwrap_or(0xff) as u8;
        Some(ZclHeader {
            frame_cntl: frame.frame_cntl,
            manuf_code: frame.manuf_code,
            seq_num: frame.seq_num,
            cmd_id,
        })
    }

    fn parse(&self, data: &[u8], cluster_id: Option<u16>) -> Result<ZclMessage> {
        let frame: WireFrame = serde_json::from_slice(data)?;
        if !commands(frame.frame_cntl.frame_type).contains(&frame.cmd.as_str()) {
            return Err(AfError::UnrecognizedCommand(frame.cmd).into());
        }
        if frame.frame_cntl.frame_type == FrameType::Functional && cluster_id.is_none() {
            return Err(AfError::UnrecognizedCluster("none".into()).into());
        }
        Ok(ZclMessage {
            frame_cntl: frame.frame_cntl,
            manuf_code: frame.manuf_code,
            seq_num: frame.seq_num,
            cmd_id: frame.cmd,
            payload: frame.payload,
        })
    }

    fn cluster_id(&self, name: &str) -> Option<u16> {
        CLUSTERS.iter().find(|(_, n)| *n == name).map(|(id, _)| *id)
    }

    fn cluster_name(&self, cluster_id: u16) -> Option<String> {
        CLUSTERS
            .iter()
            .find(|(id, _)| *id == cluster_id)
            .map(|(_, n)| n.to_string())
    }

    fn attr_name(&self, cluster_id: u16, attr_id: u16) -> Option<String> {
        ATTRS
            .iter()
            .find(|(c, a, _)| *c == cluster_id && *a == attr_id)
            .map(|(_, _, n)| n.to_string())
    }
}

pub fn decode_frame(data: &[u8]) -> WireFrame {
    serde_json::from_slice(data).unwrap()
}

/// Frame as sent by a remote device answering a request.
pub fn encode_frame(frame_type: FrameType, seq_num: u8, cmd: &str, payload: ZclPayload) -> Vec<u8> {
    serde_json::to_vec(&WireFrame {
        frame_cntl: server_frame(frame_type),
        manuf_code: 0,
        seq_num,
        cmd: cmd.to_string(),
        payload,
    })
    .unwrap()
}

fn server_frame(frame_type: FrameType) -> FrameControl {
    FrameControl {
        frame_type,
        manuf_spec: false,
        direction: Direction::ServerToClient,
        dis_default_rsp: true,
    }
}

pub fn incoming(src_addr: u16, src_endpoint: u8, dst_endpoint: u8, cluster_id: u16, data: Vec<u8>) -> IncomingMsg {
    IncomingMsg {
        group_id: 0,
        cluster_id,
        src_addr,
        src_endpoint,
        dst_endpoint,
        was_broadcast: false,
        link_quality: 120,
        security_use: false,
        timestamp: 0,
        trans_seq_number: 0,
        data,
    }
}

pub fn confirm(endpoint: u8, trans_id: u8, status: u8) -> InboundEvent {
    InboundEvent::DataConfirm(DataConfirm {
        status,
        endpoint,
        trans_id,
    })
}

/// Parsed answer of the addressed device to a ZCL request.
pub fn zcl_reply(p: &AfParams, cmd_id: &str, payload: ZclPayload) -> InboundEvent {
    let request = decode_frame(&p.data);
    InboundEvent::ZclIncomingMsg(ZclIncomingMsg {
        msg: incoming(p.dst_addr, p.dst_endpoint, p.src_endpoint, p.cluster_id, vec![]),
        zcl_msg: ZclMessage {
            frame_cntl: server_frame(FrameType::Foundation),
            manuf_code: 0,
            seq_num: request.seq_num,
            cmd_id: cmd_id.to_string(),
            payload,
        },
    })
}

/// Accepted by the transport and confirmed by the radio.
pub fn delivered(p: &AfParams) -> Scripted {
    Scripted::ok().with_event(confirm(p.src_endpoint, p.trans_id, 0))
}

/// Device exposing `attrs` on every cluster. Answers discover and read, confirms everything else.
pub fn device_reply(p: &AfParams, attrs: &[u16]) -> Scripted {
    let frame = decode_frame(&p.data);
    match frame.payload {
        ZclPayload::Discover {
            start_attr_id,
            max_attr_ids,
        } => {
            let mut ids: Vec<u16> = attrs.iter().copied().filter(|a| *a >= start_attr_id).collect();
            ids.sort_unstable();
            let disc_complete = ids.len() <= max_attr_ids as usize;
            ids.truncate(max_attr_ids as usize);
            let attr_infos = ids
                .into_iter()
                .map(|attr_id| AttrInfo {
                    attr_id,
                    data_type: 0x20,
                })
                .collect();
            let payload = ZclPayload::DiscoverRsp {
                disc_complete,
                attr_infos,
            };
            delivered(p).with_event(zcl_reply(p, "discoverRsp", payload))
        }
        ZclPayload::Read(ids) => {
            let records = ids
                .into_iter()
                .map(|attr_id| {
                    if attrs.contains(&attr_id) {
                        ReadRecord {
                            attr_id,
                            status: 0,
                            data_type: Some(0x20),
                            attr_data: json!(attr_id),
                        }
                    } else {
                        ReadRecord {
                            attr_id,
                            status: 0x86,
                            data_type: None,
                            attr_data: serde_json::Value::Null,
                        }
                    }
                })
                .collect();
            delivered(p).with_event(zcl_reply(p, "readRsp", ZclPayload::ReadRsp(records)))
        }
        _ => delivered(p),
    }
}

/// Scripted outcome of one controller request.
pub struct Scripted {
    pub response: Result<Response, String>,
    pub events: Vec<InboundEvent>,
}

impl Scripted {
    pub fn ok() -> Self {
        Self::ok_with(Response::default())
    }

    pub fn ok_with(response: Response) -> Self {
        Self {
            response: Ok(response),
            events: vec![],
        }
    }

    pub fn status(status: u8) -> Self {
        Self::ok_with(Response {
            status,
            ..Default::default()
        })
    }

    pub fn fail(msg: &str) -> Self {
        Self {
            response: Err(msg.to_string()),
            events: vec![],
        }
    }

    pub fn with_event(mut self, event: InboundEvent) -> Self {
        self.events.push(event);
        self
    }
}

type Responder = Box<dyn FnMut(&Request) -> Scripted + Send>;

pub struct MockController {
    trans_id: AtomicU8,
    responder: Mutex<Responder>,
    requests: Mutex<Vec<Request>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundEvent>>>,
    coordinator: Mutex<Option<Arc<MockCoordinator>>>,
    devices: Mutex<Vec<Arc<dyn Endpoint>>>,
    /// devices that rejoin when announced
    away: Mutex<Vec<Arc<dyn Endpoint>>>,
    listeners: Mutex<HashMap<u64, Vec<oneshot::Sender<()>>>>,
    announces: Mutex<Vec<EndDeviceAnnounce>>,
    /// announces are only recorded
    hold_announces: AtomicBool,
}

impl MockController {
    fn new(coordinator: Arc<MockCoordinator>, devices: Vec<Arc<dyn Endpoint>>, responder: Responder) -> Self {
        Self {
            trans_id: AtomicU8::new(0),
            responder: Mutex::new(responder),
            requests: Mutex::new(vec![]),
            inbound: Mutex::new(None),
            coordinator: Mutex::new(Some(coordinator)),
            devices: Mutex::new(devices),
            away: Mutex::new(vec![]),
            listeners: Mutex::new(HashMap::new()),
            announces: Mutex::new(vec![]),
            hold_announces: AtomicBool::new(false),
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn data_requests(&self) -> Vec<AfParams> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::DataRequest(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Next transaction id handed out.
    pub fn set_trans_id(&self, trans_id: u8) {
        self.trans_id.store(trans_id.wrapping_sub(1), Ordering::SeqCst);
    }

    pub fn clear_coordinator(&self) {
        *self.coordinator.lock().unwrap() = None;
    }

    /// Drop a device from the endpoint table until it is announced.
    pub fn forget(&self, nwk_addr: u16) {
        let mut devices = self.devices.lock().unwrap();
        let (gone, kept): (Vec<_>, Vec<_>) =
            devices.drain(..).partition(|d| d.nwk_addr() == nwk_addr);
        *devices = kept;
        self.away.lock().unwrap().extend(gone);
    }

    /// The device stays silent after being announced.
    pub fn lose_on_announce(&self, ieee_addr: u64) {
        self.away.lock().unwrap().retain(|d| d.ieee_addr() != ieee_addr);
    }

    /// Announced devices neither rejoin nor speak until told with [Self::rejoin] and [Self::heard_from].
    pub fn hold_announces(&self) {
        self.hold_announces.store(true, Ordering::SeqCst);
    }

    pub fn rejoin(&self, ieee_addr: u64) {
        let back: Vec<_> = {
            let mut away = self.away.lock().unwrap();
            let (back, still): (Vec<_>, Vec<_>) =
                away.drain(..).partition(|d| d.ieee_addr() == ieee_addr);
            *away = still;
            back
        };
        self.devices.lock().unwrap().extend(back);
    }

    pub fn heard_from(&self, ieee_addr: u64) {
        let listeners = self
            .listeners
            .lock()
            .unwrap()
            .remove(&ieee_addr)
            .unwrap_or_default();
        for tx in listeners {
            let _ = tx.send(());
        }
    }

    pub fn announces(&self) -> Vec<EndDeviceAnnounce> {
        self.announces.lock().unwrap().clone()
    }
}

#[async_trait]
impl Controller for MockController {
    fn next_trans_id(&self) -> u8 {
        self.trans_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    async fn request(&self, request: Request) -> Result<Response> {
        self.requests.lock().unwrap().push(request.clone());
        let scripted = {
            let mut responder = self.responder.lock().unwrap();
            let responder = &mut *responder;
            responder(&request)
        };
        if let Some(inbound) = self.inbound.lock().unwrap().as_ref() {
            for event in scripted.events {
                let _ = inbound.send(event);
            }
        }
        scripted.response.map_err(|e| anyhow::anyhow!(e))
    }

    fn coordinator(&self) -> Option<Arc<dyn Coordinator>> {
        let coordinator = self.coordinator.lock().unwrap().clone()?;
        Some(coordinator)
    }

    fn find_endpoint(&self, nwk_addr: u16, ep_id: u8) -> Option<Arc<dyn Endpoint>> {
        if nwk_addr == 0 {
            return self.coordinator()?.endpoint(ep_id);
        }
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.nwk_addr() == nwk_addr && d.ep_id() == ep_id)
            .cloned()
    }

    fn once_incoming(&self, ieee_addr: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.listeners
            .lock()
            .unwrap()
            .entry(ieee_addr)
            .or_default()
            .push(tx);
        rx
    }

    fn announce(&self, announce: EndDeviceAnnounce) {
        self.announces.lock().unwrap().push(announce.clone());
        if self.hold_announces.load(Ordering::SeqCst) {
            return;
        }
        let known = self.devices.lock().unwrap().len();
        self.rejoin(announce.ieee_addr);
        if self.devices.lock().unwrap().len() == known {
            return;
        }
        self.heard_from(announce.ieee_addr);
    }
}

/// Local endpoint 1, delegator endpoint 2 for the home automation profile, and one remote device.
pub struct Fixture {
    pub af: Arc<Af>,
    pub indications: mpsc::UnboundedReceiver<Indication>,
    pub controller: Arc<MockController>,
    pub local: Arc<dyn Endpoint>,
    pub delegator: Arc<dyn Endpoint>,
    pub remote: Arc<dyn Endpoint>,
}

impl Fixture {
    pub fn new(responder: impl FnMut(&Request) -> Scripted + Send + 'static) -> Self {
        Self::build(
            MockEndpoint::local(1),
            MockEndpoint::remote(REMOTE_NWK, 1, REMOTE_IEEE),
            AfConfig::default(),
            responder,
        )
    }

    pub fn with(
        remote: MockEndpoint,
        config: AfConfig,
        responder: impl FnMut(&Request) -> Scripted + Send + 'static,
    ) -> Self {
        Self::build(MockEndpoint::local(1), remote, config, responder)
    }

    pub fn with_local(
        local: MockEndpoint,
        responder: impl FnMut(&Request) -> Scripted + Send + 'static,
    ) -> Self {
        Self::build(
            local,
            MockEndpoint::remote(REMOTE_NWK, 1, REMOTE_IEEE),
            AfConfig::default(),
            responder,
        )
    }

    pub fn build(
        local: MockEndpoint,
        remote: MockEndpoint,
        config: AfConfig,
        responder: impl FnMut(&Request) -> Scripted + Send + 'static,
    ) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let local: Arc<dyn Endpoint> = Arc::new(local);
        let delegator: Arc<dyn Endpoint> = Arc::new(MockEndpoint::delegator(2, 0x0104));
        let remote: Arc<dyn Endpoint> = Arc::new(remote);
        let coordinator = Arc::new(MockCoordinator {
            endpoints: vec![local.clone(), delegator.clone()],
        });
        let controller = Arc::new(MockController::new(
            coordinator,
            vec![remote.clone()],
            Box::new(responder),
        ));
        let (af, indications) = Af::new(controller.clone(), Arc::new(JsonCodec), config);
        *controller.inbound.lock().unwrap() = Some(af.inbound());
        Self {
            af,
            indications,
            controller,
            local,
            delegator,
            remote,
        }
    }
}

/// Poll `cond` until it holds, failing the test after ten seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
