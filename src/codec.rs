use anyhow::Result;

use crate::frame::{FrameControl, ZclCommand, ZclHeader, ZclMessage, ZclPayload};

/// ZCL frame codec together with the cluster and attribute name tables.
///
/// `frame` is expected to fail with [crate::error::AfError::UnrecognizedCommand] or
/// [crate::error::AfError::UnrecognizedCluster] for unknown names.
pub trait ZclCodec: Send + Sync {
    fn frame(
        &self,
        frame_cntl: &FrameControl,
        manuf_code: u16,
        seq_num: u8,
        cmd: &ZclCommand,
        payload: &ZclPayload,
        cluster_id: Option<u16>,
    ) -> Result<Vec<u8>>;

    /// Peek at the header of a possible ZCL frame.
    fn header(&self, data: &[u8]) -> Option<ZclHeader> {
        ZclHeader::decode(data).ok()
    }

    /// Parse a whole frame. Functional frames need their cluster id.
    fn parse(&self, data: &[u8], cluster_id: Option<u16>) -> Result<ZclMessage>;

    fn cluster_id(&self, name: &str) -> Option<u16>;
    fn cluster_name(&self, cluster_id: u16) -> Option<String>;
    fn attr_name(&self, cluster_id: u16, attr_id: u16) -> Option<String>;
}
