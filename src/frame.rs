//! ZCL frame level types shared by the engines and the codec collaborator.

use std::fmt;
use std::io::Cursor;

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// profile wide command
    Foundation = 0,
    /// cluster specific command
    Functional = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    ClientToServer = 0,
    ServerToClient = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameControl {
    pub frame_type: FrameType,
    pub manuf_spec: bool,
    pub direction: Direction,
    pub dis_default_rsp: bool,
}

impl FrameControl {
    const TYPE_MASK: u8 = 0x03;
    const FLAG_MANUF_SPEC: u8 = 0x04;
    const FLAG_DIRECTION: u8 = 0x08;
    const FLAG_DIS_DEFAULT_RSP: u8 = 0x10;

    pub fn encode(&self) -> u8 {
        let mut b = self.frame_type as u8;
        if self.manuf_spec {
            b |= Self::FLAG_MANUF_SPEC;
        }
        if self.direction == Direction::ServerToClient {
            b |= Self::FLAG_DIRECTION;
        }
        if self.dis_default_rsp {
            b |= Self::FLAG_DIS_DEFAULT_RSP;
        }
        b
    }

    pub fn decode(b: u8) -> Result<Self> {
        let frame_type = match b & Self::TYPE_MASK {
            0 => FrameType::Foundation,
            1 => FrameType::Functional,
            t => anyhow::bail!("reserved zcl frame type {}", t),
        };
        Ok(Self {
            frame_type,
            manuf_spec: b & Self::FLAG_MANUF_SPEC != 0,
            direction: if b & Self::FLAG_DIRECTION != 0 {
                Direction::ServerToClient
            } else {
                Direction::ClientToServer
            },
            dis_default_rsp: b & Self::FLAG_DIS_DEFAULT_RSP != 0,
        })
    }
}

/// Pre-parsed ZCL header, enough to decide how the rest of the frame is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZclHeader {
    pub frame_cntl: FrameControl,
    pub manuf_code: u16,
    pub seq_num: u8,
    pub cmd_id: u8,
}

impl ZclHeader {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let frame_cntl = FrameControl::decode(cursor.read_u8()?)?;
        let manuf_code = if frame_cntl.manuf_spec {
            cursor.read_u16::<LittleEndian>()?
        } else {
            0
        };
        let seq_num = cursor.read_u8()?;
        let cmd_id = cursor.read_u8()?;
        Ok(Self {
            frame_cntl,
            manuf_code,
            seq_num,
            cmd_id,
        })
    }
}

/// Command reference, either by name from the codec's table or by numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZclCommand {
    Name(String),
    Id(u8),
}

impl From<&str> for ZclCommand {
    fn from(name: &str) -> Self {
        ZclCommand::Name(name.to_owned())
    }
}

impl From<u8> for ZclCommand {
    fn from(id: u8) -> Self {
        ZclCommand::Id(id)
    }
}

impl fmt::Display for ZclCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZclCommand::Name(name) => f.write_str(name),
            ZclCommand::Id(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrInfo {
    pub attr_id: u16,
    pub data_type: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRecord {
    pub attr_id: u16,
    pub status: u8,
    pub data_type: Option<u8>,
    pub attr_data: serde_json::Value,
}

/// Command payloads. The interview engine relies on the typed variants,
/// everything else travels as a structured json value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ZclPayload {
    Read(Vec<u16>),
    ReadRsp(Vec<ReadRecord>),
    Discover { start_attr_id: u16, max_attr_ids: u8 },
    DiscoverRsp {
        disc_complete: bool,
        attr_infos: Vec<AttrInfo>,
    },
    Value(serde_json::Value),
}

impl ZclPayload {
    /// True for payloads a functional command can be built from.
    pub fn is_structured(&self) -> bool {
        match self {
            ZclPayload::Value(v) => v.is_object() || v.is_array(),
            _ => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ZclPayload::Value(serde_json::Value::Null))
    }
}

/// Parsed ZCL frame as produced by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZclMessage {
    pub frame_cntl: FrameControl,
    pub manuf_code: u16,
    pub seq_num: u8,
    pub cmd_id: String,
    pub payload: ZclPayload,
}
