use rkyv::{rancor, util::AlignedVec, Archive, Deserialize, Serialize};

use crate::session::SessionId;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x54414E44;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct MoveEvent {
    pub session_id: String,
    pub ply_index: u32,
    pub uci: String,
    pub resulting_position: String,
}

impl MoveEvent {
    pub fn new(
        session_id: &SessionId,
        ply_index: u32,
        uci: impl Into<String>,
        resulting_position: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.as_str().to_string(),
            ply_index,
            uci: uci.into(),
            resulting_position: resulting_position.into(),
        }
    }

    pub fn is_for(&self, session_id: &SessionId) -> bool {
        self.session_id == session_id.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct BroadcastPacket {
    pub header: PacketHeader,
    pub event: MoveEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("bad header (magic {magic:#x}, version {version})")]
    BadHeader { magic: u32, version: u32 },
    #[error("packet of {0} bytes exceeds the maximum size")]
    TooLarge(usize),
}

impl BroadcastPacket {
    pub fn new(sequence: u32, event: MoveEvent) -> Self {
        Self {
            header: PacketHeader::new(sequence),
            event,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(data.len()));
        }
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);

        let packet = rkyv::from_bytes::<Self, rancor::Error>(&aligned)
            .map_err(PacketError::Deserialize)?;
        if !packet.header.is_valid() {
            return Err(PacketError::BadHeader {
                magic: packet.header.magic,
                version: packet.header.version,
            });
        }
        Ok(packet)
    }
}
