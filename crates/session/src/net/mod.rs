mod broadcast;
mod link;
mod protocol;

pub use broadcast::{Broadcast, BroadcastHub};
pub use link::{rand_percent, rand_u64, LinkSimulation, LinkStats, LinkStatsSnapshot};
pub use protocol::{
    BroadcastPacket, MoveEvent, PacketError, PacketHeader, MAX_PACKET_SIZE, PROTOCOL_MAGIC,
    PROTOCOL_VERSION,
};
