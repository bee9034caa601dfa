pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod lobby;
pub mod net;
pub mod opponent;
pub mod rating;
pub mod rules;
pub mod session;
pub mod store;
pub mod sync;

pub use client::{Services, SessionClient};
pub use config::{RetryPolicy, SyncConfig};
pub use error::{
    BroadcastError, ConfigError, EngineError, LobbyError, MoveError, RatingError, StoreError,
    SyncError,
};
pub use events::{SessionEvent, UpdateSource};
pub use feed::Subscription;
pub use lobby::Lobby;
pub use net::{
    Broadcast, BroadcastHub, BroadcastPacket, LinkSimulation, LinkStats, LinkStatsSnapshot,
    MoveEvent, PacketError, PacketHeader, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use opponent::{GreedySearch, OpponentClient, RequestId, SearchBudget, SearchEngine};
pub use rating::{EloLedger, PlayerRating, RatingService};
pub use rules::{MoveVerdict, PositionReport, RuleEngine, StandardChess};
pub use session::{
    AdvanceOutcome, Color, ConflictKind, GameResult, InvariantViolation, PlayerId, SessionId,
    SessionMirror, SessionRegistry, SessionState, SessionStatus, TerminalReason,
};
pub use store::{DurableStore, MemoryStore, StoreCounters};
pub use sync::{
    ConnectionState, ConnectionSupervisor, Inbound, MoveApplier, OutboundMove,
    ReconciliationEngine, ResyncHandle, SettlementOutcome, TerminationCoordinator,
};
