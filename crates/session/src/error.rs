use std::time::Duration;

use crate::net::PacketError;
use crate::session::{SessionId, SessionStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoveError {
    #[error("not your turn")]
    NotYourTurn,
    #[error("illegal move: {0}")]
    IllegalMove(String),
    #[error("session is not active")]
    SessionNotActive,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("stale write for session {session_id}: stored ply {stored}, attempted ply {attempted}")]
    Stale {
        session_id: SessionId,
        stored: u32,
        attempted: u32,
    },
    #[error("write for session {session_id} conflicts with stored history: {reason}")]
    Conflict { session_id: SessionId, reason: String },
    #[error("seat already taken in session {0}")]
    SeatTaken(SessionId),
    #[error("session {0} already exists")]
    AlreadyExists(SessionId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("broadcast unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RatingError {
    #[error("rating service unavailable: {0}")]
    Unavailable(String),
    #[error("settlement rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("no legal moves")]
    NoLegalMoves,
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("engine worker stopped")]
    WorkerStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("session {0} already exists")]
    AlreadyExists(SessionId),
    #[error("session {0} is full")]
    SessionFull(SessionId),
    #[error("player is already seated in session {0}")]
    AlreadySeated(SessionId),
    #[error("session {session_id} is {status}, not waiting")]
    NotWaiting {
        session_id: SessionId,
        status: SessionStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration: {reason}")]
pub struct ConfigError {
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Move(#[from] MoveError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error(transparent)]
    Lobby(#[from] LobbyError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session {0} is already attached")]
    AlreadyAttached(SessionId),
    #[error("session {0} is not attached")]
    NotAttached(SessionId),
}
