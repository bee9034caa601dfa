mod mirror;
mod registry;
mod state;

pub use mirror::{AdvanceOutcome, ConflictKind, SessionMirror};
pub use registry::SessionRegistry;
pub use state::{
    Color, GameResult, InvariantViolation, PlayerId, SessionId, SessionState, SessionStatus,
    TerminalReason,
};
