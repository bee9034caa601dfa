//! Move legality and terminal detection.
//!
//! The synchronization core never interprets positions itself; everything
//! board-related goes through [`RuleEngine`].

mod standard;

pub use standard::StandardChess;

use crate::session::{Color, GameResult, TerminalReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveVerdict {
    pub legal: bool,
    /// Position after the move; the unchanged input position when illegal.
    pub new_position: String,
    pub is_check: bool,
    pub is_terminal: bool,
    pub terminal_reason: Option<TerminalReason>,
    pub result: Option<GameResult>,
}

impl MoveVerdict {
    pub fn illegal(position: &str) -> Self {
        Self {
            legal: false,
            new_position: position.to_string(),
            is_check: false,
            is_terminal: false,
            terminal_reason: None,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionReport {
    pub side_to_move: Color,
    pub is_check: bool,
    pub terminal: Option<(GameResult, TerminalReason)>,
}

impl PositionReport {
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }
}

pub trait RuleEngine: Send + Sync {
    fn initial_position(&self) -> String;

    fn apply_move(&self, position: &str, uci: &str) -> MoveVerdict;

    fn legal_moves_from(&self, position: &str, square: &str) -> Vec<String>;

    fn inspect(&self, position: &str) -> PositionReport;
}
