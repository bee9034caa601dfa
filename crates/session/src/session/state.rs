use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub const fn opposite(self) -> Self {
        match self {
            Self::White => Self::Black,
            Self::Black => Self::White,
        }
    }

    pub const fn for_ply(ply_index: u32) -> Self {
        if ply_index % 2 == 0 {
            Self::White
        } else {
            Self::Black
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::White => f.write_str("white"),
            Self::Black => f.write_str("black"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Playing,
    Finished,
    Abandoned,
}

impl SessionStatus {
    /// Position in the forward-only lifecycle. `Finished` and `Abandoned` are
    /// both terminal and share a rank.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::Playing => 1,
            Self::Finished | Self::Abandoned => 2,
        }
    }

    pub const fn is_retired(self) -> bool {
        matches!(self, Self::Finished | Self::Abandoned)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        self == next || next.rank() > self.rank()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => f.write_str("waiting"),
            Self::Playing => f.write_str("playing"),
            Self::Finished => f.write_str("finished"),
            Self::Abandoned => f.write_str("abandoned"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameResult {
    WhiteWin,
    BlackWin,
    Draw,
}

impl GameResult {
    pub const fn win_for(color: Color) -> Self {
        match color {
            Color::White => Self::WhiteWin,
            Color::Black => Self::BlackWin,
        }
    }

    pub const fn winner(self) -> Option<Color> {
        match self {
            Self::WhiteWin => Some(Color::White),
            Self::BlackWin => Some(Color::Black),
            Self::Draw => None,
        }
    }

    pub fn white_score(self) -> f64 {
        match self {
            Self::WhiteWin => 1.0,
            Self::Draw => 0.5,
            Self::BlackWin => 0.0,
        }
    }
}

impl fmt::Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WhiteWin => f.write_str("1-0"),
            Self::BlackWin => f.write_str("0-1"),
            Self::Draw => f.write_str("1/2-1/2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    FiftyMoveRule,
    Resignation,
    Timeout,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checkmate => f.write_str("checkmate"),
            Self::Stalemate => f.write_str("stalemate"),
            Self::InsufficientMaterial => f.write_str("insufficient material"),
            Self::FiftyMoveRule => f.write_str("fifty-move rule"),
            Self::Resignation => f.write_str("resignation"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("ply index {ply_index} does not match move log length {log_len}")]
    PlyMismatch { ply_index: u32, log_len: usize },
    #[error("result must be set exactly when the session is finished (status {status})")]
    ResultWithoutFinish { status: SessionStatus },
    #[error("playing session is missing a seated player")]
    EmptySeat,
}

/// The shared game session. Every mutation of the board goes through
/// `ply_index`, which is the only ordering the synchronization layer trusts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub white: Option<PlayerId>,
    pub black: Option<PlayerId>,
    pub position: String,
    pub ply_index: u32,
    pub move_log: Vec<String>,
    pub status: SessionStatus,
    pub result: Option<GameResult>,
    pub termination: Option<TerminalReason>,
    pub settlement_done: bool,
}

impl SessionState {
    pub fn new(
        session_id: SessionId,
        creator: PlayerId,
        color: Color,
        start_position: impl Into<String>,
    ) -> Self {
        let (white, black) = match color {
            Color::White => (Some(creator), None),
            Color::Black => (None, Some(creator)),
        };

        Self {
            session_id,
            white,
            black,
            position: start_position.into(),
            ply_index: 0,
            move_log: Vec::new(),
            status: SessionStatus::Waiting,
            result: None,
            termination: None,
            settlement_done: false,
        }
    }

    pub fn turn(&self) -> Color {
        Color::for_ply(self.ply_index)
    }

    pub fn player(&self, color: Color) -> Option<&PlayerId> {
        match color {
            Color::White => self.white.as_ref(),
            Color::Black => self.black.as_ref(),
        }
    }

    pub fn color_of(&self, player: &PlayerId) -> Option<Color> {
        if self.white.as_ref() == Some(player) {
            Some(Color::White)
        } else if self.black.as_ref() == Some(player) {
            Some(Color::Black)
        } else {
            None
        }
    }

    pub fn open_seat(&self) -> Option<Color> {
        match (&self.white, &self.black) {
            (None, _) => Some(Color::White),
            (_, None) => Some(Color::Black),
            _ => None,
        }
    }

    pub fn with_move(&self, uci: impl Into<String>, position: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.move_log.push(uci.into());
        next.ply_index += 1;
        next.position = position.into();
        next
    }

    pub fn finished(&self, result: GameResult, reason: TerminalReason) -> Self {
        let mut next = self.clone();
        next.status = SessionStatus::Finished;
        next.result = Some(result);
        next.termination = Some(reason);
        next
    }

    pub fn last_move(&self) -> Option<&str> {
        self.move_log.last().map(String::as_str)
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.ply_index as usize != self.move_log.len() {
            return Err(InvariantViolation::PlyMismatch {
                ply_index: self.ply_index,
                log_len: self.move_log.len(),
            });
        }
        if self.result.is_some() != (self.status == SessionStatus::Finished) {
            return Err(InvariantViolation::ResultWithoutFinish {
                status: self.status,
            });
        }
        if self.status == SessionStatus::Playing && self.open_seat().is_some() {
            return Err(InvariantViolation::EmptySeat);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    fn playing() -> SessionState {
        let mut state = SessionState::new(
            SessionId::new("s1"),
            PlayerId::new("alice"),
            Color::White,
            START,
        );
        state.black = Some(PlayerId::new("bob"));
        state.status = SessionStatus::Playing;
        state
    }

    #[test]
    fn test_turn_follows_ply_parity() {
        let state = playing();
        assert_eq!(state.turn(), Color::White);

        let state = state.with_move("e2e4", "after-e4");
        assert_eq!(state.turn(), Color::Black);
        assert_eq!(state.ply_index, 1);
        assert_eq!(state.move_log, vec!["e2e4".to_string()]);
    }

    #[test]
    fn test_creator_takes_requested_seat() {
        let state = SessionState::new(
            SessionId::new("s1"),
            PlayerId::new("carol"),
            Color::Black,
            START,
        );
        assert_eq!(state.color_of(&PlayerId::new("carol")), Some(Color::Black));
        assert_eq!(state.open_seat(), Some(Color::White));
        assert_eq!(state.status, SessionStatus::Waiting);
    }

    #[test]
    fn test_status_is_forward_only() {
        assert!(SessionStatus::Waiting.can_transition_to(SessionStatus::Playing));
        assert!(SessionStatus::Playing.can_transition_to(SessionStatus::Finished));
        assert!(!SessionStatus::Finished.can_transition_to(SessionStatus::Playing));
        assert!(!SessionStatus::Finished.can_transition_to(SessionStatus::Abandoned));
    }

    #[test]
    fn test_invariants() {
        let state = playing();
        assert!(state.check_invariants().is_ok());

        let mut broken = state.clone();
        broken.ply_index = 3;
        assert!(matches!(
            broken.check_invariants(),
            Err(InvariantViolation::PlyMismatch { .. })
        ));

        let mut broken = state.clone();
        broken.result = Some(GameResult::Draw);
        assert!(broken.check_invariants().is_err());

        let finished = state.finished(GameResult::BlackWin, TerminalReason::Resignation);
        assert!(finished.check_invariants().is_ok());
        assert_eq!(finished.result.and_then(GameResult::winner), Some(Color::Black));
    }
}
