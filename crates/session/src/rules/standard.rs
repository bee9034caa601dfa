use std::collections::BTreeSet;

use shakmaty::{
    fen::Fen, uci::UciMove, CastlingMode, Chess, EnPassantMode, Position, Square,
};

use super::{MoveVerdict, PositionReport, RuleEngine};
use crate::session::{Color, GameResult, TerminalReason};

const FIFTY_MOVE_HALFMOVES: u32 = 100;

impl From<shakmaty::Color> for Color {
    fn from(c: shakmaty::Color) -> Self {
        match c {
            shakmaty::Color::White => Self::White,
            shakmaty::Color::Black => Self::Black,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardChess;

impl StandardChess {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn parse(position: &str) -> Option<Chess> {
        let fen: Fen = position.parse().ok()?;
        fen.into_position(CastlingMode::Standard).ok()
    }

    pub(crate) fn to_fen(position: &Chess) -> String {
        Fen::from_position(position.clone(), EnPassantMode::Legal).to_string()
    }

    pub(crate) fn report(position: &Chess) -> PositionReport {
        let side_to_move = Color::from(position.turn());

        let terminal = if position.is_checkmate() {
            Some((
                GameResult::win_for(side_to_move.opposite()),
                TerminalReason::Checkmate,
            ))
        } else if position.is_stalemate() {
            Some((GameResult::Draw, TerminalReason::Stalemate))
        } else if position.is_insufficient_material() {
            Some((GameResult::Draw, TerminalReason::InsufficientMaterial))
        } else if position.halfmoves() >= FIFTY_MOVE_HALFMOVES {
            Some((GameResult::Draw, TerminalReason::FiftyMoveRule))
        } else {
            None
        };

        PositionReport {
            side_to_move,
            is_check: position.is_check(),
            terminal,
        }
    }
}

impl RuleEngine for StandardChess {
    fn initial_position(&self) -> String {
        Self::to_fen(&Chess::default())
    }

    fn apply_move(&self, position: &str, uci: &str) -> MoveVerdict {
        let Some(current) = Self::parse(position) else {
            log::warn!("Cannot parse position {:?}", position);
            return MoveVerdict::illegal(position);
        };
        if Self::report(&current).is_terminal() {
            return MoveVerdict::illegal(position);
        }

        let Ok(parsed) = uci.parse::<UciMove>() else {
            return MoveVerdict::illegal(position);
        };
        let Ok(m) = parsed.to_move(&current) else {
            return MoveVerdict::illegal(position);
        };

        match current.play(&m) {
            Ok(next) => {
                let report = Self::report(&next);
                MoveVerdict {
                    legal: true,
                    new_position: Self::to_fen(&next),
                    is_check: report.is_check,
                    is_terminal: report.is_terminal(),
                    terminal_reason: report.terminal.map(|(_, reason)| reason),
                    result: report.terminal.map(|(result, _)| result),
                }
            }
            Err(_) => MoveVerdict::illegal(position),
        }
    }

    fn legal_moves_from(&self, position: &str, square: &str) -> Vec<String> {
        let (Some(current), Ok(from)) = (Self::parse(position), square.parse::<Square>()) else {
            return Vec::new();
        };

        current
            .legal_moves()
            .iter()
            .filter(|m| m.from() == Some(from))
            .map(|m| m.to().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn inspect(&self, position: &str) -> PositionReport {
        match Self::parse(position) {
            Some(current) => Self::report(&current),
            None => {
                log::warn!("Cannot inspect unparsable position {:?}", position);
                PositionReport {
                    side_to_move: Color::White,
                    is_check: false,
                    terminal: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_all(rules: &StandardChess, moves: &[&str]) -> String {
        let mut position = rules.initial_position();
        for uci in moves {
            let verdict = rules.apply_move(&position, uci);
            assert!(verdict.legal, "{uci} should be legal");
            position = verdict.new_position;
        }
        position
    }

    #[test]
    fn test_opening_moves() {
        let rules = StandardChess::new();
        let start = rules.initial_position();

        let verdict = rules.apply_move(&start, "e2e4");
        assert!(verdict.legal);
        assert!(!verdict.is_terminal);
        assert_eq!(rules.inspect(&verdict.new_position).side_to_move, Color::Black);
    }

    #[test]
    fn test_illegal_move() {
        let rules = StandardChess::new();
        let start = rules.initial_position();

        let verdict = rules.apply_move(&start, "e2e5");
        assert!(!verdict.legal);
        assert_eq!(verdict.new_position, start);

        assert!(!rules.apply_move(&start, "e7e5").legal);
        assert!(!rules.apply_move(&start, "garbage").legal);
        assert!(!rules.apply_move("not a fen", "e2e4").legal);
    }

    #[test]
    fn test_fools_mate() {
        let rules = StandardChess::new();
        let before_mate = play_all(&rules, &["f2f3", "e7e5", "g2g4"]);

        let verdict = rules.apply_move(&before_mate, "d8h4");
        assert!(verdict.legal);
        assert!(verdict.is_check);
        assert!(verdict.is_terminal);
        assert_eq!(verdict.terminal_reason, Some(TerminalReason::Checkmate));
        assert_eq!(verdict.result, Some(GameResult::BlackWin));

        let report = rules.inspect(&verdict.new_position);
        assert_eq!(
            report.terminal,
            Some((GameResult::BlackWin, TerminalReason::Checkmate))
        );
        assert!(!rules.apply_move(&verdict.new_position, "e2e4").legal);
    }

    #[test]
    fn test_draw_by_rule() {
        let rules = StandardChess::new();

        let stalemate = rules.inspect("8/8/8/8/8/6q1/5k2/7K w - - 0 1");
        assert_eq!(
            stalemate.terminal,
            Some((GameResult::Draw, TerminalReason::Stalemate))
        );

        let bare_kings = rules.inspect("8/8/8/4k3/8/8/8/4K3 w - - 0 1");
        assert_eq!(
            bare_kings.terminal,
            Some((GameResult::Draw, TerminalReason::InsufficientMaterial))
        );

        let fifty = rules.inspect("8/8/8/4k3/8/8/8/R3K3 w - - 100 80");
        assert_eq!(
            fifty.terminal,
            Some((GameResult::Draw, TerminalReason::FiftyMoveRule))
        );
    }

    #[test]
    fn test_legal_moves_from() {
        let rules = StandardChess::new();
        let start = rules.initial_position();

        assert_eq!(rules.legal_moves_from(&start, "e2"), vec!["e3", "e4"]);
        assert_eq!(rules.legal_moves_from(&start, "g1"), vec!["f3", "h3"]);
        assert!(rules.legal_moves_from(&start, "e7").is_empty());
        assert!(rules.legal_moves_from(&start, "z9").is_empty());

        let promotion = "8/P7/8/8/8/8/8/4K2k w - - 0 1";
        assert_eq!(rules.legal_moves_from(promotion, "a7"), vec!["a8"]);
    }
}
