//! Post-game rating settlement.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::RatingError;
use crate::feed::lock;
use crate::session::{GameResult, PlayerId, SessionId};

/// External rating update. Called at most once per finished session, by
/// whichever client wins the settlement compare-and-set.
#[async_trait]
pub trait RatingService: Send + Sync {
    async fn settle(
        &self,
        session_id: &SessionId,
        result: GameResult,
        white: &PlayerId,
        black: &PlayerId,
    ) -> Result<(), RatingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerRating {
    pub elo: i32,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    pub peak_elo: i32,
}

impl PlayerRating {
    pub const STARTING_ELO: i32 = 1200;

    pub fn new() -> Self {
        Self {
            elo: Self::STARTING_ELO,
            wins: 0,
            losses: 0,
            draws: 0,
            peak_elo: Self::STARTING_ELO,
        }
    }

    pub const fn total_games(&self) -> u32 {
        self.wins + self.losses + self.draws
    }

    fn record(&mut self, change: i32, score: f64) {
        self.elo += change;
        self.peak_elo = self.peak_elo.max(self.elo);
        if score >= 1.0 {
            self.wins += 1;
        } else if score <= 0.0 {
            self.losses += 1;
        } else {
            self.draws += 1;
        }
    }
}

impl Default for PlayerRating {
    fn default() -> Self {
        Self::new()
    }
}

mod elo {
    pub const K_FACTOR: f64 = 32.0;

    pub fn expected_score(rating_a: i32, rating_b: i32) -> f64 {
        1.0 / (1.0 + 10_f64.powf((rating_b - rating_a) as f64 / 400.0))
    }

    pub fn rating_change(rating: i32, opponent_rating: i32, actual_score: f64) -> i32 {
        let expected = expected_score(rating, opponent_rating);
        (K_FACTOR * (actual_score - expected)).round() as i32
    }
}

#[derive(Debug, Default)]
struct Ledger {
    ratings: HashMap<PlayerId, PlayerRating>,
    settled: HashSet<SessionId>,
}

#[derive(Debug, Default)]
pub struct EloLedger {
    ledger: Mutex<Ledger>,
    calls: AtomicU64,
    failing_calls: AtomicU32,
}

impl EloLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_calls(&self, count: u32) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    pub fn rating(&self, player: &PlayerId) -> PlayerRating {
        lock(&self.ledger)
            .ratings
            .get(player)
            .copied()
            .unwrap_or_default()
    }

    pub fn settle_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_settled(&self, session_id: &SessionId) -> bool {
        lock(&self.ledger).settled.contains(session_id)
    }
}

#[async_trait]
impl RatingService for EloLedger {
    async fn settle(
        &self,
        session_id: &SessionId,
        result: GameResult,
        white: &PlayerId,
        black: &PlayerId,
    ) -> Result<(), RatingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RatingError::Unavailable("injected failure".to_string()));
        }
        if white == black {
            return Err(RatingError::Rejected(format!(
                "{} cannot play against themselves",
                white
            )));
        }

        let mut ledger = lock(&self.ledger);
        if !ledger.settled.insert(session_id.clone()) {
            log::warn!("Session {} was already settled, ignoring", session_id);
            return Ok(());
        }

        let white_rating = ledger.ratings.get(white).copied().unwrap_or_default();
        let black_rating = ledger.ratings.get(black).copied().unwrap_or_default();
        let white_score = result.white_score();
        let black_score = 1.0 - white_score;

        let white_change = elo::rating_change(white_rating.elo, black_rating.elo, white_score);
        let black_change = elo::rating_change(black_rating.elo, white_rating.elo, black_score);

        ledger
            .ratings
            .entry(white.clone())
            .or_default()
            .record(white_change, white_score);
        ledger
            .ratings
            .entry(black.clone())
            .or_default()
            .record(black_change, black_score);

        log::info!(
            "Settled {} ({}): {} {:+}, {} {:+}",
            session_id,
            result,
            white,
            white_change,
            black,
            black_change
        );
        Ok(())
    }
}
