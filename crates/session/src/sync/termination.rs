use std::sync::Arc;

use super::reconcile::ResyncHandle;
use super::retry::with_backoff;
use crate::config::SyncConfig;
use crate::error::{RatingError, StoreError};
use crate::events::{EventSink, SessionEvent};
use crate::rating::RatingService;
use crate::rules::RuleEngine;
use crate::session::{GameResult, SessionMirror, SessionState, SessionStatus, TerminalReason};
use crate::store::DurableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    SettledHere,
    SettledElsewhere,
    Deferred,
    NotApplicable,
}

pub struct TerminationCoordinator {
    mirror: Arc<SessionMirror>,
    rules: Arc<dyn RuleEngine>,
    store: Arc<dyn DurableStore>,
    ratings: Arc<dyn RatingService>,
    resync: ResyncHandle,
    config: SyncConfig,
    events: EventSink,
    announced: Option<(GameResult, TerminalReason)>,
}

impl TerminationCoordinator {
    pub(crate) fn new(
        mirror: Arc<SessionMirror>,
        rules: Arc<dyn RuleEngine>,
        store: Arc<dyn DurableStore>,
        ratings: Arc<dyn RatingService>,
        resync: ResyncHandle,
        config: SyncConfig,
        events: EventSink,
    ) -> Self {
        Self {
            mirror,
            rules,
            store,
            ratings,
            resync,
            config,
            events,
            announced: None,
        }
    }

    pub async fn on_converged(&mut self) -> SettlementOutcome {
        let state = self.mirror.current_state();
        match state.status {
            SessionStatus::Playing => {
                let report = self.rules.inspect(&state.position);
                let Some((result, reason)) = report.terminal else {
                    return SettlementOutcome::NotApplicable;
                };
                let Some(finished) = self.mirror.finish(result, reason) else {
                    return SettlementOutcome::NotApplicable;
                };
                log::info!(
                    "Session {} finished at ply {}: {} by {}",
                    finished.session_id,
                    finished.ply_index,
                    result,
                    reason
                );
                self.settle(finished).await
            }
            SessionStatus::Finished if !state.settlement_done => self.settle(state).await,
            SessionStatus::Finished => {
                self.announce(&state);
                SettlementOutcome::NotApplicable
            }
            SessionStatus::Waiting | SessionStatus::Abandoned => SettlementOutcome::NotApplicable,
        }
    }

    /// Emits `Finished` once per distinct outcome; a resync can replace a
    /// locally decided result with the durable one.
    fn announce(&mut self, state: &SessionState) {
        let (Some(result), Some(reason)) = (state.result, state.termination) else {
            return;
        };
        if self.announced == Some((result, reason)) {
            return;
        }
        self.announced = Some((result, reason));
        self.events.emit(SessionEvent::Finished { result, reason });
    }

    async fn settle(&mut self, finished: SessionState) -> SettlementOutcome {
        self.announce(&finished);
        let session_id = &finished.session_id;

        // The terminal transition has to be durable before anyone settles it.
        if let Err(err) = self.persist_finished(&finished).await {
            log::warn!("Could not persist finished state of {}: {}", session_id, err);
            self.resync.request("finished state not persisted");
            return SettlementOutcome::Deferred;
        }

        let store = &self.store;
        let granted = with_backoff(
            &self.config.persist_retry,
            "settlement compare-and-set",
            StoreError::is_transient,
            || store.compare_and_set_settlement(session_id),
        )
        .await;

        match granted {
            Ok(true) => {
                if let Err(err) = self.call_rating_service(&finished).await {
                    log::error!("Rating settlement for {} failed: {}", session_id, err);
                    self.events.emit(SessionEvent::SettlementFailed {
                        message: err.to_string(),
                    });
                }
                self.mirror.mark_settled();
                self.events.emit(SessionEvent::Settled { settled_here: true });
                SettlementOutcome::SettledHere
            }
            Ok(false) => {
                log::debug!("Session {} was settled by the other side", session_id);
                self.mirror.mark_settled();
                self.events.emit(SessionEvent::Settled { settled_here: false });
                SettlementOutcome::SettledElsewhere
            }
            Err(err) => {
                log::warn!("Settlement check for {} failed: {}", session_id, err);
                self.resync.request("settlement check failed");
                SettlementOutcome::Deferred
            }
        }
    }

    async fn persist_finished(&self, finished: &SessionState) -> Result<(), StoreError> {
        let store = &self.store;
        let timeout = self.config.persist_timeout;
        with_backoff(
            &self.config.persist_retry,
            "persist finished state",
            |err: &StoreError| matches!(err, StoreError::Unavailable(_)),
            || async move {
                tokio::time::timeout(timeout, store.write_session(finished))
                    .await
                    .map_err(|_| StoreError::Timeout(timeout))?
            },
        )
        .await
    }

    async fn call_rating_service(&self, finished: &SessionState) -> Result<(), RatingError> {
        let (Some(result), Some(white), Some(black)) =
            (finished.result, finished.white.as_ref(), finished.black.as_ref())
        else {
            return Err(RatingError::Rejected(format!(
                "session {} finished without both players seated",
                finished.session_id
            )));
        };

        let ratings = &self.ratings;
        with_backoff(
            &self.config.rating_retry,
            "rating settlement",
            |err: &RatingError| matches!(err, RatingError::Unavailable(_)),
            || ratings.settle(&finished.session_id, result, white, black),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::rating::EloLedger;
    use crate::rules::StandardChess;
    use crate::session::{Color, GameResult, PlayerId, SessionId, TerminalReason};
    use crate::store::MemoryStore;

    fn before_fools_mate() -> SessionState {
        let rules = StandardChess::new();
        let mut state = SessionState::new(
            SessionId::new("g1"),
            PlayerId::new("alice"),
            Color::White,
            rules.initial_position(),
        );
        state.black = Some(PlayerId::new("bob"));
        state.status = SessionStatus::Playing;
        for uci in ["f2f3", "e7e5", "g2g4"] {
            let verdict = rules.apply_move(&state.position, uci);
            state = state.with_move(uci, verdict.new_position);
        }
        state
    }

    fn coordinator(
        mirror: &Arc<SessionMirror>,
        store: &Arc<MemoryStore>,
        ledger: &Arc<EloLedger>,
    ) -> (TerminationCoordinator, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let coordinator = TerminationCoordinator::new(
            mirror.clone(),
            Arc::new(StandardChess::new()),
            store.clone(),
            ledger.clone(),
            ResyncHandle::new(),
            SyncConfig::fast(),
            EventSink::new(tx),
        );
        (coordinator, rx)
    }

    #[tokio::test]
    async fn test_checkmate_is_settled_exactly_once_across_clients() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(EloLedger::new());
        let before = before_fools_mate();
        store.insert_session(&before).await.unwrap();

        let verdict = StandardChess::new().apply_move(&before.position, "d8h4");
        let mated = before.with_move("d8h4", verdict.new_position);

        let white_mirror = Arc::new(SessionMirror::new(mated.clone()));
        let black_mirror = Arc::new(SessionMirror::new(mated));
        let (mut white, mut white_events) = coordinator(&white_mirror, &store, &ledger);
        let (mut black, _black_events) = coordinator(&black_mirror, &store, &ledger);

        let (first, second) = tokio::join!(white.on_converged(), black.on_converged());
        let mut outcomes = [first, second];
        outcomes.sort_by_key(|o| *o != SettlementOutcome::SettledHere);
        assert_eq!(
            outcomes,
            [SettlementOutcome::SettledHere, SettlementOutcome::SettledElsewhere]
        );

        assert_eq!(store.counters().settlement_attempts, 2);
        assert_eq!(store.counters().settlements_granted, 1);
        assert_eq!(ledger.settle_calls(), 1);

        let stored = store.peek(&SessionId::new("g1")).unwrap();
        assert_eq!(stored.status, SessionStatus::Finished);
        assert_eq!(stored.result, Some(GameResult::BlackWin));
        assert_eq!(stored.termination, Some(TerminalReason::Checkmate));
        assert!(stored.settlement_done);
        assert!(white_mirror.current_state().settlement_done);
        assert!(black_mirror.current_state().settlement_done);

        assert_eq!(
            white_events.recv().await,
            Some(SessionEvent::Finished {
                result: GameResult::BlackWin,
                reason: TerminalReason::Checkmate,
            })
        );
        assert!(matches!(
            white_events.recv().await,
            Some(SessionEvent::Settled { .. })
        ));

        assert_eq!(white.on_converged().await, SettlementOutcome::NotApplicable);
        assert_eq!(ledger.settle_calls(), 1);
    }

    #[tokio::test]
    async fn test_ongoing_game_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(EloLedger::new());
        let state = before_fools_mate();
        store.insert_session(&state).await.unwrap();
        let mirror = Arc::new(SessionMirror::new(state));
        let (mut coordinator, _events) = coordinator(&mirror, &store, &ledger);

        assert_eq!(coordinator.on_converged().await, SettlementOutcome::NotApplicable);
        assert_eq!(mirror.status(), SessionStatus::Playing);
        assert_eq!(store.counters().settlement_attempts, 0);
    }

    #[tokio::test]
    async fn test_unreachable_store_defers_settlement() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(EloLedger::new());
        let state = before_fools_mate();
        store.insert_session(&state).await.unwrap();
        let resigned = state.finished(GameResult::BlackWin, TerminalReason::Resignation);
        let mirror = Arc::new(SessionMirror::new(resigned));
        let (mut coordinator, _events) = coordinator(&mirror, &store, &ledger);

        store.set_available(false);
        assert_eq!(coordinator.on_converged().await, SettlementOutcome::Deferred);
        assert_eq!(ledger.settle_calls(), 0);
        assert!(!mirror.current_state().settlement_done);

        store.set_available(true);
        assert_eq!(coordinator.on_converged().await, SettlementOutcome::SettledHere);
        assert_eq!(ledger.settle_calls(), 1);
    }
}
