use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};

use super::retry::with_backoff;
use super::termination::TerminationCoordinator;
use super::wait_for_shutdown;
use crate::config::RetryPolicy;
use crate::error::StoreError;
use crate::events::{EventSink, SessionEvent, UpdateSource};
use crate::net::MoveEvent;
use crate::rules::RuleEngine;
use crate::session::{AdvanceOutcome, ConflictKind, SessionId, SessionMirror, SessionState};
use crate::store::DurableStore;

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Snapshot(SessionState),
    Move(MoveEvent),
    Authoritative(SessionState),
    LocalAdvance,
}

#[derive(Debug, Default)]
struct ResyncShared {
    notify: Notify,
    requests: AtomicU64,
    completed: AtomicU64,
    closed: AtomicBool,
}

/// Asks the fetcher task for an authoritative read. Requests made while a
/// fetch is pending collapse into one.
#[derive(Debug, Clone, Default)]
pub struct ResyncHandle {
    shared: Arc<ResyncShared>,
}

impl ResyncHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, reason: &str) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        self.shared.requests.fetch_add(1, Ordering::SeqCst);
        log::warn!("Resync requested: {}", reason);
        self.shared.notify.notify_one();
    }

    pub fn requests(&self) -> u64 {
        self.shared.requests.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

pub(crate) struct ResyncFetcher {
    session_id: SessionId,
    store: Arc<dyn DurableStore>,
    handle: ResyncHandle,
    inbound: mpsc::UnboundedSender<Inbound>,
    policy: RetryPolicy,
}

impl ResyncFetcher {
    pub fn new(
        session_id: SessionId,
        store: Arc<dyn DurableStore>,
        handle: ResyncHandle,
        inbound: mpsc::UnboundedSender<Inbound>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            session_id,
            store,
            handle,
            inbound,
            policy,
        }
    }

    pub async fn run(self) {
        loop {
            self.handle.shared.notify.notified().await;
            if self.handle.is_closed() {
                break;
            }

            let store = &self.store;
            let session_id = &self.session_id;
            let fetched = with_backoff(&self.policy, "resync read", StoreError::is_transient, || {
                store.read_session(session_id)
            })
            .await;

            match fetched {
                Ok(snapshot) => {
                    self.handle.shared.completed.fetch_add(1, Ordering::SeqCst);
                    log::info!(
                        "Resync for {} fetched ply {} ({})",
                        session_id,
                        snapshot.ply_index,
                        snapshot.status
                    );
                    if self.inbound.send(Inbound::Authoritative(snapshot)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::error!("Resync for {} failed: {}", session_id, err);
                }
            }
        }
        log::debug!("Resync fetcher for {} stopped", self.session_id);
    }
}

pub struct ReconciliationEngine {
    mirror: Arc<SessionMirror>,
    rules: Arc<dyn RuleEngine>,
    resync: ResyncHandle,
    termination: TerminationCoordinator,
    events: EventSink,
    // Latest ply the change feed reported as written. A read that lands below
    // it was taken before that write.
    feed_ply: Option<u32>,
}

impl ReconciliationEngine {
    pub(crate) fn new(
        mirror: Arc<SessionMirror>,
        rules: Arc<dyn RuleEngine>,
        resync: ResyncHandle,
        termination: TerminationCoordinator,
        events: EventSink,
    ) -> Self {
        Self {
            mirror,
            rules,
            resync,
            termination,
            events,
            feed_ply: None,
        }
    }

    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                next = inbound.recv() => match next {
                    Some(event) => {
                        self.handle(event).await;
                    }
                    None => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        log::debug!(
            "Merge loop for {} stopped at ply {}",
            self.mirror.current_state().session_id,
            self.mirror.ply_index()
        );
    }

    pub async fn handle(&mut self, event: Inbound) -> Option<AdvanceOutcome> {
        match event {
            Inbound::Snapshot(snapshot) => {
                self.feed_ply = Some(snapshot.ply_index);
                let outcome = self.mirror.try_advance(&snapshot);
                self.after_advance(outcome, UpdateSource::ChangeFeed, snapshot.ply_index)
                    .await;
                Some(outcome)
            }
            Inbound::Move(event) => {
                let outcome = self.merge_move(&event);
                self.after_advance(outcome, UpdateSource::Broadcast, event.ply_index)
                    .await;
                Some(outcome)
            }
            Inbound::Authoritative(snapshot) => {
                let changed = self.mirror.force_apply(&snapshot);
                if changed {
                    log::info!(
                        "Mirror of {} replaced by durable state at ply {}",
                        snapshot.session_id,
                        snapshot.ply_index
                    );
                }
                self.events.emit(SessionEvent::Resynced {
                    ply_index: self.mirror.ply_index(),
                });
                if let Some(seen) = self.feed_ply.filter(|seen| *seen > snapshot.ply_index) {
                    // The write behind `seen` is already durable, so one more
                    // read covers it.
                    self.feed_ply = Some(snapshot.ply_index);
                    self.resync.request(&format!(
                        "durable read at ply {} is older than change feed ply {}",
                        snapshot.ply_index, seen
                    ));
                }
                self.termination.on_converged().await;
                None
            }
            Inbound::LocalAdvance => {
                self.termination.on_converged().await;
                None
            }
        }
    }

    fn merge_move(&self, event: &MoveEvent) -> AdvanceOutcome {
        let current = self.mirror.current_state();
        if !event.is_for(&current.session_id) {
            log::warn!(
                "Dropping move for session {} on {}",
                event.session_id,
                current.session_id
            );
            return AdvanceOutcome::IgnoredStale;
        }
        match candidate_from_move(&current, event, self.rules.as_ref()) {
            Some(candidate) => self.mirror.try_advance(&candidate),
            None => AdvanceOutcome::Conflict(ConflictKind::Divergent),
        }
    }

    async fn after_advance(&mut self, outcome: AdvanceOutcome, source: UpdateSource, ply: u32) {
        match outcome {
            AdvanceOutcome::Applied => {
                log::debug!("Applied ply {} from {}", ply, source.as_str());
                self.events.emit(SessionEvent::Advanced {
                    ply_index: self.mirror.ply_index(),
                    source,
                });
                self.termination.on_converged().await;
            }
            AdvanceOutcome::IgnoredStale => {
                log::trace!("Ignored stale ply {} from {}", ply, source.as_str());
            }
            AdvanceOutcome::Conflict(kind) => {
                self.resync.request(&format!(
                    "{:?} at ply {} from {} (local ply {})",
                    kind,
                    ply,
                    source.as_str(),
                    self.mirror.ply_index()
                ));
            }
        }
    }
}

fn candidate_from_move(
    current: &SessionState,
    event: &MoveEvent,
    rules: &dyn RuleEngine,
) -> Option<SessionState> {
    let local = current.ply_index;

    if event.ply_index == local + 1 {
        let verdict = rules.apply_move(&current.position, &event.uci);
        if !verdict.legal || verdict.new_position != event.resulting_position {
            return None;
        }
        return Some(current.with_move(event.uci.as_str(), verdict.new_position));
    }

    let mut candidate = current.clone();
    candidate.ply_index = event.ply_index;
    candidate.position = event.resulting_position.clone();
    if event.ply_index <= local {
        candidate.move_log.truncate(event.ply_index.saturating_sub(1) as usize);
        if event.ply_index > 0 {
            candidate.move_log.push(event.uci.clone());
        }
    }
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::rating::EloLedger;
    use crate::rules::StandardChess;
    use crate::session::{Color, PlayerId, SessionStatus};
    use crate::store::MemoryStore;

    fn playing() -> SessionState {
        let rules = StandardChess::new();
        let mut state = SessionState::new(
            SessionId::new("g1"),
            PlayerId::new("alice"),
            Color::White,
            rules.initial_position(),
        );
        state.black = Some(PlayerId::new("bob"));
        state.status = SessionStatus::Playing;
        state
    }

    fn announce(state: &SessionState, uci: &str) -> (MoveEvent, SessionState) {
        let verdict = StandardChess::new().apply_move(&state.position, uci);
        assert!(verdict.legal);
        let next = state.with_move(uci, verdict.new_position);
        let event = MoveEvent::new(&next.session_id, next.ply_index, uci, next.position.clone());
        (event, next)
    }

    #[test]
    fn test_next_ply_is_replayed_through_the_rules() {
        let start = playing();
        let (event, expected) = announce(&start, "e2e4");

        let candidate = candidate_from_move(&start, &event, &StandardChess::new());
        assert_eq!(candidate, Some(expected));
    }

    #[test]
    fn test_forged_position_is_divergent() {
        let start = playing();
        let (mut event, _) = announce(&start, "e2e4");
        event.resulting_position = start.position.clone();

        assert_eq!(candidate_from_move(&start, &event, &StandardChess::new()), None);
    }

    #[test]
    fn test_old_and_future_plies_keep_their_index() {
        let start = playing();
        let (first, one) = announce(&start, "e2e4");
        let (_, two) = announce(&one, "e7e5");
        let rules = StandardChess::new();

        let replayed = candidate_from_move(&two, &first, &rules).unwrap();
        assert_eq!(replayed.ply_index, 1);
        assert_eq!(replayed.move_log, vec!["e2e4".to_string()]);

        let mut future = first.clone();
        future.ply_index = 5;
        let ahead = candidate_from_move(&start, &future, &rules).unwrap();
        assert_eq!(ahead.ply_index, 5);
    }

    fn engine(mirror: &Arc<SessionMirror>, resync: &ResyncHandle) -> ReconciliationEngine {
        let (tx, _rx) = mpsc::channel(16);
        let events = EventSink::new(tx);
        let rules: Arc<dyn RuleEngine> = Arc::new(StandardChess::new());
        let termination = TerminationCoordinator::new(
            mirror.clone(),
            rules.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(EloLedger::new()),
            resync.clone(),
            SyncConfig::fast(),
            events.clone(),
        );
        ReconciliationEngine::new(mirror.clone(), rules, resync.clone(), termination, events)
    }

    #[tokio::test]
    async fn test_read_older_than_the_change_feed_is_fetched_again() {
        let start = playing();
        let (_, one) = announce(&start, "e2e4");
        let mirror = Arc::new(SessionMirror::new(start.clone()));
        let resync = ResyncHandle::new();
        let mut engine = engine(&mirror, &resync);

        assert_eq!(
            engine.handle(Inbound::Snapshot(one.clone())).await,
            Some(AdvanceOutcome::Applied)
        );
        // A read taken just before the write above, delivered after it.
        engine.handle(Inbound::Authoritative(start.clone())).await;
        assert_eq!(mirror.ply_index(), 0);
        assert_eq!(resync.requests(), 1);

        engine.handle(Inbound::Authoritative(one.clone())).await;
        assert_eq!(mirror.current_state(), one);
        assert_eq!(resync.requests(), 1);
    }

    #[tokio::test]
    async fn test_current_read_needs_no_follow_up() {
        let start = playing();
        let (_, one) = announce(&start, "e2e4");
        let mirror = Arc::new(SessionMirror::new(start));
        let resync = ResyncHandle::new();
        let mut engine = engine(&mirror, &resync);

        engine.handle(Inbound::Snapshot(one.clone())).await;
        engine.handle(Inbound::Authoritative(one)).await;
        assert_eq!(mirror.ply_index(), 1);
        assert_eq!(resync.requests(), 0);
    }

    #[test]
    fn test_resync_requests_are_counted_and_closed_handles_ignore_them() {
        let handle = ResyncHandle::new();
        handle.request("gap");
        handle.request("conflict");
        assert_eq!(handle.requests(), 2);

        handle.close();
        handle.request("late");
        assert_eq!(handle.requests(), 2);
    }
}
