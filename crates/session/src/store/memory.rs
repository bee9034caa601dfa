use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::DurableStore;
use crate::error::StoreError;
use crate::feed::{lock, Fanout, Subscription};
use crate::session::{SessionId, SessionState};

#[derive(Debug, Default)]
struct Record {
    state: Option<SessionState>,
    feed: Fanout<SessionState>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounters {
    pub reads: u64,
    pub writes: u64,
    pub rejected_writes: u64,
    pub settlement_attempts: u64,
    pub settlements_granted: u64,
}

#[derive(Debug)]
pub struct MemoryStore {
    records: Mutex<HashMap<SessionId, Record>>,
    available: AtomicBool,
    failing_writes: AtomicU32,
    write_delay: Mutex<Option<Duration>>,
    read_delay: Mutex<Option<Duration>>,
    reads: AtomicU64,
    writes: AtomicU64,
    rejected_writes: AtomicU64,
    settlement_attempts: AtomicU64,
    settlements_granted: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing_writes: AtomicU32::new(0),
            write_delay: Mutex::new(None),
            read_delay: Mutex::new(None),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            rejected_writes: AtomicU64::new(0),
            settlement_attempts: AtomicU64::new(0),
            settlements_granted: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *lock(&self.write_delay) = delay;
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *lock(&self.read_delay) = delay;
    }

    pub fn drop_subscribers(&self, session_id: &SessionId) -> usize {
        lock(&self.records)
            .get_mut(session_id)
            .map_or(0, |record| record.feed.clear())
    }

    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        lock(&self.records)
            .get(session_id)
            .map_or(0, |record| record.feed.len())
    }

    pub fn peek(&self, session_id: &SessionId) -> Option<SessionState> {
        lock(&self.records)
            .get(session_id)
            .and_then(|record| record.state.clone())
    }

    pub fn overwrite(&self, state: SessionState) {
        let mut records = lock(&self.records);
        let record = records.entry(state.session_id.clone()).or_default();
        record.feed.send(&state);
        record.state = Some(state);
    }

    pub fn counters(&self) -> StoreCounters {
        StoreCounters {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
            settlement_attempts: self.settlement_attempts.load(Ordering::Relaxed),
            settlements_granted: self.settlements_granted.load(Ordering::Relaxed),
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn reject(&self, err: StoreError) -> Result<(), StoreError> {
        self.rejected_writes.fetch_add(1, Ordering::Relaxed);
        log::debug!("Rejected write: {}", err);
        Err(err)
    }
}

fn validate_write(stored: &SessionState, incoming: &SessionState) -> Result<(), StoreError> {
    let session_id = &stored.session_id;
    let conflict = |reason: &str| StoreError::Conflict {
        session_id: session_id.clone(),
        reason: reason.to_string(),
    };

    if incoming.ply_index < stored.ply_index {
        return Err(StoreError::Stale {
            session_id: session_id.clone(),
            stored: stored.ply_index,
            attempted: incoming.ply_index,
        });
    }
    if incoming.ply_index == stored.ply_index && incoming.position != stored.position {
        return Err(conflict("different position at the same ply"));
    }
    if !incoming.move_log.starts_with(&stored.move_log) {
        return Err(conflict("move log does not extend the stored history"));
    }
    if !stored.status.can_transition_to(incoming.status) {
        return Err(conflict("status would move backwards"));
    }
    if stored.status.is_retired() {
        if incoming.ply_index > stored.ply_index {
            return Err(conflict("session is already over"));
        }
        if (incoming.status, incoming.result, incoming.termination)
            != (stored.status, stored.result, stored.termination)
        {
            return Err(conflict("outcome of a finished session cannot change"));
        }
    }
    for (kept, next) in [(&stored.white, &incoming.white), (&stored.black, &incoming.black)] {
        if kept.is_some() && kept != next {
            return Err(StoreError::SeatTaken(session_id.clone()));
        }
    }
    Ok(())
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read_session(&self, session_id: &SessionId) -> Result<SessionState, StoreError> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let delay = *lock(&self.read_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.peek(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.clone()))
    }

    async fn insert_session(&self, state: &SessionState) -> Result<(), StoreError> {
        self.check_available()?;
        let mut records = lock(&self.records);
        let record = records.entry(state.session_id.clone()).or_default();
        if record.state.is_some() {
            return Err(StoreError::AlreadyExists(state.session_id.clone()));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        record.state = Some(state.clone());
        record.feed.send(state);
        Ok(())
    }

    async fn write_session(&self, state: &SessionState) -> Result<(), StoreError> {
        self.check_available()?;
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        let delay = *lock(&self.write_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(&state.session_id) else {
            return self.reject(StoreError::NotFound(state.session_id.clone()));
        };
        let Some(stored) = record.state.as_ref() else {
            return self.reject(StoreError::NotFound(state.session_id.clone()));
        };
        if let Err(err) = validate_write(stored, state) {
            return self.reject(err);
        }

        let mut next = state.clone();
        next.settlement_done |= stored.settlement_done;
        self.writes.fetch_add(1, Ordering::Relaxed);
        record.feed.send(&next);
        record.state = Some(next);
        Ok(())
    }

    async fn compare_and_set_settlement(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        self.check_available()?;
        self.settlement_attempts.fetch_add(1, Ordering::Relaxed);

        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(session_id) else {
            return Err(StoreError::NotFound(session_id.clone()));
        };
        let Some(state) = record.state.as_mut() else {
            return Err(StoreError::NotFound(session_id.clone()));
        };
        if state.settlement_done {
            return Ok(false);
        }
        state.settlement_done = true;
        let snapshot = state.clone();
        record.feed.send(&snapshot);
        self.settlements_granted.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn subscribe(&self, session_id: &SessionId) -> Result<Subscription<SessionState>, StoreError> {
        self.check_available()?;
        let mut records = lock(&self.records);
        match records.get_mut(session_id) {
            Some(record) if record.state.is_some() => Ok(record.feed.subscribe()),
            _ => Err(StoreError::NotFound(session_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Color, GameResult, PlayerId, SessionStatus, TerminalReason};

    fn playing(id: &str) -> SessionState {
        let mut state = SessionState::new(
            SessionId::new(id),
            PlayerId::new("alice"),
            Color::White,
            "start",
        );
        state.black = Some(PlayerId::new("bob"));
        state.status = SessionStatus::Playing;
        state
    }

    async fn seeded(state: &SessionState) -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_session(state).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let state = playing("g1");
        let store = seeded(&state).await;

        assert_eq!(store.read_session(&state.session_id).await.unwrap(), state);
        assert!(matches!(
            store.insert_session(&state).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.read_session(&SessionId::new("missing")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_backward_writes() {
        let start = playing("g1");
        let store = seeded(&start).await;
        let one = start.with_move("e2e4", "p1");
        let two = one.with_move("e7e5", "p2");

        store.write_session(&two).await.unwrap();

        assert!(matches!(
            store.write_session(&one).await,
            Err(StoreError::Stale { stored: 2, attempted: 1, .. })
        ));
        let divergent = one.with_move("c7c5", "other");
        assert!(matches!(
            store.write_session(&divergent).await,
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(store.peek(&start.session_id), Some(two));
        assert_eq!(store.counters().rejected_writes, 2);
    }

    #[tokio::test]
    async fn test_seats_are_immutable() {
        let start = playing("g1");
        let store = seeded(&start).await;

        let mut hijacked = start.clone();
        hijacked.black = Some(PlayerId::new("mallory"));
        assert!(matches!(
            store.write_session(&hijacked).await,
            Err(StoreError::SeatTaken(_))
        ));
    }

    #[tokio::test]
    async fn test_settlement_is_granted_once_and_survives_writes() {
        let start = playing("g1");
        let store = seeded(&start).await;
        let finished = start.finished(GameResult::WhiteWin, TerminalReason::Resignation);
        store.write_session(&finished).await.unwrap();

        assert!(store.compare_and_set_settlement(&start.session_id).await.unwrap());
        assert!(!store.compare_and_set_settlement(&start.session_id).await.unwrap());

        store.write_session(&finished).await.unwrap();
        assert!(store.peek(&start.session_id).unwrap().settlement_done);

        let counters = store.counters();
        assert_eq!(counters.settlement_attempts, 2);
        assert_eq!(counters.settlements_granted, 1);
    }

    #[tokio::test]
    async fn test_finished_sessions_do_not_take_moves() {
        let start = playing("g1");
        let store = seeded(&start).await;
        let finished = start.finished(GameResult::BlackWin, TerminalReason::Timeout);
        store.write_session(&finished).await.unwrap();

        let mut late = start.with_move("e2e4", "p1");
        late.status = SessionStatus::Finished;
        late.result = Some(GameResult::BlackWin);
        assert!(store.write_session(&late).await.is_err());
        assert!(store.write_session(&start.with_move("e2e4", "p1")).await.is_err());
    }

    #[tokio::test]
    async fn test_finished_outcome_cannot_be_rewritten() {
        let start = playing("g1");
        let store = seeded(&start).await;
        let white_wins = start.finished(GameResult::WhiteWin, TerminalReason::Resignation);
        let black_wins = start.finished(GameResult::BlackWin, TerminalReason::Resignation);
        let timed_out = start.finished(GameResult::WhiteWin, TerminalReason::Timeout);
        store.write_session(&white_wins).await.unwrap();

        assert!(matches!(
            store.write_session(&black_wins).await,
            Err(StoreError::Conflict { .. })
        ));
        assert!(matches!(
            store.write_session(&timed_out).await,
            Err(StoreError::Conflict { .. })
        ));
        let mut abandoned = white_wins.clone();
        abandoned.status = SessionStatus::Abandoned;
        assert!(store.write_session(&abandoned).await.is_err());

        store.write_session(&white_wins).await.unwrap();
        assert_eq!(store.peek(&start.session_id), Some(white_wins));
    }

    #[tokio::test]
    async fn test_change_feed_follows_writes() {
        let start = playing("g1");
        let store = seeded(&start).await;
        let mut feed = store.subscribe(&start.session_id).await.unwrap();

        let one = start.with_move("e2e4", "p1");
        store.write_session(&one).await.unwrap();
        assert_eq!(feed.recv().await, Some(one));

        assert_eq!(store.drop_subscribers(&start.session_id), 1);
        assert_eq!(feed.recv().await, None);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let start = playing("g1");
        let store = seeded(&start).await;

        store.fail_writes(2);
        let one = start.with_move("e2e4", "p1");
        assert!(store.write_session(&one).await.unwrap_err().is_transient());
        assert!(store.write_session(&one).await.unwrap_err().is_transient());
        store.write_session(&one).await.unwrap();

        store.set_available(false);
        assert!(matches!(
            store.read_session(&start.session_id).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.subscribe(&start.session_id).await.is_err());
    }
}
