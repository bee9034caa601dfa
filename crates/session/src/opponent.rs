//! Computer opponent behind a request/response channel.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use shakmaty::{uci::UciMove, CastlingMode, Chess, Move, Position, Role};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::client::SessionClient;
use crate::error::{EngineError, MoveError, SyncError};
use crate::feed::lock;
use crate::rules::StandardChess;
use crate::session::SessionState;

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchBudget {
    pub depth: u8,
    pub movetime: Duration,
}

impl Default for SearchBudget {
    fn default() -> Self {
        Self {
            depth: 2,
            movetime: Duration::from_millis(500),
        }
    }
}

pub trait SearchEngine: Send + Sync + 'static {
    fn best_move(&self, position: &str, budget: SearchBudget) -> Result<String, EngineError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySearch;

fn role_value(role: Role) -> i32 {
    match role {
        Role::Pawn => 1,
        Role::Knight | Role::Bishop => 3,
        Role::Rook => 5,
        Role::Queen => 9,
        Role::King => 0,
    }
}

fn allows_mate_in_one(position: &Chess) -> bool {
    position
        .legal_moves()
        .iter()
        .any(|reply| position.clone().play(reply).is_ok_and(|after| after.is_checkmate()))
}

fn tiebreak(position: &str, uci: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    (position, uci).hash(&mut hasher);
    hasher.finish()
}

impl GreedySearch {
    fn score(current: &Chess, m: &Move, budget: SearchBudget) -> Option<i32> {
        let next = current.clone().play(m).ok()?;
        if next.is_checkmate() {
            return Some(100_000);
        }

        let mut score = m.capture().map_or(0, role_value) * 100;
        score += m.promotion().map_or(0, role_value) * 90;
        if next.is_check() {
            score += 10;
        }
        if budget.depth >= 2 && allows_mate_in_one(&next) {
            score -= 50_000;
        }
        Some(score)
    }
}

impl SearchEngine for GreedySearch {
    fn best_move(&self, position: &str, budget: SearchBudget) -> Result<String, EngineError> {
        let current = StandardChess::parse(position)
            .ok_or_else(|| EngineError::InvalidPosition(position.to_string()))?;
        let started = Instant::now();

        let mut best: Option<(i32, u64, String)> = None;
        for m in current.legal_moves().iter() {
            if best.is_some() && started.elapsed() > budget.movetime {
                break;
            }
            let Some(score) = Self::score(&current, m, budget) else {
                continue;
            };
            let uci = UciMove::from_move(m, CastlingMode::Standard).to_string();
            let key = (score, tiebreak(position, &uci));
            if best.as_ref().is_none_or(|(s, t, _)| key > (*s, *t)) {
                best = Some((key.0, key.1, uci));
            }
        }

        best.map(|(_, _, uci)| uci).ok_or(EngineError::NoLegalMoves)
    }
}

#[derive(Debug)]
struct SearchRequest {
    request_id: RequestId,
    position: String,
    budget: SearchBudget,
}

#[derive(Debug)]
struct SearchResponse {
    request_id: RequestId,
    result: Result<String, EngineError>,
}

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<String, EngineError>>>>>;

/// Sends positions to a search worker and matches answers back to callers
/// by request id. Answers nobody waits for anymore are discarded.
pub struct OpponentClient {
    next_id: AtomicU64,
    requests: mpsc::UnboundedSender<SearchRequest>,
    pending: Pending,
    timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl OpponentClient {
    pub fn spawn(engine: Arc<dyn SearchEngine>, timeout: Duration) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let pending = Pending::default();

        let tasks = vec![
            tokio::spawn(run_worker(engine, request_rx, response_tx)),
            tokio::spawn(route_responses(response_rx, pending.clone())),
        ];

        Self {
            next_id: AtomicU64::new(0),
            requests: request_tx,
            pending,
            timeout,
            tasks,
        }
    }

    pub async fn request_move(
        &self,
        position: &str,
        budget: SearchBudget,
    ) -> Result<String, EngineError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id, tx);

        let request = SearchRequest {
            request_id,
            position: position.to_string(),
            budget,
        };
        if self.requests.send(request).is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(EngineError::WorkerStopped);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::WorkerStopped),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                log::warn!("Search request {} timed out after {:?}", request_id, self.timeout);
                Err(EngineError::Timeout(self.timeout))
            }
        }
    }

    pub async fn play_turn(
        &self,
        client: &SessionClient,
        budget: SearchBudget,
    ) -> Result<SessionState, SyncError> {
        if !client.is_my_turn() {
            return Err(MoveError::NotYourTurn.into());
        }
        let position = client.state().position;
        let uci = self.request_move(&position, budget).await?;
        // The mirror may have moved while the engine was thinking; the
        // applier re-validates against whatever is current.
        Ok(client.submit_move(&uci)?)
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for OpponentClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_worker(
    engine: Arc<dyn SearchEngine>,
    mut requests: mpsc::UnboundedReceiver<SearchRequest>,
    responses: mpsc::UnboundedSender<SearchResponse>,
) {
    while let Some(request) = requests.recv().await {
        let SearchRequest {
            request_id,
            position,
            budget,
        } = request;
        let engine = engine.clone();
        let result =
            match tokio::task::spawn_blocking(move || engine.best_move(&position, budget)).await {
                Ok(result) => result,
                Err(err) => {
                    log::error!("Search for request {} panicked: {}", request_id, err);
                    Err(EngineError::WorkerStopped)
                }
            };
        if responses.send(SearchResponse { request_id, result }).is_err() {
            break;
        }
    }
}

async fn route_responses(mut responses: mpsc::UnboundedReceiver<SearchResponse>, pending: Pending) {
    while let Some(response) = responses.recv().await {
        let waiter = lock(&pending).remove(&response.request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response.result);
            }
            None => log::debug!(
                "Dropping answer for abandoned request {}",
                response.request_id
            ),
        }
    }
}
