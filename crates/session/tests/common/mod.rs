#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use tandem::{
    BroadcastHub, Color, EloLedger, LinkSimulation, Lobby, MemoryStore, PlayerId, Services,
    SessionClient, SessionEvent, SessionId, SessionState, StandardChess, SyncConfig,
};

pub const WAIT: Duration = Duration::from_secs(3);

pub struct Table {
    pub id: SessionId,
    pub store: Arc<MemoryStore>,
    pub hub: Arc<BroadcastHub>,
    pub ledger: Arc<EloLedger>,
    pub services: Services,
}

pub struct Seat {
    pub client: SessionClient,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// A playing session with alice as white and bob as black.
pub async fn table(id: &str, link: LinkSimulation) -> Table {
    let id = SessionId::new(id);
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(BroadcastHub::with_link(link));
    let ledger = Arc::new(EloLedger::new());
    let rules = Arc::new(StandardChess::new());

    let lobby = Lobby::new(store.clone(), rules.clone());
    lobby
        .create_session(id.clone(), PlayerId::new("alice"), Color::White)
        .await
        .unwrap();
    lobby.join_session(&id, PlayerId::new("bob")).await.unwrap();

    let services = Services {
        store: store.clone(),
        broadcast: hub.clone(),
        rules,
        ratings: ledger.clone(),
        config: SyncConfig::fast(),
    };
    Table {
        id,
        store,
        hub,
        ledger,
        services,
    }
}

impl Table {
    pub async fn seat(&self, player: &str) -> Seat {
        let (client, events) =
            SessionClient::attach(&self.services, self.id.clone(), PlayerId::new(player))
                .await
                .unwrap();
        let mut connection = client.connection_watch();
        tokio::time::timeout(
            WAIT,
            connection.wait_for(|state| *state == tandem::ConnectionState::Connected),
        )
        .await
        .expect("supervisor did not connect")
        .unwrap();
        Seat { client, events }
    }

    pub fn durable(&self) -> SessionState {
        self.store.peek(&self.id).unwrap()
    }
}

pub async fn converge(client: &SessionClient, ply: u32) -> SessionState {
    tokio::time::timeout(WAIT, client.wait_for(|s| s.ply_index >= ply))
        .await
        .expect("mirror did not reach ply")
        .unwrap()
}

/// `mover` plays `uci`; returns once `other` has seen it.
pub async fn play(mover: &SessionClient, other: &SessionClient, uci: &str) -> SessionState {
    let applied = mover.submit_move(uci).unwrap();
    converge(other, applied.ply_index).await;
    applied
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn expect_event(
    events: &mut mpsc::Receiver<SessionEvent>,
    mut wanted: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if wanted(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not seen in time")
}

pub fn drain(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
