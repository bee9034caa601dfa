use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{MoveError, StoreError, SyncError};
use crate::events::{EventSink, SessionEvent};
use crate::net::Broadcast;
use crate::rating::RatingService;
use crate::rules::RuleEngine;
use crate::session::{Color, PlayerId, SessionId, SessionMirror, SessionState, SessionStatus};
use crate::store::DurableStore;
use crate::sync::{
    with_backoff, ConnectionState, ConnectionSupervisor, MoveApplier, Outbox,
    ReconciliationEngine, ResyncFetcher, ResyncHandle, TerminationCoordinator,
};

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn DurableStore>,
    pub broadcast: Arc<dyn Broadcast>,
    pub rules: Arc<dyn RuleEngine>,
    pub ratings: Arc<dyn RatingService>,
    pub config: SyncConfig,
}

pub struct SessionClient {
    session_id: SessionId,
    mirror: Arc<SessionMirror>,
    applier: MoveApplier,
    rules: Arc<dyn RuleEngine>,
    resync: ResyncHandle,
    connection: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    config: SyncConfig,
}

impl SessionClient {
    pub async fn attach(
        services: &Services,
        session_id: SessionId,
        player: PlayerId,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SyncError> {
        let config = services.config.clone();
        config.validate()?;

        let store = &services.store;
        let initial = with_backoff(
            &config.resync_retry,
            "initial read",
            StoreError::is_transient,
            || store.read_session(&session_id),
        )
        .await?;
        if initial.color_of(&player).is_none() {
            log::info!("{} attaches to {} as a spectator", player, session_id);
        }
        let mirror = Arc::new(SessionMirror::new(initial));

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = EventSink::new(event_tx);
        let resync = ResyncHandle::new();

        let termination = TerminationCoordinator::new(
            mirror.clone(),
            services.rules.clone(),
            services.store.clone(),
            services.ratings.clone(),
            resync.clone(),
            config.clone(),
            events.clone(),
        );
        let engine = ReconciliationEngine::new(
            mirror.clone(),
            services.rules.clone(),
            resync.clone(),
            termination,
            events.clone(),
        );
        let fetcher = ResyncFetcher::new(
            session_id.clone(),
            services.store.clone(),
            resync.clone(),
            inbound_tx.clone(),
            config.resync_retry,
        );
        let outbox = Outbox::new(
            services.store.clone(),
            services.broadcast.clone(),
            resync.clone(),
            config.clone(),
        );
        let (supervisor, connection) = ConnectionSupervisor::new(
            session_id.clone(),
            services.store.clone(),
            services.broadcast.clone(),
            inbound_tx.clone(),
            config.clone(),
            events.clone(),
            shutdown_rx.clone(),
        );

        let tasks = vec![
            tokio::spawn(engine.run(inbound_rx, shutdown_rx.clone())),
            tokio::spawn(fetcher.run()),
            tokio::spawn(outbox.run(outbox_rx, shutdown_rx)),
            tokio::spawn(supervisor.run()),
        ];

        let applier = MoveApplier::new(
            player.clone(),
            mirror.clone(),
            services.rules.clone(),
            outbox_tx,
            inbound_tx,
            events,
        );
        log::info!("{} attached to session {}", player, session_id);

        let client = Self {
            session_id,
            mirror,
            applier,
            rules: services.rules.clone(),
            resync,
            connection,
            shutdown: shutdown_tx,
            tasks,
            config,
        };
        Ok((client, event_rx))
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn player(&self) -> &PlayerId {
        self.applier.player()
    }

    pub fn submit_move(&self, uci: &str) -> Result<SessionState, MoveError> {
        self.applier.submit_move(uci)
    }

    pub fn resign(&self) -> Result<SessionState, MoveError> {
        self.applier.resign()
    }

    pub fn claim_timeout(&self) -> Result<SessionState, MoveError> {
        self.applier.claim_timeout()
    }

    pub fn state(&self) -> SessionState {
        self.mirror.current_state()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.mirror.subscribe()
    }

    pub fn local_color(&self) -> Option<Color> {
        self.mirror.current_state().color_of(self.player())
    }

    pub fn is_my_turn(&self) -> bool {
        let state = self.mirror.current_state();
        state.status == SessionStatus::Playing
            && state.color_of(self.player()) == Some(state.turn())
    }

    pub fn legal_destinations(&self, square: &str) -> Vec<String> {
        self.rules
            .legal_moves_from(&self.mirror.current_state().position, square)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn request_resync(&self) {
        self.resync.request("requested by caller");
    }

    pub fn resync_requests(&self) -> u64 {
        self.resync.requests()
    }

    pub fn resync_reads(&self) -> u64 {
        self.resync.completed()
    }

    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionState) -> bool,
    ) -> Result<SessionState, SyncError> {
        let mut rx = self.mirror.subscribe();
        let state = rx
            .wait_for(predicate)
            .await
            .map_err(|_| SyncError::NotAttached(self.session_id.clone()))?
            .clone();
        Ok(state)
    }

    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        self.resync.close();

        let deadline = self.config.shutdown_timeout;
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                log::warn!("Task for {} did not stop in time, aborting", self.session_id);
                task.abort();
            }
        }
        log::info!("Detached from session {}", self.session_id);
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.resync.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}
