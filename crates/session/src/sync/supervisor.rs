use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::reconcile::Inbound;
use super::retry::with_backoff;
use super::wait_for_shutdown;
use crate::config::SyncConfig;
use crate::error::{StoreError, SyncError};
use crate::events::{EventSink, SessionEvent};
use crate::feed::Subscription;
use crate::net::{Broadcast, BroadcastPacket};
use crate::session::{SessionId, SessionState};
use crate::store::DurableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Failed => f.write_str("failed"),
        }
    }
}

enum PumpEnd {
    Dropped,
    Shutdown,
}

pub struct ConnectionSupervisor {
    session_id: SessionId,
    store: Arc<dyn DurableStore>,
    broadcast: Arc<dyn Broadcast>,
    inbound: mpsc::UnboundedSender<Inbound>,
    config: SyncConfig,
    state: watch::Sender<ConnectionState>,
    events: EventSink,
    shutdown: watch::Receiver<bool>,
    ever_connected: bool,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        session_id: SessionId,
        store: Arc<dyn DurableStore>,
        broadcast: Arc<dyn Broadcast>,
        inbound: mpsc::UnboundedSender<Inbound>,
        config: SyncConfig,
        events: EventSink,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let supervisor = Self {
            session_id,
            store,
            broadcast,
            inbound,
            config,
            state,
            events,
            shutdown,
            ever_connected: false,
        };
        (supervisor, state_rx)
    }

    pub async fn run(mut self) {
        let mut failures = 0u32;

        loop {
            if *self.shutdown.borrow() || self.inbound.is_closed() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match self.connect().await {
                Ok((feed, frames)) => {
                    failures = 0;
                    self.ever_connected = true;
                    self.set_state(ConnectionState::Connected);

                    match self.pump(feed, frames).await {
                        PumpEnd::Shutdown => break,
                        PumpEnd::Dropped => {
                            log::warn!("Lost connection for session {}", self.session_id);
                            self.set_state(ConnectionState::Disconnected);
                            if !self.pause(self.config.reconnect.backoff_for(1)).await {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    let max_attempts = self.config.reconnect.max_attempts;
                    log::warn!(
                        "Connecting session {} failed ({}/{}): {}",
                        self.session_id,
                        failures,
                        max_attempts,
                        err
                    );
                    if failures >= max_attempts {
                        log::error!(
                            "Giving up on session {} after {} attempts",
                            self.session_id,
                            failures
                        );
                        self.set_state(ConnectionState::Failed);
                        self.events.emit(SessionEvent::AbandonPending);
                        return;
                    }
                    self.set_state(ConnectionState::Disconnected);
                    if !self.pause(self.config.reconnect.backoff_for(failures)).await {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        log::debug!("Supervisor for {} stopped", self.session_id);
    }

    /// Subscribes both channels, then queues a catch-up read. After a
    /// reconnect that read is authoritative and lands before any new event.
    async fn connect(
        &mut self,
    ) -> Result<(Subscription<SessionState>, Subscription<Vec<u8>>), SyncError> {
        let feed = self.store.subscribe(&self.session_id).await?;
        let frames = self.broadcast.subscribe(&self.session_id).await?;

        let store = &self.store;
        let session_id = &self.session_id;
        let snapshot = with_backoff(
            &self.config.resync_retry,
            "catch-up read",
            StoreError::is_transient,
            || store.read_session(session_id),
        )
        .await?;

        let catch_up = if self.ever_connected {
            log::info!(
                "Reconnected session {}; resyncing to durable ply {}",
                self.session_id,
                snapshot.ply_index
            );
            Inbound::Authoritative(snapshot)
        } else {
            Inbound::Snapshot(snapshot)
        };
        if self.inbound.send(catch_up).is_err() {
            log::debug!("Merge loop gone while connecting {}", self.session_id);
        }
        Ok((feed, frames))
    }

    async fn pump(
        &mut self,
        feed: Subscription<SessionState>,
        frames: Subscription<Vec<u8>>,
    ) -> PumpEnd {
        let mut feed_task = tokio::spawn(pump_feed(feed, self.inbound.clone()));
        let mut frame_task = tokio::spawn(pump_frames(
            frames,
            self.inbound.clone(),
            self.session_id.clone(),
        ));

        let end = tokio::select! {
            _ = &mut feed_task => PumpEnd::Dropped,
            _ = &mut frame_task => PumpEnd::Dropped,
            _ = wait_for_shutdown(&mut self.shutdown) => PumpEnd::Shutdown,
        };
        feed_task.abort();
        frame_task.abort();
        end
    }

    async fn pause(&mut self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_for_shutdown(&mut self.shutdown) => false,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            log::debug!("Session {} is {}", self.session_id, next);
            self.events.emit(SessionEvent::Connection(next));
        }
    }
}

async fn pump_feed(mut feed: Subscription<SessionState>, inbound: mpsc::UnboundedSender<Inbound>) {
    while let Some(snapshot) = feed.recv().await {
        if inbound.send(Inbound::Snapshot(snapshot)).is_err() {
            return;
        }
    }
}

async fn pump_frames(
    mut frames: Subscription<Vec<u8>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    session_id: SessionId,
) {
    while let Some(frame) = frames.recv().await {
        let packet = match BroadcastPacket::decode(&frame) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("Dropping malformed frame on {}: {}", session_id, err);
                continue;
            }
        };
        if !packet.event.is_for(&session_id) {
            log::warn!(
                "Dropping frame for {} on channel {}",
                packet.event.session_id,
                session_id
            );
            continue;
        }
        if inbound.send(Inbound::Move(packet.event)).is_err() {
            return;
        }
    }
}
