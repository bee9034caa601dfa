use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::reconcile::{Inbound, ResyncHandle};
use super::retry::with_backoff;
use super::wait_for_shutdown;
use crate::config::SyncConfig;
use crate::error::{BroadcastError, MoveError, StoreError};
use crate::events::{EventSink, SessionEvent, UpdateSource};
use crate::net::{Broadcast, BroadcastPacket, MoveEvent};
use crate::rules::RuleEngine;
use crate::session::{
    AdvanceOutcome, Color, GameResult, PlayerId, SessionMirror, SessionState, SessionStatus,
    TerminalReason,
};
use crate::store::DurableStore;

#[derive(Debug, Clone)]
pub struct OutboundMove {
    pub event: MoveEvent,
    pub snapshot: SessionState,
}

pub struct MoveApplier {
    player: PlayerId,
    mirror: Arc<SessionMirror>,
    rules: Arc<dyn RuleEngine>,
    outbox: mpsc::UnboundedSender<OutboundMove>,
    inbound: mpsc::UnboundedSender<Inbound>,
    events: EventSink,
}

impl MoveApplier {
    pub(crate) fn new(
        player: PlayerId,
        mirror: Arc<SessionMirror>,
        rules: Arc<dyn RuleEngine>,
        outbox: mpsc::UnboundedSender<OutboundMove>,
        inbound: mpsc::UnboundedSender<Inbound>,
        events: EventSink,
    ) -> Self {
        Self {
            player,
            mirror,
            rules,
            outbox,
            inbound,
            events,
        }
    }

    pub fn player(&self) -> &PlayerId {
        &self.player
    }

    /// Applies `uci` optimistically. Announcement and persistence continue in
    /// the background; the caller only waits for the legality verdict.
    pub fn submit_move(&self, uci: &str) -> Result<SessionState, MoveError> {
        let (candidate, outcome) = self.mirror.try_advance_with(|current| {
            let color = self.seat(current)?;
            if current.turn() != color {
                return Err(MoveError::NotYourTurn);
            }
            let verdict = self.rules.apply_move(&current.position, uci);
            if !verdict.legal {
                return Err(MoveError::IllegalMove(uci.to_string()));
            }
            Ok(current.with_move(uci, verdict.new_position))
        })?;

        if outcome != AdvanceOutcome::Applied {
            log::warn!(
                "Validated move {} was not applied ({:?})",
                uci,
                outcome
            );
            return Err(MoveError::SessionNotActive);
        }
        log::debug!(
            "{} played {} (ply {})",
            self.player,
            uci,
            candidate.ply_index
        );

        let event = MoveEvent::new(
            &candidate.session_id,
            candidate.ply_index,
            uci,
            candidate.position.clone(),
        );
        let outbound = OutboundMove {
            event,
            snapshot: candidate.clone(),
        };
        if self.outbox.send(outbound).is_err() {
            log::warn!("Outbox closed; move {} stays local until resync", uci);
        }
        self.events.emit(SessionEvent::Advanced {
            ply_index: candidate.ply_index,
            source: UpdateSource::Local,
        });
        self.notify_local();
        Ok(candidate)
    }

    pub fn resign(&self) -> Result<SessionState, MoveError> {
        let finished = self.mirror.update_with(|current| {
            let color = self.seat(current)?;
            Ok(current.finished(GameResult::win_for(color.opposite()), TerminalReason::Resignation))
        })?;
        log::info!("{} resigned {}", self.player, finished.session_id);
        self.notify_local();
        Ok(finished)
    }

    pub fn claim_timeout(&self) -> Result<SessionState, MoveError> {
        let finished = self.mirror.update_with(|current| {
            let color = self.seat(current)?;
            if current.turn() == color {
                return Err(MoveError::NotYourTurn);
            }
            Ok(current.finished(GameResult::win_for(color), TerminalReason::Timeout))
        })?;
        log::info!("{} claimed {} on time", self.player, finished.session_id);
        self.notify_local();
        Ok(finished)
    }

    fn seat(&self, current: &SessionState) -> Result<Color, MoveError> {
        if current.status != SessionStatus::Playing {
            return Err(MoveError::SessionNotActive);
        }
        current.color_of(&self.player).ok_or(MoveError::NotYourTurn)
    }

    fn notify_local(&self) {
        if self.inbound.send(Inbound::LocalAdvance).is_err() {
            log::debug!("Merge loop stopped; skipping termination check");
        }
    }
}

pub(crate) struct Outbox {
    store: Arc<dyn DurableStore>,
    broadcast: Arc<dyn Broadcast>,
    resync: ResyncHandle,
    config: SyncConfig,
    sequence: u32,
}

impl Outbox {
    pub fn new(
        store: Arc<dyn DurableStore>,
        broadcast: Arc<dyn Broadcast>,
        resync: ResyncHandle,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            broadcast,
            resync,
            config,
            sequence: 0,
        }
    }

    pub async fn run(
        mut self,
        mut queue: mpsc::UnboundedReceiver<OutboundMove>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                next = queue.recv() => match next {
                    Some(outbound) => self.deliver(outbound).await,
                    None => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        log::debug!("Outbox stopped after {} moves", self.sequence);
    }

    async fn deliver(&mut self, outbound: OutboundMove) {
        self.sequence = self.sequence.wrapping_add(1);
        let ply = outbound.snapshot.ply_index;

        // Broadcast first: the opponent should not wait on the durable ack.
        let published = self.publish(&outbound).await;
        if let Err(err) = &published {
            log::error!("Giving up on broadcasting ply {}: {}", ply, err);
        }

        let persisted = self.persist(&outbound.snapshot).await;
        match &persisted {
            Ok(()) => {
                log::debug!("Persisted {} at ply {}", outbound.snapshot.session_id, ply);
            }
            Err(StoreError::Timeout(after)) => {
                log::warn!("Persist of ply {} not acknowledged after {:?}", ply, after);
            }
            Err(err) => {
                log::warn!("Persist of ply {} failed: {}", ply, err);
            }
        }

        if persisted.is_err() {
            self.resync.request("move not persisted");
        } else if published.is_err() {
            self.resync.request("move not broadcast");
        }
    }

    async fn publish(&self, outbound: &OutboundMove) -> Result<(), BroadcastError> {
        let frame = BroadcastPacket::new(self.sequence, outbound.event.clone()).encode()?;
        let frame = &frame;
        let session_id = &outbound.snapshot.session_id;
        let broadcast = &self.broadcast;
        with_backoff(
            &self.config.publish_retry,
            "broadcast publish",
            |err: &BroadcastError| matches!(err, BroadcastError::Unavailable(_)),
            || broadcast.publish(session_id, frame.clone()),
        )
        .await
    }

    async fn persist(&self, snapshot: &SessionState) -> Result<(), StoreError> {
        let store = &self.store;
        let timeout = self.config.persist_timeout;
        with_backoff(
            &self.config.persist_retry,
            "persist move",
            |err: &StoreError| matches!(err, StoreError::Unavailable(_)),
            || async move {
                tokio::time::timeout(timeout, store.write_session(snapshot))
                    .await
                    .map_err(|_| StoreError::Timeout(timeout))?
            },
        )
        .await
    }
}
