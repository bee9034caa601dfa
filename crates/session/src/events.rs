use tokio::sync::mpsc;

use crate::session::{GameResult, TerminalReason};
use crate::sync::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Local,
    Broadcast,
    ChangeFeed,
}

impl UpdateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSource::Local => "local",
            UpdateSource::Broadcast => "broadcast",
            UpdateSource::ChangeFeed => "change feed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Advanced {
        ply_index: u32,
        source: UpdateSource,
    },
    Resynced {
        ply_index: u32,
    },
    Finished {
        result: GameResult,
        reason: TerminalReason,
    },
    Settled {
        settled_here: bool,
    },
    SettlementFailed {
        message: String,
    },
    Connection(ConnectionState),
    AbandonPending,
}

#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                log::warn!("Event channel full, dropping {:?}", dropped);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::trace!("Event channel closed");
            }
        }
    }
}
