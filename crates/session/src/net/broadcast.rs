use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::link::{LinkSimulation, LinkStats, LinkStatsSnapshot};
use crate::error::BroadcastError;
use crate::feed::{lock, Fanout, Subscription};
use crate::session::SessionId;

/// Low-latency, unordered and lossy channel scoped to one session. A frame
/// may be dropped, duplicated or reordered; subscribers must cope.
#[async_trait]
pub trait Broadcast: Send + Sync {
    async fn publish(&self, session_id: &SessionId, frame: Vec<u8>) -> Result<(), BroadcastError>;

    async fn subscribe(&self, session_id: &SessionId) -> Result<Subscription<Vec<u8>>, BroadcastError>;
}

#[derive(Debug)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<SessionId, Fanout<Vec<u8>>>>,
    link: Mutex<LinkSimulation>,
    available: AtomicBool,
    failing_publishes: AtomicU32,
    stats: LinkStats,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_link(LinkSimulation::default())
    }

    pub fn with_link(link: LinkSimulation) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            link: Mutex::new(link),
            available: AtomicBool::new(true),
            failing_publishes: AtomicU32::new(0),
            stats: LinkStats::default(),
        }
    }

    pub fn set_link(&self, link: LinkSimulation) {
        *lock(&self.link) = link;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    pub fn drop_subscribers(&self, session_id: &SessionId) -> usize {
        lock(&self.channels)
            .get_mut(session_id)
            .map_or(0, Fanout::clear)
    }

    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        lock(&self.channels).get(session_id).map_or(0, Fanout::len)
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.stats.snapshot()
    }

    fn check_available(&self) -> Result<(), BroadcastError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BroadcastError::Unavailable("broadcast hub offline".to_string()));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broadcast for BroadcastHub {
    async fn publish(&self, session_id: &SessionId, frame: Vec<u8>) -> Result<(), BroadcastError> {
        self.check_available()?;
        if self.take_injected_failure() {
            return Err(BroadcastError::Unavailable("injected publish failure".to_string()));
        }
        self.stats.published();

        let link = lock(&self.link).clone();
        let targets = lock(&self.channels)
            .get_mut(session_id)
            .map(Fanout::senders)
            .unwrap_or_default();

        for target in targets {
            if link.should_drop() {
                self.stats.dropped();
                continue;
            }
            let copies = if link.should_duplicate() {
                self.stats.duplicated();
                2
            } else {
                1
            };
            for _ in 0..copies {
                let delay = link.delay();
                if delay.is_zero() {
                    if target.send(frame.clone()).is_ok() {
                        self.stats.delivered();
                    }
                } else {
                    let target = target.clone();
                    let frame = frame.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = target.send(frame);
                    });
                    self.stats.delivered();
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, session_id: &SessionId) -> Result<Subscription<Vec<u8>>, BroadcastError> {
        self.check_available()?;
        let subscription = lock(&self.channels)
            .entry(session_id.clone())
            .or_default()
            .subscribe();
        log::debug!("Broadcast subscriber added for session {}", session_id);
        Ok(subscription)
    }
}
