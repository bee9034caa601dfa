//! Durable, strongly consistent session storage.

mod memory;

pub use memory::{MemoryStore, StoreCounters};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::feed::Subscription;
use crate::session::{SessionId, SessionState};

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn read_session(&self, session_id: &SessionId) -> Result<SessionState, StoreError>;

    async fn insert_session(&self, state: &SessionState) -> Result<(), StoreError>;

    async fn write_session(&self, state: &SessionState) -> Result<(), StoreError>;

    /// Sets `settlement_done` if and only if it is currently unset. Exactly
    /// one caller ever observes `Ok(true)` for a session.
    async fn compare_and_set_settlement(&self, session_id: &SessionId) -> Result<bool, StoreError>;

    async fn subscribe(&self, session_id: &SessionId) -> Result<Subscription<SessionState>, StoreError>;
}
