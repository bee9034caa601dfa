use std::collections::HashMap;

use tokio::sync::mpsc;

use super::state::{PlayerId, SessionId};
use crate::client::{Services, SessionClient};
use crate::error::SyncError;
use crate::events::SessionEvent;

pub struct SessionRegistry {
    services: Services,
    sessions: HashMap<SessionId, SessionClient>,
}

impl SessionRegistry {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            sessions: HashMap::new(),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn attach(
        &mut self,
        session_id: SessionId,
        player: PlayerId,
    ) -> Result<mpsc::Receiver<SessionEvent>, SyncError> {
        if self.sessions.contains_key(&session_id) {
            return Err(SyncError::AlreadyAttached(session_id));
        }
        let (client, events) = SessionClient::attach(&self.services, session_id.clone(), player).await?;
        self.sessions.insert(session_id, client);
        Ok(events)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&SessionClient> {
        self.sessions.get(session_id)
    }

    pub fn client(&self, session_id: &SessionId) -> Result<&SessionClient, SyncError> {
        self.get(session_id)
            .ok_or_else(|| SyncError::NotAttached(session_id.clone()))
    }

    pub async fn detach(&mut self, session_id: &SessionId) -> Result<(), SyncError> {
        let mut client = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| SyncError::NotAttached(session_id.clone()))?;
        client.shutdown().await;
        Ok(())
    }

    pub async fn detach_all(&mut self) {
        for (_, mut client) in self.sessions.drain() {
            client.shutdown().await;
        }
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
