use std::sync::Arc;

use crate::error::{LobbyError, StoreError};
use crate::rules::RuleEngine;
use crate::session::{Color, PlayerId, SessionId, SessionState, SessionStatus};
use crate::store::DurableStore;

#[derive(Clone)]
pub struct Lobby {
    store: Arc<dyn DurableStore>,
    rules: Arc<dyn RuleEngine>,
}

impl Lobby {
    pub fn new(store: Arc<dyn DurableStore>, rules: Arc<dyn RuleEngine>) -> Self {
        Self { store, rules }
    }

    pub async fn create_session(
        &self,
        session_id: SessionId,
        creator: PlayerId,
        color: Color,
    ) -> Result<SessionState, LobbyError> {
        let state = SessionState::new(
            session_id.clone(),
            creator.clone(),
            color,
            self.rules.initial_position(),
        );

        match self.store.insert_session(&state).await {
            Ok(()) => {
                log::info!("Created session {} with {} as {:?}", session_id, creator, color);
                Ok(state)
            }
            Err(StoreError::AlreadyExists(id)) => Err(LobbyError::AlreadyExists(id)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn join_session(
        &self,
        session_id: &SessionId,
        player: PlayerId,
    ) -> Result<SessionState, LobbyError> {
        let current = self.store.read_session(session_id).await?;

        if current.color_of(&player).is_some() {
            return Err(LobbyError::AlreadySeated(session_id.clone()));
        }
        if current.status != SessionStatus::Waiting {
            return Err(LobbyError::NotWaiting {
                session_id: session_id.clone(),
                status: current.status,
            });
        }
        let Some(seat) = current.open_seat() else {
            return Err(LobbyError::SessionFull(session_id.clone()));
        };

        let mut joined = current.clone();
        match seat {
            Color::White => joined.white = Some(player.clone()),
            Color::Black => joined.black = Some(player.clone()),
        }
        joined.status = SessionStatus::Playing;

        match self.store.write_session(&joined).await {
            Ok(()) => {
                log::info!("{} joined {} as {:?}", player, session_id, seat);
                Ok(joined)
            }
            // Someone else took the seat between our read and write.
            Err(StoreError::SeatTaken(id)) | Err(StoreError::Conflict { session_id: id, .. }) => {
                Err(LobbyError::SessionFull(id))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::StandardChess;
    use crate::store::MemoryStore;

    fn lobby() -> (Lobby, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Lobby::new(store.clone(), Arc::new(StandardChess::new())), store)
    }

    #[tokio::test]
    async fn test_lobby_lifecycle() {
        let (lobby, store) = lobby();
        let id = SessionId::new("g1");

        let created = lobby
            .create_session(id.clone(), PlayerId::new("alice"), Color::Black)
            .await
            .unwrap();
        assert_eq!(created.status, SessionStatus::Waiting);
        assert_eq!(created.black, Some(PlayerId::new("alice")));
        assert_eq!(created.open_seat(), Some(Color::White));

        let joined = lobby.join_session(&id, PlayerId::new("bob")).await.unwrap();
        assert_eq!(joined.status, SessionStatus::Playing);
        assert_eq!(joined.white, Some(PlayerId::new("bob")));
        assert!(joined.check_invariants().is_ok());
        assert_eq!(store.peek(&id), Some(joined));
    }

    #[tokio::test]
    async fn test_join_rejections() {
        let (lobby, _store) = lobby();
        let id = SessionId::new("g1");
        lobby
            .create_session(id.clone(), PlayerId::new("alice"), Color::White)
            .await
            .unwrap();

        assert!(matches!(
            lobby.create_session(id.clone(), PlayerId::new("carol"), Color::White).await,
            Err(LobbyError::AlreadyExists(_))
        ));
        assert!(matches!(
            lobby.join_session(&id, PlayerId::new("alice")).await,
            Err(LobbyError::AlreadySeated(_))
        ));

        lobby.join_session(&id, PlayerId::new("bob")).await.unwrap();
        assert!(matches!(
            lobby.join_session(&id, PlayerId::new("carol")).await,
            Err(LobbyError::NotWaiting { status: SessionStatus::Playing, .. })
        ));
        assert!(matches!(
            lobby.join_session(&SessionId::new("nope"), PlayerId::new("carol")).await,
            Err(LobbyError::Store(StoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_racing_joiners_get_one_seat() {
        let (lobby, store) = lobby();
        let id = SessionId::new("g1");
        lobby
            .create_session(id.clone(), PlayerId::new("alice"), Color::White)
            .await
            .unwrap();

        let (bob, carol) = tokio::join!(
            lobby.join_session(&id, PlayerId::new("bob")),
            lobby.join_session(&id, PlayerId::new("carol")),
        );
        assert_eq!(u8::from(bob.is_ok()) + u8::from(carol.is_ok()), 1);

        let stored = store.peek(&id).unwrap();
        assert!(stored.black.is_some());
        assert_eq!(stored.status, SessionStatus::Playing);
    }
}
