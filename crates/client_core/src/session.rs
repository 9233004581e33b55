use std::fmt;

use shared::domain::Identity;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub token: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Source of the authenticated identity. The coordinator reads it; only the auth
/// flow (login, logout, a 401 from the store) writes it.
pub trait SessionStore: Send + Sync {
    fn current(&self) -> Option<Session>;
    fn set(&self, session: Session);
    fn clear(&self);
    fn subscribe_changes(&self) -> watch::Receiver<Option<Session>>;

    fn identity(&self) -> Option<Identity> {
        self.current().map(|session| session.identity)
    }
}

pub struct InMemorySessionStore {
    tx: watch::Sender<Option<Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn with_session(session: Session) -> Self {
        let (tx, _) = watch::channel(Some(session));
        Self { tx }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for InMemorySessionStore {
    fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    fn set(&self, session: Session) {
        info!(user_id = %session.identity.id, role = ?session.identity.role, "session: signed in");
        self.tx.send_replace(Some(session));
    }

    fn clear(&self) {
        if self.tx.send_replace(None).is_some() {
            info!("session: cleared");
        }
    }

    fn subscribe_changes(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::{Role, UserId};

    use super::*;

    fn session() -> Session {
        Session {
            identity: Identity {
                id: UserId::new("u-1"),
                role: Role::Participant,
            },
            token: "secret-token".into(),
        }
    }

    #[test]
    fn debug_output_hides_token() {
        let rendered = format!("{:?}", session());
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("u-1"));
    }

    #[tokio::test]
    async fn subscribers_observe_sign_in_and_clear() {
        let store = InMemorySessionStore::new();
        let mut changes = store.subscribe_changes();
        assert!(store.current().is_none());

        store.set(session());
        changes.changed().await.expect("change");
        assert_eq!(
            changes.borrow_and_update().as_ref().map(|s| s.identity.id.clone()),
            Some(UserId::new("u-1"))
        );

        store.clear();
        changes.changed().await.expect("change");
        assert!(changes.borrow().is_none());
        assert!(store.identity().is_none());
    }
}
