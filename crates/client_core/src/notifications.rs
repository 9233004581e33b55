use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::protocol::{Event, Subscriber};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    error::{CoordinatorError, CoordinatorResult},
    session::SessionStore,
    transport::RemoteEventStore,
};

/// Tells a participant they were removed from an event.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn participant_removed(
        &self,
        event: &Event,
        subscriber: &Subscriber,
        reason: &str,
    ) -> CoordinatorResult<()>;
}

/// The store already notifies removed participants server-side; this sink only
/// records the removal locally.
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn participant_removed(
        &self,
        event: &Event,
        subscriber: &Subscriber,
        reason: &str,
    ) -> CoordinatorResult<()> {
        info!(
            event_id = %event.id,
            user_id = %subscriber.user_id,
            reason,
            "notifications: participant removed"
        );
        Ok(())
    }
}

/// Periodically refreshes the unread notification count. One request at a time;
/// ticks that fall behind are skipped, and ticks without a session publish zero.
pub struct NotificationPoller {
    handle: JoinHandle<()>,
    unread: watch::Receiver<u32>,
}

impl NotificationPoller {
    pub fn spawn(
        store: Arc<dyn RemoteEventStore>,
        session: Arc<dyn SessionStore>,
        every: Duration,
    ) -> Self {
        let (tx, unread) = watch::channel(0);
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if session.current().is_none() {
                    tx.send_if_modified(|count| std::mem::replace(count, 0) != 0);
                    continue;
                }
                match store.unread_notification_count().await {
                    Ok(count) => {
                        tx.send_if_modified(|current| {
                            if *current == count {
                                return false;
                            }
                            debug!(count, "notifications: unread count changed");
                            *current = count;
                            true
                        });
                    }
                    Err(CoordinatorError::Unauthenticated(_)) => {
                        tx.send_if_modified(|count| std::mem::replace(count, 0) != 0);
                    }
                    Err(err) => warn!(error = %err, "notifications: poll failed"),
                }
            }
        });
        Self { handle, unread }
    }

    pub fn unread(&self) -> watch::Receiver<u32> {
        self.unread.clone()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for NotificationPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        fake_store::FakeStore,
        session::{InMemorySessionStore, Session},
    };
    use shared::domain::{Identity, Role, UserId};

    fn signed_in() -> Arc<InMemorySessionStore> {
        Arc::new(InMemorySessionStore::with_session(Session {
            identity: Identity {
                id: UserId::new("user-1"),
                role: Role::Participant,
            },
            token: "t".into(),
        }))
    }

    #[tokio::test]
    async fn publishes_unread_count_while_signed_in() {
        let session = signed_in();
        let store = Arc::new(FakeStore::new(session.clone()));
        store.set_unread(3);

        let poller = NotificationPoller::spawn(store.clone(), session, Duration::from_millis(10));
        let mut unread = poller.unread();
        time::timeout(Duration::from_secs(2), unread.wait_for(|count| *count == 3))
            .await
            .expect("poll in time")
            .expect("sender alive");

        store.set_unread(0);
        time::timeout(Duration::from_secs(2), unread.wait_for(|count| *count == 0))
            .await
            .expect("poll in time")
            .expect("sender alive");
    }

    #[tokio::test]
    async fn skips_requests_without_a_session() {
        let session = Arc::new(InMemorySessionStore::new());
        let store = Arc::new(FakeStore::new(session.clone()));
        store.set_unread(5);

        let poller = NotificationPoller::spawn(store.clone(), session, Duration::from_millis(5));
        time::sleep(Duration::from_millis(60)).await;

        assert_eq!(*poller.unread().borrow(), 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_ends_polling() {
        let session = signed_in();
        let store = Arc::new(FakeStore::new(session.clone()));

        let poller = NotificationPoller::spawn(store.clone(), session, Duration::from_millis(5));
        time::sleep(Duration::from_millis(30)).await;
        poller.stop();
        time::sleep(Duration::from_millis(20)).await;
        assert!(poller.is_stopped());

        let after_stop = store.calls.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), after_stop);
    }
}
