//! Guarded mutations against the remote store, cached reads, and the
//! invalidation fan-out between them.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{EventId, EventStatus, Identity, NotificationId, Role, SubscriptionId, UserId},
    lifecycle::{self, UnsubscribePolicy},
    protocol::{
        Event, EventDraft, EventNotificationRequest, EventQuery, MySubscription, Notification,
        Subscriber, Subscription,
    },
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheFamily, CacheKey, CachedValue, QueryCache},
    config::ClientSettings,
    error::{CoordinatorError, CoordinatorResult},
    inflight::{ActionTicket, ActionTracker},
    notifications::{NotificationPoller, NotificationSink, TracingNotificationSink},
    session::SessionStore,
    transport::RemoteEventStore,
    validation,
};

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    EventChanged(Event),
    EventDeleted(EventId),
    SubscriptionChanged {
        event_id: EventId,
        user_id: UserId,
        subscribed: bool,
    },
    ParticipantRemoved {
        event_id: EventId,
        subscription_id: SubscriptionId,
        reason: String,
    },
    CacheInvalidated(CacheKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub mutation_timeout: Duration,
    pub unsubscribe_policy: UnsubscribePolicy,
}

impl From<&ClientSettings> for CoordinatorOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            mutation_timeout: settings.mutation_timeout(),
            unsubscribe_policy: settings.unsubscribe_policy,
        }
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventView {
    pub event: Event,
    pub subscribers: Vec<Subscriber>,
}

impl EventView {
    pub fn subscriber_count(&self) -> u32 {
        u32::try_from(self.subscribers.len()).unwrap_or(u32::MAX)
    }

    /// `None` for unlimited events.
    pub fn spots_left(&self) -> Option<u32> {
        (self.event.capacity > 0)
            .then(|| self.event.capacity.saturating_sub(self.subscriber_count()))
    }

    pub fn is_over_capacity(&self) -> bool {
        self.event.capacity > 0 && self.subscriber_count() > self.event.capacity
    }

    pub fn subscription_for(&self, user_id: &UserId) -> Option<&Subscriber> {
        self.subscribers.iter().find(|s| &s.user_id == user_id)
    }

    pub fn is_subscribed(&self, user_id: &UserId) -> bool {
        self.subscription_for(user_id).is_some()
    }

    pub fn can_subscribe(&self) -> bool {
        lifecycle::can_subscribe(&self.event, self.subscriber_count())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub event: Event,
    /// Set when the event left the live states with subscriptions still open.
    pub close_subscriptions_advised: bool,
}

pub struct EventCoordinator {
    store: Arc<dyn RemoteEventStore>,
    session: Arc<dyn SessionStore>,
    notifier: Arc<dyn NotificationSink>,
    cache: Arc<QueryCache>,
    actions: ActionTracker,
    options: CoordinatorOptions,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl EventCoordinator {
    pub fn new(
        store: Arc<dyn RemoteEventStore>,
        session: Arc<dyn SessionStore>,
        settings: &ClientSettings,
    ) -> Arc<Self> {
        Self::new_with_dependencies(
            store,
            session,
            Arc::new(TracingNotificationSink),
            CoordinatorOptions::from(settings),
        )
    }

    pub fn new_with_dependencies(
        store: Arc<dyn RemoteEventStore>,
        session: Arc<dyn SessionStore>,
        notifier: Arc<dyn NotificationSink>,
        options: CoordinatorOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            session,
            notifier,
            cache: Arc::new(QueryCache::new()),
            actions: ActionTracker::new(),
            options,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn is_mutation_in_flight(&self, event_id: &EventId) -> bool {
        self.actions.is_in_flight(event_id)
    }

    /// Lists events matching the server-side filter, then narrows them locally
    /// by `search` (title, description, location).
    pub async fn list_events(
        &self,
        query: &EventQuery,
        search: Option<&str>,
    ) -> CoordinatorResult<Vec<Event>> {
        let store = &self.store;
        let events = self
            .cache
            .fetch(CacheKey::Events(query.clone()), move || async move {
                store.list_events(query).await.map(CachedValue::Events)
            })
            .await?
            .into_events()?;
        Ok(match search {
            Some(term) => events
                .into_iter()
                .filter(|event| event.matches_search(term))
                .collect(),
            None => events,
        })
    }

    pub async fn event(&self, event_id: &EventId) -> CoordinatorResult<Event> {
        let store = &self.store;
        self.cache
            .fetch(CacheKey::Event(event_id.clone()), move || async move {
                store.get_event(event_id).await.map(CachedValue::Event)
            })
            .await?
            .into_event()
    }

    pub async fn subscribers(&self, event_id: &EventId) -> CoordinatorResult<Vec<Subscriber>> {
        let store = &self.store;
        self.cache
            .fetch(CacheKey::Subscribers(event_id.clone()), move || async move {
                store
                    .list_subscribers(event_id)
                    .await
                    .map(CachedValue::Subscribers)
            })
            .await?
            .into_subscribers()
    }

    pub async fn event_view(&self, event_id: &EventId) -> CoordinatorResult<EventView> {
        let (event, subscribers) =
            tokio::try_join!(self.event(event_id), self.subscribers(event_id))?;
        Ok(EventView { event, subscribers })
    }

    pub async fn my_subscriptions(&self) -> CoordinatorResult<Vec<MySubscription>> {
        let identity = self.require_session()?;
        let store = &self.store;
        let all = self
            .cache
            .fetch(CacheKey::MySubscriptions(identity.id), move || async move {
                store
                    .my_subscriptions()
                    .await
                    .map(CachedValue::MySubscriptions)
            })
            .await?
            .into_my_subscriptions()?;
        Ok(active_subscriptions(all))
    }

    pub async fn my_events(&self) -> CoordinatorResult<Vec<Event>> {
        let identity = self.require_session()?;
        if !identity.is_organizer() {
            return Err(CoordinatorError::Unauthorized(
                "only organizers have events".into(),
            ));
        }
        let store = &self.store;
        self.cache
            .fetch(CacheKey::MyEvents(identity.id), move || async move {
                store.my_events().await.map(CachedValue::Events)
            })
            .await?
            .into_events()
    }

    /// Refetches whatever gets invalidated and relays each invalidation as a
    /// [`CoordinatorEvent::CacheInvalidated`].
    pub fn spawn_refresher(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut invalidations = self.cache.subscribe_invalidations();
        tokio::spawn(async move {
            loop {
                let key = match invalidations.recv().await {
                    Ok(key) => key,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "coordinator: refresher lagged behind invalidations");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let _ = coordinator
                    .events
                    .send(CoordinatorEvent::CacheInvalidated(key.clone()));
                if let Err(err) = coordinator.refresh(&key).await {
                    debug!(key = %key, error = %err, "coordinator: background refetch failed");
                }
            }
        })
    }

    async fn refresh(&self, key: &CacheKey) -> CoordinatorResult<()> {
        match key {
            CacheKey::Event(event_id) => self.event(event_id).await.map(drop),
            CacheKey::Events(query) => self.list_events(query, None).await.map(drop),
            CacheKey::Subscribers(event_id) => self.subscribers(event_id).await.map(drop),
            CacheKey::MySubscriptions(user_id) | CacheKey::MyEvents(user_id) => {
                // Another user's list cannot be fetched with this session.
                if self.session.identity().map(|i| i.id).as_ref() != Some(user_id) {
                    self.cache.remove(key).await;
                    return Ok(());
                }
                if matches!(key, CacheKey::MyEvents(_)) {
                    self.my_events().await.map(drop)
                } else {
                    self.my_subscriptions().await.map(drop)
                }
            }
        }
    }

    pub async fn create_event(&self, draft: &EventDraft) -> CoordinatorResult<Event> {
        let identity = self.require_organizer()?;
        validation::validate_event_draft(draft, Some(Utc::now()))?;

        let store = Arc::clone(&self.store);
        let body = draft.clone();
        let created = self
            .dispatch_detached(async move { store.create_event(&body).await })
            .await
            .inspect_err(|err| warn!(error = %err, "coordinator: create event failed"))?;

        self.cache
            .put(
                CacheKey::Event(created.id.clone()),
                CachedValue::Event(created.clone()),
            )
            .await;
        self.invalidate_event_lists().await;
        info!(event_id = %created.id, organizer = %identity.id, "coordinator: event created");
        self.emit(CoordinatorEvent::EventChanged(created.clone()));
        Ok(created)
    }

    pub async fn update_event(
        &self,
        event_id: &EventId,
        draft: &EventDraft,
    ) -> CoordinatorResult<Event> {
        let identity = self.require_session()?;
        let event = self.event(event_id).await?;
        require_owner(&identity, &event)?;
        if !event.status.can_edit() {
            return Err(CoordinatorError::NotEligible(format!(
                "event is {} and can no longer be edited",
                event.status
            )));
        }
        validation::validate_event_draft(draft, None)?;

        let ticket = self.actions.begin(event_id)?;
        let store = Arc::clone(&self.store);
        let (id, body) = (event_id.clone(), draft.clone());
        let (updated, ticket) = self
            .dispatch(ticket, async move { store.update_event(&id, &body).await })
            .await?;
        let updated = self.apply_if_current(&ticket, updated).await?;
        drop(ticket);

        self.invalidate_event_lists().await;
        info!(%event_id, "coordinator: event updated");
        self.emit(CoordinatorEvent::EventChanged(updated.clone()));
        Ok(updated)
    }

    /// Moves an event along the status graph. The edge is checked before the
    /// actor, so an impossible move reports `InvalidTransition` to anyone.
    pub async fn request_transition(
        &self,
        event_id: &EventId,
        target: EventStatus,
    ) -> CoordinatorResult<TransitionOutcome> {
        let identity = self.require_session()?;
        let event = self.event(event_id).await?;
        event.status.transition(target)?;
        require_owner(&identity, &event)?;

        let ticket = self.actions.begin(event_id)?;
        let store = Arc::clone(&self.store);
        let id = event_id.clone();
        let (updated, ticket) = self
            .dispatch(ticket, async move { store.change_status(&id, target).await })
            .await
            .inspect_err(|err| {
                warn!(%event_id, to = %target, error = %err, "coordinator: transition failed")
            })?;
        let updated = self.apply_if_current(&ticket, updated).await?;
        drop(ticket);

        self.invalidate_event_lists().await;
        self.cache.invalidate_family(CacheFamily::MySubscriptions).await;
        info!(%event_id, from = %event.status, to = %updated.status, "coordinator: status changed");
        self.emit(CoordinatorEvent::EventChanged(updated.clone()));

        let close_subscriptions_advised =
            updated.subscriptions_open && !updated.status.can_manage_subscriptions();
        Ok(TransitionOutcome {
            event: updated,
            close_subscriptions_advised,
        })
    }

    /// Closing is allowed in any status while the flag is set.
    pub async fn set_subscriptions_open(
        &self,
        event_id: &EventId,
        open: bool,
    ) -> CoordinatorResult<Event> {
        let identity = self.require_session()?;
        let event = self.event(event_id).await?;
        require_owner(&identity, &event)?;
        if event.subscriptions_open == open {
            return Ok(event);
        }
        if open && !event.status.can_manage_subscriptions() {
            return Err(CoordinatorError::NotEligible(format!(
                "cannot open subscriptions while event is {}",
                event.status
            )));
        }

        let ticket = self.actions.begin(event_id)?;
        let store = Arc::clone(&self.store);
        let id = event_id.clone();
        let (updated, ticket) = self
            .dispatch(ticket, async move {
                store.set_subscriptions_open(&id, open).await
            })
            .await?;
        let updated = self.apply_if_current(&ticket, updated).await?;
        drop(ticket);

        self.invalidate_event_lists().await;
        info!(%event_id, open, "coordinator: subscriptions toggled");
        self.emit(CoordinatorEvent::EventChanged(updated.clone()));
        Ok(updated)
    }

    pub async fn delete_event(&self, event_id: &EventId) -> CoordinatorResult<()> {
        let identity = self.require_session()?;
        let event = self.event(event_id).await?;
        require_owner(&identity, &event)?;
        if !event.status.can_delete() {
            return Err(CoordinatorError::NotEligible(format!(
                "only draft events can be deleted (event is {})",
                event.status
            )));
        }

        let ticket = self.actions.begin(event_id)?;
        let store = Arc::clone(&self.store);
        let id = event_id.clone();
        let ((), ticket) = self
            .dispatch(ticket, async move { store.delete_event(&id).await })
            .await?;
        ensure_current(&ticket)?;
        drop(ticket);

        self.cache.remove(&CacheKey::Event(event_id.clone())).await;
        self.cache
            .remove(&CacheKey::Subscribers(event_id.clone()))
            .await;
        self.invalidate_event_lists().await;
        info!(%event_id, "coordinator: event deleted");
        self.emit(CoordinatorEvent::EventDeleted(event_id.clone()));
        Ok(())
    }

    /// Forced removal. The reason is checked before anything else so a blank
    /// one never reaches the network.
    pub async fn remove_participant(
        &self,
        event_id: &EventId,
        subscription_id: &SubscriptionId,
        reason: &str,
    ) -> CoordinatorResult<()> {
        validation::validate_removal_reason(reason)?;
        let reason = reason.trim();
        let identity = self.require_session()?;
        let event = self.event(event_id).await?;
        require_owner(&identity, &event)?;
        if !event.status.can_remove_participants() {
            return Err(CoordinatorError::NotEligible(format!(
                "participants cannot be removed while event is {}",
                event.status
            )));
        }
        let subscriber = self
            .subscribers(event_id)
            .await?
            .into_iter()
            .find(|s| &s.id == subscription_id)
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!(
                    "subscription {subscription_id} on event {event_id}"
                ))
            })?;

        let ticket = self.actions.begin(event_id)?;
        let store = Arc::clone(&self.store);
        let (id, sub_id, body) = (
            event_id.clone(),
            subscription_id.clone(),
            reason.to_string(),
        );
        let ((), ticket) = self
            .dispatch(ticket, async move {
                store.remove_subscriber(&id, &sub_id, &body).await
            })
            .await?;
        ensure_current(&ticket)?;
        drop(ticket);

        self.invalidate_event(event_id).await;
        self.cache.invalidate_family(CacheFamily::MySubscriptions).await;
        if let Err(err) = self
            .notifier
            .participant_removed(&event, &subscriber, reason)
            .await
        {
            warn!(%event_id, error = %err, "coordinator: removal notification failed");
        }
        info!(%event_id, %subscription_id, "coordinator: participant removed");
        self.emit(CoordinatorEvent::ParticipantRemoved {
            event_id: event_id.clone(),
            subscription_id: subscription_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub async fn send_event_notification(
        &self,
        event_id: &EventId,
        request: &EventNotificationRequest,
    ) -> CoordinatorResult<()> {
        validation::validate_notification(request)?;
        let identity = self.require_session()?;
        let event = self.event(event_id).await?;
        require_owner(&identity, &event)?;
        if !event.status.can_manage_subscriptions() {
            return Err(CoordinatorError::NotEligible(format!(
                "cannot notify participants while event is {}",
                event.status
            )));
        }

        let store = Arc::clone(&self.store);
        let (id, body) = (event_id.clone(), request.clone());
        self.dispatch_detached(async move { store.send_event_notification(&id, &body).await })
            .await?;
        info!(%event_id, "coordinator: notification sent to participants");
        Ok(())
    }

    pub async fn subscribe(&self, event_id: &EventId) -> CoordinatorResult<Subscription> {
        let identity = self.require_session()?;
        if identity.role != Role::Participant {
            return Err(CoordinatorError::Unauthorized(
                "only participants can subscribe".into(),
            ));
        }
        let view = self.event_view(event_id).await?;
        if view.is_subscribed(&identity.id) {
            return Err(CoordinatorError::NotEligible(
                "already subscribed to this event".into(),
            ));
        }
        if let Some(blocker) = lifecycle::subscribe_blocker(&view.event, view.subscriber_count()) {
            return Err(CoordinatorError::NotEligible(blocker.describe()));
        }

        let ticket = self.actions.begin(event_id)?;
        let store = Arc::clone(&self.store);
        let id = event_id.clone();
        let (subscription, ticket) = self
            .dispatch(ticket, async move { store.subscribe(&id).await })
            .await
            .inspect_err(|err| warn!(%event_id, error = %err, "coordinator: subscribe failed"))?;
        ensure_current(&ticket)?;
        drop(ticket);

        self.invalidate_subscription(event_id, &identity.id).await;
        info!(%event_id, user_id = %identity.id, "coordinator: subscribed");
        self.emit(CoordinatorEvent::SubscriptionChanged {
            event_id: event_id.clone(),
            user_id: identity.id,
            subscribed: true,
        });
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, subscription_id: &SubscriptionId) -> CoordinatorResult<()> {
        let identity = self.require_session()?;
        let subscription = self
            .my_subscriptions()
            .await?
            .into_iter()
            .find(|s| &s.id == subscription_id)
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!("no active subscription {subscription_id}"))
            })?;
        self.cancel_subscription(&identity, &subscription.event.id)
            .await
    }

    pub async fn unsubscribe_from_event(&self, event_id: &EventId) -> CoordinatorResult<()> {
        let identity = self.require_session()?;
        let held = self
            .my_subscriptions()
            .await?
            .iter()
            .any(|s| &s.event.id == event_id);
        if !held {
            return Err(CoordinatorError::NotFound(format!(
                "no active subscription to event {event_id}"
            )));
        }
        self.cancel_subscription(&identity, event_id).await
    }

    async fn cancel_subscription(
        &self,
        identity: &Identity,
        event_id: &EventId,
    ) -> CoordinatorResult<()> {
        let event = self.event(event_id).await?;
        if !self.options.unsubscribe_policy.allows(&event) {
            return Err(CoordinatorError::NotEligible(
                "subscriptions are closed for this event".into(),
            ));
        }

        let ticket = self.actions.begin(event_id)?;
        let store = Arc::clone(&self.store);
        let id = event_id.clone();
        let ((), ticket) = self
            .dispatch(ticket, async move { store.unsubscribe(&id).await })
            .await?;
        ensure_current(&ticket)?;
        drop(ticket);

        self.invalidate_subscription(event_id, &identity.id).await;
        info!(%event_id, user_id = %identity.id, "coordinator: unsubscribed");
        self.emit(CoordinatorEvent::SubscriptionChanged {
            event_id: event_id.clone(),
            user_id: identity.id.clone(),
            subscribed: false,
        });
        Ok(())
    }

    pub async fn notifications(&self) -> CoordinatorResult<Vec<Notification>> {
        self.require_session()?;
        self.store.list_notifications().await
    }

    pub async fn unread_notification_count(&self) -> CoordinatorResult<u32> {
        self.require_session()?;
        self.store.unread_notification_count().await
    }

    pub async fn mark_notification_read(
        &self,
        notification_id: &NotificationId,
    ) -> CoordinatorResult<()> {
        self.require_session()?;
        self.store.mark_notification_read(notification_id).await
    }

    pub async fn mark_all_notifications_read(&self) -> CoordinatorResult<()> {
        self.require_session()?;
        self.store.mark_all_notifications_read().await
    }

    pub fn notification_poller(&self, every: Duration) -> NotificationPoller {
        NotificationPoller::spawn(Arc::clone(&self.store), Arc::clone(&self.session), every)
    }

    fn require_session(&self) -> CoordinatorResult<Identity> {
        self.session
            .identity()
            .ok_or(CoordinatorError::Unauthenticated(None))
    }

    fn require_organizer(&self) -> CoordinatorResult<Identity> {
        let identity = self.require_session()?;
        if !identity.is_organizer() {
            return Err(CoordinatorError::Unauthorized(
                "only organizers can manage events".into(),
            ));
        }
        Ok(identity)
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    fn timed_out(&self) -> CoordinatorError {
        CoordinatorError::unavailable(format!(
            "no response within {:?}",
            self.options.mutation_timeout
        ))
    }

    /// Like `dispatch`, for calls with no event slot. Event lists are invalidated
    /// at the timeout and again when the call settles.
    async fn dispatch_detached<T, Fut>(&self, call: Fut) -> CoordinatorResult<T>
    where
        T: Send + 'static,
        Fut: Future<Output = CoordinatorResult<T>> + Send + 'static,
    {
        let mut task = tokio::spawn(call);
        match tokio::time::timeout(self.options.mutation_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(CoordinatorError::unavailable(format!(
                "request task failed: {join_err}"
            ))),
            Err(_) => {
                warn!("coordinator: mutation timed out; lists invalidated");
                self.invalidate_event_lists().await;

                let cache = Arc::clone(&self.cache);
                tokio::spawn(async move {
                    match task.await {
                        Ok(Ok(_)) => {
                            debug!("coordinator: late response landed");
                            cache.invalidate_family(CacheFamily::Events).await;
                            cache.invalidate_family(CacheFamily::MyEvents).await;
                        }
                        Ok(Err(err)) => debug!(error = %err, "coordinator: late failure"),
                        Err(join_err) => {
                            warn!(error = %join_err, "coordinator: late task failed")
                        }
                    }
                });
                Err(self.timed_out())
            }
        }
    }

    /// Runs a remote call on its own task. On timeout the slot is released and a
    /// late result only invalidates if no newer action started on the event.
    async fn dispatch<T, Fut>(
        &self,
        ticket: ActionTicket,
        call: Fut,
    ) -> CoordinatorResult<(T, ActionTicket)>
    where
        T: Send + 'static,
        Fut: Future<Output = CoordinatorResult<T>> + Send + 'static,
    {
        let mut task = tokio::spawn(call);
        match tokio::time::timeout(self.options.mutation_timeout, &mut task).await {
            Ok(Ok(Ok(value))) => Ok((value, ticket)),
            Ok(Ok(Err(err))) => {
                // Cached event and subscribers may be out of date.
                if matches!(
                    err,
                    CoordinatorError::NotEligible(_)
                        | CoordinatorError::NotFound(_)
                        | CoordinatorError::RemoteUnavailable { .. }
                ) {
                    let event_id = ticket.event_id().clone();
                    drop(ticket);
                    debug!(%event_id, error = %err, "coordinator: refusal invalidates event views");
                    self.invalidate_event(&event_id).await;
                }
                Err(err)
            }
            Ok(Err(join_err)) => Err(CoordinatorError::unavailable(format!(
                "request task failed: {join_err}"
            ))),
            Err(_) => {
                let event_id = ticket.event_id().clone();
                let action_id = ticket.action_id();
                drop(ticket);
                warn!(%event_id, action_id, "coordinator: mutation timed out; slot released");
                self.invalidate_event(&event_id).await;

                let actions = self.actions.clone();
                let cache = Arc::clone(&self.cache);
                tokio::spawn(async move {
                    match task.await {
                        Ok(Ok(_)) if actions.is_current(&event_id, action_id) => {
                            debug!(%event_id, action_id, "coordinator: late response applied");
                            cache.invalidate(&CacheKey::Event(event_id.clone())).await;
                            cache
                                .invalidate(&CacheKey::Subscribers(event_id.clone()))
                                .await;
                            cache.invalidate_family(CacheFamily::Events).await;
                            cache.invalidate_family(CacheFamily::MyEvents).await;
                        }
                        Ok(Ok(_)) => {
                            debug!(
                                %event_id,
                                action_id,
                                error = %CoordinatorError::StaleResponseDiscarded,
                                "coordinator: late response dropped"
                            );
                        }
                        Ok(Err(err)) => {
                            debug!(%event_id, action_id, error = %err, "coordinator: late failure")
                        }
                        Err(join_err) => {
                            warn!(%event_id, error = %join_err, "coordinator: late task failed")
                        }
                    }
                });
                Err(self.timed_out())
            }
        }
    }

    async fn apply_if_current(
        &self,
        ticket: &ActionTicket,
        event: Event,
    ) -> CoordinatorResult<Event> {
        ensure_current(ticket)?;
        self.cache
            .put(
                CacheKey::Event(event.id.clone()),
                CachedValue::Event(event.clone()),
            )
            .await;
        Ok(event)
    }

    async fn invalidate_event_lists(&self) {
        self.cache.invalidate_family(CacheFamily::Events).await;
        self.cache.invalidate_family(CacheFamily::MyEvents).await;
    }

    async fn invalidate_event(&self, event_id: &EventId) {
        self.cache.invalidate(&CacheKey::Event(event_id.clone())).await;
        self.cache
            .invalidate(&CacheKey::Subscribers(event_id.clone()))
            .await;
        self.invalidate_event_lists().await;
    }

    async fn invalidate_subscription(&self, event_id: &EventId, user_id: &UserId) {
        self.invalidate_event(event_id).await;
        self.cache
            .invalidate(&CacheKey::MySubscriptions(user_id.clone()))
            .await;
    }
}

fn ensure_current(ticket: &ActionTicket) -> CoordinatorResult<()> {
    if ticket.is_current() {
        Ok(())
    } else {
        debug!(
            event_id = %ticket.event_id(),
            action_id = ticket.action_id(),
            "coordinator: response superseded"
        );
        Err(CoordinatorError::StaleResponseDiscarded)
    }
}

fn require_owner(identity: &Identity, event: &Event) -> CoordinatorResult<()> {
    if identity.is_organizer() && event.is_organized_by(&identity.id) {
        Ok(())
    } else {
        Err(CoordinatorError::Unauthorized(format!(
            "only the organizer of event {} can do this",
            event.id
        )))
    }
}

/// Keeps active entries only, one per event; the latest `subscribed_at` wins.
fn active_subscriptions(all: Vec<MySubscription>) -> Vec<MySubscription> {
    let mut latest: HashMap<EventId, MySubscription> = HashMap::new();
    for entry in all.into_iter().filter(MySubscription::is_active) {
        match latest.get(&entry.event.id) {
            Some(kept) if kept.subscribed_at >= entry.subscribed_at => {}
            _ => {
                latest.insert(entry.event.id.clone(), entry);
            }
        }
    }
    let mut active: Vec<MySubscription> = latest.into_values().collect();
    active.sort_by(|a, b| b.subscribed_at.cmp(&a.subscribed_at));
    active
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
