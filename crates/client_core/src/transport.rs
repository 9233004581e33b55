use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{EventId, EventStatus, Identity, NotificationId, SubscriptionId},
    protocol::{
        AuthResponse, ChangePasswordRequest, Event, EventDraft, EventNotificationRequest,
        EventQuery, LoginRequest, MySubscription, Notification, RegisterRequest, RemovalRequest,
        StatusChangeRequest, Subscriber, Subscription, SubscriptionsToggleRequest,
        UnreadCountResponse, UpdateNameRequest, UserProfile,
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::{CoordinatorError, CoordinatorResult},
    session::{Session, SessionStore},
    validation,
};

/// The REST backend. Implementations translate every failure into
/// [`CoordinatorError`] so the coordinator never sees transport types.
#[async_trait]
pub trait RemoteEventStore: Send + Sync {
    async fn list_events(&self, query: &EventQuery) -> CoordinatorResult<Vec<Event>>;
    async fn get_event(&self, event_id: &EventId) -> CoordinatorResult<Event>;
    async fn create_event(&self, draft: &EventDraft) -> CoordinatorResult<Event>;
    async fn update_event(&self, event_id: &EventId, draft: &EventDraft)
        -> CoordinatorResult<Event>;
    async fn change_status(
        &self,
        event_id: &EventId,
        status: EventStatus,
    ) -> CoordinatorResult<Event>;
    async fn set_subscriptions_open(&self, event_id: &EventId, open: bool)
        -> CoordinatorResult<Event>;
    async fn delete_event(&self, event_id: &EventId) -> CoordinatorResult<()>;
    async fn list_subscribers(&self, event_id: &EventId) -> CoordinatorResult<Vec<Subscriber>>;
    async fn subscribe(&self, event_id: &EventId) -> CoordinatorResult<Subscription>;
    async fn unsubscribe(&self, event_id: &EventId) -> CoordinatorResult<()>;
    async fn remove_subscriber(
        &self,
        event_id: &EventId,
        subscription_id: &SubscriptionId,
        reason: &str,
    ) -> CoordinatorResult<()>;
    async fn my_subscriptions(&self) -> CoordinatorResult<Vec<MySubscription>>;
    async fn my_events(&self) -> CoordinatorResult<Vec<Event>>;
    async fn send_event_notification(
        &self,
        event_id: &EventId,
        request: &EventNotificationRequest,
    ) -> CoordinatorResult<()>;
    async fn list_notifications(&self) -> CoordinatorResult<Vec<Notification>>;
    async fn unread_notification_count(&self) -> CoordinatorResult<u32>;
    async fn mark_notification_read(&self, notification_id: &NotificationId)
        -> CoordinatorResult<()>;
    async fn mark_all_notifications_read(&self) -> CoordinatorResult<()>;
}

pub struct HttpEventStore {
    http: Client,
    base_url: String,
    session: Arc<dyn SessionStore>,
}

impl HttpEventStore {
    pub fn new(
        settings: &ClientSettings,
        session: Arc<dyn SessionStore>,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    pub async fn login(&self, email: &str, password: &str) -> CoordinatorResult<UserProfile> {
        validation::validate_login(email, password)?;
        let response: AuthResponse = self
            .send_json(self.http.post(self.url("/auth/login")).json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            }))
            .await?;
        self.session.set(Session {
            identity: Identity {
                id: response.user.id.clone(),
                role: response.user.role,
            },
            token: response.token,
        });
        Ok(response.user)
    }

    /// Creates an account. The caller still has to log in afterwards.
    pub async fn register(&self, request: &RegisterRequest) -> CoordinatorResult<UserProfile> {
        validation::validate_registration(request)?;
        let user: UserProfile = self
            .send_json(self.http.post(self.url("/auth/register")).json(request))
            .await?;
        info!(user_id = %user.id, role = ?user.role, "store: account registered");
        Ok(user)
    }

    pub fn logout(&self) {
        self.session.clear();
    }

    pub async fn me(&self) -> CoordinatorResult<UserProfile> {
        let builder = self.http.get(self.url("/users/me"));
        self.send_json(self.authorized(builder)?).await
    }

    /// Renames the signed-in user. A blank or unchanged name is a no-op that
    /// returns `profile` as is.
    pub async fn update_name(
        &self,
        profile: &UserProfile,
        name: &str,
    ) -> CoordinatorResult<UserProfile> {
        let name = name.trim();
        if name.is_empty() || name == profile.name {
            return Ok(profile.clone());
        }
        let builder = self
            .http
            .put(self.url(&format!("/users/{}", profile.id)))
            .json(&UpdateNameRequest {
                name: name.to_string(),
            });
        self.send_json(self.authorized(builder)?).await
    }

    pub async fn change_password(
        &self,
        profile: &UserProfile,
        current: &str,
        new_password: &str,
        confirmation: &str,
    ) -> CoordinatorResult<()> {
        validation::validate_password_change(current, new_password, confirmation)?;
        let builder = self
            .http
            .put(self.url(&format!("/users/{}", profile.id)))
            .json(&ChangePasswordRequest {
                current_password: current.to_string(),
                new_password: new_password.to_string(),
            });
        self.send_empty(self.authorized(builder)?).await?;
        info!(user_id = %profile.id, "store: password changed");
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> CoordinatorResult<RequestBuilder> {
        let session = self
            .session
            .current()
            .ok_or(CoordinatorError::Unauthenticated(None))?;
        Ok(builder.bearer_auth(session.token))
    }

    /// Public endpoints still carry the token when one is available.
    fn maybe_authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.session.current() {
            Some(session) => builder.bearer_auth(session.token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> CoordinatorResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED {
            warn!("store: 401 received; invalidating session");
            self.session.clear();
        }
        let url = response.url().clone();
        let body = response.bytes().await.unwrap_or_default();
        let err = CoordinatorError::from_response(status.as_u16(), &body);
        debug!(%url, status = status.as_u16(), error = %err, "store: request failed");
        Err(err)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> CoordinatorResult<T> {
        Ok(self.send(builder).await?.json().await?)
    }

    async fn send_empty(&self, builder: RequestBuilder) -> CoordinatorResult<()> {
        self.send(builder).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteEventStore for HttpEventStore {
    async fn list_events(&self, query: &EventQuery) -> CoordinatorResult<Vec<Event>> {
        let builder = self.http.get(self.url("/events")).query(query);
        self.send_json(self.maybe_authorized(builder)).await
    }

    async fn get_event(&self, event_id: &EventId) -> CoordinatorResult<Event> {
        let builder = self.http.get(self.url(&format!("/events/{event_id}")));
        self.send_json(self.maybe_authorized(builder)).await
    }

    async fn create_event(&self, draft: &EventDraft) -> CoordinatorResult<Event> {
        let builder = self.http.post(self.url("/events")).json(draft);
        self.send_json(self.authorized(builder)?).await
    }

    async fn update_event(
        &self,
        event_id: &EventId,
        draft: &EventDraft,
    ) -> CoordinatorResult<Event> {
        let builder = self
            .http
            .put(self.url(&format!("/events/{event_id}")))
            .json(draft);
        self.send_json(self.authorized(builder)?).await
    }

    async fn change_status(
        &self,
        event_id: &EventId,
        status: EventStatus,
    ) -> CoordinatorResult<Event> {
        let builder = self
            .http
            .patch(self.url(&format!("/events/{event_id}/status")))
            .json(&StatusChangeRequest { status });
        self.send_json(self.authorized(builder)?).await
    }

    async fn set_subscriptions_open(
        &self,
        event_id: &EventId,
        open: bool,
    ) -> CoordinatorResult<Event> {
        let builder = self
            .http
            .patch(self.url(&format!("/events/{event_id}/subscriptions")))
            .json(&SubscriptionsToggleRequest { open });
        self.send_json(self.authorized(builder)?).await
    }

    async fn delete_event(&self, event_id: &EventId) -> CoordinatorResult<()> {
        let builder = self.http.delete(self.url(&format!("/events/{event_id}")));
        self.send_empty(self.authorized(builder)?).await
    }

    async fn list_subscribers(&self, event_id: &EventId) -> CoordinatorResult<Vec<Subscriber>> {
        let builder = self
            .http
            .get(self.url(&format!("/events/{event_id}/subscribers")));
        self.send_json(self.maybe_authorized(builder)).await
    }

    async fn subscribe(&self, event_id: &EventId) -> CoordinatorResult<Subscription> {
        let builder = self
            .http
            .post(self.url(&format!("/events/{event_id}/subscribe")));
        self.send_json(self.authorized(builder)?).await
    }

    async fn unsubscribe(&self, event_id: &EventId) -> CoordinatorResult<()> {
        let builder = self
            .http
            .delete(self.url(&format!("/events/{event_id}/subscribe")));
        self.send_empty(self.authorized(builder)?).await
    }

    async fn remove_subscriber(
        &self,
        event_id: &EventId,
        subscription_id: &SubscriptionId,
        reason: &str,
    ) -> CoordinatorResult<()> {
        let builder = self
            .http
            .delete(self.url(&format!(
                "/events/{event_id}/subscribers/{subscription_id}"
            )))
            .json(&RemovalRequest {
                reason: reason.to_string(),
            });
        self.send_empty(self.authorized(builder)?).await
    }

    async fn my_subscriptions(&self) -> CoordinatorResult<Vec<MySubscription>> {
        let builder = self
            .http
            .get(self.url("/events/participant/my-subscriptions"));
        self.send_json(self.authorized(builder)?).await
    }

    async fn my_events(&self) -> CoordinatorResult<Vec<Event>> {
        let builder = self.http.get(self.url("/events/organizer/my-events"));
        self.send_json(self.authorized(builder)?).await
    }

    async fn send_event_notification(
        &self,
        event_id: &EventId,
        request: &EventNotificationRequest,
    ) -> CoordinatorResult<()> {
        let builder = self
            .http
            .post(self.url(&format!("/notifications/event/{event_id}/send")))
            .json(request);
        self.send_empty(self.authorized(builder)?).await
    }

    async fn list_notifications(&self) -> CoordinatorResult<Vec<Notification>> {
        let builder = self.http.get(self.url("/notifications"));
        self.send_json(self.authorized(builder)?).await
    }

    async fn unread_notification_count(&self) -> CoordinatorResult<u32> {
        let builder = self.http.get(self.url("/notifications/unread-count"));
        let response: UnreadCountResponse = self.send_json(self.authorized(builder)?).await?;
        Ok(response.count)
    }

    async fn mark_notification_read(
        &self,
        notification_id: &NotificationId,
    ) -> CoordinatorResult<()> {
        let builder = self
            .http
            .patch(self.url(&format!("/notifications/{notification_id}/read")));
        self.send_empty(self.authorized(builder)?).await
    }

    async fn mark_all_notifications_read(&self) -> CoordinatorResult<()> {
        let builder = self.http.patch(self.url("/notifications/mark-all-read"));
        self.send_empty(self.authorized(builder)?).await
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
