//! Client-side coordination for the event management backend: status rules,
//! subscription eligibility, a query cache kept consistent by invalidation, and
//! per-event guards against overlapping mutations and late responses.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod inflight;
pub mod notifications;
pub mod session;
pub mod transport;
pub mod validation;

pub use cache::{CacheFamily, CacheKey, CachedValue, QueryCache};
pub use config::{load_settings, ClientSettings};
pub use coordinator::{
    CoordinatorEvent, CoordinatorOptions, EventCoordinator, EventView, TransitionOutcome,
};
pub use error::{CoordinatorError, CoordinatorResult};
pub use notifications::{NotificationPoller, NotificationSink, TracingNotificationSink};
pub use session::{InMemorySessionStore, Session, SessionStore};
pub use transport::{HttpEventStore, RemoteEventStore};

#[cfg(test)]
#[path = "tests/fake_store.rs"]
mod fake_store;
