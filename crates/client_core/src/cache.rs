//! Keyed query cache with invalidate/refetch semantics.
//!
//! Entries are never patched with guesses: a value is either what the store
//! returned or stale. Invalidation marks the entry stale and bumps its
//! generation; a fetch that started before the bump does not overwrite the
//! entry when it lands, so readers see stale-then-fresh and never a torn value.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    fmt,
    future::Future,
    hash::{Hash, Hasher},
};

use shared::{
    domain::{EventId, UserId},
    protocol::{Event, EventQuery, MySubscription, Subscriber},
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::error::{CoordinatorError, CoordinatorResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Event(EventId),
    Events(EventQuery),
    Subscribers(EventId),
    MySubscriptions(UserId),
    MyEvents(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheFamily {
    Event,
    Events,
    Subscribers,
    MySubscriptions,
    MyEvents,
}

impl CacheKey {
    pub fn family(&self) -> CacheFamily {
        match self {
            CacheKey::Event(_) => CacheFamily::Event,
            CacheKey::Events(_) => CacheFamily::Events,
            CacheKey::Subscribers(_) => CacheFamily::Subscribers,
            CacheKey::MySubscriptions(_) => CacheFamily::MySubscriptions,
            CacheKey::MyEvents(_) => CacheFamily::MyEvents,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Event(id) => write!(f, "event:{id}"),
            CacheKey::Events(query) => {
                let mut hasher = DefaultHasher::new();
                query.hash(&mut hasher);
                write!(f, "events:{:016x}", hasher.finish())
            }
            CacheKey::Subscribers(id) => write!(f, "subscribers:{id}"),
            CacheKey::MySubscriptions(id) => write!(f, "my-subscriptions:{id}"),
            CacheKey::MyEvents(id) => write!(f, "my-events:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Event(Event),
    Events(Vec<Event>),
    Subscribers(Vec<Subscriber>),
    MySubscriptions(Vec<MySubscription>),
}

impl CachedValue {
    pub fn into_event(self) -> CoordinatorResult<Event> {
        match self {
            CachedValue::Event(event) => Ok(event),
            other => Err(shape_mismatch("event", &other)),
        }
    }

    pub fn into_events(self) -> CoordinatorResult<Vec<Event>> {
        match self {
            CachedValue::Events(events) => Ok(events),
            other => Err(shape_mismatch("event list", &other)),
        }
    }

    pub fn into_subscribers(self) -> CoordinatorResult<Vec<Subscriber>> {
        match self {
            CachedValue::Subscribers(subscribers) => Ok(subscribers),
            other => Err(shape_mismatch("subscriber list", &other)),
        }
    }

    pub fn into_my_subscriptions(self) -> CoordinatorResult<Vec<MySubscription>> {
        match self {
            CachedValue::MySubscriptions(subscriptions) => Ok(subscriptions),
            other => Err(shape_mismatch("subscription list", &other)),
        }
    }
}

fn shape_mismatch(expected: &str, found: &CachedValue) -> CoordinatorError {
    let found = match found {
        CachedValue::Event(_) => "event",
        CachedValue::Events(_) => "event list",
        CachedValue::Subscribers(_) => "subscriber list",
        CachedValue::MySubscriptions(_) => "subscription list",
    };
    CoordinatorError::MalformedResponse(format!(
        "cache entry holds a {found}, expected a {expected}"
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
    pub value: CachedValue,
    pub stale: bool,
}

#[derive(Debug, Default)]
struct Entry {
    value: Option<CachedValue>,
    stale: bool,
    generation: u64,
}

pub struct QueryCache {
    entries: RwLock<HashMap<CacheKey, Entry>>,
    invalidations: broadcast::Sender<CacheKey>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(256);
        Self {
            entries: RwLock::new(HashMap::new()),
            invalidations,
        }
    }

    /// Returns the cached value when fresh, otherwise runs `fetch` (retrying once on
    /// a transport failure) and stores the result unless the key was invalidated or
    /// overwritten while the fetch was running.
    pub async fn fetch<F, Fut>(&self, key: CacheKey, fetch: F) -> CoordinatorResult<CachedValue>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CoordinatorResult<CachedValue>>,
    {
        let generation = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(key.clone()).or_default();
            if let (Some(value), false) = (&entry.value, entry.stale) {
                return Ok(value.clone());
            }
            entry.generation
        };

        let value = match fetch().await {
            Ok(value) => value,
            Err(err) if err.is_retryable() => {
                warn!(key = %key, error = %err, "cache: fetch failed, retrying once");
                fetch().await?
            }
            Err(err) => return Err(err),
        };

        let mut entries = self.entries.write().await;
        match entries.get_mut(&key) {
            Some(entry) if entry.generation == generation => {
                entry.value = Some(value.clone());
                entry.stale = false;
            }
            Some(_) => {
                debug!(key = %key, "cache: entry changed during fetch; keeping newer state");
            }
            None => {
                debug!(key = %key, "cache: entry removed during fetch");
            }
        }
        Ok(value)
    }

    /// Stores a value the store just confirmed (e.g. the event returned by a status change).
    pub async fn put(&self, key: CacheKey, value: CachedValue) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key).or_default();
        entry.value = Some(value);
        entry.stale = false;
        entry.generation += 1;
    }

    pub async fn peek(&self, key: &CacheKey) -> Option<CacheSnapshot> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        entry.value.clone().map(|value| CacheSnapshot {
            value,
            stale: entry.stale,
        })
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        let touched = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(key) {
                Some(entry) => {
                    mark_stale(entry);
                    true
                }
                None => false,
            }
        };
        if touched {
            debug!(key = %key, "cache: invalidated");
            let _ = self.invalidations.send(key.clone());
        }
    }

    /// Invalidates every key of a family, including parameter combinations the
    /// caller cannot enumerate (filtered list pages).
    pub async fn invalidate_family(&self, family: CacheFamily) {
        let touched: Vec<CacheKey> = {
            let mut entries = self.entries.write().await;
            entries
                .iter_mut()
                .filter(|(key, _)| key.family() == family)
                .map(|(key, entry)| {
                    mark_stale(entry);
                    key.clone()
                })
                .collect()
        };
        debug!(?family, count = touched.len(), "cache: invalidated family");
        for key in touched {
            let _ = self.invalidations.send(key);
        }
    }

    pub async fn remove(&self, key: &CacheKey) {
        self.entries.write().await.remove(key);
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<CacheKey> {
        self.invalidations.subscribe()
    }
}

fn mark_stale(entry: &mut Entry) {
    entry.stale = true;
    entry.generation += 1;
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
