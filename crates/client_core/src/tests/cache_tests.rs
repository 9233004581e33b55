use super::*;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use chrono::Utc;
use shared::domain::{EventCategory, EventStatus};
use tokio::sync::Notify;

fn sample_event(id: &str, title: &str) -> Event {
    Event {
        id: EventId::new(id),
        title: title.to_string(),
        description: "Hands-on session".into(),
        category: EventCategory::Oficina,
        banner: None,
        date: Utc::now(),
        end_date: None,
        location: "Lab 2".into(),
        workload: 4,
        capacity: 20,
        status: EventStatus::Published,
        subscriptions_open: true,
        organizer_id: UserId::new("org-1"),
        subscriber_count: None,
        created_at: None,
        updated_at: None,
    }
}

fn events_key(name: Option<&str>) -> CacheKey {
    CacheKey::Events(EventQuery {
        name: name.map(str::to_string),
        category: None,
    })
}

#[tokio::test]
async fn fresh_entries_are_served_without_fetching() {
    let cache = QueryCache::new();
    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let key = CacheKey::Event(EventId::new("e1"));

    for _ in 0..3 {
        let value = cache
            .fetch(key.clone(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(CachedValue::Event(sample_event("e1", "first")))
            })
            .await
            .expect("fetch");
        assert_eq!(value.into_event().expect("event").title, "first");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalidated_entry_reads_stale_then_fresh() {
    let cache = QueryCache::new();
    let key = CacheKey::Event(EventId::new("e1"));
    cache
        .put(key.clone(), CachedValue::Event(sample_event("e1", "old")))
        .await;

    cache.invalidate(&key).await;
    let snapshot = cache.peek(&key).await.expect("snapshot");
    assert!(snapshot.stale);
    assert_eq!(snapshot.value.into_event().expect("event").title, "old");

    let refreshed = cache
        .fetch(key.clone(), || async {
            Ok(CachedValue::Event(sample_event("e1", "new")))
        })
        .await
        .expect("refetch");
    assert_eq!(refreshed.into_event().expect("event").title, "new");

    let snapshot = cache.peek(&key).await.expect("snapshot");
    assert!(!snapshot.stale);
}

#[tokio::test]
async fn family_invalidation_reaches_every_filter_combination() {
    let cache = QueryCache::new();
    let detail = CacheKey::Event(EventId::new("e1"));
    for key in [events_key(None), events_key(Some("rust")), events_key(Some("go"))] {
        cache.put(key, CachedValue::Events(Vec::new())).await;
    }
    cache
        .put(detail.clone(), CachedValue::Event(sample_event("e1", "x")))
        .await;
    let mut invalidations = cache.subscribe_invalidations();

    cache.invalidate_family(CacheFamily::Events).await;

    for key in [events_key(None), events_key(Some("rust")), events_key(Some("go"))] {
        assert!(cache.peek(&key).await.expect("entry").stale, "{key}");
    }
    assert!(!cache.peek(&detail).await.expect("entry").stale);

    let mut seen = Vec::new();
    while let Ok(key) = invalidations.try_recv() {
        seen.push(key);
    }
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|key| key.family() == CacheFamily::Events));
}

#[tokio::test]
async fn repeated_invalidation_causes_a_single_refetch() {
    let cache = QueryCache::new();
    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let key = CacheKey::Subscribers(EventId::new("e1"));
    cache.put(key.clone(), CachedValue::Subscribers(Vec::new())).await;

    cache.invalidate(&key).await;
    cache.invalidate(&key).await;

    for _ in 0..2 {
        cache
            .fetch(key.clone(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(CachedValue::Subscribers(Vec::new()))
            })
            .await
            .expect("fetch");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fetch_racing_an_invalidation_leaves_entry_stale() {
    let cache = Arc::new(QueryCache::new());
    let key = CacheKey::Event(EventId::new("e1"));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let task = {
        let cache = Arc::clone(&cache);
        let key = key.clone();
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        tokio::spawn(async move {
            cache
                .fetch(key, || {
                    let started = Arc::clone(&started);
                    let release = Arc::clone(&release);
                    async move {
                        started.notify_one();
                        release.notified().await;
                        Ok(CachedValue::Event(sample_event("e1", "pre-mutation")))
                    }
                })
                .await
        })
    };

    started.notified().await;
    cache.invalidate(&key).await;
    release.notify_one();

    let returned = task.await.expect("join").expect("fetch");
    assert_eq!(returned.into_event().expect("event").title, "pre-mutation");
    assert!(cache.peek(&key).await.is_none());

    let calls = AtomicUsize::new(0);
    let counter = &calls;
    cache
        .fetch(key.clone(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(CachedValue::Event(sample_event("e1", "post-mutation")))
        })
        .await
        .expect("refetch");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reads_retry_transport_failures_once() {
    let cache = QueryCache::new();
    let calls = AtomicUsize::new(0);
    let counter = &calls;

    let value = cache
        .fetch(events_key(None), move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CoordinatorError::unavailable("reset by peer"))
            } else {
                Ok(CachedValue::Events(vec![sample_event("e1", "x")]))
            }
        })
        .await
        .expect("second attempt succeeds");
    assert_eq!(value.into_events().expect("events").len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let err = cache
        .fetch(CacheKey::Event(EventId::new("missing")), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CoordinatorError::NotFound("event missing".into()))
        })
        .await
        .expect_err("not found");
    assert_eq!(err, CoordinatorError::NotFound("event missing".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn keys_render_as_resource_identities() {
    assert_eq!(CacheKey::Event(EventId::new("42")).to_string(), "event:42");
    assert_eq!(
        CacheKey::MySubscriptions(UserId::new("u1")).to_string(),
        "my-subscriptions:u1"
    );
    assert_eq!(CacheKey::MyEvents(UserId::new("o1")).to_string(), "my-events:o1");
    let rendered = events_key(Some("rust")).to_string();
    assert!(rendered.starts_with("events:"));
    assert_eq!(rendered, events_key(Some("rust")).to_string());
    assert_ne!(rendered, events_key(Some("go")).to_string());
}

#[test]
fn typed_accessors_reject_wrong_shapes() {
    let err = CachedValue::Events(Vec::new())
        .into_event()
        .expect_err("shape");
    assert!(matches!(err, CoordinatorError::MalformedResponse(_)));
}
