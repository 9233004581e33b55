//! Event status graph and the permission/eligibility rules derived from it.
//!
//! Everything here is a pure function of an [`Event`] (and, for subscribing, the
//! current subscriber count); the client mirrors server policy and the server
//! remains authoritative.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{domain::EventStatus, protocol::Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot move event from {from} to {to}")]
pub struct TransitionError {
    pub from: EventStatus,
    pub to: EventStatus,
}

impl EventStatus {
    pub fn allowed_targets(self) -> &'static [EventStatus] {
        match self {
            EventStatus::Draft => &[EventStatus::Published],
            EventStatus::Published => &[
                EventStatus::InProgress,
                EventStatus::Draft,
                EventStatus::Cancelled,
            ],
            EventStatus::InProgress => &[EventStatus::Finished, EventStatus::Cancelled],
            EventStatus::Finished | EventStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, target: EventStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn transition(self, target: EventStatus) -> Result<EventStatus, TransitionError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(TransitionError {
                from: self,
                to: target,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }

    pub fn can_edit(self) -> bool {
        matches!(
            self,
            EventStatus::Draft | EventStatus::Published | EventStatus::InProgress
        )
    }

    /// Deletion is irreversible and only allowed before publication.
    pub fn can_delete(self) -> bool {
        self == EventStatus::Draft
    }

    pub fn can_manage_subscriptions(self) -> bool {
        matches!(self, EventStatus::Published | EventStatus::InProgress)
    }

    pub fn can_remove_participants(self) -> bool {
        matches!(self, EventStatus::Published | EventStatus::InProgress)
    }
}

/// Why a participant cannot subscribe right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligibility {
    SubscriptionsClosed,
    CapacityReached,
    WrongStatus(EventStatus),
}

impl Ineligibility {
    pub fn describe(self) -> String {
        match self {
            Ineligibility::SubscriptionsClosed => "subscriptions are closed".to_string(),
            Ineligibility::CapacityReached => "event is full".to_string(),
            Ineligibility::WrongStatus(status) => {
                format!("event is {status} and does not take subscriptions")
            }
        }
    }
}

/// `capacity == 0` means unlimited.
pub fn capacity_reached(event: &Event, subscriber_count: u32) -> bool {
    event.capacity > 0 && subscriber_count >= event.capacity
}

pub fn subscribe_blocker(event: &Event, subscriber_count: u32) -> Option<Ineligibility> {
    if !event.status.can_manage_subscriptions() {
        return Some(Ineligibility::WrongStatus(event.status));
    }
    if !event.subscriptions_open {
        return Some(Ineligibility::SubscriptionsClosed);
    }
    if capacity_reached(event, subscriber_count) {
        return Some(Ineligibility::CapacityReached);
    }
    None
}

pub fn can_subscribe(event: &Event, subscriber_count: u32) -> bool {
    subscribe_blocker(event, subscriber_count).is_none()
}

/// Follows the open flag: a participant loses self-cancel once subscriptions close.
pub fn can_unsubscribe(event: &Event) -> bool {
    event.subscriptions_open && event.status.can_manage_subscriptions()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsubscribePolicy {
    /// Exactly [`can_unsubscribe`].
    FollowOpenFlag,
    /// Existing subscribers may cancel while the event is published or in progress,
    /// whatever the open flag says.
    #[default]
    Grandfathered,
}

impl UnsubscribePolicy {
    pub fn allows(self, event: &Event) -> bool {
        match self {
            UnsubscribePolicy::FollowOpenFlag => can_unsubscribe(event),
            UnsubscribePolicy::Grandfathered => event.status.can_manage_subscriptions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::{EventCategory, EventId, UserId};

    const LISTED_EDGES: [(EventStatus, EventStatus); 6] = [
        (EventStatus::Draft, EventStatus::Published),
        (EventStatus::Published, EventStatus::InProgress),
        (EventStatus::Published, EventStatus::Draft),
        (EventStatus::Published, EventStatus::Cancelled),
        (EventStatus::InProgress, EventStatus::Finished),
        (EventStatus::InProgress, EventStatus::Cancelled),
    ];

    fn event(status: EventStatus, capacity: u32, open: bool) -> Event {
        Event {
            id: EventId::new("evt-1"),
            title: "Rust meetup".into(),
            description: "Monthly gathering".into(),
            category: EventCategory::Workshop,
            banner: None,
            date: Utc::now(),
            end_date: None,
            location: "Hall A".into(),
            workload: 2,
            capacity,
            status,
            subscriptions_open: open,
            organizer_id: UserId::new("org-1"),
            subscriber_count: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn only_listed_edges_are_valid() {
        for from in EventStatus::ALL {
            for to in EventStatus::ALL {
                let listed = LISTED_EDGES.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), listed, "{from} -> {to}");
                match from.transition(to) {
                    Ok(next) => assert_eq!(next, to),
                    Err(err) => {
                        assert!(!listed);
                        assert_eq!(err, TransitionError { from, to });
                    }
                }
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exit() {
        for status in [EventStatus::Finished, EventStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(EventStatus::ALL
                .iter()
                .all(|target| status.transition(*target).is_err()));
        }
        assert!(!EventStatus::Draft.is_terminal());
    }

    #[test]
    fn permission_predicates_follow_status() {
        use EventStatus::*;
        assert!(Draft.can_edit() && Published.can_edit() && InProgress.can_edit());
        assert!(!Finished.can_edit() && !Cancelled.can_edit());

        assert!(Draft.can_delete());
        assert!(EventStatus::ALL
            .iter()
            .filter(|s| **s != Draft)
            .all(|s| !s.can_delete()));

        for status in EventStatus::ALL {
            let live = matches!(status, Published | InProgress);
            assert_eq!(status.can_manage_subscriptions(), live);
            assert_eq!(status.can_remove_participants(), live);
        }
    }

    #[test]
    fn full_event_blocks_subscriptions_even_when_open() {
        for open in [true, false] {
            let event = event(EventStatus::Published, 3, open);
            assert!(!can_subscribe(&event, 3));
            assert!(!can_subscribe(&event, 4));
        }
        let open = event(EventStatus::Published, 3, true);
        assert!(can_subscribe(&open, 2));
        assert_eq!(
            subscribe_blocker(&open, 3),
            Some(Ineligibility::CapacityReached)
        );
    }

    #[test]
    fn closed_subscriptions_block_every_status() {
        for status in EventStatus::ALL {
            assert!(!can_subscribe(&event(status, 10, false), 0));
        }
    }

    #[test]
    fn zero_capacity_is_unlimited() {
        let event = event(EventStatus::InProgress, 0, true);
        assert!(can_subscribe(&event, 10_000));
    }

    #[test]
    fn wrong_status_is_reported_before_closed_flag() {
        let cancelled = event(EventStatus::Cancelled, 10, true);
        assert_eq!(
            subscribe_blocker(&cancelled, 0),
            Some(Ineligibility::WrongStatus(EventStatus::Cancelled))
        );
        assert!(!can_unsubscribe(&cancelled));
    }

    #[test]
    fn unsubscribe_policies_differ_only_when_closed() {
        let closed = event(EventStatus::Published, 10, false);
        assert!(!can_unsubscribe(&closed));
        assert!(!UnsubscribePolicy::FollowOpenFlag.allows(&closed));
        assert!(UnsubscribePolicy::Grandfathered.allows(&closed));

        let open = event(EventStatus::InProgress, 10, true);
        assert!(UnsubscribePolicy::FollowOpenFlag.allows(&open));
        assert!(UnsubscribePolicy::Grandfathered.allows(&open));

        let finished = event(EventStatus::Finished, 10, true);
        assert!(!UnsubscribePolicy::Grandfathered.allows(&finished));
    }
}
