//! Per-event action bookkeeping.
//!
//! Every mutation takes a ticket for its event. While a ticket is outstanding a
//! second mutation on the same event is refused; dropping the ticket (the call
//! finished or was abandoned) frees the slot. Action ids are monotonic per event,
//! so a response can always tell whether a newer action started after it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use shared::domain::EventId;
use tracing::debug;

use crate::error::{CoordinatorError, CoordinatorResult};

#[derive(Debug, Default)]
struct Slot {
    latest: u64,
    in_flight: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionTracker {
    slots: Arc<Mutex<HashMap<EventId, Slot>>>,
}

impl ActionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, event_id: &EventId) -> CoordinatorResult<ActionTicket> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(event_id.clone()).or_default();
        if let Some(action_id) = slot.in_flight {
            debug!(%event_id, action_id, "inflight: refusing concurrent mutation");
            return Err(CoordinatorError::MutationInFlight(event_id.clone()));
        }
        slot.latest += 1;
        slot.in_flight = Some(slot.latest);
        Ok(ActionTicket {
            event_id: event_id.clone(),
            action_id: slot.latest,
            tracker: self.clone(),
        })
    }

    pub fn is_in_flight(&self, event_id: &EventId) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_id)
            .is_some_and(|slot| slot.in_flight.is_some())
    }

    /// True when no action on `event_id` started after `action_id`.
    pub fn is_current(&self, event_id: &EventId, action_id: u64) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_id)
            .is_some_and(|slot| slot.latest == action_id)
    }

    fn release(&self, event_id: &EventId, action_id: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(event_id) {
            if slot.in_flight == Some(action_id) {
                slot.in_flight = None;
            }
        }
    }
}

/// Held for the lifetime of one mutation. Dropping it frees the event's slot.
#[derive(Debug)]
pub struct ActionTicket {
    event_id: EventId,
    action_id: u64,
    tracker: ActionTracker,
}

impl ActionTicket {
    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn action_id(&self) -> u64 {
        self.action_id
    }

    pub fn is_current(&self) -> bool {
        self.tracker.is_current(&self.event_id, self.action_id)
    }
}

impl Drop for ActionTicket {
    fn drop(&mut self) {
        self.tracker.release(&self.event_id, self.action_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_mutation_on_same_event_is_refused() {
        let tracker = ActionTracker::new();
        let event = EventId::new("e1");

        let ticket = tracker.begin(&event).expect("first");
        assert!(tracker.is_in_flight(&event));
        assert_eq!(
            tracker.begin(&event).expect_err("busy"),
            CoordinatorError::MutationInFlight(event.clone())
        );

        let other = tracker.begin(&EventId::new("e2")).expect("independent event");
        assert!(other.is_current());

        drop(ticket);
        assert!(!tracker.is_in_flight(&event));
        tracker.begin(&event).expect("slot released");
    }

    #[test]
    fn a_newer_action_supersedes_an_abandoned_one() {
        let tracker = ActionTracker::new();
        let event = EventId::new("e1");

        let first = tracker.begin(&event).expect("first");
        let first_id = first.action_id();
        drop(first);

        let second = tracker.begin(&event).expect("second");
        assert!(second.action_id() > first_id);
        assert!(!tracker.is_current(&event, first_id));
        assert!(second.is_current());
    }

    #[test]
    fn releasing_an_old_ticket_does_not_free_a_newer_slot() {
        let tracker = ActionTracker::new();
        let event = EventId::new("e1");

        let first = tracker.begin(&event).expect("first");
        let first_id = first.action_id();
        drop(first);
        let _second = tracker.begin(&event).expect("second");

        tracker.release(&event, first_id);
        assert!(tracker.is_in_flight(&event));
    }
}
