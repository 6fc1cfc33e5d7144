use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::Mutex;

use crate::domain::QueueEvent;
use crate::sync_ext::MutexExt;

/// Per-subscriber delivery buffer. A consumer that falls more than this many
/// events behind starts losing events (for itself only) and is expected to
/// re-request the full job list.
pub const SUBSCRIBER_BUFFER: usize = 100;

pub type SubscriberId = u64;

/// A registered event consumer: the receiving end of a bounded channel.
/// Dropping the receiver is fine; the subscriber is pruned on the next
/// broadcast. Call `Queue::unsubscribe` to prune eagerly.
pub struct EventSubscription {
    pub id: SubscriberId,
    pub events: Receiver<QueueEvent>,
}

struct SubscriberEntry {
    id: SubscriberId,
    tx: SyncSender<QueueEvent>,
}

/// Fan-out state. Events are appended to a FIFO outbox inside the queue's
/// critical section (which pins per-job transition order) and delivered by
/// whichever thread wins the drainer flag, so sends never happen under the
/// queue lock and slow consumers never stall producers.
pub(crate) struct SubscriberSet {
    entries: Mutex<Vec<SubscriberEntry>>,
    outbox: Mutex<VecDeque<QueueEvent>>,
    draining: AtomicBool,
    next_id: AtomicU64,
}

impl SubscriberSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            outbox: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = sync_channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock_unpoisoned()
            .push(SubscriberEntry { id, tx });
        EventSubscription { id, events: rx }
    }

    pub(crate) fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut entries = self.entries.lock_unpoisoned();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.entries.lock_unpoisoned().len()
    }

    /// Append an event to the outbox. Callers invoke this while holding the
    /// queue lock so that event order matches state-transition order.
    pub(crate) fn enqueue(&self, event: QueueEvent) {
        self.outbox.lock_unpoisoned().push_back(event);
    }

    /// Deliver everything currently in the outbox. Exactly one thread drains
    /// at a time; racers hand off to the current drainer and return.
    pub(crate) fn drain(&self) {
        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                return;
            }

            loop {
                let next = self.outbox.lock_unpoisoned().pop_front();
                let Some(event) = next else { break };
                self.deliver(&event);
            }

            self.draining.store(false, Ordering::Release);

            // An enqueue may have slipped in between the last pop and the
            // flag release; re-check so no event is stranded.
            let has_pending = !self.outbox.lock_unpoisoned().is_empty();
            if !has_pending {
                return;
            }
        }
    }

    fn deliver(&self, event: &QueueEvent) {
        let mut entries = self.entries.lock_unpoisoned();
        entries.retain(|entry| match entry.tx.try_send(event.clone()) {
            Ok(()) => true,
            // Buffer full: drop this event for this subscriber only.
            Err(TrySendError::Full(_)) => {
                tracing::debug!(subscriber = entry.id, "subscriber buffer full, dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;

    fn marker(kind: EventKind) -> QueueEvent {
        QueueEvent::marker(kind)
    }

    #[test]
    fn events_are_delivered_in_enqueue_order() {
        let set = SubscriberSet::new();
        let sub = set.subscribe();
        set.enqueue(marker(EventKind::Added));
        set.enqueue(marker(EventKind::Started));
        set.enqueue(marker(EventKind::Complete));
        set.drain();

        let kinds: Vec<EventKind> = sub.events.try_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Added, EventKind::Started, EventKind::Complete]
        );
    }

    #[test]
    fn full_subscriber_loses_events_without_affecting_others() {
        let set = SubscriberSet::new();
        let slow = set.subscribe();
        let fast = set.subscribe();

        for _ in 0..SUBSCRIBER_BUFFER {
            set.enqueue(marker(EventKind::Progress));
        }
        set.drain();

        // The fast consumer keeps up; the slow one sits on a full buffer.
        assert_eq!(fast.events.try_iter().count(), SUBSCRIBER_BUFFER);

        for _ in 0..25 {
            set.enqueue(marker(EventKind::Progress));
        }
        set.drain();

        // Overflow is dropped for the slow subscriber only.
        assert_eq!(slow.events.try_iter().count(), SUBSCRIBER_BUFFER);
        assert_eq!(fast.events.try_iter().count(), 25);
    }

    #[test]
    fn disconnected_subscribers_are_pruned_on_broadcast() {
        let set = SubscriberSet::new();
        let sub = set.subscribe();
        drop(sub.events);

        set.enqueue(marker(EventKind::Added));
        set.drain();
        assert_eq!(set.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_removes_and_closes_the_channel() {
        let set = SubscriberSet::new();
        let sub = set.subscribe();
        assert!(set.unsubscribe(sub.id));
        assert!(!set.unsubscribe(sub.id));
        set.enqueue(marker(EventKind::Added));
        set.drain();
        assert!(sub.events.try_recv().is_err(), "channel must be closed");
    }
}
