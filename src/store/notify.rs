//! Change notifications for observers of a destination.

#![allow(missing_docs)]

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::store::sqlite::Destination;

const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Replaced,
    Cleared,
}

/// A committed write to `destination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub destination: Destination,
    pub kind: ChangeKind,
    pub rows: usize,
}

/// Fan-out of [`ChangeEvent`]s to per-destination subscribers.
///
/// Slow subscribers miss events rather than stall the writer; disconnected
/// ones are pruned on the next notification.
#[derive(Default)]
pub struct ChangeNotifier {
    subscribers: Mutex<Vec<(Destination, Sender<ChangeEvent>)>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, destination: Destination) -> Receiver<ChangeEvent> {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().push((destination, tx));
        rx
    }

    pub fn notify(&self, event: ChangeEvent) {
        self.subscribers.lock().retain(|(destination, tx)| {
            if *destination != event.destination {
                return true;
            }
            !matches!(tx.try_send(event), Err(TrySendError::Disconnected(_)))
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(destination: Destination, rows: usize) -> ChangeEvent {
        ChangeEvent {
            destination,
            kind: ChangeKind::Inserted,
            rows,
        }
    }

    #[test]
    fn only_matching_destination_is_notified() {
        let notifier = ChangeNotifier::new();
        let live = notifier.subscribe(Destination::Live);
        let search = notifier.subscribe(Destination::Search);

        notifier.notify(event(Destination::Search, 3));

        assert!(live.try_recv().is_err());
        assert_eq!(search.try_recv().unwrap().rows, 3);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let notifier = ChangeNotifier::new();
        let kept = notifier.subscribe(Destination::Live);
        drop(notifier.subscribe(Destination::Live));
        assert_eq!(notifier.subscriber_count(), 2);

        notifier.notify(event(Destination::Live, 1));
        assert_eq!(notifier.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap().rows, 1);
    }

    #[test]
    fn full_subscriber_is_kept_but_skipped() {
        let notifier = ChangeNotifier::new();
        let rx = notifier.subscribe(Destination::Live);
        for i in 0..SUBSCRIBER_CAPACITY + 5 {
            notifier.notify(event(Destination::Live, i));
        }
        assert_eq!(notifier.subscriber_count(), 1);
        assert_eq!(rx.len(), SUBSCRIBER_CAPACITY);
        assert_eq!(rx.try_recv().unwrap().rows, 0);
    }
}
