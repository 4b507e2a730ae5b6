//! Subscription registry with per-subscription redelivery deduplication

use crate::protocol::{topic_matches, Frame};
use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Message ids remembered per subscription
pub const DEDUPE_WINDOW: usize = 1024;

/// Remembers the most recent message ids, evicting the oldest
#[derive(Debug)]
pub struct DedupeWindow {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl DedupeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an id; returns false if it was already in the window
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Debug)]
struct Subscription {
    filter: String,
    sender: mpsc::Sender<Frame>,
    window: DedupeWindow,
}

/// Active subscriptions keyed by topic filter
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: Vec<Subscription>,
}

/// Result of routing one frame
#[derive(Debug, Default)]
pub struct RoutedFrame {
    pub targets: Vec<mpsc::Sender<Frame>>,
    pub duplicates: usize,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber, replacing any previous one on the same filter
    pub fn register(&mut self, filter: &str, sender: mpsc::Sender<Frame>) {
        self.subscriptions.retain(|s| s.filter != filter);
        self.subscriptions.push(Subscription {
            filter: filter.to_string(),
            sender,
            window: DedupeWindow::new(DEDUPE_WINDOW),
        });
    }

    pub fn filters(&self) -> Vec<String> {
        self.subscriptions.iter().map(|s| s.filter.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Find the subscribers a frame should be delivered to
    ///
    /// Frames whose message id a subscription has already seen are skipped for
    /// that subscription. Subscribers that went away are pruned.
    pub fn route(&mut self, frame: &Frame) -> RoutedFrame {
        self.subscriptions.retain(|s| !s.sender.is_closed());

        let message_id = frame.message_id();
        let mut routed = RoutedFrame::default();
        for subscription in &mut self.subscriptions {
            if !topic_matches(&subscription.filter, &frame.topic) {
                continue;
            }
            if let Some(id) = message_id {
                if !subscription.window.insert(id) {
                    debug!(
                        topic = %frame.topic,
                        message_id = %id,
                        "Dropping redelivered message"
                    );
                    routed.duplicates += 1;
                    continue;
                }
            }
            routed.targets.push(subscription.sender.clone());
        }
        routed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MESSAGE_ID_HEADER;
    use bytes::Bytes;

    fn frame(topic: &str, id: Option<Uuid>) -> Frame {
        Frame {
            topic: topic.to_string(),
            body: Bytes::from_static(b"{}"),
            content_type: None,
            correlation_id: None,
            headers: id
                .map(|id| vec![(MESSAGE_ID_HEADER.to_string(), id.to_string())])
                .unwrap_or_default(),
        }
    }

    #[test]
    fn test_dedupe_window_evicts_oldest() {
        let mut window = DedupeWindow::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(window.insert(a));
        assert!(!window.insert(a));
        assert!(window.insert(b));
        assert!(window.insert(c));
        // `a` fell out of the window
        assert!(window.insert(a));
    }

    #[tokio::test]
    async fn test_route_matches_and_dedupes() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register("fog/commands/+", tx);

        let id = Uuid::new_v4();
        assert_eq!(registry.route(&frame("fog/commands/send", Some(id))).targets.len(), 1);

        let again = registry.route(&frame("fog/commands/send", Some(id)));
        assert!(again.targets.is_empty());
        assert_eq!(again.duplicates, 1);

        assert!(registry.route(&frame("fog/other", None)).targets.is_empty());
        // Frames without an id are never treated as duplicates
        assert_eq!(registry.route(&frame("fog/commands/x", None)).targets.len(), 1);
        assert_eq!(registry.route(&frame("fog/commands/x", None)).targets.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_subscribers_pruned() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        registry.register("a", tx);
        drop(rx);

        assert!(registry.route(&frame("a", None)).targets.is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_register_replaces_same_filter() {
        let mut registry = SubscriptionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        registry.register("a/b", tx1);
        registry.register("a/b", tx2);
        assert_eq!(registry.filters(), vec!["a/b".to_string()]);
    }
}
