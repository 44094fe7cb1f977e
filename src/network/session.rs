//! Exposer side state of one remote session.

use crate::network::channel::Subscriber;
use crate::network::protocol::DataRequest;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Number of priority levels; 0 is served first.
pub const PRIORITY_LEVELS: usize = 3;

/// FIFO per priority level, drained highest priority (lowest number) first.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    levels: [VecDeque<T>; PRIORITY_LEVELS],
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self {
            levels: std::array::from_fn(|_| VecDeque::new()),
        }
    }
}

impl<T> PriorityQueue<T> {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item`; returns `false` (item dropped) for an unknown level.
    pub fn push(&mut self, priority: u8, item: T) -> bool {
        match self.levels.get_mut(usize::from(priority)) {
            Some(level) => {
                level.push_back(item);
                true
            }
            None => false,
        }
    }

    /// Next item by priority, then arrival.
    pub fn pop(&mut self) -> Option<T> {
        self.levels.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Empty the queue in service order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len());
        for level in &mut self.levels {
            items.extend(level.drain(..));
        }
        items
    }

    /// Number of queued items across all levels.
    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    /// True when no level holds an item.
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }
}

/// An active exposer session.
pub struct RemoteSession {
    /// Correlates log lines of one session.
    pub id: Uuid,
    /// Publish address of the consumer.
    pub peer: String,
    /// When the APP handshake was accepted.
    pub created_at: DateTime<Utc>,
    subscriber: Subscriber,
    queue: PriorityQueue<DataRequest>,
    running: bool,
    backlog: bool,
}

impl RemoteSession {
    /// Start a session reading requests from `subscriber`.
    pub fn new(peer: impl Into<String>, subscriber: Subscriber) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            created_at: Utc::now(),
            subscriber,
            queue: PriorityQueue::new(),
            running: true,
            backlog: false,
        }
    }

    /// False once STOP was received.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Mark the session for termination.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// The consumer's publisher went away.
    pub fn peer_closed(&self) -> bool {
        self.subscriber.is_closed()
    }

    /// Move at most `max_batch` waiting data messages into the priority queue.
    ///
    /// Returns the number of queued requests. Whatever is left behind is
    /// reported by [`has_backlog`](Self::has_backlog) and picked up by the
    /// next call.
    pub fn ingest(&mut self, max_batch: usize) -> usize {
        let batch = self.subscriber.drain(max_batch.max(1));
        self.backlog = !batch.exhausted;
        let mut queued = 0;
        for line in batch.messages {
            let request = match DataRequest::parse(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(session = %self.id, "Ignoring data message: {}", e);
                    continue;
                }
            };
            let priority = request.priority;
            if self.queue.push(priority, request) {
                queued += 1;
            } else {
                error!(
                    session = %self.id,
                    "Priority {} out of range 0..{}, dropped '{}'",
                    priority, PRIORITY_LEVELS, line
                );
            }
        }
        if queued > 0 {
            debug!(session = %self.id, "Queued {} remote requests", queued);
        }
        queued
    }

    /// More data messages were waiting when the last batch was cut off.
    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    /// Pending requests in dispatch order.
    pub fn take_pending(&mut self) -> Vec<DataRequest> {
        self.queue.drain()
    }

    /// Queue a request directly, bypassing the subscription.
    pub fn enqueue(&mut self, request: DataRequest) -> bool {
        let priority = request.priority;
        self.queue.push(priority, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::Publisher;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn test_priority_order_then_arrival() {
        let mut queue = PriorityQueue::new();
        assert!(queue.push(2, "a"));
        assert!(queue.push(0, "b"));
        assert!(queue.push(1, "c"));
        assert!(queue.push(0, "d"));
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.drain(), vec!["d", "c", "a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_out_of_range_priority_rejected() {
        let mut queue = PriorityQueue::new();
        assert!(!queue.push(3, "x"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_ingest_orders_and_filters() {
        let publisher = Publisher::bind("127.0.0.1:0").await.unwrap();
        let address = publisher.local_addr().to_string();
        let subscriber = Subscriber::connect(&address, "PSU", Duration::from_secs(2))
            .await
            .unwrap();
        let mut session = RemoteSession::new(&address, subscriber);

        publisher.publish("PSU 2 set VOLT 3");
        publisher.publish("PSU 0 set VOLT 1");
        publisher.publish("OTHER 0 set VOLT 9");
        publisher.publish("PSU 5 set VOLT 7");
        publisher.publish("PSU banana");
        publisher.publish("PSU 1 set VOLT 2");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(session.ingest(10), 3);
        assert!(!session.has_backlog());
        let order: Vec<String> = session
            .take_pending()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            order,
            vec!["PSU 0 set VOLT 1", "PSU 1 set VOLT 2", "PSU 2 set VOLT 3"]
        );
        assert!(logs_contain("Priority 5 out of range"));
        assert!(logs_contain("Ignoring data message"));
    }

    #[tokio::test]
    async fn test_ingest_is_bounded_by_batch_size() {
        let publisher = Publisher::bind("127.0.0.1:0").await.unwrap();
        let address = publisher.local_addr().to_string();
        let subscriber = Subscriber::connect(&address, "PSU", Duration::from_secs(2))
            .await
            .unwrap();
        let mut session = RemoteSession::new(&address, subscriber);

        for i in 0..50 {
            publisher.publish(format!("PSU 1 set VOLT {}", i));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(session.ingest(1), 1);
        assert!(session.has_backlog());
        assert_eq!(session.take_pending().len(), 1);

        let mut total = 1;
        while session.has_backlog() {
            let queued = session.ingest(20);
            assert!(queued <= 20);
            total += queued;
            session.take_pending();
        }
        assert_eq!(total, 50);
    }
}
