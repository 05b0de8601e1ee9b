use crate::message::QueuedMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The durable broker is the only source of truth for pending outbound
/// work. Dequeue confers exclusive ownership of a message until it is
/// either acked (terminal outcome recorded) or enqueued back (redrive
/// without ack). A message that is neither acked nor enqueued is
/// redelivered on the broker's own schedule.
#[async_trait]
pub trait OutboundBroker: Send + Sync {
    /// Non-blocking; yields None when no message is ready
    async fn dequeue(&self) -> anyhow::Result<Option<QueuedMessage>>;

    /// Return a message to the queue without acknowledging it.
    /// The broker decides any redelivery delay.
    async fn enqueue(&self, msg: QueuedMessage) -> anyhow::Result<()>;

    /// The message reached a terminal recorded outcome; drop it
    async fn ack(&self, msg: &QueuedMessage) -> anyhow::Result<()>;
}

/// In-memory broker used as the default backing and by the test suite.
/// Messages that were dequeued but never acked come back after the
/// visibility window elapses.
pub struct MemoryBroker {
    queue: Mutex<VecDeque<QueuedMessage>>,
    in_flight: Mutex<HashMap<Uuid, (QueuedMessage, Instant)>>,
    visibility: Duration,
}

impl MemoryBroker {
    pub fn new(visibility: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            visibility,
        }
    }

    /// Inject a brand new message
    pub fn submit(&self, msg: QueuedMessage) {
        self.queue.lock().push_back(msg);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn redeliver_expired(&self) {
        let now = Instant::now();
        let mut in_flight = self.in_flight.lock();
        let expired: Vec<Uuid> = in_flight
            .iter()
            .filter(|(_, (_, leased_at))| now.duration_since(*leased_at) >= self.visibility)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        for id in expired {
            if let Some((msg, _)) = in_flight.remove(&id) {
                tracing::debug!("redelivering message {id} whose lease expired");
                queue.push_back(msg);
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl OutboundBroker for MemoryBroker {
    async fn dequeue(&self) -> anyhow::Result<Option<QueuedMessage>> {
        self.redeliver_expired();
        let msg = self.queue.lock().pop_front();
        if let Some(msg) = &msg {
            self.in_flight
                .lock()
                .insert(msg.id, (msg.clone(), Instant::now()));
        }
        Ok(msg)
    }

    async fn enqueue(&self, msg: QueuedMessage) -> anyhow::Result<()> {
        self.in_flight.lock().remove(&msg.id);
        self.queue.lock().push_back(msg);
        Ok(())
    }

    async fn ack(&self, msg: &QueuedMessage) -> anyhow::Result<()> {
        self.in_flight.lock().remove(&msg.id);
        Ok(())
    }
}
