use async_trait::async_trait;
use parking_lot::Mutex;
use relay_log_types::Event;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Some stores report "nothing matched" as an error rather than an
    /// empty result; callers treat this exactly like an empty fetch.
    #[error("no events are awaiting forwarding")]
    Empty,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The durable event store. The delivery core only ever flips the
/// `forwarded` bit and appends new events; everything else about the
/// store's layout belongs to its owner.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Up to `limit` events whose `forwarded` flag is still false
    async fn events_to_forward(&self, limit: usize) -> Result<Vec<Event>, StoreError>;

    /// Persist the event, inserting or replacing by id.
    /// Returns only once the write is durable.
    async fn save(&self, event: Event) -> Result<(), StoreError>;
}

/// In-memory store used as the default backing and by the test suite
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn events_to_forward(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|event| !event.forwarded)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save(&self, event: Event) -> Result<(), StoreError> {
        let mut events = self.events.lock();
        match events.iter_mut().find(|existing| existing.id == event.id) {
            Some(existing) => *existing = event,
            None => events.push(event),
        }
        Ok(())
    }
}
