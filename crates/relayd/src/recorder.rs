use crate::events::EventStore;
use crate::message::QueuedMessage;
use crate::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_log_types::{Event, EventKind};
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

pub const TIMED_OUT_IN_QUEUE: &str = "Timed out in queue.";
pub const DOMAIN_NOT_FOUND: &str = "550 Domain Not Found.";
pub const FAILED_TO_CONNECT: &str = "Failed to connect";
pub const ENDED_ABRUPTLY: &str = "Connection was established but ended abruptly.";
pub const THROTTLED: &str = "Throttled by send policy.";
pub const SERVICE_UNAVAILABLE: &str = "Service unavailable.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Delivered,
    Deferred,
    Failed,
    TimedOut,
}

/// One durable state transition on a message
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: DeliveryStatus,
    pub reason: Option<String>,
    pub source_ip: Option<IpAddr>,
    pub mx_host: Option<String>,
    /// Dispatch attempts made against the message so far, including
    /// the one this outcome concludes
    pub attempt: u16,
    pub timestamp: DateTime<Utc>,
}

/// Persists message state transitions. Owned by an external
/// collaborator; `apply` returns only once the write is durable.
#[async_trait]
pub trait MessageStatusStore: Send + Sync {
    async fn apply(&self, message_id: Uuid, update: StatusUpdate) -> anyhow::Result<()>;
}

/// In-memory store used as the default backing and by the test suite
#[derive(Default)]
pub struct MemoryStatusStore {
    updates: DashMap<Uuid, Vec<StatusUpdate>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates_for(&self, message_id: Uuid) -> Vec<StatusUpdate> {
        self.updates
            .get(&message_id)
            .map(|u| u.clone())
            .unwrap_or_default()
    }

    pub fn total_updates(&self) -> usize {
        self.updates.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl MessageStatusStore for MemoryStatusStore {
    async fn apply(&self, message_id: Uuid, update: StatusUpdate) -> anyhow::Result<()> {
        self.updates.entry(message_id).or_default().push(update);
        Ok(())
    }
}

/// Converts peer responses and local errors into durable state
/// transitions plus, for terminal outcomes, a delivery event. The
/// dispatcher makes exactly one of these calls per dispatch attempt,
/// and every call persists exactly one transition, so repeated
/// attempts against the same message each leave their own record.
pub struct DispositionRecorder {
    status: Arc<dyn MessageStatusStore>,
    events: Arc<dyn EventStore>,
}

impl DispositionRecorder {
    pub fn new(status: Arc<dyn MessageStatusStore>, events: Arc<dyn EventStore>) -> Self {
        Self { status, events }
    }

    fn update(
        &self,
        msg: &QueuedMessage,
        status: DeliveryStatus,
        reason: Option<&str>,
        source_ip: Option<IpAddr>,
        mx_host: Option<&str>,
    ) -> StatusUpdate {
        StatusUpdate {
            status,
            reason: reason.map(|r| r.to_string()),
            source_ip,
            mx_host: mx_host.map(|h| h.to_string()),
            attempt: msg.num_attempts,
            timestamp: Utc::now(),
        }
    }

    fn event(
        &self,
        kind: EventKind,
        msg: &QueuedMessage,
        reason: Option<&str>,
        source_ip: Option<IpAddr>,
        mx_host: Option<&str>,
    ) -> Event {
        let mut event = Event::new(kind, &msg.recipient);
        event.message_id = Some(msg.id);
        event.source_ip = source_ip.map(|ip| ip.to_string());
        event.mx_host = mx_host.map(|h| h.to_string());
        event.reason = reason.map(|r| r.to_string());
        event
    }

    pub async fn record_success(
        &self,
        msg: &QueuedMessage,
        source_ip: IpAddr,
        mx_host: &str,
    ) -> anyhow::Result<()> {
        tracing::debug!("{} delivered via {source_ip} to {mx_host}", msg.id);
        self.status
            .apply(
                msg.id,
                self.update(
                    msg,
                    DeliveryStatus::Delivered,
                    None,
                    Some(source_ip),
                    Some(mx_host),
                ),
            )
            .await?;
        metrics::MSGS_DELIVERED.inc();
        Ok(())
    }

    /// A permanent failure. Emits a Bounce event carrying the verbatim
    /// reason, or a TimedOutInQueue event when the reason is the
    /// queue-timeout sentinel.
    pub async fn record_failure(
        &self,
        msg: &QueuedMessage,
        reason: &str,
        source_ip: Option<IpAddr>,
        mx_host: Option<&str>,
    ) -> anyhow::Result<()> {
        let timed_out = reason == TIMED_OUT_IN_QUEUE;
        tracing::debug!("{} permanently failed: {reason}", msg.id);
        self.status
            .apply(
                msg.id,
                self.update(
                    msg,
                    if timed_out {
                        DeliveryStatus::TimedOut
                    } else {
                        DeliveryStatus::Failed
                    },
                    Some(reason),
                    source_ip,
                    mx_host,
                ),
            )
            .await?;
        let kind = if timed_out {
            EventKind::TimedOutInQueue
        } else {
            EventKind::Bounce
        };
        self.events
            .save(self.event(kind, msg, Some(reason), source_ip, mx_host))
            .await?;
        if timed_out {
            metrics::MSGS_TIMED_OUT.inc();
        } else {
            metrics::MSGS_FAILED.inc();
        }
        Ok(())
    }

    /// A transient failure; the broker will redeliver on its own
    /// schedule. `inform_service_unavailable` marks deferrals caused by
    /// a mid-transaction 421, whose registry entry the dispatcher has
    /// already written.
    pub async fn record_deferral(
        &self,
        msg: &QueuedMessage,
        reason: &str,
        source_ip: Option<IpAddr>,
        mx_host: Option<&str>,
        inform_service_unavailable: bool,
    ) -> anyhow::Result<()> {
        tracing::debug!(
            "{} deferred{}: {reason}",
            msg.id,
            if inform_service_unavailable {
                " (peer asked us to back off)"
            } else {
                ""
            }
        );
        self.status
            .apply(
                msg.id,
                self.update(msg, DeliveryStatus::Deferred, Some(reason), source_ip, mx_host),
            )
            .await?;
        metrics::MSGS_DEFERRED.inc();
        Ok(())
    }

    /// A deferral attributed to our own rate-limit policy
    pub async fn record_throttle(
        &self,
        msg: &QueuedMessage,
        source_ip: IpAddr,
        mx_host: &str,
    ) -> anyhow::Result<()> {
        tracing::debug!("{} throttled toward {mx_host}", msg.id);
        self.status
            .apply(
                msg.id,
                self.update(
                    msg,
                    DeliveryStatus::Deferred,
                    Some(THROTTLED),
                    Some(source_ip),
                    Some(mx_host),
                ),
            )
            .await?;
        metrics::MSGS_DEFERRED.inc();
        Ok(())
    }

    /// A deferral caused by a 421 cool-off that the pool's registry
    /// already knows about
    pub async fn record_service_unavailable(
        &self,
        msg: &QueuedMessage,
        source_ip: IpAddr,
    ) -> anyhow::Result<()> {
        tracing::debug!("{} deferred; {source_ip} is in a 421 cool-off", msg.id);
        self.status
            .apply(
                msg.id,
                self.update(
                    msg,
                    DeliveryStatus::Deferred,
                    Some(SERVICE_UNAVAILABLE),
                    Some(source_ip),
                    None,
                ),
            )
            .await?;
        metrics::MSGS_DEFERRED.inc();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events::MemoryEventStore;

    struct Fixture {
        status: Arc<MemoryStatusStore>,
        events: Arc<MemoryEventStore>,
        recorder: DispositionRecorder,
    }

    fn fixture() -> Fixture {
        let status = Arc::new(MemoryStatusStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let recorder = DispositionRecorder::new(status.clone(), events.clone());
        Fixture {
            status,
            events,
            recorder,
        }
    }

    fn msg() -> QueuedMessage {
        QueuedMessage::new("from@here.com", "to@there.com", b"body".to_vec(), "default")
    }

    const IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 1));

    #[tokio::test]
    async fn success_updates_state_without_emitting_events() {
        let f = fixture();
        let mut msg = msg();
        msg.begin_attempt();

        f.recorder
            .record_success(&msg, IP, "mx1.example.com")
            .await
            .unwrap();

        let updates = f.status.updates_for(msg.id);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, DeliveryStatus::Delivered);
        assert_eq!(updates[0].attempt, 1);
        assert!(f.events.all().is_empty());
    }

    #[tokio::test]
    async fn each_attempt_of_the_same_outcome_leaves_its_own_record() {
        let f = fixture();
        let mut msg = msg();

        // the peer answers 451 on two consecutive attempts before the
        // message finally bounces
        for _ in 0..2 {
            msg.begin_attempt();
            f.recorder
                .record_deferral(&msg, "451 try later", Some(IP), Some("mx1.example.com"), false)
                .await
                .unwrap();
        }
        msg.begin_attempt();
        f.recorder
            .record_failure(&msg, "550 no such user", Some(IP), Some("mx1.example.com"))
            .await
            .unwrap();

        let updates = f.status.updates_for(msg.id);
        assert_eq!(updates.len(), 3);
        assert_eq!(
            updates.iter().map(|u| u.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(updates[0].status, DeliveryStatus::Deferred);
        assert_eq!(updates[1].status, DeliveryStatus::Deferred);
        assert_eq!(updates[2].status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn permanent_failure_bounces_with_the_verbatim_reason() {
        let f = fixture();
        let msg = msg();

        f.recorder
            .record_failure(&msg, "550 no such user", Some(IP), Some("mx1.example.com"))
            .await
            .unwrap();

        let updates = f.status.updates_for(msg.id);
        assert_eq!(updates[0].status, DeliveryStatus::Failed);
        assert_eq!(updates[0].reason.as_deref(), Some("550 no such user"));

        let events = f.events.all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Bounce);
        assert_eq!(events[0].reason.as_deref(), Some("550 no such user"));
        assert_eq!(events[0].message_id, Some(msg.id));
        assert!(!events[0].forwarded);
    }

    #[tokio::test]
    async fn queue_timeout_is_its_own_event_kind() {
        let f = fixture();
        let msg = msg();

        f.recorder
            .record_failure(&msg, TIMED_OUT_IN_QUEUE, None, None)
            .await
            .unwrap();

        let updates = f.status.updates_for(msg.id);
        assert_eq!(updates[0].status, DeliveryStatus::TimedOut);
        assert_eq!(f.events.all()[0].kind, EventKind::TimedOutInQueue);
    }

    #[tokio::test]
    async fn deferrals_update_state_without_emitting_events() {
        let f = fixture();
        let msg = msg();

        f.recorder
            .record_deferral(&msg, "451 try later", Some(IP), Some("mx1.example.com"), false)
            .await
            .unwrap();
        f.recorder.record_throttle(&msg, IP, "mx1.example.com").await.unwrap();
        f.recorder.record_service_unavailable(&msg, IP).await.unwrap();

        let updates = f.status.updates_for(msg.id);
        assert_eq!(updates.len(), 3);
        assert!(updates
            .iter()
            .all(|update| update.status == DeliveryStatus::Deferred));
        assert!(f.events.all().is_empty());
    }
}
