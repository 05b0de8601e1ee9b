use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EventKind {
    /// A feedback-loop or abuse complaint attributed to a message we sent
    Abuse,
    /// The destination permanently refused the message
    Bounce,
    /// The message exhausted its time-in-queue budget without being delivered
    TimedOutInQueue,
    /// Anything that doesn't have a more specific shape
    Other,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Abuse => "Abuse",
            Self::Bounce => "Bounce",
            Self::TimedOutInQueue => "TimedOutInQueue",
            Self::Other => "Other",
        }
    }
}

/// A durable delivery event. The `forwarded` flag tracks whether the
/// operator's HTTP endpoint has acknowledged the event; it is bookkeeping
/// for the event store and must never appear in the wire shapes below.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    /// The message this event pertains to, when known
    pub message_id: Option<Uuid>,
    /// The envelope recipient of that message
    pub recipient: String,
    /// The source IP the delivery attempt used, if it got that far
    pub source_ip: Option<String>,
    /// The mail exchanger the delivery attempt targeted
    pub mx_host: Option<String>,
    /// Verbatim peer response, or a locally generated reason
    pub reason: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Set once the external endpoint has acknowledged this event.
    /// Moves false -> true exactly once.
    #[serde(default)]
    pub forwarded: bool,
}

impl Event {
    pub fn new(kind: EventKind, recipient: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message_id: None,
            recipient: recipient.to_string(),
            source_ip: None,
            mx_host: None,
            reason: None,
            timestamp: Utc::now(),
            forwarded: false,
        }
    }

    /// Serialize the shape that goes over the wire to the operator's
    /// endpoint. Each kind dispatches to its own typed shape; none of
    /// them carry the `forwarded` flag.
    pub fn wire_json(&self) -> serde_json::Result<String> {
        let wire = match self.kind {
            EventKind::Abuse => EventWire::Abuse(AbuseWire {
                id: self.id,
                message_id: self.message_id,
                recipient: &self.recipient,
                timestamp: self.timestamp,
            }),
            EventKind::Bounce => EventWire::Bounce(BounceWire {
                id: self.id,
                message_id: self.message_id,
                recipient: &self.recipient,
                source_ip: self.source_ip.as_deref(),
                mx_host: self.mx_host.as_deref(),
                response: self.reason.as_deref(),
                timestamp: self.timestamp,
            }),
            EventKind::TimedOutInQueue => EventWire::TimedOutInQueue(TimedOutWire {
                id: self.id,
                message_id: self.message_id,
                recipient: &self.recipient,
                timestamp: self.timestamp,
            }),
            EventKind::Other => EventWire::Event(GenericWire {
                id: self.id,
                message_id: self.message_id,
                recipient: &self.recipient,
                reason: self.reason.as_deref(),
                timestamp: self.timestamp,
            }),
        };
        serde_json::to_string(&wire)
    }
}

#[derive(Serialize, Debug)]
#[serde(tag = "type")]
enum EventWire<'a> {
    Abuse(AbuseWire<'a>),
    Bounce(BounceWire<'a>),
    TimedOutInQueue(TimedOutWire<'a>),
    Event(GenericWire<'a>),
}

#[derive(Serialize, Debug)]
struct AbuseWire<'a> {
    id: Uuid,
    message_id: Option<Uuid>,
    recipient: &'a str,
    #[serde(with = "chrono::serde::ts_seconds")]
    timestamp: DateTime<Utc>,
}

#[derive(Serialize, Debug)]
struct BounceWire<'a> {
    id: Uuid,
    message_id: Option<Uuid>,
    recipient: &'a str,
    source_ip: Option<&'a str>,
    mx_host: Option<&'a str>,
    /// The verbatim response the peer gave us
    response: Option<&'a str>,
    #[serde(with = "chrono::serde::ts_seconds")]
    timestamp: DateTime<Utc>,
}

#[derive(Serialize, Debug)]
struct TimedOutWire<'a> {
    id: Uuid,
    message_id: Option<Uuid>,
    recipient: &'a str,
    #[serde(with = "chrono::serde::ts_seconds")]
    timestamp: DateTime<Utc>,
}

#[derive(Serialize, Debug)]
struct GenericWire<'a> {
    id: Uuid,
    message_id: Option<Uuid>,
    recipient: &'a str,
    reason: Option<&'a str>,
    #[serde(with = "chrono::serde::ts_seconds")]
    timestamp: DateTime<Utc>,
}
