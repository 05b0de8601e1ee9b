use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Eq)]
#[serde(transparent)]
pub struct EnvelopeAddress(String);

impl EnvelopeAddress {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        if text.is_empty() {
            return Ok(Self::null_sender());
        }
        let (user, domain) = text
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("expected user@domain, got {text:?}"))?;
        anyhow::ensure!(
            !user.is_empty() && !domain.is_empty() && !domain.contains('@'),
            "expected user@domain, got {text:?}"
        );
        Ok(Self(text.to_string()))
    }

    pub fn user(&self) -> &str {
        match self.0.find('@') {
            Some(at) => &self.0[..at],
            None => "",
        }
    }

    pub fn domain(&self) -> &str {
        match self.0.find('@') {
            Some(at) => &self.0[at + 1..],
            None => "",
        }
    }

    /// The empty reverse-path used by delivery status notifications
    pub fn null_sender() -> Self {
        Self(String::new())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for EnvelopeAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// A unit of outbound work, exclusively owned by whoever last dequeued
/// it from the broker, from dequeue until ack.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: Uuid,
    /// Envelope sender, unparsed as it came off the wire
    pub sender: String,
    /// Envelope recipient; exactly one per message
    pub recipient: String,
    /// Opaque RFC 822 payload
    pub data: Arc<Box<[u8]>>,
    /// Which virtual-MTA group routes this message
    pub group: String,
    pub queued_at: DateTime<Utc>,
    /// Do not attempt delivery before this instant.
    /// Invariant: always >= queued_at.
    pub attempt_send_after: DateTime<Utc>,
    pub num_attempts: u16,
}

impl QueuedMessage {
    pub fn new(sender: &str, recipient: &str, data: Vec<u8>, group: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            data: Arc::new(data.into_boxed_slice()),
            group: group.to_string(),
            queued_at: now,
            attempt_send_after: now,
            num_attempts: 0,
        }
    }

    /// True when the message is not yet eligible for a delivery attempt
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.attempt_send_after > now
    }

    /// True when the message has exhausted its time-in-queue budget and
    /// must not be dispatched. The comparison is against the scheduled
    /// attempt time rather than the current time; attempt_send_after only
    /// moves forward, so the two agree once the budget is exceeded.
    pub fn exceeded_queue_budget(&self, budget: Duration) -> bool {
        self.attempt_send_after - self.queued_at > budget
    }

    /// Push the next eligible attempt time forward. In-memory only; the
    /// broker redelivers on its own schedule.
    pub fn delay_attempt_by(&mut self, delay: Duration) {
        self.attempt_send_after += delay;
    }

    /// Mark the start of a dispatch attempt and return its number.
    /// The count starts from whatever the broker handed us, so a broker
    /// that persists it numbers attempts across redeliveries.
    pub fn begin_attempt(&mut self) -> u16 {
        self.num_attempts = self.num_attempts.saturating_add(1);
        self.num_attempts
    }
}
