use crate::smtp::SmtpClientTimeouts;
use anyhow::Context;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// serde helper: durations expressed as integer seconds in the config file
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RelaydConfig {
    /// How long a message may wait in the queue before it is failed
    /// with "Timed out in queue.", in minutes.
    #[serde(default = "RelaydConfig::default_max_time_in_queue")]
    pub max_time_in_queue: u64,

    /// When set, delivery events are POSTed to this URL until the
    /// endpoint acknowledges them. Absent means the forwarder never
    /// starts.
    #[serde(default)]
    pub event_forwarding_http_post_url: Option<String>,

    /// How long the dispatch loop sleeps when the broker has nothing
    /// for us, in milliseconds
    #[serde(default = "RelaydConfig::default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,

    /// Destination port for SMTP, unless a virtual MTA overrides it
    #[serde(default = "RelaydConfig::default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub smtp_timeouts: SmtpClientTimeouts,

    /// The virtual-MTA groups available for routing. The first group
    /// listed is the default for messages whose group id is unknown.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl RelaydConfig {
    fn default_max_time_in_queue() -> u64 {
        // three days
        4320
    }

    fn default_idle_sleep_ms() -> u64 {
        100
    }

    fn default_smtp_port() -> u16 {
        25
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn max_time_in_queue(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_time_in_queue as i64)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

impl Default for RelaydConfig {
    fn default() -> Self {
        Self {
            max_time_in_queue: Self::default_max_time_in_queue(),
            event_forwarding_http_post_url: None,
            idle_sleep_ms: Self::default_idle_sleep_ms(),
            smtp_port: Self::default_smtp_port(),
            pool: PoolConfig::default(),
            smtp_timeouts: SmtpClientTimeouts::default(),
            groups: vec![],
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum simultaneously open connections per (source IP, mx host)
    #[serde(default = "PoolConfig::default_max_connections")]
    pub max_connections: usize,

    /// How long an idle pooled connection remains eligible for reuse
    #[serde(default = "PoolConfig::default_idle_timeout", with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Destination-level throttle: messages per minute per
    /// (source IP, mx host). None disables the throttle.
    #[serde(default)]
    pub max_messages_per_minute: Option<u64>,
}

impl PoolConfig {
    fn default_max_connections() -> usize {
        8
    }

    fn default_idle_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: Self::default_max_connections(),
            idle_timeout: Self::default_idle_timeout(),
            max_messages_per_minute: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    pub virtual_mtas: Vec<VirtualMtaConfig>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct VirtualMtaConfig {
    /// Friendly name for reporting
    pub name: String,
    /// Bind to this local address prior to connecting
    pub source_address: IpAddr,
    /// The hostname used in HELO when sending from this source
    pub ehlo_hostname: String,
    /// Override the destination port for deployments that use port mapping
    #[serde(default)]
    pub remote_port: Option<u16>,
}
