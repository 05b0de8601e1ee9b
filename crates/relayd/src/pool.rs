use crate::config::PoolConfig;
use crate::dns::MxRecord;
use crate::smtp::{ConnectError, SmtpConnector, SmtpDelivery};
use crate::unavailability::UnavailabilityRegistry;
use crate::virtual_mta::VirtualMta;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const THROTTLE_WINDOW: Duration = Duration::from_secs(60);

/// The disjoint outcomes of asking the pool for a client
pub enum LeaseOutcome {
    /// A connected client, exclusively owned by the caller until it is
    /// given back or dropped (dropping discards the connection)
    Success(PooledClient),
    /// The caller handed us nothing to connect to
    NoMxRecords,
    /// The client could not be recorded in the pool's internal
    /// tracking. An expected race outcome; the broker will redeliver.
    FailedToAddToQueue,
    /// TCP-level connect or banner trouble
    FailedToConnect,
    /// The (source, destination) pairing is in its 421 cool-off
    ServiceUnavailable,
    /// The destination-level message throttle said not right now
    Throttled,
    /// All connection slots for the pairing are in use
    FailedMaxConnections,
    /// Catch-all for pool implementations with failure modes this
    /// enum doesn't name. Treated like a race: no recording.
    Unknown,
}

/// Lends SMTP clients keyed by (source IP, destination host)
#[async_trait]
pub trait ClientPool: Send + Sync {
    async fn lease(&self, mta: &VirtualMta, mx_records: &[MxRecord]) -> LeaseOutcome;

    /// Return a cleanly finished client for reuse
    async fn give_back(&self, client: PooledClient);
}

struct IdleClient {
    client: Box<dyn SmtpDelivery>,
    last_active: Instant,
}

#[derive(Default)]
struct ThrottleWindow {
    started: Option<Instant>,
    count: u64,
}

#[derive(Default)]
struct SiteState {
    idle: Mutex<Vec<IdleClient>>,
    /// Connections currently open against this site, leased or idle
    open: AtomicUsize,
    window: Mutex<ThrottleWindow>,
}

/// An SMTP connection on loan from the pool. Exactly one caller owns it
/// at a time; dropping it without giving it back discards the
/// connection and releases its slot.
pub struct PooledClient {
    client: Option<Box<dyn SmtpDelivery>>,
    pub source_ip: IpAddr,
    pub mx_host: String,
    pub active: bool,
    pub last_active: Instant,
    site: Arc<SiteState>,
}

impl PooledClient {
    pub fn client_mut(&mut self) -> &mut dyn SmtpDelivery {
        self.client.as_mut().unwrap().as_mut()
    }

    /// Build a leased client that isn't backed by a real pool site,
    /// for driving the dispatcher against scripted clients
    #[cfg(test)]
    pub(crate) fn detached(
        client: Box<dyn SmtpDelivery>,
        source_ip: IpAddr,
        mx_host: &str,
    ) -> Self {
        let site = Arc::new(SiteState::default());
        site.open.store(1, Ordering::SeqCst);
        Self {
            client: Some(client),
            source_ip,
            mx_host: mx_host.to_string(),
            active: true,
            last_active: Instant::now(),
            site,
        }
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if self.client.is_some() {
            self.site.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct SmtpClientPool {
    sites: DashMap<(IpAddr, String), Arc<SiteState>>,
    connector: Arc<dyn SmtpConnector>,
    registry: Arc<UnavailabilityRegistry>,
    config: PoolConfig,
}

impl SmtpClientPool {
    pub fn new(
        connector: Arc<dyn SmtpConnector>,
        registry: Arc<UnavailabilityRegistry>,
        config: PoolConfig,
    ) -> Self {
        Self {
            sites: DashMap::new(),
            connector,
            registry,
            config,
        }
    }

    fn site(&self, source: IpAddr, host: &str) -> Arc<SiteState> {
        self.sites
            .entry((source, host.to_string()))
            .or_insert_with(|| Arc::new(SiteState::default()))
            .clone()
    }

    fn admit_message(&self, site: &SiteState) -> bool {
        let Some(limit) = self.config.max_messages_per_minute else {
            return true;
        };
        let now = Instant::now();
        let mut window = site.window.lock();
        match window.started {
            Some(started) if now.duration_since(started) < THROTTLE_WINDOW => {
                if window.count >= limit {
                    return false;
                }
                window.count += 1;
            }
            _ => {
                window.started = Some(now);
                window.count = 1;
            }
        }
        true
    }

    fn wrap(&self, client: Box<dyn SmtpDelivery>, source: IpAddr, host: &str) -> PooledClient {
        PooledClient {
            client: Some(client),
            source_ip: source,
            mx_host: host.to_string(),
            active: true,
            last_active: Instant::now(),
            site: self.site(source, host),
        }
    }
}

#[async_trait]
impl ClientPool for SmtpClientPool {
    async fn lease(&self, mta: &VirtualMta, mx_records: &[MxRecord]) -> LeaseOutcome {
        let Some(mx) = mx_records.first() else {
            return LeaseOutcome::NoMxRecords;
        };
        let source = mta.source_address;

        if self.registry.is_unavailable(source, &mx.host) {
            return LeaseOutcome::ServiceUnavailable;
        }

        let site = self.site(source, &mx.host);

        if !self.admit_message(&site) {
            return LeaseOutcome::Throttled;
        }

        // reuse an idle connection while one is still fresh
        loop {
            let idle = site.idle.lock().pop();
            match idle {
                Some(ic) if ic.last_active.elapsed() <= self.config.idle_timeout => {
                    return LeaseOutcome::Success(self.wrap(ic.client, source, &mx.host));
                }
                Some(_stale) => {
                    site.open.fetch_sub(1, Ordering::SeqCst);
                }
                None => break,
            }
        }

        let prev = site.open.fetch_add(1, Ordering::SeqCst);
        if prev >= self.config.max_connections {
            site.open.fetch_sub(1, Ordering::SeqCst);
            return LeaseOutcome::FailedMaxConnections;
        }

        match self.connector.connect(mta, &mx.host).await {
            Ok(client) => LeaseOutcome::Success(self.wrap(client, source, &mx.host)),
            Err(ConnectError::Unavailable(reply)) => {
                site.open.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!("{} told us to back off: {reply}", mx.host);
                self.registry.add(source, &mx.host);
                LeaseOutcome::ServiceUnavailable
            }
            Err(ConnectError::Connect(err)) => {
                site.open.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!("failed to connect to {} from {source}: {err:#}", mx.host);
                LeaseOutcome::FailedToConnect
            }
        }
    }

    async fn give_back(&self, mut client: PooledClient) {
        client.active = false;
        client.last_active = Instant::now();
        if let Some(inner) = client.client.take() {
            client.site.idle.lock().push(IdleClient {
                client: inner,
                last_active: client.last_active,
            });
        }
    }
}
