use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// How long a 421 keeps a (source, destination) pairing blacklisted
const ENTRY_LIFETIME: Duration = Duration::from_secs(60);

/// Short-lived record of (source IP, destination host) pairs that a peer
/// has pushed back on with a 421. The pool consults this before handing
/// out a client; stale entries are purged lazily on read. No persistence.
#[derive(Default)]
pub struct UnavailabilityRegistry {
    entries: DashMap<(String, String), Instant>,
}

impl UnavailabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, source: IpAddr, host: &str) {
        self.add_at(source, host, Instant::now());
    }

    fn add_at(&self, source: IpAddr, host: &str, at: Instant) {
        self.entries
            .insert((source.to_string(), host.to_string()), at);
    }

    pub fn is_unavailable(&self, source: IpAddr, host: &str) -> bool {
        self.is_unavailable_at(source, host, Instant::now())
    }

    fn is_unavailable_at(&self, source: IpAddr, host: &str, now: Instant) -> bool {
        let key = (source.to_string(), host.to_string());
        let stamp = self.entries.get(&key).map(|stamp| *stamp);
        match stamp {
            Some(stamp) if now.duration_since(stamp) < ENTRY_LIFETIME => true,
            Some(_) => {
                self.entries.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
