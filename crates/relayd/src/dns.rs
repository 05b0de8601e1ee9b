use async_trait::async_trait;
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub host: String,
    pub preference: u16,
}

/// Resolves the mail exchangers for a recipient domain.
/// The returned records are ordered by ascending preference; an empty
/// sequence means the domain has no mail service (NXDOMAIN or no MX).
#[async_trait]
pub trait MxResolver: Send + Sync {
    async fn resolve_mx(&self, domain: &str) -> anyhow::Result<Vec<MxRecord>>;
}

pub struct DnsMxResolver {
    resolver: TokioAsyncResolver,
}

impl DnsMxResolver {
    pub fn from_system_conf() -> anyhow::Result<Self> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

#[async_trait]
impl MxResolver for DnsMxResolver {
    async fn resolve_mx(&self, domain: &str) -> anyhow::Result<Vec<MxRecord>> {
        let lookup = match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                return Ok(vec![]);
            }
            Err(err) => anyhow::bail!("MX lookup for {domain} failed: {err:#}"),
        };

        let mut records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| MxRecord {
                host: mx
                    .exchange()
                    .to_lowercase()
                    .to_string()
                    .trim_end_matches('.')
                    .to_string(),
                preference: mx.preference(),
            })
            // '.' is a null mx; nothing will accept mail there
            .filter(|record| !record.host.is_empty())
            .collect();

        sort_by_preference(&mut records);
        Ok(records)
    }
}

/// Order by ascending preference; hosts at the same preference level
/// sort lexically so the overall ordering is deterministic.
pub fn sort_by_preference(records: &mut [MxRecord]) {
    records.sort_by(|a, b| {
        a.preference
            .cmp(&b.preference)
            .then_with(|| a.host.cmp(&b.host))
    });
}

#[cfg(test)]
mod test {
    use super::*;

    fn mx(host: &str, preference: u16) -> MxRecord {
        MxRecord {
            host: host.to_string(),
            preference,
        }
    }

    #[test]
    fn preference_ordering() {
        let mut records = vec![
            mx("backup.example.com", 20),
            mx("mta2.example.com", 10),
            mx("mta1.example.com", 10),
            mx("primary.example.com", 5),
        ];
        sort_by_preference(&mut records);
        let hosts: Vec<&str> = records.iter().map(|r| r.host.as_str()).collect();
        assert_eq!(
            hosts,
            vec![
                "primary.example.com",
                "mta1.example.com",
                "mta2.example.com",
                "backup.example.com"
            ]
        );
    }
}
