use crate::config::GroupConfig;
use crate::dns::MxRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// A logical sender: a source IP with its HELO identity and reporting name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMta {
    pub name: String,
    pub source_address: IpAddr,
    pub ehlo_hostname: String,
    pub remote_port: Option<u16>,
}

/// A non-empty ordered set of virtual MTAs. Source selection is
/// round-robin over the destination: each destination host rotates
/// through the group's sources independently, so a busy destination
/// doesn't skew which source the quieter ones get.
pub struct VirtualMtaGroup {
    pub name: String,
    entries: Vec<VirtualMta>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl VirtualMtaGroup {
    pub fn new(name: &str, entries: Vec<VirtualMta>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !entries.is_empty(),
            "virtual MTA group {name} has no members"
        );
        Ok(Self {
            name: name.to_string(),
            entries,
            cursors: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &GroupConfig) -> anyhow::Result<Self> {
        Self::new(
            &config.name,
            config
                .virtual_mtas
                .iter()
                .map(|mta| VirtualMta {
                    name: mta.name.clone(),
                    source_address: mta.source_address,
                    ehlo_hostname: mta.ehlo_hostname.clone(),
                    remote_port: mta.remote_port,
                })
                .collect(),
        )
    }

    /// Pick the source to use for a send to this mail exchanger
    pub fn virtual_mta_for_sending(&self, mx: &MxRecord) -> VirtualMta {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(mx.host.clone()).or_insert(0);
        let mta = self.entries[*cursor % self.entries.len()].clone();
        *cursor = (*cursor + 1) % self.entries.len();
        mta
    }
}

/// Looks up groups by the routing hint carried on each message.
/// An unknown group id falls back to the default (first configured)
/// group rather than failing the message.
pub struct GroupRegistry {
    groups: HashMap<String, Arc<VirtualMtaGroup>>,
    default_group: String,
}

impl GroupRegistry {
    pub fn from_config(configs: &[GroupConfig]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !configs.is_empty(),
            "at least one virtual MTA group must be configured"
        );
        let mut groups = HashMap::new();
        for config in configs {
            let group = VirtualMtaGroup::from_config(config)?;
            if groups
                .insert(config.name.clone(), Arc::new(group))
                .is_some()
            {
                anyhow::bail!("virtual MTA group {} is defined twice", config.name);
            }
        }
        Ok(Self {
            groups,
            default_group: configs[0].name.clone(),
        })
    }

    pub fn get_group(&self, id: &str) -> Arc<VirtualMtaGroup> {
        match self.groups.get(id) {
            Some(group) => Arc::clone(group),
            None => {
                tracing::debug!("unknown virtual MTA group {id:?}; using the default group");
                Arc::clone(&self.groups[&self.default_group])
            }
        }
    }
}
