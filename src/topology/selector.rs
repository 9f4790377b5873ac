//! Server selection predicates over a topology snapshot.
use crate::common::{ReadMode, ReadPreference};

use std::collections::BTreeMap;
use std::fmt;

use super::server::{ServerDescription, ServerType};
use super::{TopologyDescription, TopologyType};

/// Picks the servers in a snapshot that may service a class of operation.
pub trait ServerSelector: fmt::Debug + Send + Sync {
    fn select<'a>(&self, topology: &'a TopologyDescription) -> Vec<&'a ServerDescription>;
}

/// Any data-bearing server.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnyServer;

/// The server that accepts writes: the single server, any mongos, or the
/// replica set primary.
#[derive(Clone, Copy, Debug, Default)]
pub struct WritableServer;

fn of_types<'a>(topology: &'a TopologyDescription, types: &[ServerType]) -> Vec<&'a ServerDescription> {
    let mut servers: Vec<_> = topology
        .servers
        .values()
        .filter(|server| types.contains(&server.server_type))
        .collect();
    servers.sort_by(|a, b| a.host.cmp(&b.host));
    servers
}

impl ServerSelector for AnyServer {
    fn select<'a>(&self, topology: &'a TopologyDescription) -> Vec<&'a ServerDescription> {
        let mut servers: Vec<_> = topology
            .servers
            .values()
            .filter(|server| server.server_type.is_data_bearing())
            .collect();
        servers.sort_by(|a, b| a.host.cmp(&b.host));
        servers
    }
}

impl ServerSelector for WritableServer {
    fn select<'a>(&self, topology: &'a TopologyDescription) -> Vec<&'a ServerDescription> {
        match topology.topology_type {
            TopologyType::Single => of_types(
                topology,
                &[ServerType::Standalone, ServerType::Mongos, ServerType::RSPrimary],
            ),
            TopologyType::Sharded => of_types(topology, &[ServerType::Mongos]),
            TopologyType::ReplicaSetWithPrimary => of_types(topology, &[ServerType::RSPrimary]),
            TopologyType::ReplicaSetNoPrimary | TopologyType::Unknown => Vec::new(),
        }
    }
}

fn matches_tags(server: &ServerDescription, tags: &BTreeMap<String, String>) -> bool {
    tags.iter().all(|(k, v)| server.tags.get(k) == Some(v))
}

// Keeps the members matching the first tag set that matches any of them.
fn filter_tags<'a>(servers: Vec<&'a ServerDescription>, tag_sets: &[BTreeMap<String, String>]) -> Vec<&'a ServerDescription> {
    if tag_sets.is_empty() {
        return servers;
    }

    for tags in tag_sets {
        let matched: Vec<_> = servers.iter().cloned().filter(|server| matches_tags(server, tags)).collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    Vec::new()
}

impl ServerSelector for ReadPreference {
    fn select<'a>(&self, topology: &'a TopologyDescription) -> Vec<&'a ServerDescription> {
        match topology.topology_type {
            TopologyType::Single | TopologyType::Sharded => return AnyServer.select(topology),
            TopologyType::Unknown => return Vec::new(),
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => (),
        }

        let primaries = of_types(topology, &[ServerType::RSPrimary]);
        let secondaries = || filter_tags(of_types(topology, &[ServerType::RSSecondary]), &self.tag_sets);

        match self.mode {
            ReadMode::Primary => primaries,
            ReadMode::PrimaryPreferred => {
                if primaries.is_empty() {
                    secondaries()
                } else {
                    primaries
                }
            }
            ReadMode::Secondary => secondaries(),
            ReadMode::SecondaryPreferred => {
                let secondaries = secondaries();
                if secondaries.is_empty() {
                    primaries
                } else {
                    secondaries
                }
            }
            ReadMode::Nearest => filter_tags(
                of_types(topology, &[ServerType::RSPrimary, ServerType::RSSecondary]),
                &self.tag_sets,
            ),
        }
    }
}
