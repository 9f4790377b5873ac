use assert_matches::assert_matches;
use bson::{bson, doc};
use mongodb_topology::error::Error::AutoReconnect;
use mongodb_topology::topology::selector::{AnyServer, WritableServer};
use mongodb_topology::{Client, ReadMode, ReadPreference};

use crate::common::{fast_options, host, init_tracing, rs_primary, rs_secondary, wait_until, MockCluster};

use std::collections::BTreeMap;
use std::time::Duration;

const MEMBERS: &[&str] = &["a", "b", "c"];

fn replica_set() -> (MockCluster, Client) {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add(&host("a"), rs_primary("a", MEMBERS));
    cluster.add(&host("b"), rs_secondary("b", MEMBERS));
    let mut tagged = rs_secondary("c", MEMBERS);
    tagged.insert("tags", doc! { "dc": "ny" });
    cluster.add(&host("c"), tagged);

    let options = fast_options().with_replica_set("rs");
    let client = Client::with_connector(vec![host("a")], options, cluster.connector()).unwrap();
    client.topology().ensure_monitors().unwrap();
    wait_until("every member is discovered", || client.secondaries().len() == 2);
    (cluster, client)
}

fn secondaries(tag_sets: Option<Vec<BTreeMap<String, String>>>) -> ReadPreference {
    ReadPreference::new(ReadMode::Secondary, tag_sets)
}

#[test]
fn writes_go_to_the_primary() {
    let (_cluster, client) = replica_set();
    let selected = client
        .topology()
        .select_servers(&WritableServer, Duration::from_secs(1))
        .unwrap();
    assert_eq!(vec![host("a")], selected);

    let any = client
        .topology()
        .select_servers(&AnyServer, Duration::from_secs(1))
        .unwrap();
    assert_eq!(vec![host("a"), host("b"), host("c")], any);
}

#[test]
fn reads_honor_mode_and_tags() {
    let (_cluster, client) = replica_set();
    let topology = client.topology();

    let selected = topology.select_servers(&secondaries(None), Duration::from_secs(1)).unwrap();
    assert_eq!(vec![host("b"), host("c")], selected);

    let mut ny = BTreeMap::new();
    ny.insert("dc".to_owned(), "ny".to_owned());
    let selected = topology
        .select_servers(&secondaries(Some(vec![ny])), Duration::from_secs(1))
        .unwrap();
    assert_eq!(vec![host("c")], selected);

    let selected = topology
        .select_servers(&ReadPreference::primary(), Duration::from_secs(1))
        .unwrap();
    assert_eq!(vec![host("a")], selected);
}

#[test]
fn no_primary_times_out_then_recovers() {
    let (cluster, client) = replica_set();
    cluster.kill(&host("a"));
    wait_until("the primary is lost", || client.primary().is_none());

    let result = client
        .topology()
        .select_servers(&WritableServer, Duration::from_millis(300));
    assert_matches!(result, Err(AutoReconnect(_)));

    // Reads that tolerate secondaries still succeed.
    let mut preference = secondaries(None);
    preference.mode = ReadMode::PrimaryPreferred;
    let selected = client
        .topology()
        .select_servers(&preference, Duration::from_secs(1))
        .unwrap();
    assert_eq!(vec![host("b"), host("c")], selected);

    cluster.set_is_master(&host("b"), rs_primary("b", MEMBERS));
    let selected = client
        .topology()
        .select_servers(&WritableServer, Duration::from_secs(5))
        .unwrap();
    assert_eq!(vec![host("b")], selected);
    assert_eq!(Some(host("b")), client.primary());
}
