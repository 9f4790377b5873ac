use assert_matches::assert_matches;
use bson::{bson, doc};
use mongodb_topology::error::Error::{AutoReconnect, ConnectionFailure, CursorNotFound};
use mongodb_topology::topology::selector::{AnyServer, WritableServer};
use mongodb_topology::topology::server::ServerType;
use mongodb_topology::{CallerId, Client};

use crate::common::{
    fast_options, host, init_tracing, mongos, rs_primary, rs_secondary, standalone, wait_until,
    MockCluster, LIVE_CURSOR,
};

use std::sync::atomic::{AtomicBool, Ordering};

fn standalone_client() -> (MockCluster, Client) {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add(&host("a"), standalone());
    let client = Client::with_connector(vec![host("a")], fast_options(), cluster.connector()).unwrap();
    (cluster, client)
}

fn replica_set_client() -> (MockCluster, Client) {
    init_tracing();
    let members = ["a", "b"];
    let cluster = MockCluster::new();
    cluster.add(&host("a"), rs_primary("a", &members));
    cluster.add(&host("b"), rs_secondary("b", &members));
    let options = fast_options().with_replica_set("rs");
    let client = Client::with_connector(vec![host("a")], options, cluster.connector()).unwrap();
    wait_until("both members are discovered", || client.secondaries() == vec![host("b")]);
    (cluster, client)
}

fn connection_id(client: &Client, caller: Option<&CallerId>) -> u64 {
    client
        .execute(caller, &WritableServer, "test", |conn| Ok(conn.id()))
        .unwrap()
}

#[test]
fn request_pins_one_connection() {
    let (_cluster, client) = standalone_client();
    let pool = client.pool(&host("a")).unwrap();
    let caller = CallerId::new();

    let pinned = {
        let _request = client.request(&caller).unwrap();
        let first = connection_id(&client, Some(&caller));

        // Another borrower cannot take the pinned socket.
        let other = pool.acquire(None).unwrap();
        assert_ne!(first, other.id());
        assert_eq!(first, connection_id(&client, Some(&caller)));

        drop(other);
        assert!(!pool.idle_connection_ids().unwrap().contains(&first));
        first
    };

    assert!(!client.in_request(&caller).unwrap());
    assert!(!pool.in_request(&caller).unwrap());
    assert!(pool.idle_connection_ids().unwrap().contains(&pinned));
}

#[test]
fn nested_requests_end_with_the_outermost() {
    let (_cluster, client) = standalone_client();
    let pool = client.pool(&host("a")).unwrap();
    let caller = CallerId::new();

    client.start_request(&caller).unwrap();
    client.start_request(&caller).unwrap();
    let first = connection_id(&client, Some(&caller));

    client.end_request(&caller).unwrap();
    assert!(pool.in_request(&caller).unwrap());
    assert_eq!(first, connection_id(&client, Some(&caller)));

    client.end_request(&caller).unwrap();
    assert!(!pool.in_request(&caller).unwrap());
    assert_eq!(0, pool.in_use().unwrap());
}

#[test]
fn removed_member_fails_without_network_call() {
    let (cluster, client) = replica_set_client();

    // The primary stops listing b.
    cluster.set_is_master(&host("a"), rs_primary("a", &["a"]));
    wait_until("b is removed", || client.nodes() == vec![host("a")]);

    let called = AtomicBool::new(false);
    let result = client.execute_on(None, &host("b"), "test", |_| {
        called.store(true, Ordering::SeqCst);
        Ok(())
    });
    assert_matches!(result, Err(AutoReconnect(_)));
    assert!(!called.load(Ordering::SeqCst));
    assert!(client.pool(&host("b")).is_none());

    assert_matches!(
        client.get_more(None, &host("b"), "test.c", LIVE_CURSOR, 10),
        Err(AutoReconnect(_))
    );
}

#[test]
fn network_error_resets_only_that_server() {
    let (cluster, client) = replica_set_client();
    let primary_pool = client.pool(&host("a")).unwrap();
    let secondary_pool = client.pool(&host("b")).unwrap();

    client
        .execute_on(None, &host("b"), "test", |conn| conn.command("test", doc! { "ping": 1 }))
        .unwrap();
    let generation = secondary_pool.generation().unwrap();

    cluster.break_connections(&host("b"));
    let result = client.execute_on(None, &host("b"), "test", |conn| conn.command("test", doc! { "ping": 1 }));
    assert_matches!(result, Err(ConnectionFailure(_)));

    assert!(secondary_pool.generation().unwrap() > generation);
    assert_eq!(0, primary_pool.generation().unwrap());
    assert_eq!(Some(host("a")), client.primary());
}

#[test]
fn cursor_maintenance() {
    let (cluster, client) = standalone_client();
    let a = host("a");
    client.command(None, &AnyServer, "test", doc! { "ping": 1 }).unwrap();

    let (cursor_id, docs) = client.get_more(None, &a, "test.c", LIVE_CURSOR, 10).unwrap();
    assert_eq!(0, cursor_id);
    assert_eq!(vec![doc! { "x": 1 }], docs);

    client.kill_cursors(&[LIVE_CURSOR], &a).unwrap();
    assert!(cluster.killed_cursors().contains(&LIVE_CURSOR));

    assert_matches!(
        client.get_more(None, &a, "test.c", LIVE_CURSOR, 10),
        Err(CursorNotFound(LIVE_CURSOR))
    );
    // A missing cursor is not a broken socket.
    assert_eq!(1, client.pool(&a).unwrap().idle_count().unwrap());
}

#[test]
fn disconnect_is_idempotent_and_reconnects() {
    let (_cluster, client) = replica_set_client();
    assert_eq!(vec![host("a"), host("b")], client.nodes());

    client.disconnect().unwrap();
    client.disconnect().unwrap();
    assert_eq!(vec![host("a")], client.nodes());
    assert!(!client.monitor_is_alive(&host("a")));
    assert!(client.primary().is_none());

    client.command(None, &WritableServer, "test", doc! { "ping": 1 }).unwrap();
    assert!(client.monitor_is_alive(&host("a")));
    wait_until("b is rediscovered", || client.nodes() == vec![host("a"), host("b")]);
}

#[test]
fn reset_is_idempotent() {
    let (_cluster, client) = standalone_client();
    let pool = client.pool(&host("a")).unwrap();
    client.command(None, &WritableServer, "test", doc! { "ping": 1 }).unwrap();
    assert_eq!(1, pool.idle_count().unwrap());

    client.reset().unwrap();
    client.reset().unwrap();
    assert_eq!(0, pool.idle_count().unwrap());
    client.command(None, &WritableServer, "test", doc! { "ping": 1 }).unwrap();
}

#[test]
fn introspection() {
    let (_cluster, client) = replica_set_client();
    assert!(client.is_primary().unwrap());
    assert!(!client.is_mongos().unwrap());
    assert_eq!(Some(host("a")), client.primary());
    assert_eq!(16777216, client.max_bson_size());
    assert_eq!(48000000, client.max_message_size());
    assert_eq!(6, client.max_wire_version());
    assert!(client.alive());
    assert!(client.monitor_is_alive(&host("b")));
}

#[test]
fn mongos_introspection() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add(&host("a"), mongos());
    cluster.add(&host("b"), mongos());
    let client = Client::with_connector(vec![host("a"), host("b")], fast_options(), cluster.connector()).unwrap();

    assert!(client.is_mongos().unwrap());
    assert!(!client.is_primary().unwrap());
    wait_until("both routers are checked", || {
        client
            .topology_description()
            .servers
            .values()
            .all(|server| server.server_type == ServerType::Mongos)
    });
}

#[test]
fn dead_cluster_is_not_alive() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add(&host("a"), standalone());
    cluster.kill(&host("a"));
    let options = fast_options().with_server_selection_timeout(std::time::Duration::from_millis(200));
    let client = Client::with_connector(vec![host("a")], options, cluster.connector()).unwrap();

    assert!(!client.alive());
    assert_matches!(
        client.command(None, &AnyServer, "test", doc! { "ping": 1 }),
        Err(AutoReconnect(_))
    );
}
