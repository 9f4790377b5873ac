use assert_matches::assert_matches;
use bson::{bson, doc};
use mongodb_topology::auth::Credential;
use mongodb_topology::error::Error::{AutoReconnect, OperationFailure};
use mongodb_topology::topology::selector::WritableServer;
use mongodb_topology::Client;

use crate::common::{fast_options, host, init_tracing, standalone, MockAuthenticator, MockCluster};

use std::sync::Arc;

fn client() -> (MockCluster, Client) {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add(&host("a"), standalone());
    let client = Client::with_authenticator(
        vec![host("a")],
        fast_options(),
        cluster.connector(),
        Arc::new(MockAuthenticator),
    )
    .unwrap();
    (cluster, client)
}

fn credential(password: &str) -> Credential {
    Credential::new("MOCK", "test", "user", password)
}

fn ping(client: &Client) -> mongodb_topology::Result<bson::Document> {
    client.command(None, &WritableServer, "test", doc! { "ping": 1 })
}

#[test]
fn authenticates_once_per_socket() {
    let (cluster, client) = client();
    client.authenticate("test", credential("pencil")).unwrap();
    assert_eq!(1, cluster.authentications());

    ping(&client).unwrap();
    ping(&client).unwrap();
    assert_eq!(1, cluster.authentications());
}

#[test]
fn rejected_credential_is_not_cached() {
    let (cluster, client) = client();
    let result = client.authenticate("test", credential("wrong"));
    assert_matches!(result, Err(OperationFailure { code: 18, .. }));
    assert_eq!(1, cluster.authentications());

    // No credential left to replay.
    ping(&client).unwrap();
    assert_eq!(1, cluster.authentications());
}

#[test]
fn cached_credential_is_replayed_on_new_sockets() {
    let (cluster, client) = client();
    client.cache_credential("test", credential("pencil")).unwrap();
    assert_eq!(0, cluster.authentications());

    client
        .execute(None, &WritableServer, "test", |_| {
            // A second socket while the first is borrowed.
            ping(&client)
        })
        .unwrap();
    assert_eq!(2, cluster.authentications());

    // Other databases do not need the credential.
    client
        .command(None, &WritableServer, "other", doc! { "ping": 1 })
        .unwrap();
    assert_eq!(2, cluster.authentications());
}

#[test]
fn network_error_during_replay_is_retried_once() {
    let (cluster, client) = client();
    client.cache_credential("test", credential("pencil")).unwrap();
    ping(&client).unwrap();
    let connects = cluster.connects(&host("a"));

    client.reset().unwrap();
    cluster.fail_authentications(1);
    ping(&client).unwrap();
    assert_eq!(2, cluster.authentications());
    // The socket that failed was replaced.
    assert_eq!(connects + 2, cluster.connects(&host("a")));
}

#[test]
fn repeated_network_errors_during_replay_surface_auto_reconnect() {
    let (cluster, client) = client();
    client.cache_credential("test", credential("pencil")).unwrap();
    cluster.fail_authentications(2);

    assert_matches!(ping(&client), Err(AutoReconnect(_)));
    let pool = client.pool(&host("a")).unwrap();
    assert_eq!(0, pool.in_use().unwrap());
    assert_eq!(0, pool.idle_count().unwrap());

    ping(&client).unwrap();
    assert_eq!(1, cluster.authentications());
}

#[test]
fn logout_drops_socket_authentication() {
    let (cluster, client) = client();
    client.authenticate("test", credential("pencil")).unwrap();

    client.logout("test").unwrap();
    ping(&client).unwrap();
    assert_eq!(1, cluster.logouts());

    ping(&client).unwrap();
    assert_eq!(1, cluster.logouts());
    assert_eq!(1, cluster.authentications());
}

#[test]
fn credentials_require_an_authenticator() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add(&host("a"), standalone());
    let client = Client::with_connector(vec![host("a")], fast_options(), cluster.connector()).unwrap();
    assert!(client.cache_credential("test", credential("pencil")).is_err());
}
