use assert_matches::assert_matches;
use bson::{bson, doc};
use mongodb_topology::error::Error::{ConnectionFailure, Interrupted, OperationFailure};
use mongodb_topology::topology::selector::WritableServer;
use mongodb_topology::topology::server::ServerType;
use mongodb_topology::Client;

use crate::common::{fast_options, host, init_tracing, standalone, MockCluster};

use std::thread;
use std::time::{Duration, Instant};

fn standalone_client(options: mongodb_topology::ClientOptions) -> (MockCluster, Client) {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add(&host("a"), standalone());
    let client = Client::with_connector(vec![host("a")], options, cluster.connector()).unwrap();
    (cluster, client)
}

#[test]
fn exhausted_pool_times_out() {
    let options = fast_options()
        .with_max_pool_size(2)
        .with_wait_queue_timeout(Duration::from_millis(100));
    let (_cluster, client) = standalone_client(options);
    let pool = client.pool(&host("a")).unwrap();

    let _first = pool.acquire(None).unwrap();
    let _second = pool.acquire(None).unwrap();

    let start = Instant::now();
    assert_matches!(pool.acquire(None), Err(ConnectionFailure(_)));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(2, pool.in_use().unwrap());
}

#[test]
fn blocked_acquire_gets_released_connection() {
    let options = fast_options().with_max_pool_size(1);
    let (_cluster, client) = standalone_client(options);
    let pool = client.pool(&host("a")).unwrap();

    let held = pool.acquire(None).unwrap();
    let id = held.id();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.acquire(None).map(|conn| conn.id()))
    };

    thread::sleep(Duration::from_millis(50));
    drop(held);
    assert_eq!(id, waiter.join().unwrap().unwrap());
}

#[test]
fn waiter_bound_fails_fast() {
    let options = fast_options()
        .with_max_pool_size(1)
        .with_wait_queue_multiple(1)
        .with_wait_queue_timeout(Duration::from_secs(5));
    let (_cluster, client) = standalone_client(options);
    let pool = client.pool(&host("a")).unwrap();
    assert_eq!(Some(1), pool.max_waiters());

    let held = pool.acquire(None).unwrap();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.acquire(None).is_ok())
    };
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    assert_matches!(pool.acquire(None), Err(ConnectionFailure(_)));
    assert!(start.elapsed() < Duration::from_secs(1));

    drop(held);
    assert!(waiter.join().unwrap());
}

#[test]
fn operation_failure_keeps_connection() {
    let (_cluster, client) = standalone_client(fast_options());
    let pool = client.pool(&host("a")).unwrap();

    let id = client
        .execute(None, &WritableServer, "test", |conn| Ok(conn.id()))
        .unwrap();

    let result = client.command(
        None,
        &WritableServer,
        "test",
        doc! { "fail": 11000, "errmsg": "E11000 duplicate key error" },
    );
    assert_matches!(result, Err(OperationFailure { code: 11000, .. }));

    assert_eq!(vec![id], pool.idle_connection_ids().unwrap());
    assert_eq!(0, pool.in_use().unwrap());
}

#[test]
fn network_failure_discards_connection() {
    let (cluster, client) = standalone_client(fast_options().with_max_pool_size(1));
    let pool = client.pool(&host("a")).unwrap();

    let id = client
        .execute(None, &WritableServer, "test", |conn| Ok(conn.id()))
        .unwrap();

    cluster.break_connections(&host("a"));
    let result = client.command(None, &WritableServer, "test", doc! { "ping": 1 });
    assert_matches!(result, Err(ConnectionFailure(_)));
    assert!(!pool.idle_connection_ids().unwrap().contains(&id));
    assert_eq!(0, pool.in_use().unwrap());

    // The only permit came back, so the next operation gets a new socket.
    let next = client
        .execute(None, &WritableServer, "test", |conn| Ok(conn.id()))
        .unwrap();
    assert_ne!(id, next);
}

#[test]
fn interrupted_read_discards_connection() {
    let (cluster, client) = standalone_client(fast_options());
    let pool = client.pool(&host("a")).unwrap();

    let id = client
        .execute(None, &WritableServer, "test", |conn| Ok(conn.id()))
        .unwrap();

    cluster.interrupt_next(&host("a"));
    let result = client.command(None, &WritableServer, "test", doc! { "ping": 1 });
    assert_matches!(result, Err(Interrupted(_)));
    assert_eq!(0, pool.idle_count().unwrap());
    assert_eq!(
        ServerType::Standalone,
        client.topology_description().server(&host("a")).unwrap().server_type
    );

    let next = client
        .execute(None, &WritableServer, "test", |conn| Ok(conn.id()))
        .unwrap();
    assert_ne!(id, next);
}

#[test]
fn concurrent_operations_respect_pool_size() {
    let options = fast_options().with_max_pool_size(3);
    let (cluster, client) = standalone_client(options);

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    client
                        .execute(None, &WritableServer, "test", |conn| {
                            thread::sleep(Duration::from_millis(1));
                            conn.command("test", doc! { "ping": 1 })
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let pool = client.pool(&host("a")).unwrap();
    assert_eq!(0, pool.in_use().unwrap());
    assert!(pool.idle_count().unwrap() <= 3);
    // One monitoring socket plus at most three pooled ones.
    assert!(cluster.connects(&host("a")) <= 4);
}
