use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use skv_client::execution::{share_command, Execution};
use skv_client::sync::WaitGroup;
use skv_client::{
    Cluster, ClusterOptions, ClusterState, ConnectionOptions, Node, NodeOptions, NodeState,
};
use skv_common::{frame, PingCommand, SkvError, PING_RESP_CODE};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Replies to every ping request on every accepted socket.
fn spawn_ping_server() -> String {
    spawn_server(|stream| {
        let mut request = [0u8; 5];
        while stream.read_exact(&mut request).is_ok() {
            let resp = frame::encode(PING_RESP_CODE, &[]);
            if stream.write_all(&resp).is_err() {
                return;
            }
        }
    })
}

// Replies to every request with the same server-side rejection.
fn spawn_error_server(code: u32, message: &'static str) -> String {
    spawn_server(move |stream| {
        let mut request = [0u8; 5];
        while stream.read_exact(&mut request).is_ok() {
            let resp = frame::encode_server_error(code, message);
            if stream.write_all(&resp).is_err() {
                return;
            }
        }
    })
}

// Accepts, reads one request, then drops the socket without replying.
fn spawn_closing_server() -> String {
    spawn_server(|stream| {
        let mut request = [0u8; 5];
        let _ = stream.read_exact(&mut request);
    })
}

fn spawn_server<F>(handler: F) -> String
where
    F: Fn(&mut TcpStream) + Send + Sync + Clone + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            let handler = handler.clone();
            thread::spawn(move || handler(&mut stream));
        }
    });
    addr
}

// Binds then releases a port so connects on it are refused.
fn unreachable_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);
    addr
}

fn node(addr: String, min: usize, max: usize) -> Node {
    Node::new(NodeOptions {
        conn: ConnectionOptions {
            addr,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_millis(500),
            ..ConnectionOptions::default()
        },
        min_connections: min,
        max_connections: max,
        ..NodeOptions::default()
    })
    .expect("node")
}

#[test]
fn ping_round_trip_through_cluster() {
    init_tracing();
    let cluster = Cluster::new(
        vec![node(spawn_ping_server(), 1, 4)],
        ClusterOptions::default(),
    )
    .expect("cluster");
    cluster.start().expect("start");
    assert_eq!(cluster.state(), ClusterState::Running);

    let ping = share_command(PingCommand::new());
    cluster.execute(ping.clone()).expect("execute");
    assert!(ping.lock().successful());

    cluster.stop().expect("stop");
    assert_eq!(cluster.state(), ClusterState::Shutdown);
}

#[test]
fn server_rejection_is_not_redispatched() {
    init_tracing();
    let cluster = Cluster::new(
        vec![node(spawn_error_server(42, "bad request"), 1, 2)],
        ClusterOptions::default(),
    )
    .expect("cluster");
    cluster.start().expect("start");

    let err = cluster
        .execute(share_command(PingCommand::new()))
        .unwrap_err();
    assert_eq!(
        err,
        SkvError::ServerError {
            code: 42,
            message: "bad request".to_string()
        }
    );

    // A whole error frame was consumed; the connection stays pooled and the
    // next command reuses it.
    assert_eq!(cluster.nodes()[0].connection_count(), 1);
    let err = cluster
        .execute(share_command(PingCommand::new()))
        .unwrap_err();
    assert!(matches!(err, SkvError::ServerError { code: 42, .. }));
    assert_eq!(cluster.nodes()[0].connection_count(), 1);

    cluster.stop().expect("stop");
}

#[test]
fn retry_avoids_the_failing_node() {
    init_tracing();
    // The cursor starts at the first node, which kills the socket mid-command.
    let flaky = node(spawn_closing_server(), 0, 2);
    let healthy = node(spawn_ping_server(), 0, 2);
    let cluster = Cluster::new(vec![flaky, healthy], ClusterOptions::default()).expect("cluster");
    cluster.start().expect("start");

    let ping = share_command(PingCommand::new());
    cluster.execute(ping.clone()).expect("retry should succeed");
    assert!(ping.lock().successful());
    assert!(ping.lock().remaining_tries() < skv_common::DEFAULT_REMAINING_TRIES);

    cluster.stop().expect("stop");
}

#[test]
fn concurrent_submissions_stay_within_pool_cap() {
    init_tracing();
    let cluster = Cluster::new(
        vec![node(spawn_ping_server(), 32, 64)],
        ClusterOptions::default(),
    )
    .expect("cluster");
    cluster.start().expect("start");

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let cluster = cluster.clone();
            thread::spawn(move || {
                let ping = share_command(PingCommand::new());
                cluster.execute(ping.clone())?;
                assert!(ping.lock().successful());
                Ok::<(), SkvError>(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join").expect("execute");
    }

    let count = cluster.nodes()[0].connection_count();
    assert!(count >= 32 && count <= 64, "connection count {count}");

    cluster.stop().expect("stop");
}

#[test]
fn shutdown_drains_deferred_submissions() {
    init_tracing();
    // A refused endpoint drives the node into health checking, so every
    // submission lands on the deferred queue.
    let cluster = Cluster::new(
        vec![node(unreachable_addr(), 0, 1)],
        ClusterOptions::default(),
    )
    .expect("cluster");
    cluster.start().expect("start");

    let wg = WaitGroup::new();
    let (tx, rx) = mpsc::channel();
    for _ in 0..3 {
        let exec = Execution::new(share_command(PingCommand::new()))
            .with_channel(tx.clone())
            .with_wait_group(wg.clone());
        cluster.execute_async(exec).expect("submit");
    }
    drop(tx);

    // Let the submissions fail their first dispatch and defer. The queue
    // worker may be holding one descriptor between re-attempts, so only a
    // lower bound is stable.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while (cluster.nodes()[0].state() != NodeState::HealthChecking
        || cluster.queued_count() == 0)
        && std::time::Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(cluster.queued_count() >= 1, "submissions never deferred");

    cluster.stop().expect("stop");
    assert!(wg.wait_timeout(Duration::from_secs(1)));

    let mut completions = 0;
    while let Ok((cmd, error)) = rx.recv() {
        completions += 1;
        assert!(!cmd.lock().successful());
        assert_eq!(error, Some(SkvError::ClusterShuttingDown));
    }
    assert_eq!(completions, 3);

    let err = cluster
        .execute(share_command(PingCommand::new()))
        .unwrap_err();
    assert_eq!(err, SkvError::ClusterShuttingDown);
}
