// Copyright 2020 Joyent, Inc.

use std::env;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;

use fast_messages::client::{ClientConfig, ClientEvent, StreamClient};
use fast_messages::message::Event;
use fast_messages::rpc::RpcConnection;
use fast_messages::server::{Server, ServerConfig};

fn test_log() -> Logger {
    let level = match env::var("LOG_LEVEL").ok() {
        None => Level::Critical,
        Some(ref s) if s == "fatal" => Level::Critical,
        Some(s) => s.parse::<Level>().unwrap_or(Level::Critical),
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    )
}

fn server_config(server_id: &str) -> ServerConfig {
    ServerConfig {
        server_id: server_id.to_string(),
        log: Some(test_log()),
    }
}

fn client_config(client_id: &str, port: u16) -> ClientConfig {
    ClientConfig {
        client_id: client_id.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        log: Some(test_log()),
    }
}

async fn wait_for<F>(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    what: &str,
    mut pred: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    loop {
        let event = time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
            .unwrap_or_else(|| {
                panic!("event channel closed waiting for {}", what)
            });
        if pred(&event) {
            return event;
        }
    }
}

// Collect every event up to and including the first one matching `pred`.
async fn collect_until<F>(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    what: &str,
    mut pred: F,
) -> Vec<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
            .unwrap_or_else(|| {
                panic!("event channel closed waiting for {}", what)
            });
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn next_message(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    what: &str,
) -> Event {
    match wait_for(events, what, |e| matches!(e, ClientEvent::Message(_)))
        .await
    {
        ClientEvent::Message(event) => event,
        _ => unreachable!(),
    }
}

async fn start_client(
    client: &StreamClient,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
) {
    client.connect();
    wait_for(events, "connect", |e| matches!(e, ClientEvent::Connect)).await;
    client.start();
    wait_for(events, "start", |e| matches!(e, ClientEvent::Start)).await;
}

async fn wait_for_subscriptions(server: &Server, expected: usize) {
    for _ in 0..1000 {
        if server.state().clients.len() >= expected {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never reached {} subscriptions", expected);
}

#[tokio::test]
async fn broadcast_reaches_every_subscriber() {
    let server = Server::new(server_config("S"));
    let addr = server.listen(0).await.expect("listen failed");

    let (c1, mut e1) = StreamClient::new(client_config("agent-1", addr.port()));
    let (c2, mut e2) = StreamClient::new(client_config("agent-2", addr.port()));
    start_client(&c1, &mut e1).await;
    start_client(&c2, &mut e2).await;

    let state = server.state();
    assert_eq!(
        state.clients,
        vec!["agent-1".to_string(), "agent-2".to_string()]
    );
    assert_eq!(state.server_id, "S");

    let sync = c1.server_state().expect("sync record stored");
    assert_eq!(sync.server_id, "S");
    assert_eq!(sync.last_req_id, None);
    assert_eq!(sync.last_id, None);

    server
        .send(Event {
            id: Some(4),
            name: "update_name".to_string(),
            value: json!("foo"),
            req_id: Some("R".to_string()),
            server_id: None,
        })
        .expect("send failed");

    for events in vec![&mut e1, &mut e2] {
        let msg = next_message(events, "broadcast message").await;
        assert_eq!(msg.id, Some(4));
        assert_eq!(msg.name, "update_name");
        assert_eq!(msg.value, json!("foo"));
        assert_eq!(msg.req_id.as_deref(), Some("R"));
        assert_eq!(msg.server_id.as_deref(), Some("S"));
    }

    let state = server.state();
    assert_eq!(state.last_req_id.as_deref(), Some("R"));
    assert_eq!(state.last_id, Some(4));

    c1.close();
    c2.close();
    server.close().await;
}

#[tokio::test]
async fn missing_req_id_is_assigned_by_the_server() {
    let server = Server::new(server_config("S"));
    let addr = server.listen(0).await.expect("listen failed");

    let (client, mut events) =
        StreamClient::new(client_config("agent-1", addr.port()));
    start_client(&client, &mut events).await;

    server
        .send(Event::new("informational", json!(false)))
        .expect("send failed");

    let msg = next_message(&mut events, "broadcast message").await;
    let req_id = msg.req_id.expect("req_id stamped");
    assert!(!req_id.is_empty());
    assert_eq!(msg.value, json!(false));
    assert_eq!(msg.server_id.as_deref(), Some("S"));

    let state = server.state();
    assert_eq!(state.last_req_id, Some(req_id));
    assert_eq!(state.last_id, None);

    client.close();
    server.close().await;
}

#[tokio::test]
async fn ping_succeeds_against_a_running_server() {
    let server = Server::new(server_config("S"));
    let addr = server.listen(0).await.expect("listen failed");

    let (client, mut events) =
        StreamClient::new(client_config("agent-1", addr.port()));
    client.connect();
    wait_for(&mut events, "connect", |e| matches!(e, ClientEvent::Connect))
        .await;

    // A ping is valid as soon as the RPC connection exists, before start().
    client.ping().await.expect("ping before start failed");

    client.start();
    wait_for(&mut events, "start", |e| matches!(e, ClientEvent::Start)).await;
    client.ping().await.expect("ping after start failed");

    client.close();
    server.close().await;
}

#[tokio::test]
async fn ping_before_connection_established_fails() {
    // Bind then drop a listener to obtain a port that refuses connections.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("bind failed");
        listener.local_addr().expect("local addr").port()
    };

    let (client, mut events) = StreamClient::new(client_config("lonely", port));
    client.connect();

    let err = client.ping().await.expect_err("ping must fail");
    assert_eq!(err.to_string(), "stream not connected");

    client.close();
    wait_for(&mut events, "close", |e| matches!(e, ClientEvent::Close)).await;
}

#[tokio::test]
async fn replacement_client_with_same_id_receives_broadcasts() {
    let server = Server::new(server_config("S"));
    let addr = server.listen(0).await.expect("listen failed");

    let (old, mut old_events) =
        StreamClient::new(client_config("C", addr.port()));
    start_client(&old, &mut old_events).await;

    old.close();
    wait_for(&mut old_events, "close", |e| matches!(e, ClientEvent::Close))
        .await;

    let (new, mut new_events) =
        StreamClient::new(client_config("C", addr.port()));
    start_client(&new, &mut new_events).await;

    server
        .send(Event {
            id: Some(5),
            name: "informational".to_string(),
            value: json!({"a": 5, "b": "12"}),
            req_id: Some("R2".to_string()),
            server_id: None,
        })
        .expect("send failed");

    let msg = next_message(&mut new_events, "broadcast message").await;
    assert_eq!(msg.id, Some(5));
    assert_eq!(msg.value, json!({"a": 5, "b": "12"}));
    assert_eq!(msg.req_id.as_deref(), Some("R2"));
    assert_eq!(msg.server_id.as_deref(), Some("S"));

    assert_eq!(server.state().clients, vec!["C".to_string()]);

    new.close();
    server.close().await;
}

#[tokio::test]
async fn duplicate_client_id_displaces_older_subscription() {
    let server = Server::new(server_config("S"));
    let addr = server.listen(0).await.expect("listen failed");

    let socket = TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .expect("connect failed");
    let conn1 = RpcConnection::start(socket, test_log());
    let mut call1 = conn1
        .call("messages", vec![json!({"client_id": "dup", "version": 1})])
        .expect("issue call");
    let sync1 = call1.next().await.expect("sync frame").expect("sync frame");
    assert_eq!(sync1.get("name"), Some(&json!("sync")));

    let socket = TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .expect("connect failed");
    let conn2 = RpcConnection::start(socket, test_log());
    let mut call2 = conn2
        .call("messages", vec![json!({"client_id": "dup", "version": 1})])
        .expect("issue call");
    let sync2 = call2.next().await.expect("sync frame").expect("sync frame");
    assert_eq!(sync2.get("name"), Some(&json!("sync")));

    // The older subscription's channel is ended; exactly one entry remains.
    assert_eq!(call1.next().await.expect("end of older call"), None);
    assert_eq!(server.state().clients, vec!["dup".to_string()]);

    conn1.shutdown();
    conn2.shutdown();
    server.close().await;
}

#[tokio::test]
async fn clients_reconnect_after_server_restart() {
    let server = Server::new(server_config("S1"));
    let addr = server.listen(0).await.expect("listen failed");

    let (c1, mut e1) = StreamClient::new(client_config("agent-1", addr.port()));
    let (c2, mut e2) = StreamClient::new(client_config("agent-2", addr.port()));
    start_client(&c1, &mut e1).await;
    start_client(&c2, &mut e2).await;

    server.close().await;

    for events in vec![&mut e1, &mut e2] {
        wait_for(events, "restart", |e| {
            matches!(e, ClientEvent::StateChanged("restart"))
        })
        .await;
    }

    let server = Server::new(server_config("S2"));
    server.listen(addr.port()).await.expect("rebind failed");

    for events in vec![&mut e1, &mut e2] {
        let seen = collect_until(events, "resubscription", |e| {
            matches!(e, ClientEvent::StateChanged("started.ready"))
        })
        .await;
        assert!(seen
            .iter()
            .any(|e| matches!(e, ClientEvent::StateChanged("connected"))));
        // connect and start fire at most once per client lifetime.
        assert!(!seen
            .iter()
            .any(|e| matches!(e, ClientEvent::Connect | ClientEvent::Start)));
    }

    server
        .send(Event {
            id: Some(9),
            name: "update_name".to_string(),
            value: json!("again"),
            req_id: Some("R3".to_string()),
            server_id: None,
        })
        .expect("send failed");

    for events in vec![&mut e1, &mut e2] {
        let msg = next_message(events, "post-restart message").await;
        assert_eq!(msg.id, Some(9));
        assert_eq!(msg.value, json!("again"));
        assert_eq!(msg.server_id.as_deref(), Some("S2"));
    }

    c1.close();
    c2.close();
    server.close().await;
}

#[tokio::test]
async fn rpc_argument_validation_errors_are_exact() {
    let server = Server::new(server_config("S"));
    let addr = server.listen(0).await.expect("listen failed");

    let socket = TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .expect("connect failed");
    let conn = RpcConnection::start(socket, test_log());

    let cases: Vec<(&str, Vec<serde_json::Value>, &str)> = vec![
        ("messages", vec![], r#""messages" RPC expects one argument"#),
        (
            "messages",
            vec![json!({"client_id": "x"}), json!({})],
            r#""messages" RPC expects one argument"#,
        ),
        (
            "messages",
            vec![json!("options")],
            r#""messages" RPC expects an options object"#,
        ),
        (
            "messages",
            vec![json!({"client_id": 42})],
            r#"clients must provide their "client_id""#,
        ),
        ("ping", vec![], r#""ping" RPC expects one argument"#),
        (
            "ping",
            vec![json!([])],
            r#""ping" RPC expects an options object"#,
        ),
        (
            "ping",
            vec![json!({"req_id": 99})],
            r#""req_id" must be a string if provided"#,
        ),
        ("bogus", vec![json!({})], "Unsupported function: bogus"),
    ];

    for (method, args, expected) in cases {
        let mut call = conn.call(method, args).expect("issue call");
        let err = loop {
            match call.next().await {
                Ok(Some(_)) => (),
                Ok(None) => panic!("expected {} to fail", method),
                Err(e) => break e,
            }
        };
        assert_eq!(err.to_string(), expected);
    }

    // A well-formed ping completes cleanly.
    conn.call_unary("ping", vec![json!({"req_id": "probe-1"})])
        .await
        .expect("ping failed");

    conn.shutdown();
    server.close().await;
}

#[tokio::test]
async fn sync_record_reflects_last_broadcast() {
    let server = Server::new(server_config("S"));
    let addr = server.listen(0).await.expect("listen failed");

    server
        .send(Event {
            id: Some(7),
            name: "update_name".to_string(),
            value: json!(1),
            req_id: Some("R0".to_string()),
            server_id: None,
        })
        .expect("send failed");

    let socket = TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .expect("connect failed");
    let conn = RpcConnection::start(socket, test_log());
    let mut call = conn
        .call("messages", vec![json!({"client_id": "late", "version": 1})])
        .expect("issue call");
    let sync = call.next().await.expect("sync frame").expect("sync frame");
    assert_eq!(sync.get("name"), Some(&json!("sync")));
    assert_eq!(sync.get("last_req_id"), Some(&json!("R0")));
    assert_eq!(sync.get("last_id"), Some(&json!(7)));
    assert_eq!(sync.get("server_id"), Some(&json!("S")));
    assert_eq!(sync.get("version"), Some(&json!(1)));

    // Subscribers that do not advertise a version get no sync record; their
    // first frame is the next broadcast.
    let socket = TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .expect("connect failed");
    let conn2 = RpcConnection::start(socket, test_log());
    let mut call2 = conn2
        .call("messages", vec![json!({"client_id": "legacy"})])
        .expect("issue call");
    wait_for_subscriptions(&server, 2).await;

    server
        .send(Event::new("informational", json!({"a": 1})))
        .expect("send failed");

    let first = call2.next().await.expect("event frame").expect("event frame");
    assert_eq!(first.get("name"), Some(&json!("informational")));
    assert_eq!(first.get("server_id"), Some(&json!("S")));

    conn.shutdown();
    conn2.shutdown();
    server.close().await;
}
