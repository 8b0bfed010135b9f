//! End-to-end tests driving a real server over real WebSocket clients.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use tether_client::{Client, ClientConfig, ConnectError};
use tether_rpc::errors::{CallError, RpcFault};
use tether_rpc::schema::{EventDef, MethodDef};
use tether_rpc::transport::ConnectionId;
use tether_server::{PeerContext, Server};
use tether_ws::WsListener;

const HELLO: MethodDef<String, String> = MethodDef::new("Hello");
const SET_VALUE: MethodDef<i64, ()> = MethodDef::new("set-value");
const GET_VALUE: MethodDef<(), i64> = MethodDef::new("get-value");
const FIND_USER: MethodDef<String, User> = MethodDef::new("FindUser");
const STALL: MethodDef<(), ()> = MethodDef::new("stall");
const TEST_EVENT: EventDef<String> = EventDef::new("test");

#[derive(Clone, Debug, Serialize, Deserialize)]
struct User {
    firstname: String,
    lastname: String,
    age: i64,
    friends: Vec<User>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Bind a server on an ephemeral port and hand back its WS endpoint.
async fn boot_server<S, F>(session_init: F) -> (Server<S>, String)
where
    S: Send + 'static,
    F: Fn(ConnectionId) -> S + Send + Sync + 'static,
{
    init_tracing();
    let listener = WsListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr());
    let server = Server::new(listener, move |id, _link, _info| session_init(id));
    (server, endpoint)
}

async fn connect_client(endpoint: &str) -> Client {
    let client = Client::new(endpoint);
    client.connect().await.unwrap();
    client
}

/// The accept loop registers the connection an instant after the client's
/// handshake resolves; wait for the table to catch up.
async fn wait_for_connections<S: Send + 'static>(server: &Server<S>, count: usize) {
    for _ in 0..2000 {
        if server.connection_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("server never reached {count} connections");
}

// ── Calls in both directions ────────────────────────────────────────

#[tokio::test]
async fn client_to_server_and_server_to_client_rpc() {
    let (server, endpoint) = boot_server(|_| ()).await;

    server.on_method(&HELLO, |name: String, _ctx| async move {
        Ok(format!("Hello, {name} from the server!"))
    });

    let client = connect_client(&endpoint).await;
    client.on_method(&HELLO, |name: String, _ctx| async move {
        Ok(format!("Hello, {name} from a client!"))
    });
    wait_for_connections(&server, 1).await;

    let reply = client.call(&HELLO, "UNIVERSE".to_owned()).await.unwrap();
    assert_eq!(reply, "Hello, UNIVERSE from the server!");

    let link = server.connection(ConnectionId::new(0)).unwrap();
    let reply = server.call(&link, &HELLO, "UNIVERSE".to_owned()).await.unwrap();
    assert_eq!(reply, "Hello, UNIVERSE from a client!");

    server.close();
    client.close().await;
}

#[tokio::test]
async fn events_flow_in_both_directions() {
    let (server, endpoint) = boot_server(|_| ()).await;

    let counter = Arc::new(AtomicUsize::new(0));
    let value = "xyz";

    let server_counter = Arc::clone(&counter);
    server.on_event(&TEST_EVENT, move |data: String, _ctx| {
        let counter = Arc::clone(&server_counter);
        async move {
            if data == value {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let client = connect_client(&endpoint).await;
    let client_counter = Arc::clone(&counter);
    client.on_event(&TEST_EVENT, move |data: String, _ctx| {
        let counter = Arc::clone(&client_counter);
        async move {
            if data == value {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    wait_for_connections(&server, 1).await;

    client.send_event(&TEST_EVENT, value.to_owned()).await.unwrap();
    let link = server.connection(ConnectionId::new(0)).unwrap();
    server.send_event(&link, &TEST_EVENT, value.to_owned()).await.unwrap();

    for _ in 0..2000 {
        if counter.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    server.close();
    client.close().await;
}

// ── Sessions ────────────────────────────────────────────────────────

#[tokio::test]
async fn session_state_survives_between_calls() {
    let (server, endpoint) = boot_server(|_| 0_i64).await;

    server.on_method(&SET_VALUE, |value: i64, ctx: PeerContext<i64>| async move {
        *ctx.session.lock() = value;
        Ok(())
    });
    server.on_method(&GET_VALUE, |(), ctx: PeerContext<i64>| async move {
        Ok(*ctx.session.lock())
    });

    let client = connect_client(&endpoint).await;
    client.call(&SET_VALUE, 42).await.unwrap();
    assert_eq!(client.call(&GET_VALUE, ()).await.unwrap(), 42);

    server.close();
    client.close().await;
}

#[tokio::test]
async fn sessions_do_not_leak_between_clients() {
    let (server, endpoint) = boot_server(|_| 0_i64).await;

    server.on_method(&SET_VALUE, |value: i64, ctx: PeerContext<i64>| async move {
        *ctx.session.lock() = value;
        Ok(())
    });
    server.on_method(&GET_VALUE, |(), ctx: PeerContext<i64>| async move {
        Ok(*ctx.session.lock())
    });

    let first = connect_client(&endpoint).await;
    let second = connect_client(&endpoint).await;
    wait_for_connections(&server, 2).await;

    first.call(&SET_VALUE, 42).await.unwrap();
    assert_eq!(first.call(&GET_VALUE, ()).await.unwrap(), 42);
    assert_eq!(second.call(&GET_VALUE, ()).await.unwrap(), 0);

    server.close();
    first.close().await;
    second.close().await;
}

// ── Error paths ─────────────────────────────────────────────────────

#[tokio::test]
async fn unregistered_method_rejects_with_not_implemented() {
    let (server, endpoint) = boot_server(|_| ()).await;
    let client = connect_client(&endpoint).await;

    let err = client.call(&HELLO, "anyone?".to_owned()).await.unwrap_err();
    match err {
        CallError::Fault(fault) => assert!(fault.code.contains("not implemented")),
        other => panic!("expected rpc fault, got {other:?}"),
    }

    server.close();
    client.close().await;
}

#[tokio::test]
async fn handler_fault_code_is_delivered_to_the_caller() {
    let (server, endpoint) = boot_server(|_| ()).await;
    server.on_method(&HELLO, |_name: String, _ctx| async move {
        Err::<String, _>(RpcFault::new("greeting quota exceeded"))
    });

    let client = connect_client(&endpoint).await;
    let err = client.call(&HELLO, "x".to_owned()).await.unwrap_err();
    match err {
        CallError::Fault(fault) => assert_eq!(fault.code, "greeting quota exceeded"),
        other => panic!("expected rpc fault, got {other:?}"),
    }

    server.close();
    client.close().await;
}

#[tokio::test]
async fn stalled_handler_times_out_after_the_configured_delay() {
    let (server, endpoint) = boot_server(|_| ()).await;
    server.on_method(&STALL, |(), _ctx| async move {
        std::future::pending::<()>().await;
        Ok(())
    });

    let timeout = Duration::from_millis(250);
    let mut config = ClientConfig::new(endpoint);
    config.method_timeout = timeout;
    let client = Client::with_config(config);
    client.connect().await.unwrap();

    let started = Instant::now();
    let err = client.call(&STALL, ()).await.unwrap_err();
    assert!(matches!(err, CallError::Timeout));
    assert!(started.elapsed() >= timeout, "timed out too early");

    server.close();
    client.close().await;
}

#[tokio::test]
async fn malformed_input_is_survived_and_answered_around() {
    let (server, endpoint) = boot_server(|_| ()).await;
    server.on_method(&HELLO, |name: String, _ctx| async move {
        Ok(format!("Hello, {name} from the server!"))
    });

    // Speak the wire format by hand, garbage first.
    let (ws, _) = connect_async(&endpoint).await.unwrap();
    let (mut tx, mut rx) = ws.split();
    tx.send(Message::Text("definitely not json".into())).await.unwrap();
    tx.send(Message::Text(r#"{"kind":9,"content":null}"#.into())).await.unwrap();
    tx.send(Message::Text(
        r#"{"kind":0,"content":{"sequence":0,"name":"Hello","payload":"resilient"}}"#.into(),
    ))
    .await
    .unwrap();

    let reply = loop {
        if let Message::Text(text) = rx.next().await.unwrap().unwrap() {
            break text.to_string();
        }
    };
    let parsed: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(parsed["kind"], 1);
    assert_eq!(parsed["content"]["sequence"], 0);
    assert_eq!(parsed["content"]["payload"], "Hello, resilient from the server!");

    server.close();
}

// ── Composite payloads ──────────────────────────────────────────────

#[tokio::test]
async fn nested_payloads_round_trip_without_loss() {
    let (server, endpoint) = boot_server(|_| ()).await;

    server.on_method(&FIND_USER, |username: String, _ctx| async move {
        let users = vec![
            User {
                firstname: "Madoka".into(),
                lastname: "Kaname".into(),
                age: 14,
                friends: Vec::new(),
            },
            User {
                firstname: "Homura".into(),
                lastname: "Akemi".into(),
                age: 14,
                friends: Vec::new(),
            },
        ];
        let mut found = users
            .iter()
            .find(|u| format!("{} {}", u.firstname, u.lastname) == username)
            .cloned()
            .ok_or_else(|| RpcFault::new("user not found"))?;
        found.friends = vec![users[0].clone()];
        Ok(found)
    });

    let client = connect_client(&endpoint).await;
    let user = client.call(&FIND_USER, "Homura Akemi".to_owned()).await.unwrap();
    assert_eq!(user.firstname, "Homura");
    assert_eq!(user.friends[0].firstname, "Madoka");

    server.close();
    client.close().await;
}

// ── Broadcast ───────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_reaches_all_connected_clients() {
    let (server, endpoint) = boot_server(|_| ()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let clients = {
        let mut clients = Vec::new();
        for label in ["a", "b", "c"] {
            let client = connect_client(&endpoint).await;
            let sink = Arc::clone(&seen);
            let label = label.to_owned();
            client.on_event(&TEST_EVENT, move |data: String, _ctx| {
                let sink = Arc::clone(&sink);
                let label = label.clone();
                async move { sink.lock().push((label, data)) }
            });
            clients.push(client);
        }
        clients
    };
    wait_for_connections(&server, 3).await;

    server.broadcast_event(&TEST_EVENT, "everyone".to_owned()).await;

    for _ in 0..2000 {
        if seen.lock().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let mut observed = seen.lock().clone();
    observed.sort();
    assert_eq!(
        observed,
        vec![
            ("a".to_owned(), "everyone".to_owned()),
            ("b".to_owned(), "everyone".to_owned()),
            ("c".to_owned(), "everyone".to_owned()),
        ]
    );

    server.close();
    for client in clients {
        client.close().await;
    }
}

// ── Connect lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn connect_twice_is_rejected() {
    let (server, endpoint) = boot_server(|_| ()).await;
    let client = connect_client(&endpoint).await;

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::AlreadyConnected));

    server.close();
    client.close().await;
}

#[tokio::test]
async fn diagnostic_hooks_see_raw_traffic() {
    let (server, endpoint) = boot_server(|_| ()).await;
    server.on_method(&HELLO, |name: String, _ctx| async move { Ok(name) });

    let sent = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::new(Mutex::new(Vec::new()));
    let mut config = ClientConfig::new(endpoint);
    let sent_sink = Arc::clone(&sent);
    config.log_send = Some(Arc::new(move |text| sent_sink.lock().push(text.to_owned())));
    let received_sink = Arc::clone(&received);
    config.log_receive = Some(Arc::new(move |text| received_sink.lock().push(text.to_owned())));

    let client = Client::with_config(config);
    client.connect().await.unwrap();

    let _ = client.call(&HELLO, "observed".to_owned()).await.unwrap();

    assert_eq!(sent.lock().len(), 1);
    assert!(sent.lock()[0].contains("observed"));
    assert_eq!(received.lock().len(), 1);
    assert!(received.lock()[0].contains("observed"));

    server.close();
    client.close().await;
}
