//! End-to-end tests over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use duplex_core::RpcError;
use duplex_core::errors::METHOD_NOT_FOUND;
use duplex_rpc::server::plugins::{AuthenticationSkip, AuthorizeAll};
use duplex_rpc::{CallEngine, DispatchEngine, Endpoint, Router, TransportPlugin, handler_fn};
use duplex_settings::{ClientSettings, ServerSettings};
use duplex_ws::{DuplexServer, KEEP_ALIVE_TIMEOUT, ReadyState, ReconnectingTransport};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);

fn open_dispatcher(endpoints: Vec<Endpoint>) -> Arc<DispatchEngine> {
    let dispatcher = Arc::new(DispatchEngine::new());
    for endpoint in endpoints {
        dispatcher.register_endpoint(Arc::new(endpoint)).unwrap();
    }
    dispatcher.add_plugin(Arc::new(AuthenticationSkip)).unwrap();
    dispatcher.add_plugin(Arc::new(AuthorizeAll)).unwrap();
    dispatcher
}

/// Boot a listener on an ephemeral port.
async fn boot(endpoints: Vec<Endpoint>, settings: ServerSettings) -> (DuplexServer, SocketAddr) {
    let server = DuplexServer::new(settings, Router::new(open_dispatcher(endpoints)));
    let addr = server.listen().await.unwrap();
    (server, addr)
}

fn client_settings() -> ClientSettings {
    ClientSettings {
        auto_reconnect: true,
        ready_timeout_ms: 5_000,
        reconnect_delay_ms: 100,
        keep_alive_ms: None,
    }
}

fn client(url: String) -> (CallEngine, Arc<ReconnectingTransport>) {
    let transport = ReconnectingTransport::websocket(url, client_settings());
    (CallEngine::with_transport(transport.clone()), transport)
}

fn main_endpoint() -> Endpoint {
    Endpoint::new("main", "/")
        .with_method(
            "ping",
            handler_fn(|_, params| async move { Ok(params.into_iter().next().unwrap_or(Value::Null)) }),
        )
        .with_method("who", handler_fn(|_, _| async { Ok(json!("main")) }))
        .with_method(
            "greet",
            handler_fn(|ctx, _| async move {
                let name = ctx.reverse_client()?.call("name", vec![]).await?;
                Ok::<_, RpcError>(json!(format!("hello {}", name.as_str().unwrap_or("?"))))
            }),
        )
        .with_method(
            "hang",
            handler_fn(|_, _| async {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }),
        )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn ping_over_a_real_socket() {
    let (_server, addr) = boot(vec![main_endpoint()], ServerSettings::default()).await;
    let (engine, transport) = client(format!("ws://{addr}/"));

    let out = timeout(TIMEOUT, engine.call("ping", vec![json!("hello"), json!(false)]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out, json!("hello"));
    assert_eq!(transport.ready_state(), ReadyState::Open);
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let (_server, addr) = boot(vec![main_endpoint()], ServerSettings::default()).await;
    let (engine, _transport) = client(format!("ws://{addr}/"));

    let err = timeout(TIMEOUT, engine.call("missing", vec![]))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code, METHOD_NOT_FOUND);
}

#[tokio::test]
async fn request_path_selects_the_endpoint() {
    let admin = Endpoint::new("admin", "/admin").with_method("who", handler_fn(|_, _| async { Ok(json!("admin")) }));
    let (_server, addr) = boot(vec![main_endpoint(), admin], ServerSettings::default()).await;

    let (main, _t1) = client(format!("ws://{addr}/"));
    let (admin, _t2) = client(format!("ws://{addr}/admin"));
    let (nowhere, _t3) = client(format!("ws://{addr}/nowhere"));

    assert_eq!(main.call("who", vec![]).await.unwrap(), json!("main"));
    assert_eq!(admin.call("who", vec![]).await.unwrap(), json!("admin"));
    let err = nowhere.call("who", vec![]).await.unwrap_err();
    assert_eq!(err.code, METHOD_NOT_FOUND);
}

#[tokio::test]
async fn server_calls_back_into_the_client() {
    let (_server, addr) = boot(vec![main_endpoint()], ServerSettings::default()).await;
    let (engine, transport) = client(format!("ws://{addr}/"));

    let client_side = Router::new(open_dispatcher(vec![Endpoint::new("client", "/").with_method(
        "name",
        handler_fn(|_, _| async { Ok(json!("alice")) }),
    )]));
    transport.attach_router(client_side, "/", &engine).unwrap();

    let out = timeout(TIMEOUT, engine.call("greet", vec![])).await.unwrap().unwrap();
    assert_eq!(out, json!("hello alice"));
}

#[tokio::test]
async fn closing_one_side_rejects_the_other_sides_pending_calls() {
    let (relayed_tx, mut relayed_rx) = mpsc::unbounded_channel::<Result<Value, RpcError>>();
    let relay = Endpoint::new("main", "/").with_method(
        "relay",
        handler_fn(move |ctx, _| {
            let relayed_tx = relayed_tx.clone();
            async move {
                let outcome = ctx.reverse_client()?.call("hang", vec![]).await;
                let _ = relayed_tx.send(outcome);
                Ok::<_, RpcError>(Value::Null)
            }
        }),
    );
    let (server, addr) = boot(vec![relay], ServerSettings::default()).await;
    let (engine, transport) = client(format!("ws://{addr}/"));

    let client_side = Router::new(open_dispatcher(vec![Endpoint::new("client", "/").with_method(
        "hang",
        handler_fn(|_, _| async {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }),
    )]));
    transport.attach_router(client_side, "/", &engine).unwrap();

    let call = tokio::spawn({
        let engine = engine.clone();
        async move { engine.call("relay", vec![]).await }
    });

    // Both pending tables hold one call: ours for `relay`, the server's
    // reverse engine for `hang`.
    wait_until(|| server.router().session_count() == 1).await;
    let conn = server.router().connection_ids()[0];
    let reverse = server.router().reverse_client(conn).unwrap().transport().unwrap();
    wait_until(|| reverse.pending_count() == 1 && transport.pending_count() == 1).await;

    transport.close("client leaving").await;

    let ours = timeout(TIMEOUT, call).await.unwrap().unwrap().unwrap_err();
    assert!(ours.is_network(), "unexpected error: {ours:?}");
    let theirs = timeout(TIMEOUT, relayed_rx.recv()).await.unwrap().unwrap().unwrap_err();
    assert!(theirs.is_network(), "unexpected error: {theirs:?}");
    assert_eq!(reverse.pending_count(), 0);
    wait_until(|| server.router().session_count() == 0).await;
}

#[tokio::test]
async fn server_side_close_rejects_then_client_reconnects() {
    let (server, addr) = boot(vec![main_endpoint()], ServerSettings::default()).await;
    let (engine, transport) = client(format!("ws://{addr}/"));

    let hanging = tokio::spawn({
        let engine = engine.clone();
        async move { engine.call("hang", vec![]).await }
    });
    wait_until(|| transport.pending_count() == 1 && server.router().session_count() == 1).await;
    let conn = server.router().connection_ids()[0];
    assert!(server.router().close(conn, "kicked").await);

    let err = timeout(TIMEOUT, hanging).await.unwrap().unwrap().unwrap_err();
    assert!(err.is_network());
    assert!(err.message.contains("kicked"), "unexpected message: {}", err.message);

    let out = timeout(TIMEOUT, engine.call("ping", vec![json!(2)])).await.unwrap().unwrap();
    assert_eq!(out, json!(2));
    assert_eq!(transport.connections_opened().await, 2);
}

#[tokio::test]
async fn keep_alive_closes_a_silent_channel() {
    // A peer that completes the handshake and then never reads again.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _peer = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let _socket = tokio_tungstenite::accept_async(tcp).await.unwrap();
        std::future::pending::<()>().await;
    });

    let transport = ReconnectingTransport::websocket(
        format!("ws://{addr}/"),
        ClientSettings {
            keep_alive_ms: Some(200),
            ..client_settings()
        },
    );
    let engine = CallEngine::with_transport(transport.clone());

    let err = timeout(Duration::from_secs(3), engine.call("ping", vec![]))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_network());
    assert!(err.message.contains(KEEP_ALIVE_TIMEOUT), "unexpected message: {}", err.message);
    assert_eq!(transport.ready_state(), ReadyState::Disconnected);
}

#[tokio::test]
async fn server_keep_alive_drops_a_silent_client() {
    let settings = ServerSettings {
        keep_alive_ms: Some(200),
        ..ServerSettings::default()
    };
    let (server, addr) = boot(vec![main_endpoint()], settings).await;

    // Connect and then never poll the socket, so pings go unanswered.
    let (_socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .unwrap();
    wait_until(|| server.router().session_count() == 1).await;
    wait_until(|| server.router().session_count() == 0).await;
    wait_until(|| server.connection_count() == 0).await;
}

#[tokio::test]
async fn connection_limit_refuses_extra_upgrades() {
    let settings = ServerSettings {
        max_connections: 1,
        ..ServerSettings::default()
    };
    let (server, addr) = boot(vec![main_endpoint()], settings).await;

    let (first, _t1) = client(format!("ws://{addr}/"));
    assert_eq!(first.call("ping", vec![json!(1)]).await.unwrap(), json!(1));
    wait_until(|| server.connection_count() == 1).await;

    let (second, _t2) = client(format!("ws://{addr}/"));
    let err = timeout(TIMEOUT, second.call("ping", vec![])).await.unwrap().unwrap_err();
    assert!(err.is_network());
}

#[tokio::test]
async fn concurrent_upgrades_never_exceed_the_limit() {
    let settings = ServerSettings {
        max_connections: 2,
        ..ServerSettings::default()
    };
    let (server, addr) = boot(vec![main_endpoint()], settings).await;

    let url = format!("ws://{addr}/");
    let attempts = (0..6).map(|_| tokio_tungstenite::connect_async(url.clone()));
    let results = timeout(TIMEOUT, futures::future::join_all(attempts)).await.unwrap();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    wait_until(|| server.router().session_count() == 2).await;
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn stop_rejects_client_calls_and_refuses_new_ones() {
    let (server, addr) = boot(vec![main_endpoint()], ServerSettings::default()).await;
    let (engine, transport) = client(format!("ws://{addr}/"));

    let hanging = tokio::spawn({
        let engine = engine.clone();
        async move { engine.call("hang", vec![]).await }
    });
    wait_until(|| transport.pending_count() == 1 && server.router().session_count() == 1).await;

    let report = timeout(TIMEOUT, server.stop()).await.unwrap();
    assert_eq!(report.sessions_closed, 1);

    let err = timeout(TIMEOUT, hanging).await.unwrap().unwrap().unwrap_err();
    assert!(err.is_network());
    let err = timeout(TIMEOUT, engine.call("ping", vec![])).await.unwrap().unwrap_err();
    assert!(err.is_network());
}
