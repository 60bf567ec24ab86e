//! Wire-level lifecycle tests driving a responder session with scripted
//! frames over a raw in-memory transport

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::Config;
use crate::protocol::capabilities::{self, CapabilitySet, PeerInfo};
use crate::protocol::error_codes;
use crate::protocol::message::{decode, encode, Message, RequestId};
use crate::protocol::{self, methods};
use crate::rpc::dispatcher::{handler_fn, Dispatcher};
use crate::rpc::session::{Role, Session, SessionHandle, SessionOptions, SessionState};
use crate::transport::{InMemoryTransport, Transport};

fn test_config() -> Config {
    Config {
        handshake_timeout: Duration::from_secs(2),
        request_timeout: Some(Duration::from_secs(2)),
        drain_timeout: Duration::from_millis(500),
        ..Config::default()
    }
}

/// Spawn a responder session and hand back the scripted peer end.
fn spawn_responder(dispatcher: Arc<Dispatcher>) -> (InMemoryTransport, SessionHandle) {
    let (peer, server_t) = InMemoryTransport::pair();
    let (session, handle) = Session::new(
        Box::new(server_t),
        dispatcher,
        SessionOptions {
            role: Role::Responder,
            capabilities: CapabilitySet::new()
                .declare(capabilities::TOOLS)
                .declare(capabilities::RESOURCES),
            info: PeerInfo::new("scripted-host", "0.1.0"),
            config: test_config(),
        },
    );
    tokio::spawn(session.run());
    (peer, handle)
}

async fn send(peer: &mut InMemoryTransport, message: &Message) {
    peer.send(&encode(message).unwrap()).await.unwrap();
}

async fn recv(peer: &mut InMemoryTransport) -> Message {
    let frame = tokio::time::timeout(Duration::from_secs(2), peer.receive())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
        .expect("transport closed unexpectedly");
    decode(&frame).unwrap()
}

fn initialize_request(id: i64, version: &str) -> Message {
    Message::request(
        RequestId::Number(id),
        methods::INITIALIZE,
        Some(json!({
            "protocolVersion": version,
            "capabilities": {"tools": {}},
            "clientInfo": {"name": "scripted-client", "version": "0.0.1"}
        })),
    )
}

async fn handshake(peer: &mut InMemoryTransport) {
    send(peer, &initialize_request(1, protocol::LATEST_VERSION)).await;
    match recv(peer).await {
        Message::Response(r) => assert_eq!(r.id, RequestId::Number(1)),
        other => panic!("expected initialize response, got {:?}", other),
    }
    send(peer, &Message::notification(methods::INITIALIZED, None)).await;
}

#[tokio::test]
async fn responder_echoes_a_supported_requested_version() {
    let (mut peer, handle) = spawn_responder(Arc::new(Dispatcher::new()));

    // Ask for the older of the two supported revisions.
    let older = protocol::SUPPORTED_VERSIONS[1];
    send(&mut peer, &initialize_request(1, older)).await;
    let response = match recv(&mut peer).await {
        Message::Response(r) => r,
        other => panic!("expected response, got {:?}", other),
    };
    assert_eq!(response.result["protocolVersion"], json!(older));

    send(&mut peer, &Message::notification(methods::INITIALIZED, None)).await;
    tokio::time::timeout(Duration::from_secs(1), async {
        while handle.state() != SessionState::Ready {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        handle.negotiated().unwrap().protocol_version,
        older.to_string()
    );
}

#[tokio::test]
async fn responder_answers_its_newest_version_to_an_unknown_one() {
    let (mut peer, _handle) = spawn_responder(Arc::new(Dispatcher::new()));
    send(&mut peer, &initialize_request(1, "1999-12-31")).await;
    let response = match recv(&mut peer).await {
        Message::Response(r) => r,
        other => panic!("expected response, got {:?}", other),
    };
    assert_eq!(
        response.result["protocolVersion"],
        json!(protocol::LATEST_VERSION)
    );
}

#[tokio::test]
async fn requests_before_handshake_get_not_initialized() {
    let (mut peer, handle) = spawn_responder(Arc::new(Dispatcher::new()));

    send(
        &mut peer,
        &Message::request(RequestId::Number(7), "tools/list", None),
    )
    .await;
    match recv(&mut peer).await {
        Message::Error(e) => {
            assert_eq!(e.id, RequestId::Number(7));
            assert_eq!(e.error.code, error_codes::NOT_INITIALIZED);
        }
        other => panic!("expected error response, got {:?}", other),
    }

    // Non-handshake notifications before readiness are silently ignored.
    send(
        &mut peer,
        &Message::notification("resources/updated", Some(json!({"uri": "mem://x"}))),
    )
    .await;

    // The handshake still succeeds afterwards.
    handshake(&mut peer).await;
    tokio::time::timeout(Duration::from_secs(1), async {
        while handle.state() != SessionState::Ready {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn second_initialize_is_rejected() {
    let (mut peer, _handle) = spawn_responder(Arc::new(Dispatcher::new()));
    handshake(&mut peer).await;

    send(&mut peer, &initialize_request(9, protocol::LATEST_VERSION)).await;
    match recv(&mut peer).await {
        Message::Error(e) => {
            assert_eq!(e.id, RequestId::Number(9));
            assert_eq!(e.error.code, error_codes::INVALID_REQUEST);
        }
        other => panic!("expected error response, got {:?}", other),
    }
}

#[tokio::test]
async fn duplicate_in_flight_id_is_rejected_then_id_becomes_reusable() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher
        .register(
            "tools/call",
            handler_fn(|_ctx, _params| async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(json!({"ok": true}))
            }),
        )
        .unwrap();
    let (mut peer, _handle) = spawn_responder(dispatcher);
    handshake(&mut peer).await;

    let id = RequestId::Number(5);
    send(&mut peer, &Message::request(id.clone(), "tools/call", None)).await;
    send(&mut peer, &Message::request(id.clone(), "tools/call", None)).await;

    // The duplicate is refused immediately while the first is in flight.
    match recv(&mut peer).await {
        Message::Error(e) => {
            assert_eq!(e.id, id);
            assert_eq!(e.error.code, error_codes::INVALID_REQUEST);
        }
        other => panic!("expected duplicate-id error, got {:?}", other),
    }
    // The original still completes exactly once.
    match recv(&mut peer).await {
        Message::Response(r) => {
            assert_eq!(r.id, id);
            assert_eq!(r.result, json!({"ok": true}));
        }
        other => panic!("expected response, got {:?}", other),
    }

    // After resolution the id may be used again.
    send(&mut peer, &Message::request(id.clone(), "tools/call", None)).await;
    match recv(&mut peer).await {
        Message::Response(r) => assert_eq!(r.id, id),
        other => panic!("expected response, got {:?}", other),
    }
}

#[tokio::test]
async fn stray_responses_are_benign() {
    let (mut peer, handle) = spawn_responder(Arc::new(Dispatcher::new()));
    handshake(&mut peer).await;

    // A response for an id nobody is waiting on is logged and dropped.
    send(
        &mut peer,
        &Message::response(RequestId::from("ghost"), json!({"late": true})),
    )
    .await;

    // The session is still healthy: ping round-trips.
    send(&mut peer, &Message::request(RequestId::Number(2), methods::PING, None)).await;
    match recv(&mut peer).await {
        Message::Response(r) => assert_eq!(r.id, RequestId::Number(2)),
        other => panic!("expected pong, got {:?}", other),
    }
    assert_eq!(handle.state(), SessionState::Ready);
}

#[tokio::test]
async fn undecodable_frames_are_dropped_without_killing_the_session() {
    let (mut peer, handle) = spawn_responder(Arc::new(Dispatcher::new()));
    handshake(&mut peer).await;

    peer.send("this is not json").await.unwrap();
    peer.send(r#"{"jsonrpc":"2.0","id":1}"#).await.unwrap();

    send(&mut peer, &Message::request(RequestId::Number(3), methods::PING, None)).await;
    match recv(&mut peer).await {
        Message::Response(r) => assert_eq!(r.id, RequestId::Number(3)),
        other => panic!("expected pong, got {:?}", other),
    }
    assert_eq!(handle.state(), SessionState::Ready);
}

#[tokio::test]
async fn peer_shutdown_is_acknowledged_and_later_requests_refused() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher
        .register(
            "tools/call",
            handler_fn(|_ctx, _params| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!({"ok": true}))
            }),
        )
        .unwrap();
    let (mut peer, handle) = spawn_responder(dispatcher);
    handshake(&mut peer).await;

    // One slow request in flight when the shutdown arrives.
    send(
        &mut peer,
        &Message::request(RequestId::Number(10), "tools/call", None),
    )
    .await;
    send(
        &mut peer,
        &Message::request(RequestId::Number(11), methods::SHUTDOWN, None),
    )
    .await;

    // The shutdown is acknowledged while the handler is still running.
    match recv(&mut peer).await {
        Message::Response(r) => assert_eq!(r.id, RequestId::Number(11)),
        other => panic!("expected shutdown ack, got {:?}", other),
    }

    // A request submitted while draining is refused with the closing code,
    // while the in-flight one is allowed to finish normally.
    send(
        &mut peer,
        &Message::request(RequestId::Number(12), "tools/call", None),
    )
    .await;
    let mut saw_refusal = false;
    let mut saw_result = false;
    for _ in 0..2 {
        match recv(&mut peer).await {
            Message::Error(e) if e.id == RequestId::Number(12) => {
                assert_eq!(e.error.code, error_codes::SHUTTING_DOWN);
                saw_refusal = true;
            }
            Message::Response(r) if r.id == RequestId::Number(10) => {
                assert_eq!(r.result, json!({"ok": true}));
                saw_result = true;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert!(saw_refusal && saw_result);

    tokio::time::timeout(Duration::from_secs(2), handle.closed())
        .await
        .expect("session never closed after drain");
}

#[tokio::test]
async fn progress_token_in_meta_reaches_the_peer_as_notifications() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher
        .register(
            "tools/call",
            handler_fn(|ctx, _params| async move {
                ctx.report_progress(0.3, None, None).await.ok();
                Ok(json!({"ok": true}))
            }),
        )
        .unwrap();
    let (mut peer, _handle) = spawn_responder(dispatcher);
    handshake(&mut peer).await;

    send(
        &mut peer,
        &Message::request(
            RequestId::Number(4),
            "tools/call",
            Some(json!({"_meta": {"progressToken": "tok-1"}})),
        ),
    )
    .await;

    let mut saw_progress = false;
    let mut saw_result = false;
    for _ in 0..2 {
        match recv(&mut peer).await {
            Message::Notification(n) if n.method == methods::PROGRESS => {
                let params = n.params.unwrap();
                assert_eq!(params["progressToken"], json!("tok-1"));
                assert_eq!(params["progress"], json!(0.3));
                saw_progress = true;
            }
            Message::Response(r) => {
                assert_eq!(r.id, RequestId::Number(4));
                saw_result = true;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert!(saw_progress && saw_result);
}

#[tokio::test]
async fn ping_before_handshake_is_refused() {
    let (mut peer, _handle) = spawn_responder(Arc::new(Dispatcher::new()));
    send(&mut peer, &Message::request(RequestId::Number(1), methods::PING, None)).await;
    match recv(&mut peer).await {
        Message::Error(e) => assert_eq!(e.error.code, error_codes::NOT_INITIALIZED),
        other => panic!("expected error, got {:?}", other),
    }
}

/// Stray response to a cancelled request: the cancellation wins locally and
/// the late response is dropped as benign.
#[tokio::test]
async fn late_response_after_cancellation_is_a_stray() {
    let (client_t, mut peer) = InMemoryTransport::pair();
    let (session, client) = Session::new(
        Box::new(client_t),
        Arc::new(Dispatcher::new()),
        SessionOptions {
            role: Role::Initiator,
            capabilities: CapabilitySet::new(),
            info: PeerInfo::new("racer", "0.1.0"),
            config: test_config(),
        },
    );
    tokio::spawn(session.run());

    // Scripted server: answer the handshake, then answer tools/call only
    // after a long delay, racing the client's cancellation.
    let scripted = tokio::spawn(async move {
        let init = match decode(&peer.receive().await.unwrap().unwrap()).unwrap() {
            Message::Request(r) => r,
            other => panic!("expected initialize, got {:?}", other),
        };
        peer.send(
            &encode(&Message::response(
                init.id,
                json!({
                    "protocolVersion": protocol::LATEST_VERSION,
                    "capabilities": {},
                    "serverInfo": {"name": "racer-host", "version": "0.0.1"}
                }),
            ))
            .unwrap(),
        )
        .await
        .unwrap();

        // initialized notification, then the tools/call request.
        let mut call_id = None;
        while call_id.is_none() {
            match decode(&peer.receive().await.unwrap().unwrap()).unwrap() {
                Message::Request(r) => call_id = Some(r.id),
                Message::Notification(_) => {}
                other => panic!("unexpected frame {:?}", other),
            }
        }
        // Wait past the client's cancellation, then answer anyway.
        tokio::time::sleep(Duration::from_millis(150)).await;
        peer.send(
            &encode(&Message::response(call_id.unwrap(), json!({"too": "late"}))).unwrap(),
        )
        .await
        .unwrap();

        // Hold the transport open long enough for the stray to be processed.
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer
    });

    client.initialize().await.unwrap();
    let pending = client.request_with(
        "vendor/slow",
        None,
        crate::rpc::session::RequestOptions {
            timeout: Some(Duration::from_millis(50)),
            progress: None,
        },
    );
    let err = pending.await.unwrap_err();
    assert!(matches!(err, crate::error::Error::TimedOut(_)));

    let _peer = scripted.await.unwrap();
    // The stray response for the cancelled id did not disturb the session.
    assert_eq!(client.state(), SessionState::Ready);
    assert_eq!(client.outstanding_requests(), 0);
}

/// Round-trip sanity for every wire shape the codec produces.
#[test]
fn wire_shapes_survive_encode_decode() {
    let shapes: Vec<Value> = vec![
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "x"}}),
        json!({"jsonrpc": "2.0", "id": "s-1", "result": {"ok": true}}),
        json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32601, "message": "no"}}),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    ];
    for shape in shapes {
        let frame = serde_json::to_string(&shape).unwrap();
        let message = decode(&frame).unwrap();
        let re_encoded = encode(&message).unwrap();
        let round_tripped: Value = serde_json::from_str(&re_encoded).unwrap();
        assert_eq!(round_tripped, shape);
    }
}
