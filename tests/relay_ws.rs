//! End-to-end relay scenarios over real sockets: an agent on `/mac`, a
//! browser on `/browser`, and the relay in between.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use terminal_relay::build_router;
use terminal_relay::config::Config;
use terminal_relay::protocol::encode_binary_frame;
use terminal_relay::registry::SessionRegistry;
use terminal_relay::websocket::RelayState;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn spawn_relay(config: Config) -> (String, Arc<SessionRegistry>) {
    let registry = Arc::new(SessionRegistry::new(config.session_code_expiry));
    let state = RelayState {
        registry: registry.clone(),
        config: Arc::new(config),
    };
    tokio::spawn(terminal_relay::registry::run_sweeper(
        registry.clone(),
        state.config.sweep_interval,
    ));
    let app = build_router(state, None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}"), registry)
}

async fn spawn_default_relay() -> (String, Arc<SessionRegistry>) {
    spawn_relay(Config::default()).await
}

async fn connect(url: &str, path: &str) -> WsClient {
    let (ws, _) = timeout(WAIT, connect_async(format!("{url}{path}")))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

/// Next text frame as a raw string, skipping protocol ping/pong.
async fn next_text(ws: &mut WsClient) -> String {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("receive timed out")
            .expect("stream ended")
            .expect("socket error");
        match msg {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

async fn next_json(ws: &mut WsClient) -> Value {
    serde_json::from_str(&next_text(ws).await).expect("valid json frame")
}

async fn next_binary(ws: &mut WsClient) -> Vec<u8> {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("receive timed out")
            .expect("stream ended")
            .expect("socket error");
        match msg {
            Message::Binary(frame) => return frame,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
}

/// The stream ends in a server-initiated close (Close frame or EOF).
async fn expect_closed(ws: &mut WsClient) {
    loop {
        match timeout(WAIT, ws.next()).await.expect("close timed out") {
            None => return,
            Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
            Some(Err(_)) => return,
        }
    }
}

async fn send_text(ws: &mut WsClient, text: &str) {
    ws.send(Message::Text(text.to_string())).await.expect("send failed");
}

/// Connect an agent and read its `registered` frame: (socket, code, session_id).
async fn register_agent(url: &str) -> (WsClient, String, String) {
    let mut agent = connect(url, "/mac").await;
    let registered = next_json(&mut agent).await;
    assert_eq!(registered["type"], "registered");
    let code = registered["code"].as_str().unwrap().to_string();
    let session_id = registered["session_id"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 6);
    (agent, code, session_id)
}

/// Connect a browser and join with `code`: (socket, session_id).
async fn join_browser(url: &str, code: &str) -> (WsClient, String) {
    let mut browser = connect(url, "/browser").await;
    send_text(&mut browser, &json!({"type": "join", "code": code}).to_string()).await;
    let joined = next_json(&mut browser).await;
    assert_eq!(joined["type"], "joined", "unexpected join reply: {joined}");
    let session_id = joined["session_id"].as_str().unwrap().to_string();
    (browser, session_id)
}

#[tokio::test]
async fn happy_path_pairs_and_forwards_both_ways() {
    let (url, _) = spawn_default_relay().await;
    let (mut agent, code, agent_session) = register_agent(&url).await;

    // case-insensitive join
    let (mut browser, session_id) = join_browser(&url, &code.to_lowercase()).await;
    assert_eq!(session_id, agent_session);

    let presence = next_json(&mut agent).await;
    assert_eq!(presence["type"], "browser_connected");

    // browser input arrives at the agent byte-identical
    let input = json!({
        "type": "terminal_input",
        "session_id": session_id,
        "payload": "ls\r"
    })
    .to_string();
    send_text(&mut browser, &input).await;
    assert_eq!(next_text(&mut agent).await, input);

    // agent terminal bytes arrive at the browser as the same binary frame
    let frame = encode_binary_frame(&session_id, b"drwxr-xr-x");
    agent.send(Message::Binary(frame.clone())).await.unwrap();
    assert_eq!(next_binary(&mut browser).await, frame);

    // agent session events are unwrapped from their envelope
    send_text(
        &mut agent,
        &json!({
            "type": "session_data",
            "payload": {
                "type": "session_connected",
                "session_id": "t1",
                "name": "zsh - ~/project"
            }
        })
        .to_string(),
    )
    .await;
    let event = next_json(&mut browser).await;
    assert_eq!(event["type"], "session_connected");
    assert_eq!(event["name"], "zsh - ~/project");

    // application-level ping is answered by the relay, not the agent
    send_text(&mut browser, &json!({"type": "ping"}).to_string()).await;
    assert_eq!(next_json(&mut browser).await["type"], "pong");
}

#[tokio::test]
async fn join_with_unknown_code_is_rejected_and_agent_unaffected() {
    let (url, _) = spawn_default_relay().await;
    let (mut agent, code, _) = register_agent(&url).await;

    let mut stranger = connect(&url, "/browser").await;
    send_text(&mut stranger, &json!({"type": "join", "code": "ZZZZZZ"}).to_string()).await;
    let err = next_json(&mut stranger).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "INVALID_CODE");
    assert!(err["message"].as_str().is_some());
    expect_closed(&mut stranger).await;

    // the real code still pairs
    let (_browser, _) = join_browser(&url, &code).await;
    assert_eq!(next_json(&mut agent).await["type"], "browser_connected");
}

#[tokio::test]
async fn second_join_is_rejected_first_session_intact() {
    let (url, _) = spawn_default_relay().await;
    let (mut agent, code, _) = register_agent(&url).await;
    let (mut first, session_id) = join_browser(&url, &code).await;
    assert_eq!(next_json(&mut agent).await["type"], "browser_connected");

    let mut second = connect(&url, "/browser").await;
    send_text(&mut second, &json!({"type": "join", "code": code}).to_string()).await;
    let err = next_json(&mut second).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "ALREADY_JOINED");
    expect_closed(&mut second).await;

    // the first browser still routes
    let input = json!({
        "type": "terminal_input",
        "session_id": session_id,
        "payload": "pwd\r"
    })
    .to_string();
    send_text(&mut first, &input).await;
    assert_eq!(next_text(&mut agent).await, input);
}

#[tokio::test]
async fn browser_reload_rejoins_with_session_id() {
    let (url, _) = spawn_default_relay().await;
    let (mut agent, code, _) = register_agent(&url).await;
    let (mut browser, session_id) = join_browser(&url, &code).await;
    assert_eq!(next_json(&mut agent).await["type"], "browser_connected");

    browser.close(None).await.unwrap();
    assert_eq!(next_json(&mut agent).await["type"], "browser_disconnected");

    let mut reloaded = connect(&url, "/browser").await;
    send_text(
        &mut reloaded,
        &json!({"type": "rejoin", "session_id": session_id}).to_string(),
    )
    .await;
    let joined = next_json(&mut reloaded).await;
    assert_eq!(joined["type"], "joined");
    assert_eq!(joined["session_id"], session_id.as_str());
    assert_eq!(next_json(&mut agent).await["type"], "browser_connected");

    // forwarding works again after the rejoin
    let frame = encode_binary_frame(&session_id, b"$ ");
    agent.send(Message::Binary(frame.clone())).await.unwrap();
    assert_eq!(next_binary(&mut reloaded).await, frame);
}

#[tokio::test]
async fn agent_drop_tears_down_pair_and_marks_session_dead() {
    let (url, registry) = spawn_default_relay().await;
    let (mut agent, code, _) = register_agent(&url).await;
    let (mut browser, session_id) = join_browser(&url, &code).await;
    assert_eq!(next_json(&mut agent).await["type"], "browser_connected");

    agent.close(None).await.unwrap();

    let event = next_json(&mut browser).await;
    assert_eq!(event["type"], "session_disconnected");
    assert_eq!(event["session_id"], session_id.as_str());
    expect_closed(&mut browser).await;
    assert_eq!(registry.pair_count(), 0);

    // a late rejoin learns the agent is gone
    let mut late = connect(&url, "/browser").await;
    send_text(
        &mut late,
        &json!({"type": "rejoin", "session_id": session_id}).to_string(),
    )
    .await;
    let err = next_json(&mut late).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "MAC_DISCONNECTED");
    expect_closed(&mut late).await;
}

#[tokio::test]
async fn first_frame_must_be_join_or_rejoin() {
    let (url, _) = spawn_default_relay().await;
    let mut browser = connect(&url, "/browser").await;
    send_text(
        &mut browser,
        &json!({"type": "terminal_input", "session_id": "s", "payload": "x"}).to_string(),
    )
    .await;
    let err = next_json(&mut browser).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "INVALID_MESSAGE");
    expect_closed(&mut browser).await;
}

#[tokio::test]
async fn malformed_agent_frame_closes_agent_and_informs_browser() {
    let (url, _) = spawn_default_relay().await;
    let (mut agent, code, session_id) = register_agent(&url).await;
    let (mut browser, _) = join_browser(&url, &code).await;
    assert_eq!(next_json(&mut agent).await["type"], "browser_connected");

    send_text(&mut agent, "not json at all").await;
    let err = next_json(&mut agent).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "INVALID_MESSAGE");
    expect_closed(&mut agent).await;

    // the browser learns the pair is gone before its socket closes
    let event = next_json(&mut browser).await;
    assert_eq!(event["type"], "session_disconnected");
    assert_eq!(event["session_id"], session_id.as_str());
}

#[tokio::test]
async fn binary_frame_for_wrong_session_is_dropped_not_fatal() {
    let (url, _) = spawn_default_relay().await;
    let (mut agent, code, session_id) = register_agent(&url).await;
    let (mut browser, _) = join_browser(&url, &code).await;
    assert_eq!(next_json(&mut agent).await["type"], "browser_connected");

    let stray = encode_binary_frame("someone-elses-session", b"oops");
    agent.send(Message::Binary(stray)).await.unwrap();
    let err = next_json(&mut agent).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "SESSION_NOT_FOUND");

    // the connection survives and correct frames still flow
    let frame = encode_binary_frame(&session_id, b"still here");
    agent.send(Message::Binary(frame.clone())).await.unwrap();
    assert_eq!(next_binary(&mut browser).await, frame);
}

#[tokio::test]
async fn unpaired_code_expires_and_is_swept() {
    let config = Config {
        session_code_expiry: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(20),
        ..Config::default()
    };
    let (url, registry) = spawn_relay(config).await;
    let (mut agent, code, _) = register_agent(&url).await;

    // no browser joins within the TTL; the sweeper reclaims the pair and
    // parks the agent connection
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(registry.pair_count(), 0);
    expect_closed(&mut agent).await;

    let mut browser = connect(&url, "/browser").await;
    send_text(&mut browser, &json!({"type": "join", "code": code}).to_string()).await;
    let err = next_json(&mut browser).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "INVALID_CODE");
}

#[tokio::test]
async fn slow_browser_is_dropped_without_stalling_the_agent() {
    let config = Config {
        outbound_queue_limit: 2,
        ..Config::default()
    };
    let (url, _) = spawn_relay(config).await;
    let (mut agent, code, session_id) = register_agent(&url).await;
    let (_browser, _) = join_browser(&url, &code).await;
    assert_eq!(next_json(&mut agent).await["type"], "browser_connected");

    // the browser stops reading; large frames fill its queue past the bound
    let chunk = vec![0x55u8; 4 * 1024 * 1024];
    for _ in 0..8 {
        let frame = encode_binary_frame(&session_id, &chunk);
        agent.send(Message::Binary(frame)).await.unwrap();
    }

    // only the slow consumer is closed; the agent sees it leave
    let event = timeout(Duration::from_secs(10), async {
        loop {
            let msg = next_json(&mut agent).await;
            if msg["type"] == "browser_disconnected" {
                return msg;
            }
        }
    })
    .await
    .expect("agent never saw the slow browser dropped");
    assert_eq!(event["type"], "browser_disconnected");
}
