//! WebSocket endpoints and per-connection lifecycle.
//!
//! Every upgraded connection runs exactly two tasks: the reader (this
//! module's handler functions) and a writer draining the bounded outbound
//! queue. A third lightweight ticker drives protocol-level ping/pong
//! liveness. Peers only ever reach each other through `ConnHandle`s; a
//! saturated queue closes its consumer rather than stalling the router.
//! Reader loops run under `catch_unwind` so a panic in one connection dies
//! with that connection and still takes the normal close path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    FutureExt, SinkExt, StreamExt,
};
use metrics::counter;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::protocol::{
    decode_binary_frame, AgentEvent, AgentMessage, BrowserEvent, BrowserMessage, ErrorCode,
};
use crate::registry::{ConnHandle, Outbound, SessionRegistry};
use crate::session::generate_conn_id;

/// Shared state for the WebSocket routes.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<Config>,
}

/// `GET /mac` - agent endpoint.
pub async fn mac_handler(State(state): State<RelayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_agent(socket, state))
}

/// `GET /browser` - viewer endpoint.
pub async fn browser_handler(State(state): State<RelayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_browser(socket, state))
}

/// Upper bound on a single socket write before the peer is abandoned.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Writer task: drain the outbound queue into the socket, then say goodbye.
async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        let msg = match out {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Binary(frame) => Message::Binary(frame),
            Outbound::Ping => Message::Ping(Vec::new()),
        };
        match tokio::time::timeout(WRITE_TIMEOUT, sender.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return,
            Err(_) => {
                debug!("socket write timed out, abandoning peer");
                return;
            }
        }
    }
    // queue closed: all handles dropped, the connection is going away
    let _ = sender.send(Message::Close(None)).await;
}

/// Liveness ticker: queue a protocol ping every interval and close the
/// connection once the last pong is older than the timeout.
fn spawn_ping(
    handle: ConnHandle,
    last_pong: Arc<RwLock<Instant>>,
    interval: Duration,
    max_age: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick is immediate
        loop {
            tokio::select! {
                _ = handle.closed() => return,
                _ = ticker.tick() => {}
            }
            if last_pong.read().await.elapsed() >= max_age {
                warn!(conn_id = %handle.conn_id, "missed pongs, closing dead connection");
                counter!("relay_connections_closed_total", 1, "cause" => "ping_timeout");
                handle.request_close();
                return;
            }
            if !enqueue(&handle, Outbound::Ping) {
                return;
            }
        }
    });
}

/// Push a message onto a peer's outbound queue. A full queue means the peer
/// is too slow to keep up and is closed (drop-the-consumer policy).
fn enqueue(peer: &ConnHandle, out: Outbound) -> bool {
    match peer.tx.try_send(out) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(conn_id = %peer.conn_id, "outbound queue saturated, dropping slow consumer");
            counter!("relay_connections_closed_total", 1, "cause" => "overflow");
            peer.request_close();
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

fn send_json<T: Serialize>(peer: &ConnHandle, msg: &T) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => enqueue(peer, Outbound::Text(json)),
        Err(err) => {
            error!(conn_id = %peer.conn_id, %err, "failed to serialize outbound message");
            false
        }
    }
}

async fn handle_agent(socket: WebSocket, state: RelayState) {
    let conn_id = generate_conn_id();
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel(state.config.outbound_queue_limit);
    tokio::spawn(write_outbound(sender, rx));
    let handle = ConnHandle::new(conn_id.clone(), tx);

    let pair = match state.registry.create_pair(handle.clone()) {
        Ok(pair) => pair,
        Err(err) => {
            error!(conn_id = %conn_id, %err, "failed to register agent");
            return;
        }
    };
    counter!("relay_pairs_registered_total", 1);

    // `registered` must be the first frame the agent sees
    let registered = AgentEvent::Registered {
        code: pair.code.clone(),
        session_id: pair.session_id.clone(),
    };
    if !send_json(&handle, &registered) {
        state.registry.remove_pair_by_agent(&conn_id);
        return;
    }

    let last_pong = Arc::new(RwLock::new(Instant::now()));
    spawn_ping(
        handle.clone(),
        last_pong.clone(),
        state.config.ping_interval,
        state.config.ping_timeout,
    );
    debug!(conn_id = %conn_id, code = %pair.code, "agent connected");

    let outcome = AssertUnwindSafe(agent_loop(&mut receiver, &handle, &state, &last_pong))
        .catch_unwind()
        .await;
    if outcome.is_err() {
        error!(conn_id = %conn_id, "agent connection task panicked");
        counter!("relay_connections_closed_total", 1, "cause" => "panic");
    }

    handle.request_close();
    if let Some(removed) = state.registry.remove_pair_by_agent(&conn_id) {
        if let Some(browser) = removed.browser {
            // the browser survives as a socket just long enough to learn why
            send_json(
                &browser,
                &BrowserEvent::SessionDisconnected {
                    session_id: removed.session_id,
                },
            );
            browser.request_close();
        }
    }
    debug!(conn_id = %conn_id, "agent disconnected");
}

async fn agent_loop(
    receiver: &mut SplitStream<WebSocket>,
    handle: &ConnHandle,
    state: &RelayState,
    last_pong: &RwLock<Instant>,
) {
    let conn_id = handle.conn_id.as_str();
    loop {
        let frame = tokio::select! {
            _ = handle.closed() => return,
            frame = receiver.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                debug!(conn_id = %conn_id, %err, "agent socket error");
                return;
            }
            None => return,
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<AgentMessage>(&text) {
                Ok(AgentMessage::SessionData { payload }) if payload.agent_originated() => {
                    let Some(view) = state.registry.find_by_agent(conn_id) else {
                        return;
                    };
                    match view.browser {
                        Some(browser) => {
                            if send_json(&browser, &payload) {
                                counter!(
                                    "relay_frames_forwarded_total",
                                    1,
                                    "direction" => "agent_to_browser"
                                );
                            }
                        }
                        // terminal state is refreshable; events for an
                        // absent browser are dropped
                        None => debug!(conn_id = %conn_id, "no browser attached, event dropped"),
                    }
                }
                Ok(AgentMessage::SessionData { .. }) => {
                    warn!(conn_id = %conn_id, "relay-originated kind inside session_data");
                    send_json(handle, &AgentEvent::error(ErrorCode::InvalidMessage));
                    return;
                }
                Err(err) => {
                    debug!(conn_id = %conn_id, %err, "unparseable agent frame");
                    send_json(handle, &AgentEvent::error(ErrorCode::InvalidMessage));
                    return;
                }
            },
            Message::Binary(frame) => match decode_binary_frame(&frame) {
                Ok((frame_session, _)) => {
                    let Some(view) = state.registry.find_by_agent(conn_id) else {
                        return;
                    };
                    if frame_session != view.session_id {
                        // late frame for a torn-down session: report, drop, carry on
                        send_json(handle, &AgentEvent::error(ErrorCode::SessionNotFound));
                        continue;
                    }
                    if let Some(browser) = view.browser {
                        if enqueue(&browser, Outbound::Binary(frame)) {
                            counter!(
                                "relay_frames_forwarded_total",
                                1,
                                "direction" => "agent_to_browser"
                            );
                        }
                    }
                }
                Err(err) => {
                    debug!(conn_id = %conn_id, %err, "malformed binary frame from agent");
                    send_json(handle, &AgentEvent::error(ErrorCode::InvalidMessage));
                    return;
                }
            },
            Message::Pong(_) => {
                *last_pong.write().await = Instant::now();
            }
            Message::Ping(_) => {}
            Message::Close(_) => return,
        }
    }
}

async fn handle_browser(socket: WebSocket, state: RelayState) {
    let conn_id = generate_conn_id();
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel(state.config.outbound_queue_limit);
    tokio::spawn(write_outbound(sender, rx));
    let handle = ConnHandle::new(conn_id.clone(), tx);

    // AwaitingJoin: the first text frame decides, under a deadline
    let deadline = tokio::time::Instant::now() + state.config.handshake_timeout;
    let first_text = loop {
        let frame = match tokio::time::timeout_at(deadline, receiver.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                debug!(conn_id = %conn_id, "browser handshake timeout");
                return;
            }
        };
        match frame {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(_))) => {
                send_json(&handle, &BrowserEvent::error(ErrorCode::InvalidMessage));
                return;
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
        }
    };

    // Authenticating
    let join_result = match serde_json::from_str::<BrowserMessage>(&first_text) {
        Ok(BrowserMessage::Join { code }) => match state.registry.join(&code, handle.clone()) {
            Ok(joined) => {
                counter!("relay_joins_total", 1, "outcome" => "joined");
                Ok(joined)
            }
            Err(err) => {
                counter!("relay_joins_total", 1, "outcome" => err.code().label());
                Err(err.code())
            }
        },
        Ok(BrowserMessage::Rejoin { session_id }) => {
            match state.registry.rejoin(&session_id, handle.clone()) {
                Ok(joined) => {
                    counter!("relay_joins_total", 1, "outcome" => "rejoined");
                    Ok(joined)
                }
                Err(err) => {
                    counter!("relay_joins_total", 1, "outcome" => err.code().label());
                    Err(err.code())
                }
            }
        }
        Ok(_) | Err(_) => Err(ErrorCode::InvalidMessage),
    };

    let joined = match join_result {
        Ok(joined) => joined,
        Err(code) => {
            // pairing failure closes this browser only
            send_json(&handle, &BrowserEvent::error(code));
            return;
        }
    };

    // the `joined` ack was queued by the registry before the agent could
    // see this browser; presence goes to the agent now
    send_json(&joined.agent, &AgentEvent::BrowserConnected);

    let last_pong = Arc::new(RwLock::new(Instant::now()));
    spawn_ping(
        handle.clone(),
        last_pong.clone(),
        state.config.ping_interval,
        state.config.ping_timeout,
    );
    info!(conn_id = %conn_id, session_id = %joined.session_id, "browser active");

    let outcome = AssertUnwindSafe(browser_loop(&mut receiver, &handle, &state, &last_pong))
        .catch_unwind()
        .await;
    if outcome.is_err() {
        error!(conn_id = %conn_id, "browser connection task panicked");
        counter!("relay_connections_closed_total", 1, "cause" => "panic");
    }

    handle.request_close();
    if let Some(gone) = state.registry.disconnect_browser(&conn_id) {
        send_json(&gone.agent, &AgentEvent::BrowserDisconnected);
    }
    debug!(conn_id = %conn_id, "browser disconnected");
}

async fn browser_loop(
    receiver: &mut SplitStream<WebSocket>,
    handle: &ConnHandle,
    state: &RelayState,
    last_pong: &RwLock<Instant>,
) {
    let conn_id = handle.conn_id.as_str();
    loop {
        let frame = tokio::select! {
            _ = handle.closed() => return,
            frame = receiver.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                debug!(conn_id = %conn_id, %err, "browser socket error");
                return;
            }
            None => return,
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<BrowserMessage>(&text) {
                Ok(BrowserMessage::Ping) => {
                    send_json(handle, &BrowserEvent::Pong);
                }
                Ok(BrowserMessage::Join { .. }) | Ok(BrowserMessage::Rejoin { .. }) => {
                    send_json(handle, &BrowserEvent::error(ErrorCode::InvalidMessage));
                    return;
                }
                Ok(_) => {
                    let Some(view) = state.registry.find_by_browser(conn_id) else {
                        return;
                    };
                    // validated against the browser catalog; the original
                    // text is forwarded untouched
                    if enqueue(&view.agent, Outbound::Text(text)) {
                        counter!(
                            "relay_frames_forwarded_total",
                            1,
                            "direction" => "browser_to_agent"
                        );
                    }
                }
                Err(err) => {
                    debug!(conn_id = %conn_id, %err, "unparseable browser frame");
                    send_json(handle, &BrowserEvent::error(ErrorCode::InvalidMessage));
                    return;
                }
            },
            Message::Binary(frame) => match decode_binary_frame(&frame) {
                Ok((frame_session, _)) => {
                    let Some(view) = state.registry.find_by_browser(conn_id) else {
                        return;
                    };
                    if frame_session != view.session_id {
                        send_json(handle, &BrowserEvent::error(ErrorCode::SessionNotFound));
                        continue;
                    }
                    if enqueue(&view.agent, Outbound::Binary(frame)) {
                        counter!(
                            "relay_frames_forwarded_total",
                            1,
                            "direction" => "browser_to_agent"
                        );
                    }
                }
                Err(err) => {
                    debug!(conn_id = %conn_id, %err, "malformed binary frame from browser");
                    send_json(handle, &BrowserEvent::error(ErrorCode::InvalidMessage));
                    return;
                }
            },
            Message::Pong(_) => {
                *last_pong.write().await = Instant::now();
            }
            Message::Ping(_) => {}
            Message::Close(_) => return,
        }
    }
}
