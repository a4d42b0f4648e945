//! Wire protocol between the relay and its two kinds of peers.
//!
//! Text frames carry JSON objects discriminated by a `type` field; field
//! names are `snake_case` end-to-end. Terminal byte streams travel as binary
//! frames laid out as `[id_len: u8][session_id bytes][payload]`; the relay
//! reads only the prefix to confirm the target pair and never interprets the
//! payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes surfaced to peers in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCode,
    ExpiredCode,
    AlreadyJoined,
    NotFound,
    MacDisconnected,
    InvalidMessage,
    SessionNotFound,
}

impl ErrorCode {
    /// Lowercase label for metrics dimensions.
    pub fn label(self) -> &'static str {
        match self {
            ErrorCode::InvalidCode => "invalid_code",
            ErrorCode::ExpiredCode => "expired_code",
            ErrorCode::AlreadyJoined => "already_joined",
            ErrorCode::NotFound => "not_found",
            ErrorCode::MacDisconnected => "mac_disconnected",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::SessionNotFound => "session_not_found",
        }
    }

    /// Human-readable companion text for `error.message`.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::InvalidCode => "no session with that code",
            ErrorCode::ExpiredCode => "that code has expired",
            ErrorCode::AlreadyJoined => "a browser is already connected to that session",
            ErrorCode::NotFound => "no session with that id",
            ErrorCode::MacDisconnected => "the agent for that session has disconnected",
            ErrorCode::InvalidMessage => "malformed or unexpected message",
            ErrorCode::SessionNotFound => "no terminal session with that id",
        }
    }
}

/// A terminal session as announced by the agent in `tab_list`/`session_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSessionInfo {
    pub session_id: String,
    pub name: String,
}

/// Messages a browser may send to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserMessage {
    /// Pair with an agent using a pairing code. Only valid as the first
    /// frame on a fresh connection.
    Join { code: String },
    /// Re-attach to a live pair after a reload. Only valid as the first
    /// frame on a fresh connection.
    Rejoin { session_id: String },
    /// Keystrokes for the agent.
    TerminalInput { session_id: String, payload: String },
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// Ask the agent to resend the full screen contents.
    RequestScreenRefresh,
    TabSwitch { session_id: String },
    TabCreate,
    TabClose { session_id: String },
    /// Application-level heartbeat; answered by the relay itself.
    Ping,
}

impl BrowserMessage {
    /// Whether this kind is forwarded to the paired agent when `Active`.
    pub fn forwards_to_agent(&self) -> bool {
        !matches!(
            self,
            BrowserMessage::Join { .. } | BrowserMessage::Rejoin { .. } | BrowserMessage::Ping
        )
    }
}

/// Messages the relay sends to a browser. `Joined`, `Error` and `Pong`
/// originate at the relay; every other kind originates at the agent and is
/// forwarded out of its `session_data` envelope unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserEvent {
    Joined { session_id: String },
    Error { code: ErrorCode, message: String },
    Pong,
    TerminalData { session_id: String, payload: String },
    /// Full screen contents, sent by the agent after a refresh request.
    InitialTerminalData { session_id: String, payload: String },
    /// Agent-side display configuration, opaque to the relay.
    Config { settings: Value },
    TabList { tabs: Vec<TerminalSessionInfo> },
    TabSwitch { session_id: String },
    TabCreated { session_id: String, name: String },
    TabClosed { session_id: String },
    SessionResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    SessionConnected { session_id: String, name: String },
    SessionDisconnected { session_id: String },
    SessionList { sessions: Vec<TerminalSessionInfo> },
}

impl BrowserEvent {
    pub fn error(code: ErrorCode) -> Self {
        BrowserEvent::Error {
            code,
            message: code.message().to_string(),
        }
    }

    /// Whether an agent may carry this kind inside `session_data`. The
    /// relay-originated kinds are rejected at ingress.
    pub fn agent_originated(&self) -> bool {
        !matches!(
            self,
            BrowserEvent::Joined { .. } | BrowserEvent::Error { .. } | BrowserEvent::Pong
        )
    }
}

/// Messages an agent may send to the relay: a single tagged envelope whose
/// payload is delivered to the paired browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    SessionData { payload: BrowserEvent },
}

/// Messages the relay sends to an agent. `Registered` and the browser
/// presence events originate at the relay; the rest are browser messages
/// forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First frame on every agent connection. The agent shows `code` to the
    /// user and prefixes its binary frames with `session_id`.
    Registered { code: String, session_id: String },
    Error { code: ErrorCode, message: String },
    BrowserConnected,
    BrowserDisconnected,
    TerminalInput { session_id: String, payload: String },
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    RequestScreenRefresh,
    TabSwitch { session_id: String },
    TabCreate,
    TabClose { session_id: String },
}

impl AgentEvent {
    pub fn error(code: ErrorCode) -> Self {
        AgentEvent::Error {
            code,
            message: code.message().to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty binary frame")]
    Empty,
    #[error("binary frame shorter than its declared session id ({id_len} bytes)")]
    Truncated { id_len: usize },
    #[error("binary frame session id is not UTF-8")]
    InvalidSessionId,
}

/// Frame a terminal byte chunk for one session: `[id_len][session_id][payload]`.
pub fn encode_binary_frame(session_id: &str, payload: &[u8]) -> Vec<u8> {
    assert!(session_id.len() <= u8::MAX as usize, "session id too long to frame");
    let mut frame = Vec::with_capacity(1 + session_id.len() + payload.len());
    frame.push(session_id.len() as u8);
    frame.extend_from_slice(session_id.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a binary frame into its session id and payload without copying.
pub fn decode_binary_frame(frame: &[u8]) -> Result<(&str, &[u8]), FrameError> {
    let (&id_len, rest) = frame.split_first().ok_or(FrameError::Empty)?;
    let id_len = id_len as usize;
    if rest.len() < id_len {
        return Err(FrameError::Truncated { id_len });
    }
    let (id, payload) = rest.split_at(id_len);
    let session_id = std::str::from_utf8(id).map_err(|_| FrameError::InvalidSessionId)?;
    Ok((session_id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::InvalidCode).unwrap();
        assert_eq!(json, "\"INVALID_CODE\"");
        let json = serde_json::to_string(&ErrorCode::MacDisconnected).unwrap();
        assert_eq!(json, "\"MAC_DISCONNECTED\"");
    }

    #[test]
    fn test_browser_message_join_parse() {
        let msg: BrowserMessage =
            serde_json::from_str(r#"{"type":"join","code":"abc234"}"#).unwrap();
        assert!(matches!(msg, BrowserMessage::Join { code } if code == "abc234"));
    }

    #[test]
    fn test_browser_message_reencode_is_stable() {
        let text = r#"{"type":"terminal_input","session_id":"s1","payload":"ls\r"}"#;
        let msg: BrowserMessage = serde_json::from_str(text).unwrap();
        let encoded = serde_json::to_string(&msg).unwrap();
        assert_eq!(encoded, text);
        let reparsed: BrowserMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(serde_json::to_string(&reparsed).unwrap(), encoded);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(serde_json::from_str::<BrowserMessage>(r#"{"type":"format_disk"}"#).is_err());
        assert!(serde_json::from_str::<AgentMessage>(r#"{"type":"join","code":"ABC234"}"#).is_err());
    }

    #[test]
    fn test_session_data_envelope_round_trip() {
        let msg = AgentMessage::SessionData {
            payload: BrowserEvent::SessionConnected {
                session_id: "t1".into(),
                name: "zsh - ~/project".into(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.starts_with(r#"{"type":"session_data""#));
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        let AgentMessage::SessionData { payload } = back;
        assert!(payload.agent_originated());
        assert!(matches!(
            payload,
            BrowserEvent::SessionConnected { session_id, .. } if session_id == "t1"
        ));
    }

    #[test]
    fn test_relay_originated_kinds_flagged() {
        assert!(!BrowserEvent::Pong.agent_originated());
        assert!(!BrowserEvent::error(ErrorCode::InvalidMessage).agent_originated());
        assert!(!BrowserEvent::Joined { session_id: "s".into() }.agent_originated());
        let data = BrowserEvent::TerminalData {
            session_id: "s".into(),
            payload: "drwx".into(),
        };
        assert!(data.agent_originated());
    }

    #[test]
    fn test_forwardable_browser_kinds() {
        assert!(!BrowserMessage::Ping.forwards_to_agent());
        assert!(!BrowserMessage::Join { code: "ABC234".into() }.forwards_to_agent());
        assert!(BrowserMessage::TabCreate.forwards_to_agent());
        let input = BrowserMessage::TerminalInput {
            session_id: "s".into(),
            payload: "ls\r".into(),
        };
        assert!(input.forwards_to_agent());
    }

    #[test]
    fn test_binary_frame_round_trip() {
        let frame = encode_binary_frame("session-1", b"drwxr-xr-x");
        let (session_id, payload) = decode_binary_frame(&frame).unwrap();
        assert_eq!(session_id, "session-1");
        assert_eq!(payload, b"drwxr-xr-x");
    }

    #[test]
    fn test_binary_frame_empty_payload() {
        let frame = encode_binary_frame("s", b"");
        let (session_id, payload) = decode_binary_frame(&frame).unwrap();
        assert_eq!(session_id, "s");
        assert!(payload.is_empty());
    }

    #[test]
    fn test_binary_frame_malformed() {
        assert!(matches!(decode_binary_frame(&[]), Err(FrameError::Empty)));
        // declares a 10-byte id but carries only 3 bytes after the prefix
        assert!(matches!(
            decode_binary_frame(&[10, b'a', b'b', b'c']),
            Err(FrameError::Truncated { id_len: 10 })
        ));
        assert!(matches!(
            decode_binary_frame(&[2, 0xff, 0xfe, b'x']),
            Err(FrameError::InvalidSessionId)
        ));
    }
}
