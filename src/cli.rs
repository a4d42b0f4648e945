use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::io::Write;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::protocol::{decode_binary_frame, BrowserEvent, BrowserMessage};

#[derive(Parser, Debug)]
#[command(name = "terminal-relay")]
#[command(about = "Terminal relay server and debug viewer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pair with an agent and stream its terminal output to stdout
    Join {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Pairing code shown by the agent
        #[arg(short, long)]
        code: String,
    },
}

/// Debug browser client: join a session and dump its terminal bytes.
/// Keystrokes are not bridged; this is a read-only viewer for smoke tests.
pub async fn run_join_client(url: String, code: String) -> Result<()> {
    let ws_url = format!("{}/browser", url.trim_end_matches('/'));
    debug!("connecting to {ws_url}");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => return Err(anyhow::anyhow!("connection failed: {e}")),
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the relay running?"
            ))
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = BrowserMessage::Join { code };
    write.send(Message::Text(serde_json::to_string(&join)?)).await?;

    let mut stdout = std::io::stdout();
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<BrowserEvent>(&text) {
                Ok(BrowserEvent::Joined { session_id }) => {
                    eprintln!("joined session {session_id}");
                }
                Ok(BrowserEvent::Error { code, message }) => {
                    return Err(anyhow::anyhow!("relay error {code:?}: {message}"));
                }
                Ok(BrowserEvent::SessionDisconnected { .. }) => {
                    eprintln!("agent disconnected");
                    break;
                }
                Ok(event) => debug!(?event, "relay event"),
                Err(err) => debug!(%err, "unrecognized frame"),
            },
            Message::Binary(frame) => {
                if let Ok((_, payload)) = decode_binary_frame(&frame) {
                    stdout.write_all(payload)?;
                    stdout.flush()?;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}
