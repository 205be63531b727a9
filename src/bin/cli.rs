//! Swarm Relay CLI
//!
//! Operator client for a running relay:
//! - Connect and disconnect cubes
//! - Drive motors and set the LED
//! - Read battery level and position, or watch position updates
//!
//! Every envelope received from the relay is printed as one JSON line.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Parser)]
#[command(name = "swarm-relay-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive and observe cubes through a Swarm Relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Relay WebSocket URL
    #[arg(long, default_value = "ws://localhost:8765/ws", global = true)]
    pub url: String,

    /// Seconds to wait for a reply
    #[arg(long, default_value = "10", global = true)]
    pub timeout: u64,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect a cube
    Connect { target: String },

    /// Disconnect a cube
    Disconnect { target: String },

    /// Drive the motors
    Move {
        target: String,
        #[arg(allow_negative_numbers = true)]
        left: i64,
        #[arg(allow_negative_numbers = true)]
        right: i64,
    },

    /// Set the LED color
    Led { target: String, r: u8, g: u8, b: u8 },

    /// Read the battery level
    Battery { target: String },

    /// Read the position
    Position {
        target: String,
        /// Subscribe and print updates until Ctrl-C
        #[arg(short, long)]
        watch: bool,
    },
}

impl Commands {
    /// Envelope to send for this subcommand
    fn envelope(&self) -> Value {
        match self {
            Commands::Connect { target } => command("connect", target, Value::Null),
            Commands::Disconnect { target } => command("disconnect", target, Value::Null),
            Commands::Move {
                target,
                left,
                right,
            } => command(
                "move",
                target,
                json!({"left_speed": left, "right_speed": right}),
            ),
            Commands::Led { target, r, g, b } => {
                command("led", target, json!({"r": r, "g": g, "b": b}))
            }
            Commands::Battery { target } => {
                json!({"type": "query", "payload": {"info": "battery", "target": target}})
            }
            Commands::Position { target, watch } => {
                let mut payload = json!({"info": "position", "target": target});
                if *watch {
                    payload["notify"] = json!(true);
                }
                json!({"type": "query", "payload": payload})
            }
        }
    }
}

fn command(cmd: &str, target: &str, params: Value) -> Value {
    let mut payload = json!({"cmd": cmd, "target": target});
    if !params.is_null() {
        payload["params"] = params;
    }
    json!({"type": "command", "payload": payload})
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let wait = Duration::from_secs(cli.timeout);

    let (mut ws, _) = connect_async(cli.url.as_str())
        .await
        .with_context(|| format!("connecting to {}", cli.url))?;

    // Greeting
    let greeting = next_envelope(&mut ws, wait).await?;
    println!("{}", greeting);

    ws.send(Message::text(cli.command.envelope().to_string()))
        .await
        .context("sending request")?;

    let reply = next_envelope(&mut ws, wait).await?;
    println!("{}", reply);

    if let Commands::Position { watch: true, .. } = cli.command {
        loop {
            tokio::select! {
                update = next_envelope(&mut ws, Duration::MAX) => {
                    let update = update?;
                    println!("{}", update);
                    if update["payload"]["notify"] == json!(false) {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    let _ = ws.close(None).await;

    let failed = reply["type"] == "error" || reply["payload"]["status"] == "error";
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Read the next text frame as JSON
async fn next_envelope(ws: &mut WsStream, wait: Duration) -> anyhow::Result<Value> {
    loop {
        let frame = match tokio::time::timeout(wait, ws.next()).await {
            Ok(Some(frame)) => frame.context("reading from relay")?,
            Ok(None) => bail!("relay closed the connection"),
            Err(_) => bail!("timed out waiting for the relay"),
        };
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(&text).context("relay sent invalid JSON");
            }
            Message::Close(_) => bail!("relay closed the connection"),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_envelope() {
        let cli = Cli::parse_from(["swarm-relay-cli", "move", "A1", "-50", "50"]);
        assert_eq!(
            cli.command.envelope(),
            json!({"type":"command","payload":{
                "cmd":"move","target":"A1","params":{"left_speed":-50,"right_speed":50}
            }})
        );
    }

    #[test]
    fn test_position_watch_envelope() {
        let cli = Cli::parse_from(["swarm-relay-cli", "position", "A1", "--watch"]);
        assert_eq!(
            cli.command.envelope(),
            json!({"type":"query","payload":{"info":"position","target":"A1","notify":true}})
        );

        let cli = Cli::parse_from(["swarm-relay-cli", "--url", "ws://relay:1/ws", "connect", "B2"]);
        assert_eq!(cli.url, "ws://relay:1/ws");
        assert_eq!(
            cli.command.envelope(),
            json!({"type":"command","payload":{"cmd":"connect","target":"B2"}})
        );
    }
}
