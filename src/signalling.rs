//! WebSocket signalling client (§6, supplemented per `websocket.py`).
//!
//! The server hands back UDP transport coordinates (`udp_host`, `udp_port`,
//! `websocket_id`) over this socket once connected; `websocket_handler` is
//! the grounding source for the message shapes below. The pre-shared AES
//! session key is a separate, Configuration-input concern (spec §6) —
//! see [`crate::config::EchoStreamConfig::session_key`] — and is never
//! carried on this channel.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct ActivationMessage {
    pub udp_host: String,
    pub udp_port: u16,
    /// Integer in the wire protocol (`ServerConfig.websocket_id: int = 0`
    /// in `websocket.py`), not a string.
    pub websocket_id: u64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event_type")]
pub enum OutboundEvent {
    #[serde(rename = "connect")]
    Connect { channel_id: String },
    #[serde(rename = "transmit_started")]
    TransmitStarted {
        affiliation_id: &'static str,
        user_name: &'static str,
        agency_name: String,
        channel_id: String,
        time: u64,
    },
    #[serde(rename = "transmit_ended")]
    TransmitEnded {
        affiliation_id: &'static str,
        user_name: &'static str,
        agency_name: String,
        channel_id: String,
        time: u64,
    },
}

#[async_trait]
pub trait SignallingClient: Send + Sync {
    async fn send_event(&self, event: OutboundEvent);
}

/// Drives a `tokio-tungstenite` connection, forwarding outbound events
/// from a channel and yielding parsed [`ActivationMessage`]s as they
/// arrive, following the reconnect-loop shape of `global_websocket_thread`.
pub struct WebSocketSignallingClient {
    outbound: mpsc::UnboundedSender<OutboundEvent>,
}

impl WebSocketSignallingClient {
    /// Connects to `url` and spawns the send/receive pump. `on_activation`
    /// is invoked for every activation message the server pushes.
    pub async fn connect<F>(url: &str, on_activation: F) -> anyhow::Result<Self>
    where
        F: Fn(ActivationMessage) + Send + 'static,
    {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let body = match serde_json::to_string(&event) {
                    Ok(body) => body,
                    Err(e) => {
                        error!(error = %e, "failed to serialize signalling event");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(body)).await {
                    error!(error = %e, "signalling send failed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ActivationMessage>(&text) {
                        Ok(activation) => on_activation(activation),
                        Err(e) => warn!(error = %e, "ignoring unrecognized signalling message"),
                    },
                    Ok(Message::Close(_)) => {
                        info!("signalling server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "signalling read failed");
                        break;
                    }
                }
            }
        });

        Ok(Self { outbound: tx })
    }
}

#[async_trait]
impl SignallingClient for WebSocketSignallingClient {
    async fn send_event(&self, event: OutboundEvent) {
        if self.outbound.send(event).is_err() {
            error!("signalling channel closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_message_parses_expected_shape() {
        let json = r#"{
            "udp_host": "203.0.113.5",
            "udp_port": 9000,
            "websocket_id": 123
        }"#;
        let activation: ActivationMessage = serde_json::from_str(json).unwrap();
        assert_eq!(activation.udp_port, 9000);
        assert_eq!(activation.websocket_id, 123);
    }

    #[test]
    fn transmit_started_serializes_with_tagged_event_type() {
        let event = OutboundEvent::TransmitStarted {
            affiliation_id: "12345",
            user_name: "EchoStream",
            agency_name: "TestAgency".to_string(),
            channel_id: "channel_1".to_string(),
            time: 1_700_000_000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"transmit_started\""));
        assert!(json.contains("\"channel_id\":\"channel_1\""));
    }
}
