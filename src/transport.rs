//! Shared UDP transport (§4.5; grounded on `udp.py`).
//!
//! One socket serves every channel. Inbound datagrams are read with a
//! 100ms timeout so the receive loop can notice shutdown promptly; a
//! separate task sends a keepalive at startup and every 10s after.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

use crate::constants::{RECEIVE_GAIN, UDP_KEEPALIVE_INTERVAL_SECS, UDP_MAX_DATAGRAM, UDP_RECV_TIMEOUT_MS};
use crate::crypto::{decode_base64, decrypt, new_decoder};
use crate::error::TransportError;
use crate::jitter::{AudioFrame, JitterBuffer};
use crate::session::ChannelSession;
use crate::shutdown::Shutdown;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InboundMessage {
    Audio { channel_id: String, data: String },
    #[serde(rename = "KEEP_ALIVE")]
    KeepAlive,
}

#[derive(Serialize)]
struct OutboundAudio<'a> {
    channel_id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    data: String,
}

#[derive(Serialize)]
struct OutboundKeepAlive {
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Per-channel state the receive loop needs: where to decrypt against
/// and where decoded audio lands.
pub struct ChannelTransportState {
    pub channel_id: String,
    pub session: Arc<ChannelSession>,
    /// Shared with this channel's playback worker, which is the sole
    /// reader; the receive loop is the sole writer (§5 shared-resource
    /// policy).
    pub jitter: Arc<Mutex<JitterBuffer>>,
    decoder: Mutex<opus::Decoder>,
    decrypt_fail_count: AtomicU64,
    jitter_drop_logged: AtomicU64,
    zero_key_warned: std::sync::atomic::AtomicBool,
}

impl ChannelTransportState {
    pub fn new(channel_id: String, session: Arc<ChannelSession>) -> crate::error::Result<Self> {
        Ok(Self {
            channel_id,
            session,
            jitter: Arc::new(Mutex::new(JitterBuffer::new())),
            decoder: Mutex::new(new_decoder()?),
            decrypt_fail_count: AtomicU64::new(0),
            jitter_drop_logged: AtomicU64::new(0),
            zero_key_warned: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn connect(host: &str, port: u16) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server: SocketAddr = format!("{host}:{port}").parse()?;
        socket.connect(server).await?;
        let transport = Self { socket: Arc::new(socket) };
        transport.send_keepalive().await?;
        Ok(transport)
    }

    pub async fn send_keepalive(&self) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&OutboundKeepAlive { kind: "KEEP_ALIVE" })?;
        self.socket.send(&body).await?;
        Ok(())
    }

    pub async fn send_audio(&self, channel_id: &str, encrypted_b64: String) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&OutboundAudio {
            channel_id,
            kind: "audio",
            data: encrypted_b64,
        })?;
        self.socket.send(&body).await?;
        Ok(())
    }

    /// Sends a keepalive immediately, then every `UDP_KEEPALIVE_INTERVAL_SECS`,
    /// until shutdown. Mirrors `heartbeat_worker`.
    pub async fn run_keepalive(&self, shutdown: Arc<Shutdown>) {
        let mut tick: u64 = 0;
        while !shutdown.is_shutting_down() {
            tokio::time::sleep(Duration::from_secs(UDP_KEEPALIVE_INTERVAL_SECS)).await;
            if let Err(e) = self.send_keepalive().await {
                warn!(error = %e, "keepalive send failed");
            }
            tick += 1;
            if tick % 60 == 0 {
                debug!(ticks = tick, "keepalive still running");
            }
        }
    }

    /// Reads datagrams until shutdown, routing decoded audio into the
    /// matching channel's jitter buffer. Mirrors `udp_listener_worker`.
    pub async fn run_receive_loop(&self, channels: Arc<Vec<ChannelTransportState>>, shutdown: Arc<Shutdown>) {
        let mut buf = vec![0u8; UDP_MAX_DATAGRAM];
        let unknown_channel_count = AtomicU64::new(0);
        while !shutdown.is_shutting_down() {
            let read = tokio::time::timeout(Duration::from_millis(UDP_RECV_TIMEOUT_MS), self.socket.recv(&mut buf)).await;
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(error = %e, "udp recv failed");
                    continue;
                }
                Err(_) => continue, // timed out; loop back to check shutdown
            };

            let message: InboundMessage = match serde_json::from_slice(&buf[..n]) {
                Ok(m) => m,
                Err(e) => {
                    let err = TransportError::MalformedDatagram(e.to_string());
                    debug!(error = %err, "ignoring malformed datagram");
                    continue;
                }
            };

            let InboundMessage::Audio { channel_id, data } = message else { continue };

            let Some(channel) = channels.iter().find(|c| c.channel_id == channel_id) else {
                let err = TransportError::UnknownChannel(channel_id.clone());
                let count = unknown_channel_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count == 1 || count % 50 == 0 {
                    warn!(%err, "dropping datagram for unrecognized channel");
                }
                continue;
            };

            let Some(key) = channel.session.key() else {
                if !channel.zero_key_warned.swap(true, Ordering::SeqCst) {
                    let err = TransportError::ZeroKey(channel_id.clone());
                    warn!(%err, "dropping audio: no session key installed yet");
                }
                continue;
            };

            let encrypted = decode_base64(&data);
            let plaintext = match decrypt(&encrypted, &key) {
                Ok(p) => p,
                Err(e) => {
                    let err = TransportError::from(e);
                    let count = channel.decrypt_fail_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if count == 1 || count % 50 == 0 {
                        error!(channel = %channel_id, count, error = %err, "decrypt failed");
                    }
                    continue;
                }
            };

            let pcm = {
                let mut decoder = channel.decoder.lock();
                match crate::crypto::decode_frame(&mut decoder, &plaintext) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        error!(channel = %channel_id, error = %e, "opus decode failed");
                        continue;
                    }
                }
            };

            let samples: Vec<f32> = pcm
                .iter()
                .map(|&s| ((s as f32 / 32767.0) * RECEIVE_GAIN).clamp(-1.0, 1.0))
                .collect();

            let mut jitter = channel.jitter.lock();
            let before = jitter.frame_count();
            jitter.push(AudioFrame::from_samples(&samples));
            if jitter.drop_count > 0 && before == crate::constants::JITTER_BUFFER_SIZE && jitter.drop_count % 100 == 0 {
                warn!(channel = %channel_id, drops = jitter.drop_count, "jitter buffer dropping frames");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_serializes_to_expected_literal() {
        let body = serde_json::to_string(&OutboundKeepAlive { kind: "KEEP_ALIVE" }).unwrap();
        assert_eq!(body, r#"{"type":"KEEP_ALIVE"}"#);
    }

    #[test]
    fn inbound_audio_message_parses() {
        let json = r#"{"type":"audio","channel_id":"channel_1","data":"AAA="}"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, InboundMessage::Audio { channel_id, .. } if channel_id == "channel_1"));
    }

    #[test]
    fn inbound_keepalive_message_parses() {
        let json = r#"{"type":"KEEP_ALIVE"}"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, InboundMessage::KeepAlive));
    }
}
