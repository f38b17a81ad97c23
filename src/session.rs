//! Control surface gluing PTT edges to signalling events and session-key
//! installation (§5, §6; grounded on `websocket.py` and `audio.py`'s
//! `setup_channel`).
//!
//! `websocket_handler` installs the same session key into every *active*
//! channel the moment the server activates the transport, and immediately
//! emits `transmit_started` for any channel whose PTT line was already
//! held down at connect time — the other half of the "pre-held PTT" story
//! whose other half lives in [`crate::ptt::PttEdgeDetector::prime`]. Unlike
//! the original, the key itself comes from the device's own Configuration
//! input (§6), not the signalling channel (see [`crate::config`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::info;

use crate::constants::{KEY_LEN, MAX_CHANNELS};
use crate::signalling::{OutboundEvent, SignallingClient};

const AFFILIATION_ID: &str = "12345";
const USER_NAME: &str = "EchoStream";

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub struct ChannelSession {
    pub channel_id: String,
    pub agency_name: String,
    pub session_key: parking_lot::RwLock<Option<[u8; KEY_LEN]>>,
    pub ptt_active: AtomicBool,
}

impl ChannelSession {
    pub fn new(channel_id: String, agency_name: String) -> Self {
        Self {
            channel_id,
            agency_name,
            session_key: parking_lot::RwLock::new(None),
            ptt_active: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> Option<[u8; KEY_LEN]> {
        *self.session_key.read()
    }
}

/// Coordinates the per-channel state that reacts to connect/PTT events.
/// Kept as a trait so `ptt`'s worker and tests can drive it without a
/// live WebSocket connection.
#[async_trait]
pub trait ControlSurface: Send + Sync {
    async fn emit_connect(&self, channel: &ChannelSession);
    async fn emit_transmit_started(&self, channel: &ChannelSession);
    async fn emit_transmit_ended(&self, channel: &ChannelSession);

    /// Hook the PTT edge detector calls once a second (§4.4). The default
    /// no-op is correct for a `SignallingControlSurface`: `tokio-tungstenite`
    /// already answers WebSocket pings at the protocol layer, so there is
    /// nothing this hook needs to do unless a future transport requires an
    /// application-level heartbeat.
    async fn keepalive(&self) {}
}

pub struct SignallingControlSurface<C: SignallingClient> {
    client: Arc<C>,
}

impl<C: SignallingClient> SignallingControlSurface<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: SignallingClient> ControlSurface for SignallingControlSurface<C> {
    async fn emit_connect(&self, channel: &ChannelSession) {
        self.client
            .send_event(OutboundEvent::Connect {
                channel_id: channel.channel_id.clone(),
            })
            .await;
    }

    async fn emit_transmit_started(&self, channel: &ChannelSession) {
        self.client
            .send_event(OutboundEvent::TransmitStarted {
                affiliation_id: AFFILIATION_ID,
                user_name: USER_NAME,
                agency_name: channel.agency_name.clone(),
                channel_id: channel.channel_id.clone(),
                time: now_unix(),
            })
            .await;
    }

    async fn emit_transmit_ended(&self, channel: &ChannelSession) {
        self.client
            .send_event(OutboundEvent::TransmitEnded {
                affiliation_id: AFFILIATION_ID,
                user_name: USER_NAME,
                agency_name: channel.agency_name.clone(),
                channel_id: channel.channel_id.clone(),
                time: now_unix(),
            })
            .await;
    }
}

/// Installs the pre-shared session key — sourced from the device
/// Configuration input (§6), decoded once at config-load time, never from
/// the signalling channel's activation message — into every channel, and
/// fires `transmit_started` for channels whose PTT line is already active.
pub async fn install_session_key<C: ControlSurface>(
    session_key: [u8; KEY_LEN],
    sessions: &[Arc<ChannelSession>],
    control: &C,
) {
    for session in sessions.iter().take(MAX_CHANNELS) {
        *session.session_key.write() = Some(session_key);
        if session.ptt_active.load(Ordering::SeqCst) {
            info!(channel = %session.channel_id, "channel already transmitting at connect time");
            control.emit_transmit_started(session).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingControl {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ControlSurface for RecordingControl {
        async fn emit_connect(&self, channel: &ChannelSession) {
            self.events.lock().unwrap().push(format!("connect:{}", channel.channel_id));
        }
        async fn emit_transmit_started(&self, channel: &ChannelSession) {
            self.events.lock().unwrap().push(format!("started:{}", channel.channel_id));
        }
        async fn emit_transmit_ended(&self, channel: &ChannelSession) {
            self.events.lock().unwrap().push(format!("ended:{}", channel.channel_id));
        }
    }

    #[tokio::test]
    async fn install_session_key_reaches_every_channel() {
        let sessions = vec![
            Arc::new(ChannelSession::new("channel_1".into(), "TestAgency".into())),
            Arc::new(ChannelSession::new("channel_2".into(), "TestAgency".into())),
        ];
        let control = RecordingControl { events: Mutex::new(Vec::new()) };

        install_session_key([7u8; KEY_LEN], &sessions, &control).await;

        assert!(sessions[0].key().is_some());
        assert!(sessions[1].key().is_some());
        assert_eq!(sessions[0].key(), sessions[1].key());
    }

    #[tokio::test]
    async fn install_session_key_emits_transmit_started_for_already_active_channel() {
        let sessions = vec![Arc::new(ChannelSession::new("channel_1".into(), "TestAgency".into()))];
        sessions[0].ptt_active.store(true, Ordering::SeqCst);
        let control = RecordingControl { events: Mutex::new(Vec::new()) };

        install_session_key([7u8; KEY_LEN], &sessions, &control).await;

        assert_eq!(control.events.lock().unwrap().as_slice(), ["started:channel_1"]);
    }
}
