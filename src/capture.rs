//! Per-channel capture worker (§4.6; grounded on the teacher's
//! `build_input_stream` task merged with `audio.py`'s
//! `audio_input_worker`).
//!
//! The cpal callback runs on its own realtime thread and hands samples
//! off through an unbounded channel rather than doing any encoding work
//! itself — encoding, encryption and the accumulator live in the async
//! worker so the audio thread never blocks.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broadcast::BroadcastBuffer;
use crate::constants::{CAPTURE_ACCUMULATOR_SAMPLES, CAPTURE_IDLE_BACKOFF_MS, SAMPLES_PER_FRAME};
use crate::crypto::{encode_base64, encode_frame, encrypt, float_to_i16, new_encoder};
use crate::session::ChannelSession;
use crate::shutdown::Shutdown;
use crate::transport::UdpTransport;

pub struct CaptureConfig {
    pub device_name: Option<String>,
    /// Whether this channel's raw audio should also be mirrored into the
    /// shared broadcast buffer for tone detection / passthrough.
    pub is_tone_source: bool,
}

fn open_input_stream(device_name: Option<&str>, tx: mpsc::UnboundedSender<Vec<f32>>) -> anyhow::Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow::anyhow!("input device not found: {name}"))?,
        None => host.default_input_device().ok_or_else(|| anyhow::anyhow!("no default input device"))?,
    };

    let config = device.default_input_config()?;
    let stream = device.build_input_stream(
        &config.into(),
        move |data: &[f32], _| {
            let _ = tx.send(data.to_vec());
        },
        |err| error!(error = %err, "capture stream error"),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

/// Runs until `shutdown` fires. Reads device audio, optionally mirrors it
/// into `broadcast`, and transmits encoded/encrypted frames over
/// `transport` whenever `session.ptt_active` is set.
pub async fn run(
    channel_id: String,
    config: CaptureConfig,
    session: Arc<ChannelSession>,
    transport: Arc<UdpTransport>,
    broadcast: Option<Arc<BroadcastBuffer>>,
    shutdown: Arc<Shutdown>,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<f32>>();
    let _stream = open_input_stream(config.device_name.as_deref(), tx)?;
    let mut encoder = new_encoder()?;

    let mut accumulator: Vec<f32> = Vec::with_capacity(CAPTURE_ACCUMULATOR_SAMPLES);

    info!(channel = %channel_id, "capture worker started");

    loop {
        if shutdown.is_shutting_down() {
            break;
        }

        let chunk = match tokio::time::timeout(Duration::from_millis(CAPTURE_IDLE_BACKOFF_MS), rx.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break, // stream dropped
            Err(_) => continue,
        };

        if !session.ptt_active.load(Ordering::SeqCst) {
            continue;
        }

        // `audio_input_worker` only mirrors into the shared buffer once
        // `gpio_active` (our `ptt_active`) gates the read at all; a cpal
        // callback keeps delivering samples regardless, so the gate is
        // applied here instead of around opening the device.
        if config.is_tone_source {
            if let Some(buffer) = &broadcast {
                buffer.write(&chunk);
            }
        }

        accumulator.extend_from_slice(&chunk);
        // The accumulator is capped at its physical 4800-sample size
        // (`audio_input_worker`'s `input_buffer_pos` wraps to 0 rather than
        // growing unbounded); since we drain a 1920-sample frame out the
        // moment one is available, this only trims a pathological backlog.
        if accumulator.len() > CAPTURE_ACCUMULATOR_SAMPLES {
            let excess = accumulator.len() - CAPTURE_ACCUMULATOR_SAMPLES;
            accumulator.drain(..excess);
        }

        while accumulator.len() >= SAMPLES_PER_FRAME {
            let frame: Vec<f32> = accumulator.drain(..SAMPLES_PER_FRAME).collect();
            if let Err(e) = encode_and_send(&channel_id, &frame, &mut encoder, &session, &transport).await {
                warn!(channel = %channel_id, error = %e, "failed to send captured frame");
            }
        }
    }

    info!(channel = %channel_id, "capture worker stopped");
    Ok(())
}

async fn encode_and_send(
    channel_id: &str,
    frame: &[f32],
    encoder: &mut opus::Encoder,
    session: &ChannelSession,
    transport: &UdpTransport,
) -> anyhow::Result<()> {
    let Some(key) = session.key() else {
        return Ok(()); // no session key installed yet; drop silently like udp.py's zero-key guard
    };

    let pcm = float_to_i16(frame);
    let encoded = encode_frame(encoder, &pcm)?;
    let encrypted = encrypt(&encoded, &key)?;
    let b64 = encode_base64(&encrypted);
    transport.send_audio(channel_id, b64).await
}
