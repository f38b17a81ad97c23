//! Per-channel playback worker (§4.6; grounded on the teacher's
//! `build_output_stream` merged with `audio.py`'s `audio_output_worker`).
//!
//! The cpal output callback only ever pops from a small shared ring so it
//! never blocks; an async worker is the one deciding, every ~10ms, whether
//! the next [`DEVICE_CHUNK_SAMPLES`] chunk comes from the channel's jitter
//! buffer or — when this channel is the passthrough target and the
//! detector has activated passthrough — straight from the broadcast
//! buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::broadcast::BroadcastBuffer;
use crate::constants::{DEVICE_CHUNK_SAMPLES, PASSTHROUGH_GAIN, PLAYBACK_LOOP_SLEEP_MS};
use crate::jitter::JitterBuffer;
use crate::shutdown::Shutdown;

pub struct PlaybackConfig {
    pub device_name: Option<String>,
    /// Whether this channel is the configured passthrough target.
    pub is_passthrough_target: bool,
}

/// Small SPSC hand-off between the async mixer worker and the realtime
/// cpal callback. Plain `Mutex<VecDeque>` rather than a dedicated crate:
/// both sides only ever touch [`DEVICE_CHUNK_SAMPLES`]-sized spans at a
/// time, so contention is bounded the same way the broadcast buffer's is.
struct OutputRing {
    queue: Mutex<VecDeque<f32>>,
}

impl OutputRing {
    fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::with_capacity(DEVICE_CHUNK_SAMPLES * 4)) }
    }

    fn push(&self, samples: &[f32]) {
        let mut queue = self.queue.lock();
        queue.extend(samples.iter().copied());
    }

    fn pop(&self) -> f32 {
        self.queue.lock().pop_front().unwrap_or(0.0)
    }
}

fn open_output_stream(device_name: Option<&str>, ring: Arc<OutputRing>) -> anyhow::Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow::anyhow!("output device not found: {name}"))?,
        None => host.default_output_device().ok_or_else(|| anyhow::anyhow!("no default output device"))?,
    };

    let config = device.default_output_config()?;
    let stream = device.build_output_stream(
        &config.into(),
        move |out: &mut [f32], _| {
            for sample in out.iter_mut() {
                *sample = ring.pop();
            }
        },
        |err| error!(error = %err, "playback stream error"),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

/// Runs until `shutdown` fires, feeding the output device from either the
/// broadcast buffer (passthrough) or `jitter` (normal playback).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    channel_id: String,
    config: PlaybackConfig,
    jitter: Arc<Mutex<JitterBuffer>>,
    broadcast: Option<Arc<BroadcastBuffer>>,
    passthrough_active: Arc<AtomicBool>,
    shutdown: Arc<Shutdown>,
) -> anyhow::Result<()> {
    let ring = Arc::new(OutputRing::new());
    let _stream = open_output_stream(config.device_name.as_deref(), ring.clone())?;

    info!(channel = %channel_id, "playback worker started");

    let mut chunk = vec![0f32; DEVICE_CHUNK_SAMPLES];
    let mut passthrough_scratch: Vec<f32> = Vec::with_capacity(DEVICE_CHUNK_SAMPLES);

    while !shutdown.is_shutting_down() {
        let mut filled_from_passthrough = false;

        if config.is_passthrough_target && passthrough_active.load(Ordering::Acquire) {
            if let Some(buffer) = &broadcast {
                buffer.consume_into(&mut passthrough_scratch, DEVICE_CHUNK_SAMPLES);
                if !passthrough_scratch.is_empty() {
                    let n = passthrough_scratch.len().min(DEVICE_CHUNK_SAMPLES);
                    for i in 0..n {
                        chunk[i] = (passthrough_scratch[i] * PASSTHROUGH_GAIN).clamp(-1.0, 1.0);
                    }
                    for slot in chunk.iter_mut().skip(n) {
                        *slot = 0.0;
                    }
                    filled_from_passthrough = true;
                }
            }
        }

        if !filled_from_passthrough {
            jitter.lock().pull(&mut chunk);
        }

        ring.push(&chunk);

        tokio::time::sleep(Duration::from_millis(PLAYBACK_LOOP_SLEEP_MS)).await;
    }

    info!(channel = %channel_id, "playback worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_ring_pops_silence_when_empty() {
        let ring = OutputRing::new();
        assert_eq!(ring.pop(), 0.0);
    }

    #[test]
    fn output_ring_fifo_order() {
        let ring = OutputRing::new();
        ring.push(&[1.0, 2.0, 3.0]);
        assert_eq!(ring.pop(), 1.0);
        assert_eq!(ring.pop(), 2.0);
        assert_eq!(ring.pop(), 3.0);
        assert_eq!(ring.pop(), 0.0);
    }
}
