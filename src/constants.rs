//! Process-wide constants shared across modules.

/// Number of PTT-gated voice channels the agent supports.
pub const MAX_CHANNELS: usize = 4;

/// Jitter buffer depth, in frames (8 * 40ms = 320ms nominal).
pub const JITTER_BUFFER_SIZE: usize = 8;

/// One Opus frame: 40ms @ 48kHz mono.
pub const SAMPLES_PER_FRAME: usize = 1920;

pub const SAMPLE_RATE: u32 = 48_000;

/// Capture/playback device I/O chunk size.
pub const DEVICE_CHUNK_SAMPLES: usize = 1024;

/// Capture accumulator size (100ms @ 48kHz).
pub const CAPTURE_ACCUMULATOR_SAMPLES: usize = 4800;

pub const MAX_TONE_DEFINITIONS: usize = 50;
pub const MAX_FILTERS: usize = 20;

/// Maximum sliding window retained by the tone detector.
pub const TONE_BUFFER_SECONDS: u32 = 10;

/// Gain applied to jitter-buffer playback (decoded network audio).
pub const PLAYBACK_GAIN: f32 = 1.5;

/// Gain applied to passthrough playback (direct channel-to-channel routing).
pub const PASSTHROUGH_GAIN: f32 = 15.0;

/// Gain applied to received audio before it enters the jitter buffer.
pub const RECEIVE_GAIN: f32 = 20.0;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub const UDP_MAX_DATAGRAM: usize = 8192;
pub const UDP_RECV_TIMEOUT_MS: u64 = 100;
pub const UDP_KEEPALIVE_INTERVAL_SECS: u64 = 10;

pub const PTT_POLL_INTERVAL_MS: u64 = 100;
pub const PTT_KEEPALIVE_TICKS: u32 = 10; // 10 * 100ms = 1s
pub const PTT_STATUS_TICKS: u32 = 100; // 100 * 100ms = 10s

pub const CAPTURE_IDLE_BACKOFF_MS: u64 = 100;
pub const PLAYBACK_LOOP_SLEEP_MS: u64 = 10;
