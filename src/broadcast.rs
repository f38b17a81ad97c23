//! Single-slot broadcast buffer shared between capture and the tone
//! detector / passthrough playback path (§3.2).
//!
//! Grounded on `audio.py`'s `SharedAudioBuffer`: one writer (capture),
//! one non-destructive reader (the tone detector, which only ever looks
//! at the tail of the buffer) and one destructive reader (passthrough
//! playback, which drains what it plays out). Both readers share the
//! same lock, so a passthrough window actively competes with the tone
//! detector for the same bytes — this is the behavior `audio.py` has and
//! §9 OQ3 keeps it rather than giving the detector its own copy.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

use crate::constants::SAMPLES_PER_FRAME;

struct Inner {
    samples: Vec<f32>,
    ready: bool,
}

pub struct BroadcastBuffer {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl BroadcastBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                samples: Vec::new(),
                ready: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Overwrites the slot with the latest capture (§3: "writers overwrite
    /// atomically"), discarding whatever a slow reader hadn't yet consumed.
    /// This is a single latest-frame hand-off, not an accumulating queue —
    /// matching `audio.py`'s `SharedAudioBuffer`, which assigns into its
    /// fixed-size array rather than appending.
    pub fn write(&self, samples: &[f32]) {
        let n = samples.len().min(SAMPLES_PER_FRAME);
        let mut inner = self.inner.lock();
        inner.samples.clear();
        inner.samples.extend_from_slice(&samples[..n]);
        inner.ready = true;
        self.condvar.notify_all();
    }

    /// Copies the current contents without consuming them. Used by the
    /// tone detector, which needs to keep re-scanning its sliding window.
    pub fn snapshot_into(&self, out: &mut Vec<f32>) {
        let inner = self.inner.lock();
        out.clear();
        out.extend_from_slice(&inner.samples);
    }

    /// Destructively reads up to `n` samples off the head. Any samples
    /// beyond `n` are shifted down rather than dropped, so a passthrough
    /// chunk size smaller than the last capture write doesn't lose audio.
    /// Used by passthrough playback, which should only ever play each
    /// sample once.
    pub fn consume_into(&self, out: &mut Vec<f32>, n: usize) {
        let mut inner = self.inner.lock();
        let take = inner.samples.len().min(n);
        out.clear();
        out.extend_from_slice(&inner.samples[..take]);
        inner.samples.drain(..take);
        if inner.samples.is_empty() {
            inner.ready = false;
        }
    }

    /// Blocks until a writer has published at least one sample, or the
    /// timeout elapses. Returns `false` on timeout.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.ready {
            return true;
        }
        let result = self.condvar.wait_for(&mut inner, timeout);
        !result.timed_out()
    }
}

impl Default for BroadcastBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_non_destructive() {
        let buf = BroadcastBuffer::new();
        buf.write(&[1.0, 2.0, 3.0]);
        let mut out = Vec::new();
        buf.snapshot_into(&mut out);
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
        buf.snapshot_into(&mut out);
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn consume_drains_buffer() {
        let buf = BroadcastBuffer::new();
        buf.write(&[1.0, 2.0]);
        let mut out = Vec::new();
        buf.consume_into(&mut out, 1024);
        assert_eq!(out, vec![1.0, 2.0]);
        buf.consume_into(&mut out, 1024);
        assert!(out.is_empty());
    }

    #[test]
    fn consume_competes_with_snapshot() {
        let buf = BroadcastBuffer::new();
        buf.write(&[1.0, 2.0, 3.0]);
        let mut consumed = Vec::new();
        buf.consume_into(&mut consumed, 1024);
        let mut snapshot = Vec::new();
        buf.snapshot_into(&mut snapshot);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn consume_partial_shifts_remainder_down() {
        let buf = BroadcastBuffer::new();
        buf.write(&[1.0, 2.0, 3.0, 4.0]);
        let mut out = Vec::new();
        buf.consume_into(&mut out, 2);
        assert_eq!(out, vec![1.0, 2.0]);
        assert!(buf.wait_ready(Duration::from_millis(1)));
        buf.consume_into(&mut out, 2);
        assert_eq!(out, vec![3.0, 4.0]);
    }

    #[test]
    fn wait_ready_times_out_when_empty() {
        let buf = BroadcastBuffer::new();
        assert!(!buf.wait_ready(Duration::from_millis(10)));
    }

    #[test]
    fn wait_ready_returns_true_once_written() {
        let buf = BroadcastBuffer::new();
        buf.write(&[0.5]);
        assert!(buf.wait_ready(Duration::from_millis(10)));
    }
}
