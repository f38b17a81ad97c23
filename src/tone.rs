//! Two-tone and single-persistent-tone paging detection (§4.8).
//!
//! Grounded on `tone_detect.py`'s `process_audio_python_approach`: tone
//! definitions are grouped by their `(a_length_ms, b_length_ms)` pair and
//! the longest-total-duration group is tried first, since a longer match
//! is a stronger signal. Frequency estimation is an FFT peak search with
//! parabolic interpolation on the log-magnitude spectrum for sub-bin
//! refinement (`parabolic()` / `freq_from_fft()` in the same file).

use std::collections::{HashMap, VecDeque};

use rustfft::{num_complex::Complex, FftPlanner};

use crate::constants::{SAMPLE_RATE, TONE_BUFFER_SECONDS};

#[derive(Debug, Clone)]
pub struct ToneDefinition {
    pub id: String,
    pub tone_a_hz: f64,
    pub tone_b_hz: f64,
    pub a_length_ms: u64,
    pub b_length_ms: u64,
    pub a_range_hz: f64,
    pub b_range_hz: f64,
    /// Recording/passthrough window armed when this definition matches;
    /// each definition carries its own, per `tone_detect.py`'s
    /// `ToneDefinition.record_length_ms` (`trigger_tone_passthrough` reads
    /// it off the matched definition, not a channel-wide setting).
    pub record_length_ms: u64,
    /// `detection_tone_alert` in the original — stored for round-tripping
    /// the configuration schema but not consulted by detection itself.
    pub alert_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Above,
    Below,
    Center,
}

#[derive(Debug, Clone)]
pub struct FrequencyFilter {
    pub id: String,
    pub kind: FilterKind,
    pub frequency_hz: f64,
    pub range_hz: f64,
}

impl FrequencyFilter {
    /// Returns whether `freq_hz` falls inside the region this filter excludes.
    pub fn excludes(&self, freq_hz: f64) -> bool {
        match self.kind {
            FilterKind::Above => freq_hz > self.frequency_hz,
            FilterKind::Below => freq_hz < self.frequency_hz,
            FilterKind::Center => (freq_hz - self.frequency_hz).abs() <= self.range_hz,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToneDetectConfig {
    pub enabled: bool,
    pub tone_defs: Vec<ToneDefinition>,
    pub filters: Vec<FrequencyFilter>,
    pub tone_passthrough: bool,
    /// `channel_id` of the configured passthrough target, resolved at
    /// config-load time from the `"channel_one"`..`"channel_four"` name in
    /// the JSON (see `audio.py`'s `is_configured_passthrough_channel_id`).
    pub passthrough_channel_id: Option<String>,
    pub threshold: f64,
    pub gain: f64,
    /// `db_threshold` in the original — parsed for schema round-tripping
    /// but never read by `set_tone_config`, which only logs it.
    pub db_threshold: f64,
    pub new_tone_detect: bool,
    pub new_tone_length_ms: u64,
    pub new_tone_range_hz: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToneEvent {
    TwoTone {
        tone_id: String,
        tone_a_hz: f64,
        tone_b_hz: f64,
        record_length_ms: u64,
    },
    NewTone {
        frequency_hz: f64,
        duration_ms: u64,
        range_hz: f64,
    },
}

/// Quadratic ("parabolic") interpolation around a spectral peak, per
/// `tone_detect.py`'s `parabolic()`. `y` is the log-magnitude spectrum and
/// `peak` the index of its maximum; returns the fractional bin offset.
fn parabolic(y: &[f64], peak: usize) -> f64 {
    if peak == 0 || peak + 1 >= y.len() {
        return 0.0;
    }
    let (ym1, y0, yp1) = (y[peak - 1], y[peak], y[peak + 1]);
    0.5 * (ym1 - yp1) / (ym1 - 2.0 * y0 + yp1)
}

/// Estimates the dominant frequency of `samples` via a Hann-windowed FFT
/// with parabolic sub-bin refinement.
pub fn estimate_frequency(samples: &[f32], sample_rate: u32) -> f64 {
    let n = samples.len();
    if n < 4 {
        return 0.0;
    }

    let mut buf: Vec<Complex<f64>> = samples
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            // Hann window.
            let w = 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / (n as f64 - 1.0)).cos();
            Complex::new(s as f64 * w, 0.0)
        })
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buf);

    let half = n / 2;
    let log_mag: Vec<f64> = buf[..half].iter().map(|c| (c.norm() + 1e-10).ln()).collect();

    let (peak, _) = log_mag
        .iter()
        .enumerate()
        .fold((0usize, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });

    if peak == 0 {
        return 0.0;
    }

    let offset = parabolic(&log_mag, peak);
    (peak as f64 + offset) * sample_rate as f64 / n as f64
}

fn is_in_range(estimate_hz: f64, target_hz: f64, range_hz: f64) -> bool {
    (estimate_hz - target_hz).abs() <= range_hz.max(10.0)
}

/// Sliding-window state for one channel's tone detector.
pub struct ToneDetectorState {
    config: ToneDetectConfig,
    buffer: VecDeque<f32>,
    max_buffer_samples: usize,
    /// Time of the last tone-sequence detection, shared across every
    /// definition (§3 `ToneDetectorState.last_detect_time_ms`) — matches
    /// `tone_detect.py`'s single `global_tone_detection.last_detect_time`,
    /// not a per-definition debounce.
    last_detect_ms: u64,
    last_new_tone_ms: u64,
    pub passthrough_active: bool,
    recording_deadline_ms: Option<u64>,
}

impl ToneDetectorState {
    pub fn new(config: ToneDetectConfig) -> Self {
        let max_buffer_samples = TONE_BUFFER_SECONDS as usize * SAMPLE_RATE as usize;
        Self {
            config,
            buffer: VecDeque::with_capacity(max_buffer_samples),
            max_buffer_samples,
            last_detect_ms: 0,
            last_new_tone_ms: 0,
            passthrough_active: false,
            recording_deadline_ms: None,
        }
    }

    /// Appends newly captured samples to the sliding window, truncating
    /// the oldest samples to stay within `TONE_BUFFER_SECONDS`, then runs
    /// both detection passes. Returns any events produced this tick.
    pub fn process_audio(&mut self, samples: &[f32], now_ms: u64) -> Vec<ToneEvent> {
        if !self.config.enabled {
            return Vec::new();
        }

        self.buffer.extend(samples.iter().copied());
        while self.buffer.len() > self.max_buffer_samples {
            self.buffer.pop_front();
        }

        let mut events = Vec::new();
        if let Some(event) = self.process_two_tone(now_ms) {
            events.push(event);
        }
        if let Some(event) = self.process_new_tone(now_ms) {
            events.push(event);
        }
        events
    }

    fn tail_segment(&self, len_ms: u64, offset_from_end_ms: u64) -> Vec<f32> {
        let samples_per_ms = SAMPLE_RATE as u64 / 1000;
        let len_samples = (len_ms * samples_per_ms) as usize;
        let offset_samples = (offset_from_end_ms * samples_per_ms) as usize;
        let total = self.buffer.len();
        if total < offset_samples + len_samples {
            return Vec::new();
        }
        let end = total - offset_samples;
        let start = end - len_samples;
        self.buffer.iter().skip(start).take(len_samples).copied().collect()
    }

    fn process_two_tone(&mut self, now_ms: u64) -> Option<ToneEvent> {
        let mut groups: HashMap<(u64, u64), Vec<&ToneDefinition>> = HashMap::new();
        for def in &self.config.tone_defs {
            groups.entry((def.a_length_ms, def.b_length_ms)).or_default().push(def);
        }

        let mut ordered: Vec<_> = groups.into_iter().collect();
        ordered.sort_by_key(|((a, b), _)| std::cmp::Reverse(a + b));

        for ((a_len, b_len), defs) in ordered {
            if self.buffer.len() < ((a_len + b_len) * SAMPLE_RATE as u64 / 1000) as usize {
                continue;
            }

            // Tone B is the most recent segment; tone A precedes it.
            let b_segment = self.tail_segment(b_len, 0);
            let a_segment = self.tail_segment(a_len, b_len);
            if a_segment.len() < SAMPLE_RATE as usize / 10 || b_segment.len() < SAMPLE_RATE as usize / 10 {
                continue;
            }

            let est_a = estimate_frequency(&a_segment, SAMPLE_RATE);
            let est_b = estimate_frequency(&b_segment, SAMPLE_RATE);

            let debounce_ms = a_len.max(b_len);
            if now_ms.saturating_sub(self.last_detect_ms) <= debounce_ms {
                continue;
            }

            for def in defs {
                if !is_in_range(est_a, def.tone_a_hz, def.a_range_hz) || !is_in_range(est_b, def.tone_b_hz, def.b_range_hz) {
                    continue;
                }
                self.last_detect_ms = now_ms;
                self.activate_passthrough(now_ms, def.record_length_ms);
                return Some(ToneEvent::TwoTone {
                    tone_id: def.id.clone(),
                    tone_a_hz: est_a,
                    tone_b_hz: est_b,
                    record_length_ms: def.record_length_ms,
                });
            }
        }
        None
    }

    fn process_new_tone(&mut self, now_ms: u64) -> Option<ToneEvent> {
        if !self.config.new_tone_detect {
            return None;
        }
        let segment = self.tail_segment(self.config.new_tone_length_ms, 0);
        if segment.len() < SAMPLE_RATE as usize / 10 {
            return None;
        }

        let rms = (segment.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / segment.len() as f64).sqrt();
        if rms * self.config.gain < self.config.threshold {
            return None;
        }

        let freq = estimate_frequency(&segment, SAMPLE_RATE);
        if self.config.filters.iter().any(|f| f.excludes(freq)) {
            return None;
        }

        if now_ms.saturating_sub(self.last_new_tone_ms) <= self.config.new_tone_length_ms {
            return None;
        }
        self.last_new_tone_ms = now_ms;

        Some(ToneEvent::NewTone {
            frequency_hz: freq,
            duration_ms: self.config.new_tone_length_ms,
            range_hz: self.config.new_tone_range_hz,
        })
    }

    fn activate_passthrough(&mut self, now_ms: u64, record_length_ms: u64) {
        self.passthrough_active = true;
        if record_length_ms > 0 {
            self.recording_deadline_ms = Some(now_ms + record_length_ms);
        }
    }

    /// Milliseconds remaining in the active recording window, if any.
    pub fn recording_time_remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.recording_deadline_ms.map(|deadline| deadline.saturating_sub(now_ms))
    }

    /// Clears `passthrough_active`/the recording timer once they've expired.
    pub fn expire_recording(&mut self, now_ms: u64) {
        if let Some(deadline) = self.recording_deadline_ms {
            if now_ms >= deadline {
                self.recording_deadline_ms = None;
                self.passthrough_active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq_hz: f64, duration_ms: u64) -> Vec<f32> {
        let n = (SAMPLE_RATE as u64 * duration_ms / 1000) as usize;
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq_hz * i as f64 / SAMPLE_RATE as f64).sin() as f32 * 0.8)
            .collect()
    }

    #[test]
    fn estimate_frequency_finds_known_tone() {
        let samples = sine(1000.0, 200);
        let est = estimate_frequency(&samples, SAMPLE_RATE);
        assert!((est - 1000.0).abs() < 15.0, "estimate was {est}");
    }

    #[test]
    fn filter_center_excludes_within_range() {
        let filter = FrequencyFilter {
            id: "f1".into(),
            kind: FilterKind::Center,
            frequency_hz: 1000.0,
            range_hz: 20.0,
        };
        assert!(filter.excludes(1005.0));
        assert!(!filter.excludes(2000.0));
    }

    #[test]
    fn two_tone_match_emits_event_and_activates_passthrough() {
        let config = ToneDetectConfig {
            enabled: true,
            tone_defs: vec![ToneDefinition {
                id: "pair-1".into(),
                tone_a_hz: 800.0,
                tone_b_hz: 1000.0,
                a_length_ms: 500,
                b_length_ms: 500,
                a_range_hz: 15.0,
                b_range_hz: 15.0,
                record_length_ms: 5_000,
                alert_id: None,
            }],
            filters: vec![],
            tone_passthrough: true,
            passthrough_channel_id: None,
            threshold: 0.0,
            gain: 1.0,
            db_threshold: 30.0,
            new_tone_detect: false,
            new_tone_length_ms: 0,
            new_tone_range_hz: 0.0,
        };
        let mut detector = ToneDetectorState::new(config);

        let mut audio = sine(800.0, 500);
        audio.extend(sine(1000.0, 500));
        let events = detector.process_audio(&audio, 1_000);

        assert_eq!(events.len(), 1);
        match &events[0] {
            ToneEvent::TwoTone { tone_id, tone_a_hz, tone_b_hz, record_length_ms } => {
                assert_eq!(tone_id, "pair-1");
                assert!((tone_a_hz - 800.0).abs() < 15.0);
                assert!((tone_b_hz - 1000.0).abs() < 15.0);
                assert_eq!(*record_length_ms, 5_000);
            }
            other => panic!("expected TwoTone, got {other:?}"),
        }
        assert!(detector.passthrough_active);
        assert!(detector.recording_time_remaining_ms(1_000).unwrap() > 0);
    }

    #[test]
    fn debounce_suppresses_repeat_within_window() {
        let config = ToneDetectConfig {
            enabled: true,
            tone_defs: vec![ToneDefinition {
                id: "pair-1".into(),
                tone_a_hz: 800.0,
                tone_b_hz: 1000.0,
                a_length_ms: 300,
                b_length_ms: 300,
                a_range_hz: 15.0,
                b_range_hz: 15.0,
                record_length_ms: 0,
                alert_id: None,
            }],
            filters: vec![],
            tone_passthrough: false,
            passthrough_channel_id: None,
            threshold: 0.0,
            gain: 1.0,
            db_threshold: 30.0,
            new_tone_detect: false,
            new_tone_length_ms: 0,
            new_tone_range_hz: 0.0,
        };
        let mut detector = ToneDetectorState::new(config);
        let mut audio = sine(800.0, 300);
        audio.extend(sine(1000.0, 300));

        let first = detector.process_audio(&audio, 1_000);
        assert_eq!(first.len(), 1);
        let second = detector.process_audio(&audio, 1_050);
        assert!(second.is_empty());
    }
}
