//! Push-to-talk GPIO edge detection (§4.4).
//!
//! Grounded on `gpio.py`'s `gpio_monitor_worker`: four active-low input
//! lines, each wired to a fixed channel slot by position (line *i* drives
//! `channels[i]`) rather than by any config-provided mapping — see §9 OQ1
//! and `DESIGN.md`. The GPIO offsets below (20, 21, 23, 24) are the exact
//! line numbers `gpio.py` requests on physical pins 38/40/16/18.

use crate::constants::MAX_CHANNELS;

pub const GPIO_LINE_OFFSETS: [u32; MAX_CHANNELS] = [20, 21, 23, 24];

/// Abstracts the physical PTT lines so the edge detector can be tested
/// without real hardware.
pub trait PttLines: Send {
    /// Reads the current state of every line this build knows about.
    /// `None` at an index means that channel has no corresponding line
    /// (fewer than `MAX_CHANNELS` configured channels).
    fn read(&mut self) -> [Option<bool>; MAX_CHANNELS];
}

#[cfg(target_os = "linux")]
pub struct GpioCdevLines {
    handles: Vec<Option<gpio_cdev::LineHandle>>,
}

#[cfg(target_os = "linux")]
impl GpioCdevLines {
    /// Opens `chip_path` (typically `/dev/gpiochip0`) and requests the
    /// first `channel_count` lines from [`GPIO_LINE_OFFSETS`] as
    /// active-low inputs. The pull-up itself is expected to already be
    /// configured (in hardware or via an external overlay) since
    /// `gpio-cdev` 0.6 does not expose bias flags.
    pub fn open(chip_path: &str, channel_count: usize) -> anyhow::Result<Self> {
        let mut chip = gpio_cdev::Chip::new(chip_path)?;
        let mut handles = Vec::with_capacity(MAX_CHANNELS);
        for (i, &offset) in GPIO_LINE_OFFSETS.iter().enumerate() {
            if i >= channel_count {
                handles.push(None);
                continue;
            }
            let line = chip.get_line(offset)?;
            let handle = line.request(
                gpio_cdev::LineRequestFlags::INPUT | gpio_cdev::LineRequestFlags::ACTIVE_LOW,
                0,
                "echostream-ptt",
            )?;
            handles.push(Some(handle));
        }
        Ok(Self { handles })
    }

    /// A handle with no lines requested at all. Used when the real chip
    /// can't be opened, so the process still comes up — every channel
    /// reads as unmapped (`None`), which `PttEdgeDetector` treats the same
    /// as a held-low, inactive line, instead of failing outright over a
    /// dev machine with no GPIO hardware.
    pub fn inactive() -> Self {
        Self { handles: (0..MAX_CHANNELS).map(|_| None).collect() }
    }
}

#[cfg(target_os = "linux")]
impl PttLines for GpioCdevLines {
    fn read(&mut self) -> [Option<bool>; MAX_CHANNELS] {
        let mut out = [None; MAX_CHANNELS];
        for (i, handle) in self.handles.iter().enumerate() {
            if let Some(handle) = handle {
                // ACTIVE_LOW flag inverts the raw line value for us, so a
                // non-zero read here already means "pressed".
                out[i] = handle.get_value().ok().map(|v| v != 0);
            }
        }
        out
    }
}

/// Stand-in for builds with no GPIO backend (anything but Linux). Always
/// reports every line inactive rather than failing to start, mirroring how
/// the rest of the agent runs cross-platform for development even though
/// the GPIO chip only exists on the deployed hardware.
#[cfg(not(target_os = "linux"))]
pub struct InactiveLines;

#[cfg(not(target_os = "linux"))]
impl PttLines for InactiveLines {
    fn read(&mut self) -> [Option<bool>; MAX_CHANNELS] {
        [Some(false); MAX_CHANNELS]
    }
}

/// Transmit edge events produced by a poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttEdge {
    Started,
    Ended,
}

/// Tracks per-channel PTT state across polls and reports transitions.
pub struct PttEdgeDetector<L: PttLines> {
    lines: L,
    active: [bool; MAX_CHANNELS],
}

impl<L: PttLines> PttEdgeDetector<L> {
    pub fn new(lines: L) -> Self {
        Self {
            lines,
            active: [false; MAX_CHANNELS],
        }
    }

    /// Reads the lines once and silently adopts the result as the
    /// starting state, without producing edges. Mirrors `gpio.py`
    /// applying initial pin states before entering its poll loop: a
    /// PTT held down at startup begins transmitting, but the
    /// `transmit_started` notification for that case is emitted later,
    /// by the session/control surface at connect time, not here.
    pub fn prime(&mut self) {
        for (i, state) in self.lines.read().iter().enumerate() {
            if let Some(active) = state {
                self.active[i] = *active;
            }
        }
    }

    pub fn is_active(&self, channel_index: usize) -> bool {
        self.active.get(channel_index).copied().unwrap_or(false)
    }

    /// Polls the lines once and returns `(channel_index, edge)` pairs
    /// for every channel whose state changed since the last poll.
    pub fn poll_edges(&mut self) -> Vec<(usize, PttEdge)> {
        let mut edges = Vec::new();
        for (i, state) in self.lines.read().iter().enumerate() {
            let Some(new_active) = state else { continue };
            if *new_active != self.active[i] {
                self.active[i] = *new_active;
                edges.push((i, if *new_active { PttEdge::Started } else { PttEdge::Ended }));
            }
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeLines {
        states: [Option<bool>; MAX_CHANNELS],
    }

    impl PttLines for FakeLines {
        fn read(&mut self) -> [Option<bool>; MAX_CHANNELS] {
            self.states
        }
    }

    #[test]
    fn prime_sets_initial_state_without_edges() {
        let mut detector = PttEdgeDetector::new(FakeLines {
            states: [Some(true), Some(false), None, None],
        });
        detector.prime();
        assert!(detector.is_active(0));
        assert!(!detector.is_active(1));
    }

    #[test]
    fn poll_detects_rising_and_falling_edges() {
        let mut detector = PttEdgeDetector::new(FakeLines {
            states: [Some(false), Some(false), None, None],
        });
        detector.prime();

        detector.lines.states[0] = Some(true);
        let edges = detector.poll_edges();
        assert_eq!(edges, vec![(0, PttEdge::Started)]);

        detector.lines.states[0] = Some(false);
        let edges = detector.poll_edges();
        assert_eq!(edges, vec![(0, PttEdge::Ended)]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn gpio_cdev_lines_inactive_reads_as_unmapped() {
        // No lines requested, so every index comes back `None` (as if no
        // channel were configured at all) rather than `Some(false)` —
        // either way `PttEdgeDetector` never emits an edge for it and the
        // channel's `ptt_active` stays at its default of `false`.
        let mut lines = GpioCdevLines::inactive();
        assert_eq!(lines.read(), [None; MAX_CHANNELS]);
    }

    #[test]
    fn poll_ignores_unmapped_channels() {
        let mut detector = PttEdgeDetector::new(FakeLines {
            states: [Some(false), None, None, None],
        });
        detector.prime();
        assert!(detector.poll_edges().is_empty());
    }
}
