//! Duty-cycle accounting for the streaming receive loop.
//!
//! The subscriber reports each loop iteration: how long it spent doing real
//! work (decode plus dispatch) and how many payload bytes arrived. Once per
//! tick the accumulators fold into exponentially weighted averages, so a
//! momentary burst does not masquerade as sustained load.

use std::time::Duration;

use tokio::time::Instant;

/// Weight of the previous average per tick. The complement weights the new
/// sample.
const EWMA_KEEP: f64 = 0.75;

/// Minimum duration of one accounting tick.
const TICK: Duration = Duration::from_secs(1);

/// Smoothed view of the receive loop's load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DutySnapshot {
    /// Fraction of wall time spent busy, 0.0 to 1.0.
    pub busy_fraction: f64,
    /// Smoothed ingest rate in bits per second.
    pub bits_per_sec: f64,
}

/// Per-loop duty accounting with once-per-tick EWMA folding.
pub struct DutyMonitor {
    tick_start: Instant,
    busy: Duration,
    bytes: u64,
    busy_fraction: f64,
    bits_per_sec: f64,
    primed: bool,
}

impl DutyMonitor {
    /// Fresh monitor; the first tick starts now.
    pub fn new() -> Self {
        Self {
            tick_start: Instant::now(),
            busy: Duration::ZERO,
            bytes: 0,
            busy_fraction: 0.0,
            bits_per_sec: 0.0,
            primed: false,
        }
    }

    /// Record one loop iteration. Returns a snapshot when a full tick just
    /// folded, `None` otherwise.
    pub fn record(&mut self, busy: Duration, bytes: usize) -> Option<DutySnapshot> {
        self.busy += busy;
        self.bytes += bytes as u64;

        let elapsed = self.tick_start.elapsed();
        if elapsed < TICK {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let fraction = (self.busy.as_secs_f64() / secs).min(1.0);
        let bps = (self.bytes * 8) as f64 / secs;

        if self.primed {
            self.busy_fraction = EWMA_KEEP * self.busy_fraction + (1.0 - EWMA_KEEP) * fraction;
            self.bits_per_sec = EWMA_KEEP * self.bits_per_sec + (1.0 - EWMA_KEEP) * bps;
        } else {
            // First full tick seeds the averages directly.
            self.busy_fraction = fraction;
            self.bits_per_sec = bps;
            self.primed = true;
        }

        self.tick_start = Instant::now();
        self.busy = Duration::ZERO;
        self.bytes = 0;

        Some(self.snapshot())
    }

    /// Current smoothed values.
    pub fn snapshot(&self) -> DutySnapshot {
        DutySnapshot {
            busy_fraction: self.busy_fraction,
            bits_per_sec: self.bits_per_sec,
        }
    }
}

impl Default for DutyMonitor {
    fn default() -> Self {
        Self::new()
    }
}
