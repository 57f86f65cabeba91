//! Statistics sampling and aggregation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Canonical stats object kind for bandwidth estimation.
pub const KIND_BWE: &str = "bwe";
/// Canonical stats object kind for an outgoing media stream.
pub const KIND_OUTBOUND_RTP: &str = "outbound-rtp";

/// Estimated available egress bitrate, bits per second.
pub const AVAILABLE_OUTGOING_BITRATE: &str = "availableOutgoingBitrate";
/// Most recent round-trip time, milliseconds.
pub const ROUND_TRIP_TIME: &str = "roundTripTime";
/// Width of the most recently sent video frame.
pub const FRAME_WIDTH: &str = "frameWidth";
/// Height of the most recently sent video frame.
pub const FRAME_HEIGHT: &str = "frameHeight";
/// Cumulative packets lost.
pub const PACKETS_LOST: &str = "packetsLost";

/// One named object in a stats report, holding numeric counters.
///
/// This is the single canonical shape probes consume. Capability adapters
/// normalize whatever dialect their negotiation backend reports into
/// these kinds and counter names.
#[derive(Debug, Clone)]
pub struct StatsObject {
    /// Identifier of the reporting entity (track, stream, estimator).
    pub id: String,
    /// Object kind, e.g. [`KIND_BWE`] or [`KIND_OUTBOUND_RTP`].
    pub kind: String,
    /// When the counters were captured.
    pub timestamp: Instant,
    /// Named numeric counters.
    pub values: HashMap<String, f64>,
}

impl StatsObject {
    /// Look up a counter by name.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

/// A point-in-time set of stats objects from one endpoint.
#[derive(Debug, Clone, Default)]
pub struct StatsReport {
    /// The objects in this report.
    pub objects: Vec<StatsObject>,
}

/// Bounded streaming accumulator over timestamped samples.
///
/// Keeps a running sum, count and max, and detects the first time a
/// sample reaches a caller-supplied ramp-up threshold. The threshold
/// crossing is evaluated in arrival order against single samples, with
/// no window averaging. That makes ramp-up detection sensitive to
/// one-sample spikes, which is intentional and must not be smoothed.
#[derive(Debug)]
pub struct StatisticsAggregate {
    ramp_up_threshold: Option<f64>,
    sum: f64,
    count: u64,
    max: f64,
    first_time: Option<Instant>,
    ramp_up_time: Option<Instant>,
}

impl StatisticsAggregate {
    /// Creates an aggregate without ramp-up detection.
    pub fn new() -> StatisticsAggregate {
        StatisticsAggregate {
            ramp_up_threshold: None,
            sum: 0.0,
            count: 0,
            max: 0.0,
            first_time: None,
            ramp_up_time: None,
        }
    }

    /// Creates an aggregate that records when a sample first reaches
    /// `threshold`.
    pub fn with_ramp_up_threshold(threshold: f64) -> StatisticsAggregate {
        StatisticsAggregate {
            ramp_up_threshold: Some(threshold),
            ..StatisticsAggregate::new()
        }
    }

    /// Records one sample.
    ///
    /// Non-finite values are ignored. Upstream counters are often still
    /// unpopulated early in a session (an encoder that has not produced
    /// its first estimate parses as NaN) and such reads must not poison
    /// the aggregate.
    pub fn add(&mut self, now: Instant, value: f64) {
        if !value.is_finite() {
            return;
        }

        if self.first_time.is_none() {
            self.first_time = Some(now);
        }

        self.sum += value;
        self.count += 1;
        if self.count == 1 || value > self.max {
            self.max = value;
        }

        // First crossing wins, never overwritten by later samples.
        if self.ramp_up_time.is_none() {
            if let Some(threshold) = self.ramp_up_threshold {
                if value >= threshold {
                    self.ramp_up_time = Some(now);
                }
            }
        }
    }

    /// Number of recorded samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Running average, or `None` when no sample was recorded.
    ///
    /// "No samples" must stay distinguishable from "average is zero",
    /// so this never folds the empty case into a number.
    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum / self.count as f64)
    }

    /// Running maximum, or `None` when no sample was recorded.
    pub fn max(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.max)
    }

    /// Time from the first sample until the ramp-up threshold was first
    /// reached, or `None` if no threshold was supplied or it was never
    /// reached.
    pub fn ramp_up_time(&self) -> Option<Duration> {
        let crossed = self.ramp_up_time?;
        let first = self.first_time?;
        Some(crossed.duration_since(first))
    }
}

impl Default for StatisticsAggregate {
    fn default() -> Self {
        StatisticsAggregate::new()
    }
}
