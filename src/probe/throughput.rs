//! Data channel throughput probe.
//!
//! Pumps fixed-size packets over a relay-only loopback call for a fixed
//! send window, keeping a bounded amount buffered on the sender, and
//! measures the achieved rate on the receiving side. The verdict floor
//! is the rate below which voice and video calling is not viable.

use std::time::{Duration, Instant};

use crate::call::{Call, Side};
use crate::candidate::CandidateFilter;
use crate::peer::ChannelId;
use crate::util::Soonest;
use crate::CheckError;

use super::{failure_text, Env, Probe, RunCtx};

const PACKET_SIZE: usize = 1024;
const MAX_PACKETS_IN_FLIGHT: usize = 1;
const BYTES_TO_KEEP_BUFFERED: usize = PACKET_SIZE * MAX_PACKETS_IN_FLIGHT;
const SEND_WINDOW: Duration = Duration::from_secs(5);

/// Extra time after the send window for queued packets to drain.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Send pacing, mirrors a minimal timer tick.
const TICK: Duration = Duration::from_millis(1);

const MIN_RATE_MBPS: f64 = 0.2;

/// Measures data channel throughput over relay candidates.
pub struct DataThroughputProbe {
    state: State,
}

#[allow(clippy::large_enum_variant)]
enum State {
    Idle,
    Running(Running),
    Done,
}

struct Running {
    call: Call,
    channel: ChannelId,
    start: Option<Instant>,
    sent_bytes: usize,
    received_bytes: usize,
    last_measure: Instant,
    last_received_bytes: usize,
    stop_sending: bool,
    deadline: Instant,
    next_tick: Instant,
}

impl Default for DataThroughputProbe {
    fn default() -> Self {
        DataThroughputProbe::new()
    }
}

impl DataThroughputProbe {
    /// Creates the probe.
    pub fn new() -> DataThroughputProbe {
        DataThroughputProbe { state: State::Idle }
    }

    fn fatal(&mut self, e: CheckError, ctx: &mut RunCtx) {
        if let State::Running(r) = &mut self.state {
            r.call.close();
        }
        ctx.report_fatal(failure_text(&e));
        self.state = State::Done;
    }

    fn settle(&mut self, ctx: &mut RunCtx) {
        if let State::Running(r) = &mut self.state {
            r.call.close();
        }
        ctx.finish();
        self.state = State::Done;
    }
}

impl Probe for DataThroughputProbe {
    fn start(&mut self, now: Instant, env: &mut Env<'_>, ctx: &mut RunCtx) {
        let config = match env.turn_config(now, SEND_WINDOW + DRAIN_GRACE) {
            Ok(v) => v,
            Err(e) => return self.fatal(e.into(), ctx),
        };

        let (a, b) = match env.platform.endpoint_pair(&config) {
            Ok(v) => v,
            Err(e) => return self.fatal(e.into(), ctx),
        };

        let mut call = Call::new(a, b);
        call.set_candidate_filter(CandidateFilter::Relay);

        let channel = call.endpoint(Side::A).create_channel("");

        if let Err(e) = call.establish() {
            call.close();
            return self.fatal(e.into(), ctx);
        }

        self.state = State::Running(Running {
            call,
            channel,
            start: None,
            sent_bytes: 0,
            received_bytes: 0,
            last_measure: now,
            last_received_bytes: 0,
            stop_sending: false,
            deadline: now + SEND_WINDOW + DRAIN_GRACE,
            next_tick: now + TICK,
        });
    }

    fn handle_timeout(&mut self, now: Instant, _env: &mut Env<'_>, ctx: &mut RunCtx) {
        let State::Running(r) = &mut self.state else {
            return;
        };

        r.call.handle_timeout(now);
        while r.call.poll_event().is_some() {}
        while r.call.endpoint(Side::B).poll_channel_open().is_some() {}

        // Receiving side. Per second of received data, report the rate
        // observed over that second.
        while let Some((_, data)) = r.call.endpoint(Side::B).poll_message() {
            r.received_bytes += data.len();
        }
        if r.start.is_some() && now.duration_since(r.last_measure) >= Duration::from_secs(1) {
            let window_ms = now.duration_since(r.last_measure).as_secs_f64() * 1000.0;
            let delta = (r.received_bytes - r.last_received_bytes) as f64;
            let kbps = (delta * 8.0 / window_ms * 1000.0).round() / 1000.0;
            ctx.report_success(format!("Transmitting at {kbps} kbps."));
            r.last_received_bytes = r.received_bytes;
            r.last_measure = now;
        }

        // Sending side. Keep a bounded number of packets buffered until
        // the window closes, then wait for the queue to drain.
        if r.call.endpoint(Side::A).channel_is_open(r.channel) {
            let start = *r.start.get_or_insert_with(|| {
                r.last_measure = now;
                now
            });

            if !r.stop_sending {
                for _ in 0..MAX_PACKETS_IN_FLIGHT {
                    if r.call.endpoint(Side::A).buffered_amount(r.channel)
                        >= BYTES_TO_KEEP_BUFFERED
                    {
                        break;
                    }
                    let packet = [b'h'; PACKET_SIZE];
                    if let Err(e) = r.call.endpoint(Side::A).send(r.channel, &packet) {
                        return self.fatal(e.into(), ctx);
                    }
                    r.sent_bytes += PACKET_SIZE;
                }

                let elapsed = now.duration_since(start);
                if elapsed >= SEND_WINDOW {
                    ctx.set_progress(100.0);
                    r.stop_sending = true;
                } else {
                    let percent = elapsed.as_millis() as f32 / 10.0 / SEND_WINDOW.as_secs() as f32;
                    ctx.set_progress(percent);
                }
            }

            if r.stop_sending && r.sent_bytes == r.received_bytes {
                // Elapsed time rounded to 0.1 ms.
                let elapsed_s =
                    (now.duration_since(start).as_secs_f64() * 10_000.0).round() / 10_000.0;
                let received_kbits = r.received_bytes as f64 * 8.0 / 1000.0;
                let rate_mbps = if elapsed_s > 0.0 {
                    received_kbits / (1000.0 * elapsed_s)
                } else {
                    0.0
                };
                ctx.report_success(format!(
                    "Total transmitted: {received_kbits} kilo-bits in {elapsed_s} seconds."
                ));
                if rate_mbps < MIN_RATE_MBPS {
                    ctx.report_error(format!(
                        "Transmission rate {rate_mbps:.2} Mbps is below the \
                         {MIN_RATE_MBPS} Mbps floor for reliable voice and video calling."
                    ));
                }
                return self.settle(ctx);
            }
        }

        if now >= r.deadline {
            ctx.report_error("Timed out");
            return self.settle(ctx);
        }

        r.next_tick = now + TICK;
    }

    fn poll_timeout(&self) -> Option<Instant> {
        match &self.state {
            State::Running(r) => r
                .call
                .poll_timeout()
                .soonest(Some(r.next_tick))
                .soonest(Some(r.deadline)),
            _ => None,
        }
    }
}
