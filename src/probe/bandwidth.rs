//! Video bandwidth ramp-up probe.
//!
//! Sends camera video over a relay-only loopback call with a capped
//! bitrate and watches the bandwidth estimator climb towards the cap.
//! The ramp-up target is a fixed fraction of the cap; a healthy path
//! reaches it well within the run. A camera producing degenerate frames
//! or an estimator that never produced a sample are distinct failures,
//! never silent passes.

use std::time::{Duration, Instant};

use crate::call::{Call, Side};
use crate::candidate::CandidateFilter;
use crate::peer::{CaptureConstraints, MediaTrack, VideoConstraints};
use crate::stats::{
    StatisticsAggregate, AVAILABLE_OUTGOING_BITRATE, FRAME_HEIGHT, FRAME_WIDTH, KIND_BWE,
    KIND_OUTBOUND_RTP, PACKETS_LOST, ROUND_TRIP_TIME,
};
use crate::util::Soonest;
use crate::CheckError;

use super::{failure_text, Env, Probe, RunCtx};

const MAX_VIDEO_BITRATE_KBPS: u32 = 2000;
const RAMP_UP_FRACTION: f64 = 0.75;
const RUN_DURATION: Duration = Duration::from_secs(40);
const STAT_STEP: Duration = Duration::from_millis(100);

const CAPTURE: CaptureConstraints = CaptureConstraints {
    audio: false,
    video: Some(VideoConstraints {
        min_width: 1280,
        min_height: 720,
    }),
};

/// Measures video send bandwidth ramp-up over relay candidates.
pub struct VideoBandwidthProbe {
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
    track: MediaTrack,
    bwe: StatisticsAggregate,
    rtt: StatisticsAggregate,
    frame_size: Option<(f64, f64)>,
    packets_lost: Option<f64>,
    start: Instant,
    end: Instant,
}

impl Default for VideoBandwidthProbe {
    fn default() -> Self {
        VideoBandwidthProbe::new()
    }
}

impl VideoBandwidthProbe {
    /// Creates the probe.
    pub fn new() -> VideoBandwidthProbe {
        VideoBandwidthProbe { state: State::Idle }
    }

    fn fatal(&mut self, e: CheckError, ctx: &mut RunCtx) {
        if let State::Running(r) = &mut self.state {
            r.track.stop();
            r.call.close();
        }
        ctx.report_fatal(failure_text(&e));
        self.state = State::Done;
    }

    fn finalize(&mut self, ctx: &mut RunCtx) {
        let State::Running(r) = &mut self.state else {
            return;
        };

        r.track.stop();
        r.call.close();

        if r.bwe.count() == 0 {
            ctx.report_error(
                "Could not analyze any frames; no bandwidth estimate samples were collected.",
            );
        } else {
            match r.frame_size {
                Some((w, h)) if w >= 2.0 && h >= 2.0 => {
                    ctx.report_success(format!("Video resolution: {w}x{h}"));
                }
                Some((w, h)) => {
                    ctx.report_error(format!(
                        "Camera failure: {w}x{h}. Cannot test bandwidth without a working camera."
                    ));
                }
                None => {
                    ctx.report_error(
                        "Camera failure: no video frames observed. \
                         Cannot test bandwidth without a working camera.",
                    );
                }
            }

            if let Some(avg) = r.bwe.average() {
                ctx.report_info(format!("Send bandwidth estimate average: {avg} bps"));
            }
            if let Some(max) = r.bwe.max() {
                ctx.report_info(format!("Send bandwidth estimate max: {max} bps"));
            }
            match r.bwe.ramp_up_time() {
                Some(t) => {
                    ctx.report_info(format!("Send bandwidth ramp-up time: {} ms", t.as_millis()));
                }
                None => {
                    ctx.report_info("Send bandwidth never reached the ramp-up target.");
                }
            }
            if let Some(avg) = r.rtt.average() {
                ctx.report_info(format!("Average RTT: {avg} ms"));
            }
            if let Some(lost) = r.packets_lost {
                ctx.report_info(format!("Packets lost: {lost}"));
            }
        }

        ctx.finish();
        self.state = State::Done;
    }
}

impl Probe for VideoBandwidthProbe {
    fn start(&mut self, now: Instant, env: &mut Env<'_>, ctx: &mut RunCtx) {
        let config = match env.turn_config(now, RUN_DURATION) {
            Ok(v) => v,
            Err(e) => return self.fatal(e.into(), ctx),
        };

        let track = match env.platform.capture(&CAPTURE) {
            Ok(v) => v,
            Err(e) => return self.fatal(e.into(), ctx),
        };

        let (a, b) = match env.platform.endpoint_pair(&config) {
            Ok(v) => v,
            Err(e) => {
                track.stop();
                return self.fatal(e.into(), ctx);
            }
        };

        let mut call = Call::new(a, b);
        call.set_candidate_filter(CandidateFilter::Relay);
        call.disable_video_fec();
        call.constrain_video_bitrate(MAX_VIDEO_BITRATE_KBPS);
        call.endpoint(Side::A).add_track(&track);

        if let Err(e) = call.establish() {
            track.stop();
            call.close();
            return self.fatal(e.into(), ctx);
        }

        call.start_stats_gathering(Side::A, STAT_STEP, now);

        let threshold = RAMP_UP_FRACTION * MAX_VIDEO_BITRATE_KBPS as f64 * 1000.0;
        self.state = State::Running(Running {
            call,
            track,
            bwe: StatisticsAggregate::with_ramp_up_threshold(threshold),
            rtt: StatisticsAggregate::new(),
            frame_size: None,
            packets_lost: None,
            start: now,
            end: now + RUN_DURATION,
        });
    }

    fn handle_timeout(&mut self, now: Instant, _env: &mut Env<'_>, ctx: &mut RunCtx) {
        let State::Running(r) = &mut self.state else {
            return;
        };

        r.call.handle_timeout(now);
        while r.call.poll_event().is_some() {}

        while let Some((report, t)) = r.call.poll_stats() {
            for obj in &report.objects {
                if obj.kind == KIND_BWE {
                    if let Some(v) = obj.value(AVAILABLE_OUTGOING_BITRATE) {
                        r.bwe.add(t, v);
                    }
                } else if obj.kind == KIND_OUTBOUND_RTP {
                    if let Some(v) = obj.value(ROUND_TRIP_TIME) {
                        r.rtt.add(t, v);
                    }
                    if let (Some(w), Some(h)) = (obj.value(FRAME_WIDTH), obj.value(FRAME_HEIGHT)) {
                        r.frame_size = Some((w, h));
                    }
                    if let Some(v) = obj.value(PACKETS_LOST) {
                        r.packets_lost = Some(v);
                    }
                }
            }
        }

        let elapsed = now.duration_since(r.start);
        let percent = elapsed.as_secs_f32() / RUN_DURATION.as_secs_f32() * 100.0;
        ctx.set_progress(percent);

        if now >= r.end {
            self.finalize(ctx);
        }
    }

    fn poll_timeout(&self) -> Option<Instant> {
        match &self.state {
            State::Running(r) => r.call.poll_timeout().soonest(Some(r.end)),
            _ => None,
        }
    }
}
