//! Loopback call orchestration between two local endpoints.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::candidate::{Candidate, CandidateFilter, ParseCandidateError};
use crate::peer::{NegotiationError, PeerEndpoint, SignalingState};
use crate::stats::StatsReport;
use crate::util::Soonest;

/// Which of the call's two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The offering endpoint.
    A,
    /// The answering endpoint.
    B,
}

impl Side {
    fn other(&self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

/// State of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Endpoints created, no negotiation yet.
    Idle,
    /// The offer has been created and installed on both sides.
    OfferCreated,
    /// The answer has been created and installed on both sides.
    AnswerCreated,
    /// Offer/answer exchange completed.
    Connected,
    /// The call has been torn down. Terminal.
    Closed,
    /// The negotiation capability rejected a step. Terminal, except for
    /// [`Call::close`].
    Failed,
}

/// Events surfaced while driving the call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An endpoint discovered a candidate. `forwarded` tells whether the
    /// installed filter admitted it to the other side.
    Candidate {
        /// Which endpoint discovered the candidate.
        side: Side,
        /// The parsed candidate.
        candidate: Candidate,
        /// Whether it passed the filter and was relayed.
        forwarded: bool,
    },
    /// A discovered candidate descriptor did not match the grammar.
    /// Gathering continues; the other candidates are unaffected.
    CandidateParseFailed {
        /// Which endpoint emitted the descriptor.
        side: Side,
        /// The parse failure.
        error: ParseCandidateError,
    },
    /// An endpoint finished gathering.
    GatheringComplete {
        /// The endpoint that finished.
        side: Side,
    },
}

struct StatsGathering {
    side: Side,
    interval: Duration,
    next_poll: Instant,
    samples: VecDeque<(StatsReport, Instant)>,
    complete: bool,
}

/// A loopback call: two local endpoints negotiated against each other.
///
/// The call relays candidates discovered by one endpoint to the other
/// through the installed [`CandidateFilter`], which is how a constrained
/// network path (relay only, IPv6 only, ...) is simulated without a real
/// constrained network.
///
/// The call is poll-driven: [`Call::handle_timeout`] advances candidate
/// relay and stats polling, [`Call::poll_timeout`] reports the next
/// deadline, [`Call::poll_event`] drains what happened.
pub struct Call {
    a: Box<dyn PeerEndpoint>,
    b: Box<dyn PeerEndpoint>,
    state: CallState,
    filter: CandidateFilter,
    remove_video_fec: bool,
    max_video_bitrate_kbps: Option<u32>,
    gathered_a: Vec<Candidate>,
    gathered_b: Vec<Candidate>,
    stats: Option<StatsGathering>,
    events: VecDeque<CallEvent>,
}

impl Call {
    /// Creates a call over a pair of endpoints.
    pub fn new(a: Box<dyn PeerEndpoint>, b: Box<dyn PeerEndpoint>) -> Call {
        Call {
            a,
            b,
            state: CallState::Idle,
            filter: CandidateFilter::Any,
            remove_video_fec: false,
            max_video_bitrate_kbps: None,
            gathered_a: Vec::new(),
            gathered_b: Vec::new(),
            stats: None,
            events: VecDeque::new(),
        }
    }

    /// Current call state.
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Installs the candidate filter. Candidates failing the filter are
    /// silently dropped, not an error.
    pub fn set_candidate_filter(&mut self, filter: CandidateFilter) {
        self.filter = filter;
    }

    /// Removes video FEC from the offer during [`Call::establish`].
    pub fn disable_video_fec(&mut self) {
        self.remove_video_fec = true;
    }

    /// Caps the video bitrate by rewriting the answer during
    /// [`Call::establish`].
    pub fn constrain_video_bitrate(&mut self, max_kbps: u32) {
        self.max_video_bitrate_kbps = Some(max_kbps);
    }

    /// Mutable access to one endpoint, for channel and track operations.
    pub fn endpoint(&mut self, side: Side) -> &mut dyn PeerEndpoint {
        match side {
            Side::A => &mut *self.a,
            Side::B => &mut *self.b,
        }
    }

    /// Candidates gathered so far by one endpoint, in discovery order.
    pub fn gathered_candidates(&self, side: Side) -> &[Candidate] {
        match side {
            Side::A => &self.gathered_a,
            Side::B => &self.gathered_b,
        }
    }

    /// Runs the offer/answer exchange.
    ///
    /// On success the call is [`CallState::Connected`]. A rejection by
    /// the negotiation capability moves the call to [`CallState::Failed`]
    /// and surfaces the error; it is never retried, since a duplicated
    /// offer corrupts negotiation state.
    pub fn establish(&mut self) -> Result<(), NegotiationError> {
        if self.state != CallState::Idle {
            return Err(NegotiationError::Rejected(format!(
                "establish() in state {:?}",
                self.state
            )));
        }

        match self.do_establish() {
            Ok(()) => {
                debug!("Call established");
                self.state = CallState::Connected;
                Ok(())
            }
            Err(e) => {
                warn!("Call negotiation failed: {}", e);
                self.state = CallState::Failed;
                Err(e)
            }
        }
    }

    fn do_establish(&mut self) -> Result<(), NegotiationError> {
        let mut offer = self.a.create_offer()?;
        if self.remove_video_fec {
            offer.remove_video_fec();
        }
        self.a.set_local_description(&offer)?;
        self.b.set_remote_description(&offer)?;
        self.state = CallState::OfferCreated;

        let mut answer = self.b.create_answer()?;
        if let Some(kbps) = self.max_video_bitrate_kbps {
            answer.constrain_video_bitrate(kbps);
        }
        self.b.set_local_description(&answer)?;
        self.a.set_remote_description(&answer)?;
        self.state = CallState::AnswerCreated;

        Ok(())
    }

    /// Starts polling stats on one endpoint every `interval`.
    ///
    /// Samples buffer up until the endpoint's signaling state reaches
    /// closed; drain them with [`Call::poll_stats`]. Returns `false` if a
    /// gathering is already running: double-polling the stats interface
    /// doubles the sample load and corrupts consumer ordering, so only
    /// one gathering per call is allowed.
    pub fn start_stats_gathering(&mut self, side: Side, interval: Duration, now: Instant) -> bool {
        if self.stats.is_some() {
            return false;
        }
        self.stats = Some(StatsGathering {
            side,
            interval,
            next_poll: now + interval,
            samples: VecDeque::new(),
            complete: false,
        });
        true
    }

    /// Whether a stats gathering is in progress.
    pub fn stats_gathering_running(&self) -> bool {
        self.stats.as_ref().is_some_and(|g| !g.complete)
    }

    /// Drains one buffered stats sample.
    pub fn poll_stats(&mut self) -> Option<(StatsReport, Instant)> {
        self.stats.as_mut()?.samples.pop_front()
    }

    /// Drains one call event.
    pub fn poll_event(&mut self) -> Option<CallEvent> {
        self.events.pop_front()
    }

    /// Advances the call to `now`: endpoint machinery, candidate relay
    /// and stats polling.
    pub fn handle_timeout(&mut self, now: Instant) {
        // Nothing to advance after teardown. In-flight polls scheduled
        // before an early close land here and must not touch the
        // endpoints again.
        if matches!(self.state, CallState::Closed) {
            return;
        }

        self.a.handle_timeout(now);
        self.b.handle_timeout(now);

        self.pump_candidates(Side::A);
        self.pump_candidates(Side::B);
        self.poll_gathering(now);
    }

    fn pump_candidates(&mut self, side: Side) {
        use crate::peer::CandidateEvent::*;

        loop {
            let from = match side {
                Side::A => &mut self.a,
                Side::B => &mut self.b,
            };
            let Some(event) = from.poll_candidate() else {
                break;
            };

            match event {
                Candidate(descriptor) => match crate::candidate::Candidate::parse(&descriptor) {
                    Ok(candidate) => {
                        let forwarded = self.filter.admits(&candidate);
                        if forwarded {
                            debug!(
                                "Forwarding {:?} candidate from {:?}: {}",
                                candidate.kind(),
                                side,
                                candidate.addr()
                            );
                            self.endpoint(side.other()).add_remote_candidate(&descriptor);
                        }
                        match side {
                            Side::A => self.gathered_a.push(candidate.clone()),
                            Side::B => self.gathered_b.push(candidate.clone()),
                        }
                        self.events.push_back(CallEvent::Candidate {
                            side,
                            candidate,
                            forwarded,
                        });
                    }
                    Err(error) => {
                        warn!("Failed to parse candidate {:?}: {}", descriptor, error);
                        self.events
                            .push_back(CallEvent::CandidateParseFailed { side, error });
                    }
                },
                GatheringComplete => {
                    self.events.push_back(CallEvent::GatheringComplete { side });
                }
            }
        }
    }

    fn poll_gathering(&mut self, now: Instant) {
        let Some(g) = &mut self.stats else {
            return;
        };
        if g.complete {
            return;
        }

        let endpoint = match g.side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        };

        if endpoint.signaling_state() == SignalingState::Closed {
            g.complete = true;
            return;
        }

        if now >= g.next_poll {
            let report = endpoint.stats();
            g.samples.push_back((report, now));
            g.next_poll = now + g.interval;
        }
    }

    /// Next instant the call wants [`Call::handle_timeout`].
    pub fn poll_timeout(&self) -> Option<Instant> {
        if matches!(self.state, CallState::Closed) {
            return None;
        }

        let stats = self
            .stats
            .as_ref()
            .filter(|g| !g.complete)
            .map(|g| g.next_poll);

        self.a
            .poll_timeout()
            .soonest(self.b.poll_timeout())
            .soonest(stats)
    }

    /// Tears down both endpoints. Idempotent; closing an already closed
    /// or failed call is not an error.
    pub fn close(&mut self) {
        if matches!(self.state, CallState::Closed) {
            return;
        }
        debug!("Closing call");
        self.a.close();
        self.b.close();
        if let Some(g) = &mut self.stats {
            g.complete = true;
        }
        self.state = CallState::Closed;
    }
}
