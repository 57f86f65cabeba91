//! Connectivity probes.
//!
//! Establishes a loopback call restricted to one candidate class and
//! verifies a data channel round trip within a fixed timeout. Three
//! variants share the machinery: relay, server reflexive and host, each
//! differing only in the [`CandidateFilter`] installed on the call.

use std::time::{Duration, Instant};

use crate::call::{Call, Side};
use crate::candidate::CandidateFilter;
use crate::peer::ChannelId;
use crate::util::Soonest;
use crate::CheckError;

use super::{failure_text, Env, Probe, RunCtx};

const TIMEOUT: Duration = Duration::from_secs(5);

const HELLO: &[u8] = b"hello";
const WORLD: &[u8] = b"world";

/// Verifies peers can exchange data over a specific candidate class.
pub struct ConnectivityProbe {
    filter: CandidateFilter,
    state: State,
}

enum State {
    Idle,
    Running {
        call: Call,
        channel: ChannelId,
        echo: Option<ChannelId>,
        hello_sent: bool,
        deadline: Instant,
    },
    Done,
}

impl ConnectivityProbe {
    /// Connectivity restricted to relay (TURN) candidates.
    pub fn relay() -> ConnectivityProbe {
        ConnectivityProbe::new(CandidateFilter::Relay)
    }

    /// Connectivity restricted to server reflexive (STUN) candidates.
    pub fn reflexive() -> ConnectivityProbe {
        ConnectivityProbe::new(CandidateFilter::ServerReflexive)
    }

    /// Connectivity restricted to host candidates.
    pub fn host() -> ConnectivityProbe {
        ConnectivityProbe::new(CandidateFilter::Host)
    }

    /// Connectivity restricted to an arbitrary candidate class.
    pub fn new(filter: CandidateFilter) -> ConnectivityProbe {
        ConnectivityProbe {
            filter,
            state: State::Idle,
        }
    }

    fn fatal(&mut self, e: CheckError, ctx: &mut RunCtx) {
        if let State::Running { call, .. } = &mut self.state {
            call.close();
        }
        ctx.report_fatal(failure_text(&e));
        self.state = State::Done;
    }

    fn settle(&mut self, ctx: &mut RunCtx) {
        if let State::Running { call, .. } = &mut self.state {
            call.close();
        }
        ctx.finish();
        self.state = State::Done;
    }
}

impl Probe for ConnectivityProbe {
    fn start(&mut self, now: Instant, env: &mut Env<'_>, ctx: &mut RunCtx) {
        let config = match env.turn_config(now, TIMEOUT) {
            Ok(v) => v,
            Err(e) => return self.fatal(e.into(), ctx),
        };

        let (a, b) = match env.platform.endpoint_pair(&config) {
            Ok(v) => v,
            Err(e) => return self.fatal(e.into(), ctx),
        };

        let mut call = Call::new(a, b);
        call.set_candidate_filter(self.filter);

        let channel = call.endpoint(Side::A).create_channel("");

        if let Err(e) = call.establish() {
            call.close();
            return self.fatal(e.into(), ctx);
        }

        self.state = State::Running {
            call,
            channel,
            echo: None,
            hello_sent: false,
            deadline: now + TIMEOUT,
        };
    }

    fn handle_timeout(&mut self, now: Instant, _env: &mut Env<'_>, ctx: &mut RunCtx) {
        let State::Running {
            call,
            channel,
            echo,
            hello_sent,
            deadline,
        } = &mut self.state
        else {
            return;
        };

        call.handle_timeout(now);
        while call.poll_event().is_some() {}

        // The B side answers any received hello with world.
        if echo.is_none() {
            *echo = call.endpoint(Side::B).poll_channel_open();
        }
        if let Some(ch) = *echo {
            while let Some((_, data)) = call.endpoint(Side::B).poll_message() {
                if data == HELLO {
                    if let Err(e) = call.endpoint(Side::B).send(ch, WORLD) {
                        return self.fatal(e.into(), ctx);
                    }
                }
            }
        }

        // The A side opens the exchange and watches for the reply.
        if !*hello_sent && call.endpoint(Side::A).channel_is_open(*channel) {
            if let Err(e) = call.endpoint(Side::A).send(*channel, HELLO) {
                return self.fatal(e.into(), ctx);
            }
            *hello_sent = true;
        }
        while let Some((_, data)) = call.endpoint(Side::A).poll_message() {
            if data == WORLD {
                ctx.report_success("Data successfully transmitted between peers.");
                return self.settle(ctx);
            }
        }

        if now >= *deadline {
            let gathered_reflexive = self.filter == CandidateFilter::ServerReflexive
                && call
                    .gathered_candidates(Side::A)
                    .iter()
                    .any(|c| c.is_server_reflexive());
            if gathered_reflexive {
                ctx.report_warning(
                    "Could not connect using reflexive candidates, \
                     likely due to the network environment/configuration.",
                );
            } else {
                ctx.report_error("Timed out");
            }
            self.settle(ctx);
        }
    }

    fn poll_timeout(&self) -> Option<Instant> {
        match &self.state {
            State::Running { call, deadline, .. } => call.poll_timeout().soonest(Some(*deadline)),
            _ => None,
        }
    }
}
