//! Reachability probes.
//!
//! Gather-only probes: a single endpoint is put into gathering with an
//! offer, and the probe inspects discovered candidates. The UDP and TCP
//! variants check that the relay servers are reachable over the
//! respective transport by filtering the server configuration down to
//! it; the IPv6 variant checks plain IPv6 connectivity without any
//! relay servers.

use std::time::{Duration, Instant};

use crate::candidate::{Candidate, Protocol};
use crate::peer::{CandidateEvent, PeerEndpoint};
use crate::util::Soonest;
use crate::CheckError;

use super::{failure_text, Env, Probe, RunCtx};

/// Gathering never completing means a platform defect. This bound
/// guarantees the probe terminates anyway.
const SAFETY_DEADLINE: Duration = Duration::from_secs(30);

/// Which reachability question a [`NetworkProbe`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkProbeKind {
    /// Relay reachable over UDP.
    Udp,
    /// Relay reachable over TCP.
    Tcp,
    /// Any IPv6 candidate, no relay servers involved.
    Ipv6,
}

impl NetworkProbeKind {
    fn admits(&self, c: &Candidate) -> bool {
        match self {
            NetworkProbeKind::Udp => c.is_relay() && c.is_udp(),
            NetworkProbeKind::Tcp => c.is_relay() && c.is_tcp(),
            NetworkProbeKind::Ipv6 => c.is_ipv6(),
        }
    }
}

/// Verifies a network path exists by gathering candidates.
pub struct NetworkProbe {
    kind: NetworkProbeKind,
    state: State,
}

enum State {
    Idle,
    Running {
        endpoint: Box<dyn PeerEndpoint>,
        deadline: Instant,
    },
    Done,
}

impl NetworkProbe {
    /// Relay reachability over UDP.
    pub fn udp() -> NetworkProbe {
        NetworkProbe::new(NetworkProbeKind::Udp)
    }

    /// Relay reachability over TCP.
    pub fn tcp() -> NetworkProbe {
        NetworkProbe::new(NetworkProbeKind::Tcp)
    }

    /// IPv6 reachability.
    pub fn ipv6() -> NetworkProbe {
        NetworkProbe::new(NetworkProbeKind::Ipv6)
    }

    /// Reachability probe for an arbitrary kind.
    pub fn new(kind: NetworkProbeKind) -> NetworkProbe {
        NetworkProbe {
            kind,
            state: State::Idle,
        }
    }

    fn fatal(&mut self, e: CheckError, ctx: &mut RunCtx) {
        if let State::Running { endpoint, .. } = &mut self.state {
            endpoint.close();
        }
        ctx.report_fatal(failure_text(&e));
        self.state = State::Done;
    }

    fn settle(&mut self, ctx: &mut RunCtx) {
        if let State::Running { endpoint, .. } = &mut self.state {
            endpoint.close();
        }
        ctx.finish();
        self.state = State::Done;
    }

    fn fail_text(&self) -> &'static str {
        match self.kind {
            NetworkProbeKind::Udp | NetworkProbeKind::Tcp => {
                "Failed to gather specified candidates"
            }
            NetworkProbeKind::Ipv6 => {
                "Failed to gather IPv6 candidates, it might not be \
                 setup/supported on the network."
            }
        }
    }
}

impl Probe for NetworkProbe {
    fn start(&mut self, now: Instant, env: &mut Env<'_>, ctx: &mut RunCtx) {
        let config = match self.kind {
            NetworkProbeKind::Udp | NetworkProbeKind::Tcp => {
                let mut config = match env.turn_config(now, SAFETY_DEADLINE) {
                    Ok(v) => v,
                    Err(e) => return self.fatal(e.into(), ctx),
                };
                let proto = if self.kind == NetworkProbeKind::Udp {
                    Protocol::Udp
                } else {
                    Protocol::Tcp
                };
                config.filter_transport(proto);
                Some(config)
            }
            NetworkProbeKind::Ipv6 => None,
        };

        let mut endpoint = match env.platform.endpoint(config.as_ref()) {
            Ok(v) => v,
            Err(e) => return self.fatal(e.into(), ctx),
        };

        // Installing a local offer is what starts gathering.
        let r = endpoint
            .create_offer()
            .and_then(|offer| endpoint.set_local_description(&offer));
        if let Err(e) = r {
            endpoint.close();
            return self.fatal(e.into(), ctx);
        }

        self.state = State::Running {
            endpoint,
            deadline: now + SAFETY_DEADLINE,
        };
    }

    fn handle_timeout(&mut self, now: Instant, _env: &mut Env<'_>, ctx: &mut RunCtx) {
        let State::Running { endpoint, deadline } = &mut self.state else {
            return;
        };

        endpoint.handle_timeout(now);

        while let Some(ev) = endpoint.poll_candidate() {
            match ev {
                CandidateEvent::Candidate(descriptor) => {
                    let c = match Candidate::parse(&descriptor) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("Ignoring unparseable candidate: {}", e);
                            continue;
                        }
                    };
                    if self.kind.admits(&c) {
                        ctx.report_success(format!(
                            "Gathered candidate of Type: {} Protocol: {} Address: {}",
                            c.kind(),
                            c.proto(),
                            c.addr()
                        ));
                        return self.settle(ctx);
                    }
                }
                CandidateEvent::GatheringComplete => {
                    ctx.report_error(self.fail_text());
                    return self.settle(ctx);
                }
            }
        }

        if now >= *deadline {
            ctx.report_error("Timed out");
            self.settle(ctx);
        }
    }

    fn poll_timeout(&self) -> Option<Instant> {
        match &self.state {
            State::Running { endpoint, deadline } => {
                endpoint.poll_timeout().soonest(Some(*deadline))
            }
            _ => None,
        }
    }
}
