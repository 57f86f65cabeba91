#![allow(unused)]
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use rtcheck::config::{ConfigError, ProvisionedTurn, SessionConfig};
use rtcheck::error::{CaptureError, NegotiationError};
use rtcheck::peer::{
    CandidateEvent, CaptureConstraints, ChannelId, MediaKind, MediaTrack, PeerEndpoint,
    SignalingState,
};
use rtcheck::probe::{Message, MessageLevel, Probe, ProbeStatus};
use rtcheck::sched::{Scheduler, TestReport};
use rtcheck::sdp::SessionDescription;
use rtcheck::stats::{StatsObject, StatsReport};
use rtcheck::Platform;

pub fn init_log() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(env_filter)
            .init();
    });
}

pub const HOST_UDP: &str = "candidate:1 1 udp 2122194687 192.168.1.4 56143 typ host";
pub const SRFLX_UDP: &str =
    "candidate:2 1 udp 1686052607 203.0.113.7 56143 typ srflx raddr 192.168.1.4 rport 56143";
pub const RELAY_UDP: &str =
    "candidate:3 1 udp 41885439 198.51.100.7 3478 typ relay raddr 203.0.113.7 rport 56143";
pub const RELAY_TCP: &str =
    "candidate:4 1 tcp 25108223 198.51.100.7 3478 typ relay raddr 203.0.113.7 rport 56143";
pub const HOST_IPV6: &str = "candidate:5 1 udp 2122194687 2001:db8::1f 56143 typ host";

const OFFER_SDP: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    a=mid:audio\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 100 116 117\r\n\
    a=mid:video\r\n\
    a=rtpmap:100 VP8/90000\r\n\
    a=rtpmap:116 red/90000\r\n\
    a=rtpmap:117 ulpfec/90000\r\n";

pub type StatsScript = Rc<dyn Fn(Duration) -> Vec<StatsObject>>;

/// Builds one stats object with the given counters.
pub fn stats_object(id: &str, kind: &str, values: &[(&str, f64)]) -> StatsObject {
    StatsObject {
        id: id.to_string(),
        kind: kind.to_string(),
        timestamp: Instant::now(),
        values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
    }
}

/// Simulated host environment backing the peer traits with scripted
/// candidates and a latency/bandwidth link model. All timing derives
/// from the instants the driver passes in, so tests run on virtual
/// time.
pub struct SimPlatform {
    /// Candidate descriptors every endpoint discovers.
    pub candidates: Vec<String>,
    /// Delay from local description to candidate discovery.
    pub candidate_delay: Duration,
    /// Whether gathering signals completion after the candidates.
    pub gathering_completes: bool,
    /// Candidate lines for the second endpoint of a pair, when it
    /// should gather something other than `candidates`.
    pub candidates_b: Option<Vec<String>>,
    /// One-way delivery latency of a link.
    pub latency: Duration,
    /// Link serialization rate, bytes per second.
    pub bandwidth: f64,
    /// Whether paired endpoints ever reach each other.
    pub connect: bool,
    /// Makes `create_offer` fail.
    pub fail_offer: bool,
    /// Makes `capture` fail.
    pub capture_error: Option<CaptureError>,
    /// Stats the endpoints report, as a function of endpoint age.
    pub stats_script: Option<StatsScript>,
    /// Provisioning response body, `None` makes provisioning fail.
    pub provision_json: Option<String>,
    /// Number of provisioning exchanges performed.
    pub provision_count: Rc<Cell<usize>>,
    /// Every track handed out by `capture`.
    pub tracks: Rc<RefCell<Vec<MediaTrack>>>,
    /// The configuration passed to the most recent endpoint creation.
    pub last_config: Rc<RefCell<Option<SessionConfig>>>,
}

impl SimPlatform {
    pub fn new() -> SimPlatform {
        SimPlatform {
            candidates: vec![
                HOST_UDP.to_string(),
                SRFLX_UDP.to_string(),
                RELAY_UDP.to_string(),
            ],
            candidate_delay: Duration::from_millis(10),
            gathering_completes: true,
            candidates_b: None,
            latency: Duration::from_millis(20),
            bandwidth: 1_000_000.0,
            connect: true,
            fail_offer: false,
            capture_error: None,
            stats_script: None,
            provision_json: None,
            provision_count: Rc::new(Cell::new(0)),
            tracks: Rc::new(RefCell::new(Vec::new())),
            last_config: Rc::new(RefCell::new(None)),
        }
    }

    fn make_endpoint(&self, link: Option<(Rc<RefCell<SimLink>>, usize)>) -> SimEndpoint {
        SimEndpoint {
            candidates: self.candidates.clone(),
            candidate_delay: self.candidate_delay,
            gathering_completes: self.gathering_completes,
            fail_offer: self.fail_offer,
            stats_script: self.stats_script.clone(),
            link,
            now: Instant::now(),
            created: Instant::now(),
            local_set: false,
            remote_set: false,
            closed: false,
            remote_candidates: Vec::new(),
            gather_at: None,
            gathered: false,
            candidate_events: VecDeque::new(),
            next_local_channel: 1000,
        }
    }
}

impl Platform for SimPlatform {
    fn endpoint(
        &mut self,
        config: Option<&SessionConfig>,
    ) -> Result<Box<dyn PeerEndpoint>, NegotiationError> {
        *self.last_config.borrow_mut() = config.cloned();
        Ok(Box::new(self.make_endpoint(None)))
    }

    fn endpoint_pair(
        &mut self,
        config: &SessionConfig,
    ) -> Result<(Box<dyn PeerEndpoint>, Box<dyn PeerEndpoint>), NegotiationError> {
        *self.last_config.borrow_mut() = Some(config.clone());
        let link = Rc::new(RefCell::new(SimLink::new(
            self.latency,
            self.bandwidth,
            self.connect,
        )));
        let a = self.make_endpoint(Some((link.clone(), 0)));
        let mut b = self.make_endpoint(Some((link, 1)));
        if let Some(cs) = &self.candidates_b {
            b.candidates = cs.clone();
        }
        Ok((Box::new(a), Box::new(b)))
    }

    fn provision_turn(&mut self) -> Result<ProvisionedTurn, ConfigError> {
        self.provision_count.set(self.provision_count.get() + 1);
        match &self.provision_json {
            Some(json) => ProvisionedTurn::from_json(json),
            None => Err(ConfigError::Fetch("provisioning unreachable".to_string())),
        }
    }

    fn capture(&mut self, _constraints: &CaptureConstraints) -> Result<MediaTrack, CaptureError> {
        if let Some(e) = self.capture_error {
            return Err(e);
        }
        let track = MediaTrack::new("cam0", MediaKind::Video, "Sim Camera");
        self.tracks.borrow_mut().push(track.clone());
        Ok(track)
    }
}

struct Delivery {
    channel: ChannelId,
    data: Vec<u8>,
    serialized_at: Instant,
    arrives_at: Instant,
}

/// Shared state of one endpoint pair. Index 0/1 is the sending side.
struct SimLink {
    latency: Duration,
    bandwidth: f64,
    connect: bool,
    ready: [bool; 2],
    connected_at: Option<Instant>,
    next_channel: u64,
    channels: Vec<(ChannelId, usize)>,
    announced: [Vec<ChannelId>; 2],
    queues: [VecDeque<Delivery>; 2],
    busy_until: [Option<Instant>; 2],
}

impl SimLink {
    fn new(latency: Duration, bandwidth: f64, connect: bool) -> SimLink {
        SimLink {
            latency,
            bandwidth,
            connect,
            ready: [false, false],
            connected_at: None,
            next_channel: 1,
            channels: Vec::new(),
            announced: [Vec::new(), Vec::new()],
            queues: [VecDeque::new(), VecDeque::new()],
            busy_until: [None, None],
        }
    }

    fn open_at(&self) -> Option<Instant> {
        self.connected_at
    }
}

pub struct SimEndpoint {
    candidates: Vec<String>,
    candidate_delay: Duration,
    gathering_completes: bool,
    fail_offer: bool,
    stats_script: Option<StatsScript>,
    link: Option<(Rc<RefCell<SimLink>>, usize)>,
    now: Instant,
    created: Instant,
    local_set: bool,
    remote_set: bool,
    closed: bool,
    remote_candidates: Vec<String>,
    gather_at: Option<Instant>,
    gathered: bool,
    candidate_events: VecDeque<CandidateEvent>,
    next_local_channel: u64,
}

impl SimEndpoint {
    fn update_readiness(&mut self) {
        let Some((link, dir)) = &self.link else {
            return;
        };
        let ready = self.local_set && !self.remote_candidates.is_empty();
        let mut link = link.borrow_mut();
        link.ready[*dir] = ready;
        if link.connect && link.ready[0] && link.ready[1] && link.connected_at.is_none() {
            link.connected_at = Some(self.now + link.latency);
        }
    }

    fn is_open(&self, channel: ChannelId) -> bool {
        let Some((link, _)) = &self.link else {
            return false;
        };
        let link = link.borrow();
        let registered = link.channels.iter().any(|(c, _)| *c == channel);
        registered && link.open_at().is_some_and(|t| self.now >= t)
    }
}

impl PeerEndpoint for SimEndpoint {
    fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.fail_offer {
            return Err(NegotiationError::Rejected("scripted failure".to_string()));
        }
        Ok(SessionDescription::new(OFFER_SDP))
    }

    fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if !self.remote_set {
            return Err(NegotiationError::Rejected("no remote offer".to_string()));
        }
        Ok(SessionDescription::new(OFFER_SDP))
    }

    fn set_local_description(
        &mut self,
        _desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.local_set = true;
        if self.gather_at.is_none() && !self.gathered {
            self.gather_at = Some(self.now + self.candidate_delay);
        }
        self.update_readiness();
        Ok(())
    }

    fn set_remote_description(
        &mut self,
        _desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.remote_set = true;
        self.update_readiness();
        Ok(())
    }

    fn add_remote_candidate(&mut self, descriptor: &str) {
        self.remote_candidates.push(descriptor.to_string());
        self.update_readiness();
    }

    fn poll_candidate(&mut self) -> Option<CandidateEvent> {
        self.candidate_events.pop_front()
    }

    fn create_channel(&mut self, _label: &str) -> ChannelId {
        match &self.link {
            Some((link, dir)) => {
                let mut link = link.borrow_mut();
                let id = ChannelId::new(link.next_channel);
                link.next_channel += 1;
                let dir = *dir;
                link.channels.push((id, dir));
                id
            }
            None => {
                let id = ChannelId::new(self.next_local_channel);
                self.next_local_channel += 1;
                id
            }
        }
    }

    fn channel_is_open(&self, channel: ChannelId) -> bool {
        !self.closed && self.is_open(channel)
    }

    fn send(&mut self, channel: ChannelId, data: &[u8]) -> Result<usize, NegotiationError> {
        if !self.is_open(channel) {
            return Err(NegotiationError::ChannelSend("channel not open".to_string()));
        }
        let (link, dir) = self.link.as_ref().expect("open channel without link");
        let dir = *dir;
        let mut link = link.borrow_mut();

        let open_at = link.open_at().expect("open channel without connection");
        let mut base = self.now.max(open_at);
        if let Some(busy) = link.busy_until[dir] {
            base = base.max(busy);
        }
        let ser = Duration::from_secs_f64(data.len() as f64 / link.bandwidth);
        let serialized_at = base + ser;
        let arrives_at = serialized_at + link.latency;
        link.busy_until[dir] = Some(serialized_at);
        link.queues[dir].push_back(Delivery {
            channel,
            data: data.to_vec(),
            serialized_at,
            arrives_at,
        });
        Ok(data.len())
    }

    fn buffered_amount(&self, channel: ChannelId) -> usize {
        let Some((link, dir)) = &self.link else {
            return 0;
        };
        let link = link.borrow();
        link.queues[*dir]
            .iter()
            .filter(|d| d.channel == channel && d.serialized_at > self.now)
            .map(|d| d.data.len())
            .sum()
    }

    fn poll_channel_open(&mut self) -> Option<ChannelId> {
        let (link, dir) = self.link.as_ref()?;
        let dir = *dir;
        let mut link = link.borrow_mut();
        if !link.open_at().is_some_and(|t| self.now >= t) {
            return None;
        }
        let found = link
            .channels
            .iter()
            .find(|(c, origin)| *origin != dir && !link.announced[dir].contains(c))
            .map(|(c, _)| *c);
        if let Some(c) = found {
            link.announced[dir].push(c);
        }
        found
    }

    fn poll_message(&mut self) -> Option<(ChannelId, Vec<u8>)> {
        let (link, dir) = self.link.as_ref()?;
        let dir = *dir;
        let mut link = link.borrow_mut();
        let incoming = &mut link.queues[1 - dir];
        if incoming.front().is_some_and(|d| d.arrives_at <= self.now) {
            let d = incoming.pop_front().unwrap();
            Some((d.channel, d.data))
        } else {
            None
        }
    }

    fn add_track(&mut self, _track: &MediaTrack) {}

    fn stats(&mut self) -> StatsReport {
        let elapsed = self.now.duration_since(self.created);
        match &self.stats_script {
            Some(script) => StatsReport {
                objects: script(elapsed),
            },
            None => StatsReport::default(),
        }
    }

    fn signaling_state(&self) -> SignalingState {
        if self.closed {
            SignalingState::Closed
        } else if self.local_set && self.remote_set {
            SignalingState::Stable
        } else if self.local_set {
            SignalingState::HaveLocalOffer
        } else if self.remote_set {
            SignalingState::HaveRemoteOffer
        } else {
            SignalingState::Stable
        }
    }

    fn handle_timeout(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.now = self.now.max(now);

        if let Some(at) = self.gather_at {
            if self.now >= at && !self.gathered {
                self.gathered = true;
                for c in &self.candidates {
                    self.candidate_events
                        .push_back(CandidateEvent::Candidate(c.clone()));
                }
                if self.gathering_completes {
                    self.candidate_events
                        .push_back(CandidateEvent::GatheringComplete);
                }
            }
        }

        self.update_readiness();
    }

    fn poll_timeout(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }

        let mut soonest: Option<Instant> = None;
        let mut consider = |t: Instant| {
            soonest = Some(match soonest {
                Some(s) => s.min(t),
                None => t,
            });
        };

        if !self.candidate_events.is_empty() {
            consider(self.now);
        }
        if let Some(at) = self.gather_at {
            if !self.gathered {
                consider(at);
            }
        }

        if let Some((link, dir)) = &self.link {
            let dir = *dir;
            let link = link.borrow();
            if let Some(t) = link.open_at() {
                if t > self.now {
                    consider(t);
                }
            }
            // Wake for serialization progress on the outgoing queue and
            // arrivals on the incoming one.
            for d in &link.queues[dir] {
                if d.serialized_at > self.now {
                    consider(d.serialized_at);
                    break;
                }
            }
            if let Some(d) = link.queues[1 - dir].front() {
                consider(d.arrives_at.max(self.now));
            }
        }

        soonest
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Drives the scheduler on virtual time until it finishes or the
/// iteration budget runs out.
pub fn drive(sched: &mut Scheduler, platform: &mut SimPlatform, start: Instant) -> Instant {
    let mut now = start;
    for _ in 0..500_000 {
        if sched.is_finished() {
            return now;
        }
        let Some(t) = sched.poll_timeout() else {
            break;
        };
        now = t.max(now);
        sched.handle_timeout(now, platform);
    }
    assert!(sched.is_finished(), "scheduler did not finish");
    now
}

/// Runs one probe to completion under a static TURN configuration and
/// returns its terminal report.
pub fn run_single(
    name: &str,
    factory: impl FnMut() -> Box<dyn Probe> + 'static,
    platform: &mut SimPlatform,
) -> TestReport {
    init_log();

    let mut sched = Scheduler::new();
    sched.set_static_turn_config(SessionConfig::from_static(
        "turn:turn.example.org:3478",
        "user",
        "pass",
    ));
    sched.add_test("suite", name, factory);

    sched.start(Instant::now(), platform);
    drive(&mut sched, platform, Instant::now());

    let report = sched.report();
    report.suites[0].tests[0].clone()
}

pub fn has_message(report: &TestReport, level: MessageLevel, needle: &str) -> bool {
    report
        .messages
        .iter()
        .any(|m| m.level == level && m.text.contains(needle))
}
