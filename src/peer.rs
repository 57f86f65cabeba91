//! Collaborator seams towards the real-time communication capability.
//!
//! The diagnostics engine never talks to a network or a device itself.
//! Everything it probes is reached through the traits in this module,
//! implemented by the embedder on top of whatever peer connection and
//! capture stack the host environment provides.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use thiserror::Error;

use crate::config::{ConfigError, ProvisionedTurn, SessionConfig};
use crate::sdp::SessionDescription;
use crate::stats::StatsReport;

/// Errors reported by the session negotiation capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// Offer or answer creation was rejected.
    #[error("offer/answer rejected: {0}")]
    Rejected(String),

    /// A session description could not be installed.
    #[error("description rejected: {0}")]
    Description(String),

    /// An endpoint could not be created.
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    /// A data channel send failed.
    #[error("channel send failed: {0}")]
    ChannelSend(String),
}

/// Errors from the capture device capability, already mapped to the
/// category the probes report guidance for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// Permission to the device was denied.
    #[error("capture permission denied")]
    Blocked,

    /// No suitable device is present or it is in use elsewhere.
    #[error("capture device unavailable")]
    Unavailable,

    /// The requested constraints cannot be satisfied by any device.
    #[error("capture constraints cannot be satisfied")]
    Overconstrained,
}

/// Signaling state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No offer/answer exchange in flight.
    Stable,
    /// A local offer has been installed.
    HaveLocalOffer,
    /// A remote offer has been installed.
    HaveRemoteOffer,
    /// The endpoint has been closed. Terminal.
    Closed,
}

/// Identifier of a data channel on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Creates a channel id. Called by capability adapters.
    pub fn new(id: u64) -> ChannelId {
        ChannelId(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Candidate gathering progress on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateEvent {
    /// A candidate was discovered, as a raw descriptor string.
    Candidate(String),
    /// Gathering finished; no further candidates will be discovered.
    GatheringComplete,
}

/// Whether a media track carries audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// An audio track.
    Audio,
    /// A video track.
    Video,
}

/// A capture device track handed out by [`Platform::capture`].
///
/// Tracks reserve real hardware. Probes must call [`MediaTrack::stop`]
/// when done with a track, or a long sequential run exhausts the device.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    label: String,
    stopped: Rc<Cell<bool>>,
}

impl MediaTrack {
    /// Creates a track handle. Called by capability adapters.
    pub fn new(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> MediaTrack {
        MediaTrack {
            id: id.into(),
            kind,
            label: label.into(),
            stopped: Rc::new(Cell::new(false)),
        }
    }

    /// Identifier of the track.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this is an audio or video track.
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Human readable device label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Releases the underlying device. All clones observe the stop.
    pub fn stop(&self) {
        self.stopped.set(true);
    }

    /// Whether the track has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }
}

/// Constraints for opening a capture device.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureConstraints {
    /// Request an audio track.
    pub audio: bool,
    /// Request a video track with these minimums.
    pub video: Option<VideoConstraints>,
}

/// Minimum resolution requested for a video track.
#[derive(Debug, Clone, Copy)]
pub struct VideoConstraints {
    /// Minimum frame width in pixels.
    pub min_width: u32,
    /// Minimum frame height in pixels.
    pub min_height: u32,
}

/// One local session endpoint of the negotiation capability.
///
/// Mirrors the peer connection surface the diagnostics drive: offer and
/// answer creation, description installation, trickled candidates, data
/// channels, media tracks and a live stats interface. Implementations
/// adapt the host stack and normalize its stats dialect into the
/// canonical counter names in [`crate::stats`].
///
/// The trait is polled, never called back: time advances only through
/// [`PeerEndpoint::handle_timeout`].
pub trait PeerEndpoint {
    /// Creates a local session offer.
    fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    /// Creates an answer to the installed remote offer.
    fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError>;

    /// Installs the local session description.
    fn set_local_description(&mut self, desc: &SessionDescription)
        -> Result<(), NegotiationError>;

    /// Installs the remote session description.
    fn set_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Adds a remote candidate, as the raw descriptor string.
    fn add_remote_candidate(&mut self, descriptor: &str);

    /// Polls for locally discovered candidates.
    fn poll_candidate(&mut self) -> Option<CandidateEvent>;

    /// Creates an outgoing data channel.
    fn create_channel(&mut self, label: &str) -> ChannelId;

    /// Whether a channel is open for sending.
    fn channel_is_open(&self, channel: ChannelId) -> bool;

    /// Sends data on an open channel. Returns the number of bytes queued.
    fn send(&mut self, channel: ChannelId, data: &[u8]) -> Result<usize, NegotiationError>;

    /// Bytes queued on the channel but not yet handed to the transport.
    fn buffered_amount(&self, channel: ChannelId) -> usize;

    /// Polls for channels announced by the remote side.
    fn poll_channel_open(&mut self) -> Option<ChannelId>;

    /// Polls for received channel messages.
    fn poll_message(&mut self) -> Option<(ChannelId, Vec<u8>)>;

    /// Attaches a capture track to the outgoing media.
    fn add_track(&mut self, track: &MediaTrack);

    /// Captures a point-in-time stats report.
    fn stats(&mut self) -> StatsReport;

    /// Current signaling state.
    fn signaling_state(&self) -> SignalingState;

    /// Advances internal machinery to `now`.
    fn handle_timeout(&mut self, now: Instant);

    /// Next instant the endpoint wants [`PeerEndpoint::handle_timeout`].
    fn poll_timeout(&self) -> Option<Instant>;

    /// Closes the endpoint. Idempotent.
    fn close(&mut self);
}

/// The host environment the probes run against.
pub trait Platform {
    /// Creates a single endpoint, for gather-only probes. `config` is
    /// `None` when the probe must run without relay servers.
    fn endpoint(
        &mut self,
        config: Option<&SessionConfig>,
    ) -> Result<Box<dyn PeerEndpoint>, NegotiationError>;

    /// Creates a pair of endpoints that can reach each other, for
    /// loopback calls.
    #[allow(clippy::type_complexity)]
    fn endpoint_pair(
        &mut self,
        config: &SessionConfig,
    ) -> Result<(Box<dyn PeerEndpoint>, Box<dyn PeerEndpoint>), NegotiationError>;

    /// Performs the provisioning exchange against the TURN credential
    /// service. Any transport failure or malformed response surfaces as
    /// one opaque [`ConfigError`].
    fn provision_turn(&mut self) -> Result<ProvisionedTurn, ConfigError>;

    /// Opens a capture device.
    fn capture(&mut self, constraints: &CaptureConstraints) -> Result<MediaTrack, CaptureError>;
}
