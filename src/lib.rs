//! WebRTC readiness diagnostics in Sans I/O style.
//!
//! `rtcheck` drives a real-time communication stack through a series of
//! diagnostic probes (relay/reflexive/host connectivity, UDP/TCP/IPv6
//! reachability, data channel throughput, video bandwidth ramp-up) and
//! reports whether the network and device environment can sustain
//! audio/video/data calling.
//!
//! This is a [Sans I/O][sansio] implementation: the crate does no network
//! talking, opens no devices and has no internal threads or async tasks.
//! All operations happen from the calls of the public API. The host
//! supplies its communication stack behind two traits, [`PeerEndpoint`]
//! and [`Platform`], and drives the [`Scheduler`] in a loop:
//!
//! ```text
//! scheduler.start(now, &mut platform);
//! while !scheduler.is_finished() {
//!     while let Some(event) = scheduler.poll_event() {
//!         // render progress, messages, verdicts
//!     }
//!     let Some(deadline) = scheduler.poll_timeout() else { break };
//!     // sleep (or advance virtual time) until deadline
//!     scheduler.handle_timeout(deadline, &mut platform);
//! }
//! let report = scheduler.report();
//! ```
//!
//! Probes never run concurrently. They reserve host-scoped hardware
//! (camera, microphone, bandwidth), and overlapping two of them breaks
//! the one that started second in ways that depend on timing.
//!
//! [sansio]: https://sans-io.readthedocs.io

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![allow(clippy::bool_to_int_with_if)]
#![allow(clippy::manual_range_contains)]
#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

use thiserror::Error;

pub mod call;
pub mod candidate;
pub mod config;
pub mod peer;
pub mod probe;
pub mod sched;
pub mod sdp;
pub mod stats;

mod util;

pub use call::{Call, CallEvent, CallState, Side};
pub use candidate::{Candidate, CandidateFilter, CandidateKind, Protocol};
pub use config::{SessionConfig, TurnCache};
pub use peer::{PeerEndpoint, Platform};
pub use probe::{Probe, ProbeStatus};
pub use sched::{Event, RunReport, Scheduler};

/// Errors from the crate, re-exported per module.
pub mod error {
    pub use crate::candidate::ParseCandidateError;
    pub use crate::config::ConfigError;
    pub use crate::peer::{CaptureError, NegotiationError};
}

/// Umbrella error for the whole diagnostics engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CheckError {
    /// Session configuration acquisition failed.
    #[error("{0}")]
    Config(#[from] error::ConfigError),

    /// The negotiation capability rejected an operation.
    #[error("{0}")]
    Negotiation(#[from] error::NegotiationError),

    /// A capture device could not be opened.
    #[error("{0}")]
    Capture(#[from] error::CaptureError),

    /// A candidate descriptor did not match the grammar.
    #[error("{0}")]
    CandidateParse(#[from] error::ParseCandidateError),
}
