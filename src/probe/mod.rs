//! Diagnostic probes.
//!
//! Every diagnostic is a bounded-duration experiment with a uniform
//! contract: it is started once, driven by timeouts, reports messages
//! and progress through [`RunCtx`], and finishes exactly once with a
//! terminal verdict derived from its message counts. The scheduler only
//! ever observes terminal states; probe-internal failures never escape
//! as errors.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::{ConfigError, SessionConfig, TurnCache};
use crate::peer::{CaptureError, NegotiationError, Platform};
use crate::CheckError;

mod bandwidth;
mod connectivity;
mod network;
mod throughput;

pub use bandwidth::VideoBandwidthProbe;
pub use connectivity::ConnectivityProbe;
pub use network::{NetworkProbe, NetworkProbeKind};
pub use throughput::DataThroughputProbe;

/// Severity of a probe report message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// Informational, does not affect the verdict.
    Info,
    /// A successful observation.
    Success,
    /// Expected-but-unreachable configuration; degrades the verdict to
    /// [`ProbeStatus::Warning`] but is not a failure.
    Warning,
    /// A failure observation.
    Error,
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            MessageLevel::Info => "[   INFO ]",
            MessageLevel::Success => "[     OK ]",
            MessageLevel::Warning => "[WARNING ]",
            MessageLevel::Error => "[ FAILED ]",
        };
        write!(f, "{x}")
    }
}

/// One report message from a probe run.
#[derive(Debug, Clone)]
pub struct Message {
    /// Severity.
    pub level: MessageLevel,
    /// Human readable text.
    pub text: String,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level, self.text)
    }
}

/// Terminal status of a probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// At least one success, no errors or warnings.
    Success,
    /// Warnings but no errors.
    Warning,
    /// At least one error, or nothing observed at all.
    Failure,
    /// The probe was not enabled for this run.
    Disabled,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            ProbeStatus::Success => "Success",
            ProbeStatus::Warning => "Warning",
            ProbeStatus::Failure => "Failure",
            ProbeStatus::Disabled => "Disabled",
        };
        write!(f, "{x}")
    }
}

/// Per-run reporting context handed to a probe by the scheduler.
///
/// Collects messages, success/error accounting and progress. A fresh
/// context is created for every run, so repeated runs of the same
/// registered probe never leak state.
#[derive(Debug, Default)]
pub struct RunCtx {
    messages: VecDeque<Message>,
    success_count: u32,
    error_count: u32,
    warning_count: u32,
    progress_update: Option<f32>,
    done: bool,
}

impl RunCtx {
    pub(crate) fn new() -> RunCtx {
        RunCtx::default()
    }

    /// Reports an informational message.
    pub fn report_info(&mut self, text: impl Into<String>) {
        self.push(MessageLevel::Info, text.into());
    }

    /// Reports a success and counts it towards the verdict.
    pub fn report_success(&mut self, text: impl Into<String>) {
        self.success_count += 1;
        self.push(MessageLevel::Success, text.into());
    }

    /// Reports a warning and counts it towards the verdict.
    pub fn report_warning(&mut self, text: impl Into<String>) {
        self.warning_count += 1;
        self.push(MessageLevel::Warning, text.into());
    }

    /// Reports an error and counts it towards the verdict.
    pub fn report_error(&mut self, text: impl Into<String>) {
        self.error_count += 1;
        self.push(MessageLevel::Error, text.into());
    }

    /// Reports an error and finishes the run.
    pub fn report_fatal(&mut self, text: impl Into<String>) {
        self.report_error(text);
        self.finish();
    }

    /// Updates run progress, in percent.
    pub fn set_progress(&mut self, percent: f32) {
        self.progress_update = Some(percent.clamp(0.0, 100.0));
    }

    /// Marks the run finished. The first call is the terminal one;
    /// further calls are ignored.
    pub fn finish(&mut self) {
        if self.done {
            debug!("finish() called on a finished run");
            return;
        }
        self.done = true;
    }

    /// Whether the run has finished.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Successes reported so far.
    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    /// Errors reported so far.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Warnings reported so far.
    pub fn warning_count(&self) -> u32 {
        self.warning_count
    }

    fn push(&mut self, level: MessageLevel, text: String) {
        debug!("{} {}", level, text);
        self.messages.push_back(Message { level, text });
    }

    pub(crate) fn poll_message(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    pub(crate) fn take_progress_update(&mut self) -> Option<f32> {
        self.progress_update.take()
    }

    pub(crate) fn status(&self) -> ProbeStatus {
        if self.error_count > 0 {
            ProbeStatus::Failure
        } else if self.warning_count > 0 {
            ProbeStatus::Warning
        } else if self.success_count > 0 {
            ProbeStatus::Success
        } else {
            ProbeStatus::Failure
        }
    }
}

/// What a probe run has access to: the host platform and the shared
/// TURN configuration cache.
pub struct Env<'a> {
    /// The host environment.
    pub platform: &'a mut dyn Platform,
    /// The shared TURN configuration cache.
    pub turn: &'a mut TurnCache,
}

impl Env<'_> {
    /// Acquires a session configuration valid for at least
    /// `expected_run`, from cache or by provisioning.
    pub fn turn_config(
        &mut self,
        now: Instant,
        expected_run: Duration,
    ) -> Result<SessionConfig, ConfigError> {
        self.turn.get(now, expected_run, self.platform)
    }
}

/// A diagnostic probe.
///
/// Implementations are state machines: [`Probe::start`] begins the
/// experiment (acquiring configuration and resources), repeated
/// [`Probe::handle_timeout`] calls drive it, and the probe signals
/// completion by calling [`RunCtx::finish`]. Probes must be bounded:
/// every variant carries a hard deadline and reaches a terminal state
/// even on adverse conditions.
pub trait Probe {
    /// Starts the run. May finish the run immediately (fatal setup
    /// error, nothing to do).
    fn start(&mut self, now: Instant, env: &mut Env<'_>, ctx: &mut RunCtx);

    /// Advances the run to `now`.
    fn handle_timeout(&mut self, now: Instant, env: &mut Env<'_>, ctx: &mut RunCtx);

    /// Next instant the probe wants [`Probe::handle_timeout`], or `None`
    /// once finished.
    fn poll_timeout(&self) -> Option<Instant>;
}

/// Factory for probe instances. Each run constructs a fresh probe.
pub type ProbeFactory = Box<dyn FnMut() -> Box<dyn Probe>>;

/// Maps a setup failure to the guidance text probes report.
pub(crate) fn failure_text(e: &CheckError) -> String {
    match e {
        CheckError::Config(e) => format!("TURN configuration fetch failed: {e}"),
        CheckError::Negotiation(NegotiationError::Unavailable(reason)) => {
            format!("Failed to create peer connection: {reason}")
        }
        CheckError::Negotiation(e) => format!("Connection setup failed: {e}"),
        CheckError::Capture(CaptureError::Blocked) => {
            "Camera or microphone access is blocked in the browser.".to_string()
        }
        CheckError::Capture(CaptureError::Unavailable) => {
            "No usable capture device is available.".to_string()
        }
        CheckError::Capture(CaptureError::Overconstrained) => {
            "The capture device cannot deliver the requested resolution.".to_string()
        }
        CheckError::CandidateParse(e) => format!("Failed to parse candidate: {e}"),
    }
}
