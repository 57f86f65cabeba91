//! Sequential test scheduling.
//!
//! A registry of named suites, each an ordered list of named tests
//! backed by probe factories. The scheduler runs exactly one probe at a
//! time; the next probe is constructed and started only after the
//! previous run has finished. Probes reserve host-scoped hardware, so
//! two in flight would disable each other nondeterministically.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::{SessionConfig, TurnCache};
use crate::peer::Platform;
use crate::probe::{Env, Message, Probe, ProbeFactory, ProbeStatus, RunCtx};

/// Splits a `test_filter` style query parameter into test names.
///
/// An empty or all-whitespace input yields an empty filter, which means
/// the default test selection.
pub fn parse_filter_param(param: &str) -> Vec<String> {
    param
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Events surfaced while a run progresses.
#[derive(Debug, Clone)]
pub enum Event {
    /// The run began.
    RunStarted,
    /// A suite began.
    SuiteStarted {
        /// Suite name.
        suite: String,
    },
    /// A test began.
    TestStarted {
        /// Suite name.
        suite: String,
        /// Test name.
        test: String,
    },
    /// A test reported a message.
    Message {
        /// Suite name.
        suite: String,
        /// Test name.
        test: String,
        /// The message, with its level.
        message: Message,
    },
    /// A test reported progress, in percent.
    Progress {
        /// Suite name.
        suite: String,
        /// Test name.
        test: String,
        /// Progress percentage.
        percent: f32,
    },
    /// A test reached its terminal status.
    TestFinished {
        /// Suite name.
        suite: String,
        /// Test name.
        test: String,
        /// Terminal status.
        status: ProbeStatus,
    },
    /// All tests of a suite reached a terminal status.
    SuiteFinished {
        /// Suite name.
        suite: String,
        /// Aggregated status.
        status: ProbeStatus,
    },
    /// All suites finished. The run report is available.
    RunFinished,
}

/// Terminal record of one test run.
#[derive(Debug, Clone)]
pub struct TestReport {
    /// Test name.
    pub name: String,
    /// Terminal status.
    pub status: ProbeStatus,
    /// All messages the run reported, in order.
    pub messages: Vec<Message>,
    /// Number of success messages.
    pub success_count: u32,
    /// Number of error messages.
    pub error_count: u32,
    /// Number of warning messages.
    pub warning_count: u32,
}

/// Terminal record of one suite.
#[derive(Debug, Clone)]
pub struct SuiteReport {
    /// Suite name.
    pub name: String,
    /// Aggregated status, from summing the children's counts.
    pub status: ProbeStatus,
    /// Per-test records, in execution order.
    pub tests: Vec<TestReport>,
}

/// Terminal record of a whole run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Per-suite records, in execution order.
    pub suites: Vec<SuiteReport>,
}

impl RunReport {
    /// Aggregated status over every suite.
    pub fn status(&self) -> ProbeStatus {
        aggregate(self.suites.iter().map(|s| s.status))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestState {
    Pending,
    Running,
    Finished(ProbeStatus),
}

struct TestEntry {
    name: String,
    factory: ProbeFactory,
    explicit: bool,
    state: TestState,
    messages: Vec<Message>,
    success_count: u32,
    error_count: u32,
    warning_count: u32,
}

struct Suite {
    name: String,
    tests: Vec<TestEntry>,
    announced: bool,
}

struct Active {
    suite: usize,
    test: usize,
    probe: Box<dyn Probe>,
    ctx: RunCtx,
}

/// Runs registered tests strictly one at a time.
///
/// Driven like everything else in this crate: [`Scheduler::start`] once,
/// then [`Scheduler::handle_timeout`] whenever [`Scheduler::poll_timeout`]
/// expires, draining [`Scheduler::poll_event`] in between.
pub struct Scheduler {
    suites: Vec<Suite>,
    filter: Vec<String>,
    turn: TurnCache,
    active: Option<Active>,
    events: VecDeque<Event>,
    running: bool,
    finished: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Scheduler {
        Scheduler {
            suites: Vec::new(),
            filter: Vec::new(),
            turn: TurnCache::new(),
            active: None,
            events: VecDeque::new(),
            running: false,
            finished: false,
        }
    }

    /// Uses a static relay configuration instead of provisioning.
    pub fn set_static_turn_config(&mut self, config: SessionConfig) {
        self.turn = TurnCache::with_static(config);
    }

    /// Restricts the run to the named tests. An empty filter restores
    /// the default selection.
    pub fn set_filter(&mut self, names: Vec<String>) {
        self.filter = names;
    }

    /// Registers a test that runs by default.
    pub fn add_test(
        &mut self,
        suite: impl Into<String>,
        name: impl Into<String>,
        factory: impl FnMut() -> Box<dyn Probe> + 'static,
    ) {
        self.register(suite.into(), name.into(), Box::new(factory), false);
    }

    /// Registers a test that runs only when named in the filter. For
    /// expensive or intrusive diagnostics that must be opted into.
    pub fn add_explicit_test(
        &mut self,
        suite: impl Into<String>,
        name: impl Into<String>,
        factory: impl FnMut() -> Box<dyn Probe> + 'static,
    ) {
        self.register(suite.into(), name.into(), Box::new(factory), true);
    }

    fn register(&mut self, suite: String, name: String, factory: ProbeFactory, explicit: bool) {
        if self.running {
            warn!("Ignoring registration of {}/{} mid-run", suite, name);
            return;
        }
        let entry = TestEntry {
            name,
            factory,
            explicit,
            state: TestState::Pending,
            messages: Vec::new(),
            success_count: 0,
            error_count: 0,
            warning_count: 0,
        };
        match self.suites.iter_mut().find(|s| s.name == suite) {
            Some(s) => s.tests.push(entry),
            None => self.suites.push(Suite {
                name: suite,
                tests: vec![entry],
                announced: false,
            }),
        }
    }

    /// Starts the run. Registration is closed from here on.
    pub fn start(&mut self, now: Instant, platform: &mut dyn Platform) {
        if self.running {
            warn!("start() called on a running scheduler");
            return;
        }
        self.running = true;
        self.events.push_back(Event::RunStarted);
        self.advance(now, platform);
    }

    /// Advances the run to `now`.
    pub fn handle_timeout(&mut self, now: Instant, platform: &mut dyn Platform) {
        if !self.running || self.finished {
            return;
        }

        if let Some(active) = &mut self.active {
            let mut env = Env {
                platform: &mut *platform,
                turn: &mut self.turn,
            };
            active.probe.handle_timeout(now, &mut env, &mut active.ctx);
            let suite = &mut self.suites[active.suite];
            let entry = &mut suite.tests[active.test];
            drain_ctx(
                &mut active.ctx,
                &suite.name,
                &entry.name,
                &mut self.events,
                &mut entry.messages,
            );

            if active.ctx.is_done() {
                self.finish_active();
                self.advance(now, platform);
            }
        }
    }

    /// Next instant the scheduler wants [`Scheduler::handle_timeout`].
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|a| a.probe.poll_timeout())
    }

    /// Drains pending events.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Whether the run has finished.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Builds the terminal report. Meaningful once finished.
    pub fn report(&self) -> RunReport {
        let suites = self
            .suites
            .iter()
            .map(|s| {
                let tests = s
                    .tests
                    .iter()
                    .map(|t| TestReport {
                        name: t.name.clone(),
                        status: match t.state {
                            TestState::Finished(status) => status,
                            _ => ProbeStatus::Failure,
                        },
                        messages: t.messages.clone(),
                        success_count: t.success_count,
                        error_count: t.error_count,
                        warning_count: t.warning_count,
                    })
                    .collect::<Vec<_>>();
                SuiteReport {
                    name: s.name.clone(),
                    status: aggregate(tests.iter().map(|t| t.status)),
                    tests,
                }
            })
            .collect();
        RunReport { suites }
    }

    fn enabled(&self, entry: &TestEntry) -> bool {
        if self.filter.is_empty() {
            !entry.explicit
        } else {
            self.filter.iter().any(|f| f == &entry.name)
        }
    }

    /// Starts pending tests until one stays in flight or the run ends.
    fn advance(&mut self, now: Instant, platform: &mut dyn Platform) {
        loop {
            let Some((si, ti)) = self.next_pending() else {
                self.finish_run();
                return;
            };

            if !self.suites[si].announced {
                self.suites[si].announced = true;
                self.events.push_back(Event::SuiteStarted {
                    suite: self.suites[si].name.clone(),
                });
            }
            self.events.push_back(Event::TestStarted {
                suite: self.suites[si].name.clone(),
                test: self.suites[si].tests[ti].name.clone(),
            });

            if !self.enabled(&self.suites[si].tests[ti]) {
                self.finish_disabled(si, ti);
                continue;
            }

            let entry = &mut self.suites[si].tests[ti];
            entry.state = TestState::Running;
            let mut probe = (entry.factory)();
            let mut ctx = RunCtx::new();

            let mut env = Env {
                platform: &mut *platform,
                turn: &mut self.turn,
            };
            probe.start(now, &mut env, &mut ctx);
            let suite = &mut self.suites[si];
            let entry = &mut suite.tests[ti];
            drain_ctx(
                &mut ctx,
                &suite.name,
                &entry.name,
                &mut self.events,
                &mut entry.messages,
            );

            if ctx.is_done() {
                self.active = Some(Active {
                    suite: si,
                    test: ti,
                    probe,
                    ctx,
                });
                self.finish_active();
                continue;
            }

            self.active = Some(Active {
                suite: si,
                test: ti,
                probe,
                ctx,
            });
            return;
        }
    }

    fn next_pending(&self) -> Option<(usize, usize)> {
        for (si, suite) in self.suites.iter().enumerate() {
            for (ti, test) in suite.tests.iter().enumerate() {
                if test.state == TestState::Pending {
                    return Some((si, ti));
                }
            }
        }
        None
    }

    fn finish_disabled(&mut self, si: usize, ti: usize) {
        let message = Message {
            level: crate::probe::MessageLevel::Info,
            text: "Test is disabled.".to_string(),
        };
        let entry = &mut self.suites[si].tests[ti];
        entry.messages.push(message.clone());
        entry.state = TestState::Finished(ProbeStatus::Disabled);
        self.events.push_back(Event::Message {
            suite: self.suites[si].name.clone(),
            test: self.suites[si].tests[ti].name.clone(),
            message,
        });
        self.events.push_back(Event::TestFinished {
            suite: self.suites[si].name.clone(),
            test: self.suites[si].tests[ti].name.clone(),
            status: ProbeStatus::Disabled,
        });
        self.maybe_finish_suite(si);
    }

    fn finish_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let si = active.suite;
        let ti = active.test;
        let status = active.ctx.status();

        let entry = &mut self.suites[si].tests[ti];
        entry.state = TestState::Finished(status);
        entry.success_count = active.ctx.success_count();
        entry.error_count = active.ctx.error_count();
        entry.warning_count = active.ctx.warning_count();

        self.events.push_back(Event::TestFinished {
            suite: self.suites[si].name.clone(),
            test: self.suites[si].tests[ti].name.clone(),
            status,
        });
        self.maybe_finish_suite(si);
    }

    fn maybe_finish_suite(&mut self, si: usize) {
        let suite = &self.suites[si];
        let all_done = suite
            .tests
            .iter()
            .all(|t| matches!(t.state, TestState::Finished(_)));
        if !all_done {
            return;
        }
        let status = aggregate(suite.tests.iter().map(|t| match t.state {
            TestState::Finished(status) => status,
            _ => ProbeStatus::Failure,
        }));
        self.events.push_back(Event::SuiteFinished {
            suite: suite.name.clone(),
            status,
        });
    }

    fn finish_run(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.events.push_back(Event::RunFinished);
    }
}

/// Folds child statuses: any failure dominates, then warnings, then
/// success. All-disabled aggregates to disabled.
fn aggregate(statuses: impl Iterator<Item = ProbeStatus>) -> ProbeStatus {
    let mut any = false;
    let mut success = false;
    let mut warning = false;
    let mut failure = false;
    let mut enabled = false;
    for s in statuses {
        any = true;
        match s {
            ProbeStatus::Success => {
                success = true;
                enabled = true;
            }
            ProbeStatus::Warning => {
                warning = true;
                enabled = true;
            }
            ProbeStatus::Failure => {
                failure = true;
                enabled = true;
            }
            ProbeStatus::Disabled => {}
        }
    }
    if any && !enabled {
        ProbeStatus::Disabled
    } else if failure {
        ProbeStatus::Failure
    } else if warning {
        ProbeStatus::Warning
    } else if success {
        ProbeStatus::Success
    } else {
        ProbeStatus::Failure
    }
}

fn drain_ctx(
    ctx: &mut RunCtx,
    suite: &str,
    test: &str,
    events: &mut VecDeque<Event>,
    log: &mut Vec<Message>,
) {
    while let Some(message) = ctx.poll_message() {
        log.push(message.clone());
        events.push_back(Event::Message {
            suite: suite.to_string(),
            test: test.to_string(),
            message,
        });
    }
    if let Some(percent) = ctx.take_progress_update() {
        events.push_back(Event::Progress {
            suite: suite.to_string(),
            test: test.to_string(),
            percent,
        });
    }
}
