mod common;

use std::time::Instant;

use common::{drive, has_message, init_log, SimPlatform};
use rtcheck::probe::{ConnectivityProbe, MessageLevel, ProbeStatus};
use rtcheck::Scheduler;

fn provision_body(lifetime_secs: u64) -> String {
    format!(
        r#"{{
            "username": "1700000000:rtcheck",
            "password": "c2VjcmV0",
            "uris": ["turn:198.51.100.7:3478?transport=udp"],
            "lifetimeDuration": {lifetime_secs}
        }}"#
    )
}

fn run_two_relay_tests(platform: &mut SimPlatform) -> (ProbeStatus, ProbeStatus) {
    init_log();

    let mut sched = Scheduler::new();
    sched.add_test("connectivity", "relay-1", || {
        Box::new(ConnectivityProbe::relay())
    });
    sched.add_test("connectivity", "relay-2", || {
        Box::new(ConnectivityProbe::relay())
    });

    sched.start(Instant::now(), platform);
    drive(&mut sched, platform, Instant::now());

    let report = sched.report();
    let tests = &report.suites[0].tests;
    (tests[0].status, tests[1].status)
}

#[test]
fn long_lived_credentials_are_fetched_once() {
    let mut platform = SimPlatform::new();
    platform.provision_json = Some(provision_body(600));
    let count = platform.provision_count.clone();

    let (first, second) = run_two_relay_tests(&mut platform);

    assert_eq!(first, ProbeStatus::Success);
    assert_eq!(second, ProbeStatus::Success);
    assert_eq!(count.get(), 1);
}

#[test]
fn short_lived_credentials_are_refreshed_per_probe() {
    let mut platform = SimPlatform::new();
    // Expires before a second five-second run could complete.
    platform.provision_json = Some(provision_body(1));
    let count = platform.provision_count.clone();

    let (first, second) = run_two_relay_tests(&mut platform);

    assert_eq!(first, ProbeStatus::Success);
    assert_eq!(second, ProbeStatus::Success);
    assert_eq!(count.get(), 2);
}

#[test]
fn provisioning_failure_fails_the_probe_with_guidance() {
    let mut platform = SimPlatform::new();
    platform.provision_json = None;

    init_log();
    let mut sched = Scheduler::new();
    sched.add_test("connectivity", "relay", || {
        Box::new(ConnectivityProbe::relay())
    });
    sched.start(Instant::now(), &mut platform);
    drive(&mut sched, &mut platform, Instant::now());

    let report = sched.report().suites[0].tests[0].clone();
    assert_eq!(report.status, ProbeStatus::Failure);
    assert!(has_message(
        &report,
        MessageLevel::Error,
        "TURN configuration fetch failed"
    ));
}
