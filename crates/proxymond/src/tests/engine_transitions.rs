//! Error paths of the watch loop and its production settings store.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rstest::{fixture, rstest};
use time::UtcOffset;

use crate::monitor::{FileSettingsStore, MonitorEngine, ProxySettings, Transition};
use crate::process_state::ProcessState;

use super::support::{
    EngineHarness, HealthEvent, RecordingHealthReporter, journal_lines, wait_until,
};

#[fixture]
fn harness() -> EngineHarness {
    EngineHarness::new(ProxySettings::disabled())
}

#[rstest]
fn a_listener_requesting_a_transition_is_rejected_without_deadlock(harness: EngineHarness) {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&outcomes);
    let engine = harness.engine.clone();
    harness.engine.register_listener(move |enabled| {
        let outcome = engine.set_enabled(!enabled);
        recorded.lock().expect("outcome lock").push(outcome);
    });

    assert_eq!(harness.engine.set_enabled(true), Transition::Applied);

    assert_eq!(
        outcomes.lock().expect("outcome lock").first(),
        Some(&Transition::Rejected)
    );
    assert!(harness.engine.is_enabled());
    harness.engine.shutdown().expect("engine shuts down");
}

#[rstest]
fn read_failures_are_journalled_as_proxy_off() {
    let harness = EngineHarness::new(ProxySettings::enabled("proxy-a:8080"));
    harness.store.fail_reads(Some("settings unavailable"));

    harness.engine.set_enabled(true);
    wait_until("the failed reading", || harness.store.reads() >= 1);
    harness.store.fail_reads(None);
    harness.store.set(ProxySettings::enabled("proxy-a:8080"));
    wait_until("the recovered reading", || harness.store.reads() >= 2);
    harness.engine.shutdown().expect("engine shuts down");

    let lines = journal_lines(&harness.journal);
    assert_eq!(lines.len(), 2, "unexpected journal: {lines:?}");
    assert!(lines.first().is_some_and(|line| line.ends_with("  proxy off")));
    assert!(
        lines
            .get(1)
            .is_some_and(|line| line.ends_with("  proxy on, proxy-a:8080"))
    );
    assert!(harness.state.is_normal());
}

#[rstest]
fn an_arm_failure_ends_the_loop_and_allows_a_restart(harness: EngineHarness) {
    harness.engine.set_enabled(true);
    wait_until("the first reading", || harness.store.reads() >= 1);

    harness.store.fail_arms(Some("notification subscription lost"));

    wait_until("logging to switch off", || !harness.engine.is_enabled());
    wait_until("the watch to close", || harness.store.active_watches() == 0);
    assert!(!harness.state.is_normal());
    assert!(
        harness
            .reporter
            .events()
            .contains(&HealthEvent::LoggingChanged(false))
    );

    harness.store.fail_arms(None);
    assert_eq!(harness.engine.set_enabled(true), Transition::Applied);
    wait_until("the second activation", || {
        harness.reporter.count(&HealthEvent::MonitorStarted(2)) == 1
    });
    harness.engine.shutdown().expect("engine shuts down");
}

#[test]
fn an_unopenable_journal_fails_the_transition() {
    let dir = tempfile::TempDir::new().expect("temporary directory");
    let blocker = dir.path().join("not-a-directory");
    fs::write(&blocker, b"").expect("write blocker");
    let harness = EngineHarness::with_journal(
        ProxySettings::disabled(),
        blocker.join("proxymon.log"),
        dir,
    );

    assert_eq!(harness.engine.set_enabled(true), Transition::Failed);
    assert!(!harness.engine.is_enabled());
    assert!(!harness.state.is_normal());
    assert_eq!(harness.store.active_watches(), 0);

    // The guard is released after a failure.
    assert_eq!(harness.engine.set_enabled(false), Transition::Unchanged);
}

fn wait_for_lines(journal: &Path, count: usize) -> Vec<String> {
    wait_until("the journal to grow", || journal_lines(journal).len() >= count);
    journal_lines(journal)
}

#[test]
fn edits_to_the_settings_file_are_journalled() {
    let dir = tempfile::TempDir::new().expect("temporary directory");
    let settings = dir.path().join("config").join("internet-settings.toml");
    let journal = dir.path().join("data").join("proxymon.log");
    let state = Arc::new(ProcessState::new());
    let engine = MonitorEngine::new(
        Arc::new(FileSettingsStore::new(&settings)),
        journal.clone(),
        UtcOffset::UTC,
        Arc::clone(&state),
        Arc::new(RecordingHealthReporter::default()),
    );

    assert_eq!(engine.set_enabled(true), Transition::Applied);
    wait_for_lines(&journal, 1);

    // In place.
    fs::write(&settings, "ProxyEnable = 1\nProxyServer = \"a:80\"\n").expect("write settings");
    wait_for_lines(&journal, 2);

    // Replaced by rename, as editors and settings tools do.
    let staged = settings.with_extension("toml.tmp");
    fs::write(&staged, "ProxyEnable = true\nProxyServer = \"b:80\"\n").expect("stage settings");
    fs::rename(&staged, &settings).expect("replace settings");
    let lines = wait_for_lines(&journal, 3);

    engine.shutdown().expect("engine shuts down");
    let expected_suffixes = ["  proxy off", "  proxy on, a:80", "  proxy on, b:80"];
    assert_eq!(lines.len(), expected_suffixes.len(), "unexpected journal: {lines:?}");
    for (line, suffix) in lines.iter().zip(expected_suffixes) {
        assert!(line.ends_with(suffix), "{line:?} should end with {suffix:?}");
    }
    assert!(state.is_normal());
}
