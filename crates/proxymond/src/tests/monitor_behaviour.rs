//! Behavioural tests for the logging state machine and its watch loop.

use std::cell::RefCell;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use crate::monitor::{ProxySettings, Transition};

use super::support::{EngineHarness, HealthEvent, journal_lines, wait_until};

type StepResult = Result<(), String>;

struct MonitorWorld {
    harness: EngineHarness,
    outcomes: Vec<Transition>,
    gate: Option<(Arc<Barrier>, Arc<Barrier>)>,
}

impl MonitorWorld {
    fn new() -> Self {
        Self {
            harness: EngineHarness::new(ProxySettings::disabled()),
            outcomes: Vec::new(),
            gate: None,
        }
    }

    fn request(&mut self, value: bool) {
        let outcome = self.harness.engine.set_enabled(value);
        self.outcomes.push(outcome);
    }
}

impl Drop for MonitorWorld {
    fn drop(&mut self) {
        drop(self.harness.engine.shutdown());
    }
}

#[fixture]
fn world() -> RefCell<MonitorWorld> {
    RefCell::new(MonitorWorld::new())
}

#[given("a disabled monitor engine")]
fn given_disabled_engine(world: &RefCell<MonitorWorld>) {
    assert!(!world.borrow().harness.engine.is_enabled());
}

#[given("a listener that parks inside the first transition")]
fn given_parking_listener(world: &RefCell<MonitorWorld>) {
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let gate = Mutex::new(Some((Arc::clone(&entered), Arc::clone(&release))));
    let mut world = world.borrow_mut();
    world.harness.engine.register_listener(move |_| {
        let barriers = gate.lock().expect("gate lock").take();
        if let Some((entered, release)) = barriers {
            entered.wait();
            release.wait();
        }
    });
    world.gate = Some((entered, release));
}

#[when("logging is enabled")]
fn when_enabled(world: &RefCell<MonitorWorld>) {
    world.borrow_mut().request(true);
}

#[when("logging is disabled")]
fn when_disabled(world: &RefCell<MonitorWorld>) {
    world.borrow_mut().request(false);
}

#[when("a disable request arrives while logging is being enabled")]
fn when_disable_races_enable(world: &RefCell<MonitorWorld>) -> StepResult {
    let (entered, release) = world
        .borrow_mut()
        .gate
        .take()
        .ok_or("no parking listener was registered")?;
    let engine = world.borrow().harness.engine.clone();

    let enabling = {
        let engine = engine.clone();
        thread::spawn(move || engine.set_enabled(true))
    };
    entered.wait();
    let disabling = engine.set_enabled(false);
    release.wait();
    let enabled = enabling
        .join()
        .map_err(|_| String::from("enabling thread panicked"))?;

    world.borrow_mut().outcomes.extend([enabled, disabling]);
    Ok(())
}

#[when("the proxy settings change to {readings}")]
fn when_settings_change(world: &RefCell<MonitorWorld>, readings: String) {
    let world = world.borrow();
    let store = &world.harness.store;
    wait_until("the first reading", || store.reads() >= 1);
    for (index, reading) in readings.split(", ").map(parse_reading).enumerate() {
        store.set(reading);
        wait_until("the next reading", || store.reads() >= index + 2);
    }
}

#[then("the transitions were {outcomes}")]
fn then_transitions(world: &RefCell<MonitorWorld>, outcomes: String) -> StepResult {
    let expected = outcomes
        .split(" then ")
        .map(parse_transition)
        .collect::<Result<Vec<_>, _>>()?;
    let actual = world.borrow().outcomes.clone();
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected transitions {expected:?}, got {actual:?}"))
    }
}

#[then("logging is on")]
fn then_logging_on(world: &RefCell<MonitorWorld>) {
    assert!(world.borrow().harness.engine.is_enabled());
}

#[then("logging is off")]
fn then_logging_off(world: &RefCell<MonitorWorld>) {
    assert!(!world.borrow().harness.engine.is_enabled());
}

#[then("exactly one watch loop was started")]
fn then_one_watch_loop(world: &RefCell<MonitorWorld>) {
    let world = world.borrow();
    let reporter = &world.harness.reporter;
    wait_until("the watch loop to start", || {
        reporter.count(&HealthEvent::MonitorStarted(1)) == 1
    });
    let starts = reporter
        .events()
        .iter()
        .filter(|event| matches!(event, HealthEvent::MonitorStarted(_)))
        .count();
    assert_eq!(starts, 1);
}

#[then("the rejection was reported")]
fn then_rejection_reported(world: &RefCell<MonitorWorld>) {
    assert!(
        world
            .borrow()
            .harness
            .reporter
            .events()
            .contains(&HealthEvent::TransitionRejected(false))
    );
}

#[then("the journal reads {readings}")]
fn then_journal_reads(world: &RefCell<MonitorWorld>, readings: String) -> StepResult {
    let expected: Vec<String> = readings
        .split(", ")
        .map(|reading| match parse_reading(reading) {
            ProxySettings { enabled: true, server } => format!("  proxy on, {server}"),
            ProxySettings { enabled: false, .. } => String::from("  proxy off"),
        })
        .collect();
    let world = world.borrow();
    let journal = &world.harness.journal;
    wait_until("the journal to catch up", || {
        journal_lines(journal).len() >= expected.len()
    });

    let lines = journal_lines(journal);
    if lines.len() != expected.len() {
        return Err(format!("expected {} journal lines, got {lines:?}", expected.len()));
    }
    match lines
        .iter()
        .zip(&expected)
        .find(|(line, suffix)| !line.ends_with(suffix.as_str()))
    {
        Some((line, suffix)) => Err(format!("{line:?} should end with {suffix:?}")),
        None => Ok(()),
    }
}

#[then("the watch loop released its subscription and journal")]
fn then_resources_released(world: &RefCell<MonitorWorld>) {
    let world = world.borrow();
    wait_until("the watch to close", || {
        world.harness.store.active_watches() == 0
    });
    wait_until("the loop to stop", || {
        world.harness.reporter.count(&HealthEvent::MonitorStopped(1)) == 1
    });
}

#[then("the process state is still normal")]
fn then_state_normal(world: &RefCell<MonitorWorld>) {
    assert!(world.borrow().harness.state.is_normal());
}

fn parse_reading(reading: &str) -> ProxySettings {
    match reading.trim() {
        "off" => ProxySettings::disabled(),
        server => ProxySettings::enabled(server),
    }
}

fn parse_transition(name: &str) -> Result<Transition, String> {
    match name.trim() {
        "applied" => Ok(Transition::Applied),
        "unchanged" => Ok(Transition::Unchanged),
        "rejected" => Ok(Transition::Rejected),
        "failed" => Ok(Transition::Failed),
        other => Err(format!("unknown transition '{other}'")),
    }
}

#[scenario(
    path = "tests/features/monitor_engine.feature",
    name = "Enabling twice starts a single watch loop"
)]
fn enabling_twice(world: RefCell<MonitorWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/monitor_engine.feature",
    name = "A transition in flight rejects a concurrent request"
)]
fn concurrent_transitions(world: RefCell<MonitorWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/monitor_engine.feature",
    name = "Repeated readings are journalled once"
)]
fn journal_dedup(world: RefCell<MonitorWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/monitor_engine.feature",
    name = "Disabling releases the watch loop resources"
)]
fn disabling_releases(world: RefCell<MonitorWorld>) {
    drop(world);
}
