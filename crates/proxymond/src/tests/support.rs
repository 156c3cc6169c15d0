//! Shared harness for the control-plane behaviour suites.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tempfile::TempDir;
use time::UtcOffset;

use proxymon_config::{Config, NamedObjects};

use crate::action::Action;
use crate::app::{ConfigLoader, LaunchError, LaunchPlan, OrthoConfigLoader, run_with};
use crate::channel::ChannelNames;
use crate::context::ApplicationContext;
use crate::dispatcher::DispatchOutcome;
use crate::health::{HealthReporter, RoleKind};
use crate::monitor::{MemorySettingsStore, MonitorEngine, ProxySettings};
use crate::process_state::ProcessState;
use crate::tray::{HeadlessTray, TrayFrontend};

const PATIENCE: Duration = Duration::from_secs(10);

/// Polls `condition` until it holds, failing the test after a generous
/// deadline.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Lines currently in the journal, or none if it does not exist yet.
pub fn journal_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|contents| contents.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

/// Engine wired to an in-memory store and a temporary journal.
pub struct EngineHarness {
    pub engine: MonitorEngine,
    pub store: MemorySettingsStore,
    pub reporter: Arc<RecordingHealthReporter>,
    pub state: Arc<ProcessState>,
    pub journal: PathBuf,
    _dir: TempDir,
}

impl EngineHarness {
    pub fn new(initial: ProxySettings) -> Self {
        let dir = TempDir::new().expect("temporary directory");
        Self::with_journal(initial, dir.path().join("journal").join("proxymon.log"), dir)
    }

    pub fn with_journal(initial: ProxySettings, journal: PathBuf, dir: TempDir) -> Self {
        let store = MemorySettingsStore::new(initial);
        let reporter = Arc::new(RecordingHealthReporter::default());
        let state = Arc::new(ProcessState::new());
        let engine = MonitorEngine::new(
            Arc::new(store.clone()),
            journal.clone(),
            UtcOffset::UTC,
            Arc::clone(&state),
            reporter.clone(),
        );
        Self {
            engine,
            store,
            reporter,
            state,
            journal,
            _dir: dir,
        }
    }
}

/// Application context wired to an in-memory store and a temporary namespace.
pub struct ContextHarness {
    pub context: Arc<ApplicationContext>,
    pub store: MemorySettingsStore,
    pub reporter: Arc<RecordingHealthReporter>,
    pub names: ChannelNames,
    pub journal: PathBuf,
    _dir: TempDir,
}

impl ContextHarness {
    pub fn new() -> Self {
        Self::with_reporter(Arc::new(RecordingHealthReporter::default()))
    }

    pub fn with_reporter(reporter: Arc<RecordingHealthReporter>) -> Self {
        let store = MemorySettingsStore::new(ProxySettings::disabled());
        let (context, names, journal, dir) =
            Self::build(Arc::new(store.clone()), reporter.clone());
        Self {
            context,
            store,
            reporter,
            names,
            journal,
            _dir: dir,
        }
    }

    pub fn build(
        store: Arc<MemorySettingsStore>,
        reporter: Arc<dyn HealthReporter>,
    ) -> (Arc<ApplicationContext>, ChannelNames, PathBuf, TempDir) {
        let dir = TempDir::new().expect("temporary directory");
        let objects = NamedObjects::new(dir.path(), "proxymon-test").expect("valid base name");
        let journal = dir.path().join("proxymon.log");
        let context = Arc::new(ApplicationContext::new(
            store,
            journal.clone(),
            UtcOffset::UTC,
            reporter,
        ));
        (context, ChannelNames::from_objects(&objects), journal, dir)
    }
}

/// Loader returning paths under a shared temporary directory, so several
/// invocations in one test agree on the object namespace.
#[derive(Clone)]
pub struct TestConfigLoader {
    dir: Arc<TempDir>,
}

impl TestConfigLoader {
    pub fn new() -> Self {
        Self {
            dir: Arc::new(TempDir::new().expect("temporary directory")),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> Config {
        let utf8 = |path: PathBuf| Utf8PathBuf::from_path_buf(path).expect("UTF-8 temp path");
        Config {
            instance_name: String::from("proxymon-test"),
            namespace_dir: Some(utf8(self.root().join("ns"))),
            journal_path: Some(utf8(self.root().join("data").join("proxymon.log"))),
            settings_path: Some(utf8(self.root().join("settings.toml"))),
            ..Config::default()
        }
    }

    pub fn objects(&self) -> NamedObjects {
        NamedObjects::from_config(&self.config()).expect("namespace prepared")
    }

    pub fn names(&self) -> ChannelNames {
        ChannelNames::from_objects(&self.objects())
    }

    pub fn journal(&self) -> PathBuf {
        self.root().join("data").join("proxymon.log")
    }

    pub fn plan(
        &self,
        store: &MemorySettingsStore,
        reporter: Arc<RecordingHealthReporter>,
    ) -> LaunchPlan<Self, HeadlessTray> {
        LaunchPlan {
            loader: self.clone(),
            frontend: HeadlessTray::new(),
            reporter,
            store: Some(Arc::new(store.clone())),
            relay_signals: false,
        }
    }
}

impl ConfigLoader for TestConfigLoader {
    fn load(&self, _args: &[OsString]) -> Result<Config, LaunchError> {
        Ok(self.config())
    }
}

/// Captured result of one `run_with` invocation.
#[derive(Debug)]
pub struct Invocation {
    pub code: ExitCode,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `proxymon <args>` against the loader's namespace with a fresh
/// recording reporter.
pub fn invoke(loader: &TestConfigLoader, store: &MemorySettingsStore, args: &[&str]) -> Invocation {
    invoke_with(
        loader.plan(store, Arc::new(RecordingHealthReporter::default())),
        args,
    )
}

/// Runs `proxymon <args>` with `plan`, capturing both output streams.
pub fn invoke_with<L, F>(plan: LaunchPlan<L, F>, args: &[&str]) -> Invocation
where
    L: ConfigLoader,
    F: TrayFrontend,
{
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let code = run_with(command_line(args), plan, &mut stdout, &mut stderr);
    Invocation {
        code,
        stdout: String::from_utf8(stdout).expect("stdout is UTF-8"),
        stderr: String::from_utf8(stderr).expect("stderr is UTF-8"),
    }
}

/// `args` prefixed with the program name.
pub fn command_line<'a>(args: &[&'a str]) -> Vec<&'a str> {
    let mut command = vec!["proxymon"];
    command.extend_from_slice(args);
    command
}

/// Output sink whose every write fails.
pub struct ClosedPipe;

impl Write for ClosedPipe {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }
}

/// Loader that fails by handing `ortho_config` an unknown log format.
pub struct FailingConfigLoader;

impl ConfigLoader for FailingConfigLoader {
    fn load(&self, _args: &[OsString]) -> Result<Config, LaunchError> {
        OrthoConfigLoader.load(&[
            OsString::from("proxymon"),
            OsString::from("--log-format"),
            OsString::from("verbose"),
        ])
    }
}

/// Records health events for assertions.
#[derive(Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    /// Captures a copy of the recorded events.
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    /// Number of recorded events equal to `event`.
    pub fn count(&self, event: &HealthEvent) -> usize {
        self.events()
            .iter()
            .filter(|recorded| *recorded == event)
            .count()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn role_elected(&self, role: RoleKind) {
        self.record(HealthEvent::RoleElected(role));
    }

    fn channel_opened(&self) {
        self.record(HealthEvent::ChannelOpened);
    }

    fn command_received(&self, action: Action) {
        self.record(HealthEvent::CommandReceived(action));
    }

    fn logging_changed(&self, enabled: bool) {
        self.record(HealthEvent::LoggingChanged(enabled));
    }

    fn transition_rejected(&self, requested: bool) {
        self.record(HealthEvent::TransitionRejected(requested));
    }

    fn monitor_started(&self, generation: u64) {
        self.record(HealthEvent::MonitorStarted(generation));
    }

    fn monitor_stopped(&self, generation: u64) {
        self.record(HealthEvent::MonitorStopped(generation));
    }

    fn proxy_changed(&self, settings: &ProxySettings) {
        self.record(HealthEvent::ProxyChanged(settings.clone()));
    }

    fn dispatcher_stopped(&self, outcome: DispatchOutcome) {
        self.record(HealthEvent::DispatcherStopped(outcome));
    }
}

/// Structured health events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    RoleElected(RoleKind),
    ChannelOpened,
    CommandReceived(Action),
    LoggingChanged(bool),
    TransitionRejected(bool),
    MonitorStarted(u64),
    MonitorStopped(u64),
    ProxyChanged(ProxySettings),
    DispatcherStopped(DispatchOutcome),
}
