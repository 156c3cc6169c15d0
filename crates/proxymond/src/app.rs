//! Process entry sequencing for both roles.
//!
//! Every invocation parses its verb, loads configuration and initialises
//! telemetry, then asks the arbiter for a role. The primary runs the dispatch
//! loop and hands the calling thread to the tray frontend; a secondary relays
//! its verb and returns. Finalizers always run before returning, and the exit
//! code reports only whether the command line and configuration were usable.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use clap::Parser;
use clap::error::ErrorKind;
use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;
use time::UtcOffset;
use tracing::{debug, info};

use proxymon_config::{Config, NamedObjects, NamespaceError};

use crate::action::Action;
use crate::arbiter::{ArbiterError, InstanceArbiter, Role};
use crate::channel::{ChannelError, ChannelNames, CommandChannel, send};
use crate::cli::{Cli, split_arguments};
use crate::context::ApplicationContext;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::health::{HealthReporter, RoleKind, StructuredHealthReporter};
use crate::lifecycle::CallbackError;
use crate::monitor::{FileSettingsStore, ProxySettingsStore};
use crate::shutdown::{ShutdownError, SignalRelay};
use crate::telemetry::{self, TelemetryError};
use crate::tray::{
    EmbeddedIconSource, FileIconSource, HeadlessTray, TrayController, TrayFrontend,
    TrayIconSource, TraySession,
};

const APP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::app");

/// Banner printed by every invocation that reaches a role.
pub const WELCOME: &str = concat!("Proxy Settings Monitor v", env!("CARGO_PKG_VERSION"));

/// Errors that abort launching the control plane.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Config {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Diagnostics could not be initialised.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// The object namespace could not be prepared.
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
    /// Arbitration failed.
    #[error(transparent)]
    Arbiter(#[from] ArbiterError),
    /// The command channel could not be opened.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// The signal relay could not be installed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    /// The dispatcher could not be started.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Writing user-facing output failed.
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

/// Loads configuration from the arguments routed to it.
pub trait ConfigLoader {
    /// Loads the layered configuration.
    fn load(&self, args: &[OsString]) -> Result<Config, LaunchError>;
}

/// Loader that delegates to `ortho_config`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, LaunchError> {
        Config::load_from_iter(args.iter().cloned())
            .map_err(|source| LaunchError::Config { source })
    }
}

/// Collaborators used by [`run_with`].
pub struct LaunchPlan<L, F> {
    /// Configuration source.
    pub loader: L,
    /// Frontend owning the primary's main thread.
    pub frontend: F,
    /// Sink for lifecycle events.
    pub reporter: Arc<dyn HealthReporter>,
    /// Settings store override; the configured settings file when `None`.
    pub store: Option<Arc<dyn ProxySettingsStore>>,
    /// Whether the primary relays termination signals as `Quit`.
    pub relay_signals: bool,
}

impl LaunchPlan<OrthoConfigLoader, HeadlessTray> {
    /// Production collaborators.
    #[must_use]
    pub fn production() -> Self {
        Self {
            loader: OrthoConfigLoader,
            frontend: HeadlessTray::new(),
            reporter: Arc::new(StructuredHealthReporter::new()),
            store: None,
            relay_signals: true,
        }
    }
}

/// Runs the binary with the process arguments and standard streams.
pub fn run() -> std::process::ExitCode {
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    run_with(
        std::env::args_os(),
        LaunchPlan::production(),
        &mut stdout,
        &mut stderr,
    )
}

/// Runs the binary with injected collaborators and output streams.
pub fn run_with<I, T, L, F, O, E>(
    args: I,
    plan: LaunchPlan<L, F>,
    stdout: &mut O,
    stderr: &mut E,
) -> std::process::ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
    L: ConfigLoader,
    F: TrayFrontend,
    O: Write,
    E: Write,
{
    // The local offset can only be queried soundly while single-threaded.
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    let arguments = split_arguments(args);
    let cli = match Cli::try_parse_from(&arguments.command) {
        Ok(cli) => cli,
        Err(error) => return report_usage(&error, stdout, stderr),
    };

    let LaunchPlan {
        loader,
        mut frontend,
        reporter,
        store,
        relay_signals,
    } = plan;

    let config = match loader.load(&arguments.config).and_then(|config| {
        telemetry::initialise(&config)?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(error) => {
            emit(stderr, format_args!("proxymon: {error}\n"));
            return std::process::ExitCode::FAILURE;
        }
    };

    let store = store.unwrap_or_else(|| {
        Arc::new(FileSettingsStore::new(config.settings_path().into_std_path_buf()))
    });
    let context = Arc::new(ApplicationContext::new(
        store,
        config.journal_path().into_std_path_buf(),
        offset,
        reporter,
    ));

    let action = cli.action();
    info!(target: APP_TARGET, %action, "proxymon starting");
    let launch = Launch {
        config: &config,
        context: &context,
        action,
        relay_signals,
    };
    if let Err(error) = launch.execute(&mut frontend, stdout) {
        context.state().report(&error);
        emit(stderr, format_args!("proxymon: {error}\n"));
    }

    let failures = context.lifecycle().run_finalizers();
    debug!(
        target: APP_TARGET,
        failed_finalizers = failures.len(),
        normal = context.state().is_normal(),
        "proxymon exiting"
    );
    if let Err(error) = stdout.flush() {
        debug!(target: APP_TARGET, %error, "failed to flush output");
    }
    std::process::ExitCode::SUCCESS
}

fn report_usage<O: Write, E: Write>(
    error: &clap::Error,
    stdout: &mut O,
    stderr: &mut E,
) -> std::process::ExitCode {
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            emit(stdout, format_args!("{error}"));
            std::process::ExitCode::SUCCESS
        }
        _ => {
            emit(stderr, format_args!("{error}"));
            std::process::ExitCode::from(u8::try_from(error.exit_code()).unwrap_or(2))
        }
    }
}

// Best-effort output; a failed write is only traced.
fn emit<W: Write>(sink: &mut W, message: fmt::Arguments<'_>) {
    if let Err(error) = sink.write_fmt(message) {
        debug!(target: APP_TARGET, %error, "failed to write output");
    }
}

struct Launch<'a> {
    config: &'a Config,
    context: &'a Arc<ApplicationContext>,
    action: Action,
    relay_signals: bool,
}

impl Launch<'_> {
    fn execute<F: TrayFrontend, O: Write>(
        &self,
        frontend: &mut F,
        stdout: &mut O,
    ) -> Result<(), LaunchError> {
        let objects = NamedObjects::from_config(self.config)?;
        let arbiter = InstanceArbiter::new(objects.mutex_path());
        let names = ChannelNames::from_objects(&objects);
        match arbiter.elect(self.action)? {
            Role::Primary(lease) => {
                self.context.reporter().role_elected(RoleKind::Primary);
                self.context
                    .lifecycle()
                    .register_finalizer("instance lock", move || {
                        lease.release().map_err(|error| {
                            CallbackError::with_source("failed to release the instance lock", error)
                        })
                    });
                self.run_primary(names, frontend, stdout)
            }
            Role::Secondary => {
                self.context.reporter().role_elected(RoleKind::Secondary);
                self.run_secondary(&names, stdout)
            }
        }
    }

    fn run_primary<F: TrayFrontend, O: Write>(
        &self,
        names: ChannelNames,
        frontend: &mut F,
        stdout: &mut O,
    ) -> Result<(), LaunchError> {
        writeln!(stdout, "{WELCOME}")?;
        if self.action == Action::Quit {
            writeln!(stdout, "No running instance; instance closed.")?;
            return Ok(());
        }
        stdout.flush()?;

        let context = self.context;
        let lifecycle = context.lifecycle();
        let channel = CommandChannel::open(names.clone())?;
        context.reporter().channel_opened();

        let engine = context.engine().clone();
        lifecycle.register_finalizer("monitor engine", move || {
            engine
                .shutdown()
                .map_err(|error| CallbackError::with_source("monitor engine shutdown failed", error))
        });

        if self.relay_signals {
            let relay = SignalRelay::install(names.clone(), Arc::clone(context.state()))?;
            lifecycle.register_finalizer("signal relay", move || {
                relay
                    .close()
                    .map_err(|error| CallbackError::with_source("signal relay shutdown failed", error))
            });
        }

        // The frontend's quit callback must exist before a quit can be
        // dispatched.
        frontend.install(lifecycle);
        let controller = TrayController::new(names.clone(), Arc::clone(context.state()));
        controller.attach(context.engine());
        let icon = self.load_icon();

        let dispatcher = Dispatcher::spawn(channel, Arc::clone(context), self.action)?;
        let session = TraySession {
            controller,
            icon,
            dispatcher_stopped: dispatcher.stopped(),
        };
        if let Err(error) = frontend.run(session) {
            context.state().report(&error);
            // Without a frontend nothing else would ask the dispatcher to stop.
            if let Err(error) = send(&names, Action::Quit) {
                context.state().report(&error);
            }
        }

        let outcome = dispatcher.join()?;
        info!(target: APP_TARGET, ?outcome, "primary instance finished");
        Ok(())
    }

    fn run_secondary<O: Write>(&self, names: &ChannelNames, stdout: &mut O) -> Result<(), LaunchError> {
        writeln!(stdout, "{WELCOME} (secondary)")?;
        if self.action == Action::None {
            writeln!(
                stdout,
                "No action flag given; the running instance is unchanged."
            )?;
            return Ok(());
        }
        match send(names, self.action) {
            Ok(()) => writeln!(stdout, "Action {} sent successfully", self.action)?,
            Err(error) => {
                self.context.state().report(&error);
                writeln!(stdout, "Action {} sent with error", self.action)?;
            }
        }
        Ok(())
    }

    fn load_icon(&self) -> Vec<u8> {
        let loaded = match self.config.tray_icon() {
            Some(path) => FileIconSource::new(path.as_std_path()).load_tray_icon(),
            None => EmbeddedIconSource::default().load_tray_icon(),
        };
        loaded.unwrap_or_else(|error| {
            self.context.state().report(&error);
            EmbeddedIconSource::default()
                .load_tray_icon()
                .unwrap_or_default()
        })
    }
}
