//! Control plane for the proxy settings monitor.
//!
//! Every invocation of the binary first asks the [`InstanceArbiter`] for a
//! role. The elected primary opens the [`CommandChannel`], starts the
//! [`Dispatcher`] on a background thread and hands the main thread to the tray
//! collaborator. The dispatcher toggles the [`MonitorEngine`], which watches the
//! per-user proxy settings and appends a journal line for every observed
//! change. A secondary invocation signals one verb on the existing channel and
//! exits.
//!
//! Failures never crash the process. They flip the shared [`ProcessState`] to
//! abnormal, are reported through `tracing`, and the process carries on in
//! whatever degraded capacity remains. Teardown is ordered through the
//! [`LifecycleRegistry`]: quit callbacks run when the quit verb is processed,
//! finalizers run at exit, both last-registered first.

mod action;
mod app;
mod arbiter;
mod channel;
mod cli;
mod context;
mod dispatcher;
pub mod event;
mod health;
mod lifecycle;
pub mod monitor;
mod process_state;
mod shutdown;
mod telemetry;
pub mod tray;

pub use action::Action;
pub use app::{ConfigLoader, LaunchError, LaunchPlan, OrthoConfigLoader, WELCOME, run, run_with};
pub use arbiter::{ArbiterError, InstanceArbiter, PrimaryLease, Role};
pub use channel::{ChannelError, ChannelNames, CommandChannel, send};
pub use cli::{Cli, CliArguments, split_arguments};
pub use context::ApplicationContext;
pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher, DispatcherHandle};
pub use health::{HealthReporter, RoleKind, StructuredHealthReporter};
pub use lifecycle::{CallbackError, CallbackFailure, FailureCause, LifecycleRegistry, Stage};
pub use monitor::{MonitorEngine, MonitorError, Transition};
pub use process_state::ProcessState;
pub use shutdown::{ShutdownError, SignalRelay};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
