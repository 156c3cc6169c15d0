//! Structured health reporting for control-plane lifecycle events.

use std::fmt;
use std::sync::Arc;

use crate::action::Action;
use crate::dispatcher::DispatchOutcome;
use crate::monitor::ProxySettings;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Role reported once arbitration has reached a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// This process owns the instance lock.
    Primary,
    /// Another process owns the instance lock.
    Secondary,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => formatter.write_str("primary"),
            Self::Secondary => formatter.write_str("secondary"),
        }
    }
}

/// Observer trait used to surface lifecycle events to telemetry sinks.
#[cfg_attr(test, mockall::automock)]
pub trait HealthReporter: Send + Sync {
    /// Invoked once arbitration assigns a role.
    fn role_elected(&self, role: RoleKind);

    /// Invoked when the primary's command channel is ready.
    fn channel_opened(&self);

    /// Invoked for every verb the dispatcher observes.
    fn command_received(&self, action: Action);

    /// Invoked after a logging transition is applied.
    fn logging_changed(&self, enabled: bool);

    /// Invoked when a transition request hits the reentrancy guard.
    fn transition_rejected(&self, requested: bool);

    /// Invoked when a watch loop activation starts.
    fn monitor_started(&self, generation: u64);

    /// Invoked when a watch loop activation has released its resources.
    fn monitor_stopped(&self, generation: u64);

    /// Invoked when the watch loop journals a new proxy reading.
    fn proxy_changed(&self, settings: &ProxySettings);

    /// Invoked when the dispatch loop terminates.
    fn dispatcher_stopped(&self, outcome: DispatchOutcome);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter + ?Sized,
{
    fn role_elected(&self, role: RoleKind) {
        (**self).role_elected(role);
    }

    fn channel_opened(&self) {
        (**self).channel_opened();
    }

    fn command_received(&self, action: Action) {
        (**self).command_received(action);
    }

    fn logging_changed(&self, enabled: bool) {
        (**self).logging_changed(enabled);
    }

    fn transition_rejected(&self, requested: bool) {
        (**self).transition_rejected(requested);
    }

    fn monitor_started(&self, generation: u64) {
        (**self).monitor_started(generation);
    }

    fn monitor_stopped(&self, generation: u64) {
        (**self).monitor_stopped(generation);
    }

    fn proxy_changed(&self, settings: &ProxySettings) {
        (**self).proxy_changed(settings);
    }

    fn dispatcher_stopped(&self, outcome: DispatchOutcome) {
        (**self).dispatcher_stopped(outcome);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn role_elected(&self, role: RoleKind) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "role_elected",
            %role,
            "instance role elected"
        );
    }

    fn channel_opened(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "channel_opened",
            "command channel ready"
        );
    }

    fn command_received(&self, action: Action) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "command_received",
            %action,
            "command received"
        );
    }

    fn logging_changed(&self, enabled: bool) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "logging_changed",
            enabled,
            "proxy logging state changed"
        );
    }

    fn transition_rejected(&self, requested: bool) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "transition_rejected",
            requested,
            "logging transition already in progress; request ignored"
        );
    }

    fn monitor_started(&self, generation: u64) {
        tracing::debug!(
            target: HEALTH_TARGET,
            event = "monitor_started",
            generation,
            "watch loop started"
        );
    }

    fn monitor_stopped(&self, generation: u64) {
        tracing::debug!(
            target: HEALTH_TARGET,
            event = "monitor_stopped",
            generation,
            "watch loop released its resources"
        );
    }

    fn proxy_changed(&self, settings: &ProxySettings) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "proxy_changed",
            enabled = settings.enabled,
            server = %settings.server,
            "proxy settings changed"
        );
    }

    fn dispatcher_stopped(&self, outcome: DispatchOutcome) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "dispatcher_stopped",
            ?outcome,
            "dispatch loop stopped"
        );
    }
}
