//! Test suites for the proxy monitor control plane.

mod engine_transitions;
mod monitor_behaviour;
mod support;
