//! Fleet controller (autoscaler)
//!
//! Compares the backlog with the fleet size every `tick_interval` and asks a
//! [`Provisioner`] for at most one node more or one node less:
//!
//! ```text
//!   pending > scale_up_threshold   && fleet < max  → provision one
//!   pending < scale_down_threshold && fleet > min  → terminate least loaded
//!   otherwise                                      → hold
//! ```
//!
//! `fleet = live nodes + outstanding provisions - terminations in flight`.
//! Provisioning failures are logged and retried on the next tick.

mod config;
mod controller;
mod provisioner;

pub use config::{FleetConfig, FleetConfigError};
pub use controller::{
    decide, FleetController, FleetSnapshot, ScaleAction, ScaleDecision, TickReport,
};
pub use provisioner::{DryRunProvisioner, HttpProvisioner, ProvisionError, Provisioner};
