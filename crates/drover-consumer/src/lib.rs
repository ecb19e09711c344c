//! Per-queue consumer runtime for SQS-compatible message queues.
//!
//! Gives an application the hands-off consumption experience of a managed
//! serverless trigger, but inside a long-lived container process: long-poll
//! receives, visibility-timeout leasing while handlers run, batch or
//! per-message dispatch, and graceful drain on termination.
//!
//! The application builds a [`Registry`] of listeners, hands it to a
//! [`Supervisor`] together with a queue client, and awaits
//! [`Supervisor::run_all`]. Termination is requested through the
//! supervisor's [`ShutdownToken`], typically wired to SIGTERM/SIGINT.

pub mod config;
pub mod registry;
pub mod shutdown;
pub mod stats;
pub mod supervisor;

mod dispatcher;
mod heartbeat;
mod poller;
mod retry;

pub use config::{ConfigError, ListenerConfig, ListenerConfigBuilder};
pub use registry::{BatchHandler, Handler, Listener, MessageHandler, Registry};
pub use shutdown::{ShutdownPhase, ShutdownToken};
pub use stats::ListenerStats;
pub use supervisor::{RunOutcome, Supervisor, SupervisorError, SupervisorOptions};
