//! Injectable structured log sink (`spec.md` §4.2).
//!
//! This is distinct from the crate's own ambient tracing, which uses the
//! `log` facade directly throughout `auth`, `transport`, `group` and
//! `failover` exactly like the teacher does. `Logger` is the *public* sink
//! callers can supply to receive the specific events the core calls out:
//! request tracing, auth events, failover transitions, enrichment
//! anomalies.

use std::sync::Arc;

pub trait Logger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default sink: discards everything. Acceptable per `spec.md` §4.2.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn debug(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Bridges the public `Logger` trait onto the ambient `log` crate, matching
/// the facade the teacher already depends on everywhere else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateLogger;

impl Logger for LogCrateLogger {
    fn debug(&self, message: &str) {
        log::debug!("{message}");
    }
    fn info(&self, message: &str) {
        log::info!("{message}");
    }
    fn error(&self, message: &str) {
        log::error!("{message}");
    }
}

pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(NoOpLogger)
}
