//! Seams between the resilience core and the integration around it
//!
//! - [`OperationDispatcher`] performs the platform call
//! - [`GuardedDispatcher`] puts the platform's circuit breaker in front of it
//! - [`JobStore`] and [`AdminNotifier`] receive lifecycle side effects

mod guarded;
mod hooks;
mod operation;

pub use guarded::{DispatchOutcome, GuardedDispatcher, HALF_OPEN_RETRY_AFTER};
pub(crate) use hooks::log_hook_error;
pub use hooks::{AdminNotifier, JobStore, JobStoreError, LogNotifier, NoopJobStore};
pub use operation::{
    DispatchJob, DispatchReceipt, ErrorClass, HandlerRegistry, JobHints, OperationDispatcher,
    OperationError, OperationHandler, Payload,
};
