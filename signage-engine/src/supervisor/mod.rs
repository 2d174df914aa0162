//! Resilience supervision: error taxonomy, rolling-window accounting, crash journal,
//! component recovery and the delayed restart.

mod classify;
mod crash;
mod policy;
mod service;

pub use classify::{ErrorCategory, ErrorReport, ErrorSink, ErrorSource, classify};
pub use crash::{CrashEnvironment, CrashJournal, CrashRecord, MemorySnapshot};
pub use policy::{ErrorCounters, RestartHistory, Verdict};
pub use service::{
    ComponentSnapshot, MemoryProbe, ProcessRestarter, RecoveryAction, Supervised, Supervisor,
    SupervisorEvent, SupervisorHandle, SupervisorStatus,
};
