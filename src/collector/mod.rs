//! The collection service: instruments, scheduler, self-monitoring, and
//! the hot-reload reconciler.

mod instruments;
mod scheduler;
mod selfmon;
mod service;

pub use instruments::{Instrument, InstrumentHandle, InstrumentRegistry, fingerprint};
pub use scheduler::Scheduler;
pub use selfmon::SelfMetrics;
pub use service::{CollectorService, ReloadError, ReloadSummary, RoundStats};
