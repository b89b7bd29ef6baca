//! The reconciliation cycle between the band and the local ledger.

pub mod clock;
pub mod orchestrator;
mod result;

pub use clock::{Clock, FixedClock, SystemClock};
pub use orchestrator::SyncOrchestrator;
pub use result::{StepOutcome, SyncOutcome, SyncResult};
