pub mod plan;
pub mod session;

pub use plan::PlanRecord;
pub use session::{SessionRecord, SessionSource};
