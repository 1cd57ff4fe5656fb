pub mod job;
pub mod user;

pub use job::{JobRecord, JobStatus, SermonSummary};
pub use user::{OperationKind, Plan, RateWindow, UserRecord};
