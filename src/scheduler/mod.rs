pub mod job;
pub mod queue;
pub mod source;

pub use job::{CommandTemplate, Job, PLACEHOLDER};
pub use queue::{JobQueue, JobSender};
pub use source::{IngestMode, JobSource};
