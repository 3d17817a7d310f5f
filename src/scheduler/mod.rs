pub mod job;
pub mod queue;
pub mod registry;

pub use job::{ChatMessage, JobRecord, JobStatus, JobView, QueueStats, WorkerRecord};
pub use queue::{JobQueue, KeyLayout};
