pub mod config;
pub mod error;
pub mod job;
pub mod schedule;
pub mod validate;

pub use config::Config;
pub use error::{SchedulerError, ValidationErrors};
pub use job::{ContainerOverride, Job, JobPatch, TaskInfo, Trigger, MAX_TASKS};
pub use schedule::Schedule;
