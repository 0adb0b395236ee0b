pub mod dispatch;
pub mod launcher;
pub mod scheduler;
pub mod triggers;

pub use dispatch::{mutation_channel, JobMutation, MutationKind, MutationSender};
pub use launcher::{EcsTaskLauncher, LaunchOutcome, Launcher, OVERRIDE_TAG};
pub use scheduler::SchedulerEngine;
pub use triggers::{SqsQueueTrigger, TriggerEvaluator, TriggerRegistry};
