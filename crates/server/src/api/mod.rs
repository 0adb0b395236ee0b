//! REST handlers.

pub mod doc;
pub mod home;
pub mod jobs;

pub use home::{home, spec};
pub use jobs::{create_job, delete_job, get_job, list_jobs, update_job};
