pub mod grading;
pub(crate) mod scheduler;
