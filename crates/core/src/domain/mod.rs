pub mod actor;
pub mod report;
pub mod workflow;
