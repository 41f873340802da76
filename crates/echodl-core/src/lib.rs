pub mod config;
pub mod logging;

pub mod analytics;
pub mod control;
pub mod events;
pub mod fetch;
pub mod filename;
pub mod job;
pub mod planner;
pub mod probe;
pub mod ranges;
pub mod resume;
pub mod retry;
pub mod scheduler;
pub mod storage;
