pub mod jobs;
pub mod lifecycle;
pub mod notifier;
pub mod persistence;
pub mod pipeline;
pub mod poller;
pub mod queue;
pub mod router;
pub mod storage;
pub mod vision;
pub mod worker;
