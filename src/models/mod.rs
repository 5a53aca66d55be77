pub mod analysis;
pub mod event;
pub mod task;
