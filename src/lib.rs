//! Image analysis job orchestration
//!
//! This library provides the core functionality for the twin-analysis system:
//! priority-routed analysis jobs on a Redis broker, single-flight execution
//! of the analysis pipeline inside workers, task state tracking in a result
//! backend, completion events over pub/sub, and a backoff-driven result poller.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
