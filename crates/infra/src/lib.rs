//! Infrastructure layer: storage adapters, mirror synchronization, batch jobs
//! and process wiring.

pub mod config;
pub mod db;
pub mod jobs;
pub mod local;
pub mod retry;
pub mod service;
pub mod sync;
