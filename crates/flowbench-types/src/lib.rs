//! Shared domain types for flowbench.
//!
//! Workflow definitions, run records, model specs, rubrics, benchmark
//! records, engine configuration and events.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod benchmark;
pub mod config;
pub mod event;
pub mod model;
pub mod rubric;
pub mod run;
pub mod workflow;
