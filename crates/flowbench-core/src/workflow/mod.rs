//! Workflow definitions, validation, and DAG execution.
//!
//! - `loader`: YAML parsing, structural validation, dependency resolution
//! - `expression`: `{{ ... }}` input bindings and templates
//! - `contract`: input/output schema checks
//! - `state`: step lifecycle transitions
//! - `executor`: frontier-driven concurrent execution

pub mod contract;
pub mod dag;
pub mod executor;
pub mod expression;
pub mod jexl;
pub mod loader;
pub mod state;
pub mod step_runner;
pub mod tools;
