//! Workflow execution engine for flowbench.
//!
//! This crate holds the engine logic and the ports that the infrastructure
//! layer implements (model adapters, tools, benchmark logs). It depends only
//! on `flowbench-types` -- never on `flowbench-infra` or any network crate.

pub mod benchmark;
pub mod eval;
pub mod event;
pub mod router;
pub mod workflow;
