//! Concrete I/O for the Flowbench engine: TOML configuration, HTTP model
//! adapters, the JSONL benchmark log and the `http_request` tool.

pub mod adapters;
pub mod config;
pub mod log;
pub mod tools;
