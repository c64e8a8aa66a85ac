//! Benchmark sweeps over (workflow, model) pairs.
//!
//! - `log`: the append-only `BenchmarkLog` port (JSONL implementation in infra)
//! - `runner`: bounded-parallel sweep with resume and dry-run

pub mod log;
pub mod runner;
