//! Run scoring against rubrics.
//!
//! - `rubric`: YAML loading and validation
//! - `scoring`: the `ScoringEngine` (deterministic scorers and model judges)

pub mod rubric;
pub mod scoring;
