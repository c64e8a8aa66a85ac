//! Model routing with ordered adapter fallback.
//!
//! - `ModelAdapter`: RPITIT trait implemented by concrete backends (infra)
//! - `BoxModelAdapter`: object-safe wrapper for runtime selection
//! - `AdapterRegistry` / `ModelTable`: name-indexed lookups
//! - `ModelRouter`: resolves a model id and walks its fallback chain

pub mod adapter;
pub mod box_adapter;
pub mod fallback;
pub mod registry;
