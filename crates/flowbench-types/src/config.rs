//! Engine configuration types.
//!
//! `EngineConfig` is the top-level `flowbench.toml`: engine limits, adapter
//! endpoints, the logical model table and benchmark defaults. Every field
//! has a default so an empty file is valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::ModelSpec;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub benchmark: BenchmarkSettings,
}

/// Execution limits and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Maximum steps of one run executing at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-attempt step timeout when a step declares none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    /// Per-call timeout handed to adapters.
    #[serde(default = "default_router_timeout_secs")]
    pub router_timeout_secs: u64,
    /// Model used by model-call steps that name none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_router_timeout_secs() -> u64 {
    120
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_step_timeout_secs: default_step_timeout_secs(),
            router_timeout_secs: default_router_timeout_secs(),
            default_model: None,
        }
    }
}

/// A configured model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Name model bindings refer to.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AdapterKind,
    /// API base URL (adapter-specific default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub locality: Locality,
}

/// Wire protocol spoken by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// OpenAI chat-completions protocol (OpenAI, Ollama, vLLM, LM Studio).
    OpenaiCompatible,
    /// Anthropic Messages API.
    Anthropic,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::OpenaiCompatible => write!(f, "openai_compatible"),
            AdapterKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// Whether a backend runs on this machine or a remote service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    Local,
    #[default]
    Remote,
}

/// Benchmark sweep defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSettings {
    /// Maximum (workflow, model) pairs executing at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Append-only JSONL log.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

fn default_max_parallel() -> usize {
    2
}

fn default_log_path() -> PathBuf {
    PathBuf::from("flowbench-results.jsonl")
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            log_path: default_log_path(),
        }
    }
}
