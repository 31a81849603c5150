use crate::app::executor::DEFAULT_JOIN_TIMEOUT;
use crate::app::runner::GenerationParams;
use crate::core::ContextParams;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Settings recognized by [`InferenceComponent`](crate::app::InferenceComponent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    /// Attention cache capacity in tokens.
    pub context_size: usize,
    pub thread_count: usize,
    pub max_tokens: usize,
    pub batch_capacity: usize,
    pub join_timeout_ms: u64,
    pub render_special_tokens: bool,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            context_size: 2048,
            thread_count: 4,
            max_tokens: 512,
            batch_capacity: crate::core::DEFAULT_BATCH_CAPACITY,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT.as_millis() as u64,
            render_special_tokens: true,
        }
    }
}

impl ComponentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by `LLAMA_*` variables; unparsable values are
    /// ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = parse("LLAMA_CONTEXT_SIZE").filter(|&v| v > 0) {
            config.context_size = v as usize;
        }
        if let Some(v) = parse("LLAMA_THREADS").filter(|&v| v > 0) {
            config.thread_count = v as usize;
        }
        if let Some(v) = parse("LLAMA_MAX_TOKENS") {
            config.max_tokens = v as usize;
        }
        if let Some(v) = parse("LLAMA_BATCH_SIZE").filter(|&v| v > 0) {
            config.batch_capacity = v as usize;
        }
        if let Some(v) = parse("LLAMA_JOIN_TIMEOUT_MS") {
            config.join_timeout_ms = v;
        }
        if let Some(v) = lookup("LLAMA_RENDER_SPECIAL").and_then(|v| parse_bool(&v)) {
            config.render_special_tokens = v;
        }

        config
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("invalid component config")
    }

    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            n_ctx: self.context_size,
            n_threads: self.thread_count,
        }
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            batch_capacity: self.batch_capacity,
            render_special_tokens: self.render_special_tokens,
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
