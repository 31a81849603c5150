use crate::core::{Batch, Result, Vocab};
use std::path::Path;
use std::sync::Arc;

/// Identifier into a model's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub i32);

impl TokenId {
    /// Position in the vocabulary table, `None` for negative ids.
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl From<usize> for TokenId {
    fn from(index: usize) -> Self {
        Self(index as i32)
    }
}

#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub name: String,
    pub architecture: String,
    pub context_length: usize,
    pub vocab_size: usize,
    pub quantization: Option<String>,
}

impl Default for ModelMeta {
    fn default() -> Self {
        Self {
            name: String::new(),
            architecture: "llama".to_string(),
            context_length: 2048,
            vocab_size: 0,
            quantization: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Capacity of the attention cache in tokens.
    pub n_ctx: usize,
    pub n_threads: usize,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_threads: 4,
        }
    }
}

/// A loaded, immutable model. Shared read-only between the owner and the
/// generation worker; every context it creates keeps working after the
/// owner drops its handle.
pub trait Model: Send + Sync {
    fn meta(&self) -> &ModelMeta;
    fn vocab(&self) -> &dyn Vocab;

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>>;
}

/// Mutable forward-pass state (the KV cache) of one model.
///
/// Positions fed through [`decode`](Self::decode) must continue exactly where
/// the previous call stopped. A context is owned by one thread at a time.
pub trait InferenceContext: Send {
    fn n_ctx(&self) -> usize;
    fn n_threads(&self) -> usize;

    /// Next position the cache expects.
    fn n_past(&self) -> usize;

    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Output distribution for `slot` of the last decoded batch. The borrow
    /// ends before the next `decode`.
    fn logits(&self, slot: usize) -> Result<&[f32]>;

    /// Drops all cached history.
    fn clear(&mut self);

    /// Holds history (or a failed decode) that a fresh session must not reuse.
    fn is_dirty(&self) -> bool {
        self.n_past() > 0
    }
}

pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn Model>>;
}
