use super::GgufMetadata;
use crate::core::tokenizer::create_vocab;
use crate::core::{
    Batch, ContextParams, InferenceContext, InferenceError, Model, ModelLoader, ModelMeta, Result,
    SeqId, Vocab,
};
use crate::infra::backend::BackendHandle;
use anyhow::Context as _;
use candle_core::quantized::gguf_file::Content;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama::{ModelWeights, MAX_SEQ_LEN};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

const SUPPORTED_ARCHITECTURES: &[&str] = &["llama"];

/// Quantized llama-family model read from a GGUF file.
pub struct GgufModel {
    meta: ModelMeta,
    vocab: Box<dyn Vocab>,
    weights: Arc<ModelWeights>,
    backend: BackendHandle,
}

impl Model for GgufModel {
    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn vocab(&self) -> &dyn Vocab {
        self.vocab.as_ref()
    }

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>> {
        if params.n_ctx == 0 || params.n_ctx > MAX_SEQ_LEN {
            return Err(InferenceError::ContextCreation(format!(
                "context size {} outside 1..={MAX_SEQ_LEN}",
                params.n_ctx
            )));
        }
        if params.n_threads == 0 {
            return Err(InferenceError::ContextCreation(
                "thread count must be positive".to_string(),
            ));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.n_threads)
            .thread_name(|i| format!("llama-decode-{i}"))
            .build()
            .map_err(|e| InferenceError::ContextCreation(e.to_string()))?;

        tracing::debug!(
            n_ctx = params.n_ctx,
            n_threads = params.n_threads,
            "created inference context"
        );

        Ok(Box::new(GgufContext {
            weights: ModelWeights::clone(&self.weights),
            pristine: Arc::clone(&self.weights),
            device: self.backend.device().clone(),
            _backend: self.backend.clone(),
            n_ctx: params.n_ctx,
            n_threads: params.n_threads,
            n_past: 0,
            poisoned: false,
            pool,
            logits: None,
        }))
    }
}

/// KV-cache state over a private copy of the model weights.
pub struct GgufContext {
    weights: ModelWeights,
    pristine: Arc<ModelWeights>,
    device: Device,
    _backend: BackendHandle,
    n_ctx: usize,
    n_threads: usize,
    n_past: usize,
    poisoned: bool,
    pool: rayon::ThreadPool,
    logits: Option<(usize, Vec<f32>)>,
}

impl GgufContext {
    fn validate(&self, batch: &Batch) -> Result<()> {
        let first = batch
            .first_pos()
            .ok_or_else(|| InferenceError::Decode("empty batch".to_string()))?;

        if first != self.n_past {
            return Err(InferenceError::Decode(format!(
                "batch starts at position {first}, cache is at {}",
                self.n_past
            )));
        }
        if first + batch.len() > self.n_ctx {
            return Err(InferenceError::CapacityExceeded {
                requested: first + batch.len(),
                capacity: self.n_ctx,
            });
        }

        let last = batch.len() - 1;
        for (slot, entry) in batch.entries().iter().enumerate() {
            if entry.seq_id != SeqId(0) {
                return Err(InferenceError::Decode(format!(
                    "sequence {} is not supported",
                    entry.seq_id.0
                )));
            }
            if entry.logits && slot != last {
                return Err(InferenceError::Decode(
                    "logits are only available for the last batch entry".to_string(),
                ));
            }
            if entry.token.index().is_none() {
                return Err(InferenceError::Decode(format!(
                    "invalid token id {}",
                    entry.token.0
                )));
            }
        }
        Ok(())
    }

    fn forward(&mut self, batch: &Batch, wants_logits: bool) -> anyhow::Result<Option<Vec<f32>>> {
        let tokens: Vec<u32> = batch.tokens().map(|t| t.0 as u32).collect();
        let input = Tensor::new(tokens.as_slice(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .context("building input tensor")?;
        let index_pos = self.n_past;

        let weights = &mut self.weights;
        let output = self
            .pool
            .install(|| weights.forward(&input, index_pos))
            .with_context(|| format!("forward pass at position {index_pos}"))?;

        if !wants_logits {
            return Ok(None);
        }
        let logits = output
            .squeeze(0)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec1::<f32>())
            .context("reading logits")?;
        Ok(Some(logits))
    }
}

impl InferenceContext for GgufContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_threads(&self) -> usize {
        self.n_threads
    }

    fn n_past(&self) -> usize {
        self.n_past
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        self.validate(batch)?;
        self.logits = None;

        let slot = batch.last_logits_slot();
        let start = Instant::now();
        match self.forward(batch, slot.is_some()) {
            Ok(logits) => {
                self.n_past += batch.len();
                self.logits = slot.zip(logits);
                tracing::trace!(
                    tokens = batch.len(),
                    n_past = self.n_past,
                    elapsed = ?start.elapsed(),
                    "decoded batch"
                );
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(InferenceError::Decode(format!("{e:#}")))
            }
        }
    }

    fn logits(&self, slot: usize) -> Result<&[f32]> {
        match &self.logits {
            Some((computed, logits)) if *computed == slot => Ok(logits.as_slice()),
            _ => Err(InferenceError::Sampling(format!(
                "no logits were computed for slot {slot}"
            ))),
        }
    }

    fn clear(&mut self) {
        self.weights = ModelWeights::clone(&self.pristine);
        self.n_past = 0;
        self.poisoned = false;
        self.logits = None;
    }

    fn is_dirty(&self) -> bool {
        self.n_past > 0 || self.poisoned
    }
}

/// Loads GGUF files through candle's quantized llama implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct GgufLoader;

impl GgufLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModelLoader for GgufLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Model>> {
        let shown = path.display().to_string();
        let fail = |reason: &dyn std::fmt::Display| InferenceError::model_load(&shown, reason);
        let start = Instant::now();

        let mut file = std::fs::File::open(path).map_err(|e| fail(&e))?;
        let content = Content::read(&mut file).map_err(|e| fail(&e))?;

        let metadata = GgufMetadata::new(&content.metadata);
        let arch = metadata.architecture();
        if !SUPPORTED_ARCHITECTURES.contains(&arch) {
            return Err(fail(&format!("unsupported architecture `{arch}`")));
        }
        let meta = metadata.to_model_meta();
        let kind = metadata.tokenizer_kind().map_err(|e| fail(&e))?;
        let vocab = metadata
            .to_vocabulary()
            .and_then(|v| create_vocab(kind, v))
            .map_err(|e| fail(&e))?;

        let backend = BackendHandle::acquire();
        let weights =
            ModelWeights::from_gguf(content, &mut file, backend.device()).map_err(|e| fail(&e))?;

        tracing::info!(
            path = %shown,
            name = %meta.name,
            vocab = vocab.n_tokens(),
            quantization = ?meta.quantization,
            elapsed = ?start.elapsed(),
            backend_holders = backend.holders(),
            "model loaded"
        );

        Ok(Arc::new(GgufModel {
            meta,
            vocab,
            weights: Arc::new(weights),
            backend,
        }))
    }
}
