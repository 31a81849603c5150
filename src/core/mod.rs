pub mod batch;
pub mod error;
pub mod model;
pub mod tokenizer;

pub use batch::{Batch, BatchEntry, SeqId, DEFAULT_BATCH_CAPACITY};
pub use error::{InferenceError, Result};
pub use model::{ContextParams, InferenceContext, Model, ModelLoader, ModelMeta, TokenId};
pub use tokenizer::{TokenizeOptions, TokenizerAdapter, Vocab, Vocabulary};
