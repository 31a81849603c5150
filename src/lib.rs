pub mod app;
pub mod core;
pub mod envconfig;
pub mod infra;
pub mod sample;

pub use crate::app::{
    CancelToken, ComponentEvent, EventBus, EventHandler, EventKind, Executor, GenerationParams,
    InferenceComponent, LoggingHandler, Response, Session, SessionId, SessionState, StopReason,
    StreamEvent,
};
pub use crate::core::{
    Batch, BatchEntry, ContextParams, InferenceContext, InferenceError, Model, ModelLoader,
    ModelMeta, Result, SeqId, TokenId, TokenizeOptions, TokenizerAdapter, Vocab, Vocabulary,
};
pub use envconfig::ComponentConfig;
pub use infra::{GgufLoader, GgufModel};
pub use sample::greedy;
