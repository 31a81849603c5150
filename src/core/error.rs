use thiserror::Error;

/// Every failure the inference core can report.
///
/// Errors raised inside a generation worker never unwind past it; they reach
/// the owner as a terminal [`StreamEvent::Failed`](crate::app::runner::StreamEvent)
/// or, after generation started, as a [`StopReason`](crate::app::runner::StopReason).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("failed to load model from {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("a model is already loaded, unload it first")]
    ModelAlreadyLoaded,

    #[error("no model loaded")]
    ModelNotLoaded,

    #[error("failed to create inference context: {0}")]
    ContextCreation(String),

    #[error("tokenization failed: {0}")]
    Tokenization(String),

    #[error("{requested} tokens exceed the capacity of {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("sampling failed: {0}")]
    Sampling(String),

    #[error("a generation is already running")]
    AlreadyRunning,

    #[error("inference context is unavailable")]
    ContextUnavailable,

    #[error("failed to spawn inference worker: {0}")]
    WorkerSpawn(String),

    #[error("inference worker exited without a terminal event")]
    WorkerLost,

    #[error("inference worker panicked: {0}")]
    WorkerPanicked(String),
}

impl InferenceError {
    pub fn model_load(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Rejections that leave all state untouched.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ModelAlreadyLoaded | Self::ModelNotLoaded | Self::AlreadyRunning
        )
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;
