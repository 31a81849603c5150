pub mod component;
pub mod events;
pub mod executor;
pub mod runner;

pub use component::InferenceComponent;
pub use events::{ComponentEvent, EventBus, EventHandler, EventKind, HandlerId, LoggingHandler};
pub use executor::{Executor, SessionId, DEFAULT_JOIN_TIMEOUT};
pub use runner::{
    CancelToken, GenerationParams, Response, Session, SessionState, StopReason, StreamEvent,
};
