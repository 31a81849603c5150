use crate::app::runner::Response;
use crate::core::InferenceError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub type EventCallback = Box<dyn Fn(&ComponentEvent) + Send + Sync>;

/// Everything the owner of an inference component can observe. Published on
/// the owner's thread only.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentEvent {
    ModelLoaded { path: String, name: String },
    ModelUnloaded { path: String },
    InferenceStarted { session: u64, prompt_len: usize },
    TokenGenerated { session: u64, text: String },
    /// Completed or aborted; `response.stop_reason` tells which.
    ResponseReceived { session: u64, response: Response },
    GenerationFailed { session: u64, error: InferenceError },
}

impl ComponentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ModelLoaded { .. } => EventKind::ModelLoaded,
            Self::ModelUnloaded { .. } => EventKind::ModelUnloaded,
            Self::InferenceStarted { .. } => EventKind::InferenceStarted,
            Self::TokenGenerated { .. } => EventKind::TokenGenerated,
            Self::ResponseReceived { .. } => EventKind::ResponseReceived,
            Self::GenerationFailed { .. } => EventKind::GenerationFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ModelLoaded,
    ModelUnloaded,
    InferenceStarted,
    TokenGenerated,
    ResponseReceived,
    GenerationFailed,
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ComponentEvent);
    fn name(&self) -> &str;
}

pub type HandlerId = usize;

pub struct EventBus {
    handlers: RwLock<HashMap<HandlerId, (String, Arc<dyn EventHandler>)>>,
    callbacks: RwLock<HashMap<EventKind, Vec<(HandlerId, EventCallback)>>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    fn allocate_id(&self) -> HandlerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe<H: EventHandler + 'static>(&self, handler: H) -> HandlerId {
        let id = self.allocate_id();
        let name = handler.name().to_string();
        self.handlers.write().insert(id, (name, Arc::new(handler)));
        id
    }

    pub fn subscribe_to(&self, kind: EventKind, callback: EventCallback) -> HandlerId {
        let id = self.allocate_id();
        self.callbacks
            .write()
            .entry(kind)
            .or_default()
            .push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: HandlerId) {
        if let Some((name, _)) = self.handlers.write().remove(&id) {
            tracing::debug!(handler = %name, "event handler removed");
            return;
        }
        for callbacks in self.callbacks.write().values_mut() {
            callbacks.retain(|(cb_id, _)| *cb_id != id);
        }
    }

    pub fn publish(&self, event: ComponentEvent) {
        for (_, handler) in self.handlers.read().values() {
            handler.handle(&event);
        }

        if let Some(callbacks) = self.callbacks.read().get(&event.kind()) {
            for (_, callback) in callbacks {
                callback(&event);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirrors component events into `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ComponentEvent) {
        match event {
            ComponentEvent::TokenGenerated { session, text } => {
                tracing::trace!(session, ?text, "token")
            }
            ComponentEvent::GenerationFailed { session, error } => {
                tracing::warn!(session, %error, "generation failed")
            }
            other => tracing::info!("Event: {:?}", other),
        }
    }

    fn name(&self) -> &str {
        "logging"
    }
}
