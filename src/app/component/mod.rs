use crate::app::events::{ComponentEvent, EventBus, EventHandler, EventKind, HandlerId};
use crate::app::executor::{Executor, SessionId};
use crate::app::runner::{CancelToken, Response, StreamEvent};
use crate::core::{ContextParams, InferenceError, Model, ModelLoader, ModelMeta, Result};
use crate::envconfig::ComponentConfig;
use crate::infra::{backend, GgufLoader};
use std::path::Path;
use std::sync::Arc;

struct LoadedModel {
    path: String,
    // dropped before `model`
    executor: Executor,
    model: Arc<dyn Model>,
    context_params: ContextParams,
}

/// Load / generate / unload facade over one model and one generation at a
/// time. Callbacks registered here run on the thread that calls
/// [`pump`](Self::pump) or [`wait_for_response`](Self::wait_for_response).
pub struct InferenceComponent {
    config: ComponentConfig,
    loader: Arc<dyn ModelLoader>,
    events: EventBus,
    loaded: Option<LoadedModel>,
}

impl InferenceComponent {
    pub fn new(config: ComponentConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            config,
            loader,
            events: EventBus::new(),
            loaded: None,
        }
    }

    pub fn with_gguf(config: ComponentConfig) -> Self {
        Self::new(config, Arc::new(GgufLoader::new()))
    }

    pub fn config(&self) -> &ComponentConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_model_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn model_meta(&self) -> Option<&ModelMeta> {
        self.loaded.as_ref().map(|l| l.model.meta())
    }

    pub fn is_generating(&self) -> bool {
        self.loaded.as_ref().is_some_and(|l| l.executor.is_busy())
    }

    pub fn load_model_default(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let context_size = self.config.context_size;
        self.load_model(path, context_size)
    }

    pub fn load_model(&mut self, path: impl AsRef<Path>, context_size: usize) -> Result<()> {
        let path = path.as_ref();
        let shown = path.display().to_string();

        if let Some(loaded) = &self.loaded {
            tracing::warn!(
                path = %shown,
                loaded = %loaded.path,
                "model already loaded, unload it first"
            );
            return Err(InferenceError::ModelAlreadyLoaded);
        }

        let model = self.loader.load(path).map_err(|e| match e {
            InferenceError::ModelLoad { .. } => e,
            other => InferenceError::model_load(&shown, other),
        })?;

        let context_params = ContextParams {
            n_ctx: context_size,
            n_threads: self.config.thread_count,
        };
        let context = model
            .new_context(&context_params)
            .map_err(|e| InferenceError::model_load(&shown, e))?;

        let name = model.meta().name.clone();
        tracing::info!(
            path = %shown,
            name = %name,
            n_ctx = context_params.n_ctx,
            n_threads = context_params.n_threads,
            "model ready"
        );

        self.loaded = Some(LoadedModel {
            path: shown.clone(),
            executor: Executor::new(context, self.config.join_timeout()),
            model,
            context_params,
        });
        self.events
            .publish(ComponentEvent::ModelLoaded { path: shown, name });
        Ok(())
    }

    /// Starts a generation in the background. Results arrive through the
    /// event callbacks once the owner pumps.
    pub fn generate_response(&mut self, prompt: &str) -> Result<SessionId> {
        let Some(loaded) = self.loaded.as_mut() else {
            tracing::warn!("generate requested without a loaded model");
            return Err(InferenceError::ModelNotLoaded);
        };
        if loaded.executor.is_busy() {
            tracing::warn!(
                session = ?loaded.executor.active_session(),
                "generate requested while a generation is running"
            );
            return Err(InferenceError::AlreadyRunning);
        }

        if !loaded.executor.has_context() {
            tracing::info!("previous context was forfeited, creating a new one");
            let context = loaded.model.new_context(&loaded.context_params)?;
            loaded.executor.attach(context);
        }

        let session = loaded.executor.submit(
            Arc::clone(&loaded.model),
            prompt,
            self.config.generation_params(),
        )?;
        self.events.publish(ComponentEvent::InferenceStarted {
            session,
            prompt_len: prompt.len(),
        });
        Ok(session)
    }

    /// Delivers pending events to subscribers. Returns how many were
    /// delivered.
    pub fn pump(&mut self) -> usize {
        let Some(loaded) = self.loaded.as_mut() else {
            return 0;
        };
        let events = loaded.executor.pump();
        let delivered = events.len();
        for (session, event) in events {
            publish_stream_event(&self.events, session, event);
        }
        delivered
    }

    /// Blocks until the running generation ends, delivering its events along
    /// the way. `None` when nothing was running.
    pub fn wait_for_response(&mut self) -> Option<Result<Response>> {
        let loaded = self.loaded.as_mut()?;
        let bus = &self.events;
        let mut outcome = None;
        loaded.executor.wait_with(|session, event| {
            if let Some(result) = publish_stream_event(bus, session, event) {
                outcome = Some(result);
            }
        });
        outcome
    }

    /// Stop handle for the running generation, usable from any thread.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.loaded.as_ref()?.executor.cancel_token()
    }

    /// Idempotent; no-op when idle.
    pub fn cancel(&self) {
        if let Some(loaded) = &self.loaded {
            loaded.executor.cancel();
        }
    }

    /// Cancels any running generation, waits a bounded time for it, then
    /// releases the context and the model. Idempotent.
    pub fn unload_model(&mut self) {
        let Some(mut loaded) = self.loaded.take() else {
            return;
        };

        if !loaded.executor.shutdown() {
            tracing::warn!(path = %loaded.path, "unloading with a detached worker still running");
        }
        let LoadedModel {
            path,
            executor,
            model,
            ..
        } = loaded;
        drop(executor);
        drop(model);

        tracing::info!(path = %path, backend_live = backend::is_initialized(), "model unloaded");
        self.events.publish(ComponentEvent::ModelUnloaded { path });
    }

    pub fn subscribe<H: EventHandler + 'static>(&self, handler: H) -> HandlerId {
        self.events.subscribe(handler)
    }

    /// Removes a handler or callback registered through this component.
    pub fn unsubscribe(&self, id: HandlerId) {
        self.events.unsubscribe(id);
    }

    pub fn on_token_generated<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.subscribe_to(
            EventKind::TokenGenerated,
            Box::new(move |event| {
                if let ComponentEvent::TokenGenerated { text, .. } = event {
                    callback(text);
                }
            }),
        )
    }

    pub fn on_response_received<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.events.subscribe_to(
            EventKind::ResponseReceived,
            Box::new(move |event| {
                if let ComponentEvent::ResponseReceived { response, .. } = event {
                    callback(response);
                }
            }),
        )
    }

    pub fn on_generation_failed<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&InferenceError) + Send + Sync + 'static,
    {
        self.events.subscribe_to(
            EventKind::GenerationFailed,
            Box::new(move |event| {
                if let ComponentEvent::GenerationFailed { error, .. } = event {
                    callback(error);
                }
            }),
        )
    }
}

impl Drop for InferenceComponent {
    fn drop(&mut self) {
        self.unload_model();
    }
}

/// Publishes one stream event; returns the outcome for terminal events.
fn publish_stream_event(
    bus: &EventBus,
    session: SessionId,
    event: StreamEvent,
) -> Option<Result<Response>> {
    match event {
        StreamEvent::TokenProduced(text) => {
            bus.publish(ComponentEvent::TokenGenerated { session, text });
            None
        }
        StreamEvent::Completed(response) => {
            bus.publish(ComponentEvent::ResponseReceived {
                session,
                response: response.clone(),
            });
            Some(Ok(response))
        }
        StreamEvent::Failed(error) => {
            bus.publish(ComponentEvent::GenerationFailed {
                session,
                error: error.clone(),
            });
            Some(Err(error))
        }
    }
}
