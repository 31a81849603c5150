use crate::app::runner::{CancelToken, GenerationParams, Session, StreamEvent};
use crate::core::{InferenceContext, InferenceError, Model, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

pub type SessionId = u64;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// unique across executors, so a reloaded model never reuses an id
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Set once the worker body has returned or unwound.
#[derive(Default)]
struct FinishSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl FinishSignal {
    fn notify(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

struct FinishGuard(Arc<FinishSignal>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.notify();
    }
}

struct Worker {
    handle: JoinHandle<Box<dyn InferenceContext>>,
    finished: Arc<FinishSignal>,
}

struct ActiveSession {
    id: SessionId,
    cancel: CancelToken,
    events: UnboundedReceiver<StreamEvent>,
    worker: Worker,
}

/// Runs one generation session at a time on a dedicated thread and hands its
/// events back to the owning thread.
///
/// The idle context lives here between sessions and moves into the worker for
/// the duration of a run. Events of a session are only reachable through its
/// own channel, so nothing from a discarded session can surface later.
pub struct Executor {
    context: Option<Box<dyn InferenceContext>>,
    active: Option<ActiveSession>,
    join_timeout: Duration,
}

impl Executor {
    pub fn new(context: Box<dyn InferenceContext>, join_timeout: Duration) -> Self {
        Self {
            context: Some(context),
            active: None,
            join_timeout,
        }
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Idle context present; false while a session runs or after one was
    /// forfeited.
    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// Installs a fresh idle context, replacing a forfeited one.
    pub fn attach(&mut self, context: Box<dyn InferenceContext>) {
        if self.context.replace(context).is_some() {
            tracing::debug!("replaced idle inference context");
        }
    }

    pub fn submit(
        &mut self,
        model: Arc<dyn Model>,
        prompt: impl Into<String>,
        params: GenerationParams,
    ) -> Result<SessionId> {
        if self.active.is_some() {
            return Err(InferenceError::AlreadyRunning);
        }
        let context = self
            .context
            .take()
            .ok_or(InferenceError::ContextUnavailable)?;

        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);

        let prompt = prompt.into();
        let cancel = CancelToken::new();
        let (tx, events) = mpsc::unbounded_channel();
        let finished = Arc::new(FinishSignal::default());

        let worker_cancel = cancel.clone();
        let guard = FinishGuard(finished.clone());
        let handle = thread::Builder::new()
            .name(format!("llama-session-{id}"))
            .spawn(move || {
                let _guard = guard;
                run_worker(model, context, &prompt, params, worker_cancel, tx)
            })
            .map_err(|e| {
                tracing::error!(
                    session = id,
                    error = %e,
                    "failed to spawn worker, context dropped"
                );
                InferenceError::WorkerSpawn(e.to_string())
            })?;

        tracing::info!(session = id, "generation started");
        self.active = Some(ActiveSession {
            id,
            cancel,
            events,
            worker: Worker { handle, finished },
        });
        Ok(id)
    }

    /// Idempotent; no-op without an active session.
    pub fn cancel(&self) {
        if let Some(active) = &self.active {
            tracing::debug!(session = active.id, "cancellation requested");
            active.cancel.cancel();
        }
    }

    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.active.as_ref().map(|a| a.cancel.clone())
    }

    /// Drains whatever the active session produced so far without blocking.
    pub fn pump(&mut self) -> Vec<(SessionId, StreamEvent)> {
        std::iter::from_fn(|| self.next_event(false)).collect()
    }

    /// Blocks until the active session delivers its terminal event, handing
    /// every event to `on_event` as it arrives. Must not be called from
    /// inside an async runtime.
    pub fn wait_with<F>(&mut self, mut on_event: F)
    where
        F: FnMut(SessionId, StreamEvent),
    {
        while let Some((id, event)) = self.next_event(true) {
            on_event(id, event);
        }
    }

    pub fn wait(&mut self) -> Vec<(SessionId, StreamEvent)> {
        let mut events = Vec::new();
        self.wait_with(|id, event| events.push((id, event)));
        events
    }

    fn next_event(&mut self, block: bool) -> Option<(SessionId, StreamEvent)> {
        let active = self.active.as_mut()?;
        let id = active.id;

        let received = if block {
            active.events.blocking_recv().ok_or(TryRecvError::Disconnected)
        } else {
            active.events.try_recv()
        };
        let event = match received {
            Ok(event) => event,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => {
                tracing::error!(session = id, "worker exited without a terminal event");
                StreamEvent::Failed(InferenceError::WorkerLost)
            }
        };

        // the context is back in place before the owner sees the outcome
        if event.is_terminal() {
            self.reap();
        }
        Some((id, event))
    }

    fn reap(&mut self) {
        if let Some(active) = self.active.take() {
            let ActiveSession { id, worker, .. } = active;
            self.context = self.join(id, worker);
        }
    }

    fn join(&self, id: SessionId, worker: Worker) -> Option<Box<dyn InferenceContext>> {
        let deadline = Instant::now() + self.join_timeout;
        if !worker.finished.wait_until(deadline) {
            tracing::warn!(
                session = id,
                timeout = ?self.join_timeout,
                "worker did not stop in time, detaching it and forfeiting its context"
            );
            return None;
        }

        match worker.handle.join() {
            Ok(context) => {
                tracing::debug!(session = id, "worker joined");
                Some(context)
            }
            Err(payload) => {
                tracing::error!(
                    session = id,
                    reason = %panic_message(payload.as_ref()),
                    "worker died outside the session guard"
                );
                None
            }
        }
    }

    /// Cancels and discards the active session, waiting at most the join
    /// timeout. Returns false when the worker had to be detached.
    pub fn shutdown(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return true;
        };
        let ActiveSession {
            id,
            cancel,
            events,
            worker,
        } = active;

        cancel.cancel();
        drop(events);
        tracing::info!(session = id, "shutting down active session");

        match self.join(id, worker) {
            Some(context) => {
                self.context = Some(context);
                true
            }
            None => false,
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    model: Arc<dyn Model>,
    mut context: Box<dyn InferenceContext>,
    prompt: &str,
    params: GenerationParams,
    cancel: CancelToken,
    tx: UnboundedSender<StreamEvent>,
) -> Box<dyn InferenceContext> {
    let terminal_sent = Cell::new(false);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let emit = |event: StreamEvent| {
            if event.is_terminal() {
                terminal_sent.set(true);
            }
            // the receiver is gone once the session was discarded
            let _ = tx.send(event);
        };
        Session::new(model.as_ref(), context.as_mut(), params, cancel).run(prompt, emit)
    }));

    if let Err(payload) = outcome {
        let message = panic_message(payload.as_ref());
        tracing::error!(reason = %message, "generation panicked");
        context.clear();
        if !terminal_sent.get() {
            let _ = tx.send(StreamEvent::Failed(InferenceError::WorkerPanicked(message)));
        }
    }
    context
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
