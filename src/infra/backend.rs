use candle_core::Device;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

static BACKEND: Lazy<Mutex<Weak<Backend>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// Process-wide compute backend, initialized when the first model loads and
/// torn down after the last one is dropped.
#[derive(Debug)]
pub struct Backend {
    device: Device,
}

impl Backend {
    fn init() -> Self {
        let device = if candle_core::utils::cuda_is_available() {
            Device::new_cuda(0).unwrap_or(Device::Cpu)
        } else {
            Device::Cpu
        };
        tracing::info!(?device, "compute backend initialized");
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        tracing::info!("compute backend released");
    }
}

/// Keeps the shared backend alive. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct BackendHandle(Arc<Backend>);

impl BackendHandle {
    pub fn acquire() -> Self {
        let mut slot = BACKEND.lock();
        if let Some(backend) = slot.upgrade() {
            return Self(backend);
        }
        let backend = Arc::new(Backend::init());
        *slot = Arc::downgrade(&backend);
        Self(backend)
    }

    pub fn device(&self) -> &Device {
        self.0.device()
    }

    /// Number of live handles, across all models.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

pub fn is_initialized() -> bool {
    BACKEND.lock().strong_count() > 0
}
