use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use ocrgate_core::{InputKind, OcrError, Result};
use ocrgate_device::DeviceContext;

use crate::backend::{panic_message, Backend, BackendLoader};

/// Load state of a registered backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// Registered, never loaded.
    Unregistered,
    Loading,
    Ready,
    /// Load failed. Permanent for the life of the process.
    Failed,
    /// Was ready; `unload()` has run and the instance is retired.
    Unloaded,
}

/// Name/state pair for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub state: BackendState,
    pub kinds: Vec<InputKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One named backend and its lazily-constructed instance.
pub struct BackendDescriptor {
    name: String,
    kinds: Vec<InputKind>,
    loader: Box<dyn BackendLoader>,
    state: Mutex<BackendState>,
    instance: OnceLock<std::result::Result<Arc<dyn Backend>, String>>,
    unloaded: AtomicBool,
}

impl BackendDescriptor {
    fn new(name: String, loader: Box<dyn BackendLoader>) -> Self {
        Self {
            kinds: loader.supported_kinds().to_vec(),
            name,
            loader,
            state: Mutex::new(BackendState::Unregistered),
            instance: OnceLock::new(),
            unloaded: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kinds(&self) -> &[InputKind] {
        &self.kinds
    }

    pub fn supports(&self, kind: InputKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock()
    }

    /// The loaded instance, if the backend is ready. Never blocks on a load.
    pub fn instance(&self) -> Option<Arc<dyn Backend>> {
        match self.instance.get() {
            Some(Ok(backend)) => Some(backend.clone()),
            _ => None,
        }
    }

    /// Outcome of the load, if it has happened. Never blocks on a load.
    pub fn resolved(&self) -> Option<Result<Arc<dyn Backend>>> {
        self.instance.get().map(|outcome| self.outcome(outcome))
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Load reason for a failed backend.
    pub fn error(&self) -> Option<String> {
        match self.instance.get() {
            Some(Err(reason)) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Return the instance, loading it on first call.
    ///
    /// Concurrent callers block on the single in-progress load. A failed
    /// load is remembered; later calls fail with `BackendLoad` without
    /// invoking the loader again.
    pub fn resolve(&self, device: &DeviceContext) -> Result<Arc<dyn Backend>> {
        let outcome = self.instance.get_or_init(|| self.load(device));
        {
            let mut state = self.state.lock();
            if matches!(*state, BackendState::Unregistered | BackendState::Loading) {
                *state = if outcome.is_ok() {
                    BackendState::Ready
                } else {
                    BackendState::Failed
                };
            }
        }
        self.outcome(outcome)
    }

    fn outcome(
        &self,
        outcome: &std::result::Result<Arc<dyn Backend>, String>,
    ) -> Result<Arc<dyn Backend>> {
        if self.is_unloaded() {
            return Err(OcrError::Internal(format!("backend '{}' is unloaded", self.name)));
        }
        outcome.clone().map_err(|reason| OcrError::BackendLoad {
            name: self.name.clone(),
            reason,
        })
    }

    fn load(&self, device: &DeviceContext) -> std::result::Result<Arc<dyn Backend>, String> {
        *self.state.lock() = BackendState::Loading;
        tracing::info!(backend = %self.name, "loading backend");
        let start = Instant::now();

        let loaded = match catch_unwind(AssertUnwindSafe(|| self.loader.load(device))) {
            Ok(Ok(backend)) => Ok(backend),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("loader panicked: {}", panic_message(&*panic))),
        };

        match &loaded {
            Ok(_) => {
                tracing::info!(
                    backend = %self.name,
                    load_ms = start.elapsed().as_secs_f32() * 1000.0,
                    occupancy = device.occupancy(),
                    "backend ready"
                );
            }
            Err(reason) => {
                tracing::warn!(backend = %self.name, reason = %reason, "backend failed to load");
            }
        }
        loaded
    }

    /// Call `unload()` on a ready backend. Returns false if the backend was
    /// never loaded or has already been unloaded.
    fn unload(&self) -> bool {
        let Some(backend) = self.instance() else {
            return false;
        };
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.lock() = BackendState::Unloaded;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| backend.unload())) {
            tracing::warn!(
                backend = %self.name,
                reason = %panic_message(&*panic),
                "backend panicked during unload"
            );
        }
        tracing::info!(backend = %self.name, "backend unloaded");
        true
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            name: self.name.clone(),
            state: self.state(),
            kinds: self.kinds.clone(),
            error: self.error(),
        }
    }
}

/// Named entry in the built-in backend catalog.
pub struct CatalogEntry {
    pub name: String,
    pub loader: Box<dyn BackendLoader>,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>, loader: impl BackendLoader + 'static) -> Self {
        Self {
            name: name.into(),
            loader: Box::new(loader),
        }
    }
}

/// Registry of named, lazily-loaded backends sharing one device.
pub struct BackendRegistry {
    device: Arc<DeviceContext>,
    descriptors: Vec<Arc<BackendDescriptor>>,
    index: HashMap<String, usize>,
}

impl BackendRegistry {
    pub fn new(device: Arc<DeviceContext>) -> Self {
        Self {
            device,
            descriptors: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register the `enabled` subset of `catalog`, in `enabled` order.
    pub fn from_catalog(
        device: Arc<DeviceContext>,
        catalog: Vec<CatalogEntry>,
        enabled: &[String],
    ) -> Result<Self> {
        let available: Vec<String> = catalog.iter().map(|e| e.name.clone()).collect();
        let mut entries: HashMap<String, Box<dyn BackendLoader>> =
            catalog.into_iter().map(|e| (e.name, e.loader)).collect();

        let mut registry = Self::new(device);
        for name in enabled {
            if registry.contains(name) {
                return Err(OcrError::DuplicateName(name.clone()));
            }
            let loader = entries.remove(name).ok_or_else(|| {
                OcrError::Config(format!(
                    "unknown backend '{name}' in enabled_backends (available: {})",
                    available.join(", ")
                ))
            })?;
            registry.register(name.clone(), loader)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, loader: impl BackendLoader + 'static) -> Result<()> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(OcrError::DuplicateName(name));
        }
        let descriptor = BackendDescriptor::new(name.clone(), Box::new(loader));
        tracing::debug!(backend = %name, kinds = ?descriptor.kinds(), "backend registered");
        self.index.insert(name, self.descriptors.len());
        self.descriptors.push(Arc::new(descriptor));
        Ok(())
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Look up a descriptor without loading it.
    pub fn descriptor(&self, name: &str) -> Result<&Arc<BackendDescriptor>> {
        self.index
            .get(name)
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| OcrError::NotFound(name.to_string()))
    }

    pub fn descriptors(&self) -> &[Arc<BackendDescriptor>] {
        &self.descriptors
    }

    /// Resolve `name` to a loaded backend, loading it on first use.
    ///
    /// Unknown names fail with `NotFound` before anything blocks.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.descriptor(name)?.resolve(&self.device)
    }

    /// Registered backends in registration order.
    pub fn list(&self) -> Vec<BackendStatus> {
        self.descriptors.iter().map(|d| d.status()).collect()
    }

    /// Unload every ready backend once. Returns how many were unloaded.
    pub fn unload_all(&self) -> usize {
        self.descriptors.iter().filter(|d| d.unload()).count()
    }
}
