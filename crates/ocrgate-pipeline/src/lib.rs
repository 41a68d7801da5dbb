pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod guard;
pub mod lifecycle;
pub mod registry;
pub mod retry;
pub mod telemetry;

pub use backend::{loader_fn, Backend, BackendLoader, FrameContext};
pub use config::{GatewayConfig, GuardConfig};
pub use dispatcher::{Dispatcher, HealthReport, HealthStatus};
pub use guard::{AcceleratorGuard, ExecutionPermit, GuardSnapshot, QueueSlot, RecognitionRequest};
pub use lifecycle::{PhaseCounters, PhaseSnapshot, RequestLifecycle, RequestState};
pub use registry::{BackendDescriptor, BackendRegistry, BackendState, BackendStatus, CatalogEntry};
pub use retry::{DegradePolicy, RetryState, RetryStep};
pub use telemetry::{GuardTelemetry, TelemetrySnapshot};
