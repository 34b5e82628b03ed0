//! Instance model, registry and the lifecycle driver on top of them.

pub mod lifecycle;
pub mod models;
pub mod registry;

pub use lifecycle::{Lifecycle, LifecycleConfig};
pub use models::{Instance, InstanceEvent, InstanceKey, InstanceState};
pub use registry::{Registry, TransitionOutcome};
