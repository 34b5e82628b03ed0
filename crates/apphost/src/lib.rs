//! Apphost Library
//!
//! Supervises git-backed script applications: one child process per
//! repository ref, each bound to a port leased from a shared pool, restarted
//! when the repository is updated.

pub mod api;
pub mod auth;
pub mod checkout;
pub mod error;
pub mod instance;
pub mod router;
pub mod status;
pub mod supervisor;

pub use error::{HostError, HostResult};
pub use instance::{Instance, InstanceKey, InstanceState, Lifecycle, Registry};
pub use router::EventRouter;
pub use status::StatusService;
