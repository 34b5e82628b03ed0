//! Port leasing, child process supervision and per-instance logs.

pub mod launch;
pub mod logs;
pub mod ports;
pub mod process;

pub use launch::LaunchConfig;
pub use logs::{DEFAULT_TAIL_LIMIT, LogSink, read_tail};
pub use ports::{PortLease, PortPool, PortRange};
pub use process::{
    ExitReport, Health, ProcessHandle, ProcessSupervisor, SpawnSpec, SupervisorConfig,
};
