//! Instance data model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};
use crate::supervisor::{PortLease, ProcessHandle};

/// Repository plus ref identifying one logical instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    repository: String,
    git_ref: String,
}

impl InstanceKey {
    /// Build a key, normalising `refs/heads/` and `refs/tags/` prefixes.
    pub fn new(repository: impl AsRef<str>, git_ref: impl AsRef<str>) -> HostResult<Self> {
        let repository = repository.as_ref().trim().trim_matches('/');
        let git_ref = git_ref.as_ref().trim();
        let git_ref = git_ref
            .strip_prefix("refs/heads/")
            .or_else(|| git_ref.strip_prefix("refs/tags/"))
            .unwrap_or(git_ref);

        validate_part("repository", repository)?;
        validate_part("ref", git_ref)?;

        Ok(Self {
            repository: repository.to_string(),
            git_ref: git_ref.to_string(),
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn git_ref(&self) -> &str {
        &self.git_ref
    }

    /// Filesystem-safe name, used for log files. Distinct keys get distinct slugs:
    /// `/` becomes `_` and every other byte outside `[A-Za-z0-9.-]` is written as `%XX`.
    pub fn slug(&self) -> String {
        let clean = |s: &str| -> String {
            let mut out = String::with_capacity(s.len());
            for b in s.bytes() {
                match b {
                    b'/' => out.push('_'),
                    b if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' => out.push(b as char),
                    b => out.push_str(&format!("%{:02X}", b)),
                }
            }
            out
        };
        format!("{}@{}", clean(&self.repository), clean(&self.git_ref))
    }

    /// Name of the instance log file.
    pub fn log_file_name(&self) -> String {
        format!("{}.log", self.slug())
    }
}

fn validate_part(what: &str, value: &str) -> HostResult<()> {
    if value.is_empty() {
        return Err(HostError::InvalidKey(format!("{} must not be empty", what)));
    }
    if value.contains('\0') {
        return Err(HostError::InvalidKey(format!("{} contains a NUL byte", what)));
    }
    if value.starts_with('/') {
        return Err(HostError::InvalidKey(format!(
            "{} must be a relative name: {}",
            what, value
        )));
    }
    if value.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(HostError::InvalidKey(format!(
            "{} has an invalid path segment: {}",
            what, value
        )));
    }
    Ok(())
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.git_ref)
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One registry record.
#[derive(Debug, Clone)]
pub struct Instance {
    pub key: InstanceKey,
    pub state: InstanceState,
    pub port: Option<PortLease>,
    pub process: Option<ProcessHandle>,
    /// Id of the current start-to-stop lifetime; 0 until the first start.
    pub generation: u64,
    /// A stop arrived while the start was in flight.
    pub stop_pending: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            state: InstanceState::Pending,
            port: None,
            process: None,
            generation: 0,
            stop_pending: false,
            started_at: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Created but never started.
    pub fn is_idle(&self) -> bool {
        self.state == InstanceState::Pending && self.generation == 0
    }

    /// A start or stop is in progress.
    pub fn in_flight(&self) -> bool {
        match self.state {
            InstanceState::Pending => self.generation > 0,
            InstanceState::Starting | InstanceState::Stopping => true,
            _ => false,
        }
    }

    /// Seconds since the current generation started running.
    pub fn uptime_secs(&self) -> Option<i64> {
        if self.state != InstanceState::Running {
            return None;
        }
        self.started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0))
    }
}

/// Inputs to the per-key state machine.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    RequestStart,
    PortLeased { generation: u64, lease: PortLease },
    SpawnSucceeded { generation: u64, handle: ProcessHandle },
    SpawnFailed { generation: u64, reason: String },
    ExternalCrash { generation: u64, reason: String },
    RequestStop,
    StopConfirmed { generation: u64 },
}

impl InstanceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InstanceEvent::RequestStart => "request-start",
            InstanceEvent::PortLeased { .. } => "port-leased",
            InstanceEvent::SpawnSucceeded { .. } => "spawn-succeeded",
            InstanceEvent::SpawnFailed { .. } => "spawn-failed",
            InstanceEvent::ExternalCrash { .. } => "external-crash",
            InstanceEvent::RequestStop => "request-stop",
            InstanceEvent::StopConfirmed { .. } => "stop-confirmed",
        }
    }

    /// Generation the event belongs to, for events raised by an in-flight cycle.
    pub fn generation(&self) -> Option<u64> {
        match self {
            InstanceEvent::PortLeased { generation, .. }
            | InstanceEvent::SpawnSucceeded { generation, .. }
            | InstanceEvent::SpawnFailed { generation, .. }
            | InstanceEvent::ExternalCrash { generation, .. }
            | InstanceEvent::StopConfirmed { generation } => Some(*generation),
            InstanceEvent::RequestStart | InstanceEvent::RequestStop => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalisation() {
        let key = InstanceKey::new(" group/demo/ ", "refs/heads/feature/x").unwrap();
        assert_eq!(key.repository(), "group/demo");
        assert_eq!(key.git_ref(), "feature/x");
        assert_eq!(key.to_string(), "group/demo@feature/x");
        assert_eq!(key.slug(), "group_demo@feature_x");

        let tag = InstanceKey::new("demo", "refs/tags/v1.2").unwrap();
        assert_eq!(tag.git_ref(), "v1.2");
    }

    #[test]
    fn test_slug_does_not_collide() {
        let nested = InstanceKey::new("group/demo", "main").unwrap();
        let flat = InstanceKey::new("group_demo", "main").unwrap();
        assert_eq!(nested.slug(), "group_demo@main");
        assert_eq!(flat.slug(), "group%5Fdemo@main");
        assert_ne!(nested.log_file_name(), flat.log_file_name());

        let at_in_repo = InstanceKey::new("a@b", "c").unwrap();
        let at_in_ref = InstanceKey::new("a", "b@c").unwrap();
        assert_ne!(at_in_repo.slug(), at_in_ref.slug());
    }

    #[test]
    fn test_key_rejects_bad_parts() {
        for (repo, r) in [
            ("", "main"),
            ("demo", ""),
            ("demo", "   "),
            ("../etc", "main"),
            ("demo", "a/../b"),
            ("demo", "/abs"),
            ("de\0mo", "main"),
            ("a//b", "main"),
        ] {
            assert!(
                matches!(InstanceKey::new(repo, r), Err(HostError::InvalidKey(_))),
                "{repo:?} {r:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_new_instance_is_idle() {
        let instance = Instance::new(InstanceKey::new("demo", "main").unwrap());
        assert!(instance.is_idle());
        assert!(!instance.in_flight());
        assert_eq!(instance.uptime_secs(), None);
        assert_eq!(instance.state.to_string(), "pending");
    }
}
