//! Read-only views of the registry for status APIs.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::HostResult;
use crate::instance::{Instance, InstanceKey, InstanceState, Registry};
use crate::supervisor::read_tail;

/// External-facing shape of an instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub key: String,
    pub repository: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stop_pending: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&Instance> for InstanceView {
    fn from(instance: &Instance) -> Self {
        Self {
            key: instance.key.to_string(),
            repository: instance.key.repository().to_string(),
            git_ref: instance.key.git_ref().to_string(),
            state: instance.state,
            port: instance.port.map(|l| l.port()),
            pid: instance.process.as_ref().map(|p| p.pid()),
            generation: instance.generation,
            started_at: instance.started_at,
            uptime_secs: instance.uptime_secs(),
            last_error: instance.last_error.clone(),
            stop_pending: instance.stop_pending,
            updated_at: instance.updated_at,
        }
    }
}

impl From<Instance> for InstanceView {
    fn from(instance: Instance) -> Self {
        Self::from(&instance)
    }
}

/// Snapshot queries over the registry. Never mutates.
#[derive(Debug, Clone)]
pub struct StatusService {
    registry: Arc<Registry>,
    logs_dir: PathBuf,
}

impl StatusService {
    pub fn new(registry: Arc<Registry>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            logs_dir: logs_dir.into(),
        }
    }

    pub fn list(&self) -> Vec<InstanceView> {
        self.registry.list().iter().map(InstanceView::from).collect()
    }

    pub fn get(&self, key: &InstanceKey) -> HostResult<InstanceView> {
        self.registry.get(key).map(InstanceView::from)
    }

    /// Last `limit` log lines of a known instance.
    pub async fn logs(&self, key: &InstanceKey, limit: usize) -> HostResult<Vec<String>> {
        self.registry.get(key)?;
        let path = self.logs_dir.join(key.log_file_name());
        Ok(read_tail(&path, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use crate::instance::InstanceEvent;

    #[tokio::test]
    async fn test_views_reflect_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let status = StatusService::new(Arc::clone(&registry), dir.path());

        let key = InstanceKey::new("group/demo", "main").unwrap();
        registry.ensure(&key);
        registry.transition(&key, InstanceEvent::RequestStart).unwrap();

        let view = status.get(&key).unwrap();
        assert_eq!(view.key, "group/demo@main");
        assert_eq!(view.state, InstanceState::Pending);
        assert_eq!(view.generation, 1);
        assert!(view.port.is_none());

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["ref"], "main");
        assert!(json.get("port").is_none());

        assert_eq!(status.list().len(), 1);
        assert!(status.logs(&key, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusService::new(Arc::new(Registry::new()), dir.path());
        let key = InstanceKey::new("demo", "main").unwrap();

        assert!(matches!(status.get(&key), Err(HostError::NotFound(_))));
        assert!(matches!(status.logs(&key, 10).await, Err(HostError::NotFound(_))));
    }
}
