//! Repository webhook payloads.
//!
//! GitLab system/project hooks are the primary format (`event_name` or
//! `object_kind`, `project.path_with_namespace`, `ref`, `after`). GitHub-style
//! push payloads (`repository.full_name`, `deleted`) are understood as well.

use serde::Deserialize;
use serde_json::Value;

use super::RouterError;
use crate::instance::InstanceKey;

/// A validated repository event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryEvent {
    /// New commits on a ref: (re)start its instance.
    Update {
        key: InstanceKey,
        commit: Option<String>,
    },
    /// The ref was deleted: stop and remove its instance.
    RefDeleted { key: InstanceKey },
    /// The repository is gone: stop and remove all of its instances.
    RepositoryDeleted { repository: String },
}

#[derive(Debug, Default, Deserialize)]
struct HookProject {
    path_with_namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HookRepository {
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HookPayload {
    event_name: Option<String>,
    object_kind: Option<String>,
    project_id: Option<Value>,
    path_with_namespace: Option<String>,
    path: Option<String>,
    project: Option<HookProject>,
    repository: Option<HookRepository>,
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    after: Option<String>,
    #[serde(default)]
    deleted: bool,
}

/// A parsed webhook.
#[derive(Debug, Clone)]
pub struct Hook {
    /// Event kind as sent, e.g. `push`.
    pub kind: String,
    pub project_id: Option<String>,
    pub repository: Option<String>,
    /// `None` for events that don't concern hosted instances.
    pub event: Option<RepositoryEvent>,
}

impl Hook {
    /// Whether the project id or repository path is on the ignore list.
    pub fn is_ignored(&self, ignore: &[String]) -> bool {
        ignore.iter().any(|entry| {
            self.project_id.as_deref() == Some(entry.as_str())
                || self.repository.as_deref() == Some(entry.as_str())
        })
    }
}

fn is_zero_sha(sha: &str) -> bool {
    !sha.is_empty() && sha.chars().all(|c| c == '0')
}

/// Parse a raw webhook body.
pub fn parse_hook(body: &[u8]) -> Result<Hook, RouterError> {
    let payload: HookPayload =
        serde_json::from_slice(body).map_err(|e| RouterError::BadPayload(e.to_string()))?;

    let project_id = payload.project_id.as_ref().and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    let repository = payload
        .project
        .and_then(|p| p.path_with_namespace)
        .or(payload.path_with_namespace)
        .or(payload.repository.and_then(|r| r.full_name))
        .or(payload.path);

    let kind = payload
        .event_name
        .or(payload.object_kind)
        .unwrap_or_else(|| {
            if payload.git_ref.is_some() {
                "push".to_string()
            } else {
                "unknown".to_string()
            }
        });

    let event = match kind.as_str() {
        "push" | "tag_push" => {
            let repository = repository
                .clone()
                .ok_or_else(|| RouterError::BadPayload("missing repository".to_string()))?;
            let git_ref = payload
                .git_ref
                .ok_or_else(|| RouterError::BadPayload("missing ref".to_string()))?;
            let key = InstanceKey::new(&repository, &git_ref)?;

            let deleted = payload.deleted || payload.after.as_deref().is_some_and(is_zero_sha);
            if deleted {
                Some(RepositoryEvent::RefDeleted { key })
            } else {
                Some(RepositoryEvent::Update {
                    key,
                    commit: payload.after,
                })
            }
        }
        "project_destroy" | "repository_destroy" => {
            let repository = repository
                .clone()
                .ok_or_else(|| RouterError::BadPayload("missing repository".to_string()))?;
            Some(RepositoryEvent::RepositoryDeleted { repository })
        }
        _ => None,
    };

    Ok(Hook {
        kind,
        project_id,
        repository,
        event,
    })
}
