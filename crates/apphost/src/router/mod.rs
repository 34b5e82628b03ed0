//! Event router: authenticated lifecycle requests and signed repository events.
//!
//! Nothing reaches the registry before the token or webhook signature has been
//! checked. Repository events are debounced per key: a burst of events yields at
//! most one pending cycle, and an event arriving while a cycle runs is held so
//! exactly one more cycle follows. Updates and deletions share that slot, so the
//! last accepted event for a key decides what the next cycle does.

mod events;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use events::{Hook, RepositoryEvent, parse_hook};

use crate::auth::{
    AuthError, AuthState, Claims, MANAGE_INSTANCE, SharedSecretVerifier, WebhookSignature,
};
use crate::error::HostError;
use crate::instance::{Instance, InstanceKey, InstanceState, Lifecycle};

/// Validates lifecycle request tokens.
pub trait TokenVerifier: Send + Sync {
    fn verify_token(&self, token: &str) -> Result<Claims, AuthError>;
}

impl TokenVerifier for AuthState {
    fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        self.validate_token(token)
    }
}

/// Validates webhook signatures.
pub trait WebhookVerifier: Send + Sync {
    fn verify_webhook(&self, signature: &WebhookSignature, body: &[u8]) -> bool;
}

impl WebhookVerifier for SharedSecretVerifier {
    fn verify_webhook(&self, signature: &WebhookSignature, body: &[u8]) -> bool {
        self.verify(signature, body)
    }
}

/// Errors returned by the router.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("malformed webhook payload: {0}")]
    BadPayload(String),
}

/// Access level a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Any valid token.
    Read,
    /// Admin role or `manage:instance`.
    Manage,
}

/// Webhook handling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared secret. Supports `env:VAR_NAME`.
    pub secret: Option<String>,
    /// Project ids or repository paths whose events are dropped.
    pub ignore: Vec<String>,
    /// Window in which update events for one key are coalesced.
    pub debounce_ms: u64,
    /// How often an update retries when the key is busy.
    pub busy_retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ignore: Vec::new(),
            debounce_ms: 750,
            busy_retries: 10,
        }
    }
}

impl WebhookConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// What the router did with a webhook.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub kind: String,
    /// `update`, `remove`, `remove_repository`, `ignored` or `none`.
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// What the next cycle for a key does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    /// Start, or restart unless explicitly stopped.
    Update,
    /// Stop and drop the instance.
    Remove,
}

#[derive(Debug)]
struct DebounceSlot {
    running: bool,
    pending: Option<Intent>,
}

struct RouterInner {
    lifecycle: Lifecycle,
    tokens: Arc<dyn TokenVerifier>,
    webhooks: Arc<dyn WebhookVerifier>,
    config: WebhookConfig,
    debounce: DashMap<InstanceKey, DebounceSlot>,
}

/// Routes requests and events into the lifecycle.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("pending_updates", &self.inner.debounce.len())
            .finish()
    }
}

impl EventRouter {
    pub fn new(
        lifecycle: Lifecycle,
        tokens: Arc<dyn TokenVerifier>,
        webhooks: Arc<dyn WebhookVerifier>,
        config: WebhookConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                lifecycle,
                tokens,
                webhooks,
                config,
                debounce: DashMap::new(),
            }),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    /// Validate a token and check it grants `access`.
    pub fn authorize(&self, token: Option<&str>, access: Access) -> Result<Claims, RouterError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let claims = self.inner.tokens.verify_token(token)?;

        if access == Access::Manage && !claims.has_permission(MANAGE_INSTANCE) {
            warn!("{} lacks {}", claims.sub, MANAGE_INSTANCE);
            return Err(AuthError::InsufficientPermissions(format!(
                "admin role or {} required",
                MANAGE_INSTANCE
            ))
            .into());
        }

        Ok(claims)
    }

    pub async fn start(&self, token: Option<&str>, key: &InstanceKey) -> Result<Instance, RouterError> {
        let claims = self.authorize(token, Access::Manage)?;
        info!("{} requested start of {}", claims.display_name(), key);
        Ok(self.inner.lifecycle.start(key).await?)
    }

    pub async fn stop(&self, token: Option<&str>, key: &InstanceKey) -> Result<Instance, RouterError> {
        let claims = self.authorize(token, Access::Manage)?;
        info!("{} requested stop of {}", claims.display_name(), key);
        Ok(self.inner.lifecycle.stop(key).await?)
    }

    pub async fn restart(&self, token: Option<&str>, key: &InstanceKey) -> Result<Instance, RouterError> {
        let claims = self.authorize(token, Access::Manage)?;
        info!("{} requested restart of {}", claims.display_name(), key);
        Ok(self.inner.lifecycle.restart(key).await?)
    }

    pub async fn remove(&self, token: Option<&str>, key: &InstanceKey) -> Result<Instance, RouterError> {
        let claims = self.authorize(token, Access::Manage)?;
        info!("{} requested removal of {}", claims.display_name(), key);
        Ok(self.inner.lifecycle.remove(key).await?)
    }

    /// Verify, parse and dispatch a webhook. Work happens in the background.
    pub fn handle_webhook(
        &self,
        signature: &WebhookSignature,
        body: &[u8],
    ) -> Result<WebhookAck, RouterError> {
        if !self.inner.webhooks.verify_webhook(signature, body) {
            warn!("Dropping webhook with invalid signature");
            return Err(HostError::AuthDenied("invalid webhook signature".to_string()).into());
        }

        let hook = parse_hook(body)?;
        if hook.is_ignored(&self.inner.config.ignore) {
            debug!(
                "Ignoring {} hook for {:?} (ignore list)",
                hook.kind, hook.repository
            );
            return Ok(WebhookAck {
                kind: hook.kind,
                action: "ignored",
                target: hook.repository,
            });
        }

        let (action, target) = match hook.event {
            Some(RepositoryEvent::Update { key, commit }) => {
                debug!("Update for {} at {:?}", key, commit);
                let target = key.to_string();
                self.schedule_update(key);
                ("update", Some(target))
            }
            Some(RepositoryEvent::RefDeleted { key }) => {
                let target = key.to_string();
                self.schedule_removal(key);
                ("remove", Some(target))
            }
            Some(RepositoryEvent::RepositoryDeleted { repository }) => {
                let keys = self.repository_keys(&repository);
                info!(
                    "Repository {} deleted, removing {} instance(s)",
                    repository,
                    keys.len()
                );
                for key in keys {
                    self.schedule_removal(key);
                }
                ("remove_repository", Some(repository))
            }
            None => {
                info!("Unhandled hook event: {}", hook.kind);
                ("none", None)
            }
        };

        Ok(WebhookAck {
            kind: hook.kind,
            action,
            target,
        })
    }

    /// Number of keys with a pending or running cycle.
    pub fn pending_updates(&self) -> usize {
        self.inner.debounce.len()
    }

    /// Queue an update cycle for `key`. Returns false if the event was coalesced.
    pub fn schedule_update(&self, key: InstanceKey) -> bool {
        self.schedule(key, Intent::Update)
    }

    /// Queue removal of `key`. Supersedes a pending update for the same key.
    pub fn schedule_removal(&self, key: InstanceKey) -> bool {
        self.schedule(key, Intent::Remove)
    }

    /// Registered keys of a repository plus keys with a queued cycle.
    fn repository_keys(&self, repository: &str) -> BTreeSet<InstanceKey> {
        let mut keys: BTreeSet<InstanceKey> = self
            .inner
            .lifecycle
            .registry()
            .keys_for_repository(repository)
            .into_iter()
            .collect();
        keys.extend(
            self.inner
                .debounce
                .iter()
                .filter(|e| e.key().repository() == repository)
                .map(|e| e.key().clone()),
        );
        keys
    }

    fn schedule(&self, key: InstanceKey, intent: Intent) -> bool {
        match self.inner.debounce.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                slot.pending = Some(intent);
                if slot.running {
                    debug!("{} cycle in progress, queued {:?} after it", key, intent);
                } else {
                    debug!("{} cycle already pending, now {:?}", key, intent);
                }
                return false;
            }
            Entry::Vacant(entry) => {
                entry.insert(DebounceSlot {
                    running: false,
                    pending: Some(intent),
                });
            }
        }

        let router = self.clone();
        tokio::spawn(async move { router.run_cycles(key).await });
        true
    }

    async fn run_cycles(&self, key: InstanceKey) {
        let debounce = &self.inner.debounce;
        loop {
            tokio::time::sleep(self.inner.config.debounce()).await;

            let Some(intent) = debounce.get_mut(&key).map(|mut slot| {
                slot.running = true;
                slot.pending.take()
            }) else {
                break;
            };
            if let Some(intent) = intent {
                self.run_intent(&key, intent).await;
            }

            if debounce
                .remove_if(&key, |_, slot| slot.pending.is_none())
                .is_some()
            {
                break;
            }
            match debounce.get_mut(&key) {
                Some(mut slot) => slot.running = false,
                None => break,
            }
            debug!("{} received another event during the cycle, running once more", key);
        }
    }

    async fn run_intent(&self, key: &InstanceKey, intent: Intent) {
        let retries = self.inner.config.busy_retries;
        let backoff = self.inner.config.debounce().max(Duration::from_millis(50));

        for attempt in 0..=retries {
            let result = match intent {
                Intent::Update => self.apply_update(key).await,
                Intent::Remove => self.inner.lifecycle.remove(key).await,
            };
            match result {
                Ok(instance) => {
                    info!(
                        "{:?} of {} finished: {} (generation {})",
                        intent, key, instance.state, instance.generation
                    );
                    return;
                }
                Err(HostError::NotFound(_)) if intent == Intent::Remove => {
                    debug!("{} already gone", key);
                    return;
                }
                Err(HostError::Busy(_)) if attempt < retries => {
                    debug!("{} busy, retrying {:?} ({}/{})", key, intent, attempt + 1, retries);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    warn!("{:?} of {} failed: {}", intent, key, e);
                    return;
                }
            }
        }
    }

    async fn apply_update(&self, key: &InstanceKey) -> Result<Instance, HostError> {
        let lifecycle = &self.inner.lifecycle;
        match lifecycle.registry().get(key) {
            Err(HostError::NotFound(_)) => lifecycle.start(key).await,
            Err(e) => Err(e),
            Ok(instance) if instance.state == InstanceState::Stopped => {
                debug!("{} is stopped, leaving it stopped", key);
                Ok(instance)
            }
            Ok(_) => lifecycle.restart(key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::checkout::DirectoryCheckouts;
    use crate::instance::{LifecycleConfig, Registry};
    use crate::supervisor::{LaunchConfig, PortPool, PortRange, ProcessSupervisor, SupervisorConfig};

    struct StaticTokens;

    impl TokenVerifier for StaticTokens {
        fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
            let (role, permissions) = match token {
                "admin" => ("admin", vec![]),
                "deployer" => ("user", vec![MANAGE_INSTANCE.to_string()]),
                "reader" => ("user", vec![]),
                _ => return Err(AuthError::InvalidToken("unknown".to_string())),
            };
            Ok(Claims {
                sub: token.to_string(),
                iss: None,
                exp: i64::MAX,
                iat: None,
                name: None,
                roles: vec![role.to_string()],
                role: Some(role.to_string()),
                permissions,
            })
        }
    }

    struct AcceptAll;

    impl WebhookVerifier for AcceptAll {
        fn verify_webhook(&self, _signature: &WebhookSignature, _body: &[u8]) -> bool {
            true
        }
    }

    fn router(dir: &tempfile::TempDir, debounce_ms: u64) -> EventRouter {
        let lifecycle = Lifecycle::new(
            Arc::new(Registry::new()),
            Arc::new(PortPool::new(PortRange::new(25000, 25001))),
            ProcessSupervisor::new(SupervisorConfig::default()),
            Arc::new(DirectoryCheckouts::new(dir.path().join("missing"))),
            LifecycleConfig {
                logs_dir: dir.path().join("logs"),
                launch: LaunchConfig {
                    program: "sleep".to_string(),
                    args: vec!["30".to_string()],
                    env: HashMap::new(),
                    ..LaunchConfig::default()
                },
            },
        );
        EventRouter::new(
            lifecycle,
            Arc::new(StaticTokens),
            Arc::new(AcceptAll),
            WebhookConfig {
                debounce_ms,
                ..WebhookConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_authorize_levels() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(&dir, 10);

        assert!(matches!(
            r.authorize(None, Access::Read),
            Err(RouterError::Auth(AuthError::MissingToken))
        ));
        assert!(matches!(
            r.authorize(Some("bogus"), Access::Read),
            Err(RouterError::Auth(AuthError::InvalidToken(_)))
        ));
        assert!(r.authorize(Some("reader"), Access::Read).is_ok());
        assert!(matches!(
            r.authorize(Some("reader"), Access::Manage),
            Err(RouterError::Auth(AuthError::InsufficientPermissions(_)))
        ));
        assert!(r.authorize(Some("deployer"), Access::Manage).is_ok());
        assert!(r.authorize(Some("admin"), Access::Manage).is_ok());
    }

    #[tokio::test]
    async fn test_denied_start_leaves_registry_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(&dir, 10);
        let key = InstanceKey::new("demo", "main").unwrap();

        assert!(r.start(Some("reader"), &key).await.is_err());
        assert!(r.start(None, &key).await.is_err());
        assert!(!r.lifecycle().registry().contains(&key));
    }

    #[tokio::test]
    async fn test_schedule_update_coalesces_burst() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(&dir, 200);
        let key = InstanceKey::new("demo", "main").unwrap();

        assert!(r.schedule_update(key.clone()));
        assert!(!r.schedule_update(key.clone()));
        assert!(!r.schedule_update(key.clone()));
        assert_eq!(r.pending_updates(), 1);

        for _ in 0..100 {
            if r.pending_updates() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(r.pending_updates(), 0);

        // The checkout is missing, so the single cycle ends in Failed.
        let instance = r.lifecycle().registry().get(&key).unwrap();
        assert_eq!(instance.state, InstanceState::Failed);
        assert_eq!(instance.generation, 1);
    }

    #[tokio::test]
    async fn test_removal_supersedes_pending_update() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(&dir, 100);
        let key = InstanceKey::new("demo", "main").unwrap();

        assert!(r.schedule_update(key.clone()));
        assert!(!r.schedule_removal(key.clone()));
        assert_eq!(r.pending_updates(), 1);

        for _ in 0..100 {
            if r.pending_updates() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(r.pending_updates(), 0);
        // No start was attempted, so nothing was registered.
        assert!(!r.lifecycle().registry().contains(&key));
    }

    #[tokio::test]
    async fn test_repository_deletion_covers_queued_keys() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(&dir, 100);
        let sig = WebhookSignature::default();

        let push = br#"{"event_name":"push","project":{"path_with_namespace":"demo"},"ref":"refs/heads/main","after":"abc"}"#;
        assert_eq!(r.handle_webhook(&sig, push).unwrap().action, "update");
        let destroy = br#"{"event_name":"project_destroy","path_with_namespace":"demo","project_id":7}"#;
        assert_eq!(r.handle_webhook(&sig, destroy).unwrap().action, "remove_repository");
        assert_eq!(r.pending_updates(), 1);

        for _ in 0..100 {
            if r.pending_updates() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(r.lifecycle().registry().is_empty());
    }

    #[tokio::test]
    async fn test_bad_payload_and_ignored_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(&dir, 10);
        let sig = WebhookSignature::default();

        assert!(matches!(
            r.handle_webhook(&sig, b"not json"),
            Err(RouterError::BadPayload(_))
        ));

        let ack = r
            .handle_webhook(&sig, br#"{"event_name":"tag_push","project":{"path_with_namespace":"demo"},"ref":"refs/tags/v1","after":"abc"}"#)
            .unwrap();
        assert_eq!(ack.action, "update");
        assert_eq!(ack.target.as_deref(), Some("demo@v1"));
    }
}
