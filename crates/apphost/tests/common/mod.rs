//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use apphost::api::{self, AppState};
use apphost::auth::{AuthConfig, AuthState, DevUser, MANAGE_INSTANCE, Role, SharedSecretVerifier};
use apphost::checkout::DirectoryCheckouts;
use apphost::instance::{Instance, InstanceKey, InstanceState, Lifecycle, LifecycleConfig, Registry};
use apphost::router::{EventRouter, WebhookConfig};
use apphost::status::StatusService;
use apphost::supervisor::{LaunchConfig, PortPool, PortRange, ProcessSupervisor, SupervisorConfig};
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

pub const JWT_SECRET: &str = "test-secret-for-integration-tests-minimum-32-chars";
pub const WEBHOOK_SECRET: &str = "webhook-secret-for-tests";

/// Users known in dev mode: `admin` (admin role), `ci` (manage permission),
/// `viewer` (read only).
fn test_auth_config() -> AuthConfig {
    AuthConfig {
        dev_mode: true,
        jwt_secret: Some(JWT_SECRET.to_string()),
        dev_users: vec![
            DevUser {
                id: "admin".to_string(),
                name: "Admin".to_string(),
                role: Role::Admin,
                permissions: Vec::new(),
            },
            DevUser {
                id: "ci".to_string(),
                name: "CI".to_string(),
                role: Role::User,
                permissions: vec![MANAGE_INSTANCE.to_string()],
            },
            DevUser {
                id: "viewer".to_string(),
                name: "Viewer".to_string(),
                role: Role::User,
                permissions: Vec::new(),
            },
        ],
        allowed_origins: Vec::new(),
    }
}

/// A fully wired app on top of a temporary checkout tree.
pub struct TestApp {
    pub dir: TempDir,
    pub app: Router,
    pub router: EventRouter,
    pub lifecycle: Lifecycle,
    pub auth: AuthState,
}

pub struct TestOptions {
    pub ports: (u16, u16),
    pub debounce_ms: u64,
    pub ignore: Vec<String>,
    /// How long a start stays in `Starting` (nothing listens on the port).
    pub ready_ms: u64,
}

impl TestOptions {
    pub fn ports(start: u16, end: u16) -> Self {
        Self {
            ports: (start, end),
            debounce_ms: 300,
            ignore: Vec::new(),
            ready_ms: 100,
        }
    }
}

/// Build an app whose instances run `sleep 30` from checkouts of `demo/main`,
/// `demo/dev` and `group/app/main`.
pub fn test_app(start: u16, end: u16) -> TestApp {
    test_app_with(TestOptions::ports(start, end))
}

pub fn test_app_with(options: TestOptions) -> TestApp {
    let dir = tempfile::tempdir().expect("create temp dir");
    let checkouts = dir.path().join("checkouts");
    for path in ["demo/main", "demo/dev", "group/app/main"] {
        std::fs::create_dir_all(checkouts.join(path)).expect("create checkout");
    }
    let logs_dir = dir.path().join("logs");

    let supervisor = ProcessSupervisor::new(SupervisorConfig {
        ready_timeout_ms: options.ready_ms,
        require_ready: false,
        startup_attempts: 1,
        stop_grace_ms: 2000,
        health_interval_ms: 100,
        tail_lines: 10,
    });
    let launch = LaunchConfig {
        program: "sleep".to_string(),
        args: vec!["30".to_string()],
        venv_activator: None,
        port_env: "PORT".to_string(),
        env: HashMap::new(),
        default_entry_file: "app.py".to_string(),
    };

    let registry = Arc::new(Registry::new());
    let (start, end) = options.ports;
    let lifecycle = Lifecycle::new(
        registry.clone(),
        Arc::new(PortPool::new(PortRange::new(start, end))),
        supervisor,
        Arc::new(DirectoryCheckouts::new(checkouts)),
        LifecycleConfig {
            logs_dir: logs_dir.clone(),
            launch,
        },
    );

    let auth = AuthState::new(test_auth_config());
    let router = EventRouter::new(
        lifecycle.clone(),
        Arc::new(auth.clone()),
        Arc::new(SharedSecretVerifier::new(Some(WEBHOOK_SECRET.to_string()))),
        WebhookConfig {
            secret: Some(WEBHOOK_SECRET.to_string()),
            ignore: options.ignore,
            debounce_ms: options.debounce_ms,
            busy_retries: 40,
        },
    );
    let status = StatusService::new(registry, logs_dir);
    let app = api::create_router(AppState::new(router.clone(), status, auth.clone()));

    TestApp {
        dir,
        app,
        router,
        lifecycle,
        auth,
    }
}

impl TestApp {
    /// Send a request, authenticating as the given dev user.
    pub async fn request(&self, method: Method, uri: &str, user: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("Authorization", format!("Bearer dev:{user}"));
        }
        let request = builder.body(Body::empty()).expect("build request");
        self.send(request).await
    }

    /// Post a webhook body with optional signature headers.
    pub async fn webhook(&self, body: &Value, headers: &[(&str, String)]) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/git")
            .header("Content-Type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let request = builder
            .body(Body::from(body.to_string()))
            .expect("build request");
        self.send(request).await
    }

    /// Post a webhook signed with the shared secret.
    pub async fn signed_webhook(&self, body: &Value) -> (StatusCode, Value) {
        let signature = apphost::auth::sign_body(WEBHOOK_SECRET, body.to_string().as_bytes());
        self.webhook(body, &[("X-Hub-Signature-256", signature)]).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("read body");
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).expect("json body")
        };
        (status, json)
    }

    pub fn instance(&self, repository: &str, git_ref: &str) -> Option<Instance> {
        let key = InstanceKey::new(repository, git_ref).ok()?;
        self.lifecycle.registry().get(&key).ok()
    }

    /// Poll until the instance reaches `state`.
    pub async fn wait_for_state(&self, repository: &str, git_ref: &str, state: InstanceState) -> Instance {
        for _ in 0..100 {
            if let Some(instance) = self.instance(repository, git_ref)
                && instance.state == state
            {
                return instance;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{repository}@{git_ref} never reached {state}");
    }

    /// Poll until the instance is gone from the registry.
    pub async fn wait_for_removal(&self, repository: &str, git_ref: &str) {
        for _ in 0..100 {
            if self.instance(repository, git_ref).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{repository}@{git_ref} was never removed");
    }

    /// Poll until no debounced update is pending or running.
    pub async fn wait_for_updates(&self) {
        for _ in 0..200 {
            if self.router.pending_updates() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("updates never settled");
    }
}

/// GitLab-style push hook.
pub fn push_payload(repository: &str, git_ref: &str, after: &str) -> Value {
    json!({
        "object_kind": "push",
        "event_name": "push",
        "ref": format!("refs/heads/{git_ref}"),
        "before": "1111111111111111111111111111111111111111",
        "after": after,
        "project_id": 42,
        "project": { "path_with_namespace": repository },
    })
}

pub const ZERO_SHA: &str = "0000000000000000000000000000000000000000";
