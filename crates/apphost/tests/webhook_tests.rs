//! Repository webhook integration tests.

mod common;

use apphost::instance::{InstanceKey, InstanceState};
use axum::http::{Method, StatusCode};
use common::{TestOptions, WEBHOOK_SECRET, ZERO_SHA, push_payload, test_app, test_app_with};
use serde_json::json;

const COMMIT: &str = "9f1c2a7b3e4d5f60718293a4b5c6d7e8f9012345";

#[tokio::test]
async fn test_webhook_bad_signature_rejected() {
    let t = test_app(24000, 24001);
    let body = push_payload("demo", "main", COMMIT);

    let (status, json) = t
        .webhook(&body, &[("X-Hub-Signature-256", "sha256=deadbeef".to_string())])
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "FORBIDDEN");

    let (status, _) = t.webhook(&body, &[]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = t
        .webhook(&body, &[("X-Gitlab-Token", "wrong".to_string())])
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert_eq!(t.router.pending_updates(), 0);
    assert!(t.lifecycle.registry().is_empty());
}

#[tokio::test]
async fn test_signed_push_starts_instance() {
    let t = test_app(24010, 24011);

    let (status, json) = t
        .signed_webhook(&push_payload("demo", "main", COMMIT))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["kind"], "push");
    assert_eq!(json["action"], "update");
    assert_eq!(json["target"], "demo@main");

    let instance = t
        .wait_for_state("demo", "main", InstanceState::Running)
        .await;
    assert_eq!(instance.port.map(|l| l.port()), Some(24010));

    t.lifecycle.stop_all().await;
}

#[tokio::test]
async fn test_token_header_accepted() {
    let t = test_app(24020, 24021);

    let (status, json) = t
        .webhook(
            &push_payload("demo", "dev", COMMIT),
            &[("X-Gitlab-Token", WEBHOOK_SECRET.to_string())],
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["target"], "demo@dev");

    t.wait_for_state("demo", "dev", InstanceState::Running)
        .await;
    t.wait_for_updates().await;
    t.lifecycle.stop_all().await;
}

#[tokio::test]
async fn test_burst_of_pushes_restarts_once() {
    let t = test_app_with(TestOptions {
        debounce_ms: 500,
        ..TestOptions::ports(24030, 24030)
    });

    let (_, started) = t
        .request(Method::POST, "/instances/demo/main/start", Some("admin"))
        .await;
    let generation = started["generation"].as_u64().unwrap();

    for commit in ["a1", "b2", "c3"] {
        let (status, _) = t
            .signed_webhook(&push_payload("demo", "main", commit))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    assert_eq!(t.router.pending_updates(), 1);

    t.wait_for_updates().await;

    let instance = t.instance("demo", "main").unwrap();
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.generation, generation + 1);
    assert_eq!(t.lifecycle.pool().free_count(), 0);

    t.lifecycle.stop_all().await;
    assert_eq!(t.lifecycle.pool().free_count(), 1);
}

#[tokio::test]
async fn test_push_during_restart_runs_one_more_cycle() {
    let t = test_app_with(TestOptions {
        debounce_ms: 200,
        ready_ms: 800,
        ..TestOptions::ports(24110, 24111)
    });

    let (_, started) = t
        .request(Method::POST, "/instances/demo/main/start", Some("admin"))
        .await;
    let generation = started["generation"].as_u64().unwrap();

    t.signed_webhook(&push_payload("demo", "main", "a1")).await;
    let restarting = t
        .wait_for_state("demo", "main", InstanceState::Starting)
        .await;
    assert_eq!(restarting.generation, generation + 1);

    // Both arrive while the first restart is still starting up.
    for commit in ["b2", "c3"] {
        let (status, _) = t
            .signed_webhook(&push_payload("demo", "main", commit))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    assert_eq!(t.router.pending_updates(), 1);

    t.wait_for_updates().await;

    let instance = t.instance("demo", "main").unwrap();
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.generation, generation + 2);

    t.lifecycle.stop_all().await;
}

#[tokio::test]
async fn test_update_leaves_stopped_instance_stopped() {
    let t = test_app_with(TestOptions {
        debounce_ms: 50,
        ..TestOptions::ports(24040, 24041)
    });

    t.request(Method::POST, "/instances/demo/main/start", Some("admin"))
        .await;
    t.request(Method::POST, "/instances/demo/main/stop", Some("admin"))
        .await;

    let (status, _) = t
        .signed_webhook(&push_payload("demo", "main", COMMIT))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    t.wait_for_updates().await;

    let instance = t.instance("demo", "main").unwrap();
    assert_eq!(instance.state, InstanceState::Stopped);
    assert_eq!(t.lifecycle.pool().free_count(), 2);
}

#[tokio::test]
async fn test_update_restarts_failed_instance() {
    let t = test_app_with(TestOptions {
        debounce_ms: 50,
        ..TestOptions::ports(24050, 24050)
    });

    // Exhaust the single port so demo/dev fails.
    t.request(Method::POST, "/instances/demo/main/start", Some("admin"))
        .await;
    t.request(Method::POST, "/instances/demo/dev/start", Some("admin"))
        .await;
    assert_eq!(
        t.instance("demo", "dev").unwrap().state,
        InstanceState::Failed
    );
    t.request(Method::POST, "/instances/demo/main/stop", Some("admin"))
        .await;

    t.signed_webhook(&push_payload("demo", "dev", COMMIT)).await;
    let instance = t
        .wait_for_state("demo", "dev", InstanceState::Running)
        .await;
    assert_eq!(instance.port.map(|l| l.port()), Some(24050));
    assert!(instance.last_error.is_none());

    t.wait_for_updates().await;
    t.lifecycle.stop_all().await;
}

#[tokio::test]
async fn test_ref_deletion_removes_instance() {
    let t = test_app(24060, 24061);

    t.request(Method::POST, "/instances/demo/main/start", Some("admin"))
        .await;

    let (status, json) = t
        .signed_webhook(&push_payload("demo", "main", ZERO_SHA))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["action"], "remove");

    t.wait_for_removal("demo", "main").await;
    assert_eq!(t.lifecycle.pool().free_count(), 2);
}

#[tokio::test]
async fn test_ref_deletion_supersedes_pending_push() {
    let t = test_app_with(TestOptions {
        debounce_ms: 200,
        ..TestOptions::ports(24120, 24121)
    });

    t.request(Method::POST, "/instances/demo/main/start", Some("admin"))
        .await;

    for (git_ref, after) in [
        ("main", COMMIT),
        ("main", ZERO_SHA),
        ("dev", COMMIT),
        ("dev", ZERO_SHA),
    ] {
        let (status, _) = t
            .signed_webhook(&push_payload("demo", git_ref, after))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    assert_eq!(t.router.pending_updates(), 2);

    t.wait_for_updates().await;

    assert!(t.instance("demo", "main").is_none());
    assert!(t.instance("demo", "dev").is_none());
    assert_eq!(t.lifecycle.pool().free_count(), 2);
}

#[tokio::test]
async fn test_ref_deletion_waits_for_in_flight_start() {
    let t = test_app_with(TestOptions {
        debounce_ms: 50,
        ready_ms: 1000,
        ..TestOptions::ports(24130, 24131)
    });

    let lifecycle = t.lifecycle.clone();
    let key = InstanceKey::new("demo", "main").unwrap();
    let starting = tokio::spawn(async move { lifecycle.start(&key).await });
    t.wait_for_state("demo", "main", InstanceState::Starting)
        .await;

    let (status, json) = t
        .signed_webhook(&push_payload("demo", "main", ZERO_SHA))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["action"], "remove");

    let started = starting.await.unwrap().unwrap();
    assert_eq!(started.state, InstanceState::Running);

    t.wait_for_removal("demo", "main").await;
    t.wait_for_updates().await;
    assert_eq!(t.lifecycle.pool().free_count(), 2);
}

#[tokio::test]
async fn test_repository_destroy_supersedes_pending_push() {
    let t = test_app_with(TestOptions {
        debounce_ms: 200,
        ..TestOptions::ports(24140, 24141)
    });

    t.signed_webhook(&push_payload("demo", "dev", COMMIT)).await;
    let (status, json) = t
        .signed_webhook(&json!({
            "event_name": "project_destroy",
            "path_with_namespace": "demo",
            "project_id": 42,
        }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["action"], "remove_repository");

    t.wait_for_updates().await;
    assert!(t.instance("demo", "dev").is_none());
    assert_eq!(t.lifecycle.pool().free_count(), 2);
}

#[tokio::test]
async fn test_repository_destroy_removes_all_refs() {
    let t = test_app(24070, 24072);

    t.request(Method::POST, "/instances/demo/main/start", Some("admin"))
        .await;
    t.request(Method::POST, "/instances/demo/dev/start", Some("admin"))
        .await;
    t.request(Method::POST, "/instances/group%2Fapp/main/start", Some("admin"))
        .await;

    let body = json!({
        "event_name": "project_destroy",
        "path_with_namespace": "demo",
        "project_id": 42,
    });
    let (status, json) = t.signed_webhook(&body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["action"], "remove_repository");

    t.wait_for_removal("demo", "main").await;
    t.wait_for_removal("demo", "dev").await;
    let other = t.instance("group/app", "main").unwrap();
    assert_eq!(other.state, InstanceState::Running);

    t.lifecycle.stop_all().await;
}

#[tokio::test]
async fn test_ignored_repository_is_dropped() {
    let t = test_app_with(TestOptions {
        ignore: vec!["demo".to_string()],
        ..TestOptions::ports(24080, 24081)
    });

    let (status, json) = t
        .signed_webhook(&push_payload("demo", "main", COMMIT))
        .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["action"], "ignored");
    assert_eq!(t.router.pending_updates(), 0);
    assert!(t.lifecycle.registry().is_empty());
}

#[tokio::test]
async fn test_malformed_payload_rejected() {
    let t = test_app(24090, 24091);

    let (status, json) = t
        .signed_webhook(&json!({ "event_name": "push", "project": {} }))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
    assert!(t.lifecycle.registry().is_empty());
}

#[tokio::test]
async fn test_unhandled_event_acknowledged() {
    let t = test_app(24100, 24101);

    let (status, json) = t
        .signed_webhook(&json!({ "event_name": "user_create", "name": "someone" }))
        .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["kind"], "user_create");
    assert_eq!(json["action"], "none");
    assert!(t.lifecycle.registry().is_empty());
}
