use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{json, Value};
use trinity_core::envelope::CredentialCipher;
use trinity_core::types::{Execution, ExecutionSource, SYSTEM_AGENT_NAME};
use trinity_runtime::test_support::{FakeDriver, FakeTransport};
use trinity_runtime::{
    ActivityService, AgentTransport, ContainerDriver, CredentialService, ExecutionQueue,
    LifecycleConfig, LifecycleManager, LockManager, MemoryBackend, PermissionResolver, Scheduler,
};
use trinity_store::StateStore;

use crate::auth::JwtKeys;
use crate::state::AppState;

struct Harness {
    server: TestServer,
    state: AppState,
    _templates_dir: tempfile::TempDir,
}

fn write_template(root: &std::path::Path, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("template.yaml"),
        "name: demo\ntype: worker\ncredentials:\n  env_file:\n    - DEMO_KEY\n",
    )
    .unwrap();
}

fn harness() -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    let store = StateStore::open_in_memory().unwrap();
    let queue = ExecutionQueue::new(backend.clone());
    let activity = ActivityService::new(store.clone());
    let transport: Arc<dyn AgentTransport> = Arc::new(FakeTransport::new());
    let driver: Arc<dyn ContainerDriver> = Arc::new(FakeDriver::new());

    let templates_dir = tempfile::tempdir().unwrap();
    write_template(templates_dir.path(), "default");
    write_template(templates_dir.path(), "trinity-system");

    let lifecycle = Arc::new(LifecycleManager::new(
        driver,
        transport.clone(),
        store.clone(),
        queue.clone(),
        activity.clone(),
        LifecycleConfig {
            templates_dir: templates_dir.path().to_path_buf(),
            ..Default::default()
        },
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        queue.clone(),
        LockManager::new(backend),
        transport.clone(),
        activity.clone(),
    ));

    let state = AppState {
        store: store.clone(),
        queue,
        lifecycle,
        scheduler,
        resolver: PermissionResolver::new(store),
        activity,
        credentials: Arc::new(CredentialService::new(
            CredentialCipher::new(&[3u8; 32]),
            transport,
        )),
        jwt: JwtKeys::new(b"router-test-secret"),
    };

    let server = TestServer::new(super::build(state.clone())).unwrap();
    Harness {
        server,
        state,
        _templates_dir: templates_dir,
    }
}

fn bearer(h: &Harness, username: &str) -> (HeaderName, HeaderValue) {
    let token = h.state.jwt.issue(username).unwrap();
    (
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    )
}

async fn create_agent(h: &Harness, owner: &str, name: &str) {
    let (header_name, header_value) = bearer(h, owner);
    let response = h
        .server
        .post("/api/agents")
        .add_header(header_name, header_value)
        .json(&json!({"name": name}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_is_open() {
    let h = harness();
    let response = h.server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_auth_required() {
    let h = harness();
    let response = h.server.get("/api/agents").await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_issuance_bcrypt_only() {
    let h = harness();
    h.state.store.create_user("ada", "correct horse", "user").unwrap();

    let response = h
        .server
        .post("/api/token")
        .json(&json!({"username": "ada", "password": "correct horse"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["token_type"], "bearer");

    let response = h
        .server
        .post("/api/token")
        .json(&json!({"username": "ada", "password": "wrong"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_list_and_duplicate_agent() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .get("/api/agents")
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let agents: Vec<Value> = response.json();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["name"], "alpha");
    assert_eq!(agents[0]["owner_username"], "ada");

    // Duplicate name conflicts
    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents")
        .add_header(header_name, header_value)
        .json(&json!({"name": "alpha"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_agents_are_owner_scoped() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;

    let (header_name, header_value) = bearer(&h, "grace");
    let response = h
        .server
        .get("/api/agents/alpha")
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_task_round_trip() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/task")
        .add_header(header_name, header_value)
        .json(&json!({"message": "hi"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "success");
    assert_eq!(body["response"], "echo: hi");

    // Outcome row persisted, slot released
    let executions = h.state.store.list_agent_executions("alpha", 10).unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].triggered_by, trinity_core::TriggeredBy::User);
    assert!(!h.state.queue.is_busy("alpha").await.unwrap());
}

#[tokio::test]
async fn test_busy_agent_without_wait_is_conflict() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;

    // Occupy the slot out-of-band
    let blocker = Execution::new("alpha", "long job", ExecutionSource::User);
    h.state.queue.submit(blocker, true).await.unwrap();

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/task")
        .add_header(header_name, header_value)
        .json(&json!({"message": "hi", "wait_if_busy": false}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["current_execution"]["message"], "long job");
}

#[tokio::test]
async fn test_full_queue_is_429_with_retry_after() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;

    // Slot plus a full wait list
    for i in 0..4 {
        let filler = Execution::new("alpha", format!("filler-{i}"), ExecutionSource::User);
        h.state.queue.submit(filler, true).await.unwrap();
    }

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/task")
        .add_header(header_name, header_value)
        .json(&json!({"message": "overflow"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());
    let body: Value = response.json();
    assert_eq!(body["queue_length"], 3);
}

#[tokio::test]
async fn test_string_booleans_rejected() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/task")
        .add_header(header_name, header_value)
        .json(&json!({"message": "hi", "wait_if_busy": "false"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_unknown_agent_is_404() {
    let h = harness();
    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/ghost/task")
        .add_header(header_name, header_value)
        .json(&json!({"message": "hi"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_system_agent_delete_always_403() {
    let h = harness();
    h.state.lifecycle.ensure_system_agent().await.unwrap();

    let (header_name, header_value) = bearer(&h, "admin");
    let response = h
        .server
        .delete(&format!("/api/agents/{SYSTEM_AGENT_NAME}"))
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_owner_default_permissions_visible() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;
    create_agent(&h, "ada", "beta").await;

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .get("/api/agents/alpha/permissions")
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    let available: Vec<&str> = body["available_agents"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(available.contains(&"beta"));
}

#[tokio::test]
async fn test_permission_grant_strict_on_unknown_target() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/permissions/ghost")
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_permission_revoke_then_check() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;
    create_agent(&h, "ada", "beta").await;

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .delete("/api/agents/alpha/permissions/beta")
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(!h.state.resolver.can_dispatch("alpha", "beta").unwrap());
    // The reverse edge is untouched
    assert!(h.state.resolver.can_dispatch("beta", "alpha").unwrap());
}

#[tokio::test]
async fn test_schedule_validation_and_trigger() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;

    // 4-field cron rejected at write time
    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/schedules")
        .add_header(header_name, header_value)
        .json(&json!({"name": "broken", "cron_expression": "* * * *", "message": "m"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/schedules")
        .add_header(header_name, header_value)
        .json(&json!({"name": "nightly", "cron_expression": "0 3 * * *", "message": "tidy up"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let schedule: Value = response.json();
    assert!(schedule["next_run_at"].is_string());

    // Manual trigger runs the pipeline end to end
    let schedule_id = schedule["id"].as_str().unwrap();
    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post(&format!("/api/agents/alpha/schedules/{schedule_id}/trigger"))
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    let execution_id = body["execution_id"].as_str().unwrap();
    let row = h.state.store.get_execution(execution_id).unwrap().unwrap();
    assert_eq!(row.triggered_by, trinity_core::TriggeredBy::Manual);
}

#[tokio::test]
async fn test_mcp_key_mint_validate_revoke() {
    let h = harness();
    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/mcp/keys")
        .add_header(header_name, header_value)
        .json(&json!({"description": "ci key"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let minted: Value = response.json();
    let token = minted["token"].as_str().unwrap();
    assert!(token.starts_with("trinity_mcp_"));

    // Validation resolves the triple from the Authorization header
    let response = h
        .server
        .post("/api/mcp/validate")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        )
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["username"], "ada");
    assert_eq!(body["scope"], "user");

    // Revoked keys stop validating
    let key_id = minted["id"].as_str().unwrap();
    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post(&format!("/api/mcp/keys/{key_id}/revoke"))
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = h
        .server
        .post("/api/mcp/validate")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        )
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_queue_endpoints() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;

    let blocker = Execution::new("alpha", "long job", ExecutionSource::User);
    h.state.queue.submit(blocker, true).await.unwrap();
    let waiter = Execution::new("alpha", "waiting", ExecutionSource::User);
    h.state.queue.submit(waiter, true).await.unwrap();

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .get("/api/agents/alpha/queue")
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["is_busy"], true);
    assert_eq!(body["queue_length"], 1);

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/queue/clear")
        .add_header(header_name, header_value)
        .await;
    let body: Value = response.json();
    assert_eq!(body["dropped"], 1);

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/queue/release")
        .add_header(header_name, header_value)
        .await;
    let body: Value = response.json();
    assert_eq!(body["existed"], true);
    assert!(!h.state.queue.is_busy("alpha").await.unwrap());
}

#[tokio::test]
async fn test_relay_round_trips_both_methods() {
    let h = harness();
    create_agent(&h, "ada", "alpha").await;

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .get("/api/agents/alpha/relay/git/status")
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["relayed"], "/git/status");

    // POST relays work with and without a body
    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/relay/git/sync")
        .add_header(header_name, header_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["relayed"], "/git/sync");

    let (header_name, header_value) = bearer(&h, "ada");
    let response = h
        .server
        .post("/api/agents/alpha/relay/git/sync")
        .add_header(header_name, header_value)
        .json(&json!({"remote": "origin"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_internal_activity_api_is_open() {
    let h = harness();
    let response = h
        .server
        .post("/internal/activities/track")
        .json(&json!({
            "agent_name": "alpha",
            "activity_type": "tool_call",
            "details": {"tool_name": "bash"},
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    let activity_id = body["activity_id"].as_str().unwrap();

    let response = h
        .server
        .post(&format!("/internal/activities/{activity_id}/complete"))
        .json(&json!({"status": "completed"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}
