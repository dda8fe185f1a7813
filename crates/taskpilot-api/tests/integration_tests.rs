//! Integration tests for the TaskPilot API.
//!
//! Each test builds its own engine over an in-memory gateway with scripted
//! collaborators and drives the router with `oneshot` requests.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use taskpilot_api::create_router;
use taskpilot_api::handlers::HealthResponse;
use taskpilot_api::state::AppState;
use taskpilot_core::types::Timestamp;
use taskpilot_engine::testing::{
    comcast_config, engine_fixture, test_config, EngineFixture, Fakes,
};
use taskpilot_engine::{CallStatus, InboundMail};

// =============================================================================
// Helpers
// =============================================================================

const TEST_TOKEN: &str = "test-token-12345";

const COMPLETION_TURN: &str =
    "Your service has been cancelled. Your confirmation number is CX48213.";

fn make_state(fx: &EngineFixture) -> AppState {
    AppState::new(fx.engine.clone(), TEST_TOKEN)
}

/// Engine whose Comcast calls need no confirmation.
fn comcast() -> EngineFixture {
    engine_fixture(comcast_config(), Fakes::comcast())
}

fn make_app(fx: &EngineFixture) -> axum::Router {
    create_router(make_state(fx))
}

fn authed_get(uri: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", format!("Bearer {}", TEST_TOKEN))
        .body(Body::empty())
        .unwrap()
}

fn authed_post_json(uri: &str, json: &Value) -> Request<Body> {
    Request::post(uri)
        .header("authorization", format!("Bearer {}", TEST_TOKEN))
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .unwrap()
}

fn authed_post_empty(uri: &str) -> Request<Body> {
    Request::post(uri)
        .header("authorization", format!("Bearer {}", TEST_TOKEN))
        .body(Body::empty())
        .unwrap()
}

fn authed_delete(uri: &str) -> Request<Body> {
    Request::delete(uri)
        .header("authorization", format!("Bearer {}", TEST_TOKEN))
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(resp: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

/// POST /tasks for the fixture user and return the new task id.
async fn create_task(fx: &EngineFixture, goal: &str) -> Uuid {
    let resp = make_app(fx)
        .oneshot(authed_post_json(
            "/tasks",
            &json!({"user_id": fx.user.id, "goal": goal, "priority": "high"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "created");
    json["task_id"].as_str().unwrap().parse().unwrap()
}

async fn execute(fx: &EngineFixture, id: Uuid) -> (StatusCode, Value) {
    let resp = make_app(fx)
        .oneshot(authed_post_empty(&format!("/tasks/{}/execute", id)))
        .await
        .unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

// =============================================================================
// Health and authentication
// =============================================================================

#[tokio::test]
async fn test_health_needs_no_auth() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(health.status, "healthy");
    assert!(!health.version.is_empty());
}

#[tokio::test]
async fn test_protected_routes_reject_missing_token() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(Request::get("/tasks").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["error"], "unauthorized");
}

#[tokio::test]
async fn test_protected_routes_reject_wrong_token() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(
            Request::get("/tasks")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Users
// =============================================================================

#[tokio::test]
async fn test_create_and_delete_user() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/users",
            &json!({"email": "sam@example.com", "name": "Sam"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let user = body_json(resp).await;
    assert_eq!(user["email"], "sam@example.com");
    let id = user["id"].as_str().unwrap().to_string();

    let resp = make_app(&fx)
        .oneshot(authed_delete(&format!("/users/{}", id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["status"], "deleted");

    let resp = make_app(&fx)
        .oneshot(authed_delete(&format!("/users/{}", id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_user_is_conflict() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/users",
            &json!({"email": fx.user.email, "name": "Again"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

// =============================================================================
// Tasks
// =============================================================================

#[tokio::test]
async fn test_create_task_validation() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/tasks",
            &json!({"user_id": fx.user.id, "goal": "   "}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["error"], "bad_request");

    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/tasks",
            &json!({"user_id": Uuid::new_v4(), "goal": "Cancel my Comcast account"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_and_get_tasks() {
    let fx = comcast();
    let id = create_task(&fx, "Cancel my Comcast account").await;

    let resp = make_app(&fx)
        .oneshot(authed_get(&format!("/tasks?user_id={}&state=init", fx.user.id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["tasks"][0]["id"], id.to_string());
    assert_eq!(json["tasks"][0]["priority"], "high");
    assert_eq!(json["tasks"][0]["suspended"], false);

    let resp = make_app(&fx)
        .oneshot(authed_get("/tasks?state=completed"))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["count"], 0);

    let resp = make_app(&fx)
        .oneshot(authed_get(&format!("/tasks/{}", id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let view = body_json(resp).await;
    assert_eq!(view["task"]["state"], "init");
    assert_eq!(view["plans"].as_array().unwrap().len(), 0);

    let resp = make_app(&fx)
        .oneshot(authed_get(&format!("/tasks/{}", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_execute_runs_task_to_completion() {
    let fx = comcast();
    fx.fakes.telephony.set_status(CallStatus::Completed);
    let id = create_task(&fx, "Cancel my Comcast account").await;

    let (status, report) = execute(&fx, id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["state"], "completed");
    assert!(report["suspension"].is_null());
    assert_eq!(report["transitions"][0]["from"], "init");
    assert_eq!(report["transitions"][0]["to"], "gather_info");

    let resp = make_app(&fx)
        .oneshot(authed_get(&format!("/tasks/{}/logs", id)))
        .await
        .unwrap();
    let logs = body_json(resp).await;
    assert!(logs["logs"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["event"] == "task_completed"));

    // Terminal tasks refuse further execution.
    let (status, body) = execute(&fx, id).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "task_terminal");
    assert_eq!(body["details"]["state"], "completed");
}

#[tokio::test]
async fn test_step_mode_executes_one_step() {
    let fx = comcast();
    let id = create_task(&fx, "Cancel my Comcast account").await;

    let resp = make_app(&fx)
        .oneshot(authed_post_empty(&format!("/tasks/{}/execute?mode=step", id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let report = body_json(resp).await;
    assert_eq!(report["steps_executed"], 1);
    assert_eq!(report["state"], "gather_info");
}

#[tokio::test]
async fn test_confirmation_flow() {
    let fx = engine_fixture(test_config(), Fakes::comcast());
    let id = create_task(&fx, "Cancel my Comcast account").await;

    let (_, report) = execute(&fx, id).await;
    assert_eq!(report["state"], "ready_to_execute");
    assert_eq!(report["suspension"]["kind"], "awaiting_confirmation");
    let confirmation_id = report["suspension"]["confirmation_id"].as_str().unwrap().to_string();
    assert!(fx.fakes.telephony.placed_calls().is_empty());

    let uri = format!("/tasks/{}/confirmations/{}", id, confirmation_id);
    let resp = make_app(&fx)
        .oneshot(authed_post_json(&uri, &json!({"approved": true})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["state"], "awaiting_user_input");
    assert_eq!(fx.fakes.telephony.placed_calls().len(), 1);

    let resp = make_app(&fx)
        .oneshot(authed_post_json(&uri, &json!({"approved": false})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cancel_task() {
    let fx = comcast();
    let id = create_task(&fx, "Cancel my Comcast account").await;
    let (_, report) = execute(&fx, id).await;
    assert_eq!(report["state"], "awaiting_user_input");

    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            &format!("/tasks/{}/cancel", id),
            &json!({"reason": "changed my mind"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["state"], "escalated");
    assert_eq!(fx.fakes.telephony.hung_up(), vec!["call-1".to_string()]);
}

#[tokio::test]
async fn test_replan_rejects_empty_reason() {
    let fx = comcast();
    let id = create_task(&fx, "Cancel my Comcast account").await;
    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            &format!("/tasks/{}/replan", id),
            &json!({"reason": " "}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// Vault and memory
// =============================================================================

#[tokio::test]
async fn test_vault_never_echoes_secret() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/vault",
            &json!({
                "user_id": fx.user.id,
                "company": "Comcast",
                "account_number": "8771234567",
                "secret": "blue-heron-pin",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let raw = String::from_utf8(body_bytes(resp).await).unwrap();
    assert!(!raw.contains("blue-heron-pin"));
    assert!(!raw.contains("8771234567"));
    let summary: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(summary["account_hint"], "******4567");
}

#[tokio::test]
async fn test_memory_append_and_search() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/memory",
            &json!({
                "user_id": fx.user.id,
                "content": "Comcast account closed in March",
                "metadata": {"source": "note"},
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = make_app(&fx)
        .oneshot(authed_get(&format!(
            "/memory/search?user_id={}&q=Comcast%20account&min_similarity=-1",
            fx.user.id
        )))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    let results = json["results"].as_array().unwrap();
    assert!(results
        .iter()
        .any(|r| r["content"] == "Comcast account closed in March"));

    let resp = make_app(&fx)
        .oneshot(authed_get(&format!("/memory/search?user_id={}&q=", fx.user.id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// Intake webhooks
// =============================================================================

#[tokio::test]
async fn test_voice_turn_completes_call() {
    let fx = comcast();
    let id = create_task(&fx, "Cancel my Comcast account").await;
    execute(&fx, id).await;

    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/voice/events",
            &json!({"task_id": id, "type": "turn", "text": COMPLETION_TURN}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["state"], "completed");
}

#[tokio::test]
async fn test_voice_status_event() {
    let fx = comcast();
    let id = create_task(&fx, "Cancel my Comcast account").await;
    execute(&fx, id).await;

    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/voice/events",
            &json!({"task_id": id, "type": "status", "status": "completed"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["state"], "completed");
}

#[tokio::test]
async fn test_voice_event_validation() {
    let fx = comcast();
    let id = create_task(&fx, "Cancel my Comcast account").await;
    for payload in [
        json!({"task_id": id, "type": "turn"}),
        json!({"task_id": id, "type": "status"}),
        json!({"task_id": id, "type": "dtmf"}),
    ] {
        let resp = make_app(&fx)
            .oneshot(authed_post_json("/voice/events", &payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "payload {}", payload);
    }
}

#[tokio::test]
async fn test_inbound_email_creates_then_continues_task() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/email/inbound",
            &json!({
                "from": "Jane Doe <jane@example.com>",
                "subject": "Cancel Comcast",
                "text": "Please cancel my Comcast internet.",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "created");
    assert_eq!(json["report"]["state"], "awaiting_user_input");
    let task_id = json["task_id"].as_str().unwrap().to_string();

    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/email/inbound",
            &json!({
                "sender": "jane@example.com",
                "subject": format!("Re: update [task:{}]", task_id),
                "text": COMPLETION_TURN,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "continued");
    assert_eq!(json["task_id"], task_id);
    assert_eq!(json["report"]["state"], "completed");
}

#[tokio::test]
async fn test_inbound_email_from_unknown_sender() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/email/inbound",
            &json!({"from": "stranger@example.com", "subject": "hi", "text": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = make_app(&fx)
        .oneshot(authed_post_json("/email/inbound", &json!({"subject": "hi"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_inbound_email_with_long_subject_creates_task() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/email/inbound",
            &json!({
                "from": "jane@example.com",
                "subject": "s".repeat(3_000),
                "plain": "Please cancel my Comcast internet.",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "created");

    let task_id = Uuid::parse_str(json["task_id"].as_str().unwrap()).unwrap();
    let task = fx.memory.tasks().get(task_id).unwrap();
    assert!(task.goal.ends_with("Please cancel my Comcast internet."));
    assert_eq!(task.metadata["subject"].as_str().unwrap().len(), 200);
}

#[tokio::test]
async fn test_inbound_email_without_subject() {
    let fx = comcast();
    let resp = make_app(&fx)
        .oneshot(authed_post_json(
            "/email/inbound",
            &json!({"from": "jane@example.com", "text": "Please cancel my Comcast internet."}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    let task_id = Uuid::parse_str(json["task_id"].as_str().unwrap()).unwrap();
    let task = fx.memory.tasks().get(task_id).unwrap();
    assert_eq!(task.metadata["subject"], "(no subject)");
    assert!(task.goal.starts_with("Email from jane@example.com: (no subject)"));
}

#[tokio::test]
async fn test_email_poll_processes_inbox() {
    let fx = comcast();
    fx.fakes.telephony.set_status(CallStatus::Completed);
    fx.fakes.mail.deliver(InboundMail {
        sender: "jane@example.com".into(),
        subject: "Cancel Comcast".into(),
        body: "Please cancel my Comcast internet.".into(),
        attachments: Vec::new(),
        received_at: Timestamp::now(),
    });
    fx.fakes.mail.deliver(InboundMail {
        sender: "stranger@example.com".into(),
        subject: "Hello".into(),
        body: "Who is this?".into(),
        attachments: Vec::new(),
        received_at: Timestamp::now(),
    });

    let resp = make_app(&fx)
        .oneshot(authed_post_empty("/email/poll"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["processed"], 2);
    assert_eq!(json["failed"], 1);
    assert_eq!(json["results"][0]["report"]["state"], "completed");

    // The inbox was drained.
    let resp = make_app(&fx)
        .oneshot(authed_post_empty("/email/poll"))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["processed"], 0);
}
