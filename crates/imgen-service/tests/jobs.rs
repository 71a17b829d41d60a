//! Generation job lifecycle integration tests.

mod common;

use axum::http::StatusCode;
use common::{token_for, with_bearer, TestHarness};
use imgen_core::{GenerationRequest, UserId};
use imgen_service::Worker;
use serde_json::json;

const RESULT_URL: &str = "https://tempfile.example/outputs/fox.png";

async fn balance(harness: &TestHarness) -> (i64, i64) {
    let body: serde_json::Value = harness
        .authed(harness.server.get("/v1/credits/balance"))
        .await
        .json();
    (
        body["available"].as_i64().unwrap(),
        body["held"].as_i64().unwrap(),
    )
}

async fn submit(harness: &TestHarness) -> String {
    let response = harness
        .authed(harness.server.post("/v1/jobs"))
        .json(&json!({ "prompt": "a red fox in snow" }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    body["job_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn submit_holds_cost_and_rejects_overspend() {
    let harness = TestHarness::new().await;
    harness.fund(100).await;
    harness.accept_tasks("task-hold").await;

    let response = harness
        .authed(harness.server.post("/v1/jobs"))
        .json(&json!({ "prompt": "a red fox in snow" }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["cost"], 100);
    assert_eq!(body["state"], "created");

    let second = harness
        .authed(harness.server.post("/v1/jobs"))
        .json(&json!({ "prompt": "another fox" }))
        .await;
    second.assert_status(StatusCode::PAYMENT_REQUIRED);
    let error: serde_json::Value = second.json();
    assert_eq!(error["error"]["code"], "insufficient_credits");
    assert_eq!(error["error"]["details"]["available"], 0);
    assert_eq!(error["error"]["details"]["required"], 100);

    assert_eq!(balance(&harness).await, (0, 100));
}

#[tokio::test]
async fn submit_without_account_is_payment_required() {
    let harness = TestHarness::new().await;

    harness
        .authed(harness.server.post("/v1/jobs"))
        .json(&json!({ "prompt": "a red fox" }))
        .await
        .assert_status(StatusCode::PAYMENT_REQUIRED);
}

#[tokio::test]
async fn invalid_request_holds_nothing() {
    let harness = TestHarness::new().await;
    harness.fund(500).await;

    harness
        .authed(harness.server.post("/v1/jobs"))
        .json(&json!({ "prompt": "   " }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    assert_eq!(balance(&harness).await, (500, 0));
}

#[tokio::test]
async fn successful_job_settles_hold() {
    let harness = TestHarness::new().await;
    harness.fund(250).await;
    harness.accept_tasks("task-ok").await;

    let job_id = submit(&harness).await;
    harness.wait_for_job_state(&job_id, "waiting").await;
    assert_eq!(balance(&harness).await, (150, 100));

    harness
        .report_record(json!({
            "taskId": "task-ok",
            "state": "success",
            "resultJson": format!(r#"{{"resultUrls":["{RESULT_URL}"]}}"#)
        }))
        .await;
    assert_eq!(harness.state.jobs.poll_pending().await.unwrap(), 1);

    let job: serde_json::Value = harness
        .authed(harness.server.get(&format!("/v1/jobs/{job_id}")))
        .await
        .json();
    assert_eq!(job["state"], "succeeded");
    assert_eq!(job["result_url"], RESULT_URL);
    assert!(job["completed_at"].is_string());
    assert!(job.get("error").is_none());

    assert_eq!(balance(&harness).await, (150, 0));

    // Polling again changes nothing.
    assert_eq!(harness.state.jobs.poll_pending().await.unwrap(), 0);
    assert_eq!(balance(&harness).await, (150, 0));
}

#[tokio::test]
async fn failed_job_refunds_hold() {
    let harness = TestHarness::new().await;
    harness.fund(100).await;
    harness.accept_tasks("task-bad").await;

    let job_id = submit(&harness).await;
    harness.wait_for_job_state(&job_id, "waiting").await;

    harness
        .report_record(json!({
            "taskId": "task-bad",
            "state": "fail",
            "failCode": "500",
            "failMsg": "content policy"
        }))
        .await;
    assert_eq!(harness.state.jobs.poll_pending().await.unwrap(), 1);

    let job: serde_json::Value = harness
        .authed(harness.server.get(&format!("/v1/jobs/{job_id}")))
        .await
        .json();
    assert_eq!(job["state"], "failed");
    assert_eq!(job["error"], "generation failed, credit refunded");
    assert!(job.get("result_url").is_none());

    assert_eq!(balance(&harness).await, (100, 0));
}

#[tokio::test]
async fn provider_callback_is_confirmed_and_applied_once() {
    let harness = TestHarness::new().await;
    harness.fund(100).await;
    harness.accept_tasks("task-cb").await;

    let job_id = submit(&harness).await;
    harness.wait_for_job_state(&job_id, "waiting").await;

    harness
        .report_record(json!({
            "taskId": "task-cb",
            "state": "success",
            "resultJson": { "resultUrls": [RESULT_URL] }
        }))
        .await;

    let callback = json!({
        "code": 200,
        "msg": "Playground task completed successfully.",
        "data": {
            "taskId": "task-cb",
            "state": "success",
            "resultJson": format!(r#"{{"resultUrls":["{RESULT_URL}"]}}"#)
        }
    });

    let first = harness.server.post("/webhooks/provider").json(&callback).await;
    first.assert_status_ok();
    let body: serde_json::Value = first.json();
    assert_eq!(body["outcome"], "finalized");

    for _ in 0..5 {
        let replay = harness.server.post("/webhooks/provider").json(&callback).await;
        replay.assert_status_ok();
        let body: serde_json::Value = replay.json();
        assert_eq!(body["outcome"], "already_processed");
    }

    let job = harness.wait_for_job_state(&job_id, "succeeded").await;
    assert_eq!(job["result_url"], RESULT_URL);
    assert_eq!(balance(&harness).await, (0, 0));
}

#[tokio::test]
async fn callback_for_unknown_task_is_ignored() {
    let harness = TestHarness::new().await;

    let response = harness
        .server
        .post("/webhooks/provider")
        .json(&json!({
            "code": 200,
            "data": { "taskId": "never-submitted", "state": "success" }
        }))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["outcome"], "ignored");
}

#[tokio::test]
async fn malformed_callback_is_rejected() {
    let harness = TestHarness::new().await;

    harness
        .server
        .post("/webhooks/provider")
        .text("not json")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn jobs_are_private_to_their_owner() {
    let harness = TestHarness::new().await;
    harness.fund(100).await;
    harness.accept_tasks("task-private").await;

    let job_id = submit(&harness).await;

    let stranger = token_for(&UserId::generate());
    with_bearer(harness.server.get(&format!("/v1/jobs/{job_id}")), &stranger)
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn malformed_job_id_is_bad_request() {
    let harness = TestHarness::new().await;

    harness
        .authed(harness.server.get("/v1/jobs/not-a-ulid"))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn worker_tick_dispatches_stranded_job() {
    let harness = TestHarness::new().await;
    harness.fund(100).await;
    harness.accept_tasks("task-stranded").await;
    harness
        .report_record(json!({ "taskId": "task-stranded", "state": "waiting" }))
        .await;

    // Persisted with a hold, but no background dispatch was spawned.
    let job = harness
        .state
        .jobs
        .submit_job(harness.test_user_id, GenerationRequest::new("a lost fox"))
        .unwrap();

    Worker::from_state(&harness.state).tick().await;

    let body: serde_json::Value = harness
        .authed(harness.server.get(&format!("/v1/jobs/{}", job.id)))
        .await
        .json();
    assert_eq!(body["state"], "waiting");
    assert_eq!(balance(&harness).await, (0, 100));
}
