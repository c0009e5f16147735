use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use tower::ServiceExt; // for oneshot

use safesend::{app, build_state, AppConfig, PolicyMode};

fn router(config: AppConfig) -> Router {
    app(build_state(config))
}

async fn post(app: Router, token: Option<&str>, body: Value) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/evaluate-send")
        .header("content-type", "application/json");
    if let Some(t) = token {
        builder = builder.header("authorization", format!("Bearer {}", t));
    }
    let req = builder.body(Body::from(body.to_string())).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let v = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, v)
}

#[tokio::test]
async fn warn_once_round_trip_through_custom_properties() {
    let app = router(AppConfig::default());
    let mut request = json!({
        "itemId": "draft-1",
        "itemType": "message",
        "to": "alice@paytm.com; bob@gmail.com",
        "subject": "Numbers",
        "customProperties": {}
    });

    let (status, first) = post(app.clone(), Some("t"), request.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["allowEvent"], json!(false));
    assert_eq!(first["outcome"], json!("blocked_first_warning"));
    assert!(first["errorMessage"].as_str().unwrap().contains("bob@gmail.com"));
    assert_eq!(first["externalRecipients"], json!(["bob@gmail.com"]));
    assert_eq!(first["customProperties"]["WarningShown_V1"], json!("yes"));

    request["customProperties"] = first["customProperties"].clone();
    let (_, second) = post(app, Some("t"), request).await;
    assert_eq!(second["allowEvent"], json!(true));
    assert_eq!(second["outcome"], json!("allowed_second_attempt"));
    assert!(second.get("errorMessage").is_none());
    assert!(second["customProperties"].get("WarningShown_V1").is_none());
    assert_eq!(second["subject"], json!("[External] Numbers"));
}

#[tokio::test]
async fn confirm_mode_returns_rewritten_fields() {
    let app = router(AppConfig {
        policy_mode: PolicyMode::Confirm,
        ..Default::default()
    });
    let (status, v) = post(
        app,
        Some("t"),
        json!({
            "to": [
                {"emailAddress": "a@paytm.com", "displayName": "A"},
                {"emailAddress": "b@evil.com"},
                {"emailAddress": "c@paytm.com"}
            ],
            "subject": "Plan",
            "dialogReply": "remove_and_send"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["allowEvent"], json!(true));
    assert_eq!(v["outcome"], json!("remediated"));
    assert_eq!(
        v["recipients"]["to"],
        json!([
            {"emailAddress": "a@paytm.com", "displayName": "A"},
            {"emailAddress": "c@paytm.com", "displayName": null}
        ])
    );
    assert!(v.get("subject").is_none());
    assert!(v["dialogUrl"].as_str().unwrap().starts_with("https://localhost/dialog.html?"));
}

#[tokio::test]
async fn confirm_without_reply_blocks() {
    let app = router(AppConfig::default());
    let (_, v) = post(
        app,
        Some("t"),
        json!({ "to": "bob@gmail.com", "mode": "confirm" }),
    )
    .await;
    assert_eq!(v["allowEvent"], json!(false));
    assert_eq!(v["outcome"], json!("blocked"));
    assert!(v["errorMessage"].is_string());
}

#[tokio::test]
async fn failed_field_fails_open() {
    let app = router(AppConfig::default());
    let (_, v) = post(
        app,
        Some("t"),
        json!({
            "to": "bob@gmail.com",
            "cc": {"status": "failed", "error": "timeout"}
        }),
    )
    .await;
    assert_eq!(v["allowEvent"], json!(true));
    assert_eq!(v["outcome"], json!("allowed"));
}

#[tokio::test]
async fn appointment_reads_attendees_only() {
    let app = router(AppConfig::default());
    let (_, v) = post(
        app,
        Some("t"),
        json!({
            "itemType": "appointment",
            "to": "ignored@gmail.com",
            "requiredAttendees": "lead@paytm.com",
            "optionalAttendees": [{"emailAddress": "guest@partner.io"}]
        }),
    )
    .await;
    assert_eq!(v["outcome"], json!("blocked_first_warning"));
    assert_eq!(v["externalRecipients"], json!(["guest@partner.io"]));
}

#[tokio::test]
async fn uncaptured_subject_is_left_alone() {
    let app = router(AppConfig::default());
    let (_, v) = post(
        app,
        Some("t"),
        json!({
            "to": "bob@gmail.com",
            "customProperties": {"WarningShown_V1": "yes"}
        }),
    )
    .await;
    assert_eq!(v["outcome"], json!("allowed_second_attempt"));
    assert!(v.get("subject").is_none());
}

#[tokio::test]
async fn bearer_token_is_required() {
    let (status, v) = post(router(AppConfig::default()), None, json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(v["errorCode"], json!(2001));
    assert_eq!(v["httpStatus"], json!(401));

    let strict = AppConfig {
        allowed_tokens: Some(HashSet::from(["good".to_string()])),
        ..Default::default()
    };
    let (status, _) = post(router(strict.clone()), Some("bad"), json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = post(router(strict), Some("good"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let app = router(AppConfig {
        max_request_bytes: Some(64),
        ..Default::default()
    });
    let body = json!({ "to": "x".repeat(200) }).to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/evaluate-send")
        .header("content-type", "application/json")
        .header("authorization", "Bearer t")
        .header("content-length", body.len().to_string())
        .body(Body::from(body))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // Without a declared length the extractor limit still applies.
    let body = json!({ "to": "y".repeat(200) }).to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/evaluate-send")
        .header("content-type", "application/json")
        .header("authorization", "Bearer t")
        .body(Body::from(body))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), hyper::StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn healthz_reports_configuration() {
    let app = router(AppConfig {
        policy_mode: PolicyMode::Confirm,
        hook_order: vec!["subject_tag".into(), "warning_footer".into()],
        ..Default::default()
    });
    let req = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let v: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["status"], json!("ok"));
    assert_eq!(v["mode"], json!("confirm"));
    assert_eq!(v["matchMode"], json!("suffix"));
    assert_eq!(v["hookCount"], json!(2));
}

#[tokio::test]
async fn metrics_count_outcomes_over_http() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(AppConfig::default());
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let url = format!("http://{}/evaluate-send", addr);
    for to in ["a@paytm.com", "bob@gmail.com", "eve@evil.com"] {
        let resp = client
            .post(&url)
            .header("Authorization", "Bearer t")
            .json(&json!({ "to": to }))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }

    let text = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("safesend_requests_total 3"));
    assert!(text.contains("safesend_blocks_total 2"));
    assert!(text.contains("safesend_decisions_total{outcome=\"allowed\"} 1"));
    assert!(text.contains("safesend_decisions_total{outcome=\"blocked_first_warning\"} 2"));
    assert!(text.contains("safesend_request_latency_ms_bucket{le=\"+Inf\"} 3"));
    assert_eq!(text.matches("# HELP safesend_decisions_total").count(), 1);
    assert!(text.contains("safesend_process_uptime_seconds"));
    handle.abort();
}
