use rocket::http::{ContentType, Header, Status};

use crate::common::{test_client, BOB_TOKEN, SUSPENDED_TOKEN};

fn auth_header(token: &str) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {token}"))
}

#[test]
fn missing_bearer_is_rejected() {
    let client = test_client();
    let res = client
        .post("/byoa/sse/messages")
        .header(ContentType::JSON)
        .body(r#"{"room_id":"room-1","content":"hi"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["code"], "AUTH_FAILURE");
}

#[test]
fn unknown_token_is_rejected() {
    let client = test_client();
    let res = client
        .post("/byoa/sse/messages")
        .header(ContentType::JSON)
        .header(auth_header("not-a-real-token"))
        .body(r#"{"room_id":"room-1","content":"hi"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn suspended_agent_is_rejected() {
    let client = test_client();
    let res = client
        .post("/byoa/sse/messages")
        .header(ContentType::JSON)
        .header(auth_header(SUSPENDED_TOKEN))
        .body(r#"{"room_id":"room-1","content":"hi"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn empty_content_is_invalid_input() {
    let client = test_client();
    let res = client
        .post("/byoa/sse/messages")
        .header(ContentType::JSON)
        .header(auth_header(BOB_TOKEN))
        .body(r#"{"room_id":"room-1","content":""}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["code"], "INVALID_INPUT");
}

#[test]
fn content_over_4000_chars_is_rejected_before_reaching_upstream() {
    let client = test_client();
    let content = "a".repeat(4001);
    let payload = serde_json::json!({"room_id": "room-1", "content": content}).to_string();
    let res = client
        .post("/byoa/sse/messages")
        .header(ContentType::JSON)
        .header(auth_header(BOB_TOKEN))
        .body(payload)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["code"], "INVALID_INPUT");
}

#[test]
fn content_of_exactly_4000_chars_passes_validation() {
    let client = test_client();
    let content = "a".repeat(4000);
    let payload = serde_json::json!({"room_id": "room-1", "content": content}).to_string();
    let res = client
        .post("/byoa/sse/messages")
        .header(ContentType::JSON)
        .header(auth_header(BOB_TOKEN))
        .body(payload)
        .dispatch();
    // Validation passes; with no reachable upstream the bridge never
    // reaches `Connected`, so this is a bridge-unavailable 503, not an
    // INVALID_INPUT — the boundary under test is the length check, not
    // delivery success.
    assert_eq!(res.status(), Status::ServiceUnavailable);
    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["code"], "BRIDGE_UNAVAILABLE");
}

#[test]
fn rate_limit_headers_present_and_standard_trust_caps_at_ten_per_minute() {
    let client = test_client();

    for i in 0..10 {
        let res = client
            .post("/byoa/sse/messages")
            .header(ContentType::JSON)
            .header(auth_header(BOB_TOKEN))
            .body(r#"{"room_id":"room-1","content":""}"#)
            .dispatch();
        assert_eq!(res.status(), Status::BadRequest, "request {i} should fail validation, not rate limit");
    }

    let res = client
        .post("/byoa/sse/messages")
        .header(ContentType::JSON)
        .header(auth_header(BOB_TOKEN))
        .body(r#"{"room_id":"room-1","content":""}"#)
        .dispatch();
    assert_eq!(res.status(), Status::TooManyRequests);
    assert_eq!(res.headers().get_one("X-RateLimit-Limit"), Some("10"));
    assert_eq!(res.headers().get_one("X-RateLimit-Remaining"), Some("0"));
    assert!(res.headers().get_one("Retry-After").is_some());

    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["error"], "RATE_LIMITED");
    assert!(body["retryAfter"].as_u64().unwrap() > 0);
}

#[test]
fn legacy_send_requires_auth_and_reports_bridge_unavailable() {
    let client = test_client();
    let res = client
        .post("/send")
        .header(ContentType::JSON)
        .body(r#"{"room":"room-1","content":"hi"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    // With no reachable upstream the bridge never reaches `Connected`, so
    // an authenticated send is short-circuited to 503 before a doomed
    // `sendAs` call is even attempted.
    let res = client
        .post("/send")
        .header(ContentType::JSON)
        .header(auth_header(BOB_TOKEN))
        .body(r#"{"room":"room-1","content":"hi"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::ServiceUnavailable);
    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["code"], "BRIDGE_UNAVAILABLE");
}
