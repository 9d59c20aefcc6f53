use rocket::http::Status;

use crate::common::test_client;

#[test]
fn health_reports_ok_and_no_connected_agents_without_sessions() {
    let client = test_client();
    let res = client.get("/health").dispatch();
    assert_eq!(res.status(), Status::Ok);

    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["bridge_connected"], false);
    assert_eq!(body["connected_agents"], serde_json::json!([]));
}

#[test]
fn sse_health_is_unauthenticated_liveness() {
    let client = test_client();
    let res = client.get("/byoa/sse/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["status"], "ok");
}

#[test]
fn unknown_path_returns_structured_404() {
    let client = test_client();
    let res = client.get("/does/not/exist").dispatch();
    assert_eq!(res.status(), Status::NotFound);
    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["code"], "NOT_FOUND");
}
