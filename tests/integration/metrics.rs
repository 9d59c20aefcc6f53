use rocket::http::{ContentType, Status};

use crate::common::test_client;

#[test]
fn metrics_json_reports_zeroed_counters_on_a_fresh_gateway() {
    let client = test_client();
    let res = client.get("/metrics/json").dispatch();
    assert_eq!(res.status(), Status::Ok);

    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["active_connections"], 0);
    assert_eq!(body["total_connections"], 0);
    assert_eq!(body["messages_sent"], 0);
    assert_eq!(body["messages_lost"], 0);
    assert_eq!(body["registry_last_refresh_ok"], true);
    assert_eq!(body["registry_consecutive_failures"], 0);
}

#[test]
fn metrics_report_is_a_human_readable_summary() {
    let client = test_client();
    let res = client.get("/metrics").dispatch();
    assert_eq!(res.status(), Status::Ok);

    let body = res.into_string().expect("text body");
    assert!(body.contains("Agent Gateway"));
    assert!(body.contains("active connections"));
}

#[test]
fn auth_failure_is_reflected_in_the_next_metrics_snapshot() {
    let client = test_client();
    let res = client
        .post("/send")
        .header(ContentType::JSON)
        .body(r#"{"room":"room-1","content":"hi"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client.get("/metrics/json").dispatch();
    let body: serde_json::Value = res.into_json().expect("json body");
    assert_eq!(body["auth_failures"], 1);
}
