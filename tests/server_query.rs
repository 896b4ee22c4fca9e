//! End-to-end tests: spool ingestion, state queries, and egress records.

mod common;

use common::{TestServer, client};
use serde_json::json;

fn input_record(kind: &str, event: serde_json::Value) -> String {
    json!({"kind": kind, "event_json": event}).to_string()
}

fn room_fixture() -> Vec<String> {
    vec![
        input_record(
            "outlier",
            json!({
                "event_id": "$create:h", "room_id": "!r:h", "sender": "@alice:h",
                "type": "m.room.create", "state_key": "", "depth": 1,
                "prev_events": [], "content": {}
            }),
        ),
        input_record(
            "join",
            json!({
                "event_id": "$alice:h", "room_id": "!r:h", "sender": "@alice:h",
                "type": "m.room.member", "state_key": "@alice:h", "depth": 2,
                "prev_events": ["$create:h"], "content": {"membership": "join"}
            }),
        ),
        input_record(
            "new",
            json!({
                "event_id": "$msg:h", "room_id": "!r:h", "sender": "@alice:h",
                "type": "m.room.message", "depth": 3,
                "prev_events": ["$alice:h"], "content": {"body": "hi"}
            }),
        ),
    ]
}

#[tokio::test]
async fn unknown_room_reports_not_exists_with_http_200() {
    let server = TestServer::spawn(7711, &[], None).await.unwrap();

    let (status, body) = client::post_json(
        server.port(),
        "/query/latestEventsAndState",
        &json!({"room_id": "!nowhere:h"}),
    )
    .await
    .unwrap();

    assert_eq!(status, 200);
    assert_eq!(body["room_exists"], json!(false));
    assert_eq!(body["latest_events"], json!([]));
    assert_eq!(body["state_events"], json!([]));
}

#[tokio::test]
async fn ingests_spool_and_serves_state() {
    let server = TestServer::spawn(7712, &room_fixture(), None).await.unwrap();
    // The outlier emits nothing; join + message emit one record each.
    server.wait_for_offset(2).await.unwrap();

    let (status, body) = client::post_json(
        server.port(),
        "/query/latestEventsAndState",
        &json!({
            "room_id": "!r:h",
            "state_to_fetch": [
                {"event_type": "m.room.member", "state_keys": ["@alice:h"]}
            ]
        }),
    )
    .await
    .unwrap();

    assert_eq!(status, 200);
    assert_eq!(body["room_exists"], json!(true));
    let latest = body["latest_events"].as_array().unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0]["event_id"], json!("$msg:h"));
    let state = body["state_events"].as_array().unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state[0]["event_id"], json!("$alice:h"));

    // Egress records decode and the join carries the reset flag.
    let outputs = server.output_records();
    assert_eq!(outputs.len(), 2);
    let first: serde_json::Value = serde_json::from_str(&outputs[0]).unwrap();
    assert_eq!(first["reset_state"], json!(true));
    assert_eq!(first["add_state"], json!(["$alice:h"]));

    let (status, body) = client::post_json(
        server.port(),
        "/query/eventExists",
        &json!({"event_ids": ["$msg:h", "$missing:h"]}),
    )
    .await
    .unwrap();
    assert_eq!(status, 200);
    assert_eq!(body["exists"], json!([true, false]));

    let (status, metrics) = client::get(server.port(), "/metrics").await.unwrap();
    assert_eq!(status, 200);
    assert!(metrics.contains("roomserver_events_processed_total"));
}

#[tokio::test]
async fn stop_after_drains_the_budget_and_exits() {
    let mut server = TestServer::spawn(7713, &room_fixture(), Some(3)).await.unwrap();
    // With the budget drained the process shuts itself down; the egress
    // holds exactly the two non-outlier records.
    server.wait_for_exit().await.unwrap();
    assert_eq!(server.output_records().len(), 2);
}
