mod common;

use std::io;
use std::sync::{Arc, Mutex};

use aws_smithy_types::body::SdkBody;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tibber_aws::{LogQuery, Logs};

use common::{body, operations, replay_session, response};

/// Collects formatted log lines.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn page(event_id: &str, next_token: Option<&str>) -> http::Response<SdkBody> {
    let mut page = json!({
        "events": [{
            "logStreamName": "ecs/api/1",
            "timestamp": 1_670_371_200_000_i64,
            "message": json!({"event": "Request", "body": {"id": event_id}}).to_string(),
            "ingestionTime": 1_670_371_201_000_i64,
            "eventId": event_id
        }],
        "searchedLogStreams": []
    });
    if let Some(token) = next_token {
        page["nextToken"] = Value::String(token.to_string());
    }
    response(200, page.to_string())
}

fn query() -> LogQuery {
    LogQuery::new(
        "Request",
        "prod-api",
        Utc.with_ymd_and_hms(2022, 12, 7, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2022, 12, 15, 0, 0, 0).unwrap(),
    )
}

#[tokio::test]
async fn next_token_is_passed_back() {
    let (session, http_client) = replay_session(
        "eu-west-1",
        vec![page("1", Some("page-2")), page("2", None)],
    );
    let logs = Logs::new(session);

    let events = logs.get_log_events(&query()).await.unwrap();

    let ids: Vec<_> = events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, ["1", "2"]);
    assert_eq!(events[1].message["body"]["id"], "2");
    assert_eq!(
        operations(&http_client),
        ["FilterLogEvents", "FilterLogEvents"]
    );

    let requests: Vec<_> = http_client.actual_requests().collect();
    let first: Value = serde_json::from_str(&body(requests[0])).unwrap();
    let second: Value = serde_json::from_str(&body(requests[1])).unwrap();
    assert_eq!(first["logGroupName"], "prod-api");
    assert_eq!(first["filterPattern"], r#"{ ( $.event = "Request" ) }"#);
    assert_eq!(first["startTime"], 1_670_371_200_000_i64);
    assert!(first.get("nextToken").is_none());
    assert_eq!(second["nextToken"], "page-2");
}

#[tokio::test]
async fn pagination_stops_at_max_recursion() {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let captured = captured.clone();
            move || captured.clone()
        })
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (session, http_client) = replay_session(
        "eu-west-1",
        vec![
            page("1", Some("page-2")),
            page("2", Some("page-3")),
            page("3", None),
        ],
    );
    let logs = Logs::new(session);

    let capped = query().max_recursion(2);
    let events = logs.get_log_events(&capped).await.unwrap();

    assert_eq!(events.len(), 2);
    assert_eq!(http_client.actual_requests().count(), 2);
    assert!(
        captured.contents().contains("hit max recursion"),
        "{}",
        captured.contents()
    );
}
