//! CloudWatch Logs queries over structured (JSON) log lines.

use aws_sdk_cloudwatchlogs::types::FilteredLogEvent;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::session::{LazyClient, Session};

pub const DEFAULT_MAX_RECURSION: usize = 10;

/// A single log line.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudWatchLogEvent {
    pub log_stream_name: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    /// The line decoded as JSON.
    pub message: Value,
    pub ingestion_time: i64,
    pub event_id: String,
}

impl CloudWatchLogEvent {
    pub fn timestamp_dt(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    pub fn ingestion_time_dt(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.ingestion_time)
    }

    fn from_filtered(event: &FilteredLogEvent) -> Result<Self> {
        Ok(Self {
            log_stream_name: event.log_stream_name().unwrap_or_default().to_string(),
            timestamp: event.timestamp().unwrap_or_default(),
            message: serde_json::from_str(event.message().unwrap_or_default())?,
            ingestion_time: event.ingestion_time().unwrap_or_default(),
            event_id: event.event_id().unwrap_or_default().to_string(),
        })
    }
}

/// Which events to fetch.
#[derive(Debug, Clone)]
pub struct LogQuery {
    /// Value of the `event` property.
    pub event: String,
    pub log_group: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Further `property path -> value` matches, e.g. `body.price_area -> NL`.
    pub extra_filter: Vec<(String, String)>,
    /// Upper bound on the number of pages fetched.
    pub max_recursion: usize,
}

impl LogQuery {
    pub fn new(
        event: impl Into<String>,
        log_group: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            event: event.into(),
            log_group: log_group.into(),
            start_time,
            end_time,
            extra_filter: Vec::new(),
            max_recursion: DEFAULT_MAX_RECURSION,
        }
    }

    pub fn filter(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_filter.push((property.into(), value.into()));
        self
    }

    pub fn max_recursion(mut self, max_recursion: usize) -> Self {
        self.max_recursion = max_recursion;
        self
    }

    pub fn pattern(&self) -> String {
        filter_pattern(
            &self.event,
            self.extra_filter
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }
}

/// Builds a JSON filter pattern matching `event` and every extra property.
pub fn filter_pattern<'a>(
    event: &str,
    extra_filter: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let mut clauses = vec![format!("( $.event = \"{event}\" )")];
    clauses.extend(
        extra_filter
            .into_iter()
            .map(|(property, value)| format!("( $.{property} = \"{value}\" )")),
    );
    format!("{{ {} }}", clauses.join(" && "))
}

pub struct Logs {
    session: Session,
    client: LazyClient<aws_sdk_cloudwatchlogs::Client>,
}

impl Logs {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            client: LazyClient::new(),
        }
    }

    /// Fetches the events matching `query`, following pagination for at
    /// most `query.max_recursion` pages.
    pub async fn get_log_events(&self, query: &LogQuery) -> Result<Vec<CloudWatchLogEvent>> {
        let client = self.client.client(&self.session).await;
        let pattern = query.pattern();
        let mut events = Vec::new();
        let mut next_token: Option<String> = None;
        let mut page = 1;

        loop {
            let response = client
                .filter_log_events()
                .log_group_name(&query.log_group)
                .start_time(query.start_time.timestamp_millis())
                .end_time(query.end_time.timestamp_millis())
                .filter_pattern(&pattern)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| Error::service("logs", e))?;

            info!(
                count = response.events().len(),
                pattern = %pattern,
                log_group = %query.log_group,
                page,
                "found log events"
            );
            for event in response.events() {
                events.push(CloudWatchLogEvent::from_filtered(event)?);
            }

            next_token = response.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
            if page >= query.max_recursion {
                warn!(
                    max_recursion = query.max_recursion,
                    "hit max recursion with more to fetch, increase max_recursion to get everything"
                );
                break;
            }
            info!(
                page,
                max_recursion = query.max_recursion,
                "more logs to fetch, using next token"
            );
            page += 1;
        }

        Ok(events)
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn pattern_for_event_only() {
        assert_eq!(filter_pattern("Request", []), r#"{ ( $.event = "Request" ) }"#);
    }

    #[test]
    fn pattern_keeps_filter_order() {
        let query = LogQuery::new(
            "Request",
            "prod-hem-api",
            Utc.with_ymd_and_hms(2022, 12, 7, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2022, 12, 15, 0, 0, 0).unwrap(),
        )
        .filter("body.area", "NL")
        .filter("body.kind", "ev");

        assert_eq!(
            query.pattern(),
            r#"{ ( $.event = "Request" ) && ( $.body.area = "NL" ) && ( $.body.kind = "ev" ) }"#
        );
        assert_eq!(query.max_recursion, DEFAULT_MAX_RECURSION);
    }

    #[test]
    fn filtered_event_is_decoded() {
        let raw = FilteredLogEvent::builder()
            .log_stream_name("ecs/api/1")
            .timestamp(1_670_371_200_000)
            .message(r#"{"event":"Request","body":{"price_area":"NL"}}"#)
            .ingestion_time(1_670_371_201_000)
            .event_id("3717")
            .build();

        let event = CloudWatchLogEvent::from_filtered(&raw).unwrap();
        assert_eq!(event.message["body"]["price_area"], "NL");
        assert_eq!(
            event.timestamp_dt(),
            Some(Utc.with_ymd_and_hms(2022, 12, 7, 0, 0, 0).unwrap())
        );
        assert_eq!(
            event.ingestion_time_dt(),
            Some(Utc.with_ymd_and_hms(2022, 12, 7, 0, 0, 1).unwrap())
        );
    }

    #[test]
    fn non_json_line_is_an_error() {
        let raw = FilteredLogEvent::builder().message("plain text").build();
        assert!(matches!(CloudWatchLogEvent::from_filtered(&raw), Err(Error::Json(_))));
    }
}
