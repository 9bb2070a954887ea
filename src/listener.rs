//! Long-polling SQS listener for SNS notifications.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::session::{Session, DEFAULT_REGION};

/// AWS returns at most this many messages per receive call.
pub const MAX_MESSAGES_PER_RECEIVE: usize = 10;

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// SNS notification envelope delivered through SQS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqsMessage {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "TopicArn")]
    pub topic_arn: String,
    #[serde(rename = "Subject", default)]
    pub subject: String,
    /// The published payload, still encoded.
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "SignatureVersion", default)]
    pub signature_version: String,
    #[serde(rename = "Signature", default)]
    pub signature: String,
    #[serde(rename = "SigningCertURL", default)]
    pub signing_cert_url: String,
    #[serde(rename = "UnsubscribeURL", default)]
    pub unsubscribe_url: String,
}

impl SqsMessage {
    pub fn message_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.message)?)
    }
}

/// A received SQS message before its envelope is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub message_id: Option<String>,
    pub body: String,
    pub receipt_handle: String,
    pub receive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Messages processed concurrently, between 1 and 10.
    pub max_num_msgs: usize,
    pub wait_time_seconds: i32,
    /// Messages received more often than this are deleted unprocessed.
    pub max_retry_count: u32,
    pub region_name: String,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            max_num_msgs: 1,
            wait_time_seconds: 2,
            max_retry_count: 3,
            region_name: DEFAULT_REGION.to_string(),
        }
    }
}

impl ListenerOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_MESSAGES_PER_RECEIVE).contains(&self.max_num_msgs) {
            return Err(Error::InvalidOptions(format!(
                "max_num_msgs must be between 1 and {MAX_MESSAGES_PER_RECEIVE}, got {}",
                self.max_num_msgs
            )));
        }
        if self.wait_time_seconds < 0 {
            return Err(Error::InvalidOptions(format!(
                "wait_time_seconds must not be negative, got {}",
                self.wait_time_seconds
            )));
        }
        Ok(())
    }
}

/// Where the listener receives from and deletes in.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_seconds: i32,
    ) -> Result<Vec<MessageHandle>>;

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;
}

#[async_trait]
impl QueueBackend for aws_sdk_sqs::Client {
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_seconds: i32,
    ) -> Result<Vec<MessageHandle>> {
        let response = self
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| Error::service("sqs", e))?;

        Ok(response
            .messages()
            .iter()
            .filter_map(|msg| {
                let receive_count = msg
                    .attributes()
                    .and_then(|attrs| {
                        attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount)
                    })
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(1);
                Some(MessageHandle {
                    message_id: msg.message_id().map(str::to_string),
                    body: msg.body()?.to_string(),
                    receipt_handle: msg.receipt_handle()?.to_string(),
                    receive_count,
                })
            })
            .collect())
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| Error::service("sqs", e))?;
        Ok(())
    }
}

/// Processes decoded notifications.
///
/// `Ok(true)` marks the message as done and it is deleted from the queue.
/// `Ok(false)` and errors leave it for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: SqsMessage) -> Result<bool>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(SqsMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    HandlerFn { f }
}

pub struct HandlerFn<F> {
    f: F,
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(SqsMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    async fn handle(&self, message: SqsMessage) -> Result<bool> {
        (self.f)(message).await
    }
}

/// Dispatches notifications to handlers by their `Subject`.
#[derive(Default, Clone)]
pub struct SubjectRouter {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

impl SubjectRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, subject: impl Into<String>, handler: impl MessageHandler) -> Self {
        self.routes.insert(subject.into(), Arc::new(handler));
        self
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl fmt::Debug for SubjectRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectRouter")
            .field("subjects", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl MessageHandler for SubjectRouter {
    async fn handle(&self, message: SqsMessage) -> Result<bool> {
        match self.routes.get(&message.subject) {
            Some(handler) => handler.handle(message).await,
            None => {
                warn!(
                    subject = %message.subject,
                    message_id = %message.message_id,
                    "no handler for subject"
                );
                Ok(false)
            }
        }
    }
}

/// Decodes the envelope in `handle` and passes it to `handler`.
///
/// Returns whether the message should be deleted.
pub async fn process_envelope(
    handle: &MessageHandle,
    handler: &dyn MessageHandler,
) -> Result<bool> {
    let message: SqsMessage = serde_json::from_str(&handle.body)?;
    handler.handle(message).await
}

/// Receives from one queue and processes messages concurrently, at most
/// `max_num_msgs` at a time.
pub struct SqsListener<B = aws_sdk_sqs::Client> {
    backend: Arc<B>,
    queue_url: String,
    handler: Arc<dyn MessageHandler>,
    options: ListenerOptions,
}

impl SqsListener<aws_sdk_sqs::Client> {
    /// Builds a listener on an SQS client for `options.region_name`.
    pub async fn connect(
        queue_url: impl Into<String>,
        handler: impl MessageHandler,
        options: ListenerOptions,
    ) -> Result<Self> {
        options.validate()?;
        let session = Session::load(options.region_name.clone()).await;
        Self::with_backend(session.client(), queue_url, handler, options)
    }
}

impl<B: QueueBackend> SqsListener<B> {
    pub fn with_backend(
        backend: B,
        queue_url: impl Into<String>,
        handler: impl MessageHandler,
        options: ListenerOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            backend: Arc::new(backend),
            queue_url: queue_url.into(),
            handler: Arc::new(handler),
            options,
        })
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    /// Listens forever.
    pub async fn run(&self) {
        self.run_until(std::future::pending()).await
    }

    /// Listens until `shutdown` completes, then waits for in-flight messages.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            let capacity = self.options.max_num_msgs.saturating_sub(running.len());
            if capacity > 0 {
                tokio::select! {
                    _ = &mut shutdown => break,
                    received = self.backend.receive(
                        &self.queue_url,
                        capacity as i32,
                        self.options.wait_time_seconds,
                    ) => match received {
                        Ok(handles) => {
                            for handle in handles {
                                running.spawn(process_message(
                                    self.backend.clone(),
                                    self.queue_url.clone(),
                                    self.handler.clone(),
                                    self.options.max_retry_count,
                                    handle,
                                ));
                            }
                        }
                        Err(err) => {
                            error!(
                                queue_url = %self.queue_url,
                                error = %err,
                                "failed to receive messages"
                            );
                            tokio::select! {
                                _ = &mut shutdown => break,
                                _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                            }
                        }
                    }
                }
            }

            if !running.is_empty() {
                tokio::select! {
                    _ = &mut shutdown => break,
                    Some(joined) = running.join_next() => {
                        if let Err(err) = joined {
                            error!(error = %err, "message task failed");
                        }
                    }
                }
            }
        }

        debug!(in_flight = running.len(), "listener stopping");
        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "message task failed");
            }
        }
    }
}

async fn process_message<B: QueueBackend>(
    backend: Arc<B>,
    queue_url: String,
    handler: Arc<dyn MessageHandler>,
    max_retry_count: u32,
    handle: MessageHandle,
) {
    if handle.receive_count > max_retry_count {
        error!(
            receipt_handle = %handle.receipt_handle,
            body = %handle.body,
            receive_count = handle.receive_count,
            "message received too many times, deleting"
        );
        if let Err(err) = backend.delete(&queue_url, &handle.receipt_handle).await {
            error!(error = %err, "failed to delete message");
        }
        return;
    }

    match process_envelope(&handle, handler.as_ref()).await {
        Ok(true) => {
            if let Err(err) = backend.delete(&queue_url, &handle.receipt_handle).await {
                error!(message_id = ?handle.message_id, error = %err, "failed to delete message");
            }
        }
        Ok(false) => {
            debug!(message_id = ?handle.message_id, "message kept for redelivery");
        }
        Err(err) => {
            error!(message_id = ?handle.message_id, error = %err, "error in process_message");
        }
    }
}

/// Creates `queue_name` subscribed to `topic_name` and returns its url.
pub async fn create_queue_with_subscription(
    session: &Session,
    queue_name: &str,
    topic_name: &str,
) -> Result<String> {
    let queue = Queue::new(session.clone(), queue_name);
    queue.subscribe_topic(topic_name).await?;
    queue
        .queue_url()
        .map(str::to_string)
        .ok_or(Error::NotSubscribed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(subject: &str) -> String {
        json!({
            "Type": "Notification",
            "MessageId": "1f00b2a8-cfaa-58b6-852c-e83e24249122",
            "TopicArn": "arn:aws:sns:eu-west-1:945084044763:test-py-aws-topic",
            "Subject": subject,
            "Message": "{\n  \"Data\": \"Hello World\"\n}",
            "Timestamp": "2022-02-28T15:25:02.462Z",
            "SignatureVersion": "1",
            "Signature": "mdimGxOWejY+PLhumoZct7Tcsv13oFrutBwTm59BvbvbaDFgHfdHLkEKr9XlGPkKo85Ub",
            "SigningCertURL": "https://sns.eu-west-1.amazonaws.com/SimpleNotificationService.pem",
            "UnsubscribeURL": "https://sns.eu-west-1.amazonaws.com/?Action=Unsubscribe"
        })
        .to_string()
    }

    fn handle(body: String) -> MessageHandle {
        MessageHandle {
            message_id: Some("msg-1".to_string()),
            body,
            receipt_handle: "receipt-1".to_string(),
            receive_count: 1,
        }
    }

    async fn check_test_message(message: SqsMessage) -> Result<bool> {
        assert_eq!(message.kind, "Notification");
        assert_eq!(message.subject, "Test Message");
        assert_eq!(message.message_id, "1f00b2a8-cfaa-58b6-852c-e83e24249122");
        assert_eq!(message.message_json()?["Data"], "Hello World");
        Ok(true)
    }

    async fn accept(_message: SqsMessage) -> Result<bool> {
        Ok(true)
    }

    async fn fail(_message: SqsMessage) -> Result<bool> {
        Err(Error::Handler("boom".to_string()))
    }

    #[tokio::test]
    async fn envelope_reaches_handler() {
        let handler = handler_fn(check_test_message);

        let delete = process_envelope(&handle(notification("Test Message")), &handler)
            .await
            .unwrap();
        assert!(delete);
    }

    #[tokio::test]
    async fn router_dispatches_by_subject() {
        let router = SubjectRouter::new()
            .route("Test Message", handler_fn(accept))
            .route("Other", handler_fn(fail));

        assert!(process_envelope(&handle(notification("Test Message")), &router)
            .await
            .unwrap());
        assert!(process_envelope(&handle(notification("Other")), &router)
            .await
            .is_err());
        assert!(!process_envelope(&handle(notification("Unknown")), &router)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn malformed_body_is_an_error() {
        let handler = handler_fn(accept);
        let malformed = handle("not json".to_string());
        let result = process_envelope(&malformed, &handler).await;
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn missing_optional_fields_default() {
        let body = json!({
            "Type": "Notification",
            "MessageId": "id",
            "TopicArn": "arn",
            "Message": "{}",
            "Timestamp": "2022-02-28T15:25:02.462Z"
        });
        let message: SqsMessage = serde_json::from_value(body).unwrap();
        assert_eq!(message.subject, "");
        assert_eq!(message.unsubscribe_url, "");
    }

    #[test]
    fn options_bounds() {
        assert!(ListenerOptions::default().validate().is_ok());

        for max_num_msgs in [0, 11] {
            let options = ListenerOptions {
                max_num_msgs,
                ..Default::default()
            };
            assert!(matches!(options.validate(), Err(Error::InvalidOptions(_))));
        }

        let options = ListenerOptions {
            max_num_msgs: 10,
            ..Default::default()
        };
        assert!(options.validate().is_ok());
    }
}
