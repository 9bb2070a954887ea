//! SQS queue subscribed to an SNS topic, to produce and consume messages.

use aws_sdk_sqs::operation::send_message::SendMessageOutput;
use aws_sdk_sqs::types::QueueAttributeName;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::{LazyClient, Session};

const SOURCE_ARN: &str = "aws:SourceArn";

/// A message received from [`Queue::receive_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: Option<String>,
    pub body: String,
    pub receipt_handle: String,
}

pub struct Queue {
    session: Session,
    queue_name: String,
    queue_url: OnceCell<String>,
    client: LazyClient<aws_sdk_sqs::Client>,
}

impl Queue {
    pub fn new(session: Session, queue_name: impl Into<String>) -> Self {
        Self {
            session,
            queue_name: queue_name.into(),
            queue_url: OnceCell::new(),
            client: LazyClient::new(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// `None` until [`Queue::subscribe_topic`] has run.
    pub fn queue_url(&self) -> Option<&str> {
        self.queue_url.get().map(String::as_str)
    }

    /// Creates the queue and the topic if needed, allows the topic to send
    /// to the queue and subscribes the queue to it.
    pub async fn subscribe_topic(&self, topic_name: &str) -> Result<()> {
        let sqs = self.client.client(&self.session).await;

        let created = sqs
            .create_queue()
            .queue_name(&self.queue_name)
            .send()
            .await
            .map_err(|e| Error::service("sqs", e))?;
        let queue_url = created
            .queue_url()
            .ok_or(Error::MissingField {
                service: "sqs",
                field: "QueueUrl",
            })?
            .to_string();

        let attributes = sqs
            .get_queue_attributes()
            .queue_url(&queue_url)
            .attribute_names(QueueAttributeName::All)
            .send()
            .await
            .map_err(|e| Error::service("sqs", e))?;
        let attributes = attributes.attributes();
        let queue_arn = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .ok_or(Error::MissingField {
                service: "sqs",
                field: "QueueArn",
            })?
            .clone();
        let current_policy = attributes.and_then(|attrs| attrs.get(&QueueAttributeName::Policy));

        let sns: aws_sdk_sns::Client = self.session.client();
        let topic_arn = sns
            .create_topic()
            .name(topic_name)
            .send()
            .await
            .map_err(|e| Error::service("sns", e))?
            .topic_arn()
            .ok_or(Error::MissingField {
                service: "sns",
                field: "TopicArn",
            })?
            .to_string();

        let policy = match current_policy {
            Some(policy) => serde_json::from_str(policy)?,
            None => default_policy(Utc::now().timestamp()),
        };
        if let Some(policy) = allow_source_arn(policy, &queue_arn, &topic_arn)? {
            info!(queue = %self.queue_name, topic = %topic_arn, "granting topic access to queue");
            sqs.set_queue_attributes()
                .queue_url(&queue_url)
                .attributes(QueueAttributeName::Policy, policy.to_string())
                .send()
                .await
                .map_err(|e| Error::service("sqs", e))?;
        }

        sns.subscribe()
            .topic_arn(&topic_arn)
            .protocol("sqs")
            .endpoint(&queue_arn)
            .send()
            .await
            .map_err(|e| Error::service("sns", e))?;
        debug!(queue = %self.queue_name, topic = %topic_arn, "queue subscribed");

        // A repeated subscription resolves the same url.
        let _ = self.queue_url.set(queue_url);
        Ok(())
    }

    /// Receives up to `num_msgs` messages.
    pub async fn receive_message(&self, num_msgs: i32) -> Result<Vec<QueueMessage>> {
        let queue_url = self.queue_url().ok_or(Error::NotSubscribed)?;
        let sqs = self.client.client(&self.session).await;

        let response = sqs
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(num_msgs)
            .send()
            .await
            .map_err(|e| Error::service("sqs", e))?;

        Ok(response
            .messages()
            .iter()
            .filter_map(|msg| {
                Some(QueueMessage {
                    message_id: msg.message_id().map(str::to_string),
                    body: msg.body()?.to_string(),
                    receipt_handle: msg.receipt_handle()?.to_string(),
                })
            })
            .collect())
    }

    pub async fn delete_message(&self, message: &QueueMessage) -> Result<()> {
        let queue_url = self.queue_url().ok_or(Error::NotSubscribed)?;
        let sqs = self.client.client(&self.session).await;

        sqs.delete_message()
            .queue_url(queue_url)
            .receipt_handle(&message.receipt_handle)
            .send()
            .await
            .map_err(|e| Error::service("sqs", e))?;
        Ok(())
    }

    /// Publishes `message` as a JSON body.
    pub async fn send_message<T: Serialize + ?Sized>(
        &self,
        message: &T,
    ) -> Result<SendMessageOutput> {
        let queue_url = self.queue_url().ok_or(Error::NotSubscribed)?;
        let body = serde_json::to_string(message)?;
        let sqs = self.client.client(&self.session).await;

        sqs.send_message()
            .queue_url(queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| Error::service("sqs", e))
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

/// Policy used when the queue has none yet.
pub(crate) fn default_policy(now_secs: i64) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Sid": format!("Sid{now_secs}"),
                "Effect": "Allow",
                "Principal": {"AWS": "*"},
                "Action": ["sqs:SendMessage", "sqs:ReceiveMessage"],
            }
        ],
    })
}

/// Adds `topic_arn` to the `aws:SourceArn` condition of the first statement.
///
/// Returns the updated policy, or `None` when the topic is already allowed.
pub(crate) fn allow_source_arn(
    mut policy: Value,
    queue_arn: &str,
    topic_arn: &str,
) -> Result<Option<Value>> {
    let root = policy
        .as_object_mut()
        .ok_or_else(|| invalid_policy("document is not an object"))?;
    let statements = root.entry("Statement").or_insert_with(|| json!([{}]));
    if !statements.is_array() {
        let single = statements.take();
        *statements = Value::Array(vec![single]);
    }
    let statements = statements
        .as_array_mut()
        .ok_or_else(|| invalid_policy("Statement is not a list"))?;
    if statements.is_empty() {
        statements.push(json!({}));
    }

    let statement = statements[0]
        .as_object_mut()
        .ok_or_else(|| invalid_policy("Statement[0] is not an object"))?;
    statement
        .entry("Resource")
        .or_insert_with(|| Value::String(queue_arn.to_string()));

    let string_like = statement
        .entry("Condition")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| invalid_policy("Condition is not an object"))?
        .entry("StringLike")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| invalid_policy("Condition.StringLike is not an object"))?;

    let mut source_arns = match string_like.remove(SOURCE_ARN) {
        Some(Value::Array(arns)) => arns,
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single],
    };

    let allowed = source_arns
        .iter()
        .any(|arn| arn.as_str() == Some(topic_arn));
    if !allowed {
        source_arns.push(Value::String(topic_arn.to_string()));
    }
    string_like.insert(SOURCE_ARN.to_string(), Value::Array(source_arns));

    Ok((!allowed).then_some(policy))
}

fn invalid_policy(reason: &str) -> Error {
    Error::InvalidPolicy(reason.to_string())
}
