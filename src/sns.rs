use std::any::{type_name, TypeId};
use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::{LazyClient, Session};

/// An SNS topic, created on construction if it does not exist yet.
pub struct Topic {
    session: Session,
    topic_arn: String,
    client: LazyClient<aws_sdk_sns::Client>,
}

impl Topic {
    pub async fn create(session: Session, topic_name: &str) -> Result<Self> {
        let client: LazyClient<aws_sdk_sns::Client> = LazyClient::new();
        let topic_arn = client
            .client(&session)
            .await
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
        debug!(topic = %topic_arn, "topic ready");

        Ok(Self {
            session,
            topic_arn,
            client,
        })
    }

    pub fn topic_arn(&self) -> &str {
        &self.topic_arn
    }

    /// Publishes `message` with the `json` message structure, the same
    /// payload for every protocol.
    pub async fn publish<T: Serialize + ?Sized>(&self, subject: &str, message: &T) -> Result<()> {
        let body = json_structured_message(message)?;
        self.client
            .client(&self.session)
            .await
            .publish()
            .target_arn(&self.topic_arn)
            .message(body)
            .subject(subject)
            .message_structure("json")
            .send()
            .await
            .map_err(|e| Error::service("sns", e))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

pub(crate) fn json_structured_message<T: Serialize + ?Sized>(message: &T) -> Result<String> {
    let encoded = serde_json::to_string(message)?;
    Ok(json!({ "default": encoded }).to_string())
}

/// An event published through [`SnsPublisher`].
///
/// Timestamps should be `chrono` types so they serialize as ISO-8601.
pub trait SnsEvent: Serialize {
    fn subject(&self) -> &str;

    fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Publishes events to the topic registered for their type.
///
/// ```no_run
/// # async fn demo(session: tibber_aws::Session) -> tibber_aws::Result<()> {
/// use serde::Serialize;
/// use tibber_aws::sns::{SnsEvent, SnsPublisher};
///
/// #[derive(Serialize)]
/// struct PriceAboveThreshold {
///     #[serde(rename = "homeId")]
///     home_id: String,
/// }
///
/// impl SnsEvent for PriceAboveThreshold {
///     fn subject(&self) -> &str {
///         "Price above threshold"
///     }
/// }
///
/// let publisher = SnsPublisher::new(session)
///     .with_topic::<PriceAboveThreshold>("arn:aws:sns:eu-west-1:123456789012:prices");
/// publisher
///     .publish(&PriceAboveThreshold { home_id: "123".into() })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SnsPublisher {
    session: Session,
    topics: HashMap<TypeId, String>,
    client: LazyClient<aws_sdk_sns::Client>,
}

impl SnsPublisher {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            topics: HashMap::new(),
            client: LazyClient::new(),
        }
    }

    pub fn with_topic<E: SnsEvent + 'static>(mut self, topic_arn: impl Into<String>) -> Self {
        self.topics.insert(TypeId::of::<E>(), topic_arn.into());
        self
    }

    pub fn topic_for<E: SnsEvent + 'static>(&self) -> Result<&str> {
        self.topics
            .get(&TypeId::of::<E>())
            .map(String::as_str)
            .ok_or(Error::UnmappedEvent(type_name::<E>()))
    }

    pub async fn publish<E: SnsEvent + 'static>(&self, event: &E) -> Result<()> {
        let topic_arn = self.topic_for::<E>()?;
        let message = event.to_json()?;
        info!(topic = %topic_arn, subject = event.subject(), "publishing event");

        self.client
            .client(&self.session)
            .await
            .publish()
            .topic_arn(topic_arn)
            .message(message)
            .subject(event.subject())
            .send()
            .await
            .map_err(|e| Error::service("sns", e))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}
