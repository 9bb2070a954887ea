use serde_json::{Map, Value};
use tracing::error;

use crate::error::{Error, Result};
use crate::session::Session;

/// A secret is stored either as a string or as binary data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretValue {
    Text(String),
    Binary(Vec<u8>),
}

impl SecretValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SecretValue::Text(text) => text.as_bytes(),
            SecretValue::Binary(data) => data,
        }
    }

    /// Decodes the secret as a JSON object.
    pub fn parse(&self) -> Result<Map<String, Value>> {
        Ok(serde_json::from_slice(self.as_bytes())?)
    }
}

pub async fn get_secret(session: &Session, secret_name: &str) -> Result<SecretValue> {
    let client: aws_sdk_secretsmanager::Client = session.client();
    let response = client
        .get_secret_value()
        .secret_id(secret_name)
        .send()
        .await
        .map_err(|e| Error::service("secretsmanager", e))?;

    if let Some(text) = response.secret_string() {
        return Ok(SecretValue::Text(text.to_string()));
    }
    response
        .secret_binary()
        .map(|blob| SecretValue::Binary(blob.as_ref().to_vec()))
        .ok_or(Error::MissingField {
            service: "secretsmanager",
            field: "SecretString or SecretBinary",
        })
}

/// Fetches a JSON secret. Every failure is logged and yields an empty map.
pub async fn get_secret_parser(session: &Session, secret_name: &str) -> Map<String, Value> {
    let parsed = match get_secret(session, secret_name).await {
        Ok(secret) => secret.parse(),
        Err(err) => Err(err),
    };
    parsed.unwrap_or_else(|err| {
        error!(secret = secret_name, error = %err, "failed to read secret");
        Map::new()
    })
}
