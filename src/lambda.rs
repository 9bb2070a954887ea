use std::future::Future;
use std::time::Duration;

use aws_sdk_lambda::error::DisplayErrorContext;
use aws_sdk_lambda::operation::invoke::InvokeOutput;
use aws_sdk_lambda::primitives::Blob;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::session::{LazyClient, Session};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_RETRIES: u32 = 3;

/// Invokes lambda functions synchronously and returns their JSON result.
pub struct LambdaInvoker {
    session: Session,
    client: LazyClient<aws_sdk_lambda::Client>,
}

enum Attempt {
    Done(Value),
    Failed(String),
}

impl LambdaInvoker {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            client: LazyClient::new(),
        }
    }

    pub async fn invoke<T: Serialize + ?Sized>(
        &self,
        func_name: &str,
        payload: &T,
    ) -> Result<Value> {
        self.invoke_with(func_name, payload, DEFAULT_RETRIES, DEFAULT_TIMEOUT)
            .await
    }

    /// Invokes `func_name`, retrying failed attempts up to `retries` times.
    ///
    /// Every attempt is bounded by `timeout`; a timed out call is not
    /// retried. When no attempt succeeds the result is an empty object.
    /// Only a payload that cannot be serialized is an error.
    pub async fn invoke_with<T: Serialize + ?Sized>(
        &self,
        func_name: &str,
        payload: &T,
        retries: u32,
        timeout: Duration,
    ) -> Result<Value> {
        let body = serde_json::to_vec(payload)?;
        let client = self.client.client(&self.session).await;

        let result = with_retries(func_name, retries, timeout, || {
            let request = client
                .invoke()
                .function_name(func_name)
                .payload(Blob::new(body.clone()));
            async move {
                match request.send().await {
                    Ok(output) => classify(func_name, output),
                    Err(err) => Attempt::Failed(format!(
                        "Error invoking {func_name}: {}",
                        DisplayErrorContext(err)
                    )),
                }
            }
        })
        .await;

        Ok(result.unwrap_or_else(|| {
            let payload = serde_json::from_slice::<Value>(&body).ok();
            error!(
                function = func_name,
                device_id = device_id(payload.as_ref()),
                "Error getting data from lambda"
            );
            json!({})
        }))
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

fn device_id(payload: Option<&Value>) -> &str {
    payload
        .and_then(|value| value.get("deviceId"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

fn classify(func_name: &str, output: InvokeOutput) -> Attempt {
    let payload = output
        .payload()
        .map(|blob| blob.as_ref())
        .unwrap_or_default();
    let status = output.status_code();

    if status != 200 || output.function_error().is_some() {
        return Attempt::Failed(format!(
            "Error getting data from {func_name}, resp code: {status}, {}",
            String::from_utf8_lossy(payload)
        ));
    }
    if payload.is_empty() {
        return Attempt::Done(json!({}));
    }
    match serde_json::from_slice(payload) {
        Ok(value) => Attempt::Done(value),
        Err(err) => Attempt::Failed(format!("Invalid json from {func_name}: {err}")),
    }
}

async fn with_retries<F, Fut>(
    func_name: &str,
    retries: u32,
    timeout: Duration,
    mut attempt: F,
) -> Option<Value>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt>,
{
    for remaining in (1..=retries).rev() {
        match tokio::time::timeout(timeout, attempt()).await {
            Err(_) => {
                error!(function = func_name, "Timed out");
                return None;
            }
            Ok(Attempt::Done(value)) => {
                debug!(function = func_name, "lambda invoked");
                return Some(value);
            }
            Ok(Attempt::Failed(message)) if remaining > 1 => warn!("{message}"),
            Ok(Attempt::Failed(message)) => error!("{message}"),
        }
    }
    None
}
