use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyString};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

use crate::lambda::LambdaInvoker;
use crate::queue::{Queue, QueueMessage};
use crate::s3::{is_gzip_key, ObjectState, S3Bucket};
use crate::secrets::{self, SecretValue};
use crate::session::{Session, DEFAULT_REGION};
use crate::sns::Topic;

fn new_runtime() -> PyResult<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| PyRuntimeError::new_err(format!("Failed to create async runtime: {}", e)))
}

fn runtime_error(err: crate::Error) -> PyErr {
    PyRuntimeError::new_err(err.to_string())
}

fn to_json_value(py: Python<'_>, obj: &Bound<'_, PyAny>) -> PyResult<Value> {
    let encoded: String = py
        .import("json")?
        .call_method1("dumps", (obj,))?
        .extract()?;
    serde_json::from_str(&encoded).map_err(|e| PyRuntimeError::new_err(e.to_string()))
}

fn from_json_value(py: Python<'_>, value: &Value) -> PyResult<PyObject> {
    Ok(py
        .import("json")?
        .call_method1("loads", (value.to_string(),))?
        .unbind())
}

/// `str` bodies are stored as their UTF-8 encoding.
fn body_bytes(data: &Bound<'_, PyAny>) -> PyResult<Vec<u8>> {
    if let Ok(text) = data.downcast::<PyString>() {
        return Ok(text.to_cow()?.into_owned().into_bytes());
    }
    Ok(data.downcast::<PyBytes>()?.as_bytes().to_vec())
}

/// A `datetime`; naive values are taken as UTC.
#[derive(FromPyObject)]
enum Timestamp {
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

impl Timestamp {
    fn to_utc(&self) -> DateTime<Utc> {
        match self {
            Timestamp::Aware(at) => at.with_timezone(&Utc),
            Timestamp::Naive(at) => at.and_utc(),
        }
    }
}

#[pyclass(name = "S3Bucket")]
pub struct PyS3Bucket {
    runtime: Runtime,
    bucket: S3Bucket,
}

#[pymethods]
impl PyS3Bucket {
    #[new]
    #[pyo3(signature = (bucket_name, region_name=DEFAULT_REGION))]
    fn new(bucket_name: &str, region_name: &str) -> PyResult<Self> {
        let runtime = new_runtime()?;
        let session = runtime.block_on(Session::load(region_name));

        Ok(Self {
            runtime,
            bucket: S3Bucket::new(session, bucket_name),
        })
    }

    /// Returns `(content, state)`. Content is `bytes` for `.gz` keys and
    /// `str` otherwise.
    #[pyo3(signature = (key, if_unmodified_since=None))]
    fn load_data(
        &self,
        py: Python<'_>,
        key: &str,
        if_unmodified_since: Option<Timestamp>,
    ) -> PyResult<(PyObject, &'static str)> {
        let since = if_unmodified_since.as_ref().map(Timestamp::to_utc);

        if is_gzip_key(key) {
            let (data, state) = self
                .runtime
                .block_on(self.bucket.load_data(key, since))
                .map_err(runtime_error)?;
            let content = match data {
                Some(bytes) => PyBytes::new(py, &bytes).into_any().unbind(),
                None => py.None(),
            };
            return Ok((content, state.as_str()));
        }

        let (text, state) = self
            .runtime
            .block_on(self.bucket.load_text(key, since))
            .map_err(runtime_error)?;
        let content = match text {
            Some(text) => PyString::new(py, &text).into_any().unbind(),
            None => py.None(),
        };
        Ok((content, state.as_str()))
    }

    /// Stores `data`, a `str` or `bytes`.
    fn store_data(&self, key: &str, data: &Bound<'_, PyAny>) -> PyResult<()> {
        let body = body_bytes(data)?;
        self.runtime
            .block_on(self.bucket.store_data(key, &body))
            .map_err(runtime_error)
    }

    fn close(&self) {
        self.runtime.block_on(self.bucket.close());
    }

    fn __repr__(&self) -> String {
        format!("S3Bucket(bucket_name={})", self.bucket.bucket_name())
    }
}

#[pyclass(name = "MessageHandle")]
#[derive(Clone)]
pub struct PyMessageHandle {
    message: QueueMessage,
}

#[pymethods]
impl PyMessageHandle {
    #[getter]
    fn body(&self) -> &str {
        &self.message.body
    }

    #[getter]
    fn receipt_handle(&self) -> &str {
        &self.message.receipt_handle
    }

    #[getter]
    fn message_id(&self) -> Option<&str> {
        self.message.message_id.as_deref()
    }
}

#[pyclass(name = "Queue")]
pub struct PyQueue {
    runtime: Runtime,
    queue: Queue,
}

#[pymethods]
impl PyQueue {
    #[new]
    #[pyo3(signature = (queue_name, region_name=DEFAULT_REGION))]
    fn new(queue_name: &str, region_name: &str) -> PyResult<Self> {
        let runtime = new_runtime()?;
        let session = runtime.block_on(Session::load(region_name));

        Ok(Self {
            runtime,
            queue: Queue::new(session, queue_name),
        })
    }

    #[getter]
    fn queue_url(&self) -> Option<&str> {
        self.queue.queue_url()
    }

    fn subscribe_topic(&self, topic_name: &str) -> PyResult<()> {
        self.runtime
            .block_on(self.queue.subscribe_topic(topic_name))
            .map_err(runtime_error)
    }

    #[pyo3(signature = (num_msgs=1))]
    fn receive_message(&self, num_msgs: i32) -> PyResult<Vec<PyMessageHandle>> {
        let messages = self
            .runtime
            .block_on(self.queue.receive_message(num_msgs))
            .map_err(runtime_error)?;
        Ok(messages
            .into_iter()
            .map(|message| PyMessageHandle { message })
            .collect())
    }

    fn delete_message(&self, msg_handle: PyRef<'_, PyMessageHandle>) -> PyResult<()> {
        self.runtime
            .block_on(self.queue.delete_message(&msg_handle.message))
            .map_err(runtime_error)
    }

    /// Sends `message` as JSON and returns the message id and body digest.
    fn send_message(&self, py: Python<'_>, message: &Bound<'_, PyAny>) -> PyResult<PyObject> {
        let message = to_json_value(py, message)?;
        let sent = self
            .runtime
            .block_on(self.queue.send_message(&message))
            .map_err(runtime_error)?;

        let metadata = json!({
            "MessageId": sent.message_id(),
            "MD5OfMessageBody": sent.md5_of_message_body(),
        });
        from_json_value(py, &metadata)
    }

    fn close(&self) {
        self.runtime.block_on(self.queue.close());
    }
}

#[pyclass(name = "Topic")]
pub struct PyTopic {
    runtime: Runtime,
    topic: Topic,
}

#[pymethods]
impl PyTopic {
    #[new]
    #[pyo3(signature = (topic_name, region_name=DEFAULT_REGION))]
    fn new(topic_name: &str, region_name: &str) -> PyResult<Self> {
        let runtime = new_runtime()?;
        let topic = runtime
            .block_on(async {
                let session = Session::load(region_name).await;
                Topic::create(session, topic_name).await
            })
            .map_err(runtime_error)?;

        Ok(Self { runtime, topic })
    }

    #[getter]
    fn topic_arn(&self) -> &str {
        self.topic.topic_arn()
    }

    fn publish(&self, py: Python<'_>, subject: &str, message: &Bound<'_, PyAny>) -> PyResult<()> {
        let message = to_json_value(py, message)?;
        self.runtime
            .block_on(self.topic.publish(subject, &message))
            .map_err(runtime_error)
    }
}

#[pyfunction]
#[pyo3(signature = (secret_name, region_name=DEFAULT_REGION))]
fn get_secret(py: Python<'_>, secret_name: &str, region_name: &str) -> PyResult<PyObject> {
    let runtime = new_runtime()?;
    let secret = runtime
        .block_on(async {
            let session = Session::load(region_name).await;
            secrets::get_secret(&session, secret_name).await
        })
        .map_err(runtime_error)?;

    Ok(match secret {
        SecretValue::Text(text) => PyString::new(py, &text).into_any().unbind(),
        SecretValue::Binary(data) => PyBytes::new(py, &data).into_any().unbind(),
    })
}

#[pyfunction]
#[pyo3(signature = (secret_name, region_name=DEFAULT_REGION))]
fn get_secret_parser(py: Python<'_>, secret_name: &str, region_name: &str) -> PyResult<PyObject> {
    let runtime = new_runtime()?;
    let parsed = runtime.block_on(async {
        let session = Session::load(region_name).await;
        secrets::get_secret_parser(&session, secret_name).await
    });

    from_json_value(py, &Value::Object(parsed))
}

#[pyfunction]
#[pyo3(signature = (
    func_name,
    payload,
    retries=crate::lambda::DEFAULT_RETRIES,
    timeout=120,
    region_name=DEFAULT_REGION,
))]
fn lambda_invoke(
    py: Python<'_>,
    func_name: &str,
    payload: &Bound<'_, PyAny>,
    retries: u32,
    timeout: u64,
    region_name: &str,
) -> PyResult<PyObject> {
    let payload = to_json_value(py, payload)?;
    let timeout = std::time::Duration::from_secs(timeout);
    let runtime = new_runtime()?;
    let result = runtime
        .block_on(async {
            let session = Session::load(region_name).await;
            LambdaInvoker::new(session)
                .invoke_with(func_name, &payload, retries, timeout)
                .await
        })
        .map_err(runtime_error)?;

    from_json_value(py, &result)
}

#[pyfunction]
fn get_instance_id() -> String {
    crate::metadata::get_instance_id()
}

#[pymodule(gil_used = false)]
fn tibber_aws(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("__version__", crate::VERSION)?;
    m.add("STATE_OK", ObjectState::Ok.as_str())?;
    m.add("STATE_NOT_EXISTING", ObjectState::NotExisting.as_str())?;
    m.add(
        "STATE_PRECONDITION_FAILED",
        ObjectState::PreconditionFailed.as_str(),
    )?;
    m.add_class::<PyS3Bucket>()?;
    m.add_class::<PyQueue>()?;
    m.add_class::<PyMessageHandle>()?;
    m.add_class::<PyTopic>()?;
    m.add_function(wrap_pyfunction!(get_secret, m)?)?;
    m.add_function(wrap_pyfunction!(get_secret_parser, m)?)?;
    m.add_function(wrap_pyfunction!(lambda_invoke, m)?)?;
    m.add_function(wrap_pyfunction!(get_instance_id, m)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn naive_timestamps_are_utc() {
        let naive = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(Timestamp::Naive(naive).to_utc(), expected);

        let oslo = FixedOffset::east_opt(3600).unwrap();
        let aware = oslo.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap();
        assert_eq!(Timestamp::Aware(aware).to_utc(), expected);
    }
}
