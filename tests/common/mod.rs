#![allow(dead_code)]

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_smithy_runtime::client::http::test_util::{ReplayEvent, StaticReplayClient};
use aws_smithy_runtime_api::http::Request as HttpRequest;
use aws_smithy_types::body::SdkBody;
use tibber_aws::Session;

/// A session whose clients answer from `responses`, in order.
pub fn replay_session(
    region: &'static str,
    responses: Vec<http::Response<SdkBody>>,
) -> (Session, StaticReplayClient) {
    let events = responses
        .into_iter()
        .map(|response| ReplayEvent::new(request(), response))
        .collect();
    let http_client = StaticReplayClient::new(events);

    let config = SdkConfig::builder()
        .region(Region::new(region))
        .credentials_provider(SharedCredentialsProvider::new(Credentials::new(
            "ANOTREAL",
            "notrealrnrELgWzOk3IfjzDKtFBhDby",
            None,
            None,
            "test",
        )))
        .http_client(http_client.clone())
        .behavior_version(BehaviorVersion::latest())
        .build();

    (Session::from_config(config), http_client)
}

fn request() -> http::Request<SdkBody> {
    http::Request::builder()
        .uri("https://replay.amazonaws.com/")
        .body(SdkBody::empty())
        .unwrap()
}

pub fn response(status: u16, body: impl Into<SdkBody>) -> http::Response<SdkBody> {
    http::Response::builder()
        .status(status)
        .body(body.into())
        .unwrap()
}

pub fn body(request: &HttpRequest) -> String {
    let bytes = request.body().bytes().unwrap_or_default();
    String::from_utf8_lossy(bytes).into_owned()
}

/// The operation name, from `x-amz-target` for JSON protocols or the
/// `Action` parameter for query protocols.
pub fn operation(request: &HttpRequest) -> String {
    if let Some(target) = request.headers().get("x-amz-target") {
        return target.rsplit('.').next().unwrap_or(target).to_string();
    }
    body(request)
        .split('&')
        .find_map(|param| param.strip_prefix("Action="))
        .unwrap_or_default()
        .to_string()
}

pub fn operations(http_client: &StaticReplayClient) -> Vec<String> {
    http_client.actual_requests().map(operation).collect()
}
