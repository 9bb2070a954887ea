//! Subscribes a queue to a topic and prints every "Test Message" it receives.
//!
//! ```sh
//! cargo run --example queue_listener
//! ```

use tibber_aws::{
    create_queue_with_subscription, handler_fn, ListenerOptions, Result, Session, SqsListener,
    SqsMessage, SubjectRouter,
};
use tracing_subscriber::EnvFilter;

const QUEUE_NAME: &str = "test-rs-aws-queue";
const TOPIC_NAME: &str = "test-rs-aws-topic";

async fn handle_test_message(message: SqsMessage) -> Result<bool> {
    tracing::info!(message_id = %message.message_id, "handling message");
    println!("{}", message.message_json()?);
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let session = Session::load("eu-west-1").await;
    let queue_url = create_queue_with_subscription(&session, QUEUE_NAME, TOPIC_NAME)
        .await?;

    let router = SubjectRouter::new()
        .route("Test Message", handler_fn(handle_test_message));
    let listener = SqsListener::connect(queue_url, router, ListenerOptions::default())
        .await?;

    listener
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}
