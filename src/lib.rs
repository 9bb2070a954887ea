//! Async helpers to communicate with AWS.
//!
//! Every helper is built from a [`Session`], which carries the region and
//! credentials, and creates its SDK client lazily on first use.

pub mod error;
pub mod lambda;
pub mod listener;
pub mod logs;
pub mod metadata;
pub mod queue;
pub mod s3;
pub mod secrets;
pub mod session;
pub mod sns;

#[cfg(feature = "python")]
mod python;

pub use error::{Error, Result};
pub use lambda::LambdaInvoker;
pub use listener::{
    create_queue_with_subscription, handler_fn, process_envelope, ListenerOptions, MessageHandle,
    MessageHandler, QueueBackend, SqsListener, SqsMessage, SubjectRouter,
};
pub use logs::{CloudWatchLogEvent, LogQuery, Logs};
pub use metadata::get_instance_id;
pub use queue::{Queue, QueueMessage};
pub use s3::{ObjectState, S3Bucket};
pub use secrets::{get_secret, get_secret_parser, SecretValue};
pub use session::{LazyClient, Session, DEFAULT_REGION};
pub use sns::{SnsEvent, SnsPublisher, Topic};

/// Version of this package, the tag its releases are cut with.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
