use aws_config::{BehaviorVersion, Region, SdkConfig};
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_REGION: &str = "eu-west-1";

/// Shared AWS configuration every helper builds its clients from.
#[derive(Clone, Debug)]
pub struct Session {
    config: SdkConfig,
}

impl Session {
    /// Loads the default credential chain for `region_name`.
    pub async fn load(region_name: impl Into<String>) -> Self {
        Self::builder().region(region_name).load().await
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Wraps an already loaded configuration.
    pub fn from_config(config: SdkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn region(&self) -> &str {
        self.config
            .region()
            .map(|region| region.as_ref())
            .unwrap_or(DEFAULT_REGION)
    }

    pub fn client<C: ServiceClient>(&self) -> C {
        C::from_config(&self.config)
    }
}

#[derive(Debug, Default)]
pub struct SessionBuilder {
    region_name: Option<String>,
    endpoint_url: Option<String>,
}

impl SessionBuilder {
    pub fn region(mut self, region_name: impl Into<String>) -> Self {
        self.region_name = Some(region_name.into());
        self
    }

    /// Sends every request to `endpoint_url` instead of the AWS endpoints,
    /// e.g. a local stack.
    pub fn endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub async fn load(self) -> Session {
        let region_name = self
            .region_name
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        debug!(region = %region_name, endpoint = ?self.endpoint_url, "loading aws config");

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region_name));
        if let Some(endpoint_url) = self.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        Session {
            config: loader.load().await,
        }
    }
}

/// An SDK client that can be built from a loaded configuration.
pub trait ServiceClient: Clone + Send + Sync + 'static {
    const SERVICE: &'static str;

    fn from_config(config: &SdkConfig) -> Self;
}

macro_rules! service_client {
    ($client:ty, $name:literal) => {
        impl ServiceClient for $client {
            const SERVICE: &'static str = $name;

            fn from_config(config: &SdkConfig) -> Self {
                <$client>::new(config)
            }
        }
    };
}

service_client!(aws_sdk_s3::Client, "s3");
service_client!(aws_sdk_sqs::Client, "sqs");
service_client!(aws_sdk_sns::Client, "sns");
service_client!(aws_sdk_secretsmanager::Client, "secretsmanager");
service_client!(aws_sdk_lambda::Client, "lambda");
service_client!(aws_sdk_cloudwatchlogs::Client, "logs");

/// A client created on first use and shared afterwards.
///
/// Initialisation happens under a lock, so concurrent first calls still
/// build a single client. `close` drops it; the next call builds a new one.
#[derive(Debug)]
pub struct LazyClient<C> {
    client: Mutex<Option<C>>,
}

impl<C> Default for LazyClient<C> {
    fn default() -> Self {
        Self {
            client: Mutex::new(None),
        }
    }
}

impl<C: ServiceClient> LazyClient<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn client(&self, session: &Session) -> C {
        self.get_or_init(|| session.client()).await
    }

    pub(crate) async fn get_or_init(&self, init: impl FnOnce() -> C) -> C {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return client.clone();
        }
        debug!(service = C::SERVICE, "creating client");
        let client = init();
        *guard = Some(client.clone());
        client
    }

    pub async fn is_initialized(&self) -> bool {
        self.client.lock().await.is_some()
    }

    pub async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            debug!(service = C::SERVICE, "client closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Debug)]
    struct CountingClient(usize);

    impl ServiceClient for CountingClient {
        const SERVICE: &'static str = "test";

        fn from_config(_config: &SdkConfig) -> Self {
            CountingClient(0)
        }
    }

    #[tokio::test]
    async fn lazy_client_initialises_once() {
        let lazy = Arc::new(LazyClient::<CountingClient>::new());
        let created = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let lazy = lazy.clone();
                let created = created.clone();
                tokio::spawn(async move {
                    lazy.get_or_init(|| CountingClient(created.fetch_add(1, Ordering::SeqCst)))
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().0, 0);
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_allows_reinitialisation() {
        let lazy = LazyClient::<CountingClient>::new();
        assert!(!lazy.is_initialized().await);

        assert_eq!(lazy.get_or_init(|| CountingClient(1)).await.0, 1);
        assert!(lazy.is_initialized().await);

        lazy.close().await;
        assert!(!lazy.is_initialized().await);
        assert_eq!(lazy.get_or_init(|| CountingClient(2)).await.0, 2);
    }

    #[test]
    fn session_reports_configured_region() {
        let config = SdkConfig::builder()
            .region(Region::new("us-east-1"))
            .behavior_version(BehaviorVersion::latest())
            .build();
        assert_eq!(Session::from_config(config).region(), "us-east-1");

        let bare = SdkConfig::builder().build();
        assert_eq!(Session::from_config(bare).region(), DEFAULT_REGION);
    }
}
