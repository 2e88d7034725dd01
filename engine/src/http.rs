//! HTTP transport against a Closet sync server.

use crate::circuit::{CircuitBreaker, CircuitConfig};
use crate::record::Record;
use crate::retry::{retry_with_backoff_if, AttemptError, RetryOptions};
use crate::transport::{PushReceipt, SyncTransport, TransportError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

#[derive(Deserialize)]
struct ItemsBody {
    #[serde(default)]
    items: Vec<Record>,
}

#[derive(Serialize)]
struct PushBody<'a> {
    items: &'a [Record],
}

/// [`SyncTransport`] over `reqwest`.
///
/// Every request goes through the shared circuit breaker and is retried per
/// the configured [`RetryOptions`]. A rejection by the open circuit is never
/// retried.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryOptions,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            breaker: Arc::new(CircuitBreaker::new("sync-server", CircuitConfig::default())),
            retry: RetryOptions::sync(),
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Share a breaker with other clients of the same server.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn items_url(&self) -> String {
        format!("{}/sync/items", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Run `request` through the breaker, retrying per [`RetryOptions`].
    ///
    /// The per-attempt timeout is applied inside the breaker so that a hung
    /// server counts as a failure.
    async fn guarded<T, F, Fut>(&self, request: F) -> Result<T, TransportError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let breaker = &self.breaker;
        let request = &request;
        let limit = self.retry.timeout;
        let backoff = RetryOptions {
            timeout: None,
            ..self.retry.clone()
        };

        let outcome = retry_with_backoff_if(
            move || async move {
                match limit {
                    Some(limit) => breaker
                        .execute_with_timeout(limit, request)
                        .await
                        .map_err(TransportError::from),
                    None => breaker.execute(request).await.map_err(TransportError::from),
                }
            },
            &backoff,
            |err: &AttemptError<TransportError>| match err {
                AttemptError::Timeout(_) => true,
                AttemptError::Failed(inner) => inner.is_retryable(),
            },
        )
        .await;

        outcome.result.map_err(|err| match err {
            AttemptError::Timeout(_) => TransportError::Timeout,
            AttemptError::Failed(inner) => inner,
        })
    }

    async fn get_items(&self) -> Result<Vec<Record>, TransportError> {
        let response = self
            .authorize(self.client.get(self.items_url()))
            .send()
            .await
            .map_err(send_error)?;
        let body: ItemsBody = decode(response).await?;
        Ok(body.items)
    }

    async fn post_items(&self, items: &[Record]) -> Result<PushReceipt, TransportError> {
        let response = self
            .authorize(self.client.post(self.items_url()))
            .json(&PushBody { items })
            .send()
            .await
            .map_err(send_error)?;
        decode(response).await
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn fetch_items(&self) -> Result<Vec<Record>, TransportError> {
        self.guarded(|| self.get_items()).await
    }

    async fn push_items(&self, items: &[Record]) -> Result<PushReceipt, TransportError> {
        self.guarded(|| self.post_items(items)).await
    }
}

fn send_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    response
        .json::<T>()
        .await
        .map_err(|err| TransportError::Decode(err.to_string()))
}
