//! Sources of policy documents.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{FloodgateError, Result};

/// Something that can hand out the current policy document.
///
/// The limiter calls [`fetch`](PolicySource::fetch) without holding any of
/// its locks, so implementations are free to block on I/O.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Fetch the raw policy document.
    async fn fetch(&self) -> Result<String>;

    /// Human readable location, used in logs.
    fn describe(&self) -> String;
}

/// Fetches the policy document with a plain HTTP GET.
pub struct HttpPolicySource {
    url: String,
    client: reqwest::Client,
}

impl HttpPolicySource {
    /// Create a source for `url` whose requests give up after `request_timeout`.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch(&self) -> Result<String> {
        debug!(url = %self.url, "Fetching policy document");

        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FloodgateError::Fetch(format!(
                "{} answered with status {}",
                self.url, status
            )));
        }

        Ok(response.text().await?)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// A fixed document, or a fixed failure. Useful for embedding the limiter
/// with a compiled-in policy and for tests.
pub struct StaticPolicySource {
    document: std::result::Result<String, String>,
}

impl StaticPolicySource {
    /// Always serve `document`.
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: Ok(document.into()),
        }
    }

    /// Always fail with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            document: Err(message.into()),
        }
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn fetch(&self) -> Result<String> {
        match &self.document {
            Ok(doc) => Ok(doc.clone()),
            Err(message) => Err(FloodgateError::Fetch(message.clone())),
        }
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/policy", addr)
    }

    #[tokio::test]
    async fn test_http_fetch() {
        let url = serve(Router::new().route("/policy", get(|| async { "key: id\n" }))).await;
        let source = HttpPolicySource::new(&url, Duration::from_secs(5)).unwrap();

        assert_eq!(source.fetch().await.unwrap(), "key: id\n");
        assert_eq!(source.describe(), url);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let url = serve(Router::new().route(
            "/policy",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;
        let source = HttpPolicySource::new(url, Duration::from_secs(5)).unwrap();

        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, FloodgateError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_http_unreachable() {
        // Bind and drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source =
            HttpPolicySource::new(format!("http://{}/policy", addr), Duration::from_secs(1))
                .unwrap();
        assert!(matches!(
            source.fetch().await.unwrap_err(),
            FloodgateError::Http(_)
        ));
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticPolicySource::new("key: id");
        assert_eq!(source.fetch().await.unwrap(), "key: id");

        let source = StaticPolicySource::failing("down");
        assert!(source.fetch().await.is_err());
    }
}
