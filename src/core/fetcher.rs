use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use std::time::Duration;
use thiserror::Error;

/// Path of the Clash connections endpoint.
pub const CONNECTIONS_PATH: &str = "/connections";

/// Transient failure while fetching a snapshot. The cycle is skipped and
/// retried on the next interval.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: Url, timeout: Duration },
    #[error("request to {url} failed: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: Url, status: StatusCode },
}

/// Something that can produce the raw `/connections` payload.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Where snapshots come from, for logging.
    fn endpoint(&self) -> &str;

    async fn fetch(&self) -> Result<Bytes, FetchError>;
}

/// HTTP client for the Clash external controller API.
pub struct ClashClient {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl ClashClient {
    /// Create a client for `http://<clash_address>/connections`.
    pub fn new(clash_address: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(&format!("http://{}{}", clash_address, CONNECTIONS_PATH))
            .with_context(|| format!("Invalid Clash address: {}", clash_address))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    fn request_error(&self, source: reqwest::Error) -> FetchError {
        if source.is_timeout() {
            FetchError::Timeout {
                url: self.url.clone(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Request {
                url: self.url.clone(),
                source,
            }
        }
    }
}

#[async_trait]
impl SnapshotSource for ClashClient {
    fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    async fn fetch(&self) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status,
            });
        }

        response.bytes().await.map_err(|e| self.request_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode as AxumStatus, routing::get};
    use std::net::SocketAddr;

    async fn spawn_clash(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn builds_connections_url() {
        let client = ClashClient::new("127.0.0.1:9090", Duration::from_secs(5)).unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:9090/connections");
    }

    #[test]
    fn rejects_unparseable_address() {
        assert!(ClashClient::new("bad host:port", Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn fetches_body() {
        let app = Router::new().route(
            CONNECTIONS_PATH,
            get(|| async { r#"{"downloadTotal":1,"uploadTotal":2,"connections":[]}"# }),
        );
        let addr = spawn_clash(app).await;

        let client = ClashClient::new(&addr.to_string(), Duration::from_secs(5)).unwrap();
        let body = client.fetch().await.unwrap();
        assert_eq!(
            &body[..],
            br#"{"downloadTotal":1,"uploadTotal":2,"connections":[]}"#
        );
    }

    #[tokio::test]
    async fn times_out_on_slow_upstream() {
        let app = Router::new().route(
            CONNECTIONS_PATH,
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "{}"
            }),
        );
        let addr = spawn_clash(app).await;

        let client = ClashClient::new(&addr.to_string(), Duration::from_millis(50)).unwrap();
        let err = client.fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let app = Router::new().route(
            CONNECTIONS_PATH,
            get(|| async { (AxumStatus::UNAUTHORIZED, r#"{"message":"Unauthorized"}"#) }),
        );
        let addr = spawn_clash(app).await;

        let client = ClashClient::new(&addr.to_string(), Duration::from_secs(5)).unwrap();
        match client.fetch().await {
            Err(FetchError::Status { status, .. }) => assert_eq!(status, StatusCode::UNAUTHORIZED),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_a_request_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ClashClient::new(&addr.to_string(), Duration::from_secs(5)).unwrap();
        let err = client.fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Request { .. }), "got {err:?}");
    }
}
