use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use url::Url;

use crate::config::HttpConfig;
use crate::error::Error;

/// Plain unauthenticated fetches. Failures are reported as [`Error::Network`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_text(&self, url: &Url) -> Result<String, Error>;
    async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>, Error>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpConfig,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build http client")?;
        Ok(Self { client, config })
    }

    async fn get_with_retry(&self, url: &Url) -> Result<reqwest::Response, Error> {
        let mut attempt = 0_u32;
        loop {
            let result = self
                .client
                .get(url.clone())
                .header(USER_AGENT, self.config.user_agent.as_str())
                .header(ACCEPT, "*/*")
                .send()
                .await;

            let retryable = match &result {
                Ok(response) => is_retryable_status(response.status()),
                Err(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            };
            if retryable && attempt < self.config.max_retries {
                let delay = self.config.initial_retry_delay * 2_u32.saturating_pow(attempt);
                attempt += 1;
                tracing::warn!(
                    %url,
                    attempt,
                    max_retries = self.config.max_retries,
                    ?delay,
                    "request failed; retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let response = result.map_err(|err| Error::network(url.as_str(), err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::network(url.as_str(), format!("HTTP {status}")));
            }
            return Ok(response);
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_text(&self, url: &Url) -> Result<String, Error> {
        tracing::debug!(%url, "GET text");
        let response = self.get_with_retry(url).await?;
        response
            .text()
            .await
            .map_err(|err| Error::network(url.as_str(), format!("read body: {err}")))
    }

    async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>, Error> {
        tracing::debug!(%url, "GET bytes");
        let response = self.get_with_retry(url).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| Error::network(url.as_str(), format!("read body: {err}")))?;
        Ok(bytes.to_vec())
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// In-memory transport for tests: serves fixed bodies keyed by URL and counts
/// requests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct StubTransport {
        bodies: HashMap<String, Vec<u8>>,
        hits: Mutex<HashMap<String, usize>>,
    }

    impl StubTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
            self.bodies.insert(url.to_string(), body.into());
            self
        }

        pub fn hits(&self, url: &str) -> usize {
            self.hits
                .lock()
                .expect("hits lock")
                .get(url)
                .copied()
                .unwrap_or(0)
        }

        fn serve(&self, url: &Url) -> Result<Vec<u8>, Error> {
            *self
                .hits
                .lock()
                .expect("hits lock")
                .entry(url.to_string())
                .or_default() += 1;
            self.bodies
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| Error::network(url.as_str(), "HTTP 404 Not Found"))
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn fetch_text(&self, url: &Url) -> Result<String, Error> {
            let bytes = self.serve(url)?;
            Ok(String::from_utf8_lossy(&bytes).to_string())
        }

        async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>, Error> {
            self.serve(url)
        }
    }
}
