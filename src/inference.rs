//! HTTP transport for the external AI service.
//!
//! Maps every HTTP outcome onto [`ResilioError`] so that
//! [`ResilientCall`](crate::ResilientCall) can tell retryable failures from
//! permanent ones. Prompt construction and response interpretation belong
//! to the caller.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::InferenceConfig;
use crate::{ResilioError, Result};

/// Upper bound on how much of an error body ends up in an error message.
const MAX_ERROR_BODY: usize = 512;

/// JSON-over-HTTP client for the AI service.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl InferenceClient {
    /// Create a client with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResilioError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    /// Build from `[inference]`; `base_url` is required here.
    pub fn from_config(config: &InferenceConfig) -> Result<Self> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            ResilioError::Configuration("inference.base_url is not set".to_string())
        })?;
        let client = Self::new(base_url, config.timeout())?;
        Ok(match config.api_key() {
            Some(key) => client.with_api_key(key),
            None => client,
        })
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` as JSON to `path` and decode the JSON response.
    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.http.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(%url, status = status.as_u16(), "inference response");
        if !status.is_success() {
            return Err(error_for_status(response).await);
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Classify a non-success response.
///
/// 401/403 and 400/422 are permanent; 429 carries the `Retry-After` hint;
/// 408 and 5xx become transient [`ResilioError::Api`] errors.
async fn error_for_status(response: Response) -> ResilioError {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ResilioError::AuthenticationFailed,
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            ResilioError::UpstreamRateLimited { retry_after }
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ResilioError::InvalidInput(error_body(response).await)
        }
        _ => ResilioError::Api {
            status: status.as_u16(),
            message: error_body(response).await,
        },
    }
}

async fn error_body(response: Response) -> String {
    let status = response.status();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    }
}
