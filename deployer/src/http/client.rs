//! HTTP client for hosting provider APIs

use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::errors::{DeployError, DeployResult};
use crate::models::job::ProviderKind;

// Provider error bodies are truncated to this many characters
const MAX_ERROR_BODY: usize = 512;

/// Client options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Timeout for metadata calls
    pub request_timeout: Duration,
    /// Timeout for archive uploads
    pub upload_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(300),
        }
    }
}

/// Authenticated JSON client bound to one provider's API
pub struct ApiClient {
    client: Client,
    provider: ProviderKind,
    base_url: String,
    token: Option<SecretString>,
    options: ClientOptions,
}

impl ApiClient {
    pub fn new(
        provider: ProviderKind,
        base_url: &str,
        token: Option<SecretString>,
        options: ClientOptions,
    ) -> DeployResult<Self> {
        Url::parse(base_url).map_err(|e| {
            DeployError::ConfigError(format!("Invalid {} API URL '{}': {}", provider, base_url, e))
        })?;

        let client = Client::builder()
            .timeout(options.request_timeout)
            .user_agent(concat!("sitedeploy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        // Blank tokens count as absent
        let token = token.filter(|t| !t.expose_secret().trim().is_empty());

        Ok(Self {
            client,
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            options,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    fn token(&self) -> DeployResult<&SecretString> {
        self.token
            .as_ref()
            .ok_or(DeployError::ProviderNotConfigured(self.provider))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn redact(&self, text: &str) -> String {
        match &self.token {
            Some(token) => text.replace(token.expose_secret(), "[REDACTED]"),
            None => text.to_string(),
        }
    }

    async fn send(&self, method: &str, url: &str, request: RequestBuilder) -> DeployResult<Response> {
        let token = self.token()?;
        debug!("{} {}", method, url);

        let response = request
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| DeployError::provider(self.provider, None, self.redact(&e.to_string())))?;

        Ok(response)
    }

    async fn error_from(&self, method: &str, response: Response) -> DeployError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let mut message = self.redact(body.trim());
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        if message.is_empty() {
            message = status.canonical_reason().unwrap_or("request failed").to_string();
        }
        error!("{} {} failed: {} - {}", self.provider, method, status, message);

        match status {
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                DeployError::Conflict(format!("{}: {}", self.provider, message))
            }
            _ => DeployError::provider(self.provider, Some(status.as_u16()), message),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, response: Response) -> DeployResult<T> {
        response.json().await.map_err(|e| {
            DeployError::provider(
                self.provider,
                None,
                format!("malformed response: {}", self.redact(&e.to_string())),
            )
        })
    }

    /// GET a JSON resource
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> DeployResult<T> {
        let url = self.url(path);
        let response = self.send("GET", &url, self.client.get(&url)).await?;
        if !response.status().is_success() {
            return Err(self.error_from("GET", response).await);
        }
        self.read_json(response).await
    }

    /// GET a JSON resource that may not exist
    pub async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> DeployResult<Option<T>> {
        let url = self.url(path);
        let response = self.send("GET", &url, self.client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(self.error_from("GET", response).await);
        }
        self.read_json(response).await.map(Some)
    }

    /// POST a JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> DeployResult<T> {
        let url = self.url(path);
        let response = self
            .send("POST", &url, self.client.post(&url).json(body))
            .await?;
        if !response.status().is_success() {
            return Err(self.error_from("POST", response).await);
        }
        self.read_json(response).await
    }

    /// POST raw bytes, with the upload timeout
    pub async fn post_bytes<T: DeserializeOwned>(
        &self,
        path: &str,
        content_type: &str,
        headers: &[(&str, String)],
        data: Vec<u8>,
    ) -> DeployResult<T> {
        let url = self.url(path);
        let mut request = self
            .client
            .post(&url)
            .timeout(self.options.upload_timeout)
            .header(header::CONTENT_TYPE, content_type)
            .body(data);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = self.send("POST", &url, request).await?;
        if !response.status().is_success() {
            return Err(self.error_from("POST", response).await);
        }
        self.read_json(response).await
    }

    /// True when the token is present and `path` answers with a success status
    pub async fn probe(&self, path: &str) -> bool {
        if !self.is_configured() {
            return false;
        }
        let url = self.url(path);
        match self.send("GET", &url, self.client.get(&url)).await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("{} health probe failed: {}", self.provider, e);
                false
            }
        }
    }
}
