//! Built-in HTTP transport (reqwest).

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, warn};

use super::{
    CHAT_COMPLETIONS_PATH, Completion, Secret, Transport, TransportError, TransportErrorKind,
    parse_completion,
};
use crate::request::ChatRequest;

/// Standard User-Agent header for parley API requests.
pub const USER_AGENT: &str = concat!("parley/", env!("CARGO_PKG_VERSION"));

pub struct HttpTransport {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpTransport {
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), CHAT_COMPLETIONS_PATH),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send_inner(
        &self,
        request: &ChatRequest,
        secret: &Secret,
    ) -> Result<Completion, TransportError> {
        let api_key = secret.resolve_for_request()?;
        let headers = build_headers(&api_key)?;

        debug!(
            endpoint = %self.endpoint,
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = match self
            .http
            .post(&self.endpoint)
            .headers(headers)
            .json(request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return Ok(Completion::failed(describe_reqwest_error(&err))),
        };

        let status_line = format!("{:?} {}", response.version(), response.status());
        // Reading the body consumes the response and releases the connection
        // whether or not the body turns out to be usable.
        match response.text().await {
            Ok(body) => Ok(parse_completion(&status_line, &body)),
            Err(err) => {
                warn!(status = %status_line, error = %err, "Response body was lost");
                Ok(Completion::dead())
            }
        }
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
        secret: &'a Secret,
    ) -> BoxFuture<'a, Result<Completion, TransportError>> {
        self.send_inner(request, secret).boxed()
    }
}

fn build_headers(api_key: &str) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    let auth = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|err| TransportError {
        kind: TransportErrorKind::InvalidRequest,
        message: "API key is not a valid header value".to_string(),
        details: Some(err.to_string()),
    })?;
    headers.insert("Authorization", auth);
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    Ok(headers)
}

fn describe_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("Request timed out: {e}")
    } else if e.is_connect() {
        format!("Connection failed: {e}")
    } else {
        format!("Network error: {e}")
    }
}
