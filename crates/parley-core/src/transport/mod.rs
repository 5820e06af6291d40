//! Transport for chat completion requests.
//!
//! A transport sends one [`ChatRequest`] and reports a [`Completion`]:
//! content when the endpoint answered `200 OK` with a choice, and the raw
//! status line either way. Network failures, non-200 answers and bodies
//! without a choice all come back as a completion without content; only
//! problems that stop a request from being made at all are errors.

mod curl;
mod http;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

pub use curl::CurlTransport;
pub use http::HttpTransport;

use crate::config::{Config, TransportKind};
use crate::request::ChatRequest;

pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Result of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Trimmed text of the first choice, when there is one.
    pub content: Option<String>,
    /// Raw status line (or a description of the network failure).
    pub status: Option<String>,
}

impl Completion {
    pub fn success(content: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            status: Some(status.into()),
        }
    }

    pub fn failed(status: impl Into<String>) -> Self {
        Self {
            content: None,
            status: Some(status.into()),
        }
    }

    /// The response vanished before it could be read.
    pub fn dead() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.content.is_some()
    }
}

/// Category of a request that could not be issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// No secret is configured
    MissingSecret,
    /// The secret provider failed or produced nothing
    SecretProvider,
    /// The request could not be constructed (e.g. invalid header value)
    InvalidRequest,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::MissingSecret => write!(f, "missing_secret"),
            TransportErrorKind::SecretProvider => write!(f, "secret_provider"),
            TransportErrorKind::InvalidRequest => write!(f, "invalid_request"),
        }
    }
}

/// Configuration-class failure: nothing was sent.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details
    pub details: Option<String>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn missing_secret() -> Self {
        Self::new(
            TransportErrorKind::MissingSecret,
            "No API key available. Set api.api_key, api.api_key_command, or the api.api_key_env variable.",
        )
    }

    pub fn secret_provider(err: &anyhow::Error) -> Self {
        Self {
            kind: TransportErrorKind::SecretProvider,
            message: "Failed to obtain API key".to_string(),
            details: Some(format!("{err:#}")),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {}", self.message, details),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}

/// Bearer secret: a literal value or a zero-argument provider that is
/// called once per request.
#[derive(Clone)]
pub enum Secret {
    Literal(String),
    Provider(Arc<dyn Fn() -> Result<String> + Send + Sync>),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Literal(_) => f.write_str("Secret::Literal(<redacted>)"),
            Secret::Provider(_) => f.write_str("Secret::Provider(..)"),
        }
    }
}

impl Secret {
    pub fn literal(value: impl Into<String>) -> Self {
        Secret::Literal(value.into())
    }

    pub fn provider<F>(f: F) -> Self
    where
        F: Fn() -> Result<String> + Send + Sync + 'static,
    {
        Secret::Provider(Arc::new(f))
    }

    /// Provider that runs `command` through `sh -c` and uses its trimmed stdout.
    pub fn command(command: impl Into<String>) -> Self {
        let command = command.into();
        Self::provider(move || {
            let output = std::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .output()
                .with_context(|| format!("Failed to run api_key_command: {command}"))?;
            if !output.status.success() {
                bail!(
                    "api_key_command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        })
    }

    /// Produces the secret value.
    ///
    /// # Errors
    /// Returns an error if the provider fails or yields an empty value.
    pub fn resolve(&self) -> Result<String> {
        let value = match self {
            Secret::Literal(value) => value.trim().to_string(),
            Secret::Provider(provider) => provider()?.trim().to_string(),
        };
        if value.is_empty() {
            bail!("API key is empty");
        }
        Ok(value)
    }

    pub(crate) fn resolve_for_request(&self) -> Result<String, TransportError> {
        self.resolve()
            .map_err(|err| TransportError::secret_provider(&err))
    }
}

/// Sends chat completion requests.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
        secret: &'a Secret,
    ) -> BoxFuture<'a, Result<Completion, TransportError>>;
}

/// Builds the transport selected by `config`.
///
/// # Errors
/// Returns an error if the base URL is invalid or the HTTP client cannot be
/// constructed.
pub fn from_config(config: &Config) -> Result<Arc<dyn Transport>> {
    let base_url = config.resolve_base_url()?;
    let timeout = config.request_timeout();
    Ok(match config.api.transport {
        TransportKind::Http => Arc::new(HttpTransport::new(&base_url, timeout)?),
        TransportKind::Curl => Arc::new(CurlTransport::new(&base_url, timeout)),
    })
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Interprets a status line and body.
pub fn parse_completion(status_line: &str, body: &str) -> Completion {
    let status_line = status_line.trim_end();
    // HTTP/2 status lines carry no reason phrase, so only the code counts.
    if status_code(status_line) != Some("200") {
        debug!(status = status_line, body, "Completion request failed");
        return Completion::failed(status_line);
    }

    let content = serde_json::from_str::<ChatCompletionResponse>(body)
        .ok()
        .and_then(|response| response.choices.into_iter().next())
        .and_then(|choice| choice.message)
        .and_then(|message| message.content);

    match content {
        Some(text) => Completion::success(text.trim(), status_line),
        None => {
            debug!(body, "200 response without choice content");
            Completion::failed(status_line)
        }
    }
}

/// Parses a raw HTTP response: status line, headers, blank line, body.
///
/// Interim `1xx` responses and proxy `Connection established` preambles
/// ahead of the real response are skipped. An empty buffer means the
/// response was lost and yields a completion with neither field.
pub fn parse_raw_response(raw: &str) -> Completion {
    let mut rest = raw;
    loop {
        let (head, body) = split_head(rest);
        let status_line = head.lines().next().unwrap_or("").trim_end();
        if status_line.is_empty() {
            return Completion::dead();
        }
        if is_interim(status_line) && body.starts_with("HTTP/") {
            rest = body;
            continue;
        }
        return parse_completion(status_line, body);
    }
}

fn split_head(raw: &str) -> (&str, &str) {
    let crlf = raw.find("\r\n\r\n").map(|i| (i, 4));
    let lf = raw.find("\n\n").map(|i| (i, 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match split {
        Some((idx, len)) => (&raw[..idx], &raw[idx + len..]),
        None => (raw, ""),
    }
}

fn status_code(status_line: &str) -> Option<&str> {
    status_line.split_whitespace().nth(1)
}

fn is_interim(status_line: &str) -> bool {
    status_line.contains("Connection established")
        || status_code(status_line).is_some_and(|code| code.len() == 3 && code.starts_with('1'))
}
