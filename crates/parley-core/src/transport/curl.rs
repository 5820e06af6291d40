//! Transport that shells out to `curl`.
//!
//! Useful where the built-in client cannot reach the endpoint (corporate
//! proxies, custom TLS setups) but curl is already configured to. The whole
//! request, secret included, is passed as a curl config on stdin so nothing
//! sensitive appears in the process arguments.

use std::process::Stdio;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{
    CHAT_COMPLETIONS_PATH, Completion, Secret, Transport, TransportError, TransportErrorKind,
    parse_raw_response,
};
use crate::request::ChatRequest;

pub struct CurlTransport {
    program: String,
    endpoint: String,
    timeout: Option<Duration>,
}

impl CurlTransport {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Self {
        Self {
            program: "curl".to_string(),
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), CHAT_COMPLETIONS_PATH),
            timeout,
        }
    }

    /// Uses a different curl executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn send_inner(
        &self,
        request: &ChatRequest,
        secret: &Secret,
    ) -> Result<Completion, TransportError> {
        let api_key = secret.resolve_for_request()?;
        let body = serde_json::to_string(request).map_err(|err| TransportError {
            kind: TransportErrorKind::InvalidRequest,
            message: "Failed to encode request".to_string(),
            details: Some(err.to_string()),
        })?;
        let config = curl_config(&self.endpoint, &api_key, &body, self.timeout);

        debug!(
            endpoint = %self.endpoint,
            program = %self.program,
            "Sending chat completion request via curl"
        );

        let mut child = match Command::new(&self.program)
            .args(["--config", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                return Ok(Completion::failed(format!(
                    "Failed to run {}: {err}",
                    self.program
                )));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(config.as_bytes()).await {
                return Ok(Completion::failed(format!("Failed to write to curl: {err}")));
            }
            drop(stdin);
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(err) => return Ok(Completion::failed(format!("curl failed: {err}"))),
        };
        if !output.status.success() {
            return Ok(Completion::failed(format!(
                "curl exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_raw_response(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl Transport for CurlTransport {
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
        secret: &'a Secret,
    ) -> BoxFuture<'a, Result<Completion, TransportError>> {
        self.send_inner(request, secret).boxed()
    }
}

/// Renders a curl config file for one request.
fn curl_config(endpoint: &str, api_key: &str, body: &str, timeout: Option<Duration>) -> String {
    let mut lines = vec![
        format!("url = {}", quote(endpoint)),
        "request = \"POST\"".to_string(),
        "silent".to_string(),
        "show-error".to_string(),
        "include".to_string(),
        format!("header = {}", quote("Content-Type: application/json")),
        format!("header = {}", quote(&format!("Authorization: Bearer {api_key}"))),
        format!("data-binary = {}", quote(body)),
    ];
    if let Some(timeout) = timeout {
        lines.push(format!("max-time = {}", timeout.as_secs().max(1)));
    }
    let mut config = lines.join("\n");
    config.push('\n');
    config
}

/// Quotes a value for a curl config file.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
