//! Session driver: one send turns the buffer into a request and the reply
//! back into buffer text.
//!
//! A session owns a copy of its settings, taken from [`Config`] when it is
//! created. Changing a session never touches the global defaults, and
//! changing the defaults never touches a running session.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::buffer::{BufferHandle, ConversationBuffer, MarkerKind};
use crate::config::{Config, RenderMode};
use crate::filters::{FilterChain, FilterContext};
use crate::playback::{
    self, CompletionHook, PlaybackHandle, PlaybackHooks, PlaybackOptions, PlaybackOutcome,
    Rendered,
};
use crate::request::{self, Numeric};
use crate::transcript::{self, ExtractOptions};
use crate::transport::{self, Secret, Transport, TransportError};

const ABANDONED: &str = "Playback abandoned";

/// Per-session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub model: String,
    pub system_prompt: String,
    pub temperature: Option<Numeric>,
    pub max_tokens: Option<Numeric>,
    pub turn_limit: Option<usize>,
    pub render_mode: RenderMode,
    /// Appended after every response; the next user turn starts after it.
    pub prompt: String,
    pub playback: bool,
    pub playback_options: PlaybackOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let config = Config::default();
        Self {
            model: config.model,
            system_prompt: config.system_prompt.unwrap_or_default(),
            temperature: None,
            max_tokens: None,
            turn_limit: None,
            render_mode: config.render_mode,
            prompt: config.prompt,
            playback: config.playback.enabled,
            playback_options: PlaybackOptions::from(&config.playback),
        }
    }
}

impl SessionConfig {
    /// Copies the global defaults.
    ///
    /// # Errors
    /// Returns an error if the system prompt file cannot be read.
    pub fn from_defaults(config: &Config) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            system_prompt: config.effective_system_prompt()?,
            temperature: config.temperature.clone(),
            max_tokens: config.max_tokens.clone(),
            turn_limit: config.turn_limit,
            render_mode: config.render_mode,
            prompt: config.prompt.clone(),
            playback: config.playback.enabled,
            playback_options: PlaybackOptions::from(&config.playback),
        })
    }
}

/// What the status line shows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    /// A request is in flight.
    Waiting,
    /// The response is being typed out.
    Typing,
    Ready,
    Failed(String),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => f.write_str("idle"),
            SessionStatus::Waiting => f.write_str("waiting for response"),
            SessionStatus::Typing => f.write_str("typing"),
            SessionStatus::Ready => f.write_str("ready"),
            SessionStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Result of a send that reached the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The response was inserted at once; this is its range.
    Rendered { range: Range<usize> },
    /// The response is being typed out.
    Playing,
    /// No content came back; the buffer was left alone.
    Failed { status: String },
}

pub struct Session {
    config: SessionConfig,
    buffer: BufferHandle,
    secret: Option<Secret>,
    filters: FilterChain,
    transport: Arc<dyn Transport>,
    status: Arc<watch::Sender<SessionStatus>>,
    playback: Option<PlaybackHandle>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("filters", &self.filters)
            .field("status", &*self.status.borrow())
            .field("playing", &self.playback.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session without a secret and with the default filters.
    pub fn new(config: SessionConfig, buffer: BufferHandle, transport: Arc<dyn Transport>) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            config,
            buffer,
            secret: None,
            filters: FilterChain::with_defaults(),
            transport,
            status: Arc::new(status),
            playback: None,
        }
    }

    /// Creates a session from the global defaults.
    ///
    /// # Errors
    /// Returns an error if the system prompt file, filter names, base URL or
    /// HTTP client setup are invalid.
    pub fn from_config(config: &Config, buffer: BufferHandle) -> Result<Self> {
        let mut session = Self::new(
            SessionConfig::from_defaults(config)?,
            buffer,
            transport::from_config(config)?,
        );
        session.secret = config.resolve_secret();
        session.filters = config.filter_chain()?;
        Ok(session)
    }

    #[must_use]
    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.secret = Some(secret);
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: FilterChain) -> Self {
        self.filters = filters;
        self
    }

    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.config.model = model.into();
    }

    pub fn set_temperature(&mut self, temperature: Option<Numeric>) {
        self.config.temperature = temperature;
    }

    pub fn set_max_tokens(&mut self, max_tokens: Option<Numeric>) {
        self.config.max_tokens = max_tokens;
    }

    pub fn set_turn_limit(&mut self, turn_limit: Option<usize>) {
        self.config.turn_limit = turn_limit;
    }

    pub fn set_render_mode(&mut self, mode: RenderMode) {
        self.config.render_mode = mode;
    }

    pub fn set_playback(&mut self, enabled: bool) {
        self.config.playback = enabled;
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.config.system_prompt = prompt.into();
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.config.prompt = prompt.into();
    }

    pub fn set_secret(&mut self, secret: Option<Secret>) {
        self.secret = secret;
    }

    pub fn set_filters(&mut self, filters: FilterChain) {
        self.filters = filters;
    }

    /// Whether a playback job from an earlier send may still be running.
    pub fn is_playing(&self) -> bool {
        self.playback.as_ref().is_some_and(|job| !job.is_finished())
    }

    /// Sends the conversation up to the cursor (or the selection) and renders
    /// the reply in the session's render mode.
    ///
    /// # Errors
    /// Returns an error when no secret is available or the request cannot be
    /// made at all. Endpoint failures are reported as
    /// [`SendOutcome::Failed`].
    pub async fn send(&mut self) -> Result<SendOutcome, TransportError> {
        self.send_with_mode(self.config.render_mode).await
    }

    /// Like [`Session::send`], rendering this one reply in `mode`.
    ///
    /// # Errors
    /// See [`Session::send`].
    pub async fn send_with_mode(
        &mut self,
        mode: RenderMode,
    ) -> Result<SendOutcome, TransportError> {
        let Some(secret) = self.secret.clone() else {
            let err = TransportError::missing_secret();
            self.set_status(SessionStatus::Failed(err.message.clone()));
            return Err(err);
        };

        self.finish_playback().await;

        let (request, insertion) = {
            let mut buffer = self.buffer.lock();
            let options = ExtractOptions::from_buffer(&buffer, self.config.turn_limit);
            let at = options.visible_range(&buffer).end;
            let transcript = transcript::extract(&buffer, &self.config.system_prompt, &options);
            let request = request::build(
                &transcript,
                &self.config.model,
                self.config.temperature.as_ref(),
                self.config.max_tokens.as_ref(),
            );
            (request, buffer.create_marker(at, MarkerKind::Advancing))
        };
        debug!(turns = request.messages.len(), model = %request.model, "Extracted transcript");

        self.set_status(SessionStatus::Waiting);
        let transport = Arc::clone(&self.transport);
        let completion = match transport.send(&request, &secret).await {
            Ok(completion) => completion,
            Err(err) => {
                self.buffer.lock().remove_marker(insertion);
                self.set_status(SessionStatus::Failed(err.to_string()));
                return Err(err);
            }
        };

        let Some(content) = completion.content else {
            self.buffer.lock().remove_marker(insertion);
            let status = completion
                .status
                .unwrap_or_else(|| "No response received".to_string());
            warn!(status = %status, "Completion request failed");
            self.set_status(SessionStatus::Failed(status.clone()));
            return Ok(SendOutcome::Failed { status });
        };

        let text = self.filters.apply(
            &content,
            &FilterContext {
                render_mode: mode,
                model: self.config.model.clone(),
            },
        );

        let mut buffer = self.buffer.lock();
        let at = buffer.marker_position(insertion);
        buffer.remove_marker(insertion);
        let Some(at) = at.filter(|_| buffer.is_live()) else {
            drop(buffer);
            let status = "Buffer was closed".to_string();
            self.set_status(SessionStatus::Failed(status.clone()));
            return Ok(SendOutcome::Failed { status });
        };

        let separator = separator_before(buffer.text(), at);
        let rendered = format!("{separator}{text}");
        let hook = self.completion_hook(separator.len());

        if self.config.playback {
            drop(buffer);
            self.set_status(SessionStatus::Typing);
            let status = Arc::clone(&self.status);
            self.playback = Some(playback::render_playback_with(
                &self.buffer,
                rendered,
                at,
                self.config.playback_options,
                PlaybackHooks {
                    on_finish: Some(hook),
                    on_abandon: Some(Box::new(move || {
                        publish(&status, SessionStatus::Failed(ABANDONED.to_string()));
                    })),
                },
            ));
            Ok(SendOutcome::Playing)
        } else {
            let range = playback::render_atomic(&mut buffer, &rendered, at, Some(hook));
            Ok(SendOutcome::Rendered {
                range: range.start + separator.len()..range.end,
            })
        }
    }

    /// Waits for the current playback job, if any.
    pub async fn wait_for_playback(&mut self) -> Option<PlaybackOutcome> {
        let job = self.playback.take()?;
        let outcome = job.wait().await;
        // A panicked job never reached its abandon hook.
        if outcome == PlaybackOutcome::Abandoned && self.status() == SessionStatus::Typing {
            self.set_status(SessionStatus::Failed(ABANDONED.to_string()));
        }
        Some(outcome)
    }

    /// Emits the rest of a running playback at once and waits for it.
    pub async fn finish_playback(&mut self) -> Option<PlaybackOutcome> {
        if let Some(job) = &self.playback {
            job.finish();
        }
        self.wait_for_playback().await
    }

    /// Marks the response and appends the prompt, inside the render's change
    /// group. Runs when rendering completes.
    fn completion_hook(&self, separator_len: usize) -> CompletionHook {
        let prompt = self.config.prompt.clone();
        let status = Arc::clone(&self.status);
        Box::new(move |buffer: &mut ConversationBuffer, rendered: &Rendered| {
            let start = (rendered.range.start + separator_len).min(rendered.range.end);
            buffer.mark_response(start..rendered.range.end);
            buffer.insert_in_group(rendered.group, rendered.range.end, &prompt);
            publish(&status, SessionStatus::Ready);
        })
    }

    fn set_status(&self, status: SessionStatus) {
        publish(&self.status, status);
    }
}

fn publish(sender: &watch::Sender<SessionStatus>, status: SessionStatus) {
    info!(status = %status, "Session status changed");
    sender.send_replace(status);
}

/// Blank line needed before a response inserted at `at`.
fn separator_before(text: &str, at: usize) -> &'static str {
    let before = &text[..at];
    if before.is_empty() || before.ends_with("\n\n") {
        ""
    } else if before.ends_with('\n') {
        "\n"
    } else {
        "\n\n"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;

    use super::*;
    use crate::request::ChatRequest;
    use crate::transcript::Role;
    use crate::transport::{Completion, TransportErrorKind};

    struct MockTransport {
        replies: Mutex<Vec<Completion>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl MockTransport {
        fn new(replies: Vec<Completion>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().rev().collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn send<'a>(
            &'a self,
            request: &'a ChatRequest,
            _secret: &'a Secret,
        ) -> BoxFuture<'a, Result<Completion, TransportError>> {
            self.requests.lock().unwrap().push(request.clone());
            let reply = self.replies.lock().unwrap().pop().unwrap_or_default();
            async move { Ok(reply) }.boxed()
        }
    }

    fn session(text: &str, mock: &Arc<MockTransport>, playback: bool) -> Session {
        let config = SessionConfig {
            system_prompt: "Be brief.".to_string(),
            playback,
            playback_options: PlaybackOptions {
                chunk_size: 4,
                interval: Duration::from_millis(10),
            },
            ..SessionConfig::default()
        };
        let transport: Arc<dyn Transport> = Arc::<MockTransport>::clone(mock);
        Session::new(config, BufferHandle::new(ConversationBuffer::from_text(text)), transport)
            .with_secret(Secret::literal("sk-test"))
    }

    #[tokio::test]
    async fn atomic_send_inserts_marks_and_prompts() {
        let mock = MockTransport::new(vec![Completion::success("A language.", "HTTP/1.1 200 OK")]);
        let mut session = session("What is Rust?", &mock, false);

        let outcome = session.send().await.unwrap();

        assert_eq!(outcome, SendOutcome::Rendered { range: 15..26 });
        assert_eq!(session.status(), SessionStatus::Ready);
        let buffer = session.buffer().lock();
        assert_eq!(buffer.text(), "What is Rust?\n\nA language.\n\n* ");
        assert_eq!(buffer.spans().as_slice(), &[15..26]);
        assert_eq!(buffer.cursor(), 26);
        drop(buffer);

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        let roles: Vec<Role> = requests[0].messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User]);
        assert_eq!(requests[0].messages[1].content, "What is Rust?");
    }

    #[tokio::test]
    async fn undo_removes_the_whole_reply() {
        let mock = MockTransport::new(vec![Completion::success("A language.", "HTTP/1.1 200 OK")]);
        let mut session = session("What is Rust?", &mock, false);
        session.send().await.unwrap();

        let mut buffer = session.buffer().lock();
        assert!(buffer.undo());
        assert_eq!(buffer.text(), "What is Rust?");
        assert!(buffer.spans().as_slice().is_empty());
    }

    #[tokio::test]
    async fn failed_completion_leaves_buffer_untouched() {
        let mock = MockTransport::new(vec![Completion::failed("HTTP/1.1 401 Unauthorized")]);
        let mut session = session("hello", &mock, false);

        let outcome = session.send().await.unwrap();

        assert_eq!(
            outcome,
            SendOutcome::Failed {
                status: "HTTP/1.1 401 Unauthorized".to_string()
            }
        );
        assert_eq!(
            session.status(),
            SessionStatus::Failed("HTTP/1.1 401 Unauthorized".to_string())
        );
        assert_eq!(session.buffer().lock().text(), "hello");
        assert_eq!(session.buffer().lock().undo_depth(), 0);
    }

    #[tokio::test]
    async fn missing_secret_fails_before_any_request() {
        let mock = MockTransport::new(Vec::new());
        let mut session = session("hello", &mock, false);
        session.set_secret(None);

        let err = session.send().await.unwrap_err();

        assert_eq!(err.kind, TransportErrorKind::MissingSecret);
        assert!(matches!(session.status(), SessionStatus::Failed(_)));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn org_mode_send_converts_markdown() {
        let mock = MockTransport::new(vec![Completion::success(
            "Use `cargo` and **care**.",
            "HTTP/1.1 200 OK",
        )]);
        let mut session = session("How?", &mock, false);

        session.send_with_mode(RenderMode::Org).await.unwrap();

        assert_eq!(
            session.buffer().lock().text(),
            "How?\n\nUse =cargo= and *care*.\n\n* "
        );
        assert_eq!(session.config().render_mode, RenderMode::Plain);
    }

    #[tokio::test]
    async fn follow_up_sends_full_history() {
        let mock = MockTransport::new(vec![
            Completion::success("A language.", "HTTP/1.1 200 OK"),
            Completion::success("Also a language.", "HTTP/1.1 200 OK"),
        ]);
        let mut session = session("What is Rust?", &mock, false);
        session.send().await.unwrap();
        {
            let mut buffer = session.buffer().lock();
            let end = buffer.len();
            buffer.insert(end, "And Go?");
            let end = buffer.len();
            buffer.set_cursor(end);
        }

        session.send().await.unwrap();

        let requests = mock.requests();
        let contents: Vec<(Role, &str)> = requests[1]
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            contents,
            vec![
                (Role::System, "Be brief."),
                (Role::User, "What is Rust?"),
                (Role::Assistant, "A language."),
                (Role::User, "And Go?"),
            ]
        );

        session.set_turn_limit(Some(1));
        session.send().await.unwrap();
        let requests = mock.requests();
        assert_eq!(requests[2].messages.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_send_reports_typing_then_ready() {
        let mock = MockTransport::new(vec![Completion::success(
            "A fairly long answer.",
            "HTTP/1.1 200 OK",
        )]);
        let mut session = session("Q?", &mock, true);
        let mut status = session.subscribe_status();

        assert_eq!(session.send().await.unwrap(), SendOutcome::Playing);
        assert_eq!(session.status(), SessionStatus::Typing);
        assert!(session.is_playing());
        status.mark_unchanged();

        assert_eq!(
            session.wait_for_playback().await,
            Some(PlaybackOutcome::Completed)
        );
        assert!(status.has_changed().unwrap());
        assert_eq!(session.status(), SessionStatus::Ready);
        assert_eq!(
            session.buffer().lock().text(),
            "Q?\n\nA fairly long answer.\n\n* "
        );
    }

    #[tokio::test(start_paused = true)]
    async fn killed_buffer_during_playback_reports_failure() {
        let mock = MockTransport::new(vec![Completion::success(
            "An answer nobody reads.",
            "HTTP/1.1 200 OK",
        )]);
        let mut session = session("Q?", &mock, true);
        let mut status = session.subscribe_status();

        assert_eq!(session.send().await.unwrap(), SendOutcome::Playing);
        session.buffer().lock().kill();

        status
            .wait_for(|s| matches!(s, SessionStatus::Failed(_)))
            .await
            .unwrap();
        assert_eq!(
            session.status(),
            SessionStatus::Failed("Playback abandoned".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_send_finishes_running_playback() {
        let mock = MockTransport::new(vec![
            Completion::success("First answer, typed slowly.", "HTTP/1.1 200 OK"),
            Completion::success("Second.", "HTTP/1.1 200 OK"),
        ]);
        let mut session = session("One?", &mock, true);
        session.send().await.unwrap();
        assert_eq!(session.buffer().lock().text(), "One?");

        session.send().await.unwrap();

        // The flushed first reply is part of the second transcript.
        let requests = mock.requests();
        let last = requests[1].messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "First answer, typed slowly.");

        session.wait_for_playback().await;
        let buffer = session.buffer().lock();
        assert_eq!(
            buffer.text(),
            "One?\n\nFirst answer, typed slowly.\n\nSecond.\n\n* \n\n* "
        );
        assert_eq!(buffer.spans().as_slice().len(), 2);
    }

    #[test]
    fn separator_depends_on_preceding_text() {
        assert_eq!(separator_before("", 0), "");
        assert_eq!(separator_before("q", 1), "\n\n");
        assert_eq!(separator_before("q\n", 2), "\n");
        assert_eq!(separator_before("q\n\n", 3), "");
    }

    #[test]
    fn session_config_copies_defaults() {
        let mut config = Config::default();
        config.model = "local".to_string();
        config.turn_limit = Some(3);
        config.playback.chunk_size = 0;

        let session = SessionConfig::from_defaults(&config).unwrap();
        assert_eq!(session.model, "local");
        assert_eq!(session.turn_limit, Some(3));
        assert_eq!(session.playback_options.chunk_size, 1);
        assert_eq!(session.system_prompt, "You are a helpful assistant.");
    }
}
