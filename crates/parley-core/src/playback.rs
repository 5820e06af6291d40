//! Rendering responses into the buffer.
//!
//! Text is either inserted in one step ([`render_atomic`]) or typed out by a
//! background task a few grapheme clusters at a time ([`render_playback`]).
//! Either way every insertion of one response lives in a single change group,
//! so one undo removes the whole response together with whatever the
//! completion hook added.

use std::ops::Range;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use unicode_segmentation::UnicodeSegmentation;

use crate::buffer::{
    BufferHandle, ChangeGroupId, ConversationBuffer, MarkerId, MarkerKind, WeakBuffer,
};
use crate::config::PlaybackConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackOptions {
    /// Grapheme clusters per tick (at least one).
    pub chunk_size: usize,
    pub interval: Duration,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self::from(&PlaybackConfig::default())
    }
}

impl From<&PlaybackConfig> for PlaybackOptions {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            interval: config.interval(),
        }
    }
}

/// The region a finished render produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub range: Range<usize>,
    /// Still open while the hook runs; edits made in it undo with the response.
    pub group: ChangeGroupId,
}

/// Runs once the full text is in the buffer, before the cursor is placed and
/// the change group is closed.
pub type CompletionHook = Box<dyn FnOnce(&mut ConversationBuffer, &Rendered) + Send>;

/// Runs on the playback task when the job gives up early.
pub type AbandonHook = Box<dyn FnOnce() + Send>;

/// Callbacks for a playback job; both run on the playback task.
#[derive(Default)]
pub struct PlaybackHooks {
    pub on_finish: Option<CompletionHook>,
    pub on_abandon: Option<AbandonHook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    /// The buffer was killed or dropped before the text was fully emitted.
    Abandoned,
}

/// Inserts `text` at `at` in one step and flashes it.
pub fn render_atomic(
    buffer: &mut ConversationBuffer,
    text: &str,
    at: usize,
    on_finish: Option<CompletionHook>,
) -> Range<usize> {
    let group = buffer.begin_change_group();
    let range = buffer.insert_in_group(group, at, text);
    buffer.flash(range.clone());
    complete(buffer, Rendered { range: range.clone(), group }, on_finish);
    range
}

/// Starts typing `text` out at `at` and returns immediately.
///
/// Must be called from within a tokio runtime.
pub fn render_playback(
    buffer: &BufferHandle,
    text: impl Into<String>,
    at: usize,
    options: PlaybackOptions,
    on_finish: Option<CompletionHook>,
) -> PlaybackHandle {
    render_playback_with(
        buffer,
        text,
        at,
        options,
        PlaybackHooks {
            on_finish,
            on_abandon: None,
        },
    )
}

/// [`render_playback`] with an extra hook for jobs that end early.
pub fn render_playback_with(
    buffer: &BufferHandle,
    text: impl Into<String>,
    at: usize,
    options: PlaybackOptions,
    hooks: PlaybackHooks,
) -> PlaybackHandle {
    let PlaybackHooks {
        on_finish,
        on_abandon,
    } = hooks;
    let (group, insertion) = {
        let mut guard = buffer.lock();
        let group = guard.begin_change_group();
        let insertion = guard.create_marker(at, MarkerKind::Advancing);
        (group, insertion)
    };

    let job = PlaybackJob {
        buffer: buffer.downgrade(),
        text: text.into(),
        emitted: 0,
        chunk_size: options.chunk_size.max(1),
        group,
        insertion,
        start: None,
        on_finish,
    };
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let outcome = job.run(options.interval, token).await;
        if outcome == PlaybackOutcome::Abandoned
            && let Some(hook) = on_abandon
        {
            hook();
        }
        outcome
    });
    PlaybackHandle { cancel, task }
}

/// Handle to a running playback job.
///
/// Dropping the handle does not stop the job.
#[derive(Debug)]
pub struct PlaybackHandle {
    cancel: CancellationToken,
    task: JoinHandle<PlaybackOutcome>,
}

impl PlaybackHandle {
    /// Asks the job to emit the rest of its text at once and complete.
    pub fn finish(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> PlaybackOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "Playback task ended abnormally");
                PlaybackOutcome::Abandoned
            }
        }
    }
}

struct PlaybackJob {
    buffer: WeakBuffer,
    text: String,
    /// Bytes of `text` already in the buffer.
    emitted: usize,
    chunk_size: usize,
    group: ChangeGroupId,
    /// Where the next chunk goes.
    insertion: MarkerId,
    /// Start of the emitted text, once there is some.
    start: Option<MarkerId>,
    on_finish: Option<CompletionHook>,
}

impl PlaybackJob {
    async fn run(mut self, interval: Duration, cancel: CancellationToken) -> PlaybackOutcome {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush = tokio::select! {
                biased;
                () = cancel.cancelled() => true,
                _ = ticker.tick() => false,
            };

            let Some(handle) = self.buffer.upgrade() else {
                debug!("Playback buffer dropped");
                return PlaybackOutcome::Abandoned;
            };
            let mut buffer = handle.lock();
            if !buffer.is_live() {
                debug!("Playback buffer killed");
                return PlaybackOutcome::Abandoned;
            }

            let Some(at) = buffer.marker_position(self.insertion) else {
                warn!("Playback insertion point vanished");
                return PlaybackOutcome::Abandoned;
            };
            let end = if flush {
                self.text.len()
            } else {
                self.next_chunk_end()
            };
            if end > self.emitted {
                let range = buffer.insert_in_group(self.group, at, &self.text[self.emitted..end]);
                if self.start.is_none() {
                    self.start = Some(buffer.create_marker(range.start, MarkerKind::Advancing));
                }
                self.emitted = end;
            }

            if self.emitted >= self.text.len() {
                self.finish(&mut buffer, at);
                return PlaybackOutcome::Completed;
            }
        }
    }

    fn next_chunk_end(&self) -> usize {
        let rest = &self.text[self.emitted..];
        rest.grapheme_indices(true)
            .nth(self.chunk_size)
            .map_or(self.text.len(), |(i, _)| self.emitted + i)
    }

    fn finish(&mut self, buffer: &mut ConversationBuffer, fallback: usize) {
        let end = buffer.marker_position(self.insertion).unwrap_or(fallback);
        let start = self
            .start
            .and_then(|m| buffer.marker_position(m))
            .unwrap_or(end)
            .min(end);
        buffer.remove_marker(self.insertion);
        if let Some(start) = self.start.take() {
            buffer.remove_marker(start);
        }
        complete(
            buffer,
            Rendered {
                range: start..end,
                group: self.group,
            },
            self.on_finish.take(),
        );
    }
}

fn complete(buffer: &mut ConversationBuffer, rendered: Rendered, hook: Option<CompletionHook>) {
    if let Some(hook) = hook {
        hook(buffer, &rendered);
    }
    buffer.set_cursor(rendered.range.end);
    buffer.accept_change_group(rendered.group);
}
