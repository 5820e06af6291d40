//! Chat command handler.
//!
//! A line-oriented front-end over a conversation buffer: each input line is
//! appended to the buffer and sent; whatever the session writes back is
//! echoed to stdout as it lands.

use std::io::{self, Write};

use anyhow::{Context, Result};
use parley_core::buffer::{BufferEvent, BufferHandle, ConversationBuffer};
use parley_core::config::{Config, RenderMode};
use parley_core::request::Numeric;
use parley_core::session::{SendOutcome, Session};
use tokio::io::{AsyncBufReadExt, BufReader, stdin};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

/// Command-line overrides applied to the new session only.
#[derive(Debug, Default)]
pub struct ChatOverrides<'a> {
    pub model: Option<&'a str>,
    pub mode: Option<RenderMode>,
    pub limit: Option<usize>,
    pub no_playback: bool,
    pub temperature: Option<&'a str>,
    pub max_tokens: Option<&'a str>,
}

pub async fn run(config: &Config, overrides: &ChatOverrides<'_>) -> Result<()> {
    let mut buffer = ConversationBuffer::new();
    let mut events = buffer.subscribe();
    let handle = BufferHandle::new(buffer);

    let mut session = Session::from_config(config, handle.clone()).context("start session")?;
    if let Some(model) = overrides.model {
        session.set_model(model);
    }
    if let Some(mode) = overrides.mode {
        session.set_render_mode(mode);
    }
    if let Some(limit) = overrides.limit {
        session.set_turn_limit(Some(limit));
    }
    if overrides.no_playback {
        session.set_playback(false);
    }
    if let Some(temperature) = overrides.temperature {
        session.set_temperature(Some(Numeric::from(temperature)));
    }
    if let Some(max_tokens) = overrides.max_tokens {
        session.set_max_tokens(Some(Numeric::from(max_tokens)));
    }
    info!(
        model = %session.config().model,
        mode = session.config().render_mode.id(),
        "Chat started"
    );

    let mut lines = BufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let input = line.trim();
        match input {
            "" => continue,
            ":q" | ":quit" => break,
            ":undo" => {
                let undone = handle.lock().undo();
                println!("{}", if undone { "Undone." } else { "Nothing to undo." });
                continue;
            }
            ":status" => {
                println!("{}", session.status());
                continue;
            }
            ":show" => {
                println!("{}", handle.lock().text());
                continue;
            }
            _ => {}
        }

        {
            let mut buffer = handle.lock();
            let end = buffer.len();
            buffer.insert(end, input);
            let end = buffer.len();
            buffer.set_cursor(end);
        }
        // The user's own text is already on screen.
        drain(&mut events);

        match session.send().await {
            Ok(SendOutcome::Playing) => {
                let wait = session.wait_for_playback();
                tokio::pin!(wait);
                loop {
                    tokio::select! {
                        _ = &mut wait => break,
                        Some(event) = events.recv() => echo(&event),
                    }
                }
                echo_pending(&mut events);
            }
            Ok(SendOutcome::Rendered { .. }) => echo_pending(&mut events),
            Ok(SendOutcome::Failed { status }) => eprintln!("Request failed: {status}"),
            Err(err) => eprintln!("Error: {err}"),
        }
    }

    println!("\nGoodbye!");
    Ok(())
}

fn echo(event: &BufferEvent) {
    if let BufferEvent::Inserted { text, .. } = event {
        print!("{text}");
        let _ = io::stdout().flush();
    }
}

fn echo_pending(events: &mut UnboundedReceiver<BufferEvent>) {
    while let Ok(event) = events.try_recv() {
        echo(&event);
    }
}

fn drain(events: &mut UnboundedReceiver<BufferEvent>) {
    while events.try_recv().is_ok() {}
}
