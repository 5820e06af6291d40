//! Transcript extraction from a conversation buffer.
//!
//! Walks response boundaries backward from the end of the visible region.
//! Each segment between two boundaries is one turn: response text becomes an
//! assistant turn, everything else a user turn.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::buffer::ConversationBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Chronological turns, always led by the system turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.turns.iter()
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Turn;
    type IntoIter = std::slice::Iter<'a, Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.turns.iter()
    }
}

/// Inputs for one extraction pass.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Scan end when no region is given.
    pub cursor: usize,
    /// Restricts the scan to this range; earlier text is invisible.
    pub region: Option<Range<usize>>,
    /// Maximum number of user/assistant exchanges to collect.
    pub turn_limit: Option<usize>,
}

impl ExtractOptions {
    /// Options derived from the buffer's own cursor and selection.
    pub fn from_buffer(buffer: &ConversationBuffer, turn_limit: Option<usize>) -> Self {
        Self {
            cursor: buffer.cursor(),
            region: buffer.selection(),
            turn_limit,
        }
    }

    /// The visible range: the region if set, else buffer start to cursor.
    pub fn visible_range(&self, buffer: &ConversationBuffer) -> Range<usize> {
        match &self.region {
            Some(region) => region.start.min(buffer.len())..region.end.min(buffer.len()),
            None => 0..self.cursor.min(buffer.len()),
        }
    }
}

/// Rebuilds the conversation from `buffer`.
pub fn extract(buffer: &ConversationBuffer, system: &str, options: &ExtractOptions) -> Transcript {
    let visible = options.visible_range(buffer);
    let max_turns = options.turn_limit.map(|n| n.saturating_mul(2));

    let mut collected = Vec::new();
    let mut pos = visible.end;
    while pos > visible.start && max_turns.is_none_or(|max| collected.len() < max) {
        let prev = buffer.previous_response_change(pos, visible.start);
        let role = if buffer.is_response_before(pos) {
            Role::Assistant
        } else {
            Role::User
        };
        collected.push(Turn::new(role, clean_content(buffer.slice(prev..pos))));
        pos = prev;
    }

    // An empty visible region still sends an (empty) user turn.
    if collected.is_empty() && max_turns != Some(0) {
        collected.push(Turn::new(Role::User, String::new()));
    }

    let mut turns = Vec::with_capacity(collected.len() + 1);
    turns.push(Turn::new(Role::System, system.trim()));
    turns.extend(collected.into_iter().rev());
    Transcript { turns }
}

/// Trims whitespace and Org/Markdown heading and emphasis markers from the
/// edges of a segment.
fn clean_content(segment: &str) -> &str {
    segment.trim_matches(|c: char| c.is_whitespace() || c == '#' || c == '*')
}
