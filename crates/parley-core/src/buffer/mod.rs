//! In-memory conversation buffer.
//!
//! The buffer is the only state a conversation has. Assistant turns are
//! recorded as response spans in an ordered index that is kept in sync with
//! every edit, so the visible text plus that index is the whole transcript.
//! Offsets are byte offsets and are always snapped to char boundaries.

mod spans;
mod undo;

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

pub use spans::ResponseSpans;
pub use undo::ChangeGroupId;
use undo::{UndoEntry, UndoHistory};

/// Stable handle to a tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerId(u64);

/// How a marker reacts to text inserted exactly at its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// Moves past the inserted text.
    Advancing,
    /// Stays before the inserted text.
    Fixed,
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    pos: usize,
    kind: MarkerKind,
}

/// Change notifications for front-ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEvent {
    Inserted { offset: usize, text: String },
    Deleted { range: Range<usize> },
    /// A freshly rendered region that a front-end may highlight briefly.
    Flash { range: Range<usize> },
    Killed,
}

#[derive(Debug, Default)]
pub struct ConversationBuffer {
    text: String,
    spans: ResponseSpans,
    markers: HashMap<MarkerId, Marker>,
    next_marker: u64,
    cursor: usize,
    selection: Option<Range<usize>>,
    undo: UndoHistory,
    killed: bool,
    observer: Option<mpsc::UnboundedSender<BufferEvent>>,
}

impl ConversationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer holding `text` with the cursor at the end.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let cursor = text.len();
        Self {
            text,
            cursor,
            ..Self::default()
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Returns the text in `range`, clamped to the buffer.
    pub fn slice(&self, range: Range<usize>) -> &str {
        let start = self.snap(range.start);
        let end = self.snap(range.end).max(start);
        &self.text[start..end]
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn set_cursor(&mut self, pos: usize) {
        self.cursor = self.snap(pos);
    }

    /// Active selection, if any.
    pub fn selection(&self) -> Option<Range<usize>> {
        self.selection.clone()
    }

    pub fn set_selection(&mut self, selection: Option<Range<usize>>) {
        self.selection = selection.map(|r| {
            let (a, b) = (self.snap(r.start), self.snap(r.end));
            a.min(b)..a.max(b)
        });
    }

    pub fn spans(&self) -> &ResponseSpans {
        &self.spans
    }

    /// Tags `range` with the response marker.
    pub fn mark_response(&mut self, range: Range<usize>) {
        let range = self.snap(range.start)..self.snap(range.end);
        self.spans.mark(range);
    }

    /// Whether the character immediately before `pos` is response text.
    pub fn is_response_before(&self, pos: usize) -> bool {
        self.spans.is_marked_before(pos)
    }

    /// Nearest response boundary before `pos`, or `floor` if there is none.
    pub fn previous_response_change(&self, pos: usize, floor: usize) -> usize {
        self.spans.previous_change(pos, floor)
    }

    /// Nearest response boundary after `pos`, or `ceiling` if there is none.
    pub fn next_response_change(&self, pos: usize, ceiling: usize) -> usize {
        self.spans.next_change(pos, ceiling)
    }

    /// Inserts `text` at `offset` as its own undo step.
    pub fn insert(&mut self, offset: usize, text: &str) -> Range<usize> {
        self.insert_recorded(None, offset, text)
    }

    /// Inserts `text` at `offset` as part of an open change group.
    pub fn insert_in_group(
        &mut self,
        group: ChangeGroupId,
        offset: usize,
        text: &str,
    ) -> Range<usize> {
        self.insert_recorded(Some(group), offset, text)
    }

    /// Deletes `range` and returns the removed text.
    pub fn delete(&mut self, range: Range<usize>) -> String {
        let range = self.snap(range.start)..self.snap(range.end);
        if range.is_empty() {
            return String::new();
        }
        let spans = self.spans.relative_within(&range);
        let removed = self.raw_delete(range.clone());
        let at = self.create_marker(range.start, MarkerKind::Fixed);
        self.undo.record(
            None,
            UndoEntry::Delete {
                at,
                text: removed.clone(),
                spans,
            },
        );
        removed
    }

    pub fn begin_change_group(&mut self) -> ChangeGroupId {
        self.undo.begin_group()
    }

    /// Closes `group`, folding everything it recorded into one undo step.
    pub fn accept_change_group(&mut self, group: ChangeGroupId) {
        self.undo.accept_group(group);
    }

    /// Number of undo steps available.
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    /// Reverts the most recent undo step. Returns false when there is none.
    pub fn undo(&mut self) -> bool {
        let Some(entries) = self.undo.pop_unit() else {
            return false;
        };
        for entry in entries.into_iter().rev() {
            match entry {
                UndoEntry::Insert { start, end } => {
                    if let (Some(a), Some(b)) =
                        (self.marker_position(start), self.marker_position(end))
                        && a < b
                    {
                        self.raw_delete(a..b);
                    }
                    self.remove_marker(start);
                    self.remove_marker(end);
                }
                UndoEntry::Delete { at, text, spans } => {
                    if let Some(pos) = self.marker_position(at) {
                        self.raw_insert(pos, &text);
                        for span in spans {
                            self.spans.mark(pos + span.start..pos + span.end);
                        }
                    }
                    self.remove_marker(at);
                }
            }
        }
        true
    }

    pub fn create_marker(&mut self, pos: usize, kind: MarkerKind) -> MarkerId {
        let id = MarkerId(self.next_marker);
        self.next_marker = self.next_marker.wrapping_add(1);
        let pos = self.snap(pos);
        self.markers.insert(id, Marker { pos, kind });
        id
    }

    pub fn marker_position(&self, id: MarkerId) -> Option<usize> {
        self.markers.get(&id).map(|m| m.pos)
    }

    pub fn remove_marker(&mut self, id: MarkerId) {
        self.markers.remove(&id);
    }

    /// Asks front-ends to highlight `range`.
    pub fn flash(&mut self, range: Range<usize>) {
        self.emit(BufferEvent::Flash { range });
    }

    /// Destroys the buffer. Pending playback stops at its next tick.
    pub fn kill(&mut self) {
        self.killed = true;
        self.emit(BufferEvent::Killed);
        self.observer = None;
    }

    pub fn is_live(&self) -> bool {
        !self.killed
    }

    /// Routes change events to the returned receiver, replacing any
    /// previous subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<BufferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observer = Some(tx);
        rx
    }

    fn insert_recorded(
        &mut self,
        group: Option<ChangeGroupId>,
        offset: usize,
        text: &str,
    ) -> Range<usize> {
        let offset = self.snap(offset);
        if text.is_empty() {
            return offset..offset;
        }

        // Sequential inserts inside one group extend the previous entry.
        let coalesce_end = group.and_then(|g| match self.undo.last_in_group(g) {
            Some(UndoEntry::Insert { end, .. }) if self.marker_position(*end) == Some(offset) => {
                Some(*end)
            }
            _ => None,
        });

        let range = self.raw_insert(offset, text);

        if let Some(end) = coalesce_end {
            if let Some(marker) = self.markers.get_mut(&end) {
                marker.pos = range.end;
            }
        } else {
            let start = self.create_marker(range.start, MarkerKind::Advancing);
            let end = self.create_marker(range.end, MarkerKind::Fixed);
            self.undo.record(group, UndoEntry::Insert { start, end });
        }
        range
    }

    fn raw_insert(&mut self, offset: usize, text: &str) -> Range<usize> {
        let len = text.len();
        self.text.insert_str(offset, text);
        self.spans.on_insert(offset, len);
        for marker in self.markers.values_mut() {
            if marker.pos > offset
                || (marker.pos == offset && marker.kind == MarkerKind::Advancing)
            {
                marker.pos += len;
            }
        }
        if self.cursor >= offset {
            self.cursor += len;
        }
        if let Some(sel) = &mut self.selection {
            if sel.start > offset {
                sel.start += len;
            }
            if sel.end >= offset {
                sel.end += len;
            }
        }
        self.emit(BufferEvent::Inserted {
            offset,
            text: text.to_string(),
        });
        offset..offset + len
    }

    fn raw_delete(&mut self, range: Range<usize>) -> String {
        let removed: String = self.text.drain(range.clone()).collect();
        let len = range.end - range.start;
        let clamp = |p: usize| {
            if p >= range.end {
                p - len
            } else if p > range.start {
                range.start
            } else {
                p
            }
        };
        self.spans.on_delete(&range);
        for marker in self.markers.values_mut() {
            marker.pos = clamp(marker.pos);
        }
        self.cursor = clamp(self.cursor);
        if let Some(sel) = &mut self.selection {
            *sel = clamp(sel.start)..clamp(sel.end);
        }
        self.emit(BufferEvent::Deleted { range });
        removed
    }

    fn emit(&self, event: BufferEvent) {
        if let Some(tx) = &self.observer {
            let _ = tx.send(event);
        }
    }

    /// Clamps `pos` to the buffer and moves it back onto a char boundary.
    fn snap(&self, pos: usize) -> usize {
        let mut pos = pos.min(self.text.len());
        while !self.text.is_char_boundary(pos) {
            pos -= 1;
        }
        pos
    }
}

/// Shared handle to a buffer owned by a session.
#[derive(Debug, Clone, Default)]
pub struct BufferHandle(Arc<Mutex<ConversationBuffer>>);

impl BufferHandle {
    pub fn new(buffer: ConversationBuffer) -> Self {
        Self(Arc::new(Mutex::new(buffer)))
    }

    /// Locks the buffer. A poisoned lock is recovered; buffer edits never
    /// leave it half-applied.
    pub fn lock(&self) -> MutexGuard<'_, ConversationBuffer> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn downgrade(&self) -> WeakBuffer {
        WeakBuffer(Arc::downgrade(&self.0))
    }
}

/// Non-owning buffer reference held by background jobs.
#[derive(Debug, Clone)]
pub struct WeakBuffer(Weak<Mutex<ConversationBuffer>>);

impl WeakBuffer {
    pub fn upgrade(&self) -> Option<BufferHandle> {
        self.0.upgrade().map(BufferHandle)
    }
}
