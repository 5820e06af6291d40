//! Undo history with change groups.
//!
//! Every recorded edit anchors itself to markers, so an undo unit stays
//! correct even when unrelated edits land before it. Edits recorded while a
//! change group is open collect in that group; accepting the group folds
//! them into the history as a single unit.

use std::ops::Range;

use super::MarkerId;

/// Handle to an open change group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeGroupId(u64);

#[derive(Debug, Clone)]
pub(super) enum UndoEntry {
    /// Text between the two markers was inserted.
    Insert { start: MarkerId, end: MarkerId },
    /// `text` was removed at the marker, together with the response spans it
    /// carried (relative to the start of `text`).
    Delete {
        at: MarkerId,
        text: String,
        spans: Vec<Range<usize>>,
    },
}

#[derive(Debug, Default)]
pub(super) struct UndoHistory {
    units: Vec<Vec<UndoEntry>>,
    open: Vec<(ChangeGroupId, Vec<UndoEntry>)>,
    next_group: u64,
}

impl UndoHistory {
    pub fn begin_group(&mut self) -> ChangeGroupId {
        let id = ChangeGroupId(self.next_group);
        self.next_group = self.next_group.wrapping_add(1);
        self.open.push((id, Vec::new()));
        id
    }

    /// Records an entry, into `group` when it is still open.
    pub fn record(&mut self, group: Option<ChangeGroupId>, entry: UndoEntry) {
        if let Some(group) = group
            && let Some((_, entries)) = self.open.iter_mut().find(|(id, _)| *id == group)
        {
            entries.push(entry);
            return;
        }
        self.units.push(vec![entry]);
    }

    /// Last entry of an open group, used to coalesce sequential inserts.
    pub fn last_in_group(&self, group: ChangeGroupId) -> Option<&UndoEntry> {
        self.open
            .iter()
            .find(|(id, _)| *id == group)
            .and_then(|(_, entries)| entries.last())
    }

    /// Closes `group` and pushes its entries as one undo unit.
    pub fn accept_group(&mut self, group: ChangeGroupId) {
        if let Some(idx) = self.open.iter().position(|(id, _)| *id == group) {
            let (_, entries) = self.open.remove(idx);
            if !entries.is_empty() {
                self.units.push(entries);
            }
        }
    }

    pub fn pop_unit(&mut self) -> Option<Vec<UndoEntry>> {
        self.units.pop()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }
}
