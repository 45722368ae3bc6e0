//! Character-level CRDT owned by a single block.

use std::ops::Range;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::crdt::{Crdt, CrdtSnapshot, DeleteOp, InsertOp, UpdateOp};
use crate::error::CrdtError;
use crate::identity::{ClientId, Identity};
use crate::node::Element;

bitflags! {
    /// Inline style attributes of a character.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TextStyle: u8 {
        const BOLD = 1;
        const ITALIC = 1 << 1;
        const UNDERLINE = 1 << 2;
        const STRIKETHROUGH = 1 << 3;
        const CODE = 1 << 4;
    }
}

/// Text and background palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    #[default]
    Default,
    Gray,
    Brown,
    Orange,
    Yellow,
    Green,
    Blue,
    Purple,
    Pink,
    Red,
}

/// A single grapheme with its inline attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Char {
    pub value: String,
    #[serde(default)]
    pub style: TextStyle,
    #[serde(default)]
    pub color: Color,
    #[serde(default)]
    pub background_color: Color,
}

impl Char {
    pub fn new(value: impl Into<String>) -> Self {
        Self::styled(value, TextStyle::empty())
    }

    pub fn styled(value: impl Into<String>, style: TextStyle) -> Self {
        Self {
            value: value.into(),
            style,
            color: Color::Default,
            background_color: Color::Default,
        }
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    pub fn with_background(mut self, color: Color) -> Self {
        self.background_color = color;
        self
    }
}

impl AsRef<str> for Char {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl Element for Char {
    const KIND: &'static str = "char";
}

/// The character list of one block, plus a local caret offset that is
/// never replicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextCrdt {
    crdt: Crdt<Char>,
    #[serde(skip)]
    current_caret: Option<usize>,
}

impl TextCrdt {
    pub fn new(client: ClientId) -> Self {
        Self {
            crdt: Crdt::new(client),
            current_caret: None,
        }
    }

    pub fn crdt(&self) -> &Crdt<Char> {
        &self.crdt
    }

    pub fn client(&self) -> ClientId {
        self.crdt.client()
    }

    pub fn clock(&self) -> u64 {
        self.crdt.clock()
    }

    pub fn set_client(&mut self, client: ClientId) {
        self.crdt.set_client(client);
    }

    pub fn len(&self) -> usize {
        self.crdt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crdt.is_empty()
    }

    pub fn id_at(&self, index: usize) -> Result<Identity, CrdtError> {
        Ok(self.crdt.list().find_by_index(index)?.id)
    }

    pub fn current_caret(&self) -> Option<usize> {
        self.current_caret
    }

    pub fn set_caret(&mut self, caret: Option<usize>) {
        self.current_caret = caret;
    }

    pub fn local_insert(&mut self, index: usize, ch: Char) -> Result<InsertOp<Char>, CrdtError> {
        let op = self.crdt.local_insert(index, ch)?;
        self.current_caret = Some(index + 1);
        Ok(op)
    }

    /// Insert every `char` of `text` starting at `index`, one node each.
    pub fn local_insert_str(
        &mut self,
        index: usize,
        text: &str,
        style: TextStyle,
    ) -> Result<Vec<InsertOp<Char>>, CrdtError> {
        text.chars()
            .enumerate()
            .map(|(offset, c)| self.local_insert(index + offset, Char::styled(c.to_string(), style)))
            .collect()
    }

    pub fn local_delete(&mut self, index: usize) -> Result<DeleteOp, CrdtError> {
        let op = self.crdt.local_delete(index)?;
        self.current_caret = Some(index);
        Ok(op)
    }

    pub fn local_update(
        &mut self,
        index: usize,
        edit: impl FnOnce(&mut Char),
    ) -> Result<UpdateOp<Char>, CrdtError> {
        self.crdt.local_update(index, edit)
    }

    /// Apply `edit` to every character in `range`, one update op per character.
    pub fn local_restyle(
        &mut self,
        range: Range<usize>,
        edit: impl Fn(&mut Char),
    ) -> Result<Vec<UpdateOp<Char>>, CrdtError> {
        if range.end > self.len() {
            return Err(CrdtError::InvalidIndex {
                index: range.end,
                len: self.len(),
            });
        }
        let ids: Vec<Identity> = self
            .crdt
            .list()
            .iter()
            .skip(range.start)
            .take(range.len())
            .map(|node| node.id)
            .collect();

        ids.into_iter()
            .map(|id| self.crdt.local_update_by_id(id, &edit))
            .collect()
    }

    pub fn remote_insert(&mut self, op: InsertOp<Char>) -> Result<bool, CrdtError> {
        let id = op.node.id;
        let inserted = self.crdt.remote_insert(op)?;
        if inserted {
            if let (Some(caret), Some(pos)) = (self.current_caret, self.crdt.list().index_of(&id)) {
                if pos < caret {
                    self.current_caret = Some(caret + 1);
                }
            }
        }
        Ok(inserted)
    }

    pub fn remote_delete(&mut self, op: &DeleteOp) -> Result<bool, CrdtError> {
        let pos = self
            .current_caret
            .and_then(|_| self.crdt.list().index_of(&op.target_id));
        let removed = self.crdt.remote_delete(op)?;
        if let (true, Some(caret), Some(pos)) = (removed, self.current_caret, pos) {
            if pos < caret {
                self.current_caret = Some(caret - 1);
            }
        }
        Ok(removed)
    }

    pub fn remote_update(&mut self, op: UpdateOp<Char>) -> Result<(), CrdtError> {
        self.crdt.remote_update(op)
    }

    /// Concatenated text.
    pub fn read(&self) -> String {
        self.crdt.list().stringify()
    }

    pub fn serialize(&self) -> CrdtSnapshot<Char> {
        self.crdt.serialize()
    }

    pub fn deserialize(snapshot: CrdtSnapshot<Char>) -> Result<Self, CrdtError> {
        Ok(Self {
            crdt: Crdt::deserialize(snapshot)?,
            current_caret: None,
        })
    }
}

/// Same characters in the same order. The clock, client id and caret are
/// local to each replica.
impl PartialEq for TextCrdt {
    fn eq(&self, other: &Self) -> bool {
        self.crdt.list() == other.crdt.list()
    }
}
