use serde::{Deserialize, Serialize};

use crate::crdt::Crdt;
use crate::error::CrdtError;
use crate::identity::{ClientId, Identity};
use crate::node::Element;
use crate::text::TextCrdt;

/// Deepest nesting a block may be indented to.
pub const MAX_INDENT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockKind {
    #[default]
    Paragraph,
    Heading1,
    Heading2,
    Heading3,
    BulletedList,
    NumberedList,
    Checkbox,
    Quote,
    Toggle,
    Callout,
    Code,
}

/// A structural element of a page. The character list in `content` is
/// owned by the block and lives and dies with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub kind: BlockKind,
    pub indent: u8,
    pub animation: Option<String>,
    pub styles: Vec<String>,
    pub icon: Option<String>,
    pub checked: bool,
    pub content: TextCrdt,
}

impl Block {
    pub fn new(kind: BlockKind, client: ClientId) -> Self {
        Self {
            kind,
            indent: 0,
            animation: None,
            styles: Vec::new(),
            icon: None,
            checked: false,
            content: TextCrdt::new(client),
        }
    }

    pub fn paragraph(client: ClientId) -> Self {
        Self::new(BlockKind::Paragraph, client)
    }

    pub fn text(&self) -> String {
        self.content.read()
    }

    /// Returns `false` when already at [`MAX_INDENT`].
    pub fn indent(&mut self) -> bool {
        if self.indent >= MAX_INDENT {
            return false;
        }
        self.indent += 1;
        true
    }

    pub fn outdent(&mut self) -> bool {
        if self.indent == 0 {
            return false;
        }
        self.indent -= 1;
        true
    }
}

impl Element for Block {
    const KIND: &'static str = "block";

    fn adopt(&mut self, client: ClientId) {
        self.content.set_client(client);
    }

    /// Attribute fields are last-writer-wins; the character list only
    /// changes through char operations.
    fn replace_with(&mut self, incoming: Self) {
        let Block {
            kind,
            indent,
            animation,
            styles,
            icon,
            checked,
            content: _,
        } = incoming;
        self.kind = kind;
        self.indent = indent;
        self.animation = animation;
        self.styles = styles;
        self.icon = icon;
        self.checked = checked;
    }

    fn normalize(&mut self) {
        self.indent = self.indent.min(MAX_INDENT);
    }
}

/// Document-level list of blocks.
pub type EditorCrdt = Crdt<Block>;

impl Crdt<Block> {
    pub fn text(&self, block_id: &Identity) -> Option<&TextCrdt> {
        self.get(block_id).map(|node| &node.value.content)
    }

    pub(crate) fn text_mut(&mut self, block_id: &Identity) -> Result<&mut TextCrdt, CrdtError> {
        self.value_mut(block_id)
            .map(|block| &mut block.content)
            .ok_or(CrdtError::DanglingReference(*block_id))
    }

    /// Rebind this replica and every nested character list to `client`.
    pub fn bind_client(&mut self, client: ClientId) {
        self.set_client(client);
        for block in self.values_mut() {
            block.content.set_client(client);
        }
    }

    /// Largest client id that authored any block or character.
    pub fn max_client(&self) -> ClientId {
        self.list()
            .iter()
            .flat_map(|block| {
                std::iter::once(block.id.client)
                    .chain(block.value.content.crdt().list().iter().map(|c| c.id.client))
            })
            .max()
            .unwrap_or(0)
    }
}
