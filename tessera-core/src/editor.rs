use std::ops::Range;

use log::{debug, warn};
use uuid::Uuid;

use crate::block::{Block, BlockKind, EditorCrdt};
use crate::crdt::{CrdtSnapshot, DeleteOp, InsertOp, ReorderOp, UpdateOp};
use crate::error::CrdtError;
use crate::identity::{ClientId, Identity};
use crate::node::{Element, Node};
use crate::op::Operation;
use crate::text::{Char, TextStyle};

/// One page: the block list, with each block's character list nested
/// inside it. Local intent methods return the [`Operation`]s to send to
/// the relay; [`Editor::apply`] consumes operations received from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Editor {
    page_id: Uuid,
    blocks: EditorCrdt,
}

impl Editor {
    pub fn new(page_id: Uuid, client: ClientId) -> Self {
        Self {
            page_id,
            blocks: EditorCrdt::new(client),
        }
    }

    pub fn page_id(&self) -> Uuid {
        self.page_id
    }

    pub fn client(&self) -> ClientId {
        self.blocks.client()
    }

    pub fn set_client(&mut self, client: ClientId) {
        self.blocks.bind_client(client);
    }

    pub fn max_client(&self) -> ClientId {
        self.blocks.max_client()
    }

    pub fn blocks(&self) -> &EditorCrdt {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, id: &Identity) -> Option<&Block> {
        self.blocks.get(id).map(|node| &node.value)
    }

    pub fn block_id(&self, index: usize) -> Result<Identity, CrdtError> {
        Ok(self.blocks.list().find_by_index(index)?.id)
    }

    pub fn insert_block(&mut self, index: usize, kind: BlockKind) -> Result<Operation, CrdtError> {
        let block = Block::new(kind, self.client());
        self.insert_block_with(index, block)
    }

    /// Insert a prepared block. Its content is rebound to this replica.
    pub fn insert_block_with(&mut self, index: usize, mut block: Block) -> Result<Operation, CrdtError> {
        block.adopt(self.client());
        let InsertOp { node } = self.blocks.local_insert(index, block)?;
        Ok(Operation::BlockInsert {
            node,
            page_id: self.page_id,
        })
    }

    pub fn delete_block(&mut self, index: usize) -> Result<Operation, CrdtError> {
        let DeleteOp { target_id, clock } = self.blocks.local_delete(index)?;
        Ok(Operation::BlockDelete {
            target_id,
            clock,
            page_id: self.page_id,
        })
    }

    /// Edit block attributes. Text edits inside `edit` are not replicated;
    /// use the char methods for those.
    pub fn update_block(
        &mut self,
        index: usize,
        edit: impl FnOnce(&mut Block),
    ) -> Result<Operation, CrdtError> {
        let UpdateOp { node } = self.blocks.local_update(index, edit)?;
        Ok(Operation::BlockUpdate {
            node,
            page_id: self.page_id,
        })
    }

    pub fn move_block(&mut self, from: usize, to: usize) -> Result<Operation, CrdtError> {
        let op = self.blocks.local_move(from, to)?;
        Ok(self.reorder_op(op))
    }

    pub fn reorder_block(
        &mut self,
        target_id: Identity,
        before_id: Option<Identity>,
        after_id: Option<Identity>,
    ) -> Result<Operation, CrdtError> {
        let op = self.blocks.local_reorder(target_id, before_id, after_id)?;
        Ok(self.reorder_op(op))
    }

    pub fn insert_char(
        &mut self,
        block_id: Identity,
        index: usize,
        ch: Char,
    ) -> Result<Operation, CrdtError> {
        let InsertOp { node } = self.blocks.text_mut(&block_id)?.local_insert(index, ch)?;
        Ok(Operation::char_insert(node, block_id, self.page_id))
    }

    pub fn insert_text(
        &mut self,
        block_id: Identity,
        index: usize,
        text: &str,
        style: TextStyle,
    ) -> Result<Vec<Operation>, CrdtError> {
        let page_id = self.page_id;
        let ops = self
            .blocks
            .text_mut(&block_id)?
            .local_insert_str(index, text, style)?;
        Ok(ops
            .into_iter()
            .map(|op| Operation::char_insert(op.node, block_id, page_id))
            .collect())
    }

    pub fn delete_char(&mut self, block_id: Identity, index: usize) -> Result<Operation, CrdtError> {
        let DeleteOp { target_id, clock } = self.blocks.text_mut(&block_id)?.local_delete(index)?;
        Ok(Operation::CharDelete {
            target_id,
            clock,
            block_id,
            page_id: self.page_id,
        })
    }

    pub fn update_char(
        &mut self,
        block_id: Identity,
        index: usize,
        edit: impl FnOnce(&mut Char),
    ) -> Result<Operation, CrdtError> {
        let UpdateOp { node } = self.blocks.text_mut(&block_id)?.local_update(index, edit)?;
        Ok(Operation::CharUpdate {
            node,
            block_id,
            page_id: self.page_id,
        })
    }

    pub fn restyle(
        &mut self,
        block_id: Identity,
        range: Range<usize>,
        edit: impl Fn(&mut Char),
    ) -> Result<Vec<Operation>, CrdtError> {
        let page_id = self.page_id;
        let ops = self
            .blocks
            .text_mut(&block_id)?
            .local_restyle(range, edit)?;
        Ok(ops
            .into_iter()
            .map(|op| Operation::CharUpdate {
                node: op.node,
                block_id,
                page_id,
            })
            .collect())
    }

    /// Apply an operation received from the relay.
    pub fn apply(&mut self, op: &Operation) -> Result<(), CrdtError> {
        if op.page_id() != self.page_id {
            return Err(CrdtError::PageMismatch {
                expected: self.page_id,
                found: op.page_id(),
            });
        }

        match op {
            Operation::BlockInsert { node, .. } => {
                self.blocks.remote_insert(InsertOp { node: node.clone() })?;
            }
            Operation::BlockDelete {
                target_id, clock, ..
            } => {
                self.blocks.remote_delete(&DeleteOp {
                    target_id: *target_id,
                    clock: *clock,
                })?;
            }
            Operation::BlockUpdate { node, .. } => {
                self.blocks.remote_update(UpdateOp { node: node.clone() })?;
            }
            Operation::BlockReorder {
                target_id,
                before_id,
                after_id,
                clock,
                ..
            } => {
                self.blocks.remote_reorder(&ReorderOp {
                    target_id: *target_id,
                    before_id: *before_id,
                    after_id: *after_id,
                    clock: *clock,
                })?;
            }
            Operation::CharInsert {
                node,
                block_id,
                style,
                color,
                background_color,
                ..
            } => {
                let mut node: Node<Char> = node.clone();
                node.value.style = *style;
                node.value.color = *color;
                node.value.background_color = *background_color;
                self.blocks
                    .text_mut(block_id)?
                    .remote_insert(InsertOp { node })?;
            }
            Operation::CharDelete {
                target_id,
                clock,
                block_id,
                ..
            } => {
                self.blocks.text_mut(block_id)?.remote_delete(&DeleteOp {
                    target_id: *target_id,
                    clock: *clock,
                })?;
            }
            Operation::CharUpdate { node, block_id, .. } => {
                self.blocks
                    .text_mut(block_id)?
                    .remote_update(UpdateOp { node: node.clone() })?;
            }
        }
        Ok(())
    }

    /// Apply a remote operation, logging and dropping it on failure.
    ///
    /// A failed remote apply is a convergence gap, not a local bug; the
    /// replica stays usable and can be repaired with a fresh snapshot.
    pub fn apply_logged(&mut self, op: &Operation) -> bool {
        match self.apply(op) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping remote {} on page {}: {}", op.kind(), self.page_id, e);
                false
            }
        }
    }

    /// Block texts joined with newlines.
    pub fn text(&self) -> String {
        self.blocks
            .read()
            .iter()
            .map(|block| block.text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn serialize(&self) -> CrdtSnapshot<Block> {
        self.blocks.serialize()
    }

    pub fn deserialize(page_id: Uuid, snapshot: CrdtSnapshot<Block>) -> Result<Self, CrdtError> {
        let blocks = EditorCrdt::deserialize(snapshot)?;
        debug!("Restored page {} with {} blocks", page_id, blocks.len());
        Ok(Self { page_id, blocks })
    }

    fn reorder_op(&self, op: ReorderOp) -> Operation {
        Operation::BlockReorder {
            target_id: op.target_id,
            before_id: op.before_id,
            after_id: op.after_id,
            clock: op.clock,
            page_id: self.page_id,
        }
    }
}
