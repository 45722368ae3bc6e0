//! Wire payloads exchanged with the relay.
//!
//! Every variant is self-contained and carries its page, so a replica can
//! apply it without further round trips. Applying one twice is harmless.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::block::Block;
use crate::identity::Identity;
use crate::node::Node;
use crate::text::{Char, Color, TextStyle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    BlockInsert {
        node: Node<Block>,
        page_id: Uuid,
    },
    BlockDelete {
        target_id: Identity,
        clock: u64,
        page_id: Uuid,
    },
    BlockUpdate {
        node: Node<Block>,
        page_id: Uuid,
    },
    BlockReorder {
        target_id: Identity,
        before_id: Option<Identity>,
        after_id: Option<Identity>,
        clock: u64,
        page_id: Uuid,
    },
    /// `style`, `color` and `background_color` override the node's copies.
    CharInsert {
        node: Node<Char>,
        block_id: Identity,
        page_id: Uuid,
        style: TextStyle,
        color: Color,
        background_color: Color,
    },
    CharDelete {
        target_id: Identity,
        clock: u64,
        block_id: Identity,
        page_id: Uuid,
    },
    CharUpdate {
        node: Node<Char>,
        block_id: Identity,
        page_id: Uuid,
    },
}

impl Operation {
    pub fn char_insert(node: Node<Char>, block_id: Identity, page_id: Uuid) -> Self {
        let Char {
            style,
            color,
            background_color,
            ..
        } = node.value;
        Operation::CharInsert {
            node,
            block_id,
            page_id,
            style,
            color,
            background_color,
        }
    }

    pub fn page_id(&self) -> Uuid {
        match self {
            Operation::BlockInsert { page_id, .. }
            | Operation::BlockDelete { page_id, .. }
            | Operation::BlockUpdate { page_id, .. }
            | Operation::BlockReorder { page_id, .. }
            | Operation::CharInsert { page_id, .. }
            | Operation::CharDelete { page_id, .. }
            | Operation::CharUpdate { page_id, .. } => *page_id,
        }
    }

    /// Block whose character list a char op targets.
    pub fn block_id(&self) -> Option<Identity> {
        match self {
            Operation::CharInsert { block_id, .. }
            | Operation::CharDelete { block_id, .. }
            | Operation::CharUpdate { block_id, .. } => Some(*block_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::BlockInsert { .. } => "blockInsert",
            Operation::BlockDelete { .. } => "blockDelete",
            Operation::BlockUpdate { .. } => "blockUpdate",
            Operation::BlockReorder { .. } => "blockReorder",
            Operation::CharInsert { .. } => "charInsert",
            Operation::CharDelete { .. } => "charDelete",
            Operation::CharUpdate { .. } => "charUpdate",
        }
    }
}
