//! On-store layout of a B-tree node.
//!
//! ```text
//! [count u16][leaf u8][pad u8][keys: MAX_KEYS x u64][children: (MAX_KEYS + 1) x u64]
//! ```
//!
//! Keys are record addresses; the tree never stores key bytes itself.

use smallvec::SmallVec;

use crate::primitives::bytes::le;
use crate::primitives::store::{ChunkStore, PTR_SIZE};
use crate::types::{Address, NdError, Result};

/// Minimum degree: every non-root node holds at least `MIN_DEGREE - 1` keys.
pub(crate) const MIN_DEGREE: usize = 8;
/// Largest number of keys in one node.
pub(crate) const MAX_KEYS: usize = 2 * MIN_DEGREE - 1;

const HEADER_LEN: usize = 4;
const KEYS_OFFSET: usize = HEADER_LEN;
const CHILDREN_OFFSET: usize = KEYS_OFFSET + MAX_KEYS * PTR_SIZE as usize;
/// Bytes allocated for every node.
pub(crate) const NODE_SIZE: usize = CHILDREN_OFFSET + (MAX_KEYS + 1) * PTR_SIZE as usize;

pub(crate) type Keys = SmallVec<[Address; MAX_KEYS + 1]>;
pub(crate) type Children = SmallVec<[Address; MAX_KEYS + 2]>;

/// Decoded node, edited in memory and written back whole.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) address: Address,
    pub(crate) leaf: bool,
    pub(crate) keys: Keys,
    pub(crate) children: Children,
}

impl Node {
    /// Allocates a node; nothing is written until the caller fills and writes it.
    pub(crate) fn alloc(store: &dyn ChunkStore, leaf: bool) -> Result<Node> {
        Ok(Node {
            address: store.malloc(NODE_SIZE as u32)?,
            leaf,
            keys: Keys::new(),
            children: Children::new(),
        })
    }

    pub(crate) fn load(store: &dyn ChunkStore, address: Address) -> Result<Node> {
        let mut buf = [0u8; NODE_SIZE];
        store.read(address, &mut buf)?;
        let count = le::get_u16(&buf, 0) as usize;
        if count > MAX_KEYS {
            return Err(NdError::corrupt(format!(
                "btree node {address} claims {count} keys"
            )));
        }
        let leaf = buf[2] == 1;
        let keys = (0..count)
            .map(|i| Address(le::get_u64(&buf, KEYS_OFFSET + i * 8)))
            .collect();
        let children: Children = if leaf {
            Children::new()
        } else {
            (0..=count)
                .map(|i| Address(le::get_u64(&buf, CHILDREN_OFFSET + i * 8)))
                .collect()
        };
        if children.iter().any(|child| child.is_null()) {
            return Err(NdError::corrupt(format!(
                "btree node {address} has a null child"
            )));
        }
        Ok(Node {
            address,
            leaf,
            keys,
            children,
        })
    }

    pub(crate) fn write(&self, store: &dyn ChunkStore) -> Result<()> {
        let expected_children = if self.leaf { 0 } else { self.keys.len() + 1 };
        if self.keys.len() > MAX_KEYS || self.children.len() != expected_children {
            return Err(NdError::corrupt(format!(
                "btree node {} has {} keys and {} children",
                self.address,
                self.keys.len(),
                self.children.len()
            )));
        }
        let mut buf = [0u8; NODE_SIZE];
        le::put_u16(&mut buf, 0, self.keys.len() as u16);
        buf[2] = u8::from(self.leaf);
        for (i, key) in self.keys.iter().enumerate() {
            le::put_u64(&mut buf, KEYS_OFFSET + i * 8, key.0);
        }
        for (i, child) in self.children.iter().enumerate() {
            le::put_u64(&mut buf, CHILDREN_OFFSET + i * 8, child.0);
        }
        store.write(self.address, &buf)
    }
}
