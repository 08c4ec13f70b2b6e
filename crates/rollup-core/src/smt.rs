//! Sparse Merkle tree over 256-bit keys, backed by `sparse-merkle-tree`.
//!
//! Leaves are 32-byte hashes; an all-zero leaf is the empty leaf and the
//! root of an empty tree is all zeros. Branches are merged with SHA-256.

use sha2::{Digest, Sha256};
use sparse_merkle_tree::default_store::DefaultStore;
use sparse_merkle_tree::traits::{Hasher, Value};
use sparse_merkle_tree::{SparseMerkleTree, H256};

use crate::canonical::{CoreError, Hash32};

pub const SMT_DEPTH: u16 = 256;

/// Authenticated key/value accumulator keyed by 32-byte paths.
pub trait SparseMerkle {
    /// Set the leaf at `key` to `leaf` and return the new root. An all-zero
    /// `leaf` removes the entry.
    fn update(&mut self, key: &[u8; 32], leaf: [u8; 32]) -> Result<Hash32, CoreError>;
    fn get(&self, key: &[u8; 32]) -> Result<Option<[u8; 32]>, CoreError>;
    fn root(&self) -> Hash32;
}

/// SHA-256 branch hasher.
#[derive(Default)]
pub struct Sha256Hasher(Sha256);

impl Hasher for Sha256Hasher {
    fn write_h256(&mut self, h: &H256) {
        self.0.update(h.as_slice());
    }

    fn write_byte(&mut self, b: u8) {
        self.0.update([b]);
    }

    fn finish(self) -> H256 {
        let out: [u8; 32] = self.0.finalize().into();
        H256::from(out)
    }
}

/// Leaf stored in the tree: the account leaf hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeafHash(pub [u8; 32]);

impl Value for LeafHash {
    fn to_h256(&self) -> H256 {
        H256::from(self.0)
    }

    fn zero() -> Self {
        Self::default()
    }
}

type Tree = SparseMerkleTree<Sha256Hasher, LeafHash, DefaultStore<LeafHash>>;

fn tree_err(err: sparse_merkle_tree::error::Error) -> CoreError {
    CoreError::Tree(format!("{err:?}"))
}

/// In-memory tree used by the state engine.
pub struct MemorySmt {
    tree: Tree,
}

impl Default for MemorySmt {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySmt {
    pub fn new() -> Self {
        Self {
            tree: Tree::new(H256::zero(), DefaultStore::default()),
        }
    }

    /// Root of a tree with no leaves set.
    pub fn empty_root() -> Hash32 {
        Hash32::ZERO
    }
}

impl SparseMerkle for MemorySmt {
    fn update(&mut self, key: &[u8; 32], leaf: [u8; 32]) -> Result<Hash32, CoreError> {
        let root = self
            .tree
            .update(H256::from(*key), LeafHash(leaf))
            .map_err(tree_err)?;
        Ok(Hash32((*root).into()))
    }

    fn get(&self, key: &[u8; 32]) -> Result<Option<[u8; 32]>, CoreError> {
        let leaf = self.tree.get(&H256::from(*key)).map_err(tree_err)?;
        Ok((leaf != LeafHash::zero()).then_some(leaf.0))
    }

    fn root(&self) -> Hash32 {
        Hash32((*self.tree.root()).into())
    }
}
