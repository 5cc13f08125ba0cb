//! Identities and pointer metadata for content-addressed blocks.
//!
//! A [`BlockPointer`] is the full identity of one reference to a block: the
//! content digest, the key generation it was encrypted under, the data
//! format version, and a [`BlockContext`] that makes each logical reference
//! to a shared block globally unique. A [`BlockInfo`] is what a parent block
//! actually stores per child: the pointer plus the encoded (on-the-wire)
//! size, which is zero until the child has been readied for upload.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::Digest;

/// The 32-byte identity of a block. For a readied block this is the content
/// digest of its encoded form; for an in-memory dirty block it is a random
/// temporary ID handed out by [`Crypto`](crate::interfaces::Crypto).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub [u8; 32]);

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({:?})", Digest(&self.0))
    }
}

/// The key generation a block was encrypted under. Bumped by the key
/// metadata provider on rekey; the tree engine only threads it through.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default, Serialize, Deserialize,
)]
pub struct KeyGen(pub u32);

/// Version number of the block data format.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default, Serialize, Deserialize,
)]
pub struct DataVer(pub u32);

/// Identity of the user charged for a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct UserId(pub u64);

/// A nonce distinguishing multiple references to the same content. The zero
/// nonce marks the initial reference created alongside the block itself;
/// deduplicated copies get a fresh random nonce.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct RefNonce(pub [u8; 8]);

impl RefNonce {
    pub const ZERO: RefNonce = RefNonce([0; 8]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 8]
    }
}

/// Per-reference context stored in every pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct BlockContext {
    /// The user charged with the initial reference to this block.
    pub creator: UserId,
    /// Zero for the initial reference, random for deduplicated copies.
    pub ref_nonce: RefNonce,
}

impl BlockContext {
    /// The context of a block's very first reference.
    pub fn first(creator: UserId) -> Self {
        Self {
            creator,
            ref_nonce: RefNonce::ZERO,
        }
    }
}

/// Whether a pointer's target holds data directly or holds pointers to
/// further children. Recorded on the pointer so a traversal can decide
/// whether to descend without fetching the target.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum BlockDirectType {
    Direct,
    Indirect,
}

/// The identity and metadata of one reference to a block.
///
/// A pointer is immutable once its block has been readied; mutation always
/// goes through the dirty cache under a temporary ID and produces a new
/// pointer at the next readying pass.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct BlockPointer {
    pub id: BlockId,
    pub key_gen: KeyGen,
    pub data_ver: DataVer,
    pub context: BlockContext,
    pub direct: BlockDirectType,
}

impl BlockPointer {
    pub fn is_direct(&self) -> bool {
        self.direct == BlockDirectType::Direct
    }

    pub fn is_indirect(&self) -> bool {
        self.direct == BlockDirectType::Indirect
    }
}

/// A pointer plus the size of the pointed-to block's encoded form.
///
/// The encoded size is zero until the child has been readied, and MUST be
/// cleared whenever the child is mutated again, before being set at the
/// next readying.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct BlockInfo {
    pub ptr: BlockPointer,
    pub encoded_size: u32,
}

impl BlockInfo {
    pub fn new(ptr: BlockPointer) -> Self {
        Self {
            ptr,
            encoded_size: 0,
        }
    }

    /// True once the referenced block has been readied and not mutated since.
    pub fn is_readied(&self) -> bool {
        self.encoded_size > 0
    }
}

/// Identity of the file or directory container a tree belongs to. Dirty
/// cache entries are keyed by `(ContainerId, BlockPointer)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ContainerId(pub u64);
