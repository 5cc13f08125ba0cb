//! Contracts between the tree engine and its collaborators.
//!
//! The engine never talks to the network, the disk, or the crypto layer
//! directly; everything goes through these traits. The journal, block
//! server, and conflict-resolution subsystems implement them on their side.

use async_trait::async_trait;
use bytes::Bytes;

use crate::block::{FileBlock, TreeBlock};
use crate::errors::{FetchError, TreeError};
use crate::types::{BlockId, BlockPointer, ContainerId, DataVer, KeyGen, RefNonce, UserId};

/// The caller's intent when fetching a block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockReq {
    Read,
    /// The caller will mutate the returned block. The getter must return a
    /// block that is exclusively owned by the caller, copying on demand if
    /// the cached value is shared.
    Write,
}

/// Fetches blocks from the dirty cache, the clean cache, or the network.
///
/// A block present in the dirty cache overrides the clean cache for the
/// current logical revision; the returned flag reports whether that was the
/// case.
#[async_trait]
pub trait BlockGetter<B: TreeBlock>: Send + Sync {
    async fn get_block(
        &self,
        container: &ContainerId,
        ptr: &BlockPointer,
        req: BlockReq,
    ) -> Result<(B, bool), FetchError>;
}

/// Records that `block` is the current in-memory mutated value for `ptr`.
#[async_trait]
pub trait DirtyBlockCacher<B: TreeBlock>: Send + Sync {
    async fn cache_dirty(
        &self,
        container: &ContainerId,
        ptr: &BlockPointer,
        block: &B,
    ) -> Result<(), TreeError>;
}

/// The dirty predicate used by the dirty-leaf scan. Kept synchronous; the
/// scan consults it before ever fetching a block for write.
pub trait IsBlockDirty: Send + Sync {
    fn is_dirty(&self, container: &ContainerId, ptr: &BlockPointer) -> bool;
}

/// Policy deciding where leaf boundaries fall and how wide indirect blocks
/// may grow. A content-defined chunker plugs in here.
pub trait BlockSplitter: Send + Sync {
    /// Maximum fan-out of an indirect block before a new level is required.
    fn max_ptrs_per_block(&self) -> usize;

    /// Maximum entries per directory leaf before it is split.
    fn max_dir_entries_per_block(&self) -> usize;

    /// Copy bytes of `data` into `block` starting at `off_into_block`,
    /// deciding how many to accept before a new leaf must start. Zero-pads
    /// the gap if `off_into_block` lies past the block's current end.
    /// Returns the number of bytes copied; a smaller-than-requested count
    /// on a non-final block means "start the next leaf here".
    fn copy_until_split(
        &self,
        block: &mut FileBlock,
        last_block: bool,
        data: &[u8],
        off_into_block: u64,
    ) -> u64;

    /// Fingerprint hook for re-splitting an existing leaf: the number of
    /// tail bytes the leaf should shed into its successor, or zero to
    /// leave it alone.
    fn check_split(&self, block: &FileBlock) -> u64;
}

/// Pure generator of unlinkable identifiers for newly created blocks and
/// deduplication-safe reference nonces for copies.
pub trait Crypto: Send + Sync {
    fn make_temporary_id(&self) -> BlockId;
    fn make_ref_nonce(&self) -> RefNonce;
}

/// Supplies the current key generation and the identity charged for new
/// blocks.
pub trait KeyMetadata: Send + Sync {
    fn latest_key_gen(&self) -> KeyGen;
    fn data_version(&self) -> DataVer;
    fn charged_to(&self) -> UserId;
}

/// The encoded (and, in production, encrypted) form of a readied block.
/// Opaque to the engine beyond its size.
#[derive(Clone, Debug)]
pub struct ReadyBlockData {
    pub encoded: Bytes,
}

impl ReadyBlockData {
    pub fn encoded_size(&self) -> u32 {
        self.encoded.len() as u32
    }
}

/// Encodes and content-hashes a block, producing its final ID. The engine
/// calls this exactly once per physically-new block per readying pass.
#[async_trait]
pub trait BlockReadier<B: TreeBlock>: Send + Sync {
    async fn ready_block(
        &self,
        kmd: &dyn KeyMetadata,
        block: &B,
    ) -> Result<(BlockId, ReadyBlockData), TreeError>;
}

/// Invoked once the upload for exactly one pointer completes; used by the
/// dirty-file tracker to mark a block synced.
pub type SyncedCb = Box<dyn FnOnce() + Send + 'static>;

/// The pending-upload set a readying pass feeds. Implementations also own
/// the long-lived clean-cache insertion for readied blocks.
pub trait BlockPutState<B: TreeBlock>: Send + Sync {
    fn add_new_block(
        &self,
        ptr: &BlockPointer,
        block: &B,
        data: ReadyBlockData,
        on_synced: Option<SyncedCb>,
    );
}
