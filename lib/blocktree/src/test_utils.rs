//! In-memory collaborators for tests: a block store backing both the clean
//! and dirty sides of the getter contract, deterministic crypto, and a
//! bincode/blake3 readying pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::block::{DirBlock, FileBlock, TreeBlock};
use crate::cache::DirtyBlockCache;
use crate::config::Config;
use crate::dir::DirData;
use crate::errors::{FetchError, TreeError};
use crate::file::FileData;
use crate::interfaces::{
    BlockGetter,
    BlockPutState,
    BlockReadier,
    BlockReq,
    Crypto,
    DirtyBlockCacher,
    IsBlockDirty,
    KeyMetadata,
    ReadyBlockData,
    SyncedCb,
};
use crate::splitter::FixedBlockSplitter;
use crate::types::{
    BlockContext,
    BlockDirectType,
    BlockId,
    BlockInfo,
    BlockPointer,
    ContainerId,
    DataVer,
    KeyGen,
    RefNonce,
    UserId,
};

/// A block store holding clean blocks in a map and dirty blocks in the
/// standard cache; the dirty side always wins on reads, per the getter
/// contract. Supports injecting per-pointer failures and a uniform fetch
/// delay for cancellation/deadline tests.
pub struct MemoryBlockStore<B: TreeBlock> {
    clean: RwLock<HashMap<(ContainerId, BlockPointer), B>>,
    dirty: DirtyBlockCache<B>,
    fail: RwLock<HashSet<BlockId>>,
    delay: RwLock<Option<Duration>>,
    delay_on: RwLock<HashMap<BlockId, Duration>>,
    fetches: AtomicU64,
}

impl<B: TreeBlock> MemoryBlockStore<B> {
    pub fn new() -> Self {
        Self {
            clean: RwLock::new(HashMap::new()),
            dirty: DirtyBlockCache::new(),
            fail: RwLock::new(HashSet::new()),
            delay: RwLock::new(None),
            delay_on: RwLock::new(HashMap::new()),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn put_clean(&self, container: &ContainerId, ptr: &BlockPointer, block: B) {
        self.clean.write().insert((*container, *ptr), block);
    }

    pub fn dirty_cache(&self) -> &DirtyBlockCache<B> {
        &self.dirty
    }

    pub fn fail_on(&self, id: BlockId) {
        self.fail.write().insert(id);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.delay.write() = Some(delay);
    }

    pub fn set_delay_on(&self, id: BlockId, delay: Duration) {
        self.delay_on.write().insert(id, delay);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Promote everything dirty in `container` to clean, as a committed
    /// revision would.
    pub fn commit_dirty(&self, container: &ContainerId) {
        let mut clean = self.clean.write();
        for (ptr, block) in self.dirty.snapshot(container) {
            clean.insert((*container, ptr), block);
        }
        drop(clean);
        self.dirty.clear_container(container);
    }
}

impl<B: TreeBlock> Default for MemoryBlockStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<B: TreeBlock> BlockGetter<B> for MemoryBlockStore<B> {
    async fn get_block(
        &self,
        container: &ContainerId,
        ptr: &BlockPointer,
        _req: BlockReq,
    ) -> Result<(B, bool), FetchError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let delay = self
            .delay_on
            .read()
            .get(&ptr.id)
            .copied()
            .or(*self.delay.read());
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.fail.read().contains(&ptr.id) {
            return Err(FetchError::Store("injected failure".into()));
        }
        // Clones are exclusively owned, which satisfies the write-intent
        // contract for free.
        if let Some(b) = self.dirty.get(container, ptr) {
            return Ok((b, true));
        }
        self.clean
            .read()
            .get(&(*container, *ptr))
            .cloned()
            .map(|b| (b, false))
            .ok_or(FetchError::NotFound(ptr.id))
    }
}

#[async_trait]
impl<B: TreeBlock> DirtyBlockCacher<B> for MemoryBlockStore<B> {
    async fn cache_dirty(
        &self,
        container: &ContainerId,
        ptr: &BlockPointer,
        block: &B,
    ) -> Result<(), TreeError> {
        self.dirty.put(container, ptr, block.clone());
        Ok(())
    }
}

impl<B: TreeBlock> IsBlockDirty for MemoryBlockStore<B> {
    fn is_dirty(&self, container: &ContainerId, ptr: &BlockPointer) -> bool {
        crate::interfaces::IsBlockDirty::is_dirty(&self.dirty, container, ptr)
    }
}

/// Counter-backed crypto; IDs are distinguishable in assertions.
pub struct TestCrypto {
    counter: AtomicU64,
}

impl TestCrypto {
    /// Counters start at a random nonzero base so two instances over one
    /// store never hand out colliding temporary IDs.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(u64::from(rand::random::<u32>()) + 1),
        }
    }
}

impl Default for TestCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl Crypto for TestCrypto {
    fn make_temporary_id(&self) -> BlockId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut id = [0u8; 32];
        id[0] = 0x7e;
        id[24..].copy_from_slice(&n.to_be_bytes());
        BlockId(id)
    }

    fn make_ref_nonce(&self) -> RefNonce {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        RefNonce(n.to_be_bytes())
    }
}

pub struct TestKeyMetadata;

impl KeyMetadata for TestKeyMetadata {
    fn latest_key_gen(&self) -> KeyGen {
        KeyGen(1)
    }

    fn data_version(&self) -> DataVer {
        DataVer(1)
    }

    fn charged_to(&self) -> UserId {
        UserId(42)
    }
}

/// Readies a block by bincode-encoding it and blake3-hashing the result.
pub struct BincodeReadier;

#[async_trait]
impl<B: TreeBlock + Serialize> BlockReadier<B> for BincodeReadier {
    async fn ready_block(
        &self,
        _kmd: &dyn KeyMetadata,
        block: &B,
    ) -> Result<(BlockId, ReadyBlockData), TreeError> {
        let encoded = bincode::serialize(block).map_err(|e| TreeError::Ready(e.to_string()))?;
        let id = BlockId(*blake3::hash(&encoded).as_bytes());
        Ok((
            id,
            ReadyBlockData {
                encoded: Bytes::from(encoded),
            },
        ))
    }
}

/// Records readied blocks, writes them through to the clean store, and
/// fires the synced callback immediately, as an instant upload would.
pub struct TestPutState<B: TreeBlock> {
    container: ContainerId,
    store: Arc<MemoryBlockStore<B>>,
    puts: Mutex<Vec<(BlockPointer, u32)>>,
}

impl<B: TreeBlock> TestPutState<B> {
    pub fn new(container: ContainerId, store: Arc<MemoryBlockStore<B>>) -> Self {
        Self {
            container,
            store,
            puts: Mutex::new(Vec::new()),
        }
    }

    pub fn puts(&self) -> Vec<(BlockPointer, u32)> {
        self.puts.lock().clone()
    }
}

impl<B: TreeBlock> BlockPutState<B> for TestPutState<B> {
    fn add_new_block(
        &self,
        ptr: &BlockPointer,
        block: &B,
        data: ReadyBlockData,
        on_synced: Option<SyncedCb>,
    ) {
        self.store.put_clean(&self.container, ptr, block.clone());
        self.puts.lock().push((*ptr, data.encoded_size()));
        if let Some(cb) = on_synced {
            cb();
        }
    }
}

/// A file-content tree over an in-memory store, rooted at an empty direct
/// block.
pub fn new_file(config: Config) -> (FileData, Arc<MemoryBlockStore<FileBlock>>, ContainerId) {
    let store = Arc::new(MemoryBlockStore::<FileBlock>::new());
    let crypto = Arc::new(TestCrypto::new());
    let container = ContainerId(7);
    let root_ptr = BlockPointer {
        id: crypto.make_temporary_id(),
        key_gen: KeyGen(1),
        data_ver: DataVer(1),
        context: BlockContext::first(UserId(42)),
        direct: BlockDirectType::Direct,
    };
    store.put_clean(&container, &root_ptr, FileBlock::new_empty(false));
    let splitter = Arc::new(FixedBlockSplitter::from_config(&config));
    let fd = FileData::new(
        container,
        BlockInfo::new(root_ptr),
        store.clone(),
        store.clone(),
        store.clone(),
        crypto,
        Arc::new(TestKeyMetadata),
        splitter,
        config,
    );
    (fd, store, container)
}

/// A file adapter over an existing store and root, e.g. for re-opening a
/// tree under a different split policy or reading a deep copy.
pub fn file_with_root(
    store: Arc<MemoryBlockStore<FileBlock>>,
    container: ContainerId,
    root: BlockInfo,
    config: Config,
) -> FileData {
    let splitter = Arc::new(FixedBlockSplitter::from_config(&config));
    FileData::new(
        container,
        root,
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(TestCrypto::new()),
        Arc::new(TestKeyMetadata),
        splitter,
        config,
    )
}

/// A directory-entry tree over an in-memory store, rooted at an empty
/// direct block.
pub fn new_dir(config: Config) -> (DirData, Arc<MemoryBlockStore<DirBlock>>, ContainerId) {
    let store = Arc::new(MemoryBlockStore::<DirBlock>::new());
    let crypto = Arc::new(TestCrypto::new());
    let container = ContainerId(11);
    let root_ptr = BlockPointer {
        id: crypto.make_temporary_id(),
        key_gen: KeyGen(1),
        data_ver: DataVer(1),
        context: BlockContext::first(UserId(42)),
        direct: BlockDirectType::Direct,
    };
    store.put_clean(&container, &root_ptr, DirBlock::new_empty(false));
    let splitter = Arc::new(FixedBlockSplitter::from_config(&config));
    let dd = DirData::new(
        container,
        BlockInfo::new(root_ptr),
        store.clone(),
        store.clone(),
        store.clone(),
        crypto,
        Arc::new(TestKeyMetadata),
        splitter,
        config,
    );
    (dd, store, container)
}
