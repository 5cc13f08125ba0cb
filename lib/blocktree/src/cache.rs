//! The standard in-memory dirty-block cache.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::block::TreeBlock;
use crate::errors::TreeError;
use crate::interfaces::{DirtyBlockCacher, IsBlockDirty};
use crate::types::{BlockPointer, ContainerId};

/// Side table mapping `(container, pointer)` to the current in-memory
/// mutated value of a block. A block present here overrides the clean cache
/// for reads during the current logical revision.
///
/// Also tracks the total direct-content bytes held dirty, for write-buffer
/// accounting by the layer that decides when to sync.
pub struct DirtyBlockCache<B: TreeBlock> {
    inner: RwLock<Inner<B>>,
}

struct Inner<B> {
    blocks: HashMap<(ContainerId, BlockPointer), B>,
    dirty_bytes: u64,
}

impl<B: TreeBlock> DirtyBlockCache<B> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                blocks: HashMap::new(),
                dirty_bytes: 0,
            }),
        }
    }

    pub fn get(&self, container: &ContainerId, ptr: &BlockPointer) -> Option<B> {
        self.inner.read().blocks.get(&(*container, *ptr)).cloned()
    }

    pub fn put(&self, container: &ContainerId, ptr: &BlockPointer, block: B) {
        let mut inner = self.inner.write();
        let added = block.data_len();
        let removed = inner
            .blocks
            .insert((*container, *ptr), block)
            .map(|old| old.data_len())
            .unwrap_or(0);
        inner.dirty_bytes = inner.dirty_bytes + added - removed;
    }

    pub fn remove(&self, container: &ContainerId, ptr: &BlockPointer) -> Option<B> {
        let mut inner = self.inner.write();
        let old = inner.blocks.remove(&(*container, *ptr));
        if let Some(ref b) = old {
            inner.dirty_bytes -= b.data_len();
        }
        old
    }

    /// All dirty blocks of one container, for revision-commit handoff.
    pub fn snapshot(&self, container: &ContainerId) -> Vec<(BlockPointer, B)> {
        self.inner
            .read()
            .blocks
            .iter()
            .filter(|((c, _), _)| c == container)
            .map(|((_, p), b)| (*p, b.clone()))
            .collect()
    }

    /// Drop every dirty block of one container, after its revision commits.
    pub fn clear_container(&self, container: &ContainerId) {
        let mut inner = self.inner.write();
        inner.blocks.retain(|(c, _), _| c != container);
        inner.dirty_bytes = inner.blocks.values().map(|b| b.data_len()).sum();
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.inner.read().dirty_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: TreeBlock> Default for DirtyBlockCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<B: TreeBlock> DirtyBlockCacher<B> for DirtyBlockCache<B> {
    async fn cache_dirty(
        &self,
        container: &ContainerId,
        ptr: &BlockPointer,
        block: &B,
    ) -> Result<(), TreeError> {
        self.put(container, ptr, block.clone());
        Ok(())
    }
}

impl<B: TreeBlock> IsBlockDirty for DirtyBlockCache<B> {
    fn is_dirty(&self, container: &ContainerId, ptr: &BlockPointer) -> bool {
        self.inner.read().blocks.contains_key(&(*container, *ptr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlock;
    use crate::types::{BlockContext, BlockDirectType, BlockId, DataVer, KeyGen, UserId};

    fn ptr(seed: u8) -> BlockPointer {
        BlockPointer {
            id: BlockId([seed; 32]),
            key_gen: KeyGen(1),
            data_ver: DataVer(1),
            context: BlockContext::first(UserId(1)),
            direct: BlockDirectType::Direct,
        }
    }

    #[test]
    fn tracks_dirty_bytes_across_replacement() {
        let cache = DirtyBlockCache::<FileBlock>::new();
        let c = ContainerId(1);
        cache.put(&c, &ptr(1), FileBlock::direct(vec![0; 10]));
        cache.put(&c, &ptr(2), FileBlock::direct(vec![0; 5]));
        assert_eq!(cache.dirty_bytes(), 15);
        cache.put(&c, &ptr(1), FileBlock::direct(vec![0; 2]));
        assert_eq!(cache.dirty_bytes(), 7);
        cache.remove(&c, &ptr(2));
        assert_eq!(cache.dirty_bytes(), 2);
    }

    #[test]
    fn is_dirty_is_per_container() {
        let cache = DirtyBlockCache::<FileBlock>::new();
        cache.put(&ContainerId(1), &ptr(1), FileBlock::direct(vec![1]));
        assert!(cache.is_dirty(&ContainerId(1), &ptr(1)));
        assert!(!cache.is_dirty(&ContainerId(2), &ptr(1)));
        cache.clear_container(&ContainerId(1));
        assert!(!cache.is_dirty(&ContainerId(1), &ptr(1)));
        assert_eq!(cache.dirty_bytes(), 0);
    }
}
