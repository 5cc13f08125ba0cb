//! The directory adapter: name-keyed entry operations over a [`BlockTree`]
//! of [`DirBlock`]s. Same shape as the file adapter, but whole entries are
//! inserted, updated, and removed rather than byte ranges, and split
//! decisions go by entry count instead of byte count.

use std::collections::BTreeMap;
use std::sync::Arc;

use smol_str::SmolStr;
use tracing::trace;

use crate::block::dir::ENTRY_OVERHEAD;
use crate::block::{DirBlock, DirEntry, TreeBlock};
use crate::config::Config;
use crate::errors::{DirError, TreeError};
use crate::interfaces::{
    BlockGetter,
    BlockPutState,
    BlockReadier,
    BlockReq,
    BlockSplitter,
    Crypto,
    DirtyBlockCacher,
    IsBlockDirty,
    KeyMetadata,
    SyncedCb,
};
use crate::tree::{BlockTree, RangeFetchOpts};
use crate::types::{BlockInfo, BlockPointer, ContainerId};

/// The outcome of one mutating directory operation.
#[derive(Debug, Default)]
pub struct DirMutation {
    pub dirty_ptrs: Vec<BlockPointer>,
    /// Previously readied infos made obsolete, including the info of a
    /// removed entry itself.
    pub unrefs: Vec<BlockInfo>,
    /// Estimated bytes newly made dirty, for write-buffer accounting.
    pub newly_dirtied_bytes: u64,
}

impl DirMutation {
    fn push_dirty(&mut self, ptrs: &[BlockPointer]) {
        for ptr in ptrs {
            if !self.dirty_ptrs.contains(ptr) {
                self.dirty_ptrs.push(*ptr);
            }
        }
    }
}

/// Directory entries as a tree of name-ordered leaves.
pub struct DirData {
    tree: BlockTree<DirBlock>,
    splitter: Arc<dyn BlockSplitter>,
}

impl DirData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        container: ContainerId,
        root: BlockInfo,
        getter: Arc<dyn BlockGetter<DirBlock>>,
        cacher: Arc<dyn DirtyBlockCacher<DirBlock>>,
        dirty: Arc<dyn IsBlockDirty>,
        crypto: Arc<dyn Crypto>,
        kmd: Arc<dyn KeyMetadata>,
        splitter: Arc<dyn BlockSplitter>,
        config: Config,
    ) -> Self {
        let tree = BlockTree::new(
            container,
            root,
            getter,
            cacher,
            dirty,
            crypto,
            kmd,
            splitter.max_ptrs_per_block(),
            config.max_parallel_block_fetches,
        );
        Self { tree, splitter }
    }

    pub fn tree(&self) -> &BlockTree<DirBlock> {
        &self.tree
    }

    /// Find one entry by name.
    pub async fn lookup(&self, name: &str) -> Result<DirEntry, DirError> {
        let off = SmolStr::new(name);
        let at = self.tree.get_block_at_offset(&off, BlockReq::Read).await?;
        at.block
            .children
            .get(&off)
            .cloned()
            .ok_or_else(|| DirError::NotFound(off))
    }

    /// All entries of the directory, in name order.
    pub async fn get_entries(&self) -> Result<BTreeMap<SmolStr, DirEntry>, TreeError> {
        let (top, _) = self.tree.root_block(BlockReq::Read).await?;
        let fetched = self
            .tree
            .get_blocks_for_offset_range(&top, RangeFetchOpts::new(SmolStr::default()))
            .await?;
        let mut out = BTreeMap::new();
        for fp in fetched.paths {
            if let Some(block) = fp.block {
                out.extend(block.children);
            }
        }
        Ok(out)
    }

    /// Insert a new entry; fails if the name is taken.
    pub async fn add_entry(&self, name: &str, entry: DirEntry) -> Result<DirMutation, DirError> {
        self.set_entry(name, entry, false).await
    }

    /// Replace an existing entry; fails if the name is unknown.
    pub async fn update_entry(&self, name: &str, entry: DirEntry) -> Result<DirMutation, DirError> {
        self.set_entry(name, entry, true).await
    }

    async fn set_entry(
        &self,
        name: &str,
        entry: DirEntry,
        must_exist: bool,
    ) -> Result<DirMutation, DirError> {
        let off = SmolStr::new(name);
        let at = self.tree.get_block_at_offset(&off, BlockReq::Write).await?;
        let mut block = at.block;
        let exists = block.children.contains_key(&off);
        if must_exist && !exists {
            return Err(DirError::NotFound(off));
        }
        if !must_exist && exists {
            return Err(DirError::Exists(off));
        }

        let mut res = DirMutation::default();
        let old_len = block.data_len();
        if let Some(old) = block.children.insert(off.clone(), entry) {
            if old.info.is_readied() {
                res.unrefs.push(old.info);
            }
        }
        res.newly_dirtied_bytes = if at.was_dirty {
            block.data_len().saturating_sub(old_len)
        } else {
            block.data_len()
        };

        let over_capacity = block.children.len() > self.splitter.max_dir_entries_per_block();
        self.finish_leaf(at.ptr, block.clone(), at.parents, &mut res)
            .await?;
        if over_capacity {
            self.split_leaf(at.ptr, block, &mut res).await?;
        }
        Ok(res)
    }

    /// Remove one entry by name; the entry's own info joins the unref set
    /// so the commit drops its whole subtree.
    pub async fn remove_entry(&self, name: &str) -> Result<DirMutation, DirError> {
        let off = SmolStr::new(name);
        let at = self.tree.get_block_at_offset(&off, BlockReq::Write).await?;
        let mut block = at.block;
        let Some(removed) = block.children.remove(&off) else {
            return Err(DirError::NotFound(off));
        };
        let mut res = DirMutation::default();
        if removed.info.is_readied() {
            res.unrefs.push(removed.info);
        }
        self.finish_leaf(at.ptr, block, at.parents, &mut res).await?;
        Ok(res)
    }

    /// Cache the mutated leaf and dirty its ancestor chain.
    async fn finish_leaf(
        &self,
        ptr: BlockPointer,
        block: DirBlock,
        mut parents: crate::tree::Path<DirBlock>,
        res: &mut DirMutation,
    ) -> Result<(), TreeError> {
        self.tree.cache_dirty(&ptr, &block).await?;
        res.push_dirty(&[ptr]);
        let (dp, ur) = self.tree.mark_parents_dirty(&mut parents).await?;
        res.push_dirty(&dp);
        res.unrefs.extend(ur);
        Ok(())
    }

    /// Split an over-capacity leaf: keep the low half in place and move
    /// the high half into a new block keyed by its first name, shifted
    /// into position.
    async fn split_leaf(
        &self,
        ptr: BlockPointer,
        mut block: DirBlock,
        res: &mut DirMutation,
    ) -> Result<(), TreeError> {
        let n = block.children.len();
        let split_key = block
            .children
            .keys()
            .nth(n / 2)
            .cloned()
            .expect("split point within entry count");
        let moved = block.children.split_off(&split_key);
        trace!(%split_key, moved = moved.len(), "splitting directory leaf");
        self.tree.cache_dirty(&ptr, &block).await?;

        let rightmost = self.tree.get_rightmost_block(BlockReq::Write).await?;
        let mut top_now = match rightmost.parents.first() {
            Some(s) => s.block.clone(),
            None => rightmost.block.clone(),
        };
        let mut grown = self
            .tree
            .new_right_block(&rightmost.parents, &mut top_now, split_key, false)
            .await?;
        res.push_dirty(&grown.dirty_ptrs);
        let (dp, ur) = self.tree.mark_parents_dirty(&mut grown.parents).await?;
        res.push_dirty(&dp);
        res.unrefs.extend(ur);
        let new_leaf = DirBlock::direct(moved);
        self.tree.cache_dirty(&grown.leaf_ptr, &new_leaf).await?;

        let shift = self.tree.shift_blocks_to_fill_hole(grown.parents).await?;
        res.push_dirty(&shift.dirty_ptrs);
        res.unrefs.extend(shift.unrefs);
        res.newly_dirtied_bytes += shift.newly_dirtied_bytes;
        Ok(())
    }

    /// A cheap upper bound on the directory's serialized size. Assumes
    /// every subtree under the root is fully packed, so it overestimates,
    /// deliberately; computing the exact size would fetch the whole tree.
    pub async fn size_estimate(&self) -> Result<u64, TreeError> {
        let (top, _) = self.tree.root_block(BlockReq::Read).await?;
        if !top.is_indirect() {
            return Ok(top.data_len());
        }
        Ok(top.num_children() as u64
            * self.splitter.max_dir_entries_per_block() as u64
            * ENTRY_OVERHEAD)
    }

    /// Finalize every dirty block below the root for upload. See
    /// [`BlockTree::ready`].
    pub async fn ready(
        &self,
        readier: &dyn BlockReadier<DirBlock>,
        puts: &dyn BlockPutState<DirBlock>,
        on_synced: Option<&(dyn Fn(BlockPointer) -> SyncedCb + Send + Sync)>,
    ) -> Result<std::collections::HashMap<BlockInfo, BlockPointer>, TreeError> {
        let (top, _) = self.tree.root_block(BlockReq::Write).await?;
        self.tree.ready(&top, readier, puts, on_synced).await
    }
}
