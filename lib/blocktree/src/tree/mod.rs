//! The generic indirect-block-tree engine.
//!
//! A tree is a root block plus zero or more levels of indirect blocks whose
//! slots are ordered by offset; leaves hold the actual content. The engine
//! owns every structural algorithm — locating a leaf, enumerating dirty
//! leaves, growing the tree on the right, shifting a misplaced block into a
//! hole, and the bottom-up readying pass — and stays agnostic of the leaf
//! content through [`TreeBlock`].
//!
//! The engine is synchronous per call: it suspends only inside the injected
//! [`BlockGetter`] and at the range-fetch barrier. Callers serialize
//! mutations to one container; the engine never mutates a cached block in
//! place, it always works on the exclusively-owned copy a write-intent
//! fetch returns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use smallvec::SmallVec;
use tracing::trace;

use crate::block::{IndirectPointer, Offset, TreeBlock};
use crate::errors::TreeError;
use crate::interfaces::{
    BlockGetter,
    BlockPutState,
    BlockReadier,
    BlockReq,
    Crypto,
    DirtyBlockCacher,
    IsBlockDirty,
    KeyMetadata,
    SyncedCb,
};
use crate::types::{BlockContext, BlockDirectType, BlockInfo, BlockPointer, ContainerId};

mod fetch;

pub use fetch::{FetchedPath, RangeFetchOpts, RangeFetchResult};

/// One step on a root-to-leaf path: a parent block and the index of the
/// child being descended into. Owned by the traversal that produced it;
/// never stored past the enclosing call.
#[derive(Clone, Debug)]
pub struct PathStep<B: TreeBlock> {
    pub ptr: BlockPointer,
    pub block: B,
    pub child_index: usize,
}

impl<B: TreeBlock> PathStep<B> {
    /// The slot this step descends through.
    pub fn slot(&self) -> &IndirectPointer<B::Off> {
        &self.block.children()[self.child_index]
    }
}

/// A root-to-parent path. The leaf itself is carried separately.
pub type Path<B> = SmallVec<[PathStep<B>; 4]>;

/// The leaf found by [`BlockTree::get_block_at_offset`].
#[derive(Debug)]
pub struct BlockAtOffset<B: TreeBlock> {
    pub ptr: BlockPointer,
    pub block: B,
    pub parents: Path<B>,
    /// The offset this leaf's content begins at.
    pub start_off: B::Off,
    /// Where the next sibling leaf begins; `None` if this is the rightmost
    /// leaf of the tree.
    pub next_block_start_off: Option<B::Off>,
    pub was_dirty: bool,
}

/// A dirty leaf found by [`BlockTree::get_next_dirty_block_at_offset`].
#[derive(Debug)]
pub struct NextDirtyBlock<B: TreeBlock> {
    pub ptr: BlockPointer,
    pub block: B,
    pub parents: Path<B>,
    pub start_off: B::Off,
    /// Continuation cursor: feed this back in to resume the enumeration,
    /// stop when it is `None`.
    pub next_block_start_off: Option<B::Off>,
}

/// Result of growing the tree with a new rightmost leaf.
#[derive(Debug)]
pub struct NewRightBlock<B: TreeBlock> {
    /// The path to the new leaf's parent chain.
    pub parents: Path<B>,
    pub leaf_ptr: BlockPointer,
    pub dirty_ptrs: Vec<BlockPointer>,
}

/// Result of shifting a freshly appended block leftward into a hole.
#[derive(Debug, Default)]
pub struct ShiftResult {
    pub dirty_ptrs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockInfo>,
    /// Direct-content bytes newly made dirty, for write-buffer accounting.
    pub newly_dirtied_bytes: u64,
}

/// The generic block-tree engine for one container.
pub struct BlockTree<B: TreeBlock> {
    container: ContainerId,
    root: BlockInfo,
    getter: Arc<dyn BlockGetter<B>>,
    cacher: Arc<dyn DirtyBlockCacher<B>>,
    dirty: Arc<dyn IsBlockDirty>,
    crypto: Arc<dyn Crypto>,
    kmd: Arc<dyn KeyMetadata>,
    max_ptrs_per_block: usize,
    max_parallel_fetches: usize,
}

impl<B: TreeBlock> BlockTree<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        container: ContainerId,
        root: BlockInfo,
        getter: Arc<dyn BlockGetter<B>>,
        cacher: Arc<dyn DirtyBlockCacher<B>>,
        dirty: Arc<dyn IsBlockDirty>,
        crypto: Arc<dyn Crypto>,
        kmd: Arc<dyn KeyMetadata>,
        max_ptrs_per_block: usize,
        max_parallel_fetches: usize,
    ) -> Self {
        Self {
            container,
            root,
            getter,
            cacher,
            dirty,
            crypto,
            kmd,
            max_ptrs_per_block,
            max_parallel_fetches,
        }
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn root_info(&self) -> BlockInfo {
        self.root
    }

    /// Fetch the root block.
    pub async fn root_block(&self, req: BlockReq) -> Result<(B, bool), TreeError> {
        Ok(self
            .getter
            .get_block(&self.container, &self.root.ptr, req)
            .await?)
    }

    /// A pointer for a brand-new block, identified by a random temporary ID
    /// until the readying pass assigns its content address.
    pub(crate) fn new_temp_ptr(&self, direct: BlockDirectType) -> BlockPointer {
        BlockPointer {
            id: self.crypto.make_temporary_id(),
            key_gen: self.kmd.latest_key_gen(),
            data_ver: self.kmd.data_version(),
            context: BlockContext::first(self.kmd.charged_to()),
            direct,
        }
    }

    pub(crate) fn kmd(&self) -> &dyn KeyMetadata {
        &*self.kmd
    }

    pub(crate) fn crypto(&self) -> &dyn Crypto {
        &*self.crypto
    }

    pub(crate) fn getter(&self) -> &Arc<dyn BlockGetter<B>> {
        &self.getter
    }

    pub(crate) fn cacher(&self) -> &Arc<dyn DirtyBlockCacher<B>> {
        &self.cacher
    }

    pub(crate) async fn cache_dirty(&self, ptr: &BlockPointer, block: &B) -> Result<(), TreeError> {
        self.cacher.cache_dirty(&self.container, ptr, block).await
    }

    /// Move the slot a path descends through to a new offset, propagating
    /// the change up the chain when the slot is its parent's leftmost.
    /// Used when a leaf boundary moves, e.g. on a re-split.
    pub(crate) async fn set_slot_offset(
        &self,
        path: &mut Path<B>,
        new_off: B::Off,
    ) -> Result<ShiftResult, TreeError> {
        let mut res = ShiftResult::default();
        let mut seen = HashSet::new();
        let last = path.len() - 1;
        let idx = path[last].child_index;
        path[last].block.children_mut()[idx].off = new_off;
        self.cacher
            .cache_dirty(&self.container, &path[last].ptr, &path[last].block)
            .await?;
        if seen.insert(path[last].ptr) {
            res.dirty_ptrs.push(path[last].ptr);
        }
        if idx == 0 {
            self.fix_parent_offsets(path, &mut res, &mut seen).await?;
        }
        Ok(res)
    }

    /// Descend from the root to the leaf covering `off`.
    ///
    /// Within each indirect block the rightmost child whose offset is `<=
    /// off` is taken (ties go to the exact match). Any fetch error aborts
    /// the whole call; no partial path is returned.
    pub async fn get_block_at_offset(
        &self,
        off: &B::Off,
        req: BlockReq,
    ) -> Result<BlockAtOffset<B>, TreeError> {
        let (mut block, mut was_dirty) = self.root_block(req).await?;
        let mut ptr = self.root.ptr;
        let mut parents = Path::new();
        let mut start_off = B::Off::zero();
        let mut next_block_start_off = None;

        while block.is_indirect() && block.num_children() > 0 {
            let children = block.children();
            let idx = match children.partition_point(|c| c.off <= *off) {
                0 => 0,
                n => n - 1,
            };
            start_off = children[idx].off.clone();
            if idx + 1 < children.len() {
                next_block_start_off = Some(children[idx + 1].off.clone());
            }
            let child_ptr = children[idx].info.ptr;
            parents.push(PathStep {
                ptr,
                block: block.clone(),
                child_index: idx,
            });
            let (child, child_dirty) = self
                .getter
                .get_block(&self.container, &child_ptr, req)
                .await?;
            ptr = child_ptr;
            block = child;
            was_dirty = child_dirty;
        }

        Ok(BlockAtOffset {
            ptr,
            block,
            parents,
            start_off,
            next_block_start_off,
            was_dirty,
        })
    }

    /// Descend to the rightmost leaf of the tree, taking the last child at
    /// every level.
    pub async fn get_rightmost_block(&self, req: BlockReq) -> Result<BlockAtOffset<B>, TreeError> {
        let (mut block, mut was_dirty) = self.root_block(req).await?;
        let mut ptr = self.root.ptr;
        let mut parents = Path::new();
        let mut start_off = B::Off::zero();

        while block.is_indirect() && block.num_children() > 0 {
            let idx = block.num_children() - 1;
            start_off = block.children()[idx].off.clone();
            let child_ptr = block.children()[idx].info.ptr;
            parents.push(PathStep {
                ptr,
                block: block.clone(),
                child_index: idx,
            });
            let (child, child_dirty) = self
                .getter
                .get_block(&self.container, &child_ptr, req)
                .await?;
            ptr = child_ptr;
            block = child;
            was_dirty = child_dirty;
        }

        Ok(BlockAtOffset {
            ptr,
            block,
            parents,
            start_off,
            next_block_start_off: None,
            was_dirty,
        })
    }

    /// Find the first dirty leaf whose content lies at or after `off`,
    /// without fetching any clean subtree.
    ///
    /// The returned continuation cursor drives a restartable, finite
    /// iteration over all dirty leaves: feed `next_block_start_off` back in
    /// until it is `None`, stopping early when no block comes back at all.
    pub async fn get_next_dirty_block_at_offset(
        &self,
        top: &B,
        off: &B::Off,
    ) -> Result<Option<NextDirtyBlock<B>>, TreeError> {
        if !self.dirty.is_dirty(&self.container, &self.root.ptr) {
            return Ok(None);
        }
        if !top.is_indirect() {
            return Ok(Some(NextDirtyBlock {
                ptr: self.root.ptr,
                block: top.clone(),
                parents: Path::new(),
                start_off: B::Off::zero(),
                next_block_start_off: None,
            }));
        }
        let (found, _) = self
            .next_dirty_at_level(top, self.root.ptr, off, Path::new())
            .await?;
        Ok(found)
    }

    /// Recursive scan over one indirect block. Returns the found leaf (if
    /// any) and the continuation cursor: the exhausted case reports this
    /// block's own first offset so the caller can detect that nothing to
    /// the right qualified.
    fn next_dirty_at_level<'a>(
        &'a self,
        pblock: &'a B,
        pptr: BlockPointer,
        off: &'a B::Off,
        parents: Path<B>,
    ) -> BoxFuture<'a, Result<(Option<NextDirtyBlock<B>>, Option<B::Off>), TreeError>> {
        async move {
            let children = pblock.children();
            let n = children.len();
            for i in 0..n {
                let c = &children[i];
                if c.off < *off {
                    // Only the child whose gap contains the target offset
                    // needs checking among those left of it.
                    let holds_gap = i + 1 == n || children[i + 1].off > *off;
                    if !holds_gap {
                        continue;
                    }
                }
                if !self.dirty.is_dirty(&self.container, &c.info.ptr) {
                    continue;
                }
                let (child, _) = self
                    .getter
                    .get_block(&self.container, &c.info.ptr, BlockReq::Write)
                    .await?;
                let mut path = parents.clone();
                path.push(PathStep {
                    ptr: pptr,
                    block: pblock.clone(),
                    child_index: i,
                });
                if child.is_indirect() {
                    let (found, cont) = self
                        .next_dirty_at_level(&child, c.info.ptr, off, path)
                        .await?;
                    if let Some(mut found) = found {
                        let cont = match cont {
                            Some(o) => Some(o),
                            None => children.get(i + 1).map(|c| c.off.clone()),
                        };
                        found.next_block_start_off = cont.clone();
                        return Ok((Some(found), cont));
                    }
                    // Nothing at-or-after `off` under this child; keep
                    // scanning to the right.
                } else {
                    let next = children.get(i + 1).map(|c| c.off.clone());
                    return Ok((
                        Some(NextDirtyBlock {
                            ptr: c.info.ptr,
                            block: child,
                            parents: path,
                            start_off: c.off.clone(),
                            next_block_start_off: next.clone(),
                        }),
                        next,
                    ));
                }
            }
            Ok((None, Some(pblock.first_offset())))
        }
        .boxed()
    }

    /// Mark every block on `parents` dirty, clearing (and collecting for
    /// unreference) the encoded size of each slot descended through.
    pub async fn mark_parents_dirty(
        &self,
        parents: &mut Path<B>,
    ) -> Result<(Vec<BlockPointer>, Vec<BlockInfo>), TreeError> {
        let mut dirty_ptrs = Vec::with_capacity(parents.len());
        let mut unrefs = Vec::new();
        for step in parents.iter_mut() {
            let slot = &mut step.block.children_mut()[step.child_index];
            if slot.info.is_readied() {
                unrefs.push(slot.info);
                slot.info.encoded_size = 0;
            }
            self.cacher
                .cache_dirty(&self.container, &step.ptr, &step.block)
                .await?;
            dirty_ptrs.push(step.ptr);
        }
        Ok((dirty_ptrs, unrefs))
    }

    /// Grow the tree with a new rightmost leaf whose content begins at
    /// `off`.
    ///
    /// `parents` must be the path to the current rightmost leaf (empty when
    /// the root is direct) and `top_block` the root fetched for write. If
    /// no ancestor up to the root has spare fan-out, a new indirect root is
    /// created one level higher; the new root keeps the old root's pointer
    /// identity so existing references remain valid, and the old root's
    /// content moves under a fresh pointer as its sole child.
    pub async fn new_right_block(
        &self,
        parents: &Path<B>,
        top_block: &mut B,
        off: B::Off,
        holes: bool,
    ) -> Result<NewRightBlock<B>, TreeError> {
        let mut dirty_ptrs = Vec::new();
        let mut path: Path<B> = parents.clone();

        // Lowest ancestor with spare fan-out, scanning from the leaf up.
        let mut ancestor_idx = path
            .iter()
            .rposition(|s| s.block.num_children() < self.max_ptrs_per_block);
        let root_has_room =
            top_block.is_indirect() && top_block.num_children() < self.max_ptrs_per_block;
        if path.is_empty() && root_has_room {
            path.push(PathStep {
                ptr: self.root.ptr,
                block: top_block.clone(),
                child_index: top_block.num_children().saturating_sub(1),
            });
            ancestor_idx = Some(0);
        }

        let ancestor_idx = match ancestor_idx {
            Some(i) => i,
            None => {
                // Every level is full (or the root is still direct): add a
                // level of indirection at the top.
                trace!(container = self.container.0, "adding a new tree level");
                let old_root = std::mem::replace(top_block, B::new_empty(true));
                let old_direct = if old_root.is_indirect() {
                    BlockDirectType::Indirect
                } else {
                    BlockDirectType::Direct
                };
                let old_off = old_root.first_offset();
                let demoted_ptr = self.new_temp_ptr(old_direct);
                top_block.append_child(IndirectPointer::new(
                    BlockInfo::new(demoted_ptr),
                    old_off,
                ));
                self.cache_dirty(&demoted_ptr, &old_root).await?;
                dirty_ptrs.push(demoted_ptr);
                self.cache_dirty(&self.root.ptr, top_block).await?;
                dirty_ptrs.push(self.root.ptr);

                let mut new_path = Path::new();
                new_path.push(PathStep {
                    ptr: self.root.ptr,
                    block: top_block.clone(),
                    child_index: 0,
                });
                for (i, mut step) in path.into_iter().enumerate() {
                    if i == 0 {
                        // The old root now lives under the demoted pointer.
                        step.ptr = demoted_ptr;
                    }
                    new_path.push(step);
                }
                path = new_path;
                0
            },
        };

        // From the ancestor with room down to the leaf level, allocate one
        // fresh block per level and append it as the new last child.
        let leaf_level = path.len();
        let mut leaf_ptr = None;
        for depth in ancestor_idx..leaf_level {
            let is_leaf_child = depth + 1 == leaf_level;
            let child_ptr = self.new_temp_ptr(if is_leaf_child {
                BlockDirectType::Direct
            } else {
                BlockDirectType::Indirect
            });
            let step = &mut path[depth];
            let mut slot = IndirectPointer::new(BlockInfo::new(child_ptr), off.clone());
            slot.holes = holes;
            step.block.append_child(slot);
            step.child_index = step.block.num_children() - 1;
            self.cacher
                .cache_dirty(&self.container, &step.ptr, &step.block)
                .await?;
            dirty_ptrs.push(step.ptr);

            let child = B::new_empty(!is_leaf_child);
            self.cache_dirty(&child_ptr, &child).await?;
            dirty_ptrs.push(child_ptr);
            if is_leaf_child {
                leaf_ptr = Some(child_ptr);
            } else {
                path[depth + 1] = PathStep {
                    ptr: child_ptr,
                    block: child,
                    child_index: 0,
                };
            }
        }
        // Keep the root step in sync when the ancestor was the caller's
        // top block.
        if ancestor_idx == 0 {
            *top_block = path[0].block.clone();
        }

        let leaf_ptr = leaf_ptr.expect("grow always allocates a leaf");
        Ok(NewRightBlock {
            parents: path,
            leaf_ptr,
            dirty_ptrs,
        })
    }

    /// After [`Self::new_right_block`] appended a block whose offset is
    /// actually less than its left neighbor's (a hole is being filled out
    /// of order), walk it leftward, pairwise swapping with the left
    /// neighbor — crossing parent boundaries through the nearest common
    /// ancestor when needed — until the neighbor's offset is smaller.
    ///
    /// Ancestor offset markers are updated along the way whenever the
    /// moved block lands in a leftmost slot, since a parent's own position
    /// key is its leftmost child's offset.
    pub async fn shift_blocks_to_fill_hole(
        &self,
        path: Path<B>,
    ) -> Result<ShiftResult, TreeError> {
        let mut res = ShiftResult::default();
        let mut dirty_seen = HashSet::new();
        let mut path = path;

        loop {
            let last = path.len() - 1;
            let j = path[last].child_index;
            let moved_off = path[last].block.children()[j].off.clone();

            if j > 0 {
                if path[last].block.children()[j - 1].off < moved_off {
                    break;
                }
                // Swap with the left sibling inside the same parent.
                path[last].block.children_mut().swap(j - 1, j);
                path[last].child_index = j - 1;
                self.dirty_chain(&mut path, &mut res, &mut dirty_seen)
                    .await?;
                if j - 1 == 0 {
                    self.fix_parent_offsets(&mut path, &mut res, &mut dirty_seen)
                        .await?;
                }
                continue;
            }

            // The moved block is the leftmost child here; find the nearest
            // ancestor where we can still go left.
            let Some(pivot) = (0..last).rev().find(|&l| path[l].child_index > 0) else {
                break; // true left edge of the tree
            };

            // Descend the rightmost spine of the pivot's left sibling down
            // to the moved block's level.
            let mut cousin: Path<B> = Path::new();
            let mut cptr =
                path[pivot].block.children()[path[pivot].child_index - 1].info.ptr;
            for _depth in pivot + 1..=last {
                let (cblock, _) = self
                    .getter
                    .get_block(&self.container, &cptr, BlockReq::Write)
                    .await?;
                let ci = cblock.num_children() - 1;
                let next_ptr = cblock.children()[ci].info.ptr;
                cousin.push(PathStep {
                    ptr: cptr,
                    block: cblock,
                    child_index: ci,
                });
                cptr = next_ptr;
            }

            let k = cousin[cousin.len() - 1].child_index;
            if cousin[cousin.len() - 1].block.children()[k].off < moved_off {
                break;
            }

            // Swap across the parent boundary. Both swapped leaves change
            // parentage, so both are re-cached dirty.
            let cousin_last = cousin.len() - 1;
            let a_entry = path[last].block.children()[0].clone();
            let b_entry = cousin[cousin_last].block.children()[k].clone();
            path[last].block.children_mut()[0] = b_entry.clone();
            cousin[cousin_last].block.children_mut()[k] = a_entry.clone();
            for entry in [&a_entry, &b_entry] {
                let (leaf, was_dirty) = self
                    .getter
                    .get_block(&self.container, &entry.info.ptr, BlockReq::Write)
                    .await?;
                if !was_dirty {
                    res.newly_dirtied_bytes += leaf.data_len();
                }
                self.cache_dirty(&entry.info.ptr, &leaf).await?;
                if dirty_seen.insert(entry.info.ptr) {
                    res.dirty_ptrs.push(entry.info.ptr);
                }
            }

            // Old chain: its leftmost entry changed, so fix offsets up to
            // the pivot before abandoning it.
            self.dirty_chain(&mut path, &mut res, &mut dirty_seen)
                .await?;
            self.fix_parent_offsets(&mut path, &mut res, &mut dirty_seen)
                .await?;

            // Continue from the cousin chain, with the moved block at its
            // rightmost slot.
            let mut new_path: Path<B> = path.iter().take(pivot + 1).cloned().collect();
            new_path[pivot].child_index -= 1;
            new_path.extend(cousin);
            path = new_path;
            self.dirty_chain(&mut path, &mut res, &mut dirty_seen)
                .await?;
            if k == 0 {
                self.fix_parent_offsets(&mut path, &mut res, &mut dirty_seen)
                    .await?;
            }
        }

        Ok(res)
    }

    /// Cache every block on the current chain dirty, clearing readied slot
    /// sizes along the way.
    async fn dirty_chain(
        &self,
        path: &mut Path<B>,
        res: &mut ShiftResult,
        seen: &mut HashSet<BlockPointer>,
    ) -> Result<(), TreeError> {
        for step in path.iter_mut() {
            let slot = &mut step.block.children_mut()[step.child_index];
            if slot.info.is_readied() {
                res.unrefs.push(slot.info);
                slot.info.encoded_size = 0;
            }
            self.cacher
                .cache_dirty(&self.container, &step.ptr, &step.block)
                .await?;
            if seen.insert(step.ptr) {
                res.dirty_ptrs.push(step.ptr);
            }
        }
        Ok(())
    }

    /// Propagate a changed leftmost-child offset up the chain.
    async fn fix_parent_offsets(
        &self,
        path: &mut Path<B>,
        res: &mut ShiftResult,
        seen: &mut HashSet<BlockPointer>,
    ) -> Result<(), TreeError> {
        for lvl in (1..path.len()).rev() {
            let child_first = path[lvl].block.first_offset();
            let pidx = path[lvl - 1].child_index;
            if path[lvl - 1].block.children()[pidx].off == child_first {
                break;
            }
            path[lvl - 1].block.children_mut()[pidx].off = child_first;
            self.cacher
                .cache_dirty(&self.container, &path[lvl - 1].ptr, &path[lvl - 1].block)
                .await?;
            if seen.insert(path[lvl - 1].ptr) {
                res.dirty_ptrs.push(path[lvl - 1].ptr);
            }
            if pidx != 0 {
                break;
            }
        }
        Ok(())
    }

    /// Ready every dirty block below the root for upload, bottom-up,
    /// visiting each physical block exactly once even when several dirty
    /// leaves share ancestors.
    ///
    /// Returns a map from each newly minted [`BlockInfo`] to the old
    /// pointer it replaces; the caller turns that into the unreference set
    /// for the revision commit. The root block itself is never readied
    /// here — its pointer is owned by the container's directory entry, not
    /// by a parent slot.
    pub async fn ready(
        &self,
        top_block: &B,
        readier: &dyn BlockReadier<B>,
        puts: &dyn BlockPutState<B>,
        on_synced: Option<&(dyn Fn(BlockPointer) -> SyncedCb + Send + Sync)>,
    ) -> Result<HashMap<BlockInfo, BlockPointer>, TreeError> {
        // Gather the root-to-dirty-leaf paths, plus one authoritative copy
        // of every block involved.
        let mut paths: Vec<Vec<(BlockPointer, usize)>> = Vec::new();
        let mut blocks: HashMap<BlockPointer, B> = HashMap::new();
        let mut cursor = Some(B::Off::zero());
        while let Some(off) = cursor {
            let Some(found) = self.get_next_dirty_block_at_offset(top_block, &off).await? else {
                break;
            };
            let mut path = Vec::with_capacity(found.parents.len());
            for step in &found.parents {
                path.push((step.ptr, step.child_index));
                blocks
                    .entry(step.ptr)
                    .or_insert_with(|| step.block.clone());
            }
            blocks.insert(found.ptr, found.block);
            paths.push(path);
            cursor = found.next_block_start_off;
        }
        if paths.is_empty() {
            return Ok(HashMap::new());
        }

        let depth = paths[0].len();
        debug_assert!(paths.iter().all(|p| p.len() == depth), "uneven tree depth");
        trace!(
            container = self.container.0,
            leaves = paths.len(),
            depth,
            "readying dirty subtree"
        );

        let mut new_ptrs: HashSet<BlockPointer> = HashSet::new();
        let mut new_infos: HashMap<BlockInfo, BlockPointer> = HashMap::new();
        for level in (0..depth).rev() {
            let mut touched_parents: Vec<BlockPointer> = Vec::new();
            for path in &paths {
                let (parent_ptr, idx) = path[level];
                let old_ptr = {
                    let parent = &blocks[&parent_ptr];
                    parent.children()[idx].info.ptr
                };
                if new_ptrs.contains(&old_ptr) {
                    // Already readied through a sibling path in this pass.
                    continue;
                }
                let child = match blocks.get(&old_ptr) {
                    Some(b) => b.clone(),
                    None => {
                        self.getter
                            .get_block(&self.container, &old_ptr, BlockReq::Write)
                            .await?
                            .0
                    },
                };
                let (new_id, data) = readier.ready_block(&*self.kmd, &child).await?;
                let new_ptr = BlockPointer {
                    id: new_id,
                    key_gen: self.kmd.latest_key_gen(),
                    data_ver: self.kmd.data_version(),
                    context: BlockContext::first(self.kmd.charged_to()),
                    direct: old_ptr.direct,
                };
                let new_info = BlockInfo {
                    ptr: new_ptr,
                    encoded_size: data.encoded_size(),
                };
                puts.add_new_block(&new_ptr, &child, data, on_synced.map(|f| f(new_ptr)));
                new_ptrs.insert(new_ptr);
                new_infos.insert(new_info, old_ptr);

                let parent = blocks
                    .get_mut(&parent_ptr)
                    .expect("parent present in working set");
                parent.children_mut()[idx].info = new_info;
                blocks.insert(old_ptr, child);
                touched_parents.push(parent_ptr);
            }
            // Parents carry the stamped infos forward; re-cache them so
            // later reads in this revision see the new pointers.
            touched_parents.dedup();
            for ptr in touched_parents {
                self.cache_dirty(&ptr, &blocks[&ptr]).await?;
            }
        }

        Ok(new_infos)
    }

    /// Fetch all blocks covering `[start, end)`, walking the tree with a
    /// bounded worker pool. See [`RangeFetchOpts`].
    pub async fn get_blocks_for_offset_range(
        &self,
        top: &B,
        opts: RangeFetchOpts<B::Off>,
    ) -> Result<RangeFetchResult<B>, TreeError> {
        fetch::get_blocks_for_offset_range(self, top, opts, self.max_parallel_fetches).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_utils::{new_file, BincodeReadier, TestPutState};

    fn cfg(block_size: usize, fan_out: usize) -> Config {
        Config {
            block_size,
            max_ptrs_per_block: fan_out,
            ..Config::default()
        }
    }

    fn bytes(len: usize, seed: u8) -> Vec<u8> {
        vec![seed; len]
    }

    #[tokio::test]
    async fn locate_leaf_ties_go_to_the_exact_match() {
        let (fd, _store, _) = new_file(cfg(20, 4));
        fd.write(&bytes(45, 1), 0, 0).await.unwrap();
        let tree = fd.tree();

        let at = tree.get_block_at_offset(&20, BlockReq::Read).await.unwrap();
        assert_eq!(at.start_off, 20);
        assert_eq!(at.next_block_start_off, Some(40));
        assert_eq!(at.parents.len(), 1);
        assert_eq!(at.parents[0].child_index, 1);

        let at = tree.get_block_at_offset(&19, BlockReq::Read).await.unwrap();
        assert_eq!(at.start_off, 0);
        assert_eq!(at.next_block_start_off, Some(20));

        let at = tree.get_block_at_offset(&39, BlockReq::Read).await.unwrap();
        assert_eq!(at.start_off, 20);
    }

    #[tokio::test]
    async fn dirty_scan_skips_clean_subtrees() {
        let (fd, store, container) = new_file(cfg(8, 2));
        fd.write(&bytes(64, 2), 0, 0).await.unwrap();
        let puts = TestPutState::new(container, store.clone());
        fd.ready(&BincodeReadier, &puts, None).await.unwrap();
        store.commit_dirty(&container);

        // One byte deep in the tree dirties exactly one leaf spine.
        fd.write(&bytes(1, 3), 60, 64).await.unwrap();

        let tree = fd.tree();
        let (top, _) = tree.root_block(BlockReq::Write).await.unwrap();
        let mut found = Vec::new();
        let mut cursor = Some(0u64);
        while let Some(off) = cursor {
            let Some(d) = tree.get_next_dirty_block_at_offset(&top, &off).await.unwrap() else {
                break;
            };
            cursor = d.next_block_start_off;
            found.push(d.start_off);
        }
        assert_eq!(found, vec![56]);
    }

    #[tokio::test]
    async fn dirty_scan_finds_every_leaf_after_a_full_write() {
        let (fd, _store, _) = new_file(cfg(8, 2));
        fd.write(&bytes(40, 4), 0, 0).await.unwrap();

        let tree = fd.tree();
        let (top, _) = tree.root_block(BlockReq::Write).await.unwrap();
        let mut found = Vec::new();
        let mut cursor = Some(0u64);
        while let Some(off) = cursor {
            let Some(d) = tree.get_next_dirty_block_at_offset(&top, &off).await.unwrap() else {
                break;
            };
            cursor = d.next_block_start_off;
            found.push(d.start_off);
        }
        assert_eq!(found, vec![0, 8, 16, 24, 32]);
    }

    #[tokio::test]
    async fn mark_parents_dirty_clears_readied_slot_sizes() {
        let (fd, store, container) = new_file(cfg(20, 4));
        fd.write(&bytes(45, 5), 0, 0).await.unwrap();
        let puts = TestPutState::new(container, store.clone());
        fd.ready(&BincodeReadier, &puts, None).await.unwrap();
        store.commit_dirty(&container);

        let tree = fd.tree();
        let at = tree.get_block_at_offset(&25, BlockReq::Write).await.unwrap();
        let mut parents = at.parents;
        assert!(parents[0].slot().info.is_readied());

        let (dirty, unrefs) = tree.mark_parents_dirty(&mut parents).await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(unrefs.len(), 1);
        assert!(!parents[0].slot().info.is_readied());

        // A second pass has nothing left to unreference.
        let (_, unrefs) = tree.mark_parents_dirty(&mut parents).await.unwrap();
        assert!(unrefs.is_empty());
    }

    #[tokio::test]
    async fn growing_keeps_the_root_pointer_identity() {
        let (fd, _store, _) = new_file(cfg(8, 2));
        let root_before = fd.tree().root_info().ptr;
        fd.write(&bytes(64, 6), 0, 0).await.unwrap();
        // Several level additions later the root is still reachable under
        // its original pointer.
        assert_eq!(fd.tree().root_info().ptr, root_before);
        let (top, _) = fd.tree().root_block(BlockReq::Read).await.unwrap();
        assert!(top.is_indirect());
    }
}
