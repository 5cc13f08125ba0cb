//! The file-content adapter: byte-range reads, writes, truncation,
//! re-splitting, and deep copies over a [`BlockTree`] of [`FileBlock`]s.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::block::{FileBlock, TreeBlock};
use crate::config::Config;
use crate::errors::TreeError;
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
use crate::tree::{BlockTree, RangeFetchOpts, RangeFetchResult};
use crate::types::{BlockContext, BlockInfo, BlockPointer, ContainerId};

/// The outcome of one mutating file operation. The caller owns persisting
/// the dirty set and unreferencing the obsolete infos once the revision
/// commits.
#[derive(Debug, Default)]
pub struct FileMutation {
    /// The file's logical size after the operation.
    pub new_size: u64,
    pub dirty_ptrs: Vec<BlockPointer>,
    /// Previously readied infos that this operation made obsolete.
    pub unrefs: Vec<BlockInfo>,
    /// Direct-content bytes newly made dirty, for write-buffer accounting.
    pub newly_dirtied_bytes: u64,
    /// How much the logical file length grew.
    pub bytes_extended: u64,
}

impl FileMutation {
    fn push_dirty(&mut self, seen: &mut HashSet<BlockPointer>, ptrs: &[BlockPointer]) {
        for ptr in ptrs {
            if seen.insert(*ptr) {
                self.dirty_ptrs.push(*ptr);
            }
        }
    }
}

/// File content as a tree of byte blocks keyed by 64-bit offsets.
pub struct FileData {
    tree: BlockTree<FileBlock>,
    splitter: Arc<dyn BlockSplitter>,
    config: Config,
}

impl FileData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        container: ContainerId,
        root: BlockInfo,
        getter: Arc<dyn BlockGetter<FileBlock>>,
        cacher: Arc<dyn DirtyBlockCacher<FileBlock>>,
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
        Self {
            tree,
            splitter,
            config,
        }
    }

    pub fn tree(&self) -> &BlockTree<FileBlock> {
        &self.tree
    }

    /// Read file bytes starting at `off` into `dest`, zero-filling holes.
    /// The caller sizes `dest` from the file's logical size; every byte of
    /// it is written.
    pub async fn read(&self, dest: &mut [u8], off: u64) -> Result<u64, TreeError> {
        if dest.is_empty() {
            return Ok(0);
        }
        let end = off + dest.len() as u64;
        let (top, _) = self.tree.root_block(BlockReq::Read).await?;
        let mut opts = RangeFetchOpts::new(off).to(end);
        if let Some(d) = self.config.fetch_deadline {
            opts = opts.with_deadline(d);
        }
        let fetched = self.tree.get_blocks_for_offset_range(&top, opts).await?;

        dest.iter_mut().for_each(|b| *b = 0);
        for fp in &fetched.paths {
            let Some(block) = &fp.block else { continue };
            let bstart = fp.start_off;
            let bend = block.end_off(bstart);
            let from = off.max(bstart);
            let to = end.min(bend);
            if from >= to {
                continue;
            }
            let src = &block.contents[(from - bstart) as usize..(to - bstart) as usize];
            dest[(from - off) as usize..(to - off) as usize].copy_from_slice(src);
        }
        Ok(dest.len() as u64)
    }

    /// Convenience wrapper over [`Self::read`] for `[start, end)`.
    pub async fn get_bytes(&self, start: u64, end: u64) -> Result<Vec<u8>, TreeError> {
        let mut buf = vec![0; (end - start) as usize];
        self.read(&mut buf, start).await?;
        Ok(buf)
    }

    /// Write `data` at byte offset `off`. `cur_size` is the file's current
    /// logical size, used to detect hole fills and size growth.
    ///
    /// The top block is always marked dirty, even for a zero-byte write,
    /// so a concurrent sync is guaranteed to see this file as in-flight.
    pub async fn write(&self, data: &[u8], off: u64, cur_size: u64) -> Result<FileMutation, TreeError> {
        let n = data.len() as u64;
        let mut res = FileMutation::default();
        let mut seen = HashSet::new();
        let mut n_copied = 0u64;

        trace!(off, len = n, cur_size, "file write");
        while n_copied < n {
            let cursor = off + n_copied;
            let at = self.tree.get_block_at_offset(&cursor, BlockReq::Write).await?;
            let mut block = at.block;
            let mut parents = at.parents;
            let old_len = block.contents.len() as u64;
            let off_into = cursor - at.start_off;

            // Never copy past the next sibling's start.
            let max_copy = match at.next_block_start_off {
                Some(nb) => (nb - cursor).min(n - n_copied),
                None => n - n_copied,
            };
            let copied = self.splitter.copy_until_split(
                &mut block,
                at.next_block_start_off.is_none(),
                &data[n_copied as usize..(n_copied + max_copy) as usize],
                off_into,
            );
            if copied == 0 && off_into == 0 {
                // The policy refused to fill an empty leaf; a non-positive
                // fill length can never make progress.
                return Err(TreeError::BadSplit {
                    off: cursor,
                    copied: n_copied,
                    next_off: at.next_block_start_off.unwrap_or(cursor),
                });
            }
            n_copied += copied;

            if copied > 0 {
                let new_len = block.contents.len() as u64;
                res.newly_dirtied_bytes += if at.was_dirty {
                    new_len - old_len
                } else {
                    new_len
                };
                self.tree.cache_dirty(&at.ptr, &block).await?;
                res.push_dirty(&mut seen, &[at.ptr]);
                let (dp, ur) = self.tree.mark_parents_dirty(&mut parents).await?;
                res.push_dirty(&mut seen, &dp);
                res.unrefs.extend(ur);
            }

            if n_copied == n {
                break;
            }
            let stalled_mid_tree = matches!(at.next_block_start_off, Some(nb) if off + n_copied < nb);
            if at.next_block_start_off.is_none() || stalled_mid_tree {
                // Either no leaf exists to the right, or the splitter
                // stopped short of the next one (a hole inside the tree).
                // Grow with a new rightmost block at the cursor; when the
                // cursor lands before the rightmost edge, walk the block
                // left into its slot.
                let rightmost = self.tree.get_rightmost_block(BlockReq::Write).await?;
                let mut top_now = if rightmost.parents.is_empty() {
                    rightmost.block.clone()
                } else {
                    rightmost.parents[0].block.clone()
                };
                let grown = self
                    .tree
                    .new_right_block(&rightmost.parents, &mut top_now, off + n_copied, false)
                    .await?;
                res.push_dirty(&mut seen, &grown.dirty_ptrs);
                if stalled_mid_tree || off + n_copied < cur_size {
                    let shift = self.tree.shift_blocks_to_fill_hole(grown.parents).await?;
                    res.push_dirty(&mut seen, &shift.dirty_ptrs);
                    res.unrefs.extend(shift.unrefs);
                    res.newly_dirtied_bytes += shift.newly_dirtied_bytes;
                }
            }
        }

        let root_ptr = self.tree.root_info().ptr;
        let (top, _) = self.tree.root_block(BlockReq::Write).await?;
        self.tree.cache_dirty(&root_ptr, &top).await?;
        res.push_dirty(&mut seen, &[root_ptr]);

        res.bytes_extended = (off + n).saturating_sub(cur_size);
        res.new_size = cur_size + res.bytes_extended;
        Ok(res)
    }

    /// Extend the file to `size` by appending a new rightmost (empty) leaf
    /// at the target size, marking every new indirect pointer as covering
    /// a hole.
    pub async fn truncate_extend(&self, size: u64, cur_size: u64) -> Result<FileMutation, TreeError> {
        debug!(size, cur_size, "truncate extend");
        let mut res = FileMutation::default();
        let mut seen = HashSet::new();

        let at = self.tree.get_rightmost_block(BlockReq::Write).await?;
        let mut top_now = if at.parents.is_empty() {
            at.block.clone()
        } else {
            at.parents[0].block.clone()
        };
        let mut grown = self
            .tree
            .new_right_block(&at.parents, &mut top_now, size, true)
            .await?;
        res.push_dirty(&mut seen, &grown.dirty_ptrs);
        let (dp, ur) = self.tree.mark_parents_dirty(&mut grown.parents).await?;
        res.push_dirty(&mut seen, &dp);
        res.unrefs.extend(ur);

        let root_ptr = self.tree.root_info().ptr;
        let (top, _) = self.tree.root_block(BlockReq::Write).await?;
        self.tree.cache_dirty(&root_ptr, &top).await?;
        res.push_dirty(&mut seen, &[root_ptr]);

        res.bytes_extended = size - cur_size;
        res.new_size = size;
        Ok(res)
    }

    /// Shrink the file to `size`, trimming the leaf containing the new end
    /// and dropping every block past it. Leftmost-edge blocks are retained
    /// rather than de-indirected; a known inefficiency.
    pub async fn truncate_shrink(&self, size: u64) -> Result<FileMutation, TreeError> {
        debug!(size, "truncate shrink");
        let mut res = FileMutation::default();
        let mut seen = HashSet::new();

        // Gather the indirect structure beyond the new end before touching
        // anything, for the unreference sweep below.
        let (top, _) = self.tree.root_block(BlockReq::Write).await?;
        let beyond = if top.is_indirect() {
            Some(
                self.tree
                    .get_blocks_for_offset_range(
                        &top,
                        RangeFetchOpts::new(size).indirect_only(),
                    )
                    .await?,
            )
        } else {
            None
        };

        let at = self.tree.get_block_at_offset(&size, BlockReq::Write).await?;
        let mut block = at.block;
        let mut parents = at.parents;
        let keep = size.saturating_sub(at.start_off) as usize;
        if block.contents.len() > keep {
            // The fetched block is an exclusively owned copy; trim in
            // place and re-cache.
            block.contents.truncate(keep);
        }
        self.tree.cache_dirty(&at.ptr, &block).await?;
        res.push_dirty(&mut seen, &[at.ptr]);
        let (dp, ur) = self.tree.mark_parents_dirty(&mut parents).await?;
        res.push_dirty(&mut seen, &dp);
        res.unrefs.extend(ur);

        // Truncate each parent's child list just past the path to the end
        // leaf, then unreference everything that fell off.
        let mut dropped_roots: HashSet<BlockPointer> = HashSet::new();
        let mut unref_seen: HashSet<BlockPointer> = HashSet::new();
        for step in parents.iter_mut() {
            let cut = step.child_index + 1;
            for slot in &step.block.children()[cut..] {
                dropped_roots.insert(slot.info.ptr);
                if slot.info.is_readied() && unref_seen.insert(slot.info.ptr) {
                    res.unrefs.push(slot.info);
                }
            }
            if step.block.num_children() > cut {
                step.block.children_mut().truncate(cut);
                self.tree.cache_dirty(&step.ptr, &step.block).await?;
                res.push_dirty(&mut seen, &[step.ptr]);
            }
        }
        if let Some(beyond) = beyond {
            for fp in &beyond.paths {
                for pstep in &fp.parents {
                    if dropped_roots.contains(&pstep.ptr) {
                        for slot in pstep.block.children() {
                            dropped_roots.insert(slot.info.ptr);
                            if slot.info.is_readied() && unref_seen.insert(slot.info.ptr) {
                                res.unrefs.push(slot.info);
                            }
                        }
                    }
                }
            }
        }

        let root_ptr = self.tree.root_info().ptr;
        let (top, _) = self.tree.root_block(BlockReq::Write).await?;
        self.tree.cache_dirty(&root_ptr, &top).await?;
        res.push_dirty(&mut seen, &[root_ptr]);

        res.new_size = size;
        Ok(res)
    }

    /// Re-split dirty leaves against the splitter's fingerprint policy,
    /// shedding overflow into each leaf's successor (creating one for the
    /// rightmost leaf). Returns the pointers newly dirtied.
    pub async fn resplit(&self) -> Result<Vec<BlockPointer>, TreeError> {
        let mut dirty = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(0u64);
        while let Some(off) = cursor {
            let (top, _) = self.tree.root_block(BlockReq::Write).await?;
            let Some(found) = self.tree.get_next_dirty_block_at_offset(&top, &off).await? else {
                break;
            };
            cursor = found.next_block_start_off.clone();
            let excess = self.splitter.check_split(&found.block);
            if excess == 0 {
                continue;
            }

            let mut block = found.block;
            let mut parents = found.parents;
            let keep = block.contents.len().saturating_sub(excess as usize);
            let overflow = block.contents.split_off(keep);
            let boundary = found.start_off + keep as u64;
            trace!(off = found.start_off, excess, "re-splitting leaf");
            self.tree.cache_dirty(&found.ptr, &block).await?;
            if seen.insert(found.ptr) {
                dirty.push(found.ptr);
            }
            let (dp, _) = self.tree.mark_parents_dirty(&mut parents).await?;
            for p in dp {
                if seen.insert(p) {
                    dirty.push(p);
                }
            }

            match found.next_block_start_off {
                Some(next_start) => {
                    // Prepend the overflow to the successor and move its
                    // boundary left.
                    let nat = self.tree.get_block_at_offset(&next_start, BlockReq::Write).await?;
                    let mut nb = nat.block;
                    let mut nparents = nat.parents;
                    nb.contents.splice(0..0, overflow);
                    self.tree.cache_dirty(&nat.ptr, &nb).await?;
                    if seen.insert(nat.ptr) {
                        dirty.push(nat.ptr);
                    }
                    let (dp, _) = self.tree.mark_parents_dirty(&mut nparents).await?;
                    for p in dp {
                        if seen.insert(p) {
                            dirty.push(p);
                        }
                    }
                    let shifted = self.tree.set_slot_offset(&mut nparents, boundary).await?;
                    for p in shifted.dirty_ptrs {
                        if seen.insert(p) {
                            dirty.push(p);
                        }
                    }
                },
                None => {
                    let mut top_now = if parents.is_empty() {
                        block.clone()
                    } else {
                        parents[0].block.clone()
                    };
                    let mut grown = self
                        .tree
                        .new_right_block(&parents, &mut top_now, boundary, false)
                        .await?;
                    for p in &grown.dirty_ptrs {
                        if seen.insert(*p) {
                            dirty.push(*p);
                        }
                    }
                    let (dp, _) = self.tree.mark_parents_dirty(&mut grown.parents).await?;
                    for p in dp {
                        if seen.insert(p) {
                            dirty.push(p);
                        }
                    }
                    let tail = FileBlock::direct(overflow);
                    self.tree.cache_dirty(&grown.leaf_ptr, &tail).await?;
                },
            }
            // Recheck from the moved boundary so an oversized successor is
            // itself re-split.
            cursor = Some(boundary);
        }
        Ok(dirty)
    }

    /// Copy the whole tree under fresh block identities, for conflict
    /// resolution. Fails with [`TreeError::TooLarge`] when the leaf count
    /// implies a size over `limit_bytes`, before any copying happens.
    pub async fn deep_copy(
        &self,
        limit_bytes: Option<u64>,
    ) -> Result<(BlockPointer, Vec<BlockPointer>), TreeError> {
        let (top, _) = self.tree.root_block(BlockReq::Read).await?;
        if let Some(limit) = limit_bytes {
            if top.is_indirect() {
                let res = self
                    .tree
                    .get_blocks_for_offset_range(&top, RangeFetchOpts::new(0).indirect_only())
                    .await?;
                // Assume every leaf is full; a documented overestimate.
                let implied = res.paths.len() as u64 * self.config.block_size as u64;
                if implied > limit {
                    return Err(TreeError::TooLarge {
                        actual: implied,
                        limit,
                    });
                }
            }
        }
        let mut all_ptrs = Vec::new();
        let root_ptr = self.copy_rec(&top, &mut all_ptrs).await?;
        Ok((root_ptr, all_ptrs))
    }

    fn copy_rec<'a>(
        &'a self,
        block: &'a FileBlock,
        out: &'a mut Vec<BlockPointer>,
    ) -> BoxFuture<'a, Result<BlockPointer, TreeError>> {
        async move {
            let mut copy = block.clone();
            if copy.is_indirect() {
                for i in 0..copy.num_children() {
                    let child_ptr = copy.children()[i].info.ptr;
                    let (child, _) = self
                        .tree
                        .getter()
                        .get_block(&self.tree.container(), &child_ptr, BlockReq::Read)
                        .await?;
                    let new_child = self.copy_rec(&child, out).await?;
                    copy.children_mut()[i].info = BlockInfo::new(new_child);
                }
            }
            let kmd = self.tree.kmd();
            let ptr = BlockPointer {
                id: self.tree.crypto().make_temporary_id(),
                key_gen: kmd.latest_key_gen(),
                data_ver: kmd.data_version(),
                context: BlockContext {
                    creator: kmd.charged_to(),
                    ref_nonce: self.tree.crypto().make_ref_nonce(),
                },
                direct: if block.is_indirect() {
                    crate::types::BlockDirectType::Indirect
                } else {
                    crate::types::BlockDirectType::Direct
                },
            };
            self.tree.cache_dirty(&ptr, &copy).await?;
            out.push(ptr);
            Ok(ptr)
        }
        .boxed()
    }

    /// Finalize every dirty block below the root for upload. See
    /// [`BlockTree::ready`].
    pub async fn ready(
        &self,
        readier: &dyn BlockReadier<FileBlock>,
        puts: &dyn BlockPutState<FileBlock>,
        on_synced: Option<&(dyn Fn(BlockPointer) -> SyncedCb + Send + Sync)>,
    ) -> Result<HashMap<BlockInfo, BlockPointer>, TreeError> {
        let (top, _) = self.tree.root_block(BlockReq::Write).await?;
        self.tree.ready(&top, readier, puts, on_synced).await
    }

    /// Paths to the indirect blocks covering `[start, end)`; used by the
    /// folder-update layer when rewriting pointers wholesale.
    pub async fn get_indirect_blocks_for_offset_range(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<RangeFetchResult<FileBlock>, TreeError> {
        let (top, _) = self.tree.root_block(BlockReq::Read).await?;
        let mut opts = RangeFetchOpts::new(start).indirect_only();
        if let Some(end) = end {
            opts = opts.to(end);
        }
        self.tree.get_blocks_for_offset_range(&top, opts).await
    }

    /// Paths to the leaves covering `[start, end)`, in offset order.
    pub async fn get_leaf_paths(
        &self,
        start: u64,
        end: Option<u64>,
        prefix_ok: bool,
    ) -> Result<RangeFetchResult<FileBlock>, TreeError> {
        let (top, _) = self.tree.root_block(BlockReq::Read).await?;
        let mut opts = RangeFetchOpts::new(start);
        if let Some(end) = end {
            opts = opts.to(end);
        }
        if prefix_ok {
            opts = opts.prefix_ok();
        }
        if let Some(d) = self.config.fetch_deadline {
            opts = opts.with_deadline(d);
        }
        self.tree.get_blocks_for_offset_range(&top, opts).await
    }

    /// Walk the dirty leaves at or after `off`, in offset order. Exposed
    /// for the sync layer's restartable iteration.
    pub async fn next_dirty_leaf(
        &self,
        off: u64,
    ) -> Result<Option<(u64, Option<u64>, FileBlock)>, TreeError> {
        let (top, _) = self.tree.root_block(BlockReq::Write).await?;
        Ok(self
            .tree
            .get_next_dirty_block_at_offset(&top, &off)
            .await?
            .map(|d| (d.start_off, d.next_block_start_off, d.block)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::errors::FetchError;
    use crate::test_utils::{
        file_with_root,
        new_file,
        BincodeReadier,
        TestCrypto,
        TestKeyMetadata,
        TestPutState,
    };
    use crate::types::{BlockContext, BlockDirectType, DataVer, KeyGen, UserId};

    fn cfg(block_size: usize, fan_out: usize) -> Config {
        Config {
            block_size,
            max_ptrs_per_block: fan_out,
            ..Config::default()
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    async fn depth(fd: &FileData) -> usize {
        let (mut block, _) = fd.tree().root_block(BlockReq::Read).await.unwrap();
        let mut d = 0;
        while block.is_indirect() {
            d += 1;
            let ptr = block.children()[0].info.ptr;
            block = fd
                .tree()
                .getter()
                .get_block(&fd.tree().container(), &ptr, BlockReq::Read)
                .await
                .unwrap()
                .0;
        }
        d
    }

    async fn assert_monotonic(fd: &FileData) {
        let (top, _) = fd.tree().root_block(BlockReq::Read).await.unwrap();
        if !top.is_indirect() {
            return;
        }
        let fetched = fd
            .tree()
            .get_blocks_for_offset_range(&top, RangeFetchOpts::new(0))
            .await
            .unwrap();
        for fp in &fetched.paths {
            for step in &fp.parents {
                let offs: Vec<_> = step.block.children().iter().map(|c| c.off).collect();
                assert!(
                    offs.windows(2).all(|w| w[0] < w[1]),
                    "offsets out of order: {offs:?}"
                );
            }
        }
    }

    async fn serial_leaves(fd: &FileData) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        let mut off = 0u64;
        loop {
            let at = fd.tree().get_block_at_offset(&off, BlockReq::Read).await.unwrap();
            out.push((at.start_off, at.block.contents.clone()));
            match at.next_block_start_off {
                Some(n) => off = n,
                None => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn forty_five_bytes_at_block_size_twenty_make_three_leaves() {
        let (fd, _store, _) = new_file(cfg(20, 4));
        let data = pattern(45, 3);
        let res = fd.write(&data, 0, 0).await.unwrap();
        assert_eq!(res.new_size, 45);
        assert_eq!(res.bytes_extended, 45);

        let (top, _) = fd.tree().root_block(BlockReq::Read).await.unwrap();
        assert!(top.is_indirect());
        let offs: Vec<_> = top.children().iter().map(|c| c.off).collect();
        assert_eq!(offs, vec![0, 20, 40]);

        let lens: Vec<_> = {
            let mut lens = Vec::new();
            for leaf in serial_leaves(&fd).await {
                lens.push(leaf.1.len());
            }
            lens
        };
        assert_eq!(lens, vec![20, 20, 5]);
        assert_eq!(fd.get_bytes(0, 45).await.unwrap(), data);
    }

    #[tokio::test]
    async fn round_trip_across_multiple_levels() {
        let (fd, _store, _) = new_file(cfg(8, 2));
        let data = pattern(100, 7);
        fd.write(&data, 0, 0).await.unwrap();
        assert!(depth(&fd).await >= 3);
        assert_monotonic(&fd).await;
        assert_eq!(fd.get_bytes(0, 100).await.unwrap(), data);

        // Overwrite a span crossing several leaves.
        let patch = pattern(30, 99);
        fd.write(&patch, 37, 100).await.unwrap();
        assert_monotonic(&fd).await;
        let mut expect = data.clone();
        expect[37..67].copy_from_slice(&patch);
        assert_eq!(fd.get_bytes(0, 100).await.unwrap(), expect);
    }

    #[tokio::test]
    async fn holes_read_back_as_zeros() {
        let (fd, _store, _) = new_file(cfg(16, 4));
        let head = pattern(16, 1);
        let tail = pattern(8, 2);
        fd.write(&head, 0, 0).await.unwrap();
        let res = fd.write(&tail, 48, 16).await.unwrap();
        assert_eq!(res.new_size, 56);

        let mut expect = vec![0u8; 56];
        expect[..16].copy_from_slice(&head);
        expect[48..].copy_from_slice(&tail);
        assert_eq!(fd.get_bytes(0, 56).await.unwrap(), expect);
        assert_monotonic(&fd).await;
    }

    #[tokio::test]
    async fn filling_a_hole_out_of_order_shifts_the_block_into_place() {
        let (fd, _store, _) = new_file(cfg(16, 4));
        fd.write(&pattern(16, 1), 0, 0).await.unwrap();
        fd.write(&pattern(8, 2), 48, 16).await.unwrap();

        // Lands inside the hole, past the first leaf's boundary; the new
        // block is appended on the right and then shifted left.
        let mid = pattern(4, 3);
        fd.write(&mid, 25, 56).await.unwrap();
        assert_monotonic(&fd).await;

        let (top, _) = fd.tree().root_block(BlockReq::Read).await.unwrap();
        let offs: Vec<_> = top.children().iter().map(|c| c.off).collect();
        assert_eq!(offs, vec![0, 25, 48]);

        let mut expect = vec![0u8; 56];
        expect[..16].copy_from_slice(&pattern(16, 1));
        expect[25..29].copy_from_slice(&mid);
        expect[48..].copy_from_slice(&pattern(8, 2));
        assert_eq!(fd.get_bytes(0, 56).await.unwrap(), expect);
    }

    #[tokio::test]
    async fn depth_grows_only_when_every_slot_is_full() {
        let (fd, _store, _) = new_file(cfg(20, 2));
        fd.write(&pattern(20, 1), 0, 0).await.unwrap();
        assert_eq!(depth(&fd).await, 0, "single leaf stays direct");

        fd.write(&pattern(20, 2), 20, 20).await.unwrap();
        assert_eq!(depth(&fd).await, 1, "two leaves under one root");

        let (top, _) = fd.tree().root_block(BlockReq::Read).await.unwrap();
        assert_eq!(top.num_children(), 2);

        // Both root slots are full now, so one more byte forces a level.
        fd.write(&pattern(1, 3), 40, 40).await.unwrap();
        assert_eq!(depth(&fd).await, 2);
        assert_monotonic(&fd).await;
        let mut expect = Vec::new();
        expect.extend(pattern(20, 1));
        expect.extend(pattern(20, 2));
        expect.extend(pattern(1, 3));
        assert_eq!(fd.get_bytes(0, 41).await.unwrap(), expect);
    }

    #[tokio::test]
    async fn truncate_shrink_unrefs_readied_tail_leaves() {
        let (fd, store, container) = new_file(cfg(20, 4));
        let data = pattern(45, 5);
        fd.write(&data, 0, 0).await.unwrap();

        let puts = TestPutState::new(container, store.clone());
        let new_infos = fd.ready(&BincodeReadier, &puts, None).await.unwrap();
        assert_eq!(new_infos.len(), 3, "three leaves readied");
        store.commit_dirty(&container);

        let res = fd.truncate_shrink(7).await.unwrap();
        assert_eq!(res.new_size, 7);
        let readied_unrefs: Vec<_> = res.unrefs.iter().filter(|i| i.is_readied()).collect();
        assert!(
            readied_unrefs.len() >= 2,
            "second and third leaves must be unreferenced, got {readied_unrefs:?}"
        );

        let leaves = serial_leaves(&fd).await;
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].1, &data[..7]);
        assert_eq!(fd.get_bytes(0, 7).await.unwrap(), &data[..7]);
    }

    #[tokio::test]
    async fn truncate_extend_marks_new_pointers_as_holes() {
        let (fd, _store, _) = new_file(cfg(16, 4));
        fd.write(&pattern(16, 1), 0, 0).await.unwrap();
        let res = fd.truncate_extend(100, 16).await.unwrap();
        assert_eq!(res.new_size, 100);
        assert_eq!(res.bytes_extended, 84);

        let (top, _) = fd.tree().root_block(BlockReq::Read).await.unwrap();
        assert!(top.is_indirect());
        let last = top.children().last().unwrap();
        assert_eq!(last.off, 100);
        assert!(last.holes);

        let mut expect = vec![0u8; 100];
        expect[..16].copy_from_slice(&pattern(16, 1));
        assert_eq!(fd.get_bytes(0, 100).await.unwrap(), expect);
    }

    #[tokio::test]
    async fn shrink_to_zero_leaves_an_empty_block() {
        let (fd, _store, _) = new_file(cfg(20, 4));
        fd.write(&pattern(10, 1), 0, 0).await.unwrap();
        let res = fd.truncate_shrink(0).await.unwrap();
        assert_eq!(res.new_size, 0);

        let (top, _) = fd.tree().root_block(BlockReq::Read).await.unwrap();
        assert_eq!(top.num_children(), 0);
        assert_eq!(top.data_len(), 0);
        assert_eq!(fd.get_bytes(0, 0).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn ready_visits_each_block_once_and_fires_synced_callbacks() {
        let (fd, store, container) = new_file(cfg(8, 2));
        fd.write(&pattern(64, 9), 0, 0).await.unwrap();
        assert!(depth(&fd).await >= 3, "dirty leaves share ancestors");

        let puts = TestPutState::new(container, store.clone());
        let synced = std::sync::Arc::new(AtomicUsize::new(0));
        let synced2 = synced.clone();
        let make_cb = move |_ptr: BlockPointer| -> SyncedCb {
            let c = synced2.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            })
        };
        let new_infos = fd.ready(&BincodeReadier, &puts, Some(&make_cb)).await.unwrap();

        let recorded = puts.puts();
        let mut ids: Vec<_> = recorded.iter().map(|(p, _)| p.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), recorded.len(), "a block was encoded twice");
        assert_eq!(synced.load(Ordering::Relaxed), recorded.len());
        assert_eq!(new_infos.len(), recorded.len());

        // The stamped tree still reads back.
        assert_eq!(fd.get_bytes(0, 64).await.unwrap(), pattern(64, 9));
        store.commit_dirty(&container);
        assert_eq!(fd.get_bytes(0, 64).await.unwrap(), pattern(64, 9));
    }

    #[tokio::test]
    async fn parallel_fetch_equals_serial_traversal() {
        let (fd, _store, _) = new_file(cfg(8, 2));
        let data = pattern(120, 11);
        fd.write(&data, 0, 0).await.unwrap();

        let serial = serial_leaves(&fd).await;
        let fetched = fd.get_leaf_paths(0, None, false).await.unwrap();
        let parallel: Vec<(u64, Vec<u8>)> = fetched
            .paths
            .iter()
            .map(|fp| (fp.start_off, fp.block.as_ref().unwrap().contents.clone()))
            .collect();
        assert_eq!(serial, parallel);
        assert!(fetched.paths[0].first_in_range);
        assert!(fetched.paths[1..].iter().all(|fp| !fp.first_in_range));

        // The indirect-only walk sees the same leaf slots, by pointer.
        let indirect = fd.get_indirect_blocks_for_offset_range(0, None).await.unwrap();
        assert_eq!(indirect.paths.len(), fetched.paths.len());
        for (a, b) in indirect.paths.iter().zip(&fetched.paths) {
            assert_eq!(a.ptr, b.ptr);
            assert!(a.block.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn prefix_ok_trims_at_the_slow_branch() {
        let (fd, store, _) = new_file(cfg(8, 2));
        fd.write(&pattern(32, 13), 0, 0).await.unwrap();

        let all = fd.get_leaf_paths(0, None, false).await.unwrap();
        assert_eq!(all.paths.len(), 4);
        store.set_delay_on(all.paths[2].ptr.id, Duration::from_secs(60));

        let (top, _) = fd.tree().root_block(BlockReq::Read).await.unwrap();
        let trimmed = fd
            .tree()
            .get_blocks_for_offset_range(
                &top,
                RangeFetchOpts::new(0)
                    .prefix_ok()
                    .with_deadline(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        assert_eq!(trimmed.paths.len(), 2, "prefix before the slow leaf");
        assert_eq!(trimmed.paths[0].start_off, 0);
        assert_eq!(trimmed.paths[1].start_off, 8);

        // Without prefix-ok the same overrun is fatal.
        let err = fd
            .tree()
            .get_blocks_for_offset_range(
                &top,
                RangeFetchOpts::new(0).with_deadline(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::Fetch(FetchError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_on_the_first_branch_is_always_fatal() {
        let (fd, store, _) = new_file(cfg(8, 2));
        fd.write(&pattern(32, 13), 0, 0).await.unwrap();
        let all = fd.get_leaf_paths(0, None, false).await.unwrap();
        store.set_delay_on(all.paths[0].ptr.id, Duration::from_secs(60));

        let (top, _) = fd.tree().root_block(BlockReq::Read).await.unwrap();
        let err = fd
            .tree()
            .get_blocks_for_offset_range(
                &top,
                RangeFetchOpts::new(0)
                    .prefix_ok()
                    .with_deadline(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::Fetch(FetchError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn single_fetch_failure_is_returned_verbatim() {
        let (fd, store, _) = new_file(cfg(8, 2));
        fd.write(&pattern(32, 17), 0, 0).await.unwrap();
        let all = fd.get_leaf_paths(0, None, false).await.unwrap();
        store.fail_on(all.paths[3].ptr.id);

        let err = fd.get_leaf_paths(0, None, false).await.unwrap_err();
        assert!(
            matches!(err, TreeError::Fetch(FetchError::Store(_))),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn deep_copy_preserves_content_under_fresh_identities() {
        let (fd, store, container) = new_file(cfg(8, 2));
        let data = pattern(50, 23);
        fd.write(&data, 0, 0).await.unwrap();

        let (copy_root, copied) = fd.deep_copy(None).await.unwrap();
        assert!(copied.len() > 1);
        assert_ne!(copy_root, fd.tree().root_info().ptr);
        assert!(!copy_root.context.ref_nonce.is_zero());

        let copy = file_with_root(
            store.clone(),
            container,
            BlockInfo::new(copy_root),
            cfg(8, 2),
        );
        assert_eq!(copy.get_bytes(0, 50).await.unwrap(), data);

        // A limit below the implied size fails before copying anything.
        let err = fd.deep_copy(Some(16)).await.unwrap_err();
        assert!(matches!(err, TreeError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn resplit_rebalances_oversized_dirty_leaves() {
        let (fd, store, container) = new_file(cfg(40, 4));
        let data = pattern(40, 29);
        fd.write(&data, 0, 0).await.unwrap();

        // Re-open under a smaller block size; the single 40-byte leaf is
        // now oversized.
        let narrow = file_with_root(
            store.clone(),
            container,
            fd.tree().root_info(),
            cfg(16, 4),
        );
        let dirtied = narrow.resplit().await.unwrap();
        assert!(!dirtied.is_empty());

        let leaves = serial_leaves(&narrow).await;
        let lens: Vec<_> = leaves.iter().map(|(_, c)| c.len()).collect();
        assert_eq!(lens, vec![16, 16, 8]);
        assert_monotonic(&narrow).await;
        assert_eq!(narrow.get_bytes(0, 40).await.unwrap(), data);
    }

    #[tokio::test]
    async fn zero_byte_write_still_dirties_the_top_block() {
        let (fd, store, container) = new_file(cfg(20, 4));
        assert!(!crate::interfaces::IsBlockDirty::is_dirty(
            &*store,
            &container,
            &fd.tree().root_info().ptr
        ));
        fd.write(&[], 0, 0).await.unwrap();
        assert!(crate::interfaces::IsBlockDirty::is_dirty(
            &*store,
            &container,
            &fd.tree().root_info().ptr
        ));
    }

    #[tokio::test]
    async fn a_policy_refusing_to_fill_surfaces_as_bad_split() {
        struct Refusing;
        impl BlockSplitter for Refusing {
            fn max_ptrs_per_block(&self) -> usize {
                4
            }
            fn max_dir_entries_per_block(&self) -> usize {
                64
            }
            fn copy_until_split(&self, _: &mut FileBlock, _: bool, _: &[u8], _: u64) -> u64 {
                0
            }
            fn check_split(&self, _: &FileBlock) -> u64 {
                0
            }
        }

        let store = Arc::new(crate::test_utils::MemoryBlockStore::<FileBlock>::new());
        let crypto = Arc::new(TestCrypto::new());
        let container = ContainerId(3);
        let root_ptr = BlockPointer {
            id: crypto.make_temporary_id(),
            key_gen: KeyGen(1),
            data_ver: DataVer(1),
            context: BlockContext::first(UserId(42)),
            direct: BlockDirectType::Direct,
        };
        store.put_clean(&container, &root_ptr, FileBlock::new_empty(false));
        let fd = FileData::new(
            container,
            BlockInfo::new(root_ptr),
            store.clone(),
            store.clone(),
            store.clone(),
            crypto,
            Arc::new(TestKeyMetadata),
            Arc::new(Refusing),
            Config::default(),
        );
        let err = fd.write(&pattern(10, 1), 0, 0).await.unwrap_err();
        assert!(matches!(err, TreeError::BadSplit { .. }));
    }
}
