//! Bounded-parallelism fetch of all blocks covering an offset range.
//!
//! One task is fed to the pool per indirect block encountered; each task
//! fetches its block, works out which children overlap the requested
//! half-open range, and either enqueues sub-tasks (indirect children) or
//! emits a leaf result. Workers run out of order; the reducer is the only
//! writer of the final structures and re-sorts by offset before returning,
//! so result order is deterministic regardless of completion order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::{BlockTree, Path, PathStep};
use crate::block::{Offset, TreeBlock};
use crate::errors::{AggregateFetchError, FetchError, TreeError};
use crate::interfaces::{BlockGetter, BlockReq};
use crate::types::{BlockPointer, ContainerId};

/// Parameters of one range fetch.
#[derive(Clone, Debug)]
pub struct RangeFetchOpts<Off> {
    /// Start of the half-open range.
    pub start: Off,
    /// End of the half-open range; `None` reads to the end of the data.
    pub end: Option<Off>,
    /// Tolerate a deadline overrun on non-initial branches by returning
    /// the longest contiguous prefix instead of failing.
    pub prefix_ok: bool,
    /// Fetch leaf block data too; when false the walk stops at the
    /// deepest indirect level and leaves are reported by pointer only.
    pub leaf_blocks: bool,
    /// Budget for the whole fetch, measured from the call.
    pub deadline: Option<Duration>,
}

impl<Off: Offset> RangeFetchOpts<Off> {
    pub fn new(start: Off) -> Self {
        Self {
            start,
            end: None,
            prefix_ok: false,
            leaf_blocks: true,
            deadline: None,
        }
    }

    pub fn to(mut self, end: Off) -> Self {
        self.end = Some(end);
        self
    }

    pub fn prefix_ok(mut self) -> Self {
        self.prefix_ok = true;
        self
    }

    pub fn indirect_only(mut self) -> Self {
        self.leaf_blocks = false;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// One descended path: the chain of parents from the root plus the leaf
/// reached at its bottom.
#[derive(Debug)]
pub struct FetchedPath<B: TreeBlock> {
    pub parents: Path<B>,
    pub ptr: BlockPointer,
    /// The leaf's data, when leaf blocks were requested.
    pub block: Option<B>,
    pub start_off: B::Off,
    /// Whether this is the very first logical block in the range.
    pub first_in_range: bool,
}

#[derive(Debug)]
pub struct RangeFetchResult<B: TreeBlock> {
    /// Sorted by `start_off`.
    pub paths: Vec<FetchedPath<B>>,
    /// The offset of the first block past the range, if one exists.
    pub next_offset: Option<B::Off>,
}

struct Task<B: TreeBlock> {
    ptr: BlockPointer,
    /// The root task carries the already-fetched top block.
    block: Option<B>,
    parents: Path<B>,
    start_off: B::Off,
    first: bool,
}

enum Output<B: TreeBlock> {
    Descend {
        subs: Vec<Task<B>>,
        next_candidate: Option<B::Off>,
    },
    Leaf(FetchedPath<B>),
}

pub(super) async fn get_blocks_for_offset_range<B: TreeBlock>(
    tree: &BlockTree<B>,
    top: &B,
    opts: RangeFetchOpts<B::Off>,
    max_parallel: usize,
) -> Result<RangeFetchResult<B>, TreeError> {
    let deadline = opts.deadline.map(|d| Instant::now() + d);

    if !top.is_indirect() {
        return Ok(RangeFetchResult {
            paths: vec![FetchedPath {
                parents: Path::new(),
                ptr: tree.root_info().ptr,
                block: opts.leaf_blocks.then(|| top.clone()),
                start_off: B::Off::zero(),
                first_in_range: true,
            }],
            next_offset: None,
        });
    }

    let cancel = CancellationToken::new();
    let mut queue: VecDeque<Task<B>> = VecDeque::new();
    queue.push_back(Task {
        ptr: tree.root_info().ptr,
        block: Some(top.clone()),
        parents: Path::new(),
        start_off: B::Off::zero(),
        first: true,
    });

    let mut tasks: JoinSet<(bool, Result<Output<B>, FetchError>)> = JoinSet::new();
    let mut results: Vec<FetchedPath<B>> = Vec::new();
    let mut next_offset: Option<B::Off> = None;
    let mut errors: Vec<FetchError> = Vec::new();
    let mut fatal = false;

    loop {
        while !fatal && tasks.len() < max_parallel {
            let Some(t) = queue.pop_front() else { break };
            let getter = tree.getter().clone();
            let container = tree.container();
            let start = opts.start.clone();
            let end = opts.end.clone();
            let leaf_blocks = opts.leaf_blocks;
            let cancel = cancel.clone();
            let first = t.first;
            tasks.spawn(async move {
                let out =
                    process_task(getter, container, t, start, end, leaf_blocks, cancel, deadline)
                        .await;
                (first, out)
            });
        }
        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok((_, Ok(Output::Descend {
                subs,
                next_candidate,
            }))) => {
                if let Some(c) = next_candidate {
                    next_offset = Some(match next_offset.take() {
                        Some(o) if o <= c => o,
                        _ => c,
                    });
                }
                queue.extend(subs);
            },
            Ok((_, Ok(Output::Leaf(fp)))) => results.push(fp),
            Ok((first, Err(e))) => {
                // A deadline miss on a non-first branch is tolerable in
                // prefix-ok mode; anything else aborts all outstanding
                // work.
                let tolerated = opts.prefix_ok && e.is_deadline() && !first;
                errors.push(e);
                if !tolerated && !fatal {
                    fatal = true;
                    cancel.cancel();
                }
            },
            Err(e) => {
                error!("range-fetch worker failed to join: {e}");
                errors.push(FetchError::Store(e.to_string()));
                if !fatal {
                    fatal = true;
                    cancel.cancel();
                }
            },
        }
    }

    results.sort_by(|a, b| a.start_off.cmp(&b.start_off));

    if fatal {
        // Workers canceled by the fatal signal report `Canceled`; don't
        // let that cascade mask the root cause.
        let mut significant: Vec<FetchError> = errors
            .drain(..)
            .filter(|e| !matches!(e, FetchError::Canceled))
            .collect();
        return Err(match significant.len() {
            0 => TreeError::Fetch(FetchError::Canceled),
            1 => TreeError::Fetch(significant.pop().expect("one error")),
            _ => AggregateFetchError(significant).into(),
        });
    }
    if !errors.is_empty() {
        trim_to_contiguous_prefix(&mut results);
    }
    Ok(RangeFetchResult {
        paths: results,
        next_offset,
    })
}

#[allow(clippy::too_many_arguments)]
async fn process_task<B: TreeBlock>(
    getter: Arc<dyn BlockGetter<B>>,
    container: ContainerId,
    task: Task<B>,
    start: B::Off,
    end: Option<B::Off>,
    leaf_blocks: bool,
    cancel: CancellationToken,
    deadline: Option<Instant>,
) -> Result<Output<B>, FetchError> {
    let block = match task.block {
        Some(b) => b,
        None => {
            if task.ptr.is_direct() && !leaf_blocks {
                // The walk stops at the deepest indirect level.
                return Ok(Output::Leaf(FetchedPath {
                    parents: task.parents,
                    ptr: task.ptr,
                    block: None,
                    start_off: task.start_off,
                    first_in_range: task.first,
                }));
            }
            fetch_with_limits(&*getter, &container, &task.ptr, &cancel, deadline).await?
        },
    };
    if !block.is_indirect() {
        return Ok(Output::Leaf(FetchedPath {
            parents: task.parents,
            ptr: task.ptr,
            block: leaf_blocks.then_some(block),
            start_off: task.start_off,
            first_in_range: task.first,
        }));
    }

    let children = block.children();
    let mut subs = Vec::new();
    let mut next_candidate = None;
    let mut first_overlap = true;
    for i in 0..children.len() {
        let c = &children[i];
        // A child covers [c.off, next sibling's off); it overlaps the
        // requested range if that interval intersects [start, end).
        let right_ok = match &end {
            Some(e) => c.off < *e,
            None => true,
        };
        if !right_ok {
            next_candidate = Some(c.off.clone());
            break;
        }
        let left_ok = match children.get(i + 1) {
            Some(nc) => nc.off > start,
            None => true,
        };
        if !left_ok {
            continue;
        }
        let mut parents = task.parents.clone();
        parents.push(PathStep {
            ptr: task.ptr,
            block: block.clone(),
            child_index: i,
        });
        subs.push(Task {
            ptr: c.info.ptr,
            block: None,
            parents,
            start_off: c.off.clone(),
            first: task.first && first_overlap,
        });
        first_overlap = false;
    }
    Ok(Output::Descend {
        subs,
        next_candidate,
    })
}

async fn fetch_with_limits<B: TreeBlock>(
    getter: &dyn BlockGetter<B>,
    container: &ContainerId,
    ptr: &BlockPointer,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<B, FetchError> {
    let fut = async {
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Canceled),
            r = getter.get_block(container, ptr, BlockReq::Read) => r.map(|(b, _)| b),
        }
    };
    match deadline {
        Some(d) => match tokio::time::timeout_at(d, fut).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::DeadlineExceeded),
        },
        None => fut.await,
    }
}

/// Keep the longest contiguous run of paths starting at the first block;
/// a discontinuity is a child-index jump of more than one or a change of
/// depth.
fn trim_to_contiguous_prefix<B: TreeBlock>(results: &mut Vec<FetchedPath<B>>) {
    if results.is_empty() {
        return;
    }
    if !results[0].first_in_range {
        results.clear();
        return;
    }
    let mut keep = 1;
    for w in results.windows(2) {
        if contiguous(&w[0], &w[1]) {
            keep += 1;
        } else {
            break;
        }
    }
    results.truncate(keep);
}

fn contiguous<B: TreeBlock>(p: &FetchedPath<B>, q: &FetchedPath<B>) -> bool {
    if p.parents.len() != q.parents.len() {
        return false;
    }
    for lvl in 0..p.parents.len() {
        let pi = p.parents[lvl].child_index;
        let qi = q.parents[lvl].child_index;
        if pi == qi {
            continue;
        }
        if qi != pi + 1 {
            return false;
        }
        // Past the divergence the left path must hug its right edge and
        // the right path its left edge.
        let p_right_edge = p.parents[lvl + 1..]
            .iter()
            .all(|s| s.child_index + 1 == s.block.num_children());
        let q_left_edge = q.parents[lvl + 1..].iter().all(|s| s.child_index == 0);
        return p_right_edge && q_left_edge;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlock;
    use crate::types::{BlockContext, BlockDirectType, BlockId, BlockInfo, DataVer, KeyGen, UserId};

    fn ptr(seed: u8) -> BlockPointer {
        BlockPointer {
            id: BlockId([seed; 32]),
            key_gen: KeyGen(1),
            data_ver: DataVer(1),
            context: BlockContext::first(UserId(1)),
            direct: BlockDirectType::Direct,
        }
    }

    fn step(children: usize, child_index: usize) -> PathStep<FileBlock> {
        let mut block = FileBlock::new_empty(true);
        for i in 0..children {
            block.iptrs.push(crate::block::IndirectPointer::new(
                BlockInfo::new(ptr(i as u8)),
                i as u64 * 10,
            ));
        }
        PathStep {
            ptr: ptr(200),
            block,
            child_index,
        }
    }

    fn fetched(steps: Vec<PathStep<FileBlock>>, off: u64, first: bool) -> FetchedPath<FileBlock> {
        FetchedPath {
            parents: steps.into_iter().collect(),
            ptr: ptr(99),
            block: None,
            start_off: off,
            first_in_range: first,
        }
    }

    #[test]
    fn adjacent_siblings_are_contiguous() {
        let p = fetched(vec![step(3, 0)], 0, true);
        let q = fetched(vec![step(3, 1)], 10, false);
        assert!(contiguous(&p, &q));
    }

    #[test]
    fn index_jump_is_a_discontinuity() {
        let p = fetched(vec![step(3, 0)], 0, true);
        let q = fetched(vec![step(3, 2)], 20, false);
        assert!(!contiguous(&p, &q));
    }

    #[test]
    fn depth_change_is_a_discontinuity() {
        let p = fetched(vec![step(3, 0)], 0, true);
        let q = fetched(vec![step(3, 0), step(2, 1)], 10, false);
        assert!(!contiguous(&p, &q));
    }

    #[test]
    fn crossing_parents_requires_edge_alignment() {
        // ...[parent 0, last child] -> [parent 1, first child] is fine.
        let p = fetched(vec![step(2, 0), step(2, 1)], 10, true);
        let q = fetched(vec![step(2, 1), step(2, 0)], 20, false);
        assert!(contiguous(&p, &q));

        // Jumping into the middle of the next parent is not.
        let q_bad = fetched(vec![step(2, 1), step(2, 1)], 30, false);
        assert!(!contiguous(&p, &q_bad));
    }

    #[test]
    fn trim_keeps_longest_prefix() {
        let mut results = vec![
            fetched(vec![step(4, 0)], 0, true),
            fetched(vec![step(4, 1)], 10, false),
            fetched(vec![step(4, 3)], 30, false),
        ];
        trim_to_contiguous_prefix(&mut results);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].start_off, 10);
    }
}
