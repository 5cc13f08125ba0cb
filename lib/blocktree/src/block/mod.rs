//! The tree node abstraction the engine is generic over.
//!
//! A block is either *direct* (it holds content: file bytes or directory
//! entries) or *indirect* (it holds an ordered list of child slots), never
//! both. The engine only ever touches blocks through the [`TreeBlock`]
//! capability set, which keeps it agnostic of the content kind; the two
//! concrete kinds live in [`file`] and [`dir`].
//!
//! The offset axis is a type parameter rather than a runtime tag: file trees
//! are keyed by `u64` byte offsets, directory trees by `SmolStr` name keys.
//! Comparing offsets of different kinds is a compile error.

use std::fmt::Debug;

use smol_str::SmolStr;

use crate::types::BlockInfo;

pub mod dir;
pub mod file;

pub use dir::{DirBlock, DirEntry, EntryType};
pub use file::FileBlock;

/// A totally-ordered key identifying a child's position within its parent.
pub trait Offset: Clone + Ord + Debug + Send + Sync + 'static {
    /// The smallest offset; the leftmost edge of any tree starts here.
    fn zero() -> Self;
}

impl Offset for u64 {
    fn zero() -> Self {
        0
    }
}

impl Offset for SmolStr {
    fn zero() -> Self {
        SmolStr::default()
    }
}

/// One child slot of an indirect block: the child's [`BlockInfo`], the
/// offset its content starts at, and (for file trees) whether the subtree
/// under it is known to contain holes.
///
/// Slot offsets are strictly increasing across a block's child list, except
/// transiently inside the hole-fill shift.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndirectPointer<Off> {
    pub info: BlockInfo,
    pub off: Off,
    pub holes: bool,
}

impl<Off> IndirectPointer<Off> {
    pub fn new(info: BlockInfo, off: Off) -> Self {
        Self {
            info,
            off,
            holes: false,
        }
    }
}

/// The capability set the tree engine needs from a node.
///
/// Implementations must uphold the direct-XOR-indirect invariant: an
/// indirect block has children and no content of its own, a direct block
/// has content and an empty child list.
pub trait TreeBlock: Clone + Debug + Send + Sync + Sized + 'static {
    type Off: Offset;

    /// A fresh, empty block. `indirect` picks which of the two shapes.
    fn new_empty(indirect: bool) -> Self;

    fn is_indirect(&self) -> bool;

    fn children(&self) -> &[IndirectPointer<Self::Off>];

    fn children_mut(&mut self) -> &mut Vec<IndirectPointer<Self::Off>>;

    /// Byte length of this block's own direct content. Indirect blocks
    /// report zero. Directory blocks report a serialized-size estimate,
    /// which is all the write-buffer accounting needs.
    fn data_len(&self) -> u64;

    fn num_children(&self) -> usize {
        self.children().len()
    }

    /// The offset this block's content begins at: the leftmost child's
    /// offset for an indirect block, the origin for a direct one.
    fn first_offset(&self) -> Self::Off {
        self.children()
            .first()
            .map(|c| c.off.clone())
            .unwrap_or_else(Self::Off::zero)
    }

    fn append_child(&mut self, ptr: IndirectPointer<Self::Off>) {
        self.children_mut().push(ptr);
    }

    /// Clear the recorded encoded size of child `i`; called whenever the
    /// child is about to be mutated so stale sizes never survive a write.
    fn clear_child_size(&mut self, i: usize) {
        self.children_mut()[i].info.encoded_size = 0;
    }
}
