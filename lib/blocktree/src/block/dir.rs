//! The directory block: an ordered name → entry map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use super::{IndirectPointer, TreeBlock};
use crate::types::BlockInfo;

/// The kind of object a directory entry names.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Exec,
    Dir,
    Sym,
}

/// One directory entry: the root pointer of the named content plus the
/// metadata the operation layer keeps alongside it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub info: BlockInfo,
    pub entry_type: EntryType,
    /// Logical size in bytes of the named file, or entry count for a
    /// directory.
    pub size: u64,
    /// Target path, for `Sym` entries only.
    pub sym_path: Option<SmolStr>,
}

impl DirEntry {
    pub fn new(info: BlockInfo, entry_type: EntryType, size: u64) -> Self {
        Self {
            info,
            entry_type,
            size,
            sym_path: None,
        }
    }
}

/// One node of a directory-entry tree. Direct blocks carry a name-ordered
/// entry map; indirect blocks carry child slots keyed by the first entry
/// name of the subtree under each child.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirBlock {
    /// The entries held by this block. Always empty for indirect blocks.
    pub children: BTreeMap<SmolStr, DirEntry>,
    /// Child slots. Always empty for direct blocks.
    pub iptrs: Vec<IndirectPointer<SmolStr>>,
    indirect: bool,
}

/// Rough serialized footprint of one entry, used only for write-buffer
/// accounting and size estimates. Deliberately coarse.
pub(crate) const ENTRY_OVERHEAD: u64 = 64;

impl DirBlock {
    /// A direct block holding the given entries.
    pub fn direct(children: BTreeMap<SmolStr, DirEntry>) -> Self {
        Self {
            children,
            iptrs: Vec::new(),
            indirect: false,
        }
    }
}

impl TreeBlock for DirBlock {
    type Off = SmolStr;

    fn new_empty(indirect: bool) -> Self {
        Self {
            children: BTreeMap::new(),
            iptrs: Vec::new(),
            indirect,
        }
    }

    fn is_indirect(&self) -> bool {
        self.indirect
    }

    fn children(&self) -> &[IndirectPointer<SmolStr>] {
        &self.iptrs
    }

    fn children_mut(&mut self) -> &mut Vec<IndirectPointer<SmolStr>> {
        &mut self.iptrs
    }

    fn data_len(&self) -> u64 {
        self.children
            .iter()
            .map(|(name, _)| name.len() as u64 + ENTRY_OVERHEAD)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockContext, BlockDirectType, BlockId, BlockPointer, DataVer, KeyGen, UserId};

    fn entry() -> DirEntry {
        DirEntry::new(
            BlockInfo::new(BlockPointer {
                id: BlockId([9; 32]),
                key_gen: KeyGen(1),
                data_ver: DataVer(1),
                context: BlockContext::first(UserId(1)),
                direct: BlockDirectType::Direct,
            }),
            EntryType::File,
            0,
        )
    }

    #[test]
    fn entries_stay_name_ordered() {
        let mut b = DirBlock::new_empty(false);
        b.children.insert("zeta".into(), entry());
        b.children.insert("alpha".into(), entry());
        let names: Vec<_> = b.children.keys().cloned().collect();
        assert_eq!(names, vec![SmolStr::from("alpha"), SmolStr::from("zeta")]);
    }
}
