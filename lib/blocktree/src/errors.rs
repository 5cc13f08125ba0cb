use smol_str::SmolStr;
use thiserror::Error;

use crate::types::BlockId;

/// Errors surfaced by a [`BlockGetter`](crate::interfaces::BlockGetter)
/// implementation. Any fetch failure is fatal to the enclosing tree
/// operation; no partial mutation is committed.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("block {0:?} is not present in any reachable store")]
    NotFound(BlockId),
    #[error("error while reading block data. {0}")]
    Io(#[from] std::io::Error),
    #[error("block fetch deadline exceeded")]
    DeadlineExceeded,
    #[error("block fetch was canceled")]
    Canceled,
    #[error("block store failure. {0}")]
    Store(String),
}

impl FetchError {
    /// True for the deadline overruns that prefix-ok range fetches are
    /// allowed to tolerate on non-initial branches.
    pub fn is_deadline(&self) -> bool {
        matches!(self, FetchError::DeadlineExceeded)
    }
}

/// Failures from more than one range-fetch worker, merged so that no
/// individual failure is silently dropped.
#[derive(Error, Debug)]
#[error("{} block fetches failed: {}", .0.len(), render_aggregate(.0))]
pub struct AggregateFetchError(pub Vec<FetchError>);

fn render_aggregate(errs: &[FetchError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced by the tree engine and the file adapter.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Aggregate(#[from] AggregateFetchError),
    #[error("bad split while writing at offset {off}: copied {copied} bytes but the next block starts at {next_off}")]
    BadSplit { off: u64, copied: u64, next_off: u64 },
    #[error("operation would produce a tree of {actual} bytes, over the {limit} byte limit")]
    TooLarge { actual: u64, limit: u64 },
    #[error("failed to cache dirty block. {0}")]
    Cache(String),
    #[error("failed to ready block for upload. {0}")]
    Ready(String),
}

/// Errors from the directory adapter.
#[derive(Error, Debug)]
pub enum DirError {
    #[error("no entry named {0:?}")]
    NotFound(SmolStr),
    #[error("an entry named {0:?} already exists")]
    Exists(SmolStr),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl From<FetchError> for DirError {
    fn from(e: FetchError) -> Self {
        DirError::Tree(TreeError::Fetch(e))
    }
}
