use std::thread::ThreadId;

use crate::config::{GcPolicy, Geometry};

/// Cursor movement and seek operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// Position at first key/data item
    First,
    /// Position at first data item of current key
    FirstDup,
    /// Position at key/data pair
    GetBoth,
    /// Position at key, nearest data
    GetBothRange,
    /// Return key/data at current cursor position
    GetCurrent,
    /// Position at last key/data item
    Last,
    /// Position at last data item of current key
    LastDup,
    /// Position at next data item
    Next,
    /// Position at next data item of current key
    NextDup,
    /// Position at first data item of next key
    NextNoDup,
    /// Position at previous data item
    Prev,
    /// Position at previous data item of current key
    PrevDup,
    /// Position at last data item of previous key
    PrevNoDup,
    /// Position at specified key
    Set,
    /// Position at specified key, return key + data
    SetKey,
    /// Position at first key greater than or equal to specified key
    SetRange,
}

impl CursorOp {
    /// Alias of [`CursorOp::Set`]
    pub const SET_EXACT: CursorOp = CursorOp::Set;
    /// Alias of [`CursorOp::SetRange`]
    pub const LOWER_BOUND: CursorOp = CursorOp::SetRange;
    /// Alias of [`CursorOp::GetBoth`]
    pub const FIND_PAIR: CursorOp = CursorOp::GetBoth;
    /// Alias of [`CursorOp::GetBothRange`]
    pub const LOWER_BOUND_PAIR: CursorOp = CursorOp::GetBothRange;

    /// Whether the op needs a key argument
    pub(crate) fn needs_key(self) -> bool {
        matches!(
            self,
            CursorOp::Set
                | CursorOp::SetKey
                | CursorOp::SetRange
                | CursorOp::GetBoth
                | CursorOp::GetBothRange
        )
    }

    /// Whether the op needs a value argument
    pub(crate) fn needs_value(self) -> bool {
        matches!(self, CursorOp::GetBoth | CursorOp::GetBothRange)
    }
}

/// Statistics for a table or a whole environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data items
    pub entries: u64,
    /// Transaction that last modified the tree
    pub mod_txnid: u64,
}

/// Information about the environment
#[derive(Debug, Clone)]
pub struct EnvInfo {
    /// Geometry in effect
    pub geometry: Geometry,
    /// Current size of the data file
    pub file_size: u64,
    /// Number of the last used page
    pub last_pgno: u64,
    /// Id of the last committed transaction
    pub last_txnid: u64,
    /// Id of the last transaction known to be on disk
    pub steady_txnid: u64,
    /// Reader slots
    pub max_readers: u32,
    /// Reader slots in use
    pub num_readers: u32,
    /// Page reclamation order
    pub gc_policy: GcPolicy,
}

/// One entry of the reader table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Slot index
    pub slot: usize,
    /// Snapshot the reader is bound to, `None` while reset
    pub txnid: Option<u64>,
    /// Owning thread, `None` for thread-detached readers
    pub thread: Option<ThreadId>,
}

/// How `Environment::remove` treats concurrent users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoveMode {
    /// Delete regardless of users
    #[default]
    Unconditional,
    /// Fail with `Busy` if the environment is in use
    EnsureUnused,
    /// Block until the environment is released
    WaitForUnused,
}
