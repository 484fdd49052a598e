use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for lumokv operations
pub type Result<T> = result::Result<T, Error>;

/// Engine error codes
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Requested page not found
    #[error("Requested page not found")]
    PageNotFound,
    /// Database file is corrupted
    #[error("Database file is corrupted")]
    Corrupted,
    /// Update of meta page failed, the environment must be reopened
    #[error("Update of meta page failed")]
    Panic,
    /// Database version mismatch
    #[error("Database version mismatch")]
    VersionMismatch,
    /// File is not a valid lumokv file, or an argument is invalid
    #[error("File is not a valid lumokv file or argument is invalid")]
    Invalid,
    /// Handle belongs to another environment or was already closed
    #[error("Wrong signature of a runtime object")]
    BadSignature,
    /// Environment size limit reached
    #[error("Environment mapsize limit reached")]
    MapFull,
    /// Environment max tables limit reached
    #[error("Environment maxdbs limit reached")]
    TablesFull,
    /// Environment max readers limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Transaction has too many dirty pages
    #[error("Transaction has too many dirty pages")]
    TxnFull,
    /// Cursor stack too deep
    #[error("Cursor stack too deep, tree is likely corrupted")]
    CursorFull,
    /// Writer slot or environment already taken
    #[error("Resource busy or already locked")]
    Busy,
    /// Transaction used from a thread that does not own it
    #[error("Transaction is owned by another thread")]
    ThreadMismatch,
    /// Overlapping transactions on the current thread
    #[error("Overlapping read and write transactions for the current thread")]
    OverlappingTransactions,
    /// Key does not match the cursor position
    #[error("Key does not match the current cursor position")]
    KeyMismatch,
    /// Key holds several values and the operation needs exactly one
    #[error("Key has multiple values, operation is ambiguous")]
    MultipleValues,
    /// Operation and DB incompatible
    #[error("Operation and DB incompatible")]
    Incompatible,
    /// Transaction must abort, has a child, or is invalid
    #[error("Transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key/DB name/data, or wrong integer size
    #[error("Unsupported size of key/DB name/data, or wrong DUPFIXED size")]
    BadValSize,
    /// The specified DBI was changed unexpectedly
    #[error("The specified DBI was changed unexpectedly")]
    BadDbi,
    /// Write operation on a read-only transaction or environment
    #[error("Transaction is read-only")]
    TxnReadOnly,
    /// Requested geometry conflicts with the existing file
    #[error("Requested geometry is incompatible with the database file")]
    IncompatibleGeometry,
    /// File cannot grow within the configured bounds
    #[error("Unable to extend the database file")]
    UnableToExtend,
    /// Allocation failed
    #[error("Out of memory")]
    OutOfMemory,
    /// Size does not fit the platform address space
    #[error("Database is too large for the current platform")]
    TooLarge,
    /// On-disk structure failed to decode
    #[error("Failed to decode {0}: {1}")]
    Decode(&'static str, io::Error),
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for the "not found" class, which callers may opt to see as `None`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// Errors after which a write transaction can only be aborted
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Corrupted
                | Error::Panic
                | Error::PageNotFound
                | Error::MapFull
                | Error::TxnFull
                | Error::CursorFull
                | Error::UnableToExtend
                | Error::Decode(..)
                | Error::Io(_)
        )
    }

    /// Numeric code at the external boundary, in the classic LMDB numbering
    pub fn code(&self) -> i32 {
        match self {
            Error::KeyExist => -30799,
            Error::NotFound => -30798,
            Error::PageNotFound => -30797,
            Error::Corrupted => -30796,
            Error::Panic => -30795,
            Error::VersionMismatch => -30794,
            Error::Invalid => -30793,
            Error::MapFull => -30792,
            Error::TablesFull => -30791,
            Error::ReadersFull => -30790,
            Error::TxnFull => -30788,
            Error::CursorFull => -30787,
            Error::Incompatible => -30784,
            Error::BadTxn => -30782,
            Error::BadValSize => -30781,
            Error::BadDbi => -30780,
            Error::IncompatibleGeometry => -30779,
            Error::KeyMismatch => -30419,
            Error::TooLarge => -30417,
            Error::ThreadMismatch => -30416,
            Error::OverlappingTransactions => -30415,
            Error::MultipleValues => -30421,
            Error::BadSignature => -30420,
            Error::UnableToExtend => -30418,
            Error::Busy => libc::EBUSY,
            Error::TxnReadOnly => libc::EACCES,
            Error::OutOfMemory => libc::ENOMEM,
            Error::Decode(..) => -30796,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
