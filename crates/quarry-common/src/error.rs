//! Error types for Quarry.

use thiserror::Error;

/// Result type alias using QuarryError.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Errors that can occur in Quarry operations.
#[derive(Debug, Error)]
pub enum QuarryError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    // Buffer manager errors
    #[error("Page not found: {file_id}:{page_num}")]
    PageNotFound { file_id: u32, page_num: u32 },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page {file_id}:{page_num} is not pinned")]
    PageNotPinned { file_id: u32, page_num: u32 },

    #[error("Page {file_id}:{page_num} is still pinned")]
    PagePinned { file_id: u32, page_num: u32 },

    // Relation file errors
    #[error("Relation page full, unable to append record")]
    PageFull,

    #[error("End of file reached")]
    EndOfFile,

    #[error("Record size mismatch: expected {expected}, got {actual}")]
    RecordSizeMismatch { expected: usize, actual: usize },

    // Index errors
    #[error("Index metadata does not match: {0}")]
    BadIndexInfo(String),

    #[error("Invalid scan operator")]
    BadOperator,

    #[error("Invalid scan range: low bound exceeds high bound")]
    BadScanRange,

    #[error("No scan in progress")]
    ScanNotInitialized,

    #[error("Index scan completed")]
    IndexScanCompleted,

    #[error("Relation name too long: {len} bytes (max {max})")]
    RelationNameTooLong { len: usize, max: usize },

    #[error("B+ tree corrupted: {0}")]
    TreeCorrupted(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
