//! Error types for ncio operations.

use thiserror::Error;

/// All errors that can occur when reading or writing container files.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying byte source.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The leading bytes do not match any known container magic.
    #[error("Invalid magic number, found {found:?}")]
    InvalidMagicNumber { found: Vec<u8> },

    /// A header structure is malformed beyond recovery.
    #[error("Invalid file structure: {0}")]
    InvalidFileStructure(String),

    /// The computed data extent exceeds the physical file length by more
    /// than the 3-byte classic-format slack.
    #[error("File truncated: computed size {computed} exceeds file length {actual}")]
    TruncatedFile { computed: u64, actual: u64 },

    /// A datatype, filter, storage layout, or access pattern this crate
    /// does not implement.
    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    /// A variable path lookup found nothing.
    #[error("Variable not found: '{0}'")]
    VariableNotFound(String),

    /// A chunk filter failed to decode.
    #[error("Decompression failed for chunk at offset {offset}: {reason}")]
    Decompression { offset: u64, reason: String },

    /// A requested section falls outside the variable's shape, or its
    /// stride is illegal for the storage layout.
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// A read ran past the end of the available bytes.
    #[error("Unexpected end of file")]
    UnexpectedEof,

    /// Attempt to modify a value frozen at construction, or a dataset
    /// past its define phase.
    #[error("Immutable: {0}")]
    Immutable(String),

    /// Typed read requested with an element type that does not match the
    /// variable's datatype.
    #[error("Type mismatch in {context}: expected '{expected}', found '{found}'")]
    TypeMismatch {
        expected: String,
        found: String,
        context: String,
    },
}
