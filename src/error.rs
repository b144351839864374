//! Error types shared by the resolver, the transform pipeline and the
//! redefinition driver.
//!
//! Only [`ResolutionError`] (from required hierarchy queries) and
//! [`RedefinitionError`] (from batch redefinition) ever reach a caller of the
//! engine. Storage and transformation failures are recovered where they
//! happen and only show up in the log.

use std::io;
use thiserror::Error;

use crate::instrument::LoaderId;

/// Structural problems found while reading a class file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassFormatError {
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("unexpected end of class file at offset {offset} (needed {needed} more bytes)")]
    Truncated { offset: usize, needed: usize },

    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownConstant { tag: u8, index: u16 },

    #[error("constant pool index {0} does not refer to a {1} entry")]
    BadConstantRef(u16, &'static str),

    #[error("constant pool entry {0} is not valid modified UTF-8")]
    BadUtf8(u16),

    #[error("8-byte constant at index {0} has no room for its second slot")]
    WideConstantAtEnd(u16),

    #[error("{0} trailing bytes after class file")]
    TrailingBytes(usize),

    #[error("class file defines {found}, expected {expected}")]
    NameMismatch { expected: String, found: String },
}

/// A required ancestor could not be built.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("class {name} not found in loader {loader}")]
    NotFound { name: String, loader: LoaderId },

    #[error("malformed class file for {name} in loader {loader}: {source}")]
    Malformed {
        name: String,
        loader: LoaderId,
        #[source]
        source: ClassFormatError,
    },

    #[error("failed to read class {name} from loader {loader}: {source}")]
    Io {
        name: String,
        loader: LoaderId,
        #[source]
        source: io::Error,
    },

    #[error("circular hierarchy through {name} in loader {loader}")]
    Circular { name: String, loader: LoaderId },
}

/// Reading or writing the transform cache or the dump directory failed.
#[derive(Error, Debug)]
#[error("{op} {path}: {source}")]
pub struct StorageError {
    pub op: &'static str,
    pub path: String,
    #[source]
    pub source: io::Error,
}

impl StorageError {
    pub fn new(op: &'static str, path: &std::path::Path, source: io::Error) -> Self {
        Self {
            op,
            path: path.display().to_string(),
            source,
        }
    }
}

/// Failure raised by a pluggable transformation.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Malformed(#[from] ClassFormatError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("transformation panicked: {0}")]
    Panicked(String),
}

/// Failure of the host's redefinition primitive.
#[derive(Error, Debug)]
pub enum RedefinitionError {
    #[error("class {0} is not loaded")]
    UnknownClass(String),

    #[error("redefinition of {class} rejected: {reason}")]
    Rejected { class: String, reason: String },

    #[error("batch redefinition of {count} classes failed: {source}")]
    Batch {
        count: usize,
        #[source]
        source: Box<RedefinitionError>,
    },
}
