//! Host-facing collaborator traits.
//!
//! The engine never loads or executes classes itself. A host (a JVM agent
//! bridge, or [`crate::classpath::ClassPathHost`] in-process) exposes its
//! loaded universe, its class bytes and its redefinition primitive through
//! these traits.

use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::error::RedefinitionError;
use crate::transform::ClassFileTransformer;

/// Identifies a loading context: types resolve consistently within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LoaderId(pub u32);

impl LoaderId {
    pub const BOOTSTRAP: LoaderId = LoaderId(0);
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-assigned identity of a loaded class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClassId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadedClass {
    pub id: ClassId,
    /// Internal (slash separated) name.
    pub name: String,
    pub loader: LoaderId,
}

impl LoadedClass {
    pub fn is_array(&self) -> bool {
        self.name.starts_with('[')
    }
}

/// New bytes for an already loaded class.
#[derive(Debug, Clone)]
pub struct ClassDefinition {
    pub class: LoadedClass,
    pub bytes: Vec<u8>,
}

/// The host's view of its live class universe.
pub trait Instrumentation: Send + Sync {
    /// Snapshot of every class loaded right now.
    fn all_loaded_classes(&self) -> Vec<LoadedClass>;

    /// Current definition of a loaded class. `Ok(None)` when the host has no
    /// bytes for it.
    fn class_bytes(&self, class: &LoadedClass) -> io::Result<Option<Vec<u8>>>;

    /// Replaces the definitions of all given classes, all or nothing.
    fn redefine_classes(&self, definitions: &[ClassDefinition]) -> Result<(), RedefinitionError>;

    /// Registers a transformer for every future class load.
    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>);
}

/// Byte lookup used by the hierarchy resolver.
pub trait ClassSource: Send + Sync {
    /// Class file bytes for `internal_name` as seen from `loader`, or
    /// `Ok(None)` when the loader cannot see such a class.
    fn class_bytes(&self, internal_name: &str, loader: LoaderId) -> io::Result<Option<Vec<u8>>>;
}
