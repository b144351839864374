//! Transformation pipeline.
//!
//! A [`Transformation`] is the pluggable edit: it may fail and it may decline
//! to change anything. A [`ClassFileTransformer`] is what the driver and the
//! host's live hook call; it never fails. Two of them wrap a transformation:
//! [`DirectTransformer`] calls it as is, [`CachingTransformer`] memoizes it in
//! a [`TransformCache`] and can mirror results to a [`DumpDir`].

use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

use crate::cache::{CacheKey, DumpDir, TransformCache};
use crate::error::TransformError;
use crate::instrument::{LoadedClass, LoaderId};

/// One class handed to a transformer.
#[derive(Debug, Clone, Copy)]
pub struct TransformRequest<'a> {
    pub loader: LoaderId,
    /// Internal (slash separated) name.
    pub class_name: &'a str,
    /// Set when an already loaded class is being redefined.
    pub redefining: Option<&'a LoadedClass>,
    pub bytes: &'a [u8],
}

pub type TransformResult = Result<Option<Vec<u8>>, TransformError>;

/// A bytecode edit. `Ok(None)` means "leave the class unchanged".
pub trait Transformation: Send + Sync {
    fn process_class(&self, _class_name: &str, _loader: LoaderId) -> bool {
        true
    }

    fn transform(&self, request: &TransformRequest<'_>) -> TransformResult;
}

pub struct FnTransformation<F>(F);

/// Adapts a closure into a [`Transformation`] that accepts every class.
pub fn from_fn<F>(f: F) -> FnTransformation<F>
where
    F: Fn(&TransformRequest<'_>) -> TransformResult + Send + Sync,
{
    FnTransformation(f)
}

impl<F> Transformation for FnTransformation<F>
where
    F: Fn(&TransformRequest<'_>) -> TransformResult + Send + Sync,
{
    fn transform(&self, request: &TransformRequest<'_>) -> TransformResult {
        (self.0)(request)
    }
}

/// Infallible transformer as seen by the driver and the live hook.
pub trait ClassFileTransformer: Send + Sync {
    fn process_class(&self, class_name: &str, loader: LoaderId) -> bool;

    /// New bytes, or `None` when the class stays as it is.
    fn apply(&self, request: &TransformRequest<'_>) -> Option<Vec<u8>>;
}

fn run_guarded<T: Transformation + ?Sized>(
    inner: &T,
    request: &TransformRequest<'_>,
) -> TransformResult {
    match catch_unwind(AssertUnwindSafe(|| inner.transform(request))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(TransformError::Panicked(message))
        }
    }
}

fn unchanged_to_none(result: Option<Vec<u8>>, input: &[u8]) -> Option<Vec<u8>> {
    result.filter(|bytes| bytes.as_slice() != input)
}

pub struct DirectTransformer<T> {
    inner: T,
}

impl<T: Transformation> DirectTransformer<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T: Transformation> ClassFileTransformer for DirectTransformer<T> {
    fn process_class(&self, class_name: &str, loader: LoaderId) -> bool {
        self.inner.process_class(class_name, loader)
    }

    fn apply(&self, request: &TransformRequest<'_>) -> Option<Vec<u8>> {
        if !self.process_class(request.class_name, request.loader) {
            return None;
        }
        match run_guarded(&self.inner, request) {
            Ok(result) => unchanged_to_none(result, request.bytes),
            Err(e) => {
                error!(
                    "Unable to transform class {} loaded by {}: {e}",
                    request.class_name, request.loader
                );
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    storage_failures: AtomicU64,
    transform_failures: AtomicU64,
    dumps: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub hits: u64,
    pub misses: u64,
    pub storage_failures: u64,
    pub transform_failures: u64,
    pub dumps: u64,
}

/// Memoizing wrapper: identical input bytes under one logical version always
/// map to the same stored output, so the wrapped transformation runs at most
/// once per (version, class, fingerprint).
pub struct CachingTransformer<T> {
    inner: T,
    version: String,
    cache: Option<TransformCache>,
    dump: Option<DumpDir>,
    counters: Counters,
}

impl<T: Transformation> CachingTransformer<T> {
    pub fn new(inner: T, version: impl Into<String>) -> Self {
        Self {
            inner,
            version: version.into(),
            cache: None,
            dump: None,
            counters: Counters::default(),
        }
    }

    pub fn with_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.cache = dir.map(|d| TransformCache::new(d, self.version.clone()));
        self
    }

    pub fn with_dump_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dump = dir.map(DumpDir::new);
        self
    }

    pub fn cache(&self) -> Option<&TransformCache> {
        self.cache.as_ref()
    }

    pub fn stats(&self) -> TransformStats {
        let c = &self.counters;
        TransformStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            storage_failures: c.storage_failures.load(Ordering::Relaxed),
            transform_failures: c.transform_failures.load(Ordering::Relaxed),
            dumps: c.dumps.load(Ordering::Relaxed),
        }
    }

    fn cached_or_transform(&self, request: &TransformRequest<'_>) -> TransformResult {
        let Some(cache) = self.cache.as_ref() else {
            return run_guarded(&self.inner, request);
        };
        let (name, loader) = (request.class_name, request.loader);

        let key = CacheKey::new(name, request.bytes);
        match cache.load(&key) {
            Ok(Some(bytes)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Load class {name} loaded by {loader} from cached file {}",
                    cache.entry_path(&key).display()
                );
                return Ok(Some(bytes));
            }
            Ok(None) => {}
            Err(e) => {
                self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Exception on cache reading {name} loaded by {loader}: {e}");
                return run_guarded(&self.inner, request);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let output = run_guarded(&self.inner, request)?.unwrap_or_else(|| request.bytes.to_vec());
        match cache.store(&key, &output) {
            Ok(path) => debug!("Cache class {name} loaded by {loader} to {}", path.display()),
            Err(e) => {
                self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Exception on cache writing {name} loaded by {loader}: {e}");
            }
        }
        Ok(Some(output))
    }

    fn dump_if_needed(&self, request: &TransformRequest<'_>, bytes: &[u8]) {
        let Some(dump) = self.dump.as_ref() else {
            return;
        };
        let (name, loader) = (request.class_name, request.loader);
        match dump.write(name, loader, bytes) {
            Ok(path) => {
                self.counters.dumps.fetch_add(1, Ordering::Relaxed);
                debug!("Dump class {name} loaded by {loader} to {}", path.display());
            }
            Err(e) => warn!("Unable to dump class {name} loaded by {loader}: {e}"),
        }
    }
}

impl<T: Transformation> ClassFileTransformer for CachingTransformer<T> {
    fn process_class(&self, class_name: &str, loader: LoaderId) -> bool {
        self.inner.process_class(class_name, loader)
    }

    fn apply(&self, request: &TransformRequest<'_>) -> Option<Vec<u8>> {
        if !self.process_class(request.class_name, request.loader) {
            return None;
        }
        debug!(
            "Transforming {} loaded by {}",
            request.class_name, request.loader
        );
        let result = match self.cached_or_transform(request) {
            Ok(result) => result,
            Err(e) => {
                self.counters
                    .transform_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    "Unable to transform class {} loaded by {}: {e}",
                    request.class_name, request.loader
                );
                None
            }
        };
        if let Some(bytes) = result.as_deref() {
            self.dump_if_needed(request, bytes);
        }
        debug!(
            "Transformed {} loaded by {}",
            request.class_name, request.loader
        );
        unchanged_to_none(result, request.bytes)
    }
}
