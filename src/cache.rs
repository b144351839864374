//! Content-addressed store for transformation results, plus the debug dump
//! directory.
//!
//! Layout:
//!
//! ```text
//! <cache root>/<logical version>/<qualified name>#crc32=<checksum>.class
//! <dump root>/<qualified name>#loaderId=<loader>.class
//! ```
//!
//! Every entry is written to a temporary sibling first and renamed into
//! place, so a reader either sees a complete entry or none at all.

use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::classfile::qualified_name;
use crate::error::StorageError;
use crate::instrument::LoaderId;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// CRC-32 of `bytes`, computed with a fresh hasher on every call.
pub fn fingerprint(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    qualified_name: String,
    crc32: u32,
}

impl CacheKey {
    pub fn new(class_name: &str, input: &[u8]) -> Self {
        Self {
            qualified_name: qualified_name(class_name),
            crc32: fingerprint(input),
        }
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn file_name(&self) -> String {
        format!("{}#crc32={}.class", self.qualified_name, self.crc32)
    }
}

#[derive(Debug, Clone)]
pub struct TransformCache {
    root: PathBuf,
    version: String,
}

impl TransformCache {
    pub fn new(root: PathBuf, version: impl Into<String>) -> Self {
        Self {
            root,
            version: version.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn version_dir(&self) -> PathBuf {
        self.root.join(&self.version)
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.version_dir().join(key.file_name())
    }

    pub fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.entry_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::new("read", &path, e)),
        }
    }

    pub fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let dir = self.version_dir();
        fs::create_dir_all(&dir).map_err(|e| StorageError::new("create", &dir, e))?;
        let path = self.entry_path(key);
        write_atomically(&path, bytes)?;
        Ok(path)
    }

    /// Removes this version's entries, or the whole root with `all`.
    pub fn clear(&self, all: bool) -> Result<(), StorageError> {
        let target = if all { self.root.clone() } else { self.version_dir() };
        match fs::remove_dir_all(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::new("remove", &target, e)),
        }
    }

    pub fn stats(&self) -> Result<CacheStats, StorageError> {
        let mut versions = Vec::new();
        let dirs = match fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(CacheStats {
                    cache_root: self.root.to_string_lossy().to_string(),
                    current_version: self.version.clone(),
                    versions,
                });
            }
            Err(e) => return Err(StorageError::new("list", &self.root, e)),
        };

        for dir in dirs {
            let dir = dir.map_err(|e| StorageError::new("list", &self.root, e))?;
            if !dir.path().is_dir() {
                continue;
            }
            let mut row = VersionStats {
                version: dir.file_name().to_string_lossy().to_string(),
                entries: 0,
                bytes: 0,
            };
            let entries =
                fs::read_dir(dir.path()).map_err(|e| StorageError::new("list", &dir.path(), e))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|e| e != "class") {
                    continue;
                }
                row.entries += 1;
                row.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
            versions.push(row);
        }
        versions.sort_by(|a, b| a.version.cmp(&b.version));

        Ok(CacheStats {
            cache_root: self.root.to_string_lossy().to_string(),
            current_version: self.version.clone(),
            versions,
        })
    }
}

/// Debug mirror of final class bytes.
#[derive(Debug, Clone)]
pub struct DumpDir {
    root: PathBuf,
}

impl DumpDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path_for(&self, class_name: &str, loader: LoaderId) -> PathBuf {
        self.root.join(format!(
            "{}#loaderId={loader}.class",
            qualified_name(class_name)
        ))
    }

    pub fn write(
        &self,
        class_name: &str,
        loader: LoaderId,
        bytes: &[u8],
    ) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(&self.root).map_err(|e| StorageError::new("create", &self.root, e))?;
        let path = self.path_for(class_name, loader);
        fs::write(&path, bytes).map_err(|e| StorageError::new("write", &path, e))?;
        Ok(path)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut tmp_os = path.as_os_str().to_os_string();
    tmp_os.push(format!(
        ".tmp-{}-{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let tmp = PathBuf::from(tmp_os);

    fs::write(&tmp, bytes).map_err(|e| StorageError::new("write", &tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::new("rename", path, e));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct VersionStats {
    pub version: String,
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub cache_root: String,
    pub current_version: String,
    pub versions: Vec<VersionStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "jagent_cache_test_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    #[test]
    fn fingerprint_is_standard_crc32() {
        assert_eq!(fingerprint(b"123456789"), 0xCBF4_3926);
        assert_eq!(fingerprint(b"123456789"), fingerprint(b"123456789"));
        assert_eq!(fingerprint(b""), 0);
    }

    #[test]
    fn entry_path_follows_layout() {
        let cache = TransformCache::new(PathBuf::from("/c"), "v1");
        let key = CacheKey::new("com/x/Foo", b"123456789");
        assert_eq!(
            cache.entry_path(&key),
            PathBuf::from("/c/v1/com.x.Foo#crc32=3421780262.class")
        );

        let dump = DumpDir::new(PathBuf::from("/d"));
        assert_eq!(
            dump.path_for("com/x/Foo", LoaderId(7)),
            PathBuf::from("/d/com.x.Foo#loaderId=7.class")
        );
    }

    #[test]
    fn store_then_load_leaves_no_temp_files() -> anyhow::Result<()> {
        let root = temp_dir("store_load");
        let cache = TransformCache::new(root.clone(), "v1");
        let key = CacheKey::new("a/B", b"input");

        assert_eq!(cache.load(&key)?, None);
        cache.store(&key, b"output")?;
        assert_eq!(cache.load(&key)?.as_deref(), Some(&b"output"[..]));
        cache.store(&key, b"output")?;

        let names: Vec<String> = fs::read_dir(cache.version_dir())?
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![key.file_name()]);

        let _ = fs::remove_dir_all(root);
        Ok(())
    }

    #[test]
    fn stats_and_clear_cover_versions() -> anyhow::Result<()> {
        let root = temp_dir("stats_clear");
        let v1 = TransformCache::new(root.clone(), "v1");
        let v2 = TransformCache::new(root.clone(), "v2");
        v1.store(&CacheKey::new("a/A", b"1"), b"abc")?;
        v1.store(&CacheKey::new("a/B", b"2"), b"de")?;
        v2.store(&CacheKey::new("a/A", b"1"), b"x")?;

        let stats = v1.stats()?;
        assert_eq!(stats.versions.len(), 2);
        assert_eq!(stats.versions[0].version, "v1");
        assert_eq!(stats.versions[0].entries, 2);
        assert_eq!(stats.versions[0].bytes, 5);
        assert_eq!(stats.versions[1].entries, 1);

        v1.clear(false)?;
        let stats = v2.stats()?;
        assert_eq!(stats.versions.len(), 1);
        assert_eq!(stats.versions[0].version, "v2");

        v2.clear(true)?;
        assert!(!root.exists());
        assert!(v2.stats()?.versions.is_empty());
        Ok(())
    }
}
