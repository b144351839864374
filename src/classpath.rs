//! In-process host over a class path.
//!
//! Each class-path root (a directory of `.class` files or a jar) is one
//! loader whose parent is the previous root; lookups delegate parent first.
//! The bootstrap loader below them synthesizes header-only stubs for
//! `java/...` names so hierarchy walks can reach the root type.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use memmap2::Mmap;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};
use zip::ZipArchive;

use crate::classfile::{ClassFileBuilder, ClassHeader};
use crate::error::RedefinitionError;
use crate::instrument::{
    ClassDefinition, ClassId, ClassSource, Instrumentation, LoadedClass, LoaderId,
};
use crate::transform::{ClassFileTransformer, TransformRequest};

const OBJECT: &str = "java/lang/Object";

struct Loader {
    id: LoaderId,
    root: PathBuf,
    /// Internal name -> class file bytes.
    resources: BTreeMap<String, Vec<u8>>,
}

struct Defined {
    class: LoadedClass,
    bytes: Vec<u8>,
    redefinitions: u32,
}

#[derive(Default)]
struct Universe {
    classes: Vec<Defined>,
    index: HashMap<(String, LoaderId), ClassId>,
}

pub struct ClassPathHost {
    loaders: Vec<Loader>,
    universe: RwLock<Universe>,
    transformers: RwLock<Vec<Arc<dyn ClassFileTransformer>>>,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl ClassPathHost {
    pub fn open(roots: &[PathBuf]) -> Result<Self> {
        let mut loaders = Vec::with_capacity(roots.len());
        for (i, root) in roots.iter().enumerate() {
            let resources = if root.is_dir() {
                read_class_dir(root)?
            } else {
                read_jar(root)?
            };
            let id = LoaderId(i as u32 + 1);
            debug!(
                "Loader {id} reads {} classes from {}",
                resources.len(),
                root.display()
            );
            loaders.push(Loader {
                id,
                root: root.clone(),
                resources,
            });
        }
        Ok(Self {
            loaders,
            universe: RwLock::new(Universe::default()),
            transformers: RwLock::new(Vec::new()),
        })
    }

    pub fn loader_ids(&self) -> Vec<LoaderId> {
        self.loaders.iter().map(|l| l.id).collect()
    }

    /// Innermost loader, the one that sees every root.
    pub fn application_loader(&self) -> LoaderId {
        self.loaders.last().map(|l| l.id).unwrap_or(LoaderId::BOOTSTRAP)
    }

    pub fn loader_root(&self, loader: LoaderId) -> Option<&Path> {
        self.loader(loader).map(|l| l.root.as_path())
    }

    fn loader(&self, id: LoaderId) -> Option<&Loader> {
        self.loaders.iter().find(|l| l.id == id)
    }

    /// Every (internal name, loader) pair the class path can define.
    pub fn resources(&self) -> Vec<(String, LoaderId)> {
        self.loaders
            .iter()
            .flat_map(|l| l.resources.keys().map(move |n| (n.clone(), l.id)))
            .collect()
    }

    /// Parent-first lookup: the defining loader and its bytes.
    pub fn find_resource(&self, name: &str, from: LoaderId) -> io::Result<Option<(LoaderId, Vec<u8>)>> {
        if let Some(stub) = platform_stub(name) {
            return Ok(Some((LoaderId::BOOTSTRAP, stub)));
        }
        if from == LoaderId::BOOTSTRAP {
            return Ok(None);
        }
        let Some(position) = self.loaders.iter().position(|l| l.id == from) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown loader {from}"),
            ));
        };
        Ok(self.loaders[..=position]
            .iter()
            .find_map(|l| l.resources.get(name).map(|b| (l.id, b.clone()))))
    }

    pub fn transformers(&self) -> usize {
        read_lock(&self.transformers).len()
    }

    /// Defines `name` as seen from `loader`, running every registered
    /// transformer on the way in. Already loaded classes are returned as is.
    pub fn load_class(&self, name: &str, loader: LoaderId) -> Result<LoadedClass> {
        let (defining, mut bytes) = self
            .find_resource(name, loader)?
            .with_context(|| format!("Class {name} not found from loader {loader}"))?;
        {
            let universe = read_lock(&self.universe);
            if let Some(id) = universe.index.get(&(name.to_string(), defining)) {
                return Ok(universe.classes[id.0 as usize].class.clone());
            }
        }

        let transformers = read_lock(&self.transformers).clone();
        for transformer in transformers {
            let request = TransformRequest {
                loader: defining,
                class_name: name,
                redefining: None,
                bytes: &bytes,
            };
            if let Some(out) = transformer.apply(&request) {
                bytes = out;
            }
        }

        let mut universe = write_lock(&self.universe);
        let key = (name.to_string(), defining);
        if let Some(id) = universe.index.get(&key) {
            return Ok(universe.classes[id.0 as usize].class.clone());
        }
        let class = LoadedClass {
            id: ClassId(universe.classes.len() as u64),
            name: name.to_string(),
            loader: defining,
        };
        universe.index.insert(key, class.id);
        universe.classes.push(Defined {
            class: class.clone(),
            bytes,
            redefinitions: 0,
        });
        Ok(class)
    }

    /// Loads every class on the class path except those `skip` rejects.
    pub fn load_all(&self, skip: impl Fn(&str) -> bool) -> Result<usize> {
        let mut loaded = 0usize;
        for (name, loader) in self.resources() {
            if skip(&name) {
                continue;
            }
            self.load_class(&name, loader)?;
            loaded += 1;
        }
        info!("Loaded {loaded} classes");
        Ok(loaded)
    }

    pub fn loaded_count(&self) -> usize {
        read_lock(&self.universe).classes.len()
    }

    pub fn redefinition_count(&self, class: &LoadedClass) -> u32 {
        read_lock(&self.universe)
            .classes
            .get(class.id.0 as usize)
            .map(|d| d.redefinitions)
            .unwrap_or(0)
    }

    /// Writes the current definition of every loaded class below `out`,
    /// laid out by package.
    pub fn write_classes(&self, out: &Path) -> Result<usize> {
        let universe = read_lock(&self.universe);
        for defined in &universe.classes {
            let path = out.join(format!("{}.class", defined.class.name));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
            std::fs::write(&path, &defined.bytes)
                .with_context(|| format!("Failed to write class: {}", path.display()))?;
        }
        Ok(universe.classes.len())
    }

    fn check(universe: &Universe, def: &ClassDefinition) -> Result<(), RedefinitionError> {
        let name = &def.class.name;
        let known = universe
            .classes
            .get(def.class.id.0 as usize)
            .is_some_and(|d| d.class == def.class);
        if !known {
            return Err(RedefinitionError::UnknownClass(name.clone()));
        }
        let header = ClassHeader::parse(&def.bytes).map_err(|e| RedefinitionError::Rejected {
            class: name.clone(),
            reason: e.to_string(),
        })?;
        if header.name != *name {
            return Err(RedefinitionError::Rejected {
                class: name.clone(),
                reason: format!("bytes define {}", header.name),
            });
        }
        Ok(())
    }
}

impl Instrumentation for ClassPathHost {
    fn all_loaded_classes(&self) -> Vec<LoadedClass> {
        read_lock(&self.universe)
            .classes
            .iter()
            .map(|d| d.class.clone())
            .collect()
    }

    fn class_bytes(&self, class: &LoadedClass) -> io::Result<Option<Vec<u8>>> {
        Ok(read_lock(&self.universe)
            .classes
            .get(class.id.0 as usize)
            .map(|d| d.bytes.clone()))
    }

    fn redefine_classes(&self, definitions: &[ClassDefinition]) -> Result<(), RedefinitionError> {
        let mut universe = write_lock(&self.universe);
        for def in definitions {
            Self::check(&universe, def)?;
        }
        for def in definitions {
            let slot = &mut universe.classes[def.class.id.0 as usize];
            slot.bytes = def.bytes.clone();
            slot.redefinitions += 1;
        }
        Ok(())
    }

    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>) {
        write_lock(&self.transformers).push(transformer);
    }
}

impl ClassSource for ClassPathHost {
    fn class_bytes(&self, internal_name: &str, loader: LoaderId) -> io::Result<Option<Vec<u8>>> {
        Ok(self.find_resource(internal_name, loader)?.map(|(_, b)| b))
    }
}

fn platform_stub(name: &str) -> Option<Vec<u8>> {
    if name == OBJECT {
        return Some(ClassFileBuilder::new(OBJECT).super_class(None).build());
    }
    name.starts_with("java/")
        .then(|| ClassFileBuilder::new(name).build())
}

fn class_name_from_entry(entry: &str) -> Option<String> {
    let name = entry.strip_suffix(".class")?;
    if name.ends_with("module-info") || name.ends_with("package-info") {
        return None;
    }
    Some(name.replace('\\', "/"))
}

pub fn read_jar(jar_path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let file = File::open(jar_path)
        .with_context(|| format!("Failed to open jar: {}", jar_path.display()))?;
    // SAFETY: The file is opened read-only and outlives the map, which is
    // dropped at the end of this function.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap jar: {}", jar_path.display()))?;
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
        .with_context(|| format!("Failed to read zip structure: {}", jar_path.display()))?;

    let mut classes = BTreeMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(name) = class_name_from_entry(entry.name()) else {
            continue;
        };
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read {name} from {}", jar_path.display()))?;
        classes.insert(name, bytes);
    }
    Ok(classes)
}

pub fn read_class_dir(root: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "class") {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });
    drop(tx);

    let mut classes = BTreeMap::new();
    for path in rx.iter() {
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let entry = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let Some(name) = class_name_from_entry(&entry) else {
            continue;
        };
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read class file: {}", path.display()))?;
        classes.insert(name, bytes);
    }
    Ok(classes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};
    use zip::write::FileOptions;

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "jagent_classpath_test_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write_jar(path: &Path, entries: &[(&str, Vec<u8>)]) -> Result<()> {
        let file = File::create(path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            zip.start_file(*name, options)?;
            zip.write_all(content)?;
        }
        zip.finish()?;
        Ok(())
    }

    fn write_class(root: &Path, builder: ClassFileBuilder) -> Result<()> {
        let bytes = builder.build();
        let name = ClassHeader::parse(&bytes)?.name;
        let path = root.join(format!("{name}.class"));
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    #[test]
    fn reads_directories_and_jars_with_parent_delegation() -> Result<()> {
        let dir = temp_path("dir");
        write_class(&dir, ClassFileBuilder::new("lib/Base"))?;
        write_class(&dir, ClassFileBuilder::new("lib/Base$Inner"))?;
        std::fs::write(dir.join("README.txt"), b"x")?;

        let jar = temp_path("app.jar");
        write_jar(
            &jar,
            &[
                (
                    "app/Main.class",
                    ClassFileBuilder::new("app/Main").super_class(Some("lib/Base")).build(),
                ),
                ("lib/Base.class", ClassFileBuilder::new("lib/Base").method("shadowed", "()V").build()),
                ("module-info.class", vec![1, 2, 3]),
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n".to_vec()),
            ],
        )?;

        let host = ClassPathHost::open(&[dir.clone(), jar.clone()])?;
        assert_eq!(host.loader_ids(), vec![LoaderId(1), LoaderId(2)]);
        assert_eq!(host.application_loader(), LoaderId(2));
        assert_eq!(host.loader_root(LoaderId(1)), Some(dir.as_path()));
        assert_eq!(host.loader_root(LoaderId(2)), Some(jar.as_path()));
        assert_eq!(host.loader_root(LoaderId::BOOTSTRAP), None);

        let (defining, _) = host.find_resource("lib/Base", LoaderId(2))?.unwrap();
        assert_eq!(defining, LoaderId(1));
        assert!(host.find_resource("app/Main", LoaderId(1))?.is_none());
        assert!(host.find_resource("lib/Base$Inner", LoaderId(2))?.is_some());
        assert_eq!(host.find_resource("java/lang/Object", LoaderId(2))?.unwrap().0, LoaderId::BOOTSTRAP);
        assert!(host.find_resource("x/Y", LoaderId(9)).is_err());

        let loaded = host.load_all(|_| false)?;
        assert_eq!(loaded, 4);
        // lib/Base seen by both loaders is defined once, by the parent.
        assert_eq!(host.loaded_count(), 3);

        let _ = std::fs::remove_dir_all(dir);
        let _ = std::fs::remove_file(jar);
        Ok(())
    }

    #[test]
    fn batch_redefinition_is_all_or_nothing() -> Result<()> {
        let dir = temp_path("batch");
        write_class(&dir, ClassFileBuilder::new("a/A").method("m", "()V"))?;
        write_class(&dir, ClassFileBuilder::new("a/B"))?;
        let host = ClassPathHost::open(&[dir.clone()])?;
        host.load_all(|_| false)?;

        let classes = host.all_loaded_classes();
        let a = classes.iter().find(|c| c.name == "a/A").unwrap().clone();
        let b = classes.iter().find(|c| c.name == "a/B").unwrap().clone();
        let new_a = ClassFileBuilder::new("a/A").build();

        let err = host
            .redefine_classes(&[
                ClassDefinition { class: a.clone(), bytes: new_a.clone() },
                ClassDefinition { class: b.clone(), bytes: b"junk".to_vec() },
            ])
            .unwrap_err();
        assert!(matches!(err, RedefinitionError::Rejected { .. }));
        assert_eq!(host.redefinition_count(&a), 0);

        let err = host
            .redefine_classes(&[ClassDefinition { class: b.clone(), bytes: new_a.clone() }])
            .unwrap_err();
        assert!(matches!(err, RedefinitionError::Rejected { .. }));

        host.redefine_classes(&[ClassDefinition { class: a.clone(), bytes: new_a.clone() }])?;
        assert_eq!(host.redefinition_count(&a), 1);
        assert_eq!(Instrumentation::class_bytes(&host, &a)?, Some(new_a));

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[test]
    fn live_transformers_rewrite_later_loads() -> Result<()> {
        use crate::transform::{DirectTransformer, from_fn};

        let dir = temp_path("live");
        write_class(&dir, ClassFileBuilder::new("a/Early").method("m", "()V"))?;
        write_class(&dir, ClassFileBuilder::new("a/Late").method("m", "()V"))?;
        let host = ClassPathHost::open(&[dir.clone()])?;
        let early = host.load_class("a/Early", LoaderId(1))?;
        assert_eq!(host.transformers(), 0);

        host.add_transformer(Arc::new(DirectTransformer::new(from_fn(
            |req: &TransformRequest<'_>| {
                let mut class = crate::classfile::ClassFile::parse(req.bytes)?;
                class.remove_methods("m")?;
                Ok(Some(class.to_bytes()))
            },
        ))));
        assert_eq!(host.transformers(), 1);

        let late = host.load_class("a/Late", LoaderId(1))?;
        let method_count = |class: &LoadedClass| -> Result<usize> {
            let bytes = Instrumentation::class_bytes(&host, class)?.unwrap_or_default();
            Ok(crate::classfile::ClassFile::parse(&bytes)?.method_names()?.len())
        };
        assert_eq!(method_count(&early)?, 1);
        assert_eq!(method_count(&late)?, 0);

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[test]
    fn write_classes_exports_package_layout() -> Result<()> {
        let dir = temp_path("export_in");
        let out = temp_path("export_out");
        write_class(&dir, ClassFileBuilder::new("p/q/R"))?;
        let host = ClassPathHost::open(&[dir.clone()])?;
        host.load_all(|_| false)?;
        assert_eq!(host.write_classes(&out)?, 1);
        assert!(out.join("p/q/R.class").is_file());

        let _ = std::fs::remove_dir_all(dir);
        let _ = std::fs::remove_dir_all(out);
        Ok(())
    }
}
