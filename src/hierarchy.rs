//! Lazy, cached type hierarchy resolution.
//!
//! Descriptors are built on first request from the class bytes a
//! [`ClassSource`] hands out, keyed by (internal name, loader). Ancestry is
//! only followed when a query needs it.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::classfile::{ClassHeader, internal_name};
use crate::descriptor::TypeDescriptor;
use crate::error::{ClassFormatError, ResolutionError};
use crate::instrument::{ClassSource, LoaderId};

type Key = (String, LoaderId);

pub struct HierarchyResolver {
    source: Arc<dyn ClassSource>,
    descriptors: DashMap<Key, Arc<TypeDescriptor>>,
}

impl HierarchyResolver {
    pub fn new(source: Arc<dyn ClassSource>) -> Self {
        Self {
            source,
            descriptors: DashMap::new(),
        }
    }

    /// Cached or freshly built descriptor; `None` when it cannot be built.
    pub fn resolve(&self, name: &str, loader: LoaderId) -> Option<Arc<TypeDescriptor>> {
        match self.resolve_required(name, loader) {
            Ok(d) => Some(d),
            Err(e) => {
                debug!("Cannot resolve {name} in loader {loader}: {e}");
                None
            }
        }
    }

    pub fn resolve_required(
        &self,
        name: &str,
        loader: LoaderId,
    ) -> Result<Arc<TypeDescriptor>, ResolutionError> {
        let key = (internal_name(name), loader);
        if let Some(d) = self.descriptors.get(&key) {
            return Ok(Arc::clone(d.value()));
        }
        // Built outside the map so slow sources never hold a shard lock.
        let built = Arc::new(self.build(&key.0, loader)?);
        let entry = self.descriptors.entry(key).or_insert(built);
        Ok(Arc::clone(entry.value()))
    }

    fn build(&self, name: &str, loader: LoaderId) -> Result<TypeDescriptor, ResolutionError> {
        let bytes = self
            .source
            .class_bytes(name, loader)
            .map_err(|source| ResolutionError::Io {
                name: name.to_string(),
                loader,
                source,
            })?
            .ok_or_else(|| ResolutionError::NotFound {
                name: name.to_string(),
                loader,
            })?;
        let malformed = |source| ResolutionError::Malformed {
            name: name.to_string(),
            loader,
            source,
        };
        let header = ClassHeader::parse(&bytes).map_err(malformed)?;
        if header.name != name {
            return Err(malformed(ClassFormatError::NameMismatch {
                expected: name.to_string(),
                found: header.name,
            }));
        }
        debug!("Built descriptor for {name} in loader {loader}");
        Ok(TypeDescriptor::new(header, loader))
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Drops every descriptor built for `loader`. Descriptors still held
    /// elsewhere keep their links.
    pub fn evict_loader(&self, loader: LoaderId) {
        self.descriptors.retain(|(_, l), _| *l != loader);
    }

    /// Whether a value of type `candidate` can be assigned to `target`, both
    /// resolved within `loader`.
    pub fn is_assignable_from(
        &self,
        target: &str,
        candidate: &str,
        loader: LoaderId,
    ) -> Result<bool, ResolutionError> {
        let target = internal_name(target);
        let candidate = internal_name(candidate);
        if target == candidate {
            return Ok(true);
        }
        let candidate = self.resolve_required(&candidate, loader)?;
        self.is_assignable(&target, &candidate)
    }

    /// Same as [`Self::is_assignable_from`] for an already resolved candidate.
    /// `target` is an internal name.
    pub fn is_assignable(
        &self,
        target: &str,
        candidate: &Arc<TypeDescriptor>,
    ) -> Result<bool, ResolutionError> {
        if candidate.internal_name() == target {
            return Ok(true);
        }
        let chain = self.super_chain(candidate)?;
        if chain.iter().skip(1).any(|c| c.internal_name() == target) {
            return Ok(true);
        }
        let mut visited = HashSet::new();
        for ty in &chain {
            if self.implements(ty, target, &mut visited)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn super_chain(
        &self,
        start: &Arc<TypeDescriptor>,
    ) -> Result<Vec<Arc<TypeDescriptor>>, ResolutionError> {
        let mut seen = HashSet::from([start.internal_name().to_string()]);
        let mut chain = vec![Arc::clone(start)];
        let mut current = Arc::clone(start);
        while let Some(parent) = current.required_superclass(self)? {
            if !seen.insert(parent.internal_name().to_string()) {
                return Err(ResolutionError::Circular {
                    name: parent.internal_name().to_string(),
                    loader: parent.loader(),
                });
            }
            chain.push(Arc::clone(&parent));
            current = parent;
        }
        Ok(chain)
    }

    // Interfaces already explored without a match are skipped, which also
    // bounds diamonds and malformed cycles.
    fn implements(
        &self,
        ty: &TypeDescriptor,
        target: &str,
        visited: &mut HashSet<String>,
    ) -> Result<bool, ResolutionError> {
        for iface in ty.required_interfaces(self)? {
            if iface.internal_name() == target {
                return Ok(true);
            }
            if !visited.insert(iface.internal_name().to_string()) {
                continue;
            }
            if self.implements(&iface, target, visited)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
