//! Structural summary of one type plus its lazily resolved ancestry links.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::classfile::{AccessFlags, ClassHeader, qualified_name};
use crate::error::ResolutionError;
use crate::hierarchy::HierarchyResolver;
use crate::instrument::LoaderId;

type Link = OnceLock<Arc<TypeDescriptor>>;

/// Immutable facts about a type as read from its class file header.
///
/// The super and interface links start empty and are filled at most once,
/// through the resolver, the first time somebody asks for them. A slot that
/// could not be resolved in optional mode stays empty and is retried on the
/// next request; a filled slot is never recomputed.
pub struct TypeDescriptor {
    flags: AccessFlags,
    internal_name: String,
    qualified_name: String,
    super_name: Option<String>,
    interface_names: Vec<String>,
    loader: LoaderId,
    super_link: Link,
    interface_links: Box<[Link]>,
}

impl TypeDescriptor {
    pub(crate) fn new(header: ClassHeader, loader: LoaderId) -> Self {
        let interface_links = header.interfaces.iter().map(|_| OnceLock::new()).collect();
        Self {
            flags: header.access,
            qualified_name: qualified_name(&header.name),
            internal_name: header.name,
            super_name: header.super_name,
            interface_names: header.interfaces,
            loader,
            super_link: OnceLock::new(),
            interface_links,
        }
    }

    pub fn flags(&self) -> AccessFlags {
        self.flags
    }

    pub fn is_interface(&self) -> bool {
        self.flags.contains(AccessFlags::INTERFACE)
    }

    pub fn internal_name(&self) -> &str {
        &self.internal_name
    }

    /// Dotted form, e.g. `java.lang.String`.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    pub fn interface_names(&self) -> &[String] {
        &self.interface_names
    }

    pub fn loader(&self) -> LoaderId {
        self.loader
    }

    /// Super type, or `None` for the root type or when it cannot be built.
    pub fn superclass(&self, resolver: &HierarchyResolver) -> Option<Arc<TypeDescriptor>> {
        let name = self.super_name.as_deref()?;
        fill_optional(&self.super_link, name, self.loader, resolver)
    }

    /// Super type; failing to build it is an error. `Ok(None)` only for the
    /// root type.
    pub fn required_superclass(
        &self,
        resolver: &HierarchyResolver,
    ) -> Result<Option<Arc<TypeDescriptor>>, ResolutionError> {
        let Some(name) = self.super_name.as_deref() else {
            return Ok(None);
        };
        fill_required(&self.super_link, name, self.loader, resolver).map(Some)
    }

    /// Declared interfaces in order; unresolvable slots are `None`.
    pub fn interfaces(&self, resolver: &HierarchyResolver) -> Vec<Option<Arc<TypeDescriptor>>> {
        self.interface_links
            .iter()
            .zip(&self.interface_names)
            .map(|(slot, name)| fill_optional(slot, name, self.loader, resolver))
            .collect()
    }

    /// Declared interfaces in order; the first unresolvable one is an error.
    pub fn required_interfaces(
        &self,
        resolver: &HierarchyResolver,
    ) -> Result<Vec<Arc<TypeDescriptor>>, ResolutionError> {
        self.interface_links
            .iter()
            .zip(&self.interface_names)
            .map(|(slot, name)| fill_required(slot, name, self.loader, resolver))
            .collect()
    }

    /// Whether every ancestry link of this descriptor has been filled.
    pub fn is_fully_linked(&self) -> bool {
        (self.super_name.is_none() || self.super_link.get().is_some())
            && self.interface_links.iter().all(|l| l.get().is_some())
    }
}

fn fill_optional(
    slot: &Link,
    name: &str,
    loader: LoaderId,
    resolver: &HierarchyResolver,
) -> Option<Arc<TypeDescriptor>> {
    if let Some(d) = slot.get() {
        return Some(Arc::clone(d));
    }
    let resolved = resolver.resolve(name, loader)?;
    Some(Arc::clone(slot.get_or_init(|| resolved)))
}

fn fill_required(
    slot: &Link,
    name: &str,
    loader: LoaderId,
    resolver: &HierarchyResolver,
) -> Result<Arc<TypeDescriptor>, ResolutionError> {
    if let Some(d) = slot.get() {
        return Ok(Arc::clone(d));
    }
    let resolved = resolver.resolve_required(name, loader)?;
    Ok(Arc::clone(slot.get_or_init(|| resolved)))
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.qualified_name)
            .field("loader", &self.loader)
            .field("flags", &self.flags)
            .field("super", &self.super_name)
            .field("interfaces", &self.interface_names)
            .finish()
    }
}
