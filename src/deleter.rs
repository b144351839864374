//! Sample transformation: delete a method from a class, optionally from all
//! of its subtypes as well.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;

use crate::agent::{Agent, AgentBuilder, AgentFactory};
use crate::classfile::{ClassFile, internal_name, qualified_name};
use crate::config::{AgentSettings, arg_or_env, parse_agent_args};
use crate::hierarchy::HierarchyResolver;
use crate::instrument::{ClassSource, Instrumentation, LoaderId};
use crate::transform::{CachingTransformer, TransformRequest, TransformResult, Transformation};

pub const AGENT_NAME: &str = "method-deleter";

pub const DELETE_CLASS_ENV: &str = "JAGENT_DELETE_CLASS";
pub const DELETE_METHOD_ENV: &str = "JAGENT_DELETE_METHOD";

pub struct MethodDeleter {
    class: String,
    method: String,
    subtypes: Option<Arc<HierarchyResolver>>,
}

impl MethodDeleter {
    pub fn new(class: &str, method: &str) -> Self {
        Self {
            class: internal_name(class),
            method: method.to_string(),
            subtypes: None,
        }
    }

    /// Also targets every class assignable to the configured one.
    pub fn with_subtypes(mut self, resolver: Arc<HierarchyResolver>) -> Self {
        self.subtypes = Some(resolver);
        self
    }
}

impl Transformation for MethodDeleter {
    fn process_class(&self, class_name: &str, loader: LoaderId) -> bool {
        if class_name == self.class {
            return true;
        }
        let Some(resolver) = self.subtypes.as_ref() else {
            return false;
        };
        match resolver.is_assignable_from(&self.class, class_name, loader) {
            Ok(assignable) => assignable,
            Err(e) => {
                debug!("Skipping {class_name} loaded by {loader}: {e}");
                false
            }
        }
    }

    fn transform(&self, request: &TransformRequest<'_>) -> TransformResult {
        if !self.process_class(request.class_name, request.loader) {
            return Ok(None);
        }
        let mut class = ClassFile::parse(request.bytes)?;
        let removed = class.remove_methods(&self.method)?;
        if removed == 0 {
            return Ok(None);
        }
        debug!(
            "Deleted {removed} method(s) {} from {}",
            self.method,
            qualified_name(request.class_name)
        );
        Ok(Some(class.to_bytes()))
    }
}

/// Builds the method-deleter agent from `class=..,method=..[,subtypes]`.
pub struct MethodDeleterAgent {
    pub source: Arc<dyn ClassSource>,
    pub settings: AgentSettings,
}

impl MethodDeleterAgent {
    /// The caching transformer the agent installs, built from raw agent
    /// arguments.
    pub fn transformer(&self, args: &str) -> Result<CachingTransformer<MethodDeleter>> {
        let args = parse_agent_args(args);
        let class = arg_or_env(&args, "class", DELETE_CLASS_ENV)
            .with_context(|| format!("Missing class (agent argument `class` or {DELETE_CLASS_ENV})"))?;
        let method = arg_or_env(&args, "method", DELETE_METHOD_ENV).with_context(|| {
            format!("Missing method (agent argument `method` or {DELETE_METHOD_ENV})")
        })?;

        let mut deleter = MethodDeleter::new(&class, &method);
        if args.contains_key("subtypes") {
            deleter = deleter.with_subtypes(Arc::new(HierarchyResolver::new(Arc::clone(
                &self.source,
            ))));
        }
        Ok(CachingTransformer::new(deleter, self.settings.version.clone())
            .with_cache_dir(self.settings.cache_dir.clone())
            .with_dump_dir(self.settings.dump_dir.clone()))
    }
}

impl AgentFactory for MethodDeleterAgent {
    fn create(&self, inst: Arc<dyn Instrumentation>, args: &str) -> Result<Agent> {
        let transformer = self.transformer(args)?;
        Ok(AgentBuilder::new(AGENT_NAME, env!("CARGO_PKG_VERSION"))
            .transformer(Arc::new(transformer))
            .verbose_redefinition(self.settings.verbose_redefinition)
            .retry_unreadable(self.settings.retry_unreadable)
            .build(inst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ClassFileBuilder;

    fn request<'a>(name: &'a str, bytes: &'a [u8]) -> TransformRequest<'a> {
        TransformRequest {
            loader: LoaderId(1),
            class_name: name,
            redefining: None,
            bytes,
        }
    }

    #[test]
    fn deletes_named_method_only_from_target() {
        let deleter = MethodDeleter::new("com.x.Foo", "bar");
        let foo = ClassFileBuilder::new("com/x/Foo")
            .method("bar", "()V")
            .method("baz", "()V")
            .build();

        let out = deleter.transform(&request("com/x/Foo", &foo)).unwrap().unwrap();
        let parsed = ClassFile::parse(&out).unwrap();
        assert_eq!(parsed.method_names().unwrap(), vec!["baz"]);

        assert!(deleter.transform(&request("com/x/Foo", &out)).unwrap().is_none());

        let other = ClassFileBuilder::new("com/x/Other").method("bar", "()V").build();
        assert!(!deleter.process_class("com/x/Other", LoaderId(1)));
        assert!(deleter.transform(&request("com/x/Other", &other)).unwrap().is_none());
    }

    #[test]
    fn garbage_input_is_an_error() {
        let deleter = MethodDeleter::new("a/B", "m");
        assert!(deleter.transform(&request("a/B", b"nope")).is_err());
    }
}
