//! Agent lifecycle: redefine what is already loaded, then hand every
//! transformer to the host for future loads.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, info_span};

use crate::error::RedefinitionError;
use crate::instrument::Instrumentation;
use crate::redefine::{RedefineOptions, RedefineReport, Redefiner};
use crate::transform::ClassFileTransformer;

pub struct AgentBuilder {
    name: String,
    version: String,
    transformers: Vec<Arc<dyn ClassFileTransformer>>,
    options: RedefineOptions,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            transformers: Vec::new(),
            options: RedefineOptions::default(),
        }
    }

    pub fn transformer(mut self, transformer: Arc<dyn ClassFileTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    pub fn transformers(
        mut self,
        transformers: impl IntoIterator<Item = Arc<dyn ClassFileTransformer>>,
    ) -> Self {
        self.transformers.extend(transformers);
        self
    }

    /// Redefine classes one at a time instead of all together.
    pub fn verbose_redefinition(mut self, verbose: bool) -> Self {
        self.options.verbose = verbose;
        self
    }

    pub fn retry_unreadable(mut self, retry: bool) -> Self {
        self.options.retry_unreadable = retry;
        self
    }

    pub fn build(self, inst: Arc<dyn Instrumentation>) -> Agent {
        Agent {
            inst,
            name: self.name,
            version: self.version,
            transformers: self.transformers,
            options: self.options,
        }
    }
}

pub struct Agent {
    inst: Arc<dyn Instrumentation>,
    name: String,
    version: String,
    transformers: Vec<Arc<dyn ClassFileTransformer>>,
    options: RedefineOptions,
}

#[derive(Debug, Serialize)]
pub struct AgentReport {
    pub agent: String,
    pub version: String,
    pub redefinitions: Vec<RedefineReport>,
}

impl Agent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Redefines loaded classes with each transformer in registration order,
    /// registering each one with the host right after its run converges.
    pub fn go(self) -> Result<AgentReport, RedefinitionError> {
        let span = info_span!("agent", name = %self.name);
        let _entered = span.enter();

        info!("Loading {} {}...", self.name, self.version);
        let redefiner = Redefiner::new(self.inst.as_ref(), self.options);
        let mut redefinitions = Vec::with_capacity(self.transformers.len());
        for transformer in &self.transformers {
            redefinitions.push(redefiner.redefine(transformer.as_ref())?);
            self.inst.add_transformer(Arc::clone(transformer));
        }
        info!("Done redefining with {}.", self.name);

        Ok(AgentReport {
            agent: self.name,
            version: self.version,
            redefinitions,
        })
    }
}

/// Produces a ready-to-run agent from the host handle and the raw agent
/// argument string.
pub trait AgentFactory: Send + Sync {
    fn create(&self, inst: Arc<dyn Instrumentation>, args: &str) -> Result<Agent>;
}

impl<F> AgentFactory for F
where
    F: Fn(Arc<dyn Instrumentation>, &str) -> Result<Agent> + Send + Sync,
{
    fn create(&self, inst: Arc<dyn Instrumentation>, args: &str) -> Result<Agent> {
        self(inst, args)
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    factories: BTreeMap<String, Box<dyn AgentFactory>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: impl AgentFactory + 'static) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn run_agent(
        &self,
        name: &str,
        inst: Arc<dyn Instrumentation>,
        args: &str,
    ) -> Result<AgentReport> {
        let factory = self.factories.get(name).with_context(|| {
            let known: Vec<&str> = self.names().collect();
            format!("Invalid agent {name} (known agents: {})", known.join(", "))
        })?;
        let agent = factory
            .create(inst, args)
            .with_context(|| format!("Failed to create agent {name}"))?;
        let report = agent
            .go()
            .with_context(|| format!("Agent {name} failed to redefine loaded classes"))?;
        Ok(report)
    }
}
