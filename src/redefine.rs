//! Fixpoint redefinition of already loaded classes.
//!
//! Each pass takes a fresh snapshot of the loaded universe, transforms every
//! class not handled earlier in the run, and submits the resulting edits.
//! Redefining can make the host load more classes, so passes repeat until one
//! of them produces no edit at all.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, error, warn};

use crate::classfile::qualified_name;
use crate::error::RedefinitionError;
use crate::instrument::{ClassDefinition, ClassId, Instrumentation, LoadedClass};
use crate::transform::{ClassFileTransformer, TransformRequest};

#[derive(Debug, Clone, Copy, Default)]
pub struct RedefineOptions {
    /// Redefine classes one at a time and keep going past failures.
    pub verbose: bool,
    /// Give classes whose bytes could not be read another chance in later
    /// passes instead of marking them done.
    pub retry_unreadable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RedefineReport {
    pub passes: usize,
    pub transformed: usize,
    pub redefined: usize,
    pub failed: Vec<String>,
    pub unreadable: Vec<String>,
}

/// Per-run bookkeeping; lives for one [`Redefiner::redefine`] call.
#[derive(Default)]
struct PassState {
    done: HashSet<ClassId>,
    pending: Vec<ClassDefinition>,
}

pub struct Redefiner<'a> {
    inst: &'a dyn Instrumentation,
    options: RedefineOptions,
}

impl<'a> Redefiner<'a> {
    pub fn new(inst: &'a dyn Instrumentation, options: RedefineOptions) -> Self {
        Self { inst, options }
    }

    /// Runs passes until one yields no edits. In batch mode a rejected batch
    /// aborts the run; nothing from that batch is applied.
    pub fn redefine(
        &self,
        transformer: &dyn ClassFileTransformer,
    ) -> Result<RedefineReport, RedefinitionError> {
        let mut state = PassState::default();
        let mut report = RedefineReport::default();

        for pass in 1.. {
            report.passes = pass;
            debug!("Redefining classes pass #{pass}...");
            self.collect(transformer, &mut state, &mut report);
            if state.pending.is_empty() {
                debug!("No more classes to redefine after pass #{pass}");
                break;
            }
            let edits = std::mem::take(&mut state.pending);
            report.transformed += edits.len();
            debug!("Redefining {} classes in pass #{pass}", edits.len());
            self.submit(edits, &mut report)?;
        }
        Ok(report)
    }

    fn collect(
        &self,
        transformer: &dyn ClassFileTransformer,
        state: &mut PassState,
        report: &mut RedefineReport,
    ) {
        for class in self.inst.all_loaded_classes() {
            if class.is_array() || !state.done.insert(class.id) {
                continue;
            }
            if !transformer.process_class(&class.name, class.loader) {
                continue;
            }
            let bytes = match self.inst.class_bytes(&class) {
                Ok(Some(bytes)) if !bytes.is_empty() => bytes,
                Ok(_) => {
                    warn!(
                        "Cannot read class resource: {} loaded by {}",
                        class.name, class.loader
                    );
                    self.unreadable(&class, state, report);
                    continue;
                }
                Err(e) => {
                    warn!(
                        "Failed to read class resource: {} loaded by {}: {e}",
                        class.name, class.loader
                    );
                    self.unreadable(&class, state, report);
                    continue;
                }
            };
            let request = TransformRequest {
                loader: class.loader,
                class_name: &class.name,
                redefining: Some(&class),
                bytes: &bytes,
            };
            if let Some(bytes) = transformer.apply(&request) {
                state.pending.push(ClassDefinition { class, bytes });
            }
        }
    }

    fn unreadable(&self, class: &LoadedClass, state: &mut PassState, report: &mut RedefineReport) {
        let name = qualified_name(&class.name);
        if !report.unreadable.contains(&name) {
            report.unreadable.push(name);
        }
        if self.options.retry_unreadable {
            state.done.remove(&class.id);
        }
    }

    fn submit(
        &self,
        edits: Vec<ClassDefinition>,
        report: &mut RedefineReport,
    ) -> Result<(), RedefinitionError> {
        if !self.options.verbose {
            let count = edits.len();
            self.inst
                .redefine_classes(&edits)
                .map_err(|source| RedefinitionError::Batch {
                    count,
                    source: Box::new(source),
                })?;
            report.redefined += count;
            return Ok(());
        }

        for edit in edits {
            let name = qualified_name(&edit.class.name);
            debug!("Redefining class {name}");
            match self.inst.redefine_classes(std::slice::from_ref(&edit)) {
                Ok(()) => report.redefined += 1,
                Err(e) => {
                    error!("Failed to redefine class {name}: {e}");
                    report.failed.push(name);
                }
            }
        }
        Ok(())
    }
}
