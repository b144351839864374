use anyhow::{Context, Result};
use clap::Parser;
use jagent::agent::{AgentRegistry, AgentReport};
use jagent::cache::TransformCache;
use jagent::classfile::internal_name;
use jagent::classpath::ClassPathHost;
use jagent::cli::{Cli, Commands};
use jagent::config::{AgentSettings, resolve_cache_root, resolve_cache_version, resolve_settings};
use jagent::deleter::{AGENT_NAME, MethodDeleterAgent};
use jagent::hierarchy::HierarchyResolver;
use jagent::instrument::ClassSource;
use jagent::logging;
use jagent::transform::{ClassFileTransformer, TransformRequest, TransformStats};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level, cli.log_file.as_deref())?;

    match cli.command.clone() {
        Commands::Run {
            classpath,
            agent,
            agent_args,
            verbose_redefinition,
            retry_unreadable,
            defer,
            out,
        } => {
            let settings = AgentSettings {
                verbose_redefinition,
                retry_unreadable,
                ..resolve_settings(&cli)?
            };
            let output = run(&classpath, &agent, &agent_args, settings, &defer, out.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Assignable {
            target,
            candidate,
            classpath,
        } => {
            let host = Arc::new(ClassPathHost::open(&classpath)?);
            let loader = host.application_loader();
            let resolver = HierarchyResolver::new(host);
            let assignable = resolver.is_assignable_from(&target, &candidate, loader)?;
            let output = AssignableResult {
                target,
                candidate,
                assignable,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Warmup {
            classpath,
            agent_args,
            threads,
        } => {
            let output = warmup(&classpath, &agent_args, resolve_settings(&cli)?, threads)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Stats => {
            let cache = TransformCache::new(resolve_cache_root(&cli)?, resolve_cache_version(&cli));
            println!("{}", serde_json::to_string_pretty(&cache.stats()?)?);
        }
        Commands::Clear { all } => {
            let cache = TransformCache::new(resolve_cache_root(&cli)?, resolve_cache_version(&cli));
            cache.clear(all)?;
            let cleared = if all { cache.root().to_path_buf() } else { cache.version_dir() };
            info!("Cleared {}", cleared.display());
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct RunResult {
    classes_loaded: usize,
    deferred_loaded: usize,
    classes_written: Option<usize>,
    duration_ms: u64,
    report: AgentReport,
}

#[derive(Debug, Serialize)]
struct AssignableResult {
    target: String,
    candidate: String,
    assignable: bool,
}

#[derive(Debug, Serialize)]
struct WarmupResult {
    classes: usize,
    transformed: usize,
    duration_ms: u64,
    stats: TransformStats,
}

fn is_deferred(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| name.starts_with(&internal_name(p)))
}

fn run(
    classpath: &[PathBuf],
    agent: &str,
    agent_args: &str,
    settings: AgentSettings,
    defer: &[String],
    out: Option<&Path>,
) -> Result<RunResult> {
    let start = Instant::now();
    let host = Arc::new(ClassPathHost::open(classpath)?);
    let classes_loaded = host.load_all(|name| is_deferred(name, defer))?;

    let mut registry = AgentRegistry::new();
    registry.register(
        AGENT_NAME,
        MethodDeleterAgent {
            source: host.clone() as Arc<dyn ClassSource>,
            settings,
        },
    );
    let report = registry.run_agent(agent, host.clone(), agent_args)?;

    let mut deferred_loaded = 0usize;
    for (name, loader) in host.resources() {
        if is_deferred(&name, defer) {
            host.load_class(&name, loader)?;
            deferred_loaded += 1;
        }
    }

    let classes_written = match out {
        Some(dir) => Some(
            host.write_classes(dir)
                .with_context(|| format!("Failed to write classes to {}", dir.display()))?,
        ),
        None => None,
    };

    Ok(RunResult {
        classes_loaded,
        deferred_loaded,
        classes_written,
        duration_ms: start.elapsed().as_millis() as u64,
        report,
    })
}

fn warmup(
    classpath: &[PathBuf],
    agent_args: &str,
    settings: AgentSettings,
    threads: Option<usize>,
) -> Result<WarmupResult> {
    let start = Instant::now();
    let host = Arc::new(ClassPathHost::open(classpath)?);
    let factory = MethodDeleterAgent {
        source: host.clone() as Arc<dyn ClassSource>,
        settings,
    };
    let transformer = factory.transformer(agent_args)?;

    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = threads {
        builder = builder.num_threads(n.max(1));
    }
    let pool = builder.build().context("Failed to build warmup thread pool")?;

    let resources = host.resources();
    let transformed = pool.install(|| {
        resources
            .par_iter()
            .filter(|(name, loader)| transformer.process_class(name, *loader))
            .filter_map(|(name, loader)| {
                let bytes = host.find_resource(name, *loader).ok().flatten()?.1;
                let request = TransformRequest {
                    loader: *loader,
                    class_name: name,
                    redefining: None,
                    bytes: &bytes,
                };
                transformer.apply(&request)
            })
            .count()
    });

    Ok(WarmupResult {
        classes: resources.len(),
        transformed,
        duration_ms: start.elapsed().as_millis() as u64,
        stats: transformer.stats(),
    })
}
