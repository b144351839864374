use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use crate::cli::Cli;

pub const CACHE_DIR_ENV: &str = "JAGENT_CACHE_DIR";
pub const DUMP_DIR_ENV: &str = "JAGENT_DUMP_DIR";
pub const CACHE_VERSION_ENV: &str = "JAGENT_CACHE_VERSION";

/// Effective settings shared by every transformer an agent creates.
#[derive(Debug, Clone, Default)]
pub struct AgentSettings {
    pub version: String,
    pub cache_dir: Option<PathBuf>,
    pub dump_dir: Option<PathBuf>,
    pub verbose_redefinition: bool,
    pub retry_unreadable: bool,
}

pub fn resolve_settings(cli: &Cli) -> Result<AgentSettings> {
    Ok(AgentSettings {
        version: resolve_cache_version(cli),
        cache_dir: resolve_cache_dir(cli)?,
        dump_dir: resolve_dump_dir(cli),
        verbose_redefinition: false,
        retry_unreadable: false,
    })
}

pub fn resolve_cache_dir(cli: &Cli) -> Result<Option<PathBuf>> {
    if cli.no_cache {
        return Ok(None);
    }
    if let Some(p) = cli.cache.clone() {
        return Ok(Some(p));
    }
    if let Ok(p) = env::var(CACHE_DIR_ENV)
        && !p.is_empty()
    {
        return Ok(Some(PathBuf::from(p)));
    }
    Ok(Some(jagent_home()?.join("cache")))
}

/// Cache root even when caching is switched off, for `stats` and `clear`.
pub fn resolve_cache_root(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.cache.clone() {
        return Ok(p);
    }
    if let Ok(p) = env::var(CACHE_DIR_ENV)
        && !p.is_empty()
    {
        return Ok(PathBuf::from(p));
    }
    Ok(jagent_home()?.join("cache"))
}

pub fn resolve_dump_dir(cli: &Cli) -> Option<PathBuf> {
    cli.dump.clone().or_else(|| {
        env::var(DUMP_DIR_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    })
}

pub fn resolve_cache_version(cli: &Cli) -> String {
    cli.cache_version
        .clone()
        .or_else(|| env::var(CACHE_VERSION_ENV).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
}

/// Splits `key=value,flag,...` agent arguments. A bare word maps to `"true"`.
pub fn parse_agent_args(args: &str) -> BTreeMap<String, String> {
    args.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (part.to_string(), "true".to_string()),
        })
        .collect()
}

/// Value from the agent arguments, else from the environment.
pub fn arg_or_env(args: &BTreeMap<String, String>, key: &str, env_key: &str) -> Option<String> {
    args.get(key)
        .cloned()
        .or_else(|| env::var(env_key).ok())
        .filter(|v| !v.is_empty())
}

fn jagent_home() -> Result<PathBuf> {
    let base = dirs::cache_dir()
        .or_else(dirs::data_local_dir)
        .or_else(dirs::home_dir)
        .context("Failed to resolve a cache directory")?;
    Ok(base.join("jagent"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn agent_args_split_into_pairs_and_flags() {
        let args = parse_agent_args(" class=com.x.Foo , method=bar,subtypes,,");
        assert_eq!(args.get("class").map(String::as_str), Some("com.x.Foo"));
        assert_eq!(args.get("method").map(String::as_str), Some("bar"));
        assert_eq!(args.get("subtypes").map(String::as_str), Some("true"));
        assert_eq!(args.len(), 3);
        assert!(parse_agent_args("").is_empty());
    }

    #[test]
    fn explicit_flags_win() {
        let cli = Cli::parse_from([
            "jagent",
            "--cache",
            "/tmp/c",
            "--cache-version",
            "v9",
            "--dump",
            "/tmp/d",
            "stats",
        ]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.cache_dir, Some(PathBuf::from("/tmp/c")));
        assert_eq!(settings.dump_dir, Some(PathBuf::from("/tmp/d")));
        assert_eq!(settings.version, "v9");
    }

    #[test]
    fn no_cache_disables_caching_but_keeps_root() {
        let cli = Cli::parse_from(["jagent", "--no-cache", "stats"]);
        assert_eq!(resolve_cache_dir(&cli).unwrap(), None);
        assert!(resolve_cache_root(&cli).is_ok());
    }
}
