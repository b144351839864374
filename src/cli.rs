use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogLevel;

#[derive(Debug, Clone, Parser)]
#[command(name = "jagent")]
#[command(about = "Instrument class files with cached transformations and fixpoint redefinition")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Transform cache root (defaults to $JAGENT_CACHE_DIR, then the user cache dir)
    #[arg(long, value_name = "DIR")]
    pub cache: Option<PathBuf>,

    #[arg(long, conflicts_with = "cache")]
    pub no_cache: bool,

    /// Mirror every transformed class into this directory
    #[arg(long, value_name = "DIR")]
    pub dump: Option<PathBuf>,

    /// Logical version that namespaces cache entries
    #[arg(long, value_name = "VER")]
    pub cache_version: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Load a class path, run an agent over it and report the redefinitions
    Run {
        #[arg(short = 'c', long = "classpath", value_name = "PATH", required = true, num_args = 1..)]
        classpath: Vec<PathBuf>,

        #[arg(long, default_value = crate::deleter::AGENT_NAME)]
        agent: String,

        /// Agent arguments, e.g. `class=com.x.Foo,method=bar,subtypes`
        #[arg(short = 'a', long, value_name = "ARGS", default_value = "")]
        agent_args: String,

        #[arg(long)]
        verbose_redefinition: bool,

        #[arg(long)]
        retry_unreadable: bool,

        /// Classes under this package prefix are loaded only after the agent started
        #[arg(long, value_name = "PREFIX")]
        defer: Vec<String>,

        /// Write the final definition of every loaded class here
        #[arg(short = 'o', long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
    /// Check whether CANDIDATE is assignable to TARGET
    Assignable {
        target: String,
        candidate: String,

        #[arg(short = 'c', long = "classpath", value_name = "PATH", required = true, num_args = 1..)]
        classpath: Vec<PathBuf>,
    },
    /// Populate the transform cache for every class on the class path
    Warmup {
        #[arg(short = 'c', long = "classpath", value_name = "PATH", required = true, num_args = 1..)]
        classpath: Vec<PathBuf>,

        #[arg(short = 'a', long, value_name = "ARGS", default_value = "")]
        agent_args: String,

        #[arg(long, value_name = "N")]
        threads: Option<usize>,
    },
    Stats,
    Clear {
        /// Remove every logical version, not only the current one
        #[arg(long)]
        all: bool,
    },
}
