//! # jagent
//!
//! Core of a class file instrumentation agent.
//!
//! ## Architecture
//!
//! - **classfile**: Class file header codec, constant pool and member editing
//! - **descriptor**: Type descriptors with write-once links to their supertypes
//! - **hierarchy**: Lazy, cached type hierarchy resolution and assignability
//! - **cache**: Content-addressed transform cache keyed by CRC32, plus the debug dump
//! - **transform**: Transformation traits, the panic guard and the caching transformer
//! - **redefine**: Multi-pass fixpoint redefinition of already loaded classes
//! - **agent**: Agent lifecycle and the registry of named agent factories
//! - **instrument**: Host-facing traits for the loaded class universe
//! - **classpath**: In-process host over directories and jars
//! - **deleter**: Sample transformation that deletes methods by name
//! - **config**, **cli**, **logging**: Command line surface and ambient setup

pub mod agent;
pub mod cache;
pub mod classfile;
pub mod classpath;
pub mod cli;
pub mod config;
pub mod deleter;
pub mod descriptor;
pub mod error;
pub mod hierarchy;
pub mod instrument;
pub mod logging;
pub mod redefine;
pub mod transform;
