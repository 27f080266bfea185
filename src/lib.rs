//! Cloudplan – template-driven cloud orchestration
//!
//! This crate implements:
//! - A small line-oriented template language (parser, AST, value forms)
//! - A multi-pass compiler resolving variables, holes, aliases and references
//!   against declarative command specifications
//! - A runner with dry-run support producing auditable execution records
//! - A reverter synthesising undo templates from executed ones
//! - A concurrent resource fetcher assembling live provider state into a graph
//! - Service assembly grouping fetchers and commands per provider API

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Control-plane abstraction and the in-memory simulated provider.
pub mod cloud;
/// Command objects, parameter executors and the command registry.
pub mod command;
/// Flat key/value configuration with typed accessors.
pub mod config;
/// Concurrent per-resource-type fetcher engine.
pub mod fetch;
/// Resource graph with labelled relations.
pub mod graph;
/// Services grouping fetchers and commands per provider API.
pub mod service;
/// On-disk layout for execution history and local state.
pub mod store;
/// Template language: AST, parser, compiler, runner and reverter.
pub mod template;

// Re-export key types for convenience
pub use config::Config;
pub use graph::Graph;
pub use store::Store;
pub use template::{Template, TemplateExecution};

/// Current version of the cloudplan crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
