//! # EDM CLI Module
//!
//! This module implements the CLI interface for the EDM engine.
//!
//! ## Available Commands
//!
//! - `schema define|show` - Define or print the schema of a space
//! - `types` - List type names
//! - `list` - List object ids of a type
//! - `create` - Create an object tree from a JSON file
//! - `get` - Read an object or the values a path selects
//! - `patch` - Overwrite the attributes a path selects
//! - `clone` - Deep-copy an object graph
//! - `safe-links` - Objects a clone may share
//! - `graph` - Print the link graph below an object
//! - `blob put|get` - Store and fetch opaque content

mod commands;

use crate::config::{BackendKind, Config, ConfigError, LogFormat, Overrides, Settings};
use clap::{Parser, Subcommand};
use edm_core::{Edm, EdmError};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

pub use commands::*;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors of a CLI invocation.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Edm(#[from] EdmError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cannot access {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// EDM - Entity Data Model
///
/// Typed, unit-aware documents linked into a queryable object graph.
#[derive(Parser, Debug)]
#[command(name = "edm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the database (overrides the config file)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Storage backend (overrides the config file)
    #[arg(short = 'B', long, global = true, value_enum)]
    pub backend: Option<BackendKind>,

    /// Space to operate on (overrides the config file)
    #[arg(short, long, global = true)]
    pub space: Option<String>,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "edm.toml")]
    pub config: PathBuf,

    /// Log format (overrides the config file)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Effective settings: flags over the config file over defaults.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let config = Config::load_or_default(&self.config)?;
        Ok(config.resolve(Overrides {
            database: self.database.clone(),
            backend: self.backend,
            space: self.space.clone(),
            log_format: self.log_format,
        }))
    }
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Define or show the schema of the space
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },

    /// List the type names of the space
    Types,

    /// List object ids of a type
    List {
        /// Type name
        type_name: String,

        /// JSON file with attribute values the objects must equal
        #[arg(short, long)]
        query: Option<PathBuf>,
    },

    /// Create an object (and nested objects) from a JSON file
    Create {
        /// Type name
        type_name: String,

        /// JSON payload file
        file: PathBuf,
    },

    /// Read an object, or the values a path selects
    Get {
        /// Type name
        type_name: String,

        /// Object id
        id: String,

        /// Path below the object
        #[arg(short, long, default_value = "")]
        path: String,

        /// Leave out links deeper than this
        #[arg(short = 'd', long)]
        max_depth: Option<usize>,

        /// Emit relative paths for objects already emitted
        #[arg(short, long)]
        tracking: bool,

        /// Leave out the meta records
        #[arg(long)]
        no_meta: bool,

        /// Object ids to emit as ids instead of expanding (comma-separated)
        #[arg(long, value_delimiter = ',')]
        shallow: Vec<String>,
    },

    /// Overwrite the attributes a path selects with values from a JSON file
    Patch {
        /// Type name
        type_name: String,

        /// Object id
        id: String,

        /// Path of the attribute(s)
        #[arg(short, long)]
        path: String,

        /// JSON file: a value for a plain path, a list otherwise
        file: PathBuf,
    },

    /// Deep-copy an object graph
    Clone {
        /// Type name
        type_name: String,

        /// Object id
        id: String,

        /// Object ids to share instead of copying (comma-separated)
        #[arg(long, value_delimiter = ',')]
        shallow: Vec<String>,
    },

    /// List the objects no given path passes through
    SafeLinks {
        /// Type name
        type_name: String,

        /// Object id
        id: String,

        /// Paths that will be modified in the clone
        paths: Vec<String>,
    },

    /// Print the link graph reachable from an object
    Graph {
        /// Type name
        type_name: String,

        /// Object id
        id: String,
    },

    /// Store or fetch opaque content
    Blob {
        #[command(subcommand)]
        action: BlobAction,
    },
}

/// Schema subcommands.
#[derive(Subcommand, Debug)]
pub enum SchemaAction {
    /// Define the schema from a JSON file
    Define {
        /// JSON schema file
        file: PathBuf,

        /// Replace an existing schema
        #[arg(short, long)]
        force: bool,
    },

    /// Print the schema
    Show,
}

/// Blob subcommands.
#[derive(Subcommand, Debug)]
pub enum BlobAction {
    /// Store a file's content
    Put {
        /// Input file
        file: PathBuf,
    },

    /// Write stored content to a file
    Get {
        /// Blob id
        id: String,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Open the engine the settings describe.
pub fn open_engine(settings: &Settings) -> Result<Edm, EdmError> {
    match settings.backend {
        BackendKind::Redb => Edm::with_redb(&settings.database),
        BackendKind::Memory => Ok(Edm::new()),
    }
}

/// Execute the CLI with parsed arguments and print the result.
pub fn execute(cli: &Cli, settings: &Settings) -> Result<(), CliError> {
    let mut edm = open_engine(settings)?;
    let output = dispatch(&mut edm, &settings.space, &cli.command)?;
    print_output(&output, cli.json_mode);
    Ok(())
}

/// Run one command against an engine; returns its result as JSON.
pub fn dispatch(edm: &mut Edm, space: &str, command: &Commands) -> Result<Value, CliError> {
    match command {
        Commands::Schema { action } => match action {
            SchemaAction::Define { file, force } => cmd_schema_define(edm, space, file, *force),
            SchemaAction::Show => cmd_schema_show(edm, space),
        },
        Commands::Types => cmd_types(edm, space),
        Commands::List { type_name, query } => cmd_list(edm, space, type_name, query.as_deref()),
        Commands::Create { type_name, file } => cmd_create(edm, space, type_name, file),
        Commands::Get {
            type_name,
            id,
            path,
            max_depth,
            tracking,
            no_meta,
            shallow,
        } => cmd_get(
            edm, space, type_name, id, path, *max_depth, *tracking, !*no_meta, shallow,
        ),
        Commands::Patch {
            type_name,
            id,
            path,
            file,
        } => cmd_patch(edm, space, type_name, id, path, file),
        Commands::Clone {
            type_name,
            id,
            shallow,
        } => cmd_clone(edm, space, type_name, id, shallow),
        Commands::SafeLinks {
            type_name,
            id,
            paths,
        } => cmd_safe_links(edm, space, type_name, id, paths),
        Commands::Graph { type_name, id } => cmd_graph(edm, space, type_name, id),
        Commands::Blob { action } => match action {
            BlobAction::Put { file } => cmd_blob_put(edm, space, file),
            BlobAction::Get { id, output } => cmd_blob_get(edm, space, id, output),
        },
    }
}
