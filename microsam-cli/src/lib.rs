//! micro-sam command line tools
//!
//! Front-end for the embeddings library: environment information, model
//! checkpoint download and inspection of embedding stores.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use microsam_embeddings::{CacheConfig, ModelRegistry};

#[derive(Debug, Parser)]
#[command(name = "microsam")]
#[command(about = "micro-sam embedding cache and model tools")]
#[command(version)]
pub struct Cli {
    /// Cache directory (defaults to MICROSAM_CACHEDIR or the user cache directory)
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show version, cache directory and available models
    Info,

    /// Download model checkpoints (all encoders when none are given)
    Download {
        /// Model names, e.g. vit_b_lm
        models: Vec<String>,
    },

    /// Show the signature and feature layout of an embeddings store
    Inspect {
        /// Path of the store
        store: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn config(&self) -> anyhow::Result<CacheConfig> {
        match &self.cache_dir {
            Some(dir) => Ok(CacheConfig::new(dir)),
            None => Ok(CacheConfig::from_env()?),
        }
    }
}

/// Run a parsed command line
pub fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config()?;
    let registry = ModelRegistry::new(&config);

    match cli.command {
        Command::Info => {
            let info = commands::info(&config, &registry)?;
            print!("{}", info);
        }
        Command::Download { models } => {
            let downloaded = commands::download(&registry, &models)?;
            for (name, path) in downloaded {
                println!("{}: {}", name, path.display());
            }
        }
        Command::Inspect { store, json } => {
            let summary = commands::inspect(&store)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary);
            }
        }
    }
    Ok(())
}
