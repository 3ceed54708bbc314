//! CLI argument parsing for upstamp

use crate::config::Config;
use crate::error::Result;
use crate::types::HashAlgorithm;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// upstamp - resumable uploads with timestamp proofs
#[derive(Parser, Debug)]
#[command(name = "upstamp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload files, fingerprinting and timestamping each one
    Upload(UploadArgs),

    /// Print the content fingerprint of a file
    Hash(HashArgs),

    /// Check whether a saved proof has been anchored
    ProofStatus(ProofStatusArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Arguments for the upload command
#[derive(Parser, Debug)]
pub struct UploadArgs {
    /// Files to upload
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Base URL of the file server
    #[arg(short, long)]
    pub server: Option<String>,

    /// Remote directory the files are placed in
    #[arg(short, long)]
    pub dir: Option<String>,

    /// Number of simultaneous transfers
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Skip timestamp proofs
    #[arg(long)]
    pub no_proof: bool,

    /// Calendar server (can be specified multiple times)
    #[arg(long = "calendar", action = clap::ArgAction::Append)]
    pub calendars: Vec<String>,

    /// Write each proof to <DIR>/<file>.ots
    #[arg(long, value_name = "DIR")]
    pub save_proofs: Option<PathBuf>,

    /// Times a failed transfer is retried
    #[arg(long)]
    pub retries: Option<u32>,

    /// Fingerprint algorithm
    #[arg(long, value_enum)]
    pub hash: Option<HashAlgorithm>,

    /// Read/transfer chunk size (e.g. 64K, 1M)
    #[arg(long)]
    pub chunk_size: Option<String>,

    /// Transfer to an in-memory server; nothing leaves the machine
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Hide progress bars
    #[arg(long)]
    pub no_progress: bool,

    /// Configuration file path
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

impl UploadArgs {
    /// Convert CLI args to Config, merging with file config
    pub fn to_config(&self) -> Result<Config> {
        let mut config = load_config(self.config.as_ref());

        // CLI args override config file
        if let Some(server) = &self.server {
            config.server_url = Some(server.clone());
        }
        if let Some(dir) = &self.dir {
            config.remote_dir = dir.clone();
        }
        if let Some(jobs) = self.jobs {
            config.concurrency = jobs;
        }
        if self.no_proof || self.dry_run {
            config.proofs = false;
        }
        if !self.calendars.is_empty() {
            config.calendars = self.calendars.clone();
        }
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        if let Some(hash) = self.hash {
            config.hash_algorithm = hash;
        }
        if let Some(size) = &self.chunk_size {
            config.chunk_size = Config::parse_size(size)? as usize;
        }
        if self.no_progress {
            config.progress = false;
        }
        if self.dry_run && config.server_url.is_none() {
            config.server_url = Some("http://dry-run.invalid/".to_string());
        }

        config.validate()?;
        Ok(config)
    }
}

/// Arguments for the hash command
#[derive(Parser, Debug)]
pub struct HashArgs {
    /// File to fingerprint
    pub file: PathBuf,

    /// Fingerprint algorithm
    #[arg(long, value_enum, default_value_t = HashAlgorithm::Sha256)]
    pub algorithm: HashAlgorithm,

    /// Read chunk size (e.g. 64K, 1M)
    #[arg(long, default_value = "64K")]
    pub chunk_size: String,
}

/// Arguments for the proof-status command
#[derive(Parser, Debug)]
pub struct ProofStatusArgs {
    /// Proof file (.ots)
    pub file: PathBuf,

    /// Configuration file path
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

impl ProofStatusArgs {
    pub fn to_config(&self) -> Config {
        load_config(self.config.as_ref())
    }
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Show the configuration file path
    #[arg(long)]
    pub path: bool,

    /// Create default configuration file
    #[arg(long)]
    pub init: bool,
}

fn load_config(path: Option<&PathBuf>) -> Config {
    let loaded = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    loaded.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Could not load config, using defaults");
        Config::default()
    })
}
