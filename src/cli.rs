use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Data directory (config, indices, store).
    /// Defaults to $VSEARCH_DIR or ~/.local/share/vsearch
    #[clap(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch a tenant's catalog and (re)build its index
    Index {
        /// Tenant id
        #[clap(short, long)]
        tenant: String,

        /// Shop domain; registers or updates the tenant together with --token
        #[clap(long, requires = "token")]
        domain: Option<String>,

        /// Admin API access token
        #[clap(long, requires = "domain")]
        token: Option<String>,

        /// Don't draw a progress bar
        #[clap(long, default_value = "false")]
        no_progress: bool,
    },

    /// Find products visually similar to an image
    Search {
        #[clap(short, long)]
        tenant: String,

        /// Path to the query image
        #[clap(short, long)]
        image: PathBuf,

        /// Number of results
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Latest job and index size of a tenant
    Status {
        #[clap(short, long)]
        tenant: String,
    },

    /// Mark a tenant uninstalled and drop its index
    Uninstall {
        #[clap(short, long)]
        tenant: String,
    },

    /// List indexing jobs
    Jobs {
        /// Only jobs of this tenant
        #[clap(short, long)]
        tenant: Option<String>,
    },

    /// Model and loaded indices
    Health,
}
