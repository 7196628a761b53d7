use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kube-appwrapper")]
#[command(about = "AppWrapper workload-grouping operator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and CRD installation
    Check,

    /// Manage the AppWrapper and QuotaPool CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the AppWrapper operator reconcile loops
    Reconcile {
        /// Operator configuration file (missing file means built-in defaults)
        #[arg(long, default_value = "/etc/kube-appwrapper/config.yaml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}
