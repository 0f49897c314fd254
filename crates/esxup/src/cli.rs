use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub const DEFAULT_DEPOT_URL: &str =
    "http://hostupdate.vmware.com/software/VUM/PRODUCTION/main/vmw-depot-index.xml";

/// Drive an ESXi host over SSH: check and apply updates, back up
/// configuration, manage licenses, and reconcile a local patch
/// repository.
#[derive(Debug, Parser)]
#[command(name = "esxup", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Target host, `name` or `name:port`. Prompted for when omitted.
    #[arg(short = 's', long, global = true)]
    pub host: Option<String>,

    /// Username; falls back to the password file, then a prompt.
    #[arg(short, long, global = true)]
    pub username: Option<String>,

    /// Password; falls back to the password file, then a no-echo prompt.
    #[arg(short, long, global = true)]
    pub password: Option<String>,

    /// Answer yes to every confirmation (updates and host-key changes).
    #[arg(short = 'y', long = "yes", global = true)]
    pub assume_yes: bool,

    /// Credential store with `host:username:password` lines
    /// (default: ~/.esxpasswd).
    #[arg(long, global = true, value_name = "FILE")]
    pub password_file: Option<PathBuf>,

    /// Local patch repository directory (default: ./patches).
    #[arg(short = 'P', long, global = true, value_name = "DIR")]
    pub patch_dir: Option<PathBuf>,

    /// Update depot index URL.
    #[arg(long, global = true, default_value = DEFAULT_DEPOT_URL, value_name = "URL")]
    pub depot_url: String,

    /// SSH timeout in seconds.
    #[arg(long, global = true, default_value_t = 10, value_name = "SECONDS")]
    pub timeout: u64,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also write debug logs to this file.
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check whether a newer patch level is available; never mutates.
    Check {
        /// Patch bundle (path, or patch number resolved in the patch
        /// directory) to compare against instead of the depot.
        #[arg(short, long, value_name = "PATCH")]
        file: Option<String>,
    },

    /// Update the host when a newer patch level is available.
    Update {
        /// Patch bundle to install from instead of the depot.
        #[arg(short, long, value_name = "PATCH")]
        file: Option<String>,

        /// Reboot after installation when the update requires it.
        #[arg(short, long)]
        reboot: bool,
    },

    /// Report installed and depot patch levels under the raw
    /// numeric-floor comparison; never mutates.
    Inspect {
        /// Patch bundle to compare against instead of the depot.
        #[arg(short, long, value_name = "PATCH")]
        file: Option<String>,
    },

    /// Back up the host configuration and download the bundle.
    Backup {
        /// Local destination for the configuration bundle.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Show or install license keys.
    License {
        #[command(subcommand)]
        action: LicenseAction,
    },

    /// Reboot the host.
    Reboot,

    /// Shut the host down.
    Shutdown,

    /// Execute a command on the host and print its output.
    Exec {
        /// The command to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Work with the local patch repository.
    Patches {
        #[command(subcommand)]
        action: PatchesAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum LicenseAction {
    /// Show installed license keys.
    Show,
    /// Install a license key.
    Set {
        key: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum PatchesAction {
    /// List patch bundles in the local repository.
    List,
    /// Resolve a patch reference against the local repository.
    Find {
        reference: String,
    },
    /// Reconcile a patch catalog against the local repository.
    Sync {
        /// JSON catalog mapping update identifiers to locators.
        #[arg(long, value_name = "FILE")]
        catalog: PathBuf,

        /// Fetch entries missing from the local repository.
        #[arg(short, long)]
        download: bool,
    },
}
