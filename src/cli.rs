//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Certificate authority, trust bootstrap and scrape access control
#[derive(Parser, Debug)]
#[command(name = "scrape-trust")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SCRAPE_TRUST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "SCRAPE_TRUST_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SCRAPE_TRUST_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Certificate authority management
    #[command(subcommand)]
    Ca(CaCommand),

    /// Generate an Ed25519 node signing key and its `.pub` verification key
    Keygen {
        /// Signing key output file
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Serve the certificate distribution protocol until Ctrl-C
    Authority,

    /// Obtain a certificate from the authority, polling until one is issued
    Request,

    /// Scrape policy management
    #[command(subcommand)]
    Policy(PolicyCommand),
}

/// Certificate authority subcommands
#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// Create the CA, write its bootstrap attestation and issue the
    /// authority's TLS certificate
    Init {
        /// Overwrite existing CA state
        #[arg(long)]
        force: bool,

        /// DNS names for the authority's TLS certificate
        #[arg(long = "dns")]
        dns_names: Vec<String>,

        /// IP addresses for the authority's TLS certificate
        #[arg(long = "ip")]
        ips: Vec<std::net::IpAddr>,
    },

    /// Sign a CSR offline
    Issue {
        /// CSR file (PEM)
        #[arg(long)]
        csr: PathBuf,

        /// Certificate output file (PEM)
        #[arg(long)]
        out: PathBuf,
    },

    /// Check the CA root against its bootstrap attestation
    VerifyRoot,
}

/// Policy subcommands
#[derive(Subcommand, Debug)]
pub enum PolicyCommand {
    /// Allow a subject to scrape an object
    Grant {
        /// Peer identity
        subject: String,
        /// Object (mapping path)
        object: String,
    },

    /// Revoke a subject's scrape capability, or everything it holds
    Revoke {
        /// Peer identity
        subject: String,
        /// Object; when omitted every permission and role is revoked
        object: Option<String>,
    },

    /// Give a subject a role
    RoleAdd {
        /// Peer identity
        subject: String,
        /// Role name
        role: String,
    },

    /// Take a role from a subject
    RoleRemove {
        /// Peer identity
        subject: String,
        /// Role name
        role: String,
    },

    /// Set an access window (RFC3339 expiry or duration from now)
    Window {
        /// Peer identity
        subject: String,
        /// Object (mapping path)
        object: String,
        /// Expiry or duration, e.g. `2026-12-31T00:00:00Z` or `2h`
        value: String,
    },

    /// Set a minimum spacing between scrapes
    Frequency {
        /// Peer identity
        subject: String,
        /// Object (mapping path)
        object: String,
        /// Duration, e.g. `5m`
        value: String,
    },

    /// Load role definitions from a JSON file
    LoadRoles {
        /// Roles file
        file: PathBuf,
    },

    /// Evaluate a scrape decision
    Check {
        /// Peer identity
        subject: String,
        /// Object (mapping path)
        object: String,
        /// Metric families to filter
        #[arg(long = "metric")]
        metrics: Vec<String>,
    },

    /// Show permissions of a subject, or every source and role
    Show {
        /// Peer identity
        subject: Option<String>,
    },
}
