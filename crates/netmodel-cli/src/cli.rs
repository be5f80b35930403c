//! Command-line surface: thin argument parsing only, no business logic.

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "netmodel", version, about = "Medium-voltage network analysis engine CLI")]
pub struct Cli {
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a network graph from JSON, check connectivity, and print summary stats.
    BuildGraph {
        /// Path to a JSON-serialized `NetworkGraph`.
        graph_file: String,
    },
    /// Run structural/reference/invariant validation over a graph file.
    Validate {
        graph_file: String,
    },
    /// Compute or verify the canonical SHA-256 hash of a snapshot file.
    Hash {
        snapshot_file: String,
        /// Expected hash; if provided, the command exits non-zero on mismatch.
        #[arg(long)]
        expect: Option<String>,
    },
    /// Solve AC power flow against a graph file and a power-flow input file.
    SolvePf {
        graph_file: String,
        input_file: String,
        #[arg(long, value_enum, default_value = "newton")]
        method: PfMethod,
        #[arg(long, value_enum, default_value = "bx")]
        fd_variant: FdVariant,
    },
    /// Compute an IEC 60909 short-circuit current against a graph file and a
    /// fault-specification file.
    SolveSc {
        graph_file: String,
        fault_file: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PfMethod {
    Newton,
    FastDecoupled,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FdVariant {
    Xb,
    Bx,
}
