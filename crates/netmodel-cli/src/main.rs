mod cli;

use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, FdVariant, PfMethod};
use netmodel_core::canonical::{snapshot_hash, verify_hash};
use netmodel_core::{NetworkGraph, Snapshot};
use netmodel_shortcircuit::{FaultLocation, FaultType, ShortCircuitOptions};
use netmodel_solve::{fast_decoupled, newton_raphson, FastDecoupledOptions, FdMethod, PowerFlowInput};

#[derive(serde::Deserialize)]
struct FaultSpec {
    fault_type: FaultType,
    location: FaultLocation,
    #[serde(default)]
    options: ShortCircuitOptions,
}

fn load_graph(path: &str) -> Result<NetworkGraph> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing network graph from {path}"))
}

fn load_snapshot(path: &str) -> Result<Snapshot> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing snapshot from {path}"))
}

fn load_pf_input(path: &str) -> Result<PowerFlowInput> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing power-flow input from {path}"))
}

fn load_fault_spec(path: &str) -> Result<FaultSpec> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing fault spec from {path}"))
}

fn cmd_build_graph(graph_file: &str) -> Result<()> {
    let graph = load_graph(graph_file)?;
    let connected = graph.is_connected(true);
    let islands = graph.find_islands(true);
    println!("nodes: {}", graph.nodes.len());
    println!("branches: {}", graph.branches.len());
    println!("switches: {}", graph.switches.len());
    println!("inverter_sources: {}", graph.inverter_sources.len());
    println!("connected: {connected}");
    println!("islands: {}", islands.len());
    Ok(())
}

fn cmd_validate(graph_file: &str) -> Result<()> {
    let graph = load_graph(graph_file)?;
    let (report, matrix) = netmodel_actions::validate_network(&graph);

    for issue in &report.issues {
        println!("{:?}: {} ({:?})", issue.severity, issue.message, issue.element_refs);
    }
    println!("status: {}", if report.is_valid { "ok" } else { "blocked" });

    println!("short_circuit_3ph: {}", matrix.short_circuit_3ph.available);
    println!("short_circuit_1ph: {}", matrix.short_circuit_1ph.available);
    println!("short_circuit_2ph: {}", matrix.short_circuit_2ph.available);
    println!("short_circuit_2ph_ground: {}", matrix.short_circuit_2ph_ground.available);
    println!("load_flow: {}", matrix.load_flow.available);

    if !report.is_valid {
        let blockers = report
            .issues
            .iter()
            .filter(|i| i.severity == netmodel_actions::Severity::Blocker)
            .count();
        anyhow::bail!("{blockers} blocker issue(s) found");
    }
    Ok(())
}

fn cmd_hash(snapshot_file: &str, expect: Option<&str>) -> Result<()> {
    let snapshot = load_snapshot(snapshot_file)?;
    let hash = snapshot_hash(&snapshot).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!("{hash}");
    if let Some(expected) = expect {
        let matches = verify_hash(&snapshot, expected).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        if !matches {
            anyhow::bail!("hash mismatch: expected {expected}, got {hash}");
        }
    }
    Ok(())
}

fn cmd_solve_pf(graph_file: &str, input_file: &str, method: PfMethod, fd_variant: FdVariant) -> Result<()> {
    let graph = load_graph(graph_file)?;
    let input = load_pf_input(input_file)?;
    let solution = match method {
        PfMethod::Newton => newton_raphson::solve(&graph, input),
        PfMethod::FastDecoupled => {
            let options = FastDecoupledOptions {
                method: match fd_variant {
                    FdVariant::Xb => FdMethod::Xb,
                    FdVariant::Bx => FdMethod::Bx,
                },
                ..FastDecoupledOptions::default()
            };
            fast_decoupled::solve(&graph, input, options)
        }
    }
    .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    println!("converged: {}", solution.converged);
    println!("iterations: {}", solution.iterations);
    println!("max_mismatch_pu: {:.3e}", solution.max_mismatch_pu);
    println!("losses_mw: {:.4}", solution.losses_total_mw);
    println!("losses_mvar: {:.4}", solution.losses_total_mvar);
    if !solution.not_solved.is_empty() {
        println!("not_solved: {:?}", solution.not_solved);
    }
    if !solution.pv_to_pq_switches.is_empty() {
        println!("pv_to_pq_switches: {}", solution.pv_to_pq_switches.len());
    }
    println!("{}", serde_json::to_string_pretty(&solution.bus_voltage_magnitude_pu)?);
    Ok(())
}

fn cmd_solve_sc(graph_file: &str, fault_file: &str) -> Result<()> {
    let graph = load_graph(graph_file)?;
    let spec = load_fault_spec(fault_file)?;
    let result = netmodel_shortcircuit::calculate(&graph, spec.fault_type, &spec.location, &spec.options)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    println!("ikss_ka: {:.4}", result.ikss_ka);
    println!("ip_ka: {:.4}", result.ip_ka);
    println!("ib_ka: {:.4}", result.ib_ka);
    println!("ik_ka: {:.4}", result.ik_ka);
    println!("kappa: {:.4}", result.kappa);
    println!("c_used: {}", result.c_used);
    if !result.inverter_contributions.is_empty() {
        println!("{}", serde_json::to_string_pretty(&result.inverter_contributions)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("netmodel-cli starting");

    match &cli.command {
        Commands::BuildGraph { graph_file } => cmd_build_graph(graph_file),
        Commands::Validate { graph_file } => cmd_validate(graph_file),
        Commands::Hash { snapshot_file, expect } => cmd_hash(snapshot_file, expect.as_deref()),
        Commands::SolvePf {
            graph_file,
            input_file,
            method,
            fd_variant,
        } => cmd_solve_pf(graph_file, input_file, *method, *fd_variant),
        Commands::SolveSc { graph_file, fault_file } => cmd_solve_sc(graph_file, fault_file),
    }
}
