//! Newton–Raphson AC power-flow solver.
//!
//! Solves `P_spec = P(V, θ)`, `Q_spec = Q(V, θ)` on a network with one slack,
//! zero or more PV buses, and zero or more PQ buses, using the polar-form
//! Newton–Raphson method with a full 4-block Jacobian.
//!
//! ## References
//!
//! - Tinney & Hart (1967): "Power Flow Solution by Newton's Method"
//!   IEEE Trans. PAS, 86(11), 1449-1460.

use std::collections::{BTreeMap, BTreeSet};

use faer::prelude::*;
use faer::Mat;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

use netmodel_core::{Id, NetworkGraph};

use crate::ybus::{self, ShuntSpec, TapOverride, YBusBuildError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackSpec {
    pub node_id: Id,
    pub u_pu: f64,
    pub angle_rad: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqSpec {
    pub node_id: Id,
    pub p_mw: f64,
    pub q_mvar: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvSpec {
    pub node_id: Id,
    pub p_mw: f64,
    pub v_pu: f64,
    pub q_min_mvar: f64,
    pub q_max_mvar: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusLimit {
    pub node_id: Id,
    pub u_min_pu: f64,
    pub u_max_pu: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchLimit {
    pub branch_id: Id,
    pub rating_mva: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceLevel {
    Minimal,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerFlowOptions {
    pub max_iter: usize,
    pub tolerance: f64,
    pub damping: f64,
    pub flat_start: bool,
    pub trace_level: TraceLevel,
}

impl Default for PowerFlowOptions {
    fn default() -> Self {
        Self {
            max_iter: 20,
            tolerance: 1e-6,
            damping: 1.0,
            flat_start: true,
            trace_level: TraceLevel::Minimal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerFlowInput {
    pub base_mva: f64,
    pub slack: SlackSpec,
    pub pq: Vec<PqSpec>,
    pub pv: Vec<PvSpec>,
    pub shunts: Vec<ShuntSpec>,
    pub taps: Vec<TapOverride>,
    pub bus_limits: Vec<BusLimit>,
    pub branch_limits: Vec<BranchLimit>,
    pub options: PowerFlowOptions,
}

#[derive(Debug, Error)]
pub enum PowerFlowError {
    #[error("preflight validation failed: {0:?}")]
    Preflight(Vec<String>),
    #[error("y-bus construction failed: {0}")]
    YBus(#[from] YBusBuildError),
    #[error("reference error: {0}")]
    Reference(String),
    #[error("singular jacobian at iteration {0}")]
    SingularJacobian(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchDirection {
    AboveMax,
    BelowMin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvToPqSwitch {
    pub iter: usize,
    pub node_id: Id,
    pub q_calc_mvar: f64,
    pub limit_mvar: f64,
    pub direction: SwitchDirection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JacobianBlocks {
    pub dp_dtheta: Vec<Vec<f64>>,
    pub dp_dv: Vec<Vec<f64>>,
    pub dq_dtheta: Vec<Vec<f64>>,
    pub dq_dv: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationTrace {
    pub iter: usize,
    pub max_mismatch_pu: f64,
    pub mismatch_norm: f64,
    pub step_norm: f64,
    pub damping_used: f64,
    pub pv_to_pq_switches_this_iter: Vec<PvToPqSwitch>,
    pub cause: Option<String>,
    /// Present only when `trace_level == Full`.
    pub delta_p_pu: Option<BTreeMap<Id, f64>>,
    pub delta_q_pu: Option<BTreeMap<Id, f64>>,
    pub jacobian: Option<JacobianBlocks>,
    pub delta_state: Option<BTreeMap<Id, (f64, f64)>>,
    pub state_next: Option<BTreeMap<Id, (f64, f64)>>,
    /// Set only by the fast-decoupled solver (`"fast-decoupled"`).
    pub solver_method: Option<String>,
    pub angle_damping: Option<f64>,
    pub voltage_damping: Option<f64>,
    pub applied_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchFlow {
    pub branch_id: Id,
    pub s_from_mw: f64,
    pub s_from_mvar: f64,
    pub s_to_mw: f64,
    pub s_to_mvar: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerFlowSolution {
    pub converged: bool,
    pub iterations: usize,
    pub max_mismatch_pu: f64,
    pub bus_voltage_magnitude_pu: BTreeMap<Id, f64>,
    pub bus_voltage_angle_rad: BTreeMap<Id, f64>,
    pub not_solved: Vec<Id>,
    pub pv_to_pq_switches: Vec<PvToPqSwitch>,
    pub branch_flows: Vec<BranchFlow>,
    pub losses_total_mw: f64,
    pub losses_total_mvar: f64,
    pub trace: Vec<IterationTrace>,
    pub warnings: Vec<String>,
}

pub(crate) fn preflight(graph: &NetworkGraph, input: &PowerFlowInput) -> Vec<String> {
    let mut errors = Vec::new();
    if input.base_mva <= 0.0 {
        errors.push("base_mva must be > 0".to_string());
    }
    if graph.get_node(&input.slack.node_id).is_none() {
        errors.push(format!("slack node {} not found in graph", input.slack.node_id));
    }

    fn duplicate<'a>(id: &'a str, seen: &mut BTreeSet<&'a str>, errors: &mut Vec<String>) {
        if !seen.insert(id) {
            errors.push(format!("duplicate id {id} across pq/pv/shunts/limits/taps"));
        }
    }

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for s in &input.pq {
        duplicate(&s.node_id, &mut seen, &mut errors);
    }
    for s in &input.pv {
        duplicate(&s.node_id, &mut seen, &mut errors);
    }

    let pq_ids: BTreeSet<&str> = input.pq.iter().map(|s| s.node_id.as_str()).collect();
    let pv_ids: BTreeSet<&str> = input.pv.iter().map(|s| s.node_id.as_str()).collect();
    if pq_ids.contains(input.slack.node_id.as_str()) || pv_ids.contains(input.slack.node_id.as_str()) {
        errors.push("slack node must not also be classified PQ or PV".to_string());
    }
    for id in pq_ids.intersection(&pv_ids) {
        errors.push(format!("node {id} classified as both PQ and PV"));
    }

    for pv in &input.pv {
        if pv.q_min_mvar > pv.q_max_mvar {
            errors.push(format!("pv {}: q_min_mvar must be <= q_max_mvar", pv.node_id));
        }
    }
    for limit in &input.bus_limits {
        if limit.u_min_pu >= limit.u_max_pu {
            errors.push(format!("bus limit {}: u_min_pu must be < u_max_pu", limit.node_id));
        }
    }
    for tap in &input.taps {
        match graph.get_branch(&tap.branch_id) {
            Some(b) if matches!(b.kind, netmodel_core::BranchKind::Transformer(_)) => {}
            Some(_) => errors.push(format!("tap {} refers to a non-transformer branch", tap.branch_id)),
            None => errors.push(format!("tap refers to unknown branch {}", tap.branch_id)),
        }
    }
    for limit in &input.branch_limits {
        if graph.get_branch(&limit.branch_id).is_none() {
            errors.push(format!("branch limit refers to unknown branch {}", limit.branch_id));
        }
    }

    errors
}

pub(crate) fn compute_power(y: &[Vec<Complex64>], v_mag: &[f64], v_ang: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = v_mag.len();
    let mut p = vec![0.0; n];
    let mut q = vec![0.0; n];
    for i in 0..n {
        for j in 0..n {
            let g_ij = y[i][j].re;
            let b_ij = y[i][j].im;
            let theta_ij = v_ang[i] - v_ang[j];
            let (s, c) = theta_ij.sin_cos();
            p[i] += v_mag[i] * v_mag[j] * (g_ij * c + b_ij * s);
            q[i] += v_mag[i] * v_mag[j] * (g_ij * s - b_ij * c);
        }
    }
    (p, q)
}

/// Dense 4-block Jacobian over the index sets `p_idx` (all non-slack buses)
/// and `q_idx` (current PQ set). `p_calc`/`q_calc` must already reflect
/// `v_mag`/`v_ang`.
fn build_jacobian(
    y: &[Vec<Complex64>],
    v_mag: &[f64],
    v_ang: &[f64],
    p_calc: &[f64],
    q_calc: &[f64],
    p_idx: &[usize],
    q_idx: &[usize],
) -> JacobianBlocks {
    let np = p_idx.len();
    let nq = q_idx.len();
    let mut dp_dtheta = vec![vec![0.0; np]; np];
    let mut dp_dv = vec![vec![0.0; nq]; np];
    let mut dq_dtheta = vec![vec![0.0; np]; nq];
    let mut dq_dv = vec![vec![0.0; nq]; nq];

    for (a, &i) in p_idx.iter().enumerate() {
        for (b, &j) in p_idx.iter().enumerate() {
            if i == j {
                dp_dtheta[a][b] = -q_calc[i] - y[i][i].im * v_mag[i] * v_mag[i];
            } else {
                let theta_ij = v_ang[i] - v_ang[j];
                dp_dtheta[a][b] = v_mag[i]
                    * v_mag[j]
                    * (y[i][j].re * theta_ij.sin() - y[i][j].im * theta_ij.cos());
            }
        }
    }
    for (a, &i) in p_idx.iter().enumerate() {
        for (b, &j) in q_idx.iter().enumerate() {
            if i == j {
                dp_dv[a][b] = p_calc[i] / v_mag[i] + y[i][i].re * v_mag[i];
            } else {
                let theta_ij = v_ang[i] - v_ang[j];
                dp_dv[a][b] =
                    v_mag[i] * (y[i][j].re * theta_ij.cos() + y[i][j].im * theta_ij.sin());
            }
        }
    }
    for (a, &i) in q_idx.iter().enumerate() {
        for (b, &j) in p_idx.iter().enumerate() {
            if i == j {
                dq_dtheta[a][b] = p_calc[i] - y[i][i].re * v_mag[i] * v_mag[i];
            } else {
                let theta_ij = v_ang[i] - v_ang[j];
                dq_dtheta[a][b] = -v_mag[i]
                    * v_mag[j]
                    * (y[i][j].re * theta_ij.cos() + y[i][j].im * theta_ij.sin());
            }
        }
    }
    for (a, &i) in q_idx.iter().enumerate() {
        for (b, &j) in q_idx.iter().enumerate() {
            if i == j {
                dq_dv[a][b] = q_calc[i] / v_mag[i] - y[i][i].im * v_mag[i];
            } else {
                let theta_ij = v_ang[i] - v_ang[j];
                dq_dv[a][b] =
                    v_mag[i] * (y[i][j].re * theta_ij.sin() - y[i][j].im * theta_ij.cos());
            }
        }
    }

    JacobianBlocks {
        dp_dtheta,
        dp_dv,
        dq_dtheta,
        dq_dv,
    }
}

fn solve_jacobian(j: &JacobianBlocks, rhs: &[f64]) -> Option<Vec<f64>> {
    let np = j.dp_dtheta.len();
    let nq = j.dq_dv.len();
    let n = np + nq;
    if n == 0 {
        return Some(vec![]);
    }
    let mut mat = Mat::zeros(n, n);
    for i in 0..np {
        for k in 0..np {
            mat.write(i, k, j.dp_dtheta[i][k]);
        }
        for k in 0..nq {
            mat.write(i, np + k, j.dp_dv[i][k]);
        }
    }
    for i in 0..nq {
        for k in 0..np {
            mat.write(np + i, k, j.dq_dtheta[i][k]);
        }
        for k in 0..nq {
            mat.write(np + i, np + k, j.dq_dv[i][k]);
        }
    }
    let mut b = Mat::zeros(n, 1);
    for (i, &v) in rhs.iter().enumerate() {
        b.write(i, 0, v);
    }
    let solution = mat.partial_piv_lu().solve(&b);
    let x: Vec<f64> = (0..n).map(|i| solution.read(i, 0)).collect();
    if x.iter().any(|v| !v.is_finite()) {
        None
    } else {
        Some(x)
    }
}

pub fn solve(graph: &NetworkGraph, input: PowerFlowInput) -> Result<PowerFlowSolution, PowerFlowError> {
    let errors = preflight(graph, &input);
    if !errors.is_empty() {
        return Err(PowerFlowError::Preflight(errors));
    }
    let mut warnings = Vec::new();
    if !(0.8..=1.2).contains(&input.slack.u_pu) {
        warnings.push(format!(
            "slack.u_pu = {} outside the expected [0.8, 1.2] range",
            input.slack.u_pu
        ));
    }

    // Step 1: slack island.
    let island = graph
        .get_connected_nodes(&input.slack.node_id, true)
        .map_err(|e| PowerFlowError::Reference(e.to_string()))?;
    let mut all_nodes: Vec<&Id> = graph.nodes.keys().collect();
    all_nodes.sort();
    let island_set: BTreeSet<&str> = island.iter().map(|s| s.as_str()).collect();
    let not_solved: Vec<Id> = all_nodes
        .into_iter()
        .filter(|id| !island_set.contains(id.as_str()))
        .cloned()
        .collect();

    // Step 2: per-unit Y-bus.
    let slack_node = graph
        .get_node(&input.slack.node_id)
        .ok_or_else(|| PowerFlowError::Reference("slack node vanished after preflight".into()))?;
    let ybus_result = ybus::build_ybus(
        graph,
        &island,
        input.base_mva,
        slack_node.voltage_level_kv.value(),
        &input.shunts,
        &input.taps,
    )?;
    let n = ybus_result.trace.n;
    let node_index = ybus_result.node_index.clone();
    let mut idx_to_id: Vec<Id> = vec![String::new(); n];
    for (id, &idx) in &node_index {
        idx_to_id[idx] = id.clone();
    }
    let y = ybus_result.y;

    let slack_idx = node_index[&input.slack.node_id];

    // Step 3: compose P_spec/Q_spec. Both PQ and PV contribute as sinks
    // (negative injections) per the resolved sign convention.
    let mut p_spec = vec![0.0; n];
    let mut q_spec = vec![0.0; n];
    let mut pq_set: BTreeSet<usize> = BTreeSet::new();
    let mut pv_remaining: BTreeMap<usize, &PvSpec> = BTreeMap::new();

    for pq in &input.pq {
        let Some(&idx) = node_index.get(&pq.node_id) else {
            continue;
        };
        p_spec[idx] -= pq.p_mw / input.base_mva;
        q_spec[idx] -= pq.q_mvar / input.base_mva;
        pq_set.insert(idx);
    }
    let mut v_mag = vec![1.0; n];
    let mut v_ang = vec![0.0; n];
    if !input.options.flat_start {
        for (id, &idx) in &node_index {
            if let Some(node) = graph.get_node(id) {
                v_mag[idx] = node.voltage_magnitude_pu.map(|p| p.value()).unwrap_or(1.0);
                v_ang[idx] = node.voltage_angle_rad.map(|r| r.value()).unwrap_or(0.0);
            }
        }
    }
    for pv in &input.pv {
        let Some(&idx) = node_index.get(&pv.node_id) else {
            continue;
        };
        p_spec[idx] -= pv.p_mw / input.base_mva;
        v_mag[idx] = pv.v_pu;
        pv_remaining.insert(idx, pv);
    }
    v_mag[slack_idx] = input.slack.u_pu;
    v_ang[slack_idx] = input.slack.angle_rad;

    let mut pv_to_pq_switches = Vec::new();
    let mut trace = Vec::new();
    let mut prev_q_calc: Option<Vec<f64>> = None;
    let mut converged = false;
    let mut iterations = 0;
    let mut final_max_mismatch = f64::INFINITY;

    for iter in 1..=input.options.max_iter {
        iterations = iter;
        let mut switches_this_iter = Vec::new();

        // Step 5a: PV -> PQ switching against the previous iteration's Q.
        if let Some(prev_q) = &prev_q_calc {
            let violating: Vec<usize> = pv_remaining
                .keys()
                .copied()
                .filter(|&idx| {
                    let pv = pv_remaining[&idx];
                    let q_mvar = prev_q[idx] * input.base_mva;
                    q_mvar > pv.q_max_mvar || q_mvar < pv.q_min_mvar
                })
                .collect();
            for idx in violating {
                let pv = pv_remaining.remove(&idx).unwrap();
                let q_mvar = prev_q[idx] * input.base_mva;
                let (limit_mvar, direction) = if q_mvar > pv.q_max_mvar {
                    (pv.q_max_mvar, SwitchDirection::AboveMax)
                } else {
                    (pv.q_min_mvar, SwitchDirection::BelowMin)
                };
                q_spec[idx] -= limit_mvar / input.base_mva;
                pq_set.insert(idx);
                let event = PvToPqSwitch {
                    iter,
                    node_id: idx_to_id[idx].clone(),
                    q_calc_mvar: q_mvar,
                    limit_mvar,
                    direction,
                };
                warn!(node = %event.node_id, q_mvar, limit_mvar, "PV bus switched to PQ");
                switches_this_iter.push(event.clone());
                pv_to_pq_switches.push(event);
            }
        }

        // Step 5b: mismatch.
        let (p_calc, q_calc) = compute_power(&y, &v_mag, &v_ang);
        let p_idx: Vec<usize> = (0..n).filter(|&i| i != slack_idx).collect();
        let q_idx: Vec<usize> = pq_set.iter().copied().collect();
        let delta_p: Vec<f64> = p_idx.iter().map(|&i| p_spec[i] - p_calc[i]).collect();
        let delta_q: Vec<f64> = q_idx.iter().map(|&i| q_spec[i] - q_calc[i]).collect();
        let max_mismatch = delta_p
            .iter()
            .chain(delta_q.iter())
            .fold(0.0_f64, |m, v| m.max(v.abs()));
        let mismatch_norm = delta_p
            .iter()
            .chain(delta_q.iter())
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt();

        trace!(iter, max_mismatch, "newton-raphson iteration");
        final_max_mismatch = max_mismatch;

        // Step 5c: convergence check.
        if max_mismatch < input.options.tolerance {
            converged = true;
            trace.push(build_trace_entry(
                iter,
                max_mismatch,
                mismatch_norm,
                0.0,
                input.options.damping,
                switches_this_iter,
                None,
                &input.options.trace_level,
                &p_idx,
                &q_idx,
                &idx_to_id,
                &delta_p,
                &delta_q,
                None,
                &v_mag,
                &v_ang,
            ));
            break;
        }

        // Step 5d/e: Jacobian + linear solve.
        let jacobian = build_jacobian(&y, &v_mag, &v_ang, &p_calc, &q_calc, &p_idx, &q_idx);
        let mut rhs = delta_p.clone();
        rhs.extend(delta_q.iter().copied());
        let Some(dx) = solve_jacobian(&jacobian, &rhs) else {
            trace.push(build_trace_entry(
                iter,
                max_mismatch,
                mismatch_norm,
                0.0,
                input.options.damping,
                switches_this_iter,
                Some("singular_jacobian".to_string()),
                &input.options.trace_level,
                &p_idx,
                &q_idx,
                &idx_to_id,
                &delta_p,
                &delta_q,
                None,
                &v_mag,
                &v_ang,
            ));
            return Err(PowerFlowError::SingularJacobian(iter));
        };

        // Step 5f: update with damping; restamp slack.
        let mut delta_state = BTreeMap::new();
        let step_norm = dx.iter().map(|v| v * v).sum::<f64>().sqrt();
        for (k, &i) in p_idx.iter().enumerate() {
            let d_theta = input.options.damping * dx[k];
            v_ang[i] += d_theta;
            delta_state.insert(idx_to_id[i].clone(), (d_theta, 0.0));
        }
        for (k, &i) in q_idx.iter().enumerate() {
            let d_v = input.options.damping * dx[p_idx.len() + k];
            v_mag[i] += d_v;
            delta_state
                .entry(idx_to_id[i].clone())
                .and_modify(|e| e.1 = d_v)
                .or_insert((0.0, d_v));
        }
        v_mag[slack_idx] = input.slack.u_pu;
        v_ang[slack_idx] = input.slack.angle_rad;

        trace.push(build_trace_entry(
            iter,
            max_mismatch,
            mismatch_norm,
            step_norm,
            input.options.damping,
            switches_this_iter,
            None,
            &input.options.trace_level,
            &p_idx,
            &q_idx,
            &idx_to_id,
            &delta_p,
            &delta_q,
            Some((jacobian, delta_state)),
            &v_mag,
            &v_ang,
        ));

        prev_q_calc = Some(q_calc);
    }

    let (branch_flows, losses_mw, losses_mvar) = if slack_node.voltage_level_kv.value() > 0.0 {
        let z_base = (slack_node.voltage_level_kv.value() * slack_node.voltage_level_kv.value())
            / input.base_mva;
        compute_branch_flows(graph, &island, &node_index, &v_mag, &v_ang, input.base_mva, z_base)
    } else {
        (Vec::new(), 0.0, 0.0)
    };

    let bus_voltage_magnitude_pu: BTreeMap<Id, f64> = node_index
        .iter()
        .map(|(id, &idx)| (id.clone(), v_mag[idx]))
        .collect();
    let bus_voltage_angle_rad: BTreeMap<Id, f64> = node_index
        .iter()
        .map(|(id, &idx)| (id.clone(), v_ang[idx]))
        .collect();

    Ok(PowerFlowSolution {
        converged,
        iterations,
        max_mismatch_pu: final_max_mismatch,
        bus_voltage_magnitude_pu,
        bus_voltage_angle_rad,
        not_solved,
        pv_to_pq_switches,
        branch_flows,
        losses_total_mw: losses_mw,
        losses_total_mvar: losses_mvar,
        trace,
        warnings,
    })
}

#[allow(clippy::too_many_arguments)]
fn build_trace_entry(
    iter: usize,
    max_mismatch_pu: f64,
    mismatch_norm: f64,
    step_norm: f64,
    damping_used: f64,
    switches_this_iter: Vec<PvToPqSwitch>,
    cause: Option<String>,
    trace_level: &TraceLevel,
    p_idx: &[usize],
    q_idx: &[usize],
    idx_to_id: &[Id],
    delta_p: &[f64],
    delta_q: &[f64],
    jacobian_and_delta: Option<(JacobianBlocks, BTreeMap<Id, (f64, f64)>)>,
    v_mag: &[f64],
    v_ang: &[f64],
) -> IterationTrace {
    if *trace_level == TraceLevel::Minimal {
        return IterationTrace {
            iter,
            max_mismatch_pu,
            mismatch_norm,
            step_norm,
            damping_used,
            pv_to_pq_switches_this_iter: switches_this_iter,
            cause,
            delta_p_pu: None,
            delta_q_pu: None,
            jacobian: None,
            delta_state: None,
            state_next: None,
            solver_method: None,
            angle_damping: None,
            voltage_damping: None,
            applied_method: None,
        };
    }
    let delta_p_pu: BTreeMap<Id, f64> = p_idx
        .iter()
        .zip(delta_p.iter())
        .map(|(&i, &v)| (idx_to_id[i].clone(), v))
        .collect();
    let delta_q_pu: BTreeMap<Id, f64> = q_idx
        .iter()
        .zip(delta_q.iter())
        .map(|(&i, &v)| (idx_to_id[i].clone(), v))
        .collect();
    let state_next: BTreeMap<Id, (f64, f64)> = idx_to_id
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), (v_mag[i], v_ang[i])))
        .collect();
    let (jacobian, delta_state) = match jacobian_and_delta {
        Some((j, d)) => (Some(j), Some(d)),
        None => (None, None),
    };
    IterationTrace {
        iter,
        max_mismatch_pu,
        mismatch_norm,
        step_norm,
        damping_used,
        pv_to_pq_switches_this_iter: switches_this_iter,
        cause,
        delta_p_pu: Some(delta_p_pu),
        delta_q_pu: Some(delta_q_pu),
        jacobian,
        delta_state,
        state_next: Some(state_next),
        solver_method: None,
        angle_damping: None,
        voltage_damping: None,
        applied_method: None,
    }
}

/// Post-solve branch flows and total losses using the same admittance model
/// as the Y-bus builder, restricted to in-island in-service branches.
pub(crate) fn compute_branch_flows(
    graph: &NetworkGraph,
    island: &[Id],
    node_index: &BTreeMap<Id, usize>,
    v_mag: &[f64],
    v_ang: &[f64],
    base_mva: f64,
    z_base: f64,
) -> (Vec<BranchFlow>, f64, f64) {
    let island_set: BTreeSet<&str> = island.iter().map(|s| s.as_str()).collect();
    let mut flows = Vec::new();
    let mut losses = Complex64::new(0.0, 0.0);

    let mut ids: Vec<&Id> = graph.branches.keys().collect();
    ids.sort();
    for id in ids {
        let branch = &graph.branches[id];
        if !branch.in_service
            || !island_set.contains(branch.from_node_id.as_str())
            || !island_set.contains(branch.to_node_id.as_str())
        {
            continue;
        }
        let Some(&i) = node_index.get(&branch.from_node_id) else {
            continue;
        };
        let Some(&j) = node_index.get(&branch.to_node_id) else {
            continue;
        };
        let vi = Complex64::from_polar(v_mag[i], v_ang[i]);
        let vj = Complex64::from_polar(v_mag[j], v_ang[j]);

        let (y_series, y_sh_i, y_sh_j, tap) = match &branch.kind {
            netmodel_core::BranchKind::Line(line) => {
                let (r, x, b_us) = if let Some(ov) = &line.impedance_override {
                    (ov.r_total_ohm, ov.x_total_ohm, ov.b_total_us)
                } else {
                    (
                        line.r_ohm_per_km * line.length_km,
                        line.x_ohm_per_km * line.length_km,
                        line.b_us_per_km * line.length_km,
                    )
                };
                let z = Complex64::new(r, x);
                let half_b = Complex64::new(0.0, b_us * 1e-6 / 2.0);
                (z.inv(), half_b, half_b, 1.0)
            }
            netmodel_core::BranchKind::Transformer(xfmr) => {
                let z_pu = xfmr.short_circuit_impedance_pu();
                let z_ohm = z_pu * (xfmr.voltage_lv_kv * xfmr.voltage_lv_kv) / xfmr.rated_power_mva;
                let t = xfmr.tap_ratio();
                (z_ohm.inv(), Complex64::new(0.0, 0.0), Complex64::new(0.0, 0.0), t)
            }
        };
        // Convert the ohm-valued admittance into the same per-unit base the
        // Y-bus was built with before taking flows.
        let y_series = y_series * z_base;
        let y_sh_i = y_sh_i * z_base;
        let y_sh_j = y_sh_j * z_base;
        let i_from = vi * (y_series / (tap * tap) + y_sh_i) - vj * (y_series / tap);
        let i_to = vj * (y_series + y_sh_j) - vi * (y_series / tap);
        let s_from = vi * i_from.conj() * base_mva;
        let s_to = vj * i_to.conj() * base_mva;
        losses += s_from + s_to;
        flows.push(BranchFlow {
            branch_id: id.clone(),
            s_from_mw: s_from.re,
            s_from_mvar: s_from.im,
            s_to_mw: s_to.re,
            s_to_mvar: s_to.im,
        });
    }
    (flows, losses.re, losses.im)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netmodel_core::units::{Kilovolts, PerUnit, Radians};
    use netmodel_core::{Branch, BranchKind, LineBranch, LineKind, Node, NodeType, ParallelEdgePolicy};

    fn slack(id: &str) -> Node {
        Node {
            id: id.into(),
            name: id.into(),
            node_type: NodeType::Slack,
            voltage_level_kv: Kilovolts(20.0),
            voltage_magnitude_pu: Some(PerUnit(1.0)),
            voltage_angle_rad: Some(Radians(0.0)),
            active_power_mw: None,
            reactive_power_mvar: None,
            sk_mva: Some(250.0),
            rx_ratio: Some(0.1),
            in_service: true,
        }
    }

    fn pq_node(id: &str) -> Node {
        Node {
            node_type: NodeType::Pq,
            voltage_magnitude_pu: None,
            voltage_angle_rad: None,
            active_power_mw: Some(netmodel_core::units::Megawatts(1.5)),
            reactive_power_mvar: Some(netmodel_core::units::Megavars(0.5)),
            ..slack(id)
        }
    }

    fn two_bus_graph() -> NetworkGraph {
        let mut g = NetworkGraph::new(ParallelEdgePolicy::Strict);
        g.add_node(slack("A")).unwrap();
        g.add_node(pq_node("B")).unwrap();
        g.add_branch(
            Branch {
                id: "L1".into(),
                name: "L1".into(),
                from_node_id: "A".into(),
                to_node_id: "B".into(),
                in_service: true,
                kind: BranchKind::Line(LineBranch {
                    kind: LineKind::Line,
                    r_ohm_per_km: 0.2,
                    x_ohm_per_km: 0.3,
                    b_us_per_km: 1.0,
                    length_km: 2.0,
                    rated_current_a: 300.0,
                    type_ref: None,
                    impedance_override: None,
                    r0_ohm_per_km: None,
                    x0_ohm_per_km: None,
                    b0_us_per_km: None,
                }),
            },
            false,
        )
        .unwrap();
        g
    }

    fn base_input() -> PowerFlowInput {
        PowerFlowInput {
            base_mva: 10.0,
            slack: SlackSpec {
                node_id: "A".into(),
                u_pu: 1.0,
                angle_rad: 0.0,
            },
            pq: vec![PqSpec {
                node_id: "B".into(),
                p_mw: 1.5,
                q_mvar: 0.5,
            }],
            pv: vec![],
            shunts: vec![],
            taps: vec![],
            bus_limits: vec![],
            branch_limits: vec![],
            options: PowerFlowOptions::default(),
        }
    }

    #[test]
    fn two_bus_converges() {
        let g = two_bus_graph();
        let result = solve(&g, base_input()).unwrap();
        assert!(result.converged);
        assert!(result.iterations <= 20);
        assert!(result.not_solved.is_empty());
    }

    #[test]
    fn no_load_flat_profile_stays_near_unity() {
        let mut g = two_bus_graph();
        g.nodes.get_mut("B").unwrap().active_power_mw = Some(netmodel_core::units::Megawatts(0.0));
        g.nodes.get_mut("B").unwrap().reactive_power_mvar = Some(netmodel_core::units::Megavars(0.0));

        let mut input = base_input();
        input.pq[0].p_mw = 0.0;
        input.pq[0].q_mvar = 0.0;
        let result = solve(&g, input).unwrap();
        assert!(result.converged);
        assert!(result.iterations >= 1);
        assert!((result.bus_voltage_magnitude_pu["A"] - 1.0).abs() < 1e-6);
        assert!((result.bus_voltage_magnitude_pu["B"] - 1.0).abs() < 1e-6);
    }

    fn three_bus_radial_graph() -> NetworkGraph {
        let mut g = NetworkGraph::new(ParallelEdgePolicy::Strict);
        g.add_node(slack("A")).unwrap();
        g.add_node(pq_node("B")).unwrap();
        g.add_node(pq_node("C")).unwrap();
        let line = |id: &str, from: &str, to: &str| Branch {
            id: id.into(),
            name: id.into(),
            from_node_id: from.into(),
            to_node_id: to.into(),
            in_service: true,
            kind: BranchKind::Line(LineBranch {
                kind: LineKind::Line,
                r_ohm_per_km: 0.2,
                x_ohm_per_km: 0.3,
                b_us_per_km: 1.0,
                length_km: 2.0,
                rated_current_a: 300.0,
                type_ref: None,
                impedance_override: None,
                r0_ohm_per_km: None,
                x0_ohm_per_km: None,
                b0_us_per_km: None,
            }),
        };
        g.add_branch(line("L1", "A", "B"), false).unwrap();
        g.add_branch(line("L2", "B", "C"), false).unwrap();
        g
    }

    #[test]
    fn three_bus_radial_voltage_drops_monotonically() {
        let g = three_bus_radial_graph();
        let mut input = base_input();
        input.pq = vec![
            PqSpec { node_id: "B".into(), p_mw: 1.0, q_mvar: 0.5 },
            PqSpec { node_id: "C".into(), p_mw: 0.8, q_mvar: 0.3 },
        ];
        let result = solve(&g, input).unwrap();
        assert!(result.converged);
        let u_a = result.bus_voltage_magnitude_pu["A"];
        let u_b = result.bus_voltage_magnitude_pu["B"];
        let u_c = result.bus_voltage_magnitude_pu["C"];
        assert!(u_a > u_b);
        assert!(u_b > u_c);
    }

    #[test]
    fn preflight_rejects_duplicate_and_overlapping_classification() {
        let g = two_bus_graph();
        let mut input = base_input();
        input.pv.push(PvSpec {
            node_id: "B".into(),
            p_mw: 1.0,
            v_pu: 1.0,
            q_min_mvar: -1.0,
            q_max_mvar: 1.0,
        });
        let err = solve(&g, input).unwrap_err();
        assert!(matches!(err, PowerFlowError::Preflight(_)));
    }

    #[test]
    fn preflight_rejects_bad_base_mva() {
        let g = two_bus_graph();
        let mut input = base_input();
        input.base_mva = 0.0;
        assert!(matches!(solve(&g, input), Err(PowerFlowError::Preflight(_))));
    }

    #[test]
    fn pv_bus_switches_to_pq_on_q_limit_violation() {
        let mut g = two_bus_graph();
        g.nodes.get_mut("B").unwrap().node_type = NodeType::Pv;
        g.nodes.get_mut("B").unwrap().active_power_mw = Some(netmodel_core::units::Megawatts(3.0));
        g.nodes.get_mut("B").unwrap().voltage_magnitude_pu = Some(PerUnit(1.02));
        g.nodes.get_mut("B").unwrap().reactive_power_mvar = None;

        let mut input = base_input();
        input.pq.clear();
        input.pv.push(PvSpec {
            node_id: "B".into(),
            p_mw: 3.0,
            v_pu: 1.02,
            q_min_mvar: 0.0,
            q_max_mvar: 0.05,
        });
        input.options.trace_level = TraceLevel::Full;
        let result = solve(&g, input).unwrap();
        assert!(result.converged);
        assert!(!result.pv_to_pq_switches.is_empty());
        let node_ids: Vec<&str> = result
            .pv_to_pq_switches
            .iter()
            .map(|s| s.node_id.as_str())
            .collect();
        assert_eq!(node_ids, vec!["B"]);
    }

    #[test]
    fn deterministic_trace_under_input_permutation() {
        let g = two_bus_graph();
        let input_a = base_input();
        let mut input_b = base_input();
        input_b.pq.reverse();
        let result_a = solve(&g, input_a).unwrap();
        let result_b = solve(&g, input_b).unwrap();
        assert_eq!(result_a.converged, result_b.converged);
        assert_eq!(result_a.iterations, result_b.iterations);
        assert!((result_a.max_mismatch_pu - result_b.max_mismatch_pu).abs() < 1e-12);
    }
}
