//! Fast-decoupled (XB/BX) AC power-flow solver.
//!
//! Builds constant B' and B'' susceptance matrices once from the per-unit
//! Y-bus and factors each a single time, reusing them across iterations
//! unless `rebuild_matrices_every` requests a periodic refactor. Converges
//! to the same fixed point as Newton-Raphson for well-conditioned networks,
//! trading a slower convergence rate for cheaper iterations.
//!
//! ## References
//!
//! - Stott & Alsac (1974): "Fast Decoupled Load Flow"
//!   IEEE Trans. PAS, 93(3), 859-869.

use std::collections::{BTreeMap, BTreeSet};

use faer::prelude::*;
use faer::Mat;
use num_complex::Complex64;
use tracing::trace;

use netmodel_core::{BranchKind, Id, NetworkGraph};

use crate::power_flow::newton_raphson::{
    compute_branch_flows, compute_power, preflight, IterationTrace, PowerFlowError,
    PowerFlowInput, PowerFlowSolution, PvSpec, PvToPqSwitch, SwitchDirection, TraceLevel,
};
use crate::ybus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdMethod {
    /// Neglects R when building B'; B'' uses full branch susceptance.
    Xb,
    /// Neglects R in B'' rather than B'; B' uses the full branch admittance.
    Bx,
}

#[derive(Debug, Clone)]
pub struct FastDecoupledOptions {
    pub method: FdMethod,
    pub angle_damping: f64,
    pub voltage_damping: f64,
    /// Refactor B'/B'' every N iterations; 0 means never rebuild after the
    /// initial factorization.
    pub rebuild_matrices_every: usize,
}

impl Default for FastDecoupledOptions {
    fn default() -> Self {
        Self {
            method: FdMethod::Bx,
            angle_damping: 1.0,
            voltage_damping: 1.0,
            rebuild_matrices_every: 0,
        }
    }
}

/// `b=-1/x` when `neglect_r`, else the imaginary part of the full series
/// admittance `1/(r+jx)`, matching the XB/BX variant definitions.
fn branch_series_b(r: f64, x: f64, neglect_r: bool) -> f64 {
    if neglect_r {
        -1.0 / x.abs().max(1e-9)
    } else {
        Complex64::new(r, x).inv().im
    }
}

/// B' (angle-update matrix): series susceptance only, no charging or shunts,
/// no tap stamping, per the decoupled-flow simplification.
fn build_b_prime(
    graph: &NetworkGraph,
    island: &[Id],
    node_index: &BTreeMap<Id, usize>,
    z_base: f64,
    neglect_r: bool,
) -> Mat<f64> {
    let n = node_index.len();
    let in_island: std::collections::HashSet<&str> = island.iter().map(|s| s.as_str()).collect();
    let mut b = vec![vec![0.0_f64; n]; n];

    let mut branch_ids: Vec<&Id> = graph.branches.keys().collect();
    branch_ids.sort();
    for id in branch_ids {
        let branch = &graph.branches[id];
        if !branch.in_service
            || !in_island.contains(branch.from_node_id.as_str())
            || !in_island.contains(branch.to_node_id.as_str())
        {
            continue;
        }
        let Some(&i) = node_index.get(&branch.from_node_id) else {
            continue;
        };
        let Some(&j) = node_index.get(&branch.to_node_id) else {
            continue;
        };
        let (r_ohm, x_ohm) = match &branch.kind {
            BranchKind::Line(line) => {
                if let Some(ov) = &line.impedance_override {
                    (ov.r_total_ohm, ov.x_total_ohm)
                } else {
                    (
                        line.r_ohm_per_km * line.length_km,
                        line.x_ohm_per_km * line.length_km,
                    )
                }
            }
            BranchKind::Transformer(xfmr) => {
                let z_pu = xfmr.short_circuit_impedance_pu();
                let z_ohm = z_pu * (xfmr.voltage_lv_kv * xfmr.voltage_lv_kv) / xfmr.rated_power_mva;
                (z_ohm.re, z_ohm.im)
            }
        };
        let r_pu = r_ohm / z_base;
        let x_pu = x_ohm / z_base;
        let bb = branch_series_b(r_pu, x_pu, neglect_r);
        b[i][i] -= bb;
        b[j][j] -= bb;
        b[i][j] += bb;
        b[j][i] += bb;
    }

    let mut mat = Mat::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            mat.write(i, j, b[i][j]);
        }
    }
    mat
}

/// B'' (voltage-update matrix): full susceptance including tap-squared
/// splitting, line charging, and fixed shunts.
fn build_b_double_prime(
    graph: &NetworkGraph,
    island: &[Id],
    node_index: &BTreeMap<Id, usize>,
    shunts: &[ybus::ShuntSpec],
    z_base: f64,
    neglect_r: bool,
) -> Mat<f64> {
    let n = node_index.len();
    let in_island: std::collections::HashSet<&str> = island.iter().map(|s| s.as_str()).collect();
    let mut b = vec![vec![0.0_f64; n]; n];

    let mut branch_ids: Vec<&Id> = graph.branches.keys().collect();
    branch_ids.sort();
    for id in branch_ids {
        let branch = &graph.branches[id];
        if !branch.in_service
            || !in_island.contains(branch.from_node_id.as_str())
            || !in_island.contains(branch.to_node_id.as_str())
        {
            continue;
        }
        let Some(&i) = node_index.get(&branch.from_node_id) else {
            continue;
        };
        let Some(&j) = node_index.get(&branch.to_node_id) else {
            continue;
        };
        let (r_ohm, x_ohm, charging_b_pu, tap) = match &branch.kind {
            BranchKind::Line(line) => {
                let (r, x, b_us) = if let Some(ov) = &line.impedance_override {
                    (ov.r_total_ohm, ov.x_total_ohm, ov.b_total_us)
                } else {
                    (
                        line.r_ohm_per_km * line.length_km,
                        line.x_ohm_per_km * line.length_km,
                        line.b_us_per_km * line.length_km,
                    )
                };
                (r, x, (b_us * 1e-6) * z_base, 1.0_f64)
            }
            BranchKind::Transformer(xfmr) => {
                let z_pu = xfmr.short_circuit_impedance_pu();
                let z_ohm = z_pu * (xfmr.voltage_lv_kv * xfmr.voltage_lv_kv) / xfmr.rated_power_mva;
                (z_ohm.re, z_ohm.im, 0.0, xfmr.tap_ratio())
            }
        };
        let r_pu = r_ohm / z_base;
        let x_pu = x_ohm / z_base;
        let bb = branch_series_b(r_pu, x_pu, neglect_r);
        let t2 = tap * tap;
        b[i][i] += -bb / t2 + charging_b_pu / 2.0;
        b[j][j] += -bb + charging_b_pu / 2.0;
        b[i][j] -= -bb / tap;
        b[j][i] -= -bb / tap;
    }

    for shunt in shunts {
        if let Some(&idx) = node_index.get(&shunt.node_id) {
            b[idx][idx] += shunt.b_pu;
        }
    }

    let mut mat = Mat::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            mat.write(i, j, b[i][j]);
        }
    }
    mat
}

/// Drops the slack row/column from B' and every non-PQ row/column from B''.
fn reduce(mat: &Mat<f64>, keep: &[usize]) -> Mat<f64> {
    let m = keep.len();
    let mut out = Mat::zeros(m, m);
    for (a, &i) in keep.iter().enumerate() {
        for (b, &j) in keep.iter().enumerate() {
            out.write(a, b, mat.read(i, j));
        }
    }
    out
}

fn lu_solve(factored: &Mat<f64>, rhs: &[f64]) -> Option<Vec<f64>> {
    let n = rhs.len();
    if n == 0 {
        return Some(vec![]);
    }
    let mut b = Mat::zeros(n, 1);
    for (i, &v) in rhs.iter().enumerate() {
        b.write(i, 0, v);
    }
    let solution = factored.partial_piv_lu().solve(&b);
    let x: Vec<f64> = (0..n).map(|i| solution.read(i, 0)).collect();
    if x.iter().any(|v| !v.is_finite()) {
        None
    } else {
        Some(x)
    }
}

pub fn solve(
    graph: &NetworkGraph,
    input: PowerFlowInput,
    options: FastDecoupledOptions,
) -> Result<PowerFlowSolution, PowerFlowError> {
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
    let z_base = (slack_node.voltage_level_kv.value() * slack_node.voltage_level_kv.value())
        / input.base_mva;

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

    let neglect_r_in_b_prime = matches!(options.method, FdMethod::Xb);
    let b_prime_full = build_b_prime(graph, &island, &node_index, z_base, neglect_r_in_b_prime);
    let b_double_prime_full = build_b_double_prime(
        graph,
        &island,
        &node_index,
        &input.shunts,
        z_base,
        !neglect_r_in_b_prime,
    );

    let p_idx: Vec<usize> = (0..n).filter(|&i| i != slack_idx).collect();
    let mut b_prime_reduced = reduce(&b_prime_full, &p_idx);

    let mut pv_to_pq_switches = Vec::new();
    let mut trace = Vec::new();
    let mut prev_q_calc: Option<Vec<f64>> = None;
    let mut converged = false;
    let mut iterations = 0;
    let mut final_max_mismatch = f64::INFINITY;

    for iter in 1..=input.options.max_iter {
        iterations = iter;
        let mut switches_this_iter = Vec::new();

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
                switches_this_iter.push(event.clone());
                pv_to_pq_switches.push(event);
            }
        }

        let q_idx: Vec<usize> = pq_set.iter().copied().collect();
        let (p_calc, q_calc) = compute_power(&y, &v_mag, &v_ang);
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

        trace!(iter, max_mismatch, "fast-decoupled iteration");
        final_max_mismatch = max_mismatch;

        if max_mismatch < input.options.tolerance {
            converged = true;
            trace.push(fd_trace_entry(
                iter,
                max_mismatch,
                mismatch_norm,
                0.0,
                &options,
                switches_this_iter,
                None,
                &input.options.trace_level,
                &p_idx,
                &q_idx,
                &idx_to_id,
                &delta_p,
                &delta_q,
                &v_mag,
                &v_ang,
            ));
            break;
        }

        if options.rebuild_matrices_every > 0
            && iter > 1
            && (iter - 1) % options.rebuild_matrices_every == 0
        {
            b_prime_reduced = reduce(&b_prime_full, &p_idx);
        }
        let b_double_prime_reduced = reduce(&b_double_prime_full, &q_idx);

        let rhs_p: Vec<f64> = p_idx
            .iter()
            .zip(delta_p.iter())
            .map(|(&i, &d)| d / v_mag[i])
            .collect();
        let Some(d_theta) = lu_solve(&b_prime_reduced, &rhs_p) else {
            trace.push(fd_trace_entry(
                iter,
                max_mismatch,
                mismatch_norm,
                0.0,
                &options,
                switches_this_iter,
                Some("singular_b_prime".to_string()),
                &input.options.trace_level,
                &p_idx,
                &q_idx,
                &idx_to_id,
                &delta_p,
                &delta_q,
                &v_mag,
                &v_ang,
            ));
            return Err(PowerFlowError::SingularJacobian(iter));
        };
        for (k, &i) in p_idx.iter().enumerate() {
            v_ang[i] += options.angle_damping * d_theta[k];
        }
        v_ang[slack_idx] = input.slack.angle_rad;

        let (_, q_calc_mid) = compute_power(&y, &v_mag, &v_ang);
        let delta_q_mid: Vec<f64> = q_idx.iter().map(|&i| q_spec[i] - q_calc_mid[i]).collect();
        let rhs_q: Vec<f64> = q_idx
            .iter()
            .zip(delta_q_mid.iter())
            .map(|(&i, &d)| d / v_mag[i])
            .collect();
        let Some(d_v_over_v) = lu_solve(&b_double_prime_reduced, &rhs_q) else {
            trace.push(fd_trace_entry(
                iter,
                max_mismatch,
                mismatch_norm,
                0.0,
                &options,
                switches_this_iter,
                Some("singular_b_double_prime".to_string()),
                &input.options.trace_level,
                &p_idx,
                &q_idx,
                &idx_to_id,
                &delta_p,
                &delta_q,
                &v_mag,
                &v_ang,
            ));
            return Err(PowerFlowError::SingularJacobian(iter));
        };
        let step_norm = d_theta
            .iter()
            .chain(d_v_over_v.iter())
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt();
        for (k, &i) in q_idx.iter().enumerate() {
            v_mag[i] += options.voltage_damping * d_v_over_v[k] * v_mag[i];
        }
        v_mag[slack_idx] = input.slack.u_pu;

        trace.push(fd_trace_entry(
            iter,
            max_mismatch,
            mismatch_norm,
            step_norm,
            &options,
            switches_this_iter,
            None,
            &input.options.trace_level,
            &p_idx,
            &q_idx,
            &idx_to_id,
            &delta_p,
            &delta_q,
            &v_mag,
            &v_ang,
        ));

        prev_q_calc = Some(q_calc);
    }

    let (branch_flows, losses_mw, losses_mvar) = if slack_node.voltage_level_kv.value() > 0.0 {
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
fn fd_trace_entry(
    iter: usize,
    max_mismatch_pu: f64,
    mismatch_norm: f64,
    step_norm: f64,
    options: &FastDecoupledOptions,
    switches_this_iter: Vec<PvToPqSwitch>,
    cause: Option<String>,
    trace_level: &TraceLevel,
    p_idx: &[usize],
    q_idx: &[usize],
    idx_to_id: &[Id],
    delta_p: &[f64],
    delta_q: &[f64],
    v_mag: &[f64],
    v_ang: &[f64],
) -> IterationTrace {
    let applied_method = Some(match options.method {
        FdMethod::Xb => "xb".to_string(),
        FdMethod::Bx => "bx".to_string(),
    });
    if *trace_level == TraceLevel::Minimal {
        return IterationTrace {
            iter,
            max_mismatch_pu,
            mismatch_norm,
            step_norm,
            damping_used: options.angle_damping.min(options.voltage_damping),
            pv_to_pq_switches_this_iter: switches_this_iter,
            cause,
            delta_p_pu: None,
            delta_q_pu: None,
            jacobian: None,
            delta_state: None,
            state_next: None,
            solver_method: Some("fast-decoupled".to_string()),
            angle_damping: Some(options.angle_damping),
            voltage_damping: Some(options.voltage_damping),
            applied_method,
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
    IterationTrace {
        iter,
        max_mismatch_pu,
        mismatch_norm,
        step_norm,
        damping_used: options.angle_damping.min(options.voltage_damping),
        pv_to_pq_switches_this_iter: switches_this_iter,
        cause,
        delta_p_pu: Some(delta_p_pu),
        delta_q_pu: Some(delta_q_pu),
        jacobian: None,
        delta_state: None,
        state_next: Some(state_next),
        solver_method: Some("fast-decoupled".to_string()),
        angle_damping: Some(options.angle_damping),
        voltage_damping: Some(options.voltage_damping),
        applied_method,
    }
}
