//! Positive-, negative-, and zero-sequence nodal admittance assembly and
//! driving-point impedance extraction for the IEC 60909 fault algorithm.
//!
//! The positive-sequence matrix is built by [`netmodel_solve::ybus`] so the
//! admittance model matches the power-flow solvers exactly. The negative
//! sequence is the same matrix: this core carries no rotating-machine
//! entities, so nothing here can break the `Z2 = Z1` equality that IEC
//! 60909 otherwise treats as an approximation. The zero sequence is rebuilt
//! from each line's dedicated zero-sequence conductor data, since that is
//! the one case where the sequence networks genuinely diverge.

use std::collections::BTreeMap;

use num_complex::Complex64;

use netmodel_core::{BranchKind, Id, NetworkGraph};
use netmodel_solve::ybus::{self, YBusBuildError};

use crate::ShortCircuitError;

/// The three sequence admittance matrices, sharing one node index map.
pub struct SequenceNetwork {
    pub node_index: BTreeMap<Id, usize>,
    pub y1: Vec<Vec<Complex64>>,
    pub y2: Vec<Vec<Complex64>>,
    pub y0: Vec<Vec<Complex64>>,
}

/// `Z_src = U^2 / Sk"` collapses to `base_mva / sk_mva` once both the
/// matrix and the source are expressed in the same per-unit base, so no
/// voltage term is needed here. `X = Z/sqrt(1+r^2)`, `R = X*r`.
fn source_admittance_pu(sk_mva: f64, rx_ratio: f64, base_mva: f64) -> Complex64 {
    let z = base_mva / sk_mva;
    let x = z / (1.0 + rx_ratio * rx_ratio).sqrt();
    let r = x * rx_ratio;
    Complex64::new(r, x).inv()
}

fn stamp_sources(
    graph: &NetworkGraph,
    node_index: &BTreeMap<Id, usize>,
    base_mva: f64,
    y1: &mut [Vec<Complex64>],
    y2: &mut [Vec<Complex64>],
    y0: &mut [Vec<Complex64>],
) -> bool {
    let mut any = false;
    for (id, &idx) in node_index {
        let Some(node) = graph.nodes.get(id) else { continue };
        if !node.has_short_circuit_source_data() {
            continue;
        }
        let y_src = source_admittance_pu(node.sk_mva.unwrap(), node.rx_ratio.unwrap(), base_mva);
        y1[idx][idx] += y_src;
        y2[idx][idx] += y_src;
        y0[idx][idx] += y_src;
        any = true;
    }
    any
}

/// Rebuilds a nodal admittance matrix from each in-island line's
/// zero-sequence conductor data. Transformers carry no separate
/// zero-sequence override in this data model, so their positive-sequence
/// impedance is reused for the zero sequence too — a simplification noted
/// alongside the `Z2 = Z1` one.
fn build_zero_sequence(
    graph: &NetworkGraph,
    island: &[Id],
    node_index: &BTreeMap<Id, usize>,
    base_mva: f64,
    slack_u_kv: f64,
) -> Result<Vec<Vec<Complex64>>, ShortCircuitError> {
    let n = node_index.len();
    let in_island: std::collections::HashSet<&str> = island.iter().map(|s| s.as_str()).collect();
    let mut y_ohm = vec![vec![Complex64::new(0.0, 0.0); n]; n];

    let mut branch_ids: Vec<&Id> = graph.branches.keys().collect();
    branch_ids.sort();

    for branch_id in branch_ids {
        let branch = graph.branches.get(branch_id).expect("listed id exists");
        if !branch.in_service {
            continue;
        }
        if !in_island.contains(branch.from_node_id.as_str())
            || !in_island.contains(branch.to_node_id.as_str())
        {
            continue;
        }
        let i = node_index[&branch.from_node_id];
        let j = node_index[&branch.to_node_id];

        let (y_series, y_shunt_half) = match &branch.kind {
            BranchKind::Line(line) => {
                if !line.has_zero_sequence_data() {
                    return Err(ShortCircuitError::SequenceDataMissing(vec![branch.id.clone()]));
                }
                let r0 = line.r0_ohm_per_km.unwrap() * line.length_km;
                let x0 = line.x0_ohm_per_km.unwrap() * line.length_km;
                let b0 = line.b0_us_per_km.unwrap_or(0.0) * line.length_km * 1e-6;
                let z0 = Complex64::new(r0, x0);
                if z0.norm_sqr() == 0.0 {
                    return Err(ShortCircuitError::SequenceDataMissing(vec![branch.id.clone()]));
                }
                (z0.inv(), Complex64::new(0.0, b0 / 2.0))
            }
            BranchKind::Transformer(xfmr) => {
                let z_pu = xfmr.short_circuit_impedance_pu();
                let z_ohm = z_pu * (xfmr.voltage_lv_kv * xfmr.voltage_lv_kv) / xfmr.rated_power_mva;
                (z_ohm.inv(), Complex64::new(0.0, 0.0))
            }
        };

        y_ohm[i][i] += y_series + y_shunt_half;
        y_ohm[j][j] += y_series + y_shunt_half;
        y_ohm[i][j] -= y_series;
        y_ohm[j][i] -= y_series;
    }

    if slack_u_kv > 0.0 {
        let z_base = (slack_u_kv * slack_u_kv) / base_mva;
        Ok(y_ohm
            .into_iter()
            .map(|row| row.into_iter().map(|y| y * z_base).collect())
            .collect())
    } else {
        Ok(y_ohm)
    }
}

pub fn build_sequence_network(
    graph: &NetworkGraph,
    island: &[Id],
    base_mva: f64,
    slack_u_kv: f64,
    needs_zero: bool,
) -> Result<SequenceNetwork, ShortCircuitError> {
    let y1_result =
        ybus::build_ybus(graph, island, base_mva, slack_u_kv, &[], &[]).map_err(|e| match e {
            YBusBuildError::EmptyIsland => ShortCircuitError::FaultIslandWithoutSource,
            YBusBuildError::ZeroImpedance(id) => ShortCircuitError::SequenceDataMissing(vec![id]),
        })?;

    let node_index = y1_result.node_index;
    let mut y1 = y1_result.y;
    let mut y2 = y1.clone();
    // Zero-sequence data is only required when the fault type actually
    // needs it; a 3F or 2F fault never touches Y0, so a network missing
    // zero-sequence conductor data must still be solvable for those.
    let mut y0 = if needs_zero {
        build_zero_sequence(graph, island, &node_index, base_mva, slack_u_kv)?
    } else {
        vec![vec![Complex64::new(0.0, 0.0); node_index.len()]; node_index.len()]
    };

    let has_source = stamp_sources(graph, &node_index, base_mva, &mut y1, &mut y2, &mut y0);
    let has_inverter = island.iter().any(|id| {
        graph
            .get_inverter_sources_at_node(id)
            .iter()
            .any(|s| s.in_service)
    });
    if !has_source && !has_inverter {
        return Err(ShortCircuitError::FaultIslandWithoutSource);
    }

    Ok(SequenceNetwork { node_index, y1, y2, y0 })
}

/// Solves `Y * x = e_k` by dense complex Gaussian elimination with partial
/// pivoting and returns `x[k]`, the driving-point impedance at node `k`.
/// `faer`'s dense solver (used by the power-flow solvers) is real-valued
/// only, so the complex sequence systems are solved directly here instead.
pub fn driving_point_impedance(y: &[Vec<Complex64>], fault_index: usize) -> Option<Complex64> {
    let n = y.len();
    let mut a: Vec<Vec<Complex64>> = y.to_vec();
    let mut rhs = vec![Complex64::new(0.0, 0.0); n];
    rhs[fault_index] = Complex64::new(1.0, 0.0);

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&r1, &r2| {
            a[r1][col].norm().partial_cmp(&a[r2][col].norm()).unwrap()
        })?;
        if a[pivot_row][col].norm() < 1e-14 {
            return None;
        }
        a.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = a[col][col];
        for row in (col + 1)..n {
            let factor = a[row][col] / pivot;
            if factor.norm() == 0.0 {
                continue;
            }
            for k in col..n {
                let sub = factor * a[col][k];
                a[row][k] -= sub;
            }
            let rhs_sub = factor * rhs[col];
            rhs[row] -= rhs_sub;
        }
    }

    let mut x = vec![Complex64::new(0.0, 0.0); n];
    for row in (0..n).rev() {
        let mut sum = rhs[row];
        for k in (row + 1)..n {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    Some(x[fault_index])
}
