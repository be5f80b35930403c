//! Per-unit nodal admittance matrix (Y-bus) assembly.
//!
//! Builds the dense complex Y-bus for a slack island: series and per-end
//! shunt admittance from line/cable and transformer branches, off-nominal
//! tap stamping, and conversion to per-unit with an ohms fallback when the
//! slack voltage is unknown. Both power-flow solvers build their Y-bus
//! through this module so the admittance model never diverges between them.

use std::collections::BTreeMap;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use netmodel_core::{BranchKind, Id, NetworkGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TapSource {
    Core,
    Overlay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuntSpec {
    pub node_id: Id,
    pub g_pu: f64,
    pub b_pu: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapOverride {
    pub branch_id: Id,
    pub tap_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct AppliedTap {
    pub branch_id: Id,
    pub tap_ratio: f64,
    pub source: TapSource,
}

#[derive(Debug, Clone)]
pub struct AppliedShunt {
    pub node_id: Id,
    pub g_pu: f64,
    pub b_pu: f64,
}

#[derive(Debug, Clone)]
pub struct YBusTrace {
    pub source: String,
    pub n: usize,
    pub node_index_map: BTreeMap<Id, usize>,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct YBusResult {
    pub y: Vec<Vec<Complex64>>,
    pub node_index: BTreeMap<Id, usize>,
    pub trace: YBusTrace,
    pub applied_taps: Vec<AppliedTap>,
    pub applied_shunts: Vec<AppliedShunt>,
}

#[derive(Debug, thiserror::Error)]
pub enum YBusBuildError {
    #[error("slack island is empty")]
    EmptyIsland,
    #[error("branch {0} has zero total impedance")]
    ZeroImpedance(Id),
}

/// Assembles the per-unit Y-bus for `slack_island`, the set of node ids
/// reachable from the slack in the active graph projection.
pub fn build_ybus(
    graph: &NetworkGraph,
    slack_island: &[Id],
    base_mva: f64,
    slack_u_kv: f64,
    shunts: &[ShuntSpec],
    taps: &[TapOverride],
) -> Result<YBusResult, YBusBuildError> {
    if slack_island.is_empty() {
        return Err(YBusBuildError::EmptyIsland);
    }

    // Step 1: lexical island ids fix the matrix index mapping.
    let mut island: Vec<&Id> = slack_island.iter().collect();
    island.sort();
    let n = island.len();
    let node_index: BTreeMap<Id, usize> = island
        .iter()
        .enumerate()
        .map(|(i, id)| ((*id).clone(), i))
        .collect();
    let in_island: std::collections::HashSet<&str> =
        slack_island.iter().map(|s| s.as_str()).collect();

    let tap_overlay: BTreeMap<&Id, f64> = taps.iter().map(|t| (&t.branch_id, t.tap_ratio)).collect();

    let mut y_ohm = vec![vec![Complex64::new(0.0, 0.0); n]; n];
    let mut applied_taps = Vec::new();

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

        // Step 2: series and per-end shunt admittance in ohms.
        let (y_series, y_shunt_half, tap) = match &branch.kind {
            BranchKind::Line(line) => {
                let (r_total, x_total, b_total_us) = if let Some(ov) = &line.impedance_override {
                    (ov.r_total_ohm, ov.x_total_ohm, ov.b_total_us)
                } else {
                    (
                        line.r_ohm_per_km * line.length_km,
                        line.x_ohm_per_km * line.length_km,
                        line.b_us_per_km * line.length_km,
                    )
                };
                let z = Complex64::new(r_total, x_total);
                if z.norm_sqr() == 0.0 {
                    return Err(YBusBuildError::ZeroImpedance(branch.id.clone()));
                }
                let b_total = b_total_us * 1e-6;
                (z.inv(), Complex64::new(0.0, b_total / 2.0), 1.0_f64)
            }
            BranchKind::Transformer(xfmr) => {
                let z_pu = xfmr.short_circuit_impedance_pu();
                let z_ohm_lv = z_pu * (xfmr.voltage_lv_kv * xfmr.voltage_lv_kv) / xfmr.rated_power_mva;
                if z_ohm_lv.norm_sqr() == 0.0 {
                    return Err(YBusBuildError::ZeroImpedance(branch.id.clone()));
                }
                let t = if xfmr.tap_position != 0 {
                    applied_taps.push(AppliedTap {
                        branch_id: branch.id.clone(),
                        tap_ratio: xfmr.tap_ratio(),
                        source: TapSource::Core,
                    });
                    xfmr.tap_ratio()
                } else if let Some(&overlay_ratio) = tap_overlay.get(&branch.id) {
                    applied_taps.push(AppliedTap {
                        branch_id: branch.id.clone(),
                        tap_ratio: overlay_ratio,
                        source: TapSource::Overlay,
                    });
                    overlay_ratio
                } else {
                    1.0
                };
                (z_ohm_lv.inv(), Complex64::new(0.0, 0.0), t)
            }
        };

        // Step 3: off-nominal tap ratio stamping (no-op for t == 1.0 lines).
        let t2 = tap * tap;
        y_ohm[i][i] += y_series / t2 + y_shunt_half;
        y_ohm[j][j] += y_series + y_shunt_half;
        y_ohm[i][j] -= y_series / tap;
        y_ohm[j][i] -= y_series / tap;
    }

    // Step 4: per-unit conversion, or ohms fallback when slack voltage is unknown.
    let (y, source, note) = if slack_u_kv > 0.0 {
        let z_base = (slack_u_kv * slack_u_kv) / base_mva;
        let y_pu: Vec<Vec<Complex64>> = y_ohm
            .iter()
            .map(|row| row.iter().map(|y| y * z_base).collect())
            .collect();
        (y_pu, "per_unit".to_string(), None)
    } else {
        (
            y_ohm,
            "ohms".to_string(),
            Some("slack voltage unknown; matrix kept in ohms".to_string()),
        )
    };
    let mut y = y;

    // Step 5: shunt overlays on the diagonal.
    let mut applied_shunts = Vec::with_capacity(shunts.len());
    for shunt in shunts {
        if let Some(&idx) = node_index.get(&shunt.node_id) {
            y[idx][idx] += Complex64::new(shunt.g_pu, shunt.b_pu);
            applied_shunts.push(AppliedShunt {
                node_id: shunt.node_id.clone(),
                g_pu: shunt.g_pu,
                b_pu: shunt.b_pu,
            });
        }
    }

    Ok(YBusResult {
        y,
        node_index: node_index.clone(),
        trace: YBusTrace {
            source,
            n,
            node_index_map: node_index,
            note,
        },
        applied_taps,
        applied_shunts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use netmodel_core::units::{Kilovolts, PerUnit, Radians};
    use netmodel_core::{
        Branch, BranchKind, LineBranch, LineKind, Node, NodeType, ParallelEdgePolicy,
    };

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
            sk_mva: None,
            rx_ratio: None,
            in_service: true,
        }
    }

    fn pq(id: &str) -> Node {
        Node {
            node_type: NodeType::Pq,
            voltage_magnitude_pu: None,
            voltage_angle_rad: None,
            active_power_mw: Some(netmodel_core::units::Megawatts(1.0)),
            reactive_power_mvar: Some(netmodel_core::units::Megavars(0.2)),
            ..slack(id)
        }
    }

    fn two_node_graph() -> NetworkGraph {
        let mut g = NetworkGraph::new(ParallelEdgePolicy::Strict);
        g.add_node(slack("N1")).unwrap();
        g.add_node(pq("N2")).unwrap();
        g.add_branch(
            Branch {
                id: "L1".into(),
                name: "L1".into(),
                from_node_id: "N1".into(),
                to_node_id: "N2".into(),
                in_service: true,
                kind: BranchKind::Line(LineBranch {
                    kind: LineKind::Line,
                    r_ohm_per_km: 0.2,
                    x_ohm_per_km: 0.1,
                    b_us_per_km: 2.0,
                    length_km: 3.0,
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

    #[test]
    fn empty_island_rejected() {
        let g = two_node_graph();
        let err = build_ybus(&g, &[], 100.0, 20.0, &[], &[]);
        assert!(matches!(err, Err(YBusBuildError::EmptyIsland)));
    }

    #[test]
    fn two_node_ybus_is_symmetric_and_row_sums_are_shunt_only() {
        let g = two_node_graph();
        let island = vec!["N1".to_string(), "N2".to_string()];
        let result = build_ybus(&g, &island, 100.0, 20.0, &[], &[]).unwrap();
        assert_eq!(result.trace.n, 2);
        assert_eq!(result.trace.source, "per_unit");
        let y = result.y;
        assert!((y[0][1] - y[1][0]).norm() < 1e-9);
        assert!(y[0][0].re > 0.0);
    }

    #[test]
    fn unknown_slack_voltage_falls_back_to_ohms() {
        let g = two_node_graph();
        let island = vec!["N1".to_string(), "N2".to_string()];
        let result = build_ybus(&g, &island, 100.0, 0.0, &[], &[]).unwrap();
        assert_eq!(result.trace.source, "ohms");
        assert!(result.trace.note.is_some());
    }

    #[test]
    fn shunt_overlay_applied_on_diagonal() {
        let g = two_node_graph();
        let island = vec!["N1".to_string(), "N2".to_string()];
        let shunts = vec![ShuntSpec {
            node_id: "N1".into(),
            g_pu: 0.01,
            b_pu: 0.02,
        }];
        let result = build_ybus(&g, &island, 100.0, 20.0, &shunts, &[]).unwrap();
        assert_eq!(result.applied_shunts.len(), 1);
        assert!(result.y[0][0].im > 0.0);
    }
}
