//! IEC 60909 fault-current formulas and the orchestration that ties fault
//! location, sequence networks, and inverter-source contributions together.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use netmodel_core::{Id, NetworkGraph};

use crate::sequence::{self, SequenceNetwork};
use crate::ShortCircuitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultType {
    #[serde(rename = "3F")]
    ThreePhase,
    #[serde(rename = "1F-G")]
    SinglePhaseGround,
    #[serde(rename = "2F")]
    TwoPhase,
    #[serde(rename = "2F-G")]
    TwoPhaseGround,
}

impl FaultType {
    fn needs_zero_sequence(self) -> bool {
        matches!(self, FaultType::SinglePhaseGround | FaultType::TwoPhaseGround)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultLocation {
    Node { node_id: Id },
    Branch { branch_id: Id, position_percent: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortCircuitOptions {
    pub base_mva: f64,
    /// Voltage factor `c`; `None` selects `c_max` for the fault bus's
    /// nominal voltage tier, the conservative choice for maximum current.
    pub c: Option<f64>,
    pub tk_s: f64,
    pub tb_s: f64,
    pub include_branch_contributions: bool,
}

impl Default for ShortCircuitOptions {
    fn default() -> Self {
        Self {
            base_mva: 100.0,
            c: None,
            tk_s: 1.0,
            tb_s: 0.1,
            include_branch_contributions: false,
        }
    }
}

/// `c_max` per voltage tier: `U_n <= 1kV -> 1.05`, `1kV < U_n <= 35kV ->
/// 1.10`, `U_n > 35kV -> 1.10`.
pub fn voltage_factor_c_max(un_kv: f64) -> f64 {
    if un_kv <= 1.0 {
        1.05
    } else if un_kv <= 35.0 {
        1.10
    } else {
        1.10
    }
}

/// `c_min` per voltage tier: `U_n <= 1kV -> 0.95`, `1kV < U_n <= 35kV ->
/// 1.00`, `U_n > 35kV -> 1.00`.
pub fn voltage_factor_c_min(un_kv: f64) -> f64 {
    if un_kv <= 1.0 {
        0.95
    } else if un_kv <= 35.0 {
        1.00
    } else {
        1.00
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterContribution {
    pub source_id: Id,
    pub current_ka: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultResult {
    pub fault_type: FaultType,
    pub c_used: f64,
    pub un_kv: f64,
    pub ikss_ka: f64,
    pub ib_ka: f64,
    pub ik_ka: f64,
    pub ip_ka: f64,
    pub kappa: f64,
    pub inverter_contributions: Vec<InverterContribution>,
}

fn island_and_base_kv(graph: &NetworkGraph, seed_node: &str) -> Result<(Vec<Id>, f64), ShortCircuitError> {
    let island = graph
        .get_connected_nodes(seed_node, true)
        .map_err(|_| ShortCircuitError::UnknownNode(seed_node.to_string()))?;
    let base_kv = graph
        .slack_node()
        .map(|n| n.voltage_level_kv.0)
        .or_else(|| graph.nodes.get(seed_node).map(|n| n.voltage_level_kv.0))
        .unwrap_or(0.0);
    Ok((island, base_kv))
}

struct FaultPoint {
    fault_index: usize,
    un_kv: f64,
    y1: Vec<Vec<Complex64>>,
    y2: Vec<Vec<Complex64>>,
    y0: Vec<Vec<Complex64>>,
}

/// Resolves a fault location to a concrete node. A branch-fault location
/// snaps to one of the branch's own two endpoints rather than interpolating
/// a point along it: `position_percent <= 50` resolves to `from_node_id`,
/// otherwise to `to_node_id`. From there it's treated identically to a
/// direct node fault.
fn resolve_fault_point(
    graph: &NetworkGraph,
    location: &FaultLocation,
    net: &SequenceNetwork,
    island_base_kv: f64,
) -> Result<FaultPoint, ShortCircuitError> {
    let node_id = match location {
        FaultLocation::Node { node_id } => node_id.clone(),
        FaultLocation::Branch { branch_id, position_percent } => {
            let branch = graph
                .branches
                .get(branch_id)
                .ok_or_else(|| ShortCircuitError::UnknownBranch(branch_id.clone()))?;
            if *position_percent <= 50.0 {
                branch.from_node_id.clone()
            } else {
                branch.to_node_id.clone()
            }
        }
    };

    let idx = *net
        .node_index
        .get(&node_id)
        .ok_or_else(|| ShortCircuitError::UnknownNode(node_id.clone()))?;
    let un_kv = graph
        .nodes
        .get(&node_id)
        .map(|n| n.voltage_level_kv.0)
        .unwrap_or(island_base_kv);
    Ok(FaultPoint {
        fault_index: idx,
        un_kv,
        y1: net.y1.clone(),
        y2: net.y2.clone(),
        y0: net.y0.clone(),
    })
}

fn kappa_from_z1(z1: Complex64) -> f64 {
    let rx = if z1.im.abs() > 1e-12 { z1.re / z1.im } else { 0.0 };
    1.02 + 0.98 * (-3.0 * rx).exp()
}

fn inverter_contributions(
    graph: &NetworkGraph,
    island: &[Id],
    fault_type: FaultType,
) -> Vec<InverterContribution> {
    let mut out = Vec::new();
    for id in island {
        for source in graph.get_inverter_sources_at_node(id) {
            if !source.in_service {
                continue;
            }
            let participates = match fault_type {
                FaultType::ThreePhase => true,
                FaultType::SinglePhaseGround => {
                    source.contributes_negative_sequence && source.contributes_zero_sequence
                }
                FaultType::TwoPhase => source.contributes_negative_sequence,
                FaultType::TwoPhaseGround => {
                    source.contributes_negative_sequence && source.contributes_zero_sequence
                }
            };
            if !participates {
                continue;
            }
            out.push(InverterContribution {
                source_id: source.id.clone(),
                current_ka: source.short_circuit_current_a() / 1000.0,
            });
        }
    }
    out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    out
}

/// Runs the five-step IEC 60909 algorithm: sequence assembly, driving-point
/// impedance extraction, the fault-type current formula, the peak factor,
/// and inverter-source current injection.
pub fn calculate(
    graph: &NetworkGraph,
    fault_type: FaultType,
    location: &FaultLocation,
    options: &ShortCircuitOptions,
) -> Result<FaultResult, ShortCircuitError> {
    let seed = match location {
        FaultLocation::Node { node_id } => node_id.clone(),
        FaultLocation::Branch { branch_id, .. } => {
            let branch = graph
                .branches
                .get(branch_id)
                .ok_or_else(|| ShortCircuitError::UnknownBranch(branch_id.clone()))?;
            branch.from_node_id.clone()
        }
    };
    let (island, island_base_kv) = island_and_base_kv(graph, &seed)?;

    let net = sequence::build_sequence_network(
        graph,
        &island,
        options.base_mva,
        island_base_kv,
        fault_type.needs_zero_sequence(),
    )?;
    let point = resolve_fault_point(graph, location, &net, island_base_kv)?;

    let z1 = sequence::driving_point_impedance(&point.y1, point.fault_index)
        .ok_or(ShortCircuitError::SingularNetwork)?;
    let z2 = sequence::driving_point_impedance(&point.y2, point.fault_index)
        .ok_or(ShortCircuitError::SingularNetwork)?;
    let z0 = if fault_type.needs_zero_sequence() {
        Some(
            sequence::driving_point_impedance(&point.y0, point.fault_index)
                .ok_or(ShortCircuitError::SingularNetwork)?,
        )
    } else {
        None
    };

    let c = options
        .c
        .unwrap_or_else(|| voltage_factor_c_max(point.un_kv));

    let ikss_pu = match fault_type {
        FaultType::ThreePhase => c / (3f64.sqrt() * z1.norm()),
        FaultType::SinglePhaseGround => {
            let z0 = z0.expect("zero sequence required");
            3f64.sqrt() * c / (z1 + z2 + z0).norm()
        }
        FaultType::TwoPhase => c / (z1 + z2).norm(),
        FaultType::TwoPhaseGround => {
            let z0 = z0.expect("zero sequence required");
            3f64.sqrt() * c * z2.norm() / (z1 * z2 + z2 * z0 + z0 * z1).norm()
        }
    };

    let i_base_ka = options.base_mva / (3f64.sqrt() * point.un_kv.max(1e-9));
    let ikss_ka = ikss_pu * i_base_ka;
    let kappa = kappa_from_z1(z1);
    let ip_ka = kappa * 2f64.sqrt() * ikss_ka;

    // Inverter current injections always feed the total per the algorithm's
    // step 5; `include_branch_contributions` only controls whether the
    // per-source breakdown is attached to the report.
    let all_contributions = inverter_contributions(graph, &island, fault_type);
    let inverter_total_ka: f64 = all_contributions.iter().map(|c| c.current_ka).sum();
    let inverter_contributions = if options.include_branch_contributions {
        all_contributions
    } else {
        Vec::new()
    };

    let total_ikss_ka = ikss_ka + inverter_total_ka;

    Ok(FaultResult {
        fault_type,
        c_used: c,
        un_kv: point.un_kv,
        ikss_ka: total_ikss_ka,
        ib_ka: total_ikss_ka,
        ik_ka: total_ikss_ka,
        ip_ka,
        kappa,
        inverter_contributions,
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
            sk_mva: Some(250.0),
            rx_ratio: Some(0.1),
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
            sk_mva: None,
            rx_ratio: None,
            ..slack(id)
        }
    }

    fn line_branch(id: &str, from: &str, to: &str, with_zero_sequence: bool) -> Branch {
        Branch {
            id: id.into(),
            name: id.into(),
            from_node_id: from.into(),
            to_node_id: to.into(),
            in_service: true,
            kind: BranchKind::Line(LineBranch {
                kind: LineKind::Cable,
                r_ohm_per_km: 0.2,
                x_ohm_per_km: 0.1,
                b_us_per_km: 2.0,
                length_km: 2.0,
                rated_current_a: 300.0,
                type_ref: None,
                impedance_override: None,
                r0_ohm_per_km: if with_zero_sequence { Some(0.6) } else { None },
                x0_ohm_per_km: if with_zero_sequence { Some(0.3) } else { None },
                b0_us_per_km: if with_zero_sequence { Some(1.0) } else { None },
            }),
        }
    }

    fn two_bus_graph(with_zero_sequence: bool) -> NetworkGraph {
        let mut g = NetworkGraph::new(ParallelEdgePolicy::Strict);
        g.add_node(slack("N1")).unwrap();
        g.add_node(pq("N2")).unwrap();
        g.add_branch(line_branch("L1", "N1", "N2", with_zero_sequence), false)
            .unwrap();
        g
    }

    #[test]
    fn three_phase_fault_at_source_bus_yields_positive_current() {
        let g = two_bus_graph(true);
        let result = calculate(
            &g,
            FaultType::ThreePhase,
            &FaultLocation::Node { node_id: "N1".into() },
            &ShortCircuitOptions::default(),
        )
        .unwrap();
        assert!(result.ikss_ka > 0.0);
        assert!(result.ip_ka > result.ikss_ka);
        assert_eq!(result.ib_ka, result.ikss_ka);
        assert_eq!(result.ik_ka, result.ikss_ka);
    }

    #[test]
    fn single_phase_ground_fault_without_zero_sequence_data_is_rejected() {
        let g = two_bus_graph(false);
        let err = calculate(
            &g,
            FaultType::SinglePhaseGround,
            &FaultLocation::Node { node_id: "N2".into() },
            &ShortCircuitOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ShortCircuitError::SequenceDataMissing(ref ids) if ids == &["L1"]));
    }

    #[test]
    fn single_phase_ground_fault_with_zero_sequence_data_succeeds() {
        let g = two_bus_graph(true);
        let result = calculate(
            &g,
            FaultType::SinglePhaseGround,
            &FaultLocation::Node { node_id: "N2".into() },
            &ShortCircuitOptions::default(),
        )
        .unwrap();
        assert!(result.ikss_ka > 0.0);
    }

    #[test]
    fn fault_on_island_without_source_is_rejected() {
        let mut g = NetworkGraph::new(ParallelEdgePolicy::Strict);
        g.add_node(pq("N1")).unwrap();
        let err = calculate(
            &g,
            FaultType::ThreePhase,
            &FaultLocation::Node { node_id: "N1".into() },
            &ShortCircuitOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ShortCircuitError::FaultIslandWithoutSource));
    }

    #[test]
    fn branch_fault_at_or_below_50_percent_snaps_to_from_node() {
        let g = two_bus_graph(true);
        let at_from = calculate(
            &g,
            FaultType::ThreePhase,
            &FaultLocation::Node { node_id: "N1".into() },
            &ShortCircuitOptions::default(),
        )
        .unwrap();
        let at_branch = calculate(
            &g,
            FaultType::ThreePhase,
            &FaultLocation::Branch { branch_id: "L1".into(), position_percent: 50.0 },
            &ShortCircuitOptions::default(),
        )
        .unwrap();
        assert_eq!(at_branch.ikss_ka, at_from.ikss_ka);
    }

    #[test]
    fn branch_fault_above_50_percent_snaps_to_to_node() {
        let g = two_bus_graph(true);
        let at_to = calculate(
            &g,
            FaultType::ThreePhase,
            &FaultLocation::Node { node_id: "N2".into() },
            &ShortCircuitOptions::default(),
        )
        .unwrap();
        let at_branch = calculate(
            &g,
            FaultType::ThreePhase,
            &FaultLocation::Branch { branch_id: "L1".into(), position_percent: 60.0 },
            &ShortCircuitOptions::default(),
        )
        .unwrap();
        assert_eq!(at_branch.ikss_ka, at_to.ikss_ka);
    }

    #[test]
    fn voltage_factor_table_matches_iec_tiers() {
        assert_eq!(voltage_factor_c_max(0.4), 1.05);
        assert_eq!(voltage_factor_c_min(0.4), 0.95);
        assert_eq!(voltage_factor_c_max(20.0), 1.10);
        assert_eq!(voltage_factor_c_min(20.0), 1.00);
        assert_eq!(voltage_factor_c_max(110.0), 1.10);
        assert_eq!(voltage_factor_c_min(110.0), 1.00);
    }
}
