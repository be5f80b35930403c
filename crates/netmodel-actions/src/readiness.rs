//! Readiness validator: scores a [`NetworkGraph`] against electrical-design
//! rules and reports which analyses the network currently supports.

use serde::{Deserialize, Serialize};

use netmodel_core::{BranchKind, NetworkGraph, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Blocker,
    Important,
    Info,
}

/// Closed rule set; each variant corresponds to one rule from the readiness
/// categories. Illegal combinations (a BLOCKER-only rule paired with INFO)
/// are unrepresentable because `severity` is derived from the variant, not
/// carried as a separate free field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    NoSource,
    EmptyTopology,
    DisconnectedIsland,
    NodeWithoutNominalVoltage,
    BranchZeroImpedance,
    TransformerMissingUkPercent,
    TransformerIdenticalHvLvBus,
    SourceWithoutShortCircuitParameters,
    MissingZeroSequenceData,
    NoLoadsOrGenerators,
    TransformerMissingVectorGroup,
    OpenSwitchIsolatesPart,
    BranchBypassesCatalog,
    DanglingCompositeReference,
}

impl IssueCode {
    fn severity(self) -> Severity {
        use IssueCode::*;
        match self {
            NoSource | EmptyTopology | DisconnectedIsland | NodeWithoutNominalVoltage
            | BranchZeroImpedance | TransformerMissingUkPercent | TransformerIdenticalHvLvBus
            | SourceWithoutShortCircuitParameters => Severity::Blocker,
            MissingZeroSequenceData
            | NoLoadsOrGenerators
            | TransformerMissingVectorGroup
            | DanglingCompositeReference => Severity::Important,
            OpenSwitchIsolatesPart | BranchBypassesCatalog => Severity::Info,
        }
    }

    fn sort_key(self) -> &'static str {
        use IssueCode::*;
        match self {
            NoSource => "no_source",
            EmptyTopology => "empty_topology",
            DisconnectedIsland => "disconnected_island",
            NodeWithoutNominalVoltage => "node_without_nominal_voltage",
            BranchZeroImpedance => "branch_zero_impedance",
            TransformerMissingUkPercent => "transformer_missing_uk_percent",
            TransformerIdenticalHvLvBus => "transformer_identical_hv_lv_bus",
            SourceWithoutShortCircuitParameters => "source_without_short_circuit_parameters",
            MissingZeroSequenceData => "missing_zero_sequence_data",
            NoLoadsOrGenerators => "no_loads_or_generators",
            TransformerMissingVectorGroup => "transformer_missing_vector_group",
            OpenSwitchIsolatesPart => "open_switch_isolates_part",
            BranchBypassesCatalog => "branch_bypasses_catalog",
            DanglingCompositeReference => "dangling_composite_reference",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub severity: Severity,
    pub message: String,
    pub element_refs: Vec<String>,
    pub fix_action: Option<String>,
}

impl ValidationIssue {
    fn new(code: IssueCode, message: impl Into<String>, element_refs: Vec<String>) -> Self {
        Self {
            code,
            severity: code.severity(),
            message: message.into(),
            element_refs,
            fix_action: None,
        }
    }

    fn sort_tuple(&self) -> (u8, &'static str, String) {
        let rank = match self.severity {
            Severity::Blocker => 0,
            Severity::Important => 1,
            Severity::Info => 2,
        };
        let first_ref = self.element_refs.first().cloned().unwrap_or_default();
        (rank, self.code.sort_key(), first_ref)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    pub is_valid: bool,
}

impl ValidationReport {
    fn new(mut issues: Vec<ValidationIssue>) -> Self {
        issues.sort_by(|a, b| a.sort_tuple().cmp(&b.sort_tuple()));
        issues.dedup_by(|a, b| a.code == b.code && a.element_refs == b.element_refs);
        let is_valid = !issues.iter().any(|i| i.severity == Severity::Blocker);
        Self { issues, is_valid }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisAvailability {
    pub available: bool,
    pub missing_requirements: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMatrix {
    pub short_circuit_3ph: AnalysisAvailability,
    pub short_circuit_1ph: AnalysisAvailability,
    pub short_circuit_2ph: AnalysisAvailability,
    pub short_circuit_2ph_ground: AnalysisAvailability,
    pub load_flow: AnalysisAvailability,
}

/// Produces the severity-ordered report and the analysis-availability
/// matrix for `graph`. Never mutates `graph`.
pub fn validate_network(graph: &NetworkGraph) -> (ValidationReport, AnalysisMatrix) {
    let mut issues = Vec::new();

    let slack = graph.slack_node();
    if slack.is_none() {
        issues.push(ValidationIssue::new(IssueCode::NoSource, "no SLACK source in network", vec![]));
    }
    if graph.nodes.is_empty() {
        issues.push(ValidationIssue::new(IssueCode::EmptyTopology, "network has no nodes", vec![]));
    }

    if let Some(slack) = slack {
        if let Ok(island) = graph.get_connected_nodes(&slack.id, true) {
            let island_set: std::collections::HashSet<&str> =
                island.iter().map(|s| s.as_str()).collect();
            let mut disconnected: Vec<&String> = graph
                .nodes
                .keys()
                .filter(|id| !island_set.contains(id.as_str()))
                .collect();
            disconnected.sort();
            for node_id in disconnected {
                issues.push(ValidationIssue::new(
                    IssueCode::DisconnectedIsland,
                    format!("node {node_id} is disconnected from the source island"),
                    vec![node_id.clone()],
                ));
            }
        }
        if !slack.has_short_circuit_source_data() {
            issues.push(ValidationIssue::new(
                IssueCode::SourceWithoutShortCircuitParameters,
                "source is missing sk_mva/rx_ratio short-circuit parameters",
                vec![slack.id.clone()],
            ));
        }
    }

    let mut node_ids: Vec<&String> = graph.nodes.keys().collect();
    node_ids.sort();
    for id in &node_ids {
        let node = &graph.nodes[*id];
        if node.voltage_level_kv.value() <= 0.0 {
            issues.push(ValidationIssue::new(
                IssueCode::NodeWithoutNominalVoltage,
                format!("node {id} has no nominal voltage"),
                vec![(*id).clone()],
            ));
        }
    }

    let has_load_or_generator = node_ids.iter().any(|id| {
        let node = &graph.nodes[*id];
        matches!(node.node_type, NodeType::Pq | NodeType::Pv)
    });
    if !has_load_or_generator {
        issues.push(ValidationIssue::new(
            IssueCode::NoLoadsOrGenerators,
            "network has no PQ or PV buses to drive a power flow",
            vec![],
        ));
    }

    let mut branch_ids: Vec<&String> = graph.branches.keys().collect();
    branch_ids.sort();
    let mut any_zero_sequence_gap = false;
    for id in &branch_ids {
        let branch = &graph.branches[*id];
        if branch.has_zero_impedance() {
            issues.push(ValidationIssue::new(
                IssueCode::BranchZeroImpedance,
                format!("branch {id} has zero impedance"),
                vec![(*id).clone()],
            ));
        }
        match &branch.kind {
            BranchKind::Line(line) => {
                if !line.has_zero_sequence_data() {
                    any_zero_sequence_gap = true;
                    issues.push(ValidationIssue::new(
                        IssueCode::MissingZeroSequenceData,
                        format!("branch {id} has no zero-sequence parameters"),
                        vec![(*id).clone()],
                    ));
                }
                if line.type_ref.is_none() {
                    issues.push(ValidationIssue::new(
                        IssueCode::BranchBypassesCatalog,
                        format!("branch {id} bypasses the catalog"),
                        vec![(*id).clone()],
                    ));
                }
            }
            BranchKind::Transformer(tx) => {
                if tx.uk_percent <= 0.0 {
                    issues.push(ValidationIssue::new(
                        IssueCode::TransformerMissingUkPercent,
                        format!("transformer {id} is missing uk_percent"),
                        vec![(*id).clone()],
                    ));
                }
                if (tx.voltage_hv_kv - tx.voltage_lv_kv).abs() < 1e-9 {
                    issues.push(ValidationIssue::new(
                        IssueCode::TransformerIdenticalHvLvBus,
                        format!("transformer {id} has identical HV and LV voltage"),
                        vec![(*id).clone()],
                    ));
                }
                if tx.vector_group.is_none() {
                    issues.push(ValidationIssue::new(
                        IssueCode::TransformerMissingVectorGroup,
                        format!("transformer {id} is missing a vector group"),
                        vec![(*id).clone()],
                    ));
                }
            }
        }
    }

    let active_islands = graph.find_islands(true);
    let mut switch_ids: Vec<&String> = graph.switches.keys().collect();
    switch_ids.sort();
    for id in &switch_ids {
        let switch = &graph.switches[*id];
        if switch.is_active() {
            continue;
        }
        let from_island = active_islands.iter().position(|isl| isl.contains(&switch.from_node_id));
        let to_island = active_islands.iter().position(|isl| isl.contains(&switch.to_node_id));
        if from_island.is_some() && from_island != to_island {
            issues.push(ValidationIssue::new(
                IssueCode::OpenSwitchIsolatesPart,
                format!("switch {id} isolates part of the network"),
                vec![(*id).clone()],
            ));
        }
    }

    let mut substation_ids: Vec<&String> = graph.substations.keys().collect();
    substation_ids.sort();
    for id in &substation_ids {
        let substation = &graph.substations[*id];
        for bus_ref in &substation.bus_refs {
            if !graph.nodes.contains_key(bus_ref) {
                issues.push(ValidationIssue::new(
                    IssueCode::DanglingCompositeReference,
                    format!("substation {id} references unknown bus {bus_ref}"),
                    vec![(*id).clone(), bus_ref.clone()],
                ));
            }
        }
    }

    let mut corridor_ids: Vec<&String> = graph.corridors.keys().collect();
    corridor_ids.sort();
    for id in &corridor_ids {
        let corridor = &graph.corridors[*id];
        for segment_ref in &corridor.segment_refs {
            if !graph.branches.contains_key(segment_ref) {
                issues.push(ValidationIssue::new(
                    IssueCode::DanglingCompositeReference,
                    format!("corridor {id} references unknown segment {segment_ref}"),
                    vec![(*id).clone(), segment_ref.clone()],
                ));
            }
        }
    }

    let report = ValidationReport::new(issues);

    let no_blockers = report.is_valid;
    let base_missing = |label: &str| -> Vec<String> {
        if no_blockers {
            vec![]
        } else {
            vec![format!("{label}: resolve all BLOCKER issues first")]
        }
    };

    let short_circuit_3ph = AnalysisAvailability {
        available: no_blockers,
        missing_requirements: base_missing("short_circuit_3ph"),
    };

    let zero_sequence_ok = no_blockers && !any_zero_sequence_gap;
    let mut sc_1ph_missing = base_missing("short_circuit_1ph");
    if no_blockers && any_zero_sequence_gap {
        sc_1ph_missing.push("zero-sequence data missing on one or more branches".into());
    }
    let short_circuit_1ph = AnalysisAvailability {
        available: zero_sequence_ok,
        missing_requirements: sc_1ph_missing.clone(),
    };
    let short_circuit_2ph_ground = AnalysisAvailability {
        available: zero_sequence_ok,
        missing_requirements: sc_1ph_missing,
    };
    let short_circuit_2ph = AnalysisAvailability {
        available: no_blockers,
        missing_requirements: base_missing("short_circuit_2ph"),
    };

    let mut lf_missing = base_missing("load_flow");
    if no_blockers && !has_load_or_generator {
        lf_missing.push("no load or generator bus present".into());
    }
    let load_flow = AnalysisAvailability {
        available: no_blockers && has_load_or_generator,
        missing_requirements: lf_missing,
    };

    (
        report,
        AnalysisMatrix {
            short_circuit_3ph,
            short_circuit_1ph,
            short_circuit_2ph,
            short_circuit_2ph_ground,
            load_flow,
        },
    )
}
