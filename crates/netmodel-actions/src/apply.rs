//! Deterministic, copy-on-write application of an accepted [`ActionEnvelope`]
//! to a [`Snapshot`].

use serde_json::{Map, Value};

use netmodel_core::units::{Kilovolts, Megavars, Megawatts, PerUnit, Radians};
use netmodel_core::{
    Branch, BranchKind, LineBranch, LineKind, NetModelError, NetModelResult, Node, NodeType,
    Snapshot, TransformerBranch,
};

use crate::envelope::{ActionEnvelope, ActionStatus, BatchActionResult};
use crate::envelope::validate_action;

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("action {0} must be accepted before applying")]
    NotAccepted(String),
    #[error("unsupported action_type: {0}")]
    UnsupportedActionType(String),
    #[error(transparent)]
    Mutation(#[from] NetModelError),
}

fn get_str<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn get_f64(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

fn get_bool(payload: &Map<String, Value>, key: &str) -> Option<bool> {
    payload.get(key).and_then(Value::as_bool)
}

fn node_type_from_str(s: &str) -> Option<NodeType> {
    match s {
        "SLACK" => Some(NodeType::Slack),
        "PQ" => Some(NodeType::Pq),
        "PV" => Some(NodeType::Pv),
        _ => None,
    }
}

fn node_from_payload(action_id: &str, payload: &Map<String, Value>) -> NetModelResult<Node> {
    let node_type = get_str(payload, "node_type")
        .and_then(node_type_from_str)
        .ok_or_else(|| NetModelError::Invariant("node_type must be SLACK, PQ, or PV".into()))?;
    let id = get_str(payload, "node_id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("node-{action_id}"));
    let name = get_str(payload, "name").unwrap_or(&id).to_string();
    Ok(Node {
        id,
        name,
        node_type,
        voltage_level_kv: Kilovolts(get_f64(payload, "voltage_level_kv").unwrap_or(0.0)),
        voltage_magnitude_pu: get_f64(payload, "voltage_magnitude").map(PerUnit),
        voltage_angle_rad: get_f64(payload, "voltage_angle").map(Radians),
        active_power_mw: get_f64(payload, "active_power").map(Megawatts),
        reactive_power_mvar: get_f64(payload, "reactive_power").map(Megavars),
        sk_mva: get_f64(payload, "sk_mva"),
        rx_ratio: get_f64(payload, "rx_ratio"),
        in_service: get_bool(payload, "in_service").unwrap_or(true),
    })
}

fn line_branch_from_payload(payload: &Map<String, Value>, kind: LineKind) -> LineBranch {
    LineBranch {
        kind,
        r_ohm_per_km: get_f64(payload, "r_ohm_per_km").unwrap_or(0.0),
        x_ohm_per_km: get_f64(payload, "x_ohm_per_km").unwrap_or(0.0),
        b_us_per_km: get_f64(payload, "b_us_per_km").unwrap_or(0.0),
        length_km: get_f64(payload, "length_km").unwrap_or(0.0),
        rated_current_a: get_f64(payload, "rated_current_a").unwrap_or(0.0),
        type_ref: None,
        impedance_override: None,
        r0_ohm_per_km: get_f64(payload, "r0_ohm_per_km"),
        x0_ohm_per_km: get_f64(payload, "x0_ohm_per_km"),
        b0_us_per_km: get_f64(payload, "b0_us_per_km"),
    }
}

fn transformer_branch_from_payload(payload: &Map<String, Value>) -> TransformerBranch {
    TransformerBranch {
        rated_power_mva: get_f64(payload, "rated_power_mva").unwrap_or(0.0),
        voltage_hv_kv: get_f64(payload, "voltage_hv_kv").unwrap_or(0.0),
        voltage_lv_kv: get_f64(payload, "voltage_lv_kv").unwrap_or(0.0),
        uk_percent: get_f64(payload, "uk_percent").unwrap_or(0.0),
        pk_kw: get_f64(payload, "pk_kw").unwrap_or(0.0),
        i0_percent: get_f64(payload, "i0_percent").unwrap_or(0.0),
        p0_kw: get_f64(payload, "p0_kw").unwrap_or(0.0),
        vector_group: get_str(payload, "vector_group").map(str::to_string),
        tap_position: payload
            .get("tap_position")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32,
        tap_step_percent: get_f64(payload, "tap_step_percent").unwrap_or(0.0),
    }
}

fn branch_from_payload(action_id: &str, payload: &Map<String, Value>) -> NetModelResult<Branch> {
    let from_node_id = get_str(payload, "from_node_id")
        .ok_or_else(|| NetModelError::Invariant("missing from_node_id".into()))?
        .to_string();
    let to_node_id = get_str(payload, "to_node_id")
        .ok_or_else(|| NetModelError::Invariant("missing to_node_id".into()))?
        .to_string();
    let branch_kind = get_str(payload, "branch_kind").unwrap_or("line");
    let kind = match branch_kind {
        "line" => BranchKind::Line(line_branch_from_payload(payload, LineKind::Line)),
        "cable" => BranchKind::Line(line_branch_from_payload(payload, LineKind::Cable)),
        "transformer" => BranchKind::Transformer(transformer_branch_from_payload(payload)),
        other => {
            return Err(NetModelError::Invariant(format!(
                "branch_kind must be line, cable, or transformer, got {other}"
            )))
        }
    };
    let id = get_str(payload, "branch_id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("branch-{action_id}"));
    let name = get_str(payload, "name").unwrap_or(&id).to_string();
    Ok(Branch {
        id,
        name,
        from_node_id,
        to_node_id,
        in_service: get_bool(payload, "in_service").unwrap_or(true),
        kind,
    })
}

/// Mutates `graph` in place per `action_type`/`payload`. Used both as a trial
/// run against a clone (stage 4 of [`validate_action`]) and for real
/// application once an envelope is accepted, so the two can never disagree.
pub(crate) fn mutate_graph(
    graph: &mut netmodel_core::NetworkGraph,
    action_type: &str,
    action_id: &str,
    payload: &Map<String, Value>,
) -> NetModelResult<()> {
    match action_type {
        "create_node" => {
            let node = node_from_payload(action_id, payload)?;
            graph.add_node(node)
        }
        "create_branch" => {
            let branch = branch_from_payload(action_id, payload)?;
            graph.add_branch(branch, false)
        }
        "set_in_service" => {
            let entity_id = get_str(payload, "entity_id")
                .ok_or_else(|| NetModelError::Invariant("missing entity_id".into()))?;
            let in_service = get_bool(payload, "in_service").unwrap_or(false);
            if let Some(branch) = graph.branches.get_mut(entity_id) {
                branch.in_service = in_service;
                return Ok(());
            }
            if let Some(source) = graph.inverter_sources.get_mut(entity_id) {
                source.in_service = in_service;
                return Ok(());
            }
            Err(NetModelError::Reference(format!(
                "entity {entity_id} not found in snapshot graph"
            )))
        }
        "set_pcc" => {
            let node_id = get_str(payload, "node_id")
                .ok_or_else(|| NetModelError::Invariant("missing node_id".into()))?;
            graph.pcc_node_id = Some(node_id.to_string());
            Ok(())
        }
        other => Err(NetModelError::Invariant(format!(
            "unsupported action_type: {other}"
        ))),
    }
}

/// Applies an accepted envelope, producing the child snapshot. Never mutates
/// `parent`.
pub fn apply_action(parent: &Snapshot, envelope: &ActionEnvelope) -> Result<Snapshot, ApplyError> {
    if envelope.status != Some(ActionStatus::Accepted) {
        return Err(ApplyError::NotAccepted(envelope.action_id.clone()));
    }
    let mut graph = parent.graph.clone();
    mutate_graph(&mut graph, &envelope.action_type, &envelope.action_id, &envelope.payload)?;
    Ok(parent.derive_child(graph, envelope.action_id.clone(), envelope.created_at))
}

/// Validates then applies a batch in declared order. Any rejection aborts
/// the whole batch and returns the parent snapshot unchanged.
pub fn apply_batch(
    parent: &Snapshot,
    envelopes: &[ActionEnvelope],
) -> (BatchActionResult, Option<Snapshot>) {
    let mut results = Vec::with_capacity(envelopes.len());
    let mut current = parent.clone();
    for raw in envelopes {
        let validated = validate_action(raw, &current);
        let accepted = validated.status == ActionStatus::Accepted;
        results.push(validated);
        if !accepted {
            return (
                BatchActionResult {
                    status: ActionStatus::Rejected,
                    parent_snapshot_id: parent.meta.snapshot_id.clone(),
                    action_results: results,
                    new_snapshot_id: None,
                    errors: Vec::new(),
                },
                None,
            );
        }
        let mut envelope = raw.clone();
        envelope.status = Some(ActionStatus::Accepted);
        match apply_action(&current, &envelope) {
            Ok(next) => current = next,
            Err(e) => {
                return (
                    BatchActionResult {
                        status: ActionStatus::Rejected,
                        parent_snapshot_id: parent.meta.snapshot_id.clone(),
                        action_results: results,
                        new_snapshot_id: None,
                        errors: vec![crate::envelope::ActionIssue {
                            code: crate::envelope::ActionIssueCode::GraphInvariant,
                            message: e.to_string(),
                            path: "payload".into(),
                        }],
                    },
                    None,
                )
            }
        }
    }
    (
        BatchActionResult {
            status: ActionStatus::Accepted,
            parent_snapshot_id: parent.meta.snapshot_id.clone(),
            action_results: results,
            new_snapshot_id: Some(current.meta.snapshot_id.clone()),
            errors: Vec::new(),
        },
        Some(current),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use netmodel_core::units::{Kilovolts as Kv, PerUnit as Pu, Radians as Rad};
    use netmodel_core::{NetworkGraph, ParallelEdgePolicy};
    use serde_json::json;

    fn slack_snapshot() -> Snapshot {
        let mut graph = NetworkGraph::new(ParallelEdgePolicy::Strict);
        graph
            .add_node(Node {
                id: "A".into(),
                name: "A".into(),
                node_type: NodeType::Slack,
                voltage_level_kv: Kv(20.0),
                voltage_magnitude_pu: Some(Pu(1.0)),
                voltage_angle_rad: Some(Rad(0.0)),
                active_power_mw: None,
                reactive_power_mvar: None,
                sk_mva: Some(250.0),
                rx_ratio: Some(0.1),
                in_service: true,
            })
            .unwrap();
        Snapshot::new(graph, "s1", None, "1.0", "model-1", chrono::Utc::now())
    }

    fn accepted_envelope(action_type: &str, payload: Map<String, Value>) -> ActionEnvelope {
        ActionEnvelope {
            action_id: "act-1".into(),
            parent_snapshot_id: "s1".into(),
            action_type: action_type.into(),
            payload,
            created_at: chrono::Utc::now(),
            status: Some(ActionStatus::Accepted),
            actor: None,
            schema_version: None,
        }
    }

    #[test]
    fn not_accepted_rejected_before_mutation() {
        let snap = slack_snapshot();
        let mut env = accepted_envelope("set_pcc", json!({"node_id": "A"}).as_object().unwrap().clone());
        env.status = Some(ActionStatus::Pending);
        assert!(matches!(apply_action(&snap, &env), Err(ApplyError::NotAccepted(_))));
    }

    #[test]
    fn set_pcc_applies_and_preserves_lineage() {
        let snap = slack_snapshot();
        let env = accepted_envelope("set_pcc", json!({"node_id": "A"}).as_object().unwrap().clone());
        let child = apply_action(&snap, &env).unwrap();
        assert_eq!(child.graph.pcc_node_id.as_deref(), Some("A"));
        assert_eq!(child.meta.parent_snapshot_id.as_deref(), Some("s1"));
        assert_eq!(snap.graph.pcc_node_id, None);
    }

    #[test]
    fn create_node_then_create_branch_batch_succeeds() {
        let snap = slack_snapshot();
        let create_b = accepted_envelope(
            "create_node",
            json!({
                "node_type": "PQ",
                "node_id": "B",
                "active_power": 1.0,
                "reactive_power": 0.3,
                "voltage_level_kv": 20.0
            })
            .as_object()
            .unwrap()
            .clone(),
        );
        let create_line = accepted_envelope(
            "create_branch",
            json!({
                "from_node_id": "A",
                "to_node_id": "B",
                "branch_kind": "line",
                "branch_id": "L1",
                "r_ohm_per_km": 0.2,
                "x_ohm_per_km": 0.4,
                "length_km": 2.0,
                "rated_current_a": 300.0
            })
            .as_object()
            .unwrap()
            .clone(),
        );
        let (result, snapshot) = apply_batch(&snap, &[create_b, create_line]);
        assert_eq!(result.status, ActionStatus::Accepted);
        let snapshot = snapshot.unwrap();
        assert!(snapshot.graph.nodes.contains_key("B"));
        assert!(snapshot.graph.branches.contains_key("L1"));
    }

    #[test]
    fn create_branch_with_unknown_node_rejects_batch_and_leaves_parent_hash_unchanged() {
        let snap = slack_snapshot();
        let parent_hash = netmodel_core::canonical::snapshot_hash(&snap).unwrap();

        let bogus_branch = accepted_envelope(
            "create_branch",
            json!({
                "from_node_id": "A",
                "to_node_id": "does-not-exist",
                "branch_kind": "line",
                "branch_id": "L1",
                "r_ohm_per_km": 0.2,
                "x_ohm_per_km": 0.4,
                "length_km": 2.0,
                "rated_current_a": 300.0
            })
            .as_object()
            .unwrap()
            .clone(),
        );

        let (result, snapshot) = apply_batch(&snap, &[bogus_branch]);
        assert_eq!(result.status, ActionStatus::Rejected);
        assert!(snapshot.is_none());
        assert!(result
            .action_results
            .iter()
            .any(|r| r.errors.iter().any(|i| i.code == crate::envelope::ActionIssueCode::UnknownNode)));

        let parent_hash_after = netmodel_core::canonical::snapshot_hash(&snap).unwrap();
        assert_eq!(parent_hash, parent_hash_after);
    }

    #[test]
    fn set_in_service_toggles_existing_branch() {
        let snap = slack_snapshot();
        let create_b = accepted_envelope(
            "create_node",
            json!({"node_type": "PQ", "node_id": "B", "active_power": 1.0, "reactive_power": 0.3, "voltage_level_kv": 20.0})
                .as_object()
                .unwrap()
                .clone(),
        );
        let create_line = accepted_envelope(
            "create_branch",
            json!({
                "from_node_id": "A", "to_node_id": "B", "branch_kind": "line", "branch_id": "L1",
                "r_ohm_per_km": 0.2, "x_ohm_per_km": 0.4, "length_km": 2.0, "rated_current_a": 300.0
            })
            .as_object()
            .unwrap()
            .clone(),
        );
        let (_, snap2) = apply_batch(&snap, &[create_b, create_line]);
        let snap2 = snap2.unwrap();
        let toggle = accepted_envelope(
            "set_in_service",
            json!({"entity_id": "L1", "in_service": false}).as_object().unwrap().clone(),
        );
        let snap3 = apply_action(&snap2, &toggle).unwrap();
        assert!(!snap3.graph.branches["L1"].in_service);
    }
}
