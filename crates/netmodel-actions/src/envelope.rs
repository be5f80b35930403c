//! Action envelope type and the five-stage deterministic validation
//! protocol: structural, payload, referential integrity, domain invariants,
//! acceptance.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use netmodel_core::Snapshot;

use crate::apply::mutate_graph;

pub type ActionId = String;
pub type ParentSnapshotId = String;

pub const ACTION_TYPES: [&str; 4] =
    ["create_node", "create_branch", "set_in_service", "set_pcc"];

fn required_payload_keys(action_type: &str) -> &'static [&'static str] {
    match action_type {
        "create_node" => &["node_type"],
        "create_branch" => &["from_node_id", "to_node_id", "branch_kind"],
        "set_in_service" => &["entity_id", "in_service"],
        "set_pcc" => &["node_id"],
        _ => &[],
    }
}

fn node_type_required_keys(node_type: &str) -> Option<&'static [&'static str]> {
    match node_type {
        "SLACK" => Some(&["voltage_magnitude", "voltage_angle"]),
        "PQ" => Some(&["active_power", "reactive_power"]),
        "PV" => Some(&["active_power", "voltage_magnitude"]),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Accepted,
    Rejected,
}

/// Raw, loosely-typed edit over a parent snapshot. `payload` stays an
/// untyped JSON object through structural validation so a malformed or
/// unrecognized `action_type` is reported as a `rejected` value rather than
/// a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub action_id: ActionId,
    pub parent_snapshot_id: ParentSnapshotId,
    pub action_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub status: Option<ActionStatus>,
    pub actor: Option<String>,
    pub schema_version: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionIssueCode {
    MissingField,
    InvalidType,
    MissingPayloadKey,
    InvalidValue,
    UnknownActionType,
    UnknownNode,
    UnknownEntity,
    GraphInvariant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionIssue {
    pub code: ActionIssueCode,
    pub message: String,
    pub path: String,
}

impl ActionIssue {
    fn new(code: ActionIssueCode, message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub action_id: ActionId,
    pub parent_snapshot_id: ParentSnapshotId,
    pub errors: Vec<ActionIssue>,
    pub warnings: Vec<ActionIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchActionResult {
    pub status: ActionStatus,
    pub parent_snapshot_id: ParentSnapshotId,
    pub action_results: Vec<ActionResult>,
    pub new_snapshot_id: Option<String>,
    pub errors: Vec<ActionIssue>,
}

/// Runs the five-stage protocol and returns the resulting `ActionResult`.
/// Never mutates `parent`; stage 4 trials the mutation on a clone.
pub fn validate_action(envelope: &ActionEnvelope, parent: &Snapshot) -> ActionResult {
    let mut errors = Vec::new();

    validate_structural(envelope, &mut errors);

    let action_type_known = ACTION_TYPES.contains(&envelope.action_type.as_str());
    if !action_type_known {
        errors.push(ActionIssue::new(
            ActionIssueCode::UnknownActionType,
            format!(
                "unrecognized action_type; expected one of: {}",
                ACTION_TYPES.join(", ")
            ),
            "action_type",
        ));
    }

    if action_type_known {
        validate_payload_keys(&envelope.action_type, &envelope.payload, &mut errors);
        validate_payload_values(&envelope.action_type, &envelope.payload, &mut errors);
        validate_referential_integrity(&envelope.action_type, &envelope.payload, parent, &mut errors);

        if errors.is_empty() {
            let mut trial_graph = parent.graph.clone();
            if let Err(e) = mutate_graph(
                &mut trial_graph,
                &envelope.action_type,
                &envelope.action_id,
                &envelope.payload,
            ) {
                errors.push(ActionIssue::new(
                    ActionIssueCode::GraphInvariant,
                    e.to_string(),
                    "payload",
                ));
            }
        }
    }

    let status = if errors.is_empty() {
        ActionStatus::Accepted
    } else {
        ActionStatus::Rejected
    };

    ActionResult {
        status,
        action_id: envelope.action_id.clone(),
        parent_snapshot_id: envelope.parent_snapshot_id.clone(),
        errors,
        warnings: Vec::new(),
    }
}

fn validate_structural(envelope: &ActionEnvelope, errors: &mut Vec<ActionIssue>) {
    if envelope.action_id.is_empty() {
        errors.push(ActionIssue::new(
            ActionIssueCode::MissingField,
            "missing required field: action_id",
            "action_id",
        ));
    }
    if envelope.parent_snapshot_id.is_empty() {
        errors.push(ActionIssue::new(
            ActionIssueCode::MissingField,
            "missing required field: parent_snapshot_id",
            "parent_snapshot_id",
        ));
    }
    if envelope.action_type.is_empty() {
        errors.push(ActionIssue::new(
            ActionIssueCode::MissingField,
            "missing required field: action_type",
            "action_type",
        ));
    }
}

fn validate_payload_keys(action_type: &str, payload: &Map<String, Value>, errors: &mut Vec<ActionIssue>) {
    for key in required_payload_keys(action_type) {
        if !payload.contains_key(*key) {
            errors.push(ActionIssue::new(
                ActionIssueCode::MissingPayloadKey,
                format!("missing required payload key: {key}"),
                format!("payload.{key}"),
            ));
        }
    }

    if action_type == "create_node" {
        if let Some(node_type) = payload.get("node_type") {
            let Some(node_type) = node_type.as_str() else {
                errors.push(ActionIssue::new(
                    ActionIssueCode::InvalidType,
                    "node_type must be a string",
                    "payload.node_type",
                ));
                return;
            };
            let Some(required) = node_type_required_keys(node_type) else {
                errors.push(ActionIssue::new(
                    ActionIssueCode::InvalidValue,
                    "node_type must be one of: SLACK, PQ, PV",
                    "payload.node_type",
                ));
                return;
            };
            for key in required {
                if !payload.contains_key(*key) {
                    errors.push(ActionIssue::new(
                        ActionIssueCode::MissingPayloadKey,
                        format!("missing required payload key: {key}"),
                        format!("payload.{key}"),
                    ));
                }
            }
        }
    }
}

fn validate_payload_values(action_type: &str, payload: &Map<String, Value>, errors: &mut Vec<ActionIssue>) {
    if action_type == "create_branch" {
        if let Some(kind) = payload.get("branch_kind") {
            if !kind.is_string() {
                errors.push(ActionIssue::new(
                    ActionIssueCode::InvalidType,
                    "branch_kind must be a string",
                    "payload.branch_kind",
                ));
            }
        }
    }
    if action_type == "set_in_service" {
        if let Some(flag) = payload.get("in_service") {
            if !flag.is_boolean() {
                errors.push(ActionIssue::new(
                    ActionIssueCode::InvalidType,
                    "in_service must be a boolean",
                    "payload.in_service",
                ));
            }
        }
    }
}

fn validate_referential_integrity(
    action_type: &str,
    payload: &Map<String, Value>,
    parent: &Snapshot,
    errors: &mut Vec<ActionIssue>,
) {
    let graph = &parent.graph;

    if action_type == "set_pcc" {
        if let Some(node_id) = payload.get("node_id").and_then(Value::as_str) {
            if !graph.nodes.contains_key(node_id) {
                errors.push(ActionIssue::new(
                    ActionIssueCode::UnknownNode,
                    format!("node '{node_id}' does not exist in snapshot"),
                    "payload.node_id",
                ));
            }
        }
    }

    if action_type == "set_in_service" {
        if let Some(entity_id) = payload.get("entity_id").and_then(Value::as_str) {
            let known = graph.branches.contains_key(entity_id)
                || graph.inverter_sources.contains_key(entity_id);
            if !known {
                errors.push(ActionIssue::new(
                    ActionIssueCode::UnknownEntity,
                    format!("entity '{entity_id}' does not exist in snapshot"),
                    "payload.entity_id",
                ));
            }
        }
    }

    if action_type == "create_branch" {
        if let Some(from) = payload.get("from_node_id").and_then(Value::as_str) {
            if !graph.nodes.contains_key(from) {
                errors.push(ActionIssue::new(
                    ActionIssueCode::UnknownNode,
                    format!("from_node_id '{from}' does not exist in snapshot"),
                    "payload.from_node_id",
                ));
            }
        }
        if let Some(to) = payload.get("to_node_id").and_then(Value::as_str) {
            if !graph.nodes.contains_key(to) {
                errors.push(ActionIssue::new(
                    ActionIssueCode::UnknownNode,
                    format!("to_node_id '{to}' does not exist in snapshot"),
                    "payload.to_node_id",
                ));
            }
        }
    }
}

/// Validates and applies a batch in declared order. Any rejection aborts the
/// whole batch and returns the parent snapshot unchanged (all-or-nothing).
pub fn validate_batch(envelopes: &[ActionEnvelope], parent: &Snapshot) -> BatchActionResult {
    let mut results = Vec::with_capacity(envelopes.len());
    let mut batch_ok = true;
    for envelope in envelopes {
        let result = validate_action(envelope, parent);
        if result.status != ActionStatus::Accepted {
            batch_ok = false;
        }
        results.push(result);
        if !batch_ok {
            break;
        }
    }
    BatchActionResult {
        status: if batch_ok {
            ActionStatus::Accepted
        } else {
            ActionStatus::Rejected
        },
        parent_snapshot_id: parent.meta.snapshot_id.clone(),
        action_results: results,
        new_snapshot_id: None,
        errors: Vec::new(),
    }
}
