//! Deterministic JSON canonicalization and SHA-256 snapshot hashing.
//!
//! `serde_json::Map`'s default feature preserves insertion order, not
//! lexical order, so canonicalization walks the `serde_json::Value` tree and
//! re-emits it with keys sorted and id-bearing lists sorted by `id` before
//! handing the result to `serde_json`'s compact writer.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::snapshot::Snapshot;

fn normalize_float(value: f64) -> Value {
    if !value.is_finite() {
        // Preserve corruption rather than silently coercing to null.
        return Value::String(value.to_string());
    }
    let rounded = (value * 1_000_000.0).round() / 1_000_000.0;
    if rounded.fract() == 0.0 && rounded.abs() < 2f64.powi(53) {
        Value::Number(serde_json::Number::from(rounded as i64))
    } else {
        serde_json::Number::from_f64(rounded)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(rounded.to_string()))
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted_keys: Vec<&String> = map.keys().collect();
            sorted_keys.sort();
            let mut out = Map::new();
            for key in sorted_keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut canon_items: Vec<Value> = items.iter().map(canonicalize).collect();
            let all_have_id = !canon_items.is_empty()
                && canon_items
                    .iter()
                    .all(|item| matches!(item, Value::Object(m) if m.contains_key("id")));
            if all_have_id {
                canon_items.sort_by(|a, b| {
                    let a_id = a.get("id").and_then(Value::as_str).unwrap_or_default();
                    let b_id = b.get("id").and_then(Value::as_str).unwrap_or_default();
                    a_id.cmp(b_id)
                });
            }
            Value::Array(canon_items)
        }
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if n.is_f64() {
                    return normalize_float(f);
                }
            }
            Value::Number(n.clone())
        }
        other => other.clone(),
    }
}

/// Walks `value` and emits whitespace-free, lexically-sorted, float-normalized
/// JSON bytes.
pub fn canonical_json_value(value: &Value) -> String {
    let canon = canonicalize(value);
    serde_json::to_string(&canon).expect("canonical value always serializes")
}

pub fn canonical_json(snapshot: &Snapshot) -> crate::error::NetModelResult<String> {
    let value = serde_json::to_value(snapshot)?;
    Ok(canonical_json_value(&value))
}

pub fn snapshot_hash(snapshot: &Snapshot) -> crate::error::NetModelResult<String> {
    let json = canonical_json(snapshot)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_hash(snapshot: &Snapshot, expected: &str) -> crate::error::NetModelResult<bool> {
    Ok(snapshot_hash(snapshot)? == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sorted_lexically() {
        let value = serde_json::json!({"b": 1, "a": 2});
        assert_eq!(canonical_json_value(&value), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn integer_valued_float_collapses() {
        let value = serde_json::json!({"x": 2.0});
        assert_eq!(canonical_json_value(&value), r#"{"x":2}"#);
    }

    #[test]
    fn six_decimal_rounding() {
        let value = serde_json::json!({"x": 1.0000005});
        assert_eq!(canonical_json_value(&value), r#"{"x":1.000001}"#);
    }

    #[test]
    fn id_bearing_list_sorted() {
        let value = serde_json::json!([{"id": "b"}, {"id": "a"}]);
        assert_eq!(canonical_json_value(&value), r#"[{"id":"a"},{"id":"b"}]"#);
    }

    #[test]
    fn permutation_of_id_list_is_hash_stable() {
        let a = serde_json::json!({"items": [{"id": "x", "v": 1}, {"id": "y", "v": 2}]});
        let b = serde_json::json!({"items": [{"id": "y", "v": 2}, {"id": "x", "v": 1}]});
        assert_eq!(canonical_json_value(&a), canonical_json_value(&b));
    }

    fn ring_snapshot() -> crate::Snapshot {
        use crate::units::{Kilovolts, Megavars, Megawatts, PerUnit, Radians};
        use crate::{
            Branch, BranchKind, LineBranch, LineKind, Node, NodeType, ParallelEdgePolicy,
        };

        let mut graph = crate::NetworkGraph::new(ParallelEdgePolicy::Strict);
        graph
            .add_node(Node {
                id: "A".into(),
                name: "A".into(),
                node_type: NodeType::Slack,
                voltage_level_kv: Kilovolts(20.0),
                voltage_magnitude_pu: Some(PerUnit(1.0)),
                voltage_angle_rad: Some(Radians(0.0)),
                active_power_mw: None,
                reactive_power_mvar: None,
                sk_mva: Some(250.0),
                rx_ratio: Some(0.1),
                in_service: true,
            })
            .unwrap();
        for id in ["B", "C"] {
            graph
                .add_node(Node {
                    id: id.into(),
                    name: id.into(),
                    node_type: NodeType::Pq,
                    voltage_level_kv: Kilovolts(20.0),
                    voltage_magnitude_pu: None,
                    voltage_angle_rad: None,
                    active_power_mw: Some(Megawatts(1.0)),
                    reactive_power_mvar: Some(Megavars(0.3)),
                    sk_mva: None,
                    rx_ratio: None,
                    in_service: true,
                })
                .unwrap();
        }
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
        graph.add_branch(line("L1", "A", "B"), false).unwrap();
        graph.add_branch(line("L2", "B", "C"), false).unwrap();
        graph.add_branch(line("L3", "C", "A"), false).unwrap();

        crate::Snapshot::new(graph, "ring-1", None, "1.0", "model-ring", chrono::Utc::now())
    }

    #[test]
    fn ring_round_trip_is_byte_identical_and_permutation_hash_stable() {
        let snapshot = ring_snapshot();
        let first = canonical_json(&snapshot).unwrap();
        let reparsed: crate::Snapshot = serde_json::from_str(&first).unwrap();
        let second = canonical_json(&reparsed).unwrap();
        assert_eq!(first, second);

        let mut permuted = ring_snapshot();
        let mut branches: Vec<_> = permuted.graph.branches.clone().into_iter().collect();
        permuted.graph.branches.clear();
        branches.reverse();
        for (id, branch) in branches {
            permuted.graph.branches.insert(id, branch);
        }
        assert_eq!(
            snapshot_hash(&snapshot).unwrap(),
            snapshot_hash(&permuted).unwrap()
        );
    }
}
