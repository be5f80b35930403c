use assert_cmd::Command;
use predicates::str::contains;
use std::io::Write;
use tempfile::NamedTempFile;

fn two_bus_graph_json() -> String {
    serde_json::json!({
        "nodes": {
            "A": {
                "id": "A", "name": "A", "node_type": "SLACK",
                "voltage_level_kv": 20.0, "voltage_magnitude_pu": 1.0,
                "voltage_angle_rad": 0.0, "active_power_mw": null,
                "reactive_power_mvar": null, "sk_mva": null, "rx_ratio": null,
                "in_service": true
            },
            "B": {
                "id": "B", "name": "B", "node_type": "PQ",
                "voltage_level_kv": 20.0, "voltage_magnitude_pu": null,
                "voltage_angle_rad": null, "active_power_mw": 1.0,
                "reactive_power_mvar": 0.3, "sk_mva": null, "rx_ratio": null,
                "in_service": true
            }
        },
        "branches": {
            "L1": {
                "id": "L1", "name": "L1", "from_node_id": "A", "to_node_id": "B",
                "in_service": true,
                "kind": {
                    "branch_type": "line",
                    "kind": "line",
                    "r_ohm_per_km": 0.2, "x_ohm_per_km": 0.4, "b_us_per_km": 1.0,
                    "length_km": 2.0, "rated_current_a": 300.0,
                    "type_ref": null, "impedance_override": null,
                    "r0_ohm_per_km": null, "x0_ohm_per_km": null, "b0_us_per_km": null
                }
            }
        },
        "switches": {},
        "inverter_sources": {},
        "parallel_edge_policy": "strict"
    })
    .to_string()
}

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn build_graph_reports_connectivity() {
    let graph_file = write_temp(&two_bus_graph_json());
    Command::cargo_bin("netmodel")
        .unwrap()
        .args(["build-graph", graph_file.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("nodes: 2"))
        .stdout(contains("connected: true"));
}

fn two_bus_graph_with_source_json() -> String {
    let mut graph: serde_json::Value = serde_json::from_str(&two_bus_graph_json()).unwrap();
    graph["nodes"]["A"]["sk_mva"] = serde_json::json!(250.0);
    graph["nodes"]["A"]["rx_ratio"] = serde_json::json!(0.1);
    graph.to_string()
}

#[test]
fn validate_reports_ok_for_well_formed_graph() {
    let graph_file = write_temp(&two_bus_graph_with_source_json());
    Command::cargo_bin("netmodel")
        .unwrap()
        .args(["validate", graph_file.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("status: ok"));
}

#[test]
fn validate_reports_blocked_for_graph_missing_short_circuit_source_data() {
    let graph_file = write_temp(&two_bus_graph_json());
    Command::cargo_bin("netmodel")
        .unwrap()
        .args(["validate", graph_file.path().to_str().unwrap()])
        .assert()
        .failure()
        .stdout(contains("status: blocked"));
}

#[test]
fn solve_sc_reports_three_phase_fault_current() {
    let graph_file = write_temp(&two_bus_graph_with_source_json());
    let fault_file = write_temp(
        &serde_json::json!({
            "fault_type": "3F",
            "location": {"type": "node", "node_id": "A"},
            "options": {"base_mva": 100.0, "c": null, "tk_s": 1.0, "tb_s": 0.1, "include_branch_contributions": false}
        })
        .to_string(),
    );
    Command::cargo_bin("netmodel")
        .unwrap()
        .args([
            "solve-sc",
            graph_file.path().to_str().unwrap(),
            fault_file.path().to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(contains("ikss_ka"));
}

#[test]
fn hash_is_stable_across_repeated_runs() {
    let snapshot = serde_json::json!({
        "meta": {
            "snapshot_id": "s1",
            "parent_snapshot_id": null,
            "created_at": "2026-01-01T00:00:00Z",
            "schema_version": "1.0",
            "network_model_id": "m1"
        },
        "graph": serde_json::from_str::<serde_json::Value>(&two_bus_graph_json()).unwrap()
    })
    .to_string();
    let snapshot_file = write_temp(&snapshot);

    let first = Command::cargo_bin("netmodel")
        .unwrap()
        .args(["hash", snapshot_file.path().to_str().unwrap()])
        .output()
        .unwrap();
    let second = Command::cargo_bin("netmodel")
        .unwrap()
        .args(["hash", snapshot_file.path().to_str().unwrap()])
        .output()
        .unwrap();
    assert_eq!(first.stdout, second.stdout);
}
