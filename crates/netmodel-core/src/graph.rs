//! The topology graph: authoritative, id-keyed container for network
//! entities, enforcing structural invariants and exposing connectivity
//! queries over the active (in-service) subgraph.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graphmap::UnGraphMap;
use serde::{Deserialize, Serialize};

use crate::entities::{Branch, Corridor, Id, InverterSource, Node, NodeType, Substation, Switch};
use crate::error::{NetModelError, NetModelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelEdgePolicy {
    Strict,
    Permissive,
}

impl Default for ParallelEdgePolicy {
    fn default() -> Self {
        ParallelEdgePolicy::Strict
    }
}

/// Owning container for a network's primitive entities plus the policy that
/// governs whether a second edge between the same node pair is legal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkGraph {
    pub nodes: HashMap<Id, Node>,
    pub branches: HashMap<Id, Branch>,
    pub switches: HashMap<Id, Switch>,
    pub inverter_sources: HashMap<Id, InverterSource>,
    /// Composite entities grouping buses/branches for planning views. Held
    /// as plain id references, not object pointers — the graph never
    /// resolves them, so a corridor or substation can outlive the bus or
    /// branch it names. Detecting that is the readiness validator's job.
    #[serde(default)]
    pub substations: HashMap<Id, Substation>,
    #[serde(default)]
    pub corridors: HashMap<Id, Corridor>,
    pub parallel_edge_policy: ParallelEdgePolicy,
    /// Point-of-common-coupling node, set by the `set_pcc` action. Not a
    /// structural invariant: any existing node id (or none) is legal.
    #[serde(default)]
    pub pcc_node_id: Option<Id>,
}

/// An edge between two nodes, tagged by whether it is an impedance branch or
/// a zero-impedance switch — needed to evaluate the permissive parallel-edge
/// rule, which only allows a duplicate pair when one side is a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Branch,
    Switch,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl NetworkGraph {
    pub fn new(parallel_edge_policy: ParallelEdgePolicy) -> Self {
        Self {
            nodes: HashMap::new(),
            branches: HashMap::new(),
            switches: HashMap::new(),
            inverter_sources: HashMap::new(),
            substations: HashMap::new(),
            corridors: HashMap::new(),
            parallel_edge_policy,
            pcc_node_id: None,
        }
    }

    // ---- nodes ----------------------------------------------------------

    pub fn add_node(&mut self, node: Node) -> NetModelResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(NetModelError::Invariant(format!(
                "duplicate node id {}",
                node.id
            )));
        }
        node.validate()?;
        if node.node_type == NodeType::Slack && self.nodes.values().any(|n| n.node_type == NodeType::Slack) {
            return Err(NetModelError::Invariant(
                "graph already has a SLACK node".into(),
            ));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Fatals if any branch, switch, or inverter source still references this
    /// node; callers must cascade those removals explicitly first.
    pub fn remove_node(&mut self, id: &str) -> NetModelResult<()> {
        if !self.nodes.contains_key(id) {
            return Err(NetModelError::Reference(format!("unknown node {id}")));
        }
        let referenced = self
            .branches
            .values()
            .any(|b| b.from_node_id == id || b.to_node_id == id)
            || self
                .switches
                .values()
                .any(|s| s.from_node_id == id || s.to_node_id == id)
            || self.inverter_sources.values().any(|s| s.node_id == id);
        if referenced {
            return Err(NetModelError::Invariant(format!(
                "node {id} is still referenced by a branch, switch, or inverter source"
            )));
        }
        self.nodes.remove(id);
        Ok(())
    }

    // ---- branches ---------------------------------------------------------

    fn check_endpoints_exist(&self, from: &str, to: &str) -> NetModelResult<()> {
        if !self.nodes.contains_key(from) {
            return Err(NetModelError::Reference(format!("unknown node {from}")));
        }
        if !self.nodes.contains_key(to) {
            return Err(NetModelError::Reference(format!("unknown node {to}")));
        }
        Ok(())
    }

    fn existing_edges_between(&self, a: &str, b: &str) -> Vec<EdgeKind> {
        let key = pair_key(a, b);
        let mut found = Vec::new();
        for branch in self.branches.values() {
            if pair_key(&branch.from_node_id, &branch.to_node_id) == key {
                found.push(EdgeKind::Branch);
            }
        }
        for switch in self.switches.values() {
            if pair_key(&switch.from_node_id, &switch.to_node_id) == key {
                found.push(EdgeKind::Switch);
            }
        }
        found
    }

    fn check_parallel_edge(&self, a: &str, b: &str, new_kind: EdgeKind) -> NetModelResult<()> {
        let existing = self.existing_edges_between(a, b);
        if existing.is_empty() {
            return Ok(());
        }
        match self.parallel_edge_policy {
            ParallelEdgePolicy::Strict => Err(NetModelError::Invariant(format!(
                "parallel edge between {a} and {b} forbidden under strict policy"
            ))),
            ParallelEdgePolicy::Permissive => {
                let has_switch = new_kind == EdgeKind::Switch || existing.contains(&EdgeKind::Switch);
                if has_switch {
                    Ok(())
                } else {
                    Err(NetModelError::Invariant(format!(
                        "parallel edge between {a} and {b} requires at least one switch"
                    )))
                }
            }
        }
    }

    pub fn add_branch(&mut self, branch: Branch, enforce_connected: bool) -> NetModelResult<()> {
        if self.branches.contains_key(&branch.id) {
            return Err(NetModelError::Invariant(format!(
                "duplicate branch id {}",
                branch.id
            )));
        }
        branch.validate()?;
        self.check_endpoints_exist(&branch.from_node_id, &branch.to_node_id)?;
        self.check_parallel_edge(&branch.from_node_id, &branch.to_node_id, EdgeKind::Branch)?;

        let id = branch.id.clone();
        self.branches.insert(id.clone(), branch);

        if enforce_connected && !self.is_connected(true) {
            self.branches.remove(&id);
            return Err(NetModelError::Invariant(
                "adding branch leaves the in-service graph disconnected".into(),
            ));
        }
        Ok(())
    }

    pub fn remove_branch(&mut self, id: &str) -> NetModelResult<()> {
        if self.branches.remove(id).is_none() {
            return Err(NetModelError::Reference(format!("unknown branch {id}")));
        }
        Ok(())
    }

    pub fn get_branch(&self, id: &str) -> Option<&Branch> {
        self.branches.get(id)
    }

    // ---- switches -----------------------------------------------------

    pub fn add_switch(&mut self, switch: Switch) -> NetModelResult<()> {
        if self.switches.contains_key(&switch.id) {
            return Err(NetModelError::Invariant(format!(
                "duplicate switch id {}",
                switch.id
            )));
        }
        switch.validate()?;
        self.check_endpoints_exist(&switch.from_node_id, &switch.to_node_id)?;
        self.check_parallel_edge(&switch.from_node_id, &switch.to_node_id, EdgeKind::Switch)?;
        self.switches.insert(switch.id.clone(), switch);
        Ok(())
    }

    pub fn remove_switch(&mut self, id: &str) -> NetModelResult<()> {
        if self.switches.remove(id).is_none() {
            return Err(NetModelError::Reference(format!("unknown switch {id}")));
        }
        Ok(())
    }

    pub fn get_switch(&self, id: &str) -> Option<&Switch> {
        self.switches.get(id)
    }

    // ---- inverter sources -----------------------------------------------

    pub fn add_inverter_source(&mut self, source: InverterSource) -> NetModelResult<()> {
        if self.inverter_sources.contains_key(&source.id) {
            return Err(NetModelError::Invariant(format!(
                "duplicate inverter source id {}",
                source.id
            )));
        }
        source.validate()?;
        if !self.nodes.contains_key(&source.node_id) {
            return Err(NetModelError::Reference(format!(
                "unknown node {}",
                source.node_id
            )));
        }
        self.inverter_sources.insert(source.id.clone(), source);
        Ok(())
    }

    pub fn get_inverter_sources_at_node(&self, id: &str) -> Vec<&InverterSource> {
        let mut sources: Vec<&InverterSource> = self
            .inverter_sources
            .values()
            .filter(|s| s.node_id == id)
            .collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        sources
    }

    // ---- composite entities ---------------------------------------------

    /// No endpoint-existence check: a dangling `bus_refs` entry is a
    /// readiness concern, not a structural one, per the composite-entity
    /// design.
    pub fn add_substation(&mut self, substation: Substation) -> NetModelResult<()> {
        if self.substations.contains_key(&substation.id) {
            return Err(NetModelError::Invariant(format!(
                "duplicate substation id {}",
                substation.id
            )));
        }
        self.substations.insert(substation.id.clone(), substation);
        Ok(())
    }

    pub fn add_corridor(&mut self, corridor: Corridor) -> NetModelResult<()> {
        if self.corridors.contains_key(&corridor.id) {
            return Err(NetModelError::Invariant(format!(
                "duplicate corridor id {}",
                corridor.id
            )));
        }
        self.corridors.insert(corridor.id.clone(), corridor);
        Ok(())
    }

    // ---- connectivity -----------------------------------------------------

    /// Builds the undirected multigraph of the chosen projection as a simple
    /// graph: `in_service_only = true` limits edges to in-service branches
    /// and closed in-service switches (the "active" view); `false` uses
    /// every branch/switch regardless of state (the "all" view). Parallel
    /// edges collapse to one `UnGraphMap` edge, matching the spec's
    /// requirement that topology queries project the multigraph to a simple
    /// graph so parallel edges don't inflate the spanning forest.
    fn projected_graph(&self, in_service_only: bool) -> UnGraphMap<&str, ()> {
        let mut g = UnGraphMap::new();
        for id in self.nodes.keys() {
            g.add_node(id.as_str());
        }
        for branch in self.branches.values() {
            if in_service_only && !branch.in_service {
                continue;
            }
            g.add_edge(branch.from_node_id.as_str(), branch.to_node_id.as_str(), ());
        }
        for switch in self.switches.values() {
            if in_service_only && !switch.is_active() {
                continue;
            }
            g.add_edge(switch.from_node_id.as_str(), switch.to_node_id.as_str(), ());
        }
        g
    }

    pub fn is_connected(&self, in_service_only: bool) -> bool {
        if self.nodes.is_empty() {
            return true;
        }
        self.find_islands(in_service_only).len() == 1
    }

    /// Connected components of the chosen projection, each a lexically
    /// sorted list of node ids; components are ordered shorter-first, then
    /// lexically by their sorted id list.
    pub fn find_islands(&self, in_service_only: bool) -> Vec<Vec<Id>> {
        let g = self.projected_graph(in_service_only);
        let mut visited: HashSet<&str> = HashSet::new();
        let mut islands: Vec<Vec<Id>> = Vec::new();

        let mut start_ids: Vec<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        start_ids.sort_unstable();

        for start in start_ids {
            if visited.contains(start) {
                continue;
            }
            let mut members = Vec::new();
            let mut queue = VecDeque::new();
            queue.push_back(start);
            visited.insert(start);
            while let Some(node) = queue.pop_front() {
                members.push(node.to_string());
                for neighbor in g.neighbors(node) {
                    if visited.insert(neighbor) {
                        queue.push_back(neighbor);
                    }
                }
            }
            members.sort_unstable();
            islands.push(members);
        }

        islands.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        islands
    }

    pub fn get_connected_nodes(&self, id: &str, in_service_only: bool) -> NetModelResult<Vec<Id>> {
        if !self.nodes.contains_key(id) {
            return Err(NetModelError::Reference(format!("unknown node {id}")));
        }
        for island in self.find_islands(in_service_only) {
            if island.iter().any(|n| n == id) {
                return Ok(island);
            }
        }
        Ok(vec![id.to_string()])
    }

    pub fn slack_node(&self) -> Option<&Node> {
        self.nodes.values().find(|n| n.node_type == NodeType::Slack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{BranchKind, LineBranch, LineKind, NodeType, SwitchState, SwitchType};
    use crate::units::{Kilovolts, Megavars, Megawatts, PerUnit, Radians};

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
            id: id.into(),
            name: id.into(),
            node_type: NodeType::Pq,
            voltage_level_kv: Kilovolts(20.0),
            voltage_magnitude_pu: None,
            voltage_angle_rad: None,
            active_power_mw: Some(Megawatts(2.0)),
            reactive_power_mvar: Some(Megavars(1.0)),
            sk_mva: None,
            rx_ratio: None,
            in_service: true,
        }
    }

    fn line(id: &str, from: &str, to: &str) -> Branch {
        Branch {
            id: id.into(),
            name: id.into(),
            from_node_id: from.into(),
            to_node_id: to.into(),
            in_service: true,
            kind: BranchKind::Line(LineBranch {
                kind: LineKind::Line,
                r_ohm_per_km: 0.4,
                x_ohm_per_km: 0.8,
                b_us_per_km: 0.0,
                length_km: 1.0,
                rated_current_a: 300.0,
                type_ref: None,
                impedance_override: None,
                r0_ohm_per_km: None,
                x0_ohm_per_km: None,
                b0_us_per_km: None,
            }),
        }
    }

    #[test]
    fn second_slack_rejected() {
        let mut graph = NetworkGraph::new(ParallelEdgePolicy::Strict);
        graph.add_node(slack("A")).unwrap();
        assert!(graph.add_node(slack("B")).is_err());
    }

    #[test]
    fn remove_node_fatals_when_referenced() {
        let mut graph = NetworkGraph::new(ParallelEdgePolicy::Strict);
        graph.add_node(slack("A")).unwrap();
        graph.add_node(pq("B")).unwrap();
        graph.add_branch(line("L1", "A", "B"), false).unwrap();
        assert!(graph.remove_node("A").is_err());
        graph.remove_branch("L1").unwrap();
        assert!(graph.remove_node("A").is_ok());
    }

    #[test]
    fn parallel_branch_rejected_under_strict() {
        let mut graph = NetworkGraph::new(ParallelEdgePolicy::Strict);
        graph.add_node(slack("A")).unwrap();
        graph.add_node(pq("B")).unwrap();
        graph.add_branch(line("L1", "A", "B"), false).unwrap();
        assert!(graph.add_branch(line("L2", "A", "B"), false).is_err());
    }

    #[test]
    fn permissive_allows_switch_parallel_to_branch() {
        let mut graph = NetworkGraph::new(ParallelEdgePolicy::Permissive);
        graph.add_node(slack("A")).unwrap();
        graph.add_node(pq("B")).unwrap();
        graph.add_branch(line("L1", "A", "B"), false).unwrap();
        let switch = Switch {
            id: "S1".into(),
            from_node_id: "A".into(),
            to_node_id: "B".into(),
            switch_type: SwitchType::Breaker,
            state: SwitchState::Closed,
            in_service: true,
            rated_current_a: 400.0,
            rated_voltage_kv: 20.0,
        };
        assert!(graph.add_switch(switch).is_ok());
    }

    #[test]
    fn islands_sorted_shorter_first_then_lexical() {
        let mut graph = NetworkGraph::new(ParallelEdgePolicy::Strict);
        graph.add_node(slack("A")).unwrap();
        graph.add_node(pq("B")).unwrap();
        graph.add_node(pq("Z")).unwrap();
        graph.add_branch(line("L1", "A", "B"), false).unwrap();
        let islands = graph.find_islands(true);
        assert_eq!(islands.len(), 2);
        assert_eq!(islands[0], vec!["Z".to_string()]);
        assert_eq!(islands[1], vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn disconnected_add_rolled_back_when_enforced() {
        let mut graph = NetworkGraph::new(ParallelEdgePolicy::Strict);
        graph.add_node(slack("A")).unwrap();
        graph.add_node(pq("B")).unwrap();
        let mut out_of_service = line("L1", "A", "B");
        out_of_service.in_service = false;
        assert!(graph.add_branch(out_of_service, true).is_err());
        assert!(graph.get_branch("L1").is_none());
    }
}
