//! Immutable, hashable wrapper around a [`NetworkGraph`] plus lineage
//! metadata. A new snapshot is produced by applying an accepted action to a
//! parent snapshot (see `netmodel-actions`); this crate only owns the value
//! type and its construction.

use serde::{Deserialize, Serialize};

use crate::graph::NetworkGraph;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_id: String,
    pub parent_snapshot_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub schema_version: String,
    pub network_model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub graph: NetworkGraph,
}

impl Snapshot {
    pub fn new(
        graph: NetworkGraph,
        snapshot_id: impl Into<String>,
        parent_snapshot_id: Option<String>,
        schema_version: impl Into<String>,
        network_model_id: impl Into<String>,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            meta: SnapshotMeta {
                snapshot_id: snapshot_id.into(),
                parent_snapshot_id,
                created_at,
                schema_version: schema_version.into(),
                network_model_id: network_model_id.into(),
            },
            graph,
        }
    }

    /// Produces the child snapshot for an accepted action: copy-on-write
    /// clone of the graph, fresh id, lineage pointing at this snapshot.
    pub fn derive_child(
        &self,
        mutated_graph: NetworkGraph,
        child_snapshot_id: impl Into<String>,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            meta: SnapshotMeta {
                snapshot_id: child_snapshot_id.into(),
                parent_snapshot_id: Some(self.meta.snapshot_id.clone()),
                created_at,
                schema_version: self.meta.schema_version.clone(),
                network_model_id: self.meta.network_model_id.clone(),
            },
            graph: mutated_graph,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ParallelEdgePolicy;

    #[test]
    fn derive_child_preserves_lineage_fields() {
        let parent = Snapshot::new(
            NetworkGraph::new(ParallelEdgePolicy::Strict),
            "snap-1",
            None,
            "1.0",
            "model-1",
            chrono::Utc::now(),
        );
        let child = parent.derive_child(
            NetworkGraph::new(ParallelEdgePolicy::Strict),
            "snap-2",
            chrono::Utc::now(),
        );
        assert_eq!(child.meta.parent_snapshot_id.as_deref(), Some("snap-1"));
        assert_eq!(child.meta.network_model_id, "model-1");
        assert_eq!(child.meta.schema_version, "1.0");
    }
}
