//! Primitive entities, the topology graph, and snapshot/canonical hashing
//! for the network analysis engine — the leaf layers everything else in the
//! workspace (`netmodel-actions`, `netmodel-solve`, `netmodel-shortcircuit`)
//! builds on.

pub mod canonical;
pub mod entities;
pub mod error;
pub mod graph;
pub mod snapshot;
pub mod units;

pub use entities::{
    Branch, BranchKind, Corridor, Id, InverterSource, LineBranch, LineImpedanceOverride, LineKind,
    Node, NodeType, Substation, Switch, SwitchState, SwitchType, TransformerBranch, TypeRef,
};
pub use error::{NetModelError, NetModelResult};
pub use graph::{NetworkGraph, ParallelEdgePolicy};
pub use snapshot::{Snapshot, SnapshotMeta};
