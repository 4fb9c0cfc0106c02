use crate::address::VmAddress;
use crate::cfg_ir::EdgeKind;
use serde::{Deserialize, Serialize};

/// Mutations recorded while the flow graph is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    CreateBlock {
        start: VmAddress,
    },
    LinkEdge {
        from: VmAddress,
        to: VmAddress,
        kind: EdgeKind,
    },
    /// A continuation reached an address that already owns a block.
    SkipVisited {
        address: VmAddress,
    },
}

/// Trace entry: the operation plus the graph size right after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub kind: OperationKind,
    pub blocks: usize,
    pub edges: usize,
}

/// Number of events of each kind, in `(create, link, skip)` order.
pub fn event_counts(events: &[FlowEvent]) -> (usize, usize, usize) {
    events
        .iter()
        .fold((0, 0, 0), |(create, link, skip), event| match event.kind {
            OperationKind::CreateBlock { .. } => (create + 1, link, skip),
            OperationKind::LinkEdge { .. } => (create, link + 1, skip),
            OperationKind::SkipVisited { .. } => (create, link, skip + 1),
        })
}
