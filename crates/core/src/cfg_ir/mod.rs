//! Control flow graph of recovered VM code.
//!
//! Blocks are keyed by the VM address of their first instruction and every address owns at most
//! one block. Edges are recorded between block start addresses as the flow builder discovers
//! them, which may be before the target block exists.

use crate::address::VmAddress;
use crate::instruction::VmInstruction;
use crate::result::{Error, Result};
use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

mod trace;

pub use trace::{FlowEvent, OperationKind, event_counts};

/// Straight-line run of VM instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmBlock {
    pub start: VmAddress,
    pub instructions: Vec<VmInstruction>,
}

impl VmBlock {
    pub fn new(start: VmAddress) -> Self {
        Self {
            start,
            instructions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn last(&self) -> Option<&VmInstruction> {
        self.instructions.last()
    }
}

impl fmt::Display for VmBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}", self.start)?;
        for instruction in &self.instructions {
            write!(f, "\n{instruction}")?;
        }
        Ok(())
    }
}

/// How control leaves a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Continuation inside the VM.
    Flow,
    /// Exit to non-virtualized code.
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: VmAddress,
    pub to: VmAddress,
    pub kind: EdgeKind,
}

/// Node weight of the exported graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowNode {
    Block(VmBlock),
    /// Edge target with no block of its own: native code or a VM address never analyzed.
    External(VmAddress),
}

impl fmt::Display for FlowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowNode::Block(block) => write!(f, "{block}"),
            FlowNode::External(address) if address.is_native() => {
                write!(f, "native 0x{:x}", address.native)
            }
            FlowNode::External(address) => write!(f, "unresolved {address}"),
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::Flow => write!(f, "flow"),
            EdgeKind::Native => write!(f, "native"),
        }
    }
}

/// Recovered VM control flow.
#[derive(Debug, Clone, Default)]
pub struct VmFlowGraph {
    blocks: BTreeMap<VmAddress, VmBlock>,
    visited: HashSet<VmAddress>,
    edges: Vec<FlowEdge>,
    /// Operation log, in the order the builder applied them.
    pub trace: Vec<FlowEvent>,
}

impl VmFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_visited(&self, address: VmAddress) -> bool {
        self.visited.contains(&address)
    }

    /// Claims `address`. Returns false, and logs the skip, when it was already claimed.
    pub fn mark_visited(&mut self, address: VmAddress) -> bool {
        if self.visited.insert(address) {
            return true;
        }
        self.record(OperationKind::SkipVisited { address });
        false
    }

    /// Opens an empty block at `start`.
    pub fn create_block(&mut self, start: VmAddress) -> Result<()> {
        if self.blocks.contains_key(&start) {
            return Err(Error::InvalidBlockStructure(format!(
                "block {start} already exists"
            )));
        }
        self.visited.insert(start);
        self.blocks.insert(start, VmBlock::new(start));
        self.record(OperationKind::CreateBlock { start });
        Ok(())
    }

    pub fn push_instruction(&mut self, start: VmAddress, instruction: VmInstruction) -> Result<()> {
        let block = self.blocks.get_mut(&start).ok_or_else(|| {
            Error::InvalidBlockStructure(format!("no block at {start}"))
        })?;
        block.instructions.push(instruction);
        Ok(())
    }

    /// Adds an edge unless an identical one exists. Returns whether it was new.
    pub fn link(&mut self, from: VmAddress, to: VmAddress, kind: EdgeKind) -> bool {
        let edge = FlowEdge { from, to, kind };
        if self.edges.contains(&edge) {
            return false;
        }
        self.edges.push(edge);
        self.record(OperationKind::LinkEdge { from, to, kind });
        true
    }

    pub fn block(&self, start: VmAddress) -> Option<&VmBlock> {
        self.blocks.get(&start)
    }

    /// Blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = &VmBlock> {
        self.blocks.values()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn edges(&self) -> &[FlowEdge] {
        &self.edges
    }

    pub fn predecessors(&self, start: VmAddress) -> impl Iterator<Item = &FlowEdge> {
        self.edges.iter().filter(move |edge| edge.to == start)
    }

    pub fn successors(&self, start: VmAddress) -> impl Iterator<Item = &FlowEdge> {
        self.edges.iter().filter(move |edge| edge.from == start)
    }

    /// Builds a petgraph view. Edge endpoints without a block become [`FlowNode::External`].
    pub fn to_graph(&self) -> StableDiGraph<FlowNode, EdgeKind> {
        let mut graph = StableDiGraph::new();
        let mut index: HashMap<VmAddress, NodeIndex> = HashMap::new();
        for (start, block) in &self.blocks {
            index.insert(*start, graph.add_node(FlowNode::Block(block.clone())));
        }
        for edge in &self.edges {
            let from = *index
                .entry(edge.from)
                .or_insert_with(|| graph.add_node(FlowNode::External(edge.from)));
            let to = *index
                .entry(edge.to)
                .or_insert_with(|| graph.add_node(FlowNode::External(edge.to)));
            graph.add_edge(from, to, edge.kind);
        }
        graph
    }

    /// Graphviz rendering of [`VmFlowGraph::to_graph`].
    pub fn to_dot(&self) -> String {
        let graph = self.to_graph();
        format!("{}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
    }

    fn record(&mut self, kind: OperationKind) {
        tracing::trace!(?kind, "flow graph operation");
        self.trace.push(FlowEvent {
            kind,
            blocks: self.blocks.len(),
            edges: self.edges.len(),
        });
    }
}
