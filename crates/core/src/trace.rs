//! Execution traces, the trace-flow graph, and the walker that cuts a trace into handler nodes.

use crate::address::VmAddress;
use crate::backend::{CpuContext, ExecutionEngine, InstructionDecoder, RegisterFile};
use crate::result::Result;
use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One executed native instruction with the registers it saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    pub address: u64,
    /// Register state before the instruction executed.
    pub registers: RegisterFile,
}

impl TraceStep {
    pub fn new(address: u64, registers: RegisterFile) -> Self {
        Self { address, registers }
    }
}

/// One captured execution of a VM handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    steps: Vec<TraceStep>,
}

impl Node {
    pub fn new(steps: Vec<TraceStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.steps.iter().map(|step| step.address)
    }

    pub fn first_address(&self) -> Option<u64> {
        self.steps.first().map(|step| step.address)
    }

    /// First and last native address.
    pub fn range(&self) -> Option<(u64, u64)> {
        Some((self.steps.first()?.address, self.steps.last()?.address))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// First step that executed `address`.
    pub fn step_at(&self, address: u64) -> Option<&TraceStep> {
        self.steps.iter().find(|step| step.address == address)
    }

    /// Position of this occurrence in the bytecode stream: the first native address paired with
    /// the value of the code register when the handler started. An unknown register reads as 0.
    pub fn vm_address(&self, code: Option<&str>) -> VmAddress {
        let Some(first) = self.steps.first() else {
            return VmAddress::new(0, 0);
        };
        let vm = code
            .and_then(|reg| first.registers.read(reg))
            .unwrap_or(0);
        VmAddress::new(first.address, vm)
    }

    /// Appends the steps of `other`.
    pub fn append(&mut self, other: Node) {
        self.steps.extend(other.steps);
    }
}

/// Control flow observed across every trace of a run.
///
/// Nodes are native addresses, edges connect consecutively executed instructions. Straight-line
/// chains are merged into handler nodes by [`TraceFlowGraph::merge_all_nodes`].
#[derive(Debug, Default)]
pub struct TraceFlowGraph {
    graph: DiGraphMap<u64, ()>,
    starts: HashSet<u64>,
    /// Instructions that end a handler node whatever the graph shape (`ret`, indirect `jmp`,
    /// direct `call`).
    breaks: HashSet<u64>,
    decoded: HashSet<u64>,
    nodes: HashMap<u64, Vec<u64>>,
}

impl TraceFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one trace into the graph. Adding an already known trace changes nothing.
    pub fn add_trace(&mut self, steps: &[TraceStep], decoder: &dyn InstructionDecoder) {
        let Some(first) = steps.first() else {
            return;
        };
        self.starts.insert(first.address);

        for step in steps {
            self.graph.add_node(step.address);
            if self.decoded.insert(step.address)
                && let Some(instruction) = decoder.decode(step.address)
                && (instruction.is_dispatch() || instruction.is_direct_call())
            {
                self.breaks.insert(step.address);
            }
        }
        for pair in steps.windows(2) {
            self.graph.add_edge(pair[0].address, pair[1].address, ());
        }
    }

    /// Recomputes the node grouping from the accumulated edges.
    pub fn merge_all_nodes(&mut self) {
        let leaders: Vec<u64> = self
            .graph
            .nodes()
            .filter(|address| self.is_leader(*address))
            .collect();

        self.nodes = leaders
            .into_iter()
            .map(|leader| (leader, self.chain_from(leader)))
            .collect();

        tracing::debug!(
            addresses = self.graph.node_count(),
            nodes = self.nodes.len(),
            "trace flow graph merged"
        );
    }

    fn is_leader(&self, address: u64) -> bool {
        if self.starts.contains(&address) {
            return true;
        }
        let mut predecessors = self.graph.neighbors_directed(address, Direction::Incoming);
        let (Some(predecessor), None) = (predecessors.next(), predecessors.next()) else {
            return true;
        };
        self.breaks.contains(&predecessor)
            || self
                .graph
                .neighbors_directed(predecessor, Direction::Outgoing)
                .count()
                != 1
    }

    fn chain_from(&self, leader: u64) -> Vec<u64> {
        let mut chain = vec![leader];
        let mut current = leader;
        loop {
            if self.breaks.contains(&current) {
                break;
            }
            let mut successors = self.graph.neighbors_directed(current, Direction::Outgoing);
            let (Some(next), None) = (successors.next(), successors.next()) else {
                break;
            };
            if self.is_leader(next) || chain.contains(&next) {
                break;
            }
            chain.push(next);
            current = next;
        }
        chain
    }

    /// Member addresses of the node starting at `address`, if `address` starts one.
    pub fn node_at(&self, address: u64) -> Option<&[u64]> {
        self.nodes.get(&address).map(Vec::as_slice)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Cursor over one engine run, handing out handler nodes.
#[derive(Debug, Clone, Default)]
pub struct TraceWalker {
    steps: Vec<TraceStep>,
    cursor: usize,
    pending: usize,
}

impl TraceWalker {
    /// Runs the engine from `context` and folds the trace into `graph`.
    pub fn start(
        engine: &mut dyn ExecutionEngine,
        graph: &mut TraceFlowGraph,
        decoder: &dyn InstructionDecoder,
        context: &CpuContext,
        max_steps: usize,
    ) -> Result<Self> {
        let execution = engine.run(context, max_steps)?;
        graph.add_trace(&execution.steps, decoder);
        graph.merge_all_nodes();
        tracing::debug!(
            start = format_args!("0x{:x}", context.instruction_pointer()),
            steps = execution.steps.len(),
            "walk started"
        );
        Ok(Self::from_steps(execution.steps))
    }

    pub fn from_steps(steps: Vec<TraceStep>) -> Self {
        Self {
            steps,
            cursor: 0,
            pending: 0,
        }
    }

    /// Node beginning at the cursor, clipped to what the trace recorded. Empty when the cursor
    /// is not at a node start or the trace is exhausted.
    pub fn next_node(&mut self, graph: &TraceFlowGraph) -> Node {
        let Some(first) = self.steps.get(self.cursor) else {
            self.pending = 0;
            return Node::default();
        };
        let Some(members) = graph.node_at(first.address) else {
            self.pending = 0;
            return Node::default();
        };

        let steps: Vec<TraceStep> = self.steps[self.cursor..]
            .iter()
            .zip(members)
            .take_while(|(step, address)| step.address == **address)
            .map(|(step, _)| step.clone())
            .collect();
        self.pending = steps.len();
        Node::new(steps)
    }

    /// Advances past the node last returned by [`TraceWalker::next_node`].
    pub fn move_to_next(&mut self) {
        self.cursor += self.pending;
        self.pending = 0;
    }

    pub fn is_walk_to_end(&self) -> bool {
        self.cursor >= self.steps.len()
    }

    /// Index of the first step of the current node.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of steps up to and including the current node.
    pub fn position_after_current(&self) -> usize {
        self.cursor + self.pending
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }
}
