//! Flow build orchestration.
//!
//! A FIFO queue of tasks, each one walking a single engine trace through the
//! `FindVmInit -> FinishVmInit -> FinishMatch | MatchError` state machine. Tasks discover VM
//! instructions, grow blocks of the [`VmFlowGraph`] and queue continuations for the branch
//! targets they resolve. A task runs to a terminal state before the next one is dequeued.

use crate::address::VmAddress;
use crate::backend::{Backend, CpuContext};
use crate::cache::{HandlerCache, HandlerRange};
use crate::cfg_ir::{EdgeKind, VmFlowGraph, event_counts};
use crate::config::BuildConfig;
use crate::detection::{Classification, classify, detect_vm_entry, is_push_key, probe_vm_entry};
use crate::instruction::{InstructionKind, VmInstruction};
use crate::ir::FunctionIr;
use crate::registers::{RegisterPair, VmRegisterSet};
use crate::result::{Error, Result};
use crate::trace::{Node, TraceFlowGraph, TraceWalker};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

mod task;

pub use task::{BuildStatus, BuildTask, TaskKind};

/// Counters of one or more [`FlowBuilder::build`] calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub tasks_run: usize,
    pub tasks_finished: usize,
    pub tasks_failed: usize,
    /// Tasks still queued when the task limit stopped the run.
    pub tasks_pending: usize,
    pub unknown_handlers: usize,
    /// Continuations that reached an address which already owned a block.
    pub revisited_blocks: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

/// Per-task walk state.
struct TaskState {
    /// Snapshot the walk started from; continuations replay the engine from here.
    context: CpuContext,
    from: Option<VmAddress>,
    walker: TraceWalker,
    /// Start of the block this task appends to.
    block: Option<VmAddress>,
    status: BuildStatus,
}

/// Drives discovery, classification and linking over a queue of build tasks.
#[derive(Debug)]
pub struct FlowBuilder {
    config: BuildConfig,
    backend: Backend,
    graph: VmFlowGraph,
    traces: TraceFlowGraph,
    cache: HandlerCache,
    registers: VmRegisterSet,
    queue: VecDeque<BuildTask>,
    save_area_base: u64,
    report: BuildReport,
}

impl FlowBuilder {
    pub fn new(backend: Backend, config: BuildConfig) -> Self {
        Self {
            config,
            backend,
            graph: VmFlowGraph::new(),
            traces: TraceFlowGraph::new(),
            cache: HandlerCache::new(),
            registers: VmRegisterSet::new(),
            queue: VecDeque::new(),
            save_area_base: 0,
            report: BuildReport::default(),
        }
    }

    /// Starts from previously persisted handler patterns.
    pub fn with_cache(mut self, cache: HandlerCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn graph(&self) -> &VmFlowGraph {
        &self.graph
    }

    pub fn cache(&self) -> &HandlerCache {
        &self.cache
    }

    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    pub fn into_parts(self) -> (VmFlowGraph, HandlerCache, BuildReport) {
        (self.graph, self.cache, self.report)
    }

    /// Recovers the VM code reachable from the native address `entry`.
    ///
    /// Only a lifting failure aborts the run; any other error fails the task it occurred in and
    /// the queue moves on.
    pub fn build(&mut self, entry: u64) -> Result<BuildReport> {
        self.queue.push_back(BuildTask::entry(entry, None));

        while let Some(task) = self.queue.pop_front() {
            if self.report.tasks_run >= self.config.max_tasks {
                self.queue.push_front(task);
                tracing::warn!(
                    limit = self.config.max_tasks,
                    pending = self.queue.len(),
                    "task limit reached, stopping"
                );
                break;
            }
            self.report.tasks_run += 1;
            tracing::info!(%task, queued = self.queue.len(), "task started");

            match self.run_task(task) {
                Ok(()) => {
                    self.report.tasks_finished += 1;
                    tracing::info!("task finished");
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    self.report.tasks_failed += 1;
                    tracing::warn!(error = %err, "task failed");
                }
            }
        }

        let (created, linked, revisited) = event_counts(&self.graph.trace);
        self.report.tasks_pending = self.queue.len();
        self.report.revisited_blocks = revisited;
        self.report.cache_hits = self.cache.hits();
        self.report.cache_misses = self.cache.misses();
        tracing::info!(
            blocks = created,
            edges = linked,
            revisited,
            tasks = self.report.tasks_run,
            failed = self.report.tasks_failed,
            unknown = self.report.unknown_handlers,
            "flow build complete"
        );
        Ok(self.report.clone())
    }

    fn run_task(&mut self, task: BuildTask) -> Result<()> {
        self.registers.clear();
        let context = match task.context {
            Some(context) => context,
            None => self.backend.engine.default_context(task.start),
        };
        let budget = match task.kind {
            TaskKind::Entry => self.config.entry_step_budget,
            TaskKind::JmpContinuation => self.config.continuation_step_budget,
        };
        let walker = TraceWalker::start(
            self.backend.engine.as_mut(),
            &mut self.traces,
            self.backend.decoder.as_ref(),
            &context,
            budget,
        )?;
        let mut state = TaskState {
            context,
            from: task.from,
            walker,
            block: None,
            status: task.kind.initial_status(),
        };

        loop {
            match state.status {
                BuildStatus::FindVmInit => self.find_vm_init(&mut state)?,
                BuildStatus::FinishVmInit => {
                    self.finish_vm_init(&mut state)?;
                    state.walker.move_to_next();
                }
                BuildStatus::FinishMatch => return Ok(()),
                BuildStatus::MatchError { address } => {
                    return Err(Error::ClassificationFailure { address });
                }
            }
        }
    }

    /// Pulls the next node and returns it, failing the task when the trace has run out.
    fn pull_node(&self, state: &mut TaskState) -> Result<Node> {
        if state.walker.is_walk_to_end() {
            return Err(Error::TraceExhausted {
                steps: state.walker.steps().len(),
            });
        }
        let node = state.walker.next_node(&self.traces);
        if node.is_empty() {
            return Err(Error::EmptyNode {
                index: state.walker.cursor(),
            });
        }
        Ok(node)
    }

    fn find_vm_init(&mut self, state: &mut TaskState) -> Result<()> {
        let mut node = self.pull_node(state)?;
        if is_push_key(&node, self.backend.decoder.as_ref()) {
            state.walker.move_to_next();
            node.append(state.walker.next_node(&self.traces));
        }
        let Some(first) = node.first_address() else {
            return Err(Error::EmptyNode {
                index: state.walker.cursor(),
            });
        };
        let ir = self
            .backend
            .lifter
            .lift_node(&node)
            .ok_or(Error::Pipeline { address: first })?;

        let Some(entry) = detect_vm_entry(&ir, self.backend.engine.default_stack_pointer()) else {
            tracing::trace!(node = format_args!("0x{:x}", first), "not a vm entry");
            state.walker.move_to_next();
            return Ok(());
        };

        self.save_area_base = entry.save_area_base;
        tracing::debug!(
            node = format_args!("0x{:x}", first),
            save_area = format_args!("0x{:x}", entry.save_area_base),
            "vm entry found"
        );
        let init = VmInstruction::new(
            VmAddress::new(first, first),
            0,
            InstructionKind::Init {
                saved: entry.saved,
            },
        );
        self.execute(state, &node, init)?;
        state.walker.move_to_next();
        Ok(())
    }

    fn finish_vm_init(&mut self, state: &mut TaskState) -> Result<()> {
        let node = self.pull_node(state)?;
        let Some((start, end)) = node.range() else {
            return Ok(());
        };
        let range = HandlerRange::new(start, end);
        let decoder = self.backend.decoder.as_ref();

        let cached = self.cache.get(range).cloned();
        let pattern = match cached {
            Some(pattern) if pattern.fits(&self.registers) => {
                tracing::debug!(
                    node = format_args!("0x{:x}", start),
                    handler = pattern.name(),
                    "cache hit"
                );
                pattern
            }
            cached => {
                // A cached pattern for another register pair is reclassified but stays cached.
                if let Some(stale) = &cached {
                    tracing::debug!(
                        node = format_args!("0x{:x}", start),
                        handler = stale.name(),
                        "cached pattern conflicts with selected registers"
                    );
                }
                let ir = self
                    .backend
                    .lifter
                    .lift_node(&node)
                    .ok_or(Error::Pipeline { address: start })?;
                match classify(&ir, &node, &self.registers, decoder) {
                    Classification::Handler(pattern) => {
                        if cached.is_none() {
                            self.cache.insert(range, pattern.clone());
                        }
                        pattern
                    }
                    Classification::EspGuard | Classification::Junk => {
                        tracing::debug!(node = format_args!("0x{:x}", start), "no vm effect");
                        return Ok(());
                    }
                    Classification::Unknown => return self.record_unknown(state, &node),
                }
            }
        };

        match pattern.instantiate(&node, &self.registers, decoder, self.save_area_base) {
            Some(instruction) => self.execute(state, &node, instruction),
            None => {
                tracing::debug!(
                    node = format_args!("0x{:x}", start),
                    handler = pattern.name(),
                    "pattern has no anchor in this occurrence"
                );
                Ok(())
            }
        }
    }

    fn record_unknown(&mut self, state: &mut TaskState, node: &Node) -> Result<()> {
        let address = node.vm_address(self.registers.code());
        self.report.unknown_handlers += 1;
        tracing::warn!(%address, steps = node.len(), "unknown handler");
        self.execute(
            state,
            node,
            VmInstruction::new(address, 0, InstructionKind::Unknown),
        )?;
        if self.config.diagnostic {
            state.status = BuildStatus::MatchError { address };
        }
        Ok(())
    }

    /// Appends `instruction` to the task's block, opening the block on the first instruction, and
    /// applies its effect on the walk.
    fn execute(
        &mut self,
        state: &mut TaskState,
        node: &Node,
        instruction: VmInstruction,
    ) -> Result<()> {
        let address = instruction.address;
        let block = match state.block {
            Some(block) => block,
            None => {
                if let Some(from) = state.from {
                    self.graph.link(from, address, EdgeKind::Flow);
                }
                if !self.graph.mark_visited(address) {
                    tracing::debug!(%address, "already visited");
                    state.status = BuildStatus::FinishMatch;
                    return Ok(());
                }
                self.graph.create_block(address)?;
                state.block = Some(address);
                address
            }
        };

        tracing::debug!("{instruction}");
        let kind = instruction.kind.clone();
        self.graph.push_instruction(block, instruction)?;

        match &kind {
            InstructionKind::Init { .. } => {
                let next = self.advance(&state.context, state.walker.position_after_current())?;
                self.enqueue_continuation(next, block);
                state.status = BuildStatus::FinishMatch;
            }
            InstructionKind::PopReg { pair, .. } => self.update_registers(pair.clone()),
            InstructionKind::Jmp => self.execute_jmp(state, node, block)?,
            InstructionKind::JmpConst => {
                let next = self.advance(&state.context, state.walker.position_after_current())?;
                self.enqueue_continuation(next, block);
            }
            InstructionKind::Exit { .. } => self.execute_exit(block, address)?,
            _ => {}
        }
        if kind.is_terminal() {
            state.status = BuildStatus::FinishMatch;
        }
        Ok(())
    }

    fn update_registers(&mut self, pair: RegisterPair) {
        if let Err(err) = self.registers.select(pair) {
            tracing::warn!(error = %err, "keeping selected vm registers");
        }
    }

    fn execute_jmp(&mut self, state: &TaskState, node: &Node, block: VmAddress) -> Result<()> {
        let targets = self.block_targets(block)?;
        match targets.as_slice() {
            [_] => {
                let next = self.advance(&state.context, state.walker.position_after_current())?;
                self.enqueue_continuation(next, block);
            }
            [first, second] => {
                let Some(stack) = self.registers.stack().map(str::to_owned) else {
                    tracing::warn!(%block, "two-way branch without a vm stack register");
                    self.registers.clear();
                    return Ok(());
                };
                let before_jmp = self.advance(&state.context, state.walker.cursor())?;
                for target in [*first, *second] {
                    let mut fork = before_jmp.clone();
                    if !fork.force_stack_slot(&stack, target) {
                        tracing::warn!(register = %stack, "cannot steer branch");
                        continue;
                    }
                    tracing::debug!(
                        %block,
                        target = format_args!("0x{:x}", target),
                        "forking vm branch"
                    );
                    let next = self.advance(&fork, node.len())?;
                    self.enqueue_continuation(next, block);
                }
            }
            _ => tracing::warn!(%block, targets = targets.len(), "unresolved vm branch"),
        }
        self.registers.clear();
        Ok(())
    }

    fn execute_exit(&mut self, block: VmAddress, exit: VmAddress) -> Result<()> {
        let ir = self.lift_block(block)?;
        let targets = self.backend.branches.guess_branch_targets(&ir);
        let [target] = targets.as_slice() else {
            tracing::debug!(%block, targets = targets.len(), "exit target unresolved");
            return Ok(());
        };
        let target = *target;
        if target == 0 {
            return Ok(());
        }

        if let Some(reentry) = self.backend.branches.guess_exit_call(&ir)
            && probe_vm_entry(&mut self.backend, reentry, self.config.probe_step_budget)?
        {
            self.graph.push_instruction(
                block,
                VmInstruction::new(exit, 0, InstructionKind::ExitCall { target }),
            )?;
            tracing::info!(
                call = format_args!("0x{:x}", target),
                reentry = format_args!("0x{:x}", reentry),
                "vm exit through call"
            );
            self.queue.push_back(BuildTask::entry(reentry, Some(block)));
        } else if !self.backend.classifier.is_known_vm_entry(target) {
            self.graph.link(block, VmAddress::native(target), EdgeKind::Native);
        }
        Ok(())
    }

    fn block_targets(&self, block: VmAddress) -> Result<Vec<u64>> {
        let ir = self.lift_block(block)?;
        Ok(self.backend.branches.guess_branch_targets(&ir))
    }

    /// Lifts the native code of a whole block. A block the lifter cannot handle is fatal.
    fn lift_block(&self, start: VmAddress) -> Result<FunctionIr> {
        let block = self
            .graph
            .block(start)
            .ok_or_else(|| Error::InvalidBlockStructure(format!("no block at {start}")))?;
        self.backend
            .lifter
            .lift_block(block)
            .ok_or(Error::Pipeline {
                address: start.native,
            })
    }

    /// Replays `steps` instructions from `context` and returns the resulting snapshot.
    fn advance(&mut self, context: &CpuContext, steps: usize) -> Result<CpuContext> {
        Ok(self.backend.engine.run(context, steps)?.context)
    }

    fn enqueue_continuation(&mut self, context: CpuContext, from: VmAddress) {
        let task = BuildTask::continuation(context, from);
        tracing::debug!(%task, "continuation queued");
        self.queue.push_back(task);
    }
}
