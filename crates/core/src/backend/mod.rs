//! Collaborators the devirtualizer drives: execution engine, IR lifter, decoder, branch
//! analysis and the virtualization-entry classifier.
//!
//! None of them is implemented here beyond the decoder; callers plug their own emulator and
//! lifter in through these traits and bundle them in a [`Backend`].

pub mod context;

pub use crate::decoder::InstructionDecoder;
pub use context::{CpuContext, RegisterFile};

use crate::cfg_ir::VmBlock;
use crate::ir::FunctionIr;
use crate::result::Result;
use crate::trace::{Node, TraceStep};

/// Outcome of one engine run.
#[derive(Debug, Clone)]
pub struct Execution {
    /// One entry per executed instruction, registers captured before it executed.
    pub steps: Vec<TraceStep>,
    /// CPU state after the last executed instruction.
    pub context: CpuContext,
}

/// Single-steps native code from a snapshot.
pub trait ExecutionEngine {
    /// Context the engine would start a fresh run with at `entry`.
    fn default_context(&self, entry: u64) -> CpuContext;

    /// Initial stack pointer of [`ExecutionEngine::default_context`].
    fn default_stack_pointer(&self) -> u64;

    /// Executes at most `max_steps` instructions starting from `context`.
    ///
    /// A run that stops early (halt, fault, unmapped code) returns the steps it managed. Errors
    /// are reserved for engine failures that make the snapshot unusable.
    fn run(&mut self, context: &CpuContext, max_steps: usize) -> Result<Execution>;
}

/// Lifts native code to [`FunctionIr`].
pub trait IrProvider {
    /// Lifts one handler occurrence.
    fn lift_node(&self, node: &Node) -> Option<FunctionIr>;

    /// Lifts the native code behind a whole recovered block, used for branch analysis.
    fn lift_block(&self, block: &VmBlock) -> Option<FunctionIr>;
}

/// Tells whether an address is a known entry into virtualized code.
pub trait AddressClassifier {
    fn is_known_vm_entry(&self, address: u64) -> bool;
}

/// Resolves where a lifted block can transfer control to.
pub trait BranchAnalyzer {
    /// Zero, one or two concrete targets.
    fn guess_branch_targets(&self, ir: &FunctionIr) -> Vec<u64>;

    /// Native address the block calls back into when it leaves the VM through a call.
    fn guess_exit_call(&self, ir: &FunctionIr) -> Option<u64>;
}

/// Collaborators owned by one build.
pub struct Backend {
    pub engine: Box<dyn ExecutionEngine>,
    pub lifter: Box<dyn IrProvider>,
    pub decoder: Box<dyn InstructionDecoder>,
    pub branches: Box<dyn BranchAnalyzer>,
    pub classifier: Box<dyn AddressClassifier>,
}

impl Backend {
    pub fn new(
        engine: impl ExecutionEngine + 'static,
        lifter: impl IrProvider + 'static,
        decoder: impl InstructionDecoder + 'static,
        branches: impl BranchAnalyzer + 'static,
        classifier: impl AddressClassifier + 'static,
    ) -> Self {
        Self {
            engine: Box::new(engine),
            lifter: Box::new(lifter),
            decoder: Box::new(decoder),
            branches: Box::new(branches),
            classifier: Box::new(classifier),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}
