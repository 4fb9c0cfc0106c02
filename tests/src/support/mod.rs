//! Scripted VM backend for flow build scenarios.
//!
//! The engine interprets a tiny bytecode program: every bytecode op dispatches to the native
//! handler of its kind, whose instructions are stepped one by one so traces look like a real
//! register-based VM (ESI bytecode pointer, EBP operand stack).

pub mod handlers;

use devirt_core::backend::{
    AddressClassifier, BranchAnalyzer, CpuContext, Execution, ExecutionEngine, IrProvider,
};
use devirt_core::decoder::TableDecoder;
use devirt_core::ir::FunctionIr;
use devirt_core::trace::{Node, TraceStep};
use devirt_core::{Backend, VmBlock};
use handlers::Handler;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Native stack pointer of a fresh engine context.
pub const DEFAULT_ESP: u32 = 0x9000;
/// VM operand stack set up by the entry routine.
pub const VM_STACK: u32 = 0x8800;
/// Native code the exit handler returns to.
pub const EXIT_TARGET: u64 = 0x7000;
/// Where dispatch lands when the bytecode pointer runs off the program.
const UNMAPPED: u32 = 0xdead_0000;

/// Installs a test-writer subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// One bytecode instruction: handler plus its operand.
#[derive(Debug, Clone, Copy)]
struct Op {
    handler: Handler,
    operand: u64,
}

/// A bytecode program together with what the analyzers should report about it.
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    program: BTreeMap<u64, Op>,
    branches: HashMap<u64, Vec<u64>>,
    exit_calls: HashMap<u64, u64>,
    known_entries: HashSet<u64>,
}

impl Scenario {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `handler` at bytecode address `pc`.
    pub fn op(mut self, pc: u64, handler: Handler, operand: u64) -> Self {
        self.program.insert(pc, Op { handler, operand });
        self
    }

    /// Branch targets reported for the block starting at bytecode address `block`.
    pub fn branch(mut self, block: u64, targets: &[u64]) -> Self {
        self.branches.insert(block, targets.to_vec());
        self
    }

    /// Exit-call target reported for the block starting at bytecode address `block`.
    pub fn exit_call(mut self, block: u64, reentry: u64) -> Self {
        self.exit_calls.insert(block, reentry);
        self
    }

    pub fn known_entry(mut self, address: u64) -> Self {
        self.known_entries.insert(address);
        self
    }

    pub fn backend(&self) -> Backend {
        let mut decoder = TableDecoder::new();
        let mut lifted = HashMap::new();
        let mut layout = HashMap::new();
        for handler in Handler::ALL {
            let body = handlers::body(handler);
            for instruction in body.decoded {
                decoder.insert(instruction);
            }
            let last = body.addresses.len() - 1;
            for (index, address) in body.addresses.iter().enumerate() {
                let next = body.addresses.get(index + 1).copied();
                layout.insert(
                    *address,
                    Slot {
                        handler,
                        first: index == 0,
                        last: index == last,
                        next,
                    },
                );
            }
            if let (Some(ir), Some(first)) = (body.ir, body.addresses.first()) {
                lifted.insert(*first, ir);
            }
        }

        let engine = ScriptedVm {
            layout,
            program: self.program.clone(),
        };
        let branches = ScriptedBranches {
            targets: self.branches.clone(),
            exit_calls: self.exit_calls.clone(),
        };
        Backend::new(
            engine,
            ScriptedLifter { lifted },
            decoder,
            branches,
            KnownEntries(self.known_entries.clone()),
        )
    }
}

/// POP, PUSHIMM target, JMP at each of 0x100, 0x200 and 0x300; 0x100 branches two ways and both
/// arms join at 0x400, which leaves the VM.
pub fn diamond() -> Scenario {
    Scenario::new()
        .op(0x100, Handler::Pop, 0)
        .op(0x101, Handler::PushImm, 0x200)
        .op(0x102, Handler::Jmp, 0)
        .op(0x200, Handler::Pop, 0)
        .op(0x201, Handler::PushImm, 0x400)
        .op(0x202, Handler::Jmp, 0)
        .op(0x300, Handler::Pop, 0)
        .op(0x301, Handler::PushImm, 0x400)
        .op(0x302, Handler::Jmp, 0)
        .op(0x400, Handler::Pop, 0)
        .op(0x401, Handler::Exit, 0)
        .branch(0x100, &[0x200, 0x300])
        .branch(0x200, &[0x400])
        .branch(0x300, &[0x400])
        .branch(0x400, &[EXIT_TARGET])
}

/// Position of a native address inside its handler.
#[derive(Debug, Clone, Copy)]
struct Slot {
    handler: Handler,
    first: bool,
    last: bool,
    next: Option<u64>,
}

struct ScriptedVm {
    layout: HashMap<u64, Slot>,
    program: BTreeMap<u64, Op>,
}

impl ScriptedVm {
    fn current_op(&self, context: &CpuContext) -> Option<Op> {
        self.program
            .get(&u64::from(context.registers.esi))
            .copied()
    }

    fn dispatch(&self, context: &mut CpuContext) {
        context.registers.eip = match self.current_op(context) {
            Some(op) => op.handler.base() as u32,
            None => UNMAPPED,
        };
    }

    /// Executes the instruction at EIP. Returns false when EIP is outside every handler.
    fn step(&self, context: &mut CpuContext) -> bool {
        let Some(slot) = self.layout.get(&context.instruction_pointer()).copied() else {
            return false;
        };
        let operand = self.current_op(context).map_or(0, |op| op.operand);
        let regs = &mut context.registers;

        if slot.first && slot.handler == Handler::PushImm {
            regs.eax = operand as u32;
        }
        if !slot.last {
            regs.eip = slot.next.map_or(UNMAPPED, |next| next as u32);
            return true;
        }

        match slot.handler {
            Handler::Init => {
                regs.esi = self.program.keys().next().map_or(0, |pc| *pc as u32);
                regs.ebp = VM_STACK;
            }
            Handler::Pop | Handler::PopCopy => {
                regs.ebp = regs.ebp.wrapping_add(4);
                regs.esi = regs.esi.wrapping_add(1);
            }
            Handler::Odd | Handler::Unlifted => regs.esi = regs.esi.wrapping_add(1),
            Handler::PushImm => {
                regs.ebp = regs.ebp.wrapping_sub(4);
                regs.esi = regs.esi.wrapping_add(1);
                let top = u64::from(regs.ebp);
                context.write_u32(top, operand as u32);
            }
            Handler::Jmp => {
                let top = u64::from(regs.ebp);
                regs.ebp = regs.ebp.wrapping_add(4);
                let target = context.read_u32(top).unwrap_or(0);
                context.registers.esi = target;
            }
            Handler::Exit => {
                regs.eip = EXIT_TARGET as u32;
                return true;
            }
        }
        self.dispatch(context);
        true
    }
}

impl ExecutionEngine for ScriptedVm {
    fn default_context(&self, entry: u64) -> CpuContext {
        let mut context = CpuContext::at(entry);
        context.registers.esp = DEFAULT_ESP;
        context
    }

    fn default_stack_pointer(&self) -> u64 {
        u64::from(DEFAULT_ESP)
    }

    fn run(&mut self, context: &CpuContext, max_steps: usize) -> devirt_core::Result<Execution> {
        let mut context = context.clone();
        let mut steps = Vec::new();
        while steps.len() < max_steps {
            let step = TraceStep::new(context.instruction_pointer(), context.registers);
            if !self.step(&mut context) {
                break;
            }
            steps.push(step);
        }
        Ok(Execution { steps, context })
    }
}

/// Lifts handler occurrences by their first address; blocks lift to an empty body tagged with
/// the block's bytecode address so the branch analyzer can tell them apart.
struct ScriptedLifter {
    lifted: HashMap<u64, FunctionIr>,
}

impl IrProvider for ScriptedLifter {
    fn lift_node(&self, node: &Node) -> Option<FunctionIr> {
        self.lifted.get(&node.first_address()?).cloned()
    }

    fn lift_block(&self, block: &VmBlock) -> Option<FunctionIr> {
        Some(FunctionIr::new(block.start.vm))
    }
}

struct ScriptedBranches {
    targets: HashMap<u64, Vec<u64>>,
    exit_calls: HashMap<u64, u64>,
}

impl BranchAnalyzer for ScriptedBranches {
    fn guess_branch_targets(&self, ir: &FunctionIr) -> Vec<u64> {
        self.targets.get(&ir.entry).cloned().unwrap_or_default()
    }

    fn guess_exit_call(&self, ir: &FunctionIr) -> Option<u64> {
        self.exit_calls.get(&ir.entry).copied()
    }
}

struct KnownEntries(HashSet<u64>);

impl AddressClassifier for KnownEntries {
    fn is_known_vm_entry(&self, address: u64) -> bool {
        self.0.contains(&address)
    }
}
