//! Handler classification.
//!
//! A handler is recognized from the shape of its lifted IR: how many stores and loads it
//! performs, and where the pointers and values of those accesses come from. Matchers are tried
//! in a fixed order and the first one that accepts wins.

use crate::backend::InstructionDecoder;
use crate::decoder::{Mnemonic, load_access_size, store_access_size};
use crate::instruction::Segment;
use crate::ir::{FunctionIr, Op, OpCode, Origin, trace_origins};
use crate::pattern::{BinaryOp, DoubleShiftOp, HandlerPattern};
use crate::registers::{RegisterPair, VmRegisterSet};
use crate::trace::Node;
use std::collections::BTreeMap;

/// Why a matcher declined a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reject {
    /// The IR does not have the matcher's shape.
    Shape,
    /// The handler implies a register pair other than the selected one.
    RegisterMismatch(RegisterPair),
}

/// Outcome of classifying one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Handler(HandlerPattern),
    /// Native stack bounds check the VM performs before growing its stack.
    EspGuard,
    /// No memory traffic at all.
    Junk,
    Unknown,
}

/// Everything a matcher may look at.
pub struct MatchContext<'a> {
    pub ir: &'a FunctionIr,
    pub node: &'a Node,
    pub registers: &'a VmRegisterSet,
    pub decoder: &'a dyn InstructionDecoder,
    stores: Vec<&'a Op>,
    loads: Vec<&'a Op>,
}

impl<'a> MatchContext<'a> {
    pub fn new(
        ir: &'a FunctionIr,
        node: &'a Node,
        registers: &'a VmRegisterSet,
        decoder: &'a dyn InstructionDecoder,
    ) -> Self {
        Self {
            ir,
            node,
            registers,
            decoder,
            stores: ir.stores(),
            loads: ir.loads(),
        }
    }

    pub fn stores(&self) -> &[&'a Op] {
        &self.stores
    }

    pub fn loads(&self) -> &[&'a Op] {
        &self.loads
    }

    fn counts(&self) -> (usize, usize) {
        (self.stores.len(), self.loads.len())
    }

    fn stack(&self) -> Result<&'a str, Reject> {
        self.registers.stack().ok_or(Reject::Shape)
    }

    fn code(&self) -> Result<&'a str, Reject> {
        self.registers.code().ok_or(Reject::Shape)
    }

    /// Origins of a store's pointer and value.
    fn store_origins(&self, store: &Op) -> (Vec<Origin>, Vec<Origin>) {
        let origins = |index: usize| {
            store
                .inputs
                .get(index)
                .map(|value| trace_origins(self.ir, *value))
                .unwrap_or_default()
        };
        (origins(0), origins(1))
    }

    /// Register a load reads through directly.
    fn load_pointer_register(&self, load: &Op) -> Option<&'a str> {
        load.inputs
            .first()
            .and_then(|pointer| self.ir.register_name(*pointer))
    }

    fn load_size(&self, address: u64) -> u8 {
        load_access_size(self.decoder, address)
    }

    fn mnemonic_at(&self, address: u64) -> Option<Mnemonic> {
        self.decoder.decode(address).map(|instruction| instruction.mnemonic)
    }

    fn first_store(&self) -> Result<&'a Op, Reject> {
        self.stores.first().copied().ok_or(Reject::Shape)
    }
}

pub type Matcher = fn(&MatchContext) -> Result<HandlerPattern, Reject>;

/// Main battery, in priority order.
pub const MATCHERS: &[(&str, Matcher)] = &[
    ("pop_reg", match_pop_reg),
    ("push_reg", match_push_reg),
    ("push_imm", match_push_imm),
    ("push_vsp", match_push_vsp),
    ("mem_access", match_mem_access),
    ("binary", match_binary),
    ("double_shift", match_double_shift),
    ("cpuid", match_cpuid),
    ("mul", match_mul),
    ("jmp_const", match_jmp_const),
    ("jmp", match_jmp),
    ("write_vsp", match_write_vsp),
];

/// Tried only when the main battery rejects.
pub const FALLBACK_MATCHERS: &[(&str, Matcher)] =
    &[("popfd", match_popfd), ("exit", match_exit)];

/// Classifies one lifted handler occurrence. Does not touch `registers`; a handler that defines
/// the register pair returns it inside its pattern.
pub fn classify(
    ir: &FunctionIr,
    node: &Node,
    registers: &VmRegisterSet,
    decoder: &dyn InstructionDecoder,
) -> Classification {
    let ctx = MatchContext::new(ir, node, registers, decoder);

    for (name, matcher) in MATCHERS.iter().chain(FALLBACK_MATCHERS) {
        match matcher(&ctx) {
            Ok(pattern) => {
                tracing::debug!(
                    handler = format_args!("0x{:x}", ir.entry),
                    matcher = name,
                    "handler classified"
                );
                return Classification::Handler(pattern);
            }
            Err(Reject::RegisterMismatch(derived)) => {
                tracing::trace!(matcher = name, %derived, "register pair conflicts with selection");
            }
            Err(Reject::Shape) => {
                tracing::trace!(matcher = name, "rejected");
            }
        }
    }

    if is_esp_guard(&ctx) {
        return Classification::EspGuard;
    }
    if is_junk(&ctx) {
        return Classification::Junk;
    }
    Classification::Unknown
}

/// `vPopReg`: one value popped off the VM stack, stored into the native-stack register area
/// indexed by a bytecode operand.
pub fn match_pop_reg(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    if ctx.counts() != (1, 3) {
        return Err(Reject::Shape);
    }
    let store = ctx.first_store()?;
    let (dst, src) = ctx.store_origins(store);

    let [source] = src.as_slice() else {
        return Err(Reject::Shape);
    };
    if !source.via_memory {
        return Err(Reject::Shape);
    }
    let stack = source.name.as_str();

    let has_esp = dst.iter().any(|origin| origin.is("ESP", false));
    let code = dst
        .iter()
        .filter(|origin| origin.via_memory && origin.name != stack)
        .last();
    let (true, Some(code)) = (has_esp, code) else {
        return Err(Reject::Shape);
    };

    let pair = RegisterPair::new(code.name.clone(), stack);
    if let Some(selected) = ctx.registers.pair()
        && *selected != pair
    {
        return Err(Reject::RegisterMismatch(pair));
    }

    Ok(HandlerPattern::PopReg {
        size: source.address.map_or(0, |address| ctx.load_size(address)),
        store_address: store.address,
        pair,
    })
}

/// `vPushReg`: a register-area slot (addressed from ESP by a bytecode operand) pushed onto the
/// VM stack.
pub fn match_push_reg(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    let (stores, loads) = ctx.counts();
    if stores != 1 || loads < 3 {
        return Err(Reject::Shape);
    }
    let stack = ctx.stack()?;
    let code = ctx.code()?;
    let store = ctx.first_store()?;
    let (dst, src) = ctx.store_origins(store);

    let [target] = dst.as_slice() else {
        return Err(Reject::Shape);
    };
    if target.via_memory || target.name != stack {
        return Err(Reject::Shape);
    }

    let esp_load = src
        .iter()
        .filter(|origin| origin.is("ESP", true))
        .last()
        .ok_or(Reject::Shape)?;
    if !src.iter().any(|origin| origin.is(code, true)) {
        return Err(Reject::Shape);
    }

    let load_address = esp_load.address.ok_or(Reject::Shape)?;
    Ok(HandlerPattern::PushReg {
        size: ctx.load_size(load_address),
        load_address,
    })
}

/// `vPushImm`: an immediate read from the bytecode stream pushed onto the VM stack.
pub fn match_push_imm(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    let (stores, loads) = ctx.counts();
    if stores != 1 || loads < 2 {
        return Err(Reject::Shape);
    }
    let stack = ctx.stack()?;
    let code = ctx.code()?;
    let store = ctx.first_store()?;
    let (dst, src) = ctx.store_origins(store);

    let [target] = dst.as_slice() else {
        return Err(Reject::Shape);
    };
    if target.via_memory || target.name != stack {
        return Err(Reject::Shape);
    }
    if src
        .iter()
        .any(|origin| origin.via_memory && origin.name != code)
    {
        return Err(Reject::Shape);
    }

    let load = ctx.loads()[0];
    Ok(HandlerPattern::PushImm {
        size: ctx.load_size(load.address),
        load_address: load.address,
        store_address: store.address,
    })
}

/// `vPushVsp`: the VM stack pointer pushed onto itself.
pub fn match_push_vsp(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    if ctx.counts() != (1, 1) {
        return Err(Reject::Shape);
    }
    let stack = ctx.stack()?;
    let store = ctx.first_store()?;
    let (dst, src) = ctx.store_origins(store);
    let ([target], [source]) = (dst.as_slice(), src.as_slice()) else {
        return Err(Reject::Shape);
    };
    if !target.is(stack, false) || !source.is(stack, false) {
        return Err(Reject::Shape);
    }
    Ok(HandlerPattern::PushVsp {
        size: store_access_size(ctx.decoder, store.address),
    })
}

/// `vReadMem` / `vWriteMem`: memory access through an address popped off the VM stack.
pub fn match_mem_access(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    if ctx.counts() != (1, 3) {
        return Err(Reject::Shape);
    }
    let stack = ctx.stack()?;
    let store = ctx.first_store()?;
    let (dst, src) = ctx.store_origins(store);

    let [target] = dst.as_slice() else {
        return Err(Reject::Shape);
    };
    if target.name != stack {
        return Err(Reject::Shape);
    }

    let segment = match src.as_slice() {
        [value] if value.is(stack, true) => None,
        [segment, value] if value.is(stack, true) => {
            (segment.name == "FS_OFFSET").then_some(Segment::Fs)
        }
        _ => return Err(Reject::Shape),
    };

    let size = ctx.load_size(ctx.loads()[1].address);
    if target.via_memory {
        Ok(HandlerPattern::WriteMem { size })
    } else {
        Ok(HandlerPattern::ReadMem { size, segment })
    }
}

/// Shared shape of the two-store arithmetic handlers: result written through the bare stack
/// register, every memory operand read off the VM stack.
fn arithmetic_store<'a>(ctx: &MatchContext<'a>) -> Result<&'a Op, Reject> {
    let stack = ctx.stack()?;
    let store = ctx.first_store()?;
    let (dst, src) = ctx.store_origins(store);
    let [target] = dst.as_slice() else {
        return Err(Reject::Shape);
    };
    if !target.is(stack, false) {
        return Err(Reject::Shape);
    }
    if src
        .iter()
        .any(|origin| origin.via_memory && origin.name != stack)
    {
        return Err(Reject::Shape);
    }
    Ok(store)
}

/// `vAdd`, `vNor`, `vNand`, `vShl`, `vShr`.
pub fn match_binary(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    if ctx.counts() != (2, 3) {
        return Err(Reject::Shape);
    }
    let store = arithmetic_store(ctx)?;
    let op = store
        .inputs
        .get(1)
        .and_then(|value| ctx.ir.defining_op(*value))
        .and_then(|def| logic_pattern(ctx.ir, def))
        .ok_or(Reject::Shape)?;
    Ok(HandlerPattern::Binary {
        op,
        size: ctx.load_size(ctx.loads()[0].address),
    })
}

/// Walks the definition chain of a stored result down to the operation that gives the handler
/// its meaning.
fn logic_pattern(ir: &FunctionIr, start: &Op) -> Option<BinaryOp> {
    let def_code = |op: &Op, index: usize| {
        op.inputs
            .get(index)
            .and_then(|value| ir.defining_op(*value))
            .map(|def| def.code)
    };

    let mut worklist = vec![start];
    while let Some(op) = worklist.pop() {
        match op.code {
            OpCode::IntZext | OpCode::SubPiece => {
                worklist.extend(op.inputs.first().and_then(|value| ir.defining_op(*value)));
            }
            OpCode::Piece => {
                worklist.extend(op.inputs.iter().filter_map(|value| ir.defining_op(*value)));
            }
            OpCode::IntLeft if def_code(op, 0) == Some(OpCode::Load) => {
                return Some(BinaryOp::Shl);
            }
            OpCode::IntRight if def_code(op, 0) == Some(OpCode::Load) => {
                return Some(BinaryOp::Shr);
            }
            OpCode::IntAdd
                if def_code(op, 0) == Some(OpCode::Load)
                    && def_code(op, 1) == Some(OpCode::Load) =>
            {
                return Some(BinaryOp::Add);
            }
            OpCode::IntAnd
                if op
                    .inputs
                    .get(1)
                    .is_some_and(|value| ir.constant_value(*value).is_some()) =>
            {
                worklist.extend(op.inputs.first().and_then(|value| ir.defining_op(*value)));
            }
            OpCode::IntAnd
                if def_code(op, 0) == Some(OpCode::IntNegate)
                    && def_code(op, 1) == Some(OpCode::IntNegate) =>
            {
                return Some(BinaryOp::Nor);
            }
            OpCode::IntOr
                if def_code(op, 0) == Some(OpCode::IntNegate)
                    && def_code(op, 1) == Some(OpCode::IntNegate) =>
            {
                return Some(BinaryOp::Nand);
            }
            _ => {}
        }
    }
    None
}

/// `vShld`, `vShrd`: recognized by the native instruction computing the stored value.
pub fn match_double_shift(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    if ctx.counts() != (2, 4) {
        return Err(Reject::Shape);
    }
    let store = arithmetic_store(ctx)?;
    let def = store
        .inputs
        .get(1)
        .and_then(|value| ctx.ir.defining_op(*value))
        .ok_or(Reject::Shape)?;
    let op = match ctx.mnemonic_at(def.address) {
        Some(Mnemonic::Shld) => DoubleShiftOp::Shld,
        Some(Mnemonic::Shrd) => DoubleShiftOp::Shrd,
        _ => return Err(Reject::Shape),
    };
    Ok(HandlerPattern::DoubleShift {
        op,
        size: ctx.load_size(ctx.loads()[0].address),
    })
}

/// `vCpuid`: every stored value comes out of the CPUID result.
pub fn match_cpuid(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    if ctx.stores().len() < 4 {
        return Err(Reject::Shape);
    }
    for store in ctx.stores() {
        let (_, src) = ctx.store_origins(store);
        let first = src.first().ok_or(Reject::Shape)?;
        if !first.name.to_ascii_lowercase().contains("cpuid") {
            return Err(Reject::Shape);
        }
    }
    Ok(HandlerPattern::Cpuid)
}

/// `vMul`: product of the two top VM stack slots.
pub fn match_mul(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    if ctx.counts() != (3, 3) {
        return Err(Reject::Shape);
    }
    let stack = ctx.stack()?;
    let store = ctx.first_store()?;
    let (dst, src) = ctx.store_origins(store);
    let ([target], [_, _]) = (dst.as_slice(), src.as_slice()) else {
        return Err(Reject::Shape);
    };
    if target.name != stack || !src.iter().all(|origin| origin.is(stack, true)) {
        return Err(Reject::Shape);
    }
    let def = store
        .inputs
        .get(1)
        .and_then(|value| ctx.ir.defining_op(*value))
        .ok_or(Reject::Shape)?;
    if ctx.mnemonic_at(def.address) != Some(Mnemonic::Imul) {
        return Err(Reject::Shape);
    }
    Ok(HandlerPattern::Mul {
        size: ctx.load_size(ctx.loads()[0].address),
    })
}

/// `vJmpConst`: EIP recomputed from one bytecode operand and one register.
pub fn match_jmp_const(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    if ctx.counts() != (0, 1) {
        return Err(Reject::Shape);
    }
    let eip = ctx.ir.return_binding("EIP").ok_or(Reject::Shape)?;
    match trace_origins(ctx.ir, eip).as_slice() {
        [first, second] if first.via_memory != second.via_memory => Ok(HandlerPattern::JmpConst),
        _ => Err(Reject::Shape),
    }
}

/// `vJmp`: the new bytecode pointer popped off the VM stack.
pub fn match_jmp(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    let stack = ctx.stack()?;
    match (ctx.counts(), ctx.loads()) {
        ((0, 1), [load]) if ctx.load_pointer_register(load) == Some(stack) => {
            Ok(HandlerPattern::Jmp)
        }
        ((0, 2), [first, second]) if ctx.load_pointer_register(first) == Some(stack) => {
            let pointer = second.inputs.first().ok_or(Reject::Shape)?;
            match trace_origins(ctx.ir, *pointer).as_slice() {
                [origin] if origin.is(stack, true) => Ok(HandlerPattern::Jmp),
                _ => Err(Reject::Shape),
            }
        }
        _ => Err(Reject::Shape),
    }
}

/// `vWriteVsp`: the VM stack pointer replaced by a value popped off the VM stack.
pub fn match_write_vsp(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    if ctx.counts() != (0, 2) {
        return Err(Reject::Shape);
    }
    let stack = ctx.stack()?;
    let value = ctx.ir.return_binding(stack).ok_or(Reject::Shape)?;
    match trace_origins(ctx.ir, value).as_slice() {
        [origin] if origin.is(stack, true) => Ok(HandlerPattern::WriteVsp),
        _ => Err(Reject::Shape),
    }
}

/// `vPopfd`: top of the VM stack copied into EFLAGS.
pub fn match_popfd(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    let (stores, loads) = ctx.counts();
    if stores != 0 || loads == 0 {
        return Err(Reject::Shape);
    }
    let stack = ctx.stack()?;
    let load = ctx.loads()[0];
    if ctx.load_pointer_register(load) != Some(stack) {
        return Err(Reject::Shape);
    }
    let value = load.output.ok_or(Reject::Shape)?;
    let into_eflags = ctx.ir.uses(value).any(|user| {
        user.code == OpCode::Copy
            && user
                .output
                .and_then(|output| ctx.ir.register_name(output))
                .is_some_and(|name| name.eq_ignore_ascii_case("EFLAGS"))
    });
    if !into_eflags {
        return Err(Reject::Shape);
    }
    Ok(HandlerPattern::Popfd)
}

/// `vExit`: native registers reloaded from ten consecutive VM stack slots.
pub fn match_exit(ctx: &MatchContext) -> Result<HandlerPattern, Reject> {
    if ctx.loads().len() < 7 {
        return Err(Reject::Shape);
    }
    let ir = ctx.ir;
    let mut slots: BTreeMap<u64, String> = BTreeMap::new();

    for (name, value) in ir.return_bindings() {
        let Some(mut def) = ir.defining_op(*value) else {
            continue;
        };
        if def.code == OpCode::Load
            && let Some(pointer) = def.inputs.first()
            && !ir.is_input(*pointer)
        {
            let Some(pointer_def) = ir.defining_op(*pointer) else {
                continue;
            };
            def = pointer_def;
        }
        match def.code {
            OpCode::Load => {
                slots.insert(0, name.clone());
            }
            OpCode::PtrAdd => {
                let constant = |index: usize| {
                    def.inputs
                        .get(index)
                        .and_then(|value| ir.constant_value(*value))
                };
                if constant(2) == Some(4)
                    && let Some(slot) = constant(1)
                {
                    slots.insert(slot, name.clone());
                }
            }
            _ => {}
        }
    }

    let restored = (0..10)
        .map(|slot| slots.get(&slot).cloned())
        .collect::<Option<Vec<String>>>()
        .ok_or(Reject::Shape)?;
    Ok(HandlerPattern::Exit { restored })
}

/// `ESP - constant` with no memory traffic: the VM checking native stack room.
fn is_esp_guard(ctx: &MatchContext) -> bool {
    ctx.counts() == (0, 0)
        && ctx.ir.ops().iter().any(|op| {
            op.code == OpCode::PtrSub
                && op.inputs.first().is_some_and(|base| {
                    ctx.ir.is_input(*base) && ctx.ir.register_name(*base) == Some("ESP")
                })
        })
}

fn is_junk(ctx: &MatchContext) -> bool {
    ctx.counts() == (0, 0)
}
