//! Recognition of the VM entry routine and recovery of the VM register save area.
//!
//! Every entry into the VM spills the native context to the native stack in a fixed layout
//! (eleven dwords directly below the incoming ESP) and then carves the VM register area out of
//! the stack with a single `ESP - constant`.

use crate::backend::{Backend, InstructionDecoder};
use crate::decoder::{Mnemonic, OperandKind};
use crate::instruction::SavedValue;
use crate::ir::{FunctionIr, OpCode, Storage};
use crate::result::{Error, Result};
use crate::trace::{Node, TraceFlowGraph, TraceWalker};
use std::collections::BTreeMap;

/// Number of dwords the entry routine spills.
pub const SPILL_SLOTS: usize = 11;

/// Recognized VM entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEntry {
    /// Spilled values, slot `-4` first.
    pub saved: Vec<SavedValue>,
    /// Native address of the VM register save area under the engine's default stack.
    pub save_area_base: u64,
}

/// Collects the constants and registers copied to native stack slots `-4, -8, .. -44`.
///
/// Returns `None` unless all eleven slots are written.
pub fn extract_store_context(ir: &FunctionIr) -> Option<Vec<SavedValue>> {
    let mut spills: BTreeMap<i64, SavedValue> = BTreeMap::new();
    for op in ir.ops().iter().filter(|op| op.code == OpCode::Copy) {
        let (Some(output), Some(input)) = (op.output, op.inputs.first()) else {
            continue;
        };
        let Some(Storage::Stack(offset)) = ir.value(output).map(|value| &value.storage) else {
            continue;
        };
        let saved = match ir.value(*input).map(|value| &value.storage) {
            Some(Storage::Constant(value)) => SavedValue::Constant(*value),
            Some(Storage::Register(name)) => SavedValue::Register(name.clone()),
            _ => continue,
        };
        spills.insert(*offset, saved);
    }

    if spills.len() < SPILL_SLOTS {
        return None;
    }
    (1..=SPILL_SLOTS as i64)
        .map(|slot| spills.get(&(-4 * slot)).cloned())
        .collect()
}

/// Finds `ESP = PTRSUB(ESP_in, c)` at the return and maps it onto the engine's default stack.
pub fn resolve_save_area_base(ir: &FunctionIr, default_stack_pointer: u64) -> Option<u64> {
    for (name, value) in ir.return_bindings() {
        if name != "ESP" {
            continue;
        }
        let Some(mut def) = ir.defining_op(*value) else {
            continue;
        };
        if def.code == OpCode::Copy {
            let Some(source) = def.inputs.first().and_then(|input| ir.defining_op(*input)) else {
                continue;
            };
            def = source;
        }
        if def.code != OpCode::PtrSub {
            continue;
        }
        let (Some(base), Some(delta)) = (def.inputs.first(), def.inputs.get(1)) else {
            continue;
        };
        if ir.is_input(*base)
            && ir.register_name(*base) == Some("ESP")
            && let Some(delta) = ir.constant_value(*delta)
        {
            return Some(u64::from(
                (default_stack_pointer as u32).wrapping_add(delta as u32),
            ));
        }
    }
    None
}

/// Runs both entry checks on a lifted node.
pub fn detect_vm_entry(ir: &FunctionIr, default_stack_pointer: u64) -> Option<VmEntry> {
    let saved = extract_store_context(ir)?;
    let save_area_base = resolve_save_area_base(ir, default_stack_pointer)?;
    Some(VmEntry {
        saved,
        save_area_base,
    })
}

/// `push imm32; call rel32`: the key push that precedes a call into the entry routine.
pub fn is_push_key(node: &Node, decoder: &dyn InstructionDecoder) -> bool {
    let addresses: Vec<u64> = node.addresses().collect();
    let [push, call] = addresses.as_slice() else {
        return false;
    };
    let Some(push) = decoder.decode(*push) else {
        return false;
    };
    if push.mnemonic != Mnemonic::Push
        || !matches!(
            push.operands.first().map(|operand| &operand.kind),
            Some(OperandKind::Immediate(_))
        )
    {
        return false;
    }
    decoder
        .decode(*call)
        .is_some_and(|instruction| instruction.is_direct_call())
}

/// Short standalone walk from `address` telling whether it enters the VM.
///
/// Uses a private trace-flow graph so probing never disturbs the node grouping of the main run.
pub fn probe_vm_entry(backend: &mut Backend, address: u64, max_steps: usize) -> Result<bool> {
    let mut graph = TraceFlowGraph::new();
    let context = backend.engine.default_context(address);
    let mut walker = TraceWalker::start(
        backend.engine.as_mut(),
        &mut graph,
        backend.decoder.as_ref(),
        &context,
        max_steps,
    )?;
    if walker.is_walk_to_end() {
        return Ok(false);
    }
    let node = walker.next_node(&graph);
    let Some(first) = node.first_address() else {
        return Ok(false);
    };
    let ir = backend
        .lifter
        .lift_node(&node)
        .ok_or(Error::Pipeline { address: first })?;
    let found = extract_store_context(&ir).is_some();
    tracing::debug!(
        address = format_args!("0x{:x}", address),
        found,
        "vm entry probe"
    );
    Ok(found)
}
