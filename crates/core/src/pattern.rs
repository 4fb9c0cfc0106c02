//! Handler patterns: what the classifier learned about a handler, independent of any single
//! occurrence.

use crate::backend::InstructionDecoder;
use crate::decoder::Mnemonic;
use crate::instruction::{InstructionKind, Segment, VmInstruction};
use crate::registers::{RegisterPair, VmRegisterSet};
use crate::trace::Node;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Nor,
    Nand,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoubleShiftOp {
    Shld,
    Shrd,
}

/// Classified handler. Addresses recorded here are native instruction addresses inside the
/// handler, used to pull operands out of each new occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerPattern {
    PopReg {
        size: u8,
        store_address: u64,
        pair: RegisterPair,
    },
    PushReg {
        size: u8,
        load_address: u64,
    },
    PushImm {
        size: u8,
        load_address: u64,
        store_address: u64,
    },
    PushVsp {
        size: u8,
    },
    ReadMem {
        size: u8,
        segment: Option<Segment>,
    },
    WriteMem {
        size: u8,
    },
    Binary {
        op: BinaryOp,
        size: u8,
    },
    DoubleShift {
        op: DoubleShiftOp,
        size: u8,
    },
    Mul {
        size: u8,
    },
    Cpuid,
    JmpConst,
    Jmp,
    WriteVsp,
    Popfd,
    Exit {
        restored: Vec<String>,
    },
}

impl HandlerPattern {
    pub fn name(&self) -> &'static str {
        match self {
            HandlerPattern::PopReg { .. } => "pop_reg",
            HandlerPattern::PushReg { .. } => "push_reg",
            HandlerPattern::PushImm { .. } => "push_imm",
            HandlerPattern::PushVsp { .. } => "push_vsp",
            HandlerPattern::ReadMem { .. } => "read_mem",
            HandlerPattern::WriteMem { .. } => "write_mem",
            HandlerPattern::Binary { .. } => "binary",
            HandlerPattern::DoubleShift { .. } => "double_shift",
            HandlerPattern::Mul { .. } => "mul",
            HandlerPattern::Cpuid => "cpuid",
            HandlerPattern::JmpConst => "jmp_const",
            HandlerPattern::Jmp => "jmp",
            HandlerPattern::WriteVsp => "write_vsp",
            HandlerPattern::Popfd => "popfd",
            HandlerPattern::Exit { .. } => "exit",
        }
    }

    /// Register pair implied by the handler, for patterns that define one.
    pub fn register_pair(&self) -> Option<&RegisterPair> {
        match self {
            HandlerPattern::PopReg { pair, .. } => Some(pair),
            _ => None,
        }
    }

    /// False when the pattern implies a register pair other than the one selected.
    pub fn fits(&self, registers: &VmRegisterSet) -> bool {
        match (self.register_pair(), registers.pair()) {
            (Some(derived), Some(selected)) => derived == selected,
            _ => true,
        }
    }

    /// Builds the instruction for one occurrence of this handler.
    ///
    /// Returns `None` when the occurrence does not contain the step an operand is read from, or
    /// when the pattern does not [fit](Self::fits) the selected registers.
    pub fn instantiate(
        &self,
        node: &Node,
        registers: &VmRegisterSet,
        decoder: &dyn InstructionDecoder,
        save_area_base: u64,
    ) -> Option<VmInstruction> {
        if !self.fits(registers) {
            return None;
        }
        let code = match self {
            HandlerPattern::PopReg { pair, .. } => Some(pair.code.as_str()),
            _ => registers.code(),
        };
        let address = node.vm_address(code);

        let (size, kind) = match self {
            HandlerPattern::PopReg {
                size,
                store_address,
                pair,
            } => {
                let step = node.step_at(*store_address)?;
                let instruction = decoder.decode(*store_address)?;
                if !matches!(
                    instruction.mnemonic,
                    Mnemonic::Mov | Mnemonic::Movzx | Mnemonic::Movsx
                ) {
                    return None;
                }
                let (memory, _) = instruction.memory_operand(0)?;
                let effective = memory.effective_address(&step.registers)?;
                let offset = save_area_offset(effective, save_area_base);
                (
                    *size,
                    InstructionKind::PopReg {
                        offset,
                        pair: pair.clone(),
                    },
                )
            }
            HandlerPattern::PushReg { size, load_address } => {
                let step = node.step_at(*load_address)?;
                let instruction = decoder.decode(*load_address)?;
                let (memory, _) = instruction.memory_operand(1)?;
                let effective = memory.effective_address(&step.registers)?;
                let offset = save_area_offset(effective, save_area_base);
                (*size, InstructionKind::PushReg { offset })
            }
            HandlerPattern::PushImm {
                size,
                store_address,
                ..
            } => {
                let step = node.step_at(*store_address)?;
                let instruction = decoder.decode(*store_address)?;
                let source = instruction.register_operand(1)?;
                let value = step.registers.read(source)?;
                (*size, InstructionKind::PushImm { value })
            }
            HandlerPattern::PushVsp { size } => (*size, InstructionKind::PushVsp),
            HandlerPattern::ReadMem { size, segment } => {
                (*size, InstructionKind::ReadMem { segment: *segment })
            }
            HandlerPattern::WriteMem { size } => (*size, InstructionKind::WriteMem),
            HandlerPattern::Binary { op, size } => {
                let kind = match op {
                    BinaryOp::Add => InstructionKind::Add,
                    BinaryOp::Nor => InstructionKind::Nor,
                    BinaryOp::Nand => InstructionKind::Nand,
                    BinaryOp::Shl => InstructionKind::Shl,
                    BinaryOp::Shr => InstructionKind::Shr,
                };
                (*size, kind)
            }
            HandlerPattern::DoubleShift { op, size } => {
                let kind = match op {
                    DoubleShiftOp::Shld => InstructionKind::Shld,
                    DoubleShiftOp::Shrd => InstructionKind::Shrd,
                };
                (*size, kind)
            }
            HandlerPattern::Mul { size } => (*size, InstructionKind::Mul),
            HandlerPattern::Cpuid => (0, InstructionKind::Cpuid),
            HandlerPattern::JmpConst => (0, InstructionKind::JmpConst),
            HandlerPattern::Jmp => (0, InstructionKind::Jmp),
            HandlerPattern::WriteVsp => (0, InstructionKind::WriteVsp),
            HandlerPattern::Popfd => (0, InstructionKind::Popfd),
            HandlerPattern::Exit { restored } => (
                0,
                InstructionKind::Exit {
                    restored: restored.clone(),
                },
            ),
        };

        Some(VmInstruction::new(address, size, kind))
    }
}

fn save_area_offset(effective: u64, save_area_base: u64) -> u64 {
    u64::from((effective as u32).wrapping_sub(save_area_base as u32))
}
