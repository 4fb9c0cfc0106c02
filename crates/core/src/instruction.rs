//! Recovered VM instructions.

use crate::address::VmAddress;
use crate::registers::RegisterPair;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Segment override of a VM memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    Fs,
}

/// Value spilled by the VM entry routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SavedValue {
    Constant(u64),
    Register(String),
}

impl fmt::Display for SavedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SavedValue::Constant(value) => write!(f, "0x{value:x}"),
            SavedValue::Register(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionKind {
    /// VM entry; the 11 spilled values, slot `-4` first.
    Init { saved: Vec<SavedValue> },
    /// Push of the VM register at `offset` in the save area.
    PushReg { offset: u64 },
    PushImm { value: u64 },
    PushVsp,
    /// Pop into the VM register at `offset`; `pair` is the register pair this handler implies.
    PopReg { offset: u64, pair: RegisterPair },
    WriteVsp,
    ReadMem { segment: Option<Segment> },
    WriteMem,
    Add,
    Nor,
    Nand,
    Shl,
    Shr,
    Shld,
    Shrd,
    Mul,
    Cpuid,
    Jmp,
    JmpConst,
    Popfd,
    /// Leaves the VM restoring `restored` (register names in save-slot order).
    Exit { restored: Vec<String> },
    /// Leaves the VM through a native call that returns into virtualized code.
    ExitCall { target: u64 },
    Unknown,
}

impl InstructionKind {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            InstructionKind::Init { .. } => "vInit",
            InstructionKind::PushReg { .. } => "vPushReg",
            InstructionKind::PushImm { .. } => "vPushImm",
            InstructionKind::PushVsp => "vPushVsp",
            InstructionKind::PopReg { .. } => "vPopReg",
            InstructionKind::WriteVsp => "vWriteVsp",
            InstructionKind::ReadMem { .. } => "vReadMem",
            InstructionKind::WriteMem => "vWriteMem",
            InstructionKind::Add => "vAdd",
            InstructionKind::Nor => "vNor",
            InstructionKind::Nand => "vNand",
            InstructionKind::Shl => "vShl",
            InstructionKind::Shr => "vShr",
            InstructionKind::Shld => "vShld",
            InstructionKind::Shrd => "vShrd",
            InstructionKind::Mul => "vMul",
            InstructionKind::Cpuid => "vCpuid",
            InstructionKind::Jmp => "vJmp",
            InstructionKind::JmpConst => "vJmpConst",
            InstructionKind::Popfd => "vPopfd",
            InstructionKind::Exit { .. } => "vExit",
            InstructionKind::ExitCall { .. } => "vExitCall",
            InstructionKind::Unknown => "vUnknown",
        }
    }

    /// True for kinds that end the current block.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstructionKind::Jmp
                | InstructionKind::JmpConst
                | InstructionKind::Exit { .. }
                | InstructionKind::ExitCall { .. }
        )
    }
}

/// One recovered VM instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInstruction {
    pub address: VmAddress,
    /// Operand width in bytes, 0 when the kind has none.
    pub size: u8,
    pub kind: InstructionKind,
}

impl VmInstruction {
    pub fn new(address: VmAddress, size: u8, kind: InstructionKind) -> Self {
        Self {
            address,
            size,
            kind,
        }
    }
}

impl fmt::Display for VmInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.address, self.kind.mnemonic())?;
        if self.size != 0 {
            write!(f, "{}", u32::from(self.size) * 8)?;
        }
        match &self.kind {
            InstructionKind::PushReg { offset } | InstructionKind::PopReg { offset, .. } => {
                write!(f, " vR[0x{offset:x}]")
            }
            InstructionKind::PushImm { value } => write!(f, " 0x{value:x}"),
            InstructionKind::ReadMem {
                segment: Some(Segment::Fs),
            } => f.write_str(" fs"),
            InstructionKind::ExitCall { target } => write!(f, " 0x{target:x}"),
            InstructionKind::Init { saved } => {
                let saved: Vec<String> = saved.iter().map(ToString::to_string).collect();
                write!(f, " [{}]", saved.join(", "))
            }
            InstructionKind::Exit { restored } => write!(f, " [{}]", restored.join(", ")),
            _ => Ok(()),
        }
    }
}
