//! Native instruction decoding used by the handler matchers.
//!
//! Matchers only need a narrow view of an instruction: its mnemonic and the shape of its
//! operands. [`ImageDecoder`] produces that view from a mapped image with `iced-x86`;
//! [`TableDecoder`] replays a pre-decoded table (captured disassembly, test fixtures).

use crate::backend::RegisterFile;
use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind, Register};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use iced_x86::Mnemonic;

/// Decodes the native instruction at an address.
pub trait InstructionDecoder {
    fn decode(&self, address: u64) -> Option<DecodedInstruction>;
}

/// Single decoded native instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedInstruction {
    /// Address of the instruction
    pub address: u64,
    /// Encoded length in bytes
    pub length: usize,
    pub mnemonic: Mnemonic,
    pub operands: Vec<Operand>,
}

impl DecodedInstruction {
    pub fn new(address: u64, mnemonic: Mnemonic) -> Self {
        Self {
            address,
            length: 0,
            mnemonic,
            operands: Vec::new(),
        }
    }

    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    /// Memory operand at `index`, if that operand accesses memory.
    pub fn memory_operand(&self, index: usize) -> Option<(&MemoryOperand, u8)> {
        match self.operands.get(index) {
            Some(Operand {
                kind: OperandKind::Memory(mem),
                size,
            }) => Some((mem, *size)),
            _ => None,
        }
    }

    /// Register operand name at `index`, if that operand is a register.
    pub fn register_operand(&self, index: usize) -> Option<&str> {
        match self.operands.get(index) {
            Some(Operand {
                kind: OperandKind::Register(name),
                ..
            }) => Some(name.as_str()),
            _ => None,
        }
    }

    /// `call rel32`: a direct call with an immediate target.
    pub fn is_direct_call(&self) -> bool {
        self.mnemonic == Mnemonic::Call
            && matches!(
                self.operands.first(),
                Some(Operand {
                    kind: OperandKind::Immediate(_),
                    ..
                })
            )
    }

    /// `ret` or a jump through a register/memory operand: the shape VM handlers dispatch with.
    pub fn is_dispatch(&self) -> bool {
        match self.mnemonic {
            Mnemonic::Ret => true,
            Mnemonic::Jmp => !matches!(
                self.operands.first(),
                Some(Operand {
                    kind: OperandKind::Immediate(_),
                    ..
                })
            ),
            _ => false,
        }
    }
}

/// One operand with its access size in bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    pub size: u8,
}

impl Operand {
    pub fn register(name: impl Into<String>, size: u8) -> Self {
        Self {
            kind: OperandKind::Register(name.into()),
            size,
        }
    }

    pub fn memory(mem: MemoryOperand, size: u8) -> Self {
        Self {
            kind: OperandKind::Memory(mem),
            size,
        }
    }

    pub fn immediate(value: u64, size: u8) -> Self {
        Self {
            kind: OperandKind::Immediate(value),
            size,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OperandKind {
    Register(String),
    Memory(MemoryOperand),
    /// Immediates and direct branch targets.
    Immediate(u64),
}

/// `segment:[base + index * scale + displacement]`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOperand {
    /// Explicit segment override, if any.
    pub segment: Option<String>,
    pub base: Option<String>,
    pub index: Option<String>,
    pub scale: u32,
    pub displacement: i64,
}

impl MemoryOperand {
    pub fn based(base: impl Into<String>) -> Self {
        Self {
            base: Some(base.into()),
            scale: 1,
            ..Default::default()
        }
    }

    pub fn with_index(mut self, index: impl Into<String>, scale: u32) -> Self {
        self.index = Some(index.into());
        self.scale = scale;
        self
    }

    pub fn with_displacement(mut self, displacement: i64) -> Self {
        self.displacement = displacement;
        self
    }

    /// Computes the 32-bit effective address against a register snapshot. Segment bases are not
    /// modelled.
    pub fn effective_address(&self, registers: &RegisterFile) -> Option<u64> {
        let mut address = self.displacement as u32;
        if let Some(base) = &self.base {
            address = address.wrapping_add(registers.read(base)? as u32);
        }
        if let Some(index) = &self.index {
            let scaled = (registers.read(index)? as u32).wrapping_mul(self.scale.max(1));
            address = address.wrapping_add(scaled);
        }
        Some(u64::from(address))
    }
}

/// Decodes straight from a mapped image using `iced-x86`.
#[derive(Debug, Clone)]
pub struct ImageDecoder {
    base: u64,
    bytes: Vec<u8>,
    bitness: u32,
}

impl ImageDecoder {
    /// Image mapped at `base`, decoded as 32-bit code.
    pub fn new(base: u64, bytes: Vec<u8>) -> Self {
        Self::with_bitness(base, bytes, 32)
    }

    pub fn with_bitness(base: u64, bytes: Vec<u8>, bitness: u32) -> Self {
        Self {
            base,
            bytes,
            bitness,
        }
    }

    fn convert(instruction: &Instruction) -> DecodedInstruction {
        let mut decoded = DecodedInstruction::new(instruction.ip(), instruction.mnemonic());
        decoded.length = instruction.len();
        for index in 0..instruction.op_count() {
            let operand = match instruction.op_kind(index) {
                OpKind::Register => {
                    let reg = instruction.op_register(index);
                    Operand::register(register_name(reg), reg.size() as u8)
                }
                OpKind::Memory => {
                    let segment = match instruction.segment_prefix() {
                        Register::None => None,
                        reg => Some(register_name(reg)),
                    };
                    let mem = MemoryOperand {
                        segment,
                        base: optional_register(instruction.memory_base()),
                        index: optional_register(instruction.memory_index()),
                        scale: instruction.memory_index_scale(),
                        displacement: instruction.memory_displacement64() as i64,
                    };
                    Operand::memory(mem, instruction.memory_size().size() as u8)
                }
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    Operand::immediate(
                        instruction.near_branch_target(),
                        branch_width(instruction.op_kind(index)),
                    )
                }
                kind @ (OpKind::Immediate8
                | OpKind::Immediate8_2nd
                | OpKind::Immediate16
                | OpKind::Immediate32
                | OpKind::Immediate64
                | OpKind::Immediate8to16
                | OpKind::Immediate8to32
                | OpKind::Immediate8to64
                | OpKind::Immediate32to64) => {
                    Operand::immediate(instruction.immediate(index), immediate_size(kind))
                }
                // Far branches and implicit string operands carry nothing the matchers read.
                _ => continue,
            };
            decoded.operands.push(operand);
        }
        decoded
    }
}

impl InstructionDecoder for ImageDecoder {
    fn decode(&self, address: u64) -> Option<DecodedInstruction> {
        let offset = usize::try_from(address.checked_sub(self.base)?).ok()?;
        let window = self.bytes.get(offset..)?;
        if window.is_empty() {
            return None;
        }
        let mut decoder = Decoder::with_ip(self.bitness, window, address, DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            tracing::debug!(
                address = format_args!("0x{:x}", address),
                "decoder: invalid instruction"
            );
            return None;
        }
        Some(Self::convert(&instruction))
    }
}

fn register_name(reg: Register) -> String {
    format!("{reg:?}").to_ascii_uppercase()
}

fn optional_register(reg: Register) -> Option<String> {
    (reg != Register::None).then(|| register_name(reg))
}

fn branch_width(kind: OpKind) -> u8 {
    match kind {
        OpKind::NearBranch16 => 2,
        OpKind::NearBranch64 => 8,
        _ => 4,
    }
}

fn immediate_size(kind: OpKind) -> u8 {
    match kind {
        OpKind::Immediate8 | OpKind::Immediate8_2nd => 1,
        OpKind::Immediate16 | OpKind::Immediate8to16 => 2,
        OpKind::Immediate32 | OpKind::Immediate8to32 => 4,
        _ => 8,
    }
}

/// Decoder backed by a pre-decoded table.
#[derive(Debug, Clone, Default)]
pub struct TableDecoder {
    table: HashMap<u64, DecodedInstruction>,
}

impl TableDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instruction: DecodedInstruction) {
        self.table.insert(instruction.address, instruction);
    }

    pub fn with(mut self, instruction: DecodedInstruction) -> Self {
        self.insert(instruction);
        self
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl InstructionDecoder for TableDecoder {
    fn decode(&self, address: u64) -> Option<DecodedInstruction> {
        self.table.get(&address).cloned()
    }
}

/// Access size of the memory operand in position 1 (the source of a load such as
/// `mov eax, dword ptr [ebp]`), or 0 when there is none.
pub fn load_access_size(decoder: &dyn InstructionDecoder, address: u64) -> u8 {
    decoder
        .decode(address)
        .and_then(|instruction| instruction.memory_operand(1).map(|(_, size)| size))
        .unwrap_or(0)
}

/// Access size of the memory operand in position 0 (the destination of a store), or 0.
pub fn store_access_size(decoder: &dyn InstructionDecoder, address: u64) -> u8 {
    decoder
        .decode(address)
        .and_then(|instruction| instruction.memory_operand(0).map(|(_, size)| size))
        .unwrap_or(0)
}
