//! CPU snapshots exchanged with the execution engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 32-bit x86 general purpose register file plus EIP and EFLAGS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFile {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub eip: u32,
    pub eflags: u32,
}

/// Which part of a full register a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Full,
    Low16,
    Low8,
    High8,
}

impl RegisterFile {
    fn slot(&self, name: &str) -> Option<(u32, Part)> {
        let upper = name.to_ascii_uppercase();
        let (value, part) = match upper.as_str() {
            "EAX" => (self.eax, Part::Full),
            "AX" => (self.eax, Part::Low16),
            "AL" => (self.eax, Part::Low8),
            "AH" => (self.eax, Part::High8),
            "ECX" => (self.ecx, Part::Full),
            "CX" => (self.ecx, Part::Low16),
            "CL" => (self.ecx, Part::Low8),
            "CH" => (self.ecx, Part::High8),
            "EDX" => (self.edx, Part::Full),
            "DX" => (self.edx, Part::Low16),
            "DL" => (self.edx, Part::Low8),
            "DH" => (self.edx, Part::High8),
            "EBX" => (self.ebx, Part::Full),
            "BX" => (self.ebx, Part::Low16),
            "BL" => (self.ebx, Part::Low8),
            "BH" => (self.ebx, Part::High8),
            "ESP" => (self.esp, Part::Full),
            "SP" => (self.esp, Part::Low16),
            "EBP" => (self.ebp, Part::Full),
            "BP" => (self.ebp, Part::Low16),
            "ESI" => (self.esi, Part::Full),
            "SI" => (self.esi, Part::Low16),
            "EDI" => (self.edi, Part::Full),
            "DI" => (self.edi, Part::Low16),
            "EIP" => (self.eip, Part::Full),
            "EFLAGS" => (self.eflags, Part::Full),
            _ => return None,
        };
        Some((value, part))
    }

    fn full_mut(&mut self, name: &str) -> Option<&mut u32> {
        let upper = name.to_ascii_uppercase();
        let reg = match upper.as_str() {
            "EAX" | "AX" | "AL" | "AH" => &mut self.eax,
            "ECX" | "CX" | "CL" | "CH" => &mut self.ecx,
            "EDX" | "DX" | "DL" | "DH" => &mut self.edx,
            "EBX" | "BX" | "BL" | "BH" => &mut self.ebx,
            "ESP" | "SP" => &mut self.esp,
            "EBP" | "BP" => &mut self.ebp,
            "ESI" | "SI" => &mut self.esi,
            "EDI" | "DI" => &mut self.edi,
            "EIP" => &mut self.eip,
            "EFLAGS" => &mut self.eflags,
            _ => return None,
        };
        Some(reg)
    }

    /// Reads a register (or sub-register such as `AL`/`AX`) by name.
    pub fn read(&self, name: &str) -> Option<u64> {
        let (value, part) = self.slot(name)?;
        let value = match part {
            Part::Full => value,
            Part::Low16 => value & 0xffff,
            Part::Low8 => value & 0xff,
            Part::High8 => (value >> 8) & 0xff,
        };
        Some(u64::from(value))
    }

    /// Writes a register (or sub-register) by name. Returns false for unknown names.
    pub fn write(&mut self, name: &str, value: u64) -> bool {
        let Some((_, part)) = self.slot(name) else {
            return false;
        };
        let Some(reg) = self.full_mut(name) else {
            return false;
        };
        let value = value as u32;
        *reg = match part {
            Part::Full => value,
            Part::Low16 => (*reg & !0xffff) | (value & 0xffff),
            Part::Low8 => (*reg & !0xff) | (value & 0xff),
            Part::High8 => (*reg & !0xff00) | ((value & 0xff) << 8),
        };
        true
    }
}

/// Full CPU snapshot: registers plus the memory the engine has written so far.
///
/// `Clone` is the snapshot copy used when a VM branch forks into two continuations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuContext {
    pub registers: RegisterFile,
    pub memory: BTreeMap<u64, u8>,
}

impl CpuContext {
    /// Fresh context positioned at `entry`.
    pub fn at(entry: u64) -> Self {
        let mut context = Self::default();
        context.registers.eip = entry as u32;
        context
    }

    pub fn instruction_pointer(&self) -> u64 {
        u64::from(self.registers.eip)
    }

    pub fn read_u32(&self, address: u64) -> Option<u32> {
        let mut bytes = [0u8; 4];
        for (offset, byte) in bytes.iter_mut().enumerate() {
            *byte = *self.memory.get(&(address.wrapping_add(offset as u64)))?;
        }
        Some(u32::from_le_bytes(bytes))
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        for (offset, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.memory.insert(address.wrapping_add(offset as u64), byte);
        }
    }

    /// Overwrites the VM stack slot addressed by register `reg` with `value`.
    ///
    /// This is how a two-way VM branch is steered: the branch selector sits on top of the VM
    /// operand stack right before the jump handler consumes it.
    pub fn force_stack_slot(&mut self, reg: &str, value: u64) -> bool {
        let Some(slot) = self.registers.read(reg) else {
            return false;
        };
        self.write_u32(slot, value as u32);
        true
    }
}
