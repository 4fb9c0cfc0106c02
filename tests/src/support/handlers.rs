//! Native handler bodies of the scripted VM, as the lifter and decoder see them.
//!
//! Code register ESI, stack register EBP. Every handler ends in a `ret` that dispatches to the
//! next handler.

use devirt_core::decoder::{DecodedInstruction, MemoryOperand, Mnemonic, Operand};
use devirt_core::ir::{FunctionIr, OpCode, Storage, ValueId};

/// Handler kinds the scripted VM implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handler {
    /// Entry routine: spills the native context and carves the VM register area.
    Init,
    Pop,
    /// Same body as `Pop`, mapped at another address.
    PopCopy,
    /// Pushes its operand; a `Jmp` right after it branches to that operand.
    PushImm,
    Jmp,
    Exit,
    /// One store of a constant: matches no handler kind.
    Odd,
    /// Native code the lifter has no IR for.
    Unlifted,
}

impl Handler {
    pub const ALL: [Handler; 8] = [
        Handler::Init,
        Handler::Pop,
        Handler::PopCopy,
        Handler::PushImm,
        Handler::Jmp,
        Handler::Exit,
        Handler::Odd,
        Handler::Unlifted,
    ];

    pub fn base(self) -> u64 {
        match self {
            Handler::Init => 0x1000,
            Handler::Pop => 0x2000,
            Handler::PopCopy => 0x2800,
            Handler::PushImm => 0x3000,
            Handler::Jmp => 0x4000,
            Handler::Exit => 0x5000,
            Handler::Odd => 0x6000,
            Handler::Unlifted => 0x6800,
        }
    }
}

/// Lifted body of one handler plus the decoded instructions its matchers consult.
pub struct HandlerBody {
    pub ir: Option<FunctionIr>,
    pub decoded: Vec<DecodedInstruction>,
    /// Native addresses in execution order; the last one is the dispatching `ret`.
    pub addresses: Vec<u64>,
}

struct Body {
    ir: FunctionIr,
    decoded: Vec<DecodedInstruction>,
}

impl Body {
    fn new(at: u64) -> Self {
        Self {
            ir: FunctionIr::new(at),
            decoded: Vec::new(),
        }
    }

    fn load(&mut self, address: u64, pointer: ValueId, mem: MemoryOperand, size: u8) -> ValueId {
        self.decoded.push(
            DecodedInstruction::new(address, Mnemonic::Mov)
                .with_operand(Operand::register("EAX", size))
                .with_operand(Operand::memory(mem, size)),
        );
        self.ir.load(address, pointer, size)
    }

    fn store(&mut self, address: u64, pointer: ValueId, value: ValueId, mem: MemoryOperand) {
        self.decoded.push(
            DecodedInstruction::new(address, Mnemonic::Mov)
                .with_operand(Operand::memory(mem, 4))
                .with_operand(Operand::register("EAX", 4)),
        );
        self.ir.store(address, pointer, value);
    }

    fn finish(mut self) -> HandlerBody {
        let mut addresses: Vec<u64> = self.ir.ops().iter().map(|op| op.address).collect();
        addresses.sort_unstable();
        addresses.dedup();
        if let Some(last) = addresses.last() {
            self.decoded
                .push(DecodedInstruction::new(*last, Mnemonic::Ret));
        }
        HandlerBody {
            ir: Some(self.ir),
            decoded: self.decoded,
            addresses,
        }
    }
}

fn code_slot() -> MemoryOperand {
    MemoryOperand::based("ESI")
}

fn stack_slot() -> MemoryOperand {
    MemoryOperand::based("EBP")
}

pub fn body(handler: Handler) -> HandlerBody {
    let at = handler.base();
    match handler {
        Handler::Init => init(at),
        Handler::Pop | Handler::PopCopy => pop(at),
        Handler::PushImm => push_imm(at),
        Handler::Jmp => jmp(at),
        Handler::Exit => exit(at),
        Handler::Odd => odd(at),
        Handler::Unlifted => HandlerBody {
            ir: None,
            decoded: vec![DecodedInstruction::new(at + 1, Mnemonic::Ret)],
            addresses: vec![at, at + 1],
        },
    }
}

fn init(at: u64) -> HandlerBody {
    let mut b = Body::new(at);
    let mut values = Vec::new();
    for name in ["EFLAGS", "EDI", "ESI", "EBP", "EBX", "EDX", "ECX", "EAX"] {
        values.push(b.ir.input(name, 4));
    }
    for constant in [0x1234_5678, 0x40_0000, 0] {
        values.push(b.ir.constant(constant, 4));
    }
    for (index, value) in values.into_iter().enumerate() {
        let offset = -4 * (index as i64 + 1);
        b.ir.copy_to(at + index as u64, value, Storage::Stack(offset));
    }
    let esp = b.ir.input("ESP", 4);
    let delta = b.ir.constant(0xffff_ffd0, 4);
    let carved = b.ir.emit(at + 0x20, OpCode::PtrSub, &[esp, delta], 4);
    b.ir.ret(at + 0x24, &[("ESP", carved)]);
    b.finish()
}

fn pop(at: u64) -> HandlerBody {
    let mut b = Body::new(at);
    let (esi, ebp, esp) = (b.ir.input("ESI", 4), b.ir.input("EBP", 4), b.ir.input("ESP", 4));
    let (one, four) = (b.ir.constant(1, 4), b.ir.constant(4, 4));

    let index = b.load(at, esi, code_slot(), 1);
    let value = b.load(at + 3, ebp, stack_slot(), 4);
    let wide = b.ir.emit(at + 6, OpCode::IntZext, &[index], 4);
    let slot = b.ir.emit(at + 6, OpCode::PtrAdd, &[esp, wide, one], 4);
    b.store(
        at + 9,
        slot,
        value,
        MemoryOperand::based("ESP").with_index("EAX", 1),
    );
    let code = b.ir.emit(at + 12, OpCode::IntAdd, &[esi, one], 4);
    let next = b.load(at + 12, code, code_slot().with_displacement(1), 4);
    let stack = b.ir.emit(at + 15, OpCode::IntAdd, &[ebp, four], 4);
    b.ir
        .ret(at + 18, &[("ESI", code), ("EBP", stack), ("EIP", next)]);
    b.finish()
}

/// Index of the store in [`push_imm`], where EAX holds the pushed value.
pub const PUSH_IMM_STORE: u64 = 6;

fn push_imm(at: u64) -> HandlerBody {
    let mut b = Body::new(at);
    let (esi, ebp) = (b.ir.input("ESI", 4), b.ir.input("EBP", 4));
    let four = b.ir.constant(4, 4);

    let imm = b.load(at, esi, code_slot(), 4);
    let stack = b.ir.emit(at + 3, OpCode::IntSub, &[ebp, four], 4);
    b.store(at + PUSH_IMM_STORE, stack, imm, stack_slot());
    let code = b.ir.emit(at + 9, OpCode::IntAdd, &[esi, four], 4);
    let next = b.load(at + 12, code, code_slot().with_displacement(4), 4);
    b.ir
        .ret(at + 15, &[("ESI", code), ("EBP", stack), ("EIP", next)]);
    b.finish()
}

fn jmp(at: u64) -> HandlerBody {
    let mut b = Body::new(at);
    let ebp = b.ir.input("EBP", 4);
    let (four, dispatcher) = (b.ir.constant(4, 4), b.ir.constant(0x40_1000, 4));

    let target = b.load(at, ebp, stack_slot(), 4);
    let stack = b.ir.emit(at + 3, OpCode::IntAdd, &[ebp, four], 4);
    b.ir
        .ret(at + 6, &[("ESI", target), ("EBP", stack), ("EIP", dispatcher)]);
    b.finish()
}

/// Restore order of the exit handler, one register per stack slot.
pub const EXIT_REGISTERS: [&str; 10] = [
    "EDI", "ESI", "EBP", "EBX", "EDX", "ECX", "EAX", "EFLAGS", "ESP", "EIP",
];

fn exit(at: u64) -> HandlerBody {
    let mut b = Body::new(at);
    let ebp = b.ir.input("EBP", 4);
    let four = b.ir.constant(4, 4);

    let mut bindings = Vec::new();
    for (slot, name) in EXIT_REGISTERS.iter().enumerate() {
        let slot = slot as u64;
        let address = at + slot * 3;
        let value = if slot == 0 {
            b.load(address, ebp, stack_slot(), 4)
        } else {
            let index = b.ir.constant(slot, 4);
            let pointer = b.ir.emit(address, OpCode::PtrAdd, &[ebp, index, four], 4);
            b.load(
                address,
                pointer,
                stack_slot().with_displacement(slot as i64 * 4),
                4,
            )
        };
        bindings.push((*name, value));
    }
    b.ir.ret(at + 0x30, &bindings);
    b.finish()
}

fn odd(at: u64) -> HandlerBody {
    let mut b = Body::new(at);
    let (pointer, value) = (b.ir.constant(0x7_0000, 4), b.ir.constant(1, 4));
    b.store(at, pointer, value, MemoryOperand::based("EDI"));
    b.ir.ret(at + 2, &[]);
    b.finish()
}
