//! Arena IR the lifter hands to the classifier.
//!
//! A [`FunctionIr`] is a flat list of operations over values. Every value records where it lives
//! (register, native stack slot, constant or temporary) and which operation defined it, which is
//! all the handler matchers need to walk dataflow backwards.

pub mod provenance;

pub use provenance::{Origin, trace_origins};

use serde::{Deserialize, Serialize};

/// Index of a value in its [`FunctionIr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub usize);

/// Index of an operation in its [`FunctionIr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub usize);

/// Where a value lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Storage {
    /// Native register, upper-case name (`ESI`, `FS_OFFSET`).
    Register(String),
    /// Native stack slot, offset relative to the incoming ESP.
    Stack(i64),
    Constant(u64),
    Temporary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub storage: Storage,
    /// Width in bytes.
    pub size: u8,
    /// Defining operation; `None` for function inputs and constants.
    pub def: Option<OpId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Copy,
    /// `inputs[0]` is the pointer.
    Load,
    /// `inputs[0]` is the pointer, `inputs[1]` the stored value.
    Store,
    IntAdd,
    IntSub,
    IntAnd,
    IntOr,
    IntXor,
    IntNegate,
    IntLeft,
    IntRight,
    IntSright,
    IntMult,
    IntZext,
    IntSext,
    SubPiece,
    Piece,
    /// `base + index * element_size`, inputs in that order.
    PtrAdd,
    /// `base - constant`.
    PtrSub,
    Return,
    /// Anything the matchers do not look into (flags, user-defined ops).
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    /// Native address of the instruction this operation was lifted from.
    pub address: u64,
    pub code: OpCode,
    pub inputs: Vec<ValueId>,
    pub output: Option<ValueId>,
}

/// Lifted handler or block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionIr {
    /// Address the IR was lifted from.
    pub entry: u64,
    values: Vec<Value>,
    ops: Vec<Op>,
    returns: Vec<(String, ValueId)>,
}

impl FunctionIr {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            ..Default::default()
        }
    }

    fn push_value(&mut self, storage: Storage, size: u8, def: Option<OpId>) -> ValueId {
        self.values.push(Value { storage, size, def });
        ValueId(self.values.len() - 1)
    }

    /// Incoming value of register `name`. Repeated calls return the same value.
    pub fn input(&mut self, name: &str, size: u8) -> ValueId {
        let storage = Storage::Register(name.to_ascii_uppercase());
        if let Some(index) = self
            .values
            .iter()
            .position(|value| value.def.is_none() && value.storage == storage)
        {
            return ValueId(index);
        }
        self.push_value(storage, size, None)
    }

    /// Incoming value of the native stack slot at `offset` from ESP.
    pub fn stack_input(&mut self, offset: i64, size: u8) -> ValueId {
        self.push_value(Storage::Stack(offset), size, None)
    }

    pub fn constant(&mut self, value: u64, size: u8) -> ValueId {
        self.push_value(Storage::Constant(value), size, None)
    }

    /// Appends an operation writing a fresh temporary.
    pub fn emit(&mut self, address: u64, code: OpCode, inputs: &[ValueId], size: u8) -> ValueId {
        self.emit_into(address, code, inputs, Storage::Temporary, size)
    }

    /// Appends an operation writing a value that lives in `storage`.
    pub fn emit_into(
        &mut self,
        address: u64,
        code: OpCode,
        inputs: &[ValueId],
        storage: Storage,
        size: u8,
    ) -> ValueId {
        let op = OpId(self.ops.len());
        let output = self.push_value(storage, size, Some(op));
        self.ops.push(Op {
            address,
            code,
            inputs: inputs.to_vec(),
            output: Some(output),
        });
        output
    }

    pub fn load(&mut self, address: u64, pointer: ValueId, size: u8) -> ValueId {
        self.emit(address, OpCode::Load, &[pointer], size)
    }

    pub fn store(&mut self, address: u64, pointer: ValueId, value: ValueId) -> OpId {
        self.ops.push(Op {
            address,
            code: OpCode::Store,
            inputs: vec![pointer, value],
            output: None,
        });
        OpId(self.ops.len() - 1)
    }

    /// `COPY value -> storage`.
    pub fn copy_to(&mut self, address: u64, value: ValueId, storage: Storage) -> ValueId {
        let size = self.value(value).map_or(0, |value| value.size);
        self.emit_into(address, OpCode::Copy, &[value], storage, size)
    }

    /// Terminates the function; `bindings` are the registers live at the return.
    pub fn ret(&mut self, address: u64, bindings: &[(&str, ValueId)]) -> OpId {
        self.returns = bindings
            .iter()
            .map(|(name, value)| (name.to_ascii_uppercase(), *value))
            .collect();
        self.ops.push(Op {
            address,
            code: OpCode::Return,
            inputs: bindings.iter().map(|(_, value)| *value).collect(),
            output: None,
        });
        OpId(self.ops.len() - 1)
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// `None` for an id that does not belong to this function.
    pub fn op(&self, id: OpId) -> Option<&Op> {
        self.ops.get(id.0)
    }

    /// `None` for an id that does not belong to this function.
    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id.0)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// LOAD operations in program order.
    pub fn loads(&self) -> Vec<&Op> {
        self.ops_with(OpCode::Load)
    }

    /// STORE operations in program order.
    pub fn stores(&self) -> Vec<&Op> {
        self.ops_with(OpCode::Store)
    }

    fn ops_with(&self, code: OpCode) -> Vec<&Op> {
        self.ops.iter().filter(|op| op.code == code).collect()
    }

    pub fn return_op(&self) -> Option<&Op> {
        self.ops.iter().rev().find(|op| op.code == OpCode::Return)
    }

    pub fn return_bindings(&self) -> &[(String, ValueId)] {
        &self.returns
    }

    /// Value bound to register `name` at the return.
    pub fn return_binding(&self, name: &str) -> Option<ValueId> {
        self.returns
            .iter()
            .find(|(reg, _)| reg.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }

    pub fn defining_op(&self, value: ValueId) -> Option<&Op> {
        self.value(value)?.def.and_then(|op| self.op(op))
    }

    pub fn register_name(&self, value: ValueId) -> Option<&str> {
        match &self.value(value)?.storage {
            Storage::Register(name) => Some(name.as_str()),
            _ => None,
        }
    }

    /// True for values flowing into the function (no definition, not a constant).
    pub fn is_input(&self, value: ValueId) -> bool {
        self.value(value).is_some_and(|value| {
            value.def.is_none() && !matches!(value.storage, Storage::Constant(_))
        })
    }

    pub fn constant_value(&self, value: ValueId) -> Option<u64> {
        match self.value(value)?.storage {
            Storage::Constant(constant) => Some(constant),
            _ => None,
        }
    }

    /// Operations reading `value`.
    pub fn uses(&self, value: ValueId) -> impl Iterator<Item = &Op> + '_ {
        self.ops
            .iter()
            .filter(move |op| op.inputs.contains(&value))
    }
}
