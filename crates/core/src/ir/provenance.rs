//! Backward provenance tracing over [`FunctionIr`].

use super::{FunctionIr, OpCode, Storage, ValueId};
use std::collections::HashSet;

/// A named location a value ultimately derives from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Register name. Values read from the incoming native stack report `ESP`.
    pub name: String,
    /// True when the value was read from memory addressed through `name`.
    pub via_memory: bool,
    /// Native address of the innermost load on the path, when `via_memory` is set.
    pub address: Option<u64>,
}

impl Origin {
    pub fn is(&self, name: &str, via_memory: bool) -> bool {
        self.via_memory == via_memory && self.name.eq_ignore_ascii_case(name)
    }
}

/// Resolves `value` to the registers it derives from.
///
/// A register-resident origin is a function input read directly; a memory-resident one is a
/// register used as the pointer of a load on the path. Origins come out in the order they are
/// reached walking operation inputs left to right. The same register read through two different
/// loads yields two origins.
pub fn trace_origins(ir: &FunctionIr, value: ValueId) -> Vec<Origin> {
    let mut origins: Vec<Origin> = Vec::new();
    let mut visited: HashSet<(ValueId, bool, Option<u64>)> = HashSet::new();
    let mut worklist = vec![(value, false, None::<u64>)];

    while let Some((current, via_memory, address)) = worklist.pop() {
        if !visited.insert((current, via_memory, address)) {
            continue;
        }

        let Some(op) = ir.defining_op(current) else {
            let Some(value) = ir.value(current) else {
                continue;
            };
            let name = match &value.storage {
                Storage::Register(name) => name.clone(),
                Storage::Stack(_) => "ESP".to_string(),
                Storage::Constant(_) | Storage::Temporary => continue,
            };
            let via_memory = via_memory || matches!(value.storage, Storage::Stack(_));
            if !origins.iter().any(|origin| {
                origin.via_memory == via_memory && origin.name == name && origin.address == address
            }) {
                origins.push(Origin {
                    name,
                    via_memory,
                    address,
                });
            }
            continue;
        };

        match op.code {
            OpCode::Load => {
                if let Some(pointer) = op.inputs.first() {
                    worklist.push((*pointer, true, Some(op.address)));
                }
            }
            _ => {
                for input in op.inputs.iter().rev() {
                    worklist.push((*input, via_memory, address));
                }
            }
        }
    }

    origins
}
