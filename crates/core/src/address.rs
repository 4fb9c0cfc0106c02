//! Positions in the VM bytecode stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A VM instruction position: the native address of the handler occurrence paired with the
/// bytecode pointer value the handler was dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VmAddress {
    /// Native address of the first instruction of the handler occurrence.
    pub native: u64,
    /// Value of the VM code register at that point.
    pub vm: u64,
}

impl VmAddress {
    pub const fn new(native: u64, vm: u64) -> Self {
        Self { native, vm }
    }

    /// Address of a non-virtualized location (no bytecode pointer).
    pub const fn native(native: u64) -> Self {
        Self { native, vm: 0 }
    }

    /// True for locations outside the VM.
    pub fn is_native(&self) -> bool {
        self.vm == 0
    }
}

impl fmt::Display for VmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}:0x{:x}", self.native, self.vm)
    }
}
