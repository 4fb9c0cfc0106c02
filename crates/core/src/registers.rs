//! VM register selection for the current epoch.

use crate::result::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Native registers the VM uses as bytecode pointer (`code`) and operand-stack pointer (`stack`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterPair {
    pub code: String,
    pub stack: String,
}

impl RegisterPair {
    pub fn new(code: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            stack: stack.into(),
        }
    }
}

impl fmt::Display for RegisterPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} stack={}", self.code, self.stack)
    }
}

/// Register selection scoped to one epoch (the span between two VM jumps).
///
/// Once a pair is selected, every pair derived later in the epoch must match it; a conflicting
/// pair is rejected and never replaces the selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmRegisterSet {
    selected: Option<RegisterPair>,
}

impl VmRegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set with `pair` already selected.
    pub fn selected(pair: RegisterPair) -> Self {
        Self {
            selected: Some(pair),
        }
    }

    pub fn is_selected(&self) -> bool {
        self.selected.is_some()
    }

    pub fn pair(&self) -> Option<&RegisterPair> {
        self.selected.as_ref()
    }

    /// Name of the bytecode pointer register, if selected.
    pub fn code(&self) -> Option<&str> {
        self.selected.as_ref().map(|pair| pair.code.as_str())
    }

    /// Name of the operand-stack pointer register, if selected.
    pub fn stack(&self) -> Option<&str> {
        self.selected.as_ref().map(|pair| pair.stack.as_str())
    }

    /// Adopts `pair` when nothing is selected yet. A matching pair is a no-op; a different pair is
    /// reported as a mismatch and leaves the selection untouched.
    pub fn select(&mut self, pair: RegisterPair) -> Result<(), Error> {
        match &self.selected {
            None => {
                self.selected = Some(pair);
                Ok(())
            }
            Some(current) if *current == pair => Ok(()),
            Some(current) => Err(Error::RegisterMismatch {
                selected: current.clone(),
                derived: pair,
            }),
        }
    }

    /// Drops the selection. Called when a VM jump ends the epoch.
    pub fn clear(&mut self) {
        self.selected = None;
    }
}
