use crate::address::VmAddress;
use crate::backend::CpuContext;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a task was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Native code expected to enter the VM; the walk starts by looking for the entry routine.
    Entry,
    /// Snapshot right after a VM branch or entry; the walk starts at a handler.
    JmpContinuation,
}

impl TaskKind {
    pub fn initial_status(self) -> BuildStatus {
        match self {
            TaskKind::Entry => BuildStatus::FindVmInit,
            TaskKind::JmpContinuation => BuildStatus::FinishVmInit,
        }
    }
}

/// State of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    FindVmInit,
    FinishVmInit,
    FinishMatch,
    /// An unclassified handler in diagnostic mode.
    MatchError { address: VmAddress },
}

/// Unit of work in the flow builder queue.
#[derive(Debug, Clone)]
pub struct BuildTask {
    pub kind: TaskKind,
    /// Native address the walk starts at.
    pub start: u64,
    /// Snapshot to resume from. Entry tasks without one start from the engine default.
    pub context: Option<CpuContext>,
    /// Block the task continues from; linked to the first block the task produces.
    pub from: Option<VmAddress>,
}

impl BuildTask {
    pub fn entry(start: u64, from: Option<VmAddress>) -> Self {
        Self {
            kind: TaskKind::Entry,
            start,
            context: None,
            from,
        }
    }

    pub fn continuation(context: CpuContext, from: VmAddress) -> Self {
        Self {
            kind: TaskKind::JmpContinuation,
            start: context.instruction_pointer(),
            context: Some(context),
            from: Some(from),
        }
    }
}

impl fmt::Display for BuildTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@0x{:x}", self.kind, self.start)?;
        if let Some(from) = self.from {
            write!(f, " from {from}")?;
        }
        Ok(())
    }
}
