pub mod address;
pub mod backend;
pub mod cache;
pub mod cfg_ir;
pub mod config;
pub mod decoder;
pub mod detection;
pub mod flow;
pub mod instruction;
pub mod ir;
pub mod pattern;
pub mod registers;
pub mod result;
pub mod trace;

pub use address::VmAddress;
pub use backend::Backend;
pub use cache::{HandlerCache, HandlerRange};
pub use cfg_ir::{EdgeKind, FlowEdge, VmBlock, VmFlowGraph};
pub use config::BuildConfig;
pub use flow::{BuildReport, FlowBuilder};
pub use instruction::{InstructionKind, VmInstruction};
pub use pattern::HandlerPattern;
pub use registers::{RegisterPair, VmRegisterSet};
pub use result::{Error, Result};

/// Recovers the VM control flow reachable from the native address `entry`.
///
/// Convenience wrapper over [`FlowBuilder`] for a single entry point and a fresh pattern cache.
///
/// # Example
/// ```rust,ignore
/// let backend = Backend::new(engine, lifter, ImageDecoder::new(base, image), branches, entries);
/// let (graph, report) = devirtualize(0x401000, backend, BuildConfig::default())?;
/// println!("{}", graph.to_dot());
/// ```
pub fn devirtualize(
    entry: u64,
    backend: Backend,
    config: BuildConfig,
) -> Result<(VmFlowGraph, BuildReport)> {
    config.validate()?;
    let mut builder = FlowBuilder::new(backend, config);
    let report = builder.build(entry)?;
    let (graph, _, _) = builder.into_parts();
    Ok((graph, report))
}
