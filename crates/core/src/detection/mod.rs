//! The detection module recognizes what a lifted handler does: the VM entry routine that spills
//! the native context, and the handlers of the VM instruction set.

pub mod handler;
pub mod vm_entry;


pub use handler::{Classification, FALLBACK_MATCHERS, MATCHERS, MatchContext, Reject, classify};
pub use vm_entry::{
    SPILL_SLOTS, VmEntry, detect_vm_entry, extract_store_context, is_push_key, probe_vm_entry,
    resolve_save_area_base,
};
