//! Stand-ins for the control-flow-shuffling passes named in spec.md's scope
//! note (`BasicBlockSplitter`, `IndirectBranch`, `SimpleIndirectBranch`).
//!
//! They are out of scope: String-Encryption schedules them on the
//! constructor it generates, and the registry/scheduler need a real
//! `run_on_function` to call, but the actual block-splitting/indirection
//! transforms are a different system's responsibility. Each entry point
//! here is a documented no-op.

use inkwell::values::FunctionValue;

use crate::metadata::PassRecord;

/// No-op: basic-block splitting is out of scope for this engine.
pub fn basic_block_splitter_run_on_function(_f: FunctionValue<'_>, _record: &PassRecord) {
    tracing::trace!("BasicBlockSplitter is out of scope; skipping transform");
}

/// No-op: indirect-branch rewriting is out of scope for this engine.
pub fn indirect_branch_run_on_function(_f: FunctionValue<'_>, _record: &PassRecord) {
    tracing::trace!("IndirectBranch is out of scope; skipping transform");
}

/// No-op: the lightweight indirect-branch variant is out of scope too.
pub fn simple_indirect_branch_run_on_function(_f: FunctionValue<'_>, _record: &PassRecord) {
    tracing::trace!("SimpleIndirectBranch is out of scope; skipping transform");
}
