//! Drives the scripting bridge over every function, then replays each
//! function's accumulated pass records in order.

use inkwell::module::Module;

use crate::metadata::MetadataStore;
use crate::passes::{control_flow, mbasub};
use crate::random::Prng;
use crate::registry::PassKind;
use crate::scripting::Bridge;

/// Call `RunOnFunction` for every non-declaration function, letting the
/// script accrue pass records via `z.RegisterPass`.
///
/// The name passed to the script is demangled first, mirroring the
/// reference's `llvm::demangle(f.getName())` call; a name that isn't mangled
/// (the common case for inkwell-authored test fixtures) passes through
/// `rustc_demangle::demangle` unchanged.
pub fn collect_function_passes<'ctx>(module: &Module<'ctx>, bridge: &mut Bridge<'ctx>) {
    let mut cursor = module.get_first_function();
    while let Some(function) = cursor {
        let next = function.get_next_function();
        if function.count_basic_blocks() > 0 {
            let raw_name = function.get_name().to_string_lossy().into_owned();
            let name = rustc_demangle::demangle(&raw_name).to_string();
            bridge.run_on_function(function, &name);
        }
        cursor = next;
    }
}

/// Replay every function's metadata record list, in insertion order.
pub fn replay<'ctx>(module: &Module<'ctx>, store: &MetadataStore<'ctx>, prng: &mut Prng) {
    let mut cursor = module.get_first_function();
    while let Some(function) = cursor {
        let next = function.get_next_function();
        let name = function.get_name().to_string_lossy().into_owned();

        store.for_each_pass(function, |record| {
            if record.iterations() <= 0 {
                tracing::warn!(function = %name, pass = %record.code_name, "PassIterations missing or <= 0; skipping record");
                return;
            }
            let Some(kind) = PassKind::from_code_name(&record.code_name) else {
                tracing::warn!(function = %name, pass = %record.code_name, "unknown pass code-name; skipping record");
                return;
            };
            match kind {
                PassKind::MbaSub => mbasub::run_on_function(function, record, prng),
                PassKind::BasicBlockSplitter => {
                    control_flow::basic_block_splitter_run_on_function(function, record)
                }
                PassKind::IndirectBranch => control_flow::indirect_branch_run_on_function(function, record),
                PassKind::SimpleIndirectBranch => {
                    control_flow::simple_indirect_branch_run_on_function(function, record)
                }
            }
        });

        cursor = next;
    }
}
