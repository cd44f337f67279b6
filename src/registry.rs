//! Static table mapping obfuscation type indices to pass descriptors.
//!
//! Declaration order is the contract: `ObfuscationType[name]` in scripts is
//! literally this enum's discriminant, so never reorder existing variants —
//! append new ones at the end.

use inkwell::values::FunctionValue;
use strum::{EnumIter, IntoEnumIterator};

use crate::consts::OPT_PASS_ITERATIONS;
use crate::metadata::MetadataStore;

/// Every pass the registry knows how to schedule.
///
/// `BasicBlockSplitter`, `IndirectBranch` and `SimpleIndirectBranch` are the
/// control-flow-shuffling passes named in the scope note as external
/// collaborators: they are fully nameable/schedulable here so the registry
/// and scheduler contracts hold end to end, but their transforms are not
/// implemented (see [`crate::passes::control_flow`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum PassKind {
    /// Mixed boolean-arithmetic substitution.
    MbaSub,
    /// Splits basic blocks to break up linear disassembly (out of scope).
    BasicBlockSplitter,
    /// Rewrites direct branches as computed/indirect ones (out of scope).
    IndirectBranch,
    /// A lighter-weight indirect-branch variant (out of scope).
    SimpleIndirectBranch,
}

impl PassKind {
    /// Display name, as shown to scripts under `ObfuscationType` and in logs.
    pub fn display_name(self) -> &'static str {
        match self {
            PassKind::MbaSub => "MBASub",
            PassKind::BasicBlockSplitter => "BasicBlockSplitter",
            PassKind::IndirectBranch => "IndirectBranch",
            PassKind::SimpleIndirectBranch => "SimpleIndirectBranch",
        }
    }

    /// Code-name used as the key in [`crate::metadata::PassRecord`].
    pub fn code_name(self) -> &'static str {
        match self {
            PassKind::MbaSub => "mbasub",
            PassKind::BasicBlockSplitter => "basic_block_splitter",
            PassKind::IndirectBranch => "indirect_branch",
            PassKind::SimpleIndirectBranch => "simple_indirect_branch",
        }
    }

    /// The stable dense index scripts see as `ObfuscationType.<Name>`.
    pub fn index(self) -> u32 {
        Self::iter().position(|k| k == self).expect("self is in the iterator") as u32
    }

    /// Resolve a script-supplied obfuscation-type index back to a pass kind.
    pub fn from_index(index: u32) -> Option<Self> {
        Self::iter().nth(index as usize)
    }

    /// Resolve a [`crate::metadata::PassRecord`]'s code-name back to a pass kind.
    pub fn from_code_name(code_name: &str) -> Option<Self> {
        Self::iter().find(|k| k.code_name() == code_name)
    }
}

/// Stable descriptor row, as exposed to scripts and logs.
#[derive(Debug, Clone, Copy)]
pub struct PassDescriptor {
    /// See [`PassKind::display_name`].
    pub display_name: &'static str,
    /// See [`PassKind::code_name`].
    pub code_name: &'static str,
    /// See [`PassKind::index`].
    pub index: u32,
}

impl From<PassKind> for PassDescriptor {
    fn from(kind: PassKind) -> Self {
        Self {
            display_name: kind.display_name(),
            code_name: kind.code_name(),
            index: kind.index(),
        }
    }
}

/// All descriptors, in the stable registry order.
pub fn descriptors() -> Vec<PassDescriptor> {
    PassKind::iter().map(PassDescriptor::from).collect()
}

/// Positional arguments recorded on a constructed pass annotation: the first
/// is always `PassIterations`, later ones are pass-specific.
pub struct AnnotationArgs {
    values: Vec<i32>,
    next: usize,
}

impl AnnotationArgs {
    /// Build from an ordered argument list.
    pub fn new(values: Vec<i32>) -> Self {
        Self { values, next: 0 }
    }

    /// Take the next positional argument, or `default` if exhausted.
    pub fn next_or_default(&mut self, default: i32) -> i32 {
        let v = self.values.get(self.next).copied().unwrap_or(default);
        self.next += 1;
        v
    }
}

/// Register `kind` on `function`'s metadata from a positional annotation
/// argument list, the way passes register themselves on IR they construct
/// (e.g. String-Encryption scheduling itself on `__decrypt_ctor`).
pub fn register_from_annotation<'ctx>(
    kind: PassKind,
    function: FunctionValue<'ctx>,
    args: &mut AnnotationArgs,
    store: &mut MetadataStore<'ctx>,
) {
    let iterations = args.next_or_default(1);
    let mut options = vec![(OPT_PASS_ITERATIONS.to_string(), iterations)];
    match kind {
        PassKind::BasicBlockSplitter => {
            for key in ["MinSplits", "MaxSplits", "SplitChance"] {
                options.push((key.to_string(), args.next_or_default(0)));
            }
        }
        PassKind::IndirectBranch | PassKind::SimpleIndirectBranch => {
            options.push(("Chance".to_string(), args.next_or_default(0)));
        }
        PassKind::MbaSub => {}
    }
    store.add_pass(function, kind.code_name(), options);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_order_is_stable_across_runs() {
        let first: Vec<_> = PassKind::iter().map(PassKind::index).collect();
        let second: Vec<_> = PassKind::iter().map(PassKind::index).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![0, 1, 2, 3]);
    }

    #[test]
    fn index_round_trips_through_from_index() {
        for kind in PassKind::iter() {
            assert_eq!(PassKind::from_index(kind.index()), Some(kind));
        }
        assert_eq!(PassKind::from_index(9999), None);
    }

    #[test]
    fn code_name_round_trips() {
        for kind in PassKind::iter() {
            assert_eq!(PassKind::from_code_name(kind.code_name()), Some(kind));
        }
        assert_eq!(PassKind::from_code_name("nonsense"), None);
    }
}
