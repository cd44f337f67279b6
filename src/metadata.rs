//! Per-function pass metadata: the record list the scheduler replays.

use std::collections::HashMap;

use inkwell::values::FunctionValue;

use crate::consts::OPT_PASS_ITERATIONS;

/// One scheduled pass invocation: a pass code-name plus its integer options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRecord {
    /// Registry code-name of the pass to run, e.g. `"mbasub"`.
    pub code_name: String,
    /// Option key/value pairs. Order is insignificant; lookups are by key.
    pub options: Vec<(String, i32)>,
}

impl PassRecord {
    /// Look up an option by key.
    pub fn get(&self, key: &str) -> Option<i32> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    /// `PassIterations`, defaulting to 0 (treated as "skip") when absent.
    pub fn iterations(&self) -> i32 {
        self.get(OPT_PASS_ITERATIONS).unwrap_or(0)
    }
}

/// Ordered, per-function list of [`PassRecord`]s.
///
/// Keyed by `FunctionValue` identity rather than name: local-linkage
/// functions can share a name across translation units, but two distinct
/// `FunctionValue` handles never alias the same function.
#[derive(Default)]
pub struct MetadataStore<'ctx> {
    records: HashMap<FunctionValue<'ctx>, Vec<PassRecord>>,
}

impl<'ctx> MetadataStore<'ctx> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Append a pass record for `function`.
    pub fn add_pass(
        &mut self,
        function: FunctionValue<'ctx>,
        code_name: impl Into<String>,
        options: Vec<(String, i32)>,
    ) {
        self.records.entry(function).or_default().push(PassRecord {
            code_name: code_name.into(),
            options,
        });
    }

    /// Yield `function`'s records in insertion order.
    pub fn for_each_pass(
        &self,
        function: FunctionValue<'ctx>,
        mut f: impl FnMut(&PassRecord),
    ) {
        if let Some(records) = self.records.get(&function) {
            for record in records {
                f(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell::context::Context;
    use inkwell::module::Linkage;

    fn dummy_function<'ctx>(ctx: &'ctx Context, module: &inkwell::module::Module<'ctx>) -> FunctionValue<'ctx> {
        let void_ty = ctx.void_type();
        let fn_ty = void_ty.fn_type(&[], false);
        module.add_function("f", fn_ty, Some(Linkage::Internal))
    }

    #[test]
    fn add_then_iterate_preserves_order() {
        let ctx = Context::create();
        let module = ctx.create_module("m");
        let f = dummy_function(&ctx, &module);
        let mut store = MetadataStore::new();
        store.add_pass(f, "mbasub", vec![("PassIterations".into(), 1)]);
        store.add_pass(f, "mbasub", vec![("PassIterations".into(), 2)]);

        let mut seen = Vec::new();
        store.for_each_pass(f, |r| seen.push(r.iterations()));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn zero_iterations_is_reported_not_hidden() {
        let record = PassRecord {
            code_name: "mbasub".into(),
            options: vec![("PassIterations".into(), 0)],
        };
        assert_eq!(record.iterations(), 0);
    }
}
