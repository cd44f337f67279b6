//! `rquickjs`-backed scripting bridge: brings up the embedded interpreter,
//! evaluates `ZyroxConfig.js`, publishes the host API, and exposes typed
//! lookups for the three user-defined hooks (`Init`, `RunOnFunction`,
//! `OnString`).
//!
//! Teardown is structural: `Runtime`/`Context`/the persisted config-class
//! handle all drop in field-declaration-reverse order when a `Bridge` goes
//! out of scope, replacing the original's manual `JS_FreeValue` discipline.

mod api;

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use inkwell::values::FunctionValue;
use rquickjs::{CatchResultExt, Context as JsContext, Object, Persistent, Runtime};

use crate::error::{Result, ZyroxError};
use crate::metadata::MetadataStore;
use crate::passes::string_encryption::{PassHost, StringClassifier, StringDisposition};
use crate::registry::{AnnotationArgs, PassKind};

/// State mutated by host callbacks across the run; shared between the
/// `Bridge` and every closure installed into the interpreter.
struct Shared<'ctx> {
    metadata: MetadataStore<'ctx>,
    module_metadata: Vec<String>,
    config_class: Option<Persistent<Object<'static>>>,
    /// Set for the duration of a single `RunOnFunction` callback; `z.RegisterPass`
    /// reads it instead of a global, per the Open Question in spec.md §9.
    current_function: Option<(FunctionValue<'ctx>, String)>,
}

/// Owns the embedded interpreter and the user's configuration class handle
/// for one engine run.
pub struct Bridge<'ctx> {
    shared: Rc<RefCell<Shared<'ctx>>>,
    context: JsContext,
    _runtime: Runtime,
}

impl<'ctx> Bridge<'ctx> {
    /// Bring up the interpreter and publish the host API. Does not yet load
    /// any script.
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| ZyroxError::ScriptEval(e.to_string()))?;
        let context = JsContext::full(&runtime).map_err(|e| ZyroxError::ScriptEval(e.to_string()))?;

        let shared = Rc::new(RefCell::new(Shared {
            metadata: MetadataStore::new(),
            module_metadata: Vec::new(),
            config_class: None,
            current_function: None,
        }));

        context
            .with(|ctx| api::install(&ctx, shared.clone()))
            .map_err(|e| ZyroxError::ScriptEval(e.to_string()))?;

        Ok(Self {
            shared,
            context,
            _runtime: runtime,
        })
    }

    /// Load and evaluate the configuration script at `path`. A parse error,
    /// a thrown exception, or a rejected top-level module promise are all
    /// fatal bring-up failures (§7 category 1).
    pub fn load_config(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(ZyroxError::ScriptMissing(path.to_path_buf()));
        }
        let source = fs::read_to_string(path).map_err(|source| ZyroxError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path.to_string_lossy().into_owned();

        self.context
            .with(|ctx| -> Result<(), String> {
                let run = || -> rquickjs::Result<()> {
                    let (_module, promise) = rquickjs::Module::declare(ctx.clone(), name, source)?.eval()?;
                    promise.finish::<()>()
                };
                run().catch(&ctx).map_err(|e| e.to_string())
            })
            .map_err(ZyroxError::ScriptEval)?;

        if self.shared.borrow().config_class.is_none() {
            tracing::warn!("config script did not call z.RegisterClass; all passes are disabled");
        }
        Ok(())
    }

    /// Call the config class's `Init()`, if it defines one.
    pub fn init(&mut self) {
        self.with_config_class(|ctx, class| {
            if let Ok(init) = class.get::<_, rquickjs::Function>("Init") {
                if let Err(err) = init.call::<_, ()>((class.clone(),)) {
                    tracing::warn!("Init() raised: {err}");
                }
            }
            let _ = ctx;
        });
    }

    /// Call `RunOnFunction(name)`, binding the current-function context for
    /// the duration of the call so `z.RegisterPass` has somewhere to attach
    /// records. Returns normally even if the script has no `RunOnFunction`
    /// or if the call raises (§7 category 2).
    pub fn run_on_function(&mut self, function: FunctionValue<'ctx>, demangled_name: &str) {
        self.shared.borrow_mut().current_function = Some((function, demangled_name.to_string()));

        self.with_config_class(|_ctx, class| {
            if let Ok(f) = class.get::<_, rquickjs::Function>("RunOnFunction") {
                if let Err(err) = f.call::<_, ()>((class.clone(), demangled_name)) {
                    tracing::warn!(function = demangled_name, "RunOnFunction raised: {err}");
                }
            }
        });

        self.shared.borrow_mut().current_function = None;
    }

    /// Take ownership of the accumulated metadata store, consuming the
    /// bridge's copy. Called once after String-Encryption has finished
    /// driving `RunOnFunction` over every function.
    pub fn into_metadata(self) -> MetadataStore<'ctx> {
        Rc::try_unwrap(self.shared)
            .map(|cell| cell.into_inner().metadata)
            .unwrap_or_else(|rc| std::mem::replace(&mut rc.borrow_mut().metadata, MetadataStore::new()))
    }

    /// Module-level metadata notes accumulated via `z.AddMetaData`.
    pub fn module_metadata(&self) -> Vec<String> {
        self.shared.borrow().module_metadata.clone()
    }

    /// Register `kind` on `function`'s metadata from a positional argument
    /// list. Used both directly by String-Encryption (on the constructor it
    /// generates) and indirectly via the `z.RegisterPass` host callback.
    pub fn register_pass(&mut self, kind: PassKind, function: FunctionValue<'ctx>, args: &mut AnnotationArgs) {
        let mut shared = self.shared.borrow_mut();
        crate::registry::register_from_annotation(kind, function, args, &mut shared.metadata);
    }

    fn with_config_class(&mut self, f: impl FnOnce(&rquickjs::Ctx<'_>, &Object<'_>)) {
        let persisted = self.shared.borrow().config_class.clone();
        let Some(persisted) = persisted else { return };
        self.context.with(|ctx| {
            let class = persisted.clone().restore(&ctx).expect("persisted handle outlives its runtime");
            f(&ctx, &class);
        });
    }
}

impl<'ctx> PassHost<'ctx> for Bridge<'ctx> {
    fn register_pass(&mut self, kind: PassKind, function: FunctionValue<'ctx>, args: &mut AnnotationArgs) {
        Bridge::register_pass(self, kind, function, args);
    }
}

impl<'ctx> StringClassifier for Bridge<'ctx> {
    fn has_on_string(&self) -> bool {
        let persisted = self.shared.borrow().config_class.clone();
        let Some(persisted) = persisted else { return false };
        self.context.with(|ctx| {
            let class = persisted.restore(&ctx).expect("persisted handle outlives its runtime");
            class.get::<_, rquickjs::Function>("OnString").is_ok()
        })
    }

    fn classify(&mut self, bytes: &[u8]) -> Option<StringDisposition> {
        let mut result = None;
        self.with_config_class(|ctx, class| {
            let Ok(on_string) = class.get::<_, rquickjs::Function>("OnString") else {
                return;
            };
            let arg = rquickjs::String::from_str(ctx.clone(), &String::from_utf8_lossy(bytes))
                .expect("string conversion does not fail");
            match on_string.call::<_, i32>((class.clone(), arg)) {
                Ok(1) => result = Some(StringDisposition::Stack),
                Ok(2) => result = Some(StringDisposition::Global),
                Ok(_) => result = None,
                Err(err) => {
                    tracing::warn!("OnString raised: {err}");
                    result = None;
                }
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use inkwell::context::Context;
    use inkwell::module::Linkage;

    use super::*;

    static CONFIG_COUNTER: AtomicU32 = AtomicU32::new(0);

    /// Write `source` to a scratch file under the system temp dir and return
    /// its path; each call gets a fresh name so parallel tests don't collide.
    fn write_scratch_config(source: &str) -> std::path::PathBuf {
        let n = CONFIG_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("zyrox_bridge_test_{n}.js"));
        fs::write(&path, source).expect("scratch config writes cleanly");
        path
    }

    fn dummy_function<'ctx>(ctx: &'ctx Context, module: &inkwell::module::Module<'ctx>) -> FunctionValue<'ctx> {
        let fn_ty = ctx.void_type().fn_type(&[], false);
        let f = module.add_function("target", fn_ty, Some(Linkage::Internal));
        let entry = ctx.append_basic_block(f, "entry");
        ctx.create_builder().position_at_end(entry);
        f
    }

    #[test]
    fn invalid_pass_iterations_option_is_skipped() {
        let path = write_scratch_config(
            r#"
            class Config {
                Init() {}
                RunOnFunction(name) {
                    z.RegisterPass(ObfuscationType.MBASub, { PassIterations: "not-a-number" });
                }
            }
            z.RegisterClass(new Config());
            "#,
        );

        let context = Context::create();
        let module = context.create_module("m");
        let f = dummy_function(&context, &module);

        let mut bridge = Bridge::new().expect("bridge brings up cleanly");
        bridge.load_config(&path).expect("config evaluates cleanly");
        bridge.init();
        bridge.run_on_function(f, "target");

        let store = bridge.into_metadata();
        let mut count = 0;
        store.for_each_pass(f, |_| count += 1);
        assert_eq!(count, 0, "an unparseable PassIterations must not register a pass");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn unrecognized_obfuscation_index_is_skipped() {
        let path = write_scratch_config(
            r#"
            class Config {
                Init() {}
                RunOnFunction(name) {
                    z.RegisterPass(9999, { PassIterations: 1 });
                }
            }
            z.RegisterClass(new Config());
            "#,
        );

        let context = Context::create();
        let module = context.create_module("m");
        let f = dummy_function(&context, &module);

        let mut bridge = Bridge::new().expect("bridge brings up cleanly");
        bridge.load_config(&path).expect("config evaluates cleanly");
        bridge.init();
        bridge.run_on_function(f, "target");

        let store = bridge.into_metadata();
        let mut count = 0;
        store.for_each_pass(f, |_| count += 1);
        assert_eq!(count, 0, "an unrecognized obfuscation index must not register a pass");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn valid_registration_is_recorded() {
        let path = write_scratch_config(
            r#"
            class Config {
                Init() {}
                RunOnFunction(name) {
                    z.RegisterPass(ObfuscationType.MBASub, { PassIterations: 2 });
                }
            }
            z.RegisterClass(new Config());
            "#,
        );

        let context = Context::create();
        let module = context.create_module("m");
        let f = dummy_function(&context, &module);

        let mut bridge = Bridge::new().expect("bridge brings up cleanly");
        bridge.load_config(&path).expect("config evaluates cleanly");
        bridge.init();
        bridge.run_on_function(f, "target");

        let store = bridge.into_metadata();
        let mut iterations_seen = Vec::new();
        store.for_each_pass(f, |r| iterations_seen.push(r.iterations()));
        assert_eq!(iterations_seen, vec![2]);

        let _ = fs::remove_file(&path);
    }
}
