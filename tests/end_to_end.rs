//! Full-pipeline integration tests: a real in-memory LLVM IR module driven
//! through string encryption, the scripting bridge, and the scheduler
//! together, the way `zyrox::bin::main` wires them — as opposed to the
//! per-module unit tests, which exercise each stage in isolation.

use std::env;
use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};

use inkwell::context::Context;
use inkwell::module::Linkage;

use zyrox::passes::string_encryption;
use zyrox::random::Prng;
use zyrox::scheduler;
use zyrox::scripting::Bridge;

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Write `source` to a uniquely-named scratch file so parallel tests never
/// collide on the same path.
fn scratch_config(source: &str) -> std::path::PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = env::temp_dir().join(format!("zyrox_e2e_{n}.js"));
    fs::write(&path, source).expect("scratch config writes cleanly");
    path
}

fn empty_function<'ctx>(context: &'ctx Context, module: &inkwell::module::Module<'ctx>, name: &str) -> inkwell::values::FunctionValue<'ctx> {
    let fn_ty = context.void_type().fn_type(&[], false);
    let f = module.add_function(name, fn_ty, Some(Linkage::Internal));
    let entry = context.append_basic_block(f, "entry");
    context.create_builder().position_at_end(entry);
    f
}

/// Scenario 3 (script skip): a config class with no `RunOnFunction` leaves
/// every function's pass list empty; the run completes without error.
#[test]
fn script_with_no_run_on_function_leaves_every_function_unscheduled() {
    let path = scratch_config(
        r#"
        class Config {
            Init() {}
        }
        z.RegisterClass(new Config());
        "#,
    );

    let context = Context::create();
    let module = context.create_module("m");
    let target = empty_function(&context, &module, "target");

    let mut bridge = Bridge::new().expect("bridge brings up cleanly");
    bridge.load_config(&path).expect("config evaluates cleanly");
    bridge.init();

    let mut prng = Prng::from_seed(7);
    string_encryption::run(&context, &module, &mut bridge, &mut prng).expect("string encryption runs cleanly");
    scheduler::collect_function_passes(&module, &mut bridge);

    let store = bridge.into_metadata();
    let mut count = 0;
    store.for_each_pass(target, |_| count += 1);
    assert_eq!(count, 0, "no RunOnFunction hook means no pass is ever registered");

    scheduler::replay(&module, &store, &mut Prng::from_seed(7));

    let _ = fs::remove_file(&path);
}

/// Scenario 1 (global path) driven end to end: a module-scope string is
/// classified `Global` and the function using it has `MBASub` scheduled on
/// it by the script's `RunOnFunction`, then replayed by the scheduler.
#[test]
fn global_string_and_scheduled_mbasub_replay_end_to_end() {
    let path = scratch_config(
        r#"
        class Config {
            Init() {}
            OnString(s) {
                return z.Global;
            }
            RunOnFunction(name) {
                if (name === "target") {
                    z.RegisterPass(ObfuscationType.MBASub, { PassIterations: 1 });
                }
            }
        }
        z.RegisterClass(new Config());
        "#,
    );

    let context = Context::create();
    let module = context.create_module("m");

    let str_ty = context.const_string(b"hello\0", false).get_type();
    let gv = module.add_global(str_ty, None, "greeting");
    gv.set_linkage(inkwell::module::Linkage::Private);
    gv.set_constant(true);
    gv.set_initializer(&context.const_string(b"hello\0", false));

    let target = empty_function(&context, &module, "target");
    let builder = context.create_builder();
    builder.position_at_end(target.get_first_basic_block().expect("entry exists"));
    let i32_ty = context.i32_type();
    let sum = builder
        .build_int_add(i32_ty.const_int(2, false), i32_ty.const_int(3, false), "sum")
        .expect("add builds cleanly");
    let _ = sum;
    builder.build_return(None).expect("return builds cleanly");

    let mut bridge = Bridge::new().expect("bridge brings up cleanly");
    bridge.load_config(&path).expect("config evaluates cleanly");
    bridge.init();

    let mut prng = Prng::from_seed(11);
    string_encryption::run(&context, &module, &mut bridge, &mut prng).expect("string encryption runs cleanly");
    scheduler::collect_function_passes(&module, &mut bridge);

    let store = bridge.into_metadata();
    let mut recorded = Vec::new();
    store.for_each_pass(target, |r| recorded.push(r.code_name.clone()));
    assert_eq!(recorded, vec!["mbasub"]);

    scheduler::replay(&module, &store, &mut prng);

    module.verify().expect("module stays well-formed after the full pipeline");

    let _ = fs::remove_file(&path);
}

/// Scenario 6 (unrecognized obfuscation index) driven end to end: the
/// registration is rejected by the bridge and the scheduler therefore has
/// nothing to replay for that function.
#[test]
fn unrecognized_obfuscation_index_never_reaches_the_scheduler() {
    let path = scratch_config(
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
    let target = empty_function(&context, &module, "target");

    let mut bridge = Bridge::new().expect("bridge brings up cleanly");
    bridge.load_config(&path).expect("config evaluates cleanly");
    bridge.init();

    let mut prng = Prng::from_seed(5);
    string_encryption::run(&context, &module, &mut bridge, &mut prng).expect("string encryption runs cleanly");
    scheduler::collect_function_passes(&module, &mut bridge);

    let store = bridge.into_metadata();
    let mut count = 0;
    store.for_each_pass(target, |_| count += 1);
    assert_eq!(count, 0, "an unrecognized index must never reach the replay stage");

    scheduler::replay(&module, &store, &mut prng);

    let _ = fs::remove_file(&path);
}
