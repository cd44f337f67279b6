//! Thin CLI driver: loads a module, runs the engine, writes the result back.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use inkwell::context::Context;
use inkwell::module::Module;

use zyrox::error::{Result, ZyroxError};
use zyrox::passes::string_encryption;
use zyrox::random::Prng;
use zyrox::scheduler;
use zyrox::scripting::Bridge;

#[derive(Parser, Debug)]
#[command(name = "zyrox", about = "IR-level code obfuscation engine", version)]
struct CliArgs {
    /// Input module, as LLVM IR (`.ll`) or bitcode (`.bc`).
    #[arg(long, value_name = "FILE")]
    module: PathBuf,

    /// Configuration script, loaded from the current working directory by
    /// default.
    #[arg(long, value_name = "FILE", default_value = zyrox::consts::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Where to write the transformed module.
    #[arg(long, value_name = "FILE")]
    output: PathBuf,

    /// Output format for `--output`.
    #[arg(long, value_enum, default_value_t = EmitFormat::Ir)]
    emit: EmitFormat,

    /// `tracing-subscriber` env-filter directive, overridden by `RUST_LOG`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EmitFormat {
    /// Human-readable `.ll` text.
    Ir,
    /// LLVM bitcode.
    Bc,
}

fn main() {
    if let Err(err) = run() {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    let context = Context::create();
    let module = load_module(&context, &args.module)?;

    let mut bridge = Bridge::new()?;
    bridge.load_config(&args.config)?;
    bridge.init();

    let mut prng = Prng::from_entropy();
    string_encryption::run(&context, &module, &mut bridge, &mut prng)?;

    scheduler::collect_function_passes(&module, &mut bridge);
    let notes = bridge.module_metadata();
    let store = bridge.into_metadata();
    scheduler::replay(&module, &store, &mut prng);

    if !notes.is_empty() {
        module.set_metadata(
            context.metadata_string(&notes.join(";")),
            context.get_kind_id("zyrox.notes"),
        );
    }

    module
        .verify()
        .map_err(|e| ZyroxError::Verification(e.to_string()))?;

    write_module(&module, &args.output, args.emit)?;
    tracing::info!(output = %args.output.display(), "wrote transformed module");
    Ok(())
}

fn init_logging(default_directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_module<'ctx>(context: &'ctx Context, path: &PathBuf) -> Result<Module<'ctx>> {
    if !path.exists() {
        return Err(ZyroxError::Io {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "module file not found"),
        });
    }
    let buffer = inkwell::memory_buffer::MemoryBuffer::create_from_file(path).map_err(|e| ZyroxError::InvalidModule {
        path: path.clone(),
        message: e.to_string(),
    })?;

    if path.extension().and_then(|e| e.to_str()) == Some("bc") {
        inkwell::module::Module::parse_bitcode_from_buffer(&buffer, context).map_err(|e| ZyroxError::InvalidModule {
            path: path.clone(),
            message: e.to_string(),
        })
    } else {
        context
            .create_module_from_ir(buffer)
            .map_err(|e| ZyroxError::InvalidModule {
                path: path.clone(),
                message: e.to_string(),
            })
    }
}

fn write_module(module: &Module<'_>, path: &PathBuf, emit: EmitFormat) -> Result<()> {
    match emit {
        EmitFormat::Ir => module.print_to_file(path).map_err(|e| ZyroxError::WriteFailed {
            path: path.clone(),
            message: e.to_string(),
        }),
        EmitFormat::Bc => {
            if module.write_bitcode_to_path(path) {
                Ok(())
            } else {
                Err(ZyroxError::WriteFailed {
                    path: path.clone(),
                    message: "write_bitcode_to_path failed".to_string(),
                })
            }
        }
    }
}
