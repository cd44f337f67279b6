//! Top-level error type for the engine.

use std::path::PathBuf;

/// Fatal error variants. Only these abort the process; everything else
/// (missing script hooks, bad option values, unknown obfuscation indices,
/// stack-candidates with out-of-function uses) is a per-unit skip logged at
/// warn/error level and handled inline where it occurs.
#[derive(Debug, thiserror::Error)]
pub enum ZyroxError {
    /// Couldn't read a file from disk.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration script does not exist at the expected location.
    #[error("configuration script not found: {0}")]
    ScriptMissing(PathBuf),

    /// Evaluating the configuration script raised an exception, or its
    /// top-level module promise rejected.
    #[error("failed to load config script: {0}")]
    ScriptEval(String),

    /// The input module failed to parse as LLVM IR/bitcode.
    #[error("failed to parse input module {path}: {message}")]
    InvalidModule {
        /// Path of the module that failed to parse.
        path: PathBuf,
        /// Message from the parser.
        message: String,
    },

    /// The module failed LLVM's IR verifier after the passes ran.
    #[error("module failed verification after obfuscation: {0}")]
    Verification(String),

    /// Writing the transformed module back out failed.
    #[error("failed to write output module {path}: {message}")]
    WriteFailed {
        /// Path that failed to write.
        path: PathBuf,
        /// Message from the writer.
        message: String,
    },

    /// An IR builder call failed while a pass was rewriting instructions.
    #[error("IR builder error: {0}")]
    Builder(#[from] inkwell::builder::BuilderError),
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, ZyroxError>;
