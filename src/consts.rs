//! Engine-wide constants.

/// Default path the configuration script is loaded from, relative to the
/// current working directory.
pub const DEFAULT_CONFIG_PATH: &str = "ZyroxConfig.js";

/// Prefix that forces a string literal onto the stack-decryption path
/// regardless of what `OnString` returns. The prefix itself is stripped
/// before encryption.
pub const STACK_SENTINEL_PREFIX: &str = "/stack:";

/// Reserved name prefix that excludes a global from string discovery
/// (intrinsic globals such as `llvm.used`).
pub const RESERVED_NAME_PREFIX: &str = "llvm.";

/// Section-name prefixes that exclude a global from string discovery.
pub const RESERVED_SECTION_PREFIXES: [&str; 2] = ["debug", "llvm"];

/// Name of the generated module constructor that decrypts all `Global`
/// strings once at load time.
pub const DECRYPT_CTOR_NAME: &str = "__decrypt_ctor";

/// Name of the generated pointer table backing the global-table decrypt path.
pub const ENC_PTR_TABLE_NAME: &str = "__enc_ptr_table";

/// Name of the generated length table backing the global-table decrypt path.
pub const ENC_LEN_TABLE_NAME: &str = "__enc_len_table";

/// Priority the generated constructor is appended to `llvm.global_ctors` at.
///
/// Priority 0 means "run alongside other priority-0 constructors in
/// unspecified order" (see design notes on the global-constructor priority
/// collision); this port keeps spec.md's priority 0 rather than reserving a
/// lower one.
pub const DECRYPT_CTOR_PRIORITY: u32 = 0;

/// The only option every pass consults.
pub const OPT_PASS_ITERATIONS: &str = "PassIterations";

/// Number of scratch stack slots the inline decrypt emitter introduces per
/// function, memoized on first use.
pub const DECRYPT_SLOTS_PER_FUNCTION: usize = 3;
