//! Hides constant string data behind a keyed stream cipher and emits the
//! decoding IR at use sites.
//!
//! Two dispositions: `Global` strings are collected into parallel tables and
//! decrypted once, in place, by a generated module constructor; `Stack`
//! strings are decrypted on demand, on the stack, at every use site, leaving
//! no persistent plaintext in the module's data section.
//!
//! Runs once, at module scope, before the per-function scheduler.

use std::collections::HashMap;

use inkwell::basic_block::BasicBlock;
use inkwell::builder::{Builder, BuilderError};
use inkwell::context::Context;
use inkwell::module::{Linkage, Module};
use inkwell::values::{
    AnyValue, BasicValue, BasicValueEnum, FunctionValue, GlobalValue, InstructionOpcode,
    InstructionValue, IntValue, PointerValue,
};
use inkwell::{AddressSpace, IntPredicate};

use crate::cipher;
use crate::consts::{
    DECRYPT_CTOR_NAME, DECRYPT_CTOR_PRIORITY, ENC_LEN_TABLE_NAME, ENC_PTR_TABLE_NAME,
    RESERVED_NAME_PREFIX, RESERVED_SECTION_PREFIXES, STACK_SENTINEL_PREFIX,
};
use crate::random::Prng;
use crate::registry::{AnnotationArgs, PassKind};

/// What a string was classified as by the scripting bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringDisposition {
    /// Decrypted on the stack at every use site.
    Stack,
    /// Decrypted once, in place, by a generated module constructor.
    Global,
}

/// The slice of the scripting bridge this pass needs. Kept as a narrow trait
/// so this module doesn't depend on `rquickjs` directly.
pub trait StringClassifier {
    /// Whether the config class defines `OnString` at all. If not, the whole
    /// pass is a documented no-op.
    fn has_on_string(&self) -> bool;

    /// Classify one candidate's raw bytes (prefix included, if present).
    /// `None` covers both an explicit "skip" return and a raised exception.
    fn classify(&mut self, bytes: &[u8]) -> Option<StringDisposition>;
}

/// Everything String-Encryption needs from its host: string classification
/// plus the ability to schedule passes on the `__decrypt_ctor` it generates.
pub trait PassHost<'ctx>: StringClassifier {
    /// Register `kind` on `function`'s metadata from a positional argument
    /// list (see [`crate::registry::register_from_annotation`]).
    fn register_pass(&mut self, kind: PassKind, function: FunctionValue<'ctx>, args: &mut AnnotationArgs);
}

/// The three volatile stack slots the inline decrypt emitter reuses across
/// every string decrypted within one function.
#[derive(Debug, Clone, Copy)]
struct DecryptSlots<'ctx> {
    offset: PointerValue<'ctx>,
    state: PointerValue<'ctx>,
    j: PointerValue<'ctx>,
}

/// Runs String-Encryption over `module`, then schedules MBASub and the
/// control-flow passes on the generated constructor via `host`.
pub fn run<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    host: &mut impl PassHost<'ctx>,
    prng: &mut Prng,
) -> crate::error::Result<()> {
    if !host.has_on_string() {
        tracing::warn!("config class has no OnString; String-Encryption will not transform any string");
        return Ok(());
    }

    let mut global_candidates: Vec<(GlobalValue<'ctx>, Vec<u8>)> = Vec::new();
    let mut stack_candidates: Vec<(GlobalValue<'ctx>, Vec<u8>)> = Vec::new();

    let mut cursor = module.get_first_global();
    while let Some(gv) = cursor {
        let next = gv.get_next_global();
        cursor = next;

        if is_reserved_global(gv) {
            continue;
        }
        let Some(bytes) = extract_string_bytes(gv) else {
            continue;
        };

        // OnString is called for every candidate, sentinel or not, so scripts
        // that count/log every seen string see the full set; the sentinel
        // then overrides the *result*, not the call.
        let classified = host.classify(&bytes);
        let forced_stack = bytes.starts_with(STACK_SENTINEL_PREFIX.as_bytes());
        let disposition = if forced_stack {
            Some(StringDisposition::Stack)
        } else {
            classified
        };

        match disposition {
            Some(StringDisposition::Global) => global_candidates.push((gv, bytes)),
            Some(StringDisposition::Stack) => {
                let stored = if forced_stack {
                    bytes[STACK_SENTINEL_PREFIX.len()..].to_vec()
                } else {
                    bytes
                };
                if validate_stack_uses(gv) {
                    stack_candidates.push((gv, stored));
                } else {
                    tracing::warn!(
                        global = %gv.get_name().to_string_lossy(),
                        "stack-candidate string has a use outside any function; leaving it unchanged"
                    );
                }
            }
            None => {}
        }
    }

    if !global_candidates.is_empty() {
        build_global_table_path(context, module, &global_candidates, prng, host)?;
    }

    let mut cache: HashMap<FunctionValue<'ctx>, DecryptSlots<'ctx>> = HashMap::new();
    for (gv, bytes) in stack_candidates {
        rewrite_stack_candidate(context, module, &mut cache, gv, bytes, prng)?;
    }

    Ok(())
}

fn is_reserved_global(gv: GlobalValue<'_>) -> bool {
    if gv.get_name().to_string_lossy().starts_with(RESERVED_NAME_PREFIX) {
        return true;
    }
    if let Some(section) = gv.get_section() {
        let section = section.to_string_lossy();
        if RESERVED_SECTION_PREFIXES.iter().any(|p| section.starts_with(p)) {
            return true;
        }
    }
    false
}

/// Recover the exact byte count of a constant string initializer.
///
/// `inkwell` only exposes the null-truncated form via `get_string_constant`;
/// the array type's element count is authoritative for the real length
/// (which may include a trailing null byte), so a truncated read is padded
/// back out with zeros rather than trusted as-is.
fn extract_string_bytes(gv: GlobalValue<'_>) -> Option<Vec<u8>> {
    let BasicValueEnum::ArrayValue(array) = gv.get_initializer()? else {
        return None;
    };
    if !array.is_const_string() {
        return None;
    }
    let len = array.get_type().len() as usize;
    let cstr = array.get_string_constant()?;
    let mut bytes = cstr.to_bytes().to_vec();
    bytes.resize(len, 0);
    Some(bytes)
}

/// Every use chain from `gv` must terminate at an instruction with an
/// enclosing function; constant-expression wrappers (e.g. a bitcast/GEP
/// constant) are unwrapped once and re-examined.
fn validate_stack_uses(gv: GlobalValue<'_>) -> bool {
    let mut use_cursor = gv.get_first_use();
    while let Some(u) = use_cursor {
        let user = u.get_user();
        let ok = match user.as_instruction_value() {
            Some(instr) => instr.get_parent().is_some(),
            None => {
                // A constant-expression user: accept only if every one of
                // *its* uses lands on an instruction, unwrapped once.
                match user {
                    inkwell::values::AnyValueEnum::PointerValue(p) => {
                        let mut inner = p.get_first_use();
                        let mut all_ok = true;
                        while let Some(iu) = inner {
                            if iu.get_user().as_instruction_value().is_none() {
                                all_ok = false;
                                break;
                            }
                            inner = iu.get_next_use();
                        }
                        all_ok
                    }
                    _ => false,
                }
            }
        };
        if !ok {
            return false;
        }
        use_cursor = u.get_next_use();
    }
    true
}

fn build_global_table_path<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    candidates: &[(GlobalValue<'ctx>, Vec<u8>)],
    prng: &mut Prng,
    host: &mut impl PassHost<'ctx>,
) -> crate::error::Result<()> {
    let master_seed = prng.uint32();

    let i8_ty = context.i8_type();
    let i32_ty = context.i32_type();
    let ptr_ty = context.ptr_type(AddressSpace::default());

    let mut ptr_values = Vec::with_capacity(candidates.len());
    let mut len_values = Vec::with_capacity(candidates.len());

    let mut encrypted: Vec<Vec<u8>> = candidates.iter().map(|(_, raw)| raw.clone()).collect();
    cipher::xor_encrypt_strings(&mut encrypted, master_seed);

    for ((gv, _), encrypted) in candidates.iter().zip(encrypted.iter()) {
        let new_array = context.const_string(encrypted, false);
        gv.set_initializer(&new_array);
        gv.set_constant(false);

        ptr_values.push(gv.as_pointer_value());
        len_values.push(i32_ty.const_int(encrypted.len() as u64, false));
    }

    let ptr_table_ty = ptr_ty.array_type(ptr_values.len() as u32);
    let ptr_table = module.add_global(ptr_table_ty, None, ENC_PTR_TABLE_NAME);
    ptr_table.set_linkage(Linkage::Internal);
    ptr_table.set_initializer(&ptr_ty.const_array(&ptr_values));

    let len_table_ty = i32_ty.array_type(len_values.len() as u32);
    let len_table = module.add_global(len_table_ty, None, ENC_LEN_TABLE_NAME);
    len_table.set_linkage(Linkage::Internal);
    len_table.set_initializer(&i32_ty.const_array(&len_values));

    let decrypt_fn = build_decrypt_ctor(
        context,
        module,
        ptr_table,
        len_table,
        candidates.len() as u32,
        master_seed,
    )?;

    append_to_global_ctors(context, module, decrypt_fn, DECRYPT_CTOR_PRIORITY);

    let mut args = AnnotationArgs::new(vec![1]);
    host.register_pass(PassKind::MbaSub, decrypt_fn, &mut args);
    let mut args = AnnotationArgs::new(vec![1, 20, 30, 70]);
    host.register_pass(PassKind::BasicBlockSplitter, decrypt_fn, &mut args);
    let mut args = AnnotationArgs::new(vec![1, 100]);
    host.register_pass(PassKind::IndirectBranch, decrypt_fn, &mut args);
    let mut args = AnnotationArgs::new(vec![1, 100]);
    host.register_pass(PassKind::SimpleIndirectBranch, decrypt_fn, &mut args);

    Ok(())
}

fn build_decrypt_ctor<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    ptr_table: GlobalValue<'ctx>,
    len_table: GlobalValue<'ctx>,
    count: u32,
    master_seed: u32,
) -> Result<FunctionValue<'ctx>, BuilderError> {
    let void_ty = context.void_type();
    let i32_ty = context.i32_type();
    let i8_ty = context.i8_type();
    let ptr_ty = context.ptr_type(AddressSpace::default());

    let fn_ty = void_ty.fn_type(&[], false);
    let ctor = module.add_function(DECRYPT_CTOR_NAME, fn_ty, Some(Linkage::Internal));

    let entry = context.append_basic_block(ctor, "entry");
    let loop_header = context.append_basic_block(ctor, "loop.header");
    let loop_body = context.append_basic_block(ctor, "loop.body");
    let exit = context.append_basic_block(ctor, "exit");

    let builder = context.create_builder();

    builder.position_at_end(entry);
    let i_slot = builder.build_alloca(i32_ty, "i")?;
    builder.build_store(i_slot, i32_ty.const_zero())?;
    builder.build_unconditional_branch(loop_header)?;

    builder.position_at_end(loop_header);
    let i = builder.build_load(i32_ty, i_slot, "i.load")?.into_int_value();
    let cond = builder.build_int_compare(
        IntPredicate::ULT,
        i,
        i32_ty.const_int(count as u64, false),
        "loop.cond",
    )?;
    builder.build_conditional_branch(cond, loop_body, exit)?;

    builder.position_at_end(loop_body);
    let ptr_table_ty = ptr_ty.array_type(count);
    let len_table_ty = i32_ty.array_type(count);
    let ptr_gep = unsafe {
        builder.build_gep(
            ptr_table_ty,
            ptr_table.as_pointer_value(),
            &[i32_ty.const_zero(), i],
            "ptr.gep",
        )?
    };
    let ptr = builder.build_load(ptr_ty, ptr_gep, "ptr")?.into_pointer_value();
    let len_gep = unsafe {
        builder.build_gep(
            len_table_ty,
            len_table.as_pointer_value(),
            &[i32_ty.const_zero(), i],
            "len.gep",
        )?
    };
    let len = builder.build_load(i32_ty, len_gep, "len")?.into_int_value();
    let seed = builder.build_xor(i32_ty.const_int(master_seed as u64, false), i, "seed")?;

    let mut cache = HashMap::new();
    let slots = decrypt_slots(context, &mut cache, ctor)?;
    let after_decrypt = emit_inline_decrypt(context, &builder, slots, seed, ptr, ptr, len)?;

    builder.position_at_end(after_decrypt);
    let i_next = builder.build_int_add(i, i32_ty.const_int(1, false), "i.next")?;
    builder.build_store(i_slot, i_next)?;
    builder.build_unconditional_branch(loop_header)?;

    builder.position_at_end(exit);
    builder.build_return(None)?;

    let _ = i8_ty;
    Ok(ctor)
}

/// There is no `LLVMAppendToGlobalCtors`-equivalent in `inkwell`; this
/// rebuilds `llvm.global_ctors` by hand, preserving any existing entries.
fn append_to_global_ctors<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    ctor: FunctionValue<'ctx>,
    priority: u32,
) {
    let i32_ty = context.i32_type();
    let ptr_ty = context.ptr_type(AddressSpace::default());
    let entry_ty = context.struct_type(&[i32_ty.into(), ptr_ty.into(), ptr_ty.into()], false);

    let mut entries = Vec::new();
    if let Some(existing) = module.get_global("llvm.global_ctors") {
        if let Some(BasicValueEnum::ArrayValue(arr)) = existing.get_initializer() {
            let count = arr.get_type().len();
            for i in 0..count {
                if let Some(elem) = arr.get_element_as_constant(i) {
                    if let BasicValueEnum::StructValue(s) = elem {
                        entries.push(s);
                    }
                }
            }
        }
        unsafe {
            existing.delete();
        }
    }

    let new_entry = entry_ty.const_named_struct(&[
        i32_ty.const_int(priority as u64, false).into(),
        ctor.as_global_value().as_pointer_value().into(),
        ptr_ty.const_null().into(),
    ]);
    entries.push(new_entry);

    let array_ty = entry_ty.array_type(entries.len() as u32);
    let new_global = module.add_global(array_ty, None, "llvm.global_ctors");
    new_global.set_linkage(Linkage::Appending);
    new_global.set_initializer(&entry_ty.const_array(&entries));
}

fn rewrite_stack_candidate<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    cache: &mut HashMap<FunctionValue<'ctx>, DecryptSlots<'ctx>>,
    gv: GlobalValue<'ctx>,
    raw: Vec<u8>,
    prng: &mut Prng,
) -> crate::error::Result<()> {
    let seed = prng.uint32();
    let mut encrypted = raw.clone();
    cipher::xor_crypt(&mut encrypted, seed);

    let encrypted_array = context.const_string(&encrypted, false);
    let new_global = module.add_global(encrypted_array.get_type(), None, "");
    new_global.set_linkage(Linkage::Private);
    new_global.set_constant(true);
    new_global.set_alignment(1);
    new_global.set_initializer(&encrypted_array);

    let i8_ty = context.i8_type();
    let i32_ty = context.i32_type();
    let len = raw.len() as u32;
    let buf_ty = i8_ty.array_type(len);

    // Materialize every user into a concrete, in-function instruction first
    // (unwrapping one layer of constant-expression wrapper), then rewrite
    // each independently; the global itself is erased once all uses move.
    let users = collect_instruction_users(gv);

    for instr in users {
        let Some(function) = instr.get_parent().and_then(|bb| bb.get_parent()) else {
            continue;
        };
        let entry = function.get_first_basic_block().expect("function has an entry block");

        let alloca_builder = context.create_builder();
        match entry.get_first_instruction() {
            Some(first) => alloca_builder.position_before(&first),
            None => alloca_builder.position_at_end(entry),
        }
        let alloca = alloca_builder.build_alloca(buf_ty, "__ze_stack_buf")?;
        alloca.as_instruction_value().and_then(|i| i.set_alignment(4).ok());

        let builder = context.create_builder();
        let tail = split_block_before(context, &builder, instr, "decrypt.tail");

        builder.position_at_end(instr.get_parent().expect("instr still has a parent before the tail move"));
        builder.build_memcpy(
            alloca,
            4,
            new_global.as_pointer_value(),
            1,
            i32_ty.const_int(len as u64, false),
        )?;
        let slots = decrypt_slots(context, cache, function)?;
        let after = emit_inline_decrypt(
            context,
            &builder,
            slots,
            i32_ty.const_int(seed as u64, false),
            alloca,
            alloca,
            i32_ty.const_int(len as u64, false),
        )?;
        builder.position_at_end(after);
        builder.build_unconditional_branch(tail)?;

        // `instr` may reach `gv` directly, or through a wrapping constant
        // expression (a zero-index GEP decaying the array global to a
        // pointer); the latter has to be materialized into a real
        // instruction first so the operand that actually references `gv`
        // becomes reachable and rewritable.
        let rewrite_target = materialize_constant_expr_operand(context, instr, gv)?.unwrap_or(instr);

        for operand_index in 0..rewrite_target.get_num_operands() {
            if let Some(operand) = rewrite_target.get_operand(operand_index).and_then(|e| e.left()) {
                if operand_references(operand, gv) {
                    rewrite_target.set_operand(operand_index, alloca);
                }
            }
        }
    }

    unsafe {
        gv.delete();
    }

    Ok(())
}

/// If any of `instr`'s operands is a constant expression wrapping `gv`
/// (rather than `gv`'s pointer value directly), materialize that expression
/// as a real, in-function `getelementptr` instruction positioned right
/// before `instr`, and rewrite `instr` to use it in place of the constant
/// expression — the Rust analogue of `ce->getAsInstruction()` followed by
/// `replaceUsesOfWith(ce, gep)`. Returns the instruction the caller should
/// now scan for the operand that really references `gv` (the materialized
/// GEP if one was built, `None` otherwise, meaning `instr` itself applies).
fn materialize_constant_expr_operand<'ctx>(
    context: &'ctx Context,
    instr: InstructionValue<'ctx>,
    gv: GlobalValue<'ctx>,
) -> Result<Option<InstructionValue<'ctx>>, BuilderError> {
    for operand_index in 0..instr.get_num_operands() {
        let Some(BasicValueEnum::PointerValue(p)) = instr.get_operand(operand_index).and_then(|e| e.left()) else {
            continue;
        };
        if p == gv.as_pointer_value() || !p.is_const() {
            continue;
        }

        let BasicValueEnum::ArrayValue(array) = gv.get_initializer().expect("stack candidate still has its initializer") else {
            continue;
        };
        let array_ty = array.get_type();

        let builder = context.create_builder();
        builder.position_before(&instr);
        let zero = context.i64_type().const_zero();
        let gep = unsafe { builder.build_gep(array_ty, gv.as_pointer_value(), &[zero, zero], "ze.gep")? };
        instr.set_operand(operand_index, gep);

        return Ok(gep.as_instruction_value());
    }
    Ok(None)
}

fn operand_references(operand: BasicValueEnum<'_>, gv: GlobalValue<'_>) -> bool {
    match operand {
        BasicValueEnum::PointerValue(p) => p == gv.as_pointer_value(),
        _ => false,
    }
}

/// Collect every in-function instruction that (directly, or through one
/// constant-expression wrapper) uses `gv`. Validation already guaranteed
/// these exist.
fn collect_instruction_users<'ctx>(gv: GlobalValue<'ctx>) -> Vec<InstructionValue<'ctx>> {
    let mut out = Vec::new();
    let mut use_cursor = gv.get_first_use();
    while let Some(u) = use_cursor {
        let user = u.get_user();
        match user.as_instruction_value() {
            Some(instr) => out.push(instr),
            None => {
                if let inkwell::values::AnyValueEnum::PointerValue(p) = user {
                    let mut inner = p.get_first_use();
                    while let Some(iu) = inner {
                        if let Some(instr) = iu.get_user().as_instruction_value() {
                            out.push(instr);
                        }
                        inner = iu.get_next_use();
                    }
                }
            }
        }
        use_cursor = u.get_next_use();
    }
    out
}

fn decrypt_slots<'ctx>(
    context: &'ctx Context,
    cache: &mut HashMap<FunctionValue<'ctx>, DecryptSlots<'ctx>>,
    function: FunctionValue<'ctx>,
) -> Result<DecryptSlots<'ctx>, BuilderError> {
    if let Some(slots) = cache.get(&function) {
        return Ok(*slots);
    }
    let entry = function.get_first_basic_block().expect("function has an entry block");
    let builder = context.create_builder();
    match entry.get_first_instruction() {
        Some(first) => builder.position_before(&first),
        None => builder.position_at_end(entry),
    }
    let i32_ty = context.i32_type();
    let slots = DecryptSlots {
        offset: builder.build_alloca(i32_ty, "__ze_offset")?,
        state: builder.build_alloca(i32_ty, "__ze_state")?,
        j: builder.build_alloca(i32_ty, "__ze_j")?,
    };
    cache.insert(function, slots);
    Ok(slots)
}

fn volatile_store<'ctx>(
    builder: &Builder<'ctx>,
    ptr: PointerValue<'ctx>,
    value: IntValue<'ctx>,
) -> Result<(), BuilderError> {
    let instr = builder.build_store(ptr, value)?;
    let _ = instr.set_volatile(true);
    Ok(())
}

fn volatile_load<'ctx>(
    builder: &Builder<'ctx>,
    ty: inkwell::types::IntType<'ctx>,
    ptr: PointerValue<'ctx>,
    name: &str,
) -> Result<IntValue<'ctx>, BuilderError> {
    let v = builder.build_load(ty, ptr, name)?;
    if let Some(instr) = v.as_instruction_value() {
        let _ = instr.set_volatile(true);
    }
    Ok(v.into_int_value())
}

/// Emits the SplitMix32 decrypt loop from spec.md §4.3 as real IR, using the
/// function's three memoized scratch slots. Returns the block the caller
/// should continue building in.
fn emit_inline_decrypt<'ctx>(
    context: &'ctx Context,
    builder: &Builder<'ctx>,
    slots: DecryptSlots<'ctx>,
    state_seed: IntValue<'ctx>,
    in_ptr: PointerValue<'ctx>,
    out_ptr: PointerValue<'ctx>,
    length: IntValue<'ctx>,
) -> Result<BasicBlock<'ctx>, BuilderError> {
    let i8_ty = context.i8_type();
    let i32_ty = context.i32_type();
    let function = builder
        .get_insert_block()
        .expect("builder has an insertion point")
        .get_parent()
        .expect("insertion block belongs to a function");

    volatile_store(builder, slots.offset, i32_ty.const_zero())?;
    volatile_store(builder, slots.state, state_seed)?;

    let loop_header = context.append_basic_block(function, "decrypt.loop.header");
    let loop_body = context.append_basic_block(function, "decrypt.loop.body");
    let chunk_header = context.append_basic_block(function, "decrypt.chunk.header");
    let chunk_body = context.append_basic_block(function, "decrypt.chunk.body");
    let chunk_exit = context.append_basic_block(function, "decrypt.chunk.exit");
    let loop_exit = context.append_basic_block(function, "decrypt.loop.exit");

    builder.build_unconditional_branch(loop_header)?;

    builder.position_at_end(loop_header);
    let offset = volatile_load(builder, i32_ty, slots.offset, "decrypt.offset")?;
    let keep_going = builder.build_int_compare(IntPredicate::ULT, offset, length, "decrypt.cond")?;
    builder.build_conditional_branch(keep_going, loop_body, loop_exit)?;

    builder.position_at_end(loop_body);
    let state = volatile_load(builder, i32_ty, slots.state, "decrypt.state")?;
    let new_state = builder.build_int_add(state, i32_ty.const_int(0x9E37_79B9, false), "decrypt.state.next")?;
    volatile_store(builder, slots.state, new_state)?;
    let shr16 = builder.build_right_shift(new_state, i32_ty.const_int(16, false), false, "decrypt.z.shr16")?;
    let z1 = builder.build_xor(new_state, shr16, "decrypt.z1")?;
    let z2 = builder.build_int_mul(z1, i32_ty.const_int(0x85EB_CA6B, false), "decrypt.z2")?;
    let shr13 = builder.build_right_shift(z2, i32_ty.const_int(13, false), false, "decrypt.z.shr13")?;
    let z3 = builder.build_xor(z2, shr13, "decrypt.z3")?;
    let z4 = builder.build_int_mul(z3, i32_ty.const_int(0xC2B2_AE35, false), "decrypt.z4")?;
    let shr16b = builder.build_right_shift(z4, i32_ty.const_int(16, false), false, "decrypt.z.shr16b")?;
    let key_stream = builder.build_xor(z4, shr16b, "decrypt.keystream")?;

    let remaining = builder.build_int_sub(length, offset, "decrypt.remaining")?;
    let remaining_lt_4 = builder.build_int_compare(
        IntPredicate::ULT,
        remaining,
        i32_ty.const_int(4, false),
        "decrypt.chunk.cmp",
    )?;
    let chunk = builder
        .build_select(remaining_lt_4, remaining, i32_ty.const_int(4, false), "decrypt.chunk")?
        .into_int_value();

    volatile_store(builder, slots.j, i32_ty.const_zero())?;
    builder.build_unconditional_branch(chunk_header)?;

    builder.position_at_end(chunk_header);
    let j = volatile_load(builder, i32_ty, slots.j, "decrypt.j")?;
    let chunk_cond = builder.build_int_compare(IntPredicate::ULT, j, chunk, "decrypt.chunk.cond")?;
    builder.build_conditional_branch(chunk_cond, chunk_body, chunk_exit)?;

    builder.position_at_end(chunk_body);
    let byte_offset = builder.build_int_add(offset, j, "decrypt.byteoffset")?;
    let in_byte_ptr = unsafe { builder.build_gep(i8_ty, in_ptr, &[byte_offset], "decrypt.in.gep")? };
    let plain_or_cipher = builder
        .build_load(i8_ty, in_byte_ptr, "decrypt.in.byte")?
        .into_int_value();
    let shift_amount = builder.build_int_mul(j, i32_ty.const_int(8, false), "decrypt.shiftamt")?;
    let key_byte32 = builder.build_right_shift(key_stream, shift_amount, false, "decrypt.keybyte32")?;
    let key_byte = builder.build_int_truncate(key_byte32, i8_ty, "decrypt.keybyte")?;
    let out_byte = builder.build_xor(plain_or_cipher, key_byte, "decrypt.outbyte")?;
    let out_byte_ptr = unsafe { builder.build_gep(i8_ty, out_ptr, &[byte_offset], "decrypt.out.gep")? };
    builder.build_store(out_byte_ptr, out_byte)?;
    let j_next = builder.build_int_add(j, i32_ty.const_int(1, false), "decrypt.j.next")?;
    volatile_store(builder, slots.j, j_next)?;
    builder.build_unconditional_branch(chunk_header)?;

    builder.position_at_end(chunk_exit);
    let offset_next = builder.build_int_add(offset, chunk, "decrypt.offset.next")?;
    volatile_store(builder, slots.offset, offset_next)?;
    builder.build_unconditional_branch(loop_header)?;

    builder.position_at_end(loop_exit);
    Ok(loop_exit)
}

/// Splits the block containing `split_point` so that `split_point` and every
/// instruction after it move into a freshly appended block; the original
/// block falls through to it unconditionally (the caller is expected to
/// replace that fallthrough once it has inserted its own IR in between).
fn split_block_before<'ctx>(
    context: &'ctx Context,
    builder: &Builder<'ctx>,
    split_point: InstructionValue<'ctx>,
    name: &str,
) -> BasicBlock<'ctx> {
    let old_block = split_point.get_parent().expect("instruction belongs to a block");
    let new_block = context.insert_basic_block_after(old_block, name);

    let mut cursor = Some(split_point);
    while let Some(instr) = cursor {
        let next = instr.get_next_instruction();
        instr.remove_from_basic_block();
        builder.position_at_end(new_block);
        let _ = builder.insert_instruction(&instr, None);
        cursor = next;
    }

    builder.position_at_end(old_block);
    let _ = builder.build_unconditional_branch(new_block);

    new_block
}
