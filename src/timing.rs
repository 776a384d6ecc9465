//! Pentium U/V pairing timing model (C8, spec.md §4.8). The `pair_timings`
//! matrix and pairing classes are taken directly from
//! `examples/original_source/src/codegen_timing_pentium.c`: each instruction is
//! classified as Reg/RM/RMW/Branch timing and as pairing in the U pipe, V pipe,
//! both, or not at all; two consecutive instructions pair (run in the same
//! cycle slot) when the first's class allows U-pairing and the second's allows
//! V-pairing.

use crate::decoder::{DecodedInstruction, Op, RmOperand, StringOp};
use crate::error::Invariant;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimingClass {
    Reg,
    Rm,
    Rmw,
    Branch,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PairClass {
    NotPairable,
    PairsU,
    PairsV,
    PairsEither,
}

/// `pair_timings[class1][class2]`: base cycle cost when an instruction of
/// `class1` is immediately followed by one of `class2`. `Branch` as the first
/// slot has no meaningful entry (a branch always ends a pairing opportunity),
/// mirrored from the original's `-1` sentinels.
const PAIR_TIMINGS: [[i64; 4]; 4] = [
    [1, 2, 3, 2],
    [2, 2, 3, 3],
    [3, 4, 5, 4],
    [-1, -1, -1, -1],
];

fn class_index(class: TimingClass) -> usize {
    match class {
        TimingClass::Reg => 0,
        TimingClass::Rm => 1,
        TimingClass::Rmw => 2,
        TimingClass::Branch => 3,
    }
}

/// Looks up the base cycle cost for two instructions in program order.
/// Returns [`Invariant::IllegalPairTiming`] for the undefined "a branch starts
/// a pair" cells, which should never be queried (a branch always terminates a
/// basic block before a pairing decision is made).
pub fn pair_timings(
    table: &[[i64; 4]; 4],
    first: TimingClass,
    second: TimingClass,
) -> Result<i64, Invariant> {
    let cost = table[class_index(first)][class_index(second)];
    if cost < 0 {
        Err(Invariant::IllegalPairTiming("branch-as-first-of-pair"))
    } else {
        Ok(cost)
    }
}

/// Picks the pair-timing table for a configured `cpu_model`. Only the Pentium
/// table is modeled; an unrecognized model falls back to it rather than
/// rejecting the configuration outright.
pub fn pair_timings_table(cpu_model: &str) -> &'static [[i64; 4]; 4] {
    match cpu_model.to_ascii_lowercase().as_str() {
        "pentium" | "" => &PAIR_TIMINGS,
        other => {
            log::warn!("no dedicated timing table for cpu_model={other:?}, using pentium table");
            &PAIR_TIMINGS
        }
    }
}

/// Classifies a decoded instruction into a pairing/timing bucket. Any
/// instruction that ends a block (jumps, calls, returns, loops, interrupts)
/// is `Branch`; register-form ALU/move ops are `Reg`; a memory operand that is
/// only read is `Rm`; a memory operand that is read-modify-written is `Rmw`.
pub fn classify_instruction(instr: &DecodedInstruction) -> TimingClass {
    if instr.is_block_end {
        return TimingClass::Branch;
    }
    match instr.op {
        Op::Push | Op::PushImm | Op::Pop => return TimingClass::Rm,
        Op::StringOp(StringOp::Movs) | Op::StringOp(StringOp::Stos) => return TimingClass::Rmw,
        Op::StringOp(StringOp::Cmps) | Op::StringOp(StringOp::Scas) | Op::StringOp(StringOp::Lods) => {
            return TimingClass::Rm
        }
        Op::Lea => return TimingClass::Reg,
        _ => {}
    }

    let memory_operand = matches!(instr.rm, Some(RmOperand::Memory(_)));
    if !memory_operand {
        return TimingClass::Reg;
    }

    match instr.op {
        Op::Alu { reg_is_dest: false, .. }
        | Op::AluImm { .. }
        | Op::Not
        | Op::Neg
        | Op::IncRm
        | Op::DecRm
        | Op::Shift(_) => TimingClass::Rmw,
        _ => TimingClass::Rm,
    }
}

/// Maps a timing class to the pairing class it contributes as either half of
/// a pair. `Rmw` only ever pairs in the U pipe (the original disallows a
/// read-modify-write in the V slot); `Branch` never pairs.
pub fn pair_class_for(class: TimingClass) -> PairClass {
    match class {
        TimingClass::Reg | TimingClass::Rm => PairClass::PairsEither,
        TimingClass::Rmw => PairClass::PairsU,
        TimingClass::Branch => PairClass::NotPairable,
    }
}

/// Whether two adjacent instructions with the given pairing classes actually
/// pair this cycle (spec.md §4.8: "the first must allow U-pairing and the
/// second V-pairing").
pub fn can_pair(first: PairClass, second: PairClass) -> bool {
    let first_u = matches!(first, PairClass::PairsU | PairClass::PairsEither);
    let second_v = matches!(second, PairClass::PairsV | PairClass::PairsEither);
    first_u && second_v
}

/// Extra decode-stall cycles charged for an instruction carrying prefix bytes
/// (operand-size/address-size override, segment override, REP/REPNE, LOCK),
/// per the original's documented "prefix decode delay (including shadowing)".
/// Each prefix byte beyond the opcode costs one extra decode cycle.
pub fn prefix_decode_delay(prefix_count: u32) -> i64 {
    prefix_count as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_reg_pair_costs_one_cycle() {
        assert_eq!(
            pair_timings(&PAIR_TIMINGS, TimingClass::Reg, TimingClass::Reg).unwrap(),
            1
        );
    }

    #[test]
    fn rmw_rmw_is_the_most_expensive_pair() {
        assert_eq!(
            pair_timings(&PAIR_TIMINGS, TimingClass::Rmw, TimingClass::Rmw).unwrap(),
            5
        );
    }

    #[test]
    fn branch_first_is_illegal_pair_timing() {
        assert!(pair_timings(&PAIR_TIMINGS, TimingClass::Branch, TimingClass::Reg).is_err());
    }

    #[test]
    fn unrecognized_cpu_model_falls_back_to_pentium_table() {
        assert_eq!(pair_timings_table("486") as *const _, &PAIR_TIMINGS as *const _);
        assert_eq!(pair_timings_table("pentium") as *const _, &PAIR_TIMINGS as *const _);
    }

    #[test]
    fn u_then_v_pairs_but_v_then_u_does_not() {
        assert!(can_pair(PairClass::PairsU, PairClass::PairsV));
        assert!(!can_pair(PairClass::PairsV, PairClass::PairsU));
        assert!(can_pair(PairClass::PairsEither, PairClass::PairsEither));
        assert!(!can_pair(PairClass::NotPairable, PairClass::PairsV));
    }
}
