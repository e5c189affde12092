/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Test cases for the domainfix test bench.  The interesting ones are built
//! around the situations the pass exists for: domain merges at control-flow
//! joins, partial updates and undef reads with low clearance, loops whose
//! definitions only become visible through the back edge, and dead
//! predecessors.

use crate::test_framework::*;

fn mk_straight_line() -> Func {
  let mut func = Func::new("straight_line", "b0");
  func.block(
    "b0",
    vec![
      i_any_op(vreg(0), vreg(4), vreg(4)),
      i_any_op(vreg(1), vreg(4), vreg(4)),
      i_any_op(vreg(2), vreg(0), vreg(1)),
      i_ret(),
    ],
  );
  func.finish();
  func
}

fn mk_two_domains() -> Func {
  let mut func = Func::new("two_domains", "b0");
  func.block(
    "b0",
    vec![
      i_int_op(vreg(0), vreg(0), vreg(0)),
      i_flt_op(vreg(1), vreg(0), vreg(1)),
      i_any_op(vreg(2), vreg(0), vreg(1)),
      i_mov(vreg(3), vreg(2)),
      i_ret(),
    ],
  );
  func.finish();
  func
}

fn mk_partial_update() -> Func {
  let mut func = Func::new("partial_update", "b0");
  func.block(
    "b0",
    vec![
      i_imm(gpr(0), 42),
      i_flt_op(vreg(0), vreg(1), vreg(1)),
      // v0 was written an instruction ago: the partial update would stall.
      i_cvt(vreg(0), gpr(0)),
      // v4 has not been touched for ages: leave this one alone.
      i_cvt(vreg(4), gpr(0)),
      i_ret(),
    ],
  );
  func.finish();
  func
}

fn mk_undef_pad_hot() -> Func {
  let mut func = Func::new("undef_pad_hot", "b0");
  // Every vector register is written just before the pad read, so whatever
  // the substitution picks is still below the clearance threshold.
  let mut insns: Vec<Inst> =
    (0..NUM_VEC_REGS).map(|i| i_flt_op(vreg(i), vreg(i), vreg(i))).collect();
  insns.push(i_pad_op(vreg(0), vreg(1), vreg(2)));
  insns.push(i_ret());
  func.block("b0", insns);
  func.finish();
  func
}

fn mk_undef_pad_cold() -> Func {
  let mut func = Func::new("undef_pad_cold", "b0");
  func.block(
    "b0",
    vec![
      i_flt_op(vreg(3), vreg(3), vreg(3)),
      // The pad register v3 is hot, but the true dependency v1 is not:
      // retargeting the pad read at it hides the false dependency for
      // free, no break needed.
      i_pad_op(vreg(0), vreg(1), vreg(3)),
      i_ret(),
    ],
  );
  func.finish();
  func
}

fn mk_wide_alias() -> Func {
  let mut func = Func::new("wide_alias", "b0");
  func.block(
    "b0",
    vec![
      i_imm(gpr(0), 7),
      // Writing q0 writes v0 and v1 as far as clearance is concerned.
      i_load_wide(qreg(0)),
      i_cvt(vreg(1), gpr(0)),
      i_cvt(vreg(5), gpr(0)),
      i_ret(),
    ],
  );
  func.finish();
  func
}

fn mk_diamond() -> Func {
  let mut func = Func::new("diamond", "b0");
  func.block(
    "b0",
    vec![
      i_imm(gpr(0), 1),
      i_any_op(vreg(0), vreg(4), vreg(4)),
      i_goto_if(gpr(0), "left"),
      i_goto("right"),
    ],
  );
  func
    .block("left", vec![i_int_op(vreg(1), vreg(0), vreg(0)), i_goto("join")]);
  func
    .block("right", vec![i_flt_op(vreg(1), vreg(0), vreg(0)), i_goto("join")]);
  func.block("join", vec![i_any_op(vreg(2), vreg(0), vreg(1)), i_ret()]);
  func.finish();
  func
}

fn mk_simple_loop() -> Func {
  let mut func = Func::new("simple_loop", "ph");
  func.block(
    "ph",
    vec![i_imm(gpr(0), 10), i_flt_op(vreg(0), vreg(2), vreg(2)), i_goto("a")],
  );
  // v1 is undefined along the preheader edge but written every iteration in
  // block b; the partial update here must see that write through the back
  // edge.
  func.block("a", vec![i_cvt(vreg(1), gpr(0)), i_goto("b")]);
  func.block("b", vec![i_flt_op(vreg(1), vreg(0), vreg(0)), i_goto("c")]);
  func.block("c", vec![i_goto_if(gpr(0), "a"), i_goto("d")]);
  func.block("d", vec![i_ret()]);
  func.finish();
  func
}

fn mk_dead_pred() -> Func {
  let mut func = Func::new("dead_pred", "start");
  func
    .block("start", vec![i_any_op(vreg(0), vreg(4), vreg(4)), i_goto("join")]);
  // Nothing jumps here, but it still counts as a predecessor of "join".
  func.block("dead", vec![i_int_op(vreg(0), vreg(0), vreg(0)), i_goto("join")]);
  func.block("join", vec![i_flt_op(vreg(1), vreg(0), vreg(0)), i_ret()]);
  func.finish();
  func
}

fn mk_no_vectors() -> Func {
  let mut func = Func::new("no_vectors", "b0");
  func.block("b0", vec![i_imm(gpr(0), 1), i_imm(gpr(1), 2), i_ret()]);
  func.finish();
  func
}

fn mk_meta_insns() -> Func {
  let mut func = Func::new("meta_insns", "b0");
  func.block(
    "b0",
    vec![
      i_imm(gpr(0), 42),
      i_flt_op(vreg(0), vreg(1), vreg(1)),
      Inst::DebugMark,
      Inst::DebugMark,
      // The markers must not count towards clearance: this is still only
      // one instruction after the write of v0.
      i_cvt(vreg(0), gpr(0)),
      i_ret(),
    ],
  );
  func.finish();
  func
}

//=============================================================================

// This is the list of available tests.  This function returns either the
// requested Func, or if not found, a list of the available ones.
pub fn find_func(name: &str) -> Result<Func, Vec<String>> {
  // This is really stupid.  Fortunately it's not performance critical :)
  let all_funcs = vec![
    mk_straight_line(),
    mk_two_domains(),
    mk_partial_update(),
    mk_undef_pad_hot(),
    mk_undef_pad_cold(),
    mk_wide_alias(),
    mk_diamond(),
    mk_simple_loop(),
    mk_dead_pred(),
    mk_no_vectors(),
    mk_meta_insns(),
  ];

  let mut all_names = Vec::new();
  for cand in &all_funcs {
    all_names.push(cand.name.clone());
  }

  for cand in all_funcs {
    if cand.name == *name {
      return Ok(cand);
    }
  }

  all_names.sort();
  Err(all_names)
}
