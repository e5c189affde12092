/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! As part of this set of test cases, we define a mini vector ISA and
//! implement the `Function` and `DomainTarget` traits for it so that we can
//! use the domainfix public interface.
//!
//! The ISA has eight vector registers v0..v7 (the tracked set), four wide
//! registers q0..q3 each overlapping a pair of vector registers, and four
//! general-purpose registers r0..r3 the pass does not track.  Vector values
//! live in one of two execution domains, integer and float; bitwise/shuffle
//! style operations can execute in either.

use domainfix::{
  BlockIx, DomainBehavior, DomainMask, DomainTarget, ExecDomain, Function,
  InstIx, MyRange, RealReg, RegOperand, RegOperandVec, RegUniverse,
  TypedIxVec,
};
use rustc_hash::FxHashMap;
use smallvec::smallvec;

use std::fmt;

//=============================================================================
// Registers and domains

pub type Reg = RealReg;

pub const NUM_VEC_REGS: u32 = 8;
pub const NUM_WIDE_REGS: u32 = 4;

/// v0..v7: the tracked vector registers.
pub fn vreg(i: u32) -> Reg {
  debug_assert!(i < NUM_VEC_REGS);
  RealReg::new(i)
}
/// q0..q3: wide registers; q_i overlaps v_{2i} and v_{2i+1}.
pub fn qreg(i: u32) -> Reg {
  debug_assert!(i < NUM_WIDE_REGS);
  RealReg::new(NUM_VEC_REGS + i)
}
/// r0..r3: untracked general-purpose registers.
pub fn gpr(i: u32) -> Reg {
  debug_assert!(i < 4);
  RealReg::new(NUM_VEC_REGS + NUM_WIDE_REGS + i)
}

pub const DOM_INT: ExecDomain = ExecDomain::new(0);
pub const DOM_FLT: ExecDomain = ExecDomain::new(1);

pub fn any_domain() -> DomainMask {
  let mut m = DomainMask::single(DOM_INT);
  m.insert(DOM_FLT);
  m
}

/// The universe of tracked registers: v0..v7, with the q registers folded in
/// through the overlap relation.
pub fn make_universe() -> RegUniverse {
  let tracked: Vec<Reg> = (0..NUM_VEC_REGS).map(vreg).collect();
  RegUniverse::new(tracked, |r| {
    debug_assert!(r.get_index() < NUM_VEC_REGS as usize);
    vec![qreg(r.get_index() as u32 / 2)]
  })
}

// Clearance thresholds the "target" reports; in the same spirit as real
// hardware numbers, a partial update is worth breaking for longer than an
// undef read.
pub const UNDEF_READ_CLEARANCE: u32 = 8;
pub const PARTIAL_UPDATE_CLEARANCE: u32 = 16;

//=============================================================================
// Labels

#[derive(Clone)]
pub enum Label {
  Unresolved { name: String },
  Resolved { name: String, bix: BlockIx },
}
impl fmt::Debug for Label {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Label::Unresolved { name } => write!(fmt, "??:{}", &name),
      Label::Resolved { name, bix } => write!(fmt, "{:?}:{}", bix, name),
    }
  }
}
impl Label {
  pub fn unresolved(name: &str) -> Label {
    Label::Unresolved { name: name.to_string() }
  }
  pub fn get_block_ix(&self) -> BlockIx {
    match self {
      Label::Resolved { name: _, bix } => *bix,
      Label::Unresolved { .. } => {
        panic!("Label::get_block_ix: unresolved label!")
      }
    }
  }
  fn resolve(&mut self, map: &FxHashMap<String, BlockIx>) {
    if let Label::Unresolved { name } = self {
      let bix = match map.get(name) {
        Some(bix) => *bix,
        None => panic!("Label::resolve: no block '{}'", name),
      };
      let name = name.clone();
      *self = Label::Resolved { name, bix };
    }
  }
}

//=============================================================================
// Instructions.  Destinations are on the left.

#[derive(Clone)]
pub enum Inst {
  /// Load an immediate into a general-purpose register.
  Imm { dst: Reg, imm: u32 },
  /// Integer-domain vector op.
  IntOp { dst: Reg, src_l: Reg, src_r: Reg },
  /// Float-domain vector op.
  FltOp { dst: Reg, src_l: Reg, src_r: Reg },
  /// Bitwise/shuffle-style vector op; either domain works.
  AnyOp { dst: Reg, src_l: Reg, src_r: Reg },
  /// Vector register copy; keeps the source's domain.
  Mov { dst: Reg, src: Reg },
  /// Fill a wide register from memory.  Not domain-classified.
  LoadWide { dst: Reg },
  /// Convert a general-purpose value into the low lane of `dst`, leaving
  /// the remaining lanes as they were: a partial register update.  The
  /// rewrite hook marks `broken` instead of inserting a zeroing idiom.
  Cvt { dst: Reg, src: Reg, broken: bool },
  /// Unary float op whose encoding also reads `pad` for its upper lanes,
  /// with the value being irrelevant: an undef read.
  PadOp { dst: Reg, src: Reg, pad: Reg, broken: bool },
  /// A debug marker carrying no code.
  DebugMark,
  Goto { target: Label },
  GotoIf { cond: Reg, target: Label },
  Ret,
}

pub fn i_imm(dst: Reg, imm: u32) -> Inst {
  Inst::Imm { dst, imm }
}
pub fn i_int_op(dst: Reg, src_l: Reg, src_r: Reg) -> Inst {
  Inst::IntOp { dst, src_l, src_r }
}
pub fn i_flt_op(dst: Reg, src_l: Reg, src_r: Reg) -> Inst {
  Inst::FltOp { dst, src_l, src_r }
}
pub fn i_any_op(dst: Reg, src_l: Reg, src_r: Reg) -> Inst {
  Inst::AnyOp { dst, src_l, src_r }
}
pub fn i_mov(dst: Reg, src: Reg) -> Inst {
  Inst::Mov { dst, src }
}
pub fn i_load_wide(dst: Reg) -> Inst {
  Inst::LoadWide { dst }
}
pub fn i_cvt(dst: Reg, src: Reg) -> Inst {
  Inst::Cvt { dst, src, broken: false }
}
pub fn i_pad_op(dst: Reg, src: Reg, pad: Reg) -> Inst {
  Inst::PadOp { dst, src, pad, broken: false }
}
pub fn i_goto(target: &str) -> Inst {
  Inst::Goto { target: Label::unresolved(target) }
}
pub fn i_goto_if(cond: Reg, target: &str) -> Inst {
  Inst::GotoIf { cond, target: Label::unresolved(target) }
}
pub fn i_ret() -> Inst {
  Inst::Ret
}

impl fmt::Debug for Inst {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Inst::Imm { dst, imm } => write!(fmt, "imm     {:?}, {}", dst, imm),
      Inst::IntOp { dst, src_l, src_r } => {
        write!(fmt, "vaddi   {:?}, {:?}, {:?}", dst, src_l, src_r)
      }
      Inst::FltOp { dst, src_l, src_r } => {
        write!(fmt, "vaddf   {:?}, {:?}, {:?}", dst, src_l, src_r)
      }
      Inst::AnyOp { dst, src_l, src_r } => {
        write!(fmt, "vxor    {:?}, {:?}, {:?}", dst, src_l, src_r)
      }
      Inst::Mov { dst, src } => write!(fmt, "vmov    {:?}, {:?}", dst, src),
      Inst::LoadWide { dst } => write!(fmt, "ldq     {:?}, [..]", dst),
      Inst::Cvt { dst, src, broken } => write!(
        fmt,
        "cvt     {:?}.lo, {:?}{}",
        dst,
        src,
        if *broken { "  ; dep broken" } else { "" }
      ),
      Inst::PadOp { dst, src, pad, broken } => write!(
        fmt,
        "vsqrt   {:?}, {:?} (pad {:?}){}",
        dst,
        src,
        pad,
        if *broken { "  ; dep broken" } else { "" }
      ),
      Inst::DebugMark => write!(fmt, "--mark--"),
      Inst::Goto { target } => write!(fmt, "goto    {:?}", target),
      Inst::GotoIf { cond, target } => {
        write!(fmt, "goto    if {:?}, {:?}", cond, target)
      }
      Inst::Ret => write!(fmt, "ret"),
    }
  }
}

impl Inst {
  fn targets_mut(&mut self) -> Option<&mut Label> {
    match self {
      Inst::Goto { target } | Inst::GotoIf { target, .. } => Some(target),
      _ => None,
    }
  }
  fn target(&self) -> Option<&Label> {
    match self {
      Inst::Goto { target } | Inst::GotoIf { target, .. } => Some(target),
      _ => None,
    }
  }
}

//=============================================================================
// The test-framework function

#[derive(Clone)]
pub struct Block {
  pub name: String,
  pub start: InstIx,
  pub len: u32,
}

pub struct Func {
  pub name: String,
  pub entry: Label,
  pub insns: TypedIxVec<InstIx, Inst>,
  pub blocks: TypedIxVec<BlockIx, Block>,
  pub liveins: Vec<Reg>,
}

impl Func {
  pub fn new(name: &str, entry: &str) -> Self {
    Func {
      name: name.to_string(),
      entry: Label::unresolved(entry),
      insns: TypedIxVec::new(),
      blocks: TypedIxVec::new(),
      liveins: Vec::new(),
    }
  }

  /// Append a block made of `insns`.
  pub fn block(&mut self, name: &str, insns: Vec<Inst>) {
    let start = InstIx::new(self.insns.len());
    let len = insns.len() as u32;
    for i in insns {
      self.insns.push(i);
    }
    self.blocks.push(Block { name: name.to_string(), start, len });
  }

  /// Resolve all labels.  Must be called exactly once, after the last
  /// `block` and before handing the Func to the pass.
  pub fn finish(&mut self) {
    let mut by_name = FxHashMap::<String, BlockIx>::default();
    for (i, blk) in (0..).zip(self.blocks.iter()) {
      if by_name.insert(blk.name.clone(), BlockIx::new(i)).is_some() {
        panic!("Func::finish: duplicate block name '{}'", blk.name);
      }
    }
    for insn in self.insns.iter_mut() {
      if let Some(label) = insn.targets_mut() {
        label.resolve(&by_name);
      }
    }
    self.entry.resolve(&by_name);
  }

  pub fn print(&self, who: &str) {
    println!("");
    println!("Func {}: {}", self.name, who);
    for (i, blk) in (0..).zip(self.blocks.iter()) {
      println!("  {:?}: {}", BlockIx::new(i), blk.name);
      for iix in blk.start.dotdot(blk.start.plus(blk.len)) {
        println!("    {:?}   {:?}", iix, self.insns[iix]);
      }
    }
  }
}

impl Function for Func {
  type Inst = Inst;

  fn blocks(&self) -> MyRange<BlockIx> {
    BlockIx::new(0).dotdot(BlockIx::new(self.blocks.len()))
  }
  fn entry_block(&self) -> BlockIx {
    self.entry.get_block_ix()
  }
  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx> {
    let blk = &self.blocks[block];
    blk.start.dotdot(blk.start.plus(blk.len))
  }
  fn block_succs(&self, block: BlockIx) -> Vec<BlockIx> {
    let blk = &self.blocks[block];
    let mut succs = Vec::new();
    for iix in blk.start.dotdot(blk.start.plus(blk.len)) {
      if let Some(label) = self.insns[iix].target() {
        succs.push(label.get_block_ix());
      }
    }
    succs
  }
  fn insn(&self, iix: InstIx) -> &Inst {
    &self.insns[iix]
  }
  fn insn_mut(&mut self, iix: InstIx) -> &mut Inst {
    &mut self.insns[iix]
  }
  fn is_meta(&self, insn: &Inst) -> bool {
    matches!(insn, Inst::DebugMark)
  }
  fn func_liveins(&self) -> Vec<Reg> {
    self.liveins.clone()
  }
}

//=============================================================================
// The "target" half: domain classification, clearances and rewrite hooks

pub struct VecIsa;

impl DomainTarget<Inst> for VecIsa {
  fn domain_behavior(&self, insn: &Inst) -> DomainBehavior {
    match insn {
      Inst::IntOp { .. } => DomainBehavior::Hard(DOM_INT),
      Inst::FltOp { .. } => DomainBehavior::Hard(DOM_FLT),
      Inst::Cvt { .. } | Inst::PadOp { .. } => DomainBehavior::Hard(DOM_FLT),
      Inst::AnyOp { .. } | Inst::Mov { .. } => {
        DomainBehavior::Soft(any_domain())
      }
      _ => DomainBehavior::None,
    }
  }

  fn reg_operands(&self, insn: &Inst) -> RegOperandVec {
    match insn {
      Inst::Imm { dst, .. } => smallvec![RegOperand::new_def(*dst)],
      Inst::IntOp { dst, src_l, src_r }
      | Inst::FltOp { dst, src_l, src_r }
      | Inst::AnyOp { dst, src_l, src_r } => smallvec![
        RegOperand::new_def(*dst),
        RegOperand::new_use(*src_l),
        RegOperand::new_use(*src_r)
      ],
      Inst::Mov { dst, src } => {
        smallvec![RegOperand::new_def(*dst), RegOperand::new_use(*src)]
      }
      Inst::LoadWide { dst } => smallvec![RegOperand::new_def(*dst)],
      Inst::Cvt { dst, src, .. } => {
        smallvec![RegOperand::new_def(*dst), RegOperand::new_use(*src)]
      }
      Inst::PadOp { dst, src, pad, .. } => smallvec![
        RegOperand::new_def(*dst),
        RegOperand::new_use(*src),
        RegOperand::new_undef_use(*pad)
      ],
      Inst::GotoIf { cond, .. } => smallvec![RegOperand::new_use(*cond)],
      _ => smallvec![],
    }
  }

  fn is_move(&self, insn: &Inst) -> Option<(Reg, Reg)> {
    match insn {
      Inst::Mov { dst, src } => Some((*dst, *src)),
      _ => None,
    }
  }

  fn undef_read_clearance(&self, insn: &Inst) -> Option<(usize, u32)> {
    match insn {
      Inst::PadOp { .. } => Some((2, UNDEF_READ_CLEARANCE)),
      _ => None,
    }
  }

  fn partial_update_clearance(&self, insn: &Inst, op_idx: usize) -> Option<u32> {
    match insn {
      Inst::Cvt { .. } if op_idx == 0 => Some(PARTIAL_UPDATE_CLEARANCE),
      _ => None,
    }
  }

  fn substitute_candidates(&self, insn: &Inst, op_idx: usize) -> Vec<Reg> {
    match insn {
      // The pad read may use any vector register.
      Inst::PadOp { .. } if op_idx == 2 => {
        (0..NUM_VEC_REGS).map(vreg).collect()
      }
      _ => vec![],
    }
  }

  fn choose_substitute_register(
    &self, insn: &mut Inst, op_idx: usize, candidates: &[Reg],
  ) {
    debug_assert!(!candidates.is_empty());
    match insn {
      Inst::PadOp { pad, .. } if op_idx == 2 => {
        *pad = candidates[0];
      }
      _ => panic!("choose_substitute_register: not an undef read"),
    }
  }

  fn break_dependency(&self, insn: &mut Inst, op_idx: usize) {
    match insn {
      Inst::Cvt { broken, .. } if op_idx == 0 => *broken = true,
      Inst::PadOp { broken, .. } if op_idx == 2 => *broken = true,
      _ => panic!("break_dependency: no dependency to break here"),
    }
  }
}
