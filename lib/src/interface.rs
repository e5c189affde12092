/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

// This is the top level interface for the domainfix library.

use std::fmt;

use crate::analysis::CFGInfo;
use crate::pass::DomainFixer;

// Stuff that is defined by the library

pub use crate::data_structures::Map;
pub use crate::data_structures::MyRange;
pub use crate::data_structures::TypedIxVec;
pub use crate::data_structures::{BlockIx, InstIx};

// Registers, domains, operands and the universe of tracked registers.

pub use crate::data_structures::RealReg;
pub use crate::data_structures::RegUniverse;
pub use crate::data_structures::{DomainMask, ExecDomain};
pub use crate::data_structures::{OperandKind, RegOperand, RegOperandVec};

// Reference-count conservation counters, reported in the stats.

pub use crate::domain_value::ValueCounters;

/// How an instruction relates to the target's execution domains.
#[derive(Copy, Clone, Debug)]
pub enum DomainBehavior {
  /// Not domain-classified.  A def by such an instruction ends whatever
  /// domain chain its register was on.
  None,
  /// Executes in exactly one domain.
  Hard(ExecDomain),
  /// Could execute in any domain of the (non-empty) mask; the pass picks by
  /// merging the operands' live domain values.
  Soft(DomainMask),
}

/// A trait defined by the client to provide access to its
/// machine-instruction / CFG representation.
///
/// The pass runs after register allocation: every register mentioned is
/// physical, and control flow is final.
pub trait Function {
  /// The pass is parameterized on F: Function and so can use the projected
  /// type F::Inst.
  type Inst;

  // -------------
  // CFG traversal
  // -------------

  /// Allow iteration over basic blocks (in instruction order).
  fn blocks(&self) -> MyRange<BlockIx>;

  /// The function's entry block.
  fn entry_block(&self) -> BlockIx;

  /// Provide the range of instruction indices contained in each block.
  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx>;

  /// Get CFG successors for a given block.
  fn block_succs(&self, block: BlockIx) -> Vec<BlockIx>;

  // -----------
  // Instructions
  // -----------

  fn insn(&self, iix: InstIx) -> &Self::Inst;

  fn insn_mut(&mut self, iix: InstIx) -> &mut Self::Inst;

  /// Is this a metadata / debug-value instruction?  Such instructions are
  /// not walked and do not count towards clearance distances.
  fn is_meta(&self, insn: &Self::Inst) -> bool;

  /// Registers live-in to the function.  They are treated as written just
  /// before the entry block's first instruction.
  fn func_liveins(&self) -> Vec<RealReg>;
}

/// The target-specific half of the interface: domain classification,
/// clearance thresholds and the two instruction-rewriting hooks.  Calling
/// `choose_substitute_register` or `break_dependency` is the only way the
/// pass modifies instructions.
pub trait DomainTarget<I> {
  /// Classify the instruction's execution-domain behaviour.
  fn domain_behavior(&self, insn: &I) -> DomainBehavior;

  /// The instruction's register operands, in operand-index order.  The
  /// positions in this list are the operand indices the clearance queries
  /// and rewriting hooks speak about.
  fn reg_operands(&self, insn: &I) -> RegOperandVec;

  /// Is this a domain-preserving register copy?  Returns (dst, src).
  fn is_move(&self, insn: &I) -> Option<(RealReg, RealReg)>;

  /// If the instruction reads a register whose value is undef and the false
  /// dependency matters, the operand index of that read and the minimum
  /// clearance (instructions since last write) below which the dependency
  /// should be broken.
  fn undef_read_clearance(&self, insn: &I) -> Option<(usize, u32)>;

  /// For a def operand that only partially updates a wider register, the
  /// minimum clearance below which the dependency should be broken.
  fn partial_update_clearance(&self, insn: &I, op_idx: usize) -> Option<u32>;

  /// The registers operand `op_idx` could legally be retargeted to (its
  /// register class, in allocation order).  Only consulted for undef reads.
  fn substitute_candidates(&self, insn: &I, op_idx: usize) -> Vec<RealReg>;

  /// Retarget the undef read at `op_idx` to the first acceptable register
  /// of `candidates` (ordered most preferred first).
  fn choose_substitute_register(
    &self, insn: &mut I, op_idx: usize, candidates: &[RealReg],
  );

  /// Rewrite the instruction so that operand `op_idx` no longer depends on
  /// the register's previous value (typically by zeroing the register with
  /// a dependency-breaking idiom).
  fn break_dependency(&self, insn: &mut I, op_idx: usize);
}

/// Statistics from one run of the pass.  The pass's semantic output is its
/// in-place instruction rewrites; this exists for logging and tests.
#[derive(Clone, Debug)]
pub struct FixStats {
  /// How many times each block went through the block processor.
  pub visits: TypedIxVec<BlockIx, u32>,
  /// Undef reads retargeted to a different register.
  pub substitutions: u32,
  /// Dependencies broken for undef reads.
  pub undef_breaks: u32,
  /// Dependencies broken for partial-register updates.
  pub partial_breaks: u32,
  /// Domain-value reference counting totals.
  pub value_counters: ValueCounters,
}

impl FixStats {
  pub(crate) fn new(n_blocks: u32) -> Self {
    let mut visits = TypedIxVec::new();
    visits.resize(n_blocks, 0);
    FixStats {
      visits,
      substitutions: 0,
      undef_breaks: 0,
      partial_breaks: 0,
      value_counters: ValueCounters::default(),
    }
  }
}

/// Input-contract violations.  Internal invariant violations are bugs in
/// the pass or the client and assert instead.
#[derive(Clone, Debug)]
pub enum DomainFixError {
  /// The function has no basic blocks.
  EmptyFunction,
  /// The entry block is outside the function's block range.
  BadEntryBlock(BlockIx),
}

impl fmt::Display for DomainFixError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      DomainFixError::EmptyFunction => {
        write!(fmt, "function has no basic blocks")
      }
      DomainFixError::BadEntryBlock(bix) => {
        write!(fmt, "entry block {:?} is not a block of the function", bix)
      }
    }
  }
}

/// Fix execution domains and break false dependencies for one function's
/// code.  Mutates the instruction stream in place through the target's
/// rewriting hooks; control flow and register assignments are untouched.
pub fn fix_execution_domains<F, T>(
  func: &mut F, target: &T, universe: &RegUniverse,
) -> Result<FixStats, DomainFixError>
where
  F: Function,
  T: DomainTarget<F::Inst>,
{
  let blocks = func.blocks();
  debug_assert!(blocks.start().get() == 0, "blocks must be numbered from 0");
  let n_blocks = blocks.end().get() - blocks.start().get();
  if n_blocks == 0 {
    return Err(DomainFixError::EmptyFunction);
  }
  let entry = func.entry_block();
  if entry.get() >= n_blocks {
    return Err(DomainFixError::BadEntryBlock(entry));
  }

  let cfg = CFGInfo::create(func);
  Ok(DomainFixer::new(func, target, universe, cfg).run())
}
