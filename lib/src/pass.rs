/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The execution-domain fixup pass proper.
//!
//! Two things are tracked for every interesting physical register: which
//! execution domain(s) its current value could live in (a reference-counted
//! `DomainValue`), and its clearance, the number of instructions since it was
//! last written.  Low clearance on an undef read or a partial-register update
//! means a false dependency worth breaking.
//!
//! Clearance on a block's entry depends on the state flowing out of its
//! predecessors, so the driver visits blocks in reverse postorder and keeps,
//! per block, counters from which it can tell when a block's incoming state
//! has stopped changing ("done").  A naive alternative (process everything
//! once, then reprocess every block that had an unprocessed predecessor) is
//! correct but reprocesses too much: "had an unknown predecessor" is a
//! block-local signal, so a loop's tail looks settled while it still depends,
//! through the loop header, on state that was not final.  The counters below
//! make finality a transitively propagated property instead: when the last
//! outstanding predecessor of a block reports in as done, the block is
//! reprocessed once with final information and the fact cascades to its
//! successors.  Blocks outside any cycle are never visited twice; blocks on
//! or downstream of a cycle are visited exactly twice.  A last sweep catches
//! blocks that can never become done because some predecessor is unreachable
//! from the entry and therefore never reports in at all.
//!
//! Dependency-breaking decisions are only made on a visit where the block is
//! known final; earlier visits skip them, which is free, because a later
//! visit is guaranteed in exactly those cases.

use log::{debug, trace};
use smallvec::SmallVec;

use crate::analysis::CFGInfo;
#[cfg(debug_assertions)]
use crate::analysis::RPO_UNREACHABLE;
use crate::data_structures::{
  BlockIx, DomainMask, ExecDomain, InstIx, RealReg, RegUniverse, TypedIxVec,
};
use crate::domain_value::{DomainValueArena, ValueIx};
use crate::interface::{DomainBehavior, DomainTarget, FixStats, Function};

// Local shorthands.
type SlotVec = SmallVec<[usize; 4]>;

/// Clearance sentinel: "not written for a long time", old enough to satisfy
/// any clearance threshold a target could report.
const DEF_ANCIENT: i32 = -(1 << 20);

//=============================================================================
// Per-register live state and per-block bookkeeping

#[derive(Clone)]
struct LiveReg {
  /// Instruction index (relative to the start of the current traversal) of
  /// the last write to this register.  Negative for writes that happened
  /// before the traversal started; saved exit states are rebased so that
  /// the distances are relative to the block end.
  def: i32,
  /// The domain value this register currently holds, if tracked.  The slot
  /// owns one reference.
  value: Option<ValueIx>,
}

#[derive(Clone)]
struct BlockInfo {
  /// Live-register state at the block's end as of its most recent
  /// processing, or `None` before the first one.  Replaced wholesale (old
  /// references released) on every reprocessing.
  out_regs: Option<Vec<LiveReg>>,
  /// Has this block's primary (reverse-postorder) pass run?
  primary_completed: bool,
  /// Predecessors whose primary pass has completed, as observed so far.
  incoming_processed: u32,
  /// Snapshot of `incoming_processed` taken when this block's own primary
  /// pass ran.  With a strict reverse postorder this is exactly the number
  /// of forward-edge predecessors.
  primary_incoming: u32,
  /// Predecessors that have reached the final "done" state.
  incoming_completed: u32,
}

impl BlockInfo {
  fn new() -> Self {
    BlockInfo {
      out_regs: None,
      primary_completed: false,
      incoming_processed: 0,
      primary_incoming: 0,
      incoming_completed: 0,
    }
  }
}

/// Which kind of visit a block is getting.  A reprocessing visit must not
/// re-run domain classification: hard/soft assignment and kill decisions
/// happened on the primary pass, and repeating them would kill values twice.
/// Only clearance bookkeeping and value propagation are redone.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum PassKind {
  Primary,
  Reprocess,
}

//=============================================================================
// The analysis context.  One per function; nothing survives `run`.

pub(crate) struct DomainFixer<'a, F: Function, T: DomainTarget<F::Inst>> {
  func: &'a mut F,
  target: &'a T,
  universe: &'a RegUniverse,
  cfg: CFGInfo,
  values: DomainValueArena,
  infos: TypedIxVec<BlockIx, BlockInfo>,
  /// Working live-register state for the block being processed, one slot
  /// per tracked register.
  live: Vec<LiveReg>,
  /// Index of the instruction being processed, counted from the start of
  /// the current block walk (meta instructions excluded).
  cur_instr: i32,
  /// Undef reads whose dependency we decided to break, queued so that the
  /// rewrites happen after the walk and cannot disturb it.
  undef_reads: Vec<(InstIx, usize)>,
  stats: FixStats,
}

impl<'a, F: Function, T: DomainTarget<F::Inst>> DomainFixer<'a, F, T> {
  pub(crate) fn new(
    func: &'a mut F, target: &'a T, universe: &'a RegUniverse, cfg: CFGInfo,
  ) -> Self {
    let n_blocks = cfg.pred_map.len();
    DomainFixer {
      func,
      target,
      universe,
      cfg,
      values: DomainValueArena::new(),
      infos: TypedIxVec::new(),
      live: Vec::new(),
      cur_instr: 0,
      undef_reads: Vec::new(),
      stats: FixStats::new(n_blocks),
    }
  }

  //===========================================================================
  // Live-register slot maintenance

  /// Drop whatever domain value `slot` holds.
  fn kill(&mut self, slot: usize) {
    if let Some(v) = self.live[slot].value.take() {
      self.values.release(v);
    }
  }

  /// Make `slot` hold `v` (releasing any previous value).
  fn set_live_value(&mut self, slot: usize, v: ValueIx) {
    if self.live[slot].value == Some(v) {
      return;
    }
    self.kill(slot);
    self.values.retain(v);
    self.live[slot].value = Some(v);
  }

  /// Pin `slot`'s value to `dom`, whatever it takes.  An open value that
  /// can reach `dom` is collapsed to it; an open value that cannot is
  /// collapsed to its own preference, and the crossing into `dom` is
  /// recorded as paid; an already-collapsed value likewise just records the
  /// extra domain.  An empty slot gets a fresh collapsed value.
  fn force(&mut self, slot: usize, dom: ExecDomain) {
    match self.values.resolve(&mut self.live[slot].value) {
      Some(v) => {
        if self.values.is_collapsed(v) {
          self.values.add_domain(v, dom);
        } else if self.values.has_domain(v, dom) {
          self.values.collapse(v, dom);
        } else {
          let first = self.values.first_domain(v);
          self.values.collapse(v, first);
          self.values.add_domain(v, dom);
        }
      }
      None => {
        self.live[slot].value = Some(self.values.alloc(DomainMask::single(dom)));
      }
    }
  }

  /// Clearance of `reg` just before the current instruction, or `u32::MAX`
  /// for untracked registers.
  fn clearance_of(&self, reg: RealReg) -> u32 {
    match self.universe.slots_of(reg).first() {
      Some(&slot) => (self.cur_instr - self.live[slot as usize].def) as u32,
      None => u32::MAX,
    }
  }

  //===========================================================================
  // Entering and leaving a block

  fn enter_block(&mut self, bix: BlockIx) {
    let n = self.universe.num_tracked();
    // Default state: nothing interesting happened for a long time.
    self.live.clear();
    self.live.resize(n, LiveReg { def: DEF_ANCIENT, value: None });
    self.cur_instr = 0;
    debug_assert!(self.undef_reads.is_empty());

    if self.cfg.pred_map[bix].is_empty() {
      // The entry block: function live-ins count as written just before
      // the first instruction.
      let uni = self.universe;
      for reg in self.func.func_liveins() {
        for &slot in uni.slots_of(reg) {
          self.live[slot as usize].def = -1;
        }
      }
      trace!("enter {:?}: entry", bix);
      return;
    }

    let preds: Vec<BlockIx> = self.cfg.pred_map[bix].clone();
    for pred in preds {
      // Predecessors with no saved exit state yet (back edges, blocks dead
      // from the entry) contribute nothing.
      let mut pred_out = match self.infos[pred].out_regs.take() {
        Some(o) => o,
        None => continue,
      };
      for slot in 0..n {
        // Use the most recent write on any incoming path.
        if pred_out[slot].def > self.live[slot].def {
          self.live[slot].def = pred_out[slot].def;
        }
        let pdv = match self.values.resolve(&mut pred_out[slot].value) {
          Some(v) => v,
          None => continue,
        };
        match self.values.resolve(&mut self.live[slot].value) {
          None => self.set_live_value(slot, pdv),
          Some(lv) => {
            if self.values.is_collapsed(lv) {
              // Already pinned here; pull the incoming value along if it
              // still can go there.
              let dom = self.values.first_domain(lv);
              if !self.values.is_collapsed(pdv)
                && self.values.has_domain(pdv, dom)
              {
                self.values.collapse(pdv, dom);
              }
            } else if !self.values.is_collapsed(pdv) {
              self.values.merge(lv, pdv);
            } else {
              self.force(slot, self.values.first_domain(pdv));
            }
          }
        }
      }
      self.infos[pred].out_regs = Some(pred_out);
    }
    trace!("enter {:?}: {} preds", bix, self.cfg.num_preds(bix));
  }

  fn leave_block(&mut self, bix: BlockIx) {
    // Save the live registers as the block's exit state, with the write
    // distances rebased so that re-entry can re-add its own instruction
    // counts.  The slots' value references move into the saved state.
    let mut out = std::mem::take(&mut self.live);
    for lr in out.iter_mut() {
      lr.def -= self.cur_instr;
    }
    if let Some(old) = self.infos[bix].out_regs.take() {
      for lr in old {
        if let Some(v) = lr.value {
          self.values.release(v);
        }
      }
    }
    self.infos[bix].out_regs = Some(out);
    trace!("leave {:?}", bix);
  }

  //===========================================================================
  // Instruction visits (primary pass only): domain classification

  /// Classify one instruction and update the domain values accordingly.
  /// Returns whether the instruction is a "kill" for clearance tracking:
  /// true exactly for unclassified (generic) instructions, whose defs end
  /// whatever domain chain their registers were on.
  fn visit_instr(&mut self, iix: InstIx) -> bool {
    let behavior = self.target.domain_behavior(self.func.insn(iix));
    match behavior {
      DomainBehavior::None => true,
      DomainBehavior::Hard(dom) => {
        self.visit_hard(iix, dom);
        false
      }
      DomainBehavior::Soft(mask) => {
        debug_assert!(!mask.is_empty(), "soft instruction with no domains");
        if mask.is_single() {
          self.visit_hard(iix, mask.first());
        } else {
          self.visit_soft(iix, mask);
        }
        false
      }
    }
  }

  fn visit_hard(&mut self, iix: InstIx, dom: ExecDomain) {
    let uni = self.universe;
    let ops = self.target.reg_operands(self.func.insn(iix));
    // Pin all uses to the instruction's domain.
    for op in ops.iter().filter(|op| op.is_use()) {
      for &slot in uni.slots_of(op.reg) {
        self.force(slot as usize, dom);
      }
    }
    // Defs start a fresh chain in that domain.
    for op in ops.iter().filter(|op| op.is_def()) {
      for &slot in uni.slots_of(op.reg) {
        let slot = slot as usize;
        self.kill(slot);
        self.force(slot, dom);
      }
    }
  }

  fn visit_soft(&mut self, iix: InstIx, mask: DomainMask) {
    let uni = self.universe;
    let ops = self.target.reg_operands(self.func.insn(iix));

    // Intersect the live candidate domains of the use operands into the
    // instruction's own mask, collecting the open values to merge.
    let mut available = mask;
    let mut used = SlotVec::new();
    for op in ops.iter().filter(|op| op.is_use()) {
      for &slot in uni.slots_of(op.reg) {
        let slot = slot as usize;
        let v = match self.values.resolve(&mut self.live[slot].value) {
          Some(v) => v,
          None => continue,
        };
        let common = self.values.avail(v).common(available);
        if self.values.is_collapsed(v) {
          // Using a pinned operand in its own domain is free, so restrict
          // to it when possible.  Otherwise this is a naked pinned
          // reference that will cost a crossing; leave it alone.
          if !common.is_empty() {
            available = common;
          }
        } else if !common.is_empty() {
          used.push(slot);
        } else {
          // Open but incompatible with this instruction; useless from
          // here on.
          self.kill(slot);
        }
      }
    }

    // If the pinned operands narrowed things down to one domain, this is
    // really a hard instruction.
    if available.is_single() {
      self.visit_hard(iix, available.first());
      return;
    }

    // Build the merge list: compatible open values, oldest write first, so
    // that popping from the back gives the most recent ones priority.
    let mut merge_slots = SlotVec::new();
    for &slot in used.iter() {
      let v = match self.values.resolve(&mut self.live[slot].value) {
        Some(v) => v,
        None => continue, // killed through an alias above
      };
      if self.values.avail(v).common(available).is_empty() {
        self.kill(slot);
        continue;
      }
      if !merge_slots.contains(&slot) {
        merge_slots.push(slot);
      }
    }
    merge_slots.sort_by_key(|&slot| self.live[slot].def);

    // Merge.  `dv` carries one temporary reference throughout.
    let mut dv: Option<ValueIx> = None;
    while let Some(slot) = merge_slots.pop() {
      let latest = match self.values.resolve(&mut self.live[slot].value) {
        Some(v) => v,
        None => continue,
      };
      let d = match dv {
        None => {
          // First value: narrow it to the instruction's candidates.
          self.values.retain(latest);
          let narrowed = self.values.avail(latest).common(available);
          self.values.narrow(latest, narrowed);
          dv = Some(latest);
          continue;
        }
        Some(d) => d,
      };
      if latest == d || self.values.is_collapsed(d) {
        continue;
      }
      match self.values.merge(d, latest) {
        Some(winner) => {
          if winner != d {
            // The other record survived; move our temporary reference.
            self.values.retain(winner);
            self.values.release(d);
            dv = Some(winner);
          }
        }
        None => {
          // Disagreeing operands: both sides are pinned to their own
          // domains now.  Proceed as if no common value existed.
          self.values.release(d);
          dv = None;
          break;
        }
      }
    }

    // `dv` is the value for this instruction's results.
    let dv = match dv {
      Some(d) => d,
      None => self.values.alloc(available),
    };
    // All defs, and any uses with no current value, adopt it.
    for op in ops.iter() {
      for &slot in uni.slots_of(op.reg) {
        let slot = slot as usize;
        match self.values.resolve(&mut self.live[slot].value) {
          None => self.set_live_value(slot, dv),
          Some(v) => {
            if op.is_def() && v != dv {
              self.set_live_value(slot, dv);
            }
          }
        }
      }
    }
    self.values.release(dv);
  }

  //===========================================================================
  // Clearance and def processing (every pass)

  fn process_defs(&mut self, iix: InstIx, break_dependency: bool, kill: bool) {
    let uni = self.universe;
    let target = self.target;

    // Handle undef reads before the def updates below, while the
    // clearances still describe the state just before this instruction.
    if break_dependency {
      if let Some((op_idx, pref)) =
        target.undef_read_clearance(self.func.insn(iix))
      {
        self.pick_substitute_register(iix, op_idx);
        if self.should_break_dependence(iix, op_idx, pref) {
          // Rewriting in place now could disturb the rest of the walk;
          // queue it for the end of the block.
          self.undef_reads.push((iix, op_idx));
        }
      }
    }

    let ops = target.reg_operands(self.func.insn(iix));
    let mv = target.is_move(self.func.insn(iix));
    for (op_idx, op) in ops.iter().enumerate() {
      if !op.is_def() {
        continue;
      }
      if break_dependency {
        // Check clearance before partial register updates.
        if let Some(pref) =
          target.partial_update_clearance(self.func.insn(iix), op_idx)
        {
          if self.should_break_dependence(iix, op_idx, pref) {
            debug!("breaking partial update at {:?} operand {}", iix, op_idx);
            target.break_dependency(self.func.insn_mut(iix), op_idx);
            self.stats.partial_breaks += 1;
          }
        }
      }
      for &slot in uni.slots_of(op.reg) {
        let slot = slot as usize;
        trace!("def {:?} (slot {}) at {}", op.reg, slot, self.cur_instr);
        self.live[slot].def = self.cur_instr;
        match mv {
          Some((dst, src)) if dst == op.reg => {
            // A domain-preserving copy carries the source's value across.
            let src_slots = uni.slots_of(src);
            let src_v = if src_slots.len() == 1 {
              let s = src_slots[0] as usize;
              self.values.resolve(&mut self.live[s].value)
            } else {
              None
            };
            match src_v {
              Some(v) => self.set_live_value(slot, v),
              None => self.kill(slot),
            }
          }
          _ => {
            // A generic instruction's def does not continue any tracked
            // domain chain.
            if kill {
              self.kill(slot);
            }
          }
        }
      }
    }
    self.cur_instr += 1;
  }

  /// Is the register behind operand `op_idx` too recently written for the
  /// given clearance requirement?
  fn should_break_dependence(
    &self, iix: InstIx, op_idx: usize, pref: u32,
  ) -> bool {
    let ops = self.target.reg_operands(self.func.insn(iix));
    let clearance = self.clearance_of(ops[op_idx].reg);
    if clearance == u32::MAX {
      return false;
    }
    if pref > clearance {
      trace!("clearance {} < pref {} at {:?}", clearance, pref, iix);
      return true;
    }
    false
  }

  /// An undef read is free to use any register its operand's class allows:
  /// retarget it at the most harmless one.  A register the instruction
  /// genuinely reads hides the false dependency behind a true one for
  /// free; failing that, prefer the candidate whose last write is furthest
  /// away.  The target applies the choice, so it can veto candidates the
  /// pass cannot judge.
  fn pick_substitute_register(&mut self, iix: InstIx, op_idx: usize) {
    let target = self.target;
    let ops = target.reg_operands(self.func.insn(iix));
    debug_assert!(ops[op_idx].is_use() && ops[op_idx].undef);
    let cur_reg = ops[op_idx].reg;
    let candidates = target.substitute_candidates(self.func.insn(iix), op_idx);
    if candidates.is_empty() {
      return;
    }

    for op in ops.iter() {
      if op.is_use() && !op.undef && candidates.contains(&op.reg) {
        if op.reg != cur_reg {
          trace!("hiding undef read at {:?} behind true dep {:?}", iix, op.reg);
          target.choose_substitute_register(
            self.func.insn_mut(iix),
            op_idx,
            &[op.reg],
          );
          self.stats.substitutions += 1;
        }
        return;
      }
    }

    let mut ranked: Vec<(u32, RealReg)> =
      candidates.iter().map(|&r| (self.clearance_of(r), r)).collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    let (best_clearance, best_reg) = ranked[0];
    if best_reg != cur_reg && best_clearance > self.clearance_of(cur_reg) {
      trace!("retargeting undef read at {:?} to {:?}", iix, best_reg);
      let regs: Vec<RealReg> = ranked.iter().map(|&(_, r)| r).collect();
      target.choose_substitute_register(self.func.insn_mut(iix), op_idx, &regs);
      self.stats.substitutions += 1;
    }
  }

  /// Perform the undef-read rewrites queued during the walk.  Only ever
  /// reached on a visit where the block is final, which happens exactly
  /// once per block, so no rewrite can be applied twice.
  fn process_undef_reads(&mut self) {
    if self.undef_reads.is_empty() {
      return;
    }
    let target = self.target;
    let entries = std::mem::take(&mut self.undef_reads);
    for (iix, op_idx) in entries {
      debug!("breaking undef read at {:?} operand {}", iix, op_idx);
      target.break_dependency(self.func.insn_mut(iix), op_idx);
      self.stats.undef_breaks += 1;
    }
  }

  //===========================================================================
  // The block processor

  fn process_block(&mut self, bix: BlockIx, kind: PassKind, block_final: bool) {
    debug!("processing {:?} ({:?}, final={})", bix, kind, block_final);
    self.stats.visits[bix] += 1;
    self.enter_block(bix);
    for iix in self.func.block_insns(bix) {
      if self.func.is_meta(self.func.insn(iix)) {
        continue;
      }
      let kill = match kind {
        PassKind::Primary => self.visit_instr(iix),
        PassKind::Reprocess => false,
      };
      self.process_defs(iix, block_final, kill);
    }
    if block_final {
      self.process_undef_reads();
    } else {
      debug_assert!(self.undef_reads.is_empty());
    }
    self.leave_block(bix);
  }

  //===========================================================================
  // The fixpoint driver

  fn is_block_done(&self, bix: BlockIx) -> bool {
    let info = &self.infos[bix];
    info.primary_completed
      && info.primary_incoming == info.incoming_completed
      && info.incoming_processed == self.cfg.num_preds(bix)
  }

  /// Tell `bix`'s successors that it has been (primary-)processed and/or
  /// become done.  A successor whose counters thereby satisfy the done
  /// predicate is immediately reprocessed with final information, and the
  /// news cascades onwards.  Implemented with an explicit work stack: a
  /// long chain of blocks can all become done at once, and each block
  /// finalizes at most once, so the stack is bounded by the block count.
  fn update_successors(&mut self, bix: BlockIx, primary: bool, done: bool) {
    let mut work: Vec<(BlockIx, bool, bool)> = vec![(bix, primary, done)];
    while let Some((b, primary, done)) = work.pop() {
      let succs: Vec<BlockIx> = self.cfg.succ_map[b].clone();
      for succ in succs {
        if self.is_block_done(succ) {
          // Already final; its counters no longer matter.
          continue;
        }
        {
          let si = &mut self.infos[succ];
          if primary {
            si.incoming_processed += 1;
          }
          if done {
            si.incoming_completed += 1;
          }
        }
        if self.is_block_done(succ) {
          // The last outstanding predecessor reported in: the merged
          // entry state is final now, so catch this block up.
          self.process_block(succ, PassKind::Reprocess, true);
          work.push((succ, false, true));
        }
      }
    }
  }

  #[cfg(debug_assertions)]
  fn check_rpo_snapshot(&self, bix: BlockIx) {
    // The finality bookkeeping assumes a strict reverse postorder: by the
    // time a block's primary pass runs, exactly its forward-edge
    // predecessors have reported in.  Irreducible control flow could break
    // this; it still terminates (the final sweep covers every block) but
    // forfeits the reprocessing-minimality argument.
    let my_pos = self.cfg.rpo_index[bix];
    let forward = self.cfg.pred_map[bix]
      .iter()
      .filter(|p| {
        let pos = self.cfg.rpo_index[**p];
        pos != RPO_UNREACHABLE && pos < my_pos
      })
      .count() as u32;
    debug_assert_eq!(
      self.infos[bix].incoming_processed, forward,
      "traversal is not a strict reverse postorder at {:?}",
      bix
    );
  }

  /// Does any non-meta instruction mention a tracked register at all?
  fn mentions_tracked_reg(&self) -> bool {
    let uni = self.universe;
    let target = self.target;
    for bix in self.func.blocks() {
      for iix in self.func.block_insns(bix) {
        let insn = self.func.insn(iix);
        if self.func.is_meta(insn) {
          continue;
        }
        if uni.mentions_tracked(&target.reg_operands(insn)) {
          return true;
        }
      }
    }
    false
  }

  pub(crate) fn run(mut self) -> FixStats {
    // Common case first: code that never touches a tracked register needs
    // no block records and no values.
    if !self.mentions_tracked_reg() {
      debug!("no tracked registers mentioned; nothing to do");
      return self.stats;
    }

    let n_blocks = self.cfg.pred_map.len();
    self.infos.resize(n_blocks, BlockInfo::new());

    let rpo = self.cfg.rpo.clone();
    for &bix in rpo.iter() {
      // incoming_processed and incoming_completed were already updated
      // while processing this block's predecessors.
      #[cfg(debug_assertions)]
      self.check_rpo_snapshot(bix);
      {
        let info = &mut self.infos[bix];
        info.primary_completed = true;
        info.primary_incoming = info.incoming_processed;
      }
      let done = self.is_block_done(bix);
      self.process_block(bix, PassKind::Primary, done);
      self.update_successors(bix, true, done);
    }

    // Finalize any block the cascade never reached.  This happens when one
    // of its predecessors is unreachable from the entry and so never
    // reports in.  The sweep itself covers every remaining block, so no
    // successor propagation is needed from here.
    for &bix in rpo.iter() {
      if !self.is_block_done(bix) {
        self.process_block(bix, PassKind::Reprocess, true);
      }
    }

    self.teardown();
    self.stats
  }

  //===========================================================================
  // Resource teardown

  fn teardown(&mut self) {
    let live = std::mem::take(&mut self.live);
    for lr in live {
      if let Some(v) = lr.value {
        self.values.release(v);
      }
    }
    let n_blocks = self.infos.len();
    for i in 0..n_blocks {
      let bix = BlockIx::new(i);
      if let Some(out) = self.infos[bix].out_regs.take() {
        for lr in out {
          if let Some(v) = lr.value {
            self.values.release(v);
          }
        }
      }
    }
    self.undef_reads.clear();
    debug_assert!(self.values.num_live() == 0, "domain values leaked");
    self.stats.value_counters = self.values.counters();
  }
}

//=============================================================================

#[cfg(test)]
mod test {
  use super::*;
  use crate::data_structures::{MyRange, RegOperand, RegOperandVec};
  use crate::interface::fix_execution_domains;
  use smallvec::smallvec;

  const NREGS: u32 = 4;

  fn dom(d: u8) -> ExecDomain {
    ExecDomain::new(d)
  }
  fn both() -> DomainMask {
    let mut m = DomainMask::single(dom(0));
    m.insert(dom(1));
    m
  }
  fn r(i: u32) -> RealReg {
    RealReg::new(i)
  }

  #[derive(Clone)]
  enum MInst {
    /// Domain-flexible def of `dst` from `srcs`.
    Soft { dst: RealReg, srcs: Vec<RealReg> },
    /// Fixed-domain def of `dst` from `srcs`.
    Hard { dst: RealReg, srcs: Vec<RealReg>, dom: ExecDomain },
    /// Generic (unclassified) def of `dst`.
    Gen { dst: RealReg },
    Ret,
  }

  struct MFunc {
    insts: Vec<MInst>,
    /// (first instruction, count) per block.
    block_ranges: Vec<(u32, u32)>,
    succs: Vec<Vec<BlockIx>>,
    liveins: Vec<RealReg>,
  }

  impl Function for MFunc {
    type Inst = MInst;
    fn blocks(&self) -> MyRange<BlockIx> {
      BlockIx::new(0).dotdot(BlockIx::new(self.block_ranges.len() as u32))
    }
    fn entry_block(&self) -> BlockIx {
      BlockIx::new(0)
    }
    fn block_insns(&self, b: BlockIx) -> MyRange<InstIx> {
      let (first, len) = self.block_ranges[b.get() as usize];
      InstIx::new(first).dotdot(InstIx::new(first + len))
    }
    fn block_succs(&self, b: BlockIx) -> Vec<BlockIx> {
      self.succs[b.get() as usize].clone()
    }
    fn insn(&self, iix: InstIx) -> &MInst {
      &self.insts[iix.get() as usize]
    }
    fn insn_mut(&mut self, iix: InstIx) -> &mut MInst {
      &mut self.insts[iix.get() as usize]
    }
    fn is_meta(&self, _insn: &MInst) -> bool {
      false
    }
    fn func_liveins(&self) -> Vec<RealReg> {
      self.liveins.clone()
    }
  }

  struct MTarget;
  impl DomainTarget<MInst> for MTarget {
    fn domain_behavior(&self, insn: &MInst) -> DomainBehavior {
      match insn {
        MInst::Soft { .. } => DomainBehavior::Soft(both()),
        MInst::Hard { dom, .. } => DomainBehavior::Hard(*dom),
        _ => DomainBehavior::None,
      }
    }
    fn reg_operands(&self, insn: &MInst) -> RegOperandVec {
      match insn {
        MInst::Soft { dst, srcs } | MInst::Hard { dst, srcs, .. } => {
          let mut v: RegOperandVec = smallvec![RegOperand::new_def(*dst)];
          for s in srcs {
            v.push(RegOperand::new_use(*s));
          }
          v
        }
        MInst::Gen { dst } => smallvec![RegOperand::new_def(*dst)],
        MInst::Ret => smallvec![],
      }
    }
    fn is_move(&self, _insn: &MInst) -> Option<(RealReg, RealReg)> {
      None
    }
    fn undef_read_clearance(&self, _insn: &MInst) -> Option<(usize, u32)> {
      None
    }
    fn partial_update_clearance(
      &self, _insn: &MInst, _op_idx: usize,
    ) -> Option<u32> {
      None
    }
    fn substitute_candidates(&self, _insn: &MInst, _op_idx: usize) -> Vec<RealReg> {
      vec![]
    }
    fn choose_substitute_register(
      &self, _insn: &mut MInst, _op_idx: usize, _candidates: &[RealReg],
    ) {
    }
    fn break_dependency(&self, _insn: &mut MInst, _op_idx: usize) {}
  }

  fn universe() -> RegUniverse {
    RegUniverse::new((0..NREGS).map(RealReg::new).collect(), |_| vec![])
  }

  fn b(i: u32) -> BlockIx {
    BlockIx::new(i)
  }

  #[test]
  fn straight_line_soft_merge() {
    // Two domain-flexible defs feeding a third soft instruction: the two
    // operand values must merge into one shared value that the result
    // register adopts, while the operands' write distances are untouched.
    let mut func = MFunc {
      insts: vec![
        MInst::Soft { dst: r(0), srcs: vec![] },
        MInst::Soft { dst: r(1), srcs: vec![] },
        MInst::Soft { dst: r(2), srcs: vec![r(0), r(1)] },
        MInst::Ret,
      ],
      block_ranges: vec![(0, 4)],
      succs: vec![vec![]],
      liveins: vec![],
    };
    let univ = universe();
    let target = MTarget;
    let cfg = CFGInfo::create(&func);
    let mut fixer = DomainFixer::new(&mut func, &target, &univ, cfg);
    fixer.infos.resize(1, BlockInfo::new());
    fixer.process_block(b(0), PassKind::Primary, true);

    let out = fixer.infos[b(0)].out_regs.as_ref().unwrap();
    // Write distances, rebased to the block end (4 instructions walked).
    assert_eq!(out[0].def, 0 - 4);
    assert_eq!(out[1].def, 1 - 4);
    assert_eq!(out[2].def, 2 - 4);
    assert_eq!(out[3].def, DEF_ANCIENT - 4);
    // One shared, still-open value across all three registers.
    let v0 = out[0].value.unwrap();
    assert_eq!(fixer.values.resolve_ix(v0), v0);
    assert_eq!(out[1].value, Some(v0));
    assert_eq!(out[2].value, Some(v0));
    assert!(out[3].value.is_none());
    assert!(fixer.values.avail(v0) == both());
  }

  #[test]
  fn hard_instruction_pins_operand_values() {
    let mut func = MFunc {
      insts: vec![
        MInst::Soft { dst: r(0), srcs: vec![] },
        MInst::Hard { dst: r(1), srcs: vec![r(0)], dom: dom(0) },
        MInst::Ret,
      ],
      block_ranges: vec![(0, 3)],
      succs: vec![vec![]],
      liveins: vec![],
    };
    let univ = universe();
    let target = MTarget;
    let cfg = CFGInfo::create(&func);
    let mut fixer = DomainFixer::new(&mut func, &target, &univ, cfg);
    fixer.infos.resize(1, BlockInfo::new());
    fixer.process_block(b(0), PassKind::Primary, true);

    let out = fixer.infos[b(0)].out_regs.as_ref().unwrap();
    let v0 = out[0].value.unwrap();
    let v1 = out[1].value.unwrap();
    assert!(fixer.values.is_collapsed(v0));
    assert!(fixer.values.first_domain(v0) == dom(0));
    assert!(fixer.values.is_collapsed(v1));
    assert!(fixer.values.first_domain(v1) == dom(0));
  }

  #[test]
  fn generic_def_ends_domain_tracking() {
    let mut func = MFunc {
      insts: vec![
        MInst::Soft { dst: r(0), srcs: vec![] },
        MInst::Gen { dst: r(0) },
        MInst::Ret,
      ],
      block_ranges: vec![(0, 3)],
      succs: vec![vec![]],
      liveins: vec![],
    };
    let univ = universe();
    let target = MTarget;
    let cfg = CFGInfo::create(&func);
    let mut fixer = DomainFixer::new(&mut func, &target, &univ, cfg);
    fixer.infos.resize(1, BlockInfo::new());
    fixer.process_block(b(0), PassKind::Primary, true);

    let out = fixer.infos[b(0)].out_regs.as_ref().unwrap();
    assert!(out[0].value.is_none());
    assert_eq!(out[0].def, 1 - 3);
  }

  #[test]
  fn acyclic_cfg_processes_each_block_once() {
    // A diamond: 0 -> {1, 2} -> 3.  No block may be visited twice.
    let mut func = MFunc {
      insts: vec![
        MInst::Soft { dst: r(0), srcs: vec![] }, // b0
        MInst::Hard { dst: r(1), srcs: vec![r(0)], dom: dom(0) }, // b1
        MInst::Hard { dst: r(1), srcs: vec![r(0)], dom: dom(1) }, // b2
        MInst::Soft { dst: r(2), srcs: vec![r(0), r(1)] }, // b3
        MInst::Ret,
      ],
      block_ranges: vec![(0, 1), (1, 1), (2, 1), (3, 2)],
      succs: vec![vec![b(1), b(2)], vec![b(3)], vec![b(3)], vec![]],
      liveins: vec![],
    };
    let univ = universe();
    let stats = fix_execution_domains(&mut func, &MTarget, &univ).unwrap();
    for visits in stats.visits.iter() {
      assert_eq!(*visits, 1);
    }
    let c = stats.value_counters;
    assert_eq!(c.releases, c.retains + c.allocs);
    assert_eq!(c.frees, c.allocs);
  }

  #[test]
  fn loop_blocks_are_reprocessed_exactly_once_and_exit_is_not() {
    // PH(0) -> A(1) -> B(2) -> C(3) -> D(4), with a back edge C -> A.
    // A, B, C lie on the cycle and must be processed exactly twice; the
    // preheader and the loop exit exactly once.
    let mut func = MFunc {
      insts: vec![
        MInst::Soft { dst: r(0), srcs: vec![] },           // PH
        MInst::Soft { dst: r(1), srcs: vec![r(0)] },       // A
        MInst::Soft { dst: r(2), srcs: vec![r(1)] },       // B
        MInst::Soft { dst: r(0), srcs: vec![r(2)] },       // C
        MInst::Hard { dst: r(3), srcs: vec![r(0)], dom: dom(0) }, // D
        MInst::Ret,                                        // D
      ],
      block_ranges: vec![(0, 1), (1, 1), (2, 1), (3, 1), (4, 2)],
      succs: vec![
        vec![b(1)],
        vec![b(2)],
        vec![b(3)],
        vec![b(1), b(4)],
        vec![],
      ],
      liveins: vec![],
    };
    let univ = universe();
    let stats = fix_execution_domains(&mut func, &MTarget, &univ).unwrap();
    assert_eq!(stats.visits[b(0)], 1);
    assert_eq!(stats.visits[b(1)], 2);
    assert_eq!(stats.visits[b(2)], 2);
    assert_eq!(stats.visits[b(3)], 2);
    assert_eq!(stats.visits[b(4)], 1);
    let c = stats.value_counters;
    assert_eq!(c.releases, c.retains + c.allocs);
  }

  #[test]
  fn dead_predecessor_is_finalized_by_the_sweep() {
    // Block 2 has a predecessor (block 1) that is unreachable from the
    // entry: the cascade can never mark block 2 done, so the final sweep
    // must process it (reachable blocks: 0 and 2, one extra visit for 2).
    let mut func = MFunc {
      insts: vec![
        MInst::Soft { dst: r(0), srcs: vec![] }, // b0
        MInst::Gen { dst: r(0) },                // b1 (dead)
        MInst::Soft { dst: r(1), srcs: vec![r(0)] }, // b2
        MInst::Ret,                              // b2
      ],
      block_ranges: vec![(0, 1), (1, 1), (2, 2)],
      succs: vec![vec![b(2)], vec![b(2)], vec![]],
      liveins: vec![],
    };
    let univ = universe();
    let stats = fix_execution_domains(&mut func, &MTarget, &univ).unwrap();
    assert_eq!(stats.visits[b(0)], 1);
    assert_eq!(stats.visits[b(1)], 0);
    assert_eq!(stats.visits[b(2)], 2);
    let c = stats.value_counters;
    assert_eq!(c.releases, c.retains + c.allocs);
  }

  #[test]
  fn untracked_code_is_skipped() {
    let mut func = MFunc {
      insts: vec![MInst::Gen { dst: r(9) }, MInst::Ret],
      block_ranges: vec![(0, 2)],
      succs: vec![vec![]],
      liveins: vec![],
    };
    // r9 is not in the universe.
    let univ = universe();
    let stats = fix_execution_domains(&mut func, &MTarget, &univ).unwrap();
    assert_eq!(stats.visits[b(0)], 0);
    assert_eq!(stats.value_counters.allocs, 0);
  }
}
