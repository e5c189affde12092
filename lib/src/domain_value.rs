/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The domain-value store.
//!
//! A `DomainValue` represents one instruction result whose execution domain
//! is not pinned yet: the set of domains it could still live in, or exactly
//! one domain once collapsed.  Values are reference counted, because one
//! value can be adopted by several live-register slots (registers whose
//! values were merged) and by a block's saved exit state at the same time.
//!
//! Merging two values redirects one record to the other, union-find style.
//! A record with a redirect is never mutated again; every read resolves
//! through the chain first, and resolution through a slot path-compresses
//! the chain with the matching reference-count fixup.
//!
//! Records live in an arena indexed by `ValueIx` and are recycled through a
//! free list; nothing is handed out by pointer, so the whole store can be
//! dropped at the end of a function with no further ceremony.

use log::trace;
use std::fmt;

use crate::data_structures::{DomainMask, ExecDomain};

//=============================================================================
// Value handles and records

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct ValueIx(u32);
impl ValueIx {
  fn get(self) -> usize {
    self.0 as usize
  }
}
impl fmt::Debug for ValueIx {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "dv{}", self.0)
  }
}

#[derive(Clone)]
struct DomainValue {
  /// Number of live-register slots, exit states and redirects holding this
  /// value.  A record on the free list has zero references.
  refs: u32,
  /// Domains this value could still execute in.  A single-bit mask means the
  /// value is collapsed (pinned).
  avail: DomainMask,
  /// Union-find forwarding: all queries on this record resolve through
  /// `next` instead.  A record with a redirect is never mutated again.
  next: Option<ValueIx>,
}

impl DomainValue {
  fn clear(&mut self) {
    self.refs = 0;
    self.avail = DomainMask::empty();
    self.next = None;
  }
}

//=============================================================================
// The arena

/// Conservation counters, kept for the stats the pass reports.  Over one
/// function, `releases == retains + allocs` must hold by teardown: every
/// allocation carries one implicit initial ownership.
#[derive(Copy, Clone, Default, Debug)]
pub struct ValueCounters {
  pub allocs: u32,
  pub retains: u32,
  pub releases: u32,
  pub frees: u32,
}

pub(crate) struct DomainValueArena {
  values: Vec<DomainValue>,
  free: Vec<ValueIx>,
  counters: ValueCounters,
}

impl DomainValueArena {
  pub(crate) fn new() -> Self {
    Self { values: Vec::new(), free: Vec::new(), counters: ValueCounters::default() }
  }

  pub(crate) fn counters(&self) -> ValueCounters {
    self.counters
  }

  /// Number of records currently holding references.
  pub(crate) fn num_live(&self) -> usize {
    self.values.len() - self.free.len()
  }

  fn value(&self, ix: ValueIx) -> &DomainValue {
    let v = &self.values[ix.get()];
    debug_assert!(v.refs > 0, "dead domain value {:?} read", ix);
    v
  }

  pub(crate) fn alloc(&mut self, avail: DomainMask) -> ValueIx {
    debug_assert!(!avail.is_empty());
    self.counters.allocs += 1;
    let ix = match self.free.pop() {
      Some(ix) => {
        self.values[ix.get()] = DomainValue { refs: 1, avail, next: None };
        ix
      }
      None => {
        let ix = ValueIx(self.values.len() as u32);
        self.values.push(DomainValue { refs: 1, avail, next: None });
        ix
      }
    };
    trace!("alloc {:?} avail={:?}", ix, avail);
    ix
  }

  pub(crate) fn retain(&mut self, ix: ValueIx) {
    self.counters.retains += 1;
    self.values[ix.get()].refs += 1;
  }

  /// Drop one reference.  When the last reference goes, the record returns
  /// to the free list, and the reference it holds on its redirect target (if
  /// any) is dropped too, cascading down the chain.
  pub(crate) fn release(&mut self, ix: ValueIx) {
    let mut cur = ix;
    loop {
      self.counters.releases += 1;
      let v = &mut self.values[cur.get()];
      debug_assert!(v.refs > 0, "double release of {:?}", cur);
      v.refs -= 1;
      if v.refs > 0 {
        return;
      }
      let next = v.next;
      v.clear();
      self.counters.frees += 1;
      self.free.push(cur);
      trace!("free {:?}", cur);
      match next {
        Some(nx) => cur = nx,
        None => return,
      }
    }
  }

  /// Follow the redirect chain to the canonical record, and re-point the
  /// caller's slot at it (path compression, with the reference moved from
  /// the old record to the canonical one).
  pub(crate) fn resolve(&mut self, slot: &mut Option<ValueIx>) -> Option<ValueIx> {
    let ix = (*slot)?;
    if self.value(ix).next.is_none() {
      return Some(ix);
    }
    let mut canon = ix;
    while let Some(nx) = self.value(canon).next {
      canon = nx;
    }
    self.retain(canon);
    self.release(ix);
    *slot = Some(canon);
    Some(canon)
  }

  /// Read-only resolution, no compression.  For queries on values we do not
  /// hold in a compressible slot.
  pub(crate) fn resolve_ix(&self, ix: ValueIx) -> ValueIx {
    let mut canon = ix;
    while let Some(nx) = self.value(canon).next {
      canon = nx;
    }
    canon
  }

  pub(crate) fn avail(&self, ix: ValueIx) -> DomainMask {
    self.value(ix).avail
  }

  /// Is the value pinned to exactly one domain?
  pub(crate) fn is_collapsed(&self, ix: ValueIx) -> bool {
    self.value(ix).avail.is_single()
  }

  pub(crate) fn has_domain(&self, ix: ValueIx, dom: ExecDomain) -> bool {
    self.value(ix).avail.contains(dom)
  }

  pub(crate) fn first_domain(&self, ix: ValueIx) -> ExecDomain {
    self.value(ix).avail.first()
  }

  /// Record that a collapsed value has been forced across into a further
  /// domain (the crossing has been paid; the value is now usable in both).
  pub(crate) fn add_domain(&mut self, ix: ValueIx, dom: ExecDomain) {
    debug_assert!(self.value(ix).next.is_none());
    self.values[ix.get()].avail.insert(dom);
  }

  /// Pin `ix` to exactly `dom`.
  pub(crate) fn collapse(&mut self, ix: ValueIx, dom: ExecDomain) {
    debug_assert!(self.has_domain(ix, dom), "collapse to a foreign domain");
    debug_assert!(self.value(ix).next.is_none());
    trace!("collapse {:?} to {:?}", ix, dom);
    self.values[ix.get()].avail = DomainMask::single(dom);
  }

  /// Narrow an open value's candidate set.  `to` must be a non-empty subset
  /// of the current set.
  pub(crate) fn narrow(&mut self, ix: ValueIx, to: DomainMask) {
    debug_assert!(self.value(ix).next.is_none());
    debug_assert!(!to.is_empty());
    debug_assert!(self.avail(ix).common(to) == to);
    self.values[ix.get()].avail = to;
  }

  /// Merge two canonical values, returning the surviving record.  On
  /// success the survivor's candidate set is the intersection and the other
  /// record redirects to it; the record with fewer remaining references is
  /// the one redirected, to keep chains short.  If the candidate sets are
  /// disjoint the values cannot be unified: each is pinned to its own
  /// preferred domain and the merge reports failure, which is a normal
  /// outcome, not an error.
  pub(crate) fn merge(&mut self, a: ValueIx, b: ValueIx) -> Option<ValueIx> {
    debug_assert!(self.value(a).next.is_none() && self.value(b).next.is_none());
    if a == b {
      return Some(a);
    }
    debug_assert!(!self.is_collapsed(a), "merge into collapsed value");
    debug_assert!(!self.is_collapsed(b), "merge from collapsed value");
    let common = self.avail(a).common(self.avail(b));
    if common.is_empty() {
      let da = self.first_domain(a);
      let db = self.first_domain(b);
      self.collapse(a, da);
      self.collapse(b, db);
      return None;
    }
    let (winner, loser) =
      if self.value(a).refs < self.value(b).refs { (b, a) } else { (a, b) };
    trace!("merge {:?} <- {:?} common={:?}", winner, loser, common);
    self.values[winner.get()].avail = common;
    self.retain(winner);
    self.values[loser.get()].next = Some(winner);
    Some(winner)
  }
}

//=============================================================================

#[cfg(test)]
mod test {
  use super::*;

  fn mask(bits: u16) -> DomainMask {
    DomainMask::from_bits(bits)
  }

  #[test]
  fn merge_is_symmetric_in_the_surviving_mask() {
    for &(x, y) in &[(0b0110u16, 0b0011u16), (0b1111, 0b0101)] {
      let mut arena = DomainValueArena::new();
      let a = arena.alloc(mask(x));
      let b = arena.alloc(mask(y));
      assert!(arena.merge(a, b).is_some());
      let canon_ab = arena.resolve_ix(a);
      let m_ab = arena.avail(canon_ab);

      let mut arena = DomainValueArena::new();
      let a = arena.alloc(mask(x));
      let b = arena.alloc(mask(y));
      assert!(arena.merge(b, a).is_some());
      let canon_ba = arena.resolve_ix(a);
      assert!(m_ab == arena.avail(canon_ba));
      assert!(m_ab == mask(x & y));
    }
  }

  #[test]
  fn incompatible_merge_collapses_both() {
    let mut arena = DomainValueArena::new();
    let a = arena.alloc(mask(0b0011));
    let b = arena.alloc(mask(0b1100));
    assert!(arena.merge(a, b).is_none());
    assert!(arena.is_collapsed(a) && arena.is_collapsed(b));
    assert!(arena.first_domain(a) == ExecDomain::new(0));
    assert!(arena.first_domain(b) == ExecDomain::new(2));
  }

  #[test]
  fn resolution_is_idempotent_and_compresses() {
    let mut arena = DomainValueArena::new();
    let a = arena.alloc(mask(0b0111));
    let b = arena.alloc(mask(0b0111));
    let c = arena.alloc(mask(0b0110));
    // Give b an extra reference so it survives the chain builds below, and
    // so that b (refs 2) wins the first merge and keeps c redirected at it.
    arena.retain(b);
    assert!(arena.merge(b, c).is_some());
    assert!(arena.merge(b, a).is_some());
    // c -> b and a -> b.  Resolving through a slot holding c must land on b
    // and rewrite the slot.
    let mut slot = Some(c);
    let canon = arena.resolve(&mut slot).unwrap();
    assert!(canon == b);
    assert!(slot == Some(canon));
    assert!(arena.avail(canon) == mask(0b0110));
    // Resolving again is a no-op.
    let again = arena.resolve(&mut slot).unwrap();
    assert!(again == canon && slot == Some(canon));
  }

  #[test]
  fn reference_counts_are_conserved() {
    let mut arena = DomainValueArena::new();
    let a = arena.alloc(mask(0b011));
    let b = arena.alloc(mask(0b110));
    arena.retain(a);
    assert!(arena.merge(a, b).is_some());
    // Drop every reference we hold: two on a, one on b.
    arena.release(a);
    arena.release(a);
    arena.release(b);
    assert_eq!(arena.num_live(), 0);
    let c = arena.counters();
    assert_eq!(c.releases, c.retains + c.allocs);
    assert_eq!(c.frees, c.allocs);
  }

  #[test]
  fn freed_records_are_recycled() {
    let mut arena = DomainValueArena::new();
    let a = arena.alloc(mask(0b01));
    arena.release(a);
    let b = arena.alloc(mask(0b10));
    assert!(b == a);
    assert!(arena.avail(b) == mask(0b10));
  }
}
