/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data structures for the whole crate.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::slice::{Iter, IterMut};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Maps

pub type Map<K, V> = FxHashMap<K, V>;

//=============================================================================
// Iteration boilerplate for index types.  Supports constructions of the form
//
//   for ent in start_ent.dotdot(end_plus1_ent) { .. }
//
// until such time as `trait Step` is available in stable Rust.

pub trait PlusOne {
  fn plus_one(&self) -> Self;
}

#[derive(Clone, Copy)]
pub struct MyRange<T> {
  first: T,
  last_plus1: T,
}
impl<T: Copy + PartialOrd + PlusOne> MyRange<T> {
  pub fn start(&self) -> T {
    self.first
  }
  pub fn end(&self) -> T {
    self.last_plus1
  }
}
impl<T: Copy + PartialOrd + PlusOne> IntoIterator for MyRange<T> {
  type Item = T;
  type IntoIter = MyIterator<T>;
  fn into_iter(self) -> Self::IntoIter {
    MyIterator { range: self, next: self.first }
  }
}

pub struct MyIterator<T> {
  range: MyRange<T>,
  next: T,
}
impl<T: Copy + PartialOrd + PlusOne> Iterator for MyIterator<T> {
  type Item = T;
  fn next(&mut self) -> Option<Self::Item> {
    if self.next >= self.range.last_plus1 {
      None
    } else {
      let res = Some(self.next);
      self.next = self.next.plus_one();
      res
    }
  }
}

//=============================================================================
// Vectors where both the index and element types can be specified (and at
// most 2^32-1 elems can be stored).

pub struct TypedIxVec<TyIx, Ty> {
  vek: Vec<Ty>,
  ty_ix: PhantomData<TyIx>,
}
impl<TyIx, Ty> TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
{
  pub fn new() -> Self {
    Self { vek: Vec::new(), ty_ix: PhantomData::<TyIx> }
  }
  pub fn from_vec(vek: Vec<Ty>) -> Self {
    Self { vek, ty_ix: PhantomData::<TyIx> }
  }
  pub fn iter(&self) -> Iter<Ty> {
    self.vek.iter()
  }
  pub fn iter_mut(&mut self) -> IterMut<Ty> {
    self.vek.iter_mut()
  }
  pub fn len(&self) -> u32 {
    self.vek.len() as u32
  }
  pub fn is_empty(&self) -> bool {
    self.vek.is_empty()
  }
  pub fn push(&mut self, item: Ty) {
    self.vek.push(item);
  }
  pub fn resize(&mut self, new_len: u32, value: Ty) {
    self.vek.resize(new_len as usize, value);
  }
}

impl<TyIx, Ty> Index<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  type Output = Ty;
  fn index(&self, ix: TyIx) -> &Ty {
    &self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> IndexMut<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  fn index_mut(&mut self, ix: TyIx) -> &mut Ty {
    &mut self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> Clone for TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
{
  fn clone(&self) -> Self {
    Self { vek: self.vek.clone(), ty_ix: PhantomData::<TyIx> }
  }
}

impl<TyIx, Ty: fmt::Debug> fmt::Debug for TypedIxVec<TyIx, Ty> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    self.vek.fmt(fmt)
  }
}

//=============================================================================
// Index types for basic blocks and instructions.

macro_rules! generate_boilerplate {
  ($TypeIx:ident, $PrintingPrefix:expr) => {
    #[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    pub struct $TypeIx(u32);
    impl $TypeIx {
      pub fn new(n: u32) -> Self {
        Self(n)
      }
      pub fn get(self) -> u32 {
        self.0
      }
      pub fn plus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 + delta)
      }
      pub fn minus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 - delta)
      }
      pub fn dotdot(&self, last_plus1: $TypeIx) -> MyRange<$TypeIx> {
        MyRange { first: *self, last_plus1 }
      }
    }
    impl fmt::Debug for $TypeIx {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $PrintingPrefix, self.0)
      }
    }
    impl PlusOne for $TypeIx {
      fn plus_one(&self) -> Self {
        self.plus(1)
      }
    }
    impl Into<u32> for $TypeIx {
      fn into(self) -> u32 {
        self.0
      }
    }
  };
}

generate_boilerplate!(InstIx, "i");

generate_boilerplate!(BlockIx, "b");

//=============================================================================
// Physical registers.
//
// The pass only ever sees real (physical) registers: it runs after register
// allocation.  A `RealReg` is the target's register number; it carries no
// class information.  Which registers are interesting, and how they overlap,
// is described by the `RegUniverse`.

#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RealReg(u32);
impl RealReg {
  pub fn new(index: u32) -> Self {
    Self(index)
  }
  pub fn get_index(self) -> usize {
    self.0 as usize
  }
}
impl fmt::Debug for RealReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "r{}", self.0)
  }
}

//=============================================================================
// Execution domains.
//
// An execution domain is a category of functional unit that can produce or
// consume a register value (integer SIMD vs floating point SIMD, say).  The
// target enumerates its domains as small integers; a `DomainMask` is the set
// of domains an as-yet-unpinned value could still live in.

#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ExecDomain(u8);
impl ExecDomain {
  pub const fn new(tag: u8) -> Self {
    assert!(tag < 16);
    Self(tag)
  }
  pub fn get(self) -> u8 {
    self.0
  }
}
impl fmt::Debug for ExecDomain {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "dom{}", self.0)
  }
}

#[derive(Copy, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct DomainMask(u16);
impl DomainMask {
  pub fn empty() -> Self {
    Self(0)
  }
  pub fn single(dom: ExecDomain) -> Self {
    Self(1u16 << dom.get())
  }
  pub fn from_bits(bits: u16) -> Self {
    Self(bits)
  }
  pub fn bits(self) -> u16 {
    self.0
  }
  pub fn insert(&mut self, dom: ExecDomain) {
    self.0 |= 1u16 << dom.get();
  }
  pub fn contains(self, dom: ExecDomain) -> bool {
    self.0 & (1u16 << dom.get()) != 0
  }
  /// The domains that `self` and `other` have in common.
  pub fn common(self, other: DomainMask) -> DomainMask {
    Self(self.0 & other.0)
  }
  pub fn is_empty(self) -> bool {
    self.0 == 0
  }
  /// Does the mask name exactly one domain?
  pub fn is_single(self) -> bool {
    self.0.count_ones() == 1
  }
  /// The lowest-numbered domain in the mask.  Must be non-empty.
  pub fn first(self) -> ExecDomain {
    debug_assert!(!self.is_empty());
    ExecDomain::new(self.0.trailing_zeros() as u8)
  }
}
impl fmt::Debug for DomainMask {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{{")?;
    let mut first = true;
    for tag in 0..16 {
      if self.0 & (1u16 << tag) != 0 {
        if !first {
          write!(fmt, ",")?;
        }
        first = false;
        write!(fmt, "{}", tag)?;
      }
    }
    write!(fmt, "}}")
  }
}

//=============================================================================
// Register operands.
//
// The target describes each instruction's register operands as an ordered
// list; the position in the list is the operand index that the clearance
// queries and the rewriting hooks speak about.

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OperandKind {
  Use,
  Def,
}

#[derive(Copy, Clone, Debug)]
pub struct RegOperand {
  pub reg: RealReg,
  pub kind: OperandKind,
  /// For a `Use`: the register currently holds no meaningful value.
  pub undef: bool,
}
impl RegOperand {
  pub fn new_use(reg: RealReg) -> Self {
    Self { reg, kind: OperandKind::Use, undef: false }
  }
  pub fn new_undef_use(reg: RealReg) -> Self {
    Self { reg, kind: OperandKind::Use, undef: true }
  }
  pub fn new_def(reg: RealReg) -> Self {
    Self { reg, kind: OperandKind::Def, undef: false }
  }
  pub fn is_def(&self) -> bool {
    self.kind == OperandKind::Def
  }
  pub fn is_use(&self) -> bool {
    self.kind == OperandKind::Use
  }
}

pub type RegOperandVec = SmallVec<[RegOperand; 4]>;

//=============================================================================
// The register universe.
//
// Names the physical registers whose domains and clearances the pass tracks,
// and precomputes, for every register the code may mention, the tracked slots
// it overlaps.  A register absent from the map (an untracked register, or a
// register overlapping no tracked one) simply maps to no slots and is ignored
// by the pass.

pub struct RegUniverse {
  /// The tracked registers.  `tracked[slot]` is the register whose state
  /// lives in live-register slot `slot`.
  tracked: Vec<RealReg>,
  /// Physical register -> overlapping tracked slots.
  alias_map: Map<RealReg, SmallVec<[u32; 4]>>,
}

impl RegUniverse {
  /// Build a universe from the tracked register list and the target's
  /// register-overlap relation.  `overlaps` need not include the register
  /// itself.  Panics if `tracked` names the same register twice; that is a
  /// client bug.
  pub fn new<F>(tracked: Vec<RealReg>, overlaps: F) -> Self
  where
    F: Fn(RealReg) -> Vec<RealReg>,
  {
    let mut alias_map = Map::<RealReg, SmallVec<[u32; 4]>>::default();
    for (slot, &reg) in tracked.iter().enumerate() {
      assert!(
        tracked[slot + 1..].iter().all(|other| *other != reg),
        "RegUniverse: tracked register {:?} listed twice",
        reg
      );
      alias_map.entry(reg).or_default().push(slot as u32);
      for alias in overlaps(reg) {
        if alias != reg {
          alias_map.entry(alias).or_default().push(slot as u32);
        }
      }
    }
    for slots in alias_map.values_mut() {
      slots.sort_unstable();
      slots.dedup();
    }
    Self { tracked, alias_map }
  }

  pub fn num_tracked(&self) -> usize {
    self.tracked.len()
  }

  pub fn tracked_regs(&self) -> &[RealReg] {
    &self.tracked
  }

  /// The tracked slots overlapping `reg` (empty for untracked registers).
  pub fn slots_of(&self, reg: RealReg) -> &[u32] {
    self.alias_map.get(&reg).map(|v| v.as_slice()).unwrap_or(&[])
  }

  /// Does any operand of the instruction touch a tracked register?
  pub fn mentions_tracked(&self, operands: &[RegOperand]) -> bool {
    operands.iter().any(|op| !self.slots_of(op.reg).is_empty())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn domain_mask_basics() {
    let d0 = ExecDomain::new(0);
    let d1 = ExecDomain::new(1);
    let mut m = DomainMask::empty();
    assert!(m.is_empty() && !m.is_single());
    m.insert(d1);
    assert!(m.is_single() && m.first() == d1);
    m.insert(d0);
    assert!(!m.is_single() && m.first() == d0);
    assert!(m.common(DomainMask::single(d1)) == DomainMask::single(d1));
    assert!(m.common(DomainMask::empty()).is_empty());
  }

  #[test]
  fn universe_aliasing() {
    // Four tracked registers; r100 is a wide register overlapping r0 and r1.
    let regs: Vec<RealReg> = (0..4).map(RealReg::new).collect();
    let univ = RegUniverse::new(regs, |r| {
      if r.get_index() < 2 {
        vec![RealReg::new(100)]
      } else {
        vec![]
      }
    });
    assert_eq!(univ.num_tracked(), 4);
    assert_eq!(univ.slots_of(RealReg::new(1)), &[1]);
    assert_eq!(univ.slots_of(RealReg::new(100)), &[0, 1]);
    assert_eq!(univ.slots_of(RealReg::new(7)), &[] as &[u32]);
  }
}
