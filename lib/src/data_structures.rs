/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data structures for the whole crate.

use rustc_hash::{FxHashMap, FxHashSet};
#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::slice::{Iter, IterMut};

//=============================================================================
// Maps

pub type Map<K, V> = FxHashMap<K, V>;

//=============================================================================
// Sets of things

pub struct Set<T> {
  set: FxHashSet<T>,
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> Set<T> {
  #[inline(never)]
  pub fn empty() -> Self {
    Self { set: FxHashSet::<T>::default() }
  }

  #[inline(never)]
  pub fn unit(item: T) -> Self {
    let mut s = Self::empty();
    s.insert(item);
    s
  }

  #[inline(never)]
  pub fn insert(&mut self, item: T) {
    self.set.insert(item);
  }

  #[inline(never)]
  pub fn contains(&self, item: T) -> bool {
    self.set.contains(&item)
  }

  #[inline(never)]
  pub fn card(&self) -> usize {
    self.set.len()
  }

  #[inline(never)]
  pub fn is_empty(&self) -> bool {
    self.set.is_empty()
  }

  pub fn iter(&self) -> std::collections::hash_set::Iter<T> {
    self.set.iter()
  }

  /// Elements in ascending order, for output that must not depend on hash
  /// order.
  #[inline(never)]
  pub fn to_sorted_vec(&self) -> Vec<T> {
    let mut res = self.set.iter().cloned().collect::<Vec<T>>();
    res.sort_unstable();
    res
  }
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> fmt::Debug for Set<T> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.to_sorted_vec())
  }
}

impl<T: Eq + Ord + Hash + Copy + Clone + fmt::Debug> Clone for Set<T> {
  #[inline(never)]
  fn clone(&self) -> Self {
    let mut res = Set::<T>::empty();
    for item in self.set.iter() {
      res.set.insert(item.clone());
    }
    res
  }
}

//=============================================================================
// Iteration boilerplate for entities.  The only purpose of this is to support
// constructions of the form
//
//   for ent in startEnt .dotdot( endPlusOneEnt ) {
//   }
//
// until such time as `trait Step` is available in stable Rust.  At that point
// `fn dotdot` and all of the following can be removed, and the loops
// rewritten using the standard syntax:
//
//   for ent in startEnt .. endPlusOneEnt {
//   }

pub trait PlusOne {
  fn plus_one(&self) -> Self;
  fn minus_one(&self) -> Self;
}

#[derive(Clone, Copy)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct MyRange<T> {
  first: T,
  last_plus1: T,
  len: usize,
}

impl<T: Copy + PartialOrd + PlusOne> IntoIterator for MyRange<T> {
  type Item = T;
  type IntoIter = MyIterator<T>;
  fn into_iter(self) -> Self::IntoIter {
    MyIterator { next: self.first, end: self.last_plus1 }
  }
}

impl<T: Copy + Eq + Ord + PlusOne> MyRange<T> {
  /// Create a new range object.
  pub fn new(from: T, len: usize) -> MyRange<T> {
    MyRange {
      first: from,
      last_plus1: MyRange::advance_by(from, len),
      len: len as usize,
    }
  }

  pub fn start(&self) -> T {
    self.first
  }

  pub fn first(&self) -> T {
    assert!(self.len() > 0);
    self.start()
  }

  pub fn last(&self) -> T {
    assert!(self.len() > 0);
    MyRange::advance_by(self.start(), self.len() - 1)
  }

  pub fn last_plus1(&self) -> T {
    self.last_plus1
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn contains(&self, t: T) -> bool {
    t >= self.first && t < self.last_plus1
  }

  fn advance_by(mut x: T, n: usize) -> T {
    for _ in 0..n {
      x = x.plus_one();
    }
    x
  }
}

impl<T: fmt::Debug> fmt::Debug for MyRange<T> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "[{:?}, +{:?})", self.first, self.len)
  }
}

pub struct MyIterator<T> {
  next: T,
  end: T,
}
impl<T: Copy + PartialOrd + PlusOne> Iterator for MyIterator<T> {
  type Item = T;
  fn next(&mut self) -> Option<Self::Item> {
    if self.next >= self.end {
      None
    } else {
      let res = Some(self.next);
      self.next = self.next.plus_one();
      res
    }
  }
}
impl<T: Copy + PartialOrd + PlusOne> DoubleEndedIterator for MyIterator<T> {
  fn next_back(&mut self) -> Option<Self::Item> {
    if self.next >= self.end {
      None
    } else {
      self.end = self.end.minus_one();
      Some(self.end)
    }
  }
}

//=============================================================================
// Vectors where both the index and element types can be specified (and at
// most 2^32-1 elems can be stored.  What if this overflows?)

pub struct TypedIxVec<TyIx, Ty> {
  vek: Vec<Ty>,
  ty_ix: PhantomData<TyIx>,
}

impl<TyIx, Ty> TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
  TyIx: Copy + Eq + Ord + Zero + PlusOne + Into<u32>,
{
  pub fn new() -> Self {
    Self { vek: Vec::new(), ty_ix: PhantomData::<TyIx> }
  }
  pub fn from_vec(vek: Vec<Ty>) -> Self {
    Self { vek, ty_ix: PhantomData::<TyIx> }
  }
  pub fn append(&mut self, other: &mut TypedIxVec<TyIx, Ty>) {
    // FIXME what if this overflows?
    self.vek.append(&mut other.vek);
  }
  pub fn iter(&self) -> Iter<Ty> {
    self.vek.iter()
  }
  pub fn iter_mut(&mut self) -> IterMut<Ty> {
    self.vek.iter_mut()
  }
  pub fn len(&self) -> u32 {
    // FIXME what if this overflows?
    self.vek.len() as u32
  }
  pub fn is_empty(&self) -> bool {
    self.vek.is_empty()
  }
  pub fn push(&mut self, item: Ty) {
    // FIXME what if this overflows?
    self.vek.push(item);
  }
  pub fn resize(&mut self, new_len: u32, value: Ty) {
    self.vek.resize(new_len as usize, value);
  }
  pub fn range(&self) -> MyRange<TyIx> {
    MyRange::new(TyIx::zero(), self.len() as usize)
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
  // This is only needed for debug printing.
  fn clone(&self) -> Self {
    Self { vek: self.vek.clone(), ty_ix: PhantomData::<TyIx> }
  }
}

impl<TyIx, Ty: fmt::Debug> fmt::Debug for TypedIxVec<TyIx, Ty> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.vek)
  }
}

//=============================================================================
// Definitions of block indices and instruction indices, plus the indices of
// lifetime intervals used throughout the allocator.

pub trait Zero {
  fn zero() -> Self;
}

macro_rules! generate_boilerplate {
  ($TypeIx:ident, $PrintingPrefix:expr) => {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    // Firstly, the indexing type (TypeIx)
    pub struct $TypeIx(u32);

    impl $TypeIx {
      #[allow(dead_code)]
      pub fn new(n: u32) -> Self {
        Self(n)
      }
      #[allow(dead_code)]
      pub fn max_value() -> Self {
        Self(u32::max_value())
      }
      #[allow(dead_code)]
      pub fn min_value() -> Self {
        Self(u32::min_value())
      }
      #[allow(dead_code)]
      pub fn get(self) -> u32 {
        self.0
      }
      #[allow(dead_code)]
      pub fn get_usize(self) -> usize {
        self.0 as usize
      }
      #[allow(dead_code)]
      pub fn plus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 + delta)
      }
      #[allow(dead_code)]
      pub fn minus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 - delta)
      }
      #[allow(dead_code)]
      pub fn dotdot(&self, last_plus1: $TypeIx) -> MyRange<$TypeIx> {
        let len = (last_plus1.0 - self.0) as usize;
        MyRange::new(*self, len)
      }
    }

    impl fmt::Debug for $TypeIx {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $PrintingPrefix, &self.0)
      }
    }

    impl PlusOne for $TypeIx {
      fn plus_one(&self) -> Self {
        self.plus(1)
      }
      fn minus_one(&self) -> Self {
        self.minus(1)
      }
    }

    impl Into<u32> for $TypeIx {
      fn into(self) -> u32 {
        self.0
      }
    }

    impl Zero for $TypeIx {
      fn zero() -> Self {
        Self(0)
      }
    }
  };
}

generate_boilerplate!(InstIx, "i");

generate_boilerplate!(BlockIx, "b");

generate_boilerplate!(IntId, "int");

impl PlusOne for u32 {
  fn plus_one(&self) -> Self {
    *self + 1
  }
  fn minus_one(&self) -> Self {
    *self - 1
  }
}

impl PlusOne for usize {
  fn plus_one(&self) -> Self {
    *self + 1
  }
  fn minus_one(&self) -> Self {
    *self - 1
  }
}

//=============================================================================
// Registers, both real and virtual.

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RegClass {
  I32 = 0,
  F32 = 1,
}

pub const NUM_REG_CLASSES: usize = 2;

impl RegClass {
  pub fn rc_to_u32(self) -> u32 {
    self as u32
  }
  pub fn rc_to_usize(self) -> usize {
    self as usize
  }
  pub fn rc_from_u32(rc: u32) -> RegClass {
    match rc {
      0 => RegClass::I32,
      1 => RegClass::F32,
      _ => panic!("RegClass::rc_from_u32"),
    }
  }
  pub fn short_name(self) -> &'static str {
    match self {
      RegClass::I32 => "I",
      RegClass::F32 => "F",
    }
  }
  pub fn long_name(self) -> &'static str {
    match self {
      RegClass::I32 => "I32",
      RegClass::F32 => "F32",
    }
  }
}

/// A physical register. `index` is its position in the
/// [`RealRegUniverse`], so that all real registers of a universe form a dense
/// index space starting at zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RealReg {
  class: RegClass,
  index: u8,
}

impl RealReg {
  pub fn new(class: RegClass, index: u8) -> Self {
    Self { class, index }
  }
  pub fn get_class(self) -> RegClass {
    self.class
  }
  pub fn get_index(self) -> usize {
    self.index as usize
  }
  pub fn to_reg(self) -> Reg {
    Reg::Real(self)
  }
}

impl fmt::Debug for RealReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "R{}{}", self.class.short_name(), self.index)
  }
}

/// A virtual register; the `index` is dense over the function.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct VirtualReg {
  class: RegClass,
  index: u32,
}

impl VirtualReg {
  pub fn new(class: RegClass, index: u32) -> Self {
    Self { class, index }
  }
  pub fn get_class(self) -> RegClass {
    self.class
  }
  pub fn get_index(self) -> usize {
    self.index as usize
  }
  pub fn to_reg(self) -> Reg {
    Reg::Virtual(self)
  }
}

impl fmt::Debug for VirtualReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "V{}{}", self.class.short_name(), self.index)
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Reg {
  Real(RealReg),
  Virtual(VirtualReg),
}

impl Reg {
  pub fn get_class(self) -> RegClass {
    match self {
      Reg::Real(rreg) => rreg.get_class(),
      Reg::Virtual(vreg) => vreg.get_class(),
    }
  }
  pub fn is_real(self) -> bool {
    match self {
      Reg::Real(_) => true,
      Reg::Virtual(_) => false,
    }
  }
  pub fn is_virtual(self) -> bool {
    !self.is_real()
  }
  pub fn as_real_reg(self) -> Option<RealReg> {
    match self {
      Reg::Real(rreg) => Some(rreg),
      Reg::Virtual(_) => None,
    }
  }
  pub fn as_virtual_reg(self) -> Option<VirtualReg> {
    match self {
      Reg::Real(_) => None,
      Reg::Virtual(vreg) => Some(vreg),
    }
  }
}

impl fmt::Debug for Reg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Reg::Real(rreg) => rreg.fmt(fmt),
      Reg::Virtual(vreg) => vreg.fmt(fmt),
    }
  }
}

//=============================================================================
// Spill slots and locations.

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct SpillSlot(u32);

impl SpillSlot {
  pub fn new(n: u32) -> Self {
    Self(n)
  }
  pub fn get(self) -> u32 {
    self.0
  }
  pub fn get_usize(self) -> usize {
    self.get() as usize
  }
  pub fn round_up(self: SpillSlot, num_slots: u32) -> SpillSlot {
    assert!(num_slots > 0);
    SpillSlot::new((self.get() + num_slots - 1) / num_slots * num_slots)
  }
  pub fn inc(self, num_slots: u32) -> SpillSlot {
    SpillSlot::new(self.get() + num_slots)
  }
}

impl fmt::Debug for SpillSlot {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "S{}", self.get())
  }
}

/// Where a value lives over (part of) its lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Location {
  None,
  Reg(RealReg),
  Stack(SpillSlot),
  /// The value is rematerialized from its defining constant wherever it is
  /// needed; it never occupies a stack slot.
  Constant,
}

impl Location {
  pub fn reg(&self) -> Option<RealReg> {
    match self {
      Location::Reg(reg) => Some(*reg),
      _ => None,
    }
  }
  pub fn spill(&self) -> Option<SpillSlot> {
    match self {
      Location::Stack(slot) => Some(*slot),
      _ => None,
    }
  }
  pub fn is_none(&self) -> bool {
    match self {
      Location::None => true,
      _ => false,
    }
  }
  pub fn is_constant(&self) -> bool {
    match self {
      Location::Constant => true,
      _ => false,
    }
  }
}

impl fmt::Debug for Location {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Location::None => write!(fmt, "none"),
      Location::Reg(reg) => write!(fmt, "{:?}", reg),
      Location::Stack(slot) => write!(fmt, "{:?}", slot),
      Location::Constant => write!(fmt, "const"),
    }
  }
}

//=============================================================================
// Definitions of the "real register universe".

// A "Real Register Universe" is a read-only structure that contains all
// information about real registers on a given host.  It serves several
// purposes:
//
// * defines the mapping from real register indices to the registers
//   themselves
//
// * defines the size of the initial section of the allocator's operand index
//   space: real register `i` is operand `i`, virtual registers follow
//
// * gives meaning to Set<RealReg>, which otherwise would merely be a bunch of
//   bits.
//
// Registers that are not allocatable (stack pointer, scratch registers and
// the like) may still appear in the universe, after all allocatable ones.

#[derive(Clone, Debug)]
pub struct RealRegUniverse {
  /// The registers themselves.  All must have their index number
  /// (`RealReg::get_index`) equal to their index in this vector.
  pub regs: Vec<(RealReg, String)>,

  /// This is the size of the initial section of `regs` that is available to
  /// the allocator.  It must be < `regs.len()`.
  pub allocable: usize,

  /// Information about groups of allocable registers. Used to quickly address
  /// only a group of allocable registers belonging to the same register
  /// class.  Indexes into `allocable_by_class` are `RegClass` values, such as
  /// `RegClass::F32`. If the resulting entry is `None` then there are no
  /// registers in that group.  Otherwise the value is a `(first, last)`
  /// pair; both indices are inclusive.
  pub allocable_by_class: [Option<(usize, usize)>; NUM_REG_CLASSES],

  /// Indices of the registers whose contents are destroyed by calls.
  pub caller_saved: Vec<usize>,
}

impl RealRegUniverse {
  /// Check that the given universe satisfies various invariants, and panic
  /// if not.  All the invariants are important.
  pub fn check_is_sane(&self) {
    let regs_len = self.regs.len();
    let regs_allocable = self.allocable;
    // The universe must contain at most 256 registers.  That's because
    // `RealReg` stores the index in a u8.
    let mut ok = regs_len <= 256;
    // The number of allocable registers must not exceed the number of
    // `regs` presented.  In general it will be less, since the universe
    // will list some registers (stack pointer, etc) which are not
    // available for allocation.
    if ok {
      ok = regs_allocable <= regs_len;
    }
    // All registers must have an index value which points back at the
    // `regs` slot they are in.
    if ok {
      for i in 0..regs_len {
        let (reg, _name) = &self.regs[i];
        if ok && reg.get_index() != i {
          ok = false;
        }
      }
    }
    // The allocatable regclass groupings defined by `allocable_by_class`
    // must be contiguous, within the allocable section, and of the right
    // class.
    if ok {
      let mut regclass_used = [false; NUM_REG_CLASSES];
      for i in 0..NUM_REG_CLASSES {
        match self.allocable_by_class[i] {
          None => {}
          Some((first, last)) => {
            if first > last || last >= regs_allocable {
              ok = false;
              break;
            }
            for j in first..last + 1 {
              if self.regs[j].0.get_class().rc_to_usize() != i {
                ok = false;
              }
            }
            regclass_used[i] = true;
          }
        }
      }
      // Every allocable register must belong to some group.
      if ok {
        let mut covered = vec![false; regs_allocable];
        for info in self.allocable_by_class.iter().flatten() {
          for j in info.0..info.1 + 1 {
            covered[j] = true;
          }
        }
        ok = covered.iter().all(|c| *c);
      }
    }
    if ok {
      ok = self.caller_saved.iter().all(|&ix| ix < regs_len);
    }
    if !ok {
      panic!("RealRegUniverse::check_is_sane: invalid RealRegUniverse");
    }
  }

  pub fn num_regs(&self) -> usize {
    self.regs.len()
  }

  pub fn is_allocable(&self, reg: RealReg) -> bool {
    reg.get_index() < self.allocable
  }

  /// The allocatable registers of `class`, in universe order.
  pub fn allocable_regs(&self, class: RegClass) -> Vec<RealReg> {
    match self.allocable_by_class[class.rc_to_usize()] {
      None => Vec::new(),
      Some((first, last)) => {
        (first..last + 1).map(|ix| self.regs[ix].0).collect()
      }
    }
  }

  pub fn is_caller_saved(&self, reg: RealReg) -> bool {
    self.caller_saved.contains(&reg.get_index())
  }

  /// True if every allocatable register is destroyed by calls, which lets
  /// the allocator skip interference checks against call sites.
  pub fn all_allocable_caller_saved(&self) -> bool {
    (0..self.allocable).all(|ix| self.caller_saved.contains(&ix))
  }

  pub fn name_of(&self, reg: RealReg) -> &str {
    &self.regs[reg.get_index()].1
  }
}

//=============================================================================
// A simple dense bit set over operand indices, used for liveness.

#[derive(Clone, PartialEq, Eq)]
pub struct BitSet {
  bits: Vec<u64>,
}

impl BitSet {
  pub fn with_capacity(n: usize) -> Self {
    Self { bits: vec![0; (n + 63) / 64] }
  }

  #[inline(always)]
  pub fn insert(&mut self, ix: usize) {
    let (word, bit) = (ix / 64, ix % 64);
    if word >= self.bits.len() {
      self.bits.resize(word + 1, 0);
    }
    self.bits[word] |= 1 << bit;
  }

  #[inline(always)]
  pub fn remove(&mut self, ix: usize) {
    let (word, bit) = (ix / 64, ix % 64);
    if word < self.bits.len() {
      self.bits[word] &= !(1 << bit);
    }
  }

  #[inline(always)]
  pub fn contains(&self, ix: usize) -> bool {
    let (word, bit) = (ix / 64, ix % 64);
    word < self.bits.len() && self.bits[word] & (1 << bit) != 0
  }

  /// Adds all the elements of `other`; returns true if anything changed.
  pub fn union_with(&mut self, other: &BitSet) -> bool {
    if other.bits.len() > self.bits.len() {
      self.bits.resize(other.bits.len(), 0);
    }
    let mut changed = false;
    for (w, o) in self.bits.iter_mut().zip(other.bits.iter()) {
      let old = *w;
      *w |= *o;
      changed |= old != *w;
    }
    changed
  }

  pub fn remove_all(&mut self, other: &BitSet) {
    for (w, o) in self.bits.iter_mut().zip(other.bits.iter()) {
      *w &= !*o;
    }
  }

  pub fn clear(&mut self) {
    for w in self.bits.iter_mut() {
      *w = 0;
    }
  }

  pub fn is_empty(&self) -> bool {
    self.bits.iter().all(|w| *w == 0)
  }

  pub fn card(&self) -> usize {
    self.bits.iter().map(|w| w.count_ones() as usize).sum()
  }

  /// Ascending iteration over the members.
  pub fn iter<'a>(&'a self) -> impl Iterator<Item = usize> + 'a {
    self.bits.iter().enumerate().flat_map(|(word_ix, &word)| {
      let mut w = word;
      std::iter::from_fn(move || {
        if w == 0 {
          None
        } else {
          let bit = w.trailing_zeros() as usize;
          w &= w - 1;
          Some(word_ix * 64 + bit)
        }
      })
    })
  }
}

impl fmt::Debug for BitSet {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    fmt.debug_set().entries(self.iter()).finish()
  }
}

//=============================================================================
// Misc

/// Total order over f64 values that never come out as NaN here (block
/// frequencies and branch probabilities).
pub(crate) fn cmp_f64(a: f64, b: f64) -> Ordering {
  a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bitset_basics() {
    let mut set = BitSet::with_capacity(10);
    assert!(set.is_empty());
    set.insert(3);
    set.insert(64);
    set.insert(200);
    assert!(set.contains(3) && set.contains(64) && set.contains(200));
    assert!(!set.contains(4));
    assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 64, 200]);
    assert_eq!(set.card(), 3);
    set.remove(64);
    assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 200]);

    let mut other = BitSet::with_capacity(10);
    other.insert(5);
    assert!(other.union_with(&set));
    assert!(!other.union_with(&set));
    assert_eq!(other.iter().collect::<Vec<_>>(), vec![3, 5, 200]);
    other.remove_all(&set);
    assert_eq!(other.iter().collect::<Vec<_>>(), vec![5]);
  }

  #[test]
  fn spill_slot_rounding() {
    assert_eq!(SpillSlot::new(3).round_up(2), SpillSlot::new(4));
    assert_eq!(SpillSlot::new(4).round_up(2), SpillSlot::new(4));
    assert_eq!(SpillSlot::new(5).round_up(1), SpillSlot::new(5));
  }
}
