/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Lifetime intervals.
//!
//! An interval is a sorted list of disjoint half-open position ranges plus
//! the positions where its value is used, each with a register priority.
//! Intervals live in an arena and refer to each other by `IntId`: the first
//! `num_operands` entries are the intervals of the registers of the function
//! (real registers first), split children and other derived intervals are
//! appended after them.

use std::fmt;
use std::ops::{Index, IndexMut};

use crate::data_structures::{
  IntId, Location, RealReg, Reg, RegClass, SpillSlot,
};

/// Sentinel position: after everything.
pub(crate) const END_POS: u32 = u32::MAX;

/// How urgently a use needs its value in a register, in increasing order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) enum RegisterPriority {
  /// No register needed; a stack slot or constant will do.
  None,
  /// Live at the end of a loop that uses it.
  LiveAtLoopEnd,
  /// The operand may be a stack slot, but a register is preferred.
  ShouldHaveRegister,
  /// The operand must be a register.
  MustHaveRegister,
}

/// Whether an interval is bound to a register, free to get one, or lives on
/// the stack. The walker keeps separate lists for each.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RegisterBinding {
  Fixed,
  Any,
  Stack,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum IntervalState {
  /// Starts after the current position.
  Unhandled,
  /// Covers the current position and holds a register.
  Active,
  /// Holds a register but the current position falls in a lifetime hole.
  Inactive,
  /// Ended before the current position, or spilled.
  Handled,
}

/// Where the spill store of a value goes. The order of the variants is
/// meaningful: states only move forward.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) enum SpillState {
  /// Starting state: no definition found yet.
  NoDefinitionFound,
  /// One definition found, at `spill_definition_pos`.
  NoSpillStore,
  /// One spill move has been inserted.
  OneSpillStore,
  /// Spilled several times or inside a loop: store on the dominator path
  /// between the definition and the uses.
  SpillInDominator,
  /// Store right after the definition.
  StoreAtDefinition,
  /// The value starts in memory (an incoming stack argument).
  StartInMemory,
  /// Several definitions: stores are not optimized.
  NoOptimization,
}

/// Whether the boundary of the range containing a position counts as
/// covered: a definition at the last position of a range does not reach it,
/// a use does.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum OperandMode {
  Use,
  Def,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Range {
  pub(crate) from: u32,
  pub(crate) to: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct UsePos {
  pub(crate) pos: u32,
  pub(crate) prio: RegisterPriority,
}

pub(crate) struct Interval {
  pub(crate) id: IntId,
  /// The register this interval (or its split parent) was built for.
  pub(crate) reg: Reg,
  pub(crate) class: RegClass,
  pub(crate) location: Location,

  /// Ascending, disjoint, non-adjacent.
  pub(crate) ranges: Vec<Range>,
  /// Cursor into `ranges`, used by the walker.
  cur_range: usize,
  /// Descending by position: the next use is at the end.
  pub(crate) uses: Vec<UsePos>,

  pub(crate) state: IntervalState,

  /// `None` for split parents.
  pub(crate) split_parent: Option<IntId>,
  /// Only on split parents: the parent itself followed by its children in
  /// creation order, once it has been split.
  pub(crate) split_children: Vec<IntId>,
  /// Only meaningful on split parents.
  pub(crate) current_split_child: IntId,

  // Only meaningful on split parents; read them through `Intervals`.
  pub(crate) spill_slot: Option<SpillSlot>,
  pub(crate) spill_state: SpillState,
  pub(crate) spill_definition_pos: Option<u32>,
  /// Index of the constant the value can be rematerialized from.
  pub(crate) materialized: Option<u32>,
  num_materializations: u32,

  pub(crate) location_hint: Option<IntId>,
  pub(crate) insert_move_when_activated: bool,
}

impl Interval {
  pub(crate) fn new(id: IntId, reg: Reg, location: Location) -> Self {
    Self {
      id,
      reg,
      class: reg.get_class(),
      location,
      ranges: Vec::new(),
      cur_range: 0,
      uses: Vec::new(),
      state: IntervalState::Unhandled,
      split_parent: None,
      split_children: Vec::new(),
      current_split_child: id,
      spill_slot: None,
      spill_state: SpillState::NoDefinitionFound,
      spill_definition_pos: None,
      materialized: None,
      num_materializations: 0,
      location_hint: None,
      insert_move_when_activated: false,
    }
  }

  /// Fixed intervals belong to real registers.
  pub(crate) fn is_fixed(&self) -> bool {
    self.reg.is_real()
  }

  pub(crate) fn fixed_reg(&self) -> Option<RealReg> {
    self.reg.as_real_reg()
  }

  pub(crate) fn is_split_parent(&self) -> bool {
    self.split_parent.is_none()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.ranges.is_empty()
  }

  pub(crate) fn from(&self) -> u32 {
    self.ranges.first().map_or(END_POS, |r| r.from)
  }

  pub(crate) fn to(&self) -> u32 {
    self.ranges.last().map_or(END_POS, |r| r.to)
  }

  pub(crate) fn can_materialize(&self) -> bool {
    self.materialized.is_some()
  }

  // === BEGIN building ===

  /// Adds `[from, to)` in front of the existing ranges, merging with the
  /// first one if they touch. Ranges are added in descending order.
  pub(crate) fn add_range(&mut self, from: u32, to: u32) {
    debug_assert!(from < to, "invalid range");
    debug_assert!(self.is_empty() || from <= self.ranges[0].to);
    match self.ranges.first_mut() {
      Some(first) if first.from <= to => {
        first.from = first.from.min(from);
        first.to = first.to.max(to);
      }
      _ => self.ranges.insert(0, Range { from, to }),
    }
  }

  /// Shortens the first range to start at a definition.
  pub(crate) fn set_from(&mut self, def_pos: u32) {
    debug_assert!(!self.is_empty());
    self.ranges[0].from = def_pos;
  }

  /// Uses are added in descending order; a second use at the same position
  /// raises the priority. Fixed intervals and `None` priorities record
  /// nothing.
  pub(crate) fn add_use_pos(&mut self, pos: u32, prio: RegisterPriority) {
    if prio == RegisterPriority::None || self.is_fixed() {
      return;
    }
    debug_assert!(self.covers(pos, OperandMode::Use));
    match self.uses.last_mut() {
      Some(last) if last.pos <= pos => {
        debug_assert!(last.pos == pos, "use positions not sorted");
        if last.prio < prio {
          last.prio = prio;
        }
      }
      _ => self.uses.push(UsePos { pos, prio }),
    }
  }

  /// `constant` indexes the constants table of the function; temps and
  /// non-constant definitions pass `None`.
  pub(crate) fn add_materialization_value(&mut self, constant: Option<u32>) {
    if self.num_materializations == 0 {
      self.materialized = constant;
    } else {
      // Several definitions: nothing to rematerialize from.
      self.materialized = None;
    }
    self.num_materializations += 1;
  }

  // === END building ===

  // === BEGIN range queries ===

  pub(crate) fn covers(&self, op_id: u32, mode: OperandMode) -> bool {
    for range in self.ranges.iter() {
      if range.to < op_id {
        continue;
      }
      return match mode {
        OperandMode::Def => range.from <= op_id && op_id < range.to,
        OperandMode::Use => range.from <= op_id && op_id <= range.to,
      };
    }
    false
  }

  /// Is any position of `[hole_from, hole_to)` outside the ranges?
  pub(crate) fn has_hole_between(&self, hole_from: u32, hole_to: u32) -> bool {
    debug_assert!(hole_from < hole_to);
    for range in self.ranges.iter() {
      if hole_from < range.from {
        return true;
      } else if hole_to <= range.to {
        return false;
      } else if hole_from <= range.to {
        return true;
      }
    }
    false
  }

  pub(crate) fn rewind_range(&mut self) {
    self.cur_range = 0;
  }

  pub(crate) fn next_range(&mut self) {
    self.cur_range += 1;
  }

  pub(crate) fn current_from(&self) -> u32 {
    self.ranges.get(self.cur_range).map_or(END_POS, |r| r.from)
  }

  pub(crate) fn current_to(&self) -> u32 {
    self.ranges.get(self.cur_range).map_or(END_POS, |r| r.to)
  }

  pub(crate) fn current_at_end(&self) -> bool {
    self.cur_range >= self.ranges.len()
  }

  /// First position covered by both intervals, if any.
  pub(crate) fn intersects_at(&self, other: &Interval) -> Option<u32> {
    intersects_at(&self.ranges, 0, &other.ranges, 0)
  }

  pub(crate) fn intersects(&self, other: &Interval) -> bool {
    self.intersects_at(other).is_some()
  }

  /// Like `intersects_at`, but starting from the range cursors of both
  /// intervals.
  pub(crate) fn current_intersects_at(&self, other: &Interval) -> Option<u32> {
    if self.current_from() > other.to() {
      return None;
    }
    intersects_at(&self.ranges, self.cur_range, &other.ranges, other.cur_range)
  }

  pub(crate) fn current_intersects(&self, other: &Interval) -> bool {
    self.current_intersects_at(other).is_some()
  }

  // === END range queries ===

  // === BEGIN use position queries ===

  fn adapt_priority(&self, prio: RegisterPriority) -> RegisterPriority {
    // A rematerialized value has no stack copy, so "should" means "must".
    if prio == RegisterPriority::ShouldHaveRegister && self.can_materialize() {
      RegisterPriority::MustHaveRegister
    } else {
      prio
    }
  }

  pub(crate) fn first_usage(&self, min_prio: RegisterPriority) -> u32 {
    debug_assert!(!self.is_fixed());
    for u in self.uses.iter().rev() {
      if self.adapt_priority(u.prio) >= min_prio {
        return u.pos;
      }
    }
    END_POS
  }

  pub(crate) fn next_usage(
    &self, min_prio: RegisterPriority, from: u32,
  ) -> u32 {
    debug_assert!(!self.is_fixed());
    for u in self.uses.iter().rev() {
      if u.pos >= from && self.adapt_priority(u.prio) >= min_prio {
        return u.pos;
      }
    }
    END_POS
  }

  pub(crate) fn next_usage_exact(
    &self, prio: RegisterPriority, from: u32,
  ) -> u32 {
    debug_assert!(!self.is_fixed());
    for u in self.uses.iter().rev() {
      if u.pos >= from && self.adapt_priority(u.prio) == prio {
        return u.pos;
      }
    }
    END_POS
  }

  /// The last use at or before `from` with at least `min_prio`.
  pub(crate) fn previous_usage(
    &self, min_prio: RegisterPriority, from: u32,
  ) -> Option<u32> {
    debug_assert!(!self.is_fixed());
    let mut prev = None;
    for u in self.uses.iter().rev() {
      if u.pos > from {
        return prev;
      }
      if self.adapt_priority(u.prio) >= min_prio {
        prev = Some(u.pos);
      }
    }
    prev
  }

  pub(crate) fn remove_first_use_pos(&mut self) {
    self.uses.pop();
  }

  // === END use position queries ===
}

/// Two-cursor walk over two range lists; returns the first position covered
/// by both.
fn intersects_at(
  a: &[Range], mut ai: usize, b: &[Range], mut bi: usize,
) -> Option<u32> {
  while ai < a.len() && bi < b.len() {
    let (ra, rb) = (a[ai], b[bi]);
    if ra.from < rb.from {
      if ra.to <= rb.from {
        ai += 1;
      } else {
        return Some(rb.from);
      }
    } else if rb.from < ra.from {
      if rb.to <= ra.from {
        bi += 1;
      } else {
        return Some(ra.from);
      }
    } else {
      return Some(ra.from);
    }
  }
  None
}

impl fmt::Debug for Interval {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}:{:?} {:?}", self.id, self.reg, self.location)?;
    if let Some(parent) = self.split_parent {
      write!(fmt, " (parent={:?})", parent)?;
    }
    if let Some(hint) = self.location_hint {
      write!(fmt, " hint={:?}", hint)?;
    }
    write!(fmt, " ranges{{")?;
    for (i, r) in self.ranges.iter().enumerate() {
      if i > 0 {
        write!(fmt, ", ")?;
      }
      write!(fmt, "[{}, {})", r.from, r.to)?;
    }
    write!(fmt, "}} uses{{")?;
    for (i, u) in self.uses.iter().rev().enumerate() {
      if i > 0 {
        write!(fmt, ", ")?;
      }
      write!(fmt, "{}:{:?}", u.pos, u.prio)?;
    }
    write!(fmt, "}} {:?}", self.spill_state)
  }
}

//=============================================================================
// The interval arena.

pub(crate) struct Intervals {
  pub(crate) data: Vec<Interval>,
  /// Intervals below this index belong to the operands of the function.
  pub(crate) num_operands: usize,
}

impl Index<IntId> for Intervals {
  type Output = Interval;
  fn index(&self, id: IntId) -> &Interval {
    &self.data[id.get_usize()]
  }
}

impl IndexMut<IntId> for Intervals {
  fn index_mut(&mut self, id: IntId) -> &mut Interval {
    &mut self.data[id.get_usize()]
  }
}

impl Intervals {
  /// One empty interval per operand; `regs[i]` is the register of operand
  /// `i`, if it is known.
  pub(crate) fn new(regs: &[Option<Reg>]) -> Self {
    let data = regs
      .iter()
      .enumerate()
      .map(|(i, reg)| {
        let id = IntId::new(i as u32);
        match reg {
          Some(Reg::Real(rreg)) => {
            Interval::new(id, rreg.to_reg(), Location::Reg(*rreg))
          }
          Some(reg) => Interval::new(id, *reg, Location::None),
          // Never referenced; stays empty.
          None => Interval::new(
            id,
            Reg::Virtual(crate::data_structures::VirtualReg::new(
              RegClass::I32,
              u32::max_value(),
            )),
            Location::None,
          ),
        }
      })
      .collect();
    Self { data, num_operands: regs.len() }
  }

  pub(crate) fn len(&self) -> usize {
    self.data.len()
  }

  pub(crate) fn ids(&self) -> impl Iterator<Item = IntId> {
    (0..self.data.len() as u32).map(IntId::new)
  }

  pub(crate) fn parent(&self, id: IntId) -> IntId {
    self[id].split_parent.unwrap_or(id)
  }

  // Split-parent level attributes.

  pub(crate) fn spill_slot(&self, id: IntId) -> Option<SpillSlot> {
    self[self.parent(id)].spill_slot
  }

  pub(crate) fn set_spill_slot(&mut self, id: IntId, slot: SpillSlot) {
    let parent = self.parent(id);
    debug_assert!(
      self[parent].spill_slot.is_none(),
      "cannot overwrite existing spill slot"
    );
    self[parent].spill_slot = Some(slot);
  }

  pub(crate) fn spill_state(&self, id: IntId) -> SpillState {
    self[self.parent(id)].spill_state
  }

  pub(crate) fn set_spill_state(&mut self, id: IntId, state: SpillState) {
    let parent = self.parent(id);
    debug_assert!(state >= self[parent].spill_state, "state cannot decrease");
    self[parent].spill_state = state;
  }

  pub(crate) fn spill_definition_pos(&self, id: IntId) -> Option<u32> {
    self[self.parent(id)].spill_definition_pos
  }

  pub(crate) fn set_spill_definition_pos(&mut self, id: IntId, pos: u32) {
    let parent = self.parent(id);
    self[parent].spill_definition_pos = Some(pos);
  }

  /// Does the value have a shadow copy on the stack that is always up to
  /// date?
  pub(crate) fn always_in_memory(&self, id: IntId) -> bool {
    let parent = &self[self.parent(id)];
    match parent.spill_state {
      SpillState::SpillInDominator
      | SpillState::StoreAtDefinition
      | SpillState::StartInMemory => !parent.can_materialize(),
      _ => false,
    }
  }

  pub(crate) fn current_split_child(&self, id: IntId) -> IntId {
    self[self.parent(id)].current_split_child
  }

  pub(crate) fn make_current_split_child(&mut self, id: IntId) {
    let parent = self.parent(id);
    self[parent].current_split_child = id;
  }

  /// A fresh interval for the same register as `source`, outside any split
  /// family.
  pub(crate) fn create_derived(&mut self, source: IntId) -> IntId {
    let id = IntId::new(self.data.len() as u32);
    let src = &self[source];
    let mut interval = Interval::new(id, src.reg, Location::None);
    interval.class = src.class;
    interval.materialized = self[self.parent(source)].materialized;
    self.data.push(interval);
    id
  }

  /// Splits `id` at `split_pos`; the returned child covers everything from
  /// `split_pos` on, together with the uses there.
  pub(crate) fn split(&mut self, id: IntId, split_pos: u32) -> IntId {
    debug_assert!(!self[id].is_fixed(), "cannot split fixed intervals");
    let parent = self.parent(id);
    let child = self.create_derived(parent);
    self[child].split_parent = Some(parent);
    self[child].location_hint = Some(parent);
    if self[parent].split_children.is_empty() {
      debug_assert!(id == parent, "list must be initialized at first split");
      self[parent].split_children.push(parent);
    }
    self[parent].split_children.push(child);

    // Split the ranges.
    let interval = &mut self[id];
    let mut cur = 0;
    while cur < interval.ranges.len() && interval.ranges[cur].to <= split_pos {
      cur += 1;
    }
    debug_assert!(cur < interval.ranges.len(), "split after end of last range");
    let mut child_ranges = interval.ranges.split_off(cur);
    if child_ranges[0].from < split_pos {
      interval.ranges.push(Range { from: child_ranges[0].from, to: split_pos });
      child_ranges[0].from = split_pos;
    }

    // Split the uses: the child takes those at or after the split position,
    // which sit at the front of the descending list.
    let num_child_uses =
      interval.uses.iter().take_while(|u| u.pos >= split_pos).count();
    let parent_uses = interval.uses.split_off(num_child_uses);
    let child_uses = std::mem::replace(&mut interval.uses, parent_uses);

    let child_interval = &mut self[child];
    child_interval.ranges = child_ranges;
    child_interval.uses = child_uses;
    child
  }

  /// The split child of `parent` alive at `op_id`.
  pub(crate) fn split_child_at_op_id(
    &self, parent: IntId, op_id: u32, mode: OperandMode,
  ) -> Option<IntId> {
    debug_assert!(self[parent].is_split_parent());
    let children = &self[parent].split_children;
    if children.is_empty() {
      return if self[parent].covers(op_id, mode) { Some(parent) } else { None };
    }
    // A definition cannot happen at the end of an interval.
    let to_offset = match mode {
      OperandMode::Def => 0,
      OperandMode::Use => 1,
    };
    children.iter().cloned().find(|&child| {
      let c = &self[child];
      c.from() <= op_id && op_id < c.to().saturating_add(to_offset)
    })
  }

  /// The split child whose range span contains `op_id`, looking backwards
  /// from `id`.
  pub(crate) fn interval_covering_op_id(
    &self, id: IntId, op_id: u32,
  ) -> Option<IntId> {
    if op_id >= self[id].from() {
      return Some(id);
    }
    let parent = self.parent(id);
    self[parent]
      .split_children
      .iter()
      .rev()
      .cloned()
      .find(|&child| self[child].from() <= op_id && op_id < self[child].to())
  }

  /// The last split child ending at or before `op_id`.
  pub(crate) fn split_child_before_op_id(
    &self, id: IntId, op_id: u32,
  ) -> Option<IntId> {
    let parent = self.parent(id);
    let mut result: Option<IntId> = None;
    for &child in self[parent].split_children.iter().rev() {
      let to = self[child].to();
      if to <= op_id && result.map_or(true, |r| self[r].to() < to) {
        result = Some(child);
      }
    }
    result
  }

  /// The location hint of `id`. When `search_split_child` is set, only a
  /// hint (or one of its split children) holding a register counts.
  pub(crate) fn location_hint(
    &self, id: IntId, search_split_child: bool,
  ) -> Option<IntId> {
    let hint = self[id].location_hint?;
    if !search_split_child {
      return Some(hint);
    }
    if self[hint].location.reg().is_some() {
      return Some(hint);
    }
    self[hint]
      .split_children
      .iter()
      .cloned()
      .find(|&child| self[child].location.reg().is_some())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data_structures::VirtualReg;

  fn vinterval(
    ranges: &[(u32, u32)], uses: &[(u32, RegisterPriority)],
  ) -> Intervals {
    let reg = VirtualReg::new(RegClass::I32, 0).to_reg();
    let mut intervals = Intervals::new(&[Some(reg)]);
    let int = &mut intervals[IntId::new(0)];
    for &(from, to) in ranges.iter().rev() {
      int.add_range(from, to);
    }
    for &(pos, prio) in uses.iter().rev() {
      int.add_use_pos(pos, prio);
    }
    intervals
  }

  #[test]
  fn add_range_merges_adjacent() {
    let intervals = vinterval(&[(2, 6), (6, 10), (14, 20)], &[]);
    let int = &intervals[IntId::new(0)];
    assert_eq!(
      int.ranges,
      vec![Range { from: 2, to: 10 }, Range { from: 14, to: 20 }]
    );
    assert_eq!((int.from(), int.to()), (2, 20));
  }

  #[test]
  fn covers_and_holes() {
    let intervals = vinterval(&[(2, 10), (14, 20)], &[]);
    let int = &intervals[IntId::new(0)];
    assert!(int.covers(10, OperandMode::Use));
    assert!(!int.covers(10, OperandMode::Def));
    assert!(!int.covers(12, OperandMode::Use));
    assert!(int.covers(14, OperandMode::Def));
    assert!(int.has_hole_between(8, 16));
    assert!(!int.has_hole_between(4, 8));
    assert!(int.has_hole_between(11, 12));
  }

  #[test]
  fn intersections() {
    let reg = VirtualReg::new(RegClass::I32, 0).to_reg();
    let mut intervals = Intervals::new(&[Some(reg), Some(reg)]);
    intervals[IntId::new(0)].add_range(14, 20);
    intervals[IntId::new(0)].add_range(2, 6);
    intervals[IntId::new(1)].add_range(8, 16);
    let (a, b) = (&intervals[IntId::new(0)], &intervals[IntId::new(1)]);
    assert_eq!(a.intersects_at(b), Some(14));
    assert_eq!(b.intersects_at(a), Some(14));

    let mut c = Interval::new(IntId::new(2), reg, Location::None);
    c.add_range(6, 8);
    assert_eq!(a.intersects_at(&c), None);
  }

  #[test]
  fn usage_queries() {
    use RegisterPriority::*;
    let intervals = vinterval(
      &[(2, 30)],
      &[
        (4, MustHaveRegister),
        (10, ShouldHaveRegister),
        (20, MustHaveRegister),
      ],
    );
    let int = &intervals[IntId::new(0)];
    assert_eq!(int.first_usage(ShouldHaveRegister), 4);
    assert_eq!(int.next_usage(MustHaveRegister, 5), 20);
    assert_eq!(int.next_usage(ShouldHaveRegister, 5), 10);
    assert_eq!(int.next_usage_exact(ShouldHaveRegister, 0), 10);
    assert_eq!(int.next_usage(MustHaveRegister, 21), END_POS);
    assert_eq!(int.previous_usage(ShouldHaveRegister, 19), Some(10));
    assert_eq!(int.previous_usage(MustHaveRegister, 3), Option::None);
  }

  #[test]
  fn split_partitions_ranges_and_uses() {
    use RegisterPriority::*;
    let mut intervals = vinterval(
      &[(2, 10), (14, 20)],
      &[(4, MustHaveRegister), (16, MustHaveRegister)],
    );
    let parent = IntId::new(0);
    let child = intervals.split(parent, 7);
    assert_eq!(intervals[parent].ranges, vec![Range { from: 2, to: 7 }]);
    assert_eq!(
      intervals[child].ranges,
      vec![Range { from: 7, to: 10 }, Range { from: 14, to: 20 }]
    );
    assert_eq!(intervals[parent].uses.len(), 1);
    assert_eq!(intervals[child].first_usage(None), 16);
    assert_eq!(intervals.parent(child), parent);
    assert_eq!(intervals[child].location_hint, Some(parent));

    // Splitting in a hole moves whole ranges.
    let grandchild = intervals.split(child, 12);
    assert_eq!(intervals[child].ranges, vec![Range { from: 7, to: 10 }]);
    assert_eq!(intervals[grandchild].ranges, vec![Range { from: 14, to: 20 }]);
    assert_eq!(intervals.parent(grandchild), parent);
    assert_eq!(
      intervals[parent].split_children,
      vec![parent, child, grandchild]
    );

    assert_eq!(
      intervals.split_child_at_op_id(parent, 16, OperandMode::Use),
      Some(grandchild)
    );
    assert_eq!(
      intervals.split_child_at_op_id(parent, 7, OperandMode::Def),
      Some(child)
    );
    // The end of a child is still a valid use position.
    assert_eq!(
      intervals.split_child_at_op_id(parent, 7, OperandMode::Use),
      Some(parent)
    );
    assert_eq!(intervals.split_child_before_op_id(grandchild, 14), Some(child));
    assert_eq!(intervals.interval_covering_op_id(grandchild, 8), Some(child));
  }

  #[test]
  fn materializable_only_with_one_definition() {
    let reg = VirtualReg::new(RegClass::I32, 0).to_reg();
    let mut int = Interval::new(IntId::new(0), reg, Location::None);
    int.add_materialization_value(Some(3));
    assert!(int.can_materialize());
    int.add_materialization_value(Some(4));
    assert!(!int.can_materialize());
  }
}
