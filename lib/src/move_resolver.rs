/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Sequentialization of parallel moves.
//!
//! A set of copies that conceptually happen at the same time is turned into
//! a sequence that never overwrites a register before it has been read. A
//! cycle of register-to-register copies is broken by parking one value in a
//! stack slot.

use log::{debug, trace};

use crate::data_structures::{IntId, Location};
use crate::inst_stream::{EditKind, InsertPoint};
use crate::interface::{Function, RegAllocError};
use crate::linear_scan::LinearScan;

/// Where a pending move reads its value from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum MoveSource {
  Interval(IntId),
  /// Index into the constants table.
  Constant(u32),
}

pub(crate) struct MoveResolver {
  insert_point: Option<InsertPoint>,
  mapping_from: Vec<MoveSource>,
  mapping_to: Vec<IntId>,
  /// Number of pending moves reading each real register.
  register_blocked: Vec<u32>,
}

impl MoveResolver {
  pub(crate) fn new(num_regs: usize) -> Self {
    Self {
      insert_point: None,
      mapping_from: Vec::new(),
      mapping_to: Vec::new(),
      register_blocked: vec![0; num_regs],
    }
  }

  pub(crate) fn has_mappings(&self) -> bool {
    !self.mapping_to.is_empty()
  }

  /// Sets the insertion point of the moves collected so far. The resolver
  /// must be reset, as it is after `resolve_and_append_moves`.
  pub(crate) fn set_insert_point(&mut self, point: InsertPoint) {
    debug_assert!(
      self.insert_point.is_none(),
      "insertion point already set; use move_insert_point"
    );
    self.insert_point = Some(point);
  }

  /// Switches to another insertion point, emitting the moves pending at the
  /// current one first.
  pub(crate) fn move_insert_point<F: Function>(
    &mut self, ls: &mut LinearScan<F>, point: InsertPoint,
  ) -> Result<(), RegAllocError> {
    if self.insert_point.map_or(false, |current| current != point) {
      self.resolve_and_append_moves(ls)?;
    }
    self.insert_point = Some(point);
    Ok(())
  }

  /// Records the move `from -> to`. Nothing is recorded when `to` is
  /// recomputed from its constant anyway; a source that lives in no
  /// register or slot is rematerialized.
  pub(crate) fn add_mapping<F: Function>(
    &mut self, ls: &LinearScan<F>, from: IntId, to: IntId,
  ) {
    let intervals = &ls.intervals;
    if intervals[to].location.is_constant() {
      trace!("move to {:?}: destination is rematerialized", to);
      return;
    }
    if intervals[from].location.is_constant() {
      if let Some(constant) = intervals[from].materialized {
        self.add_constant_mapping(constant, to);
        return;
      }
    }
    trace!("add move mapping {:?} -> {:?}", from, to);
    debug_assert!(!self.mapping_to.contains(&to), "duplicate destination");
    self.mapping_from.push(MoveSource::Interval(from));
    self.mapping_to.push(to);
  }

  pub(crate) fn add_constant_mapping(&mut self, constant: u32, to: IntId) {
    trace!("add constant mapping c{} -> {:?}", constant, to);
    debug_assert!(!self.mapping_to.contains(&to), "duplicate destination");
    self.mapping_from.push(MoveSource::Constant(constant));
    self.mapping_to.push(to);
  }

  fn source_reg_index<F: Function>(
    ls: &LinearScan<F>, from: MoveSource,
  ) -> Option<usize> {
    match from {
      MoveSource::Interval(id) => {
        ls.intervals[id].location.reg().map(|reg| reg.get_index())
      }
      MoveSource::Constant(_) => None,
    }
  }

  fn block_registers<F: Function>(
    &mut self, ls: &LinearScan<F>, from: MoveSource,
  ) {
    if let Some(ix) = Self::source_reg_index(ls, from) {
      self.register_blocked[ix] += 1;
    }
  }

  fn unblock_registers<F: Function>(
    &mut self, ls: &LinearScan<F>, from: MoveSource,
  ) {
    if let Some(ix) = Self::source_reg_index(ls, from) {
      debug_assert!(self.register_blocked[ix] > 0, "register not blocked");
      self.register_blocked[ix] -= 1;
    }
  }

  /// Can `to` be written without clobbering a source that is still
  /// needed? A register read only by this very move does not count.
  fn safe_to_process_move<F: Function>(
    &self, ls: &LinearScan<F>, from: MoveSource, to: IntId,
  ) -> bool {
    let to_reg = match ls.intervals[to].location.reg() {
      Some(reg) => reg,
      None => return true,
    };
    let blocked = self.register_blocked[to_reg.get_index()];
    let from_loc = match from {
      MoveSource::Interval(id) => ls.intervals[id].location,
      MoveSource::Constant(_) => Location::None,
    };
    blocked == 0 || (blocked == 1 && from_loc == Location::Reg(to_reg))
  }

  fn insert_move<F: Function>(
    &self, ls: &mut LinearScan<F>, point: InsertPoint, from: MoveSource,
    to: IntId,
  ) {
    let kind = match from {
      MoveSource::Interval(from) => EditKind::Move { from, to },
      MoveSource::Constant(constant) => {
        EditKind::Materialize { constant, to }
      }
    };
    ls.push_edit(point, kind);
  }

  /// Emits all pending moves at the insertion point, clears them and
  /// resets the insertion point.
  #[inline(never)]
  pub(crate) fn resolve_and_append_moves<F: Function>(
    &mut self, ls: &mut LinearScan<F>,
  ) -> Result<(), RegAllocError> {
    let insert_point = self.insert_point.take();
    if !self.has_mappings() {
      return Ok(());
    }
    let point = match insert_point {
      Some(point) => point,
      None => {
        return Err(RegAllocError::Other(
          "pending moves without an insertion point".into(),
        ))
      }
    };
    debug!("resolving {} moves at {:?}", self.mapping_to.len(), point);

    for i in 0..self.mapping_from.len() {
      self.block_registers(ls, self.mapping_from[i]);
    }

    let mut spill_candidate: Option<usize> = None;
    while !self.mapping_from.is_empty() {
      let mut processed_interval = false;

      let mut i = self.mapping_from.len();
      while i > 0 {
        i -= 1;
        let (from, to) = (self.mapping_from[i], self.mapping_to[i]);
        if self.safe_to_process_move(ls, from, to) {
          self.insert_move(ls, point, from, to);
          self.unblock_registers(ls, from);
          self.mapping_from.remove(i);
          self.mapping_to.remove(i);
          processed_interval = true;
        } else if let MoveSource::Interval(id) = from {
          if ls.intervals[id].location.reg().is_some() {
            // A register-to-register move: can be broken out of a cycle.
            spill_candidate = Some(i);
          }
        }
      }

      if !processed_interval {
        let candidate = spill_candidate.ok_or_else(|| {
          RegAllocError::Other("no move to break the move cycle".into())
        })?;
        self.break_cycle(ls, point, candidate)?;
        spill_candidate = None;
      }
    }

    debug_assert!(self.register_blocked.iter().all(|&n| n == 0));
    Ok(())
  }

  /// Parks the source of move `ix` in a stack slot: emits a copy into a
  /// fresh interval living there and makes that the move's source.
  fn break_cycle<F: Function>(
    &mut self, ls: &mut LinearScan<F>, point: InsertPoint, ix: usize,
  ) -> Result<(), RegAllocError> {
    let from = match self.mapping_from[ix] {
      MoveSource::Interval(id) => id,
      MoveSource::Constant(_) => {
        return Err(RegAllocError::Other(
          "constant move selected to break a cycle".into(),
        ))
      }
    };

    let spill_interval = ls.intervals.create_derived(from);
    let slot = match ls.intervals.spill_slot(from) {
      Some(slot) => slot,
      None => {
        let class = ls.intervals[from].class;
        let slot = ls.frame.allocate_spill_slot(ls.func, class);
        ls.intervals.set_spill_slot(from, slot);
        slot
      }
    };
    // Positions [1, 2) mark the interval as a move resolver helper.
    ls.intervals[spill_interval].add_range(1, 2);
    ls.intervals[spill_interval].location = Location::Stack(slot);
    debug!(
      "breaking move cycle: {:?} parked in {:?} ({:?})",
      from, slot, spill_interval
    );

    self.block_registers(ls, MoveSource::Interval(spill_interval));
    self.insert_move(ls, point, MoveSource::Interval(from), spill_interval);
    self.unblock_registers(ls, MoveSource::Interval(from));
    self.mapping_from[ix] = MoveSource::Interval(spill_interval);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data_structures::{BlockIx, RealReg};
  use crate::inst_stream::InsertRank;
  use crate::test_utils::{make_universe, rreg, FuncBuilder, TestFunc};
  use crate::AllocatorOptions;

  fn with_scan<R>(
    func: &TestFunc, f: impl FnOnce(&mut LinearScan<TestFunc>) -> R,
  ) -> R {
    let universe = make_universe(3);
    let options = AllocatorOptions::default();
    let mut ls = LinearScan::new(func, &universe, &options).unwrap();
    f(&mut ls)
  }

  fn point() -> InsertPoint {
    InsertPoint { block: BlockIx::new(0), index: 0, rank: InsertRank::Walker }
  }

  /// Executes the emitted edits on a register/slot file.
  fn replay(
    ls: &LinearScan<TestFunc>, regs: &mut Vec<Option<u32>>,
    slots: &mut Vec<Option<u32>>, values: &dyn Fn(IntId) -> u32,
  ) {
    for edit in ls.edits.iter() {
      let (value, to) = match edit.kind {
        EditKind::Move { from, to } => {
          let value = match ls.intervals[from].location {
            Location::Reg(r) => regs[r.get_index()],
            Location::Stack(s) => slots[s.get_usize()],
            _ => Some(values(from)),
          };
          (value, to)
        }
        EditKind::Materialize { constant, to } => (Some(constant), to),
        EditKind::Store { .. } => unreachable!(),
      };
      match ls.intervals[to].location {
        Location::Reg(r) => regs[r.get_index()] = value,
        Location::Stack(s) => {
          if slots.len() <= s.get_usize() {
            slots.resize(s.get_usize() + 1, None);
          }
          slots[s.get_usize()] = value
        }
        _ => panic!("bad destination"),
      }
    }
  }

  fn vreg_intervals(ls: &mut LinearScan<TestFunc>, n: usize) -> Vec<IntId> {
    (0..n)
      .map(|i| {
        let id = ls.operand_interval(ls.lir.num_real + i);
        ls.intervals[id].add_range(2, 4);
        id
      })
      .collect()
  }

  fn reg(ix: usize) -> RealReg {
    rreg(ix)
  }

  fn two_value_func() -> TestFunc {
    let mut b = FuncBuilder::new();
    let vs: Vec<_> = (0..4).map(|_| b.vreg()).collect();
    let b0 = b.block();
    b.switch_to(b0);
    for (i, v) in vs.iter().enumerate() {
      b.def_const(*v, i as u32);
    }
    b.op(vs[0], &[vs[1], vs[2], vs[3]]);
    b.ret(Some(vs[0]));
    b.finish()
  }

  #[test]
  fn swap_is_broken_through_the_stack() {
    let func = two_value_func();
    with_scan(&func, |ls| {
      let ids = vreg_intervals(ls, 4);
      let (a, b, a2, b2) = (ids[0], ids[1], ids[2], ids[3]);
      // a in r0 and b in r1 must end up swapped.
      ls.intervals[a].location = Location::Reg(reg(0));
      ls.intervals[b].location = Location::Reg(reg(1));
      ls.intervals[a2].location = Location::Reg(reg(1));
      ls.intervals[b2].location = Location::Reg(reg(0));

      let mut resolver = MoveResolver::new(ls.universe.num_regs());
      resolver.set_insert_point(point());
      resolver.add_mapping(ls, a, a2);
      resolver.add_mapping(ls, b, b2);
      resolver.resolve_and_append_moves(ls).unwrap();
      assert!(!resolver.has_mappings());
      assert_eq!(ls.edits.len(), 3);

      let mut regs = vec![Some(10), Some(11), None, None];
      let mut slots = vec![];
      replay(ls, &mut regs, &mut slots, &|_| unreachable!());
      assert_eq!(regs[0], Some(11));
      assert_eq!(regs[1], Some(10));
      // The parked value went through a stack slot.
      assert_eq!(ls.frame.num_allocated(), 1);
    });
  }

  #[test]
  fn moves_collected_before_the_insertion_point() {
    let func = two_value_func();
    with_scan(&func, |ls| {
      let ids = vreg_intervals(ls, 4);
      ls.intervals[ids[0]].location = Location::Reg(reg(0));
      ls.intervals[ids[1]].location = Location::Reg(reg(1));
      ls.intervals[ids[2]].location = Location::Reg(reg(2));
      ls.intervals[ids[3]].location = Location::Reg(reg(0));

      // Edge resolution collects the moves of an edge first and only then
      // picks where they go.
      let mut resolver = MoveResolver::new(ls.universe.num_regs());
      resolver.add_mapping(ls, ids[0], ids[2]);
      assert!(resolver.has_mappings());
      resolver.set_insert_point(point());
      resolver.resolve_and_append_moves(ls).unwrap();
      assert_eq!(ls.edits.len(), 1);

      // Resolving resets the resolver for the next edge.
      resolver.add_mapping(ls, ids[1], ids[3]);
      let next = InsertPoint { index: 1, ..point() };
      resolver.set_insert_point(next);
      resolver.resolve_and_append_moves(ls).unwrap();
      assert_eq!(ls.edits.len(), 2);
      assert_eq!(ls.edits[1].point, next);
      assert!(!resolver.has_mappings());
    });
  }

  #[test]
  fn chains_are_ordered_without_spilling() {
    let func = two_value_func();
    with_scan(&func, |ls| {
      let ids = vreg_intervals(ls, 4);
      // r0 -> r1 and r1 -> r2: r1 must be read before it is written.
      ls.intervals[ids[0]].location = Location::Reg(reg(0));
      ls.intervals[ids[1]].location = Location::Reg(reg(1));
      ls.intervals[ids[2]].location = Location::Reg(reg(1));
      ls.intervals[ids[3]].location = Location::Reg(reg(2));

      let mut resolver = MoveResolver::new(ls.universe.num_regs());
      resolver.set_insert_point(point());
      resolver.add_mapping(ls, ids[0], ids[2]);
      resolver.add_mapping(ls, ids[1], ids[3]);
      resolver.resolve_and_append_moves(ls).unwrap();
      assert_eq!(ls.edits.len(), 2);
      assert_eq!(ls.frame.num_allocated(), 0);

      let mut regs = vec![Some(10), Some(11), None, None];
      replay(ls, &mut regs, &mut vec![], &|_| unreachable!());
      assert_eq!(regs[1], Some(10));
      assert_eq!(regs[2], Some(11));
    });
  }

  #[test]
  fn rematerialized_values() {
    let func = two_value_func();
    with_scan(&func, |ls| {
      let ids = vreg_intervals(ls, 4);
      ls.intervals[ids[0]].materialized = Some(7);
      ls.intervals[ids[0]].location = Location::Constant;
      ls.intervals[ids[1]].location = Location::Reg(reg(0));
      ls.intervals[ids[2]].location = Location::Constant;
      ls.intervals[ids[3]].location = Location::Reg(reg(2));

      let mut resolver = MoveResolver::new(ls.universe.num_regs());
      resolver.set_insert_point(point());
      // A reload of a constant becomes a materialization...
      resolver.add_mapping(ls, ids[0], ids[3]);
      // ...and a spill into a rematerialized value disappears.
      resolver.add_mapping(ls, ids[1], ids[2]);
      resolver.resolve_and_append_moves(ls).unwrap();
      assert_eq!(ls.edits.len(), 1);
      match ls.edits[0].kind {
        EditKind::Materialize { constant: 7, to } => assert_eq!(to, ids[3]),
        ref other => panic!("unexpected edit {:?}", other),
      }
    });
  }
}
