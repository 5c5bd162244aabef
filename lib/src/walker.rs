/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The interval walker: assigns a register or a stack slot to every interval.
//!
//! Intervals are visited in order of their start position. The current one
//! gets the register that stays free the longest; if none is free long
//! enough, the register whose next use lies furthest away is taken and its
//! holders are split and spilled. Splitting creates new unhandled intervals
//! which the walker picks up as it advances.
//!
//! The optimizing variant also looks at every block with a single
//! predecessor: a split child that arrives there in another location than
//! the predecessor left it in is split again at the block start and moved
//! to the predecessor's location, which makes the edge move disappear.

use std::mem;

use log::{debug, log_enabled, trace, Level};

use crate::data_structures::{BlockIx, IntId, Location, RealReg};
use crate::inst_stream::{InsertPoint, InsertRank};
use crate::interface::{Function, RegAllocError};
use crate::intervals::{
  IntervalState, OperandMode, RegisterBinding, RegisterPriority, SpillState,
  END_POS,
};
use crate::linear_scan::LinearScan;
use crate::move_resolver::MoveResolver;

//=============================================================================
// Interval lists

const BINDINGS: [RegisterBinding; 3] =
  [RegisterBinding::Fixed, RegisterBinding::Any, RegisterBinding::Stack];

#[derive(Default)]
struct BindingLists {
  fixed: Vec<IntId>,
  any: Vec<IntId>,
  stack: Vec<IntId>,
}

impl BindingLists {
  fn get(&self, binding: RegisterBinding) -> &Vec<IntId> {
    match binding {
      RegisterBinding::Fixed => &self.fixed,
      RegisterBinding::Any => &self.any,
      RegisterBinding::Stack => &self.stack,
    }
  }

  fn get_mut(&mut self, binding: RegisterBinding) -> &mut Vec<IntId> {
    match binding {
      RegisterBinding::Fixed => &mut self.fixed,
      RegisterBinding::Any => &mut self.any,
      RegisterBinding::Stack => &mut self.stack,
    }
  }

  fn remove(&mut self, binding: RegisterBinding, id: IntId) -> bool {
    let list = self.get_mut(binding);
    match list.iter().position(|&other| other == id) {
      Some(ix) => {
        list.remove(ix);
        true
      }
      None => false,
    }
  }
}

//=============================================================================
// Walker state

struct Walker<'l, 'a, F: Function> {
  ls: &'l mut LinearScan<'a, F>,
  optimizing: bool,

  /// Sorted by decreasing start position: the next interval to handle is
  /// popped off the end.
  unhandled: BindingLists,
  active: BindingLists,
  inactive: BindingLists,

  current_position: u32,

  // Per-register state for the current interval, indexed by real register
  // index. Only entries of `available_regs` are meaningful.
  available_regs: Vec<RealReg>,
  /// Position up to which a register is free (or its next use, when
  /// spilling).
  use_pos: Vec<u32>,
  /// Position at which a fixed interval needs a register.
  block_pos: Vec<u32>,
  /// Intervals to evict to free a register.
  spill_intervals: Vec<Vec<IntId>>,

  move_resolver: MoveResolver,

  /// True if calls destroy every allocatable register: no interval living
  /// across a call can then get a register there.
  call_kills_registers: bool,
}

impl<'l, 'a, F: Function> Walker<'l, 'a, F> {
  fn new(ls: &'l mut LinearScan<'a, F>, optimizing: bool) -> Self {
    let num_regs = ls.universe.num_regs();

    let mut unhandled = BindingLists::default();
    for id in ls.intervals.ids() {
      let interval = &ls.intervals[id];
      if interval.is_empty() {
        continue;
      }
      if interval.is_fixed() {
        unhandled.fixed.push(id);
      } else {
        unhandled.any.push(id);
      }
    }
    // Stable, so that equal start positions are popped in index order.
    for list in [&mut unhandled.fixed, &mut unhandled.any].iter_mut() {
      list.sort_by_key(|&id| ls.intervals[id].from());
      list.reverse();
    }

    let call_kills_registers = ls.universe.all_allocable_caller_saved();
    Self {
      ls,
      optimizing,
      unhandled,
      active: BindingLists::default(),
      inactive: BindingLists::default(),
      current_position: 0,
      available_regs: Vec::new(),
      use_pos: vec![END_POS; num_regs],
      block_pos: vec![END_POS; num_regs],
      spill_intervals: vec![Vec::new(); num_regs],
      move_resolver: MoveResolver::new(num_regs),
      call_kills_registers,
    }
  }

  #[inline(never)]
  fn walk(&mut self) -> Result<(), RegAllocError> {
    if self.optimizing {
      for pos in 0..self.ls.order.alloc_order.len() as u32 {
        let block = self.ls.block_at(pos);
        self.optimize_block(block)?;
      }
    }
    self.walk_to(END_POS)?;
    self.move_resolver.resolve_and_append_moves(self.ls)
  }

  // === BEGIN list maintenance ===
  //
  fn next_interval(
    &mut self, to_op_id: u32,
  ) -> Option<(RegisterBinding, IntId)> {
    let from = |id: Option<&IntId>| id.map(|&id| self.ls.intervals[id].from());
    let fixed_from = from(self.unhandled.fixed.last());
    let any_from = from(self.unhandled.any.last());
    let binding = match (fixed_from, any_from) {
      (Some(fixed), Some(any)) => {
        if fixed <= any {
          RegisterBinding::Fixed
        } else {
          RegisterBinding::Any
        }
      }
      (Some(_), None) => RegisterBinding::Fixed,
      (None, Some(_)) => RegisterBinding::Any,
      (None, None) => return None,
    };
    let id = *self.unhandled.get(binding).last()?;
    if self.ls.intervals[id].from() > to_op_id {
      return None;
    }
    self.unhandled.get_mut(binding).pop();
    self.ls.intervals[id].rewind_range();
    Some((binding, id))
  }

  /// Sorted by start position, then by first use: a new interval goes
  /// before those with the same key.
  fn insert_unhandled(&mut self, binding: RegisterBinding, id: IntId) {
    let intervals = &self.ls.intervals;
    let key = |id: IntId| {
      let interval = &intervals[id];
      (interval.from(), interval.first_usage(RegisterPriority::None))
    };
    let new_key = key(id);
    let list = self.unhandled.get_mut(binding);
    let ix = list
      .iter()
      .position(|&other| key(other) < new_key)
      .unwrap_or(list.len());
    list.insert(ix, id);
  }

  /// Moves intervals between the active, inactive and handled states as the
  /// position advances to `from`.
  fn walk_state_to(&mut self, state: IntervalState, from: u32) {
    debug_assert!(
      state == IntervalState::Active || state == IntervalState::Inactive
    );
    for &binding in BINDINGS.iter() {
      let list = match state {
        IntervalState::Active => mem::take(self.active.get_mut(binding)),
        _ => mem::take(self.inactive.get_mut(binding)),
      };
      let mut kept = Vec::with_capacity(list.len());
      let mut to_active = Vec::new();
      let mut to_inactive = Vec::new();

      for id in list {
        let interval = &mut self.ls.intervals[id];
        if interval.current_from() > from {
          kept.push(id);
          continue;
        }
        let mut changed = false;
        while interval.current_to() <= from {
          interval.next_range();
          changed = true;
        }
        changed |=
          state == IntervalState::Inactive && interval.current_from() <= from;
        if !changed {
          kept.push(id);
          continue;
        }

        if interval.current_at_end() {
          interval.state = IntervalState::Handled;
          trace!("  {:?} is handled at {}", id, from);
        } else if interval.current_from() <= from {
          interval.state = IntervalState::Active;
          to_active.push(id);
        } else {
          interval.state = IntervalState::Inactive;
          to_inactive.push(id);
        }
      }

      match state {
        IntervalState::Active => *self.active.get_mut(binding) = kept,
        _ => *self.inactive.get_mut(binding) = kept,
      }
      self.active.get_mut(binding).extend(to_active);
      self.inactive.get_mut(binding).extend(to_inactive);
    }
  }

  /// Spilled intervals only enter the stack lists in the optimizing walker.
  fn update_unhandled_stack_intervals(&mut self, op_id: u32) {
    while let Some(&id) = self.unhandled.stack.last() {
      let interval = &mut self.ls.intervals[id];
      if interval.from() > op_id {
        break;
      }
      self.unhandled.stack.pop();
      if interval.to() > op_id {
        interval.state = IntervalState::Active;
        self.active.stack.push(id);
      } else {
        interval.state = IntervalState::Handled;
      }
    }
  }

  /// Handles every unhandled interval starting at or before `to_op_id`.
  fn walk_to(&mut self, to_op_id: u32) -> Result<(), RegAllocError> {
    while let Some((binding, id)) = self.next_interval(to_op_id) {
      let op_id = self.ls.intervals[id].from();
      self.current_position = op_id;
      self.update_unhandled_stack_intervals(op_id);
      self.walk_state_to(IntervalState::Active, op_id);
      self.walk_state_to(IntervalState::Inactive, op_id);

      self.ls.intervals[id].state = IntervalState::Active;
      if self.activate_current(id)? {
        self.active.get_mut(binding).push(id);
      }
    }

    self.current_position = to_op_id;
    if to_op_id <= self.ls.lir.max_op_id() {
      self.update_unhandled_stack_intervals(to_op_id);
      self.walk_state_to(IntervalState::Active, to_op_id);
      self.walk_state_to(IntervalState::Inactive, to_op_id);
    }
    Ok(())
  }

  fn remove_from_list(&mut self, id: IntId) {
    let removed = match self.ls.intervals[id].state {
      IntervalState::Active => self.active.remove(RegisterBinding::Any, id),
      _ => self.inactive.remove(RegisterBinding::Any, id),
    };
    debug_assert!(removed, "{:?} is in neither list", id);
  }
  //
  // === END list maintenance ===

  // === BEGIN register state ===
  //
  fn init_vars_for_alloc(&mut self, id: IntId) {
    let class = self.ls.intervals[id].class;
    self.available_regs = self.ls.universe.allocable_regs(class);
  }

  fn init_use_lists(&mut self, only_use_pos: bool) {
    for &reg in self.available_regs.iter() {
      let ix = reg.get_index();
      self.use_pos[ix] = END_POS;
      if !only_use_pos {
        self.block_pos[ix] = END_POS;
        self.spill_intervals[ix].clear();
      }
    }
  }

  /// The register of `id`, if it is one the current interval could take.
  fn candidate_reg(&self, id: IntId) -> Option<usize> {
    let reg = self.ls.intervals[id].location.reg()?;
    if self.available_regs.contains(&reg) {
      Some(reg.get_index())
    } else {
      None
    }
  }

  fn set_use_pos(&mut self, id: IntId, pos: Option<u32>, only_use_pos: bool) {
    let (pos, ix) = match (pos, self.candidate_reg(id)) {
      (Some(pos), Some(ix)) => (pos, ix),
      _ => return,
    };
    self.use_pos[ix] = self.use_pos[ix].min(pos);
    if !only_use_pos {
      self.spill_intervals[ix].push(id);
    }
  }

  fn set_block_pos(&mut self, id: IntId, pos: Option<u32>) {
    let (pos, ix) = match (pos, self.candidate_reg(id)) {
      (Some(pos), Some(ix)) => (pos, ix),
      _ => return,
    };
    self.block_pos[ix] = self.block_pos[ix].min(pos);
    self.use_pos[ix] = self.use_pos[ix].min(pos);
  }

  fn exclude_active(&mut self, binding: RegisterBinding) {
    for i in 0..self.active.get(binding).len() {
      let id = self.active.get(binding)[i];
      if let Some(ix) = self.candidate_reg(id) {
        self.use_pos[ix] = 0;
      }
    }
  }

  fn free_collect_inactive(&mut self, binding: RegisterBinding, cur: IntId) {
    for i in 0..self.inactive.get(binding).len() {
      let id = self.inactive.get(binding)[i];
      let intervals = &self.ls.intervals;
      let (interval, current) = (&intervals[id], &intervals[cur]);
      let pos = if binding == RegisterBinding::Fixed
        && current.to() <= interval.current_from()
      {
        Some(interval.current_from())
      } else {
        interval.current_intersects_at(current)
      };
      self.set_use_pos(id, pos, true);
    }
  }

  fn spill_block_inactive_fixed(&mut self, cur: IntId) {
    for i in 0..self.inactive.fixed.len() {
      let id = self.inactive.fixed[i];
      let intervals = &self.ls.intervals;
      let (interval, current) = (&intervals[id], &intervals[cur]);
      if current.to() > interval.current_from() {
        let pos = interval.current_intersects_at(current);
        self.set_block_pos(id, pos);
      }
    }
  }

  fn spill_collect_active_any(&mut self, prio: RegisterPriority) {
    for i in 0..self.active.any.len() {
      let id = self.active.any[i];
      let interval = &self.ls.intervals[id];
      let pos =
        interval.next_usage(prio, self.current_position).min(interval.to());
      self.set_use_pos(id, Some(pos), false);
    }
  }

  fn spill_collect_inactive_any(&mut self, cur: IntId) {
    for i in 0..self.inactive.any.len() {
      let id = self.inactive.any[i];
      let intervals = &self.ls.intervals;
      let (interval, current) = (&intervals[id], &intervals[cur]);
      if interval.current_intersects(current) {
        let pos = interval
          .next_usage(RegisterPriority::LiveAtLoopEnd, self.current_position)
          .min(interval.to());
        self.set_use_pos(id, Some(pos), false);
      }
    }
  }

  /// Fills in `use_pos`, `block_pos` and `spill_intervals` for evicting
  /// intervals in favour of `cur`.
  fn collect_spill_state(&mut self, cur: IntId, prio: RegisterPriority) {
    self.init_use_lists(false);
    self.exclude_active(RegisterBinding::Fixed);
    self.spill_block_inactive_fixed(cur);
    self.spill_collect_active_any(prio);
    self.spill_collect_inactive_any(cur);
  }

  fn trace_register_state(&self, what: &str) {
    if !log_enabled!(Level::Trace) {
      return;
    }
    for &reg in self.available_regs.iter() {
      let ix = reg.get_index();
      trace!(
        "  {} {}: use {} block {} spill {:?}",
        what,
        self.ls.universe.name_of(reg),
        self.use_pos[ix],
        self.block_pos[ix],
        self.spill_intervals[ix]
      );
    }
  }
  //
  // === END register state ===

  // === BEGIN split positions ===
  //
  /// The position in `[min_split_pos, max_split_pos]` where splitting `id`
  /// is cheapest: a block boundary of low loop depth, or a lifetime hole.
  fn find_optimal_split_pos(
    &self, id: IntId, min_split_pos: u32, max_split_pos: u32,
    do_loop_optimization: bool,
  ) -> u32 {
    if min_split_pos == max_split_pos {
      return min_split_pos;
    }
    let lir = &self.ls.lir;
    let interval = &self.ls.intervals[id];
    let min_block = lir.block_for_id(min_split_pos.saturating_sub(1));
    let max_block = lir.block_for_id(max_split_pos - 1);
    if min_block == max_block {
      return max_split_pos;
    }
    if interval.has_hole_between(max_split_pos - 1, max_split_pos)
      && !lir.is_block_begin(max_split_pos)
    {
      // The interval is dead before the maximum: no move needed there.
      return max_split_pos;
    }

    if do_loop_optimization {
      // Loop ends with a use are marked; splitting in front of such a loop
      // keeps the loop body free of spill code.
      let loop_end_pos = interval.next_usage_exact(
        RegisterPriority::LiveAtLoopEnd,
        lir.block_last_id[min_block] + 2,
      );
      if loop_end_pos < max_split_pos {
        let loop_block = lir.block_for_id(loop_end_pos);
        let max_spill_pos = lir.block_last_id[loop_block] + 2;
        let pos = self.find_optimal_split_pos_between(
          min_block,
          loop_block,
          max_spill_pos,
        );
        if pos != max_spill_pos {
          trace!("  split of {:?} moved out of a loop: {}", id, pos);
          return pos;
        }
      }
    }

    self.find_optimal_split_pos_between(min_block, max_block, max_split_pos)
  }

  /// The end of the outermost block between `min_block` and `max_block` in
  /// allocation order.
  fn find_optimal_split_pos_between(
    &self, min_block: BlockIx, max_block: BlockIx, max_split_pos: u32,
  ) -> u32 {
    let lir = &self.ls.lir;
    let depth_map = &self.ls.cfg.depth_map;
    let from_pos = self.ls.order.linear_pos[min_block];
    let to_pos = self.ls.order.linear_pos[max_block];

    let mut optimal = lir.block_last_id[max_block] + 2;
    if optimal > max_split_pos {
      optimal = lir.block_first_id[max_block];
    }
    let mut min_depth = depth_map[max_block];
    let mut pos = to_pos;
    while min_depth > 0 && pos > from_pos {
      pos -= 1;
      let block = self.ls.block_at(pos);
      if depth_map[block] < min_depth {
        min_depth = depth_map[block];
        optimal = lir.block_last_id[block] + 2;
      }
    }
    optimal
  }

  /// Turns an optimal split position into one the interval can be cut at.
  /// Positions inside a block go to the odd slot before the operation;
  /// when that slot is the end of a block, the split moves to the label of
  /// the next block. The flag tells whether the result is a block begin.
  fn adjust_split_pos(
    &self, id: IntId, optimal: u32,
  ) -> Result<(u32, bool), RegAllocError> {
    let lir = &self.ls.lir;
    if lir.is_block_begin(optimal) {
      return Ok((optimal, true));
    }
    let pos = (optimal - 1) | 1;
    if !lir.is_block_begin(pos + 1) {
      return Ok((pos, false));
    }
    if pos + 1 < self.ls.intervals[id].to() {
      Ok((pos + 1, true))
    } else {
      Err(RegAllocError::Other(format!(
        "no split position for {:?} near {}",
        self.ls.intervals[id].reg, optimal
      )))
    }
  }

  fn split_interval(
    &mut self, id: IntId, pos: u32,
  ) -> Result<IntId, RegAllocError> {
    let interval = &self.ls.intervals[id];
    if pos <= interval.from() || pos >= interval.to() {
      return Err(RegAllocError::Other(format!(
        "split position {} of {:?} outside [{}, {})",
        pos,
        interval.reg,
        interval.from(),
        interval.to()
      )));
    }
    let child = self.ls.intervals.split(id, pos);
    self.ls.stats.num_splits += 1;
    trace!("  split {:?} at {}: new child {:?}", id, pos, child);
    Ok(child)
  }
  //
  // === END split positions ===

  // === BEGIN splitting ===
  //
  /// Splits `id` somewhere in `[min_split_pos, max_split_pos]` and queues the
  /// remainder as unhandled.
  fn split_before_usage(
    &mut self, id: IntId, min_split_pos: u32, max_split_pos: u32,
  ) -> Result<(), RegAllocError> {
    trace!(
      "  split {:?} before usage in [{}, {}]",
      id,
      min_split_pos,
      max_split_pos
    );
    let optimal =
      self.find_optimal_split_pos(id, min_split_pos, max_split_pos, true);
    let interval = &self.ls.intervals[id];
    if optimal == interval.to()
      && interval.next_usage(RegisterPriority::MustHaveRegister, min_split_pos)
        == END_POS
    {
      trace!("  {:?} ends before its next register use; no split", id);
      return Ok(());
    }
    let move_necessary = !self.ls.lir.is_block_begin(optimal)
      && !interval.has_hole_between(optimal - 1, optimal);

    let (pos, at_block_begin) = self.adjust_split_pos(id, optimal)?;
    let child = self.split_interval(id, pos)?;
    // Edges into a block are connected by data flow resolution.
    self.ls.intervals[child].insert_move_when_activated =
      move_necessary && !at_block_begin;
    self.insert_unhandled(RegisterBinding::Any, child);
    Ok(())
  }

  /// Splits `id` where the register it got partially runs out.
  fn split_when_partial_register_available(
    &mut self, id: IntId, register_available_until: u32,
  ) -> Result<(), RegAllocError> {
    let interval = &self.ls.intervals[id];
    let min_split_pos = interval
      .previous_usage(
        RegisterPriority::ShouldHaveRegister,
        register_available_until,
      )
      .unwrap_or(0)
      .max(interval.from() + 1);
    self.split_before_usage(id, min_split_pos, register_available_until)
  }

  /// An interval starting on the stack gets a register from its first use
  /// that wants one.
  fn split_stack_interval(&mut self, id: IntId) -> Result<(), RegAllocError> {
    let interval = &self.ls.intervals[id];
    let min_split_pos = self.current_position + 1;
    let max_split_pos = interval
      .first_usage(RegisterPriority::ShouldHaveRegister)
      .min(interval.to());
    if max_split_pos < min_split_pos {
      return Ok(());
    }
    self.split_before_usage(id, min_split_pos, max_split_pos)
  }

  /// Evicts `id` from its register at the current position. `reg_info` is
  /// the register the current interval takes and its use position there;
  /// it is only given for the current interval itself.
  fn split_and_spill_interval(
    &mut self, id: IntId, reg_info: Option<(RealReg, u32)>,
  ) -> Result<(), RegAllocError> {
    let current_pos = self.current_position;
    if self.ls.intervals[id].state == IntervalState::Inactive {
      // Only the part after the hole needs to go.
      return self.split_before_usage(id, current_pos + 1, current_pos + 1);
    }

    let interval = &self.ls.intervals[id];
    let min_split_pos = current_pos + 1;
    let max_split_pos = interval
      .next_usage(RegisterPriority::MustHaveRegister, min_split_pos)
      .min(interval.to());
    self.split_before_usage(id, min_split_pos, max_split_pos)?;

    match reg_info {
      Some((reg, use_pos)) if self.ls.intervals[id].to() < use_pos => {
        // What remains ends before the register is used again.
        trace!("  {:?} keeps {:?} after all", id, reg);
        self.assign_register_until_blocked(id, reg)
      }
      _ => self.split_for_spilling(id),
    }
  }

  /// Moves the part of `id` up to the current position into its spill slot,
  /// at the latest position after the last use that wants a register.
  fn split_for_spilling(&mut self, id: IntId) -> Result<(), RegAllocError> {
    let max_split_pos = self.current_position;
    let interval = &self.ls.intervals[id];
    let mut previous = interval
      .previous_usage(RegisterPriority::ShouldHaveRegister, max_split_pos);
    if previous == Some(max_split_pos) {
      previous = interval
        .previous_usage(RegisterPriority::MustHaveRegister, max_split_pos);
    }
    let min_split_pos =
      previous.map_or(interval.from(), |pos| (pos + 1).max(interval.from()));
    if min_split_pos > max_split_pos {
      return Err(RegAllocError::Other(format!(
        "cannot spill {:?}: it needs a register at {}",
        interval.reg, max_split_pos
      )));
    }

    if min_split_pos == interval.from() {
      self.spill_entire_interval(id);
      return Ok(());
    }

    let optimal =
      self.find_optimal_split_pos(id, min_split_pos, max_split_pos, false);
    let (pos, at_block_begin) = self.adjust_split_pos(id, optimal)?;
    let spilled = self.split_interval(id, pos)?;
    trace!("  spilling {:?} from {}", spilled, pos);
    self.ls.assign_spill_slot(spilled);
    self.handle_spill_slot(spilled);
    self.change_spill_state(spilled, pos);
    if !at_block_begin {
      self.insert_move(pos, id, spilled)?;
    }
    self.ls.intervals.make_current_split_child(spilled);
    Ok(())
  }

  fn spill_entire_interval(&mut self, id: IntId) {
    let from = self.ls.intervals[id].from();
    trace!("  spilling all of {:?}", id);
    self.ls.intervals[id].state = IntervalState::Handled;
    self.ls.assign_spill_slot(id);
    self.handle_spill_slot(id);
    self.change_spill_state(id, from);

    // Earlier children that kept a register without ever using it may as
    // well stay in memory too: that saves the move into this child.
    let mut child = id;
    while !self.ls.intervals[child].is_split_parent() {
      let before = self.ls.intervals[child].from();
      let previous = self.ls.intervals.split_child_before_op_id(child, before);
      let previous = match previous {
        Some(previous) => previous,
        None => break,
      };
      child = previous;
      if self.ls.intervals[previous].location.reg().is_some() {
        let first_use = self.ls.intervals[previous]
          .first_usage(RegisterPriority::ShouldHaveRegister);
        if first_use != END_POS {
          break;
        }
        trace!("  {:?} never uses its register: spilled too", previous);
        self.ls.assign_spill_slot(previous);
        self.handle_spill_slot(previous);
      }
    }
  }

  /// Records where the spill store of the split family of `id` goes: stores
  /// inside a loop deeper than the definition are hoisted.
  fn change_spill_state(&mut self, id: IntId, spill_pos: u32) {
    let parent = self.ls.intervals.parent(id);
    let def_pos = match self.ls.intervals.spill_definition_pos(parent) {
      Some(pos) => pos,
      None => return,
    };
    let def_depth = self.ls.loop_depth_at(def_pos);
    let spill_depth = self.ls.loop_depth_at(spill_pos);
    let hoisted = if self.ls.options.optimize_spill_position {
      SpillState::SpillInDominator
    } else {
      SpillState::StoreAtDefinition
    };
    let new_state = match self.ls.intervals.spill_state(parent) {
      SpillState::NoSpillStore => {
        if def_depth < spill_depth {
          hoisted
        } else {
          SpillState::OneSpillStore
        }
      }
      SpillState::OneSpillStore => {
        if def_depth <= spill_depth {
          hoisted
        } else {
          return;
        }
      }
      _ => return,
    };
    trace!("  spill state of {:?}: {:?}", parent, new_state);
    self.ls.intervals.set_spill_state(parent, new_state);
  }

  fn handle_spill_slot(&mut self, id: IntId) {
    if self.optimizing && self.ls.intervals[id].location.spill().is_some() {
      self.insert_unhandled(RegisterBinding::Stack, id);
    }
  }

  fn split_and_spill_intersecting_intervals(
    &mut self, reg: RealReg,
  ) -> Result<(), RegAllocError> {
    let victims = mem::take(&mut self.spill_intervals[reg.get_index()]);
    for id in victims {
      self.remove_from_list(id);
      self.split_and_spill_interval(id, None)?;
    }
    Ok(())
  }

  /// Gives `reg` to `id` up to the next fixed use of `reg`, evicting its
  /// current holders.
  fn assign_register_until_blocked(
    &mut self, id: IntId, reg: RealReg,
  ) -> Result<(), RegAllocError> {
    let split_pos = self.block_pos[reg.get_index()];
    let need_split = split_pos <= self.ls.intervals[id].to();
    self.ls.intervals[id].location = Location::Reg(reg);
    if need_split {
      self.split_when_partial_register_available(id, split_pos)?;
    }
    self.split_and_spill_intersecting_intervals(reg)
  }
  //
  // === END splitting ===

  // === BEGIN allocation ===
  //
  #[inline(never)]
  fn alloc_free_register(&mut self, id: IntId) -> Result<bool, RegAllocError> {
    self.init_use_lists(true);
    self.exclude_active(RegisterBinding::Fixed);
    self.exclude_active(RegisterBinding::Any);
    self.free_collect_inactive(RegisterBinding::Fixed, id);
    self.free_collect_inactive(RegisterBinding::Any, id);
    self.trace_register_state("free");

    let intervals = &self.ls.intervals;
    let interval = &intervals[id];
    let hint = intervals
      .location_hint(id, true)
      .and_then(|hint| intervals[hint].location.reg());
    let reg_needed_until = interval.from() + 1;
    let interval_to = interval.to();

    let mut min_full_reg: Option<RealReg> = None;
    let mut max_partial_reg: Option<RealReg> = None;
    for &reg in self.available_regs.iter() {
      let pos = self.use_pos[reg.get_index()];
      if pos >= interval_to {
        let better = match min_full_reg {
          None => true,
          Some(best) => {
            Some(reg) == hint
              || (Some(best) != hint && pos < self.use_pos[best.get_index()])
          }
        };
        if better {
          min_full_reg = Some(reg);
        }
      } else if pos > reg_needed_until {
        let better = match max_partial_reg {
          None => true,
          Some(best) => {
            Some(reg) == hint
              || (Some(best) != hint && pos > self.use_pos[best.get_index()])
          }
        };
        if better {
          max_partial_reg = Some(reg);
        }
      }
    }

    let (reg, need_split) = match (min_full_reg, max_partial_reg) {
      (Some(reg), _) => (reg, false),
      (None, Some(reg)) => (reg, true),
      (None, None) => return Ok(false),
    };
    let split_pos = self.use_pos[reg.get_index()];
    trace!(
      "  {:?} gets free {:?} (hint {:?}, free until {})",
      id,
      reg,
      hint,
      split_pos
    );
    self.ls.intervals[id].location = Location::Reg(reg);
    if need_split {
      self.split_when_partial_register_available(id, split_pos)?;
    }
    Ok(true)
  }

  /// A call at `from + 1` destroys every register the interval could get.
  fn no_allocation_possible(&self, id: IntId) -> bool {
    if !self.call_kills_registers {
      return false;
    }
    let interval = &self.ls.intervals[id];
    let pos = interval.from();
    pos & 1 == 1
      && pos < self.ls.lir.max_op_id()
      && self.ls.lir.has_call(pos + 1)
      && interval.to() > pos + 1
  }

  /// Takes the register whose next use is furthest away, evicting its
  /// holders; or spills the current interval if it is itself the best
  /// candidate for spilling.
  #[inline(never)]
  fn alloc_locked_register(&mut self, id: IntId) -> Result<(), RegAllocError> {
    let interval = &self.ls.intervals[id];
    let first_usage =
      interval.first_usage(RegisterPriority::MustHaveRegister);
    let first_should_usage =
      interval.first_usage(RegisterPriority::ShouldHaveRegister);
    let reg_needed_until = first_usage.min(interval.from() + 1);
    let current_reg = interval.location.reg();

    let mut chosen = None;
    for &prio in
      [RegisterPriority::LiveAtLoopEnd, RegisterPriority::MustHaveRegister]
        .iter()
    {
      self.collect_spill_state(id, prio);
      self.trace_register_state("locked");

      let mut reg: Option<RealReg> = None;
      for &candidate in self.available_regs.iter() {
        let pos = self.use_pos[candidate.get_index()];
        if pos > reg_needed_until
          && Some(candidate) != current_reg
          && reg.map_or(true, |best| pos > self.use_pos[best.get_index()])
        {
          reg = Some(candidate);
        }
      }
      let reg_use_pos = reg.map_or(0, |reg| self.use_pos[reg.get_index()]);

      if reg_use_pos <= first_should_usage {
        let interval = &self.ls.intervals[id];
        if first_usage <= interval.from() + 1 {
          if prio == RegisterPriority::LiveAtLoopEnd {
            // Retry, this time evicting values only live at loop ends.
            continue;
          }
          return Err(RegAllocError::OutOfRegisters {
            operand: interval.reg,
            class: interval.class,
            position: first_usage,
          });
        }
        // Every other value is used sooner: spill the current one.
        trace!("  {:?} is spilled itself", id);
        let reg_info = reg.map(|reg| (reg, reg_use_pos));
        return self.split_and_spill_interval(id, reg_info);
      }
      chosen = reg;
      break;
    }

    let reg = match chosen {
      Some(reg) => reg,
      None => {
        return Err(RegAllocError::Other(format!(
          "no register to evict for {:?}",
          self.ls.intervals[id].reg
        )))
      }
    };
    trace!("  {:?} takes {:?} by eviction", id, reg);
    self.assign_register_until_blocked(id, reg)
  }

  /// A move out of an interval into the current one, and back out of the
  /// current one into the same interval later: the two can share a spill
  /// slot, and neither needs a store.
  fn combine_spilled_intervals(&mut self, id: IntId) {
    let intervals = &self.ls.intervals;
    let interval = &intervals[id];
    if !interval.is_split_parent() {
      return;
    }
    let hint = match intervals.location_hint(id, false) {
      Some(hint) if intervals[hint].is_split_parent() => hint,
      _ => return,
    };
    if interval.spill_state != SpillState::NoOptimization
      || intervals[hint].spill_state != SpillState::NoOptimization
    {
      return;
    }

    let (begin_pos, end_pos) = (interval.from(), interval.to());
    let max_op_id = self.ls.lir.max_op_id();
    if end_pos > max_op_id || begin_pos & 1 == 1 || end_pos & 1 == 1 {
      return;
    }
    if !self.is_move_between(begin_pos, hint, id)
      || !self.is_move_between(end_pos, id, hint)
    {
      return;
    }

    let begin_hint =
      intervals.split_child_at_op_id(hint, begin_pos, OperandMode::Use);
    let end_hint =
      intervals.split_child_at_op_id(hint, end_pos, OperandMode::Def);
    let (begin_hint, end_hint) = match (begin_hint, end_hint) {
      (Some(begin_hint), Some(end_hint)) => (begin_hint, end_hint),
      _ => return,
    };
    if begin_hint == end_hint
      || intervals[begin_hint].to() != begin_pos
      || intervals[end_hint].from() != end_pos
    {
      return;
    }
    if intervals[begin_hint].location.reg().is_some()
      || interval.spill_slot.is_some()
    {
      return;
    }
    let slot = match intervals.spill_slot(hint) {
      Some(slot) => slot,
      None => return,
    };

    trace!("  {:?} shares spill slot {:?} with {:?}", id, slot, hint);
    self.ls.intervals.set_spill_slot(id, slot);
    self.ls.intervals[id].remove_first_use_pos();
    self.ls.intervals[end_hint].remove_first_use_pos();
  }

  /// Is the instruction at `op_id` a move from the value of `from` into the
  /// value of `to`?
  fn is_move_between(&self, op_id: u32, from: IntId, to: IntId) -> bool {
    let iix = match self.ls.lir.insn_for_id(op_id) {
      Some(iix) => iix,
      None => return false,
    };
    match self.ls.func.is_move(self.ls.func.get_insn(iix)) {
      Some((dst, src)) => {
        src.is_virtual()
          && dst.is_virtual()
          && src == self.ls.intervals[from].reg
          && dst == self.ls.intervals[to].reg
      }
      None => false,
    }
  }

  /// Returns whether the current interval ends up in a register and joins
  /// the active list.
  fn activate_current(&mut self, id: IntId) -> Result<bool, RegAllocError> {
    trace!(
      "activating {:?} ({:?}) at {}: {:?}",
      id,
      self.ls.intervals[id].reg,
      self.current_position,
      self.ls.intervals[id].ranges
    );

    let mut result = true;
    match self.ls.intervals[id].location {
      Location::Stack(_) | Location::Constant => {
        trace!("  {:?} starts in memory", id);
        self.split_stack_interval(id)?;
        result = false;
      }
      Location::None => {
        self.combine_spilled_intervals(id);
        self.init_vars_for_alloc(id);
        if self.no_allocation_possible(id) || !self.alloc_free_register(id)? {
          self.alloc_locked_register(id)?;
        }
        if self.ls.intervals[id].location.reg().is_none() {
          result = false;
        }
      }
      Location::Reg(_) => {}
    }

    if self.ls.intervals[id].insert_move_when_activated {
      let from = self.ls.intervals[id].from();
      let source = self.ls.intervals.current_split_child(id);
      self.insert_move(from, source, id)?;
    }
    self.ls.intervals.make_current_split_child(id);
    Ok(result)
  }

  /// Queues a move from `from` to `to` in front of the operation at or
  /// after `op_id`.
  fn insert_move(
    &mut self, op_id: u32, from: IntId, to: IntId,
  ) -> Result<(), RegAllocError> {
    let op_id = (op_id + 1) & !1;
    let lir = &self.ls.lir;
    let index = if op_id == 0 || lir.is_block_begin(op_id) {
      None
    } else {
      lir.index_in_block(self.ls.func, op_id)
    };
    let (block, index) = index.ok_or_else(|| {
      RegAllocError::Other(format!("no move can be inserted at {}", op_id))
    })?;
    trace!("  move {:?} -> {:?} before {}", from, to, op_id);
    let point = InsertPoint { block, index, rank: InsertRank::Walker };
    self.move_resolver.move_insert_point(self.ls, point)?;
    self.move_resolver.add_mapping(self.ls, from, to);
    Ok(())
  }
  //
  // === END allocation ===

  // === BEGIN optimizing walker ===
  //
  fn optimize_block(&mut self, block: BlockIx) -> Result<(), RegAllocError> {
    if self.ls.cfg.pred_map[block].len() != 1 {
      return Ok(());
    }
    let block_begin = self.ls.lir.block_first_id[block];
    self.walk_to(block_begin)?;

    let mut changed = true;
    while changed {
      changed = false;
      'bindings: for &binding in
        [RegisterBinding::Any, RegisterBinding::Stack].iter()
      {
        for i in 0..self.active.get(binding).len() {
          let id = self.active.get(binding)[i];
          if self.optimize(block_begin, block, id, binding)? {
            changed = true;
            break 'bindings;
          }
        }
      }
    }
    Ok(())
  }

  fn optimize(
    &mut self, current_pos: u32, block: BlockIx, id: IntId,
    binding: RegisterBinding,
  ) -> Result<bool, RegAllocError> {
    let intervals = &self.ls.intervals;
    let interval = &intervals[id];
    if interval.is_split_parent() || interval.from() == current_pos {
      return Ok(false);
    }
    let pred = self.ls.cfg.pred_map[block][0];
    let pred_end = self.ls.lir.block_last_id[pred];
    let pred_interval = match intervals.interval_covering_op_id(id, pred_end) {
      Some(pred_interval) => pred_interval,
      None => return Ok(false),
    };
    let current_location = interval.location;
    let pred_location = intervals[pred_interval].location;
    if current_location == pred_location {
      return Ok(false);
    }
    match pred_location {
      Location::Reg(_) | Location::Stack(_) => {}
      _ => return Ok(false),
    }

    trace!(
      "  {:?} arrives in {:?} at {:?}, predecessor has {:?}",
      id,
      current_location,
      block,
      pred_location
    );
    let split_part = self.split_interval(id, current_pos)?;
    self.active.remove(binding, id);
    self.ls.intervals[id].state = IntervalState::Handled;
    self.ls.intervals.make_current_split_child(split_part);

    match pred_location {
      Location::Reg(reg) => self.split_register_interval(split_part, reg)?,
      _ => {
        let part = &mut self.ls.intervals[split_part];
        part.location = pred_location;
        part.state = IntervalState::Active;
        self.active.stack.push(split_part);
        self.split_stack_interval(split_part)?;
      }
    }
    Ok(true)
  }

  /// Tries to give `id` the register `reg` its predecessor held; falls back
  /// to the normal allocation if a fixed interval has it.
  fn split_register_interval(
    &mut self, id: IntId, reg: RealReg,
  ) -> Result<(), RegAllocError> {
    self.init_vars_for_alloc(id);
    self.collect_spill_state(id, RegisterPriority::LiveAtLoopEnd);

    let ix = reg.get_index();
    if self.use_pos[ix] == 0
      || self.block_pos[ix] <= self.ls.intervals[id].from()
    {
      self.insert_unhandled(RegisterBinding::Any, id);
      return Ok(());
    }
    self.assign_register_until_blocked(id, reg)?;
    self.ls.intervals[id].state = IntervalState::Active;
    self.active.any.push(id);
    Ok(())
  }
  //
  // === END optimizing walker ===
}

//=============================================================================
// Entry point

/// Assigns a location to every interval, splitting and spilling as needed,
/// and records the moves that connect split children within blocks.
#[inline(never)]
pub(crate) fn walk_intervals<F: Function>(
  ls: &mut LinearScan<F>,
) -> Result<(), RegAllocError> {
  let optimizing = ls.options.optimizing_walker;
  let num_intervals = ls.intervals.len();
  let mut walker = Walker::new(ls, optimizing);
  walker.walk()?;
  debug!(
    "walk ({}optimizing): {} intervals before, {} after, {} splits",
    if optimizing { "" } else { "non-" },
    num_intervals,
    walker.ls.intervals.len(),
    walker.ls.stats.num_splits
  );
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::inst_stream::EditKind;
  use crate::interface::AllocatorOptions;
  use crate::test_utils::{make_universe, rreg, FuncBuilder, TestFunc};

  fn options(optimizing_walker: bool) -> AllocatorOptions {
    AllocatorOptions { optimizing_walker, ..AllocatorOptions::default() }
  }

  struct WalkSummary {
    locations: Vec<(IntId, Location)>,
    num_edits: usize,
    num_splits: usize,
    num_slots: usize,
  }

  fn walk(
    func: &TestFunc, num_regs: usize, optimizing: bool,
  ) -> Result<WalkSummary, RegAllocError> {
    let universe = make_universe(num_regs);
    let options = options(optimizing);
    let mut ls = LinearScan::new(func, &universe, &options)?;
    walk_intervals(&mut ls)?;
    let locations = ls
      .intervals
      .ids()
      .filter(|&id| !ls.intervals[id].is_empty())
      .map(|id| (id, ls.intervals[id].location))
      .collect();
    Ok(WalkSummary {
      locations,
      num_edits: ls.edits.len(),
      num_splits: ls.stats.num_splits,
      num_slots: ls.frame.num_allocated(),
    })
  }

  /// Three values live at once, used in reverse order of definition.
  fn pressure_func() -> TestFunc {
    let mut b = FuncBuilder::new();
    let (v0, v1, v2) = (b.vreg(), b.vreg(), b.vreg());
    let b0 = b.block();
    b.switch_to(b0);
    b.op(v0, &[]);
    b.op(v1, &[]);
    b.op(v2, &[]);
    b.use_reg(v2);
    b.use_reg(v1);
    b.use_reg(v0);
    b.ret(None);
    b.finish()
  }

  #[test]
  fn no_pressure_no_splits() {
    let _ = pretty_env_logger::try_init();
    let func = pressure_func();
    for &optimizing in [false, true].iter() {
      let summary = walk(&func, 3, optimizing).unwrap();
      assert_eq!(summary.num_splits, 0);
      assert_eq!(summary.num_edits, 0);
      assert_eq!(summary.num_slots, 0);
      // r0, r1, r2, sp, then the values.
      for (_, location) in summary.locations.iter().filter(|s| s.0.get() >= 4) {
        assert!(location.reg().is_some());
      }
    }
  }

  #[test]
  fn spill_under_pressure() {
    let _ = pretty_env_logger::try_init();
    let func = pressure_func();
    let universe = make_universe(2);
    let options = options(false);
    let mut ls = LinearScan::new(&func, &universe, &options).unwrap();
    walk_intervals(&mut ls).unwrap();

    // Operands: r0, r1, sp, then v0 at index 3.
    let v0 = IntId::new(3);
    let children = ls.intervals[v0].split_children.clone();
    assert_eq!(children.len(), 3);
    assert!(ls.intervals[v0].location.reg().is_some());
    let on_stack: Vec<_> = children
      .iter()
      .filter(|&&c| ls.intervals[c].location.spill().is_some())
      .collect();
    assert_eq!(on_stack.len(), 1);
    let spilled = &ls.intervals[*on_stack[0]];
    assert_eq!((spilled.from(), spilled.to()), (5, 11));
    let reloaded = children
      .iter()
      .find(|&&c| ls.intervals[c].from() == 11)
      .unwrap();
    assert!(ls.intervals[*reloaded].location.reg().is_some());

    assert_eq!(ls.stats.num_splits, 2);
    assert_eq!(ls.edits.len(), 2);
    assert_eq!(ls.frame.num_allocated(), 1);
  }

  #[test]
  fn out_of_registers() {
    let mut b = FuncBuilder::new();
    let (v0, v1, v2) = (b.vreg(), b.vreg(), b.vreg());
    let b0 = b.block();
    b.switch_to(b0);
    b.op(v0, &[]);
    b.op(v1, &[]);
    b.op(v2, &[v0, v1]);
    b.ret(Some(v2));
    let func = b.finish();
    match walk(&func, 1, false) {
      Err(RegAllocError::OutOfRegisters { .. }) => {}
      Err(err) => panic!("unexpected error: {}", err),
      Ok(_) => panic!("one register cannot hold two operands"),
    }
  }

  #[test]
  fn move_hint_is_followed() {
    let mut b = FuncBuilder::new();
    let (va, vb, v0, v1) = (b.vreg(), b.vreg(), b.vreg(), b.vreg());
    let b0 = b.block();
    b.switch_to(b0);
    b.op(va, &[]);
    b.op(vb, &[]);
    b.op(v0, &[]);
    b.use_reg(vb);
    b.mov(v1, v0);
    b.use_reg(va);
    b.use_reg(v1);
    b.ret(None);
    let func = b.finish();

    let universe = make_universe(3);
    let options = options(false);
    let mut ls = LinearScan::new(&func, &universe, &options).unwrap();
    walk_intervals(&mut ls).unwrap();
    // r0, r1, r2, sp, va, vb, v0, v1.
    assert_eq!(ls.intervals[IntId::new(6)].location, Location::Reg(rreg(2)));
    assert_eq!(ls.intervals[IntId::new(7)].location, Location::Reg(rreg(2)));
  }

  #[test]
  fn split_moves_out_of_loops() {
    let func = FuncBuilder::simple_loop();
    let universe = make_universe(2);
    let options = options(false);
    let mut ls = LinearScan::new(&func, &universe, &options).unwrap();
    let (b0, b1, b3) = (BlockIx::new(0), BlockIx::new(1), BlockIx::new(3));
    let max = ls.lir.block_last_id[b3];
    let expected = ls.lir.block_first_id[b1];
    let walker = Walker::new(&mut ls, false);
    assert_eq!(walker.find_optimal_split_pos_between(b0, b3, max), expected);
  }

  #[test]
  fn loop_values_are_evicted_at_loop_boundaries() {
    let _ = pretty_env_logger::try_init();
    let mut b = FuncBuilder::new();
    let (v0, v1, v2) = (b.vreg(), b.vreg(), b.vreg());
    let (b0, header, latch, exit) =
      (b.block(), b.block(), b.block(), b.block());
    b.switch_to(b0);
    b.op(v0, &[]);
    b.use_reg(v0);
    b.jump(header);
    b.switch_to(header);
    b.op(v1, &[]);
    b.op(v2, &[]);
    b.use_reg(v1);
    b.branch(v2, latch, exit);
    b.switch_to(latch);
    b.jump(header);
    b.switch_to(exit);
    b.use_reg(v0);
    b.ret(None);
    let func = b.finish();

    for &optimizing in [false, true].iter() {
      let universe = make_universe(2);
      let options = options(optimizing);
      let mut ls = LinearScan::new(&func, &universe, &options).unwrap();
      walk_intervals(&mut ls).unwrap();

      // r0, r1, sp, then v0.
      let parent = IntId::new(3);
      let outer_depth = ls.cfg.depth_map[b0];
      assert!(ls.cfg.depth_map[header] > outer_depth);

      // The loop runs with v0 on the stack.
      let in_loop = ls
        .intervals
        .split_child_at_op_id(
          parent,
          ls.lir.block_last_id[header],
          OperandMode::Def,
        )
        .unwrap();
      assert!(ls.intervals[in_loop].location.spill().is_some());

      // Every child starting inside the loop starts where an outer block
      // ends.
      let lir = &ls.lir;
      for &child in ls.intervals[parent].split_children.iter() {
        let from = ls.intervals[child].from();
        let block = lir.block_for_id(from);
        if child == parent || ls.cfg.depth_map[block] <= outer_depth {
          continue;
        }
        assert!(lir.is_block_begin(from), "{:?} starts at {}", child, from);
        let linear_pos = ls.order.linear_pos[block];
        assert!(linear_pos > 0);
        let prev = ls.block_at(linear_pos - 1);
        assert!(ls.cfg.depth_map[prev] <= outer_depth);
      }

      // No move of v0 inside the loop body.
      for edit in ls.edits.iter() {
        if let EditKind::Move { to, .. } = edit.kind {
          if ls.intervals.parent(to) == parent {
            assert!(ls.cfg.depth_map[edit.point.block] <= outer_depth);
          }
        }
      }
    }
  }

  #[test]
  fn incoming_stack_argument() {
    let mut b = FuncBuilder::new();
    let v0 = b.vreg();
    let b0 = b.block();
    b.switch_to(b0);
    b.load_arg(v0, 0);
    b.use_reg(v0);
    b.ret(None);
    let func = b.finish();

    for &optimizing in [false, true].iter() {
      let universe = make_universe(1);
      let options = options(optimizing);
      let mut ls = LinearScan::new(&func, &universe, &options).unwrap();
      walk_intervals(&mut ls).unwrap();
      // r0, sp, v0.
      let v0 = IntId::new(2);
      assert!(ls.intervals[v0].location.spill().is_some());
      let children = &ls.intervals[v0].split_children;
      assert_eq!(children.len(), 2);
      assert!(ls.intervals[children[1]].location.reg().is_some());
      assert_eq!(ls.edits.len(), 1);
      assert_eq!(ls.frame.num_allocated(), 0);
    }
  }

  #[test]
  fn loop_values_get_locations() {
    let _ = pretty_env_logger::try_init();
    let func = FuncBuilder::simple_loop();
    for &optimizing in [false, true].iter() {
      let summary = walk(&func, 2, optimizing).unwrap();
      for (id, location) in summary.locations.iter().filter(|s| s.0.get() >= 3)
      {
        assert!(!location.is_none(), "{:?} has no location", id);
      }
    }
  }
}
