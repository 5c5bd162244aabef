/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Construction of the lifetime intervals.
//!
//! Blocks are visited in reverse allocation order and instructions in
//! reverse order within each block, so that every range is created by its
//! last use and shortened by its definition.

use log::{debug, trace};

use crate::analysis::CFGInfo;
use crate::data_structures::{BlockIx, IntId, Location, RealRegUniverse, Reg};
use crate::interface::{Function, OperandFlags, OperandRole};
use crate::intervals::{Intervals, RegisterPriority, SpillState};
use crate::lir::Lir;
use crate::liveness::Liveness;

/// The intervals of a function, plus the constants that materializable
/// intervals can be recomputed from.
pub(crate) struct BuiltIntervals<C> {
  pub(crate) intervals: Intervals,
  pub(crate) constants: Vec<C>,
}

struct Builder<'a, C> {
  lir: &'a Lir,
  universe: &'a RealRegUniverse,
  intervals: Intervals,
  constants: Vec<C>,
}

impl<'a, C> Builder<'a, C> {
  /// Non-allocatable real registers get no interval.
  fn interval_of(&self, reg: Reg) -> Option<IntId> {
    if let Reg::Real(rreg) = reg {
      if !self.universe.is_allocable(rreg) {
        return None;
      }
    }
    Some(IntId::new(self.lir.operand_index(reg) as u32))
  }

  fn add_use(&mut self, reg: Reg, from: u32, to: u32, prio: RegisterPriority) {
    let id = match self.interval_of(reg) {
      Some(id) => id,
      None => return,
    };
    let interval = &mut self.intervals[id];
    interval.add_range(from, to);
    // Uses are recorded at the even instruction id.
    interval.add_use_pos(to & !1, prio);
    trace!("add use: {:?} from {} to {} ({:?})", id, from, to, prio);
  }

  fn add_temp(&mut self, reg: Reg, temp_pos: u32, prio: RegisterPriority) {
    let id = match self.interval_of(reg) {
      Some(id) => id,
      None => return,
    };
    let interval = &mut self.intervals[id];
    interval.add_range(temp_pos, temp_pos + 1);
    interval.add_use_pos(temp_pos, prio);
    interval.add_materialization_value(None);
    trace!("add temp: {:?} at {} ({:?})", id, temp_pos, prio);
  }

  fn add_def(
    &mut self, reg: Reg, def_pos: u32, prio: RegisterPriority,
    constant: Option<C>,
  ) {
    let id = match self.interval_of(reg) {
      Some(id) => id,
      None => return,
    };

    let interval = &mut self.intervals[id];
    if !interval.is_empty() && interval.from() <= def_pos {
      // The range was opened at the block start by a use; the definition
      // is its real start.
      interval.set_from(def_pos);
      interval.add_use_pos(def_pos, prio);
    } else {
      // Dead value: give it a vacuous range.
      interval.add_range(def_pos, def_pos + 1);
      interval.add_use_pos(def_pos, prio);
      trace!("def of {:?} at {} occurs without use", reg, def_pos);
    }

    if !interval.is_fixed() {
      self.change_spill_definition_pos(id, def_pos);
      let interval = &mut self.intervals[id];
      if prio == RegisterPriority::None
        && interval.spill_state <= SpillState::StartInMemory
      {
        interval.spill_state = SpillState::StartInMemory;
      }
    }

    // A constant definition is only worth rematerializing if no use would
    // accept a stack slot instead.
    let interval = &mut self.intervals[id];
    let accepts_stack = interval
      .uses
      .iter()
      .any(|u| u.prio == RegisterPriority::ShouldHaveRegister);
    let materialized = match constant {
      Some(constant) if !accepts_stack => {
        self.constants.push(constant);
        Some(self.constants.len() as u32 - 1)
      }
      _ => None,
    };
    self.intervals[id].add_materialization_value(materialized);
    trace!("add def: {:?} at {} ({:?})", id, def_pos, prio);
  }

  /// Tracks the definitions of a value, seen in reverse order.
  fn change_spill_definition_pos(&mut self, id: IntId, def_pos: u32) {
    let interval = &mut self.intervals[id];
    debug_assert!(interval.is_split_parent());
    match interval.spill_state {
      SpillState::NoDefinitionFound => {
        interval.spill_definition_pos = Some(def_pos);
        interval.spill_state = SpillState::NoSpillStore;
      }
      SpillState::NoSpillStore | SpillState::StartInMemory => {
        let known = interval.spill_definition_pos.unwrap_or(def_pos);
        // Two consecutive definitions are one two-operand instruction.
        if def_pos + 2 < known {
          // A second definition: no spill optimization for this value.
          interval.spill_state = SpillState::NoOptimization;
        }
      }
      SpillState::NoOptimization => {}
      state => debug_assert!(false, "spill state {:?} while building", state),
    }
  }

  /// Hints always point from the definition to the value it copies.
  fn add_hint(&mut self, def: Reg, src: Reg) {
    let (def_id, src_id) = match (self.interval_of(def), self.interval_of(src))
    {
      (Some(d), Some(s)) => (d, s),
      _ => return,
    };
    if def_id != src_id && !self.intervals[def_id].is_fixed() {
      self.intervals[def_id].location_hint = Some(src_id);
      trace!("hint {:?} -> {:?}", def_id, src_id);
    }
  }
}

#[inline(never)]
pub(crate) fn build_intervals<F: Function>(
  func: &F, cfg: &CFGInfo, lir: &Lir, liveness: &Liveness,
  universe: &RealRegUniverse, alloc_order: &[BlockIx],
) -> BuiltIntervals<F::Const> {
  let mut b = Builder {
    lir,
    universe,
    intervals: Intervals::new(&lir.operand_regs),
    constants: Vec::new(),
  };

  let caller_saved = universe
    .caller_saved
    .iter()
    .map(|&ix| universe.regs[ix].0)
    .filter(|&rreg| universe.is_allocable(rreg))
    .collect::<Vec<_>>();

  for &block in alloc_order.iter().rev() {
    let block_from = lir.block_first_id[block];
    let block_to = lir.block_last_id[block];

    // === BEGIN values live at the end of the block ===
    //
    let loop_end_loop = if cfg.is_loop_end[block] {
      cfg.innermost_loop[block]
    } else {
      None
    };
    for operand in liveness.blocks[block].live_out.iter() {
      let reg = match lir.operand_regs[operand] {
        Some(reg) => reg,
        None => continue,
      };
      b.add_use(reg, block_from, block_to + 2, RegisterPriority::None);

      // Values used in the loop want their register back at its end.
      if let Some(loop_ix) = loop_end_loop {
        if liveness.is_interval_in_loop(operand, loop_ix) {
          b.intervals[IntId::new(operand as u32)]
            .add_use_pos(block_to + 1, RegisterPriority::LiveAtLoopEnd);
        }
      }
    }
    //
    // === END values live at the end of the block ===

    for iix in func.block_insns(block).into_iter().rev() {
      let insn = func.get_insn(iix);
      let op_id = lir.insn_id[iix];
      let operands = &lir.operands[iix];

      if lir.has_call(op_id) {
        for &rreg in caller_saved.iter() {
          b.add_temp(rreg.to_reg(), op_id, RegisterPriority::None);
        }
        trace!("{:?} destroys all caller-saved registers", iix);
      }

      let stack_arg = func.incoming_stack_arg(insn);
      let move_regs = func.is_move(insn);

      // === BEGIN outputs ===
      //
      let output_prio = if stack_arg.is_some() {
        RegisterPriority::None
      } else {
        RegisterPriority::MustHaveRegister
      };
      let hint_src = match move_regs {
        Some((_, src)) => Some(src),
        None => operands
          .iter()
          .find(|op| {
            op.role == OperandRole::Input
              && op.flags.contains(OperandFlags::HINT)
          })
          .map(|op| op.reg),
      };
      for op in operands.iter().filter(|op| op.role == OperandRole::Output) {
        let constant = func.constant_def(insn);
        b.add_def(op.reg, op_id, output_prio, constant);
        let hinted =
          move_regs.is_some() || op.flags.contains(OperandFlags::HINT);
        if let (true, Some(src)) = (hinted, hint_src) {
          b.add_hint(op.reg, src);
        }
      }
      //
      // === END outputs ===

      for op in operands.iter() {
        match op.role {
          OperandRole::Temp => {
            b.add_temp(op.reg, op_id, RegisterPriority::MustHaveRegister);
          }
          OperandRole::Alive => {
            let prio = input_priority(op.flags);
            b.add_use(op.reg, block_from, op_id + 1, prio);
          }
          _ => {}
        }
      }
      for op in operands.iter().filter(|op| op.role == OperandRole::Input) {
        let prio = input_priority(op.flags);
        b.add_use(op.reg, block_from, op_id, prio);
      }
      // Deoptimization state only needs the value to be somewhere.
      for op in operands.iter().filter(|op| op.role == OperandRole::State) {
        b.add_use(op.reg, block_from, op_id + 1, RegisterPriority::None);
      }

      // An incoming stack argument starts out in its caller's slot.
      if let Some(slot) = stack_arg {
        for op in operands.iter().filter(|op| op.role == OperandRole::Output) {
          if op.reg.is_virtual() {
            let id = IntId::new(lir.operand_index(op.reg) as u32);
            let interval = &mut b.intervals[id];
            if interval.spill_slot.is_none() {
              interval.spill_slot = Some(slot);
              interval.location = Location::Stack(slot);
              trace!("{:?} starts in incoming stack slot {:?}", id, slot);
            }
          }
        }
      }
    }
  }

  // Fixed intervals start with a dummy range so the walker never sees them
  // as unhandled.
  for id in b.intervals.ids().take(lir.num_real) {
    if !b.intervals[id].is_empty() {
      b.intervals[id].add_range(0, 1);
    }
  }

  debug!(
    "built {} intervals, {} materializable constants",
    b.intervals.ids().filter(|&id| !b.intervals[id].is_empty()).count(),
    b.constants.len()
  );

  BuiltIntervals { intervals: b.intervals, constants: b.constants }
}

fn input_priority(flags: OperandFlags) -> RegisterPriority {
  if flags.contains(OperandFlags::STACK) {
    RegisterPriority::ShouldHaveRegister
  } else {
    RegisterPriority::MustHaveRegister
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block_order::compute_block_order;
  use crate::data_structures::SpillSlot;
  use crate::intervals::{OperandMode, Range};
  use crate::liveness::compute_liveness;
  use crate::test_utils::{
    make_universe, make_universe_with_caller_saved, FuncBuilder, TestFunc,
  };

  fn build(
    func: &TestFunc, universe: &RealRegUniverse,
  ) -> (Lir, BuiltIntervals<u32>) {
    let cfg = CFGInfo::create(func).unwrap();
    let order = compute_block_order(func, &cfg, false);
    let lir = Lir::create(func, universe, &order.alloc_order).unwrap();
    let liveness =
      compute_liveness(func, &cfg, &lir, &order.alloc_order, 50).unwrap();
    let alloc_order = &order.alloc_order;
    let built =
      build_intervals(func, &cfg, &lir, &liveness, universe, alloc_order);
    (lir, built)
  }

  fn int_of(lir: &Lir, reg: Reg) -> IntId {
    IntId::new(lir.operand_index(reg) as u32)
  }

  #[test]
  fn straight_line_ranges() {
    // label 0, v0 = 1 @2, v1 = op(v0) @4, use v0 @6, ret v1 @8
    let mut b = FuncBuilder::new();
    let (v0, v1) = (b.vreg(), b.vreg());
    let b0 = b.block();
    b.switch_to(b0);
    b.def_const(v0, 1);
    b.op(v1, &[v0]);
    b.use_reg(v0);
    b.ret(Some(v1));
    let func = b.finish();
    let (lir, built) = build(&func, &make_universe(2));
    let ints = &built.intervals;

    let i0 = &ints[int_of(&lir, v0)];
    assert_eq!(i0.ranges, vec![Range { from: 2, to: 6 }]);
    assert_eq!(i0.first_usage(RegisterPriority::MustHaveRegister), 2);
    assert_eq!(i0.spill_state, SpillState::NoSpillStore);
    assert_eq!(i0.spill_definition_pos, Some(2));
    // Used through a register only: rematerializable.
    assert_eq!(i0.materialized, Some(0));
    assert_eq!(built.constants, vec![1]);

    let i1 = &ints[int_of(&lir, v1)];
    assert_eq!(i1.ranges, vec![Range { from: 4, to: 8 }]);
    assert_eq!(i1.location_hint, Some(int_of(&lir, v0)));
    assert!(!i1.can_materialize());
  }

  #[test]
  fn loop_values_span_the_loop() {
    let func = FuncBuilder::simple_loop();
    let (lir, built) = build(&func, &make_universe(2));
    let acc = &built.intervals[IntId::new(lir.num_real as u32)];
    // Defined twice: no spill optimization.
    assert_eq!(acc.spill_state, SpillState::NoOptimization);
    assert!(!acc.can_materialize());
    // Live from its first definition to the return.
    let exit_ret = lir.block_last_id[BlockIx::new(4)];
    assert!(acc.covers(exit_ret, OperandMode::Use));
    assert!(!acc.has_hole_between(acc.from(), exit_ret));
    // The latch records a loop-end use.
    let latch_last = lir.block_last_id[BlockIx::new(3)];
    assert_eq!(
      acc.next_usage_exact(RegisterPriority::LiveAtLoopEnd, 0),
      latch_last + 1
    );
  }

  #[test]
  fn calls_clobber_caller_saved_registers() {
    let mut b = FuncBuilder::new();
    let (v0, v1) = (b.vreg(), b.vreg());
    let b0 = b.block();
    b.switch_to(b0);
    b.def_const(v0, 1);
    b.call(Some(v1), &[v0]);
    b.ret(Some(v1));
    let func = b.finish();
    let universe = make_universe_with_caller_saved(3, &[0, 2]);
    let (lir, built) = build(&func, &universe);
    let ints = &built.intervals;
    let call_id = 4;
    for &(ix, clobbered) in &[(0, true), (1, false), (2, true)] {
      let fixed = &ints[IntId::new(ix)];
      assert_eq!(fixed.covers(call_id, OperandMode::Def), clobbered);
      if clobbered {
        assert_eq!(fixed.ranges[0], Range { from: 0, to: 1 });
      }
    }
    // The non-allocatable register gets nothing.
    assert!(ints[IntId::new(3)].is_empty());
    // Stack-accepting call argument: v0 is not rematerialized.
    let i0 = &ints[int_of(&lir, v0)];
    assert!(!i0.can_materialize());
    assert_eq!(i0.first_usage(RegisterPriority::ShouldHaveRegister), 2);
  }

  #[test]
  fn incoming_stack_argument_starts_in_memory() {
    let mut b = FuncBuilder::new();
    let v0 = b.vreg();
    let b0 = b.block();
    b.switch_to(b0);
    b.load_arg(v0, 1);
    b.ret(Some(v0));
    let func = b.finish();
    let (lir, built) = build(&func, &make_universe(2));
    let i0 = &built.intervals[int_of(&lir, v0)];
    assert_eq!(i0.spill_state, SpillState::StartInMemory);
    assert_eq!(i0.spill_slot, Some(SpillSlot::new(1)));
    assert_eq!(i0.location, Location::Stack(SpillSlot::new(1)));
    // Only the return needs a register.
    assert_eq!(i0.first_usage(RegisterPriority::MustHaveRegister), 4);
    assert_eq!(i0.uses.len(), 1);
  }

  #[test]
  fn dead_definition_gets_a_vacuous_range() {
    let mut b = FuncBuilder::new();
    let v0 = b.vreg();
    let b0 = b.block();
    b.switch_to(b0);
    b.def_const(v0, 7);
    b.ret(None);
    let func = b.finish();
    let (lir, built) = build(&func, &make_universe(2));
    let i0 = &built.intervals[int_of(&lir, v0)];
    assert_eq!(i0.ranges, vec![Range { from: 2, to: 3 }]);
  }

  #[test]
  fn state_uses_need_no_register() {
    let mut b = FuncBuilder::new();
    let v0 = b.vreg();
    let b0 = b.block();
    b.switch_to(b0);
    b.def_const(v0, 7);
    b.safepoint(&[v0]);
    b.ret(None);
    let func = b.finish();
    let (lir, built) = build(&func, &make_universe(2));
    let i0 = &built.intervals[int_of(&lir, v0)];
    assert_eq!(i0.ranges, vec![Range { from: 2, to: 5 }]);
    assert_eq!(
      i0.next_usage(RegisterPriority::ShouldHaveRegister, 3),
      crate::intervals::END_POS
    );
  }
}
