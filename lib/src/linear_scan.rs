/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Implementation of the linear scan allocator algorithm.
//!
//! This tries to follow the implementation as suggested by:
//!   Optimized Interval Splitting in a Linear Scan Register Allocator,
//!     by Wimmer et al., 2005
//! and its SSA-based successor:
//!   Linear Scan Register Allocation on SSA Form,
//!     by Wimmer and Franz, 2010
//!
//! This module holds the state shared by all phases and drives them; each
//! phase lives in its own module.

use log::{debug, info, trace};

use crate::analysis::CFGInfo;
use crate::block_order::{compute_block_order, BlockOrder};
use crate::checker::{self, VerifierErrors};
use crate::data_structures::{
  BlockIx, IntId, Location, RealRegUniverse, RegClass, SpillSlot,
};
use crate::data_flow::resolve_data_flow;
use crate::inst_stream::{
  build_block_streams, eliminate_spill_moves, emit_code, Edit, EditKind,
  InsertPoint,
};
use crate::interface::{
  AllocStats, AllocatorOptions, Function, RegAllocError, RegAllocResult,
};
use crate::interval_builder::{build_intervals, BuiltIntervals};
use crate::intervals::{Intervals, OperandMode};
use crate::lir::Lir;
use crate::liveness::{compute_liveness, Liveness};
use crate::spill_position::optimize_spill_positions;
use crate::walker::walk_intervals;

//=============================================================================
// Stack frame

/// Hands out spill slots after the slots of the incoming stack arguments.
pub(crate) struct FrameMap {
  next_slot: SpillSlot,
  num_allocated: usize,
}

impl FrameMap {
  pub(crate) fn new(num_incoming_slots: u32) -> Self {
    Self { next_slot: SpillSlot::new(num_incoming_slots), num_allocated: 0 }
  }

  /// Slots are aligned on their size.
  pub(crate) fn allocate_spill_slot<F: Function>(
    &mut self, func: &F, class: RegClass,
  ) -> SpillSlot {
    let size = func.get_spillslot_size(class);
    let slot = self.next_slot.round_up(size);
    self.next_slot = slot.inc(size);
    self.num_allocated += 1;
    slot
  }

  /// Total frame size in slots, counting incoming arguments.
  pub(crate) fn num_slots(&self) -> u32 {
    self.next_slot.get()
  }

  pub(crate) fn num_allocated(&self) -> usize {
    self.num_allocated
  }
}

//=============================================================================
// Allocation state

pub(crate) struct LinearScan<'a, F: Function> {
  pub(crate) func: &'a F,
  pub(crate) universe: &'a RealRegUniverse,
  pub(crate) options: &'a AllocatorOptions,
  pub(crate) cfg: CFGInfo,
  pub(crate) order: BlockOrder,
  pub(crate) lir: Lir,
  pub(crate) liveness: Liveness,
  pub(crate) intervals: Intervals,
  /// Values that materializable intervals are recomputed from.
  pub(crate) constants: Vec<F::Const>,
  pub(crate) frame: FrameMap,
  /// Moves and stores to insert, in creation order.
  pub(crate) edits: Vec<Edit>,
  pub(crate) stats: AllocStats,
}

impl<'a, F: Function> LinearScan<'a, F> {
  /// Runs the analyses and builds the intervals; everything up to the walk.
  pub(crate) fn new(
    func: &'a F, universe: &'a RealRegUniverse, options: &'a AllocatorOptions,
  ) -> Result<Self, RegAllocError> {
    let cfg = CFGInfo::create(func)?;
    let order = compute_block_order(func, &cfg, options.reorder_loops);
    let lir = Lir::create(func, universe, &order.alloc_order)?;
    let liveness = compute_liveness(
      func,
      &cfg,
      &lir,
      &order.alloc_order,
      options.max_liveness_iterations,
    )?;
    let BuiltIntervals { intervals, constants } = build_intervals(
      func,
      &cfg,
      &lir,
      &liveness,
      universe,
      &order.alloc_order,
    );

    Ok(LinearScan {
      func,
      universe,
      options,
      cfg,
      order,
      lir,
      liveness,
      intervals,
      constants,
      frame: FrameMap::new(func.num_incoming_stack_slots()),
      edits: Vec::new(),
      stats: AllocStats::default(),
    })
  }

  /// The interval of an operand index.
  pub(crate) fn operand_interval(&self, operand: usize) -> IntId {
    IntId::new(operand as u32)
  }

  pub(crate) fn loop_depth_at(&self, op_id: u32) -> u32 {
    self.cfg.depth_map[self.lir.block_for_id(op_id)]
  }

  pub(crate) fn block_at(&self, linear_pos: u32) -> BlockIx {
    self.order.alloc_order[linear_pos as usize]
  }

  pub(crate) fn push_edit(&mut self, point: InsertPoint, kind: EditKind) {
    trace!("edit at {:?}: {:?}", point, kind);
    let seq = self.edits.len() as u32;
    self.edits.push(Edit { point, seq, kind });
  }

  /// Gives a spilled interval its final non-register location: the
  /// defining constant for materializable values, the canonical spill slot
  /// of its split parent otherwise.
  pub(crate) fn assign_spill_slot(&mut self, id: IntId) {
    if self.intervals[id].can_materialize() {
      self.intervals[id].location = Location::Constant;
      return;
    }
    let slot = match self.intervals.spill_slot(id) {
      Some(slot) => slot,
      None => {
        let class = self.intervals[id].class;
        let slot = self.frame.allocate_spill_slot(self.func, class);
        self.intervals.set_spill_slot(id, slot);
        slot
      }
    };
    self.intervals[id].location = Location::Stack(slot);
  }

  pub(crate) fn split_child_at(
    &self, parent: IntId, op_id: u32, mode: OperandMode,
  ) -> Result<IntId, RegAllocError> {
    self.intervals.split_child_at_op_id(parent, op_id, mode).ok_or_else(|| {
      RegAllocError::Other(format!(
        "no split child of {:?} covers position {}",
        self.intervals[parent].reg, op_id
      ))
    })
  }

  pub(crate) fn interval_at_block_begin(
    &self, block: BlockIx, operand: usize,
  ) -> Result<IntId, RegAllocError> {
    let parent = self.operand_interval(operand);
    let first_id = self.lir.block_first_id[block];
    self.split_child_at(parent, first_id, OperandMode::Def)
  }

  pub(crate) fn interval_at_block_end(
    &self, block: BlockIx, operand: usize,
  ) -> Result<IntId, RegAllocError> {
    let parent = self.operand_interval(operand);
    self.split_child_at(
      parent,
      self.lir.block_last_id[block] + 1,
      OperandMode::Def,
    )
  }
}

//=============================================================================
// Allocator top level

#[inline(never)]
pub(crate) fn run<F: Function>(
  func: &F, universe: &RealRegUniverse, options: &AllocatorOptions,
) -> Result<RegAllocResult<F>, RegAllocError> {
  info!(
    "linear scan: {} blocks, {} insns, {} vregs",
    func.blocks().len(),
    func.insns().len(),
    func.get_num_vregs()
  );

  let mut ls = LinearScan::new(func, universe, options)?;

  let original_ranges = if options.detailed_verification {
    Some(checker::snapshot_ranges(&ls.intervals))
  } else {
    None
  };

  debug!("walking intervals");
  walk_intervals(&mut ls)?;

  if options.optimize_spill_position {
    debug!("optimizing spill positions");
    optimize_spill_positions(&mut ls)?;
  }

  debug!("resolving data flow");
  resolve_data_flow(&mut ls)?;

  eliminate_spill_moves(&mut ls)?;
  let streams = build_block_streams(&mut ls);

  if let Some(original_ranges) = original_ranges {
    debug!("verifying allocation");
    let mut errors = checker::verify_intervals(&ls, &original_ranges);
    errors.extend(checker::verify_code(&ls, &streams)?);
    if !errors.is_empty() {
      return Err(RegAllocError::Verifier(VerifierErrors(errors)));
    }
  }

  let result = emit_code(&mut ls, &streams)?;

  let stats = &result.stats;
  info!(
    "linear scan done: {} intervals, {} splits, {} spill slots, \
     {} spill stores, {} reloads, {} edge moves, {} moves eliminated",
    stats.num_intervals,
    stats.num_splits,
    stats.num_spill_slots,
    stats.num_spill_stores,
    stats.num_reloads,
    stats.num_edge_moves,
    stats.num_moves_eliminated
  );

  Ok(result)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::analysis::AnalysisError;
  use crate::test_utils::{make_universe, FuncBuilder};

  #[test]
  fn spill_slots_follow_incoming_arguments() {
    let func = FuncBuilder::diamond(0.5);
    let mut frame = FrameMap::new(3);
    let first = frame.allocate_spill_slot(&func, RegClass::I32);
    let second = frame.allocate_spill_slot(&func, RegClass::I32);
    assert_eq!(first, SpillSlot::new(3));
    assert_eq!(second, SpillSlot::new(4));
    assert_eq!(frame.num_slots(), 5);
    assert_eq!(frame.num_allocated(), 2);
  }

  #[test]
  fn pipeline_with_verification() {
    let _ = pretty_env_logger::try_init();
    let func = FuncBuilder::simple_loop();
    for &optimizing in [true, false].iter() {
      let options = AllocatorOptions {
        optimizing_walker: optimizing,
        optimize_spill_position: optimizing,
        reorder_loops: optimizing,
        detailed_verification: true,
        ..Default::default()
      };
      let result = run(&func, &make_universe(2), &options).unwrap();
      assert_eq!(result.alloc_order.len(), 5);
      assert_eq!(result.emission_order.len(), 5);
      assert_eq!(result.target_map.len(), 5);
      assert!(result.stats.num_intervals > 0);
      assert!(result.num_spill_slots as usize >= result.stats.num_spill_slots);
    }
  }

  #[test]
  fn unreachable_block_is_rejected() {
    let mut b = FuncBuilder::new();
    let (b0, b1) = (b.block(), b.block());
    b.switch_to(b0);
    b.ret(None);
    b.switch_to(b1);
    b.ret(None);
    let func = b.finish();
    let options = AllocatorOptions::default();
    assert!(matches!(
      run(&func, &make_universe(2), &options),
      Err(RegAllocError::Analysis(AnalysisError::UnreachableBlocks))
    ));
  }
}
