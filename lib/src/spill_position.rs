/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Spill store placement for values spilled inside loops or more than once.
//!
//! Such a value is stored once, at the start of the block that dominates
//! every block where it lives on the stack, hoisted out of loops deeper
//! than its definition. The store only moves into a block that runs less
//! often than the definition. With the store in place the stack slot is
//! always current, so the moves into stack children can be dropped later.

use log::{debug, trace};

use crate::data_structures::{BlockIx, IntId};
use crate::inst_stream::{EditKind, InsertPoint, InsertRank};
use crate::interface::{Function, RegAllocError};
use crate::intervals::{OperandMode, SpillState};
use crate::linear_scan::LinearScan;

/// The blocks, in allocation order, that the ranges of `id` touch.
fn blocks_of_interval<F: Function>(
  ls: &LinearScan<F>, id: IntId,
) -> Vec<BlockIx> {
  let mut blocks = Vec::new();
  for range in ls.intervals[id].ranges.iter() {
    let first = ls.order.linear_pos[ls.lir.block_for_id(range.from)];
    let last = ls.order.linear_pos[ls.lir.block_for_id(range.to - 1)];
    for pos in first..=last {
      let block = ls.block_at(pos);
      if blocks.last() != Some(&block) {
        blocks.push(block);
      }
    }
  }
  blocks
}

/// The first dominator of `spill_block` not nested deeper in loops than
/// `def_block`.
fn move_spill_out_of_loop<F: Function>(
  ls: &LinearScan<F>, def_block: BlockIx, spill_block: BlockIx,
) -> BlockIx {
  let def_depth = ls.cfg.depth_map[def_block];
  let mut block = ls.cfg.idom[spill_block];
  while let Some(b) = block {
    if b == def_block {
      break;
    }
    if ls.cfg.depth_map[b] <= def_depth {
      return b;
    }
    block = ls.cfg.idom[b];
  }
  def_block
}

fn optimize_interval<F: Function>(
  ls: &mut LinearScan<F>, parent: IntId,
) -> Result<bool, RegAllocError> {
  let def_pos = match ls.intervals[parent].spill_definition_pos {
    Some(pos) => pos,
    None => return Ok(false),
  };
  let def_block = ls.lir.block_for_id(def_pos);

  let mut spill_block: Option<BlockIx> = None;
  let mut first_spill_child: Option<IntId> = None;
  for &child in ls.intervals[parent].split_children.iter() {
    if ls.intervals[child].location.spill().is_none() {
      continue;
    }
    let from = ls.intervals[child].from();
    if first_spill_child.map_or(true, |first| from < ls.intervals[first].from())
    {
      first_spill_child = Some(child);
    }
    for block in blocks_of_interval(ls, child) {
      if ls.cfg.dominates(def_block, block) {
        spill_block = Some(match spill_block {
          None => block,
          Some(other) => ls.cfg.common_dominator(other, block),
        });
      }
    }
  }

  let (mut spill_block, first_spill_child) =
    match (spill_block, first_spill_child) {
      (Some(block), Some(child)) => (block, child),
      _ => {
        trace!("{:?}: no stack child below the definition", parent);
        ls.intervals.set_spill_state(parent, SpillState::StoreAtDefinition);
        return Ok(false);
      }
    };

  if ls.cfg.depth_map[def_block] < ls.cfg.depth_map[spill_block] {
    spill_block = move_spill_out_of_loop(ls, def_block, spill_block);
  }

  // A store at the start of the block where the first stack child begins
  // could miss values arriving from other predecessors; use its dominator.
  let first_child_block =
    ls.lir.block_for_id(ls.intervals[first_spill_child].from());
  if spill_block != def_block && spill_block == first_child_block {
    if let Some(dom) = ls.cfg.idom[spill_block] {
      spill_block = dom;
    }
  }

  if spill_block == def_block {
    trace!("{:?}: the definition is the best spill position", parent);
    ls.intervals.set_spill_state(parent, SpillState::StoreAtDefinition);
    return Ok(false);
  }
  if ls.cfg.frequency[def_block] <= ls.cfg.frequency[spill_block] {
    trace!(
      "{:?}: {:?} is not colder than the definition block {:?}",
      parent,
      spill_block,
      def_block
    );
    ls.intervals.set_spill_state(parent, SpillState::StoreAtDefinition);
    return Ok(false);
  }
  debug_assert!(ls.cfg.dominates(def_block, spill_block));

  let spill_op_id = ls.lir.block_first_id[spill_block];
  let from = ls.split_child_at(parent, spill_op_id, OperandMode::Def)?;
  let slot = ls.intervals.spill_slot(parent).ok_or_else(|| {
    RegAllocError::Other(format!(
      "{:?} is spilled but has no spill slot",
      ls.intervals[parent].reg
    ))
  })?;
  trace!(
    "{:?}: store to {:?} moved from {:?} to {:?}",
    parent,
    slot,
    def_block,
    spill_block
  );
  let point = InsertPoint {
    block: spill_block,
    index: 0,
    rank: InsertRank::DominatorSpill,
  };
  ls.push_edit(point, EditKind::Store { from, slot });
  ls.intervals.set_spill_definition_pos(parent, spill_op_id);
  Ok(true)
}

/// Places the spill stores of all values in the `SpillInDominator` state.
#[inline(never)]
pub(crate) fn optimize_spill_positions<F: Function>(
  ls: &mut LinearScan<F>,
) -> Result<(), RegAllocError> {
  let mut num_moved = 0;
  for operand in ls.lir.num_real..ls.lir.num_operands {
    let parent = ls.operand_interval(operand);
    let interval = &ls.intervals[parent];
    if interval.is_empty()
      || interval.spill_state != SpillState::SpillInDominator
      || interval.can_materialize()
    {
      continue;
    }
    if optimize_interval(ls, parent)? {
      num_moved += 1;
    }
  }
  debug!("spill positions: {} stores moved to dominators", num_moved);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interface::AllocatorOptions;
  use crate::test_utils::{make_universe, FuncBuilder, TestFunc};
  use crate::walker::walk_intervals;

  /// `v0` is defined in `b0`, lives through a loop and is evicted inside
  /// it. With `preheader`, `b0` branches to a preheader `b1` in front of the
  /// loop and to a block `b2` using `v0`; otherwise it jumps straight into
  /// the loop.
  fn loop_spill_func(preheader: bool) -> TestFunc {
    let mut b = FuncBuilder::new();
    let (v0, v1, v2, vc) = (b.vreg(), b.vreg(), b.vreg(), b.vreg());
    let b0 = b.block();
    let side = if preheader { Some((b.block(), b.block())) } else { None };
    let (header, latch, exit) = (b.block(), b.block(), b.block());

    b.switch_to(b0);
    b.op(v0, &[]);
    match side {
      Some((pre, other)) => {
        b.op(vc, &[]);
        b.branch(vc, pre, other);
        b.switch_to(pre);
        b.jump(header);
        b.switch_to(other);
        b.use_reg(v0);
        b.ret(None);
      }
      None => b.jump(header),
    }
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
    b.finish()
  }

  // r0, r1, sp, then v0.
  const V0: u32 = 3;

  fn with_walked<R>(
    func: &TestFunc, f: impl FnOnce(&mut LinearScan<TestFunc>) -> R,
  ) -> R {
    let universe = make_universe(2);
    let options =
      AllocatorOptions { optimizing_walker: false, ..Default::default() };
    let mut ls = LinearScan::new(func, &universe, &options).unwrap();
    walk_intervals(&mut ls).unwrap();
    f(&mut ls)
  }

  #[test]
  fn store_hoisted_to_preheader() {
    let _ = pretty_env_logger::try_init();
    let func = loop_spill_func(true);
    with_walked(&func, |ls| {
      let v0 = IntId::new(V0);
      assert_eq!(ls.intervals[v0].spill_state, SpillState::SpillInDominator);
      let num_edits = ls.edits.len();
      optimize_spill_positions(ls).unwrap();

      let b1 = BlockIx::new(1);
      assert_eq!(ls.edits.len(), num_edits + 1);
      let edit = &ls.edits[num_edits];
      assert_eq!(edit.point.block, b1);
      assert_eq!(edit.point.index, 0);
      assert_eq!(edit.point.rank, InsertRank::DominatorSpill);
      match edit.kind {
        EditKind::Store { from, slot } => {
          assert_eq!(from, v0);
          assert_eq!(Some(slot), ls.intervals.spill_slot(v0));
        }
        kind => panic!("expected a store, got {:?}", kind),
      }
      assert_eq!(
        ls.intervals.spill_definition_pos(v0),
        Some(ls.lir.block_first_id[b1])
      );
      assert_eq!(ls.intervals[v0].spill_state, SpillState::SpillInDominator);
    });
  }

  #[test]
  fn store_not_moved_into_hotter_block() {
    let func = loop_spill_func(true);
    with_walked(&func, |ls| {
      let v0 = IntId::new(V0);
      let (b0, b1) = (BlockIx::new(0), BlockIx::new(1));
      assert!(ls.cfg.frequency[b1] < ls.cfg.frequency[b0]);
      ls.cfg.frequency[b1] = 100.0;
      let def_pos = ls.intervals.spill_definition_pos(v0);
      let num_edits = ls.edits.len();
      optimize_spill_positions(ls).unwrap();
      assert_eq!(ls.edits.len(), num_edits);
      assert_eq!(ls.intervals[v0].spill_state, SpillState::StoreAtDefinition);
      assert_eq!(ls.intervals.spill_definition_pos(v0), def_pos);
    });
  }

  #[test]
  fn store_stays_at_definition() {
    let func = loop_spill_func(false);
    with_walked(&func, |ls| {
      let v0 = IntId::new(V0);
      assert_eq!(ls.intervals[v0].spill_state, SpillState::SpillInDominator);
      let num_edits = ls.edits.len();
      optimize_spill_positions(ls).unwrap();
      // The loop header's dominator is the defining block itself.
      assert_eq!(ls.edits.len(), num_edits);
      assert_eq!(ls.intervals[v0].spill_state, SpillState::StoreAtDefinition);
    });
  }

  #[test]
  fn spill_leaves_loops() {
    let func = loop_spill_func(true);
    with_walked(&func, |ls| {
      let (b0, b1) = (BlockIx::new(0), BlockIx::new(1));
      let (header, latch) = (BlockIx::new(3), BlockIx::new(4));
      assert_eq!(move_spill_out_of_loop(ls, b0, header), b1);
      assert_eq!(move_spill_out_of_loop(ls, b0, b1), b0);
      let v0 = IntId::new(V0);
      let stack_child = ls.intervals[v0]
        .split_children
        .iter()
        .cloned()
        .find(|&child| ls.intervals[child].location.spill().is_some())
        .unwrap();
      assert_eq!(blocks_of_interval(ls, stack_child), vec![header, latch]);
    });
  }
}
