/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data flow resolution: inserts the moves that connect split children
//! across control flow edges.
//!
//! The walker only connects split children within the linear order. Where
//! a value is live into a block but the child ending its predecessor lives
//! elsewhere, a move goes on the edge: at the end of the predecessor if it
//! has a single successor, otherwise at the start of the successor (which
//! then has a single predecessor, critical edges being split).

use log::{debug, trace};

use crate::data_structures::{BlockIx, TypedIxVec};
use crate::inst_stream::{InsertPoint, InsertRank};
use crate::interface::{Function, RegAllocError};
use crate::linear_scan::LinearScan;
use crate::move_resolver::MoveResolver;

/// Does the block hold nothing but a jump to its only successor?
fn is_empty_block<F: Function>(ls: &LinearScan<F>, block: BlockIx) -> bool {
  let insns = ls.func.block_insns(block);
  insns.len() == 1 && ls.func.is_jump(ls.func.get_insn(insns.first()))
}

/// Queues a move for every value live into `to_block` that sits in another
/// location at the end of `from_block`.
fn collect_mappings<F: Function>(
  ls: &LinearScan<F>, move_resolver: &mut MoveResolver, from_block: BlockIx,
  to_block: BlockIx,
) -> Result<(), RegAllocError> {
  for operand in ls.liveness.blocks[to_block].live_in.iter() {
    if operand < ls.lir.num_real {
      continue;
    }
    let from = ls.interval_at_block_end(from_block, operand)?;
    let to = ls.interval_at_block_begin(to_block, operand)?;
    if from != to && ls.intervals[from].location != ls.intervals[to].location
    {
      trace!(
        "edge {:?} -> {:?}: {:?} moves from {:?} to {:?}",
        from_block,
        to_block,
        ls.intervals[from].reg,
        ls.intervals[from].location,
        ls.intervals[to].location
      );
      move_resolver.add_mapping(ls, from, to);
    }
  }
  Ok(())
}

/// Where the moves of the edge `from_block -> to_block` go.
fn edge_insert_point<F: Function>(
  ls: &LinearScan<F>, from_block: BlockIx, to_block: BlockIx,
) -> Result<InsertPoint, RegAllocError> {
  if ls.cfg.succ_map[from_block].len() <= 1 {
    let insns = ls.func.block_insns(from_block);
    let ends_in_jump =
      !insns.is_empty() && ls.func.is_jump(ls.func.get_insn(insns.last()));
    let index = insns.len() as u32 - if ends_in_jump { 1 } else { 0 };
    Ok(InsertPoint { block: from_block, index, rank: InsertRank::BlockEnd })
  } else if ls.cfg.pred_map[to_block].len() == 1 {
    Ok(InsertPoint { block: to_block, index: 0, rank: InsertRank::BlockStart })
  } else {
    Err(RegAllocError::Other(format!(
      "no place for the moves of the critical edge {:?} -> {:?}",
      from_block, to_block
    )))
  }
}

/// Blocks with one predecessor and one successor that only jump are
/// resolved in one go: the moves between predecessor and successor are
/// placed in the empty block itself, in front of the jump. Returns the
/// blocks handled this way.
fn optimize_empty_blocks<F: Function>(
  ls: &mut LinearScan<F>, move_resolver: &mut MoveResolver,
) -> Result<TypedIxVec<BlockIx, bool>, RegAllocError> {
  let mut completed = TypedIxVec::<BlockIx, bool>::new();
  completed.resize(ls.func.blocks().len() as u32, false);

  for pos in 0..ls.order.alloc_order.len() as u32 {
    let block = ls.block_at(pos);
    if ls.cfg.pred_map[block].len() != 1
      || ls.cfg.succ_map[block].len() != 1
      || !is_empty_block(ls, block)
    {
      continue;
    }
    let pred = ls.cfg.pred_map[block][0];
    let succ = ls.cfg.succ_map[block][0];
    // Two consecutive empty blocks would skip each other's moves.
    if completed[pred] || completed[succ] {
      continue;
    }
    completed[block] = true;
    trace!("{:?} is empty: resolving {:?} -> {:?} there", block, pred, succ);

    collect_mappings(ls, move_resolver, pred, succ)?;
    if move_resolver.has_mappings() {
      let point =
        InsertPoint { block, index: 0, rank: InsertRank::BlockEnd };
      move_resolver.set_insert_point(point);
      move_resolver.resolve_and_append_moves(ls)?;
    }
  }
  Ok(completed)
}

/// Inserts the moves needed on every control flow edge.
#[inline(never)]
pub(crate) fn resolve_data_flow<F: Function>(
  ls: &mut LinearScan<F>,
) -> Result<(), RegAllocError> {
  let num_edits = ls.edits.len();
  let mut move_resolver = MoveResolver::new(ls.universe.num_regs());
  let completed = optimize_empty_blocks(ls, &mut move_resolver)?;

  for pos in 0..ls.order.alloc_order.len() as u32 {
    let from_block = ls.block_at(pos);
    if completed[from_block] {
      continue;
    }
    let mut already_resolved = completed.clone();

    for i in 0..ls.cfg.succ_map[from_block].len() {
      let to_block = ls.cfg.succ_map[from_block][i];
      // Several edges to the same block, as from a switch.
      if already_resolved[to_block] {
        continue;
      }
      already_resolved[to_block] = true;

      collect_mappings(ls, &mut move_resolver, from_block, to_block)?;
      if move_resolver.has_mappings() {
        let point = edge_insert_point(ls, from_block, to_block)?;
        move_resolver.set_insert_point(point);
        move_resolver.resolve_and_append_moves(ls)?;
      }
    }
  }

  debug!("data flow resolution: {} edits", ls.edits.len() - num_edits);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data_structures::IntId;
  use crate::inst_stream::{Edit, EditKind};
  use crate::interface::AllocatorOptions;
  use crate::test_utils::{make_universe, FuncBuilder, TestFunc};
  use crate::walker::walk_intervals;

  /// `b0 -> {b1, b2} -> b3`. `v0` lives through both arms and gets evicted
  /// in `b1`; `b2` only jumps.
  fn evicting_diamond() -> TestFunc {
    let mut b = FuncBuilder::new();
    let (v0, v1, v2, v3) = (b.vreg(), b.vreg(), b.vreg(), b.vreg());
    let (b0, b1, b2, b3) = (b.block(), b.block(), b.block(), b.block());
    b.switch_to(b0);
    b.op(v0, &[]);
    b.op(v3, &[]);
    b.branch(v3, b1, b2);
    b.switch_to(b1);
    b.op(v1, &[]);
    b.op(v2, &[]);
    b.use_reg(v1);
    b.use_reg(v2);
    b.jump(b3);
    b.switch_to(b2);
    b.jump(b3);
    b.switch_to(b3);
    b.use_reg(v0);
    b.ret(None);
    b.finish()
  }

  fn has_move(edits: &[Edit], block: BlockIx, from: IntId, to: IntId) -> bool {
    edits.iter().any(|edit| {
      edit.point.block == block && edit.kind == EditKind::Move { from, to }
    })
  }

  #[test]
  fn edges_are_connected() {
    let _ = pretty_env_logger::try_init();
    let func = evicting_diamond();
    let universe = make_universe(2);
    let options =
      AllocatorOptions { optimizing_walker: false, ..Default::default() };
    let mut ls = LinearScan::new(&func, &universe, &options).unwrap();
    walk_intervals(&mut ls).unwrap();
    let walker_edits = ls.edits.len();
    resolve_data_flow(&mut ls).unwrap();
    assert!(ls.edits.len() >= walker_edits + 2);

    let (b0, b1, b2, b3) =
      (BlockIx::new(0), BlockIx::new(1), BlockIx::new(2), BlockIx::new(3));
    // The branch in b0 puts the moves of b0 -> b1 at the start of b1; b1
    // ends in a jump, so b1 -> b3 goes at its end; the empty b2 carries
    // the moves of b0 -> b3.
    let edges = [(b0, b1, b1), (b1, b3, b1), (b0, b3, b2)];
    for &(from_block, to_block, at) in edges.iter() {
      for operand in ls.liveness.blocks[to_block].live_in.iter() {
        let from = ls.interval_at_block_end(from_block, operand).unwrap();
        let to = ls.interval_at_block_begin(to_block, operand).unwrap();
        let (from_loc, to_loc) =
          (ls.intervals[from].location, ls.intervals[to].location);
        let differs = from != to && from_loc != to_loc;
        assert_eq!(
          has_move(&ls.edits, at, from, to),
          differs,
          "edge {:?} -> {:?}, operand {}",
          from_block,
          to_block,
          operand
        );
      }
    }

    for edit in ls.edits[walker_edits..].iter() {
      match edit.point.rank {
        InsertRank::BlockStart => assert_eq!(edit.point.block, b1),
        InsertRank::BlockEnd => assert!(edit.point.block != b0),
        rank => panic!("unexpected rank {:?}", rank),
      }
    }
  }

  #[test]
  fn empty_block_detection() {
    let func = evicting_diamond();
    let universe = make_universe(2);
    let options = AllocatorOptions::default();
    let ls = LinearScan::new(&func, &universe, &options).unwrap();
    assert!(is_empty_block(&ls, BlockIx::new(2)));
    assert!(!is_empty_block(&ls, BlockIx::new(1)));
    assert!(!is_empty_block(&ls, BlockIx::new(3)));
  }

  #[test]
  fn edge_insert_points() {
    let func = FuncBuilder::diamond(0.5);
    let universe = make_universe(2);
    let options = AllocatorOptions::default();
    let ls = LinearScan::new(&func, &universe, &options).unwrap();
    let (b0, b1, b3) = (BlockIx::new(0), BlockIx::new(1), BlockIx::new(3));
    let start = edge_insert_point(&ls, b0, b1).unwrap();
    assert_eq!((start.block, start.index), (b1, 0));
    assert_eq!(start.rank, InsertRank::BlockStart);
    let end = edge_insert_point(&ls, b1, b3).unwrap();
    // b1 holds an op and a jump: the moves go before the jump.
    assert_eq!((end.block, end.index), (b1, 1));
    assert_eq!(end.rank, InsertRank::BlockEnd);
  }
}
