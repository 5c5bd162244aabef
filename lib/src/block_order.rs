/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Block ordering for allocation and code emission.
//!
//! The allocation order is a topological order over the forward edges of the
//! CFG, driven by a priority worklist: among the ready blocks, deeper loop
//! bodies go first so that every loop stays contiguous, loop ends come after
//! the rest of their loop, and exception handlers and exits come last.

use log::{debug, trace};

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::analysis::CFGInfo;
use crate::data_structures::{cmp_f64, BlockIx, TypedIxVec};
use crate::interface::Function;

const MAX_DEPTH: u32 = 0x7fff;

pub(crate) struct BlockOrder {
  /// The order intervals are numbered and walked in.
  pub(crate) alloc_order: Vec<BlockIx>,
  /// The order code is laid out in.
  pub(crate) emission_order: Vec<BlockIx>,
  /// Index of each block in `alloc_order`.
  pub(crate) linear_pos: TypedIxVec<BlockIx, u32>,
}

/// Lower weights are scheduled first.
fn block_weight<F: Function>(func: &F, cfg: &CFGInfo, block: BlockIx) -> u32 {
  let depth = cfg.depth_map[block].min(MAX_DEPTH);
  let mut weight = (MAX_DEPTH - depth) << 16;
  if cfg.is_loop_end[block] {
    weight |= 1 << 15;
  }
  if func.is_exception_handler(block) {
    weight |= 1 << 14;
  }
  if cfg.succ_map[block].is_empty() {
    weight |= 1 << 13;
  }
  // Keep the weight non-zero.
  weight | 1
}

fn is_back_edge(cfg: &CFGInfo, from: BlockIx, to: BlockIx) -> bool {
  cfg.loops.iter().any(|lp| lp.header == to && lp.latches.contains(&from))
}

#[inline(never)]
pub(crate) fn compute_block_order<F: Function>(
  func: &F, cfg: &CFGInfo, reorder_loops: bool,
) -> BlockOrder {
  let num_blocks = cfg.num_blocks();

  // === BEGIN count forward predecessors ===
  //
  let mut pending_preds = TypedIxVec::<BlockIx, u32>::new();
  pending_preds.resize(num_blocks, 0);
  for b in func.blocks() {
    for &succ in cfg.succ_map[b].iter() {
      if !is_back_edge(cfg, b, succ) {
        pending_preds[succ] += 1;
      }
    }
  }
  //
  // === END count forward predecessors ===

  // === BEGIN priority-driven topological sort ===
  //
  // Entries are (weight, insertion sequence, block); the sequence number
  // makes ties first-come first-served.
  let mut worklist = BinaryHeap::<Reverse<(u32, u32, BlockIx)>>::new();
  let mut seq = 0;
  let entry = func.entry_block();
  worklist.push(Reverse((block_weight(func, cfg, entry), seq, entry)));
  seq += 1;

  let mut alloc_order = Vec::with_capacity(num_blocks as usize);
  while let Some(Reverse((weight, _, block))) = worklist.pop() {
    trace!("block order: {:?} (weight {:#x})", block, weight);
    alloc_order.push(block);

    let succs = &cfg.succ_map[block];
    let mut visit_order: Vec<usize> = (0..succs.len()).collect();
    if succs.len() == 2 {
      // The likelier successor is pushed first, so it is scheduled first
      // among equally weighted blocks and becomes the fall-through.
      let p0 = func.branch_probability(block, 0);
      let p1 = func.branch_probability(block, 1);
      if cmp_f64(p1, p0) == std::cmp::Ordering::Greater {
        visit_order.swap(0, 1);
      }
    }

    for succ_ix in visit_order {
      let succ = succs[succ_ix];
      if is_back_edge(cfg, block, succ) {
        continue;
      }
      pending_preds[succ] -= 1;
      if pending_preds[succ] == 0 {
        worklist.push(Reverse((block_weight(func, cfg, succ), seq, succ)));
        seq += 1;
      }
    }
  }
  debug_assert_eq!(alloc_order.len(), num_blocks as usize);
  //
  // === END priority-driven topological sort ===

  let mut linear_pos = TypedIxVec::<BlockIx, u32>::new();
  linear_pos.resize(num_blocks, 0);
  for (pos, &block) in alloc_order.iter().enumerate() {
    linear_pos[block] = pos as u32;
  }

  let emission_order = if reorder_loops {
    compute_emission_order(cfg, &alloc_order)
  } else {
    alloc_order.clone()
  };

  debug!("alloc order: {:?}", alloc_order);
  debug!("emission order: {:?}", emission_order);

  BlockOrder { alloc_order, emission_order, linear_pos }
}

/// Moves the header of each loop with a single latch right behind that
/// latch, so that the loop closes with a fall-through into the header's
/// exit test instead of an extra jump. Loops with several latches keep their
/// place.
fn compute_emission_order(
  cfg: &CFGInfo, alloc_order: &[BlockIx],
) -> Vec<BlockIx> {
  let num_blocks = cfg.num_blocks();
  let mut deferred_after = TypedIxVec::<BlockIx, Option<BlockIx>>::new();
  deferred_after.resize(num_blocks, None);
  let mut deferred = TypedIxVec::<BlockIx, bool>::new();
  deferred.resize(num_blocks, false);

  for lp in cfg.loops.iter() {
    if lp.latches.len() != 1 {
      continue;
    }
    let latch = lp.latches[0];
    let header_is_latch =
      cfg.loops.iter().any(|l| l.latches.contains(&lp.header));
    if latch == lp.header || header_is_latch {
      continue;
    }
    deferred_after[latch] = Some(lp.header);
    deferred[lp.header] = true;
  }

  let mut order = Vec::with_capacity(alloc_order.len());
  for &block in alloc_order {
    if !deferred[block] {
      order.push(block);
    }
    if let Some(header) = deferred_after[block] {
      order.push(header);
    }
  }
  order
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::FuncBuilder;

  #[test]
  fn likely_successor_follows_entry() {
    let func = FuncBuilder::diamond(0.3);
    let cfg = CFGInfo::create(&func).unwrap();
    let order = compute_block_order(&func, &cfg, true);
    assert_eq!(order.alloc_order[0], BlockIx::new(0));
    assert_eq!(order.alloc_order[1], BlockIx::new(2));
    assert_eq!(order.alloc_order[2], BlockIx::new(1));
    assert_eq!(order.alloc_order[3], BlockIx::new(3));
    assert_eq!(order.linear_pos[BlockIx::new(2)], 1);
  }

  #[test]
  fn even_branch_keeps_successor_order() {
    let func = FuncBuilder::diamond(0.5);
    let cfg = CFGInfo::create(&func).unwrap();
    let order = compute_block_order(&func, &cfg, true);
    assert_eq!(
      order.alloc_order,
      vec![BlockIx::new(0), BlockIx::new(1), BlockIx::new(2), BlockIx::new(3)]
    );
  }

  #[test]
  fn loop_body_is_contiguous() {
    let func = FuncBuilder::simple_loop();
    let cfg = CFGInfo::create(&func).unwrap();
    let order = compute_block_order(&func, &cfg, false);
    // The loop body is scheduled before the loop exit, and the latch last.
    assert_eq!(
      order.alloc_order,
      vec![
        BlockIx::new(0),
        BlockIx::new(1),
        BlockIx::new(2),
        BlockIx::new(3),
        BlockIx::new(4)
      ]
    );
    assert_eq!(order.emission_order, order.alloc_order);
  }

  #[test]
  fn single_latch_header_is_deferred() {
    let func = FuncBuilder::simple_loop();
    let cfg = CFGInfo::create(&func).unwrap();
    let order = compute_block_order(&func, &cfg, true);
    assert_eq!(
      order.emission_order,
      vec![
        BlockIx::new(0),
        BlockIx::new(2),
        BlockIx::new(3),
        BlockIx::new(1),
        BlockIx::new(4)
      ]
    );
  }
}
