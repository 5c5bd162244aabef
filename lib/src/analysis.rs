/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Control-flow analysis: predecessors, successors, dominators, loops and
//! block frequencies.

use log::debug;

use std::fmt;

use crate::data_structures::{BitSet, BlockIx, RealReg, Reg, TypedIxVec};
use crate::interface::Function;

#[derive(Clone, Debug)]
pub enum AnalysisError {
  /// A critical edge from "from" to "to" has been found, and should have been
  /// removed by the caller in the first place.
  CriticalEdge { from: BlockIx, to: BlockIx },

  /// Some values are live into the entry block, i.e. they are used on some
  /// path without a reaching definition.
  EntryLiveinValues(Vec<LiveinReport>),

  /// The liveness fixpoint kept changing after this many iterations.
  LivenessDiverged { iterations: usize },

  /// A non-existing real register has been seen in the code.
  NonExistingRealReg(RealReg),

  /// At least one block is dead.
  UnreachableBlocks,
}

/// Diagnostic for one value that is live into the entry block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveinReport {
  pub reg: Reg,
  /// Blocks containing a definition of the value.
  pub defined_in: Vec<BlockIx>,
  /// Blocks using the value where no definition reaches.
  pub used_in: Vec<BlockIx>,
}

impl fmt::Display for AnalysisError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      AnalysisError::CriticalEdge { from, to } => {
        write!(f, "critical edge detected, from {:?} to {:?}", from, to)
      }
      AnalysisError::EntryLiveinValues(reports) => {
        write!(f, "entry block has live-in values:")?;
        for report in reports {
          write!(
            f,
            " {:?} (defined in {:?}, used without definition in {:?})",
            report.reg, report.defined_in, report.used_in
          )?;
        }
        Ok(())
      }
      AnalysisError::LivenessDiverged { iterations } => write!(
        f,
        "liveness analysis did not converge after {} iterations",
        iterations
      ),
      AnalysisError::NonExistingRealReg(reg) => write!(
        f,
        "instructions mention real register {:?}, which isn't defined in the register universe",
        reg
      ),
      AnalysisError::UnreachableBlocks => {
        write!(f, "at least one block is unreachable")
      }
    }
  }
}

impl std::error::Error for AnalysisError {}

//=============================================================================
// Control-flow analysis results for a Func: predecessors, successors,
// dominators and loops.

/// A natural loop, merged over all back edges into the same header.
#[derive(Clone, Debug)]
pub(crate) struct Loop {
  pub(crate) header: BlockIx,
  /// Sources of the back edges into `header`, ascending.
  pub(crate) latches: Vec<BlockIx>,
  pub(crate) blocks: BitSet,
  pub(crate) num_blocks: usize,
}

// CFGInfo contains CFG-related info computed from a Func.
pub(crate) struct CFGInfo {
  // All these TypedIxVecs contain one element per Block in the Func.

  // Predecessor and successor maps, in a deterministic order: successors as
  // the client lists them, predecessors by ascending block index.
  pub(crate) pred_map: TypedIxVec<BlockIx, Vec<BlockIx>>,
  pub(crate) succ_map: TypedIxVec<BlockIx, Vec<BlockIx>>,

  // Immediate dominator of each block; `None` for the entry.
  pub(crate) idom: TypedIxVec<BlockIx, Option<BlockIx>>,
  pub(crate) dom_depth: TypedIxVec<BlockIx, u32>,

  // This maps from a Block to the loop depth that it is at
  pub(crate) depth_map: TypedIxVec<BlockIx, u32>,

  // Loops, and the innermost loop of each block.
  pub(crate) loops: Vec<Loop>,
  pub(crate) innermost_loop: TypedIxVec<BlockIx, Option<usize>>,

  // Does the block end with a back edge?
  pub(crate) is_loop_end: TypedIxVec<BlockIx, bool>,

  pub(crate) frequency: TypedIxVec<BlockIx, f64>,

  // Pre- and post-order sequences.  Iterating forwards through these
  // vectors enumerates the blocks in preorder and postorder respectively.
  pub(crate) pre_ord: Vec<BlockIx>,
  pub(crate) post_ord: Vec<BlockIx>,
}

const MAX_FREQUENCY_SWEEPS: usize = 100;
const FREQUENCY_EPSILON: f64 = 1e-6;

/// Probability of taking the edge `from -> to`, summed over every successor
/// slot of `from` naming `to`.
fn edge_probability<F: Function>(
  func: &F, from: BlockIx, to: BlockIx,
) -> f64 {
  let succs = func.block_succs(from);
  succs
    .iter()
    .enumerate()
    .filter(|&(_, &succ)| succ == to)
    .map(|(succ_ix, _)| func.branch_probability(from, succ_ix))
    .sum()
}

impl CFGInfo {
  #[inline(never)]
  pub(crate) fn create<F: Function>(func: &F) -> Result<Self, AnalysisError> {
    let num_blocks = func.blocks().len() as u32;

    // === BEGIN compute successor and predecessor maps ===
    //
    let mut succ_map = TypedIxVec::<BlockIx, Vec<BlockIx>>::new();
    for b in func.blocks() {
      let mut succs = Vec::new();
      for &succ in func.block_succs(b).iter() {
        if !succs.contains(&succ) {
          succs.push(succ);
        }
      }
      succ_map.push(succs);
    }

    // Now invert the mapping
    let mut pred_map = TypedIxVec::<BlockIx, Vec<BlockIx>>::new();
    pred_map.resize(num_blocks, Vec::new());
    for b in func.blocks() {
      for &succ in succ_map[b].iter() {
        pred_map[succ].push(b);
      }
    }
    //
    // === END compute successor and predecessor maps ===

    // === BEGIN check that critical edges have been split ===
    //
    for b in func.blocks() {
      if succ_map[b].len() < 2 {
        continue;
      }
      for &succ in succ_map[b].iter() {
        if pred_map[succ].len() >= 2 {
          return Err(AnalysisError::CriticalEdge { from: b, to: succ });
        }
      }
    }
    //
    // === END check that critical edges have been split ===

    // === BEGIN compute preord/postord sequences ===
    //
    // Iterative depth-first search with an explicit stack of (block, next
    // successor index) pairs.
    let mut pre_ord = Vec::<BlockIx>::new();
    let mut post_ord = Vec::<BlockIx>::new();

    let mut visited = TypedIxVec::<BlockIx, bool>::new();
    visited.resize(num_blocks, false);

    let entry = func.entry_block();
    let mut stack: Vec<(BlockIx, usize)> = vec![(entry, 0)];
    visited[entry] = true;
    pre_ord.push(entry);
    while let Some(top) = stack.last_mut() {
      let block = top.0;
      if let Some(&succ) = succ_map[block].get(top.1) {
        top.1 += 1;
        if !visited[succ] {
          visited[succ] = true;
          pre_ord.push(succ);
          stack.push((succ, 0));
        }
      } else {
        post_ord.push(block);
        stack.pop();
      }
    }

    // Check that all blocks are reachable.
    if pre_ord.len() != num_blocks as usize {
      return Err(AnalysisError::UnreachableBlocks);
    }
    //
    // === END compute preord/postord sequences ===

    // === BEGIN compute dominators ===
    //
    let idom = calc_dominators(&pred_map, &post_ord, entry);

    let mut dom_depth = TypedIxVec::<BlockIx, u32>::new();
    dom_depth.resize(num_blocks, 0);
    // Reverse postorder visits every block after its immediate dominator.
    for &b in post_ord.iter().rev() {
      if let Some(dom) = idom[b] {
        dom_depth[b] = dom_depth[dom] + 1;
      }
    }
    //
    // === END compute dominators ===

    // === BEGIN compute loops and loop depth of all Blocks
    //
    // A "back edge" m->n is some edge m->n where n dominates m.  'n' is
    // the loop header node.  All back edges into the same header form one
    // loop; its blocks are collected per Fig 7.21 of Muchnick 1997.
    let mut is_loop_end = TypedIxVec::<BlockIx, bool>::new();
    is_loop_end.resize(num_blocks, false);

    let mut loops = Vec::<Loop>::new();
    for &header in pre_ord.iter() {
      let mut latches = Vec::new();
      for &pred in pred_map[header].iter() {
        if dominates(&idom, &dom_depth, header, pred) {
          latches.push(pred);
        }
      }
      if latches.is_empty() {
        continue;
      }
      let mut blocks = BitSet::with_capacity(num_blocks as usize);
      blocks.insert(header.get_usize());
      let mut stack = Vec::new();
      for &latch in latches.iter() {
        is_loop_end[latch] = true;
        if !blocks.contains(latch.get_usize()) {
          blocks.insert(latch.get_usize());
          stack.push(latch);
        }
      }
      while let Some(b) = stack.pop() {
        for &pred in pred_map[b].iter() {
          if !blocks.contains(pred.get_usize()) {
            blocks.insert(pred.get_usize());
            stack.push(pred);
          }
        }
      }
      let num_loop_blocks = blocks.card();
      loops.push(Loop { header, latches, blocks, num_blocks: num_loop_blocks });
    }

    // Natural loops with distinct headers are either disjoint or nested, so
    // the depth of a block is the number of loops containing it and its
    // innermost loop is the smallest of them.
    let mut depth_map = TypedIxVec::<BlockIx, u32>::new();
    depth_map.resize(num_blocks, 0);
    let mut innermost_loop = TypedIxVec::<BlockIx, Option<usize>>::new();
    innermost_loop.resize(num_blocks, None);
    for (loop_ix, lp) in loops.iter().enumerate() {
      for b in lp.blocks.iter() {
        let b = BlockIx::new(b as u32);
        depth_map[b] += 1;
        let smaller = match innermost_loop[b] {
          None => true,
          Some(other) => lp.num_blocks < loops[other].num_blocks,
        };
        if smaller {
          innermost_loop[b] = Some(loop_ix);
        }
      }
    }
    //
    // === END compute loops and loop depth of all Blocks

    // === BEGIN estimate block frequencies ===
    //
    // Expected executions per call: the entry runs once, and each edge
    // carries its source's frequency times the branch probability. Loops
    // make this a fixpoint, approached by sweeps in reverse postorder.
    let mut frequency = TypedIxVec::<BlockIx, f64>::new();
    frequency.resize(num_blocks, 0.0);
    for _ in 0..MAX_FREQUENCY_SWEEPS {
      let mut changed = false;
      for &b in post_ord.iter().rev() {
        let mut freq: f64 = if b == entry { 1.0 } else { 0.0 };
        for &pred in pred_map[b].iter() {
          freq += frequency[pred] * edge_probability(func, pred, b);
        }
        if (freq - frequency[b]).abs() > FREQUENCY_EPSILON * freq.max(1.0) {
          changed = true;
        }
        frequency[b] = freq;
      }
      if !changed {
        break;
      }
    }
    for b in func.blocks() {
      if let Some(freq) = func.block_frequency(b) {
        frequency[b] = freq;
      }
    }
    //
    // === END estimate block frequencies ===

    debug!(
      "CFGInfo: {} blocks, {} loops, max depth {}",
      num_blocks,
      loops.len(),
      depth_map.iter().max().cloned().unwrap_or(0)
    );

    Ok(CFGInfo {
      pred_map,
      succ_map,
      idom,
      dom_depth,
      depth_map,
      loops,
      innermost_loop,
      is_loop_end,
      frequency,
      pre_ord,
      post_ord,
    })
  }

  pub(crate) fn num_blocks(&self) -> u32 {
    self.succ_map.len()
  }

  /// Does `a` dominate `b`? Every block dominates itself.
  pub(crate) fn dominates(&self, a: BlockIx, b: BlockIx) -> bool {
    dominates(&self.idom, &self.dom_depth, a, b)
  }

  /// The nearest block dominating both `a` and `b`.
  pub(crate) fn common_dominator(&self, a: BlockIx, b: BlockIx) -> BlockIx {
    let (mut a, mut b) = (a, b);
    while a != b {
      if self.dom_depth[a] >= self.dom_depth[b] {
        match self.idom[a] {
          Some(dom) => a = dom,
          None => return a,
        }
      } else {
        match self.idom[b] {
          Some(dom) => b = dom,
          None => return b,
        }
      }
    }
    a
  }

  pub(crate) fn is_loop_header(&self, block: BlockIx) -> bool {
    self.loops.iter().any(|lp| lp.header == block)
  }

  /// Is `block` part of loop `loop_ix` (or of a loop nested in it)?
  pub(crate) fn loop_contains(&self, loop_ix: usize, block: BlockIx) -> bool {
    self.loops[loop_ix].blocks.contains(block.get_usize())
  }
}

fn dominates(
  idom: &TypedIxVec<BlockIx, Option<BlockIx>>,
  dom_depth: &TypedIxVec<BlockIx, u32>, a: BlockIx, mut b: BlockIx,
) -> bool {
  while dom_depth[b] > dom_depth[a] {
    match idom[b] {
      Some(dom) => b = dom,
      None => return false,
    }
  }
  a == b
}

// Calculate immediate dominators, given |pred_map| and a start node |start|,
// with the iterative algorithm of Cooper, Harvey and Kennedy ("A Simple,
// Fast Dominance Algorithm", 2001). Blocks are visited in reverse postorder.
#[inline(never)]
fn calc_dominators(
  pred_map: &TypedIxVec<BlockIx, Vec<BlockIx>>, post_ord: &[BlockIx],
  start: BlockIx,
) -> TypedIxVec<BlockIx, Option<BlockIx>> {
  debug!("calc_dominators: begin");
  let num_blocks = pred_map.len();

  let mut po_number = TypedIxVec::<BlockIx, u32>::new();
  po_number.resize(num_blocks, 0);
  for (i, &b) in post_ord.iter().enumerate() {
    po_number[b] = i as u32;
  }

  let mut idom = TypedIxVec::<BlockIx, Option<BlockIx>>::new();
  idom.resize(num_blocks, None);
  idom[start] = Some(start);

  let intersect = |idom: &TypedIxVec<BlockIx, Option<BlockIx>>,
                   mut a: BlockIx,
                   mut b: BlockIx|
   -> BlockIx {
    while a != b {
      while po_number[a] < po_number[b] {
        a = idom[a].unwrap_or(start);
      }
      while po_number[b] < po_number[a] {
        b = idom[b].unwrap_or(start);
      }
    }
    a
  };

  let mut changed = true;
  while changed {
    changed = false;
    for &b in post_ord.iter().rev() {
      if b == start {
        continue;
      }
      let mut new_idom: Option<BlockIx> = None;
      for &pred in pred_map[b].iter() {
        if idom[pred].is_none() {
          continue;
        }
        new_idom = Some(match new_idom {
          None => pred,
          Some(cur) => intersect(&idom, pred, cur),
        });
      }
      if new_idom.is_some() && idom[b] != new_idom {
        idom[b] = new_idom;
        changed = true;
      }
    }
  }

  idom[start] = None;
  debug!("calc_dominators: end");
  idom
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::FuncBuilder;

  #[test]
  fn diamond_dominators() {
    // b0 -> {b1, b2} -> b3
    let func = FuncBuilder::diamond(0.5);
    let cfg = CFGInfo::create(&func).unwrap();
    let (b0, b1, b2, b3) =
      (BlockIx::new(0), BlockIx::new(1), BlockIx::new(2), BlockIx::new(3));
    assert_eq!(cfg.idom[b0], None);
    assert_eq!(cfg.idom[b1], Some(b0));
    assert_eq!(cfg.idom[b2], Some(b0));
    assert_eq!(cfg.idom[b3], Some(b0));
    assert!(cfg.dominates(b0, b3));
    assert!(!cfg.dominates(b1, b3));
    assert_eq!(cfg.common_dominator(b1, b2), b0);
    assert!(cfg.loops.is_empty());
  }

  #[test]
  fn loop_depths() {
    // b0 -> b1 -> b2 -> b3 -> b1 (back edge), b3 -> b4 via b1
    let func = FuncBuilder::simple_loop();
    let cfg = CFGInfo::create(&func).unwrap();
    assert_eq!(cfg.loops.len(), 1);
    let lp = &cfg.loops[0];
    assert_eq!(lp.header, BlockIx::new(1));
    assert_eq!(lp.latches, vec![BlockIx::new(3)]);
    assert!(cfg.is_loop_end[BlockIx::new(3)]);
    assert_eq!(cfg.depth_map[BlockIx::new(0)], 0);
    assert_eq!(cfg.depth_map[BlockIx::new(2)], 1);
    assert_eq!(cfg.depth_map[BlockIx::new(4)], 0);
    // The loop is left with probability 0.1 per trip.
    let freq = |b: u32| cfg.frequency[BlockIx::new(b)];
    assert!((freq(0) - 1.0).abs() < 1e-2);
    assert!((freq(1) - 10.0).abs() < 1e-2);
    assert!((freq(2) - 9.0).abs() < 1e-2);
    assert!((freq(4) - 1.0).abs() < 1e-2);
  }

  #[test]
  fn frequencies_follow_branch_probabilities() {
    let func = FuncBuilder::diamond(0.3);
    let cfg = CFGInfo::create(&func).unwrap();
    let freq = |b: u32| cfg.frequency[BlockIx::new(b)];
    assert!((freq(1) - 0.3).abs() < 1e-9);
    assert!((freq(2) - 0.7).abs() < 1e-9);
    assert!((freq(3) - 1.0).abs() < 1e-9);
  }

  #[test]
  fn critical_edge_is_rejected() {
    let mut b = FuncBuilder::new();
    let v = b.vreg();
    let (b0, b1, b2) = (b.block(), b.block(), b.block());
    b.switch_to(b0);
    b.def_const(v, 1);
    b.branch(v, b1, b2);
    b.switch_to(b1);
    b.jump(b2);
    b.switch_to(b2);
    b.ret(None);
    let func = b.finish();
    match CFGInfo::create(&func) {
      Err(AnalysisError::CriticalEdge { from, to }) => {
        assert_eq!((from, to), (b0, b2));
      }
      _ => panic!("expected a critical edge error"),
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
    assert!(matches!(
      CFGInfo::create(&func),
      Err(AnalysisError::UnreachableBlocks)
    ));
  }
}
