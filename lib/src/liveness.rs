/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Per-block liveness of virtual registers.

use log::{debug, trace};

use std::collections::VecDeque;

use crate::analysis::{AnalysisError, CFGInfo, LiveinReport};
use crate::data_structures::{BitSet, BlockIx, TypedIxVec};
use crate::interface::{Function, OperandRole};
use crate::lir::Lir;

/// Live sets of one block, over the operand index space. Only virtual
/// registers are tracked.
#[derive(Clone, Debug)]
pub(crate) struct BlockLiveness {
  /// Operands read in the block before any write to them there.
  pub(crate) gen: BitSet,
  /// Operands written in the block.
  pub(crate) kill: BitSet,
  pub(crate) live_in: BitSet,
  pub(crate) live_out: BitSet,
}

pub(crate) struct Liveness {
  pub(crate) blocks: TypedIxVec<BlockIx, BlockLiveness>,
  /// For each loop, the operands referenced in blocks whose innermost loop
  /// it is.
  pub(crate) interval_in_loop: Vec<BitSet>,
}

impl Liveness {
  pub(crate) fn is_interval_in_loop(
    &self, operand: usize, loop_ix: usize,
  ) -> bool {
    self.interval_in_loop[loop_ix].contains(operand)
  }
}

//=============================================================================
// Local sets

#[inline(never)]
fn compute_local_live_sets<F: Function>(
  func: &F, cfg: &CFGInfo, lir: &Lir,
) -> (TypedIxVec<BlockIx, BlockLiveness>, Vec<BitSet>) {
  let num_operands = lir.num_operands;
  let mut interval_in_loop =
    vec![BitSet::with_capacity(num_operands); cfg.loops.len()];

  let mut blocks = TypedIxVec::<BlockIx, BlockLiveness>::new();
  for block in func.blocks() {
    let mut gen = BitSet::with_capacity(num_operands);
    let mut kill = BitSet::with_capacity(num_operands);
    let innermost_loop = cfg.innermost_loop[block];

    for iix in func.block_insns(block) {
      let ops = &lir.operands[iix];
      // Reads happen before the writes of the same instruction.
      for pass_reads in &[true, false] {
        for op in ops.iter() {
          if op.reg.is_real() {
            continue;
          }
          let is_read = match op.role {
            OperandRole::Input | OperandRole::Alive | OperandRole::State => {
              true
            }
            OperandRole::Temp | OperandRole::Output => false,
          };
          if is_read != *pass_reads {
            continue;
          }
          let operand = lir.operand_index(op.reg);
          if is_read {
            if !kill.contains(operand) {
              gen.insert(operand);
            }
          } else {
            kill.insert(operand);
          }
          if let Some(loop_ix) = innermost_loop {
            interval_in_loop[loop_ix].insert(operand);
          }
        }
      }
    }

    trace!("local live sets of {:?}: gen {:?} kill {:?}", block, gen, kill);
    blocks.push(BlockLiveness {
      gen,
      kill,
      live_in: BitSet::with_capacity(num_operands),
      live_out: BitSet::with_capacity(num_operands),
    });
  }

  (blocks, interval_in_loop)
}

//=============================================================================
// Global sets

/// Backward data-flow fixpoint over the allocation order:
///
///   live_out(b) = U live_in(s) for successors s
///   live_in(b)  = gen(b) U (live_out(b) - kill(b))
///
/// `live_in` is only recomputed on the first iteration or when `live_out`
/// changed.
#[inline(never)]
pub(crate) fn compute_liveness<F: Function>(
  func: &F, cfg: &CFGInfo, lir: &Lir, alloc_order: &[BlockIx],
  max_iterations: usize,
) -> Result<Liveness, AnalysisError> {
  let (mut blocks, interval_in_loop) =
    compute_local_live_sets(func, cfg, lir);

  let mut scratch = BitSet::with_capacity(lir.num_operands);
  let mut iteration = 0;
  loop {
    let mut change_occurred = false;
    for &block in alloc_order.iter().rev() {
      let mut change_in_block = false;
      let succs = &cfg.succ_map[block];
      if !succs.is_empty() {
        scratch.clear();
        for &succ in succs.iter() {
          scratch.union_with(&blocks[succ].live_in);
        }
        if blocks[block].live_out != scratch {
          std::mem::swap(&mut blocks[block].live_out, &mut scratch);
          change_occurred = true;
          change_in_block = true;
        }
      }

      if iteration == 0 || change_in_block {
        let data = &mut blocks[block];
        let mut live_in = data.live_out.clone();
        live_in.remove_all(&data.kill);
        live_in.union_with(&data.gen);
        data.live_in = live_in;
      }
    }
    iteration += 1;

    if !change_occurred {
      break;
    }
    if iteration > max_iterations {
      return Err(AnalysisError::LivenessDiverged { iterations: iteration });
    }
  }
  debug!("liveness converged after {} iterations", iteration);

  let liveness = Liveness { blocks, interval_in_loop };

  let entry = func.entry_block();
  if !liveness.blocks[entry].live_in.is_empty() {
    let reports = report_entry_liveins(func, cfg, lir, &liveness);
    debug!("values live into the entry block: {:?}", reports);
    return Err(AnalysisError::EntryLiveinValues(reports));
  }

  Ok(liveness)
}

/// For each value live into the entry block, find its definitions and the
/// uses reached from the entry along a path without definition.
fn report_entry_liveins<F: Function>(
  func: &F, cfg: &CFGInfo, lir: &Lir, liveness: &Liveness,
) -> Vec<LiveinReport> {
  let entry = func.entry_block();
  let mut reports = Vec::new();
  for operand in liveness.blocks[entry].live_in.iter() {
    let reg = match lir.operand_regs[operand] {
      Some(reg) => reg,
      None => continue,
    };
    let defined_in = func
      .blocks()
      .into_iter()
      .filter(|&b| liveness.blocks[b].kill.contains(operand))
      .collect::<Vec<_>>();

    let mut used_in = Vec::new();
    let mut visited = TypedIxVec::<BlockIx, bool>::new();
    visited.resize(cfg.num_blocks(), false);
    let mut queue = VecDeque::new();
    queue.push_back(entry);
    visited[entry] = true;
    while let Some(block) = queue.pop_front() {
      let data = &liveness.blocks[block];
      if data.gen.contains(operand) {
        used_in.push(block);
      }
      if data.kill.contains(operand) {
        continue;
      }
      for &succ in cfg.succ_map[block].iter() {
        if !visited[succ] {
          visited[succ] = true;
          queue.push_back(succ);
        }
      }
    }
    used_in.sort();

    reports.push(LiveinReport { reg, defined_in, used_in });
  }
  reports
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block_order::compute_block_order;
  use crate::test_utils::{make_universe, FuncBuilder};

  fn liveness_of(
    func: &crate::test_utils::TestFunc,
  ) -> Result<(Lir, Liveness), AnalysisError> {
    let universe = make_universe(2);
    let cfg = CFGInfo::create(func)?;
    let order = compute_block_order(func, &cfg, false);
    let lir = Lir::create(func, &universe, &order.alloc_order)?;
    let liveness =
      compute_liveness(func, &cfg, &lir, &order.alloc_order, 50)?;
    Ok((lir, liveness))
  }

  #[test]
  fn loop_carried_values_are_live_around_the_loop() {
    let func = FuncBuilder::simple_loop();
    let (lir, liveness) = liveness_of(&func).unwrap();
    let acc = lir.num_real;
    let n = lir.num_real + 1;
    let header = &liveness.blocks[BlockIx::new(1)];
    assert!(header.live_in.contains(acc));
    assert!(header.live_in.contains(n));
    let latch = &liveness.blocks[BlockIx::new(3)];
    assert!(latch.live_out.contains(acc) && latch.live_out.contains(n));
    let exit = &liveness.blocks[BlockIx::new(4)];
    assert_eq!(exit.live_in.iter().collect::<Vec<_>>(), vec![acc]);
    assert!(liveness.blocks[BlockIx::new(0)].live_in.is_empty());
    assert!(liveness.is_interval_in_loop(acc, 0));
  }

  #[test]
  fn use_before_def_is_reported() {
    // b0 -> {b1, b2}; v is defined in b1 only and used in b3.
    let mut b = FuncBuilder::new();
    let (c, v) = (b.vreg(), b.vreg());
    let (b0, b1, b2, b3) = (b.block(), b.block(), b.block(), b.block());
    b.switch_to(b0);
    b.def_const(c, 0);
    b.branch(c, b1, b2);
    b.switch_to(b1);
    b.def_const(v, 1);
    b.jump(b3);
    b.switch_to(b2);
    b.jump(b3);
    b.switch_to(b3);
    b.ret(Some(v));
    let func = b.finish();

    match liveness_of(&func) {
      Err(AnalysisError::EntryLiveinValues(reports)) => {
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reg, v);
        assert_eq!(reports[0].defined_in, vec![b1]);
        assert_eq!(reports[0].used_in, vec![b3]);
      }
      Err(e) => panic!("unexpected error {}", e),
      Ok(_) => panic!("expected an entry live-in error"),
    }
  }

  #[test]
  fn divergence_limit() {
    let func = FuncBuilder::simple_loop();
    let universe = make_universe(2);
    let cfg = CFGInfo::create(&func).unwrap();
    let order = compute_block_order(&func, &cfg, false);
    let lir = Lir::create(&func, &universe, &order.alloc_order).unwrap();
    // The loop needs a second pass to propagate the back edge.
    assert!(matches!(
      compute_liveness(&func, &cfg, &lir, &order.alloc_order, 0),
      Err(AnalysisError::LivenessDiverged { .. })
    ));
    let alloc_order = &order.alloc_order;
    assert!(compute_liveness(&func, &cfg, &lir, alloc_order, 50).is_ok());
  }
}
