/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Linearized view of a function: operand index space and instruction
//! numbering in allocation order.
//!
//! Every block starts with a virtual label slot holding an even id; its
//! instructions follow at increasing even ids. An odd id `n + 1` denotes the
//! point right after the operation numbered `n`.

use log::debug;
use smallvec::SmallVec;

use crate::analysis::AnalysisError;
use crate::data_structures::{
  BlockIx, InstIx, RealRegUniverse, Reg, RegClass, TypedIxVec,
};
use crate::interface::{Function, Operand, OperandCollector};

pub(crate) type Operands = SmallVec<[Operand; 8]>;

pub(crate) struct Lir {
  /// Number of real registers; operand `i < num_real` is real register `i`.
  pub(crate) num_real: usize,
  /// Number of operands known before allocation (real plus virtual).
  pub(crate) num_operands: usize,
  /// The register behind each operand index, when it appears in the code.
  pub(crate) operand_regs: Vec<Option<Reg>>,

  /// Operands of each instruction, as reported by the client.
  pub(crate) operands: TypedIxVec<InstIx, Operands>,
  pub(crate) insn_id: TypedIxVec<InstIx, u32>,

  /// Id of the label slot of each block.
  pub(crate) block_first_id: TypedIxVec<BlockIx, u32>,
  /// Id of the last instruction of each block (the label if it is empty).
  pub(crate) block_last_id: TypedIxVec<BlockIx, u32>,

  // Indexed by `id >> 1`.
  op_block: Vec<BlockIx>,
  op_insn: Vec<Option<InstIx>>,
  op_destroys_caller_saved: Vec<bool>,
}

impl Lir {
  #[inline(never)]
  pub(crate) fn create<F: Function>(
    func: &F, universe: &RealRegUniverse, alloc_order: &[BlockIx],
  ) -> Result<Self, AnalysisError> {
    let num_real = universe.num_regs();
    let num_insns = func.insns().len() as u32;

    // === BEGIN collect operands ===
    //
    let mut collector = OperandCollector::new();
    let mut operands = TypedIxVec::<InstIx, Operands>::new();
    let mut num_vregs = func.get_num_vregs();
    for insn in func.insns() {
      func.get_operands(insn, &mut collector);
      let ops = collector.take();
      for op in ops.iter() {
        match op.reg {
          Reg::Real(rreg) => {
            if rreg.get_index() >= num_real
              || universe.regs[rreg.get_index()].0 != rreg
            {
              return Err(AnalysisError::NonExistingRealReg(rreg));
            }
          }
          Reg::Virtual(vreg) => {
            num_vregs = num_vregs.max(vreg.get_index() + 1);
          }
        }
      }
      operands.push(ops);
    }

    let num_operands = num_real + num_vregs;
    let mut operand_regs = vec![None; num_operands];
    for (i, (rreg, _)) in universe.regs.iter().enumerate() {
      operand_regs[i] = Some(rreg.to_reg());
    }
    for ops in operands.iter() {
      for op in ops.iter() {
        if let Reg::Virtual(vreg) = op.reg {
          operand_regs[num_real + vreg.get_index()] = Some(op.reg);
        }
      }
    }
    //
    // === END collect operands ===

    // === BEGIN number instructions ===
    //
    let num_blocks = func.blocks().len() as u32;
    let mut insn_id = TypedIxVec::<InstIx, u32>::new();
    insn_id.resize(num_insns, 0);
    let mut block_first_id = TypedIxVec::<BlockIx, u32>::new();
    block_first_id.resize(num_blocks, 0);
    let mut block_last_id = TypedIxVec::<BlockIx, u32>::new();
    block_last_id.resize(num_blocks, 0);

    let num_ops = num_insns as usize + num_blocks as usize;
    let mut op_block = Vec::with_capacity(num_ops);
    let mut op_insn = Vec::with_capacity(num_ops);
    let mut op_destroys_caller_saved = Vec::with_capacity(num_ops);

    let mut next_id = 0u32;
    for &block in alloc_order {
      block_first_id[block] = next_id;
      op_block.push(block);
      op_insn.push(None);
      op_destroys_caller_saved.push(false);
      let mut last = next_id;
      next_id += 2;
      for iix in func.block_insns(block) {
        insn_id[iix] = next_id;
        op_block.push(block);
        op_insn.push(Some(iix));
        op_destroys_caller_saved
          .push(func.destroys_caller_saved(func.get_insn(iix)));
        last = next_id;
        next_id += 2;
      }
      block_last_id[block] = last;
    }
    //
    // === END number instructions ===

    debug!(
      "lir: {} operands ({} real), max op id {}",
      num_operands,
      num_real,
      next_id.saturating_sub(2)
    );

    Ok(Lir {
      num_real,
      num_operands,
      operand_regs,
      operands,
      insn_id,
      block_first_id,
      block_last_id,
      op_block,
      op_insn,
      op_destroys_caller_saved,
    })
  }

  pub(crate) fn operand_index(&self, reg: Reg) -> usize {
    match reg {
      Reg::Real(rreg) => rreg.get_index(),
      Reg::Virtual(vreg) => self.num_real + vreg.get_index(),
    }
  }

  pub(crate) fn operand_class(&self, operand: usize) -> Option<RegClass> {
    self.operand_regs[operand].map(|reg| reg.get_class())
  }

  pub(crate) fn max_op_id(&self) -> u32 {
    ((self.op_block.len() as u32).max(1) - 1) * 2
  }

  /// Ids past the last instruction belong to the last block.
  pub(crate) fn block_for_id(&self, id: u32) -> BlockIx {
    let ix = ((id >> 1) as usize).min(self.op_block.len() - 1);
    self.op_block[ix]
  }

  /// The instruction numbered `id`, or `None` for a block label.
  pub(crate) fn insn_for_id(&self, id: u32) -> Option<InstIx> {
    self.op_insn.get((id >> 1) as usize).cloned().flatten()
  }

  /// The end of the code counts as a block boundary.
  pub(crate) fn is_block_begin(&self, id: u32) -> bool {
    if (id >> 1) as usize >= self.op_block.len() {
      return true;
    }
    id == 0 || self.block_for_id(id) != self.block_for_id(id - 1)
  }

  /// Does a block boundary lie between `id1` and `id2`?
  pub(crate) fn covers_block_begin(&self, id1: u32, id2: u32) -> bool {
    self.block_for_id(id1) != self.block_for_id(id2)
  }

  pub(crate) fn has_call(&self, id: u32) -> bool {
    self
      .op_destroys_caller_saved
      .get((id >> 1) as usize)
      .cloned()
      .unwrap_or(false)
  }

  /// Position of an instruction within its block's original instruction
  /// list.
  pub(crate) fn index_in_block<F: Function>(
    &self, func: &F, id: u32,
  ) -> Option<(BlockIx, u32)> {
    let iix = self.insn_for_id(id)?;
    let block = self.block_for_id(id);
    Some((block, iix.get() - func.block_insns(block).start().get()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::{make_universe, FuncBuilder};

  #[test]
  fn numbering_follows_alloc_order() {
    let func = FuncBuilder::diamond(0.3);
    let universe = make_universe(2);
    let order =
      vec![BlockIx::new(0), BlockIx::new(2), BlockIx::new(1), BlockIx::new(3)];
    let lir = Lir::create(&func, &universe, &order).unwrap();
    // b0: label 0, const 2, branch 4; b2: label 6, op 8, jump 10; ...
    assert_eq!(lir.block_first_id[BlockIx::new(0)], 0);
    assert_eq!(lir.block_last_id[BlockIx::new(0)], 4);
    assert_eq!(lir.block_first_id[BlockIx::new(2)], 6);
    assert_eq!(lir.block_first_id[BlockIx::new(1)], 12);
    assert_eq!(lir.block_for_id(9), BlockIx::new(2));
    assert!(lir.is_block_begin(6));
    assert!(!lir.is_block_begin(8));
    assert_eq!(lir.insn_for_id(6), None);
    assert_eq!(lir.insn_for_id(2), Some(InstIx::new(0)));
    // Three real registers (two allocatable plus sp), two vregs.
    assert_eq!(lir.num_operands, 5);
  }
}
