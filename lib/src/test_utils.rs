/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! A tiny instruction set implementing `Function`, plus a builder for it, for
//! the unit tests of this crate.

use std::borrow::Cow;

use crate::data_structures::*;
use crate::interface::{Function, OperandCollector, OperandFlags};

#[derive(Clone, Debug)]
pub(crate) enum TestInstKind {
  Const { dst: Reg, value: u32 },
  Op { dst: Reg, srcs: Vec<Reg> },
  Move { dst: Reg, src: Reg },
  Call { dst: Option<Reg>, args: Vec<Reg> },
  Safepoint { state: Vec<Reg> },
  Use { src: Reg },
  LoadArg { dst: Reg, slot: SpillSlot },
  Branch { cond: Reg, targets: [BlockIx; 2], then_prob: f64 },
  Jump { target: BlockIx },
  Ret { src: Option<Reg> },
  AllocMove { to: Location, from: Location },
  Materialize { to: Location, value: u32 },
}

#[derive(Clone, Debug)]
pub(crate) struct TestInst {
  pub(crate) kind: TestInstKind,
  pub(crate) locs: Vec<Location>,
}

pub(crate) struct TestFunc {
  pub(crate) insns: Vec<TestInst>,
  pub(crate) blocks: Vec<MyRange<InstIx>>,
  pub(crate) num_vregs: usize,
  pub(crate) liveins: Vec<RealReg>,
}

impl TestFunc {
  fn last_insn(&self, block: BlockIx) -> Option<&TestInst> {
    let range = self.blocks[block.get_usize()];
    if range.is_empty() {
      None
    } else {
      Some(&self.insns[range.last().get_usize()])
    }
  }
}

impl Function for TestFunc {
  type Inst = TestInst;
  type Const = u32;

  fn insns(&self) -> &[TestInst] {
    &self.insns
  }

  fn blocks(&self) -> MyRange<BlockIx> {
    MyRange::new(BlockIx::new(0), self.blocks.len())
  }

  fn entry_block(&self) -> BlockIx {
    BlockIx::new(0)
  }

  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx> {
    self.blocks[block.get_usize()]
  }

  fn block_succs(&self, block: BlockIx) -> Cow<[BlockIx]> {
    match self.last_insn(block).map(|insn| &insn.kind) {
      Some(TestInstKind::Branch { targets, .. }) => {
        Cow::Owned(targets.to_vec())
      }
      Some(TestInstKind::Jump { target }) => Cow::Owned(vec![*target]),
      _ => Cow::Owned(Vec::new()),
    }
  }

  fn branch_probability(&self, block: BlockIx, succ_ix: usize) -> f64 {
    match self.last_insn(block).map(|insn| &insn.kind) {
      Some(TestInstKind::Branch { then_prob, .. }) => {
        if succ_ix == 0 {
          *then_prob
        } else {
          1.0 - *then_prob
        }
      }
      _ => 1.0,
    }
  }

  fn is_jump(&self, insn: &TestInst) -> bool {
    match insn.kind {
      TestInstKind::Jump { .. } => true,
      _ => false,
    }
  }

  fn get_operands(&self, insn: &TestInst, collector: &mut OperandCollector) {
    use TestInstKind::*;
    match &insn.kind {
      Const { dst, .. } => collector.add_output(*dst, OperandFlags::REG),
      Op { dst, srcs } => {
        for (i, src) in srcs.iter().enumerate() {
          let flags = if i == 0 {
            OperandFlags::REG | OperandFlags::HINT
          } else {
            OperandFlags::REG
          };
          collector.add_input(*src, flags);
        }
        collector.add_output(*dst, OperandFlags::REG | OperandFlags::HINT);
      }
      Move { dst, src } => {
        collector.add_input(*src, OperandFlags::REG | OperandFlags::STACK);
        collector.add_output(*dst, OperandFlags::REG | OperandFlags::STACK);
      }
      Call { dst, args } => {
        for arg in args {
          collector.add_input(*arg, OperandFlags::STACK);
        }
        if let Some(dst) = dst {
          collector.add_output(*dst, OperandFlags::REG);
        }
      }
      Safepoint { state } => {
        for reg in state {
          collector.add_state(*reg);
        }
      }
      Use { src } => collector.add_input(*src, OperandFlags::REG),
      LoadArg { dst, .. } => {
        collector.add_output(*dst, OperandFlags::REG | OperandFlags::STACK)
      }
      Branch { cond, .. } => collector.add_input(*cond, OperandFlags::REG),
      Ret { src: Some(src) } => collector.add_input(*src, OperandFlags::REG),
      Jump { .. }
      | Ret { src: None }
      | AllocMove { .. }
      | Materialize { .. } => {}
    }
  }

  fn destroys_caller_saved(&self, insn: &TestInst) -> bool {
    match insn.kind {
      TestInstKind::Call { .. } => true,
      _ => false,
    }
  }

  fn is_safepoint(&self, insn: &TestInst) -> bool {
    match insn.kind {
      TestInstKind::Safepoint { .. } | TestInstKind::Call { .. } => true,
      _ => false,
    }
  }

  fn is_move(&self, insn: &TestInst) -> Option<(Reg, Reg)> {
    match insn.kind {
      TestInstKind::Move { dst, src } => Some((dst, src)),
      _ => None,
    }
  }

  fn constant_def(&self, insn: &TestInst) -> Option<u32> {
    match insn.kind {
      TestInstKind::Const { value, .. } => Some(value),
      _ => None,
    }
  }

  fn incoming_stack_arg(&self, insn: &TestInst) -> Option<SpillSlot> {
    match insn.kind {
      TestInstKind::LoadArg { slot, .. } => Some(slot),
      _ => None,
    }
  }

  fn num_incoming_stack_slots(&self) -> u32 {
    self
      .insns
      .iter()
      .filter_map(|insn| match insn.kind {
        TestInstKind::LoadArg { slot, .. } => Some(slot.get() + 1),
        _ => None,
      })
      .max()
      .unwrap_or(0)
  }

  fn get_num_vregs(&self) -> usize {
    self.num_vregs
  }

  fn func_liveins(&self) -> Vec<RealReg> {
    self.liveins.clone()
  }

  fn get_spillslot_size(&self, _regclass: RegClass) -> u32 {
    1
  }

  fn assign_locations(&self, insn: &mut TestInst, locations: &[Location]) {
    insn.locs = locations.to_vec();
  }

  fn gen_move(
    &self, to: Location, from: Location, _vreg: Option<VirtualReg>,
  ) -> TestInst {
    TestInst { kind: TestInstKind::AllocMove { to, from }, locs: Vec::new() }
  }

  fn gen_materialize(
    &self, to: Location, constant: &u32, _vreg: Option<VirtualReg>,
  ) -> TestInst {
    TestInst {
      kind: TestInstKind::Materialize { to, value: *constant },
      locs: Vec::new(),
    }
  }
}

//=============================================================================
// Builder

pub(crate) struct FuncBuilder {
  blocks: Vec<Vec<TestInst>>,
  cur: usize,
  num_vregs: u32,
  liveins: Vec<RealReg>,
}

impl FuncBuilder {
  pub(crate) fn new() -> Self {
    Self { blocks: Vec::new(), cur: 0, num_vregs: 0, liveins: Vec::new() }
  }

  pub(crate) fn vreg(&mut self) -> Reg {
    let vreg = VirtualReg::new(RegClass::I32, self.num_vregs);
    self.num_vregs += 1;
    vreg.to_reg()
  }

  pub(crate) fn block(&mut self) -> BlockIx {
    self.blocks.push(Vec::new());
    BlockIx::new(self.blocks.len() as u32 - 1)
  }

  pub(crate) fn switch_to(&mut self, block: BlockIx) {
    self.cur = block.get_usize();
  }

  pub(crate) fn livein(&mut self, reg: RealReg) {
    self.liveins.push(reg);
  }

  fn push(&mut self, kind: TestInstKind) {
    self.blocks[self.cur].push(TestInst { kind, locs: Vec::new() });
  }

  pub(crate) fn def_const(&mut self, dst: Reg, value: u32) {
    self.push(TestInstKind::Const { dst, value });
  }
  pub(crate) fn op(&mut self, dst: Reg, srcs: &[Reg]) {
    self.push(TestInstKind::Op { dst, srcs: srcs.to_vec() });
  }
  pub(crate) fn mov(&mut self, dst: Reg, src: Reg) {
    self.push(TestInstKind::Move { dst, src });
  }
  pub(crate) fn call(&mut self, dst: Option<Reg>, args: &[Reg]) {
    self.push(TestInstKind::Call { dst, args: args.to_vec() });
  }
  pub(crate) fn safepoint(&mut self, state: &[Reg]) {
    self.push(TestInstKind::Safepoint { state: state.to_vec() });
  }
  pub(crate) fn use_reg(&mut self, src: Reg) {
    self.push(TestInstKind::Use { src });
  }
  pub(crate) fn load_arg(&mut self, dst: Reg, slot: u32) {
    self.push(TestInstKind::LoadArg { dst, slot: SpillSlot::new(slot) });
  }
  pub(crate) fn branch(&mut self, cond: Reg, then: BlockIx, els: BlockIx) {
    self.branch_p(cond, then, els, 0.5);
  }
  pub(crate) fn branch_p(
    &mut self, cond: Reg, then: BlockIx, els: BlockIx, then_prob: f64,
  ) {
    self.push(TestInstKind::Branch { cond, targets: [then, els], then_prob });
  }
  pub(crate) fn jump(&mut self, target: BlockIx) {
    self.push(TestInstKind::Jump { target });
  }
  pub(crate) fn ret(&mut self, src: Option<Reg>) {
    self.push(TestInstKind::Ret { src });
  }

  pub(crate) fn finish(self) -> TestFunc {
    let mut insns = Vec::new();
    let mut blocks = Vec::new();
    for block in self.blocks {
      let start = InstIx::new(insns.len() as u32);
      blocks.push(MyRange::new(start, block.len()));
      insns.extend(block);
    }
    TestFunc {
      insns,
      blocks,
      num_vregs: self.num_vregs as usize,
      liveins: self.liveins,
    }
  }

  /// `b0 -> {b1, b2} -> b3`, where `b1` is taken with probability
  /// `then_prob`.
  pub(crate) fn diamond(then_prob: f64) -> TestFunc {
    let mut b = FuncBuilder::new();
    let (v0, v1) = (b.vreg(), b.vreg());
    let (b0, b1, b2, b3) = (b.block(), b.block(), b.block(), b.block());
    b.switch_to(b0);
    b.def_const(v0, 1);
    b.branch_p(v0, b1, b2, then_prob);
    b.switch_to(b1);
    b.op(v1, &[v0]);
    b.jump(b3);
    b.switch_to(b2);
    b.op(v1, &[v0, v0]);
    b.jump(b3);
    b.switch_to(b3);
    b.ret(Some(v1));
    b.finish()
  }

  /// `b0 -> b1 -> {b2 -> b3 -> b1, b4}`: a single loop with header `b1` and
  /// latch `b3`.
  pub(crate) fn simple_loop() -> TestFunc {
    let mut b = FuncBuilder::new();
    let (acc, n) = (b.vreg(), b.vreg());
    let (b0, b1, b2, b3, b4) =
      (b.block(), b.block(), b.block(), b.block(), b.block());
    b.switch_to(b0);
    b.def_const(acc, 0);
    b.def_const(n, 10);
    b.jump(b1);
    b.switch_to(b1);
    b.branch_p(n, b2, b4, 0.9);
    b.switch_to(b2);
    b.op(acc, &[acc, n]);
    b.jump(b3);
    b.switch_to(b3);
    b.op(n, &[n]);
    b.jump(b1);
    b.switch_to(b4);
    b.ret(Some(acc));
    b.finish()
  }
}

/// `num_i32` allocatable integer registers, all preserved across calls,
/// followed by one non-allocatable register.
pub(crate) fn make_universe(num_i32: usize) -> RealRegUniverse {
  make_universe_with_caller_saved(num_i32, &[])
}

pub(crate) fn make_universe_with_caller_saved(
  num_i32: usize, caller_saved: &[usize],
) -> RealRegUniverse {
  let mut regs = Vec::new();
  for i in 0..num_i32 {
    regs.push((RealReg::new(RegClass::I32, i as u8), format!("r{}", i)));
  }
  regs.push((RealReg::new(RegClass::I32, num_i32 as u8), "sp".to_string()));
  let universe = RealRegUniverse {
    regs,
    allocable: num_i32,
    allocable_by_class: [
      if num_i32 > 0 { Some((0, num_i32 - 1)) } else { None },
      None,
    ],
    caller_saved: caller_saved.to_vec(),
  };
  universe.check_is_sane();
  universe
}

pub(crate) fn rreg(index: usize) -> RealReg {
  RealReg::new(RegClass::I32, index as u8)
}
