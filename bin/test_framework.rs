/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! As part of this set of test cases, we define a mini IR and implement the
//! `Function` trait for it so that we can use the lsra public interface, and
//! an interpreter that runs the IR before and after allocation.

use lsra::{
  BlockIx, Function, InstIx, Location, MyRange, OperandCollector,
  OperandFlags, OperandRole, RealReg, RealRegUniverse, Reg, RegAllocResult,
  RegClass, SpillSlot, TypedIxVec, VirtualReg, NUM_REG_CLASSES,
};
use log::{debug, info};
use rustc_hash::FxHashMap;

use std::borrow::Cow;
use std::fmt;

//=============================================================================
// Definition of: Label, RI (reg-or-immediate operands), AM (address modes),
// and Inst (instructions).  Destinations are on the left.

#[derive(Clone)]
pub enum Label {
  Unresolved { name: String },
  Resolved { name: String, bix: BlockIx },
}
impl fmt::Debug for Label {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Label::Unresolved { name } => write!(fmt, "??:{}", &name),
      Label::Resolved { name, bix } => write!(fmt, "{:?}:{}", bix, name),
    }
  }
}
impl Label {
  pub fn new_unresolved(name: String) -> Label {
    Label::Unresolved { name }
  }
  pub fn name(&self) -> &str {
    match self {
      Label::Unresolved { name } | Label::Resolved { name, .. } => name,
    }
  }
  pub fn get_block_ix(&self) -> BlockIx {
    match self {
      Label::Resolved { bix, .. } => *bix,
      Label::Unresolved { .. } => {
        panic!("Label::get_block_ix: unresolved label!")
      }
    }
  }
  fn remap_control_flow(&mut self, from: &str, to: &str) {
    match self {
      Label::Resolved { .. } => {
        panic!("Label::remap_control_flow on resolved label");
      }
      Label::Unresolved { name } => {
        if name == from {
          *name = to.to_string();
        }
      }
    }
  }
}

#[derive(Copy, Clone)]
pub enum RI {
  Reg { reg: Reg },
  Imm { imm: u32 },
}
#[allow(non_snake_case)]
pub fn RI_R(reg: Reg) -> RI {
  debug_assert!(reg.get_class() == RegClass::I32);
  RI::Reg { reg }
}
#[allow(non_snake_case)]
pub fn RI_I(imm: u32) -> RI {
  RI::Imm { imm }
}
impl fmt::Debug for RI {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RI::Reg { reg } => reg.fmt(fmt),
      RI::Imm { imm } => write!(fmt, "{}", imm),
    }
  }
}

#[derive(Copy, Clone)]
pub enum AM {
  RI { base: Reg, offset: u32 },
  RR { base: Reg, offset: Reg },
}
#[allow(non_snake_case)]
pub fn AM_R(base: Reg) -> AM {
  debug_assert!(base.get_class() == RegClass::I32);
  AM::RI { base, offset: 0 }
}
#[allow(non_snake_case)]
pub fn AM_RI(base: Reg, offset: u32) -> AM {
  debug_assert!(base.get_class() == RegClass::I32);
  AM::RI { base, offset }
}
#[allow(non_snake_case)]
pub fn AM_RR(base: Reg, offset: Reg) -> AM {
  debug_assert!(base.get_class() == RegClass::I32);
  debug_assert!(offset.get_class() == RegClass::I32);
  AM::RR { base, offset }
}
impl fmt::Debug for AM {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      AM::RI { base, offset } => write!(fmt, "[{:?}, {:?}]", base, offset),
      AM::RR { base, offset } => write!(fmt, "[{:?}, {:?}]", base, offset),
    }
  }
}
impl AM {
  fn add_operands(&self, collector: &mut OperandCollector) {
    match self {
      AM::RI { base, .. } => collector.add_input(*base, OperandFlags::REG),
      AM::RR { base, offset } => {
        collector.add_input(*base, OperandFlags::REG);
        collector.add_input(*offset, OperandFlags::REG);
      }
    }
  }
}

#[derive(Copy, Clone)]
pub enum BinOp {
  Add,
  Sub,
  Mul,
  Mod,
  Shr,
  And,
  CmpEQ,
  CmpLT,
  CmpLE,
  CmpGE,
  CmpGT,
}
impl fmt::Debug for BinOp {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(
      fmt,
      "{}",
      match self {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::Mod => "mod",
        BinOp::Shr => "shr",
        BinOp::And => "and",
        BinOp::CmpEQ => "cmpeq",
        BinOp::CmpLT => "cmplt",
        BinOp::CmpLE => "cmple",
        BinOp::CmpGE => "cmpge",
        BinOp::CmpGT => "cmpgt",
      }
    )
  }
}
impl fmt::Display for BinOp {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    (self as &dyn fmt::Debug).fmt(fmt)
  }
}
impl BinOp {
  pub fn calc(self, arg_l: u32, arg_r: u32) -> u32 {
    match self {
      BinOp::Add => u32::wrapping_add(arg_l, arg_r),
      BinOp::Sub => u32::wrapping_sub(arg_l, arg_r),
      BinOp::Mul => u32::wrapping_mul(arg_l, arg_r),
      BinOp::Mod => arg_l % arg_r,
      BinOp::Shr => arg_l >> (arg_r & 31),
      BinOp::And => arg_l & arg_r,
      BinOp::CmpEQ => (arg_l == arg_r) as u32,
      BinOp::CmpLT => (arg_l < arg_r) as u32,
      BinOp::CmpLE => (arg_l <= arg_r) as u32,
      BinOp::CmpGE => (arg_l >= arg_r) as u32,
      BinOp::CmpGT => (arg_l > arg_r) as u32,
    }
  }
}

#[derive(Copy, Clone)]
pub enum BinOpF {
  FAdd,
  FSub,
  FMul,
  FDiv,
}
impl fmt::Debug for BinOpF {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(
      fmt,
      "{}",
      match self {
        BinOpF::FAdd => "fadd",
        BinOpF::FSub => "fsub",
        BinOpF::FMul => "fmul",
        BinOpF::FDiv => "fdiv",
      }
    )
  }
}
impl fmt::Display for BinOpF {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    (self as &dyn fmt::Debug).fmt(fmt)
  }
}
impl BinOpF {
  pub fn calc(self, arg_l: f32, arg_r: f32) -> f32 {
    match self {
      BinOpF::FAdd => arg_l + arg_r,
      BinOpF::FSub => arg_l - arg_r,
      BinOpF::FMul => arg_l * arg_r,
      BinOpF::FDiv => arg_l / arg_r,
    }
  }
}

#[derive(Clone)]
pub enum InstKind {
  Imm { dst: Reg, imm: u32 },
  ImmF { dst: Reg, imm: f32 },
  Copy { dst: Reg, src: Reg },
  CopyF { dst: Reg, src: Reg },
  BinOp { op: BinOp, dst: Reg, src_l: Reg, src_r: RI },
  BinOpM { op: BinOp, dst: Reg, src_r: RI }, // "mod" semantics for |dst|
  BinOpF { op: BinOpF, dst: Reg, src_l: Reg, src_r: Reg },
  Load { dst: Reg, addr: AM },
  LoadF { dst: Reg, addr: AM },
  Store { addr: AM, src: Reg },
  StoreF { addr: AM, src: Reg },
  /// Reads an incoming argument from its stack slot.
  LoadArg { dst: Reg, slot: SpillSlot },
  /// Calls a helper computing the sum of its arguments; destroys the
  /// caller-saved registers.
  Call { dst: Option<Reg>, args: Vec<Reg> },
  /// Keeps `state` alive for a (pretend) garbage collection.
  Safepoint { state: Vec<Reg> },
  Goto { target: Label },
  GotoCTF { cond: Reg, target_t: Label, target_f: Label },
  PrintS { str: String },
  PrintI { reg: Reg },
  PrintF { reg: Reg },
  Finish { reg: Option<Reg> },
  // Only created by the allocator.
  Move { to: Location, from: Location },
  Materialize { to: Location, value: Value },
}

/// An instruction, plus the locations of its operands once allocated.
#[derive(Clone)]
pub struct Inst {
  pub kind: InstKind,
  pub locs: Vec<Location>,
}

impl Inst {
  pub fn new(kind: InstKind) -> Self {
    Inst { kind, locs: Vec::new() }
  }
}

pub fn i_imm(dst: Reg, imm: u32) -> Inst {
  debug_assert!(dst.get_class() == RegClass::I32);
  Inst::new(InstKind::Imm { dst, imm })
}
pub fn i_immf(dst: Reg, imm: f32) -> Inst {
  debug_assert!(dst.get_class() == RegClass::F32);
  Inst::new(InstKind::ImmF { dst, imm })
}
pub fn i_copy(dst: Reg, src: Reg) -> Inst {
  debug_assert!(dst.get_class() == RegClass::I32);
  debug_assert!(src.get_class() == RegClass::I32);
  Inst::new(InstKind::Copy { dst, src })
}
pub fn i_copyf(dst: Reg, src: Reg) -> Inst {
  debug_assert!(dst.get_class() == RegClass::F32);
  debug_assert!(src.get_class() == RegClass::F32);
  Inst::new(InstKind::CopyF { dst, src })
}
// For BinOp variants see below

pub fn i_load(dst: Reg, addr: AM) -> Inst {
  debug_assert!(dst.get_class() == RegClass::I32);
  Inst::new(InstKind::Load { dst, addr })
}
pub fn i_loadf(dst: Reg, addr: AM) -> Inst {
  debug_assert!(dst.get_class() == RegClass::F32);
  Inst::new(InstKind::LoadF { dst, addr })
}
pub fn i_store(addr: AM, src: Reg) -> Inst {
  debug_assert!(src.get_class() == RegClass::I32);
  Inst::new(InstKind::Store { addr, src })
}
pub fn i_storef(addr: AM, src: Reg) -> Inst {
  debug_assert!(src.get_class() == RegClass::F32);
  Inst::new(InstKind::StoreF { addr, src })
}
pub fn i_load_arg(dst: Reg, slot: u32) -> Inst {
  Inst::new(InstKind::LoadArg { dst, slot: SpillSlot::new(slot) })
}
pub fn i_call(dst: Option<Reg>, args: &[Reg]) -> Inst {
  Inst::new(InstKind::Call { dst, args: args.to_vec() })
}
pub fn i_safepoint(state: &[Reg]) -> Inst {
  Inst::new(InstKind::Safepoint { state: state.to_vec() })
}
pub fn i_goto<'a>(target: &'a str) -> Inst {
  let target = Label::new_unresolved(target.to_string());
  Inst::new(InstKind::Goto { target })
}
pub fn i_goto_ctf<'a>(cond: Reg, target_t: &'a str, target_f: &'a str) -> Inst {
  debug_assert!(cond.get_class() == RegClass::I32);
  Inst::new(InstKind::GotoCTF {
    cond,
    target_t: Label::new_unresolved(target_t.to_string()),
    target_f: Label::new_unresolved(target_f.to_string()),
  })
}
pub fn i_print_s<'a>(str: &'a str) -> Inst {
  Inst::new(InstKind::PrintS { str: str.to_string() })
}
pub fn i_print_i(reg: Reg) -> Inst {
  debug_assert!(reg.get_class() == RegClass::I32);
  Inst::new(InstKind::PrintI { reg })
}
pub fn i_print_f(reg: Reg) -> Inst {
  debug_assert!(reg.get_class() == RegClass::F32);
  Inst::new(InstKind::PrintF { reg })
}
pub fn i_finish(reg: Option<Reg>) -> Inst {
  Inst::new(InstKind::Finish { reg })
}

fn i_binop(op: BinOp, dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  debug_assert!(dst.get_class() == RegClass::I32);
  debug_assert!(src_l.get_class() == RegClass::I32);
  Inst::new(InstKind::BinOp { op, dst, src_l, src_r })
}
pub fn i_add(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::Add, dst, src_l, src_r)
}
pub fn i_sub(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::Sub, dst, src_l, src_r)
}
pub fn i_mul(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::Mul, dst, src_l, src_r)
}
pub fn i_mod(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::Mod, dst, src_l, src_r)
}
pub fn i_shr(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::Shr, dst, src_l, src_r)
}
pub fn i_and(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::And, dst, src_l, src_r)
}
pub fn i_cmp_eq(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::CmpEQ, dst, src_l, src_r)
}
pub fn i_cmp_lt(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::CmpLT, dst, src_l, src_r)
}
pub fn i_cmp_le(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::CmpLE, dst, src_l, src_r)
}
pub fn i_cmp_ge(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::CmpGE, dst, src_l, src_r)
}
pub fn i_cmp_gt(dst: Reg, src_l: Reg, src_r: RI) -> Inst {
  i_binop(BinOp::CmpGT, dst, src_l, src_r)
}

// 2-operand versions of i_add and i_sub
pub fn i_addm(dst: Reg, src_r: RI) -> Inst {
  debug_assert!(dst.get_class() == RegClass::I32);
  Inst::new(InstKind::BinOpM { op: BinOp::Add, dst, src_r })
}
pub fn i_subm(dst: Reg, src_r: RI) -> Inst {
  debug_assert!(dst.get_class() == RegClass::I32);
  Inst::new(InstKind::BinOpM { op: BinOp::Sub, dst, src_r })
}

fn i_binopf(op: BinOpF, dst: Reg, src_l: Reg, src_r: Reg) -> Inst {
  debug_assert!(dst.get_class() == RegClass::F32);
  debug_assert!(src_l.get_class() == RegClass::F32);
  debug_assert!(src_r.get_class() == RegClass::F32);
  Inst::new(InstKind::BinOpF { op, dst, src_l, src_r })
}
pub fn i_fadd(dst: Reg, src_l: Reg, src_r: Reg) -> Inst {
  i_binopf(BinOpF::FAdd, dst, src_l, src_r)
}
pub fn i_fsub(dst: Reg, src_l: Reg, src_r: Reg) -> Inst {
  i_binopf(BinOpF::FSub, dst, src_l, src_r)
}
pub fn i_fmul(dst: Reg, src_l: Reg, src_r: Reg) -> Inst {
  i_binopf(BinOpF::FMul, dst, src_l, src_r)
}
pub fn i_fdiv(dst: Reg, src_l: Reg, src_r: Reg) -> Inst {
  i_binopf(BinOpF::FDiv, dst, src_l, src_r)
}

fn fmt_regs(regs: &[Reg]) -> String {
  let names: Vec<String> = regs.iter().map(|r| format!("{:?}", r)).collect();
  names.join(", ")
}

impl fmt::Debug for InstKind {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    use InstKind::*;
    match self {
      Imm { dst, imm } => write!(fmt, "imm     {:?}, {:?}", dst, imm),
      ImmF { dst, imm } => write!(fmt, "immf    {:?}, {:?}", dst, imm),
      Copy { dst, src } => write!(fmt, "copy    {:?}, {:?}", dst, src),
      CopyF { dst, src } => write!(fmt, "copyf   {:?}, {:?}", dst, src),
      BinOp { op, dst, src_l, src_r } => {
        write!(fmt, "{:<7} {:?}, {:?}, {:?}", op.to_string(), dst, src_l, src_r)
      }
      BinOpM { op, dst, src_r } => {
        write!(fmt, "{:<7} {:?}, {:?}", op.to_string() + "m", dst, src_r)
      }
      BinOpF { op, dst, src_l, src_r } => {
        write!(fmt, "{:<7} {:?}, {:?}, {:?}", op.to_string(), dst, src_l, src_r)
      }
      Load { dst, addr } => write!(fmt, "load    {:?}, {:?}", dst, addr),
      LoadF { dst, addr } => write!(fmt, "loadf   {:?}, {:?}", dst, addr),
      Store { addr, src } => write!(fmt, "store   {:?}, {:?}", addr, src),
      StoreF { addr, src } => write!(fmt, "storef  {:?}, {:?}", addr, src),
      LoadArg { dst, slot } => write!(fmt, "ldarg   {:?}, {:?}", dst, slot),
      Call { dst, args } => {
        write!(fmt, "call    {:?}, ({})", dst, fmt_regs(args))
      }
      Safepoint { state } => write!(fmt, "safept  ({})", fmt_regs(state)),
      Goto { target } => write!(fmt, "goto    {:?}", target),
      GotoCTF { cond, target_t, target_f } => write!(
        fmt,
        "goto    if {:?} then {:?} else {:?}",
        cond, target_t, target_f
      ),
      PrintS { str } => {
        let mut res = "prints  '".to_string();
        for c in str.chars() {
          res += &(if c == '\n' { "\\n".to_string() } else { c.to_string() });
        }
        write!(fmt, "{}'", res)
      }
      PrintI { reg } => write!(fmt, "printi  {:?}", reg),
      PrintF { reg } => write!(fmt, "printf  {:?}", reg),
      Finish { reg } => write!(fmt, "finish  {:?}", reg),
      Move { to, from } => write!(fmt, "MOVE    {:?}, {:?}", to, from),
      Materialize { to, value } => {
        write!(fmt, "MATER   {:?}, {:?}", to, value)
      }
    }
  }
}

impl fmt::Debug for Inst {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.kind)?;
    if !self.locs.is_empty() {
      write!(fmt, "   ; {:?}", self.locs)?;
    }
    Ok(())
  }
}

impl Inst {
  /// The blocks this instruction might jump to. The labels are assumed all
  /// to be resolved.
  pub fn get_targets(&self) -> Vec<BlockIx> {
    match &self.kind {
      InstKind::Goto { target } => vec![target.get_block_ix()],
      InstKind::GotoCTF { target_t, target_f, .. } => {
        vec![target_t.get_block_ix(), target_f.get_block_ix()]
      }
      _ => vec![],
    }
  }

  /// Reports the register operands, inputs first. A register that is
  /// modified shows up as an input and as an output, each of which may be
  /// given its own location.
  pub fn get_operands(&self, collector: &mut OperandCollector) {
    use InstKind::*;
    let reg_or_stack = OperandFlags::REG | OperandFlags::STACK;
    let hint = OperandFlags::REG | OperandFlags::HINT;
    match &self.kind {
      Imm { dst, .. } | ImmF { dst, .. } => {
        collector.add_output(*dst, OperandFlags::REG)
      }
      Copy { dst, src } | CopyF { dst, src } => {
        collector.add_input(*src, reg_or_stack);
        collector.add_output(*dst, reg_or_stack);
      }
      BinOp { dst, src_l, src_r, .. } => {
        collector.add_input(*src_l, hint);
        if let RI::Reg { reg } = src_r {
          collector.add_input(*reg, reg_or_stack);
        }
        collector.add_output(*dst, hint);
      }
      BinOpM { dst, src_r, .. } => {
        collector.add_input(*dst, hint);
        if let RI::Reg { reg } = src_r {
          collector.add_input(*reg, reg_or_stack);
        }
        collector.add_output(*dst, hint);
      }
      BinOpF { dst, src_l, src_r, .. } => {
        collector.add_input(*src_l, hint);
        collector.add_input(*src_r, OperandFlags::REG);
        collector.add_output(*dst, hint);
      }
      Load { dst, addr } | LoadF { dst, addr } => {
        addr.add_operands(collector);
        collector.add_output(*dst, OperandFlags::REG);
      }
      Store { addr, src } | StoreF { addr, src } => {
        addr.add_operands(collector);
        collector.add_input(*src, OperandFlags::REG);
      }
      LoadArg { dst, .. } => collector.add_output(*dst, reg_or_stack),
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
      GotoCTF { cond, .. } => collector.add_input(*cond, OperandFlags::REG),
      PrintI { reg } | PrintF { reg } => {
        collector.add_input(*reg, reg_or_stack)
      }
      Finish { reg: Some(reg) } => {
        collector.add_input(*reg, OperandFlags::REG)
      }
      Goto { .. }
      | PrintS { .. }
      | Finish { reg: None }
      | Move { .. }
      | Materialize { .. } => {}
    }
  }

  fn is_control_flow(&self) -> bool {
    match self.kind {
      InstKind::Goto { .. }
      | InstKind::GotoCTF { .. }
      | InstKind::Finish { .. } => true,
      _ => false,
    }
  }

  fn remap_control_flow_target(&mut self, from: &str, to: &str) {
    match &mut self.kind {
      InstKind::Goto { target } => target.remap_control_flow(from, to),
      InstKind::GotoCTF { target_t, target_f, .. } => {
        target_t.remap_control_flow(from, to);
        target_f.remap_control_flow(from, to);
      }
      _ => {}
    }
  }

  fn resolve_labels<F: Fn(&str) -> BlockIx>(&mut self, lookup: F) {
    fn resolve<F: Fn(&str) -> BlockIx>(label: &mut Label, lookup: &F) {
      let bix = lookup(label.name());
      *label = Label::Resolved { name: label.name().to_string(), bix };
    }
    match &mut self.kind {
      InstKind::Goto { target } => resolve(target, &lookup),
      InstKind::GotoCTF { target_t, target_f, .. } => {
        resolve(target_t, &lookup);
        resolve(target_f, &lookup);
      }
      _ => {}
    }
  }

  /// Names of the blocks an unresolved control flow instruction targets.
  fn target_names(&self) -> Vec<String> {
    match &self.kind {
      InstKind::Goto { target } => vec![target.name().to_string()],
      InstKind::GotoCTF { target_t, target_f, .. } => {
        vec![target_t.name().to_string(), target_f.name().to_string()]
      }
      _ => vec![],
    }
  }
}

//=============================================================================
// The interpreter

#[derive(Copy, Clone, PartialEq)]
pub enum Value {
  U32(u32),
  F32(f32),
}
impl Value {
  fn to_u32(self) -> Result<u32, String> {
    match self {
      Value::U32(n) => Ok(n),
      Value::F32(_) => Err("Value::to_u32: this is a F32".to_string()),
    }
  }
  fn to_f32(self) -> Result<f32, String> {
    match self {
      Value::U32(_) => Err("Value::to_f32: this is a U32".to_string()),
      Value::F32(n) => Ok(n),
    }
  }
}
impl fmt::Debug for Value {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Value::U32(n) => write!(fmt, "{}", n),
      Value::F32(n) => write!(fmt, "{}", n),
    }
  }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum RunStage {
  BeforeRegalloc,
  AfterRegalloc,
}

#[derive(Debug)]
pub struct RunResult {
  pub num_steps: usize,
  pub num_spills: usize,
  pub num_reloads: usize,
  pub stdout: String,
  pub ret_value: Option<Value>,
}

/// Runaway loops in broken allocations stop here.
const MAX_STEPS: usize = 10_000_000;

struct IState<'a> {
  func: &'a Func,
  universe: &'a RealRegUniverse,
  nia: InstIx, // Program counter ("next instruction address")
  vregs: Vec<Option<Value>>, // unlimited
  rregs: Vec<Option<Value>>, // [0 .. max_real_regs)
  mem: Vec<Option<Value>>, // [0 .. max_mem)
  slots: Vec<Option<Value>>, // [0..] Spill slots, no upper limit
  safepoints: FxHashMap<InstIx, Vec<Location>>,
  constants: FxHashMap<Reg, Value>, // values of registers living in Constant
  n_insns: usize, // Stats: number of insns executed
  n_spills: usize, // Stats: .. of which are spills
  n_reloads: usize, // Stats: .. of which are reloads
  run_stage: RunStage,
  stdout: String,
  ret_value: Option<Value>,
}

impl<'a> IState<'a> {
  fn new(
    func: &'a Func, universe: &'a RealRegUniverse, max_mem: usize,
    run_stage: RunStage,
  ) -> Self {
    let mut state = IState {
      func,
      universe,
      nia: func.blocks[func.entry_block()].start,
      vregs: Vec::new(),
      rregs: Vec::new(),
      mem: Vec::new(),
      slots: Vec::new(),
      safepoints: func.safepoints.iter().cloned().collect(),
      constants: func.constants(),
      n_insns: 0,
      n_spills: 0,
      n_reloads: 0,
      run_stage,
      stdout: String::new(),
      ret_value: None,
    };
    state.rregs.resize(universe.regs.len(), None);
    state.mem.resize(max_mem, None);
    for (i, arg) in func.args.iter().enumerate() {
      state.set_spill_slot(SpillSlot::new(i as u32), Value::U32(*arg));
    }
    state
  }

  fn get_real_reg(&self, rreg: RealReg) -> Result<Value, String> {
    // No automatic resizing.  If the rreg doesn't exist, just fail.
    match self.rregs.get(rreg.get_index()) {
      None => Err(format!("invalid rreg {:?}", rreg)),
      Some(None) => {
        Err(format!("read of uninit rreg {:?} at nia {:?}", rreg, self.nia))
      }
      Some(Some(val)) => Ok(*val),
    }
  }

  fn set_real_reg(&mut self, rreg: RealReg, val: Value) -> Result<(), String> {
    match self.rregs.get_mut(rreg.get_index()) {
      None => Err(format!("invalid rreg {:?}", rreg)),
      Some(val_p) => {
        *val_p = Some(val);
        Ok(())
      }
    }
  }

  fn get_virtual_reg(&self, vreg: VirtualReg) -> Result<Value, String> {
    if self.run_stage == RunStage::AfterRegalloc {
      return Err(format!("read of {:?} after regalloc", vreg));
    }
    match self.vregs.get(vreg.get_index()) {
      None | Some(None) => Err(format!("read of uninit vreg {:?}", vreg)),
      Some(Some(val)) => Ok(*val),
    }
  }

  fn set_virtual_reg(&mut self, vreg: VirtualReg, val: Value) {
    // Auto-resize the vector if necessary
    let ix = vreg.get_index();
    if ix >= self.vregs.len() {
      self.vregs.resize(ix + 1, None);
    }
    self.vregs[ix] = Some(val);
  }

  fn get_spill_slot(&self, slot: SpillSlot) -> Result<Value, String> {
    match self.slots.get(slot.get_usize()) {
      None | Some(None) => {
        Err(format!("read of uninit slot # {} at {:?}", slot.get(), self.nia))
      }
      Some(Some(val)) => Ok(*val),
    }
  }

  fn set_spill_slot(&mut self, slot: SpillSlot, val: Value) {
    // Auto-resize the vector if necessary
    let ix = slot.get_usize();
    if ix >= self.slots.len() {
      self.slots.resize(ix + 1, None);
    }
    self.slots[ix] = Some(val);
  }

  fn get_location(&self, loc: Location) -> Result<Value, String> {
    match loc {
      Location::Reg(rreg) => self.get_real_reg(rreg),
      Location::Stack(slot) => self.get_spill_slot(slot),
      _ => Err(format!("read of location {:?} at {:?}", loc, self.nia)),
    }
  }

  fn set_location(&mut self, loc: Location, val: Value) -> Result<(), String> {
    match loc {
      Location::Reg(rreg) => self.set_real_reg(rreg, val),
      Location::Stack(slot) => {
        self.set_spill_slot(slot, val);
        Ok(())
      }
      _ => Err(format!("write of location {:?} at {:?}", loc, self.nia)),
    }
  }

  /// Where `reg` in `role` lives in `insn`: its allocated location after
  /// allocation, the register itself before.
  fn operand_loc(
    &self, insn: &Inst, reg: Reg, role: OperandRole,
  ) -> Result<Option<Location>, String> {
    if self.run_stage == RunStage::BeforeRegalloc {
      return Ok(None);
    }
    let mut collector = OperandCollector::new();
    insn.get_operands(&mut collector);
    let ix = collector
      .operands()
      .iter()
      .position(|op| op.reg == reg && op.role == role)
      .ok_or_else(|| format!("{:?} is not an operand of {:?}", reg, insn))?;
    insn
      .locs
      .get(ix)
      .cloned()
      .map(Some)
      .ok_or_else(|| format!("no location for operand {} of {:?}", ix, insn))
  }

  fn read_reg(
    &self, insn: &Inst, reg: Reg, role: OperandRole,
  ) -> Result<Value, String> {
    match self.operand_loc(insn, reg, role)? {
      Some(Location::Constant) => {
        self.constants.get(&reg).cloned().ok_or_else(|| {
          format!("{:?} is not a constant at {:?}", reg, self.nia)
        })
      }
      Some(loc) => self.get_location(loc),
      None => match reg {
        Reg::Virtual(vreg) => self.get_virtual_reg(vreg),
        Reg::Real(rreg) => self.get_real_reg(rreg),
      },
    }
  }

  fn get_reg(&self, insn: &Inst, reg: Reg) -> Result<Value, String> {
    self.read_reg(insn, reg, OperandRole::Input)
  }

  fn set_reg(
    &mut self, insn: &Inst, reg: Reg, val: Value,
  ) -> Result<(), String> {
    match self.operand_loc(insn, reg, OperandRole::Output)? {
      // Rematerialized wherever it is read.
      Some(Location::Constant) => Ok(()),
      Some(loc) => self.set_location(loc, val),
      None => match reg {
        Reg::Virtual(vreg) => {
          self.set_virtual_reg(vreg, val);
          Ok(())
        }
        Reg::Real(rreg) => self.set_real_reg(rreg, val),
      },
    }
  }

  fn get_mem(&self, addr: u32) -> Result<Value, String> {
    // No auto resizing of the memory
    match self.mem.get(addr as usize) {
      None => Err(format!("invalid addr {}", addr)),
      Some(None) => Err(format!("read of uninit mem at addr {}", addr)),
      Some(Some(val)) => Ok(*val),
    }
  }

  fn set_mem(&mut self, addr: u32, val: Value) -> Result<(), String> {
    match self.mem.get_mut(addr as usize) {
      None => Err(format!("invalid addr {}", addr)),
      Some(val_p) => {
        *val_p = Some(val);
        Ok(())
      }
    }
  }

  fn get_ri(&self, insn: &Inst, ri: &RI) -> Result<u32, String> {
    match ri {
      RI::Reg { reg } => self.get_reg(insn, *reg)?.to_u32(),
      RI::Imm { imm } => Ok(*imm),
    }
  }

  fn get_am(&self, insn: &Inst, am: &AM) -> Result<u32, String> {
    match am {
      AM::RI { base, offset } => {
        Ok(self.get_reg(insn, *base)?.to_u32()? + offset)
      }
      AM::RR { base, offset } => Ok(
        self.get_reg(insn, *base)?.to_u32()?
          + self.get_reg(insn, *offset)?.to_u32()?,
      ),
    }
  }

  fn check_safepoint(&self, iix: InstIx) -> Result<(), String> {
    if let Some(locs) = self.safepoints.get(&iix) {
      for loc in locs.iter().filter(|loc| !loc.is_constant()) {
        self.get_location(*loc).map_err(|err| {
          format!("safepoint {:?} lists a dead location: {}", iix, err)
        })?;
      }
    }
    Ok(())
  }

  // Move the interpreter one step forward
  fn step(&mut self) -> Result<bool, String> {
    let mut done = false;

    let iix = self.nia;
    self.nia = iix.plus(1);
    self.n_insns += 1;

    let func = self.func;
    let insn = &func.insns[iix.get_usize()];
    match &insn.kind {
      InstKind::Imm { dst, imm } => self.set_reg(insn, *dst, Value::U32(*imm))?,
      InstKind::ImmF { dst, imm } => {
        self.set_reg(insn, *dst, Value::F32(*imm))?
      }
      InstKind::Copy { dst, src } | InstKind::CopyF { dst, src } => {
        let val = self.get_reg(insn, *src)?;
        self.set_reg(insn, *dst, val)?;
      }
      InstKind::BinOp { op, dst, src_l, src_r } => {
        let src_l_v = self.get_reg(insn, *src_l)?.to_u32()?;
        let src_r_v = self.get_ri(insn, src_r)?;
        self.set_reg(insn, *dst, Value::U32(op.calc(src_l_v, src_r_v)))?;
      }
      InstKind::BinOpM { op, dst, src_r } => {
        let dst_v = self.get_reg(insn, *dst)?.to_u32()?;
        let src_r_v = self.get_ri(insn, src_r)?;
        self.set_reg(insn, *dst, Value::U32(op.calc(dst_v, src_r_v)))?;
      }
      InstKind::BinOpF { op, dst, src_l, src_r } => {
        let src_l_v = self.get_reg(insn, *src_l)?.to_f32()?;
        let src_r_v = self.get_reg(insn, *src_r)?.to_f32()?;
        self.set_reg(insn, *dst, Value::F32(op.calc(src_l_v, src_r_v)))?;
      }
      InstKind::Load { dst, addr } => {
        let addr_v = self.get_am(insn, addr)?;
        let val = self.get_mem(addr_v)?.to_u32()?;
        self.set_reg(insn, *dst, Value::U32(val))?;
      }
      InstKind::LoadF { dst, addr } => {
        let addr_v = self.get_am(insn, addr)?;
        let val = self.get_mem(addr_v)?.to_f32()?;
        self.set_reg(insn, *dst, Value::F32(val))?;
      }
      InstKind::Store { addr, src } | InstKind::StoreF { addr, src } => {
        let addr_v = self.get_am(insn, addr)?;
        let val = self.get_reg(insn, *src)?;
        self.set_mem(addr_v, val)?;
      }
      InstKind::LoadArg { dst, slot } => {
        let val = self.get_spill_slot(*slot)?;
        self.set_reg(insn, *dst, val)?;
      }
      InstKind::Call { dst, args } => {
        self.check_safepoint(iix)?;
        let mut sum = 0u32;
        for arg in args {
          sum = sum.wrapping_add(self.get_reg(insn, *arg)?.to_u32()?);
        }
        if self.run_stage == RunStage::AfterRegalloc {
          for &ix in self.universe.caller_saved.iter() {
            self.rregs[ix] = None;
          }
        }
        if let Some(dst) = dst {
          self.set_reg(insn, *dst, Value::U32(sum))?;
        }
      }
      InstKind::Safepoint { state } => {
        self.check_safepoint(iix)?;
        for reg in state {
          self.read_reg(insn, *reg, OperandRole::State)?;
        }
      }
      InstKind::Goto { target } => {
        self.nia = func.blocks[target.get_block_ix()].start
      }
      InstKind::GotoCTF { cond, target_t, target_f } => {
        let target = if self.get_reg(insn, *cond)?.to_u32()? != 0 {
          target_t
        } else {
          target_f
        };
        self.nia = func.blocks[target.get_block_ix()].start;
      }
      InstKind::PrintS { str } => self.stdout.push_str(str),
      InstKind::PrintI { reg } => {
        let val = self.get_reg(insn, *reg)?.to_u32()?;
        self.stdout.push_str(&format!("{:?}", val));
      }
      InstKind::PrintF { reg } => {
        let val = self.get_reg(insn, *reg)?.to_f32()?;
        self.stdout.push_str(&format!("{:?}", val));
      }
      InstKind::Finish { reg } => {
        self.ret_value = match reg {
          Some(reg) => Some(self.get_reg(insn, *reg)?),
          None => None,
        };
        done = true;
      }
      InstKind::Move { to, from } => {
        let val = self.get_location(*from)?;
        self.set_location(*to, val)?;
        if from.spill().is_some() {
          self.n_reloads += 1;
        }
        if to.spill().is_some() {
          self.n_spills += 1;
        }
      }
      InstKind::Materialize { to, value } => self.set_location(*to, *value)?,
    }
    Ok(done)
  }
}

pub fn run_func(
  f: &Func, who: &str, reg_universe: &RealRegUniverse, run_stage: RunStage,
) -> Result<RunResult, String> {
  info!(
    "Running stage '{}': Func: name='{}' entry='{:?}'",
    who, f.name, f.entry
  );

  let mut istate = IState::new(f, reg_universe, /*max_mem=*/ 1000, run_stage);
  let mut done = false;
  while !done {
    if istate.n_insns >= MAX_STEPS {
      return Err(format!("no finish after {} steps", MAX_STEPS));
    }
    done = istate.step()?;
  }

  info!(
    "Running stage '{}': done.  {} insns, {} spills, {} reloads",
    who, istate.n_insns, istate.n_spills, istate.n_reloads
  );

  Ok(RunResult {
    num_steps: istate.n_insns,
    num_spills: istate.n_spills,
    num_reloads: istate.n_reloads,
    stdout: istate.stdout,
    ret_value: istate.ret_value,
  })
}

//=============================================================================
// Definition of Block and Func, and printing thereof.

#[derive(Clone, Debug)]
pub struct Block {
  pub name: String,
  pub start: InstIx,
  pub len: u32,
}
impl Block {
  pub fn new(name: String, start: InstIx, len: u32) -> Self {
    Self { name, start, len }
  }
}

#[derive(Clone, Debug)]
pub struct Func {
  pub name: String,
  pub entry: Label,
  pub num_virtual_regs: u32,
  pub insns: Vec<Inst>, // indexed by InstIx

  // Before allocation |blocks| are in order of increasing |Block::start|;
  // afterwards they keep their indices but follow the emission order.
  pub blocks: TypedIxVec<BlockIx, Block>, // indexed by BlockIx

  /// Values of the incoming stack arguments, in slots 0, 1, ...
  pub args: Vec<u32>,

  /// After allocation: the locations each safepoint must find alive.
  pub safepoints: Vec<(InstIx, Vec<Location>)>,

  /// Blocks added so far, laid out by `finish`.
  pending: Vec<(String, Vec<Inst>)>,
}

impl Func {
  pub fn new<'a>(name: &'a str) -> Self {
    Func {
      name: name.to_string(),
      entry: Label::Unresolved { name: "".to_string() },
      num_virtual_regs: 0,
      insns: Vec::new(),
      blocks: TypedIxVec::<BlockIx, Block>::new(),
      args: Vec::new(),
      safepoints: Vec::new(),
      pending: Vec::new(),
    }
  }

  pub fn set_entry(&mut self, entry: &str) {
    self.entry = Label::Unresolved { name: entry.to_string() };
  }

  pub fn set_args(&mut self, args: &[u32]) {
    self.args = args.to_vec();
  }

  pub fn print(&self, who: &str) {
    println!("");
    println!("Func {}: name='{}' entry='{:?}' {{", who, self.name, self.entry);
    for (ix, b) in self.blocks.iter().enumerate() {
      if ix > 0 {
        println!("");
      }
      println!("  {:?}:{}", BlockIx::new(ix as u32), b.name);
      for i in b.start.get()..b.start.get() + b.len {
        let ix_i = InstIx::new(i);
        println!("      {:<3?}   {:?}", ix_i, self.insns[i as usize]);
      }
    }
    println!("}}");
  }

  // Get a new VirtualReg name
  pub fn new_virtual_reg(&mut self, rc: RegClass) -> Reg {
    let v = VirtualReg::new(rc, self.num_virtual_regs).to_reg();
    self.num_virtual_regs += 1;
    v
  }

  // Add a block to the Func
  pub fn block<'a>(&mut self, name: &'a str, insns: Vec<Inst>) {
    self.pending.push((name.to_string(), insns));
  }

  /// Every edge from a block with several successors to a block with several
  /// predecessors gets a block of its own that only jumps.
  fn split_critical_edges(&mut self) {
    let mut num_preds = FxHashMap::<String, usize>::default();
    for (_, insns) in self.pending.iter() {
      if let Some(last) = insns.last() {
        for name in last.target_names() {
          *num_preds.entry(name).or_insert(0) += 1;
        }
      }
    }

    let mut blocks = Vec::new();
    for (name, mut insns) in std::mem::replace(&mut self.pending, Vec::new()) {
      let mut new_blocks = Vec::new();
      if let Some(last) = insns.last_mut() {
        let mut targets = last.target_names();
        targets.dedup();
        if targets.len() > 1 {
          for target in targets {
            if num_preds.get(&target).cloned().unwrap_or(0) > 1 {
              let edge_block = format!("{}-to-{}", name, target);
              last.remap_control_flow_target(&target, &edge_block);
              debug!("splitting critical edge {} -> {}", name, target);
              new_blocks.push((edge_block, vec![i_goto(&target)]));
            }
          }
        }
      }
      blocks.push((name, insns));
      blocks.extend(new_blocks);
    }
    self.pending = blocks;
  }

  // All blocks have been added.  Split critical edges, lay the blocks out,
  // resolve labels and we're good to go.
  /* .finish(): check
        - all blocks nonempty
        - all blocks end in i_finish, i_goto or i_goto_ctf
        - no blocks have those insns before the end
        - all referenced blocks actually exist
        - convert references to block numbers
  */
  pub fn finish(&mut self) {
    for (name, insns) in self.pending.iter() {
      match insns.split_last() {
        None => panic!("Func::finish: block {} is empty", name),
        Some((last, rest)) => {
          if !last.is_control_flow() {
            panic!("Func: block {} must end in control flow insn", name);
          }
          if rest.iter().any(|insn| insn.is_control_flow()) {
            panic!("Func: block {} has control flow insn not at end", name);
          }
        }
      }
    }
    self.split_critical_edges();

    for (name, insns) in std::mem::replace(&mut self.pending, Vec::new()) {
      let start = InstIx::new(self.insns.len() as u32);
      let len = insns.len() as u32;
      self.insns.extend(insns);
      self.blocks.push(Block::new(name, start, len));
    }

    // Resolve all labels
    let blocks = &self.blocks;
    let lookup = |name: &str| {
      blocks
        .iter()
        .position(|b| b.name == name)
        .map(|ix| BlockIx::new(ix as u32))
        .unwrap_or_else(|| {
          panic!("Func::finish: can't resolve label name '{}'", name)
        })
    };
    for insn in self.insns.iter_mut() {
      insn.resolve_labels(lookup);
    }
    let entry = lookup(self.entry.name());
    let name = self.entry.name().to_string();
    self.entry = Label::Resolved { name, bix: entry };
  }

  /// Values of the registers defined by immediates, for operands the
  /// allocator left as constants.
  pub fn constants(&self) -> FxHashMap<Reg, Value> {
    let mut constants = FxHashMap::default();
    for insn in self.insns.iter() {
      match insn.kind {
        InstKind::Imm { dst, imm } => {
          constants.insert(dst, Value::U32(imm));
        }
        InstKind::ImmF { dst, imm } => {
          constants.insert(dst, Value::F32(imm));
        }
        _ => {}
      }
    }
    constants
  }

  pub fn update_from_alloc(&mut self, result: RegAllocResult<Func>) {
    let RegAllocResult { insns, target_map, safepoint_maps, .. } = result;
    self.insns = insns;
    // Blocks come out in emission order, so a block ends where the next
    // emitted one starts.
    let mut starts: Vec<(InstIx, BlockIx)> = self
      .blocks
      .range()
      .into_iter()
      .map(|b| (target_map[b], b))
      .collect();
    starts.sort();
    let total = self.insns.len() as u32;
    for (i, &(start, bix)) in starts.iter().enumerate() {
      let end = starts.get(i + 1).map_or(total, |(next, _)| next.get());
      let block = &mut self.blocks[bix];
      block.start = start;
      block.len = end - start.get();
    }
    self.safepoints = safepoint_maps
      .iter()
      .map(|map| {
        (map.insn, map.values.iter().map(|(_, loc)| *loc).collect())
      })
      .collect();
  }
}

pub enum Stmt {
  Vanilla { insn: Inst },
  IfThenElse { cond: Reg, stmts_t: Vec<Stmt>, stmts_e: Vec<Stmt> },
  RepeatUntil { stmts: Vec<Stmt>, cond: Reg },
  WhileDo { cond: Reg, stmts: Vec<Stmt> },
}

// Various handy wrappers, mostly wrappings of i_* functions
pub fn s_if_then_else(
  cond: Reg, stmts_t: Vec<Stmt>, stmts_e: Vec<Stmt>,
) -> Stmt {
  Stmt::IfThenElse { cond, stmts_t, stmts_e }
}
pub fn s_if_then(cond: Reg, stmts_t: Vec<Stmt>) -> Stmt {
  Stmt::IfThenElse { cond, stmts_t, stmts_e: vec![] }
}
pub fn s_repeat_until(stmts: Vec<Stmt>, cond: Reg) -> Stmt {
  Stmt::RepeatUntil { stmts, cond }
}
pub fn s_while_do(cond: Reg, stmts: Vec<Stmt>) -> Stmt {
  Stmt::WhileDo { cond, stmts }
}

pub fn s_vanilla(insn: Inst) -> Stmt {
  Stmt::Vanilla { insn }
}

pub fn s_imm(dst: Reg, imm: u32) -> Stmt {
  s_vanilla(i_imm(dst, imm))
}
pub fn s_immf(dst: Reg, imm: f32) -> Stmt {
  s_vanilla(i_immf(dst, imm))
}
pub fn s_copy(dst: Reg, src: Reg) -> Stmt {
  s_vanilla(i_copy(dst, src))
}
pub fn s_load(dst: Reg, addr: AM) -> Stmt {
  s_vanilla(i_load(dst, addr))
}
pub fn s_loadf(dst: Reg, addr: AM) -> Stmt {
  s_vanilla(i_loadf(dst, addr))
}
pub fn s_store(addr: AM, src: Reg) -> Stmt {
  s_vanilla(i_store(addr, src))
}
pub fn s_storef(addr: AM, src: Reg) -> Stmt {
  s_vanilla(i_storef(addr, src))
}
pub fn s_load_arg(dst: Reg, slot: u32) -> Stmt {
  s_vanilla(i_load_arg(dst, slot))
}
pub fn s_call(dst: Option<Reg>, args: &[Reg]) -> Stmt {
  s_vanilla(i_call(dst, args))
}
pub fn s_safepoint(state: &[Reg]) -> Stmt {
  s_vanilla(i_safepoint(state))
}
pub fn s_print_s<'a>(str: &'a str) -> Stmt {
  s_vanilla(i_print_s(str))
}
pub fn s_print_i(reg: Reg) -> Stmt {
  s_vanilla(i_print_i(reg))
}
pub fn s_print_f(reg: Reg) -> Stmt {
  s_vanilla(i_print_f(reg))
}

pub fn s_add(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_add(dst, src_l, src_r))
}
pub fn s_sub(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_sub(dst, src_l, src_r))
}
pub fn s_mul(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_mul(dst, src_l, src_r))
}
pub fn s_mod(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_mod(dst, src_l, src_r))
}
pub fn s_shr(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_shr(dst, src_l, src_r))
}
pub fn s_and(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_and(dst, src_l, src_r))
}
pub fn s_cmp_eq(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_cmp_eq(dst, src_l, src_r))
}
pub fn s_cmp_lt(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_cmp_lt(dst, src_l, src_r))
}
pub fn s_cmp_le(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_cmp_le(dst, src_l, src_r))
}
pub fn s_cmp_ge(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_cmp_ge(dst, src_l, src_r))
}
pub fn s_cmp_gt(dst: Reg, src_l: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_cmp_gt(dst, src_l, src_r))
}

pub fn s_addm(dst: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_addm(dst, src_r))
}
pub fn s_subm(dst: Reg, src_r: RI) -> Stmt {
  s_vanilla(i_subm(dst, src_r))
}

pub fn s_fadd(dst: Reg, src_l: Reg, src_r: Reg) -> Stmt {
  s_vanilla(i_fadd(dst, src_l, src_r))
}
pub fn s_fsub(dst: Reg, src_l: Reg, src_r: Reg) -> Stmt {
  s_vanilla(i_fsub(dst, src_l, src_r))
}
pub fn s_fmul(dst: Reg, src_l: Reg, src_r: Reg) -> Stmt {
  s_vanilla(i_fmul(dst, src_l, src_r))
}
pub fn s_fdiv(dst: Reg, src_l: Reg, src_r: Reg) -> Stmt {
  s_vanilla(i_fdiv(dst, src_l, src_r))
}

//=============================================================================
// The "blockifier".  This is just to make it easier to write test cases, by
// allowing direct use of if-then-else, do-while and repeat-until.  It is
// otherwise entirely unrelated to the register allocator proper.

pub struct Blockifier {
  name: String,
  blocks: Vec<Vec<Inst>>,
  num_virtual_regs: u32,
  args: Vec<u32>,
}

fn make_text_label_str(n: usize) -> String {
  "L".to_string() + &n.to_string()
}

impl Blockifier {
  pub fn new<'a>(name: &'a str) -> Self {
    Self {
      name: name.to_string(),
      blocks: vec![],
      num_virtual_regs: 0,
      args: vec![],
    }
  }

  // Get a new VirtualReg name
  pub fn new_virtual_reg(&mut self, rc: RegClass) -> Reg {
    let v = VirtualReg::new(rc, self.num_virtual_regs).to_reg();
    self.num_virtual_regs += 1;
    v
  }

  pub fn set_args(&mut self, args: &[u32]) {
    self.args = args.to_vec();
  }

  // Recursive worker function, which flattens out the control flow,
  // producing a set of blocks
  fn blockify(&mut self, stmts: Vec<Stmt>) -> (usize, usize) {
    let entry_bno = self.blocks.len();
    let mut curr_bno = entry_bno;
    self.blocks.push(Vec::new());
    for s in stmts {
      match s {
        Stmt::Vanilla { insn } => {
          self.blocks[curr_bno].push(insn);
        }
        Stmt::IfThenElse { cond, stmts_t, stmts_e } => {
          let (t_ent, t_exit) = self.blockify(stmts_t);
          let (e_ent, e_exit) = self.blockify(stmts_e);
          let cont = self.blocks.len();
          self.blocks.push(Vec::new());
          self.blocks[t_exit].push(i_goto(&make_text_label_str(cont)));
          self.blocks[e_exit].push(i_goto(&make_text_label_str(cont)));
          self.blocks[curr_bno].push(i_goto_ctf(
            cond,
            &make_text_label_str(t_ent),
            &make_text_label_str(e_ent),
          ));
          curr_bno = cont;
        }
        Stmt::RepeatUntil { stmts, cond } => {
          let (s_ent, s_exit) = self.blockify(stmts);
          self.blocks[curr_bno].push(i_goto(&make_text_label_str(s_ent)));
          let cont = self.blocks.len();
          self.blocks.push(Vec::new());
          self.blocks[s_exit].push(i_goto_ctf(
            cond,
            &make_text_label_str(cont),
            &make_text_label_str(s_ent),
          ));
          curr_bno = cont;
        }
        Stmt::WhileDo { cond, stmts } => {
          let cond_block = self.blocks.len();
          self.blocks.push(Vec::new());
          self.blocks[curr_bno].push(i_goto(&make_text_label_str(cond_block)));
          let (s_ent, s_exit) = self.blockify(stmts);
          self.blocks[s_exit].push(i_goto(&make_text_label_str(cond_block)));
          let cont = self.blocks.len();
          self.blocks.push(Vec::new());
          self.blocks[cond_block].push(i_goto_ctf(
            cond,
            &make_text_label_str(s_ent),
            &make_text_label_str(cont),
          ));
          curr_bno = cont;
        }
      }
    }
    (entry_bno, curr_bno)
  }

  // The main external function.  Convert the given statements, into a Func.
  pub fn finish(&mut self, stmts: Vec<Stmt>, ret: Option<Reg>) -> Func {
    let (ent_bno, exit_bno) = self.blockify(stmts);
    self.blocks[exit_bno].push(i_finish(ret));

    let mut cleaned_up: Vec<Option<Vec<Inst>>> =
      std::mem::replace(&mut self.blocks, Vec::new())
        .into_iter()
        .map(Some)
        .collect();

    // Repeatedly, look for a block other than the entry that simply jumps
    // to another one, forget about it and apply the redirection to all the
    // rest.  Critical edges this creates are split again by Func::finish.
    loop {
      let mut redir: Option<(usize, String)> = None;
      for (n, maybe_b) in cleaned_up.iter().enumerate() {
        let b = match maybe_b {
          Some(b) if n != ent_bno => b,
          _ => continue,
        };
        if b.len() == 1 {
          if let InstKind::Goto { target: Label::Unresolved { name } } =
            &b[0].kind
          {
            if *name != make_text_label_str(n) {
              redir = Some((n, name.clone()));
              break;
            }
          }
        }
      }

      match redir {
        None => break,
        Some((from, to)) => {
          cleaned_up[from] = None;
          for insns in cleaned_up.iter_mut().flatten() {
            for insn in insns.iter_mut() {
              insn.remap_control_flow_target(&make_text_label_str(from), &to);
            }
          }
        }
      }
    }

    // Convert (ent_bno, exit_bno, cleaned_up) into a Func
    let mut func = Func::new(&self.name);
    func.set_entry(&make_text_label_str(ent_bno));
    func.set_args(&self.args);
    func.num_virtual_regs = self.num_virtual_regs;
    for (n, mb_insns) in cleaned_up.into_iter().enumerate() {
      if let Some(insns) = mb_insns {
        func.block(&make_text_label_str(n), insns);
      }
    }

    func.finish();

    func
  }
}

// --------------------------------------------------
// Implementation of `Function` trait for test cases.

impl Function for Func {
  type Inst = Inst;
  type Const = Value;

  fn insns(&self) -> &[Inst] {
    &self.insns
  }

  fn entry_block(&self) -> BlockIx {
    self.entry.get_block_ix()
  }

  fn blocks(&self) -> MyRange<BlockIx> {
    self.blocks.range()
  }

  /// Provide the range of instruction indices contained in each block.
  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx> {
    MyRange::new(self.blocks[block].start, self.blocks[block].len as usize)
  }

  /// Get CFG successors: indexed by block, provide a list of successor blocks.
  fn block_succs(&self, block: BlockIx) -> Cow<[BlockIx]> {
    let last_insn = self.blocks[block].start.plus(self.blocks[block].len - 1);
    Cow::Owned(self.insns[last_insn.get_usize()].get_targets())
  }

  fn is_jump(&self, insn: &Inst) -> bool {
    match insn.kind {
      InstKind::Goto { .. } => true,
      _ => false,
    }
  }

  fn get_operands(&self, insn: &Inst, collector: &mut OperandCollector) {
    insn.get_operands(collector);
  }

  fn destroys_caller_saved(&self, insn: &Inst) -> bool {
    match insn.kind {
      InstKind::Call { .. } => true,
      _ => false,
    }
  }

  fn is_safepoint(&self, insn: &Inst) -> bool {
    match insn.kind {
      InstKind::Call { .. } | InstKind::Safepoint { .. } => true,
      _ => false,
    }
  }

  /// Allow the regalloc to query whether this is a move.
  fn is_move(&self, insn: &Inst) -> Option<(Reg, Reg)> {
    match insn.kind {
      InstKind::Copy { dst, src } | InstKind::CopyF { dst, src } => {
        Some((dst, src))
      }
      _ => None,
    }
  }

  fn constant_def(&self, insn: &Inst) -> Option<Value> {
    match insn.kind {
      InstKind::Imm { imm, .. } => Some(Value::U32(imm)),
      InstKind::ImmF { imm, .. } => Some(Value::F32(imm)),
      _ => None,
    }
  }

  fn incoming_stack_arg(&self, insn: &Inst) -> Option<SpillSlot> {
    match insn.kind {
      InstKind::LoadArg { slot, .. } => Some(slot),
      _ => None,
    }
  }

  fn num_incoming_stack_slots(&self) -> u32 {
    self.args.len() as u32
  }

  fn get_num_vregs(&self) -> usize {
    self.num_virtual_regs as usize
  }

  fn func_liveins(&self) -> Vec<RealReg> {
    Vec::new()
  }

  /// For our simple test ISA, every value occupies one spill slot.
  fn get_spillslot_size(&self, _regclass: RegClass) -> u32 {
    1
  }

  fn assign_locations(&self, insn: &mut Inst, locations: &[Location]) {
    insn.locs = locations.to_vec();
  }

  fn gen_move(
    &self, to: Location, from: Location, _vreg: Option<VirtualReg>,
  ) -> Inst {
    Inst::new(InstKind::Move { to, from })
  }

  fn gen_materialize(
    &self, to: Location, constant: &Value, _vreg: Option<VirtualReg>,
  ) -> Inst {
    Inst::new(InstKind::Materialize { to, value: *constant })
  }
}

// Create a universe for testing, with num_i32 |I32| class regs and num_f32
// |F32| class regs. The upper half of each class is destroyed by calls.

pub fn make_universe(num_i32: usize, num_f32: usize) -> RealRegUniverse {
  let total_regs = num_i32 + num_f32;
  if total_regs >= 256 {
    panic!("make_universe: too many regs, cannot represent");
  }

  let mut regs = Vec::<(RealReg, String)>::new();
  let mut allocable_by_class = [None; NUM_REG_CLASSES];
  let mut caller_saved = Vec::new();

  for &(class, count, prefix) in
    [(RegClass::I32, num_i32, "r"), (RegClass::F32, num_f32, "f")].iter()
  {
    if count == 0 {
      continue;
    }
    let first = regs.len();
    for i in 0..count {
      let index = regs.len();
      if i >= count - count / 2 {
        caller_saved.push(index);
      }
      regs.push((RealReg::new(class, index as u8), format!("{}{}", prefix, i)));
    }
    allocable_by_class[class.rc_to_usize()] = Some((first, regs.len() - 1));
  }

  debug_assert!(regs.len() == total_regs);

  let allocable = regs.len();
  let univ = RealRegUniverse {
    regs,
    // for this example, all regs are allocable
    allocable,
    allocable_by_class,
    caller_saved,
  };
  univ.check_is_sane();

  univ
}
