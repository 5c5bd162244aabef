/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! This is the top level interface for the allocator.

use smallvec::SmallVec;

use std::borrow::Cow;
use std::fmt;

use crate::linear_scan;

// Stuff that is defined by the library

// Sets and maps of things.  We can refine these later; but for now the
// interface needs some way to speak about them, so let's use the
// library-provided versions.

pub use crate::data_structures::Map;
pub use crate::data_structures::Set;

// Register classes

pub use crate::data_structures::RegClass;
pub use crate::data_structures::NUM_REG_CLASSES;

// Registers, both real and virtual, and ways to create them

pub use crate::data_structures::Reg;

pub use crate::data_structures::RealReg;
pub use crate::data_structures::VirtualReg;

// Spill slots and value locations

pub use crate::data_structures::Location;
pub use crate::data_structures::SpillSlot;

// The "register universe".  This describes the registers available to the
// allocator.

pub use crate::data_structures::RealRegUniverse;

// Instruction and block indices, and ranges over them.

pub use crate::data_structures::BlockIx;
pub use crate::data_structures::InstIx;
pub use crate::data_structures::MyRange;
pub use crate::data_structures::TypedIxVec;

pub use crate::analysis::{AnalysisError, LiveinReport};
pub use crate::checker::{VerifierError, VerifierErrors};

//=============================================================================
// Operands: how a client describes the registers an instruction touches.

/// The role of a register occurrence within one instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperandRole {
  /// Read at the start of the instruction.
  Input,
  /// Read, and must stay intact until after the instruction (typically an
  /// argument that lives across a call).
  Alive,
  /// Scratch register clobbered by the instruction.
  Temp,
  /// Written by the instruction.
  Output,
  /// Kept alive across the instruction for deoptimization state; does not
  /// need a register.
  State,
}

/// Operand flags.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OperandFlags(u8);

impl OperandFlags {
  pub const NONE: OperandFlags = OperandFlags(0);
  /// The operand is only accepted in a register.
  pub const REG: OperandFlags = OperandFlags(1);
  /// The operand may also be given as a stack slot.
  pub const STACK: OperandFlags = OperandFlags(2);
  /// An output and an input both carrying this flag want the same location.
  pub const HINT: OperandFlags = OperandFlags(4);

  pub fn contains(self, other: OperandFlags) -> bool {
    self.0 & other.0 == other.0
  }
}

impl std::ops::BitOr for OperandFlags {
  type Output = OperandFlags;
  fn bitor(self, other: OperandFlags) -> OperandFlags {
    OperandFlags(self.0 | other.0)
  }
}

impl fmt::Debug for OperandFlags {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut names = Vec::new();
    if self.contains(OperandFlags::REG) {
      names.push("reg");
    }
    if self.contains(OperandFlags::STACK) {
      names.push("stack");
    }
    if self.contains(OperandFlags::HINT) {
      names.push("hint");
    }
    write!(fmt, "{{{}}}", names.join(","))
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Operand {
  pub reg: Reg,
  pub role: OperandRole,
  pub flags: OperandFlags,
}

/// Receives the operands of one instruction from `Function::get_operands`.
/// Their order is the order in which `Function::assign_locations` later
/// gets the chosen locations.
#[derive(Default)]
pub struct OperandCollector {
  operands: SmallVec<[Operand; 8]>,
}

impl OperandCollector {
  pub fn new() -> Self {
    Self { operands: SmallVec::new() }
  }
  pub fn add(&mut self, reg: Reg, role: OperandRole, flags: OperandFlags) {
    self.operands.push(Operand { reg, role, flags });
  }
  pub fn add_input(&mut self, reg: Reg, flags: OperandFlags) {
    self.add(reg, OperandRole::Input, flags);
  }
  pub fn add_alive(&mut self, reg: Reg, flags: OperandFlags) {
    self.add(reg, OperandRole::Alive, flags);
  }
  pub fn add_temp(&mut self, reg: Reg, flags: OperandFlags) {
    self.add(reg, OperandRole::Temp, flags);
  }
  pub fn add_output(&mut self, reg: Reg, flags: OperandFlags) {
    self.add(reg, OperandRole::Output, flags);
  }
  pub fn add_state(&mut self, reg: Reg) {
    self.add(reg, OperandRole::State, OperandFlags::STACK);
  }
  pub fn operands(&self) -> &[Operand] {
    &self.operands
  }
  pub(crate) fn take(&mut self) -> SmallVec<[Operand; 8]> {
    std::mem::replace(&mut self.operands, SmallVec::new())
  }
}

//=============================================================================
// The Function trait.

/// A trait defined by the regalloc client to provide access to its
/// machine-instruction / CFG representation.
pub trait Function {
  /// Regalloc is parameterized on F: Function and so can use the projected
  /// type F::Inst.
  type Inst: Clone + fmt::Debug;

  /// A constant the client knows how to rematerialize.
  type Const: Clone + fmt::Debug;

  // -------------
  // CFG traversal
  // -------------

  /// Allow access to the underlying vector of instructions.
  fn insns(&self) -> &[Self::Inst];

  /// Get an instruction with a type-safe InstIx index.
  fn get_insn(&self, insn: InstIx) -> &Self::Inst {
    &self.insns()[insn.get_usize()]
  }

  /// Allow iteration over basic blocks (in instruction order).
  fn blocks(&self) -> MyRange<BlockIx>;

  /// Get the index of the entry block.
  fn entry_block(&self) -> BlockIx;

  /// Provide the range of instruction indices contained in each block.
  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx>;

  /// Get CFG successors for a given block.
  fn block_succs(&self, block: BlockIx) -> Cow<[BlockIx]>;

  /// Probability that control leaves `block` through its `succ_ix`-th
  /// successor. Defaults to an even split.
  fn branch_probability(&self, block: BlockIx, succ_ix: usize) -> f64 {
    let _ = succ_ix;
    1.0 / self.block_succs(block).len().max(1) as f64
  }

  /// Relative execution frequency of a block, if the client knows it. The
  /// allocator estimates it from the branch probabilities otherwise.
  fn block_frequency(&self, _block: BlockIx) -> Option<f64> {
    None
  }

  /// Exception handlers are placed last in the allocation order.
  fn is_exception_handler(&self, _block: BlockIx) -> bool {
    false
  }

  /// Is this an unconditional jump to the block's single successor?
  fn is_jump(&self, insn: &Self::Inst) -> bool;

  // --------------------------
  // Instruction register slots
  // --------------------------

  /// Report every register occurrence of `insn`.
  fn get_operands(&self, insn: &Self::Inst, collector: &mut OperandCollector);

  /// Does `insn` destroy all caller-saved registers (a call)?
  fn destroys_caller_saved(&self, _insn: &Self::Inst) -> bool {
    false
  }

  /// Does `insn` need a map of the live values' locations?
  fn is_safepoint(&self, _insn: &Self::Inst) -> bool {
    false
  }

  /// Determine whether an instruction is a move; if so, return the
  /// destination and source registers.
  fn is_move(&self, insn: &Self::Inst) -> Option<(Reg, Reg)>;

  /// If `insn` only defines its (single) output as a constant, return the
  /// constant so that the value can be rematerialized instead of spilled.
  fn constant_def(&self, _insn: &Self::Inst) -> Option<Self::Const> {
    None
  }

  /// If `insn` only loads an incoming argument from the stack, return the
  /// slot it loads from.
  fn incoming_stack_arg(&self, _insn: &Self::Inst) -> Option<SpillSlot> {
    None
  }

  /// Number of spill slots at the bottom of the frame that belong to
  /// incoming stack arguments; the allocator numbers its own slots after
  /// them.
  fn num_incoming_stack_slots(&self) -> u32 {
    0
  }

  /// Get the number of virtual registers of the function.
  fn get_num_vregs(&self) -> usize;

  /// Real registers holding a value on function entry.
  fn func_liveins(&self) -> Vec<RealReg>;

  // --------------
  // Spills/reloads
  // --------------

  /// How many logical spill slots does the given regclass require?  E.g., on
  /// a 64-bit machine, spill slots may nominally be 64-bit words, but a
  /// 128-bit vector value will require two slots.  The regalloc will always
  /// align on this size.
  fn get_spillslot_size(&self, regclass: RegClass) -> u32;

  /// Rewrite the operands of `insn`; `locations` follows the order in which
  /// `get_operands` reported them.
  fn assign_locations(&self, insn: &mut Self::Inst, locations: &[Location]);

  /// Generate a copy between two locations. Either side may be a register or
  /// a stack slot, and both sides may be stack slots.
  fn gen_move(
    &self, to: Location, from: Location, vreg: Option<VirtualReg>,
  ) -> Self::Inst;

  /// Generate an instruction that writes `constant` into `to`.
  fn gen_materialize(
    &self, to: Location, constant: &Self::Const, vreg: Option<VirtualReg>,
  ) -> Self::Inst;
}

//=============================================================================
// Configuration.

/// Switches for the optional parts of the allocator.
#[derive(Clone, Debug)]
pub struct AllocatorOptions {
  /// Use the walker variant that splits intervals again at block boundaries
  /// where the predecessor left the value somewhere else.
  pub optimizing_walker: bool,
  /// Move spill stores of multiply spilled values to a dominating block of
  /// lower frequency.
  pub optimize_spill_position: bool,
  /// Place the header of a single-latch loop after its latch in the
  /// emission order.
  pub reorder_loops: bool,
  /// Check interval invariants and replay the allocated code.
  pub detailed_verification: bool,
  pub max_liveness_iterations: usize,
}

impl Default for AllocatorOptions {
  fn default() -> Self {
    Self {
      optimizing_walker: true,
      optimize_spill_position: true,
      reorder_loops: true,
      detailed_verification: false,
      max_liveness_iterations: 50,
    }
  }
}

//=============================================================================
// Results.

/// Locations of the values live across one safepoint instruction.
#[derive(Clone, Debug)]
pub struct SafepointMap {
  /// Index of the safepoint in the output instruction stream.
  pub insn: InstIx,
  /// Live virtual values with their location at the safepoint.
  pub values: Vec<(VirtualReg, Location)>,
  /// Spill slots known to hold an up-to-date copy of a live value.
  pub spill_slots: Vec<(VirtualReg, SpillSlot)>,
}

/// Counters gathered during allocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocStats {
  pub num_intervals: usize,
  pub num_splits: usize,
  pub num_spill_slots: usize,
  pub num_spill_stores: usize,
  pub num_reloads: usize,
  pub num_edge_moves: usize,
  pub num_moves_eliminated: usize,
}

/// The result of register allocation.
pub struct RegAllocResult<F: Function> {
  /// A new sequence of instructions with all register slots filled with real
  /// registers or stack slots, and with spill/reload/move instructions
  /// inserted.
  pub insns: Vec<F::Inst>,

  /// Basic-block start indices for the new instruction list, indexed by the
  /// original basic block indices.
  pub target_map: TypedIxVec<BlockIx, InstIx>,

  /// Full mapping from new instruction indices to original instruction
  /// indices; `None` for allocator-inserted instructions.
  pub orig_insn_map: TypedIxVec<InstIx, Option<InstIx>>,

  /// The block order used for allocation.
  pub alloc_order: Vec<BlockIx>,

  /// The block order code should be emitted in.
  pub emission_order: Vec<BlockIx>,

  /// Which real registers were overwritten?
  pub clobbered_registers: Set<RealReg>,

  /// How many spill slots were used, counting incoming stack arguments?
  pub num_spill_slots: u32,

  /// Live value locations for each safepoint instruction.
  pub safepoint_maps: Vec<SafepointMap>,

  pub stats: AllocStats,
}

//=============================================================================
// Errors.

#[derive(Clone, Debug)]
pub enum RegAllocError {
  Analysis(AnalysisError),
  /// A must-have-register use at the very start of an interval found every
  /// register of its class blocked.
  OutOfRegisters {
    operand: Reg,
    class: RegClass,
    position: u32,
  },
  Verifier(VerifierErrors),
  Other(String),
}

impl fmt::Display for RegAllocError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RegAllocError::Analysis(err) => write!(f, "analysis error: {}", err),
      RegAllocError::OutOfRegisters { operand, class, position } => write!(
        f,
        "out of {} registers for {:?} at position {}",
        class.long_name(),
        operand,
        position
      ),
      RegAllocError::Verifier(errs) => write!(f, "verifier errors: {}", errs),
      RegAllocError::Other(msg) => write!(f, "other error: {}", msg),
    }
  }
}

impl std::error::Error for RegAllocError {}

impl From<AnalysisError> for RegAllocError {
  fn from(err: AnalysisError) -> Self {
    RegAllocError::Analysis(err)
  }
}

//=============================================================================
// Entry point.

/// Allocate registers for a function's code, given a universe of real
/// registers that we are allowed to use.
///
/// The control flow graph must not contain critical edges, every block must
/// be reachable from the entry, and every value must be defined before it is
/// used on every path.
#[inline(never)]
pub fn allocate_registers<F: Function>(
  func: &F, rreg_universe: &RealRegUniverse, options: &AllocatorOptions,
) -> Result<RegAllocResult<F>, RegAllocError> {
  linear_scan::run(func, rreg_universe, options)
}
