/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Checker: verifies the intervals produced by the allocator, and that the
//! allocated code with its inserted moves computes the same data flow as
//! the original, virtual-register based code.
//!
//! The static part looks at the intervals only:
//!
//!   - every range is non-empty, and ranges are ascending and disjoint;
//!   - every split child has a location, and the children of a value tile
//!     the ranges the value had before allocation, without overlapping;
//!   - no two intervals holding the same register overlap.
//!
//! The dynamic part tracks symbolic values through the allocated code.
//! Every original instruction generates the symbol `Vn` into the location
//! chosen for its output `Vn`; moves, stores and reloads inserted by the
//! allocator copy symbols from one location to another; materializations
//! generate the symbol of the value they recompute. The state at each
//! program point is
//!
//!   - map `L` of: location (register or spill slot) -> lattice value
//!
//! with the lattice top > Rn/Vn symbols (unordered) > bottom. At control
//! flow joins two different symbols meet to "conflicted". Once the fixpoint
//! is found, every input of every instruction must find its own symbol in
//! the location it was assigned.

use log::{debug, trace};

use std::collections::VecDeque;
use std::fmt;

use crate::data_structures::{
  BlockIx, InstIx, IntId, Location, Map, RealReg, Reg, TypedIxVec,
};
use crate::inst_stream::{
  operand_interval_at, BlockStreams, EditKind, StreamItem,
};
use crate::interface::{Function, OperandRole, RegAllocError};
use crate::intervals::{Intervals, Range};
use crate::linear_scan::LinearScan;

//=============================================================================
// Errors

#[derive(Clone, Debug)]
pub enum VerifierError {
  /// An interval has an empty range, or ranges out of order.
  BadRanges { reg: Reg, position: u32 },
  /// A split child covering `position` was never given a location.
  NoLocation { reg: Reg, position: u32 },
  /// Two split children of one value overlap.
  SplitChildrenOverlap { reg: Reg, position: u32 },
  /// The split children of a value do not cover exactly the ranges the
  /// value had before allocation.
  SplitChildrenMismatch { reg: Reg },
  /// Two intervals assigned the same register overlap.
  LocationOverlap { first: Reg, second: Reg, location: RealReg, position: u32 },
  /// An instruction reads `location` expecting `expected`, but the location
  /// holds another value, or no known value at all.
  WrongValue {
    block: BlockIx,
    insn: InstIx,
    location: Location,
    expected: Reg,
    found: Option<Reg>,
  },
}

impl fmt::Display for VerifierError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      VerifierError::BadRanges { reg, position } => {
        write!(f, "bad ranges for {:?} at {}", reg, position)
      }
      VerifierError::NoLocation { reg, position } => {
        write!(f, "{:?} has no location at {}", reg, position)
      }
      VerifierError::SplitChildrenOverlap { reg, position } => {
        write!(f, "split children of {:?} overlap at {}", reg, position)
      }
      VerifierError::SplitChildrenMismatch { reg } => {
        write!(f, "split children of {:?} do not match its ranges", reg)
      }
      VerifierError::LocationOverlap { first, second, location, position } => {
        write!(
          f,
          "{:?} and {:?} both hold {:?} at {}",
          first, second, location, position
        )
      }
      VerifierError::WrongValue { block, insn, location, expected, found } => {
        write!(
          f,
          "{:?} in {:?} expects {:?} in {:?}, found ",
          insn, block, expected, location
        )?;
        match found {
          Some(reg) => write!(f, "{:?}", reg),
          None => write!(f, "no value"),
        }
      }
    }
  }
}

#[derive(Clone, Debug)]
pub struct VerifierErrors(pub Vec<VerifierError>);

impl fmt::Display for VerifierErrors {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    for (i, err) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, "; ")?;
      }
      write!(f, "{}", err)?;
    }
    Ok(())
  }
}

//=============================================================================
// Static checks on intervals

/// The ranges of every operand before allocation, indexed by operand.
pub(crate) type OriginalRanges = Vec<Vec<Range>>;

pub(crate) fn snapshot_ranges(intervals: &Intervals) -> OriginalRanges {
  (0..intervals.num_operands)
    .map(|ix| intervals[IntId::new(ix as u32)].ranges.clone())
    .collect()
}

fn check_ranges(ranges: &[Range]) -> Option<u32> {
  for (i, range) in ranges.iter().enumerate() {
    if range.from >= range.to {
      return Some(range.from);
    }
    if i > 0 && ranges[i - 1].to > range.from {
      return Some(range.from);
    }
  }
  None
}

/// Appends `ranges` to `into`, joining ranges that touch.
fn append_ranges(into: &mut Vec<Range>, ranges: &[Range]) {
  for &range in ranges {
    match into.last_mut() {
      Some(last) if last.to == range.from => last.to = range.to,
      _ => into.push(range),
    }
  }
}

fn check_split_family(
  intervals: &Intervals, parent: IntId, original: &[Range],
  errors: &mut Vec<VerifierError>,
) {
  let reg = intervals[parent].reg;
  let mut children = if intervals[parent].split_children.is_empty() {
    vec![parent]
  } else {
    intervals[parent].split_children.clone()
  };
  children.retain(|&child| !intervals[child].is_empty());
  children.sort_by_key(|&child| intervals[child].from());

  let mut covered = Vec::new();
  for (i, &child) in children.iter().enumerate() {
    let interval = &intervals[child];
    if interval.location.is_none() {
      errors.push(VerifierError::NoLocation { reg, position: interval.from() });
    }
    if i > 0 && intervals[children[i - 1]].to() > interval.from() {
      errors.push(VerifierError::SplitChildrenOverlap {
        reg,
        position: interval.from(),
      });
    }
    append_ranges(&mut covered, &interval.ranges);
  }
  if covered.as_slice() != original {
    errors.push(VerifierError::SplitChildrenMismatch { reg });
  }
}

/// Checks range well-formedness, the split families against the ranges the
/// values had before allocation, and that no register is given to two
/// overlapping intervals.
#[inline(never)]
pub(crate) fn verify_intervals<F: Function>(
  ls: &LinearScan<F>, original: &OriginalRanges,
) -> Vec<VerifierError> {
  let intervals = &ls.intervals;
  let mut errors = Vec::new();

  for id in intervals.ids() {
    if let Some(position) = check_ranges(&intervals[id].ranges) {
      let reg = intervals[id].reg;
      errors.push(VerifierError::BadRanges { reg, position });
    }
  }

  for operand in ls.lir.num_real..original.len() {
    let parent = ls.operand_interval(operand);
    if !original[operand].is_empty() {
      check_split_family(intervals, parent, &original[operand], &mut errors);
    }
  }

  let mut by_reg = Map::<RealReg, Vec<IntId>>::default();
  for id in intervals.ids() {
    let interval = &intervals[id];
    if let (false, Some(rreg)) = (interval.is_empty(), interval.location.reg())
    {
      by_reg.entry(rreg).or_insert_with(Vec::new).push(id);
    }
  }
  let mut regs: Vec<RealReg> = by_reg.keys().cloned().collect();
  regs.sort();
  for rreg in regs {
    let ids = &by_reg[&rreg];
    for (i, &first) in ids.iter().enumerate() {
      for &second in ids[i + 1..].iter() {
        let (a, b) = (&intervals[first], &intervals[second]);
        if let Some(position) = a.intersects_at(b) {
          errors.push(VerifierError::LocationOverlap {
            first: intervals[first].reg,
            second: intervals[second].reg,
            location: rreg,
            position,
          });
        }
      }
    }
  }

  debug!("interval verification: {} errors", errors.len());
  errors
}

//=============================================================================
// Replaying the allocated code

/// Abstract state for a location.
///
/// Forms a lattice with \top (`Unknown`), \bot (`Conflicted`), and a number
/// of mutually unordered value-points in between, one per real or virtual
/// register. Any two different registers meet to \bot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CheckerValue {
  /// "top" value: this location has no known value.
  Unknown,
  /// "bottom" value: this location has a conflicted value.
  Conflicted,
  /// This location holds the value defined into the given register.
  Reg(Reg),
}

impl CheckerValue {
  /// Meet function of the abstract-interpretation value lattice.
  fn meet(&self, other: &CheckerValue) -> CheckerValue {
    match (self, other) {
      (&CheckerValue::Unknown, _) => *other,
      (_, &CheckerValue::Unknown) => *self,
      (&CheckerValue::Conflicted, _) => *self,
      (_, &CheckerValue::Conflicted) => *other,
      _ if *self == *other => *self,
      _ => CheckerValue::Conflicted,
    }
  }

  fn as_reg(&self) -> Option<Reg> {
    match self {
      CheckerValue::Reg(reg) => Some(*reg),
      _ => None,
    }
  }
}

/// The value of every location at one program point. Absent locations are
/// `Unknown`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CheckerState {
  values: Map<Location, CheckerValue>,
}

impl CheckerState {
  fn new() -> Self {
    Self { values: Map::default() }
  }

  fn get(&self, loc: Location) -> CheckerValue {
    self.values.get(&loc).cloned().unwrap_or(CheckerValue::Unknown)
  }

  fn set(&mut self, loc: Location, value: CheckerValue) {
    match loc {
      Location::Reg(_) | Location::Stack(_) => {
        self.values.insert(loc, value);
      }
      Location::None | Location::Constant => {}
    }
  }

  /// Merges the state of another predecessor; returns whether this state
  /// changed.
  fn meet_with(&mut self, other: &CheckerState) -> bool {
    let mut changed = false;
    for (&loc, other_value) in other.values.iter() {
      let value = self.get(loc);
      let met = value.meet(other_value);
      if met != value {
        self.values.insert(loc, met);
        changed = true;
      }
    }
    changed
  }
}

struct Replay<'l, 'a, F: Function> {
  ls: &'l LinearScan<'a, F>,
  streams: &'l BlockStreams,
  caller_saved: Vec<RealReg>,
}

impl<'l, 'a, F: Function> Replay<'l, 'a, F> {
  fn edit(&self, state: &mut CheckerState, kind: EditKind) {
    let intervals = &self.ls.intervals;
    match kind {
      EditKind::Move { from, to } => {
        let value = match intervals[from].location {
          Location::Constant => CheckerValue::Reg(intervals[to].reg),
          loc => state.get(loc),
        };
        state.set(intervals[to].location, value);
      }
      EditKind::Materialize { to, .. } => {
        state.set(intervals[to].location, CheckerValue::Reg(intervals[to].reg))
      }
      EditKind::Store { from, slot } => {
        let value = state.get(intervals[from].location);
        state.set(Location::Stack(slot), value);
      }
    }
  }

  fn insn(
    &self, state: &mut CheckerState, block: BlockIx, iix: InstIx,
    errors: Option<&mut Vec<VerifierError>>,
  ) -> Result<(), RegAllocError> {
    let ls = self.ls;
    let op_id = ls.lir.insn_id[iix];
    let ops = &ls.lir.operands[iix];

    let mut locs = Vec::with_capacity(ops.len());
    for op in ops.iter() {
      let loc = match op.reg {
        Reg::Real(rreg) => Location::Reg(rreg),
        Reg::Virtual(_) => {
          ls.intervals[operand_interval_at(ls, op, op_id)?].location
        }
      };
      locs.push(loc);
    }

    if let Some(errors) = errors {
      for (op, &loc) in ops.iter().zip(locs.iter()) {
        let reads = match op.role {
          OperandRole::Input | OperandRole::Alive | OperandRole::State => true,
          OperandRole::Output | OperandRole::Temp => false,
        };
        if !reads || op.reg.is_real() || loc.is_constant() {
          continue;
        }
        let found = state.get(loc);
        if found != CheckerValue::Reg(op.reg) {
          trace!("{:?}: {:?} holds {:?}, not {:?}", iix, loc, found, op.reg);
          errors.push(VerifierError::WrongValue {
            block,
            insn: iix,
            location: loc,
            expected: op.reg,
            found: found.as_reg(),
          });
        }
      }
    }

    if ls.func.destroys_caller_saved(ls.func.get_insn(iix)) {
      for &rreg in self.caller_saved.iter() {
        state.set(Location::Reg(rreg), CheckerValue::Conflicted);
      }
    }
    for (op, &loc) in ops.iter().zip(locs.iter()) {
      match op.role {
        OperandRole::Temp => state.set(loc, CheckerValue::Conflicted),
        OperandRole::Output => state.set(loc, CheckerValue::Reg(op.reg)),
        _ => {}
      }
    }
    Ok(())
  }

  fn block(
    &self, state: &mut CheckerState, block: BlockIx,
    mut errors: Option<&mut Vec<VerifierError>>,
  ) -> Result<(), RegAllocError> {
    for item in self.streams[block].iter() {
      match *item {
        StreamItem::Insn(iix) => {
          self.insn(state, block, iix, errors.as_mut().map(|e| &mut **e))?
        }
        StreamItem::Edit(_, kind) => self.edit(state, kind),
      }
    }
    Ok(())
  }
}

/// Replays the allocated code of every block until the value of every
/// location at block entry is known, then checks every read.
#[inline(never)]
pub(crate) fn verify_code<F: Function>(
  ls: &LinearScan<F>, streams: &BlockStreams,
) -> Result<Vec<VerifierError>, RegAllocError> {
  let func = ls.func;
  let caller_saved = ls
    .universe
    .regs
    .iter()
    .map(|(rreg, _)| *rreg)
    .filter(|rreg| ls.universe.is_caller_saved(*rreg))
    .collect();
  let replay = Replay { ls, streams, caller_saved };

  let mut entry_state = CheckerState::new();
  for rreg in func.func_liveins() {
    entry_state.set(Location::Reg(rreg), CheckerValue::Reg(rreg.to_reg()));
  }

  let mut block_in = TypedIxVec::<BlockIx, Option<CheckerState>>::new();
  block_in.resize(func.blocks().len() as u32, None);
  block_in[func.entry_block()] = Some(entry_state);

  let mut work_list = VecDeque::new();
  work_list.push_back(func.entry_block());
  let mut num_visits = 0;
  while let Some(block) = work_list.pop_front() {
    num_visits += 1;
    let mut state = match &block_in[block] {
      Some(state) => state.clone(),
      None => continue,
    };
    replay.block(&mut state, block, None)?;

    for &succ in ls.cfg.succ_map[block].iter() {
      let changed = match block_in[succ].as_mut() {
        Some(succ_state) => succ_state.meet_with(&state),
        None => {
          block_in[succ] = Some(state.clone());
          true
        }
      };
      if changed && !work_list.contains(&succ) {
        work_list.push_back(succ);
      }
    }
  }
  debug!("code verification: fixpoint after {} block visits", num_visits);

  let mut errors = Vec::new();
  for block in func.blocks() {
    if let Some(state) = &block_in[block] {
      let mut state = state.clone();
      replay.block(&mut state, block, Some(&mut errors))?;
    }
  }
  debug!("code verification: {} errors", errors.len());
  Ok(errors)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data_flow::resolve_data_flow;
  use crate::data_structures::{RegClass, VirtualReg};
  use crate::inst_stream::{build_block_streams, eliminate_spill_moves};
  use crate::interface::AllocatorOptions;
  use crate::spill_position::optimize_spill_positions;
  use crate::test_utils::{make_universe, FuncBuilder, TestFunc};
  use crate::walker::walk_intervals;

  /// Runs allocation up to the code streams, lets `corrupt` tamper with the
  /// intervals, and returns the errors of both checks.
  fn check(
    func: &TestFunc, num_regs: usize,
    corrupt: impl FnOnce(&mut LinearScan<TestFunc>),
  ) -> Vec<VerifierError> {
    let universe = make_universe(num_regs);
    let options = AllocatorOptions::default();
    let mut ls = LinearScan::new(func, &universe, &options).unwrap();
    let original = snapshot_ranges(&ls.intervals);
    walk_intervals(&mut ls).unwrap();
    optimize_spill_positions(&mut ls).unwrap();
    resolve_data_flow(&mut ls).unwrap();
    eliminate_spill_moves(&mut ls).unwrap();
    corrupt(&mut ls);
    let streams = build_block_streams(&mut ls);
    let mut errors = verify_intervals(&ls, &original);
    errors.extend(verify_code(&ls, &streams).unwrap());
    errors
  }

  /// `v0` and `v1` are live at the same time.
  fn two_values() -> TestFunc {
    let mut b = FuncBuilder::new();
    let (v0, v1) = (b.vreg(), b.vreg());
    let b0 = b.block();
    b.switch_to(b0);
    b.op(v0, &[]);
    b.op(v1, &[]);
    b.use_reg(v0);
    b.use_reg(v1);
    b.ret(None);
    b.finish()
  }

  fn vreg(index: u32) -> Reg {
    VirtualReg::new(RegClass::I32, index).to_reg()
  }

  #[test]
  fn lattice_meet() {
    let (a, b) = (CheckerValue::Reg(vreg(0)), CheckerValue::Reg(vreg(1)));
    assert_eq!(CheckerValue::Unknown.meet(&a), a);
    assert_eq!(a.meet(&CheckerValue::Unknown), a);
    assert_eq!(a.meet(&a), a);
    assert_eq!(a.meet(&b), CheckerValue::Conflicted);
    assert_eq!(CheckerValue::Conflicted.meet(&a), CheckerValue::Conflicted);
  }

  #[test]
  fn clean_allocations_verify() {
    let _ = pretty_env_logger::try_init();
    for &num_regs in [2usize, 3].iter() {
      let func = FuncBuilder::simple_loop();
      let errors = check(&func, num_regs, |_| {});
      assert!(errors.is_empty(), "{:?}", errors);
    }
    let func = two_values();
    assert!(check(&func, 1, |_| {}).is_empty());
    let func = FuncBuilder::diamond(0.3);
    assert!(check(&func, 2, |_| {}).is_empty());
  }

  #[test]
  fn shared_register_is_caught() {
    let func = two_values();
    // r0, r1, r2, sp, then v0 and v1.
    let (v0, v1) = (IntId::new(4), IntId::new(5));
    let errors = check(&func, 3, |ls| {
      ls.intervals[v1].location = ls.intervals[v0].location;
    });
    assert!(errors.iter().any(|err| match err {
      VerifierError::LocationOverlap { .. } => true,
      _ => false,
    }));
    assert!(errors.iter().any(|err| match err {
      VerifierError::WrongValue { expected, found, .. } => {
        *expected == vreg(0) && *found == Some(vreg(1))
      }
      _ => false,
    }));
  }

  #[test]
  fn broken_ranges_are_caught() {
    let func = two_values();
    let v0 = IntId::new(4);
    let errors = check(&func, 3, |ls| {
      ls.intervals[v0].ranges[0].to += 1;
    });
    assert!(errors.iter().any(|err| match err {
      VerifierError::SplitChildrenMismatch { .. } => true,
      _ => false,
    }));

    let errors = check(&func, 3, |ls| {
      ls.intervals[v0].ranges.push(Range { from: 100, to: 100 });
    });
    assert!(errors.iter().any(|err| match err {
      VerifierError::BadRanges { .. } => true,
      _ => false,
    }));
  }

  #[test]
  fn missing_location_is_caught() {
    let func = two_values();
    let v1 = IntId::new(5);
    let errors = check(&func, 3, |ls| {
      ls.intervals[v1].location = Location::None;
    });
    assert!(errors.iter().any(|err| match err {
      VerifierError::NoLocation { .. } => true,
      _ => false,
    }));
  }
}
