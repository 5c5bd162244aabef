/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Edits to the instruction stream, and the final rewrite of the code.
//!
//! Every phase records the moves it needs as edits at an insertion point
//! (a block and an index into its original instructions). Edits name
//! intervals rather than locations: spilling may still change an interval's
//! location after the edit was recorded, so locations are only read once
//! allocation is complete.

use log::{debug, trace};

use crate::data_structures::{
  BlockIx, InstIx, IntId, Location, Reg, Set, SpillSlot, TypedIxVec,
};
use crate::interface::{
  Function, Operand, OperandRole, RegAllocError, RegAllocResult,
  SafepointMap,
};
use crate::intervals::{OperandMode, SpillState};
use crate::linear_scan::LinearScan;

//=============================================================================
// Edit list items

/// Order of edits sharing an insertion point.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) enum InsertRank {
  /// Edge moves at the start of a block.
  BlockStart,
  /// Stores right after a definition.
  AfterDef,
  /// Spill stores hoisted to the start of a dominating block.
  DominatorSpill,
  /// Moves connecting split children inside a block.
  Walker,
  /// Edge moves at the end of a block.
  BlockEnd,
}

/// Edits go right before the instruction at `index` of `block`, or at the
/// end of the block when `index` is its length.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct InsertPoint {
  pub(crate) block: BlockIx,
  pub(crate) index: u32,
  pub(crate) rank: InsertRank,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EditKind {
  Move { from: IntId, to: IntId },
  Materialize { constant: u32, to: IntId },
  /// Copy to the canonical spill slot of the value.
  Store { from: IntId, slot: SpillSlot },
}

#[derive(Clone, Debug)]
pub(crate) struct Edit {
  pub(crate) point: InsertPoint,
  /// Creation order, breaks ties.
  pub(crate) seq: u32,
  pub(crate) kind: EditKind,
}

/// One element of the final code of a block.
#[derive(Clone, Copy, Debug)]
pub(crate) enum StreamItem {
  Insn(InstIx),
  Edit(InsertRank, EditKind),
}

pub(crate) type BlockStreams = TypedIxVec<BlockIx, Vec<StreamItem>>;

//=============================================================================
// Spill move elimination

/// Drops the moves into stack-resident children of values whose spill slot
/// is always up to date, and stores `StoreAtDefinition` values right after
/// their definition.
#[inline(never)]
pub(crate) fn eliminate_spill_moves<F: Function>(
  ls: &mut LinearScan<F>,
) -> Result<(), RegAllocError> {
  let num_edits = ls.edits.len();
  {
    let intervals = &ls.intervals;
    ls.edits.retain(|edit| {
      let to = match edit.kind {
        EditKind::Move { to, .. } | EditKind::Materialize { to, .. } => to,
        EditKind::Store { .. } => return true,
      };
      edit.point.rank == InsertRank::DominatorSpill
        || intervals[to].location.reg().is_some()
        || !intervals.always_in_memory(to)
    });
  }
  let num_eliminated = num_edits - ls.edits.len();
  ls.stats.num_moves_eliminated += num_eliminated;
  debug!("eliminated {} spill moves", num_eliminated);

  for operand in ls.lir.num_real..ls.lir.num_operands {
    let id = ls.operand_interval(operand);
    let interval = &ls.intervals[id];
    if interval.is_empty()
      || interval.spill_state != SpillState::StoreAtDefinition
      || interval.can_materialize()
    {
      continue;
    }
    let (def_pos, slot) =
      match (interval.spill_definition_pos, interval.spill_slot) {
        (Some(pos), Some(slot)) => (pos, slot),
        _ => {
          return Err(RegAllocError::Other(format!(
            "{:?} is stored at its definition but has no definition or slot",
            interval.reg
          )))
        }
      };
    match interval.location {
      Location::Reg(_) => {}
      // Defined right into its slot.
      _ => continue,
    }
    let (block, index) =
      ls.lir.index_in_block(ls.func, def_pos).ok_or_else(|| {
        RegAllocError::Other(format!(
          "definition of {:?} at {} is not an instruction",
          interval.reg, def_pos
        ))
      })?;
    trace!("store {:?} at definition {}", id, def_pos);
    let point =
      InsertPoint { block, index: index + 1, rank: InsertRank::AfterDef };
    ls.push_edit(point, EditKind::Store { from: id, slot });
  }
  Ok(())
}

//=============================================================================
// Merging edits into the code

/// Interleaves the edits with the original instructions of each block,
/// leaving out moves that have become no-ops.
#[inline(never)]
pub(crate) fn build_block_streams<F: Function>(
  ls: &mut LinearScan<F>,
) -> BlockStreams {
  let mut edits = std::mem::take(&mut ls.edits);
  edits.sort_by_key(|e| {
    (e.point.block, e.point.index, e.point.rank, e.seq)
  });

  let mut streams = BlockStreams::new();
  let mut next_edit = 0;
  for block in ls.func.blocks() {
    let mut items = Vec::new();
    let insns = ls.func.block_insns(block);
    for (index, iix) in insns.into_iter().enumerate() {
      while next_edit < edits.len()
        && edits[next_edit].point.block == block
        && edits[next_edit].point.index <= index as u32
      {
        push_edit_item(ls, &mut items, &edits[next_edit]);
        next_edit += 1;
      }
      items.push(StreamItem::Insn(iix));
    }
    while next_edit < edits.len() && edits[next_edit].point.block == block {
      push_edit_item(ls, &mut items, &edits[next_edit]);
      next_edit += 1;
    }
    streams.push(items);
  }
  debug_assert_eq!(next_edit, edits.len());

  ls.edits = edits;
  streams
}

fn push_edit_item<F: Function>(
  ls: &mut LinearScan<F>, items: &mut Vec<StreamItem>, edit: &Edit,
) {
  let intervals = &ls.intervals;
  let kind = match edit.kind {
    EditKind::Move { from, to } => {
      let from_loc = intervals[from].location;
      let to_loc = intervals[to].location;
      if from_loc == to_loc || to_loc.is_constant() {
        ls.stats.num_moves_eliminated += 1;
        return;
      }
      match (from_loc, intervals[intervals.parent(from)].materialized) {
        // The source was spilled after the move was recorded.
        (Location::Constant, Some(constant)) => {
          EditKind::Materialize { constant, to }
        }
        _ => edit.kind,
      }
    }
    EditKind::Materialize { to, .. } => {
      if intervals[to].location.is_constant() {
        ls.stats.num_moves_eliminated += 1;
        return;
      }
      edit.kind
    }
    EditKind::Store { from, slot } => {
      if intervals[from].location == Location::Stack(slot) {
        return;
      }
      edit.kind
    }
  };
  items.push(StreamItem::Edit(edit.point.rank, kind));
}

//=============================================================================
// Location assignment

fn operand_mode(role: OperandRole) -> OperandMode {
  match role {
    OperandRole::Output | OperandRole::Temp => OperandMode::Def,
    OperandRole::Input | OperandRole::Alive | OperandRole::State => {
      OperandMode::Use
    }
  }
}

/// The interval holding `op` at instruction `op_id`: the covering split
/// child for virtual registers, the fixed interval for real ones.
pub(crate) fn operand_interval_at<F: Function>(
  ls: &LinearScan<F>, op: &Operand, op_id: u32,
) -> Result<IntId, RegAllocError> {
  let parent = ls.operand_interval(ls.lir.operand_index(op.reg));
  match op.reg {
    Reg::Real(_) => Ok(parent),
    Reg::Virtual(_) => ls.split_child_at(parent, op_id, operand_mode(op.role)),
  }
}

fn operand_location<F: Function>(
  ls: &LinearScan<F>, op: &Operand, op_id: u32,
) -> Result<Location, RegAllocError> {
  if let Reg::Real(rreg) = op.reg {
    return Ok(Location::Reg(rreg));
  }
  let child = operand_interval_at(ls, op, op_id)?;
  match ls.intervals[child].location {
    Location::None => Err(RegAllocError::Other(format!(
      "{:?} has no location at {}",
      op.reg, op_id
    ))),
    loc => Ok(loc),
  }
}

/// Locations of the virtual values live across the instruction at `op_id`,
/// and the spill slots known to hold their current value.
fn safepoint_map<F: Function>(
  ls: &LinearScan<F>, op_id: u32, insn: InstIx,
) -> SafepointMap {
  let mut map =
    SafepointMap { insn, values: Vec::new(), spill_slots: Vec::new() };
  let block = ls.lir.block_for_id(op_id);
  for operand in ls.lir.num_real..ls.lir.num_operands {
    let parent = ls.operand_interval(operand);
    let vreg = match ls.lir.operand_regs[operand] {
      Some(Reg::Virtual(vreg)) => vreg,
      _ => continue,
    };
    let intervals = &ls.intervals;
    let covers = |pos| {
      intervals.split_child_at_op_id(parent, pos, OperandMode::Def).is_some()
    };
    let live_across = covers(op_id - 1) && covers(op_id + 1);
    if intervals[parent].is_empty() || !live_across {
      continue;
    }
    if let Some(child) =
      intervals.split_child_at_op_id(parent, op_id, OperandMode::Use)
    {
      match intervals[child].location {
        loc @ Location::Reg(_) | loc @ Location::Stack(_) => {
          map.values.push((vreg, loc))
        }
        _ => {}
      }
    }
    if intervals.always_in_memory(parent) {
      if let (Some(slot), Some(def_pos)) = (
        intervals.spill_slot(parent),
        intervals.spill_definition_pos(parent),
      ) {
        let store_block = ls.lir.block_for_id(def_pos);
        if def_pos < op_id && ls.cfg.dominates(store_block, block) {
          map.spill_slots.push((vreg, slot));
        }
      }
    }
  }
  map
}

//=============================================================================
// Final code

/// Rewrites every instruction with its operand locations and splices in
/// the edits, in original block order.
#[inline(never)]
pub(crate) fn emit_code<F: Function>(
  ls: &mut LinearScan<F>, streams: &BlockStreams,
) -> Result<RegAllocResult<F>, RegAllocError> {
  let func = ls.func;
  let mut insns = Vec::<F::Inst>::new();
  let mut target_map = TypedIxVec::<BlockIx, InstIx>::new();
  let mut orig_insn_map = TypedIxVec::<InstIx, Option<InstIx>>::new();
  let mut clobbered_registers = Set::empty();
  let mut safepoint_maps = Vec::new();
  let mut locs = Vec::new();

  for block in func.blocks() {
    target_map.push(InstIx::new(insns.len() as u32));
    for item in streams[block].iter() {
      match *item {
        StreamItem::Insn(iix) => {
          let op_id = ls.lir.insn_id[iix];
          let ops = &ls.lir.operands[iix];
          locs.clear();
          for op in ops.iter() {
            locs.push(operand_location(ls, op, op_id)?);
          }

          let orig = func.get_insn(iix);
          if let Some((dst, src)) = func.is_move(orig) {
            let loc_of = |reg: Reg, role: OperandRole| {
              ops
                .iter()
                .position(|op| op.reg == reg && op.role == role)
                .map(|ix| locs[ix])
            };
            let dst_loc = loc_of(dst, OperandRole::Output);
            let src_loc = loc_of(src, OperandRole::Input);
            let is_identity = dst_loc.is_some() && dst_loc == src_loc;
            let is_remat = dst_loc.map_or(false, |loc| loc.is_constant());
            if is_identity || is_remat {
              trace!("deleting move {:?}", iix);
              ls.stats.num_moves_eliminated += 1;
              continue;
            }
          }

          for (op, loc) in ops.iter().zip(locs.iter()) {
            match op.role {
              OperandRole::Output | OperandRole::Temp => {
                if let Some(rreg) = loc.reg() {
                  if ls.universe.is_allocable(rreg) {
                    clobbered_registers.insert(rreg);
                  }
                }
              }
              _ => {}
            }
          }

          let mut insn = orig.clone();
          func.assign_locations(&mut insn, &locs);
          let out_ix = InstIx::new(insns.len() as u32);
          if func.is_safepoint(orig) {
            safepoint_maps.push(safepoint_map(ls, op_id, out_ix));
          }
          insns.push(insn);
          orig_insn_map.push(Some(iix));
        }

        StreamItem::Edit(rank, kind) => {
          let intervals = &ls.intervals;
          let (insn, to_loc) = match kind {
            EditKind::Move { from, to } => {
              let (from_loc, to_loc) =
                (intervals[from].location, intervals[to].location);
              let vreg = intervals[to].reg.as_virtual_reg();
              (func.gen_move(to_loc, from_loc, vreg), to_loc)
            }
            EditKind::Materialize { constant, to } => {
              let to_loc = intervals[to].location;
              let vreg = intervals[to].reg.as_virtual_reg();
              let value = &ls.constants[constant as usize];
              (func.gen_materialize(to_loc, value, vreg), to_loc)
            }
            EditKind::Store { from, slot } => {
              let vreg = intervals[from].reg.as_virtual_reg();
              let to_loc = Location::Stack(slot);
              (func.gen_move(to_loc, intervals[from].location, vreg), to_loc)
            }
          };

          let stats = &mut ls.stats;
          match (rank, kind) {
            (InsertRank::BlockStart, _) | (InsertRank::BlockEnd, _) => {
              stats.num_edge_moves += 1
            }
            (_, EditKind::Store { .. }) => stats.num_spill_stores += 1,
            (_, EditKind::Materialize { .. }) => stats.num_reloads += 1,
            (_, EditKind::Move { from, .. }) => {
              if to_loc.spill().is_some() {
                stats.num_spill_stores += 1;
              } else if ls.intervals[from].location.reg().is_none() {
                stats.num_reloads += 1;
              }
            }
          }

          if let Some(rreg) = to_loc.reg() {
            clobbered_registers.insert(rreg);
          }
          insns.push(insn);
          orig_insn_map.push(None);
        }
      }
    }
  }

  ls.stats.num_intervals =
    ls.intervals.data.iter().filter(|int| !int.is_empty()).count();
  ls.stats.num_spill_slots = ls.frame.num_allocated();

  debug!("emitted {} insns", insns.len());

  Ok(RegAllocResult {
    insns,
    target_map,
    orig_insn_map,
    alloc_order: ls.order.alloc_order.clone(),
    emission_order: ls.order.emission_order.clone(),
    clobbered_registers,
    num_spill_slots: ls.frame.num_slots(),
    safepoint_maps,
    stats: ls.stats.clone(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interface::AllocatorOptions;
  use crate::linear_scan::run;
  use crate::test_utils::{make_universe, FuncBuilder, TestInstKind};

  fn verified() -> AllocatorOptions {
    AllocatorOptions { detailed_verification: true, ..Default::default() }
  }

  #[test]
  fn identity_moves_are_deleted() {
    let _ = pretty_env_logger::try_init();
    let mut b = FuncBuilder::new();
    let (va, vb, v0, v1) = (b.vreg(), b.vreg(), b.vreg(), b.vreg());
    let b0 = b.block();
    b.switch_to(b0);
    b.op(va, &[]);
    b.op(vb, &[]);
    b.op(v0, &[]);
    b.use_reg(vb);
    b.mov(v1, v0);
    b.use_reg(va);
    b.use_reg(v1);
    b.ret(None);
    let func = b.finish();

    let result = run(&func, &make_universe(3), &verified()).unwrap();
    assert!(result.stats.num_moves_eliminated >= 1);
    assert_eq!(result.insns.len(), func.insns.len() - 1);
    assert!(result
      .insns
      .iter()
      .all(|insn| !matches!(insn.kind, TestInstKind::Move { .. })));
  }

  #[test]
  fn target_map_follows_original_blocks() {
    let func = FuncBuilder::diamond(0.3);
    let result = run(&func, &make_universe(2), &verified()).unwrap();
    assert_eq!(result.target_map.len(), 4);
    assert_eq!(result.orig_insn_map.len() as usize, result.insns.len());
    for block in func.blocks() {
      let start = result.target_map[block];
      for iix in func.block_insns(block) {
        let out = result
          .orig_insn_map
          .iter()
          .position(|orig| *orig == Some(iix))
          .unwrap();
        assert!(out >= start.get_usize());
      }
    }
  }

  #[test]
  fn safepoint_map_lists_live_values() {
    let mut b = FuncBuilder::new();
    let (v0, v1) = (b.vreg(), b.vreg());
    let b0 = b.block();
    b.switch_to(b0);
    b.op(v0, &[]);
    b.op(v1, &[v0]);
    b.safepoint(&[]);
    b.use_reg(v1);
    b.ret(None);
    let func = b.finish();

    let result = run(&func, &make_universe(2), &verified()).unwrap();
    assert_eq!(result.safepoint_maps.len(), 1);
    let map = &result.safepoint_maps[0];
    assert!(matches!(
      result.insns[map.insn.get_usize()].kind,
      TestInstKind::Safepoint { .. }
    ));
    let v1 = v1.as_virtual_reg().unwrap();
    assert_eq!(map.values.len(), 1);
    assert_eq!(map.values[0].0, v1);
    assert!(map.values[0].1.reg().is_some());
  }
}
