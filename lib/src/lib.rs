/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the lsra library.
//!
//! The allocator runs these phases over one function:
//!
//!   block_order      allocation and emission orders of the blocks
//!   lir              operand numbering and instruction positions
//!   liveness         live-in/live-out sets, to a fixpoint
//!   interval_builder lifetime intervals with use positions and hints
//!   walker           register assignment, splitting and spilling
//!   spill_position   spill stores hoisted to dominating blocks
//!   data_flow        moves on control flow edges
//!   inst_stream      spill move elimination and the rewritten code
//!   checker          optional verification of the result

mod analysis;
mod block_order;
mod checker;
mod data_flow;
mod data_structures;
mod inst_stream;
mod interface;
mod interval_builder;
mod intervals;
mod linear_scan;
mod lir;
mod liveness;
mod move_resolver;
mod spill_position;
mod walker;

#[cfg(test)]
mod test_utils;

pub use crate::interface::*;
