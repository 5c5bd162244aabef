/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! A small test ISA with an interpreter, and test programs written in it,
//! for exercising the lsra allocator end to end.

pub mod test_cases;
pub mod test_framework;
