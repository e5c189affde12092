/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Library view of the test bench, so other tooling can reuse the mini ISA
//! and the canned test cases.

pub mod test_cases;
pub mod test_framework;
