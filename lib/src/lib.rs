/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the domainfix library.

mod analysis;
mod data_structures;
mod domain_value;
mod interface;
mod pass;

pub use crate::interface::*;
