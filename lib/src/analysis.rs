/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Control-flow glue for the pass: predecessor/successor maps and a reverse
//! postorder, computed once per function from the client's `block_succs`.

use log::debug;

use crate::data_structures::{BlockIx, TypedIxVec};
use crate::interface::Function;

/// Reverse-postorder position for blocks not reachable from the entry.  Such
/// blocks are never processed; they matter only as predecessors that will
/// never report in.
pub(crate) const RPO_UNREACHABLE: u32 = u32::MAX;

// CFGInfo contains CFG-related info computed from a Func.
pub(crate) struct CFGInfo {
  // All these TypedIxVecs contain one element per Block in the Func.

  // Successor and predecessor maps.  Successor lists are deduplicated, so a
  // two-way branch to the same target counts as one edge.
  pub(crate) succ_map: TypedIxVec<BlockIx, Vec<BlockIx>>,
  pub(crate) pred_map: TypedIxVec<BlockIx, Vec<BlockIx>>,

  // Reverse postorder over the blocks reachable from the entry, and each
  // block's position therein (`RPO_UNREACHABLE` for the rest).
  pub(crate) rpo: Vec<BlockIx>,
  pub(crate) rpo_index: TypedIxVec<BlockIx, u32>,
}

impl CFGInfo {
  pub(crate) fn create<F: Function>(func: &F) -> Self {
    let blocks = func.blocks();
    let n_blocks = blocks.end().get() - blocks.start().get();

    // === BEGIN compute successor and predecessor maps ===
    let mut succ_map = TypedIxVec::<BlockIx, Vec<BlockIx>>::new();
    for b in func.blocks() {
      let mut succs = func.block_succs(b);
      succs.sort_unstable();
      succs.dedup();
      succ_map.push(succs);
    }

    let mut pred_map = TypedIxVec::<BlockIx, Vec<BlockIx>>::new();
    pred_map.resize(n_blocks, vec![]);
    for (src, dst_vec) in (0..).zip(succ_map.iter()) {
      for dst in dst_vec.iter() {
        pred_map[*dst].push(BlockIx::new(src));
      }
    }

    assert!(pred_map.len() == n_blocks);
    assert!(succ_map.len() == n_blocks);
    //
    // === END compute successor and predecessor maps ===

    // === BEGIN compute reverse postorder ===
    //
    // Depth-first postorder from the entry block, with an explicit stack of
    // (block, next successor to look at), then reversed.  Blocks the entry
    // cannot reach are deliberately left out: the driver never processes
    // them, and its final sweep exists precisely because they may still
    // appear as predecessors.
    let mut post_ord = Vec::<BlockIx>::new();
    let mut visited = TypedIxVec::<BlockIx, bool>::new();
    visited.resize(n_blocks, false);

    let entry = func.entry_block();
    let mut stack: Vec<(BlockIx, usize)> = vec![(entry, 0)];
    visited[entry] = true;
    while let Some(&mut (bix, ref mut next_succ)) = stack.last_mut() {
      if *next_succ < succ_map[bix].len() {
        let succ = succ_map[bix][*next_succ];
        *next_succ += 1;
        if !visited[succ] {
          visited[succ] = true;
          stack.push((succ, 0));
        }
      } else {
        post_ord.push(bix);
        stack.pop();
      }
    }

    let mut rpo = post_ord;
    rpo.reverse();

    let mut rpo_index = TypedIxVec::<BlockIx, u32>::new();
    rpo_index.resize(n_blocks, RPO_UNREACHABLE);
    for (i, bix) in rpo.iter().enumerate() {
      rpo_index[*bix] = i as u32;
    }
    //
    // === END compute reverse postorder ===

    debug!(
      "CFGInfo: {} blocks, {} reachable from entry {:?}",
      n_blocks,
      rpo.len(),
      entry
    );

    CFGInfo { succ_map, pred_map, rpo, rpo_index }
  }

  pub(crate) fn num_preds(&self, bix: BlockIx) -> u32 {
    self.pred_map[bix].len() as u32
  }
}
