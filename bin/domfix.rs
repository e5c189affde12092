/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

mod test_cases;
mod test_framework;

use domainfix::fix_execution_domains;
use test_framework::{make_universe, VecIsa};

use clap;
use log::{self, error, info};
use pretty_env_logger;

//=============================================================================
// Top level

fn main() {
  pretty_env_logger::init();

  let app = clap::App::new("domfix")
    .about("a simple program to allow separate testing of domainfix")
    .arg(
      clap::Arg::new("test")
        .short('t')
        .takes_value(true)
        .required(true)
        .help("test case name"),
    )
    .arg(
      clap::Arg::new("quiet")
        .short('q')
        .help("don't print the before/after listings"),
    );
  let matches = app.get_matches();

  let func_name = matches.value_of("test").unwrap();
  let mut func = match crate::test_cases::find_func(func_name) {
    Ok(func) => func,
    Err(available_func_names) => {
      error!("can't find Func with name '{}'", func_name);
      println!("available func names are:");
      for name in available_func_names {
        println!("     {}", name);
      }
      return;
    }
  };

  let reg_universe = make_universe();
  let quiet = matches.is_present("quiet");

  if !quiet {
    func.print("before domain fixup");
  }

  let stats = match fix_execution_domains(&mut func, &VecIsa, &reg_universe) {
    Err(e) => {
      println!("domain fixup failed: {}", e);
      return;
    }
    Ok(stats) => stats,
  };

  if !quiet {
    func.print("after domain fixup");
  }

  info!("value counters: {:?}", stats.value_counters);

  let total_visits: u32 = stats.visits.iter().sum();
  println!("");
  println!(
    "domfix: {} block visits, {} substitutions, {} undef breaks, \
     {} partial-update breaks",
    total_visits, stats.substitutions, stats.undef_breaks, stats.partial_breaks
  );
}

#[cfg(test)]
mod test_utils {
  use super::*;
  use crate::test_framework::Func;
  use domainfix::FixStats;

  pub fn run(func_name: &str) -> (Func, FixStats) {
    let _ = pretty_env_logger::try_init();
    let mut func = test_cases::find_func(func_name).unwrap();
    let reg_universe = make_universe();
    let stats = fix_execution_domains(&mut func, &VecIsa, &reg_universe)
      .unwrap_or_else(|err| {
        panic!("domain fixup failed: {}", err);
      });
    check_conservation(&stats);
    (func, stats)
  }

  // Every retained domain value must have been released by teardown, and
  // every allocation freed.
  pub fn check_conservation(stats: &FixStats) {
    let c = stats.value_counters;
    assert_eq!(c.releases, c.retains + c.allocs, "domain value leak");
    assert_eq!(c.frees, c.allocs, "domain value leak");
  }
}

#[cfg(test)]
use crate::test_framework::{vreg, Inst};
#[cfg(test)]
use domainfix::{BlockIx, InstIx};

#[test]
fn straight_line() {
  let (_func, stats) = test_utils::run("straight_line");
  assert_eq!(stats.visits[BlockIx::new(0)], 1);
  assert_eq!(stats.substitutions, 0);
  assert_eq!(stats.undef_breaks, 0);
  assert_eq!(stats.partial_breaks, 0);
}

#[test]
fn two_domains() {
  let (_func, stats) = test_utils::run("two_domains");
  assert_eq!(stats.visits[BlockIx::new(0)], 1);
  assert_eq!(stats.undef_breaks + stats.partial_breaks, 0);
}

#[test]
fn partial_update() {
  let (func, stats) = test_utils::run("partial_update");
  assert_eq!(stats.partial_breaks, 1);
  match &func.insns[InstIx::new(2)] {
    Inst::Cvt { broken, .. } => assert!(*broken, "hot partial update kept"),
    _ => panic!("unexpected instruction"),
  }
  match &func.insns[InstIx::new(3)] {
    Inst::Cvt { broken, .. } => assert!(!*broken, "cold partial update broken"),
    _ => panic!("unexpected instruction"),
  }
}

#[test]
fn undef_pad_hot() {
  let (func, stats) = test_utils::run("undef_pad_hot");
  assert_eq!(stats.substitutions, 1);
  assert_eq!(stats.undef_breaks, 1);
  match &func.insns[InstIx::new(8)] {
    Inst::PadOp { pad, broken, .. } => {
      // The true dependency hides the pad read, but everything is too
      // recently written for the clearance threshold, so it is broken too.
      assert_eq!(*pad, vreg(1));
      assert!(*broken);
    }
    _ => panic!("unexpected instruction"),
  }
}

#[test]
fn undef_pad_cold() {
  let (func, stats) = test_utils::run("undef_pad_cold");
  assert_eq!(stats.substitutions, 1);
  assert_eq!(stats.undef_breaks, 0);
  match &func.insns[InstIx::new(1)] {
    Inst::PadOp { pad, broken, .. } => {
      assert_eq!(*pad, vreg(1));
      assert!(!*broken);
    }
    _ => panic!("unexpected instruction"),
  }
}

#[test]
fn wide_alias() {
  let (func, stats) = test_utils::run("wide_alias");
  assert_eq!(stats.partial_breaks, 1);
  match &func.insns[InstIx::new(2)] {
    // The write of q0 counts as a recent write of v1.
    Inst::Cvt { broken, .. } => assert!(*broken),
    _ => panic!("unexpected instruction"),
  }
  match &func.insns[InstIx::new(3)] {
    Inst::Cvt { broken, .. } => assert!(!*broken),
    _ => panic!("unexpected instruction"),
  }
}

#[test]
fn diamond() {
  let (_func, stats) = test_utils::run("diamond");
  for visits in stats.visits.iter() {
    assert_eq!(*visits, 1, "acyclic CFG must process each block once");
  }
}

#[test]
fn simple_loop() {
  let (func, stats) = test_utils::run("simple_loop");
  // Preheader and loop exit once; the cycle blocks once as primary plus
  // exactly one catch-up visit when the loop resolved.
  assert_eq!(stats.visits[BlockIx::new(0)], 1);
  assert_eq!(stats.visits[BlockIx::new(1)], 2);
  assert_eq!(stats.visits[BlockIx::new(2)], 2);
  assert_eq!(stats.visits[BlockIx::new(3)], 2);
  assert_eq!(stats.visits[BlockIx::new(4)], 1);
  // The write of v1 in the loop body is visible in the loop head through
  // the back edge, so the partial update there is hot and must be broken.
  assert_eq!(stats.partial_breaks, 1);
  match &func.insns[InstIx::new(3)] {
    Inst::Cvt { broken, .. } => assert!(*broken),
    _ => panic!("unexpected instruction"),
  }
}

#[test]
fn dead_pred() {
  let (_func, stats) = test_utils::run("dead_pred");
  // The dead block is never processed, and the join can never become done
  // through the cascade, so the final sweep gives it its second visit.
  assert_eq!(stats.visits[BlockIx::new(0)], 1);
  assert_eq!(stats.visits[BlockIx::new(1)], 0);
  assert_eq!(stats.visits[BlockIx::new(2)], 2);
}

#[test]
fn no_vectors() {
  let (_func, stats) = test_utils::run("no_vectors");
  assert_eq!(stats.visits[BlockIx::new(0)], 0);
  assert_eq!(stats.value_counters.allocs, 0);
}

#[test]
fn meta_insns() {
  let (func, stats) = test_utils::run("meta_insns");
  assert_eq!(stats.partial_breaks, 1);
  match &func.insns[InstIx::new(4)] {
    Inst::Cvt { broken, .. } => assert!(*broken),
    _ => panic!("unexpected instruction"),
  }
}
