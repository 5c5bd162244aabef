/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

use lsra::{allocate_registers, AllocatorOptions};
use lsra_util::test_cases;
use lsra_util::test_framework::{make_universe, run_func, RunResult, RunStage};

use clap;
use log::{self, error, info};
use pretty_env_logger;

//=============================================================================
// Top level

fn main() {
  pretty_env_logger::init();

  let app = clap::App::new("lsra-util")
    .about("a simple program to allow separate testing of the lsra allocator")
    .arg(
      clap::Arg::new("iregs")
        .short('i')
        .takes_value(true)
        .help("number of integer registers available (0 if not set)"),
    )
    .arg(
      clap::Arg::new("fregs")
        .short('f')
        .takes_value(true)
        .help("number of floating-point registers available (0 if not set)"),
    )
    .arg(
      clap::Arg::new("test")
        .short('t')
        .takes_value(true)
        .required(true)
        .help("test case name"),
    )
    .arg(
      clap::Arg::new("simple-walker")
        .long("simple-walker")
        .help("don't split again at block boundaries while walking"),
    )
    .arg(
      clap::Arg::new("no-spill-opt")
        .long("no-spill-opt")
        .help("store spilled values at their definition"),
    )
    .arg(
      clap::Arg::new("no-loop-reorder")
        .long("no-loop-reorder")
        .help("keep loop headers in front of their bodies"),
    );
  let matches = app.get_matches();

  let func_name = matches.value_of("test").unwrap_or_default();
  let mut func = match test_cases::find_func(func_name) {
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

  let (num_regs_i32, num_regs_f32) = match (
    matches.value_of("iregs").unwrap_or("0").parse::<usize>(),
    matches.value_of("fregs").unwrap_or("0").parse::<usize>(),
  ) {
    (Ok(num_i32), Ok(num_f32)) => (num_i32, num_f32),
    _other => {
      println!("invalid iregs/fregs values: expected register counts");
      return;
    }
  };

  let options = AllocatorOptions {
    optimizing_walker: !matches.is_present("simple-walker"),
    optimize_spill_position: !matches.is_present("no-spill-opt"),
    reorder_loops: !matches.is_present("no-loop-reorder"),
    detailed_verification: true,
    ..Default::default()
  };
  info!("allocating with {:?}", options);

  let reg_universe = make_universe(num_regs_i32, num_regs_f32);

  func.print("before allocation");

  // Just so we can run it later.  Not needed for actual allocation.
  let original_func = func.clone();

  let result = match allocate_registers(&func, &reg_universe, &options) {
    Err(e) => {
      println!("allocation failed: {}", e);
      return;
    }
    Ok(r) => r,
  };
  info!("allocation stats: {:?}", result.stats);

  // Update the function itself. This bridges the gap from the generic
  // interface to our specific test ISA.
  func.update_from_alloc(result);

  func.print("after allocation");

  let before_regalloc_result = run_func(
    &original_func,
    "Before allocation",
    &reg_universe,
    RunStage::BeforeRegalloc,
  );

  let after_regalloc_result =
    run_func(&func, "After allocation", &reg_universe, RunStage::AfterRegalloc);

  println!("");

  match check_results(before_regalloc_result, after_regalloc_result) {
    Ok(()) => println!("results match"),
    Err(msg) => {
      error!("{}", msg);
      std::process::exit(1);
    }
  }
}

fn check_results(
  before_regalloc_result: Result<RunResult, String>,
  after_regalloc_result: Result<RunResult, String>,
) -> Result<(), String> {
  let before = match before_regalloc_result {
    Ok(before) => before,
    Err(err) => {
      return Err(format!("code before regalloc failed: {}", err));
    }
  };
  let after = match after_regalloc_result {
    Ok(after) => after,
    Err(err) => {
      return Err(format!("code after regalloc failed: {}", err));
    }
  };

  info!(
    "{} insns before, {} after ({} spills, {} reloads)",
    before.num_steps, after.num_steps, after.num_spills, after.num_reloads
  );

  if before.ret_value != after.ret_value {
    return Err(format!(
      "Incorrect interpreter result: expected {:?}, observed {:?}",
      before.ret_value, after.ret_value
    ));
  }
  if before.stdout != after.stdout {
    return Err(format!(
      r#"Different stdout values before/after regalloc:
- before:
{}
-after:
{}
        "#,
      before.stdout, after.stdout
    ));
  }
  Ok(())
}

#[cfg(test)]
mod test_utils {
  use lsra::{RegAllocError, RegAllocResult};

  use super::*;
  use lsra_util::test_framework::Func;

  /// The option combinations every test case runs under.
  pub fn all_options() -> Vec<AllocatorOptions> {
    let mut all = Vec::new();
    for &optimizing in [true, false].iter() {
      for &spill_opt in [true, false].iter() {
        all.push(AllocatorOptions {
          optimizing_walker: optimizing,
          optimize_spill_position: spill_opt,
          reorder_loops: optimizing,
          detailed_verification: true,
          ..Default::default()
        });
      }
    }
    all
  }

  pub fn run_lsra(
    func_name: &str, num_gpr: usize, num_fpu: usize,
  ) -> Result<RegAllocResult<Func>, RegAllocError> {
    let _ = pretty_env_logger::try_init();
    let func = test_cases::find_func(func_name).unwrap();
    let reg_universe = make_universe(num_gpr, num_fpu);
    let options =
      AllocatorOptions { detailed_verification: true, ..Default::default() };
    allocate_registers(&func, &reg_universe, &options)
  }

  pub fn check_lsra_with(
    func_name: &str, num_gpr: usize, num_fpu: usize,
    options: &AllocatorOptions,
  ) {
    let _ = pretty_env_logger::try_init();
    let mut func = test_cases::find_func(func_name).unwrap();
    let reg_universe = make_universe(num_gpr, num_fpu);
    let before_regalloc_result = run_func(
      &func,
      "Before allocation",
      &reg_universe,
      RunStage::BeforeRegalloc,
    );
    let result = allocate_registers(&func, &reg_universe, options)
      .unwrap_or_else(|err| {
        panic!(
          "allocation of {} with {} i32 and {} f32 regs failed: {}",
          func_name, num_gpr, num_fpu, err
        );
      });
    func.update_from_alloc(result);
    let after_regalloc_result = run_func(
      &func,
      "After allocation",
      &reg_universe,
      RunStage::AfterRegalloc,
    );
    if let Err(msg) =
      check_results(before_regalloc_result, after_regalloc_result)
    {
      func.print("AFTER");
      panic!(
        "{} with {} i32 and {} f32 regs, {:?}: {}",
        func_name, num_gpr, num_fpu, options, msg
      );
    }
  }

  /// Runs `func_name` with every register count in `gprs` under every
  /// option combination.
  pub fn check_lsra(
    func_name: &str, gprs: std::ops::RangeInclusive<usize>, num_fpu: usize,
  ) {
    for num_gpr in gprs {
      for options in all_options().iter() {
        check_lsra_with(func_name, num_gpr, num_fpu, options);
      }
    }
  }
}

#[test]
fn lsra_shellsort() {
  test_utils::check_lsra("shellsort", 2..=8, 0);
}

#[test]
fn lsra_3_loops() {
  test_utils::check_lsra("3_loops", 2..=9, 0);
}

#[test]
fn lsra_stmts() {
  test_utils::check_lsra("stmts", 2..=5, 0);
}

#[test]
fn lsra_needs_splitting() {
  test_utils::check_lsra("needs_splitting", 2..=8, 0);
}

#[test]
fn lsra_stmt_loop() {
  test_utils::check_lsra("stmt_loop", 2..=4, 0);
}

#[test]
fn lsra_fp_loop() {
  // The float multiply needs its inputs and its output in three distinct
  // registers.
  test_utils::check_lsra("fp_loop", 2..=3, 3);
  test_utils::check_lsra("fp_loop", 2..=2, 6);
}

#[test]
fn lsra_calls() {
  test_utils::check_lsra("calls", 2..=8, 0);
}

#[test]
fn lsra_stack_args() {
  test_utils::check_lsra("stack_args", 2..=6, 0);
}

#[test]
fn lsra_constants() {
  test_utils::check_lsra("constants", 2..=8, 0);
}

#[test]
fn lsra_swap_cycle() {
  test_utils::check_lsra("swap_cycle", 2..=6, 0);
}

#[test]
fn lsra_safepoints() {
  test_utils::check_lsra("safepoints", 2..=6, 0);
}

#[test]
fn lsra_gcd_2a() {
  test_utils::check_lsra("gcd_2a", 2..=8, 0);
}

#[test]
fn lsra_diamond_pressure() {
  test_utils::check_lsra("diamond_pressure", 2..=10, 0);
}

#[test]
fn lsra_out_of_registers() {
  // `u = t * scale` keeps both inputs live past the multiply.
  for num_fpu in 1..=2 {
    match test_utils::run_lsra("fp_loop", 4, num_fpu) {
      Err(lsra::RegAllocError::OutOfRegisters { .. }) => {}
      Err(err) => panic!("unexpected error: {}", err),
      Ok(_) => panic!("allocation with {} f32 registers succeeded", num_fpu),
    }
  }
}

#[test]
fn lsra_stats_and_safepoints() {
  let result = test_utils::run_lsra("safepoints", 2, 0).unwrap();
  assert!(result.stats.num_spill_slots > 0);
  assert!(result.num_spill_slots as usize >= result.stats.num_spill_slots);
  // A safepoint and a call in the loop, and a safepoint after it.
  assert_eq!(result.safepoint_maps.len(), 3);
  for map in result.safepoint_maps.iter() {
    assert!(map.insn.get_usize() < result.insns.len());
    assert!(!map.values.is_empty());
  }
}

#[test]
fn lsra_unknown_test_lists_names() {
  match test_cases::find_func("no_such_test") {
    Ok(_) => panic!("found a test that doesn't exist"),
    Err(names) => {
      assert!(names.contains(&"shellsort".to_string()));
      assert!(names.windows(2).all(|w| w[0] <= w[1]));
    }
  }
}
