/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

/// Test cases.  The list of them is right at the bottom, function
/// |find_func|.  Add new ones there.
use lsra::{Reg, RegClass};

use crate::test_framework::*;

/// Fills memory with pseudo-random numbers, shellsorts them, and checks the
/// result for in-orderness.
fn test_shellsort() -> Func {
  let mut bif = Blockifier::new("shellsort");
  let n = bif.new_virtual_reg(RegClass::I32);
  let seed = bif.new_virtual_reg(RegClass::I32);
  let i = bif.new_virtual_reg(RegClass::I32);
  let j = bif.new_virtual_reg(RegClass::I32);
  let gap = bif.new_virtual_reg(RegClass::I32);
  let a = bif.new_virtual_reg(RegClass::I32);
  let b = bif.new_virtual_reg(RegClass::I32);
  let tmp = bif.new_virtual_reg(RegClass::I32);
  let cond = bif.new_virtual_reg(RegClass::I32);
  let sum = bif.new_virtual_reg(RegClass::I32);
  let bad = bif.new_virtual_reg(RegClass::I32);

  // cond = j >= gap && mem[j - gap] > a
  let compare = || {
    vec![
      s_cmp_ge(cond, j, RI_R(gap)),
      s_if_then(
        cond,
        vec![
          s_sub(tmp, j, RI_R(gap)),
          s_load(b, AM_R(tmp)),
          s_cmp_gt(cond, b, RI_R(a)),
        ],
      ),
    ]
  };

  let mut insert = vec![s_load(a, AM_R(i)), s_copy(j, i)];
  insert.extend(compare());
  let mut shift = vec![s_store(AM_R(j), b), s_copy(j, tmp)];
  shift.extend(compare());
  insert.push(s_while_do(cond, shift));
  insert.extend(vec![
    s_store(AM_R(j), a),
    s_add(i, i, RI_I(1)),
    s_cmp_lt(cond, i, RI_R(n)),
  ]);

  let stmts = vec![
    s_imm(n, 100),
    s_imm(seed, 12345),
    s_imm(b, 0),
    s_imm(tmp, 0),
    // Fill.
    s_imm(i, 0),
    s_cmp_lt(cond, i, RI_R(n)),
    s_while_do(
      cond,
      vec![
        s_mul(seed, seed, RI_I(1103515245)),
        s_add(seed, seed, RI_I(12345)),
        s_shr(a, seed, RI_I(16)),
        s_and(a, a, RI_I(1023)),
        s_store(AM_R(i), a),
        s_add(i, i, RI_I(1)),
        s_cmp_lt(cond, i, RI_R(n)),
      ],
    ),
    // Sort, halving the gap each round.
    s_shr(gap, n, RI_I(1)),
    s_cmp_gt(cond, gap, RI_I(0)),
    s_while_do(
      cond,
      vec![
        s_copy(i, gap),
        s_cmp_lt(cond, i, RI_R(n)),
        s_while_do(cond, insert),
        s_shr(gap, gap, RI_I(1)),
        s_cmp_gt(cond, gap, RI_I(0)),
      ],
    ),
    // Check.
    s_imm(sum, 0),
    s_imm(bad, 0),
    s_imm(i, 0),
    s_cmp_lt(cond, i, RI_R(n)),
    s_while_do(
      cond,
      vec![
        s_load(a, AM_R(i)),
        s_mul(tmp, sum, RI_I(31)),
        s_add(sum, tmp, RI_R(a)),
        s_add(i, i, RI_I(1)),
        s_cmp_lt(cond, i, RI_R(n)),
        s_if_then(
          cond,
          vec![
            s_load(b, AM_R(i)),
            s_cmp_gt(tmp, a, RI_R(b)),
            s_add(bad, bad, RI_R(tmp)),
          ],
        ),
      ],
    ),
    s_print_s("Out of order: "),
    s_print_i(bad),
    s_print_s(", checksum: "),
    s_print_i(sum),
    s_print_s("\n"),
  ];
  bif.finish(stmts, Some(sum))
}

/// Twelve accumulators that stay live through three loops, each of which
/// only touches four of them.
fn test_3_loops() -> Func {
  let mut bif = Blockifier::new("3_loops");
  let accs: Vec<Reg> =
    (0..12).map(|_| bif.new_virtual_reg(RegClass::I32)).collect();
  let v_i = bif.new_virtual_reg(RegClass::I32);
  let v_sum = bif.new_virtual_reg(RegClass::I32);
  let v_tmp = bif.new_virtual_reg(RegClass::I32);

  let mut stmts = Vec::new();
  for (k, &acc) in accs.iter().enumerate() {
    stmts.push(s_imm(acc, k as u32));
  }
  for (round, group) in accs.chunks(4).enumerate() {
    let mut body = Vec::new();
    for &acc in group {
      body.push(s_add(acc, acc, RI_I(round as u32 + 1)));
    }
    body.push(s_add(v_i, v_i, RI_I(1)));
    body.push(s_cmp_ge(v_tmp, v_i, RI_I(20)));
    stmts.push(s_imm(v_i, 0));
    stmts.push(s_repeat_until(body, v_tmp));
  }
  stmts.push(s_imm(v_sum, 0));
  for &acc in accs.iter() {
    stmts.push(s_add(v_sum, v_sum, RI_R(acc)));
  }
  stmts.push(s_print_s("Sum = "));
  stmts.push(s_print_i(v_sum));
  stmts.push(s_print_s("\n"));
  bif.finish(stmts, Some(v_sum))
}

/// Two nested loops.
fn test_stmts() -> Func {
  let mut bif = Blockifier::new("stmts");
  let v_i = bif.new_virtual_reg(RegClass::I32);
  let v_j = bif.new_virtual_reg(RegClass::I32);
  let v_sum = bif.new_virtual_reg(RegClass::I32);
  let v_tmp = bif.new_virtual_reg(RegClass::I32);
  let stmts = vec![
    s_imm(v_sum, 0),
    s_imm(v_i, 0),
    s_repeat_until(
      vec![
        s_imm(v_j, 0),
        s_repeat_until(
          vec![
            s_mul(v_tmp, v_i, RI_R(v_j)),
            s_add(v_sum, v_sum, RI_R(v_tmp)),
            s_add(v_j, v_j, RI_I(1)),
            s_cmp_gt(v_tmp, v_j, RI_I(10)),
          ],
          v_tmp,
        ),
        s_add(v_sum, v_sum, RI_R(v_i)),
        s_add(v_i, v_i, RI_I(1)),
        s_cmp_gt(v_tmp, v_i, RI_I(10)),
      ],
      v_tmp,
    ),
    s_print_s("Result is "),
    s_print_i(v_sum),
    s_print_s("\n"),
  ];
  bif.finish(stmts, Some(v_sum))
}

/// Two groups of values live across two loops, each loop using only one
/// group.  Splitting the idle group around each loop keeps the hot one in
/// registers.
fn test_needs_splitting() -> Func {
  let mut bif = Blockifier::new("needs_splitting");
  let first: Vec<Reg> =
    (0..3).map(|_| bif.new_virtual_reg(RegClass::I32)).collect();
  let second: Vec<Reg> =
    (0..3).map(|_| bif.new_virtual_reg(RegClass::I32)).collect();
  let v_i = bif.new_virtual_reg(RegClass::I32);
  let v_sum = bif.new_virtual_reg(RegClass::I32);
  let v_tmp = bif.new_virtual_reg(RegClass::I32);

  let hot_loop = |group: &[Reg]| {
    let mut body: Vec<Stmt> = group
      .iter()
      .enumerate()
      .map(|(k, &v)| s_add(v, v, RI_I(k as u32 + 1)))
      .collect();
    body.push(s_add(v_i, v_i, RI_I(1)));
    body.push(s_cmp_ge(v_tmp, v_i, RI_I(100)));
    vec![s_imm(v_i, 0), s_repeat_until(body, v_tmp)]
  };

  let mut stmts = Vec::new();
  for (k, &v) in first.iter().chain(second.iter()).enumerate() {
    stmts.push(s_imm(v, k as u32 + 1));
  }
  stmts.extend(hot_loop(&first));
  stmts.extend(hot_loop(&second));
  stmts.push(s_imm(v_sum, 0));
  for &v in first.iter().chain(second.iter()) {
    stmts.push(s_add(v_sum, v_sum, RI_R(v)));
  }
  stmts.push(s_print_s("Result is "));
  stmts.push(s_print_i(v_sum));
  stmts.push(s_print_s("\n"));
  bif.finish(stmts, Some(v_sum))
}

fn test_stmt_loop() -> Func {
  let mut bif = Blockifier::new("stmt_loop");
  let v_x = bif.new_virtual_reg(RegClass::I32);
  let v_y = bif.new_virtual_reg(RegClass::I32);
  let v_i = bif.new_virtual_reg(RegClass::I32);
  let v_tmp = bif.new_virtual_reg(RegClass::I32);
  let stmts = vec![
    s_imm(v_x, 1),
    s_imm(v_y, 2),
    s_imm(v_i, 0),
    s_repeat_until(
      vec![
        s_add(v_x, v_x, RI_I(3)),
        s_add(v_y, v_y, RI_I(4)),
        s_add(v_i, v_i, RI_I(1)),
        s_cmp_ge(v_tmp, v_i, RI_I(10)),
      ],
      v_tmp,
    ),
    s_add(v_x, v_x, RI_R(v_y)),
  ];
  bif.finish(stmts, Some(v_x))
}

/// Stores a float sequence to memory, then reads it back scaled.
fn test_fp_loop() -> Func {
  let mut bif = Blockifier::new("fp_loop");
  let n = bif.new_virtual_reg(RegClass::I32);
  let i = bif.new_virtual_reg(RegClass::I32);
  let cond = bif.new_virtual_reg(RegClass::I32);
  let x = bif.new_virtual_reg(RegClass::F32);
  let step = bif.new_virtual_reg(RegClass::F32);
  let scale = bif.new_virtual_reg(RegClass::F32);
  let acc = bif.new_virtual_reg(RegClass::F32);
  let t = bif.new_virtual_reg(RegClass::F32);
  let u = bif.new_virtual_reg(RegClass::F32);
  let stmts = vec![
    s_imm(n, 20),
    s_immf(x, 0.5),
    s_immf(step, 0.25),
    s_immf(scale, 1.5),
    s_imm(i, 0),
    s_cmp_lt(cond, i, RI_R(n)),
    s_while_do(
      cond,
      vec![
        s_storef(AM_RI(i, 100), x),
        s_fadd(x, x, step),
        s_add(i, i, RI_I(1)),
        s_cmp_lt(cond, i, RI_R(n)),
      ],
    ),
    s_immf(acc, 0.0),
    s_imm(i, 0),
    s_cmp_lt(cond, i, RI_R(n)),
    s_while_do(
      cond,
      vec![
        s_loadf(t, AM_RI(i, 100)),
        s_fmul(u, t, scale),
        s_fadd(acc, acc, u),
        s_fdiv(u, t, x),
        s_fsub(acc, acc, u),
        s_vanilla(i_copyf(t, acc)),
        s_add(i, i, RI_I(1)),
        s_cmp_lt(cond, i, RI_R(n)),
      ],
    ),
    s_print_s("Acc = "),
    s_print_f(acc),
    s_print_s("\n"),
  ];
  bif.finish(stmts, Some(acc))
}

/// Values live across calls, which destroy the caller-saved registers.
fn test_calls() -> Func {
  let mut bif = Blockifier::new("calls");
  let a = bif.new_virtual_reg(RegClass::I32);
  let b = bif.new_virtual_reg(RegClass::I32);
  let c = bif.new_virtual_reg(RegClass::I32);
  let d = bif.new_virtual_reg(RegClass::I32);
  let acc = bif.new_virtual_reg(RegClass::I32);
  let i = bif.new_virtual_reg(RegClass::I32);
  let cond = bif.new_virtual_reg(RegClass::I32);
  let res = bif.new_virtual_reg(RegClass::I32);
  let stmts = vec![
    s_imm(a, 1),
    s_imm(b, 2),
    s_imm(c, 3),
    s_imm(acc, 0),
    s_imm(i, 0),
    s_repeat_until(
      vec![
        s_call(Some(d), &[a, b]),
        s_add(acc, acc, RI_R(d)),
        s_add(a, a, RI_R(c)),
        s_call(None, &[acc]),
        s_mul(b, b, RI_I(3)),
        s_add(i, i, RI_I(1)),
        s_cmp_ge(cond, i, RI_I(5)),
      ],
      cond,
    ),
    s_call(Some(res), &[acc, a, b, c]),
    s_print_s("Calls: "),
    s_print_i(res),
    s_print_s("\n"),
  ];
  bif.finish(stmts, Some(res))
}

/// Incoming arguments start out in their stack slots.
fn test_stack_args() -> Func {
  let mut bif = Blockifier::new("stack_args");
  bif.set_args(&[7, 11, 13]);
  let x = bif.new_virtual_reg(RegClass::I32);
  let y = bif.new_virtual_reg(RegClass::I32);
  let z = bif.new_virtual_reg(RegClass::I32);
  let sum = bif.new_virtual_reg(RegClass::I32);
  let i = bif.new_virtual_reg(RegClass::I32);
  let t = bif.new_virtual_reg(RegClass::I32);
  let cond = bif.new_virtual_reg(RegClass::I32);
  let stmts = vec![
    s_load_arg(x, 0),
    s_load_arg(y, 1),
    s_load_arg(z, 2),
    s_imm(sum, 0),
    s_imm(i, 0),
    s_cmp_lt(cond, i, RI_R(z)),
    s_while_do(
      cond,
      vec![
        s_mul(t, x, RI_R(i)),
        s_add(sum, sum, RI_R(t)),
        s_add(sum, sum, RI_R(y)),
        s_add(i, i, RI_I(1)),
        s_cmp_lt(cond, i, RI_R(z)),
      ],
    ),
    s_print_i(sum),
    s_print_s("\n"),
  ];
  bif.finish(stmts, Some(sum))
}

/// Constants live through a loop.  Their only uses need a register, so
/// when spilled they are rematerialized instead of reloaded.
fn test_constants() -> Func {
  let mut bif = Blockifier::new("constants");
  let ks: Vec<Reg> =
    (0..5).map(|_| bif.new_virtual_reg(RegClass::I32)).collect();
  let i = bif.new_virtual_reg(RegClass::I32);
  let t = bif.new_virtual_reg(RegClass::I32);
  let sum = bif.new_virtual_reg(RegClass::I32);
  let cond = bif.new_virtual_reg(RegClass::I32);
  let mut stmts: Vec<Stmt> = ks
    .iter()
    .zip([3, 5, 7, 11, 13].iter())
    .map(|(&k, &value)| s_imm(k, value))
    .collect();
  stmts.extend(vec![
    s_imm(sum, 0),
    s_imm(i, 0),
    s_repeat_until(
      vec![
        s_mul(t, ks[0], RI_R(i)),
        s_add(sum, sum, RI_R(t)),
        s_and(t, i, RI_I(1)),
        s_if_then_else(
          t,
          vec![s_add(sum, ks[1], RI_R(sum))],
          vec![s_sub(sum, ks[2], RI_R(sum))],
        ),
        s_add(i, i, RI_I(1)),
        s_cmp_ge(cond, i, RI_I(9)),
      ],
      cond,
    ),
    s_add(sum, ks[3], RI_R(sum)),
    s_add(sum, ks[4], RI_R(sum)),
    s_print_i(sum),
    s_print_s("\n"),
  ]);
  bif.finish(stmts, Some(sum))
}

/// Rotates three values through copies in a loop, so that the moves on the
/// back edge may form cycles.
fn test_swap_cycle() -> Func {
  let mut bif = Blockifier::new("swap_cycle");
  let a = bif.new_virtual_reg(RegClass::I32);
  let b = bif.new_virtual_reg(RegClass::I32);
  let c = bif.new_virtual_reg(RegClass::I32);
  let t = bif.new_virtual_reg(RegClass::I32);
  let i = bif.new_virtual_reg(RegClass::I32);
  let cond = bif.new_virtual_reg(RegClass::I32);
  let res = bif.new_virtual_reg(RegClass::I32);
  let stmts = vec![
    s_imm(a, 1),
    s_imm(b, 2),
    s_imm(c, 3),
    s_imm(i, 0),
    s_repeat_until(
      vec![
        s_copy(t, a),
        s_copy(a, b),
        s_copy(b, c),
        s_copy(c, t),
        s_add(a, a, RI_R(i)),
        s_add(i, i, RI_I(1)),
        s_cmp_ge(cond, i, RI_I(7)),
      ],
      cond,
    ),
    s_mul(res, a, RI_I(10000)),
    s_mul(t, b, RI_I(100)),
    s_add(res, res, RI_R(t)),
    s_add(res, res, RI_R(c)),
    s_print_i(res),
    s_print_s("\n"),
  ];
  bif.finish(stmts, Some(res))
}

/// Values that are only kept alive for safepoints, next to values live
/// across calls.
fn test_safepoints() -> Func {
  let mut bif = Blockifier::new("safepoints");
  let obj1 = bif.new_virtual_reg(RegClass::I32);
  let obj2 = bif.new_virtual_reg(RegClass::I32);
  let acc = bif.new_virtual_reg(RegClass::I32);
  let r = bif.new_virtual_reg(RegClass::I32);
  let i = bif.new_virtual_reg(RegClass::I32);
  let cond = bif.new_virtual_reg(RegClass::I32);
  let stmts = vec![
    s_imm(obj1, 100),
    s_imm(obj2, 200),
    s_imm(acc, 0),
    s_imm(i, 0),
    s_repeat_until(
      vec![
        s_safepoint(&[obj1, obj2]),
        s_add(acc, acc, RI_R(obj1)),
        s_call(Some(r), &[acc, i]),
        s_add(acc, acc, RI_R(r)),
        s_add(obj2, obj2, RI_I(1)),
        s_add(i, i, RI_I(1)),
        s_cmp_ge(cond, i, RI_I(6)),
      ],
      cond,
    ),
    s_safepoint(&[acc, obj2]),
    s_add(acc, acc, RI_R(obj2)),
    s_print_i(acc),
    s_print_s("\n"),
  ];
  bif.finish(stmts, Some(acc))
}

/// Euclid on a series of pairs, in 2-operand style.
fn test_gcd_2a() -> Func {
  let mut bif = Blockifier::new("gcd_2a");
  let x = bif.new_virtual_reg(RegClass::I32);
  let a = bif.new_virtual_reg(RegClass::I32);
  let b = bif.new_virtual_reg(RegClass::I32);
  let t = bif.new_virtual_reg(RegClass::I32);
  let total = bif.new_virtual_reg(RegClass::I32);
  let steps = bif.new_virtual_reg(RegClass::I32);
  let cond = bif.new_virtual_reg(RegClass::I32);
  let stmts = vec![
    s_imm(total, 0),
    s_imm(steps, 0),
    s_imm(x, 1),
    s_repeat_until(
      vec![
        s_mul(a, x, RI_I(37)),
        s_addm(a, RI_I(11)),
        s_mul(b, x, RI_I(13)),
        s_addm(b, RI_I(5)),
        s_cmp_gt(cond, b, RI_I(0)),
        s_while_do(
          cond,
          vec![
            s_mod(t, a, RI_R(b)),
            s_copy(a, b),
            s_copy(b, t),
            s_addm(steps, RI_I(1)),
            s_cmp_gt(cond, b, RI_I(0)),
          ],
        ),
        s_addm(total, RI_R(a)),
        s_subm(total, RI_I(1)),
        s_addm(x, RI_I(1)),
        s_cmp_gt(cond, x, RI_I(30)),
      ],
      cond,
    ),
    s_print_s("gcd sum "),
    s_print_i(total),
    s_print_s(" in "),
    s_print_i(steps),
    s_print_s(" steps\n"),
  ];
  bif.finish(stmts, Some(total))
}

/// Eight values live through a loop where only one arm of a diamond uses
/// them.
fn test_diamond_pressure() -> Func {
  let mut bif = Blockifier::new("diamond_pressure");
  let base = bif.new_virtual_reg(RegClass::I32);
  let vs: Vec<Reg> =
    (0..8).map(|_| bif.new_virtual_reg(RegClass::I32)).collect();
  let sum = bif.new_virtual_reg(RegClass::I32);
  let i = bif.new_virtual_reg(RegClass::I32);
  let t = bif.new_virtual_reg(RegClass::I32);
  let cond = bif.new_virtual_reg(RegClass::I32);

  let mut stmts = vec![s_imm(base, 9)];
  for (k, &v) in vs.iter().enumerate() {
    stmts.push(s_add(v, base, RI_I(3 * k as u32)));
  }
  let busy: Vec<Stmt> =
    vs.iter().map(|&v| s_add(sum, sum, RI_R(v))).collect();
  stmts.extend(vec![
    s_imm(sum, 0),
    s_imm(i, 0),
    s_repeat_until(
      vec![
        s_and(t, i, RI_I(1)),
        s_if_then_else(
          t,
          busy,
          vec![s_mul(sum, sum, RI_I(3)), s_add(sum, sum, RI_R(vs[0]))],
        ),
        s_add(i, i, RI_I(1)),
        s_cmp_ge(cond, i, RI_I(6)),
      ],
      cond,
    ),
  ]);
  for &v in vs.iter().rev() {
    stmts.push(s_sub(sum, sum, RI_R(v)));
  }
  stmts.push(s_print_i(sum));
  stmts.push(s_print_s("\n"));
  bif.finish(stmts, Some(sum))
}

/// Every test case, by name.
pub fn all_funcs() -> Vec<Func> {
  vec![
    test_shellsort(),
    test_3_loops(),
    test_stmts(),
    test_needs_splitting(),
    test_stmt_loop(),
    test_fp_loop(),
    test_calls(),
    test_stack_args(),
    test_constants(),
    test_swap_cycle(),
    test_safepoints(),
    test_gcd_2a(),
    test_diamond_pressure(),
  ]
}

pub fn find_func(name: &str) -> Result<Func, Vec<String>> {
  let all_funcs = all_funcs();
  let mut all_names: Vec<String> =
    all_funcs.iter().map(|cand| cand.name.clone()).collect();
  match all_funcs.into_iter().find(|cand| cand.name == name) {
    Some(func) => Ok(func),
    None => {
      all_names.sort();
      Err(all_names)
    }
  }
}
