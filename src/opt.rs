//! Peephole optimiser and interpreter for the flattened stack program.
//!
//! Pass pipeline
//! -------------
//!  1. **fold_consts**: constant propagation over the op stream.
//!  2. **drop_neutral**: removes `+ 0`, `* 1` and `/ 1` where the constant is the
//!     directly preceding load.
//!
//! [`optimize`] iterates the pipeline until the program stops shrinking.
//! [`execute`] runs a program against a slice of variable values.

use crate::expr::{FlattenedExpr, LinearOp};

/// Run all optimisation passes until nothing changes.
pub fn optimize(flattened: FlattenedExpr) -> FlattenedExpr {
    let mut ops = flattened.ops;
    loop {
        let len_before = ops.len();
        ops = fold_consts(ops);
        ops = drop_neutral(ops);
        if ops.len() == len_before {
            break;
        }
    }
    let constant_result = match ops.as_slice() {
        [LinearOp::LoadConst(c)] => Some(*c),
        _ => flattened.constant_result,
    };
    FlattenedExpr {
        ops,
        constant_result,
    }
}

/// Evaluates a flattened program.
///
/// # Arguments
/// * `ops` - Program produced by [`crate::expr::Expr::flatten`]
/// * `values` - Variable values, indexed by the slots used when flattening
///
/// # Returns
/// The value left on top of the stack, or NaN for a malformed program
pub fn execute(ops: &[LinearOp], values: &[f64]) -> f64 {
    let mut stack: Vec<f64> = Vec::with_capacity(16);
    for op in ops {
        match op {
            LinearOp::LoadConst(c) => stack.push(*c),
            LinearOp::LoadVar(slot) => stack.push(values.get(*slot).copied().unwrap_or(f64::NAN)),
            LinearOp::Add | LinearOp::Sub | LinearOp::Mul | LinearOp::Div => {
                let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                    return f64::NAN;
                };
                stack.push(match op {
                    LinearOp::Add => a + b,
                    LinearOp::Sub => a - b,
                    LinearOp::Mul => a * b,
                    _ => a / b,
                });
            }
            unary => {
                let Some(a) = stack.pop() else {
                    return f64::NAN;
                };
                stack.push(apply_unary(unary, a));
            }
        }
    }
    stack.pop().unwrap_or(f64::NAN)
}

fn apply_unary(op: &LinearOp, a: f64) -> f64 {
    match op {
        LinearOp::Neg => -a,
        LinearOp::PowConst(n) => a.powi(*n as i32),
        LinearOp::PowFloat(p) => a.powf(*p),
        LinearOp::Exp => a.exp(),
        LinearOp::Ln => a.ln(),
        LinearOp::Sqrt => a.sqrt(),
        _ => f64::NAN,
    }
}

// Constant folding: mirror the stack with `Option<f64>` (Some when known at
// flatten time) and replace fully constant sub-programs with a single load.
fn fold_consts(ops: Vec<LinearOp>) -> Vec<LinearOp> {
    use LinearOp::*;

    let mut out: Vec<LinearOp> = Vec::with_capacity(ops.len());
    let mut cstk: Vec<Option<f64>> = Vec::with_capacity(8);

    for op in ops {
        match op {
            LoadConst(c) => {
                out.push(LoadConst(c));
                cstk.push(Some(c));
            }
            LoadVar(idx) => {
                out.push(LoadVar(idx));
                cstk.push(None);
            }
            Add | Sub | Mul | Div => {
                let rhs = cstk.pop().flatten();
                let lhs = cstk.pop().flatten();
                match (lhs, rhs) {
                    (Some(a), Some(b)) if !(matches!(op, Div) && b == 0.0) => {
                        let res = match op {
                            Add => a + b,
                            Sub => a - b,
                            Mul => a * b,
                            _ => a / b,
                        };
                        out.truncate(out.len().saturating_sub(2));
                        out.push(LoadConst(res));
                        cstk.push(Some(res));
                    }
                    _ => {
                        out.push(op);
                        cstk.push(None);
                    }
                }
            }
            unary => match cstk.pop().flatten() {
                Some(a) => {
                    let res = apply_unary(&unary, a);
                    out.pop();
                    out.push(LoadConst(res));
                    cstk.push(Some(res));
                }
                None => {
                    out.push(unary);
                    cstk.push(None);
                }
            },
        }
    }
    out
}

fn drop_neutral(ops: Vec<LinearOp>) -> Vec<LinearOp> {
    use LinearOp::*;
    let mut out: Vec<LinearOp> = Vec::with_capacity(ops.len());
    for op in ops {
        let neutral = match (out.last(), &op) {
            (Some(LoadConst(c)), Add | Sub) => *c == 0.0,
            (Some(LoadConst(c)), Mul | Div) => *c == 1.0,
            _ => false,
        };
        // only valid when the constant is the right operand, i.e. something precedes it
        if neutral && out.len() >= 2 {
            out.pop();
        } else {
            out.push(op);
        }
    }
    out
}
