//! Expression module for representing rate expressions and derived equations.
//!
//! `Expr` is the tree form of every symbolic quantity that enters or leaves the
//! derivation pipeline: rate expressions parsed from rules, the right hand sides of
//! the mean-field equations, and the stationary noise moments. Variables are referenced
//! by name, so the same tree can be evaluated against any binding of symbols to values.
//!
//! The expression tree supports:
//! - Symbolic differentiation (product, quotient, chain and power rules)
//! - Algebraic simplification (constant folding, identities, exponent rules)
//! - Replacement of sub-trees matching a predicate, and symbol substitution
//! - Numeric evaluation against a symbol table
//! - Flattening into a stack program for repeated numeric evaluation
//!
//! # Expression Tree Structure
//! - Leaf nodes: Constants and Variables
//! - Unary operations: Neg, Exp, Ln, Sqrt
//! - Binary operations: Add, Sub, Mul, Div
//! - Powers: integer exponent (`Pow`) and floating point exponent (`PowFloat`)

use std::collections::{BTreeSet, HashMap};

/// An expression tree node representing mathematical operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A named symbol (reactant, rate, system size, ...)
    Var(String),
    /// Addition of two expressions
    Add(Box<Expr>, Box<Expr>),
    /// Multiplication of two expressions
    Mul(Box<Expr>, Box<Expr>),
    /// Subtraction of two expressions
    Sub(Box<Expr>, Box<Expr>),
    /// Division of two expressions
    Div(Box<Expr>, Box<Expr>),
    /// Exponentiation of an expression by an integer constant
    Pow(Box<Expr>, i64),
    /// Exponentiation of an expression by a floating point constant
    PowFloat(Box<Expr>, f64),
    /// Exponential function of an expression
    Exp(Box<Expr>),
    /// Natural logarithm of an expression
    Ln(Box<Expr>),
    /// Square root of an expression
    Sqrt(Box<Expr>),
    /// Negation of an expression
    Neg(Box<Expr>),
}

/// Linear operation of a flattened expression
#[derive(Debug, Clone, PartialEq)]
pub enum LinearOp {
    /// Load constant value
    LoadConst(f64),
    /// Load variable by index
    LoadVar(usize),
    /// Add the two topmost values
    Add,
    /// Subtract the topmost value from the one below
    Sub,
    /// Multiply the two topmost values
    Mul,
    /// Divide the value below the top by the topmost value
    Div,
    /// Negate stack top
    Neg,
    /// Integer power of stack top
    PowConst(i64),
    /// Floating point power of stack top
    PowFloat(f64),
    /// Exponential of stack top
    Exp,
    /// Natural log of stack top
    Ln,
    /// Square root of stack top
    Sqrt,
}

/// Flattened expression representation for repeated evaluation
#[derive(Debug, Clone)]
pub struct FlattenedExpr {
    /// Linear sequence of operations
    pub ops: Vec<LinearOp>,
    /// Pre-computed constant result (if expression is constant)
    pub constant_result: Option<f64>,
}

impl Expr {
    /// Shorthand for a named variable.
    pub fn var(name: &str) -> Expr {
        Expr::Var(name.to_string())
    }

    /// Returns true if the expression is the constant zero.
    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 0.0)
    }

    /// Computes the symbolic derivative of this expression with respect to a variable.
    ///
    /// The result is not simplified; call [`Expr::simplify`] on it where a compact
    /// form is needed.
    pub fn derivative(&self, with_respect_to: &str) -> Box<Expr> {
        match self {
            Expr::Const(_) => Box::new(Expr::Const(0.0)),

            Expr::Var(name) => {
                if name == with_respect_to {
                    Box::new(Expr::Const(1.0))
                } else {
                    Box::new(Expr::Const(0.0))
                }
            }

            // d/dx(f + g) = df/dx + dg/dx
            Expr::Add(left, right) => Box::new(Expr::Add(
                left.derivative(with_respect_to),
                right.derivative(with_respect_to),
            )),

            Expr::Sub(left, right) => Box::new(Expr::Sub(
                left.derivative(with_respect_to),
                right.derivative(with_respect_to),
            )),

            // d/dx(f * g) = f * dg/dx + g * df/dx
            Expr::Mul(left, right) => Box::new(Expr::Add(
                Box::new(Expr::Mul(left.clone(), right.derivative(with_respect_to))),
                Box::new(Expr::Mul(right.clone(), left.derivative(with_respect_to))),
            )),

            // d/dx(f/g) = (g * df/dx - f * dg/dx) / g^2
            Expr::Div(left, right) => Box::new(Expr::Div(
                Box::new(Expr::Sub(
                    Box::new(Expr::Mul(right.clone(), left.derivative(with_respect_to))),
                    Box::new(Expr::Mul(left.clone(), right.derivative(with_respect_to))),
                )),
                Box::new(Expr::Pow(right.clone(), 2)),
            )),

            // d/dx(f^n) = n * f^(n-1) * df/dx
            Expr::Pow(base, exp) => Box::new(Expr::Mul(
                Box::new(Expr::Mul(
                    Box::new(Expr::Const(*exp as f64)),
                    Box::new(Expr::Pow(base.clone(), exp - 1)),
                )),
                base.derivative(with_respect_to),
            )),

            Expr::PowFloat(base, exp) => Box::new(Expr::Mul(
                Box::new(Expr::Mul(
                    Box::new(Expr::Const(*exp)),
                    Box::new(Expr::PowFloat(base.clone(), exp - 1.0)),
                )),
                base.derivative(with_respect_to),
            )),

            Expr::Exp(expr) => Box::new(Expr::Mul(
                Box::new(Expr::Exp(expr.clone())),
                expr.derivative(with_respect_to),
            )),

            Expr::Ln(expr) => Box::new(Expr::Mul(
                Box::new(Expr::Div(Box::new(Expr::Const(1.0)), expr.clone())),
                expr.derivative(with_respect_to),
            )),

            // d/dx(sqrt(f)) = 1/(2*sqrt(f)) * df/dx
            Expr::Sqrt(expr) => Box::new(Expr::Mul(
                Box::new(Expr::Div(
                    Box::new(Expr::Const(0.5)),
                    Box::new(Expr::Sqrt(expr.clone())),
                )),
                expr.derivative(with_respect_to),
            )),

            Expr::Neg(expr) => Box::new(Expr::Neg(expr.derivative(with_respect_to))),
        }
    }

    /// Simplifies the expression by folding constants and applying basic algebraic rules.
    ///
    /// # Constant Folding
    /// - Evaluates constant expressions: 2 + 3 → 5
    /// - Simplifies operations with special constants: x * 0 → 0
    ///
    /// # Identity Rules
    /// - x + 0 → x, x * 1 → x, x / 1 → x, x / x → 1, x - x → 0
    ///
    /// # Exponent Rules
    /// - x^0 → 1, x^1 → x, (x^a)^b → x^(a*b), x^a * x^b → x^(a+b)
    pub fn simplify(&self) -> Box<Expr> {
        match self {
            Expr::Const(_) | Expr::Var(_) => Box::new(self.clone()),

            Expr::Add(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) => Box::new(Expr::Const(a + b)),
                    (expr, Expr::Const(c)) | (Expr::Const(c), expr) if *c == 0.0 => {
                        Box::new(expr.clone())
                    }
                    // x + (-y) -> x - y
                    (expr, Expr::Neg(inner)) => {
                        Box::new(Expr::Sub(Box::new(expr.clone()), inner.clone()))
                    }
                    // c1*x + c2*x -> (c1+c2)*x
                    (Expr::Mul(a1, x1), Expr::Mul(a2, x2))
                        if x1 == x2
                            && matches!(**a1, Expr::Const(_))
                            && matches!(**a2, Expr::Const(_)) =>
                    {
                        Expr::Mul(Expr::Add(a1.clone(), a2.clone()).simplify(), x1.clone())
                            .simplify()
                    }
                    (a, b) if a == b => {
                        Expr::Mul(Box::new(Expr::Const(2.0)), Box::new(a.clone())).simplify()
                    }
                    _ => Box::new(Expr::Add(l, r)),
                }
            }

            Expr::Sub(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) => Box::new(Expr::Const(a - b)),
                    (expr, Expr::Const(c)) if *c == 0.0 => Box::new(expr.clone()),
                    (Expr::Const(c), expr) if *c == 0.0 => {
                        Expr::Neg(Box::new(expr.clone())).simplify()
                    }
                    (a, b) if a == b => Box::new(Expr::Const(0.0)),
                    // x - (-y) -> x + y
                    (expr, Expr::Neg(inner)) => {
                        Box::new(Expr::Add(Box::new(expr.clone()), inner.clone()))
                    }
                    _ => Box::new(Expr::Sub(l, r)),
                }
            }

            Expr::Mul(left, right) => {
                let l = left.simplify();
                let r = right.simplify();

                if l == r {
                    return Expr::Pow(l, 2).simplify();
                }

                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) => Box::new(Expr::Const(a * b)),
                    (Expr::Const(c), _) | (_, Expr::Const(c)) if *c == 0.0 => {
                        Box::new(Expr::Const(0.0))
                    }
                    (expr, Expr::Const(c)) | (Expr::Const(c), expr) if *c == 1.0 => {
                        Box::new(expr.clone())
                    }
                    (expr, Expr::Const(c)) | (Expr::Const(c), expr) if *c == -1.0 => {
                        Expr::Neg(Box::new(expr.clone())).simplify()
                    }
                    // Keep constants in front: x * c -> c * x
                    (expr, Expr::Const(c)) => {
                        Expr::Mul(Box::new(Expr::Const(*c)), Box::new(expr.clone())).simplify()
                    }
                    (Expr::Pow(b1, e1), Expr::Pow(b2, e2)) if b1 == b2 => {
                        Expr::Pow(b1.clone(), e1 + e2).simplify()
                    }
                    (Expr::Pow(b1, e1), other) | (other, Expr::Pow(b1, e1)) if **b1 == *other => {
                        Expr::Pow(b1.clone(), e1 + 1).simplify()
                    }
                    // c1 * (c2 * x) -> (c1 * c2) * x
                    (Expr::Const(c1), Expr::Mul(c2, x)) if matches!(**c2, Expr::Const(_)) => {
                        Expr::Mul(
                            Expr::Mul(Box::new(Expr::Const(*c1)), c2.clone()).simplify(),
                            x.clone(),
                        )
                        .simplify()
                    }
                    (Expr::Neg(a), Expr::Neg(b)) => Expr::Mul(a.clone(), b.clone()).simplify(),
                    (Expr::Neg(a), b) | (b, Expr::Neg(a)) => {
                        Expr::Neg(Expr::Mul(a.clone(), Box::new(b.clone())).simplify()).simplify()
                    }
                    _ => Box::new(Expr::Mul(l, r)),
                }
            }

            Expr::Div(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) if *b != 0.0 => Box::new(Expr::Const(a / b)),
                    (Expr::Const(c), _) if *c == 0.0 => Box::new(Expr::Const(0.0)),
                    (expr, Expr::Const(c)) if *c == 1.0 => Box::new(expr.clone()),
                    (expr, Expr::Const(c)) if *c == -1.0 => {
                        Expr::Neg(Box::new(expr.clone())).simplify()
                    }
                    (a, b) if a == b => Box::new(Expr::Const(1.0)),
                    (Expr::Pow(b1, e1), Expr::Pow(b2, e2)) if b1 == b2 => {
                        Expr::Pow(b1.clone(), e1 - e2).simplify()
                    }
                    // (x/y)/z -> x/(y*z)
                    (Expr::Div(x, y), z) => Box::new(Expr::Div(
                        x.clone(),
                        Expr::Mul(y.clone(), Box::new(z.clone())).simplify(),
                    )),
                    _ => Box::new(Expr::Div(l, r)),
                }
            }

            Expr::Pow(base, exp) => {
                let b = base.simplify();
                match (&*b, exp) {
                    (_, 0) => Box::new(Expr::Const(1.0)),
                    (Expr::Const(a), exp) => Box::new(Expr::Const(a.powi(*exp as i32))),
                    (expr, 1) => Box::new(expr.clone()),
                    (Expr::Pow(inner_base, inner_exp), outer_exp) => {
                        Expr::Pow(inner_base.clone(), inner_exp * outer_exp).simplify()
                    }
                    _ => Box::new(Expr::Pow(b, *exp)),
                }
            }

            Expr::PowFloat(base, exp) => {
                let b = base.simplify();
                match (&*b, exp) {
                    (_, exp) if exp.abs() < 1e-12 => Box::new(Expr::Const(1.0)),
                    (Expr::Const(a), exp) => Box::new(Expr::Const(a.powf(*exp))),
                    (expr, exp) if exp.fract().abs() < 1e-12 => {
                        Expr::Pow(Box::new(expr.clone()), *exp as i64).simplify()
                    }
                    (expr, exp) if (exp - 0.5).abs() < 1e-12 => {
                        Box::new(Expr::Sqrt(Box::new(expr.clone())))
                    }
                    _ => Box::new(Expr::PowFloat(b, *exp)),
                }
            }

            Expr::Exp(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) => Box::new(Expr::Const(a.exp())),
                    Expr::Ln(inner) => inner.clone(),
                    _ => Box::new(Expr::Exp(e)),
                }
            }

            Expr::Ln(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) if *a > 0.0 => Box::new(Expr::Const(a.ln())),
                    Expr::Exp(inner) => inner.clone(),
                    _ => Box::new(Expr::Ln(e)),
                }
            }

            Expr::Sqrt(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) if *a >= 0.0 => Box::new(Expr::Const(a.sqrt())),
                    _ => Box::new(Expr::Sqrt(e)),
                }
            }

            Expr::Neg(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) => Box::new(Expr::Const(-a)),
                    Expr::Neg(inner) => inner.clone(),
                    // -(x - y) -> y - x
                    Expr::Sub(x, y) => Box::new(Expr::Sub(y.clone(), x.clone())),
                    // -(c*x) -> (-c)*x
                    Expr::Mul(c, x) if matches!(**c, Expr::Const(_)) => {
                        Expr::Mul(Box::new(Expr::Neg(c.clone())), x.clone()).simplify()
                    }
                    _ => Box::new(Expr::Neg(e)),
                }
            }
        }
    }

    /// Inserts an expression by replacing nodes that match a predicate.
    ///
    /// Recursively traverses the expression tree and replaces any nodes that match
    /// the given predicate with the replacement expression.
    pub fn insert<F>(&self, predicate: F, replacement: &Expr) -> Box<Expr>
    where
        F: Fn(&Expr) -> bool + Clone,
    {
        if predicate(self) {
            return Box::new(replacement.clone());
        }
        match self {
            Expr::Const(_) | Expr::Var(_) => Box::new(self.clone()),
            Expr::Add(left, right) => Box::new(Expr::Add(
                left.insert(predicate.clone(), replacement),
                right.insert(predicate, replacement),
            )),
            Expr::Mul(left, right) => Box::new(Expr::Mul(
                left.insert(predicate.clone(), replacement),
                right.insert(predicate, replacement),
            )),
            Expr::Sub(left, right) => Box::new(Expr::Sub(
                left.insert(predicate.clone(), replacement),
                right.insert(predicate, replacement),
            )),
            Expr::Div(left, right) => Box::new(Expr::Div(
                left.insert(predicate.clone(), replacement),
                right.insert(predicate, replacement),
            )),
            Expr::Pow(base, exp) => Box::new(Expr::Pow(base.insert(predicate, replacement), *exp)),
            Expr::PowFloat(base, exp) => {
                Box::new(Expr::PowFloat(base.insert(predicate, replacement), *exp))
            }
            Expr::Exp(expr) => Box::new(Expr::Exp(expr.insert(predicate, replacement))),
            Expr::Ln(expr) => Box::new(Expr::Ln(expr.insert(predicate, replacement))),
            Expr::Sqrt(expr) => Box::new(Expr::Sqrt(expr.insert(predicate, replacement))),
            Expr::Neg(expr) => Box::new(Expr::Neg(expr.insert(predicate, replacement))),
        }
    }

    /// Replaces every occurrence of the symbol `name` by `replacement`.
    pub fn substitute(&self, name: &str, replacement: &Expr) -> Box<Expr> {
        self.insert(|e| matches!(e, Expr::Var(v) if v == name), replacement)
    }

    /// Returns the sorted set of symbol names occurring in the expression.
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut symbols = BTreeSet::new();
        self.collect_symbols(&mut symbols);
        symbols
    }

    fn collect_symbols(&self, symbols: &mut BTreeSet<String>) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(name) => {
                symbols.insert(name.clone());
            }
            Expr::Add(l, r) | Expr::Sub(l, r) | Expr::Mul(l, r) | Expr::Div(l, r) => {
                l.collect_symbols(symbols);
                r.collect_symbols(symbols);
            }
            Expr::Pow(e, _)
            | Expr::PowFloat(e, _)
            | Expr::Exp(e)
            | Expr::Ln(e)
            | Expr::Sqrt(e)
            | Expr::Neg(e) => e.collect_symbols(symbols),
        }
    }

    /// Returns true if the symbol occurs anywhere in the expression.
    pub fn contains_symbol(&self, name: &str) -> bool {
        match self {
            Expr::Const(_) => false,
            Expr::Var(v) => v == name,
            Expr::Add(l, r) | Expr::Sub(l, r) | Expr::Mul(l, r) | Expr::Div(l, r) => {
                l.contains_symbol(name) || r.contains_symbol(name)
            }
            Expr::Pow(e, _)
            | Expr::PowFloat(e, _)
            | Expr::Exp(e)
            | Expr::Ln(e)
            | Expr::Sqrt(e)
            | Expr::Neg(e) => e.contains_symbol(name),
        }
    }

    /// Evaluates the expression against a symbol table.
    ///
    /// Returns `Err(name)` with the first symbol that has no value.
    pub fn eval(&self, values: &HashMap<String, f64>) -> Result<f64, String> {
        Ok(match self {
            Expr::Const(c) => *c,
            Expr::Var(name) => *values.get(name).ok_or_else(|| name.clone())?,
            Expr::Add(l, r) => l.eval(values)? + r.eval(values)?,
            Expr::Sub(l, r) => l.eval(values)? - r.eval(values)?,
            Expr::Mul(l, r) => l.eval(values)? * r.eval(values)?,
            Expr::Div(l, r) => l.eval(values)? / r.eval(values)?,
            Expr::Pow(base, exp) => base.eval(values)?.powi(*exp as i32),
            Expr::PowFloat(base, exp) => base.eval(values)?.powf(*exp),
            Expr::Exp(e) => e.eval(values)?.exp(),
            Expr::Ln(e) => e.eval(values)?.ln(),
            Expr::Sqrt(e) => e.eval(values)?.sqrt(),
            Expr::Neg(e) => -e.eval(values)?,
        })
    }

    /// Converts the expression tree to a flattened stack program.
    ///
    /// Variables are resolved to slots through `index`; an unknown variable is
    /// returned as `Err(name)`.
    pub fn flatten(&self, index: &HashMap<String, usize>) -> Result<FlattenedExpr, String> {
        if let Some(constant) = self.try_evaluate_constant() {
            return Ok(FlattenedExpr {
                ops: vec![LinearOp::LoadConst(constant)],
                constant_result: Some(constant),
            });
        }
        let mut ops = Vec::new();
        self.flatten_recursive(&mut ops, index)?;
        Ok(FlattenedExpr {
            ops,
            constant_result: None,
        })
    }

    /// Tries to evaluate expression as constant
    fn try_evaluate_constant(&self) -> Option<f64> {
        self.eval(&HashMap::new()).ok()
    }

    fn flatten_recursive(
        &self,
        ops: &mut Vec<LinearOp>,
        index: &HashMap<String, usize>,
    ) -> Result<(), String> {
        match self {
            Expr::Const(val) => ops.push(LinearOp::LoadConst(*val)),
            Expr::Var(name) => {
                let slot = index.get(name).ok_or_else(|| name.clone())?;
                ops.push(LinearOp::LoadVar(*slot));
            }
            Expr::Add(l, r) | Expr::Sub(l, r) | Expr::Mul(l, r) | Expr::Div(l, r) => {
                l.flatten_recursive(ops, index)?;
                r.flatten_recursive(ops, index)?;
                ops.push(match self {
                    Expr::Add(..) => LinearOp::Add,
                    Expr::Sub(..) => LinearOp::Sub,
                    Expr::Mul(..) => LinearOp::Mul,
                    _ => LinearOp::Div,
                });
            }
            Expr::Pow(base, exp) => {
                base.flatten_recursive(ops, index)?;
                ops.push(LinearOp::PowConst(*exp));
            }
            Expr::PowFloat(base, exp) => {
                base.flatten_recursive(ops, index)?;
                ops.push(LinearOp::PowFloat(*exp));
            }
            Expr::Exp(e) => {
                e.flatten_recursive(ops, index)?;
                ops.push(LinearOp::Exp);
            }
            Expr::Ln(e) => {
                e.flatten_recursive(ops, index)?;
                ops.push(LinearOp::Ln);
            }
            Expr::Sqrt(e) => {
                e.flatten_recursive(ops, index)?;
                ops.push(LinearOp::Sqrt);
            }
            Expr::Neg(e) => {
                e.flatten_recursive(ops, index)?;
                ops.push(LinearOp::Neg);
            }
        }
        Ok(())
    }
}

/// Formats the expression in fully parenthesised infix notation.
impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(val) => write!(f, "{val}"),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Add(left, right) => write!(f, "({left} + {right})"),
            Expr::Mul(left, right) => write!(f, "({left} * {right})"),
            Expr::Sub(left, right) => write!(f, "({left} - {right})"),
            Expr::Div(left, right) => write!(f, "({left} / {right})"),
            Expr::Pow(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowFloat(base, exp) => write!(f, "({base}^{exp})"),
            Expr::Exp(expr) => write!(f, "exp({expr})"),
            Expr::Ln(expr) => write!(f, "ln({expr})"),
            Expr::Sqrt(expr) => write!(f, "sqrt({expr})"),
            Expr::Neg(expr) => write!(f, "-({expr})"),
        }
    }
}
