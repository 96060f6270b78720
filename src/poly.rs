//! Canonical polynomial algebra used by the derivation pipeline.
//!
//! Every quantity of the van Kampen expansion is a Laurent polynomial with rational
//! coefficients and rational exponents over named symbols: the system size `V` enters
//! as `V^(1/2)`, densities are divided by powers of `V`, and so on. Keeping these in a
//! canonical sorted form makes collection by powers of `V`, extraction of coefficients
//! and comparison of terms exact and deterministic.
//!
//! Sub-expressions that are not polynomial (`exp(k)`, `1/(a+b)`, ...) are carried as
//! opaque atoms, keyed by their printed form.
//!
//! - [`Rational`]: exact `i128` fractions
//! - [`Atom`]: a symbol or an opaque expression
//! - [`Monomial`]: atoms with rational exponents
//! - [`Polynomial`]: monomials with rational coefficients

use crate::errors::DerivationError;
use crate::expr::Expr;
use itertools::Itertools;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

fn gcd(mut a: i128, mut b: i128) -> i128 {
    a = a.abs();
    b = b.abs();
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Exact fraction with a positive denominator in lowest terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    num: i128,
    den: i128,
}

impl Rational {
    pub const ZERO: Rational = Rational { num: 0, den: 1 };
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    /// Builds `num/den`; a zero denominator yields zero.
    pub fn new(num: i128, den: i128) -> Rational {
        if den == 0 || num == 0 {
            return Rational::ZERO;
        }
        let g = gcd(num, den);
        let sign = if den < 0 { -1 } else { 1 };
        Rational {
            num: sign * num / g,
            den: sign * den / g,
        }
    }

    pub fn integer(n: i64) -> Rational {
        Rational::new(n as i128, 1)
    }

    /// Best rational approximation of a float with denominator up to 10^9.
    ///
    /// Returns `None` for non-finite values or values that are not reproduced to
    /// within 1e-12 relative precision.
    pub fn from_f64(value: f64) -> Option<Rational> {
        if !value.is_finite() || value.abs() > 1e15 {
            return None;
        }
        if value.fract() == 0.0 {
            return Some(Rational::new(value as i128, 1));
        }
        // continued fraction convergents
        let (mut p0, mut q0, mut p1, mut q1) = (0i128, 1i128, 1i128, 0i128);
        let mut x = value;
        for _ in 0..64 {
            let a = x.floor();
            let (p2, q2) = (a as i128 * p1 + p0, a as i128 * q1 + q0);
            if q2 > 1_000_000_000 {
                break;
            }
            (p0, q0, p1, q1) = (p1, q1, p2, q2);
            let approx = p1 as f64 / q1 as f64;
            if (approx - value).abs() <= 1e-12 * value.abs().max(1.0) {
                return Some(Rational::new(p1, q1));
            }
            let frac = x - a;
            if frac == 0.0 {
                break;
            }
            x = 1.0 / frac;
        }
        None
    }

    pub fn numer(&self) -> i128 {
        self.num
    }

    pub fn denom(&self) -> i128 {
        self.den
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn is_integer(&self) -> bool {
        self.den == 1
    }

    pub fn is_negative(&self) -> bool {
        self.num < 0
    }

    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Multiplicative inverse, `None` for zero.
    pub fn recip(&self) -> Option<Rational> {
        (self.num != 0).then(|| Rational::new(self.den, self.num))
    }

    /// Sum, `None` if it leaves the i128 range.
    pub fn checked_add(self, rhs: Rational) -> Option<Rational> {
        let g = gcd(self.den, rhs.den);
        let left = self.num.checked_mul(rhs.den / g)?;
        let right = rhs.num.checked_mul(self.den / g)?;
        let den = self.den.checked_mul(rhs.den / g)?;
        Some(Rational::new(left.checked_add(right)?, den))
    }

    /// Product, `None` if it leaves the i128 range.
    pub fn checked_mul(self, rhs: Rational) -> Option<Rational> {
        if self.is_zero() || rhs.is_zero() {
            return Some(Rational::ZERO);
        }
        let g1 = gcd(self.num, rhs.den);
        let g2 = gcd(rhs.num, self.den);
        let num = (self.num / g1).checked_mul(rhs.num / g2)?;
        let den = (self.den / g2).checked_mul(rhs.den / g1)?;
        Some(Rational::new(num, den))
    }

    /// Quotient, `None` for a zero divisor or when it leaves the i128 range.
    pub fn checked_div(&self, other: Rational) -> Option<Rational> {
        other.recip().and_then(|inv| self.checked_mul(inv))
    }

    /// Integer power; negative powers of zero give zero.
    pub fn powi(&self, exp: i64) -> Rational {
        let base = if exp < 0 {
            match self.recip() {
                Some(inv) => inv,
                None => return Rational::ZERO,
            }
        } else {
            *self
        };
        (0..exp.unsigned_abs()).fold(Rational::ONE, |acc, _| acc * base)
    }
}

impl Ord for Rational {
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        match (self.num.checked_mul(other.den), other.num.checked_mul(self.den)) {
            (Some(left), Some(right)) => left.cmp(&right),
            _ => self
                .to_f64()
                .total_cmp(&other.to_f64())
                .then_with(|| self.num.cmp(&other.num)),
        }
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// # Panics
/// On i128 overflow. Solves use the `checked_*` forms instead.
impl Add for Rational {
    type Output = Rational;
    fn add(self, rhs: Rational) -> Rational {
        Rational::new(self.num * rhs.den + rhs.num * self.den, self.den * rhs.den)
    }
}

impl Sub for Rational {
    type Output = Rational;
    fn sub(self, rhs: Rational) -> Rational {
        self + (-rhs)
    }
}

impl Mul for Rational {
    type Output = Rational;
    fn mul(self, rhs: Rational) -> Rational {
        Rational::new(self.num * rhs.num, self.den * rhs.den)
    }
}

impl Neg for Rational {
    type Output = Rational;
    fn neg(self) -> Rational {
        Rational {
            num: -self.num,
            den: self.den,
        }
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// Indivisible factor of a monomial.
#[derive(Debug, Clone)]
pub enum Atom {
    Symbol(String),
    /// Non-polynomial sub-expression, compared by its printed form
    Opaque { key: String, expr: Box<Expr> },
}

impl Atom {
    pub fn opaque(expr: Expr) -> Atom {
        Atom::Opaque {
            key: expr.to_string(),
            expr: Box::new(expr),
        }
    }

    fn sort_key(&self) -> (u8, &str) {
        match self {
            Atom::Symbol(name) => (0, name),
            Atom::Opaque { key, .. } => (1, key),
        }
    }

    /// Expression form of the atom.
    pub fn to_expr(&self) -> Expr {
        match self {
            Atom::Symbol(name) => Expr::Var(name.clone()),
            Atom::Opaque { expr, .. } => (**expr).clone(),
        }
    }

    fn contains_symbol(&self, name: &str) -> bool {
        match self {
            Atom::Symbol(s) => s == name,
            Atom::Opaque { expr, .. } => expr.contains_symbol(name),
        }
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Atom {}

impl Ord for Atom {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Symbol(name) => write!(f, "{name}"),
            Atom::Opaque { key, .. } => write!(f, "[{key}]"),
        }
    }
}

/// Product of atoms raised to non-zero rational exponents.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Monomial(BTreeMap<Atom, Rational>);

impl Monomial {
    pub fn one() -> Monomial {
        Monomial::default()
    }

    pub fn atom(atom: Atom, exponent: Rational) -> Monomial {
        let mut m = Monomial::one();
        m.multiply_atom(atom, exponent);
        m
    }

    pub fn symbol(name: &str) -> Monomial {
        Monomial::atom(Atom::Symbol(name.to_string()), Rational::ONE)
    }

    pub fn is_one(&self) -> bool {
        self.0.is_empty()
    }

    pub fn factors(&self) -> impl Iterator<Item = (&Atom, &Rational)> {
        self.0.iter()
    }

    fn multiply_atom(&mut self, atom: Atom, exponent: Rational) {
        let entry = self.0.entry(atom).or_insert(Rational::ZERO);
        *entry = *entry + exponent;
        if entry.is_zero() {
            self.0.retain(|_, e| !e.is_zero());
        }
    }

    pub fn mul(&self, other: &Monomial) -> Monomial {
        let mut out = self.clone();
        for (atom, e) in &other.0 {
            out.multiply_atom(atom.clone(), *e);
        }
        out
    }

    /// Quotient `self / other` (always defined for Laurent monomials).
    pub fn div(&self, other: &Monomial) -> Monomial {
        let mut out = self.clone();
        for (atom, e) in &other.0 {
            out.multiply_atom(atom.clone(), -*e);
        }
        out
    }

    pub fn pow(&self, exponent: Rational) -> Monomial {
        if exponent.is_zero() {
            return Monomial::one();
        }
        Monomial(self.0.iter().map(|(a, e)| (a.clone(), *e * exponent)).collect())
    }

    /// Exponent of a symbol atom (zero if absent).
    pub fn exponent_of(&self, name: &str) -> Rational {
        self.0
            .get(&Atom::Symbol(name.to_string()))
            .copied()
            .unwrap_or(Rational::ZERO)
    }

    /// The monomial with the given symbol removed.
    pub fn without(&self, name: &str) -> Monomial {
        let mut out = self.clone();
        out.0.remove(&Atom::Symbol(name.to_string()));
        out
    }

    /// Splits into the part built from `names` and the rest.
    pub fn split(&self, names: &BTreeSet<String>) -> (Monomial, Monomial) {
        let (inside, outside): (BTreeMap<_, _>, BTreeMap<_, _>) = self
            .0
            .iter()
            .map(|(a, e)| (a.clone(), *e))
            .partition(|(a, _)| matches!(a, Atom::Symbol(s) if names.contains(s)));
        (Monomial(inside), Monomial(outside))
    }

    pub fn contains_symbol(&self, name: &str) -> bool {
        self.0.keys().any(|a| a.contains_symbol(name))
    }

    /// True if the symbol occurs inside an opaque atom.
    pub fn opaque_contains(&self, name: &str) -> bool {
        self.0
            .keys()
            .any(|a| matches!(a, Atom::Opaque { expr, .. } if expr.contains_symbol(name)))
    }

    /// Lexicographic monomial order over the merged atom sequence.
    ///
    /// Unlike the storage order this is compatible with multiplication, which exact
    /// division relies on.
    pub fn lex_cmp(&self, other: &Monomial) -> Ordering {
        let atoms: BTreeSet<&Atom> = self.0.keys().chain(other.0.keys()).collect();
        for atom in atoms {
            let a = self.0.get(atom).copied().unwrap_or(Rational::ZERO);
            let b = other.0.get(atom).copied().unwrap_or(Rational::ZERO);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }

    pub fn eval(&self, values: &HashMap<String, f64>) -> Result<f64, String> {
        self.0.iter().try_fold(1.0, |acc, (atom, e)| {
            let base = match atom {
                Atom::Symbol(name) => *values.get(name).ok_or_else(|| name.clone())?,
                Atom::Opaque { expr, .. } => expr.eval(values)?,
            };
            let value = if e.is_integer() {
                base.powi(e.numer() as i32)
            } else {
                base.powf(e.to_f64())
            };
            Ok(acc * value)
        })
    }

    pub fn to_expr(&self) -> Expr {
        self.0
            .iter()
            .map(|(atom, e)| {
                let base = Box::new(atom.to_expr());
                if *e == Rational::ONE {
                    *base
                } else if e.is_integer() {
                    Expr::Pow(base, e.numer() as i64)
                } else if *e == Rational::new(1, 2) {
                    Expr::Sqrt(base)
                } else {
                    Expr::PowFloat(base, e.to_f64())
                }
            })
            .reduce(|acc, f| Expr::Mul(Box::new(acc), Box::new(f)))
            .unwrap_or(Expr::Const(1.0))
    }
}

impl fmt::Display for Monomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_one() {
            return write!(f, "1");
        }
        let factors = self.0.iter().map(|(atom, e)| {
            if *e == Rational::ONE {
                atom.to_string()
            } else if e.is_integer() && !e.is_negative() {
                format!("{atom}^{e}")
            } else {
                format!("{atom}^({e})")
            }
        });
        write!(f, "{}", factors.format("*"))
    }
}

/// Step budget for symbolic solves.
///
/// Every polynomial term operation inside a solve is charged; running out turns
/// into [`DerivationError::Timeout`].
#[derive(Debug, Clone)]
pub struct SolveBudget {
    limit: usize,
    used: usize,
}

impl SolveBudget {
    pub const DEFAULT_STEPS: usize = 200_000;

    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    pub fn charge(&mut self, steps: usize) -> Result<(), DerivationError> {
        self.used = self.used.saturating_add(steps);
        if self.used > self.limit {
            Err(DerivationError::Timeout { steps: self.limit })
        } else {
            Ok(())
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

impl Default for SolveBudget {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STEPS)
    }
}

/// Sum of monomials with non-zero rational coefficients.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Polynomial {
    terms: BTreeMap<Monomial, Rational>,
}

impl Polynomial {
    pub fn zero() -> Polynomial {
        Polynomial::default()
    }

    pub fn one() -> Polynomial {
        Polynomial::constant(Rational::ONE)
    }

    pub fn constant(c: Rational) -> Polynomial {
        Polynomial::term(Monomial::one(), c)
    }

    pub fn integer(n: i64) -> Polynomial {
        Polynomial::constant(Rational::integer(n))
    }

    pub fn symbol(name: &str) -> Polynomial {
        Polynomial::term(Monomial::symbol(name), Rational::ONE)
    }

    /// `name^exponent`
    pub fn symbol_pow(name: &str, exponent: Rational) -> Polynomial {
        Polynomial::term(
            Monomial::atom(Atom::Symbol(name.to_string()), exponent),
            Rational::ONE,
        )
    }

    pub fn term(monomial: Monomial, coefficient: Rational) -> Polynomial {
        let mut p = Polynomial::zero();
        p.add_term(monomial, coefficient);
        p
    }

    pub fn is_zero(&self) -> bool {
        self.terms.is_empty()
    }

    /// Number of terms.
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// The value of a constant polynomial.
    pub fn as_constant(&self) -> Option<Rational> {
        match self.terms.len() {
            0 => Some(Rational::ZERO),
            1 => self.terms.get(&Monomial::one()).copied(),
            _ => None,
        }
    }

    pub fn terms(&self) -> impl Iterator<Item = (&Monomial, &Rational)> {
        self.terms.iter()
    }

    pub fn add_term(&mut self, monomial: Monomial, coefficient: Rational) {
        if coefficient.is_zero() {
            return;
        }
        let entry = self.terms.entry(monomial.clone()).or_insert(Rational::ZERO);
        *entry = *entry + coefficient;
        if entry.is_zero() {
            self.terms.remove(&monomial);
        }
    }

    pub fn scale(&self, factor: Rational) -> Polynomial {
        if factor.is_zero() {
            return Polynomial::zero();
        }
        Polynomial {
            terms: self.terms.iter().map(|(m, c)| (m.clone(), *c * factor)).collect(),
        }
    }

    /// Every coefficient multiplied by `factor`, `None` on coefficient overflow.
    pub fn checked_scale(&self, factor: Rational) -> Option<Polynomial> {
        let terms = self
            .terms
            .iter()
            .map(|(m, c)| c.checked_mul(factor).map(|c| (m.clone(), c)))
            .collect::<Option<BTreeMap<_, _>>>()?;
        Some(Polynomial {
            terms: terms.into_iter().filter(|(_, c)| !c.is_zero()).collect(),
        })
    }

    fn checked_add_term(&mut self, monomial: Monomial, coefficient: Rational) -> Option<()> {
        if coefficient.is_zero() {
            return Some(());
        }
        let sum = match self.terms.get(&monomial) {
            Some(current) => current.checked_add(coefficient)?,
            None => coefficient,
        };
        if sum.is_zero() {
            self.terms.remove(&monomial);
        } else {
            self.terms.insert(monomial, sum);
        }
        Some(())
    }

    /// Product, `None` on coefficient overflow.
    pub fn checked_mul(&self, rhs: &Polynomial) -> Option<Polynomial> {
        let mut out = Polynomial::zero();
        for (m1, c1) in &self.terms {
            for (m2, c2) in &rhs.terms {
                out.checked_add_term(m1.mul(m2), c1.checked_mul(*c2)?)?;
            }
        }
        Some(out)
    }

    /// Difference, `None` on coefficient overflow.
    pub fn checked_sub(&self, rhs: &Polynomial) -> Option<Polynomial> {
        let mut out = self.clone();
        for (m, c) in &rhs.terms {
            out.checked_add_term(m.clone(), -*c)?;
        }
        Some(out)
    }

    /// Multiplication by a single term.
    pub fn mul_term(&self, monomial: &Monomial, coefficient: Rational) -> Polynomial {
        let mut out = Polynomial::zero();
        for (m, c) in &self.terms {
            out.add_term(m.mul(monomial), *c * coefficient);
        }
        out
    }

    pub fn pow(&self, exp: u32) -> Polynomial {
        (0..exp).fold(Polynomial::one(), |acc, _| &acc * self)
    }

    /// Rational power.
    ///
    /// Non-negative integer powers expand; a single term with unit coefficient (or an
    /// integer power) distributes over its atoms; anything else becomes an opaque atom.
    pub fn pow_rational(&self, exp: Rational) -> Polynomial {
        if exp.is_integer() && !exp.is_negative() {
            return self.pow(exp.numer() as u32);
        }
        if self.terms.len() == 1 {
            if let Some((m, c)) = self.terms.iter().next() {
                if exp.is_integer() {
                    return Polynomial::term(m.pow(exp), c.powi(exp.numer() as i64));
                }
                if *c == Rational::ONE {
                    return Polynomial::term(m.pow(exp), Rational::ONE);
                }
            }
        }
        if self.is_zero() {
            return Polynomial::zero();
        }
        Polynomial::term(Monomial::atom(Atom::opaque(self.to_expr()), exp), Rational::ONE)
    }

    /// Builds the canonical form of an expression.
    ///
    /// Non-polynomial sub-expressions become opaque atoms.
    pub fn from_expr(expr: &Expr) -> Polynomial {
        match expr {
            Expr::Const(c) => match Rational::from_f64(*c) {
                Some(r) => Polynomial::constant(r),
                None => Polynomial::term(Monomial::atom(Atom::opaque(expr.clone()), Rational::ONE), Rational::ONE),
            },
            Expr::Var(name) => Polynomial::symbol(name),
            Expr::Add(l, r) => Polynomial::from_expr(l) + Polynomial::from_expr(r),
            Expr::Sub(l, r) => Polynomial::from_expr(l) - Polynomial::from_expr(r),
            Expr::Mul(l, r) => &Polynomial::from_expr(l) * &Polynomial::from_expr(r),
            Expr::Neg(e) => -Polynomial::from_expr(e),
            Expr::Div(l, r) => {
                let denominator = Polynomial::from_expr(r);
                &Polynomial::from_expr(l) * &denominator.pow_rational(Rational::integer(-1))
            }
            Expr::Pow(base, exp) => {
                Polynomial::from_expr(base).pow_rational(Rational::integer(*exp))
            }
            Expr::PowFloat(base, exp) => match Rational::from_f64(*exp) {
                Some(r) => Polynomial::from_expr(base).pow_rational(r),
                None => Polynomial::term(Monomial::atom(Atom::opaque(expr.clone()), Rational::ONE), Rational::ONE),
            },
            Expr::Sqrt(base) => Polynomial::from_expr(base).pow_rational(Rational::new(1, 2)),
            Expr::Exp(_) | Expr::Ln(_) => {
                let simplified = *expr.simplify();
                match simplified {
                    Expr::Exp(_) | Expr::Ln(_) => Polynomial::term(
                        Monomial::atom(Atom::opaque(simplified), Rational::ONE),
                        Rational::ONE,
                    ),
                    other => Polynomial::from_expr(&other),
                }
            }
        }
    }

    pub fn to_expr(&self) -> Expr {
        self.terms
            .iter()
            .map(|(m, c)| {
                let coefficient = Expr::Const(c.to_f64());
                if m.is_one() {
                    coefficient
                } else if *c == Rational::ONE {
                    m.to_expr()
                } else {
                    Expr::Mul(Box::new(coefficient), Box::new(m.to_expr()))
                }
            })
            .reduce(|acc, t| Expr::Add(Box::new(acc), Box::new(t)))
            .unwrap_or(Expr::Const(0.0))
    }

    /// Partial derivative with respect to a symbol.
    pub fn derivative(&self, name: &str) -> Polynomial {
        let mut out = Polynomial::zero();
        for (m, c) in &self.terms {
            for (atom, e) in m.factors() {
                if !atom.contains_symbol(name) {
                    continue;
                }
                let rest = Polynomial::term(m.div(&Monomial::atom(atom.clone(), Rational::ONE)), *c * *e);
                let inner = match atom {
                    Atom::Symbol(_) => Polynomial::one(),
                    Atom::Opaque { expr, .. } => Polynomial::from_expr(&expr.derivative(name).simplify()),
                };
                out += &(&rest * &inner);
            }
        }
        out
    }

    /// Replaces a symbol by a polynomial.
    pub fn substitute(&self, name: &str, replacement: &Polynomial) -> Polynomial {
        let mut out = Polynomial::zero();
        for (m, c) in &self.terms {
            if !m.contains_symbol(name) {
                out.add_term(m.clone(), *c);
                continue;
            }
            let mut product = Polynomial::constant(*c);
            for (atom, e) in m.factors() {
                let factor = match atom {
                    Atom::Symbol(s) if s == name => replacement.pow_rational(*e),
                    Atom::Opaque { expr, .. } if expr.contains_symbol(name) => {
                        let substituted = expr.substitute(name, &replacement.to_expr()).simplify();
                        Polynomial::from_expr(&substituted).pow_rational(*e)
                    }
                    _ => Polynomial::term(Monomial::atom(atom.clone(), *e), Rational::ONE),
                };
                product = &product * &factor;
            }
            out += &product;
        }
        out
    }

    /// Groups terms by the exponent of a symbol; the symbol is removed from each group.
    pub fn collect_by(&self, name: &str) -> BTreeMap<Rational, Polynomial> {
        let mut groups: BTreeMap<Rational, Polynomial> = BTreeMap::new();
        for (m, c) in &self.terms {
            groups
                .entry(m.exponent_of(name))
                .or_default()
                .add_term(m.without(name), *c);
        }
        groups
    }

    /// Coefficient of `name^exponent`.
    pub fn coefficient(&self, name: &str, exponent: Rational) -> Polynomial {
        self.collect_by(name).remove(&exponent).unwrap_or_default()
    }

    pub fn contains_symbol(&self, name: &str) -> bool {
        self.terms.keys().any(|m| m.contains_symbol(name))
    }

    /// True if the symbol occurs inside an opaque atom of some term.
    pub fn opaque_contains(&self, name: &str) -> bool {
        self.terms.keys().any(|m| m.opaque_contains(name))
    }

    /// All symbol names, including those inside opaque atoms.
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for m in self.terms.keys() {
            for (atom, _) in m.factors() {
                match atom {
                    Atom::Symbol(s) => {
                        out.insert(s.clone());
                    }
                    Atom::Opaque { expr, .. } => out.extend(expr.symbols()),
                }
            }
        }
        out
    }

    pub fn eval(&self, values: &HashMap<String, f64>) -> Result<f64, String> {
        self.terms
            .iter()
            .try_fold(0.0, |acc, (m, c)| Ok(acc + c.to_f64() * m.eval(values)?))
    }

    /// Greatest term in the lexicographic monomial order.
    pub fn leading_term(&self) -> Option<(&Monomial, &Rational)> {
        self.terms.iter().max_by(|a, b| a.0.lex_cmp(b.0))
    }

    /// Smallest term in the lexicographic monomial order.
    pub fn trailing_term(&self) -> Option<(&Monomial, &Rational)> {
        self.terms.iter().min_by(|a, b| a.0.lex_cmp(b.0))
    }

    /// Exact division.
    ///
    /// Returns `Ok(None)` when `divisor` does not divide `self`. Every reduction step
    /// is charged to the budget.
    pub fn div_exact(
        &self,
        divisor: &Polynomial,
        budget: &mut SolveBudget,
    ) -> Result<Option<Polynomial>, DerivationError> {
        let (Some((lead_m, lead_c)), Some((trail_m, _))) =
            (divisor.leading_term(), divisor.trailing_term())
        else {
            return Ok(None);
        };
        let overflow = || DerivationError::CoefficientOverflow("exact division".to_string());
        if let Some(c) = divisor.as_constant() {
            return match c.recip() {
                Some(inv) => self.checked_scale(inv).map(Some).ok_or_else(overflow),
                None => Ok(None),
            };
        }
        let Some((num_trail, _)) = self.trailing_term() else {
            return Ok(Some(Polynomial::zero()));
        };
        // no quotient term can be smaller than this
        let floor = num_trail.div(trail_m);

        let mut quotient = Polynomial::zero();
        let mut remainder = self.clone();
        while let Some((m, c)) = remainder.leading_term() {
            budget.charge(remainder.len() + divisor.len())?;
            let q_m = m.div(lead_m);
            if q_m.lex_cmp(&floor) == Ordering::Less {
                return Ok(None);
            }
            let q_c = c.checked_div(*lead_c).ok_or_else(overflow)?;
            remainder = divisor
                .checked_mul(&Polynomial::term(q_m.clone(), q_c))
                .and_then(|product| remainder.checked_sub(&product))
                .ok_or_else(overflow)?;
            quotient.add_term(q_m, q_c);
        }
        Ok(Some(quotient))
    }
}

impl fmt::Display for Polynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "0");
        }
        for (i, (m, c)) in self.terms.iter().enumerate() {
            let magnitude = if c.is_negative() { -*c } else { *c };
            match (i, c.is_negative()) {
                (0, true) => write!(f, "-")?,
                (0, false) => {}
                (_, true) => write!(f, " - ")?,
                (_, false) => write!(f, " + ")?,
            }
            if m.is_one() {
                write!(f, "{magnitude}")?;
            } else if magnitude == Rational::ONE {
                write!(f, "{m}")?;
            } else {
                write!(f, "{magnitude}*{m}")?;
            }
        }
        Ok(())
    }
}

impl<'a> Add<&'a Polynomial> for &'a Polynomial {
    type Output = Polynomial;
    fn add(self, rhs: &'a Polynomial) -> Polynomial {
        let mut out = self.clone();
        out += rhs;
        out
    }
}

impl Add for Polynomial {
    type Output = Polynomial;
    fn add(mut self, rhs: Polynomial) -> Polynomial {
        self += &rhs;
        self
    }
}

impl<'a> Sub<&'a Polynomial> for &'a Polynomial {
    type Output = Polynomial;
    fn sub(self, rhs: &'a Polynomial) -> Polynomial {
        let mut out = self.clone();
        out -= rhs;
        out
    }
}

impl Sub for Polynomial {
    type Output = Polynomial;
    fn sub(mut self, rhs: Polynomial) -> Polynomial {
        self -= &rhs;
        self
    }
}

impl<'a> Mul<&'a Polynomial> for &'a Polynomial {
    type Output = Polynomial;
    fn mul(self, rhs: &'a Polynomial) -> Polynomial {
        let mut out = Polynomial::zero();
        for (m1, c1) in &self.terms {
            for (m2, c2) in &rhs.terms {
                out.add_term(m1.mul(m2), *c1 * *c2);
            }
        }
        out
    }
}

impl Mul for Polynomial {
    type Output = Polynomial;
    fn mul(self, rhs: Polynomial) -> Polynomial {
        &self * &rhs
    }
}

impl Neg for Polynomial {
    type Output = Polynomial;
    fn neg(self) -> Polynomial {
        self.scale(-Rational::ONE)
    }
}

impl AddAssign<&Polynomial> for Polynomial {
    fn add_assign(&mut self, rhs: &Polynomial) {
        for (m, c) in &rhs.terms {
            self.add_term(m.clone(), *c);
        }
    }
}

impl SubAssign<&Polynomial> for Polynomial {
    fn sub_assign(&mut self, rhs: &Polynomial) {
        for (m, c) in &rhs.terms {
            self.add_term(m.clone(), -*c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse_expr;

    fn poly(text: &str) -> Polynomial {
        Polynomial::from_expr(&parse_expr(text).unwrap())
    }

    #[test]
    fn test_rational_arithmetic() {
        let half = Rational::new(1, 2);
        let third = Rational::new(-2, -6);
        assert_eq!(half + third, Rational::new(5, 6));
        assert_eq!(half * third, Rational::new(1, 6));
        assert_eq!(Rational::new(4, -8), Rational::new(-1, 2));
        assert_eq!(Rational::from_f64(0.25), Some(Rational::new(1, 4)));
        assert_eq!(Rational::from_f64(0.1), Some(Rational::new(1, 10)));
        assert_eq!(Rational::new(3, 1).to_string(), "3");
        assert_eq!(Rational::new(-3, 4).to_string(), "-3/4");
        assert!(Rational::new(1, 3) < Rational::new(1, 2));
    }

    #[test]
    fn test_canonical_form() {
        // (a + b)^2 - a^2 - b^2 == 2*a*b
        assert_eq!(poly("(a + b)^2 - a^2 - b^2"), poly("2*a*b"));
        assert_eq!(poly("x*y - y*x"), Polynomial::zero());
        assert_eq!(poly("a/b * b"), poly("a"));
    }

    #[test]
    fn test_sqrt_powers_collect() {
        // V * sqrt(V) / V^2 == V^(-1/2)
        let p = poly("V * sqrt(V) / V^2");
        assert_eq!(p, Polynomial::symbol_pow("V", Rational::new(-1, 2)));
        let q = poly("k*V + sqrt(V)*eta + 3");
        let groups = q.collect_by("V");
        assert_eq!(groups[&Rational::ONE], poly("k"));
        assert_eq!(groups[&Rational::new(1, 2)], poly("eta"));
        assert_eq!(groups[&Rational::ZERO], poly("3"));
    }

    #[test]
    fn test_opaque_atoms() {
        let p = poly("exp(k) * A + 1/(a + b)");
        assert!(p.opaque_contains("a"));
        assert!(!p.opaque_contains("A"));
        assert_eq!(
            p.symbols().into_iter().collect::<Vec<_>>(),
            vec!["A", "a", "b", "k"]
        );
        let values = HashMap::from([
            ("A".to_string(), 2.0),
            ("a".to_string(), 1.0),
            ("b".to_string(), 3.0),
            ("k".to_string(), 0.0),
        ]);
        assert!((p.eval(&values).unwrap() - 2.25).abs() < 1e-12);
    }

    #[test]
    fn test_derivative_and_substitute() {
        let p = poly("x^3*y + 2*x");
        assert_eq!(p.derivative("x"), poly("3*x^2*y + 2"));
        let q = p.substitute("x", &poly("y + 1"));
        assert_eq!(q, poly("(y + 1)^3*y + 2*y + 2"));
    }

    #[test]
    fn test_exact_division() {
        let mut budget = SolveBudget::default();
        let product = poly("(a + b)*(a - 2*c)");
        let quotient = product.div_exact(&poly("a + b"), &mut budget).unwrap();
        assert_eq!(quotient, Some(poly("a - 2*c")));
        let not_divisible = poly("a^2 + 1").div_exact(&poly("a + b"), &mut budget).unwrap();
        assert_eq!(not_divisible, None);
    }

    #[test]
    fn test_checked_rational_overflow() {
        let big = Rational::new(1 << 100, 1);
        assert_eq!(big.checked_mul(big), None);
        assert_eq!(big.checked_add(big), Some(Rational::new(1 << 101, 1)));
        assert_eq!(Rational::new(i128::MAX, 1).checked_add(Rational::ONE), None);
        // cross-cancellation keeps representable products exact
        assert_eq!(
            Rational::new(1 << 100, 3).checked_mul(Rational::new(3, 1 << 100)),
            Some(Rational::ONE)
        );
        assert_eq!(
            Rational::new(i128::MAX, 3).cmp(&Rational::new(i128::MAX, 2)),
            Ordering::Less
        );
    }

    #[test]
    fn test_division_overflow_is_an_error() {
        let big = Rational::new(1 << 100, 1);
        let product = &poly("a^2").scale(big) + &Polynomial::one();
        let divisor = &poly("a") + &Polynomial::constant(big);
        let mut budget = SolveBudget::default();
        assert!(matches!(
            product.div_exact(&divisor, &mut budget),
            Err(DerivationError::CoefficientOverflow(_))
        ));
    }

    #[test]
    fn test_budget_exhausted() {
        let mut budget = SolveBudget::new(1);
        let result = poly("(a + b)*(a + c)").div_exact(&poly("a + b"), &mut budget);
        assert!(matches!(result, Err(DerivationError::Timeout { .. })));
    }

    #[test]
    fn test_display() {
        assert_eq!(poly("2*k*A - B").to_string(), "2*A*k - B");
        assert_eq!(poly("sqrt(V)/2").to_string(), "1/2*V^(1/2)");
        assert_eq!(Polynomial::zero().to_string(), "0");
    }
}
