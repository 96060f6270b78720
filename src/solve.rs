//! Linear systems over polynomials.
//!
//! Fraction-free Gauss-Jordan elimination (Bareiss): every update is divided exactly
//! by the previous pivot, so entries stay polynomial and their size stays bounded.
//! After elimination every pivot entry equals the last pivot `d`, and each unknown is
//! `b_i / d`.

use crate::errors::DerivationError;
use crate::poly::{Polynomial, SolveBudget};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Quotient of two polynomials.
#[derive(Debug, Clone, PartialEq)]
pub struct Fraction {
    pub num: Polynomial,
    pub den: Polynomial,
}

impl Fraction {
    pub fn zero() -> Self {
        Self {
            num: Polynomial::zero(),
            den: Polynomial::one(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.num.is_zero()
    }

    pub fn eval(&self, values: &HashMap<String, f64>) -> Result<f64, String> {
        Ok(self.num.eval(values)? / self.den.eval(values)?)
    }

    /// Divides out common candidate factors and normalises the denominator sign.
    fn reduce(
        mut self,
        candidates: &[Polynomial],
        budget: &mut SolveBudget,
    ) -> Result<Fraction, DerivationError> {
        if self.num.is_zero() {
            return Ok(Fraction::zero());
        }
        for candidate in candidates {
            if candidate.as_constant().is_some() {
                continue;
            }
            loop {
                let Some(den) = self.den.div_exact(candidate, budget)? else {
                    break;
                };
                let Some(num) = self.num.div_exact(candidate, budget)? else {
                    break;
                };
                // Laurent division always succeeds by monomials; only keep true factors
                if (has_negative_exponent(&den) && !has_negative_exponent(&self.den))
                    || (has_negative_exponent(&num) && !has_negative_exponent(&self.num))
                {
                    break;
                }
                self.num = num;
                self.den = den;
            }
        }
        if let Some(inverse) = self.den.as_constant().and_then(|c| c.recip()) {
            let num = self.num.checked_scale(inverse).ok_or_else(|| {
                DerivationError::CoefficientOverflow("normalising a fraction".to_string())
            })?;
            return Ok(Fraction {
                num,
                den: Polynomial::one(),
            });
        }
        if self
            .den
            .leading_term()
            .is_some_and(|(_, c)| c.is_negative())
        {
            self.num = -self.num;
            self.den = -self.den;
        }
        Ok(self)
    }
}

fn has_negative_exponent(p: &Polynomial) -> bool {
    p.terms()
        .any(|(m, _)| m.factors().any(|(_, e)| e.is_negative()))
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == Polynomial::one() {
            write!(f, "{}", self.num)
        } else {
            write!(f, "({}) / ({})", self.num, self.den)
        }
    }
}

/// Solves `matrix * x = rhs`.
///
/// Unknowns whose column has no pivot are set to zero.
///
/// # Errors
/// * `DerivationError::NoSolution` if the system is inconsistent
/// * `DerivationError::Timeout` if the budget runs out
pub fn solve_linear(
    matrix: &[Vec<Polynomial>],
    rhs: &[Polynomial],
    budget: &mut SolveBudget,
) -> Result<Vec<Fraction>, DerivationError> {
    let unknowns = matrix.first().map_or(0, Vec::len);
    let mut rows: Vec<Vec<Polynomial>> = matrix
        .iter()
        .zip(rhs)
        .map(|(row, b)| {
            let mut row = row.clone();
            row.push(b.clone());
            row
        })
        .collect();

    let mut candidates: Vec<Polynomial> = Vec::new();
    let mut pivot_rows: Vec<Option<usize>> = vec![None; unknowns];
    let mut previous = Polynomial::one();
    let mut rank = 0;

    for col in 0..unknowns {
        let Some(found) = (rank..rows.len()).find(|&i| !rows[i][col].is_zero()) else {
            warn!(column = col, "free unknown, set to zero");
            continue;
        };
        rows.swap(rank, found);
        let pivot = rows[rank][col].clone();

        for i in 0..rows.len() {
            if i == rank {
                continue;
            }
            let factor = rows[i][col].clone();
            for j in 0..=unknowns {
                if j == col {
                    continue;
                }
                budget.charge(pivot.len() * rows[i][j].len() + factor.len() * rows[rank][j].len())?;
                let cross = pivot
                    .checked_mul(&rows[i][j])
                    .zip(factor.checked_mul(&rows[rank][j]))
                    .and_then(|(left, right)| left.checked_sub(&right))
                    .ok_or_else(|| {
                        DerivationError::CoefficientOverflow(format!("elimination of column {col}"))
                    })?;
                rows[i][j] = cross.div_exact(&previous, budget)?.ok_or_else(|| {
                    DerivationError::NoSolution(format!("{cross} is not divisible by {previous}"))
                })?;
            }
            rows[i][col] = Polynomial::zero();
        }

        if pivot.as_constant().is_none() && !candidates.contains(&pivot) {
            candidates.push(pivot.clone());
        }
        pivot_rows[col] = Some(rank);
        previous = pivot;
        rank += 1;
    }

    if let Some(row) = rows[rank..].iter().find(|row| !row[unknowns].is_zero()) {
        return Err(DerivationError::NoSolution(format!(
            "0 = {}",
            row[unknowns]
        )));
    }

    for row in matrix {
        for entry in row {
            if entry.as_constant().is_none() && !candidates.contains(entry) {
                candidates.push(entry.clone());
            }
        }
    }

    let mut solution = Vec::with_capacity(unknowns);
    for pivot_row in pivot_rows {
        let value = match pivot_row {
            Some(r) => Fraction {
                num: rows[r][unknowns].clone(),
                den: previous.clone(),
            }
            .reduce(&candidates, budget)?,
            None => Fraction::zero(),
        };
        solution.push(value);
    }
    debug!(rank, unknowns, steps = budget.used(), "linear system solved");
    Ok(solution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse_expr;
    use crate::poly::Rational;

    fn poly(text: &str) -> Polynomial {
        Polynomial::from_expr(&parse_expr(text).unwrap())
    }

    fn values(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_symbolic_triangular() {
        let matrix = vec![vec![poly("a"), poly("1")], vec![poly("0"), poly("b")]];
        let rhs = vec![poly("c"), poly("d")];
        let x = solve_linear(&matrix, &rhs, &mut SolveBudget::default()).unwrap();
        let at = values(&[("a", 2.0), ("b", 4.0), ("c", 3.0), ("d", 8.0)]);
        // x1 = d/b, x0 = (c - d/b)/a
        assert!((x[1].eval(&at).unwrap() - 2.0).abs() < 1e-12);
        assert!((x[0].eval(&at).unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(x[1].num, poly("d"));
        assert_eq!(x[1].den, poly("b"));
    }

    #[test]
    fn test_numeric_needs_swap() {
        let matrix = vec![vec![poly("0"), poly("2")], vec![poly("3"), poly("1")]];
        let rhs = vec![poly("4"), poly("5")];
        let x = solve_linear(&matrix, &rhs, &mut SolveBudget::default()).unwrap();
        assert_eq!(x[0].num, poly("1"));
        assert_eq!(x[1].num, poly("2"));
        assert_eq!(x[0].den, Polynomial::one());
    }

    #[test]
    fn test_free_unknown_zero() {
        let matrix = vec![vec![poly("1"), poly("1")], vec![poly("2"), poly("2")]];
        let rhs = vec![poly("1"), poly("2")];
        let x = solve_linear(&matrix, &rhs, &mut SolveBudget::default()).unwrap();
        assert_eq!(x[0].num, poly("1"));
        assert!(x[1].is_zero());
    }

    #[test]
    fn test_inconsistent() {
        let matrix = vec![vec![poly("1"), poly("1")], vec![poly("1"), poly("1")]];
        let rhs = vec![poly("1"), poly("2")];
        assert!(matches!(
            solve_linear(&matrix, &rhs, &mut SolveBudget::default()),
            Err(DerivationError::NoSolution(_))
        ));
    }

    #[test]
    fn test_coefficient_overflow() {
        let big = Rational::new(1 << 100, 1);
        let matrix = vec![
            vec![poly("a").scale(big), poly("1")],
            vec![poly("1"), poly("b").scale(big)],
        ];
        let rhs = vec![poly("c"), poly("d")];
        assert!(matches!(
            solve_linear(&matrix, &rhs, &mut SolveBudget::default()),
            Err(DerivationError::CoefficientOverflow(_))
        ));
    }

    #[test]
    fn test_budget_exhausted() {
        let matrix = vec![
            vec![poly("a + b"), poly("c")],
            vec![poly("d"), poly("e + f")],
        ];
        let rhs = vec![poly("g"), poly("h")];
        assert!(matches!(
            solve_linear(&matrix, &rhs, &mut SolveBudget::new(1)),
            Err(DerivationError::Timeout { .. })
        ));
    }
}
