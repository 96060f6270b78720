//! Chemical Master equation of a stoichiometry.
//!
//! Each reaction contributes `rate * (∏ E(X, s_X) - 1) T(n) P(n, t)`, where the step
//! operator `E(X, s)` shifts the population of `X` by `s`, and `T` is the falling
//! factorial transition probability normalised by the system size `V`.

use crate::errors::ModelError;
use crate::expr::Expr;
use crate::poly::{Polynomial, Rational};
use crate::stoichiometry::{StoichEntry, Stoichiometry};
use colored::Colorize;
use std::fmt;

/// Name of the system size symbol.
pub const SYSTEM_SIZE: &str = "V";

/// Number of variable reactants the expansion machinery supports.
pub const SUPPORTED_REACTANTS: std::ops::RangeInclusive<usize> = 2..=4;

/// Contribution of one reaction.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterTerm {
    pub reaction: String,
    /// Non-zero step sizes `consumed - produced`, in reactant order
    pub shifts: Vec<(String, i64)>,
    /// `V * ∏ n(n-1)...(n-c+1) / V^c` over the variable reactants
    pub transition: Polynomial,
    /// Rate times `X/V` for every constant reactant `X`
    pub rate: Polynomial,
}

/// Master equation `dP/dt = Σ terms`.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterEquation {
    pub reactants: Vec<String>,
    pub constants: Vec<String>,
    pub terms: Vec<MasterTerm>,
    pub substitution: Option<(String, Expr)>,
}

/// `x (x-1) ... (x-k+1)`
pub fn falling_factorial(x: &Polynomial, k: u32) -> Polynomial {
    (0..k).fold(Polynomial::one(), |acc, j| {
        &acc * &(x - &Polynomial::integer(j as i64))
    })
}

/// Derives the Master equation.
///
/// # Errors
/// `ModelError::UnsupportedReactantCount` unless there are 2 to 4 variable reactants.
pub fn derive_master_equation(stoich: &Stoichiometry) -> Result<MasterEquation, ModelError> {
    let reactants = stoich.variable_reactants();
    if !SUPPORTED_REACTANTS.contains(&reactants.len()) {
        return Err(ModelError::UnsupportedReactantCount(reactants.len()));
    }
    let inverse_size = Polynomial::symbol_pow(SYSTEM_SIZE, Rational::integer(-1));

    let terms = stoich
        .reactions
        .iter()
        .map(|reaction| {
            let mut shifts = Vec::new();
            let mut transition = Polynomial::symbol(SYSTEM_SIZE);
            let mut rate = Polynomial::from_expr(&reaction.rate);
            for (name, entry) in &reaction.entries {
                match entry {
                    StoichEntry::Const => {
                        rate = &rate * &(&Polynomial::symbol(name) * &inverse_size);
                    }
                    StoichEntry::Change { consumed, .. } => {
                        if entry.shift() != 0 {
                            shifts.push((name.clone(), entry.shift()));
                        }
                        let n = Polynomial::symbol(name);
                        transition = &transition
                            * &(&falling_factorial(&n, *consumed)
                                * &inverse_size.pow(*consumed));
                    }
                }
            }
            MasterTerm {
                reaction: reaction.name(),
                shifts,
                transition,
                rate,
            }
        })
        .collect();

    Ok(MasterEquation {
        reactants,
        constants: stoich.constant_reactants(),
        terms,
        substitution: stoich.substitution(),
    })
}

impl fmt::Display for MasterEquation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let density = format!("P({}, t)", self.reactants.join(", "));
        writeln!(f, "{} = ", format!("d{density}/dt").cyan())?;
        for term in &self.terms {
            let operators = term
                .shifts
                .iter()
                .map(|(name, s)| format!("E_op({name}, {s})"))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(
                f,
                "    + ({}) * ({operators} - 1) * ({}) * {density}    {}",
                term.rate,
                term.transition,
                format!("[{}]", term.reaction).dimmed()
            )?;
        }
        if let Some((name, expr)) = &self.substitution {
            writeln!(f, "    {}: {name} = {expr}", "with".yellow())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse_expr;
    use crate::parser::parse_rules;

    fn master(text: &str) -> Result<MasterEquation, ModelError> {
        let parsed = parse_rules(text).unwrap();
        let stoich = Stoichiometry::build(&parsed.rules, &parsed.constant_reactants).unwrap();
        derive_master_equation(&stoich)
    }

    fn poly(text: &str) -> Polynomial {
        Polynomial::from_expr(&parse_expr(text).unwrap())
    }

    #[test]
    fn test_transition_and_shifts() {
        let me = master("A + A -> B + B : k\n(X) + B -> A + (X) : g").unwrap();
        assert_eq!(me.reactants, vec!["A", "B"]);
        assert_eq!(me.constants, vec!["X"]);

        let dimer = &me.terms[0];
        assert_eq!(dimer.shifts, vec![("A".to_string(), 2), ("B".to_string(), -2)]);
        // V * A(A-1)/V^2
        assert_eq!(dimer.transition, poly("A*(A - 1)/V"));
        assert_eq!(dimer.rate, poly("k"));

        let catalysed = &me.terms[1];
        assert_eq!(catalysed.shifts, vec![("A".to_string(), -1), ("B".to_string(), 1)]);
        assert_eq!(catalysed.transition, poly("B"));
        assert_eq!(catalysed.rate, poly("g*X/V"));
    }

    #[test]
    fn test_reactant_count_checked() {
        assert!(matches!(
            master("A -> \\emptyset : k"),
            Err(ModelError::UnsupportedReactantCount(1))
        ));
        assert!(matches!(
            master("A + B -> C + D : k\nD -> E : g"),
            Err(ModelError::UnsupportedReactantCount(5))
        ));
    }

    #[test]
    fn test_falling_factorial() {
        let x = Polynomial::symbol("x");
        assert_eq!(falling_factorial(&x, 0), Polynomial::one());
        assert_eq!(falling_factorial(&x, 3), poly("x^3 - 3*x^2 + 2*x"));
    }
}
