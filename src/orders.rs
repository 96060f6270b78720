//! Separation of the expansion by powers of the system size.
//!
//! The `sqrt(V)` terms give the mean-field equations of the fractions `Phi_X`; the
//! `V^0` terms give the linear Fokker-Planck equation of the noise.

use crate::errors::DerivationError;
use crate::expansion::{
    noise_symbol, phi_rate_symbol, phi_symbol, DensityForm, DerivIndex, VanKampenExpansion,
};
use crate::expr::Expr;
use crate::master::SYSTEM_SIZE;
use crate::poly::{Polynomial, Rational};
use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Both sides of the expansion grouped by the exponent of `V`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedTerms {
    pub reactants: Vec<String>,
    pub lhs: BTreeMap<Rational, DensityForm>,
    pub rhs: BTreeMap<Rational, DensityForm>,
}

impl OrderedTerms {
    pub fn lhs_order(&self, exponent: Rational) -> DensityForm {
        self.lhs.get(&exponent).cloned().unwrap_or_default()
    }

    pub fn rhs_order(&self, exponent: Rational) -> DensityForm {
        self.rhs.get(&exponent).cloned().unwrap_or_default()
    }
}

fn group(form: &DensityForm) -> BTreeMap<Rational, DensityForm> {
    let mut groups: BTreeMap<Rational, DensityForm> = BTreeMap::new();
    for (index, coefficient) in form.terms() {
        if coefficient.opaque_contains(SYSTEM_SIZE) {
            // only the explicit power is collected, the rest stays in the coefficient
            warn!(
                term = %index,
                "system size inside a non-polynomial factor, collecting explicit powers only"
            );
        }
        for (exponent, part) in coefficient.collect_by(SYSTEM_SIZE) {
            groups.entry(exponent).or_default().add_term(index.clone(), &part);
        }
    }
    groups.retain(|_, form| !form.is_zero());
    groups
}

/// Groups every term of the expansion by its power of `V`.
pub fn separate_orders(expansion: &VanKampenExpansion) -> OrderedTerms {
    OrderedTerms {
        reactants: expansion.reactants.clone(),
        lhs: group(&expansion.lhs),
        rhs: group(&expansion.rhs),
    }
}

/// Linear Fokker-Planck equation `dP/dt = rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct FokkerPlanck {
    pub reactants: Vec<String>,
    pub rhs: DensityForm,
}

impl FokkerPlanck {
    pub fn noise_symbols(&self) -> Vec<String> {
        self.reactants.iter().map(|r| noise_symbol(r)).collect()
    }
}

/// Fokker-Planck equation from the `V^0` terms.
pub fn fokker_planck(ordered: &OrderedTerms) -> FokkerPlanck {
    let mut rhs = ordered.rhs_order(Rational::ZERO);
    for (index, coefficient) in ordered.lhs_order(Rational::ZERO).terms() {
        if *index != DerivIndex::time() {
            rhs.add_term(index.clone(), &-coefficient.clone());
        }
    }
    FokkerPlanck {
        reactants: ordered.reactants.clone(),
        rhs,
    }
}

/// `Phi_S` replacement for a substituted reactant: reactants become fractions and
/// every other symbol becomes 1.
fn fraction_substitution(reactants: &[String], expr: &Expr) -> Polynomial {
    let mut substituted = expr.clone();
    for symbol in expr.symbols() {
        let replacement = if reactants.contains(&symbol) {
            Expr::var(&phi_symbol(&symbol))
        } else {
            Expr::Const(1.0)
        };
        substituted = *substituted.substitute(&symbol, &replacement);
    }
    Polynomial::from_expr(&substituted.simplify())
}

/// Mean-field equations `dPhi_X/dt` from the `sqrt(V)` terms.
///
/// # Errors
/// `DerivationError::NoSolution` if an equation is not linear in its `dPhi_X/dt` with
/// a constant coefficient.
pub fn mean_field_odes(
    ordered: &OrderedTerms,
    substitution: Option<&(String, Expr)>,
) -> Result<BTreeMap<String, Polynomial>, DerivationError> {
    let half = Rational::new(1, 2);
    let mut equation = ordered.lhs_order(half);
    equation.sub(&ordered.rhs_order(half));

    let mut odes = BTreeMap::new();
    for reactant in &ordered.reactants {
        if substitution.is_some_and(|(name, _)| name == reactant) {
            continue;
        }
        let eta = noise_symbol(reactant);
        let Some(ode) = equation.coefficient(&DerivIndex::noise([eta.as_str()])) else {
            continue;
        };
        let unknown = phi_rate_symbol(reactant);
        let slope = ode.coefficient(&unknown, Rational::ONE);
        let rest = ode.coefficient(&unknown, Rational::ZERO);
        let Some(inverse) = slope.as_constant().and_then(|c| c.recip()) else {
            return Err(DerivationError::NoSolution(format!(
                "{unknown} in {ode}"
            )));
        };
        let mut solution = rest.scale(-inverse);
        if let Some((name, expr)) = substitution {
            let replacement = fraction_substitution(&ordered.reactants, expr);
            solution = solution.substitute(&phi_symbol(name), &replacement);
        }
        odes.insert(reactant.clone(), solution);
    }

    for (index, _) in equation.terms() {
        if index.order() != 1 {
            warn!(term = %index, "unexpected term among the mean-field equations");
        }
    }
    Ok(odes)
}

impl fmt::Display for FokkerPlanck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} = {}", "dP/dt".cyan(), self.rhs)
    }
}

impl fmt::Display for OrderedTerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (side, groups) in [("lhs", &self.lhs), ("rhs", &self.rhs)] {
            for (exponent, form) in groups {
                writeln!(f, "{} V^({exponent}): {form}", side.green())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse_expr;
    use crate::expansion::van_kampen_expand;
    use crate::master::derive_master_equation;
    use crate::parser::parse_rules;
    use crate::stoichiometry::Stoichiometry;

    fn poly(text: &str) -> Polynomial {
        Polynomial::from_expr(&parse_expr(text).unwrap())
    }

    fn ordered(text: &str) -> OrderedTerms {
        let parsed = parse_rules(text).unwrap();
        let stoich = Stoichiometry::build(&parsed.rules, &parsed.constant_reactants).unwrap();
        separate_orders(&van_kampen_expand(&derive_master_equation(&stoich).unwrap()))
    }

    #[test]
    fn test_mean_field_matches_mass_action() {
        let terms = ordered("A + B -> A + A : k\nA -> B : g");
        let odes = mean_field_odes(&terms, None).unwrap();
        assert_eq!(odes["A"], poly("k*Phi_A*Phi_B - g*Phi_A"));
        assert_eq!(odes["B"], poly("g*Phi_A - k*Phi_A*Phi_B"));
    }

    #[test]
    fn test_mean_field_dimerisation() {
        let terms = ordered("A + A -> B + B : k\nB -> A : g");
        let odes = mean_field_odes(&terms, None).unwrap();
        assert_eq!(odes["A"], poly("-2*k*Phi_A^2 + g*Phi_B"));
    }

    #[test]
    fn test_substituted_ode_omitted() {
        let terms = ordered("A -> B : k\nB -> A : g");
        let substitution = ("B".to_string(), parse_expr("N - A").unwrap());
        let odes = mean_field_odes(&terms, Some(&substitution)).unwrap();
        assert_eq!(odes.keys().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(odes["A"], poly("g - g*Phi_A - k*Phi_A"));
    }

    #[test]
    fn test_fokker_planck() {
        let terms = ordered("A -> B : k\nB -> A : g");
        let fpe = fokker_planck(&terms);
        assert_eq!(
            fpe.rhs.coefficient(&DerivIndex::noise(["eta_A"])),
            Some(&poly("k*eta_A - g*eta_B"))
        );
        assert_eq!(
            fpe.rhs.coefficient(&DerivIndex::density()),
            Some(&poly("k + g"))
        );
        assert_eq!(fpe.noise_symbols(), vec!["eta_A", "eta_B"]);
        assert!(fpe.rhs.coefficient(&DerivIndex::time()).is_none());
    }
}
