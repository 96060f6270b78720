//! van Kampen system-size expansion of the Master equation.
//!
//! Populations are written as `n_X = V Phi_X + sqrt(V) eta_X`, with `Phi_X` the
//! deterministic fraction and `eta_X` the noise. The step operators are truncated
//! at second order:
//!
//! ```text
//! E(X, s) f ≈ f + s/sqrt(V) ∂f/∂eta_X + s²/(2V) ∂²f/∂eta_X²
//! ```
//!
//! and the density `P(eta, t)` is kept formal: results are linear differential forms
//! `Σ c_α ∂^α P` with polynomial coefficients.

use crate::master::{MasterEquation, SYSTEM_SIZE};
use crate::poly::{Polynomial, Rational};
use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt;

pub fn noise_symbol(reactant: &str) -> String {
    format!("eta_{reactant}")
}

pub fn phi_symbol(reactant: &str) -> String {
    format!("Phi_{reactant}")
}

/// Symbol standing for `dPhi_X/dt`.
pub fn phi_rate_symbol(reactant: &str) -> String {
    format!("dPhi_{reactant}/dt")
}

/// Formal derivative of the density `P`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DerivIndex {
    /// Time derivative `∂P/∂t`
    pub time: bool,
    /// Order of the derivative per noise symbol
    pub noise: BTreeMap<String, u32>,
}

impl DerivIndex {
    /// The density itself.
    pub fn density() -> Self {
        Self::default()
    }

    pub fn time() -> Self {
        Self {
            time: true,
            noise: BTreeMap::new(),
        }
    }

    /// `∂P/∂eta` for each given noise symbol (repeats raise the order).
    pub fn noise<'a>(symbols: impl IntoIterator<Item = &'a str>) -> Self {
        let mut index = Self::default();
        for symbol in symbols {
            *index.noise.entry(symbol.to_string()).or_insert(0) += 1;
        }
        index
    }

    /// Total order of the noise derivative.
    pub fn order(&self) -> u32 {
        self.noise.values().sum()
    }

    fn raised(&self, symbol: &str) -> Self {
        let mut index = self.clone();
        *index.noise.entry(symbol.to_string()).or_insert(0) += 1;
        index
    }
}

impl fmt::Display for DerivIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.time {
            return write!(f, "dP/dt");
        }
        match self.order() {
            0 => write!(f, "P"),
            order => {
                let prefix = if order == 1 {
                    "d".to_string()
                } else {
                    format!("d^{order}")
                };
                write!(f, "{prefix}P/")?;
                for (symbol, k) in &self.noise {
                    if *k == 1 {
                        write!(f, "d{symbol}")?;
                    } else {
                        write!(f, "d{symbol}^{k}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Linear differential form `Σ c_α ∂^α P`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DensityForm {
    terms: BTreeMap<DerivIndex, Polynomial>,
}

impl DensityForm {
    pub fn zero() -> Self {
        Self::default()
    }

    /// `coefficient * ∂^index P`
    pub fn single(index: DerivIndex, coefficient: Polynomial) -> Self {
        let mut form = Self::zero();
        form.add_term(index, &coefficient);
        form
    }

    pub fn add_term(&mut self, index: DerivIndex, coefficient: &Polynomial) {
        if coefficient.is_zero() {
            return;
        }
        let entry = self.terms.entry(index.clone()).or_default();
        *entry += coefficient;
        if entry.is_zero() {
            self.terms.remove(&index);
        }
    }

    pub fn terms(&self) -> impl Iterator<Item = (&DerivIndex, &Polynomial)> {
        self.terms.iter()
    }

    pub fn coefficient(&self, index: &DerivIndex) -> Option<&Polynomial> {
        self.terms.get(index)
    }

    pub fn is_zero(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn add(&mut self, other: &DensityForm) {
        for (index, coefficient) in &other.terms {
            self.add_term(index.clone(), coefficient);
        }
    }

    pub fn sub(&mut self, other: &DensityForm) {
        for (index, coefficient) in &other.terms {
            self.add_term(index.clone(), &-coefficient.clone());
        }
    }

    /// Multiplies every coefficient by a polynomial.
    pub fn mul(&self, factor: &Polynomial) -> DensityForm {
        let mut out = DensityForm::zero();
        for (index, coefficient) in &self.terms {
            out.add_term(index.clone(), &(coefficient * factor));
        }
        out
    }

    /// `∂/∂symbol` of the whole form, by the product rule.
    pub fn derivative(&self, symbol: &str) -> DensityForm {
        let mut out = DensityForm::zero();
        for (index, coefficient) in &self.terms {
            out.add_term(index.clone(), &coefficient.derivative(symbol));
            out.add_term(index.raised(symbol), coefficient);
        }
        out
    }

    /// Applies the truncated step operator `E(X, s)` acting on `eta_X`.
    pub fn step(&self, symbol: &str, shift: i64) -> DensityForm {
        let s = Rational::integer(shift);
        let first = self.derivative(symbol);
        let second = first.derivative(symbol);
        let mut out = self.clone();
        let first_scale = Polynomial::symbol_pow(SYSTEM_SIZE, Rational::new(-1, 2)).scale(s);
        let second_scale =
            Polynomial::symbol_pow(SYSTEM_SIZE, Rational::integer(-1)).scale(s * s * Rational::new(1, 2));
        out.add(&first.mul(&first_scale));
        out.add(&second.mul(&second_scale));
        out
    }
}

impl fmt::Display for DensityForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "0");
        }
        for (i, (index, coefficient)) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, "\n    + ")?;
            }
            write!(f, "({coefficient}) * {index}")?;
        }
        Ok(())
    }
}

/// Both sides of the expanded Master equation.
#[derive(Debug, Clone, PartialEq)]
pub struct VanKampenExpansion {
    pub reactants: Vec<String>,
    pub lhs: DensityForm,
    pub rhs: DensityForm,
    pub substitution: Option<(String, crate::expr::Expr)>,
}

/// Expands the Master equation in powers of `1/sqrt(V)`.
pub fn van_kampen_expand(master: &MasterEquation) -> VanKampenExpansion {
    let sqrt_size = Polynomial::symbol_pow(SYSTEM_SIZE, Rational::new(1, 2));
    let size = Polynomial::symbol(SYSTEM_SIZE);

    let mut lhs = DensityForm::single(DerivIndex::time(), Polynomial::one());
    for reactant in &master.reactants {
        let eta = noise_symbol(reactant);
        let coefficient = -(&sqrt_size * &Polynomial::symbol(&phi_rate_symbol(reactant)));
        lhs.add_term(DerivIndex::noise([eta.as_str()]), &coefficient);
    }

    let mut rhs = DensityForm::zero();
    for term in &master.terms {
        let mut transition = term.transition.clone();
        for reactant in &master.reactants {
            let population = &(&size * &Polynomial::symbol(&phi_symbol(reactant)))
                + &(&sqrt_size * &Polynomial::symbol(&noise_symbol(reactant)));
            transition = transition.substitute(reactant, &population);
        }
        let func = DensityForm::single(DerivIndex::density(), transition);

        let mut expanded = func.clone();
        for (reactant, shift) in term.shifts.iter().rev() {
            expanded = expanded.step(&noise_symbol(reactant), *shift);
        }
        expanded.sub(&func);

        let mut rate = term.rate.clone();
        for constant in &master.constants {
            let scaled = &size * &Polynomial::symbol(&phi_symbol(constant));
            rate = rate.substitute(constant, &scaled);
        }
        rhs.add(&expanded.mul(&rate));
    }

    tracing::debug!(
        lhs_terms = lhs.terms.len(),
        rhs_terms = rhs.terms.len(),
        "van Kampen expansion done"
    );
    VanKampenExpansion {
        reactants: master.reactants.clone(),
        lhs,
        rhs,
        substitution: master.substitution.clone(),
    }
}

impl fmt::Display for VanKampenExpansion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "Left hand side".cyan())?;
        writeln!(f, "    {}", self.lhs)?;
        writeln!(f, "{}", "Right hand side".cyan())?;
        writeln!(f, "    {}", self.rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse_expr;
    use crate::master::derive_master_equation;
    use crate::parser::parse_rules;
    use crate::stoichiometry::Stoichiometry;

    fn poly(text: &str) -> Polynomial {
        Polynomial::from_expr(&parse_expr(text).unwrap())
    }

    fn expansion(text: &str) -> VanKampenExpansion {
        let parsed = parse_rules(text).unwrap();
        let stoich = Stoichiometry::build(&parsed.rules, &parsed.constant_reactants).unwrap();
        van_kampen_expand(&derive_master_equation(&stoich).unwrap())
    }

    #[test]
    fn test_product_rule() {
        // ∂/∂x (x^2 P) = 2x P + x^2 ∂P/∂x
        let form = DensityForm::single(DerivIndex::density(), poly("x^2"));
        let d = form.derivative("x");
        assert_eq!(d.coefficient(&DerivIndex::density()), Some(&poly("2*x")));
        assert_eq!(d.coefficient(&DerivIndex::noise(["x"])), Some(&poly("x^2")));
    }

    #[test]
    fn test_lhs() {
        let vke = expansion("A -> B : k\nB -> A : g");
        assert_eq!(
            vke.lhs.coefficient(&DerivIndex::time()),
            Some(&Polynomial::one())
        );
        assert_eq!(
            vke.lhs.coefficient(&DerivIndex::noise(["eta_A"])),
            Some(&-(&Polynomial::symbol_pow("V", Rational::new(1, 2))
                * &Polynomial::symbol("dPhi_A/dt")))
        );
    }

    #[test]
    fn test_linear_conversion_terms() {
        // A -> B : k gives drift k Phi_A (∂_A - ∂_B) P at order sqrt(V)
        let vke = expansion("A -> B : k\nB -> A : g");
        let drift_a = vke.rhs.coefficient(&DerivIndex::noise(["eta_A"])).unwrap();
        assert_eq!(
            drift_a.coefficient("V", Rational::new(1, 2)),
            poly("k*Phi_A - g*Phi_B")
        );
        assert_eq!(
            drift_a.coefficient("V", Rational::ZERO),
            poly("k*eta_A - g*eta_B")
        );
        // the second order step leaves a k/sqrt(V) drift that later orders drop
        assert_eq!(
            drift_a.coefficient("V", Rational::new(-1, 2)),
            poly("k")
        );
        // diffusion: (k Phi_A + g Phi_B)/2 on both diagonals, minus on the mixed term
        let diag = vke.rhs.coefficient(&DerivIndex::noise(["eta_A", "eta_A"])).unwrap();
        let mixed = vke.rhs.coefficient(&DerivIndex::noise(["eta_A", "eta_B"])).unwrap();
        assert_eq!(
            diag.coefficient("V", Rational::ZERO),
            poly("(k*Phi_A + g*Phi_B)/2")
        );
        assert_eq!(
            mixed.coefficient("V", Rational::ZERO),
            poly("-(k*Phi_A + g*Phi_B)")
        );
    }

    #[test]
    fn test_index_display() {
        assert_eq!(DerivIndex::time().to_string(), "dP/dt");
        assert_eq!(DerivIndex::density().to_string(), "P");
        assert_eq!(
            DerivIndex::noise(["eta_A", "eta_B"]).to_string(),
            "d^2P/deta_Adeta_B"
        );
    }
}
