//! Equations of motion of the noise moments and their stationary solution.
//!
//! Multiplying the Fokker-Planck equation by `eta_i` (or `eta_i eta_j`) and integrating
//! over the noise turns each term `eta^β ∂^α P` into a moment: integration by parts
//! gives `(-1)^|α| <∂^α eta^β>`. Only the term shapes a linear Fokker-Planck equation
//! produces are tabulated; anything else is rejected.

use crate::errors::{DerivationError, SystemError};
use crate::expansion::{DerivIndex, DensityForm};
use crate::orders::FokkerPlanck;
use crate::poly::{Atom, Monomial, Polynomial, Rational, SolveBudget};
use crate::solve::{solve_linear, Fraction};
use colored::Colorize;
use itertools::Itertools;
use nalgebra::DMatrix;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

/// `<eta_X>`
pub fn first_moment(eta: &str) -> String {
    format!("<{eta}>")
}

/// `<eta_X eta_Y>` with the symbols in sorted order.
pub fn second_moment(a: &str, b: &str) -> String {
    if a <= b {
        format!("<{a} {b}>")
    } else {
        format!("<{b} {a}>")
    }
}

/// Powers of the noise symbols in a term.
type NoisePowers = BTreeMap<String, u32>;

/// (noise degree, derivative order) shapes of the first-moment equations
const FIRST_ORDER_SHAPES: [(u32, u32); 3] = [(1, 0), (2, 1), (1, 2)];
/// Additional shapes of the second-moment equations
const SECOND_ORDER_SHAPES: [(u32, u32); 3] = [(2, 0), (3, 1), (2, 2)];

/// Moment substitution tables keyed by noise powers and derivative.
#[derive(Debug, Clone)]
pub struct NoiseTables {
    symbols: Vec<String>,
    first: BTreeMap<(NoisePowers, DerivIndex), Polynomial>,
    second: BTreeMap<(NoisePowers, DerivIndex), Polynomial>,
}

fn powers_of<'a>(symbols: impl IntoIterator<Item = &'a String>) -> NoisePowers {
    let mut powers = NoisePowers::new();
    for s in symbols {
        *powers.entry(s.clone()).or_insert(0) += 1;
    }
    powers
}

fn monomials(symbols: &[String], degree: u32) -> Vec<NoisePowers> {
    symbols
        .iter()
        .combinations_with_replacement(degree as usize)
        .map(powers_of)
        .collect()
}

/// Moment polynomial of a product of noise symbols of degree at most two.
fn moment(powers: &NoisePowers) -> Polynomial {
    let factors: Vec<&String> = powers
        .iter()
        .flat_map(|(s, k)| std::iter::repeat(s).take(*k as usize))
        .collect();
    match factors.as_slice() {
        [] => Polynomial::one(),
        [a] => Polynomial::symbol(&first_moment(a)),
        [a, b] => Polynomial::symbol(&second_moment(a, b)),
        _ => Polynomial::zero(),
    }
}

/// `(-1)^|α| <∂^α eta^β>` by integration by parts.
fn integrate(powers: &NoisePowers, index: &DerivIndex, symbols: &[String]) -> Polynomial {
    let mut poly = Polynomial::one();
    for (s, k) in powers {
        poly = &poly * &Polynomial::symbol(s).pow(*k);
    }
    for (s, k) in &index.noise {
        for _ in 0..*k {
            poly = poly.derivative(s);
        }
    }
    if index.order() % 2 == 1 {
        poly = -poly;
    }
    let names: BTreeSet<String> = symbols.iter().cloned().collect();
    let mut out = Polynomial::zero();
    for (m, c) in poly.terms() {
        let (noise, rest) = m.split(&names);
        let mut term = Polynomial::term(rest, *c);
        term = &term * &moment(&noise_powers(&noise).unwrap_or_default());
        out += &term;
    }
    out
}

/// Non-negative integer powers of a monomial made of noise symbols.
fn noise_powers(noise: &Monomial) -> Option<NoisePowers> {
    let mut powers = NoisePowers::new();
    for (atom, e) in noise.factors() {
        let Atom::Symbol(name) = atom else {
            return None;
        };
        if !e.is_integer() || e.is_negative() {
            return None;
        }
        powers.insert(name.clone(), u32::try_from(e.numer()).ok()?);
    }
    Some(powers)
}

impl NoiseTables {
    pub fn new(noise_symbols: &[String]) -> Self {
        let build = |shapes: &[(u32, u32)]| {
            let mut table = BTreeMap::new();
            for &(degree, order) in shapes {
                for powers in monomials(noise_symbols, degree) {
                    for deriv in monomials(noise_symbols, order) {
                        let index = DerivIndex {
                            time: false,
                            noise: deriv,
                        };
                        let value = integrate(&powers, &index, noise_symbols);
                        table.entry((powers.clone(), index)).or_insert(value);
                    }
                }
            }
            table
        };
        Self {
            symbols: noise_symbols.to_vec(),
            first: build(&FIRST_ORDER_SHAPES),
            second: build(&SECOND_ORDER_SHAPES),
        }
    }

    fn lookup(&self, key: &(NoisePowers, DerivIndex), second: bool) -> Option<&Polynomial> {
        if second {
            self.second.get(key).or_else(|| self.first.get(key))
        } else {
            self.first.get(key)
        }
    }

    /// `∫ multiplier * form deta`
    fn apply(
        &self,
        multiplier: &[&String],
        form: &DensityForm,
        second: bool,
    ) -> Result<Polynomial, DerivationError> {
        let names: BTreeSet<String> = self.symbols.iter().cloned().collect();
        let mut out = Polynomial::zero();
        for (index, coefficient) in form.terms() {
            for (m, c) in coefficient.terms() {
                let unexpected = || {
                    DerivationError::UnexpectedNoiseTerm(format!("({m}) * {index}"))
                };
                let (noise, rest) = m.split(&names);
                if names.iter().any(|s| rest.opaque_contains(s)) {
                    return Err(unexpected());
                }
                let mut powers = noise_powers(&noise).ok_or_else(unexpected)?;
                for s in multiplier {
                    *powers.entry((*s).clone()).or_insert(0) += 1;
                }
                let value = self
                    .lookup(&(powers, index.clone()), second)
                    .ok_or_else(unexpected)?;
                out += &value.mul_term(&rest, *c);
            }
        }
        Ok(out)
    }
}

/// Equations of motion `d<...>/dt = ...` of the first and second noise moments.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseEom {
    pub noise_symbols: Vec<String>,
    /// One equation per noise symbol
    pub first: Vec<(String, Polynomial)>,
    /// One equation per pair `i <= j`
    pub second: Vec<(String, Polynomial)>,
}

/// Derives the moment equations of a Fokker-Planck equation.
///
/// # Errors
/// `DerivationError::UnexpectedNoiseTerm` for a term without a moment table entry.
pub fn noise_eom(fpe: &FokkerPlanck) -> Result<NoiseEom, DerivationError> {
    let symbols = fpe.noise_symbols();
    let tables = NoiseTables::new(&symbols);

    let first = symbols
        .iter()
        .map(|eta| Ok((first_moment(eta), tables.apply(&[eta], &fpe.rhs, false)?)))
        .collect::<Result<Vec<_>, DerivationError>>()?;

    let mut second = Vec::new();
    for (i, a) in symbols.iter().enumerate() {
        for b in &symbols[i..] {
            second.push((second_moment(a, b), tables.apply(&[a, b], &fpe.rhs, true)?));
        }
    }
    debug!(first = first.len(), second = second.len(), "noise equations derived");
    Ok(NoiseEom {
        noise_symbols: symbols,
        first,
        second,
    })
}

/// Splits linear equations `Σ a_j u_j + b = 0` into `A` and `-b`.
fn linear_system(
    equations: &[&Polynomial],
    unknowns: &[String],
) -> (Vec<Vec<Polynomial>>, Vec<Polynomial>) {
    let matrix = equations
        .iter()
        .map(|eq| {
            unknowns
                .iter()
                .map(|u| eq.coefficient(u, Rational::ONE))
                .collect()
        })
        .collect();
    let rhs = equations
        .iter()
        .map(|eq| {
            let constant = unknowns
                .iter()
                .fold((*eq).clone(), |acc, u| acc.substitute(u, &Polynomial::zero()));
            -constant
        })
        .collect();
    (matrix, rhs)
}

/// Stationary noise moments.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseStationary {
    pub noise_symbols: Vec<String>,
    pub first: Vec<(String, Fraction)>,
    pub second: Vec<(String, Fraction)>,
}

/// Solves the moment equations at stationarity.
///
/// Second moments are solved in the order diagonals first, then the pairs `i < j`.
///
/// # Errors
/// * `DerivationError::Timeout` when the budget runs out
/// * `DerivationError::NoSolution` for an inconsistent system
pub fn noise_stationary(
    eom: &NoiseEom,
    budget: &mut SolveBudget,
) -> Result<NoiseStationary, DerivationError> {
    let symbols = &eom.noise_symbols;

    let first_unknowns: Vec<String> = symbols.iter().map(|s| first_moment(s)).collect();
    let equations: Vec<&Polynomial> = eom.first.iter().map(|(_, eq)| eq).collect();
    let (matrix, rhs) = linear_system(&equations, &first_unknowns);
    let first = first_unknowns
        .iter()
        .cloned()
        .zip(solve_linear(&matrix, &rhs, budget)?)
        .collect();

    let second_unknowns: Vec<String> = symbols
        .iter()
        .map(|s| second_moment(s, s))
        .chain(
            symbols
                .iter()
                .tuple_combinations()
                .map(|(a, b)| second_moment(a, b)),
        )
        .collect();
    let equations: Vec<&Polynomial> = eom.second.iter().map(|(_, eq)| eq).collect();
    let (matrix, rhs) = linear_system(&equations, &second_unknowns);
    let second = second_unknowns
        .iter()
        .cloned()
        .zip(solve_linear(&matrix, &rhs, budget)?)
        .collect();

    debug!(steps = budget.used(), "stationary noise solved");
    Ok(NoiseStationary {
        noise_symbols: symbols.clone(),
        first,
        second,
    })
}

impl NoiseStationary {
    /// Numeric values of every moment.
    ///
    /// # Errors
    /// `SystemError::VariableNotFound` naming the first symbol without a value.
    pub fn eval(&self, values: &HashMap<String, f64>) -> Result<BTreeMap<String, f64>, SystemError> {
        self.first
            .iter()
            .chain(&self.second)
            .map(|(name, fraction)| {
                fraction
                    .eval(values)
                    .map(|v| (name.clone(), v))
                    .map_err(SystemError::VariableNotFound)
            })
            .collect()
    }

    /// Covariance matrix `<eta_i eta_j>` in noise symbol order.
    pub fn covariance(&self, values: &HashMap<String, f64>) -> Result<DMatrix<f64>, SystemError> {
        let moments = self.eval(values)?;
        let n = self.noise_symbols.len();
        let mut matrix = DMatrix::zeros(n, n);
        for (i, a) in self.noise_symbols.iter().enumerate() {
            for (j, b) in self.noise_symbols.iter().enumerate() {
                let name = second_moment(a, b);
                matrix[(i, j)] = moments
                    .get(&name)
                    .copied()
                    .ok_or(SystemError::VariableNotFound(name))?;
            }
        }
        Ok(matrix)
    }
}

impl fmt::Display for NoiseEom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (moment, eq) in self.first.iter().chain(&self.second) {
            writeln!(f, "{} = {eq}", format!("d{moment}/dt").cyan())?;
        }
        Ok(())
    }
}

impl fmt::Display for NoiseStationary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (moment, value) in self.first.iter().chain(&self.second) {
            writeln!(f, "{} = {value}", moment.cyan())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expansion::van_kampen_expand;
    use crate::master::derive_master_equation;
    use crate::orders::{fokker_planck, separate_orders};
    use crate::parser::parse_rules;
    use crate::stoichiometry::Stoichiometry;

    fn fpe(text: &str) -> FokkerPlanck {
        let parsed = parse_rules(text).unwrap();
        let stoich = Stoichiometry::build(&parsed.rules, &parsed.constant_reactants).unwrap();
        fokker_planck(&separate_orders(&van_kampen_expand(
            &derive_master_equation(&stoich).unwrap(),
        )))
    }

    const BIRTH_DEATH: &str = "\\emptyset -> A : a\n\
                               A -> \\emptyset : b\n\
                               \\emptyset -> B : a\n\
                               B -> \\emptyset : b";

    #[test]
    fn test_tables() {
        let symbols = vec!["eta_A".to_string(), "eta_B".to_string()];
        let tables = NoiseTables::new(&symbols);
        let key = |powers: &[&str], deriv: &[&str]| {
            (
                powers_of(powers.iter().map(|s| s.to_string()).collect::<Vec<_>>().iter()),
                DerivIndex::noise(deriv.iter().copied()),
            )
        };
        // eta_A eta_B dP/deta_A -> -<eta_B>
        assert_eq!(
            tables.first[&key(&["eta_A", "eta_B"], &["eta_A"])],
            -Polynomial::symbol("<eta_B>")
        );
        // eta_A^2 d^2P/deta_A^2 -> 2, eta_A eta_B d^2P/deta_A deta_B -> 1
        assert_eq!(
            tables.second[&key(&["eta_A", "eta_A"], &["eta_A", "eta_A"])],
            Polynomial::integer(2)
        );
        assert_eq!(
            tables.second[&key(&["eta_A", "eta_B"], &["eta_A", "eta_B"])],
            Polynomial::integer(1)
        );
        assert!(tables.second[&key(&["eta_A", "eta_A"], &["eta_B", "eta_B"])].is_zero());
        // eta_A eta_A eta_B dP/deta_B -> -<eta_A eta_A>
        assert_eq!(
            tables.second[&key(&["eta_A", "eta_A", "eta_B"], &["eta_B"])],
            -Polynomial::symbol("<eta_A eta_A>")
        );
    }

    #[test]
    fn test_birth_death_stationary() {
        let eom = noise_eom(&fpe(BIRTH_DEATH)).unwrap();
        assert_eq!(eom.first.len(), 2);
        assert_eq!(eom.second.len(), 3);
        assert_eq!(eom.second[0].0, "<eta_A eta_A>");

        let stationary = noise_stationary(&eom, &mut SolveBudget::default()).unwrap();
        assert!(stationary.first.iter().all(|(_, f)| f.is_zero()));

        let values: HashMap<String, f64> = [("a", 3.0), ("b", 2.0), ("Phi_A", 1.5), ("Phi_B", 0.5)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let moments = stationary.eval(&values).unwrap();
        // (a + b Phi) / (2b)
        assert!((moments["<eta_A eta_A>"] - 1.5).abs() < 1e-12);
        assert!((moments["<eta_B eta_B>"] - 1.0).abs() < 1e-12);
        assert_eq!(moments["<eta_A eta_B>"], 0.0);

        let cov = stationary.covariance(&values).unwrap();
        assert_eq!(cov.nrows(), 2);
        assert!((cov[(0, 0)] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_missing_value() {
        let eom = noise_eom(&fpe(BIRTH_DEATH)).unwrap();
        let stationary = noise_stationary(&eom, &mut SolveBudget::default()).unwrap();
        assert!(matches!(
            stationary.eval(&HashMap::new()),
            Err(SystemError::VariableNotFound(_))
        ));
    }

    #[test]
    fn test_unexpected_term() {
        let symbols = vec!["eta_A".to_string(), "eta_B".to_string()];
        let fpe = FokkerPlanck {
            reactants: vec!["A".to_string(), "B".to_string()],
            rhs: DensityForm::single(
                DerivIndex::noise(["eta_A"]),
                Polynomial::symbol("eta_A").pow(2),
            ),
        };
        assert_eq!(fpe.noise_symbols(), symbols);
        assert!(matches!(
            noise_eom(&fpe),
            Err(DerivationError::UnexpectedNoiseTerm(_))
        ));
    }
}
