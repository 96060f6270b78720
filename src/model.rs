//! The model: rules, reactants, rates and everything derived from them.
//!
//! A `Model` is immutable. The derivation products are computed on first use and
//! cached; only successful results are cached, so a failed derivation is retried on
//! the next call.

use crate::convert::parse_expr;
use crate::errors::{DerivationError, ModelError, SystemError};
use crate::expansion::{phi_symbol, van_kampen_expand, VanKampenExpansion};
use crate::expr::Expr;
use crate::master::{derive_master_equation, MasterEquation};
use crate::noise::{noise_eom, noise_stationary, NoiseEom, NoiseStationary};
use crate::orders::{fokker_planck, mean_field_odes, separate_orders, FokkerPlanck, OrderedTerms};
use crate::parser::{parse_rules, Rule, Species};
use crate::poly::{Polynomial, Rational, SolveBudget};
use crate::stoichiometry::{StoichEntry, Stoichiometry};
use crate::system::OdeSystem;
use colored::Colorize;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

/// Returns the cached value, computing and storing it on first success.
fn cached<T, E>(cell: &OnceLock<T>, compute: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
    if let Some(value) = cell.get() {
        return Ok(value);
    }
    let value = compute()?;
    Ok(cell.get_or_init(|| value))
}

/// A population model defined by transition rules.
///
/// ```
/// use mumot::model::Model;
///
/// let model = Model::parse("A + B -> A + A : k\nA -> B : g").unwrap();
/// assert_eq!(model.reactants().iter().collect::<Vec<_>>(), vec!["A", "B"]);
/// assert_eq!(model.rates().iter().collect::<Vec<_>>(), vec!["g", "k"]);
/// ```
#[derive(Debug, Clone)]
pub struct Model {
    rules: Vec<Rule>,
    reactants: BTreeSet<String>,
    constant_reactants: BTreeSet<String>,
    rates: BTreeSet<String>,
    system_size: Option<String>,
    constant_system_size: bool,
    stoichiometry: Stoichiometry,
    equations: BTreeMap<String, Expr>,
    master: OnceLock<MasterEquation>,
    expansion: OnceLock<VanKampenExpansion>,
    ordered: OnceLock<OrderedTerms>,
    odes_vke: OnceLock<BTreeMap<String, Polynomial>>,
    fpe: OnceLock<FokkerPlanck>,
    noise_eom: OnceLock<NoiseEom>,
    noise_stationary: OnceLock<NoiseStationary>,
}

/// Mean-field equations straight from the rules: every rule contributes
/// `(produced - consumed) * rate * ∏ lhs reactants` to each variable reactant.
fn equations_from_rules(rules: &[Rule], reactants: &BTreeSet<String>) -> BTreeMap<String, Expr> {
    let mut equations: BTreeMap<String, Polynomial> = reactants
        .iter()
        .map(|r| (r.clone(), Polynomial::zero()))
        .collect();
    for rule in rules {
        let mut term = Polynomial::from_expr(&rule.rate);
        for name in rule.lhs.iter().filter_map(Species::name) {
            term = &term * &Polynomial::symbol(name);
        }
        for (reactant, equation) in equations.iter_mut() {
            let change = rule.rhs_count(reactant) as i64 - rule.lhs_count(reactant) as i64;
            if change != 0 {
                *equation += &term.scale(Rational::integer(change));
            }
        }
    }
    equations
        .into_iter()
        .map(|(reactant, equation)| (reactant, equation.to_expr()))
        .collect()
}

impl Model {
    #[allow(clippy::too_many_arguments)]
    fn assemble(
        rules: Vec<Rule>,
        reactants: BTreeSet<String>,
        constant_reactants: BTreeSet<String>,
        rates: BTreeSet<String>,
        system_size: Option<String>,
        constant_system_size: bool,
        stoichiometry: Stoichiometry,
        equations: BTreeMap<String, Expr>,
    ) -> Self {
        Self {
            rules,
            reactants,
            constant_reactants,
            rates,
            system_size,
            constant_system_size,
            stoichiometry,
            equations,
            master: OnceLock::new(),
            expansion: OnceLock::new(),
            ordered: OnceLock::new(),
            odes_vke: OnceLock::new(),
            fpe: OnceLock::new(),
            noise_eom: OnceLock::new(),
            noise_stationary: OnceLock::new(),
        }
    }

    /// Builds a model from rules, deriving its equations and stoichiometry.
    ///
    /// # Errors
    /// * `ModelError::ConstantAndVariable` if a reactant is used both ways
    /// * `ModelError::UnbalancedRule` if a rule has different side lengths
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self, ModelError> {
        let mut reactants = BTreeSet::new();
        let mut constant_reactants = BTreeSet::new();
        let mut rates = BTreeSet::new();
        let mut constant_system_size = true;
        for rule in &rules {
            for species in rule.lhs.iter().chain(&rule.rhs) {
                match species {
                    Species::Variable(name) => {
                        reactants.insert(name.clone());
                    }
                    Species::Constant(name) => {
                        constant_reactants.insert(name.clone());
                    }
                    Species::Void => constant_system_size = false,
                }
            }
            rates.extend(rule.rate.symbols());
        }
        let both = reactants.intersection(&constant_reactants).join(", ");
        if !both.is_empty() {
            return Err(ModelError::ConstantAndVariable(both));
        }

        let stoichiometry = Stoichiometry::build(&rules, &constant_reactants)?;
        let equations = equations_from_rules(&rules, &reactants);
        debug!(
            rules = rules.len(),
            reactants = reactants.len(),
            "model built"
        );
        Ok(Self::assemble(
            rules,
            reactants,
            constant_reactants,
            rates,
            None,
            constant_system_size,
            stoichiometry,
            equations,
        ))
    }

    /// Parses rule text and builds the model.
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        Self::from_rules(parse_rules(text)?.rules)
    }

    /// Builds a new model with the comma separated assignments applied.
    ///
    /// A reactant assignment such as `A = N - B` eliminates `A`, and its single new
    /// symbol `N` becomes the system size. Rate assignments such as `k = 2*g` rewrite
    /// every rate.
    ///
    /// # Errors
    /// * `ModelError::Syntax` for an assignment without `=`
    /// * `ModelError::InvalidSubstitution` for renaming a reactant, substituting a
    ///   constant reactant, or an unclear system size
    pub fn substitute(&self, assignments: &str) -> Result<Model, ModelError> {
        let mut subs: Vec<(String, Expr)> = Vec::new();
        for assignment in assignments.split(',').map(str::trim) {
            let invalid = |reason: &str| ModelError::InvalidSubstitution {
                assignment: assignment.to_string(),
                reason: reason.to_string(),
            };
            let Some((lhs, rhs)) = assignment.split_once('=') else {
                return Err(ModelError::Syntax {
                    expected: "'='".to_string(),
                    token: assignment.to_string(),
                    rule: assignments.to_string(),
                });
            };
            let Expr::Var(name) = parse_expr(lhs.trim())? else {
                return Err(invalid("the left hand side must be a single symbol"));
            };
            let value = parse_expr(rhs.trim())?;
            if self.reactants.contains(&name) && value.symbols().len() == 1 {
                return Err(invalid("renaming reactants is not supported"));
            }
            if self.constant_reactants.contains(&name) {
                return Err(invalid("constant reactants cannot be substituted"));
            }
            subs.push((name, value));
        }

        let mut stoichiometry = self.stoichiometry.clone();
        let mut equations = self.equations.clone();
        let mut rules = self.rules.clone();
        for (name, value) in &subs {
            for reaction in &mut stoichiometry.reactions {
                reaction.rate = *reaction.rate.substitute(name, value).simplify();
                if let Some(StoichEntry::Change { substitution, .. }) =
                    reaction.entries.get_mut(name)
                {
                    *substitution = Some(value.clone());
                }
            }
            for equation in equations.values_mut() {
                *equation = *equation.substitute(name, value).simplify();
            }
            for rule in &mut rules {
                rule.rate = *rule.rate.substitute(name, value).simplify();
            }
        }

        let mut reactants = self.reactants.clone();
        let mut system_size: Option<String> = None;
        for (name, value) in &subs {
            if !self.reactants.contains(name) {
                continue;
            }
            let assignment = format!("{name} = {value}");
            for symbol in value.symbols() {
                if reactants.contains(&symbol) || self.system_size.as_ref() == Some(&symbol) {
                    continue;
                }
                match &system_size {
                    None => system_size = Some(symbol),
                    Some(existing) if *existing == symbol => {}
                    Some(_) => {
                        return Err(ModelError::InvalidSubstitution {
                            assignment,
                            reason: "more than one unknown symbol for the system size".to_string(),
                        })
                    }
                }
            }
            if system_size.is_none() {
                // a second elimination may reuse the known system size
                system_size = self
                    .system_size
                    .clone()
                    .filter(|size| value.contains_symbol(size));
            }
            if system_size.is_none() {
                return Err(ModelError::InvalidSubstitution {
                    assignment,
                    reason: "expected to find a system size symbol".to_string(),
                });
            }
            reactants.remove(name);
            equations.remove(name);
        }
        let system_size = system_size.or_else(|| self.system_size.clone());

        let rates: BTreeSet<String> = equations
            .values()
            .flat_map(Expr::symbols)
            .filter(|s| {
                !reactants.contains(s)
                    && !self.constant_reactants.contains(s)
                    && system_size.as_ref() != Some(s)
            })
            .collect();
        debug!(assignments, ?system_size, "model substituted");
        Ok(Self::assemble(
            rules,
            reactants,
            self.constant_reactants.clone(),
            rates,
            system_size,
            self.constant_system_size,
            stoichiometry,
            equations,
        ))
    }

    /// Variable reactants, sorted.
    pub fn reactants(&self) -> &BTreeSet<String> {
        &self.reactants
    }

    pub fn constant_reactants(&self) -> &BTreeSet<String> {
        &self.constant_reactants
    }

    /// Rate symbols, sorted.
    pub fn rates(&self) -> &BTreeSet<String> {
        &self.rates
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// System size symbol introduced by a reactant substitution.
    pub fn system_size(&self) -> Option<&str> {
        self.system_size.as_deref()
    }

    /// False if any rule creates or destroys agents through `\emptyset`.
    pub fn constant_system_size(&self) -> bool {
        self.constant_system_size
    }

    /// Mean-field equations `dX/dt` of the variable reactants.
    pub fn equations(&self) -> &BTreeMap<String, Expr> {
        &self.equations
    }

    pub fn stoichiometry(&self) -> &Stoichiometry {
        &self.stoichiometry
    }

    pub fn master_equation(&self) -> Result<&MasterEquation, ModelError> {
        cached(&self.master, || derive_master_equation(&self.stoichiometry))
    }

    pub fn van_kampen(&self) -> Result<&VanKampenExpansion, ModelError> {
        let master = self.master_equation()?;
        cached(&self.expansion, || Ok(van_kampen_expand(master)))
    }

    /// The expansion grouped by powers of the system size.
    pub fn ordered_terms(&self) -> Result<&OrderedTerms, ModelError> {
        let expansion = self.van_kampen()?;
        cached(&self.ordered, || Ok(separate_orders(expansion)))
    }

    /// Mean-field equations `dPhi_X/dt` from the leading order of the expansion.
    pub fn odes_vke(&self) -> Result<&BTreeMap<String, Polynomial>, DerivationError> {
        let ordered = self.ordered_terms()?;
        let substitution = self.stoichiometry.substitution();
        cached(&self.odes_vke, || mean_field_odes(ordered, substitution.as_ref()))
    }

    pub fn fokker_planck(&self) -> Result<&FokkerPlanck, ModelError> {
        let ordered = self.ordered_terms()?;
        cached(&self.fpe, || Ok(fokker_planck(ordered)))
    }

    /// Equations of motion of the first and second noise moments.
    pub fn noise_eom(&self) -> Result<&NoiseEom, DerivationError> {
        let fpe = self.fokker_planck()?;
        cached(&self.noise_eom, || noise_eom(fpe))
    }

    /// Stationary noise moments, solved with the default step budget.
    pub fn noise_stationary(&self) -> Result<&NoiseStationary, DerivationError> {
        let eom = self.noise_eom()?;
        cached(&self.noise_stationary, || {
            noise_stationary(eom, &mut SolveBudget::default())
        })
    }

    /// Numeric mean-field system with the given rate values.
    pub fn ode_system(&self, parameters: &HashMap<String, f64>) -> Result<OdeSystem, SystemError> {
        OdeSystem::new(&self.equations, parameters)
    }
}

/// Renders the `Phi_X` equations of the expansion with `Phi_X` shown as `X`.
pub fn odes_as_equations(odes: &BTreeMap<String, Polynomial>) -> BTreeMap<String, Polynomial> {
    odes.iter()
        .map(|(reactant, ode)| {
            let mut renamed = ode.clone();
            for other in odes.keys() {
                renamed = renamed.substitute(&phi_symbol(other), &Polynomial::symbol(other));
            }
            (reactant.clone(), renamed)
        })
        .collect()
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "Rules".cyan())?;
        for rule in &self.rules {
            writeln!(f, "    {rule}")?;
        }
        writeln!(f, "{} {}", "Reactants:".cyan(), self.reactants.iter().join(", "))?;
        if !self.constant_reactants.is_empty() {
            writeln!(
                f,
                "{} {}",
                "Constant reactants:".cyan(),
                self.constant_reactants.iter().join(", ")
            )?;
        }
        writeln!(f, "{} {}", "Rates:".cyan(), self.rates.iter().join(", "))?;
        if let Some(size) = &self.system_size {
            writeln!(f, "{} {size}", "System size:".cyan())?;
        }
        writeln!(f, "{}", "Equations".cyan())?;
        for (reactant, equation) in &self.equations {
            writeln!(f, "    {} = {equation}", format!("d{reactant}/dt").green())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poly(text: &str) -> Polynomial {
        Polynomial::from_expr(&parse_expr(text).unwrap())
    }

    #[test]
    fn test_equations_from_rules() {
        let model = Model::parse("A + B -> A + A : k\nA -> B : g\n(X) + \\emptyset -> (X) + A : s").unwrap();
        assert_eq!(
            Polynomial::from_expr(&model.equations()["A"]),
            poly("k*A*B - g*A + s*X")
        );
        assert_eq!(
            Polynomial::from_expr(&model.equations()["B"]),
            poly("g*A - k*A*B")
        );
        assert!(!model.constant_system_size());
        assert_eq!(model.constant_reactants().iter().collect::<Vec<_>>(), vec!["X"]);
    }

    #[test]
    fn test_unchanged_reactant_has_zero_equation() {
        let model = Model::parse("A + B -> A + C : k").unwrap();
        assert!(Polynomial::from_expr(&model.equations()["A"]).is_zero());
    }

    #[test]
    fn test_substitute_reactant() {
        let model = Model::parse("A -> B : k\nB -> A : g").unwrap();
        let reduced = model.substitute("B = N - A").unwrap();
        assert_eq!(reduced.reactants().iter().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(reduced.system_size(), Some("N"));
        assert_eq!(reduced.rates().iter().collect::<Vec<_>>(), vec!["g", "k"]);
        assert_eq!(
            Polynomial::from_expr(&reduced.equations()["A"]),
            poly("g*N - g*A - k*A")
        );
        assert!(!reduced.equations().contains_key("B"));
        assert_eq!(
            reduced.stoichiometry().substitution().map(|(name, _)| name),
            Some("B".to_string())
        );
        // the receiver is untouched
        assert_eq!(model.reactants().len(), 2);
    }

    #[test]
    fn test_substitution_matches_reduced_model() {
        let model = Model::parse("A + B -> A + A : k\nA -> B : g").unwrap();
        let substituted = model.substitute("B = N - A").unwrap();
        // the same dynamics written directly in A and the constant total N
        let reduced = Model::parse(
            "(N) + A -> A + A : k\nA + A -> A + \\emptyset : k\nA -> \\emptyset : g",
        )
        .unwrap();
        assert_eq!(
            Polynomial::from_expr(&substituted.equations()["A"]),
            Polynomial::from_expr(&reduced.equations()["A"])
        );
        assert_eq!(
            Polynomial::from_expr(&substituted.equations()["A"]),
            poly("k*N*A - k*A^2 - g*A")
        );

        let odes = substituted.odes_vke().unwrap();
        assert_eq!(odes.keys().collect::<Vec<_>>(), vec!["A"]);
        let remainder = &Polynomial::one() - &Polynomial::symbol("Phi_A");
        assert_eq!(
            odes["A"],
            model.odes_vke().unwrap()["A"].substitute("Phi_B", &remainder)
        );
        assert_eq!(odes["A"], poly("k*Phi_A - k*Phi_A^2 - g*Phi_A"));
    }

    #[test]
    fn test_substitute_rate() {
        let model = Model::parse("A -> B : k\nB -> A : g").unwrap();
        let rescaled = model.substitute("k = 2*g").unwrap();
        assert_eq!(rescaled.rates().iter().collect::<Vec<_>>(), vec!["g"]);
        assert_eq!(
            Polynomial::from_expr(&rescaled.stoichiometry().reactions[0].rate),
            poly("2*g")
        );
        assert_eq!(
            Polynomial::from_expr(&rescaled.rules()[0].rate),
            poly("2*g")
        );
        assert!(rescaled.stoichiometry().substitution().is_none());
    }

    #[test]
    fn test_substitute_errors() {
        let model = Model::parse("A -> B : k\n(X) + B -> (X) + A : g").unwrap();
        assert!(matches!(model.substitute("A"), Err(ModelError::Syntax { .. })));
        assert!(matches!(
            model.substitute("A = C"),
            Err(ModelError::InvalidSubstitution { .. })
        ));
        assert!(matches!(
            model.substitute("X = N - A"),
            Err(ModelError::InvalidSubstitution { .. })
        ));
        assert!(matches!(
            model.substitute("A = N - M - B"),
            Err(ModelError::InvalidSubstitution { .. })
        ));
        assert!(matches!(
            model.substitute("A = 2 - B"),
            Err(ModelError::InvalidSubstitution { .. })
        ));
    }

    #[test]
    fn test_vke_odes_match_rule_equations() {
        let model = Model::parse("A + B -> A + A : k\nA -> B : g").unwrap();
        let renamed = odes_as_equations(model.odes_vke().unwrap());
        for (reactant, equation) in model.equations() {
            assert_eq!(renamed[reactant], Polynomial::from_expr(equation));
        }
    }

    #[test]
    fn test_cached_products_are_shared() {
        let model = Model::parse(
            "\\emptyset -> A : a\nA -> \\emptyset : b\n\\emptyset -> B : a\nB -> \\emptyset : b",
        )
        .unwrap();
        let first = model.fokker_planck().unwrap() as *const FokkerPlanck;
        let second = model.fokker_planck().unwrap() as *const FokkerPlanck;
        assert_eq!(first, second);
        assert!(model.noise_stationary().is_ok());
    }

    #[test]
    fn test_too_few_reactants_for_expansion() {
        let model = Model::parse("A -> \\emptyset : k").unwrap();
        assert!(matches!(
            model.master_equation(),
            Err(ModelError::UnsupportedReactantCount(1))
        ));
        assert!(matches!(
            model.noise_eom(),
            Err(DerivationError::Model(ModelError::UnsupportedReactantCount(1)))
        ));
    }

    #[test]
    fn test_display() {
        colored::control::set_override(false);
        let model = Model::parse("A -> B : k\nB -> A : g").unwrap();
        let text = model.to_string();
        assert!(text.contains("Reactants: A, B"));
        assert!(text.contains("Rates: g, k"));
    }
}
