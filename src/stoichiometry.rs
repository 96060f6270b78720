//! Stoichiometry records of a rule set.
//!
//! Every rule becomes one numbered reaction holding its rate and, per reactant, how
//! many copies it consumes and produces. The `BTreeMap` keys give the single shared
//! lexicographic reactant order all later stages iterate in.

use crate::errors::ModelError;
use crate::expr::Expr;
use crate::parser::{Rule, Species};
use colored::Colorize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Role of a reactant within one reaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StoichEntry {
    /// A constant reactant; it scales the rate but never changes
    Const,
    /// A variable reactant
    Change {
        consumed: u32,
        produced: u32,
        /// Set when the reactant was eliminated by a substitution
        substitution: Option<Expr>,
    },
}

impl StoichEntry {
    /// Net decrease `consumed - produced` (zero for constants).
    pub fn shift(&self) -> i64 {
        match self {
            StoichEntry::Const => 0,
            StoichEntry::Change {
                consumed, produced, ..
            } => *consumed as i64 - *produced as i64,
        }
    }
}

/// One numbered reaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Reaction {
    pub id: usize,
    pub rate: Expr,
    pub entries: BTreeMap<String, StoichEntry>,
}

impl Reaction {
    pub fn name(&self) -> String {
        format!("Reaction {}", self.id)
    }
}

/// Reactions in rule order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stoichiometry {
    pub reactions: Vec<Reaction>,
}

impl Stoichiometry {
    /// Builds the stoichiometry of a rule set.
    ///
    /// Every non-void left hand side reactant gets an entry; right hand side reactants
    /// get one only if they are variable and absent from the left hand side.
    ///
    /// # Errors
    /// `ModelError::UnbalancedRule` if a rule has different side lengths.
    pub fn build(
        rules: &[Rule],
        constant_reactants: &BTreeSet<String>,
    ) -> Result<Stoichiometry, ModelError> {
        let mut reactions = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            if rule.lhs.len() != rule.rhs.len() {
                return Err(ModelError::UnbalancedRule {
                    lhs: rule.lhs.len(),
                    rhs: rule.rhs.len(),
                    rule: rule.to_string(),
                });
            }
            let change = |name: &str| StoichEntry::Change {
                consumed: rule.lhs_count(name) as u32,
                produced: rule.rhs_count(name) as u32,
                substitution: None,
            };
            let mut entries = BTreeMap::new();
            for name in rule.lhs.iter().filter_map(Species::name) {
                let entry = if constant_reactants.contains(name) {
                    StoichEntry::Const
                } else {
                    change(name)
                };
                entries.insert(name.to_string(), entry);
            }
            for name in rule.rhs.iter().filter_map(Species::name) {
                if rule.lhs_count(name) == 0 && !constant_reactants.contains(name) {
                    entries.insert(name.to_string(), change(name));
                }
            }
            reactions.push(Reaction {
                id: index + 1,
                rate: rule.rate.clone(),
                entries,
            });
        }
        Ok(Stoichiometry { reactions })
    }

    /// Sorted names of all non-constant entries.
    pub fn variable_reactants(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .reactions
            .iter()
            .flat_map(|r| r.entries.iter())
            .filter(|(_, e)| !matches!(e, StoichEntry::Const))
            .map(|(name, _)| name)
            .collect();
        names.into_iter().cloned().collect()
    }

    /// Sorted names of all constant entries.
    pub fn constant_reactants(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .reactions
            .iter()
            .flat_map(|r| r.entries.iter())
            .filter(|(_, e)| matches!(e, StoichEntry::Const))
            .map(|(name, _)| name)
            .collect();
        names.into_iter().cloned().collect()
    }

    /// The first recorded substitution, as `(reactant, expression)`.
    pub fn substitution(&self) -> Option<(String, Expr)> {
        self.reactions
            .iter()
            .flat_map(|r| r.entries.iter())
            .find_map(|(name, entry)| match entry {
                StoichEntry::Change {
                    substitution: Some(expr),
                    ..
                } => Some((name.clone(), expr.clone())),
                _ => None,
            })
    }
}

impl fmt::Display for Stoichiometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for reaction in &self.reactions {
            writeln!(f, "{}", reaction.name().cyan().bold())?;
            writeln!(f, "    {}: {}", "rate".green(), reaction.rate)?;
            for (name, entry) in &reaction.entries {
                match entry {
                    StoichEntry::Const => writeln!(f, "    {name}: const")?,
                    StoichEntry::Change {
                        consumed,
                        produced,
                        substitution,
                    } => {
                        write!(f, "    {name}: [{consumed}, {produced}]")?;
                        if let Some(expr) = substitution {
                            write!(f, " {{{name} = {expr}}}")?;
                        }
                        writeln!(f)?;
                    }
                }
            }
        }
        Ok(())
    }
}
