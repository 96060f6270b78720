//! Rule-text parser.
//!
//! A model is written one rule per line:
//!
//! ```text
//! A + B -> A + A : k
//! A -> \emptyset : d
//! (X) + A -> B + (X) : s
//! ```
//!
//! Tokens are separated by whitespace and recognised by a small pushdown automaton;
//! everything after `:` is concatenated into the rate expression. `(X)` marks a
//! constant reactant and `\emptyset` the void placeholder.

use crate::convert::parse_expr;
use crate::errors::ModelError;
use crate::expr::Expr;
use std::collections::BTreeSet;
use std::fmt;

/// One side entry of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Species {
    Variable(String),
    Constant(String),
    Void,
}

impl Species {
    /// Reactant name, `None` for the void placeholder.
    pub fn name(&self) -> Option<&str> {
        match self {
            Species::Variable(name) | Species::Constant(name) => Some(name),
            Species::Void => None,
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Species::Variable(name) => write!(f, "{name}"),
            Species::Constant(name) => write!(f, "({name})"),
            Species::Void => write!(f, "\\emptyset"),
        }
    }
}

/// A transition rule `lhs -> rhs : rate`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub lhs: Vec<Species>,
    pub rhs: Vec<Species>,
    pub rate: Expr,
}

impl Rule {
    /// Number of occurrences of a reactant on the left hand side.
    pub fn lhs_count(&self, name: &str) -> usize {
        self.lhs.iter().filter(|s| s.name() == Some(name)).count()
    }

    /// Number of occurrences of a reactant on the right hand side.
    pub fn rhs_count(&self, name: &str) -> usize {
        self.rhs.iter().filter(|s| s.name() == Some(name)).count()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |species: &[Species]| {
            species
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" + ")
        };
        write!(f, "{} -> {} : {}", side(&self.lhs), side(&self.rhs), self.rate)
    }
}

/// Result of parsing a model description.
#[derive(Debug, Clone)]
pub struct ParsedRules {
    pub rules: Vec<Rule>,
    pub reactants: BTreeSet<String>,
    pub constant_reactants: BTreeSet<String>,
    pub rates: BTreeSet<String>,
    /// False as soon as a rule uses `\emptyset`
    pub constant_system_size: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    /// expecting a reactant
    A,
    /// expecting `+` or `->`
    B,
    /// expecting a reactant
    C,
    /// expecting `+` or `:`
    D,
    /// collecting the rate
    E,
}

/// Parses a model description into rules.
///
/// # Errors
/// * `ModelError::Syntax` for unexpected tokens, naming the expected token and rule
/// * `ModelError::InvalidReactant` for reactant tokens containing `^`
/// * `ModelError::UnbalancedRule` if the sides have different reactant counts
/// * `ModelError::ConstantAndVariable` if a reactant is used both ways
pub fn parse_rules(description: &str) -> Result<ParsedRules, ModelError> {
    let cleaned = description.replace('$', "").replace("\\\\", "");
    let mut parsed = ParsedRules {
        rules: Vec::new(),
        reactants: BTreeSet::new(),
        constant_reactants: BTreeSet::new(),
        rates: BTreeSet::new(),
        constant_system_size: true,
    };

    for line in cleaned.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let rule = parse_rule(line, &mut parsed)?;
        parsed.rates.extend(rule.rate.symbols());
        parsed.rules.push(rule);
    }

    let both: Vec<&String> = parsed
        .reactants
        .intersection(&parsed.constant_reactants)
        .collect();
    if !both.is_empty() {
        return Err(ModelError::ConstantAndVariable(
            both.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
        ));
    }
    Ok(parsed)
}

fn parse_rule(line: &str, parsed: &mut ParsedRules) -> Result<Rule, ModelError> {
    let syntax = |expected: &str, token: &str| ModelError::Syntax {
        expected: expected.to_string(),
        token: token.to_string(),
        rule: line.to_string(),
    };

    let mut state = State::A;
    let mut balance: i64 = 0;
    let mut lhs = Vec::new();
    let mut rhs = Vec::new();
    let mut rate = String::new();

    for token in line.split_whitespace() {
        let is_operator = matches!(token, "+" | "->" | ":");
        match state {
            State::A | State::C => {
                if is_operator {
                    return Err(syntax("reactant", token));
                }
                let species = parse_reactant(token, line, parsed)?;
                if state == State::A {
                    balance += 1;
                    lhs.push(species);
                    state = State::B;
                } else {
                    balance -= 1;
                    rhs.push(species);
                    state = State::D;
                }
            }
            State::B => match token {
                "->" => state = State::C,
                "+" => state = State::A,
                _ => return Err(syntax("'->' or '+'", token)),
            },
            State::D => match token {
                ":" => state = State::E,
                "+" => state = State::C,
                _ => return Err(syntax("':' or '+'", token)),
            },
            State::E => rate.push_str(&token.replace('\\', "")),
        }
    }

    if state != State::E || rate.is_empty() {
        return Err(syntax("rate after ':'", "end of rule"));
    }
    if balance != 0 {
        return Err(ModelError::UnbalancedRule {
            lhs: lhs.len(),
            rhs: rhs.len(),
            rule: line.to_string(),
        });
    }

    Ok(Rule {
        lhs,
        rhs,
        rate: parse_expr(&rate)?,
    })
}

fn parse_reactant(token: &str, rule: &str, parsed: &mut ParsedRules) -> Result<Species, ModelError> {
    if token.contains('^') {
        return Err(ModelError::InvalidReactant {
            token: token.to_string(),
            rule: rule.to_string(),
        });
    }
    if token == "\\emptyset" {
        parsed.constant_system_size = false;
        return Ok(Species::Void);
    }
    let (constant, name) = match token.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, token),
    };
    let name = name.trim_start_matches('\\');
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    if !valid {
        return Err(ModelError::Syntax {
            expected: "a single reactant symbol".to_string(),
            token: token.to_string(),
            rule: rule.to_string(),
        });
    }
    if constant {
        parsed.constant_reactants.insert(name.to_string());
        Ok(Species::Constant(name.to_string()))
    } else {
        parsed.reactants.insert(name.to_string());
        Ok(Species::Variable(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model() {
        let parsed = parse_rules(
            "A + B -> A + A : k\n\
             A -> \\emptyset : d\n\
             (X) + B -> B + B : s*g",
        )
        .unwrap();
        assert_eq!(parsed.rules.len(), 3);
        assert_eq!(
            parsed.reactants.iter().collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        assert_eq!(
            parsed.constant_reactants.iter().collect::<Vec<_>>(),
            vec!["X"]
        );
        assert_eq!(
            parsed.rates.iter().collect::<Vec<_>>(),
            vec!["d", "g", "k", "s"]
        );
        assert!(!parsed.constant_system_size);
        assert_eq!(parsed.rules[1].rhs, vec![Species::Void]);
        assert_eq!(parsed.rules[0].lhs_count("A"), 1);
        assert_eq!(parsed.rules[0].rhs_count("A"), 2);
    }

    #[test]
    fn test_rate_tokens_concatenated() {
        let parsed = parse_rules("A -> B : 2 * k").unwrap();
        assert_eq!(
            parsed.rules[0].rate,
            Expr::Mul(Box::new(Expr::Const(2.0)), Box::new(Expr::var("k")))
        );
    }

    #[test]
    fn test_unexpected_token() {
        let err = parse_rules("A B -> C : k").unwrap_err();
        match err {
            ModelError::Syntax { expected, token, rule } => {
                assert_eq!(expected, "'->' or '+'");
                assert_eq!(token, "B");
                assert_eq!(rule, "A B -> C : k");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            parse_rules("A -> B"),
            Err(ModelError::Syntax { .. })
        ));
    }

    #[test]
    fn test_invalid_reactant() {
        assert!(matches!(
            parse_rules("A^2 -> B : k"),
            Err(ModelError::InvalidReactant { .. })
        ));
        assert!(matches!(
            parse_rules("2A -> B : k"),
            Err(ModelError::Syntax { .. })
        ));
    }

    #[test]
    fn test_unbalanced_rule() {
        assert!(matches!(
            parse_rules("A + B -> C : k"),
            Err(ModelError::UnbalancedRule { lhs: 2, rhs: 1, .. })
        ));
    }

    #[test]
    fn test_constant_and_variable() {
        let err = parse_rules("(A) -> B : k\nA -> B : g").unwrap_err();
        assert!(matches!(err, ModelError::ConstantAndVariable(ref s) if s == "A"));
    }
}
