//! Error types for the mumot crate.
//!
//! This module defines the error types that can occur while parsing rules, deriving the
//! stochastic description of a model, and simulating it. The main error types are:
//!
//! - `ConvertError`: Errors during conversion from the evalexpr AST to `Expr`
//! - `ModelError`: Malformed model definitions (raised at construction/derivation time)
//! - `DerivationError`: Symbolic solves that do not finish or have no solution
//! - `SimulationError`: Parameter range violations and simulation invariant violations
//! - `SystemError`: Numeric evaluation of the mean-field equations
//!
//! Each error type implements the standard Error trait and provides detailed error messages.

use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur during conversion from evalexpr AST to our internal AST representation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    /// Error when an exponent is not a numeric constant
    #[error("Could not convert exponent in Exp operator: {0}")]
    ExpOperator(String),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported by our implementation
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not a number
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when an operator node has the wrong number of children
    #[error("Malformed operator node: {0}")]
    Arity(String),
}

/// Errors in the definition of a model.
///
/// These are raised immediately at construction or derivation time, are never retried,
/// and carry enough context to be shown verbatim to the user.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Rule text could not be tokenised
    #[error("Syntax error: expected {expected} but got '{token}' in rule '{rule}'")]
    Syntax {
        expected: String,
        token: String,
        rule: String,
    },
    /// Reactant names must be plain symbols
    #[error("Reactants cannot contain '^': '{token}' in rule '{rule}'")]
    InvalidReactant { token: String, rule: String },
    /// Left and right hand side of a rule have a different number of reactants
    #[error("Unequal number of reactants on lhs ({lhs}) and rhs ({rhs}) of rule '{rule}'")]
    UnbalancedRule {
        lhs: usize,
        rhs: usize,
        rule: String,
    },
    /// The same symbol is used both as constant and as variable reactant
    #[error("Following reactants defined as both constant and variable: {0}")]
    ConstantAndVariable(String),
    /// Expansion machinery only supports a fixed number of variable reactants
    #[error("This derivation works for 2, 3 or 4 different reactants only, got {0}")]
    UnsupportedReactantCount(usize),
    /// Rules with more than two reagents cannot be simulated on networks
    #[error("Unsupported rule '{rule}': {reason}")]
    UnsupportedRule { rule: String, reason: String },
    /// A substitution string is malformed or not supported
    #[error("Invalid substitution '{assignment}': {reason}")]
    InvalidSubstitution { assignment: String, reason: String },
    /// A rate expression cannot be carried through the derivation
    #[error("Rate expression '{0}' is not supported by the derivation")]
    UnsupportedRate(String),
    /// Error when parsing an expression string with evalexpr
    #[error("Failed to parse expression")]
    Evalexpr(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when converting from evalexpr AST to our AST representation
    #[error("Failed to build expression AST")]
    Convert(#[from] ConvertError),
}

/// Errors of the symbolic solves of the derivation pipeline.
///
/// All of these are recoverable: the caller is told that there is no result.
#[derive(Debug, Error)]
pub enum DerivationError {
    /// The solve exceeded its step budget
    #[error("Derivation did not finish within {steps} steps")]
    Timeout { steps: usize },
    /// The linear system has no solution
    #[error("No solution found: {0}")]
    NoSolution(String),
    /// An exact coefficient left the i128 range during a solve
    #[error("Coefficient overflow in {0}")]
    CoefficientOverflow(String),
    /// A term of the Fokker-Planck equation is not covered by the noise substitution tables
    #[error("Unexpected term in noise moment equation: {0}")]
    UnexpectedNoiseTerm(String),
    /// The model itself is not suitable for the derivation
    #[error("Invalid model for derivation")]
    Model(#[from] ModelError),
}

/// Errors raised by the simulation engines.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// A run parameter is outside its documented range; the run is not started
    #[error("Parameter out of range: {0}")]
    ParameterRange(String),
    /// A population would become negative; this indicates a propensity normalisation defect
    #[error("Negative population for reactant '{reactant}' at time {time}")]
    NegativePopulation { reactant: String, time: f64 },
    /// The cumulative propensity walk did not select a reaction
    #[error("No reaction selected for uniform draw {draw}")]
    NoReactionSelected { draw: f64 },
    /// A rate symbol has no numeric value
    #[error("Missing numeric value for rate '{0}'")]
    MissingRate(String),
    /// The model cannot be simulated
    #[error("Invalid model for simulation")]
    Model(#[from] ModelError),
}

/// Errors of the numeric mean-field system.
#[derive(Debug, Error)]
pub enum SystemError {
    /// Error when the input length is not the same as the number of variables
    #[error("Invalid input length: expected {expected}, got {got}")]
    InvalidInputLength { expected: usize, got: usize },
    /// Error when a symbol has no value
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
    /// Newton iteration failed
    #[error("Fixed point search did not converge after {0} iterations")]
    NoConvergence(usize),
    /// Jacobian could not be inverted
    #[error("Singular Jacobian at {0:?}")]
    SingularJacobian(Vec<f64>),
}
