//! Derivation and simulation of stochastic population models.
//!
//! A model is a set of transition rules such as `A + B -> A + A : k`. From the rules
//! this crate derives the mean-field equations, the Master equation, its van Kampen
//! system-size expansion, the linear Fokker-Planck equation of the noise and the
//! equations of motion of the noise moments with their stationary solution. The same
//! rules can be simulated with a Gillespie SSA or with agents on a network.
//!
//! # Features
//!
//! - Symbolic expressions parsed with [evalexpr](https://github.com/ISibboI/evalexpr)
//! - Exact polynomial algebra with rational coefficients for the expansion
//! - Numeric mean-field systems with Jacobian, RK4 integration and fixed points
//! - Reproducible, seeded simulations that run batches in parallel
//!
//! # Example
//!
//! ```rust
//! use mumot::Model;
//!
//! let model = Model::parse("A + B -> A + A : k\nA -> B : g").unwrap();
//!
//! // dPhi_A/dt = k Phi_A Phi_B - g Phi_A
//! let odes = model.odes_vke().unwrap();
//! assert!(odes["A"].contains_symbol("Phi_B"));
//!
//! // Stationary second moments of the noise
//! let moments = model.noise_stationary().unwrap();
//! assert_eq!(moments.second.len(), 3);
//! ```

pub use errors::{ConvertError, DerivationError, ModelError, SimulationError, SystemError};
pub use model::Model;
pub use ssa::Evolution;
pub use system::OdeSystem;

pub mod prelude {
    pub use crate::agents::{AgentEngine, AgentRun};
    pub use crate::convert::parse_expr;
    pub use crate::expr::Expr;
    pub use crate::model::Model;
    pub use crate::network::NetworkType;
    pub use crate::params::{AgentParams, Engine, RunDescriptor, Seeds, SsaParams};
    pub use crate::poly::Polynomial;
    pub use crate::ssa::{Evolution, SsaEngine};
    pub use crate::system::OdeSystem;
}

/// Agent-based simulation on networks
pub mod agents;
/// Conversion from parsed expressions to internal AST
pub mod convert;
/// Error types for the various failure modes
pub mod errors;
/// van Kampen expansion of the Master equation
pub mod expansion;
/// Expression tree representation and symbolic differentiation
pub mod expr;
/// Master equation from the stoichiometry
pub mod master;
/// Models and their cached derivation products
pub mod model;
/// Interaction networks
pub mod network;
/// Noise moment equations and their stationary solution
pub mod noise;
/// Peephole optimisation and interpretation of flattened expressions
pub mod opt;
/// Separation of the expansion by system-size order
pub mod orders;
/// Run parameters, seeds and run descriptors
pub mod params;
/// Rule-text parser
pub mod parser;
/// Polynomials with rational coefficients
pub mod poly;
/// Exact linear solves over polynomials
pub mod solve;
/// Gillespie stochastic simulation
pub mod ssa;
/// Stoichiometry records
pub mod stoichiometry;
/// Numeric mean-field system
pub mod system;
