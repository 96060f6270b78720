//! Numeric mean-field system.
//!
//! This module evaluates the mean-field equations of a model numerically. Every
//! right hand side is flattened into a stack program once, together with the
//! programs of its symbolic Jacobian, so repeated evaluation never walks the tree.
//!
//! # Features
//!
//! - Consistent variable ordering (sorted reactant names)
//! - Parameter values folded into the programs at construction
//! - Parallel batch evaluation
//! - Jacobian matrix and eigenvalues for stability analysis
//! - RK4 time integration and Newton fixed point search
//!
//! # Example
//!
//! ```
//! use mumot::convert::parse_expr;
//! use mumot::system::OdeSystem;
//! use std::collections::{BTreeMap, HashMap};
//!
//! let equations = BTreeMap::from([
//!     ("A".to_string(), parse_expr("-k*A").unwrap()),
//!     ("B".to_string(), parse_expr("k*A").unwrap()),
//! ]);
//! let parameters = HashMap::from([("k".to_string(), 2.0)]);
//! let system = OdeSystem::new(&equations, &parameters).unwrap();
//!
//! assert_eq!(system.eval(&[1.0, 0.0]).unwrap(), vec![-2.0, 2.0]);
//! ```

use crate::errors::SystemError;
use crate::expr::{Expr, FlattenedExpr};
use crate::opt::{execute, optimize};
use crate::ssa::Evolution;
use nalgebra::{Complex, DMatrix, DVector};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Mean-field equations `dX/dt = f(X)` with numeric parameters.
#[derive(Debug, Clone)]
pub struct OdeSystem {
    /// State variables in sorted order
    pub variables: Vec<String>,
    /// Right hand sides after parameter substitution
    pub equations: Vec<Box<Expr>>,
    programs: Vec<FlattenedExpr>,
    /// `jacobian[i][j] = ∂f_i/∂x_j`
    jacobian: Vec<Vec<FlattenedExpr>>,
}

fn compile(expr: &Expr, index: &HashMap<String, usize>) -> Result<FlattenedExpr, SystemError> {
    let flat = expr.flatten(index).map_err(SystemError::VariableNotFound)?;
    Ok(optimize(flat))
}

fn run(program: &FlattenedExpr, state: &[f64]) -> f64 {
    match program.constant_result {
        Some(c) => c,
        None => execute(&program.ops, state),
    }
}

impl OdeSystem {
    /// Builds the numeric system.
    ///
    /// Every symbol that is not a state variable must have a value in `parameters`.
    ///
    /// # Errors
    /// `SystemError::VariableNotFound` naming the first symbol without a value.
    pub fn new(
        equations: &BTreeMap<String, Expr>,
        parameters: &HashMap<String, f64>,
    ) -> Result<Self, SystemError> {
        let variables: Vec<String> = equations.keys().cloned().collect();
        let index: HashMap<String, usize> = variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i))
            .collect();

        let substituted: Vec<Box<Expr>> = equations
            .values()
            .map(|rhs| {
                let mut expr = Box::new(rhs.clone());
                for symbol in rhs.symbols() {
                    if index.contains_key(&symbol) {
                        continue;
                    }
                    let value = parameters
                        .get(&symbol)
                        .ok_or_else(|| SystemError::VariableNotFound(symbol.clone()))?;
                    expr = expr.substitute(&symbol, &Expr::Const(*value));
                }
                Ok(expr.simplify())
            })
            .collect::<Result<_, SystemError>>()?;

        let programs = substituted
            .iter()
            .map(|expr| compile(expr, &index))
            .collect::<Result<Vec<_>, _>>()?;

        let jacobian = substituted
            .iter()
            .map(|expr| {
                variables
                    .iter()
                    .map(|var| compile(&expr.derivative(var).simplify(), &index))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(variables = variables.len(), "mean-field system compiled");
        Ok(Self {
            variables,
            equations: substituted,
            programs,
            jacobian,
        })
    }

    fn validate_input_length(&self, state: &[f64]) -> Result<(), SystemError> {
        if state.len() != self.variables.len() {
            return Err(SystemError::InvalidInputLength {
                expected: self.variables.len(),
                got: state.len(),
            });
        }
        Ok(())
    }

    /// Evaluates all right hand sides into a pre-allocated buffer.
    ///
    /// # Errors
    /// `SystemError::InvalidInputLength` if either slice has the wrong length.
    pub fn eval_into<'a>(
        &self,
        state: &[f64],
        results: &'a mut [f64],
    ) -> Result<&'a [f64], SystemError> {
        self.validate_input_length(state)?;
        if results.len() != self.programs.len() {
            return Err(SystemError::InvalidInputLength {
                expected: self.programs.len(),
                got: results.len(),
            });
        }
        for (out, program) in results.iter_mut().zip(&self.programs) {
            *out = run(program, state);
        }
        Ok(results)
    }

    /// Evaluates all right hand sides.
    pub fn eval(&self, state: &[f64]) -> Result<Vec<f64>, SystemError> {
        let mut results = vec![0.0; self.programs.len()];
        self.eval_into(state, &mut results)?;
        Ok(results)
    }

    /// Evaluates many states in parallel, in input order.
    ///
    /// # Example
    /// ```
    /// # use mumot::convert::parse_expr;
    /// # use mumot::system::OdeSystem;
    /// # use std::collections::{BTreeMap, HashMap};
    /// let equations = BTreeMap::from([
    ///     ("A".to_string(), parse_expr("A*B").unwrap()),
    ///     ("B".to_string(), parse_expr("A + B").unwrap()),
    /// ]);
    /// let system = OdeSystem::new(&equations, &HashMap::new()).unwrap();
    /// let results = system
    ///     .eval_parallel(&[vec![1.0, 2.0], vec![3.0, 4.0]])
    ///     .unwrap();
    /// assert_eq!(results, vec![vec![2.0, 3.0], vec![12.0, 7.0]]);
    /// ```
    pub fn eval_parallel(&self, states: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, SystemError> {
        for state in states {
            self.validate_input_length(state)?;
        }
        let num_threads = rayon::current_num_threads();
        let chunk_size = (states.len() / (num_threads * 4)).max(1);

        Ok(states
            .par_chunks(chunk_size)
            .flat_map_iter(|chunk| {
                chunk.iter().map(|state| {
                    self.programs
                        .iter()
                        .map(|program| run(program, state))
                        .collect::<Vec<_>>()
                })
            })
            .collect())
    }

    /// Jacobian matrix, one row per equation and one column per variable.
    pub fn jacobian(&self, state: &[f64]) -> Result<DMatrix<f64>, SystemError> {
        self.validate_input_length(state)?;
        let n = self.variables.len();
        Ok(DMatrix::from_fn(n, n, |i, j| run(&self.jacobian[i][j], state)))
    }

    /// Eigenvalues of the Jacobian.
    pub fn eigenvalues(&self, state: &[f64]) -> Result<Vec<Complex<f64>>, SystemError> {
        Ok(self.jacobian(state)?.complex_eigenvalues().iter().copied().collect())
    }

    /// True if every eigenvalue of the Jacobian has a negative real part.
    pub fn is_stable(&self, state: &[f64]) -> Result<bool, SystemError> {
        Ok(self.eigenvalues(state)?.iter().all(|e| e.re < 0.0))
    }

    /// Integrates with the classic fourth-order Runge-Kutta scheme.
    ///
    /// The last step is shortened to end exactly at `t_end`.
    pub fn integrate(&self, initial: &[f64], t_end: f64, dt: f64) -> Result<Evolution, SystemError> {
        self.validate_input_length(initial)?;
        let n = initial.len();
        let mut evolution = Evolution::new(&self.variables);
        let mut state = initial.to_vec();
        let mut t = 0.0;
        evolution.record(t, &state);

        let shifted = |state: &[f64], k: &[f64], h: f64| -> Vec<f64> {
            state.iter().zip(k).map(|(x, k)| x + h * k).collect()
        };
        while t < t_end && dt > 0.0 {
            let h = dt.min(t_end - t);
            let k1 = self.eval(&state)?;
            let k2 = self.eval(&shifted(&state, &k1, h / 2.0))?;
            let k3 = self.eval(&shifted(&state, &k2, h / 2.0))?;
            let k4 = self.eval(&shifted(&state, &k3, h))?;
            for i in 0..n {
                state[i] += h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
            }
            t += h;
            evolution.record(t, &state);
        }
        Ok(evolution)
    }

    /// Newton iteration for a fixed point `f(x) = 0`.
    ///
    /// # Errors
    /// * `SystemError::SingularJacobian` if a Newton step cannot be solved
    /// * `SystemError::NoConvergence` after `max_iter` iterations
    pub fn fixed_point(
        &self,
        guess: &[f64],
        tolerance: f64,
        max_iter: usize,
    ) -> Result<Vec<f64>, SystemError> {
        self.validate_input_length(guess)?;
        let mut x = DVector::from_column_slice(guess);
        for iteration in 0..max_iter {
            let f = DVector::from_vec(self.eval(x.as_slice())?);
            if f.norm() < tolerance {
                debug!(iteration, "fixed point found");
                return Ok(x.as_slice().to_vec());
            }
            let step = self
                .jacobian(x.as_slice())?
                .lu()
                .solve(&(-f))
                .ok_or_else(|| SystemError::SingularJacobian(x.as_slice().to_vec()))?;
            x += &step;
            if step.norm() < tolerance {
                return Ok(x.as_slice().to_vec());
            }
        }
        Err(SystemError::NoConvergence(max_iter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse_expr;

    fn system(equations: &[(&str, &str)], parameters: &[(&str, f64)]) -> OdeSystem {
        let equations = equations
            .iter()
            .map(|(name, rhs)| (name.to_string(), parse_expr(rhs).unwrap()))
            .collect();
        let parameters = parameters
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        OdeSystem::new(&equations, &parameters).unwrap()
    }

    #[test]
    fn test_eval_and_jacobian() {
        let sys = system(&[("A", "k*A*B - g*A"), ("B", "g*A - k*A*B")], &[("k", 2.0), ("g", 1.0)]);
        assert_eq!(sys.variables, vec!["A", "B"]);
        assert_eq!(sys.eval(&[0.5, 0.5]).unwrap(), vec![0.0, 0.0]);
        let jac = sys.jacobian(&[0.5, 0.5]).unwrap();
        // ∂/∂A = kB - g, ∂/∂B = kA
        assert_eq!(jac[(0, 0)], 0.0);
        assert_eq!(jac[(0, 1)], 1.0);
        assert_eq!(jac[(1, 0)], 0.0);
        assert_eq!(jac[(1, 1)], -1.0);
    }

    #[test]
    fn test_missing_parameter() {
        let equations = BTreeMap::from([("A".to_string(), parse_expr("-k*A").unwrap())]);
        assert!(matches!(
            OdeSystem::new(&equations, &HashMap::new()),
            Err(SystemError::VariableNotFound(ref v)) if v == "k"
        ));
    }

    #[test]
    fn test_input_length() {
        let sys = system(&[("A", "-A")], &[]);
        assert!(matches!(
            sys.eval(&[1.0, 2.0]),
            Err(SystemError::InvalidInputLength { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let sys = system(&[("A", "A^2 - B"), ("B", "A*B")], &[]);
        let states: Vec<Vec<f64>> = (0..50).map(|i| vec![i as f64 * 0.1, 1.0 - i as f64 * 0.01]).collect();
        let parallel = sys.eval_parallel(&states).unwrap();
        for (state, result) in states.iter().zip(&parallel) {
            assert_eq!(&sys.eval(state).unwrap(), result);
        }
    }

    #[test]
    fn test_rk4_decay() {
        let sys = system(&[("A", "-k*A")], &[("k", 0.5)]);
        let evolution = sys.integrate(&[1.0], 4.0, 0.01).unwrap();
        let last = *evolution.states["A"].last().unwrap();
        assert!((last - (-2.0f64).exp()).abs() < 1e-8);
        assert!((evolution.time.last().unwrap() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_logistic_fixed_point() {
        let sys = system(&[("A", "r*A*(1 - A)")], &[("r", 1.5)]);
        let fixed = sys.fixed_point(&[0.7], 1e-12, 50).unwrap();
        assert!((fixed[0] - 1.0).abs() < 1e-9);
        assert!(sys.is_stable(&fixed).unwrap());
        assert!(!sys.is_stable(&[0.0]).unwrap());
    }

    #[test]
    fn test_singular_jacobian() {
        let sys = system(&[("A", "A^2 + 1")], &[]);
        assert!(matches!(
            sys.fixed_point(&[0.0], 1e-12, 10),
            Err(SystemError::SingularJacobian(_))
        ));
    }
}
