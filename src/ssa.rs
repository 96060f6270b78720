//! Gillespie stochastic simulation of a rule set.
//!
//! Each run owns a `ChaCha8Rng` seeded from its own seed, so a run is reproducible on
//! any platform and a batch of runs gives the same result sequentially or in parallel.

use crate::errors::{ModelError, SimulationError};
use crate::model::Model;
use crate::params::{draw_seed, resolve_seeds, Seeds, SsaParams, MAX_TIME_LIMIT};
use crate::stoichiometry::StoichEntry;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Time series of every reactant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Evolution {
    pub time: Vec<f64>,
    pub states: BTreeMap<String, Vec<f64>>,
}

impl Evolution {
    pub fn new(names: &[String]) -> Self {
        Self {
            time: Vec::new(),
            states: names.iter().map(|n| (n.clone(), Vec::new())).collect(),
        }
    }

    /// Appends one sample; `values` follow the sorted order of the names.
    pub fn record(&mut self, t: f64, values: &[f64]) {
        self.time.push(t);
        for (series, value) in self.states.values_mut().zip(values) {
            series.push(*value);
        }
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Value of `name` at time `t`: the last sample recorded at or before `t`.
    pub fn value_at(&self, name: &str, t: f64) -> Option<f64> {
        let index = self.time.partition_point(|s| *s <= t).checked_sub(1)?;
        self.states.get(name).and_then(|series| series.get(index)).copied()
    }

    /// Average of several runs on the union of their time grids.
    ///
    /// Every run is resampled by holding its last value. Returns `None` for an empty
    /// slice.
    pub fn mean(runs: &[Evolution]) -> Option<Evolution> {
        let first = runs.first()?;
        let mut grid: Vec<f64> = runs.iter().flat_map(|r| r.time.iter().copied()).collect();
        grid.sort_by(f64::total_cmp);
        grid.dedup();

        let names: Vec<String> = first.states.keys().cloned().collect();
        let mut mean = Evolution::new(&names);
        let count = runs.len() as f64;
        for t in grid {
            let values: Vec<f64> = names
                .iter()
                .map(|name| {
                    runs.iter()
                        .filter_map(|r| r.value_at(name, t))
                        .sum::<f64>()
                        / count
                })
                .collect();
            mean.record(t, &values);
        }
        Some(mean)
    }
}

/// Result of one Gillespie step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// Reaction `reaction` (index in stoichiometry order) fired after `dt`
    Event { dt: f64, reaction: usize },
    /// Every propensity is zero
    Exhausted,
}

#[derive(Debug, Clone)]
struct SsaReaction {
    rate: f64,
    /// species index and occupancy of every reagent
    reagents: Vec<(usize, u32)>,
    /// species index and net change of every variable reactant
    changes: Vec<(usize, i64)>,
}

/// Gillespie engine with evaluated rates.
#[derive(Debug, Clone)]
pub struct SsaEngine {
    species: Vec<String>,
    reactions: Vec<SsaReaction>,
    initial: BTreeMap<String, u64>,
    max_time: f64,
    seed: u64,
}

/// Evaluates a rate expression with the numeric rate values.
pub(crate) fn eval_rate(
    rate: &crate::expr::Expr,
    values: &HashMap<String, f64>,
) -> Result<f64, SimulationError> {
    if let Some(missing) = rate.symbols().into_iter().find(|s| !values.contains_key(s)) {
        return Err(SimulationError::MissingRate(missing));
    }
    let value = rate.eval(values).map_err(SimulationError::ParameterRange)?;
    if value.is_nan() || value < 0.0 {
        return Err(SimulationError::ParameterRange(format!(
            "rate {rate} evaluates to {value}"
        )));
    }
    Ok(value)
}

/// Substituted models keep the eliminated reactant in their stoichiometry only.
pub(crate) fn reject_substituted(model: &Model) -> Result<(), SimulationError> {
    if let Some((reactant, expr)) = model.stoichiometry().substitution() {
        return Err(ModelError::InvalidSubstitution {
            assignment: format!("{reactant} = {expr}"),
            reason: "models with a substituted reactant cannot be simulated".to_string(),
        }
        .into());
    }
    Ok(())
}

impl SsaEngine {
    /// Validates the parameters and evaluates the rate of every reaction.
    ///
    /// # Errors
    /// * `SimulationError::ParameterRange` / `MissingRate` from parameter validation
    /// * `SimulationError::Model` for a model with a substituted reactant
    pub fn new(model: &Model, params: SsaParams) -> Result<Self, SimulationError> {
        params.validate(model)?;
        reject_substituted(model)?;
        let initial = params.resolved_initial_state(model);
        let species: Vec<String> = initial.keys().cloned().collect();
        let position = |name: &str| species.iter().position(|s| s == name);
        let values: HashMap<String, f64> = params.rates.clone().into_iter().collect();

        let mut reactions = Vec::new();
        for reaction in &model.stoichiometry().reactions {
            let mut reagents = Vec::new();
            let mut changes = Vec::new();
            for (name, entry) in &reaction.entries {
                let Some(index) = position(name) else {
                    continue;
                };
                match entry {
                    StoichEntry::Const => reagents.push((index, 1)),
                    StoichEntry::Change {
                        consumed, produced, ..
                    } => {
                        if *consumed > 0 {
                            reagents.push((index, *consumed));
                        }
                        if consumed != produced {
                            changes.push((index, *produced as i64 - *consumed as i64));
                        }
                    }
                }
            }
            reactions.push(SsaReaction {
                rate: eval_rate(&reaction.rate, &values)?,
                reagents,
                changes,
            });
        }

        let seed = params
            .random_seed
            .unwrap_or_else(|| draw_seed(&mut rand::thread_rng()));
        Ok(Self {
            species,
            reactions,
            initial,
            max_time: params.max_time,
            seed,
        })
    }

    /// Base seed of this engine.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Reactants and constants in state order.
    pub fn species(&self) -> &[String] {
        &self.species
    }

    /// Propensity of every reaction.
    ///
    /// Reactions with more than one reagent are normalised by the total population
    /// (constants included) to the power `reagents - 1`.
    pub fn propensities(&self, state: &[i64]) -> Vec<f64> {
        let total = state.iter().sum::<i64>() as f64;
        self.reactions
            .iter()
            .map(|reaction| {
                let mut prob = reaction.rate;
                let mut reagents = 0;
                for &(index, occupancy) in &reaction.reagents {
                    prob *= state[index] as f64 * occupancy as f64;
                    reagents += occupancy;
                }
                if prob > 0.0 && reagents > 1 {
                    prob /= total.powi(reagents as i32 - 1);
                }
                prob
            })
            .collect()
    }

    /// Draws the waiting time and the reaction of the next event without applying it.
    ///
    /// # Errors
    /// `SimulationError::NoReactionSelected` if the cumulative walk falls through.
    pub fn next_event<R: Rng + ?Sized>(
        &self,
        state: &[i64],
        rng: &mut R,
    ) -> Result<StepOutcome, SimulationError> {
        let propensities = self.propensities(state);
        let total: f64 = propensities.iter().sum();
        if total <= 0.0 {
            return Ok(StepOutcome::Exhausted);
        }
        let u = 1.0 - rng.gen::<f64>();
        let dt = -u.ln() / total;
        let r = loop {
            let r: f64 = rng.gen();
            if r != 0.0 {
                break r;
            }
        };

        let mut bottom = 0.0;
        for (index, propensity) in propensities.iter().enumerate() {
            let p = propensity / total;
            if r >= bottom && r < bottom + p {
                return Ok(StepOutcome::Event { dt, reaction: index });
            }
            bottom += p;
        }
        Err(SimulationError::NoReactionSelected { draw: r })
    }

    /// Applies the net change of `reaction` to `state`; `time` only labels errors.
    ///
    /// # Errors
    /// `SimulationError::NegativePopulation` if a population would drop below zero.
    pub fn apply(&self, state: &mut [i64], reaction: usize, time: f64) -> Result<(), SimulationError> {
        for &(index, change) in &self.reactions[reaction].changes {
            state[index] += change;
            if state[index] < 0 {
                return Err(SimulationError::NegativePopulation {
                    reactant: self.species[index].clone(),
                    time,
                });
            }
        }
        Ok(())
    }

    /// Draws the next event and applies it to `state`.
    ///
    /// # Errors
    /// * `SimulationError::NoReactionSelected` if the cumulative walk falls through
    /// * `SimulationError::NegativePopulation` if a population would drop below zero
    pub fn step<R: Rng + ?Sized>(
        &self,
        state: &mut [i64],
        t: f64,
        rng: &mut R,
    ) -> Result<StepOutcome, SimulationError> {
        let outcome = self.next_event(state, rng)?;
        if let StepOutcome::Event { dt, reaction } = outcome {
            self.apply(state, reaction, t + dt)?;
        }
        Ok(outcome)
    }

    /// Runs one trajectory until `max_time`.
    ///
    /// Events are applied only while they fall within `max_time`. The first event past
    /// the horizon, or exhausted propensities, end the run with the current state
    /// recorded at `max_time`. The callback sees the time and state after every event
    /// and at the horizon.
    pub fn run(
        &self,
        initial_state: &BTreeMap<String, u64>,
        max_time: f64,
        seed: u64,
        mut callback: Option<&mut dyn FnMut(f64, &[i64])>,
    ) -> Result<Evolution, SimulationError> {
        if !(max_time > 0.0 && max_time <= MAX_TIME_LIMIT) {
            return Err(SimulationError::ParameterRange(format!(
                "max_time = {max_time} outside (0, {MAX_TIME_LIMIT}]"
            )));
        }
        if let Some(unknown) = initial_state.keys().find(|k| !self.species.contains(k)) {
            return Err(SimulationError::ParameterRange(format!(
                "initial state names unknown reactant '{unknown}'"
            )));
        }
        let mut state: Vec<i64> = self
            .species
            .iter()
            .map(|s| initial_state.get(s).copied().unwrap_or(0) as i64)
            .collect();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut evolution = Evolution::new(&self.species);
        let as_f64 = |state: &[i64]| state.iter().map(|v| *v as f64).collect::<Vec<_>>();

        let mut t = 0.0;
        let mut events = 0usize;
        evolution.record(t, &as_f64(&state));
        while t < max_time {
            t = match self.next_event(&state, &mut rng)? {
                StepOutcome::Event { dt, reaction } if t + dt <= max_time => {
                    self.apply(&mut state, reaction, t + dt)?;
                    events += 1;
                    t + dt
                }
                _ => max_time,
            };
            evolution.record(t, &as_f64(&state));
            if let Some(callback) = callback.as_mut() {
                callback(t, &state);
            }
        }
        debug!(seed, events, "SSA run finished");
        Ok(evolution)
    }

    /// Runs one trajectory from the configured initial state.
    pub fn single_run(&self, seed: u64) -> Result<Evolution, SimulationError> {
        self.run(&self.initial, self.max_time, seed, None)
    }

    /// Runs `iterations` independently seeded trajectories in parallel.
    ///
    /// Results are returned in seed order.
    ///
    /// # Errors
    /// `SimulationError::ParameterRange` for invalid seeds, before any run starts.
    pub fn multirun(
        &self,
        iterations: usize,
        seeds: &Seeds,
    ) -> Result<Vec<Evolution>, SimulationError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let seeds = resolve_seeds(iterations, seeds, &mut rng)?;
        debug!(iterations, "starting SSA batch");
        seeds.par_iter().map(|seed| self.single_run(*seed)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(rules: &str, initial: &[(&str, u64)], rates: &[(&str, f64)], max_time: f64) -> SsaEngine {
        let model = Model::parse(rules).unwrap();
        let params = SsaParams {
            initial_state: initial.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            max_time,
            random_seed: Some(11),
            rates: rates.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        };
        SsaEngine::new(&model, params).unwrap()
    }

    #[test]
    fn test_decay_mean() {
        let ssa = engine("A -> \\emptyset : k", &[("A", 100)], &[("k", 1.0)], 2.0);
        let runs = ssa.multirun(60, &Seeds::Auto).unwrap();
        let mean = Evolution::mean(&runs).unwrap();
        let expected = 100.0 * (-1.0f64).exp();
        assert!((mean.value_at("A", 1.0).unwrap() - expected).abs() < 4.0);
        assert_eq!(mean.value_at("A", 0.0), Some(100.0));
    }

    #[test]
    fn test_decay_runs_never_increase() {
        let ssa = engine("A -> \\emptyset : k", &[("A", 100)], &[("k", 1.0)], 3.0);
        for seed in 1..=10 {
            let run = ssa.single_run(seed).unwrap();
            let a = &run.states["A"];
            // one decay per event, the horizon sample repeats the last state
            assert!(a.windows(2).all(|w| w[0] - w[1] == 1.0 || w[0] == w[1]));
            assert_eq!(run.time.last().copied(), Some(3.0));
            let last = a.len() - 1;
            assert_eq!(a[last], a[last - 1]);
        }
    }

    #[test]
    fn test_event_past_horizon_not_applied() {
        // a decay before t = 1 has probability about 1e-6
        let ssa = engine("A -> \\emptyset : k", &[("A", 1)], &[("k", 1e-6)], 1.0);
        for seed in 1..=20 {
            let run = ssa.single_run(seed).unwrap();
            assert_eq!(run.time, vec![0.0, 1.0]);
            assert_eq!(run.states["A"], vec![1.0, 1.0]);
        }
    }

    #[test]
    fn test_symmetric_flip_mean() {
        let ssa = engine("A -> B : k\nB -> A : g", &[("A", 200)], &[("k", 0.5), ("g", 0.5)], 10.0);
        let runs = ssa.multirun(40, &Seeds::Auto).unwrap();
        let mean = Evolution::mean(&runs).unwrap();
        let a = mean.value_at("A", 10.0).unwrap();
        assert!((a - 100.0).abs() < 5.0, "mean {a}");
        assert!((mean.value_at("B", 10.0).unwrap() + a - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_axis() {
        let ssa = engine("A -> B : k\nB -> A : g", &[("A", 50)], &[("k", 1.0), ("g", 2.0)], 5.0);
        let run = ssa.single_run(3).unwrap();
        assert_eq!(run.time[0], 0.0);
        assert!(run.time.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(run.time.last().copied(), Some(5.0));
        for i in 0..run.len() {
            assert_eq!(run.states["A"][i] + run.states["B"][i], 50.0);
        }
    }

    #[test]
    fn test_exhausted_terminates() {
        let ssa = engine("A -> \\emptyset : k", &[("A", 3)], &[("k", 1.0)], 1000.0);
        let run = ssa.single_run(5).unwrap();
        assert_eq!(run.states["A"].last().copied(), Some(0.0));
        assert_eq!(run.time.last().copied(), Some(1000.0));
        // three decays, one jump to the end
        assert_eq!(run.len(), 5);
    }

    #[test]
    fn test_deterministic_per_seed() {
        let ssa = engine("A + B -> A + A : k\nA -> B : g", &[("A", 20), ("B", 80)], &[("k", 2.0), ("g", 1.0)], 3.0);
        assert_eq!(ssa.single_run(9).unwrap(), ssa.single_run(9).unwrap());
        let batch = ssa.multirun(3, &Seeds::Explicit(vec![4, 9, 1])).unwrap();
        assert_eq!(batch[1], ssa.single_run(9).unwrap());
    }

    #[test]
    fn test_seed_validation() {
        let ssa = engine("A -> B : k", &[("A", 5)], &[("k", 1.0)], 1.0);
        assert!(matches!(
            ssa.multirun(2, &Seeds::Explicit(vec![1, 2, 3])),
            Err(SimulationError::ParameterRange(_))
        ));
    }

    #[test]
    fn test_constants_scale_and_stay() {
        let ssa = engine("(X) + \\emptyset -> (X) + A : k\nA -> \\emptyset : g", &[("X", 10)], &[("k", 1.0), ("g", 1.0)], 1.0);
        assert_eq!(ssa.species(), &["A".to_string(), "X".to_string()]);
        assert_eq!(ssa.propensities(&[0, 10]), vec![10.0, 0.0]);
        let run = ssa.single_run(2).unwrap();
        assert!(run.states["X"].iter().all(|x| *x == 10.0));
    }

    #[test]
    fn test_pair_occupancy_can_overdraw() {
        // A + A counts the pair with occupancy 2, so a single A still reacts
        let ssa = engine("A + A -> B + B : k", &[("A", 1)], &[("k", 1.0)], 1.0);
        let mut state = vec![1, 0];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(matches!(
            ssa.step(&mut state, 0.0, &mut rng),
            Err(SimulationError::NegativePopulation { reactant, .. }) if reactant == "A"
        ));
    }

    #[test]
    fn test_callback_sees_events() {
        let ssa = engine("A -> \\emptyset : k", &[("A", 4)], &[("k", 1.0)], 100.0);
        let mut seen = Vec::new();
        let mut callback = |t: f64, state: &[i64]| seen.push((t, state[0]));
        ssa.run(&[("A".to_string(), 4)].into(), 100.0, 8, Some(&mut callback))
            .unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[3].1, 0);
    }

    #[test]
    fn test_missing_rate_value() {
        let model = Model::parse("A -> B : k*c").unwrap();
        let params = SsaParams {
            rates: [("k".to_string(), 1.0)].into(),
            ..Default::default()
        };
        assert!(matches!(
            SsaEngine::new(&model, params),
            Err(SimulationError::MissingRate(name)) if name == "c"
        ));
    }
}
