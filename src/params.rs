//! Run parameters of the simulation engines.
//!
//! Parameters are plain serde structs with documented defaults. Ranges are checked by
//! `validate()` when an engine is built, so a bad value never starts a run.

use crate::agents::{AgentEngine, AgentRun};
use crate::errors::SimulationError;
use crate::model::Model;
use crate::network::NetworkType;
use crate::ssa::{Evolution, SsaEngine};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Largest accepted random seed.
pub const MAX_RANDOM_SEED: u64 = 4_294_967_295;

/// Upper bound of `max_time`.
pub const MAX_TIME_LIMIT: f64 = 1e6;

/// Draws a fresh seed in `1..=MAX_RANDOM_SEED`.
pub fn draw_seed<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    rng.gen_range(1..=MAX_RANDOM_SEED)
}

/// Seeds of a batch of runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Seeds {
    /// Drawn up front from the base seed
    #[default]
    Auto,
    /// One seed per run
    Explicit(Vec<u64>),
}

/// Parameters of the Gillespie engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsaParams {
    /// Initial population per reactant; missing reactants start at 0
    pub initial_state: BTreeMap<String, u64>,
    pub max_time: f64,
    /// Drawn from `(0, MAX_RANDOM_SEED]` when absent
    pub random_seed: Option<u64>,
    /// Numeric value of every rate symbol
    pub rates: BTreeMap<String, f64>,
}

impl Default for SsaParams {
    fn default() -> Self {
        Self {
            initial_state: BTreeMap::new(),
            max_time: 10.0,
            random_seed: None,
            rates: BTreeMap::new(),
        }
    }
}

impl SsaParams {
    /// Checks every range against the model.
    ///
    /// # Errors
    /// * `SimulationError::ParameterRange` for an out-of-range value or unknown reactant
    /// * `SimulationError::MissingRate` for a rate symbol without value
    pub fn validate(&self, model: &Model) -> Result<(), SimulationError> {
        let species: BTreeSet<String> = model
            .reactants()
            .iter()
            .chain(model.constant_reactants())
            .cloned()
            .collect();
        check_common(
            &self.initial_state,
            self.max_time,
            self.random_seed,
            &self.rates,
            &species,
            model.rates(),
        )
    }

    /// Initial populations over reactants and constants, with the default
    /// `first = 100` when nothing was given.
    pub fn resolved_initial_state(&self, model: &Model) -> BTreeMap<String, u64> {
        let species: BTreeSet<&String> = model
            .reactants()
            .iter()
            .chain(model.constant_reactants())
            .collect();
        resolve_initial_state(&self.initial_state, species)
    }
}

/// Parameters of the agent-based engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentParams {
    /// Initial number of agents per reactant
    pub initial_state: BTreeMap<String, u64>,
    /// Number of time steps
    pub max_time: f64,
    pub random_seed: Option<u64>,
    pub rates: BTreeMap<String, f64>,
    pub network: NetworkType,
    /// Link probability, edges per node or communication range
    pub net_param: Option<f64>,
    pub particle_speed: f64,
    pub motion_correlatedness: f64,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            initial_state: BTreeMap::new(),
            max_time: 10.0,
            random_seed: None,
            rates: BTreeMap::new(),
            network: NetworkType::Full,
            net_param: None,
            particle_speed: 0.01,
            motion_correlatedness: 0.5,
        }
    }
}

impl AgentParams {
    /// Checks every range against the model, including the network parameter.
    ///
    /// # Errors
    /// * `SimulationError::ParameterRange` for an out-of-range value or unknown reactant
    /// * `SimulationError::MissingRate` for a rate symbol without value
    pub fn validate(&self, model: &Model) -> Result<(), SimulationError> {
        check_common(
            &self.initial_state,
            self.max_time,
            self.random_seed,
            &self.rates,
            model.reactants(),
            model.rates(),
        )?;
        check_range("particle_speed", self.particle_speed, 0.0, 0.1)?;
        check_range("motion_correlatedness", self.motion_correlatedness, 0.0, 1.0)?;
        let agents = self.resolved_initial_state(model).values().sum::<u64>() as usize;
        self.network_param(agents).map(|_| ())
    }

    /// Agents per reactant with the default `first = 100` when nothing was given.
    pub fn resolved_initial_state(&self, model: &Model) -> BTreeMap<String, u64> {
        resolve_initial_state(&self.initial_state, model.reactants())
    }

    /// The network parameter with its default filled in and its range checked.
    ///
    /// # Errors
    /// `SimulationError::ParameterRange` if the value is outside the range of the
    /// network type.
    pub fn network_param(&self, agents: usize) -> Result<Option<f64>, SimulationError> {
        match self.network {
            NetworkType::Full => Ok(None),
            NetworkType::ErdosRenyi => {
                let p = self.net_param.unwrap_or(0.5);
                if p <= 0.0 || p > 1.0 {
                    return Err(SimulationError::ParameterRange(format!(
                        "link probability {p} outside (0, 1]"
                    )));
                }
                Ok(Some(p))
            }
            NetworkType::BarabasiAlbert => {
                let m = self
                    .net_param
                    .unwrap_or_else(|| agents.saturating_sub(1).min(3) as f64);
                let edges = m.trunc();
                if edges < 1.0 || edges > agents as f64 {
                    return Err(SimulationError::ParameterRange(format!(
                        "edges per node {edges} outside [1, {agents}]"
                    )));
                }
                Ok(Some(edges))
            }
            NetworkType::Dynamic => {
                let range = self.net_param.unwrap_or(0.1);
                check_range("communication range", range, 0.0, 1.0)?;
                Ok(Some(range))
            }
        }
    }
}

fn check_range(name: &str, value: f64, low: f64, high: f64) -> Result<(), SimulationError> {
    if !(low..=high).contains(&value) {
        return Err(SimulationError::ParameterRange(format!(
            "{name} = {value} outside [{low}, {high}]"
        )));
    }
    Ok(())
}

fn check_seed(seed: u64) -> Result<(), SimulationError> {
    if seed > MAX_RANDOM_SEED {
        return Err(SimulationError::ParameterRange(format!(
            "random seed {seed} outside [0, {MAX_RANDOM_SEED}]"
        )));
    }
    Ok(())
}

fn check_common(
    initial_state: &BTreeMap<String, u64>,
    max_time: f64,
    random_seed: Option<u64>,
    rates: &BTreeMap<String, f64>,
    species: &BTreeSet<String>,
    rate_symbols: &BTreeSet<String>,
) -> Result<(), SimulationError> {
    if !(max_time > 0.0 && max_time <= MAX_TIME_LIMIT) {
        return Err(SimulationError::ParameterRange(format!(
            "max_time = {max_time} outside (0, {MAX_TIME_LIMIT}]"
        )));
    }
    if let Some(seed) = random_seed {
        check_seed(seed)?;
    }
    if let Some(unknown) = initial_state.keys().find(|k| !species.contains(*k)) {
        return Err(SimulationError::ParameterRange(format!(
            "initial state names unknown reactant '{unknown}'"
        )));
    }
    for symbol in rate_symbols {
        let value = rates
            .get(symbol)
            .ok_or_else(|| SimulationError::MissingRate(symbol.clone()))?;
        if value.is_nan() || *value < 0.0 {
            return Err(SimulationError::ParameterRange(format!(
                "rate {symbol} = {value} must be >= 0"
            )));
        }
    }
    Ok(())
}

fn resolve_initial_state<'a>(
    given: &BTreeMap<String, u64>,
    species: impl IntoIterator<Item = &'a String>,
) -> BTreeMap<String, u64> {
    let mut state: BTreeMap<String, u64> =
        species.into_iter().map(|s| (s.clone(), 0)).collect();
    if given.is_empty() {
        if let Some(first) = state.values_mut().next() {
            *first = 100;
        }
    } else {
        state.extend(given.iter().map(|(k, v)| (k.clone(), *v)));
    }
    state
}

/// Resolves a batch of seeds.
///
/// # Errors
/// `SimulationError::ParameterRange` if there are no iterations, or explicit seeds do
/// not match the iteration count or the seed range.
pub fn resolve_seeds<R: Rng + ?Sized>(
    iterations: usize,
    seeds: &Seeds,
    rng: &mut R,
) -> Result<Vec<u64>, SimulationError> {
    if iterations == 0 {
        return Err(SimulationError::ParameterRange(
            "at least one iteration is required".to_string(),
        ));
    }
    match seeds {
        Seeds::Auto => Ok((0..iterations).map(|_| draw_seed(rng)).collect()),
        Seeds::Explicit(list) => {
            if list.len() != iterations {
                return Err(SimulationError::ParameterRange(format!(
                    "{} seeds given for {iterations} iterations",
                    list.len()
                )));
            }
            list.iter().try_for_each(|s| check_seed(*s))?;
            Ok(list.clone())
        }
    }
}

/// Engine and parameters of a stored run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "engine", content = "params", rename_all = "lowercase")]
pub enum Engine {
    Ssa(SsaParams),
    Agents(AgentParams),
}

/// Everything needed to replay a run: the rule text and the engine parameters.
///
/// ```
/// use mumot::params::{Engine, RunDescriptor, SsaParams};
///
/// let descriptor = RunDescriptor {
///     model: "A -> B : k\nB -> A : g".to_string(),
///     engine: Engine::Ssa(SsaParams::default()),
/// };
/// let json = serde_json::to_string(&descriptor).unwrap();
/// assert_eq!(RunDescriptor::from_json(&json).unwrap(), descriptor);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub model: String,
    pub engine: Engine,
}

/// Output of a replayed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunOutput {
    Ssa(Evolution),
    Agents(AgentRun),
}

impl RunDescriptor {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses the model and runs the engine once.
    ///
    /// A descriptor without seed draws one, so only descriptors carrying a seed replay
    /// exactly.
    pub fn execute(&self) -> Result<RunOutput, SimulationError> {
        let model = Model::parse(&self.model)?;
        match &self.engine {
            Engine::Ssa(params) => {
                let engine = SsaEngine::new(&model, params.clone())?;
                Ok(RunOutput::Ssa(engine.single_run(engine.seed())?))
            }
            Engine::Agents(params) => {
                let engine = AgentEngine::new(&model, params.clone())?;
                Ok(RunOutput::Agents(engine.run(engine.seed())?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model() -> Model {
        Model::parse("A -> B : k\nB -> A : g").unwrap()
    }

    fn rates() -> BTreeMap<String, f64> {
        [("k".to_string(), 1.0), ("g".to_string(), 0.5)].into()
    }

    #[test]
    fn test_defaults() {
        let params = SsaParams::default();
        assert_eq!(params.max_time, 10.0);
        let state = params.resolved_initial_state(&model());
        assert_eq!(state["A"], 100);
        assert_eq!(state["B"], 0);
        let agents = AgentParams::default();
        assert_eq!(agents.network, NetworkType::Full);
        assert_eq!(agents.particle_speed, 0.01);
    }

    #[test]
    fn test_missing_rate() {
        let params = SsaParams {
            rates: [("k".to_string(), 1.0)].into(),
            ..Default::default()
        };
        assert!(matches!(
            params.validate(&model()),
            Err(SimulationError::MissingRate(name)) if name == "g"
        ));
    }

    #[test]
    fn test_ranges() {
        let model = model();
        let bad_time = SsaParams {
            max_time: 0.0,
            rates: rates(),
            ..Default::default()
        };
        assert!(matches!(
            bad_time.validate(&model),
            Err(SimulationError::ParameterRange(_))
        ));
        let bad_seed = SsaParams {
            random_seed: Some(MAX_RANDOM_SEED + 1),
            rates: rates(),
            ..Default::default()
        };
        assert!(bad_seed.validate(&model).is_err());
        let unknown = SsaParams {
            initial_state: [("C".to_string(), 3)].into(),
            rates: rates(),
            ..Default::default()
        };
        assert!(unknown.validate(&model).is_err());
        let ok = SsaParams {
            rates: rates(),
            ..Default::default()
        };
        assert!(ok.validate(&model).is_ok());
    }

    #[test]
    fn test_network_param() {
        let mut params = AgentParams {
            network: NetworkType::BarabasiAlbert,
            ..Default::default()
        };
        assert_eq!(params.network_param(10).unwrap(), Some(3.0));
        assert_eq!(params.network_param(2).unwrap(), Some(1.0));
        params.net_param = Some(11.0);
        assert!(params.network_param(10).is_err());
        params.network = NetworkType::ErdosRenyi;
        params.net_param = Some(0.0);
        assert!(params.network_param(10).is_err());
        params.net_param = None;
        assert_eq!(params.network_param(10).unwrap(), Some(0.5));
        params.network = NetworkType::Dynamic;
        assert_eq!(params.network_param(10).unwrap(), Some(0.1));
    }

    #[test]
    fn test_resolve_seeds() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let auto = resolve_seeds(4, &Seeds::Auto, &mut rng).unwrap();
        assert_eq!(auto.len(), 4);
        assert!(auto.iter().all(|s| (1..=MAX_RANDOM_SEED).contains(s)));
        assert!(resolve_seeds(2, &Seeds::Explicit(vec![1]), &mut rng).is_err());
        assert!(resolve_seeds(1, &Seeds::Explicit(vec![MAX_RANDOM_SEED + 1]), &mut rng).is_err());
        assert!(resolve_seeds(0, &Seeds::Auto, &mut rng).is_err());
        assert_eq!(
            resolve_seeds(2, &Seeds::Explicit(vec![0, 5]), &mut rng).unwrap(),
            vec![0, 5]
        );
    }

    #[test]
    fn test_descriptor_json() {
        let descriptor = RunDescriptor {
            model: "A -> B : k\nB -> A : g".to_string(),
            engine: Engine::Agents(AgentParams {
                network: NetworkType::Dynamic,
                random_seed: Some(42),
                rates: rates(),
                ..Default::default()
            }),
        };
        let json = descriptor.to_json().unwrap();
        assert!(json.contains("\"engine\": \"agents\""));
        assert!(json.contains("\"network\": \"dynamic\""));
        assert_eq!(RunDescriptor::from_json(&json).unwrap(), descriptor);
    }

    #[test]
    fn test_descriptor_replays() {
        let descriptor = RunDescriptor {
            model: "A -> B : k\nB -> A : g".to_string(),
            engine: Engine::Ssa(SsaParams {
                random_seed: Some(3),
                max_time: 2.0,
                rates: rates(),
                ..Default::default()
            }),
        };
        assert_eq!(descriptor.execute().unwrap(), descriptor.execute().unwrap());
    }
}
