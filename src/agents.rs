//! Agent-based simulation on networks.
//!
//! Every agent carries the name of one reactant. At each time step every agent draws
//! one uniform number and walks the transitions of its state: spontaneous ones with
//! their scaled rate, interactions with the scaled rate times the fraction of
//! neighbours in the partner state.

use crate::errors::{ModelError, SimulationError};
use crate::model::Model;
use crate::network::{circular_layout, range_neighbours, update_position, Network, Position};
use crate::params::{draw_seed, resolve_seeds, AgentParams, Seeds};
use crate::parser::{Rule, Species};
use crate::ssa::{eval_rate, reject_substituted, Evolution};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// What a transition needs besides the agent itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partner {
    /// Nothing: a spontaneous transition
    Void,
    /// A neighbour in this state
    Reactant(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Per-step probability weight
    pub rate: f64,
    pub destination: String,
}

/// Transitions of every reactant, grouped by partner.
///
/// The void group always comes first; the other groups keep the order in which the
/// rules introduced them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbabilityMap {
    buckets: BTreeMap<String, Vec<(Partner, Vec<Transition>)>>,
}

fn push_transition(
    groups: &mut Vec<(Partner, Vec<Transition>)>,
    partner: Partner,
    transition: Transition,
) {
    match groups.iter_mut().find(|(p, _)| *p == partner) {
        Some((_, transitions)) => transitions.push(transition),
        None => groups.push((partner, vec![transition])),
    }
}

fn species_name(species: &Species) -> Option<&str> {
    match species {
        Species::Variable(name) => Some(name),
        Species::Constant(_) | Species::Void => None,
    }
}

impl ProbabilityMap {
    /// Builds the transition table from the rules.
    ///
    /// A reactant gets an interaction transition only from the rules where it changes
    /// state; when both reagents change, the first unclaimed right hand side entry
    /// goes to the first reactant considered.
    ///
    /// # Errors
    /// * `ModelError::UnbalancedRule` for rules with different side lengths
    /// * `ModelError::UnsupportedRule` for more than two reagents, `\emptyset` or
    ///   constant reactants
    /// * `SimulationError::MissingRate` if a rate cannot be evaluated
    pub fn build(
        reactants: &BTreeSet<String>,
        rules: &[Rule],
        rates: &HashMap<String, f64>,
    ) -> Result<Self, SimulationError> {
        for rule in rules {
            if rule.lhs.len() != rule.rhs.len() {
                return Err(ModelError::UnbalancedRule {
                    lhs: rule.lhs.len(),
                    rhs: rule.rhs.len(),
                    rule: rule.to_string(),
                }
                .into());
            }
            if rule.lhs.len() > 2 {
                return Err(ModelError::UnsupportedRule {
                    rule: rule.to_string(),
                    reason: "at most two reagents per rule".to_string(),
                }
                .into());
            }
            if rule.lhs.iter().chain(&rule.rhs).any(|s| species_name(s).is_none()) {
                return Err(ModelError::UnsupportedRule {
                    rule: rule.to_string(),
                    reason: "agents cannot be created, destroyed or held constant".to_string(),
                }
                .into());
            }
        }

        let mut claimed: HashMap<usize, Vec<String>> = HashMap::new();
        let mut buckets = BTreeMap::new();
        for reactant in reactants {
            let mut groups: Vec<(Partner, Vec<Transition>)> = vec![(Partner::Void, Vec::new())];
            for (index, rule) in rules.iter().enumerate() {
                let lhs: Vec<&str> = rule.lhs.iter().filter_map(species_name).collect();
                let rhs: Vec<&str> = rule.rhs.iter().filter_map(species_name).collect();
                for _ in lhs.iter().filter(|name| **name == reactant.as_str()) {
                    let rate = eval_rate(&rule.rate, rates)?;
                    if lhs.len() == 1 {
                        let transition = Transition {
                            rate,
                            destination: rhs[0].to_string(),
                        };
                        push_transition(&mut groups, Partner::Void, transition);
                    } else if !rhs.contains(&reactant.as_str()) {
                        let other = if lhs[0] == reactant.as_str() { lhs[1] } else { lhs[0] };
                        let taken = claimed.entry(index).or_default();
                        let destination = if taken.iter().any(|t| t == rhs[0]) || rhs[0] == other {
                            rhs[1]
                        } else {
                            rhs[0]
                        };
                        taken.push(destination.to_string());
                        let transition = Transition {
                            rate,
                            destination: destination.to_string(),
                        };
                        push_transition(&mut groups, Partner::Reactant(other.to_string()), transition);
                    } else if lhs.iter().all(|name| *name == reactant.as_str()) {
                        warn!(%reactant, rule = %rule, "self-interaction is not handled by the agent engine");
                    }
                }
            }
            buckets.insert(reactant.clone(), groups);
        }
        Ok(Self { buckets })
    }

    /// Transition groups of a reactant.
    pub fn groups(&self, reactant: &str) -> &[(Partner, Vec<Transition>)] {
        self.buckets.get(reactant).map(Vec::as_slice).unwrap_or_default()
    }

    /// Worst-case probability of leaving `reactant` in one step: the largest
    /// interaction group plus all spontaneous transitions.
    pub fn max_outflow(&self, reactant: &str) -> f64 {
        let mut void = 0.0;
        let mut interaction: f64 = 0.0;
        for (partner, transitions) in self.groups(reactant) {
            let sum: f64 = transitions.iter().map(|t| t.rate).sum();
            match partner {
                Partner::Void => void += sum,
                Partner::Reactant(_) => interaction = interaction.max(sum),
            }
        }
        void + interaction
    }

    /// Step size that keeps every outflow at most 1.
    pub fn timestep(&self) -> f64 {
        let max = self
            .buckets
            .keys()
            .map(|r| self.max_outflow(r))
            .fold(0.0, f64::max);
        if max > 0.0 {
            1.0 / max
        } else {
            1.0
        }
    }

    /// Every rate multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> ProbabilityMap {
        let mut map = self.clone();
        for groups in map.buckets.values_mut() {
            for (_, transitions) in groups.iter_mut() {
                for transition in transitions.iter_mut() {
                    transition.rate *= factor;
                }
            }
        }
        map
    }
}

/// Result of one agent-based run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    /// Number of agents per state after every step
    pub evolution: Evolution,
    /// Position history per agent, dynamic networks only
    pub positions: Option<Vec<Vec<Position>>>,
    /// Node coordinates for drawing, static networks only
    pub layout: Option<Vec<(f64, f64)>>,
}

/// Transitions with reactant indices: (partner, [(rate, destination)]).
type IndexedGroups = Vec<(Option<usize>, Vec<(f64, usize)>)>;

/// Agent-based engine with a generated network and scaled transition table.
#[derive(Debug, Clone)]
pub struct AgentEngine {
    reactants: Vec<String>,
    map: ProbabilityMap,
    table: Vec<IndexedGroups>,
    network: Network,
    initial: BTreeMap<String, u64>,
    steps: usize,
    speed: f64,
    correlatedness: f64,
    timestep: f64,
    seed: u64,
}

impl AgentEngine {
    /// Validates the parameters, builds the transition table and generates the network
    /// from the base seed.
    pub fn new(model: &Model, params: AgentParams) -> Result<Self, SimulationError> {
        params.validate(model)?;
        reject_substituted(model)?;
        let rates: HashMap<String, f64> = params.rates.clone().into_iter().collect();
        let raw = ProbabilityMap::build(model.reactants(), model.rules(), &rates)?;
        let timestep = raw.timestep();
        let map = raw.scaled(timestep);
        info!(timestep, "agent time step chosen");

        let reactants: Vec<String> = model.reactants().iter().cloned().collect();
        let index_of = |name: &str| reactants.iter().position(|r| r == name);
        let mut table = Vec::with_capacity(reactants.len());
        for reactant in &reactants {
            let mut groups = Vec::new();
            for (partner, transitions) in map.groups(reactant) {
                let partner = match partner {
                    Partner::Void => None,
                    Partner::Reactant(name) => index_of(name),
                };
                let transitions = transitions
                    .iter()
                    .filter_map(|t| index_of(&t.destination).map(|d| (t.rate, d)))
                    .collect();
                groups.push((partner, transitions));
            }
            table.push(groups);
        }

        let initial = params.resolved_initial_state(model);
        let agents = initial.values().sum::<u64>() as usize;
        let seed = params
            .random_seed
            .unwrap_or_else(|| draw_seed(&mut rand::thread_rng()));
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let network = Network::build(params.network, agents, params.network_param(agents)?, &mut rng)?;

        Ok(Self {
            reactants,
            map,
            table,
            network,
            initial,
            steps: params.max_time.floor() as usize,
            speed: params.particle_speed,
            correlatedness: params.motion_correlatedness,
            timestep,
            seed,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Duration of one step in units of the model rates.
    pub fn timestep(&self) -> f64 {
        self.timestep
    }

    /// The scaled transition table.
    pub fn probabilities(&self) -> &ProbabilityMap {
        &self.map
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// New state of one agent given the states of its neighbours.
    fn step_one_agent<R: Rng + ?Sized>(&self, state: usize, neighbours: &[usize], rng: &mut R) -> usize {
        let draw: f64 = rng.gen();
        let mut last = 0.0;
        for (partner, transitions) in &self.table[state] {
            let scaling = match partner {
                None => 1.0,
                Some(_) if neighbours.is_empty() => 0.0,
                Some(p) => {
                    neighbours.iter().filter(|n| *n == p).count() as f64 / neighbours.len() as f64
                }
            };
            for (rate, destination) in transitions {
                let value = scaling * rate;
                if draw < value + last {
                    return *destination;
                }
                last += value;
            }
        }
        state
    }

    /// Advances every agent by one step and returns the number of agents per state.
    ///
    /// Neighbourhoods and neighbour states are taken from the state before the step;
    /// on dynamic networks each agent moves right after its neighbours are found.
    pub fn step<R: Rng + ?Sized>(
        &self,
        agents: &mut [usize],
        positions: &mut [Position],
        rng: &mut R,
    ) -> Vec<u64> {
        let snapshot = agents.to_vec();
        let position_snapshot = positions.to_vec();
        let mut counts = vec![0u64; self.reactants.len()];
        for i in 0..agents.len() {
            let neighbours = match &self.network {
                Network::Dynamic { range, .. } => {
                    let found = range_neighbours(&position_snapshot, i, *range);
                    positions[i] = update_position(positions[i], self.speed, self.correlatedness, rng);
                    found
                }
                Network::Static(_) => self.network.neighbours(i),
            };
            let neighbour_states: Vec<usize> = neighbours.iter().map(|n| snapshot[*n]).collect();
            agents[i] = self.step_one_agent(agents[i], &neighbour_states, rng);
            counts[agents[i]] += 1;
        }
        counts
    }

    /// One full run from the configured initial state.
    pub fn run(&self, seed: u64) -> Result<AgentRun, SimulationError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut agents: Vec<usize> = self
            .reactants
            .iter()
            .enumerate()
            .flat_map(|(i, r)| {
                std::iter::repeat(i).take(self.initial.get(r).copied().unwrap_or(0) as usize)
            })
            .collect();
        agents.shuffle(&mut rng);

        let (mut positions, mut history, layout) = match &self.network {
            Network::Dynamic { positions, .. } => {
                (positions.clone(), Some(vec![Vec::with_capacity(self.steps); agents.len()]), None)
            }
            Network::Static(_) => (Vec::new(), None, Some(circular_layout(agents.len()))),
        };

        let mut evolution = Evolution::new(&self.reactants);
        let as_f64 = |counts: &[u64]| counts.iter().map(|c| *c as f64).collect::<Vec<_>>();
        let initial: Vec<u64> = self
            .reactants
            .iter()
            .map(|r| self.initial.get(r).copied().unwrap_or(0))
            .collect();
        evolution.record(0.0, &as_f64(&initial));
        for t in 1..=self.steps {
            if let Some(history) = history.as_mut() {
                for (trace, position) in history.iter_mut().zip(&positions) {
                    trace.push(*position);
                }
            }
            let counts = self.step(&mut agents, &mut positions, &mut rng);
            evolution.record(t as f64, &as_f64(&counts));
        }
        debug!(seed, steps = self.steps, agents = agents.len(), "agent run finished");
        Ok(AgentRun {
            evolution,
            positions: history,
            layout,
        })
    }

    /// Counts per reactant (sorted) against the step index.
    pub fn single_run(&self, seed: u64) -> Result<Evolution, SimulationError> {
        Ok(self.run(seed)?.evolution)
    }

    /// Runs `iterations` independently seeded simulations in parallel, on the same
    /// network, returning them in seed order.
    pub fn multirun(
        &self,
        iterations: usize,
        seeds: &Seeds,
    ) -> Result<Vec<Evolution>, SimulationError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let seeds = resolve_seeds(iterations, seeds, &mut rng)?;
        debug!(iterations, "starting agent batch");
        seeds.par_iter().map(|seed| self.single_run(*seed)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkType;

    fn rates(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn map(text: &str, values: &[(&str, f64)]) -> Result<ProbabilityMap, SimulationError> {
        let model = Model::parse(text).unwrap();
        let values: HashMap<String, f64> = rates(values).into_iter().collect();
        ProbabilityMap::build(model.reactants(), model.rules(), &values)
    }

    #[test]
    fn test_flip_timestep() {
        let map = map("A -> B : k\nB -> A : g", &[("k", 1.0), ("g", 3.0)]).unwrap();
        assert_eq!(map.max_outflow("A"), 1.0);
        assert_eq!(map.max_outflow("B"), 3.0);
        assert!((map.timestep() - 1.0 / 3.0).abs() < 1e-12);
        let scaled = map.scaled(map.timestep());
        assert!(scaled.max_outflow("A") <= 1.0 && scaled.max_outflow("B") <= 1.0);
    }

    #[test]
    fn test_both_destinations_claimed() {
        let map = map("A + B -> C + D : k", &[("k", 0.5)]).unwrap();
        let (partner, transitions) = &map.groups("A")[1];
        assert_eq!(*partner, Partner::Reactant("B".to_string()));
        assert_eq!(transitions[0].destination, "C");
        let (partner, transitions) = &map.groups("B")[1];
        assert_eq!(*partner, Partner::Reactant("A".to_string()));
        assert_eq!(transitions[0].destination, "D");
        assert!(map.groups("C")[0].1.is_empty());
    }

    #[test]
    fn test_catalytic_rule() {
        // A stays A, so only B gets a transition
        let map = map("A + B -> A + A : k", &[("k", 1.0)]).unwrap();
        assert_eq!(map.groups("A").len(), 1);
        let (partner, transitions) = &map.groups("B")[1];
        assert_eq!(*partner, Partner::Reactant("A".to_string()));
        assert_eq!(transitions[0].destination, "A");
        assert_eq!(map.max_outflow("B"), 1.0);
    }

    #[test]
    fn test_self_interaction_ignored() {
        let map = map("A + A -> A + B : k", &[("k", 1.0)]).unwrap();
        assert_eq!(map.groups("A").len(), 1);
        assert_eq!(map.max_outflow("A"), 0.0);
        assert_eq!(map.timestep(), 1.0);
    }

    #[test]
    fn test_unsupported_rules() {
        assert!(matches!(
            map("A -> \\emptyset : k", &[("k", 1.0)]),
            Err(SimulationError::Model(ModelError::UnsupportedRule { .. }))
        ));
        assert!(matches!(
            map("A + B + C -> A + A + A : k", &[("k", 1.0)]),
            Err(SimulationError::Model(ModelError::UnsupportedRule { .. }))
        ));
    }

    fn engine(text: &str, network: NetworkType, params: AgentParams) -> AgentEngine {
        let model = Model::parse(text).unwrap();
        AgentEngine::new(&model, AgentParams { network, ..params }).unwrap()
    }

    #[test]
    fn test_flip_stationary_fraction() {
        let params = AgentParams {
            initial_state: [("A".to_string(), 200)].into(),
            max_time: 100.0,
            random_seed: Some(17),
            rates: rates(&[("k", 1.0), ("g", 3.0)]),
            ..Default::default()
        };
        let engine = engine("A -> B : k\nB -> A : g", NetworkType::Full, params);
        let run = engine.single_run(5).unwrap();
        assert_eq!(run.len(), 101);
        for i in 0..run.len() {
            assert_eq!(run.states["A"][i] + run.states["B"][i], 200.0);
        }
        let late = &run.states["A"][20..];
        let mean = late.iter().sum::<f64>() / late.len() as f64;
        assert!((mean - 150.0).abs() < 8.0, "mean {mean}");
    }

    #[test]
    fn test_symmetric_flip_balances() {
        let params = AgentParams {
            initial_state: [("A".to_string(), 200)].into(),
            max_time: 100.0,
            random_seed: Some(23),
            rates: rates(&[("k", 0.5), ("g", 0.5)]),
            ..Default::default()
        };
        let engine = engine("A -> B : k\nB -> A : g", NetworkType::Full, params);
        assert!((engine.timestep() - 2.0).abs() < 1e-12);
        let runs = engine.multirun(4, &Seeds::Auto).unwrap();
        let mean = Evolution::mean(&runs).unwrap();
        let late = &mean.states["A"][20..];
        let average = late.iter().sum::<f64>() / late.len() as f64;
        assert!((average - 100.0).abs() < 5.0, "average {average}");
    }

    #[test]
    fn test_static_run_has_layout() {
        let params = AgentParams {
            initial_state: [("A".to_string(), 10), ("B".to_string(), 10)].into(),
            max_time: 5.0,
            random_seed: Some(1),
            rates: rates(&[("k", 1.0)]),
            ..Default::default()
        };
        let engine = engine("A + B -> A + A : k", NetworkType::BarabasiAlbert, params);
        let run = engine.run(4).unwrap();
        assert!(run.positions.is_none());
        assert_eq!(run.layout.as_ref().map(Vec::len), Some(20));
        // B only ever turns into A
        assert!(run.evolution.states["A"].windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(run, engine.run(4).unwrap());
    }

    #[test]
    fn test_dynamic_run_records_positions() {
        let params = AgentParams {
            initial_state: [("A".to_string(), 5), ("B".to_string(), 5)].into(),
            max_time: 8.0,
            random_seed: Some(3),
            rates: rates(&[("k", 1.0)]),
            net_param: Some(0.3),
            ..Default::default()
        };
        let engine = engine("A + B -> A + A : k", NetworkType::Dynamic, params);
        let run = engine.run(9).unwrap();
        assert!(run.layout.is_none());
        let positions = run.positions.unwrap();
        assert_eq!(positions.len(), 10);
        assert!(positions.iter().all(|trace| trace.len() == 8));
        assert!(positions
            .iter()
            .flatten()
            .all(|(x, y, _)| (0.0..1.0).contains(x) && (0.0..1.0).contains(y)));
    }

    #[test]
    fn test_multirun_matches_single_runs() {
        let params = AgentParams {
            initial_state: [("A".to_string(), 30)].into(),
            max_time: 10.0,
            random_seed: Some(8),
            rates: rates(&[("k", 1.0), ("g", 2.0)]),
            ..Default::default()
        };
        let engine = engine("A -> B : k\nB -> A : g", NetworkType::ErdosRenyi, params);
        let runs = engine.multirun(3, &Seeds::Explicit(vec![1, 2, 3])).unwrap();
        assert_eq!(runs[2], engine.single_run(3).unwrap());
        assert!(engine.multirun(2, &Seeds::Explicit(vec![1])).is_err());
    }
}
