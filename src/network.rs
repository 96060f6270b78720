//! Interaction networks of the agent-based engine.
//!
//! Static networks are undirected petgraph graphs. Dynamic networks are agents moving
//! on the unit torus and interacting with everyone closer than a communication range.

use crate::errors::SimulationError;
use crate::params::draw_seed;
use petgraph::algo::connected_components;
use petgraph::graph::{NodeIndex, UnGraph};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Erdos-Renyi graphs are resampled at most this many times to find a connected one.
pub const MAX_RESAMPLES: usize = 10_000;

/// Position `(x, y, orientation)` of a moving agent.
pub type Position = (f64, f64, f64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkType {
    /// Everyone interacts with everyone
    #[default]
    Full,
    ErdosRenyi,
    BarabasiAlbert,
    /// Moving agents on the torus
    Dynamic,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Full => "full",
            NetworkType::ErdosRenyi => "erdos-renyi",
            NetworkType::BarabasiAlbert => "barabasi-albert",
            NetworkType::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(NetworkType::Full),
            "erdos-renyi" => Ok(NetworkType::ErdosRenyi),
            "barabasi-albert" => Ok(NetworkType::BarabasiAlbert),
            "dynamic" => Ok(NetworkType::Dynamic),
            other => Err(SimulationError::ParameterRange(format!(
                "unknown network type '{other}'"
            ))),
        }
    }
}

/// A generated network.
#[derive(Debug, Clone)]
pub enum Network {
    Static(UnGraph<(), ()>),
    Dynamic { range: f64, positions: Vec<Position> },
}

impl Network {
    /// Generates a network of `n` nodes.
    ///
    /// `param` is the link probability (Erdos-Renyi), the number of edges of every new
    /// node (Barabasi-Albert, truncated to an integer) or the communication range
    /// (dynamic).
    ///
    /// # Errors
    /// `SimulationError::ParameterRange` for a parameter outside its range, or if no
    /// connected Erdos-Renyi graph is found.
    pub fn build<R: Rng + ?Sized>(
        kind: NetworkType,
        n: usize,
        param: Option<f64>,
        rng: &mut R,
    ) -> Result<Network, SimulationError> {
        let network = match kind {
            NetworkType::Full => Network::Static(complete_graph(n)),
            NetworkType::ErdosRenyi => {
                Network::Static(erdos_renyi(n, param.unwrap_or(0.5), rng)?)
            }
            NetworkType::BarabasiAlbert => {
                let m = param.unwrap_or_else(|| n.saturating_sub(1).min(3) as f64);
                Network::Static(barabasi_albert(n, m, rng)?)
            }
            NetworkType::Dynamic => {
                let range = param.unwrap_or(0.1);
                if !(0.0..=1.0).contains(&range) {
                    return Err(SimulationError::ParameterRange(format!(
                        "communication range {range} outside [0, 1]"
                    )));
                }
                let positions = (0..n)
                    .map(|_| (rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>() * TAU))
                    .collect();
                Network::Dynamic { range, positions }
            }
        };
        match &network {
            Network::Static(graph) => {
                info!(%kind, nodes = graph.node_count(), edges = graph.edge_count(), "network generated")
            }
            Network::Dynamic { range, .. } => {
                info!(%kind, nodes = n, range, "network generated")
            }
        }
        Ok(network)
    }

    /// Neighbours of node `i` in a static network; empty for dynamic ones.
    pub fn neighbours(&self, i: usize) -> Vec<usize> {
        match self {
            Network::Static(graph) => graph
                .neighbors(NodeIndex::new(i))
                .map(|node| node.index())
                .collect(),
            Network::Dynamic { .. } => Vec::new(),
        }
    }
}

fn complete_graph(n: usize) -> UnGraph<(), ()> {
    let mut graph = UnGraph::with_capacity(n, n * n.saturating_sub(1) / 2);
    let nodes: Vec<NodeIndex> = (0..n).map(|_| graph.add_node(())).collect();
    for i in 0..n {
        for j in i + 1..n {
            graph.add_edge(nodes[i], nodes[j], ());
        }
    }
    graph
}

fn erdos_renyi<R: Rng + ?Sized>(
    n: usize,
    p: f64,
    rng: &mut R,
) -> Result<UnGraph<(), ()>, SimulationError> {
    if p <= 0.0 || p > 1.0 {
        return Err(SimulationError::ParameterRange(format!(
            "link probability {p} outside (0, 1]"
        )));
    }
    for attempt in 0..=MAX_RESAMPLES {
        let seed = draw_seed(rng);
        let mut sample_rng = ChaCha8Rng::seed_from_u64(seed);
        let mut graph = UnGraph::with_capacity(n, 0);
        let nodes: Vec<NodeIndex> = (0..n).map(|_| graph.add_node(())).collect();
        for i in 0..n {
            for j in i + 1..n {
                if sample_rng.gen::<f64>() < p {
                    graph.add_edge(nodes[i], nodes[j], ());
                }
            }
        }
        if connected_components(&graph) <= 1 {
            return Ok(graph);
        }
        warn!(attempt, seed, "Erdos-Renyi graph is not connected, resampling");
    }
    Err(SimulationError::ParameterRange(format!(
        "no connected Erdos-Renyi graph with n = {n}, p = {p} after {MAX_RESAMPLES} resamples"
    )))
}

fn barabasi_albert<R: Rng + ?Sized>(
    n: usize,
    m: f64,
    rng: &mut R,
) -> Result<UnGraph<(), ()>, SimulationError> {
    let m = m.trunc();
    if m < 1.0 || m > n as f64 {
        return Err(SimulationError::ParameterRange(format!(
            "edges per node {m} outside [1, {n}]"
        )));
    }
    let m = m as usize;
    let mut graph = UnGraph::with_capacity(n, (n - m) * m);
    let nodes: Vec<NodeIndex> = (0..n).map(|_| graph.add_node(())).collect();

    // every node appears once per incident edge, so picks are degree-weighted
    let mut targets: Vec<usize> = (0..m).collect();
    let mut repeated: Vec<usize> = Vec::with_capacity(2 * (n - m) * m);
    for source in m..n {
        for &target in &targets {
            graph.add_edge(nodes[source], nodes[target], ());
        }
        repeated.extend(&targets);
        repeated.extend(std::iter::repeat(source).take(m));

        targets.clear();
        while targets.len() < m {
            let pick = repeated[rng.gen_range(0..repeated.len())];
            if !targets.contains(&pick) {
                targets.push(pick);
            }
        }
    }
    Ok(graph)
}

/// Shortest distance between two points of the unit torus.
pub fn torus_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let dx = (a.0 - b.0).abs();
    let dy = (a.1 - b.1).abs();
    dx.min(1.0 - dx).hypot(dy.min(1.0 - dy))
}

/// Agents closer than `range` to agent `i`, excluding `i` itself.
pub fn range_neighbours(positions: &[Position], i: usize, range: f64) -> Vec<usize> {
    let (x, y, _) = positions[i];
    positions
        .iter()
        .enumerate()
        .filter(|(j, p)| *j != i && torus_distance((x, y), (p.0, p.1)) < range)
        .map(|(j, _)| j)
        .collect()
}

/// One correlated random walk step on the unit torus.
///
/// The move mixes a uniformly oriented step with the current heading, weighted by
/// `correlatedness`; the heading becomes the direction of the move.
pub fn update_position<R: Rng + ?Sized>(
    position: Position,
    speed: f64,
    correlatedness: f64,
    rng: &mut R,
) -> Position {
    let (x, y, o) = position;
    let random_o = rng.gen::<f64>() * TAU;
    let move_x = speed * random_o.cos() * (1.0 - correlatedness) + speed * o.cos() * correlatedness;
    let move_y = speed * random_o.sin() * (1.0 - correlatedness) + speed * o.sin() * correlatedness;
    (
        (x + move_x).rem_euclid(1.0),
        (y + move_y).rem_euclid(1.0),
        move_y.atan2(move_x),
    )
}

/// Nodes evenly spaced on the unit circle, for drawing static networks.
pub fn circular_layout(n: usize) -> Vec<(f64, f64)> {
    if n == 1 {
        return vec![(0.0, 0.0)];
    }
    (0..n)
        .map(|i| {
            let angle = TAU * i as f64 / n as f64;
            (angle.cos(), angle.sin())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(2024)
    }

    #[test]
    fn test_parse_display() {
        for kind in [
            NetworkType::Full,
            NetworkType::ErdosRenyi,
            NetworkType::BarabasiAlbert,
            NetworkType::Dynamic,
        ] {
            assert_eq!(kind.to_string().parse::<NetworkType>().unwrap(), kind);
        }
        assert!("ring".parse::<NetworkType>().is_err());
    }

    #[test]
    fn test_full() {
        let network = Network::build(NetworkType::Full, 5, None, &mut rng()).unwrap();
        let mut neighbours = network.neighbours(2);
        neighbours.sort();
        assert_eq!(neighbours, vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_erdos_renyi_connected() {
        let Network::Static(graph) =
            Network::build(NetworkType::ErdosRenyi, 20, Some(0.3), &mut rng()).unwrap()
        else {
            panic!("expected a static network");
        };
        assert_eq!(graph.node_count(), 20);
        assert_eq!(connected_components(&graph), 1);
        assert!(Network::build(NetworkType::ErdosRenyi, 20, Some(1.5), &mut rng()).is_err());
    }

    #[test]
    fn test_barabasi_albert_edges() {
        let Network::Static(graph) =
            Network::build(NetworkType::BarabasiAlbert, 30, Some(3.7), &mut rng()).unwrap()
        else {
            panic!("expected a static network");
        };
        assert_eq!(graph.edge_count(), (30 - 3) * 3);
        assert!(Network::build(NetworkType::BarabasiAlbert, 5, Some(6.0), &mut rng()).is_err());
        assert!(Network::build(NetworkType::BarabasiAlbert, 5, Some(0.5), &mut rng()).is_err());
    }

    #[test]
    fn test_dynamic_positions() {
        let mut rng = rng();
        let Network::Dynamic { range, positions } =
            Network::build(NetworkType::Dynamic, 50, None, &mut rng).unwrap()
        else {
            panic!("expected a dynamic network");
        };
        assert_eq!(range, 0.1);
        let mut positions = positions;
        for _ in 0..200 {
            for p in positions.iter_mut() {
                *p = update_position(*p, 0.1, 0.5, &mut rng);
                assert!((0.0..1.0).contains(&p.0) && (0.0..1.0).contains(&p.1));
            }
        }
    }

    #[test]
    fn test_torus_distance_wraps() {
        assert!((torus_distance((0.05, 0.5), (0.95, 0.5)) - 0.1).abs() < 1e-12);
        let positions = vec![(0.01, 0.01, 0.0), (0.99, 0.99, 0.0), (0.5, 0.5, 0.0)];
        assert_eq!(range_neighbours(&positions, 0, 0.1), vec![1]);
        assert!(range_neighbours(&positions, 2, 0.1).is_empty());
    }

    #[test]
    fn test_fully_correlated_motion_keeps_heading() {
        let (x, y, o) = update_position((0.5, 0.5, 0.0), 0.1, 1.0, &mut rng());
        assert!((x - 0.6).abs() < 1e-12);
        assert!((y - 0.5).abs() < 1e-12);
        assert!(o.abs() < 1e-12);
    }

    #[test]
    fn test_circular_layout() {
        assert_eq!(circular_layout(1), vec![(0.0, 0.0)]);
        let layout = circular_layout(4);
        assert!((layout[1].0).abs() < 1e-12 && (layout[1].1 - 1.0).abs() < 1e-12);
    }
}
