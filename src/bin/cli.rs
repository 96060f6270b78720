use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mumot::agents::AgentEngine;
use mumot::model::odes_as_equations;
use mumot::network::NetworkType;
use mumot::params::{AgentParams, RunDescriptor, Seeds, SsaParams};
use mumot::ssa::{Evolution, SsaEngine};
use mumot::Model;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use tracing::Level;

#[derive(Parser)]
#[command(name = "mumot-cli")]
#[command(about = "Derive and simulate stochastic population models from transition rules")]
#[command(version)]
struct Args {
    /// File with one rule per line (a JSON run descriptor for `replay`)
    file: PathBuf,
    /// Comma separated assignments applied to the model, e.g. "B = N - A"
    #[arg(long)]
    substitute: Option<String>,
    /// Log derivation stages and runs to stderr
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mean-field equations from the rules and from the expansion
    Odes,
    /// Stoichiometry records
    Stoichiometry,
    /// Master equation
    Master,
    /// van Kampen expansion
    Vke,
    /// Linear Fokker-Planck equation of the noise
    Fpe,
    /// Noise moment equations and their stationary solution
    Noise,
    /// Gillespie simulation, printed as JSON
    Ssa {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Agent-based simulation, printed as JSON
    Agents {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, default_value = "full")]
        network: NetworkType,
        /// Link probability, edges per node or communication range
        #[arg(long)]
        net_param: Option<f64>,
    },
    /// Replays a stored run descriptor
    Replay,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Rate values, e.g. "k=1,g=0.5"
    #[arg(long)]
    rates: String,
    /// Initial populations, e.g. "A=90,B=10"
    #[arg(long)]
    initial: Option<String>,
    #[arg(long, default_value_t = 10.0)]
    max_time: f64,
    #[arg(long)]
    seed: Option<u64>,
    /// Number of runs; more than one prints their mean
    #[arg(long, default_value_t = 1)]
    runs: usize,
}

fn parse_assignments<T: std::str::FromStr>(text: &str) -> anyhow::Result<BTreeMap<String, T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    text.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let Some((name, value)) = part.split_once('=') else {
                bail!("expected name=value, got '{part}'");
            };
            let value = value
                .trim()
                .parse()
                .with_context(|| format!("invalid value in '{part}'"))?;
            Ok((name.trim().to_string(), value))
        })
        .collect()
}

fn to_json(runs: Vec<Evolution>) -> anyhow::Result<String> {
    let evolution = if runs.len() == 1 {
        runs.into_iter().next()
    } else {
        Evolution::mean(&runs)
    };
    Ok(serde_json::to_string_pretty(&evolution)?)
}

fn run(args: &Args) -> anyhow::Result<String> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("cannot read {}", args.file.display()))?;
    if let Command::Replay = args.command {
        let descriptor = RunDescriptor::from_json(&text)?;
        return Ok(serde_json::to_string_pretty(&descriptor.execute()?)?);
    }
    let mut model = Model::parse(&text)?;
    if let Some(assignments) = &args.substitute {
        model = model.substitute(assignments)?;
    }
    run_model(&model, &args.command)
}

fn run_model(model: &Model, command: &Command) -> anyhow::Result<String> {
    let output = match command {
        Command::Odes => {
            let mut out = model.to_string();
            out.push_str("From the expansion\n");
            for (reactant, ode) in odes_as_equations(model.odes_vke()?) {
                out.push_str(&format!("    d{reactant}/dt = {ode}\n"));
            }
            out
        }
        Command::Stoichiometry => model.stoichiometry().to_string(),
        Command::Master => model.master_equation()?.to_string(),
        Command::Vke => model.van_kampen()?.to_string(),
        Command::Fpe => model.fokker_planck()?.to_string(),
        Command::Noise => format!("{}\n{}", model.noise_eom()?, model.noise_stationary()?),
        Command::Ssa { run } => {
            let params = SsaParams {
                initial_state: parse_assignments(run.initial.as_deref().unwrap_or(""))?,
                max_time: run.max_time,
                random_seed: run.seed,
                rates: parse_assignments(&run.rates)?,
            };
            let engine = SsaEngine::new(model, params)?;
            to_json(engine.multirun(run.runs, &Seeds::Auto)?)?
        }
        Command::Agents {
            run,
            network,
            net_param,
        } => {
            let params = AgentParams {
                initial_state: parse_assignments(run.initial.as_deref().unwrap_or(""))?,
                max_time: run.max_time,
                random_seed: run.seed,
                rates: parse_assignments(&run.rates)?,
                network: *network,
                net_param: *net_param,
                ..Default::default()
            };
            let engine = AgentEngine::new(model, params)?;
            to_json(engine.multirun(run.runs, &Seeds::Auto)?)?
        }
        Command::Replay => bail!("replay expects a run descriptor"),
    };
    Ok(output)
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    }
}
