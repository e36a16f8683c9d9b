//! Hosts one built-in environment for a `VecEnvPool`.
//!
//! Frames are exchanged over stdin/stdout; diagnostics go to stderr.

use clap::{Parser, ValueEnum};
use log::{error, info};

use pallas::env::{make_env, ActionKind, EnvSpec};
use pallas::vec_env::serve_stdio;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EnvKind {
    Counter,
    MultiCounter,
}

#[derive(Parser, Debug)]
#[command(name = "pallas-worker", about = "Environment worker for a pallas VecEnvPool")]
struct Args {
    #[arg(long, value_enum, default_value = "counter")]
    env: EnvKind,

    #[arg(long, default_value_t = 10)]
    episode_length: usize,

    /// Number of agents of the multi-counter environment
    #[arg(long, default_value_t = 2)]
    agents: usize,

    /// Discrete action space with this many actions; continuous when omitted
    #[arg(long)]
    discrete: Option<usize>,

    /// Log debug messages to stderr; otherwise `RUST_LOG` decides, defaulting to warnings
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn spec(&self) -> EnvSpec {
        let action = match self.discrete {
            Some(n) => ActionKind::Discrete { n },
            None => ActionKind::Continuous,
        };
        match self.env {
            EnvKind::Counter => EnvSpec::Counter {
                episode_length: self.episode_length,
                action,
            },
            EnvKind::MultiCounter => EnvSpec::MultiCounter {
                n_agents: self.agents,
                episode_length: self.episode_length,
                action,
            },
        }
    }
}

fn main() {
    let args = Args::parse();
    let filter = if args.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let spec = args.spec();
    info!("hosting {:?}", spec);
    let result = make_env(&spec).and_then(|mut env| serve_stdio(&mut env));
    if let Err(e) = result {
        error!("worker failed: {}", e);
        std::process::exit(1);
    }
}
