//! Command-line front end for `game-query`.
//!
//! Registers the servers given on the command line (or in a JSON file),
//! runs one batch and prints the id-keyed results as JSON.

use anyhow::{bail, Context, Result};
use clap::Parser;
use game_query::{AddressPolicy, FilterParams, GameQuery, QueryOptions, ServerSpec};
use std::fs;
use std::path::PathBuf;

/// Query game servers for their current status.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Server type, e.g. source, quake3, ts3.
    #[arg(short = 't', long = "type")]
    kind: Option<String>,

    /// Server address as host[:port].
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Key for this server in the output (defaults to the host).
    #[arg(long)]
    id: Option<String>,

    /// JSON file holding a list of server specs.
    #[arg(long)]
    servers: Option<PathBuf>,

    /// Listen budget per phase, in seconds.
    #[arg(long, default_value_t = game_query::config::DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Filter to apply, in order. May be repeated.
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// Skip all filters.
    #[arg(long)]
    raw: bool,

    /// Verbose logging and decoder errors in the output.
    #[arg(long)]
    debug: bool,

    /// Accept loopback and private address literals.
    #[arg(long)]
    allow_private: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut gq = GameQuery::new();
    if cli.allow_private {
        gq.set_address_policy(AddressPolicy::Any);
    }
    gq.set_options(QueryOptions {
        debug: cli.debug,
        raw: cli.raw,
        timeout: cli.timeout,
        ..QueryOptions::default()
    });

    if let Some(path) = &cli.servers {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let specs: Vec<ServerSpec> = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        gq.add_servers(specs)?;
    }

    match (cli.kind, cli.host) {
        (Some(kind), Some(host)) => {
            let mut spec = ServerSpec::new(kind, host);
            spec.id = cli.id;
            gq.add_server(spec)?;
        }
        (None, None) => {}
        _ => bail!("--type and --host must be given together"),
    }

    if gq.server_ids().next().is_none() {
        bail!("no servers given; use --type/--host or --servers");
    }

    for name in &cli.filters {
        gq.add_filter(name, &FilterParams::new())?;
    }

    let results = gq.process();
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
