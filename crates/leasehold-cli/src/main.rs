//! Leasehold CLI.
//!
//! Runs a controller, a broker and a site authority in one process, lets
//! the controller demand some reservations, drives a number of cycles and
//! prints the controller's reservation table.
//!
//! # Configuration
//!
//! Loaded with priority:
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables (`LEASEHOLD_*`)
//! 3. Project config (`.leasehold/config.toml` in the project root)
//! 4. Global config (`~/.leasehold/config.toml`)
//! 5. Default values (lowest priority)
//!
//! `[policy.inventory]` is shared by the broker and the site. When it is
//! empty the site offers ten units of the requested type.

mod trio;

use anyhow::Result;
use clap::Parser;
use leasehold_runtime::config::{
    default_config_path, save_global_config, ConfigLoader, ConfigResolver, LeaseholdConfig,
    StoreKind,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use trio::{render_table, Demand, Trio};

const DEFAULT_INVENTORY: u32 = 10;

/// Leasehold demo runner
#[derive(Parser, Debug)]
#[command(name = "leasehold")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable info logging
    #[arg(short, long)]
    verbose: bool,

    /// Project root directory (defaults to current directory)
    #[arg(short = 'C', long)]
    project: Option<PathBuf>,

    /// Ignore ~/.leasehold/config.toml
    #[arg(long)]
    no_global_config: bool,

    /// Cycles to run before printing
    #[arg(short = 'n', long, default_value_t = 8)]
    cycles: u64,

    /// Cycle length (also: LEASEHOLD_CYCLE_MILLIS)
    #[arg(long, value_name = "MS")]
    cycle_millis: Option<u64>,

    /// Drive cycles from the wall clock instead of stepping them
    #[arg(long)]
    realtime: bool,

    /// Reservations to demand
    #[arg(short = 'r', long, default_value_t = 1)]
    reservations: u32,

    /// Units per reservation
    #[arg(short = 'u', long, default_value_t = 2)]
    units: u32,

    /// Resource type to reserve
    #[arg(long, default_value = "vm")]
    rtype: String,

    /// Requested lease length
    #[arg(long, default_value_t = 3600)]
    lease_secs: i64,

    /// Persist every actor under DIR/<actor> (also: LEASEHOLD_DATA_DIR)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Print the table as JSON records
    #[arg(long)]
    json: bool,

    /// Print the resolved configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Write the resolved configuration to ~/.leasehold/config.toml and exit
    #[arg(long)]
    save_config: bool,
}

/// Command-line overrides, applied after every file and env layer.
struct CliConfigResolver {
    debug: bool,
    cycle_millis: Option<u64>,
    data_dir: Option<PathBuf>,
    rtype: String,
}

impl CliConfigResolver {
    fn from_args(args: &Args) -> Self {
        Self {
            debug: args.debug,
            cycle_millis: args.cycle_millis,
            data_dir: args.data_dir.clone(),
            rtype: args.rtype.clone(),
        }
    }
}

impl ConfigResolver for CliConfigResolver {
    fn apply(&self, config: &mut LeaseholdConfig) {
        if self.debug {
            config.debug = true;
        }
        if let Some(ms) = self.cycle_millis {
            config.actor.cycle_millis = ms;
        }
        if let Some(ref dir) = self.data_dir {
            config.store.kind = StoreKind::File;
            config.store.data_dir = Some(dir.clone());
        }
        if config.policy.inventory.is_empty() {
            config
                .policy
                .inventory
                .insert(self.rtype.clone(), DEFAULT_INVENTORY);
        }
    }
}

fn load_config(args: &Args) -> Result<LeaseholdConfig> {
    let project_root = match &args.project {
        Some(p) => p.clone(),
        None => std::env::current_dir()?,
    };
    let mut loader = ConfigLoader::new().with_project_root(project_root);
    if args.no_global_config {
        loader = loader.skip_global_config();
    }
    let mut config = loader
        .load()
        .map_err(|e| anyhow::anyhow!("Config error: {e}"))?;
    CliConfigResolver::from_args(args).apply(&mut config);
    Ok(config)
}

/// `--debug` > `--verbose` > `RUST_LOG` > `warn`. Logs go to stderr so the
/// table on stdout stays parseable.
fn init_tracing(debug: bool, verbose: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else if verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(config.debug, args.verbose);

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    if args.save_config {
        save_global_config(&config)?;
        println!("saved {}", default_config_path().display());
        return Ok(());
    }

    let trio = Trio::start(&config, args.realtime)?;
    let demand = Demand {
        count: args.reservations,
        units: args.units,
        rtype: args.rtype.clone(),
        length: chrono::Duration::seconds(args.lease_secs),
    };
    let ids = trio.request(demand).await?;
    info!("demanded {} reservations", ids.len());

    trio.run(args.cycles, config.actor.cycle_millis, args.realtime)
        .await?;
    let records = trio.reservations().await?;
    trio.shutdown().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print!("{}", render_table(&records));
    }
    Ok(())
}
