//! flwor CLI: run, validate and explain YAML query documents.

use clap::{Parser, Subcommand};
use flwor_core::config::EngineConfig;
use flwor_exec::Engine;
use flwor_planner::parse_yaml_query;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flwor")]
#[command(about = "FLWOR query optimizer and evaluator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Settings that override the environment and the query document.
#[derive(clap::Args, Debug, Default, Clone)]
struct Overrides {
    /// Compile only; skip the FLWOR rewrite rules
    #[arg(long)]
    no_optimize: bool,

    /// Fixed-point round cap per FLWOR expression
    #[arg(long)]
    max_rounds: Option<usize>,

    /// Execution deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Maximum number of produced items
    #[arg(long)]
    item_limit: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a query and print its items
    Run {
        /// Path to the query YAML file
        #[arg(short, long)]
        query: PathBuf,

        /// Print the result as a JSON array
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Load and compile a query without running it
    Validate {
        /// Path to the query YAML file
        #[arg(short, long)]
        query: PathBuf,
    },

    /// Show the original and optimized plan with the applied rewrites
    Explain {
        /// Path to the query YAML file
        #[arg(short, long)]
        query: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            query,
            json,
            overrides,
        } => {
            if let Err(e) = run_query(&query, json, &overrides) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Validate { query } => {
            if let Err(e) = validate_query(&query) {
                eprintln!("Validation failed: {}", e);
                std::process::exit(1);
            }
            println!("✓ Query is valid");
        }
        Commands::Explain { query, overrides } => {
            if let Err(e) = explain_query(&query, &overrides) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Environment first, then the document's `config:` section, then flags.
fn effective_config(doc: Option<&EngineConfig>, overrides: &Overrides) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    apply_query_config(&mut config, doc);
    if overrides.no_optimize {
        config.optimize = false;
    }
    if let Some(rounds) = overrides.max_rounds {
        config.max_optimizer_rounds = rounds;
    }
    if let Some(ms) = overrides.timeout_ms {
        config.timeout_ms = Some(ms);
    }
    if let Some(limit) = overrides.item_limit {
        config.item_limit = Some(limit);
    }
    config
}

fn apply_query_config(cfg: &mut EngineConfig, doc: Option<&EngineConfig>) {
    if let Some(doc) = doc {
        *cfg = doc.clone();
    }
}

fn run_query(
    query_path: &PathBuf,
    json: bool,
    overrides: &Overrides,
) -> Result<(), Box<dyn std::error::Error>> {
    let yaml_content = fs::read_to_string(query_path)?;
    let parsed = parse_yaml_query(&yaml_content)?;
    let config = effective_config(parsed.config.as_ref(), overrides);

    let engine = Engine::new(config)?;
    let prepared = engine.prepare(parsed)?;
    tracing::info!(fingerprint = %prepared.fingerprint.short(), "running query");

    let mut stream = engine.execute(&prepared);
    let mut items = Vec::new();
    for item in stream.by_ref() {
        let item = item?;
        if json {
            items.push(item);
        } else {
            println!("{}", item);
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    }
    for update in stream.updates() {
        eprintln!("pending update: {} := {}", update.name, update.value);
    }
    Ok(())
}

fn validate_query(query_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let yaml_content = fs::read_to_string(query_path)?;
    let parsed = parse_yaml_query(&yaml_content)?;
    let config = effective_config(parsed.config.as_ref(), &Overrides::default());
    Engine::new(config)?.prepare(parsed)?;
    Ok(())
}

fn explain_query(
    query_path: &PathBuf,
    overrides: &Overrides,
) -> Result<(), Box<dyn std::error::Error>> {
    let yaml_content = fs::read_to_string(query_path)?;
    let parsed = parse_yaml_query(&yaml_content)?;
    let mut config = effective_config(parsed.config.as_ref(), overrides);
    config.collect_diagnostics = true;

    let engine = Engine::new(config)?;
    let prepared = engine.prepare(parsed)?;

    println!("Query Plan");
    println!("==========");
    println!();
    println!("Original:");
    println!("  {}", prepared.original_plan());
    println!();
    println!("Optimized:");
    println!("  {}", prepared.plan());
    println!();
    match prepared.size {
        Some(n) => println!("Static size: {} items", n),
        None => println!("Static size: unknown"),
    }
    println!(
        "Return in tail position: {}",
        if prepared.tail_call_eligible() { "yes" } else { "no" }
    );
    println!("Fingerprint: {}", prepared.fingerprint);
    println!();
    println!("Rewrites ({}):", prepared.diagnostics.len());
    for (i, d) in prepared.diagnostics.iter().enumerate() {
        println!("  {}. {:?}: {}", i + 1, d.rewrite, d.detail);
    }

    Ok(())
}
