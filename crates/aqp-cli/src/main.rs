//! aqp CLI: validate, explain and dry-run approximate query plans.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aqp_core::config::AqpConfig;
use aqp_core::connection::{ConnectionError, DbmsConnection};
use aqp_core::sql::{AnsiSyntax, HiveSyntax, SqlSyntax};
use aqp_core::types::QueryResult;
use aqp_exec::{CancelHandle, Engine};
use aqp_planner::{parse_plan_request, BlockConversion, PlanRequest};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aqp")]
#[command(about = "Approximate query plans: build, compress, and run progressively", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a plan request parses and its query can be planned
    Validate {
        /// Path to the plan request YAML file
        #[arg(short, long)]
        request: PathBuf,
    },

    /// Show the execution plan for a request (EXPLAIN)
    Explain {
        /// Path to the plan request YAML file
        #[arg(short, long)]
        request: PathBuf,

        /// Skip the compression pass
        #[arg(long)]
        no_compress: bool,

        /// Skip progressive conversion
        #[arg(long)]
        no_progressive: bool,

        /// Render SQL with Hive quoting
        #[arg(long)]
        hive: bool,
    },

    /// Execute a request; statements are printed instead of sent anywhere
    Run {
        /// Path to the plan request YAML file
        #[arg(short, long)]
        request: PathBuf,

        /// Print statements and return empty results
        #[arg(long)]
        dry_run: bool,

        /// Maximum nodes running at once (overrides config)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Scratch schema (overrides config and request)
        #[arg(long)]
        scratch_schema: Option<String>,

        /// Keep scratch tables after the run
        #[arg(long)]
        keep_scratch: bool,

        /// Skip the compression pass
        #[arg(long)]
        no_compress: bool,

        /// Skip progressive conversion
        #[arg(long)]
        no_progressive: bool,

        /// Render SQL with Hive quoting
        #[arg(long)]
        hive: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { request } => {
            if let Err(e) = validate_request(&request) {
                eprintln!("Validation failed: {}", e);
                std::process::exit(1);
            }
            println!("✓ Request is valid");
        }
        Commands::Explain {
            request,
            no_compress,
            no_progressive,
            hive,
        } => {
            let mut config = AqpConfig::from_env();
            config.compress &= !no_compress;
            config.progressive &= !no_progressive;
            if let Err(e) = explain_request(&request, &config, syntax(hive).as_ref()) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Run {
            request,
            dry_run,
            max_parallel,
            scratch_schema,
            keep_scratch,
            no_compress,
            no_progressive,
            hive,
        } => {
            let mut config = AqpConfig::from_env();
            config.compress &= !no_compress;
            config.progressive &= !no_progressive;
            config.cleanup_scratch &= !keep_scratch;
            if let Some(parallel) = max_parallel {
                config.max_parallel_nodes = parallel;
            }
            if let Err(e) = run_request(&request, config, scratch_schema, dry_run, hive) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn syntax(hive: bool) -> Box<dyn SqlSyntax> {
    if hive {
        Box::new(HiveSyntax)
    } else {
        Box::new(AnsiSyntax)
    }
}

fn load_request(path: &Path) -> Result<PlanRequest, Box<dyn std::error::Error>> {
    let yaml_content = fs::read_to_string(path)?;
    Ok(parse_plan_request(&yaml_content)?)
}

fn validate_request(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let request = load_request(path)?;
    aqp_planner::builder::validate(&request.query)?;
    Ok(())
}

fn explain_request(
    path: &Path,
    config: &AqpConfig,
    syntax: &dyn SqlSyntax,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = load_request(path)?;
    let prepared = request.prepare(config)?;

    println!("{}", prepared.plan.explain(syntax)?);
    if let Some(report) = &prepared.compression {
        println!(
            "Compression: {} merged, {} left unmerged",
            report.merged_count(),
            report.violations.len()
        );
        for (node, parent) in &report.merged {
            println!("  {} -> {}", node, parent);
        }
    }
    for conversion in &prepared.conversions {
        match conversion {
            BlockConversion::Converted {
                node,
                table,
                blocks,
                absorbed,
            } => println!(
                "Progressive: {} over {} ({} blocks, absorbed {})",
                node,
                table,
                blocks,
                absorbed.len()
            ),
            BlockConversion::NotConverted { root, reason } => {
                println!("Not progressive: {} ({:?})", root, reason)
            }
        }
    }
    Ok(())
}

fn run_request(
    path: &Path,
    mut config: AqpConfig,
    scratch_schema: Option<String>,
    dry_run: bool,
    hive: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !dry_run {
        return Err("no backend connector is built into this binary; pass --dry-run".into());
    }
    let request = load_request(path)?;
    config.scratch_schema = match scratch_schema {
        Some(schema) => schema,
        None => request.scratch_schema(&config).to_string(),
    };
    let prepared = request.prepare(&config)?;

    let connection: Arc<dyn DbmsConnection> = Arc::new(DryRunConnection {
        syntax: syntax(hive),
    });
    let engine = Engine::new(config, connection);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let outcome = runtime.block_on(engine.run(&prepared.plan, &CancelHandle::new(), Some(tx)))?;

    while let Ok(update) = rx.try_recv() {
        println!(
            "  progress {}: {}/{} blocks",
            update.node, update.blocks_processed, update.total_blocks
        );
    }
    print_result(&outcome.result);

    let manifest = &outcome.manifest;
    println!("✓ Plan executed successfully");
    println!("  Duration: {}ms", manifest.elapsed_ms());
    println!("  Plan hash: {}", manifest.plan_hash);
    println!(
        "  Nodes: {} completed of {} ({} progressive)",
        manifest.nodes_completed, manifest.nodes_scheduled, manifest.progressive_nodes
    );
    println!("  Scratch tables dropped: {}", manifest.scratch_tables_dropped);
    Ok(())
}

fn print_result(result: &QueryResult) {
    if result.columns.is_empty() {
        return;
    }
    println!("{}", result.columns.join("\t"));
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join("\t"));
    }
}

/// Prints every statement and answers with an empty result.
struct DryRunConnection {
    syntax: Box<dyn SqlSyntax>,
}

impl DbmsConnection for DryRunConnection {
    fn execute(&self, sql: &str) -> Result<QueryResult, ConnectionError> {
        tracing::debug!(dialect = self.syntax.name(), "dry-run statement");
        println!("{};", sql);
        Ok(QueryResult::empty())
    }

    fn syntax(&self) -> &dyn SqlSyntax {
        self.syntax.as_ref()
    }
}
