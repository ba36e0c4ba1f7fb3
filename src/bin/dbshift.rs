//! dbshift: the migration toolkit CLI
//!
//! # Usage
//!
//! ```bash
//! # Convert a Teradata script
//! dbshift convert proc.sql --output proc.db2.sql
//!
//! # Pair the tables of two schemas
//! dbshift discover --source-url postgres://u:p@src/db --target-url postgres://u:p@dst/db \
//!     --source-schema sales --target-schema sales
//!
//! # Reconcile one table
//! dbshift validate --source-url ... --target-url ... --source-schema sales \
//!     --target-schema sales --table orders --keys order_id
//!
//! # Serve the HTTP API
//! dbshift serve --bind 0.0.0.0:5001
//! ```

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use colored::*;
use dbshift::prelude::*;
use dbshift::config::AppConfigBuilder;
use dbshift::server::Server;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbshift")]
#[command(version)]
#[command(about = "Teradata to DB2 SQL conversion and data validation", long_about = None)]
#[command(after_help = "EXAMPLES:
    dbshift convert proc.sql
    cat query.sql | dbshift convert - --json
    dbshift validate --source-url sqlite://a.db --target-url sqlite://b.db \\
        --source-schema main --target-schema main --table orders --keys id")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "DBSHIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to listen on
        #[arg(long, env = "DBSHIFT_BIND")]
        bind: Option<String>,

        /// Persist runs under this directory
        #[arg(long, env = "DBSHIFT_RUNS_DIR")]
        runs_dir: Option<PathBuf>,

        /// Tables reconciled at the same time within one run
        #[arg(long, env = "DBSHIFT_MAX_CONCURRENT_TABLES")]
        max_concurrent_tables: Option<usize>,
    },
    /// Convert Teradata SQL to DB2
    Convert {
        /// Input file, or `-` for stdin
        input: String,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        /// Write converted SQL to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep `;` after procedure definitions instead of `@`
        #[arg(long)]
        no_terminator: bool,
    },
    /// Print the built-in sample Teradata procedure
    Sample,
    /// Match the tables of two schemas
    Discover {
        #[command(flatten)]
        endpoints: Endpoints,

        /// Print the match as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reconcile tables between source and target
    Validate {
        #[command(flatten)]
        endpoints: Endpoints,

        /// Table name on both sides
        #[arg(long, conflicts_with = "all")]
        table: Option<String>,

        /// Source table, when named differently from the target
        #[arg(long, requires = "target_table", conflicts_with_all = ["table", "all"])]
        source_table: Option<String>,

        /// Target table, when named differently from the source
        #[arg(long, requires = "source_table", conflicts_with_all = ["table", "all"])]
        target_table: Option<String>,

        /// Validate every matched table of the two schemas
        #[arg(long)]
        all: bool,

        /// Key columns, comma separated
        #[arg(short, long, value_delimiter = ',')]
        keys: Vec<String>,

        /// Row filter applied on both sides
        #[arg(short, long)]
        predicate: Option<String>,

        /// Compare only these columns
        #[arg(long, value_delimiter = ',')]
        include: Vec<String>,

        /// Skip these columns
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Print the run as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct Endpoints {
    /// Source database URL
    #[arg(long, env = "DBSHIFT_SOURCE_URL")]
    source_url: String,

    /// Target database URL
    #[arg(long, env = "DBSHIFT_TARGET_URL")]
    target_url: String,

    #[arg(long)]
    source_schema: String,

    #[arg(long)]
    target_schema: String,
}

impl Endpoints {
    async fn connect(&self, factory: &ConnectorFactory) -> anyhow::Result<(Arc<dyn Connector>, Arc<dyn Connector>)> {
        let source = DatabaseConnectionConfig::from_url(&self.source_url).context("invalid source URL")?;
        let target = DatabaseConnectionConfig::from_url(&self.target_url).context("invalid target URL")?;
        let source = factory.connect(&source).await.context("source connection failed")?;
        let target = factory.connect(&target).await.context("target connection failed")?;
        Ok((source, target))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;

    if let Commands::Serve { .. } = cli.command {
        init_tracing(if cli.verbose { "debug" } else { config.log_level.as_str() });
    } else {
        init_tracing(if cli.verbose { "info" } else { "warn" });
    }

    let factory = ConnectorFactory::new(
        Arc::new(MemoryCatalog::new()),
        Duration::from_secs(config.connect_timeout_secs.max(1)),
    );

    match cli.command {
        Commands::Serve {
            bind,
            runs_dir,
            max_concurrent_tables,
        } => {
            let mut builder = AppConfigBuilder::from_config(config);
            if let Some(bind) = bind {
                builder = builder.bind(bind);
            }
            if let Some(dir) = runs_dir {
                builder = builder.runs_dir(dir);
            }
            if let Some(limit) = max_concurrent_tables {
                builder = builder.max_concurrent_tables(limit);
            }
            Server::new(builder.build())?.serve().await?;
        }
        Commands::Convert {
            input,
            json,
            output,
            no_terminator,
        } => convert(&input, json, output, !no_terminator)?,
        Commands::Sample => println!("{}", dbshift::translator::SAMPLE_PROCEDURE),
        Commands::Discover { endpoints, json } => {
            let (source, target) = endpoints.connect(&factory).await?;
            let result = SchemaMatcher::new()
                .discover(
                    source.as_ref(),
                    &endpoints.source_schema,
                    target.as_ref(),
                    &endpoints.target_schema,
                )
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_match(&result);
            }
        }
        Commands::Validate {
            endpoints,
            table,
            source_table,
            target_table,
            all,
            keys,
            predicate,
            include,
            exclude,
            json,
        } => {
            let (source, target) = endpoints.connect(&factory).await?;
            let tables = if all {
                SchemaMatcher::new()
                    .discover(
                        source.as_ref(),
                        &endpoints.source_schema,
                        target.as_ref(),
                        &endpoints.target_schema,
                    )
                    .await?
                    .matched_tables
                    .into_iter()
                    .map(|t| if keys.is_empty() { t } else { t.with_primary_keys(keys.clone()) })
                    .collect()
            } else {
                let (src, tgt) = match (table, source_table, target_table) {
                    (Some(name), _, _) => (name.clone(), name),
                    (None, Some(src), Some(tgt)) => (src, tgt),
                    _ => bail!("give --table, --source-table/--target-table or --all"),
                };
                if keys.is_empty() {
                    bail!("--keys is required for a single-table validation");
                }
                vec![TableMatch::manual(src, tgt, keys)]
            };

            let store = Arc::new(RunStore::new(config.runs_dir.clone())?.with_retention(config.max_retained_runs));
            let runner = ValidationRunner::new(store, RunnerSettings::from(&config));
            let plan = ValidationPlan::new(source, &endpoints.source_schema, target, &endpoints.target_schema, tables)
                .with_predicate(predicate)
                .with_projection(Projection::new(include, exclude));
            let run = await_run(&runner, plan).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                println!("{}", run.formatted_report());
                print_status(&run);
            }
            if run.status != RunStatus::Completed {
                std::process::exit(2);
            }
        }
    }
    Ok(())
}

/// Wait for a run, cancelling it on Ctrl-C.
async fn await_run(runner: &ValidationRunner, plan: ValidationPlan) -> anyhow::Result<ValidationRun> {
    let handle = runner.start(plan)?;
    let run_id = handle.run_id.clone();
    let finished = handle.wait();
    tokio::pin!(finished);

    let run = tokio::select! {
        run = &mut finished => run?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Cancelling validation run...".yellow());
            runner.cancel(&run_id)?;
            finished.await?
        }
    };
    Ok(run)
}

fn convert(input: &str, json: bool, output: Option<PathBuf>, terminator: bool) -> anyhow::Result<()> {
    let source_sql = if input == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text).context("failed to read stdin")?;
        text
    } else {
        std::fs::read_to_string(input).with_context(|| format!("failed to read {}", input))?
    };

    let request = ConversionRequest::new(source_sql).with_procedure_terminator(terminator);
    let result = Translator::new().convert(&request)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if let Some(path) = &output {
        std::fs::write(path, &result.target_sql).with_context(|| format!("failed to write {}", path.display()))?;
        eprintln!("{} Wrote DB2 SQL to {}", "✓".green(), path.display().to_string().cyan());
    } else {
        println!("{}", result.target_sql);
    }

    if !json {
        for issue in &result.issues {
            let label = match issue.severity {
                Severity::Warning => "warning".yellow().bold(),
                Severity::Error => "error".red().bold(),
            };
            eprintln!("{} line {}: {}", label, issue.line, issue.message);
            if let Some(solution) = &issue.solution {
                eprintln!("  {} {}", "→".dimmed(), solution.dimmed());
            }
        }
    }

    if !result.success {
        bail!("some constructs need manual conversion");
    }
    Ok(())
}

fn print_match(result: &SchemaMatch) {
    println!(
        "{} {} → {}",
        "Schema match:".green().bold(),
        result.source_schema.cyan(),
        result.target_schema.cyan()
    );
    for table in &result.matched_tables {
        println!(
            "  {} → {} [{:?}] keys: {}",
            table.source_table,
            table.target_table,
            table.match_type,
            table.primary_keys.join(", ").yellow()
        );
    }
    for name in &result.unmatched_source_tables {
        println!("  {} {} (source only)", "✗".red(), name);
    }
    for name in &result.unmatched_target_tables {
        println!("  {} {} (target only)", "✗".red(), name);
    }
    for failure in &result.table_errors {
        println!("  {} {}", "✗".red(), failure.error.red());
    }
    println!(
        "{} matched, {} source only, {} target only",
        result.summary.matched_pairs, result.summary.unmatched_source, result.summary.unmatched_target
    );
}

fn print_status(run: &ValidationRun) {
    let status = match run.status {
        RunStatus::Completed => run.status.to_string().green().bold(),
        RunStatus::CompletedWithErrors => run.status.to_string().yellow().bold(),
        _ => run.status.to_string().red().bold(),
    };
    eprintln!("{} {} ({})", "Run".dimmed(), run.run_id, status);
}
