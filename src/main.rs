// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use serde::Serialize;
use tracing::info;
use url::Url;

use reconflow::core::correlation::{builtin_rules, rule::parse_rules, RuleDefinition};
use reconflow::core::models::{EventFilter, ScanLogEntry};
use reconflow::core::modules::builtin_registry;
use reconflow::{
    logging, CorrelationEngine, CorrelationRun, EngineConfig, Event, MemoryStore, ScanManager, ScanOutcome,
    ScanRequest, TargetType,
};

#[derive(Debug, Parser)]
#[command(name = "reconflow", version, about = "Event-driven reconnaissance scanner with rule-based correlation")]
struct Cli {
    /// Also print logs to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan one target, correlate the results and print a JSON report.
    Scan {
        /// Domain, IP address, e-mail, ... A URL is reduced to its host.
        target: String,
        /// Comma-separated module names. Defaults to every built-in module.
        #[arg(short, long, value_delimiter = ',')]
        modules: Vec<String>,
        /// Force the target type instead of detecting it (e.g. DOMAIN_NAME).
        #[arg(long)]
        target_type: Option<TargetType>,
        /// JSON engine configuration file.
        #[arg(long, env = "RECONFLOW_CONFIG")]
        config: Option<PathBuf>,
        /// JSON rule file, used in place of the built-in rules.
        #[arg(long)]
        rules: Option<PathBuf>,
        #[arg(long)]
        max_events: Option<usize>,
        #[arg(long)]
        max_depth: Option<u32>,
        #[arg(long)]
        max_threads: Option<usize>,
    },
    /// List the built-in modules.
    Modules,
    /// List the correlation rules.
    Rules {
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct ScanReport {
    outcome: ScanOutcome,
    events: Vec<Event>,
    correlation: CorrelationRun,
    logs: Vec<ScanLogEntry>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let log_path = logging::initialize_logging(cli.verbose)?;
    info!(log = %log_path.display(), "reconflow starting.");

    match cli.command {
        Command::Scan { target, modules, target_type, config, rules, max_events, max_depth, max_threads } => {
            let mut engine_config = match config {
                Some(path) => EngineConfig::from_file(&path)?,
                None => EngineConfig::default(),
            };
            if max_events.is_some() {
                engine_config.max_events = max_events;
            }
            if max_depth.is_some() {
                engine_config.max_depth = max_depth;
            }
            if let Some(max_threads) = max_threads {
                engine_config.max_threads = max_threads;
            }
            engine_config.validate()?;

            let correlation = CorrelationEngine::new(load_rules(rules.as_ref())?);
            let manager = ScanManager::new(builtin_registry(), Arc::new(MemoryStore::new()), engine_config)
                .with_correlation(correlation);

            let mut request = ScanRequest::new(&host_of(&target)).modules(modules);
            request.target_type = target_type;
            let scan_id = manager.create_scan(request).await?;
            let outcome = manager.wait(&scan_id).await?;
            let correlation = manager.run_correlation(std::slice::from_ref(&scan_id), None).await?;

            let report = ScanReport {
                outcome,
                events: manager.events(&scan_id, &EventFilter::default()).await?,
                correlation,
                logs: manager.logs(&scan_id).await?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Modules => {
            let registry = builtin_registry();
            for descriptor in registry.list_modules(&[])? {
                println!("{:<16} {}", descriptor.name, descriptor.summary);
                println!("{:<16}   watches:  {}", "", descriptor.watched_types.join(", "));
                println!("{:<16}   produces: {}", "", descriptor.produced_types.join(", "));
            }
        }
        Command::Rules { rules } => {
            for rule in load_rules(rules.as_ref())? {
                println!("{:<32} {:<7} {:<11} {}", rule.id, rule.risk, rule.scope, rule.name);
            }
        }
    }
    Ok(())
}

fn load_rules(path: Option<&PathBuf>) -> Result<Vec<RuleDefinition>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).wrap_err_with(|| format!("cannot read {}", path.display()))?;
            Ok(parse_rules(&raw)?)
        }
        None => Ok(builtin_rules()?),
    }
}

/// Reduces a URL to its host; anything else is returned unchanged.
fn host_of(input: &str) -> String {
    if !input.contains("://") {
        return input.trim().to_string();
    }
    Url::parse(input)
        .ok()
        .and_then(|url| url.host_str().map(String::from))
        .unwrap_or_else(|| input.trim().to_string())
}
