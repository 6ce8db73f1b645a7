use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use txlab_config::{default_config, load_config_from_path};
use txlab_detector::Detector;
use txlab_domain::{
    now_utc, ActorStatus, Anomaly, AnomalyType, DetectorSettings, FailureReason, IsolationLevel,
    Pacing, RunId, RunRecord, ScenarioKind, ScenarioResult, TraceEvent, WriteSkewPolicy,
};
use txlab_orchestrator::{
    Orchestrator, OrchestratorConfig, ScenarioRequest, DEFAULT_OPERAND_A, DEFAULT_OPERAND_B,
};
use txlab_store::LabStore;
use txlab_trace_core::{verify_chain, TraceLog, TraceStore};
use txlab_trace_sqlite::SqliteTraceStore;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "txlab")]
#[command(about = "Provoke, trace and classify transaction isolation anomalies")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one two-actor scenario and classify its trace.
    Run(RunArgs),
    Trace(TraceArgs),
    /// Re-run anomaly detection over a stored or exported trace.
    Detect(DetectArgs),
    /// Write a run's events as JSON lines.
    Export(ExportArgs),
    /// Print isolation levels, what they prevent and the scenario defaults.
    Isolation,
}

#[derive(Debug, Args)]
struct RunArgs {
    scenario: String,
    #[arg(long, default_value_t = DEFAULT_OPERAND_A, allow_negative_numbers = true)]
    operand_a: i64,
    #[arg(long, default_value_t = DEFAULT_OPERAND_B, allow_negative_numbers = true)]
    operand_b: i64,
    #[arg(long)]
    isolation: Option<String>,
    #[arg(long)]
    pacing: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    trace_db: Option<PathBuf>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, default_value_t = false)]
    print_events: bool,
}

#[derive(Debug, Args)]
struct TraceArgs {
    #[command(subcommand)]
    command: TraceSubcommand,
}

#[derive(Debug, Subcommand)]
enum TraceSubcommand {
    Runs {
        #[arg(long)]
        trace_db: PathBuf,
    },
    Events {
        #[arg(long)]
        trace_db: PathBuf,
        #[arg(long)]
        run_id: String,
    },
    Anomalies {
        #[arg(long)]
        trace_db: PathBuf,
        #[arg(long)]
        run_id: String,
    },
    /// Recompute the run's hash chain.
    Verify {
        #[arg(long)]
        trace_db: PathBuf,
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Debug, Args)]
struct DetectArgs {
    #[arg(long, requires = "run_id", conflicts_with = "events")]
    trace_db: Option<PathBuf>,
    #[arg(long)]
    run_id: Option<String>,
    /// JSON-lines file as written by `txlab export`.
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Only report write skew when the projected total drops below this.
    #[arg(long, allow_negative_numbers = true)]
    write_skew_min_total: Option<i64>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    trace_db: PathBuf,
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    out: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => run_command(&args),
        Commands::Trace(args) => trace_command(args),
        Commands::Detect(args) => detect_command(&args),
        Commands::Export(args) => export_command(&args),
        Commands::Isolation => {
            isolation_command();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A subscriber may already be installed when embedded; keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

fn run_command(args: &RunArgs) -> Result<()> {
    let kind = parse_scenario(&args.scenario)?;
    let isolation = args
        .isolation
        .as_deref()
        .map(IsolationLevel::parse)
        .transpose()?;
    let pacing = args.pacing.as_deref().map(Pacing::parse).transpose()?;
    let run_id = args
        .run_id
        .as_deref()
        .map(parse_run_id)
        .transpose()?
        .unwrap_or_default();
    let config = match &args.config {
        Some(path) => load_config_from_path(path)?,
        None => default_config()?,
    };

    let mut orchestrator_config = OrchestratorConfig::from(&config);
    if let Some(pacing) = pacing {
        orchestrator_config.pacing = pacing;
    }
    let pacing = orchestrator_config.pacing;

    let trace_db = args.trace_db.clone().or_else(|| config.trace_db.clone());
    let trace_store = trace_db.as_deref().map(open_trace_store).transpose()?;

    let store = LabStore::new();
    let trace = TraceLog::new();
    let orchestrator = Orchestrator::new(&store, &trace, orchestrator_config);
    let request = ScenarioRequest {
        run_id,
        kind,
        operand_a: args.operand_a,
        operand_b: args.operand_b,
        isolation,
    };

    let started_at = now_utc();
    let result = orchestrator.run_scenario(&request)?;
    let events = trace.fetch_ordered(run_id);
    let anomalies = Detector::new(config.detector).detect(&events);

    // The run row is written only once the scenario produced a result.
    if let Some(trace_store) = &trace_store {
        let record = RunRecord {
            run_id,
            scenario: kind,
            isolation: result.isolation,
            operand_a: args.operand_a,
            operand_b: args.operand_b,
            pacing,
            started_at,
            ended_at: None,
            result_json: None,
        };
        persist_run(trace_store, &record, &result, &events, &anomalies)?;
    }

    println!(
        "run_id={} scenario={} isolation={} pacing={} events={} anomalies={}",
        run_id,
        kind,
        level_slug(result.isolation),
        pacing.as_str(),
        events.len(),
        anomalies.len()
    );
    for actor in &result.actors {
        println!(
            "actor={} status={} failure={}",
            actor.tx_name,
            format_status(actor.status),
            actor.failure.map_or("none", FailureReason::as_str)
        );
    }
    println!("{}", serde_json::to_string(&result.observed)?);
    if args.print_events {
        for event in &events {
            println!("{}", serde_json::to_string(event)?);
        }
    }
    for anomaly in &anomalies {
        println!("{}", serde_json::to_string(anomaly)?);
    }

    Ok(())
}

fn persist_run(
    trace_store: &dyn TraceStore,
    record: &RunRecord,
    result: &ScenarioResult,
    events: &[TraceEvent],
    anomalies: &[Anomaly],
) -> Result<()> {
    trace_store.insert_run(record)?;
    for event in events {
        trace_store.append_event(event)?;
    }
    for anomaly in anomalies {
        trace_store.append_anomaly(record.run_id, anomaly)?;
    }
    trace_store.finish_run(record.run_id, result)?;
    info!(
        run_id = %record.run_id,
        events = events.len(),
        anomalies = anomalies.len(),
        "trace persisted"
    );
    Ok(())
}

fn trace_command(args: TraceArgs) -> Result<()> {
    match args.command {
        TraceSubcommand::Runs { trace_db } => {
            let trace_store = open_trace_store(&trace_db)?;
            for run in trace_store.list_runs()? {
                println!("{}", serde_json::to_string(&run)?);
            }
        }
        TraceSubcommand::Events { trace_db, run_id } => {
            let trace_store = open_trace_store(&trace_db)?;
            let run_id = parse_run_id(&run_id)?;
            for row in trace_store.list_events_for_run(run_id)? {
                println!("{}", serde_json::to_string(&row.event)?);
            }
        }
        TraceSubcommand::Anomalies { trace_db, run_id } => {
            let trace_store = open_trace_store(&trace_db)?;
            let run_id = parse_run_id(&run_id)?;
            for anomaly in trace_store.list_anomalies_for_run(run_id)? {
                println!("{}", serde_json::to_string(&anomaly)?);
            }
        }
        TraceSubcommand::Verify { trace_db, run_id } => {
            let trace_store = open_trace_store(&trace_db)?;
            let run_id = parse_run_id(&run_id)?;
            let rows = trace_store.list_events_for_run(run_id)?;
            let report = verify_chain(run_id, &rows);
            println!(
                "run_id={} events={} chain_valid={}",
                report.run_id, report.events, report.chain_valid
            );
            if let Some(sequence_order) = report.first_broken_sequence {
                bail!("hash chain broken at sequence_order {sequence_order}");
            }
        }
    }
    Ok(())
}

fn detect_command(args: &DetectArgs) -> Result<()> {
    let events = match (&args.trace_db, &args.events) {
        (Some(trace_db), None) => {
            let run_id = args
                .run_id
                .as_deref()
                .ok_or_else(|| anyhow!("--trace-db requires --run-id"))?;
            let run_id = parse_run_id(run_id)?;
            open_trace_store(trace_db)?
                .list_events_for_run(run_id)?
                .into_iter()
                .map(|row| row.event)
                .collect()
        }
        (None, Some(path)) => read_events_jsonl(path)?,
        _ => bail!("pass either --trace-db with --run-id, or --events"),
    };

    let mut settings = match &args.config {
        Some(path) => load_config_from_path(path)?.detector,
        None => DetectorSettings::default(),
    };
    if let Some(min_total) = args.write_skew_min_total {
        settings.write_skew = WriteSkewPolicy::ConstraintBreach { min_total };
    }

    let anomalies = Detector::new(settings).detect(&events);
    println!("events={} anomalies={}", events.len(), anomalies.len());
    for anomaly in &anomalies {
        println!("{}", serde_json::to_string(anomaly)?);
    }
    Ok(())
}

fn export_command(args: &ExportArgs) -> Result<()> {
    let trace_store = open_trace_store(&args.trace_db)?;
    let run_id = parse_run_id(&args.run_id)?;
    let rows = trace_store.list_events_for_run(run_id)?;

    let output = File::create(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let mut writer = BufWriter::new(output);
    for row in &rows {
        writeln!(writer, "{}", serde_json::to_string(&row.event)?)?;
    }
    writer.flush()?;

    println!("exported {} events to {}", rows.len(), args.out.display());
    Ok(())
}

fn isolation_command() {
    for level in IsolationLevel::ALL {
        let (concurrency, consistency, locking) = level.profile();
        let (prevents, allows): (Vec<AnomalyType>, Vec<AnomalyType>) = AnomalyType::ALL
            .into_iter()
            .partition(|anomaly| level.prevents(*anomaly));
        println!(
            "{}",
            json!({
                "level": level,
                "description": level.description(),
                "concurrency": concurrency,
                "consistency": consistency,
                "locking": locking,
                "prevents": prevents,
                "allows": allows,
            })
        );
    }
    for anomaly in AnomalyType::ALL {
        println!(
            "{}",
            json!({
                "anomaly": anomaly,
                "severity": anomaly.severity(),
                "recommended": IsolationLevel::recommended_for(anomaly).to_string(),
            })
        );
    }
    for kind in ScenarioKind::ALL {
        println!(
            "{}",
            json!({
                "scenario": kind,
                "default_isolation": kind.default_isolation(),
                "target_anomaly": kind.target_anomaly(),
            })
        );
    }
}

fn open_trace_store(path: &Path) -> Result<SqliteTraceStore> {
    let trace_store = SqliteTraceStore::open(path)?;
    trace_store.migrate()?;
    Ok(trace_store)
}

fn read_events_jsonl(path: &Path) -> Result<Vec<TraceEvent>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read events file {}", path.display()))?;
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .map_err(|err| anyhow!("invalid trace event on line {}: {err}", idx + 1))
        })
        .collect()
}

fn parse_scenario(input: &str) -> Result<ScenarioKind> {
    Ok(ScenarioKind::parse(&input.trim().replace('-', "_"))?)
}

fn parse_run_id(input: &str) -> Result<RunId> {
    let value = Ulid::from_str(input).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(value))
}

fn level_slug(level: IsolationLevel) -> String {
    level.as_str().to_ascii_lowercase().replace(' ', "_")
}

fn format_status(status: ActorStatus) -> &'static str {
    match status {
        ActorStatus::Committed => "committed",
        ActorStatus::RolledBack => "rolled_back",
    }
}
