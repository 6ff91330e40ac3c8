// crates/flowcli/src/main.rs

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use flowcore::{
    bag_from_json, resolve_execution_order, Branch, Condition, DataBag, DateRange, FlowDefinition, FlowFilter,
    FlowId, FlowStatus, PageRequest, StepSpec, Value,
};
use flowruntime::{load_definition, DefinitionLoader, EngineConfig, FileFlowStore, FlowEngine, FlowSummary, NewFlow};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Durable flow engine CLI", long_about = None)]
struct Cli {
    /// Directory holding flow state documents
    #[arg(long, global = true, default_value = "./flows")]
    store: PathBuf,

    /// Directory of flow definition files (*.json)
    #[arg(long, global = true, default_value = "./definitions")]
    definitions: PathBuf,

    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and run a flow until it completes, fails or pauses
    Run {
        flow_type: String,

        /// Initial data as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        correlation: Option<String>,
    },

    /// List stored flows, newest first
    List {
        #[arg(long)]
        status: Option<FlowStatus>,

        #[arg(long)]
        flow_type: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = 20)]
        page_size: usize,
    },

    /// Show a flow with its steps and timeline
    Show { id: FlowId },

    /// Pause a running flow at its next batch boundary
    Pause {
        id: FlowId,

        #[arg(short, long)]
        message: Option<String>,
    },

    /// Resume a paused flow
    Resume {
        id: FlowId,

        /// Data merged into the flow before it continues (JSON object)
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Cancel a flow
    Cancel {
        id: FlowId,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Close a failed flow after manual intervention
    Resolve {
        id: FlowId,

        #[arg(short, long)]
        note: String,
    },

    /// Re-run a failed flow from its failed step
    Retry { id: FlowId },

    /// Re-attach or fail flows left running by a crashed process
    Recover,

    /// Aggregate statistics over flows created in a time range
    Stats {
        #[arg(long, value_parser = parse_timestamp)]
        from: Option<DateTime<Utc>>,

        #[arg(long, value_parser = parse_timestamp)]
        to: Option<DateTime<Utc>>,
    },

    /// Validate a definition file and print its execution batches
    Validate { file: PathBuf },

    /// List available step types
    Steps,

    /// Create a new example definition
    Init {
        /// Output file path
        #[arg(short, long, default_value = "definitions/example.json")]
        output: PathBuf,
    },

    /// Run the engine (recovery and auto-resume) until Ctrl-C
    Serve,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {}", e))
}

fn parse_bag(raw: Option<String>) -> Result<Option<DataBag>> {
    let Some(raw) = raw else { return Ok(None) };
    let json: serde_json::Value = serde_json::from_str(&raw).context("data is not valid JSON")?;
    bag_from_json(json)
        .map(Some)
        .ok_or_else(|| anyhow!("Input must be a JSON object"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::Validate { ref file } => return validate_definition(file),
        Commands::Steps => {
            list_steps();
            return Ok(());
        }
        Commands::Init { ref output } => return create_example_definition(output),
        _ => {}
    }

    let engine = build_engine(&cli).await?;

    match cli.command {
        Commands::Run {
            flow_type,
            input,
            user,
            correlation,
        } => {
            let input = NewFlow {
                user_id: user,
                correlation_id: correlation,
                data: parse_bag(input)?.unwrap_or_default(),
            };
            let flow = engine.run_flow(&flow_type, input).await?;
            println!("🚀 Started {} flow {}", flow.flow_type, flow.flow_id);
            print_summary(&engine.wait_for_settle(flow.flow_id).await?);
        }

        Commands::List {
            status,
            flow_type,
            page,
            page_size,
        } => {
            let filter = FlowFilter {
                statuses: status.into_iter().collect(),
                flow_type,
                ..FlowFilter::default()
            };
            let result = engine.query(&filter, PageRequest::new(page, page_size)).await?;
            println!("📋 {} flow(s), page {} of size {}", result.total, result.page, result.page_size);
            for flow in &result.items {
                println!(
                    "  {}  {:<10} {:<20} step {:<16} {}",
                    flow.flow_id,
                    flow.status.to_string(),
                    flow.flow_type,
                    flow.current_step_name.as_deref().unwrap_or("-"),
                    flow.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            if result.has_more() {
                println!("  … more on page {}", result.page + 1);
            }
        }

        Commands::Show { id } => show_flow(&engine, id).await?,

        Commands::Pause { id, message } => {
            engine.pause(id, message).await?;
            print_summary(&engine.wait_for_settle(id).await?);
        }

        Commands::Resume { id, data } => {
            engine.resume(id, parse_bag(data)?).await?;
            print_summary(&engine.wait_for_settle(id).await?);
        }

        Commands::Cancel { id, reason } => {
            engine.cancel(id, reason).await?;
            print_summary(&engine.wait_for_settle(id).await?);
        }

        Commands::Resolve { id, note } => {
            print_summary(&engine.resolve(id, note).await?);
        }

        Commands::Retry { id } => {
            engine.retry(id).await?;
            print_summary(&engine.wait_for_settle(id).await?);
        }

        Commands::Recover => {
            let summary = engine.recover_crashed_flows().await?;
            println!(
                "🩹 Recovery: {} resumed, {} failed, {} errors",
                summary.recovered_count(),
                summary.failed_count(),
                summary.error_count()
            );
            for (flow_id, error) in &summary.errors {
                println!("  ❌ {}: {}", flow_id, error);
            }
            for flow_id in &summary.recovered {
                print_summary(&engine.wait_for_settle(*flow_id).await?);
            }
        }

        Commands::Stats { from, to } => {
            let stats = engine.compute_statistics(DateRange::new(from, to)).await?;
            println!("📊 {} flow(s)", stats.total);
            for (status, count) in &stats.by_status {
                println!("   {:<10} {}", status.to_string(), count);
            }
            for (flow_type, count) in &stats.by_flow_type {
                println!("   type {:<20} {}", flow_type, count);
            }
            for (reason, count) in &stats.by_pause_reason {
                println!("   paused for {:<18} {}", reason.to_string(), count);
            }
            if let Some(avg) = stats.average_duration_ms {
                println!("   average duration: {:.0}ms", avg);
            }
            println!("   success rate: {:.1}%", stats.success_rate * 100.0);
        }

        Commands::Serve => serve(&engine).await?,

        Commands::Validate { .. } | Commands::Steps | Commands::Init { .. } => {}
    }

    Ok(())
}

async fn build_engine(cli: &Cli) -> Result<FlowEngine> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let store = FileFlowStore::open(&cli.store)
        .await
        .with_context(|| format!("opening store {}", cli.store.display()))?;

    let engine = FlowEngine::builder()
        .store(Arc::new(store))
        .steps(flowsteps::standard_registry())
        .config(config)
        .build();

    for definition in DefinitionLoader::new(&cli.definitions).load_definitions()? {
        let flow_type = definition.flow_type.clone();
        engine
            .register_definition(definition)
            .await
            .with_context(|| format!("registering definition '{}'", flow_type))?;
    }
    tracing::debug!("Engine ready with flow types {:?}", engine.list_flow_types().await);
    Ok(engine)
}

async fn serve(engine: &FlowEngine) -> Result<()> {
    let recovery = engine.start().await?;
    println!(
        "▶️  Engine running ({} definition(s), {} flow(s) recovered, {} failed on recovery). Ctrl-C to stop.",
        engine.list_flow_types().await.len(),
        recovery.recovered_count(),
        recovery.failed_count()
    );

    if let Some(mut changes) = engine.subscribe() {
        tokio::spawn(async move {
            while let Ok(change) = changes.recv().await {
                println!("  🔔 {} {} → {}", change.flow_type, change.flow_id, change.status);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    println!("⏹  Shutting down…");
    let stragglers = engine.shutdown().await;
    if stragglers.is_empty() {
        println!("✨ All flows parked");
    } else {
        println!("⚠️  {} flow(s) still busy; recovery will pick them up", stragglers.len());
    }
    Ok(())
}

fn status_icon(status: FlowStatus) -> &'static str {
    match status {
        FlowStatus::Pending => "🕓",
        FlowStatus::Running => "⚡",
        FlowStatus::Paused => "⏸",
        FlowStatus::Failed => "💥",
        FlowStatus::Completed => "✅",
        FlowStatus::Cancelled => "🚫",
        FlowStatus::Resolved => "🛠",
    }
}

fn print_summary(flow: &FlowSummary) {
    println!();
    println!("{} Flow {} is {}", status_icon(flow.status), flow.flow_id, flow.status);
    println!("   Type: {}", flow.flow_type);
    println!("   Steps: {}/{} completed", flow.completed_steps, flow.total_steps);
    if let Some(step) = &flow.current_step_name {
        println!("   Current step: {}", step);
    }
    if let Some(reason) = flow.pause_reason {
        println!(
            "   Paused: {} {}",
            reason,
            flow.pause_message.as_deref().map(|m| format!("({})", m)).unwrap_or_default()
        );
    }
    if let Some(at) = flow.resume_after {
        println!("   Resumes after: {}", at);
    }
    if let Some(error) = &flow.last_error {
        println!(
            "   Error [{}] in {}: {}",
            error.kind,
            error.step_name.as_deref().unwrap_or("-"),
            error.message
        );
    }
    if let Some(note) = &flow.resolution_note {
        println!("   Resolution: {}", note);
    }
}

async fn show_flow(engine: &FlowEngine, id: FlowId) -> Result<()> {
    let state = engine.get_by_id(id).await?;
    print_summary(&engine.get_summary(id).await?);

    println!();
    println!("🧩 Steps:");
    for step in &state.steps {
        println!(
            "   {:<20} {:<9} attempts {}{}",
            step.name,
            format!("{:?}", step.status),
            step.attempts,
            step.error
                .as_ref()
                .map(|e| format!("  ({})", e.message))
                .unwrap_or_default()
        );
    }

    if !state.data.is_empty() {
        println!();
        println!("📦 Data:");
        for (key, value) in &state.data {
            println!("   {}: {}", key, value.to_json());
        }
    }

    println!();
    println!("🕑 Timeline:");
    for entry in engine.get_timeline(id).await? {
        println!(
            "   {}  {:<16} {}",
            entry.timestamp.format("%H:%M:%S%.3f"),
            format!("{:?}", entry.event_type),
            entry.description
        );
    }
    Ok(())
}

fn validate_definition(file: &Path) -> Result<()> {
    println!("🔍 Validating definition: {}", file.display());

    let definition = load_definition(file)?;
    let plan = resolve_execution_order(&definition)?;

    let registry = flowsteps::standard_registry();
    let unknown: Vec<&str> = definition
        .steps
        .iter()
        .map(|s| s.step_type.as_str())
        .filter(|t| !registry.contains(t))
        .collect();

    println!("✅ Flow '{}' resolves to {} batch(es):", definition.flow_type, plan.len());
    for (i, batch) in plan.batches.iter().enumerate() {
        println!("   {}. {}", i + 1, batch.join(", "));
    }
    if !unknown.is_empty() {
        println!("⚠️  Step types not provided by the standard library: {}", unknown.join(", "));
    }
    Ok(())
}

fn list_steps() {
    println!("📦 Available Step Types:");
    println!();

    let registry = flowsteps::standard_registry();
    for step_type in registry.list_step_types() {
        if let Some(metadata) = registry.get_metadata(&step_type) {
            println!("  • {} ({})", step_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", step_type);
        }
    }
}

fn create_example_definition(output: &Path) -> Result<()> {
    let mut greeting = HashMap::new();
    greeting.insert("greeting".to_string(), Value::from("hello"));

    let definition = FlowDefinition::new("example")
        .with_description("Seeds data, waits for an approval, then branches on the amount")
        .with_step(
            StepSpec::new("seed", "data.set")
                .with_config("values", Value::Object(greeting))
                .with_output("greeting"),
        )
        .with_step(
            StepSpec::new("approval", "control.await")
                .with_config("key", "approved")
                .with_output("approved")
                .depends_on("seed")
                .idempotent(true),
        )
        .with_step(
            StepSpec::new("route", "debug.log")
                .with_config("message", "routing by amount")
                .depends_on("approval")
                .with_branch(Branch::when(
                    Condition::GreaterThan {
                        key: "amount".to_string(),
                        value: 1000.0,
                    },
                    &["large_order"],
                ))
                .with_branch(Branch::otherwise(&["small_order"])),
        )
        .with_step(
            StepSpec::new("large_order", "time.delay")
                .with_config("delay_ms", 500.0)
                .with_retry(2, 1000)
                .with_timeout(5000),
        )
        .with_step(StepSpec::new("small_order", "debug.log").with_config("message", "small order"));

    resolve_execution_order(&definition)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&definition)?;
    std::fs::write(output, json)?;

    println!("✨ Created example definition: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run example --input '{{\"amount\": 1500}}'");
    println!("  flow resume <id> --data '{{\"approved\": true}}'");

    Ok(())
}
