use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use loomcore::{EnginePolicy, EventHub, RunEvent, RunEventType};
use loomruntime::{compile, Engine, EvalCase, EvalRunner, HandlerRegistry};

#[derive(Parser)]
#[command(name = "loom")]
#[command(about = "Loomflow CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow graph file
    Run {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Permit script nodes to run
        #[arg(long)]
        allow_code: bool,
    },

    /// Run labeled eval cases against a flow
    Eval {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Path to cases JSON file
        #[arg(short, long)]
        cases: PathBuf,
    },

    /// Validate a flow graph file
    Validate {
        /// Path to graph JSON file
        file: PathBuf,
    },

    /// List available node kinds
    Nodes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            verbose,
            allow_code,
        } => {
            let level = if verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::WARN
            };
            tracing_subscriber::fmt().with_max_level(level).init();

            run_flow(file, input, allow_code).await?;
        }

        Commands::Eval { file, cases } => {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::WARN)
                .init();
            eval_flow(file, cases).await?;
        }

        Commands::Validate { file } => {
            validate_flow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }
    }

    Ok(())
}

fn engine(policy: EnginePolicy) -> Engine {
    let mut registry = HandlerRegistry::new();
    loomnodes::register_all(&mut registry);
    Engine::new(Arc::new(registry), policy)
}

fn parse_input(input: Option<String>) -> Result<serde_json::Value> {
    match input {
        Some(text) => Ok(serde_json::from_str(&text)?),
        None => Ok(serde_json::Value::Null),
    }
}

async fn run_flow(file: PathBuf, input: Option<String>, allow_code: bool) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());

    let graph: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
    let flow = compile(&graph)?;

    println!("📋 Flow: {}", flow.name);
    println!("   Nodes: {}", flow.nodes.len());
    println!("   Edges: {}", flow.edges.len());
    println!();

    let input = parse_input(input)?;

    let policy = EnginePolicy::default().with_code_execution(allow_code);
    let hub = EventHub::new();
    let engine = engine(policy).with_hub(hub.clone());

    let run_id = uuid::Uuid::new_v4().to_string();
    let mut sub = hub.subscribe(&run_id).await;
    let printer = tokio::spawn(async move {
        while let Some(envelope) = sub.recv().await {
            if let Ok(event) = serde_json::from_str::<RunEvent>(&envelope) {
                print_event(&event);
            }
        }
    });

    let result = engine.execute_with_id(run_id, &flow, input).await;
    printer.await.ok();

    println!();
    match result {
        Ok(done) => {
            println!("📊 Run summary:");
            println!("   Run ID: {}", done.record.id);
            println!("   Events: {}", done.record.events.len());
            if let Some(output) = &done.record.output {
                println!("   Output: {}", serde_json::to_string_pretty(output)?);
            }
            Ok(())
        }
        Err(failure) => {
            println!("💥 Run {} failed: {}", failure.record.id, failure.error);
            std::process::exit(1);
        }
    }
}

fn print_event(event: &RunEvent) {
    let node = event.node_id.as_deref().unwrap_or("-");
    match event.kind {
        RunEventType::RunStarted => println!("▶️  Run started"),
        RunEventType::NodeStarted => {
            let kind = event.node_type.as_deref().unwrap_or("?");
            println!("  ⚡ {} ({})", node, kind);
        }
        RunEventType::NodeCompleted => {
            let port = event
                .detail
                .as_ref()
                .and_then(|d| d.get("port"))
                .and_then(|p| p.as_str())
                .unwrap_or("next");
            println!("  ✅ {} → {}", node, port);
        }
        RunEventType::NodeLog => {
            let message = event
                .detail
                .as_ref()
                .and_then(|d| d.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("");
            println!("     ℹ️  [{}] {}", node, message);
        }
        RunEventType::RunCompleted => println!("✨ Run completed"),
        RunEventType::RunFailed => {
            let error = event
                .detail
                .as_ref()
                .and_then(|d| d.get("error"))
                .and_then(|e| e.as_str())
                .unwrap_or("unknown error");
            println!("💥 Run failed: {}", error);
        }
    }
}

async fn eval_flow(file: PathBuf, cases_file: PathBuf) -> Result<()> {
    let graph: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
    let flow = compile(&graph)?;
    let cases: Vec<EvalCase> = serde_json::from_str(&std::fs::read_to_string(&cases_file)?)?;

    println!("🧪 Running {} cases against '{}'", cases.len(), flow.name);
    println!();

    let runner = EvalRunner::new(engine(EnginePolicy::default()));
    let report = runner.run(&flow, &cases).await;

    for case in &report.cases {
        let mark = if case.passed { "✅" } else { "❌" };
        print!("  {} {} ({}ms)", mark, case.name, case.duration_ms);
        if let Some(error) = &case.error {
            print!(" — {}", error);
        }
        println!();
    }

    println!();
    println!(
        "📊 {}/{} passed ({}%)",
        report.passed, report.total, report.pass_rate
    );

    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn validate_flow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let graph: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
    let flow = compile(&graph)?;

    println!("✅ Flow is valid:");
    println!("   Name: {}", flow.name);
    println!("   Entry: {}", flow.entry);
    println!("   Nodes: {}", flow.nodes.len());
    println!("   Edges: {}", flow.edges.len());

    Ok(())
}

fn list_nodes() {
    println!("📦 Available node kinds:");
    println!();

    let mut registry = HandlerRegistry::new();
    loomnodes::register_all(&mut registry);

    let mut kinds: Vec<&str> = registry.kinds().iter().map(|k| k.as_str()).collect();
    kinds.sort_unstable();
    for kind in kinds {
        println!("  • {}", kind);
    }
}
