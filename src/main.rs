use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::{Map, Value};
use std::sync::Arc;

use runbook_rs::runbook::catalog::FsCatalog;
use runbook_rs::runbook::run::{RunCoordinator, RunEvent, RunStatus};
use runbook_rs::runbook::runner::HttpRunner;
use runbook_rs::runbook::server::{serve, AppState};
use runbook_rs::runbook::store::{FsStore, Store};
use runbook_rs::runbook::workflow::graph::{reconstruct, validate};
use runbook_rs::runbook::workflow::loader::WorkflowLoader;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Directory for persisted workflows and runs
        #[arg(long, default_value = "data")]
        data_dir: String,

        /// Directory of YAML action specs
        #[arg(long, default_value = "actions")]
        actions_dir: String,

        /// Endpoint of the external action runner
        #[arg(long, default_value = "http://127.0.0.1:9090")]
        runner_url: String,
    },
    /// Import a workflow file and execute it
    Run {
        /// Path to the workflow YAML file
        #[arg(short, long)]
        file: String,

        /// Chain parameters as name=value pairs
        #[arg(short = 'P', long = "param")]
        params: Vec<String>,

        /// Directory for persisted workflows and runs
        #[arg(long, default_value = "data")]
        data_dir: String,

        /// Endpoint of the external action runner
        #[arg(long, default_value = "http://127.0.0.1:9090")]
        runner_url: String,
    },
    /// Validate a workflow file and print every problem found
    Validate {
        /// Path to the workflow YAML file
        #[arg(short, long)]
        file: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            data_dir,
            actions_dir,
            runner_url,
        } => {
            tracing_subscriber::fmt::init();

            let store: Arc<dyn Store> = Arc::new(FsStore::new(&data_dir)?);
            let catalog = match FsCatalog::load_dir(&actions_dir) {
                Ok(catalog) => {
                    log::info!("loaded {} actions from {}", catalog.len(), actions_dir);
                    catalog
                }
                Err(e) => {
                    log::warn!(
                        "no action catalog at {} ({}); starting empty",
                        actions_dir,
                        e
                    );
                    FsCatalog::new()
                }
            };
            let coordinator = Arc::new(RunCoordinator::new(
                store.clone(),
                Arc::new(HttpRunner::new(runner_url)),
            ));
            let state = AppState {
                store,
                catalog: Arc::new(catalog),
                coordinator,
            };
            serve(port, state).await?;
        }
        Commands::Run {
            file,
            params,
            data_dir,
            runner_url,
        } => {
            env_logger::init();

            let def = WorkflowLoader::new().load_workflow(&file)?;
            let store: Arc<dyn Store> = Arc::new(FsStore::new(&data_dir)?);
            store.save_workflow(&def)?;

            let coordinator =
                RunCoordinator::new(store.clone(), Arc::new(HttpRunner::new(runner_url)));

            let (tx, mut rx) = tokio::sync::mpsc::channel(100);
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        RunEvent::StepStarted { label, index, .. } => {
                            println!("[{}] {} ...", index, label)
                        }
                        RunEvent::StepProgress { data, .. } => println!("    {}", data),
                        RunEvent::StepFinished { status, .. } => println!("    -> {:?}", status),
                        RunEvent::ApprovalRequired { label, .. } => {
                            println!("    waiting for approval: {}", label)
                        }
                        _ => {}
                    }
                }
            });

            let run = coordinator
                .start(&def.id, parse_params(&params)?, Map::new(), Some(tx))
                .await?;
            printer.await.ok();

            println!();
            println!("Run {} finished: {:?}", run.id, run.status);
            for result in &run.step_results {
                let error = result
                    .error
                    .as_deref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default();
                println!(
                    "  {} [{:?}] {}ms{}",
                    result.label, result.status, result.duration_ms, error
                );
            }
            if let Some(reason) = &run.reason {
                println!("Reason: {}", reason);
            }
            if run.status == RunStatus::WaitingApproval {
                println!(
                    "Run is paused; resume it with the API: POST /api/runs/{}/resume",
                    run.id
                );
            }
        }
        Commands::Validate { file } => {
            env_logger::init();

            let def = WorkflowLoader::new().load_workflow(&file)?;
            let graph = reconstruct(&def.steps, def.layout.as_ref());
            let issues = validate(&def.name, &graph, None);
            if issues.is_empty() {
                println!("{}: OK ({} steps)", def.name, def.steps.len());
            } else {
                println!("{}: {} problem(s)", def.name, issues.len());
                for issue in &issues {
                    match &issue.node_id {
                        Some(node) => println!("  [{}] {} ({})", issue.code, issue.message, node),
                        None => println!("  [{}] {}", issue.code, issue.message),
                    }
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn parse_params(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) => {
                map.insert(key.trim().to_string(), Value::String(value.to_string()));
            }
            None => anyhow::bail!("parameter '{}' is not in name=value form", pair),
        }
    }
    Ok(map)
}
