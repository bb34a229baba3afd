use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser};
use serde_json::{json, Value};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use session_sync::cli::Cli;
use session_sync::config::Config;
use session_sync::connectivity::ConnectivityMonitor;
use session_sync::context::SyncContext;
use session_sync::notify::{ConsoleNotifier, Notifier};
use session_sync::queue::{Arguments, Queue, QueueOps};
use session_sync::remote::ApiClient;
use session_sync::sync::{SyncError, SyncOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("session-sync v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if cli.user_agent {
        println!(
            "{}",
            session_sync::user_agent::generate_user_agent(cli.client.as_deref())
        );
        return Ok(());
    }

    let has_action = cli.call.is_some()
        || cli.sync_now
        || cli.queue_count
        || cli.list_queue
        || cli.clear_queue
        || cli.watch;
    if !has_action {
        eprintln!("Error: no action given");
        eprintln!();
        eprintln!("{}", Cli::command().render_help());
        process::exit(1);
    }

    let json_output = cli.is_json_output();

    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        process::exit(1);
    });

    let log_file = match &cli.log_file {
        Some(path) => Some(Config::resolve_path(path)?),
        None => config.get_log_path()?,
    };
    let _guard = session_sync::logger::setup_logging_with_options(
        cli.verbose || config.debug,
        json_output,
        log_file,
    )
    .unwrap_or_else(|e| {
        eprintln!("Failed to setup logging: {}", e);
        process::exit(1);
    });

    let queue: Arc<dyn QueueOps> = Arc::new(open_queue(&config, &cli)?);

    if cli.queue_count {
        let count = queue.count()?;
        if json_output {
            println!("{}", json!({ "queue_depth": count }));
        } else {
            println!("{}", count);
        }
        return Ok(());
    }

    if cli.list_queue {
        return list_queue(queue.as_ref(), json_output);
    }

    if cli.clear_queue {
        let removed = queue.clear()?;
        if json_output {
            println!("{}", json!({ "cleared": removed }));
        } else {
            println!("Cleared {} queued operations", removed);
        }
        return Ok(());
    }

    let timeout = Duration::from_secs(cli.timeout.unwrap_or(config.timeout));
    let client = ApiClient::with_timeout(config.get_api_url(cli.api_url.as_ref()), timeout)?
        .with_api_key(config.get_api_key(cli.key.as_ref()))
        .with_client(cli.client.as_deref());

    let connectivity = if cli.offline {
        ConnectivityMonitor::pinned_offline()
    } else {
        ConnectivityMonitor::detect(&client).await
    };
    tracing::debug!(online = connectivity.is_online(), "Connectivity at startup");

    let notifier: Arc<dyn Notifier> = if json_output {
        Arc::new(ConsoleNotifier::quiet())
    } else {
        Arc::new(ConsoleNotifier::new())
    };

    let context = SyncContext::from_config(&config, &client, queue, connectivity, notifier);

    if let Some(operation_name) = &cli.call {
        let arguments = parse_arguments(cli.args.as_deref())?;
        return call_operation(&context, operation_name, arguments, json_output).await;
    }

    if cli.sync_now {
        return sync_now(&context, json_output).await;
    }

    if cli.watch {
        return watch(&context, Arc::new(client)).await;
    }

    Ok(())
}

fn open_queue(config: &Config, cli: &Cli) -> Result<Queue> {
    let queue = match config.get_queue_path(cli.queue_file.as_ref())? {
        Some(path) => Queue::with_path(path.clone())
            .with_context(|| format!("Failed to open queue at {}", path.display()))?,
        None => Queue::new().context("Failed to open queue")?,
    };
    Ok(queue)
}

/// Parse `--args`, which must be a JSON object
fn parse_arguments(raw: Option<&str>) -> Result<Arguments> {
    let Some(raw) = raw else {
        return Ok(Arguments::new());
    };

    match serde_json::from_str::<Value>(raw).context("Invalid --args JSON")? {
        Value::Object(arguments) => Ok(arguments),
        other => Err(anyhow!("--args must be a JSON object, got {}", other)),
    }
}

fn list_queue(queue: &dyn QueueOps, json_output: bool) -> Result<()> {
    let entries = queue.list_all()?;

    if json_output {
        println!("{}", serde_json::to_string(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    println!("Queued operations ({}):", entries.len());
    for entry in &entries {
        println!(
            "  {}  {}  retries={}  queued_at={}",
            entry.id,
            entry.operation_name,
            entry.retry_count,
            entry.enqueued_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn call_operation(
    context: &SyncContext,
    operation_name: &str,
    arguments: Arguments,
    json_output: bool,
) -> Result<()> {
    let gate = context.gate(operation_name)?;

    match gate.call(arguments).await? {
        Some(result) => {
            if json_output {
                println!("{}", json!({ "status": "applied", "result": result }));
            } else {
                println!("{} applied: {}", operation_name, result);
            }
        }
        None => {
            let depth = context.orchestrator().indicator().queue_depth;
            if json_output {
                println!("{}", json!({ "status": "queued", "queue_depth": depth }));
            } else {
                println!(
                    "{} queued for later sync ({} pending)",
                    operation_name, depth
                );
            }
        }
    }
    Ok(())
}

async fn sync_now(context: &SyncContext, json_output: bool) -> Result<()> {
    match context.orchestrator().sync_queue().await {
        Ok(SyncOutcome::Completed(report)) => {
            if json_output {
                println!("{}", json!({ "status": "completed", "report": report }));
            } else {
                println!(
                    "Sync completed: {} synced, {} failed, {} discarded ({} total)",
                    report.succeeded, report.failed, report.discarded, report.total
                );
            }
            Ok(())
        }
        Ok(SyncOutcome::Skipped(reason)) => {
            if json_output {
                println!(
                    "{}",
                    json!({ "status": "skipped", "reason": reason.to_string() })
                );
            } else {
                println!("Sync skipped: {}", reason);
            }
            Ok(())
        }
        Err(SyncError::UnknownOperations { operations, report }) => {
            if json_output {
                println!(
                    "{}",
                    json!({ "status": "error", "unknown_operations": operations, "report": report })
                );
            }
            Err(anyhow!(
                "Sync left {} operations with no registered handler: {}",
                operations.len(),
                operations.join(", ")
            ))
        }
        Err(e) => Err(e.into()),
    }
}

async fn watch(context: &SyncContext, client: Arc<ApiClient>) -> Result<()> {
    let cancel = CancellationToken::new();
    let handles = context.spawn_background(client, cancel.clone());
    let mut depth = context.orchestrator().subscribe_queue_depth();

    tracing::info!(
        queue_size = *depth.borrow_and_update(),
        online = context.connectivity().is_online(),
        "Watching for connectivity changes"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            changed = depth.changed() => {
                if changed.is_err() {
                    break;
                }
                let indicator = context.orchestrator().indicator();
                println!(
                    "queue_depth={} online={} syncing={}",
                    indicator.queue_depth, indicator.online, indicator.is_syncing
                );
            }
        }
    }

    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    Ok(())
}
