use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use taskmesh::Coordinator;
use taskmesh::config::{CoordinatorConfig, load_config_from_yaml};
use taskmesh::dispatch::{Dispatcher, QueueTransport};
use taskmesh::queue::{Task, TaskQueue};
use taskmesh::store::{CoordinationStore, RedisStore};
use taskmesh::worker::{HandlerRegistry, TaskHandler};
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Redis connection URL (overrides the config file)
    #[arg(long, global = true)]
    redis: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node: heartbeat, workers, monitor and cleanup
    Node {
        /// Node id (defaults to the host address)
        #[arg(long)]
        id: Option<String>,
    },

    /// Submit a task
    Enqueue {
        /// Resource the task works on
        resource_key: String,

        #[arg(long, short = 't')]
        task_type: Option<String>,

        /// Trace id grouping this task (random when omitted)
        #[arg(long)]
        trace_id: Option<String>,
    },

    /// Print a page of task statuses as JSON
    Status {
        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = 20)]
        size: usize,
    },

    /// Drop the status index
    Clear,

    /// Re-enqueue tasks still marked WAITING
    Recover,
}

/// Logs each task; stands in for real business handlers.
struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    async fn handle(&self, task: &Task) -> Result<String> {
        info!(
            task_id = %task.task_id,
            resource_key = %task.resource_key,
            task_type = %task.task_type,
            trace_id = %task.trace_id,
            "Handling task"
        );
        Ok(format!("handled {}", task.resource_key))
    }
}

fn load(cli: &Cli) -> Result<CoordinatorConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from_yaml(&path.to_string_lossy())?,
        None => CoordinatorConfig::default(),
    };
    if let Some(url) = &cli.redis {
        config.redis_url = url.clone();
    }
    Ok(config)
}

fn open_store(config: &CoordinatorConfig) -> Result<Arc<dyn CoordinationStore>> {
    let store = RedisStore::open(&config.redis_url)
        .with_context(|| format!("Failed to open redis at {}", config.redis_url))?;
    Ok(Arc::new(store))
}

fn open_queue(config: &CoordinatorConfig) -> Result<Arc<TaskQueue>> {
    let store = open_store(config)?;
    Ok(Arc::new(TaskQueue::new(store, config.key_space(), config.queue.clone())))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let mut config = load(&cli)?;

    match cli.command {
        Commands::Node { id } => {
            if id.is_some() {
                config.node.id = id;
            }
            let store = open_store(&config)?;
            let mut handlers = HandlerRegistry::new();
            handlers.set_fallback(Arc::new(LogHandler));

            let coordinator = Coordinator::new(config, store, handlers, None)?;
            let node = coordinator.start(None).await;
            info!("Node running. Press Ctrl+C to stop.");

            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
            info!("Shutting down...");
            node.shutdown().await;
        }
        Commands::Enqueue {
            resource_key,
            task_type,
            trace_id,
        } => {
            let queue = open_queue(&config)?;
            let dispatcher = Dispatcher::new(Arc::new(QueueTransport::new(queue.clone())), queue);
            let task_type = task_type.unwrap_or_else(|| config.queue.default_task_type.clone());
            let trace_id = trace_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let task = dispatcher.enqueue(&resource_key, &task_type, &trace_id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Commands::Status { page, size } => {
            let queue = open_queue(&config)?;
            let statuses = queue.statuses_paginated(page, size).await?;
            let total = queue.total_status_count().await?;
            let body = serde_json::json!({
                "page": page,
                "size": size,
                "total": total,
                "statuses": statuses,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Clear => {
            open_queue(&config)?.clear_all().await?;
            println!("Status index cleared");
        }
        Commands::Recover => {
            let recovered = open_queue(&config)?.recover_waiting_tasks().await?;
            println!("Recovered {} task(s)", recovered);
        }
    }

    Ok(())
}
