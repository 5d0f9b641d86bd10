use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nephele::agent::NodeAgent;
use nephele::broker::ResourceBroker;
use nephele::config::Config;
use nephele::fetcher::{self, HttpFetcher};
use nephele::job::{Job, JobKind, Task};
use nephele::protocol::{self, JobRequest, NodeRequest};
use nephele::registry::NodeRecord;
use nephele::scheduler::{JobManager, SchedulerServer};
use nephele::storage::SqliteNodeStore;

#[derive(Parser)]
#[command(
    name = "nephele",
    version,
    about = "Edge/fog resource orchestration: liveness registry, lease broker, geo-aware scheduling",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the resource manager (node registry + lease broker)
    ResourceManager,

    /// Run a job scheduler instance
    Scheduler,

    /// Run the node agent
    Agent,

    /// Submit a job to a scheduler
    Submit {
        /// Scheduler job-port address
        #[arg(short, long, default_value = "127.0.0.1:6420")]
        scheduler: String,

        /// Job kind (MOBILE, STREAM, MAPREDUCE)
        #[arg(short, long, default_value = "MOBILE")]
        kind: String,

        /// Command each task runs
        #[arg(long)]
        command: String,

        /// Executable each task launches
        #[arg(long)]
        executable: String,

        /// Number of tasks
        #[arg(short, long, default_value = "1")]
        tasks: u64,

        /// Priority value; lower is scheduled first
        #[arg(short, long)]
        priority: Option<i32>,

        /// Input file URL (repeatable)
        #[arg(long = "input")]
        inputs: Vec<String>,

        /// Stage input URLs into this directory before submitting
        #[arg(long)]
        stage_inputs: Option<PathBuf>,

        /// Job id that must complete first (repeatable)
        #[arg(long = "after")]
        dependencies: Vec<u64>,
    },

    /// Cancel a previously submitted job
    Cancel {
        /// Scheduler job-port address
        #[arg(short, long, default_value = "127.0.0.1:6420")]
        scheduler: String,

        /// Job id returned at submission
        job_id: u64,
    },

    /// List nodes known to the resource manager
    Nodes {
        /// Resource manager node-port address
        #[arg(short, long, default_value = "127.0.0.1:6424")]
        broker: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;

    match cli.command {
        Commands::ResourceManager => resource_manager(config).await?,
        Commands::Scheduler => scheduler(config).await?,
        Commands::Agent => agent(config).await?,

        Commands::Submit {
            scheduler,
            kind,
            command,
            executable,
            tasks,
            priority,
            inputs,
            stage_inputs,
            dependencies,
        } => {
            submit(
                config, scheduler, kind, command, executable, tasks, priority, inputs, stage_inputs,
                dependencies,
            )
            .await?;
        }

        Commands::Cancel { scheduler, job_id } => cancel(config, scheduler, job_id).await?,

        Commands::Nodes { broker } => nodes(config, broker).await?,
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("nephele=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("nephele=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn resource_manager(config: Config) -> Result<()> {
    tracing::info!("resource manager starting");

    let broker = if config.storage.enabled {
        let store = SqliteNodeStore::open(&config.storage.sqlite_path)?;
        ResourceBroker::with_store(config.grid.build(), config.broker, Arc::new(store))
    } else {
        ResourceBroker::new(config.grid.build(), config.broker)
    };

    let handle = broker.start().await?;
    tracing::info!(node_addr = %handle.node_addr, scheduler_addr = %handle.scheduler_addr, "resource manager ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("resource manager shutting down");
    handle.shutdown();
    Ok(())
}

async fn scheduler(config: Config) -> Result<()> {
    tracing::info!(name = %config.scheduler.name, kind = %config.scheduler.kind, "scheduler starting");

    let manager = Arc::new(JobManager::new(config.scheduler.clone())?);
    let server = SchedulerServer::new(manager, config.scheduler);
    let handle = server.start().await?;
    tracing::info!(job_addr = %handle.job_addr, task_addr = %handle.task_addr, "scheduler ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("scheduler shutting down");
    handle.shutdown();
    Ok(())
}

async fn agent(config: Config) -> Result<()> {
    let agent = NodeAgent::new(config.agent)?;
    let handle = agent.start().await?;
    tracing::info!(node_id = %handle.node_id, task_addr = %handle.task_addr, "node agent ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("node agent signing off");
    agent.sign_off(handle.task_addr.port()).await;
    handle.shutdown();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn submit(
    config: Config,
    scheduler: String,
    kind: String,
    command: String,
    executable: String,
    tasks: u64,
    priority: Option<i32>,
    inputs: Vec<String>,
    stage_inputs: Option<PathBuf>,
    dependencies: Vec<u64>,
) -> Result<()> {
    let kind: JobKind = kind.parse().map_err(anyhow::Error::msg)?;

    let input_files = match stage_inputs {
        Some(dir) if !inputs.is_empty() => {
            std::fs::create_dir_all(&dir)?;
            let http = HttpFetcher::new(Duration::from_secs(30))?;
            let staged = fetcher::stage_inputs(&http, &inputs, &dir).await?;
            staged
                .into_iter()
                .map(|path| path.display().to_string())
                .collect()
        }
        _ => inputs,
    };

    let mut job = Job::new(0, kind, command.clone(), executable.clone());
    if let Some(priority) = priority {
        job.priority = priority;
    }
    for dep in dependencies {
        job.add_dependency(dep);
    }
    job.input_files = input_files.clone();
    for task_id in 1..=tasks {
        let mut task = Task::new(task_id, 0, kind, command.clone(), executable.clone());
        // inputs are spread over tasks round-robin
        if !input_files.is_empty() {
            let input = &input_files[(task_id as usize - 1) % input_files.len()];
            task = task.with_input_file(input.clone());
        }
        job.add_task(task);
    }

    let timeout = config.scheduler.io_timeout();
    let id: String = protocol::call(&scheduler, timeout, &JobRequest::Submit { job }).await?;
    println!("Job submitted: id={id}");
    Ok(())
}

async fn cancel(config: Config, scheduler: String, job_id: u64) -> Result<()> {
    let timeout = config.scheduler.io_timeout();
    let reply: String = protocol::call(&scheduler, timeout, &JobRequest::Cancel { job_id }).await?;
    if reply == "true" {
        println!("Job {job_id} cancelled");
    } else {
        println!("Job {job_id} not found");
    }
    Ok(())
}

async fn nodes(config: Config, broker: String) -> Result<()> {
    let timeout = config.broker.io_timeout();
    let nodes: HashMap<String, NodeRecord> = protocol::call(&broker, timeout, &NodeRequest::Get).await?;

    if nodes.is_empty() {
        println!("No nodes online");
        return Ok(());
    }
    println!("{} node(s) online", nodes.len());
    let mut ids: Vec<_> = nodes.keys().collect();
    ids.sort();
    for id in ids {
        let record = &nodes[id];
        println!(
            "  {id}  {}  {}  ({:.4}, {:.4})  lease={}",
            record.kind,
            record.task_addr(),
            record.latitude,
            record.longitude,
            record.note.as_deref().unwrap_or("unknown"),
        );
    }
    Ok(())
}
