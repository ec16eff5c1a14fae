//! voxrun CLI - submit, watch and control queued tasks.

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use voxrun_client::{
    ChainStep, CleaningBackend, CleaningOptions, CleaningPipeline, CleaningPreset, ClientConfig,
    HttpTaskService, QueueController, SubmitRequest, TaskObserver, TaskService,
};
use voxrun_core::{QueueTab, Task, TaskId, TaskKind};
use voxrun_inference::{ChatCompletionsEngine, InferenceProxy, ModelState};

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// voxrun CLI - Task queue and cleaning tool
#[derive(Parser)]
#[command(name = "voxrun")]
#[command(about = "CLI for the voxrun task queue", long_about = None)]
struct Cli {
    /// Queue service address
    #[arg(short, long, default_value = voxrun_client::config::DEFAULT_BASE_URL)]
    addr: String,

    /// Session id sent with every request
    #[arg(long)]
    session: Option<String>,

    /// Ask the service for a task's status when its progress stream drops
    #[arg(long)]
    verify_on_disconnect: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task
    Submit {
        /// Task kind (tts, url_fetch, summarize, audiobook, cleaning, batch)
        #[arg(short, long)]
        kind: TaskKind,

        /// Payload JSON
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Priority, 1 (first) to 10
        #[arg(long, default_value_t = voxrun_core::DEFAULT_PRIORITY)]
        priority: i32,

        /// Tasks that must complete first
        #[arg(long = "after")]
        dependencies: Vec<String>,

        /// Follow the task until it finishes
        #[arg(short, long)]
        watch: bool,
    },

    /// Submit dependent steps, each as KIND=JSON
    Chain {
        #[arg(required = true)]
        steps: Vec<String>,
    },

    /// List tasks on a queue tab
    List {
        #[arg(short, long, default_value = "active")]
        tab: QueueTab,
    },

    /// Show queue statistics
    Stats,

    /// Follow a task until it finishes
    Watch {
        /// Task ID
        id: String,
    },

    /// Cancel a task
    Cancel {
        /// Task ID
        id: String,
    },

    /// Pause a running task
    Pause {
        /// Task ID
        id: String,
    },

    /// Resume a paused task
    Resume {
        /// Task ID
        id: String,
    },

    /// Delete a finished task
    Delete {
        /// Task ID
        id: String,
    },

    /// Set the order of pending tasks
    Reorder {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Remove finished tasks
    #[command(name = "clear-completed")]
    ClearCompleted,

    /// Clean text from a file or stdin
    Clean {
        /// Input file; reads stdin when omitted
        file: Option<String>,

        /// Cleaning preset
        #[arg(long, default_value = "ocr_cleanup")]
        preset: CleaningPreset,

        /// Prompt for the custom preset
        #[arg(long)]
        prompt: Option<String>,

        /// Clean locally instead of on the service
        #[arg(long)]
        local: bool,

        /// Model to load for local cleaning
        #[arg(long, default_value = "qwen2.5-1.5b-instruct")]
        model: String,

        /// OpenAI-compatible server for local cleaning
        #[arg(long, default_value = voxrun_inference::DEFAULT_ENGINE_URL)]
        engine_url: String,

        /// Only clean the first characters
        #[arg(long)]
        preview: bool,
    },
}

/// Prints progress lines to stderr.
struct Printer;

#[async_trait]
impl TaskObserver for Printer {
    async fn on_progress(&self, fraction: f64, message: &str) {
        eprintln!("[{:>3.0}%] {}", fraction * 100.0, message);
    }

    async fn on_error(&self, message: &str) {
        eprintln!("Failed: {}", message);
    }
}

#[tokio::main]
async fn main() -> CliResult {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    let mut config = ClientConfig::new(cli.addr).with_verify_on_disconnect(cli.verify_on_disconnect);
    if let Some(session) = cli.session {
        config = config.with_session_id(session);
    }
    let service: Arc<dyn TaskService> = Arc::new(HttpTaskService::new(&config)?);
    let controller = Arc::new(QueueController::new(config, Arc::clone(&service)));

    match cli.command {
        Commands::Submit {
            kind,
            payload,
            priority,
            dependencies,
            watch,
        } => {
            let request = SubmitRequest::new(kind, serde_json::from_str(&payload)?)
                .with_priority(priority)
                .with_dependencies(dependencies.into_iter().map(TaskId::from).collect());
            let id = controller.submit(request).await?;
            println!("Task submitted: {}", id);
            if watch {
                watch_task(&controller, &id).await?;
            }
        }
        Commands::Chain { steps } => {
            let steps = steps
                .iter()
                .map(|step| parse_step(step))
                .collect::<CliResult<Vec<_>>>()?;
            let ids = controller.submit_chain(steps).await?;
            println!("Chain submitted ({} steps):", ids.len());
            for id in ids {
                println!("  {}", id);
            }
        }
        Commands::List { tab } => {
            controller.refresh().await?;
            list_tasks(&controller, tab).await;
        }
        Commands::Stats => {
            let stats = service.stats().await?;
            for tab in QueueTab::all() {
                println!("{:<10} {}", tab.name(), stats.count_for(*tab));
            }
            println!("{:<10} {}", "In queue", stats.total_active);
        }
        Commands::Watch { id } => {
            let id = TaskId::from(id);
            controller.track(&id).await?;
            watch_task(&controller, &id).await?;
        }
        Commands::Cancel { id } => {
            service.cancel(&TaskId::from(id.as_str())).await?;
            println!("Task cancelled: {}", id);
        }
        Commands::Pause { id } => {
            service.pause(&TaskId::from(id.as_str())).await?;
            println!("Task paused: {}", id);
        }
        Commands::Resume { id } => {
            service.resume(&TaskId::from(id.as_str())).await?;
            println!("Task resumed: {}", id);
        }
        Commands::Delete { id } => {
            let id = TaskId::from(id);
            controller.track(&id).await?;
            controller.delete(&id).await?;
            println!("Task deleted: {}", id);
        }
        Commands::Reorder { ids } => {
            let ids: Vec<TaskId> = ids.into_iter().map(TaskId::from).collect();
            service.reorder(&ids).await?;
            println!("Queue reordered ({} tasks)", ids.len());
        }
        Commands::ClearCompleted => {
            let cleared = controller.clear_completed().await?;
            println!("Cleared {} tasks", cleared);
        }
        Commands::Clean {
            file,
            preset,
            prompt,
            local,
            model,
            engine_url,
            preview,
        } => {
            let text = read_input(file.as_deref())?;
            let options = match prompt {
                Some(prompt) => CleaningOptions::custom(prompt),
                None => CleaningOptions::new(preset),
            };

            let backend = if local {
                CleaningBackend::Local(load_local_model(&engine_url, &model).await?)
            } else {
                CleaningBackend::Remote(Arc::clone(&controller))
            };
            let pipeline = CleaningPipeline::new(backend, options)
                .with_registry(Arc::clone(controller.registry()));
            let on_progress = |fraction: f64, message: &str| {
                eprintln!("[{:>3.0}%] {}", fraction * 100.0, message);
            };

            let cleaned = if preview {
                pipeline.preview(&text, &on_progress).await?
            } else {
                pipeline.clean(&text, &on_progress).await?
            };
            println!("{}", cleaned);
        }
    }

    Ok(())
}

async fn watch_task(controller: &QueueController, id: &TaskId) -> CliResult {
    let task = controller.observe(id, &Printer).await?;
    println!();
    print_task(&task);
    Ok(())
}

async fn load_local_model(engine_url: &str, model: &str) -> CliResult<Arc<InferenceProxy>> {
    let proxy = Arc::new(InferenceProxy::spawn(Arc::new(ChatCompletionsEngine::new(
        engine_url,
    ))));
    let mut states = proxy.subscribe();
    proxy.load(model)?;

    loop {
        let state = states.borrow_and_update().clone();
        match state {
            ModelState::Ready { model_id } => {
                info!(model = %model_id, "Model ready");
                break;
            }
            ModelState::Failed { error, .. } => return Err(error.into()),
            ModelState::Loading { progress, text, .. } => {
                eprintln!("[{:>3.0}%] {}", progress * 100.0, text);
            }
            ModelState::Idle => {}
        }
        states.changed().await?;
    }
    Ok(proxy)
}

fn parse_step(raw: &str) -> CliResult<ChainStep> {
    let (kind, payload) = raw.split_once('=').unwrap_or((raw, "{}"));
    Ok(ChainStep::new(kind.parse()?, serde_json::from_str(payload)?))
}

fn read_input(file: Option<&str>) -> CliResult<String> {
    match file {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

async fn list_tasks(controller: &QueueController, tab: QueueTab) {
    let tasks = controller.list(tab).await;

    println!("{} ({}):", tab.name(), tasks.len());
    println!(
        "{:<36}  {:<10}  {:<10}  {:>4}  {:>5}  {}",
        "ID", "KIND", "STATUS", "PRIO", "DONE", "CREATED"
    );
    println!("{}", "-".repeat(90));

    for task in tasks {
        println!(
            "{:<36}  {:<10}  {:<10}  {:>4}  {:>4.0}%  {}",
            task.id.as_str(),
            task.kind.as_str(),
            task.status.as_str(),
            task.priority,
            task.progress * 100.0,
            format_timestamp(&task.created_at)
        );
    }
}

fn print_task(task: &Task) {
    println!("  ID:         {}", task.id);
    println!("  Kind:       {}", task.kind);
    println!("  Status:     {}", task.status);
    println!("  Created:    {}", format_timestamp(&task.created_at));

    if let Some(result) = &task.result {
        println!("  Result:     {}", result);
    }
    if let Some(error) = &task.error_message {
        println!("  Error:      {}", error);
    }
    if !task.dependencies.is_empty() {
        let deps: Vec<&str> = task.dependencies.iter().map(TaskId::as_str).collect();
        println!("  After:      {}", deps.join(", "));
    }
}

fn format_timestamp(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}
