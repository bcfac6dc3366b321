use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use strand_core::{
    get_builtin_tools, InMemoryWorkQueue, LocalSandbox, OpenAiCompatLlm, ProviderConfig,
    RunOrchestrator, ToolRegistry, TracingUsageRecorder,
};
use strand_stores::{initialize_stores, InMemoryAccountDirectory};
use strand_types::{RunSubmission, RuntimeConfig, StoreConfig, WorkQueue};
use tokio::io::AsyncBufReadExt;

/// Work-queue consumer: reads run-submission envelopes (one JSON object per
/// line on stdin) and drives each run to a terminal state.
#[derive(Parser, Debug)]
#[command(name = "strand-worker")]
struct Cli {
    /// Root directory for the local sandbox; enables the sandbox tool set.
    #[arg(long)]
    sandbox_root: Option<PathBuf>,

    /// Exit after the first submission instead of draining stdin.
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let level = std::env::var("STRAND_LOG").unwrap_or_else(|_| "info".to_string());
    strand_core::logging::init_logging(&level);
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let runtime_config = RuntimeConfig::from_env();
    let store_config = StoreConfig::from_env();

    let directory = Arc::new(InMemoryAccountDirectory::new());
    let stores = initialize_stores(&store_config, &runtime_config, directory).await?;

    let provider_config = ProviderConfig::from_env(&runtime_config.default_model);
    let llm = Arc::new(OpenAiCompatLlm::new(
        provider_config,
        Arc::new(TracingUsageRecorder),
    ));
    let tools = Arc::new(ToolRegistry::with_tools(get_builtin_tools(
        cli.sandbox_root.is_some(),
    ))?);

    let mut orchestrator = RunOrchestrator::new(
        stores.message_store,
        stores.pubsub,
        tools,
        llm,
        runtime_config,
    );
    if let Some(root) = &cli.sandbox_root {
        orchestrator = orchestrator.with_sandbox(Arc::new(LocalSandbox::new(root.clone())));
    }
    let orchestrator = Arc::new(orchestrator);
    tracing::info!(instance_id = %orchestrator.instance_id(), "worker ready");

    // Envelopes arrive on stdin (one JSON object per line) and flow through
    // the work-queue seam; a durable queue drops in behind the same trait.
    let queue = Arc::new(InMemoryWorkQueue::new());

    let consumer = {
        let queue = queue.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut workers = Vec::new();
            while let Ok(Some(submission)) = queue.pop().await {
                tracing::info!(run_id = %submission.agent_run_id, "accepted run submission");
                workers.push(orchestrator.spawn_run(submission));
            }
            for worker in workers {
                let _ = worker.await;
            }
        })
    };

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RunSubmission>(line) {
            Ok(submission) => queue.push(submission).await?,
            Err(e) => tracing::warn!("skipping malformed submission: {e}"),
        }
        if cli.once {
            break;
        }
    }

    queue.close();
    let _ = consumer.await;
    orchestrator.run_registry().shutdown();
    Ok(())
}
