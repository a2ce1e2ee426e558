//! Command-line interface for stagegate.
//!
//! The trigger surface of the engine: start a run, submit out-of-band
//! approval decisions, reject or re-trigger artifacts, and inspect state.
//! All commands work against the configured SQLite store, so a run survives
//! across invocations.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::config::{self, DispatcherMode};
use crate::core::{DecisionOutcome, PipelineEngine, StageRegistry};
use crate::dispatch::{HttpDispatcher, ProcessDispatcher, TransformDispatcher};
use crate::domain::Decision;
use crate::store::{PipelineStore, SqliteStore};

/// stagegate - Approval-gated artifact pipeline engine
#[derive(Parser, Debug)]
#[command(name = "stagegate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a pipeline run from a root specification
    Run {
        /// Name for the root artifact (e.g. "Checkout Flow")
        name: String,

        /// JSON content file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Actor recorded as the creator
        #[arg(long, default_value = "cli")]
        created_by: String,
    },

    /// Record a stakeholder decision on an approval request
    Decide {
        /// Approval ID (UUID)
        approval_id: String,

        /// The decision
        #[arg(value_enum)]
        decision: DecisionArg,

        /// Optional comment
        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Explicitly reject an artifact, halting its branch
    Reject {
        /// Artifact ID (UUID)
        artifact_id: String,
    },

    /// Re-trigger the onward transform of a FAILED artifact
    Retry {
        /// Artifact ID (UUID)
        artifact_id: String,
    },

    /// Show an artifact, its approvals and its children
    Status {
        /// Artifact ID (UUID)
        artifact_id: String,
    },

    /// List approval requests for an artifact
    Approvals {
        /// Artifact ID (UUID)
        artifact_id: String,
    },

    /// Show the completion record for a branch parent, if the run finished
    Completion {
        /// Branch-stage artifact ID (UUID)
        parent_id: String,
    },

    /// Print the configured stage table
    Stages,

    /// Show resolved configuration (debug)
    Config,
}

/// Stakeholder decision for the CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DecisionArg {
    Approve,
    Reject,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Approve => Decision::Approved,
            DecisionArg::Reject => Decision::Rejected,
        }
    }
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                name,
                input,
                created_by,
            } => run_pipeline(name, input, created_by).await,
            Commands::Decide {
                approval_id,
                decision,
                comment,
            } => decide(parse_id(&approval_id)?, decision.into(), comment).await,
            Commands::Reject { artifact_id } => reject(parse_id(&artifact_id)?).await,
            Commands::Retry { artifact_id } => retry(parse_id(&artifact_id)?).await,
            Commands::Status { artifact_id } => status(parse_id(&artifact_id)?).await,
            Commands::Approvals { artifact_id } => approvals(parse_id(&artifact_id)?).await,
            Commands::Completion { parent_id } => completion(parse_id(&parent_id)?).await,
            Commands::Stages => stages(),
            Commands::Config => show_config(),
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid UUID: {raw}"))
}

fn open_store() -> Result<Arc<dyn PipelineStore>> {
    let cfg = config::config()?;
    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create home directory: {}", cfg.home.display()))?;
    let store = SqliteStore::open(cfg.db_path())
        .with_context(|| format!("Failed to open database: {}", cfg.db_path().display()))?;
    Ok(Arc::new(store))
}

fn load_registry() -> Result<StageRegistry> {
    let cfg = config::config()?;
    match &cfg.stages_file {
        Some(path) => StageRegistry::from_file(path),
        None => Ok(StageRegistry::default_stages()),
    }
}

fn build_engine() -> Result<PipelineEngine> {
    let cfg = config::config()?;
    let store = open_store()?;
    let registry = load_registry()?;

    let dispatcher: Arc<dyn TransformDispatcher> = match &cfg.dispatcher {
        DispatcherMode::Process => Arc::new(ProcessDispatcher::new(&cfg.processors_dir)),
        DispatcherMode::Http { endpoint } => Arc::new(HttpDispatcher::new(endpoint.clone())),
    };

    Ok(PipelineEngine::new(store, registry, dispatcher)
        .with_retry_policy(cfg.retry.clone())
        .with_dispatch_timeout(Duration::from_secs(cfg.dispatch_timeout_seconds)))
}

async fn run_pipeline(name: String, input: Option<PathBuf>, created_by: String) -> Result<()> {
    let raw = match input {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read input from stdin")?;
            buf
        }
    };

    let content: serde_json::Value =
        serde_json::from_str(&raw).context("Root content must be valid JSON")?;

    let engine = build_engine()?;
    let root = engine.start_run(&name, content, &created_by).await?;

    println!("Started pipeline run");
    println!("  Root artifact: {} ({})", root.id, root.name);
    println!("  Status:        {}", root.status);

    let store = open_store()?;
    for approval in store.list_approvals(root.id).await? {
        println!(
            "  Approval:      {} <- {}",
            approval.id, approval.stakeholder_id
        );
    }

    Ok(())
}

async fn decide(approval_id: Uuid, decision: Decision, comment: Option<String>) -> Result<()> {
    let engine = build_engine()?;
    let outcome = engine.record_decision(approval_id, decision, comment).await?;
    print_outcome(&outcome);
    Ok(())
}

async fn reject(artifact_id: Uuid) -> Result<()> {
    let engine = build_engine()?;
    let artifact = engine.reject_artifact(artifact_id).await?;
    println!("Rejected {} ({})", artifact.id, artifact.name);
    Ok(())
}

async fn retry(artifact_id: Uuid) -> Result<()> {
    let engine = build_engine()?;
    let outcome = engine.retry_artifact(artifact_id).await?;
    print_outcome(&outcome);
    Ok(())
}

async fn status(artifact_id: Uuid) -> Result<()> {
    let store = open_store()?;
    let artifact = store.get_artifact(artifact_id).await?;

    println!("Artifact {}", artifact.id);
    println!("  Name:    {}", artifact.name);
    println!("  Type:    {}", artifact.artifact_type);
    println!("  Status:  {}", artifact.status);
    println!("  Creator: {}", artifact.created_by);
    println!("  Hash:    {}", artifact.content_hash);
    if let Some(parent) = artifact.parent_id {
        println!("  Parent:  {parent}");
    }

    let children = store.children_of(artifact_id).await?;
    if !children.is_empty() {
        println!("  Children:");
        for child in children {
            println!("    {} {} [{}]", child.id, child.artifact_type, child.status);
        }
    }

    Ok(())
}

async fn approvals(artifact_id: Uuid) -> Result<()> {
    let store = open_store()?;
    let approvals = store.list_approvals(artifact_id).await?;

    if approvals.is_empty() {
        println!("No approval requests for {artifact_id}");
        return Ok(());
    }

    for approval in approvals {
        let comment = approval
            .comment
            .as_deref()
            .map(|c| format!(" - {c}"))
            .unwrap_or_default();
        println!(
            "{} {} [{}]{}",
            approval.id, approval.stakeholder_id, approval.status, comment
        );
    }

    Ok(())
}

async fn completion(parent_id: Uuid) -> Result<()> {
    let engine = build_engine()?;
    match engine.completion(parent_id).await? {
        Some(record) => {
            println!("Pipeline completed at {}", record.completed_at);
            println!("  Validation schema: {}", record.validation_schema_id);
            println!("  Storage schema:    {}", record.storage_schema_id);
            println!("  Status:            {}", record.status);
        }
        None => println!("No completion record for {parent_id}"),
    }
    Ok(())
}

fn stages() -> Result<()> {
    let registry = load_registry()?;
    for stage in registry.stages() {
        let successors: Vec<String> = stage.successors.iter().map(|s| s.to_string()).collect();
        println!(
            "{}. {} (approvals: {}, approvers: [{}], transform: {}, successors: [{}])",
            stage.order_index,
            stage.artifact_type,
            stage.required_approvals,
            stage.approvers.join(", "),
            stage.transform.as_deref().unwrap_or("-"),
            successors.join(", "),
        );
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;
    println!("Home:        {}", cfg.home.display());
    println!("Database:    {}", cfg.db_path().display());
    println!(
        "Stages:      {}",
        cfg.stages_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(built-in)".to_string())
    );
    println!("Processors:  {}", cfg.processors_dir.display());
    match &cfg.dispatcher {
        DispatcherMode::Process => println!("Dispatcher:  process"),
        DispatcherMode::Http { endpoint } => println!("Dispatcher:  http ({endpoint})"),
    }
    println!("Timeout:     {}s", cfg.dispatch_timeout_seconds);
    println!(
        "Retry:       {} attempts, {}ms initial delay",
        cfg.retry.max_attempts, cfg.retry.initial_delay_ms
    );
    match &cfg.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none)"),
    }
    Ok(())
}

fn print_outcome(outcome: &DecisionOutcome) {
    match outcome {
        DecisionOutcome::Pending { approved, required } => {
            println!("Recorded; quorum not reached ({approved}/{required} approvals)");
        }
        DecisionOutcome::AlreadyAdvanced => {
            println!("Recorded; artifact was already advanced");
        }
        DecisionOutcome::Advanced { artifact, created } => {
            println!("Artifact {} approved", artifact.id);
            for child in created {
                println!(
                    "  Created {} {} [{}]",
                    child.id, child.artifact_type, child.status
                );
            }
        }
        DecisionOutcome::AwaitingSibling { artifact } => {
            println!(
                "Artifact {} approved; waiting for its sibling to finish",
                artifact.id
            );
        }
        DecisionOutcome::PipelineCompleted { completion } => {
            println!("Pipeline completed!");
            println!("  Validation schema: {}", completion.validation_schema_id);
            println!("  Storage schema:    {}", completion.storage_schema_id);
        }
        DecisionOutcome::Cancelled { artifact } => {
            println!(
                "Artifact {} left APPROVED during dispatch; output discarded",
                artifact.id
            );
        }
    }
}
