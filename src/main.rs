use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strata_core::config::AppConfig;
use strata_core::types::{ApprovalDecision, ExecutionStatus, ExecutionSummary, TenantStatus, WaitReason};
use strata_core::workflow::WorkflowDefinition;
use strata_engine::{HttpJobClient, WorkflowEngine};
use strata_tenancy::{ExecutionTablesInitializer, SqliteExecutionStore, TenantRegistry, TenantUpdate};

#[derive(Parser)]
#[command(name = "strata", version, about = "Multi-tenant workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strata.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow to completion
    Run {
        /// Workflow definition (.json or .toml)
        workflow: PathBuf,
        /// Tenant to run as (defaults to tenancy.default_tenant)
        #[arg(long)]
        tenant: Option<String>,
        /// Trigger payload as JSON, or @path to read it from a file
        #[arg(long)]
        trigger: Option<String>,
        /// Approve pending approvals without prompting
        #[arg(long, short = 'y')]
        yes: bool,
        /// Print stream events to stderr as SSE frames
        #[arg(long)]
        watch: bool,
    },
    /// Validate a workflow definition without running it
    Validate {
        workflow: PathBuf,
    },
    /// Decide a pending approval request
    Approve {
        /// Request id or unique prefix
        request: String,
        #[arg(long)]
        tenant: Option<String>,
        /// Deny instead of approve
        #[arg(long)]
        deny: bool,
        /// Who decided
        #[arg(long, default_value = "cli")]
        by: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Re-check steps waiting on external jobs
    Poll {
        execution_id: String,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Show an execution's status
    Status {
        execution_id: String,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Manage tenants
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum TenantAction {
    /// Create a tenant and its schema
    Create {
        tenant_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Show one tenant
    Get { tenant_id: String },
    /// List tenants
    List {
        /// Only tenants with this status (active, inactive)
        #[arg(long)]
        status: Option<String>,
    },
    /// Change a tenant's name, description, or metadata
    Update {
        tenant_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        metadata: Option<String>,
    },
    Activate { tenant_id: String },
    Deactivate { tenant_id: String },
    /// Delete a tenant
    Delete {
        tenant_id: String,
        /// Also remove the tenant's schema and data
        #[arg(long)]
        drop_schema: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "strata", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Validate { workflow } => validate(&config, &workflow),
        Commands::Tenant { action } => handle_tenant(&config, action),
        Commands::Run {
            workflow,
            tenant,
            trigger,
            yes,
            watch,
        } => {
            let (registry, engine) = open_engine(&config)?;
            let workflow = WorkflowDefinition::load(&workflow)?;
            let trigger = parse_trigger(trigger.as_deref())?;
            let summary = registry
                .run_as(tenant.as_deref(), run(&engine, workflow, trigger, yes, watch))
                .await??;
            print_json(&summary)
        }
        Commands::Approve {
            request,
            tenant,
            deny,
            by,
            comment,
        } => {
            let (registry, engine) = open_engine(&config)?;
            let decision = ApprovalDecision {
                decided_by: by,
                payload: None,
                comment,
            };
            let resolution = registry
                .run_as(tenant.as_deref(), async {
                    let id = engine
                        .approvals()
                        .find_by_prefix(&request)
                        .await?
                        .with_context(|| format!("no approval request matching '{}'", request))?;
                    anyhow::Ok(engine.decide_approval(&id, decision, !deny).await?)
                })
                .await??;
            println!(
                "Request {} {}",
                resolution.request.id, resolution.request.status
            );
            match resolution.execution {
                Some(summary) => print_json(&summary),
                None => {
                    println!("Decision handed to the external orchestrator");
                    Ok(())
                }
            }
        }
        Commands::Poll {
            execution_id,
            tenant,
        } => {
            let (registry, engine) = open_engine(&config)?;
            let summary = registry
                .run_as(tenant.as_deref(), engine.poll(&execution_id))
                .await??;
            print_json(&summary)
        }
        Commands::Status {
            execution_id,
            tenant,
        } => {
            let (registry, engine) = open_engine(&config)?;
            let summary = registry
                .run_as(tenant.as_deref(), engine.get_execution(&execution_id))
                .await??;
            print_json(&summary)
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

fn open_registry(config: &AppConfig) -> anyhow::Result<TenantRegistry> {
    Ok(TenantRegistry::open(&config.tenancy)?.with_initializer(ExecutionTablesInitializer))
}

fn open_engine(config: &AppConfig) -> anyhow::Result<(TenantRegistry, WorkflowEngine)> {
    let registry = open_registry(config)?;
    let store = Arc::new(SqliteExecutionStore::new(registry.pool().clone()));
    let mut builder = WorkflowEngine::builder(config.clone()).with_store(store);
    if let Some(jobs) = &config.jobs {
        info!(base_url = %jobs.base_url, "External job client enabled");
        builder = builder.with_job_client(Arc::new(HttpJobClient::from_config(jobs)?));
    }
    Ok((registry, builder.build()))
}

fn validate(config: &AppConfig, path: &Path) -> anyhow::Result<()> {
    let workflow = WorkflowDefinition::load(path)?;
    let engine = WorkflowEngine::new(config.clone());
    let normalized = engine.validate_workflow(workflow)?;
    println!(
        "Workflow '{}' is valid ({} steps)",
        normalized.workflow_id,
        normalized.steps.len()
    );
    for step in &normalized.steps {
        println!("  {} [{}]", step.step_id, step.kind.as_str());
    }
    Ok(())
}

fn parse_trigger(raw: Option<&str>) -> anyhow::Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading trigger file {}", path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("trigger is not valid JSON")
}

/// Drive a workflow, prompting for approvals until it stops waiting on them.
async fn run(
    engine: &WorkflowEngine,
    workflow: WorkflowDefinition,
    trigger: Value,
    yes: bool,
    watch: bool,
) -> anyhow::Result<ExecutionSummary> {
    let cancel = CancellationToken::new();
    if watch {
        let mut events = engine.streams().subscribe_all();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => eprint!("{}", event.to_sse()),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Stream watcher lagged");
                        }
                        Err(_) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    let mut summary = engine.execute(workflow, trigger).await?;
    while summary.status == ExecutionStatus::Waiting
        && summary.wait_reason == Some(WaitReason::Approval)
    {
        let pending: Vec<_> = engine
            .approvals()
            .pending_requests()
            .await?
            .into_iter()
            .filter(|r| r.execution_id == summary.execution_id)
            .collect();
        if pending.is_empty() {
            break;
        }
        for request in pending {
            println!("\nApproval required for step '{}'", request.step_id);
            println!("  {}", request.prompt);
            let approved = if yes {
                true
            } else {
                tokio::task::spawn_blocking(|| {
                    dialoguer::Confirm::new()
                        .with_prompt("Approve?")
                        .default(true)
                        .interact()
                        .unwrap_or(false)
                })
                .await?
            };
            let decision = ApprovalDecision {
                decided_by: "cli".to_string(),
                payload: None,
                comment: None,
            };
            let resolution = engine.decide_approval(&request.id, decision, approved).await?;
            if let Some(next) = resolution.execution {
                summary = next;
            }
        }
    }

    if summary.status == ExecutionStatus::Waiting {
        println!(
            "Execution {} is waiting ({}); continue with `strata poll` or `strata approve`",
            summary.execution_id,
            summary.wait_reason.map(|r| r.as_str()).unwrap_or("unknown")
        );
    }
    cancel.cancel();
    Ok(summary)
}

fn parse_metadata(raw: Option<&str>) -> anyhow::Result<Option<Value>> {
    raw.map(|m| serde_json::from_str(m).context("metadata is not valid JSON"))
        .transpose()
}

fn handle_tenant(config: &AppConfig, action: TenantAction) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    match action {
        TenantAction::Create {
            tenant_id,
            name,
            description,
            metadata,
        } => {
            let metadata = parse_metadata(metadata.as_deref())?.unwrap_or(Value::Object(Default::default()));
            let name = name.unwrap_or_else(|| tenant_id.clone());
            let tenant = registry.create_tenant(&tenant_id, &name, description.as_deref(), metadata)?;
            print_json(&tenant)
        }
        TenantAction::Get { tenant_id } => {
            let tenant = registry
                .get_tenant(&tenant_id)?
                .with_context(|| format!("tenant '{}' not found", tenant_id))?;
            print_json(&tenant)
        }
        TenantAction::List { status } => {
            let status = status
                .map(|s| s.parse::<TenantStatus>())
                .transpose()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let tenants = registry.list_tenants(status)?;
            if tenants.is_empty() {
                println!("No tenants.");
            }
            for tenant in tenants {
                println!(
                    "{:<24} {:<10} {}",
                    tenant.tenant_id, tenant.status, tenant.schema_name
                );
            }
            Ok(())
        }
        TenantAction::Update {
            tenant_id,
            name,
            description,
            metadata,
        } => {
            let update = TenantUpdate {
                name,
                description,
                metadata: parse_metadata(metadata.as_deref())?,
            };
            let tenant = registry.update_tenant(&tenant_id, update)?;
            print_json(&tenant)
        }
        TenantAction::Activate { tenant_id } => {
            registry.activate_tenant(&tenant_id)?;
            println!("Tenant '{}' activated", tenant_id);
            Ok(())
        }
        TenantAction::Deactivate { tenant_id } => {
            registry.deactivate_tenant(&tenant_id)?;
            println!("Tenant '{}' deactivated", tenant_id);
            Ok(())
        }
        TenantAction::Delete {
            tenant_id,
            drop_schema,
        } => {
            registry.delete_tenant(&tenant_id, drop_schema)?;
            println!("Tenant '{}' deleted", tenant_id);
            Ok(())
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
