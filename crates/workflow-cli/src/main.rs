//! `workflowd`: operator CLI and daemon entrypoint for the workflow
//! scheduling engine. Mirrors the split gator's `gator` binary draws
//! between one-shot admin commands and a long-running daemon mode, but
//! has no agent-side task executor or HTTP surface of its own (those are
//! out of scope; see SPEC_FULL.md).

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use workflow_core::{
    AdminApi, AdminConfig, ClientInfo, CreateWorkflowTaskArgs, PlanRegistry, RegistrarSet,
    Scheduler, SchedulerConfig, TracingWarningSink,
};
use workflow_coord::{CoordConfig, CoordStore, EtcdCoordStore, KeySchema, TaskRef};
use workflow_db::config::DbConfig;
use workflow_db::models::WorkflowSelector;
use workflow_db::pool;
use workflow_db::store::{PgRelationalStore, PgTaskCatalog, RelationalStore, TaskCatalog};

#[derive(Parser)]
#[command(name = "workflowd", about = "Cron-driven DAG workflow scheduling engine")]
struct Cli {
    /// Database URL (overrides WORKFLOW_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run pending migrations
    DbInit,
    /// Workflow administration
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Task catalog administration
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
    /// Run the scheduler loop against the installed plans (long-running)
    Serve,
    /// Run an agent's lease-backed registration loop for one project
    /// (long-running)
    Register {
        /// Project this agent serves
        project_id: i64,
        /// IP address to advertise
        #[arg(long)]
        ip: String,
        /// Hostname to advertise
        #[arg(long)]
        hostname: String,
        /// Comma-separated capability tags
        #[arg(long, default_value = "")]
        capabilities: String,
    },
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Create a workflow and grant the creator access to it
    Create {
        user_id: i64,
        workflow_id: i64,
        title: String,
        cron_expr: String,
    },
    /// Update a workflow's title and cron expression
    Update {
        user_id: i64,
        workflow_id: i64,
        title: String,
        cron_expr: String,
    },
    /// Delete a workflow
    Delete { user_id: i64, workflow_id: i64 },
    /// List workflows, optionally filtered by title substring
    List {
        #[arg(long)]
        title_like: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 50)]
        page_size: i64,
    },
    /// List a workflow's task dependency edges
    Tasks { workflow_id: i64 },
    /// Replace a task's dependency set within a workflow
    AddTask {
        user_id: i64,
        workflow_id: i64,
        project_id: i64,
        task_id: i64,
        /// Comma-separated `project_id:task_id` dependency pairs
        #[arg(long, default_value = "")]
        depends_on: String,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Insert or update a task catalog entry
    Upsert {
        project_id: i64,
        task_id: i64,
        name: String,
        payload_kind: String,
    },
}

async fn cmd_db_init(db_config: &DbConfig) -> anyhow::Result<()> {
    println!("Initializing workflow database...");

    pool::ensure_database_exists(db_config).await?;
    let db_pool = pool::create_pool(db_config).await?;
    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("workflowd db-init complete.");
    Ok(())
}

fn parse_depends_on(raw: &str) -> anyhow::Result<Vec<TaskRef>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (project, task) = pair
                .split_once(':')
                .with_context(|| format!("invalid dependency {pair:?}, expected project_id:task_id"))?;
            Ok(TaskRef::new(project.parse()?, task.parse()?))
        })
        .collect()
}

async fn cmd_workflow(command: WorkflowCommands, db_config: &DbConfig) -> anyhow::Result<()> {
    let db_pool = pool::create_pool(db_config).await?;
    let relational: Arc<dyn RelationalStore> = Arc::new(PgRelationalStore::new(db_pool.clone()));
    let catalog: Arc<dyn TaskCatalog> = Arc::new(PgTaskCatalog::new(db_pool.clone()));
    let registry = Arc::new(PlanRegistry::new());
    let api = AdminApi::new(relational, catalog, registry, AdminConfig::from_env());

    match command {
        WorkflowCommands::Create {
            user_id,
            workflow_id,
            title,
            cron_expr,
        } => {
            let workflow = api
                .create_workflow(user_id, workflow_id, &title, &cron_expr)
                .await?;
            println!("created workflow {}: {}", workflow.workflow_id, workflow.title);
        }
        WorkflowCommands::Update {
            user_id,
            workflow_id,
            title,
            cron_expr,
        } => {
            let workflow = api
                .update_workflow(user_id, workflow_id, &title, &cron_expr)
                .await?;
            println!("updated workflow {}: {}", workflow.workflow_id, workflow.title);
        }
        WorkflowCommands::Delete { user_id, workflow_id } => {
            api.delete_workflow(user_id, workflow_id).await?;
            println!("deleted workflow {workflow_id}");
        }
        WorkflowCommands::List {
            title_like,
            page,
            page_size,
        } => {
            let selector = WorkflowSelector { title_like };
            let (workflows, total) = api.get_workflow_list(&selector, page, page_size).await?;
            println!("{total} workflow(s) total, page {page}:");
            for workflow in workflows {
                println!("  {} {} ({})", workflow.workflow_id, workflow.title, workflow.cron_expr);
            }
        }
        WorkflowCommands::Tasks { workflow_id } => {
            let edges = api.get_workflow_tasks(workflow_id).await?;
            for edge in edges {
                match edge.dependency() {
                    Some(dep) => println!("  {} depends on {}", edge.task(), dep),
                    None => println!("  {} (no dependencies)", edge.task()),
                }
            }
        }
        WorkflowCommands::AddTask {
            user_id,
            workflow_id,
            project_id,
            task_id,
            depends_on,
        } => {
            let depends_on = parse_depends_on(&depends_on)?;
            api.create_workflow_task(
                user_id,
                workflow_id,
                vec![CreateWorkflowTaskArgs {
                    project_id,
                    task_id,
                    depends_on,
                }],
            )
            .await?;
            println!("added task {project_id}/{task_id} to workflow {workflow_id}");
        }
    }

    db_pool.close().await;
    Ok(())
}

async fn cmd_catalog(command: CatalogCommands, db_config: &DbConfig) -> anyhow::Result<()> {
    let db_pool = pool::create_pool(db_config).await?;
    match command {
        CatalogCommands::Upsert {
            project_id,
            task_id,
            name,
            payload_kind,
        } => {
            workflow_db::queries::task_catalog::upsert_task(&db_pool, project_id, task_id, &name, &payload_kind)
                .await?;
            println!("upserted task {project_id}/{task_id}: {name}");
        }
    }
    db_pool.close().await;
    Ok(())
}

/// Bring up the scheduler: load every workflow's plan from the relational
/// store, connect to etcd, and run the scheduler loop until ctrl-c.
async fn cmd_serve(db_config: &DbConfig) -> anyhow::Result<()> {
    let db_pool = pool::create_pool(db_config).await?;
    let relational: Arc<dyn RelationalStore> = Arc::new(PgRelationalStore::new(db_pool.clone()));
    let catalog: Arc<dyn TaskCatalog> = Arc::new(PgTaskCatalog::new(db_pool.clone()));
    let registry = Arc::new(PlanRegistry::new());

    let coord_config = CoordConfig::from_env();
    let backend = EtcdCoordStore::connect(&coord_config.endpoints)
        .await
        .context("failed to connect to etcd")?;
    let coord = CoordStore::new(Arc::new(backend));
    let schema = KeySchema::new(coord_config.key_prefix.clone());

    let installed = workflow_core::planbuild::load_all_plans(
        relational.as_ref(),
        catalog.as_ref(),
        &registry,
        &TracingWarningSink,
    )
    .await?;
    tracing::info!(installed, "loaded plans at startup");

    let scheduler = Arc::new(Scheduler::new(
        registry,
        coord,
        schema,
        relational,
        catalog,
        SchedulerConfig::from_env(),
        Arc::new(TracingWarningSink),
    ));

    let cancel = CancellationToken::new();
    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested, stopping scheduler loop");
    cancel.cancel();
    let _ = scheduler_handle.await;

    db_pool.close().await;
    Ok(())
}

async fn cmd_register(
    project_id: i64,
    ip: String,
    hostname: String,
    capabilities: String,
) -> anyhow::Result<()> {
    let coord_config = CoordConfig::from_env();
    let backend = EtcdCoordStore::connect(&coord_config.endpoints)
        .await
        .context("failed to connect to etcd")?;
    let coord = CoordStore::new(Arc::new(backend));
    let schema = KeySchema::new(coord_config.key_prefix.clone());

    let client = ClientInfo {
        project_id,
        ip,
        hostname,
        registered_at: 0,
        capabilities: capabilities
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
    };

    let registrar = RegistrarSet::new(coord, schema, client);
    registrar.add_project(project_id);

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!(project_id, "shutdown requested, deregistering");
    registrar.remove_project(project_id);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db_config = match cli.database_url {
        Some(url) => DbConfig::new(url),
        None => DbConfig::from_env(),
    };

    match cli.command {
        Commands::DbInit => cmd_db_init(&db_config).await?,
        Commands::Workflow { command } => cmd_workflow(command, &db_config).await?,
        Commands::Catalog { command } => cmd_catalog(command, &db_config).await?,
        Commands::Serve => cmd_serve(&db_config).await?,
        Commands::Register {
            project_id,
            ip,
            hostname,
            capabilities,
        } => cmd_register(project_id, ip, hostname, capabilities).await?,
    }

    Ok(())
}
