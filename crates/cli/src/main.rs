mod config;
mod logging;
mod render;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use db::PlanRepository;
use events::EventBus;
use installer_core::{OperationKey, OperationKind, Plan};
use orchestrator::services::{Kubectl, LocalApplications, SqliteOperator};
use orchestrator::{
    ExecutionMode, ExecutorRegistry, ExecutorSettings, FsmConfig, FsmEngine, InstallPlanner,
    PlanRequest, RetryPolicy, RunSummary, Services,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use storage_check::{StorageChecker, StorageConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use config::{EngineArgs, InstallConfig, Mode, StorageArgs};
use render::ProgressView;

const APP_DIR: &str = "cluster-installer";
const DB_FILE: &str = "installer.db";
const LOG_FILE: &str = "installer.log";
const BIN: &str = "cluster-installer";

#[derive(Parser)]
#[command(name = "cluster-installer")]
#[command(about = "Install and upgrade clusters by executing a persisted operation plan", long_about = None)]
#[command(version)]
struct Cli {
    /// Print informational messages on the console
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Operation database [default: <data dir>/cluster-installer/installer.db]
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// System log file, rewritten on every run [default: <data dir>/cluster-installer/installer.log]
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run a new install operation
    Install(InstallConfig),
    /// Plan and run an upgrade of an installed cluster
    Upgrade(InstallConfig),
    /// Show the phases of an operation
    Plan(OperationArgs),
    /// Continue an operation from where it stopped
    Resume {
        #[command(flatten)]
        operation: OperationArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Execute a single phase
    Execute {
        #[command(flatten)]
        operation: OperationArgs,
        #[command(flatten)]
        engine: EngineArgs,
        #[arg(long)]
        phase: String,
    },
    /// Roll back an operation, or a single phase of it
    Rollback {
        #[command(flatten)]
        operation: OperationArgs,
        #[command(flatten)]
        engine: EngineArgs,
        #[arg(long)]
        phase: Option<String>,
    },
    /// Archive a completed or rolled back operation
    Complete {
        #[command(flatten)]
        operation: OperationArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Verify a volume against storage requirements
    CheckStorage(StorageArgs),
}

/// Selects an active operation.
#[derive(Debug, Clone, Args)]
struct OperationArgs {
    #[arg(long)]
    cluster: Option<String>,

    #[arg(long)]
    operation_id: Option<Uuid>,
}

impl OperationArgs {
    fn hint(key: &OperationKey) -> String {
        format!("--cluster {} --operation-id {}", key.cluster, key.operation_id)
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = data_dir();
    let log_file = cli.log_file.clone().unwrap_or_else(|| data_dir.join(LOG_FILE));

    let guard = match logging::init(&log_file, cli.verbose) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            return ExitCode::FAILURE;
        }
    };

    let code = match run(cli, &data_dir).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "Command failed");
            eprintln!("{} {err:#}", style("error:").red().bold());
            eprintln!("See {} for details.", guard.path().display());
            ExitCode::FAILURE
        }
    };
    drop(guard);
    code
}

async fn run(cli: Cli, data_dir: &Path) -> Result<ExitCode> {
    let db_path = cli.db.unwrap_or_else(|| data_dir.join(DB_FILE));

    match cli.command {
        Commands::Install(config) => start(OperationKind::Install, config, &db_path).await,
        Commands::Upgrade(config) => start(OperationKind::Upgrade, config, &db_path).await,
        Commands::Plan(operation) => {
            let installer = Installer::open(&db_path).await?;
            let plan = installer.find_plan(&operation).await?;
            println!("Operation {} ({}): {}", plan.key(), plan.kind().as_str(), plan.state());
            println!();
            print!("{}", render::plan_table(&plan));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Resume { operation, mut engine } => {
            engine.resolve()?;
            let installer = Installer::open(&db_path).await?;
            let plan = installer.find_plan(&operation).await?;
            let fsm = installer.engine(&engine)?;
            installer.drive(&fsm, plan.key(), engine.mode).await
        }
        Commands::Execute {
            operation,
            mut engine,
            phase,
        } => {
            engine.resolve()?;
            let installer = Installer::open(&db_path).await?;
            let plan = installer.find_plan(&operation).await?;
            let fsm = installer.engine(&engine)?;
            let view = ProgressView::start(&installer.bus, engine.mode == Mode::Interactive);
            let summary = fsm.execute_phase(plan.key(), &phase).await;
            view.finish().await;
            Ok(exit_code(report(&summary?)))
        }
        Commands::Rollback {
            operation,
            mut engine,
            phase,
        } => {
            engine.resolve()?;
            let installer = Installer::open(&db_path).await?;
            let plan = installer.find_plan(&operation).await?;
            let fsm = installer.engine(&engine)?;
            let view = ProgressView::start(&installer.bus, engine.mode == Mode::Interactive);
            let result = match &phase {
                Some(id) => fsm.rollback_phase(plan.key(), id).await.map(|()| None),
                None => fsm.rollback(plan.key()).await.map(Some),
            };
            view.finish().await;
            match result? {
                Some(state) => println!("Operation {} is {state}", plan.key()),
                None => println!("Rolled back {}", phase.unwrap_or_default()),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Complete {
            operation,
            mut engine,
        } => {
            engine.resolve()?;
            let installer = Installer::open(&db_path).await?;
            let plan = installer.find_plan(&operation).await?;
            installer
                .engine(&engine)?
                .archive(plan.key())
                .await
                .context("resume or roll the operation back before completing it")?;
            println!("Operation {} archived", plan.key());
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckStorage(storage) => check_storage(storage).await,
    }
}

/// Plan a new operation and, unless in manual mode, run it.
async fn start(kind: OperationKind, mut config: InstallConfig, db_path: &Path) -> Result<ExitCode> {
    config.check_and_set_defaults().await?;
    let installer = Installer::open(db_path).await?;

    if let Some(active) = installer.plans.find_active(config.cluster()).await? {
        bail!(
            "operation {} is still active on cluster {}, resume it or archive it with `{BIN} complete`",
            active.key(),
            config.cluster()
        );
    }

    let request = PlanRequest {
        key: OperationKey::new(config.cluster()),
        kind,
        servers: config.servers.clone(),
        package: config.package().await?,
        service_user: config.service_user(),
        resources: config.resources().await?,
        dns: config.dns_config()?,
        storage: config.storage.requirement(),
    };
    let plan = InstallPlanner::plan(request)?;
    let engine = installer.engine(&config.engine)?;
    let plan = engine.create(plan).await?;
    let key = plan.key().clone();

    println!(
        "Created {} operation {key} with {} phases",
        kind.as_str(),
        plan.phases().len()
    );
    if kind == OperationKind::Install {
        if let Some(token) = &config.token {
            println!("Nodes join with token {token}");
        }
    }

    if config.engine.mode == Mode::Manual {
        println!();
        print!("{}", render::plan_table(&plan));
        println!();
        println!("Execute phases in order with:");
        println!("  {BIN} execute {} --phase <phase>", OperationArgs::hint(&key));
        println!("or run the rest of the plan with:");
        println!("  {BIN} resume {}", OperationArgs::hint(&key));
        return Ok(ExitCode::SUCCESS);
    }
    installer.drive(&engine, &key, config.engine.mode).await
}

async fn check_storage(args: StorageArgs) -> Result<ExitCode> {
    let Some(path) = args.path else {
        bail!("--storage-path is required");
    };
    let checker = StorageChecker::new(StorageConfig {
        path,
        will_be_created: args.will_be_created,
        filesystems: args.filesystems,
        min_free_bytes: args.min_free_bytes,
        min_bytes_per_second: args.min_bytes_per_second,
    });

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());
    let probes = checker.probes(&cancel).await;

    let mut failed = false;
    for probe in &probes {
        if probe.is_failed() {
            failed = true;
            println!("{} {probe}", style("✗").red());
        } else {
            println!("{} {probe}", style("✓").green());
        }
    }
    Ok(exit_code(!failed))
}

fn watch_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
}

/// Operation storage and the event bus shared by the commands.
struct Installer {
    plans: PlanRepository,
    operator: Arc<SqliteOperator>,
    bus: EventBus,
    cancel: CancellationToken,
}

impl Installer {
    async fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let database_url = format!("sqlite:{}", db_path.display());
        let pool = db::create_pool(&database_url)
            .await
            .context("Failed to create database pool")?;
        db::run_migrations(&pool).await?;
        info!(db = %db_path.display(), "Operation database opened");

        let cancel = CancellationToken::new();
        watch_interrupt(cancel.clone());
        Ok(Self {
            plans: PlanRepository::new(pool.clone()),
            operator: Arc::new(SqliteOperator::new(pool)),
            bus: EventBus::new(),
            cancel,
        })
    }

    fn engine(&self, args: &EngineArgs) -> Result<FsmEngine> {
        let kube = Arc::new(Kubectl::new(args.kubeconfig.clone()));
        let services = Services::new(
            self.operator.clone(),
            Arc::new(LocalApplications::new(args.state_dir()?)),
            kube.clone(),
            kube,
            ExecutorSettings::new(args.write_state_dir()?),
        );
        let config = FsmConfig {
            mode: match args.mode {
                Mode::Manual => ExecutionMode::Manual,
                Mode::Automatic | Mode::Interactive => ExecutionMode::Automatic,
            },
            max_parallel: args.max_parallel,
            failure_policy: args.failure_policy,
            execute_retry: RetryPolicy::once(),
        };
        Ok(FsmEngine::new(
            services,
            Arc::new(ExecutorRegistry::with_builtin()),
            self.bus.clone(),
            config,
        )
        .with_cancel(self.cancel.clone()))
    }

    /// The one active operation matching `args`.
    async fn find_plan(&self, args: &OperationArgs) -> Result<Plan> {
        let mut plans: Vec<Plan> = self
            .plans
            .find_all()
            .await?
            .into_iter()
            .filter(|plan| args.cluster.as_ref().map_or(true, |c| plan.key().cluster == *c))
            .filter(|plan| args.operation_id.map_or(true, |id| plan.key().operation_id == id))
            .collect();
        match plans.len() {
            0 => bail!("no active operation found, start one with `{BIN} install`"),
            1 => Ok(plans.remove(0)),
            _ => {
                let keys: Vec<String> = plans.iter().map(|plan| plan.key().to_string()).collect();
                bail!(
                    "several operations are active ({}), pick one with --cluster or --operation-id",
                    keys.join(", ")
                )
            }
        }
    }

    async fn drive(&self, engine: &FsmEngine, key: &OperationKey, mode: Mode) -> Result<ExitCode> {
        let view = ProgressView::start(&self.bus, mode == Mode::Interactive);
        let summary = engine.run(key).await;
        view.finish().await;
        Ok(exit_code(report(&summary?)))
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Print the outcome of a run with the commands to continue from here.
///
/// Returns whether the run succeeded.
fn report(summary: &RunSummary) -> bool {
    let key = &summary.key;
    if summary.is_success() {
        if summary.state.is_terminal() {
            println!("{} Operation {key} is {}", style("✓").green(), summary.state);
            println!("Archive it with: {BIN} complete {}", OperationArgs::hint(key));
        } else {
            println!("Operation {key} is {}", summary.state);
            println!("Continue with: {BIN} resume {}", OperationArgs::hint(key));
        }
        return true;
    }

    for failure in &summary.failures {
        eprintln!("{} {failure}", style("✗").red());
    }
    if summary.failures.iter().any(|failure| failure.is_cancelled()) {
        eprintln!("The operation was interrupted.");
    }
    eprintln!();
    eprintln!("Fix the cause and retry with: {BIN} resume {}", OperationArgs::hint(key));
    eprintln!("or undo the operation with:   {BIN} rollback {}", OperationArgs::hint(key));
    false
}
