//! Application lifecycle hooks.

use async_trait::async_trait;
use installer_core::{Locator, OperationKey, OperationKind, PhaseKind, Server, ServiceUser};
use std::sync::Arc;
use tracing::info;

use crate::core::{check_master_server, ExecContext, ExecutorParams, PhaseExecutor};
use crate::error::Result;
use crate::log_pipe::LogPipe;
use crate::progress::ProgressReporter;
use crate::services::{Applications, HookRequest, HookType, Operator, Services};

/// Hooks run for an operation kind, in order.
pub fn hooks_for(operation: OperationKind) -> [HookType; 2] {
    match operation {
        OperationKind::Install => [HookType::Install, HookType::Installed],
        OperationKind::Upgrade => [HookType::Update, HookType::Updated],
    }
}

/// Runs the package hooks of the operation.
///
/// Hook output goes through a [`LogPipe`] into the operation log. A hook the
/// package does not ship is skipped.
pub struct AppExecutor {
    key: OperationKey,
    hooks: [HookType; 2],
    package: Locator,
    service_user: ServiceUser,
    server: Option<Server>,
    servers: Vec<Server>,
    apps: Arc<dyn Applications>,
    operator: Arc<dyn Operator>,
    progress: ProgressReporter,
}

impl AppExecutor {
    pub fn new(params: ExecutorParams, services: &Services) -> Result<Self> {
        let service_user = params.require_service_user()?;
        let package = params.require_package()?;
        Ok(Self {
            hooks: hooks_for(params.operation),
            server: params.server().cloned(),
            key: params.key,
            package,
            service_user,
            servers: params.servers,
            apps: Arc::clone(&services.apps),
            operator: Arc::clone(&services.operator),
            progress: params.progress,
        })
    }

    async fn run_hook(&self, ctx: &ExecContext, hook: HookType) -> Result<()> {
        let req = HookRequest {
            application: self.package.clone(),
            hook,
            service_user: self.service_user.clone(),
        };
        match self.apps.check_has_app_hook(&req).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                info!(hook = %hook, app = %self.package, "Application has no hook, skipping");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        self.progress
            .next_step(format!("Running {hook} hook of {}", self.package));
        let mut pipe = LogPipe::start(
            self.key.clone(),
            Arc::clone(&self.operator),
            self.progress.clone(),
        );
        let result = self
            .apps
            .stream_app_hook(&ctx.cancel, &req, pipe.writer())
            .await;
        pipe.close().await;
        result
    }
}

#[async_trait]
impl PhaseExecutor for AppExecutor {
    fn kind(&self) -> PhaseKind {
        PhaseKind::App
    }

    async fn pre_check(&self, _ctx: &ExecContext) -> Result<()> {
        check_master_server(self.server.as_ref(), &self.servers)
    }

    async fn execute(&self, ctx: &ExecContext) -> Result<()> {
        for hook in self.hooks {
            self.run_hook(ctx, hook).await?;
        }
        Ok(())
    }

    async fn rollback(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }
}
