//! Executor factories keyed by phase kind.

use async_trait::async_trait;
use installer_core::PhaseKind;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::phases;
use crate::services::Services;

use super::phase::{ExecutorParams, PhaseExecutor};

/// Builds a bound executor for one phase invocation.
///
/// Construction validates the phase parameters, so a missing package or
/// service user fails before anything runs.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn build(
        &self,
        params: ExecutorParams,
        services: &Services,
    ) -> Result<Box<dyn PhaseExecutor>>;
}

#[async_trait]
impl<F> ExecutorFactory for F
where
    F: Fn(ExecutorParams, &Services) -> Result<Box<dyn PhaseExecutor>> + Send + Sync,
{
    async fn build(
        &self,
        params: ExecutorParams,
        services: &Services,
    ) -> Result<Box<dyn PhaseExecutor>> {
        self(params, services)
    }
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    factories: HashMap<PhaseKind, Arc<dyn ExecutorFactory>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in executor of every phase kind.
    pub fn with_builtin() -> Self {
        let builtin: Arc<dyn ExecutorFactory> = Arc::new(BuiltinExecutors);
        let mut registry = Self::new();
        for kind in PhaseKind::ALL {
            registry.factories.insert(kind, Arc::clone(&builtin));
        }
        registry
    }

    /// Register `factory` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: PhaseKind, factory: impl ExecutorFactory + 'static) {
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn contains(&self, kind: PhaseKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub async fn build(
        &self,
        params: ExecutorParams,
        services: &Services,
    ) -> Result<Box<dyn PhaseExecutor>> {
        let kind = params.phase.kind;
        let factory = self.factories.get(&kind).ok_or_else(|| {
            OrchestratorError::BadParameter(format!("no executor registered for phase kind {kind}"))
        })?;
        factory.build(params, services).await
    }
}

/// Factory for the executors shipped with the installer.
struct BuiltinExecutors;

#[async_trait]
impl ExecutorFactory for BuiltinExecutors {
    async fn build(
        &self,
        params: ExecutorParams,
        services: &Services,
    ) -> Result<Box<dyn PhaseExecutor>> {
        let executor: Box<dyn PhaseExecutor> = match params.phase.kind {
            PhaseKind::Checks => Box::new(phases::ChecksExecutor::new(params)?),
            PhaseKind::Dns => Box::new(phases::DnsExecutor::new(params, services)?),
            PhaseKind::Wait => Box::new(phases::WaitExecutor::new(params, services)),
            PhaseKind::Nodes => Box::new(phases::NodesExecutor::new(params, services).await?),
            PhaseKind::Rbac => Box::new(phases::RbacExecutor::new(params, services)?),
            PhaseKind::Resources => Box::new(phases::ResourcesExecutor::new(params, services)?),
            PhaseKind::App => Box::new(phases::AppExecutor::new(params, services)?),
        };
        Ok(executor)
    }
}
