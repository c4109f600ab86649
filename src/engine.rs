//! Engine assembly.
//!
//! Wires the store, bus, gateway, router, worktree ops, driver, and
//! manager together for one project. Front ends (CLI, tests) construct an
//! `Engine` and talk to `manager`.

use std::path::Path;
use std::sync::Arc;

use crate::config::GyreConfig;
use crate::control::EventLog;
use crate::driver::{DriverConfig, LoopDriver, PromptBuilder};
use crate::error::Result;
use crate::llm::{AnthropicGateway, LlmGateway};
use crate::manager::{GatedGateway, LoopManager, ManagerConfig, RateLimitGate};
use crate::paths::ProjectPaths;
use crate::signals::SignalBus;
use crate::store::Store;
use crate::tools::{Lane, LanePools, ToolCatalog, ToolRouter};
use crate::worktree::{MergeQueue, WorktreeOps};

/// A fully wired engine for one project.
pub struct Engine {
    pub manager: Arc<LoopManager>,
    pub events: Arc<EventLog>,
    pub store: Arc<Store>,
    pub bus: Arc<SignalBus>,
    pub paths: ProjectPaths,
}

impl Engine {
    /// Assemble with the production Anthropic gateway.
    pub fn new(config: &GyreConfig, repo_root: &Path) -> Result<Self> {
        let api_key = config.api_key()?;
        let gateway: Arc<dyn LlmGateway> =
            Arc::new(AnthropicGateway::new(api_key, config.llm.clone()).map_err(crate::error::GyreError::from)?);
        let paths = ProjectPaths::for_repo(repo_root)?;
        Self::with_gateway(config, repo_root, paths, gateway)
    }

    /// Assemble around any gateway (tests inject mocks here).
    pub fn with_gateway(
        config: &GyreConfig,
        repo_root: &Path,
        paths: ProjectPaths,
        gateway: Arc<dyn LlmGateway>,
    ) -> Result<Self> {
        paths.ensure()?;
        let store = Arc::new(Store::open(&paths.store_dir())?);
        let bus = Arc::new(SignalBus::new(store.clone()));
        let events = Arc::new(EventLog::new(store.clone()));

        let gate = Arc::new(RateLimitGate::new());
        let gateway: Arc<dyn LlmGateway> = Arc::new(GatedGateway::new(gateway, gate.clone()));

        let pools = LanePools::new(
            Lane::NoNet.default_concurrency(),
            Lane::Net.default_concurrency(),
            Lane::Heavy.default_concurrency(),
        );
        let router = Arc::new(ToolRouter::new(ToolCatalog::builtin(), pools));

        let worktrees = Arc::new(WorktreeOps::new(
            paths.worktree_base(),
            repo_root,
            config.worktree.clone(),
        ));
        let merges = Arc::new(MergeQueue::new(repo_root));

        let prompts = PromptBuilder::new(config.context.clone(), config.llm.context_window);
        let driver_config = DriverConfig {
            max_tokens: config.llm.max_tokens,
            poll_interval: config.scheduler.poll_interval(),
            on_rebase_conflict: config.worktree.on_rebase_conflict,
            preserve_failed_branches: config.worktree.preserve_failed_branches,
        };
        let driver = Arc::new(LoopDriver::new(
            store.clone(),
            bus.clone(),
            gateway,
            router.clone(),
            worktrees.clone(),
            merges.clone(),
            events.clone(),
            paths.clone(),
            prompts,
            driver_config,
        ));

        let manager = Arc::new(LoopManager::new(
            store.clone(),
            bus.clone(),
            events.clone(),
            driver,
            router,
            worktrees,
            merges,
            paths.clone(),
            gate,
            config.kinds.clone(),
            ManagerConfig::from(config),
        ));

        Ok(Self {
            manager,
            events,
            store,
            bus,
            paths,
        })
    }
}
