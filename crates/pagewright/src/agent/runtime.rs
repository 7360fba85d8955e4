//! Process-wide collaborators shared by every controller.
//!
//! The breaker table, compaction statistics and discovery index live here as
//! explicit instances rather than globals. Build one [`Runtime`] per process
//! (or per test) and hand a reference to each
//! [`Controller`](super::controller::Controller).

use std::sync::Arc;

use crate::ChatModel;
use crate::agent::checkpoint::CheckpointManager;
use crate::agent::session::SessionStore;
use crate::context::compaction::{CompactionConfig, CompactionEngine, CompactionStats};
use crate::tools::breaker::BreakerStatus;
use crate::tools::core::ToolSet;
use crate::tools::discovery::ToolDiscoveryIndex;
use crate::tools::recovery::ErrorRecoveryManager;

pub struct Runtime {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolSet>,
    recovery: Arc<ErrorRecoveryManager>,
    compaction: Arc<CompactionEngine>,
    checkpoints: CheckpointManager,
    discovery: Option<Arc<ToolDiscoveryIndex>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("tools", &self.tools)
            .field("discovery", &self.discovery)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// A runtime with default recovery and compaction. The chat model also
    /// writes compaction summaries.
    pub fn new(model: Arc<dyn ChatModel>, tools: ToolSet, store: Arc<dyn SessionStore>) -> Self {
        let compaction = CompactionEngine::new(CompactionConfig::default()).with_summarizer(model.clone());
        Self {
            model,
            tools: Arc::new(tools),
            recovery: Arc::new(ErrorRecoveryManager::default()),
            compaction: Arc::new(compaction),
            checkpoints: CheckpointManager::new(store),
            discovery: None,
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<ErrorRecoveryManager>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionEngine) -> Self {
        self.compaction = Arc::new(compaction);
        self
    }

    pub fn with_discovery(mut self, index: Arc<ToolDiscoveryIndex>) -> Self {
        self.discovery = Some(index);
        self
    }

    pub fn model(&self) -> &dyn ChatModel {
        self.model.as_ref()
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn recovery(&self) -> &ErrorRecoveryManager {
        &self.recovery
    }

    pub fn compaction(&self) -> &CompactionEngine {
        &self.compaction
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        self.checkpoints.store()
    }

    pub fn discovery(&self) -> Option<&ToolDiscoveryIndex> {
        self.discovery.as_deref()
    }

    /// Snapshot of every tracked circuit breaker.
    pub fn breaker_status(&self) -> Vec<BreakerStatus> {
        self.recovery.breakers().status()
    }

    /// Compaction statistics for one session.
    pub fn compaction_stats(&self, session_id: &str) -> Option<CompactionStats> {
        self.compaction.stats(session_id)
    }
}
