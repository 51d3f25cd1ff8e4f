//! Context orchestrator
//!
//! Per-session coordinator over the active context, session history,
//! compression pipeline, checkpoint aging and snapshots. It owns the
//! single-compression-in-flight guard and walks the emergency ladder:
//!
//! ```text
//! over threshold or >= 80%  -> compression pass
//! >= 95% after that         -> emergency pass (fewer kept messages, no retry)
//! >= 100% after that        -> snapshot, then roll over to the newest message
//! ```
//!
//! Public operations never return raw errors; collaborator failures are
//! converted into the `success: false` / `error` fields of their results.

use super::active::ActiveContextStore;
use super::aging::CheckpointLifecycle;
use super::emergency::{EmergencyAction, EmergencyLadder, UsageLevel};
use super::history::SessionHistoryLog;
use super::models::{CheckpointSummary, Goal, Message, SessionHistory, Snapshot, SnapshotReason, TokenCount};
use super::pipeline::{CompressionPipeline, NoopProgress, PassOptions, PassOutcome, PipelineError, ProgressSink};
use super::snapshots::SnapshotManager;
use super::summarizer::{SummarizationService, Summarizer};
use super::tier::{BudgetError, ContextTier, TierPolicy};
use crate::config::Config;
use crate::error::{ContextError, ErrorKind, Result};
use crate::metrics::METRICS;
use crate::provider::{ChatMessage, ModelProvider};
use crate::storage::BlobStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const IN_FLIGHT_REASON: &str = "compression already in progress";

/// Builds the system prompt text for a mode
///
/// The engine treats the result as an opaque string.
pub trait SystemPromptBuilder: Send + Sync {
    fn build(&self, mode: &str, tier: ContextTier, allowed_tools: &[String]) -> Result<String>;
}

/// Collaborators a session is wired to
#[derive(Clone)]
pub struct SessionDeps {
    pub provider: Arc<dyn ModelProvider>,
    pub blob_store: Arc<dyn BlobStore>,
    /// Defaults to a [`SummarizationService`] over `provider`
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub prompt_builder: Option<Arc<dyn SystemPromptBuilder>>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl SessionDeps {
    pub fn new(provider: Arc<dyn ModelProvider>, blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            provider,
            blob_store,
            summarizer: None,
            prompt_builder: None,
            progress: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_prompt_builder(mut self, builder: Arc<dyn SystemPromptBuilder>) -> Self {
        self.prompt_builder = Some(builder);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Error as reported in operation results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ContextError> for ErrorReport {
    fn from(e: &ContextError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<ContextError> for ErrorReport {
    fn from(e: ContextError) -> Self {
        Self::from(&e)
    }
}

/// Result of [`ContextOrchestrator::add_message`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddMessageResult {
    pub success: bool,
    pub compression_triggered: bool,
    pub tokens_freed: Option<usize>,
    pub action: EmergencyAction,
    /// Fraction of the provider limit in use after the call
    pub usage: f64,
    pub reason: Option<String>,
    /// Snapshot taken by an emergency rollover
    pub snapshot_id: Option<String>,
    pub error: Option<ErrorReport>,
}

/// Result of [`ContextOrchestrator::compress`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressResult {
    pub success: bool,
    pub freed_tokens: Option<usize>,
    pub reason: Option<String>,
    /// Emergency handling that followed a failed pass
    pub action: EmergencyAction,
    pub error: Option<ErrorReport>,
}

/// Result of [`ContextOrchestrator::handle_emergency`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyResult {
    pub success: bool,
    pub action: EmergencyAction,
    pub tokens_freed: Option<usize>,
    pub snapshot_id: Option<String>,
    pub reason: Option<String>,
    pub error: Option<ErrorReport>,
}

/// Result of operations with no payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub error: Option<ErrorReport>,
}

impl OperationResult {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(e: impl Into<ErrorReport>) -> Self {
        Self {
            success: false,
            error: Some(e.into()),
        }
    }
}

impl From<Result<()>> for OperationResult {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(e),
        }
    }
}

/// Result of [`ContextOrchestrator::create_snapshot`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResult {
    pub success: bool,
    pub snapshot_id: Option<String>,
    pub error: Option<ErrorReport>,
}

/// Budget usage for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub total: usize,
    pub provider_limit: usize,
    pub threshold: usize,
    pub fraction: f64,
    pub level: UsageLevel,
    pub tier: ContextTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rung {
    Normal,
    Emergency,
}

/// What a walk up the ladder did
#[derive(Debug, Default)]
struct LadderOutcome {
    attempted: bool,
    action: Option<EmergencyAction>,
    freed: usize,
    snapshot_id: Option<String>,
    reason: Option<String>,
    storage_error: Option<ContextError>,
}

impl LadderOutcome {
    fn record_failure(&mut self, error: PipelineError) {
        self.reason = Some(error.reason().to_string());
        if let PipelineError::Storage(e) = error {
            self.storage_error = Some(e.into());
        }
    }

    fn action(&self) -> EmergencyAction {
        self.action.unwrap_or(EmergencyAction::None)
    }
}

/// Clears the in-flight flag when dropped
struct CompressionGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for CompressionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Per-session context coordinator
pub struct ContextOrchestrator {
    session_id: String,
    config: Config,
    policy: TierPolicy,
    ladder: EmergencyLadder,
    store: Arc<RwLock<ActiveContextStore>>,
    history: Arc<Mutex<SessionHistoryLog>>,
    snapshots: SnapshotManager,
    pipeline: CompressionPipeline,
    lifecycle: CheckpointLifecycle,
    prompt_builder: Option<Arc<dyn SystemPromptBuilder>>,
    progress: Arc<dyn ProgressSink>,
    compressing: AtomicBool,
    generation: AtomicU32,
    cancel: CancellationToken,
}

impl ContextOrchestrator {
    /// Start a new session
    ///
    /// Fails only when the configuration is invalid, the system prompt does
    /// not fit the budget, or storage is unavailable.
    pub async fn start(
        session_id: impl Into<String>,
        system_prompt: impl Into<String>,
        config: Config,
        deps: SessionDeps,
    ) -> Result<Self> {
        config.validate()?;
        let session_id = session_id.into();
        let policy = TierPolicy::new(config.budget.clone());
        let budget = policy.resolve(config.provider.context_window);
        let store = ActiveContextStore::new(system_prompt, budget, deps.provider.estimator())?;
        let history = SessionHistoryLog::create(&session_id, Arc::clone(&deps.blob_store)).await?;

        info!(
            "Started session {} on {} (window {}, limit {}, threshold {})",
            session_id,
            budget.tier,
            budget.window_size,
            budget.provider_limit,
            store.threshold()
        );
        Ok(Self::assemble(session_id, config, policy, deps, store, history, 0))
    }

    /// Resume a session from storage
    ///
    /// The active context comes from the latest snapshot, with messages
    /// logged after it replayed on top. Without a snapshot, the whole
    /// history is replayed under `system_prompt`.
    pub async fn resume(
        session_id: impl Into<String>,
        system_prompt: impl Into<String>,
        config: Config,
        deps: SessionDeps,
    ) -> Result<Self> {
        config.validate()?;
        let session_id = session_id.into();
        let policy = TierPolicy::new(config.budget.clone());
        let budget = policy.resolve(config.provider.context_window);
        let history = SessionHistoryLog::open(&session_id, Arc::clone(&deps.blob_store)).await?;
        let mut store = ActiveContextStore::new(system_prompt, budget, deps.provider.estimator())?;

        let snapshots = SnapshotManager::new(
            &session_id,
            Arc::clone(&deps.blob_store),
            config.snapshots.clone(),
        );
        let replay_from = match snapshots.latest_resume_base().await? {
            Some(snapshot) => {
                info!("Resuming session {} from snapshot {}", session_id, snapshot.id);
                store.restore(snapshot.active_context)?;
                snapshot.history_cursor.message_count
            }
            None => 0,
        };

        let messages = &history.get_history().messages;
        for message in messages.iter().skip(replay_from) {
            store.add_message(message.clone());
        }
        let generation = store
            .checkpoints()
            .iter()
            .map(|c| c.compression_generation)
            .max()
            .unwrap_or(0);

        info!(
            "Resumed session {}: {} checkpoints, {} recent messages, {} tokens",
            session_id,
            store.checkpoints().len(),
            store.recent_messages().len(),
            store.token_count().total
        );
        Ok(Self::assemble(session_id, config, policy, deps, store, history, generation))
    }

    fn assemble(
        session_id: String,
        config: Config,
        policy: TierPolicy,
        deps: SessionDeps,
        store: ActiveContextStore,
        history: SessionHistoryLog,
        generation: u32,
    ) -> Self {
        let summarizer: Arc<dyn Summarizer> = match deps.summarizer {
            Some(summarizer) => summarizer,
            None => Arc::new(SummarizationService::new(
                Arc::clone(&deps.provider),
                config.summarizer.clone(),
            )),
        };
        let progress: Arc<dyn ProgressSink> = match deps.progress {
            Some(progress) => progress,
            None => Arc::new(NoopProgress),
        };
        let store = Arc::new(RwLock::new(store));
        let history = Arc::new(Mutex::new(history));

        let pipeline = CompressionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&history),
            Arc::clone(&summarizer),
            config.compression.clone(),
        );
        let lifecycle = CheckpointLifecycle::new(
            Arc::clone(&store),
            Arc::clone(&history),
            summarizer,
            config.aging.clone(),
        );
        let snapshots = SnapshotManager::new(
            &session_id,
            Arc::clone(&deps.blob_store),
            config.snapshots.clone(),
        );

        Self {
            session_id,
            ladder: EmergencyLadder::new(config.emergency.clone()),
            config,
            policy,
            store,
            history,
            snapshots,
            pipeline,
            lifecycle,
            prompt_builder: deps.prompt_builder,
            progress,
            compressing: AtomicBool::new(false),
            generation: AtomicU32::new(generation),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current compression generation
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether a compression pass is running
    pub fn is_compressing(&self) -> bool {
        self.compressing.load(Ordering::Acquire)
    }

    /// Cancel any in-flight model call; later passes fail as cancelled
    pub fn shutdown(&self) {
        info!("Shutting down session {}", self.session_id);
        self.cancel.cancel();
    }

    fn try_begin_compression(&self) -> Option<CompressionGuard<'_>> {
        self.compressing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CompressionGuard {
                flag: &self.compressing,
            })
    }

    /// Record a message and keep the context within budget
    ///
    /// Returns once the context is consistent and budget-checked; the next
    /// model request must not be sent before this completes.
    pub async fn add_message(&self, message: Message) -> AddMessageResult {
        let mut message = message;
        message.token_count = self.store.read().await.count_tokens(&message.content);

        let mut storage_error: Option<ContextError> = None;
        if let Err(e) = self.history.lock().await.append_message(&message).await {
            error!(
                "Failed to persist message {} for session {}: {}",
                message.id, self.session_id, e
            );
            storage_error = Some(e.into());
        }

        let over_threshold = self.store.write().await.add_message(message);
        let usage = self.usage_fraction().await;
        let level = self.ladder.classify(usage);
        METRICS
            .active_tokens
            .set(self.store.read().await.token_count().total as i64);

        let mut result = AddMessageResult {
            success: true,
            compression_triggered: false,
            tokens_freed: None,
            action: EmergencyAction::None,
            usage,
            reason: None,
            snapshot_id: None,
            error: None,
        };

        if level >= UsageLevel::Warning {
            warn!(
                "Session {} at {:.1}% of provider limit ({})",
                self.session_id,
                usage * 100.0,
                level
            );
            if level == UsageLevel::Warning {
                METRICS.emergency_actions.with_label_values(&["warning"]).inc();
                result.action = EmergencyAction::Warned;
            }
        }

        if over_threshold || level >= UsageLevel::Compress {
            match self.try_begin_compression() {
                None => {
                    debug!("Compression requested while one is in flight");
                    result.reason = Some(IN_FLIGHT_REASON.to_string());
                }
                Some(_guard) => {
                    let start = if level >= UsageLevel::Emergency {
                        Rung::Emergency
                    } else {
                        Rung::Normal
                    };
                    let outcome = self.escalate(start, None).await;
                    result.compression_triggered = outcome.attempted;
                    result.tokens_freed = Some(outcome.freed);
                    if outcome.action.is_some() {
                        result.action = outcome.action();
                    }
                    result.snapshot_id = outcome.snapshot_id;
                    result.reason = outcome.reason;
                    if storage_error.is_none() {
                        storage_error = outcome.storage_error;
                    }
                }
            }
        }

        result.usage = self.usage_fraction().await;
        let error = storage_error.or(self.over_limit_error().await);
        if let Some(e) = error {
            result.success = false;
            result.error = Some(e.into());
        }
        result
    }

    /// Run a compression pass on demand
    pub async fn compress(&self, goal: Option<Goal>) -> CompressResult {
        let Some(_guard) = self.try_begin_compression() else {
            return CompressResult {
                success: false,
                freed_tokens: None,
                reason: Some(IN_FLIGHT_REASON.to_string()),
                action: EmergencyAction::None,
                error: Some(ContextError::CompressionInFlight(self.session_id.clone()).into()),
            };
        };

        let before = self.store.read().await.token_count().total;
        let mut outcome = LadderOutcome::default();
        let pass = self
            .compress_pass(self.pass_options(Rung::Normal, goal.clone()), &mut outcome)
            .await;

        let mut result = CompressResult {
            success: true,
            freed_tokens: None,
            reason: None,
            action: EmergencyAction::None,
            error: None,
        };

        match pass {
            Ok(PassOutcome::Compressed(_)) => {}
            Ok(PassOutcome::Skipped { qualifying }) => {
                result.reason = Some(format!(
                    "only {} messages qualify for compression",
                    qualifying
                ));
            }
            Err(e) => {
                let escalate = matches!(e, PipelineError::ExceedsProviderLimit { .. });
                result.success = false;
                result.reason = Some(e.reason().to_string());
                result.error = Some(ContextError::from(e).into());

                if escalate {
                    warn!("Compression left context over the provider limit, escalating");
                    let emergency = self.escalate(Rung::Emergency, goal).await;
                    result.action = emergency.action();
                }
            }
        }

        if let Some(e) = outcome.storage_error {
            result.success = false;
            result.error = Some(e.into());
        }
        let after = self.store.read().await.token_count().total;
        result.freed_tokens = Some(before.saturating_sub(after));
        result
    }

    /// Jump straight to the emergency rungs
    pub async fn handle_emergency(&self) -> EmergencyResult {
        let Some(_guard) = self.try_begin_compression() else {
            return EmergencyResult {
                success: false,
                action: EmergencyAction::None,
                tokens_freed: None,
                snapshot_id: None,
                reason: Some(IN_FLIGHT_REASON.to_string()),
                error: Some(ContextError::CompressionInFlight(self.session_id.clone()).into()),
            };
        };

        let outcome = self.escalate(Rung::Emergency, None).await;
        let error = outcome.storage_error.or(self.over_limit_error().await);
        EmergencyResult {
            success: error.is_none(),
            action: outcome.action.unwrap_or(EmergencyAction::None),
            tokens_freed: Some(outcome.freed),
            snapshot_id: outcome.snapshot_id,
            reason: outcome.reason,
            error: error.map(ErrorReport::from),
        }
    }

    fn pass_options(&self, rung: Rung, goal: Option<Goal>) -> PassOptions {
        let (keep_recent, fail_fast) = match rung {
            Rung::Normal => (self.config.compression.keep_recent_count, false),
            Rung::Emergency => (self.config.compression.emergency_keep_recent, true),
        };
        PassOptions {
            keep_recent,
            fail_fast,
            goal,
            generation: self.generation() + 1,
        }
    }

    /// Walk the ladder from `start`; the caller holds the compression guard
    async fn escalate(&self, start: Rung, goal: Option<Goal>) -> LadderOutcome {
        let mut outcome = LadderOutcome::default();
        let before = self.store.read().await.token_count().total;

        if start == Rung::Normal {
            outcome.attempted = true;
            match self
                .compress_pass(self.pass_options(Rung::Normal, goal.clone()), &mut outcome)
                .await
            {
                Ok(PassOutcome::Compressed(_)) => outcome.action = Some(EmergencyAction::Compressed),
                Ok(PassOutcome::Skipped { .. }) => {
                    outcome.reason = Some("too few messages to compress".to_string())
                }
                Err(e) => {
                    warn!("Compression pass failed: {}", e);
                    outcome.record_failure(e);
                }
            }
        }

        let level = self.ladder.classify(self.usage_fraction().await);
        if start == Rung::Emergency || level >= UsageLevel::Emergency {
            outcome.attempted = true;
            METRICS
                .emergency_actions
                .with_label_values(&["emergency"])
                .inc();
            warn!(
                "Emergency compression for session {} (keep {})",
                self.session_id, self.config.compression.emergency_keep_recent
            );
            match self
                .compress_pass(self.pass_options(Rung::Emergency, goal), &mut outcome)
                .await
            {
                Ok(PassOutcome::Compressed(_)) => {
                    outcome.action = Some(EmergencyAction::EmergencyCompressed)
                }
                Ok(PassOutcome::Skipped { .. }) => {}
                Err(e) => {
                    warn!("Emergency compression failed: {}", e);
                    outcome.record_failure(e);
                }
            }
        }

        if self.ladder.classify(self.usage_fraction().await) == UsageLevel::Overflow {
            self.rollover(&mut outcome).await;
        }

        let after = self.store.read().await.token_count().total;
        outcome.freed = before.saturating_sub(after);
        outcome
    }

    /// One pipeline pass, followed on success by a checkpoint snapshot and
    /// an aging cycle
    async fn compress_pass(
        &self,
        options: PassOptions,
        outcome: &mut LadderOutcome,
    ) -> std::result::Result<PassOutcome, PipelineError> {
        let generation = options.generation;
        let pass = self
            .pipeline
            .run(options, self.progress.as_ref(), self.cancel.child_token())
            .await?;

        if let PassOutcome::Compressed(report) = &pass {
            self.generation.store(generation, Ordering::SeqCst);
            debug!(
                "Generation {} created checkpoint {} (freed {})",
                generation, report.checkpoint_id, report.freed_tokens
            );

            if self.config.snapshots.on_checkpoint {
                if let Err(e) = self.snapshot(SnapshotReason::Checkpoint).await {
                    error!("Checkpoint snapshot failed: {}", e);
                    outcome.storage_error = Some(e);
                }
            }

            let aging = self
                .lifecycle
                .run(generation, self.cancel.child_token())
                .await;
            if !aging.is_empty() {
                debug!("Aging saved {} tokens", aging.tokens_saved());
            }
        }
        Ok(pass)
    }

    /// Snapshot, then keep only the newest messages
    async fn rollover(&self, outcome: &mut LadderOutcome) {
        METRICS
            .emergency_actions
            .with_label_values(&["rollover"])
            .inc();

        // Held across the snapshot write so the snapshot is exactly the
        // state being truncated
        let mut store = self.store.write().await;
        let cursor = self.history.lock().await.cursor();
        match self
            .snapshots
            .create(store.context(), cursor, SnapshotReason::Rollover)
            .await
        {
            Ok(snapshot) => {
                let dropped = store.truncate_recent(self.ladder.rollover_keep());
                warn!(
                    "Emergency rollover for session {}: dropped {} messages, recoverable from snapshot {}",
                    self.session_id,
                    dropped.len(),
                    snapshot.id
                );
                outcome.attempted = true;
                outcome.action = Some(EmergencyAction::Rollover);
                outcome.snapshot_id = Some(snapshot.id);

                // Resume base for the truncated state
                if let Err(e) = self
                    .snapshots
                    .create(store.context(), cursor, SnapshotReason::Truncation)
                    .await
                {
                    warn!("Failed to snapshot truncated context: {}", e);
                    outcome.storage_error = Some(e.into());
                }
            }
            Err(e) => {
                error!("Rollover aborted, snapshot failed: {}", e);
                outcome.reason = Some("rollover aborted: snapshot failed".to_string());
                outcome.storage_error = Some(e.into());
            }
        }
    }

    async fn snapshot(&self, reason: SnapshotReason) -> Result<Snapshot> {
        let context = self.store.read().await.context().clone();
        let cursor = self.history.lock().await.cursor();
        Ok(self.snapshots.create(&context, cursor, reason).await?)
    }

    async fn usage_fraction(&self) -> f64 {
        self.store.read().await.usage_fraction()
    }

    async fn over_limit_error(&self) -> Option<ContextError> {
        let store = self.store.read().await;
        let total = store.token_count().total;
        let limit = store.provider_limit();
        (total > limit).then(|| ContextError::Budget(BudgetError::BudgetExceeded { used: total, max: limit }))
    }

    /// Take a snapshot on demand
    pub async fn create_snapshot(&self) -> SnapshotResult {
        match self.snapshot(SnapshotReason::Manual).await {
            Ok(snapshot) => SnapshotResult {
                success: true,
                snapshot_id: Some(snapshot.id),
                error: None,
            },
            Err(e) => SnapshotResult {
                success: false,
                snapshot_id: None,
                error: Some(e.into()),
            },
        }
    }

    /// Replace the active context with a snapshot's copy
    ///
    /// Rejected while a compression pass is running.
    pub async fn restore_snapshot(&self, id: &str) -> OperationResult {
        let Some(_guard) = self.try_begin_compression() else {
            return OperationResult::failed(ContextError::CompressionInFlight(
                self.session_id.clone(),
            ));
        };
        self.restore(id).await.into()
    }

    async fn restore(&self, id: &str) -> Result<()> {
        let snapshot = self
            .snapshots
            .get(id)
            .await?
            .ok_or_else(|| ContextError::SnapshotNotFound(id.to_string()))?;

        let max_generation = snapshot
            .active_context
            .checkpoints
            .iter()
            .map(|c| c.compression_generation)
            .max()
            .unwrap_or(0);
        self.store.write().await.restore(snapshot.active_context)?;
        self.generation.fetch_max(max_generation, Ordering::SeqCst);

        info!("Session {} restored from snapshot {}", self.session_id, id);
        Ok(())
    }

    /// Remove expired and excess snapshots
    pub async fn prune_snapshots(&self) -> Result<usize> {
        Ok(self.snapshots.prune(chrono::Utc::now()).await?)
    }

    /// Rebuild the system prompt through the configured prompt builder
    pub async fn rebuild_system_prompt(&self, mode: &str, allowed_tools: &[String]) -> OperationResult {
        self.rebuild(mode, allowed_tools).await.into()
    }

    async fn rebuild(&self, mode: &str, allowed_tools: &[String]) -> Result<()> {
        let builder = self.prompt_builder.as_ref().ok_or_else(|| {
            ContextError::Configuration("no system prompt builder configured".to_string())
        })?;
        let mut store = self.store.write().await;
        let text = builder.build(mode, store.budget().tier, allowed_tools)?;
        store.set_system_prompt(text)?;
        info!(
            "Rebuilt system prompt for mode {} ({} tokens)",
            mode,
            store.token_count().system
        );
        Ok(())
    }

    /// Re-derive the tier and budget for a different model window
    pub async fn switch_model(&self, window_size: usize) -> OperationResult {
        let budget = self.policy.resolve(window_size);
        let result = self
            .store
            .write()
            .await
            .set_budget(budget)
            .map_err(ContextError::from);
        if result.is_ok() {
            info!(
                "Session {} switched to {} (window {}, limit {})",
                self.session_id, budget.tier, window_size, budget.provider_limit
            );
        }
        result.into()
    }

    pub async fn get_token_count(&self) -> TokenCount {
        self.store.read().await.token_count()
    }

    pub async fn get_usage(&self) -> Usage {
        let store = self.store.read().await;
        let fraction = store.usage_fraction();
        Usage {
            total: store.token_count().total,
            provider_limit: store.provider_limit(),
            threshold: store.threshold(),
            fraction,
            level: self.ladder.classify(fraction),
            tier: store.budget().tier,
        }
    }

    pub async fn get_snapshot_count(&self) -> Result<usize> {
        Ok(self.snapshots.count().await?)
    }

    pub async fn get_latest_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.latest().await?)
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.get(snapshot_id).await?)
    }

    pub async fn get_checkpoints(&self) -> Vec<CheckpointSummary> {
        self.store.read().await.checkpoints().to_vec()
    }

    /// Prompt for the next model call
    pub async fn build_prompt(&self) -> Vec<ChatMessage> {
        self.store.read().await.build_prompt()
    }

    pub async fn get_history(&self) -> SessionHistory {
        self.history.lock().await.get_history().clone()
    }
}
