//! Shared dependencies of the dispatcher, executor and sweeper.

use std::sync::Arc;

use clinicflow_core::config::EngineConfig;
use clinicflow_core::event_bus::{noop_sink, EventSink};
use clinicflow_core::types::EngineEvent;
use clinicflow_core::ClinicFlowResult;
use clinicflow_rules::RuleEvaluator;

use crate::clock::{Clock, SystemClock};
use crate::definitions::ScenarioStore;
use crate::log::{ExecutionLog, InMemoryExecutionLog};
use crate::providers::{ActionExecutor, AttributeProvider};
use crate::retry::RetryPolicy;
use crate::scheduler::StepScheduler;
use crate::store::{EnrollmentStore, InMemoryEnrollmentStore};

/// Runtime knobs the executor and sweeper read on every run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub node_id: String,
    pub lease: chrono::Duration,
    pub action_timeout: std::time::Duration,
    pub max_zero_delay_chain: usize,
    pub sweep_batch_size: usize,
    pub worker_concurrency: usize,
    pub sweep_interval: std::time::Duration,
    pub stuck_threshold: chrono::Duration,
}

impl EngineSettings {
    pub fn from_config(node_id: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            node_id: node_id.into(),
            lease: chrono::Duration::seconds(config.lease_secs as i64),
            action_timeout: std::time::Duration::from_millis(config.action_timeout_ms),
            max_zero_delay_chain: config.max_zero_delay_chain,
            sweep_batch_size: config.sweep_batch_size,
            worker_concurrency: config.worker_concurrency.max(1),
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval_secs.max(1)),
            stuck_threshold: chrono::Duration::seconds(config.stuck_threshold_secs as i64),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config("local", &EngineConfig::default())
    }
}

/// Everything a component needs to read definitions, mutate enrollments
/// and reach the outside world. Cheap to clone.
#[derive(Clone)]
pub struct EngineContext {
    pub scenarios: Arc<ScenarioStore>,
    pub enrollments: Arc<dyn EnrollmentStore>,
    pub log: Arc<dyn ExecutionLog>,
    pub attributes: Arc<dyn AttributeProvider>,
    pub actions: Arc<dyn ActionExecutor>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventSink>,
    pub scheduler: StepScheduler,
    pub evaluator: RuleEvaluator,
    pub retry: RetryPolicy,
    pub settings: EngineSettings,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("scenarios", &self.scenarios)
            .field("scheduler", &self.scheduler)
            .field("settings", &self.settings)
            .finish()
    }
}

impl EngineContext {
    /// In-memory stores, system clock, UTC scheduling and default settings.
    pub fn new(attributes: Arc<dyn AttributeProvider>, actions: Arc<dyn ActionExecutor>) -> Self {
        Self {
            scenarios: Arc::new(ScenarioStore::new()),
            enrollments: Arc::new(InMemoryEnrollmentStore::new()),
            log: Arc::new(InMemoryExecutionLog::new()),
            attributes,
            actions,
            clock: Arc::new(SystemClock),
            events: noop_sink(),
            scheduler: StepScheduler::utc(),
            evaluator: RuleEvaluator::new(),
            retry: RetryPolicy::default(),
            settings: EngineSettings::default(),
        }
    }

    pub fn from_config(
        node_id: impl Into<String>,
        config: &EngineConfig,
        attributes: Arc<dyn AttributeProvider>,
        actions: Arc<dyn ActionExecutor>,
    ) -> ClinicFlowResult<Self> {
        let mut ctx = Self::new(attributes, actions);
        ctx.scenarios = Arc::new(ScenarioStore::with_chain_limit(config.max_zero_delay_chain));
        ctx.scheduler = StepScheduler::from_config(config)?;
        ctx.retry = RetryPolicy::from_config(&config.retry);
        ctx.settings = EngineSettings::from_config(node_id, config);
        Ok(ctx)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn with_enrollment_store(mut self, store: Arc<dyn EnrollmentStore>) -> Self {
        self.enrollments = store;
        self
    }

    pub fn with_execution_log(mut self, log: Arc<dyn ExecutionLog>) -> Self {
        self.log = log;
        self
    }

    pub fn with_scheduler(mut self, scheduler: StepScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Stamps the node id and emits.
    pub(crate) fn emit(&self, mut event: EngineEvent) {
        event.node_id = self.settings.node_id.clone();
        event.timestamp = self.clock.now();
        self.events.emit(event);
    }
}
