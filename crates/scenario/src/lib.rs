//! Scenario automation: trigger-driven enrollments that walk recipients
//! through timed message steps, with branching, exit checks and retries.

pub mod clock;
pub mod context;
pub mod definitions;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod log;
pub mod providers;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod validation;

pub use context::{EngineContext, EngineSettings};
pub use dispatcher::{EventKind, TriggerDispatcher, TriggerEvent};
pub use engine::ScenarioEngine;
pub use executor::{SkipReason, StepExecutor, StepRun};
pub use providers::{ActionError, ActionExecutor, ActionOutcome, ActionRequest, AttributeProvider};
pub use sweeper::{SweepReport, Sweeper};
