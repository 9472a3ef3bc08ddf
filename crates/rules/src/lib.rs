//! Condition rules — the rule grammar scenarios use for entry conditions,
//! exit checks and branches, and a total evaluator over recipient snapshots.

pub mod evaluator;
pub mod predicates;
pub mod snapshot;

pub use evaluator::RuleEvaluator;
pub use predicates::{Combinator, Rule, RuleSet};
pub use snapshot::{DateRange, RecipientSnapshot};
