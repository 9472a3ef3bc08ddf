//! Save-time checks for scenario definitions.
//!
//! Anything rejected here would otherwise surface at run time as a stuck or
//! hot-looping enrollment, so definitions are validated before they are stored.

use clinicflow_core::DefinitionError;
use regex::Regex;

use crate::types::{
    DelayUnit, ExitAction, KeywordMatch, ScenarioDefinition, StepAction, StepDefinition, Trigger,
};

/// Upper bound on contiguous zero-delay steps when no other value is configured.
pub const DEFAULT_MAX_ZERO_DELAY_CHAIN: usize = 50;

/// Longest delay a single step may declare, in days.
pub const MAX_DELAY_DAYS: u32 = 3650;

pub fn validate(scenario: &ScenarioDefinition, max_chain: usize) -> Result<(), DefinitionError> {
    if scenario.name.trim().is_empty() {
        return Err(DefinitionError::EmptyName);
    }
    if scenario.steps.is_empty() {
        return Err(DefinitionError::NoSteps);
    }

    if let Trigger::Keyword {
        keywords,
        match_mode: KeywordMatch::Regex,
    } = &scenario.trigger
    {
        for pattern in keywords {
            Regex::new(pattern).map_err(|e| DefinitionError::InvalidKeywordPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
    }

    let len = scenario.steps.len();
    for (index, step) in scenario.steps.iter().enumerate() {
        validate_step(index, step, len)?;
    }

    check_zero_delay_chains(&scenario.steps, max_chain)
}

fn validate_step(index: usize, step: &StepDefinition, len: usize) -> Result<(), DefinitionError> {
    let step_order = step.step_order;
    if step_order != index {
        return Err(DefinitionError::StepOrderMismatch {
            index,
            declared: step_order,
        });
    }

    if step.delay.send_time.is_some() && step.delay.unit != DelayUnit::Days {
        return Err(DefinitionError::SendTimeWithoutDays { step_order });
    }

    let minutes_per_unit: u64 = match step.delay.unit {
        DelayUnit::Minutes => 1,
        DelayUnit::Hours => 60,
        DelayUnit::Days => 24 * 60,
    };
    if u64::from(step.delay.value) * minutes_per_unit > u64::from(MAX_DELAY_DAYS) * 24 * 60 {
        return Err(DefinitionError::DelayTooLong {
            step_order,
            max_days: MAX_DELAY_DAYS,
        });
    }

    let in_range = |target: usize| {
        if target < len {
            Ok(())
        } else {
            Err(DefinitionError::BranchTargetOutOfRange {
                step_order,
                target,
                len,
            })
        }
    };

    match &step.action {
        StepAction::SendMessage {
            content,
            template_ref,
        } => {
            let has_content = content.as_deref().is_some_and(|c| !c.trim().is_empty());
            if !has_content && template_ref.is_none() {
                return Err(DefinitionError::EmptyMessage { step_order });
            }
        }
        StepAction::Webhook { url } => {
            let parsed = url::Url::parse(url).ok();
            let ok = parsed.is_some_and(|u| matches!(u.scheme(), "http" | "https"));
            if !ok {
                return Err(DefinitionError::InvalidWebhookUrl {
                    step_order,
                    url: url.clone(),
                });
            }
        }
        StepAction::Condition {
            on_true, on_false, ..
        } => {
            for target in [on_true, on_false].into_iter().flatten() {
                in_range(*target)?;
            }
        }
        _ => {}
    }

    if let Some(check) = &step.exit_check {
        if check.action == ExitAction::Jump {
            let target = check
                .jump_target
                .ok_or(DefinitionError::MissingJumpTarget { step_order })?;
            in_range(target)?;
        }
    }

    Ok(())
}

/// Steps reachable from `index` without waiting for a later sweep.
fn successors(index: usize, step: &StepDefinition) -> Vec<usize> {
    let next = index + 1;
    let mut out = match &step.action {
        StepAction::Condition {
            on_true, on_false, ..
        } => vec![on_true.unwrap_or(next), on_false.unwrap_or(next)],
        _ => vec![next],
    };
    if let Some(check) = &step.exit_check {
        match check.action {
            ExitAction::Skip => out.push(next),
            ExitAction::Jump => out.extend(check.jump_target),
            ExitAction::Exit => {}
        }
    }
    out
}

/// Rejects cycles made only of zero-delay edges, and zero-delay runs
/// longer than `limit`.
fn check_zero_delay_chains(steps: &[StepDefinition], limit: usize) -> Result<(), DefinitionError> {
    let mut depth: Vec<Option<usize>> = vec![None; steps.len()];
    let mut visiting = vec![false; steps.len()];
    for start in 0..steps.len() {
        chain_length(start, 0, steps, &mut depth, &mut visiting, limit)?;
    }
    Ok(())
}

/// Longest zero-delay run leaving `index`. `reached` is the run length
/// already walked to get here; recursion stops once it passes `limit`.
fn chain_length(
    index: usize,
    reached: usize,
    steps: &[StepDefinition],
    depth: &mut [Option<usize>],
    visiting: &mut [bool],
    limit: usize,
) -> Result<usize, DefinitionError> {
    let too_long = DefinitionError::ZeroDelayChain {
        start: index,
        limit,
    };
    if reached > limit || visiting[index] {
        return Err(too_long);
    }
    if let Some(known) = depth[index] {
        if reached + known > limit {
            return Err(too_long);
        }
        return Ok(known);
    }

    visiting[index] = true;
    let mut longest = 0;
    for next in successors(index, &steps[index]) {
        if next < steps.len() && steps[next].delay.is_immediate() {
            let run = chain_length(next, reached + 1, steps, depth, visiting, limit)?;
            longest = longest.max(1 + run);
        }
    }
    visiting[index] = false;

    if longest > limit {
        return Err(too_long);
    }
    depth[index] = Some(longest);
    Ok(longest)
}
