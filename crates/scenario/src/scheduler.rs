//! Step scheduling — turns a step's delay into the instant it becomes due.

use chrono::{DateTime, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use clinicflow_core::config::EngineConfig;
use clinicflow_core::{ClinicFlowError, ClinicFlowResult};

use crate::types::{Delay, DelayUnit};

/// Computes `next_run_at` for steps. Day-granular delays are evaluated as
/// calendar days in the configured zone.
#[derive(Debug, Clone, Copy)]
pub struct StepScheduler {
    tz: Tz,
}

impl StepScheduler {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn utc() -> Self {
        Self::new(Tz::UTC)
    }

    pub fn from_config(config: &EngineConfig) -> ClinicFlowResult<Self> {
        let tz: Tz = config.timezone.parse().map_err(|e| {
            ClinicFlowError::Config(format!("unknown timezone {:?}: {}", config.timezone, e))
        })?;
        Ok(Self::new(tz))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Instant at which a step with `delay` becomes due, measured from `now`.
    ///
    /// Day-unit delays are always strictly after `now`: a local time that
    /// has already passed rolls to the same time on the following day.
    /// Results past the representable range saturate at the latest instant.
    pub fn compute_next_run(&self, now: DateTime<Utc>, delay: &Delay) -> DateTime<Utc> {
        self.checked_next_run(now, delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn checked_next_run(&self, now: DateTime<Utc>, delay: &Delay) -> Option<DateTime<Utc>> {
        let value = i64::from(delay.value);
        match delay.unit {
            DelayUnit::Minutes => now.checked_add_signed(Duration::try_minutes(value)?),
            DelayUnit::Hours => now.checked_add_signed(Duration::try_hours(value)?),
            DelayUnit::Days => {
                let local = now.with_timezone(&self.tz);
                let date = local
                    .date_naive()
                    .checked_add_days(Days::new(u64::from(delay.value)))?;
                let time = delay.send_time.unwrap_or_else(|| local.time());
                let candidate = self.resolve_local(date, time);
                if candidate > now {
                    Some(candidate)
                } else {
                    Some(self.resolve_local(date.checked_add_days(Days::new(1))?, time))
                }
            }
        }
    }

    /// Maps a local wall-clock time to UTC. Ambiguous times (DST fall-back)
    /// take the earlier instant; skipped times (spring-forward) move one
    /// hour later.
    fn resolve_local(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = NaiveDateTime::new(date, time);
        let resolved = self.tz.from_local_datetime(&naive).earliest().or_else(|| {
            naive
                .checked_add_signed(Duration::hours(1))
                .and_then(|later| self.tz.from_local_datetime(&later).earliest())
        });
        match resolved {
            Some(local) => local.with_timezone(&Utc),
            None => Utc.from_utc_datetime(&naive),
        }
    }
}

impl Default for StepScheduler {
    fn default() -> Self {
        Self::utc()
    }
}
