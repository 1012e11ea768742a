//! Cron-driven trigger.
//!
//! Each tick runs the day before the tick, so the default `0 0 0 * * *`
//! (00:00 UTC) runs the day that just ended. A tick that passes while a run
//! is still in progress is dropped, never replayed.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{EtlError, Result};

/// Every day at 00:00:00 UTC.
pub const DEFAULT_SCHEDULE: &str = "0 0 0 * * *";

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Parses a cron expression. Five-field expressions (min..dow) get a leading
/// seconds field; `@daily` style shorthands pass through.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let expression = expression.trim();
    let normalized = match expression.split_whitespace().count() {
        5 if !expression.starts_with('@') => format!("0 {expression}"),
        _ => expression.to_string(),
    };
    Schedule::from_str(&normalized)
        .map_err(|e| EtlError::Config(format!("invalid schedule {expression:?}: {e}")))
}

/// First tick strictly after `now`.
pub fn next_tick(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}

/// Logical date a tick runs for.
pub fn logical_date(tick: DateTime<Utc>) -> NaiveDate {
    tick.date_naive() - Days::new(1)
}

pub struct ScheduleTrigger {
    schedule: Schedule,
    clock: Clock,
}

impl ScheduleTrigger {
    pub fn new(expression: &str) -> Result<Self> {
        Ok(Self {
            schedule: parse_schedule(expression)?,
            clock: Arc::new(Utc::now),
        })
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Calls `job` for every tick until `cancel` fires. A failing run is
    /// logged and the trigger waits for the next tick.
    pub async fn run<F, Fut, T>(&self, cancel: CancellationToken, mut job: F) -> Result<()>
    where
        F: FnMut(NaiveDate) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let now = (self.clock)();
            let Some(tick) = next_tick(&self.schedule, now) else {
                warn!("schedule has no upcoming ticks");
                return Ok(());
            };
            let wait = (tick - now).to_std().unwrap_or_default();
            info!(next_tick = %tick, "waiting for next tick");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("schedule trigger stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let date = logical_date(tick);
            info!(logical_date = %date, "tick");
            if let Err(e) = job(date).await {
                warn!(logical_date = %date, error = %e, "scheduled run failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::time::Duration;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn daily() -> Schedule {
        parse_schedule(DEFAULT_SCHEDULE).unwrap()
    }

    #[test]
    fn ticks_at_next_midnight() {
        let schedule = daily();
        assert_eq!(next_tick(&schedule, at(2024, 1, 5, 13, 0)), Some(at(2024, 1, 6, 0, 0)));
        assert_eq!(next_tick(&schedule, at(2024, 1, 6, 0, 0)), Some(at(2024, 1, 7, 0, 0)));
        assert_eq!(next_tick(&schedule, at(2024, 12, 31, 23, 59)), Some(at(2025, 1, 1, 0, 0)));
    }

    #[test]
    fn accepts_five_fields_and_shorthands() {
        let five = parse_schedule("30 2 * * *").unwrap();
        assert_eq!(next_tick(&five, at(2024, 1, 5, 13, 0)), Some(at(2024, 1, 6, 2, 30)));

        let shorthand = parse_schedule("@daily").unwrap();
        assert_eq!(next_tick(&shorthand, at(2024, 1, 5, 13, 0)), Some(at(2024, 1, 6, 0, 0)));

        let err = parse_schedule("every night").unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn tick_runs_previous_day() {
        assert_eq!(logical_date(at(2024, 1, 6, 0, 0)), NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(logical_date(at(2024, 3, 1, 0, 0)), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    fn paused_clock(base: DateTime<Utc>) -> impl Fn() -> DateTime<Utc> + Send + Sync + 'static {
        let start = tokio::time::Instant::now();
        move || base + chrono::TimeDelta::from_std(start.elapsed()).unwrap()
    }

    fn trigger_at(base: DateTime<Utc>) -> ScheduleTrigger {
        ScheduleTrigger::new(DEFAULT_SCHEDULE)
            .unwrap()
            .with_clock(paused_clock(base))
    }

    #[tokio::test(start_paused = true)]
    async fn runs_each_day_once() {
        let trigger = trigger_at(at(2024, 1, 5, 23, 0));
        let cancel = CancellationToken::new();
        let dates = Arc::new(Mutex::new(Vec::new()));

        let seen = dates.clone();
        let stop = cancel.clone();
        trigger
            .run(cancel, move |date| {
                let seen = seen.clone();
                let stop = stop.clone();
                async move {
                    let mut seen = seen.lock().unwrap();
                    seen.push(date);
                    if seen.len() == 2 {
                        stop.cancel();
                    }
                    Ok::<(), crate::EtlError>(())
                }
            })
            .await
            .unwrap();

        let dates = dates.lock().unwrap();
        assert_eq!(
            *dates,
            [NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(), NaiveDate::from_ymd_opt(2024, 1, 6).unwrap()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_job_skips_missed_ticks() {
        let trigger = trigger_at(at(2024, 1, 5, 23, 0));
        let cancel = CancellationToken::new();
        let dates = Arc::new(Mutex::new(Vec::new()));

        let seen = dates.clone();
        let stop = cancel.clone();
        trigger
            .run(cancel, move |date| {
                let seen = seen.clone();
                let stop = stop.clone();
                async move {
                    let first = {
                        let mut seen = seen.lock().unwrap();
                        seen.push(date);
                        seen.len() == 1
                    };
                    if first {
                        tokio::time::sleep(Duration::from_secs(50 * 3600)).await;
                    } else {
                        stop.cancel();
                    }
                    Ok::<(), crate::EtlError>(())
                }
            })
            .await
            .unwrap();

        let dates = dates.lock().unwrap();
        assert_eq!(
            *dates,
            [NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(), NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()]
        );
    }
}
