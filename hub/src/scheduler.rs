use crate::rules::RuleEngine;
use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDateTime, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Longest gap replayed after a stall; older minutes are dropped.
const MAX_CATCH_UP_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Minute {
    pub minute_of_day: u16,
    /// 0 = Sunday
    pub weekday: u8,
}

impl Minute {
    fn of(at: NaiveDateTime) -> Self {
        Self {
            minute_of_day: (at.hour() * 60 + at.minute()) as u16,
            weekday: at.weekday().num_days_from_sunday() as u8,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScheduleClock {
    last: Option<NaiveDateTime>,
}

impl ScheduleClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every minute elapsed since the previous observation, oldest first.
    /// A minute is never returned twice.
    pub fn observe(&mut self, now: NaiveDateTime) -> Vec<Minute> {
        let now = truncate_to_minute(now);
        let Some(last) = self.last else {
            self.last = Some(now);
            return vec![Minute::of(now)];
        };
        if now <= last {
            if now < last {
                warn!("Wall clock moved back from {} to {}", last, now);
                self.last = Some(now);
            }
            return Vec::new();
        }

        let gap = (now - last).num_minutes();
        let first = if gap > MAX_CATCH_UP_MINUTES {
            warn!(
                "Schedule clock stalled for {} minutes, replaying the last {}",
                gap, MAX_CATCH_UP_MINUTES
            );
            now - ChronoDuration::minutes(MAX_CATCH_UP_MINUTES - 1)
        } else {
            last + ChronoDuration::minutes(1)
        };
        self.last = Some(now);

        let mut minutes = Vec::new();
        let mut at = first;
        while at <= now {
            minutes.push(Minute::of(at));
            at += ChronoDuration::minutes(1);
        }
        minutes
    }
}

fn truncate_to_minute(at: NaiveDateTime) -> NaiveDateTime {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

pub async fn run_scheduler(engine: Arc<RuleEngine>, tick_secs: u64) {
    info!("Starting schedule clock, sampling every {}s", tick_secs);

    let mut clock = ScheduleClock::new();
    let mut ticker = interval(Duration::from_secs(tick_secs.clamp(1, 30)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        for minute in clock.observe(Local::now().naive_local()) {
            debug!(
                "Evaluating schedules for minute {} weekday {}",
                minute.minute_of_day, minute.weekday
            );
            // Slow controllers must not hold up the next sample.
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                if let Err(e) = engine
                    .evaluate_schedules(minute.minute_of_day, minute.weekday)
                    .await
                {
                    error!("Schedule evaluation failed: {}", e);
                }
            });
        }
    }
}
