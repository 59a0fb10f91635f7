use super::ScheduleSpec;
use crate::error::ScheduleError;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Compute the next fire instant for a trigger.
///
/// Immediate triggers (and date triggers already in the past) fire one
/// second from `now` rather than zero, so the caller sees a stable
/// `next_run` before the timer lands.
pub fn next_fire(spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    match spec {
        ScheduleSpec::Immediate => Ok(now + chrono::Duration::seconds(1)),
        ScheduleSpec::Interval { secs } => {
            if *secs == 0 {
                return Err(ScheduleError::Invalid("interval must be positive".into()));
            }
            Ok(now + chrono::Duration::seconds(*secs as i64))
        }
        ScheduleSpec::Date { at } => {
            if *at <= now {
                Ok(now + chrono::Duration::seconds(1))
            } else {
                Ok(*at)
            }
        }
        ScheduleSpec::Cron {
            hour,
            minute,
            day_of_week,
        } => {
            if *hour > 23 || *minute > 59 {
                return Err(ScheduleError::Invalid(format!(
                    "cron trigger out of range: {hour:02}:{minute:02}"
                )));
            }
            let dow = day_of_week.as_deref().unwrap_or("*");
            let expression = format!("0 {minute} {hour} * * {dow}");
            let schedule = CronSchedule::from_str(&expression)
                .map_err(|error| ScheduleError::Invalid(format!("{expression}: {error}")))?;
            schedule
                .after(&now)
                .next()
                .ok_or(ScheduleError::NoFutureOccurrence(expression))
        }
    }
}

struct TimerEntry {
    token: CancellationToken,
    next_fire: Arc<Mutex<Option<DateTime<Utc>>>>,
    generation: u64,
}

/// Turns triggers into tokio timer tasks.
///
/// Each scheduled job owns one timer task that sends the job id over the
/// fire channel when the trigger lands. Recurring triggers loop; one-shot
/// timers deregister themselves after firing, so a cancel that arrives later
/// takes the cooperative path instead.
pub struct Scheduler {
    fire_tx: mpsc::UnboundedSender<String>,
    timers: Arc<Mutex<HashMap<String, TimerEntry>>>,
    generation: AtomicU64,
}

impl Scheduler {
    pub fn new(fire_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            fire_tx,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Arm (or re-arm) the timer for a job. Returns the first fire instant.
    pub fn schedule(
        &self,
        id: &str,
        spec: &ScheduleSpec,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let first = next_fire(spec, Utc::now())?;
        let recurring = matches!(
            spec,
            ScheduleSpec::Interval { .. } | ScheduleSpec::Cron { .. }
        );
        // Re-arming also drops any pending retry timer for the job.
        self.unschedule(id);
        self.arm(id, id, first, recurring.then(|| spec.clone()));
        Ok(first)
    }

    /// One-shot timer after a fixed delay; used for retry backoff.
    ///
    /// Keyed separately from the job's trigger, so a retry never displaces
    /// a recurring interval or cron timer armed under the same id.
    pub fn schedule_once(&self, id: &str, delay: Duration) {
        let target = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.arm(&retry_key(id), id, target, None);
    }

    fn arm(&self, key: &str, fire_id: &str, first: DateTime<Utc>, recurring: Option<ScheduleSpec>) {
        self.disarm(key);

        let token = CancellationToken::new();
        let next_slot = Arc::new(Mutex::new(Some(first)));
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        lock(&self.timers).insert(
            key.to_string(),
            TimerEntry {
                token: token.clone(),
                next_fire: Arc::clone(&next_slot),
                generation,
            },
        );

        let fire_tx = self.fire_tx.clone();
        let timers = Arc::clone(&self.timers);
        let key = key.to_string();
        let fire_id = fire_id.to_string();
        tokio::spawn(async move {
            let mut target = first;
            loop {
                let wait = (target - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(wait) => {}
                }
                if fire_tx.send(fire_id.clone()).is_err() {
                    return;
                }

                match &recurring {
                    Some(spec) => match next_fire(spec, Utc::now()) {
                        Ok(next) => {
                            target = next;
                            *lock_slot(&next_slot) = Some(next);
                        }
                        Err(error) => {
                            tracing::warn!(job_id = %fire_id, %error, "trigger has no next occurrence");
                            break;
                        }
                    },
                    None => break,
                }
            }

            // One-shot timers deregister themselves, unless a newer timer
            // already took the slot.
            let mut timers = lock(&timers);
            if timers.get(&key).is_some_and(|e| e.generation == generation) {
                timers.remove(&key);
            }
        });
    }

    fn disarm(&self, key: &str) -> bool {
        match lock(&self.timers).remove(key) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Disarm the job's timers, the trigger and any pending retry. `false`
    /// when nothing was armed, which for a fired one-shot means the run is
    /// already in flight.
    pub fn unschedule(&self, id: &str) -> bool {
        let trigger = self.disarm(id);
        let retry = self.disarm(&retry_key(id));
        trigger || retry
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        let timers = lock(&self.timers);
        timers.contains_key(id) || timers.contains_key(&retry_key(id))
    }

    /// The trigger's next fire, or the pending retry's when only that is
    /// armed.
    pub fn next_run(&self, id: &str) -> Option<DateTime<Utc>> {
        let timers = lock(&self.timers);
        timers
            .get(id)
            .or_else(|| timers.get(&retry_key(id)))
            .and_then(|entry| *lock_slot(&entry.next_fire))
    }
}

fn retry_key(id: &str) -> String {
    format!("{id}#retry")
}

fn lock(timers: &Mutex<HashMap<String, TimerEntry>>) -> std::sync::MutexGuard<'_, HashMap<String, TimerEntry>> {
    timers.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_slot(
    slot: &Mutex<Option<DateTime<Utc>>>,
) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
    slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_must_be_positive() {
        let err = next_fire(&ScheduleSpec::Interval { secs: 0 }, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn past_date_fires_immediately() {
        let now = Utc::now();
        let past = now - chrono::Duration::hours(1);
        let fire = next_fire(&ScheduleSpec::Date { at: past }, now).unwrap();
        assert_eq!(fire, now + chrono::Duration::seconds(1));
    }

    #[test]
    fn cron_rejects_out_of_range_fields() {
        let spec = ScheduleSpec::Cron {
            hour: 24,
            minute: 0,
            day_of_week: None,
        };
        assert!(next_fire(&spec, Utc::now()).is_err());

        let spec = ScheduleSpec::Cron {
            hour: 0,
            minute: 60,
            day_of_week: None,
        };
        assert!(next_fire(&spec, Utc::now()).is_err());
    }

    #[test]
    fn cron_computes_a_future_daily_fire() {
        let spec = ScheduleSpec::Cron {
            hour: 7,
            minute: 30,
            day_of_week: Some("Mon-Fri".into()),
        };
        let now = Utc::now();
        let fire = next_fire(&spec, now).unwrap();
        assert!(fire > now);
        use chrono::Timelike;
        assert_eq!(fire.hour(), 7);
        assert_eq!(fire.minute(), 30);
    }

    #[test]
    fn daily_cron_next_fire_is_within_a_day() {
        let spec = ScheduleSpec::Cron {
            hour: 3,
            minute: 0,
            day_of_week: None,
        };
        let now = Utc::now();
        let fire = next_fire(&spec, now).unwrap();
        assert!(fire > now);
        assert!(fire - now <= chrono::Duration::hours(24));
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once_and_deregisters() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        scheduler.schedule("job-1", &ScheduleSpec::Immediate).unwrap();
        assert!(scheduler.is_scheduled("job-1"));

        assert_eq!(rx.recv().await.unwrap(), "job-1");
        tokio::task::yield_now().await;
        assert!(!scheduler.is_scheduled("job-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_keeps_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        scheduler
            .schedule("tick", &ScheduleSpec::Interval { secs: 60 })
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), "tick");
        assert_eq!(rx.recv().await.unwrap(), "tick");
        assert!(scheduler.is_scheduled("tick"));
        assert!(scheduler.next_run("tick").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unschedule_silences_the_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        scheduler
            .schedule("tick", &ScheduleSpec::Interval { secs: 60 })
            .unwrap();

        assert!(scheduler.unschedule("tick"));
        assert!(!scheduler.unschedule("tick"));

        // Nothing fires after disarm.
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        scheduler
            .schedule("job", &ScheduleSpec::Interval { secs: 3600 })
            .unwrap();
        scheduler
            .schedule("job", &ScheduleSpec::Immediate)
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), "job");
        tokio::task::yield_now().await;
        // The one-shot replacement deregistered itself; the old interval
        // timer is gone too.
        assert!(!scheduler.is_scheduled("job"));
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timer_leaves_the_recurring_trigger_armed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        scheduler
            .schedule("job", &ScheduleSpec::Interval { secs: 60 })
            .unwrap();
        scheduler.schedule_once("job", Duration::from_secs(5));

        // The retry fires first and deregisters itself.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rx.try_recv().unwrap(), "job");
        assert!(scheduler.is_scheduled("job"));
        assert!(scheduler.next_run("job").is_some());

        // The interval trigger is intact and keeps firing.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rx.try_recv().unwrap(), "job");
        assert!(scheduler.is_scheduled("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn unschedule_also_disarms_a_pending_retry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        scheduler
            .schedule("job", &ScheduleSpec::Interval { secs: 60 })
            .unwrap();
        scheduler.schedule_once("job", Duration::from_secs(5));

        assert!(scheduler.unschedule("job"));
        assert!(!scheduler.is_scheduled("job"));
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(rx.try_recv().is_err());
    }
}
