//! Cron trigger: fire at scheduled wall-clock times in a configured timezone.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Trigger, TriggerCallback, TriggerError, TriggerEvent};

/// Fires `prompt` according to a cron expression.
pub struct CronTrigger {
    schedule: String,
    timezone: String,
    prompt: String,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CronTrigger {
    pub fn new(schedule: String, timezone: String, prompt: String) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            schedule,
            timezone,
            prompt,
            stop_tx,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Trigger for CronTrigger {
    fn kind(&self) -> &'static str {
        "cron"
    }

    async fn start(&self, callback: TriggerCallback) -> Result<(), TriggerError> {
        let schedule =
            Schedule::from_str(&self.schedule).map_err(|e| TriggerError::InvalidSchedule {
                schedule: self.schedule.clone(),
                message: e.to_string(),
            })?;
        let tz: Tz = self
            .timezone
            .parse()
            .map_err(|_| TriggerError::InvalidTimezone(self.timezone.clone()))?;

        let prompt = self.prompt.clone();
        let schedule_str = self.schedule.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now().with_timezone(&tz);
                let Some(next) = schedule.after(&now).next() else {
                    debug!("cron schedule has no future firings, trigger idle");
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    () = tokio::time::sleep(wait) => {}
                }
                let event = TriggerEvent::new("cron", prompt.clone())
                    .with_metadata("schedule", schedule_str.clone());
                callback(event).await;
            }
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_invalid_schedule_rejected() {
        let trigger = CronTrigger::new("not a cron".to_string(), "UTC".to_string(), "go".to_string());
        let callback: TriggerCallback = Arc::new(|_| Box::pin(async {}));
        assert!(matches!(
            trigger.start(callback).await,
            Err(TriggerError::InvalidSchedule { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_timezone_rejected() {
        let trigger = CronTrigger::new(
            "0 0 9 * * * *".to_string(),
            "Mars/Olympus".to_string(),
            "go".to_string(),
        );
        let callback: TriggerCallback = Arc::new(|_| Box::pin(async {}));
        assert!(matches!(
            trigger.start(callback).await,
            Err(TriggerError::InvalidTimezone(_))
        ));
    }

    #[tokio::test]
    async fn test_fires_every_second_schedule() {
        let trigger = CronTrigger::new(
            // Every second.
            "* * * * * * *".to_string(),
            "UTC".to_string(),
            "tick".to_string(),
        );
        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = Arc::clone(&fired);
        let callback: TriggerCallback = Arc::new(move |event| {
            let fired = Arc::clone(&fired_cb);
            Box::pin(async move {
                assert_eq!(event.trigger_type, "cron");
                assert_eq!(event.prompt, "tick");
                fired.fetch_add(1, Ordering::SeqCst);
            })
        });

        trigger.start(callback).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        trigger.stop().await;

        assert!(fired.load(Ordering::SeqCst) >= 1);
    }
}
