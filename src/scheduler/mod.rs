//! Process-wide reminder scheduler.
//!
//! Holds a time-ordered queue of jobs keyed by public-id. The run loop
//! sleeps until the earliest fire time (or an insertion wakes it), then
//! routes the payload: live session first, broker second, otherwise the
//! job is rescheduled with exponential backoff until the retry budget is
//! spent and the reminder is marked failed.

pub mod notify;
pub mod store;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::server::registry::SessionRegistry;
use notify::{push_agent_notification, DeliveryOutcome, MqttPublisher, NotificationPayload};
use store::{Reminder, ReminderStatus, ReminderStore};

/// Delivery attempts before a reminder is marked failed.
pub const MAX_DELIVERY_RETRIES: u32 = 5;

/// One scheduled firing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReminderJob {
    fire_at: DateTime<Utc>,
    public_id: String,
}

impl Ord for ReminderJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.public_id.cmp(&other.public_id))
    }
}

impl PartialOrd for ReminderJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct ReminderScheduler {
    store: Arc<dyn ReminderStore>,
    registry: Arc<SessionRegistry>,
    broker: Option<Arc<dyn MqttPublisher>>,
    queue: Mutex<BinaryHeap<Reverse<ReminderJob>>>,
    wakeup: Notify,
    running: AtomicBool,
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<dyn ReminderStore>,
        registry: Arc<SessionRegistry>,
        broker: Option<Arc<dyn MqttPublisher>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            broker,
            queue: Mutex::new(BinaryHeap::new()),
            wakeup: Notify::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<dyn ReminderStore> {
        &self.store
    }

    /// Queue a job; wakes the run loop so a nearer fire time takes effect
    /// immediately.
    pub async fn schedule(&self, public_id: &str, fire_at: DateTime<Utc>) {
        self.queue.lock().await.push(Reverse(ReminderJob {
            fire_at,
            public_id: public_id.to_string(),
        }));
        self.wakeup.notify_one();
        debug!(%public_id, %fire_at, "reminder scheduled");
    }

    /// Re-queue every pending reminder from the store. Called at startup.
    pub async fn restore_pending(&self) {
        match self.store.list_pending().await {
            Ok(pending) => {
                let count = pending.len();
                for reminder in pending {
                    // Overdue reminders fire immediately.
                    let fire_at = reminder.remind_at.max(Utc::now());
                    self.schedule(&reminder.public_id, fire_at).await;
                }
                if count > 0 {
                    info!(count, "restored pending reminders");
                }
            }
            Err(e) => error!(error = %e, "could not restore pending reminders"),
        }
    }

    /// Run until `stop` is called. Sleeps to the next fire time; an
    /// insertion or stop wakes it early.
    pub async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return;
        }
        info!("reminder scheduler started");

        while self.running.load(Ordering::SeqCst) {
            let next_fire = self.queue.lock().await.peek().map(|Reverse(j)| j.fire_at);

            match next_fire {
                Some(fire_at) => {
                    let now = Utc::now();
                    if fire_at > now {
                        let wait = (fire_at - now)
                            .to_std()
                            .unwrap_or(Duration::from_millis(1));
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = self.wakeup.notified() => continue,
                        }
                    }
                    let due = {
                        let mut queue = self.queue.lock().await;
                        match queue.peek() {
                            Some(Reverse(job)) if job.fire_at <= Utc::now() => {
                                queue.pop().map(|Reverse(j)| j)
                            }
                            _ => None,
                        }
                    };
                    if let Some(job) = due {
                        self.fire(&job.public_id).await;
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                        _ = self.wakeup.notified() => {}
                    }
                }
            }
        }
        info!("reminder scheduler stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Deliver one reminder, updating its status.
    async fn fire(&self, public_id: &str) {
        let reminder = match self.store.get_by_public_id(public_id).await {
            Ok(r) => r,
            Err(e) => {
                // Deleted between scheduling and firing.
                debug!(%public_id, error = %e, "reminder gone before firing");
                return;
            }
        };
        if reminder.status != ReminderStatus::Pending {
            debug!(%public_id, status = reminder.status.as_str(), "skipping non-pending reminder");
            return;
        }

        let payload = NotificationPayload {
            use_llm: reminder
                .metadata
                .as_ref()
                .and_then(|m| m.get("useLLM"))
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            title: reminder.title.clone().unwrap_or_default(),
            content: reminder.content.clone(),
        };

        let outcome = push_agent_notification(
            &self.registry,
            self.broker.as_ref(),
            &reminder.mac_address,
            &payload,
        )
        .await;

        match outcome {
            DeliveryOutcome::LiveSession | DeliveryOutcome::Broker => {
                if let Err(e) = self
                    .store
                    .update_status(reminder.id, ReminderStatus::Delivered)
                    .await
                {
                    error!(%public_id, error = %e, "could not mark reminder delivered");
                }
                info!(%public_id, via = ?outcome, "reminder delivered");
            }
            DeliveryOutcome::Unavailable => {
                self.handle_delivery_failure(&reminder).await;
            }
        }
    }

    async fn handle_delivery_failure(&self, reminder: &Reminder) {
        let retries = match self.store.increment_retry(reminder.id).await {
            Ok(n) => n,
            Err(e) => {
                error!(public_id = %reminder.public_id, error = %e, "retry bookkeeping failed");
                return;
            }
        };

        if retries > MAX_DELIVERY_RETRIES {
            warn!(public_id = %reminder.public_id, retries, "retry budget spent, marking failed");
            if let Err(e) = self
                .store
                .update_status(reminder.id, ReminderStatus::Failed)
                .await
            {
                error!(public_id = %reminder.public_id, error = %e, "could not mark reminder failed");
            }
            return;
        }

        let delay = backoff_delay(retries);
        let next = Utc::now() + delay;
        warn!(
            public_id = %reminder.public_id,
            retries,
            next_attempt = %next,
            "delivery unavailable, rescheduling"
        );
        self.schedule(&reminder.public_id, next).await;
    }
}

/// Exponential backoff: 2^retry seconds, capped at five minutes.
fn backoff_delay(retry: u32) -> ChronoDuration {
    let secs = 2i64.saturating_pow(retry.min(16)).min(300);
    ChronoDuration::seconds(secs)
}

#[cfg(test)]
mod tests {
    use super::notify::RecordingPublisher;
    use super::store::{InMemoryReminderStore, NewReminder};
    use super::*;

    fn new_reminder(offset_ms: i64) -> NewReminder {
        let at = Utc::now() + ChronoDuration::milliseconds(offset_ms);
        NewReminder {
            agent_id: "agent-1".to_string(),
            device_id: None,
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            content: "Water time".to_string(),
            title: Some("Drink".to_string()),
            remind_at: at,
            remind_at_local: at.with_timezone(&chrono::FixedOffset::east_opt(0).unwrap()),
            metadata: Some(serde_json::json!({"useLLM": false})),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), ChronoDuration::seconds(2));
        assert_eq!(backoff_delay(3), ChronoDuration::seconds(8));
        assert_eq!(backoff_delay(12), ChronoDuration::seconds(300));
    }

    #[tokio::test]
    async fn fires_to_broker_and_marks_delivered() {
        let store: Arc<dyn ReminderStore> = Arc::new(InMemoryReminderStore::new());
        let registry = SessionRegistry::new();
        let recorder = Arc::new(RecordingPublisher::new());
        let broker: Arc<dyn MqttPublisher> = recorder.clone();

        let scheduler = ReminderScheduler::new(store.clone(), registry, Some(broker));
        let reminder = store.create(new_reminder(40)).await.unwrap();
        scheduler
            .schedule(&reminder.public_id, reminder.remind_at)
            .await;

        let runner = scheduler.clone();
        let task = tokio::spawn(runner.run());

        // Fires within 200 ms of the due time.
        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop();
        let _ = task.await;

        let stored = store.get(reminder.id).await.unwrap();
        assert_eq!(stored.status, ReminderStatus::Delivered);
        assert_eq!(
            recorder.published.lock().unwrap()[0].0,
            "device/AA:BB:CC:DD:EE:FF"
        );
    }

    #[tokio::test]
    async fn unavailable_delivery_increments_retry_and_stays_pending() {
        let store: Arc<dyn ReminderStore> = Arc::new(InMemoryReminderStore::new());
        let registry = SessionRegistry::new();
        let scheduler = ReminderScheduler::new(store.clone(), registry, None);

        let reminder = store.create(new_reminder(20)).await.unwrap();
        scheduler
            .schedule(&reminder.public_id, reminder.remind_at)
            .await;

        let runner = scheduler.clone();
        let task = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop();
        let _ = task.await;

        let stored = store.get(reminder.id).await.unwrap();
        assert_eq!(stored.status, ReminderStatus::Pending);
        assert!(stored.retry_count >= 1);
    }

    #[tokio::test]
    async fn restore_pending_requeues_jobs() {
        let store: Arc<dyn ReminderStore> = Arc::new(InMemoryReminderStore::new());
        let registry = SessionRegistry::new();
        let recorder = Arc::new(RecordingPublisher::new());
        let broker: Arc<dyn MqttPublisher> = recorder.clone();
        let scheduler = ReminderScheduler::new(store.clone(), registry, Some(broker));

        let reminder = store.create(new_reminder(30)).await.unwrap();
        scheduler.restore_pending().await;

        let runner = scheduler.clone();
        let task = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop();
        let _ = task.await;

        assert_eq!(
            store.get(reminder.id).await.unwrap().status,
            ReminderStatus::Delivered
        );
    }
}
