//! Reminder records and the repository contract.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderStatus {
    Pending,
    Delivered,
    Received,
    Failed,
}

impl ReminderStatus {
    /// Transitions run forward only; Failed is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(self, next: ReminderStatus) -> bool {
        use ReminderStatus::*;
        match (self, next) {
            (Pending, Delivered) => true,
            (Delivered, Received) => true,
            (Pending | Delivered, Failed) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pending" => Some(ReminderStatus::Pending),
            "delivered" => Some(ReminderStatus::Delivered),
            "received" => Some(ReminderStatus::Received),
            "failed" => Some(ReminderStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReminderStatus::Pending => "pending",
            ReminderStatus::Delivered => "delivered",
            ReminderStatus::Received => "received",
            ReminderStatus::Failed => "failed",
        }
    }
}

/// A persisted reminder. `remind_at` is authoritative UTC;
/// `remind_at_local` is a derived display value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Uuid,
    /// Scheduler-facing identifier, unique per job.
    pub public_id: String,
    pub agent_id: String,
    pub device_id: Option<Uuid>,
    pub mac_address: String,
    pub content: String,
    pub title: Option<String>,
    pub remind_at: DateTime<Utc>,
    pub remind_at_local: DateTime<chrono::FixedOffset>,
    pub created_at: DateTime<Utc>,
    pub status: ReminderStatus,
    pub received_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub metadata: Option<serde_json::Value>,
    pub is_deleted: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reminder {0} not found")]
    NotFound(String),
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ReminderStatus,
        to: ReminderStatus,
    },
    #[error("remind_at must be strictly in the future")]
    NotInFuture,
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// New reminder input.
#[derive(Debug, Clone)]
pub struct NewReminder {
    pub agent_id: String,
    pub device_id: Option<Uuid>,
    pub mac_address: String,
    pub content: String,
    pub title: Option<String>,
    pub remind_at: DateTime<Utc>,
    pub remind_at_local: DateTime<chrono::FixedOffset>,
    pub metadata: Option<serde_json::Value>,
}

/// Filter window for listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListPeriod {
    Today,
    Week,
}

impl ListPeriod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "today" => Some(ListPeriod::Today),
            "week" => Some(ListPeriod::Week),
            _ => None,
        }
    }
}

/// Repository contract consumed by the scheduler and the reminder tools.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    async fn create(&self, new: NewReminder) -> Result<Reminder, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Reminder, StoreError>;
    async fn get_by_public_id(&self, public_id: &str) -> Result<Reminder, StoreError>;
    async fn list(
        &self,
        agent_id: &str,
        period: ListPeriod,
        status: Option<ReminderStatus>,
    ) -> Result<Vec<Reminder>, StoreError>;
    /// Every pending reminder, for rescheduling after restart.
    async fn list_pending(&self) -> Result<Vec<Reminder>, StoreError>;
    async fn update_status(
        &self,
        id: Uuid,
        status: ReminderStatus,
    ) -> Result<Reminder, StoreError>;
    async fn increment_retry(&self, id: Uuid) -> Result<u32, StoreError>;
    async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// In-memory repository used by tests and single-node deployments.
pub struct InMemoryReminderStore {
    reminders: Mutex<HashMap<Uuid, Reminder>>,
}

impl InMemoryReminderStore {
    pub fn new() -> Self {
        Self {
            reminders: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryReminderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReminderStore for InMemoryReminderStore {
    async fn create(&self, new: NewReminder) -> Result<Reminder, StoreError> {
        if new.remind_at <= Utc::now() {
            return Err(StoreError::NotInFuture);
        }
        let id = Uuid::new_v4();
        let reminder = Reminder {
            id,
            public_id: format!("rem-{}", id.simple()),
            agent_id: new.agent_id,
            device_id: new.device_id,
            mac_address: new.mac_address,
            content: new.content,
            title: new.title,
            remind_at: new.remind_at,
            remind_at_local: new.remind_at_local,
            created_at: Utc::now(),
            status: ReminderStatus::Pending,
            received_at: None,
            retry_count: 0,
            metadata: new.metadata,
            is_deleted: false,
        };
        self.reminders
            .lock()
            .unwrap()
            .insert(id, reminder.clone());
        Ok(reminder)
    }

    async fn get(&self, id: Uuid) -> Result<Reminder, StoreError> {
        self.reminders
            .lock()
            .unwrap()
            .get(&id)
            .filter(|r| !r.is_deleted)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn get_by_public_id(&self, public_id: &str) -> Result<Reminder, StoreError> {
        self.reminders
            .lock()
            .unwrap()
            .values()
            .find(|r| r.public_id == public_id && !r.is_deleted)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(public_id.to_string()))
    }

    async fn list(
        &self,
        agent_id: &str,
        period: ListPeriod,
        status: Option<ReminderStatus>,
    ) -> Result<Vec<Reminder>, StoreError> {
        let now = Utc::now();
        let window_end = match period {
            ListPeriod::Today => {
                let tomorrow = now.date_naive() + Duration::days(1);
                tomorrow
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc()
            }
            ListPeriod::Week => {
                let days_left = 7 - now.date_naive().weekday().num_days_from_monday() as i64;
                (now.date_naive() + Duration::days(days_left))
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc()
            }
        };

        let mut results: Vec<Reminder> = self
            .reminders
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.is_deleted && r.agent_id == agent_id && r.remind_at < window_end)
            .filter(|r| match status {
                Some(s) => r.status == s,
                None => true,
            })
            .cloned()
            .collect();
        results.sort_by_key(|r| r.remind_at);
        Ok(results)
    }

    async fn list_pending(&self) -> Result<Vec<Reminder>, StoreError> {
        let mut results: Vec<Reminder> = self
            .reminders
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.is_deleted && r.status == ReminderStatus::Pending)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.remind_at);
        Ok(results)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ReminderStatus,
    ) -> Result<Reminder, StoreError> {
        let mut reminders = self.reminders.lock().unwrap();
        let reminder = reminders
            .get_mut(&id)
            .filter(|r| !r.is_deleted)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !reminder.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: reminder.status,
                to: status,
            });
        }
        reminder.status = status;
        reminder.received_at = match status {
            ReminderStatus::Received => Some(Utc::now()),
            _ => None,
        };
        Ok(reminder.clone())
    }

    async fn increment_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut reminders = self.reminders.lock().unwrap();
        let reminder = reminders
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        reminder.retry_count += 1;
        Ok(reminder.retry_count)
    }

    async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut reminders = self.reminders.lock().unwrap();
        let reminder = reminders
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        reminder.is_deleted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_reminder(offset_secs: i64) -> NewReminder {
        NewReminder {
            agent_id: "agent-1".to_string(),
            device_id: None,
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            content: "drink water".to_string(),
            title: None,
            remind_at: Utc::now() + Duration::seconds(offset_secs),
            remind_at_local: (Utc::now() + Duration::seconds(offset_secs))
                .with_timezone(&chrono::FixedOffset::east_opt(7 * 3600).unwrap()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_past_times() {
        let store = InMemoryReminderStore::new();
        assert!(matches!(
            store.create(new_reminder(-5)).await,
            Err(StoreError::NotInFuture)
        ));
    }

    #[tokio::test]
    async fn status_transitions_are_forward_only() {
        let store = InMemoryReminderStore::new();
        let reminder = store.create(new_reminder(60)).await.unwrap();

        let delivered = store
            .update_status(reminder.id, ReminderStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(delivered.status, ReminderStatus::Delivered);
        assert!(delivered.received_at.is_none());

        let received = store
            .update_status(reminder.id, ReminderStatus::Received)
            .await
            .unwrap();
        assert!(received.received_at.is_some());

        // Backwards transition rejected.
        assert!(matches!(
            store
                .update_status(reminder.id, ReminderStatus::Pending)
                .await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn failed_is_reachable_from_non_terminal_states() {
        assert!(ReminderStatus::Pending.can_transition_to(ReminderStatus::Failed));
        assert!(ReminderStatus::Delivered.can_transition_to(ReminderStatus::Failed));
        assert!(!ReminderStatus::Received.can_transition_to(ReminderStatus::Failed));
        assert!(!ReminderStatus::Failed.can_transition_to(ReminderStatus::Pending));
    }

    #[tokio::test]
    async fn soft_delete_hides_from_reads() {
        let store = InMemoryReminderStore::new();
        let reminder = store.create(new_reminder(60)).await.unwrap();
        store.soft_delete(reminder.id).await.unwrap();
        assert!(store.get(reminder.id).await.is_err());
        assert!(store
            .list("agent-1", ListPeriod::Week, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = InMemoryReminderStore::new();
        let a = store.create(new_reminder(30)).await.unwrap();
        let _b = store.create(new_reminder(40)).await.unwrap();
        store
            .update_status(a.id, ReminderStatus::Delivered)
            .await
            .unwrap();

        let pending = store
            .list("agent-1", ListPeriod::Today, Some(ReminderStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }
}
