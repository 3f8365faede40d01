//! Daily transport rotation
//!
//! A session stays pinned to the place its transport was first accepted. To
//! let a travelling client land on a closer session, the transport is closed
//! once at the first UTC midnight after the session's first attach; the client
//! reconnects under the next day's identity.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::store::{StateStore, StoreError};

/// Store key holding the first attach day
pub const FIRST_STARTED_ON_KEY: &str = "first_started_on";

/// WebSocket close code sent when rotation asks the client to reconnect
/// (1012, "service restart")
pub const RECONNECT_CLOSE_CODE: u16 = 1012;

pub const RECONNECT_CLOSE_REASON: &str =
    "Disconnecting to force a reconnect to a new session in case the client has moved.";

/// Persisted record of the first attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstStartedOn {
    pub today_utc: NaiveDate,
    pub next_day_utc: NaiveDate,
}

impl FirstStartedOn {
    pub fn for_day(today: NaiveDate) -> Self {
        // NaiveDate::MAX has no successor; saturate rather than fail
        let next_day_utc = today.succ_opt().unwrap_or(today);
        Self {
            today_utc: today,
            next_day_utc,
        }
    }

    /// Midnight UTC at the start of `next_day_utc`
    pub fn wake_up_at(&self) -> DateTime<Utc> {
        self.next_day_utc.and_time(chrono::NaiveTime::MIN).and_utc()
    }
}

/// Persist the first attach day and schedule the wake-up, once per session
///
/// Returns the wake-up time when this call scheduled it, `None` when a
/// previous call already did.
pub async fn ensure_scheduled(
    store: &dyn StateStore,
    today: NaiveDate,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    if store.get(FIRST_STARTED_ON_KEY).await?.is_some() {
        return Ok(None);
    }

    let record = FirstStartedOn::for_day(today);
    let at = record.wake_up_at();
    store
        .put(FIRST_STARTED_ON_KEY, serde_json::to_value(&record)?)
        .await?;
    store.set_alarm(at).await?;
    Ok(Some(at))
}

/// Read back the persisted first attach record
pub async fn first_started_on(store: &dyn StateStore) -> Result<Option<FirstStartedOn>, StoreError> {
    match store.get(FIRST_STARTED_ON_KEY).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Time left until `at`, zero if already past
pub fn duration_until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Rotation bookkeeping owned by a session
pub struct RotationState {
    store: Arc<dyn StateStore>,
    timer: Option<JoinHandle<()>>,
}

impl RotationState {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store, timer: None }
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn is_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start the in-process timer for a wake-up; `fire` runs when it expires
    pub fn arm<F>(&mut self, at: DateTime<Utc>, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.timer.take() {
            previous.abort();
        }

        let delay = duration_until(at, Utc::now());
        tracing::debug!("Rotation wake-up armed for {} (in {:?})", at, delay);

        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        }));
    }

    /// Called when the wake-up fires: forget the timer and the stored alarm
    pub async fn fired(&mut self) -> Result<(), StoreError> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.store.clear_alarm().await
    }
}

impl Drop for RotationState {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts alarm writes on top of a memory store
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        alarms_set: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for CountingStore {
        async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
            self.inner.put(key, value).await
        }

        async fn alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.alarm().await
        }

        async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.alarms_set.fetch_add(1, Ordering::SeqCst);
            self.inner.set_alarm(at).await
        }

        async fn clear_alarm(&self) -> Result<(), StoreError> {
            self.inner.clear_alarm().await
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_wake_up_is_next_midnight() {
        let record = FirstStartedOn::for_day(day(2023, 12, 31));
        assert_eq!(record.next_day_utc, day(2024, 1, 1));
        assert_eq!(
            record.wake_up_at(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_record_serializes_as_iso_dates() {
        let record = FirstStartedOn::for_day(day(2024, 5, 3));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"today_utc": "2024-05-03", "next_day_utc": "2024-05-04"})
        );
    }

    #[tokio::test]
    async fn test_ensure_scheduled_is_idempotent() {
        let store = CountingStore::default();

        let first = ensure_scheduled(&store, day(2024, 5, 3)).await.unwrap();
        let second = ensure_scheduled(&store, day(2024, 5, 3)).await.unwrap();
        // A restart on a later day still must not re-arm
        let third = ensure_scheduled(&store, day(2024, 5, 4)).await.unwrap();

        assert_eq!(first, Some(Utc.with_ymd_and_hms(2024, 5, 4, 0, 0, 0).unwrap()));
        assert_eq!(second, None);
        assert_eq!(third, None);
        assert_eq!(store.alarms_set.load(Ordering::SeqCst), 1);

        let record = first_started_on(&store).await.unwrap().unwrap();
        assert_eq!(record.today_utc, day(2024, 5, 3));
    }

    #[test]
    fn test_duration_until_past_is_zero() {
        let now = Utc.with_ymd_and_hms(2024, 5, 3, 12, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 5, 3, 11, 0, 0).unwrap();
        assert_eq!(duration_until(earlier, now), Duration::ZERO);
        assert_eq!(
            duration_until(now + chrono::Duration::seconds(90), now),
            Duration::from_secs(90)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_timer_fires() {
        let mut state = RotationState::new(Arc::new(MemoryStore::new()));
        let (tx, rx) = tokio::sync::oneshot::channel();

        state.arm(Utc::now() + chrono::Duration::seconds(5), async move {
            let _ = tx.send(());
        });
        assert!(state.is_armed());

        tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("timer should fire")
            .unwrap();
    }
}
