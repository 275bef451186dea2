//! Document-store contract, in-memory reference store, availability
//! reconciliation and retry policies for campwatch.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use campwatch_core::{
    AvailabilityRecord, NewAvailability, NotificationRecord, RunOutcome, RunStatus, ScrapeRun,
    UserProfile, WatchCriterion,
};
use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "campwatch-store";

/// The backing store accepts at most this many operations per write batch.
pub const WRITE_BATCH_LIMIT: usize = 500;

/// Cap on the unfiltered recent-availability window, ordered by scrape time.
pub const RECENT_WINDOW_LIMIT: usize = 100;

/// Cap on the camping-name/region indexed window, ordered by calendar date.
pub const FILTERED_WINDOW_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("write batch exceeds {limit} operations: got {got}")]
    BatchTooLarge { limit: usize, got: usize },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

/// Indexed coarse fetch supported by the store without composite indexes.
/// Range and secondary filters are applied in memory by the [`Reconciler`]
/// after this first stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityIndex {
    /// Equality on camping name, ordered by date descending, capped at
    /// [`FILTERED_WINDOW_LIMIT`].
    ByCampingName(String),
    /// Equality on region, ordered by date descending, capped at
    /// [`FILTERED_WINDOW_LIMIT`].
    ByRegion(String),
    /// No filter: most recently scraped records first, capped at
    /// [`RECENT_WINDOW_LIMIT`].
    Recent,
}

/// Narrowing applied to [`Reconciler::current_availability`]. Only the
/// camping-name (or, failing that, region) equality reaches the store index;
/// everything else is refined in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityFilter {
    pub camping_name: Option<String>,
    pub region: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

/// Collaborator contract for the managed document store. Collections map to
/// `userSettings`, `availability`, `notifications`, `scrapingLogs` and
/// `users` in the reference deployment.
#[async_trait]
pub trait Store: Send + Sync {
    async fn active_criteria(&self) -> Result<Vec<WatchCriterion>, StoreError>;

    /// Flip `is_active` to false. The dispatcher is the only caller.
    async fn deactivate_criterion(&self, criterion_id: Uuid) -> Result<(), StoreError>;

    /// Append one pre-stamped batch of at most [`WRITE_BATCH_LIMIT`] records.
    async fn append_availability(&self, batch: &[AvailabilityRecord]) -> Result<(), StoreError>;

    async fn fetch_availability(
        &self,
        index: AvailabilityIndex,
    ) -> Result<Vec<AvailabilityRecord>, StoreError>;

    async fn notification_for(
        &self,
        criterion_id: Uuid,
    ) -> Result<Option<NotificationRecord>, StoreError>;

    async fn append_notification(&self, record: NotificationRecord) -> Result<(), StoreError>;

    async fn create_run(&self, run: ScrapeRun) -> Result<Uuid, StoreError>;

    async fn finalize_run(&self, run_id: Uuid, outcome: RunOutcome) -> Result<(), StoreError>;

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError>;
}

/// Collapse to the current value per logical key: the record with the latest
/// `scraped_at` wins. Output order is unspecified; callers sort.
pub fn latest_per_key(records: Vec<AvailabilityRecord>) -> Vec<AvailabilityRecord> {
    let mut best: HashMap<(String, String, String, NaiveDate), AvailabilityRecord> =
        HashMap::new();
    for record in records {
        let key = (
            record.camping_name.clone(),
            record.region.clone(),
            record.area.clone(),
            record.date,
        );
        match best.entry(key) {
            Entry::Occupied(mut slot) => {
                if record.scraped_at > slot.get().scraped_at {
                    slot.insert(record);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
    }
    best.into_values().collect()
}

/// Owns all writes to the availability collection and exposes the
/// current-availability view used for matching.
pub struct Reconciler {
    store: Arc<dyn Store>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Stamp each observation with the current time and append it. Writes
    /// never update in place; history accumulates until an external
    /// retention process prunes it. Returns the stamped records.
    pub async fn persist(
        &self,
        observations: Vec<NewAvailability>,
    ) -> Result<Vec<AvailabilityRecord>, StoreError> {
        let scraped_at = Utc::now();
        let records: Vec<AvailabilityRecord> = observations
            .into_iter()
            .map(|obs| AvailabilityRecord {
                id: Uuid::new_v4(),
                camping_name: obs.camping_name,
                region: obs.region,
                area: obs.area,
                date: obs.date,
                available_count: obs.available_count,
                scraped_at,
            })
            .collect();

        for batch in records.chunks(WRITE_BATCH_LIMIT) {
            self.store.append_availability(batch).await?;
        }
        Ok(records)
    }

    /// Two-stage current view: indexed coarse fetch, in-memory refinement,
    /// then collapse to the latest record per logical key.
    pub async fn current_availability(
        &self,
        filter: Option<&AvailabilityFilter>,
    ) -> Result<Vec<AvailabilityRecord>, StoreError> {
        let index = match filter {
            Some(AvailabilityFilter {
                camping_name: Some(name),
                ..
            }) => AvailabilityIndex::ByCampingName(name.clone()),
            Some(AvailabilityFilter {
                region: Some(region),
                ..
            }) => AvailabilityIndex::ByRegion(region.clone()),
            _ => AvailabilityIndex::Recent,
        };
        let recent_ordering = index == AvailabilityIndex::Recent;
        let mut rows = self.store.fetch_availability(index).await?;

        if let Some(f) = filter {
            if let Some(from) = f.date_from {
                rows.retain(|r| r.date >= from);
            }
            if let Some(to) = f.date_to {
                rows.retain(|r| r.date <= to);
            }
            // Region rides along in memory when camping name took the index.
            if f.camping_name.is_some() {
                if let Some(region) = &f.region {
                    rows.retain(|r| r.region == *region);
                }
            }
        }

        let mut rows = latest_per_key(rows);
        if recent_ordering {
            rows.sort_by(|a, b| b.scraped_at.cmp(&a.scraped_at));
        } else {
            rows.sort_by(|a, b| b.date.cmp(&a.date).then(b.scraped_at.cmp(&a.scraped_at)));
        }
        Ok(rows)
    }
}

/// In-memory document store. Reference implementation for tests and
/// single-process deployments; collection names mirror the managed store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

#[derive(Default)]
struct Collections {
    user_settings: Vec<WatchCriterion>,
    availability: Vec<AvailabilityRecord>,
    notifications: Vec<NotificationRecord>,
    scraping_logs: Vec<ScrapeRun>,
    users: HashMap<String, UserProfile>,
    availability_batches: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_criterion(&self, criterion: WatchCriterion) {
        self.inner.write().await.user_settings.push(criterion);
    }

    pub async fn insert_user(&self, profile: UserProfile) {
        self.inner
            .write()
            .await
            .users
            .insert(profile.id.clone(), profile);
    }

    pub async fn criteria(&self) -> Vec<WatchCriterion> {
        self.inner.read().await.user_settings.clone()
    }

    pub async fn notifications(&self) -> Vec<NotificationRecord> {
        self.inner.read().await.notifications.clone()
    }

    pub async fn runs(&self) -> Vec<ScrapeRun> {
        self.inner.read().await.scraping_logs.clone()
    }

    pub async fn availability_count(&self) -> usize {
        self.inner.read().await.availability.len()
    }

    /// Number of write batches accepted so far.
    pub async fn write_batch_count(&self) -> usize {
        self.inner.read().await.availability_batches
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn active_criteria(&self) -> Result<Vec<WatchCriterion>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .user_settings
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect())
    }

    async fn deactivate_criterion(&self, criterion_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner
            .user_settings
            .iter_mut()
            .find(|c| c.id == criterion_id)
        {
            Some(criterion) => {
                criterion.is_active = false;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "userSettings/{criterion_id}"
            ))),
        }
    }

    async fn append_availability(&self, batch: &[AvailabilityRecord]) -> Result<(), StoreError> {
        if batch.len() > WRITE_BATCH_LIMIT {
            return Err(StoreError::BatchTooLarge {
                limit: WRITE_BATCH_LIMIT,
                got: batch.len(),
            });
        }
        let mut inner = self.inner.write().await;
        inner.availability.extend_from_slice(batch);
        inner.availability_batches += 1;
        Ok(())
    }

    async fn fetch_availability(
        &self,
        index: AvailabilityIndex,
    ) -> Result<Vec<AvailabilityRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<AvailabilityRecord> = match &index {
            AvailabilityIndex::ByCampingName(name) => inner
                .availability
                .iter()
                .filter(|r| r.camping_name == *name)
                .cloned()
                .collect(),
            AvailabilityIndex::ByRegion(region) => inner
                .availability
                .iter()
                .filter(|r| r.region == *region)
                .cloned()
                .collect(),
            AvailabilityIndex::Recent => inner.availability.clone(),
        };
        match index {
            AvailabilityIndex::Recent => {
                rows.sort_by(|a, b| b.scraped_at.cmp(&a.scraped_at));
                rows.truncate(RECENT_WINDOW_LIMIT);
            }
            _ => {
                rows.sort_by(|a, b| b.date.cmp(&a.date).then(b.scraped_at.cmp(&a.scraped_at)));
                rows.truncate(FILTERED_WINDOW_LIMIT);
            }
        }
        Ok(rows)
    }

    async fn notification_for(
        &self,
        criterion_id: Uuid,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .notifications
            .iter()
            .find(|n| n.criterion_id == criterion_id)
            .cloned())
    }

    async fn append_notification(&self, record: NotificationRecord) -> Result<(), StoreError> {
        self.inner.write().await.notifications.push(record);
        Ok(())
    }

    async fn create_run(&self, run: ScrapeRun) -> Result<Uuid, StoreError> {
        let run_id = run.id;
        self.inner.write().await.scraping_logs.push(run);
        Ok(run_id)
    }

    async fn finalize_run(&self, run_id: Uuid, outcome: RunOutcome) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let Some(run) = inner.scraping_logs.iter_mut().find(|r| r.id == run_id) else {
            return Err(StoreError::NotFound(format!("scrapingLogs/{run_id}")));
        };
        if run.status != RunStatus::Running {
            warn!(%run_id, "run already finalized; leaving untouched");
            return Ok(());
        }
        run.completed_at = Some(Utc::now());
        match outcome {
            RunOutcome::Success { items_scraped } => {
                run.status = RunStatus::Success;
                run.items_scraped = items_scraped;
            }
            RunOutcome::Error {
                items_scraped,
                message,
            } => {
                run.status = RunStatus::Error;
                run.items_scraped = items_scraped;
                run.error_message = Some(message);
            }
        }
        Ok(())
    }

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.inner.read().await.users.get(user_id).cloned())
    }
}

/// Exponential backoff retry schedule, parameterized per use site.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Scraping and browser operations.
    pub const SCRAPING: Self = Self {
        max_attempts: 3,
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(30),
    };

    /// Document-store operations.
    pub const STORE: Self = Self {
        max_attempts: 3,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
    };

    /// Plain network requests.
    pub const NETWORK: Self = Self {
        max_attempts: 3,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(15),
    };

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Fixed-delay retry schedule; message sending uses 2 attempts, 5s apart.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelayPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl FixedDelayPolicy {
    pub const EMAIL: Self = Self {
        max_attempts: 2,
        delay: Duration::from_secs(5),
    };
}

/// Run `op` up to `policy.max_attempts` times with exponential backoff
/// between failures. The original error propagates once attempts exhaust.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    error!(label, error = %err, attempts = attempt, "all retry attempts failed");
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    label,
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run `op` up to `policy.max_attempts` times with a fixed delay between
/// failures.
pub async fn retry_with_fixed_delay<T, E, F, Fut>(
    policy: FixedDelayPolicy,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    error!(label, error = %err, attempts = attempt, "all retry attempts failed");
                    return Err(err);
                }
                warn!(
                    label,
                    error = %err,
                    attempt,
                    delay_ms = policy.delay.as_millis() as u64,
                    "attempt failed, retrying after fixed delay"
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
