//! Scrape-dedupe-notify orchestration: recurring trigger, skip gates, run
//! lifecycle and the fetch → persist → match → dispatch sequence.

use std::sync::Arc;

use anyhow::{Context, Result};
use campwatch_core::{
    any_relevant_criteria, is_quiet_hours, jitter_delay, matcher, months_to_fetch,
    NewAvailability, RunOutcome, ScrapeRun, WatchCriterion, YearMonth,
};
use campwatch_extract::{CalendarSession, CalendarSource, SiteConfig};
use campwatch_notify::{Dispatcher, Messenger};
use campwatch_store::{
    latest_per_key, retry_with_backoff, BackoffPolicy, Reconciler, Store,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "campwatch-sync";

/// Runtime configuration, loaded from `CAMPWATCH_*` environment variables
/// with reference-deployment defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Recurring trigger cadence (seconds-resolution cron).
    pub cron_expression: String,
    pub jitter_min_secs: u64,
    pub jitter_max_secs: u64,
    /// Site identity stamped onto every extracted observation.
    pub camping_name: String,
    pub region: String,
    pub site: SiteConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cron_expression: "0 */10 * * * *".to_string(),
            jitter_min_secs: 30,
            jitter_max_secs: 120,
            camping_name: "다리안계곡캠핑장".to_string(),
            region: "충북 단양".to_string(),
            site: SiteConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut site = defaults.site;
        site.base_url = env_or("CAMPWATCH_CALENDAR_URL", &site.base_url);
        site.base_params = env_or("CAMPWATCH_CALENDAR_PARAMS", &site.base_params);
        site.launch_timeout = env_secs("CAMPWATCH_LAUNCH_TIMEOUT_SECS", site.launch_timeout);
        site.render_timeout = env_secs("CAMPWATCH_RENDER_TIMEOUT_SECS", site.render_timeout);
        site.month_timeout = env_secs("CAMPWATCH_MONTH_TIMEOUT_SECS", site.month_timeout);

        Self {
            cron_expression: env_or("CAMPWATCH_CRON", &defaults.cron_expression),
            jitter_min_secs: env_u64("CAMPWATCH_JITTER_MIN_SECS", defaults.jitter_min_secs),
            jitter_max_secs: env_u64("CAMPWATCH_JITTER_MAX_SECS", defaults.jitter_max_secs),
            camping_name: env_or("CAMPWATCH_CAMPING_NAME", &defaults.camping_name),
            region: env_or("CAMPWATCH_REGION", &defaults.region),
            site,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_secs(env_u64(key, default.as_secs()))
}

/// Outcome of one completed scrape cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub months: Vec<YearMonth>,
    pub items_scraped: usize,
    pub notifications_sent: usize,
}

/// Explicit scheduler lifecycle; starting twice warns and no-ops, stopping
/// when not started no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

/// Ties the pipeline together: owns the ScrapeRun lifecycle, the run lock
/// and the recurring trigger.
pub struct Orchestrator {
    config: AppConfig,
    store: Arc<dyn Store>,
    source: Arc<dyn CalendarSource>,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    run_lock: Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    scheduler: Mutex<Option<JobScheduler>>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn Store>,
        source: Arc<dyn CalendarSource>,
        messenger: Arc<dyn Messenger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: Dispatcher::new(Arc::clone(&store), messenger),
            reconciler: Reconciler::new(Arc::clone(&store)),
            config,
            store,
            source,
            run_lock: Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
            scheduler: Mutex::new(None),
        })
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().await
    }

    /// Register the recurring trigger. Starting an already-running
    /// orchestrator warns and returns without side effects.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Running {
            warn!("scheduler already running, start is a no-op");
            return Ok(());
        }

        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let orchestrator = Arc::clone(self);
        let job = Job::new_async(self.config.cron_expression.as_str(), move |_id, _scheduler| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                orchestrator.scheduled_tick().await;
            })
        })
        .with_context(|| format!("creating job for cron {}", self.config.cron_expression))?;
        scheduler.add(job).await.context("adding scheduled job")?;
        scheduler.start().await.context("starting scheduler")?;

        *self.scheduler.lock().await = Some(scheduler);
        *lifecycle = Lifecycle::Running;
        info!(cron = %self.config.cron_expression, "scheduler started");
        Ok(())
    }

    /// Stop the recurring trigger; a no-op unless currently running.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle != Lifecycle::Running {
            info!("scheduler not running, stop is a no-op");
            return;
        }
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            if let Err(error) = scheduler.shutdown().await {
                warn!(%error, "scheduler shutdown reported an error");
            }
        }
        *lifecycle = Lifecycle::Stopped;
        info!("scheduler stopped");
    }

    /// One timer trigger. Errors are logged, never propagated: the next
    /// trigger simply tries again.
    async fn scheduled_tick(&self) {
        match self.scheduled_tick_with(Utc::now).await {
            Ok(Some(summary)) => info!(
                run_id = %summary.run_id,
                items = summary.items_scraped,
                notified = summary.notifications_sent,
                "scheduled run complete"
            ),
            Ok(None) => {}
            Err(error) => error!(error = %format!("{error:#}"), "scheduled run failed"),
        }
    }

    /// Timer trigger body with an injectable gate clock. Returns `None` when
    /// a skip gate fired (no run record is written in that case).
    pub async fn scheduled_tick_with<F>(&self, clock: F) -> Result<Option<RunSummary>>
    where
        F: Fn() -> DateTime<Utc>,
    {
        // Run lock held from before JitterWait through RunComplete. A trigger
        // arriving while a run is in flight is a clean skip, not an error.
        let Ok(_running) = self.run_lock.try_lock() else {
            info!("previous run still in flight, skipping this trigger");
            return Ok(None);
        };

        let delay = jitter_delay(self.config.jitter_min_secs, self.config.jitter_max_secs);
        info!(delay_secs = delay.as_secs(), "trigger fired, applying jitter delay");
        tokio::time::sleep(delay).await;

        // Gates read the clock after the jitter wait; a trigger shortly
        // before 01:00 must not scrape inside the quiet window.
        let now = clock();
        if is_quiet_hours(now) {
            info!("quiet hours, skipping scrape");
            return Ok(None);
        }

        let criteria = retry_with_backoff(BackoffPolicy::STORE, "load active criteria", || {
            self.store.active_criteria()
        })
        .await
        .context("loading active criteria")?;

        if !any_relevant_criteria(&criteria, now) {
            info!("no active criteria with relevant dates, skipping scrape");
            return Ok(None);
        }

        self.run_cycle(&criteria).await.map(Some)
    }

    /// Manual trigger: runs Fetching through RunComplete immediately,
    /// bypassing the jitter/quiet-hours/relevance gates. Waits for any
    /// in-flight run to finish first.
    pub async fn run_now(&self) -> Result<RunSummary> {
        info!("manual scrape triggered");
        let _running = self.run_lock.lock().await;
        let criteria = retry_with_backoff(BackoffPolicy::STORE, "load active criteria", || {
            self.store.active_criteria()
        })
        .await
        .context("loading active criteria")?;
        self.run_cycle(&criteria).await
    }

    /// Fetching through RunComplete. The run record is finalized on every
    /// path, including failure, and the failure is re-raised afterwards.
    async fn run_cycle(&self, criteria: &[WatchCriterion]) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = retry_with_backoff(BackoffPolicy::STORE, "create scrape run", || {
            self.store.create_run(ScrapeRun::started(started_at))
        })
        .await
        .context("creating scrape run")?;

        let months = months_to_fetch(criteria, started_at);
        let mut items_scraped = 0usize;
        let result = self.execute(&months, &mut items_scraped).await;

        let outcome = match &result {
            Ok(_) => RunOutcome::Success { items_scraped },
            Err(error) => RunOutcome::Error {
                items_scraped,
                message: format!("{error:#}"),
            },
        };
        if let Err(finalize_error) =
            retry_with_backoff(BackoffPolicy::STORE, "finalize scrape run", || {
                self.store.finalize_run(run_id, outcome.clone())
            })
            .await
        {
            error!(%run_id, %finalize_error, "failed to finalize scrape run");
        }

        let notifications_sent = result?;
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            months,
            items_scraped,
            notifications_sent,
        })
    }

    /// Fetch each target month sequentially, persist, match and dispatch.
    /// Returns the number of notifications sent.
    async fn execute(&self, months: &[YearMonth], items_scraped: &mut usize) -> Result<usize> {
        let tokens: Vec<String> = months.iter().map(ToString::to_string).collect();
        info!(months = ?tokens, "starting scrape cycle");

        let session = self
            .source
            .open_session()
            .await
            .context("opening calendar session")?;
        // The session is released on every exit path; close() escalates a
        // failed graceful release to a forceful kill internally.
        let fetched = self.fetch_months(session.as_ref(), months, items_scraped).await;
        session.close().await;
        let observations = fetched?;

        let fresh = retry_with_backoff(BackoffPolicy::STORE, "persist availability", || {
            self.reconciler.persist(observations.clone())
        })
        .await
        .context("persisting availability")?;
        info!(persisted = fresh.len(), "availability persisted");

        let recent = retry_with_backoff(BackoffPolicy::STORE, "load recent availability", || {
            self.reconciler.current_availability(None)
        })
        .await
        .context("loading recent availability")?;

        // Match against the freshly persisted records plus the recent
        // window, collapsed to the current value per slot. Sorted for a
        // deterministic first-match choice.
        let mut pool = fresh;
        pool.extend(recent);
        let mut view = latest_per_key(pool);
        view.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.area.cmp(&b.area)));

        let active = retry_with_backoff(BackoffPolicy::STORE, "reload active criteria", || {
            self.store.active_criteria()
        })
        .await
        .context("reloading active criteria")?;

        let matched = matcher::evaluate(&active, &view);
        let sent = self
            .dispatcher
            .dispatch(&matched)
            .await
            .context("dispatching notifications")?;
        Ok(sent)
    }

    async fn fetch_months(
        &self,
        session: &dyn CalendarSession,
        months: &[YearMonth],
        items_scraped: &mut usize,
    ) -> Result<Vec<NewAvailability>> {
        let mut all = Vec::new();
        for &month in months {
            // One month failing after retries aborts the remaining months.
            let observations =
                retry_with_backoff(BackoffPolicy::SCRAPING, "fetch calendar month", || {
                    session.fetch_month(month)
                })
                .await
                .with_context(|| format!("fetching month {month}"))?;
            *items_scraped += observations.len();
            info!(month = %month, entries = observations.len(), "scraped month");
            all.extend(observations.into_iter().map(|obs| {
                NewAvailability::from_observation(obs, &self.config.camping_name, &self.config.region)
            }));
        }
        Ok(all)
    }
}
