//! Notification dispatch: at-most-once email per watch criterion.
//!
//! The dispatcher owns all writes to the notification collection and the
//! `is_active` flip on criteria. The read-before-write guard on the
//! notification record is the sole duplicate-send protection; it also repairs
//! the half-done state where a prior run notified but failed to deactivate.

use std::sync::Arc;

use async_trait::async_trait;
use campwatch_core::{matcher, AvailabilityRecord, NotificationRecord, UserProfile, WatchCriterion};
use campwatch_store::{retry_with_fixed_delay, FixedDelayPolicy, Store, StoreError};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "campwatch-notify";

/// Delivery channel recorded on every notification.
pub const CHANNEL_EMAIL: &str = "email";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("smtp transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("email build error: {0}")]
    Build(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("messaging channel failure: {0}")]
    Channel(String),
}

/// Messaging-channel contract: deliver an HTML message, return a delivery id.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str)
        -> Result<String, NotifyError>;
}

/// Default sender when `SMTP_FROM` is not set.
const DEFAULT_FROM_ADDRESS: &str = "캠핑장 알림 <noreply@campwatch.local>";

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub from_address: String,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
}

impl SmtpConfig {
    /// Load from environment. Returns `None` when `SMTP_HOST` is unset,
    /// signalling that mail delivery is not configured.
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("SMTP_HOST").ok()?;
        Some(Self {
            smtp_host,
            smtp_port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            from_address: std::env::var("SMTP_FROM")
                .unwrap_or_else(|_| DEFAULT_FROM_ADDRESS.to_string()),
            smtp_user: std::env::var("SMTP_USER").ok(),
            smtp_password: std::env::var("SMTP_PASSWORD").ok(),
        })
    }
}

/// SMTP messenger backed by `lettre`'s async transport.
pub struct SmtpMessenger {
    config: SmtpConfig,
}

impl SmtpMessenger {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Messenger for SmtpMessenger {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<String, NotifyError> {
        use lettre::{
            message::header::ContentType, transport::smtp::authentication::Credentials,
            AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
        };

        let email = Message::builder()
            .from(self.config.from_address.parse()?)
            .to(to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .map_err(|e| NotifyError::Build(e.to_string()))?;

        let mut transport_builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)?
                .port(self.config.smtp_port);

        if let (Some(user), Some(pass)) = (&self.config.smtp_user, &self.config.smtp_password) {
            transport_builder =
                transport_builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let mailer = transport_builder.build();
        let response = mailer.send(email).await?;

        info!(to, "notification email sent");
        Ok(response.code().to_string())
    }
}

/// Delivery address resolution: a notification-specific address wins over
/// the primary email; an absent or blank pair means no deliverable address.
pub fn resolve_notification_address(profile: Option<&UserProfile>) -> Option<String> {
    let profile = profile?;
    profile
        .notification_email
        .as_deref()
        .or(profile.email.as_deref())
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
}

pub fn reservation_subject(target: &AvailabilityRecord) -> String {
    format!("🏕️ 캠핑장 예약 가능! - {}", target.camping_name)
}

pub fn reservation_html(target: &AvailabilityRecord) -> String {
    format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h2 style="color: #2ecc71;">🏕️ 캠핑장 예약이 가능합니다!</h2>
  <div style="background-color: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0;">
    <h3 style="margin-top: 0;">예약 정보</h3>
    <p><strong>캠핑장:</strong> {camping}</p>
    <p><strong>지역:</strong> {region}</p>
    <p><strong>구역:</strong> {area}</p>
    <p><strong>날짜:</strong> {date}</p>
    <p><strong>예약 가능 수:</strong> <span style="color: #e74c3c; font-size: 18px; font-weight: bold;">{count}</span></p>
  </div>
  <p style="color: #e74c3c; font-weight: bold;">⚠️ 빠르게 예약하세요! 자리가 곧 마감될 수 있습니다.</p>
  <div style="margin-top: 30px; padding-top: 20px; border-top: 1px solid #e0e0e0; font-size: 12px; color: #7f8c8d;">
    <p>이 알림은 회원님의 설정에 따라 자동으로 발송되었습니다.</p>
    <p>알림을 중지하려면 설정에서 해당 조건을 비활성화하세요.</p>
  </div>
</div>"#,
        camping = target.camping_name,
        region = target.region,
        area = target.area,
        date = target.date,
        count = target.available_count,
    )
}

/// Sends at most one notification per criterion and deactivates it.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
    retry: FixedDelayPolicy,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            store,
            messenger,
            retry: FixedDelayPolicy::EMAIL,
        }
    }

    pub fn with_retry(mut self, retry: FixedDelayPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Process every matched criterion. A failure on one criterion does not
    /// abort the others; the first error is reported afterwards so the run
    /// is recorded as failed. Returns the number of notifications sent.
    pub async fn dispatch(
        &self,
        matched: &[(&WatchCriterion, Vec<&AvailabilityRecord>)],
    ) -> Result<usize, NotifyError> {
        let mut sent = 0usize;
        let mut first_error = None;

        for (criterion, matches) in matched {
            match self.notify_criterion(criterion, matches).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(
                        criterion_id = %criterion.id,
                        %error,
                        "notification failed, criterion stays active for the next run"
                    );
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(sent),
        }
    }

    async fn notify_criterion(
        &self,
        criterion: &WatchCriterion,
        matches: &[&AvailabilityRecord],
    ) -> Result<bool, NotifyError> {
        // Read-gate immediately before any write. A record here means a prior
        // attempt already notified; make sure deactivation stuck and stop.
        if self.store.notification_for(criterion.id).await?.is_some() {
            info!(
                criterion_id = %criterion.id,
                "already notified, ensuring criterion is deactivated"
            );
            self.store.deactivate_criterion(criterion.id).await?;
            return Ok(false);
        }

        let Some(target) = matcher::select_notification_target(matches) else {
            return Ok(false);
        };

        let profile = self.store.user_profile(&criterion.owner_id).await?;
        let Some(address) = resolve_notification_address(profile.as_ref()) else {
            warn!(
                owner_id = %criterion.owner_id,
                criterion_id = %criterion.id,
                "no deliverable address, skipping notification"
            );
            return Ok(false);
        };

        let subject = reservation_subject(target);
        let body = reservation_html(target);
        let delivery_id = retry_with_fixed_delay(self.retry, "email", || {
            self.messenger.send(&address, &subject, &body)
        })
        .await?;

        self.store
            .append_notification(NotificationRecord {
                id: Uuid::new_v4(),
                owner_id: criterion.owner_id.clone(),
                criterion_id: criterion.id,
                camping_name: target.camping_name.clone(),
                area: target.area.clone(),
                date: target.date,
                available_count: target.available_count,
                channel: CHANNEL_EMAIL.to_string(),
                sent_at: Utc::now(),
            })
            .await?;
        self.store.deactivate_criterion(criterion.id).await?;

        info!(
            criterion_id = %criterion.id,
            delivery_id,
            camping = %target.camping_name,
            area = %target.area,
            date = %target.date,
            "notification sent and criterion deactivated"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campwatch_store::MemoryStore;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeMessenger {
        sent: Mutex<Vec<(String, String)>>,
        fail: AtomicBool,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        async fn send(
            &self,
            to: &str,
            subject: &str,
            _html_body: &str,
        ) -> Result<String, NotifyError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(NotifyError::Channel("smtp down".to_string()));
            }
            self.sent
                .lock()
                .await
                .push((to.to_string(), subject.to_string()));
            Ok("250".to_string())
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn record(area: &str, day: &str, count: u32) -> AvailabilityRecord {
        AvailabilityRecord {
            id: Uuid::new_v4(),
            camping_name: "다리안계곡캠핑장".to_string(),
            region: "충북 단양".to_string(),
            area: area.to_string(),
            date: date(day),
            available_count: count,
            scraped_at: Utc::now(),
        }
    }

    fn user(id: &str, email: Option<&str>, notification_email: Option<&str>) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            email: email.map(str::to_string),
            notification_email: notification_email.map(str::to_string),
        }
    }

    fn fast_retry() -> FixedDelayPolicy {
        FixedDelayPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(1),
        }
    }

    async fn setup(
        profile: Option<UserProfile>,
    ) -> (Arc<MemoryStore>, Arc<FakeMessenger>, Dispatcher, WatchCriterion) {
        let store = Arc::new(MemoryStore::new());
        if let Some(p) = profile {
            store.insert_user(p).await;
        }
        let criterion = WatchCriterion::new(
            "u1",
            Some("다리안계곡캠핑장".to_string()),
            None,
            vec![],
            Some("2025-11-01"),
            Some("2025-11-30"),
        );
        store.insert_criterion(criterion.clone()).await;
        let messenger = Arc::new(FakeMessenger::default());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&messenger) as Arc<dyn Messenger>,
        )
        .with_retry(fast_retry());
        (store, messenger, dispatcher, criterion)
    }

    #[test]
    fn address_resolution_prefers_notification_email() {
        let p = user("u1", Some("a@b.kr"), Some("alerts@b.kr"));
        assert_eq!(
            resolve_notification_address(Some(&p)),
            Some("alerts@b.kr".to_string())
        );
        let p = user("u1", Some("a@b.kr"), None);
        assert_eq!(
            resolve_notification_address(Some(&p)),
            Some("a@b.kr".to_string())
        );
        let p = user("u1", Some("   "), None);
        assert_eq!(resolve_notification_address(Some(&p)), None);
        assert_eq!(resolve_notification_address(None), None);
    }

    #[tokio::test]
    async fn dispatching_twice_sends_exactly_once() {
        let (store, messenger, dispatcher, criterion) =
            setup(Some(user("u1", Some("a@b.kr"), None))).await;
        let r1 = record("A구역", "2025-11-10", 2);
        let r2 = record("B구역", "2025-11-12", 1);
        let matched = vec![(&criterion, vec![&r1, &r2])];

        assert_eq!(dispatcher.dispatch(&matched).await.unwrap(), 1);
        assert_eq!(dispatcher.dispatch(&matched).await.unwrap(), 0);

        let notifications = store.notifications().await;
        assert_eq!(notifications.len(), 1);
        // First match by input order, one mail only.
        assert_eq!(notifications[0].area, "A구역");
        assert_eq!(notifications[0].channel, "email");
        assert_eq!(messenger.sent.lock().await.len(), 1);
        assert!(store.active_criteria().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn existing_record_repairs_missed_deactivation_without_resending() {
        let (store, messenger, dispatcher, criterion) =
            setup(Some(user("u1", Some("a@b.kr"), None))).await;
        let r = record("A구역", "2025-11-10", 2);
        store
            .append_notification(NotificationRecord {
                id: Uuid::new_v4(),
                owner_id: "u1".to_string(),
                criterion_id: criterion.id,
                camping_name: r.camping_name.clone(),
                area: r.area.clone(),
                date: r.date,
                available_count: r.available_count,
                channel: CHANNEL_EMAIL.to_string(),
                sent_at: Utc::now(),
            })
            .await
            .unwrap();

        let matched = vec![(&criterion, vec![&r])];
        assert_eq!(dispatcher.dispatch(&matched).await.unwrap(), 0);
        assert!(messenger.sent.lock().await.is_empty());
        assert!(store.active_criteria().await.unwrap().is_empty());
        assert_eq!(store.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_address_skips_and_leaves_criterion_active() {
        let (store, messenger, dispatcher, criterion) = setup(None).await;
        let r = record("A구역", "2025-11-10", 2);
        let matched = vec![(&criterion, vec![&r])];

        assert_eq!(dispatcher.dispatch(&matched).await.unwrap(), 0);
        assert!(messenger.sent.lock().await.is_empty());
        assert!(store.notifications().await.is_empty());
        assert_eq!(store.active_criteria().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_failure_retries_then_keeps_criterion_active() {
        let (store, messenger, dispatcher, criterion) =
            setup(Some(user("u1", Some("a@b.kr"), None))).await;
        messenger.fail.store(true, Ordering::SeqCst);
        let r = record("A구역", "2025-11-10", 2);
        let matched = vec![(&criterion, vec![&r])];

        let err = dispatcher.dispatch(&matched).await.unwrap_err();
        assert!(matches!(err, NotifyError::Channel(_)));
        assert_eq!(messenger.attempts.load(Ordering::SeqCst), 2);
        // No record written, so the next run can try again safely.
        assert!(store.notifications().await.is_empty());
        assert_eq!(store.active_criteria().await.unwrap().len(), 1);
    }
}
