//! Core domain model, criteria matching and time/window policy for campwatch.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "campwatch-core";

/// The target site publishes its calendar in Korea Standard Time (UTC+9).
pub const SITE_UTC_OFFSET_SECS: i32 = 9 * 3600;

/// Quiet hours: scraping is suppressed while the local civil hour is in
/// [`QUIET_HOURS_START`, `QUIET_HOURS_END`).
pub const QUIET_HOURS_START: u32 = 1;
pub const QUIET_HOURS_END: u32 = 8;

/// One availability entry as observed on a rendered calendar page, before it
/// is attributed to a camping site and stamped by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotObservation {
    pub area: String,
    pub date: NaiveDate,
    pub available_count: u32,
}

/// An availability observation attributed to a camping site, ready to be
/// appended to the store. The reconciler stamps `scraped_at` on write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAvailability {
    pub camping_name: String,
    pub region: String,
    pub area: String,
    pub date: NaiveDate,
    pub available_count: u32,
}

impl NewAvailability {
    pub fn from_observation(obs: SlotObservation, camping_name: &str, region: &str) -> Self {
        Self {
            camping_name: camping_name.to_string(),
            region: region.to_string(),
            area: obs.area,
            date: obs.date,
            available_count: obs.available_count,
        }
    }
}

/// Persisted availability observation. Multiple records may share the logical
/// key `(camping_name, region, area, date)`; the current value for a key is
/// the record with the latest `scraped_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub id: Uuid,
    pub camping_name: String,
    pub region: String,
    pub area: String,
    pub date: NaiveDate,
    pub available_count: u32,
    pub scraped_at: DateTime<Utc>,
}

impl AvailabilityRecord {
    pub fn logical_key(&self) -> (&str, &str, &str, NaiveDate) {
        (&self.camping_name, &self.region, &self.area, self.date)
    }
}

/// A user's saved watch request. Deactivated exactly once, either by the
/// dispatcher after a notification or administratively; never reactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCriterion {
    pub id: Uuid,
    pub owner_id: String,
    pub camping_name: Option<String>,
    pub region: Option<String>,
    /// Target areas; empty matches any area.
    pub areas: Vec<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl WatchCriterion {
    /// Build a criterion from user-supplied fields. Date strings are parsed
    /// leniently: a malformed date becomes "no bound on that side" rather
    /// than an error. `date_to` defaults to `date_from` when unset.
    pub fn new(
        owner_id: impl Into<String>,
        camping_name: Option<String>,
        region: Option<String>,
        areas: Vec<String>,
        date_from: Option<&str>,
        date_to: Option<&str>,
    ) -> Self {
        let date_from = date_from.and_then(parse_watch_date);
        let date_to = date_to.and_then(parse_watch_date).or(date_from);
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            camping_name,
            region,
            areas,
            date_from,
            date_to,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Whether this criterion can still be satisfied on or after `today`.
    /// A criterion with no dates at all is always eligible.
    pub fn is_relevant_on(&self, today: NaiveDate) -> bool {
        match (self.date_from, self.date_to) {
            (None, None) => true,
            (_, Some(to)) => to >= today,
            (Some(from), None) => from >= today,
        }
    }
}

/// Parse a user-supplied watch date, treating malformed input as absent.
pub fn parse_watch_date(raw: &str) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(error) => {
            tracing::warn!(raw, %error, "ignoring malformed watch date");
            None
        }
    }
}

/// Owner profile fields the dispatcher consults for delivery addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: Option<String>,
    pub notification_email: Option<String>,
}

/// Immutable record of a sent notification. At most one exists per
/// criterion id; that uniqueness is the sole duplicate-send guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub criterion_id: Uuid,
    pub camping_name: String,
    pub area: String,
    pub date: NaiveDate,
    pub available_count: u32,
    pub channel: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One scrape execution that passed the skip gates. Created with status
/// `running` and finalized exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items_scraped: usize,
    pub error_message: Option<String>,
}

impl ScrapeRun {
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            items_scraped: 0,
            error_message: None,
        }
    }
}

/// Final state written to a [`ScrapeRun`] when a run completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success { items_scraped: usize },
    Error { items_scraped: usize, message: String },
}

/// A calendar month token, rendered as `YYYY-MM` in site URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn succ(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Current civil time at the target site (fixed UTC+9, no DST).
pub fn site_local_time(now: DateTime<Utc>) -> DateTime<FixedOffset> {
    match FixedOffset::east_opt(SITE_UTC_OFFSET_SECS) {
        Some(offset) => now.with_timezone(&offset),
        None => now.fixed_offset(),
    }
}

/// True while the site-local hour falls within quiet hours. The scheduler
/// skips the trigger entirely: no run record, no network activity.
pub fn is_quiet_hours(now: DateTime<Utc>) -> bool {
    let hour = site_local_time(now).hour();
    (QUIET_HOURS_START..QUIET_HOURS_END).contains(&hour)
}

/// Uniformly random whole-second delay in the closed interval
/// `[min_seconds, max_seconds]`, used to desynchronize scheduled runs.
pub fn jitter_delay(min_seconds: u64, max_seconds: u64) -> Duration {
    let (lo, hi) = if min_seconds <= max_seconds {
        (min_seconds, max_seconds)
    } else {
        (max_seconds, min_seconds)
    };
    Duration::from_secs(rand::thread_rng().gen_range(lo..=hi))
}

/// Months the extractor should fetch for the given active criteria.
///
/// Each criterion contributes every month in `[date_from, date_to]`, or the
/// single bounded month when only one side is present. The result is the
/// sorted, deduplicated union; when it is empty (no criteria, or none carry
/// dates) the default of the current site-local month plus the next two is
/// used instead.
pub fn months_to_fetch(criteria: &[WatchCriterion], now: DateTime<Utc>) -> Vec<YearMonth> {
    let mut months = BTreeSet::new();

    for criterion in criteria {
        match (criterion.date_from, criterion.date_to) {
            (None, None) => {}
            (Some(from), None) => {
                months.insert(YearMonth::of(from));
            }
            (None, Some(to)) => {
                months.insert(YearMonth::of(to));
            }
            (Some(from), Some(to)) => {
                let mut cursor = YearMonth::of(from);
                let end = YearMonth::of(to);
                while cursor <= end {
                    months.insert(cursor);
                    cursor = cursor.succ();
                }
            }
        }
    }

    if months.is_empty() {
        let mut cursor = YearMonth::of(site_local_time(now).date_naive());
        for _ in 0..3 {
            months.insert(cursor);
            cursor = cursor.succ();
        }
    }

    months.into_iter().collect()
}

/// True when at least one criterion could still match on or after today
/// (site-local). Drives the orchestrator's ActiveCriteriaCheck gate.
pub fn any_relevant_criteria(criteria: &[WatchCriterion], now: DateTime<Utc>) -> bool {
    let today = site_local_time(now).date_naive();
    criteria.iter().any(|c| c.is_relevant_on(today))
}

pub mod matcher {
    //! Criteria matching: five AND-ed predicates per (criterion, record) pair.

    use super::{AvailabilityRecord, WatchCriterion};

    /// All five predicates must hold:
    /// camping name equality when specified, region equality when specified,
    /// area-set membership (empty set matches any area), inclusive date
    /// range with absent bounds unbounded, and a strictly positive count.
    pub fn matches(criterion: &WatchCriterion, record: &AvailabilityRecord) -> bool {
        if let Some(camping_name) = &criterion.camping_name {
            if record.camping_name != *camping_name {
                return false;
            }
        }
        if let Some(region) = &criterion.region {
            if record.region != *region {
                return false;
            }
        }
        if !criterion.areas.is_empty() && !criterion.areas.contains(&record.area) {
            return false;
        }
        if let Some(from) = criterion.date_from {
            if record.date < from {
                return false;
            }
        }
        if let Some(to) = criterion.date_to {
            if record.date > to {
                return false;
            }
        }
        record.available_count > 0
    }

    /// Evaluate every (criterion, record) pair, preserving input order on
    /// both axes. Criteria with no matches are omitted. O(criteria × records)
    /// is acceptable at the expected scale.
    pub fn evaluate<'a>(
        criteria: &'a [WatchCriterion],
        records: &'a [AvailabilityRecord],
    ) -> Vec<(&'a WatchCriterion, Vec<&'a AvailabilityRecord>)> {
        criteria
            .iter()
            .filter_map(|criterion| {
                let matched: Vec<_> = records
                    .iter()
                    .filter(|record| matches(criterion, record))
                    .collect();
                if matched.is_empty() {
                    None
                } else {
                    Some((criterion, matched))
                }
            })
            .collect()
    }

    /// The notification target is the first match in input order. One mail
    /// per criterion per run; matching slots beyond the first are dropped,
    /// not queued.
    pub fn select_notification_target<'a>(
        matched: &[&'a AvailabilityRecord],
    ) -> Option<&'a AvailabilityRecord> {
        matched.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn record(camping: &str, region: &str, area: &str, day: &str, count: u32) -> AvailabilityRecord {
        AvailabilityRecord {
            id: Uuid::new_v4(),
            camping_name: camping.to_string(),
            region: region.to_string(),
            area: area.to_string(),
            date: date(day),
            available_count: count,
            scraped_at: utc(2025, 11, 1, 12, 0),
        }
    }

    fn criterion(
        camping: Option<&str>,
        region: Option<&str>,
        areas: &[&str],
        from: Option<&str>,
        to: Option<&str>,
    ) -> WatchCriterion {
        WatchCriterion::new(
            "user-1",
            camping.map(str::to_string),
            region.map(str::to_string),
            areas.iter().map(|s| s.to_string()).collect(),
            from,
            to,
        )
    }

    #[test]
    fn quiet_hours_cover_one_to_eight_kst() {
        // 16:30 UTC = 01:30 KST
        assert!(is_quiet_hours(utc(2025, 11, 14, 16, 30)));
        // 22:59 UTC = 07:59 KST
        assert!(is_quiet_hours(utc(2025, 11, 14, 22, 59)));
        // 23:00 UTC = 08:00 KST, the quiet window is half-open
        assert!(!is_quiet_hours(utc(2025, 11, 14, 23, 0)));
        // 15:59 UTC = 00:59 KST
        assert!(!is_quiet_hours(utc(2025, 11, 14, 15, 59)));
    }

    #[test]
    fn jitter_stays_in_closed_interval() {
        for _ in 0..200 {
            let delay = jitter_delay(30, 120);
            assert!(delay >= Duration::from_secs(30));
            assert!(delay <= Duration::from_secs(120));
        }
        assert_eq!(jitter_delay(7, 7), Duration::from_secs(7));
    }

    #[test]
    fn default_months_are_three_consecutive() {
        let months = months_to_fetch(&[], utc(2025, 11, 14, 12, 0));
        let tokens: Vec<String> = months.iter().map(ToString::to_string).collect();
        assert_eq!(tokens, vec!["2025-11", "2025-12", "2026-01"]);
    }

    #[test]
    fn criteria_months_span_the_range() {
        let c = criterion(None, None, &[], Some("2025-11-05"), Some("2026-01-10"));
        let months = months_to_fetch(&[c], utc(2025, 10, 1, 12, 0));
        let tokens: Vec<String> = months.iter().map(ToString::to_string).collect();
        assert_eq!(tokens, vec!["2025-11", "2025-12", "2026-01"]);
    }

    #[test]
    fn dateless_criteria_fall_back_to_default_months() {
        let c = criterion(Some("X"), None, &[], None, None);
        let months = months_to_fetch(&[c], utc(2025, 11, 14, 12, 0));
        assert_eq!(months.len(), 3);
        assert_eq!(months[0].to_string(), "2025-11");
    }

    #[test]
    fn overlapping_criteria_months_are_deduplicated_and_sorted() {
        let a = criterion(None, None, &[], Some("2025-12-01"), Some("2025-12-31"));
        let b = criterion(None, None, &[], Some("2025-11-20"), Some("2025-12-05"));
        let months = months_to_fetch(&[a, b], utc(2025, 10, 1, 12, 0));
        let tokens: Vec<String> = months.iter().map(ToString::to_string).collect();
        assert_eq!(tokens, vec!["2025-11", "2025-12"]);
    }

    #[test]
    fn date_to_defaults_to_date_from() {
        let c = criterion(None, None, &[], Some("2025-11-10"), None);
        assert_eq!(c.date_from, Some(date("2025-11-10")));
        assert_eq!(c.date_to, Some(date("2025-11-10")));
    }

    #[test]
    fn malformed_dates_are_treated_as_unbounded() {
        let c = criterion(None, None, &[], Some("not-a-date"), Some("2025/11/10"));
        assert_eq!(c.date_from, None);
        assert_eq!(c.date_to, None);
        // Still eligible: no dates counts as always relevant.
        assert!(c.is_relevant_on(date("2030-01-01")));
    }

    #[test]
    fn relevance_gate_honors_future_bounds() {
        let today = date("2025-11-14");
        assert!(criterion(None, None, &[], None, Some("2025-11-14")).is_relevant_on(today));
        assert!(!criterion(None, None, &[], None, Some("2025-11-13")).is_relevant_on(today));
        assert!(criterion(None, None, &[], Some("2025-12-01"), None).is_relevant_on(today));
    }

    #[test]
    fn match_requires_all_five_predicates() {
        let c = criterion(
            Some("다리안계곡캠핑장"),
            Some("충북 단양"),
            &["A구역"],
            Some("2025-11-01"),
            Some("2025-11-30"),
        );
        let ok = record("다리안계곡캠핑장", "충북 단양", "A구역", "2025-11-10", 2);
        assert!(matcher::matches(&c, &ok));

        // Violate exactly one predicate at a time.
        let mut bad = ok.clone();
        bad.camping_name = "다른캠핑장".to_string();
        assert!(!matcher::matches(&c, &bad));

        let mut bad = ok.clone();
        bad.region = "강원 평창".to_string();
        assert!(!matcher::matches(&c, &bad));

        let mut bad = ok.clone();
        bad.area = "B구역".to_string();
        assert!(!matcher::matches(&c, &bad));

        let mut bad = ok.clone();
        bad.date = date("2025-12-01");
        assert!(!matcher::matches(&c, &bad));

        let mut bad = ok.clone();
        bad.available_count = 0;
        assert!(!matcher::matches(&c, &bad));
    }

    #[test]
    fn empty_area_set_matches_any_area() {
        let c = criterion(Some("X"), None, &[], None, None);
        let r = record("X", "anywhere", "Z구역", "2025-11-10", 1);
        assert!(matcher::matches(&c, &r));
    }

    #[test]
    fn evaluate_preserves_record_order_and_drops_empty() {
        let c1 = criterion(Some("X"), None, &[], None, None);
        let c2 = criterion(Some("Y"), None, &[], None, None);
        let records = vec![
            record("X", "r", "B", "2025-11-12", 1),
            record("X", "r", "A", "2025-11-10", 3),
        ];
        let criteria = vec![c1.clone(), c2];
        let evaluated = matcher::evaluate(&criteria, &records);
        assert_eq!(evaluated.len(), 1);
        assert_eq!(evaluated[0].0.id, c1.id);
        assert_eq!(evaluated[0].1.len(), 2);
        let target = matcher::select_notification_target(&evaluated[0].1).unwrap();
        assert_eq!(target.area, "B");
    }
}
