//! Calendar page rendering and availability extraction.
//!
//! The target site renders its booking calendar with client-side scripts, so
//! extraction drives a headless Chromium session per run: navigate to the
//! month view, wait for the page to settle, then parse availability entries
//! out of the rendered DOM. A fixture-backed source is provided for tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use campwatch_core::{SlotObservation, YearMonth};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use chrono::NaiveDate;
use futures::StreamExt;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

pub const CRATE_NAME: &str = "campwatch-extract";

/// Fixed post-navigation settle delay for script-driven calendar cells.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("page render timed out after {0:?}")]
    RenderTimeout(Duration),
    #[error("month fetch timed out after {0:?}")]
    MonthTimeout(Duration),
    #[error("selector parse failed: {0}")]
    Selector(String),
    #[error("no fixture for month {0}")]
    FixtureMissing(String),
}

/// Target calendar endpoint and timeout budget.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub base_url: String,
    /// Fixed query-string block the calendar endpoint expects.
    pub base_params: String,
    pub launch_timeout: Duration,
    pub render_timeout: Duration,
    /// Overall budget per month fetch, navigation through parsing.
    pub month_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://mirihae.com/camping/calendar.do".to_string(),
            base_params: "checkType=&device=pc&groupCode=dytc&selectStartDate=&selectEndDate=&selectItemId=&selectTicketId=&cnt=&infoType=&approvalId=&txId=".to_string(),
            launch_timeout: Duration::from_secs(30),
            render_timeout: Duration::from_secs(30),
            month_timeout: Duration::from_secs(300),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl SiteConfig {
    pub fn month_url(&self, month: YearMonth) -> String {
        format!("{}?{}&selectMonth={}", self.base_url, self.base_params, month)
    }
}

/// One rendering session, scoped to a single scrape run. Month fetches run
/// sequentially against it; [`CalendarSession::close`] must be called on
/// every exit path.
#[async_trait]
pub trait CalendarSession: Send + Sync {
    async fn fetch_month(&self, month: YearMonth) -> Result<Vec<SlotObservation>, ExtractError>;

    /// Release rendering resources. Release failures are logged and
    /// escalated to a forceful kill, never returned to the caller.
    async fn close(self: Box<Self>);
}

/// Factory for per-run calendar sessions.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn CalendarSession>, ExtractError>;
}

/// Parse availability entries out of a rendered calendar page.
///
/// The page keys each calendar day by a `div` whose id is an ISO date; every
/// `dl.schedule` inside it carries one entry with the open-slot count in
/// `dt` and the area label in `dd`. Non-date container ids are noise and
/// skipped, as are entries with a blank area label. A non-numeric count
/// parses to 0.
pub fn parse_calendar_html(html: &str) -> Result<Vec<SlotObservation>, ExtractError> {
    let day_selector = selector("div[id]")?;
    let schedule_selector = selector("dl.schedule")?;
    let count_selector = selector("dt")?;
    let area_selector = selector("dd")?;

    let document = Html::parse_document(html);
    let mut observations = Vec::new();

    for day in document.select(&day_selector) {
        let Some(id) = day.value().attr("id") else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(id, "%Y-%m-%d") else {
            continue;
        };

        for schedule in day.select(&schedule_selector) {
            let Some(count_node) = schedule.select(&count_selector).next() else {
                continue;
            };
            let Some(area_node) = schedule.select(&area_selector).next() else {
                continue;
            };
            let area = area_node.text().collect::<String>().trim().to_string();
            if area.is_empty() {
                continue;
            }
            let count_text = count_node.text().collect::<String>();
            observations.push(SlotObservation {
                area,
                date,
                available_count: parse_count(&count_text),
            });
        }
    }

    Ok(observations)
}

fn selector(rule: &str) -> Result<Selector, ExtractError> {
    Selector::parse(rule).map_err(|e| ExtractError::Selector(e.to_string()))
}

/// Leading decimal digits of the trimmed text; anything else is 0.
fn parse_count(text: &str) -> u32 {
    let digits: String = text
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}

/// Headless-Chromium calendar source. Launches a fresh browser per session;
/// the event handler runs on a background task for the session's lifetime.
#[derive(Debug, Clone, Default)]
pub struct BrowserCalendar {
    site: SiteConfig,
}

impl BrowserCalendar {
    pub fn new(site: SiteConfig) -> Self {
        Self { site }
    }
}

#[async_trait]
impl CalendarSource for BrowserCalendar {
    async fn open_session(&self) -> Result<Box<dyn CalendarSession>, ExtractError> {
        let session = BrowserSession::launch(self.site.clone()).await?;
        Ok(Box::new(session))
    }
}

pub struct BrowserSession {
    site: SiteConfig,
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl BrowserSession {
    pub async fn launch(site: SiteConfig) -> Result<Self, ExtractError> {
        let config = BrowserConfig::builder()
            .build()
            .map_err(ExtractError::Launch)?;

        let (browser, mut handler) = timeout(site.launch_timeout, Browser::launch(config))
            .await
            .map_err(|_| {
                ExtractError::Launch(format!("launch timed out after {:?}", site.launch_timeout))
            })?
            .map_err(|e| ExtractError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(error) = event {
                    debug!(%error, "browser event loop error");
                }
            }
        });

        debug!("browser session launched");
        Ok(Self {
            site,
            browser,
            handler_task,
        })
    }

    async fn render(&self, page: &Page) -> Result<String, ExtractError> {
        timeout(self.site.render_timeout, page.wait_for_navigation())
            .await
            .map_err(|_| ExtractError::RenderTimeout(self.site.render_timeout))?
            .map_err(|e| ExtractError::Navigation(e.to_string()))?;

        // Calendar cells are filled in by scripts after the load event.
        tokio::time::sleep(self.site.settle_delay).await;

        page.content()
            .await
            .map_err(|e| ExtractError::Navigation(e.to_string()))
    }
}

#[async_trait]
impl CalendarSession for BrowserSession {
    async fn fetch_month(&self, month: YearMonth) -> Result<Vec<SlotObservation>, ExtractError> {
        let url = self.site.month_url(month);
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| ExtractError::Navigation(e.to_string()))?;

        // The page is closed on every exit, including timeouts and render
        // errors, so retried fetches do not accumulate tabs.
        let rendered = timeout(self.site.month_timeout, self.render(&page)).await;
        if let Err(error) = page.close().await {
            debug!(%error, "failed to close page");
        }
        let html = rendered.map_err(|_| ExtractError::MonthTimeout(self.site.month_timeout))??;

        let observations = parse_calendar_html(&html)?;
        debug!(month = %month, entries = observations.len(), "extracted calendar month");
        Ok(observations)
    }

    async fn close(self: Box<Self>) {
        let Self {
            site: _,
            mut browser,
            handler_task,
        } = *self;

        match browser.close().await {
            Ok(_) => {
                let _ = browser.wait().await;
                debug!("browser closed");
            }
            Err(close_error) => {
                warn!(%close_error, "graceful browser shutdown failed, force killing process");
                match browser.kill().await {
                    Some(Ok(())) => warn!("browser process force killed"),
                    Some(Err(kill_error)) => {
                        error!(%kill_error, "failed to kill browser process");
                    }
                    None => error!("no browser process handle to kill"),
                }
            }
        }
        handler_task.abort();
    }
}

/// Fixture-backed calendar source for tests: months map directly to
/// pre-parsed observations or fixture HTML.
#[derive(Debug, Clone, Default)]
pub struct FixtureCalendar {
    months: BTreeMap<String, Vec<SlotObservation>>,
}

impl FixtureCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_month(mut self, month: YearMonth, observations: Vec<SlotObservation>) -> Self {
        self.months.insert(month.to_string(), observations);
        self
    }

    pub fn with_month_html(self, month: YearMonth, html: &str) -> Result<Self, ExtractError> {
        let observations = parse_calendar_html(html)?;
        Ok(self.with_month(month, observations))
    }
}

#[async_trait]
impl CalendarSource for FixtureCalendar {
    async fn open_session(&self) -> Result<Box<dyn CalendarSession>, ExtractError> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl CalendarSession for FixtureCalendar {
    async fn fetch_month(&self, month: YearMonth) -> Result<Vec<SlotObservation>, ExtractError> {
        self.months
            .get(&month.to_string())
            .cloned()
            .ok_or_else(|| ExtractError::FixtureMissing(month.to_string()))
    }

    async fn close(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALENDAR_FIXTURE: &str = r#"
        <html><body>
          <div id="calendar-root">
            <div id="2025-11-15" class="element">
              <div class="district">
                <dl class="schedule"><dt>3</dt><dd> A구역 </dd></dl>
                <dl class="schedule"><dt>0</dt><dd>B구역</dd></dl>
                <dl class="schedule"><dt>2</dt><dd>   </dd></dl>
              </div>
            </div>
            <div id="2025-11-16" class="element"></div>
            <div id="nav-header">
              <dl class="schedule"><dt>9</dt><dd>가짜구역</dd></dl>
            </div>
          </div>
        </body></html>
    "#;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn fixture_page_yields_one_tuple_per_schedule_entry() {
        let observations = parse_calendar_html(CALENDAR_FIXTURE).unwrap();
        assert_eq!(
            observations,
            vec![
                SlotObservation {
                    area: "A구역".to_string(),
                    date: date("2025-11-15"),
                    available_count: 3,
                },
                SlotObservation {
                    area: "B구역".to_string(),
                    date: date("2025-11-15"),
                    available_count: 0,
                },
            ]
        );
    }

    #[test]
    fn non_date_containers_and_blank_areas_are_skipped() {
        let observations = parse_calendar_html(CALENDAR_FIXTURE).unwrap();
        assert!(observations.iter().all(|o| o.area != "가짜구역"));
        assert!(observations.iter().all(|o| !o.area.trim().is_empty()));
    }

    #[test]
    fn non_numeric_count_parses_to_zero() {
        let html = r#"
            <div id="2025-12-01">
              <dl class="schedule"><dt>마감</dt><dd>C구역</dd></dl>
              <dl class="schedule"><dt> 12 </dt><dd>D구역</dd></dl>
            </div>
        "#;
        let observations = parse_calendar_html(html).unwrap();
        assert_eq!(observations[0].available_count, 0);
        assert_eq!(observations[1].available_count, 12);
    }

    #[test]
    fn schedule_entry_without_dt_or_dd_is_skipped() {
        let html = r#"
            <div id="2025-12-02">
              <dl class="schedule"><dd>E구역</dd></dl>
              <dl class="schedule"><dt>4</dt></dl>
              <dl class="schedule"><dt>1</dt><dd>F구역</dd></dl>
            </div>
        "#;
        let observations = parse_calendar_html(html).unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].area, "F구역");
    }

    #[test]
    fn month_url_carries_select_month_token() {
        let site = SiteConfig::default();
        let url = site.month_url(YearMonth {
            year: 2025,
            month: 11,
        });
        assert!(url.starts_with("https://mirihae.com/camping/calendar.do?"));
        assert!(url.ends_with("&selectMonth=2025-11"));
    }

    #[tokio::test]
    async fn fixture_source_serves_known_months_only() {
        let month = YearMonth {
            year: 2025,
            month: 11,
        };
        let source = FixtureCalendar::new()
            .with_month_html(month, CALENDAR_FIXTURE)
            .unwrap();
        let session = source.open_session().await.unwrap();
        assert_eq!(session.fetch_month(month).await.unwrap().len(), 2);
        let missing = session
            .fetch_month(YearMonth {
                year: 2026,
                month: 1,
            })
            .await;
        assert!(matches!(missing, Err(ExtractError::FixtureMissing(_))));
        session.close().await;
    }
}
