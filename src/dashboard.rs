//! Dashboard pipeline: fetch → normalize → filter → aggregate → render.
//!
//! One [`DashboardController`] owns one view's state. Clones share it, so a
//! timer task and user actions can drive the same dashboard; an in-flight
//! flag keeps at most one fetch running and a mutex serializes pipeline runs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::aggregate_by_month;
use crate::filter::{apply_filters, visible_users, AgeCohort, FilterEvent, FilterState, UserRoster};
use crate::models::{RawComment, UserProfile};
use crate::normalize::normalize;
use crate::remote::RecordSource;
use crate::render::{build_charts, ChartTarget, DashboardView};
use crate::viz_export::{ChartHandle, RenderSink, ViewStatus};

/// Everything one dashboard view owns.
#[derive(Debug)]
pub struct DashboardState {
    pub filter: FilterState,
    pub comments: Vec<RawComment>, // last good snapshot
    pub users: Vec<UserProfile>,
    pub charts: BTreeMap<ChartTarget, ChartHandle>,
    pub view: Option<DashboardView>,
    pub stale_reason: Option<String>,
    pub last_refreshed: Option<DateTime<Utc>>,
    known_years: BTreeSet<String>,
    follow_new_years: bool,
}

impl DashboardState {
    /// With no `initial_years`, the year selection follows the data: years
    /// are selected as snapshots reveal them, until the user deselects one.
    pub fn new(initial_years: Vec<String>) -> Self {
        let follow_new_years = initial_years.is_empty();
        Self {
            filter: FilterState::all(initial_years),
            comments: Vec::new(),
            users: Vec::new(),
            charts: BTreeMap::new(),
            view: None,
            stale_reason: None,
            last_refreshed: None,
            known_years: BTreeSet::new(),
            follow_new_years,
        }
    }

    /// Record the years of a fresh snapshot. While every known year is
    /// selected, newly seen years are selected too.
    pub fn track_years(&mut self, seen: BTreeSet<String>) {
        if !self.follow_new_years {
            return;
        }
        let fresh: Vec<String> = seen.difference(&self.known_years).cloned().collect();
        if fresh.is_empty() {
            return;
        }
        let all_selected = self
            .filter
            .selected_years()
            .eq(self.known_years.iter().map(String::as_str));
        if all_selected {
            debug!("Selecting newly seen years - years={:?}", fresh);
            for y in &fresh {
                if !self.filter.is_year_selected(y) {
                    self.filter.toggle_year(y);
                }
            }
        }
        self.known_years.extend(fresh);
    }

    pub fn status(&self) -> ViewStatus {
        ViewStatus {
            stale: self.stale_reason.is_some(),
            reason: self.stale_reason.clone(),
            refreshed_at: self.last_refreshed.map(|t| t.to_rfc3339()),
            records_in_view: self.view.as_ref().map_or(0, |v| v.records_in_view),
            filters: self.filter.describe(),
        }
    }
}

/// Years present in a snapshot, as filter keys.
pub fn years_in(comments: &[RawComment], tz: Tz) -> BTreeSet<String> {
    normalize(comments, tz)
        .records
        .iter()
        .map(|r| r.year.to_string())
        .collect()
}

/// The whole aggregation pipeline as a pure function of data and selection.
pub fn compute_view(
    comments: &[RawComment],
    users: &[UserProfile],
    filter: &FilterState,
    tz: Tz,
) -> DashboardView {
    let normalized = normalize(comments, tz);
    let roster = UserRoster::new(users);
    let selected = apply_filters(&normalized.records, filter, &roster);
    let aggregation = aggregate_by_month(&selected);

    let cohort_counts = AgeCohort::ALL
        .iter()
        .map(|&c| {
            let n = users
                .iter()
                .filter(|u| u.age.and_then(AgeCohort::for_age) == Some(c))
                .count();
            (c, n)
        })
        .collect();

    DashboardView {
        filter_summary: filter.describe(),
        aggregation,
        cohort_counts,
        total_users: users.len(),
        records_total: comments.len(),
        records_in_view: selected.len(),
        malformed: normalized.malformed.len(),
    }
}

/// Redraw every chart of `view`, releasing whatever occupied each target first.
pub fn render_view(
    state: &mut DashboardState,
    sink: &mut dyn RenderSink,
    view: &DashboardView,
) -> Result<()> {
    for spec in build_charts(view) {
        if let Some(previous) = state.charts.remove(&spec.target) {
            // a release consumes the handle even when it fails; the draw below
            // reports it if the target really is still held
            if let Err(e) = sink.release(previous) {
                warn!("Chart release failed - target={}, error={:#}", spec.target.slug(), e);
            }
        }
        let handle = sink.draw(&spec)?;
        state.charts.insert(spec.target, handle);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Rendered { records_in_view: usize, months: usize },
    /// Another refresh was still in flight.
    Skipped,
    /// Fetch failed; the previous render stays up.
    Stale { reason: String },
}

struct Shared {
    state: DashboardState,
    sink: Box<dyn RenderSink>,
}

struct Inner {
    source: Arc<dyn RecordSource>,
    tz: Tz,
    shared: Mutex<Shared>,
    in_flight: AtomicBool,
    pipeline_runs: AtomicU64,
}

/// Clears the in-flight flag when the refresh finishes or is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct DashboardController {
    inner: Arc<Inner>,
}

impl DashboardController {
    pub fn new(
        source: Arc<dyn RecordSource>,
        sink: Box<dyn RenderSink>,
        tz: Tz,
        initial_years: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                tz,
                shared: Mutex::new(Shared {
                    state: DashboardState::new(initial_years),
                    sink,
                }),
                in_flight: AtomicBool::new(false),
                pipeline_runs: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Number of aggregation pipelines run so far.
    pub fn pipeline_runs(&self) -> u64 {
        self.inner.pipeline_runs.load(Ordering::Acquire)
    }

    /// Fetch a fresh snapshot and re-render. Returns `Skipped` without
    /// fetching when another refresh is still running.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let Some(_guard) = InFlight::acquire(&self.inner.in_flight) else {
            debug!("Refresh skipped - previous refresh still in flight");
            return Ok(RefreshOutcome::Skipped);
        };

        let start = std::time::Instant::now();
        let source = &self.inner.source;
        let fetched = futures::future::try_join(source.fetch_comments(), source.fetch_users()).await;

        let mut shared = self.inner.shared.lock().await;
        let Shared { state, sink } = &mut *shared;

        let (comments, users) = match fetched {
            Ok(pair) => pair,
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    "Refresh failed, keeping last render - error={}, has_view={}",
                    reason,
                    state.view.is_some()
                );
                state.stale_reason = Some(reason.clone());
                sink.status(&state.status())?;
                return Ok(RefreshOutcome::Stale { reason });
            }
        };

        state.track_years(years_in(&comments, self.inner.tz));

        let fetched_comments = comments.len();
        let fetched_users = users.len();
        state.comments = comments;
        state.users = users;
        state.stale_reason = None;
        state.last_refreshed = Some(Utc::now());

        let view = self.run_pipeline(state, sink.as_mut())?;
        info!(
            "Refresh completed - duration={:.2}s, comments={}, users={}, in_view={}, months={}",
            start.elapsed().as_secs_f32(),
            fetched_comments,
            fetched_users,
            view.records_in_view,
            view.aggregation.monthly.len()
        );
        Ok(RefreshOutcome::Rendered {
            records_in_view: view.records_in_view,
            months: view.aggregation.monthly.len(),
        })
    }

    fn run_pipeline(&self, state: &mut DashboardState, sink: &mut dyn RenderSink) -> Result<DashboardView> {
        let view = compute_view(&state.comments, &state.users, &state.filter, self.inner.tz);
        self.inner.pipeline_runs.fetch_add(1, Ordering::AcqRel);
        render_view(state, sink, &view)?;
        state.view = Some(view.clone());
        sink.status(&state.status())?;
        Ok(view)
    }

    /// Apply one filter change and re-render from the cached snapshot.
    pub async fn apply(&self, event: FilterEvent) -> Result<DashboardView> {
        let mut shared = self.inner.shared.lock().await;
        let Shared { state, sink } = &mut *shared;
        state.filter.apply(&event);
        info!("Filter changed - event={:?}, now={}", event, state.filter.describe());
        self.run_pipeline(state, sink.as_mut())
    }

    pub async fn filter(&self) -> FilterState {
        self.inner.shared.lock().await.state.filter.clone()
    }

    pub async fn view(&self) -> Option<DashboardView> {
        self.inner.shared.lock().await.state.view.clone()
    }

    pub async fn status(&self) -> ViewStatus {
        self.inner.shared.lock().await.state.status()
    }

    /// Chat history of one user from the cached snapshot.
    pub async fn history(&self, email: &str) -> Vec<RawComment> {
        let shared = self.inner.shared.lock().await;
        shared
            .state
            .comments
            .iter()
            .filter(|c| c.user == email)
            .cloned()
            .collect()
    }

    /// Users table rows under the current cohort selection.
    pub async fn visible_users(&self) -> Vec<UserProfile> {
        let shared = self.inner.shared.lock().await;
        visible_users(&shared.state.users, &shared.state.filter)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Release every chart and drop cached data (the view is going away).
    pub async fn close(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock().await;
        let Shared { state, sink } = &mut *shared;
        let handles = std::mem::take(&mut state.charts);
        for (_, handle) in handles {
            sink.release(handle)?;
        }
        state.comments.clear();
        state.users.clear();
        state.view = None;
        info!("Dashboard closed");
        Ok(())
    }
}

/// Re-run [`DashboardController::refresh`] every `every` until `cancel` fires.
///
/// The first tick is consumed immediately, so callers do their own initial
/// load. Ticks that land while a refresh is running are skipped.
pub fn spawn_auto_refresh(
    controller: DashboardController,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        info!("Auto-refresh started - interval={:.1}s", every.as_secs_f32());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if controller.is_refreshing() {
                        debug!("Auto-refresh tick skipped - refresh in flight");
                        continue;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = controller.refresh() => match res {
                            Ok(RefreshOutcome::Stale { reason }) => {
                                warn!("Auto-refresh served stale data - reason={}", reason)
                            }
                            Ok(outcome) => debug!("Auto-refresh tick - outcome={:?}", outcome),
                            Err(e) => warn!("Auto-refresh render failed - error={:#}", e),
                        },
                    }
                }
            }
        }
        info!("Auto-refresh stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SentimentLabel;
    use crate::remote::RemoteError;
    use crate::viz_export::MemorySink;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn comment(user: &str, label: &str, ts: &str) -> RawComment {
        RawComment {
            user: user.into(),
            prompt: "p".into(),
            answer: "a".into(),
            sentiment_label: Some(label.into()),
            timestamp: Some(ts.into()),
        }
    }

    fn users() -> Vec<UserProfile> {
        vec![
            UserProfile { email: "ana@gmail.com".into(), name: None, age: Some(23.0) },
            UserProfile { email: "luis@gmail.com".into(), name: None, age: Some(47.0) },
        ]
    }

    fn comments() -> Vec<RawComment> {
        vec![
            comment("ana@gmail.com", "positivo", "2024-03-01"),
            comment("luis@gmail.com", "neutro", "2024-03-15"),
            comment("ana@gmail.com", "malo", "2023-04-01"),
            comment("luis@gmail.com", "positivo", "not-a-date"),
        ]
    }

    struct ScriptedSource {
        fail_after: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecordSource for ScriptedSource {
        async fn fetch_comments(&self) -> Result<Vec<RawComment>, RemoteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_after {
                return Err(RemoteError::Http {
                    url: "comments".into(),
                    message: "connection refused".into(),
                });
            }
            Ok(comments())
        }

        async fn fetch_users(&self) -> Result<Vec<UserProfile>, RemoteError> {
            Ok(users())
        }
    }

    fn controller(fail_after: usize) -> (DashboardController, MemorySink) {
        let sink = MemorySink::new();
        let source = Arc::new(ScriptedSource { fail_after, calls: AtomicUsize::new(0) });
        let c = DashboardController::new(source, Box::new(sink.clone()), Tz::UTC, vec![]);
        (c, sink)
    }

    #[test]
    fn compute_view_is_pure() {
        let f = FilterState::all(["2023", "2024"]);
        let a = compute_view(&comments(), &users(), &f, Tz::UTC);
        let b = compute_view(&comments(), &users(), &f, Tz::UTC);
        assert_eq!(a, b);
        assert_eq!(a.records_total, 4);
        assert_eq!(a.malformed, 1);
        assert_eq!(a.records_in_view, 3);
        assert_eq!(a.cohort_counts[0], (AgeCohort::From18To25, 1));
        assert_eq!(a.cohort_counts[3], (AgeCohort::From46To60, 1));
    }

    #[tokio::test]
    async fn first_refresh_seeds_years_from_data() {
        let (c, sink) = controller(usize::MAX);
        let outcome = c.refresh().await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Rendered { records_in_view: 3, months: 2 });

        let years: Vec<String> = c.filter().await.selected_years().map(String::from).collect();
        assert_eq!(years, vec!["2023", "2024"]);
        sink.inspect(|s| {
            assert_eq!(s.live.len(), ChartTarget::ALL.len());
            assert_eq!(s.releases, 0);
        });
    }

    #[tokio::test]
    async fn transport_failure_keeps_last_render() {
        let (c, sink) = controller(1);
        c.refresh().await.unwrap();
        let before = c.view().await;

        let outcome = c.refresh().await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Stale { .. }));
        assert_eq!(c.view().await, before);
        assert!(c.status().await.stale);

        sink.inspect(|s| {
            assert_eq!(s.live.len(), ChartTarget::ALL.len());
            assert_eq!(s.draws, ChartTarget::ALL.len());
            assert!(s.statuses.last().unwrap().stale);
        });
    }

    #[tokio::test]
    async fn each_filter_event_runs_one_pipeline() {
        let (c, sink) = controller(usize::MAX);
        c.refresh().await.unwrap();
        assert_eq!(c.pipeline_runs(), 1);

        let view = c
            .apply(FilterEvent::ToggleSentiment(SentimentLabel::Positive))
            .await
            .unwrap();
        assert_eq!(c.pipeline_runs(), 2);
        assert_eq!(view.aggregation.sentiment_counts.positive, 1);
        assert_eq!(view.aggregation.sentiment_counts.total(), 1);

        c.apply(FilterEvent::ToggleYear("2024".into())).await.unwrap();
        assert_eq!(c.pipeline_runs(), 3);

        sink.inspect(|s| {
            assert_eq!(s.live.len(), ChartTarget::ALL.len());
            assert_eq!(s.releases, 2 * ChartTarget::ALL.len());
        });
    }

    #[tokio::test]
    async fn history_and_users_table_follow_snapshot() {
        let (c, _sink) = controller(usize::MAX);
        c.refresh().await.unwrap();
        assert_eq!(c.history("ana@gmail.com").await.len(), 2);
        assert!(c.history("nobody@gmail.com").await.is_empty());

        c.apply(FilterEvent::ToggleCohort(AgeCohort::From46To60)).await.unwrap();
        let emails: Vec<String> = c.visible_users().await.into_iter().map(|u| u.email).collect();
        assert_eq!(emails, vec!["ana@gmail.com"]);
    }

    /// Memory sink whose next release frees the target but reports an error.
    struct FlakyReleaseSink {
        inner: MemorySink,
        fail_next_release: bool,
    }

    impl RenderSink for FlakyReleaseSink {
        fn draw(&mut self, spec: &crate::render::ChartSpec) -> Result<ChartHandle> {
            self.inner.draw(spec)
        }

        fn release(&mut self, handle: ChartHandle) -> Result<()> {
            self.inner.release(handle)?;
            if std::mem::take(&mut self.fail_next_release) {
                anyhow::bail!("disk full");
            }
            Ok(())
        }

        fn status(&mut self, status: &ViewStatus) -> Result<()> {
            self.inner.status(status)
        }
    }

    #[tokio::test]
    async fn release_error_does_not_break_the_next_render() {
        let inner = MemorySink::new();
        let sink = FlakyReleaseSink { inner: inner.clone(), fail_next_release: true };
        let source = Arc::new(ScriptedSource { fail_after: usize::MAX, calls: AtomicUsize::new(0) });
        let c = DashboardController::new(source, Box::new(sink), Tz::UTC, vec![]);

        c.refresh().await.unwrap();
        let second = c.refresh().await.unwrap();
        assert!(matches!(second, RefreshOutcome::Rendered { .. }));
        inner.inspect(|s| {
            assert_eq!(s.live.len(), ChartTarget::ALL.len());
            assert_eq!(s.draws, 2 * ChartTarget::ALL.len());
        });
    }

    #[test]
    fn new_years_join_an_untouched_selection_only() {
        let years = |ys: &[&str]| ys.iter().map(|y| y.to_string()).collect::<BTreeSet<_>>();
        let selected = |s: &DashboardState| {
            s.filter.selected_years().map(String::from).collect::<Vec<_>>()
        };

        let mut state = DashboardState::new(vec![]);
        state.track_years(years(&["2024"]));
        assert_eq!(selected(&state), vec!["2024"]);

        // New Year on a long-running dashboard
        state.track_years(years(&["2024", "2025"]));
        assert_eq!(selected(&state), vec!["2024", "2025"]);

        state.filter.toggle_year("2024");
        state.track_years(years(&["2024", "2025", "2026"]));
        assert_eq!(selected(&state), vec!["2025"]);

        let mut configured = DashboardState::new(vec!["2024".into()]);
        configured.track_years(years(&["2023", "2024"]));
        assert_eq!(selected(&configured), vec!["2024"]);
    }

    #[tokio::test]
    async fn close_releases_every_chart() {
        let (c, sink) = controller(usize::MAX);
        c.refresh().await.unwrap();
        c.close().await.unwrap();
        sink.inspect(|s| {
            assert!(s.live.is_empty());
            assert_eq!(s.releases, ChartTarget::ALL.len());
        });
        assert!(c.history("ana@gmail.com").await.is_empty());
    }
}
