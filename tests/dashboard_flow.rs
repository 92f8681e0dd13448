use async_trait::async_trait;
use chrono_tz::Tz;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use survey_pulse::render::ChartTarget;
use survey_pulse::viz_export::MemorySink;
use survey_pulse::{
    spawn_auto_refresh, AgeCohort, DashboardController, FilterEvent, RawComment, RecordSource,
    RefreshOutcome, RemoteError, UserProfile,
};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

fn comment(user: &str, label: &str, ts: &str) -> RawComment {
    RawComment {
        user: user.into(),
        prompt: "¿Calidad?".into(),
        answer: "respuesta".into(),
        sentiment_label: Some(label.into()),
        timestamp: Some(ts.into()),
    }
}

fn snapshot() -> (Vec<RawComment>, Vec<UserProfile>) {
    let comments = vec![
        comment("ana@gmail.com", "positivo", "2024-03-01T09:00:00Z"),
        comment("ana@gmail.com", "neutro", "2024-03-20T09:00:00Z"),
        comment("luis@hotmail.com", "negativo", "2024-04-02T09:00:00Z"),
        comment("eva@outlook.com", "positivo", "2023-12-24T09:00:00Z"),
    ];
    let users = vec![
        UserProfile { email: "ana@gmail.com".into(), name: Some("Ana".into()), age: Some(22.0) },
        UserProfile { email: "luis@hotmail.com".into(), name: None, age: Some(38.0) },
        UserProfile { email: "eva@outlook.com".into(), name: None, age: Some(65.0) },
    ];
    (comments, users)
}

/// Source whose comment fetch waits for a permit, so a test can hold a
/// refresh in flight.
struct GatedSource {
    gate: Semaphore,
    started: Notify,
    fetches: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
}

impl GatedSource {
    fn new(permits: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(permits),
            started: Notify::new(),
            fetches: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay,
            failing: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl RecordSource for GatedSource {
    async fn fetch_comments(&self) -> Result<Vec<RawComment>, RemoteError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();

        let permit = self.gate.acquire().await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        permit
            .map_err(|e| RemoteError::Http { url: "comments".into(), message: e.to_string() })?
            .forget();

        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Http {
                url: "comments".into(),
                message: "connection reset".into(),
            });
        }
        Ok(snapshot().0)
    }

    async fn fetch_users(&self) -> Result<Vec<UserProfile>, RemoteError> {
        Ok(snapshot().1)
    }
}

fn dashboard(source: Arc<GatedSource>, years: Vec<String>) -> (DashboardController, MemorySink) {
    let sink = MemorySink::new();
    let controller = DashboardController::new(source, Box::new(sink.clone()), Tz::UTC, years);
    (controller, sink)
}

#[tokio::test]
async fn overlapping_refresh_is_skipped() {
    let source = GatedSource::new(0, Duration::ZERO);
    let (controller, sink) = dashboard(source.clone(), vec![]);

    let background = controller.clone();
    let first = tokio::spawn(async move { background.refresh().await });
    source.started.notified().await;
    assert!(controller.is_refreshing());

    let second = controller.refresh().await.unwrap();
    assert_eq!(second, RefreshOutcome::Skipped);

    source.gate.add_permits(1);
    let first = first.await.unwrap().unwrap();
    assert_eq!(first, RefreshOutcome::Rendered { records_in_view: 4, months: 3 });

    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(controller.pipeline_runs(), 1);
    assert!(!controller.is_refreshing());
    sink.inspect(|s| {
        assert_eq!(s.draws, ChartTarget::ALL.len());
        assert_eq!(s.live.len(), ChartTarget::ALL.len());
    });

    // the next refresh replaces every chart instead of stacking new ones
    source.gate.add_permits(1);
    controller.refresh().await.unwrap();
    sink.inspect(|s| {
        assert_eq!(s.draws, 2 * ChartTarget::ALL.len());
        assert_eq!(s.releases, ChartTarget::ALL.len());
        assert_eq!(s.live.len(), ChartTarget::ALL.len());
    });
}

#[tokio::test]
async fn failure_before_first_load_renders_nothing() {
    let source = GatedSource::new(10, Duration::ZERO);
    source.failing.store(true, Ordering::SeqCst);
    let (controller, sink) = dashboard(source.clone(), vec![]);

    let outcome = controller.refresh().await.unwrap();
    assert!(matches!(outcome, RefreshOutcome::Stale { ref reason } if reason.contains("connection reset")));
    assert_eq!(controller.view().await, None);
    assert_eq!(controller.pipeline_runs(), 0);

    source.failing.store(false, Ordering::SeqCst);
    controller.refresh().await.unwrap();
    assert!(!controller.status().await.stale);
    sink.inspect(|s| {
        assert_eq!(s.live.len(), ChartTarget::ALL.len());
        assert!(s.statuses.first().unwrap().stale);
        assert!(!s.statuses.last().unwrap().stale);
    });
}

#[tokio::test]
async fn configured_years_limit_the_first_view() {
    let source = GatedSource::new(10, Duration::ZERO);
    let (controller, _sink) = dashboard(source, vec!["2024".into()]);

    let outcome = controller.refresh().await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Rendered { records_in_view: 3, months: 2 });

    let view = controller.apply(FilterEvent::ToggleYear("2023".into())).await.unwrap();
    assert_eq!(view.records_in_view, 4);
    let months: Vec<&str> = view.aggregation.monthly.iter().map(|b| b.month()).collect();
    assert_eq!(months, vec!["2024-March", "2024-April", "2023-December"]);
}

#[tokio::test]
async fn toggling_twice_restores_the_view() {
    let source = GatedSource::new(10, Duration::ZERO);
    let (controller, _sink) = dashboard(source.clone(), vec![]);
    controller.refresh().await.unwrap();
    let original = controller.view().await.unwrap();

    let narrowed = controller
        .apply(FilterEvent::ToggleCohort(AgeCohort::From18To25))
        .await
        .unwrap();
    assert_eq!(narrowed.records_in_view, 2);

    let restored = controller
        .apply(FilterEvent::ToggleCohort(AgeCohort::From18To25))
        .await
        .unwrap();
    assert_eq!(restored, original);
    assert_eq!(controller.pipeline_runs(), 3);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1, "filters never refetch");
}

#[tokio::test]
async fn auto_refresh_never_overlaps_and_stops_on_cancel() {
    let source = GatedSource::new(1_000, Duration::from_millis(40));
    let (controller, _sink) = dashboard(source.clone(), vec![]);
    controller.refresh().await.unwrap();

    let cancel = CancellationToken::new();
    let task = spawn_auto_refresh(controller.clone(), Duration::from_millis(10), cancel.clone());

    // manual refreshes racing the timer
    for _ in 0..5 {
        let _ = controller.refresh().await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("auto-refresh task should stop")
        .unwrap();

    assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
    let runs = controller.pipeline_runs();
    assert!(runs >= 2, "expected several refreshes, got {runs}");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(controller.pipeline_runs(), runs);
}
