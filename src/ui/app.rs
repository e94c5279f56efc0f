use crate::dashboard::DashboardState;
use crate::error::AppError;
use crate::models::{TimeWindow, TokenSeriesKind, UsageSnapshot};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Dashboard,
    ConfirmQuit,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub running: bool,
    pub window: TimeWindow,
    pub series: TokenSeriesKind,
    pub status: String,
    pub compact_mode: bool,
    pub screen: Screen,
    pub confirm_selected: usize,
    pub dashboard: DashboardState,
    pub snapshot: Option<UsageSnapshot>,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            running: true,
            window: TimeWindow::ThirtyDays,
            series: TokenSeriesKind::Total,
            status: "ready".into(),
            compact_mode: false,
            screen: Screen::Dashboard,
            confirm_selected: 0,
            dashboard: DashboardState::Loading,
            snapshot: None,
            last_refresh: None,
        }
    }
}

impl AppState {
    pub fn with_window(window: TimeWindow) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    fn derive(&mut self, now: DateTime<Utc>) {
        if let Some(snapshot) = &self.snapshot {
            self.dashboard = DashboardState::from_snapshot(snapshot, self.window, self.series, now);
        }
    }

    pub fn rederive(&mut self, now: DateTime<Utc>) {
        // Loading and error screens stay until the next fetch resolves.
        if matches!(
            self.dashboard,
            DashboardState::Data(_) | DashboardState::Empty { .. }
        ) {
            self.derive(now);
        }
    }

    pub fn set_window(&mut self, window: TimeWindow, now: DateTime<Utc>) {
        self.window = window;
        self.rederive(now);
        self.status = format!("window {}", window.as_label());
    }

    pub fn set_series(&mut self, series: TokenSeriesKind) {
        self.series = series;
        match &mut self.dashboard {
            DashboardState::Data(report) => {
                *report = report.clone().with_series(series);
            }
            DashboardState::Loading
            | DashboardState::Error { .. }
            | DashboardState::Empty { .. } => {}
        }
        self.status = format!("series {}", series.as_label());
    }

    pub fn apply_snapshot(&mut self, snapshot: UsageSnapshot, now: DateTime<Utc>) {
        self.last_refresh = Some(snapshot.fetched_at);
        self.snapshot = Some(snapshot);
        self.derive(now);
        self.status = "ok".into();
    }

    pub fn sign_out(&mut self) {
        self.snapshot = None;
        self.last_refresh = None;
        self.dashboard = DashboardState::from_error(&AppError::Unauthorized("signed out".into()));
        self.status = "signed out".into();
    }

    pub fn last_refresh_label(&self) -> String {
        self.last_refresh
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".into())
    }
}
