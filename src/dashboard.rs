use crate::analytics::{build_report, UsageReport};
use crate::error::AppError;
use crate::models::{TimeWindow, TokenSeriesKind, UsageSnapshot};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DashboardState {
    Loading,
    Error { message: String, retryable: bool },
    Empty { window: TimeWindow },
    Data(UsageReport),
}

impl DashboardState {
    pub fn from_error(err: &AppError) -> Self {
        DashboardState::Error {
            message: err.user_message(),
            retryable: err.is_retryable(),
        }
    }

    pub fn from_snapshot(
        snapshot: &UsageSnapshot,
        window: TimeWindow,
        kind: TokenSeriesKind,
        now: DateTime<Utc>,
    ) -> Self {
        if snapshot.logs.is_empty() {
            return DashboardState::Empty { window };
        }
        let report = build_report(&snapshot.logs, window, kind, now);
        if report.summary.request_count == 0 {
            return DashboardState::Empty { window };
        }
        DashboardState::Data(report)
    }
}
