use crate::dashboard::DashboardState;
use crate::models::{SeriesProjection, UsageLevel};
use num_format::{Locale, ToFormattedString};
use std::fmt::Write as _;

pub const NO_DATA_MESSAGE: &str = "No usage recorded yet.";
pub const NEED_MORE_POINTS_MESSAGE: &str = "Need at least two days of usage to draw a trend.";

pub fn format_count(n: u64) -> String {
    n.to_formatted_string(&Locale::en)
}

pub fn level_badge(level: UsageLevel) -> String {
    format!("[{}]", level.label())
}

pub fn render_text(state: &DashboardState) -> String {
    let mut out = String::new();
    match state {
        DashboardState::Loading => out.push_str("Loading usage...\n"),
        DashboardState::Error { message, retryable } => {
            let _ = writeln!(out, "Error: {message}");
            if *retryable {
                out.push_str("The request can be retried.\n");
            }
        }
        DashboardState::Empty { window } => {
            let _ = writeln!(out, "{NO_DATA_MESSAGE} (window: {})", window.as_label());
        }
        DashboardState::Data(report) => {
            let s = &report.summary;
            let _ = writeln!(
                out,
                "Usage for {}  {}",
                report.window.as_label(),
                level_badge(report.level)
            );
            let _ = writeln!(out, "  Requests:       {:>14}", format_count(s.request_count));
            let _ = writeln!(out, "  Input tokens:   {:>14}", format_count(s.input_tokens));
            let _ = writeln!(out, "  Output tokens:  {:>14}", format_count(s.output_tokens));
            let _ = writeln!(out, "  Total tokens:   {:>14}", format_count(s.total_tokens));
            out.push('\n');

            match &report.chart {
                SeriesProjection::Series(series) => {
                    let _ = writeln!(
                        out,
                        "{} trend: {} points, peak {}",
                        report.series_kind.title(),
                        series.values.len(),
                        format_count(series.values.iter().copied().max().unwrap_or(0))
                    );
                }
                SeriesProjection::InsufficientData { .. } => {
                    let _ = writeln!(out, "{NEED_MORE_POINTS_MESSAGE}");
                }
            }
            out.push('\n');

            let _ = writeln!(
                out,
                "{:<12} {:>9} {:>14} {:>14} {:>14}",
                "date", "requests", "input", "output", "total"
            );
            for b in report.buckets.iter().rev() {
                let _ = writeln!(
                    out,
                    "{:<12} {:>9} {:>14} {:>14} {:>14}",
                    b.date.format("%Y-%m-%d"),
                    format_count(b.request_count),
                    format_count(b.input_tokens),
                    format_count(b.output_tokens),
                    format_count(b.total_tokens),
                );
            }
        }
    }
    out
}
